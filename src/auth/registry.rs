// src/auth/registry.rs
//! Authorized-client registry.
//!
//! The registry keeps the set of client identities allowed to authenticate.
//! Reads go against an immutable snapshot behind an `Arc`; mutations are
//! serialized by a single writer lock, persisted (backup rotation, then an
//! atomic replace of the primary file) and only then published as the new
//! snapshot.
//!
//! Startup recovery prefers the primary file, falls back to the newest valid
//! backup, and reports every deviation in the returned [`LoadReport`].

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::auth::backup;
use crate::auth::revocation::{self, RevocationRecord};
use crate::config::constants::{
    BACKUP_DIR, REGISTRY_FILE, REGISTRY_FORMAT_VERSION, REVOCATION_CHANNEL_CAPACITY, REVOKED_DIR,
};
use crate::crypto::keys::decode_public_key;
use crate::utils::logging::log_security_event;
use crate::utils::security::StringValidator;

/// Error type for registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Client not found: {0}")]
    NotFound(String),

    #[error("Client already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid client identity: {0}")]
    InvalidIdentity(String),

    #[error("Registry at {path} is corrupt and no valid backup exists: {reason}")]
    Unrecoverable { path: PathBuf, reason: String },

    #[error("Registry is temporarily unavailable")]
    Unavailable,
}

/// An authorized client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    /// Stable unique identifier
    pub client_id: String,
    /// Base64 Ed25519 public key
    pub public_key: String,
    /// When the identity was registered
    pub added_at: DateTime<Utc>,
    /// Optional operator label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Set once the identity has been revoked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ClientIdentity {
    pub fn new(client_id: impl Into<String>, public_key: impl Into<String>, label: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            public_key: public_key.into(),
            added_at: Utc::now(),
            label,
            revoked_at: None,
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if !StringValidator::is_valid_client_id(&self.client_id) {
            return Err(RegistryError::InvalidIdentity(format!(
                "client id '{}' must be 1-128 characters of [A-Za-z0-9_.@-]",
                StringValidator::sanitize_log(&self.client_id)
            )));
        }
        decode_public_key(&self.public_key)
            .map_err(|e| RegistryError::InvalidIdentity(format!("public key: {}", e)))?;
        Ok(())
    }
}

/// On-disk shape of the primary registry file
#[derive(Debug, Serialize, Deserialize)]
struct RegistryDocument {
    version: u32,
    updated_at: DateTime<Utc>,
    clients: Vec<ClientIdentity>,
}

/// Immutable view of the registry used by readers
#[derive(Debug, Clone, Default)]
struct RegistrySnapshot {
    clients: HashMap<String, ClientIdentity>,
    revocations: HashMap<String, RevocationRecord>,
}

impl RegistrySnapshot {
    fn to_document(&self) -> RegistryDocument {
        let mut clients: Vec<ClientIdentity> = self.clients.values().cloned().collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        RegistryDocument {
            version: REGISTRY_FORMAT_VERSION,
            updated_at: Utc::now(),
            clients,
        }
    }

    /// Record a revocation, flagging the identity if present.
    /// Returns false when the client was already known to be revoked.
    fn apply_revocation(&mut self, record: &RevocationRecord) -> bool {
        if self.revocations.contains_key(&record.client_id) {
            return false;
        }
        if let Some(identity) = self.clients.get_mut(&record.client_id) {
            if identity.revoked_at.is_none() {
                identity.revoked_at = Some(record.revoked_at);
            }
        }
        self.revocations.insert(record.client_id.clone(), record.clone());
        true
    }
}

/// Where the registry was loaded from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    /// The primary file was intact
    Primary,
    /// The primary was missing or corrupt; recovered from this backup
    Backup(PathBuf),
    /// Nothing on disk yet; started empty
    Fresh,
}

/// Outcome of loading the registry from disk
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub source: LoadSource,
    /// Human-readable warnings the operator should see
    pub warnings: Vec<String>,
    pub clients: usize,
    pub revocations: usize,
}

impl LoadReport {
    /// True when the primary file could not be used as-is
    pub fn recovered(&self) -> bool {
        matches!(self.source, LoadSource::Backup(_))
    }
}

/// Filesystem layout under the data directory
#[derive(Debug, Clone)]
pub struct RegistryPaths {
    pub data_dir: PathBuf,
    pub primary: PathBuf,
    pub backups: PathBuf,
    pub revoked: PathBuf,
}

impl RegistryPaths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            primary: data_dir.join(REGISTRY_FILE),
            backups: data_dir.join(BACKUP_DIR),
            revoked: data_dir.join(REVOKED_DIR),
        }
    }

    fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(&self.backups)?;
        fs::create_dir_all(&self.revoked)?;
        Ok(())
    }
}

/// Persisted store of authorized client identities
#[derive(Debug)]
pub struct ClientRegistry {
    paths: RegistryPaths,
    max_backups: usize,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    /// Serializes add/revoke/refresh/reload
    writer: Mutex<()>,
    available: AtomicBool,
    events: broadcast::Sender<RevocationRecord>,
}

impl ClientRegistry {
    /// Open the registry in `data_dir`, recovering from backups if needed.
    pub fn open(data_dir: impl AsRef<Path>, max_backups: usize) -> Result<(Self, LoadReport), RegistryError> {
        let paths = RegistryPaths::new(data_dir.as_ref());
        let (snapshot, report) = load_snapshot(&paths, max_backups)?;
        let (events, _) = broadcast::channel(REVOCATION_CHANNEL_CAPACITY);

        info!(
            clients = report.clients,
            revocations = report.revocations,
            source = ?report.source,
            "Client registry loaded from {}",
            paths.data_dir.display()
        );

        Ok((
            Self {
                paths,
                max_backups,
                snapshot: RwLock::new(Arc::new(snapshot)),
                writer: Mutex::new(()),
                available: AtomicBool::new(true),
                events,
            },
            report,
        ))
    }

    fn current(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().clone()
    }

    fn publish(&self, snapshot: RegistrySnapshot) {
        *self.snapshot.write() = Arc::new(snapshot);
    }

    /// Filesystem layout in use
    pub fn paths(&self) -> &RegistryPaths {
        &self.paths
    }

    /// Look up an identity, revoked or not
    pub fn lookup(&self, client_id: &str) -> Result<ClientIdentity, RegistryError> {
        self.current()
            .clients
            .get(client_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(client_id.to_string()))
    }

    /// Whether a revocation exists for `client_id`
    pub fn is_revoked(&self, client_id: &str) -> bool {
        let snapshot = self.current();
        snapshot.revocations.contains_key(client_id)
            || snapshot.clients.get(client_id).map_or(false, |c| c.is_revoked())
    }

    /// All identities sorted by client id
    pub fn list(&self) -> Vec<ClientIdentity> {
        let mut clients: Vec<ClientIdentity> = self.current().clients.values().cloned().collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }

    /// All known revocation records, oldest first
    pub fn revocations(&self) -> Vec<RevocationRecord> {
        let mut records: Vec<RevocationRecord> = self.current().revocations.values().cloned().collect();
        records.sort_by(|a, b| a.revoked_at.cmp(&b.revoked_at));
        records
    }

    pub fn len(&self) -> usize {
        self.current().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// False while a reload is in progress
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Receive every revocation committed or discovered from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RevocationRecord> {
        self.events.subscribe()
    }

    /// Register a new identity. Revoked ids can never be re-added.
    pub async fn add(&self, identity: ClientIdentity) -> Result<(), RegistryError> {
        identity.validate()?;

        let _guard = self.writer.lock().await;
        let current = self.current();

        if current.clients.contains_key(&identity.client_id)
            || current.revocations.contains_key(&identity.client_id)
        {
            return Err(RegistryError::AlreadyExists(identity.client_id));
        }

        let mut next = (*current).clone();
        let client_id = identity.client_id.clone();
        next.clients.insert(client_id.clone(), identity);

        self.persist(&next)?;
        self.publish(next);

        info!(client_id = %client_id, "Client added to registry");
        Ok(())
    }

    /// Revoke an identity. The revocation record is written first and is the
    /// commit point; revoking an already revoked client returns its existing
    /// record.
    pub async fn revoke(&self, client_id: &str, reason: &str) -> Result<RevocationRecord, RegistryError> {
        let _guard = self.writer.lock().await;
        let current = self.current();

        if !current.clients.contains_key(client_id) {
            return Err(RegistryError::NotFound(client_id.to_string()));
        }
        if let Some(existing) = current.revocations.get(client_id) {
            debug!(client_id, "Client already revoked");
            return Ok(existing.clone());
        }

        let record = RevocationRecord::new(client_id, reason);
        revocation::write_record(&self.paths.revoked, &record)?;

        let mut next = (*current).clone();
        next.apply_revocation(&record);

        if let Err(e) = self.persist(&next) {
            // The record on disk is authoritative and reconciles on next load
            warn!(client_id, error = %e, "Revocation recorded but registry file not rewritten");
        }
        self.publish(next);

        log_security_event(
            "CLIENT_REVOKED",
            &format!("client '{}' revoked: {}", client_id, StringValidator::sanitize_log(reason)),
        );
        let _ = self.events.send(record.clone());

        Ok(record)
    }

    /// Pick up revocations written by another process. Newly seen records are
    /// applied in memory and published to subscribers.
    pub async fn refresh_revocations(&self) -> Result<Vec<RevocationRecord>, RegistryError> {
        let records = revocation::load_records(&self.paths.revoked)?;

        let _guard = self.writer.lock().await;
        let current = self.current();

        let fresh: Vec<RevocationRecord> = records
            .into_iter()
            .filter(|r| !current.revocations.contains_key(&r.client_id))
            .collect();
        if fresh.is_empty() {
            return Ok(fresh);
        }

        let mut next = (*current).clone();
        let mut applied = Vec::with_capacity(fresh.len());
        for record in fresh {
            if next.apply_revocation(&record) {
                applied.push(record);
            }
        }
        self.publish(next);

        for record in &applied {
            log_security_event(
                "CLIENT_REVOKED",
                &format!("client '{}' revoked out of process: {}", record.client_id, record.reason),
            );
            let _ = self.events.send(record.clone());
        }

        Ok(applied)
    }

    /// Reload everything from disk. New authentications are refused while the
    /// reload runs; on failure the previous snapshot stays in effect.
    pub async fn reload(&self) -> Result<LoadReport, RegistryError> {
        let _guard = self.writer.lock().await;
        self.available.store(false, Ordering::Release);

        let result = load_snapshot(&self.paths, self.max_backups);
        let outcome = match result {
            Ok((snapshot, report)) => {
                let previous = self.current();
                let newly_revoked: Vec<RevocationRecord> = snapshot
                    .revocations
                    .values()
                    .filter(|r| !previous.revocations.contains_key(&r.client_id))
                    .cloned()
                    .collect();

                self.publish(snapshot);
                for record in newly_revoked {
                    let _ = self.events.send(record);
                }
                info!(clients = report.clients, source = ?report.source, "Client registry reloaded");
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Registry reload failed; keeping previous state");
                Err(e)
            }
        };

        self.available.store(true, Ordering::Release);
        outcome
    }

    /// Rotate a backup of the current primary, then atomically replace it.
    fn persist(&self, snapshot: &RegistrySnapshot) -> Result<(), RegistryError> {
        backup::rotate_backup(&self.paths.primary, &self.paths.backups, self.max_backups)?;
        write_document(&self.paths.primary, &snapshot.to_document())
    }
}

/// Atomically replace `path` with the serialized document.
fn write_document(path: &Path, document: &RegistryDocument) -> Result<(), RegistryError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let json = serde_json::to_vec_pretty(document)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| RegistryError::Io(e.error))?;

    debug!(path = %path.display(), clients = document.clients.len(), "Registry file written");
    Ok(())
}

fn read_document(path: &Path) -> Result<RegistryDocument, String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    let document: RegistryDocument = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
    if document.version > REGISTRY_FORMAT_VERSION {
        return Err(format!("unsupported format version {}", document.version));
    }
    Ok(document)
}

/// Newest backup that parses, if any
fn newest_valid_backup(paths: &RegistryPaths, warnings: &mut Vec<String>) -> io::Result<Option<(PathBuf, RegistryDocument)>> {
    for path in backup::list_backups(&paths.backups)?.into_iter().rev() {
        match read_document(&path) {
            Ok(document) => return Ok(Some((path, document))),
            Err(e) => warnings.push(format!("backup {} is unreadable: {}", path.display(), e)),
        }
    }
    Ok(None)
}

fn preserve_corrupt(primary: &Path) -> io::Result<PathBuf> {
    let mut name = primary.as_os_str().to_os_string();
    name.push(format!(".corrupt-{}", Utc::now().timestamp_millis()));
    let target = PathBuf::from(name);
    fs::rename(primary, &target)?;
    Ok(target)
}

fn load_snapshot(paths: &RegistryPaths, max_backups: usize) -> Result<(RegistrySnapshot, LoadReport), RegistryError> {
    paths.ensure_dirs()?;

    let mut warnings = Vec::new();
    let mut rewrite = false;

    let (document, source) = if paths.primary.exists() {
        match read_document(&paths.primary) {
            Ok(document) => (document, LoadSource::Primary),
            Err(reason) => {
                warnings.push(format!("primary registry {} is corrupt: {}", paths.primary.display(), reason));
                let (backup_path, document) = newest_valid_backup(paths, &mut warnings)?.ok_or_else(|| {
                    RegistryError::Unrecoverable {
                        path: paths.primary.clone(),
                        reason: reason.clone(),
                    }
                })?;
                let preserved = preserve_corrupt(&paths.primary)?;
                warnings.push(format!("corrupt primary preserved as {}", preserved.display()));
                warnings.push(format!("recovered registry from backup {}", backup_path.display()));
                rewrite = true;
                (document, LoadSource::Backup(backup_path))
            }
        }
    } else if backup::list_backups(&paths.backups)?.is_empty() {
        rewrite = true;
        (
            RegistryDocument {
                version: REGISTRY_FORMAT_VERSION,
                updated_at: Utc::now(),
                clients: Vec::new(),
            },
            LoadSource::Fresh,
        )
    } else {
        warnings.push(format!("primary registry {} is missing", paths.primary.display()));
        let (backup_path, document) =
            newest_valid_backup(paths, &mut warnings)?.ok_or_else(|| RegistryError::Unrecoverable {
                path: paths.primary.clone(),
                reason: "primary missing and no backup is readable".to_string(),
            })?;
        warnings.push(format!("recovered registry from backup {}", backup_path.display()));
        rewrite = true;
        (document, LoadSource::Backup(backup_path))
    };

    let mut snapshot = RegistrySnapshot::default();
    for identity in document.clients {
        if snapshot.clients.contains_key(&identity.client_id) {
            warnings.push(format!("duplicate client '{}' ignored", identity.client_id));
            continue;
        }
        snapshot.clients.insert(identity.client_id.clone(), identity);
    }

    for record in revocation::load_records(&paths.revoked)? {
        let unflagged = snapshot
            .clients
            .get(&record.client_id)
            .map_or(false, |c| c.revoked_at.is_none());
        if snapshot.apply_revocation(&record) && unflagged {
            warnings.push(format!("reconciled revocation of '{}' from revocation record", record.client_id));
            rewrite = true;
        }
    }

    if rewrite {
        if !matches!(source, LoadSource::Fresh) {
            backup::rotate_backup(&paths.primary, &paths.backups, max_backups)?;
        }
        write_document(&paths.primary, &snapshot.to_document())?;
    }

    for warning in &warnings {
        warn!("{}", warning);
    }

    let report = LoadReport {
        source,
        warnings,
        clients: snapshot.clients.len(),
        revocations: snapshot.revocations.len(),
    };
    Ok((snapshot, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::ClientKeypair;
    use tempfile::TempDir;

    fn identity(id: &str) -> ClientIdentity {
        let keypair = ClientKeypair::generate().unwrap();
        ClientIdentity::new(id, keypair.public_key_base64(), None)
    }

    fn open(dir: &Path) -> (ClientRegistry, LoadReport) {
        ClientRegistry::open(dir, 3).unwrap()
    }

    #[tokio::test]
    async fn test_fresh_registry() {
        let tmp = TempDir::new().unwrap();
        let (registry, report) = open(tmp.path());

        assert_eq!(report.source, LoadSource::Fresh);
        assert!(report.warnings.is_empty());
        assert!(registry.is_empty());
        assert!(registry.paths().primary.exists());
        assert!(registry.is_available());
    }

    #[tokio::test]
    async fn test_add_lookup_and_duplicate() {
        let tmp = TempDir::new().unwrap();
        let (registry, _) = open(tmp.path());

        registry.add(identity("alice")).await.unwrap();
        assert_eq!(registry.lookup("alice").unwrap().client_id, "alice");
        assert!(matches!(registry.lookup("mallory"), Err(RegistryError::NotFound(_))));
        assert!(matches!(
            registry.add(identity("alice")).await,
            Err(RegistryError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_identity() {
        let tmp = TempDir::new().unwrap();
        let (registry, _) = open(tmp.path());

        let bad_key = ClientIdentity::new("alice", "not-a-key", None);
        assert!(matches!(registry.add(bad_key).await, Err(RegistryError::InvalidIdentity(_))));

        let bad_id = identity("../escape");
        assert!(matches!(registry.add(bad_id).await, Err(RegistryError::InvalidIdentity(_))));
    }

    #[tokio::test]
    async fn test_round_trip_across_restart() {
        let tmp = TempDir::new().unwrap();
        {
            let (registry, _) = open(tmp.path());
            for id in ["alice", "bob", "carol"] {
                registry.add(identity(id)).await.unwrap();
            }
        }

        let (registry, report) = open(tmp.path());
        assert_eq!(report.source, LoadSource::Primary);
        let ids: Vec<String> = registry.list().into_iter().map(|c| c.client_id).collect();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_revoke_is_permanent() {
        let tmp = TempDir::new().unwrap();
        let (registry, _) = open(tmp.path());
        registry.add(identity("alice")).await.unwrap();

        let mut events = registry.subscribe();
        let record = registry.revoke("alice", "compromised").await.unwrap();
        assert_eq!(record.client_id, "alice");
        assert!(registry.is_revoked("alice"));
        assert_eq!(events.recv().await.unwrap(), record);

        // Idempotent, no second record
        let again = registry.revoke("alice", "again").await.unwrap();
        assert_eq!(again, record);
        assert_eq!(revocation::load_records(&registry.paths().revoked).unwrap().len(), 1);

        assert!(matches!(
            registry.add(identity("alice")).await,
            Err(RegistryError::AlreadyExists(_))
        ));
        assert!(matches!(
            registry.revoke("mallory", "x").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_primary_recovers_from_newest_backup() {
        let tmp = TempDir::new().unwrap();
        {
            let (registry, _) = open(tmp.path());
            registry.add(identity("alice")).await.unwrap();
            registry.add(identity("bob")).await.unwrap();
            // Backup of the {alice, bob} state is taken by this write
            registry.add(identity("carol")).await.unwrap();
        }

        let primary = tmp.path().join(REGISTRY_FILE);
        fs::write(&primary, "{ truncated").unwrap();

        let (registry, report) = open(tmp.path());
        assert!(report.recovered());
        assert!(!report.warnings.is_empty());
        assert!(registry.lookup("alice").is_ok());
        assert!(registry.lookup("bob").is_ok());

        let preserved: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(preserved.len(), 1);

        // Primary was rewritten and is readable again
        let (_, report) = open(tmp.path());
        assert_eq!(report.source, LoadSource::Primary);
    }

    #[tokio::test]
    async fn test_corrupt_primary_without_backup_is_fatal() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(REGISTRY_FILE), "garbage").unwrap();

        assert!(matches!(
            ClientRegistry::open(tmp.path(), 3),
            Err(RegistryError::Unrecoverable { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_primary_with_backups_recovers() {
        let tmp = TempDir::new().unwrap();
        {
            let (registry, _) = open(tmp.path());
            registry.add(identity("alice")).await.unwrap();
            registry.add(identity("bob")).await.unwrap();
        }
        fs::remove_file(tmp.path().join(REGISTRY_FILE)).unwrap();

        let (registry, report) = open(tmp.path());
        assert!(report.recovered());
        assert!(registry.lookup("alice").is_ok());
    }

    #[tokio::test]
    async fn test_backups_bounded() {
        let tmp = TempDir::new().unwrap();
        let (registry, _) = open(tmp.path());
        for i in 0..8 {
            registry.add(identity(&format!("client-{}", i))).await.unwrap();
        }
        assert_eq!(backup::list_backups(&registry.paths().backups).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_revocation_record_is_authoritative_on_load() {
        let tmp = TempDir::new().unwrap();
        {
            let (registry, _) = open(tmp.path());
            registry.add(identity("alice")).await.unwrap();
        }
        // Out-of-band record with no flag in the primary
        revocation::write_record(&tmp.path().join(REVOKED_DIR), &RevocationRecord::new("alice", "offline"))
            .unwrap();

        let (registry, report) = open(tmp.path());
        assert!(registry.is_revoked("alice"));
        assert!(registry.lookup("alice").unwrap().is_revoked());
        assert!(report.warnings.iter().any(|w| w.contains("reconciled")));
    }

    #[tokio::test]
    async fn test_refresh_picks_up_external_revocations() {
        let tmp = TempDir::new().unwrap();
        let (registry, _) = open(tmp.path());
        registry.add(identity("alice")).await.unwrap();
        let mut events = registry.subscribe();

        revocation::write_record(&registry.paths().revoked, &RevocationRecord::new("alice", "cli")).unwrap();

        let applied = registry.refresh_revocations().await.unwrap();
        assert_eq!(applied.len(), 1);
        assert!(registry.is_revoked("alice"));
        assert_eq!(events.recv().await.unwrap().client_id, "alice");

        assert!(registry.refresh_revocations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reload_sees_external_additions() {
        let tmp = TempDir::new().unwrap();
        let (server_side, _) = open(tmp.path());
        let (admin_side, _) = open(tmp.path());

        admin_side.add(identity("dave")).await.unwrap();
        assert!(server_side.lookup("dave").is_err());

        server_side.reload().await.unwrap();
        assert!(server_side.lookup("dave").is_ok());
        assert!(server_side.is_available());
    }
}
