// src/auth/revocation.rs
//! Append-only revocation records.
//!
//! Each revocation is a separate JSON file in the `revoked/` directory, named
//! `<client_id>-<timestamp_millis>.json`. Records are never rewritten or
//! deleted; the directory is the authority when the registry file disagrees.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::utils::security::StringValidator;

/// A single revocation of a client identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationRecord {
    /// Revoked client
    pub client_id: String,
    /// When the revocation was committed
    pub revoked_at: DateTime<Utc>,
    /// Operator-supplied reason
    pub reason: String,
}

impl RevocationRecord {
    pub fn new(client_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            revoked_at: Utc::now(),
            reason: reason.into(),
        }
    }

    fn file_name(&self, timestamp_millis: i64) -> String {
        format!(
            "{}-{}.json",
            StringValidator::sanitize_identifier(&self.client_id),
            timestamp_millis
        )
    }
}

/// Durably write a new record into `dir`, never replacing an existing file.
pub fn write_record(dir: &Path, record: &RevocationRecord) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let json = serde_json::to_vec_pretty(record)?;
    let mut timestamp = record.revoked_at.timestamp_millis();

    loop {
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;

        let target = dir.join(record.file_name(timestamp));
        match tmp.persist_noclobber(&target) {
            Ok(_) => {
                debug!(path = %target.display(), "Revocation record written");
                return Ok(target);
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                // Same client revoked twice within one millisecond
                timestamp += 1;
            }
            Err(e) => return Err(e.error),
        }
    }
}

/// Load every readable record in `dir`, oldest first.
///
/// Unreadable or malformed files are skipped with a warning; a missing
/// directory yields no records.
pub fn load_records(dir: &Path) -> io::Result<Vec<RevocationRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }

        let parsed = fs::read(&path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| serde_json::from_slice::<RevocationRecord>(&bytes).map_err(|e| e.to_string()));

        match parsed {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable revocation record"),
        }
    }

    records.sort_by(|a, b| a.revoked_at.cmp(&b.revoked_at));
    Ok(records)
}
