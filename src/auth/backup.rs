// src/auth/backup.rs
//! Rotating snapshots of the registry file.
//!
//! Before every committed write the current primary file is copied into the
//! backup directory under a timestamped name, after pruning to make room.
//! Names sort chronologically, so pruning removes from the front of the
//! sorted listing.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::constants::BACKUP_PREFIX;
use crate::utils::current_timestamp_millis;

/// Prune to make room, then copy `primary` into `backup_dir`. At no point
/// are there more than `max_backups` snapshots on disk.
///
/// Returns the path of the new snapshot, or `None` when there was no primary
/// file to snapshot yet or no room could be made.
pub fn rotate_backup(primary: &Path, backup_dir: &Path, max_backups: usize) -> io::Result<Option<PathBuf>> {
    if !primary.exists() {
        return Ok(None);
    }

    fs::create_dir_all(backup_dir)?;

    prune_backups(backup_dir, max_backups.saturating_sub(1))?;
    let existing = list_backups(backup_dir)?;
    if existing.len() >= max_backups {
        warn!(
            backups = existing.len(),
            max_backups, "No room for a new registry backup; skipping snapshot"
        );
        return Ok(None);
    }

    // Several rotations can land in the same millisecond; the sequence must
    // keep growing even after older entries of that millisecond were pruned.
    let stem = format!("{}{:013}-", BACKUP_PREFIX, current_timestamp_millis());
    let seq = existing
        .iter()
        .filter_map(|p| p.file_stem()?.to_str()?.strip_prefix(stem.as_str())?.parse::<u32>().ok())
        .max()
        .map_or(0, |s| s + 1);
    let dest = backup_dir.join(format!("{}{:04}.json", stem, seq));

    fs::copy(primary, &dest)?;
    debug!(path = %dest.display(), "Registry backup written");

    Ok(Some(dest))
}

/// List backup files sorted oldest first.
pub fn list_backups(backup_dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !backup_dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<PathBuf> = fs::read_dir(backup_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension().map_or(false, |ext| ext == "json")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with(BACKUP_PREFIX))
        })
        .collect();

    entries.sort();
    Ok(entries)
}

/// Remove the oldest backups until at most `max_backups` remain.
///
/// Returns the number of files removed.
pub fn prune_backups(backup_dir: &Path, max_backups: usize) -> io::Result<usize> {
    let entries = list_backups(backup_dir)?;
    if entries.len() <= max_backups {
        return Ok(0);
    }

    let excess = entries.len() - max_backups;
    let mut removed = 0;
    for path in entries.into_iter().take(excess) {
        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                debug!(path = %path.display(), "Pruned old registry backup");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to prune registry backup"),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{QuickCheck, TestResult};
    use tempfile::TempDir;

    #[test]
    fn test_no_primary_no_backup() {
        let tmp = TempDir::new().unwrap();
        let result = rotate_backup(&tmp.path().join("missing.json"), &tmp.path().join("backups"), 3).unwrap();
        assert!(result.is_none());
        assert!(list_backups(&tmp.path().join("backups")).unwrap().is_empty());
    }

    #[test]
    fn test_rotation_keeps_newest() {
        let tmp = TempDir::new().unwrap();
        let primary = tmp.path().join("authorized_clients.json");
        let backups = tmp.path().join("backups");

        for i in 0..5 {
            fs::write(&primary, format!("{{\"generation\": {}}}", i)).unwrap();
            rotate_backup(&primary, &backups, 3).unwrap();
        }

        let remaining = list_backups(&backups).unwrap();
        assert_eq!(remaining.len(), 3);

        let newest = fs::read_to_string(remaining.last().unwrap()).unwrap();
        assert!(newest.contains("4"));
        let oldest = fs::read_to_string(&remaining[0]).unwrap();
        assert!(oldest.contains("2"));
    }

    #[test]
    fn test_leftover_excess_is_pruned_before_copy() {
        let tmp = TempDir::new().unwrap();
        let primary = tmp.path().join("authorized_clients.json");
        let backups = tmp.path().join("backups");
        fs::create_dir_all(&backups).unwrap();

        // Four snapshots left behind by an interrupted rotation with a limit of three
        for i in 0..4 {
            fs::write(backups.join(format!("{}{:013}-0000.json", BACKUP_PREFIX, i)), "{}").unwrap();
        }
        fs::write(&primary, "{\"generation\": 9}").unwrap();

        let dest = rotate_backup(&primary, &backups, 3).unwrap().unwrap();
        let remaining = list_backups(&backups).unwrap();
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining.last(), Some(&dest));
        assert!(!backups.join(format!("{}{:013}-0000.json", BACKUP_PREFIX, 1)).exists());
    }

    #[test]
    fn test_snapshot_skipped_when_prune_fails() {
        let tmp = TempDir::new().unwrap();
        let primary = tmp.path().join("authorized_clients.json");
        let backups = tmp.path().join("backups");

        // A directory with a backup name cannot be removed with remove_file
        let stuck = backups.join(format!("{}{:013}-0000.json", BACKUP_PREFIX, 0));
        fs::create_dir_all(&stuck).unwrap();
        fs::write(&primary, "{}").unwrap();

        assert_eq!(rotate_backup(&primary, &backups, 1).unwrap(), None);
        assert_eq!(list_backups(&backups).unwrap(), vec![stuck]);
    }

    #[test]
    fn test_foreign_files_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let backups = tmp.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        fs::write(backups.join("notes.txt"), "keep me").unwrap();
        fs::write(backups.join("other.json"), "{}").unwrap();

        assert!(list_backups(&backups).unwrap().is_empty());
        assert_eq!(prune_backups(&backups, 0).unwrap(), 0);
        assert!(backups.join("other.json").exists());
    }

    #[test]
    fn prop_rotation_never_exceeds_limit() {
        fn prop(rotations: u8, max_backups: u8) -> TestResult {
            if max_backups == 0 {
                return TestResult::discard();
            }
            let rotations = (rotations % 16) as usize;
            let max_backups = (max_backups % 8) as usize + 1;

            let tmp = TempDir::new().unwrap();
            let primary = tmp.path().join("authorized_clients.json");
            let backups = tmp.path().join("backups");

            for i in 0..rotations {
                fs::write(&primary, i.to_string()).unwrap();
                rotate_backup(&primary, &backups, max_backups).unwrap();
            }

            let count = list_backups(&backups).unwrap().len();
            TestResult::from_bool(count == rotations.min(max_backups))
        }

        QuickCheck::new().tests(30).quickcheck(prop as fn(u8, u8) -> TestResult);
    }
}
