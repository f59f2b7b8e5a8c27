//! The on-disk repository and its bookkeeping.
//!
//! Layout per server:
//!
//! ```text
//! <base_dir>/<server_name>/
//!     backup/<LABEL>/backup.info
//!     backup/<LABEL>/backup.manifest
//!     backup/<LABEL>/data/...
//!     backup/<LABEL>/<tablespace_oid>/...
//!     wal/<NNNNNNNNNNNNNNNNNNNNNNNN>
//!     summary/<START><STOP>
//! ```
//!
//! Also here: the per-server mutating-operation flag (one workflow at a
//! time, contenders fail fast), per-backup read references that deletes
//! check, the backup catalog snapshot with its parent/child edges, and
//! backup identifier resolution.

use std::collections::{HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::*;
use utils::lsn::Lsn;

use postgres_ffi::xlog_utils::{is_timeline_history_file_name, is_xlog_file_name, xlog_from_file_name};
use postgres_ffi::WAL_SEGMENT_SIZE;

use crate::brt::io::{parse_summary_file_name, read_brt, summary_file_name, write_brt};
use crate::brt::BlockRefTable;
use crate::error::{Error, Result};
use crate::info::{BackupInfo, BackupStatus};

pub const BACKUP_DIR: &str = "backup";
pub const WAL_DIR: &str = "wal";
pub const SUMMARY_DIR: &str = "summary";
pub const DATA_DIR: &str = "data";

/// Timestamp labels: `YYYYMMDDHHMMSS`.
pub const LABEL_FORMAT: &str = "%Y%m%d%H%M%S";

/// Which mutating operation holds a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOp {
    Backup,
    Restore,
    Delete,
}

impl std::fmt::Display for ServerOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerOp::Backup => write!(f, "backup"),
            ServerOp::Restore => write!(f, "restore"),
            ServerOp::Delete => write!(f, "delete"),
        }
    }
}

/// One mutating operation per server: acquired by compare-and-swap
/// against this registry, released on drop (workflow teardown).
static ACTIVE_OPS: Lazy<Mutex<HashMap<String, ServerOp>>> = Lazy::new(Default::default);

/// Open read references per (server, label); deletes require zero.
static READ_REFS: Lazy<Mutex<HashMap<(String, String), usize>>> = Lazy::new(Default::default);

#[derive(Debug)]
pub struct ServerOpGuard {
    server: String,
    op: ServerOp,
}

impl Drop for ServerOpGuard {
    fn drop(&mut self) {
        ACTIVE_OPS.lock().remove(&self.server);
        debug!("released {} flag for server {}", self.op, self.server);
    }
}

pub struct BackupReadGuard {
    key: (String, String),
}

impl Drop for BackupReadGuard {
    fn drop(&mut self) {
        let mut refs = READ_REFS.lock();
        if let Some(count) = refs.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                refs.remove(&self.key);
            }
        }
    }
}

#[derive(Clone)]
pub struct Repository {
    base_dir: Utf8PathBuf,
    server_name: String,
}

impl Repository {
    pub fn new(base_dir: impl AsRef<Utf8Path>, server_name: impl Into<String>) -> Repository {
        Repository {
            base_dir: base_dir.as_ref().to_path_buf(),
            server_name: server_name.into(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn server_dir(&self) -> Utf8PathBuf {
        self.base_dir.join(&self.server_name)
    }

    pub fn backup_root(&self) -> Utf8PathBuf {
        self.server_dir().join(BACKUP_DIR)
    }

    pub fn backup_dir(&self, label: &str) -> Utf8PathBuf {
        self.backup_root().join(label)
    }

    pub fn backup_data_dir(&self, label: &str) -> Utf8PathBuf {
        self.backup_dir(label).join(DATA_DIR)
    }

    pub fn tablespace_dir(&self, label: &str, oid: u32) -> Utf8PathBuf {
        self.backup_dir(label).join(oid.to_string())
    }

    pub fn wal_dir(&self) -> Utf8PathBuf {
        self.server_dir().join(WAL_DIR)
    }

    pub fn summary_dir(&self) -> Utf8PathBuf {
        self.server_dir().join(SUMMARY_DIR)
    }

    /// Create the per-server directory skeleton.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.server_dir(),
            self.backup_root(),
            self.wal_dir(),
            self.summary_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        }
        Ok(())
    }

    /// Acquire the server's mutating-operation flag, failing fast when
    /// another operation holds it.
    pub fn acquire_op(&self, op: ServerOp) -> Result<ServerOpGuard> {
        let mut ops = ACTIVE_OPS.lock();
        if let Some(held) = ops.get(&self.server_name) {
            return Err(Error::Conflict(format!(
                "server {} is busy with an active {held}",
                self.server_name
            )));
        }
        ops.insert(self.server_name.clone(), op);
        debug!("acquired {op} flag for server {}", self.server_name);
        Ok(ServerOpGuard {
            server: self.server_name.clone(),
            op,
        })
    }

    /// Take a read reference on a backup; a delete of that backup fails
    /// while any reference is open.
    pub fn acquire_read(&self, label: &str) -> BackupReadGuard {
        let key = (self.server_name.clone(), label.to_string());
        *READ_REFS.lock().entry(key.clone()).or_insert(0) += 1;
        BackupReadGuard { key }
    }

    pub fn has_readers(&self, label: &str) -> bool {
        READ_REFS
            .lock()
            .contains_key(&(self.server_name.clone(), label.to_string()))
    }

    /// All backups with a readable info file, sorted by label, which
    /// sorts chronologically for timestamp labels.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        let root = self.backup_root();
        let mut backups = Vec::new();
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
            Err(e) => return Err(Error::io(&root, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&root, e))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let dir = root.join(&name);
            match BackupInfo::load(&dir) {
                Ok(info) => backups.push(info),
                Err(e) => warn!("skipping unreadable backup {dir}: {e}"),
            }
        }
        backups.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(backups)
    }

    pub fn load_backup(&self, label: &str) -> Result<BackupInfo> {
        let dir = self.backup_dir(label);
        if !dir.exists() {
            return Err(Error::NotFound(format!("backup {label}")));
        }
        BackupInfo::load(&dir)
    }

    /// The newest valid backup, if any.
    pub fn newest_valid_backup(&self) -> Result<Option<BackupInfo>> {
        Ok(self
            .list_backups()?
            .into_iter()
            .rev()
            .find(BackupInfo::is_valid))
    }

    /// Resolve a CLI identifier against the valid backups.
    pub fn resolve_identifier(&self, identifier: &BackupIdentifier) -> Result<BackupInfo> {
        let valid: Vec<BackupInfo> = self
            .list_backups()?
            .into_iter()
            .filter(BackupInfo::is_valid)
            .collect();
        let not_found = || Error::NotFound(format!("backup matching {identifier:?}"));

        match identifier {
            BackupIdentifier::Newest => valid.into_iter().last().ok_or_else(not_found),
            BackupIdentifier::Oldest => valid.into_iter().next().ok_or_else(not_found),
            BackupIdentifier::Label(label) => valid
                .into_iter()
                .find(|b| &b.label == label)
                .ok_or_else(not_found),
            BackupIdentifier::TargetLsn(lsn) => valid
                .into_iter()
                .filter(|b| b.start_lsn <= *lsn)
                .last()
                .ok_or_else(not_found),
            BackupIdentifier::TargetTime(time) => valid
                .into_iter()
                .filter(|b| {
                    NaiveDateTime::parse_from_str(&b.label, LABEL_FORMAT)
                        .map(|t| t <= *time)
                        .unwrap_or(false)
                })
                .last()
                .ok_or_else(not_found),
            BackupIdentifier::TargetTimeline(tli) => valid
                .into_iter()
                .filter(|b| b.start_timeline == *tli)
                .last()
                .ok_or_else(not_found),
        }
    }

    /// The chain from the full backup down to `label`, oldest first.
    pub fn backup_chain(&self, label: &str) -> Result<Vec<BackupInfo>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.load_backup(label)?;
        loop {
            if !seen.insert(current.label.clone()) {
                return Err(Error::corrupt(format!(
                    "backup chain through {label} contains a cycle"
                )));
            }
            let parent = current.parent_label.clone();
            chain.push(current);
            match parent {
                Some(parent_label) => current = self.load_backup(&parent_label)?,
                None => break,
            }
        }
        chain.reverse();
        Ok(chain)
    }

    /// Write a summary file for `[start, stop)`.
    pub fn write_summary(&self, brt: &BlockRefTable, start: Lsn, stop: Lsn) -> Result<Utf8PathBuf> {
        let path = self.summary_dir().join(summary_file_name(start, stop));
        write_brt(brt, &path)?;
        Ok(path)
    }

    /// The ranges of all stored summary files, sorted by start LSN.
    pub fn list_summaries(&self) -> Result<Vec<(Lsn, Lsn)>> {
        let dir = self.summary_dir();
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(Error::io(&dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&dir, e))?;
            if let Some(range) = entry
                .file_name()
                .to_str()
                .and_then(parse_summary_file_name)
            {
                out.push(range);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Load the union of stored summaries covering `[start, stop)`.
    /// Gaps are an error: a missing summary means missing WAL knowledge.
    pub fn load_summary_range(&self, start: Lsn, stop: Lsn) -> Result<BlockRefTable> {
        let mut merged = BlockRefTable::new();
        let mut position = start;
        for (range_start, range_stop) in self.list_summaries()? {
            if range_stop <= position || range_start >= stop {
                continue;
            }
            if range_start > position {
                return Err(Error::Truncated {
                    last_good_lsn: position,
                });
            }
            let path = self
                .summary_dir()
                .join(summary_file_name(range_start, range_stop));
            merged.merge(&read_brt(&path)?);
            position = range_stop;
            if position >= stop {
                break;
            }
        }
        if position < stop {
            return Err(Error::Truncated {
                last_good_lsn: position,
            });
        }
        Ok(merged)
    }

    /// Remove WAL segments strictly older than the segment containing
    /// `keep_from`. Timeline history files are always kept.
    pub fn prune_wal_before(&self, keep_from: Lsn) -> Result<usize> {
        let dir = self.wal_dir();
        let keep_segno = keep_from.segment_number(WAL_SEGMENT_SIZE as u64);
        let mut removed = 0;
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::io(&dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&dir, e))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_timeline_history_file_name(&name) || !is_xlog_file_name(&name) {
                continue;
            }
            let Some((segno, _tli)) = xlog_from_file_name(&name, WAL_SEGMENT_SIZE) else {
                continue;
            };
            if segno < keep_segno {
                let path = dir.join(&name);
                std::fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("pruned {removed} WAL segments before {keep_from}");
        }
        Ok(removed)
    }
}

/// How a CLI caller names a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupIdentifier {
    Newest,
    Oldest,
    Label(String),
    TargetLsn(Lsn),
    TargetTime(NaiveDateTime),
    TargetTimeline(u32),
}

impl std::str::FromStr for BackupIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<BackupIdentifier> {
        if s.is_empty() {
            return Err(Error::Config("empty backup identifier".into()));
        }
        if s.eq_ignore_ascii_case("newest") || s.eq_ignore_ascii_case("latest") {
            return Ok(BackupIdentifier::Newest);
        }
        if s.eq_ignore_ascii_case("oldest") {
            return Ok(BackupIdentifier::Oldest);
        }
        if let Some(rest) = s.strip_prefix("target-lsn:") {
            let lsn: Lsn = rest
                .parse()
                .map_err(|_| Error::Config(format!("invalid LSN {rest:?}")))?;
            return Ok(BackupIdentifier::TargetLsn(lsn));
        }
        if let Some(rest) = s.strip_prefix("target-time:") {
            let time = NaiveDateTime::parse_from_str(rest, "%Y-%m-%d %H:%M:%S")
                .map_err(|e| Error::Config(format!("invalid timestamp {rest:?}: {e}")))?;
            return Ok(BackupIdentifier::TargetTime(time));
        }
        if let Some(rest) = s.strip_prefix("target-tli:") {
            let tli: u32 = rest
                .parse()
                .map_err(|_| Error::Config(format!("invalid timeline {rest:?}")))?;
            return Ok(BackupIdentifier::TargetTimeline(tli));
        }
        Ok(BackupIdentifier::Label(s.to_string()))
    }
}

/// A consistent snapshot of the backup list with parent edges resolved
/// to indices; retention and delete read it once at stage start.
pub struct BackupCatalog {
    backups: Vec<BackupInfo>,
    parent: Vec<Option<usize>>,
}

impl BackupCatalog {
    pub fn snapshot(repo: &Repository) -> Result<BackupCatalog> {
        let backups = repo.list_backups()?;
        let by_label: HashMap<&str, usize> = backups
            .iter()
            .enumerate()
            .map(|(i, b)| (b.label.as_str(), i))
            .collect();
        let parent = backups
            .iter()
            .map(|b| {
                b.parent_label
                    .as_deref()
                    .and_then(|p| by_label.get(p).copied())
            })
            .collect();
        Ok(BackupCatalog { backups, parent })
    }

    pub fn len(&self) -> usize {
        self.backups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }

    pub fn backups(&self) -> &[BackupInfo] {
        &self.backups
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.backups.iter().position(|b| b.label == label)
    }

    pub fn parent_of(&self, index: usize) -> Option<usize> {
        self.parent[index]
    }

    /// Direct children, in label (chronological) order.
    pub fn children_of(&self, index: usize) -> Vec<usize> {
        (0..self.backups.len())
            .filter(|&i| self.parent[i] == Some(index))
            .collect()
    }

    /// Labels of valid backups whose age class makes them deletable
    /// under the retention policy, oldest first. The newest valid
    /// backup is never offered for deletion.
    pub fn retention_candidates(
        &self,
        policy: crate::config::Retention,
        now: NaiveDateTime,
    ) -> Vec<String> {
        use crate::config::Retention;

        // with every tier disabled there is no policy to enforce
        if !Retention::tier_enabled(policy.days)
            && !Retention::tier_enabled(policy.weeks)
            && !Retention::tier_enabled(policy.months)
            && !Retention::tier_enabled(policy.years)
        {
            return Vec::new();
        }

        let valid: Vec<&BackupInfo> = self.backups.iter().filter(|b| b.is_valid()).collect();
        let Some(newest) = valid.last() else {
            return Vec::new();
        };

        let mut candidates = Vec::new();
        // failed backups are swept regardless of age
        for backup in &self.backups {
            if backup.status == crate::info::BackupStatus::Invalid && !backup.keep {
                candidates.push(backup.label.clone());
            }
        }
        for backup in &valid {
            if backup.label == newest.label || backup.keep {
                continue;
            }
            let Ok(taken) = NaiveDateTime::parse_from_str(&backup.label, LABEL_FORMAT) else {
                continue;
            };
            let age = now.signed_duration_since(taken);
            let days = age.num_days();

            // a backup survives if any enabled tier still wants it
            let mut retained = false;
            if Retention::tier_enabled(policy.days) && days < policy.days as i64 {
                retained = true;
            }
            if Retention::tier_enabled(policy.weeks) && days < policy.weeks as i64 * 7 {
                retained = true;
            }
            if Retention::tier_enabled(policy.months) && days < policy.months as i64 * 30 {
                retained = true;
            }
            if Retention::tier_enabled(policy.years) && days < policy.years as i64 * 365 {
                retained = true;
            }
            if !retained {
                candidates.push(backup.label.clone());
            }
        }
        candidates.sort();
        candidates.dedup();
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    fn make_backup(repo: &Repository, label: &str, start_lsn: Lsn, tli: u32) -> BackupInfo {
        let mut info = BackupInfo::new(label);
        info.status = BackupStatus::Valid;
        info.start_lsn = start_lsn;
        info.end_lsn = Lsn(start_lsn.0 + 0x100);
        info.start_timeline = tli;
        info.end_timeline = tli;
        let dir = repo.backup_dir(label);
        std::fs::create_dir_all(repo.backup_data_dir(label)).unwrap();
        info.save(&dir).unwrap();
        info
    }

    #[test]
    fn identifier_by_lsn_and_timeline() {
        let dir = tempdir().unwrap();
        let repo = Repository::new(dir.path(), "srv");
        repo.ensure_layout().unwrap();
        make_backup(&repo, "20250101000000", Lsn(0x1000), 1);
        make_backup(&repo, "20250101010000", Lsn(0x2000), 2);

        let by = |s: &str| repo.resolve_identifier(&s.parse().unwrap());

        assert_eq!(by("target-lsn:0/1500").unwrap().label, "20250101000000");
        assert_eq!(by("target-lsn:0/3000").unwrap().label, "20250101010000");
        assert!(matches!(by("target-lsn:0/500"), Err(Error::NotFound(_))));

        assert_eq!(by("target-tli:1").unwrap().label, "20250101000000");
        assert_eq!(by("target-tli:2").unwrap().label, "20250101010000");

        assert_eq!(by("newest").unwrap().label, "20250101010000");
        assert_eq!(by("oldest").unwrap().label, "20250101000000");
        assert_eq!(by("20250101000000").unwrap().label, "20250101000000");
        assert_eq!(
            by("target-time:2025-01-01 00:30:00").unwrap().label,
            "20250101000000"
        );
    }

    #[test]
    fn op_flag_is_exclusive_per_server() {
        let dir = tempdir().unwrap();
        let repo = Repository::new(dir.path(), "locksrv");
        let other = Repository::new(dir.path(), "othersrv");

        let guard = repo.acquire_op(ServerOp::Backup).unwrap();
        let err = repo.acquire_op(ServerOp::Delete).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        // a different server is unaffected
        let _other_guard = other.acquire_op(ServerOp::Backup).unwrap();
        drop(guard);
        let _reacquired = repo.acquire_op(ServerOp::Delete).unwrap();
    }

    #[test]
    fn read_refs_block_delete() {
        let dir = tempdir().unwrap();
        let repo = Repository::new(dir.path(), "refsrv");
        assert!(!repo.has_readers("20250101000000"));
        let guard = repo.acquire_read("20250101000000");
        let second = repo.acquire_read("20250101000000");
        assert!(repo.has_readers("20250101000000"));
        drop(guard);
        assert!(repo.has_readers("20250101000000"));
        drop(second);
        assert!(!repo.has_readers("20250101000000"));
    }

    #[test]
    fn chain_walks_to_the_full_backup() {
        let dir = tempdir().unwrap();
        let repo = Repository::new(dir.path(), "chainsrv");
        repo.ensure_layout().unwrap();
        make_backup(&repo, "20250101000000", Lsn(0x1000), 1);
        let mut b = make_backup(&repo, "20250102000000", Lsn(0x2000), 1);
        b.parent_label = Some("20250101000000".into());
        b.save(&repo.backup_dir(&b.label)).unwrap();
        let mut c = make_backup(&repo, "20250103000000", Lsn(0x3000), 1);
        c.parent_label = Some("20250102000000".into());
        c.save(&repo.backup_dir(&c.label)).unwrap();

        let chain = repo.backup_chain("20250103000000").unwrap();
        let labels: Vec<&str> = chain.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["20250101000000", "20250102000000", "20250103000000"]
        );

        let catalog = BackupCatalog::snapshot(&repo).unwrap();
        let root = catalog.index_of("20250101000000").unwrap();
        let children = catalog.children_of(root);
        assert_eq!(children.len(), 1);
        assert_eq!(catalog.backups()[children[0]].label, "20250102000000");
    }

    #[test]
    fn wal_pruning_keeps_history_files() {
        let dir = tempdir().unwrap();
        let repo = Repository::new(dir.path(), "walsrv");
        repo.ensure_layout().unwrap();
        for segno in 1..=4u64 {
            std::fs::write(
                repo.wal_dir()
                    .join(postgres_ffi::xlog_utils::xlog_file_name(1, segno, WAL_SEGMENT_SIZE)),
                b"x",
            )
            .unwrap();
        }
        std::fs::write(repo.wal_dir().join("00000002.history"), b"1\t0/1\tx\n").unwrap();

        let keep_from = Lsn(3 * WAL_SEGMENT_SIZE as u64 + 100);
        assert_eq!(repo.prune_wal_before(keep_from).unwrap(), 2);
        assert!(repo.wal_dir().join("00000002.history").exists());
        assert!(repo
            .wal_dir()
            .join(postgres_ffi::xlog_utils::xlog_file_name(1, 3, WAL_SEGMENT_SIZE))
            .exists());
    }

    #[test]
    fn retention_candidates_respect_tiers_and_keep() {
        use crate::config::Retention;
        let dir = tempdir().unwrap();
        let repo = Repository::new(dir.path(), "retsrv");
        repo.ensure_layout().unwrap();
        make_backup(&repo, "20250101000000", Lsn(0x1000), 1);
        make_backup(&repo, "20250601000000", Lsn(0x2000), 1);
        let mut kept = make_backup(&repo, "20250201000000", Lsn(0x1500), 1);
        kept.keep = true;
        kept.save(&repo.backup_dir(&kept.label)).unwrap();

        let catalog = BackupCatalog::snapshot(&repo).unwrap();
        let now = NaiveDateTime::parse_from_str("20250701000000", LABEL_FORMAT).unwrap();

        // 7-day retention: january and february exceed it, but february
        // has keep set; june survives as the newest
        let policy = Retention { days: 7, weeks: 0, months: 0, years: 0 };
        assert_eq!(
            catalog.retention_candidates(policy, now),
            vec!["20250101000000".to_string()]
        );

        // all tiers disabled: nothing is ever deleted
        let disabled = Retention { days: 0, weeks: -1, months: 0, years: 0 };
        assert!(catalog.retention_candidates(disabled, now).is_empty());
    }
}
