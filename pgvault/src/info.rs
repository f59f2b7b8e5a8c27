//! The `backup.info` file: one `KEY=VALUE` per line, created when a
//! backup begins and rewritten at every stage boundary.

use std::fmt::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use utils::lsn::Lsn;

use crate::error::{Error, Result};

pub const INFO_FILE: &str = "backup.info";

pub const INFO_LABEL: &str = "LABEL";
pub const INFO_PARENT_LABEL: &str = "PARENT_LABEL";
pub const INFO_STATUS: &str = "STATUS";
pub const INFO_WAL: &str = "WAL";
pub const INFO_START_WALPOS: &str = "START_WALPOS";
pub const INFO_END_WALPOS: &str = "END_WALPOS";
pub const INFO_CHKPT_WALPOS: &str = "CHKPT_WALPOS";
pub const INFO_START_TIMELINE: &str = "START_TIMELINE";
pub const INFO_END_TIMELINE: &str = "END_TIMELINE";
pub const INFO_MAJOR_VERSION: &str = "MAJOR_VERSION";
pub const INFO_MINOR_VERSION: &str = "MINOR_VERSION";
pub const INFO_KEEP: &str = "KEEP";
pub const INFO_COMPRESSION: &str = "COMPRESSION";
pub const INFO_ENCRYPTION: &str = "ENCRYPTION";
pub const INFO_HASH_ALGORITHM: &str = "HASH_ALGORITHM";
pub const INFO_BACKUP_SIZE: &str = "BACKUP_SIZE";
pub const INFO_RESTORE_SIZE: &str = "RESTORE_SIZE";
pub const INFO_ELAPSED: &str = "ELAPSED";
pub const INFO_BASEBACKUP_ELAPSED: &str = "BASEBACKUP_ELAPSED";
pub const INFO_MANIFEST_ELAPSED: &str = "MANIFEST_ELAPSED";
pub const INFO_COMPRESSION_GZIP_ELAPSED: &str = "COMPRESSION_GZIP_ELAPSED";
pub const INFO_COMPRESSION_ZSTD_ELAPSED: &str = "COMPRESSION_ZSTD_ELAPSED";
pub const INFO_COMPRESSION_LZ4_ELAPSED: &str = "COMPRESSION_LZ4_ELAPSED";
pub const INFO_COMPRESSION_BZIP2_ELAPSED: &str = "COMPRESSION_BZIP2_ELAPSED";
pub const INFO_ENCRYPTION_ELAPSED: &str = "ENCRYPTION_ELAPSED";
pub const INFO_LINKING_ELAPSED: &str = "LINKING_ELAPSED";
pub const INFO_COMMENTS: &str = "COMMENTS";
pub const INFO_EXTRA: &str = "EXTRA";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupStatus {
    #[default]
    InProgress,
    Valid,
    Invalid,
}

impl BackupStatus {
    fn as_info(self) -> i32 {
        match self {
            BackupStatus::InProgress => 0,
            BackupStatus::Valid => 1,
            BackupStatus::Invalid => -1,
        }
    }

    fn from_info(v: i32) -> Option<BackupStatus> {
        match v {
            0 => Some(BackupStatus::InProgress),
            1 => Some(BackupStatus::Valid),
            -1 => Some(BackupStatus::Invalid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tablespace {
    pub name: String,
    pub oid: u32,
    pub path: Utf8PathBuf,
}

/// Everything recorded about one backup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupInfo {
    pub label: String,
    /// Present for incremental backups.
    pub parent_label: Option<String>,
    pub status: BackupStatus,
    /// Name of the WAL segment holding the start position.
    pub wal: String,
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
    pub checkpoint_lsn: Lsn,
    pub start_timeline: u32,
    pub end_timeline: u32,
    pub major_version: u32,
    pub minor_version: u32,
    pub keep: bool,
    pub compression: String,
    pub encryption: String,
    pub hash_algorithm: String,
    pub backup_size: u64,
    pub restore_size: u64,
    pub elapsed: f64,
    pub basebackup_elapsed: f64,
    pub manifest_elapsed: f64,
    pub compression_gzip_elapsed: f64,
    pub compression_zstd_elapsed: f64,
    pub compression_lz4_elapsed: f64,
    pub compression_bzip2_elapsed: f64,
    pub encryption_elapsed: f64,
    pub linking_elapsed: f64,
    pub tablespaces: Vec<Tablespace>,
    pub comments: String,
    pub extra: String,
}

impl BackupInfo {
    pub fn new(label: impl Into<String>) -> BackupInfo {
        BackupInfo {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == BackupStatus::Valid
    }

    pub fn info_path(backup_dir: &Utf8Path) -> Utf8PathBuf {
        backup_dir.join(INFO_FILE)
    }

    /// Serialize and atomically replace `backup.info` in `backup_dir`.
    pub fn save(&self, backup_dir: &Utf8Path) -> Result<()> {
        let mut out = String::new();
        let mut put = |k: &str, v: &str| {
            let _ = writeln!(out, "{k}={v}");
        };
        put(INFO_LABEL, &self.label);
        if let Some(parent) = &self.parent_label {
            put(INFO_PARENT_LABEL, parent);
        }
        put(INFO_STATUS, &self.status.as_info().to_string());
        put(INFO_WAL, &self.wal);
        put(INFO_START_WALPOS, &self.start_lsn.to_string());
        put(INFO_END_WALPOS, &self.end_lsn.to_string());
        put(INFO_CHKPT_WALPOS, &self.checkpoint_lsn.to_string());
        put(INFO_START_TIMELINE, &self.start_timeline.to_string());
        put(INFO_END_TIMELINE, &self.end_timeline.to_string());
        put(INFO_MAJOR_VERSION, &self.major_version.to_string());
        put(INFO_MINOR_VERSION, &self.minor_version.to_string());
        put(INFO_KEEP, if self.keep { "true" } else { "false" });
        put(INFO_COMPRESSION, &self.compression);
        put(INFO_ENCRYPTION, &self.encryption);
        put(INFO_HASH_ALGORITHM, &self.hash_algorithm);
        put(INFO_BACKUP_SIZE, &self.backup_size.to_string());
        put(INFO_RESTORE_SIZE, &self.restore_size.to_string());
        put(INFO_ELAPSED, &format!("{:.3}", self.elapsed));
        put(
            INFO_BASEBACKUP_ELAPSED,
            &format!("{:.3}", self.basebackup_elapsed),
        );
        put(
            INFO_MANIFEST_ELAPSED,
            &format!("{:.3}", self.manifest_elapsed),
        );
        put(
            INFO_COMPRESSION_GZIP_ELAPSED,
            &format!("{:.3}", self.compression_gzip_elapsed),
        );
        put(
            INFO_COMPRESSION_ZSTD_ELAPSED,
            &format!("{:.3}", self.compression_zstd_elapsed),
        );
        put(
            INFO_COMPRESSION_LZ4_ELAPSED,
            &format!("{:.3}", self.compression_lz4_elapsed),
        );
        put(
            INFO_COMPRESSION_BZIP2_ELAPSED,
            &format!("{:.3}", self.compression_bzip2_elapsed),
        );
        put(
            INFO_ENCRYPTION_ELAPSED,
            &format!("{:.3}", self.encryption_elapsed),
        );
        put(INFO_LINKING_ELAPSED, &format!("{:.3}", self.linking_elapsed));
        for (i, ts) in self.tablespaces.iter().enumerate() {
            put(&format!("TABLESPACES[{i}]"), &ts.name);
            put(&format!("TABLESPACES_OIDS[{i}]"), &ts.oid.to_string());
            put(&format!("TABLESPACES_PATHS[{i}]"), ts.path.as_str());
        }
        if !self.comments.is_empty() {
            put(INFO_COMMENTS, &self.comments);
        }
        if !self.extra.is_empty() {
            put(INFO_EXTRA, &self.extra);
        }

        let path = Self::info_path(backup_dir);
        let tmp = backup_dir.join(format!("{INFO_FILE}.tmp"));
        std::fs::write(&tmp, out).map_err(|e| Error::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| Error::io(&path, e))?;
        Ok(())
    }

    pub fn load(backup_dir: &Utf8Path) -> Result<BackupInfo> {
        let path = Self::info_path(backup_dir);
        let text = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let mut info = BackupInfo::default();
        let corrupt = || Error::corrupt(format!("backup info file {path}"));

        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(corrupt)?;
            match key {
                INFO_LABEL => info.label = value.to_string(),
                INFO_PARENT_LABEL => info.parent_label = Some(value.to_string()),
                INFO_STATUS => {
                    let v: i32 = value.parse().map_err(|_| corrupt())?;
                    info.status = BackupStatus::from_info(v).ok_or_else(corrupt)?;
                }
                INFO_WAL => info.wal = value.to_string(),
                INFO_START_WALPOS => info.start_lsn = value.parse().map_err(|_| corrupt())?,
                INFO_END_WALPOS => info.end_lsn = value.parse().map_err(|_| corrupt())?,
                INFO_CHKPT_WALPOS => {
                    info.checkpoint_lsn = value.parse().map_err(|_| corrupt())?
                }
                INFO_START_TIMELINE => {
                    info.start_timeline = value.parse().map_err(|_| corrupt())?
                }
                INFO_END_TIMELINE => info.end_timeline = value.parse().map_err(|_| corrupt())?,
                INFO_MAJOR_VERSION => {
                    info.major_version = value.parse().map_err(|_| corrupt())?
                }
                INFO_MINOR_VERSION => {
                    info.minor_version = value.parse().map_err(|_| corrupt())?
                }
                INFO_KEEP => info.keep = value == "true",
                INFO_COMPRESSION => info.compression = value.to_string(),
                INFO_ENCRYPTION => info.encryption = value.to_string(),
                INFO_HASH_ALGORITHM => info.hash_algorithm = value.to_string(),
                INFO_BACKUP_SIZE => info.backup_size = value.parse().map_err(|_| corrupt())?,
                INFO_RESTORE_SIZE => info.restore_size = value.parse().map_err(|_| corrupt())?,
                INFO_ELAPSED => info.elapsed = value.parse().map_err(|_| corrupt())?,
                INFO_BASEBACKUP_ELAPSED => {
                    info.basebackup_elapsed = value.parse().map_err(|_| corrupt())?
                }
                INFO_MANIFEST_ELAPSED => {
                    info.manifest_elapsed = value.parse().map_err(|_| corrupt())?
                }
                INFO_COMPRESSION_GZIP_ELAPSED => {
                    info.compression_gzip_elapsed = value.parse().map_err(|_| corrupt())?
                }
                INFO_COMPRESSION_ZSTD_ELAPSED => {
                    info.compression_zstd_elapsed = value.parse().map_err(|_| corrupt())?
                }
                INFO_COMPRESSION_LZ4_ELAPSED => {
                    info.compression_lz4_elapsed = value.parse().map_err(|_| corrupt())?
                }
                INFO_COMPRESSION_BZIP2_ELAPSED => {
                    info.compression_bzip2_elapsed = value.parse().map_err(|_| corrupt())?
                }
                INFO_ENCRYPTION_ELAPSED => {
                    info.encryption_elapsed = value.parse().map_err(|_| corrupt())?
                }
                INFO_LINKING_ELAPSED => {
                    info.linking_elapsed = value.parse().map_err(|_| corrupt())?
                }
                INFO_COMMENTS => info.comments = value.to_string(),
                INFO_EXTRA => info.extra = value.to_string(),
                _ if key.starts_with("TABLESPACES") => {
                    Self::apply_tablespace_key(&mut info, key, value).ok_or_else(corrupt)?;
                }
                // unknown keys are preserved-by-ignore: an older pgvault
                // can read a newer repository
                _ => {}
            }
        }
        if info.label.is_empty() {
            return Err(corrupt());
        }
        Ok(info)
    }

    fn apply_tablespace_key(info: &mut BackupInfo, key: &str, value: &str) -> Option<()> {
        let (field, index) = key.split_once('[')?;
        let index: usize = index.strip_suffix(']')?.parse().ok()?;
        while info.tablespaces.len() <= index {
            info.tablespaces.push(Tablespace::default());
        }
        let ts = &mut info.tablespaces[index];
        match field {
            "TABLESPACES" => ts.name = value.to_string(),
            "TABLESPACES_OIDS" => ts.oid = value.parse().ok()?,
            "TABLESPACES_PATHS" => ts.path = Utf8PathBuf::from(value),
            _ => return None,
        }
        Some(())
    }

    /// Fold one elapsed counter into the field matching the codec name.
    pub fn record_compression_elapsed(&mut self, codec: &str, seconds: f64) {
        match codec {
            "gzip" => self.compression_gzip_elapsed += seconds,
            "zstd" => self.compression_zstd_elapsed += seconds,
            "lz4" => self.compression_lz4_elapsed += seconds,
            "bzip2" => self.compression_bzip2_elapsed += seconds,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    fn sample() -> BackupInfo {
        let mut info = BackupInfo::new("20250101000000");
        info.parent_label = Some("20241231000000".to_string());
        info.status = BackupStatus::Valid;
        info.wal = "000000010000000000000004".to_string();
        info.start_lsn = Lsn(0x4000028);
        info.end_lsn = Lsn(0x4000138);
        info.checkpoint_lsn = Lsn(0x4000028);
        info.start_timeline = 1;
        info.end_timeline = 1;
        info.major_version = 17;
        info.minor_version = 2;
        info.compression = "zstd".to_string();
        info.encryption = "none".to_string();
        info.hash_algorithm = "sha-512".to_string();
        info.backup_size = 1024;
        info.restore_size = 4096;
        info.elapsed = 1.25;
        info.tablespaces.push(Tablespace {
            name: "ts1".to_string(),
            oid: 16500,
            path: Utf8PathBuf::from("/tablespaces/ts1"),
        });
        info
    }

    #[test]
    fn round_trip() {
        let dir = tempdir().unwrap();
        let info = sample();
        info.save(dir.path()).unwrap();
        let loaded = BackupInfo::load(dir.path()).unwrap();
        assert_eq!(loaded, info);
    }

    #[test]
    fn status_transitions_are_rewrites() {
        let dir = tempdir().unwrap();
        let mut info = sample();
        info.status = BackupStatus::InProgress;
        info.save(dir.path()).unwrap();
        assert_eq!(
            BackupInfo::load(dir.path()).unwrap().status,
            BackupStatus::InProgress
        );
        info.status = BackupStatus::Invalid;
        info.save(dir.path()).unwrap();
        assert_eq!(
            BackupInfo::load(dir.path()).unwrap().status,
            BackupStatus::Invalid
        );
    }

    #[test]
    fn rejects_garbage() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(INFO_FILE), "not a key value file\n").unwrap();
        assert!(BackupInfo::load(dir.path()).is_err());

        std::fs::write(dir.path().join(INFO_FILE), "STATUS=7\nLABEL=x\n").unwrap();
        assert!(BackupInfo::load(dir.path()).is_err());
    }
}
