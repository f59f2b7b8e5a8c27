//! The seam to the PostgreSQL server being backed up.
//!
//! The core only needs a narrow interface: probe the cluster (version,
//! role, tablespaces), bracket a backup with start/stop positions, and
//! enumerate the files to copy. [`LocalClusterSource`] implements it
//! against a locally reachable data directory, deriving positions from
//! the control file; the streaming-replication client lives outside the
//! core and plugs in through the same trait.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;
use utils::lsn::Lsn;

use postgres_ffi::controlfile::{ControlFileData, PG_CONTROL_FILE_SIZE};
use postgres_ffi::is_supported_version;

use crate::error::{Error, Result};
use crate::info::Tablespace;

/// What probing the server tells the backup stages.
#[derive(Debug, Clone)]
pub struct ServerProbe {
    pub major_version: u32,
    pub minor_version: u32,
    pub system_identifier: u64,
    pub is_primary: bool,
    pub timeline: u32,
    pub checkpoint_lsn: Lsn,
    pub redo_lsn: Lsn,
    pub tablespaces: Vec<Tablespace>,
}

/// Positions recorded when a backup starts.
#[derive(Debug, Clone, Copy)]
pub struct BackupPosition {
    pub start_lsn: Lsn,
    pub checkpoint_lsn: Lsn,
    pub timeline: u32,
}

/// One file to copy, relative to the data directory root.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub relative_path: String,
    pub size: u64,
}

pub trait BackupSource {
    fn probe(&self) -> Result<ServerProbe>;

    /// Begin a backup and return the positions it starts from.
    fn begin_backup(&mut self, label: &str) -> Result<BackupPosition>;

    /// The directory the data files are read from.
    fn data_root(&self) -> &Utf8Path;

    /// The regular files a base backup copies, relative to
    /// [`Self::data_root`], excluding transient server state.
    fn list_files(&self) -> Result<Vec<SourceFile>>;

    /// End the backup; returns the stop LSN and the ending timeline.
    fn end_backup(&mut self) -> Result<(Lsn, u32)>;
}

/// Directories basebackup never copies.
const EXCLUDED_DIRS: &[&str] = &[
    "pg_wal",
    "pg_replslot",
    "pg_dynshmem",
    "pg_notify",
    "pg_serial",
    "pg_snapshots",
    "pg_stat_tmp",
    "pg_subtrans",
    "pgsql_tmp",
];

/// Files basebackup never copies.
const EXCLUDED_FILES: &[&str] = &[
    "postmaster.pid",
    "postmaster.opts",
    "pg_internal.init",
    "backup_label.old",
    "tablespace_map.old",
];

/// Backup source over a locally reachable data directory.
pub struct LocalClusterSource {
    data_dir: Utf8PathBuf,
    declared_version: Option<u32>,
    in_backup: bool,
}

impl LocalClusterSource {
    pub fn new(data_dir: impl AsRef<Utf8Path>, declared_version: Option<u32>) -> LocalClusterSource {
        LocalClusterSource {
            data_dir: data_dir.as_ref().to_path_buf(),
            declared_version,
            in_backup: false,
        }
    }

    fn read_control(&self) -> Result<ControlFileData> {
        let path = self.data_dir.join("global/pg_control");
        let bytes = std::fs::read(&path).map_err(|e| Error::io(&path, e))?;
        if bytes.len() != PG_CONTROL_FILE_SIZE {
            return Err(Error::corrupt(format!(
                "control file {path} is {} bytes",
                bytes.len()
            )));
        }
        ControlFileData::decode(&bytes).map_err(|e| match e {
            postgres_ffi::controlfile::ControlFileError::UnsupportedVersion(v) => {
                Error::VersionMismatch(format!("pg_control version {v}"))
            }
            other => Error::corrupt(format!("{path}: {other}")),
        })
    }

    fn tablespaces(&self) -> Result<Vec<Tablespace>> {
        let dir = self.data_dir.join("pg_tblspc");
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(Error::io(&dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&dir, e))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Ok(oid) = name.parse::<u32>() else {
                continue;
            };
            let link = dir.join(&name);
            let target = std::fs::read_link(&link)
                .map(|p| Utf8PathBuf::from_path_buf(p).unwrap_or_default())
                .unwrap_or_default();
            out.push(Tablespace {
                name,
                oid,
                path: target,
            });
        }
        out.sort_by_key(|ts| ts.oid);
        Ok(out)
    }
}

impl BackupSource for LocalClusterSource {
    fn probe(&self) -> Result<ServerProbe> {
        let control = self.read_control()?;
        let common = control.common();

        let majors = control.major_versions();
        let major_version = match self.declared_version {
            Some(v) if majors.contains(&v) => v,
            Some(v) => {
                return Err(Error::VersionMismatch(format!(
                    "configured major {v} does not match control file layout {majors:?}"
                )))
            }
            None => majors[0],
        };
        if !is_supported_version(major_version) {
            return Err(Error::VersionMismatch(format!(
                "PostgreSQL major {major_version}"
            )));
        }

        let is_primary = !self.data_dir.join("standby.signal").exists();
        debug!(
            "probed cluster: major {major_version}, timeline {}, checkpoint {}",
            common.timeline_id, common.checkpoint
        );
        Ok(ServerProbe {
            major_version,
            minor_version: 0,
            system_identifier: common.system_identifier,
            is_primary,
            timeline: common.timeline_id,
            checkpoint_lsn: common.checkpoint,
            redo_lsn: common.redo,
            tablespaces: self.tablespaces()?,
        })
    }

    fn begin_backup(&mut self, label: &str) -> Result<BackupPosition> {
        let probe = self.probe()?;
        self.in_backup = true;
        info!(
            "starting backup {label}: redo {}, checkpoint {}, timeline {}",
            probe.redo_lsn, probe.checkpoint_lsn, probe.timeline
        );
        Ok(BackupPosition {
            start_lsn: probe.redo_lsn,
            checkpoint_lsn: probe.checkpoint_lsn,
            timeline: probe.timeline,
        })
    }

    fn data_root(&self) -> &Utf8Path {
        &self.data_dir
    }

    fn list_files(&self) -> Result<Vec<SourceFile>> {
        assert!(self.in_backup, "list_files outside a backup");
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&self.data_dir).follow_links(false) {
            let entry = entry.map_err(|e| {
                Error::io(
                    &self.data_dir,
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::ErrorKind::Other.into()),
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path().to_path_buf()) else {
                continue;
            };
            let rel = path
                .strip_prefix(&self.data_dir)
                .expect("walkdir stays under the root");
            let mut components = rel.components().map(|c| c.as_str());
            let top = components.next().unwrap_or_default();
            if EXCLUDED_DIRS.contains(&top) {
                continue;
            }
            let name = rel.file_name().unwrap_or_default();
            if EXCLUDED_FILES.contains(&name) || name.ends_with(".tmp") {
                continue;
            }
            let size = entry
                .metadata()
                .map_err(|e| {
                    Error::io(
                        &path,
                        e.into_io_error()
                            .unwrap_or_else(|| std::io::ErrorKind::Other.into()),
                    )
                })?
                .len();
            out.push(SourceFile {
                relative_path: rel.as_str().to_string(),
                size,
            });
        }
        out.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(out)
    }

    fn end_backup(&mut self) -> Result<(Lsn, u32)> {
        assert!(self.in_backup, "end_backup without begin_backup");
        self.in_backup = false;
        let control = self.read_control()?;
        let common = control.common();
        Ok((common.checkpoint, common.timeline_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use postgres_ffi::controlfile::{ControlFileCommon, DbState};

    pub(crate) fn write_control(data_dir: &Utf8Path, checkpoint: Lsn, timeline: u32) {
        let control = ControlFileData::V17(ControlFileCommon {
            system_identifier: 0x1111_2222_3333_4444,
            pg_control_version: 1700,
            catalog_version_no: 202407111,
            state: DbState::InProduction,
            checkpoint,
            redo: checkpoint,
            timeline_id: timeline,
            prev_timeline_id: timeline.saturating_sub(1).max(1),
            next_oid: 24576,
        });
        std::fs::create_dir_all(data_dir.join("global")).unwrap();
        std::fs::write(data_dir.join("global/pg_control"), control.encode()).unwrap();
    }

    #[test]
    fn probe_reads_the_control_file() {
        let dir = tempdir().unwrap();
        write_control(dir.path(), Lsn(0x2000028), 3);
        std::fs::create_dir_all(dir.path().join("pg_tblspc")).unwrap();

        let source = LocalClusterSource::new(dir.path(), Some(17));
        let probe = source.probe().unwrap();
        assert_eq!(probe.major_version, 17);
        assert_eq!(probe.timeline, 3);
        assert_eq!(probe.checkpoint_lsn, Lsn(0x2000028));
        assert!(probe.is_primary);

        // declaring a version outside the layout's majors is an error
        let source = LocalClusterSource::new(dir.path(), Some(13));
        assert!(matches!(
            source.probe(),
            Err(Error::VersionMismatch(_))
        ));
    }

    #[test]
    fn standby_signal_flips_the_role() {
        let dir = tempdir().unwrap();
        write_control(dir.path(), Lsn(0x2000028), 1);
        std::fs::write(dir.path().join("standby.signal"), b"").unwrap();
        let source = LocalClusterSource::new(dir.path(), None);
        assert!(!source.probe().unwrap().is_primary);
    }

    #[test]
    fn file_listing_excludes_transient_state() {
        let dir = tempdir().unwrap();
        write_control(dir.path(), Lsn(0x2000028), 1);
        std::fs::create_dir_all(dir.path().join("base/5")).unwrap();
        std::fs::create_dir_all(dir.path().join("pg_wal")).unwrap();
        std::fs::write(dir.path().join("base/5/16384"), vec![0u8; 8192]).unwrap();
        std::fs::write(dir.path().join("PG_VERSION"), b"17\n").unwrap();
        std::fs::write(dir.path().join("postmaster.pid"), b"1234\n").unwrap();
        std::fs::write(dir.path().join("pg_wal/000000010000000000000001"), b"x").unwrap();

        let mut source = LocalClusterSource::new(dir.path(), Some(17));
        source.begin_backup("20250101000000").unwrap();
        let files: Vec<String> = source
            .list_files()
            .unwrap()
            .into_iter()
            .map(|f| f.relative_path)
            .collect();
        assert!(files.contains(&"base/5/16384".to_string()));
        assert!(files.contains(&"PG_VERSION".to_string()));
        assert!(files.contains(&"global/pg_control".to_string()));
        assert!(!files.iter().any(|f| f.starts_with("pg_wal/")));
        assert!(!files.contains(&"postmaster.pid".to_string()));
        let (stop, tli) = source.end_backup().unwrap();
        assert_eq!(stop, Lsn(0x2000028));
        assert_eq!(tli, 1);
    }
}
