//! Backup manifests.
//!
//! Two forms exist side by side. The local `backup.manifest` is CSV, one
//! `relative_path,hex_hash` row per regular file under the backup's data
//! root, written after all files are streamed and used for linking,
//! verification and hot-standby sync. The PostgreSQL-produced JSON
//! `backup_manifest` is read-only input: the source of truth about what
//! the base backup contained.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};

use camino::Utf8Path;
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};

use crate::config::HashAlgorithm;
use crate::error::{Error, Result};

pub const MANIFEST_FILE: &str = "backup.manifest";
pub const PG_MANIFEST_FILE: &str = "backup_manifest";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// `relative_path` (POSIX separators) to hex content hash.
    entries: BTreeMap<String, String>,
}

impl Manifest {
    pub fn new() -> Manifest {
        Manifest::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, relative_path: impl Into<String>, hash: impl Into<String>) {
        self.entries.insert(relative_path.into(), hash.into());
    }

    pub fn hash_of(&self, relative_path: &str) -> Option<&str> {
        self.entries.get(relative_path).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(p, h)| (p.as_str(), h.as_str()))
    }

    /// Hash a file's contents with the configured algorithm, returning
    /// the lowercase hex digest.
    pub fn hash_file(algorithm: HashAlgorithm, path: &Utf8Path) -> Result<String> {
        let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut buf = vec![0u8; 64 * 1024];
        let mut hasher = ContentHasher::new(algorithm);
        loop {
            let n = file.read(&mut buf).map_err(|e| Error::io(path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finish())
    }

    pub fn hash_bytes(algorithm: HashAlgorithm, bytes: &[u8]) -> String {
        let mut hasher = ContentHasher::new(algorithm);
        hasher.update(bytes);
        hasher.finish()
    }

    /// Write the CSV form, rows sorted by path.
    pub fn write(&self, path: &Utf8Path) -> Result<()> {
        let mut file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut out = String::new();
        for (rel_path, hash) in &self.entries {
            out.push_str(rel_path);
            out.push(',');
            out.push_str(hash);
            out.push('\n');
        }
        file.write_all(out.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| Error::io(path, e))
    }

    pub fn load(path: &Utf8Path) -> Result<Manifest> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut manifest = Manifest::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| Error::io(path, e))?;
            if line.is_empty() {
                continue;
            }
            let Some((rel_path, hash)) = line.rsplit_once(',') else {
                return Err(Error::corrupt(format!("manifest line {line:?} in {path}")));
            };
            manifest.add(rel_path, hash);
        }
        Ok(manifest)
    }

    /// Compare two manifests: paths only in `self` (deleted), only in
    /// `new` (added), and in both with different hashes (changed).
    pub fn diff(&self, new: &Manifest) -> ManifestDiff {
        let old_paths: BTreeSet<&String> = self.entries.keys().collect();
        let new_paths: BTreeSet<&String> = new.entries.keys().collect();
        let deleted = old_paths
            .difference(&new_paths)
            .map(|p| (*p).clone())
            .collect();
        let added = new_paths
            .difference(&old_paths)
            .map(|p| (*p).clone())
            .collect();
        let changed = old_paths
            .intersection(&new_paths)
            .filter(|p| self.entries[**p] != new.entries[**p])
            .map(|p| (*p).clone())
            .collect();
        ManifestDiff {
            deleted,
            added,
            changed,
        }
    }
}

/// Incremental digest over the configured algorithm.
pub enum ContentHasher {
    Sha256(Box<Sha256>),
    Sha512(Box<Sha512>),
    Crc32c(u32),
}

impl ContentHasher {
    pub fn new(algorithm: HashAlgorithm) -> ContentHasher {
        match algorithm {
            HashAlgorithm::Sha256 => ContentHasher::Sha256(Box::default()),
            HashAlgorithm::Sha512 => ContentHasher::Sha512(Box::default()),
            HashAlgorithm::Crc32c => ContentHasher::Crc32c(0),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            ContentHasher::Sha256(h) => h.update(bytes),
            ContentHasher::Sha512(h) => h.update(bytes),
            ContentHasher::Crc32c(crc) => *crc = crc32c::crc32c_append(*crc, bytes),
        }
    }

    pub fn finish(self) -> String {
        match self {
            ContentHasher::Sha256(h) => hex::encode(h.finalize()),
            ContentHasher::Sha512(h) => hex::encode(h.finalize()),
            ContentHasher::Crc32c(crc) => hex::encode(crc.to_be_bytes()),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub deleted: Vec<String>,
    pub added: Vec<String>,
    pub changed: Vec<String>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.added.is_empty() && self.changed.is_empty()
    }
}

/// The PostgreSQL JSON manifest, reduced to the fields the backup
/// manager consumes.
#[derive(Debug, Deserialize)]
pub struct PgManifest {
    #[serde(rename = "PostgreSQL-Backup-Manifest-Version")]
    pub version: u32,
    #[serde(rename = "Files", default)]
    pub files: Vec<PgManifestFile>,
    #[serde(rename = "WAL-Ranges", default)]
    pub wal_ranges: Vec<PgWalRange>,
}

#[derive(Debug, Deserialize)]
pub struct PgManifestFile {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "Checksum-Algorithm", default)]
    pub checksum_algorithm: Option<String>,
    #[serde(rename = "Checksum", default)]
    pub checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PgWalRange {
    #[serde(rename = "Timeline")]
    pub timeline: u32,
    #[serde(rename = "Start-LSN")]
    pub start_lsn: String,
    #[serde(rename = "End-LSN")]
    pub end_lsn: String,
}

impl PgManifest {
    pub fn load(path: &Utf8Path) -> Result<PgManifest> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let manifest: PgManifest = serde_json::from_str(&text)
            .map_err(|e| Error::corrupt(format!("{path}: {e}")))?;
        if manifest.version != 1 && manifest.version != 2 {
            return Err(Error::VersionMismatch(format!(
                "backup manifest version {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[test]
    fn csv_round_trip_and_diff() {
        let dir = tempdir().unwrap();
        let mut old = Manifest::new();
        old.add("global/pg_control", "aa11");
        old.add("base/5/16384", "bb22");
        old.add("base/5/16385", "cc33");

        let path = dir.path().join(MANIFEST_FILE);
        old.write(&path).unwrap();
        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded, old);

        let mut new = Manifest::new();
        new.add("global/pg_control", "aa11");
        new.add("base/5/16385", "dd44"); // changed
        new.add("base/5/16400", "ee55"); // added
        let diff = old.diff(&new);
        assert_eq!(diff.deleted, vec!["base/5/16384".to_string()]);
        assert_eq!(diff.added, vec!["base/5/16400".to_string()]);
        assert_eq!(diff.changed, vec!["base/5/16385".to_string()]);
        assert!(old.diff(&old).is_empty());
    }

    #[test]
    fn file_hashing_per_algorithm() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello pgvault").unwrap();

        let sha512 = Manifest::hash_file(HashAlgorithm::Sha512, &path).unwrap();
        assert_eq!(sha512.len(), 128);
        let sha256 = Manifest::hash_file(HashAlgorithm::Sha256, &path).unwrap();
        assert_eq!(sha256.len(), 64);
        let crc = Manifest::hash_file(HashAlgorithm::Crc32c, &path).unwrap();
        assert_eq!(crc.len(), 8);

        // stable across reads
        assert_eq!(
            Manifest::hash_file(HashAlgorithm::Sha512, &path).unwrap(),
            sha512
        );
    }

    #[test]
    fn pg_manifest_parses() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(PG_MANIFEST_FILE);
        std::fs::write(
            &path,
            r#"{
  "PostgreSQL-Backup-Manifest-Version": 1,
  "Files": [
    {"Path": "base/5/16384", "Size": 8192, "Last-Modified": "2025-01-01 00:00:00 GMT",
     "Checksum-Algorithm": "SHA256", "Checksum": "0abc"}
  ],
  "WAL-Ranges": [
    {"Timeline": 1, "Start-LSN": "0/2000028", "End-LSN": "0/2000100"}
  ],
  "Manifest-Checksum": "ffff"
}"#,
        )
        .unwrap();
        let manifest = PgManifest::load(&path).unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].path, "base/5/16384");
        assert_eq!(manifest.wal_ranges[0].timeline, 1);
    }
}
