//! Reassembling a full image out of a chain of incremental backups.
//!
//! Every file of the newest backup's manifest is materialized into the
//! target: full copies are decoded through the restore pipeline, sparse
//! copies are reconstructed by walking the chain oldest to newest and
//! overlaying each backup's recorded blocks, then truncating to the
//! newest recorded length. The reconstructed content is verified
//! against the chain's final manifest.

use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::config::{CompressionCodec, CompressionConfig, EncryptionConfig};
use crate::error::{Error, Result};
use crate::info::BackupInfo;
use crate::manifest::{Manifest, MANIFEST_FILE};
use crate::repository::Repository;
use crate::sparse::{incremental_name, SparseFile};
use crate::streamer::{stream_file, Streamer, StreamerMode};

/// The codec settings a backup was taken with, parsed back out of its
/// info record.
pub fn backup_codecs(info: &BackupInfo) -> Result<(CompressionCodec, EncryptionConfig)> {
    let compression = if info.compression.is_empty() {
        CompressionCodec::None
    } else {
        info.compression
            .parse::<CompressionConfig>()
            .map_err(Error::Config)?
            .codec
    };
    let encryption = if info.encryption.is_empty() {
        EncryptionConfig::None
    } else {
        info.encryption.parse().map_err(Error::Config)?
    };
    Ok((compression, encryption))
}

/// The stored form of `rel_path` inside `data_dir`, if any: the full
/// copy, or the sparse (`INCREMENTAL.`) copy.
pub fn find_stored(
    data_dir: &Utf8Path,
    rel_path: &str,
    compression: CompressionCodec,
    encryption: EncryptionConfig,
) -> Option<(Utf8PathBuf, bool)> {
    let full = data_dir.join(Streamer::backup_file_name(rel_path, compression, encryption));
    if full.is_file() {
        return Some((full, false));
    }
    let sparse = data_dir.join(Streamer::backup_file_name(
        &incremental_name(rel_path),
        compression,
        encryption,
    ));
    sparse.is_file().then_some((sparse, true))
}

static DECODE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Decode a stored file back to its logical bytes, through a scratch
/// file when a codec or cipher is involved.
pub fn read_stored(
    stored: &Utf8Path,
    compression: CompressionCodec,
    encryption: EncryptionConfig,
    key: Option<&[u8]>,
    workspace: &Utf8Path,
) -> Result<Vec<u8>> {
    if compression == CompressionCodec::None && encryption == EncryptionConfig::None {
        return std::fs::read(stored).map_err(|e| Error::io(stored, e));
    }
    std::fs::create_dir_all(workspace).map_err(|e| Error::io(workspace, e))?;
    let scratch = workspace.join(format!(
        ".decode-{}-{}",
        std::process::id(),
        DECODE_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let result = (|| {
        stream_file(
            stored,
            &scratch,
            StreamerMode::Restore,
            compression,
            encryption,
            key,
        )?;
        std::fs::read(&scratch).map_err(|e| Error::io(&scratch, e))
    })();
    let _ = std::fs::remove_file(&scratch);
    result
}

/// Reconstruct the logical content of `rel_path` from the chain
/// (oldest first). Returns None if no backup in the chain stores the
/// file at all.
pub fn reconstruct_file(
    repo: &Repository,
    chain: &[BackupInfo],
    rel_path: &str,
    key: Option<&[u8]>,
    workspace: &Utf8Path,
) -> Result<Option<Vec<u8>>> {
    let mut store: Option<Vec<u8>> = None;
    for backup in chain {
        let (compression, encryption) = backup_codecs(backup)?;
        let data_dir = repo.backup_data_dir(&backup.label);
        let Some((stored, is_sparse)) = find_stored(&data_dir, rel_path, compression, encryption)
        else {
            continue;
        };
        let bytes = read_stored(&stored, compression, encryption, key, workspace)?;
        if is_sparse {
            let sparse = SparseFile::decode(&bytes, stored.as_str())?;
            let base = store.get_or_insert_with(Vec::new);
            sparse.overlay_onto(base);
        } else {
            store = Some(bytes);
        }
    }
    Ok(store)
}

#[derive(Debug, Default)]
pub struct CombineStats {
    pub files: usize,
    pub reconstructed: usize,
    pub bytes: u64,
}

/// Materialize the newest backup of `chain` as a plain data directory
/// under `target`, verifying every produced file against the chain's
/// final manifest.
pub fn combine_chain(
    repo: &Repository,
    chain: &[BackupInfo],
    target: &Utf8Path,
    key: Option<&[u8]>,
    workspace: &Utf8Path,
) -> Result<CombineStats> {
    let newest = chain
        .last()
        .ok_or_else(|| Error::NotFound("an empty backup chain".into()))?;
    let manifest = Manifest::load(&repo.backup_dir(&newest.label).join(MANIFEST_FILE))?;
    let algorithm = newest
        .hash_algorithm
        .parse()
        .map_err(Error::Config)?;

    let mut stats = CombineStats::default();
    for (rel_path, expected_hash) in manifest.iter() {
        let (compression, encryption) = backup_codecs(newest)?;
        let newest_data = repo.backup_data_dir(&newest.label);
        let is_sparse = matches!(
            find_stored(&newest_data, rel_path, compression, encryption),
            Some((_, true))
        );

        let content = reconstruct_file(repo, chain, rel_path, key, workspace)?
            .ok_or_else(|| Error::NotFound(format!("file {rel_path} in backup chain")))?;

        let actual_hash = Manifest::hash_bytes(algorithm, &content);
        if actual_hash != expected_hash {
            return Err(Error::corrupt(format!(
                "combined file {rel_path} does not match the manifest"
            )));
        }

        let dest = target.join(rel_path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        stats.bytes += content.len() as u64;
        std::fs::write(&dest, content).map_err(|e| Error::io(&dest, e))?;
        stats.files += 1;
        if is_sparse {
            stats.reconstructed += 1;
        }
    }
    debug!(
        "combined {} files ({} reconstructed) into {target}",
        stats.files, stats.reconstructed
    );
    Ok(stats)
}
