//! Deleting backups, with rollup of incremental children.
//!
//! A backup with children cannot simply vanish: each child's sparse
//! files and hard links reach into it. Before removal the child is made
//! independent: merged sparse files, materialized full copies, broken
//! hard links. The rewrite is two-phase: everything is prepared in
//! scratch files first and renamed into place only when the whole
//! preparation succeeded, so a failed delete leaves the child exactly
//! as it was.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::error::{Error, Result};
use crate::info::BackupInfo;
use crate::repository::{BackupCatalog, Repository, ServerOp};
use crate::sparse::{strip_incremental_name, SparseFile};
use crate::streamer::{Streamer, StreamerMode};
use crate::workflow::combine::{backup_codecs, find_stored, read_stored};
use crate::workflow::backup::LockStage;
use crate::workflow::{Stage, Tag, Workflow, WorkflowContext};

/// One prepared rewrite: `scratch` replaces `dest`, and `also_remove`
/// (a sparse file superseded by a full copy) goes away afterwards.
struct PendingRewrite {
    scratch: Utf8PathBuf,
    dest: Utf8PathBuf,
    also_remove: Option<Utf8PathBuf>,
}

/// Stored relative path -> logical relative path plus sparseness.
fn logical_from_stored(rel_stored: &str) -> (String, bool) {
    let (dir, name) = match rel_stored.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, rel_stored),
    };
    let plain = Streamer::restore_file_name(name);
    let rejoined = match dir {
        Some(dir) => format!("{dir}/{plain}"),
        None => plain,
    };
    match strip_incremental_name(&rejoined) {
        Some(logical) => (logical, true),
        None => (rejoined, false),
    }
}

#[cfg(unix)]
fn same_inode(a: &Utf8Path, b: &Utf8Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => ma.ino() == mb.ino() && ma.dev() == mb.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_inode(_a: &Utf8Path, _b: &Utf8Path) -> bool {
    // without inode identity every shared file is rewritten; correct,
    // just more copying
    true
}

/// Encode logical bytes the way `stored` files of a backup are encoded.
fn encode_to(
    bytes: &[u8],
    dest: &Utf8Path,
    compression: crate::config::CompressionCodec,
    encryption: crate::config::EncryptionConfig,
    key: Option<&[u8]>,
) -> Result<()> {
    let mut streamer = Streamer::new(StreamerMode::Backup, compression, encryption, key)?;
    streamer.add_destination(dest)?;
    streamer.write(bytes, true)
}

/// Rewrite `child` so it no longer depends on `parent`'s storage.
fn rollup_into_child(
    repo: &Repository,
    workspace: &Utf8Path,
    key: Option<&[u8]>,
    parent: &BackupInfo,
    child: &BackupInfo,
) -> Result<()> {
    let parent_data = repo.backup_data_dir(&parent.label);
    let child_data = repo.backup_data_dir(&child.label);
    let (parent_comp, parent_enc) = backup_codecs(parent)?;
    let (child_comp, child_enc) = backup_codecs(child)?;

    std::fs::create_dir_all(workspace).map_err(|e| Error::io(workspace, e))?;
    let mut pending: Vec<PendingRewrite> = Vec::new();
    let mut scratch_seq = 0usize;
    let scratch_name = |seq: &mut usize| {
        *seq += 1;
        workspace.join(format!(".rollup-{}-{seq}", std::process::id()))
    };

    let prepare = |pending: &mut Vec<PendingRewrite>, scratch_seq: &mut usize| -> Result<()> {
        for entry in walkdir::WalkDir::new(&parent_data) {
            let entry = entry.map_err(|e| {
                Error::io(
                    &parent_data,
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
            let rel_stored = path
                .strip_prefix(&parent_data)
                .expect("walkdir stays under the root")
                .as_str()
                .to_string();
            let (logical, parent_is_sparse) = logical_from_stored(&rel_stored);

            let Some((child_stored, child_sparse)) =
                find_stored(&child_data, &logical, child_comp, child_enc)
            else {
                // the child no longer has the file at all
                continue;
            };

            if !child_sparse {
                // full copy in the child; only a hard link back into the
                // parent needs materializing
                if same_inode(&child_stored, &path) {
                    let scratch = scratch_name(scratch_seq);
                    std::fs::copy(&path, &scratch).map_err(|e| Error::io(&scratch, e))?;
                    pending.push(PendingRewrite {
                        scratch,
                        dest: child_stored,
                        also_remove: None,
                    });
                }
                continue;
            }

            // the child holds a sparse file over the parent's content
            let child_bytes = read_stored(&child_stored, child_comp, child_enc, key, workspace)?;
            let child_sparse_file = SparseFile::decode(&child_bytes, child_stored.as_str())?;

            let parent_bytes = read_stored(&path, parent_comp, parent_enc, key, workspace)?;
            if parent_is_sparse {
                // sparse over sparse: merge into one sparse file
                let parent_sparse_file = SparseFile::decode(&parent_bytes, path.as_str())?;
                let merged = child_sparse_file.merge_under(&parent_sparse_file);
                let scratch = scratch_name(scratch_seq);
                encode_to(&merged.encode(), &scratch, child_comp, child_enc, key)?;
                pending.push(PendingRewrite {
                    scratch,
                    dest: child_stored,
                    also_remove: None,
                });
            } else {
                // sparse over full: materialize the combined full copy
                let mut store = parent_bytes;
                child_sparse_file.overlay_onto(&mut store);
                let scratch = scratch_name(scratch_seq);
                encode_to(&store, &scratch, child_comp, child_enc, key)?;
                let full_dest = child_data.join(Streamer::backup_file_name(
                    &logical, child_comp, child_enc,
                ));
                pending.push(PendingRewrite {
                    scratch,
                    dest: full_dest,
                    also_remove: Some(child_stored),
                });
            }
        }
        Ok(())
    };

    if let Err(e) = prepare(&mut pending, &mut scratch_seq) {
        // roll back: nothing in the child was touched yet
        for rewrite in &pending {
            let _ = std::fs::remove_file(&rewrite.scratch);
        }
        return Err(e);
    }

    // commit phase: renames only
    let rewrites = pending.len();
    for rewrite in pending {
        if let Some(parent_dir) = rewrite.dest.parent() {
            std::fs::create_dir_all(parent_dir).map_err(|e| Error::io(parent_dir, e))?;
        }
        std::fs::rename(&rewrite.scratch, &rewrite.dest)
            .map_err(|e| Error::io(&rewrite.dest, e))?;
        if let Some(extra) = rewrite.also_remove {
            let _ = std::fs::remove_file(extra);
        }
    }

    // detach the child from the deleted backup
    let mut child = child.clone();
    child.parent_label = parent.parent_label.clone();
    child.save(&repo.backup_dir(&child.label))?;
    info!(
        "rolled {} into {} ({rewrites} files rewritten)",
        parent.label, child.label
    );
    Ok(())
}

/// Remove one backup, rolling it up into its children first. Shared by
/// the delete and retention workflows, which hold the server flag.
pub fn delete_backup(
    repo: &Repository,
    workspace: &Utf8Path,
    key: Option<&[u8]>,
    label: &str,
) -> Result<()> {
    let info = repo.load_backup(label)?;
    if info.keep {
        return Err(Error::Retained(label.to_string()));
    }
    if repo.has_readers(label) {
        return Err(Error::Conflict(format!(
            "backup {label} is being read"
        )));
    }

    let catalog = BackupCatalog::snapshot(repo)?;
    let index = catalog
        .index_of(label)
        .ok_or_else(|| Error::NotFound(format!("backup {label}")))?;
    for child_index in catalog.children_of(index) {
        let child = &catalog.backups()[child_index];
        rollup_into_child(repo, workspace, key, &info, child)?;
    }

    let dir = repo.backup_dir(label);
    std::fs::remove_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    info!("deleted backup {label}");

    // prune WAL nothing references anymore
    if let Some(oldest) = repo.list_backups()?.iter().find(|b| b.is_valid()) {
        repo.prune_wal_before(oldest.start_lsn)?;
    }
    Ok(())
}

pub struct DeleteStage {
    label: String,
}

impl DeleteStage {
    pub fn new(label: impl Into<String>) -> DeleteStage {
        DeleteStage {
            label: label.into(),
        }
    }
}

impl Stage for DeleteStage {
    fn name(&self) -> &'static str {
        "delete"
    }

    fn execute(&mut self, ctx: &mut WorkflowContext) -> Result<()> {
        let workspace = ctx.config.workspace_dir();
        let key = ctx.config.encryption_key_bytes();
        delete_backup(&ctx.repo, &workspace, key.as_deref(), &self.label)
    }
}

/// Assemble and run a delete workflow.
pub fn run_delete(config: &crate::config::Config, server_name: &str, label: &str) -> Result<()> {
    config.server(server_name)?;
    let repo = Repository::new(&config.base_dir, server_name);
    let mut ctx = WorkflowContext::new(config, repo);
    ctx.set_str(Tag::ServerId, server_name);
    ctx.set_str(Tag::Label, label);
    Workflow::new(vec![
        Box::new(LockStage::new(ServerOp::Delete)),
        Box::new(DeleteStage::new(label)),
    ])
    .run(&mut ctx)
}

/// Flip a backup's `keep` flag: `retain` protects it from delete and
/// retention, `expunge` lifts the protection.
pub fn set_keep(config: &crate::config::Config, server_name: &str, label: &str, keep: bool) -> Result<()> {
    config.server(server_name)?;
    let repo = Repository::new(&config.base_dir, server_name);
    let mut info = repo.load_backup(label)?;
    info.keep = keep;
    info.save(&repo.backup_dir(label))?;
    info!(
        "backup {label} is now {}",
        if keep { "retained" } else { "expungeable" }
    );
    Ok(())
}
