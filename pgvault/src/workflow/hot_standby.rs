//! Hot standby maintenance: keep warm-copy directories tracking the
//! newest backup.
//!
//! After a successful backup, each configured standby directory is
//! brought up to date. A directory that has never been synced (or whose
//! sync marker points at a backup that no longer exists) gets a full
//! materialization; otherwise only the manifest diff against the
//! previously synced backup is applied.

use camino::Utf8Path;
use tracing::*;

use crate::error::{Error, Result};
use crate::manifest::{Manifest, MANIFEST_FILE};
use crate::repository::Repository;
use crate::workflow::combine::{combine_chain, reconstruct_file};
use crate::workflow::{Stage, Tag, WorkflowContext};

/// Marker file recording which backup a standby directory reflects.
const SYNC_MARKER: &str = ".pgvault_synced";

pub struct HotStandbyStage;

fn sync_one(
    repo: &Repository,
    label: &str,
    standby: &Utf8Path,
    overrides: Option<&str>,
    key: Option<&[u8]>,
    workspace: &Utf8Path,
) -> Result<()> {
    let chain = repo.backup_chain(label)?;
    let manifest = Manifest::load(&repo.backup_dir(label).join(MANIFEST_FILE))?;

    let marker = standby.join(SYNC_MARKER);
    let synced_label = std::fs::read_to_string(&marker)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|prev| repo.backup_dir(prev).exists());

    match synced_label {
        None => {
            info!("hot standby {standby}: full materialization of {label}");
            std::fs::create_dir_all(standby).map_err(|e| Error::io(standby, e))?;
            combine_chain(repo, &chain, standby, key, workspace)?;
        }
        Some(prev_label) => {
            let prev_manifest =
                Manifest::load(&repo.backup_dir(&prev_label).join(MANIFEST_FILE))?;
            let diff = prev_manifest.diff(&manifest);
            if diff.is_empty() {
                debug!("hot standby {standby}: already current");
            } else {
                info!(
                    "hot standby {standby}: {} added, {} changed, {} deleted",
                    diff.added.len(),
                    diff.changed.len(),
                    diff.deleted.len()
                );
            }
            for gone in &diff.deleted {
                let path = standby.join(gone);
                if path.exists() {
                    std::fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
                }
            }
            for rel_path in diff.added.iter().chain(&diff.changed) {
                let content = reconstruct_file(repo, &chain, rel_path, key, workspace)?
                    .ok_or_else(|| {
                        Error::NotFound(format!("file {rel_path} in backup chain"))
                    })?;
                let dest = standby.join(rel_path);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
                }
                std::fs::write(&dest, content).map_err(|e| Error::io(&dest, e))?;
            }
        }
    }

    if let Some(overrides) = overrides {
        let auto_conf = standby.join("postgresql.auto.conf");
        let mut text = std::fs::read_to_string(&auto_conf).unwrap_or_default();
        for line in overrides.lines() {
            if !text.contains(line) {
                text.push_str(line);
                text.push('\n');
            }
        }
        std::fs::write(&auto_conf, text).map_err(|e| Error::io(&auto_conf, e))?;
    }

    std::fs::write(&marker, format!("{label}\n")).map_err(|e| Error::io(&marker, e))?;
    Ok(())
}

impl Stage for HotStandbyStage {
    fn name(&self) -> &'static str {
        "hot_standby"
    }

    fn execute(&mut self, ctx: &mut WorkflowContext) -> Result<()> {
        let server_name = ctx.get_str(Tag::ServerId).unwrap_or_default().to_string();
        let server = ctx.config.server(&server_name)?;
        let Some(dirs) = server.hot_standby.clone() else {
            return Ok(());
        };
        let label = ctx
            .backup()
            .map(|b| b.label.clone())
            .or_else(|| ctx.get_str(Tag::Label).map(String::from))
            .ok_or_else(|| Error::Config("hot standby sync without a backup label".into()))?;
        let key = ctx.config.encryption_key_bytes();
        let workspace = ctx.config.workspace_dir();
        let overrides = server.hot_standby_overrides.clone();

        for dir in &dirs {
            sync_one(
                &ctx.repo,
                &label,
                dir,
                overrides.as_deref(),
                key.as_deref(),
                &workspace,
            )?;
        }
        Ok(())
    }
}
