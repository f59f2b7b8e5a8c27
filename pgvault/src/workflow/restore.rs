//! The restore workflow: resolve a backup, materialize it (combining
//! incremental chains), stage the WAL it needs, and write the recovery
//! configuration. A failed restore removes the target directory.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;
use utils::lsn::Lsn;

use postgres_ffi::xlog_utils::xlog_file_name;
use postgres_ffi::WAL_SEGMENT_SIZE;

use crate::error::{Error, Result};
use crate::repository::{BackupIdentifier, BackupReadGuard, Repository, ServerOp};
use crate::workflow::backup::LockStage;
use crate::workflow::combine::combine_chain;
use crate::workflow::{Stage, Tag, Workflow, WorkflowContext};

/// Point-in-time recovery target written into the restored cluster's
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryTarget {
    Lsn(Lsn),
    Time(String),
    Timeline(u32),
}

impl RecoveryTarget {
    /// Parse `target-lsn:X/Y`, `target-time:YYYY-MM-DD HH:MM:SS` or
    /// `target-tli:N`; None for anything else.
    pub fn parse(s: &str) -> Option<Result<RecoveryTarget>> {
        if let Some(rest) = s.strip_prefix("target-lsn:") {
            return Some(
                rest.parse::<Lsn>()
                    .map(RecoveryTarget::Lsn)
                    .map_err(|_| Error::Config(format!("invalid LSN {rest:?}"))),
            );
        }
        if let Some(rest) = s.strip_prefix("target-time:") {
            return Some(Ok(RecoveryTarget::Time(rest.to_string())));
        }
        if let Some(rest) = s.strip_prefix("target-tli:") {
            return Some(
                rest.parse::<u32>()
                    .map(RecoveryTarget::Timeline)
                    .map_err(|_| Error::Config(format!("invalid timeline {rest:?}"))),
            );
        }
        None
    }

    fn auto_conf_line(&self) -> String {
        match self {
            RecoveryTarget::Lsn(lsn) => format!("recovery_target_lsn = '{lsn}'\n"),
            RecoveryTarget::Time(time) => format!("recovery_target_time = '{time}'\n"),
            RecoveryTarget::Timeline(tli) => format!("recovery_target_timeline = '{tli}'\n"),
        }
    }
}

pub struct RestoreStage {
    identifier: BackupIdentifier,
    target: Utf8PathBuf,
    recovery: Option<RecoveryTarget>,
    read_guards: Vec<BackupReadGuard>,
    restored_label: Option<String>,
}

impl RestoreStage {
    pub fn new(
        identifier: BackupIdentifier,
        target: impl AsRef<Utf8Path>,
        recovery: Option<RecoveryTarget>,
    ) -> RestoreStage {
        RestoreStage {
            identifier,
            target: target.as_ref().to_path_buf(),
            recovery,
            read_guards: Vec::new(),
            restored_label: None,
        }
    }

    /// Copy the WAL segments the restored cluster will replay, from the
    /// backup's start up to the end of what the repository holds for
    /// that timeline.
    fn stage_wal(&self, repo: &Repository, start_lsn: Lsn, timeline: u32) -> Result<usize> {
        let wal_target = self.target.join("pg_wal");
        std::fs::create_dir_all(&wal_target).map_err(|e| Error::io(&wal_target, e))?;
        let mut copied = 0;
        let mut segno = start_lsn.segment_number(WAL_SEGMENT_SIZE as u64);
        loop {
            let name = xlog_file_name(timeline, segno, WAL_SEGMENT_SIZE);
            let source = repo.wal_dir().join(&name);
            if !source.is_file() {
                break;
            }
            std::fs::copy(&source, wal_target.join(&name))
                .map_err(|e| Error::io(&source, e))?;
            copied += 1;
            segno += 1;
        }
        // history files let recovery follow timeline switches
        if let Ok(entries) = std::fs::read_dir(repo.wal_dir()) {
            for entry in entries.flatten() {
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                if postgres_ffi::xlog_utils::is_timeline_history_file_name(&name) {
                    let source = repo.wal_dir().join(&name);
                    std::fs::copy(&source, wal_target.join(&name))
                        .map_err(|e| Error::io(&source, e))?;
                }
            }
        }
        Ok(copied)
    }
}

impl Stage for RestoreStage {
    fn name(&self) -> &'static str {
        "restore"
    }

    fn execute(&mut self, ctx: &mut WorkflowContext) -> Result<()> {
        let backup = ctx.repo.resolve_identifier(&self.identifier)?;
        let chain = ctx.repo.backup_chain(&backup.label)?;
        // deletes must not touch the chain while it is being read
        for link in &chain {
            self.read_guards.push(ctx.repo.acquire_read(&link.label));
        }
        self.restored_label = Some(backup.label.clone());
        info!(
            "restoring backup {} ({} links in the chain) into {}",
            backup.label,
            chain.len(),
            self.target
        );

        std::fs::create_dir_all(&self.target).map_err(|e| Error::io(&self.target, e))?;
        let key = ctx.config.encryption_key_bytes();
        let stats = combine_chain(
            &ctx.repo,
            &chain,
            &self.target,
            key.as_deref(),
            &ctx.config.workspace_dir(),
        )?;

        let copied = self.stage_wal(&ctx.repo, backup.start_lsn, backup.start_timeline)?;
        debug!("staged {copied} WAL segments");

        // recovery configuration
        let signal = self.target.join("recovery.signal");
        std::fs::write(&signal, b"").map_err(|e| Error::io(&signal, e))?;
        if let Some(recovery) = &self.recovery {
            let auto_conf = self.target.join("postgresql.auto.conf");
            let mut text = match std::fs::read_to_string(&auto_conf) {
                Ok(text) => text,
                Err(_) => String::new(),
            };
            text.push_str(&recovery.auto_conf_line());
            std::fs::write(&auto_conf, text).map_err(|e| Error::io(&auto_conf, e))?;
        }

        ctx.set_str(Tag::TargetBase, self.target.as_str().to_string());
        ctx.set_str(Tag::Label, backup.label.clone());
        info!(
            "restored {} files ({} bytes) from backup {}",
            stats.files, stats.bytes, backup.label
        );
        Ok(())
    }

    fn teardown(&mut self, ctx: &mut WorkflowContext) -> Result<()> {
        self.read_guards.clear();
        if ctx.error_code().is_some() && self.target.exists() {
            // a half-written target is useless and unsafe to start
            warn!("removing failed restore target {}", self.target);
            let _ = std::fs::remove_dir_all(&self.target);
        }
        Ok(())
    }
}

/// Assemble and run a restore workflow; returns the restored label.
pub fn run_restore(
    config: &crate::config::Config,
    server_name: &str,
    identifier: &str,
    recovery: Option<&str>,
    target: &Utf8Path,
) -> Result<String> {
    config.server(server_name)?;
    let repo = Repository::new(&config.base_dir, server_name);

    // a target-* identifier doubles as the recovery target
    let recovery_target = match recovery {
        Some(s) => Some(RecoveryTarget::parse(s).ok_or_else(|| {
            Error::Config(format!("invalid recovery target {s:?}"))
        })??),
        None => RecoveryTarget::parse(identifier).transpose()?,
    };
    let identifier: BackupIdentifier = identifier.parse()?;

    let mut ctx = WorkflowContext::new(config, repo);
    ctx.set_str(Tag::ServerId, server_name);
    let mut workflow = Workflow::new(vec![
        Box::new(LockStage::new(ServerOp::Restore)),
        Box::new(RestoreStage::new(identifier, target, recovery_target)),
    ]);
    workflow.run(&mut ctx)?;
    Ok(ctx
        .get_str(Tag::Label)
        .unwrap_or_default()
        .to_string())
}
