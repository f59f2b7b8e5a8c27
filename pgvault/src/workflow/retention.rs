//! The retention sweep: delete backups whose age exceeds every enabled
//! retention tier, plus the leftovers of failed backups.

use chrono::Utc;
use tracing::*;

use crate::error::Result;
use crate::repository::{BackupCatalog, Repository, ServerOp};
use crate::workflow::backup::LockStage;
use crate::workflow::delete::delete_backup;
use crate::workflow::{Stage, Tag, Workflow, WorkflowContext};

pub struct RetentionStage;

impl Stage for RetentionStage {
    fn name(&self) -> &'static str {
        "retention"
    }

    fn execute(&mut self, ctx: &mut WorkflowContext) -> Result<()> {
        let server_name = ctx.get_str(Tag::ServerId).unwrap_or_default().to_string();
        let server = ctx.config.server(&server_name)?;
        let policy = ctx.config.retention_for(server);

        // one snapshot of the backup list for the whole sweep
        let catalog = BackupCatalog::snapshot(&ctx.repo)?;
        let candidates = catalog.retention_candidates(policy, Utc::now().naive_utc());
        if candidates.is_empty() {
            debug!("retention sweep found nothing to delete");
            return Ok(());
        }
        info!(
            "retention sweep will delete {} backups: {candidates:?}",
            candidates.len()
        );

        let workspace = ctx.config.workspace_dir();
        let key = ctx.config.encryption_key_bytes();
        // candidates are sorted oldest first; delete in chronological
        // order so rollups cascade forward
        for label in candidates {
            if ctx.cancelled() {
                break;
            }
            delete_backup(&ctx.repo, &workspace, key.as_deref(), &label)?;
        }
        Ok(())
    }
}

/// Assemble and run a retention workflow.
pub fn run_retention(config: &crate::config::Config, server_name: &str) -> Result<()> {
    config.server(server_name)?;
    let repo = Repository::new(&config.base_dir, server_name);
    let mut ctx = WorkflowContext::new(config, repo);
    ctx.set_str(Tag::ServerId, server_name);
    Workflow::new(vec![
        Box::new(LockStage::new(ServerOp::Delete)),
        Box::new(RetentionStage),
    ])
    .run(&mut ctx)
}
