//! Verification of a stored backup against its manifest.
//!
//! Every manifest entry is reconstructed to its logical content (full
//! copies decode through the restore pipeline, sparse copies combine
//! over their chain) and re-hashed. The report lists every file or only
//! the failures, as requested.

use tracing::*;

use crate::error::{Error, Result};
use crate::manifest::{Manifest, MANIFEST_FILE};
use crate::repository::{BackupIdentifier, Repository};
use crate::workflow::combine::reconstruct_file;
use crate::workflow::{Stage, Tag, WorkflowContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyScope {
    All,
    Failed,
}

impl std::str::FromStr for VerifyScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<VerifyScope> {
        match s {
            "all" => Ok(VerifyScope::All),
            "failed" => Ok(VerifyScope::Failed),
            _ => Err(Error::Config(format!(
                "verify scope must be 'all' or 'failed', got {s:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifyEntry {
    pub path: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub entries: Vec<VerifyEntry>,
    pub failed: usize,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

pub struct VerifyStage {
    identifier: BackupIdentifier,
    scope: VerifyScope,
    pub report: VerifyReport,
}

impl VerifyStage {
    pub fn new(identifier: BackupIdentifier, scope: VerifyScope) -> VerifyStage {
        VerifyStage {
            identifier,
            scope,
            report: VerifyReport::default(),
        }
    }
}

impl Stage for VerifyStage {
    fn name(&self) -> &'static str {
        "verify"
    }

    fn execute(&mut self, ctx: &mut WorkflowContext) -> Result<()> {
        let backup = ctx.repo.resolve_identifier(&self.identifier)?;
        let _guard = ctx.repo.acquire_read(&backup.label);
        let chain = ctx.repo.backup_chain(&backup.label)?;
        let manifest =
            Manifest::load(&ctx.repo.backup_dir(&backup.label).join(MANIFEST_FILE))?;
        let algorithm = backup.hash_algorithm.parse().map_err(Error::Config)?;
        let key = ctx.config.encryption_key_bytes();
        let workspace = ctx.config.workspace_dir();

        for (rel_path, expected) in manifest.iter() {
            let result =
                reconstruct_file(&ctx.repo, &chain, rel_path, key.as_deref(), &workspace);
            let (ok, detail) = match result {
                Ok(Some(content)) => {
                    let actual = Manifest::hash_bytes(algorithm, &content);
                    if actual == expected {
                        (true, "ok".to_string())
                    } else {
                        (false, format!("hash mismatch: {actual} != {expected}"))
                    }
                }
                Ok(None) => (false, "file missing from backup storage".to_string()),
                Err(e) => (false, e.to_string()),
            };
            if !ok {
                self.report.failed += 1;
                warn!("verify {rel_path}: {detail}");
            }
            if self.scope == VerifyScope::All || !ok {
                self.report.entries.push(VerifyEntry {
                    path: rel_path.to_string(),
                    ok,
                    detail,
                });
            }
        }
        info!(
            "verified backup {}: {} files checked, {} failed",
            backup.label,
            manifest.len(),
            self.report.failed
        );
        ctx.set_str(Tag::Label, backup.label);
        Ok(())
    }
}

/// Assemble and run a verify workflow, returning the report.
pub fn run_verify(
    config: &crate::config::Config,
    server_name: &str,
    identifier: &str,
    scope: VerifyScope,
) -> Result<VerifyReport> {
    config.server(server_name)?;
    let repo = Repository::new(&config.base_dir, server_name);
    let identifier: BackupIdentifier = identifier.parse()?;

    let mut ctx = WorkflowContext::new(config, repo);
    ctx.set_str(Tag::ServerId, server_name);

    // verify only reads, so it does not take the server flag
    let mut stage = VerifyStage::new(identifier, scope);
    stage.setup(&mut ctx)?;
    let result = stage.execute(&mut ctx);
    stage.teardown(&mut ctx)?;
    result?;
    Ok(stage.report)
}
