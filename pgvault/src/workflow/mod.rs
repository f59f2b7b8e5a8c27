//! The workflow engine: an ordered pipeline of stages sharing a typed
//! context.
//!
//! `run` calls `setup` on every stage in order (a failure tears down the
//! already-set-up prefix in reverse), then `execute` in order (the first
//! failure is recorded in the context and breaks the loop), then
//! `teardown` on every stage in reverse order regardless of how
//! execution went. Cancellation is a shared flag observed at stage
//! boundaries; in-flight work finishes.
//!
//! The context is a closed set of tags with a type-checked accessor per
//! tag, backed by the byte-keyed index, plus a shared reference to the
//! immutable configuration and the repository handle.

pub mod backup;
pub mod combine;
pub mod delete;
pub mod hot_standby;
pub mod restore;
pub mod retention;
pub mod verify;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::*;
use utils::art::Art;
use utils::lsn::Lsn;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::info::BackupInfo;
use crate::manifest::Manifest;
use crate::repository::Repository;

/// The closed set of context tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    ServerId,
    Label,
    BackupBase,
    BackupData,
    TargetBase,
    IncrementalLabel,
    IncrementalBase,
    Manifest,
    ErrorCode,
    FailedStage,
    Primary,
    RecoveryInfo,
    CopyWal,
    Backup,
    StartLsn,
    StopLsn,
}

impl Tag {
    fn key(self) -> &'static [u8] {
        match self {
            Tag::ServerId => b"server_id",
            Tag::Label => b"label",
            Tag::BackupBase => b"backup_base",
            Tag::BackupData => b"backup_data",
            Tag::TargetBase => b"target_base",
            Tag::IncrementalLabel => b"incremental_label",
            Tag::IncrementalBase => b"incremental_base",
            Tag::Manifest => b"manifest",
            Tag::ErrorCode => b"error_code",
            Tag::FailedStage => b"failed_stage",
            Tag::Primary => b"primary",
            Tag::RecoveryInfo => b"recovery_info",
            Tag::CopyWal => b"copy_wal",
            Tag::Backup => b"backup",
            Tag::StartLsn => b"start_lsn",
            Tag::StopLsn => b"stop_lsn",
        }
    }
}

/// Values a context slot can hold.
pub enum CtxValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Lsn(Lsn),
    Backup(Box<BackupInfo>),
    Manifest(Box<Manifest>),
}

pub struct WorkflowContext<'a> {
    pub config: &'a Config,
    pub repo: Repository,
    values: Art<CtxValue>,
    cancel: Arc<AtomicBool>,
}

impl<'a> WorkflowContext<'a> {
    pub fn new(config: &'a Config, repo: Repository) -> WorkflowContext<'a> {
        WorkflowContext {
            config,
            repo,
            values: Art::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The flag a caller can set to cancel between stages.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn set(&mut self, tag: Tag, value: CtxValue) {
        self.values.insert(tag.key(), value);
    }

    pub fn get(&self, tag: Tag) -> Option<&CtxValue> {
        self.values.search(tag.key())
    }

    pub fn set_str(&mut self, tag: Tag, value: impl Into<String>) {
        self.set(tag, CtxValue::Str(value.into()));
    }

    pub fn get_str(&self, tag: Tag) -> Option<&str> {
        match self.get(tag) {
            Some(CtxValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn set_bool(&mut self, tag: Tag, value: bool) {
        self.set(tag, CtxValue::Bool(value));
    }

    pub fn get_bool(&self, tag: Tag) -> Option<bool> {
        match self.get(tag) {
            Some(CtxValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn set_lsn(&mut self, tag: Tag, value: Lsn) {
        self.set(tag, CtxValue::Lsn(value));
    }

    pub fn get_lsn(&self, tag: Tag) -> Option<Lsn> {
        match self.get(tag) {
            Some(CtxValue::Lsn(lsn)) => Some(*lsn),
            _ => None,
        }
    }

    pub fn set_backup(&mut self, backup: BackupInfo) {
        self.set(Tag::Backup, CtxValue::Backup(Box::new(backup)));
    }

    pub fn backup(&self) -> Option<&BackupInfo> {
        match self.get(Tag::Backup) {
            Some(CtxValue::Backup(b)) => Some(b),
            _ => None,
        }
    }

    pub fn backup_mut(&mut self) -> Option<&mut BackupInfo> {
        match self.values.search_mut(Tag::Backup.key()) {
            Some(CtxValue::Backup(b)) => Some(b),
            _ => None,
        }
    }

    pub fn set_manifest(&mut self, manifest: Manifest) {
        self.set(Tag::Manifest, CtxValue::Manifest(Box::new(manifest)));
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        match self.get(Tag::Manifest) {
            Some(CtxValue::Manifest(m)) => Some(m),
            _ => None,
        }
    }

    fn record_failure(&mut self, stage: &str, error: &Error) {
        self.set_str(Tag::FailedStage, stage);
        self.set(Tag::ErrorCode, CtxValue::Int(error.exit_code() as i64));
    }

    pub fn error_code(&self) -> Option<i32> {
        match self.get(Tag::ErrorCode) {
            Some(CtxValue::Int(code)) => Some(*code as i32),
            _ => None,
        }
    }

    pub fn failed_stage(&self) -> Option<&str> {
        self.get_str(Tag::FailedStage)
    }
}

/// One step of a workflow.
pub trait Stage {
    fn name(&self) -> &'static str;

    fn setup(&mut self, _ctx: &mut WorkflowContext) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, ctx: &mut WorkflowContext) -> Result<()>;

    fn teardown(&mut self, _ctx: &mut WorkflowContext) -> Result<()> {
        Ok(())
    }
}

/// An ordered pipeline of stages.
pub struct Workflow {
    stages: Vec<Box<dyn Stage>>,
}

impl Workflow {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Workflow {
        Workflow { stages }
    }

    fn teardown_range(&mut self, ctx: &mut WorkflowContext, count: usize) {
        for stage in self.stages[..count].iter_mut().rev() {
            if let Err(e) = stage.teardown(ctx) {
                warn!("teardown of stage {} failed: {e}", stage.name());
            }
        }
    }

    pub fn run(&mut self, ctx: &mut WorkflowContext) -> Result<()> {
        // setup in order; unwind the prefix on the first failure
        let mut set_up = 0;
        for i in 0..self.stages.len() {
            let name = self.stages[i].name();
            debug!("setup: {name}");
            if let Err(e) = self.stages[i].setup(ctx) {
                error!("setup of stage {name} failed: {e}");
                ctx.record_failure(name, &e);
                self.teardown_range(ctx, set_up);
                return Err(e);
            }
            set_up = i + 1;
        }

        // execute in order, stop at the first failure
        let mut failure: Option<Error> = None;
        for i in 0..self.stages.len() {
            let name = self.stages[i].name();
            if ctx.cancelled() {
                info!("workflow cancelled before stage {name}");
                let e = Error::Conflict("workflow cancelled".into());
                ctx.record_failure(name, &e);
                failure = Some(e);
                break;
            }
            debug!("execute: {name}");
            if let Err(e) = self.stages[i].execute(ctx) {
                error!("stage {name} failed: {e}");
                ctx.record_failure(name, &e);
                failure = Some(e);
                break;
            }
        }

        // teardown everything in reverse, success or not
        self.teardown_range(ctx, self.stages.len());

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use std::sync::Mutex;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        journal: Journal,
        fail_in: Option<&'static str>,
    }

    impl Recorder {
        fn log(&self, what: &str) {
            self.journal.lock().unwrap().push(format!("{}:{what}", self.name));
        }

        fn maybe_fail(&self, what: &'static str) -> Result<()> {
            if self.fail_in == Some(what) {
                Err(Error::NotFound(format!("{} {what}", self.name)))
            } else {
                Ok(())
            }
        }
    }

    impl Stage for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }
        fn setup(&mut self, _ctx: &mut WorkflowContext) -> Result<()> {
            self.log("setup");
            self.maybe_fail("setup")
        }
        fn execute(&mut self, _ctx: &mut WorkflowContext) -> Result<()> {
            self.log("execute");
            self.maybe_fail("execute")
        }
        fn teardown(&mut self, _ctx: &mut WorkflowContext) -> Result<()> {
            self.log("teardown");
            Ok(())
        }
    }

    fn harness() -> (camino_tempfile::Utf8TempDir, Config, Repository) {
        let dir = tempdir().unwrap();
        let config =
            Config::parse(&format!("base_dir = \"{}\"\n", dir.path())).unwrap();
        let repo = Repository::new(dir.path(), "test");
        (dir, config, repo)
    }

    fn recorder(name: &'static str, journal: &Journal, fail_in: Option<&'static str>) -> Box<Recorder> {
        Box::new(Recorder {
            name,
            journal: Arc::clone(journal),
            fail_in,
        })
    }

    #[test]
    fn stages_run_in_order_teardown_reversed() {
        let (_dir, config, repo) = harness();
        let journal: Journal = Default::default();
        let mut wf = Workflow::new(vec![
            recorder("a", &journal, None),
            recorder("b", &journal, None),
        ]);
        let mut ctx = WorkflowContext::new(&config, repo);
        wf.run(&mut ctx).unwrap();
        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "a:setup", "b:setup", "a:execute", "b:execute", "b:teardown", "a:teardown"
            ]
        );
        assert_eq!(ctx.error_code(), None);
    }

    #[test]
    fn execute_failure_still_tears_down_everything() {
        let (_dir, config, repo) = harness();
        let journal: Journal = Default::default();
        let mut wf = Workflow::new(vec![
            recorder("a", &journal, None),
            recorder("b", &journal, Some("execute")),
            recorder("c", &journal, None),
        ]);
        let mut ctx = WorkflowContext::new(&config, repo);
        assert!(wf.run(&mut ctx).is_err());
        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "a:setup", "b:setup", "c:setup", "a:execute", "b:execute", "c:teardown",
                "b:teardown", "a:teardown"
            ]
        );
        assert_eq!(ctx.failed_stage(), Some("b"));
        assert_eq!(ctx.error_code(), Some(1));
    }

    #[test]
    fn setup_failure_unwinds_only_the_prefix() {
        let (_dir, config, repo) = harness();
        let journal: Journal = Default::default();
        let mut wf = Workflow::new(vec![
            recorder("a", &journal, None),
            recorder("b", &journal, Some("setup")),
            recorder("c", &journal, None),
        ]);
        let mut ctx = WorkflowContext::new(&config, repo);
        assert!(wf.run(&mut ctx).is_err());
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["a:setup", "b:setup", "a:teardown"]
        );
    }

    #[test]
    fn cancellation_is_observed_between_stages() {
        struct CancelNext {
            journal: Journal,
            flag: Arc<AtomicBool>,
        }
        impl Stage for CancelNext {
            fn name(&self) -> &'static str {
                "cancel_next"
            }
            fn execute(&mut self, _ctx: &mut WorkflowContext) -> Result<()> {
                self.journal.lock().unwrap().push("cancel_next:execute".into());
                self.flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let (_dir, config, repo) = harness();
        let journal: Journal = Default::default();
        let mut ctx = WorkflowContext::new(&config, repo);
        let mut wf = Workflow::new(vec![
            Box::new(CancelNext {
                journal: Arc::clone(&journal),
                flag: ctx.cancel_flag(),
            }),
            recorder("late", &journal, None),
        ]);
        let err = wf.run(&mut ctx).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        // "late" never executed, but its teardown ran
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["cancel_next:execute", "late:teardown"]
        );
    }

    #[test]
    fn context_typed_accessors() {
        let (_dir, config, repo) = harness();
        let mut ctx = WorkflowContext::new(&config, repo);
        ctx.set_str(Tag::Label, "20250101000000");
        ctx.set_bool(Tag::Primary, true);
        ctx.set_lsn(Tag::StartLsn, Lsn(0x1000));
        assert_eq!(ctx.get_str(Tag::Label), Some("20250101000000"));
        assert_eq!(ctx.get_bool(Tag::Primary), Some(true));
        assert_eq!(ctx.get_lsn(Tag::StartLsn), Some(Lsn(0x1000)));
        // a tag holds one type at a time; asking with the wrong accessor
        // yields None rather than a panic
        assert_eq!(ctx.get_bool(Tag::Label), None);
        assert_eq!(ctx.get_str(Tag::ServerId), None);
    }
}
