//! The backup workflow: lock, probe, (incremental planning,) base
//! backup, manifest, link, finalize.
//!
//! `backup.info` is created when the probe succeeds and rewritten at
//! every stage boundary; a failure anywhere leaves it with the invalid
//! status and the data directory in place for diagnostics. File copies
//! fan out over the worker pool; each task owns its paths and reports
//! through the pool's outcome flag plus a shared result collector.

use std::sync::Arc;
use std::time::Instant;

use camino::Utf8PathBuf;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::*;
use utils::lsn::Lsn;

use postgres_ffi::relfile_utils::parse_relfilename;
use postgres_ffi::xlog_utils::xlog_file_name;
use postgres_ffi::{RELSEG_SIZE, WAL_SEGMENT_SIZE};

use crate::brt::{BlockRefTable, RelForkKey, BLOCKS_PER_READ};
use crate::config::{CompressionCodec, EncryptionConfig, HashAlgorithm};
use crate::error::{Error, Result};
use crate::info::{BackupInfo, BackupStatus};
use crate::manifest::{ContentHasher, Manifest, MANIFEST_FILE};
use crate::repository::{Repository, ServerOp, ServerOpGuard, LABEL_FORMAT};
use crate::source::BackupSource;
use crate::sparse::{incremental_name, relation_location, SparseFile};
use crate::streamer::{Streamer, StreamerMode};
use crate::summarizer::WalSummarizer;
use crate::workers::WorkerPool;
use crate::workflow::{Stage, Tag, Workflow, WorkflowContext};

pub type SharedSource = Arc<Mutex<Box<dyn BackupSource + Send>>>;

/// Per-backup byte and time accounting shared by the copy tasks.
#[derive(Default)]
struct CopyTotals {
    backup_size: u64,
    restore_size: u64,
    compression_seconds: f64,
    encryption_seconds: f64,
}

/// Acquires the server's mutating-operation flag for the lifetime of
/// the workflow.
pub struct LockStage {
    op: ServerOp,
    guard: Option<ServerOpGuard>,
}

impl LockStage {
    pub fn new(op: ServerOp) -> LockStage {
        LockStage { op, guard: None }
    }
}

impl Stage for LockStage {
    fn name(&self) -> &'static str {
        "lock"
    }

    fn setup(&mut self, ctx: &mut WorkflowContext) -> Result<()> {
        self.guard = Some(ctx.repo.acquire_op(self.op)?);
        Ok(())
    }

    fn execute(&mut self, _ctx: &mut WorkflowContext) -> Result<()> {
        Ok(())
    }

    fn teardown(&mut self, _ctx: &mut WorkflowContext) -> Result<()> {
        self.guard.take();
        Ok(())
    }
}

/// Probes the server and creates the backup record.
pub struct ProbeStage {
    source: SharedSource,
}

impl ProbeStage {
    pub fn new(source: SharedSource) -> ProbeStage {
        ProbeStage { source }
    }
}

impl Stage for ProbeStage {
    fn name(&self) -> &'static str {
        "probe"
    }

    fn execute(&mut self, ctx: &mut WorkflowContext) -> Result<()> {
        let probe = self.source.lock().probe()?;
        let label = ctx
            .get_str(Tag::Label)
            .ok_or_else(|| Error::Config("workflow context has no label".into()))?
            .to_string();

        let backup_dir = ctx.repo.backup_dir(&label);
        let data_dir = ctx.repo.backup_data_dir(&label);
        std::fs::create_dir_all(&data_dir).map_err(|e| Error::io(&data_dir, e))?;

        let mut info = BackupInfo::new(&label);
        info.status = BackupStatus::InProgress;
        info.major_version = probe.major_version;
        info.minor_version = probe.minor_version;
        info.start_timeline = probe.timeline;
        info.end_timeline = probe.timeline;
        info.checkpoint_lsn = probe.checkpoint_lsn;
        info.compression = ctx.config.compression.codec.as_str().to_string();
        info.encryption = ctx.config.encryption.as_str().to_string();
        info.hash_algorithm = ctx.config.hash_algorithm.as_str().to_string();
        info.tablespaces = probe.tablespaces.clone();
        info.save(&backup_dir)?;

        ctx.set_bool(Tag::Primary, probe.is_primary);
        ctx.set_backup(info);
        info!(
            "backup {label} started on {} (major {}, timeline {})",
            if probe.is_primary { "primary" } else { "standby" },
            probe.major_version,
            probe.timeline
        );
        Ok(())
    }

    fn teardown(&mut self, ctx: &mut WorkflowContext) -> Result<()> {
        // a failed backup keeps its directory but is marked invalid so
        // the next retention sweep removes it
        if ctx.error_code().is_some() {
            if let Some(info) = ctx.backup() {
                let mut info = info.clone();
                info.status = BackupStatus::Invalid;
                let dir = ctx.repo.backup_dir(&info.label);
                if dir.exists() {
                    if let Err(e) = info.save(&dir) {
                        warn!("could not mark backup {} invalid: {e}", info.label);
                    }
                }
            }
        }
        Ok(())
    }
}

/// For incremental backups: resolve and validate the parent.
pub struct IncrementalSetupStage;

impl Stage for IncrementalSetupStage {
    fn name(&self) -> &'static str {
        "incremental_setup"
    }

    fn execute(&mut self, ctx: &mut WorkflowContext) -> Result<()> {
        let parent = ctx
            .repo
            .newest_valid_backup()?
            .ok_or_else(|| Error::NotFound("a valid backup to base the incremental on".into()))?;
        if !parent.is_valid() {
            return Err(Error::NotFound(format!(
                "parent backup {} is not valid",
                parent.label
            )));
        }

        // the WAL (or summaries distilled from it) since the parent
        // must still be around, or modified blocks cannot be computed
        let parent_segment = ctx.repo.wal_dir().join(xlog_file_name(
            parent.start_timeline,
            parent.start_lsn.segment_number(WAL_SEGMENT_SIZE as u64),
            WAL_SEGMENT_SIZE,
        ));
        let summaries_cover = ctx
            .repo
            .list_summaries()?
            .iter()
            .any(|(start, stop)| *start <= parent.start_lsn && parent.start_lsn < *stop);
        if !parent_segment.exists() && !summaries_cover {
            return Err(Error::NotFound(format!(
                "WAL since parent backup {} (no segment {parent_segment}, no summary)",
                parent.label
            )));
        }

        ctx.set_str(Tag::IncrementalLabel, parent.label.clone());
        ctx.set_str(
            Tag::IncrementalBase,
            ctx.repo.backup_dir(&parent.label).as_str().to_string(),
        );
        if let Some(info) = ctx.backup_mut() {
            info.parent_label = Some(parent.label.clone());
        }
        let label = ctx.backup().expect("backup present").label.clone();
        ctx.backup()
            .expect("backup present")
            .save(&ctx.repo.backup_dir(&label))?;
        info!("incremental backup based on {}", parent.label);
        Ok(())
    }
}

/// Streams the cluster's files into the repository.
pub struct BaseBackupStage {
    source: SharedSource,
    incremental: bool,
}

impl BaseBackupStage {
    pub fn new(source: SharedSource, incremental: bool) -> BaseBackupStage {
        BaseBackupStage {
            source,
            incremental,
        }
    }

    /// The block reference table covering `[parent_start, start)`,
    /// taken from stored summaries when they cover the range and
    /// otherwise distilled from the WAL (and stored for next time).
    fn modified_blocks(
        &self,
        ctx: &WorkflowContext,
        parent_start: Lsn,
        start: Lsn,
        timeline: u32,
        pg_version: u32,
    ) -> Result<BlockRefTable> {
        match ctx.repo.load_summary_range(parent_start, start) {
            Ok(brt) => return Ok(brt),
            Err(Error::Truncated { .. }) => {}
            Err(e) => return Err(e),
        }
        let brt = WalSummarizer::new(pg_version, timeline, WAL_SEGMENT_SIZE).summarize(
            &ctx.repo.wal_dir(),
            parent_start,
            start,
        )?;
        ctx.repo.write_summary(&brt, parent_start, start)?;
        Ok(brt)
    }
}

/// How one source file is stored.
enum CopyPlan {
    Full,
    Sparse(Vec<u32>),
}

fn plan_for_file(rel_path: &str, brt: &BlockRefTable) -> CopyPlan {
    let Some((spc_oid, db_oid, file_name)) = relation_location(rel_path) else {
        return CopyPlan::Full;
    };
    let Some((rel_number, fork, segno)) = parse_relfilename(file_name) else {
        return CopyPlan::Full;
    };
    let key = RelForkKey::new(spc_oid, db_oid, rel_number, fork);
    let Some(entry) = brt.get_entry(key) else {
        // untouched since the parent: store a zero-block marker so the
        // file's existence is still recorded
        return CopyPlan::Sparse(Vec::new());
    };
    if entry.limit_block() == Some(0) {
        // created or dropped inside the range: only a full copy is safe
        return CopyPlan::Full;
    }
    let seg_base = segno * RELSEG_SIZE;
    let seg_end = seg_base + RELSEG_SIZE;
    let mut blocks = Vec::new();
    let mut cursor = seg_base;
    let mut batch = Vec::with_capacity(BLOCKS_PER_READ);
    loop {
        let n = entry
            .get_blocks(cursor, seg_end, &mut batch)
            .expect("valid range");
        if n == 0 {
            break;
        }
        blocks.extend(batch.iter().map(|&b| b - seg_base));
        cursor = batch[n - 1] + 1;
        if cursor >= seg_end {
            break;
        }
    }
    CopyPlan::Sparse(blocks)
}

/// Copy one file verbatim through the backup pipeline; returns the
/// logical content hash and the stored size.
fn copy_full_task(
    src: &Utf8PathBuf,
    dest: &Utf8PathBuf,
    compression: CompressionCodec,
    encryption: EncryptionConfig,
    key: Option<&[u8]>,
    algorithm: HashAlgorithm,
) -> Result<(String, u64, u64, f64, f64)> {
    use std::io::Read;

    let mut streamer = Streamer::new(StreamerMode::Backup, compression, encryption, key)?;
    streamer.add_destination(dest)?;

    let mut input = std::fs::File::open(src).map_err(|e| Error::io(src, e))?;
    let mut hasher = ContentHasher::new(algorithm);
    let mut buf = vec![0u8; 64 * 1024];
    let mut source_size = 0u64;
    loop {
        let n = input.read(&mut buf).map_err(|e| Error::io(src, e))?;
        if n == 0 {
            streamer.write(&[], true)?;
            break;
        }
        hasher.update(&buf[..n]);
        source_size += n as u64;
        streamer.write(&buf[..n], false)?;
    }
    Ok((
        hasher.finish(),
        streamer.bytes_written(),
        source_size,
        streamer.compression_elapsed().as_secs_f64(),
        streamer.encryption_elapsed().as_secs_f64(),
    ))
}

/// Store the modified blocks of one relation file; the hash still
/// covers the whole logical content.
fn copy_sparse_task(
    src: &Utf8PathBuf,
    dest: &Utf8PathBuf,
    blocks: Vec<u32>,
    compression: CompressionCodec,
    encryption: EncryptionConfig,
    key: Option<&[u8]>,
    algorithm: HashAlgorithm,
) -> Result<(String, u64, u64, f64, f64)> {
    let bytes = std::fs::read(src).map_err(|e| Error::io(src, e))?;
    let hash = Manifest::hash_bytes(algorithm, &bytes);
    let sparse = SparseFile::from_bytes(&bytes, blocks);
    let encoded = sparse.encode();

    let mut streamer = Streamer::new(StreamerMode::Backup, compression, encryption, key)?;
    streamer.add_destination(dest)?;
    streamer.write(&encoded, true)?;
    Ok((
        hash,
        streamer.bytes_written(),
        bytes.len() as u64,
        streamer.compression_elapsed().as_secs_f64(),
        streamer.encryption_elapsed().as_secs_f64(),
    ))
}

impl Stage for BaseBackupStage {
    fn name(&self) -> &'static str {
        "basebackup"
    }

    fn execute(&mut self, ctx: &mut WorkflowContext) -> Result<()> {
        let started = Instant::now();
        let label = ctx.backup().expect("probe ran").label.clone();
        let backup_dir = ctx.repo.backup_dir(&label);
        let data_dir = ctx.repo.backup_data_dir(&label);

        let position = self.source.lock().begin_backup(&label)?;
        {
            let info = ctx.backup_mut().expect("probe ran");
            info.start_lsn = position.start_lsn;
            info.checkpoint_lsn = position.checkpoint_lsn;
            info.start_timeline = position.timeline;
            info.wal = xlog_file_name(
                position.timeline,
                position.start_lsn.segment_number(WAL_SEGMENT_SIZE as u64),
                WAL_SEGMENT_SIZE,
            );
            info.save(&backup_dir)?;
        }
        ctx.set_lsn(Tag::StartLsn, position.start_lsn);

        // incremental: work out which blocks changed since the parent
        let brt = if self.incremental {
            let parent_label = ctx
                .get_str(Tag::IncrementalLabel)
                .ok_or_else(|| Error::Config("incremental backup without parent".into()))?
                .to_string();
            let parent = ctx.repo.load_backup(&parent_label)?;
            let pg_version = ctx.backup().expect("probe ran").major_version;
            Some(self.modified_blocks(
                ctx,
                parent.start_lsn,
                position.start_lsn,
                position.timeline,
                pg_version,
            )?)
        } else {
            None
        };

        let files = self.source.lock().list_files()?;
        let source_root = self.source.lock().data_root().to_path_buf();

        let server_config = ctx
            .config
            .server(ctx.get_str(Tag::ServerId).unwrap_or_default())?;
        let pool = WorkerPool::new(ctx.config.worker_count(server_config));

        let compression = ctx.config.compression.codec;
        let encryption = ctx.config.encryption;
        let enc_key = ctx.config.encryption_key_bytes();
        let algorithm = ctx.config.hash_algorithm;

        let manifest: Arc<Mutex<Manifest>> = Arc::new(Mutex::new(Manifest::new()));
        let totals: Arc<Mutex<CopyTotals>> = Arc::new(Mutex::new(CopyTotals::default()));

        for file in &files {
            let plan = match &brt {
                Some(brt) => plan_for_file(&file.relative_path, brt),
                None => CopyPlan::Full,
            };
            let rel_path = file.relative_path.clone();
            let src = source_root.join(&rel_path);
            let stored_rel = match &plan {
                CopyPlan::Full => {
                    Streamer::backup_file_name(&rel_path, compression, encryption)
                }
                CopyPlan::Sparse(_) => Streamer::backup_file_name(
                    &incremental_name(&rel_path),
                    compression,
                    encryption,
                ),
            };
            let dest = data_dir.join(&stored_rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }

            let manifest = Arc::clone(&manifest);
            let totals = Arc::clone(&totals);
            let enc_key = enc_key.clone();
            pool.submit(move || {
                let result = match plan {
                    CopyPlan::Full => copy_full_task(
                        &src,
                        &dest,
                        compression,
                        encryption,
                        enc_key.as_deref(),
                        algorithm,
                    ),
                    CopyPlan::Sparse(blocks) => copy_sparse_task(
                        &src,
                        &dest,
                        blocks,
                        compression,
                        encryption,
                        enc_key.as_deref(),
                        algorithm,
                    ),
                };
                let (hash, stored, source_size, comp_secs, enc_secs) = result?;
                manifest.lock().add(rel_path, hash);
                let mut totals = totals.lock();
                totals.backup_size += stored;
                totals.restore_size += source_size;
                totals.compression_seconds += comp_secs;
                totals.encryption_seconds += enc_secs;
                Ok(())
            });
        }

        if !pool.wait() {
            return Err(Error::io(
                &data_dir,
                std::io::Error::new(std::io::ErrorKind::Other, "one or more file copies failed"),
            ));
        }

        let (stop_lsn, end_timeline) = self.source.lock().end_backup()?;
        ctx.set_lsn(Tag::StopLsn, stop_lsn);

        let totals = Arc::try_unwrap(totals)
            .ok()
            .expect("no task holds the totals after wait")
            .into_inner();
        {
            let info = ctx.backup_mut().expect("probe ran");
            info.end_lsn = stop_lsn;
            info.end_timeline = end_timeline;
            info.backup_size = totals.backup_size;
            info.restore_size = totals.restore_size;
            info.basebackup_elapsed = started.elapsed().as_secs_f64();
            info.encryption_elapsed += totals.encryption_seconds;
            let codec = compression.as_str().to_string();
            info.record_compression_elapsed(&codec, totals.compression_seconds);
            info.save(&backup_dir)?;
        }

        let manifest = Arc::try_unwrap(manifest)
            .ok()
            .expect("no task holds the manifest after wait")
            .into_inner();
        ctx.set_manifest(manifest);
        info!(
            "streamed {} files ({} bytes stored) for backup {label}",
            files.len(),
            totals.backup_size
        );
        Ok(())
    }
}

/// Writes the local CSV manifest.
pub struct ManifestStage;

impl Stage for ManifestStage {
    fn name(&self) -> &'static str {
        "manifest"
    }

    fn execute(&mut self, ctx: &mut WorkflowContext) -> Result<()> {
        let started = Instant::now();
        let label = ctx.backup().expect("probe ran").label.clone();
        let backup_dir = ctx.repo.backup_dir(&label);
        let manifest = ctx
            .manifest()
            .ok_or_else(|| Error::Config("no manifest collected".into()))?;
        manifest.write(&backup_dir.join(MANIFEST_FILE))?;
        let info = ctx.backup_mut().expect("probe ran");
        info.manifest_elapsed = started.elapsed().as_secs_f64();
        info.save(&backup_dir)?;
        Ok(())
    }
}

/// Replaces files that are byte-identical to the previous valid backup
/// with hard links into it.
pub struct LinkStage;

impl LinkStage {
    /// The stored file for a logical path, if present: plain or sparse,
    /// with the codec extensions the backup was taken with.
    fn stored_candidate(
        data_dir: &Utf8PathBuf,
        rel_path: &str,
        compression: CompressionCodec,
        encryption: EncryptionConfig,
    ) -> Option<Utf8PathBuf> {
        let full = data_dir.join(Streamer::backup_file_name(rel_path, compression, encryption));
        if full.exists() {
            return Some(full);
        }
        let sparse = data_dir.join(Streamer::backup_file_name(
            &incremental_name(rel_path),
            compression,
            encryption,
        ));
        sparse.exists().then_some(sparse)
    }
}

impl Stage for LinkStage {
    fn name(&self) -> &'static str {
        "link"
    }

    fn execute(&mut self, ctx: &mut WorkflowContext) -> Result<()> {
        let started = Instant::now();
        let label = ctx.backup().expect("probe ran").label.clone();
        let Some(previous) = ctx.repo.newest_valid_backup()? else {
            return Ok(());
        };
        let prev_manifest =
            match Manifest::load(&ctx.repo.backup_dir(&previous.label).join(MANIFEST_FILE)) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!("no usable manifest in {}: {e}; skipping linking", previous.label);
                    return Ok(());
                }
            };
        let manifest = ctx
            .manifest()
            .ok_or_else(|| Error::Config("no manifest collected".into()))?;

        let our_data = ctx.repo.backup_data_dir(&label);
        let prev_data = ctx.repo.backup_data_dir(&previous.label);
        let compression = ctx.config.compression.codec;
        let encryption = ctx.config.encryption;

        let mut linked = 0usize;
        for (rel_path, hash) in manifest.iter() {
            if prev_manifest.hash_of(rel_path) != Some(hash) {
                continue;
            }
            let Some(ours) =
                Self::stored_candidate(&our_data, rel_path, compression, encryption)
            else {
                continue;
            };
            let Some(theirs) =
                Self::stored_candidate(&prev_data, rel_path, compression, encryption)
            else {
                continue;
            };
            // identical logical content stored the same way yields
            // identical bytes, so the copies can be folded together
            if ours.file_name() != theirs.file_name() {
                continue;
            }
            std::fs::remove_file(&ours).map_err(|e| Error::io(&ours, e))?;
            std::fs::hard_link(&theirs, &ours).map_err(|e| Error::io(&ours, e))?;
            linked += 1;
        }

        let backup_dir = ctx.repo.backup_dir(&label);
        let info = ctx.backup_mut().expect("probe ran");
        info.linking_elapsed = started.elapsed().as_secs_f64();
        info.save(&backup_dir)?;
        if linked > 0 {
            info!("linked {linked} unchanged files to backup {}", previous.label);
        }
        Ok(())
    }
}

/// Marks the backup valid.
pub struct FinalizeStage {
    started: Instant,
}

impl FinalizeStage {
    pub fn new() -> FinalizeStage {
        FinalizeStage {
            started: Instant::now(),
        }
    }
}

impl Default for FinalizeStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for FinalizeStage {
    fn name(&self) -> &'static str {
        "finalize"
    }

    fn execute(&mut self, ctx: &mut WorkflowContext) -> Result<()> {
        let label = ctx.backup().expect("probe ran").label.clone();
        let backup_dir = ctx.repo.backup_dir(&label);
        let info = ctx.backup_mut().expect("probe ran");
        info.status = BackupStatus::Valid;
        info.elapsed = self.started.elapsed().as_secs_f64();
        info.save(&backup_dir)?;
        info!("backup {label} is valid");
        Ok(())
    }
}

/// Assemble and run a backup workflow. Returns the new backup's label.
pub fn run_backup(
    config: &crate::config::Config,
    server_name: &str,
    source: Box<dyn BackupSource + Send>,
    incremental: bool,
) -> Result<String> {
    config.server(server_name)?;
    let repo = Repository::new(&config.base_dir, server_name);
    repo.ensure_layout()?;

    // labels are second-resolution timestamps; step forward if a backup
    // with this label already exists
    let mut when = Utc::now().naive_utc();
    let mut label = when.format(LABEL_FORMAT).to_string();
    while repo.backup_dir(&label).exists() {
        when = when + chrono::Duration::seconds(1);
        label = when.format(LABEL_FORMAT).to_string();
    }
    let source: SharedSource = Arc::new(Mutex::new(source));

    let mut ctx = WorkflowContext::new(config, repo);
    ctx.set_str(Tag::ServerId, server_name);
    ctx.set_str(Tag::Label, label.clone());
    ctx.set_str(
        Tag::BackupBase,
        ctx.repo.backup_dir(&label).as_str().to_string(),
    );
    ctx.set_str(
        Tag::BackupData,
        ctx.repo.backup_data_dir(&label).as_str().to_string(),
    );

    let mut stages: Vec<Box<dyn Stage>> = vec![
        Box::new(LockStage::new(ServerOp::Backup)),
        Box::new(ProbeStage::new(Arc::clone(&source))),
    ];
    if incremental {
        stages.push(Box::new(IncrementalSetupStage));
    }
    stages.push(Box::new(BaseBackupStage::new(
        Arc::clone(&source),
        incremental,
    )));
    stages.push(Box::new(ManifestStage));
    stages.push(Box::new(LinkStage));
    stages.push(Box::new(FinalizeStage::new()));
    if config
        .server(server_name)?
        .hot_standby
        .as_ref()
        .is_some_and(|dirs| !dirs.is_empty())
    {
        stages.push(Box::new(crate::workflow::hot_standby::HotStandbyStage));
    }

    Workflow::new(stages).run(&mut ctx)?;
    Ok(label)
}
