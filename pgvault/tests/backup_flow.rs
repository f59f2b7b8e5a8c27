//! End-to-end backup pipeline tests against a synthetic cluster:
//! full backup, incremental chain over crafted WAL, combine, delete
//! with rollup, verify.

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::tempdir;
use utils::lsn::Lsn;

use postgres_ffi::controlfile::{ControlFileCommon, ControlFileData, DbState};
use postgres_ffi::pg_constants::{RM_HEAP_ID, RM_XLOG_ID, XLOG_NOOP};
use postgres_ffi::WAL_SEGMENT_SIZE;
use wal_decoder::craft::{build_record, SegmentBuilder};

use pgvault::config::Config;
use pgvault::error::Error;
use pgvault::info::BackupStatus;
use pgvault::manifest::Manifest;
use pgvault::repository::Repository;
use pgvault::source::LocalClusterSource;
use pgvault::workflow::backup::run_backup;
use pgvault::workflow::combine::combine_chain;
use pgvault::workflow::delete::run_delete;
use pgvault::workflow::restore::run_restore;
use pgvault::workflow::verify::{run_verify, VerifyScope};

const PAGE: usize = 8192;
const SYSID: u64 = 0xABCD_EF01_2345_6789;

fn page(fill: u8) -> Vec<u8> {
    let mut p = vec![fill; PAGE];
    p[0] = 0x5A; // something non-uniform
    p
}

fn write_control(data_dir: &Utf8Path, redo: Lsn, timeline: u32) {
    let control = ControlFileData::V17(ControlFileCommon {
        system_identifier: SYSID,
        pg_control_version: 1700,
        catalog_version_no: 202407111,
        state: DbState::InProduction,
        checkpoint: redo,
        redo,
        timeline_id: timeline,
        prev_timeline_id: 1,
        next_oid: 24576,
    });
    std::fs::create_dir_all(data_dir.join("global")).unwrap();
    std::fs::write(data_dir.join("global/pg_control"), control.encode()).unwrap();
}

fn make_cluster(data_dir: &Utf8Path) {
    std::fs::create_dir_all(data_dir.join("base/5")).unwrap();
    std::fs::create_dir_all(data_dir.join("pg_wal")).unwrap();
    std::fs::write(
        data_dir.join("base/5/16384"),
        [page(0x01), page(0x02), page(0x03), page(0x04)].concat(),
    )
    .unwrap();
    std::fs::write(data_dir.join("base/5/16385"), [page(0x11), page(0x12)].concat()).unwrap();
    std::fs::write(data_dir.join("PG_VERSION"), b"17\n").unwrap();
}

fn set_page(data_dir: &Utf8Path, rel: &str, blkno: usize, fill: u8) {
    let path = data_dir.join(rel);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[blkno * PAGE..(blkno + 1) * PAGE].copy_from_slice(&page(fill));
    std::fs::write(&path, bytes).unwrap();
}

fn heap_record(rel: u32, blkno: u32, xid: u32) -> bytes::Bytes {
    build_record(RM_HEAP_ID, 0, xid, &[(1663, 5, rel, 0, blkno)], b"tuple data")
}

fn noop_record(xid: u32) -> bytes::Bytes {
    build_record(RM_XLOG_ID, XLOG_NOOP, xid, &[], b"checkpointish")
}

struct Harness {
    _dir: camino_tempfile::Utf8TempDir,
    config: Config,
    data_dir: Utf8PathBuf,
    repo: Repository,
    /// The per-server operation flag is process-global, so every test
    /// gets its own server name.
    server: &'static str,
}

fn harness(compression: &str, server: &'static str) -> Harness {
    let dir = tempdir().unwrap();
    let base = dir.path().join("repo");
    let data_dir = dir.path().join("pgdata");
    make_cluster(&data_dir);
    let config = Config::parse(&format!(
        "base_dir = \"{base}\"\n\
         compression = \"{compression}\"\n\
         hash_algorithm = \"sha-256\"\n\
         [servers.{server}]\n\
         data_dir = \"{data_dir}\"\n"
    ))
    .unwrap();
    let repo = Repository::new(&base, server);
    Harness {
        _dir: dir,
        config,
        data_dir,
        repo,
        server,
    }
}

fn take_backup(h: &Harness, incremental: bool) -> String {
    let source = LocalClusterSource::new(&h.data_dir, Some(17));
    run_backup(&h.config, h.server, Box::new(source), incremental).unwrap()
}

fn combine_newest(h: &Harness) -> Utf8PathBuf {
    let backup = h
        .repo
        .resolve_identifier(&"newest".parse().unwrap())
        .unwrap();
    let chain = h.repo.backup_chain(&backup.label).unwrap();
    let target = h._dir.path().join(format!("combined-{}", backup.label));
    std::fs::create_dir_all(&target).unwrap();
    combine_chain(
        &h.repo,
        &chain,
        &target,
        None,
        &h.config.workspace_dir(),
    )
    .unwrap();
    target
}

fn assert_matches_cluster(h: &Harness, materialized: &Utf8Path) {
    for rel in ["base/5/16384", "base/5/16385", "PG_VERSION", "global/pg_control"] {
        assert_eq!(
            std::fs::read(materialized.join(rel)).unwrap(),
            std::fs::read(h.data_dir.join(rel)).unwrap(),
            "{rel} differs after combine"
        );
    }
}

#[test]
fn full_backup_then_restore() {
    let h = harness("zstd", "alpha");

    // craft a little WAL so restore has something to stage
    let mut wal = SegmentBuilder::new(17, 1, SYSID, WAL_SEGMENT_SIZE, 1);
    let c1 = wal.append_record(noop_record(1));
    wal.append_record(noop_record(2));
    write_control(&h.data_dir, c1, 1);
    h.repo.ensure_layout().unwrap();
    wal.write_to_dir(&h.repo.wal_dir()).unwrap();

    let label = take_backup(&h, false);
    let info = h.repo.load_backup(&label).unwrap();
    assert_eq!(info.status, BackupStatus::Valid);
    assert_eq!(info.start_lsn, c1);
    assert_eq!(info.major_version, 17);
    assert_eq!(info.compression, "zstd");

    // stored data files carry the codec extension
    let data = h.repo.backup_data_dir(&label);
    assert!(data.join("base/5/16384.zstd").is_file());
    let manifest = Manifest::load(&h.repo.backup_dir(&label).join("backup.manifest")).unwrap();
    assert!(manifest.hash_of("base/5/16384").is_some());

    // restore and compare
    let target = h._dir.path().join("restored");
    let restored_label = run_restore(
        &h.config,
        h.server,
        "newest",
        Some("target-tli:1"),
        &target,
    )
    .unwrap();
    assert_eq!(restored_label, label);
    assert_matches_cluster(&h, &target);
    assert!(target.join("recovery.signal").exists());
    let auto_conf = std::fs::read_to_string(target.join("postgresql.auto.conf")).unwrap();
    assert!(auto_conf.contains("recovery_target_timeline = '1'"));
    assert!(target.join("pg_wal/000000010000000000000001").exists());
}

#[test]
fn incremental_chain_rollup_and_verify() {
    let h = harness("none", "beta");
    h.repo.ensure_layout().unwrap();

    // --- WAL for the whole story, written up front -------------------
    let mut wal = SegmentBuilder::new(17, 1, SYSID, WAL_SEGMENT_SIZE, 1);
    let c1 = wal.append_record(noop_record(1));
    wal.append_record(heap_record(16384, 2, 100)); // modified before B2
    let c2 = wal.append_record(noop_record(2));
    wal.append_record(heap_record(16384, 3, 101)); // modified before B3
    let c3 = wal.append_record(noop_record(3));
    wal.append_record(noop_record(4));
    wal.write_to_dir(&h.repo.wal_dir()).unwrap();

    // --- B1: full ----------------------------------------------------
    write_control(&h.data_dir, c1, 1);
    let b1 = take_backup(&h, false);

    // --- B2: incremental, page 2 changed -----------------------------
    set_page(&h.data_dir, "base/5/16384", 2, 0xB2);
    write_control(&h.data_dir, c2, 1);
    let b2 = take_backup(&h, true);
    assert_ne!(b1, b2);
    let info2 = h.repo.load_backup(&b2).unwrap();
    assert_eq!(info2.parent_label.as_deref(), Some(b1.as_str()));
    let b2_data = h.repo.backup_data_dir(&b2);
    assert!(b2_data.join("base/5/INCREMENTAL.16384").is_file());
    assert!(b2_data.join("base/5/INCREMENTAL.16385").is_file());
    assert!(!b2_data.join("base/5/16384").exists());
    // the backup wrote a summary for its range
    assert!(h
        .repo
        .list_summaries()
        .unwrap()
        .contains(&(c1, c2)));

    // --- B3: incremental, page 3 changed -----------------------------
    set_page(&h.data_dir, "base/5/16384", 3, 0xB3);
    write_control(&h.data_dir, c3, 1);
    let b3 = take_backup(&h, true);
    let info3 = h.repo.load_backup(&b3).unwrap();
    assert_eq!(info3.parent_label.as_deref(), Some(b2.as_str()));

    // the combined chain reproduces the live cluster
    assert_matches_cluster(&h, &combine_newest(&h));

    // --- delete the middle link: rollup into B3 ----------------------
    run_delete(&h.config, h.server, &b2).unwrap();
    assert!(!h.repo.backup_dir(&b2).exists());
    let info3 = h.repo.load_backup(&b3).unwrap();
    assert_eq!(info3.parent_label.as_deref(), Some(b1.as_str()));
    assert_matches_cluster(&h, &combine_newest(&h));

    // --- delete the full backup: B3 becomes standalone ----------------
    run_delete(&h.config, h.server, &b1).unwrap();
    let info3 = h.repo.load_backup(&b3).unwrap();
    assert_eq!(info3.parent_label, None);
    let b3_data = h.repo.backup_data_dir(&b3);
    assert!(b3_data.join("base/5/16384").is_file());
    assert!(!b3_data.join("base/5/INCREMENTAL.16384").exists());
    assert_matches_cluster(&h, &combine_newest(&h));

    // everything still hashes clean
    let report = run_verify(&h.config, h.server, &b3, VerifyScope::All).unwrap();
    assert!(report.is_clean(), "{:?}", report.entries);
}

#[test]
fn delete_refuses_kept_backups() {
    let h = harness("none", "gamma");
    h.repo.ensure_layout().unwrap();

    let mut wal = SegmentBuilder::new(17, 1, SYSID, WAL_SEGMENT_SIZE, 1);
    let c1 = wal.append_record(noop_record(1));
    wal.append_record(noop_record(2));
    wal.write_to_dir(&h.repo.wal_dir()).unwrap();
    write_control(&h.data_dir, c1, 1);

    let label = take_backup(&h, false);
    pgvault::workflow::delete::set_keep(&h.config, h.server, &label, true).unwrap();

    let err = run_delete(&h.config, h.server, &label).unwrap_err();
    assert!(matches!(err, Error::Retained(_)));
    assert_eq!(err.exit_code(), 5);

    pgvault::workflow::delete::set_keep(&h.config, h.server, &label, false).unwrap();
    run_delete(&h.config, h.server, &label).unwrap();
    assert!(!h.repo.backup_dir(&label).exists());
}
