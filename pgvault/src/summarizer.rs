//! WAL summarization: drive the record reader over an LSN range and
//! produce a block reference table.
//!
//! The summarizer does not reinterpret WAL semantics. It only needs the
//! block references each record carries, the smgr create/truncate and
//! relmap records that change fork lengths wholesale, and the dropped
//! relations listed in commit/abort records. For any block whose content
//! differs between the database states at `start_lsn` and `stop_lsn`,
//! the resulting table contains that block; the reverse is not promised
//! (a superset is acceptable), so anything ambiguous is recorded
//! conservatively.

use camino::Utf8Path;
use tracing::*;
use utils::lsn::Lsn;

use postgres_ffi::pg_constants;
use postgres_ffi::relfile_utils::ForkNumber;
use postgres_ffi::{RelFileLocator, TimeLineID};
use wal_decoder::reader::WalSegmentScanner;
use wal_decoder::records::{
    decode_versioned_payload, decode_wal_record, DecodedWalRecord, XlRelmapUpdate, XlSmgrCreate,
    XlSmgrTruncate, XlXactParsedRecord,
};

use crate::brt::{BlockRefTable, RelForkKey};
use crate::error::{Error, Result};

const ALL_FORKS: [ForkNumber; 4] = [
    ForkNumber::Main,
    ForkNumber::Fsm,
    ForkNumber::VisibilityMap,
    ForkNumber::Init,
];

pub struct WalSummarizer {
    pg_version: u32,
    timeline: TimeLineID,
    segment_size: usize,
    best_effort: bool,
}

impl WalSummarizer {
    pub fn new(pg_version: u32, timeline: TimeLineID, segment_size: usize) -> WalSummarizer {
        WalSummarizer {
            pg_version,
            timeline,
            segment_size,
            best_effort: false,
        }
    }

    /// Continue scanning past records that fail their CRC instead of
    /// failing the whole summary.
    pub fn best_effort(mut self, yes: bool) -> WalSummarizer {
        self.best_effort = yes;
        self
    }

    /// Summarize `[start_lsn, stop_lsn)` from the segments in
    /// `segment_dir`. The WAL must extend at least to `stop_lsn`;
    /// anything short of that is a truncation error.
    pub fn summarize(
        &self,
        segment_dir: &Utf8Path,
        start_lsn: Lsn,
        stop_lsn: Lsn,
    ) -> Result<BlockRefTable> {
        let mut brt = BlockRefTable::new();
        let mut scanner = WalSegmentScanner::new(
            segment_dir,
            self.pg_version,
            self.timeline,
            self.segment_size,
            start_lsn,
            self.best_effort,
        )?;

        let mut decoded = DecodedWalRecord::default();
        let mut records = 0u64;
        loop {
            let Some((lsn, record)) = scanner.next_record()? else {
                // the valid WAL ended; fine only if it covered the range
                if scanner.position() >= stop_lsn {
                    break;
                }
                return Err(Error::Truncated {
                    last_good_lsn: scanner.position(),
                });
            };
            if lsn >= stop_lsn {
                // the first record at or past the boundary closes the range
                break;
            }
            if lsn < start_lsn {
                // the scan starts at a segment boundary; skip up to the range
                continue;
            }
            match decode_wal_record(record, &mut decoded, self.pg_version) {
                Ok(()) => {}
                Err(e) if self.best_effort => {
                    warn!("skipping undecodable record at {lsn}: {e}");
                    continue;
                }
                Err(e) => {
                    return Err(Error::corrupt(format!("WAL record at {lsn}: {e}")));
                }
            }
            records += 1;
            self.apply_record(&mut brt, lsn, stop_lsn, &decoded);
        }

        debug!(
            "summarized {} records into {} entries over [{start_lsn}, {stop_lsn})",
            records,
            brt.len()
        );
        Ok(brt)
    }

    fn apply_record(
        &self,
        brt: &mut BlockRefTable,
        lsn: Lsn,
        stop_lsn: Lsn,
        decoded: &DecodedWalRecord,
    ) {
        // payloads whose layout is version-discriminated carry nothing
        // the table needs, but decoding them validates the stream
        if let Some(payload) = decode_versioned_payload(decoded, self.pg_version) {
            trace!("versioned payload at {lsn}: {payload:?}");
        }

        let info = decoded.rmgr_info();
        match decoded.xl_rmid {
            pg_constants::RM_XLOG_ID => {
                match info {
                    pg_constants::XLOG_CHECKPOINT_SHUTDOWN => {
                        // only interesting when it straddles the range end
                        if lsn + decoded.record.len() as u64 > stop_lsn {
                            debug!("shutdown checkpoint at {lsn} crosses the range boundary");
                        }
                    }
                    pg_constants::XLOG_CHECKPOINT_ONLINE
                    | pg_constants::XLOG_PARAMETER_CHANGE => {}
                    _ => {}
                }
            }
            pg_constants::RM_SMGR_ID if info == pg_constants::XLOG_SMGR_CREATE => {
                let mut buf = decoded.main_data();
                let create = XlSmgrCreate::decode(&mut buf);
                if let Some(fork) = ForkNumber::from_u8(create.forknum) {
                    brt.set_limit_block(
                        RelForkKey {
                            rlocator: create.rlocator,
                            fork,
                        },
                        0,
                    );
                }
            }
            pg_constants::RM_SMGR_ID if info == pg_constants::XLOG_SMGR_TRUNCATE => {
                let mut buf = decoded.main_data();
                let truncate = XlSmgrTruncate::decode(&mut buf);
                self.apply_truncate(brt, &truncate);
            }
            pg_constants::RM_XACT_ID => {
                let op = decoded.xl_info & pg_constants::XLOG_XACT_OPMASK;
                if matches!(
                    op,
                    pg_constants::XLOG_XACT_COMMIT
                        | pg_constants::XLOG_XACT_ABORT
                        | pg_constants::XLOG_XACT_COMMIT_PREPARED
                        | pg_constants::XLOG_XACT_ABORT_PREPARED
                ) {
                    let mut buf = decoded.main_data();
                    let parsed =
                        XlXactParsedRecord::decode(&mut buf, decoded.xl_xid, decoded.xl_info);
                    for rlocator in parsed.xlocators {
                        // the relation's files are unlinked at commit
                        self.drop_all_forks(brt, rlocator);
                    }
                }
            }
            pg_constants::RM_RELMAP_ID if info == pg_constants::XLOG_RELMAP_UPDATE => {
                let mut buf = decoded.main_data();
                let relmap = XlRelmapUpdate::decode(&mut buf);
                // the relation map file is rewritten wholesale
                brt.set_limit_block(
                    RelForkKey::new(relmap.ts_id, relmap.db_id, 0, ForkNumber::Main),
                    0,
                );
            }
            _ => {}
        }

        for blk in &decoded.blocks {
            let Some(fork) = ForkNumber::from_u8(blk.forknum) else {
                // forks past INIT_FORKNUM identify non-relation files
                continue;
            };
            brt.mark_block_modified(
                RelForkKey {
                    rlocator: blk.rlocator(),
                    fork,
                },
                blk.blkno,
            );
        }
    }

    fn apply_truncate(&self, brt: &mut BlockRefTable, truncate: &XlSmgrTruncate) {
        if truncate.flags & pg_constants::SMGR_TRUNCATE_HEAP != 0 {
            brt.set_limit_block(
                RelForkKey {
                    rlocator: truncate.rlocator,
                    fork: ForkNumber::Main,
                },
                truncate.blkno,
            );
        }
        // the FSM and VM shrink too, but their new lengths are not in
        // the record; zero is the conservative (superset) choice
        if truncate.flags & pg_constants::SMGR_TRUNCATE_FSM != 0 {
            brt.set_limit_block(
                RelForkKey {
                    rlocator: truncate.rlocator,
                    fork: ForkNumber::Fsm,
                },
                0,
            );
        }
        if truncate.flags & pg_constants::SMGR_TRUNCATE_VM != 0 {
            brt.set_limit_block(
                RelForkKey {
                    rlocator: truncate.rlocator,
                    fork: ForkNumber::VisibilityMap,
                },
                0,
            );
        }
    }

    fn drop_all_forks(&self, brt: &mut BlockRefTable, rlocator: RelFileLocator) {
        for fork in ALL_FORKS {
            brt.set_limit_block(RelForkKey { rlocator, fork }, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use postgres_ffi::pg_constants::*;
    use postgres_ffi::WAL_SEGMENT_SIZE;
    use wal_decoder::craft::{build_record, SegmentBuilder};

    const PG: u32 = 17;

    fn smgr_create_record(spc: u32, db: u32, rel: u32, fork: u32) -> bytes::Bytes {
        let mut main_data = Vec::new();
        main_data.extend_from_slice(&spc.to_le_bytes());
        main_data.extend_from_slice(&db.to_le_bytes());
        main_data.extend_from_slice(&rel.to_le_bytes());
        main_data.extend_from_slice(&fork.to_le_bytes());
        build_record(RM_SMGR_ID, XLOG_SMGR_CREATE, 9, &[], &main_data)
    }

    fn smgr_truncate_record(spc: u32, db: u32, rel: u32, blkno: u32, flags: u32) -> bytes::Bytes {
        let mut main_data = Vec::new();
        main_data.extend_from_slice(&blkno.to_le_bytes());
        main_data.extend_from_slice(&spc.to_le_bytes());
        main_data.extend_from_slice(&db.to_le_bytes());
        main_data.extend_from_slice(&rel.to_le_bytes());
        main_data.extend_from_slice(&flags.to_le_bytes());
        build_record(RM_SMGR_ID, XLOG_SMGR_TRUNCATE, 9, &[], &main_data)
    }

    fn heap_record(spc: u32, db: u32, rel: u32, blkno: u32, xid: u32) -> bytes::Bytes {
        build_record(RM_HEAP_ID, 0, xid, &[(spc, db, rel, 0, blkno)], b"tuple")
    }

    #[test]
    fn summarize_marks_creates_truncates_and_blocks() {
        let dir = tempdir().unwrap();
        let mut b = SegmentBuilder::new(PG, 1, 0xABCD, WAL_SEGMENT_SIZE, 1);
        let start = b.append_record(heap_record(1663, 5, 16384, 3, 100));
        b.append_record(heap_record(1663, 5, 16384, 900, 101));
        b.append_record(smgr_create_record(1663, 5, 16390, 0));
        b.append_record(heap_record(1663, 5, 16390, 2, 102));
        b.append_record(smgr_truncate_record(1663, 5, 16384, 500, SMGR_TRUNCATE_HEAP));
        let last = b.append_record(heap_record(1663, 5, 16385, 1, 103));
        let stop = Lsn(last.0 + 8); // inside the record after `last`
        b.append_record(heap_record(1663, 5, 16386, 1, 104)); // past stop, ignored
        b.write_to_dir(dir.path()).unwrap();

        let brt = WalSummarizer::new(PG, 1, WAL_SEGMENT_SIZE)
            .summarize(dir.path(), start, stop)
            .unwrap();

        // truncation to 500 discarded block 900 and recorded the limit
        let truncated = brt
            .get_entry(RelForkKey::new(1663, 5, 16384, ForkNumber::Main))
            .unwrap();
        assert_eq!(truncated.limit_block(), Some(500));
        assert_eq!(truncated.all_blocks(), vec![3]);

        // the created relation has limit 0 and keeps post-create marks
        let created = brt
            .get_entry(RelForkKey::new(1663, 5, 16390, ForkNumber::Main))
            .unwrap();
        assert_eq!(created.limit_block(), Some(0));
        assert_eq!(created.all_blocks(), vec![2]);

        // an ordinary block reference inside the range
        assert!(brt
            .get_entry(RelForkKey::new(1663, 5, 16385, ForkNumber::Main))
            .is_some());
        // the record past stop_lsn is not included
        assert!(brt
            .get_entry(RelForkKey::new(1663, 5, 16386, ForkNumber::Main))
            .is_none());
    }

    #[test]
    fn missing_wal_is_truncation() {
        let dir = tempdir().unwrap();
        let mut b = SegmentBuilder::new(PG, 1, 0xABCD, WAL_SEGMENT_SIZE, 1);
        let start = b.append_record(heap_record(1663, 5, 16384, 3, 100));
        let end = b.append_record(heap_record(1663, 5, 16384, 4, 101));
        b.write_to_dir(dir.path()).unwrap();

        // ask for a range reaching past the end of the written WAL
        let stop = Lsn(end.0 + WAL_SEGMENT_SIZE as u64);
        let err = WalSummarizer::new(PG, 1, WAL_SEGMENT_SIZE)
            .summarize(dir.path(), start, stop)
            .unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn marking_is_superset_idempotent() {
        // the same range summarized twice yields identical tables
        let dir = tempdir().unwrap();
        let mut b = SegmentBuilder::new(PG, 1, 0xABCD, WAL_SEGMENT_SIZE, 1);
        let start = b.append_record(heap_record(1663, 5, 16384, 3, 100));
        let last = b.append_record(heap_record(1663, 5, 16384, 3, 101));
        let stop = Lsn(last.0 + 8);
        b.write_to_dir(dir.path()).unwrap();

        let s = WalSummarizer::new(PG, 1, WAL_SEGMENT_SIZE);
        let first = s.summarize(dir.path(), start, stop).unwrap();
        let second = s.summarize(dir.path(), start, stop).unwrap();
        assert!(first.same_contents(&second));
        assert_eq!(
            first
                .get_entry(RelForkKey::new(1663, 5, 16384, ForkNumber::Main))
                .unwrap()
                .all_blocks(),
            vec![3]
        );
    }
}
