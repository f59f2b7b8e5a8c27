//! Record payloads whose layout changed between supported majors.
//!
//! Each struct is a sum type keyed by the server's major version; the
//! variant is selected once when the record is decoded and never
//! mutates. Decoding follows the C struct layouts byte for byte (little
//! endian, no implicit padding inside the decoded prefix).

use bytes::{Buf, Bytes};

use crate::{Oid, TimeLineID, TimestampTz, TransactionId, XLogRecPtr};

/// `xl_clog_truncate`: the page number widened from i32 to i64 in 17.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XlClogTruncate {
    V16 {
        pageno: i32,
        oldest_xact: TransactionId,
        oldest_xact_db: Oid,
    },
    V17 {
        pageno: i64,
        oldest_xact: TransactionId,
        oldest_xact_db: Oid,
    },
}

impl XlClogTruncate {
    pub fn decode(buf: &mut Bytes, pg_version: u32) -> XlClogTruncate {
        if pg_version >= 17 {
            XlClogTruncate::V17 {
                pageno: buf.get_i64_le(),
                oldest_xact: buf.get_u32_le(),
                oldest_xact_db: buf.get_u32_le(),
            }
        } else {
            XlClogTruncate::V16 {
                pageno: buf.get_i32_le(),
                oldest_xact: buf.get_u32_le(),
                oldest_xact_db: buf.get_u32_le(),
            }
        }
    }

    pub fn pageno(&self) -> i64 {
        match *self {
            XlClogTruncate::V16 { pageno, .. } => pageno as i64,
            XlClogTruncate::V17 { pageno, .. } => pageno,
        }
    }
}

/// `xl_commit_ts_truncate`: same i32/i64 split as the CLOG truncate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XlCommitTsTruncate {
    V16 { pageno: i32, oldest_xid: TransactionId },
    V17 { pageno: i64, oldest_xid: TransactionId },
}

impl XlCommitTsTruncate {
    pub fn decode(buf: &mut Bytes, pg_version: u32) -> XlCommitTsTruncate {
        if pg_version >= 17 {
            XlCommitTsTruncate::V17 {
                pageno: buf.get_i64_le(),
                oldest_xid: buf.get_u32_le(),
            }
        } else {
            XlCommitTsTruncate::V16 {
                pageno: buf.get_i32_le(),
                oldest_xid: buf.get_u32_le(),
            }
        }
    }
}

/// `xl_hash_vacuum_one_page`: 16 renamed the horizon field, shrank the
/// tuple count to u16 and added the catalog-relation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XlHashVacuumOnePage {
    V15 {
        latest_removed_xid: TransactionId,
        ntuples: i32,
    },
    V16 {
        snapshot_conflict_horizon: TransactionId,
        ntuples: u16,
        is_catalog_rel: bool,
    },
}

impl XlHashVacuumOnePage {
    pub fn decode(buf: &mut Bytes, pg_version: u32) -> XlHashVacuumOnePage {
        if pg_version >= 16 {
            XlHashVacuumOnePage::V16 {
                snapshot_conflict_horizon: buf.get_u32_le(),
                ntuples: buf.get_u16_le(),
                is_catalog_rel: buf.get_u8() != 0,
            }
        } else {
            XlHashVacuumOnePage::V15 {
                latest_removed_xid: buf.get_u32_le(),
                ntuples: buf.get_i32_le(),
            }
        }
    }
}

/// `spg_xlog_vacuum_redirect`: 16 added the catalog-relation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpgXlogVacuumRedirect {
    V15 {
        n_to_placeholder: u16,
        first_placeholder: u16,
        newest_redirect_xid: TransactionId,
    },
    V16 {
        n_to_placeholder: u16,
        first_placeholder: u16,
        snapshot_conflict_horizon: TransactionId,
        is_catalog_rel: bool,
    },
}

impl SpgXlogVacuumRedirect {
    pub fn decode(buf: &mut Bytes, pg_version: u32) -> SpgXlogVacuumRedirect {
        if pg_version >= 16 {
            SpgXlogVacuumRedirect::V16 {
                n_to_placeholder: buf.get_u16_le(),
                first_placeholder: buf.get_u16_le(),
                snapshot_conflict_horizon: buf.get_u32_le(),
                is_catalog_rel: buf.get_u8() != 0,
            }
        } else {
            SpgXlogVacuumRedirect::V15 {
                n_to_placeholder: buf.get_u16_le(),
                first_placeholder: buf.get_u16_le(),
                newest_redirect_xid: buf.get_u32_le(),
            }
        }
    }
}

/// `xl_end_of_recovery`: 17 appended the wal_level in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XlEndOfRecovery {
    V16 {
        end_time: TimestampTz,
        this_timeline_id: TimeLineID,
        prev_timeline_id: TimeLineID,
    },
    V17 {
        end_time: TimestampTz,
        this_timeline_id: TimeLineID,
        prev_timeline_id: TimeLineID,
        wal_level: i32,
    },
}

impl XlEndOfRecovery {
    pub fn decode(buf: &mut Bytes, pg_version: u32) -> XlEndOfRecovery {
        if pg_version >= 17 {
            XlEndOfRecovery::V17 {
                end_time: buf.get_i64_le(),
                this_timeline_id: buf.get_u32_le(),
                prev_timeline_id: buf.get_u32_le(),
                wal_level: buf.get_i32_le(),
            }
        } else {
            XlEndOfRecovery::V16 {
                end_time: buf.get_i64_le(),
                this_timeline_id: buf.get_u32_le(),
                prev_timeline_id: buf.get_u32_le(),
            }
        }
    }

    pub fn this_timeline_id(&self) -> TimeLineID {
        match *self {
            XlEndOfRecovery::V16 { this_timeline_id, .. }
            | XlEndOfRecovery::V17 { this_timeline_id, .. } => this_timeline_id,
        }
    }
}

/// `xl_overwrite_contrecord`, stable across supported versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlOverwriteContrecord {
    pub overwritten_lsn: XLogRecPtr,
    pub overwrite_time: TimestampTz,
}

impl XlOverwriteContrecord {
    pub fn decode(buf: &mut Bytes) -> XlOverwriteContrecord {
        XlOverwriteContrecord {
            overwritten_lsn: buf.get_u64_le(),
            overwrite_time: buf.get_i64_le(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clog_truncate_width_by_version() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&7i64.to_le_bytes());
        payload.extend_from_slice(&100u32.to_le_bytes());
        payload.extend_from_slice(&5u32.to_le_bytes());
        let mut buf = Bytes::from(payload);
        let rec = XlClogTruncate::decode(&mut buf, 17);
        assert_eq!(
            rec,
            XlClogTruncate::V17 { pageno: 7, oldest_xact: 100, oldest_xact_db: 5 }
        );
        assert_eq!(rec.pageno(), 7);

        let mut payload = Vec::new();
        payload.extend_from_slice(&7i32.to_le_bytes());
        payload.extend_from_slice(&100u32.to_le_bytes());
        payload.extend_from_slice(&5u32.to_le_bytes());
        let mut buf = Bytes::from(payload);
        let rec = XlClogTruncate::decode(&mut buf, 13);
        assert_eq!(rec.pageno(), 7);
    }

    #[test]
    fn end_of_recovery_gains_wal_level() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0i64.to_le_bytes());
        payload.extend_from_slice(&4u32.to_le_bytes());
        payload.extend_from_slice(&3u32.to_le_bytes());
        payload.extend_from_slice(&2i32.to_le_bytes());
        let mut buf = Bytes::from(payload.clone());
        assert_eq!(XlEndOfRecovery::decode(&mut buf, 18).this_timeline_id(), 4);
        let mut buf = Bytes::from(payload);
        let rec = XlEndOfRecovery::decode(&mut buf, 16);
        assert_eq!(rec.this_timeline_id(), 4);
        // the trailing wal_level stays unconsumed on 16
        assert_eq!(buf.remaining(), 4);
    }
}
