//!
//! Functions for parsing WAL records.
//!

use anyhow::Result;
use bytes::{Buf, Bytes};
use postgres_ffi::pg_constants;
use postgres_ffi::versioned::{
    SpgXlogVacuumRedirect, XlClogTruncate, XlCommitTsTruncate, XlEndOfRecovery,
    XlHashVacuumOnePage, XlOverwriteContrecord,
};
use postgres_ffi::{
    bkpimage_apply, bkpimage_is_compressed, BlockNumber, Oid, RelFileLocator, XLogRecord,
    BLCKSZ, XLOG_SIZE_OF_XLOG_RECORD,
};
use tracing::*;

/// DecodedBkpBlock represents per-page data contained in a WAL record.
#[derive(Default, Debug, Clone)]
pub struct DecodedBkpBlock {
    /* Identify the block this refers to */
    pub rlocator_spc: u32,
    pub rlocator_db: u32,
    pub rlocator_rel: u32,
    pub forknum: u8,
    pub blkno: BlockNumber,

    /* copy of the fork_flags field from the XLogRecordBlockHeader */
    pub flags: u8,

    /* Information on full-page image, if any */
    pub has_image: bool,
    pub apply_image: bool,
    pub will_init: bool,
    pub hole_offset: u16,
    pub hole_length: u16,
    pub bimg_offset: u32,
    pub bimg_len: u16,
    pub bimg_info: u8,

    pub has_data: bool,
    pub data_len: u16,
}

impl DecodedBkpBlock {
    pub fn new() -> DecodedBkpBlock {
        Default::default()
    }

    pub fn rlocator(&self) -> RelFileLocator {
        RelFileLocator {
            spc_oid: self.rlocator_spc,
            db_oid: self.rlocator_db,
            rel_number: self.rlocator_rel,
        }
    }
}

#[derive(Default)]
pub struct DecodedWalRecord {
    pub xl_xid: u32,
    pub xl_info: u8,
    pub xl_rmid: u8,
    pub record: Bytes, // raw record, header included

    pub blocks: Vec<DecodedBkpBlock>,
    pub main_data_offset: usize,
}

impl DecodedWalRecord {
    /// The rmgr-specific info bits, with the generic flag bits masked off.
    pub fn rmgr_info(&self) -> u8 {
        self.xl_info & pg_constants::XLR_RMGR_INFO_MASK
    }

    /// The record's main data blob.
    pub fn main_data(&self) -> Bytes {
        self.record.slice(self.main_data_offset..)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("record too short: xl_tot_len {0}")]
    TooShort(u32),
    #[error("unexpected block_id {0} in record")]
    BadBlockId(u8),
    #[error("out-of-order block_id {0}")]
    OutOfOrderBlockId(u8),
    #[error("BKPBLOCK_SAME_REL set but no previous rel")]
    SameRelWithoutRel,
    #[error("invalid block image metadata: hole {hole_offset}+{hole_length}, bimg_len {bimg_len}")]
    BadImage {
        hole_offset: u16,
        hole_length: u16,
        bimg_len: u16,
    },
    #[error("record CRC mismatch: computed {computed:#010x}, header {header:#010x}")]
    BadCrc { computed: u32, header: u32 },
    #[error("record truncated while parsing")]
    Underflow,
}

/// `xl_smgr_create`
#[derive(Debug, Clone, Copy)]
pub struct XlSmgrCreate {
    pub rlocator: RelFileLocator,
    pub forknum: u8,
}

impl XlSmgrCreate {
    pub fn decode(buf: &mut Bytes) -> XlSmgrCreate {
        XlSmgrCreate {
            rlocator: RelFileLocator {
                spc_oid: buf.get_u32_le(),
                db_oid: buf.get_u32_le(),
                rel_number: buf.get_u32_le(),
            },
            forknum: buf.get_u32_le() as u8,
        }
    }
}

/// `xl_smgr_truncate`
#[derive(Debug, Clone, Copy)]
pub struct XlSmgrTruncate {
    pub blkno: BlockNumber,
    pub rlocator: RelFileLocator,
    pub flags: u32,
}

impl XlSmgrTruncate {
    pub fn decode(buf: &mut Bytes) -> XlSmgrTruncate {
        XlSmgrTruncate {
            blkno: buf.get_u32_le(),
            rlocator: RelFileLocator {
                spc_oid: buf.get_u32_le(),
                db_oid: buf.get_u32_le(),
                rel_number: buf.get_u32_le(),
            },
            flags: buf.get_u32_le(),
        }
    }
}

/// `xl_dbase_create_rec` (the file-copy strategy; the fields the backup
/// manager reads are version-stable)
#[derive(Debug, Clone, Copy)]
pub struct XlCreateDatabase {
    pub db_id: Oid,
    pub tablespace_id: Oid,
    pub src_db_id: Oid,
    pub src_tablespace_id: Oid,
}

impl XlCreateDatabase {
    pub fn decode(buf: &mut Bytes) -> XlCreateDatabase {
        XlCreateDatabase {
            db_id: buf.get_u32_le(),
            tablespace_id: buf.get_u32_le(),
            src_db_id: buf.get_u32_le(),
            src_tablespace_id: buf.get_u32_le(),
        }
    }
}

/// `xl_dbase_drop_rec`
#[derive(Debug, Clone)]
pub struct XlDropDatabase {
    pub db_id: Oid,
    pub tablespace_ids: Vec<Oid>,
}

impl XlDropDatabase {
    pub fn decode(buf: &mut Bytes) -> XlDropDatabase {
        let db_id = buf.get_u32_le();
        let ntablespaces = buf.get_u32_le();
        let mut tablespace_ids = Vec::with_capacity(ntablespaces as usize);
        for _ in 0..ntablespaces {
            tablespace_ids.push(buf.get_u32_le());
        }
        XlDropDatabase {
            db_id,
            tablespace_ids,
        }
    }
}

/// `xl_relmap_update`
#[derive(Debug, Clone, Copy)]
pub struct XlRelmapUpdate {
    pub db_id: Oid,  /* database ID, or 0 for shared map */
    pub ts_id: Oid,  /* database's tablespace, or pg_global */
    pub nbytes: i32, /* size of relmap data */
}

impl XlRelmapUpdate {
    pub fn decode(buf: &mut Bytes) -> XlRelmapUpdate {
        XlRelmapUpdate {
            db_id: buf.get_u32_le(),
            ts_id: buf.get_u32_le(),
            nbytes: buf.get_i32_le(),
        }
    }
}

///
/// Note: parsing of some fields is missing, because they're not needed.
///
/// This is similar to the xl_xact_parsed_commit and xl_xact_parsed_abort
/// structs in PostgreSQL, but we use the same struct for commits and
/// aborts.
///
#[derive(Debug)]
pub struct XlXactParsedRecord {
    pub xid: u32,
    pub info: u8,
    pub xact_time: i64,
    pub xinfo: u32,

    pub db_id: Oid, /* MyDatabaseId */
    pub ts_id: Oid, /* MyDatabaseTableSpace */

    pub subxacts: Vec<u32>,

    /// Relation file locators dropped by this transaction.
    pub xlocators: Vec<RelFileLocator>,
}

impl XlXactParsedRecord {
    /// Decode a XLOG_XACT_COMMIT/ABORT/COMMIT_PREPARED/ABORT_PREPARED
    /// record. This should agree with the ParseCommitRecord and
    /// ParseAbortRecord functions in PostgreSQL.
    pub fn decode(buf: &mut Bytes, mut xid: u32, xl_info: u8) -> XlXactParsedRecord {
        let info = xl_info & pg_constants::XLOG_XACT_OPMASK;
        // The record starts with the time of commit/abort.
        let xact_time = buf.get_i64_le();
        let xinfo = if xl_info & pg_constants::XLOG_XACT_HAS_INFO != 0 {
            buf.get_u32_le()
        } else {
            0
        };
        let db_id;
        let ts_id;
        if xinfo & pg_constants::XACT_XINFO_HAS_DBINFO != 0 {
            db_id = buf.get_u32_le();
            ts_id = buf.get_u32_le();
        } else {
            db_id = 0;
            ts_id = 0;
        }
        let mut subxacts = Vec::new();
        if xinfo & pg_constants::XACT_XINFO_HAS_SUBXACTS != 0 {
            let nsubxacts = buf.get_i32_le();
            for _ in 0..nsubxacts {
                subxacts.push(buf.get_u32_le());
            }
        }
        let mut xlocators = Vec::new();
        if xinfo & pg_constants::XACT_XINFO_HAS_RELFILELOCATORS != 0 {
            let nrels = buf.get_i32_le();
            for _ in 0..nrels {
                let spc_oid = buf.get_u32_le();
                let db_oid = buf.get_u32_le();
                let rel_number = buf.get_u32_le();
                trace!("XLOG_XACT relfilelocator {spc_oid}/{db_oid}/{rel_number}");
                xlocators.push(RelFileLocator {
                    spc_oid,
                    db_oid,
                    rel_number,
                });
            }
        }

        if xinfo & pg_constants::XACT_XINFO_HAS_DROPPED_STATS != 0 {
            let nitems = buf.get_i32_le();
            let sizeof_xl_xact_stats_item = 12;
            buf.advance((nitems * sizeof_xl_xact_stats_item).try_into().unwrap());
        }

        if xinfo & pg_constants::XACT_XINFO_HAS_INVALS != 0 {
            let nmsgs = buf.get_i32_le();
            let sizeof_shared_invalidation_message = 16;
            buf.advance(
                (nmsgs * sizeof_shared_invalidation_message)
                    .try_into()
                    .unwrap(),
            );
        }

        if xinfo & pg_constants::XACT_XINFO_HAS_TWOPHASE != 0 {
            xid = buf.get_u32_le();
            debug!("XLOG_XACT twophase xid {xid}");
        }

        XlXactParsedRecord {
            xid,
            info,
            xact_time,
            xinfo,
            db_id,
            ts_id,
            subxacts,
            xlocators,
        }
    }
}

/// The version-discriminated payloads, parsed on demand from a decoded
/// record's main data.
#[derive(Debug, Clone, Copy)]
pub enum VersionedPayload {
    ClogTruncate(XlClogTruncate),
    CommitTsTruncate(XlCommitTsTruncate),
    HashVacuumOnePage(XlHashVacuumOnePage),
    SpgVacuumRedirect(SpgXlogVacuumRedirect),
    EndOfRecovery(XlEndOfRecovery),
    OverwriteContrecord(XlOverwriteContrecord),
}

/// Parse the main data of records whose layout is major-version
/// dependent. Returns None for record types without such a payload, and
/// for payloads too short for their declared type.
pub fn decode_versioned_payload(
    decoded: &DecodedWalRecord,
    pg_version: u32,
) -> Option<VersionedPayload> {
    let mut buf = decoded.main_data();
    let info = decoded.rmgr_info();
    let needed = match (decoded.xl_rmid, info) {
        (pg_constants::RM_CLOG_ID, pg_constants::CLOG_TRUNCATE) => {
            if pg_version >= 17 {
                16
            } else {
                12
            }
        }
        (pg_constants::RM_COMMIT_TS_ID, pg_constants::COMMIT_TS_TRUNCATE) => {
            if pg_version >= 17 {
                12
            } else {
                8
            }
        }
        (pg_constants::RM_HASH_ID, pg_constants::XLOG_HASH_VACUUM_ONE_PAGE) => {
            if pg_version >= 16 {
                7
            } else {
                8
            }
        }
        (pg_constants::RM_SPGIST_ID, pg_constants::XLOG_SPGIST_VACUUM_REDIRECT) => {
            if pg_version >= 16 {
                9
            } else {
                8
            }
        }
        (pg_constants::RM_XLOG_ID, pg_constants::XLOG_END_OF_RECOVERY) => {
            if pg_version >= 17 {
                20
            } else {
                16
            }
        }
        (pg_constants::RM_XLOG_ID, pg_constants::XLOG_OVERWRITE_CONTRECORD) => 16,
        _ => return None,
    };
    if buf.remaining() < needed {
        return None;
    }
    match decoded.xl_rmid {
        pg_constants::RM_CLOG_ID if info == pg_constants::CLOG_TRUNCATE => Some(
            VersionedPayload::ClogTruncate(XlClogTruncate::decode(&mut buf, pg_version)),
        ),
        pg_constants::RM_COMMIT_TS_ID if info == pg_constants::COMMIT_TS_TRUNCATE => Some(
            VersionedPayload::CommitTsTruncate(XlCommitTsTruncate::decode(&mut buf, pg_version)),
        ),
        pg_constants::RM_HASH_ID if info == pg_constants::XLOG_HASH_VACUUM_ONE_PAGE => Some(
            VersionedPayload::HashVacuumOnePage(XlHashVacuumOnePage::decode(&mut buf, pg_version)),
        ),
        pg_constants::RM_SPGIST_ID if info == pg_constants::XLOG_SPGIST_VACUUM_REDIRECT => Some(
            VersionedPayload::SpgVacuumRedirect(SpgXlogVacuumRedirect::decode(
                &mut buf, pg_version,
            )),
        ),
        pg_constants::RM_XLOG_ID if info == pg_constants::XLOG_END_OF_RECOVERY => Some(
            VersionedPayload::EndOfRecovery(XlEndOfRecovery::decode(&mut buf, pg_version)),
        ),
        pg_constants::RM_XLOG_ID if info == pg_constants::XLOG_OVERWRITE_CONTRECORD => Some(
            VersionedPayload::OverwriteContrecord(XlOverwriteContrecord::decode(&mut buf)),
        ),
        _ => None,
    }
}

/// Main routine to decode a WAL record and figure out which blocks are modified.
//
// See xlogrecord.h for details. The overall layout of an XLOG record is:
//		Fixed-size header (XLogRecord struct)
//      XLogRecordBlockHeader struct
//          If BKPBLOCK_HAS_IMAGE, an XLogRecordBlockImageHeader struct follows
//	           If BKPIMAGE_HAS_HOLE and the image is compressed, an
//	           XLogRecordBlockCompressHeader struct follows.
//          If BKPBLOCK_SAME_REL is not set, a RelFileLocator follows
//          BlockNumber follows
//      XLogRecordBlockHeader struct
//      ...
//      XLogRecordDataHeader[Short|Long] struct
//      block data
//      block data
//      ...
//      main data
//
// The caller provides the DecodedWalRecord struct and the function fills it
// in, so a caller digesting a stream of records can reuse one allocation.
//
pub fn decode_wal_record(
    record: Bytes,
    decoded: &mut DecodedWalRecord,
    pg_version: u32,
) -> Result<(), DecodeError> {
    let mut rlocator_spc: u32 = 0;
    let mut rlocator_db: u32 = 0;
    let mut rlocator_rel: u32 = 0;
    let mut got_rlocator = false;

    let mut buf = record.clone();

    // 1. Parse the XLogRecord header.
    if buf.remaining() < XLOG_SIZE_OF_XLOG_RECORD {
        return Err(DecodeError::Underflow);
    }
    let xlogrec = XLogRecord::from_bytes(&mut buf).map_err(|_| DecodeError::Underflow)?;

    trace!(
        "decode_wal_record xl_rmid = {} xl_info = {}",
        xlogrec.xl_rmid,
        xlogrec.xl_info
    );

    if (xlogrec.xl_tot_len as usize) < XLOG_SIZE_OF_XLOG_RECORD
        || xlogrec.xl_tot_len as usize != record.len()
    {
        return Err(DecodeError::TooShort(xlogrec.xl_tot_len));
    }

    // 2. Verify the CRC before trusting any of the lengths below.
    let computed = XLogRecord::compute_crc(&record, &record[XLOG_SIZE_OF_XLOG_RECORD..]);
    if computed != xlogrec.xl_crc {
        return Err(DecodeError::BadCrc {
            computed,
            header: xlogrec.xl_crc,
        });
    }

    let mut max_block_id: Option<u8> = None;
    let mut blocks_total_len: u32 = 0;
    let mut main_data_len = 0;
    let mut datatotal: u32 = 0;
    decoded.blocks.clear();

    // 3. Decode the headers: XLogRecordBlockHeaders if any, then
    // XLogRecordDataHeader[Short|Long].
    while buf.remaining() > datatotal as usize {
        let block_id = buf.get_u8();

        match block_id {
            pg_constants::XLR_BLOCK_ID_DATA_SHORT => {
                /* XLogRecordDataHeaderShort */
                if buf.remaining() < 1 {
                    return Err(DecodeError::Underflow);
                }
                main_data_len = buf.get_u8() as u32;
                datatotal += main_data_len;
            }

            pg_constants::XLR_BLOCK_ID_DATA_LONG => {
                /* XLogRecordDataHeaderLong */
                if buf.remaining() < 4 {
                    return Err(DecodeError::Underflow);
                }
                main_data_len = buf.get_u32_le();
                datatotal += main_data_len;
            }

            pg_constants::XLR_BLOCK_ID_ORIGIN => {
                // RepOriginId is uint16
                if buf.remaining() < 2 {
                    return Err(DecodeError::Underflow);
                }
                buf.advance(2);
            }

            pg_constants::XLR_BLOCK_ID_TOPLEVEL_XID => {
                // TransactionId is uint32
                if buf.remaining() < 4 {
                    return Err(DecodeError::Underflow);
                }
                buf.advance(4);
            }

            0..=pg_constants::XLR_MAX_BLOCK_ID => {
                /* XLogRecordBlockHeader */
                let mut blk = DecodedBkpBlock::new();

                if let Some(max) = max_block_id {
                    if block_id <= max {
                        return Err(DecodeError::OutOfOrderBlockId(block_id));
                    }
                }
                max_block_id = Some(block_id);

                if buf.remaining() < 3 {
                    return Err(DecodeError::Underflow);
                }
                let fork_flags: u8 = buf.get_u8();
                blk.forknum = fork_flags & pg_constants::BKPBLOCK_FORK_MASK;
                blk.flags = fork_flags;
                blk.has_image = (fork_flags & pg_constants::BKPBLOCK_HAS_IMAGE) != 0;
                blk.has_data = (fork_flags & pg_constants::BKPBLOCK_HAS_DATA) != 0;
                blk.will_init = (fork_flags & pg_constants::BKPBLOCK_WILL_INIT) != 0;
                blk.data_len = buf.get_u16_le();

                datatotal += blk.data_len as u32;
                blocks_total_len += blk.data_len as u32;

                if blk.has_image {
                    if buf.remaining() < 5 {
                        return Err(DecodeError::Underflow);
                    }
                    blk.bimg_len = buf.get_u16_le();
                    blk.hole_offset = buf.get_u16_le();
                    blk.bimg_info = buf.get_u8();

                    blk.apply_image = bkpimage_apply(blk.bimg_info, pg_version);
                    let is_compressed = bkpimage_is_compressed(blk.bimg_info, pg_version);

                    if is_compressed {
                        if blk.bimg_info & pg_constants::BKPIMAGE_HAS_HOLE != 0 {
                            if buf.remaining() < 2 {
                                return Err(DecodeError::Underflow);
                            }
                            blk.hole_length = buf.get_u16_le();
                        } else {
                            blk.hole_length = 0;
                        }
                    } else {
                        blk.hole_length = BLCKSZ - blk.bimg_len;
                    }
                    datatotal += blk.bimg_len as u32;
                    blocks_total_len += blk.bimg_len as u32;

                    // cross-check the image metadata
                    let has_hole = blk.bimg_info & pg_constants::BKPIMAGE_HAS_HOLE != 0;
                    let bad = (has_hole
                        && (blk.hole_offset == 0 || blk.hole_length == 0 || blk.bimg_len == BLCKSZ))
                        || (!has_hole && (blk.hole_offset != 0 || blk.hole_length != 0))
                        || (!has_hole && !is_compressed && blk.bimg_len != BLCKSZ);
                    if bad {
                        return Err(DecodeError::BadImage {
                            hole_offset: blk.hole_offset,
                            hole_length: blk.hole_length,
                            bimg_len: blk.bimg_len,
                        });
                    }
                }
                if fork_flags & pg_constants::BKPBLOCK_SAME_REL == 0 {
                    if buf.remaining() < 12 {
                        return Err(DecodeError::Underflow);
                    }
                    rlocator_spc = buf.get_u32_le();
                    rlocator_db = buf.get_u32_le();
                    rlocator_rel = buf.get_u32_le();
                    got_rlocator = true;
                } else if !got_rlocator {
                    return Err(DecodeError::SameRelWithoutRel);
                }

                blk.rlocator_spc = rlocator_spc;
                blk.rlocator_db = rlocator_db;
                blk.rlocator_rel = rlocator_rel;

                if buf.remaining() < 4 {
                    return Err(DecodeError::Underflow);
                }
                blk.blkno = buf.get_u32_le();
                trace!(
                    "this record affects {}/{}/{} blk {}",
                    rlocator_spc,
                    rlocator_db,
                    rlocator_rel,
                    blk.blkno
                );

                decoded.blocks.push(blk);
            }

            _ => {
                return Err(DecodeError::BadBlockId(block_id));
            }
        }
    }

    // 4. Note where each block's image starts within the record; the
    // caller slices them out lazily.
    let mut ptr = record.len() - buf.remaining();
    for blk in decoded.blocks.iter_mut() {
        if blk.has_image {
            blk.bimg_offset = ptr as u32;
            ptr += blk.bimg_len as usize;
        }
        if blk.has_data {
            ptr += blk.data_len as usize;
        }
    }
    // We don't need the block payloads here, so just skip past them.
    if buf.remaining() < blocks_total_len as usize {
        return Err(DecodeError::Underflow);
    }
    buf.advance(blocks_total_len as usize);

    // 5. The main data is the tail of the record.
    if buf.remaining() != main_data_len as usize {
        return Err(DecodeError::Underflow);
    }
    let main_data_offset = (xlogrec.xl_tot_len - main_data_len) as usize;

    decoded.xl_xid = xlogrec.xl_xid;
    decoded.xl_info = xlogrec.xl_info;
    decoded.xl_rmid = xlogrec.xl_rmid;
    decoded.record = record;
    decoded.main_data_offset = main_data_offset;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::craft::build_record;
    use postgres_ffi::pg_constants::*;

    #[test]
    fn decodes_smgr_create_with_block_ref() {
        // a record with one block reference and an smgr-style main data blob
        let mut main_data = Vec::new();
        main_data.extend_from_slice(&1663u32.to_le_bytes());
        main_data.extend_from_slice(&5u32.to_le_bytes());
        main_data.extend_from_slice(&16384u32.to_le_bytes());
        main_data.extend_from_slice(&0u32.to_le_bytes());

        let record = build_record(
            RM_SMGR_ID,
            XLOG_SMGR_CREATE,
            42,
            &[(1663, 5, 16384, 0, 7)],
            &main_data,
        );
        let mut decoded = DecodedWalRecord::default();
        decode_wal_record(record, &mut decoded, 17).unwrap();

        assert_eq!(decoded.xl_rmid, RM_SMGR_ID);
        assert_eq!(decoded.xl_xid, 42);
        assert_eq!(decoded.blocks.len(), 1);
        let blk = &decoded.blocks[0];
        assert_eq!((blk.rlocator_spc, blk.rlocator_db, blk.rlocator_rel), (1663, 5, 16384));
        assert_eq!(blk.forknum, MAIN_FORKNUM);
        assert_eq!(blk.blkno, 7);

        let mut buf = decoded.main_data();
        let create = XlSmgrCreate::decode(&mut buf);
        assert_eq!(create.rlocator.rel_number, 16384);
    }

    #[test]
    fn same_rel_inherits_locator() {
        let record = build_record(
            RM_HEAP_ID,
            0,
            1,
            &[(1663, 5, 16384, 0, 2), (0, 0, 0, 2, 9)], // second block uses SAME_REL
            b"x",
        );
        let mut decoded = DecodedWalRecord::default();
        decode_wal_record(record, &mut decoded, 16).unwrap();
        assert_eq!(decoded.blocks.len(), 2);
        assert_eq!(decoded.blocks[1].rlocator_rel, 16384);
        assert_eq!(decoded.blocks[1].forknum, VISIBILITYMAP_FORKNUM);
        assert_eq!(decoded.blocks[1].blkno, 9);
    }

    #[test]
    fn versioned_payloads_decode_by_major() {
        let mut main_data = Vec::new();
        main_data.extend_from_slice(&9i64.to_le_bytes());
        main_data.extend_from_slice(&700u32.to_le_bytes());
        main_data.extend_from_slice(&5u32.to_le_bytes());
        let record = build_record(RM_CLOG_ID, CLOG_TRUNCATE, 0, &[], &main_data);
        let mut decoded = DecodedWalRecord::default();
        decode_wal_record(record, &mut decoded, 18).unwrap();
        match decode_versioned_payload(&decoded, 18) {
            Some(VersionedPayload::ClogTruncate(t)) => assert_eq!(t.pageno(), 9),
            other => panic!("expected a clog truncate payload, got {other:?}"),
        }

        // the same bytes on a pre-17 major read the narrow layout
        match decode_versioned_payload(&decoded, 14) {
            Some(VersionedPayload::ClogTruncate(t)) => assert_eq!(t.pageno(), 9),
            other => panic!("expected a clog truncate payload, got {other:?}"),
        }
    }

    #[test]
    fn crc_mismatch_is_detected() {
        let record = build_record(RM_XLOG_ID, XLOG_NOOP, 0, &[], b"hello");
        let mut corrupted = record.to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        let mut decoded = DecodedWalRecord::default();
        let err = decode_wal_record(Bytes::from(corrupted), &mut decoded, 17).unwrap_err();
        assert!(matches!(err, DecodeError::BadCrc { .. }));
    }

    #[test]
    fn truncated_header_is_rejected() {
        let record = build_record(RM_XLOG_ID, XLOG_NOOP, 0, &[], b"hello");
        let mut short = record.to_vec();
        short.truncate(10);
        // a declared length smaller than the header is Corrupt territory
        let mut decoded = DecodedWalRecord::default();
        let err = decode_wal_record(Bytes::from(short), &mut decoded, 17).unwrap_err();
        assert!(matches!(err, DecodeError::Underflow));
    }
}
