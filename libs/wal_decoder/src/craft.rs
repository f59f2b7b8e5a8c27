//! Synthesis of WAL segment files.
//!
//! [`SegmentBuilder`] lays records out exactly the way the server does:
//! long header on the first page of each segment, short headers
//! elsewhere, continuation metadata for records that span pages, zero
//! padding where a record header would not fit before a page boundary,
//! and 8-byte alignment between records. Used by the test suites of the
//! reader and the summarizer, and by anything that needs a WAL file
//! fixture without a running server.

use bytes::Bytes;
use camino::Utf8Path;
use utils::lsn::Lsn;

use postgres_ffi::pg_constants::{
    XLP_FIRST_IS_CONTRECORD, XLP_LONG_HEADER, XLR_BLOCK_ID_DATA_LONG, XLR_BLOCK_ID_DATA_SHORT,
    BKPBLOCK_FORK_MASK, BKPBLOCK_SAME_REL,
};
use postgres_ffi::xlog_utils::{
    xlog_file_name, XLogLongPageHeaderData, XLogPageHeaderData,
};
use postgres_ffi::{xlog_page_magic, TimeLineID, XLogRecord, XLOG_SIZE_OF_XLOG_RECORD};

const XLOG_BLCKSZ: usize = postgres_ffi::pg_constants::XLOG_BLCKSZ;

/// Build a single framed record: header, block references without data
/// or images, and a main-data blob, with a valid CRC.
///
/// Each block reference is `(spc_oid, db_oid, rel_number, forknum,
/// blkno)`; a reference of `(0, 0, 0, fork, blkno)` after the first is
/// emitted with `BKPBLOCK_SAME_REL`, inheriting the previous locator.
pub fn build_record(
    rmid: u8,
    info: u8,
    xid: u32,
    blocks: &[(u32, u32, u32, u8, u32)],
    main_data: &[u8],
) -> Bytes {
    let mut body = Vec::new();
    for (i, &(spc, db, rel, fork, blkno)) in blocks.iter().enumerate() {
        let same_rel = i > 0 && spc == 0 && db == 0 && rel == 0;
        body.push(i as u8);
        let mut fork_flags = fork & BKPBLOCK_FORK_MASK;
        if same_rel {
            fork_flags |= BKPBLOCK_SAME_REL;
        }
        body.push(fork_flags);
        body.extend_from_slice(&0u16.to_le_bytes()); // data_len
        if !same_rel {
            body.extend_from_slice(&spc.to_le_bytes());
            body.extend_from_slice(&db.to_le_bytes());
            body.extend_from_slice(&rel.to_le_bytes());
        }
        body.extend_from_slice(&blkno.to_le_bytes());
    }
    if main_data.len() < 256 {
        body.push(XLR_BLOCK_ID_DATA_SHORT);
        body.push(main_data.len() as u8);
    } else {
        body.push(XLR_BLOCK_ID_DATA_LONG);
        body.extend_from_slice(&(main_data.len() as u32).to_le_bytes());
    }
    body.extend_from_slice(main_data);

    let tot_len = (XLOG_SIZE_OF_XLOG_RECORD + body.len()) as u32;
    let mut header = XLogRecord {
        xl_tot_len: tot_len,
        xl_xid: xid,
        xl_prev: 0,
        xl_info: info,
        xl_rmid: rmid,
        xl_crc: 0,
    };
    let header_bytes = header.to_bytes();
    header.xl_crc = XLogRecord::compute_crc(&header_bytes, &body);

    let mut rec = Vec::with_capacity(tot_len as usize);
    rec.extend_from_slice(&header.to_bytes());
    rec.extend_from_slice(&body);
    Bytes::from(rec)
}

pub struct SegmentBuilder {
    page_magic: u16,
    timeline: TimeLineID,
    system_id: u64,
    segment_size: usize,
    start_segno: u64,
    /// All emitted segments, concatenated; index 0 corresponds to the
    /// start of `start_segno`.
    buf: Vec<u8>,
    /// Absolute position, as an LSN.
    pos: u64,
    prev_record_start: u64,
}

impl SegmentBuilder {
    pub fn new(
        pg_version: u32,
        timeline: TimeLineID,
        system_id: u64,
        segment_size: usize,
        start_segno: u64,
    ) -> SegmentBuilder {
        SegmentBuilder {
            page_magic: xlog_page_magic(pg_version).expect("supported version"),
            timeline,
            system_id,
            segment_size,
            start_segno,
            buf: Vec::new(),
            pos: start_segno * segment_size as u64,
            prev_record_start: 0,
        }
    }

    fn page_offset(&self) -> usize {
        (self.pos % XLOG_BLCKSZ as u64) as usize
    }

    fn emit_page_header(&mut self, rem_len: u32) {
        debug_assert_eq!(self.page_offset(), 0);
        let at_segment_start = self.pos % self.segment_size as u64 == 0;
        let mut info = 0u16;
        if rem_len > 0 {
            info |= XLP_FIRST_IS_CONTRECORD;
        }
        if at_segment_start {
            info |= XLP_LONG_HEADER;
        }
        let std = XLogPageHeaderData {
            xlp_magic: self.page_magic,
            xlp_info: info,
            xlp_tli: self.timeline,
            xlp_pageaddr: self.pos,
            xlp_rem_len: rem_len,
        };
        let bytes = if at_segment_start {
            XLogLongPageHeaderData {
                std,
                xlp_sysid: self.system_id,
                xlp_seg_size: self.segment_size as u32,
                xlp_xlog_blcksz: XLOG_BLCKSZ as u32,
            }
            .encode()
        } else {
            std.encode()
        };
        self.pos += bytes.len() as u64;
        self.buf.extend_from_slice(&bytes);
    }

    fn emit_zeros(&mut self, n: usize) {
        self.buf.extend(std::iter::repeat(0u8).take(n));
        self.pos += n as u64;
    }

    /// Append a record built by [`build_record`], fixing up its
    /// back-pointer and CRC for its actual position. Returns the
    /// record's start LSN.
    pub fn append_record(&mut self, rec: impl Into<Vec<u8>>) -> Lsn {
        let mut rec: Vec<u8> = rec.into();
        assert!(rec.len() >= XLOG_SIZE_OF_XLOG_RECORD);

        rec[8..16].copy_from_slice(&self.prev_record_start.to_le_bytes());
        let crc = XLogRecord::compute_crc(&rec, &rec[XLOG_SIZE_OF_XLOG_RECORD..]);
        rec[20..24].copy_from_slice(&crc.to_le_bytes());

        // find a position where the record header fits on the page
        loop {
            if self.page_offset() == 0 {
                self.emit_page_header(0);
            }
            let space = XLOG_BLCKSZ - self.page_offset();
            if space < XLOG_SIZE_OF_XLOG_RECORD {
                self.emit_zeros(space);
                continue;
            }
            break;
        }

        let start = self.pos;
        self.prev_record_start = start;

        let mut written = 0;
        while written < rec.len() {
            if self.page_offset() == 0 {
                self.emit_page_header((rec.len() - written) as u32);
            }
            let space = XLOG_BLCKSZ - self.page_offset();
            let n = space.min(rec.len() - written);
            self.buf.extend_from_slice(&rec[written..written + n]);
            self.pos += n as u64;
            written += n;
        }

        // records start on 8-byte boundaries
        let pad = (Lsn(self.pos).align().0 - self.pos) as usize;
        self.emit_zeros(pad);

        Lsn(start)
    }

    /// Split the stream into named, zero-padded segment files.
    pub fn finish(mut self) -> Vec<(String, Vec<u8>)> {
        let tail = self.buf.len() % self.segment_size;
        if tail > 0 {
            let pad = self.segment_size - tail;
            self.buf.extend(std::iter::repeat(0u8).take(pad));
        }
        self.buf
            .chunks(self.segment_size)
            .enumerate()
            .map(|(i, chunk)| {
                (
                    xlog_file_name(self.timeline, self.start_segno + i as u64, self.segment_size),
                    chunk.to_vec(),
                )
            })
            .collect()
    }

    pub fn write_to_dir(self, dir: impl AsRef<Utf8Path>) -> std::io::Result<()> {
        let dir = dir.as_ref();
        for (name, bytes) in self.finish() {
            std::fs::write(dir.join(name), bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postgres_ffi::pg_constants::{RM_XLOG_ID, XLOG_NOOP};
    use postgres_ffi::WAL_SEGMENT_SIZE;

    #[test]
    fn segments_are_fully_padded_and_named() {
        let mut b = SegmentBuilder::new(17, 3, 1, WAL_SEGMENT_SIZE, 5);
        b.append_record(build_record(RM_XLOG_ID, XLOG_NOOP, 1, &[], b"payload"));
        let segs = b.finish();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].0, "000000030000000000000005");
        assert_eq!(segs[0].1.len(), WAL_SEGMENT_SIZE);
    }

    #[test]
    fn record_starts_are_aligned() {
        let mut b = SegmentBuilder::new(17, 1, 1, WAL_SEGMENT_SIZE, 0);
        for i in 0..20 {
            let lsn = b.append_record(build_record(RM_XLOG_ID, XLOG_NOOP, i, &[], &vec![0xAB; 13]));
            assert_eq!(lsn.0 % 8, 0);
        }
    }
}
