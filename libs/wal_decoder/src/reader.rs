//! Segment-spanning WAL record framing.
//!
//! [`WalStreamDecoder`] is a push parser: the caller feeds raw segment
//! bytes and polls for complete records. It tracks page boundaries,
//! validates page headers, reassembles records that continue across
//! pages and segments, and recognizes the zeroed tail that marks the end
//! of valid WAL. [`WalSegmentScanner`] drives the decoder over the
//! segment files of one timeline in a directory.

use std::fs::File;
use std::io::Read;

use bytes::{Buf, Bytes, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;
use utils::lsn::Lsn;

use postgres_ffi::pg_constants::{
    RM_XLOG_ID, XLOG_SWITCH, XLP_FIRST_IS_CONTRECORD, XLR_RMGR_INFO_MASK,
};
use postgres_ffi::xlog_utils::{
    xlog_file_name, xlog_from_file_name, XLogLongPageHeaderData, XLogPageHeaderData,
    XLOG_SIZE_OF_XLOG_LONG_PHD, XLOG_SIZE_OF_XLOG_SHORT_PHD,
};
use postgres_ffi::{
    xlog_page_magic, TimeLineID, XLogRecord, XLOG_SIZE_OF_XLOG_RECORD,
};

/// How the decoder failed. The scanner maps these onto the caller-facing
/// error taxonomy: magic mismatches mid-stream count as truncation, CRC
/// failures are corruption that a best-effort scan may step over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    PageHeader,
    BadMagic,
    Framing,
    Crc,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid WAL at {lsn}: {msg}")]
pub struct WalDecodeError {
    pub kind: DecodeErrorKind,
    pub lsn: Lsn,
    pub msg: String,
}

/// Errors surfaced by [`WalSegmentScanner`].
#[derive(Debug, thiserror::Error)]
pub enum WalReaderError {
    #[error("corrupt WAL record at {lsn}: {msg}")]
    Corrupt { lsn: Lsn, msg: String },
    #[error("WAL ends prematurely after {last_good_lsn}: {msg}")]
    Truncated { last_good_lsn: Lsn, msg: String },
    #[error("record at {lsn} continues across a timeline switch")]
    TimelineSwitchMidRecord { lsn: Lsn },
    #[error("unsupported PostgreSQL major version {0}")]
    VersionMismatch(u32),
    #[error("failed to read {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A record caught in flight at a segment boundary: the bytes collected
/// so far, split into the fixed header and the payload.
pub struct PartialRecord {
    pub start_lsn: Lsn,
    pub total_len: u32,
    pub header_bytes_seen: usize,
    pub payload_bytes_seen: usize,
    pub header_buf: [u8; XLOG_SIZE_OF_XLOG_RECORD],
    pub payload_buf: Vec<u8>,
}

impl PartialRecord {
    fn new(start_lsn: Lsn, total_len: u32) -> Self {
        PartialRecord {
            start_lsn,
            total_len,
            header_bytes_seen: 0,
            payload_bytes_seen: 0,
            header_buf: [0; XLOG_SIZE_OF_XLOG_RECORD],
            payload_buf: Vec::with_capacity(total_len as usize - XLOG_SIZE_OF_XLOG_RECORD),
        }
    }

    /// Bytes still missing.
    fn remaining(&self) -> usize {
        self.total_len as usize - self.header_bytes_seen - self.payload_bytes_seen
    }

    fn absorb(&mut self, chunk: &[u8]) {
        let mut chunk = chunk;
        if self.header_bytes_seen < XLOG_SIZE_OF_XLOG_RECORD {
            let take = chunk.len().min(XLOG_SIZE_OF_XLOG_RECORD - self.header_bytes_seen);
            self.header_buf[self.header_bytes_seen..self.header_bytes_seen + take]
                .copy_from_slice(&chunk[..take]);
            self.header_bytes_seen += take;
            chunk = &chunk[take..];
        }
        self.payload_buf.extend_from_slice(chunk);
        self.payload_bytes_seen = self.payload_buf.len();
    }

    fn into_record(self) -> Bytes {
        let mut rec = BytesMut::with_capacity(self.total_len as usize);
        rec.extend_from_slice(&self.header_buf[..self.header_bytes_seen]);
        rec.extend_from_slice(&self.payload_buf);
        rec.freeze()
    }
}

enum DecoderState {
    WaitingForRecord,
    /// Continuation bytes of a record whose start predates the scan.
    SkippingContinuation { remaining: u32 },
    Reassembling(PartialRecord),
    /// After an XLOG_SWITCH record: the rest of the segment is padding.
    SkippingToSegmentEnd,
    EndOfWal,
}

pub struct WalStreamDecoder {
    lsn: Lsn,
    pg_version: u32,
    segment_size: usize,
    timeline: TimeLineID,
    page_magic: u16,
    system_id: Option<u64>,
    /// Start LSN of the previous framed record, for xl_prev validation.
    prev_record_lsn: Lsn,
    /// Alignment padding still to consume before the next record.
    padlen: usize,
    inputbuf: BytesMut,
    state: DecoderState,
}

const XLOG_BLCKSZ: usize = postgres_ffi::pg_constants::XLOG_BLCKSZ;

impl WalStreamDecoder {
    /// Start decoding at `lsn`, which must sit on a page boundary (the
    /// scanner always starts at the beginning of a segment).
    pub fn new(
        lsn: Lsn,
        pg_version: u32,
        timeline: TimeLineID,
        segment_size: usize,
    ) -> Result<WalStreamDecoder, WalReaderError> {
        let page_magic =
            xlog_page_magic(pg_version).ok_or(WalReaderError::VersionMismatch(pg_version))?;
        assert_eq!(lsn.block_offset(XLOG_BLCKSZ as u64), 0);
        Ok(WalStreamDecoder {
            lsn,
            pg_version,
            segment_size,
            timeline,
            page_magic,
            system_id: None,
            prev_record_lsn: Lsn::INVALID,
            padlen: 0,
            inputbuf: BytesMut::new(),
            state: DecoderState::WaitingForRecord,
        })
    }

    pub fn feed_bytes(&mut self, buf: &[u8]) {
        self.inputbuf.extend_from_slice(buf);
    }

    /// The decode position: everything before this LSN has been consumed.
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    pub fn is_end_of_wal(&self) -> bool {
        matches!(self.state, DecoderState::EndOfWal)
    }

    /// True while a record is only partially assembled.
    pub fn mid_record(&self) -> bool {
        matches!(
            self.state,
            DecoderState::Reassembling(_) | DecoderState::SkippingContinuation { .. }
        )
    }

    fn err(&self, kind: DecodeErrorKind, msg: impl Into<String>) -> WalDecodeError {
        WalDecodeError {
            kind,
            lsn: self.lsn,
            msg: msg.into(),
        }
    }

    /// Try to frame the next record out of the bytes fed so far.
    ///
    /// `Ok(None)` means more input is needed (or the end of WAL was
    /// reached; check [`Self::is_end_of_wal`]). After a `Crc` error the
    /// decoder remains positioned past the offending record, so a
    /// best-effort caller can keep polling.
    pub fn poll_decode(&mut self) -> Result<Option<(Lsn, Bytes)>, WalDecodeError> {
        loop {
            // Alignment padding between records never crosses a page
            // boundary, so consume it before looking at page headers.
            if self.padlen > 0 {
                let take = self.padlen.min(self.inputbuf.remaining());
                if take == 0 {
                    return Ok(None);
                }
                self.inputbuf.advance(take);
                self.lsn += take as u64;
                self.padlen -= take;
                continue;
            }

            // After a switch record the rest of the segment is zeros,
            // without page headers, so skip it before header handling.
            if matches!(self.state, DecoderState::SkippingToSegmentEnd) {
                let seg_remaining = self.segment_size
                    - self.lsn.segment_offset(self.segment_size as u64) as usize;
                let take = seg_remaining.min(self.inputbuf.remaining());
                if take == 0 {
                    return Ok(None);
                }
                self.inputbuf.advance(take);
                self.lsn += take as u64;
                if self.lsn.segment_offset(self.segment_size as u64) == 0 {
                    self.state = DecoderState::WaitingForRecord;
                }
                continue;
            }

            // Page boundary: a header comes first.
            if self.lsn.block_offset(XLOG_BLCKSZ as u64) == 0 {
                if !self.consume_page_header()? {
                    return Ok(None);
                }
                continue;
            }

            let page_off = self.lsn.block_offset(XLOG_BLCKSZ as u64) as usize;
            let page_remaining = XLOG_BLCKSZ - page_off;

            match &mut self.state {
                DecoderState::WaitingForRecord => {
                    if page_remaining < XLOG_SIZE_OF_XLOG_RECORD {
                        // no record fits here: the rest of the page is padding
                        let take = page_remaining.min(self.inputbuf.remaining());
                        if take == 0 {
                            return Ok(None);
                        }
                        self.inputbuf.advance(take);
                        self.lsn += take as u64;
                        continue;
                    }
                    if self.inputbuf.remaining() < 4 {
                        return Ok(None);
                    }
                    let total_len = u32::from_le_bytes(self.inputbuf[0..4].try_into().unwrap());
                    if total_len == 0 {
                        // zeroed tail: end of valid WAL
                        self.state = DecoderState::EndOfWal;
                        return Ok(None);
                    }
                    if (total_len as usize) < XLOG_SIZE_OF_XLOG_RECORD {
                        return Err(self.err(
                            DecodeErrorKind::Framing,
                            format!("invalid record length {total_len}"),
                        ));
                    }
                    self.state =
                        DecoderState::Reassembling(PartialRecord::new(self.lsn, total_len));
                    continue;
                }
                DecoderState::Reassembling(partial) => {
                    let take = partial
                        .remaining()
                        .min(page_remaining)
                        .min(self.inputbuf.remaining());
                    if take == 0 {
                        return Ok(None);
                    }
                    let chunk = self.inputbuf.split_to(take);
                    partial.absorb(&chunk);
                    self.lsn += take as u64;
                    if partial.remaining() > 0 {
                        continue;
                    }
                    // complete: swap the state out and finish the record
                    let partial = match std::mem::replace(
                        &mut self.state,
                        DecoderState::WaitingForRecord,
                    ) {
                        DecoderState::Reassembling(p) => p,
                        _ => unreachable!(),
                    };
                    return self.finish_record(partial).map(Some);
                }
                DecoderState::SkippingContinuation { remaining } => {
                    let take = (*remaining as usize)
                        .min(page_remaining)
                        .min(self.inputbuf.remaining());
                    if take == 0 {
                        return Ok(None);
                    }
                    self.inputbuf.advance(take);
                    self.lsn += take as u64;
                    *remaining -= take as u32;
                    if *remaining == 0 {
                        self.padlen = (self.lsn.align().0 - self.lsn.0) as usize;
                        self.state = DecoderState::WaitingForRecord;
                    }
                    continue;
                }
                DecoderState::SkippingToSegmentEnd => unreachable!("handled above"),
                DecoderState::EndOfWal => return Ok(None),
            }
        }
    }

    /// Parse and validate the page header at the current position.
    /// Returns false if more input is needed.
    fn consume_page_header(&mut self) -> Result<bool, WalDecodeError> {
        let at_segment_start = self.lsn.segment_offset(self.segment_size as u64) == 0;
        let hdr_len = if at_segment_start {
            XLOG_SIZE_OF_XLOG_LONG_PHD
        } else {
            XLOG_SIZE_OF_XLOG_SHORT_PHD
        };
        if self.inputbuf.remaining() < hdr_len {
            return Ok(false);
        }
        if !self.mid_record() && self.inputbuf[..hdr_len].iter().all(|&b| b == 0) {
            // a zeroed page between records: the valid WAL ended on the
            // previous page
            self.state = DecoderState::EndOfWal;
            return Ok(false);
        }
        let mut buf = Bytes::copy_from_slice(&self.inputbuf[..hdr_len]);
        let hdr = if at_segment_start {
            let long = XLogLongPageHeaderData::from_bytes(&mut buf, self.page_magic)
                .map_err(|e| self.err(magic_kind(&e), e.to_string()))?;
            if !long.std.is_long_header() {
                return Err(self.err(
                    DecodeErrorKind::PageHeader,
                    "missing long header at segment start",
                ));
            }
            if long.xlp_seg_size as usize != self.segment_size {
                return Err(self.err(
                    DecodeErrorKind::PageHeader,
                    format!("segment size mismatch: {}", long.xlp_seg_size),
                ));
            }
            if long.xlp_xlog_blcksz as usize != XLOG_BLCKSZ {
                return Err(self.err(
                    DecodeErrorKind::PageHeader,
                    format!("block size mismatch: {}", long.xlp_xlog_blcksz),
                ));
            }
            match self.system_id {
                None => self.system_id = Some(long.xlp_sysid),
                Some(sysid) if sysid != long.xlp_sysid => {
                    return Err(self.err(
                        DecodeErrorKind::PageHeader,
                        format!("system identifier changed to {:#x}", long.xlp_sysid),
                    ));
                }
                Some(_) => {}
            }
            long.std
        } else {
            let hdr = XLogPageHeaderData::from_bytes(&mut buf, self.page_magic)
                .map_err(|e| self.err(magic_kind(&e), e.to_string()))?;
            if hdr.is_long_header() {
                return Err(self.err(
                    DecodeErrorKind::PageHeader,
                    "long header in the middle of a segment",
                ));
            }
            hdr
        };

        if hdr.xlp_pageaddr != self.lsn.0 {
            return Err(self.err(
                DecodeErrorKind::PageHeader,
                format!("page address {:#x} does not match position", hdr.xlp_pageaddr),
            ));
        }
        if hdr.xlp_tli != self.timeline {
            return Err(self.err(
                DecodeErrorKind::PageHeader,
                format!("timeline {} on page, expected {}", hdr.xlp_tli, self.timeline),
            ));
        }

        let contrecord = hdr.xlp_info & XLP_FIRST_IS_CONTRECORD != 0;
        match &mut self.state {
            DecoderState::Reassembling(partial) => {
                if !contrecord || hdr.xlp_rem_len as usize != partial.remaining() {
                    return Err(WalDecodeError {
                        kind: DecodeErrorKind::Framing,
                        lsn: self.lsn,
                        msg: format!(
                            "continuation mismatch: page claims {} bytes, record needs {}",
                            if contrecord { hdr.xlp_rem_len as i64 } else { -1 },
                            partial.remaining()
                        ),
                    });
                }
            }
            DecoderState::SkippingContinuation { remaining } => {
                if !contrecord || hdr.xlp_rem_len != *remaining {
                    return Err(self.err(
                        DecodeErrorKind::Framing,
                        "continuation mismatch while skipping",
                    ));
                }
            }
            DecoderState::WaitingForRecord => {
                if contrecord {
                    // a record started before our scan window; skip its tail
                    self.state = DecoderState::SkippingContinuation {
                        remaining: hdr.xlp_rem_len,
                    };
                }
            }
            DecoderState::SkippingToSegmentEnd | DecoderState::EndOfWal => {}
        }

        self.inputbuf.advance(hdr_len);
        self.lsn += hdr_len as u64;
        Ok(true)
    }

    /// Validate an assembled record and hand it out.
    fn finish_record(&mut self, partial: PartialRecord) -> Result<(Lsn, Bytes), WalDecodeError> {
        let start_lsn = partial.start_lsn;
        let record = partial.into_record();
        self.padlen = (self.lsn.align().0 - self.lsn.0) as usize;

        let mut hdr_buf = record.clone();
        let xlogrec = XLogRecord::from_bytes(&mut hdr_buf).map_err(|e| WalDecodeError {
            kind: DecodeErrorKind::Framing,
            lsn: start_lsn,
            msg: e.to_string(),
        })?;

        if self.prev_record_lsn.is_valid() && xlogrec.xl_prev != self.prev_record_lsn.0 {
            return Err(WalDecodeError {
                kind: DecodeErrorKind::Framing,
                lsn: start_lsn,
                msg: format!(
                    "xl_prev {:#x} does not point at the previous record {}",
                    xlogrec.xl_prev, self.prev_record_lsn
                ),
            });
        }

        let computed =
            XLogRecord::compute_crc(&record, &record[XLOG_SIZE_OF_XLOG_RECORD..]);
        if computed != xlogrec.xl_crc {
            // position is already past the record; a best-effort caller
            // may continue polling, but the xl_prev chain is broken
            self.prev_record_lsn = Lsn::INVALID;
            return Err(WalDecodeError {
                kind: DecodeErrorKind::Crc,
                lsn: start_lsn,
                msg: format!("CRC mismatch: computed {computed:#010x}, header {:#010x}", xlogrec.xl_crc),
            });
        }
        self.prev_record_lsn = start_lsn;

        if xlogrec.xl_rmid == RM_XLOG_ID
            && (xlogrec.xl_info & XLR_RMGR_INFO_MASK) == XLOG_SWITCH
        {
            self.padlen = 0;
            // nothing to skip when the switch record ends the segment
            if self.lsn.segment_offset(self.segment_size as u64) != 0 {
                self.state = DecoderState::SkippingToSegmentEnd;
            }
        }

        Ok((start_lsn, record))
    }
}

fn magic_kind(e: &postgres_ffi::xlog_utils::PageHeaderError) -> DecodeErrorKind {
    use postgres_ffi::xlog_utils::PageHeaderError;
    match e {
        PageHeaderError::BadMagic { .. } => DecodeErrorKind::BadMagic,
        _ => DecodeErrorKind::PageHeader,
    }
}

const READ_CHUNK: usize = 128 * 1024;

/// Iterates the records of one timeline's WAL, opening consecutive
/// segment files from `dir` as the decoder drains them.
pub struct WalSegmentScanner {
    dir: Utf8PathBuf,
    timeline: TimeLineID,
    segment_size: usize,
    decoder: WalStreamDecoder,
    file: Option<File>,
    /// Segment the decoder is currently positioned in.
    segno: u64,
    /// Bytes fed from the current segment file.
    fed: usize,
    best_effort: bool,
    last_good_lsn: Lsn,
    done: bool,
}

impl WalSegmentScanner {
    /// Start scanning at the beginning of the segment containing
    /// `start_lsn`. The caller filters out records before `start_lsn`.
    pub fn new(
        dir: impl AsRef<Utf8Path>,
        pg_version: u32,
        timeline: TimeLineID,
        segment_size: usize,
        start_lsn: Lsn,
        best_effort: bool,
    ) -> Result<WalSegmentScanner, WalReaderError> {
        let segno = start_lsn.segment_number(segment_size as u64);
        let seg_start = Lsn(segno * segment_size as u64);
        let decoder = WalStreamDecoder::new(seg_start, pg_version, timeline, segment_size)?;
        Ok(WalSegmentScanner {
            dir: dir.as_ref().to_path_buf(),
            timeline,
            segment_size,
            decoder,
            file: None,
            segno,
            fed: 0,
            best_effort,
            last_good_lsn: start_lsn,
            done: false,
        })
    }

    fn segment_path(&self, segno: u64) -> Utf8PathBuf {
        self.dir
            .join(xlog_file_name(self.timeline, segno, self.segment_size))
    }

    /// Whether some timeline other than ours has the given segment; this
    /// distinguishes a timeline switch from plainly missing WAL.
    fn other_timeline_has_segment(&self, segno: u64) -> bool {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return false;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((seg, tli)) = xlog_from_file_name(name, self.segment_size) {
                if seg == segno && tli != self.timeline {
                    return true;
                }
            }
        }
        false
    }

    /// The byte position the scan has consumed up to.
    pub fn position(&self) -> Lsn {
        self.decoder.lsn()
    }

    /// The next framed record, or None when the valid WAL (or the last
    /// available segment) has been exhausted cleanly.
    pub fn next_record(&mut self) -> Result<Option<(Lsn, Bytes)>, WalReaderError> {
        if self.done {
            return Ok(None);
        }
        loop {
            match self.decoder.poll_decode() {
                Ok(Some((lsn, rec))) => {
                    self.last_good_lsn = lsn;
                    return Ok(Some((lsn, rec)));
                }
                Ok(None) => {
                    if self.decoder.is_end_of_wal() {
                        self.done = true;
                        return Ok(None);
                    }
                    if !self.feed_more()? {
                        return Ok(None);
                    }
                }
                Err(e) if e.kind == DecodeErrorKind::Crc => {
                    if self.best_effort {
                        warn!("skipping record with bad CRC at {}: {}", e.lsn, e.msg);
                        continue;
                    }
                    return Err(WalReaderError::Corrupt {
                        lsn: e.lsn,
                        msg: e.msg,
                    });
                }
                Err(e) if e.kind == DecodeErrorKind::BadMagic => {
                    return Err(WalReaderError::Truncated {
                        last_good_lsn: self.last_good_lsn,
                        msg: e.msg,
                    });
                }
                Err(e) => {
                    return Err(WalReaderError::Corrupt {
                        lsn: e.lsn,
                        msg: e.msg,
                    });
                }
            }
        }
    }

    /// Pull another chunk from the current segment, rolling over to the
    /// next segment file when one is exhausted. Returns false when the
    /// scan is over (no further segment exists and nothing is pending).
    fn feed_more(&mut self) -> Result<bool, WalReaderError> {
        if self.file.is_none() {
            let path = self.segment_path(self.segno);
            match File::open(&path) {
                Ok(f) => {
                    self.file = Some(f);
                    self.fed = 0;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if self.decoder.mid_record() {
                        if self.other_timeline_has_segment(self.segno) {
                            return Err(WalReaderError::TimelineSwitchMidRecord {
                                lsn: self.decoder.lsn(),
                            });
                        }
                        return Err(WalReaderError::Truncated {
                            last_good_lsn: self.last_good_lsn,
                            msg: format!("segment {path} is missing"),
                        });
                    }
                    self.done = true;
                    return Ok(false);
                }
                Err(e) => {
                    return Err(WalReaderError::Io {
                        path,
                        source: e,
                    })
                }
            }
        }

        let mut chunk = vec![0u8; READ_CHUNK.min(self.segment_size - self.fed)];
        let path = self.segment_path(self.segno);
        let file = self.file.as_mut().unwrap();
        let mut filled = 0;
        while filled < chunk.len() {
            let n = file.read(&mut chunk[filled..]).map_err(|e| WalReaderError::Io {
                path: path.clone(),
                source: e,
            })?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            // end of this file
            if self.fed < self.segment_size {
                return Err(WalReaderError::Truncated {
                    last_good_lsn: self.last_good_lsn,
                    msg: format!(
                        "segment {} is short: {} of {} bytes",
                        self.segment_path(self.segno),
                        self.fed,
                        self.segment_size
                    ),
                });
            }
            self.file = None;
            self.segno += 1;
            return Ok(true);
        }

        self.fed += filled;
        self.decoder.feed_bytes(&chunk[..filled]);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::craft::{build_record, SegmentBuilder};
    use camino_tempfile::tempdir;
    use postgres_ffi::pg_constants::*;
    use postgres_ffi::WAL_SEGMENT_SIZE;

    const PG: u32 = 17;
    const SYSID: u64 = 0xfeed_f00d_cafe_0001;

    fn small_record(i: u32) -> Vec<u8> {
        let payload = vec![i as u8; 32];
        build_record(RM_XLOG_ID, XLOG_NOOP, i, &[], &payload).to_vec()
    }

    #[test]
    fn roundtrip_single_segment() {
        let dir = tempdir().unwrap();
        let mut builder = SegmentBuilder::new(PG, 1, SYSID, WAL_SEGMENT_SIZE, 1);
        let mut expected = Vec::new();
        for i in 0..50 {
            expected.push(builder.append_record(small_record(i)));
        }
        builder.write_to_dir(dir.path()).unwrap();

        let mut scanner = WalSegmentScanner::new(
            dir.path(),
            PG,
            1,
            WAL_SEGMENT_SIZE,
            Lsn(WAL_SEGMENT_SIZE as u64),
            false,
        )
        .unwrap();
        let mut got = Vec::new();
        while let Some((lsn, _rec)) = scanner.next_record().unwrap() {
            got.push(lsn);
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn record_spanning_pages_and_segments() {
        let dir = tempdir().unwrap();
        let mut builder = SegmentBuilder::new(PG, 1, SYSID, WAL_SEGMENT_SIZE, 1);
        // fill most of the first segment (leaving room for the per-page
        // headers), then a record large enough to cross into the second
        let filler = vec![7u8; WAL_SEGMENT_SIZE - 100 * 1024];
        let first = builder.append_record(build_record(RM_XLOG_ID, XLOG_NOOP, 1, &[], &filler));
        let spanning =
            builder.append_record(build_record(RM_XLOG_ID, XLOG_NOOP, 2, &[], &vec![9u8; 128 * 1024]));
        let after = builder.append_record(small_record(3));
        builder.write_to_dir(dir.path()).unwrap();

        let mut scanner = WalSegmentScanner::new(
            dir.path(),
            PG,
            1,
            WAL_SEGMENT_SIZE,
            Lsn(WAL_SEGMENT_SIZE as u64),
            false,
        )
        .unwrap();
        let mut got = Vec::new();
        while let Some((lsn, rec)) = scanner.next_record().unwrap() {
            got.push((lsn, rec.len()));
        }
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].0, first);
        assert_eq!(got[1].0, spanning);
        assert_eq!(got[2].0, after);
        // the spanning record really does start in segment 1 and end in 2
        assert_eq!(spanning.segment_number(WAL_SEGMENT_SIZE as u64), 1);
        assert_eq!(after.segment_number(WAL_SEGMENT_SIZE as u64), 2);
    }

    #[test]
    fn missing_next_segment_mid_record_is_truncated() {
        let dir = tempdir().unwrap();
        let mut builder = SegmentBuilder::new(PG, 1, SYSID, WAL_SEGMENT_SIZE, 1);
        builder.append_record(build_record(
            RM_XLOG_ID,
            XLOG_NOOP,
            1,
            &[],
            &vec![7u8; WAL_SEGMENT_SIZE - 100 * 1024],
        ));
        builder.append_record(build_record(RM_XLOG_ID, XLOG_NOOP, 2, &[], &vec![9u8; 64 * 1024]));
        builder.write_to_dir(dir.path()).unwrap();
        // drop the second segment: the spanning record cannot complete
        std::fs::remove_file(dir.path().join(xlog_file_name(1, 2, WAL_SEGMENT_SIZE))).unwrap();

        let mut scanner = WalSegmentScanner::new(
            dir.path(),
            PG,
            1,
            WAL_SEGMENT_SIZE,
            Lsn(WAL_SEGMENT_SIZE as u64),
            false,
        )
        .unwrap();
        // first record frames fine
        scanner.next_record().unwrap().unwrap();
        let err = loop {
            match scanner.next_record() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("expected truncation"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, WalReaderError::Truncated { .. }));
    }

    #[test]
    fn corrupt_crc_skipped_in_best_effort() {
        let dir = tempdir().unwrap();
        let mut builder = SegmentBuilder::new(PG, 1, SYSID, WAL_SEGMENT_SIZE, 1);
        let first = builder.append_record(small_record(1));
        let second = builder.append_record(small_record(2));
        let third = builder.append_record(small_record(3));
        let mut segments = builder.finish();
        assert_eq!(segments.len(), 1);
        // flip a payload byte of the middle record
        let off = (second.0 as usize - WAL_SEGMENT_SIZE) + XLOG_SIZE_OF_XLOG_RECORD + 4;
        segments[0].1[off] ^= 0xff;
        std::fs::write(dir.path().join(&segments[0].0), &segments[0].1).unwrap();

        // strict scan reports Corrupt at the record's LSN
        let mut strict = WalSegmentScanner::new(
            dir.path(),
            PG,
            1,
            WAL_SEGMENT_SIZE,
            Lsn(WAL_SEGMENT_SIZE as u64),
            false,
        )
        .unwrap();
        assert_eq!(strict.next_record().unwrap().unwrap().0, first);
        match strict.next_record() {
            Err(WalReaderError::Corrupt { lsn, .. }) => assert_eq!(lsn, second),
            other => panic!("expected Corrupt, got {other:?}"),
        }

        // best-effort scan steps over it
        let mut lax = WalSegmentScanner::new(
            dir.path(),
            PG,
            1,
            WAL_SEGMENT_SIZE,
            Lsn(WAL_SEGMENT_SIZE as u64),
            true,
        )
        .unwrap();
        let mut got = Vec::new();
        while let Some((lsn, _)) = lax.next_record().unwrap() {
            got.push(lsn);
        }
        assert_eq!(got, vec![first, third]);
    }
}
