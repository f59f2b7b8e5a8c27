//! WAL segment naming and page header parsing.

use bytes::{Buf, Bytes};

use crate::pg_constants::{XLP_ALL_FLAGS, XLP_LONG_HEADER};
use crate::{TimeLineID, XLogRecPtr};

pub const XLOG_SIZE_OF_XLOG_SHORT_PHD: usize = 24;
pub const XLOG_SIZE_OF_XLOG_LONG_PHD: usize = 40;

/// Number of segments per logical 4 GiB "xlog id", used by the
/// traditional three-part segment file name.
pub const fn xlog_segments_per_xlog_id(wal_segsz_bytes: usize) -> u64 {
    (0x100000000u64 / wal_segsz_bytes as u64) as u64
}

/// Format a WAL segment file name: `TTTTTTTTXXXXXXXXSSSSSSSS`.
pub fn xlog_file_name(tli: TimeLineID, logical_segno: u64, wal_segsz_bytes: usize) -> String {
    format!(
        "{:>08X}{:>08X}{:>08X}",
        tli,
        logical_segno / xlog_segments_per_xlog_id(wal_segsz_bytes),
        logical_segno % xlog_segments_per_xlog_id(wal_segsz_bytes)
    )
}

/// Parse a WAL segment file name into `(segno, timeline)`.
pub fn xlog_from_file_name(fname: &str, wal_seg_size: usize) -> Option<(u64, TimeLineID)> {
    if fname.len() != 24 || !fname.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let tli = u32::from_str_radix(&fname[0..8], 16).ok()?;
    let log = u64::from_str_radix(&fname[8..16], 16).ok()?;
    let seg = u64::from_str_radix(&fname[16..24], 16).ok()?;
    Some((log * xlog_segments_per_xlog_id(wal_seg_size) + seg, tli))
}

/// True for a plain 24-character WAL segment file name.
pub fn is_xlog_file_name(fname: &str) -> bool {
    fname.len() == 24 && fname.bytes().all(|b| b.is_ascii_hexdigit())
}

/// True for a timeline history file name, `TTTTTTTT.history`.
pub fn is_timeline_history_file_name(fname: &str) -> bool {
    fname.len() == 16
        && fname.ends_with(".history")
        && fname[0..8].bytes().all(|b| b.is_ascii_hexdigit())
}

/// The standard page header, present at every 8 KiB WAL page boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLogPageHeaderData {
    pub xlp_magic: u16,
    pub xlp_info: u16,
    pub xlp_tli: TimeLineID,
    pub xlp_pageaddr: XLogRecPtr,
    /// Bytes of the record continued from the previous page, if
    /// `XLP_FIRST_IS_CONTRECORD`.
    pub xlp_rem_len: u32,
}

/// The extended header on the first page of each segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLogLongPageHeaderData {
    pub std: XLogPageHeaderData,
    pub xlp_sysid: u64,
    pub xlp_seg_size: u32,
    pub xlp_xlog_blcksz: u32,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PageHeaderError {
    #[error("short page header: {0} bytes")]
    Short(usize),
    #[error("unexpected page magic {got:#06x}, expected {expected:#06x}")]
    BadMagic { got: u16, expected: u16 },
    #[error("invalid page info bits {0:#06x}")]
    BadInfo(u16),
}

impl XLogPageHeaderData {
    pub fn from_bytes(buf: &mut Bytes, expected_magic: u16) -> Result<Self, PageHeaderError> {
        if buf.remaining() < XLOG_SIZE_OF_XLOG_SHORT_PHD {
            return Err(PageHeaderError::Short(buf.remaining()));
        }
        let hdr = XLogPageHeaderData {
            xlp_magic: buf.get_u16_le(),
            xlp_info: buf.get_u16_le(),
            xlp_tli: buf.get_u32_le(),
            xlp_pageaddr: buf.get_u64_le(),
            xlp_rem_len: {
                let rem_len = buf.get_u32_le();
                buf.advance(4); // alignment padding
                rem_len
            },
        };
        if hdr.xlp_magic != expected_magic {
            return Err(PageHeaderError::BadMagic {
                got: hdr.xlp_magic,
                expected: expected_magic,
            });
        }
        if hdr.xlp_info & !XLP_ALL_FLAGS != 0 {
            return Err(PageHeaderError::BadInfo(hdr.xlp_info));
        }
        Ok(hdr)
    }

    pub fn is_long_header(&self) -> bool {
        self.xlp_info & XLP_LONG_HEADER != 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(XLOG_SIZE_OF_XLOG_SHORT_PHD);
        out.extend_from_slice(&self.xlp_magic.to_le_bytes());
        out.extend_from_slice(&self.xlp_info.to_le_bytes());
        out.extend_from_slice(&self.xlp_tli.to_le_bytes());
        out.extend_from_slice(&self.xlp_pageaddr.to_le_bytes());
        out.extend_from_slice(&self.xlp_rem_len.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out
    }
}

impl XLogLongPageHeaderData {
    pub fn from_bytes(buf: &mut Bytes, expected_magic: u16) -> Result<Self, PageHeaderError> {
        let std = XLogPageHeaderData::from_bytes(buf, expected_magic)?;
        if buf.remaining() < XLOG_SIZE_OF_XLOG_LONG_PHD - XLOG_SIZE_OF_XLOG_SHORT_PHD {
            return Err(PageHeaderError::Short(buf.remaining()));
        }
        Ok(XLogLongPageHeaderData {
            std,
            xlp_sysid: buf.get_u64_le(),
            xlp_seg_size: buf.get_u32_le(),
            xlp_xlog_blcksz: buf.get_u32_le(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.std.encode();
        out.extend_from_slice(&self.xlp_sysid.to_le_bytes());
        out.extend_from_slice(&self.xlp_seg_size.to_le_bytes());
        out.extend_from_slice(&self.xlp_xlog_blcksz.to_le_bytes());
        out
    }
}

/// One parent-timeline line of a `.history` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineHistoryEntry {
    pub tli: TimeLineID,
    /// The LSN at which this timeline was switched away from, i.e. the
    /// first position that belongs to a descendant timeline.
    pub switchpoint: XLogRecPtr,
}

/// Parse the contents of a timeline `.history` file: one
/// `tli<TAB>lsn<TAB>reason` line per ancestor, comments with `#`.
pub fn parse_timeline_history(content: &str) -> anyhow::Result<Vec<TimelineHistoryEntry>> {
    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let tli: TimeLineID = fields
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing timeline id in history line {line:?}"))?
            .parse()?;
        let lsn_str = fields
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing switchpoint in history line {line:?}"))?;
        let lsn: utils::lsn::Lsn = lsn_str
            .parse()
            .map_err(|_| anyhow::anyhow!("bad switchpoint LSN {lsn_str:?}"))?;
        entries.push(TimelineHistoryEntry {
            tli,
            switchpoint: lsn.0,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg_constants::XLOG_PAGE_MAGIC_V17;
    use crate::WAL_SEGMENT_SIZE;

    #[test]
    fn segment_names() {
        assert_eq!(xlog_file_name(1, 1, WAL_SEGMENT_SIZE), "000000010000000000000001");
        // segment 256 rolls into the next logical xlog id
        assert_eq!(xlog_file_name(1, 256, WAL_SEGMENT_SIZE), "000000010000000100000000");
        assert_eq!(
            xlog_from_file_name("000000010000000100000000", WAL_SEGMENT_SIZE),
            Some((256, 1))
        );
        assert!(is_xlog_file_name("00000001000000000000000A"));
        assert!(!is_xlog_file_name("00000001.history"));
        assert!(is_timeline_history_file_name("00000002.history"));
    }

    #[test]
    fn page_header_roundtrip() {
        let hdr = XLogPageHeaderData {
            xlp_magic: XLOG_PAGE_MAGIC_V17,
            xlp_info: XLP_LONG_HEADER,
            xlp_tli: 1,
            xlp_pageaddr: 0x2_0000_0000,
            xlp_rem_len: 0,
        };
        let long = XLogLongPageHeaderData {
            std: hdr,
            xlp_sysid: 0x1122_3344_5566_7788,
            xlp_seg_size: WAL_SEGMENT_SIZE as u32,
            xlp_xlog_blcksz: 8192,
        };
        let mut buf = Bytes::from(long.encode());
        let parsed = XLogLongPageHeaderData::from_bytes(&mut buf, XLOG_PAGE_MAGIC_V17).unwrap();
        assert_eq!(parsed, long);
        assert!(parsed.std.is_long_header());
    }

    #[test]
    fn history_parsing() {
        let content = "# comment\n1\t0/3000000\tno recovery target\n2 1/0 reason text\n";
        let entries = parse_timeline_history(content).unwrap();
        assert_eq!(
            entries,
            vec![
                TimelineHistoryEntry { tli: 1, switchpoint: 0x3000000 },
                TimelineHistoryEntry { tli: 2, switchpoint: 0x1_0000_0000 },
            ]
        );
        assert!(parse_timeline_history("x y\n").is_err());
    }
}
