//! The sparse file format used by incremental backups.
//!
//! A relation file that is only partially modified since the parent
//! backup is stored as a header plus the modified 8 KiB pages:
//!
//! ```text
//! magic                   u32  (0xd3ae1f0d)
//! version                 u32  (1)
//! block_count             u32
//! truncation_block_length u32  source file length in blocks at backup time
//! block numbers           block_count x u32, ascending, file-relative
//! page images             block_count x 8192 bytes
//! ```
//!
//! In the backup's data directory the file keeps the source's relative
//! path with an `INCREMENTAL.` prefix on the file name. An unmodified
//! relation file is stored as a zero-block sparse file, so the presence
//! of every relation is recorded and a missing entry means the file was
//! removed.

use bytes::{Buf, Bytes};
use camino::Utf8Path;

use postgres_ffi::BLCKSZ;

use crate::error::{Error, Result};

pub const INCREMENTAL_MAGIC: u32 = 0xd3ae1f0d;
pub const INCREMENTAL_VERSION: u32 = 1;
pub const INCREMENTAL_PREFIX: &str = "INCREMENTAL.";

const BLOCK_SIZE: usize = BLCKSZ as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseFile {
    /// Source file length, in blocks, when the backup was taken.
    pub truncation_block_length: u32,
    /// Ascending, file-relative block numbers with an image below.
    pub blocks: Vec<u32>,
    /// `blocks.len()` page images, concatenated.
    pub images: Vec<u8>,
}

impl SparseFile {
    pub fn new(truncation_block_length: u32) -> SparseFile {
        SparseFile {
            truncation_block_length,
            blocks: Vec::new(),
            images: Vec::new(),
        }
    }

    /// Pick the listed blocks out of a source file's bytes. Blocks past
    /// the current end of file are skipped; the file may have shrunk
    /// since the blocks were recorded.
    pub fn from_bytes(bytes: &[u8], mut wanted: Vec<u32>) -> SparseFile {
        let nblocks = (bytes.len() / BLOCK_SIZE) as u32;
        wanted.sort_unstable();
        wanted.dedup();

        let mut sparse = SparseFile::new(nblocks);
        for blkno in wanted {
            if blkno >= nblocks {
                continue;
            }
            let off = blkno as usize * BLOCK_SIZE;
            sparse.blocks.push(blkno);
            sparse.images.extend_from_slice(&bytes[off..off + BLOCK_SIZE]);
        }
        sparse
    }

    pub fn from_source(source: &Utf8Path, wanted: Vec<u32>) -> Result<SparseFile> {
        let bytes = std::fs::read(source).map_err(|e| Error::io(source, e))?;
        Ok(Self::from_bytes(&bytes, wanted))
    }

    pub fn image(&self, index: usize) -> &[u8] {
        &self.images[index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE]
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.blocks.len() * (4 + BLOCK_SIZE));
        out.extend_from_slice(&INCREMENTAL_MAGIC.to_le_bytes());
        out.extend_from_slice(&INCREMENTAL_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.truncation_block_length.to_le_bytes());
        for blkno in &self.blocks {
            out.extend_from_slice(&blkno.to_le_bytes());
        }
        out.extend_from_slice(&self.images);
        out
    }

    pub fn decode(bytes: &[u8], what: &str) -> Result<SparseFile> {
        let corrupt = || Error::corrupt(format!("incremental file {what}"));
        let mut buf = Bytes::copy_from_slice(bytes);
        if buf.remaining() < 16 {
            return Err(corrupt());
        }
        if buf.get_u32_le() != INCREMENTAL_MAGIC {
            return Err(corrupt());
        }
        let version = buf.get_u32_le();
        if version != INCREMENTAL_VERSION {
            return Err(Error::VersionMismatch(format!(
                "incremental file version {version}"
            )));
        }
        let block_count = buf.get_u32_le() as usize;
        let truncation_block_length = buf.get_u32_le();
        if buf.remaining() != block_count * (4 + BLOCK_SIZE) {
            return Err(corrupt());
        }
        let mut blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            blocks.push(buf.get_u32_le());
        }
        if blocks.windows(2).any(|w| w[0] >= w[1]) {
            return Err(corrupt());
        }
        let images = buf.to_vec();
        Ok(SparseFile {
            truncation_block_length,
            blocks,
            images,
        })
    }

    /// Lay this file's blocks over a byte store of the whole file and
    /// resize the store to this file's recorded length.
    pub fn overlay_onto(&self, store: &mut Vec<u8>) {
        for (i, &blkno) in self.blocks.iter().enumerate() {
            let end = (blkno as usize + 1) * BLOCK_SIZE;
            if store.len() < end {
                store.resize(end, 0);
            }
            store[end - BLOCK_SIZE..end].copy_from_slice(self.image(i));
        }
        store.resize(self.truncation_block_length as usize * BLOCK_SIZE, 0);
    }

    /// Merge an older sparse file underneath this one: the result
    /// carries this file's length and images, plus the older blocks this
    /// file does not override. Used by delete rollup.
    pub fn merge_under(&self, older: &SparseFile) -> SparseFile {
        let mut merged = SparseFile::new(self.truncation_block_length);
        let mut mine = 0usize;
        let mut theirs = 0usize;
        while mine < self.blocks.len() || theirs < older.blocks.len() {
            let take_mine = match (self.blocks.get(mine), older.blocks.get(theirs)) {
                (Some(&a), Some(&b)) => {
                    if a == b {
                        theirs += 1;
                    }
                    a <= b
                }
                (Some(_), None) => true,
                (None, Some(&b)) => {
                    // older blocks past the newer length are gone
                    if b >= self.truncation_block_length {
                        theirs += 1;
                        continue;
                    }
                    false
                }
                (None, None) => break,
            };
            if take_mine {
                merged.blocks.push(self.blocks[mine]);
                merged.images.extend_from_slice(self.image(mine));
                mine += 1;
            } else {
                if older.blocks[theirs] < self.truncation_block_length {
                    merged.blocks.push(older.blocks[theirs]);
                    merged.images.extend_from_slice(older.image(theirs));
                }
                theirs += 1;
            }
        }
        merged
    }
}

/// `INCREMENTAL.<name>` for the file name component of `rel_path`.
pub fn incremental_name(rel_path: &str) -> String {
    match rel_path.rsplit_once('/') {
        Some((dir, name)) => format!("{dir}/{INCREMENTAL_PREFIX}{name}"),
        None => format!("{INCREMENTAL_PREFIX}{rel_path}"),
    }
}

/// Undo [`incremental_name`]; None if the file name is not prefixed.
pub fn strip_incremental_name(rel_path: &str) -> Option<String> {
    let (dir, name) = match rel_path.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, rel_path),
    };
    let stripped = name.strip_prefix(INCREMENTAL_PREFIX)?;
    Some(match dir {
        Some(dir) => format!("{dir}/{stripped}"),
        None => stripped.to_string(),
    })
}

/// Where a relation data file belongs, derived from its path inside the
/// data directory: `(tablespace oid, database oid)`. Returns None for
/// paths that cannot hold relation data.
pub fn relation_location(rel_path: &str) -> Option<(u32, u32, &str)> {
    use postgres_ffi::pg_constants::{DEFAULTTABLESPACE_OID, GLOBALTABLESPACE_OID};
    let mut parts = rel_path.split('/');
    match parts.next()? {
        "base" => {
            let db: u32 = parts.next()?.parse().ok()?;
            let file = parts.next()?;
            parts.next().is_none().then_some((DEFAULTTABLESPACE_OID, db, file))
        }
        "global" => {
            let file = parts.next()?;
            parts.next().is_none().then_some((GLOBALTABLESPACE_OID, 0, file))
        }
        "pg_tblspc" => {
            let spc: u32 = parts.next()?.parse().ok()?;
            let _version_dir = parts.next()?;
            let db: u32 = parts.next()?.parse().ok()?;
            let file = parts.next()?;
            parts.next().is_none().then_some((spc, db, file))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; BLOCK_SIZE]
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut sparse = SparseFile::new(10);
        sparse.blocks = vec![1, 4, 7];
        sparse.images = [page(0x11), page(0x44), page(0x77)].concat();
        let decoded = SparseFile::decode(&sparse.encode(), "t").unwrap();
        assert_eq!(decoded, sparse);

        // corrupt magic
        let mut bad = sparse.encode();
        bad[0] ^= 1;
        assert!(SparseFile::decode(&bad, "t").is_err());
        // unsorted blocks
        let mut unsorted = sparse.clone();
        unsorted.blocks = vec![4, 1, 7];
        assert!(SparseFile::decode(&unsorted.encode(), "t").is_err());
    }

    #[test]
    fn from_source_skips_blocks_past_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("16384");
        std::fs::write(&path, [page(1), page(2), page(3)].concat()).unwrap();
        let sparse = SparseFile::from_source(&path, vec![2, 0, 2, 9]).unwrap();
        assert_eq!(sparse.truncation_block_length, 3);
        assert_eq!(sparse.blocks, vec![0, 2]);
        assert_eq!(sparse.image(0), &page(1)[..]);
        assert_eq!(sparse.image(1), &page(3)[..]);
    }

    #[test]
    fn overlay_extends_and_truncates() {
        let mut store = [page(9), page(9)].concat();
        let mut sparse = SparseFile::new(4);
        sparse.blocks = vec![3];
        sparse.images = page(5);
        sparse.overlay_onto(&mut store);
        assert_eq!(store.len(), 4 * BLOCK_SIZE);
        assert_eq!(&store[..BLOCK_SIZE], &page(9)[..]);
        assert_eq!(&store[2 * BLOCK_SIZE..3 * BLOCK_SIZE], &page(0)[..]);
        assert_eq!(&store[3 * BLOCK_SIZE..], &page(5)[..]);

        // a shrinking overlay truncates
        let shrink = SparseFile::new(1);
        shrink.clone().overlay_onto(&mut store);
        assert_eq!(store.len(), BLOCK_SIZE);
    }

    #[test]
    fn merge_under_prefers_newer_images() {
        let mut older = SparseFile::new(8);
        older.blocks = vec![0, 3, 6];
        older.images = [page(0xA0), page(0xA3), page(0xA6)].concat();

        let mut newer = SparseFile::new(5); // truncated to 5 blocks
        newer.blocks = vec![3, 4];
        newer.images = [page(0xB3), page(0xB4)].concat();

        let merged = newer.merge_under(&older);
        assert_eq!(merged.truncation_block_length, 5);
        assert_eq!(merged.blocks, vec![0, 3, 4]); // block 6 dropped by truncation
        assert_eq!(merged.image(0), &page(0xA0)[..]);
        assert_eq!(merged.image(1), &page(0xB3)[..]); // newer wins
        assert_eq!(merged.image(2), &page(0xB4)[..]);
    }

    #[test]
    fn name_mangling() {
        assert_eq!(incremental_name("base/5/16384"), "base/5/INCREMENTAL.16384");
        assert_eq!(incremental_name("16384"), "INCREMENTAL.16384");
        assert_eq!(
            strip_incremental_name("base/5/INCREMENTAL.16384").as_deref(),
            Some("base/5/16384")
        );
        assert_eq!(strip_incremental_name("base/5/16384"), None);

        assert_eq!(relation_location("base/5/16384"), Some((1663, 5, "16384")));
        assert_eq!(relation_location("global/1262"), Some((1664, 0, "1262")));
        assert_eq!(
            relation_location("pg_tblspc/16500/PG_17_202407111/7/16999"),
            Some((16500, 7, "16999"))
        );
        assert_eq!(relation_location("pg_xact/0000"), None);
        assert_eq!(relation_location("base/5/sub/16384"), None);
    }
}
