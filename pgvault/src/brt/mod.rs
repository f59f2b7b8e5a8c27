//! The block reference table: which blocks of which relation forks were
//! modified across a WAL range.
//!
//! Every entry tracks one relation fork. Block numbers are grouped into
//! chunks of 2^16; a chunk starts as an array of 16-bit offsets from the
//! chunk base and converts to a bitmap when the array would reach 4096
//! entries. The same representation is used in memory and on disk
//! (see [`io`]).
//!
//! An entry also carries a `limit_block`: the smallest fork length (in
//! blocks) observed over the covered range. Zero means the fork was
//! created or dropped inside the range; a truncation records the new
//! length. The limit only ever decreases, and setting it discards any
//! stored block at or past it.

pub mod io;

use postgres_ffi::relfile_utils::ForkNumber;
use postgres_ffi::{BlockNumber, RelFileLocator};
use utils::art::Art;

pub const BLOCKS_PER_CHUNK: u32 = 1 << 16;
/// 2^16 blocks / 16 bits per bitmap word.
pub const MAX_ENTRIES_PER_CHUNK: usize = (BLOCKS_PER_CHUNK as usize) / (8 * 2);
/// Callers of [`BrtEntry::get_blocks`] supply at least this many slots.
pub const BLOCKS_PER_READ: usize = 512;

/// A fork is "not truncated" until a limit is recorded.
const NO_LIMIT: BlockNumber = BlockNumber::MAX;

/// Identifies one relation fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelForkKey {
    pub rlocator: RelFileLocator,
    pub fork: ForkNumber,
}

impl RelForkKey {
    pub fn new(spc_oid: u32, db_oid: u32, rel_number: u32, fork: ForkNumber) -> RelForkKey {
        RelForkKey {
            rlocator: RelFileLocator {
                spc_oid,
                db_oid,
                rel_number,
            },
            fork,
        }
    }

    /// Pack into a big-endian byte string so the index iterates keys in
    /// numeric order.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.rlocator.spc_oid.to_be_bytes());
        out[4..8].copy_from_slice(&self.rlocator.db_oid.to_be_bytes());
        out[8..12].copy_from_slice(&self.rlocator.rel_number.to_be_bytes());
        out[12..16].copy_from_slice(&(self.fork as u32).to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<RelForkKey> {
        if bytes.len() != 16 {
            return None;
        }
        let word = |i: usize| u32::from_be_bytes(bytes[i..i + 4].try_into().unwrap());
        let fork = ForkNumber::from_u8(u8::try_from(word(12)).ok()?)?;
        Some(RelForkKey::new(word(0), word(4), word(8), fork))
    }
}

impl std::fmt::Display for RelForkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.rlocator.spc_oid, self.rlocator.db_oid, self.rlocator.rel_number
        )?;
        if self.fork != ForkNumber::Main {
            write!(f, "_{}", self.fork.name())?;
        }
        Ok(())
    }
}

/// One 2^16-block span of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkRepr {
    /// Distinct 16-bit offsets from the chunk base, in insertion order.
    Array(Vec<u16>),
    /// One bit per block; 4096 words cover the whole chunk.
    Bitmap(Box<[u16; MAX_ENTRIES_PER_CHUNK]>),
}

impl ChunkRepr {
    fn new() -> ChunkRepr {
        ChunkRepr::Array(Vec::new())
    }

    /// The serialized usage count: array length, or
    /// `MAX_ENTRIES_PER_CHUNK` for a bitmap.
    pub fn usage(&self) -> usize {
        match self {
            ChunkRepr::Array(offsets) => offsets.len(),
            ChunkRepr::Bitmap(_) => MAX_ENTRIES_PER_CHUNK,
        }
    }

    fn contains(&self, offset: u16) -> bool {
        match self {
            ChunkRepr::Array(offsets) => offsets.contains(&offset),
            ChunkRepr::Bitmap(words) => {
                words[offset as usize / 16] & (1 << (offset % 16)) != 0
            }
        }
    }

    fn insert(&mut self, offset: u16) {
        match self {
            ChunkRepr::Array(offsets) => {
                if offsets.contains(&offset) {
                    return;
                }
                if offsets.len() + 1 < MAX_ENTRIES_PER_CHUNK {
                    offsets.push(offset);
                    return;
                }
                // the array would reach the bitmap threshold: convert
                let mut words = Box::new([0u16; MAX_ENTRIES_PER_CHUNK]);
                for &o in offsets.iter() {
                    words[o as usize / 16] |= 1 << (o % 16);
                }
                words[offset as usize / 16] |= 1 << (offset % 16);
                *self = ChunkRepr::Bitmap(words);
            }
            ChunkRepr::Bitmap(words) => {
                words[offset as usize / 16] |= 1 << (offset % 16);
            }
        }
    }

    /// Drop every offset at or past `from`.
    fn truncate(&mut self, from: u16) {
        match self {
            ChunkRepr::Array(offsets) => offsets.retain(|&o| o < from),
            ChunkRepr::Bitmap(words) => {
                let word = from as usize / 16;
                let bit = from % 16;
                words[word] &= (1u32 << bit) as u16 - 1;
                for w in words.iter_mut().skip(word + 1) {
                    *w = 0;
                }
            }
        }
    }

    /// Offsets in `[start, stop)`, ascending, appended to `out` until it
    /// reaches `cap` entries. Returns the number appended.
    fn collect_range(&self, start: u16, stop: u32, out: &mut Vec<u16>, cap: usize) -> usize {
        let before = out.len();
        match self {
            ChunkRepr::Array(offsets) => {
                let mut sorted: Vec<u16> = offsets
                    .iter()
                    .copied()
                    .filter(|&o| o >= start && (o as u32) < stop)
                    .collect();
                sorted.sort_unstable();
                for o in sorted {
                    if out.len() >= cap {
                        break;
                    }
                    out.push(o);
                }
            }
            ChunkRepr::Bitmap(words) => {
                for o in (start as u32)..stop {
                    if words[o as usize / 16] & (1 << (o % 16)) != 0 {
                        if out.len() >= cap {
                            break;
                        }
                        out.push(o as u16);
                    }
                }
            }
        }
        out.len() - before
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid block range: start {start} > stop {stop}")]
pub struct InvalidRange {
    pub start: BlockNumber,
    pub stop: BlockNumber,
}

/// State for one relation fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrtEntry {
    limit_block: BlockNumber,
    max_block_number: BlockNumber,
    chunks: Vec<ChunkRepr>,
}

impl BrtEntry {
    fn new() -> BrtEntry {
        BrtEntry {
            limit_block: NO_LIMIT,
            max_block_number: 0,
            chunks: Vec::new(),
        }
    }

    /// The smallest fork length observed, or None if no create, drop or
    /// truncate was recorded.
    pub fn limit_block(&self) -> Option<BlockNumber> {
        (self.limit_block != NO_LIMIT).then_some(self.limit_block)
    }

    pub fn max_block_number(&self) -> BlockNumber {
        self.max_block_number
    }

    pub fn chunks(&self) -> &[ChunkRepr] {
        &self.chunks
    }

    pub(crate) fn raw_limit_block(&self) -> BlockNumber {
        self.limit_block
    }

    pub(crate) fn from_parts(limit_block: BlockNumber, chunks: Vec<ChunkRepr>) -> BrtEntry {
        let mut max_block_number = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            let base = i as u32 * BLOCKS_PER_CHUNK;
            match chunk {
                ChunkRepr::Array(offsets) => {
                    for &o in offsets {
                        max_block_number = max_block_number.max(base + o as u32);
                    }
                }
                ChunkRepr::Bitmap(words) => {
                    for (w, &word) in words.iter().enumerate() {
                        if word != 0 {
                            let top = 15 - word.leading_zeros() as u32;
                            max_block_number =
                                max_block_number.max(base + w as u32 * 16 + top);
                        }
                    }
                }
            }
        }
        BrtEntry {
            limit_block,
            max_block_number,
            chunks,
        }
    }

    fn set_limit_block(&mut self, limit_block: BlockNumber) {
        if limit_block >= self.limit_block {
            // the limit only ever shrinks over a range
            return;
        }
        self.limit_block = limit_block;
        if limit_block == 0 {
            self.chunks.clear();
            self.max_block_number = 0;
            return;
        }
        let boundary = (limit_block / BLOCKS_PER_CHUNK) as usize;
        self.chunks.truncate(boundary + 1);
        if let Some(chunk) = self.chunks.get_mut(boundary) {
            chunk.truncate((limit_block % BLOCKS_PER_CHUNK) as u16);
        }
        self.max_block_number = self.max_block_number.min(limit_block.saturating_sub(1));
    }

    fn mark_block_modified(&mut self, blkno: BlockNumber) {
        let chunk_no = (blkno / BLOCKS_PER_CHUNK) as usize;
        while self.chunks.len() <= chunk_no {
            self.chunks.push(ChunkRepr::new());
        }
        self.chunks[chunk_no].insert((blkno % BLOCKS_PER_CHUNK) as u16);
        self.max_block_number = self.max_block_number.max(blkno);
    }

    pub fn contains(&self, blkno: BlockNumber) -> bool {
        let chunk_no = (blkno / BLOCKS_PER_CHUNK) as usize;
        match self.chunks.get(chunk_no) {
            Some(chunk) => chunk.contains((blkno % BLOCKS_PER_CHUNK) as u16),
            None => false,
        }
    }

    /// Collect modified blocks in `[start, stop)` into `out`, ascending.
    /// `out` is cleared first; at most its capacity (but no less than
    /// [`BLOCKS_PER_READ`]) entries are produced, and the caller resumes
    /// with `start` past the last returned block.
    pub fn get_blocks(
        &self,
        start: BlockNumber,
        stop: BlockNumber,
        out: &mut Vec<BlockNumber>,
    ) -> Result<usize, InvalidRange> {
        if start > stop {
            return Err(InvalidRange { start, stop });
        }
        out.clear();
        let cap = out.capacity().max(BLOCKS_PER_READ);
        let mut scratch: Vec<u16> = Vec::new();

        let first_chunk = (start / BLOCKS_PER_CHUNK) as usize;
        for (i, chunk) in self.chunks.iter().enumerate().skip(first_chunk) {
            if out.len() >= cap {
                break;
            }
            let base = i as u32 * BLOCKS_PER_CHUNK;
            if base >= stop {
                break;
            }
            let chunk_start = if start > base { (start - base) as u16 } else { 0 };
            let chunk_stop = (stop - base).min(BLOCKS_PER_CHUNK);
            scratch.clear();
            chunk.collect_range(chunk_start, chunk_stop, &mut scratch, cap - out.len());
            out.extend(scratch.iter().map(|&o| base + o as u32));
        }
        Ok(out.len())
    }

    /// All modified blocks, ascending. Convenience for consumers that
    /// want the whole entry at once (combine, tests).
    pub fn all_blocks(&self) -> Vec<BlockNumber> {
        let mut out = Vec::new();
        let mut start = 0;
        loop {
            let mut batch = Vec::with_capacity(BLOCKS_PER_READ);
            let n = self
                .get_blocks(start, BlockNumber::MAX, &mut batch)
                .expect("valid range");
            if n == 0 {
                return out;
            }
            start = batch[n - 1] + 1;
            out.extend_from_slice(&batch);
        }
    }
}

/// The table itself: relation fork key to entry, iterated in key order.
#[derive(Debug, Default)]
pub struct BlockRefTable {
    table: Art<BrtEntry>,
}

impl BlockRefTable {
    pub fn new() -> BlockRefTable {
        BlockRefTable { table: Art::new() }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn entry_mut(&mut self, key: RelForkKey) -> &mut BrtEntry {
        let packed = key.to_bytes();
        if self.table.search(&packed).is_none() {
            self.table.insert(&packed, BrtEntry::new());
        }
        self.table.search_mut(&packed).expect("just inserted")
    }

    /// Record the smallest known fork length. Zero records a create or
    /// drop; a truncation records the remaining length. Stored blocks at
    /// or past the new limit are discarded.
    pub fn set_limit_block(&mut self, key: RelForkKey, limit_block: BlockNumber) {
        self.entry_mut(key).set_limit_block(limit_block);
    }

    /// Record one modified block. Idempotent.
    pub fn mark_block_modified(&mut self, key: RelForkKey, blkno: BlockNumber) {
        self.entry_mut(key).mark_block_modified(blkno);
    }

    pub fn get_entry(&self, key: RelForkKey) -> Option<&BrtEntry> {
        self.table.search(&key.to_bytes())
    }

    pub fn iter(&self) -> impl Iterator<Item = (RelForkKey, &BrtEntry)> {
        self.table.iter().map(|(k, v)| {
            (
                RelForkKey::from_bytes(k).expect("keys are packed RelForkKeys"),
                v,
            )
        })
    }

    pub(crate) fn insert_entry(&mut self, key: RelForkKey, entry: BrtEntry) {
        self.table.insert(&key.to_bytes(), entry);
    }

    /// Fold `later`, a summary of a subsequent LSN range, into this
    /// table. Limits apply before marks so a truncation in the later
    /// range discards earlier marks past it, and marks recorded after
    /// the truncation survive.
    pub fn merge(&mut self, later: &BlockRefTable) {
        for (key, entry) in later.iter() {
            if let Some(limit) = entry.limit_block() {
                self.set_limit_block(key, limit);
            }
            for blkno in entry.all_blocks() {
                self.mark_block_modified(key, blkno);
            }
        }
    }

    /// Structural equality up to chunk representation: same keys, same
    /// limits, same observable block sets.
    pub fn same_contents(&self, other: &BlockRefTable) -> bool {
        if self.len() != other.len() {
            return false;
        }
        for (key, entry) in self.iter() {
            let Some(other_entry) = other.get_entry(key) else {
                return false;
            };
            if entry.limit_block() != other_entry.limit_block()
                || entry.all_blocks() != other_entry.all_blocks()
            {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RelForkKey {
        RelForkKey::new(1663, 234, 345, ForkNumber::Main)
    }

    #[test]
    fn marking_is_idempotent_and_deduplicated() {
        let mut brt = BlockRefTable::new();
        brt.mark_block_modified(key(), 7);
        brt.mark_block_modified(key(), 7);
        brt.mark_block_modified(key(), 3);
        let entry = brt.get_entry(key()).unwrap();
        assert_eq!(entry.all_blocks(), vec![3, 7]);
        assert_eq!(entry.max_block_number(), 7);
        assert_eq!(entry.chunks()[0].usage(), 2);
    }

    #[test]
    fn array_converts_to_bitmap_at_threshold() {
        let mut brt = BlockRefTable::new();
        for b in 0..MAX_ENTRIES_PER_CHUNK as u32 - 1 {
            brt.mark_block_modified(key(), b * 2);
        }
        let entry = brt.get_entry(key()).unwrap();
        assert!(matches!(entry.chunks()[0], ChunkRepr::Array(_)));
        assert_eq!(entry.chunks()[0].usage(), MAX_ENTRIES_PER_CHUNK - 1);

        let mut brt2 = BlockRefTable::new();
        for b in 0..MAX_ENTRIES_PER_CHUNK as u32 {
            brt2.mark_block_modified(key(), b * 2);
        }
        let entry = brt2.get_entry(key()).unwrap();
        assert!(matches!(entry.chunks()[0], ChunkRepr::Bitmap(_)));
        assert_eq!(entry.chunks()[0].usage(), MAX_ENTRIES_PER_CHUNK);
        // and the block set survived the conversion
        let expected: Vec<u32> = (0..MAX_ENTRIES_PER_CHUNK as u32).map(|b| b * 2).collect();
        assert_eq!(entry.all_blocks(), expected);
    }

    #[test]
    fn limit_block_truncates_and_is_monotone() {
        let mut brt = BlockRefTable::new();
        for b in [1u32, 5, 100, BLOCKS_PER_CHUNK + 3, 3 * BLOCKS_PER_CHUNK + 9] {
            brt.mark_block_modified(key(), b);
        }
        // a limit above everything stored changes no blocks
        brt.set_limit_block(key(), 4 * BLOCKS_PER_CHUNK);
        assert_eq!(
            brt.get_entry(key()).unwrap().all_blocks(),
            vec![1, 5, 100, BLOCKS_PER_CHUNK + 3, 3 * BLOCKS_PER_CHUNK + 9]
        );
        // truncate to 100: block 100 itself goes away
        brt.set_limit_block(key(), 100);
        let entry = brt.get_entry(key()).unwrap();
        assert_eq!(entry.limit_block(), Some(100));
        assert_eq!(entry.all_blocks(), vec![1, 5]);
        // raising the limit afterwards is a no-op
        brt.set_limit_block(key(), 1000);
        assert_eq!(brt.get_entry(key()).unwrap().limit_block(), Some(100));
        // writes past the new end extend max_block_number again
        brt.mark_block_modified(key(), 512);
        assert_eq!(brt.get_entry(key()).unwrap().max_block_number(), 512);
    }

    #[test]
    fn limit_zero_drops_everything() {
        let mut brt = BlockRefTable::new();
        brt.mark_block_modified(key(), 42);
        brt.set_limit_block(key(), 0);
        let entry = brt.get_entry(key()).unwrap();
        assert_eq!(entry.limit_block(), Some(0));
        assert!(entry.all_blocks().is_empty());
        // a recreate inside the range keeps post-create modifications
        brt.mark_block_modified(key(), 7);
        assert_eq!(brt.get_entry(key()).unwrap().all_blocks(), vec![7]);
    }

    #[test]
    fn get_blocks_ranges() {
        let mut brt = BlockRefTable::new();
        for b in [10u32, 20, 30, BLOCKS_PER_CHUNK + 1] {
            brt.mark_block_modified(key(), b);
        }
        let entry = brt.get_entry(key()).unwrap();

        let mut out = Vec::with_capacity(BLOCKS_PER_READ);
        assert_eq!(entry.get_blocks(0, 25, &mut out).unwrap(), 2);
        assert_eq!(out, vec![10, 20]);

        assert_eq!(entry.get_blocks(20, 20, &mut out).unwrap(), 0);
        assert!(entry.get_blocks(21, 20, &mut out).is_err());

        assert_eq!(entry.get_blocks(25, u32::MAX, &mut out).unwrap(), 2);
        assert_eq!(out, vec![30, BLOCKS_PER_CHUNK + 1]);
    }

    #[test]
    fn iteration_is_key_ordered() {
        let mut brt = BlockRefTable::new();
        let k2 = RelForkKey::new(1663, 234, 400, ForkNumber::Main);
        let k3 = RelForkKey::new(1664, 1, 1, ForkNumber::Fsm);
        brt.mark_block_modified(k3, 1);
        brt.mark_block_modified(k2, 1);
        brt.mark_block_modified(key(), 1);
        let keys: Vec<RelForkKey> = brt.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![key(), k2, k3]);
    }
}
