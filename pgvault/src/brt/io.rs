//! On-disk form of the block reference table.
//!
//! The file is a stream of fixed-width little-endian integers: a magic
//! word, then per entry the packed key, limit block, chunk count, the
//! per-chunk usage array and the chunk payloads, then a terminator entry
//! of four zero words and a CRC32C trailer covering everything before
//! it. All traffic goes through a fixed 64 KiB staging buffer that
//! flushes to (or refills from) the underlying file and keeps the
//! running CRC.

use std::fs::File;
use std::io::{Read, Write};

use camino::Utf8Path;
use postgres_ffi::relfile_utils::ForkNumber;
use tracing::debug;

use super::{BlockRefTable, BrtEntry, ChunkRepr, RelForkKey, MAX_ENTRIES_PER_CHUNK};
use crate::error::{Error, Result};

/// Magic number for the serialization file format.
pub const BLOCKREFTABLE_MAGIC: u32 = 0x652b137b;

const BUFFER_SIZE: usize = 64 * 1024;

/// Fixed-capacity staging buffer with a running CRC32C of every byte
/// that passed through it.
struct TableBuffer {
    data: Box<[u8; BUFFER_SIZE]>,
    used: usize,
    cursor: usize,
    crc: u32,
}

impl TableBuffer {
    fn new() -> TableBuffer {
        TableBuffer {
            data: Box::new([0; BUFFER_SIZE]),
            used: 0,
            cursor: 0,
            crc: 0,
        }
    }
}

struct TableWriter<'a> {
    buffer: TableBuffer,
    file: &'a mut File,
    path: &'a Utf8Path,
}

impl<'a> TableWriter<'a> {
    fn new(file: &'a mut File, path: &'a Utf8Path) -> TableWriter<'a> {
        TableWriter {
            buffer: TableBuffer::new(),
            file,
            path,
        }
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.used > 0 {
            self.file
                .write_all(&self.buffer.data[..self.buffer.used])
                .map_err(|e| Error::io(self.path, e))?;
            self.buffer.used = 0;
        }
        Ok(())
    }

    /// Buffer `bytes`, flushing to the file when the buffer fills.
    /// Either the whole value is accepted or an error is returned with
    /// nothing partially committed to the buffer.
    fn write_bytes(&mut self, mut bytes: &[u8]) -> Result<()> {
        self.buffer.crc = crc32c::crc32c_append(self.buffer.crc, bytes);
        while !bytes.is_empty() {
            if self.buffer.used == BUFFER_SIZE {
                self.flush()?;
            }
            let n = bytes.len().min(BUFFER_SIZE - self.buffer.used);
            self.buffer.data[self.buffer.used..self.buffer.used + n]
                .copy_from_slice(&bytes[..n]);
            self.buffer.used += n;
            bytes = &bytes[n..];
        }
        Ok(())
    }

    fn write_u16(&mut self, v: u16) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    /// Flush everything and append the CRC trailer.
    fn finish(mut self) -> Result<()> {
        let crc = self.buffer.crc;
        let trailer = crc.to_le_bytes();
        self.write_bytes(&trailer)?;
        self.flush()?;
        self.file.sync_all().map_err(|e| Error::io(self.path, e))?;
        Ok(())
    }
}

struct TableReader<'a> {
    buffer: TableBuffer,
    file: &'a mut File,
    path: &'a Utf8Path,
    eof: bool,
}

impl<'a> TableReader<'a> {
    fn new(file: &'a mut File, path: &'a Utf8Path) -> TableReader<'a> {
        TableReader {
            buffer: TableBuffer::new(),
            file,
            path,
            eof: false,
        }
    }

    fn corrupt(&self) -> Error {
        Error::corrupt(format!("block reference table file {}", self.path))
    }

    fn refill(&mut self) -> Result<()> {
        self.buffer.cursor = 0;
        self.buffer.used = 0;
        while self.buffer.used < BUFFER_SIZE {
            let n = self
                .file
                .read(&mut self.buffer.data[self.buffer.used..])
                .map_err(|e| Error::io(self.path, e))?;
            if n == 0 {
                self.eof = true;
                break;
            }
            self.buffer.used += n;
        }
        Ok(())
    }

    /// Fill `out`, refilling from the file as needed. A short read is
    /// a corrupt file: the format always knows how many bytes follow.
    fn read_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.buffer.cursor == self.buffer.used {
                if self.eof {
                    return Err(self.corrupt());
                }
                self.refill()?;
                if self.buffer.used == 0 {
                    return Err(self.corrupt());
                }
            }
            let n = (out.len() - filled).min(self.buffer.used - self.buffer.cursor);
            out[filled..filled + n]
                .copy_from_slice(&self.buffer.data[self.buffer.cursor..self.buffer.cursor + n]);
            self.buffer.cursor += n;
            filled += n;
        }
        self.buffer.crc = crc32c::crc32c_append(self.buffer.crc, out);
        Ok(())
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_bytes(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_bytes(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Read the trailer and compare it against the CRC of everything
    /// consumed so far. The trailer bytes themselves stay out of the
    /// running CRC.
    fn verify_trailer(&mut self) -> Result<()> {
        let expected = self.buffer.crc;
        let mut b = [0u8; 4];
        // bypass read_bytes so the trailer is not folded into the CRC
        let mut filled = 0;
        while filled < 4 {
            if self.buffer.cursor == self.buffer.used {
                if self.eof {
                    return Err(self.corrupt());
                }
                self.refill()?;
                if self.buffer.used == 0 {
                    return Err(self.corrupt());
                }
            }
            let n = (4 - filled).min(self.buffer.used - self.buffer.cursor);
            b[filled..filled + n]
                .copy_from_slice(&self.buffer.data[self.buffer.cursor..self.buffer.cursor + n]);
            self.buffer.cursor += n;
            filled += n;
        }
        if u32::from_le_bytes(b) != expected {
            return Err(self.corrupt());
        }
        Ok(())
    }
}

/// Serialize `brt` to `path`, entries in index iteration order.
pub fn write_brt(brt: &BlockRefTable, path: &Utf8Path) -> Result<()> {
    let mut file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut w = TableWriter::new(&mut file, path);

    w.write_u32(BLOCKREFTABLE_MAGIC)?;
    for (key, entry) in brt.iter() {
        w.write_u32(key.rlocator.spc_oid)?;
        w.write_u32(key.rlocator.db_oid)?;
        w.write_u32(key.rlocator.rel_number)?;
        w.write_u32(key.fork as u32)?;
        w.write_u32(entry.raw_limit_block())?;
        let chunks = entry.chunks();
        w.write_u32(chunks.len() as u32)?;
        for chunk in chunks {
            w.write_u16(chunk.usage() as u16)?;
        }
        for chunk in chunks {
            match chunk {
                ChunkRepr::Array(offsets) => {
                    for &o in offsets {
                        w.write_u16(o)?;
                    }
                }
                ChunkRepr::Bitmap(words) => {
                    for &word in words.iter() {
                        w.write_u16(word)?;
                    }
                }
            }
        }
    }
    // the terminator entry is all zeros
    for _ in 0..4 {
        w.write_u32(0)?;
    }
    w.finish()?;
    debug!("wrote {} entries to {path}", brt.len());
    Ok(())
}

/// Read a table back from `path`. The result is observably identical to
/// the table that was written (chunk representations included, since
/// usage counts round-trip exactly).
pub fn read_brt(path: &Utf8Path) -> Result<BlockRefTable> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut r = TableReader::new(&mut file, path);

    if r.read_u32()? != BLOCKREFTABLE_MAGIC {
        return Err(r.corrupt());
    }

    let mut brt = BlockRefTable::new();
    loop {
        let spc_oid = r.read_u32()?;
        let db_oid = r.read_u32()?;
        let rel_number = r.read_u32()?;
        let fork_raw = r.read_u32()?;
        if spc_oid == 0 && db_oid == 0 && rel_number == 0 && fork_raw == 0 {
            break;
        }
        let fork = u8::try_from(fork_raw)
            .ok()
            .and_then(ForkNumber::from_u8)
            .ok_or_else(|| r.corrupt())?;
        let key = RelForkKey::new(spc_oid, db_oid, rel_number, fork);

        let limit_block = r.read_u32()?;
        let nchunks = r.read_u32()? as usize;
        let mut usage = Vec::with_capacity(nchunks);
        for _ in 0..nchunks {
            let u = r.read_u16()? as usize;
            if u > MAX_ENTRIES_PER_CHUNK {
                return Err(r.corrupt());
            }
            usage.push(u);
        }
        let mut chunks = Vec::with_capacity(nchunks);
        for &u in &usage {
            if u < MAX_ENTRIES_PER_CHUNK {
                let mut offsets = Vec::with_capacity(u);
                for _ in 0..u {
                    offsets.push(r.read_u16()?);
                }
                chunks.push(ChunkRepr::Array(offsets));
            } else {
                let mut words = Box::new([0u16; MAX_ENTRIES_PER_CHUNK]);
                for word in words.iter_mut() {
                    *word = r.read_u16()?;
                }
                chunks.push(ChunkRepr::Bitmap(words));
            }
        }
        brt.insert_entry(key, BrtEntry::from_parts(limit_block, chunks));
    }
    r.verify_trailer()?;
    Ok(brt)
}

/// File name of a summary covering `[start, stop)`, under `summary/`.
pub fn summary_file_name(start: utils::lsn::Lsn, stop: utils::lsn::Lsn) -> String {
    format!("{:016X}{:016X}", start.0, stop.0)
}

/// Parse a summary file name back into its LSN range.
pub fn parse_summary_file_name(name: &str) -> Option<(utils::lsn::Lsn, utils::lsn::Lsn)> {
    if name.len() != 32 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let start = u64::from_str_radix(&name[..16], 16).ok()?;
    let stop = u64::from_str_radix(&name[16..], 16).ok()?;
    Some((utils::lsn::Lsn(start), utils::lsn::Lsn(stop)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brt::BLOCKS_PER_CHUNK;
    use camino_tempfile::tempdir;

    #[test]
    fn write_read_round_trip_multiple_chunks_multiple_representations() {
        // one entry, a bitmap chunk (forced by overshooting the array
        // threshold) and an array chunk three chunks later
        let key = RelForkKey::new(1663, 234, 345, ForkNumber::Main);
        let mut brt = BlockRefTable::new();
        for b in 0x123..0x123 + MAX_ENTRIES_PER_CHUNK as u32 + 10 {
            brt.mark_block_modified(key, b);
        }
        for b in 3 * BLOCKS_PER_CHUNK + 0x123..3 * BLOCKS_PER_CHUNK + 0x123 + 1000 {
            brt.mark_block_modified(key, b);
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("summary");
        write_brt(&brt, &path).unwrap();
        let read_back = read_brt(&path).unwrap();

        assert!(brt.same_contents(&read_back));

        // requesting [0, 4096) returns the first 4096 - 0x123 blocks,
        // ascending from 0x123
        let entry = read_back.get_entry(key).unwrap();
        let mut out = Vec::with_capacity(4096);
        let n = entry.get_blocks(0, 4096, &mut out).unwrap();
        assert_eq!(n, 4096 - 0x123);
        let expected: Vec<u32> = (0x123..4096).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn truncation_and_limits_round_trip() {
        let key = RelForkKey::new(1663, 5, 16384, ForkNumber::Fsm);
        let dropped = RelForkKey::new(1663, 5, 16385, ForkNumber::Main);
        let mut brt = BlockRefTable::new();
        for b in [3u32, 9, 200] {
            brt.mark_block_modified(key, b);
        }
        brt.set_limit_block(key, 10);
        brt.set_limit_block(dropped, 0);

        let dir = tempdir().unwrap();
        let path = dir.path().join("summary");
        write_brt(&brt, &path).unwrap();
        let read_back = read_brt(&path).unwrap();

        let entry = read_back.get_entry(key).unwrap();
        assert_eq!(entry.limit_block(), Some(10));
        assert_eq!(entry.all_blocks(), vec![3, 9]);
        assert_eq!(read_back.get_entry(dropped).unwrap().limit_block(), Some(0));
        // a fork never limited reads back as never limited
        assert!(brt.same_contents(&read_back));
    }

    #[test]
    fn corruption_is_detected() {
        let key = RelForkKey::new(1663, 1, 2, ForkNumber::Main);
        let mut brt = BlockRefTable::new();
        brt.mark_block_modified(key, 1);

        let dir = tempdir().unwrap();
        let path = dir.path().join("summary");
        write_brt(&brt, &path).unwrap();

        // flip one byte: CRC must catch it
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10] ^= 1;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(read_brt(&path), Err(Error::Corrupt { .. })));

        // short file: also corrupt
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 6]).unwrap();
        assert!(matches!(read_brt(&path), Err(Error::Corrupt { .. })));

        // bad magic
        std::fs::write(&path, [0u8; 32]).unwrap();
        assert!(matches!(read_brt(&path), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn summary_names() {
        use utils::lsn::Lsn;
        let name = summary_file_name(Lsn(0x1000), Lsn(0x1_0000_2000));
        assert_eq!(name, "00000000000010000000000100002000");
        assert_eq!(
            parse_summary_file_name(&name),
            Some((Lsn(0x1000), Lsn(0x1_0000_2000)))
        );
        assert_eq!(parse_summary_file_name("backup.info"), None);
    }

    #[test]
    fn large_tables_cross_the_staging_buffer() {
        // enough bitmap chunks to exceed the 64 KiB staging buffer
        // several times over
        let mut brt = BlockRefTable::new();
        for rel in 0..4u32 {
            let key = RelForkKey::new(1663, 1, 16384 + rel, ForkNumber::Main);
            for b in 0..MAX_ENTRIES_PER_CHUNK as u32 + 50 {
                brt.mark_block_modified(key, b);
            }
        }
        let dir = tempdir().unwrap();
        let path = dir.path().join("summary");
        write_brt(&brt, &path).unwrap();
        let read_back = read_brt(&path).unwrap();
        assert!(brt.same_contents(&read_back));
    }
}
