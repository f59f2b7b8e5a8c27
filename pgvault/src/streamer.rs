//! The file streamer: source bytes through optional compression and
//! encryption into one or more destination files.
//!
//! Stages are sum types, not trait objects: one variant per codec and
//! one per cipher. Backup mode runs compress then encrypt, restore mode
//! runs decrypt then decompress, passthrough only fans out. Input is
//! staged in a 64 KiB buffer and pushed through the pipeline whenever
//! the buffer fills or the caller marks the final chunk, which also
//! finalizes the codec (trailer) and the cipher (padding) exactly once.
//!
//! Output is deterministic for fixed inputs and parameters: the AES IV
//! is derived from the key material, not drawn from a RNG, so a backup
//! written twice is byte-identical and restore needs no side channel.

use std::fs::File;
use std::io::Write;
use std::time::{Duration, Instant};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes192, Aes256};
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{AesBits, AesMode, CompressionCodec, EncryptionConfig};
use crate::error::{Error, Result};

const STREAMER_BUFFER_SIZE: usize = 64 * 1024;
const AES_BLOCK: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerMode {
    Passthrough,
    Backup,
    Restore,
}

/// Derive the deterministic IV for the configured cipher from the key
/// material.
fn derive_iv(key: &[u8]) -> [u8; AES_BLOCK] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(b"streamer-iv");
    let digest = hasher.finalize();
    let mut iv = [0u8; AES_BLOCK];
    iv.copy_from_slice(&digest[..AES_BLOCK]);
    iv
}

enum Compressor {
    Identity,
    Gzip(flate2::write::GzEncoder<Vec<u8>>),
    Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
    /// lz4 frames are emitted in one piece when the stream finishes.
    Lz4(Vec<u8>),
    Bzip2(bzip2::write::BzEncoder<Vec<u8>>),
}

impl Compressor {
    fn new(codec: CompressionCodec) -> Result<Compressor> {
        Ok(match codec {
            CompressionCodec::None => Compressor::Identity,
            CompressionCodec::Gzip => Compressor::Gzip(flate2::write::GzEncoder::new(
                Vec::new(),
                flate2::Compression::default(),
            )),
            CompressionCodec::Zstd => Compressor::Zstd(
                zstd::stream::write::Encoder::new(Vec::new(), 0)
                    .map_err(|e| Error::corrupt(format!("zstd encoder: {e}")))?,
            ),
            CompressionCodec::Lz4 => Compressor::Lz4(Vec::new()),
            CompressionCodec::Bzip2 => Compressor::Bzip2(bzip2::write::BzEncoder::new(
                Vec::new(),
                bzip2::Compression::default(),
            )),
        })
    }

    /// Push input through; returns whatever output the codec produced.
    fn process(&mut self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Compressor::Identity => Ok(input.to_vec()),
            Compressor::Gzip(enc) => {
                enc.write_all(input)?;
                Ok(std::mem::take(enc.get_mut()))
            }
            Compressor::Zstd(enc) => {
                enc.write_all(input)?;
                Ok(std::mem::take(enc.get_mut()))
            }
            Compressor::Lz4(pending) => {
                pending.extend_from_slice(input);
                Ok(Vec::new())
            }
            Compressor::Bzip2(enc) => {
                enc.write_all(input)?;
                Ok(std::mem::take(enc.get_mut()))
            }
        }
    }

    /// Emit the codec trailer.
    fn finish(self) -> std::io::Result<Vec<u8>> {
        match self {
            Compressor::Identity => Ok(Vec::new()),
            Compressor::Gzip(enc) => enc.finish(),
            Compressor::Zstd(enc) => enc.finish(),
            Compressor::Lz4(pending) => {
                let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
                enc.write_all(&pending)?;
                enc.finish()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            }
            Compressor::Bzip2(enc) => enc.finish(),
        }
    }
}

enum Decompressor {
    Identity,
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    /// zstd and lz4 frames decode from the read side, so input is
    /// collected and decoded when the stream finishes.
    Zstd(Vec<u8>),
    Lz4(Vec<u8>),
    Bzip2(bzip2::write::BzDecoder<Vec<u8>>),
}

impl Decompressor {
    fn new(codec: CompressionCodec) -> Result<Decompressor> {
        Ok(match codec {
            CompressionCodec::None => Decompressor::Identity,
            CompressionCodec::Gzip => {
                Decompressor::Gzip(flate2::write::GzDecoder::new(Vec::new()))
            }
            CompressionCodec::Zstd => Decompressor::Zstd(Vec::new()),
            CompressionCodec::Lz4 => Decompressor::Lz4(Vec::new()),
            CompressionCodec::Bzip2 => {
                Decompressor::Bzip2(bzip2::write::BzDecoder::new(Vec::new()))
            }
        })
    }

    fn process(&mut self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Decompressor::Identity => Ok(input.to_vec()),
            Decompressor::Gzip(dec) => {
                dec.write_all(input)?;
                Ok(std::mem::take(dec.get_mut()))
            }
            Decompressor::Zstd(pending) | Decompressor::Lz4(pending) => {
                pending.extend_from_slice(input);
                Ok(Vec::new())
            }
            Decompressor::Bzip2(dec) => {
                dec.write_all(input)?;
                Ok(std::mem::take(dec.get_mut()))
            }
        }
    }

    fn finish(self) -> std::io::Result<Vec<u8>> {
        match self {
            Decompressor::Identity => Ok(Vec::new()),
            Decompressor::Gzip(dec) => dec.finish(),
            Decompressor::Zstd(pending) => zstd::stream::decode_all(&pending[..]),
            Decompressor::Lz4(pending) => {
                use std::io::Read;
                let mut out = Vec::new();
                lz4_flex::frame::FrameDecoder::new(&pending[..]).read_to_end(&mut out)?;
                Ok(out)
            }
            Decompressor::Bzip2(mut dec) => dec.finish(),
        }
    }
}

macro_rules! for_each_cbc {
    ($value:expr, $inner:pat => $body:expr) => {
        match $value {
            CbcCipher::Aes128($inner) => $body,
            CbcCipher::Aes192($inner) => $body,
            CbcCipher::Aes256($inner) => $body,
        }
    };
}

macro_rules! for_each_ctr {
    ($value:expr, $inner:pat => $body:expr) => {
        match $value {
            CtrCipher::Aes128($inner) => $body,
            CtrCipher::Aes192($inner) => $body,
            CtrCipher::Aes256($inner) => $body,
        }
    };
}

enum CbcCipher<C128, C192, C256> {
    Aes128(C128),
    Aes192(C192),
    Aes256(C256),
}

type CbcEnc = CbcCipher<cbc::Encryptor<Aes128>, cbc::Encryptor<Aes192>, cbc::Encryptor<Aes256>>;
type CbcDec = CbcCipher<cbc::Decryptor<Aes128>, cbc::Decryptor<Aes192>, cbc::Decryptor<Aes256>>;

enum CtrCipher {
    Aes128(ctr::Ctr128BE<Aes128>),
    Aes192(ctr::Ctr128BE<Aes192>),
    Aes256(ctr::Ctr128BE<Aes256>),
}

impl CtrCipher {
    fn new(bits: AesBits, key: &[u8], iv: &[u8]) -> Result<CtrCipher> {
        let bad_key = |_| Error::Config("encryption key length mismatch".into());
        Ok(match bits {
            AesBits::Aes128 => {
                CtrCipher::Aes128(ctr::Ctr128BE::new_from_slices(key, iv).map_err(bad_key)?)
            }
            AesBits::Aes192 => {
                CtrCipher::Aes192(ctr::Ctr128BE::new_from_slices(key, iv).map_err(bad_key)?)
            }
            AesBits::Aes256 => {
                CtrCipher::Aes256(ctr::Ctr128BE::new_from_slices(key, iv).map_err(bad_key)?)
            }
        })
    }

    fn apply(&mut self, data: &mut [u8]) {
        for_each_ctr!(self, c => c.apply_keystream(data));
    }
}

/// Streaming encryption. CBC collects input into 16-byte blocks and
/// appends PKCS#7 padding at the end; CTR is a pure keystream.
enum Encryptor {
    Identity,
    Cbc { cipher: CbcEnc, partial: Vec<u8> },
    Ctr(CtrCipher),
}

impl Encryptor {
    fn new(config: EncryptionConfig, key: Option<&[u8]>) -> Result<Encryptor> {
        let EncryptionConfig::Aes { bits, mode } = config else {
            return Ok(Encryptor::Identity);
        };
        let key = key.ok_or_else(|| Error::Config("encryption requires a key".into()))?;
        let iv = derive_iv(key);
        let bad_key = |_| Error::Config("encryption key length mismatch".into());
        match mode {
            AesMode::Cbc => {
                let cipher = match bits {
                    AesBits::Aes128 => CbcCipher::Aes128(
                        cbc::Encryptor::new_from_slices(key, &iv).map_err(bad_key)?,
                    ),
                    AesBits::Aes192 => CbcCipher::Aes192(
                        cbc::Encryptor::new_from_slices(key, &iv).map_err(bad_key)?,
                    ),
                    AesBits::Aes256 => CbcCipher::Aes256(
                        cbc::Encryptor::new_from_slices(key, &iv).map_err(bad_key)?,
                    ),
                };
                Ok(Encryptor::Cbc {
                    cipher,
                    partial: Vec::new(),
                })
            }
            AesMode::Ctr => Ok(Encryptor::Ctr(CtrCipher::new(bits, key, &iv)?)),
        }
    }

    fn process(&mut self, input: &[u8]) -> Vec<u8> {
        match self {
            Encryptor::Identity => input.to_vec(),
            Encryptor::Ctr(cipher) => {
                let mut out = input.to_vec();
                cipher.apply(&mut out);
                out
            }
            Encryptor::Cbc { cipher, partial } => {
                partial.extend_from_slice(input);
                let full = partial.len() - partial.len() % AES_BLOCK;
                let mut out: Vec<u8> = partial.drain(..full).collect();
                for block in out.chunks_exact_mut(AES_BLOCK) {
                    let block = GenericArray::from_mut_slice(block);
                    for_each_cbc!(&mut *cipher, c => c.encrypt_block_mut(block));
                }
                out
            }
        }
    }

    fn finish(self) -> Vec<u8> {
        match self {
            Encryptor::Identity | Encryptor::Ctr(_) => Vec::new(),
            Encryptor::Cbc {
                mut cipher,
                mut partial,
            } => {
                // PKCS#7: always pad, a full block when input is aligned
                let pad = AES_BLOCK - partial.len();
                partial.extend(std::iter::repeat(pad as u8).take(pad));
                let block = GenericArray::from_mut_slice(partial.as_mut_slice());
                for_each_cbc!(&mut cipher, c => c.encrypt_block_mut(block));
                partial
            }
        }
    }
}

enum Decryptor {
    Identity,
    Ctr(CtrCipher),
    /// CBC holds the last ciphertext block back until the stream ends,
    /// because that block carries the padding.
    Cbc { cipher: CbcDec, pending: Vec<u8> },
}

impl Decryptor {
    fn new(config: EncryptionConfig, key: Option<&[u8]>) -> Result<Decryptor> {
        let EncryptionConfig::Aes { bits, mode } = config else {
            return Ok(Decryptor::Identity);
        };
        let key = key.ok_or_else(|| Error::Config("decryption requires a key".into()))?;
        let iv = derive_iv(key);
        let bad_key = |_| Error::Config("encryption key length mismatch".into());
        match mode {
            AesMode::Ctr => Ok(Decryptor::Ctr(CtrCipher::new(bits, key, &iv)?)),
            AesMode::Cbc => {
                let cipher = match bits {
                    AesBits::Aes128 => CbcCipher::Aes128(
                        cbc::Decryptor::new_from_slices(key, &iv).map_err(bad_key)?,
                    ),
                    AesBits::Aes192 => CbcCipher::Aes192(
                        cbc::Decryptor::new_from_slices(key, &iv).map_err(bad_key)?,
                    ),
                    AesBits::Aes256 => CbcCipher::Aes256(
                        cbc::Decryptor::new_from_slices(key, &iv).map_err(bad_key)?,
                    ),
                };
                Ok(Decryptor::Cbc {
                    cipher,
                    pending: Vec::new(),
                })
            }
        }
    }

    fn process(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            Decryptor::Identity => Ok(input.to_vec()),
            Decryptor::Ctr(cipher) => {
                let mut out = input.to_vec();
                cipher.apply(&mut out);
                Ok(out)
            }
            Decryptor::Cbc { cipher, pending } => {
                pending.extend_from_slice(input);
                // keep the final (possibly padding) block in pending
                let mut full = pending.len() - pending.len() % AES_BLOCK;
                if full > 0 && full == pending.len() {
                    full -= AES_BLOCK;
                }
                let mut out: Vec<u8> = pending.drain(..full).collect();
                for block in out.chunks_exact_mut(AES_BLOCK) {
                    let block = GenericArray::from_mut_slice(block);
                    for_each_cbc!(&mut *cipher, c => c.decrypt_block_mut(block));
                }
                Ok(out)
            }
        }
    }

    fn finish(self) -> Result<Vec<u8>> {
        match self {
            Decryptor::Identity | Decryptor::Ctr(_) => Ok(Vec::new()),
            Decryptor::Cbc {
                mut cipher,
                mut pending,
            } => {
                if pending.len() != AES_BLOCK {
                    return Err(Error::corrupt(format!(
                        "encrypted stream length is not block-aligned ({} trailing bytes)",
                        pending.len()
                    )));
                }
                let block = GenericArray::from_mut_slice(pending.as_mut_slice());
                for_each_cbc!(&mut cipher, c => c.decrypt_block_mut(block));
                let pad = *pending.last().unwrap() as usize;
                if pad == 0 || pad > AES_BLOCK || pending[AES_BLOCK - pad..]
                    .iter()
                    .any(|&b| b as usize != pad)
                {
                    return Err(Error::corrupt("bad padding in encrypted stream"));
                }
                pending.truncate(AES_BLOCK - pad);
                Ok(pending)
            }
        }
    }
}

struct Sink {
    path: Utf8PathBuf,
    file: File,
}

enum Pipeline {
    Passthrough,
    Backup {
        compressor: Compressor,
        encryptor: Encryptor,
    },
    Restore {
        decryptor: Decryptor,
        decompressor: Decompressor,
    },
}

pub struct Streamer {
    mode: StreamerMode,
    compression: CompressionCodec,
    encryption: EncryptionConfig,
    pipeline: Option<Pipeline>,
    buffer: Vec<u8>,
    sinks: Vec<Sink>,
    written: u64,
    finalized: bool,
    compression_elapsed: Duration,
    encryption_elapsed: Duration,
}

impl Streamer {
    pub fn new(
        mode: StreamerMode,
        compression: CompressionCodec,
        encryption: EncryptionConfig,
        key: Option<&[u8]>,
    ) -> Result<Streamer> {
        // with neither codec nor cipher the mode degenerates to fan-out
        let mode = if compression == CompressionCodec::None && encryption == EncryptionConfig::None
        {
            StreamerMode::Passthrough
        } else {
            mode
        };
        let pipeline = match mode {
            StreamerMode::Passthrough => Pipeline::Passthrough,
            StreamerMode::Backup => Pipeline::Backup {
                compressor: Compressor::new(compression)?,
                encryptor: Encryptor::new(encryption, key)?,
            },
            StreamerMode::Restore => Pipeline::Restore {
                decryptor: Decryptor::new(encryption, key)?,
                decompressor: Decompressor::new(compression)?,
            },
        };
        Ok(Streamer {
            mode,
            compression,
            encryption,
            pipeline: Some(pipeline),
            buffer: Vec::with_capacity(STREAMER_BUFFER_SIZE),
            sinks: Vec::new(),
            written: 0,
            finalized: false,
            compression_elapsed: Duration::ZERO,
            encryption_elapsed: Duration::ZERO,
        })
    }

    /// The name a source file gets on the backup side: codec extension
    /// first, cipher extension after.
    pub fn backup_file_name(
        name: &str,
        compression: CompressionCodec,
        encryption: EncryptionConfig,
    ) -> String {
        let mut out = name.to_string();
        if let Some(ext) = compression.extension() {
            out.push('.');
            out.push_str(ext);
        }
        if encryption != EncryptionConfig::None {
            out.push_str(".aes");
        }
        out
    }

    /// Reverse of [`Self::backup_file_name`]: strip the known extensions.
    pub fn restore_file_name(name: &str) -> String {
        let mut out = name;
        if let Some(stripped) = out.strip_suffix(".aes") {
            out = stripped;
        }
        for ext in [".gz", ".zstd", ".lz4", ".bz2"] {
            if let Some(stripped) = out.strip_suffix(ext) {
                out = stripped;
                break;
            }
        }
        out.to_string()
    }

    /// Open (create or truncate) a destination file.
    pub fn add_destination(&mut self, path: impl AsRef<Utf8Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
        self.sinks.push(Sink { path, file });
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn compression_elapsed(&self) -> Duration {
        self.compression_elapsed
    }

    pub fn encryption_elapsed(&self) -> Duration {
        self.encryption_elapsed
    }

    /// Stage `data`, running the pipeline whenever the staging buffer
    /// fills; `last_chunk` drains and finalizes the whole stream.
    pub fn write(&mut self, data: &[u8], last_chunk: bool) -> Result<()> {
        assert!(!self.finalized, "streamer already finalized");
        let mut offset = 0;
        loop {
            let room = STREAMER_BUFFER_SIZE - self.buffer.len();
            let take = room.min(data.len() - offset);
            self.buffer.extend_from_slice(&data[offset..offset + take]);
            offset += take;
            let is_last = last_chunk && offset == data.len();
            if self.buffer.len() == STREAMER_BUFFER_SIZE || is_last {
                if let Err(e) = self.run_pipeline(is_last) {
                    self.abort();
                    return Err(e);
                }
            }
            if offset == data.len() {
                break;
            }
        }
        if last_chunk {
            self.finalized = true;
            for sink in &mut self.sinks {
                if let Err(e) = sink.file.sync_all() {
                    let err = Error::io(&sink.path, e);
                    self.abort();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn run_pipeline(&mut self, last_chunk: bool) -> Result<()> {
        let chunk = std::mem::take(&mut self.buffer);
        let mut pipeline = self.pipeline.take().expect("pipeline present");
        let output = match &mut pipeline {
            Pipeline::Passthrough => chunk,
            Pipeline::Backup {
                compressor,
                encryptor,
            } => {
                let started = Instant::now();
                let mut compressed = compressor
                    .process(&chunk)
                    .map_err(|e| Error::corrupt(format!("compression failed: {e}")))?;
                if last_chunk {
                    let inner = std::mem::replace(compressor, Compressor::Identity);
                    compressed.extend(
                        inner
                            .finish()
                            .map_err(|e| Error::corrupt(format!("compression failed: {e}")))?,
                    );
                }
                self.compression_elapsed += started.elapsed();

                let started = Instant::now();
                let mut encrypted = encryptor.process(&compressed);
                if last_chunk {
                    let inner = std::mem::replace(encryptor, Encryptor::Identity);
                    encrypted.extend(inner.finish());
                }
                self.encryption_elapsed += started.elapsed();
                encrypted
            }
            Pipeline::Restore {
                decryptor,
                decompressor,
            } => {
                let started = Instant::now();
                let mut decrypted = decryptor.process(&chunk)?;
                if last_chunk {
                    let inner = std::mem::replace(decryptor, Decryptor::Identity);
                    decrypted.extend(inner.finish()?);
                }
                self.encryption_elapsed += started.elapsed();

                let started = Instant::now();
                let mut output = decompressor
                    .process(&decrypted)
                    .map_err(|e| Error::corrupt(format!("decompression failed: {e}")))?;
                if last_chunk {
                    let inner = std::mem::replace(decompressor, Decompressor::Identity);
                    output.extend(
                        inner
                            .finish()
                            .map_err(|e| Error::corrupt(format!("decompression failed: {e}")))?,
                    );
                }
                self.compression_elapsed += started.elapsed();
                output
            }
        };
        self.pipeline = Some(pipeline);

        for sink in &mut self.sinks {
            sink.file
                .write_all(&output)
                .map_err(|e| Error::io(&sink.path, e))?;
        }
        self.written += output.len() as u64;
        Ok(())
    }

    /// Drop the destination files of a failed stream.
    fn abort(&mut self) {
        for sink in self.sinks.drain(..) {
            drop(sink.file);
            if let Err(e) = std::fs::remove_file(&sink.path) {
                debug!("could not remove partial file {}: {e}", sink.path);
            }
        }
        self.finalized = true;
    }

    pub fn mode(&self) -> StreamerMode {
        self.mode
    }

    pub fn compression(&self) -> CompressionCodec {
        self.compression
    }

    pub fn encryption(&self) -> EncryptionConfig {
        self.encryption
    }
}

/// Stream one file through a freshly constructed pipeline into one
/// destination. The workhorse behind backup, restore and hot standby.
pub fn stream_file(
    source: &Utf8Path,
    dest: &Utf8Path,
    mode: StreamerMode,
    compression: CompressionCodec,
    encryption: EncryptionConfig,
    key: Option<&[u8]>,
) -> Result<Streamer> {
    use std::io::Read;

    let mut streamer = Streamer::new(mode, compression, encryption, key)?;
    streamer.add_destination(dest)?;

    let mut input = File::open(source).map_err(|e| Error::io(source, e))?;
    let mut buf = vec![0u8; STREAMER_BUFFER_SIZE];
    loop {
        let n = input.read(&mut buf).map_err(|e| Error::io(source, e))?;
        if n == 0 {
            streamer.write(&[], true)?;
            break;
        }
        streamer.write(&buf[..n], false)?;
    }
    Ok(streamer)
}
