//! Streaming compression filters for stream connections.
//!
//! The write side produces wire bytes per send call; the read side is an
//! incremental state machine fed raw socket bytes. Both keep their streaming
//! state (deflate dictionary, snappy frame boundary) across calls, so a
//! compressed conversation behaves like the plain one: every `send` becomes
//! visible to the peer without waiting for more input.
//!
//! Deflate uses raw-deflate framing (`flate2`, no zlib header). Snappy uses
//! the self-delimiting snappy framing format built on the `snap` raw codec:
//! a stream-identifier chunk followed by compressed or uncompressed chunks,
//! each carrying a masked CRC-32C of its uncompressed content.

use bytes::{Buf, BytesMut};
use flate2::{Compression, Decompress, FlushDecompress, Status};
use std::io::{self, Write};

/// Compression mode for a connection's filter chain.
///
/// The zip levels map onto flate2's 0-9 scale. The enum is closed, so an
/// unrecognized mode is unrepresentable by construction; rejecting illegal
/// modes is a type-system contract rather than a runtime check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressType {
    /// No filter; payloads pass through untouched.
    #[default]
    None,
    /// Deflate at the fastest level (flate2 level 1).
    ZipBestSpeed,
    /// Deflate at the default level (flate2 level 6).
    ZipDefault,
    /// Deflate at the best-compression level (flate2 level 9).
    ZipBestCompression,
    /// Huffman-only deflate. The flate2 backend has no huffman-only mode;
    /// this maps to the fastest level, the nearest available setting.
    ZipHuffmanOnly,
    /// Snappy framing format (streaming).
    Snappy,
}

impl CompressType {
    /// The flate2 compression level for zip modes, `None` otherwise.
    pub fn flate_level(self) -> Option<Compression> {
        match self {
            Self::ZipBestSpeed | Self::ZipHuffmanOnly => Some(Compression::fast()),
            Self::ZipDefault => Some(Compression::default()),
            Self::ZipBestCompression => Some(Compression::best()),
            Self::None | Self::Snappy => None,
        }
    }

    /// Whether this mode inserts a filter into the I/O path.
    pub fn is_active(self) -> bool {
        self != Self::None
    }

    /// Short mode name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ZipBestSpeed => "zip-fast",
            Self::ZipDefault => "zip-default",
            Self::ZipBestCompression => "zip-best",
            Self::ZipHuffmanOnly => "zip-huffman-only",
            Self::Snappy => "snappy",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::ZipBestSpeed => 1,
            Self::ZipDefault => 2,
            Self::ZipBestCompression => 3,
            Self::ZipHuffmanOnly => 4,
            Self::Snappy => 5,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::ZipBestSpeed,
            2 => Self::ZipDefault,
            3 => Self::ZipBestCompression,
            4 => Self::ZipHuffmanOnly,
            5 => Self::Snappy,
            _ => Self::None,
        }
    }
}

impl std::fmt::Display for CompressType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outbound filter chain.
pub(crate) enum WriteFilter {
    Plain,
    Deflate(flate2::write::DeflateEncoder<Vec<u8>>),
    Snappy(SnappyEncoder),
}

impl WriteFilter {
    pub(crate) fn new(mode: CompressType) -> Self {
        match mode.flate_level() {
            Some(level) => Self::Deflate(flate2::write::DeflateEncoder::new(Vec::new(), level)),
            None if mode == CompressType::Snappy => Self::Snappy(SnappyEncoder::new()),
            None => Self::Plain,
        }
    }

    /// Run one payload through the filter, returning the wire bytes to write.
    /// `None` means the filter is inactive and the payload goes out as-is.
    pub(crate) fn encode(&mut self, payload: &[u8]) -> io::Result<Option<Vec<u8>>> {
        match self {
            Self::Plain => Ok(None),
            Self::Deflate(enc) => {
                enc.write_all(payload)?;
                // Sync-flush so this payload is decodable without more input.
                enc.flush()?;
                Ok(Some(std::mem::take(enc.get_mut())))
            }
            Self::Snappy(enc) => enc.encode(payload).map(Some),
        }
    }

    /// Trailing wire bytes owed at close time, if any.
    pub(crate) fn finish(&mut self) -> io::Result<Vec<u8>> {
        match self {
            Self::Plain | Self::Snappy(_) => Ok(Vec::new()),
            Self::Deflate(enc) => {
                enc.flush()?;
                Ok(std::mem::take(enc.get_mut()))
            }
        }
    }
}

/// Inbound filter chain. Decoded bytes spill into `decoded` and are served
/// to callers across recv calls.
pub(crate) struct ReadState {
    filter: ReadFilter,
    pub(crate) decoded: BytesMut,
}

enum ReadFilter {
    Plain,
    Deflate(Decompress),
    Snappy(SnappyDecoder),
}

impl ReadState {
    pub(crate) fn new(mode: CompressType) -> Self {
        let filter = if mode.flate_level().is_some() {
            // Raw deflate, matching the write side (no zlib header).
            ReadFilter::Deflate(Decompress::new(false))
        } else if mode == CompressType::Snappy {
            ReadFilter::Snappy(SnappyDecoder::new())
        } else {
            ReadFilter::Plain
        };
        Self {
            filter,
            decoded: BytesMut::new(),
        }
    }

    pub(crate) fn is_plain(&self) -> bool {
        matches!(self.filter, ReadFilter::Plain)
    }

    /// Feed raw socket bytes through the filter, appending decoded output.
    pub(crate) fn decode(&mut self, input: &[u8]) -> io::Result<()> {
        match &mut self.filter {
            ReadFilter::Plain => {
                self.decoded.extend_from_slice(input);
                Ok(())
            }
            ReadFilter::Deflate(z) => inflate_into(z, input, &mut self.decoded),
            ReadFilter::Snappy(dec) => dec.decode(input, &mut self.decoded),
        }
    }
}

fn inflate_into(z: &mut Decompress, mut input: &[u8], out: &mut BytesMut) -> io::Result<()> {
    let mut scratch = [0u8; 8192];
    loop {
        let before_in = z.total_in();
        let before_out = z.total_out();
        let status = z
            .decompress(input, &mut scratch, FlushDecompress::None)
            .map_err(io::Error::other)?;
        let consumed = (z.total_in() - before_in) as usize;
        let produced = (z.total_out() - before_out) as usize;
        out.extend_from_slice(&scratch[..produced]);
        input = &input[consumed..];
        if matches!(status, Status::StreamEnd) {
            break;
        }
        // A full scratch window means more output may be pending even with
        // no input left; anything less means the stream needs more input.
        if input.is_empty() && produced < scratch.len() {
            break;
        }
        // No forward progress at all: wait for more input.
        if consumed == 0 && produced == 0 {
            break;
        }
    }
    Ok(())
}

const SNAPPY_STREAM_IDENTIFIER: &[u8] = b"\xff\x06\x00\x00sNaPpY";
const SNAPPY_MAX_BLOCK: usize = 65536;
const CHUNK_COMPRESSED: u8 = 0x00;
const CHUNK_UNCOMPRESSED: u8 = 0x01;
const CHUNK_STREAM_IDENTIFIER: u8 = 0xff;

/// Snappy framing-format writer over the raw codec.
pub(crate) struct SnappyEncoder {
    raw: snap::raw::Encoder,
    wrote_header: bool,
}

impl SnappyEncoder {
    fn new() -> Self {
        Self {
            raw: snap::raw::Encoder::new(),
            wrote_header: false,
        }
    }

    fn encode(&mut self, payload: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(payload.len() / 2 + 32);
        if !self.wrote_header {
            out.extend_from_slice(SNAPPY_STREAM_IDENTIFIER);
            self.wrote_header = true;
        }
        for block in payload.chunks(SNAPPY_MAX_BLOCK) {
            let crc = masked_crc32c(block);
            let compressed = self
                .raw
                .compress_vec(block)
                .map_err(|e| io::Error::other(e))?;
            let (ty, body): (u8, &[u8]) = if compressed.len() < block.len() {
                (CHUNK_COMPRESSED, &compressed)
            } else {
                (CHUNK_UNCOMPRESSED, block)
            };
            let len = body.len() + 4;
            out.push(ty);
            out.extend_from_slice(&[(len & 0xff) as u8, (len >> 8 & 0xff) as u8, (len >> 16) as u8]);
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(body);
        }
        Ok(out)
    }
}

/// Incremental snappy framing-format reader. Partial chunks are buffered
/// until the remainder arrives.
pub(crate) struct SnappyDecoder {
    raw: snap::raw::Decoder,
    buf: BytesMut,
}

impl SnappyDecoder {
    fn new() -> Self {
        Self {
            raw: snap::raw::Decoder::new(),
            buf: BytesMut::new(),
        }
    }

    fn decode(&mut self, input: &[u8], out: &mut BytesMut) -> io::Result<()> {
        self.buf.extend_from_slice(input);
        loop {
            if self.buf.len() < 4 {
                return Ok(());
            }
            let ty = self.buf[0];
            let len =
                self.buf[1] as usize | (self.buf[2] as usize) << 8 | (self.buf[3] as usize) << 16;
            if self.buf.len() < 4 + len {
                return Ok(());
            }
            let chunk = &self.buf[4..4 + len];
            match ty {
                CHUNK_STREAM_IDENTIFIER => {
                    if chunk != &SNAPPY_STREAM_IDENTIFIER[4..] {
                        return Err(corrupt("bad snappy stream identifier"));
                    }
                }
                CHUNK_COMPRESSED => {
                    if len < 4 {
                        return Err(corrupt("snappy chunk shorter than its checksum"));
                    }
                    let crc = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    let data = self
                        .raw
                        .decompress_vec(&chunk[4..])
                        .map_err(|e| io::Error::other(e))?;
                    if masked_crc32c(&data) != crc {
                        return Err(corrupt("snappy chunk checksum mismatch"));
                    }
                    out.extend_from_slice(&data);
                }
                CHUNK_UNCOMPRESSED => {
                    if len < 4 {
                        return Err(corrupt("snappy chunk shorter than its checksum"));
                    }
                    let crc = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    let data = &chunk[4..];
                    if masked_crc32c(data) != crc {
                        return Err(corrupt("snappy chunk checksum mismatch"));
                    }
                    out.extend_from_slice(data);
                }
                // 0x02-0x7f are reserved unskippable chunk types.
                0x02..=0x7f => return Err(corrupt("reserved unskippable snappy chunk")),
                // 0x80-0xfe are reserved skippable chunk types.
                _ => {}
            }
            self.buf.advance(4 + len);
        }
    }
}

fn corrupt(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// CRC-32C (Castagnoli), bitwise. Chunk payloads are small enough that a
/// table-free implementation is not a bottleneck here.
fn crc32c(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = 0u32.wrapping_sub(crc & 1);
            crc = (crc >> 1) ^ (0x82F6_3B78 & mask);
        }
    }
    !crc
}

/// The snappy framing format stores checksums masked to avoid pathological
/// inputs that contain their own CRC.
fn masked_crc32c(data: &[u8]) -> u32 {
    crc32c(data).rotate_right(15).wrapping_add(0xA282_EAD8)
}
