//! Payload compression: magic-byte sniffing plus the codecs behind it.
//!
//! Framed objects only say *that* they are compressed (flag 0x80), never
//! *how*.  The family is recovered from the leading bytes of the payload:
//!
//! | Leading bytes          | Tag                |
//! |------------------------|--------------------|
//! | `00 00 00 5D 00 00`    | `LzmaZeroPrefixed` |
//! | `5D 00 00`             | `Lzma`             |
//! | `42 5A 68` (`BZh`)     | `Bzip2`            |
//! | anything else          | `Unknown`          |
//!
//! Some images put three zero bytes in front of the LZMA properties byte.
//! Nothing explains them; they are skipped and kept verbatim so the object
//! can be re-framed byte for byte.

use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use thiserror::Error;

/// LZMA properties byte for lc=3, lp=0, pb=2.
const LZMA_PROPS: u8 = 0x5D;

// ── CompressionTag ───────────────────────────────────────────────────────────

/// Compression family of a framed payload.  Derived, never stored in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionTag {
    None,
    Lzma,
    LzmaZeroPrefixed,
    Bzip2,
    Unknown,
}

impl CompressionTag {
    /// Human-readable name (diagnostics and CLI).
    pub fn name(self) -> &'static str {
        match self {
            CompressionTag::None             => "none",
            CompressionTag::Lzma             => "lzma",
            CompressionTag::LzmaZeroPrefixed => "lzma-zero-prefixed",
            CompressionTag::Bzip2            => "bzip2",
            CompressionTag::Unknown          => "unknown",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none"                       => Some(CompressionTag::None),
            "lzma"                       => Some(CompressionTag::Lzma),
            "lzma-zero-prefixed" | "lzma0" => Some(CompressionTag::LzmaZeroPrefixed),
            "bzip2" | "bz2"              => Some(CompressionTag::Bzip2),
            _                            => None,
        }
    }

    /// File extension used when a payload is written out still compressed.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            CompressionTag::None                                => None,
            CompressionTag::Lzma | CompressionTag::LzmaZeroPrefixed => Some("lzma"),
            CompressionTag::Bzip2                               => Some("bz2"),
            CompressionTag::Unknown                             => Some("bin"),
        }
    }

    /// The bytes that precede the real stream for this family.
    pub fn quirk_prefix(self) -> &'static [u8] {
        match self {
            CompressionTag::LzmaZeroPrefixed => &[0, 0, 0],
            _                                => &[],
        }
    }
}

// ── Sniffer ──────────────────────────────────────────────────────────────────

/// Result of [`sniff`]: the family and how many leading bytes precede the
/// actual compressed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sniffed {
    pub tag:    CompressionTag,
    pub prefix: usize,
}

/// Identify the compression family from the first bytes of a payload.
/// First match wins.
pub fn sniff(payload: &[u8]) -> Sniffed {
    let (tag, prefix) = match payload {
        [0, 0, 0, LZMA_PROPS, 0, 0, ..] => (CompressionTag::LzmaZeroPrefixed, 3),
        [LZMA_PROPS, 0, 0, ..]          => (CompressionTag::Lzma, 0),
        [b'B', b'Z', b'h', ..]          => (CompressionTag::Bzip2, 0),
        _                               => (CompressionTag::Unknown, 0),
    };
    Sniffed { tag, prefix }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("No codec available for {} payloads", .0.name())]
    Unsupported(CompressionTag),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn tag(&self) -> CompressionTag;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn tag(&self) -> CompressionTag { CompressionTag::None }
    fn compress(&self, data: &[u8])   -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
}

/// `.lzma` ("LZMA alone") streams, with or without the zero prefix.
///
/// The codec works on the bare stream; callers strip or add the prefix
/// given by [`CompressionTag::quirk_prefix`].
pub struct LzmaCodec {
    tag: CompressionTag,
}

impl Codec for LzmaCodec {
    fn tag(&self) -> CompressionTag { self.tag }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_decompress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

pub struct Bzip2Codec;
impl Codec for Bzip2Codec {
    fn tag(&self) -> CompressionTag { CompressionTag::Bzip2 }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        bzip2::read::BzEncoder::new(data, bzip2::Compression::best())
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        bzip2::read::BzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a tag to a built-in codec.  `Unknown` payloads have no codec and
/// must be carried as opaque bytes.
pub fn get_codec(tag: CompressionTag) -> Result<Box<dyn Codec>, CodecError> {
    match tag {
        CompressionTag::None    => Ok(Box::new(NoneCodec)),
        CompressionTag::Lzma
        | CompressionTag::LzmaZeroPrefixed => Ok(Box::new(LzmaCodec { tag })),
        CompressionTag::Bzip2   => Ok(Box::new(Bzip2Codec)),
        CompressionTag::Unknown => Err(CodecError::Unsupported(tag)),
    }
}
