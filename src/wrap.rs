//! Single-object framing.
//!
//! A framed object is a [`ContainerHeader`] followed directly by its payload.
//! For compressed payloads the stored bytes are the codec's quirk prefix plus
//! the compressed stream; `compressed_length` and `compressed_checksum` cover
//! both.  `original_length` and `original_checksum` always describe the
//! uncompressed bytes.
//!
//! Devices validate these fields at boot, so the layout must be exact.

use std::io;
use thiserror::Error;

use crate::catalog::Framing;
use crate::checksum::{checksum, Checksum};
use crate::codec::{get_codec, CodecError, CompressionTag};
use crate::header::{
    ContainerHeader, FLAG_COMPRESSED, FLAG_COMPRESSED_CHECKSUM, FLAG_ORIGINAL_CHECKSUM, HEADER_SIZE,
};

#[derive(Error, Debug)]
pub enum WrapError {
    #[error("{0}")]
    Codec(#[from] CodecError),
    #[error("Payload of {length} bytes does not fit a 32-bit length field")]
    TooLarge { length: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Settings for [`wrap`].
#[derive(Debug, Clone)]
pub struct WrapOptions {
    /// `None` stores the payload verbatim.
    pub codec:             CompressionTag,
    pub load_address:      u32,
    pub object_type:       u8,
    pub version:           String,
    pub map_table_address: u32,
    /// Fill in and flag the checksum fields.
    pub checksums:         bool,
}

impl Default for WrapOptions {
    fn default() -> Self {
        Self {
            codec:             CompressionTag::None,
            load_address:      0,
            object_type:       0,
            version:           String::new(),
            map_table_address: 0,
            checksums:         true,
        }
    }
}

fn length_field(length: usize) -> Result<u32, WrapError> {
    u32::try_from(length).map_err(|_| WrapError::TooLarge { length })
}

/// Frame `payload` under the header recorded in `framing`.
///
/// Length and checksum fields are recomputed for the flags the header
/// carries; every other field is kept.  When `framing.decompressed` is set,
/// `payload` holds the uncompressed bytes and is compressed with
/// `framing.codec` first.  Otherwise it is the stored stream without its
/// quirk prefix, and an unchanged payload reproduces the original framing
/// byte for byte.
pub fn reframe(framing: &Framing, payload: &[u8]) -> Result<Vec<u8>, WrapError> {
    let mut header = framing.header.clone();

    if framing.codec == CompressionTag::None {
        header.original_length = length_field(payload.len())?;
        if header.has_original_checksum() {
            header.original_checksum = checksum(payload);
        }
        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(payload);
        return Ok(out);
    }

    let compressed;
    let stream = if framing.decompressed {
        header.original_length = length_field(payload.len())?;
        if header.has_original_checksum() {
            header.original_checksum = checksum(payload);
        }
        compressed = get_codec(framing.codec)?.compress(payload)?;
        compressed.as_slice()
    } else {
        payload
    };

    let prefix = framing.codec.quirk_prefix();
    header.compressed_length = length_field(prefix.len() + stream.len())?;
    if header.has_compressed_checksum() {
        let mut sum = Checksum::new();
        sum.update(prefix);
        sum.update(stream);
        header.compressed_checksum = sum.value();
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + prefix.len() + stream.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(prefix);
    out.extend_from_slice(stream);
    Ok(out)
}

/// Build a framed object from a raw payload.
pub fn wrap(payload: &[u8], opts: &WrapOptions) -> Result<Vec<u8>, WrapError> {
    if opts.codec == CompressionTag::Unknown {
        return Err(CodecError::Unsupported(opts.codec).into());
    }

    let mut flags = 0;
    if opts.checksums {
        flags |= FLAG_ORIGINAL_CHECKSUM;
    }
    if opts.codec != CompressionTag::None {
        flags |= FLAG_COMPRESSED;
        if opts.checksums {
            flags |= FLAG_COMPRESSED_CHECKSUM;
        }
    }

    let mut header = ContainerHeader {
        load_address:      opts.load_address,
        object_type:       opts.object_type,
        flags,
        map_table_address: opts.map_table_address,
        ..ContainerHeader::default()
    };
    header.set_version(&opts.version);

    let framing = Framing { header, codec: opts.codec, decompressed: true };
    reframe(&framing, payload)
}
