//! The 48-byte ROMIO container header.
//!
//! Found at offset 0 of every image and again in front of every framed
//! object (HTP code, RAS code, ...).  All multi-byte fields are big-endian.
//!
//! ```text
//!  0  load_address        u32
//!  4  (pad)               2
//!  6  signature           3   "SIG"
//!  9  object_type         u8
//! 10  original_length     u32
//! 14  compressed_length   u32
//! 18  flags               u8
//! 19  (pad)               1
//! 20  original_checksum   u16
//! 22  compressed_checksum u16
//! 24  version             15  NUL padded
//! 39  map_table_address   u32
//! 43  (pad)               5
//! ```

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read};
use thiserror::Error;

use crate::text_field;

pub const HEADER_SIZE: usize = 48;
pub const SIGNATURE: [u8; 3] = *b"SIG";
pub const VERSION_LEN: usize = 15;

/// The compressed checksum field is valid.
pub const FLAG_COMPRESSED_CHECKSUM: u8 = 0x20;
/// `original_length` / `original_checksum` are valid.
pub const FLAG_ORIGINAL_CHECKSUM: u8 = 0x40;
/// The payload following the header is compressed.
pub const FLAG_COMPRESSED: u8 = 0x80;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Signature mismatch: expected \"SIG\", found {}", hex::encode(.found))]
    SignatureMismatch { found: [u8; 3] },
    #[error("Header truncated: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHeader {
    pub load_address:        u32,
    #[serde(skip, default = "signature")]
    pub signature:           [u8; 3],
    pub object_type:         u8,
    pub original_length:     u32,
    pub original_checksum:   u16,
    pub compressed_length:   u32,
    pub compressed_checksum: u16,
    pub flags:               u8,
    #[serde(with = "version_field")]
    pub version:             [u8; VERSION_LEN],
    pub map_table_address:   u32,
}

fn signature() -> [u8; 3] {
    SIGNATURE
}

impl Default for ContainerHeader {
    fn default() -> Self {
        Self {
            load_address:        0,
            signature:           SIGNATURE,
            object_type:         0,
            original_length:     0,
            original_checksum:   0,
            compressed_length:   0,
            compressed_checksum: 0,
            flags:               0,
            version:             [0u8; VERSION_LEN],
            map_table_address:   0,
        }
    }
}

impl ContainerHeader {
    /// Decode the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// The signature is checked before anything else is returned; a mismatch
    /// means none of the other fields can be trusted.
    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated { needed: HEADER_SIZE, available: buf.len() });
        }
        let mut r = &buf[..HEADER_SIZE];

        let load_address = r.read_u32::<BigEndian>()?;
        r.read_u16::<BigEndian>()?;
        let mut signature = [0u8; 3];
        r.read_exact(&mut signature)?;
        if signature != SIGNATURE {
            return Err(HeaderError::SignatureMismatch { found: signature });
        }
        let object_type       = r.read_u8()?;
        let original_length   = r.read_u32::<BigEndian>()?;
        let compressed_length = r.read_u32::<BigEndian>()?;
        let flags             = r.read_u8()?;
        r.read_u8()?;
        let original_checksum   = r.read_u16::<BigEndian>()?;
        let compressed_checksum = r.read_u16::<BigEndian>()?;
        let mut version = [0u8; VERSION_LEN];
        r.read_exact(&mut version)?;
        let map_table_address = r.read_u32::<BigEndian>()?;

        Ok(Self {
            load_address,
            signature,
            object_type,
            original_length,
            original_checksum,
            compressed_length,
            compressed_checksum,
            flags,
            version,
            map_table_address,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        BigEndian::write_u32(&mut raw[0..4], self.load_address);
        raw[6..9].copy_from_slice(&self.signature);
        raw[9] = self.object_type;
        BigEndian::write_u32(&mut raw[10..14], self.original_length);
        BigEndian::write_u32(&mut raw[14..18], self.compressed_length);
        raw[18] = self.flags;
        BigEndian::write_u16(&mut raw[20..22], self.original_checksum);
        BigEndian::write_u16(&mut raw[22..24], self.compressed_checksum);
        raw[24..39].copy_from_slice(&self.version);
        BigEndian::write_u32(&mut raw[39..43], self.map_table_address);
        raw
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn has_original_checksum(&self) -> bool {
        self.flags & FLAG_ORIGINAL_CHECKSUM != 0
    }

    pub fn has_compressed_checksum(&self) -> bool {
        self.flags & FLAG_COMPRESSED_CHECKSUM != 0
    }

    /// Version text up to the first NUL, for display.
    pub fn version_str(&self) -> String {
        let end = self.version.iter().position(|&b| b == 0).unwrap_or(VERSION_LEN);
        String::from_utf8_lossy(&self.version[..end]).into_owned()
    }

    /// Store `version`, cut to [`VERSION_LEN`] bytes and NUL padded.
    pub fn set_version(&mut self, version: &str) {
        let bytes = version.as_bytes();
        let n = bytes.len().min(VERSION_LEN);
        self.version = [0u8; VERSION_LEN];
        self.version[..n].copy_from_slice(&bytes[..n]);
    }
}

impl fmt::Display for ContainerHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Type: {:02X}", self.object_type)?;
        writeln!(f, "  Version: {}", self.version_str())?;
        writeln!(f, "  Loading address: {:08X}", self.load_address)?;
        writeln!(f, "  Memmap address: {:08X}", self.map_table_address)?;
        write!(f, "  Flags: {:02X}", self.flags)?;
        if self.has_original_checksum() {
            write!(f, "\n  Original size: {:08X}; checksum: {:04X}",
                self.original_length, self.original_checksum)?;
        } else {
            write!(f, "\n  Original size: {:08X}", self.original_length)?;
        }
        if self.is_compressed() {
            if self.has_compressed_checksum() {
                write!(f, "\n  Compressed size: {:08X}; checksum: {:04X}",
                    self.compressed_length, self.compressed_checksum)?;
            } else {
                write!(f, "\n  Compressed size: {:08X}", self.compressed_length)?;
            }
        }
        Ok(())
    }
}

/// All fifteen version bytes, as text when printable and hex otherwise.
mod version_field {
    use super::{text_field, VERSION_LEN};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(raw: &[u8; VERSION_LEN], s: S) -> Result<S::Ok, S::Error> {
        text_field::serialize(raw, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; VERSION_LEN], D::Error> {
        let bytes = text_field::deserialize(d, VERSION_LEN)?;
        let mut raw = [0u8; VERSION_LEN];
        raw[..bytes.len()].copy_from_slice(&bytes);
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> ContainerHeader {
        let mut h = ContainerHeader {
            load_address:        0x8000_0000,
            object_type:         0x03,
            original_length:     0x0012_3456,
            original_checksum:   0xBEEF,
            compressed_length:   0x0000_8000,
            compressed_checksum: 0x1234,
            flags:               FLAG_COMPRESSED | FLAG_ORIGINAL_CHECKSUM | FLAG_COMPRESSED_CHECKSUM,
            map_table_address:   0xBFC0_9000,
            ..Default::default()
        };
        h.set_version("V3.40(AGD.2)");
        h
    }

    #[test]
    fn field_offsets() {
        let raw = sample().encode();
        assert_eq!(&raw[0..4], &[0x80, 0, 0, 0]);
        assert_eq!(&raw[4..6], &[0, 0]);
        assert_eq!(&raw[6..9], b"SIG");
        assert_eq!(raw[9], 0x03);
        assert_eq!(&raw[10..14], &[0x00, 0x12, 0x34, 0x56]);
        assert_eq!(&raw[14..18], &[0x00, 0x00, 0x80, 0x00]);
        assert_eq!(raw[18], 0xE0);
        assert_eq!(raw[19], 0);
        assert_eq!(&raw[20..22], &[0xBE, 0xEF]);
        assert_eq!(&raw[22..24], &[0x12, 0x34]);
        assert_eq!(&raw[24..36], b"V3.40(AGD.2)");
        assert_eq!(&raw[36..39], &[0, 0, 0]);
        assert_eq!(&raw[39..43], &[0xBF, 0xC0, 0x90, 0x00]);
        assert_eq!(&raw[43..48], &[0u8; 5]);
    }

    #[test]
    fn decode_rejects_bad_signature() {
        let mut raw = sample().encode();
        raw[6] = b'X';
        match ContainerHeader::decode(&raw) {
            Err(HeaderError::SignatureMismatch { found }) => assert_eq!(&found, b"XIG"),
            other => panic!("expected signature mismatch, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let raw = sample().encode();
        assert!(matches!(
            ContainerHeader::decode(&raw[..40]),
            Err(HeaderError::Truncated { needed: 48, available: 40 })
        ));
    }

    #[test]
    fn edge_addresses_round_trip() {
        let h = ContainerHeader {
            load_address:      0,
            map_table_address: 0xFFFF_FFFF,
            ..Default::default()
        };
        assert_eq!(ContainerHeader::decode(&h.encode()).unwrap(), h);
    }

    #[test]
    fn display_hides_compressed_size_when_uncompressed() {
        let mut h = sample();
        h.flags = FLAG_ORIGINAL_CHECKSUM;
        let text = h.to_string();
        assert!(text.contains("Original size: 00123456; checksum: BEEF"));
        assert!(!text.contains("Compressed size"));
    }

    #[test]
    fn sidecar_json_keeps_version_text() {
        let h = sample();
        let json = serde_json::to_string(&h).unwrap();
        assert!(json.contains("\"V3.40(AGD.2)\""));
        let back: ContainerHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn sidecar_json_keeps_bytes_after_nul() {
        let mut h = sample();
        h.version = *b"V3.40\0\0\0\0\0\0\0\0\0\x01";
        assert_eq!(h.version_str(), "V3.40");

        let json = serde_json::to_string(&h).unwrap();
        assert!(json.contains(r#""version":{"hex":"56332e3430000000000000000000"#), "{json}");
        let back: ContainerHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version, h.version);
        assert_eq!(back.encode(), h.encode());
    }

    #[test]
    fn sidecar_rejects_overlong_version() {
        let json = serde_json::to_string(&sample()).unwrap()
            .replace("V3.40(AGD.2)", "V3.40(AGD.2)-extra");
        assert!(serde_json::from_str::<ContainerHeader>(&json).is_err());
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            load in any::<u32>(), ty in any::<u8>(),
            olen in any::<u32>(), osum in any::<u16>(),
            clen in any::<u32>(), csum in any::<u16>(),
            flags in any::<u8>(), version in any::<[u8; 15]>(),
            mmap in any::<u32>(),
        ) {
            let h = ContainerHeader {
                load_address: load,
                signature: SIGNATURE,
                object_type: ty,
                original_length: olen,
                original_checksum: osum,
                compressed_length: clen,
                compressed_checksum: csum,
                flags,
                version,
                map_table_address: mmap,
            };
            let raw = h.encode();
            prop_assert_eq!(ContainerHeader::decode(&raw).unwrap(), h.clone());
            prop_assert_eq!(ContainerHeader::decode(&raw).unwrap().encode(), raw);

            let back: ContainerHeader = serde_json::from_str(&serde_json::to_string(&h).unwrap()).unwrap();
            prop_assert_eq!(back, h);
        }
    }
}
