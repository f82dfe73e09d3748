//! The decoded memory map: entries, address translation, and the sidecar.
//!
//! ROM objects are addressed in the device's virtual address space.  The
//! ROM copy of `BootExt` always sits directly after the 48-byte outer header,
//! which pins the virtual address of file offset 0 (the *image base*):
//!
//! ```text
//! image_base  = BootExt.address - 48
//! file_offset = entry.address - image_base
//! ```

use log::warn;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::codec::CompressionTag;
use crate::header::{ContainerHeader, HEADER_SIZE};
use crate::table::TableEntry;

/// File name of the catalog written next to extracted objects.
pub const SIDECAR_NAME: &str = "memmap.json";

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("No ROM \"BootExt\" entry: cannot map virtual addresses to file offsets")]
    AnchorMissing,
    #[error("Sidecar error: {0}")]
    Sidecar(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Derive the image base from the ROM `BootExt` entry.
pub fn anchor(entries: &[TableEntry]) -> Result<u32, CatalogError> {
    let mut anchors = entries.iter().filter(|e| e.is_rom_anchor());
    let first = anchors.next().ok_or(CatalogError::AnchorMissing)?;
    if anchors.next().is_some() {
        warn!("more than one ROM BootExt entry; anchoring on {:08X}", first.address);
    }
    first
        .address
        .checked_sub(HEADER_SIZE as u32)
        .ok_or(CatalogError::AnchorMissing)
}

// ── ObjectCatalog ────────────────────────────────────────────────────────────

/// Where an entry's bytes live in a particular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// RAM-resident: never backed by file bytes.
    Ram,
    /// Declared, but this file does not contain it.
    OutOfBounds { offset: i64 },
    InFile { offset: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectCatalog {
    pub entries: Vec<TableEntry>,
    image_base:  Option<u32>,
}

impl ObjectCatalog {
    pub fn new(entries: Vec<TableEntry>) -> Self {
        Self { entries, image_base: None }
    }

    /// Build a catalog and anchor it in one step.
    pub fn anchored(entries: Vec<TableEntry>) -> Result<Self, CatalogError> {
        let mut catalog = Self::new(entries);
        catalog.anchor()?;
        Ok(catalog)
    }

    /// Compute and remember the image base.
    pub fn anchor(&mut self) -> Result<u32, CatalogError> {
        let base = anchor(&self.entries)?;
        self.image_base = Some(base);
        Ok(base)
    }

    pub fn image_base(&self) -> Option<u32> {
        self.image_base
    }

    pub fn rom_anchor(&self) -> Option<&TableEntry> {
        self.entries.iter().find(|e| e.is_rom_anchor())
    }

    pub fn ram_anchor(&self) -> Option<&TableEntry> {
        self.entries.iter().find(|e| e.is_ram_anchor())
    }

    pub fn memory_map(&self) -> Option<&TableEntry> {
        self.entries.iter().find(|e| e.is_memory_map())
    }

    /// RAM-resident entries, then ROM-resident ones, each in catalog order.
    pub fn partition(&self) -> (Vec<&TableEntry>, Vec<&TableEntry>) {
        self.entries.iter().partition(|e| e.is_ram())
    }

    /// Signed file offset of `entry`, if the catalog is anchored.
    pub fn file_offset(&self, entry: &TableEntry) -> Option<i64> {
        self.image_base
            .map(|base| i64::from(entry.address) - i64::from(base))
    }

    /// Classify `entry` against a file of `file_size` bytes.
    /// An unanchored catalog places every ROM entry out of bounds.
    pub fn placement(&self, entry: &TableEntry, file_size: usize) -> Placement {
        if entry.is_ram() {
            return Placement::Ram;
        }
        match self.file_offset(entry) {
            Some(offset) if offset >= 0 && (offset as u64) < file_size as u64 => {
                Placement::InFile { offset: offset as usize }
            }
            Some(offset) => Placement::OutOfBounds { offset },
            None         => Placement::OutOfBounds { offset: i64::from(entry.address) },
        }
    }
}

// ── Sidecar ──────────────────────────────────────────────────────────────────

/// How a framed object was written out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framing {
    /// The nested header exactly as found in the image.
    pub header:       ContainerHeader,
    /// `None` for uncompressed payloads.
    pub codec:        CompressionTag,
    /// The payload file holds decompressed bytes rather than the stream.
    #[serde(default)]
    pub decompressed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarEntry {
    #[serde(flatten)]
    pub entry:   TableEntry,
    /// Payload file, relative to the sidecar's directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file:    Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framing: Option<Framing>,
}

impl From<TableEntry> for SidecarEntry {
    fn from(entry: TableEntry) -> Self {
        Self { entry, file: None, framing: None }
    }
}

/// Companion catalog written by unpack and consumed by pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sidecar {
    /// Outer header of the source image.
    pub container:    ContainerHeader,
    pub image_base:   u32,
    /// File offset the table was found at.
    pub table_offset: u64,
    /// Opaque bytes after the entry array, inside the table checksum.
    #[serde(default, with = "hex_bytes", skip_serializing_if = "Vec::is_empty")]
    pub user_region:  Vec<u8>,
    pub entries:      Vec<SidecarEntry>,
}

impl Sidecar {
    pub fn catalog(&self) -> ObjectCatalog {
        ObjectCatalog::new(self.entries.iter().map(|e| e.entry.clone()).collect())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn write_to(&self, dir: &Path) -> Result<(), CatalogError> {
        std::fs::write(dir.join(SIDECAR_NAME), self.to_bytes()?)?;
        Ok(())
    }

    pub fn read_from(dir: &Path) -> Result<Self, CatalogError> {
        let bytes = std::fs::read(dir.join(SIDECAR_NAME))?;
        Ok(Self::from_bytes(&bytes)?)
    }
}

mod hex_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}
