//! Memory map table records.
//!
//! The table is a 24-byte [`TableHeader`] followed by `entry_count` 24-byte
//! [`TableEntry`] records and an opaque "user region".  The header checksum
//! covers everything after the header up to the end of the user region.
//!
//! Neither record carries a magic number, so decoding is total: whether a
//! given 24 bytes really is the table header is decided by
//! [`crate::locator`], not here.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;

use crate::text_field;

pub const TABLE_HEADER_SIZE: usize = 24;
pub const ENTRY_SIZE: usize = 24;
pub const NAME_LEN: usize = 8;

/// Set in `kind` for objects that only exist in RAM at runtime.
pub const KIND_RAM: u8 = 0x80;

// ── TableHeader ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableHeader {
    pub entry_count:       u16,
    pub user_region_start: u32,
    /// Inclusive.
    pub user_region_end:   u32,
    pub checksum:          u16,
}

impl TableHeader {
    pub fn decode(raw: &[u8; TABLE_HEADER_SIZE]) -> Self {
        Self {
            entry_count:       BigEndian::read_u16(&raw[0..2]),
            user_region_start: BigEndian::read_u32(&raw[2..6]),
            user_region_end:   BigEndian::read_u32(&raw[6..10]),
            checksum:          BigEndian::read_u16(&raw[10..12]),
        }
    }

    pub fn encode(&self) -> [u8; TABLE_HEADER_SIZE] {
        let mut raw = [0u8; TABLE_HEADER_SIZE];
        BigEndian::write_u16(&mut raw[0..2], self.entry_count);
        BigEndian::write_u32(&mut raw[2..6], self.user_region_start);
        BigEndian::write_u32(&mut raw[6..10], self.user_region_end);
        BigEndian::write_u16(&mut raw[10..12], self.checksum);
        raw
    }

    /// Virtual address of the table implied by this header: the user region
    /// starts right after the header and its `entry_count` entries.
    pub fn implied_table_address(&self) -> i64 {
        i64::from(self.user_region_start) - (i64::from(self.entry_count) + 1) * ENTRY_SIZE as i64
    }

    /// Length of the checksummed body (entries + user region) for a table at
    /// `map_table_address`.  Negative for inconsistent headers.
    pub fn body_length(&self, map_table_address: u32) -> i64 {
        i64::from(self.user_region_end) - i64::from(map_table_address) - TABLE_HEADER_SIZE as i64
    }
}

impl fmt::Display for TableHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} entries (USER: {:08X}..{:08X})",
            self.entry_count, self.user_region_start, self.user_region_end)
    }
}

// ── ObjectRole ───────────────────────────────────────────────────────────────

/// What an entry's `kind` byte says the object is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectRole {
    RomImage,
    RomBoot,
    BootExt,
    RomBin,
    RomDir,
    RomMap,
    Ram,
    RamCode,
    RamBoot,
    Other(u8),
}

impl ObjectRole {
    pub fn from_kind(kind: u8) -> Self {
        match kind {
            0x01 => ObjectRole::RomImage,
            0x02 => ObjectRole::RomBoot,
            0x03 => ObjectRole::BootExt,
            0x04 => ObjectRole::RomBin,
            0x05 => ObjectRole::RomDir,
            0x07 => ObjectRole::RomMap,
            0x80 => ObjectRole::Ram,
            0x81 => ObjectRole::RamCode,
            0x82 => ObjectRole::RamBoot,
            k    => ObjectRole::Other(k),
        }
    }

    pub fn kind(self) -> u8 {
        match self {
            ObjectRole::RomImage => 0x01,
            ObjectRole::RomBoot  => 0x02,
            ObjectRole::BootExt  => 0x03,
            ObjectRole::RomBin   => 0x04,
            ObjectRole::RomDir   => 0x05,
            ObjectRole::RomMap   => 0x07,
            ObjectRole::Ram      => 0x80,
            ObjectRole::RamCode  => 0x81,
            ObjectRole::RamBoot  => 0x82,
            ObjectRole::Other(k) => k,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjectRole::RomImage => "ROMIMG",
            ObjectRole::RomBoot  => "ROMBOOT",
            ObjectRole::BootExt  => "BOOTEXT",
            ObjectRole::RomBin   => "ROMBIN",
            ObjectRole::RomDir   => "ROMDIR",
            ObjectRole::RomMap   => "ROMMAP",
            ObjectRole::Ram      => "RAM",
            ObjectRole::RamCode  => "RAMCODE",
            ObjectRole::RamBoot  => "RAMBOOT",
            ObjectRole::Other(_) => "?",
        }
    }
}

// ── EntryName ────────────────────────────────────────────────────────────────

/// The raw bytes of an entry name, NUL padding stripped.
///
/// Names are almost always ASCII but nothing in the format requires it, so
/// the bytes are kept as found and only rendered lossily for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EntryName(Vec<u8>);

impl EntryName {
    pub fn from_raw(raw: &[u8]) -> Self {
        Self(text_field::trim_nul(raw).to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl From<&str> for EntryName {
    fn from(name: &str) -> Self {
        Self::from_raw(name.as_bytes())
    }
}

impl PartialEq<str> for EntryName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl PartialEq<&str> for EntryName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.to_string_lossy())
    }
}

impl Serialize for EntryName {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        text_field::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for EntryName {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        text_field::deserialize(d, NAME_LEN).map(EntryName)
    }
}

// ── TableEntry ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableEntry {
    pub kind:    u8,
    pub name:    EntryName,
    pub address: u32,
    pub length:  u32,
    pub subtype: u32,
}

impl TableEntry {
    pub fn decode(raw: &[u8; ENTRY_SIZE]) -> Self {
        Self {
            kind:    raw[0],
            name:    EntryName::from_raw(&raw[1..1 + NAME_LEN]),
            address: BigEndian::read_u32(&raw[10..14]),
            length:  BigEndian::read_u32(&raw[16..20]),
            subtype: BigEndian::read_u32(&raw[20..24]),
        }
    }

    /// Names longer than eight bytes are cut to fit.
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0] = self.kind;
        let name = self.name.as_bytes();
        let n = name.len().min(NAME_LEN);
        raw[1..1 + n].copy_from_slice(&name[..n]);
        BigEndian::write_u32(&mut raw[10..14], self.address);
        BigEndian::write_u32(&mut raw[16..20], self.length);
        BigEndian::write_u32(&mut raw[20..24], self.subtype);
        raw
    }

    pub fn role(&self) -> ObjectRole {
        ObjectRole::from_kind(self.kind)
    }

    pub fn is_ram(&self) -> bool {
        self.kind & KIND_RAM != 0
    }

    /// The ROM copy of `BootExt` fixes where file offset 0 lives.
    pub fn is_rom_anchor(&self) -> bool {
        !self.is_ram()
            && matches!(self.role(), ObjectRole::BootExt | ObjectRole::RomImage)
            && self.name == "BootExt"
    }

    /// The RAM copy of `BootExt` supplies the image load address.
    pub fn is_ram_anchor(&self) -> bool {
        self.is_ram() && self.name == "BootExt"
    }

    /// The entry describing the memory map table itself.
    pub fn is_memory_map(&self) -> bool {
        !self.is_ram() && (self.role() == ObjectRole::RomMap || self.name == "MemMapT")
    }
}

impl fmt::Display for TableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X} {:08X} {:<8} ({}, {})",
            self.address, self.length, self.name, self.kind, self.subtype)
    }
}

/// Decode `count` consecutive entries from the front of `buf`.
/// Stops early if `buf` runs out.
pub fn decode_entries(buf: &[u8], count: usize) -> Vec<TableEntry> {
    buf.chunks_exact(ENTRY_SIZE)
        .take(count)
        .map(|chunk| {
            let mut raw = [0u8; ENTRY_SIZE];
            raw.copy_from_slice(chunk);
            TableEntry::decode(&raw)
        })
        .collect()
}
