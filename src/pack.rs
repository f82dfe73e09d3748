//! Image packer: the inverse of [`crate::unpack`].
//!
//! Given a [`Sidecar`] and its payload files the packer
//!
//! 1. finds the memory map entry and both `BootExt` entries,
//! 2. encodes the table body (RAM entries, then ROM entries, then the opaque
//!    user region) and its header,
//! 3. writes every ROM payload at `address - image_base`, re-framing objects
//!    the unpacker stripped a nested header from,
//! 4. writes the table over the memory map entry's position,
//! 5. prepends an outer header whose checksum covers the whole body.
//!
//! Missing payloads leave a gap and are reported; only a catalog that cannot
//! be laid out at all is an error.

use log::{info, warn};
use std::fmt;
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::catalog::{anchor, CatalogError, Sidecar, SidecarEntry};
use crate::checksum::checksum;
use crate::header::{ContainerHeader, FLAG_ORIGINAL_CHECKSUM, HEADER_SIZE};
use crate::locator::Geometry;
use crate::table::{TableEntry, TableHeader, ENTRY_SIZE, TABLE_HEADER_SIZE};
use crate::wrap::reframe;

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Scan geometry the result will be unpacked with.
    pub geometry: Geometry,
    /// Byte used for space no object covers.
    pub fill:     u8,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self { geometry: Geometry::default(), fill: 0xFF }
    }
}

// ── Errors and outcomes ──────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum PackError {
    #[error("No memory map table entry (ROMMAP / \"MemMapT\") in catalog")]
    TableEntryMissing,
    #[error("No ROM \"BootExt\" entry in catalog")]
    RomAnchorMissing,
    #[error("No RAM \"BootExt\" entry in catalog")]
    RamAnchorMissing,
    #[error("Memory map table would land at file offset {offset:#x}, inside the outer header")]
    TableMisplaced { offset: i64 },
    #[error("Image of {length} bytes does not fit a 32-bit length field")]
    ImageTooLarge { length: usize },
    #[error("{0}")]
    Catalog(#[from] CatalogError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Why a ROM object has no bytes in the packed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OmitReason {
    /// The sidecar names no payload file (nothing was extracted).
    NoPayload,
    MissingFile(String),
    /// Would start before the end of the outer header.
    OutOfRange { offset: i64 },
    Reframe(String),
}

impl fmt::Display for OmitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OmitReason::NoPayload            => write!(f, "no payload recorded"),
            OmitReason::MissingFile(file)    => write!(f, "payload file {file} missing"),
            OmitReason::OutOfRange { offset } => write!(f, "offset {offset:#x} overlaps the outer header"),
            OmitReason::Reframe(why)         => write!(f, "cannot re-frame ({why})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackOutcome {
    Placed { offset: usize, bytes: usize, reframed: bool },
    /// The memory map entry: the rebuilt table was written here.
    Table { offset: usize, bytes: usize },
    NoFileData,
    Omitted { reason: OmitReason },
}

impl fmt::Display for PackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackOutcome::Placed { offset, bytes, reframed: false } =>
                write!(f, "placed {bytes} bytes at {offset:#x}"),
            PackOutcome::Placed { offset, bytes, reframed: true } =>
                write!(f, "placed {bytes} bytes at {offset:#x} (re-framed)"),
            PackOutcome::Table { offset, bytes } => write!(f, "table, {bytes} bytes at {offset:#x}"),
            PackOutcome::NoFileData              => write!(f, "RAM object, no file data"),
            PackOutcome::Omitted { reason }      => write!(f, "omitted: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackReport {
    pub header:       ContainerHeader,
    pub image_base:   u32,
    pub table_offset: usize,
    pub table:        TableHeader,
    pub objects:      Vec<(TableEntry, PackOutcome)>,
}

impl PackReport {
    pub fn omitted(&self) -> usize {
        self.objects.iter().filter(|(_, o)| matches!(o, PackOutcome::Omitted { .. })).count()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} bytes, table at {:#x}, image base {:08X}: {} object(s), {} omitted",
            HEADER_SIZE + self.header.original_length as usize,
            self.table_offset, self.image_base, self.objects.len(), self.omitted(),
        )
    }
}

// ── Table body ───────────────────────────────────────────────────────────────

/// Encode the table for a map at `map_table_address`: header plus body.
pub fn encode_table(entries: &[&TableEntry], user_region: &[u8], map_table_address: u32) -> (TableHeader, Vec<u8>) {
    let mut body = Vec::with_capacity(entries.len() * ENTRY_SIZE + user_region.len());
    for entry in entries {
        body.extend_from_slice(&entry.encode());
    }
    body.extend_from_slice(user_region);

    let count = entries.len() as u16;
    let header = TableHeader {
        entry_count:       count,
        user_region_start: map_table_address.wrapping_add((u32::from(count) + 1) * ENTRY_SIZE as u32),
        user_region_end:   map_table_address.wrapping_add((TABLE_HEADER_SIZE + body.len()) as u32),
        checksum:          checksum(&body),
    };

    let mut table = Vec::with_capacity(TABLE_HEADER_SIZE + body.len());
    table.extend_from_slice(&header.encode());
    table.extend_from_slice(&body);
    (header, table)
}

// ── ImagePacker ──────────────────────────────────────────────────────────────

pub struct ImagePacker<'a> {
    sidecar: &'a Sidecar,
    opts:    &'a PackOptions,
    image:   Vec<u8>,
}

impl<'a> ImagePacker<'a> {
    pub fn new(sidecar: &'a Sidecar, opts: &'a PackOptions) -> Self {
        Self { sidecar, opts, image: vec![opts.fill; HEADER_SIZE] }
    }

    fn put(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset + bytes.len();
        if self.image.len() < end {
            self.image.resize(end, self.opts.fill);
        }
        self.image[offset..end].copy_from_slice(bytes);
    }

    /// Assemble the image.  `load` returns a payload file's bytes, or `None`
    /// if the file does not exist.
    pub fn build<F>(mut self, mut load: F) -> Result<(Vec<u8>, PackReport), PackError>
    where
        F: FnMut(&str) -> io::Result<Option<Vec<u8>>>,
    {
        let catalog = self.sidecar.catalog();
        let map_entry = catalog.memory_map().ok_or(PackError::TableEntryMissing)?.clone();
        let ram_anchor = catalog.ram_anchor().ok_or(PackError::RamAnchorMissing)?.clone();
        let image_base = anchor(&catalog.entries).map_err(|e| match e {
            CatalogError::AnchorMissing => PackError::RomAnchorMissing,
            other                       => PackError::Catalog(other),
        })?;

        let map_table_address = map_entry.address;
        if map_table_address != self.sidecar.container.map_table_address {
            warn!(
                "outer header recorded map table {:08X}, catalog places it at {:08X}",
                self.sidecar.container.map_table_address, map_table_address,
            );
        }

        let table_offset = i64::from(map_table_address) - i64::from(image_base);
        if table_offset < HEADER_SIZE as i64 {
            return Err(PackError::TableMisplaced { offset: table_offset });
        }
        let table_offset = table_offset as usize;
        if !self.opts.geometry.is_candidate(table_offset as u64) {
            warn!("table offset {table_offset:#x} is not on the scan stride; the image will not unpack");
        }

        let (ram, rom) = catalog.partition();
        let ordered: Vec<&TableEntry> = ram.into_iter().chain(rom).collect();
        let (table_header, table) = encode_table(&ordered, &self.sidecar.user_region, map_table_address);
        if table.len() > map_entry.length as usize {
            warn!("table is {} bytes, catalog reserves {}", table.len(), map_entry.length);
        }

        let sidecar = self.sidecar;
        let mut objects = Vec::with_capacity(sidecar.entries.len());
        for item in &sidecar.entries {
            let entry = &item.entry;
            let outcome = if entry.is_ram() {
                PackOutcome::NoFileData
            } else if *entry == map_entry {
                // Any payload goes down first; the rebuilt table is laid over it.
                self.place(item, image_base, &mut load)?;
                PackOutcome::Table { offset: table_offset, bytes: table.len() }
            } else {
                self.place(item, image_base, &mut load)?
            };
            if let PackOutcome::Omitted { reason } = &outcome {
                warn!("{}: {reason}", entry.name);
            }
            objects.push((entry.clone(), outcome));
        }

        self.put(table_offset, &table);
        info!("table written at {table_offset:#x}: {table_header}");

        let body = &self.image[HEADER_SIZE..];
        let header = ContainerHeader {
            load_address:        ram_anchor.address,
            original_length:     u32::try_from(body.len())
                .map_err(|_| PackError::ImageTooLarge { length: self.image.len() })?,
            original_checksum:   checksum(body),
            compressed_length:   0,
            compressed_checksum: 0,
            flags:               FLAG_ORIGINAL_CHECKSUM,
            map_table_address,
            ..sidecar.container.clone()
        };
        self.image[..HEADER_SIZE].copy_from_slice(&header.encode());

        let report = PackReport { header, image_base, table_offset, table: table_header, objects };
        Ok((self.image, report))
    }

    fn place<F>(&mut self, item: &SidecarEntry, image_base: u32, load: &mut F) -> Result<PackOutcome, PackError>
    where
        F: FnMut(&str) -> io::Result<Option<Vec<u8>>>,
    {
        let Some(file) = item.file.as_deref() else {
            return Ok(PackOutcome::Omitted { reason: OmitReason::NoPayload });
        };
        let offset = i64::from(item.entry.address) - i64::from(image_base);
        if offset < HEADER_SIZE as i64 {
            return Ok(PackOutcome::Omitted { reason: OmitReason::OutOfRange { offset } });
        }
        let Some(payload) = load(file)? else {
            return Ok(PackOutcome::Omitted { reason: OmitReason::MissingFile(file.to_owned()) });
        };

        let (bytes, reframed) = match &item.framing {
            Some(framing) => match reframe(framing, &payload) {
                Ok(framed) => (framed, true),
                Err(e) => return Ok(PackOutcome::Omitted { reason: OmitReason::Reframe(e.to_string()) }),
            },
            None => (payload, false),
        };

        let offset = offset as usize;
        self.put(offset, &bytes);
        Ok(PackOutcome::Placed { offset, bytes: bytes.len(), reframed })
    }
}

// ── Convenience ──────────────────────────────────────────────────────────────

/// Read the sidecar and payloads from `dir` and assemble the image in memory.
pub fn pack_dir(dir: &Path, opts: &PackOptions) -> Result<(Vec<u8>, PackReport), PackError> {
    let sidecar = Sidecar::read_from(dir)?;
    ImagePacker::new(&sidecar, opts).build(|name| match std::fs::read(dir.join(name)) {
        Ok(bytes)                                       => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e)                                          => Err(e),
    })
}

/// Pack `dir` into the image file `output`.
pub fn pack_file(dir: &Path, output: &Path, opts: &PackOptions) -> Result<PackReport, PackError> {
    let (image, report) = pack_dir(dir, opts)?;
    std::fs::write(output, image)?;
    Ok(report)
}
