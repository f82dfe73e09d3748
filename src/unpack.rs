//! Image unpacker.
//!
//! Linear, no backtracking once the table is found:
//!
//! 1. Decode the outer [`ContainerHeader`] at offset 0 (bad signature: fatal).
//! 2. If flag 0x40 is set, checksum the body.  A mismatch is a warning unless
//!    [`UnpackOptions::strict`] is set.
//! 3. Locate the memory map table (not found: fatal).
//! 4. Decode `entry_count` table entries.
//! 5. Anchor the catalog on the ROM `BootExt` entry (missing: fatal).
//! 6. Extract every entry.  Per-object problems never abort the run; they
//!    degrade that one object and are recorded in the [`UnpackReport`].
//! 7. Write the [`Sidecar`] next to the extracted payloads.

use log::{info, warn};
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::catalog::{CatalogError, Framing, ObjectCatalog, Placement, Sidecar, SidecarEntry};
use crate::checksum::checksum;
use crate::codec::{get_codec, sniff, CompressionTag};
use crate::header::{ContainerHeader, HeaderError, HEADER_SIZE};
use crate::locator::{locate, Geometry, Location};
use crate::table::{ObjectRole, TableEntry};

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UnpackOptions {
    pub geometry:     Geometry,
    /// Treat an outer checksum mismatch as fatal.
    pub strict:       bool,
    /// Write decompressed payloads instead of the raw compressed stream.
    pub decompress:   bool,
    /// Decode and report, but write nothing.
    pub dry_run:      bool,
    /// Entries expected to start with a nested container header, in addition
    /// to every `ROMBIN` entry.
    pub framed_names: Vec<String>,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            geometry:     Geometry::default(),
            strict:       false,
            decompress:   false,
            dry_run:      false,
            framed_names: vec!["HTPCode".to_owned(), "RasCode".to_owned()],
        }
    }
}

// ── Errors and outcomes ──────────────────────────────────────────────────────

/// Conditions that abort the whole unpack.
#[derive(Error, Debug)]
pub enum UnpackError {
    #[error("Outer header: {0}")]
    Header(#[from] HeaderError),
    #[error("Memory map table for address {map_table_address:08X} not found")]
    TableNotFound { map_table_address: u32 },
    #[error("{0}")]
    Anchor(#[from] CatalogError),
    #[error("Image checksum mismatch: header says {expected:04X}, body sums to {actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Why an object was copied raw instead of decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// No usable nested header; the catalog length was used instead.
    MalformedNestedHeader(String),
    /// Compressed, but with a codec the sniffer does not recognise.
    UnknownCompression,
    /// Recognised codec, but the stream did not decode.
    DecompressionFailed(String),
    /// The declared extent runs past end of file.
    Truncated { declared: u64, available: u64 },
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::MalformedNestedHeader(why) => write!(f, "no nested header ({why})"),
            FallbackReason::UnknownCompression         => write!(f, "unknown compression"),
            FallbackReason::DecompressionFailed(why)   => write!(f, "decompression failed ({why})"),
            FallbackReason::Truncated { declared, available } =>
                write!(f, "truncated ({available} of {declared} bytes present)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectOutcome {
    Extracted {
        offset:       usize,
        file:         String,
        bytes:        usize,
        codec:        CompressionTag,
        decompressed: bool,
        /// Nested header checksums against the payload; `None` when the
        /// object has no nested header or it records no checksum.
        checksum_ok:  Option<bool>,
    },
    RawFallback {
        offset: usize,
        file:   String,
        bytes:  usize,
        reason: FallbackReason,
    },
    /// RAM-resident object.
    NoFileData,
    /// ROM object whose offset falls outside this file.
    NotPresent { offset: i64 },
}

impl ObjectOutcome {
    pub fn file(&self) -> Option<&str> {
        match self {
            ObjectOutcome::Extracted { file, .. } | ObjectOutcome::RawFallback { file, .. } => Some(file),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectOutcome::Extracted { offset, file, bytes, codec, decompressed, checksum_ok } => {
                write!(f, "extracted {bytes} bytes at {offset:#x} -> {file}")?;
                match (codec, decompressed) {
                    (CompressionTag::None, _) => {}
                    (c, true)                 => write!(f, " ({} decompressed)", c.name())?,
                    (c, false)                => write!(f, " ({})", c.name())?,
                }
                if *checksum_ok == Some(false) {
                    write!(f, ", checksum MISMATCH")?;
                }
                Ok(())
            }
            ObjectOutcome::RawFallback { offset, file, bytes, reason } =>
                write!(f, "raw fallback {bytes} bytes at {offset:#x} -> {file}: {reason}"),
            ObjectOutcome::NoFileData           => write!(f, "RAM object, no file data"),
            ObjectOutcome::NotPresent { offset } => write!(f, "no data present (offset {offset:#x})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectReport {
    pub entry:   TableEntry,
    pub outcome: ObjectOutcome,
}

/// Everything an unpack run found and did.
#[derive(Debug, Clone)]
pub struct UnpackReport {
    pub header:      ContainerHeader,
    /// `None` when the header does not carry a valid original checksum.
    pub checksum_ok: Option<bool>,
    pub table:       Location,
    pub image_base:  u32,
    pub objects:     Vec<ObjectReport>,
    pub sidecar:     Sidecar,
}

impl UnpackReport {
    pub fn extracted(&self) -> usize {
        self.objects.iter().filter(|o| matches!(o.outcome, ObjectOutcome::Extracted { .. })).count()
    }

    pub fn fallbacks(&self) -> usize {
        self.objects.iter().filter(|o| matches!(o.outcome, ObjectOutcome::RawFallback { .. })).count()
    }

    /// Extracted objects whose nested checksums did not match.
    pub fn checksum_mismatches(&self) -> usize {
        self.objects
            .iter()
            .filter(|o| matches!(o.outcome, ObjectOutcome::Extracted { checksum_ok: Some(false), .. }))
            .count()
    }

    pub fn object(&self, name: &str) -> Option<&ObjectReport> {
        self.objects.iter().find(|o| o.entry.name == name && !o.entry.is_ram())
    }

    pub fn summary(&self) -> String {
        let mut line = format!(
            "table at {:#x}, image base {:08X}: {} object(s), {} extracted, {} raw fallback",
            self.table.offset, self.image_base, self.objects.len(), self.extracted(), self.fallbacks(),
        );
        match self.checksum_mismatches() {
            0 => {}
            n => line.push_str(&format!(", {n} checksum mismatch")),
        }
        line
    }
}

// ── Decoding (steps 1-5) ─────────────────────────────────────────────────────

/// An image with its header checked, table located and catalog anchored.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub header:      ContainerHeader,
    pub checksum_ok: Option<bool>,
    pub table:       Location,
    pub catalog:     ObjectCatalog,
    pub user_region: Vec<u8>,
}

impl DecodedImage {
    pub fn image_base(&self) -> u32 {
        // `decode_image` only returns anchored catalogs.
        self.catalog.image_base().unwrap_or_default()
    }
}

pub fn decode_image(image: &[u8], opts: &UnpackOptions) -> Result<DecodedImage, UnpackError> {
    let header = ContainerHeader::decode(image)?;

    let checksum_ok = if header.has_original_checksum() {
        let end    = (HEADER_SIZE + header.original_length as usize).min(image.len());
        let actual = checksum(&image[HEADER_SIZE..end]);
        let ok     = actual == header.original_checksum;
        if !ok {
            if opts.strict {
                return Err(UnpackError::ChecksumMismatch { expected: header.original_checksum, actual });
            }
            warn!("image checksum mismatch: header {:04X}, computed {:04X}", header.original_checksum, actual);
        }
        Some(ok)
    } else {
        None
    };

    let table = locate(image, header.map_table_address, &opts.geometry)
        .ok_or(UnpackError::TableNotFound { map_table_address: header.map_table_address })?;

    let catalog = ObjectCatalog::anchored(table.entries(image))?;
    info!("image base {:08X}", catalog.image_base().unwrap_or_default());

    let user_region = table.user_region(image).to_vec();
    Ok(DecodedImage { header, checksum_ok, table, catalog, user_region })
}

// ── Extraction (step 6) ──────────────────────────────────────────────────────

/// `None` when the nested header does not flag `expected` as valid.
fn verify(recorded: bool, expected: u16, data: &[u8]) -> Option<bool> {
    recorded.then(|| checksum(data) == expected)
}

/// One object's payload, ready to be written.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub data:    Vec<u8>,
    pub framing: Option<Framing>,
    pub outcome: ObjectOutcome,
}

pub struct ImageUnpacker<'a> {
    image:      &'a [u8],
    opts:       &'a UnpackOptions,
    decoded:    DecodedImage,
    used_names: HashSet<String>,
}

impl<'a> ImageUnpacker<'a> {
    pub fn new(image: &'a [u8], opts: &'a UnpackOptions) -> Result<Self, UnpackError> {
        let decoded = decode_image(image, opts)?;
        Ok(Self { image, opts, decoded, used_names: HashSet::new() })
    }

    pub fn decoded(&self) -> &DecodedImage {
        &self.decoded
    }

    fn is_framed(&self, entry: &TableEntry) -> bool {
        entry.role() == ObjectRole::RomBin || self.opts.framed_names.iter().any(|n| entry.name == n.as_str())
    }

    /// A unique, filesystem-safe file name for `entry`.
    fn file_name(&mut self, entry: &TableEntry, extension: Option<&str>) -> String {
        let mut stem: String = entry.name
            .to_string_lossy()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        if stem.is_empty() || stem.starts_with('.') {
            stem = format!("obj_{:08x}", entry.address);
        }
        let mut name = match extension {
            Some(ext) => format!("{stem}.{ext}"),
            None      => stem.clone(),
        };
        if self.used_names.contains(&name) {
            name = match extension {
                Some(ext) => format!("{stem}_{:08x}.{ext}", entry.address),
                None      => format!("{stem}_{:08x}", entry.address),
            };
        }
        self.used_names.insert(name.clone());
        name
    }

    /// Extract one entry.  Never fails: problems degrade the outcome.
    pub fn extract(&mut self, entry: &TableEntry) -> Extraction {
        match self.decoded.catalog.placement(entry, self.image.len()) {
            Placement::Ram => Extraction { data: Vec::new(), framing: None, outcome: ObjectOutcome::NoFileData },
            Placement::OutOfBounds { offset } => {
                info!("{}: no data present in this file (offset {offset:#x})", entry.name);
                Extraction { data: Vec::new(), framing: None, outcome: ObjectOutcome::NotPresent { offset } }
            }
            Placement::InFile { offset } => {
                if !self.is_framed(entry) {
                    return self.extract_raw(entry, offset, None);
                }
                match self.extract_framed(entry, offset) {
                    Ok(extraction) => extraction,
                    Err(reason) => {
                        warn!("{}: {reason}; copying {} bytes raw", entry.name, entry.length);
                        self.extract_raw(entry, offset, Some(reason))
                    }
                }
            }
        }
    }

    fn extract_raw(&mut self, entry: &TableEntry, offset: usize, reason: Option<FallbackReason>) -> Extraction {
        let declared  = u64::from(entry.length);
        let available = (self.image.len() - offset) as u64;
        let end       = offset + declared.min(available) as usize;
        let data      = self.image[offset..end].to_vec();
        let file      = self.file_name(entry, None);
        let bytes     = data.len();

        let reason = match reason {
            Some(r) => Some(r),
            None if declared > available => {
                warn!("{}: declared {declared} bytes, only {available} in file", entry.name);
                Some(FallbackReason::Truncated { declared, available })
            }
            None => None,
        };
        let outcome = match reason {
            Some(reason) => ObjectOutcome::RawFallback { offset, file, bytes, reason },
            None => ObjectOutcome::Extracted {
                offset, file, bytes, codec: CompressionTag::None, decompressed: false, checksum_ok: None,
            },
        };
        Extraction { data, framing: None, outcome }
    }

    fn extract_framed(&mut self, entry: &TableEntry, offset: usize) -> Result<Extraction, FallbackReason> {
        let image = self.image;
        let header = ContainerHeader::decode(&image[offset..])
            .map_err(|e| FallbackReason::MalformedNestedHeader(e.to_string()))?;
        let start = offset + HEADER_SIZE;

        if !header.is_compressed() {
            let end = start + header.original_length as usize;
            let payload = image.get(start..end).ok_or_else(|| {
                FallbackReason::MalformedNestedHeader("payload runs past end of file".into())
            })?;
            let checksum_ok = verify(header.has_original_checksum(), header.original_checksum, payload);
            if checksum_ok == Some(false) {
                warn!("{}: payload checksum mismatch", entry.name);
            }
            let data = payload.to_vec();
            let file = self.file_name(entry, None);
            let outcome = ObjectOutcome::Extracted {
                offset, file, bytes: data.len(), codec: CompressionTag::None, decompressed: false, checksum_ok,
            };
            let framing = Framing { header, codec: CompressionTag::None, decompressed: false };
            return Ok(Extraction { data, framing: Some(framing), outcome });
        }

        let end = start + header.compressed_length as usize;
        let stored = image.get(start..end).ok_or_else(|| {
            FallbackReason::MalformedNestedHeader("compressed payload runs past end of file".into())
        })?;
        let stored_ok = verify(header.has_compressed_checksum(), header.compressed_checksum, stored);
        if stored_ok == Some(false) {
            warn!("{}: compressed payload checksum mismatch", entry.name);
        }

        let sniffed = sniff(stored);
        if sniffed.tag == CompressionTag::Unknown {
            warn!("{}: unrecognised compression, keeping payload opaque", entry.name);
            let file = self.file_name(entry, sniffed.tag.extension());
            let outcome = ObjectOutcome::RawFallback {
                offset, file, bytes: stored.len(), reason: FallbackReason::UnknownCompression,
            };
            let framing = Framing { header, codec: sniffed.tag, decompressed: false };
            return Ok(Extraction { data: stored.to_vec(), framing: Some(framing), outcome });
        }

        let stream = &stored[sniffed.prefix..];
        if self.opts.decompress {
            let decoded = get_codec(sniffed.tag).and_then(|codec| codec.decompress(stream));
            match decoded {
                Ok(data) => {
                    let original_ok = verify(header.has_original_checksum(), header.original_checksum, &data);
                    if original_ok == Some(false) {
                        warn!("{}: decompressed payload checksum mismatch", entry.name);
                    }
                    let checksum_ok = match (stored_ok, original_ok) {
                        (Some(a), Some(b)) => Some(a && b),
                        (a, b)             => a.or(b),
                    };
                    let file = self.file_name(entry, None);
                    let outcome = ObjectOutcome::Extracted {
                        offset, file, bytes: data.len(), codec: sniffed.tag, decompressed: true, checksum_ok,
                    };
                    let framing = Framing { header, codec: sniffed.tag, decompressed: true };
                    return Ok(Extraction { data, framing: Some(framing), outcome });
                }
                Err(e) => {
                    warn!("{}: {e}; keeping the compressed stream", entry.name);
                    let file = self.file_name(entry, sniffed.tag.extension());
                    let outcome = ObjectOutcome::RawFallback {
                        offset, file, bytes: stream.len(),
                        reason: FallbackReason::DecompressionFailed(e.to_string()),
                    };
                    let framing = Framing { header, codec: sniffed.tag, decompressed: false };
                    return Ok(Extraction { data: stream.to_vec(), framing: Some(framing), outcome });
                }
            }
        }

        let file = self.file_name(entry, sniffed.tag.extension());
        let outcome = ObjectOutcome::Extracted {
            offset, file, bytes: stream.len(), codec: sniffed.tag, decompressed: false, checksum_ok: stored_ok,
        };
        let framing = Framing { header, codec: sniffed.tag, decompressed: false };
        Ok(Extraction { data: stream.to_vec(), framing: Some(framing), outcome })
    }

    /// Extract every entry, handing each payload to `sink` as it is produced.
    pub fn run<F>(mut self, mut sink: F) -> io::Result<UnpackReport>
    where
        F: FnMut(&str, &[u8]) -> io::Result<()>,
    {
        let entries = self.decoded.catalog.entries.clone();
        let mut objects = Vec::with_capacity(entries.len());
        let mut sidecar_entries = Vec::with_capacity(entries.len());

        for entry in entries {
            let extraction = self.extract(&entry);
            if let Some(file) = extraction.outcome.file() {
                sink(file, &extraction.data)?;
            }
            sidecar_entries.push(SidecarEntry {
                entry:   entry.clone(),
                file:    extraction.outcome.file().map(str::to_owned),
                framing: extraction.framing,
            });
            objects.push(ObjectReport { entry, outcome: extraction.outcome });
        }

        let image_base = self.decoded.image_base();
        let sidecar = Sidecar {
            container:    self.decoded.header.clone(),
            image_base,
            table_offset: self.decoded.table.offset,
            user_region:  self.decoded.user_region.clone(),
            entries:      sidecar_entries,
        };

        Ok(UnpackReport {
            header:      self.decoded.header,
            checksum_ok: self.decoded.checksum_ok,
            table:       self.decoded.table,
            image_base,
            objects,
            sidecar,
        })
    }
}

// ── Convenience ──────────────────────────────────────────────────────────────

/// Unpack an in-memory image without writing anything.
pub fn unpack_bytes(image: &[u8], opts: &UnpackOptions) -> Result<UnpackReport, UnpackError> {
    Ok(ImageUnpacker::new(image, opts)?.run(|_, _| Ok(()))?)
}

/// Unpack the image at `path` into `out_dir`: one file per ROM object plus
/// the sidecar.  With `dry_run` nothing is written.
pub fn unpack_file(path: &Path, out_dir: &Path, opts: &UnpackOptions) -> Result<UnpackReport, UnpackError> {
    let image = std::fs::read(path)?;
    let unpacker = ImageUnpacker::new(&image, opts)?;

    if opts.dry_run {
        return Ok(unpacker.run(|_, _| Ok(()))?);
    }

    std::fs::create_dir_all(out_dir)?;
    let report = unpacker.run(|name, data| std::fs::write(out_dir.join(name), data))?;
    report.sidecar.write_to(out_dir)?;
    Ok(report)
}
