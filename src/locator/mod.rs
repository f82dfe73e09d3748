//! Memory map table locator.
//!
//! # How it works
//!
//! The outer header records the table's *virtual* address but not where the
//! table sits in the file.  The locator tries every stride position from
//! `scan_start` (0x100, 0x200, ...) and asks of each one independently:
//!
//! 1. Decode 24 bytes as a [`TableHeader`].
//! 2. Does `user_region_start - (entry_count + 1) * 24` equal the recorded
//!    map table address?
//! 3. Is `user_region_end - map_table_address - 24` a non-negative body
//!    length that fits in the file?
//! 4. Does the checksum of that body match the header's checksum?
//!
//! Steps 1-3 alone produce false positives at plausible offsets; only a
//! checksum match accepts a candidate.  The lowest accepted offset wins.
//!
//! With the `parallel` feature, candidates are evaluated on the rayon pool.
//! `find_map_first` keeps the lowest-offset result, so the outcome is the
//! same as the sequential scan.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::checksum::checksum;
use crate::table::{decode_entries, TableEntry, TableHeader, ENTRY_SIZE, TABLE_HEADER_SIZE};

// ── Geometry ─────────────────────────────────────────────────────────────────

/// Stride-scan geometry.  Device-family constants, never inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// First candidate offset.
    pub scan_start:  u64,
    /// Distance between candidates; also the tail margin the scan stops at.
    pub scan_stride: u64,
}

impl Default for Geometry {
    fn default() -> Self {
        Self { scan_start: 0x100, scan_stride: 0x100 }
    }
}

impl Geometry {
    /// Candidate offsets for a file of `file_size` bytes, in scan order.
    pub fn candidates(&self, file_size: u64) -> impl Iterator<Item = u64> {
        let start  = self.scan_start;
        let stride = self.scan_stride.max(1);
        let limit  = file_size.saturating_sub(stride);
        (0u64..)
            .map(move |i| start + i * stride)
            .take_while(move |&off| off < limit)
    }

    pub fn is_candidate(&self, offset: u64) -> bool {
        offset >= self.scan_start && (offset - self.scan_start) % self.scan_stride.max(1) == 0
    }
}

// ── Types ────────────────────────────────────────────────────────────────────

/// Verdict for one candidate offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateVerdict {
    /// Address arithmetic and checksum both hold.
    Accepted { header: TableHeader, body_length: usize },
    /// The header implies a different table address.
    AddressMismatch { implied: i64 },
    /// Body length negative or running past end of file.
    BadBodyLength { body_length: i64 },
    /// Looks right, but the body does not checksum.
    ChecksumMismatch { stored: u16, computed: u16 },
    /// Not even a full header fits here.
    Truncated,
}

impl CandidateVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CandidateVerdict::Accepted { .. })
    }
}

/// A located table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// File offset of the table header.
    pub offset:      u64,
    pub header:      TableHeader,
    /// Bytes covered by the table checksum (entries + user region).
    pub body_length: usize,
}

impl Location {
    fn body_start(&self) -> usize {
        self.offset as usize + TABLE_HEADER_SIZE
    }

    /// The checksummed body.  `image` must be the image this was located in.
    pub fn body<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        let start = self.body_start();
        &image[start..start + self.body_length]
    }

    /// Decode `entry_count` entries directly after the table header.
    pub fn entries(&self, image: &[u8]) -> Vec<TableEntry> {
        decode_entries(&image[self.body_start()..], self.header.entry_count as usize)
    }

    /// Opaque bytes between the last entry and the end of the body.
    pub fn user_region<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        let entries_len = self.header.entry_count as usize * ENTRY_SIZE;
        let body = self.body(image);
        &body[entries_len.min(body.len())..]
    }
}

// ── Scanner ──────────────────────────────────────────────────────────────────

/// Judge a single candidate offset.  Pure; independent of every other offset.
pub fn evaluate(image: &[u8], offset: u64, map_table_address: u32) -> CandidateVerdict {
    let start = offset as usize;
    let Some(raw) = image.get(start..start + TABLE_HEADER_SIZE) else {
        return CandidateVerdict::Truncated;
    };
    let mut buf = [0u8; TABLE_HEADER_SIZE];
    buf.copy_from_slice(raw);
    let header = TableHeader::decode(&buf);

    let implied = header.implied_table_address();
    if implied != i64::from(map_table_address) {
        return CandidateVerdict::AddressMismatch { implied };
    }

    let body_length = header.body_length(map_table_address);
    let body_start  = start + TABLE_HEADER_SIZE;
    if body_length < 0 || body_start as i64 + body_length > image.len() as i64 {
        return CandidateVerdict::BadBodyLength { body_length };
    }
    let body_length = body_length as usize;

    let computed = checksum(&image[body_start..body_start + body_length]);
    if computed != header.checksum {
        return CandidateVerdict::ChecksumMismatch { stored: header.checksum, computed };
    }

    CandidateVerdict::Accepted { header, body_length }
}

fn accept(image: &[u8], offset: u64, map_table_address: u32) -> Option<Location> {
    match evaluate(image, offset, map_table_address) {
        CandidateVerdict::Accepted { header, body_length } => Some(Location { offset, header, body_length }),
        CandidateVerdict::AddressMismatch { .. } => None,
        other => {
            debug!("table candidate at {offset:#x} rejected: {other:?}");
            None
        }
    }
}

/// Find the memory map table for `map_table_address` in `image`.
///
/// Returns the lowest stride position whose header passes both the address
/// arithmetic and the checksum, or `None` once the scan runs off the file.
pub fn locate(image: &[u8], map_table_address: u32, geometry: &Geometry) -> Option<Location> {
    let found = scan(image, map_table_address, geometry);
    if let Some(loc) = &found {
        info!("memory map table found at offset {:#x}: {}", loc.offset, loc.header);
    }
    found
}

#[cfg(not(feature = "parallel"))]
fn scan(image: &[u8], map_table_address: u32, geometry: &Geometry) -> Option<Location> {
    geometry
        .candidates(image.len() as u64)
        .find_map(|offset| accept(image, offset, map_table_address))
}

#[cfg(feature = "parallel")]
fn scan(image: &[u8], map_table_address: u32, geometry: &Geometry) -> Option<Location> {
    use rayon::prelude::*;

    let offsets: Vec<u64> = geometry.candidates(image.len() as u64).collect();
    offsets
        .par_iter()
        .find_map_first(|&offset| accept(image, offset, map_table_address))
}

/// Every candidate with its verdict, for diagnostics.
pub fn survey(image: &[u8], map_table_address: u32, geometry: &Geometry) -> Vec<(u64, CandidateVerdict)> {
    geometry
        .candidates(image.len() as u64)
        .map(|offset| (offset, evaluate(image, offset, map_table_address)))
        .collect()
}
