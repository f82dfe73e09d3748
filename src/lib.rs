//! Codec for ZyNOS ROMIO firmware containers.
//!
//! ```no_run
//! use romio::unpack::{unpack_file, UnpackOptions};
//! use romio::pack::{pack_file, PackOptions};
//! use std::path::Path;
//!
//! let report = unpack_file(Path::new("ras.bin"), Path::new("ras"), &UnpackOptions::default())?;
//! println!("{}", report.summary());
//!
//! pack_file(Path::new("ras"), Path::new("ras-new.bin"), &PackOptions::default())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod checksum;
pub mod header;
pub mod table;
pub mod codec;
pub mod locator;
pub mod catalog;
pub mod unpack;
pub mod pack;
pub mod wrap;

mod text_field;

pub use checksum::{checksum, Checksum};
pub use header::{ContainerHeader, HeaderError};
pub use table::{EntryName, TableEntry, TableHeader, ObjectRole};
pub use codec::{CompressionTag, sniff, get_codec};
pub use locator::{locate, Geometry, Location};
pub use catalog::{ObjectCatalog, Sidecar};
pub use unpack::{ImageUnpacker, UnpackOptions, UnpackReport, UnpackError};
pub use pack::{ImagePacker, PackOptions, PackReport, PackError};
pub use wrap::{wrap, WrapOptions, WrapError};
