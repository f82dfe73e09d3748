use clap::{Args, Parser, Subcommand};
use romio::codec::CompressionTag;
use romio::locator::{survey, CandidateVerdict, Geometry};
use romio::pack::{pack_file, PackOptions};
use romio::unpack::{decode_image, unpack_file, UnpackOptions};
use romio::wrap::{wrap, WrapOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "romio", version, about = "ZyNOS ROMIO firmware image tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Table scan geometry (device-family constants).
#[derive(Args)]
struct ScanArgs {
    /// First file offset scanned for the memory map table
    #[arg(long, default_value = "0x100", value_parser = parse_u32)]
    scan_start: u32,
    /// Distance between scanned offsets
    #[arg(long, default_value = "0x100", value_parser = parse_u32)]
    scan_stride: u32,
}

impl ScanArgs {
    fn geometry(&self) -> Geometry {
        Geometry { scan_start: u64::from(self.scan_start), scan_stride: u64::from(self.scan_stride) }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Extract every object of an image plus its memmap.json
    Unpack {
        input: PathBuf,
        /// Output directory
        #[arg(short, long, default_value = ".")]
        prefix: PathBuf,
        /// Report only; write nothing
        #[arg(short = 'n', long)]
        dry_run: bool,
        /// Abort on an image checksum mismatch
        #[arg(long)]
        strict: bool,
        /// Write decompressed payloads instead of .lzma/.bz2 streams
        #[arg(short, long)]
        decompress: bool,
        /// Additional object name carrying a nested header (repeatable)
        #[arg(long = "framed", value_name = "NAME")]
        framed: Vec<String>,
        #[command(flatten)]
        scan: ScanArgs,
    },
    /// Reassemble an image from an unpacked directory
    Pack {
        /// Directory holding memmap.json and the payload files
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Filler byte for gaps between objects
        #[arg(long, default_value = "0xff", value_parser = parse_u8)]
        fill: u8,
        #[command(flatten)]
        scan: ScanArgs,
    },
    /// Frame a raw payload with a container header
    Wrap {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Codec: none (default), lzma, lzma0, bzip2
        #[arg(short, long, default_value = "none")]
        codec: String,
        #[arg(long, default_value = "0", value_parser = parse_u32)]
        load_address: u32,
        #[arg(long, default_value = "0", value_parser = parse_u8)]
        object_type: u8,
        /// Version string stored in the header
        #[arg(long = "image-version", default_value = "")]
        version: String,
        #[arg(long, default_value = "0", value_parser = parse_u32)]
        map_address: u32,
        /// Leave the checksum fields empty and unflagged
        #[arg(long)]
        no_checksums: bool,
    },
    /// Show the header, table location and object list without extracting
    Info {
        input: PathBuf,
        #[command(flatten)]
        scan: ScanArgs,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    match Cli::parse().command {

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { input, prefix, dry_run, strict, decompress, framed, scan } => {
            let mut opts = UnpackOptions {
                geometry: scan.geometry(),
                strict,
                decompress,
                dry_run,
                ..UnpackOptions::default()
            };
            opts.framed_names.extend(framed);

            let report = unpack_file(&input, &prefix, &opts)?;
            println!("Image: {}", input.display());
            println!("{}", report.header);
            match report.checksum_ok {
                Some(true)  => println!("  Checksum OK"),
                Some(false) => println!("  Checksum MISMATCH"),
                None        => {}
            }
            println!("Memory map table at {:#x}: {}", report.table.offset, report.table.header);
            for object in &report.objects {
                println!("  {}  {}", object.entry, object.outcome);
            }
            println!("{}", report.summary());
            if dry_run {
                println!("Dry run: nothing written");
            } else {
                println!("Unpacked to: {}", prefix.display());
            }
        }

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { input, output, fill, scan } => {
            let opts = PackOptions { geometry: scan.geometry(), fill };
            let report = pack_file(&input, &output, &opts)?;
            for (entry, outcome) in &report.objects {
                println!("  {}  {}", entry, outcome);
            }
            println!("{}", report.summary());
            println!("Created: {}", output.display());
        }

        // ── Wrap ─────────────────────────────────────────────────────────────
        Commands::Wrap { input, output, codec, load_address, object_type, version, map_address, no_checksums } => {
            let opts = WrapOptions {
                codec: parse_codec(&codec)?,
                load_address,
                object_type,
                version,
                map_table_address: map_address,
                checksums: !no_checksums,
            };
            let payload = std::fs::read(&input)?;
            let framed = wrap(&payload, &opts)?;
            std::fs::write(&output, &framed)?;
            println!("Wrapped {} bytes ({}) -> {} ({} bytes)",
                payload.len(), opts.codec.name(), output.display(), framed.len());
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, scan } => {
            let image = std::fs::read(&input)?;
            let opts = UnpackOptions { geometry: scan.geometry(), ..UnpackOptions::default() };

            let decoded = match decode_image(&image, &opts) {
                Ok(decoded) => decoded,
                Err(e) => {
                    // Show why each plausible candidate was turned down.
                    if let Ok(header) = romio::ContainerHeader::decode(&image) {
                        println!("{}", header);
                        for (offset, verdict) in survey(&image, header.map_table_address, &opts.geometry) {
                            if !matches!(verdict, CandidateVerdict::AddressMismatch { .. }) {
                                println!("  candidate {:#x}: {:?}", offset, verdict);
                            }
                        }
                    }
                    return Err(e.into());
                }
            };

            println!("── ROMIO image ──────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Size           {} B", image.len());
            println!("{}", decoded.header);
            match decoded.checksum_ok {
                Some(ok) => println!("  Checksum       {}", if ok { "ok" } else { "MISMATCH" }),
                None     => println!("  Checksum       not recorded"),
            }
            println!("  Table offset   {:#x}", decoded.table.offset);
            println!("  Table          {}", decoded.table.header);
            println!("  Image base     {:08X}", decoded.image_base());
            println!("  User region    {} B", decoded.user_region.len());
            for entry in &decoded.catalog.entries {
                let location = match decoded.catalog.file_offset(entry) {
                    _ if entry.is_ram()                              => "RAM".to_owned(),
                    Some(off) if off >= 0 && (off as u64) < image.len() as u64 => format!("@{off:#x}"),
                    _                                                => "not present".to_owned(),
                };
                println!("    {}  {:<8} {}", entry, entry.role().name(), location);
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None      => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let value = parse_u32(s)?;
    u8::try_from(value).map_err(|_| format!("'{s}' does not fit in a byte"))
}

fn parse_codec(s: &str) -> Result<CompressionTag, String> {
    match CompressionTag::from_name(s) {
        Some(CompressionTag::Unknown) | None => Err(format!("Unknown codec '{s}'")),
        Some(tag) => Ok(tag),
    }
}
