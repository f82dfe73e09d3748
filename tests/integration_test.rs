use romio::catalog::{CatalogError, Framing, Sidecar, SidecarEntry, SIDECAR_NAME};
use romio::checksum::checksum;
use romio::codec::{get_codec, CompressionTag};
use romio::header::{ContainerHeader, HeaderError, FLAG_COMPRESSED, FLAG_ORIGINAL_CHECKSUM, HEADER_SIZE};
use romio::pack::{pack_dir, OmitReason, PackOptions, PackOutcome};
use romio::table::{TableEntry, TableHeader, ENTRY_SIZE, TABLE_HEADER_SIZE};
use romio::unpack::{unpack_bytes, unpack_file, FallbackReason, ObjectOutcome, UnpackError, UnpackOptions};
use romio::wrap::{wrap, WrapOptions};
use std::collections::BTreeSet;
use std::path::Path;
use tempfile::{tempdir, NamedTempFile};

const BASE: u32 = 0xBFC0_0000;

fn entry(kind: u8, name: &str, address: u32, length: u32) -> TableEntry {
    TableEntry { kind, name: name.into(), address, length, subtype: 0 }
}

/// Lay out an image by hand: outer header, table at `table_offset`, and
/// `objects` at their file offsets.  The outer checksum is filled in last.
fn build_image(
    size: usize,
    map: u32,
    table_offset: usize,
    entries: &[TableEntry],
    objects: &[(usize, &[u8])],
) -> Vec<u8> {
    let mut image = vec![0u8; size];
    for (offset, bytes) in objects {
        image[*offset..*offset + bytes.len()].copy_from_slice(bytes);
    }

    let mut body = Vec::new();
    for e in entries {
        body.extend_from_slice(&e.encode());
    }
    let count = entries.len() as u16;
    let table = TableHeader {
        entry_count:       count,
        user_region_start: map + (u32::from(count) + 1) * ENTRY_SIZE as u32,
        user_region_end:   map + TABLE_HEADER_SIZE as u32 + body.len() as u32,
        checksum:          checksum(&body),
    };
    image[table_offset..table_offset + TABLE_HEADER_SIZE].copy_from_slice(&table.encode());
    image[table_offset + TABLE_HEADER_SIZE..table_offset + TABLE_HEADER_SIZE + body.len()]
        .copy_from_slice(&body);

    let header = ContainerHeader {
        load_address:      0x8000_0000,
        original_length:   (size - HEADER_SIZE) as u32,
        original_checksum: checksum(&image[HEADER_SIZE..]),
        flags:             FLAG_ORIGINAL_CHECKSUM,
        map_table_address: map,
        ..ContainerHeader::default()
    };
    image[..HEADER_SIZE].copy_from_slice(&header.encode());
    image
}

fn small_image() -> Vec<u8> {
    let boot_ext: Vec<u8> = (0u8..0x40).collect();
    build_image(
        4096,
        0x1000,
        0x200,
        &[entry(0x03, "BootExt", 0x1030, 0x40), entry(0x07, "MemMapT", 0x1000, 0x100)],
        &[(0x30, &boot_ext[..])],
    )
}

#[test]
fn test_unpack_small_image() {
    let image = small_image();
    let report = unpack_bytes(&image, &UnpackOptions::default()).unwrap();

    assert_eq!(report.image_base, 0x1000);
    assert_eq!(report.table.offset, 0x200);
    assert_eq!(report.checksum_ok, Some(true));
    assert_eq!(report.objects.len(), 2);

    let boot = report.object("BootExt").unwrap();
    assert_eq!(
        boot.outcome,
        ObjectOutcome::Extracted {
            offset:       0x30,
            file:         "BootExt".into(),
            bytes:        0x40,
            codec:        CompressionTag::None,
            decompressed: false,
            checksum_ok:  None,
        }
    );
}

#[test]
fn test_unpack_small_image_to_disk() {
    let mut file = NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, &small_image()).unwrap();
    let out = tempdir().unwrap();

    let report = unpack_file(file.path(), out.path(), &UnpackOptions::default()).unwrap();
    assert_eq!(report.extracted(), 2);

    let boot_ext = std::fs::read(out.path().join("BootExt")).unwrap();
    assert_eq!(boot_ext, (0u8..0x40).collect::<Vec<_>>());

    let sidecar = Sidecar::read_from(out.path()).unwrap();
    assert_eq!(sidecar.image_base, 0x1000);
    assert_eq!(sidecar.table_offset, 0x200);
    assert_eq!(sidecar.entries[0].entry.name, "BootExt");
    assert_eq!(sidecar.entries[0].file.as_deref(), Some("BootExt"));
}

#[test]
fn test_dry_run_writes_nothing() {
    let mut file = NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, &small_image()).unwrap();
    let root = tempdir().unwrap();
    let out = root.path().join("out");

    let opts = UnpackOptions { dry_run: true, ..UnpackOptions::default() };
    let report = unpack_file(file.path(), &out, &opts).unwrap();
    assert_eq!(report.extracted(), 2);
    assert!(!out.exists());
}

// ── Fatal conditions ─────────────────────────────────────────────────────────

#[test]
fn test_bad_signature_is_fatal() {
    let mut image = small_image();
    image[6] = b'X';
    assert!(matches!(
        unpack_bytes(&image, &UnpackOptions::default()),
        Err(UnpackError::Header(HeaderError::SignatureMismatch { .. }))
    ));
}

#[test]
fn test_missing_table_is_fatal() {
    let mut image = small_image();
    // Corrupt the stored table checksum.
    image[0x200 + 10] ^= 0xFF;
    assert!(matches!(
        unpack_bytes(&image, &UnpackOptions::default()),
        Err(UnpackError::TableNotFound { map_table_address: 0x1000 })
    ));
}

#[test]
fn test_missing_anchor_is_fatal() {
    let image = build_image(4096, 0x1000, 0x200, &[entry(0x07, "MemMapT", 0x1000, 0x100)], &[]);
    assert!(matches!(
        unpack_bytes(&image, &UnpackOptions::default()),
        Err(UnpackError::Anchor(CatalogError::AnchorMissing))
    ));
}

#[test]
fn test_checksum_mismatch_strict_and_lenient() {
    let mut image = small_image();
    image[0x800] ^= 0x01;

    let report = unpack_bytes(&image, &UnpackOptions::default()).unwrap();
    assert_eq!(report.checksum_ok, Some(false));

    let strict = UnpackOptions { strict: true, ..UnpackOptions::default() };
    assert!(matches!(
        unpack_bytes(&image, &strict),
        Err(UnpackError::ChecksumMismatch { .. })
    ));
}

// ── Per-object degradation ───────────────────────────────────────────────────

#[test]
fn test_ram_and_absent_objects() {
    let boot_ext = [0xAAu8; 0x10];
    let image = build_image(
        4096,
        0x1000,
        0x200,
        &[
            entry(0x82, "BootExt", 0x1030, 0xFFFF_FFFF),
            entry(0x03, "BootExt", 0x1030, 0x10),
            entry(0x80, "Heap", 0, 0x10_0000),
            entry(0x05, "RomDir", 0x9000, 0x100),
        ],
        &[(0x30, &boot_ext[..])],
    );
    let report = unpack_bytes(&image, &UnpackOptions::default()).unwrap();

    assert_eq!(report.objects[0].outcome, ObjectOutcome::NoFileData);
    assert_eq!(report.objects[2].outcome, ObjectOutcome::NoFileData);
    assert_eq!(report.objects[3].outcome, ObjectOutcome::NotPresent { offset: 0x8000 });
    assert!(report.sidecar.entries[0].file.is_none());
    assert_eq!(report.sidecar.entries[1].file.as_deref(), Some("BootExt"));
}

#[test]
fn test_truncated_object() {
    let image = build_image(
        4096,
        0x1000,
        0x200,
        &[entry(0x03, "BootExt", 0x1030, 0x40), entry(0x05, "Tail", 0x1F00, 0x200)],
        &[],
    );
    let report = unpack_bytes(&image, &UnpackOptions::default()).unwrap();
    let tail = report.object("Tail").unwrap();
    assert!(matches!(
        tail.outcome,
        ObjectOutcome::RawFallback {
            offset: 0xF00,
            bytes:  0x100,
            reason: FallbackReason::Truncated { declared: 0x200, available: 0x100 },
            ..
        }
    ));
}

#[test]
fn test_malformed_nested_header_falls_back_to_raw() {
    let junk = [0x11u8; 0x60];
    let image = build_image(
        4096,
        0x1000,
        0x200,
        &[entry(0x03, "BootExt", 0x1030, 0x40), entry(0x04, "RasCode", 0x1400, 0x60)],
        &[(0x400, &junk[..])],
    );
    let report = unpack_bytes(&image, &UnpackOptions::default()).unwrap();
    let ras = report.object("RasCode").unwrap();
    match &ras.outcome {
        ObjectOutcome::RawFallback { bytes, reason: FallbackReason::MalformedNestedHeader(_), .. } => {
            assert_eq!(*bytes, 0x60);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(report.fallbacks(), 1);
}

#[test]
fn test_nested_checksum_mismatch_is_reported() {
    let opts = WrapOptions::default();
    let htp = wrap(b"intact HTP payload", &opts).unwrap();
    let mut ras = wrap(b"RAS payload with a flipped byte", &opts).unwrap();
    ras[HEADER_SIZE + 4] ^= 0xFF;

    let image = build_image(
        4096,
        0x1000,
        0x200,
        &[
            entry(0x03, "BootExt", 0x1030, 0x40),
            entry(0x05, "HTPCode", 0x1400, htp.len() as u32),
            entry(0x04, "RasCode", 0x1600, ras.len() as u32),
        ],
        &[(0x400, &htp[..]), (0x600, &ras[..])],
    );
    let report = unpack_bytes(&image, &UnpackOptions::default()).unwrap();
    assert_eq!(report.checksum_ok, Some(true));

    assert!(matches!(
        report.object("HTPCode").unwrap().outcome,
        ObjectOutcome::Extracted { checksum_ok: Some(true), .. }
    ));
    let ras_outcome = &report.object("RasCode").unwrap().outcome;
    assert!(matches!(ras_outcome, ObjectOutcome::Extracted { checksum_ok: Some(false), .. }));
    assert!(ras_outcome.to_string().ends_with("checksum MISMATCH"));

    assert_eq!(report.checksum_mismatches(), 1);
    assert!(report.summary().ends_with(", 1 checksum mismatch"));
}

#[test]
fn test_unknown_compression_is_opaque() {
    let payload = [0x1F, 0x8B, 0x08, 0x00, 0x01, 0x02, 0x03, 0x04];
    let header = ContainerHeader {
        compressed_length: payload.len() as u32,
        flags:             FLAG_COMPRESSED,
        ..ContainerHeader::default()
    };
    let mut framed = header.encode().to_vec();
    framed.extend_from_slice(&payload);

    let image = build_image(
        4096,
        0x1000,
        0x200,
        &[entry(0x03, "BootExt", 0x1030, 0x40), entry(0x05, "HTPCode", 0x1400, framed.len() as u32)],
        &[(0x400, &framed[..])],
    );
    let report = unpack_bytes(&image, &UnpackOptions::default()).unwrap();
    let htp = report.object("HTPCode").unwrap();
    assert!(matches!(
        &htp.outcome,
        ObjectOutcome::RawFallback { file, reason: FallbackReason::UnknownCompression, .. } if file == "HTPCode.bin"
    ));
}

#[test]
fn test_zero_prefixed_lzma_object() {
    let data = b"HTP test pattern ".repeat(40);
    let opts = WrapOptions { codec: CompressionTag::LzmaZeroPrefixed, ..WrapOptions::default() };
    let framed = wrap(&data, &opts).unwrap();

    let image = build_image(
        8192,
        0x1000,
        0x200,
        &[entry(0x03, "BootExt", 0x1030, 0x40), entry(0x05, "HTPCode", 0x1400, framed.len() as u32)],
        &[(0x400, &framed[..])],
    );

    let report = unpack_bytes(&image, &UnpackOptions::default()).unwrap();
    let htp = report.object("HTPCode").unwrap();
    assert!(matches!(
        &htp.outcome,
        ObjectOutcome::Extracted { file, codec: CompressionTag::LzmaZeroPrefixed, decompressed: false, .. }
            if file == "HTPCode.lzma"
    ));

    let opts = UnpackOptions { decompress: true, ..UnpackOptions::default() };
    let out = tempdir().unwrap();
    let mut file = NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, &image).unwrap();
    unpack_file(file.path(), out.path(), &opts).unwrap();
    assert_eq!(std::fs::read(out.path().join("HTPCode")).unwrap(), data);
}

// ── Pack ─────────────────────────────────────────────────────────────────────

struct Fixture {
    ras_code: Vec<u8>,
    boot_ext: Vec<u8>,
    rom_dir:  Vec<u8>,
}

/// Write a sidecar plus payload files describing a five-entry image.
fn write_fixture(dir: &Path) -> Fixture {
    let ras_code = b"ZyNOS RAS code image ".repeat(64);
    let framed = wrap(&ras_code, &WrapOptions {
        codec:        CompressionTag::Lzma,
        load_address: 0x8001_0000,
        version:      "V3.40(ABC.1)".into(),
        ..WrapOptions::default()
    }).unwrap();
    let boot_ext: Vec<u8> = (0..0x100).map(|i| i as u8).collect();
    let rom_dir = vec![0x5Au8; 0x80];

    let mut entries: Vec<SidecarEntry> = vec![
        entry(0x82, "BootExt", 0x8000_0000, 0x1000),
        entry(0x03, "BootExt", BASE + 0x30, 0x100),
        entry(0x07, "MemMapT", BASE + 0x200, 0x100),
        entry(0x05, "RomDir", BASE + 0x300, 0x80),
        entry(0x04, "RasCode", BASE + 0x400, framed.len() as u32),
    ]
    .into_iter()
    .map(SidecarEntry::from)
    .collect();
    entries[1].file = Some("BootExt".into());
    entries[3].file = Some("RomDir".into());
    entries[4].file = Some("RasCode.lzma".into());
    entries[4].framing = Some(Framing {
        header:       ContainerHeader::decode(&framed).unwrap(),
        codec:        CompressionTag::Lzma,
        decompressed: false,
    });

    let mut container = ContainerHeader { object_type: 3, map_table_address: BASE + 0x200, ..ContainerHeader::default() };
    container.set_version("V3.40(ABC.1)");
    let sidecar = Sidecar {
        container,
        image_base:   BASE,
        table_offset: 0x200,
        user_region:  b"ZyXEL".to_vec(),
        entries,
    };

    std::fs::write(dir.join("BootExt"), &boot_ext).unwrap();
    std::fs::write(dir.join("RomDir"), &rom_dir).unwrap();
    std::fs::write(dir.join("RasCode.lzma"), &framed[HEADER_SIZE..]).unwrap();
    sidecar.write_to(dir).unwrap();

    Fixture { ras_code, boot_ext, rom_dir }
}

fn entry_set(entries: &[SidecarEntry]) -> BTreeSet<(Vec<u8>, u32, u32, u8, u32)> {
    entries
        .iter()
        .map(|e| (e.entry.name.as_bytes().to_vec(), e.entry.address, e.entry.length, e.entry.kind, e.entry.subtype))
        .collect()
}

#[test]
fn test_pack_unpack_roundtrip() {
    let src = tempdir().unwrap();
    let fixture = write_fixture(src.path());

    let (image, report) = pack_dir(src.path(), &PackOptions::default()).unwrap();
    assert_eq!(report.image_base, BASE);
    assert_eq!(report.table_offset, 0x200);
    assert_eq!(report.omitted(), 0);

    let header = ContainerHeader::decode(&image).unwrap();
    assert_eq!(header.load_address, 0x8000_0000);
    assert_eq!(header.map_table_address, BASE + 0x200);
    assert_eq!(header.object_type, 3);
    assert_eq!(header.version_str(), "V3.40(ABC.1)");

    let image_file = NamedTempFile::new().unwrap();
    std::fs::write(image_file.path(), &image).unwrap();
    let out = tempdir().unwrap();
    let unpacked = unpack_file(image_file.path(), out.path(), &UnpackOptions::default()).unwrap();

    assert_eq!(unpacked.checksum_ok, Some(true));
    assert_eq!(unpacked.image_base, BASE);
    assert_eq!(unpacked.table.offset, 0x200);
    assert_eq!(unpacked.sidecar.user_region, b"ZyXEL");

    let original = Sidecar::read_from(src.path()).unwrap();
    assert_eq!(entry_set(&unpacked.sidecar.entries), entry_set(&original.entries));

    for name in ["BootExt", "RomDir", "RasCode.lzma"] {
        assert_eq!(
            std::fs::read(out.path().join(name)).unwrap(),
            std::fs::read(src.path().join(name)).unwrap(),
            "{name} differs after round trip"
        );
    }
    assert_eq!(std::fs::read(out.path().join("BootExt")).unwrap(), fixture.boot_ext);
    assert_eq!(std::fs::read(out.path().join("RomDir")).unwrap(), fixture.rom_dir);

    let ras = unpacked.sidecar.entries.iter().find(|e| e.entry.name == "RasCode").unwrap();
    assert_eq!(ras.framing, original.entries[4].framing);

    // RAM objects never produce files.
    let files: BTreeSet<String> = std::fs::read_dir(out.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    let expected: BTreeSet<String> = ["BootExt", "MemMapT", "RomDir", "RasCode.lzma", SIDECAR_NAME]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(files, expected);

    let stream = std::fs::read(out.path().join("RasCode.lzma")).unwrap();
    assert_eq!(get_codec(CompressionTag::Lzma).unwrap().decompress(&stream).unwrap(), fixture.ras_code);
}

#[test]
fn test_repack_is_byte_identical() {
    let src = tempdir().unwrap();
    write_fixture(src.path());
    let (image, _) = pack_dir(src.path(), &PackOptions::default()).unwrap();

    let image_file = NamedTempFile::new().unwrap();
    std::fs::write(image_file.path(), &image).unwrap();
    let out = tempdir().unwrap();
    unpack_file(image_file.path(), out.path(), &UnpackOptions::default()).unwrap();

    let (again, _) = pack_dir(out.path(), &PackOptions::default()).unwrap();
    assert_eq!(again, image);
}

#[test]
fn test_decompressed_payload_is_recompressed() {
    let src = tempdir().unwrap();
    let fixture = write_fixture(src.path());
    let (image, _) = pack_dir(src.path(), &PackOptions::default()).unwrap();

    let image_file = NamedTempFile::new().unwrap();
    std::fs::write(image_file.path(), &image).unwrap();
    let out = tempdir().unwrap();
    let opts = UnpackOptions { decompress: true, ..UnpackOptions::default() };
    unpack_file(image_file.path(), out.path(), &opts).unwrap();
    assert_eq!(std::fs::read(out.path().join("RasCode")).unwrap(), fixture.ras_code);

    let (repacked, report) = pack_dir(out.path(), &PackOptions::default()).unwrap();
    let ras = report.objects.iter().find(|(e, _)| e.name == "RasCode").unwrap();
    assert!(matches!(ras.1, PackOutcome::Placed { offset: 0x400, reframed: true, .. }));

    let again = unpack_bytes(&repacked, &opts).unwrap();
    assert!(matches!(
        again.object("RasCode").unwrap().outcome,
        ObjectOutcome::Extracted { decompressed: true, .. }
    ));
    let nested = ContainerHeader::decode(&repacked[0x400..]).unwrap();
    assert_eq!(nested.original_length as usize, fixture.ras_code.len());
    assert_eq!(nested.original_checksum, checksum(&fixture.ras_code));
    assert_eq!(nested.load_address, 0x8001_0000);
}

#[test]
fn test_missing_payload_is_omitted() {
    let src = tempdir().unwrap();
    write_fixture(src.path());
    std::fs::remove_file(src.path().join("RomDir")).unwrap();

    let (image, report) = pack_dir(src.path(), &PackOptions::default()).unwrap();
    assert_eq!(report.omitted(), 1);
    let rom_dir = report.objects.iter().find(|(e, _)| e.name == "RomDir").unwrap();
    assert_eq!(rom_dir.1, PackOutcome::Omitted { reason: OmitReason::MissingFile("RomDir".into()) });

    // The image is still complete enough to unpack.
    let unpacked = unpack_bytes(&image, &UnpackOptions::default()).unwrap();
    assert_eq!(unpacked.checksum_ok, Some(true));
    assert_eq!(unpacked.objects.len(), 5);
}

#[test]
fn test_pack_without_sidecar_fails() {
    let dir = tempdir().unwrap();
    assert!(pack_dir(dir.path(), &PackOptions::default()).is_err());
}
