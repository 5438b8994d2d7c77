use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
};

use tempfile::NamedTempFile;
use vhdio::{
    Config, ErrorKind, Extent, Image, ReadStatus, SECTOR_SIZE, Uuid,
    format::{DiskType, FooterOrder},
};
use vhdio_test::build::{self, ImageBuilder, Parent};
use xshell::{Shell, TempDir, cmd};

const KINDS: [DiskType; 3] = [DiskType::FIXED, DiskType::DYNAMIC, DiskType::DIFFERENCING];

fn new_temp_shell() -> (Shell, TempDir) {
    let sh = Shell::new().unwrap();
    let temp_dir = sh.create_temp_dir().unwrap();
    sh.change_dir(temp_dir.path());
    (sh, temp_dir)
}

#[track_caller]
fn read_all<R: vhdio::positioned_io::ReadAt>(image: &mut Image<R>) -> Vec<u8> {
    let mut buf = vec![0xAAu8; image.size() as usize];
    image.read_exact_zeroed_at(0, &mut buf).unwrap();
    buf
}

#[test]
fn read_back_all_kinds() {
    for kind in KINDS {
        let builder = build::sample(kind);
        let mut image = Image::open(builder.to_bytes()).unwrap();
        assert_eq!(image.disk_type(), kind);
        assert_eq!(image.size(), builder.size());
        assert!(read_all(&mut image) == builder.expected_content(), "{kind:?}");

        let mut got = Vec::new();
        image.reader().read_to_end(&mut got).unwrap();
        assert!(got == builder.expected_content(), "{kind:?}");
    }
}

#[test]
fn read_from_file() {
    let builder = build::sample(DiskType::DYNAMIC);
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&builder.to_bytes()).unwrap();
    file.flush().unwrap();

    let mut image = Image::open(fs::File::open(file.path()).unwrap()).unwrap();
    assert!(read_all(&mut image) == builder.expected_content());
    let file = image.close();
    assert_eq!(
        file.metadata().unwrap().len(),
        builder.to_bytes().len() as u64
    );
}

#[test]
fn status_matches_sector_presence() {
    let builder = build::sample(DiskType::DYNAMIC);
    let mut image = Image::open(builder.to_bytes()).unwrap();
    let size = image.size();

    let mut offset = 0u64;
    let mut buf = vec![0u8; 4096];
    while offset < size {
        let want = buf.len().min((size - offset) as usize);
        let (len, status) = image.read_at(offset, &mut buf[..want]).unwrap();
        assert!(len >= 1 && len <= want);

        let first = offset / u64::from(SECTOR_SIZE);
        let last = (offset + len as u64).div_ceil(u64::from(SECTOR_SIZE));
        for sector in first..last {
            assert_eq!(
                builder.is_present(sector),
                status == ReadStatus::Data,
                "sector {sector} at {offset}+{len}",
            );
        }
        offset += len as u64;
    }
    assert_eq!(offset, size);
}

#[test]
fn fixed_is_identity() {
    let builder = build::sample(DiskType::FIXED);
    let mut image = Image::open(builder.to_bytes()).unwrap();
    assert!(image.is_fixed());
    assert_eq!(image.block_size(), None);
    let size = image.size();
    for (off, len) in [(0, size), (1, 1), (12345, 67890)] {
        assert_eq!(
            image.translate(off, len).unwrap(),
            Extent::Data {
                physical_offset: off,
                len,
            }
        );
    }
}

#[test]
fn small_bat_window() {
    let block_size = 4096;
    let mut builder = ImageBuilder::dynamic(600 * u64::from(block_size), block_size);
    for block in [0u64, 511, 512, 599] {
        let offset = block * u64::from(block_size) + 1024;
        builder.write(offset, &build::pattern(offset, 2048));
    }
    let bytes = builder.to_bytes();

    let config = Config::default().bat_window_entries(1);
    let mut image = Image::open_with_config(bytes.clone(), &config).unwrap();
    assert_eq!(image.bat_window(), Some(0..512));

    let mut buf = [0u8; 16];
    image.read_at(599 * u64::from(block_size), &mut buf).unwrap();
    assert_eq!(image.bat_window(), Some(512..600));
    image.read_at(511 * u64::from(block_size), &mut buf).unwrap();
    assert_eq!(image.bat_window(), Some(0..512));
    assert!(read_all(&mut image) == builder.expected_content());

    let mut image = Image::open(bytes).unwrap();
    assert_eq!(image.bat_window(), Some(0..600));
    assert!(read_all(&mut image) == builder.expected_content());
}

#[test]
fn differencing_chain() {
    let size = 4 << 20;
    let block_size = 1 << 20;
    let mut base = ImageBuilder::dynamic(size, block_size)
        .with_id(Uuid::from_bytes(*b"base-image-uuid!"));
    base.write(0, &build::pattern(0, size as usize));
    let mut child = ImageBuilder::differencing(
        size,
        block_size,
        Parent {
            id: Uuid::from_bytes(*b"base-image-uuid!"),
            name: "base.vhd".into(),
            timestamp: 1234,
        },
    );
    child.write(1000, b"child data");
    child.write(3 << 20, &[0x42; 4096]);

    let mut base_img = Image::open(base.to_bytes()).unwrap();
    let mut child_img = Image::open(child.to_bytes()).unwrap();
    assert!(child_img.is_differencing());
    assert_eq!(child_img.parent_id(), Some(base_img.image_id()));
    assert_eq!(child_img.parent_name().as_deref(), Some("base.vhd"));
    assert!(child_img.parent_timestamp().is_some());
    let locs = child_img
        .dynamic_header()
        .unwrap()
        .parent_locators()
        .count();
    assert_eq!(locs, 1);

    // Resolve unallocated ranges through the parent.
    let mut merged = vec![0u8; size as usize];
    let mut offset = 0;
    while offset < merged.len() {
        let buf = &mut merged[offset..];
        let (len, status) = child_img.read_at(offset as u64, buf).unwrap();
        if status == ReadStatus::Unallocated {
            base_img
                .read_exact_zeroed_at(offset as u64, &mut buf[..len])
                .unwrap();
        }
        offset += len;
    }

    let mut expect = build::pattern(0, size as usize);
    // Sector-granular overlay.
    expect[512..1024].fill(0);
    expect[1000..1010].copy_from_slice(b"child data");
    expect[3 << 20..(3 << 20) + 4096].fill(0x42);
    assert!(merged == expect);
}

#[test]
fn footer_copies() {
    let builder = build::sample(DiskType::DYNAMIC);
    let bytes = builder.to_bytes();
    let back = bytes.len() as u64 - 512;

    let image = Image::open(bytes.clone()).unwrap();
    assert_eq!(image.footer_offset(), 0);
    let config = Config::default().footer_order(FooterOrder::BackFirst);
    let image = Image::open_with_config(bytes.clone(), &config).unwrap();
    assert_eq!(image.footer_offset(), back);

    let mut front_broken = bytes.clone();
    front_broken[..8].copy_from_slice(b"garbage!");
    let mut image = Image::open(front_broken).unwrap();
    assert_eq!(image.footer_offset(), back);
    assert!(read_all(&mut image) == builder.expected_content());

    let mut both_broken = bytes.clone();
    both_broken[..8].copy_from_slice(b"garbage!");
    both_broken[back as usize..][..8].copy_from_slice(b"garbage!");
    let err = Image::open(both_broken).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHeader);
}

#[test]
fn truncated_images() {
    let bytes = build::sample(DiskType::DYNAMIC).to_bytes();
    // Only the front copy of the footer and the header remain.
    let err = Image::open(bytes[..1536].to_vec()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);

    let bytes = build::sample(DiskType::FIXED).to_bytes();
    let footer = bytes[bytes.len() - 512..].to_vec();
    let err = Image::open(footer).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadStructure);

    // A dynamic image whose last data block is cut off.
    let bytes = build::sample(DiskType::DYNAMIC).to_bytes();
    let cut = bytes.len() - 512 - (512 << 10);
    let mut image = Image::open(bytes[..cut].to_vec()).unwrap();
    let size = image.size();
    let err = image
        .read_exact_zeroed_at(0, &mut vec![0u8; size as usize])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn reader_seek_and_errors() {
    let builder = build::sample(DiskType::DIFFERENCING);
    let expect = builder.expected_content();
    let mut image = Image::open(builder.to_bytes()).unwrap();
    let size = image.size();

    let mut rdr = image.reader();
    let mut buf = vec![0u8; 3000];
    for pos in [0, 1, size / 2 - 7, size - 3000] {
        rdr.seek(SeekFrom::Start(pos)).unwrap();
        rdr.read_exact(&mut buf).unwrap();
        assert!(buf == expect[pos as usize..pos as usize + 3000], "at {pos}");
    }
    rdr.seek(SeekFrom::End(-10)).unwrap();
    let err = rdr.read_exact(&mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

    let err = image.read_at(size, &mut buf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    assert_eq!(
        std::io::Error::from(err).kind(),
        std::io::ErrorKind::UnexpectedEof
    );
}

#[test]
fn extract_binary() {
    let (sh, _temp_dir) = new_temp_shell();
    let exe = env!("CARGO_BIN_EXE_vhdio-test");
    for (kind, disk_type) in [
        ("fixed", DiskType::FIXED),
        ("dynamic", DiskType::DYNAMIC),
        ("differencing", DiskType::DIFFERENCING),
    ] {
        cmd!(sh, "{exe} gen-fixture {kind} img.vhd").run().unwrap();
        cmd!(sh, "{exe} extract img.vhd out.raw").run().unwrap();
        let got = fs::read(sh.current_dir().join("out.raw")).unwrap();
        assert!(got == build::sample(disk_type).expected_content(), "{kind}");
    }
}
