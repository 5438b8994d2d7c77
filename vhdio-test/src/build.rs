//! Synthesize VHD images in memory.
//!
//! Dynamic images are laid out the way common tools write them: footer copy,
//! dynamic disk header, allocation table, then data blocks in logical order,
//! followed by the trailing footer. Sectors which are not marked present are
//! filled with [`GARBAGE`] on disk, so a reader touching them is caught.
use vhdio::{
    SECTOR_SIZE, Uuid,
    format::{DiskType, DynamicHeader, Footer, PlatformCode},
    zerocopy::{FromZeros, IntoBytes, big_endian as be},
};

/// The byte filling absent sectors inside allocated blocks.
pub const GARBAGE: u8 = 0xCC;

/// The default block size used by most tools.
pub const DEFAULT_BLOCK_SIZE: u32 = 2 << 20;

const SECTOR: usize = SECTOR_SIZE as usize;
const HEADER_OFFSET: u64 = 512;
const TABLE_OFFSET: u64 = 1536;

/// Compute the one's complement byte sum used by VHD footers and headers.
/// The checksum field must be zero.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u32 {
    !bytes.iter().fold(0u32, |sum, &b| sum.wrapping_add(b.into()))
}

/// Compute the CHS geometry hint of a disk size, as `(cylinders, heads, sectors_per_track)`.
#[must_use]
pub fn chs_geometry(size: u64) -> (u16, u8, u8) {
    let total = (size / u64::from(SECTOR_SIZE)).min(65535 * 16 * 255);
    let (spt, heads, cyl_x_heads);
    if total >= 65535 * 16 * 63 {
        spt = 255;
        heads = 16;
        cyl_x_heads = total / spt;
    } else {
        let mut s = 17;
        let mut c = total / s;
        let mut h = c.div_ceil(1024).max(4);
        if c >= h * 1024 || h > 16 {
            s = 31;
            h = 16;
            c = total / s;
        }
        if c >= h * 1024 {
            s = 63;
            h = 16;
            c = total / s;
        }
        spt = s;
        heads = h;
        cyl_x_heads = c;
    }
    ((cyl_x_heads / heads) as u16, heads as u8, spt as u8)
}

/// The parent reference of a differencing image.
#[derive(Debug, Clone)]
pub struct Parent {
    pub id: Uuid,
    pub name: String,
    /// Seconds since the VHD epoch.
    pub timestamp: u32,
}

/// A synthetic image: its logical content and which sectors are stored.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    disk_type: DiskType,
    block_size: u32,
    content: Vec<u8>,
    present: Vec<bool>,
    id: Uuid,
    parent: Option<Parent>,
}

impl ImageBuilder {
    fn new(disk_type: DiskType, size: u64, block_size: u32) -> Self {
        assert_eq!(size % u64::from(SECTOR_SIZE), 0, "size must be sector aligned");
        assert!(block_size.is_power_of_two() && block_size >= SECTOR_SIZE);
        let size = usize::try_from(size).expect("size overflow");
        Self {
            disk_type,
            block_size,
            content: vec![0; size],
            present: vec![disk_type == DiskType::FIXED; size / SECTOR],
            id: Uuid::from_bytes(*b"vhdio-test-image"),
            parent: None,
        }
    }

    /// A fixed image, with every sector present.
    #[must_use]
    pub fn fixed(size: u64) -> Self {
        Self::new(DiskType::FIXED, size, SECTOR_SIZE)
    }

    /// A dynamic image with nothing allocated.
    #[must_use]
    pub fn dynamic(size: u64, block_size: u32) -> Self {
        Self::new(DiskType::DYNAMIC, size, block_size)
    }

    /// A differencing image with nothing allocated.
    #[must_use]
    pub fn differencing(size: u64, block_size: u32, parent: Parent) -> Self {
        let mut this = Self::new(DiskType::DIFFERENCING, size, block_size);
        this.parent = Some(parent);
        this
    }

    #[must_use]
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }

    #[must_use]
    pub fn disk_type(&self) -> DiskType {
        self.disk_type
    }

    /// Write `data` at logical `offset`. Every touched sector becomes present.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> &mut Self {
        let start = usize::try_from(offset).expect("offset overflow");
        self.content[start..start + data.len()].copy_from_slice(data);
        self.mark_present(offset, data.len() as u64);
        self
    }

    /// Mark the sectors touched by a logical range as present, keeping their content.
    pub fn mark_present(&mut self, offset: u64, len: u64) -> &mut Self {
        if len != 0 {
            let first = (offset / u64::from(SECTOR_SIZE)) as usize;
            let last = (offset + len).div_ceil(u64::from(SECTOR_SIZE)) as usize;
            self.present[first..last].fill(true);
        }
        self
    }

    #[must_use]
    pub fn is_present(&self, sector: u64) -> bool {
        self.present[sector as usize]
    }

    /// The logical disk as a reader should return it, with absent sectors as zeros.
    #[must_use]
    pub fn expected_content(&self) -> Vec<u8> {
        let mut out = self.content.clone();
        for (sector, &present) in out.chunks_exact_mut(SECTOR).zip(&self.present) {
            if !present {
                sector.fill(0);
            }
        }
        out
    }

    fn sectors_per_block(&self) -> usize {
        (self.block_size / SECTOR_SIZE) as usize
    }

    fn table_entries(&self) -> u32 {
        self.size()
            .div_ceil(self.block_size.into())
            .try_into()
            .expect("too many blocks")
    }

    /// The size of each block bitmap on disk, in bytes.
    fn bitmap_len(&self) -> usize {
        self.sectors_per_block().div_ceil(8).div_ceil(SECTOR) * SECTOR
    }

    #[must_use]
    pub fn footer(&self) -> Footer {
        let size = self.size();
        let (cylinders, heads, sectors_per_track) = chs_geometry(size);
        let mut footer = Footer::new_zeroed();
        footer.cookie = Footer::COOKIE;
        footer.features = be::U32::new(Footer::FEATURE_RESERVED);
        footer.format_version = be::U32::new(0x0001_0000);
        footer.data_offset = be::U64::new(if self.disk_type == DiskType::FIXED {
            u64::MAX
        } else {
            HEADER_OFFSET
        });
        footer.timestamp = be::U32::new(0x2000_0000);
        footer.creator_app = *b"vhio";
        footer.creator_version = be::U32::new(0x0001_0000);
        footer.creator_os = be::U32::new(u32::from_be_bytes(*b"Wi2k"));
        footer.original_size = be::U64::new(size);
        footer.current_size = be::U64::new(size);
        footer.cylinders = be::U16::new(cylinders);
        footer.heads = heads;
        footer.sectors_per_track = sectors_per_track;
        footer.disk_type = self.disk_type;
        footer.unique_id = self.id.into_bytes();
        footer.checksum = be::U32::new(checksum(footer.as_bytes()));
        footer
    }

    /// The dynamic disk header, for non-fixed images.
    #[must_use]
    pub fn dynamic_header(&self) -> Option<DynamicHeader> {
        if self.disk_type == DiskType::FIXED {
            return None;
        }
        let mut header = DynamicHeader::new_zeroed();
        header.cookie = DynamicHeader::COOKIE;
        header.data_offset = be::U64::new(u64::MAX);
        header.table_offset = be::U64::new(TABLE_OFFSET);
        header.header_version = be::U32::new(0x0001_0000);
        header.max_table_entries = be::U32::new(self.table_entries());
        header.block_size = be::U32::new(self.block_size);
        if let Some(parent) = &self.parent {
            header.parent_unique_id = parent.id.into_bytes();
            header.parent_timestamp = be::U32::new(parent.timestamp);
            let name = parent
                .name
                .encode_utf16()
                .flat_map(u16::to_be_bytes)
                .collect::<Vec<_>>();
            header.parent_unicode_name[..name.len()].copy_from_slice(&name);
            let loc = &mut header.parent_locators[0];
            loc.platform_code = PlatformCode::W2RU;
            loc.data_space = be::U32::new(1);
            loc.data_length = be::U32::new(name.len() as u32);
        }
        header.checksum = be::U32::new(checksum(header.as_bytes()));
        Some(header)
    }

    /// Serialize the image.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let footer = self.footer();
        let Some(mut header) = self.dynamic_header() else {
            let mut out = self.content.clone();
            out.extend_from_slice(footer.as_bytes());
            return out;
        };

        let spb = self.sectors_per_block();
        let entries = self.table_entries() as usize;
        let mut out = Vec::new();
        out.extend_from_slice(footer.as_bytes());
        out.extend_from_slice(header.as_bytes());
        let table_len = (entries * 4).div_ceil(SECTOR) * SECTOR;
        out.resize(out.len() + table_len, 0xFF);

        // Parent locator data goes right after the table.
        if let Some(parent) = &self.parent {
            let loc_offset = out.len() as u64;
            let name = parent
                .name
                .encode_utf16()
                .flat_map(u16::to_le_bytes)
                .collect::<Vec<_>>();
            out.extend_from_slice(&name);
            out.resize(out.len().next_multiple_of(SECTOR), 0);
            header.parent_locators[0].data_offset = be::U64::new(loc_offset);
            header.checksum = be::U32::new(0);
            header.checksum = be::U32::new(checksum(header.as_bytes()));
            out[HEADER_OFFSET as usize..TABLE_OFFSET as usize].copy_from_slice(header.as_bytes());
        }

        for block in 0..entries {
            let sectors = block * spb..((block + 1) * spb).min(self.present.len());
            let block_present = &self.present[sectors.clone()];
            if !block_present.iter().any(|&p| p) {
                continue;
            }

            let entry = (out.len() / SECTOR) as u32;
            let entry_offset = TABLE_OFFSET as usize + block * 4;
            out[entry_offset..entry_offset + 4].copy_from_slice(&entry.to_be_bytes());

            let mut bitmap = vec![0u8; self.bitmap_len()];
            for (i, _) in block_present.iter().enumerate().filter(|(_, p)| **p) {
                bitmap[i / 8] |= 0x80 >> (i % 8);
            }
            out.extend_from_slice(&bitmap);

            for (i, &present) in block_present.iter().enumerate() {
                if present {
                    let sector = sectors.start + i;
                    out.extend_from_slice(&self.content[sector * SECTOR..][..SECTOR]);
                } else {
                    out.resize(out.len() + SECTOR, GARBAGE);
                }
            }
            // The last block is always written in full.
            out.resize(out.len() + (spb - block_present.len()) * SECTOR, GARBAGE);
        }

        out.extend_from_slice(footer.as_bytes());
        out
    }
}

/// A deterministic filler so misplaced reads are detected.
#[must_use]
pub fn pattern(offset: u64, len: usize) -> Vec<u8> {
    (offset..offset + len as u64)
        .map(|i| (i ^ (i >> 9) ^ (i >> 17)).to_le_bytes()[0] | 1)
        .collect()
}

/// A small image of the given type mixing allocated, partially present and
/// unallocated blocks, with a partial trailing block.
#[must_use]
pub fn sample(disk_type: DiskType) -> ImageBuilder {
    const BLOCK: u32 = 512 << 10;
    let size = 6 * u64::from(BLOCK) + 3 * 512;
    let mut b = match disk_type {
        DiskType::FIXED => ImageBuilder::fixed(size),
        DiskType::DYNAMIC => ImageBuilder::dynamic(size, BLOCK),
        DiskType::DIFFERENCING => ImageBuilder::differencing(
            size,
            BLOCK,
            Parent {
                id: Uuid::from_bytes(*b"vhdio-test-paren"),
                name: "parent.vhd".into(),
                timestamp: 0x1000_0000,
            },
        ),
        _ => panic!("unsupported disk type {disk_type:?}"),
    };
    let block = u64::from(BLOCK);
    for (offset, len) in [
        (0, block as usize),
        (2 * block + 3 * 512, 6 * 512),
        (2 * block + 100 * 512 + 7, 1),
        (4 * block - 512, 1024),
        (6 * block, 1024),
    ] {
        b.write(offset, &pattern(offset, len));
    }
    b
}
