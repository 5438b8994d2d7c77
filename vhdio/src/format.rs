//! The low-level module for decoding on-disk VHD structures.
//!
//! Every VHD image ends with a 512-byte [`Footer`]. Dynamic and differencing
//! images additionally keep a copy of the footer at the start of the file, a
//! [`DynamicHeader`] at the footer's `data_offset`, a Block Allocation Table
//! (BAT) of big-endian `u32` sector offsets, and the data blocks themselves.
//! Each data block is a sector bitmap, padded to a sector boundary, followed
//! by `block_size` bytes of sector data.
//!
//! All integer fields are stored big-endian. The structures here are
//! [`zerocopy`] overlays with typed big-endian fields, so every access decodes
//! to host order explicitly.
//!
//! See also:
//! [Virtual Hard Disk Image Format Specification](https://learn.microsoft.com/en-us/windows/win32/vstor/about-vhd)
use std::{
    fmt,
    time::{Duration, SystemTime},
};

use positioned_io::ReadAt;
use uuid::Uuid;
use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned, big_endian as be,
};

use crate::{ErrorKind, SECTOR_SIZE};

type Result<T> = std::result::Result<T, Error>;

/// An error raised from reading or validating on-disk structures.
pub struct Error(Box<ErrorInner>);

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
#[non_exhaustive]
enum ErrorInner {
    // Footer.
    InvalidFooterCookie([u8; 8]),
    MissingFooter,
    ShortFooter(usize),
    UnsupportedDiskType(DiskType),

    // Dynamic disk header.
    InvalidHeaderCookie([u8; 8]),
    ShortHeader(usize),
    InvalidBlockSize(u32),
    OffsetOverflow,

    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::InvalidFooterCookie(cookie) => {
                write!(f, "invalid footer cookie: b\"{}\"", cookie.escape_ascii())
            }
            ErrorInner::MissingFooter => f.pad("no valid footer at either end of the image"),
            ErrorInner::ShortFooter(len) => {
                write!(f, "footer needs {FOOTER_SIZE} bytes but got {len}")
            }
            ErrorInner::UnsupportedDiskType(ty) => write!(f, "unsupported disk type {ty:?}"),

            ErrorInner::InvalidHeaderCookie(cookie) => write!(
                f,
                "invalid dynamic disk header cookie: b\"{}\"",
                cookie.escape_ascii()
            ),
            ErrorInner::ShortHeader(len) => {
                write!(f, "dynamic disk header needs {HEADER_SIZE} bytes but got {len}")
            }
            ErrorInner::InvalidBlockSize(size) => write!(
                f,
                "block size {size}B is not a power-of-two multiple of the sector size"
            ),
            ErrorInner::OffsetOverflow => f.pad("structure offset overflow"),

            ErrorInner::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

impl Error {
    /// Get the category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match &*self.0 {
            ErrorInner::InvalidFooterCookie(_)
            | ErrorInner::MissingFooter
            | ErrorInner::ShortFooter(_) => ErrorKind::InvalidHeader,
            ErrorInner::UnsupportedDiskType(_) => ErrorKind::UnsupportedFormat,
            ErrorInner::InvalidHeaderCookie(_)
            | ErrorInner::ShortHeader(_)
            | ErrorInner::InvalidBlockSize(_)
            | ErrorInner::OffsetOverflow => ErrorKind::BadStructure,
            ErrorInner::Io(_) => ErrorKind::Io,
        }
    }

    fn is_footer_cookie_mismatch(&self) -> bool {
        matches!(*self.0, ErrorInner::InvalidFooterCookie(_))
    }
}

/// The on-disk size of [`Footer`].
pub const FOOTER_SIZE: u64 = size_of::<Footer>() as u64;

/// The on-disk size of [`DynamicHeader`].
pub const HEADER_SIZE: u64 = size_of::<DynamicHeader>() as u64;

const _: () = assert!(FOOTER_SIZE == 512);
const _: () = assert!(HEADER_SIZE == 1024);

/// The difference between the VHD epoch (2000-01-01 00:00:00 UTC) and the
/// UNIX epoch, in seconds.
pub const VHD_EPOCH_UNIX_SECS: u64 = 946_684_800;

/// Convert a VHD timestamp into a [`SystemTime`].
#[must_use]
pub fn vhd_time(timestamp: u32) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(VHD_EPOCH_UNIX_SECS + u64::from(timestamp))
}

macro_rules! impl_open_enum {
    ($name:ident; $ctor:path; $($(#[$meta:meta])* $variant:ident = $value:expr,)*) => {
        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(match *self {
                    $(Self::$variant => stringify!($variant),)*
                    _ => return f
                        .debug_tuple(stringify!($name))
                        .field(&self.0.get())
                        .finish(),
                })
            }
        }

        impl $name {
            $(
                $(#[$meta])*
                pub const $variant: Self = Self($ctor($value));
            )*
        }
    };
}

/// The hard disk footer, located at the end of every image and, for dynamic
/// and differencing images, also at the start.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Footer {
    /// The footer cookie that should match [`Footer::COOKIE`].
    pub cookie: [u8; 8],
    /// Feature flags, see [`Footer::FEATURE_TEMPORARY`].
    pub features: be::U32,
    /// The file format version, `0x0001_0000` for all known images.
    pub format_version: be::U32,
    /// Absolute file offset of the [`DynamicHeader`], or `u64::MAX` for fixed disks.
    pub data_offset: be::U64,
    /// Creation time in seconds since 2000-01-01 00:00:00 UTC.
    pub timestamp: be::U32,
    /// The application which created the image, eg. `b"vpc "` or `b"qemu"`.
    pub creator_app: [u8; 4],
    /// The version of the creator application.
    pub creator_version: be::U32,
    /// The host OS of the creator, eg. `b"Wi2k"` as a big-endian integer.
    pub creator_os: be::U32,
    /// The disk size in bytes at creation time.
    pub original_size: be::U64,
    /// The current disk size in bytes.
    pub current_size: be::U64,
    /// CHS geometry hint: cylinders.
    pub cylinders: be::U16,
    /// CHS geometry hint: heads.
    pub heads: u8,
    /// CHS geometry hint: sectors per track.
    pub sectors_per_track: u8,
    /// The layout of this image.
    pub disk_type: DiskType,
    /// One's complement of the byte sum of this footer without the checksum field.
    pub checksum: be::U32,
    /// The unique identifier of this image.
    pub unique_id: [u8; 16],
    /// Whether the image is in saved state.
    pub saved_state: u8,
    pub reserved: [u8; 427],
}

impl fmt::Debug for Footer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Footer")
            .field("cookie", &format_args!("b\"{}\"", self.cookie.escape_ascii()))
            .field("features", &self.features.get())
            .field("format_version", &format_args!("{:#x}", self.format_version.get()))
            .field("data_offset", &self.data_offset.get())
            .field("timestamp", &self.timestamp.get())
            .field(
                "creator_app",
                &format_args!("b\"{}\"", self.creator_app.escape_ascii()),
            )
            .field("creator_version", &format_args!("{:#x}", self.creator_version.get()))
            .field("creator_os", &format_args!("{:#x}", self.creator_os.get()))
            .field("original_size", &self.original_size.get())
            .field("current_size", &self.current_size.get())
            .field("geometry", &self.geometry())
            .field("disk_type", &self.disk_type)
            .field("checksum", &format_args!("{:#010x}", self.checksum.get()))
            .field("unique_id", &self.uuid())
            .field("saved_state", &self.saved_state)
            .finish_non_exhaustive()
    }
}

impl Footer {
    /// The expected cookie.
    pub const COOKIE: [u8; 8] = *b"conectix";

    /// The image is temporary and may be deleted on shutdown.
    pub const FEATURE_TEMPORARY: u32 = 1;
    /// Always set by conforming producers.
    pub const FEATURE_RESERVED: u32 = 2;

    /// Validate the cookie and that the disk type is one this library can read.
    pub fn validate(&self) -> Result<()> {
        if self.cookie != Self::COOKIE {
            bail!(ErrorInner::InvalidFooterCookie(self.cookie));
        }
        match self.disk_type {
            DiskType::FIXED | DiskType::DYNAMIC | DiskType::DIFFERENCING => Ok(()),
            ty => bail!(ErrorInner::UnsupportedDiskType(ty)),
        }
    }

    /// The unique identifier of this image.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.unique_id)
    }

    /// The creation time.
    #[must_use]
    pub fn created(&self) -> SystemTime {
        vhd_time(self.timestamp.get())
    }

    /// The CHS geometry hint. It is informational only.
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        Geometry {
            cylinders: self.cylinders.get(),
            heads: self.heads,
            sectors_per_track: self.sectors_per_track,
        }
    }
}

/// Cylinder/head/sector geometry as recorded in the [`Footer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Geometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

/// The layout of an image.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DiskType(pub be::U32);

impl_open_enum! {
    DiskType; be::U32::new;

    NONE = 0,
    /// Raw disk bytes followed by the footer. No allocation table.
    FIXED = 2,
    /// Sparse blocks located through the Block Allocation Table.
    DYNAMIC = 3,
    /// A dynamic image whose unallocated ranges belong to a parent image.
    DIFFERENCING = 4,
}

/// The dynamic disk header of dynamic and differencing images.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DynamicHeader {
    /// The header cookie that should match [`DynamicHeader::COOKIE`].
    pub cookie: [u8; 8],
    /// Unused, `u64::MAX` for all known images.
    pub data_offset: be::U64,
    /// Absolute file offset of the Block Allocation Table.
    pub table_offset: be::U64,
    /// The header version, `0x0001_0000` for all known images.
    pub header_version: be::U32,
    /// The number of entries in the Block Allocation Table.
    pub max_table_entries: be::U32,
    /// The size of the data part of a block in bytes, excluding its sector bitmap.
    pub block_size: be::U32,
    /// One's complement of the byte sum of this header without the checksum field.
    pub checksum: be::U32,
    /// The unique identifier of the parent image, for differencing images.
    pub parent_unique_id: [u8; 16],
    /// The modification time of the parent image, for differencing images.
    pub parent_timestamp: be::U32,
    pub reserved0: be::U32,
    /// The file name of the parent image in UTF-16BE, NUL padded.
    pub parent_unicode_name: [u8; 512],
    /// Platform-specific hints to locate the parent image.
    pub parent_locators: [ParentLocator; 8],
    pub reserved1: [u8; 256],
}

impl fmt::Debug for DynamicHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicHeader")
            .field("cookie", &format_args!("b\"{}\"", self.cookie.escape_ascii()))
            .field("data_offset", &self.data_offset.get())
            .field("table_offset", &self.table_offset.get())
            .field("header_version", &format_args!("{:#x}", self.header_version.get()))
            .field("max_table_entries", &self.max_table_entries.get())
            .field("block_size", &self.block_size.get())
            .field("checksum", &format_args!("{:#010x}", self.checksum.get()))
            .field("parent_unique_id", &self.parent_uuid())
            .field("parent_timestamp", &self.parent_timestamp.get())
            .field("parent_name", &self.parent_name())
            .field("parent_locators", &self.parent_locators().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl DynamicHeader {
    /// The expected cookie.
    pub const COOKIE: [u8; 8] = *b"cxsparse";

    /// Validate the cookie and the block size.
    pub fn validate(&self) -> Result<()> {
        if self.cookie != Self::COOKIE {
            bail!(ErrorInner::InvalidHeaderCookie(self.cookie));
        }
        let block_size = self.block_size.get();
        if block_size == 0
            || block_size % SECTOR_SIZE != 0
            || !(block_size / SECTOR_SIZE).is_power_of_two()
        {
            bail!(ErrorInner::InvalidBlockSize(block_size));
        }
        Ok(())
    }

    /// The number of sectors in the data part of a block. Always a power of two
    /// after validation.
    #[must_use]
    pub fn sectors_per_block(&self) -> u32 {
        self.block_size.get() / SECTOR_SIZE
    }

    /// The end offset of the Block Allocation Table.
    pub fn table_end(&self) -> Result<u64> {
        u64::from(self.max_table_entries.get())
            .checked_mul(4)
            .and_then(|len| self.table_offset.get().checked_add(len))
            .ok_or_else(|| ErrorInner::OffsetOverflow.into())
    }

    /// The unique identifier of the parent image.
    #[must_use]
    pub fn parent_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.parent_unique_id)
    }

    /// The decoded parent file name. Invalid UTF-16 is replaced with U+FFFD.
    #[must_use]
    pub fn parent_name(&self) -> String {
        let units = self
            .parent_unicode_name
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0);
        char::decode_utf16(units)
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }

    /// Iterate over non-empty parent locator entries.
    pub fn parent_locators(&self) -> impl Iterator<Item = &ParentLocator> + '_ {
        self.parent_locators
            .iter()
            .filter(|ent| ent.platform_code != PlatformCode::NONE)
    }
}

/// A hint for locating the parent of a differencing image.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ParentLocator {
    /// The format of the locator data.
    pub platform_code: PlatformCode,
    /// The number of sectors reserved for the locator data.
    pub data_space: be::U32,
    /// The length of the locator data in bytes.
    pub data_length: be::U32,
    pub reserved: be::U32,
    /// Absolute file offset of the locator data.
    pub data_offset: be::U64,
}

impl fmt::Debug for ParentLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParentLocator")
            .field("platform_code", &self.platform_code)
            .field("data_space", &self.data_space.get())
            .field("data_length", &self.data_length.get())
            .field("data_offset", &self.data_offset.get())
            .finish()
    }
}

/// The format of a [`ParentLocator`]'s data.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct PlatformCode(pub be::U32);

impl_open_enum! {
    PlatformCode; be::U32::new;

    /// Unused entry.
    NONE = 0,
    /// Deprecated Windows relative path.
    WI2R = 0x5769_3272,
    /// Deprecated Windows absolute path.
    WI2K = 0x5769_326B,
    /// Windows relative path in UTF-16LE.
    W2RU = 0x5732_7275,
    /// Windows absolute path in UTF-16LE.
    W2KU = 0x5732_6B75,
    /// Mac OS alias stored as a blob.
    MAC = 0x4D61_6320,
    /// Mac OS X file URL in UTF-8.
    MACX = 0x4D61_6358,
}

/// The order to probe the two footer locations in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FooterOrder {
    /// Try the copy at the start of the file first, then the trailing one.
    ///
    /// Tolerates images whose trailing footer got truncated in transport.
    #[default]
    FrontFirst,
    /// Try the trailing footer first, then the copy at the start of the file.
    BackFirst,
}

/// Parse and validate a footer from the first [`FOOTER_SIZE`] bytes of `bytes`.
pub fn parse_footer(bytes: &[u8]) -> Result<Footer> {
    let Ok((footer, _)) = Footer::read_from_prefix(bytes) else {
        bail!(ErrorInner::ShortFooter(bytes.len()));
    };
    footer.validate()?;
    Ok(footer)
}

/// Parse and validate a dynamic disk header from the first [`HEADER_SIZE`] bytes of `bytes`.
pub fn parse_dynamic_header(bytes: &[u8]) -> Result<DynamicHeader> {
    let Ok((header, _)) = DynamicHeader::read_from_prefix(bytes) else {
        bail!(ErrorInner::ShortHeader(bytes.len()));
    };
    header.validate()?;
    Ok(header)
}

/// Locate and read a valid footer, probing both ends of the stream in `order`.
///
/// `stream_len` is the total size of `rdr`. Returns the file offset the footer
/// was found at together with the footer.
///
/// A cookie mismatch moves on to the next location. A footer with a valid
/// cookie but an unsupported disk type fails immediately.
pub fn read_footer<R: ReadAt + ?Sized>(
    rdr: &R,
    stream_len: u64,
    order: FooterOrder,
) -> Result<(u64, Footer)> {
    let Some(back) = stream_len.checked_sub(FOOTER_SIZE) else {
        bail!(ErrorInner::MissingFooter);
    };
    let candidates = match order {
        FooterOrder::FrontFirst => [0, back],
        FooterOrder::BackFirst => [back, 0],
    };
    for offset in candidates {
        let mut footer = Footer::new_zeroed();
        rdr.read_exact_at(offset, footer.as_mut_bytes())?;
        match footer.validate() {
            Ok(()) => return Ok((offset, footer)),
            Err(err) if err.is_footer_cookie_mismatch() => {
                debug!("no footer at offset {offset}: {err}");
            }
            Err(err) => return Err(err),
        }
    }
    bail!(ErrorInner::MissingFooter)
}

/// Read and validate the dynamic disk header at `offset`.
pub fn read_dynamic_header<R: ReadAt + ?Sized>(rdr: &R, offset: u64) -> Result<DynamicHeader> {
    offset
        .checked_add(HEADER_SIZE)
        .ok_or(ErrorInner::OffsetOverflow)?;
    let mut header = DynamicHeader::new_zeroed();
    rdr.read_exact_at(offset, header.as_mut_bytes())?;
    header.validate()?;
    Ok(header)
}
