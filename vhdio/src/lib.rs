//! A library for reading Virtual Hard Disk (VHD) images as flat byte streams.
//!
//! A VHD image is either *fixed* (raw disk bytes followed by a 512-byte
//! footer), *dynamic* (sparse blocks located through a Block Allocation
//! Table), or *differencing* (a dynamic image whose unallocated ranges are to
//! be read from a parent image). [`Image`] hides these layouts behind a
//! random-access read API over logical disk offsets.
//!
//! ```
//! use vhdio::{Image, ReadStatus};
//!
//! # fn work() -> vhdio::Result<()> {
//! let file = std::fs::File::open("disk.vhd")?;
//! let mut image = Image::open(file)?;
//! let mut buf = vec![0u8; 4096];
//! let (len, status) = image.read_at(0, &mut buf)?;
//! if status == ReadStatus::Unallocated {
//!     // Substitute zeros, or read from the parent of a differencing disk.
//!     buf[..len].fill(0);
//! }
//! # Ok(()) }
//! ```
//!
//! Use [`Image::reader`] for a [`std::io::Read`] + [`std::io::Seek`] view
//! which zero-fills unallocated ranges automatically.
//!
//! See also:
//! [Virtual Hard Disk Image Format Specification](https://learn.microsoft.com/en-us/windows/win32/vstor/about-vhd)

#[cfg(feature = "log")]
#[macro_use(trace_time)]
extern crate measure_time;

#[cfg(feature = "log")]
#[macro_use(trace, debug)]
extern crate log;

#[cfg(not(feature = "log"))]
#[macro_use]
mod macros {
    macro_rules! trace {
        ($($tt:tt)*) => {
            let _ = if false {
                let _ = ::std::format_args!($($tt)*);
            };
        };
    }

    macro_rules! debug {
        ($($tt:tt)*) => {
            trace!($($tt)*)
        };
    }

    macro_rules! trace_time {
        ($($tt:tt)*) => {
            trace!($($tt)*)
        };
    }
}

macro_rules! bail {
    ($err:expr $(,)?) => {
        return Err(Into::into($err))
    };
}

mod bat;
mod bitmap;
mod error;
pub mod format;
pub mod image;

pub use positioned_io;
pub use uuid::Uuid;
pub use zerocopy;

pub use error::{Error, ErrorKind, Result};
pub use image::{Config, Extent, Image, ImageReader, ReadStatus};

/// The addressing unit of VHD images, in bytes.
pub const SECTOR_SIZE: u32 = 512;

/// `log2(SECTOR_SIZE)`.
pub const SECTOR_SHIFT: u32 = 9;

/// The default number of BAT entries kept resident per image.
///
/// Each entry takes 4 bytes in memory, so the default window costs 4KiB and
/// covers 2GiB of disk with the common 2MiB block size.
pub const BAT_WINDOW_ENTRIES: u32 = 1024;

/// The upper bound of [`Config::bat_window_entries`]. The window then takes
/// 4MiB, plus the same again for the read buffer.
pub const MAX_BAT_WINDOW_ENTRIES: u32 = 1 << 20;

/// The BAT window always starts at a multiple of this many entries.
pub const BAT_WINDOW_ALIGN: u32 = 512;

/// The BAT entry value of a block which has never been allocated.
pub const BAT_UNALLOCATED: u32 = u32::MAX;
