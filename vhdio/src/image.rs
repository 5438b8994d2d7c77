//! The high-level interface for reading a VHD image.
use std::{
    fmt,
    io::{Read, Seek, SeekFrom},
    ops::Range,
    time::SystemTime,
};

use positioned_io::{ReadAt, Size};
use uuid::Uuid;

use crate::{
    BAT_UNALLOCATED, BAT_WINDOW_ENTRIES, SECTOR_SHIFT, SECTOR_SIZE,
    bat::BatCache,
    bitmap::SectorBitmap,
    error::{BoolExt, ErrorInner, OptionExt, Result, ResultExt},
    format::{self, DiskType, DynamicHeader, FOOTER_SIZE, Footer, FooterOrder, Geometry},
};

#[derive(Debug, Clone)]
pub struct Config {
    bat_window_entries: u32,
    footer_order: FooterOrder,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bat_window_entries: BAT_WINDOW_ENTRIES,
            footer_order: FooterOrder::FrontFirst,
        }
    }
}

impl Config {
    /// The maximum number of allocation table entries kept in memory.
    ///
    /// It is rounded up to a multiple of [`crate::BAT_WINDOW_ALIGN`] and capped
    /// at [`crate::MAX_BAT_WINDOW_ENTRIES`]. Each entry costs 8 bytes of memory.
    pub fn bat_window_entries(mut self, entries: u32) -> Self {
        self.bat_window_entries = entries;
        self
    }

    /// Which copy of the footer is tried first.
    pub fn footer_order(mut self, order: FooterOrder) -> Self {
        self.footer_order = order;
        self
    }
}

/// Whether a translated range holds data in this image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadStatus {
    /// The range is stored in this image.
    Data,
    /// The range is not stored in this image. It reads as zeros, or, for
    /// differencing images, should be read from the parent image.
    Unallocated,
}

/// A contiguous logical range of a single [`ReadStatus`], as returned by
/// [`Image::translate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extent {
    /// `len` bytes stored at `physical_offset` of the underlying reader.
    Data { physical_offset: u64, len: u64 },
    /// `len` bytes not stored in this image.
    Unallocated { len: u64 },
}

impl Extent {
    #[must_use]
    pub fn len(&self) -> u64 {
        match *self {
            Extent::Data { len, .. } | Extent::Unallocated { len } => len,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn status(&self) -> ReadStatus {
        match self {
            Extent::Data { .. } => ReadStatus::Data,
            Extent::Unallocated { .. } => ReadStatus::Unallocated,
        }
    }

    #[must_use]
    pub fn physical_offset(&self) -> Option<u64> {
        match *self {
            Extent::Data {
                physical_offset, ..
            } => Some(physical_offset),
            Extent::Unallocated { .. } => None,
        }
    }
}

/// State of dynamic and differencing images.
#[derive(Debug)]
struct Dynamic {
    header: DynamicHeader,
    block_size: u32,
    sectors_per_block: u32,
    /// `log2(block_size)`.
    block_shift: u32,
    /// The size of each block's bitmap on disk, in sectors.
    bitmap_sectors: u32,
    /// The end of the allocation table, where data blocks begin.
    data_block_start: u64,

    bat: BatCache,
    bitmap: SectorBitmap,
}

impl Dynamic {
    fn new(
        rdr: &(dyn ReadAt + '_),
        header: DynamicHeader,
        disk_size: u64,
        config: &Config,
    ) -> Result<Self> {
        let data_block_start = header
            .table_end()
            .context("invalid block allocation table location")?;
        let block_size = header.block_size.get();
        let sectors_per_block = header.sectors_per_block();
        let entries = header.max_table_entries.get();
        (u64::from(entries) * u64::from(block_size) >= disk_size)
            .or_context("block allocation table does not cover the disk size")?;

        let mut this = Self {
            header,
            block_size,
            sectors_per_block,
            block_shift: SECTOR_SHIFT + sectors_per_block.trailing_zeros(),
            bitmap_sectors: sectors_per_block.div_ceil(8).div_ceil(SECTOR_SIZE),
            data_block_start,
            bat: BatCache::new(header.table_offset.get(), entries, config.bat_window_entries)?,
            bitmap: SectorBitmap::new(sectors_per_block)?,
        };
        if entries != 0 {
            this.bat.ensure_loaded(rdr, 0)?;
        }
        Ok(this)
    }

    fn translate<R: ReadAt + ?Sized>(&mut self, rdr: &R, offset: u64, len: u64) -> Result<Extent> {
        if len == 0 {
            return Ok(Extent::Unallocated { len: 0 });
        }

        let block_index = offset >> self.block_shift;
        let sector_in_block = ((offset >> SECTOR_SHIFT) % u64::from(self.sectors_per_block)) as u32;
        let in_block = offset - (block_index << self.block_shift);
        let len = len.min(u64::from(self.block_size) - in_block);

        let block_index = u32::try_from(block_index).map_err(|_| ErrorInner::BlockIndex {
            index: block_index,
            entries: self.header.max_table_entries.get(),
        })?;
        self.bat.ensure_loaded(rdr, block_index)?;
        let entry = self
            .bat
            .entry(block_index)
            .context("allocation table entry is not resident")?;
        if entry == BAT_UNALLOCATED {
            trace!("block {block_index}: unallocated");
            return Ok(Extent::Unallocated { len });
        }

        let block_start = u64::from(entry) << SECTOR_SHIFT;
        self.bitmap.load_for_block(rdr, block_start)?;

        // Extend to the longest run of sectors in the same state as the first one.
        let present = self.bitmap.contains_data(sector_in_block);
        let end = in_block + len;
        let limit = end.div_ceil(u64::from(SECTOR_SIZE)) as u32;
        let run_end = self.bitmap.run_end(sector_in_block, limit, present);
        let len = (u64::from(run_end) << SECTOR_SHIFT).min(end) - in_block;

        if present {
            let data_start = block_start + (u64::from(self.bitmap_sectors) << SECTOR_SHIFT);
            Ok(Extent::Data {
                physical_offset: data_start + in_block,
                len,
            })
        } else {
            Ok(Extent::Unallocated { len })
        }
    }
}

/// An opened VHD image.
///
/// All reads take `&mut self` because the allocation table window and the
/// sector bitmap are reused across calls. Independent `Image`s over the same
/// file share nothing.
#[derive(Debug)]
pub struct Image<R: ?Sized> {
    footer: Footer,
    footer_offset: u64,
    dynamic: Option<Dynamic>,

    rdr: R,
}

impl<R: ReadAt + Size> Image<R> {
    /// Open a VHD image from a random access stream, typically a [`std::fs::File`].
    ///
    /// The footer is located, the dynamic disk header (if any) is validated,
    /// and the first window of the allocation table is loaded. On failure,
    /// nothing is kept.
    pub fn open(rdr: R) -> Result<Self> {
        Self::open_with_config(rdr, &Config::default())
    }

    /// Same as [`Image::open`] but with a non-default [`Config`].
    pub fn open_with_config(rdr: R, config: &Config) -> Result<Self> {
        let stream_len = rdr.size()?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "cannot get the size of the image reader",
            )
        })?;
        let (footer_offset, footer, dynamic) = Self::load(&rdr, stream_len, config)?;
        Ok(Self {
            footer,
            footer_offset,
            dynamic,
            rdr,
        })
    }

    fn load(
        rdr: &(dyn ReadAt + '_),
        stream_len: u64,
        config: &Config,
    ) -> Result<(u64, Footer, Option<Dynamic>)> {
        trace_time!("open image");

        let (footer_offset, footer) = format::read_footer(rdr, stream_len, config.footer_order)
            .context("failed to locate footer")?;
        trace!("footer at {footer_offset}: {footer:?}");
        let size = footer.current_size.get();

        if footer.disk_type == DiskType::FIXED {
            size.checked_add(FOOTER_SIZE)
                .is_some_and(|end| end <= stream_len)
                .or_context("fixed disk data is truncated")?;
            debug!("opened fixed image of {size} bytes");
            return Ok((footer_offset, footer, None));
        }

        let header = {
            trace_time!("read dynamic disk header");
            format::read_dynamic_header(rdr, footer.data_offset.get())
                .context("failed to read dynamic disk header")?
        };
        trace!("dynamic disk header: {header:?}");
        let dynamic = Dynamic::new(rdr, header, size, config)?;
        debug!(
            "opened {:?} image of {size} bytes, {} blocks of {} bytes",
            footer.disk_type,
            header.max_table_entries.get(),
            header.block_size.get(),
        );
        Ok((footer_offset, footer, Some(dynamic)))
    }
}

impl<R: ReadAt + ?Sized> Image<R> {
    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        let size = self.size();
        if offset.checked_add(len).is_none_or(|end| end > size) {
            bail!(ErrorInner::OutOfRange { offset, len, size });
        }
        Ok(())
    }

    /// Map the logical range `offset..offset + len` to the longest leading
    /// [`Extent`] of a single status, without reading any data.
    ///
    /// For dynamic and differencing images, the returned extent never crosses
    /// a block boundary, so callers must call again from `offset + extent.len()`
    /// for the rest. It is non-empty whenever `len` is non-zero.
    ///
    /// For fixed images, the whole range is returned as data at the same offset.
    pub fn translate(&mut self, offset: u64, len: u64) -> Result<Extent> {
        self.check_range(offset, len)?;
        match &mut self.dynamic {
            None => Ok(Extent::Data {
                physical_offset: offset,
                len,
            }),
            Some(dynamic) => dynamic.translate(&self.rdr, offset, len),
        }
    }

    /// Read from logical `offset` into a prefix of `buf`.
    ///
    /// Returns the length of the prefix handled and its status. On
    /// [`ReadStatus::Data`] the prefix is filled; on [`ReadStatus::Unallocated`]
    /// it is left untouched, and the caller decides whether to zero it or read
    /// it from a parent image. See [`Image::translate`] for the length policy.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(usize, ReadStatus)> {
        let extent = self.translate(offset, buf.len() as u64)?;
        // Never longer than the request.
        let len = extent.len() as usize;
        if let Extent::Data {
            physical_offset, ..
        } = extent
        {
            self.rdr.read_exact_at(physical_offset, &mut buf[..len])?;
        }
        Ok((len, extent.status()))
    }

    /// Fill the whole `buf` from logical `offset`, reading unallocated ranges as zeros.
    pub fn read_exact_zeroed_at(&mut self, mut offset: u64, mut buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len() as u64)?;
        while !buf.is_empty() {
            let (len, status) = self.read_at(offset, buf)?;
            debug_assert_ne!(len, 0);
            if status == ReadStatus::Unallocated {
                buf[..len].fill(0);
            }
            buf = &mut std::mem::take(&mut buf)[len..];
            offset += len as u64;
        }
        Ok(())
    }

    /// Get a [`Read`] + [`Seek`] view of the logical disk, starting at offset 0.
    pub fn reader(&mut self) -> ImageReader<'_, R> {
        ImageReader {
            image: self,
            pos: 0,
        }
    }
}

impl<R: ?Sized> Image<R> {
    /// The logical disk size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.footer.current_size.get()
    }

    /// The disk size in bytes at creation time.
    #[must_use]
    pub fn original_size(&self) -> u64 {
        self.footer.original_size.get()
    }

    /// One of [`DiskType::FIXED`], [`DiskType::DYNAMIC`] or [`DiskType::DIFFERENCING`].
    #[must_use]
    pub fn disk_type(&self) -> DiskType {
        self.footer.disk_type
    }

    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.dynamic.is_none()
    }

    #[must_use]
    pub fn is_differencing(&self) -> bool {
        self.footer.disk_type == DiskType::DIFFERENCING
    }

    /// The unique identifier of this image.
    #[must_use]
    pub fn image_id(&self) -> Uuid {
        self.footer.uuid()
    }

    /// The CHS geometry hint from the footer.
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.footer.geometry()
    }

    /// The unique identifier of the parent image, for differencing images only.
    ///
    /// Locating and opening the parent is up to the caller.
    #[must_use]
    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent_header().map(|h| h.parent_uuid())
    }

    /// The modification time of the parent image recorded at creation, for
    /// differencing images only.
    #[must_use]
    pub fn parent_timestamp(&self) -> Option<SystemTime> {
        self.parent_header()
            .map(|h| format::vhd_time(h.parent_timestamp.get()))
    }

    /// The file name of the parent image, for differencing images only.
    #[must_use]
    pub fn parent_name(&self) -> Option<String> {
        self.parent_header().map(|h| h.parent_name())
    }

    fn parent_header(&self) -> Option<&DynamicHeader> {
        self.dynamic_header().filter(|_| self.is_differencing())
    }

    /// The size of a data block in bytes, for non-fixed images.
    #[must_use]
    pub fn block_size(&self) -> Option<u32> {
        self.dynamic.as_ref().map(|d| d.block_size)
    }

    /// The file offset right after the allocation table, for non-fixed images.
    #[must_use]
    pub fn data_block_start(&self) -> Option<u64> {
        self.dynamic.as_ref().map(|d| d.data_block_start)
    }

    /// The allocation table entries currently in memory, for non-fixed images.
    #[must_use]
    pub fn bat_window(&self) -> Option<Range<u32>> {
        self.dynamic.as_ref().map(|d| d.bat.window_range())
    }

    /// The footer this image was opened with.
    #[must_use]
    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    /// The file offset the footer was found at.
    #[must_use]
    pub fn footer_offset(&self) -> u64 {
        self.footer_offset
    }

    /// The dynamic disk header, for non-fixed images.
    #[must_use]
    pub fn dynamic_header(&self) -> Option<&DynamicHeader> {
        self.dynamic.as_ref().map(|d| &d.header)
    }

    /// Get a reference to the underlying reader.
    #[must_use]
    pub fn get_ref(&self) -> &R {
        &self.rdr
    }

    /// Get a mutable reference to the underlying reader.
    #[must_use]
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.rdr
    }

    /// Release all buffers and retrieve the ownership of the underlying reader.
    pub fn close(self) -> R
    where
        R: Sized,
    {
        self.rdr
    }
}

/// A reader returned from [`Image::reader`].
///
/// Each [`Read::read`] call handles at most one [`Extent`], filling
/// unallocated ranges with zeros.
pub struct ImageReader<'a, R: ?Sized> {
    image: &'a mut Image<R>,
    pos: u64,
}

impl<R: fmt::Debug + ?Sized> fmt::Debug for ImageReader<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageReader")
            .field("pos", &self.pos)
            .field("size", &self.image.size())
            .finish_non_exhaustive()
    }
}

impl<R: ?Sized> ImageReader<'_, R> {
    /// The current logical position.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl<R: ReadAt + ?Sized> Read for ImageReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let rest = self.image.size().saturating_sub(self.pos);
        let len = usize::try_from(rest).unwrap_or(usize::MAX).min(buf.len());
        if len == 0 {
            return Ok(0);
        }
        let buf = &mut buf[..len];
        let (len, status) = self.image.read_at(self.pos, buf)?;
        if status == ReadStatus::Unallocated {
            buf[..len].fill(0);
        }
        self.pos += len as u64;
        Ok(len)
    }
}

impl<R: ?Sized> Seek for ImageReader<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(pos) => Some(pos),
            SeekFrom::End(delta) => self.image.size().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let Some(new_pos) = new_pos else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            ));
        };
        self.pos = new_pos;
        Ok(new_pos)
    }
}

impl<R: ?Sized> Size for ImageReader<'_, R> {
    fn size(&self) -> std::io::Result<Option<u64>> {
        Ok(Some(self.image.size()))
    }
}
