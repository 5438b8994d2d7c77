//! The per-block sector presence bitmap.
use std::fmt;

use positioned_io::ReadAt;

use crate::error::{Result, try_with_capacity};

/// Bitmap of the block currently being read. Bit `i`, counted from the most
/// significant bit of each byte, is set iff sector `i` of the block holds data.
pub(crate) struct SectorBitmap {
    bytes: Vec<u8>,
    /// File offset of the block whose bitmap is in `bytes`, if any.
    block_start: Option<u64>,
}

impl fmt::Debug for SectorBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectorBitmap")
            .field("len", &self.bytes.len())
            .field("block_start", &self.block_start)
            .finish()
    }
}

impl SectorBitmap {
    pub fn new(sectors_per_block: u32) -> Result<Self> {
        let len = sectors_per_block.div_ceil(8) as usize;
        let mut bytes = try_with_capacity(len)?;
        bytes.resize(len, 0);
        Ok(Self {
            bytes,
            block_start: None,
        })
    }

    /// Load the bitmap at the start of the block at `block_start`, unless it
    /// is already the current one.
    pub fn load_for_block<R: ReadAt + ?Sized>(&mut self, rdr: &R, block_start: u64) -> Result<()> {
        if self.block_start == Some(block_start) {
            trace!("bitmap at {block_start}: hit");
            return Ok(());
        }
        trace!("bitmap at {block_start}: load");
        // Forget the previous block first, so a failed read is retried.
        self.block_start = None;
        rdr.read_exact_at(block_start, &mut self.bytes)?;
        self.block_start = Some(block_start);
        Ok(())
    }

    pub fn contains_data(&self, sector: u32) -> bool {
        self.bytes
            .get((sector / 8) as usize)
            .is_some_and(|b| b & (0x80 >> (sector % 8)) != 0)
    }

    /// Find the first sector in `first..limit` whose presence differs from
    /// `present`, or `limit` if there is none.
    pub fn run_end(&self, first: u32, limit: u32, present: bool) -> u32 {
        (first..limit)
            .find(|&sector| self.contains_data(sector) != present)
            .unwrap_or(limit)
    }
}
