//! A sliding, aligned window over the Block Allocation Table.
use std::{fmt, ops::Range};

use positioned_io::ReadAt;
use zerocopy::{FromZeros, IntoBytes, big_endian as be};

use crate::{
    BAT_WINDOW_ALIGN, MAX_BAT_WINDOW_ENTRIES,
    error::{ErrorInner, Result, try_with_capacity},
};

/// Only a window of at most `capacity` consecutive entries is resident. The
/// window always starts at a multiple of [`BAT_WINDOW_ALIGN`].
pub(crate) struct BatCache {
    table_offset: u64,
    total_entries: u32,
    capacity: u32,
    window_start: u32,
    /// Host-order entries. Its length is the window fill.
    window: Vec<u32>,
    /// Scratch buffer for raw entries, so a failed read keeps `window` intact.
    raw_buf: Vec<be::U32>,
}

impl fmt::Debug for BatCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatCache")
            .field("table_offset", &self.table_offset)
            .field("total_entries", &self.total_entries)
            .field("window", &self.window_range())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl BatCache {
    /// Allocate an empty window. `capacity` is rounded up to a multiple of the
    /// alignment, capped at [`MAX_BAT_WINDOW_ENTRIES`], and shrunk to the table size.
    pub fn new(table_offset: u64, total_entries: u32, capacity: u32) -> Result<Self> {
        let capacity = capacity
            .min(MAX_BAT_WINDOW_ENTRIES)
            .div_ceil(BAT_WINDOW_ALIGN)
            .max(1)
            .saturating_mul(BAT_WINDOW_ALIGN)
            .min(total_entries);
        let window = try_with_capacity(capacity as usize)?;
        let raw_buf = be::U32::new_vec_zeroed(capacity as usize).map_err(|_| {
            ErrorInner::AllocationFailure {
                bytes: u64::from(capacity) * 4,
            }
        })?;
        Ok(Self {
            table_offset,
            total_entries,
            capacity,
            window_start: 0,
            window,
            raw_buf,
        })
    }

    /// The range of entry indices currently resident.
    pub fn window_range(&self) -> Range<u32> {
        self.window_start..self.window_start + self.window.len() as u32
    }

    fn contains(&self, entry_index: u32) -> bool {
        self.window_range().contains(&entry_index)
    }

    /// Make sure `entry_index` is resident, reloading the window on miss.
    pub fn ensure_loaded<R: ReadAt + ?Sized>(&mut self, rdr: &R, entry_index: u32) -> Result<()> {
        if self.contains(entry_index) {
            trace!("bat entry {entry_index}: window hit");
            return Ok(());
        }
        if entry_index >= self.total_entries {
            bail!(ErrorInner::BlockIndex {
                index: entry_index.into(),
                entries: self.total_entries,
            });
        }

        trace_time!("bat entry {entry_index}: window miss");

        let start = entry_index - entry_index % BAT_WINDOW_ALIGN;
        let fill = self.capacity.min(self.total_entries - start) as usize;
        let raw = &mut self.raw_buf[..fill];
        // The whole table range is checked against overflow on open.
        let file_offset = self.table_offset + u64::from(start) * 4;
        rdr.read_exact_at(file_offset, raw.as_mut_bytes())?;

        self.window.clear();
        self.window.extend(raw.iter().map(|ent| ent.get()));
        self.window_start = start;
        Ok(())
    }

    /// Get a resident entry, or `None` if it is outside the window.
    pub fn entry(&self, entry_index: u32) -> Option<u32> {
        let idx = entry_index.checked_sub(self.window_start)?;
        self.window.get(idx as usize).copied()
    }
}
