//! Byte-granular map of used and free space in the archive file
//!
//! Free ranges are kept in a B-tree keyed by start offset and coalesced on
//! every release, so the map stays as small as the fragmentation of the file.
//! Free space that reaches the end of the file is "trailing" and is never
//! handed out as a reusable gap; placing past it simply appends.

use crate::alignment::padding_for;
use crate::error::{Result, ZipError};
use std::collections::BTreeMap;

/// A contiguous byte range `[start, start + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start: u64,
    pub length: u64,
}

impl Extent {
    pub fn new(start: u64, length: u64) -> Self {
        Extent { start, length }
    }

    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Check if this extent is adjacent to another (can be coalesced)
    pub fn is_adjacent(&self, other: &Extent) -> bool {
        self.end() == other.start || other.end() == self.start
    }

    /// Coalesce two adjacent extents
    pub fn coalesce(&self, other: &Extent) -> Option<Extent> {
        if !self.is_adjacent(other) {
            return None;
        }
        let start = self.start.min(other.start);
        let end = self.end().max(other.end());
        Some(Extent::new(start, end - start))
    }
}

/// Tracks which byte ranges of the archive file hold data.
#[derive(Debug, Clone, Default)]
pub struct FileUseMap {
    /// Free extents indexed by start offset
    free_extents: BTreeMap<u64, Extent>,

    /// Size of the file being tracked
    size: u64,
}

impl FileUseMap {
    /// A map of `size` bytes, all free.
    pub fn new(size: u64) -> Self {
        let mut free_extents = BTreeMap::new();
        if size > 0 {
            free_extents.insert(0, Extent::new(0, size));
        }
        FileUseMap { free_extents, size }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset just past the last used byte.
    pub fn used_size(&self) -> u64 {
        match self.trailing() {
            Some(trailing) => trailing.start,
            None => self.size,
        }
    }

    /// Mark `[start, end)` as used. The range must currently be free.
    pub fn add(&mut self, start: u64, end: u64) -> Result<()> {
        if start >= end {
            return Ok(());
        }
        if end > self.size {
            return Err(ZipError::Format(format!(
                "range [{}, {}) beyond tracked size {}",
                start, end, self.size
            )));
        }

        let container = self
            .free_extents
            .range(..=start)
            .next_back()
            .map(|(_, extent)| *extent)
            .filter(|extent| extent.end() >= end)
            .ok_or_else(|| {
                ZipError::Format(format!("range [{}, {}) overlaps used space", start, end))
            })?;

        self.free_extents.remove(&container.start);
        if start > container.start {
            self.free_extents.insert(
                container.start,
                Extent::new(container.start, start - container.start),
            );
        }
        if container.end() > end {
            self.free_extents
                .insert(end, Extent::new(end, container.end() - end));
        }
        Ok(())
    }

    /// Release `[start, end)`. The range must currently be used.
    pub fn remove(&mut self, start: u64, end: u64) -> Result<()> {
        if start >= end {
            return Ok(());
        }
        if end > self.size {
            return Err(ZipError::Format(format!(
                "range [{}, {}) beyond tracked size {}",
                start, end, self.size
            )));
        }
        let overlaps = self
            .free_extents
            .range(..end)
            .next_back()
            .is_some_and(|(_, extent)| extent.end() > start);
        if overlaps {
            return Err(ZipError::Format(format!(
                "range [{}, {}) is already free",
                start, end
            )));
        }

        self.insert_and_coalesce(Extent::new(start, end - start));
        Ok(())
    }

    /// Grow the tracked size; the new bytes are free.
    pub fn extend(&mut self, new_size: u64) {
        if new_size <= self.size {
            return;
        }
        let added = Extent::new(self.size, new_size - self.size);
        self.size = new_size;
        self.insert_and_coalesce(added);
    }

    /// Drop trailing free space.
    pub fn truncate(&mut self) {
        if let Some(trailing) = self.trailing() {
            self.free_extents.remove(&trailing.start);
            self.size = trailing.start;
        }
    }

    /// Find where `size` bytes can go so that `start + align_offset` is a
    /// multiple of `alignment`.
    ///
    /// Gaps are scanned first-fit in file order; when none is large enough the
    /// block goes after the last used byte. The returned offset may be past
    /// [`size`](Self::size), in which case the caller must [`extend`](Self::extend).
    pub fn locate_free(&self, size: u64, align_offset: u64, alignment: u32) -> u64 {
        for extent in self.free_areas() {
            let padding = padding_for(extent.start + align_offset, alignment);
            if padding + size <= extent.length {
                return extent.start + padding;
            }
        }

        let start = self.used_size();
        start + padding_for(start + align_offset, alignment)
    }

    /// Free gaps between used ranges, in file order. Trailing space is excluded.
    pub fn free_areas(&self) -> Vec<Extent> {
        let size = self.size;
        self.free_extents
            .values()
            .filter(|extent| extent.end() != size)
            .copied()
            .collect()
    }

    /// Check if `offset` falls in used space
    pub fn is_used(&self, offset: u64) -> bool {
        if offset >= self.size {
            return false;
        }
        !self
            .free_extents
            .range(..=offset)
            .next_back()
            .is_some_and(|(_, extent)| extent.end() > offset)
    }

    /// Get current number of free extents (fragmentation indicator)
    pub fn extent_count(&self) -> usize {
        self.free_extents.len()
    }

    fn trailing(&self) -> Option<Extent> {
        self.free_extents
            .values()
            .next_back()
            .copied()
            .filter(|extent| extent.end() == self.size)
    }

    /// Insert a free extent and coalesce with adjacent extents
    fn insert_and_coalesce(&mut self, mut extent: Extent) {
        if let Some((&prev_start, prev)) = self.free_extents.range(..extent.start).next_back() {
            if let Some(merged) = prev.coalesce(&extent) {
                extent = merged;
                self.free_extents.remove(&prev_start);
            }
        }

        if let Some((&next_start, next)) = self.free_extents.range(extent.end()..).next() {
            if let Some(merged) = extent.coalesce(next) {
                extent = merged;
                self.free_extents.remove(&next_start);
            }
        }

        self.free_extents.insert(extent.start, extent);
    }
}
