//! Entries stored in an archive

use crate::header::{CentralDirectoryHeader, CompressionMethod, LOCAL_HEADER_FIXED_SIZE};
use crate::tracker::TrackedBytes;

/// Where an entry stands relative to the bytes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    /// Added since the last update, no previous entry with this name on disk
    New,
    /// Replaces or relocates an entry that is on disk
    Changed,
    /// Deleted since the last update
    Removed,
    /// Written and untouched since
    Unchanged,
}

/// Raw entry bytes (compressed if the entry is deflated).
#[derive(Debug)]
pub(crate) enum EntrySource {
    /// Drained from the caller and held until the next update
    Memory(TrackedBytes),
    /// Stored in the backing file at `data_offset`
    Disk { data_offset: u64 },
    /// Nothing left to read; the entry is removed
    Gone,
}

/// A named payload inside the archive.
#[derive(Debug)]
pub struct StoredEntry {
    pub(crate) header: CentralDirectoryHeader,
    pub(crate) local_extra: Vec<u8>,
    pub(crate) source: EntrySource,
    pub(crate) status: EntryStatus,
    /// Local header offset once placed
    pub(crate) offset: Option<u64>,
    /// Size of a trailing data descriptor, only for entries read from disk
    pub(crate) descriptor_size: u64,
    /// Placement order among entries waiting to be written
    pub(crate) sequence: u64,
}

impl StoredEntry {
    pub fn name(&self) -> String {
        self.header.name_str()
    }

    pub fn status(&self) -> EntryStatus {
        self.status
    }

    pub fn method(&self) -> CompressionMethod {
        self.header.method
    }

    pub fn crc32(&self) -> u32 {
        self.header.crc32
    }

    pub fn compressed_size(&self) -> u64 {
        self.header.compressed_size
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.header.uncompressed_size
    }

    pub fn header(&self) -> &CentralDirectoryHeader {
        &self.header
    }

    pub fn is_directory(&self) -> bool {
        self.header.name.ends_with(b"/")
    }

    /// Offset of the local header, `None` until the entry has been placed.
    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Offset of the first payload byte, `None` until the entry has been placed.
    pub fn data_offset(&self) -> Option<u64> {
        self.offset.map(|offset| offset + self.local_header_size())
    }

    pub fn local_header_size(&self) -> u64 {
        LOCAL_HEADER_FIXED_SIZE + self.header.name.len() as u64 + self.local_extra.len() as u64
    }

    /// Bytes the entry occupies in the file: header, payload and descriptor.
    pub fn in_file_size(&self) -> u64 {
        self.local_header_size() + self.header.compressed_size + self.descriptor_size
    }

    pub(crate) fn is_live(&self) -> bool {
        self.status != EntryStatus::Removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{DOS_EPOCH_DATE, DOS_EPOCH_TIME};

    #[test]
    fn test_sizes() {
        let mut header = CentralDirectoryHeader::new(
            "lib/x86/libfoo.so",
            CompressionMethod::Store,
            (DOS_EPOCH_TIME, DOS_EPOCH_DATE),
        );
        header.compressed_size = 100;
        header.uncompressed_size = 100;
        let entry = StoredEntry {
            header,
            local_extra: vec![0u8; 6],
            source: EntrySource::Gone,
            status: EntryStatus::New,
            offset: Some(64),
            descriptor_size: 16,
            sequence: 0,
        };
        assert_eq!(entry.local_header_size(), 30 + 17 + 6);
        assert_eq!(entry.data_offset(), Some(64 + 53));
        assert_eq!(entry.in_file_size(), 53 + 100 + 16);
        assert!(!entry.is_directory());
        assert_eq!(entry.name(), "lib/x86/libfoo.so");
    }
}
