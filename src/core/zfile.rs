//! Incrementally updated ZIP archive
//!
//! A [`ZFile`] keeps the entry set in memory and the bytes on disk. Changes
//! are buffered until [`ZFile::update`] or [`ZFile::close`], which:
//!
//! 1. run the `before_update` extension hooks,
//! 2. release the space of removed and replaced entries and of the old
//!    central directory,
//! 3. place every new or changed entry in the first free gap that fits it
//!    (honouring the alignment rule) or after the last used byte, and write it,
//! 4. run the `entries_written` hooks (the v2 signer runs here),
//! 5. write the signing block if any, the central directory and the EOCD.
//!
//! Entries that did not change are never rewritten.

use crate::allocator::{Extent, FileUseMap};
use crate::alignment::NO_ALIGNMENT;
use crate::cache::{CachedFileContents, CachedSupplier};
use crate::codec::{read_u32_at, ByteReader};
use crate::entry::{EntrySource, EntryStatus, StoredEntry};
use crate::error::{Result, ZipError};
use crate::extension::ZFileExtension;
use crate::header::{
    dos_timestamp, CentralDirectoryHeader, CompressionMethod, Eocd, LocalHeaderTail,
    DATA_DESCRIPTOR_SIGNATURE, DOS_EPOCH_DATE, DOS_EPOCH_TIME, EOCD_FIXED_SIZE,
    FLAG_DATA_DESCRIPTOR, FLAG_UTF8, LOCAL_HEADER_FIXED_SIZE, MAX_EOCD_COMMENT_SIZE,
    SIGNING_BLOCK_MAGIC, ZIP64_LOCATOR_SIZE,
};
use crate::io::ArchiveFile;
use crate::options::ZFileOptions;
use crate::tracker::TrackedBytes;
use crate::validation::EntryName;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    BeforeUpdate,
    EntriesWritten,
}

/// Region after the entries: optional signing block, central directory, EOCD.
#[derive(Debug, Clone, Copy)]
struct Trailer {
    start: u64,
    signing_block: Option<Extent>,
    end: u64,
}

/// Statistics about an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZFileStats {
    pub entries: usize,
    pub file_size: u64,
    pub free_bytes: u64,
    pub gaps: usize,
}

/// A ZIP archive open for incremental modification.
///
/// The mutating API assumes a single writer; wrap the archive in a mutex to
/// share it across threads.
pub struct ZFile {
    path: PathBuf,
    file: Mutex<Option<ArchiveFile>>,
    options: ZFileOptions,
    entries: HashMap<String, StoredEntry>,
    map: FileUseMap,
    /// Central directory image for the current entry set
    directory: CachedSupplier<Arc<Vec<u8>>>,
    trailer: Option<Trailer>,
    eocd_comment: Vec<u8>,
    /// Ranges to release at the next update
    pending_release: Vec<Extent>,
    signing_block: Option<Vec<u8>>,
    extensions: Vec<Box<dyn ZFileExtension>>,
    closed_control: CachedFileContents<()>,
    dirty: bool,
    closed: bool,
    phase: Phase,
    next_sequence: u64,
    update_count: u64,
}

impl std::fmt::Debug for ZFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZFile")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .field("dirty", &self.dirty)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ZFile {
    /// Open or create the archive at `path` with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, ZFileOptions::default())
    }

    /// Open or create the archive at `path`.
    ///
    /// An existing non-empty file must be a readable ZIP archive; anything
    /// else is a [`ZipError::Format`] error.
    pub fn open_with<P: AsRef<Path>>(path: P, options: ZFileOptions) -> Result<Self> {
        let file = ArchiveFile::open(path.as_ref())?;
        Self::from_file(path.as_ref(), file, options)
    }

    /// Open an existing archive without write access.
    ///
    /// Nothing is created when `path` is missing. The file is reopened for
    /// writing only when an update has something to write.
    pub fn open_read_only<P: AsRef<Path>>(path: P, options: ZFileOptions) -> Result<Self> {
        let file = ArchiveFile::open_read_only(path.as_ref())?;
        Self::from_file(path.as_ref(), file, options)
    }

    fn from_file(path: &Path, mut file: ArchiveFile, options: ZFileOptions) -> Result<Self> {
        options.validate()?;
        let path = path.to_path_buf();
        let len = file.len()?;

        let mut zfile = ZFile {
            path: path.clone(),
            file: Mutex::new(None),
            options,
            entries: HashMap::new(),
            map: FileUseMap::new(len),
            directory: CachedSupplier::new(),
            trailer: None,
            eocd_comment: Vec::new(),
            pending_release: Vec::new(),
            signing_block: None,
            extensions: Vec::new(),
            closed_control: CachedFileContents::new(&path),
            dirty: false,
            closed: false,
            phase: Phase::Idle,
            next_sequence: 0,
            update_count: 0,
        };

        if len > 0 {
            zfile.read_archive(&mut file, len).map_err(|e| match e {
                ZipError::TruncatedData { needed, available } => ZipError::Format(format!(
                    "record cut short: needed {} bytes, {} available",
                    needed, available
                )),
                other => other,
            })?;
        } else {
            // An empty file still has to become a valid (empty) archive
            zfile.dirty = true;
        }
        *zfile.file.lock() = Some(file);
        zfile.closed_control.closed(None)?;

        info!(
            "Opened archive {} ({} entries, {} bytes)",
            path.display(),
            zfile.entries.len(),
            len
        );
        Ok(zfile)
    }

    fn read_archive(&mut self, file: &mut ArchiveFile, len: u64) -> Result<()> {
        let tail_len = len.min(MAX_EOCD_COMMENT_SIZE + EOCD_FIXED_SIZE + ZIP64_LOCATOR_SIZE);
        let tail_start = len - tail_len;
        let tail = file.read_at(tail_start, tail_len as usize)?;
        let (index, eocd) = Eocd::find(&tail)?;
        let eocd_start = tail_start + index as u64;

        let directory_end = eocd.directory_offset + eocd.directory_size;
        if directory_end != eocd_start {
            return Err(ZipError::Format(format!(
                "central directory [{}, {}) does not end at the EOCD ({})",
                eocd.directory_offset, directory_end, eocd_start
            )));
        }

        let directory = file.read_at(eocd.directory_offset, eocd.directory_size as usize)?;
        let mut reader = ByteReader::new(&directory);
        let mut entries_end = 0u64;

        for _ in 0..eocd.total_records {
            let header = CentralDirectoryHeader::parse(&mut reader)?;
            let name = String::from_utf8(header.name.clone()).map_err(|_| {
                ZipError::Format(format!(
                    "entry name {} is not valid UTF-8",
                    header.name_str()
                ))
            })?;
            if self.entries.contains_key(&name) {
                return Err(ZipError::Format(format!("duplicate entry {}", name)));
            }

            let overrun = |end: u64| -> Result<()> {
                if end > eocd.directory_offset {
                    return Err(ZipError::Format(format!(
                        "entry {} runs into the central directory",
                        name
                    )));
                }
                Ok(())
            };
            overrun(header.offset + LOCAL_HEADER_FIXED_SIZE)?;
            let fixed = file.read_at(header.offset, LOCAL_HEADER_FIXED_SIZE as usize)?;
            let (name_len, extra_len) = LocalHeaderTail::parse_fixed(&fixed)?;
            overrun(header.offset + LOCAL_HEADER_FIXED_SIZE + name_len + extra_len)?;
            let local_extra = file.read_at(
                header.offset + LOCAL_HEADER_FIXED_SIZE + name_len,
                extra_len as usize,
            )?;
            let tail = LocalHeaderTail {
                name_len,
                extra: local_extra,
            };
            if name_len != header.name.len() as u64 {
                return Err(ZipError::Format(format!(
                    "local header name of {} does not match the central directory",
                    name
                )));
            }

            let data_offset = header.offset + tail.size();
            let data_end = data_offset + header.compressed_size;
            overrun(data_end)?;
            let descriptor_size = if header.has_data_descriptor() {
                // The shortest descriptor has no signature
                overrun(data_end + 12)?;
                let probe = file.read_at(data_end, 4)?;
                if read_u32_at(&probe, 0)? == DATA_DESCRIPTOR_SIGNATURE {
                    16
                } else {
                    12
                }
            } else {
                0
            };

            let end = data_end + descriptor_size;
            overrun(end)?;
            self.map
                .add(header.offset, end)
                .map_err(|_| ZipError::Format(format!("entry {} overlaps another entry", name)))?;
            entries_end = entries_end.max(end);

            let sequence = self.next_sequence();
            self.entries.insert(
                name,
                StoredEntry {
                    offset: Some(header.offset),
                    header,
                    local_extra: tail.extra,
                    source: EntrySource::Disk { data_offset },
                    status: EntryStatus::Unchanged,
                    descriptor_size,
                    sequence,
                },
            );
        }

        if reader.remaining() != 0 {
            return Err(ZipError::Format(format!(
                "{} unexpected bytes after the last central directory record",
                reader.remaining()
            )));
        }

        let signing_block = find_signing_block(file, entries_end, eocd.directory_offset)?;
        let trailer_start = signing_block
            .map(|block| block.start)
            .unwrap_or(eocd.directory_offset);
        self.map.add(trailer_start, len)?;
        self.trailer = Some(Trailer {
            start: trailer_start,
            signing_block,
            end: len,
        });
        self.eocd_comment = eocd.comment;
        self.directory.precompute(Arc::new(directory));
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &ZFileOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether changes are waiting for the next update.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of updates started so far, including the one in progress.
    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    /// Look up a live entry.
    pub fn get(&self, name: &str) -> Option<&StoredEntry> {
        self.entries.get(name).filter(|entry| entry.is_live())
    }

    /// Status of `name`, including entries deleted since the last update.
    pub fn status(&self, name: &str) -> Option<EntryStatus> {
        self.entries.get(name).map(|entry| entry.status)
    }

    /// Live entries in file order; entries not yet placed come last in the
    /// order they were added.
    pub fn entries(&self) -> Vec<&StoredEntry> {
        let mut entries: Vec<&StoredEntry> =
            self.entries.values().filter(|e| e.is_live()).collect();
        entries.sort_by_key(|entry| (entry.offset.unwrap_or(u64::MAX), entry.sequence));
        entries
    }

    pub fn names(&self) -> Vec<String> {
        self.entries().into_iter().map(|entry| entry.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add or replace `name` with the contents of `source`.
    ///
    /// The source is drained before anything else happens; if reading fails
    /// the archive is left as it was. With `may_compress` the payload is
    /// deflated and kept deflated only if that makes it smaller.
    pub fn add<R: Read>(&mut self, name: &str, source: R, may_compress: bool) -> Result<()> {
        self.ensure_mutable()?;
        let name = EntryName::new(name)?;
        let data = self.options.tracker.track_stream(source)?;

        let crc32 = crc32fast::hash(&data);
        let uncompressed_size = data.len() as u64;
        let (method, raw) = if may_compress && !data.is_empty() {
            let deflated = deflate(&data, self.options.compression_level)?;
            if deflated.len() < data.len() {
                (
                    CompressionMethod::Deflate,
                    self.options.tracker.track_bytes(deflated),
                )
            } else {
                (CompressionMethod::Store, data)
            }
        } else {
            (CompressionMethod::Store, data)
        };

        let mut header = CentralDirectoryHeader::new(name.as_str(), method, self.timestamp());
        header.crc32 = crc32;
        header.compressed_size = raw.len() as u64;
        header.uncompressed_size = uncompressed_size;

        self.insert_entry(name.into_string(), header, Vec::new(), raw);
        Ok(())
    }

    /// Add `name` from an in-memory buffer.
    pub fn add_bytes(&mut self, name: &str, data: &[u8], may_compress: bool) -> Result<()> {
        self.add(name, Cursor::new(data), may_compress)
    }

    /// Add `name` with the contents of the file at `path`.
    pub fn add_file<P: AsRef<Path>>(&mut self, name: &str, path: P, may_compress: bool) -> Result<()> {
        let file = File::open(path)?;
        self.add(name, file, may_compress)
    }

    fn insert_entry(
        &mut self,
        name: String,
        mut header: CentralDirectoryHeader,
        local_extra: Vec<u8>,
        raw: TrackedBytes,
    ) {
        header.flags &= !FLAG_DATA_DESCRIPTOR;
        let status = match self.entries.get(&name) {
            None => EntryStatus::New,
            Some(previous) if previous.status == EntryStatus::New => EntryStatus::New,
            Some(_) => EntryStatus::Changed,
        };
        if let Some(previous) = self.entries.get(&name) {
            if let Some(offset) = previous.offset {
                self.pending_release
                    .push(Extent::new(offset, previous.in_file_size()));
            }
        }

        debug!("Queued {} ({:?}, {} bytes)", name, status, raw.len());
        let sequence = self.next_sequence();
        self.entries.insert(
            name,
            StoredEntry {
                header,
                local_extra,
                source: EntrySource::Memory(raw),
                status,
                offset: None,
                descriptor_size: 0,
                sequence,
            },
        );
        self.mark_dirty();
    }

    /// Delete `name`. Returns whether a live entry was found.
    pub fn delete(&mut self, name: &str) -> Result<bool> {
        self.ensure_mutable()?;
        let Some(entry) = self.entries.get_mut(name).filter(|e| e.is_live()) else {
            return Ok(false);
        };

        if let Some(offset) = entry.offset {
            let range = Extent::new(offset, entry.in_file_size());
            self.pending_release.push(range);
        }

        if entry.status == EntryStatus::New {
            self.entries.remove(name);
        } else {
            entry.status = EntryStatus::Removed;
            entry.source = EntrySource::Gone;
            entry.offset = None;
        }
        debug!("Deleted {}", name);
        self.mark_dirty();
        Ok(true)
    }

    /// Delete `name`, failing with [`ZipError::NotFound`] if it does not exist.
    pub fn delete_existing(&mut self, name: &str) -> Result<()> {
        if self.delete(name)? {
            Ok(())
        } else {
            Err(ZipError::NotFound(name.to_string()))
        }
    }

    /// Copy every entry of `other` not matched by `ignore` into this archive.
    ///
    /// Entries already present with the same CRC-32 and size are left alone.
    /// Payloads are copied as stored, without recompressing.
    pub fn merge_from<F>(&mut self, other: &ZFile, ignore: F) -> Result<()>
    where
        F: Fn(&str) -> bool,
    {
        self.merge_from_with(other, |name| {
            if ignore(name) {
                None
            } else {
                Some(name.to_string())
            }
        })
    }

    /// Like [`merge_from`](Self::merge_from), choosing the target name of each
    /// entry (or skipping it) with `rename`.
    pub fn merge_from_with<F>(&mut self, other: &ZFile, rename: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.ensure_mutable()?;
        for entry in other.entries() {
            let source_name = entry.name();
            let Some(target) = rename(&source_name) else {
                continue;
            };
            let target = EntryName::new(target)?.into_string();

            if let Some(existing) = self.get(&target) {
                if existing.crc32() == entry.crc32()
                    && existing.uncompressed_size() == entry.uncompressed_size()
                {
                    debug!("Skipping {}: identical entry already present", target);
                    continue;
                }
            }

            let raw = self.options.tracker.track_bytes(other.read_raw_entry(entry)?);
            let mut header = entry.header.clone();
            header.name = target.as_bytes().to_vec();
            header.flags = if target.is_ascii() {
                header.flags & !FLAG_UTF8
            } else {
                header.flags | FLAG_UTF8
            };
            header.offset = 0;
            let local_extra = entry.local_extra.clone();
            self.insert_entry(target, header, local_extra, raw);
        }
        Ok(())
    }

    /// Relocate every entry so they are laid out in name order.
    pub fn sort_contents(&mut self) -> Result<()> {
        self.ensure_mutable()?;
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_live())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();

        for name in &names {
            self.detach(name)?;
            let sequence = self.next_sequence();
            if let Some(entry) = self.entries.get_mut(name) {
                entry.sequence = sequence;
            }
        }
        if !names.is_empty() {
            self.mark_dirty();
        }
        Ok(())
    }

    /// Relocate stored entries whose payload is not on the boundary required
    /// by the alignment rule. Returns whether any entry moved.
    pub fn realign(&mut self) -> Result<bool> {
        self.ensure_mutable()?;
        let misaligned: Vec<String> = self
            .entries()
            .into_iter()
            .filter(|entry| entry.method() == CompressionMethod::Store)
            .filter_map(|entry| {
                let data_offset = entry.data_offset()?;
                let alignment = self.options.alignment_rule.resolve(&entry.name());
                (data_offset % u64::from(alignment) != 0).then(|| entry.name())
            })
            .collect();

        for name in &misaligned {
            debug!("Realigning {}", name);
            self.detach(name)?;
        }
        if !misaligned.is_empty() {
            self.mark_dirty();
        }
        Ok(!misaligned.is_empty())
    }

    /// Pull a placed entry back into memory so it is written again.
    fn detach(&mut self, name: &str) -> Result<()> {
        let Some(entry) = self.entries.get(name) else {
            return Ok(());
        };
        let Some(offset) = entry.offset else {
            return Ok(());
        };
        let range = Extent::new(offset, entry.in_file_size());
        let raw = self.read_raw_entry(entry)?;
        let raw = self.options.tracker.track_bytes(raw);

        if let Some(entry) = self.entries.get_mut(name) {
            entry.source = EntrySource::Memory(raw);
            entry.offset = None;
            entry.descriptor_size = 0;
            entry.header.flags &= !FLAG_DATA_DESCRIPTOR;
            if entry.status == EntryStatus::Unchanged {
                entry.status = EntryStatus::Changed;
            }
        }
        self.pending_release.push(range);
        Ok(())
    }

    /// Force the trailer to be rewritten on the next update even if no entry
    /// changed.
    pub fn touch(&mut self) -> Result<()> {
        self.ensure_mutable()?;
        self.mark_dirty();
        Ok(())
    }

    /// Uncompressed payload of `name`, CRC checked.
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let entry = self
            .get(name)
            .ok_or_else(|| ZipError::NotFound(name.to_string()))?;
        let raw = self.read_raw_entry(entry)?;
        let data = match entry.method() {
            CompressionMethod::Store => raw,
            CompressionMethod::Deflate => inflate(&raw, entry.uncompressed_size())?,
        };
        if crc32fast::hash(&data) != entry.crc32() {
            return Err(ZipError::Format(format!("CRC mismatch in {}", name)));
        }
        Ok(data)
    }

    /// Payload of `name` exactly as stored (deflated entries stay deflated).
    pub fn read_raw(&self, name: &str) -> Result<Vec<u8>> {
        let entry = self
            .get(name)
            .ok_or_else(|| ZipError::NotFound(name.to_string()))?;
        self.read_raw_entry(entry)
    }

    fn read_raw_entry(&self, entry: &StoredEntry) -> Result<Vec<u8>> {
        match &entry.source {
            EntrySource::Memory(bytes) => Ok(bytes.to_vec()),
            EntrySource::Disk { data_offset } => {
                let mut guard = self.file.lock();
                let file = guard.as_mut().ok_or(ZipError::Closed)?;
                file.read_at(*data_offset, entry.compressed_size() as usize)
            }
            EntrySource::Gone => Err(ZipError::NotFound(entry.name())),
        }
    }

    /// Read `buffer.len()` bytes of the archive file at `offset`.
    ///
    /// Meant for extensions inspecting the laid out file from
    /// `entries_written`.
    pub fn read_region(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(ZipError::Closed)?;
        file.read_into(offset, buffer)
    }

    /// Register an extension. Hooks run in registration order.
    pub fn add_extension(&mut self, extension: Box<dyn ZFileExtension>) -> Result<()> {
        self.ensure_open()?;
        self.extensions.push(extension);
        Ok(())
    }

    /// End of the last entry once the layout is frozen; this is where a
    /// signing block goes.
    pub fn entries_end(&self) -> u64 {
        self.map.used_size()
    }

    /// Whether the archive carries a signing block, on disk or about to be written.
    pub fn has_signing_block(&self) -> bool {
        self.signing_block.is_some()
            || self
                .trailer
                .is_some_and(|trailer| trailer.signing_block.is_some())
    }

    /// Splice `block` between the entries and the central directory.
    ///
    /// Only allowed from an `entries_written` hook.
    pub fn set_signing_block(&mut self, block: Vec<u8>) -> Result<()> {
        if self.phase != Phase::EntriesWritten {
            return Err(ZipError::SigningOrder(
                "a signing block can only be set once entries are written".into(),
            ));
        }
        self.signing_block = Some(block);
        Ok(())
    }

    /// Central directory image for the current entry set. Every entry must
    /// already be placed.
    pub fn central_directory_bytes(&self) -> Result<Arc<Vec<u8>>> {
        self.directory.get(|| {
            let mut out = Vec::new();
            for entry in self.entries() {
                if entry.offset.is_none() {
                    return Err(ZipError::SigningOrder(format!(
                        "central directory requested before {} was placed",
                        entry.name()
                    )));
                }
                entry.header.write(&mut out)?;
            }
            debug!("Computed central directory ({} bytes)", out.len());
            Ok(Arc::new(out))
        })
    }

    /// EOCD record for the current entry set with the directory at
    /// `directory_offset`.
    pub fn eocd_bytes(&self, directory_offset: u64) -> Result<Vec<u8>> {
        let directory = self.central_directory_bytes()?;
        Eocd {
            total_records: self.len() as u64,
            directory_size: directory.len() as u64,
            directory_offset,
            comment: self.eocd_comment.clone(),
        }
        .to_bytes()
    }

    /// Write pending changes to disk without closing.
    pub fn update(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.update_count += 1;

        self.phase = Phase::BeforeUpdate;
        let result = self.notify(|extension, zfile| extension.before_update(zfile));
        self.phase = Phase::Idle;
        result?;

        if !self.dirty {
            return Ok(());
        }
        if !self.closed_control.is_valid() {
            return Err(ZipError::ExternalModification(self.path.clone()));
        }
        if let Some(file) = self.file.lock().as_mut() {
            if !file.is_writable() {
                debug!("Reopening {} for writing", self.path.display());
                file.make_writable()?;
            }
        }
        if self.options.auto_sort {
            self.sort_contents()?;
        }

        self.release_space()?;
        let placed = self.place_entries()?;
        self.write_entries(&placed)?;

        self.phase = Phase::EntriesWritten;
        let result = self.notify(|extension, zfile| extension.entries_written(zfile));
        self.phase = Phase::Idle;
        result?;

        let file_size = self.write_trailer()?;
        self.dirty = false;
        self.closed_control.closed(None)?;
        info!(
            "Updated {}: {} entries written, {} bytes",
            self.path.display(),
            placed.len(),
            file_size
        );

        self.notify_updated()
    }

    /// Update and close. Closing a closed archive does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.update()?;

        let file = self.file.lock().take();
        if let Some(mut file) = file {
            file.sync()?;
        }
        self.closed = true;
        info!("Closed {}", self.path.display());

        self.notify(|extension, _| extension.closed())
    }

    pub fn stats(&self) -> ZFileStats {
        let gaps = self.map.free_areas();
        ZFileStats {
            entries: self.len(),
            file_size: self.map.size(),
            free_bytes: gaps.iter().map(|gap| gap.length).sum(),
            gaps: gaps.len(),
        }
    }

    fn release_space(&mut self) -> Result<()> {
        if let Some(trailer) = self.trailer.take() {
            if trailer.signing_block.is_some() {
                warn!(
                    "Dropping signing block of {}: the archive changed",
                    self.path.display()
                );
            }
            self.map.remove(trailer.start, trailer.end)?;
        }
        self.signing_block = None;

        for range in std::mem::take(&mut self.pending_release) {
            self.map.remove(range.start, range.end())?;
        }
        self.entries.retain(|_, entry| entry.is_live());
        self.map.truncate();
        Ok(())
    }

    fn place_entries(&mut self) -> Result<Vec<String>> {
        let mut pending: Vec<(u64, String)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.offset.is_none())
            .map(|(name, entry)| (entry.sequence, name.clone()))
            .collect();
        pending.sort();

        let mut placed = Vec::with_capacity(pending.len());
        for (_, name) in pending {
            let Some(entry) = self.entries.get_mut(&name) else {
                continue;
            };
            let alignment = match entry.method() {
                CompressionMethod::Store => self.options.alignment_rule.resolve(&name),
                CompressionMethod::Deflate => NO_ALIGNMENT,
            };
            let size = entry.in_file_size();
            let start = self
                .map
                .locate_free(size, entry.local_header_size(), alignment);
            let end = start + size;
            self.map.extend(end);
            self.map.add(start, end)?;

            debug!(
                "Placed {} at {} (alignment {}, {} bytes)",
                name, start, alignment, size
            );
            entry.offset = Some(start);
            entry.header.offset = start;
            placed.push(name);
        }
        self.directory.reset();
        Ok(placed)
    }

    fn write_entries(&mut self, placed: &[String]) -> Result<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(ZipError::Closed)?;

        for name in placed {
            let Some(entry) = self.entries.get_mut(name) else {
                continue;
            };
            let (Some(offset), EntrySource::Memory(raw)) = (entry.offset, &entry.source) else {
                continue;
            };
            let local_header = entry.header.local_header(&entry.local_extra)?;
            let data_offset = offset + local_header.len() as u64;
            file.write_at(offset, &local_header)?;
            file.write_at(data_offset, raw)?;

            entry.source = EntrySource::Disk { data_offset };
            entry.status = EntryStatus::Unchanged;
        }

        for gap in self.map.free_areas() {
            file.zero_fill(gap.start, gap.length)?;
        }
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<u64> {
        let start = self.map.used_size();
        let block = self.signing_block.take();
        let block_len = block.as_ref().map_or(0, |b| b.len() as u64);
        let directory_offset = start + block_len;

        let directory = self.central_directory_bytes()?;
        let eocd = self.eocd_bytes(directory_offset)?;
        let end = directory_offset + directory.len() as u64 + eocd.len() as u64;

        {
            let mut guard = self.file.lock();
            let file = guard.as_mut().ok_or(ZipError::Closed)?;
            if let Some(block) = &block {
                file.write_at(start, block)?;
            }
            file.write_at(directory_offset, &directory)?;
            file.write_at(directory_offset + directory.len() as u64, &eocd)?;
            file.set_len(end)?;
        }

        self.map.extend(end);
        self.map.add(start, end)?;
        self.trailer = Some(Trailer {
            start,
            signing_block: block.map(|b| Extent::new(start, b.len() as u64)),
            end,
        });
        Ok(end)
    }

    fn notify<F>(&mut self, mut hook: F) -> Result<()>
    where
        F: FnMut(&mut Box<dyn ZFileExtension>, &mut ZFile) -> Result<()>,
    {
        let mut extensions = std::mem::take(&mut self.extensions);
        let mut result = Ok(());
        for extension in extensions.iter_mut() {
            result = hook(extension, self);
            if result.is_err() {
                break;
            }
        }
        // Extensions registered from inside a hook go after the existing ones
        extensions.append(&mut self.extensions);
        self.extensions = extensions;
        result
    }

    fn notify_updated(&mut self) -> Result<()> {
        let mut extensions = std::mem::take(&mut self.extensions);
        let result = extensions
            .iter_mut()
            .try_for_each(|extension| extension.updated(self));
        extensions.append(&mut self.extensions);
        self.extensions = extensions;
        result
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ZipError::Closed);
        }
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.phase == Phase::EntriesWritten {
            return Err(ZipError::SigningOrder(
                "entries cannot change once the layout is frozen".into(),
            ));
        }
        Ok(())
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.directory.reset();
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    fn timestamp(&self) -> (u16, u16) {
        if self.options.no_timestamps {
            (DOS_EPOCH_TIME, DOS_EPOCH_DATE)
        } else {
            dos_timestamp(chrono::Local::now().naive_local())
        }
    }
}

/// Look for a signing block ending right before the central directory.
fn find_signing_block(
    file: &mut ArchiveFile,
    entries_end: u64,
    directory_offset: u64,
) -> Result<Option<Extent>> {
    // size (8) + magic (16) at the end, size (8) at the start
    let footer_len = 8 + SIGNING_BLOCK_MAGIC.len() as u64;
    if directory_offset < entries_end + footer_len + 8 {
        return Ok(None);
    }
    let footer = file.read_at(directory_offset - footer_len, footer_len as usize)?;
    if footer[8..] != SIGNING_BLOCK_MAGIC[..] {
        return Ok(None);
    }
    let mut size = [0u8; 8];
    size.copy_from_slice(&footer[..8]);
    let size = u64::from_le_bytes(size);

    if size < footer_len {
        warn!("Ignoring signing block footer with impossible size {}", size);
        return Ok(None);
    }
    let Some(start) = (directory_offset - 8).checked_sub(size) else {
        return Ok(None);
    };
    if start < entries_end {
        warn!("Ignoring signing block footer with impossible size {}", size);
        return Ok(None);
    }
    Ok(Some(Extent::new(start, directory_offset - start)))
}

fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn inflate(raw: &[u8], expected_size: u64) -> Result<Vec<u8>> {
    // The declared size is untrusted until the stream backs it up
    let hint = expected_size.min(raw.len() as u64 * 4);
    let mut data = Vec::with_capacity(hint as usize);
    DeflateDecoder::new(raw)
        .take(expected_size + 1)
        .read_to_end(&mut data)
        .map_err(|e| ZipError::Format(format!("corrupt deflate stream: {}", e)))?;
    if data.len() as u64 != expected_size {
        return Err(ZipError::Format(format!(
            "inflated {} bytes, expected {}",
            data.len(),
            expected_size
        )));
    }
    Ok(data)
}
