//! Random-access backing file of an archive

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Chunk size used when zero filling gaps.
const ZERO_CHUNK: usize = 64 * 1024;

/// Disk-backed archive storage
#[derive(Debug)]
pub struct ArchiveFile {
    file: File,
    path: PathBuf,
    writable: bool,
}

impl ArchiveFile {
    /// Open `path` for reading and writing, creating it if missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Ok(ArchiveFile {
            file,
            path: path.as_ref().to_path_buf(),
            writable: true,
        })
    }

    /// Open an existing file for reading only.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        Ok(ArchiveFile {
            file,
            path: path.as_ref().to_path_buf(),
            writable: false,
        })
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Reopen the file for writing if it was opened read-only.
    pub fn make_writable(&mut self) -> Result<()> {
        if self.writable {
            return Ok(());
        }
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.writable = true;
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read exactly `len` bytes at `offset`.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Read into `buffer` at `offset`, filling it completely.
    pub fn read_into(&mut self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buffer)?;
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Overwrite `[offset, offset + len)` with zeros.
    pub fn zero_fill(&mut self, offset: u64, len: u64) -> Result<()> {
        let zeros = [0u8; ZERO_CHUNK];
        self.file.seek(SeekFrom::Start(offset))?;
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(ZERO_CHUNK as u64) as usize;
            self.file.write_all(&zeros[..chunk])?;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    pub fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync all writes to disk
    pub fn sync(&mut self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_write_and_read_back() {
        let temp = NamedTempFile::new().unwrap();
        let mut file = ArchiveFile::open(temp.path()).unwrap();
        assert!(file.is_empty().unwrap());

        file.write_at(10, b"hello").unwrap();
        assert_eq!(file.len().unwrap(), 15);
        assert_eq!(file.read_at(10, 5).unwrap(), b"hello");
        assert_eq!(file.read_at(0, 10).unwrap(), vec![0u8; 10]);
    }

    #[test]
    fn test_zero_fill_and_truncate() {
        let temp = NamedTempFile::new().unwrap();
        let mut file = ArchiveFile::open(temp.path()).unwrap();
        file.write_at(0, &[0xFFu8; 200_000]).unwrap();
        file.zero_fill(100, 150_000).unwrap();

        let data = file.read_at(0, 200_000).unwrap();
        assert!(data[..100].iter().all(|&b| b == 0xFF));
        assert!(data[100..150_100].iter().all(|&b| b == 0));
        assert!(data[150_100..].iter().all(|&b| b == 0xFF));

        file.set_len(50).unwrap();
        assert_eq!(file.len().unwrap(), 50);
        assert!(file.read_at(40, 20).is_err());
    }

    #[test]
    fn test_read_only_until_made_writable() {
        let temp = NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), b"abc").unwrap();

        let mut file = ArchiveFile::open_read_only(temp.path()).unwrap();
        assert!(!file.is_writable());
        assert_eq!(file.read_at(0, 3).unwrap(), b"abc");
        assert!(file.write_at(0, b"x").is_err());
        file.sync().unwrap();

        file.make_writable().unwrap();
        file.write_at(0, b"x").unwrap();
        assert_eq!(file.read_at(0, 3).unwrap(), b"xbc");
    }

    #[test]
    fn test_read_only_open_does_not_create() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("missing.zip");
        assert!(ArchiveFile::open_read_only(&missing).is_err());
        assert!(!missing.exists());
    }
}
