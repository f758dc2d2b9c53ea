//! ZIP record layouts
//!
//! Local file headers, central directory records and the end of central
//! directory record. Names, extra fields and comments are carried as raw
//! bytes and written back exactly as they were read.

use crate::codec::{read_u16_at, read_u32_at, write_u16, write_u32, ByteReader};
use crate::error::{Result, ZipError};
use chrono::{Datelike, NaiveDateTime, Timelike};

pub const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
pub const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
pub const EOCD_SIGNATURE: u32 = 0x0605_4b50;
pub const ZIP64_LOCATOR_SIGNATURE: u32 = 0x0706_4b50;
pub const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x0807_4b50;

pub const LOCAL_HEADER_FIXED_SIZE: u64 = 30;
pub const CENTRAL_HEADER_FIXED_SIZE: u64 = 46;
pub const EOCD_FIXED_SIZE: u64 = 22;
pub const ZIP64_LOCATOR_SIZE: u64 = 20;
pub const MAX_EOCD_COMMENT_SIZE: u64 = 0xFFFF;

/// Footer of an APK signing block, right before the central directory.
pub const SIGNING_BLOCK_MAGIC: [u8; 16] = *b"APK Sig Block 42";

/// Bit 0: the entry is encrypted.
pub const FLAG_ENCRYPTED: u16 = 0x0001;
/// Bit 3: sizes and CRC follow the data in a data descriptor.
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
/// Bit 11: name and comment are UTF-8.
pub const FLAG_UTF8: u16 = 0x0800;

/// Version 2.0, enough for stored and deflated entries.
pub const VERSION_DEFLATE: u16 = 20;
pub const VERSION_STORE: u16 = 10;

/// DOS date for 1980-01-01, the earliest representable day.
pub const DOS_EPOCH_DATE: u16 = (1 << 5) | 1;
pub const DOS_EPOCH_TIME: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Store,
    Deflate,
}

impl CompressionMethod {
    pub fn code(self) -> u16 {
        match self {
            CompressionMethod::Store => 0,
            CompressionMethod::Deflate => 8,
        }
    }

    pub fn from_code(code: u16) -> Result<Self> {
        match code {
            0 => Ok(CompressionMethod::Store),
            8 => Ok(CompressionMethod::Deflate),
            other => Err(ZipError::Format(format!(
                "unsupported compression method {}",
                other
            ))),
        }
    }

    pub fn version_to_extract(self) -> u16 {
        match self {
            CompressionMethod::Store => VERSION_STORE,
            CompressionMethod::Deflate => VERSION_DEFLATE,
        }
    }
}

/// Convert a timestamp to DOS `(time, date)`; years before 1980 clamp to the epoch.
pub fn dos_timestamp(when: NaiveDateTime) -> (u16, u16) {
    if when.year() < 1980 {
        return (DOS_EPOCH_TIME, DOS_EPOCH_DATE);
    }
    let year = (when.year() - 1980).min(127) as u16;
    let date = (year << 9) | ((when.month() as u16) << 5) | when.day() as u16;
    let time =
        ((when.hour() as u16) << 11) | ((when.minute() as u16) << 5) | (when.second() as u16 / 2);
    (time, date)
}

/// One record of the central directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralDirectoryHeader {
    pub version_made_by: u16,
    pub version_to_extract: u16,
    pub flags: u16,
    pub method: CompressionMethod,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub internal_attributes: u16,
    pub external_attributes: u32,
    /// Offset of the local header
    pub offset: u64,
    pub name: Vec<u8>,
    pub extra: Vec<u8>,
    pub comment: Vec<u8>,
}

impl CentralDirectoryHeader {
    /// Header for a freshly added entry; offset is filled in at placement.
    pub fn new(name: &str, method: CompressionMethod, (time, date): (u16, u16)) -> Self {
        let flags = if name.is_ascii() { 0 } else { FLAG_UTF8 };
        CentralDirectoryHeader {
            version_made_by: VERSION_DEFLATE,
            version_to_extract: method.version_to_extract(),
            flags,
            method,
            last_mod_time: time,
            last_mod_date: date,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            internal_attributes: 0,
            external_attributes: 0,
            offset: 0,
            name: name.as_bytes().to_vec(),
            extra: Vec::new(),
            comment: Vec::new(),
        }
    }

    /// Decoded name used as the lookup key.
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    pub fn has_data_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }

    pub fn parse(reader: &mut ByteReader<'_>) -> Result<Self> {
        reader.expect_u32(CENTRAL_HEADER_SIGNATURE, "central directory record")?;
        let version_made_by = reader.read_u16()?;
        let version_to_extract = reader.read_u16()?;
        let flags = reader.read_u16()?;
        let method = CompressionMethod::from_code(reader.read_u16()?)?;
        let last_mod_time = reader.read_u16()?;
        let last_mod_date = reader.read_u16()?;
        let crc32 = reader.read_u32()?;
        let compressed_size = u64::from(reader.read_u32()?);
        let uncompressed_size = u64::from(reader.read_u32()?);
        let name_len = reader.read_u16()? as usize;
        let extra_len = reader.read_u16()? as usize;
        let comment_len = reader.read_u16()? as usize;
        let disk = reader.read_u16()?;
        let internal_attributes = reader.read_u16()?;
        let external_attributes = reader.read_u32()?;
        let offset = u64::from(reader.read_u32()?);
        let name = reader.read_bytes(name_len)?.to_vec();
        let extra = reader.read_bytes(extra_len)?.to_vec();
        let comment = reader.read_bytes(comment_len)?.to_vec();

        if disk != 0 {
            return Err(ZipError::Format("multi-disk archives are not supported".into()));
        }
        if flags & FLAG_ENCRYPTED != 0 {
            return Err(ZipError::Format(format!(
                "entry {} is encrypted",
                String::from_utf8_lossy(&name)
            )));
        }
        if version_to_extract > VERSION_DEFLATE * 2 {
            return Err(ZipError::Format(format!(
                "unknown version needed to extract: {}",
                version_to_extract
            )));
        }

        Ok(CentralDirectoryHeader {
            version_made_by,
            version_to_extract,
            flags,
            method,
            last_mod_time,
            last_mod_date,
            crc32,
            compressed_size,
            uncompressed_size,
            internal_attributes,
            external_attributes,
            offset,
            name,
            extra,
            comment,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        write_u32(out, u64::from(CENTRAL_HEADER_SIGNATURE))?;
        write_u16(out, u64::from(self.version_made_by))?;
        write_u16(out, u64::from(self.version_to_extract))?;
        write_u16(out, u64::from(self.flags))?;
        write_u16(out, u64::from(self.method.code()))?;
        write_u16(out, u64::from(self.last_mod_time))?;
        write_u16(out, u64::from(self.last_mod_date))?;
        write_u32(out, u64::from(self.crc32))?;
        write_u32(out, self.compressed_size)?;
        write_u32(out, self.uncompressed_size)?;
        write_u16(out, self.name.len() as u64)?;
        write_u16(out, self.extra.len() as u64)?;
        write_u16(out, self.comment.len() as u64)?;
        write_u16(out, 0)?;
        write_u16(out, u64::from(self.internal_attributes))?;
        write_u32(out, u64::from(self.external_attributes))?;
        write_u32(out, self.offset)?;
        out.extend_from_slice(&self.name);
        out.extend_from_slice(&self.extra);
        out.extend_from_slice(&self.comment);
        Ok(())
    }

    /// Local header for this entry. Sizes are always written inline, so the
    /// data descriptor flag is dropped.
    pub fn local_header(&self, local_extra: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(
            LOCAL_HEADER_FIXED_SIZE as usize + self.name.len() + local_extra.len(),
        );
        write_u32(&mut out, u64::from(LOCAL_HEADER_SIGNATURE))?;
        write_u16(&mut out, u64::from(self.version_to_extract))?;
        write_u16(&mut out, u64::from(self.flags & !FLAG_DATA_DESCRIPTOR))?;
        write_u16(&mut out, u64::from(self.method.code()))?;
        write_u16(&mut out, u64::from(self.last_mod_time))?;
        write_u16(&mut out, u64::from(self.last_mod_date))?;
        write_u32(&mut out, u64::from(self.crc32))?;
        write_u32(&mut out, self.compressed_size)?;
        write_u32(&mut out, self.uncompressed_size)?;
        write_u16(&mut out, self.name.len() as u64)?;
        write_u16(&mut out, local_extra.len() as u64)?;
        out.extend_from_slice(&self.name);
        out.extend_from_slice(local_extra);
        Ok(out)
    }
}

/// Variable part of a local header, read back when opening an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHeaderTail {
    pub name_len: u64,
    pub extra: Vec<u8>,
}

impl LocalHeaderTail {
    /// Parse the 30 fixed bytes of a local header; the extra field is read separately.
    pub fn parse_fixed(fixed: &[u8]) -> Result<(u64, u64)> {
        let mut reader = ByteReader::new(fixed);
        reader.expect_u32(LOCAL_HEADER_SIGNATURE, "local file header")?;
        reader.skip(22)?;
        let name_len = u64::from(reader.read_u16()?);
        let extra_len = u64::from(reader.read_u16()?);
        Ok((name_len, extra_len))
    }

    pub fn size(&self) -> u64 {
        LOCAL_HEADER_FIXED_SIZE + self.name_len + self.extra.len() as u64
    }
}

/// End of central directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eocd {
    pub total_records: u64,
    pub directory_size: u64,
    pub directory_offset: u64,
    pub comment: Vec<u8>,
}

/// Offset of the central directory start field inside the EOCD record.
pub const EOCD_DIRECTORY_OFFSET_FIELD: usize = 16;

impl Eocd {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        reader.expect_u32(EOCD_SIGNATURE, "end of central directory")?;
        let disk = reader.read_u16()?;
        let directory_disk = reader.read_u16()?;
        let records_on_disk = reader.read_u16()?;
        let total_records = reader.read_u16()?;
        let directory_size = u64::from(reader.read_u32()?);
        let directory_offset = u64::from(reader.read_u32()?);
        let comment_len = reader.read_u16()? as usize;
        let comment = reader.read_bytes(comment_len)?.to_vec();

        if disk != 0 || directory_disk != 0 {
            return Err(ZipError::Format("multi-disk archives are not supported".into()));
        }
        if records_on_disk != total_records {
            return Err(ZipError::Format(format!(
                "record count mismatch: {} on disk, {} total",
                records_on_disk, total_records
            )));
        }

        Ok(Eocd {
            total_records: u64::from(total_records),
            directory_size,
            directory_offset,
            comment,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(EOCD_FIXED_SIZE as usize + self.comment.len());
        write_u32(&mut out, u64::from(EOCD_SIGNATURE))?;
        write_u16(&mut out, 0)?;
        write_u16(&mut out, 0)?;
        write_u16(&mut out, self.total_records)?;
        write_u16(&mut out, self.total_records)?;
        write_u32(&mut out, self.directory_size)?;
        write_u32(&mut out, self.directory_offset)?;
        write_u16(&mut out, self.comment.len() as u64)?;
        out.extend_from_slice(&self.comment);
        Ok(out)
    }

    /// Locate the EOCD in `tail`, the last bytes of a file.
    ///
    /// The record must end exactly at the end of `tail` (its comment length
    /// accounts for every byte after it). Returns the record's index inside
    /// `tail`. A ZIP64 locator right before the record is rejected.
    pub fn find(tail: &[u8]) -> Result<(usize, Eocd)> {
        let fixed = EOCD_FIXED_SIZE as usize;
        if tail.len() < fixed {
            return Err(ZipError::Format("file too short to be a zip archive".into()));
        }

        for start in (0..=tail.len() - fixed).rev() {
            if read_u32_at(tail, start)? != EOCD_SIGNATURE {
                continue;
            }
            let comment_len = read_u16_at(tail, start + 20)? as usize;
            if start + fixed + comment_len != tail.len() {
                continue;
            }

            let zip64_locator = ZIP64_LOCATOR_SIZE as usize;
            if start >= zip64_locator
                && read_u32_at(tail, start - zip64_locator)? == ZIP64_LOCATOR_SIGNATURE
            {
                return Err(ZipError::Format("zip64 archives are not supported".into()));
            }

            return Ok((start, Eocd::parse(&tail[start..])?));
        }

        Err(ZipError::Format("end of central directory not found".into()))
    }
}
