//! Little-endian fixed width integer codec
//!
//! Every ZIP record is a sequence of 2 and 4 byte little-endian fields. Reads
//! are bounds checked against the available bytes and writes are range checked
//! against the width of the field, so a corrupt length or an oversized value
//! surfaces as an error rather than as silently wrapped data.

use crate::error::{Result, ZipError};

/// Largest value a 2 byte field can hold.
pub const MAX_U16: u64 = 0xFFFF;

/// Largest value a 4 byte field can hold.
pub const MAX_U32: u64 = 0xFFFF_FFFF;

/// Cursor over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteReader { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Take the next `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ZipError::TruncatedData {
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let raw = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let raw = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let raw = self.read_bytes(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Read a 4 byte length followed by that many bytes.
    pub fn read_length_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    /// Read a 4 byte field that must hold `expected`, typically a record signature.
    pub fn expect_u32(&mut self, expected: u32, what: &str) -> Result<()> {
        let found = self.read_u32()?;
        if found != expected {
            return Err(ZipError::Format(format!(
                "{}: expected 0x{:08x}, found 0x{:08x}",
                what, expected, found
            )));
        }
        Ok(())
    }
}

/// Read a 2 byte field at `offset`.
pub fn read_u16_at(bytes: &[u8], offset: usize) -> Result<u16> {
    let available = bytes.len().saturating_sub(offset);
    if available < 2 {
        return Err(ZipError::TruncatedData {
            needed: 2,
            available,
        });
    }
    Ok(u16::from_le_bytes([bytes[offset], bytes[offset + 1]]))
}

/// Read a 4 byte field at `offset`.
pub fn read_u32_at(bytes: &[u8], offset: usize) -> Result<u32> {
    let available = bytes.len().saturating_sub(offset);
    if available < 4 {
        return Err(ZipError::TruncatedData {
            needed: 4,
            available,
        });
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    Ok(u32::from_le_bytes(raw))
}

/// Append `value` as a 2 byte field.
pub fn write_u16(out: &mut Vec<u8>, value: u64) -> Result<()> {
    if value > MAX_U16 {
        return Err(ZipError::Range {
            value,
            max: MAX_U16,
        });
    }
    out.extend_from_slice(&(value as u16).to_le_bytes());
    Ok(())
}

/// Append `value` as a 4 byte field.
pub fn write_u32(out: &mut Vec<u8>, value: u64) -> Result<()> {
    if value > MAX_U32 {
        return Err(ZipError::Range {
            value,
            max: MAX_U32,
        });
    }
    out.extend_from_slice(&(value as u32).to_le_bytes());
    Ok(())
}

/// Append `value` as an 8 byte field.
pub fn write_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Append `data` preceded by its length as a 4 byte field.
pub fn write_length_prefixed(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    write_u32(out, data.len() as u64)?;
    out.extend_from_slice(data);
    Ok(())
}

/// Overwrite a 4 byte field in place.
pub fn patch_u32(bytes: &mut [u8], offset: usize, value: u64) -> Result<()> {
    if value > MAX_U32 {
        return Err(ZipError::Range {
            value,
            max: MAX_U32,
        });
    }
    let available = bytes.len().saturating_sub(offset);
    if available < 4 {
        return Err(ZipError::TruncatedData {
            needed: 4,
            available,
        });
    }
    bytes[offset..offset + 4].copy_from_slice(&(value as u32).to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_little_endian() {
        let bytes = [0x50, 0x4b, 0x03, 0x04, 0x0a, 0x00];
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_u32().unwrap(), 0x04034b50);
        assert_eq!(reader.read_u16().unwrap(), 10);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_full_unsigned_range() {
        let mut out = Vec::new();
        write_u16(&mut out, MAX_U16).unwrap();
        write_u32(&mut out, MAX_U32).unwrap();
        assert_eq!(read_u16_at(&out, 0).unwrap(), u16::MAX);
        assert_eq!(read_u32_at(&out, 2).unwrap(), u32::MAX);
    }

    #[test]
    fn test_truncated_read() {
        let bytes = [0x01, 0x02, 0x03];
        let mut reader = ByteReader::new(&bytes);
        match reader.read_u32() {
            Err(ZipError::TruncatedData { needed, available }) => {
                assert_eq!(needed, 4);
                assert_eq!(available, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        // A failed read does not move the cursor
        assert_eq!(reader.position(), 0);
        assert!(read_u16_at(&bytes, 2).is_err());
    }

    #[test]
    fn test_range_checked_write() {
        let mut out = Vec::new();
        assert!(matches!(
            write_u16(&mut out, 0x1_0000),
            Err(ZipError::Range { .. })
        ));
        assert!(matches!(
            write_u32(&mut out, 0x1_0000_0000),
            Err(ZipError::Range { .. })
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_expect_signature() {
        let bytes = 0x06054b50u32.to_le_bytes();
        assert!(ByteReader::new(&bytes).expect_u32(0x06054b50, "eocd").is_ok());
        assert!(matches!(
            ByteReader::new(&bytes).expect_u32(0x02014b50, "cdr"),
            Err(ZipError::Format(_))
        ));
    }

    #[test]
    fn test_length_prefixed() {
        let mut out = Vec::new();
        write_length_prefixed(&mut out, b"abc").unwrap();
        write_u64(&mut out, 7);
        let mut reader = ByteReader::new(&out);
        assert_eq!(reader.read_length_prefixed().unwrap(), b"abc");
        assert_eq!(reader.read_u64().unwrap(), 7);

        // Declared length larger than what follows
        let bogus = [9u8, 0, 0, 0, 1, 2];
        assert!(matches!(
            ByteReader::new(&bogus).read_length_prefixed(),
            Err(ZipError::TruncatedData { needed: 9, available: 2 })
        ));
    }

    #[test]
    fn test_patch_in_place() {
        let mut bytes = vec![0u8; 8];
        patch_u32(&mut bytes, 4, 0xdeadbeef).unwrap();
        assert_eq!(read_u32_at(&bytes, 4).unwrap(), 0xdeadbeef);
        assert!(patch_u32(&mut bytes, 6, 1).is_err());
    }
}
