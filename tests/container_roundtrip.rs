//! Container round trip tests
//!
//! Tests to verify that archives written by the engine, and archives written
//! by other tools, can be reopened, modified in place and read back:
//! - Entries survive close and reopen byte for byte
//! - Removed entries leave gaps that later entries reuse
//! - Data descriptors and EOCD comments from foreign writers are understood
//! - Unsupported or corrupt archives are rejected with a format error

use apkzip_rs::{CompressionMethod, EntryStatus, ZFile, ZipError};
use std::fs;
use tempfile::TempDir;

/// Helper: Assemble a single-entry stored archive by hand, the way a
/// streaming writer lays it out (sizes in a data descriptor).
fn streamed_archive(name: &str, data: &[u8], signed_descriptor: bool, comment: &[u8]) -> Vec<u8> {
    let crc = crc32fast::hash(data);
    let size = data.len() as u32;
    let mut out = Vec::new();

    // Local header, sizes deferred
    out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
    out.extend_from_slice(&10u16.to_le_bytes());
    out.extend_from_slice(&0x0008u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0x21u16.to_le_bytes());
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(data);

    // Data descriptor
    if signed_descriptor {
        out.extend_from_slice(&0x0807_4b50u32.to_le_bytes());
    }
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());

    // Central directory
    let directory_offset = out.len() as u32;
    out.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
    out.extend_from_slice(&20u16.to_le_bytes());
    out.extend_from_slice(&10u16.to_le_bytes());
    out.extend_from_slice(&0x0008u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0x21u16.to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    let directory_size = out.len() as u32 - directory_offset;

    // EOCD
    out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&directory_size.to_le_bytes());
    out.extend_from_slice(&directory_offset.to_le_bytes());
    out.extend_from_slice(&(comment.len() as u16).to_le_bytes());
    out.extend_from_slice(comment);
    out
}

#[test]
fn test_many_entries_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("many.zip");

    let mut zfile = ZFile::open(&path).unwrap();
    for i in 0..200 {
        let data = format!("entry number {}\n", i).repeat(i + 1);
        zfile.add_bytes(&format!("dir{}/file{}.txt", i % 7, i), data.as_bytes(), true).unwrap();
    }
    zfile.close().unwrap();

    let zfile = ZFile::open(&path).unwrap();
    assert_eq!(zfile.len(), 200);
    for i in 0..200 {
        let expected = format!("entry number {}\n", i).repeat(i + 1);
        let name = format!("dir{}/file{}.txt", i % 7, i);
        assert_eq!(zfile.read(&name).unwrap(), expected.as_bytes());
        assert_eq!(zfile.status(&name), Some(EntryStatus::Unchanged));
    }
}

#[test]
fn test_incremental_edits_across_sessions() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("edits.zip");

    let mut zfile = ZFile::open(&path).unwrap();
    zfile.add_bytes("keep.txt", b"kept", false).unwrap();
    zfile.add_bytes("drop.bin", &[9u8; 4096], false).unwrap();
    zfile.add_bytes("tail.txt", b"tail", false).unwrap();
    zfile.close().unwrap();
    let size_before = fs::metadata(&path).unwrap().len();

    let mut zfile = ZFile::open(&path).unwrap();
    assert!(zfile.delete("drop.bin").unwrap());
    zfile.add_bytes("small.bin", &[1u8; 1000], false).unwrap();
    zfile.add_bytes("keep.txt", b"kept, but changed", false).unwrap();
    zfile.close().unwrap();

    // The replacement entries fit in the gap left by drop.bin
    assert!(fs::metadata(&path).unwrap().len() <= size_before);

    let zfile = ZFile::open(&path).unwrap();
    let mut names = zfile.names();
    names.sort();
    assert_eq!(names, vec!["keep.txt", "small.bin", "tail.txt"]);
    assert_eq!(zfile.read("keep.txt").unwrap(), b"kept, but changed");
    assert_eq!(zfile.read("small.bin").unwrap(), vec![1u8; 1000]);
    assert_eq!(zfile.read("tail.txt").unwrap(), b"tail");
}

#[test]
fn test_stats_report_gaps() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("stats.zip");

    let mut zfile = ZFile::open(&path).unwrap();
    zfile.add_bytes("a", &[0u8; 500], false).unwrap();
    zfile.add_bytes("b", &[0u8; 500], false).unwrap();
    zfile.close().unwrap();

    let mut zfile = ZFile::open(&path).unwrap();
    zfile.delete("a").unwrap();
    zfile.update().unwrap();

    let stats = zfile.stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.gaps, 1);
    assert!(stats.free_bytes >= 500);
    assert_eq!(stats.file_size, fs::metadata(&path).unwrap().len());
}

#[test]
fn test_foreign_archive_with_data_descriptor() {
    for signed in [true, false] {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("streamed.zip");
        fs::write(&path, streamed_archive("hello.txt", b"hello", signed, b"")).unwrap();

        let mut zfile = ZFile::open(&path).unwrap();
        assert_eq!(zfile.read("hello.txt").unwrap(), b"hello");
        assert_eq!(zfile.get("hello.txt").unwrap().method(), CompressionMethod::Store);

        zfile.add_bytes("second.txt", b"second", false).unwrap();
        zfile.close().unwrap();

        let zfile = ZFile::open(&path).unwrap();
        assert_eq!(zfile.read("hello.txt").unwrap(), b"hello");
        assert_eq!(zfile.read("second.txt").unwrap(), b"second");
    }
}

#[test]
fn test_eocd_comment_survives_update() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("comment.zip");
    fs::write(&path, streamed_archive("a.txt", b"a", true, b"built by hand")).unwrap();

    let mut zfile = ZFile::open(&path).unwrap();
    zfile.add_bytes("b.txt", b"b", false).unwrap();
    zfile.close().unwrap();

    let bytes = fs::read(&path).unwrap();
    assert!(bytes.ends_with(b"built by hand"));
    assert_eq!(ZFile::open(&path).unwrap().len(), 2);
}

#[test]
fn test_zip64_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("zip64.zip");

    let mut bytes = streamed_archive("a.txt", b"a", true, b"");
    let eocd_start = bytes.len() - 22;
    let mut locator = Vec::new();
    locator.extend_from_slice(&0x0706_4b50u32.to_le_bytes());
    locator.extend_from_slice(&[0u8; 16]);
    bytes.splice(eocd_start..eocd_start, locator);
    fs::write(&path, bytes).unwrap();

    assert!(matches!(ZFile::open(&path), Err(ZipError::Format(_))));
}

#[test]
fn test_truncated_archive_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("truncated.zip");

    let mut zfile = ZFile::open(&path).unwrap();
    zfile.add_bytes("a.txt", &[5u8; 2000], false).unwrap();
    zfile.close().unwrap();

    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();
    assert!(matches!(ZFile::open(&path), Err(ZipError::Format(_))));
}

/// Helper: Write a one-entry archive and return its bytes with the offset of
/// the first central directory record.
fn single_entry_archive(path: &std::path::Path, data: &[u8], compress: bool) -> (Vec<u8>, usize) {
    let mut zfile = ZFile::open(path).unwrap();
    zfile.add_bytes("a.txt", data, compress).unwrap();
    zfile.close().unwrap();

    let bytes = fs::read(path).unwrap();
    let eocd = bytes.len() - 22;
    let directory_offset =
        u32::from_le_bytes(bytes[eocd + 16..eocd + 20].try_into().unwrap()) as usize;
    (bytes, directory_offset)
}

#[test]
fn test_local_header_past_end_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("offset.zip");
    let (pristine, record) = single_entry_archive(&path, &[5u8; 500], false);

    // Local header offset far beyond the file, then data running into the directory
    for (field, value) in [(42, 0x00FF_FFFFu32), (42, 10), (20, 600)] {
        let mut bytes = pristine.clone();
        bytes[record + field..record + field + 4].copy_from_slice(&value.to_le_bytes());
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(ZFile::open(&path), Err(ZipError::Format(_))));
    }
}

#[test]
fn test_oversized_declared_length_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bomb.zip");
    let (mut bytes, record) = single_entry_archive(&path, &[b'z'; 4000], true);

    // Uncompressed size claims 4 GiB
    bytes[record + 24..record + 28].copy_from_slice(&u32::MAX.to_le_bytes());
    fs::write(&path, &bytes).unwrap();

    let zfile = ZFile::open(&path).unwrap();
    assert_eq!(zfile.get("a.txt").unwrap().method(), CompressionMethod::Deflate);
    assert!(matches!(zfile.read("a.txt"), Err(ZipError::Format(_))));
}

#[test]
fn test_non_utf8_name_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("latin1.zip");
    let (mut bytes, record) = single_entry_archive(&path, b"data", false);

    bytes[record + 46] = 0xE9;
    fs::write(&path, &bytes).unwrap();
    match ZFile::open(&path) {
        Err(ZipError::Format(message)) => assert!(message.contains("UTF-8")),
        other => panic!("expected a format error, got {:?}", other),
    }
}
