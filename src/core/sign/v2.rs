//! v2 (whole file) signing
//!
//! The signing block sits between the last entry and the central directory:
//!
//! ```text
//! u64 size | (u64 len, u32 id, value)* | u64 size | "APK Sig Block 42"
//! ```
//!
//! `size` counts everything after the first size field. The v2 value signs a
//! chunked SHA-256 over three sections of the file: everything before the
//! block, the central directory, and the EOCD with its directory offset
//! replaced by the block start. Each section is cut into 1 MiB chunks, every
//! chunk is digested as `0xa5 | u32 len | chunk`, and the top level digest is
//! taken over `0x5a | u32 chunk count | chunk digests`.

use super::v1::parse_public_key;
use crate::codec::{patch_u32, write_length_prefixed, write_u32, write_u64, ByteReader};
use crate::error::{Result, ZipError};
use crate::extension::ZFileExtension;
use crate::header::{
    Eocd, EOCD_DIRECTORY_OFFSET_FIELD, EOCD_FIXED_SIZE, MAX_EOCD_COMMENT_SIZE,
    SIGNING_BLOCK_MAGIC, ZIP64_LOCATOR_SIZE,
};
use crate::zfile::ZFile;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

/// ID of the v2 signature pair in the signing block.
pub const APK_SIGNATURE_SCHEME_V2_BLOCK_ID: u32 = 0x7109_871a;

/// Signature algorithm ID written for Ed25519 over a SHA-256 content digest.
/// Not one of the IDs assigned for RSA/DSA/ECDSA signers.
pub const ED25519_WITH_SHA256: u32 = 0x0901;

const CHUNK_SIZE: usize = 1 << 20;
const CHUNK_PREFIX: u8 = 0xa5;
const TOP_LEVEL_PREFIX: u8 = 0x5a;

/// Chunked SHA-256 accumulator.
#[derive(Debug, Default)]
pub struct ChunkedDigest {
    chunk_digests: Vec<[u8; 32]>,
}

impl ChunkedDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Digest one chunk of at most 1 MiB.
    fn update_chunk(&mut self, chunk: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update([CHUNK_PREFIX]);
        hasher.update((chunk.len() as u32).to_le_bytes());
        hasher.update(chunk);
        self.chunk_digests.push(hasher.finalize().into());
    }

    /// Digest a whole section held in memory.
    pub fn update_section(&mut self, section: &[u8]) {
        for chunk in section.chunks(CHUNK_SIZE) {
            self.update_chunk(chunk);
        }
    }

    pub fn finish(self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update([TOP_LEVEL_PREFIX]);
        hasher.update((self.chunk_digests.len() as u32).to_le_bytes());
        for digest in &self.chunk_digests {
            hasher.update(digest);
        }
        hasher.finalize().into()
    }
}

/// Adds a v2 signing block on every update.
pub struct ApkSignatureV2Extension {
    key: SigningKey,
}

impl std::fmt::Debug for ApkSignatureV2Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApkSignatureV2Extension")
            .field("public_key", &self.key.verifying_key())
            .finish()
    }
}

impl ApkSignatureV2Extension {
    pub fn new(key: SigningKey) -> Self {
        ApkSignatureV2Extension { key }
    }

    fn content_digest(&self, zfile: &ZFile) -> Result<[u8; 32]> {
        let entries_end = zfile.entries_end();
        let directory = zfile.central_directory_bytes()?;
        let eocd = zfile.eocd_bytes(entries_end)?;

        let mut digest = ChunkedDigest::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut offset = 0u64;
        while offset < entries_end {
            let len = (entries_end - offset).min(CHUNK_SIZE as u64) as usize;
            zfile.read_region(offset, &mut buffer[..len])?;
            digest.update_chunk(&buffer[..len]);
            offset += len as u64;
        }
        digest.update_section(&directory);
        digest.update_section(&eocd);
        Ok(digest.finish())
    }
}

impl ZFileExtension for ApkSignatureV2Extension {
    fn before_update(&mut self, zfile: &mut ZFile) -> Result<()> {
        // An unsigned archive needs its trailer rewritten even with no changes
        if !zfile.has_signing_block() {
            zfile.touch()?;
        }
        Ok(())
    }

    fn entries_written(&mut self, zfile: &mut ZFile) -> Result<()> {
        let digest = self.content_digest(zfile)?;
        let block = signing_block(&self.key, &digest)?;
        debug!(
            "Signing block of {} bytes at {}",
            block.len(),
            zfile.entries_end()
        );
        zfile.set_signing_block(block)
    }
}

fn signer_record(key: &SigningKey, digest: &[u8]) -> Result<Vec<u8>> {
    let public_key = key.verifying_key();

    let mut digest_record = Vec::new();
    write_u32(&mut digest_record, u64::from(ED25519_WITH_SHA256))?;
    write_length_prefixed(&mut digest_record, digest)?;
    let mut digests = Vec::new();
    write_length_prefixed(&mut digests, &digest_record)?;

    let mut certificates = Vec::new();
    write_length_prefixed(&mut certificates, public_key.as_bytes())?;

    let mut signed_data = Vec::new();
    write_length_prefixed(&mut signed_data, &digests)?;
    write_length_prefixed(&mut signed_data, &certificates)?;
    write_length_prefixed(&mut signed_data, &[])?;

    let signature = key.sign(&signed_data);
    let mut signature_record = Vec::new();
    write_u32(&mut signature_record, u64::from(ED25519_WITH_SHA256))?;
    write_length_prefixed(&mut signature_record, &signature.to_bytes())?;
    let mut signatures = Vec::new();
    write_length_prefixed(&mut signatures, &signature_record)?;

    let mut signer = Vec::new();
    write_length_prefixed(&mut signer, &signed_data)?;
    write_length_prefixed(&mut signer, &signatures)?;
    write_length_prefixed(&mut signer, public_key.as_bytes())?;
    Ok(signer)
}

/// Complete signing block carrying one v2 signer.
pub fn signing_block(key: &SigningKey, digest: &[u8]) -> Result<Vec<u8>> {
    let signer = signer_record(key, digest)?;
    let mut signers = Vec::new();
    write_length_prefixed(&mut signers, &signer)?;
    let mut value = Vec::new();
    write_length_prefixed(&mut value, &signers)?;

    let mut pairs = Vec::new();
    write_u64(&mut pairs, 4 + value.len() as u64);
    write_u32(&mut pairs, u64::from(APK_SIGNATURE_SCHEME_V2_BLOCK_ID))?;
    pairs.extend_from_slice(&value);

    let size = (pairs.len() + 8 + SIGNING_BLOCK_MAGIC.len()) as u64;
    let mut block = Vec::with_capacity(size as usize + 8);
    write_u64(&mut block, size);
    block.extend_from_slice(&pairs);
    write_u64(&mut block, size);
    block.extend_from_slice(&SIGNING_BLOCK_MAGIC);
    Ok(block)
}

/// Check the v2 signature of the archive at `path` and return the key that
/// made it.
pub fn verify_v2<P: AsRef<Path>>(path: P) -> Result<VerifyingKey> {
    let bytes = std::fs::read(path.as_ref())?;
    let len = bytes.len() as u64;
    let tail_start = len.saturating_sub(MAX_EOCD_COMMENT_SIZE + EOCD_FIXED_SIZE + ZIP64_LOCATOR_SIZE);
    let (index, eocd) = Eocd::find(&bytes[tail_start as usize..])?;
    let eocd_start = tail_start as usize + index;
    let directory_offset = eocd.directory_offset as usize;
    if directory_offset > eocd_start {
        return Err(ZipError::Format("central directory starts after the EOCD".into()));
    }

    let footer_len = 8 + SIGNING_BLOCK_MAGIC.len();
    if directory_offset < footer_len + 8
        || bytes[directory_offset - SIGNING_BLOCK_MAGIC.len()..directory_offset]
            != SIGNING_BLOCK_MAGIC[..]
    {
        return Err(ZipError::Signing("no signing block".into()));
    }
    let size = ByteReader::new(&bytes[directory_offset - footer_len..]).read_u64()?;
    if size < footer_len as u64 {
        return Err(ZipError::Signing(format!("signing block size {} too small", size)));
    }
    let block_start = (directory_offset as u64 - 8)
        .checked_sub(size)
        .ok_or_else(|| ZipError::Signing(format!("signing block size {} too large", size)))?
        as usize;
    let mut reader = ByteReader::new(&bytes[block_start..directory_offset - footer_len]);
    if reader.read_u64()? != size {
        return Err(ZipError::Signing("signing block size fields differ".into()));
    }

    let mut v2_value = None;
    while reader.remaining() > 0 {
        let pair_len = reader.read_u64()? as usize;
        if pair_len < 4 {
            return Err(ZipError::Signing(format!("signing block pair of {} bytes", pair_len)));
        }
        let id = reader.read_u32()?;
        let value = reader.read_bytes(pair_len - 4)?;
        if id == APK_SIGNATURE_SCHEME_V2_BLOCK_ID {
            v2_value = Some(value);
        }
    }
    let value = v2_value.ok_or_else(|| ZipError::Signing("no v2 signature in signing block".into()))?;

    let (key, signed_digest) = verify_signer(value).map_err(|e| match e {
        ZipError::TruncatedData { .. } => ZipError::Signing("malformed v2 signer".into()),
        other => other,
    })?;

    let mut eocd = bytes[eocd_start..].to_vec();
    patch_u32(&mut eocd, EOCD_DIRECTORY_OFFSET_FIELD, block_start as u64)?;
    let mut digest = ChunkedDigest::new();
    digest.update_section(&bytes[..block_start]);
    digest.update_section(&bytes[directory_offset..eocd_start]);
    digest.update_section(&eocd);
    if digest.finish()[..] != signed_digest[..] {
        return Err(ZipError::Signing("content digest does not match".into()));
    }
    Ok(key)
}

/// Check the first signer's signature over its signed data and return its key
/// with the content digest it signed.
fn verify_signer(value: &[u8]) -> Result<(VerifyingKey, Vec<u8>)> {
    let signers = ByteReader::new(value).read_length_prefixed()?;
    let signer = ByteReader::new(signers).read_length_prefixed()?;

    let mut reader = ByteReader::new(signer);
    let signed_data = reader.read_length_prefixed()?;
    let signatures = reader.read_length_prefixed()?;
    let key = parse_public_key(reader.read_length_prefixed()?)?;

    let mut signature_record = ByteReader::new(ByteReader::new(signatures).read_length_prefixed()?);
    let algorithm = signature_record.read_u32()?;
    if algorithm != ED25519_WITH_SHA256 {
        return Err(ZipError::Signing(format!(
            "unsupported signature algorithm 0x{:04x}",
            algorithm
        )));
    }
    let signature = Signature::from_slice(signature_record.read_length_prefixed()?)
        .map_err(|e| ZipError::Signing(format!("bad signature: {}", e)))?;
    key.verify(signed_data, &signature)
        .map_err(|e| ZipError::Signing(format!("signed data not signed by its key: {}", e)))?;

    let mut data = ByteReader::new(signed_data);
    let digests = data.read_length_prefixed()?;
    let certificates = data.read_length_prefixed()?;
    let certificate = ByteReader::new(certificates).read_length_prefixed()?;
    if certificate != key.as_bytes() {
        return Err(ZipError::Signing("certificate does not match the signer key".into()));
    }

    let mut digest_record = ByteReader::new(ByteReader::new(digests).read_length_prefixed()?);
    if digest_record.read_u32()? != ED25519_WITH_SHA256 {
        return Err(ZipError::Signing("digest algorithm does not match the signature".into()));
    }
    let digest = digest_record.read_length_prefixed()?.to_vec();
    Ok((key, digest))
}
