//! v1 (JAR style) signing
//!
//! `CERT.SF` digests the whole manifest, its main section and each entry
//! section. `CERT.ED25519` is the 32 byte public key followed by the 64 byte
//! Ed25519 signature of `CERT.SF`.

use crate::error::{Result, ZipError};
use crate::extension::ZFileExtension;
use crate::manifest::{
    digest_base64, is_ignored, Manifest, ManifestHandle, CREATED_BY, DIGEST_ATTRIBUTE,
    MANIFEST_NAME,
};
use crate::zfile::ZFile;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use tracing::debug;

pub const SIGNATURE_FILE_NAME: &str = "META-INF/CERT.SF";
pub const SIGNATURE_BLOCK_NAME: &str = "META-INF/CERT.ED25519";

const SIGNATURE_VERSION: &str = "Signature-Version";
const SIGNATURE_VERSION_VALUE: &str = "1.0";
const SIGNATURE_CREATED_BY_VALUE: &str = "1.0 (Android)";
const APK_SIGNED: &str = "X-Android-APK-Signed";
const APK_SIGNED_V2: &str = "2";
const MANIFEST_DIGEST: &str = "SHA-256-Digest-Manifest";
const MAIN_ATTRIBUTES_DIGEST: &str = "SHA-256-Digest-Manifest-Main-Attributes";

const PUBLIC_KEY_LENGTH: usize = 32;
const SIGNATURE_LENGTH: usize = 64;

/// Writes `CERT.SF` and `CERT.ED25519` from the manifest.
///
/// Must be registered after the manifest generator so the manifest is
/// current when this runs.
pub struct SignatureExtension {
    manifest: ManifestHandle,
    key: SigningKey,
    v2_signed: bool,
}

impl std::fmt::Debug for SignatureExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureExtension")
            .field("v2_signed", &self.v2_signed)
            .finish()
    }
}

impl SignatureExtension {
    pub fn new(manifest: ManifestHandle, key: SigningKey, v2_signed: bool) -> Self {
        SignatureExtension {
            manifest,
            key,
            v2_signed,
        }
    }

    fn signature_file(&self) -> Vec<u8> {
        let mut sf = Manifest::new();
        sf.set_main_attribute(SIGNATURE_VERSION, SIGNATURE_VERSION_VALUE);
        sf.set_main_attribute(CREATED_BY, SIGNATURE_CREATED_BY_VALUE);
        sf.set_main_attribute(
            MANIFEST_DIGEST,
            &digest_base64(&self.manifest.manifest_bytes()),
        );
        sf.set_main_attribute(
            MAIN_ATTRIBUTES_DIGEST,
            &digest_base64(&self.manifest.main_bytes()),
        );
        if self.v2_signed {
            sf.set_main_attribute(APK_SIGNED, APK_SIGNED_V2);
        }

        for name in self.manifest.entry_names() {
            if let Some(section) = self.manifest.section_bytes(&name) {
                sf.set_section_attribute(&name, DIGEST_ATTRIBUTE, &digest_base64(&section));
            }
        }
        sf.to_bytes()
    }

    fn signature_block(&self, signature_file: &[u8]) -> Vec<u8> {
        let signature = self.key.sign(signature_file);
        let mut block = Vec::with_capacity(PUBLIC_KEY_LENGTH + SIGNATURE_LENGTH);
        block.extend_from_slice(self.key.verifying_key().as_bytes());
        block.extend_from_slice(&signature.to_bytes());
        block
    }
}

impl ZFileExtension for SignatureExtension {
    fn before_update(&mut self, zfile: &mut ZFile) -> Result<()> {
        if self.manifest.synced_update() != Some(zfile.update_count()) {
            return Err(ZipError::SigningOrder(
                "the manifest must be generated before the v1 signature".into(),
            ));
        }

        let signature_file = self.signature_file();
        let signature_block = self.signature_block(&signature_file);

        for (name, bytes, may_compress) in [
            (SIGNATURE_FILE_NAME, &signature_file, true),
            (SIGNATURE_BLOCK_NAME, &signature_block, false),
        ] {
            let current = match zfile.get(name) {
                Some(_) => Some(zfile.read(name)?),
                None => None,
            };
            if current.as_deref() != Some(bytes.as_slice()) {
                debug!("Writing {} ({} bytes)", name, bytes.len());
                zfile.add_bytes(name, bytes, may_compress)?;
            }
        }
        Ok(())
    }
}

fn read_required(zfile: &ZFile, name: &str) -> Result<Vec<u8>> {
    match zfile.read(name) {
        Err(ZipError::NotFound(_)) => Err(ZipError::Signing(format!("{} is missing", name))),
        other => other,
    }
}

/// Check the v1 signature of `zfile` and return the key that made it.
pub fn verify_v1(zfile: &ZFile) -> Result<VerifyingKey> {
    let manifest_bytes = read_required(zfile, MANIFEST_NAME)?;
    let manifest = Manifest::parse(&manifest_bytes)?;

    let mut signed = 0usize;
    for entry in zfile.entries() {
        let name = entry.name();
        if entry.is_directory() || is_ignored(&name) {
            continue;
        }
        let expected = manifest
            .section_attribute(&name, DIGEST_ATTRIBUTE)
            .ok_or_else(|| ZipError::Signing(format!("{} is not in the manifest", name)))?;
        if digest_base64(&zfile.read(&name)?) != expected {
            return Err(ZipError::Signing(format!("digest of {} does not match", name)));
        }
        signed += 1;
    }
    if manifest.section_names().count() != signed {
        return Err(ZipError::Signing(
            "the manifest lists entries missing from the archive".into(),
        ));
    }

    let sf_bytes = read_required(zfile, SIGNATURE_FILE_NAME)?;
    let sf = Manifest::parse(&sf_bytes)?;
    if sf.main_attribute(MANIFEST_DIGEST) != Some(digest_base64(&manifest_bytes).as_str()) {
        return Err(ZipError::Signing("manifest digest does not match".into()));
    }
    for name in manifest.section_names() {
        let section = manifest.section_bytes(name).unwrap_or_default();
        if sf.section_attribute(name, DIGEST_ATTRIBUTE) != Some(digest_base64(&section).as_str()) {
            return Err(ZipError::Signing(format!(
                "signature file digest of {} does not match",
                name
            )));
        }
    }

    let block = read_required(zfile, SIGNATURE_BLOCK_NAME)?;
    if block.len() != PUBLIC_KEY_LENGTH + SIGNATURE_LENGTH {
        return Err(ZipError::Signing(format!(
            "signature block has {} bytes",
            block.len()
        )));
    }
    let (public_key, signature) = block.split_at(PUBLIC_KEY_LENGTH);
    let key = parse_public_key(public_key)?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| ZipError::Signing(format!("bad signature: {}", e)))?;
    key.verify(&sf_bytes, &signature)
        .map_err(|e| ZipError::Signing(format!("signature file not signed by its key: {}", e)))?;
    Ok(key)
}

pub(crate) fn parse_public_key(bytes: &[u8]) -> Result<VerifyingKey> {
    let raw: [u8; PUBLIC_KEY_LENGTH] = bytes
        .try_into()
        .map_err(|_| ZipError::Signing(format!("public key has {} bytes", bytes.len())))?;
    VerifyingKey::from_bytes(&raw).map_err(|e| ZipError::Signing(format!("bad public key: {}", e)))
}
