//! Archive signing
//!
//! Two independent schemes, both with Ed25519 keys:
//!
//! - v1 ([`SignatureExtension`]): a signature file `META-INF/CERT.SF` over the
//!   manifest sections, and a signature block `META-INF/CERT.ED25519`
//!   holding the public key and the signature of `CERT.SF`.
//! - v2 ([`ApkSignatureV2Extension`]): a signing block between the last entry
//!   and the central directory, signing a chunked digest of the whole file.
//!
//! [`register_signing`] wires the manifest and the selected schemes onto an
//! archive in the required order.

pub mod v1;
pub mod v2;

pub use v1::{verify_v1, SignatureExtension, SIGNATURE_BLOCK_NAME, SIGNATURE_FILE_NAME};
pub use v2::{verify_v2, ApkSignatureV2Extension, ED25519_WITH_SHA256};

use crate::error::{Result, ZipError};
use crate::manifest::{ManifestGenerationExtension, ManifestHandle};
use crate::zfile::ZFile;
use ed25519_dalek::SigningKey;

/// What to sign with and how.
#[derive(Debug, Clone)]
pub struct SigningOptions {
    pub key: SigningKey,
    pub v1_enabled: bool,
    pub v2_enabled: bool,
    /// `Built-By` of the manifest
    pub built_by: String,
    /// `Created-By` of the manifest
    pub created_by: String,
}

impl SigningOptions {
    pub fn new(key: SigningKey) -> Self {
        SigningOptions {
            key,
            v1_enabled: true,
            v2_enabled: true,
            built_by: "apkzip".to_string(),
            created_by: concat!("apkzip ", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    /// Build from the 32 byte Ed25519 secret seed.
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self> {
        let seed: [u8; 32] = secret.try_into().map_err(|_| {
            ZipError::Config(format!(
                "signing key must be 32 bytes, got {}",
                secret.len()
            ))
        })?;
        Ok(Self::new(SigningKey::from_bytes(&seed)))
    }

    pub fn with_v1(mut self, enabled: bool) -> Self {
        self.v1_enabled = enabled;
        self
    }

    pub fn with_v2(mut self, enabled: bool) -> Self {
        self.v2_enabled = enabled;
        self
    }
}

/// Register the manifest generator, then the v1 and v2 signers as enabled.
///
/// The manifest is always maintained; it is what v1 signs and it is expected
/// in the archive regardless of the schemes in use.
pub fn register_signing(zfile: &mut ZFile, options: &SigningOptions) -> Result<ManifestHandle> {
    let manifest = ManifestGenerationExtension::new(&options.built_by, &options.created_by)
        .register(zfile)?;

    if options.v1_enabled {
        let signer =
            SignatureExtension::new(manifest.clone(), options.key.clone(), options.v2_enabled);
        zfile.add_extension(Box::new(signer))?;
    }
    if options.v2_enabled {
        zfile.add_extension(Box::new(ApkSignatureV2Extension::new(options.key.clone())))?;
    }
    Ok(manifest)
}
