//! # apkzip - Incremental ZIP/APK Assembly
//!
//! `apkzip-rs` builds and updates ZIP archives in place, the way an Android
//! build updates an APK between two compilations:
//!
//! - **Incremental updates**: only new and changed entries are written,
//!   removed entries leave gaps that later entries reuse
//! - **Alignment**: stored payloads placed on configurable boundaries
//!   (4096 for native libraries, 4 for the rest)
//! - **Signing**: JAR manifest, v1 signature files and a v2 signing block,
//!   all kept current on every update
//! - **Dex slots**: stable, dense `classes*.dex` names across builds
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use apkzip_rs::{Result, ZFile};
//!
//! # fn main() -> Result<()> {
//! let mut apk = ZFile::open("app.apk")?;
//! apk.add_bytes("assets/hello.txt", b"Hello, World!", true)?;
//! apk.delete("assets/stale.txt")?;
//!
//! // Nothing touches the disk until the archive is updated or closed
//! apk.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Signed Archives
//!
//! ```rust,no_run
//! use apkzip_rs::{AlignmentRule, Result, SigningOptions, ZFileBuilder};
//!
//! # fn main() -> Result<()> {
//! let signing = SigningOptions::from_secret_bytes(&[7u8; 32])?;
//! let mut apk = ZFileBuilder::new()
//!     .path("app.apk")
//!     .alignment(AlignmentRule::compose(
//!         vec![AlignmentRule::constant_for_suffix(".so", 4096)],
//!         AlignmentRule::constant(4),
//!     ))
//!     .no_timestamps(true)
//!     .signing(signing)
//!     .build()?;
//!
//! apk.add_file("lib/arm64-v8a/libnative.so", "build/libnative.so", false)?;
//! apk.close()?;
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use core::{
    alignment, allocator, cache, codec, entry, error, extension, header, io, manifest, options,
    packager, renamer, sign, tracker, validation, zfile,
};

// Re-export core types that users need
pub use crate::core::{
    alignment::{AlignmentRule, NO_ALIGNMENT},
    cache::{CachedFileContents, CachedSupplier},
    entry::{EntryStatus, StoredEntry},
    error::{Result, ZipError},
    extension::ZFileExtension,
    header::CompressionMethod,
    manifest::{Manifest, ManifestGenerationExtension, ManifestHandle},
    options::{OptionsConfig, ZFileOptions},
    packager::{
        ApkCreator, ApkZFileCreator, IncrementalPackager, NativeLibraryAbiFilter, PackagerOptions,
    },
    renamer::{DexIncrementalRenameManager, FileStatus, PackagedFileUpdate, RelativeFile},
    sign::{register_signing, verify_v1, verify_v2, SigningOptions},
    tracker::{ByteTracker, TrackedBytes, TrackerSnapshot},
    validation::EntryName,
    zfile::{ZFile, ZFileStats},
};

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Builder for opening a [`ZFile`] with custom options
///
/// # Examples
///
/// ```rust,no_run
/// use apkzip_rs::ZFileBuilder;
///
/// # fn main() -> apkzip_rs::Result<()> {
/// let zfile = ZFileBuilder::new()
///     .path("out/app.apk")
///     .auto_sort(true)
///     .compression_level(9)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ZFileBuilder {
    path: Option<PathBuf>,
    options: ZFileOptions,
    signing: Option<SigningOptions>,
}

impl ZFileBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archive to open or create (required)
    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Replace all options at once, e.g. ones loaded from TOML
    pub fn options(mut self, options: ZFileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn alignment(mut self, rule: AlignmentRule) -> Self {
        self.options.alignment_rule = rule;
        self
    }

    /// Share a byte tracker with other archives
    pub fn tracker(mut self, tracker: Arc<ByteTracker>) -> Self {
        self.options.tracker = tracker;
        self
    }

    pub fn no_timestamps(mut self, no_timestamps: bool) -> Self {
        self.options.no_timestamps = no_timestamps;
        self
    }

    pub fn auto_sort(mut self, auto_sort: bool) -> Self {
        self.options.auto_sort = auto_sort;
        self
    }

    pub fn compression_level(mut self, level: u32) -> Self {
        self.options.compression_level = level;
        self
    }

    /// Maintain the manifest and sign on every update
    pub fn signing(mut self, signing: SigningOptions) -> Self {
        self.signing = Some(signing);
        self
    }

    pub fn build(self) -> Result<ZFile> {
        let path = self
            .path
            .ok_or_else(|| ZipError::Config("path must be set".into()))?;

        info!("Building archive at {}", path.display());
        let mut zfile = ZFile::open_with(&path, self.options)?;

        if let Some(signing) = &self.signing {
            register_signing(&mut zfile, signing)?;
            debug!(
                "Signing enabled (v1: {}, v2: {})",
                signing.v1_enabled, signing.v2_enabled
            );
        }
        Ok(zfile)
    }
}
