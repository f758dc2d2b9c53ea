//! Lifecycle hooks on an archive
//!
//! Extensions are registered on one [`ZFile`] and called in registration
//! order at fixed points of every update:
//!
//! 1. [`before_update`](ZFileExtension::before_update): entries may still be
//!    added or deleted. The manifest and the v1 signature files are produced
//!    here, manifest first.
//! 2. [`entries_written`](ZFileExtension::entries_written): every entry is on
//!    disk at its final offset and the central directory is known but not yet
//!    written. Entries can no longer change; the only permitted mutation is
//!    [`ZFile::set_signing_block`].
//! 3. [`updated`](ZFileExtension::updated): the central directory is on disk.
//!
//! [`closed`](ZFileExtension::closed) follows the final update of
//! [`ZFile::close`].

use crate::error::Result;
use crate::zfile::ZFile;

pub trait ZFileExtension {
    fn before_update(&mut self, _zfile: &mut ZFile) -> Result<()> {
        Ok(())
    }

    fn entries_written(&mut self, _zfile: &mut ZFile) -> Result<()> {
        Ok(())
    }

    fn updated(&mut self, _zfile: &ZFile) -> Result<()> {
        Ok(())
    }

    fn closed(&mut self) -> Result<()> {
        Ok(())
    }
}
