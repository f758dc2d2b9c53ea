//! Archive engine
//!
//! ## Storage layer
//!
//! - [`codec`] - bounds checked little-endian field codec
//! - [`header`] - local header, central directory record and EOCD codecs
//! - [`allocator`] - free space map of the backing file
//! - [`io`] - positioned reads and writes on the backing file
//! - [`tracker`] - accounting of buffered entry bytes
//! - [`cache`] - memoized values and file bound caches
//!
//! ## Container
//!
//! - [`zfile`] - the incrementally updated archive
//! - [`entry`] - entries and their status
//! - [`alignment`] - payload alignment rules
//! - [`options`] - archive configuration
//! - [`validation`] - entry name rules
//!
//! ## Lifecycle
//!
//! - [`extension`] - update hooks
//! - [`manifest`] - `META-INF/MANIFEST.MF` generation
//! - [`sign`] - v1 and v2 signing and verification
//!
//! ## Packaging
//!
//! - [`renamer`] - dex slot allocation across incremental builds
//! - [`packager`] - incremental APK packaging

pub mod alignment;
pub mod allocator;
pub mod cache;
pub mod codec;
pub mod entry;
pub mod error;
pub mod extension;
pub mod header;
pub mod io;
pub mod manifest;
pub mod options;
pub mod packager;
pub mod renamer;
pub mod sign;
pub mod tracker;
pub mod validation;
pub mod zfile;


pub use zfile::{ZFile, ZFileStats};
