//! Free space management for the backing file

pub mod extent;

pub use extent::{Extent, FileUseMap};
