//! Validation for entry names
//!
//! Names are `/`-separated paths relative to the archive root. They are
//! checked once on the way in so the rest of the engine can treat them as
//! opaque keys.

use crate::codec::MAX_U16;
use crate::error::{Result, ZipError};

/// A validated entry name
///
/// # Rules
/// - Not empty, at most 65535 bytes (the width of the length field)
/// - No leading `/`
/// - No `..` segment
/// - No NUL byte, no backslash
///
/// # Examples
///
/// ```
/// use apkzip_rs::EntryName;
///
/// assert!(EntryName::new("lib/arm64-v8a/libfoo.so").is_ok());
/// assert!(EntryName::new("/abs/path").is_err());
/// assert!(EntryName::new("res/../../escape").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryName(String);

impl EntryName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(EntryName(name))
    }

    fn validate(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(ZipError::InvalidName("name cannot be empty".to_string()));
        }

        if name.len() as u64 > MAX_U16 {
            return Err(ZipError::InvalidName(format!(
                "name too long ({} bytes, max {})",
                name.len(),
                MAX_U16
            )));
        }

        if name.starts_with('/') {
            return Err(ZipError::InvalidName(format!(
                "'{}' must be relative to the archive root",
                name
            )));
        }

        if name.contains('\0') || name.contains('\\') {
            return Err(ZipError::InvalidName(format!(
                "'{}' contains a NUL byte or a backslash",
                name
            )));
        }

        if name.split('/').any(|segment| segment == "..") {
            return Err(ZipError::InvalidName(format!(
                "'{}' escapes the archive root",
                name
            )));
        }

        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Whether the name denotes a directory entry.
    pub fn is_directory(&self) -> bool {
        self.0.ends_with('/')
    }
}

impl AsRef<str> for EntryName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Join relative path segments with `/` regardless of the host separator.
pub fn to_entry_path(path: &std::path::Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
