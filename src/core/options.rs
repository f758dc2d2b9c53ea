//! Archive configuration
//!
//! Options are an explicit value handed to [`ZFile::open_with`](crate::ZFile::open_with);
//! there is no process-wide default. They can also be read from TOML:
//!
//! ```toml
//! no_timestamps = true
//! compression_level = 6
//!
//! [alignment]
//! default = 4
//! suffixes = { ".so" = 4096 }
//! ```

use crate::alignment::{AlignmentRule, NO_ALIGNMENT};
use crate::error::{Result, ZipError};
use crate::tracker::ByteTracker;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default deflate level.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

#[derive(Debug, Clone)]
pub struct ZFileOptions {
    pub alignment_rule: AlignmentRule,
    pub tracker: Arc<ByteTracker>,
    /// Stamp every new entry with 1980-01-01 00:00 for reproducible output
    pub no_timestamps: bool,
    /// Sort entries by name before every update
    pub auto_sort: bool,
    pub compression_level: u32,
}

impl Default for ZFileOptions {
    fn default() -> Self {
        ZFileOptions {
            alignment_rule: AlignmentRule::none(),
            tracker: ByteTracker::new(),
            no_timestamps: false,
            auto_sort: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl ZFileOptions {
    pub fn with_alignment(mut self, rule: AlignmentRule) -> Self {
        self.alignment_rule = rule;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<ByteTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_no_timestamps(mut self, no_timestamps: bool) -> Self {
        self.no_timestamps = no_timestamps;
        self
    }

    pub fn with_auto_sort(mut self, auto_sort: bool) -> Self {
        self.auto_sort = auto_sort;
        self
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(ZipError::Config(format!(
                "compression level {} out of range 0..=9",
                self.compression_level
            )));
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: OptionsConfig = toml::from_str(text)?;
        config.into_options()
    }
}

/// Serializable form of [`ZFileOptions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsConfig {
    pub no_timestamps: bool,
    pub auto_sort: bool,
    pub compression_level: u32,
    pub alignment: AlignmentConfig,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        OptionsConfig {
            no_timestamps: false,
            auto_sort: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            alignment: AlignmentConfig::default(),
        }
    }
}

impl OptionsConfig {
    pub fn into_options(self) -> Result<ZFileOptions> {
        let options = ZFileOptions::default()
            .with_alignment(self.alignment.to_rule()?)
            .with_no_timestamps(self.no_timestamps)
            .with_auto_sort(self.auto_sort)
            .with_compression_level(self.compression_level);
        options.validate()?;
        Ok(options)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Boundary for names no other rule claims
    pub default: u32,
    /// Suffix to boundary
    pub suffixes: BTreeMap<String, u32>,
    /// Regular expression to boundary
    pub patterns: BTreeMap<String, u32>,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        AlignmentConfig {
            default: NO_ALIGNMENT,
            suffixes: BTreeMap::new(),
            patterns: BTreeMap::new(),
        }
    }
}

impl AlignmentConfig {
    /// Longer suffixes are more specific and are tried first, then patterns.
    pub fn to_rule(&self) -> Result<AlignmentRule> {
        let mut suffixes: Vec<(&String, &u32)> = self.suffixes.iter().collect();
        suffixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

        let mut rules: Vec<AlignmentRule> = suffixes
            .into_iter()
            .map(|(suffix, alignment)| AlignmentRule::constant_for_suffix(suffix.clone(), *alignment))
            .collect();
        for (pattern, alignment) in &self.patterns {
            rules.push(AlignmentRule::constant_for_pattern(pattern, *alignment)?);
        }

        let fallback = AlignmentRule::constant(self.default);
        if rules.is_empty() {
            return Ok(fallback);
        }
        Ok(AlignmentRule::compose(rules, fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ZFileOptions::default();
        assert_eq!(options.alignment_rule.resolve("anything"), NO_ALIGNMENT);
        assert!(!options.no_timestamps);
        assert_eq!(options.compression_level, DEFAULT_COMPRESSION_LEVEL);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let options = ZFileOptions::from_toml_str(
            r#"
            no_timestamps = true
            compression_level = 9

            [alignment]
            default = 4
            suffixes = { ".so" = 4096, "x.so" = 16 }
            patterns = { "assets/.*\\.bin" = 64 }
            "#,
        )
        .unwrap();

        assert!(options.no_timestamps);
        assert!(!options.auto_sort);
        assert_eq!(options.compression_level, 9);
        assert_eq!(options.alignment_rule.resolve("lib/libx.so"), 16);
        assert_eq!(options.alignment_rule.resolve("lib/liby.so"), 4096);
        assert_eq!(options.alignment_rule.resolve("assets/a.bin"), 64);
        assert_eq!(options.alignment_rule.resolve("classes.dex"), 4);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            ZFileOptions::from_toml_str("compression_level = 12"),
            Err(ZipError::Config(_))
        ));
        assert!(matches!(
            ZFileOptions::from_toml_str("no_timestamps = \"yes\""),
            Err(ZipError::Config(_))
        ));
    }
}
