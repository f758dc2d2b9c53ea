//! Alignment rules for stored entry payloads
//!
//! A rule maps an entry name to the boundary its payload must start on.
//! Shared libraries want page alignment so they can be mapped straight out of
//! the archive, everything else is happy with a word boundary.
//!
//! ```
//! use apkzip_rs::AlignmentRule;
//!
//! let rule = AlignmentRule::compose(
//!     vec![AlignmentRule::constant_for_suffix(".so", 4096)],
//!     AlignmentRule::constant(4),
//! );
//! assert_eq!(rule.resolve("lib/arm64-v8a/libfoo.so"), 4096);
//! assert_eq!(rule.resolve("res/raw/a.txt"), 4);
//! assert_eq!(rule.padding("lib/x86/libbar.so", 4000), 96);
//! ```

use crate::error::{Result, ZipError};
use regex::Regex;

/// Boundary meaning "anywhere".
pub const NO_ALIGNMENT: u32 = 1;

#[derive(Debug, Clone)]
pub enum AlignmentRule {
    /// Every name resolves to the same boundary.
    Constant(u32),
    /// Names ending with `suffix` resolve to `alignment`, others to [`NO_ALIGNMENT`].
    Suffix { suffix: String, alignment: u32 },
    /// Names fully matched by `pattern` resolve to `alignment`, others to [`NO_ALIGNMENT`].
    Pattern { pattern: Regex, alignment: u32 },
    /// First rule in `rules` resolving to something other than
    /// [`NO_ALIGNMENT`] wins, otherwise `fallback` decides.
    Compose {
        rules: Vec<AlignmentRule>,
        fallback: Box<AlignmentRule>,
    },
}

impl AlignmentRule {
    pub fn constant(alignment: u32) -> Self {
        AlignmentRule::Constant(alignment.max(NO_ALIGNMENT))
    }

    pub fn constant_for_suffix(suffix: impl Into<String>, alignment: u32) -> Self {
        AlignmentRule::Suffix {
            suffix: suffix.into(),
            alignment: alignment.max(NO_ALIGNMENT),
        }
    }

    /// Rule for names matching a regular expression (anchored at both ends).
    pub fn constant_for_pattern(pattern: &str, alignment: u32) -> Result<Self> {
        let pattern = Regex::new(&format!("^(?:{})$", pattern))
            .map_err(|e| ZipError::Config(format!("bad alignment pattern: {}", e)))?;
        Ok(AlignmentRule::Pattern {
            pattern,
            alignment: alignment.max(NO_ALIGNMENT),
        })
    }

    pub fn compose(rules: Vec<AlignmentRule>, fallback: AlignmentRule) -> Self {
        AlignmentRule::Compose {
            rules,
            fallback: Box::new(fallback),
        }
    }

    /// No alignment at all.
    pub fn none() -> Self {
        AlignmentRule::Constant(NO_ALIGNMENT)
    }

    /// Boundary for an entry called `name`.
    pub fn resolve(&self, name: &str) -> u32 {
        match self {
            AlignmentRule::Constant(alignment) => *alignment,
            AlignmentRule::Suffix { suffix, alignment } => {
                if name.ends_with(suffix.as_str()) {
                    *alignment
                } else {
                    NO_ALIGNMENT
                }
            }
            AlignmentRule::Pattern { pattern, alignment } => {
                if pattern.is_match(name) {
                    *alignment
                } else {
                    NO_ALIGNMENT
                }
            }
            AlignmentRule::Compose { rules, fallback } => rules
                .iter()
                .map(|rule| rule.resolve(name))
                .find(|&alignment| alignment != NO_ALIGNMENT)
                .unwrap_or_else(|| fallback.resolve(name)),
        }
    }

    /// Bytes to add to `offset` so it lands on the boundary for `name`.
    pub fn padding(&self, name: &str, offset: u64) -> u64 {
        padding_for(offset, self.resolve(name))
    }
}

impl Default for AlignmentRule {
    fn default() -> Self {
        AlignmentRule::none()
    }
}

/// Minimal padding turning `offset` into a multiple of `alignment`.
pub fn padding_for(offset: u64, alignment: u32) -> u64 {
    let alignment = u64::from(alignment.max(NO_ALIGNMENT));
    (alignment - offset % alignment) % alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apk_rule() -> AlignmentRule {
        AlignmentRule::compose(
            vec![AlignmentRule::constant_for_suffix(".so", 4096)],
            AlignmentRule::constant(4),
        )
    }

    #[test]
    fn test_constant() {
        let rule = AlignmentRule::constant(4);
        assert_eq!(rule.padding("a", 0), 0);
        assert_eq!(rule.padding("a", 1), 3);
        assert_eq!(rule.padding("a", 4), 0);
        assert_eq!(rule.padding("a", 10), 2);
    }

    #[test]
    fn test_zero_alignment_is_no_alignment() {
        let rule = AlignmentRule::constant(0);
        assert_eq!(rule.resolve("x"), NO_ALIGNMENT);
        assert_eq!(rule.padding("x", 17), 0);
    }

    #[test]
    fn test_suffix_only_matches_suffix() {
        let rule = AlignmentRule::constant_for_suffix(".so", 4096);
        assert_eq!(rule.resolve("lib/x86/libc.so"), 4096);
        assert_eq!(rule.resolve("lib/x86/libc.so.txt"), NO_ALIGNMENT);
    }

    #[test]
    fn test_compose_priority() {
        let rule = apk_rule();
        assert_eq!(rule.resolve("lib/x.so"), 4096);
        assert_eq!(rule.resolve("a.txt"), 4);
        assert_eq!(rule.padding("lib/x.so", 10), 4086);
        assert_eq!(rule.padding("a.txt", 10), 2);
    }

    #[test]
    fn test_compose_first_match_wins() {
        let rule = AlignmentRule::compose(
            vec![
                AlignmentRule::constant_for_suffix(".so", 4096),
                AlignmentRule::constant_for_suffix("x.so", 16),
            ],
            AlignmentRule::none(),
        );
        assert_eq!(rule.resolve("libx.so"), 4096);
    }

    #[test]
    fn test_pattern_rule() {
        let rule = AlignmentRule::constant_for_pattern(r".*\.txt", 1024).unwrap();
        assert_eq!(rule.resolve("test.txt"), 1024);
        assert_eq!(rule.resolve("test.txt.foo"), NO_ALIGNMENT);
        assert!(AlignmentRule::constant_for_pattern("(", 4).is_err());
    }

    #[test]
    fn test_rules_are_shareable() {
        let rule = std::sync::Arc::new(apk_rule());
        let other = std::sync::Arc::clone(&rule);
        let handle = std::thread::spawn(move || other.resolve("lib/y.so"));
        assert_eq!(handle.join().unwrap(), rule.resolve("lib/z.so"));
    }
}
