//! JAR manifest generation
//!
//! `META-INF/MANIFEST.MF` holds a main section followed by one section per
//! archive entry carrying the SHA-256 digest of the entry's contents. The
//! [`ManifestGenerationExtension`] keeps it in step with the archive: before
//! every update it digests new and changed entries and rewrites the manifest
//! only when its bytes would differ.
//!
//! The same attribute file format is used by the v1 signature file, so
//! [`Manifest`] is also the model for `CERT.SF`.

use crate::cache::CachedSupplier;
use crate::error::{Result, ZipError};
use crate::extension::ZFileExtension;
use crate::zfile::ZFile;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

pub const META_INF_DIR: &str = "META-INF";
pub const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";

pub const MANIFEST_VERSION: &str = "Manifest-Version";
pub const CURRENT_MANIFEST_VERSION: &str = "1.0";
pub const BUILT_BY: &str = "Built-By";
pub const CREATED_BY: &str = "Created-By";
pub const DIGEST_ATTRIBUTE: &str = "SHA-256-Digest";

/// Longest line, in bytes, excluding the line terminator.
const MAX_LINE_LENGTH: usize = 72;

/// Attribute file: ordered main attributes and named sections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    main: Vec<(String, String)>,
    sections: BTreeMap<String, Vec<(String, String)>>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn main_attribute(&self, name: &str) -> Option<&str> {
        find(&self.main, name)
    }

    /// Set a main attribute. Returns whether the value changed.
    pub fn set_main_attribute(&mut self, name: &str, value: &str) -> bool {
        set(&mut self.main, name, value)
    }

    pub fn section(&self, name: &str) -> Option<&[(String, String)]> {
        self.sections.get(name).map(|attrs| attrs.as_slice())
    }

    pub fn section_attribute(&self, section: &str, name: &str) -> Option<&str> {
        self.sections.get(section).and_then(|attrs| find(attrs, name))
    }

    /// Set an attribute of `section`, creating the section if needed.
    /// Returns whether anything changed.
    pub fn set_section_attribute(&mut self, section: &str, name: &str, value: &str) -> bool {
        set(self.sections.entry(section.to_string()).or_default(), name, value)
    }

    pub fn remove_section(&mut self, section: &str) -> bool {
        self.sections.remove(section).is_some()
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    /// Bytes of the main section, blank line included.
    pub fn main_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in &self.main {
            write_attribute(&mut out, name, value);
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Bytes of one named section, blank line included.
    pub fn section_bytes(&self, section: &str) -> Option<Vec<u8>> {
        let attrs = self.sections.get(section)?;
        let mut out = Vec::new();
        write_attribute(&mut out, "Name", section);
        for (name, value) in attrs {
            write_attribute(&mut out, name, value);
        }
        out.extend_from_slice(b"\r\n");
        Some(out)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.main_bytes();
        for section in self.sections.keys() {
            if let Some(bytes) = self.section_bytes(section) {
                out.extend_from_slice(&bytes);
            }
        }
        out
    }

    /// Parse an attribute file. Both CRLF and LF line ends are accepted.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| ZipError::Format("manifest is not valid UTF-8".into()))?;

        // Join continuation lines first
        let mut lines: Vec<String> = Vec::new();
        for raw in text.split('\n') {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if let Some(continued) = line.strip_prefix(' ') {
                match lines.last_mut() {
                    Some(last) if !last.is_empty() => last.push_str(continued),
                    _ => {
                        return Err(ZipError::Format(
                            "manifest continuation line without an attribute".into(),
                        ))
                    }
                }
            } else {
                lines.push(line.to_string());
            }
        }

        let mut manifest = Manifest::new();
        let mut current: Option<(String, Vec<(String, String)>)> = None;
        let mut in_main = true;

        for line in lines {
            if line.is_empty() {
                if let Some((name, attrs)) = current.take() {
                    manifest.sections.insert(name, attrs);
                }
                in_main = false;
                continue;
            }

            let (name, value) = line
                .split_once(": ")
                .ok_or_else(|| ZipError::Format(format!("malformed manifest line: {}", line)))?;

            if in_main {
                manifest.main.push((name.to_string(), value.to_string()));
            } else if let Some((_, attrs)) = current.as_mut() {
                attrs.push((name.to_string(), value.to_string()));
            } else if name == "Name" {
                current = Some((value.to_string(), Vec::new()));
            } else {
                return Err(ZipError::Format(format!(
                    "manifest section starts with {} instead of Name",
                    name
                )));
            }
        }
        if let Some((name, attrs)) = current {
            manifest.sections.insert(name, attrs);
        }
        Ok(manifest)
    }
}

fn find<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn set(attrs: &mut Vec<(String, String)>, name: &str, value: &str) -> bool {
    match attrs.iter_mut().find(|(key, _)| key.eq_ignore_ascii_case(name)) {
        Some((_, current)) if current == value => false,
        Some((_, current)) => {
            *current = value.to_string();
            true
        }
        None => {
            attrs.push((name.to_string(), value.to_string()));
            true
        }
    }
}

/// Write `name: value` wrapped at 72 bytes, continuation lines starting with
/// a space. Lines only break on character boundaries.
fn write_attribute(out: &mut Vec<u8>, name: &str, value: &str) {
    let line = format!("{}: {}", name, value);
    let mut rest = line.as_str();
    let mut limit = MAX_LINE_LENGTH;
    let mut first = true;

    while !rest.is_empty() {
        let mut cut = rest.len().min(limit);
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if !first {
            out.push(b' ');
        }
        out.extend_from_slice(rest[..cut].as_bytes());
        out.extend_from_slice(b"\r\n");
        rest = &rest[cut..];
        first = false;
        limit = MAX_LINE_LENGTH - 1;
    }
}

/// Base64 SHA-256 of `data`, the attribute value format.
pub fn digest_base64(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}

/// Whether `name` is left out of the manifest and of the v1 signature:
/// the manifest itself and signature related files directly inside
/// `META-INF` (case insensitive).
pub fn is_ignored(name: &str) -> bool {
    let Some(file) = name.strip_prefix("META-INF/") else {
        return false;
    };
    if file.contains('/') {
        return false;
    }
    let lower = file.to_ascii_lowercase();
    lower == "manifest.mf"
        || lower.starts_with("sig-")
        || [".sf", ".dsa", ".rsa", ".ec", ".ed25519"]
            .iter()
            .any(|suffix| lower.ends_with(suffix))
}

#[derive(Debug)]
struct ManifestState {
    manifest: Manifest,
    /// Serialized manifest, reset whenever the model changes
    bytes: CachedSupplier<Arc<Vec<u8>>>,
    /// name -> (crc32, size) of the contents last digested
    digested: HashMap<String, (u32, u64)>,
    synced_update: Option<u64>,
}

impl ManifestState {
    fn serialized(&self) -> Arc<Vec<u8>> {
        self.bytes.get_or_compute(|| Arc::new(self.manifest.to_bytes()))
    }
}

/// Read-only view of the manifest shared with the v1 signer.
#[derive(Debug, Clone)]
pub struct ManifestHandle {
    state: Arc<Mutex<ManifestState>>,
}

impl ManifestHandle {
    pub fn manifest_bytes(&self) -> Arc<Vec<u8>> {
        self.state.lock().serialized()
    }

    pub fn main_bytes(&self) -> Vec<u8> {
        self.state.lock().manifest.main_bytes()
    }

    pub fn section_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().manifest.section_bytes(name)
    }

    /// Names with a section, in order.
    pub fn entry_names(&self) -> Vec<String> {
        self.state
            .lock()
            .manifest
            .section_names()
            .map(str::to_string)
            .collect()
    }

    pub fn entry_digest(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .manifest
            .section_attribute(name, DIGEST_ATTRIBUTE)
            .map(str::to_string)
    }

    /// Update number at which the manifest was last brought in step with
    /// the archive.
    pub fn synced_update(&self) -> Option<u64> {
        self.state.lock().synced_update
    }
}

/// Keeps `META-INF/MANIFEST.MF` in step with the archive.
#[derive(Debug)]
pub struct ManifestGenerationExtension {
    built_by: String,
    created_by: String,
    state: Arc<Mutex<ManifestState>>,
}

impl ManifestGenerationExtension {
    pub fn new(built_by: impl Into<String>, created_by: impl Into<String>) -> Self {
        ManifestGenerationExtension {
            built_by: built_by.into(),
            created_by: created_by.into(),
            state: Arc::new(Mutex::new(ManifestState {
                manifest: Manifest::new(),
                bytes: CachedSupplier::new(),
                digested: HashMap::new(),
                synced_update: None,
            })),
        }
    }

    pub fn handle(&self) -> ManifestHandle {
        ManifestHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Load the archive's current manifest, if any, and register on `zfile`.
    ///
    /// Main attributes of an existing manifest are kept except `Built-By`
    /// and `Created-By`, which are overridden. A manifest version other than
    /// 1.0 is rejected.
    pub fn register(self, zfile: &mut ZFile) -> Result<ManifestHandle> {
        {
            let mut state = self.state.lock();
            if zfile.get(MANIFEST_NAME).is_some() {
                let bytes = zfile.read(MANIFEST_NAME)?;
                state.manifest = Manifest::parse(&bytes)?;
                // Keep the exact bytes so an unchanged manifest is not rewritten
                state.bytes.precompute(Arc::new(bytes));
            }

            match state.manifest.main_attribute(MANIFEST_VERSION) {
                None => {
                    state
                        .manifest
                        .set_main_attribute(MANIFEST_VERSION, CURRENT_MANIFEST_VERSION);
                    state.bytes.reset();
                }
                Some(CURRENT_MANIFEST_VERSION) => {}
                Some(other) => {
                    return Err(ZipError::Format(format!(
                        "unsupported manifest version {}",
                        other
                    )))
                }
            }
            let mut changed = state.manifest.set_main_attribute(BUILT_BY, &self.built_by);
            changed |= state.manifest.set_main_attribute(CREATED_BY, &self.created_by);
            if changed {
                state.bytes.reset();
            }
        }

        let handle = self.handle();
        zfile.add_extension(Box::new(self))?;
        Ok(handle)
    }
}

impl ZFileExtension for ManifestGenerationExtension {
    fn before_update(&mut self, zfile: &mut ZFile) -> Result<()> {
        let mut state = self.state.lock();
        let mut changed = false;

        let live: Vec<(String, u32, u64)> = zfile
            .entries()
            .into_iter()
            .filter(|entry| !entry.is_directory())
            .map(|entry| (entry.name(), entry.crc32(), entry.uncompressed_size()))
            .filter(|(name, _, _)| !is_ignored(name))
            .collect();

        let stale: Vec<String> = state
            .manifest
            .section_names()
            .filter(|name| !live.iter().any(|(live_name, _, _)| live_name.as_str() == *name))
            .map(str::to_string)
            .collect();
        for name in stale {
            state.manifest.remove_section(&name);
            state.digested.remove(&name);
            changed = true;
        }

        for (name, crc32, size) in live {
            let known = state.digested.get(&name) == Some(&(crc32, size))
                && state.manifest.section_attribute(&name, DIGEST_ATTRIBUTE).is_some();
            if known {
                continue;
            }
            let digest = digest_base64(&zfile.read(&name)?);
            changed |= state
                .manifest
                .set_section_attribute(&name, DIGEST_ATTRIBUTE, &digest);
            state.digested.insert(name, (crc32, size));
        }

        if changed {
            state.bytes.reset();
        }
        let bytes = state.serialized();
        let current = match zfile.get(MANIFEST_NAME) {
            Some(_) => Some(zfile.read(MANIFEST_NAME)?),
            None => None,
        };
        if current.as_deref() != Some(bytes.as_slice()) {
            debug!("Writing {} ({} bytes)", MANIFEST_NAME, bytes.len());
            zfile.add_bytes(MANIFEST_NAME, &bytes, true)?;
        }

        state.synced_update = Some(zfile.update_count());
        Ok(())
    }
}
