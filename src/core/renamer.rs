//! Incremental slot allocator for dex files
//!
//! An APK carries its dex files under fixed names: `classes.dex`,
//! `classes2.dex`, `classes3.dex`, ... with no gaps. Builds produce dex files
//! with arbitrary paths, and incremental builds only report which of them
//! were added, changed or removed. [`DexIncrementalRenameManager`] maps each
//! input file to a slot, keeps that mapping across batches, and translates a
//! batch of input changes into the smallest batch of archive changes that
//! keeps the slot names dense.
//!
//! Removing a file frees its slot. A freed slot is refilled by a file added
//! in the same batch if there is one; otherwise the file in the highest slot
//! moves down into it, which costs one `CHANGED` and one `REMOVED` update
//! instead of renumbering everything. Freed slots are refilled lowest first.
//!
//! A file whose own name is `classes.dex` is given slot 1 when it is added,
//! displacing a differently named file that held it.

use crate::error::{Result, ZipError};
use crate::validation::to_entry_path;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of slot 1.
pub const CANONICAL_DEX_NAME: &str = "classes.dex";

const STATE_FILE: &str = "dex-renamer-state.json";
const STATE_VERSION: u32 = 1;

/// A file identified by a base directory (or archive) and a `/` separated
/// path relative to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelativeFile {
    base: PathBuf,
    relative: String,
}

impl RelativeFile {
    pub fn new(base: impl Into<PathBuf>, relative: impl Into<String>) -> Self {
        RelativeFile {
            base: base.into(),
            relative: relative.into().replace('\\', "/"),
        }
    }

    /// Identity of `file` below the directory `base`.
    pub fn from_path(base: &Path, file: &Path) -> Result<Self> {
        let relative = file.strip_prefix(base).map_err(|_| {
            ZipError::InvalidName(format!(
                "{} is not inside {}",
                file.display(),
                base.display()
            ))
        })?;
        Ok(Self::new(base, to_entry_path(relative)))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// Last path segment.
    pub fn file_name(&self) -> &str {
        self.relative.rsplit('/').next().unwrap_or(&self.relative)
    }

    /// Location on disk when the base is a directory.
    pub fn path(&self) -> PathBuf {
        self.relative
            .split('/')
            .fold(self.base.clone(), |path, segment| path.join(segment))
    }

    fn is_canonical(&self) -> bool {
        self.file_name() == CANONICAL_DEX_NAME
    }
}

impl std::fmt::Display for RelativeFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}!{}", self.base.display(), self.relative)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FileStatus {
    New,
    Changed,
    Removed,
}

/// One change to apply to the archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackagedFileUpdate {
    /// Input file whose contents go (or went) into `name`
    pub source: RelativeFile,
    /// Archive name
    pub name: String,
    pub status: FileStatus,
}

impl PackagedFileUpdate {
    pub fn new(source: RelativeFile, name: impl Into<String>, status: FileStatus) -> Self {
        PackagedFileUpdate {
            source,
            name: name.into(),
            status,
        }
    }
}

/// Archive name of `slot`, counting from 1.
pub fn slot_name(slot: u32) -> String {
    if slot <= 1 {
        CANONICAL_DEX_NAME.to_string()
    } else {
        format!("classes{}.dex", slot)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedState {
    version: u32,
    slots: Vec<SavedSlot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedSlot {
    slot: u32,
    base: PathBuf,
    file: String,
}

pub struct DexIncrementalRenameManager {
    state_dir: PathBuf,
    /// Always exactly slots 1..=len
    slots: BTreeMap<u32, RelativeFile>,
    closed: bool,
}

impl std::fmt::Debug for DexIncrementalRenameManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DexIncrementalRenameManager")
            .field("state_dir", &self.state_dir)
            .field("slots", &self.slots.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl DexIncrementalRenameManager {
    /// Create a manager keeping its state in `state_dir`, loading the state
    /// saved by a previous [`close`](Self::close) if there is one.
    pub fn new<P: AsRef<Path>>(state_dir: P) -> Result<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        if !state_dir.is_dir() {
            return Err(ZipError::Config(format!(
                "{} is not a directory",
                state_dir.display()
            )));
        }

        let mut manager = DexIncrementalRenameManager {
            state_dir,
            slots: BTreeMap::new(),
            closed: false,
        };
        manager.read_state()?;
        Ok(manager)
    }

    fn state_file(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    fn read_state(&mut self) -> Result<()> {
        let path = self.state_file();
        if !path.is_file() {
            return Ok(());
        }
        let text = fs::read_to_string(&path)?;
        let saved: SavedState = match serde_json::from_str(&text) {
            Ok(saved) => saved,
            Err(e) => {
                warn!("Ignoring unreadable state file {}: {}", path.display(), e);
                return Ok(());
            }
        };
        if saved.version != STATE_VERSION {
            warn!(
                "Ignoring state file {} with version {}",
                path.display(),
                saved.version
            );
            return Ok(());
        }

        let mut slots = BTreeMap::new();
        for saved_slot in saved.slots {
            let file = RelativeFile::new(saved_slot.base, saved_slot.file);
            if slots.insert(saved_slot.slot, file).is_some() {
                warn!("Ignoring state file {}: slot {} repeats", path.display(), saved_slot.slot);
                return Ok(());
            }
        }
        let dense = slots.keys().copied().eq(1..=slots.len() as u32);
        let unique = slots.values().collect::<BTreeSet<_>>().len() == slots.len();
        if !dense || !unique {
            warn!("Ignoring inconsistent state file {}", path.display());
            return Ok(());
        }

        debug!("Loaded {} dex slots from {}", slots.len(), path.display());
        self.slots = slots;
        Ok(())
    }

    fn write_state(&self) -> Result<()> {
        let saved = SavedState {
            version: STATE_VERSION,
            slots: self
                .slots
                .iter()
                .map(|(slot, file)| SavedSlot {
                    slot: *slot,
                    base: file.base.clone(),
                    file: file.relative.clone(),
                })
                .collect(),
        };
        let path = self.state_file();
        fs::write(&path, serde_json::to_string_pretty(&saved)?)?;
        info!("Saved {} dex slots to {}", self.slots.len(), path.display());
        Ok(())
    }

    /// Current slot of `file`, if it has one.
    pub fn slot_of(&self, file: &RelativeFile) -> Option<u32> {
        find_slot(&self.slots, file)
    }

    /// Current archive names and the files they hold, in slot order.
    pub fn assignments(&self) -> Vec<(String, RelativeFile)> {
        self.slots
            .iter()
            .map(|(slot, file)| (slot_name(*slot), file.clone()))
            .collect()
    }

    /// Apply a batch of input changes and return the archive changes, sorted
    /// by slot.
    ///
    /// Changing or removing a file that has no slot is a
    /// [`ZipError::NotFound`] error and leaves the state untouched. A file
    /// reported as new that already has a slot is treated as changed.
    pub fn update(
        &mut self,
        files: &BTreeMap<RelativeFile, FileStatus>,
    ) -> Result<Vec<PackagedFileUpdate>> {
        if self.closed {
            return Err(ZipError::Closed);
        }

        let mut slots = self.slots.clone();
        let mut last_slot = slots.len() as u32;
        let mut next_fresh = last_slot + 1;

        let mut freed: BTreeSet<u32> = BTreeSet::new();
        let mut freed_files: BTreeMap<u32, RelativeFile> = BTreeMap::new();
        for (file, _) in files.iter().filter(|(_, s)| **s == FileStatus::Removed) {
            let slot = find_slot(&slots, file).ok_or_else(|| {
                ZipError::NotFound(format!("removed dex file {} was never added", file))
            })?;
            slots.remove(&slot);
            freed.insert(slot);
            freed_files.insert(slot, file.clone());
        }

        let mut added: Vec<RelativeFile> = Vec::new();
        let mut changed: Vec<&RelativeFile> = Vec::new();
        for (file, status) in files {
            match status {
                FileStatus::New if find_slot(&self.slots, file).is_none() => {
                    added.push(file.clone())
                }
                FileStatus::New | FileStatus::Changed => changed.push(file),
                FileStatus::Removed => {}
            }
        }
        added.sort_by(|a, b| {
            (!a.is_canonical(), &a.relative, &a.base).cmp(&(!b.is_canonical(), &b.relative, &b.base))
        });

        if added.iter().any(RelativeFile::is_canonical) {
            if let Some(holder) = slots.get(&1).filter(|holder| !holder.is_canonical()).cloned() {
                debug!("Moving {} out of {}", holder, CANONICAL_DEX_NAME);
                slots.remove(&1);
                freed.insert(1);
                added.push(holder);
            }
        }

        let mut new_slots: BTreeSet<u32> = BTreeSet::new();
        let mut changed_slots: BTreeSet<u32> = BTreeSet::new();
        for file in added {
            if let Some(slot) = freed.pop_first() {
                freed_files.remove(&slot);
                changed_slots.insert(slot);
                slots.insert(slot, file);
            } else {
                let slot = next_fresh;
                next_fresh += 1;
                last_slot = slot;
                new_slots.insert(slot);
                slots.insert(slot, file);
            }
        }

        for file in changed {
            let slot = find_slot(&slots, file).ok_or_else(|| {
                ZipError::NotFound(format!("changed dex file {} was never added", file))
            })?;
            changed_slots.insert(slot);
        }

        // Fill the remaining holes from the top
        let mut removed_slots: BTreeSet<u32> = BTreeSet::new();
        while let Some(&highest_freed) = freed.last() {
            if highest_freed == last_slot {
                freed.remove(&highest_freed);
                removed_slots.insert(last_slot);
                last_slot -= 1;
                continue;
            }

            let Some(lowest_freed) = freed.pop_first() else {
                break;
            };
            let mover = slots.remove(&last_slot).ok_or_else(|| {
                ZipError::Format(format!("dex slot {} is unexpectedly empty", last_slot))
            })?;
            debug!(
                "Moving {} from {} to {}",
                mover,
                slot_name(last_slot),
                slot_name(lowest_freed)
            );
            removed_slots.insert(last_slot);
            changed_slots.remove(&last_slot);
            changed_slots.insert(lowest_freed);
            freed_files.insert(last_slot, mover.clone());
            slots.insert(lowest_freed, mover);
            last_slot -= 1;
        }

        let mut updates: Vec<(u32, PackagedFileUpdate)> = Vec::new();
        for (slots_with_status, status) in [
            (&new_slots, FileStatus::New),
            (&changed_slots, FileStatus::Changed),
        ] {
            for slot in slots_with_status {
                let file = slots.get(slot).ok_or_else(|| {
                    ZipError::Format(format!("dex slot {} is unexpectedly empty", slot))
                })?;
                updates.push((*slot, PackagedFileUpdate::new(file.clone(), slot_name(*slot), status)));
            }
        }
        for slot in &removed_slots {
            let file = freed_files.get(slot).ok_or_else(|| {
                ZipError::Format(format!("no file recorded for removed dex slot {}", slot))
            })?;
            updates.push((
                *slot,
                PackagedFileUpdate::new(file.clone(), slot_name(*slot), FileStatus::Removed),
            ));
        }
        updates.sort_by_key(|(slot, update)| (*slot, update.status));

        self.slots = slots;
        Ok(updates.into_iter().map(|(_, update)| update).collect())
    }

    /// Save the state. Closing twice does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.write_state()
    }
}

fn find_slot(slots: &BTreeMap<u32, RelativeFile>, file: &RelativeFile) -> Option<u32> {
    slots
        .iter()
        .find(|(_, held)| *held == file)
        .map(|(slot, _)| *slot)
}
