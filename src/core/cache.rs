//! Memoization primitives
//!
//! [`CachedSupplier`] computes a derived value once and hands out clones until
//! it is reset. [`CachedFileContents`] keeps a value that describes a file and
//! drops it as soon as the file's modification time moves away from the one
//! recorded when the value was stored.
//!
//! Both types hold their state behind one mutex. The computation passed to
//! [`CachedSupplier::get`] runs with the lock held, so concurrent callers block
//! on the first computation instead of repeating it.

use crate::error::Result;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A lazily computed value that stays valid until [`reset`](Self::reset).
///
/// The computation may legitimately yield "no value"; wrap `T` in an
/// `Option` for that case, the absent result is memoized like any other.
#[derive(Debug)]
pub struct CachedSupplier<T> {
    // `Some` while valid
    state: Mutex<Option<T>>,
}

impl<T: Clone> CachedSupplier<T> {
    pub fn new() -> Self {
        CachedSupplier {
            state: Mutex::new(None),
        }
    }

    /// A supplier already holding `value`.
    pub fn precomputed(value: T) -> Self {
        CachedSupplier {
            state: Mutex::new(Some(value)),
        }
    }

    /// Return the memoized value, running `compute` if there is none.
    ///
    /// A failed computation leaves the supplier invalid.
    pub fn get<F>(&self, compute: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let mut state = self.state.lock();
        if let Some(value) = state.as_ref() {
            return Ok(value.clone());
        }
        let value = compute()?;
        *state = Some(value.clone());
        Ok(value)
    }

    /// Like [`get`](Self::get) for computations that cannot fail.
    pub fn get_or_compute<F>(&self, compute: F) -> T
    where
        F: FnOnce() -> T,
    {
        let mut state = self.state.lock();
        state.get_or_insert_with(compute).clone()
    }

    /// Seed the cache without running a computation.
    pub fn precompute(&self, value: T) {
        *self.state.lock() = Some(value);
    }

    pub fn reset(&self) {
        *self.state.lock() = None;
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().is_some()
    }
}

impl<T: Clone> Default for CachedSupplier<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct FileState<T> {
    closed_at: Option<SystemTime>,
    cache: Option<T>,
}

/// A value tied to the state of a file as it was last written.
#[derive(Debug)]
pub struct CachedFileContents<T> {
    file: PathBuf,
    state: Mutex<FileState<T>>,
}

impl<T: Clone> CachedFileContents<T> {
    pub fn new<P: AsRef<Path>>(file: P) -> Self {
        CachedFileContents {
            file: file.as_ref().to_path_buf(),
            state: Mutex::new(FileState {
                closed_at: None,
                cache: None,
            }),
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Record that the file was just written and that `value` describes it.
    pub fn closed(&self, value: Option<T>) -> Result<()> {
        let modified = fs::metadata(&self.file)?.modified()?;
        let mut state = self.state.lock();
        state.closed_at = Some(modified);
        state.cache = value;
        Ok(())
    }

    /// Whether the file still carries the modification time recorded by
    /// [`closed`](Self::closed). Clears the cached value when it does not.
    pub fn is_valid(&self) -> bool {
        let current = fs::metadata(&self.file).and_then(|m| m.modified()).ok();
        let mut state = self.state.lock();
        let valid = match (current, state.closed_at) {
            (Some(now), Some(recorded)) => now == recorded,
            _ => false,
        };
        if !valid {
            state.cache = None;
        }
        valid
    }

    pub fn cache(&self) -> Option<T> {
        self.state.lock().cache.clone()
    }
}
