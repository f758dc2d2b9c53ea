//! Incremental APK packaging
//!
//! [`IncrementalPackager`] turns batches of changed build outputs into
//! archive changes. Each kind of output has its own naming: dex files go
//! through the slot allocator, assets are prefixed with `assets/`, native
//! libraries are filtered by ABI. The archive itself sits behind the
//! [`ApkCreator`] trait; [`ApkZFileCreator`] is the [`ZFile`] backed
//! implementation.

use crate::alignment::AlignmentRule;
use crate::error::{Result, ZipError};
use crate::options::ZFileOptions;
use crate::renamer::{DexIncrementalRenameManager, FileStatus, PackagedFileUpdate, RelativeFile};
use crate::sign::{register_signing, SigningOptions};
use crate::zfile::ZFile;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Boundary for the payload of stored native libraries, so they can be
/// mapped straight from the APK.
pub const NATIVE_LIBRARY_ALIGNMENT: u32 = 4096;

/// Boundary for every other stored entry.
pub const DEFAULT_ALIGNMENT: u32 = 4;

/// Writes an APK.
pub trait ApkCreator {
    /// Add or replace `name` with the contents of the file at `input`.
    fn write_file(&mut self, input: &Path, name: &str) -> Result<()>;

    /// Copy entries of the archive at `zip`. `rename` gives the name of each
    /// copied entry, or `None` to skip it.
    fn write_zip(&mut self, zip: &Path, rename: &dyn Fn(&str) -> Option<String>) -> Result<()>;

    /// Remove `name` if present.
    fn delete_file(&mut self, name: &str) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Alignment used unless told otherwise: native libraries on page
/// boundaries, everything else on 4 bytes.
pub fn default_alignment_rule() -> AlignmentRule {
    AlignmentRule::compose(
        vec![AlignmentRule::constant_for_suffix(".so", NATIVE_LIBRARY_ALIGNMENT)],
        AlignmentRule::constant(DEFAULT_ALIGNMENT),
    )
}

/// Settings for an [`IncrementalPackager`] over a [`ZFile`].
#[derive(Debug, Clone)]
pub struct PackagerOptions {
    pub zfile: ZFileOptions,
    pub signing: Option<SigningOptions>,
    /// ABIs to package; empty accepts all
    pub abi_filters: BTreeSet<String>,
    /// Also package `gdbserver` and `gdb.setup` next to native libraries
    pub jni_debug: bool,
    /// Suffixes of entries that are always stored uncompressed
    pub no_compress: Vec<String>,
}

impl Default for PackagerOptions {
    fn default() -> Self {
        PackagerOptions {
            zfile: ZFileOptions::default().with_alignment(default_alignment_rule()),
            signing: None,
            abi_filters: BTreeSet::new(),
            jni_debug: false,
            no_compress: vec![".so".to_string()],
        }
    }
}

impl PackagerOptions {
    pub fn with_signing(mut self, signing: SigningOptions) -> Self {
        self.signing = Some(signing);
        self
    }

    pub fn with_abi_filters<I, S>(mut self, abis: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.abi_filters = abis.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_jni_debug(mut self, jni_debug: bool) -> Self {
        self.jni_debug = jni_debug;
        self
    }
}

/// [`ApkCreator`] writing into a [`ZFile`], signing it if configured.
#[derive(Debug)]
pub struct ApkZFileCreator {
    zfile: ZFile,
    no_compress: Vec<String>,
}

impl ApkZFileCreator {
    pub fn new<P: AsRef<Path>>(apk: P, options: &PackagerOptions) -> Result<Self> {
        let apk = apk.as_ref();
        if apk.is_dir() {
            return Err(ZipError::Config(format!("{} is a directory", apk.display())));
        }
        let mut zfile = ZFile::open_with(apk, options.zfile.clone())?;
        if let Some(signing) = &options.signing {
            register_signing(&mut zfile, signing)?;
        }
        Ok(ApkZFileCreator {
            zfile,
            no_compress: options.no_compress.clone(),
        })
    }

    pub fn zfile(&self) -> &ZFile {
        &self.zfile
    }

    fn may_compress(&self, name: &str) -> bool {
        !self.no_compress.iter().any(|suffix| name.ends_with(suffix.as_str()))
    }
}

impl ApkCreator for ApkZFileCreator {
    fn write_file(&mut self, input: &Path, name: &str) -> Result<()> {
        let may_compress = self.may_compress(name);
        self.zfile.add_file(name, input, may_compress)
    }

    fn write_zip(&mut self, zip: &Path, rename: &dyn Fn(&str) -> Option<String>) -> Result<()> {
        let source = ZFile::open_read_only(zip, ZFileOptions::default())?;
        self.zfile.merge_from_with(&source, rename)
    }

    fn delete_file(&mut self, name: &str) -> Result<()> {
        self.zfile.delete(name).map(|_| ())
    }

    fn close(&mut self) -> Result<()> {
        self.zfile.close()
    }
}

/// Accepts `lib/<abi>/<file>.so`, restricted to the given ABIs when any are
/// given. In JNI debug mode the gdb helpers are accepted as well.
#[derive(Debug, Clone, Default)]
pub struct NativeLibraryAbiFilter {
    abis: BTreeSet<String>,
    jni_debug: bool,
}

impl NativeLibraryAbiFilter {
    pub fn new(abis: BTreeSet<String>, jni_debug: bool) -> Self {
        NativeLibraryAbiFilter { abis, jni_debug }
    }

    pub fn accepts(&self, path: &str) -> bool {
        let segments: Vec<&str> = path.split('/').collect();
        let [lib, abi, file] = segments.as_slice() else {
            return false;
        };
        if *lib != "lib" || abi.is_empty() {
            return false;
        }
        if !self.abis.is_empty() && !self.abis.contains(*abi) {
            return false;
        }
        file.ends_with(".so") || (self.jni_debug && (*file == "gdbserver" || *file == "gdb.setup"))
    }
}

pub struct IncrementalPackager<C: ApkCreator = ApkZFileCreator> {
    creator: C,
    dex_renamer: DexIncrementalRenameManager,
    abi_filter: NativeLibraryAbiFilter,
    closed: bool,
}

impl IncrementalPackager<ApkZFileCreator> {
    /// Package into the APK at `apk`, keeping incremental state in
    /// `state_dir`.
    pub fn new<P, Q>(apk: P, state_dir: Q, options: PackagerOptions) -> Result<Self>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let creator = ApkZFileCreator::new(apk, &options)?;
        let abi_filter = NativeLibraryAbiFilter::new(options.abi_filters, options.jni_debug);
        Self::with_creator(creator, state_dir, abi_filter)
    }
}

impl<C: ApkCreator> IncrementalPackager<C> {
    pub fn with_creator<Q: AsRef<Path>>(
        creator: C,
        state_dir: Q,
        abi_filter: NativeLibraryAbiFilter,
    ) -> Result<Self> {
        Ok(IncrementalPackager {
            creator,
            dex_renamer: DexIncrementalRenameManager::new(state_dir)?,
            abi_filter,
            closed: false,
        })
    }

    pub fn creator(&self) -> &C {
        &self.creator
    }

    /// Dex files, renamed into `classes*.dex` slots.
    pub fn update_dex(&mut self, files: &BTreeMap<RelativeFile, FileStatus>) -> Result<()> {
        self.ensure_open()?;
        let updates = self.dex_renamer.update(files)?;
        self.update_files(updates)
    }

    /// Java resources under their relative path. Class files are skipped.
    pub fn update_java_resources(
        &mut self,
        files: &BTreeMap<RelativeFile, FileStatus>,
    ) -> Result<()> {
        self.update_mapped(files, |path| {
            (!path.ends_with(".class")).then(|| path.to_string())
        })
    }

    /// Assets, under `assets/`.
    pub fn update_assets(&mut self, files: &BTreeMap<RelativeFile, FileStatus>) -> Result<()> {
        self.update_mapped(files, |path| Some(format!("assets/{}", path)))
    }

    /// Compiled resources. Their base is usually a resource archive whose
    /// entries are copied as they are.
    pub fn update_android_resources(
        &mut self,
        files: &BTreeMap<RelativeFile, FileStatus>,
    ) -> Result<()> {
        self.update_mapped(files, |path| Some(path.to_string()))
    }

    /// Native libraries accepted by the ABI filter.
    pub fn update_native_libraries(
        &mut self,
        files: &BTreeMap<RelativeFile, FileStatus>,
    ) -> Result<()> {
        let filter = self.abi_filter.clone();
        self.update_mapped(files, |path| filter.accepts(path).then(|| path.to_string()))
    }

    fn update_mapped<F>(&mut self, files: &BTreeMap<RelativeFile, FileStatus>, name_of: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.ensure_open()?;
        let updates = files
            .iter()
            .filter_map(|(file, status)| {
                name_of(file.relative()).map(|name| PackagedFileUpdate::new(file.clone(), name, *status))
            })
            .collect();
        self.update_files(updates)
    }

    /// Deletes first, so a name freed and reused in one batch ends up written.
    fn update_files(&mut self, updates: Vec<PackagedFileUpdate>) -> Result<()> {
        for update in updates.iter().filter(|u| u.status == FileStatus::Removed) {
            debug!("Removing {}", update.name);
            self.creator.delete_file(&update.name)?;
        }

        let mut from_archives: BTreeMap<PathBuf, BTreeMap<String, String>> = BTreeMap::new();
        for update in updates.iter().filter(|u| u.status != FileStatus::Removed) {
            let base = update.source.base();
            if base.is_file() {
                from_archives
                    .entry(base.to_path_buf())
                    .or_default()
                    .insert(update.source.relative().to_string(), update.name.clone());
            } else {
                debug!("Writing {} from {}", update.name, update.source);
                self.creator.write_file(&update.source.path(), &update.name)?;
            }
        }

        for (archive, names) in from_archives {
            debug!("Copying {} entries from {}", names.len(), archive.display());
            self.creator
                .write_zip(&archive, &|entry: &str| names.get(entry).cloned())?;
        }
        Ok(())
    }

    /// Close the archive, then save the dex slot state. Closing twice does
    /// nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.creator.close()?;
        self.dex_renamer.close()?;
        info!("Packaging finished");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ZipError::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Records every call instead of writing an archive.
    #[derive(Debug, Default)]
    struct RecordingCreator {
        calls: Vec<String>,
    }

    impl ApkCreator for RecordingCreator {
        fn write_file(&mut self, _input: &Path, name: &str) -> Result<()> {
            self.calls.push(format!("write {}", name));
            Ok(())
        }

        fn write_zip(&mut self, zip: &Path, _rename: &dyn Fn(&str) -> Option<String>) -> Result<()> {
            self.calls.push(format!("zip {}", zip.display()));
            Ok(())
        }

        fn delete_file(&mut self, name: &str) -> Result<()> {
            self.calls.push(format!("delete {}", name));
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.calls.push("close".to_string());
            Ok(())
        }
    }

    fn write(dir: &Path, relative: &str, contents: &[u8]) -> RelativeFile {
        let file = RelativeFile::new(dir, relative);
        fs::create_dir_all(file.path().parent().unwrap()).unwrap();
        fs::write(file.path(), contents).unwrap();
        file
    }

    #[test]
    fn test_abi_filter() {
        let any = NativeLibraryAbiFilter::default();
        assert!(any.accepts("lib/x86/libfoo.so"));
        assert!(!any.accepts("lib/x86/gdbserver"));
        assert!(!any.accepts("lib/libfoo.so"));
        assert!(!any.accepts("lib/x86/sub/libfoo.so"));
        assert!(!any.accepts("other/x86/libfoo.so"));

        let filtered =
            NativeLibraryAbiFilter::new(["arm64-v8a".to_string()].into_iter().collect(), true);
        assert!(filtered.accepts("lib/arm64-v8a/libfoo.so"));
        assert!(filtered.accepts("lib/arm64-v8a/gdb.setup"));
        assert!(!filtered.accepts("lib/x86/libfoo.so"));
    }

    #[test]
    fn test_deletes_run_first() {
        let state = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let mut packager = IncrementalPackager::with_creator(
            RecordingCreator::default(),
            state.path(),
            NativeLibraryAbiFilter::default(),
        )
        .unwrap();

        let a = write(src.path(), "a.txt", b"a");
        let b = write(src.path(), "b.txt", b"b");
        packager
            .update_assets(&[(a.clone(), FileStatus::New)].into_iter().collect())
            .unwrap();
        packager
            .update_assets(
                &[(b, FileStatus::New), (a, FileStatus::Removed)]
                    .into_iter()
                    .collect(),
            )
            .unwrap();
        packager.close().unwrap();
        packager.close().unwrap();

        assert_eq!(
            packager.creator().calls,
            vec![
                "write assets/a.txt",
                "delete assets/a.txt",
                "write assets/b.txt",
                "close"
            ]
        );
    }

    #[test]
    fn test_class_files_skipped() {
        let state = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let mut packager = IncrementalPackager::with_creator(
            RecordingCreator::default(),
            state.path(),
            NativeLibraryAbiFilter::default(),
        )
        .unwrap();
        let class = write(src.path(), "com/x/A.class", b"cafebabe");
        let props = write(src.path(), "com/x/a.properties", b"k=v");
        packager
            .update_java_resources(
                &[(class, FileStatus::New), (props, FileStatus::New)]
                    .into_iter()
                    .collect(),
            )
            .unwrap();
        assert_eq!(packager.creator().calls, vec!["write com/x/a.properties"]);
    }

    #[test]
    fn test_closed_packager_rejects_updates() {
        let state = TempDir::new().unwrap();
        let mut packager = IncrementalPackager::with_creator(
            RecordingCreator::default(),
            state.path(),
            NativeLibraryAbiFilter::default(),
        )
        .unwrap();
        packager.close().unwrap();
        assert!(matches!(
            packager.update_dex(&BTreeMap::new()),
            Err(ZipError::Closed)
        ));
    }

    #[test]
    fn test_packages_into_zfile() {
        let out = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let apk = out.path().join("app.apk");

        let options = PackagerOptions {
            zfile: PackagerOptions::default().zfile.with_no_timestamps(true),
            ..PackagerOptions::default()
        };
        let mut packager = IncrementalPackager::new(&apk, state.path(), options).unwrap();
        let dex = write(src.path(), "main/x.dex", b"dex\n035\0main");
        let lib = write(src.path(), "lib/x86/libfoo.so", &[0x7fu8; 3000]);
        packager
            .update_dex(&[(dex, FileStatus::New)].into_iter().collect())
            .unwrap();
        packager
            .update_native_libraries(&[(lib, FileStatus::New)].into_iter().collect())
            .unwrap();
        packager.close().unwrap();

        let zfile = ZFile::open(&apk).unwrap();
        assert_eq!(zfile.read("classes.dex").unwrap(), b"dex\n035\0main");
        let so = zfile.get("lib/x86/libfoo.so").unwrap();
        assert_eq!(so.method(), crate::header::CompressionMethod::Store);
        assert_eq!(so.data_offset().unwrap() % u64::from(NATIVE_LIBRARY_ALIGNMENT), 0);
        assert!(state.path().join("dex-renamer-state.json").is_file());
    }

    #[test]
    fn test_source_archive_opened_read_only() {
        let out = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let mut creator =
            ApkZFileCreator::new(out.path().join("app.apk"), &PackagerOptions::default()).unwrap();

        let missing = src.path().join("resources.ap_");
        let result = creator.write_zip(&missing, &|name: &str| Some(name.to_string()));
        assert!(matches!(result, Err(ZipError::Io(_))));
        assert!(!missing.exists());

        let archive = src.path().join("cached.ap_");
        let mut zfile = ZFile::open(&archive).unwrap();
        zfile.add_bytes("res/layout/main.xml", b"<x/>", true).unwrap();
        zfile.close().unwrap();
        let before = std::fs::read(&archive).unwrap();
        let mut permissions = std::fs::metadata(&archive).unwrap().permissions();
        permissions.set_readonly(true);
        std::fs::set_permissions(&archive, permissions).unwrap();

        creator
            .write_zip(&archive, &|name: &str| Some(name.to_string()))
            .unwrap();
        creator.close().unwrap();
        assert_eq!(std::fs::read(&archive).unwrap(), before);

        let apk = ZFile::open(out.path().join("app.apk")).unwrap();
        assert_eq!(apk.read("res/layout/main.xml").unwrap(), b"<x/>");
    }
}
