#![no_main]
use apkzip_rs::ZFile;
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes must either open as an archive or fail with an error,
// never panic, and whatever opens must be readable.
fuzz_target!(|data: &[u8]| {
    let Ok(temp_dir) = tempfile::TempDir::new() else {
        return;
    };
    let path = temp_dir.path().join("fuzz.zip");
    if std::fs::write(&path, data).is_err() {
        return;
    }

    let Ok(zfile) = ZFile::open(&path) else {
        return;
    };
    for name in zfile.names() {
        let _ = zfile.read(&name);
        let _ = zfile.read_raw(&name);
    }
});
