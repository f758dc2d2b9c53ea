#![no_main]
use apkzip_rs::{AlignmentRule, ZFile, ZFileOptions};
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeMap;

#[derive(Arbitrary, Debug)]
enum Op {
    Add { name: u8, len: u16, compress: bool },
    Delete { name: u8 },
    Update,
    Reopen,
}

fuzz_target!(|ops: Vec<Op>| {
    let Ok(temp_dir) = tempfile::TempDir::new() else {
        return;
    };
    let path = temp_dir.path().join("edits.zip");
    let options = || {
        ZFileOptions::default().with_alignment(AlignmentRule::compose(
            vec![AlignmentRule::constant_for_suffix(".so", 4096)],
            AlignmentRule::constant(4),
        ))
    };

    let mut zfile = ZFile::open_with(&path, options()).unwrap();
    let mut expected: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    for op in ops.into_iter().take(64) {
        match op {
            Op::Add { name, len, compress } => {
                let name = if name % 3 == 0 {
                    format!("lib/x86/lib{}.so", name)
                } else {
                    format!("f{}", name)
                };
                let data = vec![len as u8; len as usize];
                zfile.add_bytes(&name, &data, compress).unwrap();
                expected.insert(name, data);
            }
            Op::Delete { name } => {
                let name = format!("f{}", name);
                let removed = zfile.delete(&name).unwrap();
                assert_eq!(removed, expected.remove(&name).is_some());
            }
            Op::Update => zfile.update().unwrap(),
            Op::Reopen => {
                zfile.close().unwrap();
                zfile = ZFile::open_with(&path, options()).unwrap();
            }
        }
    }
    zfile.close().unwrap();

    let zfile = ZFile::open(&path).unwrap();
    assert_eq!(zfile.len(), expected.len());
    for (name, data) in &expected {
        assert_eq!(&zfile.read(name).unwrap(), data);
    }
});
