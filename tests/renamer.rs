//! Dex slot allocation tests
//!
//! Tests to verify that dex files keep stable `classes*.dex` names across
//! builds, through saved state:
//! - Slots survive a close and a new manager
//! - Slots stay dense after removals
//! - The canonical `classes.dex` always lands in the first slot
//! - Missing or corrupt state starts from scratch

use apkzip_rs::core::renamer::slot_name;
use apkzip_rs::{DexIncrementalRenameManager, FileStatus, RelativeFile, ZipError};
use std::collections::BTreeMap;
use std::fs;
use tempfile::TempDir;

fn batch(files: &[(&RelativeFile, FileStatus)]) -> BTreeMap<RelativeFile, FileStatus> {
    files
        .iter()
        .map(|(file, status)| ((*file).clone(), *status))
        .collect()
}

fn names(manager: &DexIncrementalRenameManager) -> Vec<(String, String)> {
    manager
        .assignments()
        .into_iter()
        .map(|(name, file)| (name, file.relative().to_string()))
        .collect()
}

#[test]
fn test_slot_names() {
    assert_eq!(slot_name(1), "classes.dex");
    assert_eq!(slot_name(2), "classes2.dex");
    assert_eq!(slot_name(12), "classes12.dex");
}

#[test]
fn test_state_survives_restart() {
    let state = TempDir::new().unwrap();
    let a = RelativeFile::new("/build/dex", "a.dex");
    let b = RelativeFile::new("/build/dex", "b.dex");
    let c = RelativeFile::new("/build/dex", "c.dex");

    let mut manager = DexIncrementalRenameManager::new(state.path()).unwrap();
    manager
        .update(&batch(&[
            (&a, FileStatus::New),
            (&b, FileStatus::New),
            (&c, FileStatus::New),
        ]))
        .unwrap();
    manager.close().unwrap();
    assert!(state.path().join("dex-renamer-state.json").is_file());

    let mut manager = DexIncrementalRenameManager::new(state.path()).unwrap();
    assert_eq!(
        names(&manager),
        vec![
            ("classes.dex".to_string(), "a.dex".to_string()),
            ("classes2.dex".to_string(), "b.dex".to_string()),
            ("classes3.dex".to_string(), "c.dex".to_string()),
        ]
    );

    // A change keeps its name
    let updates = manager.update(&batch(&[(&b, FileStatus::Changed)])).unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].name, "classes2.dex");
    assert_eq!(updates[0].status, FileStatus::Changed);
}

#[test]
fn test_removal_keeps_slots_dense() {
    let state = TempDir::new().unwrap();
    let files: Vec<RelativeFile> = (0..4)
        .map(|i| RelativeFile::new("/build/dex", format!("d{}.dex", i)))
        .collect();

    let mut manager = DexIncrementalRenameManager::new(state.path()).unwrap();
    let all: Vec<(&RelativeFile, FileStatus)> =
        files.iter().map(|file| (file, FileStatus::New)).collect();
    manager.update(&batch(&all)).unwrap();

    // Removing the second of four moves the fourth into its slot
    let updates = manager.update(&batch(&[(&files[1], FileStatus::Removed)])).unwrap();
    let summary: Vec<(String, FileStatus)> = updates
        .iter()
        .map(|update| (update.name.clone(), update.status))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("classes2.dex".to_string(), FileStatus::Changed),
            ("classes4.dex".to_string(), FileStatus::Removed),
        ]
    );
    assert_eq!(manager.slot_of(&files[3]), Some(2));
    assert_eq!(manager.slot_of(&files[1]), None);
    assert_eq!(manager.assignments().len(), 3);
}

#[test]
fn test_canonical_dex_takes_first_slot() {
    let state = TempDir::new().unwrap();
    let other = RelativeFile::new("/build/lib", "other.dex");
    let main = RelativeFile::new("/build/main", "classes.dex");

    let mut manager = DexIncrementalRenameManager::new(state.path()).unwrap();
    manager.update(&batch(&[(&other, FileStatus::New)])).unwrap();
    assert_eq!(manager.slot_of(&other), Some(1));

    manager.update(&batch(&[(&main, FileStatus::New)])).unwrap();
    assert_eq!(manager.slot_of(&main), Some(1));
    assert_eq!(manager.slot_of(&other), Some(2));
}

#[test]
fn test_corrupt_state_starts_fresh() {
    let state = TempDir::new().unwrap();
    fs::write(state.path().join("dex-renamer-state.json"), b"{ not json").unwrap();

    let mut manager = DexIncrementalRenameManager::new(state.path()).unwrap();
    assert!(manager.assignments().is_empty());

    let a = RelativeFile::new("/build/dex", "a.dex");
    let updates = manager.update(&batch(&[(&a, FileStatus::New)])).unwrap();
    assert_eq!(updates[0].name, "classes.dex");
}

#[test]
fn test_unknown_removal_rejected() {
    let state = TempDir::new().unwrap();
    let mut manager = DexIncrementalRenameManager::new(state.path()).unwrap();
    let ghost = RelativeFile::new("/build/dex", "ghost.dex");

    let result = manager.update(&batch(&[(&ghost, FileStatus::Removed)]));
    assert!(matches!(result, Err(ZipError::NotFound(_))));
}

#[test]
fn test_closed_manager_rejects_updates() {
    let state = TempDir::new().unwrap();
    let mut manager = DexIncrementalRenameManager::new(state.path()).unwrap();
    manager.close().unwrap();
    manager.close().unwrap();

    let a = RelativeFile::new("/build/dex", "a.dex");
    assert!(matches!(
        manager.update(&batch(&[(&a, FileStatus::New)])),
        Err(ZipError::Closed)
    ));
}
