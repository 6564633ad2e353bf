use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::NaiveDate;

use ocean_sync::config::RawFormat;
use ocean_sync::domain::DatasetId;
use ocean_sync::error::SyncError;
use ocean_sync::store::Store;

fn temp_store() -> (tempfile::TempDir, Store) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("store")).unwrap();
    (temp, Store::new(root))
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn atomic_write_replaces_content_and_leaves_no_temp_files() {
    let (_temp, store) = temp_store();
    let path = store.root().join("nested").join("file.json");

    Store::write_bytes_atomic(&path, b"first").unwrap();
    Store::write_bytes_atomic(&path, b"second").unwrap();

    assert_eq!(fs::read(path.as_std_path()).unwrap(), b"second");
    let names: Vec<_> = fs::read_dir(path.parent().unwrap().as_std_path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(names.len(), 1);
}

#[test]
fn scan_lists_only_non_empty_artifacts_of_the_dataset() {
    let (_temp, store) = temp_store();
    let sst: DatasetId = "sst".parse().unwrap();

    Store::write_bytes_atomic(&store.harmonized_path(&sst, date(2024, 1, 1)), b"{}").unwrap();
    let february = store.harmonized_path(&sst, date(2024, 2, 3));
    Store::write_bytes_atomic(&february, b"{\"a\":1}").unwrap();
    Store::write_bytes_atomic(&store.harmonized_path(&sst, date(2024, 1, 2)), b"").unwrap();
    let stray = store.processed_dir(&sst).join("2024").join("01").join("notes.txt");
    Store::write_bytes_atomic(&stray, b"hello").unwrap();

    let found = store.scan_harmonized(&sst).unwrap();
    assert_eq!(
        found.into_iter().collect::<Vec<_>>(),
        vec![(date(2024, 1, 1), 2), (date(2024, 2, 3), 7)]
    );

    let other: DatasetId = "chl".parse().unwrap();
    assert!(store.scan_harmonized(&other).unwrap().is_empty());
}

#[test]
fn cleanup_removes_raw_leftovers_and_temp_files() {
    let (_temp, store) = temp_store();
    let sst: DatasetId = "sst".parse().unwrap();

    let raw = store.raw_path(&sst, date(2024, 1, 1), RawFormat::Json);
    Store::write_bytes_atomic(&raw, b"raw bytes").unwrap();
    let kept = store.harmonized_path(&sst, date(2024, 1, 1));
    Store::write_bytes_atomic(&kept, b"{\"kept\":true}").unwrap();
    let abandoned = kept.parent().unwrap().join(".ocean-sync-tmpABC123");
    fs::write(abandoned.as_std_path(), b"partial").unwrap();

    let report = store.cleanup().unwrap();
    assert_eq!(report.raw_removed, 1);
    assert_eq!(report.temp_removed, 1);
    assert_eq!(report.bytes_freed, 9 + 7);
    assert!(report.dirs_removed >= 3);
    assert!(!raw.as_std_path().exists());
    assert!(!abandoned.as_std_path().exists());
    assert!(kept.as_std_path().exists());
}

#[test]
fn second_lock_on_the_same_store_is_refused() {
    let (_temp, store) = temp_store();
    let guard = store.lock().unwrap();
    assert_matches!(store.lock(), Err(SyncError::StoreLocked(_)));
    drop(guard);
    assert!(store.lock().is_ok());
}
