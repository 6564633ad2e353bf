use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::NaiveDate;

use ocean_sync::config::{ConfigLoader, DatasetDescriptor};
use ocean_sync::domain::SyncStatus;
use ocean_sync::error::{ErrorKind, SyncError};
use ocean_sync::ledger::{QuarantineEntry, StatusLedger};

fn sst() -> DatasetDescriptor {
    let document = serde_json::json!({
        "id": "sst",
        "variables": ["sst"],
        "target_resolution": 0.25,
        "start_date": "2024-01-01",
        "sources": [{
            "id": "oisst", "start": "2024-01-01", "priority": 1, "resolution": 0.25,
            "fetch": {"kind": "local_dir", "root": "/unused", "pattern": "{YYYYMMDD}.json"}
        }]
    });
    ConfigLoader::resolve_dataset(serde_json::from_value(document).unwrap()).unwrap()
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

fn ledger_path(temp: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(temp.path().join("ledger.json")).unwrap()
}

#[test]
fn out_of_order_completions_advance_only_when_contiguous() {
    let temp = tempfile::tempdir().unwrap();
    let ledger = StatusLedger::open(ledger_path(&temp)).unwrap();
    let dataset = sst();

    let state = ledger.record_success(&dataset, day(3), 100).unwrap();
    assert_eq!(state.last_synced_date, None);

    let state = ledger.record_success(&dataset, day(1), 100).unwrap();
    assert_eq!(state.last_synced_date, Some(day(1)));

    let state = ledger.record_success(&dataset, day(2), 100).unwrap();
    assert_eq!(state.last_synced_date, Some(day(3)));
    assert_eq!(state.contiguous_from, Some(day(1)));
    assert!(state.confirmed_ahead.is_empty());
    assert_eq!(state.total_granules, 3);
    assert_eq!(state.storage_bytes, 300);

    let document = ledger.snapshot().unwrap();
    assert_eq!(document.totals.granules, 3);
    assert_eq!(document.totals.storage_bytes, 300);
}

#[test]
fn recorded_gap_does_not_block_advancement() {
    let temp = tempfile::tempdir().unwrap();
    let ledger = StatusLedger::open(ledger_path(&temp)).unwrap();
    let dataset = sst();

    ledger.record_success(&dataset, day(1), 10).unwrap();
    ledger.record_success(&dataset, day(3), 10).unwrap();
    let state = ledger.record_gap(&dataset, day(2)).unwrap();

    assert_eq!(state.last_synced_date, Some(day(3)));
    assert!(state.recorded_gaps.contains(&day(2)));
    assert_eq!(state.total_granules, 2);
}

#[test]
fn quarantine_is_cleared_by_a_later_success() {
    let temp = tempfile::tempdir().unwrap();
    let ledger = StatusLedger::open(ledger_path(&temp)).unwrap();
    let dataset = sst();

    let entry = QuarantineEntry {
        kind: ErrorKind::Timeout,
        attempts: 3,
        message: "read timed out".to_string(),
    };
    let state = ledger.quarantine(&dataset.id, day(1), entry).unwrap();
    assert!(state.quarantined.contains_key(&day(1)));
    assert_eq!(state.last_error.as_ref().map(|error| error.kind), Some(ErrorKind::Timeout));
    assert_eq!(state.last_synced_date, None);

    let state = ledger.record_success(&dataset, day(1), 10).unwrap();
    assert!(state.quarantined.is_empty());
    assert_eq!(state.last_synced_date, Some(day(1)));
}

#[test]
fn state_survives_reopen_and_stale_temp_files_are_discarded() {
    let temp = tempfile::tempdir().unwrap();
    let path = ledger_path(&temp);
    let dataset = sst();
    {
        let ledger = StatusLedger::open(path.clone()).unwrap();
        ledger.record_success(&dataset, day(1), 42).unwrap();
        ledger.set_status(&dataset.id, SyncStatus::Active).unwrap();
    }

    // A flush interrupted after writing its temp file but before the rename.
    let torn = temp.path().join(".ocean-sync-tmpX1Y2Z3");
    fs::write(&torn, b"{\"schema_version\": 1, \"datas").unwrap();

    let reopened = StatusLedger::open(path).unwrap();
    assert!(!torn.exists());
    let state = reopened.read(&dataset.id).unwrap();
    assert_eq!(state.last_synced_date, Some(day(1)));
    assert_eq!(state.storage_bytes, 42);
    assert_eq!(state.status, SyncStatus::Active);
}

#[test]
fn unchanged_status_does_not_rewrite_the_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = ledger_path(&temp);
    let dataset = sst();
    let ledger = StatusLedger::open(path.clone()).unwrap();
    ledger.set_status(&dataset.id, SyncStatus::UpToDate).unwrap();

    fs::write(path.as_std_path(), b"sentinel").unwrap();
    ledger.set_status(&dataset.id, SyncStatus::UpToDate).unwrap();
    ledger.clear_error(&dataset.id).unwrap();
    assert_eq!(fs::read(path.as_std_path()).unwrap(), b"sentinel");
}

#[test]
fn unparsable_ledger_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = ledger_path(&temp);
    fs::write(path.as_std_path(), b"not json").unwrap();
    assert_matches!(StatusLedger::load(path), Err(SyncError::Ledger(_)));
}

#[test]
fn released_bytes_are_subtracted_before_a_replacement_is_counted() {
    let temp = tempfile::tempdir().unwrap();
    let ledger = StatusLedger::open(ledger_path(&temp)).unwrap();
    let dataset = sst();

    ledger.record_success(&dataset, day(1), 100).unwrap();
    ledger.release_bytes(&dataset.id, 100).unwrap();
    let state = ledger.record_success(&dataset, day(1), 120).unwrap();
    assert_eq!(state.total_granules, 1);
    assert_eq!(state.storage_bytes, 120);
    assert_eq!(state.last_synced_date, Some(day(1)));
}
