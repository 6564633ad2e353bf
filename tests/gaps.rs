use camino::Utf8PathBuf;
use chrono::NaiveDate;

use ocean_sync::config::{ConfigLoader, DatasetDescriptor};
use ocean_sync::error::ErrorKind;
use ocean_sync::gaps::{GapDetector, MissingDateQuery};
use ocean_sync::ledger::{QuarantineEntry, StatusLedger};
use ocean_sync::store::Store;

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

struct Fixture {
    _temp: tempfile::TempDir,
    store: Store,
    ledger: StatusLedger,
    dataset: DatasetDescriptor,
}

fn fixture(present: &[u32]) -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let store = Store::new(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());
    let dataset = sst();
    for d in present {
        let path = store.harmonized_path(&dataset.id, day(*d));
        Store::write_bytes_atomic(&path, b"{\"granule\":true}").unwrap();
    }
    let ledger = StatusLedger::open(store.ledger_path()).unwrap();
    Fixture {
        _temp: temp,
        store,
        ledger,
        dataset,
    }
}

#[test]
fn holes_and_tail_are_missing() {
    let fx = fixture(&[1, 2, 4, 5]);
    let detector = GapDetector::new(&fx.store, &fx.ledger);

    let missing = detector.compute_missing_dates(&fx.dataset, day(6)).unwrap();
    assert_eq!(missing, vec![day(3), day(6)]);

    let state = fx.ledger.read(&fx.dataset.id).unwrap();
    assert_eq!(state.last_synced_date, Some(day(2)));
    assert_eq!(state.total_granules, 4);
    assert!(state.confirmed_ahead.contains(&day(4)));
}

#[test]
fn ledger_overclaim_is_corrected_from_disk() {
    let fx = fixture(&[1, 2]);
    let dataset = &fx.dataset;
    for d in 1..=5 {
        fx.ledger.record_success(dataset, day(d), 16).unwrap();
    }
    assert_eq!(fx.ledger.read(&dataset.id).unwrap().last_synced_date, Some(day(5)));

    let detector = GapDetector::new(&fx.store, &fx.ledger);
    let missing = detector.compute_missing_dates(dataset, day(5)).unwrap();
    assert_eq!(missing, vec![day(3), day(4), day(5)]);

    let state = fx.ledger.read(&dataset.id).unwrap();
    assert_eq!(state.last_synced_date, Some(day(2)));
    assert_eq!(state.total_granules, 2);
}

#[test]
fn quarantined_and_gap_dates_are_skipped_unless_repairing() {
    let fx = fixture(&[1]);
    let dataset = &fx.dataset;
    fx.ledger.record_gap(dataset, day(2)).unwrap();
    fx.ledger
        .quarantine(
            &dataset.id,
            day(3),
            QuarantineEntry {
                kind: ErrorKind::Validation,
                attempts: 3,
                message: "sst out of range".to_string(),
            },
        )
        .unwrap();

    let detector = GapDetector::new(&fx.store, &fx.ledger);
    assert_eq!(
        detector.compute_missing_dates(dataset, day(4)).unwrap(),
        vec![day(4)]
    );

    let repair = MissingDateQuery {
        include_quarantined: true,
        ..MissingDateQuery::default()
    };
    assert_eq!(
        detector
            .compute_missing_dates_with(dataset, day(4), repair)
            .unwrap(),
        vec![day(3), day(4)]
    );
}

#[test]
fn force_and_since_reshape_the_window() {
    let fx = fixture(&[1, 2, 3]);
    let detector = GapDetector::new(&fx.store, &fx.ledger);

    let forced = MissingDateQuery {
        force: true,
        since: Some(day(2)),
        ..MissingDateQuery::default()
    };
    assert_eq!(
        detector
            .compute_missing_dates_with(&fx.dataset, day(4), forced)
            .unwrap(),
        vec![day(2), day(3), day(4)]
    );
}

#[test]
fn target_before_start_is_empty() {
    let fx = fixture(&[]);
    let detector = GapDetector::new(&fx.store, &fx.ledger);
    let before = NaiveDate::from_ymd_opt(2023, 12, 31).unwrap();
    assert!(detector.compute_missing_dates(&fx.dataset, before).unwrap().is_empty());
}
