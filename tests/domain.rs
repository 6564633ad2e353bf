use assert_matches::assert_matches;
use chrono::NaiveDate;

use ocean_sync::domain::{DatasetId, GranuleKey, SourceId, UpdateFrequency, parse_date};
use ocean_sync::error::SyncError;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn dataset_ids_are_normalized() {
    let id: DatasetId = "  SST-Anomaly ".parse().unwrap();
    assert_eq!(id.as_str(), "sst-anomaly");
    assert_matches!("bad id".parse::<DatasetId>(), Err(SyncError::InvalidDatasetId(_)));
    assert_matches!("-leading".parse::<DatasetId>(), Err(SyncError::InvalidDatasetId(_)));
    assert_matches!("".parse::<SourceId>(), Err(SyncError::InvalidSourceId(_)));
}

#[test]
fn parse_date_accepts_both_layouts() {
    assert_eq!(parse_date("2023-04-07").unwrap(), date(2023, 4, 7));
    assert_eq!(parse_date("20230407").unwrap(), date(2023, 4, 7));
    assert_matches!(parse_date("07/04/2023"), Err(SyncError::InvalidDate(_)));
}

#[test]
fn monthly_schedule_is_anchored_at_start() {
    let dates: Vec<_> = UpdateFrequency::Monthly
        .schedule(date(2022, 1, 15), date(2022, 3, 1), date(2022, 6, 1))
        .collect();
    assert_eq!(dates, vec![date(2022, 3, 15), date(2022, 4, 15), date(2022, 5, 15)]);
}

#[test]
fn monthly_schedule_from_month_end_keeps_its_day() {
    let dates: Vec<_> = UpdateFrequency::Monthly
        .schedule(date(2024, 1, 31), date(2024, 1, 1), date(2024, 5, 31))
        .collect();
    assert_eq!(
        dates,
        vec![
            date(2024, 1, 31),
            date(2024, 2, 29),
            date(2024, 3, 31),
            date(2024, 4, 30),
            date(2024, 5, 31),
        ]
    );
}

#[test]
fn granule_key_display() {
    let key = GranuleKey {
        dataset: "sst".parse().unwrap(),
        date: date(2024, 2, 29),
    };
    assert_eq!(key.to_string(), "sst@2024-02-29");
}
