use std::fs;

use assert_matches::assert_matches;
use chrono::NaiveDate;

use ocean_sync::config::{Config, ConfigLoader, FetchSpec, PriorityOrder, RawFormat};
use ocean_sync::domain::{LonConvention, UpdateFrequency};
use ocean_sync::error::SyncError;

const SST: &str = r#"{
    "id": "sst",
    "variables": ["sst"],
    "target_resolution": 0.25,
    "start_date": "2020-01-01",
    "sources": [
        {"id": "oisst", "start": "2020-01-01", "priority": 1, "resolution": 0.25,
         "format": "json_gz",
         "fetch": {"kind": "http", "url": "https://example.org/{YYYY}/{YYYYMMDD}.json.gz",
                   "timeout_secs": 900, "token_env": "OISST_TOKEN"}}
    ]
}"#;

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
}

#[test]
fn resolve_config_applies_defaults() {
    let config = Config {
        schema_version: None,
        store_root: Some("/tmp/ocean-store".to_string()),
        datasets_dir: None,
        datasets: vec![serde_json::from_str(SST).unwrap()],
        workers: None,
        retry: None,
        min_free_bytes: None,
    };

    let resolved = ConfigLoader::resolve_config(config, today()).unwrap();
    assert_eq!(resolved.schema_version, 1);
    assert_eq!(resolved.settings.store_root.as_str(), "/tmp/ocean-store");
    assert_eq!(resolved.settings.retry.max_attempts, 3);
    assert!(resolved.settings.workers >= 1);

    let sst = &resolved.datasets[0];
    assert_eq!(sst.convention, LonConvention::Signed);
    assert_eq!(sst.frequency, UpdateFrequency::Daily);
    assert_eq!(sst.latency_days, 1);
    assert_eq!(sst.overlap_preference, PriorityOrder::HighestValue);
    assert_eq!(sst.sources[0].format, RawFormat::JsonGz);
    assert_eq!(sst.sources[0].variables.get("sst"), Some(&"sst".to_string()));
    assert_matches!(
        &sst.sources[0].fetch,
        FetchSpec::Http { timeout_secs: 900, token_env: Some(name), .. } if name == "OISST_TOKEN"
    );
    assert_eq!(
        sst.latest_available(today()),
        NaiveDate::from_ymd_opt(2024, 1, 9).unwrap()
    );
}

#[test]
fn resolve_loads_dataset_directory_relative_to_config() {
    let temp = tempfile::tempdir().unwrap();
    let datasets = temp.path().join("datasets");
    fs::create_dir_all(&datasets).unwrap();
    fs::write(datasets.join("sst.json"), SST).unwrap();
    fs::write(datasets.join("notes.txt"), "ignored").unwrap();

    let store_root = temp.path().join("store");
    let config_path = temp.path().join("ocean-sync.json");
    fs::write(
        &config_path,
        serde_json::json!({
            "store_root": store_root.to_str().unwrap(),
            "datasets_dir": "datasets",
            "workers": 2,
            "retry": {"max_attempts": 5, "base_delay_ms": 10},
        })
        .to_string(),
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(Some(config_path.to_str().unwrap())).unwrap();
    assert_eq!(resolved.datasets.len(), 1);
    assert_eq!(resolved.datasets[0].id.as_str(), "sst");
    assert_eq!(resolved.settings.workers, 2);
    assert_eq!(resolved.settings.retry.max_attempts, 5);
    assert_eq!(resolved.settings.retry.base_delay_ms, 10);
    assert_eq!(resolved.settings.retry.max_delay_ms, 120_000);
}

#[test]
fn duplicate_dataset_ids_are_rejected() {
    let config = Config {
        schema_version: Some(1),
        store_root: Some("/tmp/ocean-store".to_string()),
        datasets_dir: None,
        datasets: vec![
            serde_json::from_str(SST).unwrap(),
            serde_json::from_str(SST).unwrap(),
        ],
        workers: None,
        retry: None,
        min_free_bytes: None,
    };
    let err = ConfigLoader::resolve_config(config, today()).unwrap_err();
    assert_matches!(err, SyncError::InvalidConfig(message) if message.contains("twice"));
}

#[test]
fn equal_priorities_on_overlapping_windows_are_rejected() {
    let mut document: ocean_sync::config::DatasetDocument = serde_json::from_str(SST).unwrap();
    let mut second = document.sources[0].clone();
    second.id = "mirror".to_string();
    document.sources.push(second);
    document.overlap_preference = Some(PriorityOrder::LowestValue);

    let err = ConfigLoader::resolve_dataset(document).unwrap_err();
    assert_matches!(err, SyncError::InvalidConfig(message) if message.contains("share priority"));
}

#[test]
fn source_must_provide_every_canonical_variable() {
    let mut document: ocean_sync::config::DatasetDocument = serde_json::from_str(SST).unwrap();
    document.variables.push("sst_anomaly".to_string());
    document.sources[0]
        .variables
        .insert("analysed_sst".to_string(), "sst".to_string());

    let err = ConfigLoader::resolve_dataset(document).unwrap_err();
    assert_matches!(err, SyncError::InvalidConfig(message) if message.contains("sst_anomaly"));
}

#[test]
fn missing_explicit_config_is_a_read_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    let err = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap_err();
    assert_matches!(err, SyncError::ConfigRead(_));
}
