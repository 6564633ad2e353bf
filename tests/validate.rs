use std::collections::BTreeMap;

use assert_matches::assert_matches;
use chrono::NaiveDate;

use ocean_sync::config::{ConfigLoader, DatasetDescriptor};
use ocean_sync::domain::LonConvention;
use ocean_sync::granule::{CanonicalGranule, GridVariable, Provenance};
use ocean_sync::validate::{CheckCategory, Validator, Violation};

fn carbonate() -> DatasetDescriptor {
    let document = serde_json::json!({
        "id": "carbonate",
        "variables": ["ph", "u", "v"],
        "target_resolution": 1.0,
        "domain": {"lat_min": -2.0, "lat_max": 2.0, "lon_min": -2.0, "lon_max": 2.0},
        "start_date": "2022-01-01",
        "validation": {
            "ranges": {"ph": {"min": 0.0, "max": 14.0}},
            "magnitudes": [{"components": ["u", "v"], "max": 4.0}]
        },
        "sources": [{
            "id": "model", "start": "2022-01-01", "priority": 1, "resolution": 1.0,
            "fetch": {"kind": "local_dir", "root": "/unused", "pattern": "{YYYYMMDD}.json"}
        }]
    });
    ConfigLoader::resolve_dataset(serde_json::from_value(document).unwrap()).unwrap()
}

fn granule(ph: f64, u: f64) -> CanonicalGranule {
    let axis = vec![-1.5, -0.5, 0.5, 1.5];
    let layer = |value: f64| vec![value; 16];
    CanonicalGranule {
        dataset: "carbonate".parse().unwrap(),
        date: NaiveDate::from_ymd_opt(2022, 3, 1).unwrap(),
        lat: axis.clone(),
        lon: axis,
        variables: vec![
            GridVariable { name: "ph".to_string(), values: layer(ph) },
            GridVariable { name: "u".to_string(), values: layer(u) },
            GridVariable { name: "v".to_string(), values: layer(0.0) },
        ],
        provenance: Provenance {
            source_id: "model".parse().unwrap(),
            native_convention: LonConvention::Signed,
            lon_remapped: false,
            depth_selected: None,
            resample_factor: 1,
            renamed: BTreeMap::new(),
            tool: "ocean-sync/test".to_string(),
        },
    }
}

#[test]
fn plausible_granule_passes() {
    let report = Validator::validate(&granule(8.1, 0.5), &carbonate());
    assert!(report.passed);
    assert!(report.violations.is_empty());
    assert_eq!(report.failed_category(), None);
}

#[test]
fn out_of_range_ph_fails_physical_range() {
    let report = Validator::validate(&granule(15.0, 0.5), &carbonate());
    assert!(!report.passed);
    assert_eq!(report.failed_category(), Some(CheckCategory::PhysicalRange));
    assert_matches!(
        &report.violations[0],
        Violation::PhysicalRange { variable, fraction, .. } if variable == "ph" && *fraction == 1.0
    );
    assert!(report.summary().contains("ph"));
}

#[test]
fn excessive_current_speed_fails() {
    let report = Validator::validate(&granule(8.1, 5.0), &carbonate());
    assert_matches!(
        report.violations.as_slice(),
        [Violation::VectorMagnitude { components, .. }] if components == "u,v"
    );
}

#[test]
fn empty_artifact_fails_size_check() {
    let report = Validator::validate_sized(&granule(8.1, 0.5), &carbonate(), 0);
    assert_eq!(report.failed_category(), Some(CheckCategory::ArtifactSize));
    assert_matches!(report.violations[0], Violation::ArtifactSize { bytes: 0, min_bytes: 64, .. });
}

#[test]
fn mostly_missing_variable_fails() {
    let report = Validator::validate(&granule(f64::NAN, 0.5), &carbonate());
    assert_eq!(report.failed_category(), Some(CheckCategory::MissingValues));
}

#[test]
fn validation_stops_at_first_failing_group() {
    let mut broken = granule(15.0, 0.5);
    broken.lat.pop();
    broken.variables.retain(|variable| variable.name != "v");

    let report = Validator::validate(&broken, &carbonate());
    assert!(report
        .violations
        .iter()
        .all(|violation| violation.category() == CheckCategory::Structure));
    assert!(report
        .violations
        .contains(&Violation::MissingVariable { variable: "v".to_string() }));
}

#[test]
fn longitude_outside_canonical_range_fails() {
    let mut shifted = granule(8.1, 0.5);
    shifted.lon = vec![178.5, 179.5, 180.5, 181.5];
    let report = Validator::validate(&shifted, &carbonate());
    assert_eq!(report.failed_category(), Some(CheckCategory::Coordinates));
    assert_eq!(report.violations.len(), 2);
}
