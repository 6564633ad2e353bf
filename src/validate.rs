use std::fmt;

use serde::Serialize;

use crate::config::DatasetDescriptor;
use crate::granule::CanonicalGranule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckCategory {
    Structure,
    Coordinates,
    MissingValues,
    PhysicalRange,
    ArtifactSize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Violation {
    DimensionCardinality {
        dimension: String,
        expected: usize,
        actual: usize,
    },
    MissingVariable {
        variable: String,
    },
    VariableShape {
        variable: String,
        expected: usize,
        actual: usize,
    },
    LatitudeBounds {
        value: f64,
    },
    LongitudeBounds {
        value: f64,
    },
    NonFiniteFraction {
        variable: String,
        fraction: f64,
        threshold: f64,
    },
    PhysicalRange {
        variable: String,
        min: f64,
        max: f64,
        fraction: f64,
    },
    VectorMagnitude {
        components: String,
        max: f64,
        fraction: f64,
    },
    ArtifactSize {
        bytes: u64,
        min_bytes: u64,
        max_bytes: Option<u64>,
    },
}

impl Violation {
    pub fn category(&self) -> CheckCategory {
        match self {
            Violation::DimensionCardinality { .. }
            | Violation::MissingVariable { .. }
            | Violation::VariableShape { .. } => CheckCategory::Structure,
            Violation::LatitudeBounds { .. } | Violation::LongitudeBounds { .. } => {
                CheckCategory::Coordinates
            }
            Violation::NonFiniteFraction { .. } => CheckCategory::MissingValues,
            Violation::PhysicalRange { .. } | Violation::VectorMagnitude { .. } => {
                CheckCategory::PhysicalRange
            }
            Violation::ArtifactSize { .. } => CheckCategory::ArtifactSize,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::DimensionCardinality {
                dimension,
                expected,
                actual,
            } => write!(f, "{dimension} has {actual} cells, expected {expected}"),
            Violation::MissingVariable { variable } => write!(f, "variable {variable} missing"),
            Violation::VariableShape {
                variable,
                expected,
                actual,
            } => write!(f, "{variable} has {actual} values, expected {expected}"),
            Violation::LatitudeBounds { value } => write!(f, "latitude {value} out of bounds"),
            Violation::LongitudeBounds { value } => write!(f, "longitude {value} out of bounds"),
            Violation::NonFiniteFraction {
                variable,
                fraction,
                threshold,
            } => write!(
                f,
                "{variable} is {:.1}% non-finite (limit {:.1}%)",
                fraction * 100.0,
                threshold * 100.0
            ),
            Violation::PhysicalRange {
                variable,
                min,
                max,
                fraction,
            } => write!(
                f,
                "{variable}: {:.3}% of values outside [{min}, {max}]",
                fraction * 100.0
            ),
            Violation::VectorMagnitude {
                components,
                max,
                fraction,
            } => write!(
                f,
                "|{components}|: {:.3}% of values above {max}",
                fraction * 100.0
            ),
            Violation::ArtifactSize {
                bytes,
                min_bytes,
                max_bytes,
            } => match max_bytes {
                Some(max) => write!(f, "artifact is {bytes} bytes, expected {min_bytes}..={max}"),
                None => write!(f, "artifact is {bytes} bytes, expected at least {min_bytes}"),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    fn fail(violations: Vec<Violation>) -> Self {
        Self {
            passed: false,
            violations,
        }
    }

    pub fn failed_category(&self) -> Option<CheckCategory> {
        self.violations.first().map(Violation::category)
    }

    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

type Check = fn(&CanonicalGranule, &DatasetDescriptor, u64) -> Vec<Violation>;

const CHECKS: [Check; 5] = [
    check_structure,
    check_coordinates,
    check_missing_values,
    check_physical_ranges,
    check_artifact_size,
];

pub struct Validator;

impl Validator {
    pub fn validate(granule: &CanonicalGranule, dataset: &DatasetDescriptor) -> ValidationReport {
        let bytes = granule
            .encode()
            .map(|encoded| encoded.len() as u64)
            .unwrap_or(0);
        Self::validate_sized(granule, dataset, bytes)
    }

    pub fn validate_sized(
        granule: &CanonicalGranule,
        dataset: &DatasetDescriptor,
        artifact_bytes: u64,
    ) -> ValidationReport {
        for check in CHECKS {
            let violations = check(granule, dataset, artifact_bytes);
            if !violations.is_empty() {
                return ValidationReport::fail(violations);
            }
        }
        ValidationReport::pass()
    }
}

fn check_structure(
    granule: &CanonicalGranule,
    dataset: &DatasetDescriptor,
    _bytes: u64,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    let (lat, lon) = dataset.expected_shape();
    let dimensions = [("lat", lat, granule.lat.len()), ("lon", lon, granule.lon.len())];
    for (dimension, expected, actual) in dimensions {
        if expected != actual {
            violations.push(Violation::DimensionCardinality {
                dimension: dimension.to_string(),
                expected,
                actual,
            });
        }
    }
    let cells = granule.cell_count();
    for name in &dataset.variables {
        match granule.variable(name) {
            None => violations.push(Violation::MissingVariable {
                variable: name.clone(),
            }),
            Some(variable) if variable.values.len() != cells => {
                violations.push(Violation::VariableShape {
                    variable: name.clone(),
                    expected: cells,
                    actual: variable.values.len(),
                })
            }
            Some(_) => {}
        }
    }
    violations
}

fn check_coordinates(
    granule: &CanonicalGranule,
    dataset: &DatasetDescriptor,
    _bytes: u64,
) -> Vec<Violation> {
    let lat = granule
        .lat
        .iter()
        .filter(|value| !(-90.0..=90.0).contains(*value))
        .map(|value| Violation::LatitudeBounds { value: *value });
    let lon = granule
        .lon
        .iter()
        .filter(|value| !dataset.convention.contains(**value))
        .map(|value| Violation::LongitudeBounds { value: *value });
    lat.chain(lon).collect()
}

fn check_missing_values(
    granule: &CanonicalGranule,
    dataset: &DatasetDescriptor,
    _bytes: u64,
) -> Vec<Violation> {
    let threshold = dataset.validation.max_nonfinite_fraction;
    granule
        .variables
        .iter()
        .filter_map(|variable| {
            let fraction = fraction_of(&variable.values, |value| !value.is_finite());
            (fraction > threshold).then(|| Violation::NonFiniteFraction {
                variable: variable.name.clone(),
                fraction,
                threshold,
            })
        })
        .collect()
}

fn check_physical_ranges(
    granule: &CanonicalGranule,
    dataset: &DatasetDescriptor,
    _bytes: u64,
) -> Vec<Violation> {
    let bounds = &dataset.validation;
    let mut violations = Vec::new();
    for (name, range) in &bounds.ranges {
        let Some(variable) = granule.variable(name) else {
            continue;
        };
        let finite: Vec<f64> = variable
            .values
            .iter()
            .copied()
            .filter(|value| value.is_finite())
            .collect();
        let fraction = fraction_of(&finite, |value| value < range.min || value > range.max);
        if fraction > bounds.range_tolerance {
            violations.push(Violation::PhysicalRange {
                variable: name.clone(),
                min: range.min,
                max: range.max,
                fraction,
            });
        }
    }
    for limit in &bounds.magnitudes {
        let [first, second] = &limit.components;
        let (Some(u), Some(v)) = (granule.variable(first), granule.variable(second)) else {
            continue;
        };
        let magnitudes: Vec<f64> = u
            .values
            .iter()
            .zip(&v.values)
            .map(|(u, v)| u.hypot(*v))
            .filter(|value| value.is_finite())
            .collect();
        let fraction = fraction_of(&magnitudes, |value| value > limit.max);
        if fraction > bounds.range_tolerance {
            violations.push(Violation::VectorMagnitude {
                components: format!("{first},{second}"),
                max: limit.max,
                fraction,
            });
        }
    }
    violations
}

fn check_artifact_size(
    _granule: &CanonicalGranule,
    dataset: &DatasetDescriptor,
    bytes: u64,
) -> Vec<Violation> {
    let bounds = &dataset.validation;
    let too_small = bytes < bounds.min_bytes;
    let too_large = bounds.max_bytes.map(|max| bytes > max).unwrap_or(false);
    if too_small || too_large {
        vec![Violation::ArtifactSize {
            bytes,
            min_bytes: bounds.min_bytes,
            max_bytes: bounds.max_bytes,
        }]
    } else {
        Vec::new()
    }
}

fn fraction_of(values: &[f64], predicate: impl Fn(f64) -> bool) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().filter(|value| predicate(**value)).count() as f64 / values.len() as f64
}
