use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDate;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::config::RawFormat;
use crate::domain::{DatasetId, LonConvention, SourceId};
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawGranule {
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    #[serde(default)]
    pub depth: Option<Vec<f64>>,
    pub variables: BTreeMap<String, RawVariable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawVariable {
    #[serde(with = "nullable_floats")]
    pub data: Vec<f64>,
}

impl RawGranule {
    pub fn read(path: &Path, format: RawFormat) -> Result<Self, SyncError> {
        let bytes = fs::read(path)
            .map_err(|err| SyncError::Corruption(format!("read {}: {err}", path.display())))?;
        Self::decode(&bytes, format)
    }

    pub fn decode(bytes: &[u8], format: RawFormat) -> Result<Self, SyncError> {
        if bytes.is_empty() {
            return Err(SyncError::Corruption("raw granule is empty".to_string()));
        }
        let granule: RawGranule = match format {
            RawFormat::Json => serde_json::from_slice(bytes)
                .map_err(|err| SyncError::Corruption(err.to_string()))?,
            RawFormat::JsonGz => {
                let mut text = String::new();
                GzDecoder::new(bytes)
                    .read_to_string(&mut text)
                    .map_err(|err| SyncError::Corruption(format!("gzip: {err}")))?;
                serde_json::from_str(&text)
                    .map_err(|err| SyncError::Corruption(err.to_string()))?
            }
        };
        Ok(granule)
    }

    pub fn depth_len(&self) -> usize {
        self.depth.as_ref().map(Vec::len).unwrap_or(1)
    }

    pub fn layer_len(&self) -> usize {
        self.lat.len() * self.lon.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalGranule {
    pub dataset: DatasetId,
    pub date: NaiveDate,
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    pub variables: Vec<GridVariable>,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridVariable {
    pub name: String,
    #[serde(with = "nullable_floats")]
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: SourceId,
    pub native_convention: LonConvention,
    pub lon_remapped: bool,
    pub depth_selected: Option<f64>,
    pub resample_factor: usize,
    pub renamed: BTreeMap<String, String>,
    pub tool: String,
}

impl CanonicalGranule {
    pub fn variable(&self, name: &str) -> Option<&GridVariable> {
        self.variables.iter().find(|variable| variable.name == name)
    }

    pub fn cell_count(&self) -> usize {
        self.lat.len() * self.lon.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(self).map_err(|err| SyncError::Filesystem(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        serde_json::from_slice(bytes).map_err(|err| SyncError::Corruption(err.to_string()))
    }

    pub fn read(path: &Path) -> Result<Self, SyncError> {
        let bytes = fs::read(path)
            .map_err(|err| SyncError::Corruption(format!("read {}: {err}", path.display())))?;
        Self::decode(&bytes)
    }
}

// JSON has no NaN, so non-finite cells travel as `null`.
mod nullable_floats {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(
            values
                .iter()
                .map(|value| value.is_finite().then_some(*value)),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let values = Vec::<Option<f64>>::deserialize(deserializer)?;
        Ok(values
            .into_iter()
            .map(|value| value.unwrap_or(f64::NAN))
            .collect())
    }
}
