use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::domain::{DatasetId, LonConvention, SourceId, UpdateFrequency};
use crate::error::SyncError;

pub const CONFIG_FILE_NAME: &str = "ocean-sync.json";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub store_root: Option<String>,
    #[serde(default)]
    pub datasets_dir: Option<String>,
    #[serde(default)]
    pub datasets: Vec<DatasetDocument>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub min_free_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetDocument {
    pub id: String,
    pub variables: Vec<String>,
    #[serde(default = "default_convention")]
    pub convention: LonConvention,
    pub target_resolution: f64,
    #[serde(default)]
    pub domain: Option<GridDomain>,
    #[serde(default)]
    pub surface_band: Option<DepthBand>,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default = "default_frequency")]
    pub frequency: UpdateFrequency,
    #[serde(default)]
    pub latency_days: Option<u64>,
    #[serde(default)]
    pub overlap_preference: Option<PriorityOrder>,
    #[serde(default)]
    pub gaps: Vec<DateSpan>,
    #[serde(default)]
    pub validation: Option<ValidationBounds>,
    pub sources: Vec<SourceDocument>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceDocument {
    pub id: String,
    pub start: NaiveDate,
    #[serde(default)]
    pub end: Option<NaiveDate>,
    pub priority: u32,
    #[serde(default = "default_convention")]
    pub convention: LonConvention,
    pub resolution: f64,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub format: RawFormat,
    pub fetch: FetchSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct GridDomain {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl Default for GridDomain {
    fn default() -> Self {
        Self {
            lat_min: -90.0,
            lat_max: 90.0,
            lon_min: -180.0,
            lon_max: 180.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct DepthBand {
    pub min_depth: f64,
    pub max_depth: f64,
}

impl DepthBand {
    pub fn contains(&self, depth: f64) -> bool {
        depth >= self.min_depth && depth <= self.max_depth
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct DateSpan {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateSpan {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityOrder {
    HighestValue,
    LowestValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RawFormat {
    #[default]
    Json,
    JsonGz,
}

impl RawFormat {
    pub fn extension(self) -> &'static str {
        match self {
            RawFormat::Json => "json",
            RawFormat::JsonGz => "json.gz",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchSpec {
    Http {
        url: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
        #[serde(default)]
        token_env: Option<String>,
    },
    LocalDir { root: String, pattern: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VariableRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MagnitudeLimit {
    pub components: [String; 2],
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ValidationBounds {
    #[serde(default = "default_nonfinite_fraction")]
    pub max_nonfinite_fraction: f64,
    #[serde(default = "default_range_tolerance")]
    pub range_tolerance: f64,
    #[serde(default)]
    pub ranges: BTreeMap<String, VariableRange>,
    #[serde(default)]
    pub magnitudes: Vec<MagnitudeLimit>,
    #[serde(default = "default_min_bytes")]
    pub min_bytes: u64,
    #[serde(default)]
    pub max_bytes: Option<u64>,
}

impl Default for ValidationBounds {
    fn default() -> Self {
        Self {
            max_nonfinite_fraction: default_nonfinite_fraction(),
            range_tolerance: default_range_tolerance(),
            ranges: BTreeMap::new(),
            magnitudes: Vec::new(),
            min_bytes: default_min_bytes(),
            max_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceWindow {
    pub source_id: SourceId,
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,
    pub priority: u32,
    pub convention: LonConvention,
    pub resolution: f64,
    pub variables: BTreeMap<String, String>,
    pub format: RawFormat,
    pub fetch: FetchSpec,
}

impl SourceWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && self.end.map(|end| date <= end).unwrap_or(true)
    }

    fn overlaps(&self, other: &SourceWindow) -> bool {
        let self_end = self.end.unwrap_or(NaiveDate::MAX);
        let other_end = other.end.unwrap_or(NaiveDate::MAX);
        self.start <= other_end && other.start <= self_end
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetDescriptor {
    pub id: DatasetId,
    pub variables: Vec<String>,
    pub convention: LonConvention,
    pub target_resolution: f64,
    pub domain: GridDomain,
    pub surface_band: Option<DepthBand>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub frequency: UpdateFrequency,
    pub latency_days: u64,
    pub overlap_preference: PriorityOrder,
    pub gaps: Vec<DateSpan>,
    pub validation: ValidationBounds,
    pub sources: Vec<SourceWindow>,
}

impl DatasetDescriptor {
    pub fn expected_shape(&self) -> (usize, usize) {
        let lat = ((self.domain.lat_max - self.domain.lat_min) / self.target_resolution).round();
        let lon = ((self.domain.lon_max - self.domain.lon_min) / self.target_resolution).round();
        (lat.max(0.0) as usize, lon.max(0.0) as usize)
    }

    pub fn latest_available(&self, today: NaiveDate) -> NaiveDate {
        let latest = today
            .checked_sub_days(Days::new(self.latency_days))
            .unwrap_or(today);
        match self.end_date {
            Some(end) if end < latest => end,
            _ => latest,
        }
    }

    pub fn is_declared_gap(&self, date: NaiveDate) -> bool {
        self.gaps.iter().any(|span| span.contains(date))
    }

    pub fn check_coverage(&self, today: NaiveDate) -> Result<(), SyncError> {
        let latest = self.latest_available(today);
        let uncovered = self
            .frequency
            .schedule(self.start_date, self.start_date, latest)
            .filter(|date| {
                !self.is_declared_gap(*date)
                    && !self.sources.iter().any(|window| window.contains(*date))
            })
            .collect::<Vec<_>>();
        match (uncovered.first(), uncovered.last()) {
            (Some(first), Some(last)) => Err(SyncError::InvalidConfig(format!(
                "{}: {} scheduled dates between {first} and {last} have no source window or declared gap",
                self.id,
                uncovered.len()
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub store_root: Utf8PathBuf,
    pub workers: usize,
    pub retry: RetryConfig,
    pub min_free_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub settings: EngineSettings,
    pub datasets: Vec<DatasetDescriptor>,
}

impl ResolvedConfig {
    pub fn dataset(&self, id: &DatasetId) -> Option<&DatasetDescriptor> {
        self.datasets.iter().find(|dataset| &dataset.id == id)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SyncError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE_NAME),
        };

        if path.is_none() && !config_path.exists() {
            return Err(SyncError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        let mut config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;

        let base_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        if let Some(dir) = config.datasets_dir.as_deref() {
            config
                .datasets
                .extend(Self::load_dataset_dir(&base_dir.join(dir))?);
        }

        let today = chrono::Utc::now().date_naive();
        Self::resolve_config(config, today)
    }

    pub fn load_dataset_dir(dir: &Path) -> Result<Vec<DatasetDocument>, SyncError> {
        let entries = fs::read_dir(dir).map_err(|_| SyncError::ConfigRead(dir.to_path_buf()))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_file() && path.extension().map(|ext| ext == "json").unwrap_or(false) {
                paths.push(path);
            }
        }
        paths.sort();
        paths
            .iter()
            .map(|path| Self::load_dataset(path))
            .collect()
    }

    pub fn load_dataset(path: &Path) -> Result<DatasetDocument, SyncError> {
        let content =
            fs::read_to_string(path).map_err(|_| SyncError::ConfigRead(path.to_path_buf()))?;
        serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(format!("{}: {err}", path.display())))
    }

    pub fn resolve_config(config: Config, today: NaiveDate) -> Result<ResolvedConfig, SyncError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let store_root = match config.store_root {
            Some(root) => Utf8PathBuf::from(root),
            None => default_store_root()?,
        };
        let settings = EngineSettings {
            store_root,
            workers: config.workers.unwrap_or_else(default_workers).max(1),
            retry: config.retry.unwrap_or_default(),
            min_free_bytes: config.min_free_bytes.unwrap_or(DEFAULT_MIN_FREE_BYTES),
        };
        if settings.retry.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        let mut datasets = Vec::new();
        for document in config.datasets {
            let descriptor = Self::resolve_dataset(document)?;
            descriptor.check_coverage(today)?;
            if !seen.insert(descriptor.id.clone()) {
                return Err(SyncError::InvalidConfig(format!(
                    "dataset {} is configured twice",
                    descriptor.id
                )));
            }
            datasets.push(descriptor);
        }

        Ok(ResolvedConfig {
            schema_version,
            settings,
            datasets,
        })
    }

    pub fn resolve_dataset(document: DatasetDocument) -> Result<DatasetDescriptor, SyncError> {
        let id: DatasetId = document.id.parse()?;
        let invalid = |message: String| SyncError::InvalidConfig(format!("{id}: {message}"));

        if document.variables.is_empty() {
            return Err(invalid("at least one canonical variable is required".into()));
        }
        if !(document.target_resolution > 0.0) {
            return Err(invalid("target_resolution must be positive".into()));
        }
        let domain = document.domain.unwrap_or_default();
        if domain.lat_min >= domain.lat_max || domain.lon_min >= domain.lon_max {
            return Err(invalid("grid domain bounds are inverted".into()));
        }
        if let Some(band) = document.surface_band {
            if band.min_depth > band.max_depth {
                return Err(invalid("surface_band min_depth exceeds max_depth".into()));
            }
        }
        if document.sources.is_empty() {
            return Err(invalid("at least one source window is required".into()));
        }

        let mut sources = Vec::with_capacity(document.sources.len());
        for source in document.sources {
            let source_id: SourceId = source.id.parse()?;
            if let Some(end) = source.end {
                if end < source.start {
                    return Err(invalid(format!("source {source_id} ends before it starts")));
                }
            }
            if !(source.resolution > 0.0) {
                return Err(invalid(format!("source {source_id} resolution must be positive")));
            }
            let variables = if source.variables.is_empty() {
                document
                    .variables
                    .iter()
                    .map(|name| (name.clone(), name.clone()))
                    .collect()
            } else {
                source.variables
            };
            let mapped: BTreeSet<&String> = variables.values().collect();
            if let Some(missing) = document
                .variables
                .iter()
                .find(|name| !mapped.contains(name))
            {
                return Err(invalid(format!(
                    "source {source_id} does not provide canonical variable {missing}"
                )));
            }
            sources.push(SourceWindow {
                source_id,
                start: source.start,
                end: source.end,
                priority: source.priority,
                convention: source.convention,
                resolution: source.resolution,
                variables,
                format: source.format,
                fetch: source.fetch,
            });
        }

        let mut has_overlap = false;
        for (index, window) in sources.iter().enumerate() {
            for other in &sources[index + 1..] {
                if window.source_id == other.source_id {
                    return Err(invalid(format!("source {} listed twice", window.source_id)));
                }
                if window.overlaps(other) {
                    has_overlap = true;
                    if window.priority == other.priority {
                        return Err(invalid(format!(
                            "overlapping sources {} and {} share priority {}",
                            window.source_id, other.source_id, window.priority
                        )));
                    }
                }
            }
        }
        let overlap_preference = match (document.overlap_preference, has_overlap) {
            (Some(order), _) => order,
            (None, false) => PriorityOrder::HighestValue,
            (None, true) => {
                return Err(invalid(
                    "source windows overlap; overlap_preference must be set explicitly".into(),
                ));
            }
        };

        for span in &document.gaps {
            if span.end < span.start {
                return Err(invalid(format!("declared gap {} ends before it starts", span.start)));
            }
        }

        Ok(DatasetDescriptor {
            id,
            variables: document.variables,
            convention: document.convention,
            target_resolution: document.target_resolution,
            domain,
            surface_band: document.surface_band,
            start_date: document.start_date,
            end_date: document.end_date,
            frequency: document.frequency,
            latency_days: document.latency_days.unwrap_or(DEFAULT_LATENCY_DAYS),
            overlap_preference,
            gaps: document.gaps,
            validation: document.validation.unwrap_or_default(),
            sources,
        })
    }
}

pub const DEFAULT_MIN_FREE_BYTES: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_LATENCY_DAYS: u64 = 1;

pub fn default_store_root() -> Result<Utf8PathBuf, SyncError> {
    directories::BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().join("ocean-sync")).ok())
        .ok_or_else(|| SyncError::Filesystem("unable to resolve data directory".to_string()))
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get().min(8))
        .unwrap_or(4)
}

fn default_convention() -> LonConvention {
    LonConvention::Signed
}

fn default_frequency() -> UpdateFrequency {
    UpdateFrequency::Daily
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_nonfinite_fraction() -> f64 {
    0.9
}

fn default_range_tolerance() -> f64 {
    0.001
}

fn default_min_bytes() -> u64 {
    64
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    120_000
}
