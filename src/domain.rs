use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetId(String);

impl DatasetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        if !is_identifier(&normalized) {
            return Err(SyncError::InvalidDatasetId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for DatasetId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatasetId> for String {
    fn from(value: DatasetId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceId(String);

impl SourceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SourceId {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        if !is_identifier(&normalized) {
            return Err(SyncError::InvalidSourceId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for SourceId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourceId> for String {
    fn from(value: SourceId) -> Self {
        value.0
    }
}

// Ids end up in file names, so keep them to a conservative alphabet.
fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .next()
            .map(|ch| ch.is_ascii_alphanumeric())
            .unwrap_or(false)
        && value
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LonConvention {
    #[serde(rename = "-180..180")]
    Signed,
    #[serde(rename = "0..360")]
    Positive,
}

impl LonConvention {
    pub fn contains(self, lon: f64) -> bool {
        match self {
            LonConvention::Signed => (-180.0..180.0).contains(&lon),
            LonConvention::Positive => (0.0..360.0).contains(&lon),
        }
    }
}

impl fmt::Display for LonConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LonConvention::Signed => write!(f, "-180..180"),
            LonConvention::Positive => write!(f, "0..360"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateFrequency {
    Daily,
    Weekly,
    Monthly,
}

impl UpdateFrequency {
    pub fn nth(self, anchor: NaiveDate, n: u32) -> Option<NaiveDate> {
        match self {
            UpdateFrequency::Daily => anchor.checked_add_days(Days::new(u64::from(n))),
            UpdateFrequency::Weekly => anchor.checked_add_days(Days::new(7 * u64::from(n))),
            UpdateFrequency::Monthly => anchor.checked_add_months(Months::new(n)),
        }
    }

    pub fn next(self, anchor: NaiveDate, date: NaiveDate) -> Option<NaiveDate> {
        match self {
            UpdateFrequency::Daily => date.checked_add_days(Days::new(1)),
            UpdateFrequency::Weekly => date.checked_add_days(Days::new(7)),
            UpdateFrequency::Monthly => {
                // Counted from the anchor so a day-31 anchor survives short months.
                let elapsed = (date.year() - anchor.year()) * 12 + date.month() as i32
                    - anchor.month() as i32;
                let mut n = u32::try_from(elapsed.max(0)).ok()?;
                loop {
                    let candidate = self.nth(anchor, n)?;
                    if candidate > date {
                        return Some(candidate);
                    }
                    n = n.checked_add(1)?;
                }
            }
        }
    }

    pub fn schedule(
        self,
        anchor: NaiveDate,
        from: NaiveDate,
        to: NaiveDate,
    ) -> impl Iterator<Item = NaiveDate> {
        (0u32..)
            .map_while(move |n| self.nth(anchor, n))
            .take_while(move |date| *date <= to)
            .filter(move |date| *date >= from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    NotStarted,
    Syncing,
    Active,
    UpToDate,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStatus::NotStarted => "not_started",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Active => "active",
            SyncStatus::UpToDate => "up_to_date",
            SyncStatus::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Pending,
    Fetching,
    Harmonizing,
    Validating,
    Done,
    Failed,
    PermanentFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GranuleKey {
    pub dataset: DatasetId,
    pub date: NaiveDate,
}

impl fmt::Display for GranuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.dataset, self.date)
    }
}

pub fn compact_date(date: NaiveDate) -> String {
    format!("{:04}{:02}{:02}", date.year(), date.month(), date.day())
}

pub fn parse_date(value: &str) -> Result<NaiveDate, SyncError> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y%m%d"))
        .map_err(|_| SyncError::InvalidDate(value.to_string()))
}
