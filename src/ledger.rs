use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::{Mutex, MutexGuard};

use camino::Utf8PathBuf;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DatasetDescriptor;
use crate::domain::{DatasetId, SyncStatus};
use crate::error::{ErrorKind, SyncError};
use crate::store::Store;

pub const LEDGER_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    pub kind: ErrorKind,
    pub date: Option<NaiveDate>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub kind: ErrorKind,
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_synced_date: Option<NaiveDate>,
    pub contiguous_from: Option<NaiveDate>,
    pub total_granules: u64,
    pub storage_bytes: u64,
    pub last_error: Option<RecordedError>,
    pub status: SyncStatus,
    #[serde(default)]
    pub recorded_gaps: BTreeSet<NaiveDate>,
    #[serde(default)]
    pub quarantined: BTreeMap<NaiveDate, QuarantineEntry>,
    #[serde(default)]
    pub confirmed_ahead: BTreeSet<NaiveDate>,
}

impl SyncState {
    fn advance(&mut self, dataset: &DatasetDescriptor) {
        let mut cursor = match self.last_synced_date {
            Some(date) => dataset.frequency.next(dataset.start_date, date),
            None => Some(dataset.start_date),
        };
        while let Some(date) = cursor {
            if self.confirmed_ahead.remove(&date) {
                self.last_synced_date = Some(date);
                self.contiguous_from.get_or_insert(date);
            } else if !self.recorded_gaps.contains(&date) {
                break;
            }
            cursor = dataset.frequency.next(dataset.start_date, date);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageTotals {
    pub granules: u64,
    pub storage_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDocument {
    pub schema_version: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub totals: StorageTotals,
    pub datasets: BTreeMap<DatasetId, SyncState>,
}

impl Default for LedgerDocument {
    fn default() -> Self {
        Self {
            schema_version: LEDGER_SCHEMA_VERSION,
            last_health_check: None,
            totals: StorageTotals::default(),
            datasets: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskObservation {
    pub verified_through: Option<NaiveDate>,
    pub contiguous_from: Option<NaiveDate>,
    pub ahead: BTreeSet<NaiveDate>,
    pub granules: u64,
    pub storage_bytes: u64,
}

#[derive(Debug)]
pub struct StatusLedger {
    path: Utf8PathBuf,
    document: Mutex<LedgerDocument>,
}

impl StatusLedger {
    pub fn open(path: Utf8PathBuf) -> Result<Self, SyncError> {
        if let Some(dir) = path.parent() {
            let stale = Store::remove_temp_files(dir)?;
            if stale > 0 {
                tracing::debug!(removed = stale, "removed stale ledger temp files");
            }
        }
        Self::load(path)
    }

    pub fn load(path: Utf8PathBuf) -> Result<Self, SyncError> {
        let document = if path.as_std_path().exists() {
            let content = fs::read(path.as_std_path())
                .map_err(|err| SyncError::Ledger(format!("read {path}: {err}")))?;
            let document: LedgerDocument = serde_json::from_slice(&content)
                .map_err(|err| SyncError::Ledger(format!("parse {path}: {err}")))?;
            if document.schema_version > LEDGER_SCHEMA_VERSION {
                return Err(SyncError::Ledger(format!(
                    "ledger schema {} is newer than supported {LEDGER_SCHEMA_VERSION}",
                    document.schema_version
                )));
            }
            document
        } else {
            LedgerDocument::default()
        };
        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    pub fn read(&self, dataset: &DatasetId) -> Result<SyncState, SyncError> {
        Ok(self
            .lock()?
            .datasets
            .get(dataset)
            .cloned()
            .unwrap_or_default())
    }

    pub fn snapshot(&self) -> Result<LedgerDocument, SyncError> {
        Ok(self.lock()?.clone())
    }

    pub fn record_success(
        &self,
        dataset: &DatasetDescriptor,
        date: NaiveDate,
        size_bytes: u64,
    ) -> Result<SyncState, SyncError> {
        self.mutate(&dataset.id, |state| {
            state.total_granules += 1;
            state.storage_bytes += size_bytes;
            state.quarantined.remove(&date);
            let behind = state
                .last_synced_date
                .map(|last| date <= last)
                .unwrap_or(false);
            if !behind {
                state.confirmed_ahead.insert(date);
                state.advance(dataset);
            }
        })
    }

    pub fn record_failure(
        &self,
        dataset: &DatasetId,
        date: NaiveDate,
        kind: ErrorKind,
        message: &str,
    ) -> Result<SyncState, SyncError> {
        self.mutate(dataset, |state| {
            state.last_error = Some(RecordedError {
                kind,
                date: Some(date),
                message: message.to_string(),
            });
        })
    }

    pub fn record_gap(
        &self,
        dataset: &DatasetDescriptor,
        date: NaiveDate,
    ) -> Result<SyncState, SyncError> {
        self.mutate(&dataset.id, |state| {
            state.recorded_gaps.insert(date);
            state.advance(dataset);
        })
    }

    pub fn quarantine(
        &self,
        dataset: &DatasetId,
        date: NaiveDate,
        entry: QuarantineEntry,
    ) -> Result<SyncState, SyncError> {
        self.mutate(dataset, |state| {
            state.last_error = Some(RecordedError {
                kind: entry.kind,
                date: Some(date),
                message: entry.message.clone(),
            });
            state.quarantined.insert(date, entry);
        })
    }

    pub fn release_bytes(
        &self,
        dataset: &DatasetId,
        size_bytes: u64,
    ) -> Result<SyncState, SyncError> {
        self.mutate(dataset, |state| {
            state.total_granules = state.total_granules.saturating_sub(1);
            state.storage_bytes = state.storage_bytes.saturating_sub(size_bytes);
        })
    }

    pub fn reconcile(
        &self,
        dataset: &DatasetId,
        observed: &DiskObservation,
    ) -> Result<bool, SyncError> {
        let mut overclaimed = false;
        self.mutate_if_changed(dataset, |state| {
            overclaimed = match (state.last_synced_date, observed.verified_through) {
                (Some(claimed), Some(verified)) => claimed > verified,
                (Some(_), None) => true,
                _ => false,
            };
            state.last_synced_date = observed.verified_through;
            state.contiguous_from = observed.contiguous_from;
            state.confirmed_ahead = observed.ahead.clone();
            state.total_granules = observed.granules;
            state.storage_bytes = observed.storage_bytes;
        })?;
        Ok(overclaimed)
    }

    pub fn set_status(
        &self,
        dataset: &DatasetId,
        status: SyncStatus,
    ) -> Result<SyncState, SyncError> {
        self.mutate_if_changed(dataset, |state| state.status = status)
    }

    pub fn clear_error(&self, dataset: &DatasetId) -> Result<SyncState, SyncError> {
        self.mutate_if_changed(dataset, |state| state.last_error = None)
    }

    pub fn mark_health_check(&self, at: DateTime<Utc>) -> Result<(), SyncError> {
        let mut document = self.lock()?;
        document.last_health_check = Some(at);
        self.flush(&document)
    }

    fn mutate(
        &self,
        dataset: &DatasetId,
        apply: impl FnOnce(&mut SyncState),
    ) -> Result<SyncState, SyncError> {
        let mut document = self.lock()?;
        let state = document.datasets.entry(dataset.clone()).or_default();
        apply(state);
        let updated = state.clone();
        refresh_totals(&mut document);
        self.flush(&document)?;
        Ok(updated)
    }

    // Skips the disk write when nothing changed, which keeps repeated runs
    // from touching the ledger file at all.
    fn mutate_if_changed(
        &self,
        dataset: &DatasetId,
        apply: impl FnOnce(&mut SyncState),
    ) -> Result<SyncState, SyncError> {
        let mut document = self.lock()?;
        let before = document.datasets.get(dataset).cloned();
        let state = document.datasets.entry(dataset.clone()).or_default();
        apply(state);
        let updated = state.clone();
        if before.as_ref() != Some(&updated) {
            refresh_totals(&mut document);
            self.flush(&document)?;
        }
        Ok(updated)
    }

    fn flush(&self, document: &LedgerDocument) -> Result<(), SyncError> {
        let content = serde_json::to_vec_pretty(document)
            .map_err(|err| SyncError::Ledger(err.to_string()))?;
        Store::write_bytes_atomic(&self.path, &content)
            .map_err(|err| SyncError::Ledger(format!("flush {}: {err}", self.path)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerDocument>, SyncError> {
        self.document
            .lock()
            .map_err(|_| SyncError::Ledger("ledger mutex poisoned".to_string()))
    }
}

fn refresh_totals(document: &mut LedgerDocument) {
    document.totals = document
        .datasets
        .values()
        .fold(StorageTotals::default(), |totals, state| StorageTotals {
            granules: totals.granules + state.total_granules,
            storage_bytes: totals.storage_bytes + state.storage_bytes,
        });
}
