use std::fs;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::config::{DatasetDescriptor, RetryConfig, SourceWindow};
use crate::domain::{DatasetId, PipelineState, SourceId};
use crate::error::{Disposition, ErrorKind, SyncError};
use crate::fetch::FetchClient;
use crate::granule::RawGranule;
use crate::harmonize::Harmonizer;
use crate::ledger::{QuarantineEntry, StatusLedger};
use crate::store::Store;
use crate::validate::Validator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let multiplier = 2u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryAttempt {
    pub attempt_count: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Granule {
    pub dataset_id: DatasetId,
    pub date: NaiveDate,
    pub source_id: SourceId,
    pub raw_path: Utf8PathBuf,
    pub harmonized_path: Utf8PathBuf,
    pub pipeline_state: PipelineState,
}

impl Granule {
    pub fn new(
        store: &Store,
        dataset: &DatasetDescriptor,
        window: &SourceWindow,
        date: NaiveDate,
    ) -> Self {
        Self {
            dataset_id: dataset.id.clone(),
            date,
            source_id: window.source_id.clone(),
            raw_path: store.raw_path(&dataset.id, date, window.format),
            harmonized_path: store.harmonized_path(&dataset.id, date),
            pipeline_state: PipelineState::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GranuleOutcome {
    Synced { bytes: u64, attempts: u32 },
    NotPublished,
    GapRecorded,
    Quarantined {
        kind: ErrorKind,
        attempts: u32,
        message: String,
    },
    FatalDataset { kind: ErrorKind, message: String },
    FatalRun { kind: ErrorKind, message: String },
}

impl GranuleOutcome {
    fn fatal_run(err: &SyncError) -> Self {
        GranuleOutcome::FatalRun {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

pub struct RecoveryManager<'a> {
    ledger: &'a StatusLedger,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(ledger: &'a StatusLedger, policy: RetryPolicy) -> Self {
        Self {
            ledger,
            policy,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn record_gap(&self, dataset: &DatasetDescriptor, date: NaiveDate) -> GranuleOutcome {
        match self.ledger.record_gap(dataset, date) {
            Ok(_) => {
                tracing::info!(dataset = %dataset.id, %date, "recorded permanent gap");
                GranuleOutcome::GapRecorded
            }
            Err(err) => GranuleOutcome::fatal_run(&err),
        }
    }

    pub fn run(
        &self,
        granule: &mut Granule,
        client: &dyn FetchClient,
        dataset: &DatasetDescriptor,
        window: &SourceWindow,
    ) -> GranuleOutcome {
        let mut attempt = RecoveryAttempt::default();
        loop {
            attempt.attempt_count += 1;
            let error = match self.attempt_once(granule, client, dataset, window) {
                Ok((bytes, replaced)) => {
                    granule.pipeline_state = PipelineState::Done;
                    return self.commit(granule, dataset, bytes, replaced, attempt.attempt_count);
                }
                Err(err) => err,
            };

            if let Err(cleanup) = Store::remove_file(&granule.raw_path) {
                tracing::debug!(path = %granule.raw_path, error = %cleanup, "raw cleanup failed");
            }
            granule.pipeline_state = PipelineState::Failed;
            attempt.last_error_kind = Some(error.kind());

            match error.disposition() {
                Disposition::Skip => {
                    granule.pipeline_state = PipelineState::Pending;
                    tracing::debug!(
                        dataset = %dataset.id,
                        date = %granule.date,
                        "not yet published"
                    );
                    return GranuleOutcome::NotPublished;
                }
                Disposition::PermanentGap => {
                    granule.pipeline_state = PipelineState::PermanentFailure;
                    return self.record_gap(dataset, granule.date);
                }
                Disposition::FatalDataset => {
                    let message = error.to_string();
                    if let Err(err) =
                        self.ledger
                            .record_failure(&dataset.id, granule.date, error.kind(), &message)
                    {
                        return GranuleOutcome::fatal_run(&err);
                    }
                    tracing::error!(
                        dataset = %dataset.id,
                        date = %granule.date,
                        %message,
                        "dataset halted"
                    );
                    return GranuleOutcome::FatalDataset {
                        kind: error.kind(),
                        message,
                    };
                }
                Disposition::FatalRun => {
                    let message = error.to_string();
                    if let Err(err) =
                        self.ledger
                            .record_failure(&dataset.id, granule.date, error.kind(), &message)
                    {
                        tracing::error!(error = %err, "ledger write failed while aborting");
                    }
                    return GranuleOutcome::FatalRun {
                        kind: error.kind(),
                        message,
                    };
                }
                Disposition::Retry if attempt.attempt_count >= self.policy.max_attempts => {
                    granule.pipeline_state = PipelineState::PermanentFailure;
                    let entry = QuarantineEntry {
                        kind: error.kind(),
                        attempts: attempt.attempt_count,
                        message: error.to_string(),
                    };
                    if let Err(err) =
                        self.ledger
                            .quarantine(&dataset.id, granule.date, entry.clone())
                    {
                        return GranuleOutcome::fatal_run(&err);
                    }
                    tracing::warn!(
                        dataset = %dataset.id,
                        date = %granule.date,
                        attempts = entry.attempts,
                        kind = %entry.kind,
                        "granule quarantined"
                    );
                    return GranuleOutcome::Quarantined {
                        kind: entry.kind,
                        attempts: entry.attempts,
                        message: entry.message,
                    };
                }
                Disposition::Retry => {
                    let delay = self.policy.backoff(attempt.attempt_count);
                    attempt.next_retry_at = chrono::Duration::from_std(delay)
                        .ok()
                        .map(|delay| Utc::now() + delay);
                    tracing::debug!(
                        dataset = %dataset.id,
                        date = %granule.date,
                        attempt = attempt.attempt_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying granule"
                    );
                    self.sleeper.sleep(delay);
                    granule.pipeline_state = PipelineState::Pending;
                }
            }
        }
    }

    fn attempt_once(
        &self,
        granule: &mut Granule,
        client: &dyn FetchClient,
        dataset: &DatasetDescriptor,
        window: &SourceWindow,
    ) -> Result<(u64, Option<u64>), SyncError> {
        granule.pipeline_state = PipelineState::Fetching;
        let fetched = client.fetch(granule.date, granule.raw_path.as_std_path())?;
        if fetched == 0 {
            return Err(SyncError::Corruption(format!("{} is empty", granule.raw_path)));
        }

        granule.pipeline_state = PipelineState::Harmonizing;
        let raw = RawGranule::read(granule.raw_path.as_std_path(), window.format)?;
        let canonical = Harmonizer::harmonize(&raw, dataset, window, granule.date)?;

        granule.pipeline_state = PipelineState::Validating;
        let encoded = canonical.encode()?;
        let report = Validator::validate_sized(&canonical, dataset, encoded.len() as u64);
        if !report.passed {
            return Err(SyncError::Validation(report.summary()));
        }

        let replaced = fs::metadata(granule.harmonized_path.as_std_path())
            .ok()
            .map(|meta| meta.len())
            .filter(|size| *size > 0);
        Store::write_bytes_atomic(&granule.harmonized_path, &encoded)?;
        Store::remove_file(&granule.raw_path)?;
        Ok((encoded.len() as u64, replaced))
    }

    fn commit(
        &self,
        granule: &Granule,
        dataset: &DatasetDescriptor,
        bytes: u64,
        replaced: Option<u64>,
        attempts: u32,
    ) -> GranuleOutcome {
        let result = replaced
            .map(|size| self.ledger.release_bytes(&dataset.id, size))
            .transpose()
            .and_then(|_| self.ledger.record_success(dataset, granule.date, bytes));
        match result {
            Ok(state) => {
                tracing::info!(
                    dataset = %dataset.id,
                    date = %granule.date,
                    source = %granule.source_id,
                    bytes,
                    last_synced = ?state.last_synced_date,
                    "granule synced"
                );
                GranuleOutcome::Synced { bytes, attempts }
            }
            Err(err) => GranuleOutcome::fatal_run(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }
}
