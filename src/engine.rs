use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::config::{DatasetDescriptor, ResolvedConfig};
use crate::domain::{DatasetId, GranuleKey, SourceId, SyncStatus};
use crate::error::{ErrorKind, SyncError};
use crate::fetch::SourceRegistry;
use crate::gaps::{GapDetector, MissingDateQuery};
use crate::granule::CanonicalGranule;
use crate::ledger::{LedgerDocument, StatusLedger, StorageTotals, SyncState};
use crate::pool::CoalescingQueue;
use crate::recovery::{
    Granule, GranuleOutcome, RecoveryManager, RetryPolicy, Sleeper, ThreadSleeper,
};
use crate::resolver::{Resolution, SourceResolver};
use crate::store::{CleanupReport, FsSpaceProbe, SpaceProbe, Store, StoreLock};
use crate::validate::Validator;

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub datasets: Vec<DatasetId>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub max_granules: Option<usize>,
    pub force: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RepairOptions {
    pub datasets: Vec<DatasetId>,
    pub dates: Vec<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    PartialFailure,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunAbort {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SyncError> for RunAbort {
    fn from(err: &SyncError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedGranule {
    pub date: NaiveDate,
    pub source: Option<SourceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetSummary {
    pub dataset: DatasetId,
    pub target_end: NaiveDate,
    pub scheduled: usize,
    pub synced: usize,
    pub not_published: usize,
    pub gaps_recorded: usize,
    pub quarantined: usize,
    pub fatal_aborted: usize,
    pub halted: Option<RunAbort>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub planned: Vec<PlannedGranule>,
    pub state: SyncState,
}

impl DatasetSummary {
    fn new(dataset: &DatasetId, target_end: NaiveDate, scheduled: usize) -> Self {
        Self {
            dataset: dataset.clone(),
            target_end,
            scheduled,
            synced: 0,
            not_published: 0,
            gaps_recorded: 0,
            quarantined: 0,
            fatal_aborted: 0,
            halted: None,
            planned: Vec::new(),
            state: SyncState::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub dry_run: bool,
    pub aborted: Option<RunAbort>,
    pub datasets: Vec<DatasetSummary>,
    pub totals: StorageTotals,
}

impl RunSummary {
    pub fn dataset(&self, id: &DatasetId) -> Option<&DatasetSummary> {
        self.datasets.iter().find(|summary| &summary.dataset == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactFailure {
    pub date: NaiveDate,
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetValidation {
    pub dataset: DatasetId,
    pub checked: usize,
    pub passed: usize,
    pub failures: Vec<ArtifactFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub outcome: RunOutcome,
    pub checked_at: DateTime<Utc>,
    pub datasets: Vec<DatasetValidation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetStatus {
    pub dataset: DatasetId,
    pub configured: bool,
    pub state: SyncState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub store_root: String,
    pub last_health_check: Option<DateTime<Utc>>,
    pub totals: StorageTotals,
    pub datasets: Vec<DatasetStatus>,
}

impl StatusReport {
    fn from_document(config: &ResolvedConfig, document: LedgerDocument) -> Self {
        let mut datasets: Vec<DatasetStatus> = config
            .datasets
            .iter()
            .map(|dataset| DatasetStatus {
                dataset: dataset.id.clone(),
                configured: true,
                state: document
                    .datasets
                    .get(&dataset.id)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();
        for (id, state) in &document.datasets {
            if config.dataset(id).is_none() {
                datasets.push(DatasetStatus {
                    dataset: id.clone(),
                    configured: false,
                    state: state.clone(),
                });
            }
        }
        Self {
            store_root: config.settings.store_root.to_string(),
            last_health_check: document.last_health_check,
            totals: document.totals,
            datasets,
        }
    }
}

pub fn read_status(config: &ResolvedConfig) -> Result<StatusReport, SyncError> {
    let store = Store::new(config.settings.store_root.clone());
    let ledger = StatusLedger::load(store.ledger_path())?;
    Ok(StatusReport::from_document(config, ledger.snapshot()?))
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

struct DatasetPlan<'a> {
    dataset: &'a DatasetDescriptor,
    target_end: NaiveDate,
    dates: Vec<NaiveDate>,
}

struct Tally {
    summaries: Vec<DatasetSummary>,
    index: HashMap<DatasetId, usize>,
    halted: HashSet<DatasetId>,
    completed: HashSet<GranuleKey>,
    aborted: Option<RunAbort>,
}

impl Tally {
    fn new(summaries: Vec<DatasetSummary>) -> Self {
        let index = summaries
            .iter()
            .enumerate()
            .map(|(position, summary)| (summary.dataset.clone(), position))
            .collect();
        Self {
            summaries,
            index,
            halted: HashSet::new(),
            completed: HashSet::new(),
            aborted: None,
        }
    }

    fn summary(&mut self, dataset: &DatasetId) -> Option<&mut DatasetSummary> {
        let position = *self.index.get(dataset)?;
        self.summaries.get_mut(position)
    }

    fn skip(&mut self, key: &GranuleKey) {
        if let Some(summary) = self.summary(&key.dataset) {
            summary.fatal_aborted += 1;
        }
    }

    fn record(&mut self, key: GranuleKey, outcome: GranuleOutcome) {
        if !self.completed.insert(key.clone()) {
            return;
        }
        match &outcome {
            GranuleOutcome::FatalDataset { kind, message } => {
                self.halted.insert(key.dataset.clone());
                if let Some(summary) = self.summary(&key.dataset) {
                    summary.halted.get_or_insert(RunAbort {
                        kind: *kind,
                        message: message.clone(),
                    });
                }
            }
            GranuleOutcome::FatalRun { kind, message } => {
                self.aborted.get_or_insert(RunAbort {
                    kind: *kind,
                    message: message.clone(),
                });
            }
            _ => {}
        }
        let Some(summary) = self.summary(&key.dataset) else {
            return;
        };
        match outcome {
            GranuleOutcome::Synced { .. } => summary.synced += 1,
            GranuleOutcome::NotPublished => summary.not_published += 1,
            GranuleOutcome::GapRecorded => summary.gaps_recorded += 1,
            GranuleOutcome::Quarantined { .. } => summary.quarantined += 1,
            GranuleOutcome::FatalDataset { .. } | GranuleOutcome::FatalRun { .. } => {
                summary.fatal_aborted += 1
            }
        }
    }
}

pub struct SyncEngine {
    config: ResolvedConfig,
    store: Store,
    ledger: StatusLedger,
    registry: SourceRegistry,
    space: Arc<dyn SpaceProbe>,
    sleeper: Arc<dyn Sleeper>,
    today: NaiveDate,
    _lock: StoreLock,
}

impl SyncEngine {
    pub fn open(config: ResolvedConfig) -> Result<Self, SyncError> {
        let registry = SourceRegistry::from_datasets(&config.datasets)?;
        Self::with_registry(config, registry)
    }

    pub fn with_registry(
        config: ResolvedConfig,
        registry: SourceRegistry,
    ) -> Result<Self, SyncError> {
        let store = Store::new(config.settings.store_root.clone());
        let lock = store.lock()?;
        let ledger = StatusLedger::open(store.ledger_path())?;
        Ok(Self {
            config,
            store,
            ledger,
            registry,
            space: Arc::new(FsSpaceProbe),
            sleeper: Arc::new(ThreadSleeper),
            today: Utc::now().date_naive(),
            _lock: lock,
        })
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space = probe;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn ledger(&self) -> &StatusLedger {
        &self.ledger
    }

    pub fn sync(
        &self,
        options: SyncOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, SyncError> {
        let started = Instant::now();
        let detector = GapDetector::new(&self.store, &self.ledger);
        let query = MissingDateQuery {
            include_quarantined: false,
            since: options.start,
            force: options.force,
        };

        let mut plans = Vec::new();
        for dataset in self.select(&options.datasets)? {
            let target_end = options
                .end
                .unwrap_or_else(|| dataset.latest_available(self.today));
            let mut dates = detector.compute_missing_dates_with(dataset, target_end, query)?;
            if let Some(cap) = options.max_granules {
                dates.truncate(cap);
            }
            sink.event(progress(
                format!(
                    "phase=Detect; dataset={}; missing={}; through={target_end}",
                    dataset.id,
                    dates.len()
                ),
                started,
            ));
            plans.push(DatasetPlan {
                dataset,
                target_end,
                dates,
            });
        }

        if options.dry_run {
            return self.plan_only(plans);
        }
        self.execute(plans, sink, started)
    }

    pub fn repair(
        &self,
        options: RepairOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, SyncError> {
        let started = Instant::now();
        let detector = GapDetector::new(&self.store, &self.ledger);

        let mut plans = Vec::new();
        for dataset in self.select(&options.datasets)? {
            let target_end = dataset.latest_available(self.today);
            let dates = if options.dates.is_empty() {
                let query = MissingDateQuery {
                    include_quarantined: true,
                    ..MissingDateQuery::default()
                };
                detector.compute_missing_dates_with(dataset, target_end, query)?
            } else {
                options
                    .dates
                    .iter()
                    .copied()
                    .filter(|date| {
                        *date >= dataset.start_date
                            && dataset.end_date.map(|end| *date <= end).unwrap_or(true)
                    })
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            };
            sink.event(progress(
                format!("phase=Repair; dataset={}; dates={}", dataset.id, dates.len()),
                started,
            ));
            plans.push(DatasetPlan {
                dataset,
                target_end,
                dates,
            });
        }
        self.execute(plans, sink, started)
    }

    pub fn validate_only(
        &self,
        datasets: &[DatasetId],
        sink: &dyn ProgressSink,
    ) -> Result<ValidationSummary, SyncError> {
        let started = Instant::now();
        let mut results = Vec::new();
        for dataset in self.select(datasets)? {
            let artifacts = self.store.scan_harmonized(&dataset.id)?;
            sink.event(progress(
                format!(
                    "phase=Validate; dataset={}; artifacts={}",
                    dataset.id,
                    artifacts.len()
                ),
                started,
            ));
            let mut result = DatasetValidation {
                dataset: dataset.id.clone(),
                checked: artifacts.len(),
                passed: 0,
                failures: Vec::new(),
            };
            for (date, size) in artifacts {
                let path = self.store.harmonized_path(&dataset.id, date);
                let verdict = CanonicalGranule::read(path.as_std_path())
                    .map(|granule| Validator::validate_sized(&granule, dataset, size));
                let reason = match verdict {
                    Ok(report) if report.passed => {
                        result.passed += 1;
                        continue;
                    }
                    Ok(report) => report.summary(),
                    Err(err) => err.to_string(),
                };
                tracing::warn!(
                    dataset = %dataset.id,
                    %date,
                    %reason,
                    "stored artifact failed validation"
                );
                result.failures.push(ArtifactFailure {
                    date,
                    path: path.to_string(),
                    reason,
                });
            }
            results.push(result);
        }

        let checked_at = Utc::now();
        self.ledger.mark_health_check(checked_at)?;
        let outcome = if results.iter().all(|result| result.failures.is_empty()) {
            RunOutcome::Success
        } else {
            RunOutcome::PartialFailure
        };
        Ok(ValidationSummary {
            outcome,
            checked_at,
            datasets: results,
        })
    }

    pub fn cleanup(&self, sink: &dyn ProgressSink) -> Result<CleanupReport, SyncError> {
        sink.event(ProgressEvent {
            message: format!("phase=Cleanup; store={}", self.store.root()),
            elapsed: None,
        });
        let report = self.store.cleanup()?;
        tracing::info!(
            raw = report.raw_removed,
            temp = report.temp_removed,
            dirs = report.dirs_removed,
            bytes = report.bytes_freed,
            "cleanup finished"
        );
        Ok(report)
    }

    pub fn status(&self) -> Result<StatusReport, SyncError> {
        Ok(StatusReport::from_document(&self.config, self.ledger.snapshot()?))
    }

    fn select(&self, requested: &[DatasetId]) -> Result<Vec<&DatasetDescriptor>, SyncError> {
        if requested.is_empty() {
            return Ok(self.config.datasets.iter().collect());
        }
        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for id in requested {
            let dataset = self
                .config
                .dataset(id)
                .ok_or_else(|| SyncError::UnknownDataset(id.to_string()))?;
            if seen.insert(id) {
                selected.push(dataset);
            }
        }
        Ok(selected)
    }

    fn plan_only(&self, plans: Vec<DatasetPlan<'_>>) -> Result<RunSummary, SyncError> {
        let mut datasets = Vec::with_capacity(plans.len());
        for plan in plans {
            let mut summary =
                DatasetSummary::new(&plan.dataset.id, plan.target_end, plan.dates.len());
            summary.planned = plan
                .dates
                .iter()
                .map(|date| PlannedGranule {
                    date: *date,
                    source: SourceResolver::resolve(plan.dataset, *date)
                        .window()
                        .map(|window| window.source_id.clone()),
                })
                .collect();
            summary.state = self.ledger.read(&plan.dataset.id)?;
            datasets.push(summary);
        }
        Ok(RunSummary {
            outcome: RunOutcome::Success,
            dry_run: true,
            aborted: None,
            datasets,
            totals: self.ledger.snapshot()?.totals,
        })
    }

    fn execute(
        &self,
        plans: Vec<DatasetPlan<'_>>,
        sink: &dyn ProgressSink,
        started: Instant,
    ) -> Result<RunSummary, SyncError> {
        let mut jobs = Vec::new();
        let mut summaries = Vec::with_capacity(plans.len());
        for plan in &plans {
            summaries.push(DatasetSummary::new(
                &plan.dataset.id,
                plan.target_end,
                plan.dates.len(),
            ));
            if !plan.dates.is_empty() {
                self.ledger.set_status(&plan.dataset.id, SyncStatus::Syncing)?;
            }
            jobs.extend(plan.dates.iter().map(|date| GranuleKey {
                dataset: plan.dataset.id.clone(),
                date: *date,
            }));
        }
        let mut tally = Tally::new(summaries);

        if !jobs.is_empty() {
            let recovery = RecoveryManager::new(
                &self.ledger,
                RetryPolicy::from_config(&self.config.settings.retry),
            )
            .with_sleeper(Arc::clone(&self.sleeper));
            let queue: CoalescingQueue<GranuleKey, GranuleOutcome> = CoalescingQueue::new();
            let workers = self.config.settings.workers.clamp(1, jobs.len());

            thread::scope(|scope| {
                let mut spawned = 0;
                for worker in 0..workers {
                    let handle = thread::Builder::new()
                        .name(format!("granule-worker-{worker}"))
                        .spawn_scoped(scope, || queue.work(|key| self.process(key, &recovery)));
                    match handle {
                        Ok(_) => spawned += 1,
                        Err(err) => tracing::warn!(error = %err, "failed to spawn granule worker"),
                    }
                }
                let result = if spawned == 0 {
                    Err(SyncError::Resource("no granule worker could be started".to_string()))
                } else {
                    self.dispatch(&queue, jobs, spawned, &mut tally, sink, started)
                };
                queue.close();
                result
            })?;
        }

        for position in 0..tally.summaries.len() {
            let dataset_id = tally.summaries[position].dataset.clone();
            let Some(dataset) = self.config.dataset(&dataset_id) else {
                continue;
            };
            let summary = &tally.summaries[position];
            let state = self.ledger.read(&dataset_id)?;
            let status = if summary.halted.is_some() {
                SyncStatus::Error
            } else if reached_target(dataset, &state, summary.target_end) {
                SyncStatus::UpToDate
            } else {
                SyncStatus::Active
            };
            self.ledger.set_status(&dataset_id, status)?;
            if status == SyncStatus::UpToDate && state.quarantined.is_empty() {
                self.ledger.clear_error(&dataset_id)?;
            }
            tally.summaries[position].state = self.ledger.read(&dataset_id)?;
        }

        let outcome = if tally.aborted.is_some() {
            RunOutcome::Fatal
        } else if tally
            .summaries
            .iter()
            .any(|summary| summary.quarantined > 0 || summary.halted.is_some())
        {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Success
        };
        tracing::info!(
            ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "run finished"
        );
        sink.event(progress(format!("phase=Done; outcome={outcome:?}"), started));

        Ok(RunSummary {
            outcome,
            dry_run: false,
            aborted: tally.aborted,
            datasets: tally.summaries,
            totals: self.ledger.snapshot()?.totals,
        })
    }

    fn dispatch(
        &self,
        queue: &CoalescingQueue<GranuleKey, GranuleOutcome>,
        jobs: Vec<GranuleKey>,
        capacity: usize,
        tally: &mut Tally,
        sink: &dyn ProgressSink,
        started: Instant,
    ) -> Result<(), SyncError> {
        let (reply, results) = mpsc::channel();
        let mut pending = jobs.into_iter();
        let mut in_flight = 0usize;

        loop {
            while tally.aborted.is_none() && in_flight < capacity {
                let Some(key) = pending.next() else {
                    break;
                };
                if tally.halted.contains(&key.dataset) {
                    tally.skip(&key);
                    continue;
                }
                if let Err(err) = self.check_free_space() {
                    tracing::error!(error = %err, "stopping run before {key}");
                    tally.aborted = Some(RunAbort::from(&err));
                    tally.skip(&key);
                    break;
                }
                queue.submit(key, reply.clone())?;
                in_flight += 1;
            }
            if in_flight == 0 {
                break;
            }
            let Ok((key, outcome)) = results.recv() else {
                break;
            };
            in_flight -= 1;
            sink.event(progress(
                format!("phase=Granule; {key}; {}", describe(&outcome)),
                started,
            ));
            tally.record(key, outcome);
        }

        for key in pending {
            tally.skip(&key);
        }
        Ok(())
    }

    fn process(&self, key: &GranuleKey, recovery: &RecoveryManager<'_>) -> GranuleOutcome {
        let Some(dataset) = self.config.dataset(&key.dataset) else {
            return GranuleOutcome::FatalDataset {
                kind: ErrorKind::Config,
                message: format!("unknown dataset {}", key.dataset),
            };
        };
        match SourceResolver::resolve(dataset, key.date) {
            Resolution::Gap(_) => recovery.record_gap(dataset, key.date),
            Resolution::Window(window) => match self.registry.get(&dataset.id, &window.source_id) {
                Some(client) => {
                    let mut granule = Granule::new(&self.store, dataset, window, key.date);
                    recovery.run(&mut granule, client.as_ref(), dataset, window)
                }
                None => GranuleOutcome::FatalDataset {
                    kind: ErrorKind::Config,
                    message: format!("no fetch client registered for source {}", window.source_id),
                },
            },
        }
    }

    fn check_free_space(&self) -> Result<(), SyncError> {
        let threshold = self.config.settings.min_free_bytes;
        if threshold == 0 {
            return Ok(());
        }
        let available = self.space.available_bytes(self.store.root().as_std_path())?;
        if available < threshold {
            return Err(SyncError::DiskSpace {
                available,
                threshold,
            });
        }
        Ok(())
    }
}

fn reached_target(dataset: &DatasetDescriptor, state: &SyncState, target_end: NaiveDate) -> bool {
    let target = match dataset.end_date {
        Some(end) if end < target_end => end,
        _ => target_end,
    };
    if target < dataset.start_date {
        return true;
    }
    let from = match state.last_synced_date {
        Some(last) if last >= target => return true,
        Some(last) => match dataset.frequency.next(dataset.start_date, last) {
            Some(next) => next,
            None => return true,
        },
        None => dataset.start_date,
    };
    dataset
        .frequency
        .schedule(dataset.start_date, from, target)
        .all(|date| state.recorded_gaps.contains(&date))
}

fn describe(outcome: &GranuleOutcome) -> String {
    match outcome {
        GranuleOutcome::Synced { bytes, attempts } => {
            format!("synced {bytes} bytes after {attempts} attempt(s)")
        }
        GranuleOutcome::NotPublished => "not yet published".to_string(),
        GranuleOutcome::GapRecorded => "recorded as permanent gap".to_string(),
        GranuleOutcome::Quarantined { kind, attempts, .. } => {
            format!("quarantined after {attempts} attempt(s) ({kind})")
        }
        GranuleOutcome::FatalDataset { kind, message } => {
            format!("dataset halted ({kind}): {message}")
        }
        GranuleOutcome::FatalRun { kind, message } => format!("run aborted ({kind}): {message}"),
    }
}

fn progress(message: String, started: Instant) -> ProgressEvent {
    ProgressEvent {
        message,
        elapsed: Some(started.elapsed()),
    }
}
