use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;

use crate::config::DatasetDescriptor;
use crate::error::SyncError;
use crate::ledger::{DiskObservation, StatusLedger, SyncState};
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default)]
pub struct MissingDateQuery {
    pub include_quarantined: bool,
    pub since: Option<NaiveDate>,
    pub force: bool,
}

pub struct GapDetector<'a> {
    store: &'a Store,
    ledger: &'a StatusLedger,
}

impl<'a> GapDetector<'a> {
    pub fn new(store: &'a Store, ledger: &'a StatusLedger) -> Self {
        Self { store, ledger }
    }

    pub fn compute_missing_dates(
        &self,
        dataset: &DatasetDescriptor,
        target_end: NaiveDate,
    ) -> Result<Vec<NaiveDate>, SyncError> {
        self.compute_missing_dates_with(dataset, target_end, MissingDateQuery::default())
    }

    pub fn compute_missing_dates_with(
        &self,
        dataset: &DatasetDescriptor,
        target_end: NaiveDate,
        query: MissingDateQuery,
    ) -> Result<Vec<NaiveDate>, SyncError> {
        let on_disk = self.store.scan_harmonized(&dataset.id)?;
        let state = self.ledger.read(&dataset.id)?;
        let observed = observe(dataset, &state, &on_disk);

        if self.ledger.reconcile(&dataset.id, &observed)? {
            tracing::warn!(
                dataset = %dataset.id,
                claimed = ?state.last_synced_date,
                verified = ?observed.verified_through,
                "ledger claimed dates that are not on disk; trusting the filesystem"
            );
        }

        let target_end = match dataset.end_date {
            Some(end) if end < target_end => end,
            _ => target_end,
        };
        if target_end < dataset.start_date {
            return Ok(Vec::new());
        }

        let frontier = if query.force {
            dataset.start_date
        } else {
            match observed.verified_through {
                Some(date) => match dataset.frequency.next(dataset.start_date, date) {
                    Some(next) => next,
                    None => return Ok(Vec::new()),
                },
                None => dataset.start_date,
            }
        };
        let from = query.since.map(|since| since.max(frontier)).unwrap_or(frontier);

        Ok(dataset
            .frequency
            .schedule(dataset.start_date, from, target_end)
            .filter(|date| query.force || !on_disk.contains_key(date))
            .filter(|date| !state.recorded_gaps.contains(date))
            .filter(|date| query.include_quarantined || !state.quarantined.contains_key(date))
            .collect())
    }
}

fn observe(
    dataset: &DatasetDescriptor,
    state: &SyncState,
    on_disk: &BTreeMap<NaiveDate, u64>,
) -> DiskObservation {
    let mut verified_through = None;
    let mut contiguous_from = None;
    let mut cursor = Some(dataset.start_date);
    while let Some(date) = cursor {
        if on_disk.contains_key(&date) {
            verified_through = Some(date);
            contiguous_from.get_or_insert(date);
        } else if !state.recorded_gaps.contains(&date) {
            break;
        }
        cursor = dataset.frequency.next(dataset.start_date, date);
    }

    let ahead: BTreeSet<NaiveDate> = on_disk
        .keys()
        .copied()
        .filter(|date| verified_through.map(|verified| *date > verified).unwrap_or(true))
        .collect();

    DiskObservation {
        verified_through,
        contiguous_from,
        ahead,
        granules: on_disk.len() as u64,
        storage_bytes: on_disk.values().sum(),
    }
}
