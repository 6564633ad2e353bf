use chrono::NaiveDate;
use serde::Serialize;

use crate::config::{DatasetDescriptor, PriorityOrder, SourceWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapDecision {
    PermanentlyUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution<'a> {
    Window(&'a SourceWindow),
    Gap(GapDecision),
}

impl<'a> Resolution<'a> {
    pub fn window(self) -> Option<&'a SourceWindow> {
        match self {
            Resolution::Window(window) => Some(window),
            Resolution::Gap(_) => None,
        }
    }
}

pub struct SourceResolver;

impl SourceResolver {
    pub fn resolve(dataset: &DatasetDescriptor, date: NaiveDate) -> Resolution<'_> {
        if dataset.is_declared_gap(date) {
            return Resolution::Gap(GapDecision::PermanentlyUnavailable);
        }
        let candidates = dataset.sources.iter().filter(|window| window.contains(date));
        let chosen = match dataset.overlap_preference {
            PriorityOrder::HighestValue => candidates.max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.source_id.cmp(&a.source_id))
            }),
            PriorityOrder::LowestValue => candidates.min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.source_id.cmp(&b.source_id))
            }),
        };
        match chosen {
            Some(window) => Resolution::Window(window),
            None => Resolution::Gap(GapDecision::PermanentlyUnavailable),
        }
    }
}
