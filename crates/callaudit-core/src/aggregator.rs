//! Parallel aggregation of call records
//!
//! Uses rayon fold/reduce. Every accumulator is a commutative monoid, so the
//! result does not depend on record order or on how rayon splits the input.

use crate::duration::parse_duration;
use crate::identity::{IdentityKey, IdentityNormalizer};
use crate::window::TimeWindow;
use crate::{CallRecord, DayBucket, MetricValues};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

const UNKNOWN_STATUS: &str = "unknown";

/// Per-identity totals.
///
/// Scores are summed in thousandths so the sum is exact and order-independent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityTotals {
    pub display_name: String,
    pub calls: u64,
    pub answered: u64,
    pub deal_ids: BTreeSet<String>,
    /// Distinct-deal counts from pre-grouped rows, which carry no deal ids.
    pub grouped_deals: u64,
    pub answered_duration_secs: u64,
    pub duration_samples: u64,
    pub score_sum_millis: i64,
    pub scored_calls: u64,
}

impl IdentityTotals {
    pub fn unique_deals(&self) -> u64 {
        (self.deal_ids.len() as u64).saturating_add(self.grouped_deals)
    }

    pub fn average_score(&self) -> Option<f64> {
        if self.scored_calls == 0 {
            None
        } else {
            Some(self.score_sum_millis as f64 / 1000.0 / self.scored_calls as f64)
        }
    }

    pub fn answered_rate(&self) -> f64 {
        rate(self.answered, self.calls)
    }

    pub fn merge(&mut self, other: IdentityTotals) {
        self.merge_display_name(&other.display_name);
        self.calls = self.calls.saturating_add(other.calls);
        self.answered = self.answered.saturating_add(other.answered);
        self.deal_ids.extend(other.deal_ids);
        self.grouped_deals = self.grouped_deals.saturating_add(other.grouped_deals);
        self.answered_duration_secs = self
            .answered_duration_secs
            .saturating_add(other.answered_duration_secs);
        self.duration_samples = self.duration_samples.saturating_add(other.duration_samples);
        self.score_sum_millis = self.score_sum_millis.saturating_add(other.score_sum_millis);
        self.scored_calls = self.scored_calls.saturating_add(other.scored_calls);
    }

    /// Smallest non-empty name wins, whatever order the variants arrive in.
    pub(crate) fn merge_display_name(&mut self, candidate: &str) {
        if candidate.is_empty() {
            return;
        }
        if self.display_name.is_empty() || candidate < self.display_name.as_str() {
            self.display_name = candidate.to_string();
        }
    }
}

/// Everything one pass over a record set produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregation {
    pub totals: DayBucket,
    pub answered_duration_secs: u64,
    pub duration_samples: u64,
    pub days: BTreeMap<NaiveDate, DayBucket>,
    pub identities: BTreeMap<IdentityKey, IdentityTotals>,
    pub status_counts: BTreeMap<String, u64>,
    pub out_of_window: u64,
}

impl Aggregation {
    pub fn metrics(&self) -> MetricValues {
        MetricValues {
            total_calls: self.totals.total,
            answered_calls: self.totals.answered,
            answered_rate: rate(self.totals.answered, self.totals.total),
            avg_duration: if self.duration_samples == 0 {
                0.0
            } else {
                self.answered_duration_secs as f64 / self.duration_samples as f64
            },
        }
    }

    pub fn merge(&mut self, other: Aggregation) {
        self.totals.merge(&other.totals);
        self.answered_duration_secs = self
            .answered_duration_secs
            .saturating_add(other.answered_duration_secs);
        self.duration_samples = self.duration_samples.saturating_add(other.duration_samples);
        for (date, bucket) in other.days {
            self.days.entry(date).or_default().merge(&bucket);
        }
        for (key, totals) in other.identities {
            self.identities.entry(key).or_default().merge(totals);
        }
        for (status, count) in other.status_counts {
            let entry = self.status_counts.entry(status).or_default();
            *entry = entry.saturating_add(count);
        }
        self.out_of_window = self.out_of_window.saturating_add(other.out_of_window);
    }
}

/// Percentage of `part` in `whole`; zero when `whole` is zero.
pub fn rate(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

pub struct MetricsAggregator<'a> {
    normalizer: &'a IdentityNormalizer,
    answered_status: String,
    window: &'a TimeWindow,
}

impl<'a> MetricsAggregator<'a> {
    pub fn new(
        normalizer: &'a IdentityNormalizer,
        answered_status: &str,
        window: &'a TimeWindow,
    ) -> Self {
        Self {
            normalizer,
            answered_status: normalize_status(answered_status),
            window,
        }
    }

    pub fn is_answered(&self, status: &str) -> bool {
        normalize_status(status) == self.answered_status
    }

    /// Aggregate records into day buckets and identity totals.
    pub fn aggregate(&self, records: &[CallRecord]) -> Aggregation {
        if records.is_empty() {
            return Aggregation::default();
        }

        records
            .par_iter()
            .fold(Aggregation::default, |mut acc, record| {
                self.accumulate(&mut acc, record);
                acc
            })
            .reduce(Aggregation::default, |mut a, b| {
                a.merge(b);
                a
            })
    }

    /// Fold one record into `acc`. Records outside the window are only counted.
    pub fn accumulate(&self, acc: &mut Aggregation, record: &CallRecord) {
        if !self.window.contains(record.timestamp) {
            acc.out_of_window = acc.out_of_window.saturating_add(1);
            return;
        }

        let status = normalize_status(&record.status);
        let answered = status == self.answered_status;
        let seconds = parse_duration(record.duration_formatted.as_deref(), record.duration_seconds);
        let counts_duration = answered && seconds > 0;

        let call = DayBucket {
            total: 1,
            answered: u64::from(answered),
            missed: u64::from(!answered),
        };
        acc.totals.merge(&call);
        acc.days
            .entry(self.window.day_key(record.timestamp))
            .or_default()
            .merge(&call);
        if counts_duration {
            acc.answered_duration_secs = acc.answered_duration_secs.saturating_add(seconds);
            acc.duration_samples = acc.duration_samples.saturating_add(1);
        }
        let status_count = acc
            .status_counts
            .entry(if status.is_empty() {
                UNKNOWN_STATUS.to_string()
            } else {
                status
            })
            .or_default();
        *status_count = status_count.saturating_add(1);

        let identity = self.normalizer.normalize(&record.identity);
        let totals = acc.identities.entry(identity.key).or_default();
        totals.merge_display_name(&identity.display);
        totals.calls = totals.calls.saturating_add(1);
        if answered {
            totals.answered = totals.answered.saturating_add(1);
        }
        if let Some(deal) = record.deal_id.as_deref().map(str::trim) {
            if !deal.is_empty() {
                totals.deal_ids.insert(deal.to_string());
            }
        }
        if counts_duration {
            totals.answered_duration_secs = totals.answered_duration_secs.saturating_add(seconds);
            totals.duration_samples = totals.duration_samples.saturating_add(1);
        }
        if let Some(score) = record.score.filter(|s| s.is_finite()) {
            totals.score_sum_millis = totals
                .score_sum_millis
                .saturating_add((score * 1000.0).round() as i64);
            totals.scored_calls = totals.scored_calls.saturating_add(1);
        }
    }
}

pub(crate) fn normalize_status(status: &str) -> String {
    status.trim().to_lowercase()
}
