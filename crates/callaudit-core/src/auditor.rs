//! Cross-source audit.
//!
//! All sources run concurrently against one window. Whatever succeeded is
//! compared pairwise; sources that failed appear as unavailable values and are
//! never zero-filled.

use crate::config::AuditConfig;
use crate::error::{AuditError, FetchError};
use crate::identity::{IdentityKey, IdentityNormalizer};
use crate::ranking::{RankingEntry, RankingKind};
use crate::sources::{RunContext, SourceComputation, SourceResult};
use crate::window::TimeWindow;
use crate::{DayBucket, Metric, MetricSnapshot, ToleranceClass};
use chrono::NaiveDate;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Slack added to every tolerance so that a delta exactly on the boundary
/// survives float rounding.
const EPSILON: f64 = 1e-9;

pub const DAILY_TOTAL_CALLS: &str = "daily_total_calls";

/// What to audit. The window is required; `None` fails the run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditRequest {
    pub window: Option<TimeWindow>,
    pub identity: Option<String>,
    pub status: Option<String>,
}

impl AuditRequest {
    pub fn new(window: TimeWindow) -> Self {
        Self {
            window: Some(window),
            ..Default::default()
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AuditState {
    Idle,
    Running,
    Completed,
    /// Some sources failed; they render as unavailable.
    PartiallyFailed { failed: usize, total: usize },
    /// Only invalid configuration gets here.
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Match,
    Divergent,
    /// Fewer than two sources could answer.
    Insufficient,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceValue {
    pub source: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairDelta {
    pub left: String,
    pub right: String,
    pub delta: f64,
    pub within_tolerance: bool,
}

/// Per-status counts across the sources that reported a breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDiff {
    pub status: String,
    pub counts: BTreeMap<String, u64>,
    pub max_delta: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipGap {
    pub key: IdentityKey,
    pub display_name: String,
    pub present_in: Vec<String>,
    pub missing_from: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryDelta {
    pub key: IdentityKey,
    pub display_name: String,
    pub values: BTreeMap<String, f64>,
    pub max_delta: f64,
    pub within_tolerance: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardDiff {
    pub top_k: usize,
    pub membership_gaps: Vec<MembershipGap>,
    pub entries: Vec<EntryDelta>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayDiff {
    pub day: NaiveDate,
    pub totals: BTreeMap<String, u64>,
    pub spread: u64,
}

/// Outcome of comparing one metric or leaderboard across sources.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DivergenceReport {
    pub subject: String,
    pub tolerance: f64,
    pub values: Vec<SourceValue>,
    pub verdict: Verdict,
    pub max_delta: Option<f64>,
    pub pairs: Vec<PairDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_breakdown: Option<Vec<StatusDiff>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaderboard: Option<LeaderboardDiff>,
    /// Days whose spread exceeds the tolerance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub divergent_days: Option<Vec<DayDiff>>,
}

impl DivergenceReport {
    pub fn is_divergent(&self) -> bool {
        self.verdict == Verdict::Divergent
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub state: AuditState,
    pub window: TimeWindow,
    pub snapshots: Vec<MetricSnapshot>,
    pub reports: Vec<DivergenceReport>,
    pub failed_sources: Vec<String>,
    pub total_sources: usize,
    pub elapsed_ms: u64,
    /// Full per-source results including leaderboards and day series.
    #[serde(skip)]
    pub results: Vec<SourceResult>,
}

impl AuditReport {
    pub fn summary(&self) -> String {
        match self.failed_sources.len() {
            0 => format!("all {} sources available", self.total_sources),
            failed => format!("{} of {} sources unavailable", failed, self.total_sources),
        }
    }

    pub fn report(&self, subject: &str) -> Option<&DivergenceReport> {
        self.reports.iter().find(|r| r.subject == subject)
    }

    pub fn divergent(&self) -> impl Iterator<Item = &DivergenceReport> {
        self.reports.iter().filter(|r| r.is_divergent())
    }
}

pub struct Auditor {
    config: AuditConfig,
    sources: Vec<SourceComputation>,
    state: AuditState,
}

impl Auditor {
    pub fn new(config: AuditConfig, sources: Vec<SourceComputation>) -> Self {
        Self {
            config,
            sources,
            state: AuditState::Idle,
        }
    }

    pub fn state(&self) -> &AuditState {
        &self.state
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn sources(&self) -> &[SourceComputation] {
        &self.sources
    }

    /// Run every source once and compare the results.
    ///
    /// Returns `Err(InvalidConfig)` (state `Failed`) for a bad configuration or
    /// a missing window, and `Err(Cancelled)` (state back to `Idle`) when
    /// `cancel` fires before every source finished. Source failures never
    /// produce `Err`.
    pub async fn run(
        &mut self,
        request: &AuditRequest,
        cancel: &CancellationToken,
    ) -> Result<AuditReport, AuditError> {
        self.state = AuditState::Running;
        let started = Instant::now();

        let (window, normalizer) = match self.prepare(request) {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(error = %err, "audit rejected");
                self.state = AuditState::Failed {
                    reason: err.to_string(),
                };
                return Err(err);
            }
        };

        let ctx = RunContext {
            config: &self.config,
            normalizer: &normalizer,
            window: &window,
            identity: request.identity.as_deref(),
            status: request.status.as_deref(),
            cancel,
        };
        let runs = join_all(self.sources.iter().map(|source| source.run(&ctx)));
        let outcomes = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcomes = runs => Some(outcomes),
        };

        let results: Option<Vec<SourceResult>> = outcomes
            .and_then(|outcomes| outcomes.into_iter().collect::<Result<_, FetchError>>().ok());
        let results = match results {
            Some(results) if !cancel.is_cancelled() => results,
            _ => {
                info!("audit cancelled");
                self.state = AuditState::Idle;
                return Err(AuditError::Cancelled);
            }
        };

        let total = results.len();
        let failed_sources: Vec<String> = results
            .iter()
            .filter(|r| !r.is_available())
            .map(|r| r.label.clone())
            .collect();
        let state = if failed_sources.is_empty() {
            AuditState::Completed
        } else {
            AuditState::PartiallyFailed {
                failed: failed_sources.len(),
                total,
            }
        };

        let reports = compare_results(&results, &self.config);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            failed = failed_sources.len(),
            total,
            divergent = reports.iter().filter(|r| r.is_divergent()).count(),
            elapsed_ms,
            "audit complete"
        );

        self.state = state.clone();
        Ok(AuditReport {
            state,
            window,
            snapshots: results.iter().map(SourceResult::snapshot).collect(),
            reports,
            failed_sources,
            total_sources: total,
            elapsed_ms,
            results,
        })
    }

    fn prepare(&self, request: &AuditRequest) -> Result<(TimeWindow, IdentityNormalizer), AuditError> {
        self.config.validate()?;
        if self.sources.is_empty() {
            return Err(AuditError::InvalidConfig(
                "no sources configured".to_string(),
            ));
        }
        let window = request
            .window
            .ok_or_else(|| AuditError::InvalidConfig("time window is required".to_string()))?;
        let normalizer = IdentityNormalizer::new(self.config.identity_rules.iter().cloned())?;
        Ok((window, normalizer))
    }
}

/// Every report for one set of results: scalar metrics, the daily series, then
/// the three leaderboards.
pub fn compare_results(results: &[SourceResult], config: &AuditConfig) -> Vec<DivergenceReport> {
    let tolerances = &config.tolerances;
    let mut reports: Vec<DivergenceReport> = Metric::ALL
        .iter()
        .map(|metric| {
            let values = results
                .iter()
                .map(|r| SourceValue {
                    source: r.label.clone(),
                    value: r.metric(*metric),
                })
                .collect();
            compare_values(
                metric.as_str(),
                values,
                tolerances.for_class(metric.tolerance_class()),
            )
        })
        .collect();

    if config.status_breakdown {
        if let Some(total_calls) = reports
            .iter_mut()
            .find(|r| r.subject == Metric::TotalCalls.as_str())
        {
            total_calls.status_breakdown = status_breakdown(results);
        }
    }

    reports.push(compare_days(
        results,
        tolerances.for_class(ToleranceClass::Count),
    ));

    for kind in RankingKind::ALL {
        reports.push(compare_leaderboards(
            results,
            kind,
            config.compare_top_k(),
            tolerances.for_class(kind.tolerance_class()),
        ));
    }
    reports
}

pub(crate) fn within(delta: f64, tolerance: f64) -> bool {
    delta <= tolerance + EPSILON
}

/// Pairwise inclusive comparison among the sources that have a value.
pub fn compare_values(subject: &str, values: Vec<SourceValue>, tolerance: f64) -> DivergenceReport {
    let present: Vec<(&str, f64)> = values
        .iter()
        .filter_map(|v| v.value.map(|value| (v.source.as_str(), value)))
        .collect();

    let mut pairs = Vec::new();
    for (i, (left, a)) in present.iter().enumerate() {
        for (right, b) in present.iter().skip(i + 1) {
            let delta = (a - b).abs();
            pairs.push(PairDelta {
                left: left.to_string(),
                right: right.to_string(),
                delta,
                within_tolerance: within(delta, tolerance),
            });
        }
    }

    let verdict = if present.len() < 2 {
        Verdict::Insufficient
    } else if pairs.iter().all(|p| p.within_tolerance) {
        Verdict::Match
    } else {
        Verdict::Divergent
    };
    let max_delta = pairs.iter().map(|p| p.delta).reduce(f64::max);

    DivergenceReport {
        subject: subject.to_string(),
        tolerance,
        values,
        verdict,
        max_delta,
        pairs,
        status_breakdown: None,
        leaderboard: None,
        divergent_days: None,
    }
}

fn status_breakdown(results: &[SourceResult]) -> Option<Vec<StatusDiff>> {
    let reporting: Vec<(&str, &BTreeMap<String, u64>)> = results
        .iter()
        .filter_map(|r| {
            r.data
                .as_ref()
                .and_then(|d| d.status_counts.as_ref())
                .map(|counts| (r.label.as_str(), counts))
        })
        .collect();
    if reporting.is_empty() {
        return None;
    }

    let statuses: BTreeSet<&String> = reporting.iter().flat_map(|(_, c)| c.keys()).collect();
    let diffs = statuses
        .into_iter()
        .map(|status| {
            let counts: BTreeMap<String, u64> = reporting
                .iter()
                .map(|(label, c)| (label.to_string(), c.get(status).copied().unwrap_or(0)))
                .collect();
            let max = counts.values().copied().max().unwrap_or(0);
            let min = counts.values().copied().min().unwrap_or(0);
            StatusDiff {
                status: status.clone(),
                counts,
                max_delta: max - min,
            }
        })
        .collect();
    Some(diffs)
}

/// Per-day totals across the sources that produced a day series. A day missing
/// from one series counts as zero calls there.
fn compare_days(results: &[SourceResult], tolerance: f64) -> DivergenceReport {
    let series: Vec<(&str, &BTreeMap<NaiveDate, DayBucket>)> = results
        .iter()
        .filter_map(|r| {
            r.data
                .as_ref()
                .and_then(|d| d.days.as_ref())
                .map(|days| (r.label.as_str(), days))
        })
        .collect();

    let values = results
        .iter()
        .map(|r| SourceValue {
            source: r.label.clone(),
            value: r
                .data
                .as_ref()
                .and_then(|d| d.days.as_ref())
                .map(|days| days.values().map(|b| b.total).sum::<u64>() as f64),
        })
        .collect();

    let mut report = compare_values(DAILY_TOTAL_CALLS, values, tolerance);
    report.pairs.clear();
    if series.len() < 2 {
        report.verdict = Verdict::Insufficient;
        report.max_delta = None;
        return report;
    }

    let all_days: BTreeSet<&NaiveDate> = series.iter().flat_map(|(_, d)| d.keys()).collect();
    let mut max_spread = 0u64;
    let mut divergent_days = Vec::new();
    for day in all_days {
        let totals: BTreeMap<String, u64> = series
            .iter()
            .map(|(label, days)| (label.to_string(), days.get(day).map_or(0, |b| b.total)))
            .collect();
        let max = totals.values().copied().max().unwrap_or(0);
        let min = totals.values().copied().min().unwrap_or(0);
        let spread = max - min;
        max_spread = max_spread.max(spread);
        if !within(spread as f64, tolerance) {
            divergent_days.push(DayDiff {
                day: *day,
                totals,
                spread,
            });
        }
    }

    report.verdict = if divergent_days.is_empty() {
        Verdict::Match
    } else {
        Verdict::Divergent
    };
    report.max_delta = Some(max_spread as f64);
    report.divergent_days = Some(divergent_days);
    report
}

/// Top-K membership and per-entry deltas for one board.
fn compare_leaderboards(
    results: &[SourceResult],
    kind: RankingKind,
    top_k: usize,
    tolerance: f64,
) -> DivergenceReport {
    let boards: Vec<(&str, &[RankingEntry])> = results
        .iter()
        .filter_map(|r| {
            r.data
                .as_ref()
                .and_then(|d| d.board(kind))
                .map(|entries| (r.label.as_str(), &entries[..entries.len().min(top_k)]))
        })
        .collect();

    let subject = format!("leaderboard.{}", kind.as_str());
    let values = results
        .iter()
        .map(|r| SourceValue {
            source: r.label.clone(),
            value: r
                .data
                .as_ref()
                .and_then(|d| d.board(kind))
                .map(|entries| entries.len().min(top_k) as f64),
        })
        .collect();
    let mut report = DivergenceReport {
        subject,
        tolerance,
        values,
        verdict: Verdict::Insufficient,
        max_delta: None,
        pairs: Vec::new(),
        status_breakdown: None,
        leaderboard: None,
        divergent_days: None,
    };
    if boards.len() < 2 {
        return report;
    }

    let mut by_key: BTreeMap<&IdentityKey, (String, BTreeMap<String, f64>)> = BTreeMap::new();
    for (label, entries) in &boards {
        for entry in entries.iter() {
            let slot = by_key
                .entry(&entry.key)
                .or_insert_with(|| (entry.display_name.clone(), BTreeMap::new()));
            slot.1.insert(label.to_string(), entry.value);
        }
    }

    let mut membership_gaps = Vec::new();
    let mut entries = Vec::new();
    for (key, (display_name, values)) in by_key {
        if values.len() < boards.len() {
            let present_in: Vec<String> = values.keys().cloned().collect();
            let missing_from = boards
                .iter()
                .map(|(label, _)| label.to_string())
                .filter(|label| !values.contains_key(label))
                .collect();
            membership_gaps.push(MembershipGap {
                key: key.clone(),
                display_name: display_name.clone(),
                present_in,
                missing_from,
            });
        }
        if values.len() >= 2 {
            let max = values.values().copied().fold(f64::MIN, f64::max);
            let min = values.values().copied().fold(f64::MAX, f64::min);
            let max_delta = max - min;
            entries.push(EntryDelta {
                key: key.clone(),
                display_name,
                values,
                max_delta,
                within_tolerance: within(max_delta, tolerance),
            });
        }
    }

    let diverged = !membership_gaps.is_empty() || entries.iter().any(|e| !e.within_tolerance);
    report.verdict = if diverged {
        Verdict::Divergent
    } else {
        Verdict::Match
    };
    report.max_delta = entries.iter().map(|e| e.max_delta).reduce(f64::max);
    report.leaderboard = Some(LeaderboardDiff {
        top_k,
        membership_gaps,
        entries,
    });
    report
}
