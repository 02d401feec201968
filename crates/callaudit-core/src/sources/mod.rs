//! Independent computation paths for the same metric set.
//!
//! Each variant answers the identical question for the identical window:
//! - `RpcAggregated`: a remote aggregation endpoint (raw or pre-grouped rows)
//! - `DirectScan`: a stable-sorted scan of the raw record table
//! - `Cached`: the values the caller already holds

pub mod cached;
pub mod direct;
pub mod rpc;

pub use cached::{CachedSnapshot, CachedSource};
pub use direct::DirectScanSource;
pub use rpc::{RpcAggregatedSource, RpcShape};

use crate::aggregator::Aggregation;
use crate::config::AuditConfig;
use crate::error::FetchError;
use crate::fetcher::FetchOutcome;
use crate::identity::IdentityNormalizer;
use crate::ranking::{Leaderboards, RankingBuilder, RankingEntry, RankingKind};
use crate::window::TimeWindow;
use crate::{CallRecord, DayBucket, Metric, MetricSnapshot, MetricValues, Page, SnapshotStatus, SourceKind};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Timestamp,
    Id,
}

/// Sort order for raw scans. The record id is always appended as a final
/// tie-breaker so that page boundaries are stable between requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SortKey {
    pub field: SortField,
    pub descending: bool,
}

impl Default for SortKey {
    fn default() -> Self {
        Self {
            field: SortField::Timestamp,
            descending: false,
        }
    }
}

impl SortKey {
    /// e.g. `timestamp.asc,id.asc`
    pub fn to_query_value(&self) -> String {
        let dir = if self.descending { "desc" } else { "asc" };
        match self.field {
            SortField::Id => format!("id.{}", dir),
            SortField::Timestamp => format!("timestamp.{},id.{}", dir, dir),
        }
    }
}

/// Filter for the paged-query contract.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    pub window: TimeWindow,
    pub identity: Option<String>,
    pub status: Option<String>,
    pub sort: SortKey,
}

/// Filter for the aggregation-endpoint contract.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationRequest {
    pub window: TimeWindow,
    pub identity: Option<String>,
}

/// `(identity?, window, status?, sort, limit, offset) -> {records, total_count}`
#[async_trait]
pub trait PagedQuery: Send + Sync {
    async fn fetch_page(
        &self,
        query: &RecordQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Page<CallRecord>, FetchError>;
}

/// `(window, identity?) -> rows`, where rows are raw records or grouped by day
/// or identity. The caller inspects the shape.
#[async_trait]
pub trait AggregationEndpoint: Send + Sync {
    async fn fetch_rows(
        &self,
        request: &AggregationRequest,
        offset: usize,
        limit: usize,
    ) -> Result<Page<serde_json::Value>, FetchError>;
}

/// Inputs shared by every source in one audit run.
pub struct RunContext<'a> {
    pub config: &'a AuditConfig,
    pub normalizer: &'a IdentityNormalizer,
    pub window: &'a TimeWindow,
    pub identity: Option<&'a str>,
    pub status: Option<&'a str>,
    pub cancel: &'a CancellationToken,
}

impl RunContext<'_> {
    /// Leaderboard depth to build: deep enough for both display and comparison.
    pub fn board_depth(&self) -> usize {
        self.config.top_n.max(self.config.compare_top_k())
    }
}

/// What a strategy produced before status and timing are attached.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceData {
    pub metrics: MetricValues,
    /// Metrics this path cannot answer (e.g. durations absent from grouped rows).
    pub unsupported: BTreeSet<Metric>,
    pub days: Option<BTreeMap<NaiveDate, DayBucket>>,
    pub leaderboards: Option<Leaderboards>,
    /// Boards this path never computed; their empty lists in `leaderboards` mean nothing.
    pub missing_boards: BTreeSet<RankingKind>,
    pub status_counts: Option<BTreeMap<String, u64>>,
    pub warnings: Vec<String>,
    pub partial: bool,
}

impl SourceData {
    /// Everything a raw-record path reports: scalars, days, boards and statuses.
    pub(crate) fn from_aggregation(agg: Aggregation, ctx: &RunContext<'_>) -> Self {
        let leaderboards = RankingBuilder::new(ctx.normalizer)
            .with_top_n(ctx.board_depth())
            .build(&agg.identities);
        let mut warnings = Vec::new();
        if agg.out_of_window > 0 {
            warnings.push(format!(
                "{} records outside the window were ignored",
                agg.out_of_window
            ));
        }
        Self {
            metrics: agg.metrics(),
            unsupported: BTreeSet::new(),
            days: Some(agg.days),
            leaderboards: Some(leaderboards),
            missing_boards: BTreeSet::new(),
            status_counts: Some(agg.status_counts),
            warnings,
            partial: false,
        }
    }

    /// Entries of one board, or `None` when this path has no such board.
    pub fn board(&self, kind: RankingKind) -> Option<&[RankingEntry]> {
        if self.missing_boards.contains(&kind) {
            return None;
        }
        self.leaderboards.as_ref().map(|b| b.get(kind))
    }

    /// Fold paging warnings into this result.
    pub(crate) fn with_fetch<T>(mut self, outcome: &FetchOutcome<T>) -> Self {
        if let Some(partial) = &outcome.partial {
            self.warnings.insert(0, partial.to_string());
            self.partial = true;
        }
        if outcome.duplicates_dropped > 0 {
            self.warnings.push(format!(
                "{} duplicate records dropped across pages",
                outcome.duplicates_dropped
            ));
        }
        self
    }
}

/// Outcome of one source, success or not.
#[derive(Debug, Clone)]
pub struct SourceResult {
    pub label: String,
    pub kind: SourceKind,
    pub status: SnapshotStatus,
    pub elapsed: Duration,
    pub data: Option<SourceData>,
    pub error: Option<FetchError>,
}

impl SourceResult {
    fn available(label: &str, kind: SourceKind, elapsed: Duration, data: SourceData) -> Self {
        Self {
            label: label.to_string(),
            kind,
            status: if data.partial {
                SnapshotStatus::Partial
            } else {
                SnapshotStatus::Ok
            },
            elapsed,
            data: Some(data),
            error: None,
        }
    }

    fn unavailable(label: &str, kind: SourceKind, elapsed: Duration, error: FetchError) -> Self {
        Self {
            label: label.to_string(),
            kind,
            status: SnapshotStatus::Unavailable,
            elapsed,
            data: None,
            error: Some(error),
        }
    }

    pub fn is_available(&self) -> bool {
        self.status.is_available() && self.data.is_some()
    }

    /// Value of `metric`, or `None` when the source is unavailable or cannot answer it.
    pub fn metric(&self, metric: Metric) -> Option<f64> {
        let data = self.data.as_ref()?;
        if data.unsupported.contains(&metric) {
            return None;
        }
        Some(data.metrics.get(metric))
    }

    pub fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot {
            source: self.label.clone(),
            kind: self.kind,
            status: self.status,
            metrics: self.data.as_ref().map(|d| d.metrics),
            elapsed_ms: self.elapsed.as_millis() as u64,
            warnings: self
                .data
                .as_ref()
                .map(|d| d.warnings.clone())
                .unwrap_or_default(),
            error: self.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// One configured computation path.
#[derive(Clone)]
pub enum SourceComputation {
    RpcAggregated(RpcAggregatedSource),
    DirectScan(DirectScanSource),
    Cached(CachedSource),
}

impl SourceComputation {
    pub fn rpc(label: impl Into<String>, endpoint: Arc<dyn AggregationEndpoint>) -> Self {
        SourceComputation::RpcAggregated(RpcAggregatedSource::new(label, endpoint))
    }

    pub fn direct(label: impl Into<String>, query: Arc<dyn PagedQuery>) -> Self {
        SourceComputation::DirectScan(DirectScanSource::new(label, query))
    }

    pub fn cached(label: impl Into<String>, snapshot: CachedSnapshot) -> Self {
        SourceComputation::Cached(CachedSource::new(label, snapshot))
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceComputation::RpcAggregated(_) => SourceKind::RpcAggregated,
            SourceComputation::DirectScan(_) => SourceKind::DirectScan,
            SourceComputation::Cached(_) => SourceKind::Cached,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            SourceComputation::RpcAggregated(s) => s.label(),
            SourceComputation::DirectScan(s) => s.label(),
            SourceComputation::Cached(s) => s.label(),
        }
    }

    /// Run this path under the overall source timeout.
    ///
    /// Every failure except cancellation becomes an `Unavailable` result;
    /// cancellation is returned as `Err` so no partial result escapes.
    pub async fn run(&self, ctx: &RunContext<'_>) -> Result<SourceResult, FetchError> {
        let start = Instant::now();
        let label = self.label();
        let kind = self.kind();
        let timeout = ctx.config.source_timeout();
        let span = info_span!("source", label, kind = kind.as_str());

        let outcome = tokio::time::timeout(timeout, self.compute(ctx))
            .instrument(span)
            .await;
        let elapsed = start.elapsed();

        match outcome {
            Ok(Ok(data)) => Ok(SourceResult::available(label, kind, elapsed, data)),
            Ok(Err(FetchError::Cancelled)) => Err(FetchError::Cancelled),
            Ok(Err(err)) => {
                warn!(source = label, error = %err, "source unavailable");
                Ok(SourceResult::unavailable(label, kind, elapsed, err))
            }
            Err(_) => {
                warn!(source = label, ?timeout, "source timed out");
                Ok(SourceResult::unavailable(
                    label,
                    kind,
                    elapsed,
                    FetchError::Timeout(timeout),
                ))
            }
        }
    }

    async fn compute(&self, ctx: &RunContext<'_>) -> Result<SourceData, FetchError> {
        match self {
            SourceComputation::RpcAggregated(s) => s.compute(ctx).await,
            SourceComputation::DirectScan(s) => s.compute(ctx).await,
            SourceComputation::Cached(s) => s.compute(ctx),
        }
    }
}
