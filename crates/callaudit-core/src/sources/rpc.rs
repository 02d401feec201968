//! Remote aggregation endpoint.
//!
//! The endpoint may return raw records, rows grouped by day, or rows grouped
//! by identity. The shape is detected from the rows themselves and each shape
//! answers only what it can: grouped-by-day rows carry no leaderboards,
//! grouped-by-identity rows carry no day series.

use super::{AggregationEndpoint, AggregationRequest, RunContext, SourceData};
use crate::aggregator::{normalize_status, rate, IdentityTotals, MetricsAggregator};
use crate::error::FetchError;
use crate::fetcher::PagedFetcher;
use crate::identity::IdentityKey;
use crate::ranking::RankingBuilder;
use crate::{string_or_number, CallRecord, DayBucket, Metric, MetricValues};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DAY_FIELDS: [&str; 2] = ["day", "date"];
const IDENTITY_FIELDS: [&str; 3] = ["identity", "sdr", "agent"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcShape {
    Records,
    ByDay,
    ByIdentity,
}

impl RpcShape {
    fn of_row(row: &Value) -> Result<Self, FetchError> {
        let object = row
            .as_object()
            .ok_or_else(|| FetchError::MalformedPayload(format!("row is not an object: {}", row)))?;
        if object.contains_key("id") && object.contains_key("timestamp") {
            Ok(RpcShape::Records)
        } else if DAY_FIELDS.iter().any(|f| object.contains_key(*f)) {
            Ok(RpcShape::ByDay)
        } else if IDENTITY_FIELDS.iter().any(|f| object.contains_key(*f)) {
            Ok(RpcShape::ByIdentity)
        } else {
            Err(FetchError::MalformedPayload(format!(
                "row has neither a record id nor a grouping field: {}",
                row
            )))
        }
    }

    /// Shape shared by every row. Mixed shapes are a malformed payload;
    /// an empty result set reads as an empty record list.
    pub fn detect(rows: &[Value]) -> Result<Self, FetchError> {
        let mut shape = None;
        for row in rows {
            let current = Self::of_row(row)?;
            match shape {
                None => shape = Some(current),
                Some(prev) if prev != current => {
                    return Err(FetchError::MalformedPayload(format!(
                        "rows mix {:?} and {:?} shapes",
                        prev, current
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(shape.unwrap_or(RpcShape::Records))
    }
}

/// Duration and status fields that grouped rows may carry.
#[derive(Debug, Default, Deserialize)]
struct GroupExtras {
    #[serde(default)]
    answered_duration_secs: Option<u64>,
    #[serde(default)]
    duration_samples: Option<u64>,
    #[serde(default)]
    avg_duration: Option<f64>,
    #[serde(default)]
    status_counts: Option<BTreeMap<String, u64>>,
}

impl GroupExtras {
    /// `(seconds, samples)`, preferring exact sums over an average.
    fn durations(&self, answered: u64) -> Option<(u64, u64)> {
        match (self.answered_duration_secs, self.duration_samples, self.avg_duration) {
            (Some(secs), Some(samples), _) => Some((secs, samples)),
            (_, _, Some(avg)) if avg.is_finite() && avg >= 0.0 => {
                Some(((avg * answered as f64).round() as u64, answered))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DayRow {
    #[serde(alias = "date", deserialize_with = "day_prefix")]
    day: NaiveDate,
    #[serde(alias = "total_calls", alias = "calls")]
    total: u64,
    #[serde(default, alias = "answered_calls")]
    answered: u64,
    #[serde(default)]
    missed: Option<u64>,
    #[serde(flatten)]
    extras: GroupExtras,
}

#[derive(Debug, Deserialize)]
struct IdentityRow {
    #[serde(default, alias = "sdr", alias = "agent", deserialize_with = "string_or_number")]
    identity: String,
    #[serde(alias = "total_calls", alias = "calls")]
    total: u64,
    #[serde(default, alias = "answered_calls")]
    answered: u64,
    #[serde(default, alias = "unique_leads", alias = "unique_deals")]
    distinct_deals: Option<u64>,
    #[serde(default)]
    deal_ids: Option<Vec<String>>,
    #[serde(default, alias = "average_score")]
    avg_score: Option<f64>,
    #[serde(default)]
    scored_calls: Option<u64>,
    #[serde(flatten)]
    extras: GroupExtras,
}

/// Accepts `2024-03-01` as well as a timestamp starting with it.
fn day_prefix<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let prefix = raw.get(..10).unwrap_or(&raw);
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d")
        .map_err(|e| serde::de::Error::custom(format!("invalid day {:?}: {}", raw, e)))
}

fn decode_rows<T: for<'de> Deserialize<'de>>(rows: Vec<Value>) -> Result<Vec<T>, FetchError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(FetchError::from))
        .collect()
}

fn check_answered(answered: u64, total: u64, what: &str) -> Result<(), FetchError> {
    if answered > total {
        return Err(FetchError::MalformedPayload(format!(
            "{} reports {} answered of {} calls",
            what, answered, total
        )));
    }
    Ok(())
}

fn merge_status_counts(into: &mut BTreeMap<String, u64>, from: BTreeMap<String, u64>) {
    for (status, count) in from {
        let entry = into.entry(normalize_status(&status)).or_default();
        *entry = entry.saturating_add(count);
    }
}

fn grouped_metrics(totals: DayBucket, durations: Option<(u64, u64)>) -> MetricValues {
    MetricValues {
        total_calls: totals.total,
        answered_calls: totals.answered,
        answered_rate: rate(totals.answered, totals.total),
        avg_duration: match durations {
            Some((secs, samples)) if samples > 0 => secs as f64 / samples as f64,
            _ => 0.0,
        },
    }
}

#[derive(Clone)]
pub struct RpcAggregatedSource {
    label: String,
    endpoint: Arc<dyn AggregationEndpoint>,
}

impl RpcAggregatedSource {
    pub fn new(label: impl Into<String>, endpoint: Arc<dyn AggregationEndpoint>) -> Self {
        Self {
            label: label.into(),
            endpoint,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) async fn compute(&self, ctx: &RunContext<'_>) -> Result<SourceData, FetchError> {
        let request = AggregationRequest {
            window: *ctx.window,
            identity: ctx.identity.map(str::to_string),
        };
        let request_ref = &request;
        let endpoint = self.endpoint.as_ref();

        let mut outcome = PagedFetcher::from_config(ctx.config)
            .fetch_all(&self.label, ctx.cancel, move |offset, limit| async move {
                endpoint.fetch_rows(request_ref, offset, limit).await
            })
            .await?;

        let rows = std::mem::take(&mut outcome.records);
        let shape = RpcShape::detect(&rows)?;
        debug!(rows = rows.len(), ?shape, "decoding aggregation rows");

        let mut data = match shape {
            RpcShape::Records => from_records(rows, ctx)?,
            RpcShape::ByDay => from_day_rows(rows, ctx)?,
            RpcShape::ByIdentity => from_identity_rows(rows, ctx)?,
        };
        if let (Some(status), RpcShape::ByDay | RpcShape::ByIdentity) = (ctx.status, shape) {
            warn!(source = self.label.as_str(), status, "grouped rows are not status filtered");
            data = restrict_to_status(data, status, ctx);
        }
        info!(
            ?shape,
            calls = outcome.calls,
            total_calls = data.metrics.total_calls,
            "aggregation endpoint complete"
        );
        Ok(data.with_fetch(&outcome))
    }
}

/// Grouped rows count every status. With a status filter only the per-status
/// breakdown still answers the question; everything else is unsupported.
fn restrict_to_status(data: SourceData, status: &str, ctx: &RunContext<'_>) -> SourceData {
    let wanted = normalize_status(status);
    let mut restricted = SourceData {
        warnings: data.warnings,
        partial: data.partial,
        ..Default::default()
    };
    restricted.unsupported.insert(Metric::AvgDuration);

    match data.status_counts.as_ref().map(|c| c.get(&wanted).copied().unwrap_or(0)) {
        Some(total) => {
            let answered = if wanted == normalize_status(&ctx.config.answered_status) {
                total
            } else {
                0
            };
            restricted.metrics = MetricValues {
                total_calls: total,
                answered_calls: answered,
                answered_rate: rate(answered, total),
                avg_duration: 0.0,
            };
            restricted.status_counts = Some(BTreeMap::from([(wanted.clone(), total)]));
            restricted.warnings.push(format!(
                "grouped rows ignore the status filter; totals taken from the {:?} status count",
                wanted
            ));
        }
        None => {
            restricted.unsupported.extend([
                Metric::TotalCalls,
                Metric::AnsweredCalls,
                Metric::AnsweredRate,
            ]);
            restricted.warnings.push(format!(
                "grouped rows ignore the status filter and carry no status counts; {:?} cannot be answered",
                wanted
            ));
        }
    }
    restricted
}

fn from_records(rows: Vec<Value>, ctx: &RunContext<'_>) -> Result<SourceData, FetchError> {
    let mut records: Vec<CallRecord> = decode_rows(rows)?;
    if let Some(status) = ctx.status {
        let wanted = normalize_status(status);
        records.retain(|r| normalize_status(&r.status) == wanted);
    }
    let aggregation =
        MetricsAggregator::new(ctx.normalizer, &ctx.config.answered_status, ctx.window)
            .aggregate(&records);
    Ok(SourceData::from_aggregation(aggregation, ctx))
}

fn from_day_rows(rows: Vec<Value>, ctx: &RunContext<'_>) -> Result<SourceData, FetchError> {
    let rows: Vec<DayRow> = decode_rows(rows)?;
    let first_day = ctx.window.day_key(ctx.window.start());
    let last_day = ctx.window.day_key(ctx.window.end() - chrono::Duration::nanoseconds(1));

    let mut totals = DayBucket::default();
    let mut days: BTreeMap<NaiveDate, DayBucket> = BTreeMap::new();
    let mut status_counts = BTreeMap::new();
    let mut has_status = false;
    let mut durations = Some((0u64, 0u64));
    let mut skipped_days = 0u64;

    for row in rows {
        check_answered(row.answered, row.total, &format!("day {}", row.day))?;
        if row.day < first_day || row.day > last_day {
            skipped_days += 1;
            continue;
        }
        let bucket = DayBucket {
            total: row.total,
            answered: row.answered,
            missed: row.missed.unwrap_or(row.total - row.answered),
        };
        totals.merge(&bucket);
        days.entry(row.day).or_default().merge(&bucket);
        durations = match (durations, row.extras.durations(row.answered)) {
            (Some((s, n)), Some((rs, rn))) => Some((s.saturating_add(rs), n.saturating_add(rn))),
            _ => None,
        };
        if let Some(counts) = row.extras.status_counts {
            has_status = true;
            merge_status_counts(&mut status_counts, counts);
        }
    }

    let mut data = SourceData {
        metrics: grouped_metrics(totals, durations),
        days: Some(days),
        status_counts: has_status.then_some(status_counts),
        ..Default::default()
    };
    if durations.is_none() {
        data.unsupported.insert(Metric::AvgDuration);
    }
    if skipped_days > 0 {
        data.warnings.push(format!(
            "{} day rows outside the window were ignored",
            skipped_days
        ));
    }
    Ok(data)
}

fn from_identity_rows(rows: Vec<Value>, ctx: &RunContext<'_>) -> Result<SourceData, FetchError> {
    let rows: Vec<IdentityRow> = decode_rows(rows)?;

    let mut totals = DayBucket::default();
    let mut identities: BTreeMap<IdentityKey, IdentityTotals> = BTreeMap::new();
    let mut status_counts = BTreeMap::new();
    let mut has_status = false;
    let mut durations = Some((0u64, 0u64));

    for row in rows {
        check_answered(row.answered, row.total, &format!("identity {:?}", row.identity))?;
        let identity = ctx.normalizer.normalize(&row.identity);
        totals.merge(&DayBucket {
            total: row.total,
            answered: row.answered,
            missed: row.total - row.answered,
        });

        let row_durations = row.extras.durations(row.answered);
        durations = match (durations, row_durations) {
            (Some((s, n)), Some((rs, rn))) => Some((s.saturating_add(rs), n.saturating_add(rn))),
            _ => None,
        };

        let mut entry = IdentityTotals {
            display_name: identity.display,
            calls: row.total,
            answered: row.answered,
            ..Default::default()
        };
        match row.deal_ids {
            Some(ids) => {
                entry.deal_ids = ids
                    .into_iter()
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty())
                    .collect::<BTreeSet<_>>()
            }
            None => entry.grouped_deals = row.distinct_deals.unwrap_or(0),
        }
        if let Some((secs, samples)) = row_durations {
            entry.answered_duration_secs = secs;
            entry.duration_samples = samples;
        }
        if let Some(avg) = row.avg_score.filter(|s| s.is_finite()) {
            let scored = row.scored_calls.unwrap_or(row.total);
            if scored > 0 {
                entry.score_sum_millis = (avg * 1000.0 * scored as f64).round() as i64;
                entry.scored_calls = scored;
            }
        }
        identities.entry(identity.key).or_default().merge(entry);

        if let Some(counts) = row.extras.status_counts {
            has_status = true;
            merge_status_counts(&mut status_counts, counts);
        }
    }

    let leaderboards = RankingBuilder::new(ctx.normalizer)
        .with_top_n(ctx.board_depth())
        .build(&identities);
    let mut data = SourceData {
        metrics: grouped_metrics(totals, durations),
        leaderboards: Some(leaderboards),
        status_counts: has_status.then_some(status_counts),
        ..Default::default()
    };
    if durations.is_none() {
        data.unsupported.insert(Metric::AvgDuration);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuditConfig;
    use crate::identity::{IdentityNormalizer, IdentityRule};
    use crate::window::TimeWindow;
    use crate::Page;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct MockEndpoint {
        rows: Vec<Value>,
    }

    #[async_trait]
    impl AggregationEndpoint for MockEndpoint {
        async fn fetch_rows(
            &self,
            _request: &AggregationRequest,
            offset: usize,
            limit: usize,
        ) -> Result<Page<Value>, FetchError> {
            let page = self.rows.iter().skip(offset).take(limit).cloned().collect();
            Ok(Page::new(page, self.rows.len() as u64))
        }
    }

    fn window() -> TimeWindow {
        TimeWindow::new(
            "2024-03-01T00:00:00Z".parse().unwrap(),
            "2024-03-04T00:00:00Z".parse().unwrap(),
            0,
        )
        .unwrap()
    }

    async fn run_rows(rows: Vec<Value>) -> Result<SourceData, FetchError> {
        run_rows_with_status(rows, None).await
    }

    async fn run_rows_with_status(
        rows: Vec<Value>,
        status: Option<&str>,
    ) -> Result<SourceData, FetchError> {
        let config = AuditConfig::default();
        let normalizer =
            IdentityNormalizer::new(vec![IdentityRule::new("a.h@", "A. Habinoski")]).unwrap();
        let w = window();
        let cancel = CancellationToken::new();
        let ctx = RunContext {
            config: &config,
            normalizer: &normalizer,
            window: &w,
            identity: None,
            status,
            cancel: &cancel,
        };
        RpcAggregatedSource::new("rpc", Arc::new(MockEndpoint { rows }))
            .compute(&ctx)
            .await
    }

    #[test]
    fn test_detect_shapes() {
        let records = vec![json!({"id": "1", "timestamp": "2024-03-01T00:00:00Z", "identity": "x"})];
        assert_eq!(RpcShape::detect(&records).unwrap(), RpcShape::Records);
        let by_day = vec![json!({"date": "2024-03-01", "total": 3})];
        assert_eq!(RpcShape::detect(&by_day).unwrap(), RpcShape::ByDay);
        let by_identity = vec![json!({"sdr": "Casey", "calls": 3})];
        assert_eq!(RpcShape::detect(&by_identity).unwrap(), RpcShape::ByIdentity);
        assert_eq!(RpcShape::detect(&[]).unwrap(), RpcShape::Records);
    }

    #[test]
    fn test_detect_rejects_mixed_and_unknown() {
        let mixed = vec![
            json!({"day": "2024-03-01", "total": 3}),
            json!({"identity": "Casey", "total": 3}),
        ];
        assert!(matches!(
            RpcShape::detect(&mixed),
            Err(FetchError::MalformedPayload(_))
        ));
        assert!(RpcShape::detect(&[json!({"foo": 1})]).is_err());
        assert!(RpcShape::detect(&[json!([1, 2])]).is_err());
    }

    #[tokio::test]
    async fn test_raw_record_rows_aggregate_like_a_scan() {
        let rows = vec![
            json!({"id": 1, "timestamp": "2024-03-01T10:00:00Z", "sdr": "a.h@example.com", "status": "answered", "duration": "00:02:00"}),
            json!({"id": 2, "timestamp": "2024-03-02T10:00:00Z", "sdr": "A. Habinoski", "status": "no-answer"}),
            json!({"id": 3, "timestamp": "2024-03-09T10:00:00Z", "sdr": "Casey", "status": "answered"}),
        ];
        let data = run_rows(rows).await.unwrap();
        assert_eq!(data.metrics.total_calls, 2);
        assert_eq!(data.metrics.answered_calls, 1);
        assert_eq!(data.metrics.avg_duration, 120.0);
        assert!(data.days.is_some());
        let boards = data.leaderboards.unwrap();
        assert_eq!(boards.volume.len(), 1);
        assert_eq!(boards.volume[0].value, 2.0);
        assert_eq!(data.warnings, vec!["1 records outside the window were ignored"]);
    }

    #[tokio::test]
    async fn test_day_rows() {
        let rows = vec![
            json!({"day": "2024-03-01T00:00:00+00:00", "total_calls": 10, "answered_calls": 8, "avg_duration": 30.0}),
            json!({"day": "2024-03-02", "total_calls": 5, "answered_calls": 2, "avg_duration": 45.0}),
            json!({"day": "2024-02-10", "total_calls": 99, "answered_calls": 0, "avg_duration": 0.0}),
        ];
        let data = run_rows(rows).await.unwrap();
        assert_eq!(data.metrics.total_calls, 15);
        assert_eq!(data.metrics.answered_calls, 10);
        // (30*8 + 45*2) / 10
        assert_eq!(data.metrics.avg_duration, 33.0);
        assert!(data.leaderboards.is_none());
        let days = data.days.unwrap();
        assert_eq!(days.len(), 2);
        assert_eq!(days[&NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()].missed, 3);
        assert_eq!(data.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_day_rows_without_durations_leave_avg_unanswered() {
        let rows = vec![json!({"date": "2024-03-01", "total": 4, "answered": 2})];
        let data = run_rows(rows).await.unwrap();
        assert!(data.unsupported.contains(&Metric::AvgDuration));
        assert_eq!(data.metrics.answered_rate, 50.0);
    }

    #[tokio::test]
    async fn test_identity_rows_normalize_and_merge() {
        let rows = vec![
            json!({"sdr": "a.h@example.com", "calls": 6, "answered": 3, "unique_leads": 2, "avg_score": 4.0, "scored_calls": 2, "answered_duration_secs": 300, "duration_samples": 3}),
            json!({"sdr": "A. Habinoski", "calls": 4, "answered": 1, "unique_leads": 1, "avg_score": 1.0, "scored_calls": 2, "answered_duration_secs": 60, "duration_samples": 1}),
            json!({"sdr": null, "calls": 2, "answered": 0, "answered_duration_secs": 0, "duration_samples": 0}),
        ];
        let data = run_rows(rows).await.unwrap();
        assert_eq!(data.metrics.total_calls, 12);
        assert_eq!(data.metrics.answered_calls, 4);
        assert_eq!(data.metrics.avg_duration, 90.0);
        assert!(data.days.is_none());

        let boards = data.leaderboards.unwrap();
        assert_eq!(boards.volume[0].display_name, "A. Habinoski");
        assert_eq!(boards.volume[0].value, 10.0);
        assert_eq!(boards.volume[1].display_name, "Unassigned");
        assert_eq!(boards.unique_leads[0].value, 3.0);
        assert_eq!(boards.average_score.len(), 1);
        assert_eq!(boards.average_score[0].value, 2.5);
    }

    #[tokio::test]
    async fn test_answered_above_total_is_malformed() {
        let rows = vec![json!({"identity": "Casey", "total": 2, "answered": 5})];
        assert!(matches!(
            run_rows(rows).await,
            Err(FetchError::MalformedPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_status_filter_on_records_ignores_case_and_spacing() {
        let rows = vec![
            json!({"id": 1, "timestamp": "2024-03-01T10:00:00Z", "sdr": "Casey", "status": " Answered "}),
            json!({"id": 2, "timestamp": "2024-03-01T11:00:00Z", "sdr": "Casey", "status": "busy"}),
        ];
        let data = run_rows_with_status(rows, Some("answered")).await.unwrap();
        assert_eq!(data.metrics.total_calls, 1);
        assert_eq!(data.metrics.answered_calls, 1);
    }

    #[tokio::test]
    async fn test_status_filter_on_grouped_rows_uses_status_counts() {
        let rows = vec![
            json!({"day": "2024-03-01", "total": 30, "answered": 18, "status_counts": {"answered": 18, "Busy": 12}}),
            json!({"day": "2024-03-02", "total": 20, "answered": 12, "status_counts": {"answered": 12, "busy": 8}}),
        ];
        let data = run_rows_with_status(rows, Some("answered")).await.unwrap();
        assert_eq!(data.metrics.total_calls, 30);
        assert_eq!(data.metrics.answered_calls, 30);
        assert_eq!(data.metrics.answered_rate, 100.0);
        assert!(data.unsupported.contains(&Metric::AvgDuration));
        assert!(data.days.is_none());
        assert_eq!(
            data.status_counts,
            Some(BTreeMap::from([("answered".to_string(), 30)]))
        );
        assert!(data.warnings[0].contains("ignore the status filter"));

        let busy = vec![json!({"sdr": "Casey", "calls": 20, "answered": 0, "status_counts": {"busy": 20}})];
        let data = run_rows_with_status(busy, Some("BUSY")).await.unwrap();
        assert_eq!(data.metrics.total_calls, 20);
        assert_eq!(data.metrics.answered_calls, 0);
        assert!(data.leaderboards.is_none());
    }

    #[tokio::test]
    async fn test_status_filter_without_status_counts_is_unsupported() {
        let rows = vec![json!({"sdr": "Casey", "calls": 50, "answered": 30})];
        let data = run_rows_with_status(rows, Some("answered")).await.unwrap();
        for metric in [
            Metric::TotalCalls,
            Metric::AnsweredCalls,
            Metric::AnsweredRate,
            Metric::AvgDuration,
        ] {
            assert!(data.unsupported.contains(&metric));
        }
        assert!(data.leaderboards.is_none());
        assert_eq!(data.warnings.len(), 1);
    }
}
