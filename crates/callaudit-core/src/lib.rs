#![deny(clippy::all)]

mod aggregator;
pub mod auditor;
pub mod config;
mod duration;
pub mod error;
pub mod fetcher;
pub mod identity;
mod ranking;
pub mod remote;
pub mod sources;
pub mod window;

pub use aggregator::*;
pub use auditor::{AuditReport, AuditRequest, AuditState, Auditor, DivergenceReport, Verdict};
pub use config::{AuditConfig, Tolerances};
pub use duration::*;
pub use error::{AuditError, ConfigError, FetchError, PartialDataError, PartialReason};
pub use fetcher::{FetchOutcome, PagedFetcher};
pub use identity::{IdentityKey, IdentityNormalizer, IdentityRule, NormalizedIdentity};
pub use ranking::*;
pub use sources::{SourceComputation, SourceResult};
pub use window::TimeWindow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// One call as returned by the record source. Never mutated after fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, alias = "sdr", alias = "agent", deserialize_with = "string_or_number")]
    pub identity: String,
    #[serde(default, alias = "lead_id")]
    pub deal_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub status: String,
    #[serde(default, alias = "duration")]
    pub duration_formatted: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub score: Option<f64>,
}

/// An ordered batch of items plus the source's reported total for the query.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub total_count: u64,
}

impl<T> Page<T> {
    pub fn new(records: Vec<T>, total_count: u64) -> Self {
        Self {
            records,
            total_count,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayBucket {
    pub total: u64,
    pub answered: u64,
    pub missed: u64,
}

impl DayBucket {
    pub fn merge(&mut self, other: &DayBucket) {
        self.total = self.total.saturating_add(other.total);
        self.answered = self.answered.saturating_add(other.answered);
        self.missed = self.missed.saturating_add(other.missed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    TotalCalls,
    AnsweredCalls,
    AnsweredRate,
    AvgDuration,
}

/// Which tolerance applies to a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToleranceClass {
    Count,
    Percentage,
    Duration,
    Score,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::TotalCalls,
        Metric::AnsweredCalls,
        Metric::AnsweredRate,
        Metric::AvgDuration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::TotalCalls => "total_calls",
            Metric::AnsweredCalls => "answered_calls",
            Metric::AnsweredRate => "answered_rate",
            Metric::AvgDuration => "avg_duration",
        }
    }

    pub fn tolerance_class(&self) -> ToleranceClass {
        match self {
            Metric::TotalCalls | Metric::AnsweredCalls => ToleranceClass::Count,
            Metric::AnsweredRate => ToleranceClass::Percentage,
            Metric::AvgDuration => ToleranceClass::Duration,
        }
    }
}

/// Scalar metric set every source answers.
///
/// `answered_rate` is a percentage in `0..=100`; `avg_duration` is seconds over
/// answered calls with a positive parsed duration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricValues {
    pub total_calls: u64,
    pub answered_calls: u64,
    pub answered_rate: f64,
    pub avg_duration: f64,
}

impl MetricValues {
    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::TotalCalls => self.total_calls as f64,
            Metric::AnsweredCalls => self.answered_calls as f64,
            Metric::AnsweredRate => self.answered_rate,
            Metric::AvgDuration => self.avg_duration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    RpcAggregated,
    DirectScan,
    Cached,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::RpcAggregated => "rpc",
            SourceKind::DirectScan => "direct",
            SourceKind::Cached => "cached",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Ok,
    Partial,
    Unavailable,
}

impl SnapshotStatus {
    pub fn is_available(&self) -> bool {
        !matches!(self, SnapshotStatus::Unavailable)
    }
}

/// Scalar metrics of one source, tagged with its label and status.
/// `metrics` is `None` when the source is unavailable; it is never zero-filled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    pub source: String,
    pub kind: SourceKind,
    pub status: SnapshotStatus,
    pub metrics: Option<MetricValues>,
    pub elapsed_ms: u64,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_record_accepts_numeric_fields_and_aliases() {
        let json = r#"{
            "id": 42,
            "timestamp": "2024-03-01T10:00:00Z",
            "sdr": "A. Habinoski",
            "lead_id": "lead_1",
            "status": 200,
            "duration": "00:01:05"
        }"#;
        let record: CallRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, "42");
        assert_eq!(record.identity, "A. Habinoski");
        assert_eq!(record.deal_id.as_deref(), Some("lead_1"));
        assert_eq!(record.status, "200");
        assert_eq!(record.duration_formatted.as_deref(), Some("00:01:05"));
        assert_eq!(record.duration_seconds, None);
        assert_eq!(record.score, None);
    }

    #[test]
    fn test_call_record_null_identity_is_empty() {
        let json = r#"{"id": "c1", "timestamp": "2024-03-01T10:00:00Z", "identity": null, "status": "answered"}"#;
        let record: CallRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.identity, "");
    }

    #[test]
    fn test_call_record_rejects_object_status() {
        let json = r#"{"id": "c1", "timestamp": "2024-03-01T10:00:00Z", "status": {"code": 1}}"#;
        assert!(serde_json::from_str::<CallRecord>(json).is_err());
    }

    #[test]
    fn test_metric_values_get() {
        let values = MetricValues {
            total_calls: 120,
            answered_calls: 100,
            answered_rate: 83.3,
            avg_duration: 61.5,
        };
        assert_eq!(values.get(Metric::TotalCalls), 120.0);
        assert_eq!(values.get(Metric::AnsweredCalls), 100.0);
        assert_eq!(values.get(Metric::AnsweredRate), 83.3);
        assert_eq!(values.get(Metric::AvgDuration), 61.5);
    }

    #[test]
    fn test_day_bucket_merge() {
        let mut a = DayBucket {
            total: 3,
            answered: 2,
            missed: 1,
        };
        a.merge(&DayBucket {
            total: 2,
            answered: 0,
            missed: 2,
        });
        assert_eq!(
            a,
            DayBucket {
                total: 5,
                answered: 2,
                missed: 3
            }
        );
    }
}
