use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::identity::IdentityRule;
use crate::ToleranceClass;

const DEFAULT_PAGE_SIZE: usize = 1_000;
const DEFAULT_SAFETY_CAP: usize = 50_000;
const DEFAULT_TOP_N: usize = 10;
const DEFAULT_PAGE_TIMEOUT_MS: u64 = 15_000;
const MIN_PAGE_TIMEOUT_MS: u64 = 100;
const MAX_PAGE_TIMEOUT_MS: u64 = 300_000; // 5 minutes
const DEFAULT_SOURCE_TIMEOUT_MS: u64 = 120_000;
const MIN_SOURCE_TIMEOUT_MS: u64 = 1_000;
const MAX_SOURCE_TIMEOUT_MS: u64 = 3_600_000; // 1 hour
const DEFAULT_ANSWERED_STATUS: &str = "answered";

/// Maximum absolute difference per class of metric for two sources to agree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tolerances {
    pub counts: f64,
    /// In percentage points.
    pub percentages: f64,
    /// In seconds.
    pub durations: f64,
    pub scores: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            counts: 5.0,
            percentages: 1.0,
            durations: 5.0,
            scores: 0.25,
        }
    }
}

impl Tolerances {
    pub fn for_class(&self, class: ToleranceClass) -> f64 {
        match class {
            ToleranceClass::Count => self.counts,
            ToleranceClass::Percentage => self.percentages,
            ToleranceClass::Duration => self.durations,
            ToleranceClass::Score => self.scores,
        }
    }
}

/// Explicit per-invocation parameters. Nothing here is read from the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_safety_cap")]
    pub safety_cap: usize,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    /// Leaderboard depth compared across sources; falls back to `top_n`.
    #[serde(default)]
    pub compare_top_k: Option<usize>,
    #[serde(default = "default_page_timeout")]
    pub page_timeout_ms: u64,
    #[serde(default = "default_source_timeout")]
    pub source_timeout_ms: u64,
    #[serde(default = "default_answered_status")]
    pub answered_status: String,
    #[serde(default = "default_true")]
    pub status_breakdown: bool,
    #[serde(default)]
    pub tolerances: Tolerances,
    #[serde(default)]
    pub identity_rules: Vec<IdentityRule>,
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_safety_cap() -> usize {
    DEFAULT_SAFETY_CAP
}

fn default_top_n() -> usize {
    DEFAULT_TOP_N
}

fn default_page_timeout() -> u64 {
    DEFAULT_PAGE_TIMEOUT_MS
}

fn default_source_timeout() -> u64 {
    DEFAULT_SOURCE_TIMEOUT_MS
}

fn default_answered_status() -> String {
    DEFAULT_ANSWERED_STATUS.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            safety_cap: DEFAULT_SAFETY_CAP,
            top_n: DEFAULT_TOP_N,
            compare_top_k: None,
            page_timeout_ms: DEFAULT_PAGE_TIMEOUT_MS,
            source_timeout_ms: DEFAULT_SOURCE_TIMEOUT_MS,
            answered_status: DEFAULT_ANSWERED_STATUS.to_string(),
            status_breakdown: true,
            tolerances: Tolerances::default(),
            identity_rules: Vec::new(),
        }
    }
}

impl AuditConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AuditConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: AuditConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("pageSize must be positive".into()));
        }
        if self.safety_cap == 0 {
            return Err(ConfigError::Invalid("safetyCap must be positive".into()));
        }
        if self.top_n == 0 {
            return Err(ConfigError::Invalid("topN must be positive".into()));
        }
        if self.compare_top_k == Some(0) {
            return Err(ConfigError::Invalid("compareTopK must be positive".into()));
        }
        if self.answered_status.trim().is_empty() {
            return Err(ConfigError::Invalid("answeredStatus must not be empty".into()));
        }
        let t = &self.tolerances;
        for (name, value) in [
            ("counts", t.counts),
            ("percentages", t.percentages),
            ("durations", t.durations),
            ("scores", t.scores),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "tolerance {} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        if let Some(rule) = self
            .identity_rules
            .iter()
            .find(|r| r.pattern.trim().is_empty() || r.canonical.trim().is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "identity rule {:?} -> {:?} has an empty side",
                rule.pattern, rule.canonical
            )));
        }
        Ok(())
    }

    pub fn compare_top_k(&self) -> usize {
        self.compare_top_k.unwrap_or(self.top_n)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(
            self.page_timeout_ms
                .clamp(MIN_PAGE_TIMEOUT_MS, MAX_PAGE_TIMEOUT_MS),
        )
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(
            self.source_timeout_ms
                .clamp(MIN_SOURCE_TIMEOUT_MS, MAX_SOURCE_TIMEOUT_MS),
        )
    }
}
