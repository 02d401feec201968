//! Values the caller already holds, e.g. what a dashboard last rendered.

use super::{RunContext, SourceData};
use crate::error::FetchError;
use crate::identity::IdentityKey;
use crate::ranking::{Leaderboards, RankingEntry, RankingKind};
use crate::window::TimeWindow;
use crate::{DayBucket, MetricValues};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use tracing::warn;

/// A previously computed result set. Fields the holder never computed stay `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedSnapshot {
    pub metrics: MetricValues,
    /// Only the boards the holder computed; a kind with no entry is not compared.
    pub boards: BTreeMap<RankingKind, Vec<RankingEntry>>,
    pub days: Option<BTreeMap<NaiveDate, DayBucket>>,
    pub status_counts: Option<BTreeMap<String, u64>>,
    /// Window the snapshot was computed for, when known.
    pub window: Option<TimeWindow>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl CachedSnapshot {
    pub fn new(metrics: MetricValues) -> Self {
        Self {
            metrics,
            ..Default::default()
        }
    }

    /// Holds all three boards, including any that are legitimately empty.
    pub fn with_leaderboards(mut self, leaderboards: Leaderboards) -> Self {
        let Leaderboards {
            volume,
            average_score,
            unique_leads,
        } = leaderboards;
        self.boards.insert(RankingKind::Volume, volume);
        self.boards.insert(RankingKind::AverageScore, average_score);
        self.boards.insert(RankingKind::UniqueLeads, unique_leads);
        self
    }

    pub fn with_board(mut self, kind: RankingKind, entries: Vec<RankingEntry>) -> Self {
        self.boards.insert(kind, entries);
        self
    }

    pub fn with_days(mut self, days: BTreeMap<NaiveDate, DayBucket>) -> Self {
        self.days = Some(days);
        self
    }

    pub fn with_window(mut self, window: TimeWindow) -> Self {
        self.window = Some(window);
        self
    }
}

#[derive(Debug, Clone)]
pub struct CachedSource {
    label: String,
    snapshot: CachedSnapshot,
}

impl CachedSource {
    pub fn new(label: impl Into<String>, snapshot: CachedSnapshot) -> Self {
        Self {
            label: label.into(),
            snapshot,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn compute(&self, ctx: &RunContext<'_>) -> Result<SourceData, FetchError> {
        if ctx.cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let snapshot = &self.snapshot;
        let mut data = SourceData {
            metrics: snapshot.metrics,
            days: snapshot.days.clone(),
            leaderboards: (!snapshot.boards.is_empty()).then(|| rekey(&snapshot.boards, ctx)),
            missing_boards: RankingKind::ALL
                .into_iter()
                .filter(|kind| !snapshot.boards.contains_key(kind))
                .collect(),
            status_counts: snapshot.status_counts.clone(),
            ..Default::default()
        };

        if let Some(window) = snapshot.window {
            if window != *ctx.window {
                warn!(
                    source = self.label.as_str(),
                    cached_start = %window.start(),
                    audit_start = %ctx.window.start(),
                    "cached snapshot covers a different window"
                );
                data.warnings.push(format!(
                    "window mismatch: cached {} .. {}, audit {} .. {}",
                    window.start().to_rfc3339(),
                    window.end().to_rfc3339(),
                    ctx.window.start().to_rfc3339(),
                    ctx.window.end().to_rfc3339()
                ));
                data.partial = true;
            }
        }
        if let Some(captured_at) = snapshot.captured_at {
            if captured_at < ctx.window.end() && ctx.window.end() <= Utc::now() {
                data.warnings.push(format!(
                    "snapshot captured at {} before the window closed",
                    captured_at.to_rfc3339()
                ));
            }
        }
        Ok(data)
    }
}

/// Re-key cached entries through the current identity rules so they line up
/// with the boards built by the other paths.
fn rekey(boards: &BTreeMap<RankingKind, Vec<RankingEntry>>, ctx: &RunContext<'_>) -> Leaderboards {
    let depth = ctx.board_depth();
    let board = |kind: RankingKind| {
        boards
            .get(&kind)
            .map(|entries| rekey_board(entries, ctx, depth, kind == RankingKind::AverageScore))
            .unwrap_or_default()
    };
    Leaderboards {
        volume: board(RankingKind::Volume),
        average_score: board(RankingKind::AverageScore),
        unique_leads: board(RankingKind::UniqueLeads),
    }
}

fn rekey_board(
    entries: &[RankingEntry],
    ctx: &RunContext<'_>,
    depth: usize,
    averaged: bool,
) -> Vec<RankingEntry> {
    let mut merged: BTreeMap<IdentityKey, RankingEntry> = BTreeMap::new();
    for entry in entries {
        let name = if entry.display_name.is_empty() {
            entry.key.as_str()
        } else {
            entry.display_name.as_str()
        };
        let identity = ctx.normalizer.normalize(name);
        match merged.get_mut(&identity.key) {
            Some(existing) => {
                let total_calls = existing.calls.saturating_add(entry.calls);
                existing.value = if averaged {
                    if total_calls == 0 {
                        (existing.value + entry.value) / 2.0
                    } else {
                        (existing.value * existing.calls as f64 + entry.value * entry.calls as f64)
                            / total_calls as f64
                    }
                } else {
                    existing.value + entry.value
                };
                existing.calls = total_calls;
                existing.answered = existing.answered.saturating_add(entry.answered);
                existing.unique_leads = existing.unique_leads.saturating_add(entry.unique_leads);
            }
            None => {
                merged.insert(
                    identity.key.clone(),
                    RankingEntry {
                        key: identity.key,
                        display_name: identity.display,
                        ..entry.clone()
                    },
                );
            }
        }
    }

    let mut out: Vec<RankingEntry> = merged.into_values().collect();
    out.sort_by(|a, b| b.value.total_cmp(&a.value).then_with(|| a.key.cmp(&b.key)));
    out.truncate(depth);
    out
}
