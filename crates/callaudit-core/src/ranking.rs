//! Leaderboards built from per-identity totals.

use crate::aggregator::IdentityTotals;
use crate::identity::{IdentityKey, IdentityNormalizer};
use crate::ToleranceClass;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub const DEFAULT_TOP_N: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingKind {
    Volume,
    AverageScore,
    UniqueLeads,
}

impl RankingKind {
    pub const ALL: [RankingKind; 3] = [
        RankingKind::Volume,
        RankingKind::AverageScore,
        RankingKind::UniqueLeads,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RankingKind::Volume => "volume",
            RankingKind::AverageScore => "average_score",
            RankingKind::UniqueLeads => "unique_leads",
        }
    }

    pub fn tolerance_class(&self) -> ToleranceClass {
        match self {
            RankingKind::Volume | RankingKind::UniqueLeads => ToleranceClass::Count,
            RankingKind::AverageScore => ToleranceClass::Score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingEntry {
    pub key: IdentityKey,
    pub display_name: String,
    /// The metric the board is ranked by.
    pub value: f64,
    pub calls: u64,
    pub answered: u64,
    pub unique_leads: u64,
    pub average_score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leaderboards {
    pub volume: Vec<RankingEntry>,
    pub average_score: Vec<RankingEntry>,
    pub unique_leads: Vec<RankingEntry>,
}

impl Leaderboards {
    pub fn get(&self, kind: RankingKind) -> &[RankingEntry] {
        match kind {
            RankingKind::Volume => &self.volume,
            RankingKind::AverageScore => &self.average_score,
            RankingKind::UniqueLeads => &self.unique_leads,
        }
    }
}

pub struct RankingBuilder<'a> {
    normalizer: &'a IdentityNormalizer,
    top_n: usize,
}

impl<'a> RankingBuilder<'a> {
    pub fn new(normalizer: &'a IdentityNormalizer) -> Self {
        Self {
            normalizer,
            top_n: DEFAULT_TOP_N,
        }
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n.max(1);
        self
    }

    /// Build all three boards.
    ///
    /// Entries are re-keyed through the normalizer first, so totals that
    /// arrive keyed by raw spelling variants collapse into one entity.
    pub fn build<'t, I>(&self, identities: I) -> Leaderboards
    where
        I: IntoIterator<Item = (&'t IdentityKey, &'t IdentityTotals)>,
    {
        let merged = self.merge_variants(identities);

        Leaderboards {
            volume: self.rank(&merged, |t| Some(t.calls as f64)),
            average_score: self.rank(&merged, IdentityTotals::average_score),
            unique_leads: self.rank(&merged, |t| Some(t.unique_deals() as f64)),
        }
    }

    fn merge_variants<'t, I>(&self, identities: I) -> BTreeMap<IdentityKey, IdentityTotals>
    where
        I: IntoIterator<Item = (&'t IdentityKey, &'t IdentityTotals)>,
    {
        let mut merged: BTreeMap<IdentityKey, IdentityTotals> = BTreeMap::new();
        for (key, totals) in identities {
            let source_name = if totals.display_name.is_empty() {
                key.as_str()
            } else {
                totals.display_name.as_str()
            };
            let identity = self.normalizer.normalize(source_name);
            let mut totals = totals.clone();
            totals.display_name = identity.display;
            merged.entry(identity.key).or_default().merge(totals);
        }
        merged
    }

    fn rank<F>(&self, merged: &BTreeMap<IdentityKey, IdentityTotals>, value: F) -> Vec<RankingEntry>
    where
        F: Fn(&IdentityTotals) -> Option<f64>,
    {
        let mut entries: Vec<RankingEntry> = merged
            .iter()
            .filter_map(|(key, totals)| {
                let value = value(totals)?;
                Some(RankingEntry {
                    key: key.clone(),
                    display_name: totals.display_name.clone(),
                    value,
                    calls: totals.calls,
                    answered: totals.answered,
                    unique_leads: totals.unique_deals(),
                    average_score: totals.average_score(),
                })
            })
            .collect();

        entries.sort_by(compare_entries);
        entries.truncate(self.top_n);
        entries
    }
}

/// Value descending, then canonical key ascending.
fn compare_entries(a: &RankingEntry, b: &RankingEntry) -> Ordering {
    b.value.total_cmp(&a.value).then_with(|| a.key.cmp(&b.key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityRule;

    fn totals(name: &str, calls: u64) -> IdentityTotals {
        IdentityTotals {
            display_name: name.to_string(),
            calls,
            ..Default::default()
        }
    }

    fn keyed(n: &IdentityNormalizer, items: Vec<IdentityTotals>) -> Vec<(IdentityKey, IdentityTotals)> {
        items
            .into_iter()
            .map(|t| (n.key(&t.display_name), t))
            .collect()
    }

    #[test]
    fn test_volume_top_10_descending() {
        let n = IdentityNormalizer::default();
        let items = keyed(
            &n,
            (1..=15).map(|i| totals(&format!("Agent {:02}", i), i * 3)).collect(),
        );
        let boards = RankingBuilder::new(&n).build(items.iter().map(|(k, t)| (k, t)));

        assert_eq!(boards.volume.len(), 10);
        let values: Vec<f64> = boards.volume.iter().map(|e| e.value).collect();
        let expected: Vec<f64> = (6..=15).rev().map(|i| (i * 3) as f64).collect();
        assert_eq!(values, expected);
        assert_eq!(boards.volume[0].display_name, "Agent 15");
    }

    #[test]
    fn test_ties_break_on_key_ascending() {
        let n = IdentityNormalizer::default();
        let items = keyed(
            &n,
            vec![
                totals("zoe", 5),
                totals("Adam", 5),
                totals("mia", 9),
                totals("Bea", 5),
            ],
        );
        let boards = RankingBuilder::new(&n).build(items.iter().map(|(k, t)| (k, t)));
        let keys: Vec<&str> = boards.volume.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["mia", "adam", "bea", "zoe"]);
    }

    #[test]
    fn test_configurable_top_n() {
        let n = IdentityNormalizer::default();
        let items = keyed(&n, (1..=8).map(|i| totals(&format!("a{}", i), i)).collect());
        let boards = RankingBuilder::new(&n)
            .with_top_n(3)
            .build(items.iter().map(|(k, t)| (k, t)));
        assert_eq!(boards.volume.len(), 3);
        assert_eq!(boards.unique_leads.len(), 3);
    }

    #[test]
    fn test_raw_keyed_variants_merge_before_ranking() {
        let n = IdentityNormalizer::new(vec![IdentityRule::new("a.h@", "A. Habinoski")]).unwrap();
        // Upstream grouped by raw spelling, so one person arrives as two rows.
        let raw = vec![
            (n.key("a.h@example.com"), totals("a.h@example.com", 7)),
            (n.key("bob"), totals("Bob", 9)),
            (n.key("A. Habinoski"), totals("A. Habinoski", 4)),
        ];
        let boards = RankingBuilder::new(&n).build(raw.iter().map(|(k, t)| (k, t)));
        assert_eq!(boards.volume.len(), 2);
        assert_eq!(boards.volume[0].key.as_str(), "a habinoski");
        assert_eq!(boards.volume[0].value, 11.0);
        assert_eq!(boards.volume[0].display_name, "A. Habinoski");
    }

    #[test]
    fn test_average_score_excludes_unscored() {
        let n = IdentityNormalizer::default();
        let mut scored = totals("Casey", 10);
        scored.score_sum_millis = 7_500;
        scored.scored_calls = 2;
        let unscored = totals("Drew", 50);
        let items = keyed(&n, vec![scored, unscored]);
        let boards = RankingBuilder::new(&n).build(items.iter().map(|(k, t)| (k, t)));

        assert_eq!(boards.average_score.len(), 1);
        assert_eq!(boards.average_score[0].display_name, "Casey");
        assert_eq!(boards.average_score[0].value, 3.75);
        // Unscored identities still rank on volume.
        assert_eq!(boards.volume[0].display_name, "Drew");
    }

    #[test]
    fn test_unique_leads_board() {
        let n = IdentityNormalizer::default();
        let mut a = totals("Casey", 3);
        a.deal_ids = ["d1", "d2"].iter().map(|s| s.to_string()).collect();
        let mut b = totals("Drew", 1);
        b.grouped_deals = 5;
        let items = keyed(&n, vec![a, b]);
        let boards = RankingBuilder::new(&n).build(items.iter().map(|(k, t)| (k, t)));
        let leads: Vec<(&str, f64)> = boards
            .unique_leads
            .iter()
            .map(|e| (e.display_name.as_str(), e.value))
            .collect();
        assert_eq!(leads, vec![("Drew", 5.0), ("Casey", 2.0)]);
    }

    #[test]
    fn test_empty_input() {
        let n = IdentityNormalizer::default();
        let empty: BTreeMap<IdentityKey, IdentityTotals> = BTreeMap::new();
        let boards = RankingBuilder::new(&n).build(&empty);
        assert_eq!(boards, Leaderboards::default());
    }
}
