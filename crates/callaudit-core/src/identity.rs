//! Identity normalization
//!
//! Raw identity strings (names, e-mail addresses, spelling variants) are mapped
//! to a display name and a canonical key through an ordered rule table. The
//! table is data: it is built once per audit from the configuration and shared
//! by every source.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const UNASSIGNED: &str = "Unassigned";

/// Characters treated as word separators when deriving a key.
const SEPARATORS: &[char] = &['.', ',', '_', '-'];

/// `pattern` is matched case-insensitively as a substring of the trimmed input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRule {
    pub pattern: String,
    pub canonical: String,
}

impl IdentityRule {
    pub fn new(pattern: impl Into<String>, canonical: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            canonical: canonical.into(),
        }
    }
}

/// Lowercase merge key. Two raw identities with the same key are one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn unassigned() -> Self {
        IdentityKey(UNASSIGNED.to_lowercase())
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedIdentity {
    pub display: String,
    pub key: IdentityKey,
}

impl NormalizedIdentity {
    fn unassigned() -> Self {
        Self {
            display: UNASSIGNED.to_string(),
            key: IdentityKey::unassigned(),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    pattern: String,
    canonical: String,
    key: IdentityKey,
}

#[derive(Debug, Clone, Default)]
pub struct IdentityNormalizer {
    rules: Vec<CompiledRule>,
    /// Canonical key -> canonical display name. Lets an already-normalized
    /// name resolve to itself before any substring rule is tried.
    canonicals: HashMap<IdentityKey, String>,
}

impl IdentityNormalizer {
    pub fn new<I>(rules: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = IdentityRule>,
    {
        let mut compiled = Vec::new();
        let mut canonicals: HashMap<IdentityKey, String> = HashMap::new();

        for rule in rules {
            let pattern = rule.pattern.trim().to_lowercase();
            let canonical = rule.canonical.trim().to_string();
            if pattern.is_empty() || canonical.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "identity rule {:?} -> {:?} has an empty side",
                    rule.pattern, rule.canonical
                )));
            }
            let key = derive_key(&canonical).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "canonical name {:?} has no usable characters",
                    canonical
                ))
            })?;
            match canonicals.get(&key) {
                Some(existing) if existing != &canonical => {
                    return Err(ConfigError::Invalid(format!(
                        "canonical names {:?} and {:?} collide on key {:?}",
                        existing, canonical, key.0
                    )));
                }
                Some(_) => {}
                None => {
                    canonicals.insert(key.clone(), canonical.clone());
                }
            }
            compiled.push(CompiledRule {
                pattern,
                canonical,
                key,
            });
        }

        Ok(Self {
            rules: compiled,
            canonicals,
        })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Map a raw identity to its display name and canonical key.
    ///
    /// Idempotent: normalizing a returned display name yields the same pair.
    pub fn normalize(&self, raw: &str) -> NormalizedIdentity {
        let trimmed = raw.trim();
        let key = match derive_key(trimmed) {
            Some(key) if key != IdentityKey::unassigned() => key,
            _ => return NormalizedIdentity::unassigned(),
        };

        if let Some(canonical) = self.canonicals.get(&key) {
            return NormalizedIdentity {
                display: canonical.clone(),
                key,
            };
        }

        let lower = trimmed.to_lowercase();
        if let Some(rule) = self.rules.iter().find(|r| lower.contains(&r.pattern)) {
            return NormalizedIdentity {
                display: rule.canonical.clone(),
                key: rule.key.clone(),
            };
        }

        NormalizedIdentity {
            display: trimmed.to_string(),
            key,
        }
    }

    pub fn key(&self, raw: &str) -> IdentityKey {
        self.normalize(raw).key
    }
}

/// Lowercase, separators to spaces, whitespace collapsed. `None` when nothing is left.
fn derive_key(input: &str) -> Option<IdentityKey> {
    let lowered: String = input
        .to_lowercase()
        .chars()
        .map(|c| if SEPARATORS.contains(&c) { ' ' } else { c })
        .collect();
    let key = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    if key.is_empty() {
        None
    } else {
        Some(IdentityKey(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> IdentityNormalizer {
        IdentityNormalizer::new(vec![
            IdentityRule::new("a.h@", "A. Habinoski"),
            IdentityRule::new("habinoski", "A. Habinoski"),
            IdentityRule::new("jordan", "Jordan Miles"),
            IdentityRule::new("jo", "Joanna Park"),
        ])
        .unwrap()
    }

    #[test]
    fn test_email_and_name_share_key() {
        let n = normalizer();
        let from_email = n.normalize("a.h@example.com");
        let from_name = n.normalize("A. Habinoski");
        assert_eq!(from_email.key.as_str(), "a habinoski");
        assert_eq!(from_email, from_name);
        assert_eq!(from_email.display, "A. Habinoski");
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let n = normalizer();
        assert_eq!(n.normalize("jordan.m@example.com").display, "Jordan Miles");
        assert_eq!(n.normalize("JOSH").display, "Joanna Park");
    }

    #[test]
    fn test_unmatched_passes_through_trimmed() {
        let n = normalizer();
        let id = n.normalize("  Casey Lee ");
        assert_eq!(id.display, "Casey Lee");
        assert_eq!(id.key.as_str(), "casey lee");
    }

    #[test]
    fn test_empty_and_whitespace_are_unassigned() {
        let n = normalizer();
        for raw in ["", "   ", "\t\n", "..", " - "] {
            let id = n.normalize(raw);
            assert_eq!(id.display, "Unassigned", "input {:?}", raw);
            assert_eq!(id.key, IdentityKey::unassigned());
        }
        assert_eq!(n.normalize("unassigned").display, "Unassigned");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let n = normalizer();
        let inputs = [
            "",
            "  ",
            "a.h@example.com",
            "A. Habinoski",
            "a habinoski",
            "Jordan",
            "jo_park",
            "  Casey   Lee  ",
            "casey.lee@example.com",
            "UNASSIGNED",
            "Ünïcode Näme",
        ];
        for raw in inputs {
            let once = n.normalize(raw);
            let twice = n.normalize(&once.display);
            assert_eq!(once, twice, "input {:?}", raw);
        }
    }

    #[test]
    fn test_key_only_variant_maps_to_canonical() {
        let n = IdentityNormalizer::new(vec![IdentityRule::new("a.h@", "A. Habinoski")]).unwrap();
        assert_eq!(n.normalize("a_habinoski").display, "A. Habinoski");
    }

    #[test]
    fn test_rejects_colliding_canonicals() {
        let result = IdentityNormalizer::new(vec![
            IdentityRule::new("x", "A. Habinoski"),
            IdentityRule::new("y", "A Habinoski"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_empty_pattern() {
        assert!(IdentityNormalizer::new(vec![IdentityRule::new(" ", "Someone")]).is_err());
    }

    #[test]
    fn test_empty_table() {
        let n = IdentityNormalizer::default();
        assert_eq!(n.rule_count(), 0);
        assert_eq!(n.key("Bob.Smith").as_str(), "bob smith");
    }
}
