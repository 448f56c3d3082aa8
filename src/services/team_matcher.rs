//! Cross-source team name reconciliation.
//!
//! Rating providers, schedule feeds and sportsbooks all spell teams
//! differently ("UConn" / "Connecticut" / "Connecticut Huskies"). Matching
//! goes through an operator-maintained override table first, then falls back
//! to case-insensitive exact, containment and prefix tests, in that order.

use serde::Serialize;
use std::collections::BTreeMap;
use strsim::jaro_winkler;

use crate::models::{NameProvider, OddsEvent, TeamOverride};

/// Below this similarity a "did you mean" hint is noise.
const SUGGESTION_FLOOR: f64 = 0.80;

/// How a candidate was matched, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchTier {
    OverrideAlternate,
    Exact,
    Substring,
    Prefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameMatch {
    pub index: usize,
    pub tier: MatchTier,
}

/// A binding that was dropped so a newer write could claim the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearedBinding {
    pub provider: NameProvider,
    pub name: String,
    pub previous_owner: String,
}

/// Override mappings keyed by source name, one canonical binding per
/// external name. Later writes win and report what they displaced.
#[derive(Debug, Clone, Default)]
pub struct OverrideTable {
    by_source: BTreeMap<String, TeamOverride>,
}

fn key(name: &str) -> String {
    name.trim().to_lowercase()
}

impl OverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from stored rows in order, so later rows win conflicts.
    pub fn from_overrides<I>(overrides: I) -> Self
    where
        I: IntoIterator<Item = TeamOverride>,
    {
        let mut table = Self::new();
        for ov in overrides {
            table.insert(ov);
        }
        table
    }

    pub fn insert(&mut self, ov: TeamOverride) -> Vec<ClearedBinding> {
        let mut cleared = Vec::new();
        let source_key = key(&ov.source_name);

        for (provider, name) in ov.alternates.bound() {
            let wanted = key(name);
            for (other_key, other) in self.by_source.iter_mut() {
                if *other_key == source_key {
                    continue;
                }
                let taken = other
                    .alternates
                    .for_provider(provider)
                    .map(|n| key(n) == wanted)
                    .unwrap_or(false);
                if taken {
                    other.alternates.clear(provider);
                    cleared.push(ClearedBinding {
                        provider,
                        name: name.to_string(),
                        previous_owner: other.source_name.clone(),
                    });
                }
            }
        }

        if let Some(previous) = self.by_source.get(&source_key) {
            if key(&previous.canonical_name) != key(&ov.canonical_name) {
                cleared.push(ClearedBinding {
                    provider: NameProvider::Ratings,
                    name: ov.source_name.clone(),
                    previous_owner: previous.canonical_name.clone(),
                });
            }
        }

        self.by_source.insert(source_key, ov);
        cleared
    }

    pub fn get(&self, source_name: &str) -> Option<&TeamOverride> {
        self.by_source.get(&key(source_name))
    }

    pub fn canonical_for(&self, source_name: &str) -> Option<&str> {
        self.get(source_name).map(|ov| ov.canonical_name.as_str())
    }

    /// Provider-specific spelling for a team given by source or canonical name.
    pub fn alternate_for(&self, name: &str, provider: NameProvider) -> Option<&str> {
        let wanted = key(name);
        self.get(name)
            .or_else(|| self.by_source.values().find(|ov| key(&ov.canonical_name) == wanted))
            .and_then(|ov| ov.alternates.for_provider(provider))
    }

    /// Reverse lookup: canonical name for a provider-side spelling.
    pub fn canonical_from_alternate(&self, provider: NameProvider, external: &str) -> Option<&str> {
        let wanted = key(external);
        self.by_source
            .values()
            .find(|ov| {
                ov.alternates
                    .for_provider(provider)
                    .map(|n| key(n) == wanted)
                    .unwrap_or(false)
            })
            .map(|ov| ov.canonical_name.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TeamOverride> {
        self.by_source.values()
    }
}

/// Pure lookup over one override snapshot. Build a fresh one per batch.
#[derive(Debug, Clone, Default)]
pub struct TeamMatcher {
    overrides: OverrideTable,
}

impl TeamMatcher {
    pub fn new(overrides: OverrideTable) -> Self {
        Self { overrides }
    }

    pub fn overrides(&self) -> &OverrideTable {
        &self.overrides
    }

    /// Tier at which `candidate` matches `name`, if any.
    pub fn match_tier(&self, name: &str, candidate: &str, provider: NameProvider) -> Option<MatchTier> {
        let name_l = key(name);
        let cand_l = key(candidate);
        if name_l.is_empty() || cand_l.is_empty() {
            return None;
        }

        if let Some(alt) = self.overrides.alternate_for(name, provider) {
            if key(alt) == cand_l {
                return Some(MatchTier::OverrideAlternate);
            }
        }
        if name_l == cand_l {
            return Some(MatchTier::Exact);
        }
        if cand_l.contains(&name_l) || name_l.contains(&cand_l) {
            return Some(MatchTier::Substring);
        }
        if cand_l.starts_with(&format!("{} ", name_l)) {
            return Some(MatchTier::Prefix);
        }
        None
    }

    /// Best candidate for `name`: each tier is tried across all candidates
    /// before the next one; inside a tier the first candidate wins.
    pub fn resolve<S: AsRef<str>>(
        &self,
        name: &str,
        candidates: &[S],
        provider: NameProvider,
    ) -> Option<NameMatch> {
        let tiers: Vec<Option<MatchTier>> = candidates
            .iter()
            .map(|c| self.match_tier(name, c.as_ref(), provider))
            .collect();

        let found = [
            MatchTier::OverrideAlternate,
            MatchTier::Exact,
            MatchTier::Substring,
            MatchTier::Prefix,
        ]
        .into_iter()
        .find_map(|tier| {
            tiers
                .iter()
                .position(|t| *t == Some(tier))
                .map(|index| NameMatch { index, tier })
        });

        if found.is_none() {
            if let Some((closest, score)) = Self::suggest(name, candidates) {
                tracing::debug!(
                    "No match for '{}'; closest candidate '{}' ({:.2}), consider an override",
                    name,
                    closest,
                    score
                );
            }
        }
        found
    }

    /// First odds event (payload order) whose home and away both resolve.
    pub fn find_game<'e>(
        &self,
        home_team: &str,
        away_team: &str,
        events: &'e [OddsEvent],
    ) -> Option<&'e OddsEvent> {
        let found = events.iter().find(|event| {
            self.match_tier(home_team, &event.home_team, NameProvider::OddsApi).is_some()
                && self.match_tier(away_team, &event.away_team, NameProvider::OddsApi).is_some()
        });

        if found.is_none() && !events.is_empty() {
            tracing::debug!(
                "No odds event matched {} vs {} among {} events",
                away_team,
                home_team,
                events.len()
            );
        }
        found
    }

    /// Closest candidate by Jaro-Winkler similarity. Diagnostic only.
    pub fn suggest<S: AsRef<str>>(name: &str, candidates: &[S]) -> Option<(String, f64)> {
        let name_l = key(name);
        candidates
            .iter()
            .map(|c| (c.as_ref().to_string(), jaro_winkler(&name_l, &key(c.as_ref()))))
            .filter(|(_, score)| *score >= SUGGESTION_FLOOR)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }
}
