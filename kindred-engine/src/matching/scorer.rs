//! Compatibility Scorer
//!
//! Pure scoring of a candidate against a viewer. The overlap term is the
//! share of the viewer's own interests the candidate also holds. The
//! exploration term is derived from a SHA-256 of (salt, viewer, candidate,
//! day), so the same pair scores identically all day and reshuffles the next.

use crate::config::MatchingConfig;
use chrono::NaiveDate;
use kindred_common::models::Profile;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Reason emitted when a candidate shares no interest with the viewer
pub const DISCOVERY_REASON: &str = "Discover something new";

/// Reasons reference at most this many shared interests
const MAX_REASONS: usize = 2;

/// Score and explanation for one (viewer, candidate) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compatibility {
    /// 0-100
    pub score: u8,
    pub reasons: Vec<String>,
    pub shared_interests: BTreeSet<String>,
}

/// Deterministic compatibility scorer
#[derive(Debug, Clone)]
pub struct CompatibilityScorer {
    max_exploration: u8,
    salt: String,
}

impl CompatibilityScorer {
    /// Create a scorer; `max_exploration` is capped at 100
    pub fn new(max_exploration: u8, salt: impl Into<String>) -> Self {
        Self {
            max_exploration: max_exploration.min(100),
            salt: salt.into(),
        }
    }

    pub fn from_config(config: &MatchingConfig) -> Self {
        Self::new(config.max_exploration, config.exploration_salt.clone())
    }

    pub fn max_exploration(&self) -> u8 {
        self.max_exploration
    }

    /// Score `candidate` for `viewer` on `day`
    pub fn score(&self, viewer: &Profile, candidate: &Profile, day: NaiveDate) -> Compatibility {
        let shared_interests: BTreeSet<String> = viewer
            .interests
            .intersection(&candidate.interests)
            .cloned()
            .collect();

        let base = overlap_score(shared_interests.len(), viewer.interests.len());
        let exploration = self.exploration(viewer.id, candidate.id, day);
        let score = (base as u16 + exploration as u16).min(100) as u8;

        Compatibility {
            score,
            reasons: reasons_for(&shared_interests),
            shared_interests,
        }
    }

    /// Exploration bonus in `0..=max_exploration`
    pub fn exploration(&self, viewer_id: Uuid, candidate_id: Uuid, day: NaiveDate) -> u8 {
        if self.max_exploration == 0 {
            return 0;
        }

        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update([0u8]);
        hasher.update(viewer_id.as_bytes());
        hasher.update(candidate_id.as_bytes());
        hasher.update(day.to_string().as_bytes());
        let digest = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let draw = u64::from_be_bytes(prefix);
        (draw % (self.max_exploration as u64 + 1)) as u8
    }
}

/// round(100 * shared / max(1, viewer_interests)), half rounding up
pub fn overlap_score(shared: usize, viewer_interests: usize) -> u8 {
    let denominator = viewer_interests.max(1) as u64;
    let shared = (shared as u64).min(denominator);
    ((200 * shared + denominator) / (2 * denominator)) as u8
}

fn reasons_for(shared_interests: &BTreeSet<String>) -> Vec<String> {
    if shared_interests.is_empty() {
        return vec![DISCOVERY_REASON.to_string()];
    }
    shared_interests
        .iter()
        .take(MAX_REASONS)
        .map(|tag| format!("Shared interest: {}", tag))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn profile(interests: &[&str]) -> Profile {
        Profile {
            id: Uuid::new_v4(),
            interests: interests.iter().map(|s| s.to_string()).collect(),
            values: BTreeSet::new(),
            authenticity_score: 80,
            created_at: Utc::now(),
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    #[test]
    fn test_two_of_three_interests() {
        let scorer = CompatibilityScorer::new(20, "");
        let viewer = profile(&["A", "B", "C"]);
        let candidate = profile(&["A", "B"]);

        let result = scorer.score(&viewer, &candidate, day());

        assert!((67..=87).contains(&result.score), "score {}", result.score);
        assert!(result.reasons.iter().any(|r| r.contains('A')));
        assert!(result.reasons.iter().any(|r| r.contains('B')));
        assert_eq!(result.shared_interests.len(), 2);
    }

    #[test]
    fn test_without_exploration_score_is_overlap_only() {
        let scorer = CompatibilityScorer::new(0, "");
        let viewer = profile(&["A", "B", "C"]);
        let candidate = profile(&["A", "B", "Z"]);
        assert_eq!(scorer.score(&viewer, &candidate, day()).score, 67);
    }

    #[test]
    fn test_overlap_score_rounding() {
        assert_eq!(overlap_score(0, 0), 0);
        assert_eq!(overlap_score(1, 3), 33);
        assert_eq!(overlap_score(2, 3), 67);
        assert_eq!(overlap_score(1, 2), 50);
        assert_eq!(overlap_score(1, 8), 13);
        assert_eq!(overlap_score(4, 4), 100);
    }

    #[test]
    fn test_score_stays_within_bounds() {
        let scorer = CompatibilityScorer::new(100, "salt");
        let viewer = profile(&["A", "B"]);
        for i in 0..200 {
            let candidate = if i % 2 == 0 { profile(&["A", "B", "C"]) } else { profile(&["Z"]) };
            let result = scorer.score(&viewer, &candidate, day());
            assert!(result.score <= 100);
            if i % 2 == 0 {
                assert_eq!(result.score, 100);
            }
        }
    }

    #[test]
    fn test_same_day_is_deterministic() {
        let scorer = CompatibilityScorer::new(20, "salt");
        let viewer = profile(&["hiking", "chess"]);
        let candidate = profile(&["chess"]);

        let first = scorer.score(&viewer, &candidate, day());
        let second = scorer.score(&viewer, &candidate, day());
        assert_eq!(first, second);
    }

    #[test]
    fn test_exploration_bounded_by_max() {
        let scorer = CompatibilityScorer::new(5, "");
        let viewer = Uuid::new_v4();
        for _ in 0..200 {
            assert!(scorer.exploration(viewer, Uuid::new_v4(), day()) <= 5);
        }
    }

    #[test]
    fn test_no_shared_interest_gives_discovery_reason() {
        let scorer = CompatibilityScorer::new(20, "");
        let result = scorer.score(&profile(&["A"]), &profile(&["B"]), day());
        assert_eq!(result.reasons, vec![DISCOVERY_REASON.to_string()]);
        assert!(result.score <= 20);
    }

    #[test]
    fn test_reasons_use_first_two_tags_in_lexical_order() {
        let scorer = CompatibilityScorer::new(0, "");
        let viewer = profile(&["yoga", "art", "music", "books"]);
        let candidate = profile(&["music", "yoga", "books"]);

        let result = scorer.score(&viewer, &candidate, day());

        assert_eq!(
            result.reasons,
            vec!["Shared interest: books".to_string(), "Shared interest: music".to_string()]
        );
    }

    #[test]
    fn test_viewer_without_interests_scores_only_exploration() {
        let scorer = CompatibilityScorer::new(0, "");
        let result = scorer.score(&profile(&[]), &profile(&["A"]), day());
        assert_eq!(result.score, 0);
    }
}
