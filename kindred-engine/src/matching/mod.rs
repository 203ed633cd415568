//! Match discovery: compatibility scoring and daily queues

pub mod queue_builder;
pub mod scorer;

pub use queue_builder::{rank_candidates, MatchDecision, QueueBuildReport, QueueBuilder, RankedCandidate};
pub use scorer::{overlap_score, Compatibility, CompatibilityScorer, DISCOVERY_REASON};
