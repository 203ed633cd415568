//! Match Queue Builder
//!
//! Builds each viewer's bounded daily queue and applies the viewer's
//! decisions on surfaced candidates.
//!
//! A day's queue is the viewer's pending candidates surfaced that day, topped
//! up to the daily quota from the Profile Store. Building again the same day
//! returns the same queue; the pending partial unique index guarantees no
//! duplicate pending rows even across concurrent builders.

use super::scorer::{Compatibility, CompatibilityScorer};
use crate::config::MatchingConfig;
use crate::db::{candidates, connections};
use crate::error::{Error, Result};
use crate::lifecycle::ConnectionManager;
use crate::locks::KeyedLocks;
use crate::profiles::{collect_candidates, ProfileStore};
use chrono::{DateTime, NaiveDate, Utc};
use kindred_common::events::{EventBus, KindredEvent};
use kindred_common::models::{Connection, MatchCandidate, MatchStatus, PairKey, Profile};
use kindred_common::{time, uuid_utils, TimeSource};
use sqlx::{SqliteConnection, SqlitePool};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A scored candidate that survived exclusion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedCandidate {
    pub candidate_id: Uuid,
    pub compatibility: Compatibility,
}

/// Outcome of one viewer's build inside [`QueueBuilder::build_queues`]
#[derive(Debug)]
pub struct QueueBuildReport {
    pub viewer_id: Uuid,
    pub outcome: Result<Vec<MatchCandidate>>,
}

/// Result of a `connect` decision
#[derive(Debug, Clone)]
pub struct MatchDecision {
    /// The decided candidate row
    pub candidate: MatchCandidate,
    pub connection: Connection,
}

/// Score, filter, order and truncate a candidate pool
///
/// Drops the viewer and every excluded id, then orders by score descending
/// with candidate id ascending as the tie-break, and keeps at most
/// `max_size`. Pure: no store access, same inputs give the same queue.
pub fn rank_candidates(
    scorer: &CompatibilityScorer,
    viewer: &Profile,
    candidate_pool: &[Profile],
    exclusions: &HashSet<Uuid>,
    day: NaiveDate,
    max_size: usize,
) -> Vec<RankedCandidate> {
    let mut ranked: Vec<RankedCandidate> = candidate_pool
        .iter()
        .filter(|candidate| candidate.id != viewer.id && !exclusions.contains(&candidate.id))
        .map(|candidate| RankedCandidate {
            candidate_id: candidate.id,
            compatibility: scorer.score(viewer, candidate, day),
        })
        .collect();

    ranked.sort_by(|a, b| queue_order(a.compatibility.score, a.candidate_id, b.compatibility.score, b.candidate_id));
    // The pool may repeat a profile; equal ids sort adjacent
    ranked.dedup_by_key(|r| r.candidate_id);
    ranked.truncate(max_size);
    ranked
}

fn queue_order(score_a: u8, id_a: Uuid, score_b: u8, id_b: Uuid) -> Ordering {
    score_b.cmp(&score_a).then_with(|| id_a.cmp(&id_b))
}

fn sort_queue(queue: &mut [MatchCandidate]) {
    queue.sort_by(|a, b| queue_order(a.score, a.candidate_id, b.score, b.candidate_id));
}

/// Builds daily queues and applies connect/pass decisions
pub struct QueueBuilder {
    db: SqlitePool,
    profiles: Arc<dyn ProfileStore>,
    scorer: CompatibilityScorer,
    config: MatchingConfig,
    time: Arc<dyn TimeSource>,
    events: EventBus,
    lifecycle: Arc<ConnectionManager>,
    viewer_locks: KeyedLocks<Uuid>,
}

impl QueueBuilder {
    pub fn new(
        db: SqlitePool,
        profiles: Arc<dyn ProfileStore>,
        config: MatchingConfig,
        time: Arc<dyn TimeSource>,
        events: EventBus,
        lifecycle: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            db,
            profiles,
            scorer: CompatibilityScorer::from_config(&config),
            config,
            time,
            events,
            lifecycle,
            viewer_locks: KeyedLocks::new(),
        }
    }

    pub fn scorer(&self) -> &CompatibilityScorer {
        &self.scorer
    }

    /// Ids that must not be surfaced to `viewer_id` at `now`
    ///
    /// Self, candidates with a pending or connected row, anyone the viewer has
    /// a connection with (blocked included) and candidates passed within the
    /// cool-down window.
    async fn exclusions(
        &self,
        conn: &mut SqliteConnection,
        viewer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<HashSet<Uuid>> {
        let mut excluded = HashSet::new();
        excluded.insert(viewer_id);
        excluded.extend(candidates::pending_or_connected_ids(conn, viewer_id).await?);
        excluded.extend(connections::partner_ids(conn, viewer_id).await?);
        let cooldown_start = now - self.config.pass_cooldown();
        excluded.extend(candidates::passed_since(conn, viewer_id, cooldown_start).await?);
        Ok(excluded)
    }

    /// Build (or return) today's queue for one viewer
    ///
    /// An empty queue means nothing is left to surface today; it is not an
    /// error. Unknown viewers fail with `NotFound`.
    pub async fn build_daily_queue(&self, viewer_id: Uuid) -> Result<Vec<MatchCandidate>> {
        let _guard = self.viewer_locks.lock(&viewer_id).await;
        let now = self.time.now();
        let day = time::day_of(now);
        let quota = self.config.daily_queue_size;

        let viewer = self.profiles.get_profile(viewer_id).await?;

        let (mut queue, exclusions) = {
            let mut conn = self.db.acquire().await?;
            let queue = candidates::pending_for_day(&mut conn, viewer_id, day).await?;
            let exclusions = self.exclusions(&mut conn, viewer_id, now).await?;
            (queue, exclusions)
        };

        let mut newly_surfaced = 0;
        if queue.len() < quota {
            let pool: Vec<Profile> =
                collect_candidates(self.profiles.as_ref(), &exclusions, self.config.candidate_page_size)
                    .await?
                    .into_iter()
                    .filter(|p| p.authenticity_score >= self.config.min_authenticity)
                    .collect();

            let ranked = rank_candidates(&self.scorer, &viewer, &pool, &exclusions, day, quota - queue.len());
            debug!(
                viewer_id = %viewer_id,
                pool = pool.len(),
                ranked = ranked.len(),
                "Ranked candidate pool"
            );

            if !ranked.is_empty() {
                let mut tx = self.db.begin().await?;
                for entry in ranked {
                    let candidate = MatchCandidate {
                        id: uuid_utils::generate(),
                        viewer_id,
                        candidate_id: entry.candidate_id,
                        score: entry.compatibility.score,
                        reasons: entry.compatibility.reasons,
                        shared_interests: entry.compatibility.shared_interests,
                        status: MatchStatus::Pending,
                        queue_day: day,
                        created_at: now,
                        decided_at: None,
                    };
                    if candidates::insert_pending(&mut tx, &candidate).await? {
                        newly_surfaced += 1;
                        queue.push(candidate);
                    }
                }
                tx.commit().await?;
            }
        }

        sort_queue(&mut queue);
        queue.truncate(quota);

        info!(
            viewer_id = %viewer_id,
            queue_day = %day,
            size = queue.len(),
            newly_surfaced,
            "Daily queue built"
        );
        self.events.emit_lossy(KindredEvent::QueueBuilt {
            viewer_id,
            queue_day: day,
            size: queue.len(),
            newly_surfaced,
            timestamp: now,
        });

        Ok(queue)
    }

    /// Build queues for many viewers in parallel
    ///
    /// Builds are independent; at most `queue_workers` run at once. One
    /// viewer's failure does not affect the others.
    pub async fn build_queues(self: &Arc<Self>, viewers: Vec<Uuid>) -> Vec<QueueBuildReport> {
        let semaphore = Arc::new(Semaphore::new(self.config.worker_count()));
        let mut join_set = JoinSet::new();

        for viewer_id in viewers {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let builder = Arc::clone(self);
            join_set.spawn(async move {
                let _permit = permit;
                let outcome = builder.build_daily_queue(viewer_id).await;
                QueueBuildReport { viewer_id, outcome }
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(report) => {
                    if let Err(e) = &report.outcome {
                        warn!(viewer_id = %report.viewer_id, error = %e, "Queue build failed");
                    }
                    reports.push(report);
                }
                Err(e) => error!(error = %e, "Queue build task panicked"),
            }
        }

        reports.sort_by_key(|report| report.viewer_id);
        reports
    }

    /// Build today's queue for every profile in the Profile Store
    pub async fn build_all_queues(self: &Arc<Self>) -> Result<Vec<QueueBuildReport>> {
        let viewers = self.profiles.list_profile_ids().await?;
        info!(viewers = viewers.len(), "Building daily queues");
        Ok(self.build_queues(viewers).await)
    }

    /// Every still-pending candidate of a viewer, newest first
    pub async fn pending_candidates(&self, viewer_id: Uuid) -> Result<Vec<MatchCandidate>> {
        let mut conn = self.db.acquire().await?;
        candidates::pending_for_viewer(&mut conn, viewer_id).await
    }

    /// Load a candidate the actor may decide on
    async fn decidable(&self, match_id: Uuid, actor_id: Uuid) -> Result<MatchCandidate> {
        let mut conn = self.db.acquire().await?;
        let candidate = candidates::get(&mut conn, match_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("match candidate {}", match_id)))?;

        if candidate.viewer_id != actor_id {
            return Err(Error::not_a_participant(actor_id, format!("match candidate {}", match_id)));
        }
        if candidate.status != MatchStatus::Pending {
            return Err(Error::StaleState(format!(
                "match candidate {} is already {}",
                match_id, candidate.status
            )));
        }
        Ok(candidate)
    }

    /// Accept a pending candidate
    ///
    /// Creates (or reuses) the Connection, which notifies both users, and
    /// settles a pending candidate row in the opposite direction as well.
    /// A second decision on the same row fails with `StaleState`.
    pub async fn connect(&self, match_id: Uuid, actor_id: Uuid) -> Result<MatchDecision> {
        let mut candidate = self.decidable(match_id, actor_id).await?;
        let pair = PairKey::new(candidate.viewer_id, candidate.candidate_id)?;

        // Fails on a blocked pair before anything is decided
        let (connection, _) = self
            .lifecycle
            .create_connection(candidate.viewer_id, candidate.candidate_id)
            .await?;

        let now = self.time.now();
        let mut tx = self.db.begin().await?;
        if !candidates::decide(&mut tx, match_id, MatchStatus::Connected, now).await? {
            return Err(Error::StaleState(format!("match candidate {} was decided concurrently", match_id)));
        }
        if let Some(reciprocal) =
            candidates::find_pending(&mut tx, candidate.candidate_id, candidate.viewer_id).await?
        {
            candidates::decide(&mut tx, reciprocal.id, MatchStatus::Connected, now).await?;
            debug!(match_id = %reciprocal.id, "Reciprocal candidate connected");
        }
        tx.commit().await?;

        candidate.status = MatchStatus::Connected;
        candidate.decided_at = Some(now);

        info!(match_id = %match_id, connection_id = %connection.id, "Match connected");
        self.events.emit_lossy(KindredEvent::MatchConnected {
            match_id,
            connection_id: connection.id,
            pair,
            timestamp: now,
        });

        Ok(MatchDecision { candidate, connection })
    }

    /// Pass on a pending candidate; it stays hidden for the cool-down window
    pub async fn pass(&self, match_id: Uuid, actor_id: Uuid) -> Result<MatchCandidate> {
        let mut candidate = self.decidable(match_id, actor_id).await?;
        let now = self.time.now();

        let mut conn = self.db.acquire().await?;
        if !candidates::decide(&mut conn, match_id, MatchStatus::Passed, now).await? {
            return Err(Error::StaleState(format!("match candidate {} was decided concurrently", match_id)));
        }
        drop(conn);

        candidate.status = MatchStatus::Passed;
        candidate.decided_at = Some(now);

        debug!(match_id = %match_id, "Match passed");
        self.events.emit_lossy(KindredEvent::MatchPassed {
            match_id,
            viewer_id: candidate.viewer_id,
            candidate_id: candidate.candidate_id,
            timestamp: now,
        });

        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn profile(interests: &[&str]) -> Profile {
        Profile {
            id: Uuid::new_v4(),
            interests: interests.iter().map(|s| s.to_string()).collect(),
            values: BTreeSet::new(),
            authenticity_score: 90,
            created_at: Utc::now(),
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, 2).unwrap()
    }

    #[test]
    fn test_small_pool_returns_every_eligible_candidate() {
        let scorer = CompatibilityScorer::new(20, "");
        let viewer = profile(&["A"]);
        let pool: Vec<Profile> = (0..3).map(|_| profile(&["A"])).collect();

        let ranked = rank_candidates(&scorer, &viewer, &pool, &HashSet::new(), day(), 10);

        assert_eq!(ranked.len(), 3);
    }

    #[test]
    fn test_exclusions_and_self_are_dropped() {
        let scorer = CompatibilityScorer::new(0, "");
        let viewer = profile(&["A"]);
        let excluded = profile(&["A"]);
        let kept = profile(&["B"]);
        let pool = vec![viewer.clone(), excluded.clone(), kept.clone()];
        let exclusions: HashSet<Uuid> = [excluded.id].into_iter().collect();

        let ranked = rank_candidates(&scorer, &viewer, &pool, &exclusions, day(), 10);

        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].candidate_id, kept.id);
    }

    #[test]
    fn test_order_is_score_then_id() {
        let scorer = CompatibilityScorer::new(0, "");
        let viewer = profile(&["A", "B"]);
        let pool = vec![profile(&["A"]), profile(&["A", "B"]), profile(&["B"]), profile(&[])];

        let ranked = rank_candidates(&scorer, &viewer, &pool, &HashSet::new(), day(), 10);

        let scores: Vec<u8> = ranked.iter().map(|r| r.compatibility.score).collect();
        assert_eq!(scores, vec![100, 50, 50, 0]);
        assert!(ranked[1].candidate_id < ranked[2].candidate_id);
    }

    #[test]
    fn test_truncates_to_max_size() {
        let scorer = CompatibilityScorer::new(20, "");
        let viewer = profile(&["A"]);
        let pool: Vec<Profile> = (0..30).map(|_| profile(&["A"])).collect();

        let ranked = rank_candidates(&scorer, &viewer, &pool, &HashSet::new(), day(), 12);
        assert_eq!(ranked.len(), 12);
        assert!(ranked
            .windows(2)
            .all(|w| w[0].compatibility.score >= w[1].compatibility.score));
    }

    #[test]
    fn test_empty_pool_is_empty_queue() {
        let scorer = CompatibilityScorer::new(20, "");
        let viewer = profile(&["A"]);
        assert!(rank_candidates(&scorer, &viewer, &[], &HashSet::new(), day(), 10).is_empty());
    }

    #[test]
    fn test_duplicate_profiles_surface_once() {
        let scorer = CompatibilityScorer::new(20, "");
        let viewer = profile(&["A"]);
        let candidate = profile(&["A"]);
        let pool = vec![candidate.clone(), candidate.clone()];

        let ranked = rank_candidates(&scorer, &viewer, &pool, &HashSet::new(), day(), 10);
        assert_eq!(ranked.len(), 1);
    }
}
