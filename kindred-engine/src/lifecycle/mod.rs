//! Connection Lifecycle Manager
//!
//! Owns Connection records: creation (accepted match or mutual request),
//! interaction counting, level recomputation, milestone emission, dormancy
//! and blocking.
//!
//! Work on one connection is linearized by a per-connection lock. Blocking
//! additionally takes the conversation (pair) lock first, so it never
//! interleaves with a message send on the same pair. Lock order is always
//! pair lock, then connection lock.

pub mod level;
pub mod milestones;

pub use level::{age_days, recompute_level};
pub use milestones::{due_milestones, InteractionKind, MilestoneCheck};

use crate::config::LifecycleConfig;
use crate::db::connections;
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::notifications::NotificationFanout;
use chrono::{DateTime, Duration, Utc};
use kindred_common::events::{EventBus, KindredEvent};
use kindred_common::models::{
    Connection, ConnectionLevel, ConnectionRequest, ConnectionStatus, Milestone, MilestoneKind,
    Notification, PairKey, RequestStatus,
};
use kindred_common::{uuid_utils, TimeSource};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};
use uuid::Uuid;

/// Result of recording an interaction or refreshing a connection
#[derive(Debug, Clone)]
pub struct LifecycleUpdate {
    /// Connection state after the update
    pub connection: Connection,
    /// Cached level before the update
    pub previous_level: ConnectionLevel,
    /// Milestones appended by this update
    pub reached: Vec<MilestoneKind>,
    /// Milestone notifications written with the update
    pub(crate) notifications: Vec<Notification>,
}

impl LifecycleUpdate {
    pub fn level_changed(&self) -> bool {
        self.previous_level != self.connection.level
    }
}

/// Counters from one lifecycle sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub refreshed: usize,
    pub level_changes: usize,
    pub milestones: usize,
    pub dormant: usize,
}

/// Outcome of answering a connection request
#[derive(Debug, Clone)]
pub struct RequestResponse {
    pub request: ConnectionRequest,
    /// Present when the request was accepted
    pub connection: Option<Connection>,
}

/// Per-pair state machine over Connection records
pub struct ConnectionManager {
    db: SqlitePool,
    time: Arc<dyn TimeSource>,
    config: LifecycleConfig,
    events: EventBus,
    notifications: NotificationFanout,
    pair_locks: Arc<KeyedLocks<PairKey>>,
    connection_locks: KeyedLocks<Uuid>,
}

impl ConnectionManager {
    pub fn new(
        db: SqlitePool,
        time: Arc<dyn TimeSource>,
        config: LifecycleConfig,
        events: EventBus,
        notifications: NotificationFanout,
        pair_locks: Arc<KeyedLocks<PairKey>>,
    ) -> Self {
        Self {
            db,
            time,
            config,
            events,
            notifications,
            pair_locks,
            connection_locks: KeyedLocks::new(),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    // ========================================
    // Creation
    // ========================================

    /// Create the connection between two users
    ///
    /// Returns the connection and whether this call created it. An existing
    /// connection is returned as-is; a blocked pair fails with
    /// `ConnectionBlocked`. Creation notifies both users with `new_match`.
    pub async fn create_connection(&self, a: Uuid, b: Uuid) -> Result<(Connection, bool)> {
        let pair = PairKey::new(a, b)?;
        let now = self.time.now();

        let mut conn = self.db.acquire().await?;
        if let Some(existing) = connections::get_by_pair(&mut conn, pair).await? {
            if existing.is_blocked() {
                return Err(Error::ConnectionBlocked(existing.id));
            }
            return Ok((self.revalidate(existing, now), false));
        }

        let connection = Connection {
            id: uuid_utils::generate(),
            pair,
            level: recompute_level(now, now, 0, &self.config),
            interaction_count: 0,
            connected_at: now,
            last_interaction_at: None,
            milestones: Vec::new(),
            status: ConnectionStatus::Active,
            blocked_by: None,
        };

        if !connections::insert(&mut conn, &connection).await? {
            // Created concurrently by the other side
            let existing = connections::get_by_pair(&mut conn, pair)
                .await?
                .ok_or_else(|| Error::NotFound(format!("connection for {}", pair)))?;
            if existing.is_blocked() {
                return Err(Error::ConnectionBlocked(existing.id));
            }
            return Ok((self.revalidate(existing, now), false));
        }
        drop(conn);

        info!(connection_id = %connection.id, pair = %pair, "Connection created");
        self.notifications.new_match(pair, connection.id).await?;

        Ok((connection, true))
    }

    /// Ask another user to connect
    ///
    /// A pending request in the opposite direction counts as consent from
    /// both sides and is accepted on the spot. Repeating a pending request
    /// returns the existing one.
    pub async fn request_connection(&self, requester_id: Uuid, recipient_id: Uuid) -> Result<ConnectionRequest> {
        let pair = PairKey::new(requester_id, recipient_id)?;
        let now = self.time.now();

        let mut conn = self.db.acquire().await?;
        if let Some(existing) = connections::get_by_pair(&mut conn, pair).await? {
            if existing.is_blocked() {
                return Err(Error::ConnectionBlocked(existing.id));
            }
            return Err(Error::StaleState(format!(
                "{} and {} are already connected",
                requester_id, recipient_id
            )));
        }

        if let Some(reverse) = connections::find_pending_request(&mut conn, recipient_id, requester_id).await? {
            drop(conn);
            debug!(request_id = %reverse.id, "Opposite request pending, accepting");
            let response = self.respond_to_request(reverse.id, requester_id, true).await?;
            return Ok(response.request);
        }

        let request = ConnectionRequest {
            id: uuid_utils::generate(),
            requester_id,
            recipient_id,
            status: RequestStatus::Pending,
            created_at: now,
            responded_at: None,
        };

        if connections::insert_request(&mut conn, &request).await? {
            info!(request_id = %request.id, requester_id = %requester_id, recipient_id = %recipient_id, "Connection requested");
            return Ok(request);
        }

        connections::find_pending_request(&mut conn, requester_id, recipient_id)
            .await?
            .ok_or_else(|| Error::StaleState(format!("request from {} to {} changed concurrently", requester_id, recipient_id)))
    }

    /// Accept or decline a pending request; only its recipient may answer
    pub async fn respond_to_request(
        &self,
        request_id: Uuid,
        responder_id: Uuid,
        accept: bool,
    ) -> Result<RequestResponse> {
        let now = self.time.now();
        let mut conn = self.db.acquire().await?;

        let request = connections::get_request(&mut conn, request_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connection request {}", request_id)))?;
        if request.recipient_id != responder_id {
            return Err(Error::not_a_participant(
                responder_id,
                format!("connection request {}", request_id),
            ));
        }
        if request.status != RequestStatus::Pending {
            return Err(Error::StaleState(format!(
                "connection request {} is already {}",
                request_id, request.status
            )));
        }

        let pair = PairKey::new(request.requester_id, request.recipient_id)?;
        if accept {
            if let Some(existing) = connections::get_by_pair(&mut conn, pair).await? {
                if existing.is_blocked() {
                    return Err(Error::ConnectionBlocked(existing.id));
                }
            }
        }

        let status = if accept { RequestStatus::Accepted } else { RequestStatus::Declined };
        if !connections::resolve_request(&mut conn, request_id, status, now).await? {
            return Err(Error::StaleState(format!(
                "connection request {} was answered concurrently",
                request_id
            )));
        }
        let request = connections::get_request(&mut conn, request_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connection request {}", request_id)))?;
        drop(conn);

        info!(request_id = %request_id, status = %status, "Connection request answered");

        let connection = if accept {
            let (connection, _) = self
                .create_connection(request.requester_id, request.recipient_id)
                .await?;
            Some(connection)
        } else {
            None
        };

        Ok(RequestResponse { request, connection })
    }

    // ========================================
    // Reads
    // ========================================

    /// Connection by id, with its level revalidated against the clock
    pub async fn connection(&self, connection_id: Uuid) -> Result<Connection> {
        let mut conn = self.db.acquire().await?;
        let connection = connections::get(&mut conn, connection_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connection {}", connection_id)))?;
        Ok(self.revalidate(connection, self.time.now()))
    }

    /// Connection between two users, if any
    pub async fn connection_between(&self, a: Uuid, b: Uuid) -> Result<Option<Connection>> {
        let pair = PairKey::new(a, b)?;
        let mut conn = self.db.acquire().await?;
        let connection = connections::get_by_pair(&mut conn, pair).await?;
        let now = self.time.now();
        Ok(connection.map(|c| self.revalidate(c, now)))
    }

    /// Connections of one user, oldest first
    pub async fn connections_for(&self, user_id: Uuid, include_blocked: bool) -> Result<Vec<Connection>> {
        let mut conn = self.db.acquire().await?;
        let found = connections::list_for_user(&mut conn, user_id, include_blocked).await?;
        let now = self.time.now();
        Ok(found.into_iter().map(|c| self.revalidate(c, now)).collect())
    }

    /// Milestones of a connection in the order they were reached
    pub async fn milestones(&self, connection_id: Uuid) -> Result<Vec<Milestone>> {
        let mut conn = self.db.acquire().await?;
        if connections::get(&mut conn, connection_id).await?.is_none() {
            return Err(Error::NotFound(format!("connection {}", connection_id)));
        }
        connections::list_milestones(&mut conn, connection_id).await
    }

    // ========================================
    // Interaction events
    // ========================================

    /// Count one interaction, recompute the level and append due milestones
    ///
    /// Reactivates a dormant connection. Fails with `ConnectionBlocked` on a
    /// blocked connection without counting anything.
    pub async fn record_interaction(&self, connection_id: Uuid, kind: InteractionKind) -> Result<LifecycleUpdate> {
        let _guard = self.lock_connection(connection_id).await;
        let now = self.time.now();

        let mut tx = self.db.begin().await?;
        let update = self.count_interaction(&mut tx, connection_id, kind, now).await?;
        tx.commit().await?;

        self.publish(&update, now);
        Ok(update)
    }

    /// Wait for exclusive access to one connection
    ///
    /// Callers already holding the pair lock take this one second.
    pub(crate) async fn lock_connection(&self, connection_id: Uuid) -> OwnedMutexGuard<()> {
        self.connection_locks.lock(&connection_id).await
    }

    /// Count one interaction on the caller's transaction
    ///
    /// The increment is the first statement, so the transaction holds the
    /// write lock before it reads anything. The caller holds the connection
    /// lock, commits, then calls `publish`.
    pub(crate) async fn count_interaction(
        &self,
        conn: &mut SqliteConnection,
        connection_id: Uuid,
        kind: InteractionKind,
        now: DateTime<Utc>,
    ) -> Result<LifecycleUpdate> {
        let Some(count) = connections::increment_interaction(conn, connection_id, now).await? else {
            return Err(match connections::get(conn, connection_id).await? {
                Some(_) => Error::ConnectionBlocked(connection_id),
                None => Error::NotFound(format!("connection {}", connection_id)),
            });
        };
        let connection = connections::get(conn, connection_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connection {}", connection_id)))?;

        let update = self
            .apply(conn, connection, count.saturating_sub(1), Some(kind), now)
            .await?;

        debug!(
            connection_id = %connection_id,
            kind = ?kind,
            interaction_count = count,
            "Interaction recorded"
        );
        Ok(update)
    }

    /// Re-evaluate level and time-based milestones without counting an interaction
    pub async fn refresh(&self, connection_id: Uuid) -> Result<LifecycleUpdate> {
        let _guard = self.lock_connection(connection_id).await;
        let now = self.time.now();

        let mut tx = self.db.begin().await?;
        let connection = connections::claim(&mut tx, connection_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connection {}", connection_id)))?;
        if connection.is_blocked() {
            return Err(Error::ConnectionBlocked(connection_id));
        }

        let count = connection.interaction_count;
        let update = self.apply(&mut tx, connection, count, None, now).await?;
        tx.commit().await?;

        self.publish(&update, now);
        Ok(update)
    }

    /// Refresh every unblocked connection and mark idle ones dormant
    pub async fn sweep(&self) -> Result<SweepReport> {
        let ids = {
            let mut conn = self.db.acquire().await?;
            connections::unblocked_ids(&mut conn).await?
        };
        let idle_before = self.time.now() - Duration::days(self.config.dormant_after_days);
        let mut report = SweepReport::default();

        for connection_id in ids {
            match self.refresh(connection_id).await {
                Ok(update) => {
                    report.refreshed += 1;
                    report.milestones += update.reached.len();
                    if update.level_changed() {
                        report.level_changes += 1;
                    }
                }
                // Blocked since the id list was read
                Err(Error::ConnectionBlocked(_)) => continue,
                Err(e) => return Err(e),
            }

            let dormant = {
                let _guard = self.lock_connection(connection_id).await;
                let mut conn = self.db.acquire().await?;
                connections::mark_dormant(&mut conn, connection_id, idle_before).await?
            };
            if dormant {
                report.dormant += 1;
                info!(connection_id = %connection_id, "Connection went dormant");
            }
        }

        info!(
            refreshed = report.refreshed,
            level_changes = report.level_changes,
            milestones = report.milestones,
            dormant = report.dormant,
            "Lifecycle sweep completed"
        );
        Ok(report)
    }

    /// Block a connection on behalf of one of its participants
    ///
    /// Blocking is permanent and the record is kept. Blocking an already
    /// blocked connection fails with `ConnectionBlocked`. Live conversation
    /// subscriptions are closed by the caller (see `Engine::block`).
    pub async fn block(&self, connection_id: Uuid, actor_id: Uuid) -> Result<Connection> {
        let pair = {
            let mut conn = self.db.acquire().await?;
            connections::get(&mut conn, connection_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("connection {}", connection_id)))?
                .pair
        };
        if !pair.contains(actor_id) {
            return Err(Error::not_a_participant(actor_id, format!("connection {}", connection_id)));
        }

        let _pair_guard = self.pair_locks.lock(&pair).await;
        let _guard = self.lock_connection(connection_id).await;
        let now = self.time.now();

        let mut conn = self.db.acquire().await?;
        if !connections::block(&mut conn, connection_id, actor_id).await? {
            return Err(Error::ConnectionBlocked(connection_id));
        }
        let connection = connections::get(&mut conn, connection_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connection {}", connection_id)))?;
        drop(conn);

        info!(connection_id = %connection_id, blocked_by = %actor_id, "Connection blocked");
        self.events.emit_lossy(KindredEvent::ConnectionBlocked {
            connection_id,
            blocked_by: actor_id,
            timestamp: now,
        });

        Ok(connection)
    }

    // ========================================
    // Internals
    // ========================================

    fn revalidate(&self, mut connection: Connection, now: DateTime<Utc>) -> Connection {
        connection.level = recompute_level(
            connection.connected_at,
            now,
            connection.interaction_count,
            &self.config,
        );
        connection
    }

    /// Write the recomputed level and append due milestones
    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        mut connection: Connection,
        previous_count: u64,
        interaction: Option<InteractionKind>,
        now: DateTime<Utc>,
    ) -> Result<LifecycleUpdate> {
        let previous_level = connection.level;
        let level = recompute_level(
            connection.connected_at,
            now,
            connection.interaction_count,
            &self.config,
        );
        if level != previous_level {
            connections::update_level(conn, connection.id, level).await?;
            connection.level = level;
        }

        let check = MilestoneCheck {
            previous_count,
            interaction_count: connection.interaction_count,
            interaction,
            level,
            now,
        };

        let mut reached = Vec::new();
        let mut notifications = Vec::new();
        for kind in due_milestones(&connection, &check) {
            if connections::insert_milestone(conn, connection.id, kind, now).await? {
                connection.milestones.push(Milestone { kind, achieved_at: now });
                reached.push(kind);
                notifications.extend(
                    self.notifications
                        .insert_milestone(conn, connection.pair, connection.id, kind)
                        .await?,
                );
            }
        }

        Ok(LifecycleUpdate {
            connection,
            previous_level,
            reached,
            notifications,
        })
    }

    /// Events and notifications for a committed update
    pub(crate) fn publish(&self, update: &LifecycleUpdate, now: DateTime<Utc>) {
        let connection = &update.connection;

        if update.level_changed() {
            info!(
                connection_id = %connection.id,
                old_level = %update.previous_level,
                new_level = %connection.level,
                "Connection level changed"
            );
            self.events.emit_lossy(KindredEvent::ConnectionLevelChanged {
                connection_id: connection.id,
                old_level: update.previous_level,
                new_level: connection.level,
                timestamp: now,
            });
        }

        for kind in &update.reached {
            info!(connection_id = %connection.id, milestone = %kind, "Milestone reached");
            self.events.emit_lossy(KindredEvent::MilestoneReached {
                connection_id: connection.id,
                milestone: *kind,
                timestamp: now,
            });
        }

        update.notifications.iter().for_each(|n| self.notifications.announce(n));
    }
}
