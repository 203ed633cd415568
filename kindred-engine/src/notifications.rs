//! Notification Fan-out
//!
//! Turns domain events into per-recipient notification records. Each record
//! and its unread counter change commit in one transaction; the counter is
//! only ever moved by increment/decrement statements.
//!
//! Fan-out sources: a match or accepted request (both participants), a sent
//! message (receiver only), a milestone (both participants) and circle
//! invites passed through from outside the engine. Repeated identical events
//! produce repeated notifications.

use crate::db::notifications as store;
use crate::error::{Error, Result};
use kindred_common::events::{EventBus, KindredEvent};
use kindred_common::models::{Message, MilestoneKind, Notification, NotificationPayload, PairKey};
use kindred_common::{uuid_utils, TimeSource};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub use crate::db::notifications::NotificationFilter;

/// Creates notification records and maintains unread counters
#[derive(Clone)]
pub struct NotificationFanout {
    db: SqlitePool,
    time: Arc<dyn TimeSource>,
    events: EventBus,
}

impl NotificationFanout {
    pub fn new(db: SqlitePool, time: Arc<dyn TimeSource>, events: EventBus) -> Self {
        Self { db, time, events }
    }

    /// Create a notification and count it as unread
    pub async fn notify(&self, recipient_id: Uuid, payload: NotificationPayload) -> Result<Notification> {
        let mut tx = self.db.begin().await?;
        let notification = self.insert(&mut tx, recipient_id, payload).await?;
        tx.commit().await?;

        self.announce(&notification);
        Ok(notification)
    }

    /// Write a notification and its counter change on the caller's transaction
    ///
    /// Nothing is announced; call `announce` once the transaction commits.
    pub(crate) async fn insert(
        &self,
        conn: &mut SqliteConnection,
        recipient_id: Uuid,
        payload: NotificationPayload,
    ) -> Result<Notification> {
        let notification = Notification {
            id: uuid_utils::generate(),
            recipient_id,
            payload,
            is_read: false,
            created_at: self.time.now(),
        };

        store::insert(conn, &notification).await?;
        store::increment_unread(conn, recipient_id).await?;
        Ok(notification)
    }

    /// Publish a committed notification on the event bus
    pub(crate) fn announce(&self, notification: &Notification) {
        debug!(
            notification_id = %notification.id,
            recipient_id = %notification.recipient_id,
            kind = %notification.kind(),
            "Notification created"
        );

        self.events.emit_lossy(KindredEvent::NotificationCreated {
            notification_id: notification.id,
            recipient_id: notification.recipient_id,
            kind: notification.kind(),
            timestamp: notification.created_at,
        });
    }

    /// `new_match` for both participants of a new connection
    pub async fn new_match(&self, pair: PairKey, connection_id: Uuid) -> Result<Vec<Notification>> {
        let mut tx = self.db.begin().await?;
        let mut created = Vec::with_capacity(2);
        for user in pair.members() {
            let matched_user_id = pair.other(user).unwrap_or(user);
            created.push(
                self.insert(
                    &mut tx,
                    user,
                    NotificationPayload::NewMatch {
                        connection_id,
                        matched_user_id,
                    },
                )
                .await?,
            );
        }
        tx.commit().await?;

        created.iter().for_each(|n| self.announce(n));
        Ok(created)
    }

    /// `new_message` for the receiver of a message, on the caller's transaction
    pub(crate) async fn insert_new_message(&self, conn: &mut SqliteConnection, message: &Message) -> Result<Notification> {
        self.insert(
            conn,
            message.receiver_id(),
            NotificationPayload::NewMessage {
                conversation_key: message.conversation_key,
                message_id: message.id,
                sender_id: message.sender_id,
            },
        )
        .await
    }

    /// `milestone` for both participants, on the caller's transaction
    pub(crate) async fn insert_milestone(
        &self,
        conn: &mut SqliteConnection,
        pair: PairKey,
        connection_id: Uuid,
        milestone: MilestoneKind,
    ) -> Result<Vec<Notification>> {
        let mut created = Vec::with_capacity(2);
        for user in pair.members() {
            created.push(
                self.insert(
                    conn,
                    user,
                    NotificationPayload::Milestone {
                        connection_id,
                        milestone,
                    },
                )
                .await?,
            );
        }
        Ok(created)
    }

    /// Circle invite passthrough
    pub async fn circle_invite(&self, recipient_id: Uuid, circle_id: Uuid, inviter_id: Uuid) -> Result<Notification> {
        if recipient_id == inviter_id {
            return Err(Error::InvalidInput("A user cannot invite themself to a circle".into()));
        }
        self.notify(
            recipient_id,
            NotificationPayload::CircleInvite { circle_id, inviter_id },
        )
        .await
    }

    /// Mark one notification read
    ///
    /// Only the recipient may mark it. Returns `false` when it was already
    /// read; the counter is decremented only on the first call.
    pub async fn mark_read(&self, notification_id: Uuid, reader_id: Uuid) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        // Write first so the transaction never upgrades a read snapshot
        if store::mark_read(&mut tx, notification_id, reader_id).await? {
            store::decrement_unread(&mut tx, reader_id).await?;
            tx.commit().await?;
            return Ok(true);
        }

        let notification = store::get(&mut tx, notification_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("notification {}", notification_id)))?;
        if notification.recipient_id != reader_id {
            return Err(Error::not_a_participant(
                reader_id,
                format!("notification {}", notification_id),
            ));
        }
        Ok(false)
    }

    /// Mark every notification of a recipient read and zero the counter
    pub async fn mark_all_read(&self, recipient_id: Uuid) -> Result<u64> {
        let mut tx = self.db.begin().await?;
        let changed = store::mark_all_read(&mut tx, recipient_id).await?;
        tx.commit().await?;

        debug!(recipient_id = %recipient_id, changed, "Marked all notifications read");
        Ok(changed)
    }

    /// Notifications for a recipient, newest first
    pub async fn list(&self, recipient_id: Uuid, filter: NotificationFilter) -> Result<Vec<Notification>> {
        let mut conn = self.db.acquire().await?;
        store::list(&mut conn, recipient_id, filter).await
    }

    pub async fn unread_count(&self, recipient_id: Uuid) -> Result<u64> {
        let mut conn = self.db.acquire().await?;
        store::unread_count(&mut conn, recipient_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use kindred_common::db::init_memory_database;
    use kindred_common::ManualTimeSource;

    async fn fanout() -> (NotificationFanout, ManualTimeSource) {
        let db = init_memory_database().await.unwrap();
        let clock = ManualTimeSource::new(Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap());
        let fanout = NotificationFanout::new(db, Arc::new(clock.clone()), EventBus::new(16));
        (fanout, clock)
    }

    async fn invite(fanout: &NotificationFanout, recipient: Uuid) -> Notification {
        fanout
            .circle_invite(recipient, Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_notify_increments_unread() {
        let (fanout, _) = fanout().await;
        let user = Uuid::new_v4();

        invite(&fanout, user).await;
        invite(&fanout, user).await;

        assert_eq!(fanout.unread_count(user).await.unwrap(), 2);
        assert_eq!(fanout.unread_count(Uuid::new_v4()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent() {
        let (fanout, _) = fanout().await;
        let user = Uuid::new_v4();
        let first = invite(&fanout, user).await;
        invite(&fanout, user).await;

        assert!(fanout.mark_read(first.id, user).await.unwrap());
        assert!(!fanout.mark_read(first.id, user).await.unwrap());

        assert_eq!(fanout.unread_count(user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_only_recipient_may_mark_read() {
        let (fanout, _) = fanout().await;
        let user = Uuid::new_v4();
        let notification = invite(&fanout, user).await;

        let err = fanout.mark_read(notification.id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotAParticipant { .. }));

        let err = fanout.mark_read(Uuid::new_v4(), user).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_mark_all_read_zeroes_counter() {
        let (fanout, _) = fanout().await;
        let user = Uuid::new_v4();
        for _ in 0..3 {
            invite(&fanout, user).await;
        }

        assert_eq!(fanout.mark_all_read(user).await.unwrap(), 3);
        assert_eq!(fanout.unread_count(user).await.unwrap(), 0);
        assert_eq!(fanout.mark_all_read(user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_filtered() {
        let (fanout, clock) = fanout().await;
        let user = Uuid::new_v4();
        let older = invite(&fanout, user).await;
        clock.advance(Duration::minutes(5));
        let newer = invite(&fanout, user).await;
        fanout.mark_read(older.id, user).await.unwrap();

        let all = fanout.list(user, NotificationFilter::All).await.unwrap();
        assert_eq!(all.iter().map(|n| n.id).collect::<Vec<_>>(), vec![newer.id, older.id]);

        let unread = fanout.list(user, NotificationFilter::Unread).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, newer.id);

        let read = fanout.list(user, NotificationFilter::Read).await.unwrap();
        assert_eq!(read.len(), 1);
        assert!(read[0].is_read);
    }

    #[tokio::test]
    async fn test_milestone_reaches_both_participants() {
        let (fanout, _) = fanout().await;
        let pair = PairKey::new(Uuid::new_v4(), Uuid::new_v4()).unwrap();
        let connection_id = Uuid::new_v4();

        let mut tx = fanout.db.begin().await.unwrap();
        let created = fanout
            .insert_milestone(&mut tx, pair, connection_id, MilestoneKind::FirstMessage)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(created.len(), 2);
        for user in pair.members() {
            assert_eq!(fanout.unread_count(user).await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_rolled_back_insert_leaves_no_trace() {
        let (fanout, _) = fanout().await;
        let user = Uuid::new_v4();

        {
            let mut tx = fanout.db.begin().await.unwrap();
            fanout
                .insert(&mut tx, user, NotificationPayload::CircleInvite {
                    circle_id: Uuid::new_v4(),
                    inviter_id: Uuid::new_v4(),
                })
                .await
                .unwrap();
            tx.rollback().await.unwrap();
        }

        assert_eq!(fanout.unread_count(user).await.unwrap(), 0);
        assert!(fanout.list(user, NotificationFilter::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_match_names_the_other_user() {
        let (fanout, _) = fanout().await;
        let pair = PairKey::new(Uuid::new_v4(), Uuid::new_v4()).unwrap();

        let created = fanout.new_match(pair, Uuid::new_v4()).await.unwrap();

        for notification in created {
            match notification.payload {
                NotificationPayload::NewMatch { matched_user_id, .. } => {
                    assert_eq!(pair.other(notification.recipient_id), Some(matched_user_id));
                }
                other => panic!("unexpected payload {:?}", other),
            }
        }
    }
}
