//! Conversation message log and live fan-out
//!
//! `send` holds the pair lock, then the connection lock. The message row, the
//! interaction count with any milestones, and the receiver's notification
//! commit in one transaction; subscribers and the event bus hear about the
//! message only after that commit. `sent_at` is the wall clock, bumped one
//! microsecond past the previous message when the clock has not moved (or
//! moved backwards).

use super::subscription::Subscription;
use super::ConversationEvent;
use crate::config::ChannelConfig;
use crate::db::{connections, messages};
use crate::error::{Error, Result};
use crate::lifecycle::{ConnectionManager, InteractionKind, LifecycleUpdate};
use crate::locks::KeyedLocks;
use crate::notifications::NotificationFanout;
use chrono::{DateTime, Utc};
use kindred_common::events::{EventBus, KindredEvent};
use kindred_common::models::{Connection, Message, MessageType, Notification, PairKey};
use kindred_common::{time, uuid_utils, TimeSource};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Position in a conversation, ordered by `sent_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageCursor(i64);

impl MessageCursor {
    /// Cursor positioned at `message`
    pub fn of(message: &Message) -> Self {
        Self(time::to_micros(message.sent_at))
    }

    pub fn from_sent_at(sent_at: DateTime<Utc>) -> Self {
        Self(time::to_micros(sent_at))
    }

    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn as_micros(&self) -> i64 {
        self.0
    }
}

/// One page of history, newest first
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    /// Pass back to `history` for the next (older) page; `None` at the start
    /// of the conversation
    pub next_cursor: Option<MessageCursor>,
}

struct Topic {
    tx: broadcast::Sender<ConversationEvent>,
    closed: CancellationToken,
}

/// Everything one committed send produced
struct Delivery {
    message: Message,
    update: LifecycleUpdate,
    notification: Notification,
}

/// Message log and live delivery for every conversation
pub struct ConversationChannel {
    db: SqlitePool,
    time: Arc<dyn TimeSource>,
    config: ChannelConfig,
    events: EventBus,
    lifecycle: Arc<ConnectionManager>,
    notifications: NotificationFanout,
    pair_locks: Arc<KeyedLocks<PairKey>>,
    topics: Mutex<HashMap<PairKey, Topic>>,
}

impl ConversationChannel {
    pub fn new(
        db: SqlitePool,
        time: Arc<dyn TimeSource>,
        config: ChannelConfig,
        events: EventBus,
        lifecycle: Arc<ConnectionManager>,
        notifications: NotificationFanout,
        pair_locks: Arc<KeyedLocks<PairKey>>,
    ) -> Self {
        Self {
            db,
            time,
            config,
            events,
            lifecycle,
            notifications,
            pair_locks,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Connection behind a conversation, which must exist and not be blocked
    async fn open_connection(&self, conn: &mut SqliteConnection, key: PairKey) -> Result<Connection> {
        let connection = connections::get_by_pair(conn, key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connection for conversation {}", key)))?;
        if connection.is_blocked() {
            return Err(Error::ConnectionBlocked(connection.id));
        }
        Ok(connection)
    }

    /// Append a message and deliver it
    ///
    /// Fails with `NotAParticipant` for outsiders and `ConnectionBlocked` for
    /// blocked pairs, writing nothing in either case. A successful send
    /// counts one interaction on the connection and notifies the receiver;
    /// a failed one leaves no trace.
    pub async fn send(
        &self,
        key: PairKey,
        sender_id: Uuid,
        content: impl Into<String>,
        message_type: MessageType,
    ) -> Result<Message> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(Error::InvalidInput("Message content must not be empty".into()));
        }
        if !key.contains(sender_id) {
            return Err(Error::not_a_participant(sender_id, format!("conversation {}", key)));
        }

        let _pair_guard = self.pair_locks.lock(&key).await;

        let connection_id = {
            let mut conn = self.db.acquire().await?;
            self.open_connection(&mut conn, key).await?.id
        };
        let _connection_guard = self.lifecycle.lock_connection(connection_id).await;
        let now = self.time.now();

        let Delivery {
            message,
            update,
            notification,
        } = self
            .commit_send(key, connection_id, sender_id, content, message_type, now)
            .await?;

        self.publish(key, ConversationEvent::Message(message.clone()));
        self.events.emit_lossy(KindredEvent::MessageSent {
            message_id: message.id,
            conversation_key: key,
            sender_id,
            timestamp: message.sent_at,
        });
        self.lifecycle.publish(&update, now);
        self.notifications.announce(&notification);

        debug!(
            conversation = %key,
            message_id = %message.id,
            sender_id = %sender_id,
            "Message sent"
        );
        Ok(message)
    }

    /// One send as a single transaction
    async fn commit_send(
        &self,
        key: PairKey,
        connection_id: Uuid,
        sender_id: Uuid,
        content: String,
        message_type: MessageType,
        now: DateTime<Utc>,
    ) -> Result<Delivery> {
        let mut tx = self.db.begin().await?;

        // The increment is the first statement: from here on this transaction is the writer
        let update = self
            .lifecycle
            .count_interaction(&mut tx, connection_id, InteractionKind::Message, now)
            .await?;

        let now_micros = time::to_micros(now);
        let sent_at = match messages::last_sent_at(&mut tx, key).await? {
            Some(last) => now_micros.max(last + 1),
            None => now_micros,
        };

        let message = Message {
            id: uuid_utils::generate(),
            conversation_key: key,
            sender_id,
            content,
            message_type,
            sent_at: time::from_micros(sent_at)?,
            read_at: None,
        };
        messages::insert(&mut tx, &message).await?;
        let notification = self.notifications.insert_new_message(&mut tx, &message).await?;

        tx.commit().await?;

        Ok(Delivery {
            message,
            update,
            notification,
        })
    }

    /// One page of history, newest first
    ///
    /// `before` restarts the walk below a cursor returned by a previous page.
    pub async fn history(
        &self,
        key: PairKey,
        limit: usize,
        before: Option<MessageCursor>,
    ) -> Result<HistoryPage> {
        if limit == 0 {
            return Err(Error::InvalidInput("History limit must be positive".into()));
        }
        let limit = limit.min(self.config.history_page_max);

        let mut conn = self.db.acquire().await?;
        let mut page = messages::page_before(&mut conn, key, before.map(|c| c.as_micros()), limit + 1).await?;

        let has_more = page.len() > limit;
        page.truncate(limit);
        let next_cursor = if has_more { page.last().map(MessageCursor::of) } else { None };

        Ok(HistoryPage {
            messages: page,
            next_cursor,
        })
    }

    /// Every message after `after` (from the start when `None`), oldest first
    pub async fn messages_since(&self, key: PairKey, after: Option<MessageCursor>) -> Result<Vec<Message>> {
        let page_size = self.config.history_page_max;
        let mut after = after.map(|c| c.as_micros()).unwrap_or(i64::MIN);
        let mut found = Vec::new();

        let mut conn = self.db.acquire().await?;
        loop {
            let page = messages::since(&mut conn, key, after, page_size).await?;
            let fetched = page.len();
            if let Some(last) = page.last() {
                after = time::to_micros(last.sent_at);
            }
            found.extend(page);
            if fetched < page_size {
                break;
            }
        }

        Ok(found)
    }

    /// Receive messages sent from now on
    pub async fn subscribe(&self, key: PairKey, subscriber_id: Uuid) -> Result<Subscription> {
        self.open_subscription(key, subscriber_id, None).await
    }

    /// Subscribe and first replay every message after `last_seen`
    ///
    /// Used on reconnect: nothing sent between `last_seen` and the live
    /// stream is missed, and nothing is delivered twice.
    pub async fn resume(
        &self,
        key: PairKey,
        subscriber_id: Uuid,
        last_seen: Option<MessageCursor>,
    ) -> Result<Subscription> {
        let replay_after = last_seen.map(|c| c.as_micros()).unwrap_or(i64::MIN);
        self.open_subscription(key, subscriber_id, Some(replay_after)).await
    }

    async fn open_subscription(
        &self,
        key: PairKey,
        subscriber_id: Uuid,
        replay_after: Option<i64>,
    ) -> Result<Subscription> {
        if !key.contains(subscriber_id) {
            return Err(Error::not_a_participant(subscriber_id, format!("conversation {}", key)));
        }

        // No send can interleave between reading the log position and attaching
        let _pair_guard = self.pair_locks.lock(&key).await;

        let last_sent = {
            let mut conn = self.db.acquire().await?;
            self.open_connection(&mut conn, key).await?;
            messages::last_sent_at(&mut conn, key).await?
        };

        let (rx, cancel) = self.attach(key);
        let start = replay_after.unwrap_or_else(|| last_sent.unwrap_or(i64::MIN));
        let mut subscription = Subscription::new(
            key,
            subscriber_id,
            rx,
            cancel,
            start,
            self.db.clone(),
            self.config.history_page_max,
        );

        if replay_after.is_some() {
            let replayed = subscription.backfill().await?;
            debug!(conversation = %key, subscriber_id = %subscriber_id, replayed, "Subscription resumed");
        } else {
            debug!(conversation = %key, subscriber_id = %subscriber_id, "Subscribed");
        }

        Ok(subscription)
    }

    /// Mark a message read on behalf of its receiver
    ///
    /// Returns `true` only for the call that set `read_at`. Repeating it, or
    /// the sender marking their own message, is a no-op returning `false`.
    /// Fails with `ConnectionBlocked` once the pair is blocked.
    pub async fn mark_read(&self, message_id: Uuid, reader_id: Uuid) -> Result<bool> {
        let key = {
            let mut conn = self.db.acquire().await?;
            messages::get(&mut conn, message_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("message {}", message_id)))?
                .conversation_key
        };
        if !key.contains(reader_id) {
            return Err(Error::not_a_participant(reader_id, format!("conversation {}", key)));
        }

        // A block cannot land between the check and the receipt
        let _pair_guard = self.pair_locks.lock(&key).await;
        let now = self.time.now();

        let mut conn = self.db.acquire().await?;
        self.open_connection(&mut conn, key).await?;
        let message = messages::get(&mut conn, message_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("message {}", message_id)))?;
        if message.sender_id == reader_id {
            return Ok(false);
        }

        let changed = messages::mark_read(&mut conn, message_id, now).await?;
        drop(conn);

        if changed {
            self.publish(
                key,
                ConversationEvent::ReadReceipt {
                    message_id,
                    reader_id,
                    read_at: now,
                },
            );
            self.events.emit_lossy(KindredEvent::MessageRead {
                message_id,
                conversation_key: key,
                reader_id,
                timestamp: now,
            });
        }

        Ok(changed)
    }

    /// End every live subscription on a conversation
    ///
    /// Returns how many subscribers were attached.
    pub fn close(&self, key: PairKey) -> usize {
        let topic = self
            .topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);

        match topic {
            Some(topic) => {
                let subscribers = topic.tx.receiver_count();
                topic.closed.cancel();
                info!(conversation = %key, subscribers, "Conversation closed");
                subscribers
            }
            None => 0,
        }
    }

    /// Live subscribers currently attached to a conversation
    pub fn subscriber_count(&self, key: PairKey) -> usize {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let count = topics.get(&key).map(|topic| topic.tx.receiver_count()).unwrap_or(0);
        if count == 0 {
            topics.remove(&key);
        }
        count
    }

    /// Conversations that currently have at least one live subscriber
    pub fn live_conversations(&self) -> usize {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut topics);
        topics.len()
    }

    fn attach(&self, key: PairKey) -> (broadcast::Receiver<ConversationEvent>, CancellationToken) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut topics);
        let buffer = self.config.subscriber_buffer;
        let topic = topics.entry(key).or_insert_with(|| Topic {
            tx: broadcast::channel(buffer).0,
            closed: CancellationToken::new(),
        });
        (topic.tx.subscribe(), topic.closed.child_token())
    }

    fn publish(&self, key: PairKey, event: ConversationEvent) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(topic) = topics.get(&key) {
            if topic.tx.send(event).is_err() {
                // Every subscriber is gone
                topics.remove(&key);
            }
        }
    }
}

/// Drop topics whose subscribers have all gone away
fn prune(topics: &mut HashMap<PairKey, Topic>) {
    topics.retain(|_, topic| topic.tx.receiver_count() > 0);
}
