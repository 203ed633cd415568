//! Event types for the Kindred event system
//!
//! Provides the shared event definitions and the EventBus used by the engine
//! to publish domain events to out-of-process collaborators (push dispatcher,
//! analytics). Conversation delivery does not go through this bus; it uses
//! per-conversation channels so ordering stays per conversation.

use crate::models::{ConnectionLevel, MilestoneKind, NotificationKind, PairKey};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Kindred domain events
///
/// Events are broadcast via EventBus and are serializable so a dispatcher can
/// forward them as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KindredEvent {
    /// A daily queue was built (or rebuilt) for a viewer
    QueueBuilt {
        viewer_id: Uuid,
        queue_day: NaiveDate,
        /// Total candidates in today's queue
        size: usize,
        /// Candidates newly surfaced by this build
        newly_surfaced: usize,
        timestamp: DateTime<Utc>,
    },

    /// A match candidate was accepted and a connection now exists
    MatchConnected {
        match_id: Uuid,
        connection_id: Uuid,
        pair: PairKey,
        timestamp: DateTime<Utc>,
    },

    /// A match candidate was passed
    MatchPassed {
        match_id: Uuid,
        viewer_id: Uuid,
        candidate_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Recomputation moved a connection to a different level
    ConnectionLevelChanged {
        connection_id: Uuid,
        old_level: ConnectionLevel,
        new_level: ConnectionLevel,
        timestamp: DateTime<Utc>,
    },

    /// A milestone was appended to a connection
    MilestoneReached {
        connection_id: Uuid,
        milestone: MilestoneKind,
        timestamp: DateTime<Utc>,
    },

    /// A connection was blocked by one of its participants
    ConnectionBlocked {
        connection_id: Uuid,
        blocked_by: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A message was appended to a conversation
    MessageSent {
        message_id: Uuid,
        conversation_key: PairKey,
        sender_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A receiver read a message
    MessageRead {
        message_id: Uuid,
        conversation_key: PairKey,
        reader_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A notification record was created for a recipient
    NotificationCreated {
        notification_id: Uuid,
        recipient_id: Uuid,
        kind: NotificationKind,
        timestamp: DateTime<Utc>,
    },
}

impl KindredEvent {
    /// Event type name (matches the serde tag)
    pub fn event_type(&self) -> &'static str {
        match self {
            KindredEvent::QueueBuilt { .. } => "QueueBuilt",
            KindredEvent::MatchConnected { .. } => "MatchConnected",
            KindredEvent::MatchPassed { .. } => "MatchPassed",
            KindredEvent::ConnectionLevelChanged { .. } => "ConnectionLevelChanged",
            KindredEvent::MilestoneReached { .. } => "MilestoneReached",
            KindredEvent::ConnectionBlocked { .. } => "ConnectionBlocked",
            KindredEvent::MessageSent { .. } => "MessageSent",
            KindredEvent::MessageRead { .. } => "MessageRead",
            KindredEvent::NotificationCreated { .. } => "NotificationCreated",
        }
    }
}

/// Central event distribution bus for application-wide events
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use kindred_common::events::{EventBus, KindredEvent};
/// use uuid::Uuid;
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(KindredEvent::MatchPassed {
///     match_id: Uuid::new_v4(),
///     viewer_id: Uuid::new_v4(),
///     candidate_id: Uuid::new_v4(),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<KindredEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// * `capacity` - Number of events to buffer before slow subscribers lag
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<KindredEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: KindredEvent,
    ) -> Result<usize, broadcast::error::SendError<KindredEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: KindredEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked_event() -> KindredEvent {
        KindredEvent::ConnectionBlocked {
            connection_id: Uuid::new_v4(),
            blocked_by: Uuid::new_v4(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_err() {
        let bus = EventBus::new(10);
        assert!(bus.emit(blocked_event()).is_err());
        // lossy variant must not panic
        bus.emit_lossy(blocked_event());
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_emit_order() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        let first = blocked_event();
        let second = blocked_event();
        bus.emit(first.clone()).unwrap();
        bus.emit(second.clone()).unwrap();

        assert_eq!(rx.recv().await.unwrap(), first);
        assert_eq!(rx.recv().await.unwrap(), second);
    }

    #[test]
    fn test_event_type_matches_serde_tag() {
        let event = KindredEvent::MilestoneReached {
            connection_id: Uuid::new_v4(),
            milestone: MilestoneKind::FirstMessage,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.event_type());
        assert_eq!(value["milestone"], "first_message");
    }

    #[test]
    fn test_capacity_reported() {
        assert_eq!(EventBus::new(42).capacity(), 42);
    }
}
