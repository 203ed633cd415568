//! Live conversation subscription
//!
//! Wraps a broadcast receiver for one conversation. Delivery is
//! at-least-once from the channel's side; the subscription itself drops any
//! message at or before the last `sent_at` it delivered, so backfill and
//! live delivery never hand the same message out twice.
//!
//! A subscriber that falls behind the broadcast buffer is backfilled from
//! the message log. Read receipts dropped during such a lag are not
//! replayed; the backfilled messages carry their current `read_at`.

use super::channel::MessageCursor;
use super::ConversationEvent;
use crate::db::messages;
use crate::error::Result;
use futures::Stream;
use kindred_common::models::PairKey;
use kindred_common::time;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Handle to a live conversation subscription
///
/// Dropping the handle releases it. `unsubscribe` does the same explicitly;
/// cancelling the token from [`Subscription::cancellation_token`] (e.g. when
/// the client transport disconnects) ends it from elsewhere.
pub struct Subscription {
    key: PairKey,
    subscriber_id: Uuid,
    rx: broadcast::Receiver<ConversationEvent>,
    cancel: CancellationToken,
    backlog: VecDeque<ConversationEvent>,
    /// `sent_at` (microseconds) of the last delivered message
    last_seen: i64,
    db: SqlitePool,
    page_size: usize,
}

impl Subscription {
    pub(crate) fn new(
        key: PairKey,
        subscriber_id: Uuid,
        rx: broadcast::Receiver<ConversationEvent>,
        cancel: CancellationToken,
        last_seen: i64,
        db: SqlitePool,
        page_size: usize,
    ) -> Self {
        Self {
            key,
            subscriber_id,
            rx,
            cancel,
            backlog: VecDeque::new(),
            last_seen,
            db,
            page_size: page_size.max(1),
        }
    }

    pub fn conversation_key(&self) -> PairKey {
        self.key
    }

    pub fn subscriber_id(&self) -> Uuid {
        self.subscriber_id
    }

    /// Cursor of the last message delivered (or skipped over at subscribe time)
    pub fn cursor(&self) -> Option<MessageCursor> {
        (self.last_seen != i64::MIN).then_some(MessageCursor::from_micros(self.last_seen))
    }

    /// Token that ends this subscription when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the next event
    ///
    /// Returns `Ok(None)` once the subscription is cancelled or the
    /// conversation is closed (e.g. blocked).
    pub async fn recv(&mut self) -> Result<Option<ConversationEvent>> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            if let Some(event) = self.backlog.pop_front() {
                if self.accept(&event) {
                    return Ok(Some(event));
                }
                continue;
            }

            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(None),
                received = self.rx.recv() => received,
            };

            match received {
                Ok(event) => {
                    if self.accept(&event) {
                        return Ok(Some(event));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        conversation = %self.key,
                        subscriber_id = %self.subscriber_id,
                        skipped,
                        "Subscriber lagged, backfilling from message log"
                    );
                    self.backfill().await?;
                }
                Err(RecvError::Closed) => return Ok(None),
            }
        }
    }

    /// End the subscription and release its resources
    pub fn unsubscribe(self) {
        self.cancel.cancel();
        debug!(conversation = %self.key, subscriber_id = %self.subscriber_id, "Unsubscribed");
    }

    /// Consume the subscription as a stream of events
    ///
    /// The stream ends when the subscription does; a store failure during
    /// backfill is yielded once and ends it too.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<ConversationEvent>> {
        async_stream::stream! {
            loop {
                match self.recv().await {
                    Ok(Some(event)) => yield Ok(event),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }

    /// Queue every stored message after `last_seen`
    pub(crate) async fn backfill(&mut self) -> Result<usize> {
        let mut conn = self.db.acquire().await?;
        let mut after = self.last_seen;
        let mut total = 0;

        loop {
            let page = messages::since(&mut conn, self.key, after, self.page_size).await?;
            let fetched = page.len();
            if let Some(last) = page.last() {
                after = time::to_micros(last.sent_at);
            }
            total += fetched;
            self.backlog.extend(page.into_iter().map(ConversationEvent::Message));
            if fetched < self.page_size {
                break;
            }
        }

        Ok(total)
    }

    fn accept(&mut self, event: &ConversationEvent) -> bool {
        match event.message() {
            Some(message) => {
                let sent_at = time::to_micros(message.sent_at);
                if sent_at <= self.last_seen {
                    return false;
                }
                self.last_seen = sent_at;
                true
            }
            None => true,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("subscriber_id", &self.subscriber_id)
            .field("last_seen", &self.last_seen)
            .field("backlog", &self.backlog.len())
            .finish()
    }
}
