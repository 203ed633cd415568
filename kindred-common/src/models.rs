//! Domain models
//!
//! Entities shared by the engine, the event bus and the database layer.
//! Enum variants round-trip through the lowercase strings stored in TEXT
//! columns (`as_str` / `FromStr`).

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Declares a string-backed enum stored in a TEXT column
macro_rules! column_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Column representation
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err(Error::InvalidInput(format!(
                        "Unknown {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

// ========================================
// Pair canonicalization
// ========================================

/// Canonical unordered pair of users (lower UUID first)
///
/// Used both as the unique key of a Connection and as the conversation key of
/// the message log. Its string form is `"<low>:<high>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PairKey {
    low: Uuid,
    high: Uuid,
}

impl PairKey {
    /// Canonicalize two distinct users into a pair
    pub fn new(a: Uuid, b: Uuid) -> Result<Self> {
        if a == b {
            return Err(Error::InvalidInput(format!(
                "A pair needs two distinct users, got {} twice",
                a
            )));
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { low, high })
    }

    pub fn low(&self) -> Uuid {
        self.low
    }

    pub fn high(&self) -> Uuid {
        self.high
    }

    /// Whether `user` is one of the two participants
    pub fn contains(&self, user: Uuid) -> bool {
        self.low == user || self.high == user
    }

    /// The participant that is not `user`
    pub fn other(&self, user: Uuid) -> Option<Uuid> {
        if user == self.low {
            Some(self.high)
        } else if user == self.high {
            Some(self.low)
        } else {
            None
        }
    }

    /// Both participants, lower first
    pub fn members(&self) -> [Uuid; 2] {
        [self.low, self.high]
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

impl FromStr for PairKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (a, b) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("Malformed pair key: {}", s)))?;
        let a = Uuid::parse_str(a).map_err(|e| Error::InvalidInput(format!("Malformed pair key {}: {}", s, e)))?;
        let b = Uuid::parse_str(b).map_err(|e| Error::InvalidInput(format!("Malformed pair key {}: {}", s, e)))?;
        let key = PairKey::new(a, b)?;
        if key.low != a {
            return Err(Error::InvalidInput(format!("Pair key not canonical: {}", s)));
        }
        Ok(key)
    }
}

impl TryFrom<String> for PairKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PairKey> for String {
    fn from(key: PairKey) -> Self {
        key.to_string()
    }
}

// ========================================
// Profiles
// ========================================

/// User attributes owned by the Profile Store (read-only to the engine)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub interests: BTreeSet<String>,
    pub values: BTreeSet<String>,
    /// 0-100, adjusted only by trusted events outside this engine
    pub authenticity_score: u8,
    pub created_at: DateTime<Utc>,
}

// ========================================
// Match candidates
// ========================================

column_enum! {
    /// MatchCandidate decision state
    pub enum MatchStatus {
        Pending => "pending",
        Connected => "connected",
        Passed => "passed",
    }
}

/// A scored, surfaced, not-yet-decided potential connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub id: Uuid,
    pub viewer_id: Uuid,
    pub candidate_id: Uuid,
    /// 0-100
    pub score: u8,
    pub reasons: Vec<String>,
    pub shared_interests: BTreeSet<String>,
    pub status: MatchStatus,
    /// Day whose queue surfaced this candidate
    pub queue_day: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

// ========================================
// Connections
// ========================================

column_enum! {
    /// Friendship lifecycle level (derived, never set directly)
    #[derive(PartialOrd, Ord)]
    pub enum ConnectionLevel {
        New => "new",
        Growing => "growing",
        Established => "established",
        Close => "close",
    }
}

column_enum! {
    /// Connection status
    pub enum ConnectionStatus {
        Active => "active",
        Dormant => "dormant",
        Blocked => "blocked",
    }
}

column_enum! {
    /// Milestone types, each emitted at most once per connection
    pub enum MilestoneKind {
        FirstMessage => "first_message",
        WeekStreak => "week_streak",
        MonthAnniversary => "month_anniversary",
        SharedInterestUnlocked => "shared_interest_unlocked",
        CallCompleted => "call_completed",
    }
}

/// Immutable milestone record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub kind: MilestoneKind,
    pub achieved_at: DateTime<Utc>,
}

/// An accepted friendship between two users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub pair: PairKey,
    /// Cached level; revalidated on every read and interaction
    pub level: ConnectionLevel,
    pub interaction_count: u64,
    pub connected_at: DateTime<Utc>,
    pub last_interaction_at: Option<DateTime<Utc>>,
    pub milestones: Vec<Milestone>,
    pub status: ConnectionStatus,
    pub blocked_by: Option<Uuid>,
}

impl Connection {
    pub fn is_blocked(&self) -> bool {
        self.status == ConnectionStatus::Blocked
    }

    /// Last moment the pair interacted, or the connection time if never
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_interaction_at.unwrap_or(self.connected_at)
    }

    pub fn has_milestone(&self, kind: MilestoneKind) -> bool {
        self.milestones.iter().any(|m| m.kind == kind)
    }
}

column_enum! {
    /// Connection request state
    pub enum RequestStatus {
        Pending => "pending",
        Accepted => "accepted",
        Declined => "declined",
    }
}

/// Direct connection request (consent path outside the daily queue)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub recipient_id: Uuid,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

// ========================================
// Messages
// ========================================

column_enum! {
    /// Message content type
    pub enum MessageType {
        Text => "text",
        VibeShare => "vibe_share",
        System => "system",
    }
}

/// Append-only conversation entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_key: PairKey,
    pub sender_id: Uuid,
    pub content: String,
    pub message_type: MessageType,
    /// Strictly increasing within one conversation
    pub sent_at: DateTime<Utc>,
    /// Set at most once, by the receiver
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// The participant who receives this message
    pub fn receiver_id(&self) -> Uuid {
        // sender is always a participant (checked on send)
        self.conversation_key
            .other(self.sender_id)
            .unwrap_or(self.sender_id)
    }
}

// ========================================
// Notifications
// ========================================

column_enum! {
    /// Notification kind
    pub enum NotificationKind {
        NewMatch => "new_match",
        NewMessage => "new_message",
        Milestone => "milestone",
        CircleInvite => "circle_invite",
    }
}

/// Payload reference for a notification, one shape per kind
///
/// Holds ids only, never denormalized content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationPayload {
    NewMatch {
        connection_id: Uuid,
        matched_user_id: Uuid,
    },
    NewMessage {
        conversation_key: PairKey,
        message_id: Uuid,
        sender_id: Uuid,
    },
    Milestone {
        connection_id: Uuid,
        milestone: MilestoneKind,
    },
    CircleInvite {
        circle_id: Uuid,
        inviter_id: Uuid,
    },
}

impl NotificationPayload {
    pub fn kind(&self) -> NotificationKind {
        match self {
            NotificationPayload::NewMatch { .. } => NotificationKind::NewMatch,
            NotificationPayload::NewMessage { .. } => NotificationKind::NewMessage,
            NotificationPayload::Milestone { .. } => NotificationKind::Milestone,
            NotificationPayload::CircleInvite { .. } => NotificationKind::CircleInvite,
        }
    }
}

/// Per-recipient notification record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub payload: NotificationPayload,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        self.payload.kind()
    }
}
