//! Message log queries
//!
//! `sent_at` (microseconds) is the per-conversation ordering key and doubles
//! as the pagination cursor; `UNIQUE(conversation_key, sent_at)` backs the
//! strictly-increasing guarantee.

use crate::db::opt_timestamp;
use crate::error::Result;
use chrono::{DateTime, Utc};
use kindred_common::models::{Message, PairKey};
use kindred_common::{time, uuid_utils};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

const COLUMNS: &str = "id, conversation_key, sender_id, content, message_type, sent_at, read_at";

fn decode(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: uuid_utils::parse_column("messages.id", &row.get::<String, _>("id"))?,
        conversation_key: row.get::<String, _>("conversation_key").parse()?,
        sender_id: uuid_utils::parse_column("sender_id", &row.get::<String, _>("sender_id"))?,
        content: row.get("content"),
        message_type: row.get::<String, _>("message_type").parse()?,
        sent_at: time::from_micros(row.get("sent_at"))?,
        read_at: opt_timestamp(row.get("read_at"))?,
    })
}

/// Latest `sent_at` in a conversation (microseconds)
pub async fn last_sent_at(conn: &mut SqliteConnection, key: PairKey) -> Result<Option<i64>> {
    let last: Option<i64> = sqlx::query_scalar("SELECT MAX(sent_at) FROM messages WHERE conversation_key = ?")
        .bind(key.to_string())
        .fetch_one(&mut *conn)
        .await?;
    Ok(last)
}

pub async fn insert(conn: &mut SqliteConnection, message: &Message) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO messages (id, conversation_key, sender_id, content, message_type, sent_at, read_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(message.id.to_string())
    .bind(message.conversation_key.to_string())
    .bind(message.sender_id.to_string())
    .bind(&message.content)
    .bind(message.message_type.as_str())
    .bind(time::to_micros(message.sent_at))
    .bind(message.read_at.map(time::to_micros))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Message>> {
    let row = sqlx::query(&format!("SELECT {} FROM messages WHERE id = ?", COLUMNS))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(decode).transpose()
}

/// Newest-first page of messages strictly older than `before` (all when `None`)
pub async fn page_before(
    conn: &mut SqliteConnection,
    key: PairKey,
    before: Option<i64>,
    limit: usize,
) -> Result<Vec<Message>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM messages WHERE conversation_key = ? AND sent_at < ? ORDER BY sent_at DESC LIMIT ?",
        COLUMNS
    ))
    .bind(key.to_string())
    .bind(before.unwrap_or(i64::MAX))
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(decode).collect()
}

/// Oldest-first messages strictly newer than `after`
pub async fn since(
    conn: &mut SqliteConnection,
    key: PairKey,
    after: i64,
    limit: usize,
) -> Result<Vec<Message>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM messages WHERE conversation_key = ? AND sent_at > ? ORDER BY sent_at ASC LIMIT ?",
        COLUMNS
    ))
    .bind(key.to_string())
    .bind(after)
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(decode).collect()
}

/// Set `read_at` if still unset; returns `false` if it was already read
pub async fn mark_read(conn: &mut SqliteConnection, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query("UPDATE messages SET read_at = ? WHERE id = ? AND read_at IS NULL")
        .bind(time::to_micros(at))
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}
