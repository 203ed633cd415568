//! Notification and unread counter queries
//!
//! The unread counter is a separate row per recipient changed only by
//! increment/decrement statements, always in the same transaction as the
//! notification row change it accounts for.

use crate::error::Result;
use kindred_common::models::Notification;
use kindred_common::{time, uuid_utils};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

/// Which notifications `list` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationFilter {
    #[default]
    All,
    Unread,
    Read,
}

const COLUMNS: &str = "id, recipient_id, payload, is_read, created_at";

fn decode(row: &SqliteRow) -> Result<Notification> {
    Ok(Notification {
        id: uuid_utils::parse_column("notifications.id", &row.get::<String, _>("id"))?,
        recipient_id: uuid_utils::parse_column("recipient_id", &row.get::<String, _>("recipient_id"))?,
        payload: serde_json::from_str(&row.get::<String, _>("payload"))?,
        is_read: row.get::<i64, _>("is_read") != 0,
        created_at: time::from_micros(row.get("created_at"))?,
    })
}

pub async fn insert(conn: &mut SqliteConnection, notification: &Notification) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO notifications (id, recipient_id, kind, payload, is_read, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(notification.id.to_string())
    .bind(notification.recipient_id.to_string())
    .bind(notification.kind().as_str())
    .bind(serde_json::to_string(&notification.payload)?)
    .bind(notification.is_read as i64)
    .bind(time::to_micros(notification.created_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Notification>> {
    let row = sqlx::query(&format!("SELECT {} FROM notifications WHERE id = ?", COLUMNS))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(decode).transpose()
}

/// Newest-first notifications for a recipient
pub async fn list(
    conn: &mut SqliteConnection,
    recipient_id: Uuid,
    filter: NotificationFilter,
) -> Result<Vec<Notification>> {
    let condition = match filter {
        NotificationFilter::All => "",
        NotificationFilter::Unread => " AND is_read = 0",
        NotificationFilter::Read => " AND is_read = 1",
    };
    let rows = sqlx::query(&format!(
        "SELECT {} FROM notifications WHERE recipient_id = ?{} ORDER BY created_at DESC, rowid DESC",
        COLUMNS, condition
    ))
    .bind(recipient_id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(decode).collect()
}

pub async fn increment_unread(conn: &mut SqliteConnection, recipient_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO unread_counters (recipient_id, unread) VALUES (?, 1)
        ON CONFLICT (recipient_id) DO UPDATE SET unread = unread + 1
        "#,
    )
    .bind(recipient_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Flip one of the recipient's notifications to read
///
/// Returns `false` when it already was read, is missing or belongs to
/// someone else.
pub async fn mark_read(conn: &mut SqliteConnection, id: Uuid, recipient_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE notifications SET is_read = 1 WHERE id = ? AND recipient_id = ? AND is_read = 0",
    )
    .bind(id.to_string())
    .bind(recipient_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn decrement_unread(conn: &mut SqliteConnection, recipient_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE unread_counters SET unread = unread - 1 WHERE recipient_id = ? AND unread > 0")
        .bind(recipient_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Mark everything read and zero the counter; returns how many changed
pub async fn mark_all_read(conn: &mut SqliteConnection, recipient_id: Uuid) -> Result<u64> {
    let result = sqlx::query("UPDATE notifications SET is_read = 1 WHERE recipient_id = ? AND is_read = 0")
        .bind(recipient_id.to_string())
        .execute(&mut *conn)
        .await?;

    sqlx::query("UPDATE unread_counters SET unread = 0 WHERE recipient_id = ?")
        .bind(recipient_id.to_string())
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected())
}

pub async fn unread_count(conn: &mut SqliteConnection, recipient_id: Uuid) -> Result<u64> {
    let unread: Option<i64> = sqlx::query_scalar("SELECT unread FROM unread_counters WHERE recipient_id = ?")
        .bind(recipient_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(unread.unwrap_or(0).max(0) as u64)
}
