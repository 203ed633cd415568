//! Connection, milestone and connection request queries
//!
//! `interaction_count` only changes through `increment_interaction`, a single
//! `UPDATE ... + 1 ... RETURNING` statement. Milestones rely on the
//! `(connection_id, kind)` primary key for at-most-once insertion.
//!
//! Transactions that read a connection and then write must start with a
//! write (`increment_interaction` or `claim`). A WAL reader that later tries
//! to write fails with `database is locked` once another connection has
//! committed, and the busy timeout does not help it.

use crate::db::opt_timestamp;
use crate::error::Result;
use chrono::{DateTime, Utc};
use kindred_common::models::{
    Connection, ConnectionLevel, ConnectionRequest, ConnectionStatus, Milestone, MilestoneKind,
    PairKey, RequestStatus,
};
use kindred_common::{time, uuid_utils};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

const COLUMNS: &str = "id, user_low, user_high, level, interaction_count, connected_at, last_interaction_at, status, blocked_by";

/// Decode a connection row (milestones attached separately)
fn decode(row: &SqliteRow) -> Result<Connection> {
    let low = uuid_utils::parse_column("user_low", &row.get::<String, _>("user_low"))?;
    let high = uuid_utils::parse_column("user_high", &row.get::<String, _>("user_high"))?;
    let count: i64 = row.get("interaction_count");
    let blocked_by: Option<String> = row.get("blocked_by");

    Ok(Connection {
        id: uuid_utils::parse_column("connections.id", &row.get::<String, _>("id"))?,
        pair: PairKey::new(low, high)?,
        level: row.get::<String, _>("level").parse()?,
        interaction_count: count.max(0) as u64,
        connected_at: time::from_micros(row.get("connected_at"))?,
        last_interaction_at: opt_timestamp(row.get("last_interaction_at"))?,
        milestones: Vec::new(),
        status: row.get::<String, _>("status").parse()?,
        blocked_by: blocked_by
            .map(|id| uuid_utils::parse_column("blocked_by", &id))
            .transpose()?,
    })
}

async fn with_milestones(conn: &mut SqliteConnection, row: Option<SqliteRow>) -> Result<Option<Connection>> {
    let Some(row) = row else {
        return Ok(None);
    };
    let mut connection = decode(&row)?;
    connection.milestones = list_milestones(conn, connection.id).await?;
    Ok(Some(connection))
}

/// Insert a new connection
///
/// Returns `false` when the pair already has a connection.
pub async fn insert(conn: &mut SqliteConnection, connection: &Connection) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO connections
            (id, user_low, user_high, level, interaction_count, connected_at, last_interaction_at, status, blocked_by)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(connection.id.to_string())
    .bind(connection.pair.low().to_string())
    .bind(connection.pair.high().to_string())
    .bind(connection.level.as_str())
    .bind(connection.interaction_count as i64)
    .bind(time::to_micros(connection.connected_at))
    .bind(connection.last_interaction_at.map(time::to_micros))
    .bind(connection.status.as_str())
    .bind(connection.blocked_by.map(|id| id.to_string()))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Connection>> {
    let row = sqlx::query(&format!("SELECT {} FROM connections WHERE id = ?", COLUMNS))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    with_milestones(conn, row).await
}

pub async fn get_by_pair(conn: &mut SqliteConnection, pair: PairKey) -> Result<Option<Connection>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM connections WHERE user_low = ? AND user_high = ?",
        COLUMNS
    ))
    .bind(pair.low().to_string())
    .bind(pair.high().to_string())
    .fetch_optional(&mut *conn)
    .await?;
    with_milestones(conn, row).await
}

/// Take the write lock, then read a connection
///
/// SQLite has no `SELECT ... FOR UPDATE`; the no-op `UPDATE` makes the
/// enclosing transaction a writer before anything is read.
pub async fn claim(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Connection>> {
    let row = sqlx::query(&format!(
        "UPDATE connections SET level = level WHERE id = ? RETURNING {}",
        COLUMNS
    ))
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    with_milestones(conn, row).await
}

/// Every user the given user has a connection with, in any status
pub async fn partner_ids(conn: &mut SqliteConnection, user_id: Uuid) -> Result<Vec<Uuid>> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT user_high FROM connections WHERE user_low = ?1
        UNION
        SELECT user_low FROM connections WHERE user_high = ?1
        "#,
    )
    .bind(user_id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    ids.iter()
        .map(|id| uuid_utils::parse_column("connections.user", id).map_err(Into::into))
        .collect()
}

/// Connections of one user, optionally including blocked ones
pub async fn list_for_user(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    include_blocked: bool,
) -> Result<Vec<Connection>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM connections WHERE (user_low = ?1 OR user_high = ?1) AND (?2 OR status <> 'blocked') ORDER BY connected_at",
        COLUMNS
    ))
    .bind(user_id.to_string())
    .bind(include_blocked)
    .fetch_all(&mut *conn)
    .await?;

    let mut connections = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut connection = decode(row)?;
        connection.milestones = list_milestones(conn, connection.id).await?;
        connections.push(connection);
    }
    Ok(connections)
}

/// Ids of every connection that is not blocked
pub async fn unblocked_ids(conn: &mut SqliteConnection) -> Result<Vec<Uuid>> {
    let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM connections WHERE status <> 'blocked' ORDER BY id")
        .fetch_all(&mut *conn)
        .await?;
    ids.iter()
        .map(|id| uuid_utils::parse_column("connections.id", id).map_err(Into::into))
        .collect()
}

/// Atomically count one interaction and return the new count
///
/// A dormant connection becomes active again. Returns `None` when the
/// connection is blocked or missing.
pub async fn increment_interaction(
    conn: &mut SqliteConnection,
    id: Uuid,
    at: DateTime<Utc>,
) -> Result<Option<u64>> {
    let count: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE connections
        SET interaction_count = interaction_count + 1,
            last_interaction_at = ?,
            status = CASE WHEN status = 'dormant' THEN 'active' ELSE status END
        WHERE id = ? AND status <> 'blocked'
        RETURNING interaction_count
        "#,
    )
    .bind(time::to_micros(at))
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    Ok(count.map(|c| c.max(0) as u64))
}

/// Refresh the cached level column
pub async fn update_level(conn: &mut SqliteConnection, id: Uuid, level: ConnectionLevel) -> Result<()> {
    sqlx::query("UPDATE connections SET level = ? WHERE id = ?")
        .bind(level.as_str())
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Block a connection; returns `false` if it was already blocked
pub async fn block(conn: &mut SqliteConnection, id: Uuid, blocked_by: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE connections SET status = 'blocked', blocked_by = ? WHERE id = ? AND status <> 'blocked'",
    )
    .bind(blocked_by.to_string())
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Mark an active connection dormant when idle since before `idle_before`
pub async fn mark_dormant(
    conn: &mut SqliteConnection,
    id: Uuid,
    idle_before: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE connections SET status = ?
        WHERE id = ? AND status = 'active'
          AND COALESCE(last_interaction_at, connected_at) < ?
        "#,
    )
    .bind(ConnectionStatus::Dormant.as_str())
    .bind(id.to_string())
    .bind(time::to_micros(idle_before))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Append a milestone unless one of that kind already exists
pub async fn insert_milestone(
    conn: &mut SqliteConnection,
    connection_id: Uuid,
    kind: MilestoneKind,
    achieved_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO milestones (connection_id, kind, achieved_at) VALUES (?, ?, ?)",
    )
    .bind(connection_id.to_string())
    .bind(kind.as_str())
    .bind(time::to_micros(achieved_at))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Milestones in the order they were achieved
pub async fn list_milestones(conn: &mut SqliteConnection, connection_id: Uuid) -> Result<Vec<Milestone>> {
    let rows = sqlx::query(
        "SELECT kind, achieved_at FROM milestones WHERE connection_id = ? ORDER BY achieved_at, rowid",
    )
    .bind(connection_id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> Result<Milestone> {
            Ok(Milestone {
                kind: row.get::<String, _>("kind").parse()?,
                achieved_at: time::from_micros(row.get("achieved_at"))?,
            })
        })
        .collect()
}

// ========================================
// Connection requests
// ========================================

fn decode_request(row: &SqliteRow) -> Result<ConnectionRequest> {
    Ok(ConnectionRequest {
        id: uuid_utils::parse_column("connection_requests.id", &row.get::<String, _>("id"))?,
        requester_id: uuid_utils::parse_column("requester_id", &row.get::<String, _>("requester_id"))?,
        recipient_id: uuid_utils::parse_column("recipient_id", &row.get::<String, _>("recipient_id"))?,
        status: row.get::<String, _>("status").parse()?,
        created_at: time::from_micros(row.get("created_at"))?,
        responded_at: opt_timestamp(row.get("responded_at"))?,
    })
}

/// Insert a pending request; returns `false` if one is already pending
pub async fn insert_request(conn: &mut SqliteConnection, request: &ConnectionRequest) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO connection_requests (id, requester_id, recipient_id, status, created_at)
        VALUES (?, ?, ?, 'pending', ?)
        "#,
    )
    .bind(request.id.to_string())
    .bind(request.requester_id.to_string())
    .bind(request.recipient_id.to_string())
    .bind(time::to_micros(request.created_at))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn get_request(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<ConnectionRequest>> {
    let row = sqlx::query(
        "SELECT id, requester_id, recipient_id, status, created_at, responded_at FROM connection_requests WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(decode_request).transpose()
}

/// Pending request from `requester` to `recipient`, if any
pub async fn find_pending_request(
    conn: &mut SqliteConnection,
    requester_id: Uuid,
    recipient_id: Uuid,
) -> Result<Option<ConnectionRequest>> {
    let row = sqlx::query(
        r#"
        SELECT id, requester_id, recipient_id, status, created_at, responded_at
        FROM connection_requests
        WHERE requester_id = ? AND recipient_id = ? AND status = 'pending'
        "#,
    )
    .bind(requester_id.to_string())
    .bind(recipient_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(decode_request).transpose()
}

/// Resolve a pending request; returns `false` if it was no longer pending
pub async fn resolve_request(
    conn: &mut SqliteConnection,
    id: Uuid,
    status: RequestStatus,
    at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE connection_requests SET status = ?, responded_at = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(status.as_str())
    .bind(time::to_micros(at))
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}
