//! MatchCandidate queries
//!
//! The partial unique index on `(viewer_id, candidate_id) WHERE status =
//! 'pending'` makes `insert_pending` the idempotence point for queue builds.
//! Decisions are conditional updates on `status = 'pending'`.

use crate::db::opt_timestamp;
use crate::error::Result;
use chrono::{DateTime, NaiveDate, Utc};
use kindred_common::models::{MatchCandidate, MatchStatus};
use kindred_common::{time, uuid_utils};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::BTreeSet;
use uuid::Uuid;

const COLUMNS: &str = "id, viewer_id, candidate_id, score, reasons, shared_interests, status, queue_day, created_at, decided_at";

fn decode(row: &SqliteRow) -> Result<MatchCandidate> {
    let reasons: Vec<String> = serde_json::from_str(&row.get::<String, _>("reasons"))?;
    let shared_interests: BTreeSet<String> =
        serde_json::from_str(&row.get::<String, _>("shared_interests"))?;
    let score: i64 = row.get("score");
    let queue_day: String = row.get("queue_day");

    Ok(MatchCandidate {
        id: uuid_utils::parse_column("match_candidates.id", &row.get::<String, _>("id"))?,
        viewer_id: uuid_utils::parse_column("viewer_id", &row.get::<String, _>("viewer_id"))?,
        candidate_id: uuid_utils::parse_column("candidate_id", &row.get::<String, _>("candidate_id"))?,
        score: score.clamp(0, 100) as u8,
        reasons,
        shared_interests,
        status: row.get::<String, _>("status").parse()?,
        queue_day: queue_day.parse::<NaiveDate>().map_err(|e| {
            kindred_common::Error::InvalidInput(format!("Invalid queue_day {}: {}", queue_day, e))
        })?,
        created_at: time::from_micros(row.get("created_at"))?,
        decided_at: opt_timestamp(row.get("decided_at"))?,
    })
}

fn decode_ids(ids: Vec<String>, column: &str) -> Result<Vec<Uuid>> {
    ids.iter()
        .map(|id| uuid_utils::parse_column(column, id).map_err(Into::into))
        .collect()
}

/// Insert a pending candidate
///
/// Returns `false` (and writes nothing) when the pair already has a pending row.
pub async fn insert_pending(conn: &mut SqliteConnection, candidate: &MatchCandidate) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO match_candidates
            (id, viewer_id, candidate_id, score, reasons, shared_interests, status, queue_day, created_at)
        VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?)
        "#,
    )
    .bind(candidate.id.to_string())
    .bind(candidate.viewer_id.to_string())
    .bind(candidate.candidate_id.to_string())
    .bind(candidate.score as i64)
    .bind(serde_json::to_string(&candidate.reasons)?)
    .bind(serde_json::to_string(&candidate.shared_interests)?)
    .bind(candidate.queue_day.to_string())
    .bind(time::to_micros(candidate.created_at))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<MatchCandidate>> {
    let row = sqlx::query(&format!("SELECT {} FROM match_candidates WHERE id = ?", COLUMNS))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(decode).transpose()
}

/// The pending row for a (viewer, candidate) pair, if any
pub async fn find_pending(
    conn: &mut SqliteConnection,
    viewer_id: Uuid,
    candidate_id: Uuid,
) -> Result<Option<MatchCandidate>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM match_candidates WHERE viewer_id = ? AND candidate_id = ? AND status = 'pending'",
        COLUMNS
    ))
    .bind(viewer_id.to_string())
    .bind(candidate_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(decode).transpose()
}

/// Pending rows surfaced by the given day's queue
pub async fn pending_for_day(
    conn: &mut SqliteConnection,
    viewer_id: Uuid,
    day: NaiveDate,
) -> Result<Vec<MatchCandidate>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM match_candidates WHERE viewer_id = ? AND status = 'pending' AND queue_day = ?",
        COLUMNS
    ))
    .bind(viewer_id.to_string())
    .bind(day.to_string())
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(decode).collect()
}

/// Every pending row for a viewer, newest first
pub async fn pending_for_viewer(conn: &mut SqliteConnection, viewer_id: Uuid) -> Result<Vec<MatchCandidate>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM match_candidates WHERE viewer_id = ? AND status = 'pending' ORDER BY created_at DESC, score DESC",
        COLUMNS
    ))
    .bind(viewer_id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(decode).collect()
}

/// Candidates the viewer has pending or connected rows for
pub async fn pending_or_connected_ids(conn: &mut SqliteConnection, viewer_id: Uuid) -> Result<Vec<Uuid>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT candidate_id FROM match_candidates WHERE viewer_id = ? AND status IN ('pending', 'connected')",
    )
    .bind(viewer_id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    decode_ids(ids, "candidate_id")
}

/// Candidates the viewer passed at or after `since`
pub async fn passed_since(
    conn: &mut SqliteConnection,
    viewer_id: Uuid,
    since: DateTime<Utc>,
) -> Result<Vec<Uuid>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT candidate_id FROM match_candidates WHERE viewer_id = ? AND status = 'passed' AND decided_at >= ?",
    )
    .bind(viewer_id.to_string())
    .bind(time::to_micros(since))
    .fetch_all(&mut *conn)
    .await?;
    decode_ids(ids, "candidate_id")
}

/// Move a pending row to a terminal status
///
/// Returns `false` when the row is no longer pending (or does not exist).
pub async fn decide(
    conn: &mut SqliteConnection,
    id: Uuid,
    status: MatchStatus,
    decided_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE match_candidates SET status = ?, decided_at = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(status.as_str())
    .bind(time::to_micros(decided_at))
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}
