//! Tests for database initialization and schema invariants

use kindred_common::db::init::{init_database, init_memory_database, BUSY_TIMEOUT, SCHEMA_VERSION};
use tempfile::TempDir;

#[tokio::test]
async fn test_database_creation_when_missing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("data").join("kindred.db");

    let result = init_database(&db_path).await;

    assert!(result.is_ok(), "Database initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_opens_existing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("kindred.db");

    let pool1 = init_database(&db_path).await.unwrap();
    pool1.close().await;

    // Second open runs the same idempotent schema statements
    let pool2 = init_database(&db_path).await;
    assert!(pool2.is_ok(), "Failed to open existing database: {:?}", pool2.err());

    let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(&pool2.unwrap())
        .await
        .unwrap();
    assert_eq!(version, SCHEMA_VERSION);
}

#[tokio::test]
async fn test_every_pooled_connection_is_configured() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("kindred.db")).await.unwrap();

    // Hold several connections at once so each one is a distinct handle
    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pool.acquire().await.unwrap());
    }

    for conn in held.iter_mut() {
        let foreign_keys: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&mut **conn)
            .await
            .unwrap();
        assert_eq!(foreign_keys, 1);

        let busy_timeout: i64 = sqlx::query_scalar("PRAGMA busy_timeout")
            .fetch_one(&mut **conn)
            .await
            .unwrap();
        assert_eq!(busy_timeout, BUSY_TIMEOUT.as_millis() as i64);

        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&mut **conn)
            .await
            .unwrap();
        assert_eq!(journal_mode, "wal");
    }
}

#[tokio::test]
async fn test_memory_database_enforces_foreign_keys() {
    let pool = init_memory_database().await.unwrap();

    let foreign_keys: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(foreign_keys, 1);
}

#[tokio::test]
async fn test_all_tables_created() {
    let pool = init_memory_database().await.unwrap();

    for table in [
        "profiles",
        "profile_tags",
        "match_candidates",
        "connections",
        "connection_requests",
        "milestones",
        "messages",
        "notifications",
        "unread_counters",
    ] {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1, "table {} missing", table);
    }
}

#[tokio::test]
async fn test_second_pending_match_for_pair_rejected() {
    let pool = init_memory_database().await.unwrap();

    let insert = r#"
        INSERT INTO match_candidates
            (id, viewer_id, candidate_id, score, reasons, shared_interests, status, queue_day, created_at)
        VALUES (?, 'viewer', 'candidate', 50, '[]', '[]', ?, '2026-01-01', 0)
    "#;

    sqlx::query(insert).bind("m1").bind("pending").execute(&pool).await.unwrap();
    assert!(sqlx::query(insert).bind("m2").bind("pending").execute(&pool).await.is_err());

    // Terminal rows do not count against the pending slot
    sqlx::query(insert).bind("m3").bind("passed").execute(&pool).await.unwrap();
}

#[tokio::test]
async fn test_self_match_rejected() {
    let pool = init_memory_database().await.unwrap();

    let result = sqlx::query(
        r#"
        INSERT INTO match_candidates
            (id, viewer_id, candidate_id, score, reasons, shared_interests, queue_day, created_at)
        VALUES ('m1', 'same', 'same', 50, '[]', '[]', '2026-01-01', 0)
        "#,
    )
    .execute(&pool)
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_score_out_of_range_rejected() {
    let pool = init_memory_database().await.unwrap();

    let result = sqlx::query(
        r#"
        INSERT INTO match_candidates
            (id, viewer_id, candidate_id, score, reasons, shared_interests, queue_day, created_at)
        VALUES ('m1', 'a', 'b', 101, '[]', '[]', '2026-01-01', 0)
        "#,
    )
    .execute(&pool)
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_unread_counter_cannot_go_negative() {
    let pool = init_memory_database().await.unwrap();

    sqlx::query("INSERT INTO unread_counters (recipient_id, unread) VALUES ('r', 0)")
        .execute(&pool)
        .await
        .unwrap();

    let result = sqlx::query("UPDATE unread_counters SET unread = unread - 1 WHERE recipient_id = 'r'")
        .execute(&pool)
        .await;
    assert!(result.is_err());
}
