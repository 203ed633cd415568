//! Database initialization
//!
//! Creates the database on first run and brings the schema up to date.
//! Every statement is idempotent, so opening an existing database runs the
//! same sequence safely.
//!
//! Invariants the engine relies on are enforced here rather than in code:
//! - one pending MatchCandidate per (viewer, candidate)
//! - one Connection per canonical pair
//! - each milestone kind at most once per connection
//! - strictly increasing `sent_at` per conversation
//! - unread counters never negative

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// How long a connection waits for the SQLite write lock
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Pragmas are per connection, so they go on the connect options and
    // every pooled connection gets them
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Initialize a private in-memory database with the full schema
///
/// Limited to one connection: every SQLite `:memory:` connection is a
/// separate database.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let options = "sqlite::memory:"
        .parse::<SqliteConnectOptions>()?
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create every table and index (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;

    // Profile Store tables (written by the profile service, read here)
    create_profiles_table(pool).await?;
    create_profile_tags_table(pool).await?;

    // Matching
    create_match_candidates_table(pool).await?;

    // Connections
    create_connections_table(pool).await?;
    create_connection_requests_table(pool).await?;
    create_milestones_table(pool).await?;

    // Conversations and notifications
    create_messages_table(pool).await?;
    create_notifications_table(pool).await?;
    create_unread_counters_table(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    info!("Database schema at version {}", SCHEMA_VERSION);
    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_profiles_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS profiles (
            id TEXT PRIMARY KEY,
            authenticity_score INTEGER NOT NULL DEFAULT 50
                CHECK (authenticity_score BETWEEN 0 AND 100),
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Interest and value tags, one row per (profile, category, tag)
async fn create_profile_tags_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS profile_tags (
            profile_id TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
            category TEXT NOT NULL CHECK (category IN ('interest', 'value')),
            tag TEXT NOT NULL,
            PRIMARY KEY (profile_id, category, tag)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_match_candidates_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS match_candidates (
            id TEXT PRIMARY KEY,
            viewer_id TEXT NOT NULL,
            candidate_id TEXT NOT NULL,
            score INTEGER NOT NULL CHECK (score BETWEEN 0 AND 100),
            reasons TEXT NOT NULL,
            shared_interests TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'connected', 'passed')),
            queue_day TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            decided_at INTEGER,
            CHECK (viewer_id <> candidate_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Exactly one non-terminal candidate per pair
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_match_candidates_one_pending
        ON match_candidates (viewer_id, candidate_id)
        WHERE status = 'pending'
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_match_candidates_viewer ON match_candidates (viewer_id, status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_connections_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS connections (
            id TEXT PRIMARY KEY,
            user_low TEXT NOT NULL,
            user_high TEXT NOT NULL,
            level TEXT NOT NULL DEFAULT 'new'
                CHECK (level IN ('new', 'growing', 'established', 'close')),
            interaction_count INTEGER NOT NULL DEFAULT 0 CHECK (interaction_count >= 0),
            connected_at INTEGER NOT NULL,
            last_interaction_at INTEGER,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'dormant', 'blocked')),
            blocked_by TEXT,
            UNIQUE (user_low, user_high),
            CHECK (user_low < user_high)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_connections_high ON connections (user_high)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_connection_requests_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS connection_requests (
            id TEXT PRIMARY KEY,
            requester_id TEXT NOT NULL,
            recipient_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'accepted', 'declined')),
            created_at INTEGER NOT NULL,
            responded_at INTEGER,
            CHECK (requester_id <> recipient_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_connection_requests_one_pending
        ON connection_requests (requester_id, recipient_id)
        WHERE status = 'pending'
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_milestones_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS milestones (
            connection_id TEXT NOT NULL REFERENCES connections(id),
            kind TEXT NOT NULL,
            achieved_at INTEGER NOT NULL,
            PRIMARY KEY (connection_id, kind)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_messages_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_key TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            content TEXT NOT NULL,
            message_type TEXT NOT NULL CHECK (message_type IN ('text', 'vibe_share', 'system')),
            sent_at INTEGER NOT NULL,
            read_at INTEGER,
            UNIQUE (conversation_key, sent_at)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_notifications_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notifications (
            id TEXT PRIMARY KEY,
            recipient_id TEXT NOT NULL,
            kind TEXT NOT NULL
                CHECK (kind IN ('new_match', 'new_message', 'milestone', 'circle_invite')),
            payload TEXT NOT NULL,
            is_read INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_notifications_recipient ON notifications (recipient_id, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_unread_counters_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS unread_counters (
            recipient_id TEXT PRIMARY KEY,
            unread INTEGER NOT NULL DEFAULT 0 CHECK (unread >= 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
