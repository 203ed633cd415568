//! Engine wiring
//!
//! Builds every component over one pool, one clock, one event bus and one
//! shared table of pair locks, so the conversation channel and the lifecycle
//! manager serialize on the same per-pair lock.

use crate::config::EngineConfig;
use crate::conversation::ConversationChannel;
use crate::db::profiles::SqliteProfileStore;
use crate::error::Result;
use crate::lifecycle::{ConnectionManager, SweepReport};
use crate::locks::KeyedLocks;
use crate::matching::{QueueBuildReport, QueueBuilder};
use crate::notifications::NotificationFanout;
use crate::profiles::ProfileStore;
use kindred_common::config::DATABASE_FILE;
use kindred_common::db::init_database;
use kindred_common::events::EventBus;
use kindred_common::models::Connection;
use kindred_common::{SystemTimeSource, TimeSource};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Friendship Discovery & Connection Engine
pub struct Engine {
    db: SqlitePool,
    config: EngineConfig,
    time: Arc<dyn TimeSource>,
    events: EventBus,
    profiles: Arc<dyn ProfileStore>,
    queue: Arc<QueueBuilder>,
    lifecycle: Arc<ConnectionManager>,
    channel: Arc<ConversationChannel>,
    notifications: NotificationFanout,
}

impl Engine {
    /// Wire the engine over an initialized pool
    pub fn new(
        db: SqlitePool,
        profiles: Arc<dyn ProfileStore>,
        time: Arc<dyn TimeSource>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new(config.event_bus_capacity);
        let pair_locks = Arc::new(KeyedLocks::new());
        let notifications = NotificationFanout::new(db.clone(), Arc::clone(&time), events.clone());

        let lifecycle = Arc::new(ConnectionManager::new(
            db.clone(),
            Arc::clone(&time),
            config.lifecycle.clone(),
            events.clone(),
            notifications.clone(),
            Arc::clone(&pair_locks),
        ));

        let queue = Arc::new(QueueBuilder::new(
            db.clone(),
            Arc::clone(&profiles),
            config.matching.clone(),
            Arc::clone(&time),
            events.clone(),
            Arc::clone(&lifecycle),
        ));

        let channel = Arc::new(ConversationChannel::new(
            db.clone(),
            Arc::clone(&time),
            config.channel.clone(),
            events.clone(),
            Arc::clone(&lifecycle),
            notifications.clone(),
            pair_locks,
        ));

        Ok(Self {
            db,
            config,
            time,
            events,
            profiles,
            queue,
            lifecycle,
            channel,
            notifications,
        })
    }

    /// Open the database in `data_folder` and wire the engine over it
    ///
    /// Profiles are read from the same database; the clock is the system clock.
    pub async fn open(config: EngineConfig, data_folder: &Path) -> Result<Self> {
        let db_path = data_folder.join(DATABASE_FILE);
        let db = init_database(&db_path).await?;
        info!("Database: {}", db_path.display());

        let profiles: Arc<dyn ProfileStore> = Arc::new(SqliteProfileStore::new(db.clone()));
        Self::new(db, profiles, Arc::new(SystemTimeSource), config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn time(&self) -> &Arc<dyn TimeSource> {
        &self.time
    }

    /// Application event bus (for dispatchers and analytics)
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn profiles(&self) -> &Arc<dyn ProfileStore> {
        &self.profiles
    }

    pub fn queue(&self) -> &Arc<QueueBuilder> {
        &self.queue
    }

    pub fn lifecycle(&self) -> &Arc<ConnectionManager> {
        &self.lifecycle
    }

    pub fn channel(&self) -> &Arc<ConversationChannel> {
        &self.channel
    }

    pub fn notifications(&self) -> &NotificationFanout {
        &self.notifications
    }

    /// Block a connection and close its live conversation subscriptions
    pub async fn block(&self, connection_id: Uuid, actor_id: Uuid) -> Result<Connection> {
        let connection = self.lifecycle.block(connection_id, actor_id).await?;
        self.channel.close(connection.pair);
        Ok(connection)
    }

    /// Daily queues for every profile, then a lifecycle sweep
    pub async fn run_maintenance(&self) -> Result<(Vec<QueueBuildReport>, SweepReport)> {
        let reports = self.queue.build_all_queues().await?;
        let sweep = self.lifecycle.sweep().await?;
        Ok((reports, sweep))
    }
}
