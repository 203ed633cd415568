//! Engine harness
//!
//! An engine over a private in-memory database, an in-memory profile store
//! and a manual clock the test drives.

use chrono::{DateTime, TimeZone, Utc};
use kindred_common::db::init_memory_database;
use kindred_common::models::{Connection, Profile};
use kindred_common::{ManualTimeSource, TimeSource};
use kindred_engine::profiles::{InMemoryProfileStore, ProfileStore};
use kindred_engine::{Engine, EngineConfig};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// Fixed starting instant for every harness
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 9, 30, 0).unwrap()
}

/// Profile with the given interests and a passing authenticity score
pub fn profile(interests: &[&str]) -> Profile {
    Profile {
        id: Uuid::new_v4(),
        interests: interests.iter().map(|s| s.to_string()).collect(),
        values: BTreeSet::new(),
        authenticity_score: 80,
        created_at: start_time(),
    }
}

pub struct TestEngine {
    pub engine: Engine,
    pub clock: ManualTimeSource,
    pub profiles: Arc<InMemoryProfileStore>,
}

impl TestEngine {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let db = init_memory_database().await.unwrap();
        let clock = ManualTimeSource::new(start_time());
        let profiles = Arc::new(InMemoryProfileStore::new());

        let store: Arc<dyn ProfileStore> = profiles.clone();
        let time: Arc<dyn TimeSource> = Arc::new(clock.clone());
        let engine = Engine::new(db, store, time, config).unwrap();

        Self {
            engine,
            clock,
            profiles,
        }
    }

    /// Register a profile and return its id
    pub fn add_profile(&self, interests: &[&str]) -> Uuid {
        let profile = profile(interests);
        let id = profile.id;
        self.profiles.upsert(profile);
        id
    }

    /// Register a profile with an explicit authenticity score
    pub fn add_profile_with_authenticity(&self, interests: &[&str], authenticity_score: u8) -> Uuid {
        let mut profile = profile(interests);
        profile.authenticity_score = authenticity_score;
        let id = profile.id;
        self.profiles.upsert(profile);
        id
    }
}

/// Two fresh users with a connection between them
pub async fn connect_pair(harness: &TestEngine) -> (Uuid, Uuid, Connection) {
    let a = harness.add_profile(&["climbing"]);
    let b = harness.add_profile(&["climbing"]);
    let (connection, created) = harness
        .engine
        .lifecycle()
        .create_connection(a, b)
        .await
        .unwrap();
    assert!(created);
    (a, b, connection)
}
