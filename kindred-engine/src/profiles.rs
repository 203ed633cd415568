//! Profile Store boundary
//!
//! The engine only reads profiles. [`ProfileStore`] is the seam to whatever
//! service owns them; [`crate::db::profiles::SqliteProfileStore`] reads the
//! shared database and [`InMemoryProfileStore`] serves tests and simulations.

use crate::error::{Error, Result};
use async_trait::async_trait;
use kindred_common::models::Profile;
use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;
use uuid::Uuid;

/// One page of candidate profiles
#[derive(Debug, Clone, Default)]
pub struct ProfilePage {
    /// Profiles on this page, excluded ids already removed
    pub profiles: Vec<Profile>,
    /// Offset of the next page, `None` when the store is exhausted
    pub next_offset: Option<usize>,
}

/// Read-only access to user profiles
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Fetch one profile
    ///
    /// Fails with `NotFound` for unknown ids.
    async fn get_profile(&self, id: Uuid) -> Result<Profile>;

    /// List candidate profiles page by page
    ///
    /// Pages are cut before exclusion is applied, so a page may hold fewer
    /// than `limit` profiles while `next_offset` is still `Some`.
    async fn list_candidates(
        &self,
        excluding: &HashSet<Uuid>,
        offset: usize,
        limit: usize,
    ) -> Result<ProfilePage>;

    /// Every profile id known to the store
    async fn list_profile_ids(&self) -> Result<Vec<Uuid>>;
}

/// Walk every page of [`ProfileStore::list_candidates`]
pub async fn collect_candidates(
    store: &dyn ProfileStore,
    excluding: &HashSet<Uuid>,
    page_size: usize,
) -> Result<Vec<Profile>> {
    let page_size = page_size.max(1);
    let mut offset = 0;
    let mut candidates = Vec::new();

    loop {
        let page = store.list_candidates(excluding, offset, page_size).await?;
        candidates.extend(page.profiles);
        match page.next_offset {
            Some(next) if next > offset => offset = next,
            _ => break,
        }
    }

    Ok(candidates)
}

/// Profile store held in memory, ordered by id
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<BTreeMap<Uuid, Profile>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a profile
    pub fn upsert(&self, profile: Profile) {
        let mut profiles = self.profiles.write().unwrap_or_else(|e| e.into_inner());
        profiles.insert(profile.id, profile);
    }

    pub fn len(&self) -> usize {
        self.profiles.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<Profile> for InMemoryProfileStore {
    fn from_iter<I: IntoIterator<Item = Profile>>(iter: I) -> Self {
        let store = InMemoryProfileStore::new();
        for profile in iter {
            store.upsert(profile);
        }
        store
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get_profile(&self, id: Uuid) -> Result<Profile> {
        self.profiles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("profile {}", id)))
    }

    async fn list_candidates(
        &self,
        excluding: &HashSet<Uuid>,
        offset: usize,
        limit: usize,
    ) -> Result<ProfilePage> {
        let profiles = self.profiles.read().unwrap_or_else(|e| e.into_inner());
        let total = profiles.len();
        let page: Vec<Profile> = profiles
            .values()
            .skip(offset)
            .take(limit)
            .filter(|p| !excluding.contains(&p.id))
            .cloned()
            .collect();
        let end = offset.saturating_add(limit);

        Ok(ProfilePage {
            profiles: page,
            next_offset: (end < total).then_some(end),
        })
    }

    async fn list_profile_ids(&self) -> Result<Vec<Uuid>> {
        Ok(self
            .profiles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect())
    }
}
