//! SQLite-backed Profile Store
//!
//! Reads `profiles` and `profile_tags`. The engine never writes these tables;
//! they belong to the profile service sharing the database.

use crate::error::{Error, Result};
use crate::profiles::{ProfilePage, ProfileStore};
use async_trait::async_trait;
use kindred_common::models::Profile;
use kindred_common::{time, uuid_utils};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use uuid::Uuid;

/// Profile store reading the shared database
#[derive(Clone)]
pub struct SqliteProfileStore {
    db: SqlitePool,
}

impl SqliteProfileStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

/// Profile row before tags are attached
struct ProfileRow {
    id: Uuid,
    authenticity_score: u8,
    created_at: i64,
}

impl ProfileRow {
    fn into_profile(self, tags: Option<(BTreeSet<String>, BTreeSet<String>)>) -> Result<Profile> {
        let (interests, values) = tags.unwrap_or_default();
        Ok(Profile {
            id: self.id,
            interests,
            values,
            authenticity_score: self.authenticity_score,
            created_at: time::from_micros(self.created_at)?,
        })
    }
}

fn decode_profile_row(row: &sqlx::sqlite::SqliteRow) -> Result<ProfileRow> {
    let score: i64 = row.get("authenticity_score");
    Ok(ProfileRow {
        id: uuid_utils::parse_column("profiles.id", &row.get::<String, _>("id"))?,
        authenticity_score: score.clamp(0, 100) as u8,
        created_at: row.get("created_at"),
    })
}

type TagSets = BTreeMap<Uuid, (BTreeSet<String>, BTreeSet<String>)>;

fn collect_tags(rows: &[sqlx::sqlite::SqliteRow]) -> Result<TagSets> {
    let mut tags = TagSets::new();
    for row in rows {
        let profile_id = uuid_utils::parse_column("profile_tags.profile_id", &row.get::<String, _>("profile_id"))?;
        let category: String = row.get("category");
        let tag: String = row.get("tag");
        let entry = tags.entry(profile_id).or_default();
        match category.as_str() {
            "interest" => entry.0.insert(tag),
            "value" => entry.1.insert(tag),
            other => {
                return Err(Error::InvalidInput(format!("Unknown tag category: {}", other)));
            }
        };
    }
    Ok(tags)
}

#[async_trait]
impl ProfileStore for SqliteProfileStore {
    async fn get_profile(&self, id: Uuid) -> Result<Profile> {
        let row = sqlx::query("SELECT id, authenticity_score, created_at FROM profiles WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| Error::NotFound(format!("profile {}", id)))?;
        let profile = decode_profile_row(&row)?;

        let tag_rows = sqlx::query("SELECT profile_id, category, tag FROM profile_tags WHERE profile_id = ?")
            .bind(id.to_string())
            .fetch_all(&self.db)
            .await?;
        let mut tags = collect_tags(&tag_rows)?;

        profile.into_profile(tags.remove(&id))
    }

    async fn list_candidates(
        &self,
        excluding: &HashSet<Uuid>,
        offset: usize,
        limit: usize,
    ) -> Result<ProfilePage> {
        let rows = sqlx::query(
            "SELECT id, authenticity_score, created_at FROM profiles ORDER BY id LIMIT ? OFFSET ?",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.db)
        .await?;

        let fetched = rows.len();
        let tag_rows = sqlx::query(
            r#"
            SELECT t.profile_id, t.category, t.tag
            FROM profile_tags t
            WHERE t.profile_id IN (SELECT id FROM profiles ORDER BY id LIMIT ? OFFSET ?)
            "#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.db)
        .await?;
        let mut tags = collect_tags(&tag_rows)?;

        let mut profiles = Vec::with_capacity(fetched);
        for row in &rows {
            let profile_row = decode_profile_row(row)?;
            if excluding.contains(&profile_row.id) {
                continue;
            }
            let id = profile_row.id;
            profiles.push(profile_row.into_profile(tags.remove(&id))?);
        }

        Ok(ProfilePage {
            profiles,
            next_offset: (fetched == limit && limit > 0).then_some(offset + fetched),
        })
    }

    async fn list_profile_ids(&self) -> Result<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM profiles ORDER BY id")
            .fetch_all(&self.db)
            .await?;
        ids.iter()
            .map(|id| uuid_utils::parse_column("profiles.id", id).map_err(Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::collect_candidates;
    use kindred_common::db::init_memory_database;

    async fn seed(db: &SqlitePool, interests: &[&str], values: &[&str], score: i64) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO profiles (id, authenticity_score, created_at) VALUES (?, ?, ?)")
            .bind(id.to_string())
            .bind(score)
            .bind(1_700_000_000_000_000i64)
            .execute(db)
            .await
            .unwrap();
        for (category, tags) in [("interest", interests), ("value", values)] {
            for tag in tags {
                sqlx::query("INSERT INTO profile_tags (profile_id, category, tag) VALUES (?, ?, ?)")
                    .bind(id.to_string())
                    .bind(category)
                    .bind(*tag)
                    .execute(db)
                    .await
                    .unwrap();
            }
        }
        id
    }

    #[tokio::test]
    async fn test_get_profile_with_tags() {
        let db = init_memory_database().await.unwrap();
        let id = seed(&db, &["climbing", "jazz"], &["honesty"], 88).await;
        let store = SqliteProfileStore::new(db);

        let profile = store.get_profile(id).await.unwrap();

        assert_eq!(profile.id, id);
        assert_eq!(profile.authenticity_score, 88);
        assert!(profile.interests.contains("climbing"));
        assert!(profile.interests.contains("jazz"));
        assert!(profile.values.contains("honesty"));
    }

    #[tokio::test]
    async fn test_get_unknown_profile() {
        let db = init_memory_database().await.unwrap();
        let store = SqliteProfileStore::new(db);
        assert!(matches!(
            store.get_profile(Uuid::new_v4()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_paged_listing_honors_exclusions() {
        let db = init_memory_database().await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(seed(&db, &["tea"], &[], 50).await);
        }
        let store = SqliteProfileStore::new(db);
        let excluding: HashSet<Uuid> = [ids[0], ids[4]].into_iter().collect();

        let all = collect_candidates(&store, &excluding, 2).await.unwrap();

        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|p| p.interests.contains("tea")));
        assert_eq!(store.list_profile_ids().await.unwrap().len(), 5);
    }
}
