//! # SQLite Memory Store
//!
//! SQLite-based implementation of the [`MemoryStore`] trait.
//!
//! Persistent, single-file storage suited to embedded devices: no external
//! database, predictable footprint, and all multi-step writes wrapped in one
//! transaction per call.
//!
//! ## Database Schema
//!
//! ```sql
//! CREATE TABLE profiles (
//!     user_id TEXT PRIMARY KEY,
//!     name TEXT,
//!     age INTEGER,
//!     gender TEXT,
//!     tags TEXT NOT NULL,
//!     created_at TEXT NOT NULL,
//!     updated_at TEXT NOT NULL
//! );
//!
//! CREATE TABLE sessions (
//!     id TEXT PRIMARY KEY,
//!     user_id TEXT NOT NULL,
//!     started_at TEXT NOT NULL,
//!     ended_at TEXT
//! );
//!
//! CREATE TABLE messages (
//!     session_id TEXT NOT NULL,
//!     seq INTEGER NOT NULL,
//!     role TEXT NOT NULL,
//!     text TEXT NOT NULL,
//!     created_at TEXT NOT NULL,
//!     PRIMARY KEY (session_id, seq)
//! );
//!
//! CREATE TABLE episodes (
//!     id TEXT PRIMARY KEY,
//!     user_id TEXT NOT NULL,
//!     summary TEXT NOT NULL,
//!     keywords TEXT NOT NULL,
//!     emotion TEXT NOT NULL,
//!     importance REAL NOT NULL,
//!     access_count INTEGER NOT NULL,
//!     created_at TEXT NOT NULL,
//!     last_accessed_at TEXT NOT NULL,
//!     source_session_id TEXT NOT NULL,
//!     embedding BLOB
//! );
//!
//! CREATE TABLE facts (
//!     id TEXT PRIMARY KEY,
//!     user_id TEXT NOT NULL,
//!     subject TEXT NOT NULL,
//!     predicate TEXT NOT NULL,
//!     object TEXT NOT NULL,
//!     confidence REAL NOT NULL,
//!     created_at TEXT NOT NULL,
//!     last_seen_at TEXT NOT NULL,
//!     UNIQUE (user_id, subject, predicate, object)
//! );
//! ```
//!
//! Timestamps are RFC 3339 TEXT (lexicographic order equals time order),
//! keyword/tag lists are JSON arrays, embeddings are little-endian f32 BLOBs.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use memory_core::{
    Emotion, Episode, EpisodeFilter, EpisodeOrder, Fact, MemoryError, MemoryStore, Message, Result,
    SessionInfo, UserProfile,
};

/// Current schema version; migrations are forward-only.
const SCHEMA_VERSION: i64 = 1;

fn storage_err(e: impl std::fmt::Display) -> MemoryError {
    MemoryError::Storage(e.to_string())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(storage_err)
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::from_str(s).map_err(storage_err)
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// SQLite-backed memory store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database file and runs migrations.
    pub async fn new(database_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .create_if_missing(true)
            .filename(database_path);

        let pool = SqlitePool::connect_with(options).await.map_err(storage_err)?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Applies forward-only migrations up to [`SCHEMA_VERSION`].
    async fn migrate(&self) -> Result<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        let current: Option<(i64,)> = sqlx::query_as("SELECT version FROM schema_version")
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        let current = match current {
            Some((v,)) => v,
            None => {
                sqlx::query("INSERT INTO schema_version (version) VALUES (0)")
                    .execute(&self.pool)
                    .await
                    .map_err(storage_err)?;
                0
            }
        };

        if current > SCHEMA_VERSION {
            return Err(MemoryError::Storage(format!(
                "database schema version {current} is newer than supported {SCHEMA_VERSION}"
            )));
        }

        if current < 1 {
            self.init_schema_v1().await?;
            sqlx::query("UPDATE schema_version SET version = 1")
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
            info!(version = 1, "applied schema migration");
        }

        Ok(())
    }

    async fn init_schema_v1(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS profiles (
                user_id TEXT PRIMARY KEY,
                name TEXT,
                age INTEGER,
                gender TEXT,
                tags TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

            CREATE TABLE IF NOT EXISTS messages (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            );

            CREATE TABLE IF NOT EXISTS episodes (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                summary TEXT NOT NULL,
                keywords TEXT NOT NULL,
                emotion TEXT NOT NULL,
                importance REAL NOT NULL,
                access_count INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                last_accessed_at TEXT NOT NULL,
                source_session_id TEXT NOT NULL,
                embedding BLOB
            );
            CREATE INDEX IF NOT EXISTS idx_episodes_user ON episodes(user_id);
            CREATE INDEX IF NOT EXISTS idx_episodes_importance ON episodes(importance);

            CREATE TABLE IF NOT EXISTS facts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                predicate TEXT NOT NULL,
                object TEXT NOT NULL,
                confidence REAL NOT NULL,
                created_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                UNIQUE (user_id, subject, predicate, object)
            );
            CREATE INDEX IF NOT EXISTS idx_facts_user ON facts(user_id);
            CREATE INDEX IF NOT EXISTS idx_facts_subject ON facts(subject);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    fn row_to_profile(row: &sqlx::sqlite::SqliteRow) -> Result<UserProfile> {
        let tags_json: String = row.try_get("tags").map_err(storage_err)?;
        let created_at: String = row.try_get("created_at").map_err(storage_err)?;
        let updated_at: String = row.try_get("updated_at").map_err(storage_err)?;
        Ok(UserProfile {
            user_id: row.try_get("user_id").map_err(storage_err)?,
            name: row.try_get("name").map_err(storage_err)?,
            age: row
                .try_get::<Option<i64>, _>("age")
                .map_err(storage_err)?
                .map(|a| a as u32),
            gender: row.try_get("gender").map_err(storage_err)?,
            tags: serde_json::from_str(&tags_json).map_err(storage_err)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    }

    fn row_to_episode(row: &sqlx::sqlite::SqliteRow) -> Result<Episode> {
        let id: String = row.try_get("id").map_err(storage_err)?;
        let keywords_json: String = row.try_get("keywords").map_err(storage_err)?;
        let emotion: String = row.try_get("emotion").map_err(storage_err)?;
        let created_at: String = row.try_get("created_at").map_err(storage_err)?;
        let last_accessed_at: String = row.try_get("last_accessed_at").map_err(storage_err)?;
        let source_session_id: String = row.try_get("source_session_id").map_err(storage_err)?;
        let embedding: Option<Vec<u8>> = row.try_get("embedding").map_err(storage_err)?;
        Ok(Episode {
            id: parse_uuid(&id)?,
            user_id: row.try_get("user_id").map_err(storage_err)?,
            summary: row.try_get("summary").map_err(storage_err)?,
            keywords: serde_json::from_str(&keywords_json).map_err(storage_err)?,
            emotion: Emotion::from_label(&emotion),
            importance: row.try_get::<f64, _>("importance").map_err(storage_err)? as f32,
            access_count: row.try_get::<i64, _>("access_count").map_err(storage_err)? as u32,
            created_at: parse_ts(&created_at)?,
            last_accessed_at: parse_ts(&last_accessed_at)?,
            source_session_id: parse_uuid(&source_session_id)?,
            embedding: embedding.map(|b| decode_embedding(&b)),
        })
    }

    fn row_to_fact(row: &sqlx::sqlite::SqliteRow) -> Result<Fact> {
        let id: String = row.try_get("id").map_err(storage_err)?;
        let created_at: String = row.try_get("created_at").map_err(storage_err)?;
        let last_seen_at: String = row.try_get("last_seen_at").map_err(storage_err)?;
        Ok(Fact {
            id: parse_uuid(&id)?,
            user_id: row.try_get("user_id").map_err(storage_err)?,
            subject: row.try_get("subject").map_err(storage_err)?,
            predicate: row.try_get("predicate").map_err(storage_err)?,
            object: row.try_get("object").map_err(storage_err)?,
            confidence: row.try_get::<f64, _>("confidence").map_err(storage_err)? as f32,
            created_at: parse_ts(&created_at)?,
            last_seen_at: parse_ts(&last_seen_at)?,
        })
    }

    async fn upsert_profile_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        profile: &UserProfile,
    ) -> Result<()> {
        let tags = serde_json::to_string(&profile.tags).map_err(storage_err)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO profiles (user_id, name, age, gender, tags, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&profile.user_id)
        .bind(&profile.name)
        .bind(profile.age.map(|a| a as i64))
        .bind(&profile.gender)
        .bind(tags)
        .bind(profile.created_at.to_rfc3339())
        .bind(profile.updated_at.to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn insert_episode_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        episode: &Episode,
    ) -> Result<()> {
        let keywords = serde_json::to_string(&episode.keywords).map_err(storage_err)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO episodes (
                id, user_id, summary, keywords, emotion, importance, access_count,
                created_at, last_accessed_at, source_session_id, embedding
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(episode.id.to_string())
        .bind(&episode.user_id)
        .bind(&episode.summary)
        .bind(keywords)
        .bind(episode.emotion.as_str())
        .bind(episode.importance as f64)
        .bind(episode.access_count as i64)
        .bind(episode.created_at.to_rfc3339())
        .bind(episode.last_accessed_at.to_rfc3339())
        .bind(episode.source_session_id.to_string())
        .bind(episode.embedding.as_deref().map(encode_embedding))
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    /// Coalescing fact upsert: an existing `(user, subject, predicate, object)`
    /// row keeps the maximum confidence and gets `last_seen_at` refreshed.
    async fn upsert_fact_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        fact: &Fact,
    ) -> Result<()> {
        let existing: Option<(String, f64)> = sqlx::query_as(
            r#"
            SELECT id, confidence FROM facts
            WHERE user_id = ? AND subject = ? AND predicate = ? AND object = ?
            "#,
        )
        .bind(&fact.user_id)
        .bind(&fact.subject)
        .bind(&fact.predicate)
        .bind(&fact.object)
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage_err)?;

        match existing {
            Some((id, confidence)) => {
                let merged = confidence.max(fact.confidence as f64);
                sqlx::query("UPDATE facts SET confidence = ?, last_seen_at = ? WHERE id = ?")
                    .bind(merged)
                    .bind(fact.last_seen_at.to_rfc3339())
                    .bind(id)
                    .execute(&mut **tx)
                    .await
                    .map_err(storage_err)?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO facts (id, user_id, subject, predicate, object, confidence, created_at, last_seen_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(fact.id.to_string())
                .bind(&fact.user_id)
                .bind(&fact.subject)
                .bind(&fact.predicate)
                .bind(&fact.object)
                .bind(fact.confidence as f64)
                .bind(fact.created_at.to_rfc3339())
                .bind(fact.last_seen_at.to_rfc3339())
                .execute(&mut **tx)
                .await
                .map_err(storage_err)?;
            }
        }
        Ok(())
    }

    /// Deletes the lowest-value rows above the per-user cap. Episodes drop by
    /// lowest importance (oldest access as tie-break), facts by lowest
    /// confidence (oldest sighting as tie-break).
    async fn trim_to_caps_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: &str,
        max_episodes: usize,
        max_facts: usize,
    ) -> Result<()> {
        let (episode_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM episodes WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&mut **tx)
                .await
                .map_err(storage_err)?;
        let excess = episode_count - max_episodes as i64;
        if excess > 0 {
            sqlx::query(
                r#"
                DELETE FROM episodes WHERE id IN (
                    SELECT id FROM episodes WHERE user_id = ?
                    ORDER BY importance ASC, last_accessed_at ASC LIMIT ?
                )
                "#,
            )
            .bind(user_id)
            .bind(excess)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        }

        let (fact_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM facts WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(storage_err)?;
        let excess = fact_count - max_facts as i64;
        if excess > 0 {
            sqlx::query(
                r#"
                DELETE FROM facts WHERE id IN (
                    SELECT id FROM facts WHERE user_id = ?
                    ORDER BY confidence ASC, last_seen_at ASC LIMIT ?
                )
                "#,
            )
            .bind(user_id)
            .bind(excess)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        }

        Ok(())
    }

    /// Binds the per-user caps used by the commit transaction, producing the
    /// store handle the rest of the system works against.
    pub fn with_caps(self, max_episodes: usize, max_facts: usize) -> CappedSqliteStore {
        CappedSqliteStore {
            inner: self,
            max_episodes,
            max_facts,
        }
    }
}

/// [`SqliteStore`] bound to the configured per-user caps, so the commit
/// transaction can trim without reaching back into the config record.
#[derive(Clone)]
pub struct CappedSqliteStore {
    inner: SqliteStore,
    max_episodes: usize,
    max_facts: usize,
}

impl CappedSqliteStore {
    /// Opens the store and binds the caps in one step.
    pub async fn open(database_path: &str, max_episodes: usize, max_facts: usize) -> Result<Self> {
        Ok(SqliteStore::new(database_path)
            .await?
            .with_caps(max_episodes, max_facts))
    }
}

#[async_trait]
impl MemoryStore for CappedSqliteStore {
    async fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        let mut tx = self.inner.pool.begin().await.map_err(storage_err)?;
        SqliteStore::upsert_profile_tx(&mut tx, profile).await?;
        tx.commit().await.map_err(storage_err)
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let row = sqlx::query("SELECT * FROM profiles WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.inner.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(SqliteStore::row_to_profile).transpose()
    }

    async fn insert_episode(&self, episode: &Episode) -> Result<()> {
        let mut tx = self.inner.pool.begin().await.map_err(storage_err)?;
        SqliteStore::insert_episode_tx(&mut tx, episode).await?;
        tx.commit().await.map_err(storage_err)
    }

    async fn list_episodes(&self, user_id: &str, filter: &EpisodeFilter) -> Result<Vec<Episode>> {
        let mut sql = String::from("SELECT * FROM episodes WHERE user_id = ?");
        let mut params: Vec<String> = vec![user_id.to_string()];

        if let Some(since) = filter.since {
            sql.push_str(" AND created_at >= ?");
            params.push(since.to_rfc3339());
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND created_at <= ?");
            params.push(until.to_rfc3339());
        }
        if !filter.keywords_any.is_empty() {
            let conditions: Vec<&str> = filter
                .keywords_any
                .iter()
                .map(|_| "(summary LIKE ? OR keywords LIKE ?)")
                .collect();
            sql.push_str(&format!(" AND ({})", conditions.join(" OR ")));
            for kw in &filter.keywords_any {
                params.push(format!("%{kw}%"));
                params.push(format!("%{kw}%"));
            }
        }

        sql.push_str(match filter.order {
            EpisodeOrder::ByImportanceDesc => " ORDER BY importance DESC, last_accessed_at DESC",
            EpisodeOrder::ByRecentDesc => " ORDER BY last_accessed_at DESC",
        });
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut query = sqlx::query(&sql);
        for param in &params {
            query = query.bind(param);
        }
        let rows = query.fetch_all(&self.inner.pool).await.map_err(storage_err)?;

        rows.iter().map(SqliteStore::row_to_episode).collect()
    }

    async fn touch_episodes(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.inner.pool.begin().await.map_err(storage_err)?;
        for id in ids {
            sqlx::query(
                "UPDATE episodes SET access_count = access_count + 1, last_accessed_at = ? WHERE id = ?",
            )
            .bind(now.to_rfc3339())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)
    }

    async fn delete_episodes(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.inner.pool.begin().await.map_err(storage_err)?;
        let mut removed = 0;
        for id in ids {
            let result = sqlx::query("DELETE FROM episodes WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            removed += result.rows_affected();
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(removed)
    }

    async fn count_episodes(&self, user_id: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM episodes WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.inner.pool)
            .await
            .map_err(storage_err)?;
        Ok(count as u64)
    }

    async fn upsert_fact(&self, fact: &Fact) -> Result<()> {
        let mut tx = self.inner.pool.begin().await.map_err(storage_err)?;
        SqliteStore::upsert_fact_tx(&mut tx, fact).await?;
        tx.commit().await.map_err(storage_err)
    }

    async fn list_facts(&self, user_id: &str, subject: Option<&str>) -> Result<Vec<Fact>> {
        let rows = match subject {
            Some(subject) => {
                sqlx::query(
                    "SELECT * FROM facts WHERE user_id = ? AND subject = ? ORDER BY confidence DESC, last_seen_at DESC",
                )
                .bind(user_id)
                .bind(subject)
                .fetch_all(&self.inner.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM facts WHERE user_id = ? ORDER BY confidence DESC, last_seen_at DESC",
                )
                .bind(user_id)
                .fetch_all(&self.inner.pool)
                .await
            }
        }
        .map_err(storage_err)?;

        rows.iter().map(SqliteStore::row_to_fact).collect()
    }

    async fn delete_facts_below(&self, user_id: &str, confidence: f32) -> Result<u64> {
        let result = sqlx::query("DELETE FROM facts WHERE user_id = ? AND confidence < ?")
            .bind(user_id)
            .bind(confidence as f64)
            .execute(&self.inner.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_facts(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.inner.pool.begin().await.map_err(storage_err)?;
        let mut removed = 0;
        for id in ids {
            let result = sqlx::query("DELETE FROM facts WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            removed += result.rows_affected();
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(removed)
    }

    async fn count_facts(&self, user_id: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM facts WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.inner.pool)
            .await
            .map_err(storage_err)?;
        Ok(count as u64)
    }

    async fn record_session_start(&self, session: &SessionInfo) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO sessions (id, user_id, started_at, ended_at) VALUES (?, ?, ?, ?)")
            .bind(session.id.to_string())
            .bind(&session.user_id)
            .bind(session.started_at.to_rfc3339())
            .bind(session.ended_at.map(|t| t.to_rfc3339()))
            .execute(&self.inner.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn record_session_end(&self, session_id: Uuid, ended_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sessions SET ended_at = ? WHERE id = ?")
            .bind(ended_at.to_rfc3339())
            .bind(session_id.to_string())
            .execute(&self.inner.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn persist_message(&self, session_id: Uuid, message: &Message) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO messages (session_id, seq, role, text, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id.to_string())
        .bind(message.seq as i64)
        .bind(message.role.as_str())
        .bind(&message.text)
        .bind(message.timestamp.to_rfc3339())
        .execute(&self.inner.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn commit_extraction(
        &self,
        user_id: &str,
        episode: &Episode,
        facts: &[Fact],
        profile: &UserProfile,
    ) -> Result<()> {
        let mut tx = self.inner.pool.begin().await.map_err(storage_err)?;

        SqliteStore::upsert_profile_tx(&mut tx, profile).await?;
        SqliteStore::insert_episode_tx(&mut tx, episode).await?;
        for fact in facts {
            SqliteStore::upsert_fact_tx(&mut tx, fact).await?;
        }
        SqliteStore::trim_to_caps_tx(&mut tx, user_id, self.max_episodes, self.max_facts).await?;

        tx.commit().await.map_err(storage_err)?;

        info!(
            user_id = user_id,
            episode_id = %episode.id,
            fact_count = facts.len(),
            "committed session extraction"
        );
        Ok(())
    }

    async fn list_user_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id FROM profiles
            UNION SELECT user_id FROM episodes
            UNION SELECT user_id FROM facts
            "#,
        )
        .fetch_all(&self.inner.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("user_id").map_err(storage_err))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_store() -> CappedSqliteStore {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let path = db_path.to_str().unwrap().to_string();

        let store = CappedSqliteStore::open(&path, 3, 3).await.unwrap();

        std::mem::forget(temp_dir);

        store
    }

    fn episode(user_id: &str, summary: &str, importance: f32) -> Episode {
        let now = Utc::now();
        Episode {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            summary: summary.to_string(),
            keywords: vec![summary.to_string()],
            emotion: Emotion::Neutral,
            importance,
            access_count: 0,
            created_at: now,
            last_accessed_at: now,
            source_session_id: Uuid::new_v4(),
            embedding: None,
        }
    }

    fn fact(user_id: &str, subject: &str, predicate: &str, object: &str, confidence: f32) -> Fact {
        let now = Utc::now();
        Fact {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            subject: subject.to_string(),
            predicate: predicate.to_string(),
            object: object.to_string(),
            confidence,
            created_at: now,
            last_seen_at: now,
        }
    }

    #[tokio::test]
    async fn profile_roundtrip() {
        let store = create_test_store().await;
        let mut profile = UserProfile::new("u1", Utc::now());
        profile.name = Some("小明".into());
        profile.age = Some(5);
        profile.tags = vec!["喜欢恐龙".into()];

        store.upsert_profile(&profile).await.unwrap();
        let loaded = store.get_profile("u1").await.unwrap().unwrap();
        assert_eq!(loaded.name.as_deref(), Some("小明"));
        assert_eq!(loaded.age, Some(5));
        assert_eq!(loaded.tags, vec!["喜欢恐龙".to_string()]);

        assert!(store.get_profile("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn episode_insert_and_keyword_filter() {
        let store = create_test_store().await;
        store.insert_episode(&episode("u1", "关于恐龙的对话", 0.7)).await.unwrap();
        store.insert_episode(&episode("u1", "关于动物园的对话", 0.5)).await.unwrap();

        let filter = EpisodeFilter {
            keywords_any: vec!["恐龙".into()],
            ..Default::default()
        };
        let found = store.list_episodes("u1", &filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].summary.contains("恐龙"));

        let all = store.list_episodes("u1", &EpisodeFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].importance >= all[1].importance);
    }

    #[tokio::test]
    async fn touch_bumps_access_count() {
        let store = create_test_store().await;
        let ep = episode("u1", "恐龙", 0.6);
        store.insert_episode(&ep).await.unwrap();

        let later = Utc::now();
        store.touch_episodes(&[ep.id], later).await.unwrap();

        let found = store.list_episodes("u1", &EpisodeFilter::default()).await.unwrap();
        assert_eq!(found[0].access_count, 1);
        assert!(found[0].last_accessed_at >= found[0].created_at);
    }

    #[tokio::test]
    async fn fact_coalesces_to_max_confidence() {
        let store = create_test_store().await;
        store.upsert_fact(&fact("u1", "小明", "喜欢", "恐龙", 0.7)).await.unwrap();
        store.upsert_fact(&fact("u1", "小明", "喜欢", "恐龙", 0.9)).await.unwrap();
        // Lower confidence must not regress the stored value.
        store.upsert_fact(&fact("u1", "小明", "喜欢", "恐龙", 0.4)).await.unwrap();

        let facts = store.list_facts("u1", None).await.unwrap();
        assert_eq!(facts.len(), 1);
        assert!((facts[0].confidence - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn commit_extraction_trims_to_caps() {
        let store = create_test_store().await;
        for importance in [0.1, 0.9, 0.5] {
            store.insert_episode(&episode("u1", "s", importance)).await.unwrap();
        }

        let profile = UserProfile::new("u1", Utc::now());
        let ep = episode("u1", "newest", 0.8);
        store.commit_extraction("u1", &ep, &[], &profile).await.unwrap();

        let survivors = store.list_episodes("u1", &EpisodeFilter::default()).await.unwrap();
        assert_eq!(survivors.len(), 3);
        let mut importances: Vec<f32> = survivors.iter().map(|e| e.importance).collect();
        importances.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(importances, vec![0.5, 0.8, 0.9]);
    }

    #[tokio::test]
    async fn delete_facts_below_threshold() {
        let store = create_test_store().await;
        store.upsert_fact(&fact("u1", "a", "p", "x", 0.05)).await.unwrap();
        store.upsert_fact(&fact("u1", "b", "p", "y", 0.8)).await.unwrap();

        let removed = store.delete_facts_below("u1", 0.1).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count_facts("u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sessions_and_user_listing() {
        let store = create_test_store().await;
        let session = SessionInfo {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            started_at: Utc::now(),
            ended_at: None,
        };
        store.record_session_start(&session).await.unwrap();
        store.record_session_end(session.id, Utc::now()).await.unwrap();

        store.upsert_fact(&fact("u2", "a", "p", "x", 0.5)).await.unwrap();
        let users = store.list_user_ids().await.unwrap();
        assert_eq!(users, vec!["u2".to_string()]);
    }
}
