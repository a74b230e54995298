//! Content-keyed memory store.
//!
//! Records live in the shared SQLite database with a read-through
//! in-memory cache. Cache and store are updated inside the same critical
//! section, so a reader never observes one without the other. Writes are
//! serialized; reads are served from the cache.
//!
//! Fact records (`is_fact = true`) are protected from deletion and update
//! through the pipeline-facing paths; callers with administrative intent
//! pass `force = true`.

mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::{debug, warn};

use crate::db::Database;
use crate::error::{AgentError, Result};

pub use types::{
    KeyGenerator, MemoryCategory, MemoryKeys, MemoryRecord, RemoveOutcome, SaveAction, SaveOutcome,
    UpdateOutcome, derive_key_from_content, normalize_key,
};

struct Inner {
    db: Arc<Database>,
    cache: Mutex<HashMap<String, MemoryRecord>>,
}

/// Handle to the process-wide memory store. Cheap to clone.
///
/// The key-generator capability is bound per handle: each call session
/// binds its llm keying helper to its own handle over the shared records.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
    keygen: Option<Arc<dyn KeyGenerator>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("db", &self.inner.db.path())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Open the store over an existing database, priming the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial record scan fails.
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let records = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, content, category, is_fact, created_at, updated_at, \
                     last_accessed FROM memories",
                )?;
                let rows = stmt.query_map([], row_to_record)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(memory_err)?;

        let cache: HashMap<String, MemoryRecord> =
            records.into_iter().map(|r| (r.key.clone(), r)).collect();
        debug!(records = cache.len(), "memory cache primed");

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                cache: Mutex::new(cache),
            }),
            keygen: None,
        })
    }

    /// Bind a key-generator capability to this handle.
    ///
    /// The generator (in practice the LLM adapter's keying helper) is asked
    /// to suggest keys when `save` is called without one; failures fall
    /// back to deterministic derivation. Records stay shared with every
    /// other handle over the same store.
    #[must_use]
    pub fn with_key_generator(&self, keygen: Arc<dyn KeyGenerator>) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            keygen: Some(keygen),
        }
    }

    /// Save a record, deriving a key when none is given.
    ///
    /// Existing records are overwritten; their `is_fact` flag is preserved
    /// (the flag only changes through an admin path, never through saves).
    ///
    /// # Errors
    ///
    /// Returns an error when the durable write fails; the cache is left
    /// untouched in that case.
    pub async fn save(
        &self,
        key: Option<&str>,
        content: &str,
        category: MemoryCategory,
        is_fact: bool,
    ) -> Result<SaveOutcome> {
        let key = match key {
            Some(raw) => {
                let normalized = normalize_key(raw);
                if normalized.is_empty() {
                    derive_key_from_content(content)
                } else {
                    normalized
                }
            }
            None => self.derive_key(content).await,
        };

        let now = Utc::now();
        let mut cache = self.lock_cache()?;

        let existing = cache.get(&key).cloned();
        let action = if existing.is_some() {
            SaveAction::Updated
        } else {
            SaveAction::Created
        };
        let record = match existing {
            Some(prev) => MemoryRecord {
                content: content.to_owned(),
                category,
                updated_at: now,
                ..prev
            },
            None => MemoryRecord {
                key: key.clone(),
                content: content.to_owned(),
                category,
                is_fact,
                created_at: now,
                updated_at: now,
                last_accessed: None,
            },
        };

        self.inner
            .db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO memories (key, content, category, is_fact, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(key) DO UPDATE SET \
                       content = excluded.content, \
                       category = excluded.category, \
                       updated_at = excluded.updated_at",
                    params![
                        record.key,
                        record.content,
                        record.category.as_str(),
                        record.is_fact as i64,
                        record.created_at.to_rfc3339(),
                        record.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .map_err(memory_err)?;

        cache.insert(key.clone(), record);
        Ok(SaveOutcome { key, action })
    }

    /// Fetch a record by key.
    ///
    /// Touches `last_accessed` as a detached side effect so the read path
    /// never waits on the database.
    ///
    /// # Errors
    ///
    /// Returns an error only when the cache lock is poisoned.
    pub fn get(&self, key: &str) -> Result<Option<MemoryRecord>> {
        let key = normalize_key(key);
        let record = self.lock_cache()?.get(&key).cloned();

        if record.is_some() {
            let store = self.clone();
            let key = key.clone();
            tokio::spawn(async move {
                store.touch_last_accessed(&key);
            });
        }

        Ok(record)
    }

    /// Substring search over keys.
    ///
    /// # Errors
    ///
    /// Returns an error only when the cache lock is poisoned.
    pub fn search(&self, query: &str) -> Result<Vec<MemoryRecord>> {
        let needle = normalize_key(query);
        let cache = self.lock_cache()?;
        let mut hits: Vec<MemoryRecord> = cache
            .values()
            .filter(|r| needle.is_empty() || r.key.contains(&needle))
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(hits)
    }

    /// Delete a record.
    ///
    /// Facts refuse deletion unless `force` is set (admin path).
    ///
    /// # Errors
    ///
    /// Returns an error when the durable delete fails.
    pub fn remove(&self, key: &str, force: bool) -> Result<RemoveOutcome> {
        let key = normalize_key(key);
        let mut cache = self.lock_cache()?;

        let Some(record) = cache.get(&key) else {
            return Ok(RemoveOutcome::NotFound);
        };
        if record.is_fact && !force {
            return Ok(RemoveOutcome::Protected);
        }

        self.inner
            .db
            .with_conn(|conn| {
                conn.execute("DELETE FROM memories WHERE key = ?1", params![key])?;
                Ok(())
            })
            .map_err(memory_err)?;

        cache.remove(&key);
        Ok(RemoveOutcome::Removed)
    }

    /// Rewrite a record's content (and optionally its category).
    ///
    /// Facts refuse updates unless `force` is set (admin path). The
    /// `is_fact` flag itself is never changed here.
    ///
    /// # Errors
    ///
    /// Returns an error when the durable write fails.
    pub fn update(
        &self,
        key: &str,
        content: &str,
        category: Option<MemoryCategory>,
        force: bool,
    ) -> Result<UpdateOutcome> {
        let key = normalize_key(key);
        let mut cache = self.lock_cache()?;

        let Some(existing) = cache.get(&key).cloned() else {
            return Ok(UpdateOutcome::NotFound);
        };
        if existing.is_fact && !force {
            return Ok(UpdateOutcome::Protected);
        }

        let record = MemoryRecord {
            content: content.to_owned(),
            category: category.unwrap_or(existing.category),
            updated_at: Utc::now(),
            ..existing
        };

        self.inner
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE memories SET content = ?2, category = ?3, updated_at = ?4 \
                     WHERE key = ?1",
                    params![
                        record.key,
                        record.content,
                        record.category.as_str(),
                        record.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .map_err(memory_err)?;

        cache.insert(key, record);
        Ok(UpdateOutcome::Updated)
    }

    /// Keys grouped into facts and ordinary memories, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error only when the cache lock is poisoned.
    pub fn list_keys(&self) -> Result<MemoryKeys> {
        let cache = self.lock_cache()?;
        let mut keys = MemoryKeys::default();
        for record in cache.values() {
            if record.is_fact {
                keys.facts.push(record.key.clone());
            } else {
                keys.memories.push(record.key.clone());
            }
        }
        keys.facts.sort();
        keys.memories.sort();
        Ok(keys)
    }

    async fn derive_key(&self, content: &str) -> String {
        if let Some(keygen) = &self.keygen
            && let Some(suggested) = keygen.suggest_key(content).await
        {
            let normalized = normalize_key(&suggested);
            if !normalized.is_empty() {
                return normalized;
            }
        }
        derive_key_from_content(content)
    }

    fn touch_last_accessed(&self, key: &str) {
        let now = Utc::now();
        let Ok(mut cache) = self.inner.cache.lock() else {
            return;
        };
        let Some(record) = cache.get_mut(key) else {
            return;
        };
        record.last_accessed = Some(now);
        let result = self.inner.db.with_conn(|conn| {
            conn.execute(
                "UPDATE memories SET last_accessed = ?2 WHERE key = ?1",
                params![key, now.to_rfc3339()],
            )?;
            Ok(())
        });
        if let Err(e) = result {
            warn!(key, error = %e, "failed to touch last_accessed");
        }
    }

    fn lock_cache(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, MemoryRecord>>> {
        self.inner
            .cache
            .lock()
            .map_err(|_| AgentError::Memory("cache lock poisoned".to_owned()))
    }
}

fn memory_err(e: crate::db::DbError) -> AgentError {
    AgentError::Memory(e.to_string())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let category: String = row.get(2)?;
    let is_fact: i64 = row.get(3)?;
    Ok(MemoryRecord {
        key: row.get(0)?,
        content: row.get(1)?,
        category: MemoryCategory::parse(&category),
        is_fact: is_fact != 0,
        created_at: parse_ts(row.get::<_, String>(4)?),
        updated_at: parse_ts(row.get::<_, String>(5)?),
        last_accessed: row.get::<_, Option<String>>(6)?.map(parse_ts),
    })
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        let db = Arc::new(Database::open_in_memory().expect("open db"));
        MemoryStore::new(db).expect("store")
    }

    async fn seed_fact(store: &MemoryStore, key: &str, content: &str) {
        store
            .save(Some(key), content, MemoryCategory::Family, true)
            .await
            .expect("seed fact");
    }

    #[tokio::test]
    async fn save_without_key_derives_one() {
        let store = store();
        let outcome = store
            .save(None, "Loves listening to Frank Sinatra", MemoryCategory::Preferences, false)
            .await
            .expect("save");
        assert_eq!(outcome.key, "loves-listening-to-frank-sinatra");
        assert_eq!(outcome.action, SaveAction::Created);
    }

    #[tokio::test]
    async fn save_twice_reports_updated() {
        let store = store();
        let first = store
            .save(Some("tea"), "likes tea", MemoryCategory::Preferences, false)
            .await
            .expect("first");
        assert_eq!(first.action, SaveAction::Created);

        let second = store
            .save(Some("tea"), "prefers coffee now", MemoryCategory::Preferences, false)
            .await
            .expect("second");
        assert_eq!(second.action, SaveAction::Updated);

        let record = store.get("tea").expect("get").expect("record");
        assert_eq!(record.content, "prefers coffee now");
    }

    #[tokio::test]
    async fn save_preserves_fact_flag() {
        let store = store();
        seed_fact(&store, "daughter-name", "Daughter is named Sarah").await;

        // A pipeline save over the same key cannot demote the fact.
        store
            .save(Some("daughter-name"), "updated text", MemoryCategory::Family, false)
            .await
            .expect("save");
        let record = store.get("daughter-name").expect("get").expect("record");
        assert!(record.is_fact);
    }

    #[tokio::test]
    async fn facts_are_protected_from_remove_and_update() {
        let store = store();
        seed_fact(&store, "daughter-name-sarah", "Daughter is named Sarah").await;

        assert_eq!(
            store.remove("daughter-name-sarah", false).expect("remove"),
            RemoveOutcome::Protected
        );
        assert_eq!(
            store
                .update("daughter-name-sarah", "new content", None, false)
                .expect("update"),
            UpdateOutcome::Protected
        );

        // The stored record is unchanged.
        let record = store
            .get("daughter-name-sarah")
            .expect("get")
            .expect("record");
        assert_eq!(record.content, "Daughter is named Sarah");
    }

    #[tokio::test]
    async fn force_overrides_fact_protection() {
        let store = store();
        seed_fact(&store, "old-fact", "stale").await;

        assert_eq!(
            store.update("old-fact", "corrected", None, true).expect("update"),
            UpdateOutcome::Updated
        );
        assert_eq!(
            store.remove("old-fact", true).expect("remove"),
            RemoveOutcome::Removed
        );
        assert!(store.get("old-fact").expect("get").is_none());
    }

    #[tokio::test]
    async fn remove_unknown_key_is_not_found() {
        let store = store();
        assert_eq!(
            store.remove("nothing-here", false).expect("remove"),
            RemoveOutcome::NotFound
        );
        assert_eq!(
            store.update("nothing-here", "x", None, false).expect("update"),
            UpdateOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn search_matches_key_substring() {
        let store = store();
        store
            .save(Some("favorite-song"), "Moon River", MemoryCategory::Preferences, false)
            .await
            .expect("save");
        store
            .save(Some("favorite-food"), "Shortbread", MemoryCategory::Preferences, false)
            .await
            .expect("save");
        store
            .save(Some("doctor-visit"), "Tuesdays", MemoryCategory::Health, false)
            .await
            .expect("save");

        let hits = store.search("favorite").expect("search");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].key, "favorite-food");
        assert_eq!(hits[1].key, "favorite-song");
    }

    #[tokio::test]
    async fn list_keys_splits_facts_and_memories() {
        let store = store();
        seed_fact(&store, "son-name", "Son is named David").await;
        store
            .save(Some("likes-gardening"), "Mentioned roses", MemoryCategory::Preferences, false)
            .await
            .expect("save");

        let keys = store.list_keys().expect("list");
        assert_eq!(keys.facts, vec!["son-name".to_owned()]);
        assert_eq!(keys.memories, vec!["likes-gardening".to_owned()]);
    }

    #[tokio::test]
    async fn cache_survives_reopen_from_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("wren.db");

        {
            let db = Arc::new(Database::open(&path).expect("open"));
            let store = MemoryStore::new(db).expect("store");
            store
                .save(Some("persisted"), "still here", MemoryCategory::General, false)
                .await
                .expect("save");
        }

        let db = Arc::new(Database::open(&path).expect("reopen"));
        let store = MemoryStore::new(db).expect("store");
        let record = store.get("persisted").expect("get").expect("record");
        assert_eq!(record.content, "still here");
    }

    struct FixedKeyGen(&'static str);

    #[async_trait::async_trait]
    impl KeyGenerator for FixedKeyGen {
        async fn suggest_key(&self, _content: &str) -> Option<String> {
            Some(self.0.to_owned())
        }
    }

    #[tokio::test]
    async fn key_generator_suggestion_is_normalized() {
        let db = Arc::new(Database::open_in_memory().expect("open db"));
        let store = MemoryStore::new(db)
            .expect("store")
            .with_key_generator(Arc::new(FixedKeyGen("Daughter Name!")));

        let outcome = store
            .save(None, "Daughter is named Sarah", MemoryCategory::Family, false)
            .await
            .expect("save");
        assert_eq!(outcome.key, "daughter-name");
    }
}
