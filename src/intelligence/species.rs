//! Species-level knowledge persistence.
//!
//! Q-tables are shared per monster species so every individual learns from
//! the whole species' experience. The main knowledge document stays small;
//! per-species learning history lives in separate blobs, loaded lazily and
//! flushed only when dirty.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::services::storage::Storage;

use super::agent::QTable;

/// Increment when the state space dimensions change. A mismatch at load
/// resets all Q-tables and clears history.
pub const SCHEMA_VERSION: u32 = 3;

/// Maximum history entries retained per species.
pub const HISTORY_LIMIT: usize = 1000;

const KNOWLEDGE_COLLECTION: &str = "species";
const KNOWLEDGE_KEY: &str = "knowledge";
const HISTORY_COLLECTION: &str = "species_history";

/// Single learning event, kept for evolution metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningHistoryEntry {
    pub timestamp: String,
    pub generation: u32,
    pub reward: f32,
    pub state_index: usize,
    pub action: String,
    pub q_value_before: f32,
    pub q_value_after: f32,
}

/// Persistent knowledge record for one monster species.
#[derive(Debug, Clone)]
pub struct SpeciesRecord {
    pub monster_type: String,
    /// Increments each time a monster of this species dies (capped).
    pub generation: u32,
    pub encounters: u64,
    pub total_learning_steps: u64,
    pub q_table: QTable,
    pub history: Vec<LearningHistoryEntry>,
    history_dirty: bool,
    history_loaded: bool,
}

#[derive(Serialize, Deserialize)]
struct RecordDoc {
    monster_type: String,
    #[serde(default)]
    generation: u32,
    #[serde(default)]
    encounters: u64,
    #[serde(default)]
    total_learning_steps: u64,
    q_table: QTable,
}

#[derive(Serialize, Deserialize)]
struct HistoryDoc {
    monster_type: String,
    schema_version: u32,
    history: Vec<LearningHistoryEntry>,
}

impl SpeciesRecord {
    fn fresh(monster_type: &str, state_space: usize, action_count: usize) -> Self {
        SpeciesRecord {
            monster_type: monster_type.to_string(),
            generation: 0,
            encounters: 0,
            total_learning_steps: 0,
            q_table: QTable::zeros(state_space, action_count),
            history: Vec::new(),
            history_dirty: false,
            history_loaded: true,
        }
    }

    fn add_history_entry(&mut self, entry: LearningHistoryEntry) {
        self.history.push(entry);
        self.history_dirty = true;
        if self.history.len() > HISTORY_LIMIT {
            let overflow = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..overflow);
        }
    }
}

/// Loads and persists species knowledge through the storage backend.
///
/// Single-writer: only the monster service mutates the store.
pub struct SpeciesKnowledgeStore {
    storage: Arc<dyn Storage>,
    records: HashMap<String, SpeciesRecord>,
}

impl SpeciesKnowledgeStore {
    /// Load the store, resetting everything on a schema version mismatch.
    pub async fn load(storage: Arc<dyn Storage>) -> Self {
        let mut store = SpeciesKnowledgeStore {
            storage,
            records: HashMap::new(),
        };

        let doc = match store.storage.get(KNOWLEDGE_COLLECTION, KNOWLEDGE_KEY).await {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                store.persist_knowledge().await;
                return store;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load species knowledge, starting empty");
                return store;
            }
        };

        let stored_version = doc
            .get("_schema_version")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32;
        if stored_version != SCHEMA_VERSION {
            tracing::info!(
                stored_version,
                current = SCHEMA_VERSION,
                "species schema changed, resetting all Q-tables"
            );
            store.clear_all_history().await;
            store.persist_knowledge().await;
            return store;
        }

        if let Some(map) = doc.as_object() {
            for (monster_type, payload) in map {
                if monster_type.starts_with('_') {
                    continue;
                }
                match serde_json::from_value::<RecordDoc>(payload.clone()) {
                    Ok(record) => {
                        store.records.insert(
                            monster_type.clone(),
                            SpeciesRecord {
                                monster_type: record.monster_type,
                                generation: record.generation,
                                encounters: record.encounters,
                                total_learning_steps: record.total_learning_steps,
                                q_table: record.q_table,
                                history: Vec::new(),
                                history_dirty: false,
                                history_loaded: false,
                            },
                        );
                    }
                    Err(e) => {
                        tracing::warn!(monster_type, error = %e, "skipping corrupt species record");
                    }
                }
            }
        }
        store
    }

    pub fn species_count(&self) -> usize {
        self.records.len()
    }

    /// Get or create the record for a species. A table whose shape no longer
    /// matches the encoder is resized, preserving the overlapping sub-block.
    pub fn get_or_create(
        &mut self,
        monster_type: &str,
        state_space: usize,
        action_count: usize,
    ) -> &mut SpeciesRecord {
        let record = self
            .records
            .entry(monster_type.to_string())
            .or_insert_with(|| SpeciesRecord::fresh(monster_type, state_space, action_count));

        if record.q_table.shape() != (state_space, action_count) {
            tracing::info!(
                monster_type,
                from = ?record.q_table.shape(),
                to = ?(state_space, action_count),
                "resizing species Q-table"
            );
            record.q_table = record.q_table.resized(state_space, action_count);
        }
        record
    }

    pub fn get(&self, monster_type: &str) -> Option<&SpeciesRecord> {
        self.records.get(monster_type)
    }

    /// Increment the generation counter, capped at `max_generation`.
    /// Returns true when the counter actually advanced.
    pub fn bump_generation(&mut self, monster_type: &str, max_generation: u32) -> bool {
        if let Some(record) = self.records.get_mut(monster_type) {
            if record.generation < max_generation {
                record.generation += 1;
                return true;
            }
        }
        false
    }

    /// Record a learning event. Loads the species history first so the cap
    /// is applied across restarts.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_learning_event(
        &mut self,
        monster_type: &str,
        reward: f32,
        state_index: usize,
        action: &str,
        q_value_before: f32,
        q_value_after: f32,
    ) {
        self.ensure_history_loaded(monster_type).await;
        let Some(record) = self.records.get_mut(monster_type) else {
            return;
        };
        let entry = LearningHistoryEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            generation: record.generation,
            reward,
            state_index,
            action: action.to_string(),
            q_value_before,
            q_value_after,
        };
        record.add_history_entry(entry);
        record.total_learning_steps += 1;
    }

    /// Learning history for a species, newest last.
    #[allow(dead_code)]
    pub async fn get_history(
        &mut self,
        monster_type: &str,
        limit: usize,
    ) -> Vec<LearningHistoryEntry> {
        self.ensure_history_loaded(monster_type).await;
        let Some(record) = self.records.get(monster_type) else {
            return Vec::new();
        };
        if limit > 0 && record.history.len() > limit {
            record.history[record.history.len() - limit..].to_vec()
        } else {
            record.history.clone()
        }
    }

    async fn ensure_history_loaded(&mut self, monster_type: &str) {
        let Some(record) = self.records.get_mut(monster_type) else {
            return;
        };
        if record.history_loaded {
            return;
        }
        record.history_loaded = true;

        match self.storage.get(HISTORY_COLLECTION, monster_type).await {
            Ok(Some(doc)) => match serde_json::from_value::<HistoryDoc>(doc) {
                Ok(parsed) if parsed.schema_version == SCHEMA_VERSION => {
                    record.history = parsed.history;
                }
                Ok(_) => {
                    tracing::info!(monster_type, "history schema mismatch, clearing");
                    let _ = self.storage.delete(HISTORY_COLLECTION, monster_type).await;
                }
                Err(e) => {
                    tracing::warn!(monster_type, error = %e, "failed to parse species history");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(monster_type, error = %e, "failed to load species history");
            }
        }
    }

    /// Persist all species knowledge. Dirty histories are flushed to their
    /// per-species blobs; a failed write keeps the dirty flag for retry.
    pub async fn save(&mut self) {
        self.persist_knowledge().await;
        let dirty: Vec<String> = self
            .records
            .values()
            .filter(|r| r.history_dirty)
            .map(|r| r.monster_type.clone())
            .collect();
        for monster_type in dirty {
            self.save_history(&monster_type).await;
        }
    }

    async fn persist_knowledge(&self) {
        let mut doc = serde_json::Map::new();
        doc.insert("_schema_version".into(), serde_json::json!(SCHEMA_VERSION));
        for (monster_type, record) in &self.records {
            doc.insert(
                monster_type.clone(),
                serde_json::json!({
                    "monster_type": record.monster_type,
                    "generation": record.generation,
                    "encounters": record.encounters,
                    "total_learning_steps": record.total_learning_steps,
                    "q_table": record.q_table,
                }),
            );
        }
        if let Err(e) = self
            .storage
            .put(
                KNOWLEDGE_COLLECTION,
                KNOWLEDGE_KEY,
                &serde_json::Value::Object(doc),
            )
            .await
        {
            tracing::warn!(error = %e, "failed to save species knowledge");
        }
    }

    /// Flush one species' history blob when dirty.
    pub async fn save_history(&mut self, monster_type: &str) {
        let Some(record) = self.records.get_mut(monster_type) else {
            return;
        };
        if !record.history_dirty {
            return;
        }
        let doc = HistoryDoc {
            monster_type: record.monster_type.clone(),
            schema_version: SCHEMA_VERSION,
            history: record.history.clone(),
        };
        let value = match serde_json::to_value(&doc) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(monster_type, error = %e, "failed to serialize history");
                return;
            }
        };
        match self.storage.put(HISTORY_COLLECTION, monster_type, &value).await {
            Ok(()) => record.history_dirty = false,
            Err(e) => {
                tracing::warn!(monster_type, error = %e, "failed to save species history");
            }
        }
    }

    async fn clear_all_history(&self) {
        if let Ok(keys) = self.storage.list_keys(HISTORY_COLLECTION).await {
            for key in keys {
                let _ = self.storage.delete(HISTORY_COLLECTION, &key).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intelligence::agent::ACTION_COUNT;
    use crate::services::storage::FileStorage;

    async fn file_store(dir: &tempfile::TempDir) -> Arc<dyn Storage> {
        Arc::new(FileStorage::new(dir.path().to_path_buf()))
    }

    #[tokio::test]
    async fn test_get_or_create_and_persist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = file_store(&dir).await;

        let mut store = SpeciesKnowledgeStore::load(storage.clone()).await;
        {
            let record = store.get_or_create("goblin", 16, ACTION_COUNT);
            record.q_table.set(3, 1, 2.5);
            record.generation = 4;
        }
        store.save().await;

        let mut reloaded = SpeciesKnowledgeStore::load(storage).await;
        let record = reloaded.get_or_create("goblin", 16, ACTION_COUNT);
        assert_eq!(record.generation, 4);
        assert_eq!(record.q_table.get(3, 1), 2.5);
    }

    #[tokio::test]
    async fn test_schema_mismatch_resets_tables() {
        let dir = tempfile::tempdir().unwrap();
        let storage = file_store(&dir).await;

        // Persist knowledge under an older schema version
        let stale = serde_json::json!({
            "_schema_version": SCHEMA_VERSION - 1,
            "goblin": {
                "monster_type": "goblin",
                "generation": 9,
                "encounters": 3,
                "total_learning_steps": 100,
                "q_table": [[1.0, 2.0]],
            }
        });
        storage.put("species", "knowledge", &stale).await.unwrap();
        storage
            .put(
                "species_history",
                "goblin",
                &serde_json::json!({"monster_type": "goblin", "schema_version": SCHEMA_VERSION - 1, "history": []}),
            )
            .await
            .unwrap();

        let mut store = SpeciesKnowledgeStore::load(storage.clone()).await;
        assert_eq!(store.species_count(), 0);
        let record = store.get_or_create("goblin", 8, ACTION_COUNT);
        assert_eq!(record.generation, 0);
        for s in 0..8 {
            for a in 0..ACTION_COUNT {
                assert_eq!(record.q_table.get(s, a), 0.0);
            }
        }
        // History blob was cleared along with the tables
        assert!(storage
            .get("species_history", "goblin")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_shape_mismatch_preserves_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let storage = file_store(&dir).await;

        let mut store = SpeciesKnowledgeStore::load(storage.clone()).await;
        {
            let record = store.get_or_create("rat", 4, 3);
            record.q_table.set(1, 2, 7.0);
        }
        store.save().await;

        let mut reloaded = SpeciesKnowledgeStore::load(storage).await;
        let record = reloaded.get_or_create("rat", 8, 5);
        assert_eq!(record.q_table.shape(), (8, 5));
        assert_eq!(record.q_table.get(1, 2), 7.0);
        assert_eq!(record.q_table.get(7, 4), 0.0);
    }

    #[tokio::test]
    async fn test_generation_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SpeciesKnowledgeStore::load(file_store(&dir).await).await;
        store.get_or_create("goblin", 8, ACTION_COUNT);
        for _ in 0..20 {
            store.bump_generation("goblin", 10);
        }
        assert_eq!(store.get("goblin").unwrap().generation, 10);
    }

    #[tokio::test]
    async fn test_history_cap_and_flush() {
        let dir = tempfile::tempdir().unwrap();
        let storage = file_store(&dir).await;
        let mut store = SpeciesKnowledgeStore::load(storage.clone()).await;
        store.get_or_create("goblin", 8, ACTION_COUNT);

        for i in 0..(HISTORY_LIMIT + 10) {
            store
                .record_learning_event("goblin", 1.0, i % 8, "ATTACK_AGGRESSIVE", 0.0, 0.1)
                .await;
        }
        let history = store.get_history("goblin", 0).await;
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(
            store.get("goblin").unwrap().total_learning_steps,
            (HISTORY_LIMIT + 10) as u64
        );

        store.save().await;
        let blob = storage.get("species_history", "goblin").await.unwrap();
        assert!(blob.is_some());
    }
}
