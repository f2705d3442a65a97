//! Pluggable document storage.
//!
//! Two backends behind one interface: a file per entity with
//! write-tmp-then-rename atomicity, and a SQLite document table. The core
//! only ever talks to the trait; the backend is picked in config.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Key-value document store. Collections group related documents; keys are
/// unique within a collection.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn put(&self, collection: &str, key: &str, value: &Value) -> Result<(), StorageError>;
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StorageError>;
    async fn delete(&self, collection: &str, key: &str) -> Result<bool, StorageError>;
    async fn list_keys(&self, collection: &str) -> Result<Vec<String>, StorageError>;
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// One JSON file per document: `<root>/<collection>/<key>.json`.
///
/// Writes go to a `.tmp` sibling first and are renamed into place so a crash
/// mid-write never leaves a truncated document.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: PathBuf) -> Self {
        FileStorage { root }
    }

    fn file_path(&self, collection: &str, key: &str) -> PathBuf {
        self.root
            .join(sanitize(collection))
            .join(format!("{}.json", sanitize(key)))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn put(&self, collection: &str, key: &str, value: &Value) -> Result<(), StorageError> {
        let path = self.file_path(collection, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StorageError> {
        let path = self.file_path(collection, key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, StorageError> {
        let path = self.file_path(collection, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self, collection: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.root.join(sanitize(collection));
        let mut keys = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(stem.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// SQLite-backed document store: one `documents` table keyed by
/// `(collection, key)` with the JSON body as text.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn new(db_path: &Path) -> Result<Self, StorageError> {
        // Create parent directory if needed
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        // Enable WAL mode for concurrency
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (collection, key)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn put(&self, collection: &str, key: &str, value: &Value) -> Result<(), StorageError> {
        let body = serde_json::to_string(value)?;
        sqlx::query(
            "INSERT INTO documents (collection, key, body, updated_at) \
             VALUES (?, ?, ?, datetime('now')) \
             ON CONFLICT (collection, key) \
             DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
        )
        .bind(collection)
        .bind(key)
        .bind(&body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StorageError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT body FROM documents WHERE collection = ? AND key = ?")
                .bind(collection)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((body,)) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = ? AND key = ?")
            .bind(collection)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_keys(&self, collection: &str) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM documents WHERE collection = ? ORDER BY key")
                .bind(collection)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise_backend(storage: &dyn Storage) {
        let doc = serde_json::json!({"hp": 10, "name": "goblin"});
        storage.put("monsters", "goblin", &doc).await.unwrap();

        let loaded = storage.get("monsters", "goblin").await.unwrap().unwrap();
        assert_eq!(loaded, doc);

        // Overwrite
        let doc2 = serde_json::json!({"hp": 12});
        storage.put("monsters", "goblin", &doc2).await.unwrap();
        assert_eq!(storage.get("monsters", "goblin").await.unwrap().unwrap(), doc2);

        storage.put("monsters", "orc", &doc).await.unwrap();
        let keys = storage.list_keys("monsters").await.unwrap();
        assert_eq!(keys, vec!["goblin", "orc"]);

        assert!(storage.get("monsters", "dragon").await.unwrap().is_none());
        assert!(storage.list_keys("empty").await.unwrap().is_empty());

        assert!(storage.delete("monsters", "goblin").await.unwrap());
        assert!(!storage.delete("monsters", "goblin").await.unwrap());
        assert!(storage.get("monsters", "goblin").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf());
        exercise_backend(&storage).await;
    }

    #[tokio::test]
    async fn test_file_storage_no_tmp_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf());
        storage
            .put("games", "g1", &serde_json::json!({"x": 1}))
            .await
            .unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("games"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec!["g1.json"]);
    }

    #[tokio::test]
    async fn test_file_storage_sanitizes_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf());
        storage
            .put("games", "../escape", &serde_json::json!(1))
            .await
            .unwrap();
        // The file stays inside the collection directory
        assert!(dir.path().join("games").join(".._escape.json").exists());
    }

    #[tokio::test]
    async fn test_sqlite_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::new(&dir.path().join("test.db")).await.unwrap();
        exercise_backend(&storage).await;
    }
}
