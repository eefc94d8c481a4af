//! Store
//!
//! Thread-safe embedded store over SQLite: WAL journaling, ordered
//! migrations, content hashing, transactional scope, online backup and the
//! daemon single-instance lock.
//!
//! Uses separate reader/writer connections behind mutexes so all methods
//! take `&self` and the services can share an `Arc<Store>`.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;
use rusqlite::{Connection, TransactionBehavior};
use sha2::{Digest, Sha256};

use crate::config::MemoryConfig;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Store error taxonomy. Recovery code matches on variants, never strings.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Content-hash collision on insert; callers treat as idempotent success
    #[error("duplicate content (existing memory {existing_id})")]
    DuplicateContent { existing_id: i64 },
    /// Configured embedding shape disagrees with what the store holds
    #[error("embedding dimension mismatch: configured {configured}, stored {stored}")]
    DimensionMismatch { configured: usize, stored: usize },
    /// A soft dependency (embedding provider, language model) is down
    #[error("transient dependency unavailable: {0}")]
    TransientUnavailable(String),
    /// Row not found
    #[error("not found: {0}")]
    NotFound(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Startup / schema failure
    #[error("initialization error: {0}")]
    Init(String),
    /// Fatal input validation failure (guards reject, e.g. empty entity name)
    #[error("validation error: {0}")]
    Validation(String),
}

/// Store result type
pub type Result<T> = std::result::Result<T, StoreError>;

/// SHA-256 hex digest of raw UTF-8 content. Stable across runs; the
/// deduplication identity for memories, messages and documents.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Current UTC timestamp in the canonical stored format.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

// ============================================================================
// VECTOR SIDE-TABLES
// ============================================================================

/// One vector side-table per embedded entity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingTable {
    Memory,
    Entity,
    Message,
    Episode,
    Reflection,
}

impl EmbeddingTable {
    pub const ALL: [EmbeddingTable; 5] = [
        EmbeddingTable::Memory,
        EmbeddingTable::Entity,
        EmbeddingTable::Message,
        EmbeddingTable::Episode,
        EmbeddingTable::Reflection,
    ];

    pub fn table(self) -> &'static str {
        match self {
            EmbeddingTable::Memory => "memory_embeddings",
            EmbeddingTable::Entity => "entity_embeddings",
            EmbeddingTable::Message => "message_embeddings",
            EmbeddingTable::Episode => "episode_embeddings",
            EmbeddingTable::Reflection => "reflection_embeddings",
        }
    }

    pub fn owner_column(self) -> &'static str {
        match self {
            EmbeddingTable::Memory => "memory_id",
            EmbeddingTable::Entity => "entity_id",
            EmbeddingTable::Message => "message_id",
            EmbeddingTable::Episode => "episode_id",
            EmbeddingTable::Reflection => "reflection_id",
        }
    }
}

/// Serialize a vector as little-endian f32 bytes for BLOB storage.
pub fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Deserialize BLOB bytes back into a vector. Returns None on a torn blob.
pub fn vector_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

// ============================================================================
// STORE
// ============================================================================

pub struct Store {
    path: PathBuf,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    dimensions: usize,
    model_mismatch: AtomicBool,
}

impl Store {
    /// Open (creating if needed) the configured database, apply schema and
    /// migrations, create vector tables, and record the embedding shape.
    pub fn open(config: &MemoryConfig) -> Result<Self> {
        Self::open_at(&config.db_path(), config)
    }

    /// Open a store at an explicit path. Tests use this with temp dirs.
    pub fn open_at(path: &Path, config: &MemoryConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer = Connection::open(path)?;
        Self::configure_connection(&writer)?;

        writer.execute_batch(schema::SCHEMA)?;
        migrations::apply_migrations(&writer)?;

        let mismatch = Self::ensure_vector_tables(
            &writer,
            &config.embedding_model,
            config.embedding_dimensions,
        )?;
        if mismatch {
            tracing::warn!(
                "embedding shape in _meta differs from configuration; \
                 vector writes disabled until `--migrate-embeddings` runs"
            );
        }

        let reader = Connection::open(path)?;
        Self::configure_connection(&reader)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            dimensions: config.embedding_dimensions,
            model_mismatch: AtomicBool::new(mismatch),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA wal_checkpoint(TRUNCATE);",
        )?;
        Ok(())
    }

    /// Create the five vector side-tables and record the embedding shape in
    /// `_meta` atomically with their creation. Returns true when the stored
    /// shape disagrees with the configuration.
    fn ensure_vector_tables(conn: &Connection, model: &str, dimensions: usize) -> Result<bool> {
        let stored: Option<(String, String)> = {
            let model_row = meta_get(conn, "embedding_model")?;
            let dims_row = meta_get(conn, "embedding_dimensions")?;
            match (model_row, dims_row) {
                (Some(m), Some(d)) => Some((m, d)),
                _ => None,
            }
        };

        if let Some((stored_model, stored_dims)) = stored {
            let stored_dims: usize = stored_dims.parse().unwrap_or(0);
            return Ok(stored_model != model || stored_dims != dimensions);
        }

        conn.execute_batch("BEGIN")?;
        for table in EmbeddingTable::ALL {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    {} INTEGER PRIMARY KEY,
                    embedding BLOB NOT NULL
                )",
                table.table(),
                table.owner_column()
            ))?;
        }
        conn.execute(
            "INSERT OR REPLACE INTO _meta (key, value) VALUES ('embedding_model', ?1)",
            [model],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO _meta (key, value) VALUES ('embedding_dimensions', ?1)",
            [dimensions.to_string()],
        )?;
        conn.execute_batch("COMMIT")?;

        Ok(false)
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configured embedding width.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// True while the configured embedding shape disagrees with `_meta`.
    /// Embedding writes are refused until the migration subcommand clears it.
    pub fn model_mismatch(&self) -> bool {
        self.model_mismatch.load(Ordering::Relaxed)
    }

    /// Run a closure inside a write transaction. Commits on Ok, rolls back
    /// on Err; no partial record (embedding included) survives a failure.
    pub fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| StoreError::Init("writer lock poisoned".into()))?;
        let tx = writer.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => Err(e), // tx rolls back on drop
        }
    }

    /// Run a closure against the read connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let reader = self
            .reader
            .lock()
            .map_err(|_| StoreError::Init("reader lock poisoned".into()))?;
        f(&reader)
    }

    /// Write an owner-keyed vector. Skipped (with a debug log) while the
    /// model-mismatch flag is set or the vector has the wrong width; callers
    /// never fail a write because a vector could not be stored.
    pub fn put_embedding(
        &self,
        conn: &Connection,
        table: EmbeddingTable,
        owner_id: i64,
        vector: &[f32],
    ) -> Result<()> {
        if self.model_mismatch() {
            tracing::debug!("skipping {} write: model mismatch", table.table());
            return Ok(());
        }
        if vector.len() != self.dimensions {
            tracing::warn!(
                "skipping {} write for {}: got {} dims, expected {}",
                table.table(),
                owner_id,
                vector.len(),
                self.dimensions
            );
            return Ok(());
        }
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} ({}, embedding) VALUES (?1, ?2)",
                table.table(),
                table.owner_column()
            ),
            rusqlite::params![owner_id, vector_to_bytes(vector)],
        )?;
        Ok(())
    }

    /// Drop and recreate the vector tables at the configured dimension and
    /// rewrite `_meta`. Clears the mismatch flag; the caller re-embeds.
    pub fn reset_vector_tables(&self, model: &str) -> Result<()> {
        self.transaction(|tx| {
            for table in EmbeddingTable::ALL {
                tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", table.table()))?;
                tx.execute_batch(&format!(
                    "CREATE TABLE {} ({} INTEGER PRIMARY KEY, embedding BLOB NOT NULL)",
                    table.table(),
                    table.owner_column()
                ))?;
            }
            tx.execute(
                "INSERT OR REPLACE INTO _meta (key, value) VALUES ('embedding_model', ?1)",
                [model],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO _meta (key, value) VALUES ('embedding_dimensions', ?1)",
                [self.dimensions.to_string()],
            )?;
            Ok(())
        })?;
        self.model_mismatch.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Append an audit row inside the caller's transaction.
    pub fn record_audit(
        &self,
        conn: &Connection,
        operation: &str,
        target_table: &str,
        target_id: Option<i64>,
        detail: Option<&str>,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO audit_log (operation, target_table, target_id, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![operation, target_table, target_id, detail, now_iso()],
        )?;
        Ok(())
    }

    /// Record an operational metric (job durations, batch counts).
    pub fn record_metric(&self, name: &str, value: f64) -> Result<()> {
        self.transaction(|tx| {
            tx.execute(
                "INSERT INTO metrics (name, value, recorded_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![name, value, now_iso()],
            )?;
            Ok(())
        })
    }

    /// Row count of a known table (health/stats surface).
    pub fn count(&self, table: &str) -> Result<i64> {
        const KNOWN: &[&str] = &[
            "memories",
            "entities",
            "relationships",
            "episodes",
            "patterns",
            "predictions",
            "reflections",
            "documents",
            "turn_buffer",
        ];
        if !KNOWN.contains(&table) {
            return Err(StoreError::Validation(format!("unknown table: {}", table)));
        }
        self.read(|conn| {
            Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })?)
        })
    }

    /// Online backup to the sibling `backups/` directory with label-scoped
    /// retention: daily keeps 7, weekly keeps 4, everything else keeps 7.
    pub fn backup(&self, label: &str) -> Result<PathBuf> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| StoreError::Init("database path has no parent".into()))?;
        let dir = parent.join("backups");
        std::fs::create_dir_all(&dir)?;

        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("claudia");
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let dest = dir.join(format!("{}-{}-{}.db", stem, label, stamp));

        {
            let reader = self
                .reader
                .lock()
                .map_err(|_| StoreError::Init("reader lock poisoned".into()))?;
            let mut dst = Connection::open(&dest)?;
            let backup = rusqlite::backup::Backup::new(&reader, &mut dst)?;
            backup.run_to_completion(100, Duration::from_millis(50), None)?;
        }

        let keep = match label {
            "daily" => 7,
            "weekly" => 4,
            _ => 7,
        };
        Self::prune_backups(&dir, stem, label, keep)?;

        Ok(dest)
    }

    fn prune_backups(dir: &Path, stem: &str, label: &str, keep: usize) -> Result<()> {
        let prefix = format!("{}-{}-", stem, label);
        let mut matching: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(".db"))
                    .unwrap_or(false)
            })
            .collect();

        // Timestamped names sort chronologically
        matching.sort();
        while matching.len() > keep {
            let victim = matching.remove(0);
            if let Err(e) = std::fs::remove_file(&victim) {
                tracing::warn!("could not prune backup {:?}: {}", victim, e);
            }
        }
        Ok(())
    }
}

// ============================================================================
// DAEMON LOCK
// ============================================================================

/// Exclusive advisory file lock beside the database. A second daemon on the
/// same database observes contention and exits successfully so startup
/// scripts no-op when the daemon is already running.
pub struct DaemonLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl DaemonLock {
    /// Try to acquire the lock. `Ok(None)` means another daemon holds it.
    pub fn acquire(db_path: &Path) -> Result<Option<DaemonLock>> {
        let path = db_path.with_extension("lock");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(DaemonLock { _file: file, path })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ============================================================================
// META HELPERS
// ============================================================================

fn meta_get(conn: &Connection, key: &str) -> Result<Option<String>> {
    use rusqlite::OptionalExtension;
    Ok(conn
        .query_row("SELECT value FROM _meta WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let config = MemoryConfig::default();
        let store = Store::open_at(&dir.path().join("test.db"), &config).unwrap();
        (store, dir)
    }

    #[test]
    fn content_hash_is_stable() {
        let a = content_hash("The annual company retreat is in September");
        let b = content_hash("The annual company retreat is in September");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash("Something else"));
    }

    #[test]
    fn vector_bytes_round_trip() {
        let v = vec![0.1f32, -2.5, 3.75, 0.0];
        let bytes = vector_to_bytes(&v);
        assert_eq!(bytes.len(), 16);
        assert_eq!(vector_from_bytes(&bytes).unwrap(), v);

        assert!(vector_from_bytes(&[]).is_none());
        assert!(vector_from_bytes(&[1, 2, 3]).is_none());
    }

    #[test]
    fn open_creates_schema_and_vector_tables() {
        let (store, _dir) = test_store();
        assert!(!store.model_mismatch());

        store
            .read(|conn| {
                for table in EmbeddingTable::ALL {
                    let count: i64 = conn
                        .query_row(
                            &format!("SELECT COUNT(*) FROM {}", table.table()),
                            [],
                            |row| row.get(0),
                        )
                        .unwrap();
                    assert_eq!(count, 0);
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(store.count("memories").unwrap(), 0);
    }

    #[test]
    fn dimension_mismatch_is_detected_and_blocks_vector_writes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.db");

        let config = MemoryConfig::default();
        drop(Store::open_at(&path, &config).unwrap());

        let mut wide = MemoryConfig::default();
        wide.embedding_dimensions = 768;
        let store = Store::open_at(&path, &wide).unwrap();
        assert!(store.model_mismatch());

        // Vector writes are silently refused while mismatched
        store
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO memories (content, content_hash, created_at, updated_at)
                     VALUES ('x', 'h1', ?1, ?1)",
                    [now_iso()],
                )?;
                store.put_embedding(tx, EmbeddingTable::Memory, 1, &vec![0.0; 768])?;
                Ok(())
            })
            .unwrap();
        let stored: i64 = store
            .read(|conn| {
                Ok(conn
                    .query_row("SELECT COUNT(*) FROM memory_embeddings", [], |r| r.get(0))
                    .unwrap())
            })
            .unwrap();
        assert_eq!(stored, 0);

        // Migration subcommand path: reset clears the flag
        store.reset_vector_tables(&wide.embedding_model).unwrap();
        assert!(!store.model_mismatch());
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let (store, _dir) = test_store();

        let result: Result<()> = store.transaction(|tx| {
            tx.execute(
                "INSERT INTO memories (content, content_hash, created_at, updated_at)
                 VALUES ('x', 'h-rollback', ?1, ?1)",
                [now_iso()],
            )?;
            Err(StoreError::Validation("forced".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.count("memories").unwrap(), 0);
    }

    #[test]
    fn backup_creates_labeled_file_and_prunes() {
        let (store, dir) = test_store();

        let path = store.backup("daily").unwrap();
        assert!(path.exists());
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("test-daily-"));
        assert!(name.ends_with(".db"));

        let backups_dir = dir.path().join("backups");
        // Seed more files than the daily retention allows
        for i in 0..9 {
            std::fs::write(
                backups_dir.join(format!("test-daily-20200101-00000{}.db", i)),
                b"old",
            )
            .unwrap();
        }
        store.backup("daily").unwrap();
        let remaining = std::fs::read_dir(&backups_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("test-daily-"))
            .count();
        assert_eq!(remaining, 7);
    }

    #[test]
    fn daemon_lock_detects_contention() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("test.db");

        let first = DaemonLock::acquire(&db).unwrap();
        assert!(first.is_some());

        let second = DaemonLock::acquire(&db).unwrap();
        assert!(second.is_none());

        drop(first);
        let third = DaemonLock::acquire(&db).unwrap();
        assert!(third.is_some());
    }
}
