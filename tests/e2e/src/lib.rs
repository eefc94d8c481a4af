//! Test Harness
//!
//! Isolated service bundles over temporary databases. The embedding
//! provider is pointed at a dead port so every test exercises the degraded
//! (scalar-only) paths deterministically.

use std::sync::Arc;

use claudia_core::{
    Consolidator, EmbeddingClient, LanguageModel, MemoryConfig, Recall, Remember, Store, Verifier,
};
use tempfile::TempDir;

pub struct TestMemory {
    pub config: MemoryConfig,
    pub store: Arc<Store>,
    pub remember: Remember,
    pub recall: Recall,
    pub consolidator: Consolidator,
    pub verifier: Verifier,
    _dir: TempDir,
}

impl TestMemory {
    /// A fresh memory engine in a temp directory.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let mut config = MemoryConfig::default();
        config.ollama_host = "http://127.0.0.1:1".to_string();
        config.language_model = String::new();

        let store = Arc::new(
            Store::open_at(&dir.path().join("claudia.db"), &config).expect("open store"),
        );
        let embeddings = Arc::new(EmbeddingClient::new(&config));
        let language_model = Arc::new(LanguageModel::new(&config));

        Self {
            remember: Remember::new(store.clone(), embeddings.clone()),
            recall: Recall::new(store.clone(), embeddings, config.clone()),
            consolidator: Consolidator::new(store.clone(), language_model.clone(), config.clone()),
            verifier: Verifier::new(store.clone(), language_model, config.clone()),
            config,
            store,
            _dir: dir,
        }
    }

    /// The current importance of a memory row.
    pub fn importance_of(&self, memory_id: i64) -> f64 {
        self.store
            .read(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT importance FROM memories WHERE id = ?1",
                        [memory_id],
                        |row| row.get(0),
                    )
                    .expect("memory row"))
            })
            .expect("read importance")
    }
}

impl Default for TestMemory {
    fn default() -> Self {
        Self::new()
    }
}
