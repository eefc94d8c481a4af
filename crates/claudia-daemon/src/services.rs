//! Service wiring
//!
//! The daemon owns one instance of each core service, initialized at
//! startup and shared by the tool surface, scheduler and health endpoint.
//! Tests construct their own bundle over a temp database.

use std::sync::Arc;

use claudia_core::{
    Consolidator, EmbeddingClient, LanguageModel, MemoryConfig, Recall, Remember, Store, Verifier,
};

pub struct Services {
    pub config: MemoryConfig,
    pub store: Arc<Store>,
    pub embeddings: Arc<EmbeddingClient>,
    pub language_model: Arc<LanguageModel>,
    pub remember: Remember,
    pub recall: Recall,
    pub consolidator: Consolidator,
    pub verifier: Verifier,
}

impl Services {
    pub fn new(config: MemoryConfig, store: Arc<Store>) -> Self {
        let embeddings = Arc::new(EmbeddingClient::new(&config));
        let language_model = Arc::new(LanguageModel::new(&config));

        let remember = Remember::new(store.clone(), embeddings.clone());
        let recall = Recall::new(store.clone(), embeddings.clone(), config.clone());
        let consolidator = Consolidator::new(store.clone(), language_model.clone(), config.clone());
        let verifier = Verifier::new(store.clone(), language_model.clone(), config.clone());

        Self {
            config,
            store,
            embeddings,
            language_model,
            remember,
            recall,
            consolidator,
            verifier,
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// Services over a temp database with the embedding provider pointed at
    /// a dead port, so everything degrades to scalar paths.
    pub fn test_services() -> (Arc<Services>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = MemoryConfig::default();
        config.ollama_host = "http://127.0.0.1:1".to_string();
        config.language_model = String::new();
        let store =
            Arc::new(Store::open_at(&dir.path().join("test.db"), &config).unwrap());
        (Arc::new(Services::new(config, store)), dir)
    }
}
