//! Embedding Client
//!
//! On-demand vector generation against a local inference server (Ollama).
//! Availability is probed once and cached for the process lifetime; every
//! generate call short-circuits to None while the provider is down so
//! writes are never blocked on embeddings.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use serde_json::json;

use crate::config::MemoryConfig;
use crate::store::{vector_from_bytes, EmbeddingTable, Result, Store};

/// Capacity of the per-process embedding cache.
const CACHE_CAPACITY: usize = 256;

/// Provider request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct EmbeddingClient {
    host: String,
    model: String,
    dimensions: usize,
    http: reqwest::blocking::Client,
    /// Liveness probe result, cached for the process lifetime.
    available: Mutex<Option<bool>>,
    /// LRU keyed on (model, text) so a model swap cannot serve stale vectors.
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingClient {
    pub fn new(config: &MemoryConfig) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            host: config.ollama_host.clone(),
            model: config.embedding_model.clone(),
            dimensions: config.embedding_dimensions,
            http,
            available: Mutex::new(None),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Probe the provider and check the configured model is loaded. The
    /// result is cached; a flapping provider needs a daemon restart.
    pub fn is_available(&self) -> bool {
        let mut cached = match self.available.lock() {
            Ok(g) => g,
            Err(_) => return false,
        };
        if let Some(v) = *cached {
            return v;
        }

        let alive = self.probe();
        *cached = Some(alive);
        alive
    }

    fn probe(&self) -> bool {
        let url = format!("{}/api/tags", self.host);
        match self.http.get(&url).send() {
            Ok(resp) if resp.status().is_success() => {
                let body: serde_json::Value = match resp.json() {
                    Ok(b) => b,
                    Err(_) => return false,
                };
                let base = self.model.split(':').next().unwrap_or(&self.model);
                let found = body["models"]
                    .as_array()
                    .map(|models| {
                        models.iter().any(|m| {
                            m["name"]
                                .as_str()
                                .map(|n| n.contains(&self.model) || n.contains(base))
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false);
                if !found {
                    tracing::warn!(
                        "embedding model '{}' not loaded on {}; pull it with: ollama pull {}",
                        self.model,
                        self.host,
                        self.model
                    );
                }
                found
            }
            Ok(resp) => {
                tracing::warn!("embedding provider returned {}", resp.status());
                false
            }
            Err(e) => {
                tracing::warn!("embedding provider not available: {}", e);
                false
            }
        }
    }

    /// Generate an embedding for a single text. None when the provider is
    /// down, the response is malformed, or the width is wrong.
    pub fn embed(&self, text: &str) -> Option<Vec<f32>> {
        if !self.is_available() {
            return None;
        }

        let key = format!("{}\u{0}{}", self.model, text);
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return Some(hit.clone());
            }
        }

        let vector = self.request_embedding(text)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, vector.clone());
        }
        Some(vector)
    }

    fn request_embedding(&self, text: &str) -> Option<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.host);
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "model": self.model, "prompt": text }))
            .send();

        let resp = match resp {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::error!("embedding request failed: {}", r.status());
                return None;
            }
            Err(e) => {
                tracing::error!("embedding request error: {}", e);
                return None;
            }
        };

        let body: serde_json::Value = resp.json().ok()?;
        let raw = body["embedding"].as_array()?;
        let vector: Vec<f32> = raw.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect();

        if vector.len() != self.dimensions {
            tracing::warn!(
                "unexpected embedding width {} (expected {})",
                vector.len(),
                self.dimensions
            );
            return None;
        }
        Some(vector)
    }

    /// Batch generation: embeddings are independent, so fan out across
    /// threads. Order is preserved; failures surface as None entries.
    pub fn embed_batch(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        if !self.is_available() {
            return vec![None; texts.len()];
        }
        if texts.len() <= 1 {
            return texts.iter().map(|t| self.embed(t)).collect();
        }

        std::thread::scope(|scope| {
            let handles: Vec<_> = texts
                .iter()
                .map(|text| scope.spawn(move || self.embed(text)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap_or(None)).collect()
        })
    }

    /// Drop all cached vectors. Required on model change.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}

// ============================================================================
// VECTOR MATH
// ============================================================================

/// Cosine similarity in [-1, 1]; 0.0 for mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Euclidean (L2) distance; the KNN metric over stored vectors.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::MAX;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

// ============================================================================
// EMBEDDING MIGRATION
// ============================================================================

/// Per-class counts from an embedding migration run.
#[derive(Debug, Default, serde::Serialize)]
pub struct MigrateEmbeddingsReport {
    pub memories: usize,
    pub entities: usize,
    pub episodes: usize,
    pub reflections: usize,
    pub skipped: usize,
}

/// Rebuild every vector table at the configured dimension and re-embed all
/// memories, entities, episode narratives and reflections. The operator runs
/// this (via `--migrate-embeddings`) after changing the embedding model.
pub fn migrate_embeddings(
    store: &Store,
    client: &EmbeddingClient,
) -> Result<MigrateEmbeddingsReport> {
    use crate::store::StoreError;

    if !client.is_available() {
        return Err(StoreError::TransientUnavailable(
            "embedding provider is not reachable; cannot regenerate vectors".into(),
        ));
    }

    store.reset_vector_tables(client.model())?;
    client.clear_cache();

    let mut report = MigrateEmbeddingsReport::default();

    report.memories = reembed(
        store,
        client,
        EmbeddingTable::Memory,
        "SELECT id, content FROM memories WHERE invalidated_at IS NULL",
        &mut report.skipped,
    )?;
    report.entities = reembed(
        store,
        client,
        EmbeddingTable::Entity,
        "SELECT id, name || '. ' || COALESCE(description, '') FROM entities
         WHERE deleted_at IS NULL",
        &mut report.skipped,
    )?;
    report.episodes = reembed(
        store,
        client,
        EmbeddingTable::Episode,
        "SELECT id, narrative FROM episodes
         WHERE narrative IS NOT NULL AND narrative != ''",
        &mut report.skipped,
    )?;
    report.reflections = reembed(
        store,
        client,
        EmbeddingTable::Reflection,
        "SELECT id, content FROM reflections WHERE importance > 0.01",
        &mut report.skipped,
    )?;

    Ok(report)
}

fn reembed(
    store: &Store,
    client: &EmbeddingClient,
    table: EmbeddingTable,
    sql: &str,
    skipped: &mut usize,
) -> Result<usize> {
    let rows: Vec<(i64, String)> = store.read(|conn| {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    })?;

    let mut written = 0;
    // Two-pass batches: embed outside the transaction, store inside it.
    for chunk in rows.chunks(32) {
        let texts: Vec<String> = chunk.iter().map(|(_, t)| t.clone()).collect();
        let vectors = client.embed_batch(&texts);

        store.transaction(|tx| {
            for ((id, _), vector) in chunk.iter().zip(vectors.iter()) {
                match vector {
                    Some(v) => {
                        store.put_embedding(tx, table, *id, v)?;
                        written += 1;
                    }
                    None => *skipped += 1,
                }
            }
            Ok(())
        })?;
    }

    Ok(written)
}

/// Load every stored vector for a class. Torn blobs are skipped.
pub fn load_all_embeddings(
    store: &Store,
    table: EmbeddingTable,
) -> Result<Vec<(i64, Vec<f32>)>> {
    store.read(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, embedding FROM {}",
            table.owner_column(),
            table.table()
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(id, bytes)| vector_from_bytes(&bytes).map(|v| (id, v)))
            .collect();
        Ok(rows)
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_basics() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &c).abs() < 1e-6);

        // Opposite vectors
        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 1e-6);

        // Degenerate inputs
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn l2_distance_basics() {
        let a = vec![0.0, 0.0];
        let b = vec![3.0, 4.0];
        assert!((l2_distance(&a, &b) - 5.0).abs() < 1e-6);
        assert_eq!(l2_distance(&a, &a), 0.0);
        assert_eq!(l2_distance(&a, &[1.0]), f32::MAX);
    }

    #[test]
    fn unreachable_provider_short_circuits() {
        let mut config = MemoryConfig::default();
        // A port nothing listens on; the probe fails fast and is cached.
        config.ollama_host = "http://127.0.0.1:1".to_string();
        let client = EmbeddingClient::new(&config);

        assert!(!client.is_available());
        assert!(client.embed("anything").is_none());
        let batch = client.embed_batch(&["a".to_string(), "b".to_string()]);
        assert_eq!(batch, vec![None, None]);
    }
}
