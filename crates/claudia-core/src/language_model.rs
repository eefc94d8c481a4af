//! Language Model Client
//!
//! Optional local LM used only by opt-in cognitive passes (contradiction
//! checks, commitment completeness, consolidation rewriting). Every caller
//! must tolerate None: an absent or unreachable model is a graceful no-op,
//! never an error surfaced to the write path.

use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;

use crate::config::MemoryConfig;

/// LM calls are slow; allow well beyond the embedding timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct LanguageModel {
    host: String,
    model: String,
    http: reqwest::blocking::Client,
    available: Mutex<Option<bool>>,
}

impl LanguageModel {
    pub fn new(config: &MemoryConfig) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            host: config.ollama_host.clone(),
            model: config.language_model.clone(),
            http,
            available: Mutex::new(None),
        }
    }

    /// True when a model name is configured and the provider has it loaded.
    pub fn is_available(&self) -> bool {
        if self.model.is_empty() {
            return false;
        }
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
                body["models"]
                    .as_array()
                    .map(|models| {
                        models.iter().any(|m| {
                            m["name"]
                                .as_str()
                                .map(|n| n.contains(&self.model) || n.contains(base))
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Generate a completion. None on any failure.
    pub fn generate(&self, prompt: &str, temperature: f64, format_json: bool) -> Option<String> {
        if !self.is_available() {
            return None;
        }

        let mut body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": temperature },
        });
        if format_json {
            body["format"] = json!("json");
        }

        let url = format!("{}/api/generate", self.host);
        let resp = match self.http.post(&url).json(&body).send() {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::warn!("language model request failed: {}", r.status());
                return None;
            }
            Err(e) => {
                tracing::warn!("language model request error: {}", e);
                return None;
            }
        };

        let parsed: serde_json::Value = resp.json().ok()?;
        parsed["response"].as_str().map(|s| s.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_model_name_disables_the_client() {
        let mut config = MemoryConfig::default();
        config.language_model = String::new();
        let lm = LanguageModel::new(&config);
        assert!(!lm.is_available());
        assert!(lm.generate("hello", 0.1, false).is_none());
    }

    #[test]
    fn unreachable_provider_is_a_noop() {
        let mut config = MemoryConfig::default();
        config.ollama_host = "http://127.0.0.1:1".to_string();
        let lm = LanguageModel::new(&config);
        assert!(!lm.is_available());
        assert!(lm.generate("hello", 0.1, true).is_none());
    }
}
