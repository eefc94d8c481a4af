//! Verifier
//!
//! Deferred background pass over pending memories. Runs a cascade of cheap
//! deterministic checks before any optional language-model checks, then
//! promotes each memory to verified or flags it. A failure on one memory
//! never aborts the batch.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use crate::config::MemoryConfig;
use crate::guards;
use crate::language_model::LanguageModel;
use crate::store::{now_iso, Result, Store};

/// Memories younger than this are left alone so a session's own writes are
/// not verified mid-conversation.
const VERIFY_BUFFER_MINUTES: i64 = 5;

/// Importance assigned to flagged or contradicting memories.
const FLAGGED_IMPORTANCE: f64 = 0.1;

#[derive(Debug, Default, Clone, Serialize)]
pub struct VerifyStats {
    pub verified: usize,
    pub flagged: usize,
    pub contradicts: usize,
    pub skipped: usize,
}

struct PendingMemory {
    id: i64,
    content: String,
    memory_type: String,
    metadata: Option<String>,
}

struct Verdict {
    status: &'static str,
    reasons: Vec<String>,
}

pub struct Verifier {
    store: Arc<Store>,
    language_model: Arc<LanguageModel>,
    config: MemoryConfig,
}

impl Verifier {
    pub fn new(store: Arc<Store>, language_model: Arc<LanguageModel>, config: MemoryConfig) -> Self {
        Self {
            store,
            language_model,
            config,
        }
    }

    /// Verify one batch of pending memories older than the session buffer.
    pub fn run_verification(&self) -> Result<VerifyStats> {
        let cutoff = (Utc::now() - Duration::minutes(VERIFY_BUFFER_MINUTES)).to_rfc3339();
        let batch: Vec<PendingMemory> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, content, type, metadata FROM memories
                 WHERE verification_status = 'pending' AND created_at < ?1
                 ORDER BY created_at ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(
                    params![cutoff, self.config.verify_batch_size as i64],
                    |row| {
                        Ok(PendingMemory {
                            id: row.get(0)?,
                            content: row.get(1)?,
                            memory_type: row.get(2)?,
                            metadata: row.get(3)?,
                        })
                    },
                )?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        let mut stats = VerifyStats::default();
        for memory in batch {
            let memory_id = memory.id;
            match self.verify_single(&memory) {
                Ok(verdict) => {
                    match verdict.status {
                        "verified" => stats.verified += 1,
                        "flagged" => stats.flagged += 1,
                        "contradicts" => stats.contradicts += 1,
                        _ => {}
                    }
                    if let Err(e) = self.apply_verdict(&memory, verdict) {
                        tracing::warn!("could not apply verdict for memory {}: {}", memory_id, e);
                        stats.skipped += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!("verification failed for memory {}: {}", memory_id, e);
                    stats.skipped += 1;
                }
            }
        }

        tracing::info!(
            verified = stats.verified,
            flagged = stats.flagged,
            contradicts = stats.contradicts,
            skipped = stats.skipped,
            "verification batch complete"
        );
        Ok(stats)
    }

    fn verify_single(&self, memory: &PendingMemory) -> Result<Verdict> {
        let mut reasons = Vec::new();

        // Check 1: commitment deadline (deterministic)
        if memory.memory_type == "commitment" && !guards::has_deadline_pattern(&memory.content) {
            reasons.push("Commitment has no detected deadline".to_string());
        }

        // Check 2: linked entity near-duplicates (deterministic)
        let linked: Vec<(String, String)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.name, e.canonical_name
                 FROM memory_entities me
                 JOIN entities e ON me.entity_id = e.id
                 WHERE me.memory_id = ?1 AND e.deleted_at IS NULL",
            )?;
            let rows = stmt
                .query_map([memory.id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        if !linked.is_empty() {
            let all_canonical: Vec<String> = self.store.read(|conn| {
                let mut stmt = conn
                    .prepare("SELECT canonical_name FROM entities WHERE deleted_at IS NULL")?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(names)
            })?;

            for (name, canonical) in &linked {
                let others: Vec<String> = all_canonical
                    .iter()
                    .filter(|c| *c != canonical)
                    .cloned()
                    .collect();
                let result = guards::validate_entity(name, "person", &others);
                for warning in result.warnings {
                    if warning.to_lowercase().contains("near-duplicate") {
                        reasons.push(warning);
                    }
                }
            }
        }

        // Check 3: fact contradiction (LM, optional)
        if memory.memory_type == "fact" && self.language_model.is_available() {
            if let Some(contradiction) = self.check_contradiction(memory, &linked)? {
                return Ok(Verdict {
                    status: "contradicts",
                    reasons: vec![contradiction],
                });
            }
        }

        // Check 4: commitment completeness (LM, optional)
        if memory.memory_type == "commitment" && self.language_model.is_available() {
            if let Some(incompleteness) = self.check_completeness(&memory.content) {
                reasons.push(incompleteness);
            }
        }

        Ok(if reasons.is_empty() {
            Verdict {
                status: "verified",
                reasons,
            }
        } else {
            Verdict {
                status: "flagged",
                reasons,
            }
        })
    }

    fn apply_verdict(&self, memory: &PendingMemory, verdict: Verdict) -> Result<()> {
        let now = now_iso();
        self.store.transaction(|tx| {
            if verdict.status == "flagged" || verdict.status == "contradicts" {
                tx.execute(
                    "UPDATE memories SET importance = ?1 WHERE id = ?2",
                    params![FLAGGED_IMPORTANCE, memory.id],
                )?;
            }

            let metadata = if verdict.reasons.is_empty() {
                None
            } else {
                let mut meta: Value = memory
                    .metadata
                    .as_deref()
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .unwrap_or_else(|| Value::Object(Default::default()));
                if let Some(map) = meta.as_object_mut() {
                    map.insert(
                        "verification_reasons".into(),
                        serde_json::json!(verdict.reasons),
                    );
                }
                Some(meta.to_string())
            };

            match metadata {
                Some(meta) => {
                    tx.execute(
                        "UPDATE memories
                         SET verification_status = ?1, verified_at = ?2, metadata = ?3
                         WHERE id = ?4",
                        params![verdict.status, now, meta, memory.id],
                    )?;
                }
                None => {
                    tx.execute(
                        "UPDATE memories SET verification_status = ?1, verified_at = ?2
                         WHERE id = ?3",
                        params![verdict.status, now, memory.id],
                    )?;
                }
            }
            Ok(())
        })
    }

    /// Ask the LM whether the new fact contradicts up to 10 verified facts
    /// about the same entities.
    fn check_contradiction(
        &self,
        memory: &PendingMemory,
        linked: &[(String, String)],
    ) -> Result<Option<String>> {
        if linked.is_empty() {
            return Ok(None);
        }

        let existing: Vec<String> = self.store.read(|conn| {
            let mut facts = Vec::new();
            for (_, canonical) in linked {
                let entity_id: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM entities
                         WHERE canonical_name = ?1 AND deleted_at IS NULL",
                        [canonical],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(entity_id) = entity_id else { continue };
                collect_verified_facts(conn, entity_id, memory.id, &mut facts)?;
            }
            facts.truncate(10);
            Ok(facts)
        })?;

        if existing.is_empty() {
            return Ok(None);
        }

        let facts_text = existing
            .iter()
            .map(|f| format!("- {}", f))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Existing verified facts:\n{}\n\nNew fact: {}\n\n\
             Does the new fact directly contradict any existing fact? \
             Answer ONLY 'no' or describe the specific contradiction in one sentence.",
            facts_text, memory.content
        );

        let response = self.language_model.generate(&prompt, 0.0, false);
        Ok(match response {
            Some(r) if !r.trim().eq_ignore_ascii_case("no") => {
                let mut truncated = r.trim().to_string();
                truncated.truncate(200);
                Some(format!("Potential contradiction: {}", truncated))
            }
            _ => None,
        })
    }

    /// Ask the LM whether a commitment names an owner and a deadline.
    fn check_completeness(&self, content: &str) -> Option<String> {
        let prompt = format!(
            "Commitment: {}\n\n\
             Does this commitment have a clear owner (who is responsible) \
             and a clear deadline (when it should be done)? \
             Answer ONLY 'yes' or describe what is missing in one sentence.",
            content
        );
        let response = self.language_model.generate(&prompt, 0.0, false)?;
        if response.trim().eq_ignore_ascii_case("yes") {
            return None;
        }
        let mut truncated = response.trim().to_string();
        truncated.truncate(200);
        Some(format!("Incomplete commitment: {}", truncated))
    }
}

fn collect_verified_facts(
    conn: &Connection,
    entity_id: i64,
    exclude_memory: i64,
    out: &mut Vec<String>,
) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT m.content
         FROM memories m
         JOIN memory_entities me ON m.id = me.memory_id
         WHERE me.entity_id = ?1
           AND m.type = 'fact'
           AND m.verification_status = 'verified'
           AND m.id != ?2
           AND m.importance > 0.1
         ORDER BY m.importance DESC
         LIMIT 10",
    )?;
    let facts = stmt
        .query_map(params![entity_id, exclude_memory], |row| {
            row.get::<_, String>(0)
        })?
        .filter_map(|r| r.ok());
    out.extend(facts);
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
