//! Consolidator
//!
//! Periodic maintenance over the memory graph: adaptive decay, rehearsal
//! boost, near-duplicate merging, reflection aggregation, pattern
//! detection, prediction generation, entity summaries, dedupe candidates,
//! optional LM rewriting, and retention cleanup. Each phase runs in its own
//! transaction so one failure cannot roll back the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use crate::config::MemoryConfig;
use crate::embeddings::cosine_similarity;
use crate::language_model::LanguageModel;
use crate::store::{now_iso, vector_from_bytes, Result, Store};

/// Reflections aggregate at a lower bar than memories merge; they are
/// already curated observations.
const REFLECTION_AGGREGATE_THRESHOLD: f32 = 0.85;

/// Rehearsal boost for memories accessed in the last 24 hours.
const ACCESS_BOOST: f64 = 1.05;

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Default, Clone, Serialize)]
pub struct DecayCounts {
    pub memories: usize,
    pub entities: usize,
    pub relationships: usize,
    pub reflections: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RetentionCounts {
    pub audit_rows: usize,
    pub predictions: usize,
    pub turns: usize,
    pub metrics: usize,
    pub documents_demoted: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ConsolidationReport {
    pub backup_path: Option<String>,
    pub decay: DecayCounts,
    pub boosted: usize,
    pub merged: usize,
    pub reflections_aggregated: usize,
    pub patterns_detected: usize,
    pub predictions_generated: usize,
    pub summaries_generated: usize,
    pub dedupe_candidates: usize,
    pub llm_memories_improved: usize,
    pub llm_predictions: usize,
    pub retention: RetentionCounts,
    pub duration_ms: u64,
}

/// A pattern surfaced by one of the detectors.
#[derive(Debug, Clone)]
pub struct DetectedPattern {
    pub name: String,
    pub description: String,
    pub pattern_type: String,
    pub confidence: f64,
    pub evidence: Vec<String>,
}

/// A proactive suggestion, reminder, warning or insight.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub content: String,
    pub prediction_type: String,
    pub priority: f64,
    pub expires_at: Option<String>,
    pub metadata: Option<Value>,
    pub pattern_name: Option<String>,
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct Consolidator {
    store: Arc<Store>,
    language_model: Arc<LanguageModel>,
    config: MemoryConfig,
}

impl Consolidator {
    pub fn new(store: Arc<Store>, language_model: Arc<LanguageModel>, config: MemoryConfig) -> Self {
        Self {
            store,
            language_model,
            config,
        }
    }

    /// Run every phase in order. Later phases observe earlier phases'
    /// commits; a failing phase logs and the rest proceed.
    pub fn run_full_consolidation(&self) -> ConsolidationReport {
        let started = Instant::now();
        let mut report = ConsolidationReport::default();

        if self.config.enable_pre_consolidation_backup {
            match self.store.backup("preconsolidation") {
                Ok(path) => report.backup_path = Some(path.display().to_string()),
                Err(e) => tracing::warn!("pre-consolidation backup failed: {}", e),
            }
        }

        match self.run_decay() {
            Ok(counts) => report.decay = counts,
            Err(e) => tracing::warn!("decay phase failed: {}", e),
        }
        match self.boost_accessed_memories() {
            Ok(count) => report.boosted = count,
            Err(e) => tracing::warn!("access boost failed: {}", e),
        }

        if self.config.enable_memory_merging {
            match self.merge_similar_memories() {
                Ok(count) => report.merged = count,
                Err(e) => tracing::warn!("memory merging failed: {}", e),
            }
        }
        match self.aggregate_reflections() {
            Ok(count) => report.reflections_aggregated = count,
            Err(e) => tracing::warn!("reflection aggregation failed: {}", e),
        }

        if let Err(e) = self.update_contact_velocity() {
            tracing::warn!("contact velocity update failed: {}", e);
        }
        match self.detect_patterns() {
            Ok(patterns) => report.patterns_detected = patterns.len(),
            Err(e) => tracing::warn!("pattern detection failed: {}", e),
        }
        match self.generate_predictions() {
            Ok(count) => report.predictions_generated = count,
            Err(e) => tracing::warn!("prediction generation failed: {}", e),
        }

        if self.config.enable_entity_summaries {
            match self.generate_entity_summaries() {
                Ok(count) => report.summaries_generated = count,
                Err(e) => tracing::warn!("entity summaries failed: {}", e),
            }
        }
        if self.config.enable_auto_dedupe {
            match self.detect_dedupe_candidates() {
                Ok(count) => report.dedupe_candidates = count,
                Err(e) => tracing::warn!("dedupe detection failed: {}", e),
            }
        }

        if self.config.enable_llm_consolidation {
            let (improved, predicted) = self.run_llm_consolidation();
            report.llm_memories_improved = improved;
            report.llm_predictions = predicted;
        }

        match self.retention_cleanup() {
            Ok(counts) => report.retention = counts,
            Err(e) => tracing::warn!("retention cleanup failed: {}", e),
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            merged = report.merged,
            patterns = report.patterns_detected,
            predictions = report.predictions_generated,
            duration_ms = report.duration_ms,
            "full consolidation complete"
        );
        report
    }

    // ------------------------------------------------------------------
    // Phase: decay and boost
    // ------------------------------------------------------------------

    /// Multiplicative daily decay. High-importance rows (> 0.7) use the
    /// slower rate `(1 + r) / 2`; importance never crosses the configured
    /// floor, and a row at exactly the floor is untouched.
    pub fn run_decay(&self) -> Result<DecayCounts> {
        let rate = self.config.decay_rate_daily;
        let slow_rate = (1.0 + rate) / 2.0;
        let floor = self.config.min_importance_threshold;
        let now = now_iso();

        self.store.transaction(|tx| {
            let mut counts = DecayCounts::default();

            counts.memories = tx.execute(
                "UPDATE memories
                 SET importance = MAX(?1, importance * ?2), updated_at = ?3
                 WHERE importance > 0.7",
                params![floor, slow_rate, now],
            )?;
            counts.memories += tx.execute(
                "UPDATE memories
                 SET importance = MAX(?1, importance * ?2), updated_at = ?3
                 WHERE importance > ?1 AND importance <= 0.7",
                params![floor, rate, now],
            )?;

            counts.entities = tx.execute(
                "UPDATE entities
                 SET importance = MAX(?1, importance * ?2), updated_at = ?3
                 WHERE importance > 0.7 AND deleted_at IS NULL",
                params![floor, slow_rate, now],
            )?;
            counts.entities += tx.execute(
                "UPDATE entities
                 SET importance = MAX(?1, importance * ?2), updated_at = ?3
                 WHERE importance > ?1 AND importance <= 0.7 AND deleted_at IS NULL",
                params![floor, rate, now],
            )?;

            counts.relationships = tx.execute(
                "UPDATE relationships
                 SET strength = MAX(0.01, strength * ?1), updated_at = ?2
                 WHERE strength > 0.01 AND invalid_at IS NULL",
                params![rate, now],
            )?;

            // Reflections decay on their own per-row rate
            counts.reflections = tx.execute(
                "UPDATE reflections
                 SET importance = MAX(0.01, importance * decay_rate), updated_at = ?1
                 WHERE importance > 0.01",
                [&now],
            )?;

            Ok(counts)
        })
    }

    /// Rehearsal effect: memories read in the last 24 hours get a small
    /// importance boost, clamped to 1.0.
    pub fn boost_accessed_memories(&self) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::hours(24)).to_rfc3339();
        let now = now_iso();
        self.store.transaction(|tx| {
            Ok(tx.execute(
                "UPDATE memories
                 SET importance = MIN(1.0, importance * ?1), updated_at = ?2
                 WHERE last_accessed_at >= ?3",
                params![ACCESS_BOOST, now, cutoff],
            )?)
        })
    }

    // ------------------------------------------------------------------
    // Phase: similarity merging
    // ------------------------------------------------------------------

    /// Merge near-duplicate memories per entity using the stored
    /// embeddings, without new provider calls. The lower-scored duplicate
    /// (importance × (1 + access_count)) is suppressed to 0.001, never
    /// deleted; the primary records `metadata.merged_from`.
    pub fn merge_similar_memories(&self) -> Result<usize> {
        let threshold = self.config.similarity_merge_threshold as f32;

        let entity_ids: Vec<i64> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT me.entity_id
                 FROM memory_entities me
                 GROUP BY me.entity_id
                 HAVING COUNT(DISTINCT me.memory_id) >= 5
                 ORDER BY COUNT(DISTINCT me.memory_id) DESC
                 LIMIT 50",
            )?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(ids)
        })?;

        let mut merged_count = 0;
        for entity_id in entity_ids {
            let memories: Vec<(i64, f64, i64, Vec<f32>)> = self.store.read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT me.memory_id, m.importance, m.access_count, emb.embedding
                     FROM memory_entities me
                     JOIN memories m ON me.memory_id = m.id
                     JOIN memory_embeddings emb ON m.id = emb.memory_id
                     WHERE me.entity_id = ?1 AND m.importance > 0.01
                       AND m.invalidated_at IS NULL
                     ORDER BY m.importance DESC",
                )?;
                let rows = stmt
                    .query_map([entity_id], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, f64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                        ))
                    })?
                    .filter_map(|r| r.ok())
                    .filter_map(|(id, imp, acc, bytes)| {
                        vector_from_bytes(&bytes).map(|v| (id, imp, acc, v))
                    })
                    .collect();
                Ok(rows)
            })?;

            if memories.len() < 2 {
                continue;
            }

            let mut already_merged: Vec<i64> = Vec::new();
            for i in 0..memories.len() {
                if already_merged.contains(&memories[i].0) {
                    continue;
                }
                for j in (i + 1)..memories.len() {
                    if already_merged.contains(&memories[j].0) {
                        continue;
                    }
                    let similarity = cosine_similarity(&memories[i].3, &memories[j].3);
                    if similarity < threshold {
                        continue;
                    }

                    let score_i = memories[i].1 * (1.0 + memories[i].2 as f64);
                    let score_j = memories[j].1 * (1.0 + memories[j].2 as f64);
                    let (primary, duplicate) = if score_i >= score_j {
                        (memories[i].0, memories[j].0)
                    } else {
                        (memories[j].0, memories[i].0)
                    };

                    self.merge_memory_pair(primary, duplicate)?;
                    already_merged.push(duplicate);
                    merged_count += 1;
                }
            }
        }

        if merged_count > 0 {
            tracing::info!("merged {} near-duplicate memory pairs", merged_count);
        }
        Ok(merged_count)
    }

    fn merge_memory_pair(&self, primary_id: i64, duplicate_id: i64) -> Result<()> {
        let now = now_iso();
        self.store.transaction(|tx| {
            // Transfer entity links
            tx.execute(
                "INSERT OR IGNORE INTO memory_entities (memory_id, entity_id, relationship)
                 SELECT ?1, entity_id, relationship FROM memory_entities WHERE memory_id = ?2",
                params![primary_id, duplicate_id],
            )?;

            // Record the merge on the primary
            let raw: Option<String> = tx
                .query_row(
                    "SELECT metadata FROM memories WHERE id = ?1",
                    [primary_id],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            let mut meta: Value = raw
                .and_then(|r| serde_json::from_str(&r).ok())
                .unwrap_or_else(|| Value::Object(Default::default()));
            let merged_from = meta
                .as_object_mut()
                .map(|map| {
                    map.entry("merged_from")
                        .or_insert_with(|| Value::Array(Vec::new()))
                })
                .and_then(|v| v.as_array_mut());
            if let Some(list) = merged_from {
                list.push(Value::from(duplicate_id));
            }
            tx.execute(
                "UPDATE memories SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
                params![meta.to_string(), now, primary_id],
            )?;

            // Suppress the duplicate; its hash and history stay for audit
            tx.execute(
                "UPDATE memories SET importance = 0.001, updated_at = ?1 WHERE id = ?2",
                params![now, duplicate_id],
            )?;

            self.store.record_audit(
                tx,
                "merge_memories",
                "memories",
                Some(duplicate_id),
                Some(&format!("merged into {}", primary_id)),
            )?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Phase: reflection aggregation
    // ------------------------------------------------------------------

    /// Aggregate semantically similar reflections of the same type,
    /// preserving the observation timeline.
    pub fn aggregate_reflections(&self) -> Result<usize> {
        let rows: Vec<(i64, String, f64, i64, String, String, Vec<f32>)> =
            self.store.read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT r.id, r.reflection_type, r.importance, r.aggregation_count,
                            r.first_observed_at, r.last_confirmed_at, re.embedding
                     FROM reflections r
                     JOIN reflection_embeddings re ON r.id = re.reflection_id
                     WHERE r.importance > 0.1
                     ORDER BY r.importance DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, Vec<u8>>(6)?,
                        ))
                    })?
                    .filter_map(|r| r.ok())
                    .filter_map(|(id, t, imp, agg, first, last, bytes)| {
                        vector_from_bytes(&bytes).map(|v| (id, t, imp, agg, first, last, v))
                    })
                    .collect();
                Ok(rows)
            })?;

        if rows.len() < 2 {
            return Ok(0);
        }

        let mut merged_count = 0;
        let mut already_merged: Vec<i64> = Vec::new();
        for i in 0..rows.len() {
            if already_merged.contains(&rows[i].0) {
                continue;
            }
            for j in (i + 1)..rows.len() {
                if already_merged.contains(&rows[j].0) {
                    continue;
                }
                if rows[i].1 != rows[j].1 {
                    continue; // same type only
                }
                let similarity = cosine_similarity(&rows[i].6, &rows[j].6);
                if similarity < REFLECTION_AGGREGATE_THRESHOLD {
                    continue;
                }

                let score_i = rows[i].3 as f64 * rows[i].2;
                let score_j = rows[j].3 as f64 * rows[j].2;
                let (primary, duplicate) = if score_i >= score_j {
                    (&rows[i], &rows[j])
                } else {
                    (&rows[j], &rows[i])
                };

                self.merge_reflection_pair(primary, duplicate)?;
                already_merged.push(duplicate.0);
                merged_count += 1;
            }
        }

        Ok(merged_count)
    }

    fn merge_reflection_pair(
        &self,
        primary: &(i64, String, f64, i64, String, String, Vec<f32>),
        duplicate: &(i64, String, f64, i64, String, String, Vec<f32>),
    ) -> Result<()> {
        let aggregation_count = primary.3 + duplicate.3;
        let first_observed = primary.4.clone().min(duplicate.4.clone());
        let last_confirmed = primary.5.clone().max(duplicate.5.clone());
        let decay_rate = if aggregation_count >= 3 { 0.9995 } else { 0.999 };
        let importance = (primary.2 + 0.05).min(1.0);
        let now = now_iso();

        self.store.transaction(|tx| {
            let raw: Option<String> = tx
                .query_row(
                    "SELECT aggregated_from FROM reflections WHERE id = ?1",
                    [primary.0],
                    |row| row.get(0),
                )
                .optional()?;
            let mut aggregated: Vec<i64> = raw
                .and_then(|r| serde_json::from_str(&r).ok())
                .unwrap_or_default();
            aggregated.push(duplicate.0);

            tx.execute(
                "UPDATE reflections
                 SET aggregation_count = ?1, first_observed_at = ?2, last_confirmed_at = ?3,
                     decay_rate = ?4, importance = ?5, aggregated_from = ?6, updated_at = ?7
                 WHERE id = ?8",
                params![
                    aggregation_count,
                    first_observed,
                    last_confirmed,
                    decay_rate,
                    importance,
                    serde_json::to_string(&aggregated).unwrap_or_else(|_| "[]".into()),
                    now,
                    primary.0,
                ],
            )?;
            tx.execute(
                "UPDATE reflections SET importance = 0.001, updated_at = ?1 WHERE id = ?2",
                params![now, duplicate.0],
            )?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Phase: contact velocity
    // ------------------------------------------------------------------

    /// Persist derived contact-velocity fields for person entities with at
    /// least three mentions: mean gap between mentions and a trend label
    /// (accelerating / stable / decelerating / dormant).
    pub fn update_contact_velocity(&self) -> Result<usize> {
        let people: Vec<i64> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT me.entity_id
                 FROM memory_entities me
                 JOIN entities e ON e.id = me.entity_id
                     AND e.type = 'person' AND e.deleted_at IS NULL
                 GROUP BY me.entity_id
                 HAVING COUNT(DISTINCT me.memory_id) >= 3",
            )?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(ids)
        })?;

        let now = Utc::now();
        let mut updated = 0;
        for entity_id in people {
            let mentions: Vec<chrono::DateTime<Utc>> = self.store.read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT m.created_at FROM memories m
                     JOIN memory_entities me ON m.id = me.memory_id
                     WHERE me.entity_id = ?1
                     ORDER BY m.created_at ASC",
                )?;
                let rows = stmt
                    .query_map([entity_id], |row| row.get::<_, String>(0))?
                    .filter_map(|r| r.ok())
                    .filter_map(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                    .map(|d| d.with_timezone(&Utc))
                    .collect();
                Ok(rows)
            })?;
            if mentions.len() < 3 {
                continue;
            }

            let gaps: Vec<f64> = mentions
                .windows(2)
                .map(|w| (w[1] - w[0]).num_seconds() as f64 / 86_400.0)
                .collect();
            let frequency = (gaps.iter().sum::<f64>() / gaps.len() as f64).max(1.0);
            let days_since = (now - *mentions.last().expect("non-empty")).num_days() as f64;

            let recent_n = gaps.len().min(3);
            let recent_mean = gaps[gaps.len() - recent_n..].iter().sum::<f64>() / recent_n as f64;
            let older = &gaps[..gaps.len() - recent_n];
            let trend = if days_since > 2.0 * frequency {
                "dormant"
            } else if older.is_empty() {
                "stable"
            } else {
                let older_mean = older.iter().sum::<f64>() / older.len() as f64;
                if recent_mean < older_mean * 0.7 {
                    "accelerating"
                } else if recent_mean > older_mean * 1.3 {
                    "decelerating"
                } else {
                    "stable"
                }
            };

            self.store.transaction(|tx| {
                tx.execute(
                    "UPDATE entities
                     SET contact_frequency_days = ?1, contact_trend = ?2
                     WHERE id = ?3",
                    params![(frequency * 10.0).round() / 10.0, trend, entity_id],
                )?;
                Ok(())
            })?;
            updated += 1;
        }

        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Phase: pattern detection
    // ------------------------------------------------------------------

    /// Run every detector and upsert the results by (name, pattern_type).
    pub fn detect_patterns(&self) -> Result<Vec<DetectedPattern>> {
        let mut patterns = Vec::new();

        patterns.extend(self.detect_cooling_relationships()?);
        patterns.extend(self.detect_overdue_commitments()?);
        patterns.extend(self.detect_communication_style()?);
        patterns.extend(self.detect_cross_entity_mentions()?);
        patterns.extend(self.detect_inferred_connections()?);
        patterns.extend(self.detect_introduction_opportunities()?);
        patterns.extend(self.detect_cluster_forming()?);
        patterns.extend(self.detect_skill_project_matches()?);
        patterns.extend(self.detect_network_bridges()?);

        for pattern in &patterns {
            self.store_pattern(pattern)?;
        }

        tracing::info!("detected {} patterns", patterns.len());
        Ok(patterns)
    }

    fn detect_cooling_relationships(&self) -> Result<Vec<DetectedPattern>> {
        let cutoff = (Utc::now() - Duration::days(30)).to_rfc3339();

        let rows: Vec<(i64, String, Option<String>)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.id, e.name, MAX(m.created_at)
                 FROM entities e
                 LEFT JOIN memory_entities me ON e.id = me.entity_id
                 LEFT JOIN memories m ON me.memory_id = m.id
                 WHERE e.type = 'person' AND e.importance > 0.3 AND e.deleted_at IS NULL
                 GROUP BY e.id
                 HAVING MAX(m.created_at) < ?1 OR MAX(m.created_at) IS NULL
                 ORDER BY e.importance DESC
                 LIMIT 20",
            )?;
            let rows = stmt
                .query_map([&cutoff], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        let now = Utc::now();
        let patterns = rows
            .into_iter()
            .map(|(id, name, last_mention)| {
                let days_since = last_mention
                    .as_deref()
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|d| (now - d.with_timezone(&Utc)).num_days());

                DetectedPattern {
                    name: format!("cooling_relationship_{}", id),
                    description: format!(
                        "No contact with {} in {} days",
                        name,
                        days_since
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| "many".into())
                    ),
                    pattern_type: "relationship".into(),
                    confidence: (0.5 + days_since.unwrap_or(30) as f64 / 100.0).min(0.9),
                    evidence: vec![format!(
                        "Last mention: {}",
                        last_mention.unwrap_or_else(|| "never".into())
                    )],
                }
            })
            .collect();

        Ok(patterns)
    }

    fn detect_overdue_commitments(&self) -> Result<Vec<DetectedPattern>> {
        let cutoff = (Utc::now() - Duration::days(7)).to_rfc3339();
        let count: i64 = self.store.read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM memories
                 WHERE type = 'commitment' AND importance > 0.5
                   AND created_at < ?1 AND invalidated_at IS NULL",
                [&cutoff],
                |row| row.get(0),
            )?)
        })?;

        if count > 3 {
            Ok(vec![DetectedPattern {
                name: "overdue_commitments".into(),
                description: format!("{} commitments older than 7 days may be overdue", count),
                pattern_type: "behavioral".into(),
                confidence: 0.7,
                evidence: vec!["Multiple old commitments detected".into()],
            }])
        } else {
            Ok(Vec::new())
        }
    }

    fn detect_communication_style(&self) -> Result<Vec<DetectedPattern>> {
        let cutoff = (Utc::now() - Duration::days(7)).to_rfc3339();
        let lengths: Vec<i64> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT LENGTH(content) FROM messages
                 WHERE role = 'user' AND created_at >= ?1
                 ORDER BY created_at DESC LIMIT 100",
            )?;
            let rows = stmt
                .query_map([&cutoff], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        if lengths.len() < 20 {
            return Ok(Vec::new());
        }

        let avg = lengths.iter().sum::<i64>() as f64 / lengths.len() as f64;
        let pattern = if avg < 50.0 {
            Some((
                "brief_communication_style",
                "User tends to communicate in brief messages",
            ))
        } else if avg > 200.0 {
            Some((
                "detailed_communication_style",
                "User tends to provide detailed context",
            ))
        } else {
            None
        };

        Ok(pattern
            .map(|(name, description)| {
                vec![DetectedPattern {
                    name: name.into(),
                    description: description.into(),
                    pattern_type: "communication".into(),
                    confidence: 0.6,
                    evidence: vec![format!("Average message length: {:.0} characters", avg)],
                }]
            })
            .unwrap_or_default())
    }

    fn detect_cross_entity_mentions(&self) -> Result<Vec<DetectedPattern>> {
        let co_mentions: Vec<(i64, String, i64, String, i64)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e1.id, e1.name, e2.id, e2.name,
                        COUNT(DISTINCT me1.memory_id) as co_count
                 FROM memory_entities me1
                 JOIN memory_entities me2
                     ON me1.memory_id = me2.memory_id AND me1.entity_id < me2.entity_id
                 JOIN entities e1 ON me1.entity_id = e1.id
                     AND e1.type = 'person' AND e1.deleted_at IS NULL
                 JOIN entities e2 ON me2.entity_id = e2.id
                     AND e2.type = 'person' AND e2.deleted_at IS NULL
                 GROUP BY me1.entity_id, me2.entity_id
                 HAVING co_count >= 2
                 ORDER BY co_count DESC
                 LIMIT 20",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        let mut patterns = Vec::new();
        for (id1, name1, id2, name2, co_count) in co_mentions {
            if self.relationship_exists(id1, id2)? {
                continue;
            }
            patterns.push(DetectedPattern {
                name: format!("cross_entity_{}_{}", id1, id2),
                description: format!(
                    "{} and {} appear together in {} memories. Are they connected?",
                    name1, name2, co_count
                ),
                pattern_type: "relationship".into(),
                confidence: (0.4 + co_count as f64 * 0.1).min(0.9),
                evidence: vec![format!("Co-mentioned in {} memories", co_count)],
            });
        }
        Ok(patterns)
    }

    /// Attribute-based inference between two entities: shared company is a
    /// strong tie, shared community medium, same city + industry weak.
    fn infer_connection(&self, a_meta: &Value, b_meta: &Value) -> Option<(&'static str, f64)> {
        let company_a = a_meta["company"].as_str().map(|s| s.to_lowercase());
        let company_b = b_meta["company"].as_str().map(|s| s.to_lowercase());
        if let (Some(a), Some(b)) = (company_a, company_b) {
            if a == b && !a.is_empty() {
                return Some(("colleagues", 0.9));
            }
        }

        let communities = |meta: &Value| -> Vec<String> {
            meta["communities"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str())
                        .map(|s| s.to_lowercase())
                        .collect()
                })
                .unwrap_or_default()
        };
        let shared_communities = communities(a_meta)
            .iter()
            .any(|c| communities(b_meta).contains(c));
        if shared_communities {
            return Some(("community_connection", 0.6));
        }

        let city = |meta: &Value| {
            meta["geography"]["city"]
                .as_str()
                .map(|s| s.to_lowercase())
                .unwrap_or_default()
        };
        let industries = |meta: &Value| -> Vec<String> {
            meta["industries"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str())
                        .map(|s| s.to_lowercase())
                        .collect()
                })
                .unwrap_or_default()
        };
        let shared_industry = industries(a_meta)
            .iter()
            .any(|i| industries(b_meta).contains(i));

        let city_a = city(a_meta);
        if !city_a.is_empty() && city_a == city(b_meta) && shared_industry {
            return Some(("likely_connected", 0.3));
        }
        if shared_industry {
            return Some(("industry_peers", 0.2));
        }
        None
    }

    fn people_with_metadata(&self, min_importance: f64, limit: i64) -> Result<Vec<(i64, String, Value)>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, metadata FROM entities
                 WHERE type = 'person' AND importance > ?1
                   AND metadata IS NOT NULL AND deleted_at IS NULL
                 ORDER BY importance DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![min_importance, limit], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .filter_map(|r| r.ok())
                .filter_map(|(id, name, raw)| {
                    serde_json::from_str(&raw).ok().map(|meta| (id, name, meta))
                })
                .collect();
            Ok(rows)
        })
    }

    fn relationship_exists(&self, a: i64, b: i64) -> Result<bool> {
        self.store.read(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT id FROM relationships
                     WHERE (source_entity_id = ?1 AND target_entity_id = ?2)
                        OR (source_entity_id = ?2 AND target_entity_id = ?1)
                     LIMIT 1",
                    params![a, b],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    fn detect_inferred_connections(&self) -> Result<Vec<DetectedPattern>> {
        let people = self.people_with_metadata(0.2, 100)?;
        let mut patterns = Vec::new();

        for i in 0..people.len() {
            for j in (i + 1)..people.len() {
                if self.relationship_exists(people[i].0, people[j].0)? {
                    continue;
                }
                if let Some((rel_type, confidence)) =
                    self.infer_connection(&people[i].2, &people[j].2)
                {
                    patterns.push(DetectedPattern {
                        name: format!("inferred_connection_{}_{}", people[i].0, people[j].0),
                        description: format!(
                            "{} and {} may be connected ({})",
                            people[i].1, people[j].1, rel_type
                        ),
                        pattern_type: "relationship".into(),
                        confidence,
                        evidence: vec![format!("Inferred relationship type: {}", rel_type)],
                    });
                }
            }
        }
        Ok(patterns)
    }

    fn detect_introduction_opportunities(&self) -> Result<Vec<DetectedPattern>> {
        let people = self.people_with_metadata(0.3, 50)?;
        let mut patterns = Vec::new();

        'outer: for i in 0..people.len() {
            for j in (i + 1)..people.len() {
                if patterns.len() >= 10 {
                    break 'outer;
                }
                if self.relationship_exists(people[i].0, people[j].0)? {
                    continue;
                }
                let Some((rel_type, confidence)) =
                    self.infer_connection(&people[i].2, &people[j].2)
                else {
                    continue;
                };
                if confidence < 0.5 {
                    continue;
                }

                let reason = match rel_type {
                    "colleagues" => people[i].2["company"]
                        .as_str()
                        .map(|c| format!("both at {}", c))
                        .unwrap_or_else(|| rel_type.to_string()),
                    _ => rel_type.to_string(),
                };
                patterns.push(DetectedPattern {
                    name: format!("intro_opportunity_{}_{}", people[i].0, people[j].0),
                    description: format!(
                        "{} and {} might benefit from meeting ({})",
                        people[i].1, people[j].1, reason
                    ),
                    pattern_type: "relationship".into(),
                    confidence,
                    evidence: vec![format!("Shared attributes suggest connection: {}", rel_type)],
                });
            }
        }
        Ok(patterns)
    }

    fn detect_cluster_forming(&self) -> Result<Vec<DetectedPattern>> {
        let cutoff = (Utc::now() - Duration::days(30)).to_rfc3339();
        let groups: Vec<String> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT GROUP_CONCAT(e.name)
                 FROM memories m
                 JOIN memory_entities me ON m.id = me.memory_id
                 JOIN entities e ON me.entity_id = e.id
                     AND e.type = 'person' AND e.deleted_at IS NULL
                 WHERE m.created_at >= ?1
                 GROUP BY m.id
                 HAVING COUNT(DISTINCT e.id) >= 3
                 ORDER BY m.created_at DESC
                 LIMIT 50",
            )?;
            let rows = stmt
                .query_map([&cutoff], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        // Count recurrence of each sorted people-set
        let mut counts: HashMap<Vec<String>, usize> = HashMap::new();
        for group in groups {
            let mut people: Vec<String> =
                group.split(',').map(|s| s.trim().to_string()).collect();
            people.sort();
            people.dedup();
            *counts.entry(people).or_default() += 1;
        }

        let mut recurring: Vec<(Vec<String>, usize)> = counts
            .into_iter()
            .filter(|(_, count)| *count >= 2)
            .collect();
        recurring.sort_by(|a, b| b.1.cmp(&a.1));
        recurring.truncate(5);

        let patterns = recurring
            .into_iter()
            .map(|(people, count)| {
                let mut shown = people
                    .iter()
                    .take(3)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ");
                if people.len() > 3 {
                    shown.push_str(&format!(" and {} others", people.len() - 3));
                }
                let slug = people
                    .iter()
                    .take(3)
                    .filter_map(|p| p.split_whitespace().next())
                    .map(|p| p.to_lowercase())
                    .collect::<Vec<_>>()
                    .join("_");
                DetectedPattern {
                    name: format!("cluster_forming_{}", slug),
                    description: format!(
                        "You're frequently mentioning {} together ({} times recently)",
                        shown, count
                    ),
                    pattern_type: "behavioral".into(),
                    confidence: (0.5 + count as f64 * 0.1).min(0.9),
                    evidence: vec![format!(
                        "Co-mentioned in {} memories in the last 30 days",
                        count
                    )],
                }
            })
            .collect();

        Ok(patterns)
    }

    fn detect_skill_project_matches(&self) -> Result<Vec<DetectedPattern>> {
        let projects: Vec<(i64, String, String, Value)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, COALESCE(description, ''), COALESCE(metadata, '{}')
                 FROM entities
                 WHERE type = 'project' AND importance > 0.2 AND deleted_at IS NULL
                 ORDER BY importance DESC LIMIT 20",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .filter_map(|r| r.ok())
                .map(|(id, name, desc, raw)| {
                    let meta = serde_json::from_str(&raw).unwrap_or(Value::Null);
                    (id, name, desc.to_lowercase(), meta)
                })
                .collect();
            Ok(rows)
        })?;

        let people = self.people_with_metadata(0.3, 50)?;
        let mut patterns = Vec::new();

        'outer: for (project_id, project_name, description, project_meta) in &projects {
            let project_industries: Vec<String> = project_meta["industries"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str())
                        .map(|s| s.to_lowercase())
                        .collect()
                })
                .unwrap_or_default();

            for (person_id, person_name, person_meta) in &people {
                if patterns.len() >= 10 {
                    break 'outer;
                }
                if self.relationship_exists(*person_id, *project_id)? {
                    continue;
                }

                let person_industries: Vec<String> = person_meta["industries"]
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str())
                            .map(|s| s.to_lowercase())
                            .collect()
                    })
                    .unwrap_or_default();
                let shared: Vec<&String> = project_industries
                    .iter()
                    .filter(|i| person_industries.contains(i))
                    .collect();

                if !shared.is_empty() {
                    let shared_list = shared
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    patterns.push(DetectedPattern {
                        name: format!("skill_project_match_{}_{}", person_id, project_id),
                        description: format!(
                            "{} might be valuable for {} (shares {} expertise)",
                            person_name, project_name, shared_list
                        ),
                        pattern_type: "opportunity".into(),
                        confidence: 0.6,
                        evidence: vec![format!("Shared industries: {}", shared_list)],
                    });
                    continue;
                }

                let role = person_meta["role"]
                    .as_str()
                    .map(|s| s.to_lowercase())
                    .unwrap_or_default();
                if !role.is_empty() && description.contains(&role) {
                    patterns.push(DetectedPattern {
                        name: format!("skill_project_match_{}_{}", person_id, project_id),
                        description: format!(
                            "{} ({}) might be valuable for {}",
                            person_name, role, project_name
                        ),
                        pattern_type: "opportunity".into(),
                        confidence: 0.5,
                        evidence: vec![format!(
                            "Role '{}' mentioned in project description",
                            role
                        )],
                    });
                }
            }
        }
        Ok(patterns)
    }

    fn detect_network_bridges(&self) -> Result<Vec<DetectedPattern>> {
        let hubs: Vec<(i64, String, i64)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.id, e.name, COUNT(DISTINCT r.id) as connection_count
                 FROM entities e
                 JOIN relationships r
                     ON (e.id = r.source_entity_id OR e.id = r.target_entity_id)
                     AND r.strength > 0.2 AND r.invalid_at IS NULL
                 WHERE e.type = 'person' AND e.importance > 0.4 AND e.deleted_at IS NULL
                 GROUP BY e.id
                 HAVING connection_count >= 5
                 ORDER BY connection_count DESC
                 LIMIT 10",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        let mut patterns = Vec::new();
        for (hub_id, hub_name, _) in hubs {
            let neighbors: Vec<i64> = self.store.read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT CASE WHEN r.source_entity_id = ?1
                                          THEN r.target_entity_id ELSE r.source_entity_id END
                     FROM relationships r
                     JOIN entities e ON e.id = CASE WHEN r.source_entity_id = ?1
                                                    THEN r.target_entity_id
                                                    ELSE r.source_entity_id END
                     WHERE (r.source_entity_id = ?1 OR r.target_entity_id = ?1)
                       AND r.strength > 0.2 AND r.invalid_at IS NULL
                       AND e.type = 'person' AND e.deleted_at IS NULL",
                )?;
                let rows = stmt
                    .query_map([hub_id], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })?;

            if neighbors.len() < 4 {
                continue;
            }

            let interconnections: i64 = self.store.read(|conn| {
                let placeholders = neighbors.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
                let sql = format!(
                    "SELECT COUNT(*) FROM relationships
                     WHERE source_entity_id IN ({ph}) AND target_entity_id IN ({ph})
                       AND strength > 0.2 AND invalid_at IS NULL",
                    ph = placeholders
                );
                let mut stmt = conn.prepare(&sql)?;
                let bound: Vec<&dyn rusqlite::ToSql> = neighbors
                    .iter()
                    .chain(neighbors.iter())
                    .map(|id| id as &dyn rusqlite::ToSql)
                    .collect();
                Ok(stmt.query_row(&bound[..], |row| row.get(0))?)
            })?;

            let max_possible = (neighbors.len() * (neighbors.len() - 1) / 2) as f64;
            if max_possible > 0.0 && (interconnections as f64 / max_possible) < 0.2 {
                let half = neighbors.len() / 2;
                patterns.push(DetectedPattern {
                    name: format!("network_bridge_{}", hub_id),
                    description: format!(
                        "{} bridges distinct groups ({} and {} people who don't know each other)",
                        hub_name,
                        half,
                        neighbors.len() - half
                    ),
                    pattern_type: "opportunity".into(),
                    confidence: 0.7,
                    evidence: vec![format!(
                        "Only {} connections among {} neighbors",
                        interconnections,
                        neighbors.len()
                    )],
                });
            }
        }
        Ok(patterns)
    }

    /// Upsert a pattern by (name, type): occurrences accumulate, confidence
    /// averages toward the new observation, evidence is replaced.
    fn store_pattern(&self, pattern: &DetectedPattern) -> Result<i64> {
        let now = now_iso();
        self.store.transaction(|tx| {
            let existing: Option<(i64, i64, f64)> = tx
                .query_row(
                    "SELECT id, occurrences, confidence FROM patterns
                     WHERE name = ?1 AND pattern_type = ?2",
                    params![pattern.name, pattern.pattern_type],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let evidence =
                serde_json::to_string(&pattern.evidence).unwrap_or_else(|_| "[]".into());
            match existing {
                Some((id, occurrences, confidence)) => {
                    let blended = ((confidence + pattern.confidence) / 2.0).min(1.0);
                    tx.execute(
                        "UPDATE patterns
                         SET occurrences = ?1, confidence = ?2,
                             last_observed_at = ?3, evidence = ?4, description = ?5
                         WHERE id = ?6",
                        params![
                            occurrences + 1,
                            blended,
                            now,
                            evidence,
                            pattern.description,
                            id
                        ],
                    )?;
                    Ok(id)
                }
                None => {
                    tx.execute(
                        "INSERT INTO patterns (
                            name, pattern_type, description, occurrences, confidence,
                            evidence, first_observed_at, last_observed_at, is_active
                        ) VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?6, 1)",
                        params![
                            pattern.name,
                            pattern.pattern_type,
                            pattern.description,
                            pattern.confidence,
                            evidence,
                            now
                        ],
                    )?;
                    Ok(tx.last_insert_rowid())
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Phase: prediction generation
    // ------------------------------------------------------------------

    /// Emit predictions from high-confidence active patterns. Priority is
    /// scaled by the act-on ratio of past predictions of the same type. An
    /// unshown, unexpired prediction for the same pattern is not repeated.
    pub fn generate_predictions(&self) -> Result<usize> {
        let mut predictions = Vec::new();
        predictions.extend(self.reconnect_predictions()?);
        predictions.extend(self.commitment_reminders()?);
        predictions.extend(self.pattern_insights()?);

        let mut stored = 0;
        for prediction in predictions {
            if let Some(pattern_name) = &prediction.pattern_name {
                if self.pending_prediction_exists(pattern_name)? {
                    continue;
                }
            }
            self.store_prediction(&prediction)?;
            stored += 1;
        }

        tracing::info!("generated {} predictions", stored);
        Ok(stored)
    }

    fn pending_prediction_exists(&self, pattern_name: &str) -> Result<bool> {
        let now = now_iso();
        self.store.read(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT id FROM predictions
                     WHERE prediction_pattern_name = ?1 AND is_shown = 0
                       AND (expires_at IS NULL OR expires_at > ?2)
                     LIMIT 1",
                    params![pattern_name, now],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    fn reconnect_predictions(&self) -> Result<Vec<Prediction>> {
        let patterns: Vec<(i64, String, String, f64)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, confidence FROM patterns
                 WHERE pattern_type = 'relationship' AND is_active = 1 AND confidence > 0.5
                 ORDER BY confidence DESC LIMIT 5",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        let mut predictions = Vec::new();
        for (pattern_id, name, description, confidence) in patterns {
            let feedback = self.feedback_multiplier("suggestion")?;
            predictions.push(Prediction {
                content: description,
                prediction_type: "suggestion".into(),
                priority: confidence * feedback,
                expires_at: Some((Utc::now() + Duration::days(7)).to_rfc3339()),
                metadata: Some(serde_json::json!({ "pattern_id": pattern_id })),
                pattern_name: Some(name),
            });
        }
        Ok(predictions)
    }

    fn commitment_reminders(&self) -> Result<Vec<Prediction>> {
        let commitments: Vec<(i64, String, String)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, content, created_at FROM memories
                 WHERE type = 'commitment' AND importance > 0.3 AND invalidated_at IS NULL
                 ORDER BY created_at ASC LIMIT 5",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        let now = Utc::now();
        let mut predictions = Vec::new();
        for (memory_id, content, created_at) in commitments {
            let days_old = chrono::DateTime::parse_from_rfc3339(&created_at)
                .map(|d| (now - d.with_timezone(&Utc)).num_days())
                .unwrap_or(0);
            if days_old <= 3 {
                continue;
            }

            let pattern_name = format!("commitment_reminder_{}", memory_id);
            let feedback = self.feedback_multiplier("reminder")?;
            let snippet: String = content.chars().take(100).collect();
            predictions.push(Prediction {
                content: format!("Commitment from {} days ago: {}", days_old, snippet),
                prediction_type: "reminder".into(),
                priority: (0.5 + days_old as f64 / 14.0).min(1.0) * feedback,
                expires_at: Some((now + Duration::days(2)).to_rfc3339()),
                metadata: Some(serde_json::json!({ "memory_id": memory_id })),
                pattern_name: Some(pattern_name),
            });
        }
        Ok(predictions)
    }

    fn pattern_insights(&self) -> Result<Vec<Prediction>> {
        let patterns: Vec<(i64, String, String, f64)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, confidence FROM patterns
                 WHERE is_active = 1 AND confidence > 0.7 AND occurrences > 2
                   AND pattern_type = 'behavioral'
                 ORDER BY confidence DESC LIMIT 3",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        let mut predictions = Vec::new();
        for (pattern_id, name, description, confidence) in patterns {
            let feedback = self.feedback_multiplier("insight")?;
            predictions.push(Prediction {
                content: format!("Pattern noticed: {}", description),
                prediction_type: "insight".into(),
                priority: confidence * 0.8 * feedback,
                expires_at: Some((Utc::now() + Duration::days(14)).to_rfc3339()),
                metadata: Some(serde_json::json!({ "pattern_id": pattern_id })),
                pattern_name: Some(name),
            });
        }
        Ok(predictions)
    }

    /// Priority multiplier from past engagement with this prediction type:
    /// under 5 shown → 1.0; act ratio < 0.1 → 0.5; > 0.5 → 1.25; else 1.0.
    fn feedback_multiplier(&self, prediction_type: &str) -> Result<f64> {
        let (total, acted): (i64, i64) = self.store.read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(is_acted_on), 0)
                 FROM predictions
                 WHERE prediction_type = ?1 AND is_shown = 1",
                [prediction_type],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?)
        })?;

        if total < 5 {
            return Ok(1.0);
        }
        let ratio = acted as f64 / total as f64;
        Ok(if ratio < 0.1 {
            0.5
        } else if ratio > 0.5 {
            1.25
        } else {
            1.0
        })
    }

    fn store_prediction(&self, prediction: &Prediction) -> Result<i64> {
        self.store.transaction(|tx| {
            tx.execute(
                "INSERT INTO predictions (
                    content, prediction_type, priority, expires_at,
                    is_shown, is_acted_on, prediction_pattern_name, created_at, metadata
                ) VALUES (?1, ?2, ?3, ?4, 0, 0, ?5, ?6, ?7)",
                params![
                    prediction.content,
                    prediction.prediction_type,
                    prediction.priority,
                    prediction.expires_at,
                    prediction.pattern_name,
                    now_iso(),
                    prediction.metadata.as_ref().map(|m| m.to_string()),
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Active, unexpired predictions for display.
    pub fn get_predictions(
        &self,
        limit: usize,
        prediction_types: &[String],
        include_shown: bool,
    ) -> Result<Vec<Value>> {
        let now = now_iso();
        self.store.read(|conn| {
            let mut sql = String::from(
                "SELECT id, content, prediction_type, priority, expires_at,
                        is_shown, is_acted_on, prediction_pattern_name, created_at
                 FROM predictions
                 WHERE (expires_at IS NULL OR expires_at > ?1)",
            );
            let mut bound: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now)];
            if !include_shown {
                sql.push_str(" AND is_shown = 0");
            }
            if !prediction_types.is_empty() {
                let placeholders = prediction_types
                    .iter()
                    .map(|_| "?")
                    .collect::<Vec<_>>()
                    .join(", ");
                sql.push_str(&format!(" AND prediction_type IN ({})", placeholders));
                for t in prediction_types {
                    bound.push(Box::new(t.clone()));
                }
            }
            sql.push_str(" ORDER BY priority DESC, created_at DESC LIMIT ?");
            bound.push(Box::new(limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let refs: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
            let rows = stmt
                .query_map(&refs[..], |row| {
                    Ok(serde_json::json!({
                        "id": row.get::<_, i64>(0)?,
                        "content": row.get::<_, String>(1)?,
                        "type": row.get::<_, String>(2)?,
                        "priority": row.get::<_, f64>(3)?,
                        "expires_at": row.get::<_, Option<String>>(4)?,
                        "is_shown": row.get::<_, i64>(5)? != 0,
                        "is_acted_on": row.get::<_, i64>(6)? != 0,
                        "pattern_name": row.get::<_, Option<String>>(7)?,
                        "created_at": row.get::<_, String>(8)?,
                    }))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    pub fn mark_prediction_shown(&self, prediction_id: i64) -> Result<()> {
        self.store.transaction(|tx| {
            tx.execute(
                "UPDATE predictions SET is_shown = 1, shown_at = ?1 WHERE id = ?2",
                params![now_iso(), prediction_id],
            )?;
            Ok(())
        })
    }

    pub fn mark_prediction_acted_on(&self, prediction_id: i64, acted_on: bool) -> Result<()> {
        self.store.transaction(|tx| {
            tx.execute(
                "UPDATE predictions SET is_acted_on = ?1 WHERE id = ?2",
                params![acted_on as i64, prediction_id],
            )?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Phase: entity summaries
    // ------------------------------------------------------------------

    /// Compose a concise cached paragraph for entities with enough linked
    /// memories and no fresh summary.
    pub fn generate_entity_summaries(&self) -> Result<usize> {
        let min_memories = self.config.entity_summary_min_memories as i64;
        let stale_cutoff =
            (Utc::now() - Duration::days(self.config.entity_summary_max_age_days)).to_rfc3339();

        let entities: Vec<(i64, String, i64)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.id, e.name, COUNT(DISTINCT me.memory_id) as mem_count
                 FROM entities e
                 JOIN memory_entities me ON e.id = me.entity_id
                 LEFT JOIN entity_summaries es ON es.entity_id = e.id
                 WHERE e.deleted_at IS NULL
                 GROUP BY e.id
                 HAVING mem_count >= ?1
                    AND (es.generated_at IS NULL OR es.generated_at < ?2)
                 LIMIT 25",
            )?;
            let rows = stmt
                .query_map(params![min_memories, stale_cutoff], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        let mut generated = 0;
        for (entity_id, name, memory_count) in entities {
            let top_memories: Vec<String> = self.store.read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT m.content FROM memories m
                     JOIN memory_entities me ON m.id = me.memory_id
                     WHERE me.entity_id = ?1 AND m.invalidated_at IS NULL
                     ORDER BY m.importance DESC LIMIT 5",
                )?;
                let rows = stmt
                    .query_map([entity_id], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })?;
            let relationships: Vec<(String, String)> = self.store.read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT r.relationship_type,
                            CASE WHEN r.source_entity_id = ?1 THEN t.name ELSE s.name END
                     FROM relationships r
                     JOIN entities s ON s.id = r.source_entity_id
                     JOIN entities t ON t.id = r.target_entity_id
                     WHERE (r.source_entity_id = ?1 OR r.target_entity_id = ?1)
                       AND r.invalid_at IS NULL
                     ORDER BY r.strength DESC LIMIT 5",
                )?;
                let rows = stmt
                    .query_map([entity_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })?;

            let mut summary = format!("{}: ", name);
            summary.push_str(&top_memories.join(" "));
            if !relationships.is_empty() {
                let rel_text = relationships
                    .iter()
                    .map(|(t, other)| format!("{} {}", t.replace('_', " "), other))
                    .collect::<Vec<_>>()
                    .join(", ");
                summary.push_str(&format!(" Relationships: {}.", rel_text));
            }

            self.store.transaction(|tx| {
                tx.execute(
                    "INSERT OR REPLACE INTO entity_summaries
                        (entity_id, summary, memory_count, generated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![entity_id, summary, memory_count, now_iso()],
                )?;
                Ok(())
            })?;
            generated += 1;
        }

        Ok(generated)
    }

    // ------------------------------------------------------------------
    // Phase: auto-dedupe candidates
    // ------------------------------------------------------------------

    /// Surface likely duplicate entity pairs for human approval: alias
    /// overlap or embedding similarity over the configured threshold.
    /// Never merges automatically.
    pub fn detect_dedupe_candidates(&self) -> Result<usize> {
        let mut candidates: Vec<(i64, i64, String)> = Vec::new();

        // Alias overlap: one entity's canonical name is another's alias
        let alias_pairs: Vec<(i64, i64)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT e.id, ea.entity_id
                 FROM entities e
                 JOIN entity_aliases ea ON ea.canonical_alias = e.canonical_name
                     AND ea.entity_id != e.id
                 JOIN entities owner ON owner.id = ea.entity_id AND owner.deleted_at IS NULL
                 WHERE e.deleted_at IS NULL",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;
        for (a, b) in alias_pairs {
            let (low, high) = if a < b { (a, b) } else { (b, a) };
            candidates.push((low, high, "alias overlap".into()));
        }

        // Embedding similarity over live entities
        let threshold = self.config.auto_dedupe_threshold as f32;
        let embedded: Vec<(i64, Vec<f32>)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ee.entity_id, ee.embedding
                 FROM entity_embeddings ee
                 JOIN entities e ON e.id = ee.entity_id AND e.deleted_at IS NULL",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .filter_map(|r| r.ok())
                .filter_map(|(id, bytes)| vector_from_bytes(&bytes).map(|v| (id, v)))
                .collect();
            Ok(rows)
        })?;
        for i in 0..embedded.len() {
            for j in (i + 1)..embedded.len() {
                if cosine_similarity(&embedded[i].1, &embedded[j].1) >= threshold {
                    let (low, high) = if embedded[i].0 < embedded[j].0 {
                        (embedded[i].0, embedded[j].0)
                    } else {
                        (embedded[j].0, embedded[i].0)
                    };
                    candidates.push((low, high, "embedding similarity".into()));
                }
            }
        }

        candidates.sort();
        candidates.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1);

        let count = candidates.len();
        for (a, b, reason) in candidates {
            let names: (String, String) = self.store.read(|conn| {
                let name_a: String = conn.query_row(
                    "SELECT name FROM entities WHERE id = ?1",
                    [a],
                    |row| row.get(0),
                )?;
                let name_b: String = conn.query_row(
                    "SELECT name FROM entities WHERE id = ?1",
                    [b],
                    |row| row.get(0),
                )?;
                Ok((name_a, name_b))
            })?;
            self.store_pattern(&DetectedPattern {
                name: format!("dedupe_candidate_{}_{}", a, b),
                description: format!(
                    "'{}' and '{}' look like the same entity ({}). Approve a merge?",
                    names.0, names.1, reason
                ),
                pattern_type: "dedupe_candidate".into(),
                confidence: 0.8,
                evidence: vec![reason],
            })?;
        }

        Ok(count)
    }

    // ------------------------------------------------------------------
    // Phase: LM consolidation (optional)
    // ------------------------------------------------------------------

    /// Rewrite a bounded batch of high-importance memories for concision
    /// and generate structured suggestions. A no-op when the LM is absent.
    pub fn run_llm_consolidation(&self) -> (usize, usize) {
        if !self.language_model.is_available() {
            tracing::info!("LM consolidation skipped: no language model available");
            return (0, 0);
        }

        let improved = self.improve_memory_summaries().unwrap_or_else(|e| {
            tracing::warn!("memory rewriting failed: {}", e);
            0
        });
        let predicted = self.generate_llm_predictions().unwrap_or_else(|e| {
            tracing::warn!("LM prediction generation failed: {}", e);
            0
        });
        (improved, predicted)
    }

    fn improve_memory_summaries(&self) -> Result<usize> {
        let batch_size = self.config.llm_consolidation_batch_size;
        let rows: Vec<(i64, String, Option<String>)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, content, metadata FROM memories
                 WHERE importance > 0.3 AND invalidated_at IS NULL
                 ORDER BY importance DESC, created_at DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([(batch_size * 3) as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        let mut improved = 0;
        for (id, content, metadata) in rows {
            if improved >= batch_size {
                break;
            }
            let mut meta: Value = metadata
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_else(|| Value::Object(Default::default()));
            if meta["llm_improved"].as_bool().unwrap_or(false) {
                continue;
            }

            let prompt = format!(
                "Rewrite this memory to be more concise and clear. \
                 Keep all facts. Return only the rewritten text, nothing else.\n\n\
                 Original: {}",
                content
            );
            let Some(rewritten) = self.language_model.generate(&prompt, 0.1, false) else {
                continue;
            };
            if rewritten.trim().len() <= 10 {
                continue;
            }

            if let Some(map) = meta.as_object_mut() {
                map.insert("original_content".into(), Value::from(content.clone()));
                map.insert("llm_improved".into(), Value::from(true));
            }
            self.store.transaction(|tx| {
                tx.execute(
                    "UPDATE memories SET content = ?1, metadata = ?2, updated_at = ?3
                     WHERE id = ?4",
                    params![rewritten.trim(), meta.to_string(), now_iso(), id],
                )?;
                Ok(())
            })?;
            improved += 1;
        }
        Ok(improved)
    }

    fn generate_llm_predictions(&self) -> Result<usize> {
        let rows: Vec<(String, String, Option<String>)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.content, m.type, GROUP_CONCAT(e.name)
                 FROM memories m
                 LEFT JOIN memory_entities me ON m.id = me.memory_id
                 LEFT JOIN entities e ON me.entity_id = e.id
                 WHERE m.importance > 0.3 AND m.invalidated_at IS NULL
                 GROUP BY m.id
                 ORDER BY m.created_at DESC LIMIT 20",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        if rows.is_empty() {
            return Ok(0);
        }

        let memory_lines = rows
            .iter()
            .map(|(content, memory_type, entities)| {
                format!(
                    "- [{}] {} (entities: {})",
                    memory_type,
                    content,
                    entities.as_deref().unwrap_or("none")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Based on these recent memories, generate 1-3 actionable suggestions \
             for the user. Each suggestion should be something they should do, \
             follow up on, or be aware of.\n\nMemories:\n{}\n\n\
             Return a JSON array of objects with 'content' (string) and \
             'priority' (float 0-1) fields. Example:\n\
             [{{\"content\": \"Follow up with Sarah about the proposal\", \"priority\": 0.8}}]\n\n\
             JSON:",
            memory_lines
        );

        let Some(raw) = self.language_model.generate(&prompt, 0.3, true) else {
            return Ok(0);
        };
        let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw.trim()) else {
            tracing::debug!("LM returned invalid JSON for predictions");
            return Ok(0);
        };

        let mut count = 0;
        for item in items {
            let Some(content) = item["content"].as_str() else {
                continue;
            };
            let priority = item["priority"].as_f64().unwrap_or(0.5).clamp(0.0, 1.0);
            self.store_prediction(&Prediction {
                content: content.to_string(),
                prediction_type: "suggestion".into(),
                priority,
                expires_at: Some((Utc::now() + Duration::days(7)).to_rfc3339()),
                metadata: Some(serde_json::json!({ "source": "llm_consolidation" })),
                pattern_name: None,
            })?;
            count += 1;
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Phase: retention cleanup
    // ------------------------------------------------------------------

    /// Delete aged operational rows and demote stale documents.
    pub fn retention_cleanup(&self) -> Result<RetentionCounts> {
        let now = Utc::now();
        let audit_cutoff =
            (now - Duration::days(self.config.audit_log_retention_days)).to_rfc3339();
        let prediction_cutoff =
            (now - Duration::days(self.config.prediction_retention_days)).to_rfc3339();
        let turn_cutoff =
            (now - Duration::days(self.config.turn_buffer_retention_days)).to_rfc3339();
        let metrics_cutoff =
            (now - Duration::days(self.config.metrics_retention_days)).to_rfc3339();
        let dormant_cutoff =
            (now - Duration::days(self.config.document_dormant_days)).to_rfc3339();
        let archive_cutoff =
            (now - Duration::days(self.config.document_archive_days)).to_rfc3339();
        let now_str = now.to_rfc3339();

        self.store.transaction(|tx| {
            let mut counts = RetentionCounts::default();

            counts.audit_rows = tx.execute(
                "DELETE FROM audit_log WHERE created_at < ?1",
                [&audit_cutoff],
            )?;
            counts.predictions = tx.execute(
                "DELETE FROM predictions
                 WHERE expires_at IS NOT NULL AND expires_at < ?1",
                [&prediction_cutoff],
            )?;
            counts.turns = tx.execute(
                "DELETE FROM turn_buffer WHERE created_at < ?1",
                [&turn_cutoff],
            )?;
            counts.metrics = tx.execute(
                "DELETE FROM metrics WHERE recorded_at < ?1",
                [&metrics_cutoff],
            )?;

            counts.documents_demoted = tx.execute(
                "UPDATE documents SET lifecycle_state = 'dormant', updated_at = ?1
                 WHERE lifecycle_state = 'active'
                   AND COALESCE(last_accessed_at, created_at) < ?2",
                params![now_str, dormant_cutoff],
            )?;
            counts.documents_demoted += tx.execute(
                "UPDATE documents SET lifecycle_state = 'archived', updated_at = ?1
                 WHERE lifecycle_state = 'dormant'
                   AND COALESCE(last_accessed_at, created_at) < ?2",
                params![now_str, archive_cutoff],
            )?;

            Ok(counts)
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::embeddings::EmbeddingClient;
    use crate::remember::{FactInput, Remember};
    use crate::store::EmbeddingTable;

    fn services() -> (Remember, Consolidator, Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = MemoryConfig::default();
        config.ollama_host = "http://127.0.0.1:1".to_string();
        config.language_model = String::new();
        let store = Arc::new(Store::open_at(&dir.path().join("test.db"), &config).unwrap());
        let embeddings = Arc::new(EmbeddingClient::new(&config));
        let remember = Remember::new(store.clone(), embeddings);
        let lm = Arc::new(LanguageModel::new(&config));
        let consolidator = Consolidator::new(store.clone(), lm, config);
        (remember, consolidator, store, dir)
    }

    fn memory_importance(store: &Store, id: i64) -> f64 {
        store
            .read(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT importance FROM memories WHERE id = ?1",
                        [id],
                        |r| r.get(0),
                    )
                    .unwrap())
            })
            .unwrap()
    }

    #[test]
    fn decay_reduces_importance_but_never_crosses_floor() {
        let (remember, consolidator, store, _dir) = services();

        let outcome = remember
            .remember_fact(FactInput::new("Important fact to decay").importance(0.9))
            .unwrap();

        let before = memory_importance(&store, outcome.memory_id);
        consolidator.run_decay().unwrap();
        let after = memory_importance(&store, outcome.memory_id);
        assert!(after < before);
        assert!(after > consolidator.config.min_importance_threshold);

        // 100 consecutive decays keep importance at or above the floor
        for _ in 0..100 {
            consolidator.run_decay().unwrap();
        }
        let settled = memory_importance(&store, outcome.memory_id);
        assert!(settled >= consolidator.config.min_importance_threshold);
    }

    #[test]
    fn decay_at_floor_is_a_noop() {
        let (_remember, consolidator, store, _dir) = services();

        store
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO memories
                        (content, content_hash, importance, created_at, updated_at)
                     VALUES ('at floor', 'h-floor', 0.1, ?1, ?1)",
                    [now_iso()],
                )?;
                Ok(())
            })
            .unwrap();
        let id: i64 = store
            .read(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT id FROM memories WHERE content_hash = 'h-floor'",
                        [],
                        |r| r.get(0),
                    )
                    .unwrap())
            })
            .unwrap();

        consolidator.run_decay().unwrap();
        assert!((memory_importance(&store, id) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn recently_accessed_memories_get_boosted() {
        let (remember, consolidator, store, _dir) = services();

        let outcome = remember
            .remember_fact(FactInput::new("Boost target").importance(0.5))
            .unwrap();
        store
            .transaction(|tx| {
                tx.execute(
                    "UPDATE memories SET last_accessed_at = ?1 WHERE id = ?2",
                    params![now_iso(), outcome.memory_id],
                )?;
                Ok(())
            })
            .unwrap();

        let boosted = consolidator.boost_accessed_memories().unwrap();
        assert_eq!(boosted, 1);
        let importance = memory_importance(&store, outcome.memory_id);
        assert!((importance - 0.525).abs() < 1e-6);
    }

    #[test]
    fn similar_memories_merge_with_backpointer() {
        let (remember, consolidator, store, _dir) = services();

        // Five memories about one entity; two share an identical vector
        let mut ids = Vec::new();
        for i in 0..5 {
            let outcome = remember
                .remember_fact(
                    FactInput::new(format!("Observation number {} about Dana", i))
                        .about(vec!["Dana".into()]),
                )
                .unwrap();
            ids.push(outcome.memory_id);
        }

        store
            .transaction(|tx| {
                let near_duplicate = vec![1.0f32, 0.0, 0.0, 0.0];
                let distinct = vec![0.0f32, 1.0, 0.0, 0.0];
                for (i, id) in ids.iter().enumerate() {
                    let v = if i < 2 { &near_duplicate } else { &distinct };
                    tx.execute(
                        &format!(
                            "INSERT OR REPLACE INTO {} (memory_id, embedding) VALUES (?1, ?2)",
                            EmbeddingTable::Memory.table()
                        ),
                        params![id, crate::store::vector_to_bytes(v)],
                    )?;
                }
                // Differentiate the scores so the pick is deterministic
                tx.execute(
                    "UPDATE memories SET importance = 0.9 WHERE id = ?1",
                    [ids[0]],
                )?;
                tx.execute(
                    "UPDATE memories SET importance = 0.5 WHERE id = ?1",
                    [ids[1]],
                )?;
                Ok(())
            })
            .unwrap();

        // The three distinct-vector rows also all match each other, so the
        // total is: (0,1) merged + (2,3),(2,4) merged
        let merged = consolidator.merge_similar_memories().unwrap();
        assert!(merged >= 1);

        // ids[1] was suppressed into ids[0]
        assert!((memory_importance(&store, ids[1]) - 0.001).abs() < 1e-9);
        let meta: String = store
            .read(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT metadata FROM memories WHERE id = ?1",
                        [ids[0]],
                        |r| r.get(0),
                    )
                    .unwrap())
            })
            .unwrap();
        let parsed: Value = serde_json::from_str(&meta).unwrap();
        assert!(parsed["merged_from"]
            .as_array()
            .unwrap()
            .contains(&Value::from(ids[1])));
    }

    #[test]
    fn patterns_upsert_instead_of_duplicating() {
        let (remember, consolidator, store, _dir) = services();

        // An entity with importance > 0.3 and an old last mention
        remember
            .remember_fact(FactInput::new("Met Quinn Harper last month").about(vec!["Quinn Harper".into()]))
            .unwrap();
        store
            .transaction(|tx| {
                let old = (Utc::now() - Duration::days(45)).to_rfc3339();
                tx.execute("UPDATE memories SET created_at = ?1", [&old])?;
                Ok(())
            })
            .unwrap();

        let first = consolidator.detect_patterns().unwrap();
        assert!(first
            .iter()
            .any(|p| p.name.starts_with("cooling_relationship_")));

        let pattern_count_1: i64 = store.count("patterns").unwrap();
        consolidator.detect_patterns().unwrap();
        let pattern_count_2: i64 = store.count("patterns").unwrap();
        // Re-running without new data updates in place
        assert_eq!(pattern_count_1, pattern_count_2);

        let occurrences: i64 = store
            .read(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT occurrences FROM patterns WHERE name LIKE 'cooling_relationship_%'",
                        [],
                        |r| r.get(0),
                    )
                    .unwrap())
            })
            .unwrap();
        assert_eq!(occurrences, 2);
    }

    #[test]
    fn predictions_follow_patterns_without_repeats() {
        let (remember, consolidator, store, _dir) = services();

        remember
            .remember_fact(FactInput::new("Met Quinn Harper last quarter").about(vec!["Quinn Harper".into()]))
            .unwrap();
        store
            .transaction(|tx| {
                let old = (Utc::now() - Duration::days(60)).to_rfc3339();
                tx.execute("UPDATE memories SET created_at = ?1", [&old])?;
                Ok(())
            })
            .unwrap();

        consolidator.detect_patterns().unwrap();
        let first = consolidator.generate_predictions().unwrap();
        assert!(first >= 1);

        // Unshown predictions for the same pattern are not re-emitted
        let second = consolidator.generate_predictions().unwrap();
        assert_eq!(second, 0);
    }

    #[test]
    fn feedback_multiplier_tracks_act_ratio() {
        let (_remember, consolidator, store, _dir) = services();

        assert_eq!(consolidator.feedback_multiplier("reminder").unwrap(), 1.0);

        store
            .transaction(|tx| {
                for i in 0..10 {
                    tx.execute(
                        "INSERT INTO predictions
                            (content, prediction_type, priority, is_shown, is_acted_on, created_at)
                         VALUES ('p', 'reminder', 0.5, 1, ?1, ?2)",
                        params![(i < 6) as i64, now_iso()],
                    )?;
                }
                Ok(())
            })
            .unwrap();

        // 6/10 acted on → boost
        assert_eq!(consolidator.feedback_multiplier("reminder").unwrap(), 1.25);
    }

    #[test]
    fn entity_summaries_cache_for_busy_entities() {
        let (remember, consolidator, store, _dir) = services();

        for i in 0..5 {
            remember
                .remember_fact(
                    FactInput::new(format!("Detail {} about Morgan Reyes", i))
                        .about(vec!["Morgan Reyes".into()]),
                )
                .unwrap();
        }

        let generated = consolidator.generate_entity_summaries().unwrap();
        assert_eq!(generated, 1);

        let summary: String = store
            .read(|conn| {
                Ok(conn
                    .query_row("SELECT summary FROM entity_summaries LIMIT 1", [], |r| {
                        r.get(0)
                    })
                    .unwrap())
            })
            .unwrap();
        assert!(summary.contains("Morgan Reyes"));

        // Fresh summary is not regenerated
        let again = consolidator.generate_entity_summaries().unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn dedupe_candidates_surface_but_never_merge() {
        let (remember, consolidator, store, _dir) = services();

        let a = remember
            .remember_entity("Robert Miles", "person", None, &[], None, None)
            .unwrap();
        let b = remember
            .remember_entity("Bob Miles", "person", None, &["Robert Miles".into()], None, None)
            .unwrap();

        let count = consolidator.detect_dedupe_candidates().unwrap();
        assert!(count >= 1);

        // Both entities still live
        store
            .read(|conn| {
                for id in [a, b] {
                    let deleted: Option<String> = conn
                        .query_row(
                            "SELECT deleted_at FROM entities WHERE id = ?1",
                            [id],
                            |r| r.get(0),
                        )
                        .unwrap();
                    assert!(deleted.is_none());
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn contact_velocity_persists_frequency_and_trend() {
        let (remember, consolidator, store, _dir) = services();

        for i in 0..4 {
            remember
                .remember_fact(
                    FactInput::new(format!("Touchpoint {} with Ravi Gupta", i))
                        .about(vec!["Ravi Gupta".into()]),
                )
                .unwrap();
        }
        // Spread the mentions a day apart
        store
            .transaction(|tx| {
                for (i, offset) in [4i64, 3, 2, 1].iter().enumerate() {
                    let at = (Utc::now() - Duration::days(*offset)).to_rfc3339();
                    tx.execute(
                        "UPDATE memories SET created_at = ?1
                         WHERE content LIKE ?2",
                        params![at, format!("Touchpoint {}%", i)],
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let updated = consolidator.update_contact_velocity().unwrap();
        assert_eq!(updated, 1);

        let (frequency, trend): (Option<f64>, Option<String>) = store
            .read(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT contact_frequency_days, contact_trend FROM entities
                         WHERE canonical_name = 'ravi gupta'",
                        [],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .unwrap())
            })
            .unwrap();
        assert!((frequency.unwrap() - 1.0).abs() < 0.2);
        assert_eq!(trend.as_deref(), Some("stable"));
    }

    #[test]
    fn retention_cleanup_prunes_aged_rows() {
        let (_remember, consolidator, store, _dir) = services();

        let ancient = (Utc::now() - Duration::days(120)).to_rfc3339();
        store
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO audit_log (operation, target_table, created_at)
                     VALUES ('old_op', 'memories', ?1)",
                    [&ancient],
                )?;
                tx.execute(
                    "INSERT INTO metrics (name, value, recorded_at) VALUES ('m', 1.0, ?1)",
                    [&ancient],
                )?;
                tx.execute(
                    "INSERT INTO episodes (session_id, started_at) VALUES ('s', ?1)",
                    [&ancient],
                )?;
                tx.execute(
                    "INSERT INTO turn_buffer (episode_id, turn_number, created_at)
                     VALUES (1, 1, ?1)",
                    [&ancient],
                )?;
                tx.execute(
                    "INSERT INTO predictions
                        (content, prediction_type, priority, expires_at, created_at)
                     VALUES ('stale', 'reminder', 0.5, ?1, ?1)",
                    [&ancient],
                )?;
                Ok(())
            })
            .unwrap();

        let counts = consolidator.retention_cleanup().unwrap();
        assert_eq!(counts.audit_rows, 1);
        assert_eq!(counts.metrics, 1);
        assert_eq!(counts.turns, 1);
        assert_eq!(counts.predictions, 1);
    }

    #[test]
    fn full_consolidation_reports_all_phases() {
        let (remember, consolidator, _store, _dir) = services();

        remember
            .remember_fact(FactInput::new("A fact to carry through consolidation"))
            .unwrap();

        let report = consolidator.run_full_consolidation();
        assert!(report.decay.memories >= 1);

        // Back-to-back run without new data detects no new patterns
        let again = consolidator.run_full_consolidation();
        assert_eq!(report.patterns_detected, again.patterns_detected);
    }
}
