//! Remember Service
//!
//! The write path: deduplicate by content hash, embed, canonicalize
//! entities, record bi-temporal relationships, buffer conversation turns,
//! finalize episodes. Every state-changing call is transactional; on any
//! error the transaction rolls back and no partial record (embedding
//! included) persists.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::embeddings::EmbeddingClient;
use crate::extract::{self, canonical_name, extract_deadline, markers_to_json};
use crate::guards;
use crate::store::{content_hash, now_iso, EmbeddingTable, Result, Store, StoreError};

// ============================================================================
// INPUTS AND OUTCOMES
// ============================================================================

/// Input to `remember_fact`.
#[derive(Debug, Clone)]
pub struct FactInput {
    pub content: String,
    pub memory_type: String,
    pub about_entities: Vec<String>,
    pub importance: f64,
    pub confidence: f64,
    pub origin_type: String,
    pub source: Option<String>,
    pub source_id: Option<String>,
    pub metadata: Option<Value>,
    /// Two-pass batch writes pass the vector computed in pass one so the
    /// record and its embedding land in a single transaction.
    pub precomputed_embedding: Option<Vec<f32>>,
}

impl FactInput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            memory_type: "fact".into(),
            about_entities: Vec::new(),
            importance: 1.0,
            confidence: 1.0,
            origin_type: "user_stated".into(),
            source: None,
            source_id: None,
            metadata: None,
            precomputed_embedding: None,
        }
    }

    pub fn with_type(mut self, memory_type: impl Into<String>) -> Self {
        self.memory_type = memory_type.into();
        self
    }

    pub fn about(mut self, entities: Vec<String>) -> Self {
        self.about_entities = entities;
        self
    }

    pub fn importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FactOutcome {
    pub memory_id: i64,
    /// False when the content hash collided and the existing row was touched.
    pub created: bool,
    pub warnings: Vec<String>,
}

/// Input to `relate_entities`.
#[derive(Debug, Clone, Deserialize)]
pub struct RelateInput {
    pub source: String,
    pub target: String,
    pub relationship_type: String,
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default = "default_direction")]
    pub direction: String,
    #[serde(default)]
    pub supersedes: bool,
    #[serde(default)]
    pub metadata: Option<Value>,
}

fn default_strength() -> f64 {
    1.0
}

fn default_direction() -> String {
    "bidirectional".into()
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferOutcome {
    pub episode_id: i64,
    pub turn_number: i64,
    pub extracted_entities: usize,
    pub extracted_memories: usize,
}

/// A fact provided to `end_session`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionFact {
    pub content: String,
    #[serde(default = "default_fact_type")]
    pub memory_type: String,
    #[serde(default)]
    pub about: Vec<String>,
    #[serde(default = "default_strength")]
    pub importance: f64,
}

fn default_fact_type() -> String {
    "fact".into()
}

/// An entity provided to `end_session`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionEntity {
    pub name: String,
    #[serde(default = "default_entity_type", rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_entity_type() -> String {
    "person".into()
}

/// A relationship provided to `end_session`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionRelationship {
    pub source: String,
    pub target: String,
    #[serde(rename = "relationship")]
    pub relationship_type: String,
    #[serde(default)]
    pub supersedes: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionCounts {
    pub episode_id: i64,
    pub facts: usize,
    pub entities: usize,
    pub relationships: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeCounts {
    pub aliases: usize,
    pub memories: usize,
    pub relationships: usize,
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct Remember {
    store: Arc<Store>,
    embeddings: Arc<EmbeddingClient>,
}

impl Remember {
    pub fn new(store: Arc<Store>, embeddings: Arc<EmbeddingClient>) -> Self {
        Self { store, embeddings }
    }

    /// Store a discrete fact. A content-hash collision is idempotent
    /// success: the existing row's access counters are touched and its id
    /// returned.
    pub fn remember_fact(&self, input: FactInput) -> Result<FactOutcome> {
        let validation = guards::validate_memory(&input.content, &input.memory_type, input.importance);
        let content = validation
            .adjusted_content
            .clone()
            .unwrap_or_else(|| input.content.clone());
        let importance = validation.adjusted_importance.unwrap_or(input.importance);
        let confidence = input.confidence.clamp(0.0, 1.0);
        let hash = content_hash(&content);

        // Embeddings come from HTTP; resolve them before the transaction so
        // the write lock is never held across a network call.
        let embedding = match &input.precomputed_embedding {
            Some(v) => Some(v.clone()),
            None => self.embeddings.embed(&content),
        };
        let entity_embeddings = self.prepare_entity_embeddings(&input.about_entities)?;

        // Commitments get their deadline resolved at write time.
        let (deadline_at, temporal_markers) = if input.memory_type == "commitment" {
            let today = Utc::now().date_naive();
            let markers = extract::extract_temporal_markers(&content, today);
            (extract_deadline(&content, today), markers_to_json(&markers))
        } else {
            (None, None)
        };

        let now = now_iso();
        let outcome = self.store.transaction(|tx| {
            let existing: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT id, access_count FROM memories WHERE content_hash = ?1",
                    [&hash],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((id, access_count)) = existing {
                tx.execute(
                    "UPDATE memories SET last_accessed_at = ?1, access_count = ?2 WHERE id = ?3",
                    params![now, access_count + 1, id],
                )?;
                return Ok(FactOutcome {
                    memory_id: id,
                    created: false,
                    warnings: validation.warnings.clone(),
                });
            }

            tx.execute(
                "INSERT INTO memories (
                    content, content_hash, type, importance, confidence,
                    origin_type, source, source_id, created_at, updated_at,
                    verification_status, deadline_at, temporal_markers, metadata
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, 'pending', ?10, ?11, ?12)",
                params![
                    content,
                    hash,
                    input.memory_type,
                    importance,
                    confidence,
                    input.origin_type,
                    input.source,
                    input.source_id,
                    now,
                    deadline_at,
                    temporal_markers,
                    input.metadata.as_ref().map(|m| m.to_string()),
                ],
            )?;
            let memory_id = tx.last_insert_rowid();

            if let Some(vector) = &embedding {
                self.store
                    .put_embedding(tx, EmbeddingTable::Memory, memory_id, vector)?;
            }

            for (name, entity_embedding) in &entity_embeddings {
                let entity_id =
                    self.ensure_entity_tx(tx, name, "person", entity_embedding.as_deref())?;
                tx.execute(
                    "INSERT OR IGNORE INTO memory_entities (memory_id, entity_id, relationship)
                     VALUES (?1, ?2, 'about')",
                    params![memory_id, entity_id],
                )?;
                tx.execute(
                    "UPDATE entities SET last_contact_at = ?1 WHERE id = ?2",
                    params![now, entity_id],
                )?;
            }

            self.store
                .record_audit(tx, "remember_fact", "memories", Some(memory_id), None)?;

            Ok(FactOutcome {
                memory_id,
                created: true,
                warnings: validation.warnings.clone(),
            })
        })?;

        Ok(outcome)
    }

    /// Create or update an entity. Lookup tries (canonical_name, type), then
    /// the alias table; soft-deleted rows never match.
    pub fn remember_entity(
        &self,
        name: &str,
        entity_type: &str,
        description: Option<&str>,
        aliases: &[String],
        metadata: Option<&Value>,
        precomputed_embedding: Option<Vec<f32>>,
    ) -> Result<i64> {
        let existing_names: Vec<String> = self.store.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT canonical_name FROM entities WHERE deleted_at IS NULL")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(names)
        })?;

        let validation = guards::validate_entity(name, entity_type, &existing_names);
        if !validation.is_valid {
            return Err(StoreError::Validation(
                validation.warnings.join("; "),
            ));
        }
        for warning in &validation.warnings {
            tracing::warn!("entity guard: {}", warning);
        }
        let entity_type = validation
            .adjusted_entity_type
            .as_deref()
            .unwrap_or(entity_type);

        let canonical = canonical_name(name);
        let already_exists = self
            .store
            .read(|conn| lookup_entity_id(conn, &canonical, Some(entity_type)))?
            .is_some();

        let embedding = if already_exists {
            None
        } else {
            match precomputed_embedding {
                Some(v) => Some(v),
                None => {
                    let text = format!("{}. {}", name, description.unwrap_or(""));
                    self.embeddings.embed(&text)
                }
            }
        };

        let now = now_iso();
        self.store.transaction(|tx| {
            let entity_id = match lookup_entity_id(tx, &canonical, Some(entity_type))? {
                Some(id) => {
                    if let Some(desc) = description {
                        tx.execute(
                            "UPDATE entities SET description = ?1, updated_at = ?2 WHERE id = ?3",
                            params![desc, now, id],
                        )?;
                    } else {
                        tx.execute(
                            "UPDATE entities SET updated_at = ?1 WHERE id = ?2",
                            params![now, id],
                        )?;
                    }
                    if let Some(new_meta) = metadata {
                        merge_entity_metadata(tx, id, new_meta)?;
                    }
                    id
                }
                None => {
                    tx.execute(
                        "INSERT INTO entities (
                            name, type, canonical_name, description, importance,
                            created_at, updated_at, metadata
                        ) VALUES (?1, ?2, ?3, ?4, 1.0, ?5, ?5, ?6)",
                        params![
                            name,
                            entity_type,
                            canonical,
                            description,
                            now,
                            metadata.map(|m| m.to_string()),
                        ],
                    )?;
                    let id = tx.last_insert_rowid();
                    if let Some(vector) = &embedding {
                        self.store
                            .put_embedding(tx, EmbeddingTable::Entity, id, vector)?;
                    }
                    self.store
                        .record_audit(tx, "remember_entity", "entities", Some(id), None)?;
                    id
                }
            };

            for alias in aliases {
                let canonical_alias = canonical_name(alias);
                if canonical_alias.is_empty() {
                    continue;
                }
                tx.execute(
                    "INSERT OR IGNORE INTO entity_aliases
                        (entity_id, alias, canonical_alias, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![entity_id, alias, canonical_alias, now],
                )?;
            }

            Ok(entity_id)
        })
    }

    /// Create, strengthen or supersede a relationship.
    ///
    /// With `supersedes` every current row for (source, type) is closed:
    /// its type gains a `__superseded_<timestamp>` suffix, `invalid_at` is
    /// set, and a fresh row opens with `valid_at = now`. Without it, an
    /// existing (source, target, type) row is strengthened by 0.1 (clamped
    /// to 1.0). Missing endpoints are auto-created as persons.
    pub fn relate_entities(&self, input: RelateInput) -> Result<i64> {
        let validation = guards::validate_relationship(input.strength);
        let strength = validation.adjusted_strength.unwrap_or(input.strength);

        let endpoint_embeddings =
            self.prepare_entity_embeddings(&[input.source.clone(), input.target.clone()])?;

        let now = now_iso();
        self.store.transaction(|tx| {
            let source_id = self.ensure_entity_tx(
                tx,
                &input.source,
                "person",
                endpoint_embeddings
                    .first()
                    .and_then(|(_, e)| e.as_deref()),
            )?;
            let target_id = self.ensure_entity_tx(
                tx,
                &input.target,
                "person",
                endpoint_embeddings
                    .get(1)
                    .and_then(|(_, e)| e.as_deref()),
            )?;

            if input.supersedes {
                let stamp = Utc::now().format("%Y%m%d%H%M%S");
                tx.execute(
                    "UPDATE relationships
                     SET relationship_type = relationship_type || '__superseded_' || ?1,
                         invalid_at = ?2,
                         updated_at = ?2
                     WHERE source_entity_id = ?3
                       AND relationship_type = ?4
                       AND invalid_at IS NULL",
                    params![stamp.to_string(), now, source_id, input.relationship_type],
                )?;
            } else {
                let existing: Option<(i64, f64)> = tx
                    .query_row(
                        "SELECT id, strength FROM relationships
                         WHERE source_entity_id = ?1 AND target_entity_id = ?2
                           AND relationship_type = ?3 AND invalid_at IS NULL",
                        params![source_id, target_id, input.relationship_type],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                if let Some((id, current)) = existing {
                    let strengthened = (current + 0.1).min(1.0);
                    tx.execute(
                        "UPDATE relationships SET strength = ?1, updated_at = ?2 WHERE id = ?3",
                        params![strengthened, now, id],
                    )?;
                    return Ok(id);
                }
            }

            tx.execute(
                "INSERT INTO relationships (
                    source_entity_id, target_entity_id, relationship_type,
                    strength, direction, origin_type, valid_at,
                    created_at, updated_at, metadata
                ) VALUES (?1, ?2, ?3, ?4, ?5, 'user_stated', ?6, ?6, ?6, ?7)",
                params![
                    source_id,
                    target_id,
                    input.relationship_type,
                    strength,
                    input.direction,
                    now,
                    input.metadata.as_ref().map(|m| m.to_string()),
                ],
            )?;
            let id = tx.last_insert_rowid();
            self.store
                .record_audit(tx, "relate_entities", "relationships", Some(id), None)?;
            Ok(id)
        })
    }

    /// Buffer a user/assistant turn pair. Creates an episode when none is
    /// open, mirrors both halves into `messages`, and runs the deterministic
    /// extractors over the user content.
    pub fn buffer_turn(
        &self,
        user_content: &str,
        assistant_content: &str,
        episode_id: Option<i64>,
    ) -> Result<BufferOutcome> {
        let message_vectors = self
            .embeddings
            .embed_batch(&[user_content.to_string(), assistant_content.to_string()]);

        let now = now_iso();
        let (episode_id, turn_number) = self.store.transaction(|tx| {
            let episode_id = resolve_open_episode(tx, episode_id, &now)?;

            let turn_number: i64 = tx.query_row(
                "SELECT COALESCE(MAX(turn_number), 0) + 1 FROM turn_buffer WHERE episode_id = ?1",
                [episode_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO turn_buffer
                    (episode_id, turn_number, user_content, assistant_content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![episode_id, turn_number, user_content, assistant_content, now],
            )?;

            for (role, content, vector) in [
                ("user", user_content, &message_vectors[0]),
                ("assistant", assistant_content, &message_vectors[1]),
            ] {
                tx.execute(
                    "INSERT INTO messages (episode_id, role, content, content_hash, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![episode_id, role, content, content_hash(content), now],
                )?;
                let message_id = tx.last_insert_rowid();
                if let Some(v) = vector {
                    self.store
                        .put_embedding(tx, EmbeddingTable::Message, message_id, v)?;
                }
            }

            tx.execute(
                "UPDATE episodes
                 SET turn_count = turn_count + 1, message_count = message_count + 2
                 WHERE id = ?1",
                [episode_id],
            )?;

            Ok((episode_id, turn_number))
        })?;

        // Auto-extraction runs after the buffer commit; each extracted fact
        // is its own atomic write.
        let (entities, memories) = extract::extract_all(user_content);
        let mut extracted_entities = 0;
        for entity in &entities {
            if self
                .remember_entity(&entity.name, &entity.entity_type, None, &[], None, None)
                .is_ok()
            {
                extracted_entities += 1;
            }
        }
        let mut extracted_memories = 0;
        for memory in &memories {
            let input = FactInput {
                content: memory.content.clone(),
                memory_type: memory.memory_type.clone(),
                about_entities: memory.entities.clone(),
                importance: memory.confidence,
                confidence: memory.confidence,
                origin_type: "extracted".into(),
                source: Some("conversation".into()),
                source_id: Some(episode_id.to_string()),
                metadata: None,
                precomputed_embedding: None,
            };
            if self.remember_fact(input).is_ok() {
                extracted_memories += 1;
            }
        }

        Ok(BufferOutcome {
            episode_id,
            turn_number,
            extracted_entities,
            extracted_memories,
        })
    }

    /// Finalize an episode: store the narrative, embed it for later
    /// semantic session lookup, and route any provided facts, entities and
    /// relationships through the regular write paths.
    pub fn end_session(
        &self,
        episode_id: Option<i64>,
        narrative: &str,
        facts: &[SessionFact],
        entities: &[SessionEntity],
        relationships: &[SessionRelationship],
    ) -> Result<SessionCounts> {
        let narrative_embedding = self.embeddings.embed(narrative);

        // Key topics: the entity names the narrative itself mentions
        let key_topics: Vec<String> = extract::extract_entities(narrative)
            .into_iter()
            .map(|e| e.name)
            .collect();
        let key_topics_json = serde_json::to_string(&key_topics).unwrap_or_else(|_| "[]".into());

        let now = now_iso();
        let episode_id = self.store.transaction(|tx| {
            let episode_id = resolve_open_episode(tx, episode_id, &now)?;
            tx.execute(
                "UPDATE episodes
                 SET narrative = ?1, ended_at = ?2, is_summarized = 1, key_topics = ?3
                 WHERE id = ?4",
                params![narrative, now, key_topics_json, episode_id],
            )?;
            if let Some(vector) = &narrative_embedding {
                self.store
                    .put_embedding(tx, EmbeddingTable::Episode, episode_id, vector)?;
            }
            self.store
                .record_audit(tx, "end_session", "episodes", Some(episode_id), None)?;
            Ok(episode_id)
        })?;

        let mut counts = SessionCounts {
            episode_id,
            ..Default::default()
        };

        // Two-pass writes: one embedding fan-out for all facts, then each
        // record stores with its precomputed vector.
        let fact_texts: Vec<String> = facts.iter().map(|f| f.content.clone()).collect();
        let fact_vectors = self.embeddings.embed_batch(&fact_texts);

        for (fact, vector) in facts.iter().zip(fact_vectors) {
            let input = FactInput {
                content: fact.content.clone(),
                memory_type: fact.memory_type.clone(),
                about_entities: fact.about.clone(),
                importance: fact.importance,
                confidence: 1.0,
                origin_type: "user_stated".into(),
                source: Some("session_summary".into()),
                source_id: Some(episode_id.to_string()),
                metadata: None,
                precomputed_embedding: vector,
            };
            if self.remember_fact(input).is_ok() {
                counts.facts += 1;
            }
        }

        for entity in entities {
            if self
                .remember_entity(
                    &entity.name,
                    &entity.entity_type,
                    entity.description.as_deref(),
                    &[],
                    None,
                    None,
                )
                .is_ok()
            {
                counts.entities += 1;
            }
        }

        for rel in relationships {
            let input = RelateInput {
                source: rel.source.clone(),
                target: rel.target.clone(),
                relationship_type: rel.relationship_type.clone(),
                strength: 1.0,
                direction: "bidirectional".into(),
                supersedes: rel.supersedes,
                metadata: None,
            };
            if self.relate_entities(input).is_ok() {
                counts.relationships += 1;
            }
        }

        Ok(counts)
    }

    /// Merge one entity into another: the target absorbs the source's
    /// aliases (including its display name), memory links and relationships
    /// are re-pointed, and the source is soft-deleted. Re-running with the
    /// same pair is a no-op.
    pub fn merge_entities(
        &self,
        source_id: i64,
        target_id: i64,
        reason: Option<&str>,
    ) -> Result<MergeCounts> {
        if source_id == target_id {
            return Err(StoreError::Validation(
                "cannot merge an entity into itself".into(),
            ));
        }

        let now = now_iso();
        self.store.transaction(|tx| {
            let source: Option<String> = tx
                .query_row(
                    "SELECT name FROM entities WHERE id = ?1 AND deleted_at IS NULL",
                    [source_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(source_name) = source else {
                // Already merged (or never existed): no-op
                return Ok(MergeCounts::default());
            };
            let target_exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM entities WHERE id = ?1 AND deleted_at IS NULL",
                    [target_id],
                    |row| row.get(0),
                )
                .optional()?;
            if target_exists.is_none() {
                return Err(StoreError::NotFound(format!(
                    "merge target entity {}",
                    target_id
                )));
            }

            let mut counts = MergeCounts::default();

            // Absorb aliases, including the source's display name
            let aliases: Vec<(String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT alias, canonical_alias FROM entity_aliases WHERE entity_id = ?1",
                )?;
                let rows: Vec<(String, String)> = stmt
                    .query_map([source_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            };
            for (alias, canonical_alias) in aliases
                .into_iter()
                .chain(std::iter::once((
                    source_name.clone(),
                    canonical_name(&source_name),
                )))
            {
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO entity_aliases
                        (entity_id, alias, canonical_alias, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![target_id, alias, canonical_alias, now],
                )?;
                counts.aliases += inserted;
            }
            tx.execute("DELETE FROM entity_aliases WHERE entity_id = ?1", [source_id])?;

            // Re-point memory links; links the target already has collapse
            counts.memories = tx.execute(
                "UPDATE OR IGNORE memory_entities SET entity_id = ?1 WHERE entity_id = ?2",
                params![target_id, source_id],
            )?;
            tx.execute("DELETE FROM memory_entities WHERE entity_id = ?1", [source_id])?;

            // Re-point relationships on both ends, dropping self-loops
            let repointed_src = tx.execute(
                "UPDATE relationships SET source_entity_id = ?1, updated_at = ?2
                 WHERE source_entity_id = ?3",
                params![target_id, now, source_id],
            )?;
            let repointed_dst = tx.execute(
                "UPDATE relationships SET target_entity_id = ?1, updated_at = ?2
                 WHERE target_entity_id = ?3",
                params![target_id, now, source_id],
            )?;
            counts.relationships = repointed_src + repointed_dst;
            tx.execute(
                "DELETE FROM relationships
                 WHERE source_entity_id = ?1 AND target_entity_id = ?1",
                [target_id],
            )?;

            let deleted_reason = format!(
                "merged into {}: {}",
                target_id,
                reason.unwrap_or("duplicate")
            );
            tx.execute(
                "UPDATE entities SET deleted_at = ?1, deleted_reason = ?2 WHERE id = ?3",
                params![now, deleted_reason, source_id],
            )?;

            self.store.record_audit(
                tx,
                "merge_entities",
                "entities",
                Some(source_id),
                Some(&deleted_reason),
            )?;

            Ok(counts)
        })
    }

    /// Soft-delete an entity. References remain for audit.
    pub fn delete_entity(&self, entity_id: i64, reason: Option<&str>) -> Result<bool> {
        let now = now_iso();
        self.store.transaction(|tx| {
            let changed = tx.execute(
                "UPDATE entities SET deleted_at = ?1, deleted_reason = ?2
                 WHERE id = ?3 AND deleted_at IS NULL",
                params![now, reason.unwrap_or("deleted"), entity_id],
            )?;
            if changed > 0 {
                self.store
                    .record_audit(tx, "delete_entity", "entities", Some(entity_id), reason)?;
            }
            Ok(changed > 0)
        })
    }

    /// Correct a memory: a new version is created with a back-pointer and
    /// the old version is invalidated (kept for audit, excluded from
    /// default recall). Returns the new memory id.
    pub fn correct_memory(&self, memory_id: i64, new_content: &str) -> Result<i64> {
        let embedding = self.embeddings.embed(new_content);
        let hash = content_hash(new_content);
        let now = now_iso();

        self.store.transaction(|tx| {
            let old: Option<(String, f64, f64, Option<String>)> = tx
                .query_row(
                    "SELECT type, importance, confidence, source FROM memories WHERE id = ?1",
                    [memory_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            let Some((memory_type, importance, confidence, source)) = old else {
                return Err(StoreError::NotFound(format!("memory {}", memory_id)));
            };

            tx.execute(
                "INSERT INTO memories (
                    content, content_hash, type, importance, confidence,
                    origin_type, source, created_at, updated_at,
                    verification_status, corrected_at, corrected_from
                ) VALUES (?1, ?2, ?3, ?4, ?5, 'corrected', ?6, ?7, ?7, 'pending', ?7, ?8)",
                params![
                    new_content,
                    hash,
                    memory_type,
                    importance,
                    confidence,
                    source,
                    now,
                    memory_id
                ],
            )?;
            let new_id = tx.last_insert_rowid();

            if let Some(vector) = &embedding {
                self.store
                    .put_embedding(tx, EmbeddingTable::Memory, new_id, vector)?;
            }

            // Carry the entity links forward
            tx.execute(
                "INSERT OR IGNORE INTO memory_entities (memory_id, entity_id, relationship)
                 SELECT ?1, entity_id, relationship FROM memory_entities WHERE memory_id = ?2",
                params![new_id, memory_id],
            )?;

            tx.execute(
                "UPDATE memories SET invalidated_at = ?1, invalidated_reason = ?2
                 WHERE id = ?3",
                params![now, format!("corrected by {}", new_id), memory_id],
            )?;

            self.store
                .record_audit(tx, "correct_memory", "memories", Some(memory_id), None)?;
            Ok(new_id)
        })
    }

    /// Invalidate a memory without replacement. The row keeps its hash and
    /// history but drops out of default recall.
    pub fn invalidate_memory(&self, memory_id: i64, reason: &str) -> Result<bool> {
        let now = now_iso();
        self.store.transaction(|tx| {
            let changed = tx.execute(
                "UPDATE memories SET invalidated_at = ?1, invalidated_reason = ?2
                 WHERE id = ?3 AND invalidated_at IS NULL",
                params![now, reason, memory_id],
            )?;
            if changed > 0 {
                self.store.record_audit(
                    tx,
                    "invalidate_memory",
                    "memories",
                    Some(memory_id),
                    Some(reason),
                )?;
            }
            Ok(changed > 0)
        })
    }

    /// Store a long-lived self-observation. Reflections live apart from
    /// memories: they decay slower (per-row rate) and aggregate over time.
    pub fn remember_reflection(
        &self,
        content: &str,
        reflection_type: &str,
        importance: f64,
    ) -> Result<i64> {
        let embedding = self.embeddings.embed(content);
        let now = now_iso();
        self.store.transaction(|tx| {
            tx.execute(
                "INSERT INTO reflections (
                    content, reflection_type, importance,
                    first_observed_at, last_confirmed_at, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?4, ?4, ?4)",
                params![content, reflection_type, importance.clamp(0.0, 1.0), now],
            )?;
            let id = tx.last_insert_rowid();
            if let Some(vector) = &embedding {
                self.store
                    .put_embedding(tx, EmbeddingTable::Reflection, id, vector)?;
            }
            Ok(id)
        })
    }

    /// File a document and link it to entities. Deduplicated by file hash;
    /// filing the same bytes twice returns the existing row.
    pub fn file_document(
        &self,
        file_path: &str,
        title: &str,
        doc_type: &str,
        entities: &[String],
    ) -> Result<i64> {
        let bytes = std::fs::read(file_path)?;
        let hash = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            hasher
                .finalize()
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<String>()
        };

        let entity_embeddings = self.prepare_entity_embeddings(entities)?;

        let now = now_iso();
        self.store.transaction(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM documents WHERE file_hash = ?1",
                    [&hash],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                tx.execute(
                    "UPDATE documents SET last_accessed_at = ?1 WHERE id = ?2",
                    params![now, id],
                )?;
                return Ok(id);
            }

            tx.execute(
                "INSERT INTO documents
                    (title, doc_type, file_path, file_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![title, doc_type, file_path, hash, now],
            )?;
            let document_id = tx.last_insert_rowid();

            for (name, embedding) in &entity_embeddings {
                let entity_id = self.ensure_entity_tx(tx, name, "person", embedding.as_deref())?;
                tx.execute(
                    "INSERT OR IGNORE INTO entity_documents (document_id, entity_id)
                     VALUES (?1, ?2)",
                    params![document_id, entity_id],
                )?;
            }

            self.store
                .record_audit(tx, "file_document", "documents", Some(document_id), None)?;
            Ok(document_id)
        })
    }

    // ------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------

    /// Pre-compute embeddings for entities that do not exist yet, so entity
    /// auto-creation inside a transaction never issues HTTP.
    fn prepare_entity_embeddings(
        &self,
        names: &[String],
    ) -> Result<Vec<(String, Option<Vec<f32>>)>> {
        let mut prepared = Vec::with_capacity(names.len());
        for name in names {
            let canonical = canonical_name(name);
            if canonical.is_empty() {
                // Kept positional so callers can index by input order; the
                // write path rejects the empty name itself.
                prepared.push((name.clone(), None));
                continue;
            }
            let exists = self
                .store
                .read(|conn| lookup_entity_id(conn, &canonical, None))?
                .is_some();
            let embedding = if exists {
                None
            } else {
                self.embeddings.embed(&format!("{}. ", name))
            };
            prepared.push((name.clone(), embedding));
        }
        Ok(prepared)
    }

    /// Find an entity by canonical name or alias, creating it when missing.
    fn ensure_entity_tx(
        &self,
        tx: &Connection,
        name: &str,
        default_type: &str,
        embedding: Option<&[f32]>,
    ) -> Result<i64> {
        let canonical = canonical_name(name);
        if canonical.is_empty() {
            return Err(StoreError::Validation("entity name cannot be empty".into()));
        }
        if let Some(id) = lookup_entity_id(tx, &canonical, None)? {
            return Ok(id);
        }

        let now = now_iso();
        tx.execute(
            "INSERT INTO entities (
                name, type, canonical_name, importance, created_at, updated_at
            ) VALUES (?1, ?2, ?3, 1.0, ?4, ?4)",
            params![name, default_type, canonical, now],
        )?;
        let id = tx.last_insert_rowid();
        if let Some(vector) = embedding {
            self.store
                .put_embedding(tx, EmbeddingTable::Entity, id, vector)?;
        }
        Ok(id)
    }
}

/// Canonical lookup: entity first (optionally type-scoped), then alias.
/// Soft-deleted entities never match.
pub(crate) fn lookup_entity_id(
    conn: &Connection,
    canonical: &str,
    entity_type: Option<&str>,
) -> Result<Option<i64>> {
    let direct: Option<i64> = match entity_type {
        Some(t) => conn
            .query_row(
                "SELECT id FROM entities
                 WHERE canonical_name = ?1 AND type = ?2 AND deleted_at IS NULL",
                params![canonical, t],
                |row| row.get(0),
            )
            .optional()?,
        None => conn
            .query_row(
                "SELECT id FROM entities
                 WHERE canonical_name = ?1 AND deleted_at IS NULL
                 ORDER BY importance DESC LIMIT 1",
                [canonical],
                |row| row.get(0),
            )
            .optional()?,
    };
    if direct.is_some() {
        return Ok(direct);
    }

    Ok(conn
        .query_row(
            "SELECT ea.entity_id FROM entity_aliases ea
             JOIN entities e ON e.id = ea.entity_id AND e.deleted_at IS NULL
             WHERE ea.canonical_alias = ?1
             LIMIT 1",
            [canonical],
            |row| row.get(0),
        )
        .optional()?)
}

/// The open episode to use: a valid, still-open id wins; anything stale or
/// absent gets the most recent open episode, or a fresh one.
fn resolve_open_episode(tx: &Connection, episode_id: Option<i64>, now: &str) -> Result<i64> {
    if let Some(id) = episode_id {
        let open: Option<i64> = tx
            .query_row(
                "SELECT id FROM episodes WHERE id = ?1 AND ended_at IS NULL",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = open {
            return Ok(id);
        }
    }

    let latest_open: Option<i64> = tx
        .query_row(
            "SELECT id FROM episodes WHERE ended_at IS NULL
             ORDER BY started_at DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = latest_open {
        return Ok(id);
    }

    tx.execute(
        "INSERT INTO episodes (session_id, started_at) VALUES (?1, ?2)",
        params![Uuid::new_v4().to_string(), now],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Shallow-merge new metadata keys into an entity's existing map.
fn merge_entity_metadata(tx: &Connection, entity_id: i64, new_meta: &Value) -> Result<()> {
    let existing: Option<String> = tx
        .query_row(
            "SELECT metadata FROM entities WHERE id = ?1",
            [entity_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    let mut merged: Value = existing
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_else(|| Value::Object(Default::default()));

    if let (Some(map), Some(new_map)) = (merged.as_object_mut(), new_meta.as_object()) {
        for (k, v) in new_map {
            map.insert(k.clone(), v.clone());
        }
    }

    tx.execute(
        "UPDATE entities SET metadata = ?1 WHERE id = ?2",
        params![merged.to_string(), entity_id],
    )?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
