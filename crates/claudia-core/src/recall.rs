//! Recall Service
//!
//! Hybrid retrieval: vector similarity, FTS5 full-text, graph proximity and
//! keyword fallback, fused by Reciprocal Rank Fusion (or a weighted sum when
//! RRF is disabled). Plus the structured read queries: entity overview,
//! timelines, deadlines, provenance traces and relationship health.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use crate::config::MemoryConfig;
use crate::embeddings::{l2_distance, load_all_embeddings, EmbeddingClient};
use crate::extract::{canonical_name, extract_entities};
use crate::remember::lookup_entity_id;
use crate::store::{now_iso, EmbeddingTable, Result, Store};

// ============================================================================
// RESULT TYPES
// ============================================================================

/// A single recall hit.
#[derive(Debug, Clone, Serialize)]
pub struct RecallResult {
    pub id: i64,
    pub content: String,
    #[serde(rename = "type")]
    pub memory_type: String,
    pub score: f64,
    pub importance: f64,
    pub created_at: String,
    pub entities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Query filters for `recall`.
#[derive(Debug, Clone, Default)]
pub struct RecallQuery {
    pub query: String,
    pub limit: Option<usize>,
    pub memory_types: Vec<String>,
    pub about_entity: Option<String>,
    pub min_importance: Option<f64>,
    pub include_low_importance: bool,
    pub date_after: Option<String>,
    pub date_before: Option<String>,
}

impl RecallQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityCard {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub description: Option<String>,
    pub importance: f64,
    pub attention_tier: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationshipCard {
    #[serde(rename = "type")]
    pub relationship_type: String,
    pub direction: String,
    pub strength: f64,
    pub other_entity: String,
    pub other_entity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AboutReport {
    pub entity: Option<EntityCard>,
    pub memories: Vec<RecallResult>,
    pub relationships: Vec<RelationshipCard>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntitySearchResult {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub description: Option<String>,
    pub importance: f64,
    pub memory_count: i64,
    pub relationship_count: i64,
    pub last_mentioned: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadlineItem {
    pub id: i64,
    pub content: String,
    pub deadline_at: String,
    pub urgency: String,
    pub importance: f64,
    pub entities: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceStep {
    pub step: String,
    pub detail: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceReport {
    pub memory_id: i64,
    pub chain: Vec<TraceStep>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationshipHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projected_dormant_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_contact_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_since_contact: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_frequency_days: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityOverviewBlock {
    pub entity: EntityCard,
    pub memory_count: i64,
    pub top_memories: Vec<RecallResult>,
    pub relationships: Vec<RelationshipCard>,
    pub open_commitments: Vec<DeadlineItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverviewReport {
    pub entities: Vec<EntityOverviewBlock>,
    pub cross_entity_patterns: Vec<String>,
    pub relationship_map: Vec<Value>,
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct Recall {
    store: Arc<Store>,
    embeddings: Arc<EmbeddingClient>,
    config: MemoryConfig,
}

impl Recall {
    pub fn new(store: Arc<Store>, embeddings: Arc<EmbeddingClient>, config: MemoryConfig) -> Self {
        Self {
            store,
            embeddings,
            config,
        }
    }

    /// Hybrid search. Candidate generation runs the available sub-queries
    /// (vector KNN, FTS5, graph proximity, keyword LIKE); fusion is RRF or
    /// a weighted sum per configuration. Returned memories get the
    /// rehearsal boost: last_accessed_at touched and access_count bumped.
    pub fn recall(&self, query: &RecallQuery) -> Result<Vec<RecallResult>> {
        let limit = query.limit.unwrap_or(self.config.max_recall_results).max(1);
        let candidate_k = limit * 2;

        let min_importance = match query.min_importance {
            Some(v) => Some(v),
            None if query.include_low_importance => None,
            None => Some(self.config.min_importance_threshold),
        };

        // Candidate generation
        let query_embedding = self.embeddings.embed(&query.query);
        let vector_hits = match &query_embedding {
            Some(vector) => self.vector_candidates(vector, candidate_k)?,
            None => Vec::new(),
        };
        let fts_hits = self.fts_candidates(&query.query, candidate_k)?;
        let graph_hits = if self.config.graph_proximity_enabled {
            self.graph_candidates(&query.query, candidate_k)?
        } else {
            Vec::new()
        };
        let keyword_hits = self.keyword_candidates(&query.query, candidate_k)?;

        // Fusion
        let fused: HashMap<i64, f64> = if self.config.enable_rrf {
            reciprocal_rank_fusion(
                &[&vector_hits, &fts_hits, &graph_hits, &keyword_hits],
                self.config.rrf_k,
            )
        } else {
            self.weighted_fusion(&vector_hits, &fts_hits, &graph_hits, &keyword_hits)?
        };

        if fused.is_empty() {
            return Ok(Vec::new());
        }

        // Load rows and apply filters
        let candidate_ids: Vec<i64> = fused.keys().copied().collect();
        let mut rows = self.load_memory_rows(&candidate_ids)?;

        let about_entity_id = match &query.about_entity {
            Some(name) => {
                let canonical = canonical_name(name);
                self.store
                    .read(|conn| lookup_entity_id(conn, &canonical, None))?
            }
            None => None,
        };
        let about_memory_ids: Option<HashSet<i64>> = match about_entity_id {
            Some(entity_id) => Some(self.store.read(|conn| {
                let mut stmt =
                    conn.prepare("SELECT memory_id FROM memory_entities WHERE entity_id = ?1")?;
                let ids = stmt
                    .query_map([entity_id], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(ids)
            })?),
            None if query.about_entity.is_some() => Some(HashSet::new()),
            None => None,
        };

        rows.retain(|r| {
            if !query.memory_types.is_empty() && !query.memory_types.contains(&r.memory_type) {
                return false;
            }
            if let Some(min) = min_importance {
                if r.importance < min {
                    return false;
                }
            }
            if let Some(after) = &query.date_after {
                if r.created_at.as_str() < after.as_str() {
                    return false;
                }
            }
            if let Some(before) = &query.date_before {
                if r.created_at.as_str() > before.as_str() {
                    return false;
                }
            }
            if let Some(allowed) = &about_memory_ids {
                if !allowed.contains(&r.id) {
                    return false;
                }
            }
            true
        });

        for row in &mut rows {
            row.score = *fused.get(&row.id).unwrap_or(&0.0);
        }
        rows.sort_by(|a, b| b.score.total_cmp(&a.score));
        rows.truncate(limit);

        self.apply_rehearsal_boost(&rows)?;

        Ok(rows)
    }

    /// Everything known about one entity: card, memories, relationships.
    /// Default shows only current relationships; `include_historical`
    /// returns closed intervals as well, with their validity bounds.
    pub fn recall_about(
        &self,
        entity_name: &str,
        limit: Option<usize>,
        memory_types: &[String],
        include_historical: bool,
    ) -> Result<AboutReport> {
        let limit = limit.unwrap_or(self.config.max_recall_results);
        let canonical = canonical_name(entity_name);

        let entity_id = self
            .store
            .read(|conn| lookup_entity_id(conn, &canonical, None))?;
        let Some(entity_id) = entity_id else {
            return Ok(AboutReport {
                entity: None,
                memories: Vec::new(),
                relationships: Vec::new(),
            });
        };

        let entity = self.load_entity_card(entity_id)?;
        let memories = self.memories_about(entity_id, memory_types, limit, "m.importance DESC, m.created_at DESC")?;
        let relationships = self.relationships_of(entity_id, include_historical)?;

        Ok(AboutReport {
            entity: Some(entity),
            memories,
            relationships,
        })
    }

    /// Per-entity overview blocks plus cross-entity co-mention patterns and
    /// a relationship map.
    pub fn entity_overview(
        &self,
        names: &[String],
        include_network: bool,
        include_summaries: bool,
    ) -> Result<OverviewReport> {
        let mut blocks = Vec::new();
        let mut resolved: Vec<(String, i64)> = Vec::new();

        for name in names {
            let canonical = canonical_name(name);
            let Some(entity_id) = self
                .store
                .read(|conn| lookup_entity_id(conn, &canonical, None))?
            else {
                continue;
            };
            resolved.push((name.clone(), entity_id));

            let entity = self.load_entity_card(entity_id)?;
            let memory_count: i64 = self.store.read(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM memory_entities WHERE entity_id = ?1",
                    [entity_id],
                    |row| row.get(0),
                )?)
            })?;
            let top_memories =
                self.memories_about(entity_id, &[], 5, "m.importance DESC, m.created_at DESC")?;
            let relationships = self.relationships_of(entity_id, false)?;
            let open_commitments = self.open_commitments_for(entity_id)?;

            let summary = if include_summaries && self.config.enable_entity_summaries {
                self.fresh_summary(entity_id)?
            } else {
                None
            };

            blocks.push(EntityOverviewBlock {
                entity,
                memory_count,
                top_memories,
                relationships,
                open_commitments,
                summary,
            });
        }

        // Co-mention counts between the requested entities
        let mut cross_entity_patterns = Vec::new();
        for i in 0..resolved.len() {
            for j in (i + 1)..resolved.len() {
                let count: i64 = self.store.read(|conn| {
                    Ok(conn.query_row(
                        "SELECT COUNT(DISTINCT a.memory_id)
                         FROM memory_entities a
                         JOIN memory_entities b ON a.memory_id = b.memory_id
                         WHERE a.entity_id = ?1 AND b.entity_id = ?2",
                        params![resolved[i].1, resolved[j].1],
                        |row| row.get(0),
                    )?)
                })?;
                if count > 0 {
                    cross_entity_patterns.push(format!(
                        "{} and {} appear together in {} memories",
                        resolved[i].0, resolved[j].0, count
                    ));
                }
            }
        }

        let mut relationship_map = Vec::new();
        if include_network && resolved.len() > 1 {
            let ids: Vec<i64> = resolved.iter().map(|(_, id)| *id).collect();
            relationship_map = self.store.read(|conn| {
                let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
                let sql = format!(
                    "SELECT s.name, t.name, r.relationship_type, r.strength
                     FROM relationships r
                     JOIN entities s ON s.id = r.source_entity_id
                     JOIN entities t ON t.id = r.target_entity_id
                     WHERE r.invalid_at IS NULL
                       AND r.source_entity_id IN ({ph})
                       AND r.target_entity_id IN ({ph})",
                    ph = placeholders
                );
                let mut stmt = conn.prepare(&sql)?;
                let bound: Vec<&dyn rusqlite::ToSql> = ids
                    .iter()
                    .chain(ids.iter())
                    .map(|id| id as &dyn rusqlite::ToSql)
                    .collect();
                let rows = stmt
                    .query_map(&bound[..], |row| {
                        Ok(serde_json::json!({
                            "source": row.get::<_, String>(0)?,
                            "target": row.get::<_, String>(1)?,
                            "type": row.get::<_, String>(2)?,
                            "strength": row.get::<_, f64>(3)?,
                        }))
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })?;
        }

        Ok(OverviewReport {
            entities: blocks,
            cross_entity_patterns,
            relationship_map,
        })
    }

    /// Commitments with a deadline inside (-inf, now + days], tagged with
    /// urgency and sorted soonest first, overdue items leading.
    pub fn recall_upcoming_deadlines(&self, days: i64) -> Result<Vec<DeadlineItem>> {
        let today = Utc::now().date_naive();
        let horizon = (today + Duration::days(days)).to_string();

        let rows: Vec<(i64, String, String, f64, Option<String>)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.content, m.deadline_at, m.importance,
                        GROUP_CONCAT(e.name)
                 FROM memories m
                 LEFT JOIN memory_entities me ON m.id = me.memory_id
                 LEFT JOIN entities e ON me.entity_id = e.id
                 WHERE m.type = 'commitment'
                   AND m.deadline_at IS NOT NULL
                   AND m.deadline_at <= ?1
                   AND m.invalidated_at IS NULL
                   AND m.importance > 0.001
                 GROUP BY m.id
                 ORDER BY m.deadline_at ASC",
            )?;
            let rows = stmt
                .query_map([&horizon], |row| {
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

        let items = rows
            .into_iter()
            .map(|(id, content, deadline_at, importance, entity_names)| {
                let urgency = match NaiveDate::parse_from_str(&deadline_at, "%Y-%m-%d") {
                    Ok(d) if d < today => "overdue",
                    Ok(d) if d == today => "today",
                    Ok(d) if d <= today + Duration::days(7) => "this_week",
                    _ => "upcoming",
                };
                DeadlineItem {
                    id,
                    content,
                    deadline_at,
                    urgency: urgency.to_string(),
                    importance,
                    entities: split_names(entity_names),
                }
            })
            .collect();

        Ok(items)
    }

    /// Memories created since a timestamp, optionally scoped to an entity.
    pub fn recall_since(
        &self,
        since_iso: &str,
        entity_name: Option<&str>,
    ) -> Result<Vec<RecallResult>> {
        let entity_id = match entity_name {
            Some(name) => {
                let canonical = canonical_name(name);
                self.store
                    .read(|conn| lookup_entity_id(conn, &canonical, None))?
            }
            None => None,
        };
        if entity_name.is_some() && entity_id.is_none() {
            return Ok(Vec::new());
        }

        self.store.read(|conn| match entity_id {
            Some(id) => {
                let mut stmt = conn.prepare(
                    "SELECT m.id, m.content, m.type, m.importance, m.created_at,
                            GROUP_CONCAT(e.name), m.metadata
                     FROM memories m
                     JOIN memory_entities scope ON m.id = scope.memory_id
                         AND scope.entity_id = ?1
                     LEFT JOIN memory_entities me ON m.id = me.memory_id
                     LEFT JOIN entities e ON me.entity_id = e.id
                     WHERE m.created_at >= ?2 AND m.invalidated_at IS NULL
                     GROUP BY m.id ORDER BY m.created_at DESC",
                )?;
                let rows = stmt
                    .query_map(params![id, since_iso], row_to_recall)?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT m.id, m.content, m.type, m.importance, m.created_at,
                            GROUP_CONCAT(e.name), m.metadata
                     FROM memories m
                     LEFT JOIN memory_entities me ON m.id = me.memory_id
                     LEFT JOIN entities e ON me.entity_id = e.id
                     WHERE m.created_at >= ?1 AND m.invalidated_at IS NULL
                     GROUP BY m.id ORDER BY m.created_at DESC",
                )?;
                let rows = stmt
                    .query_map([since_iso], row_to_recall)?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            }
        })
    }

    /// Chronological memory timeline for an entity.
    pub fn recall_timeline(&self, entity_name: &str) -> Result<Vec<RecallResult>> {
        let canonical = canonical_name(entity_name);
        let Some(entity_id) = self
            .store
            .read(|conn| lookup_entity_id(conn, &canonical, None))?
        else {
            return Ok(Vec::new());
        };
        self.memories_about(entity_id, &[], usize::MAX, "m.created_at ASC")
    }

    /// Search entities by name or description substring.
    pub fn search_entities(
        &self,
        query: &str,
        entity_types: &[String],
        limit: usize,
    ) -> Result<Vec<EntitySearchResult>> {
        let canonical = canonical_name(query);

        self.store.read(|conn| {
            let mut sql = String::from(
                "SELECT e.id, e.name, e.type, e.description, e.importance,
                        COUNT(DISTINCT me.memory_id) as memory_count,
                        COUNT(DISTINCT r.id) as relationship_count,
                        MAX(m.created_at) as last_mentioned
                 FROM entities e
                 LEFT JOIN memory_entities me ON e.id = me.entity_id
                 LEFT JOIN memories m ON me.memory_id = m.id
                 LEFT JOIN relationships r
                     ON (e.id = r.source_entity_id OR e.id = r.target_entity_id)
                     AND r.invalid_at IS NULL
                 WHERE e.deleted_at IS NULL
                   AND (e.canonical_name LIKE ?1 OR e.name LIKE ?2)",
            );
            let like_canonical = format!("%{}%", canonical);
            let like_name = format!("%{}%", query);
            let mut bound: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(like_canonical), Box::new(like_name)];

            if !entity_types.is_empty() {
                let placeholders = entity_types
                    .iter()
                    .map(|_| "?")
                    .collect::<Vec<_>>()
                    .join(", ");
                sql.push_str(&format!(" AND e.type IN ({})", placeholders));
                for t in entity_types {
                    bound.push(Box::new(t.clone()));
                }
            }

            sql.push_str(" GROUP BY e.id ORDER BY e.importance DESC LIMIT ?");
            bound.push(Box::new(limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let refs: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
            let rows = stmt
                .query_map(&refs[..], |row| {
                    Ok(EntitySearchResult {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        entity_type: row.get(2)?,
                        description: row.get(3)?,
                        importance: row.get(4)?,
                        memory_count: row.get(5)?,
                        relationship_count: row.get(6)?,
                        last_mentioned: row.get(7)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    /// Recent memories within a time window.
    pub fn get_recent_memories(&self, hours: i64, limit: usize) -> Result<Vec<RecallResult>> {
        let cutoff = (Utc::now() - Duration::hours(hours)).to_rfc3339();
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.content, m.type, m.importance, m.created_at,
                        GROUP_CONCAT(e.name), m.metadata
                 FROM memories m
                 LEFT JOIN memory_entities me ON m.id = me.memory_id
                 LEFT JOIN entities e ON me.entity_id = e.id
                 WHERE m.created_at >= ?1 AND m.invalidated_at IS NULL
                 GROUP BY m.id ORDER BY m.created_at DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![cutoff, limit as i64], row_to_recall)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    /// Provenance chain: origin → memory → entities → source documents →
    /// corrections → invalidation, in order.
    pub fn trace_memory(&self, memory_id: i64) -> Result<TraceReport> {
        self.store.read(|conn| {
            let memory: Option<(String, String, String, Option<String>, Option<String>, String)> =
                conn.query_row(
                    "SELECT content, type, origin_type, source, source_id, created_at
                     FROM memories WHERE id = ?1",
                    [memory_id],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    },
                )
                .optional()?;

            let Some((content, memory_type, origin_type, source, source_id, created_at)) = memory
            else {
                return Err(crate::store::StoreError::NotFound(format!(
                    "memory {}",
                    memory_id
                )));
            };

            let mut chain = Vec::new();
            chain.push(TraceStep {
                step: "origin".into(),
                detail: serde_json::json!({
                    "origin_type": origin_type,
                    "source": source,
                    "source_id": source_id,
                    "created_at": created_at,
                }),
            });
            chain.push(TraceStep {
                step: "memory".into(),
                detail: serde_json::json!({
                    "id": memory_id,
                    "content": content,
                    "type": memory_type,
                }),
            });

            let entities: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT e.name FROM memory_entities me
                     JOIN entities e ON e.id = me.entity_id
                     WHERE me.memory_id = ?1",
                )?;
                let rows: Vec<String> = stmt
                    .query_map([memory_id], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            };
            chain.push(TraceStep {
                step: "entities".into(),
                detail: serde_json::json!(entities),
            });

            let documents: Vec<Value> = {
                let mut stmt = conn.prepare(
                    "SELECT d.title, d.file_path, d.lifecycle_state
                     FROM memory_sources ms
                     JOIN documents d ON d.id = ms.document_id
                     WHERE ms.memory_id = ?1",
                )?;
                let rows: Vec<Value> = stmt
                    .query_map([memory_id], |row| {
                        Ok(serde_json::json!({
                            "title": row.get::<_, String>(0)?,
                            "file_path": row.get::<_, String>(1)?,
                            "lifecycle_state": row.get::<_, String>(2)?,
                        }))
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            };
            chain.push(TraceStep {
                step: "source_documents".into(),
                detail: serde_json::json!(documents),
            });

            // Walk the correction chain backwards
            let mut corrections = Vec::new();
            let mut cursor = memory_id;
            let mut seen = HashSet::new();
            while seen.insert(cursor) {
                let prior: Option<(i64, String, Option<String>)> = conn
                    .query_row(
                        "SELECT prior.id, prior.content, current.corrected_at
                         FROM memories current
                         JOIN memories prior ON prior.id = current.corrected_from
                         WHERE current.id = ?1",
                        [cursor],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?;
                match prior {
                    Some((prior_id, prior_content, corrected_at)) => {
                        corrections.push(serde_json::json!({
                            "corrected_from": prior_id,
                            "previous_content": prior_content,
                            "corrected_at": corrected_at,
                        }));
                        cursor = prior_id;
                    }
                    None => break,
                }
            }
            chain.push(TraceStep {
                step: "corrections".into(),
                detail: serde_json::json!(corrections),
            });

            let invalidation: Option<(String, Option<String>)> = conn
                .query_row(
                    "SELECT invalidated_at, invalidated_reason FROM memories
                     WHERE id = ?1 AND invalidated_at IS NOT NULL",
                    [memory_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            chain.push(TraceStep {
                step: "invalidation".into(),
                detail: match invalidation {
                    Some((at, reason)) => serde_json::json!({
                        "invalidated_at": at,
                        "reason": reason,
                    }),
                    None => Value::Null,
                },
            });

            Ok(TraceReport { memory_id, chain })
        })
    }

    /// Contact-velocity projection for an entity, derived from the
    /// timestamps of memories that mention it. Needs at least three
    /// mentions to say anything.
    pub fn project_relationship_health(&self, entity_name: &str) -> Result<RelationshipHealth> {
        let canonical = canonical_name(entity_name);
        let Some(entity_id) = self
            .store
            .read(|conn| lookup_entity_id(conn, &canonical, None))?
        else {
            return Ok(RelationshipHealth {
                status: "insufficient_data".into(),
                risk_level: None,
                projected_dormant_date: None,
                recommended_contact_date: None,
                days_since_contact: None,
                contact_frequency_days: None,
                trend: None,
            });
        };

        let mut mentions: Vec<chrono::DateTime<Utc>> = self.store.read(|conn| {
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
        mentions.sort();

        if mentions.len() < 3 {
            return Ok(RelationshipHealth {
                status: "insufficient_data".into(),
                risk_level: None,
                projected_dormant_date: None,
                recommended_contact_date: None,
                days_since_contact: None,
                contact_frequency_days: None,
                trend: None,
            });
        }

        let gaps: Vec<f64> = mentions
            .windows(2)
            .map(|w| (w[1] - w[0]).num_seconds() as f64 / 86_400.0)
            .collect();
        let frequency = (gaps.iter().sum::<f64>() / gaps.len() as f64).max(1.0);

        let recent_n = gaps.len().min(3);
        let recent_mean =
            gaps[gaps.len() - recent_n..].iter().sum::<f64>() / recent_n as f64;
        let older = &gaps[..gaps.len() - recent_n];

        let last_contact = *mentions.last().expect("non-empty");
        let days_since = (Utc::now() - last_contact).num_days();

        let trend = if days_since as f64 > 2.0 * frequency {
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

        let risk_level = if days_since as f64 <= frequency {
            "low"
        } else if days_since as f64 <= 2.0 * frequency {
            "medium"
        } else {
            "high"
        };

        let projected_dormant =
            (last_contact + Duration::days((2.0 * frequency).round() as i64)).date_naive();
        let recommended_contact =
            (last_contact + Duration::days(frequency.round() as i64)).date_naive();

        Ok(RelationshipHealth {
            status: "ok".into(),
            risk_level: Some(risk_level.into()),
            projected_dormant_date: Some(projected_dormant.to_string()),
            recommended_contact_date: Some(recommended_contact.to_string()),
            days_since_contact: Some(days_since),
            contact_frequency_days: Some((frequency * 10.0).round() / 10.0),
            trend: Some(trend.into()),
        })
    }

    // ------------------------------------------------------------------
    // Candidate generation
    // ------------------------------------------------------------------

    fn vector_candidates(&self, query_vector: &[f32], k: usize) -> Result<Vec<(i64, f64)>> {
        let stored = load_all_embeddings(&self.store, EmbeddingTable::Memory)?;
        let mut scored: Vec<(i64, f64)> = stored
            .into_iter()
            .map(|(id, vector)| {
                let distance = l2_distance(query_vector, &vector) as f64;
                (id, 1.0 / (1.0 + distance))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        Ok(scored)
    }

    fn fts_candidates(&self, query: &str, k: usize) -> Result<Vec<(i64, f64)>> {
        let sanitized = sanitize_fts_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }

        let result = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT rowid FROM memories_fts
                 WHERE memories_fts MATCH ?1
                 ORDER BY bm25(memories_fts) LIMIT ?2",
            )?;
            let ids: Vec<i64> = stmt
                .query_map(params![sanitized, k as i64], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(ids)
        });

        match result {
            Ok(ids) => Ok(ids
                .into_iter()
                .enumerate()
                .map(|(rank, id)| (id, 1.0 / (1.0 + rank as f64)))
                .collect()),
            Err(e) => {
                // FTS5 unavailable or a query the tokenizer rejects; the
                // keyword LIKE pass still covers the query.
                tracing::debug!("FTS search unavailable, falling back to keyword: {}", e);
                Ok(Vec::new())
            }
        }
    }

    /// Bounded-depth weighted walk from entities mentioned in the query.
    /// Memories linked to visited entities inherit
    /// `importance × path_strength / (1 + depth)`, with a capped bonus for
    /// memories reached through several expansion entities.
    fn graph_candidates(&self, query: &str, k: usize) -> Result<Vec<(i64, f64)>> {
        // Resolve seed entities: extracted names plus the whole query
        let mut seeds: Vec<i64> = Vec::new();
        let mut candidates: Vec<String> = extract_entities(query)
            .into_iter()
            .map(|e| e.canonical_name)
            .collect();
        candidates.push(canonical_name(query));

        self.store.read(|conn| {
            for candidate in &candidates {
                if candidate.is_empty() {
                    continue;
                }
                if let Some(id) = lookup_entity_id(conn, candidate, None)? {
                    if !seeds.contains(&id) {
                        seeds.push(id);
                    }
                }
            }
            Ok(())
        })?;

        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        // BFS over current relationships, keeping the strongest path per node
        let mut best: HashMap<i64, (f64, u32)> = HashMap::new(); // id -> (path_strength, depth)
        let mut queue: VecDeque<(i64, f64, u32)> = VecDeque::new();
        for seed in &seeds {
            best.insert(*seed, (1.0, 0));
            queue.push_back((*seed, 1.0, 0));
        }

        while let Some((entity_id, strength, depth)) = queue.pop_front() {
            if depth >= 2 {
                continue;
            }
            let neighbors: Vec<(i64, f64)> = self.store.read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT CASE WHEN source_entity_id = ?1
                                 THEN target_entity_id ELSE source_entity_id END,
                            strength
                     FROM relationships
                     WHERE (source_entity_id = ?1 OR target_entity_id = ?1)
                       AND invalid_at IS NULL AND strength > 0.1",
                )?;
                let rows = stmt
                    .query_map([entity_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })?;

            for (neighbor, edge_strength) in neighbors {
                let path_strength = strength * edge_strength;
                let update = match best.get(&neighbor) {
                    Some((existing, _)) => path_strength > *existing,
                    None => true,
                };
                if update {
                    best.insert(neighbor, (path_strength, depth + 1));
                    queue.push_back((neighbor, path_strength, depth + 1));
                }
            }
        }

        // Score memories linked to visited entities
        let mut memory_scores: HashMap<i64, (f64, u32)> = HashMap::new(); // id -> (score, entity hits)
        for (entity_id, (path_strength, depth)) in &best {
            let linked: Vec<(i64, f64)> = self.store.read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT me.memory_id, m.importance
                     FROM memory_entities me
                     JOIN memories m ON m.id = me.memory_id
                     WHERE me.entity_id = ?1 AND m.invalidated_at IS NULL",
                )?;
                let rows = stmt
                    .query_map([entity_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })?;

            for (memory_id, importance) in linked {
                let contribution = importance * path_strength / (1.0 + *depth as f64);
                let entry = memory_scores.entry(memory_id).or_insert((0.0, 0));
                entry.0 = entry.0.max(contribution);
                entry.1 += 1;
            }
        }

        let mut scored: Vec<(i64, f64)> = memory_scores
            .into_iter()
            .map(|(id, (score, hits))| {
                // Multi-entity bonus, capped
                let bonus = (1.0 + 0.1 * (hits.saturating_sub(1)) as f64).min(1.3);
                (id, score * bonus)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        Ok(scored)
    }

    fn keyword_candidates(&self, query: &str, k: usize) -> Result<Vec<(i64, f64)>> {
        let like = format!("%{}%", query);
        let ids: Vec<i64> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM memories
                 WHERE content LIKE ?1 AND invalidated_at IS NULL
                 ORDER BY importance DESC, created_at DESC LIMIT ?2",
            )?;
            let ids = stmt
                .query_map(params![like, k as i64], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(ids)
        })?;
        Ok(ids
            .into_iter()
            .enumerate()
            .map(|(rank, id)| (id, 1.0 / (1.0 + rank as f64)))
            .collect())
    }

    fn weighted_fusion(
        &self,
        vector_hits: &[(i64, f64)],
        fts_hits: &[(i64, f64)],
        graph_hits: &[(i64, f64)],
        keyword_hits: &[(i64, f64)],
    ) -> Result<HashMap<i64, f64>> {
        let vector: HashMap<i64, f64> = vector_hits.iter().copied().collect();
        let fts: HashMap<i64, f64> = fts_hits.iter().copied().collect();
        let graph: HashMap<i64, f64> = graph_hits.iter().copied().collect();

        let mut candidate_ids: HashSet<i64> = HashSet::new();
        for (id, _) in vector_hits
            .iter()
            .chain(fts_hits)
            .chain(graph_hits)
            .chain(keyword_hits)
        {
            candidate_ids.insert(*id);
        }
        if candidate_ids.is_empty() {
            return Ok(HashMap::new());
        }

        // Importance and recency are row attributes
        let ids: Vec<i64> = candidate_ids.iter().copied().collect();
        let attributes: HashMap<i64, (f64, String)> = self.store.read(|conn| {
            let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            let sql = format!(
                "SELECT id, importance, created_at FROM memories WHERE id IN ({})",
                placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let bound: Vec<&dyn rusqlite::ToSql> =
                ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
            let rows = stmt
                .query_map(&bound[..], |row| {
                    Ok((row.get::<_, i64>(0)?, (row.get(1)?, row.get(2)?)))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        let now = Utc::now();
        let half_life = self.config.recency_half_life_days.max(0.1);
        let had_vectors = !vector_hits.is_empty();

        let mut fused = HashMap::new();
        for id in candidate_ids {
            let (importance, created_at) = match attributes.get(&id) {
                Some(v) => (v.0, v.1.as_str()),
                None => continue,
            };

            // No query embedding means no vector signal to disagree with;
            // a neutral prior keeps the remaining weights meaningful.
            let vector_score = match vector.get(&id) {
                Some(v) => *v,
                None if had_vectors => 0.0,
                None => 0.5,
            };
            let fts_score = fts.get(&id).copied().unwrap_or(0.0);
            let graph_score = graph.get(&id).copied().unwrap_or(0.0);

            let days_old = chrono::DateTime::parse_from_rfc3339(created_at)
                .map(|d| (now - d.with_timezone(&Utc)).num_seconds() as f64 / 86_400.0)
                .unwrap_or(0.0)
                .max(0.0);
            let recency = (-days_old * std::f64::consts::LN_2 / half_life).exp();

            let combined = self.config.vector_weight * vector_score
                + self.config.fts_weight * fts_score
                + self.config.importance_weight * importance
                + self.config.recency_weight * recency
                + self.config.graph_proximity_weight * graph_score;
            fused.insert(id, combined);
        }

        Ok(fused)
    }

    // ------------------------------------------------------------------
    // Row loading
    // ------------------------------------------------------------------

    fn load_memory_rows(&self, ids: &[i64]) -> Result<Vec<RecallResult>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.store.read(|conn| {
            let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            let sql = format!(
                "SELECT m.id, m.content, m.type, m.importance, m.created_at,
                        GROUP_CONCAT(e.name), m.metadata
                 FROM memories m
                 LEFT JOIN memory_entities me ON m.id = me.memory_id
                 LEFT JOIN entities e ON me.entity_id = e.id
                 WHERE m.id IN ({}) AND m.invalidated_at IS NULL
                 GROUP BY m.id",
                placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let bound: Vec<&dyn rusqlite::ToSql> =
                ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
            let rows = stmt
                .query_map(&bound[..], row_to_recall)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    fn memories_about(
        &self,
        entity_id: i64,
        memory_types: &[String],
        limit: usize,
        order_by: &str,
    ) -> Result<Vec<RecallResult>> {
        self.store.read(|conn| {
            let mut sql = format!(
                "SELECT m.id, m.content, m.type, m.importance, m.created_at,
                        GROUP_CONCAT(e.name), m.metadata
                 FROM memories m
                 JOIN memory_entities scope ON m.id = scope.memory_id AND scope.entity_id = ?1
                 LEFT JOIN memory_entities me ON m.id = me.memory_id
                 LEFT JOIN entities e ON me.entity_id = e.id
                 WHERE m.invalidated_at IS NULL"
            );
            let mut bound: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(entity_id)];
            if !memory_types.is_empty() {
                let placeholders = memory_types
                    .iter()
                    .map(|_| "?")
                    .collect::<Vec<_>>()
                    .join(", ");
                sql.push_str(&format!(" AND m.type IN ({})", placeholders));
                for t in memory_types {
                    bound.push(Box::new(t.clone()));
                }
            }
            sql.push_str(&format!(" GROUP BY m.id ORDER BY {}", order_by));
            if limit != usize::MAX {
                sql.push_str(" LIMIT ?");
                bound.push(Box::new(limit as i64));
            }

            let mut stmt = conn.prepare(&sql)?;
            let refs: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
            let mut rows: Vec<RecallResult> = stmt
                .query_map(&refs[..], row_to_recall)?
                .filter_map(|r| r.ok())
                .collect();
            // An entity page scores by importance
            for row in &mut rows {
                row.score = row.importance;
            }
            Ok(rows)
        })
    }

    fn relationships_of(
        &self,
        entity_id: i64,
        include_historical: bool,
    ) -> Result<Vec<RelationshipCard>> {
        self.store.read(|conn| {
            let mut sql = String::from(
                "SELECT r.relationship_type, r.direction, r.strength,
                        r.source_entity_id, r.valid_at, r.invalid_at,
                        s.name, s.type, t.name, t.type
                 FROM relationships r
                 JOIN entities s ON r.source_entity_id = s.id
                 JOIN entities t ON r.target_entity_id = t.id
                 WHERE (r.source_entity_id = ?1 OR r.target_entity_id = ?1)",
            );
            if !include_historical {
                sql.push_str(" AND r.invalid_at IS NULL");
            }
            sql.push_str(" ORDER BY r.strength DESC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([entity_id], |row| {
                    let source_id: i64 = row.get(3)?;
                    let (other_entity, other_entity_type) = if source_id == entity_id {
                        (row.get::<_, String>(8)?, row.get::<_, String>(9)?)
                    } else {
                        (row.get::<_, String>(6)?, row.get::<_, String>(7)?)
                    };
                    Ok(RelationshipCard {
                        relationship_type: row.get(0)?,
                        direction: row.get(1)?,
                        strength: row.get(2)?,
                        other_entity,
                        other_entity_type,
                        valid_at: row.get(4)?,
                        invalid_at: row.get(5)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    fn load_entity_card(&self, entity_id: i64) -> Result<EntityCard> {
        self.store.read(|conn| {
            Ok(conn.query_row(
                "SELECT id, name, type, description, importance, attention_tier
                 FROM entities WHERE id = ?1",
                [entity_id],
                |row| {
                    Ok(EntityCard {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        entity_type: row.get(2)?,
                        description: row.get(3)?,
                        importance: row.get(4)?,
                        attention_tier: row.get(5)?,
                    })
                },
            )?)
        })
    }

    fn open_commitments_for(&self, entity_id: i64) -> Result<Vec<DeadlineItem>> {
        let today = Utc::now().date_naive();
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.content, COALESCE(m.deadline_at, ''), m.importance
                 FROM memories m
                 JOIN memory_entities me ON m.id = me.memory_id AND me.entity_id = ?1
                 WHERE m.type = 'commitment'
                   AND m.invalidated_at IS NULL
                   AND m.importance > 0.1
                 ORDER BY m.deadline_at ASC",
            )?;
            let items = stmt
                .query_map([entity_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                    ))
                })?
                .filter_map(|r| r.ok())
                .map(|(id, content, deadline_at, importance)| {
                    let urgency = match NaiveDate::parse_from_str(&deadline_at, "%Y-%m-%d") {
                        Ok(d) if d < today => "overdue",
                        Ok(d) if d == today => "today",
                        Ok(d) if d <= today + Duration::days(7) => "this_week",
                        Ok(_) => "upcoming",
                        Err(_) => "unscheduled",
                    };
                    DeadlineItem {
                        id,
                        content,
                        deadline_at,
                        urgency: urgency.to_string(),
                        importance,
                        entities: Vec::new(),
                    }
                })
                .collect();
            Ok(items)
        })
    }

    fn fresh_summary(&self, entity_id: i64) -> Result<Option<String>> {
        let max_age = Duration::days(self.config.entity_summary_max_age_days);
        let cutoff = (Utc::now() - max_age).to_rfc3339();
        self.store.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT summary FROM entity_summaries
                     WHERE entity_id = ?1 AND generated_at >= ?2",
                    params![entity_id, cutoff],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    fn apply_rehearsal_boost(&self, rows: &[RecallResult]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let now = now_iso();
        self.store.transaction(|tx| {
            for row in rows {
                tx.execute(
                    "UPDATE memories
                     SET last_accessed_at = ?1, access_count = access_count + 1
                     WHERE id = ?2",
                    params![now, row.id],
                )?;
            }
            Ok(())
        })
    }
}

// ============================================================================
// FUSION AND HELPERS
// ============================================================================

/// Reciprocal Rank Fusion across ranked candidate lists:
/// `score(d) = Σ 1/(k + rank_i)` over the lists where d appears. Robust
/// when per-list scores are not comparable.
pub fn reciprocal_rank_fusion(lists: &[&[(i64, f64)]], k: f64) -> HashMap<i64, f64> {
    let mut scores: HashMap<i64, f64> = HashMap::new();
    for list in lists {
        for (rank, (id, _)) in list.iter().enumerate() {
            *scores.entry(*id).or_default() += 1.0 / (k + rank as f64);
        }
    }
    scores
}

/// Quote each token so FTS5 operators in user text cannot break the query.
pub fn sanitize_fts_query(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(" ")
}

fn split_names(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn row_to_recall(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecallResult> {
    let metadata: Option<String> = row.get(6)?;
    Ok(RecallResult {
        id: row.get(0)?,
        content: row.get(1)?,
        memory_type: row.get(2)?,
        score: 0.0,
        importance: row.get(3)?,
        created_at: row.get(4)?,
        entities: split_names(row.get(5)?),
        metadata: metadata.and_then(|raw| serde_json::from_str(&raw).ok()),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remember::{FactInput, RelateInput, Remember};

    fn services() -> (Remember, Recall, Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = MemoryConfig::default();
        config.ollama_host = "http://127.0.0.1:1".to_string(); // embeddings down
        let store = Arc::new(Store::open_at(&dir.path().join("test.db"), &config).unwrap());
        let embeddings = Arc::new(EmbeddingClient::new(&config));
        let remember = Remember::new(store.clone(), embeddings.clone());
        let recall = Recall::new(store.clone(), embeddings, config);
        (remember, recall, store, dir)
    }

    #[test]
    fn rrf_rewards_memories_in_multiple_lists() {
        let a = vec![(1i64, 0.9), (2, 0.8), (3, 0.7)];
        let b = vec![(2i64, 0.95), (4, 0.6)];
        let fused = reciprocal_rank_fusion(&[&a, &b], 60.0);

        // 2 appears in both lists, so it outranks everything
        let top = fused
            .iter()
            .max_by(|x, y| x.1.total_cmp(y.1))
            .map(|(id, _)| *id);
        assert_eq!(top, Some(2));
        assert_eq!(fused.len(), 4);
    }

    #[test]
    fn sanitize_quotes_tokens() {
        assert_eq!(sanitize_fts_query("board meeting"), "\"board\" \"meeting\"");
        assert_eq!(sanitize_fts_query("a-b (c)"), "\"a\" \"b\" \"c\"");
        assert_eq!(sanitize_fts_query("!!!"), "");
    }

    #[test]
    fn recall_without_embeddings_finds_text_matches() {
        let (remember, recall, _store, _dir) = services();

        remember
            .remember_fact(FactInput::new("The board meeting moved to Thursday"))
            .unwrap();
        remember
            .remember_fact(FactInput::new("Lunch order arrives at noon"))
            .unwrap();

        let results = recall.recall(&RecallQuery::new("board meeting")).unwrap();
        assert!(!results.is_empty());
        assert!(results[0].content.contains("board meeting"));

        // Sorted by score descending
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn recall_applies_type_and_importance_filters() {
        let (remember, recall, _store, _dir) = services();

        remember
            .remember_fact(
                FactInput::new("I'll deliver the audit by Friday").with_type("commitment"),
            )
            .unwrap();
        remember
            .remember_fact(FactInput::new("The audit process has three stages"))
            .unwrap();
        remember
            .remember_fact(FactInput::new("Minor audit trivia").importance(0.05))
            .unwrap();

        let mut query = RecallQuery::new("audit");
        query.memory_types = vec!["commitment".into()];
        let results = recall.recall(&query).unwrap();
        assert!(!results.is_empty());
        assert!(results.iter().all(|r| r.memory_type == "commitment"));

        // Default importance floor hides the 0.05 row
        let all = recall.recall(&RecallQuery::new("audit")).unwrap();
        assert!(all.iter().all(|r| r.importance >= 0.1));

        // include_low_importance lifts the floor
        let mut low = RecallQuery::new("audit");
        low.include_low_importance = true;
        let with_low = recall.recall(&low).unwrap();
        assert!(with_low.len() > all.len());
    }

    #[test]
    fn recall_boosts_access_counters() {
        let (remember, recall, store, _dir) = services();

        let outcome = remember
            .remember_fact(FactInput::new("Quarterly targets were raised"))
            .unwrap();

        recall.recall(&RecallQuery::new("quarterly targets")).unwrap();

        let (count, accessed): (i64, Option<String>) = store
            .read(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT access_count, last_accessed_at FROM memories WHERE id = ?1",
                        [outcome.memory_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .unwrap())
            })
            .unwrap();
        assert_eq!(count, 1);
        assert!(accessed.is_some());
    }

    #[test]
    fn about_filter_restricts_to_entity() {
        let (remember, recall, _store, _dir) = services();

        remember
            .remember_fact(
                FactInput::new("Sarah Chen approved the budget")
                    .about(vec!["Sarah Chen".into()]),
            )
            .unwrap();
        remember
            .remember_fact(FactInput::new("The budget grew by ten percent"))
            .unwrap();

        let mut query = RecallQuery::new("budget");
        query.about_entity = Some("Sarah Chen".into());
        let results = recall.recall(&query).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].entities.contains(&"Sarah Chen".to_string()));
    }

    #[test]
    fn recall_about_default_hides_historical() {
        let (remember, recall, _store, _dir) = services();

        remember
            .relate_entities(RelateInput {
                source: "Sarah Chen".into(),
                target: "Acme Corp".into(),
                relationship_type: "works_at".into(),
                strength: 1.0,
                direction: "bidirectional".into(),
                supersedes: false,
                metadata: None,
            })
            .unwrap();
        remember
            .relate_entities(RelateInput {
                source: "Sarah Chen".into(),
                target: "Beta Corp".into(),
                relationship_type: "works_at".into(),
                strength: 1.0,
                direction: "bidirectional".into(),
                supersedes: true,
                metadata: None,
            })
            .unwrap();

        let report = recall
            .recall_about("Sarah Chen", None, &[], false)
            .unwrap();
        let works_at: Vec<_> = report
            .relationships
            .iter()
            .filter(|r| r.relationship_type == "works_at")
            .collect();
        assert_eq!(works_at.len(), 1);
        assert_eq!(works_at[0].other_entity, "Beta Corp");

        let historical = recall
            .recall_about("Sarah Chen", None, &[], true)
            .unwrap();
        assert!(historical.relationships.len() >= 2);
        assert!(historical
            .relationships
            .iter()
            .any(|r| r.invalid_at.is_some() && r.valid_at.is_some()));
    }

    #[test]
    fn alias_resolves_in_recall_about() {
        let (remember, recall, _store, _dir) = services();

        remember
            .remember_entity(
                "Jonathan Smith",
                "person",
                None,
                &["Jonny".into()],
                None,
                None,
            )
            .unwrap();

        let report = recall.recall_about("Jonny", None, &[], false).unwrap();
        assert_eq!(report.entity.unwrap().name, "Jonathan Smith");
    }

    #[test]
    fn unknown_entity_returns_empty_report() {
        let (_remember, recall, _store, _dir) = services();
        let report = recall.recall_about("Nobody Here", None, &[], false).unwrap();
        assert!(report.entity.is_none());
        assert!(report.memories.is_empty());
    }

    #[test]
    fn overdue_deadlines_sort_first() {
        let (_remember, recall, store, _dir) = services();

        let past = (Utc::now().date_naive() - Duration::days(2)).to_string();
        let soon = (Utc::now().date_naive() + Duration::days(3)).to_string();
        store
            .transaction(|tx| {
                for (content, deadline, hash) in [
                    ("Send the contract", &past, "h-past"),
                    ("Draft the kickoff agenda", &soon, "h-soon"),
                ] {
                    tx.execute(
                        "INSERT INTO memories
                            (content, content_hash, type, importance, deadline_at,
                             created_at, updated_at)
                         VALUES (?1, ?2, 'commitment', 0.8, ?3, ?4, ?4)",
                        params![content, hash, deadline, now_iso()],
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let items = recall.recall_upcoming_deadlines(14).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].urgency, "overdue");
        assert_eq!(items[0].content, "Send the contract");
        assert_eq!(items[1].urgency, "this_week");
    }

    #[test]
    fn search_entities_matches_name_and_counts() {
        let (remember, recall, _store, _dir) = services();

        remember
            .remember_entity("Acme Corp", "organization", Some("A client"), &[], None, None)
            .unwrap();
        remember
            .remember_fact(
                FactInput::new("Acme Corp renewed for two years").about(vec!["Acme Corp".into()]),
            )
            .unwrap();

        let results = recall.search_entities("acme", &[], 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "Acme Corp");
        assert_eq!(results[0].memory_count, 1);

        let typed = recall
            .search_entities("acme", &["person".to_string()], 10)
            .unwrap();
        assert!(typed.is_empty());
    }

    #[test]
    fn trace_renders_chain_in_order() {
        let (remember, recall, _store, _dir) = services();

        let outcome = remember
            .remember_fact(
                FactInput::new("Sarah Chen moved to the Berlin office")
                    .about(vec!["Sarah Chen".into()]),
            )
            .unwrap();

        let trace = recall.trace_memory(outcome.memory_id).unwrap();
        let steps: Vec<&str> = trace.chain.iter().map(|s| s.step.as_str()).collect();
        assert_eq!(
            steps,
            vec![
                "origin",
                "memory",
                "entities",
                "source_documents",
                "corrections",
                "invalidation"
            ]
        );

        assert!(recall.trace_memory(99_999).is_err());
    }

    #[test]
    fn relationship_health_needs_three_mentions() {
        let (remember, recall, _store, _dir) = services();

        remember
            .remember_fact(FactInput::new("Talked to Ravi Gupta").about(vec!["Ravi Gupta".into()]))
            .unwrap();
        let health = recall.project_relationship_health("Ravi Gupta").unwrap();
        assert_eq!(health.status, "insufficient_data");

        remember
            .remember_fact(
                FactInput::new("Ravi Gupta shared the draft").about(vec!["Ravi Gupta".into()]),
            )
            .unwrap();
        remember
            .remember_fact(
                FactInput::new("Ravi Gupta confirmed the dates").about(vec!["Ravi Gupta".into()]),
            )
            .unwrap();

        let health = recall.project_relationship_health("Ravi Gupta").unwrap();
        assert_eq!(health.status, "ok");
        assert!(health.risk_level.is_some());
        assert!(health.contact_frequency_days.is_some());
        assert!(health.trend.is_some());
    }

    #[test]
    fn recall_since_scopes_by_time_and_entity() {
        let (remember, recall, store, _dir) = services();

        remember
            .remember_fact(FactInput::new("Old note about Dana").about(vec!["Dana".into()]))
            .unwrap();
        remember
            .remember_fact(FactInput::new("Fresh note about Dana").about(vec!["Dana".into()]))
            .unwrap();
        remember
            .remember_fact(FactInput::new("Fresh note about nobody"))
            .unwrap();

        store
            .transaction(|tx| {
                tx.execute(
                    "UPDATE memories SET created_at = '2020-01-01T00:00:00+00:00'
                     WHERE content LIKE 'Old%'",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let since = "2024-01-01T00:00:00+00:00";
        let all = recall.recall_since(since, None).unwrap();
        assert_eq!(all.len(), 2);

        let scoped = recall.recall_since(since, Some("Dana")).unwrap();
        assert_eq!(scoped.len(), 1);
        assert!(scoped[0].content.contains("Dana"));

        let unknown = recall.recall_since(since, Some("Nobody")).unwrap();
        assert!(unknown.is_empty());
    }

    #[test]
    fn recent_memories_respect_window_and_limit() {
        let (remember, recall, store, _dir) = services();

        remember
            .remember_fact(FactInput::new("Happened just now"))
            .unwrap();
        remember
            .remember_fact(FactInput::new("Happened last month"))
            .unwrap();
        store
            .transaction(|tx| {
                let old = (Utc::now() - Duration::days(30)).to_rfc3339();
                tx.execute(
                    "UPDATE memories SET created_at = ?1 WHERE content LIKE '%last month%'",
                    [&old],
                )?;
                Ok(())
            })
            .unwrap();

        let recent = recall.get_recent_memories(24, 10).unwrap();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].content.contains("just now"));
    }

    #[test]
    fn entity_overview_builds_blocks_and_cross_patterns() {
        let (remember, recall, _store, _dir) = services();

        remember
            .remember_fact(
                FactInput::new("Sarah Chen and Ravi Gupta paired on the migration")
                    .about(vec!["Sarah Chen".into(), "Ravi Gupta".into()]),
            )
            .unwrap();
        remember
            .remember_fact(
                FactInput::new("Sarah Chen and Ravi Gupta shipped the migration")
                    .about(vec!["Sarah Chen".into(), "Ravi Gupta".into()]),
            )
            .unwrap();
        remember
            .remember_fact(
                FactInput::new("I'll send Sarah Chen the summary by Friday")
                    .with_type("commitment")
                    .about(vec!["Sarah Chen".into()]),
            )
            .unwrap();
        remember
            .relate_entities(RelateInput {
                source: "Sarah Chen".into(),
                target: "Ravi Gupta".into(),
                relationship_type: "works_with".into(),
                strength: 0.9,
                direction: "bidirectional".into(),
                supersedes: false,
                metadata: None,
            })
            .unwrap();

        let overview = recall
            .entity_overview(
                &["Sarah Chen".to_string(), "Ravi Gupta".to_string()],
                true,
                false,
            )
            .unwrap();

        assert_eq!(overview.entities.len(), 2);
        let sarah = &overview.entities[0];
        assert_eq!(sarah.entity.name, "Sarah Chen");
        assert_eq!(sarah.memory_count, 3);
        assert_eq!(sarah.open_commitments.len(), 1);
        assert!(!sarah.relationships.is_empty());

        assert!(overview
            .cross_entity_patterns
            .iter()
            .any(|p| p.contains("appear together")));
        assert!(!overview.relationship_map.is_empty());
    }

    #[test]
    fn timeline_is_chronological() {
        let (remember, recall, store, _dir) = services();

        remember
            .remember_fact(FactInput::new("First meeting with Dana").about(vec!["Dana".into()]))
            .unwrap();
        remember
            .remember_fact(FactInput::new("Second sync with Dana").about(vec!["Dana".into()]))
            .unwrap();

        // Space the rows apart
        store
            .transaction(|tx| {
                tx.execute(
                    "UPDATE memories SET created_at = '2025-01-01T00:00:00+00:00'
                     WHERE content LIKE 'First%'",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let timeline = recall.recall_timeline("Dana").unwrap();
        assert_eq!(timeline.len(), 2);
        assert!(timeline[0].content.starts_with("First"));
    }
}
