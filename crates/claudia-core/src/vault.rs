//! Vault Projection
//!
//! Read-only export of entities, patterns and sessions to a markdown tree.
//! Every note carries YAML frontmatter with a `sync_hash` (first 12 hex of
//! the SHA-256 of the body). A note whose on-disk body no longer matches
//! its recorded hash was edited by a human; the sync leaves it alone and
//! reports it instead of overwriting.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::store::{Result, Store};

#[derive(Debug, Default, Clone, Serialize)]
pub struct VaultReport {
    pub written: usize,
    pub unchanged: usize,
    pub edited_preserved: usize,
}

pub struct VaultSync {
    store: Arc<Store>,
    vault_dir: PathBuf,
}

struct Note {
    relative_path: PathBuf,
    claudia_id: i64,
    note_type: &'static str,
    body: String,
}

impl VaultSync {
    pub fn new(store: Arc<Store>, vault_dir: PathBuf) -> Self {
        Self { store, vault_dir }
    }

    /// Project the graph into the vault tree. Returns per-note counts.
    pub fn run_sync(&self) -> Result<VaultReport> {
        for dir in [
            "people",
            "projects",
            "organizations",
            "concepts",
            "locations",
            "patterns",
            "reflections",
            "sessions",
            "_meta",
        ] {
            std::fs::create_dir_all(self.vault_dir.join(dir))?;
        }

        let mut notes = Vec::new();
        notes.extend(self.entity_notes()?);
        notes.extend(self.pattern_notes()?);
        notes.extend(self.session_notes()?);
        notes.push(self.home_note()?);

        let mut report = VaultReport::default();
        for note in notes {
            match self.write_note(&note)? {
                WriteOutcome::Written => report.written += 1,
                WriteOutcome::Unchanged => report.unchanged += 1,
                WriteOutcome::EditedPreserved => report.edited_preserved += 1,
            }
        }

        tracing::info!(
            written = report.written,
            unchanged = report.unchanged,
            edited = report.edited_preserved,
            "vault sync complete"
        );
        Ok(report)
    }

    fn entity_notes(&self) -> Result<Vec<Note>> {
        let entities: Vec<(i64, String, String, Option<String>, f64, String)> =
            self.store.read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, type, description, importance, attention_tier
                     FROM entities WHERE deleted_at IS NULL
                     ORDER BY importance DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })?;

        let mut notes = Vec::new();
        for (id, name, entity_type, description, importance, attention_tier) in entities {
            let dir = match entity_type.as_str() {
                "person" => "people",
                "project" => "projects",
                "organization" => "organizations",
                "location" => "locations",
                _ => "concepts",
            };

            let memories: Vec<String> = self.store.read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT m.content FROM memories m
                     JOIN memory_entities me ON m.id = me.memory_id
                     WHERE me.entity_id = ?1 AND m.invalidated_at IS NULL
                       AND m.importance > 0.1
                     ORDER BY m.importance DESC LIMIT 10",
                )?;
                let rows = stmt
                    .query_map([id], |row| row.get(0))?
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
                     ORDER BY r.strength DESC",
                )?;
                let rows = stmt
                    .query_map([id], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })?;

            let mut body = format!("# {}\n\n", name);
            if let Some(desc) = &description {
                body.push_str(desc);
                body.push_str("\n\n");
            }
            body.push_str(&format!(
                "- Importance: {:.2}\n- Attention tier: {}\n",
                importance, attention_tier
            ));

            if !relationships.is_empty() {
                body.push_str("\n## Relationships\n\n");
                for (rel_type, other) in &relationships {
                    body.push_str(&format!(
                        "- {} [[{}]]\n",
                        rel_type.replace('_', " "),
                        other
                    ));
                }
            }
            if !memories.is_empty() {
                body.push_str("\n## Memories\n\n");
                for memory in &memories {
                    body.push_str(&format!("- {}\n", memory));
                }
            }

            notes.push(Note {
                relative_path: Path::new(dir).join(format!("{}.md", sanitize_filename(&name))),
                claudia_id: id,
                note_type: entity_dir_type(dir),
                body,
            });
        }
        Ok(notes)
    }

    fn pattern_notes(&self) -> Result<Vec<Note>> {
        let patterns: Vec<(i64, String, String, String, f64, i64)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, pattern_type, description, confidence, occurrences
                 FROM patterns WHERE is_active = 1
                 ORDER BY confidence DESC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        Ok(patterns
            .into_iter()
            .map(|(id, name, pattern_type, description, confidence, occurrences)| {
                let body = format!(
                    "# {}\n\n{}\n\n- Type: {}\n- Confidence: {:.2}\n- Occurrences: {}\n",
                    name, description, pattern_type, confidence, occurrences
                );
                Note {
                    relative_path: Path::new("patterns")
                        .join(format!("{}.md", sanitize_filename(&name))),
                    claudia_id: id,
                    note_type: "pattern",
                    body,
                }
            })
            .collect())
    }

    fn session_notes(&self) -> Result<Vec<Note>> {
        let episodes: Vec<(i64, String, String, String, i64)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, started_at, narrative, turn_count
                 FROM episodes
                 WHERE is_summarized = 1 AND narrative IS NOT NULL
                 ORDER BY started_at DESC",
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

        Ok(episodes
            .into_iter()
            .map(|(id, session_id, started_at, narrative, turn_count)| {
                // sessions/yyyy/mm/<session>.md
                let (year, month) = DateTime::parse_from_rfc3339(&started_at)
                    .map(|d| {
                        let d = d.with_timezone(&Utc);
                        (d.format("%Y").to_string(), d.format("%m").to_string())
                    })
                    .unwrap_or_else(|_| ("unknown".into(), "00".into()));

                let body = format!(
                    "# Session {}\n\nStarted: {}\nTurns: {}\n\n{}\n",
                    session_id, started_at, turn_count, narrative
                );
                Note {
                    relative_path: Path::new("sessions")
                        .join(year)
                        .join(month)
                        .join(format!("{}.md", sanitize_filename(&session_id))),
                    claudia_id: id,
                    note_type: "session",
                    body,
                }
            })
            .collect())
    }

    fn home_note(&self) -> Result<Note> {
        let counts: Vec<(&str, i64)> = ["memories", "entities", "relationships", "episodes"]
            .into_iter()
            .map(|table| self.store.count(table).map(|c| (table, c)))
            .collect::<Result<_>>()?;

        let active: Vec<String> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM entities
                 WHERE deleted_at IS NULL AND attention_tier = 'active'
                 ORDER BY importance DESC LIMIT 10",
            )?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        let mut body = String::from("# Home\n\n## Counts\n\n");
        for (table, count) in counts {
            body.push_str(&format!("- {}: {}\n", table, count));
        }
        if !active.is_empty() {
            body.push_str("\n## Active attention\n\n");
            for name in active {
                body.push_str(&format!("- [[{}]]\n", name));
            }
        }

        Ok(Note {
            relative_path: PathBuf::from("Home.md"),
            claudia_id: 0,
            note_type: "home",
            body,
        })
    }

    fn write_note(&self, note: &Note) -> Result<WriteOutcome> {
        let path = self.vault_dir.join(&note.relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let new_hash = sync_hash(&note.body);

        if path.exists() {
            let on_disk = std::fs::read_to_string(&path)?;
            if let Some((stored_hash, existing_body)) = parse_note(&on_disk) {
                if sync_hash(existing_body) != stored_hash {
                    tracing::info!(
                        "vault note {:?} was edited by hand; leaving it untouched",
                        note.relative_path
                    );
                    return Ok(WriteOutcome::EditedPreserved);
                }
                if stored_hash == new_hash {
                    return Ok(WriteOutcome::Unchanged);
                }
            }
        }

        let rendered = format!(
            "---\nclaudia_id: {}\ntype: {}\nsync_hash: {}\nupdated: {}\n---\n{}",
            note.claudia_id,
            note.note_type,
            new_hash,
            Utc::now().to_rfc3339(),
            note.body
        );
        std::fs::write(&path, rendered)?;
        Ok(WriteOutcome::Written)
    }
}

enum WriteOutcome {
    Written,
    Unchanged,
    EditedPreserved,
}

fn entity_dir_type(dir: &str) -> &'static str {
    match dir {
        "people" => "person",
        "projects" => "project",
        "organizations" => "organization",
        "locations" => "location",
        _ => "concept",
    }
}

/// First 12 hex chars of the SHA-256 of a note body.
pub fn sync_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        use std::fmt::Write;
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Split a rendered note into (stored sync_hash, body). None when the note
/// has no recognizable frontmatter.
fn parse_note(raw: &str) -> Option<(String, &str)> {
    let rest = raw.strip_prefix("---\n")?;
    let end = rest.find("\n---\n")?;
    let (frontmatter, body) = rest.split_at(end);
    let body = &body["\n---\n".len()..];

    let hash = frontmatter
        .lines()
        .find_map(|line| line.strip_prefix("sync_hash: "))?
        .trim()
        .to_string();
    Some((hash, body))
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c => c,
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
