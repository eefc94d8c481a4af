//! Database Migrations
//!
//! Ordered migrations for databases created by earlier releases. A fresh
//! database gets everything from the base schema, so every statement here
//! must be re-runnable: `IF NOT EXISTS` where SQLite supports it, and a
//! duplicate-column swallow for `ALTER TABLE ADD COLUMN`.

use rusqlite::Connection;

use crate::store::Result;

/// A single migration: a version and the statements that bring an older
/// database up to it.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema",
        statements: &[],
    },
    Migration {
        version: 2,
        description: "Turn buffer, episode narratives and message mirror",
        statements: &[
            "ALTER TABLE episodes ADD COLUMN narrative TEXT",
            "ALTER TABLE episodes ADD COLUMN turn_count INTEGER NOT NULL DEFAULT 0",
            "ALTER TABLE episodes ADD COLUMN is_summarized INTEGER NOT NULL DEFAULT 0",
            "CREATE TABLE IF NOT EXISTS turn_buffer (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id INTEGER NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
                turn_number INTEGER NOT NULL,
                user_content TEXT,
                assistant_content TEXT,
                created_at TEXT NOT NULL,
                is_archived INTEGER NOT NULL DEFAULT 0,
                source TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_turn_buffer_episode ON turn_buffer(episode_id)",
            // Older databases stored a summary column; carry it into narrative.
            "UPDATE episodes SET is_summarized = 1
                 WHERE narrative IS NOT NULL AND narrative != ''",
        ],
    },
    Migration {
        version: 3,
        description: "FTS5 full-text index over memory content with sync triggers",
        statements: &[
            "CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
                content,
                content=memories,
                content_rowid=id,
                tokenize='porter unicode61'
            )",
            "CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
                INSERT INTO memories_fts(rowid, content) VALUES (new.id, new.content);
            END",
            "CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
                INSERT INTO memories_fts(memories_fts, rowid, content)
                VALUES ('delete', old.id, old.content);
            END",
            "CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
                INSERT INTO memories_fts(memories_fts, rowid, content)
                VALUES ('delete', old.id, old.content);
                INSERT INTO memories_fts(rowid, content) VALUES (new.id, new.content);
            END",
            // Backfill existing rows; runs once because the version gate
            // keeps this migration from re-applying.
            "INSERT INTO memories_fts(rowid, content)
                 SELECT id, content FROM memories
                 WHERE id NOT IN (SELECT rowid FROM memories_fts)",
        ],
    },
    Migration {
        version: 4,
        description: "Verification lifecycle and prediction feedback",
        statements: &[
            "ALTER TABLE memories ADD COLUMN verification_status TEXT NOT NULL DEFAULT 'pending'",
            "ALTER TABLE memories ADD COLUMN verified_at TEXT",
            "ALTER TABLE predictions ADD COLUMN prediction_pattern_name TEXT",
            "CREATE INDEX IF NOT EXISTS idx_memories_verification
                 ON memories(verification_status)",
            // Grandfather pre-verification rows so the verifier does not
            // re-process the whole history on upgrade.
            "UPDATE memories SET verification_status = 'verified',
                                 verified_at = datetime('now')
                 WHERE verification_status = 'pending'
                   AND created_at < datetime('now', '-1 day')",
        ],
    },
    Migration {
        version: 5,
        description: "Bi-temporal relationship tracking",
        statements: &[
            "ALTER TABLE relationships ADD COLUMN valid_at TEXT",
            "ALTER TABLE relationships ADD COLUMN invalid_at TEXT",
            "CREATE INDEX IF NOT EXISTS idx_relationships_current
                 ON relationships(source_entity_id, relationship_type)
                 WHERE invalid_at IS NULL",
            // Existing rows were true when we learned them.
            "UPDATE relationships SET valid_at = created_at WHERE valid_at IS NULL",
        ],
    },
    Migration {
        version: 6,
        description: "Contact velocity, attention tiers and document lifecycle",
        statements: &[
            "ALTER TABLE entities ADD COLUMN last_contact_at TEXT",
            "ALTER TABLE entities ADD COLUMN contact_frequency_days REAL",
            "ALTER TABLE entities ADD COLUMN contact_trend TEXT",
            "ALTER TABLE entities ADD COLUMN attention_tier TEXT NOT NULL DEFAULT 'standard'",
            "ALTER TABLE documents ADD COLUMN lifecycle_state TEXT NOT NULL DEFAULT 'active'",
        ],
    },
];

/// Columns whose absence marks a database as older than the migration that
/// introduces them. The integrity probe uses this to re-run a migration
/// whose recorded version lied (e.g. a crash between DDL and the version
/// row).
const INTEGRITY_CHECKS: &[(&str, &str, u32)] = &[
    ("episodes", "narrative", 2),
    ("episodes", "turn_count", 2),
    ("memories", "verification_status", 4),
    ("memories", "verified_at", 4),
    ("relationships", "valid_at", 5),
    ("relationships", "invalid_at", 5),
    ("entities", "last_contact_at", 6),
    ("entities", "attention_tier", 6),
];

/// Current recorded schema version (0 when nothing has been applied).
pub fn current_version(conn: &Connection) -> Result<u32> {
    let version = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get::<_, i64>(0),
        )
        .unwrap_or(0);
    Ok(version as u32)
}

/// Effective version after the integrity probe: the recorded version,
/// lowered below any migration whose columns are missing.
pub fn effective_version(conn: &Connection) -> Result<u32> {
    let mut version = current_version(conn)?;

    for (table, column, introduced_in) in INTEGRITY_CHECKS {
        if version >= *introduced_in && !has_column(conn, table, column)? {
            tracing::warn!(
                "integrity probe: {}.{} missing, re-running migration {}",
                table,
                column,
                introduced_in
            );
            version = version.min(introduced_in - 1);
        }
    }

    Ok(version)
}

/// Apply all pending migrations. Returns the number applied.
pub fn apply_migrations(conn: &Connection) -> Result<u32> {
    let from_version = effective_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version <= from_version {
            continue;
        }

        tracing::info!(
            "applying migration v{}: {}",
            migration.version,
            migration.description
        );

        conn.execute_batch("BEGIN")?;
        let result = run_statements(conn, migration);
        match result {
            Ok(()) => {
                conn.execute(
                    "INSERT OR REPLACE INTO schema_migrations (version, description, applied_at)
                     VALUES (?1, ?2, datetime('now'))",
                    rusqlite::params![migration.version, migration.description],
                )?;
                conn.execute_batch("COMMIT")?;
                applied += 1;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        }
    }

    Ok(applied)
}

fn run_statements(conn: &Connection, migration: &Migration) -> Result<()> {
    for stmt in migration.statements {
        if let Err(e) = conn.execute_batch(stmt) {
            let msg = e.to_string().to_lowercase();
            if msg.contains("duplicate column") || msg.contains("already exists") {
                continue;
            }
            // FTS5 may be compiled out of a foreign sqlite; keyword search
            // degrades to LIKE in that case.
            if msg.contains("no such module: fts5") {
                tracing::warn!("skipping FTS5 statement, full-text search unavailable");
                continue;
            }
            tracing::error!(
                "migration v{} statement failed: {}",
                migration.version,
                e
            );
            return Err(e.into());
        }
    }
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::SCHEMA;

    fn fresh_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn
    }

    #[test]
    fn migrations_are_ordered_and_dense() {
        for (i, m) in MIGRATIONS.iter().enumerate() {
            assert_eq!(m.version, i as u32 + 1);
        }
    }

    #[test]
    fn apply_twice_is_a_noop() {
        let conn = fresh_conn();
        let first = apply_migrations(&conn).unwrap();
        assert_eq!(first as usize, MIGRATIONS.len());

        let second = apply_migrations(&conn).unwrap();
        assert_eq!(second, 0);
    }

    #[test]
    fn integrity_probe_lowers_version_for_missing_column() {
        let conn = fresh_conn();
        apply_migrations(&conn).unwrap();

        // Simulate a half-applied v5 by rebuilding relationships without the
        // bi-temporal columns while the version row still says 6.
        conn.execute_batch(
            "DROP TABLE relationships;
             CREATE TABLE relationships (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_entity_id INTEGER NOT NULL,
                target_entity_id INTEGER NOT NULL,
                relationship_type TEXT NOT NULL,
                strength REAL NOT NULL DEFAULT 1.0,
                direction TEXT NOT NULL DEFAULT 'bidirectional',
                origin_type TEXT NOT NULL DEFAULT 'extracted',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                metadata TEXT
             );",
        )
        .unwrap();

        assert_eq!(effective_version(&conn).unwrap(), 4);

        let reapplied = apply_migrations(&conn).unwrap();
        assert_eq!(reapplied, 2); // v5 and v6 re-run
        assert!(has_column(&conn, "relationships", "valid_at").unwrap());
    }

    #[test]
    fn fresh_schema_satisfies_all_integrity_checks() {
        let conn = fresh_conn();
        for (table, column, _) in INTEGRITY_CHECKS {
            assert!(
                has_column(&conn, table, column).unwrap(),
                "{}.{} missing from base schema",
                table,
                column
            );
        }
    }
}
