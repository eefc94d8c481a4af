//! Base Schema
//!
//! The full schema for a fresh database. Everything here is idempotent
//! (`IF NOT EXISTS`); existing databases are brought up to date by the
//! ordered migrations instead.

/// Base schema applied on every open.
pub const SCHEMA: &str = r#"
-- ============================================================================
-- ENTITIES
-- ============================================================================

CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT 'person',
    canonical_name TEXT NOT NULL,
    description TEXT,
    importance REAL NOT NULL DEFAULT 1.0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,
    deleted_reason TEXT,

    -- Contact velocity (derived; see consolidation)
    last_contact_at TEXT,
    contact_frequency_days REAL,
    contact_trend TEXT,
    attention_tier TEXT NOT NULL DEFAULT 'standard',

    -- Free-form attribute map (geography, industry, company, communities, role)
    metadata TEXT
);

-- (canonical_name, type) is unique among live rows; soft-deleted rows are
-- retained for audit and excluded from the index.
CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_canonical
    ON entities(canonical_name, type) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(type);
CREATE INDEX IF NOT EXISTS idx_entities_importance ON entities(importance);

CREATE TABLE IF NOT EXISTS entity_aliases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    alias TEXT NOT NULL,
    canonical_alias TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(entity_id, canonical_alias)
);

CREATE INDEX IF NOT EXISTS idx_aliases_canonical ON entity_aliases(canonical_alias);

-- ============================================================================
-- MEMORIES
-- ============================================================================

CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL UNIQUE,
    type TEXT NOT NULL DEFAULT 'fact',
    importance REAL NOT NULL DEFAULT 1.0,
    confidence REAL NOT NULL DEFAULT 1.0,
    origin_type TEXT NOT NULL DEFAULT 'extracted',
    source TEXT,
    source_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_accessed_at TEXT,
    access_count INTEGER NOT NULL DEFAULT 0,

    -- Background verification lifecycle
    verification_status TEXT NOT NULL DEFAULT 'pending',
    verified_at TEXT,

    -- Correction / invalidation history
    corrected_at TEXT,
    corrected_from INTEGER,
    invalidated_at TEXT,
    invalidated_reason TEXT,

    -- Commitments
    deadline_at TEXT,
    temporal_markers TEXT,

    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(type);
CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
CREATE INDEX IF NOT EXISTS idx_memories_verification ON memories(verification_status);
CREATE INDEX IF NOT EXISTS idx_memories_deadline ON memories(deadline_at);

CREATE TABLE IF NOT EXISTS memory_entities (
    memory_id INTEGER NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    relationship TEXT NOT NULL DEFAULT 'about',
    PRIMARY KEY (memory_id, entity_id)
);

CREATE INDEX IF NOT EXISTS idx_memory_entities_entity ON memory_entities(entity_id);

-- ============================================================================
-- RELATIONSHIPS (bi-temporal)
-- ============================================================================

CREATE TABLE IF NOT EXISTS relationships (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    target_entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    relationship_type TEXT NOT NULL,
    strength REAL NOT NULL DEFAULT 1.0,
    direction TEXT NOT NULL DEFAULT 'bidirectional',
    origin_type TEXT NOT NULL DEFAULT 'extracted',

    -- Valid-time interval: when the fact holds in the world.
    -- invalid_at IS NULL marks the single current row per (source, target, type).
    valid_at TEXT,
    invalid_at TEXT,

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source_entity_id);
CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_entity_id);
CREATE INDEX IF NOT EXISTS idx_relationships_current
    ON relationships(source_entity_id, relationship_type) WHERE invalid_at IS NULL;

-- ============================================================================
-- EPISODES AND CONVERSATION BUFFERS
-- ============================================================================

CREATE TABLE IF NOT EXISTS episodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    turn_count INTEGER NOT NULL DEFAULT 0,
    message_count INTEGER NOT NULL DEFAULT 0,
    narrative TEXT,
    key_topics TEXT,
    is_summarized INTEGER NOT NULL DEFAULT 0,
    source TEXT
);

CREATE INDEX IF NOT EXISTS idx_episodes_started ON episodes(started_at);

CREATE TABLE IF NOT EXISTS turn_buffer (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    episode_id INTEGER NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
    turn_number INTEGER NOT NULL,
    user_content TEXT,
    assistant_content TEXT,
    created_at TEXT NOT NULL,
    is_archived INTEGER NOT NULL DEFAULT 0,
    source TEXT
);

CREATE INDEX IF NOT EXISTS idx_turn_buffer_episode ON turn_buffer(episode_id);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    episode_id INTEGER NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_episode ON messages(episode_id);
CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);

-- ============================================================================
-- PATTERNS, PREDICTIONS, REFLECTIONS
-- ============================================================================

CREATE TABLE IF NOT EXISTS patterns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    pattern_type TEXT NOT NULL,
    description TEXT NOT NULL,
    occurrences INTEGER NOT NULL DEFAULT 1,
    confidence REAL NOT NULL DEFAULT 0.5,
    evidence TEXT NOT NULL DEFAULT '[]',
    first_observed_at TEXT NOT NULL,
    last_observed_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    UNIQUE(name, pattern_type)
);

CREATE TABLE IF NOT EXISTS predictions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    prediction_type TEXT NOT NULL,
    priority REAL NOT NULL DEFAULT 0.5,
    expires_at TEXT,
    is_shown INTEGER NOT NULL DEFAULT 0,
    shown_at TEXT,
    is_acted_on INTEGER NOT NULL DEFAULT 0,
    prediction_pattern_name TEXT,
    created_at TEXT NOT NULL,
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_predictions_priority ON predictions(priority);
CREATE INDEX IF NOT EXISTS idx_predictions_shown ON predictions(is_shown);

CREATE TABLE IF NOT EXISTS reflections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    reflection_type TEXT NOT NULL DEFAULT 'observation',
    importance REAL NOT NULL DEFAULT 0.5,
    confidence REAL NOT NULL DEFAULT 0.8,
    decay_rate REAL NOT NULL DEFAULT 0.999,
    aggregation_count INTEGER NOT NULL DEFAULT 1,
    first_observed_at TEXT NOT NULL,
    last_confirmed_at TEXT NOT NULL,
    aggregated_from TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    metadata TEXT
);

-- ============================================================================
-- DOCUMENTS (filed artifacts, provenance)
-- ============================================================================

CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    doc_type TEXT NOT NULL DEFAULT 'general',
    file_path TEXT NOT NULL,
    file_hash TEXT NOT NULL UNIQUE,
    lifecycle_state TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_accessed_at TEXT
);

CREATE TABLE IF NOT EXISTS entity_documents (
    document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    PRIMARY KEY (document_id, entity_id)
);

CREATE TABLE IF NOT EXISTS memory_sources (
    memory_id INTEGER NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    PRIMARY KEY (memory_id, document_id)
);

-- ============================================================================
-- SUMMARIES, OPERATIONAL TABLES
-- ============================================================================

CREATE TABLE IF NOT EXISTS entity_summaries (
    entity_id INTEGER PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    summary TEXT NOT NULL,
    memory_count INTEGER NOT NULL DEFAULT 0,
    generated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL,
    target_table TEXT NOT NULL,
    target_id INTEGER,
    detail TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_log(created_at);

CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    value REAL NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_metrics_recorded ON metrics(recorded_at);

CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS _meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
