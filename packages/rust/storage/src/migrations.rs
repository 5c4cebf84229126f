//! SQL migration definitions for the linkweave database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: pages, scopes, plan snapshots, edges, hints",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Page directory
CREATE TABLE IF NOT EXISTS pages (
    id                 TEXT PRIMARY KEY,
    url                TEXT NOT NULL,
    title              TEXT,
    role               TEXT NOT NULL,
    primary_term       TEXT NOT NULL,
    term_variants_json TEXT NOT NULL DEFAULT '[]',
    labels_json        TEXT NOT NULL DEFAULT '[]',
    priority           INTEGER NOT NULL DEFAULT 0,
    body               TEXT NOT NULL,
    word_count         INTEGER NOT NULL DEFAULT 0,
    status             TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);

-- Linking scopes and their ordered membership
CREATE TABLE IF NOT EXISTS scopes (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    kind       TEXT NOT NULL,
    hub_id     TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scope_members (
    scope_id TEXT NOT NULL REFERENCES scopes(id) ON DELETE CASCADE,
    page_id  TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (scope_id, page_id)
);

CREATE INDEX IF NOT EXISTS idx_scope_members_page ON scope_members(page_id);

-- Immutable plan snapshots; at most one active per scope
CREATE TABLE IF NOT EXISTS plan_snapshots (
    id             TEXT PRIMARY KEY,
    scope_id       TEXT NOT NULL REFERENCES scopes(id) ON DELETE CASCADE,
    created_at     TEXT NOT NULL,
    edge_count     INTEGER NOT NULL,
    actor          TEXT NOT NULL,
    has_violations INTEGER NOT NULL DEFAULT 0,
    active         INTEGER NOT NULL DEFAULT 0,
    superseded_at  TEXT
);

CREATE INDEX IF NOT EXISTS idx_plan_snapshots_scope ON plan_snapshots(scope_id, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_plan_snapshots_one_active
    ON plan_snapshots(scope_id) WHERE active = 1;

CREATE TABLE IF NOT EXISTS plan_edges (
    snapshot_id TEXT NOT NULL REFERENCES plan_snapshots(id) ON DELETE CASCADE,
    id          TEXT NOT NULL,
    scope_id    TEXT NOT NULL,
    source_id   TEXT NOT NULL,
    target_id   TEXT NOT NULL,
    anchor_text TEXT,
    anchor_key  TEXT,
    anchor_kind TEXT,
    position    INTEGER,
    mandatory   INTEGER NOT NULL DEFAULT 0,
    method      TEXT,
    status      TEXT NOT NULL,
    reason      TEXT,
    ordinal     INTEGER NOT NULL,
    PRIMARY KEY (snapshot_id, id)
);

CREATE INDEX IF NOT EXISTS idx_plan_edges_target ON plan_edges(target_id, anchor_key);

-- Page bodies before/after each snapshot, for rollback and re-planning
CREATE TABLE IF NOT EXISTS snapshot_pages (
    snapshot_id TEXT NOT NULL REFERENCES plan_snapshots(id) ON DELETE CASCADE,
    page_id     TEXT NOT NULL,
    body_before TEXT NOT NULL,
    body_after  TEXT NOT NULL,
    PRIMARY KEY (snapshot_id, page_id)
);

-- Mandatory-link hints handed to the page writer
CREATE TABLE IF NOT EXISTS mandatory_hints (
    scope_id    TEXT NOT NULL REFERENCES scopes(id) ON DELETE CASCADE,
    page_id     TEXT NOT NULL,
    target_id   TEXT NOT NULL,
    target_url  TEXT NOT NULL,
    anchor_text TEXT NOT NULL,
    anchor_kind TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (scope_id, page_id)
);

-- Cached text-generation results
CREATE TABLE IF NOT EXISTS generation_cache (
    id          TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    prompt_hash TEXT NOT NULL,
    model_id    TEXT NOT NULL,
    result      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    UNIQUE(prompt_hash, model_id)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Snapshot page word counts and append-only re-validation records",
            sql: r#"
ALTER TABLE snapshot_pages ADD COLUMN word_count INTEGER NOT NULL DEFAULT 0;

-- Outcomes of re-validating a snapshot after it was written; the snapshot
-- row itself never changes
CREATE TABLE IF NOT EXISTS snapshot_validations (
    snapshot_id     TEXT NOT NULL REFERENCES plan_snapshots(id) ON DELETE CASCADE,
    validated_at    TEXT NOT NULL,
    has_violations  INTEGER NOT NULL,
    violation_count INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshot_validations_snapshot
    ON snapshot_validations(snapshot_id, validated_at);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
