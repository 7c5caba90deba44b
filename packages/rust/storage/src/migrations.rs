//! SQL migration definitions for the kwengine database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: subcluster_snapshots, reconciliation_cache, enrichment_jobs",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Latest phrase set per subcluster, written by the curation workflow
CREATE TABLE IF NOT EXISTS subcluster_snapshots (
    subcluster_id         TEXT PRIMARY KEY,
    subcluster_name       TEXT NOT NULL,
    cluster_name          TEXT NOT NULL DEFAULT '',
    filtered_queries_json TEXT NOT NULL,
    updated_at            TEXT NOT NULL
);

-- Single-slot reconciliation result document
CREATE TABLE IF NOT EXISTS reconciliation_cache (
    slot          INTEGER PRIMARY KEY CHECK (slot = 1),
    document_json TEXT NOT NULL,
    written_at    TEXT NOT NULL
);

-- Batch enrichment history
CREATE TABLE IF NOT EXISTS enrichment_jobs (
    id          TEXT PRIMARY KEY,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    stats_json  TEXT
);

CREATE INDEX IF NOT EXISTS idx_enrichment_jobs_started ON enrichment_jobs(started_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
