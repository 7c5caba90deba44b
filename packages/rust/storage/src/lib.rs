//! libSQL storage layer for subcluster snapshots and reconciliation results.
//!
//! The [`Storage`] struct wraps a local libSQL database holding:
//! - the latest [`SubclusterSnapshot`] per subcluster (written by the
//!   curation workflow, read by the resolver),
//! - the single-slot reconciliation cache document,
//! - the enrichment job history.
//!
//! **Access rules:**
//! - `serve` and CLI commands that write: read-write via [`Storage::open`]
//! - CLI inspection commands: [`Storage::open_for_reading`], read-only
//!   whenever the database already exists

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use kwengine_shared::{
    FrequencyRecord, KwEngineError, ReconciliationDocument, Result, SubclusterSnapshot,
};
use libsql::{Connection, Database, params};
use tracing::warn;
use uuid::Uuid;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// One recorded enrichment batch.
#[derive(Debug, Clone)]
pub struct EnrichmentJob {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Free-form JSON summary written when the batch finishes.
    pub stats: Option<serde_json::Value>,
}

fn storage_err(e: impl std::fmt::Display) -> KwEngineError {
    KwEngineError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KwEngineError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Open `path` read-only if it exists. A missing database is created
    /// and migrated so first-run inspection sees empty tables instead of an
    /// error.
    pub async fn open_for_reading(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::open_readonly(path).await
        } else {
            Self::open(path).await
        }
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        KwEngineError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(KwEngineError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Subcluster snapshots
    // -----------------------------------------------------------------------

    /// Insert or replace the snapshot of one subcluster.
    pub async fn upsert_snapshot(&self, snapshot: &SubclusterSnapshot) -> Result<()> {
        self.check_writable()?;
        let queries_json =
            serde_json::to_string(&snapshot.filtered_queries).map_err(storage_err)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO subcluster_snapshots
                    (subcluster_id, subcluster_name, cluster_name, filtered_queries_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(subcluster_id) DO UPDATE SET
                   subcluster_name = excluded.subcluster_name,
                   cluster_name = excluded.cluster_name,
                   filtered_queries_json = excluded.filtered_queries_json,
                   updated_at = excluded.updated_at",
                params![
                    snapshot.subcluster_id.as_str(),
                    snapshot.subcluster_name.as_str(),
                    snapshot.cluster_name.as_str(),
                    queries_json.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Get one snapshot by subcluster id.
    pub async fn get_snapshot(&self, subcluster_id: &str) -> Result<Option<SubclusterSnapshot>> {
        let mut rows = self
            .conn
            .query(
                "SELECT subcluster_id, subcluster_name, cluster_name, filtered_queries_json
                 FROM subcluster_snapshots WHERE subcluster_id = ?1",
                params![subcluster_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => row_to_snapshot(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// List all snapshots ordered by id.
    ///
    /// Rows whose query list no longer decodes are skipped with a warning so
    /// one damaged subcluster does not block reconciliation of the rest.
    pub async fn list_snapshots(&self) -> Result<Vec<SubclusterSnapshot>> {
        let mut rows = self
            .conn
            .query(
                "SELECT subcluster_id, subcluster_name, cluster_name, filtered_queries_json
                 FROM subcluster_snapshots ORDER BY subcluster_id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut snapshots = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            match row_to_snapshot(&row) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(error = %e, "skipping unreadable snapshot row"),
            }
        }
        Ok(snapshots)
    }

    /// Delete a snapshot. Returns whether a row was removed.
    pub async fn delete_snapshot(&self, subcluster_id: &str) -> Result<bool> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "DELETE FROM subcluster_snapshots WHERE subcluster_id = ?1",
                params![subcluster_id],
            )
            .await
            .map_err(storage_err)?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Reconciliation cache
    // -----------------------------------------------------------------------

    /// Replace the cached reconciliation document in full.
    pub async fn write_reconciliation(&self, document: &ReconciliationDocument) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(document).map_err(storage_err)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO reconciliation_cache (slot, document_json, written_at)
                 VALUES (1, ?1, ?2)
                 ON CONFLICT(slot) DO UPDATE SET
                   document_json = excluded.document_json,
                   written_at = excluded.written_at",
                params![json.as_str(), now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Raw JSON of the cached document, exactly as written.
    pub async fn read_reconciliation_json(&self) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT document_json FROM reconciliation_cache WHERE slot = 1",
                params![],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<String>(0).map_err(storage_err)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// The cached document, or the empty sentinel if nothing was written yet.
    pub async fn read_reconciliation(&self) -> Result<ReconciliationDocument> {
        match self.read_reconciliation_json().await? {
            Some(json) => serde_json::from_str(&json).map_err(|e| {
                KwEngineError::Storage(format!("corrupt reconciliation cache: {e}"))
            }),
            None => Ok(ReconciliationDocument::empty()),
        }
    }

    // -----------------------------------------------------------------------
    // Enrichment jobs
    // -----------------------------------------------------------------------

    /// Record the start of an enrichment batch. Returns the job id.
    pub async fn insert_enrichment_job(&self) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO enrichment_jobs (id, started_at) VALUES (?1, ?2)",
                params![id.as_str(), now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(id)
    }

    /// Mark a job finished and attach its summary.
    pub async fn finish_enrichment_job(&self, job_id: &str, stats_json: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE enrichment_jobs SET finished_at = ?1, stats_json = ?2 WHERE id = ?3",
                params![now.as_str(), stats_json, job_id],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Most recent jobs first.
    pub async fn list_enrichment_jobs(&self, limit: u32) -> Result<Vec<EnrichmentJob>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, stats_json
                 FROM enrichment_jobs ORDER BY started_at DESC, id DESC LIMIT ?1",
                params![i64::from(limit)],
            )
            .await
            .map_err(storage_err)?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let started: String = row.get(1).map_err(storage_err)?;
            let finished: Option<String> = row.get::<String>(2).ok();
            let stats: Option<String> = row.get::<String>(3).ok();
            jobs.push(EnrichmentJob {
                id: row.get(0).map_err(storage_err)?,
                started_at: parse_timestamp(&started)?,
                finished_at: finished.as_deref().map(parse_timestamp).transpose()?,
                stats: stats.and_then(|s| serde_json::from_str(&s).ok()),
            });
        }
        Ok(jobs)
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| KwEngineError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to a [`SubclusterSnapshot`].
fn row_to_snapshot(row: &libsql::Row) -> Result<SubclusterSnapshot> {
    let subcluster_id: String = row.get(0).map_err(storage_err)?;
    let queries_json: String = row.get(3).map_err(storage_err)?;
    let filtered_queries: Vec<FrequencyRecord> =
        serde_json::from_str(&queries_json).map_err(|e| {
            KwEngineError::validation(format!(
                "snapshot {subcluster_id}: filteredQueries is not a phrase list: {e}"
            ))
        })?;

    Ok(SubclusterSnapshot {
        subcluster_name: row.get(1).map_err(storage_err)?,
        cluster_name: row.get(2).map_err(storage_err)?,
        subcluster_id,
        filtered_queries,
    })
}
