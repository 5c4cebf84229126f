//! Turso Embedded / libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database holding the page directory,
//! linking scopes, immutable plan snapshots with their edges, mandatory-link
//! hints and the text-generation cache.
//!
//! **Access rules:**
//! - Planner and CLI: read-write via [`Storage::open`]
//! - Reporting and inspection: read-only via [`Storage::open_readonly`]
//! - Concurrent planning tasks each take their own connection via
//!   [`Storage::reconnect`]; plan commits run inside a single transaction
//!   and refuse to write over state that changed since the plan read it.

mod cache;
mod migrations;
mod pages;
mod plans;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use linkweave_shared::{LinkweaveError, Result};

pub use plans::{AnchorUsage, BodyChange, PlanCommit, ReadSet};

/// Milliseconds a writer waits on a locked database before giving up.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Arc<Database>,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LinkweaveError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let storage = Self::connect(Arc::new(db), false).await?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        Self::connect(Arc::new(db), true).await
    }

    /// A second handle on the same database with its own connection.
    pub async fn reconnect(&self) -> Result<Self> {
        Self::connect(Arc::clone(&self.db), self.readonly).await
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    async fn connect(db: Arc<Database>, readonly: bool) -> Result<Self> {
        let conn = db.connect().map_err(db_err)?;
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}; PRAGMA foreign_keys = ON;"
        ))
        .await
        .map_err(db_err)?;
        Ok(Self { db, conn, readonly })
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
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    LinkweaveError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(LinkweaveError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    async fn begin(&self) -> Result<()> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Commit on success, roll back on failure, and hand `result` back.
    async fn finish<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.conn.execute_batch("COMMIT").await.map_err(db_err)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK").await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn db_err(e: libsql::Error) -> LinkweaveError {
    LinkweaveError::Storage(e.to_string())
}

fn col_str(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(db_err)
}

fn col_i64(row: &libsql::Row, idx: i32) -> Result<i64> {
    row.get::<i64>(idx).map_err(db_err)
}

fn col_bool(row: &libsql::Row, idx: i32) -> Result<bool> {
    Ok(col_i64(row, idx)? != 0)
}

/// Parse a TEXT column into one of the shared string-backed enums.
fn col_enum<T>(row: &libsql::Row, idx: i32) -> Result<T>
where
    T: FromStr<Err = LinkweaveError>,
{
    let raw = col_str(row, idx)?;
    raw.parse::<T>()
        .map_err(|e| LinkweaveError::Storage(format!("corrupt column {idx}: {e}")))
}

fn opt_enum<T>(row: &libsql::Row, idx: i32) -> Result<Option<T>>
where
    T: FromStr<Err = LinkweaveError>,
{
    match row.get::<String>(idx).ok() {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| LinkweaveError::Storage(format!("corrupt column {idx}: {e}"))),
        None => Ok(None),
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LinkweaveError::Storage(format!("invalid date: {e}")))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeSet;

    use linkweave_shared::{Page, PageRole, PageStatus, Scope, ScopeKind};
    use uuid::Uuid;

    use super::Storage;

    /// Create a temp file storage for testing.
    pub async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("lw_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    pub fn page(id: &str, role: PageRole, body: &str) -> Page {
        Page {
            id: id.into(),
            url: format!("/{id}"),
            title: Some(format!("Page {id}")),
            role,
            labels: BTreeSet::from(["running".to_string()]),
            primary_term: format!("{id} term"),
            term_variants: vec![],
            priority: false,
            body: body.into(),
            word_count: body.split_whitespace().count(),
            status: PageStatus::Approved,
        }
    }

    pub fn scope(id: &str, kind: ScopeKind, members: &[&str], hub: Option<&str>) -> Scope {
        Scope {
            id: id.into(),
            name: format!("Scope {id}"),
            kind,
            members: members.iter().map(|m| m.to_string()).collect(),
            hub_id: hub.map(String::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use linkweave_shared::PageRole;
    use uuid::Uuid;

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("lw_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("lw_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.upsert_page(&page("a", PageRole::Standalone, "alpha body"))
            .await
            .unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert!(ro.get_page("a").await.unwrap().is_some());
        let result = ro
            .upsert_page(&page("b", PageRole::Standalone, "beta body"))
            .await;
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn reconnect_shares_the_database() {
        let storage = test_storage().await;
        storage
            .upsert_page(&page("a", PageRole::Standalone, "alpha body"))
            .await
            .unwrap();

        let other = storage.reconnect().await.expect("reconnect");
        assert!(!other.is_readonly());
        assert!(other.get_page("a").await.unwrap().is_some());
    }
}
