//! Page directory and scope membership.

use std::collections::BTreeSet;

use chrono::Utc;
use libsql::params;
use linkweave_shared::{LinkweaveError, Page, PageStatus, Result, Scope};

use crate::{Storage, col_bool, col_enum, col_i64, col_str, db_err};

const PAGE_COLUMNS: &str = "id, url, title, role, primary_term, term_variants_json, labels_json, \
                            priority, body, word_count, status";

impl Storage {
    // -----------------------------------------------------------------------
    // Page operations
    // -----------------------------------------------------------------------

    /// Insert or replace a page in the directory.
    pub async fn upsert_page(&self, page: &Page) -> Result<()> {
        self.check_writable()?;
        let variants = to_json(&page.term_variants)?;
        let labels = to_json(&page.labels)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO pages (id, url, title, role, primary_term, term_variants_json,
                                    labels_json, priority, body, word_count, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                   url = excluded.url,
                   title = excluded.title,
                   role = excluded.role,
                   primary_term = excluded.primary_term,
                   term_variants_json = excluded.term_variants_json,
                   labels_json = excluded.labels_json,
                   priority = excluded.priority,
                   body = excluded.body,
                   word_count = excluded.word_count,
                   status = excluded.status,
                   updated_at = excluded.updated_at",
                params![
                    page.id.as_str(),
                    page.url.as_str(),
                    page.title.as_deref(),
                    page.role.as_str(),
                    page.primary_term.as_str(),
                    variants.as_str(),
                    labels.as_str(),
                    i64::from(page.priority),
                    page.body.as_str(),
                    page.word_count as i64,
                    page.status.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Get a page by id.
    pub async fn get_page(&self, id: &str) -> Result<Option<Page>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {PAGE_COLUMNS} FROM pages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_page(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// List every page in the directory, ordered by id.
    pub async fn list_pages(&self) -> Result<Vec<Page>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {PAGE_COLUMNS} FROM pages ORDER BY id"),
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_page(&row)?);
        }
        Ok(results)
    }

    /// Replace a page's body text.
    pub async fn update_page_body(&self, id: &str, body: &str, word_count: usize) -> Result<()> {
        self.check_writable()?;
        self.write_body(id, body, word_count).await
    }

    pub async fn set_page_status(&self, id: &str, status: PageStatus) -> Result<()> {
        self.update_page_field(id, "status", status.as_str().to_string())
            .await
    }

    pub async fn set_page_labels(&self, id: &str, labels: &BTreeSet<String>) -> Result<()> {
        self.update_page_field(id, "labels_json", to_json(labels)?)
            .await
    }

    pub async fn set_page_priority(&self, id: &str, priority: bool) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE pages SET priority = ?1, updated_at = ?2 WHERE id = ?3",
                params![i64::from(priority), now.as_str(), id],
            )
            .await
            .map_err(db_err)?;
        ensure_page_updated(changed, id)
    }

    async fn update_page_field(&self, id: &str, column: &str, value: String) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                &format!("UPDATE pages SET {column} = ?1, updated_at = ?2 WHERE id = ?3"),
                params![value, now.as_str(), id],
            )
            .await
            .map_err(db_err)?;
        ensure_page_updated(changed, id)
    }

    /// Body write shared by direct edits and plan commits (no writable check).
    pub(crate) async fn write_body(&self, id: &str, body: &str, word_count: usize) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE pages SET body = ?1, word_count = ?2, updated_at = ?3 WHERE id = ?4",
                params![body, word_count as i64, now.as_str(), id],
            )
            .await
            .map_err(db_err)?;
        ensure_page_updated(changed, id)
    }

    // -----------------------------------------------------------------------
    // Scope operations
    // -----------------------------------------------------------------------

    /// Insert or replace a scope and its ordered membership.
    pub async fn upsert_scope(&self, scope: &Scope) -> Result<()> {
        self.check_writable()?;
        self.begin().await?;
        let result = self.write_scope(scope).await;
        self.finish(result).await
    }

    async fn write_scope(&self, scope: &Scope) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO scopes (id, name, kind, hub_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   kind = excluded.kind,
                   hub_id = excluded.hub_id,
                   updated_at = excluded.updated_at",
                params![
                    scope.id.as_str(),
                    scope.name.as_str(),
                    scope.kind.as_str(),
                    scope.hub_id.as_deref(),
                    now.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;

        self.conn
            .execute(
                "DELETE FROM scope_members WHERE scope_id = ?1",
                params![scope.id.as_str()],
            )
            .await
            .map_err(db_err)?;

        for (position, page_id) in scope.members.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT INTO scope_members (scope_id, page_id, position) VALUES (?1, ?2, ?3)",
                    params![scope.id.as_str(), page_id.as_str(), position as i64],
                )
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    /// Get a scope by id, members in insertion order.
    pub async fn get_scope(&self, id: &str) -> Result<Option<Scope>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, kind, hub_id FROM scopes WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(db_err(e)),
        };

        let mut scope = Scope {
            id: col_str(&row, 0)?,
            name: col_str(&row, 1)?,
            kind: col_enum(&row, 2)?,
            members: Vec::new(),
            hub_id: row.get::<String>(3).ok(),
        };
        scope.members = self.scope_member_ids(id).await?;
        Ok(Some(scope))
    }

    /// Load a scope or fail with `NotFound`.
    pub async fn require_scope(&self, id: &str) -> Result<Scope> {
        self.get_scope(id)
            .await?
            .ok_or_else(|| LinkweaveError::not_found(format!("scope {id}")))
    }

    /// List all scope ids with their names and kinds.
    pub async fn list_scopes(&self) -> Result<Vec<Scope>> {
        let mut rows = self
            .conn
            .query("SELECT id FROM scopes ORDER BY id", params![])
            .await
            .map_err(db_err)?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            ids.push(col_str(&row, 0)?);
        }

        let mut scopes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(scope) = self.get_scope(&id).await? {
                scopes.push(scope);
            }
        }
        Ok(scopes)
    }

    async fn scope_member_ids(&self, scope_id: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT page_id FROM scope_members WHERE scope_id = ?1 ORDER BY position",
                params![scope_id],
            )
            .await
            .map_err(db_err)?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            ids.push(col_str(&row, 0)?);
        }
        Ok(ids)
    }

    /// Member pages of `scope`, in membership order. Missing pages are an error.
    pub async fn scope_pages(&self, scope: &Scope) -> Result<Vec<Page>> {
        let mut pages = Vec::with_capacity(scope.members.len());
        for id in &scope.members {
            let page = self.get_page(id).await?.ok_or_else(|| {
                LinkweaveError::configuration(
                    &scope.id,
                    format!("member page {id} is not in the page directory"),
                )
            })?;
            pages.push(page);
        }
        Ok(pages)
    }
}

fn ensure_page_updated(changed: u64, id: &str) -> Result<()> {
    if changed == 0 {
        return Err(LinkweaveError::not_found(format!("page {id}")));
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| LinkweaveError::Storage(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| LinkweaveError::Storage(format!("corrupt json: {e}")))
}

/// Convert a database row to a [`Page`].
fn row_to_page(row: &libsql::Row) -> Result<Page> {
    Ok(Page {
        id: col_str(row, 0)?,
        url: col_str(row, 1)?,
        title: row.get::<String>(2).ok(),
        role: col_enum(row, 3)?,
        primary_term: col_str(row, 4)?,
        term_variants: from_json(&col_str(row, 5)?)?,
        labels: from_json(&col_str(row, 6)?)?,
        priority: col_bool(row, 7)?,
        body: col_str(row, 8)?,
        word_count: col_i64(row, 9)?.max(0) as usize,
        status: col_enum(row, 10)?,
    })
}
