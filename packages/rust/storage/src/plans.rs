//! Plan snapshots, their edges, anchor usage history and mandatory hints.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use libsql::params;
use linkweave_shared::{
    AnchorKind, Edge, LinkHint, LinkweaveError, PlanReport, PlanSnapshot, Result, SnapshotSummary,
};
use uuid::Uuid;

use crate::{Storage, col_bool, col_enum, col_i64, col_str, db_err, opt_enum, parse_ts};

/// A page body rewritten by a plan commit.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyChange {
    pub page_id: String,
    /// Body as it was before this snapshot's links were injected.
    pub body_before: String,
    pub body_after: String,
    pub word_count: usize,
}

/// Everything a single plan commit writes.
#[derive(Debug, Clone)]
pub struct PlanCommit<'a> {
    pub scope_id: &'a str,
    pub actor: &'a str,
    pub edges: &'a [Edge],
    pub has_violations: bool,
    pub bodies: &'a [BodyChange],
    /// State the commit was computed from. Checked inside the commit
    /// transaction; any drift fails the commit with `Stale`.
    pub read: Option<&'a ReadSet>,
}

/// What a plan read before computing its writes.
#[derive(Debug, Clone, Default)]
pub struct ReadSet {
    /// Page id to body, as stored when read.
    pub bodies: HashMap<String, String>,
    /// Site-wide anchor usage outside the committing scope, as read.
    pub anchor_usage: Option<Vec<AnchorUsage>>,
}

impl ReadSet {
    pub fn record_body(&mut self, page_id: &str, body: &str) {
        self.bodies.insert(page_id.to_string(), body.to_string());
    }
}

/// How often an anchor literal was used toward a target in active plans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorUsage {
    pub target_id: String,
    pub anchor_key: String,
    pub anchor_kind: Option<AnchorKind>,
    pub count: usize,
}

/// The violation flag is the latest re-validation outcome, falling back to
/// the one recorded at commit.
const SNAPSHOT_COLUMNS: &str = "s.id, s.scope_id, s.created_at, s.edge_count, s.actor, \
     COALESCE((SELECT v.has_violations FROM snapshot_validations v \
               WHERE v.snapshot_id = s.id \
               ORDER BY v.validated_at DESC, v.rowid DESC LIMIT 1), s.has_violations), \
     s.active, s.superseded_at";

const EDGE_COLUMNS: &str = "id, scope_id, source_id, target_id, anchor_text, anchor_kind, \
                            position, mandatory, method, status, reason, ordinal";

impl Storage {
    // -----------------------------------------------------------------------
    // Snapshot writes
    // -----------------------------------------------------------------------

    /// Atomically supersede the scope's active snapshot with a new one,
    /// recording its edges and body changes and writing the new bodies.
    pub async fn commit_plan(&self, commit: &PlanCommit<'_>) -> Result<PlanSnapshot> {
        self.check_writable()?;
        self.begin().await?;
        let result = self.write_plan(commit).await;
        let snapshot = self.finish(result).await?;
        tracing::info!(
            scope = commit.scope_id,
            snapshot = %snapshot.id,
            edges = snapshot.edge_count,
            actor = commit.actor,
            "committed plan snapshot"
        );
        Ok(snapshot)
    }

    async fn write_plan(&self, commit: &PlanCommit<'_>) -> Result<PlanSnapshot> {
        if let Some(read) = commit.read {
            self.check_read_set(commit.scope_id, commit.edges, read)
                .await?;
        }

        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let id = Uuid::now_v7().to_string();

        self.conn
            .execute(
                "UPDATE plan_snapshots SET active = 0, superseded_at = ?1
                 WHERE scope_id = ?2 AND active = 1",
                params![now_str.as_str(), commit.scope_id],
            )
            .await
            .map_err(db_err)?;

        self.conn
            .execute(
                "INSERT INTO plan_snapshots (id, scope_id, created_at, edge_count, actor,
                                             has_violations, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
                params![
                    id.as_str(),
                    commit.scope_id,
                    now_str.as_str(),
                    commit.edges.len() as i64,
                    commit.actor,
                    i64::from(commit.has_violations),
                ],
            )
            .await
            .map_err(db_err)?;

        for edge in commit.edges {
            self.insert_edge(&id, edge).await?;
        }

        for change in commit.bodies {
            self.conn
                .execute(
                    "INSERT INTO snapshot_pages (snapshot_id, page_id, body_before, body_after,
                                                 word_count)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        id.as_str(),
                        change.page_id.as_str(),
                        change.body_before.as_str(),
                        change.body_after.as_str(),
                        change.word_count as i64,
                    ],
                )
                .await
                .map_err(db_err)?;
            self.write_body(&change.page_id, &change.body_after, change.word_count)
                .await?;
        }

        Ok(PlanSnapshot {
            id,
            scope_id: commit.scope_id.to_string(),
            created_at: now,
            edges: commit.edges.to_vec(),
            edge_count: commit.edges.len(),
            actor: commit.actor.to_string(),
            has_violations: commit.has_violations,
            active: true,
            superseded_at: None,
        })
    }

    async fn insert_edge(&self, snapshot_id: &str, edge: &Edge) -> Result<()> {
        let key = edge.anchor_key();
        self.conn
            .execute(
                "INSERT INTO plan_edges (snapshot_id, id, scope_id, source_id, target_id,
                                         anchor_text, anchor_key, anchor_kind, position,
                                         mandatory, method, status, reason, ordinal)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    snapshot_id,
                    edge.id.as_str(),
                    edge.scope_id.as_str(),
                    edge.source_id.as_str(),
                    edge.target_id.as_str(),
                    edge.anchor_text.as_deref(),
                    key.as_deref(),
                    edge.anchor_kind.map(|k| k.as_str()),
                    edge.position.map(|p| p as i64),
                    i64::from(edge.mandatory),
                    edge.method.map(|m| m.as_str()),
                    edge.status.as_str(),
                    edge.reason.map(|r| r.as_str()),
                    edge.ordinal as i64,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Fail with `Stale` when a page body or a relevant anchor count moved
    /// since `read` was taken. Runs inside the commit transaction.
    async fn check_read_set(&self, scope_id: &str, edges: &[Edge], read: &ReadSet) -> Result<()> {
        for (page_id, expected) in &read.bodies {
            let current = self.get_page(page_id).await?.map(|p| p.body);
            if current.as_deref() != Some(expected.as_str()) {
                return Err(LinkweaveError::Stale(format!(
                    "page {page_id} changed since it was read"
                )));
            }
        }

        let Some(before) = &read.anchor_usage else {
            return Ok(());
        };
        let placed: HashSet<(&str, String)> = edges
            .iter()
            .filter(|e| e.is_placed())
            .filter_map(|e| e.anchor_key().map(|k| (e.target_id.as_str(), k)))
            .collect();
        if placed.is_empty() {
            return Ok(());
        }
        let now = self.anchor_usage(Some(scope_id)).await?;
        for (target, key) in &placed {
            let was = usage_count(before, target, key);
            let is = usage_count(&now, target, key);
            if was != is {
                return Err(LinkweaveError::Stale(format!(
                    "anchor \"{key}\" toward {target} was used {is} times elsewhere, {was} when read"
                )));
            }
        }
        Ok(())
    }

    /// Append a re-validation outcome for a snapshot. The snapshot row is
    /// left as written; reads report the latest outcome.
    pub async fn record_validation(&self, snapshot_id: &str, report: &PlanReport) -> Result<()> {
        self.check_writable()?;
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM plan_snapshots WHERE id = ?1",
                params![snapshot_id],
            )
            .await
            .map_err(db_err)?;
        let exists = rows.next().await.map_err(db_err)?.is_some();
        drop(rows);
        if !exists {
            return Err(LinkweaveError::not_found(format!("snapshot {snapshot_id}")));
        }

        self.conn
            .execute(
                "INSERT INTO snapshot_validations (snapshot_id, validated_at, has_violations,
                                                   violation_count)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    snapshot_id,
                    Utc::now().to_rfc3339(),
                    i64::from(report.has_violations()),
                    report.violation_count() as i64,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Snapshot reads
    // -----------------------------------------------------------------------

    /// The scope's current link map, if it has ever been planned.
    pub async fn active_snapshot(&self, scope_id: &str) -> Result<Option<PlanSnapshot>> {
        self.query_snapshot(
            &format!("SELECT {SNAPSHOT_COLUMNS} FROM plan_snapshots s WHERE s.scope_id = ?1 AND s.active = 1"),
            scope_id,
        )
        .await
    }

    /// A snapshot by id, active or historical.
    pub async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<PlanSnapshot>> {
        self.query_snapshot(
            &format!("SELECT {SNAPSHOT_COLUMNS} FROM plan_snapshots s WHERE s.id = ?1"),
            snapshot_id,
        )
        .await
    }

    async fn query_snapshot(&self, sql: &str, key: &str) -> Result<Option<PlanSnapshot>> {
        let mut rows = self.conn.query(sql, params![key]).await.map_err(db_err)?;
        let Some(row) = rows.next().await.map_err(db_err)? else {
            return Ok(None);
        };
        let superseded_at = match row.get::<String>(7).ok() {
            Some(raw) => Some(parse_ts(&raw)?),
            None => None,
        };
        let summary = row_to_summary(&row)?;
        let edges = self.snapshot_edges(&summary.id).await?;

        Ok(Some(PlanSnapshot {
            id: summary.id,
            scope_id: summary.scope_id,
            created_at: summary.created_at,
            edges,
            edge_count: summary.edge_count,
            actor: summary.actor,
            has_violations: summary.has_violations,
            active: summary.active,
            superseded_at,
        }))
    }

    /// Edges recorded in a snapshot, ordered by source page then ordinal.
    pub async fn snapshot_edges(&self, snapshot_id: &str) -> Result<Vec<Edge>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {EDGE_COLUMNS} FROM plan_edges WHERE snapshot_id = ?1
                     ORDER BY source_id, ordinal"
                ),
                params![snapshot_id],
            )
            .await
            .map_err(db_err)?;

        let mut edges = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            edges.push(row_to_edge(&row)?);
        }
        Ok(edges)
    }

    /// Snapshot history for a scope, newest first.
    pub async fn list_snapshots(&self, scope_id: &str) -> Result<Vec<SnapshotSummary>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM plan_snapshots s WHERE s.scope_id = ?1
                     ORDER BY s.created_at DESC, s.id DESC"
                ),
                params![scope_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_summary(&row)?);
        }
        Ok(results)
    }

    /// Body changes recorded by a snapshot.
    pub async fn snapshot_bodies(&self, snapshot_id: &str) -> Result<Vec<BodyChange>> {
        let mut rows = self
            .conn
            .query(
                "SELECT page_id, body_before, body_after, word_count FROM snapshot_pages
                 WHERE snapshot_id = ?1 ORDER BY page_id",
                params![snapshot_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(BodyChange {
                page_id: col_str(&row, 0)?,
                body_before: col_str(&row, 1)?,
                body_after: col_str(&row, 2)?,
                word_count: col_i64(&row, 3)?.max(0) as usize,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Anchor usage
    // -----------------------------------------------------------------------

    /// Placed-anchor counts per `(target, anchor)` across every active snapshot,
    /// optionally leaving out one scope (the scope being re-planned).
    pub async fn anchor_usage(&self, exclude_scope: Option<&str>) -> Result<Vec<AnchorUsage>> {
        let mut rows = self
            .conn
            .query(
                "SELECT e.target_id, e.anchor_key, e.anchor_kind, COUNT(*)
                 FROM plan_edges e
                 JOIN plan_snapshots s ON s.id = e.snapshot_id
                 WHERE s.active = 1
                   AND e.status = 'placed'
                   AND e.anchor_key IS NOT NULL
                   AND (?1 IS NULL OR s.scope_id != ?1)
                 GROUP BY e.target_id, e.anchor_key, e.anchor_kind
                 ORDER BY e.target_id, e.anchor_key",
                params![exclude_scope],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(AnchorUsage {
                target_id: col_str(&row, 0)?,
                anchor_key: col_str(&row, 1)?,
                anchor_kind: opt_enum(&row, 2)?,
                count: col_i64(&row, 3)?.max(0) as usize,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Mandatory hints
    // -----------------------------------------------------------------------

    /// Replace the scope's stored hints with `hints`.
    pub async fn replace_hints(&self, scope_id: &str, hints: &[LinkHint]) -> Result<()> {
        self.check_writable()?;
        self.begin().await?;
        let result = self.write_hints(scope_id, hints).await;
        self.finish(result).await
    }

    async fn write_hints(&self, scope_id: &str, hints: &[LinkHint]) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM mandatory_hints WHERE scope_id = ?1",
                params![scope_id],
            )
            .await
            .map_err(db_err)?;

        let now = Utc::now().to_rfc3339();
        for hint in hints {
            if hint.scope_id != scope_id {
                return Err(LinkweaveError::validation(format!(
                    "hint for page {} belongs to scope {}, not {scope_id}",
                    hint.page_id, hint.scope_id
                )));
            }
            self.conn
                .execute(
                    "INSERT INTO mandatory_hints (scope_id, page_id, target_id, target_url,
                                                  anchor_text, anchor_kind, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        scope_id,
                        hint.page_id.as_str(),
                        hint.target_id.as_str(),
                        hint.target_url.as_str(),
                        hint.anchor_text.as_str(),
                        hint.anchor_kind.as_str(),
                        now.as_str(),
                    ],
                )
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    /// Stored hints for a scope, ordered by page id.
    pub async fn list_hints(&self, scope_id: &str) -> Result<Vec<LinkHint>> {
        let mut rows = self
            .conn
            .query(
                "SELECT scope_id, page_id, target_id, target_url, anchor_text, anchor_kind
                 FROM mandatory_hints WHERE scope_id = ?1 ORDER BY page_id",
                params![scope_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(LinkHint {
                scope_id: col_str(&row, 0)?,
                page_id: col_str(&row, 1)?,
                target_id: col_str(&row, 2)?,
                target_url: col_str(&row, 3)?,
                anchor_text: col_str(&row, 4)?,
                anchor_kind: col_enum(&row, 5)?,
            });
        }
        Ok(results)
    }
}

fn usage_count(usage: &[AnchorUsage], target: &str, key: &str) -> usize {
    usage
        .iter()
        .filter(|u| u.target_id == target && u.anchor_key == key)
        .map(|u| u.count)
        .sum()
}

fn row_to_summary(row: &libsql::Row) -> Result<SnapshotSummary> {
    Ok(SnapshotSummary {
        id: col_str(row, 0)?,
        scope_id: col_str(row, 1)?,
        created_at: parse_ts(&col_str(row, 2)?)?,
        edge_count: col_i64(row, 3)?.max(0) as usize,
        actor: col_str(row, 4)?,
        has_violations: col_bool(row, 5)?,
        active: col_bool(row, 6)?,
    })
}

fn row_to_edge(row: &libsql::Row) -> Result<Edge> {
    Ok(Edge {
        id: col_str(row, 0)?,
        scope_id: col_str(row, 1)?,
        source_id: col_str(row, 2)?,
        target_id: col_str(row, 3)?,
        anchor_text: row.get::<String>(4).ok(),
        anchor_kind: opt_enum(row, 5)?,
        position: row.get::<i64>(6).ok().map(|p| p.max(0) as usize),
        mandatory: col_bool(row, 7)?,
        method: opt_enum(row, 8)?,
        status: col_enum(row, 9)?,
        reason: opt_enum(row, 10)?,
        ordinal: col_i64(row, 11)?.max(0) as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use linkweave_shared::{
        EdgeStatus, PageReport, PageRole, PlacementMethod, Rule, ScopeKind, UnplacedReason,
        Violation,
    };

    fn edge(scope: &str, source: &str, target: &str, anchor: Option<&str>) -> Edge {
        Edge {
            id: Uuid::now_v7().to_string(),
            scope_id: scope.into(),
            source_id: source.into(),
            target_id: target.into(),
            anchor_text: anchor.map(String::from),
            anchor_kind: anchor.map(|_| AnchorKind::Partial),
            position: anchor.map(|_| 4),
            mandatory: false,
            method: anchor.map(|_| PlacementMethod::RuleScan),
            status: if anchor.is_some() {
                EdgeStatus::Placed
            } else {
                EdgeStatus::Unplaced
            },
            reason: anchor.is_none().then_some(UnplacedReason::NoEligibleLocation),
            ordinal: 0,
        }
    }

    async fn seeded() -> Storage {
        let storage = test_storage().await;
        for id in ["a", "b", "c"] {
            storage
                .upsert_page(&page(id, PageRole::Standalone, "original body"))
                .await
                .unwrap();
        }
        storage
            .upsert_scope(&scope("s1", ScopeKind::Flat, &["a", "b"], None))
            .await
            .unwrap();
        storage
            .upsert_scope(&scope("s2", ScopeKind::Flat, &["c", "b"], None))
            .await
            .unwrap();
        storage
    }

    #[tokio::test]
    async fn commit_plan_supersedes_the_active_snapshot() {
        let storage = seeded().await;
        let edges = vec![edge("s1", "a", "b", Some("B Term"))];
        let bodies = vec![BodyChange {
            page_id: "a".into(),
            body_before: "original body".into(),
            body_after: "original [B Term](/b) body".into(),
            word_count: 4,
        }];
        let first = storage
            .commit_plan(&PlanCommit {
                scope_id: "s1",
                actor: "test",
                edges: &edges,
                has_violations: false,
                bodies: &bodies,
                read: None,
            })
            .await
            .expect("first commit");

        let page = storage.get_page("a").await.unwrap().unwrap();
        assert_eq!(page.body, "original [B Term](/b) body");

        let second = storage
            .commit_plan(&PlanCommit {
                scope_id: "s1",
                actor: "test",
                edges: &[],
                has_violations: true,
                bodies: &[],
                read: None,
            })
            .await
            .expect("second commit");

        let active = storage.active_snapshot("s1").await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert!(active.has_violations);

        let old = storage.get_snapshot(&first.id).await.unwrap().unwrap();
        assert!(!old.active);
        assert!(old.superseded_at.is_some());
        assert_eq!(old.edges, edges);

        let history = storage.list_snapshots("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|s| s.active).count(), 1);

        let recorded = storage.snapshot_bodies(&first.id).await.unwrap();
        assert_eq!(recorded, bodies);
    }

    #[tokio::test]
    async fn failed_commit_leaves_state_untouched() {
        let storage = seeded().await;
        let edges = vec![edge("s1", "a", "b", Some("b term"))];
        let first = storage
            .commit_plan(&PlanCommit {
                scope_id: "s1",
                actor: "test",
                edges: &edges,
                has_violations: false,
                bodies: &[],
                read: None,
            })
            .await
            .unwrap();

        // Writing a body for a page that does not exist aborts the commit.
        let bodies = vec![BodyChange {
            page_id: "missing".into(),
            body_before: String::new(),
            body_after: "x".into(),
            word_count: 1,
        }];
        let result = storage
            .commit_plan(&PlanCommit {
                scope_id: "s1",
                actor: "test",
                edges: &[],
                has_violations: false,
                bodies: &bodies,
                read: None,
            })
            .await;
        assert!(result.is_err());

        let active = storage.active_snapshot("s1").await.unwrap().unwrap();
        assert_eq!(active.id, first.id);
        assert_eq!(storage.list_snapshots("s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn anchor_usage_counts_placed_edges_in_active_snapshots() {
        let storage = seeded().await;
        let s1_edges = vec![
            edge("s1", "a", "b", Some("B  Term")),
            edge("s1", "a", "c", None),
        ];
        storage
            .commit_plan(&PlanCommit {
                scope_id: "s1",
                actor: "test",
                edges: &s1_edges,
                has_violations: false,
                bodies: &[],
                read: None,
            })
            .await
            .unwrap();
        let s2_edges = vec![edge("s2", "c", "b", Some("b term"))];
        storage
            .commit_plan(&PlanCommit {
                scope_id: "s2",
                actor: "test",
                edges: &s2_edges,
                has_violations: false,
                bodies: &[],
                read: None,
            })
            .await
            .unwrap();

        let all = storage.anchor_usage(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].anchor_key, "b term");
        assert_eq!(all[0].count, 2);

        let others = storage.anchor_usage(Some("s2")).await.unwrap();
        assert_eq!(others[0].count, 1);
    }

    #[tokio::test]
    async fn commit_rejects_a_body_changed_since_read() {
        let storage = seeded().await;
        let mut read = ReadSet::default();
        read.record_body("b", "original body");

        // Another scope rewrites the shared page before this commit lands.
        let other = storage.reconnect().await.unwrap();
        other
            .update_page_body("b", "original [c term](/c) body", 4)
            .await
            .unwrap();

        let bodies = vec![BodyChange {
            page_id: "b".into(),
            body_before: "original body".into(),
            body_after: "original [a term](/a) body".into(),
            word_count: 4,
        }];
        let err = storage
            .commit_plan(&PlanCommit {
                scope_id: "s1",
                actor: "test",
                edges: &[edge("s1", "b", "a", Some("a term"))],
                has_violations: false,
                bodies: &bodies,
                read: Some(&read),
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err}");

        let page = storage.get_page("b").await.unwrap().unwrap();
        assert_eq!(page.body, "original [c term](/c) body");
        assert!(storage.active_snapshot("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_rejects_anchor_usage_that_moved_since_read() {
        let storage = seeded().await;
        let read = ReadSet {
            anchor_usage: Some(storage.anchor_usage(Some("s1")).await.unwrap()),
            ..ReadSet::default()
        };

        storage
            .commit_plan(&PlanCommit {
                scope_id: "s2",
                actor: "test",
                edges: &[edge("s2", "c", "b", Some("b term"))],
                has_violations: false,
                bodies: &[],
                read: None,
            })
            .await
            .unwrap();

        // A different anchor toward the same target is unaffected.
        storage
            .commit_plan(&PlanCommit {
                scope_id: "s1",
                actor: "test",
                edges: &[edge("s1", "a", "b", Some("b guide"))],
                has_violations: false,
                bodies: &[],
                read: Some(&read),
            })
            .await
            .expect("unrelated anchor commits");

        let err = storage
            .commit_plan(&PlanCommit {
                scope_id: "s1",
                actor: "test",
                edges: &[edge("s1", "a", "b", Some("B Term"))],
                has_violations: false,
                bodies: &[],
                read: Some(&read),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LinkweaveError::Stale(_)), "{err}");
    }

    #[tokio::test]
    async fn validations_append_without_rewriting_the_snapshot() {
        let storage = seeded().await;
        let snapshot = storage
            .commit_plan(&PlanCommit {
                scope_id: "s1",
                actor: "test",
                edges: &[],
                has_violations: false,
                bodies: &[],
                read: None,
            })
            .await
            .unwrap();

        let mut report = PlanReport::default();
        storage.record_validation(&snapshot.id, &report).await.unwrap();
        assert!(!storage.active_snapshot("s1").await.unwrap().unwrap().has_violations);

        report.pages.push(PageReport {
            page_id: "a".into(),
            valid: false,
            violations: vec![Violation {
                rule: Rule::SelfEdge,
                scope_id: "s1".into(),
                page_id: "a".into(),
                edge_id: None,
                message: "links to itself".into(),
            }],
            under_budget: None,
        });
        storage.record_validation(&snapshot.id, &report).await.unwrap();
        assert!(storage.active_snapshot("s1").await.unwrap().unwrap().has_violations);
        assert!(storage.list_snapshots("s1").await.unwrap()[0].has_violations);

        let mut rows = storage
            .conn
            .query(
                "SELECT has_violations FROM plan_snapshots WHERE id = ?1",
                params![snapshot.id.as_str()],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 0);

        assert!(matches!(
            storage.record_validation("nope", &report).await,
            Err(LinkweaveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_bodies_keep_the_recorded_word_count() {
        let storage = seeded().await;
        let bodies = vec![BodyChange {
            page_id: "a".into(),
            body_before: "original body".into(),
            body_after: "original [B Term](https://example.com/b) body `code`".into(),
            word_count: 4,
        }];
        let snapshot = storage
            .commit_plan(&PlanCommit {
                scope_id: "s1",
                actor: "test",
                edges: &[],
                has_violations: false,
                bodies: &bodies,
                read: None,
            })
            .await
            .unwrap();
        let recorded = storage.snapshot_bodies(&snapshot.id).await.unwrap();
        assert_eq!(recorded[0].word_count, 4);
    }

    #[tokio::test]
    async fn hints_replace_and_list() {
        let storage = seeded().await;
        let hint = LinkHint {
            scope_id: "s1".into(),
            page_id: "a".into(),
            target_id: "b".into(),
            target_url: "/b".into(),
            anchor_text: "b term".into(),
            anchor_kind: AnchorKind::Exact,
        };
        storage.replace_hints("s1", &[hint.clone()]).await.unwrap();
        assert_eq!(storage.list_hints("s1").await.unwrap(), vec![hint.clone()]);

        storage.replace_hints("s1", &[]).await.unwrap();
        assert!(storage.list_hints("s1").await.unwrap().is_empty());

        let foreign = LinkHint {
            scope_id: "s2".into(),
            ..hint
        };
        assert!(storage.replace_hints("s1", &[foreign]).await.is_err());
    }
}
