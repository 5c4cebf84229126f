//! Link map reads and manual single-edge edits.
//!
//! Every edit commits a new snapshot (actor `manual:<page>`) that carries the
//! rest of the active plan forward, then re-validates the plan.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{info, instrument};

use linkweave_markdown::{
    BodyMap, find_link, find_phrase, link_markup, retext_link, unwrap_links, word_count,
};
use linkweave_shared::{
    Edge, EdgeStatus, LinkweaveError, Page, PageReport, PlacementMethod, PlanSnapshot,
    PlannerConfig, Result, Scope,
};
use linkweave_storage::{BodyChange, PlanCommit, ReadSet, Storage};

use crate::anchors::{AnchorLedger, AnchorPool, AnchorSuggestion, classify_anchor, suggest_anchors};
use crate::graph::candidate_graph;
use crate::pipeline::edge_id;
use crate::validate::validate_plan;

/// The snapshot an edit produced and the edited page's validation result.
#[derive(Debug, Clone, Serialize)]
pub struct LinkChange {
    pub snapshot: PlanSnapshot,
    pub page: PageReport,
}

/// A single-edge manual edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEdit {
    /// Link the first unlinked occurrence of `anchor` in the source body.
    Add { target: String, anchor: String },
    Remove { target: String },
    /// Change the visible text of an existing link.
    Retext { target: String, anchor: String },
}

impl LinkEdit {
    fn target(&self) -> &str {
        match self {
            Self::Add { target, .. } | Self::Remove { target } | Self::Retext { target, .. } => {
                target
            }
        }
    }
}

/// The current link map of a scope.
pub async fn link_map(storage: &Storage, scope_id: &str) -> Result<PlanSnapshot> {
    let scope = storage.require_scope(scope_id).await?;
    storage
        .active_snapshot(&scope.id)
        .await?
        .ok_or_else(|| LinkweaveError::not_found(format!("active plan for scope {scope_id}")))
}

/// Outbound edges of one page in the scope's current link map, by ordinal.
pub async fn page_links(storage: &Storage, scope_id: &str, page_id: &str) -> Result<Vec<Edge>> {
    let snapshot = link_map(storage, scope_id).await?;
    let mut edges: Vec<Edge> = snapshot
        .edges
        .into_iter()
        .filter(|e| e.source_id == page_id)
        .collect();
    edges.sort_by_key(|e| e.ordinal);
    Ok(edges)
}

/// Ranked anchor options toward `target_id`, given site-wide usage.
pub async fn anchor_suggestions(
    storage: &Storage,
    target_id: &str,
    config: &PlannerConfig,
) -> Result<Vec<AnchorSuggestion>> {
    let target = storage
        .get_page(target_id)
        .await?
        .ok_or_else(|| LinkweaveError::not_found(format!("page {target_id}")))?;
    let ledger = AnchorLedger::from_usage(&storage.anchor_usage(None).await?);
    let pool = AnchorPool::build(&target, &[]);
    Ok(suggest_anchors(
        &pool,
        &ledger,
        config.anchor_max_repeat,
        &config.anchor_mix,
    ))
}

/// Apply one manual edit to `source_id`'s links and commit it.
#[instrument(skip_all, fields(scope = scope_id, page = source_id, target_page = edit.target()))]
pub async fn edit_page_links(
    storage: &Storage,
    scope_id: &str,
    source_id: &str,
    edit: &LinkEdit,
    config: &PlannerConfig,
) -> Result<LinkChange> {
    let scope = storage.require_scope(scope_id).await?;
    let prior = link_map(storage, scope_id).await?;
    let pages = storage.scope_pages(&scope).await?;
    let mut read = ReadSet::default();
    for page in &pages {
        read.record_body(&page.id, &page.body);
    }
    let by_id: HashMap<&str, &Page> = pages.iter().map(|p| (p.id.as_str(), p)).collect();

    let source = member(&scope, &by_id, source_id)?;
    let target = member(&scope, &by_id, edit.target())?;
    if source.id == target.id {
        return Err(LinkweaveError::validation("a page cannot link to itself"));
    }

    let mut edges = prior.edges.clone();
    let existing = edges
        .iter()
        .position(|e| e.source_id == source.id && e.target_id == target.id);

    let body = match edit {
        LinkEdit::Add { anchor, .. } => {
            if existing.is_some_and(|i| edges[i].is_placed())
                || find_link(&source.body, &target.url).is_some()
            {
                return Err(LinkweaveError::Conflict(format!(
                    "{} already links to {}",
                    source.id, target.id
                )));
            }
            let body = insert_link(&source.body, anchor, &target.url)?;
            let graph = candidate_graph(&scope, &pages, config)?;
            let mandatory = graph
                .edge(&source.id, &target.id)
                .is_some_and(|e| e.mandatory);
            let ordinal = match existing {
                Some(i) => edges.remove(i).ordinal,
                None => edges
                    .iter()
                    .filter(|e| e.source_id == source.id)
                    .map(|e| e.ordinal + 1)
                    .max()
                    .unwrap_or(0),
            };
            let literal = find_link(&body, &target.url)
                .map(|l| l.text)
                .unwrap_or_else(|| anchor.clone());
            edges.push(Edge {
                id: edge_id(&source.id, &target.id),
                scope_id: scope.id.clone(),
                source_id: source.id.clone(),
                target_id: target.id.clone(),
                anchor_kind: Some(classify_anchor(&literal, target, None)),
                anchor_text: Some(literal),
                position: None,
                mandatory,
                method: Some(PlacementMethod::Manual),
                status: EdgeStatus::Placed,
                reason: None,
                ordinal,
            });
            body
        }
        LinkEdit::Remove { .. } => {
            let index = existing.ok_or_else(|| {
                LinkweaveError::not_found(format!("edge {}", edge_id(&source.id, &target.id)))
            })?;
            let removed = edges.remove(index);
            if removed.is_placed() {
                unwrap_links(&source.body, &[target.url.as_str()])
            } else {
                source.body.clone()
            }
        }
        LinkEdit::Retext { anchor, .. } => {
            let index = existing
                .filter(|&i| edges[i].is_placed())
                .ok_or_else(|| {
                    LinkweaveError::not_found(format!(
                        "placed edge {}",
                        edge_id(&source.id, &target.id)
                    ))
                })?;
            let current = find_link(&source.body, &target.url).ok_or_else(|| {
                LinkweaveError::validation(format!(
                    "{} has no link to {} in its body",
                    source.id, target.url
                ))
            })?;
            let body = retext_link(&source.body, &target.url, &current.text, anchor)
                .ok_or_else(|| LinkweaveError::validation("link could not be rewritten"))?;
            let edge = &mut edges[index];
            edge.anchor_text = Some(anchor.trim().to_string());
            edge.anchor_kind = Some(classify_anchor(anchor, target, None));
            edge.method = Some(PlacementMethod::Manual);
            body
        }
    };

    for edge in edges.iter_mut().filter(|e| e.source_id == source.id) {
        edge.position = match (edge.is_placed(), by_id.get(edge.target_id.as_str())) {
            (true, Some(t)) => find_link(&body, &t.url).map(|l| l.range.start),
            _ => None,
        };
    }

    let changes = carried_bodies(storage, &prior, &pages, source, &body, &edges, &by_id).await?;
    let final_pages: Vec<Page> = pages
        .iter()
        .map(|p| {
            if p.id == source.id {
                Page {
                    word_count: word_count(&body),
                    body: body.clone(),
                    ..p.clone()
                }
            } else {
                p.clone()
            }
        })
        .collect();

    let graph = candidate_graph(&scope, &final_pages, config)?;
    let history = AnchorLedger::from_usage(&storage.anchor_usage(Some(scope.id.as_str())).await?);
    let report = validate_plan(&graph, &final_pages, &edges, &history, config);

    let actor = format!("manual:{}", source.id);
    let snapshot = storage
        .commit_plan(&PlanCommit {
            scope_id: &scope.id,
            actor: &actor,
            edges: &edges,
            has_violations: report.has_violations(),
            bodies: &changes,
            read: Some(&read),
        })
        .await?;

    let page = report.page(&source.id).cloned().unwrap_or_else(|| PageReport {
        page_id: source.id.clone(),
        valid: true,
        violations: Vec::new(),
        under_budget: None,
    });
    info!(snapshot = %snapshot.id, valid = page.valid, "manual link edit committed");
    Ok(LinkChange { snapshot, page })
}

fn member<'a>(scope: &Scope, by_id: &HashMap<&str, &'a Page>, id: &str) -> Result<&'a Page> {
    by_id.get(id).copied().ok_or_else(|| {
        LinkweaveError::validation(format!("page {id} is not a member of scope {}", scope.id))
    })
}

/// Wrap the first unlinked prose occurrence of `anchor` in a link to `url`.
fn insert_link(body: &str, anchor: &str, url: &str) -> Result<String> {
    let map = BodyMap::analyze(body);
    let range = find_phrase(body, anchor)
        .into_iter()
        .find(|r| map.paragraph_of(r.start).is_some() && !map.is_blocked(r))
        .ok_or_else(|| {
            LinkweaveError::validation(format!("anchor \"{anchor}\" does not occur in the body"))
        })?;
    let mut out = body.to_string();
    let markup = link_markup(&body[range.clone()], url);
    out.replace_range(range, &markup);
    Ok(out)
}

/// Body records for the edit snapshot.
///
/// Records still matching the current bodies carry forward so strip and
/// rollback keep working; the edited page gets a fresh `body_after`.
async fn carried_bodies(
    storage: &Storage,
    prior: &PlanSnapshot,
    pages: &[Page],
    source: &Page,
    new_body: &str,
    edges: &[Edge],
    by_id: &HashMap<&str, &Page>,
) -> Result<Vec<BodyChange>> {
    let records: HashMap<String, BodyChange> = storage
        .snapshot_bodies(&prior.id)
        .await?
        .into_iter()
        .map(|b| (b.page_id.clone(), b))
        .collect();

    let mut changes = Vec::new();
    for page in pages {
        let record = records.get(&page.id).filter(|r| r.body_after == page.body);
        if page.id == source.id {
            let body_before = match record {
                Some(r) => r.body_before.clone(),
                None => {
                    let hrefs: Vec<&str> = edges
                        .iter()
                        .filter(|e| {
                            e.source_id == source.id
                                && e.is_placed()
                                && e.method != Some(PlacementMethod::GenerationHint)
                        })
                        .filter_map(|e| by_id.get(e.target_id.as_str()).map(|t| t.url.as_str()))
                        .collect();
                    unwrap_links(new_body, &hrefs)
                }
            };
            changes.push(BodyChange {
                page_id: page.id.clone(),
                body_before,
                body_after: new_body.to_string(),
                word_count: word_count(new_body),
            });
        } else if let Some(r) = record {
            changes.push(BodyChange {
                word_count: page.word_count,
                ..r.clone()
            });
        }
    }
    Ok(changes)
}
