//! Per-scope planning pipeline: graph → selection → anchors → injection →
//! validation → atomic snapshot commit.
//!
//! Also hosts the scope-level operations that rewrite bodies outside a
//! planning run (strip, rollback) and the generation-time hint pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, instrument, warn};

use linkweave_markdown::{unwrap_links, word_count};
use linkweave_shared::{
    Edge, EdgeStatus, LinkHint, LinkweaveError, Page, PlacementMethod, PlanConfig, PlanReport,
    PlanSnapshot, PlannerConfig, Result, anchor_key,
};
use linkweave_storage::{BodyChange, PlanCommit, ReadSet, Storage};

use crate::anchors::{AnchorCandidate, AnchorLedger, AnchorPool, choose_anchor, classify_anchor};
use crate::generation::{GenerationContext, TermEnricher, TextGenerator, prompt_hash};
use crate::graph::{build_graph, candidate_graph};
use crate::inject::{LinkRequest, PageInjector, Placement};
use crate::selector::select_targets;
use crate::validate::validate_plan;

/// Phases a planning task moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanPhase {
    Queued,
    BuildingGraph,
    Selecting,
    Injecting,
    Validating,
    Done,
    Failed,
}

impl PlanPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::BuildingGraph => "building_graph",
            Self::Selecting => "selecting",
            Self::Injecting => "injecting",
            Self::Validating => "validating",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for PlanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress callback for reporting pipeline status.
pub trait PlanProgress: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, phase: PlanPhase);
    /// Called after a page's edges have been injected.
    fn page_done(&self, page_id: &str, current: usize, total: usize);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl PlanProgress for SilentProgress {
    fn phase(&self, _phase: PlanPhase) {}
    fn page_done(&self, _page_id: &str, _current: usize, _total: usize) {}
}

/// What to plan and on whose behalf.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub scope_id: String,
    /// Replace an existing active plan instead of refusing.
    pub re_plan: bool,
    pub actor: String,
}

impl PlanRequest {
    pub fn new(scope_id: impl Into<String>) -> Self {
        Self {
            scope_id: scope_id.into(),
            re_plan: false,
            actor: "cli".into(),
        }
    }

    pub fn re_plan(mut self, re_plan: bool) -> Self {
        self.re_plan = re_plan;
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

/// Result of one planning run.
#[derive(Debug, Clone, Serialize)]
pub struct PlanOutcome {
    pub snapshot: PlanSnapshot,
    pub report: PlanReport,
    pub placed: usize,
    pub unplaced: usize,
    pub fallback_calls: usize,
    pub elapsed_ms: u64,
}

/// Planning attempts before a run that keeps losing commit races gives up.
const COMMIT_ATTEMPTS: usize = 4;

/// Stable edge identifier within a scope.
pub fn edge_id(source: &str, target: &str) -> String {
    format!("{source}->{target}")
}

/// Runs planning passes against a page directory.
#[derive(Clone)]
pub struct Planner {
    config: Arc<PlanConfig>,
    generator: Arc<dyn TextGenerator>,
    enricher: Option<Arc<dyn TermEnricher>>,
}

impl Planner {
    pub fn new(config: PlanConfig, generator: Arc<dyn TextGenerator>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            generator,
            enricher: None,
        })
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn TermEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn config(&self) -> &PlanConfig {
        &self.config
    }

    /// Plan one scope end to end and commit the result as the scope's new
    /// active snapshot.
    ///
    /// A commit refused because a member body or a used anchor count changed
    /// since it was read (another scope sharing pages committed first) is
    /// planned again from fresh state.
    #[instrument(skip_all, fields(scope = %request.scope_id, re_plan = request.re_plan))]
    pub async fn plan_scope(
        &self,
        storage: &Storage,
        request: &PlanRequest,
        progress: &dyn PlanProgress,
    ) -> Result<PlanOutcome> {
        let start = Instant::now();
        let mut attempt = 1;
        loop {
            match self.plan_once(storage, request, progress, start).await {
                Err(e) if e.is_retryable() && attempt < COMMIT_ATTEMPTS => {
                    warn!(attempt, error = %e, "plan commit lost a race; re-planning");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn plan_once(
        &self,
        storage: &Storage,
        request: &PlanRequest,
        progress: &dyn PlanProgress,
        start: Instant,
    ) -> Result<PlanOutcome> {
        let cfg = &self.config.planner;

        // --- Phase 1: Graph ---
        progress.phase(PlanPhase::BuildingGraph);
        let scope = storage.require_scope(&request.scope_id).await?;
        let prior = storage.active_snapshot(&scope.id).await?;
        if let Some(prior) = &prior {
            if !request.re_plan {
                return Err(LinkweaveError::Conflict(format!(
                    "scope {} already has an active plan ({}); pass re_plan to replace it",
                    scope.id, prior.id
                )));
            }
        }

        let mut pages = storage.scope_pages(&scope).await?;
        let mut read = ReadSet::default();
        for page in &pages {
            read.record_body(&page.id, &page.body);
        }
        if let Some(prior) = &prior {
            let bodies = storage.snapshot_bodies(&prior.id).await?;
            strip_injected(&mut pages, &prior.edges, &bodies);
        }
        let graph = build_graph(&scope, &pages, cfg)?;

        // --- Phase 2: Selection ---
        progress.phase(PlanPhase::Selecting);
        let selections = select_targets(&graph, &pages, cfg);
        let usage = storage.anchor_usage(Some(scope.id.as_str())).await?;
        let history = AnchorLedger::from_usage(&usage);
        read.anchor_usage = Some(usage);
        let mut ledger = history.clone();
        let hints: HashMap<(String, String), LinkHint> = storage
            .list_hints(&scope.id)
            .await?
            .into_iter()
            .map(|h| ((h.page_id.clone(), h.target_id.clone()), h))
            .collect();
        let targets: HashSet<&str> = selections
            .iter()
            .flat_map(|s| s.targets.iter().map(|t| t.target.as_str()))
            .collect();
        let pools = self.anchor_pools(storage, &pages, &targets).await;

        // --- Phase 3: Injection ---
        progress.phase(PlanPhase::Injecting);
        let generation =
            GenerationContext::new(self.generator.as_ref(), &self.config.generation, Some(storage));
        let by_id: HashMap<&str, &Page> = pages.iter().map(|p| (p.id.as_str(), p)).collect();
        let member_urls: Vec<String> = pages.iter().map(|p| p.url.clone()).collect();
        let cap = cfg.anchor_max_repeat;

        let mut edges: Vec<Edge> = Vec::new();
        let mut final_bodies: HashMap<String, String> = HashMap::new();
        let mut fallback_calls = 0;

        for (index, (page, selection)) in pages.iter().zip(&selections).enumerate() {
            let mut injector = PageInjector::new(
                page.body.clone(),
                member_urls.clone(),
                cfg,
                self.config.fallback_limit_per_page,
            );
            let mut page_edges = Vec::with_capacity(selection.targets.len());

            for (ordinal, candidate) in selection.targets.iter().enumerate() {
                let (Some(target), Some(pool)) = (
                    by_id.get(candidate.target.as_str()),
                    pools.get(candidate.target.as_str()),
                ) else {
                    warn!(page = %page.id, target_page = %candidate.target, "no anchor pool for target");
                    continue;
                };

                let hint = hints
                    .get(&(page.id.clone(), target.id.clone()))
                    .filter(|_| candidate.mandatory);
                let anchor = match hint {
                    Some(h) => Some(AnchorCandidate {
                        text: h.anchor_text.clone(),
                        kind: h.anchor_kind,
                    }),
                    None => choose_anchor(pool, &ledger, cap, &cfg.anchor_mix, injector.body()),
                };

                let alternatives = scan_alternatives(pool, anchor.as_ref(), &ledger, cap);
                let request = LinkRequest {
                    target_id: &target.id,
                    target_url: &target.url,
                    mandatory: candidate.mandatory,
                    anchor: anchor.as_ref(),
                    alternatives: &alternatives,
                };
                let placement = injector.place(&request, &ledger, cap, &generation).await;

                let mut edge = Edge {
                    id: edge_id(&page.id, &target.id),
                    scope_id: scope.id.clone(),
                    source_id: page.id.clone(),
                    target_id: target.id.clone(),
                    anchor_text: None,
                    anchor_kind: None,
                    position: None,
                    mandatory: candidate.mandatory,
                    method: None,
                    status: EdgeStatus::Unplaced,
                    reason: None,
                    ordinal,
                };
                match placement {
                    Placement::Placed {
                        anchor_text,
                        method,
                    } => {
                        let kind = match (method, anchor.as_ref()) {
                            (PlacementMethod::GenerationHint, _) | (_, None) => {
                                classify_anchor(&anchor_text, target, Some(pool))
                            }
                            (_, Some(a)) => pool.kind_of(&anchor_text).unwrap_or(a.kind),
                        };
                        ledger.record(&target.id, &anchor_text, kind);
                        edge.anchor_text = Some(anchor_text);
                        edge.anchor_kind = Some(kind);
                        edge.method = Some(method);
                        edge.status = EdgeStatus::Placed;
                    }
                    Placement::Unplaced(reason) => {
                        warn!(
                            page = %page.id,
                            target_page = %target.id,
                            %reason,
                            "edge unplaced"
                        );
                        edge.anchor_text = anchor.as_ref().map(|a| a.text.clone());
                        edge.anchor_kind = anchor.as_ref().map(|a| a.kind);
                        edge.reason = Some(reason);
                    }
                }
                page_edges.push(edge);
            }

            for edge in page_edges.iter_mut().filter(|e| e.is_placed()) {
                edge.position = by_id
                    .get(edge.target_id.as_str())
                    .and_then(|t| injector.position_of(&t.url));
            }
            fallback_calls += injector.fallback_calls();
            edges.extend(page_edges);
            final_bodies.insert(page.id.clone(), injector.into_body());
            progress.page_done(&page.id, index + 1, pages.len());
        }

        // --- Phase 4: Validation ---
        progress.phase(PlanPhase::Validating);
        let final_pages: Vec<Page> = pages
            .iter()
            .map(|p| {
                let body = final_bodies.remove(&p.id).unwrap_or_else(|| p.body.clone());
                Page {
                    word_count: word_count(&body),
                    body,
                    ..p.clone()
                }
            })
            .collect();
        let report = validate_plan(&graph, &final_pages, &edges, &history, cfg);

        // --- Phase 5: Commit ---
        let changes: Vec<BodyChange> = pages
            .iter()
            .zip(&final_pages)
            .map(|(before, after)| BodyChange {
                page_id: before.id.clone(),
                body_before: before.body.clone(),
                body_after: after.body.clone(),
                word_count: after.word_count,
            })
            .collect();
        let snapshot = storage
            .commit_plan(&PlanCommit {
                scope_id: &scope.id,
                actor: &request.actor,
                edges: &edges,
                has_violations: report.has_violations(),
                bodies: &changes,
                read: Some(&read),
            })
            .await?;

        let placed = edges.iter().filter(|e| e.is_placed()).count();
        let outcome = PlanOutcome {
            placed,
            unplaced: edges.len() - placed,
            fallback_calls,
            elapsed_ms: start.elapsed().as_millis() as u64,
            report,
            snapshot,
        };
        progress.phase(PlanPhase::Done);

        info!(
            snapshot = %outcome.snapshot.id,
            placed = outcome.placed,
            unplaced = outcome.unplaced,
            violations = outcome.report.violation_count(),
            fallback_calls = outcome.fallback_calls,
            elapsed_ms = outcome.elapsed_ms,
            "plan complete"
        );
        Ok(outcome)
    }

    /// Compute and persist the generation-time hint for every mandatory edge.
    ///
    /// Works on draft scopes: hints are meant for the writer, before the
    /// body exists.
    #[instrument(skip_all, fields(scope = scope_id))]
    pub async fn mandatory_hints(&self, storage: &Storage, scope_id: &str) -> Result<Vec<LinkHint>> {
        let cfg = &self.config.planner;
        let scope = storage.require_scope(scope_id).await?;
        let pages = storage.scope_pages(&scope).await?;
        let graph = candidate_graph(&scope, &pages, cfg)?;
        let selections = select_targets(&graph, &pages, cfg);
        let mut ledger =
            AnchorLedger::from_usage(&storage.anchor_usage(Some(scope.id.as_str())).await?);

        let by_id: HashMap<&str, &Page> = pages.iter().map(|p| (p.id.as_str(), p)).collect();
        let targets: HashSet<&str> = selections
            .iter()
            .filter_map(|s| s.targets.first().filter(|e| e.mandatory))
            .map(|e| e.target.as_str())
            .collect();
        let pools = self.anchor_pools(storage, &pages, &targets).await;

        let mut hints = Vec::new();
        for (page, selection) in pages.iter().zip(&selections) {
            let Some(edge) = selection.targets.first().filter(|e| e.mandatory) else {
                continue;
            };
            let (Some(target), Some(pool)) = (
                by_id.get(edge.target.as_str()),
                pools.get(edge.target.as_str()),
            ) else {
                continue;
            };
            let Some(anchor) = choose_anchor(
                pool,
                &ledger,
                cfg.anchor_max_repeat,
                &cfg.anchor_mix,
                &page.body,
            ) else {
                warn!(page = %page.id, "no anchor left for mandatory hint");
                continue;
            };
            ledger.record(&target.id, &anchor.text, anchor.kind);
            hints.push(LinkHint {
                scope_id: scope.id.clone(),
                page_id: page.id.clone(),
                target_id: target.id.clone(),
                target_url: target.url.clone(),
                anchor_text: anchor.text,
                anchor_kind: anchor.kind,
            });
        }

        storage.replace_hints(&scope.id, &hints).await?;
        info!(hints = hints.len(), "stored mandatory link hints");
        Ok(hints)
    }

    /// Anchor pools for `targets`, widened by the term enricher when present.
    async fn anchor_pools(
        &self,
        storage: &Storage,
        pages: &[Page],
        targets: &HashSet<&str>,
    ) -> HashMap<String, AnchorPool> {
        let mut pools = HashMap::new();
        for page in pages.iter().filter(|p| targets.contains(p.id.as_str())) {
            let enrichment = self.enrich(storage, page).await;
            pools.insert(page.id.clone(), AnchorPool::build(page, &enrichment));
        }
        pools
    }

    /// Term variations for `page`, cached per enricher. Failures degrade to none.
    async fn enrich(&self, storage: &Storage, page: &Page) -> Vec<String> {
        let Some(enricher) = &self.enricher else {
            return Vec::new();
        };
        let hash = prompt_hash(&page.primary_term, "enrich");
        if let Ok(Some(cached)) = storage.get_generation_cache(&hash, enricher.id()).await {
            return cached.lines().map(String::from).collect();
        }

        match enricher.variations(&page.primary_term).await {
            Ok(variations) => {
                if !variations.is_empty() {
                    if let Err(e) = storage
                        .set_generation_cache("enrich", &hash, enricher.id(), &variations.join("\n"))
                        .await
                    {
                        warn!(error = %e, "failed to cache term variations");
                    }
                }
                variations
            }
            Err(e) => {
                warn!(page = %page.id, error = %e, "term enrichment failed");
                Vec::new()
            }
        }
    }
}

/// Pool phrases other than `chosen` still under the cap, same kind first.
fn scan_alternatives(
    pool: &AnchorPool,
    chosen: Option<&AnchorCandidate>,
    ledger: &AnchorLedger,
    cap: usize,
) -> Vec<AnchorCandidate> {
    let Some(chosen) = chosen else {
        return Vec::new();
    };
    let chosen_key = anchor_key(&chosen.text);
    let mut alternatives: Vec<AnchorCandidate> = pool
        .candidates()
        .iter()
        .filter(|c| anchor_key(&c.text) != chosen_key)
        .filter(|c| ledger.uses(&pool.target_id, &c.text) < cap)
        .cloned()
        .collect();
    alternatives.sort_by_key(|c| c.kind != chosen.kind);
    alternatives
}

/// The instruction handed to the content writer for one hint.
pub fn hint_instruction(hint: &LinkHint) -> String {
    format!(
        "Within the opening paragraphs, and before any other internal link, include the \
         Markdown link [{}]({}) exactly once, worked naturally into a sentence.",
        hint.anchor_text, hint.target_url
    )
}

/// Remove the links a prior snapshot injected, in memory.
///
/// A body untouched since that snapshot goes back to its recorded
/// `body_before`; an edited body only has the injected links unwrapped.
/// Links authored from generation-time hints stay.
pub(crate) fn strip_injected(pages: &mut [Page], prior: &[Edge], bodies: &[BodyChange]) {
    let urls: HashMap<String, String> = pages
        .iter()
        .map(|p| (p.id.clone(), p.url.clone()))
        .collect();

    for page in pages.iter_mut() {
        let untouched = bodies
            .iter()
            .find(|b| b.page_id == page.id && b.body_after == page.body);
        if let Some(change) = untouched {
            page.body = change.body_before.clone();
        } else {
            let hrefs: Vec<&str> = prior
                .iter()
                .filter(|e| {
                    e.source_id == page.id
                        && e.is_placed()
                        && e.method != Some(PlacementMethod::GenerationHint)
                })
                .filter_map(|e| urls.get(&e.target_id).map(String::as_str))
                .collect();
            if hrefs.is_empty() {
                continue;
            }
            page.body = unwrap_links(&page.body, &hrefs);
        }
        page.word_count = word_count(&page.body);
    }
}

/// Remove the active plan's links and make an empty snapshot current.
#[instrument(skip_all, fields(scope = scope_id))]
pub async fn strip_scope(storage: &Storage, scope_id: &str) -> Result<PlanSnapshot> {
    let scope = storage.require_scope(scope_id).await?;
    let prior = storage
        .active_snapshot(&scope.id)
        .await?
        .ok_or_else(|| LinkweaveError::not_found(format!("active plan for scope {scope_id}")))?;

    let mut pages = storage.scope_pages(&scope).await?;
    let mut read = ReadSet::default();
    for page in &pages {
        read.record_body(&page.id, &page.body);
    }
    let bodies = storage.snapshot_bodies(&prior.id).await?;
    strip_injected(&mut pages, &prior.edges, &bodies);

    let changes: Vec<BodyChange> = pages
        .iter()
        .map(|p| BodyChange {
            page_id: p.id.clone(),
            body_before: p.body.clone(),
            body_after: p.body.clone(),
            word_count: p.word_count,
        })
        .collect();
    storage
        .commit_plan(&PlanCommit {
            scope_id: &scope.id,
            actor: "strip",
            edges: &[],
            has_violations: false,
            bodies: &changes,
            read: Some(&read),
        })
        .await
}

/// Re-activate a copy of an earlier snapshot and restore its resulting bodies.
#[instrument(skip_all, fields(scope = scope_id, snapshot = snapshot_id))]
pub async fn rollback_scope(
    storage: &Storage,
    scope_id: &str,
    snapshot_id: &str,
    config: &PlannerConfig,
) -> Result<(PlanSnapshot, PlanReport)> {
    let scope = storage.require_scope(scope_id).await?;
    let target = storage
        .get_snapshot(snapshot_id)
        .await?
        .ok_or_else(|| LinkweaveError::not_found(format!("snapshot {snapshot_id}")))?;
    if target.scope_id != scope.id {
        return Err(LinkweaveError::validation(format!(
            "snapshot {} belongs to scope {}, not {}",
            target.id, target.scope_id, scope.id
        )));
    }
    if target.active {
        return Err(LinkweaveError::Conflict(format!(
            "snapshot {} is already active",
            target.id
        )));
    }

    let changes: Vec<BodyChange> = storage
        .snapshot_bodies(&target.id)
        .await?
        .into_iter()
        .filter(|b| scope.contains(&b.page_id))
        .map(|b| BodyChange {
            word_count: word_count(&b.body_after),
            ..b
        })
        .collect();
    let mut pages = storage.scope_pages(&scope).await?;
    let mut read = ReadSet::default();
    for page in pages.iter_mut() {
        read.record_body(&page.id, &page.body);
        if let Some(change) = changes.iter().find(|c| c.page_id == page.id) {
            page.body = change.body_after.clone();
            page.word_count = change.word_count;
        }
    }
    let graph = candidate_graph(&scope, &pages, config)?;
    let history = AnchorLedger::from_usage(&storage.anchor_usage(Some(scope.id.as_str())).await?);
    let report = validate_plan(&graph, &pages, &target.edges, &history, config);

    let actor = format!("rollback:{}", target.id);
    let snapshot = storage
        .commit_plan(&PlanCommit {
            scope_id: &scope.id,
            actor: &actor,
            edges: &target.edges,
            has_violations: report.has_violations(),
            bodies: &changes,
            read: Some(&read),
        })
        .await?;
    Ok((snapshot, report))
}

/// Re-run validation for the active plan against current bodies and record
/// the outcome, which the snapshot's violation flag then reports.
#[instrument(skip_all, fields(scope = scope_id))]
pub async fn validate_scope(
    storage: &Storage,
    scope_id: &str,
    config: &PlannerConfig,
) -> Result<PlanReport> {
    let scope = storage.require_scope(scope_id).await?;
    let snapshot = storage
        .active_snapshot(&scope.id)
        .await?
        .ok_or_else(|| LinkweaveError::not_found(format!("active plan for scope {scope_id}")))?;
    let pages = storage.scope_pages(&scope).await?;
    let graph = candidate_graph(&scope, &pages, config)?;
    let history = AnchorLedger::from_usage(&storage.anchor_usage(Some(scope.id.as_str())).await?);

    let report = validate_plan(&graph, &pages, &snapshot.edges, &history, config);
    storage.record_validation(&snapshot.id, &report).await?;
    Ok(report)
}
