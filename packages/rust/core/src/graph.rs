//! Candidate link graph for one scope.
//!
//! Each scope kind has its own [`GraphStrategy`]; [`build_graph`] resolves the
//! hub, assigns every member its [`ScopePosition`] and asks the strategy for
//! weighted candidate edges. Only edges the direction matrix allows are kept.

use std::collections::{BTreeSet, HashMap};

use linkweave_shared::{
    LinkweaveError, Page, PageRole, PlannerConfig, Result, Scope, ScopeKind, ScopePosition,
};

/// A directed link proposal with its selection weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateEdge {
    pub source: String,
    pub target: String,
    pub weight: i64,
    /// Raw topical affinity (shared labels or term similarity).
    pub affinity: i64,
    pub mandatory: bool,
    /// Priority flag of the target page.
    pub priority: bool,
    /// Membership index of the target; the final tie-break.
    pub order: usize,
}

/// Weighted candidate edges plus the position of every member.
#[derive(Debug, Clone)]
pub struct CandidateGraph {
    pub scope_id: String,
    pub kind: ScopeKind,
    pub hub_id: Option<String>,
    positions: HashMap<String, ScopePosition>,
    edges: Vec<CandidateEdge>,
}

impl CandidateGraph {
    pub fn edges(&self) -> &[CandidateEdge] {
        &self.edges
    }

    /// Candidate edges leaving `source`, in construction order.
    pub fn outgoing<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a CandidateEdge> {
        self.edges.iter().filter(move |e| e.source == source)
    }

    pub fn edge(&self, source: &str, target: &str) -> Option<&CandidateEdge> {
        self.edges
            .iter()
            .find(|e| e.source == source && e.target == target)
    }

    pub fn position(&self, page_id: &str) -> Option<ScopePosition> {
        self.positions.get(page_id).copied()
    }

    /// Whether the direction matrix allows `source` to link to `target`.
    /// Non-members and self-links are never permitted.
    pub fn permits(&self, source: &str, target: &str) -> bool {
        if source == target {
            return false;
        }
        match (self.position(source), self.position(target)) {
            (Some(from), Some(to)) => from.may_link(to),
            _ => false,
        }
    }

    /// Whether pages at `page_id`'s position owe the hub a first link.
    pub fn requires_hub_link(&self, page_id: &str) -> bool {
        matches!(
            self.position(page_id),
            Some(ScopePosition::Dependent | ScopePosition::Satellite)
        )
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Inputs shared by every strategy.
pub struct GraphContext<'a> {
    pub pages: &'a [Page],
    pub hub_id: Option<&'a str>,
    pub positions: &'a HashMap<String, ScopePosition>,
    pub config: &'a PlannerConfig,
}

impl GraphContext<'_> {
    fn at(&self, position: ScopePosition) -> impl Iterator<Item = (usize, &Page)> {
        self.pages
            .iter()
            .enumerate()
            .filter(move |(_, p)| self.positions.get(&p.id) == Some(&position))
    }

    fn bonus(&self, target: &Page) -> i64 {
        if target.priority {
            self.config.priority_bonus
        } else {
            0
        }
    }

    fn edge(&self, source: &Page, target: (usize, &Page), affinity: i64, weight: i64) -> CandidateEdge {
        CandidateEdge {
            source: source.id.clone(),
            target: target.1.id.clone(),
            weight,
            affinity,
            mandatory: false,
            priority: target.1.priority,
            order: target.0,
        }
    }
}

/// Produces candidate edges for one scope kind.
pub trait GraphStrategy: Send + Sync {
    fn candidates(&self, ctx: &GraphContext<'_>) -> Vec<CandidateEdge>;
}

/// Label-overlap relatedness between peers.
pub struct FlatStrategy;

impl GraphStrategy for FlatStrategy {
    fn candidates(&self, ctx: &GraphContext<'_>) -> Vec<CandidateEdge> {
        let min_shared = ctx.config.related_min_shared_labels;
        let mut edges = Vec::new();
        for source in ctx.pages {
            for (order, target) in ctx.pages.iter().enumerate() {
                if source.id == target.id {
                    continue;
                }
                let shared = shared_labels(source, target);
                if shared < min_shared {
                    continue;
                }
                let affinity = shared as i64;
                let weight = affinity * ctx.config.label_weight + ctx.bonus(target);
                edges.push(ctx.edge(source, (order, target), affinity, weight));
            }
        }
        edges
    }
}

/// One hub with dependents linking up and to their closest siblings.
pub struct HierarchicalStrategy;

impl GraphStrategy for HierarchicalStrategy {
    fn candidates(&self, ctx: &GraphContext<'_>) -> Vec<CandidateEdge> {
        let Some(hub) = ctx.at(ScopePosition::Hub).next() else {
            return Vec::new();
        };
        let dependents: Vec<(usize, &Page)> = ctx.at(ScopePosition::Dependent).collect();
        let mut edges = Vec::new();

        for &(order, dependent) in &dependents {
            edges.push(CandidateEdge {
                mandatory: true,
                ..ctx.edge(dependent, hub, 0, 0)
            });

            let mut siblings: Vec<(i64, (usize, &Page))> = dependents
                .iter()
                .filter(|(o, _)| *o != order)
                .map(|&(o, p)| (term_affinity(dependent, p), (o, p)))
                .filter(|(affinity, _)| *affinity > 0)
                .collect();
            siblings.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.0.cmp(&b.1.0)));
            for (affinity, sibling) in siblings.into_iter().take(ctx.config.sibling_top_k) {
                let weight = affinity + ctx.bonus(sibling.1);
                edges.push(ctx.edge(dependent, sibling, affinity, weight));
            }
        }

        for &dependent in &dependents {
            let weight = 1 + ctx.bonus(dependent.1);
            edges.push(ctx.edge(hub.1, dependent, 0, weight));
        }
        edges
    }
}

/// Hub, anchor pages and satellites that only link up and sideways.
pub struct SiloedStrategy;

impl GraphStrategy for SiloedStrategy {
    fn candidates(&self, ctx: &GraphContext<'_>) -> Vec<CandidateEdge> {
        let Some(hub) = ctx.at(ScopePosition::Hub).next() else {
            return Vec::new();
        };
        let anchors: Vec<(usize, &Page)> = ctx.at(ScopePosition::Anchor).collect();
        let satellites: Vec<(usize, &Page)> = ctx.at(ScopePosition::Satellite).collect();
        let mut edges = Vec::new();

        for &(order, satellite) in &satellites {
            edges.push(CandidateEdge {
                mandatory: true,
                ..ctx.edge(satellite, hub, 0, 0)
            });
            for &anchor in &anchors {
                let affinity = term_affinity(satellite, anchor.1);
                edges.push(ctx.edge(satellite, anchor, affinity, affinity + ctx.bonus(anchor.1)));
            }
            for &sibling in satellites.iter().filter(|(o, _)| *o != order) {
                let affinity = term_affinity(satellite, sibling.1);
                if affinity > 0 {
                    edges.push(ctx.edge(satellite, sibling, affinity, affinity + ctx.bonus(sibling.1)));
                }
            }
        }

        for &(order, anchor) in &anchors {
            edges.push(ctx.edge(anchor, hub, 0, 1 + ctx.bonus(hub.1)));
            for &other in anchors.iter().filter(|(o, _)| *o != order) {
                let affinity = term_affinity(anchor, other.1);
                edges.push(ctx.edge(anchor, other, affinity, affinity + ctx.bonus(other.1)));
            }
            for &satellite in &satellites {
                let affinity = term_affinity(anchor, satellite.1);
                if affinity > 0 {
                    edges.push(ctx.edge(anchor, satellite, affinity, affinity + ctx.bonus(satellite.1)));
                }
            }
        }

        for &target in anchors.iter().chain(satellites.iter()) {
            edges.push(ctx.edge(hub.1, target, 0, 1 + ctx.bonus(target.1)));
        }
        edges
    }
}

/// The strategy for a scope kind.
pub fn strategy_for(kind: ScopeKind) -> &'static dyn GraphStrategy {
    match kind {
        ScopeKind::Flat => &FlatStrategy,
        ScopeKind::Hierarchical => &HierarchicalStrategy,
        ScopeKind::Siloed => &SiloedStrategy,
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Resolve the hub of a hierarchical or siloed scope.
///
/// The designated hub wins when it is a member; otherwise exactly one member
/// must carry the `hub` role. Flat scopes have no hub.
pub fn resolve_hub(scope: &Scope, pages: &[Page]) -> Result<Option<String>> {
    if !scope.kind.requires_hub() {
        return Ok(None);
    }
    if let Some(hub) = scope.hub_id.as_deref() {
        if scope.contains(hub) {
            return Ok(Some(hub.to_string()));
        }
        tracing::warn!(scope = %scope.id, hub, "designated hub is not a member");
    }
    let hubs: Vec<&Page> = pages.iter().filter(|p| p.role == PageRole::Hub).collect();
    match hubs.as_slice() {
        [hub] => Ok(Some(hub.id.clone())),
        [] => Err(LinkweaveError::configuration(
            &scope.id,
            format!("{} scope has no resolvable hub", scope.kind),
        )),
        many => Err(LinkweaveError::configuration(
            &scope.id,
            format!(
                "{} scope has {} hub-role members and no designated hub",
                scope.kind,
                many.len()
            ),
        )),
    }
}

/// Build the candidate graph for `scope` from its member pages.
///
/// Fails fast, before any edge exists, when a member is still a draft or the
/// scope needs a hub it cannot resolve.
pub fn build_graph(scope: &Scope, pages: &[Page], config: &PlannerConfig) -> Result<CandidateGraph> {
    if let Some(draft) = pages.iter().find(|p| !p.is_finalized()) {
        return Err(LinkweaveError::configuration(
            &scope.id,
            format!("page {} is still a draft", draft.id),
        ));
    }
    candidate_graph(scope, pages, config)
}

/// [`build_graph`] without the finalization check. Generation-time hints are
/// computed while members are still drafts.
pub fn candidate_graph(
    scope: &Scope,
    pages: &[Page],
    config: &PlannerConfig,
) -> Result<CandidateGraph> {
    if let Some(stranger) = pages.iter().find(|p| !scope.contains(&p.id)) {
        return Err(LinkweaveError::configuration(
            &scope.id,
            format!("page {} is not a member", stranger.id),
        ));
    }

    let hub_id = resolve_hub(scope, pages)?;
    let positions: HashMap<String, ScopePosition> = pages
        .iter()
        .map(|p| {
            let is_hub = hub_id.as_deref() == Some(p.id.as_str());
            (p.id.clone(), ScopePosition::of(scope.kind, p.role, is_hub))
        })
        .collect();

    let ctx = GraphContext {
        pages,
        hub_id: hub_id.as_deref(),
        positions: &positions,
        config,
    };
    let mut edges = strategy_for(scope.kind).candidates(&ctx);
    edges.retain(|e| {
        let allowed = match (positions.get(&e.source), positions.get(&e.target)) {
            (Some(from), Some(to)) => e.source != e.target && from.may_link(*to),
            _ => false,
        };
        if !allowed {
            tracing::debug!(source = %e.source, target = %e.target, "dropping disallowed candidate");
        }
        allowed
    });

    tracing::debug!(
        scope = %scope.id,
        kind = %scope.kind,
        candidates = edges.len(),
        "built candidate graph"
    );

    Ok(CandidateGraph {
        scope_id: scope.id.clone(),
        kind: scope.kind,
        hub_id,
        positions,
        edges,
    })
}

fn shared_labels(a: &Page, b: &Page) -> usize {
    a.labels.intersection(&b.labels).count()
}

fn term_words(page: &Page) -> BTreeSet<String> {
    page.primary_term
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Sibling affinity: primary-term Jaccard similarity (×100) plus shared labels.
fn term_affinity(a: &Page, b: &Page) -> i64 {
    let (wa, wb) = (term_words(a), term_words(b));
    let union = wa.union(&wb).count();
    let jaccard = if union == 0 {
        0
    } else {
        (wa.intersection(&wb).count() * 100 / union) as i64
    };
    jaccard + shared_labels(a, b) as i64
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::BTreeSet;

    use linkweave_shared::{Page, PageRole, PageStatus, Scope, ScopeKind};

    pub fn page(id: &str, role: PageRole, term: &str, labels: &[&str]) -> Page {
        Page {
            id: id.into(),
            url: format!("/{id}"),
            title: None,
            role,
            labels: labels.iter().map(|l| l.to_string()).collect::<BTreeSet<_>>(),
            primary_term: term.into(),
            term_variants: vec![],
            priority: false,
            body: String::new(),
            word_count: 0,
            status: PageStatus::Approved,
        }
    }

    pub fn scope(kind: ScopeKind, pages: &[Page], hub: Option<&str>) -> Scope {
        Scope {
            id: "scope".into(),
            name: "Scope".into(),
            kind,
            members: pages.iter().map(|p| p.id.clone()).collect(),
            hub_id: hub.map(String::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use linkweave_shared::PageStatus;

    fn cfg() -> PlannerConfig {
        PlannerConfig::default()
    }

    #[test]
    fn flat_requires_two_shared_labels() {
        let mut a = page("a", PageRole::Standalone, "alpha", &["x", "y"]);
        a.priority = true;
        let b = page("b", PageRole::Standalone, "beta", &["x", "y", "z"]);
        let c = page("c", PageRole::Standalone, "gamma", &["z"]);
        let pages = vec![a, b, c];
        let graph = build_graph(&scope(ScopeKind::Flat, &pages, None), &pages, &cfg()).unwrap();

        let b_to_a = graph.edge("b", "a").expect("b -> a candidate");
        assert_eq!(b_to_a.affinity, 2);
        assert_eq!(b_to_a.weight, 3, "two labels plus priority bonus");
        assert!(graph.edge("a", "b").is_some());
        assert!(graph.edge("b", "c").is_none(), "one shared label is not enough");
        assert!(graph.edge("c", "b").is_none());
        assert!(graph.permits("b", "c"), "peers may still link manually");
    }

    #[test]
    fn hierarchical_dependents_link_up_and_to_similar_siblings() {
        let pages = vec![
            page("h", PageRole::Hub, "trail running", &[]),
            page("d1", PageRole::Dependent, "trail running shoes", &[]),
            page("d2", PageRole::Dependent, "trail running poles", &[]),
            page("d3", PageRole::Dependent, "marathon nutrition", &[]),
        ];
        let graph =
            build_graph(&scope(ScopeKind::Hierarchical, &pages, Some("h")), &pages, &cfg()).unwrap();

        let up = graph.edge("d1", "h").unwrap();
        assert!(up.mandatory);
        assert!(graph.edge("d1", "d2").is_some());
        assert!(graph.edge("d1", "d3").is_none(), "no term overlap");
        assert_eq!(graph.outgoing("h").count(), 3);
        assert!(graph.outgoing("h").all(|e| !e.mandatory));
        assert!(graph.requires_hub_link("d3"));
        assert!(!graph.requires_hub_link("h"));
    }

    #[test]
    fn sibling_candidates_are_capped_at_top_k() {
        let mut pages = vec![page("h", PageRole::Hub, "shoes", &[])];
        for i in 0..5 {
            pages.push(page(&format!("d{i}"), PageRole::Dependent, "trail shoes", &[]));
        }
        let graph =
            build_graph(&scope(ScopeKind::Hierarchical, &pages, Some("h")), &pages, &cfg()).unwrap();
        let siblings: Vec<_> = graph.outgoing("d0").filter(|e| !e.mandatory).collect();
        assert_eq!(siblings.len(), 2);
        assert_eq!(siblings[0].target, "d1");
        assert_eq!(siblings[1].target, "d2");
    }

    #[test]
    fn siloed_satellites_never_link_down() {
        let pages = vec![
            page("hub", PageRole::Hub, "running gear", &[]),
            page("pillar", PageRole::Hub, "running shoes", &[]),
            page("s1", PageRole::Satellite, "running shoes for trails", &[]),
            page("s2", PageRole::Satellite, "running shoes for roads", &[]),
        ];
        let graph =
            build_graph(&scope(ScopeKind::Siloed, &pages, Some("hub")), &pages, &cfg()).unwrap();

        assert_eq!(graph.position("pillar"), Some(ScopePosition::Anchor));
        assert!(graph.edge("s1", "hub").unwrap().mandatory);
        assert!(graph.edge("s1", "pillar").is_some());
        assert!(graph.edge("s1", "s2").is_some());
        assert!(graph.edge("hub", "s1").is_some());
        assert!(graph.edges().iter().all(|e| graph.permits(&e.source, &e.target)));
    }

    #[test]
    fn missing_hub_is_a_configuration_error() {
        let pages = vec![
            page("a", PageRole::Dependent, "alpha", &[]),
            page("b", PageRole::Dependent, "beta", &[]),
        ];
        let err = build_graph(&scope(ScopeKind::Hierarchical, &pages, None), &pages, &cfg())
            .unwrap_err();
        assert!(matches!(err, LinkweaveError::Configuration { .. }));
        assert!(err.is_fatal_to_scope());
    }

    #[test]
    fn role_hub_resolves_without_designation() {
        let pages = vec![
            page("a", PageRole::Dependent, "alpha", &[]),
            page("h", PageRole::Hub, "beta", &[]),
        ];
        let s = scope(ScopeKind::Hierarchical, &pages, Some("not-a-member"));
        assert_eq!(resolve_hub(&s, &pages).unwrap().as_deref(), Some("h"));
    }

    #[test]
    fn draft_members_block_planning() {
        let mut pages = vec![page("a", PageRole::Standalone, "alpha", &["x", "y"])];
        pages[0].status = PageStatus::Draft;
        let err = build_graph(&scope(ScopeKind::Flat, &pages, None), &pages, &cfg()).unwrap_err();
        assert!(err.to_string().contains("draft"));
    }
}
