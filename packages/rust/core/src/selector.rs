//! Deterministic target selection from the candidate graph.

use std::cmp::Ordering;

use linkweave_shared::{Page, PlannerConfig, ScopePosition};

use crate::budget::link_budget;
use crate::graph::{CandidateEdge, CandidateGraph};

/// The ordered targets chosen for one source page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSelection {
    pub page_id: String,
    pub budget: usize,
    /// Mandatory edge first, then by the position's ordering rule.
    pub targets: Vec<CandidateEdge>,
    /// How many candidates short of `min_budget` the graph left this page.
    pub candidate_shortfall: usize,
}

/// Pick each page's targets, in member order.
pub fn select_targets(
    graph: &CandidateGraph,
    pages: &[Page],
    config: &PlannerConfig,
) -> Vec<PageSelection> {
    pages
        .iter()
        .map(|page| select_for_page(graph, page, config))
        .collect()
}

fn select_for_page(graph: &CandidateGraph, page: &Page, config: &PlannerConfig) -> PageSelection {
    let budget = link_budget(page.word_count, config);
    let mut mandatory: Vec<&CandidateEdge> = Vec::new();
    let mut optional: Vec<&CandidateEdge> = Vec::new();
    for edge in graph.outgoing(&page.id) {
        if edge.target == page.id {
            continue;
        }
        let seen = mandatory
            .iter()
            .chain(optional.iter())
            .any(|e| e.target == edge.target);
        if seen {
            continue;
        }
        if edge.mandatory {
            mandatory.push(edge);
        } else {
            optional.push(edge);
        }
    }

    let available = mandatory.len() + optional.len();
    let is_hub = graph.position(&page.id) == Some(ScopePosition::Hub);
    optional.sort_by(|a, b| if is_hub { hub_order(a, b) } else { weight_order(a, b) });

    let targets: Vec<CandidateEdge> = mandatory
        .into_iter()
        .chain(optional)
        .take(budget)
        .cloned()
        .collect();

    PageSelection {
        page_id: page.id.clone(),
        budget,
        targets,
        candidate_shortfall: config.min_budget.saturating_sub(available),
    }
}

/// Weight desc, priority desc, affinity desc, insertion order.
fn weight_order(a: &CandidateEdge, b: &CandidateEdge) -> Ordering {
    b.weight
        .cmp(&a.weight)
        .then(b.priority.cmp(&a.priority))
        .then(b.affinity.cmp(&a.affinity))
        .then(a.order.cmp(&b.order))
}

/// Hubs fan out to priority pages first: priority desc, weight desc, insertion order.
fn hub_order(a: &CandidateEdge, b: &CandidateEdge) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(b.weight.cmp(&a.weight))
        .then(a.order.cmp(&b.order))
}
