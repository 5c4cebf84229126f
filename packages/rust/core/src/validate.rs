//! Checks a realized plan against the fixed rule set.
//!
//! Violations are itemized per page and never corrected here; the caller
//! persists the plan regardless and flags the snapshot.

use std::collections::{HashMap, HashSet};

use linkweave_markdown::{BodyMap, same_href};
use linkweave_shared::{
    AnchorKind, Edge, Page, PageReport, PlanReport, PlannerConfig, Rule, UnderBudget, UnderBudgetPolicy,
    Violation,
};

use crate::anchors::AnchorLedger;
use crate::graph::CandidateGraph;

/// Validate `edges` (the whole plan for the graph's scope) against the final
/// page bodies. `history` holds anchor usage from other scopes.
pub fn validate_plan(
    graph: &CandidateGraph,
    pages: &[Page],
    edges: &[Edge],
    history: &AnchorLedger,
    config: &PlannerConfig,
) -> PlanReport {
    let mut reports: Vec<PageReport> = pages
        .iter()
        .map(|p| PageReport {
            page_id: p.id.clone(),
            valid: true,
            violations: Vec::new(),
            under_budget: None,
        })
        .collect();
    let urls: HashMap<&str, &str> = pages.iter().map(|p| (p.id.as_str(), p.url.as_str())).collect();
    let hub_url = graph.hub_id.as_deref().and_then(|h| urls.get(h).copied());

    let mut violations: Vec<Violation> = Vec::new();
    let violation = |rule: Rule, page: &str, edge: Option<&Edge>, message: String| Violation {
        rule,
        scope_id: graph.scope_id.clone(),
        page_id: page.to_string(),
        edge_id: edge.map(|e| e.id.clone()),
        message,
    };

    // Edge-level rules: 2, 3, 8.
    for edge in edges {
        let src = edge.source_id.as_str();
        let members = graph.position(src).is_some() && graph.position(&edge.target_id).is_some();
        if edge.scope_id != graph.scope_id || !members {
            violations.push(violation(
                Rule::CrossScope,
                src,
                Some(edge),
                format!("edge {} leaves scope {}", edge.id, graph.scope_id),
            ));
        } else if edge.source_id == edge.target_id {
            violations.push(violation(Rule::SelfEdge, src, Some(edge), "page links to itself".into()));
        } else if !graph.permits(src, &edge.target_id) {
            violations.push(violation(
                Rule::Direction,
                src,
                Some(edge),
                format!(
                    "{:?} page may not link to {:?} page {}",
                    graph.position(src),
                    graph.position(&edge.target_id),
                    edge.target_id
                ),
            ));
        }
    }

    // Rule 6: anchor diversity, history first, then this plan in page order.
    let mut ledger = history.clone();
    for page in pages {
        for edge in placed_from(edges, &page.id) {
            let Some(text) = edge.anchor_text.as_deref() else {
                continue;
            };
            let kind = edge.anchor_kind.unwrap_or(AnchorKind::Natural);
            ledger.record(&edge.target_id, text, kind);
            let uses = ledger.uses(&edge.target_id, text);
            if uses > config.anchor_max_repeat {
                violations.push(violation(
                    Rule::AnchorDiversity,
                    &page.id,
                    Some(edge),
                    format!(
                        "anchor \"{text}\" used {uses} times toward {} (cap {})",
                        edge.target_id, config.anchor_max_repeat
                    ),
                ));
            }
        }
    }

    for (page, report) in pages.iter().zip(reports.iter_mut()) {
        let placed: Vec<&Edge> = placed_from(edges, &page.id).collect();
        let map = BodyMap::analyze(&page.body);

        // Rule 1: the hub link comes first.
        if graph.requires_hub_link(&page.id) && !placed.is_empty() {
            if let (Some(hub), Some(hub_url)) = (graph.hub_id.as_deref(), hub_url) {
                if placed[0].target_id != hub {
                    violations.push(violation(
                        Rule::MandatoryFirst,
                        &page.id,
                        Some(placed[0]),
                        format!("first edge targets {} instead of hub {hub}", placed[0].target_id),
                    ));
                }
                let first_member_link = map
                    .links()
                    .iter()
                    .find(|l| urls.values().any(|u| same_href(u, &l.href)));
                match first_member_link {
                    Some(link) if same_href(&link.href, hub_url) => {}
                    Some(link) => violations.push(violation(
                        Rule::MandatoryFirst,
                        &page.id,
                        None,
                        format!("first in-scope link in body points at {} instead of the hub", link.href),
                    )),
                    None => violations.push(violation(
                        Rule::MandatoryFirst,
                        &page.id,
                        None,
                        "body has no link to the hub".into(),
                    )),
                }
            }
        }

        // Rule 4: one placed edge per target.
        let mut seen = HashSet::new();
        for edge in &placed {
            if !seen.insert(edge.target_id.as_str()) {
                violations.push(violation(
                    Rule::DuplicateTarget,
                    &page.id,
                    Some(*edge),
                    format!("target {} linked more than once", edge.target_id),
                ));
            }
        }

        // Rule 5: density around the plan's own links.
        let plan_urls: Vec<&str> = placed
            .iter()
            .filter_map(|e| urls.get(e.target_id.as_str()).copied())
            .collect();
        for message in density_problems(&map, &plan_urls, config) {
            violations.push(violation(Rule::Density, &page.id, None, message));
        }

        // Rule 7: edge count.
        if placed.len() > config.max_budget {
            violations.push(violation(
                Rule::EdgeCount,
                &page.id,
                None,
                format!("{} links exceed max_budget {}", placed.len(), config.max_budget),
            ));
        } else if placed.len() < config.min_budget {
            let available: HashSet<&str> =
                graph.outgoing(&page.id).map(|e| e.target.as_str()).collect();
            let unplaced = edges
                .iter()
                .filter(|e| e.source_id == page.id && !e.is_placed())
                .count();
            report.under_budget = Some(UnderBudget {
                min_budget: config.min_budget,
                placed: placed.len(),
                unplaced,
                candidate_shortfall: config.min_budget.saturating_sub(available.len()),
            });
            if config.under_budget == UnderBudgetPolicy::Strict {
                violations.push(violation(
                    Rule::EdgeCount,
                    &page.id,
                    None,
                    format!("{} links below min_budget {}", placed.len(), config.min_budget),
                ));
            }
        }
    }

    for v in violations {
        match reports.iter_mut().find(|r| r.page_id == v.page_id) {
            Some(report) => report.violations.push(v),
            None => reports.push(PageReport {
                page_id: v.page_id.clone(),
                valid: false,
                violations: vec![v],
                under_budget: None,
            }),
        }
    }
    for report in &mut reports {
        report.valid = report.violations.is_empty();
    }
    PlanReport { pages: reports }
}

/// Placed edges leaving `page_id`, in ordinal order.
fn placed_from<'a>(edges: &'a [Edge], page_id: &'a str) -> impl Iterator<Item = &'a Edge> {
    let mut placed: Vec<&Edge> = edges
        .iter()
        .filter(|e| e.source_id == page_id && e.is_placed())
        .collect();
    placed.sort_by_key(|e| e.ordinal);
    placed.into_iter()
}

/// Paragraph and spacing problems involving at least one link to `plan_urls`.
fn density_problems(map: &BodyMap, plan_urls: &[&str], config: &PlannerConfig) -> Vec<String> {
    let links = map.links();
    let is_plan = |i: usize| plan_urls.iter().any(|u| same_href(u, &links[i].href));
    let mut problems = Vec::new();

    let mut per_paragraph: HashMap<usize, (usize, bool)> = HashMap::new();
    for (i, link) in links.iter().enumerate() {
        if let Some(p) = link.paragraph {
            let entry = per_paragraph.entry(p).or_default();
            entry.0 += 1;
            entry.1 |= is_plan(i);
        }
    }
    let mut crowded: Vec<(usize, usize)> = per_paragraph
        .into_iter()
        .filter(|(_, (count, plan))| *plan && *count > config.max_links_per_paragraph)
        .map(|(p, (count, _))| (p, count))
        .collect();
    crowded.sort_unstable();
    for (p, count) in crowded {
        problems.push(format!(
            "paragraph {} has {count} links (max {})",
            p + 1,
            config.max_links_per_paragraph
        ));
    }

    for i in 1..links.len() {
        if !is_plan(i - 1) && !is_plan(i) {
            continue;
        }
        let gap = links[i].first_word.saturating_sub(links[i - 1].end_word);
        if gap < config.min_words_between_links {
            problems.push(format!(
                "only {gap} words between links to {} and {} (min {})",
                links[i - 1].href,
                links[i].href,
                config.min_words_between_links
            ));
        }
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_graph;
    use crate::graph::fixtures::{page, scope};
    use linkweave_shared::{EdgeStatus, PageRole, PlacementMethod, ScopeKind};

    fn cfg() -> PlannerConfig {
        PlannerConfig {
            min_words_between_links: 3,
            ..PlannerConfig::default()
        }
    }

    fn placed(source: &str, target: &str, anchor: &str, ordinal: usize) -> Edge {
        Edge {
            id: format!("{source}->{target}"),
            scope_id: "scope".into(),
            source_id: source.into(),
            target_id: target.into(),
            anchor_text: Some(anchor.into()),
            anchor_kind: Some(AnchorKind::Partial),
            position: Some(0),
            mandatory: false,
            method: Some(PlacementMethod::RuleScan),
            status: EdgeStatus::Placed,
            reason: None,
            ordinal,
        }
    }

    fn cluster() -> Vec<Page> {
        vec![
            page("h", PageRole::Hub, "trail running", &[]),
            page("d1", PageRole::Dependent, "trail running shoes", &[]),
            page("d2", PageRole::Dependent, "trail running poles", &[]),
            page("d3", PageRole::Dependent, "trail running food", &[]),
        ]
    }

    fn rules(report: &PlanReport, page: &str) -> Vec<Rule> {
        report
            .page(page)
            .map(|p| p.violations.iter().map(|v| v.rule).collect())
            .unwrap_or_default()
    }

    #[test]
    fn clean_plan_passes_with_under_budget_note() {
        let mut pages = cluster();
        pages[1].body =
            "Start with [the hub](/h) first, then one two three four [poles](/d2) later.".into();
        let config = cfg();
        let graph = build_graph(&scope(ScopeKind::Hierarchical, &pages, Some("h")), &pages, &config)
            .unwrap();
        let mut hub_edge = placed("d1", "h", "the hub", 0);
        hub_edge.mandatory = true;
        let edges = vec![hub_edge, placed("d1", "d2", "poles", 1)];

        let report = validate_plan(&graph, &pages, &edges, &AnchorLedger::default(), &config);
        let d1 = report.page("d1").unwrap();
        assert!(d1.valid, "{:?}", d1.violations);
        assert_eq!(
            d1.under_budget,
            Some(UnderBudget {
                min_budget: 3,
                placed: 2,
                unplaced: 0,
                candidate_shortfall: 0
            })
        );
        assert!(!report.has_violations());
    }

    #[test]
    fn strict_policy_fails_under_budget_pages() {
        let mut pages = cluster();
        pages[1].body = "Back to [the hub](/h) now.".into();
        let config = PlannerConfig {
            under_budget: UnderBudgetPolicy::Strict,
            ..cfg()
        };
        let graph = build_graph(&scope(ScopeKind::Hierarchical, &pages, Some("h")), &pages, &config)
            .unwrap();
        let edges = vec![placed("d1", "h", "the hub", 0)];
        let report = validate_plan(&graph, &pages, &edges, &AnchorLedger::default(), &config);
        assert_eq!(rules(&report, "d1"), vec![Rule::EdgeCount]);
    }

    #[test]
    fn hub_link_must_come_first() {
        let mut pages = cluster();
        pages[1].body = "See [poles](/d2) one two three four five then [the hub](/h).".into();
        let config = cfg();
        let graph = build_graph(&scope(ScopeKind::Hierarchical, &pages, Some("h")), &pages, &config)
            .unwrap();
        let edges = vec![placed("d1", "d2", "poles", 0), placed("d1", "h", "the hub", 1)];
        let report = validate_plan(&graph, &pages, &edges, &AnchorLedger::default(), &config);
        assert_eq!(rules(&report, "d1"), vec![Rule::MandatoryFirst, Rule::MandatoryFirst]);
    }

    #[test]
    fn structural_rules_are_itemized() {
        let pages = cluster();
        let config = cfg();
        let graph = build_graph(&scope(ScopeKind::Hierarchical, &pages, Some("h")), &pages, &config)
            .unwrap();
        let mut foreign = placed("h", "elsewhere", "x", 0);
        foreign.status = EdgeStatus::Unplaced;
        let selfish = placed("h", "h", "y", 1);
        let edges = vec![foreign, selfish];
        let report = validate_plan(&graph, &pages, &edges, &AnchorLedger::default(), &config);
        let hub_rules = rules(&report, "h");
        assert!(hub_rules.contains(&Rule::CrossScope));
        assert!(hub_rules.contains(&Rule::SelfEdge));
    }

    #[test]
    fn direction_matrix_allows_scope_edges() {
        let pages = vec![
            page("h", PageRole::Hub, "hub", &[]),
            page("a", PageRole::Hub, "anchor", &[]),
            page("s", PageRole::Satellite, "satellite", &[]),
        ];
        let config = cfg();
        let graph = build_graph(&scope(ScopeKind::Siloed, &pages, Some("h")), &pages, &config)
            .unwrap();
        assert!(graph.permits("s", "a"));

        let mut hier = cluster();
        hier.truncate(3);
        let graph = build_graph(&scope(ScopeKind::Hierarchical, &hier, Some("h")), &hier, &config)
            .unwrap();
        let edges = vec![placed("h", "d1", "x", 0), placed("d1", "h", "y", 0)];
        let report = validate_plan(&graph, &hier, &edges, &AnchorLedger::default(), &config);
        assert!(!rules(&report, "h").contains(&Rule::Direction));
        assert!(!rules(&report, "d1").contains(&Rule::Direction));
    }

    #[test]
    fn duplicate_targets_and_density() {
        let mut pages = cluster();
        pages[0].body = "Try [shoes](/d1) and [poles](/d2) and [food](/d3) today.".into();
        let config = cfg();
        let graph = build_graph(&scope(ScopeKind::Hierarchical, &pages, Some("h")), &pages, &config)
            .unwrap();
        let edges = vec![
            placed("h", "d1", "shoes", 0),
            placed("h", "d2", "poles", 1),
            placed("h", "d3", "food", 2),
            placed("h", "d3", "food", 3),
        ];
        let report = validate_plan(&graph, &pages, &edges, &AnchorLedger::default(), &config);
        let hub_rules = rules(&report, "h");
        assert!(hub_rules.contains(&Rule::DuplicateTarget));
        // One crowded paragraph plus two tight gaps.
        assert_eq!(hub_rules.iter().filter(|r| **r == Rule::Density).count(), 3);
    }

    #[test]
    fn anchor_cap_counts_history() {
        let mut pages = cluster();
        pages[1].body = "Go to [trail running](/h) now.".into();
        let config = cfg();
        let graph = build_graph(&scope(ScopeKind::Hierarchical, &pages, Some("h")), &pages, &config)
            .unwrap();
        let mut history = AnchorLedger::default();
        for _ in 0..3 {
            history.record("h", "Trail Running", AnchorKind::Exact);
        }
        let edges = vec![placed("d1", "h", "trail running", 0)];
        let report = validate_plan(&graph, &pages, &edges, &history, &config);
        assert!(rules(&report, "d1").contains(&Rule::AnchorDiversity));
    }
}
