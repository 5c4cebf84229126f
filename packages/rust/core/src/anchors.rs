//! Anchor text pools, usage accounting and diversity-aware selection.
//!
//! Usage is never kept in a process-wide counter: every run seeds an
//! [`AnchorLedger`] from the persisted aggregate of placed edges and records
//! its own placements on top of it.

use std::collections::{HashMap, HashSet};

use linkweave_markdown::find_phrase;
use linkweave_shared::{AnchorKind, AnchorMix, Page, anchor_key};
use linkweave_storage::AnchorUsage;
use serde::Serialize;

/// One anchor text a target can be linked with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnchorCandidate {
    pub text: String,
    pub kind: AnchorKind,
}

/// Kind-choice tie order.
const KIND_ORDER: [AnchorKind; 3] = [AnchorKind::Partial, AnchorKind::Natural, AnchorKind::Exact];

const NATURAL_TEMPLATES: [&str; 2] = ["our guide to {}", "learn more about {}"];

/// Consulted only once every regular candidate is at the repeat cap.
const SYNTHESIS_TEMPLATES: [&str; 4] = [
    "this {} overview",
    "everything about {}",
    "a closer look at {}",
    "the {} breakdown",
];

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Every anchor candidate for one target page, in preference order.
#[derive(Debug, Clone)]
pub struct AnchorPool {
    pub target_id: String,
    candidates: Vec<AnchorCandidate>,
    stock: Vec<AnchorCandidate>,
}

impl AnchorPool {
    /// Build the pool: primary term (exact), supplied and enriched variations
    /// plus sub-phrases of long terms (partial), a title phrase and
    /// descriptive templates (natural).
    pub fn build(target: &Page, enrichment: &[String]) -> Self {
        let term = target.primary_term.trim();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut push = |list: &mut Vec<AnchorCandidate>, text: &str, kind: AnchorKind| {
            let text = text.trim();
            if !text.is_empty() && seen.insert(anchor_key(text)) {
                list.push(AnchorCandidate {
                    text: text.to_string(),
                    kind,
                });
            }
        };

        push(&mut candidates, term, AnchorKind::Exact);
        for variant in target.term_variants.iter().chain(enrichment) {
            push(&mut candidates, variant, AnchorKind::Partial);
        }
        for phrase in sub_phrases(term) {
            push(&mut candidates, &phrase, AnchorKind::Partial);
        }
        if let Some(title) = target.title.as_deref().and_then(title_phrase) {
            push(&mut candidates, &title, AnchorKind::Natural);
        }
        for template in NATURAL_TEMPLATES {
            push(&mut candidates, &template.replace("{}", term), AnchorKind::Natural);
        }

        let mut stock = Vec::new();
        for template in SYNTHESIS_TEMPLATES {
            push(&mut stock, &template.replace("{}", term), AnchorKind::Natural);
        }

        Self {
            target_id: target.id.clone(),
            candidates,
            stock,
        }
    }

    pub fn candidates(&self) -> &[AnchorCandidate] {
        &self.candidates
    }

    /// The pool kind of `text`, when it is one of this target's candidates.
    pub fn kind_of(&self, text: &str) -> Option<AnchorKind> {
        let key = anchor_key(text);
        self.candidates
            .iter()
            .chain(&self.stock)
            .find(|c| anchor_key(&c.text) == key)
            .map(|c| c.kind)
    }

    fn of_kind(&self, kind: AnchorKind) -> impl Iterator<Item = (usize, &AnchorCandidate)> {
        self.candidates
            .iter()
            .enumerate()
            .filter(move |(_, c)| c.kind == kind)
    }
}

/// Contiguous sub-phrases (2+ words, longest first) of a 3+ word term.
fn sub_phrases(term: &str) -> Vec<String> {
    let words: Vec<&str> = term.split_whitespace().collect();
    let mut out = Vec::new();
    if words.len() < 3 {
        return out;
    }
    for len in (2..words.len()).rev() {
        for window in words.windows(len) {
            out.push(window.join(" "));
        }
    }
    out
}

/// Leading segment of a title, without site suffixes or trailing punctuation.
fn title_phrase(title: &str) -> Option<String> {
    let head = title.split(['|', ':']).next()?.split(" - ").next()?;
    let phrase = head.trim().trim_end_matches(['.', '!', '?', ',']).trim();
    (!phrase.is_empty()).then(|| phrase.to_string())
}

/// Classify a free-form anchor against `target` (used for hints and manual edits).
pub fn classify_anchor(text: &str, target: &Page, pool: Option<&AnchorPool>) -> AnchorKind {
    if let Some(kind) = pool.and_then(|p| p.kind_of(text)) {
        return kind;
    }
    let key = anchor_key(text);
    let term = anchor_key(&target.primary_term);
    if key == term {
        AnchorKind::Exact
    } else if key.contains(&term)
        || term.contains(&key)
        || target.term_variants.iter().any(|v| anchor_key(v) == key)
    {
        AnchorKind::Partial
    } else {
        AnchorKind::Natural
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Placed-anchor counts per target: by literal and by kind.
#[derive(Debug, Clone, Default)]
pub struct AnchorLedger {
    literals: HashMap<(String, String), usize>,
    kinds: HashMap<String, [usize; 3]>,
}

fn slot(kind: AnchorKind) -> usize {
    match kind {
        AnchorKind::Exact => 0,
        AnchorKind::Partial => 1,
        AnchorKind::Natural => 2,
    }
}

impl AnchorLedger {
    /// Seed from the persisted aggregate.
    pub fn from_usage(rows: &[AnchorUsage]) -> Self {
        let mut ledger = Self::default();
        for row in rows {
            *ledger
                .literals
                .entry((row.target_id.clone(), row.anchor_key.clone()))
                .or_default() += row.count;
            if let Some(kind) = row.anchor_kind {
                ledger.kinds.entry(row.target_id.clone()).or_default()[slot(kind)] += row.count;
            }
        }
        ledger
    }

    /// Times `text` has been used toward `target`.
    pub fn uses(&self, target: &str, text: &str) -> usize {
        self.literals
            .get(&(target.to_string(), anchor_key(text)))
            .copied()
            .unwrap_or(0)
    }

    pub fn kind_uses(&self, target: &str, kind: AnchorKind) -> usize {
        self.kinds.get(target).map_or(0, |k| k[slot(kind)])
    }

    /// Placed anchors toward `target`, across kinds.
    pub fn total(&self, target: &str) -> usize {
        self.kinds.get(target).map_or(0, |k| k.iter().sum())
    }

    pub fn record(&mut self, target: &str, text: &str, kind: AnchorKind) {
        *self
            .literals
            .entry((target.to_string(), anchor_key(text)))
            .or_default() += 1;
        self.kinds.entry(target.to_string()).or_default()[slot(kind)] += 1;
    }

    /// All `(target, anchor key, count)` entries.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, usize)> {
        self.literals
            .iter()
            .map(|((t, k), n)| (t.as_str(), k.as_str(), *n))
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Deficit score of `kind` for the next anchor toward `target`.
fn kind_score(ledger: &AnchorLedger, target: &str, kind: AnchorKind, mix: &AnchorMix) -> i64 {
    let next = ledger.total(target) as i64 + 1;
    i64::from(mix.share(kind)) * next - 100 * ledger.kind_uses(target, kind) as i64
}

/// Choose the anchor for the next edge toward the pool's target.
///
/// The kind furthest behind its share of the mix wins; within the kind the
/// least-used candidate, then one that already occurs in `source_body`, then
/// pool order. Returns `None` when every candidate, synthesized stock
/// included, has reached `cap`.
pub fn choose_anchor(
    pool: &AnchorPool,
    ledger: &AnchorLedger,
    cap: usize,
    mix: &AnchorMix,
    source_body: &str,
) -> Option<AnchorCandidate> {
    let target = pool.target_id.as_str();
    let available = |c: &AnchorCandidate| ledger.uses(target, &c.text) < cap;

    let mut best: Option<(i64, AnchorKind)> = None;
    for kind in KIND_ORDER {
        if !pool.of_kind(kind).any(|(_, c)| available(c)) {
            continue;
        }
        let score = kind_score(ledger, target, kind, mix);
        if best.is_none_or(|(s, _)| score > s) {
            best = Some((score, kind));
        }
    }

    match best {
        Some((_, kind)) => pool
            .of_kind(kind)
            .filter(|(_, c)| available(c))
            .min_by_key(|(index, c)| {
                let absent = find_phrase(source_body, &c.text).is_empty();
                (ledger.uses(target, &c.text), absent, *index)
            })
            .map(|(_, c)| c.clone()),
        None => pool
            .stock
            .iter()
            .enumerate()
            .filter(|(_, c)| available(c))
            .min_by_key(|(index, c)| (ledger.uses(target, &c.text), *index))
            .map(|(_, c)| c.clone()),
    }
}

/// A ranked anchor option for manual overrides.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnchorSuggestion {
    pub text: String,
    pub kind: AnchorKind,
    /// Placed uses toward the target so far.
    pub uses: usize,
    /// Uses left before the repeat cap.
    pub remaining: usize,
}

/// Rank the pool (stock last) for manual selection: candidates with uses
/// left first, then by how far their kind trails the mix, then least used.
pub fn suggest_anchors(
    pool: &AnchorPool,
    ledger: &AnchorLedger,
    cap: usize,
    mix: &AnchorMix,
) -> Vec<AnchorSuggestion> {
    let target = pool.target_id.as_str();
    let mut ranked: Vec<(bool, i64, usize, usize, &AnchorCandidate)> = pool
        .candidates
        .iter()
        .chain(&pool.stock)
        .enumerate()
        .map(|(index, c)| {
            let uses = ledger.uses(target, &c.text);
            (uses < cap, kind_score(ledger, target, c.kind, mix), uses, index, c)
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then(b.1.cmp(&a.1))
            .then(a.2.cmp(&b.2))
            .then(a.3.cmp(&b.3))
    });
    ranked
        .into_iter()
        .map(|(_, _, uses, _, c)| AnchorSuggestion {
            text: c.text.clone(),
            kind: c.kind,
            uses,
            remaining: cap.saturating_sub(uses),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::fixtures::page;
    use linkweave_shared::PageRole;

    fn target() -> Page {
        let mut p = page("t", PageRole::Dependent, "trail running shoes", &[]);
        p.title = Some("Choosing Trail Shoes | Example Site".into());
        p.term_variants = vec!["trail shoes".into(), "off-road running shoes".into()];
        p
    }

    #[test]
    fn pool_covers_every_kind_without_duplicates() {
        let pool = AnchorPool::build(&target(), &["Trail Shoes".into(), "grippy shoes".into()]);
        let texts: Vec<_> = pool.candidates().iter().map(|c| c.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "trail running shoes",
                "trail shoes",
                "off-road running shoes",
                "grippy shoes",
                "trail running",
                "running shoes",
                "Choosing Trail Shoes",
                "our guide to trail running shoes",
                "learn more about trail running shoes",
            ]
        );
        assert_eq!(pool.kind_of("TRAIL  shoes"), Some(AnchorKind::Partial));
        assert_eq!(pool.kind_of("the trail running shoes breakdown"), Some(AnchorKind::Natural));
    }

    #[test]
    fn five_edges_follow_the_mix() {
        let pool = AnchorPool::build(&target(), &[]);
        let mut ledger = AnchorLedger::default();
        let mix = AnchorMix::default();
        let mut kinds = Vec::new();
        for _ in 0..5 {
            let choice = choose_anchor(&pool, &ledger, 3, &mix, "").expect("anchor");
            ledger.record("t", &choice.text, choice.kind);
            kinds.push(choice.kind);
        }
        let count = |k| kinds.iter().filter(|&&x| x == k).count();
        assert!((2..=3).contains(&count(AnchorKind::Partial)));
        assert!(count(AnchorKind::Exact) <= 1);
        assert!((1..=2).contains(&count(AnchorKind::Natural)));
        assert!(ledger.entries().all(|(_, _, n)| n <= 3));
    }

    #[test]
    fn within_kind_prefers_phrases_in_the_source_body() {
        let pool = AnchorPool::build(&target(), &[]);
        let ledger = AnchorLedger::default();
        let body = "Everyone needs decent running shoes on rocky ground.";
        let choice = choose_anchor(&pool, &ledger, 3, &AnchorMix::default(), body).unwrap();
        assert_eq!(choice.text, "running shoes");
    }

    #[test]
    fn capped_pool_falls_back_to_synthesized_stock_then_exhausts() {
        let mut p = page("t", PageRole::Standalone, "gaiters", &[]);
        p.term_variants = vec![];
        let pool = AnchorPool::build(&p, &[]);
        let mut ledger = AnchorLedger::default();
        for c in pool.candidates() {
            for _ in 0..2 {
                ledger.record("t", &c.text, c.kind);
            }
        }
        let choice = choose_anchor(&pool, &ledger, 2, &AnchorMix::default(), "").unwrap();
        assert_eq!(choice.text, "this gaiters overview");

        for text in SYNTHESIS_TEMPLATES.map(|t| t.replace("{}", "gaiters")) {
            ledger.record("t", &text, AnchorKind::Natural);
            ledger.record("t", &text, AnchorKind::Natural);
        }
        assert!(choose_anchor(&pool, &ledger, 2, &AnchorMix::default(), "").is_none());
    }

    #[test]
    fn ledger_seeds_from_persisted_usage() {
        let rows = vec![AnchorUsage {
            target_id: "t".into(),
            anchor_key: "trail shoes".into(),
            anchor_kind: Some(AnchorKind::Partial),
            count: 3,
        }];
        let ledger = AnchorLedger::from_usage(&rows);
        assert_eq!(ledger.uses("t", "Trail  Shoes"), 3);
        assert_eq!(ledger.total("t"), 3);

        let pool = AnchorPool::build(&target(), &[]);
        let choice = choose_anchor(&pool, &ledger, 3, &AnchorMix::default(), "").unwrap();
        assert_ne!(choice.text, "trail shoes");
    }

    #[test]
    fn suggestions_rank_available_candidates_first() {
        let pool = AnchorPool::build(&target(), &[]);
        let mut ledger = AnchorLedger::default();
        for _ in 0..3 {
            ledger.record("t", "trail shoes", AnchorKind::Partial);
        }
        let suggestions = suggest_anchors(&pool, &ledger, 3, &AnchorMix::default());
        assert_eq!(suggestions.len(), pool.candidates().len() + SYNTHESIS_TEMPLATES.len());
        assert_eq!(suggestions.last().unwrap().text, "trail shoes");
        assert_eq!(suggestions.last().unwrap().remaining, 0);
        assert_eq!(suggestions[0].kind, AnchorKind::Natural);
    }

    #[test]
    fn classify_free_form_anchors() {
        let t = target();
        assert_eq!(classify_anchor("Trail Running Shoes", &t, None), AnchorKind::Exact);
        assert_eq!(classify_anchor("best trail running shoes", &t, None), AnchorKind::Partial);
        assert_eq!(classify_anchor("what to wear on the trail", &t, None), AnchorKind::Natural);
    }
}
