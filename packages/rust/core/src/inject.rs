//! Realizes selected edges as Markdown links inside one page body.
//!
//! Edges are placed one at a time, mandatory edge first. Each placement tries,
//! in order: an existing link to the target (authored from a generation-time
//! hint), a rule-based scan for the chosen anchor and then the rest of the
//! target's pool, and a generative sentence rewrite. Density
//! limits are enforced against every link in the body, pre-existing ones
//! included.

use std::ops::Range;

use tracing::{debug, warn};

use linkweave_markdown::{BodyMap, link_markup, same_href, word_count};
use linkweave_shared::{PlacementMethod, PlannerConfig, UnplacedReason};

use crate::anchors::{AnchorCandidate, AnchorLedger};
use crate::generation::GenerationContext;

/// Sentence length bounds (in words) for a rewrite request.
const MIN_SENTENCE_WORDS: usize = 6;
const MAX_SENTENCE_WORDS: usize = 60;

/// One edge to realize.
#[derive(Debug, Clone, Copy)]
pub struct LinkRequest<'a> {
    pub target_id: &'a str,
    pub target_url: &'a str,
    pub mandatory: bool,
    /// `None` when the anchor stage found nothing under the repeat cap.
    pub anchor: Option<&'a AnchorCandidate>,
    /// Other pool phrases the rule scan may link before falling back to a
    /// rewrite, in preference order.
    pub alternatives: &'a [AnchorCandidate],
}

/// Result of one placement attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    Placed {
        /// The literal link text now in the body.
        anchor_text: String,
        method: PlacementMethod,
    },
    Unplaced(UnplacedReason),
}

/// Mutable view of one page body during a planning run.
pub struct PageInjector<'a> {
    body: String,
    map: BodyMap,
    member_urls: Vec<String>,
    config: &'a PlannerConfig,
    fallback_limit: usize,
    fallback_calls: usize,
    /// Planned links go after this offset (the end of the mandatory link).
    floor: usize,
    mandatory_failed: bool,
}

impl<'a> PageInjector<'a> {
    /// `member_urls` are the scope members' URLs; the mandatory link must
    /// precede every other link to one of them.
    pub fn new(
        body: impl Into<String>,
        member_urls: Vec<String>,
        config: &'a PlannerConfig,
        fallback_limit: usize,
    ) -> Self {
        let body = body.into();
        let map = BodyMap::analyze(&body);
        Self {
            body,
            map,
            member_urls,
            config,
            fallback_limit,
            fallback_calls: 0,
            floor: 0,
            mandatory_failed: false,
        }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn into_body(self) -> String {
        self.body
    }

    pub fn fallback_calls(&self) -> usize {
        self.fallback_calls
    }

    /// Byte offset of the first link to `url`.
    pub fn position_of(&self, url: &str) -> Option<usize> {
        self.map
            .links()
            .iter()
            .find(|l| same_href(&l.href, url))
            .map(|l| l.range.start)
    }

    /// Realize one edge. Never fails the page: problems come back as
    /// [`Placement::Unplaced`].
    pub async fn place(
        &mut self,
        request: &LinkRequest<'_>,
        ledger: &AnchorLedger,
        cap: usize,
        generation: &GenerationContext<'_>,
    ) -> Placement {
        let placement = self.try_place(request, ledger, cap, generation).await;
        if request.mandatory && matches!(placement, Placement::Unplaced(_)) {
            self.mandatory_failed = true;
        }
        debug!(target_id = request.target_id, ?placement, "edge placement");
        placement
    }

    async fn try_place(
        &mut self,
        request: &LinkRequest<'_>,
        ledger: &AnchorLedger,
        cap: usize,
        generation: &GenerationContext<'_>,
    ) -> Placement {
        if self.mandatory_failed && !request.mandatory {
            return Placement::Unplaced(UnplacedReason::MandatoryUnplaced);
        }

        if let Some(existing) = self
            .map
            .links()
            .iter()
            .find(|l| same_href(&l.href, request.target_url))
        {
            if request.mandatory {
                self.floor = existing.range.end;
            }
            return Placement::Placed {
                anchor_text: existing.text.clone(),
                method: PlacementMethod::GenerationHint,
            };
        }

        let Some(anchor) = request.anchor else {
            return Placement::Unplaced(UnplacedReason::AnchorExhausted);
        };

        let window = if request.mandatory {
            self.floor..self.member_link_start()
        } else {
            self.floor..self.body.len()
        };

        let scanned = std::iter::once(anchor)
            .chain(request.alternatives)
            .find_map(|c| self.rule_scan(request.target_id, &c.text, &window, ledger, cap));
        if let Some(range) = scanned {
            let literal = self.body[range.clone()].to_string();
            let end = self.wrap(range, &literal, request.target_url);
            if request.mandatory {
                self.floor = end;
            }
            return Placement::Placed {
                anchor_text: literal,
                method: PlacementMethod::RuleScan,
            };
        }

        match self
            .fallback(&anchor.text, request.target_url, &window, generation)
            .await
        {
            Ok(end) => {
                if request.mandatory {
                    self.floor = end;
                }
                Placement::Placed {
                    anchor_text: anchor.text.clone(),
                    method: PlacementMethod::GenerativeFallback,
                }
            }
            Err(reason) => Placement::Unplaced(reason),
        }
    }

    /// Start of the first existing link to a scope member, or the body end.
    fn member_link_start(&self) -> usize {
        self.map
            .links()
            .iter()
            .find(|l| self.member_urls.iter().any(|u| same_href(u, &l.href)))
            .map_or(self.body.len(), |l| l.range.start)
    }

    // -----------------------------------------------------------------------
    // Rule scan
    // -----------------------------------------------------------------------

    /// First occurrence of `phrase` inside `window` that sits in prose, is not
    /// blocked, keeps its literal under the cap and respects density.
    fn rule_scan(
        &self,
        target_id: &str,
        phrase: &str,
        window: &Range<usize>,
        ledger: &AnchorLedger,
        cap: usize,
    ) -> Option<Range<usize>> {
        linkweave_markdown::find_phrase(&self.body, phrase)
            .into_iter()
            .filter(|r| r.start >= window.start && r.end <= window.end)
            .filter(|r| !self.map.is_blocked(r))
            .filter(|r| ledger.uses(target_id, &self.body[r.clone()]) < cap)
            .find(|r| density_ok(&self.map, r, None, self.config))
    }

    /// Replace `range` with link markup; returns the end offset of the link.
    fn wrap(&mut self, range: Range<usize>, text: &str, url: &str) -> usize {
        let markup = link_markup(text, url);
        let end = range.start + markup.len();
        self.body.replace_range(range, &markup);
        self.map = BodyMap::analyze(&self.body);
        end
    }

    // -----------------------------------------------------------------------
    // Generative fallback
    // -----------------------------------------------------------------------

    async fn fallback(
        &mut self,
        anchor: &str,
        url: &str,
        window: &Range<usize>,
        generation: &GenerationContext<'_>,
    ) -> Result<usize, UnplacedReason> {
        if self.fallback_calls >= self.fallback_limit {
            return Err(UnplacedReason::FallbackLimit);
        }
        let sentence = self
            .pick_sentence(anchor, window)
            .ok_or(UnplacedReason::NoEligibleLocation)?;
        self.fallback_calls += 1;

        let original = self.body[sentence.clone()].to_string();
        let markup = link_markup(anchor, url);
        let prompt = rewrite_prompt(&original, &markup);
        let rewritten = generation
            .complete("rewrite", &prompt, |output| {
                accept_rewrite(output, &original, &markup, anchor)
            })
            .await
            .map_err(|e| {
                warn!(error = %e, anchor, "generative fallback failed");
                UnplacedReason::FallbackFailed
            })?;

        let mut body = self.body.clone();
        body.replace_range(sentence.clone(), &rewritten);
        let map = BodyMap::analyze(&body);
        let rewritten_end = sentence.start + rewritten.len();
        let Some((index, link)) = map.links().iter().enumerate().find(|(_, l)| {
            l.range.start >= sentence.start && l.range.end <= rewritten_end && same_href(&l.href, url)
        }) else {
            return Err(UnplacedReason::FallbackFailed);
        };
        if !density_ok(&map, &link.text_range, Some(index), self.config) {
            debug!(anchor, "rewrite breaks link density, reverted");
            return Err(UnplacedReason::FallbackFailed);
        }

        let end = link.range.end;
        self.body = body;
        self.map = map;
        Ok(end)
    }

    /// The qualifying sentence sharing the most words with `anchor`;
    /// earliest on ties.
    fn pick_sentence(&self, anchor: &str, window: &Range<usize>) -> Option<Range<usize>> {
        let anchor_words: Vec<String> = anchor
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();

        let mut best: Option<(usize, Range<usize>)> = None;
        for sentence in self.map.sentences(&self.body) {
            let range = sentence.range;
            if range.start < window.start || range.end > window.end {
                continue;
            }
            let (first, end) = self.map.word_span(&range);
            let words = end - first;
            let text = &self.body[range.clone()];
            if !(MIN_SENTENCE_WORDS..=MAX_SENTENCE_WORDS).contains(&words)
                || text.contains('|')
                || self.map.is_blocked(&range)
                || !density_ok(&self.map, &range, None, self.config)
            {
                continue;
            }
            let lower = text.to_lowercase();
            let overlap = anchor_words
                .iter()
                .filter(|w| lower.split(|c: char| !c.is_alphanumeric()).any(|t| t == w.as_str()))
                .count();
            if best.as_ref().is_none_or(|(o, _)| overlap > *o) {
                best = Some((overlap, range));
            }
        }
        best.map(|(_, range)| range)
    }
}

/// Whether a link whose text covers `range` keeps the paragraph under its
/// link limit and at least `min_words_between_links` words from every other
/// link. `skip` excludes the link being checked.
fn density_ok(
    map: &BodyMap,
    range: &Range<usize>,
    skip: Option<usize>,
    config: &PlannerConfig,
) -> bool {
    let Some(paragraph) = map.paragraph_of(range.start) else {
        return false;
    };
    let (first, end) = map.word_span(range);
    let mut in_paragraph = 0;
    for (index, link) in map.links().iter().enumerate() {
        if Some(index) == skip {
            continue;
        }
        if link.paragraph == Some(paragraph) {
            in_paragraph += 1;
        }
        let gap = if link.end_word <= first {
            first - link.end_word
        } else if end <= link.first_word {
            link.first_word - end
        } else {
            0
        };
        if gap < config.min_words_between_links {
            return false;
        }
    }
    in_paragraph < config.max_links_per_paragraph
}

fn rewrite_prompt(sentence: &str, markup: &str) -> String {
    let sentence = sentence.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(
        "Rewrite the sentence below so it naturally contains the Markdown link exactly as given.\n\
         Keep its meaning, tone and approximate length, change as few words as possible, \
         and add no other links or formatting. Reply with the rewritten sentence only.\n\n\
         Link: {markup}\n\
         Sentence: {sentence}\n"
    )
}

/// Accept a rewrite only if it is one line, carries the exact markup once,
/// contains no other link and stays close to the original length.
fn accept_rewrite(output: &str, original: &str, markup: &str, anchor: &str) -> Option<String> {
    let text = output
        .trim()
        .trim_matches(|c: char| c == '"' || c == '“' || c == '”')
        .trim();
    if text.is_empty() || text.contains('\n') {
        return None;
    }
    if text.matches(markup).count() != 1 || BodyMap::analyze(text).links().len() != 1 {
        return None;
    }
    let before = word_count(original);
    let after = word_count(text);
    let anchor_words = anchor.split_whitespace().count();
    (after >= before / 2 && after <= before * 2 + anchor_words).then(|| text.to_string())
}
