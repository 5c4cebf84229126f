//! Structural map of a Markdown body: blocks, links, words, sentences.
//!
//! All ranges are byte ranges into the analyzed body.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

static INLINE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`[^`\n]+`").expect("valid regex"));

pub(crate) static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    // [text](href "optional title"), with an optional leading `!` for images
    Regex::new(r#"(!?)\[([^\]\n]*)\]\(([^)\s]+)(?:\s+"[^"\n]*")?\)"#).expect("valid regex")
});

static AUTOLINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(https?://[^>\s]+)>").expect("valid regex"));

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\p{L}\p{N}]+(?:['’\-][\p{L}\p{N}]+)*").expect("valid regex")
});

static SENTENCE_END_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[.!?]+["'’”)\]]*(?:\s+|$)"#).expect("valid regex")
});

static LIST_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*+]|\d+[.)]|>)\s+").expect("valid regex"));

/// An existing link in the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpan {
    /// Whole markup, `[text](href)`.
    pub range: Range<usize>,
    /// The visible text only.
    pub text_range: Range<usize>,
    pub text: String,
    pub href: String,
    /// Paragraph index, when the link sits in prose.
    pub paragraph: Option<usize>,
    /// Index of the first word of the link text.
    pub first_word: usize,
    /// One past the last word of the link text.
    pub end_word: usize,
}

/// A sentence inside a prose paragraph (list markers stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub range: Range<usize>,
    pub paragraph: usize,
}

/// Structural analysis of one body.
#[derive(Debug, Clone, Default)]
pub struct BodyMap {
    len: usize,
    paragraphs: Vec<Range<usize>>,
    headings: Vec<Range<usize>>,
    code: Vec<Range<usize>>,
    images: Vec<Range<usize>>,
    links: Vec<LinkSpan>,
    word_starts: Vec<usize>,
}

impl BodyMap {
    /// Scan `body` once and record its structure.
    pub fn analyze(body: &str) -> Self {
        let mut map = Self {
            len: body.len(),
            ..Default::default()
        };
        map.scan_blocks(body);
        map.scan_inline(body);
        map.scan_words(body);
        map
    }

    // -----------------------------------------------------------------------
    // Block pass: paragraphs, headings, fenced code
    // -----------------------------------------------------------------------

    fn scan_blocks(&mut self, body: &str) {
        let mut offset = 0;
        let mut fence_start: Option<usize> = None;
        let mut paragraph: Option<Range<usize>> = None;

        for line in body.split_inclusive('\n') {
            let start = offset;
            offset += line.len();
            let content = line.trim_end_matches(['\n', '\r']);
            let content_end = start + content.len();
            let trimmed = content.trim_start();
            let is_fence = trimmed.starts_with("```") || trimmed.starts_with("~~~");

            if let Some(fs) = fence_start {
                if is_fence {
                    self.code.push(fs..content_end);
                    fence_start = None;
                }
                continue;
            }

            if is_fence || trimmed.is_empty() || is_heading(trimmed) {
                if let Some(p) = paragraph.take() {
                    self.paragraphs.push(p);
                }
                if is_fence {
                    fence_start = Some(start);
                } else if !trimmed.is_empty() {
                    self.headings.push(start..content_end);
                }
                continue;
            }

            match paragraph.as_mut() {
                Some(p) => p.end = content_end,
                None => paragraph = Some(start..content_end),
            }
        }

        if let Some(fs) = fence_start {
            // Unterminated fence runs to the end of the body
            self.code.push(fs..body.len());
        }
        if let Some(p) = paragraph.take() {
            self.paragraphs.push(p);
        }
    }

    // -----------------------------------------------------------------------
    // Inline pass: code spans, links, images
    // -----------------------------------------------------------------------

    fn scan_inline(&mut self, body: &str) {
        let mut inline_code = Vec::new();
        for m in INLINE_CODE_RE.find_iter(body) {
            // Only fences are recorded at this point.
            if !self.in_code(m.start()) {
                inline_code.push(m.range());
            }
        }
        self.code.extend(inline_code);

        for caps in LINK_RE.captures_iter(body) {
            let (Some(whole), Some(text)) = (caps.get(0), caps.get(2)) else {
                continue;
            };
            if self.in_code(whole.start()) {
                continue;
            }
            if &caps[1] == "!" {
                self.images.push(whole.range());
                continue;
            }
            self.links.push(LinkSpan {
                range: whole.range(),
                text_range: text.range(),
                text: text.as_str().to_string(),
                href: caps[3].to_string(),
                paragraph: None,
                first_word: 0,
                end_word: 0,
            });
        }

        for caps in AUTOLINK_RE.captures_iter(body) {
            let (Some(whole), Some(href)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if self.in_code(whole.start()) || self.in_link(whole.start()) {
                continue;
            }
            self.links.push(LinkSpan {
                range: whole.range(),
                text_range: href.range(),
                text: href.as_str().to_string(),
                href: href.as_str().to_string(),
                paragraph: None,
                first_word: 0,
                end_word: 0,
            });
        }
        self.links.sort_by_key(|l| l.range.start);

        let paragraphs = self.paragraphs.clone();
        for link in &mut self.links {
            link.paragraph = paragraphs
                .iter()
                .position(|p| p.start <= link.range.start && link.range.start < p.end);
        }
    }

    // -----------------------------------------------------------------------
    // Word pass
    // -----------------------------------------------------------------------

    fn scan_words(&mut self, body: &str) {
        for m in WORD_RE.find_iter(body) {
            let at = m.start();
            if self.in_code(at) || self.images.iter().any(|r| r.contains(&at)) {
                continue;
            }
            // Inside link markup only the visible text counts.
            let in_link_target = self
                .links
                .iter()
                .any(|l| l.range.contains(&at) && !l.text_range.contains(&at));
            if in_link_target {
                continue;
            }
            self.word_starts.push(at);
        }

        let spans: Vec<(usize, usize)> = self
            .links
            .iter()
            .map(|l| (self.word_index(l.text_range.start), self.word_index(l.text_range.end)))
            .collect();
        for (link, (first, end)) in self.links.iter_mut().zip(spans) {
            link.first_word = first;
            link.end_word = end;
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Length of the analyzed body in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn word_count(&self) -> usize {
        self.word_starts.len()
    }

    /// Number of words starting before `offset`.
    pub fn word_index(&self, offset: usize) -> usize {
        self.word_starts.partition_point(|&s| s < offset)
    }

    /// `(first_word, end_word)` for a byte range.
    pub fn word_span(&self, range: &Range<usize>) -> (usize, usize) {
        (self.word_index(range.start), self.word_index(range.end))
    }

    pub fn paragraphs(&self) -> &[Range<usize>] {
        &self.paragraphs
    }

    pub fn headings(&self) -> &[Range<usize>] {
        &self.headings
    }

    pub fn links(&self) -> &[LinkSpan] {
        &self.links
    }

    /// Index of the paragraph containing `offset`.
    pub fn paragraph_of(&self, offset: usize) -> Option<usize> {
        self.paragraphs
            .iter()
            .position(|p| p.start <= offset && offset < p.end)
    }

    /// Whether `range` touches a heading, code, image or existing link.
    pub fn is_blocked(&self, range: &Range<usize>) -> bool {
        let overlaps = |r: &Range<usize>| r.start < range.end && range.start < r.end;
        self.headings.iter().any(overlaps)
            || self.code.iter().any(overlaps)
            || self.images.iter().any(overlaps)
            || self.links.iter().any(|l| overlaps(&l.range))
    }

    /// Sentences of every prose paragraph, in body order.
    pub fn sentences(&self, body: &str) -> Vec<Sentence> {
        let mut out = Vec::new();
        for (index, para) in self.paragraphs.iter().enumerate() {
            let text = &body[para.clone()];
            let mut cursor = 0;
            let mut push = |from: usize, to: usize| {
                if let Some(range) = trim_sentence(text, from, to) {
                    out.push(Sentence {
                        range: (para.start + range.start)..(para.start + range.end),
                        paragraph: index,
                    });
                }
            };
            for m in SENTENCE_END_RE.find_iter(text) {
                push(cursor, m.end());
                cursor = m.end();
            }
            if cursor < text.len() {
                push(cursor, text.len());
            }
        }
        out
    }

    fn in_code(&self, offset: usize) -> bool {
        self.code.iter().any(|r| r.contains(&offset))
    }

    fn in_link(&self, offset: usize) -> bool {
        self.links.iter().any(|l| l.range.contains(&offset))
    }
}

/// ATX heading: 1-6 `#` followed by whitespace or end of line.
fn is_heading(trimmed: &str) -> bool {
    let hashes = trimmed.bytes().take_while(|&b| b == b'#').count();
    (1..=6).contains(&hashes)
        && trimmed[hashes..]
            .chars()
            .next()
            .is_none_or(char::is_whitespace)
}

/// Trim whitespace and list/quote markers from a raw sentence slice.
fn trim_sentence(text: &str, from: usize, to: usize) -> Option<Range<usize>> {
    let raw = &text[from..to];
    let lead = raw.len() - raw.trim_start().len();
    let mut start = from + lead;
    if let Some(m) = LIST_MARKER_RE.find(&text[start..to]) {
        start += m.end();
    }
    let end = from + raw.trim_end().len();
    (start < end).then_some(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "# Guide\n\nTrail running builds endurance. It also builds \
[ankle strength](/ankles) over time.\n\n```\nrunning in code\n```\n\n\
- Pick shoes with grip.\n- Use `running` poles.\n\n![running photo](/img/run.png)\n";

    #[test]
    fn blocks_are_classified() {
        let map = BodyMap::analyze(BODY);
        assert_eq!(map.headings().len(), 1);
        assert_eq!(&BODY[map.headings()[0].clone()], "# Guide");
        // prose paragraph, list block, image line
        assert_eq!(map.paragraphs().len(), 3);
        assert!(BODY[map.paragraphs()[0].clone()].starts_with("Trail running"));
    }

    #[test]
    fn links_and_images_are_separated() {
        let map = BodyMap::analyze(BODY);
        assert_eq!(map.links().len(), 1);
        let link = &map.links()[0];
        assert_eq!(link.text, "ankle strength");
        assert_eq!(link.href, "/ankles");
        assert_eq!(link.paragraph, Some(0));
        assert_eq!(link.end_word - link.first_word, 2);
    }

    #[test]
    fn blocked_regions_cover_code_links_and_headings() {
        let map = BodyMap::analyze(BODY);
        let in_fence = BODY.find("running in code").unwrap();
        assert!(map.is_blocked(&(in_fence..in_fence + 7)));
        let inline = BODY.find("`running`").unwrap() + 1;
        assert!(map.is_blocked(&(inline..inline + 7)));
        let heading = BODY.find("Guide").unwrap();
        assert!(map.is_blocked(&(heading..heading + 5)));
        let prose = BODY.find("Trail running").unwrap();
        assert!(!map.is_blocked(&(prose..prose + 13)));
    }

    #[test]
    fn word_index_counts_preceding_words() {
        let body = "one two three four";
        let map = BodyMap::analyze(body);
        assert_eq!(map.word_count(), 4);
        assert_eq!(map.word_index(0), 0);
        assert_eq!(map.word_index(body.find("three").unwrap()), 2);
        assert_eq!(map.word_index(body.len()), 4);
    }

    #[test]
    fn sentences_split_on_terminal_punctuation() {
        let map = BodyMap::analyze(BODY);
        let sentences = map.sentences(BODY);
        let texts: Vec<&str> = sentences.iter().map(|s| &BODY[s.range.clone()]).collect();
        assert_eq!(texts[0], "Trail running builds endurance.");
        assert!(texts[1].starts_with("It also builds"));
        assert!(texts.contains(&"Pick shoes with grip."));
        assert!(sentences.iter().all(|s| !BODY[s.range.clone()].starts_with("- ")));
    }

    #[test]
    fn unterminated_fence_blocks_rest_of_body() {
        let body = "Intro text here.\n\n```\ncode forever\nmore code";
        let map = BodyMap::analyze(body);
        assert_eq!(map.word_count(), 3);
        assert_eq!(map.paragraphs().len(), 1);
    }

    #[test]
    fn heading_requires_space_after_hashes() {
        assert!(is_heading("## Section"));
        assert!(is_heading("#"));
        assert!(!is_heading("#hashtag"));
        assert!(!is_heading("####### seven"));
    }
}
