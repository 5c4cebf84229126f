//! Phrase search and link markup helpers.

use std::collections::HashSet;
use std::ops::Range;

use regex::{Captures, Regex};

use crate::structure::{BodyMap, LINK_RE, LinkSpan};

/// Build a case-insensitive, whole-word pattern for `phrase`.
///
/// Words may be separated by any run of whitespace or hyphens, and the last
/// word may carry a plural `s`/`es` the phrase itself lacks.
fn phrase_pattern(phrase: &str) -> Option<Regex> {
    let tokens: Vec<&str> = phrase
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|t| !t.is_empty())
        .collect();
    let last = tokens.last()?;

    let mut pattern = String::from("(?i)");
    if tokens[0].chars().next().is_some_and(char::is_alphanumeric) {
        pattern.push_str(r"\b");
    }
    let escaped: Vec<String> = tokens.iter().map(|t| regex::escape(t)).collect();
    pattern.push_str(&escaped.join(r"[\s\-]+"));

    let last_alpha = last.chars().last().is_some_and(char::is_alphabetic);
    if last_alpha && !last.to_lowercase().ends_with('s') {
        pattern.push_str("(?:s|es)?");
    }
    if last.chars().last().is_some_and(char::is_alphanumeric) {
        pattern.push_str(r"\b");
    }

    Regex::new(&pattern).ok()
}

/// All occurrences of `phrase` (or a close lexical variant) in `body`.
pub fn find_phrase(body: &str, phrase: &str) -> Vec<Range<usize>> {
    match phrase_pattern(phrase) {
        Some(re) => re.find_iter(body).map(|m| m.range()).collect(),
        None => Vec::new(),
    }
}

/// Markdown link markup for `text` pointing at `href`.
pub fn link_markup(text: &str, href: &str) -> String {
    format!("[{}]({href})", text.replace(']', "\\]"))
}

/// Compare hrefs ignoring a trailing slash.
pub fn same_href(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

/// First existing link in `body` pointing at `href`.
pub fn find_link(body: &str, href: &str) -> Option<LinkSpan> {
    BodyMap::analyze(body)
        .links()
        .iter()
        .find(|l| same_href(&l.href, href))
        .cloned()
}

/// Replace links to any of `hrefs` with their visible text. Images are kept.
pub fn unwrap_links(body: &str, hrefs: &[&str]) -> String {
    let wanted: HashSet<&str> = hrefs.iter().map(|h| h.trim_end_matches('/')).collect();
    LINK_RE
        .replace_all(body, |caps: &Captures| {
            if &caps[1] != "!" && wanted.contains(caps[3].trim_end_matches('/')) {
                caps[2].to_string()
            } else {
                caps[0].to_string()
            }
        })
        .to_string()
}

/// Change the visible text of the first link to `href` whose text is `old`.
/// Returns `None` when no such link exists.
pub fn retext_link(body: &str, href: &str, old: &str, new: &str) -> Option<String> {
    let map = BodyMap::analyze(body);
    let link = map
        .links()
        .iter()
        .find(|l| same_href(&l.href, href) && l.text.eq_ignore_ascii_case(old))?;
    let mut out = String::with_capacity(body.len() + new.len());
    out.push_str(&body[..link.range.start]);
    out.push_str(&link_markup(new, &link.href));
    out.push_str(&body[link.range.end..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn found<'a>(body: &'a str, phrase: &str) -> Vec<&'a str> {
        find_phrase(body, phrase)
            .into_iter()
            .map(|r| &body[r])
            .collect()
    }

    #[test]
    fn phrase_match_is_case_insensitive_and_whole_word() {
        let body = "Trail Running is fun. Trailrunning is not a word here.";
        assert_eq!(found(body, "trail running"), vec!["Trail Running"]);
    }

    #[test]
    fn phrase_match_tolerates_hyphens_and_plurals() {
        let body = "Pick trail-running shoes and try hill repeats.";
        assert_eq!(found(body, "trail running shoe"), vec!["trail-running shoes"]);
        assert_eq!(found(body, "hill repeat"), vec!["hill repeats"]);
    }

    #[test]
    fn phrase_match_does_not_double_pluralize() {
        let body = "Lots of shoeses and shoes.";
        assert_eq!(found(body, "shoes"), vec!["shoes"]);
    }

    #[test]
    fn phrase_with_symbols_matches() {
        let body = "We write C++ daily.";
        assert_eq!(found(body, "C++"), vec!["C++"]);
    }

    #[test]
    fn empty_phrase_matches_nothing() {
        assert!(find_phrase("anything", "  ").is_empty());
    }

    #[test]
    fn link_markup_escapes_brackets() {
        assert_eq!(link_markup("a]b", "/x"), "[a\\]b](/x)");
        assert_eq!(link_markup("trail shoes", "/shoes"), "[trail shoes](/shoes)");
    }

    #[test]
    fn unwrap_links_restores_text_for_selected_hrefs() {
        let body = "See [trail shoes](/shoes/) and [poles](/poles). ![img](/shoes)";
        let out = unwrap_links(body, &["/shoes"]);
        assert_eq!(out, "See trail shoes and [poles](/poles). ![img](/shoes)");
    }

    #[test]
    fn find_link_ignores_trailing_slash() {
        let body = "Start at the [running hub](/running/) today.";
        let link = find_link(body, "/running").expect("link");
        assert_eq!(link.text, "running hub");
    }

    #[test]
    fn retext_link_swaps_visible_text() {
        let body = "Read [old text](/a) now.";
        assert_eq!(
            retext_link(body, "/a", "Old Text", "new text").as_deref(),
            Some("Read [new text](/a) now.")
        );
        assert!(retext_link(body, "/b", "old text", "x").is_none());
    }
}
