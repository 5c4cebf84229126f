//! Markdown body analysis for link injection.
//!
//! Page bodies are Markdown. Injection needs to know where prose lives, which
//! regions must never be wrapped (headings, code, existing links, images),
//! where words fall (for link-spacing rules), and where sentences start and
//! end (for rewrite requests). This crate answers those questions with a
//! line scanner plus a handful of regex passes, and provides the phrase
//! search and link-markup helpers the injector and stripper share.

mod phrase;
mod structure;

pub use phrase::{find_link, find_phrase, link_markup, retext_link, same_href, unwrap_links};
pub use structure::{BodyMap, LinkSpan, Sentence};

/// Count prose words in a Markdown body (code and link URLs excluded).
pub fn word_count(body: &str) -> usize {
    BodyMap::analyze(body).word_count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_count_ignores_code_and_urls() {
        let body = "# Trail Running\n\nGood [trail shoes](https://example.com/a/b/c) matter.\n\n```\nlet x = 1;\n```\n";
        // trail, running, good, trail, shoes, matter
        assert_eq!(word_count(body), 6);
    }

    #[test]
    fn word_count_of_empty_body() {
        assert_eq!(word_count(""), 0);
    }
}
