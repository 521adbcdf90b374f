//! Text normalization for speech synthesis
//!
//! Turns arbitrary chat text into a short, clean utterance: markup is removed,
//! Unicode is composed, whitespace is collapsed and overlong input is cut down
//! to a fixed number of words. The result is never empty and normalizing twice
//! gives the same string as normalizing once.

use regex::Regex;
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

/// Phrase spoken when nothing usable is left after cleanup.
pub const DEFAULT_PHRASE: &str = "Hello, this is a test message.";

/// Maximum number of words kept from the input.
pub const MAX_WORDS: usize = 50;

/// Appended to the last kept word when the input was truncated.
pub const TRUNCATION_MARKER: &str = "...";

fn tag_regex() -> &'static Regex {
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    TAG_RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("tag pattern is a valid regex"))
}

fn whitespace_regex() -> &'static Regex {
    static WHITESPACE_RE: OnceLock<Regex> = OnceLock::new();
    WHITESPACE_RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace pattern is a valid regex"))
}

/// Remove `<...>` markup and compose the text until both are stable.
///
/// Dropping a tag can put a combining mark next to a new base character, and
/// composing can swallow a bracket, so one pass of each is not a fixpoint.
fn strip_markup(text: &str) -> String {
    let tag_re = tag_regex();
    let mut current = text.to_string();
    loop {
        let composed: String = current.nfc().collect();
        let stripped = tag_re.replace_all(&composed, "").into_owned();
        if stripped == current {
            return stripped;
        }
        current = stripped;
    }
}

/// Collapse whitespace runs to a single space and trim both ends
fn collapse_whitespace(text: &str) -> String {
    whitespace_regex().replace_all(text, " ").trim().to_string()
}

/// Keep the first [`MAX_WORDS`] words, marking the cut with [`TRUNCATION_MARKER`]
fn truncate_words(text: &str) -> String {
    if word_count(text) <= MAX_WORDS {
        return text.to_string();
    }
    let mut kept = text.split(' ').take(MAX_WORDS).collect::<Vec<_>>().join(" ");
    kept.push_str(TRUNCATION_MARKER);
    kept
}

/// Number of whitespace-separated words
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Normalize input text for synthesis. Never fails and never returns an empty string.
pub fn normalize(text: &str) -> String {
    let result = strip_markup(text);
    let result = collapse_whitespace(&result);
    let result = truncate_words(&result);

    if result.is_empty() {
        DEFAULT_PHRASE.to_string()
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_markup() {
        assert_eq!(normalize("<b>Hello</b> world"), "Hello world");
        assert_eq!(normalize("<p>one</p><p>two</p>"), "onetwo");
        assert_eq!(normalize("1 < 2 and 3 > 2"), "1 2");
    }

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(normalize("  hello \t\n  world  "), "hello world");
    }

    #[test]
    fn test_empty_input_uses_default_phrase() {
        assert_eq!(normalize(""), DEFAULT_PHRASE);
        assert_eq!(normalize("   \n\t"), DEFAULT_PHRASE);
        assert_eq!(normalize("<br/><p></p>"), DEFAULT_PHRASE);
    }

    #[test]
    fn test_truncates_long_input() {
        let text = (0..80).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let result = normalize(&text);
        assert_eq!(word_count(&result), MAX_WORDS);
        assert!(result.ends_with("w49..."));
        assert!(!result.contains("w50"));
    }

    #[test]
    fn test_exactly_max_words_is_untouched() {
        let text = vec!["word"; MAX_WORDS].join(" ");
        assert_eq!(normalize(&text), text);
    }

    #[test]
    fn test_unicode_composition() {
        assert_eq!(normalize("cafe\u{301}"), "caf\u{e9}");
    }

    #[test]
    fn test_idempotent() {
        let long = vec!["speak"; 70].join("   ");
        let inputs = [
            "",
            "Hello",
            "<<b>i>nested</b> markup>",
            " spaced\u{3000}out\ttext ",
            "e<b>\u{301}</b> and >\u{338} tricky",
            long.as_str(),
            "Paimon says: <emote>hi!</emote>",
        ];
        for input in inputs {
            let once = normalize(input);
            assert_eq!(normalize(&once), once, "not idempotent for {input:?}");
        }
    }
}
