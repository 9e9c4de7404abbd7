//! Extraction of n-grams from message text

use crate::MAX_NGRAM_WORDS;

/// Characters that cannot start a gram
const BEFORE_GRAM: &str = " \t\n\r\x0b!\"#$%&()*,./:;<=>?@[\\]^`{|}~'-+";

/// Characters that end a gram
const END_OF_GRAM: &str = " \t\n\r\x0b!\"#$%&()*,./:;<=>?@[\\]^`{|}~";

/// Characters that are trimmed from the end of a gram
const NOT_AT_END: &[char] = &['\'', '-'];

/// Truth that a gram is a Discord snowflake ID rather than a word
fn looks_like_snowflake(gram: &str) -> bool {
    (17..=19).contains(&gram.len()) && gram.bytes().all(|b| b.is_ascii_digit())
}

/// Call `callback` with every n-gram of a message
///
/// Each gram of the message ends one n-gram of each width from one up to
/// [`MAX_NGRAM_WORDS`], as far as the preceding grams allow. Snowflake IDs are
/// dropped and break the chain, so no n-gram spans across one.
pub fn for_each_ngram(content: &str, mut callback: impl FnMut(&[&str])) {
    let mut window = Vec::with_capacity(MAX_NGRAM_WORDS);
    let mut rest = content;
    while let Some(start) = rest.find(|c: char| !BEFORE_GRAM.contains(c)) {
        let after_start = &rest[start..];
        let end = after_start
            .find(|c: char| END_OF_GRAM.contains(c))
            .unwrap_or(after_start.len());
        let (gram, after_end) = after_start.split_at(end);
        rest = after_end;

        let gram = gram.trim_end_matches(NOT_AT_END);
        if gram.is_empty() {
            continue;
        }
        if looks_like_snowflake(gram) {
            window.clear();
            continue;
        }
        if window.len() == MAX_NGRAM_WORDS {
            window.remove(0);
        }
        window.push(gram);
        for width in 1..=window.len() {
            callback(&window[window.len() - width..]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ngrams(content: &str) -> Vec<String> {
        let mut ngrams = Vec::new();
        for_each_ngram(content, |ngram| ngrams.push(ngram.join(" ")));
        ngrams
    }

    #[test]
    fn grams_are_split_on_punctuation() {
        assert_eq!(
            ngrams("Hello, world!"),
            ["Hello", "world", "Hello world"]
        );
        assert_eq!(ngrams("(a+b)"), ["a+b"]);
        assert!(ngrams(" ... !!").is_empty());
    }

    #[test]
    fn quotes_and_dashes_are_trimmed() {
        assert_eq!(ngrams("'quoted' don't --"), ["quoted", "don't", "quoted don't"]);
        assert_eq!(ngrams("well-known-"), ["well-known"]);
    }

    #[test]
    fn windows_are_capped() {
        let all = ngrams("a b c d e f");
        assert_eq!(all.len(), 1 + 2 + 3 + 4 + 5 + 5);
        assert!(all.contains(&"b c d e f".to_owned()));
        assert!(!all.contains(&"a b c d e f".to_owned()));
    }

    #[test]
    fn snowflakes_break_ngrams() {
        assert_eq!(
            ngrams("hi <@155149108183695360> there"),
            ["hi", "there"]
        );
        // Too short to be a snowflake
        assert_eq!(ngrams("1234 5"), ["1234", "5", "1234 5"]);
    }
}
