//! Character n-grams for the full-text index.
//!
//! Every character position of a document starts one gram: the next `n`
//! characters, or fewer at the end of the text. A substring of at least
//! `n` characters occurs at position `p` exactly when each of its own
//! grams occurs at `p` plus that gram's offset, so positional postings
//! answer `$contains` without reading documents back. Shorter substrings
//! are found as gram prefixes.

use crate::config::FullTextConfig;
use std::collections::BTreeMap;

/// Splits text into positional character n-grams. Matching is exact, so
/// case and whitespace are kept.
#[derive(Debug, Clone, Default)]
pub struct NgramTokenizer {
    config: FullTextConfig,
}

/// What a `$contains` pattern has to be looked up as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Pattern {
    /// Matches every document.
    Empty,
    /// Shorter than one gram: some gram must start with it.
    Prefix(String),
    /// Grams that must occur at consecutive positions, in order.
    Grams(Vec<String>),
}

impl NgramTokenizer {
    /// Creates a tokenizer.
    #[must_use]
    pub fn new(config: FullTextConfig) -> Self {
        Self { config }
    }

    /// Gram length.
    #[must_use]
    pub fn n(&self) -> usize {
        self.config.ngram_len
    }

    /// Returns each distinct gram of `text` with its ascending character
    /// positions.
    #[must_use]
    pub fn positions(&self, text: &str) -> BTreeMap<String, Vec<u32>> {
        let chars: Vec<char> = text.chars().collect();
        let mut positions: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for (position, start) in (0u32..).zip(0..chars.len()) {
            let end = chars.len().min(start + self.n());
            let gram: String = chars[start..end].iter().collect();
            positions.entry(gram).or_default().push(position);
        }
        positions
    }

    /// Splits a `$contains` pattern into the grams to look up.
    pub(crate) fn pattern(&self, text: &str) -> Pattern {
        let chars: Vec<char> = text.chars().collect();
        let n = self.n();
        if chars.is_empty() {
            Pattern::Empty
        } else if chars.len() < n {
            Pattern::Prefix(text.to_string())
        } else {
            Pattern::Grams(chars.windows(n).map(|w| w.iter().collect()).collect())
        }
    }
}

/// Returns whether some start position `s` has `s + i` in `positions[i]`
/// for every `i`.
pub(crate) fn is_contiguous(positions: &[&[u32]]) -> bool {
    let Some((first, rest)) = positions.split_first() else {
        return false;
    };
    first.iter().any(|&start| {
        (1u32..).zip(rest).all(|(offset, next)| {
            start
                .checked_add(offset)
                .is_some_and(|p| next.binary_search(&p).is_ok())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grams_cover_every_position() {
        let tokenizer = NgramTokenizer::default();
        let positions = tokenizer.positions("abcab");
        assert_eq!(positions["abc"], vec![0]);
        assert_eq!(positions["bca"], vec![1]);
        assert_eq!(positions["cab"], vec![2]);
        assert_eq!(positions["ab"], vec![3]);
        assert_eq!(positions["b"], vec![4]);
        assert_eq!(positions.len(), 5);
    }

    #[test]
    fn grams_keep_case_and_spaces() {
        let tokenizer = NgramTokenizer::default();
        let positions = tokenizer.positions("Hi yo");
        assert!(positions.contains_key("Hi "));
        assert!(positions.contains_key("i y"));
        assert!(!positions.contains_key("hi "));
    }

    #[test]
    fn grams_count_characters_not_bytes() {
        let tokenizer = NgramTokenizer::new(FullTextConfig::new().ngram_len(2));
        let positions = tokenizer.positions("näh");
        assert_eq!(positions["nä"], vec![0]);
        assert_eq!(positions["äh"], vec![1]);
        assert_eq!(positions["h"], vec![2]);
    }

    #[test]
    fn patterns_by_length() {
        let tokenizer = NgramTokenizer::default();
        assert_eq!(tokenizer.pattern(""), Pattern::Empty);
        assert_eq!(tokenizer.pattern("ap"), Pattern::Prefix("ap".to_string()));
        assert_eq!(
            tokenizer.pattern("appl"),
            Pattern::Grams(vec!["app".to_string(), "ppl".to_string()])
        );
    }

    #[test]
    fn contiguity() {
        let app: &[u32] = &[1, 7];
        let ppl: &[u32] = &[2, 4];
        let ple: &[u32] = &[3];
        assert!(is_contiguous(&[app, ppl, ple]));
        assert!(is_contiguous(&[ppl, ple]));
        assert!(!is_contiguous(&[ple, ppl]));
        assert!(!is_contiguous(&[]));
    }
}
