//! Tokenization and text comparison helpers.
//!
//! Context lengths are counted with a [`Tokenizer`]; answer comparison works on
//! normalized word tokens (lowercased, punctuation stripped).

use std::collections::HashMap;

/// Splits text into tokens for length accounting.
pub trait Tokenizer: Send + Sync {
    fn tokenize<'a>(&self, text: &'a str) -> Vec<&'a str>;

    fn count(&self, text: &str) -> usize {
        self.tokenize(text).len()
    }
}

/// Whitespace word tokenizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn tokenize<'a>(&self, text: &'a str) -> Vec<&'a str> {
        text.split_whitespace().collect()
    }

    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// Lowercase, replace punctuation with spaces and collapse whitespace.
pub fn normalize(text: &str) -> String {
    normalized_tokens(text).join(" ")
}

pub fn normalized_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// True if `needle` appears in `haystack` as a contiguous run of normalized tokens.
pub fn contains_normalized(haystack: &str, needle: &str) -> bool {
    let needle = normalized_tokens(needle);
    if needle.is_empty() {
        return false;
    }
    let haystack = normalized_tokens(haystack);
    haystack.windows(needle.len()).any(|w| w == needle.as_slice())
}

/// Token-level F1 between a prediction and a reference.
pub fn token_f1(prediction: &str, reference: &str) -> f64 {
    let pred = normalized_tokens(prediction);
    let gold = normalized_tokens(reference);
    if pred.is_empty() || gold.is_empty() {
        return if pred.is_empty() && gold.is_empty() {
            1.0
        } else {
            0.0
        };
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for t in &gold {
        *counts.entry(t.as_str()).or_insert(0) += 1;
    }
    let mut common = 0usize;
    for t in &pred {
        if let Some(c) = counts.get_mut(t.as_str()) {
            if *c > 0 {
                *c -= 1;
                common += 1;
            }
        }
    }
    if common == 0 {
        return 0.0;
    }
    let precision = common as f64 / pred.len() as f64;
    let recall = common as f64 / gold.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

/// Fraction of `keywords` found in `answer`.
pub fn keyword_recall(answer: &str, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let found = keywords
        .iter()
        .filter(|k| contains_normalized(answer, k))
        .count();
    found as f64 / keywords.len() as f64
}
