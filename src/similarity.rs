//! Lexical similarity between generation prompts.
//!
//! A cheap duplicate-work detector: Dice coefficient over lowercase whitespace
//! tokens longer than three characters. No stemming, no synonyms, no order.

use std::collections::HashSet;

/// Tokens of this many characters or fewer are dropped.
const MIN_TOKEN_CHARS: usize = 3;

fn tokens(prompt: &str) -> HashSet<String> {
    prompt
        .to_lowercase()
        .split_whitespace()
        .filter(|token| token.chars().count() > MIN_TOKEN_CHARS)
        .map(str::to_string)
        .collect()
}

/// Similarity of two prompts in `[0, 1]`.
pub fn score(a: &str, b: &str) -> f64 {
    let left = tokens(a);
    let right = tokens(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let shared = left.intersection(&right).count();
    let dice = (2 * shared) as f64 / (left.len() + right.len()) as f64;
    dice.min(1.0)
}
