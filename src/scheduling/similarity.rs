//! Pairwise task similarity used by affinity batching.

use crate::core::AtomicTask;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been",
    "but", "by", "can", "could", "do", "does", "each", "for", "from", "has", "have", "how", "if",
    "in", "into", "is", "it", "its", "may", "more", "most", "not", "of", "on", "or", "our",
    "should", "so", "some", "such", "than", "that", "the", "their", "them", "then", "there",
    "these", "they", "this", "those", "to", "use", "using", "was", "we", "were", "what", "when",
    "which", "while", "who", "will", "with", "would", "you", "your",
];

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z0-9]+").unwrap());

/// Normalized content words: lowercased alphanumeric runs of two or more
/// characters, stop words removed.
pub fn content_words(text: &str) -> BTreeSet<String> {
    let lower = text.to_lowercase();
    WORD_RE
        .find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|word| word.len() > 1 && !STOP_WORDS.contains(word))
        .map(str::to_string)
        .collect()
}

/// Jaccard index; two empty sets are identical.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Ratio of the shorter to the longer duration.
pub fn timing_ratio(a_ms: u64, b_ms: u64) -> f64 {
    let (low, high) = if a_ms <= b_ms { (a_ms, b_ms) } else { (b_ms, a_ms) };
    if high == 0 {
        1.0
    } else {
        low as f64 / high as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub lexical: f64,
    pub capability: f64,
    pub timing: f64,
}

impl Similarity {
    /// Unweighted mean of the three sub-scores, in [0, 1].
    pub fn score(&self) -> f64 {
        (self.lexical + self.capability + self.timing) / 3.0
    }
}

/// Compare two tasks.
pub fn similarity(a: &AtomicTask, b: &AtomicTask) -> Similarity {
    let words_a = content_words(&a.content);
    let words_b = content_words(&b.content);
    let lexical = if words_a.is_empty() || words_b.is_empty() {
        0.0
    } else {
        jaccard(&words_a, &words_b)
    };
    Similarity {
        lexical,
        capability: jaccard(&a.required_capabilities, &b.required_capabilities),
        timing: timing_ratio(a.duration_ms(), b.duration_ms()),
    }
}
