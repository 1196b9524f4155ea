//! Keyword lists and normalization shared by the research stages.

use std::collections::HashSet;

pub const PRACTICAL_KEYWORDS: &[&str] = &[
    "how to",
    "guide",
    "tutorial",
    "example",
    "practical",
    "step by step",
    "beginner",
    "introduction",
    "basics",
    "tips",
    "explained",
    "application",
    "real-world",
    "hands-on",
    "use case",
];

pub const ACCESSIBLE_MARKERS: &[&str] = &["basics", "introduction", "beginner"];

pub const SPECIALIZED_MARKERS: &[&str] = &["research", "technical", "academic"];

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "how", "in", "into", "is",
    "it", "its", "of", "on", "or", "the", "to", "what", "why", "with", "your", "you", "this",
    "that", "does", "do", "vs",
];

/// Number of practical keywords occurring in already-lowercased `text`.
pub fn practical_match_count(text: &str) -> usize {
    PRACTICAL_KEYWORDS
        .iter()
        .filter(|k| text.contains(*k))
        .count()
}

pub fn contains_any(text: &str, markers: &[&str]) -> bool {
    let lower = text.to_lowercase();
    markers.iter().any(|m| lower.contains(m))
}

pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Canonical form of a URL for duplicate detection: no scheme, `www.`,
/// fragment, or trailing slash.
pub fn normalize_url(url: &str) -> String {
    let lower = url.trim().to_lowercase();
    let without_fragment = lower.split('#').next().unwrap_or_default();
    let without_scheme = without_fragment
        .strip_prefix("https://")
        .or_else(|| without_fragment.strip_prefix("http://"))
        .unwrap_or(without_fragment);
    let without_www = without_scheme.strip_prefix("www.").unwrap_or(without_scheme);
    without_www.trim_end_matches('/').to_string()
}

/// Lowercased content words, stopwords and short tokens removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '-')
        .map(|t| t.trim_matches('-').to_lowercase())
        .filter(|t| t.len() > 2 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

pub fn token_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count() as f64;
    shared / a.union(b).count() as f64
}

pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_dash = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}
