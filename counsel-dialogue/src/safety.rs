//! Safety Triage: classifies text as clear, sensitive, or blocked.
//!
//! Classification is phrase based. Each configured category carries a list
//! of phrases; text is normalised (lowercase, straight apostrophes, single
//! spaces) and scanned once with an Aho-Corasick automaton. A phrase only
//! counts when it sits on word boundaries, so "skill myself" does not match
//! "kill myself".
//!
//! | Matched categories | Verdict |
//! |--------------------|---------|
//! | none | `Clear` |
//! | only categories outside the blocked set | `Sensitive` |
//! | at least one blocked category | `Blocked` |
//!
//! The reason tag is the first matching category in configuration order.

use crate::types::SafetyVerdict;
use aho_corasick::AhoCorasick;
use anyhow::Context;
use counsel_common::SafetyConfig;
use std::collections::{BTreeSet, HashSet};

/// Deterministic phrase-based classifier.
pub struct SafetyTriage {
    matcher: Option<AhoCorasick>,
    /// Pattern index → category index
    pattern_category: Vec<usize>,
    categories: Vec<Category>,
}

struct Category {
    name: String,
    blocked: bool,
}

impl SafetyTriage {
    pub fn new(config: &SafetyConfig) -> anyhow::Result<Self> {
        let blocked: HashSet<&str> = config.blocked_categories.iter().map(String::as_str).collect();

        let mut categories = Vec::with_capacity(config.categories.len());
        let mut patterns = Vec::new();
        let mut pattern_category = Vec::new();

        for (idx, rule) in config.categories.iter().enumerate() {
            categories.push(Category {
                name: rule.name.clone(),
                blocked: blocked.contains(rule.name.as_str()),
            });

            for phrase in &rule.phrases {
                let phrase = normalize(phrase);
                if phrase.is_empty() {
                    continue;
                }
                patterns.push(phrase);
                pattern_category.push(idx);
            }
        }

        let matcher = if patterns.is_empty() {
            None
        } else {
            Some(AhoCorasick::new(&patterns).context("Failed to build safety phrase matcher")?)
        };

        tracing::debug!(
            categories = categories.len(),
            phrases = pattern_category.len(),
            "Safety triage ready"
        );

        Ok(Self {
            matcher,
            pattern_category,
            categories,
        })
    }

    /// Classify `text`. Pure: the same text always yields the same verdict.
    pub fn classify(&self, text: &str) -> SafetyVerdict {
        let Some(matcher) = &self.matcher else {
            return SafetyVerdict::clear();
        };

        let haystack = normalize(text);
        let matched: BTreeSet<usize> = matcher
            .find_overlapping_iter(&haystack)
            .filter(|m| on_word_boundary(&haystack, m.start(), m.end()))
            .map(|m| self.pattern_category[m.pattern().as_usize()])
            .collect();

        if let Some(&idx) = matched.iter().find(|&&idx| self.categories[idx].blocked) {
            return SafetyVerdict::blocked(self.categories[idx].name.clone());
        }

        match matched.first() {
            Some(&idx) => SafetyVerdict::sensitive(self.categories[idx].name.clone()),
            None => SafetyVerdict::clear(),
        }
    }
}

/// Lowercase, unify apostrophes, collapse whitespace.
fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase().replace(['\u{2019}', '\u{2018}'], "'");
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn on_word_boundary(haystack: &str, start: usize, end: usize) -> bool {
    let before = haystack[..start].chars().next_back();
    let after = haystack[end..].chars().next();
    !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
}
