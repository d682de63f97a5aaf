//! Pattern lists and keyword vocabularies used by the heuristics.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use regex::{Regex, RegexBuilder};
use std::collections::BTreeSet;

/// Case-insensitive alternation of regex fragments.
#[derive(Debug, Clone)]
pub struct PatternList {
    regex: Regex,
}

impl PatternList {
    /// Build `(?:alt1|alt2|...)` wrapped in `prefix`/`suffix`.
    pub fn build(prefix: &str, alternatives: &[&str], suffix: &str) -> Result<Self, regex::Error> {
        let pattern = format!("{prefix}(?:{}){suffix}", alternatives.join("|"));
        let regex = RegexBuilder::new(&pattern).case_insensitive(true).build()?;
        Ok(Self { regex })
    }

    /// Match any alternative anywhere in the input.
    pub fn substring(alternatives: &[&str]) -> Result<Self, regex::Error> {
        Self::build("", alternatives, "")
    }

    pub fn is_match(&self, input: &str) -> bool {
        self.regex.is_match(input)
    }

    pub fn find<'a>(&self, input: &'a str) -> Option<&'a str> {
        self.regex.find(input).map(|m| m.as_str())
    }
}

/// ASCII case-insensitive multi-keyword scanner.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    terms: Vec<&'static str>,
    matcher: AhoCorasick,
}

impl Vocabulary {
    pub fn new(terms: &[&'static str]) -> Result<Self, aho_corasick::BuildError> {
        let matcher = AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::Standard)
            .build(terms)?;
        Ok(Self {
            terms: terms.to_vec(),
            matcher,
        })
    }

    /// Distinct terms occurring in `text`.
    pub fn matches(&self, text: &str) -> BTreeSet<&'static str> {
        self.matcher
            .find_overlapping_iter(text)
            .map(|m| self.terms[m.pattern().as_usize()])
            .collect()
    }

    pub fn contains_any(&self, text: &str) -> bool {
        self.matcher.is_match(text)
    }

    /// Whether any of `texts` contains a term.
    pub fn any_in<'a>(&self, mut texts: impl Iterator<Item = &'a str>) -> bool {
        texts.any(|t| self.contains_any(t))
    }
}
