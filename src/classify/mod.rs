//! Status classification of probe outcomes.
//!
//! Rules are evaluated in ascending priority order and the first rule whose
//! patterns all match wins. An outcome no rule accepts is `Unmatched`.

mod history;

pub use history::*;

use regex::Regex;
use std::str::FromStr;
use thiserror::Error;

use crate::db::{Category, StatusRule};
use crate::probe::ProbeOutcome;

/// Longest message kept in the unmatched ledger and in record excerpts.
pub const MAX_MESSAGE_CHARS: usize = 1000;

/// Rule validation error types.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("invalid response regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("invalid HTTP code pattern: {0:?}")]
    CodePattern(String),
    #[error("rules must target healthy, degraded or unhealthy")]
    UnmatchedCategory,
}

/// One alternative of an HTTP-code pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePattern {
    /// A single status code, e.g. `200`.
    Exact(u16),
    /// A class by hundreds digit, e.g. `4xx` is `Class(4)`.
    Class(u8),
}

impl CodePattern {
    pub fn matches(&self, code: u16) -> bool {
        match *self {
            CodePattern::Exact(c) => c == code,
            CodePattern::Class(d) => code / 100 == u16::from(d) && (100..600).contains(&code),
        }
    }
}

impl FromStr for CodePattern {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let p = s.trim().to_ascii_lowercase();
        let invalid = || RuleError::CodePattern(s.to_string());
        let bytes = p.as_bytes();
        if bytes.len() != 3 || !(b'1'..=b'5').contains(&bytes[0]) {
            return Err(invalid());
        }

        if &p[1..] == "xx" {
            return Ok(CodePattern::Class(bytes[0] - b'0'));
        }
        if bytes.iter().all(u8::is_ascii_digit) {
            return p.parse().map(CodePattern::Exact).map_err(|_| invalid());
        }
        Err(invalid())
    }
}

/// Parse a comma-separated list of code patterns such as `"401,403,5xx"`.
pub fn parse_code_patterns(raw: &str) -> Result<Vec<CodePattern>, RuleError> {
    raw.split(',')
        .filter(|p| !p.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// A rule with its patterns parsed and compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: i64,
    pub name: String,
    pub priority: i64,
    pub category: Category,
    codes: Vec<CodePattern>,
    regex: Option<Regex>,
}

impl CompiledRule {
    pub fn compile(rule: &StatusRule) -> Result<Self, RuleError> {
        if rule.category == Category::Unmatched {
            return Err(RuleError::UnmatchedCategory);
        }
        let codes = match non_empty(&rule.http_code_pattern) {
            Some(raw) => parse_code_patterns(raw)?,
            None => Vec::new(),
        };
        let regex = non_empty(&rule.response_regex).map(Regex::new).transpose()?;

        Ok(Self {
            id: rule.id,
            name: rule.name.clone(),
            priority: rule.priority,
            category: rule.category,
            codes,
            regex,
        })
    }

    /// True when every configured pattern matches. A rule with none matches anything.
    pub fn matches(&self, http_status: Option<u16>, text: &str) -> bool {
        let code_ok = self.codes.is_empty()
            || http_status.is_some_and(|code| self.codes.iter().any(|p| p.matches(code)));
        let regex_ok = self.regex.as_ref().map_or(true, |re| re.is_match(text));
        code_ok && regex_ok
    }
}

fn non_empty(pattern: &Option<String>) -> Option<&str> {
    pattern.as_deref().map(str::trim).filter(|p| !p.is_empty())
}

/// Check a rule before it is stored.
pub fn validate_rule(rule: &StatusRule) -> Result<(), RuleError> {
    CompiledRule::compile(rule).map(|_| ())
}

/// Result of classifying one outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: Category,
    pub rule_id: Option<i64>,
    pub rule_name: Option<String>,
}

impl Classification {
    pub fn unmatched() -> Self {
        Self {
            category: Category::Unmatched,
            rule_id: None,
            rule_name: None,
        }
    }
}

/// An ordered, compiled snapshot of the status rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile and sort rules by priority, then ID.
    ///
    /// Rules that fail to compile are skipped; they should have been rejected
    /// when they were authored.
    pub fn compile(rules: &[StatusRule]) -> Self {
        let mut compiled: Vec<CompiledRule> = rules
            .iter()
            .filter_map(|rule| match CompiledRule::compile(rule) {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!("Skipping status rule {} ({}): {}", rule.id, rule.name, e);
                    None
                }
            })
            .collect();
        compiled.sort_by_key(|r| (r.priority, r.id));
        Self { rules: compiled }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Classify an outcome. The first matching rule wins.
    pub fn classify(&self, outcome: &ProbeOutcome) -> Classification {
        self.classify_parts(outcome.http_status, outcome.classification_text())
    }

    pub fn classify_parts(&self, http_status: Option<u16>, text: &str) -> Classification {
        self.rules
            .iter()
            .find(|rule| rule.matches(http_status, text))
            .map(|rule| Classification {
                category: rule.category,
                rule_id: Some(rule.id),
                rule_name: Some(rule.name.clone()),
            })
            .unwrap_or_else(Classification::unmatched)
    }
}

/// Normalize a message for ledger deduplication.
pub fn normalize_message(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, MAX_MESSAGE_CHARS)
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
