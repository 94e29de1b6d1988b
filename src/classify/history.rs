//! Recording classified outcomes and applying rules to stored history.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;

use super::{normalize_message, truncate_chars, CompiledRule, RuleError, RuleSet, MAX_MESSAGE_CHARS};
use crate::db::{Category, DbError, ProbeRecord, Store, TargetId};
use crate::probe::ProbeOutcome;

/// Classification workflow error types.
#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// A ledger entry a candidate regex would match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewMatch {
    pub message: String,
    pub occurrence_count: i64,
}

/// Classify an outcome, append it to history and feed the unmatched ledger.
pub fn record_outcome(
    store: &Store,
    target: TargetId,
    outcome: &ProbeOutcome,
    rules: &RuleSet,
    checked_at: DateTime<Utc>,
) -> Result<ProbeRecord, DbError> {
    let classification = rules.classify(outcome);

    let mut record = ProbeRecord {
        id: 0,
        target,
        category: classification.category,
        rule_id: classification.rule_id,
        rule_name: classification.rule_name,
        http_status: outcome.http_status,
        latency_ms: outcome.latency_ms,
        failure_reason: outcome.failure.map(|f| f.as_str().to_string()),
        response_excerpt: Some(truncate_chars(outcome.classification_text(), MAX_MESSAGE_CHARS)),
        checked_at,
    };
    record.id = store.append_record(&record)?;

    if record.category == Category::Unmatched {
        let message = normalize_message(outcome.classification_text());
        let count = store.record_unmatched(&message, checked_at)?;
        tracing::debug!("Unmatched outcome for {} (seen {} times)", target, count);
    }

    Ok(record)
}

/// Ledger messages the given regex would match, most frequent first.
pub fn preview_rule_matches(store: &Store, pattern: &str) -> Result<Vec<PreviewMatch>, ClassifyError> {
    let re = Regex::new(pattern).map_err(RuleError::from)?;

    Ok(store
        .all_unmatched()?
        .into_iter()
        .filter(|m| re.is_match(&m.message))
        .map(|m| PreviewMatch {
            message: m.message,
            occurrence_count: m.occurrence_count,
        })
        .collect())
}

/// Re-classify stored unmatched records with one rule.
///
/// Only records still `unmatched` are touched, so running it twice changes
/// nothing the second time. Ledger entries are removed once no unmatched
/// record with that message remains. Returns the number of records updated.
pub fn apply_rule_to_history(store: &Store, rule_id: i64) -> Result<usize, ClassifyError> {
    let rule = CompiledRule::compile(&store.get_status_rule(rule_id)?)?;

    let mut updated = 0;
    let mut touched: HashSet<String> = HashSet::new();
    let mut remaining: HashSet<String> = HashSet::new();

    for record in store.get_unmatched_records()? {
        let text = stored_text(&record);
        if rule.matches(record.http_status, text) {
            if store.reclassify_record(record.id, rule.category, rule.id)? {
                updated += 1;
            }
            touched.insert(normalize_message(text));
        } else {
            remaining.insert(normalize_message(text));
        }
    }

    for message in touched.difference(&remaining) {
        store.delete_unmatched_message(message)?;
    }

    tracing::info!("Rule {} ({}) reclassified {} records", rule.id, rule.name, updated);
    Ok(updated)
}

fn stored_text(record: &ProbeRecord) -> &str {
    record
        .response_excerpt
        .as_deref()
        .or(record.failure_reason.as_deref())
        .unwrap_or("")
}
