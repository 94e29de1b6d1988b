//! First-start registry contents: a messages template, stock models and rules.

use super::{Category, DbError, Model, RequestTemplate, StatusRule, Store};

const ANTHROPIC_HEADERS: &str = "accept: application/json
anthropic-version: 2023-06-01
authorization: Bearer {key}
x-api-key: {key}
content-type: application/json";

const ANTHROPIC_BODY: &str = r#"{
  "model": "{model}",
  "messages": [
    {"role": "user", "content": [{"type": "text", "text": "{user_prompt}"}]}
  ],
  "system": [{"type": "text", "text": "{system_prompt}"}],
  "max_tokens": 64,
  "stream": true
}"#;

const PING_PROMPT: &str = "ping, only respond with 'pong'";

/// Populate an empty registry. Does nothing once any template exists.
///
/// Returns whether anything was inserted.
pub fn seed_defaults(store: &Store) -> Result<bool, DbError> {
    if store.count_templates()? > 0 {
        return Ok(false);
    }

    let mut template = RequestTemplate {
        name: "Anthropic Messages".to_string(),
        method: "POST".to_string(),
        path: "/v1/messages".to_string(),
        headers: ANTHROPIC_HEADERS.to_string(),
        body: ANTHROPIC_BODY.to_string(),
        ..Default::default()
    };
    store.add_template(&mut template)?;

    let models = [
        ("haiku", "claude-haiku-4-5", "Haiku 4.5"),
        ("sonnet", "claude-sonnet-4-5", "Sonnet 4.5"),
        ("opus", "claude-opus-4-5", "Opus 4.5"),
    ];
    for (sort_order, (name, model_name, display_name)) in models.into_iter().enumerate() {
        let mut model = Model {
            name: name.to_string(),
            model_name: model_name.to_string(),
            display_name: display_name.to_string(),
            default_prompt: Some(PING_PROMPT.to_string()),
            system_prompt: None,
            template_id: Some(template.id),
            enabled: true,
            sort_order: sort_order as i64 + 1,
            ..Default::default()
        };
        store.add_model(&mut model)?;
    }

    for mut rule in default_rules() {
        store.add_status_rule(&mut rule)?;
    }

    tracing::info!("Seeded default template, {} models and rules", models.len());
    Ok(true)
}

/// Stock rules. No catch-all, so unknown outcomes reach the unmatched ledger.
pub fn default_rules() -> Vec<StatusRule> {
    let rule = |name: &str, category, code: Option<&str>, regex: Option<&str>, priority| StatusRule {
        id: 0,
        name: name.to_string(),
        category,
        http_code_pattern: code.map(str::to_string),
        response_regex: regex.map(str::to_string),
        priority,
    };

    vec![
        rule("OK", Category::Healthy, Some("200"), None, 0),
        rule("Timeout", Category::Unhealthy, None, Some("^timeout$"), 10),
        rule(
            "Unreachable",
            Category::Unhealthy,
            None,
            Some("^(connection_refused|dns_error|connect_error|request_error|body_error)$"),
            10,
        ),
        rule("Overloaded", Category::Degraded, Some("5xx,429"), Some("(?i)overloaded|capacity"), 20),
        rule("Client error", Category::Unhealthy, Some("4xx"), None, 50),
        rule("Server error", Category::Unhealthy, Some("5xx"), None, 50),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{validate_rule, RuleSet};
    use crate::probe::{FailureReason, ProbeOutcome};
    use tempfile::NamedTempFile;

    #[test]
    fn test_seed_defaults_runs_once() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        assert!(seed_defaults(&store).unwrap());
        assert!(!seed_defaults(&store).unwrap());
        assert_eq!(store.count_templates().unwrap(), 1);
        assert_eq!(store.get_status_rules().unwrap().len(), default_rules().len());
    }

    #[test]
    fn test_default_rules_mark_transport_failures_unhealthy() {
        let rules = RuleSet::compile(&default_rules());
        for reason in [
            FailureReason::Timeout,
            FailureReason::ConnectionRefused,
            FailureReason::DnsError,
            FailureReason::ConnectError,
            FailureReason::RequestError,
            FailureReason::BodyError,
        ] {
            let verdict = rules.classify(&ProbeOutcome::failed(reason));
            assert_eq!(verdict.category, Category::Unhealthy, "{} should be unhealthy", reason);
        }
        // Template problems stay visible in the unmatched ledger
        let verdict = rules.classify(&ProbeOutcome::failed(FailureReason::RenderError));
        assert_eq!(verdict.category, Category::Unmatched);
    }

    #[test]
    fn test_default_rules_are_valid() {
        for rule in default_rules() {
            assert!(validate_rule(&rule).is_ok(), "{} should validate", rule.name);
        }
    }
}
