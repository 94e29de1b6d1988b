//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Identity of a monitored (provider, model) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetId {
    pub provider_id: i64,
    pub model_id: i64,
}

impl TargetId {
    pub fn new(provider_id: i64, model_id: i64) -> Self {
        Self {
            provider_id,
            model_id,
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

/// Health category assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Healthy,
    Degraded,
    Unhealthy,
    /// No rule matched; not counted towards uptime.
    Unmatched,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Healthy => "healthy",
            Category::Degraded => "degraded",
            Category::Unhealthy => "unhealthy",
            Category::Unmatched => "unmatched",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Category::Healthy),
            "degraded" => Ok(Category::Degraded),
            "unhealthy" => Ok(Category::Unhealthy),
            "unmatched" => Ok(Category::Unmatched),
            other => Err(format!("unknown category: {}", other)),
        }
    }
}

/// An HTTP request template with `{placeholder}` markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTemplate {
    pub id: i64,
    pub name: String,
    pub method: String,
    pub path: String,
    /// Raw header block, one `Name: value` per line.
    pub headers: String,
    /// JSON body template.
    pub body: String,
}

impl Default for RequestTemplate {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            headers: String::new(),
            body: String::new(),
        }
    }
}

/// An upstream LLM API provider.
#[derive(Debug, Clone, Default)]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub auth_token: String,
    pub enabled: bool,
    /// Overrides the global probe interval when set.
    pub interval_seconds: Option<i64>,
    /// Overrides the global request timeout when set.
    pub timeout_seconds: Option<i64>,
    /// JSON object mapping canonical model names to provider-specific names.
    pub model_name_mapping: Option<String>,
}

/// A model that can be probed on any provider linked to it.
#[derive(Debug, Clone, Default)]
pub struct Model {
    pub id: i64,
    pub name: String,
    /// Canonical name sent to the API unless the provider maps it.
    pub model_name: String,
    pub display_name: String,
    pub default_prompt: Option<String>,
    pub system_prompt: Option<String>,
    pub template_id: Option<i64>,
    pub enabled: bool,
    pub sort_order: i64,
}

/// Values substituted into a request template.
#[derive(Debug, Clone, Serialize)]
pub struct RenderParams {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub auth_token: String,
    /// Model name after the provider's mapping has been applied.
    pub model_name: String,
    pub prompt: String,
    pub system_prompt: String,
}

/// A fully resolved probe target, materialized fresh from the registry.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeTarget {
    pub id: TargetId,
    pub provider_name: String,
    pub model_display_name: String,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub render: RenderParams,
    #[serde(skip_serializing)]
    pub template: RequestTemplate,
}

/// A classification rule as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRule {
    pub id: i64,
    pub name: String,
    pub category: Category,
    pub http_code_pattern: Option<String>,
    pub response_regex: Option<String>,
    /// Lower sorts first.
    pub priority: i64,
}

/// A persisted probe result. Never updated except by re-classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeRecord {
    pub id: i64,
    pub target: TargetId,
    pub category: Category,
    pub rule_id: Option<i64>,
    /// Name of the assigned rule, filled in on reads.
    pub rule_name: Option<String>,
    pub http_status: Option<u16>,
    pub latency_ms: Option<u64>,
    pub failure_reason: Option<String>,
    /// Classification text, capped in length.
    pub response_excerpt: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// One entry of the unmatched-message ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmatchedMessage {
    pub message: String,
    pub occurrence_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A page of results plus the total number of rows.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, page: u32, page_size: u32) -> Self {
        let size = i64::from(page_size.max(1));
        Self {
            items,
            total,
            page,
            page_size,
            total_pages: (total + size - 1) / size,
        }
    }
}

/// Optional provider/model restriction for batch record reads.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub provider_ids: Option<Vec<i64>>,
    pub model_ids: Option<Vec<i64>>,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}
