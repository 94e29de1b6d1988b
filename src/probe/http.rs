//! HTTP probe execution.

use std::error::Error as StdError;
use std::time::{Duration, Instant};

use super::{render_request, FailureReason, ProbeError, ProbeOutcome, RenderedRequest};
use crate::db::ProbeTarget;

/// Extra time allowed past the request timeout before the probe is abandoned.
const HARD_TIMEOUT_GRACE: Duration = Duration::from_secs(1);

/// Sends rendered probe requests over a shared connection pool.
#[derive(Clone)]
pub struct ProbeExecutor {
    client: reqwest::Client,
}

impl ProbeExecutor {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("modelwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Render the target's template and execute it.
    ///
    /// Never fails: transport and template problems come back as a failed outcome.
    pub async fn probe(&self, target: &ProbeTarget) -> ProbeOutcome {
        match render_request(&target.template, &target.render) {
            Ok(request) => self.execute(&request, target.timeout).await,
            Err(e) => {
                tracing::warn!("Template for {} cannot be rendered: {}", target.id, e);
                ProbeOutcome::failed(FailureReason::RenderError)
            }
        }
    }

    /// Perform one request. Returns within `timeout` plus a small grace period.
    pub async fn execute(&self, request: &RenderedRequest, timeout: Duration) -> ProbeOutcome {
        let start = Instant::now();
        let exchange = self.exchange(request, timeout, start);

        match tokio::time::timeout(timeout + HARD_TIMEOUT_GRACE, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::failed(FailureReason::Timeout),
        }
    }

    async fn exchange(&self, request: &RenderedRequest, timeout: Duration, start: Instant) -> ProbeOutcome {
        let response = match self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .json(&request.body)
            .timeout(timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return ProbeOutcome::failed(failure_reason(&e)),
        };

        let status = response.status();

        // Read the full body so latency covers the complete transfer
        let raw = match response.text().await {
            Ok(t) => t,
            Err(e) => return ProbeOutcome::failed(failure_reason(&e)),
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        let text = if status.is_success() {
            extract_content(&raw, request.stream).unwrap_or(raw)
        } else {
            raw
        };

        ProbeOutcome::response(status.as_u16(), text, latency_ms)
    }
}

/// Normalize a transport error into a short machine-readable reason.
fn failure_reason(err: &reqwest::Error) -> FailureReason {
    if err.is_timeout() {
        return FailureReason::Timeout;
    }
    if err.is_connect() {
        let mut source = err.source();
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                if io.kind() == std::io::ErrorKind::ConnectionRefused {
                    return FailureReason::ConnectionRefused;
                }
            }
            let text = cause.to_string().to_ascii_lowercase();
            if text.contains("dns error") || text.contains("failed to lookup address") {
                return FailureReason::DnsError;
            }
            if text.contains("connection refused") {
                return FailureReason::ConnectionRefused;
            }
            source = cause.source();
        }
        return FailureReason::ConnectError;
    }
    if err.is_body() || err.is_decode() {
        return FailureReason::BodyError;
    }
    FailureReason::RequestError
}

/// Pull the assistant's text out of a successful completion response.
///
/// Understands Anthropic messages and OpenAI chat/completions bodies, either
/// whole or as server-sent events.
pub fn extract_content(raw: &str, stream: bool) -> Option<String> {
    if stream {
        extract_stream_content(raw)
    } else {
        let data: serde_json::Value = serde_json::from_str(raw).ok()?;
        extract_message_content(&data)
    }
}

fn extract_message_content(data: &serde_json::Value) -> Option<String> {
    if let Some(blocks) = data.get("content").and_then(|c| c.as_array()) {
        let text: String = blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect();
        return Some(text);
    }

    let choice = data.get("choices")?.get(0)?;
    choice
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| choice.get("text"))
        .and_then(|t| t.as_str())
        .map(str::to_string)
}

fn extract_stream_content(raw: &str) -> Option<String> {
    let mut collected: Option<String> = None;

    for line in raw.lines() {
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }
        let Ok(data) = serde_json::from_str::<serde_json::Value>(payload) else {
            continue;
        };

        if let Some(text) = stream_chunk_text(&data) {
            collected.get_or_insert_with(String::new).push_str(text);
        }
    }

    collected
}

fn stream_chunk_text(data: &serde_json::Value) -> Option<&str> {
    if data.get("type").and_then(|t| t.as_str()) == Some("content_block_delta") {
        let delta = data.get("delta")?;
        if delta.get("type").and_then(|t| t.as_str()) == Some("text_delta") {
            return delta.get("text").and_then(|t| t.as_str());
        }
        return None;
    }

    data.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
}
