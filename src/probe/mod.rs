//! Probe module: renders a target's request template and executes it.

mod http;
mod render;

pub use http::*;
pub use render::*;

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Why a probe produced no HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    DnsError,
    ConnectionRefused,
    ConnectError,
    RequestError,
    BodyError,
    /// The template could not be turned into a request.
    RenderError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::DnsError => "dns_error",
            FailureReason::ConnectionRefused => "connection_refused",
            FailureReason::ConnectError => "connect_error",
            FailureReason::RequestError => "request_error",
            FailureReason::BodyError => "body_error",
            FailureReason::RenderError => "render_error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw result of one probe execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub http_status: Option<u16>,
    pub response_text: Option<String>,
    /// End-to-end latency; `None` when the exchange never completed.
    pub latency_ms: Option<u64>,
    pub failure: Option<FailureReason>,
}

impl ProbeOutcome {
    pub fn response(http_status: u16, response_text: String, latency_ms: u64) -> Self {
        Self {
            http_status: Some(http_status),
            response_text: Some(response_text),
            latency_ms: Some(latency_ms),
            failure: None,
        }
    }

    pub fn failed(reason: FailureReason) -> Self {
        Self {
            http_status: None,
            response_text: None,
            latency_ms: None,
            failure: Some(reason),
        }
    }

    /// Text the classifier's regexes run against: the body, else the failure reason.
    pub fn classification_text(&self) -> &str {
        match (&self.response_text, &self.failure) {
            (Some(text), _) => text,
            (None, Some(reason)) => reason.as_str(),
            (None, None) => "",
        }
    }
}
