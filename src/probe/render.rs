//! Request template rendering.
//!
//! Templates carry `{key}`, `{model}`, `{user_prompt}` and `{system_prompt}`
//! placeholders. Anything else in braces is left as written.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST};
use reqwest::{Method, Url};
use std::collections::HashMap;
use thiserror::Error;

use crate::db::{RenderParams, RequestTemplate};

/// Template rendering error types.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("invalid HTTP method: {0}")]
    Method(String),
    #[error("invalid URL {0}: {1}")]
    Url(String, String),
    #[error("invalid header line: {0}")]
    Header(String),
    #[error("rendered body is not valid JSON: {0}")]
    Body(#[from] serde_json::Error),
}

/// A concrete request ready to send.
#[derive(Debug, Clone)]
pub struct RenderedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
    /// Whether the body asks for a server-sent-event stream.
    pub stream: bool,
}

/// Apply a provider's model name mapping, falling back to the canonical name.
///
/// A mapping that is not a JSON object of strings is ignored.
pub fn resolve_model_name(mapping: Option<&str>, canonical: &str) -> String {
    mapping
        .and_then(|raw| serde_json::from_str::<HashMap<String, String>>(raw).ok())
        .and_then(|mut map| map.remove(canonical))
        .unwrap_or_else(|| canonical.to_string())
}

/// Build the request for one target.
pub fn render_request(template: &RequestTemplate, params: &RenderParams) -> Result<RenderedRequest, RenderError> {
    let vars = [
        ("{key}", params.auth_token.as_str()),
        ("{model}", params.model_name.as_str()),
        ("{user_prompt}", params.prompt.as_str()),
        ("{system_prompt}", params.system_prompt.as_str()),
    ];

    let method = Method::from_bytes(template.method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| RenderError::Method(template.method.clone()))?;

    let path = substitute(&template.path, &vars, |v| v.to_string());
    let url = build_url(&params.base_url, &path)?;
    let headers = parse_headers(&template.headers, &vars, &url)?;

    let body_text = substitute(&template.body, &vars, json_escape);
    let body: serde_json::Value = serde_json::from_str(&body_text)?;
    let stream = body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);

    Ok(RenderedRequest {
        method,
        url,
        headers,
        body,
        stream,
    })
}

/// Replace placeholders in one left-to-right scan; substituted values are never rescanned.
fn substitute(text: &str, vars: &[(&str, &str)], escape: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        match vars.iter().find(|(placeholder, _)| tail.starts_with(placeholder)) {
            Some((placeholder, value)) => {
                out.push_str(&escape(value));
                rest = &tail[placeholder.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Escape a value for use inside a JSON string literal, without the quotes.
fn json_escape(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

fn build_url(base_url: &str, path: &str) -> Result<Url, RenderError> {
    let base = base_url.trim_end_matches('/');
    let full = if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    };
    Url::parse(&full).map_err(|e| RenderError::Url(full.clone(), e.to_string()))
}

fn parse_headers(block: &str, vars: &[(&str, &str)], url: &Url) -> Result<HeaderMap, RenderError> {
    let mut headers = HeaderMap::new();

    for line in block.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| RenderError::Header(line.to_string()))?;

        if name == CONTENT_LENGTH {
            continue;
        }
        let value = if name == HOST {
            host_authority(url)
        } else {
            substitute(value.trim(), vars, |v| v.replace(['\r', '\n'], ""))
        };
        let value = HeaderValue::from_str(&value).map_err(|_| RenderError::Header(line.to_string()))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

fn host_authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}
