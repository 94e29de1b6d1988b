//! HTTP request handlers.

use super::AppState;
use crate::classify::{apply_rule_to_history, preview_rule_matches, validate_rule, ClassifyError};
use crate::db::{Category, DbError, RecordFilter, StatusRule, TargetId};
use crate::scheduler::SchedulerError;
use crate::timeline::{get_timeline, get_timeline_batch, Resolution, TimeRange, TimelineSeries};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DEFAULT_HOURS: f64 = 24.0;
const MIN_HOURS: f64 = 0.1;
const MAX_HOURS: f64 = 720.0;
const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 500;

fn db_error(e: DbError) -> Response {
    match e {
        DbError::NotFound => (StatusCode::NOT_FOUND, "Not found").into_response(),
        e => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn classify_error(e: ClassifyError) -> Response {
    match e {
        ClassifyError::Rule(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        ClassifyError::Db(e) => db_error(e),
    }
}

fn scheduler_error(e: SchedulerError) -> Response {
    let status = match &e {
        SchedulerError::UnknownTarget(_) => StatusCode::NOT_FOUND,
        SchedulerError::AlreadyRunning(_) => StatusCode::CONFLICT,
        SchedulerError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        SchedulerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}

// ============================================================================
// API: Targets and scheduler
// ============================================================================

pub async fn handle_get_targets(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_active_targets(&state.config.target_defaults()) {
        Ok(targets) => Json(targets).into_response(),
        Err(e) => db_error(e),
    }
}

pub async fn handle_scheduler_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.stats())
}

pub async fn handle_trigger(
    State(state): State<AppState>,
    Path((provider_id, model_id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    match state.scheduler.trigger_now(TargetId::new(provider_id, model_id)).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ============================================================================
// API: History and timelines
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl PageQuery {
    fn resolve(&self) -> (u32, u32) {
        let page = self.page.unwrap_or(1).max(1);
        let size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        (page, size)
    }
}

pub async fn handle_get_history(
    State(state): State<AppState>,
    Path((provider_id, model_id)): Path<(i64, i64)>,
    Query(query): Query<PageQuery>,
) -> impl IntoResponse {
    let (page, size) = query.resolve();
    match state.store.get_history(TargetId::new(provider_id, model_id), page, size) {
        Ok(history) => Json(history).into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    pub hours: Option<f64>,
    pub aggregation: Option<String>,
    /// Comma-separated provider IDs (batch only).
    pub provider_ids: Option<String>,
    /// Comma-separated model IDs (batch only).
    pub model_ids: Option<String>,
}

impl TimelineQuery {
    fn hours(&self) -> f64 {
        match self.hours {
            Some(h) if h.is_finite() => h.clamp(MIN_HOURS, MAX_HOURS),
            _ => DEFAULT_HOURS,
        }
    }

    fn window(&self) -> Result<(TimeRange, Resolution), Response> {
        let hours = self.hours();
        let resolution = match self.aggregation.as_deref() {
            Some(raw) => raw
                .parse()
                .map_err(|e: String| (StatusCode::BAD_REQUEST, e).into_response())?,
            None => Resolution::for_span(hours),
        };
        Ok((TimeRange::last_hours(hours), resolution))
    }

    fn filter(&self) -> Result<RecordFilter, Response> {
        Ok(RecordFilter {
            provider_ids: parse_id_list(self.provider_ids.as_deref())?,
            model_ids: parse_id_list(self.model_ids.as_deref())?,
        })
    }
}

fn parse_id_list(raw: Option<&str>) -> Result<Option<Vec<i64>>, Response> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Ok(None);
    };
    raw.split(',')
        .map(|id| id.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("Invalid ID list: {}", raw)).into_response())
}

#[derive(Debug, Serialize)]
pub struct TimelineResponse {
    pub provider_id: i64,
    pub model_id: i64,
    pub aggregation: Resolution,
    #[serde(flatten)]
    pub series: TimelineSeries,
}

pub async fn handle_get_timeline(
    State(state): State<AppState>,
    Path((provider_id, model_id)): Path<(i64, i64)>,
    Query(query): Query<TimelineQuery>,
) -> impl IntoResponse {
    let (range, resolution) = match query.window() {
        Ok(w) => w,
        Err(resp) => return resp,
    };

    match get_timeline(&state.store, TargetId::new(provider_id, model_id), range, resolution) {
        Ok(series) => Json(TimelineResponse {
            provider_id,
            model_id,
            aggregation: resolution,
            series,
        })
        .into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Serialize)]
pub struct BatchTimelineResponse {
    pub aggregation: Resolution,
    /// Keyed by `provider_id/model_id`.
    pub targets: BTreeMap<String, TimelineSeries>,
}

pub async fn handle_get_timeline_batch(
    State(state): State<AppState>,
    Query(query): Query<TimelineQuery>,
) -> impl IntoResponse {
    let (range, resolution) = match query.window() {
        Ok(w) => w,
        Err(resp) => return resp,
    };
    let filter = match query.filter() {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    match get_timeline_batch(&state.store, &filter, range, resolution) {
        Ok(batch) => Json(BatchTimelineResponse {
            aggregation: resolution,
            targets: batch.into_iter().map(|(id, s)| (id.to_string(), s)).collect(),
        })
        .into_response(),
        Err(e) => db_error(e),
    }
}

// ============================================================================
// API: Status rules
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RuleRequest {
    pub name: String,
    pub category: Category,
    #[serde(default)]
    pub http_code_pattern: Option<String>,
    #[serde(default)]
    pub response_regex: Option<String>,
    #[serde(default)]
    pub priority: i64,
}

impl RuleRequest {
    fn into_rule(self, id: i64) -> Result<StatusRule, Response> {
        if self.name.trim().is_empty() {
            return Err((StatusCode::BAD_REQUEST, "Rule name is required").into_response());
        }
        let blank_to_none = |p: Option<String>| p.filter(|s| !s.trim().is_empty());
        let rule = StatusRule {
            id,
            name: self.name,
            category: self.category,
            http_code_pattern: blank_to_none(self.http_code_pattern),
            response_regex: blank_to_none(self.response_regex),
            priority: self.priority,
        };
        validate_rule(&rule).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()).into_response())?;
        Ok(rule)
    }
}

pub async fn handle_get_rules(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_status_rules() {
        Ok(rules) => Json(rules).into_response(),
        Err(e) => db_error(e),
    }
}

pub async fn handle_create_rule(
    State(state): State<AppState>,
    Json(req): Json<RuleRequest>,
) -> impl IntoResponse {
    let mut rule = match req.into_rule(0) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match state.store.add_status_rule(&mut rule) {
        Ok(_) => {
            state.scheduler.reconfigure();
            (StatusCode::CREATED, Json(rule)).into_response()
        }
        Err(e) => db_error(e),
    }
}

pub async fn handle_update_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<RuleRequest>,
) -> impl IntoResponse {
    let rule = match req.into_rule(id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match state.store.update_status_rule(&rule) {
        Ok(_) => {
            state.scheduler.reconfigure();
            Json(rule).into_response()
        }
        Err(e) => db_error(e),
    }
}

pub async fn handle_delete_rule(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.store.delete_status_rule(id) {
        Ok(_) => {
            state.scheduler.reconfigure();
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub regex: String,
}

pub async fn handle_preview_rule(
    State(state): State<AppState>,
    Json(req): Json<PreviewRequest>,
) -> impl IntoResponse {
    if req.regex.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "A regex is required").into_response();
    }
    match preview_rule_matches(&state.store, &req.regex) {
        Ok(matches) => Json(matches).into_response(),
        Err(e) => classify_error(e),
    }
}

#[derive(Debug, Serialize)]
pub struct ApplyResponse {
    pub rule_id: i64,
    pub updated: usize,
}

pub async fn handle_apply_rule(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match apply_rule_to_history(&state.store, id) {
        Ok(updated) => Json(ApplyResponse { rule_id: id, updated }).into_response(),
        Err(e) => classify_error(e),
    }
}

pub async fn handle_get_unmatched(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> impl IntoResponse {
    let (page, size) = query.resolve();
    match state.store.list_unmatched(page, size) {
        Ok(ledger) => Json(ledger).into_response(),
        Err(e) => db_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeline_query(hours: Option<f64>, aggregation: Option<&str>) -> TimelineQuery {
        TimelineQuery {
            hours,
            aggregation: aggregation.map(str::to_string),
            provider_ids: None,
            model_ids: None,
        }
    }

    #[test]
    fn test_hours_are_clamped() {
        assert_eq!(timeline_query(None, None).hours(), 24.0);
        assert_eq!(timeline_query(Some(0.0), None).hours(), 0.1);
        assert_eq!(timeline_query(Some(10_000.0), None).hours(), 720.0);
        assert_eq!(timeline_query(Some(f64::NAN), None).hours(), 24.0);
    }

    #[test]
    fn test_aggregation_parsing() {
        let (_, resolution) = timeline_query(Some(24.0), Some("6hour")).window().unwrap();
        assert_eq!(resolution, Resolution::SixHour);
        let (_, resolution) = timeline_query(Some(1.0), None).window().unwrap();
        assert_eq!(resolution, Resolution::None);
        assert!(timeline_query(None, Some("fortnight")).window().is_err());
    }

    #[test]
    fn test_page_size_is_clamped() {
        let q = PageQuery {
            page: Some(0),
            page_size: Some(10_000),
        };
        assert_eq!(q.resolve(), (1, MAX_PAGE_SIZE));
        let q = PageQuery {
            page: None,
            page_size: Some(0),
        };
        assert_eq!(q.resolve(), (1, 1));
    }

    #[test]
    fn test_parse_id_list() {
        assert_eq!(parse_id_list(None).unwrap(), None);
        assert_eq!(parse_id_list(Some("")).unwrap(), None);
        assert_eq!(parse_id_list(Some("1, 2,3")).unwrap(), Some(vec![1, 2, 3]));
        assert!(parse_id_list(Some("1,x")).is_err());
    }

    #[test]
    fn test_rule_request_validation() {
        let req = |category, regex: &str| RuleRequest {
            name: "r".to_string(),
            category,
            http_code_pattern: Some(" ".to_string()),
            response_regex: Some(regex.to_string()),
            priority: 1,
        };

        let rule = req(Category::Degraded, "busy").into_rule(7).unwrap();
        assert_eq!(rule.id, 7);
        assert_eq!(rule.http_code_pattern, None);

        assert!(req(Category::Degraded, "(busy").into_rule(0).is_err());
        assert!(req(Category::Unmatched, "busy").into_rule(0).is_err());
    }
}
