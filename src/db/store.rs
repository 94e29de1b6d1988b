//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::models::*;
use crate::config::TargetDefaults;
use crate::probe::resolve_model_name;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Prompt used when neither the provider link nor the model sets one.
pub const DEFAULT_PROMPT: &str = "ping, only respond with 'pong'";

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
///
/// Serves both as the target registry (providers, models, templates, rules)
/// and as the append-only probe history.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let mut conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        embedded::migrations::runner()
            .run(&mut conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied statement behind.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- Registry ---

    /// All enabled (provider, model) pairs with a template, fully resolved.
    pub fn list_active_targets(&self, defaults: &TargetDefaults) -> Result<Vec<ProbeTarget>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{} ORDER BY p.id, m.sort_order, m.id", ACTIVE_TARGETS_SQL))?;
        let rows = stmt
            .query_map([], target_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows.into_iter().map(|r| r.resolve(defaults)).collect())
    }

    /// A single active target, or `NotFound` when it is unknown or disabled.
    pub fn get_active_target(&self, id: TargetId, defaults: &TargetDefaults) -> Result<ProbeTarget, DbError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("{} AND p.id = ?1 AND m.id = ?2", ACTIVE_TARGETS_SQL),
                params![id.provider_id, id.model_id],
                target_row,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;

        Ok(row.resolve(defaults))
    }

    /// Add a request template and return its ID.
    pub fn add_template(&self, template: &mut RequestTemplate) -> Result<i64, DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO request_templates (name, method, path, headers, body) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![template.name, template.method, template.path, template.headers, template.body],
        )?;
        template.id = conn.last_insert_rowid();
        Ok(template.id)
    }

    /// Number of stored request templates.
    pub fn count_templates(&self) -> Result<i64, DbError> {
        let conn = self.conn();
        Ok(conn.query_row("SELECT COUNT(*) FROM request_templates", [], |r| r.get(0))?)
    }

    /// Add a provider and return its ID.
    pub fn add_provider(&self, provider: &mut Provider) -> Result<i64, DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO providers (name, base_url, auth_token, enabled, interval_seconds, timeout_seconds, model_name_mapping)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                provider.name,
                provider.base_url,
                provider.auth_token,
                provider.enabled,
                provider.interval_seconds,
                provider.timeout_seconds,
                provider.model_name_mapping,
            ],
        )?;
        provider.id = conn.last_insert_rowid();
        Ok(provider.id)
    }

    /// Enable or disable a provider.
    pub fn set_provider_enabled(&self, id: i64, enabled: bool) -> Result<(), DbError> {
        let conn = self.conn();
        let n = conn.execute("UPDATE providers SET enabled = ?1 WHERE id = ?2", params![enabled, id])?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Set or clear a provider's interval override.
    pub fn set_provider_interval(&self, id: i64, interval_seconds: Option<i64>) -> Result<(), DbError> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE providers SET interval_seconds = ?1 WHERE id = ?2",
            params![interval_seconds, id],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Add a model and return its ID.
    pub fn add_model(&self, model: &mut Model) -> Result<i64, DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO models (name, model_name, display_name, default_prompt, system_prompt, template_id, enabled, sort_order)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                model.name,
                model.model_name,
                model.display_name,
                model.default_prompt,
                model.system_prompt,
                model.template_id,
                model.enabled,
                model.sort_order,
            ],
        )?;
        model.id = conn.last_insert_rowid();
        Ok(model.id)
    }

    /// Link a model to a provider so the pair becomes a probe target.
    pub fn link_provider_model(
        &self,
        provider_id: i64,
        model_id: i64,
        custom_prompt: Option<&str>,
    ) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO provider_models (provider_id, model_id, enabled, custom_prompt) VALUES (?1, ?2, 1, ?3)",
            params![provider_id, model_id, custom_prompt],
        )?;
        Ok(())
    }

    // --- Status Rules ---

    /// All rules ordered by ascending priority, ties by ID.
    pub fn get_status_rules(&self) -> Result<Vec<StatusRule>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, category, http_code_pattern, response_regex, priority
             FROM status_rules ORDER BY priority ASC, id ASC",
        )?;
        let rules = stmt
            .query_map([], rule_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rules)
    }

    /// Get a rule by ID.
    pub fn get_status_rule(&self, id: i64) -> Result<StatusRule, DbError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, name, category, http_code_pattern, response_regex, priority FROM status_rules WHERE id = ?1",
            params![id],
            rule_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Add a rule and return its ID. Patterns must already be validated.
    pub fn add_status_rule(&self, rule: &mut StatusRule) -> Result<i64, DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO status_rules (name, category, http_code_pattern, response_regex, priority)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                rule.name,
                rule.category.as_str(),
                rule.http_code_pattern,
                rule.response_regex,
                rule.priority,
            ],
        )?;
        rule.id = conn.last_insert_rowid();
        Ok(rule.id)
    }

    /// Update an existing rule. Patterns must already be validated.
    pub fn update_status_rule(&self, rule: &StatusRule) -> Result<(), DbError> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE status_rules SET name=?1, category=?2, http_code_pattern=?3, response_regex=?4, priority=?5 WHERE id=?6",
            params![
                rule.name,
                rule.category.as_str(),
                rule.http_code_pattern,
                rule.response_regex,
                rule.priority,
                rule.id,
            ],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Delete a rule. Records classified by it keep their category.
    pub fn delete_status_rule(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn();
        let n = conn.execute("DELETE FROM status_rules WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Probe History ---

    /// Append a probe record and return its ID.
    pub fn append_record(&self, record: &ProbeRecord) -> Result<i64, DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO probe_records
             (provider_id, model_id, category, rule_id, http_status, latency_ms, failure_reason, response_excerpt, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.target.provider_id,
                record.target.model_id,
                record.category.as_str(),
                record.rule_id,
                record.http_status,
                record.latency_ms.map(|l| l as i64),
                record.failure_reason,
                record.response_excerpt,
                fmt_db_time(record.checked_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Records of one target with `from <= checked_at < to`, oldest first.
    pub fn query_records(
        &self,
        target: TargetId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ProbeRecord>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE r.provider_id = ?1 AND r.model_id = ?2 AND r.checked_at >= ?3 AND r.checked_at < ?4
             ORDER BY r.checked_at ASC, r.id ASC",
            RECORD_SELECT_SQL
        ))?;
        let records = stmt
            .query_map(
                params![target.provider_id, target.model_id, fmt_db_time(from), fmt_db_time(to)],
                record_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(records)
    }

    /// Records of every target passing `filter` within the range, oldest first.
    pub fn get_records_in_range(
        &self,
        filter: &RecordFilter,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ProbeRecord>, DbError> {
        let mut sql = format!("{} WHERE r.checked_at >= ?1 AND r.checked_at < ?2", RECORD_SELECT_SQL);
        let mut values = vec![Value::Text(fmt_db_time(from)), Value::Text(fmt_db_time(to))];

        for (column, ids) in [
            ("r.provider_id", &filter.provider_ids),
            ("r.model_id", &filter.model_ids),
        ] {
            if let Some(ids) = ids {
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                let placeholders: Vec<String> = ids
                    .iter()
                    .map(|id| {
                        values.push(Value::Integer(*id));
                        format!("?{}", values.len())
                    })
                    .collect();
                sql.push_str(&format!(" AND {} IN ({})", column, placeholders.join(", ")));
            }
        }
        sql.push_str(" ORDER BY r.checked_at ASC, r.id ASC");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(values.iter()), record_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(records)
    }

    /// Paginated history of one target, newest first. `page` is 1-based.
    pub fn get_history(&self, target: TargetId, page: u32, page_size: u32) -> Result<Page<ProbeRecord>, DbError> {
        let page = page.max(1);
        let conn = self.conn();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM probe_records WHERE provider_id = ?1 AND model_id = ?2",
            params![target.provider_id, target.model_id],
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "{} WHERE r.provider_id = ?1 AND r.model_id = ?2 ORDER BY r.checked_at DESC, r.id DESC LIMIT ?3 OFFSET ?4",
            RECORD_SELECT_SQL
        ))?;
        let items = stmt
            .query_map(
                params![
                    target.provider_id,
                    target.model_id,
                    page_size,
                    i64::from(page - 1) * i64::from(page_size),
                ],
                record_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(Page::new(items, total, page, page_size))
    }

    /// All records currently classified as unmatched, oldest first.
    pub fn get_unmatched_records(&self) -> Result<Vec<ProbeRecord>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE r.category = 'unmatched' ORDER BY r.checked_at ASC, r.id ASC",
            RECORD_SELECT_SQL
        ))?;
        let records = stmt
            .query_map([], record_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(records)
    }

    /// Assign a new category and rule to a previously unmatched record.
    ///
    /// Returns false when the record was no longer unmatched.
    pub fn reclassify_record(&self, id: i64, category: Category, rule_id: i64) -> Result<bool, DbError> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE probe_records SET category = ?1, rule_id = ?2 WHERE id = ?3 AND category = 'unmatched'",
            params![category.as_str(), rule_id, id],
        )?;
        Ok(n > 0)
    }

    /// Delete records checked before the cutoff. Returns the number deleted.
    pub fn delete_records_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn();
        Ok(conn.execute(
            "DELETE FROM probe_records WHERE checked_at < ?1",
            params![fmt_db_time(cutoff)],
        )?)
    }

    // --- Unmatched Ledger ---

    /// Insert a message or bump its counter. Returns the new occurrence count.
    pub fn record_unmatched(&self, message: &str, seen_at: DateTime<Utc>) -> Result<i64, DbError> {
        let conn = self.conn();
        let count = conn.query_row(
            "INSERT INTO unmatched_messages (message, occurrence_count, first_seen, last_seen)
             VALUES (?1, 1, ?2, ?2)
             ON CONFLICT(message) DO UPDATE SET
             occurrence_count = occurrence_count + 1,
             first_seen = MIN(first_seen, excluded.first_seen),
             last_seen = MAX(last_seen, excluded.last_seen)
             RETURNING occurrence_count",
            params![message, fmt_db_time(seen_at)],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Paginated ledger, most frequent first.
    pub fn list_unmatched(&self, page: u32, page_size: u32) -> Result<Page<UnmatchedMessage>, DbError> {
        let page = page.max(1);
        let conn = self.conn();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM unmatched_messages", [], |r| r.get(0))?;
        let mut stmt = conn.prepare(
            "SELECT message, occurrence_count, first_seen, last_seen FROM unmatched_messages
             ORDER BY occurrence_count DESC, last_seen DESC LIMIT ?1 OFFSET ?2",
        )?;
        let items = stmt
            .query_map(
                params![page_size, i64::from(page - 1) * i64::from(page_size)],
                unmatched_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(Page::new(items, total, page, page_size))
    }

    /// The whole ledger, most frequent first.
    pub fn all_unmatched(&self) -> Result<Vec<UnmatchedMessage>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT message, occurrence_count, first_seen, last_seen FROM unmatched_messages
             ORDER BY occurrence_count DESC, last_seen DESC",
        )?;
        let items = stmt
            .query_map([], unmatched_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(items)
    }

    /// Remove a message from the ledger. Returns whether it existed.
    pub fn delete_unmatched_message(&self, message: &str) -> Result<bool, DbError> {
        let conn = self.conn();
        let n = conn.execute("DELETE FROM unmatched_messages WHERE message = ?1", params![message])?;
        Ok(n > 0)
    }

    /// Drop ledger entries not seen since the cutoff.
    pub fn delete_unmatched_seen_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn();
        Ok(conn.execute(
            "DELETE FROM unmatched_messages WHERE last_seen < ?1",
            params![fmt_db_time(cutoff)],
        )?)
    }
}

const ACTIVE_TARGETS_SQL: &str = "SELECT p.id, m.id, p.name, m.display_name, p.base_url, p.auth_token,
        p.interval_seconds, p.timeout_seconds, p.model_name_mapping, m.model_name,
        pm.custom_prompt, m.default_prompt, m.system_prompt,
        t.id, t.name, t.method, t.path, t.headers, t.body
     FROM provider_models pm
     JOIN providers p ON p.id = pm.provider_id
     JOIN models m ON m.id = pm.model_id
     JOIN request_templates t ON t.id = m.template_id
     WHERE p.enabled = 1 AND pm.enabled = 1 AND m.enabled = 1";

const RECORD_SELECT_SQL: &str = "SELECT r.id, r.provider_id, r.model_id, r.category, r.rule_id, s.name,
        r.http_status, r.latency_ms, r.failure_reason, r.response_excerpt, r.checked_at
     FROM probe_records r LEFT JOIN status_rules s ON s.id = r.rule_id";

/// Registry row before defaults and mappings are applied.
struct TargetRow {
    id: TargetId,
    provider_name: String,
    model_display_name: String,
    base_url: String,
    auth_token: String,
    interval_seconds: Option<i64>,
    timeout_seconds: Option<i64>,
    model_name_mapping: Option<String>,
    canonical_model_name: String,
    custom_prompt: Option<String>,
    default_prompt: Option<String>,
    system_prompt: Option<String>,
    template: RequestTemplate,
}

impl TargetRow {
    fn resolve(self, defaults: &TargetDefaults) -> ProbeTarget {
        let positive_secs = |v: Option<i64>| v.filter(|s| *s > 0).map(|s| Duration::from_secs(s as u64));
        let prompt = [self.custom_prompt, self.default_prompt]
            .into_iter()
            .flatten()
            .find(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PROMPT.to_string());

        ProbeTarget {
            id: self.id,
            provider_name: self.provider_name,
            model_display_name: self.model_display_name,
            interval: positive_secs(self.interval_seconds).unwrap_or(defaults.interval),
            timeout: positive_secs(self.timeout_seconds).unwrap_or(defaults.timeout),
            render: RenderParams {
                base_url: self.base_url,
                auth_token: self.auth_token,
                model_name: resolve_model_name(self.model_name_mapping.as_deref(), &self.canonical_model_name),
                prompt,
                system_prompt: self.system_prompt.unwrap_or_default(),
            },
            template: self.template,
        }
    }
}

fn target_row(row: &Row<'_>) -> SqlResult<TargetRow> {
    Ok(TargetRow {
        id: TargetId::new(row.get(0)?, row.get(1)?),
        provider_name: row.get(2)?,
        model_display_name: row.get(3)?,
        base_url: row.get(4)?,
        auth_token: row.get(5)?,
        interval_seconds: row.get(6)?,
        timeout_seconds: row.get(7)?,
        model_name_mapping: row.get(8)?,
        canonical_model_name: row.get(9)?,
        custom_prompt: row.get(10)?,
        default_prompt: row.get(11)?,
        system_prompt: row.get(12)?,
        template: RequestTemplate {
            id: row.get(13)?,
            name: row.get(14)?,
            method: row.get(15)?,
            path: row.get(16)?,
            headers: row.get(17)?,
            body: row.get(18)?,
        },
    })
}

fn rule_row(row: &Row<'_>) -> SqlResult<StatusRule> {
    Ok(StatusRule {
        id: row.get(0)?,
        name: row.get(1)?,
        category: category_column(row, 2)?,
        http_code_pattern: row.get(3)?,
        response_regex: row.get(4)?,
        priority: row.get(5)?,
    })
}

fn record_row(row: &Row<'_>) -> SqlResult<ProbeRecord> {
    let http_status: Option<i64> = row.get(6)?;
    let latency_ms: Option<i64> = row.get(7)?;
    Ok(ProbeRecord {
        id: row.get(0)?,
        target: TargetId::new(row.get(1)?, row.get(2)?),
        category: category_column(row, 3)?,
        rule_id: row.get(4)?,
        rule_name: row.get(5)?,
        http_status: http_status.and_then(|c| u16::try_from(c).ok()),
        latency_ms: latency_ms.and_then(|l| u64::try_from(l).ok()),
        failure_reason: row.get(8)?,
        response_excerpt: row.get(9)?,
        checked_at: time_column(row, 10)?,
    })
}

fn unmatched_row(row: &Row<'_>) -> SqlResult<UnmatchedMessage> {
    Ok(UnmatchedMessage {
        message: row.get(0)?,
        occurrence_count: row.get(1)?,
        first_seen: time_column(row, 2)?,
        last_seen: time_column(row, 3)?,
    })
}

fn category_column(row: &Row<'_>, idx: usize) -> SqlResult<Category> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("bad timestamp: {}", raw).into())
    })
}

fn fmt_db_time(t: DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [DB_TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}
