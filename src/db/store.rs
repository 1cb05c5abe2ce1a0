//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

/// Largest page the delivery log listing will return.
pub const MAX_PAGE_SIZE: u32 = 500;
const DEFAULT_PAGE_SIZE: u32 = 50;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Connection lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

/// How the retry queue changes together with an attempt row.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryUpdate {
    /// Schedule (or reschedule) the next attempt. Cancelled pairs are left alone.
    Schedule {
        next_attempt_at: DateTime<Utc>,
        attempts_made: u32,
        max_attempts: u32,
    },
    /// The pair reached a terminal state; drop any pending retry.
    Clear,
}

const PROFILE_COLUMNS: &str = "id, owner_scope, owner_id, scope_type, scope_id, name, tracker, \
     endpoint_url, http_method, params_template, auth_query_key, auth_header_name, status_map, \
     max_attempts, is_active, is_backup";

const CONVERSION_COLUMNS: &str = "id, clickid, txid, conversion_type, status, value, currency, \
     antifraud_level, owner_id, advertiser_id, partner_id, offer_id, campaign_id, created_at";

const ATTEMPT_COLUMNS: &str = "id, profile_id, conversion_id, built_url, http_method, \
     attempt_number, response_code, response_body, outcome, state, skipped_reason, \
     error_message, latency_ms, next_retry_at, created_at";

const RETRY_COLUMNS: &str =
    "conversion_id, profile_id, next_attempt_at, attempts_made, max_attempts, status";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
            .map_err(|e| DbError::Migration(format!("Pragma setup failed: {}", e)))?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Profiles ---

    /// Insert or replace a profile received from the configuration surface.
    pub fn upsert_profile(&self, profile: &PostbackProfile) -> Result<(), DbError> {
        let params_template = serde_json::to_string(&profile.params_template)?;
        let status_map = serde_json::to_string(&profile.status_map)?;

        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO postback_profiles ({PROFILE_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                profile.id,
                profile.owner_scope,
                profile.owner_id,
                profile.scope_type,
                profile.scope_id,
                profile.name,
                profile.tracker,
                profile.endpoint_url,
                profile.http_method,
                params_template,
                profile.auth_query_key,
                profile.auth_header_name,
                status_map,
                profile.max_attempts,
                profile.is_active,
                profile.is_backup,
            ],
        )?;
        Ok(())
    }

    /// Get all profiles, active or not.
    pub fn get_profiles(&self) -> Result<Vec<PostbackProfile>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROFILE_COLUMNS} FROM postback_profiles ORDER BY id"
        ))?;
        let profiles = stmt
            .query_map([], row_to_profile)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(profiles)
    }

    /// Get a profile by ID.
    pub fn get_profile(&self, id: i64) -> Result<PostbackProfile, DbError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {PROFILE_COLUMNS} FROM postback_profiles WHERE id = ?1"),
            params![id],
            row_to_profile,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Active profiles matching the event by owner or by any scope predicate.
    ///
    /// A profile may satisfy several predicates; callers de-duplicate.
    pub fn find_candidate_profiles(
        &self,
        event: &ConversionEvent,
    ) -> Result<Vec<PostbackProfile>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROFILE_COLUMNS} FROM postback_profiles
             WHERE is_active = 1 AND (
                (owner_scope = 'owner' AND owner_id = ?1)
                OR (owner_scope = 'advertiser' AND owner_id = ?2)
                OR (owner_scope = 'partner' AND owner_id = ?3)
                OR (scope_type = 'flow' AND scope_id = ?4)
                OR (scope_type = 'offer' AND scope_id = ?5)
                OR (scope_type = 'campaign' AND scope_id = ?4)
                OR scope_type = 'global'
             )
             ORDER BY id"
        ))?;
        let profiles = stmt
            .query_map(
                params![
                    event.owner_id,
                    event.advertiser_id,
                    event.partner_id,
                    event.campaign_id,
                    event.offer_id,
                ],
                row_to_profile,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(profiles)
    }

    // --- Conversions ---

    /// Store a conversion. Returns false if it was already stored.
    pub fn add_conversion(&self, event: &ConversionEvent) -> Result<bool, DbError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO conversions ({CONVERSION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                event.id,
                event.clickid,
                event.txid,
                event.conversion_type,
                event.status,
                event.value,
                event.currency,
                event.antifraud_level,
                event.owner_id,
                event.advertiser_id,
                event.partner_id,
                event.offer_id,
                event.campaign_id,
                format_db_time(&event.created_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_conversion(&self, id: i64) -> Result<ConversionEvent, DbError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {CONVERSION_COLUMNS} FROM conversions WHERE id = ?1"),
            params![id],
            |row| {
                Ok(ConversionEvent {
                    id: row.get(0)?,
                    clickid: row.get(1)?,
                    txid: row.get(2)?,
                    conversion_type: row.get(3)?,
                    status: row.get(4)?,
                    value: row.get(5)?,
                    currency: row.get(6)?,
                    antifraud_level: row.get(7)?,
                    owner_id: row.get(8)?,
                    advertiser_id: row.get(9)?,
                    partner_id: row.get(10)?,
                    offer_id: row.get(11)?,
                    campaign_id: row.get(12)?,
                    created_at: time_column(row, 13)?,
                })
            },
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    // --- Delivery log + retry queue ---

    /// Append an attempt row and apply the retry update in one transaction.
    ///
    /// Sets `attempt.id` to the new row id.
    pub fn record_attempt(
        &self,
        attempt: &mut DeliveryAttempt,
        retry: &RetryUpdate,
    ) -> Result<i64, DbError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO delivery_attempts (profile_id, conversion_id, built_url, http_method, \
             attempt_number, response_code, response_body, outcome, state, skipped_reason, \
             error_message, latency_ms, next_retry_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                attempt.profile_id,
                attempt.conversion_id,
                attempt.built_url,
                attempt.http_method,
                attempt.attempt_number,
                attempt.response_code,
                attempt.response_body,
                attempt.outcome,
                attempt.state,
                attempt.skipped_reason,
                attempt.error_message,
                attempt.latency_ms,
                attempt.next_retry_at.as_ref().map(format_db_time),
                format_db_time(&attempt.created_at),
            ],
        )?;
        let id = tx.last_insert_rowid();

        match retry {
            RetryUpdate::Schedule {
                next_attempt_at,
                attempts_made,
                max_attempts,
            } => {
                tx.execute(
                    "INSERT INTO retry_queue (conversion_id, profile_id, next_attempt_at, \
                     attempts_made, max_attempts, status, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6) \
                     ON CONFLICT(conversion_id, profile_id) DO UPDATE SET \
                     next_attempt_at = excluded.next_attempt_at, \
                     attempts_made = excluded.attempts_made, \
                     max_attempts = excluded.max_attempts, \
                     updated_at = excluded.updated_at \
                     WHERE retry_queue.status = 'pending'",
                    params![
                        attempt.conversion_id,
                        attempt.profile_id,
                        format_db_time(next_attempt_at),
                        attempts_made,
                        max_attempts,
                        format_db_time(&attempt.created_at),
                    ],
                )?;
            }
            RetryUpdate::Clear => {
                tx.execute(
                    "DELETE FROM retry_queue \
                     WHERE conversion_id = ?1 AND profile_id = ?2 AND status = 'pending'",
                    params![attempt.conversion_id, attempt.profile_id],
                )?;
            }
        }

        tx.commit()?;
        attempt.id = id;
        Ok(id)
    }

    /// Page through the delivery log, newest first.
    pub fn list_attempts(&self, filter: &DeliveryFilter) -> Result<Vec<DeliveryAttempt>, DbError> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(profile_id) = filter.profile_id {
            values.push(Value::Integer(profile_id));
            clauses.push(format!("profile_id = ?{}", values.len()));
        }
        if let Some(conversion_id) = filter.conversion_id {
            values.push(Value::Integer(conversion_id));
            clauses.push(format!("conversion_id = ?{}", values.len()));
        }
        if let Some(outcome) = filter.outcome {
            values.push(Value::Text(outcome.as_str().to_string()));
            clauses.push(format!("outcome = ?{}", values.len()));
        }
        if let Some(state) = filter.state {
            values.push(Value::Text(state.as_str().to_string()));
            clauses.push(format!("state = ?{}", values.len()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let limit = filter.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        values.push(Value::Integer(i64::from(limit)));
        let limit_idx = values.len();
        values.push(Value::Integer(i64::from(filter.offset.unwrap_or(0))));
        let offset_idx = values.len();

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts {where_sql} \
             ORDER BY id DESC LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
        ))?;
        let attempts = stmt
            .query_map(params_from_iter(values), row_to_attempt)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(attempts)
    }

    /// All attempts for one pair in the order they were made.
    #[cfg(test)]
    pub fn attempts_for_pair(
        &self,
        conversion_id: i64,
        profile_id: i64,
    ) -> Result<Vec<DeliveryAttempt>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts \
             WHERE conversion_id = ?1 AND profile_id = ?2 ORDER BY id ASC"
        ))?;
        let attempts = stmt
            .query_map(params![conversion_id, profile_id], row_to_attempt)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(attempts)
    }

    pub fn get_retry_state(
        &self,
        conversion_id: i64,
        profile_id: i64,
    ) -> Result<Option<RetryState>, DbError> {
        let conn = self.lock()?;
        let state = conn
            .query_row(
                &format!(
                    "SELECT {RETRY_COLUMNS} FROM retry_queue \
                     WHERE conversion_id = ?1 AND profile_id = ?2"
                ),
                params![conversion_id, profile_id],
                row_to_retry,
            )
            .optional()?;
        Ok(state)
    }

    /// Pending retries whose next attempt is due at `now`, oldest first.
    pub fn due_retries(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<RetryState>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RETRY_COLUMNS} FROM retry_queue \
             WHERE status = 'pending' AND next_attempt_at <= ?1 \
             ORDER BY next_attempt_at ASC LIMIT ?2"
        ))?;
        let due = stmt
            .query_map(params![format_db_time(&now), limit], row_to_retry)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(due)
    }

    /// Drop a pending retry without writing an attempt row.
    pub fn delete_retry(&self, conversion_id: i64, profile_id: i64) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM retry_queue WHERE conversion_id = ?1 AND profile_id = ?2 AND status = 'pending'",
            params![conversion_id, profile_id],
        )?;
        Ok(())
    }

    /// Mark future retries for a pair as cancelled.
    ///
    /// Leaves a tombstone even when nothing is queued yet, so an attempt that
    /// is still in flight cannot schedule a retry afterwards. Returns true if
    /// a pending retry was cancelled.
    pub fn cancel_retry(&self, conversion_id: i64, profile_id: i64) -> Result<bool, DbError> {
        let now = format_db_time(&Utc::now());
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE retry_queue SET status = 'cancelled', updated_at = ?3 \
             WHERE conversion_id = ?1 AND profile_id = ?2 AND status = 'pending'",
            params![conversion_id, profile_id, now],
        )?;
        if updated == 0 {
            conn.execute(
                "INSERT OR IGNORE INTO retry_queue (conversion_id, profile_id, next_attempt_at, \
                 attempts_made, max_attempts, status, updated_at) \
                 VALUES (?1, ?2, ?3, 0, 0, 'cancelled', ?3)",
                params![conversion_id, profile_id, now],
            )?;
        }
        Ok(updated > 0)
    }

    /// Rebuild missing retry rows from the delivery log.
    ///
    /// Every pair whose latest attempt is `failed_retryable` and that has no
    /// retry row (pending or cancelled) gets one. Returns the number restored.
    pub fn rederive_retries(
        &self,
        now: DateTime<Utc>,
        default_max_attempts: u32,
    ) -> Result<usize, DbError> {
        let conn = self.lock()?;
        let restored = conn.execute(
            "INSERT OR IGNORE INTO retry_queue (conversion_id, profile_id, next_attempt_at, \
             attempts_made, max_attempts, status, updated_at) \
             SELECT a.conversion_id, a.profile_id, COALESCE(a.next_retry_at, ?1), \
                    a.attempt_number, COALESCE(p.max_attempts, ?2), 'pending', ?1 \
             FROM delivery_attempts a \
             JOIN postback_profiles p ON p.id = a.profile_id \
             WHERE a.state = 'failed_retryable' \
               AND a.id = (SELECT MAX(b.id) FROM delivery_attempts b \
                           WHERE b.conversion_id = a.conversion_id \
                             AND b.profile_id = a.profile_id)",
            params![format_db_time(&now), default_max_attempts],
        )?;
        Ok(restored)
    }

    // --- Monitoring snapshots ---

    /// Persist closed monitoring buckets in batch.
    pub fn add_monitoring_snapshots(&self, snapshots: &[MonitoringSnapshot]) -> Result<(), DbError> {
        if snapshots.is_empty() {
            return Ok(());
        }

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO monitoring_snapshots (profile_id, window_start, window_seconds, \
                 successes, failures, skips, hard_blocks, soft_blocks, credential_skips, latency_digest) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(profile_id, window_start, window_seconds) DO UPDATE SET \
                 successes = excluded.successes, failures = excluded.failures, skips = excluded.skips, \
                 hard_blocks = excluded.hard_blocks, soft_blocks = excluded.soft_blocks, \
                 credential_skips = excluded.credential_skips, latency_digest = excluded.latency_digest",
            )?;
            for s in snapshots {
                stmt.execute(params![
                    s.profile_id,
                    format_db_time(&s.window_start),
                    s.window_seconds,
                    s.counters.successes as i64,
                    s.counters.failures as i64,
                    s.counters.skips as i64,
                    s.counters.hard_blocks as i64,
                    s.counters.soft_blocks as i64,
                    s.counters.credential_skips as i64,
                    s.latency_digest,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_monitoring_snapshots(
        &self,
        profile_id: Option<i64>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MonitoringSnapshot>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT profile_id, window_start, window_seconds, successes, failures, skips, \
             hard_blocks, soft_blocks, credential_skips, latency_digest \
             FROM monitoring_snapshots \
             WHERE (?1 IS NULL OR profile_id = ?1) AND window_start >= ?2 AND window_start < ?3 \
             ORDER BY window_start ASC, profile_id ASC",
        )?;
        let snapshots = stmt
            .query_map(
                params![profile_id, format_db_time(&start), format_db_time(&end)],
                |row| {
                    let count = |idx: usize| -> SqlResult<u64> { Ok(row.get::<_, i64>(idx)?.max(0) as u64) };
                    Ok(MonitoringSnapshot {
                        profile_id: row.get(0)?,
                        window_start: time_column(row, 1)?,
                        window_seconds: row.get(2)?,
                        counters: OutcomeCounters {
                            successes: count(3)?,
                            failures: count(4)?,
                            skips: count(5)?,
                            hard_blocks: count(6)?,
                            soft_blocks: count(7)?,
                            credential_skips: count(8)?,
                        },
                        latency_digest: row.get::<_, Option<Vec<u8>>>(9)?.unwrap_or_default(),
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(snapshots)
    }

    // --- Retention ---

    /// Delete delivery log rows written before a cutoff.
    pub fn delete_attempts_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "DELETE FROM delivery_attempts WHERE created_at < ?1",
            params![format_db_time(&cutoff)],
        )?)
    }

    pub fn delete_snapshots_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "DELETE FROM monitoring_snapshots WHERE window_start < ?1",
            params![format_db_time(&cutoff)],
        )?)
    }

    pub fn delete_cancelled_retries_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "DELETE FROM retry_queue WHERE status = 'cancelled' AND updated_at < ?1",
            params![format_db_time(&cutoff)],
        )?)
    }
}

fn row_to_profile(row: &Row<'_>) -> SqlResult<PostbackProfile> {
    Ok(PostbackProfile {
        id: row.get(0)?,
        owner_scope: row.get(1)?,
        owner_id: row.get(2)?,
        scope_type: row.get(3)?,
        scope_id: row.get(4)?,
        name: row.get(5)?,
        tracker: row.get(6)?,
        endpoint_url: row.get(7)?,
        http_method: row.get(8)?,
        params_template: json_column(row, 9)?,
        auth_query_key: row.get(10)?,
        auth_header_name: row.get(11)?,
        status_map: json_column(row, 12)?,
        max_attempts: row.get(13)?,
        is_active: row.get(14)?,
        is_backup: row.get(15)?,
    })
}

fn row_to_attempt(row: &Row<'_>) -> SqlResult<DeliveryAttempt> {
    let next_retry_at: Option<String> = row.get(13)?;
    Ok(DeliveryAttempt {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        conversion_id: row.get(2)?,
        built_url: row.get(3)?,
        http_method: row.get(4)?,
        attempt_number: row.get(5)?,
        response_code: row.get(6)?,
        response_body: row.get(7)?,
        outcome: row.get(8)?,
        state: row.get(9)?,
        skipped_reason: row.get(10)?,
        error_message: row.get(11)?,
        latency_ms: row.get(12)?,
        next_retry_at: next_retry_at.as_deref().and_then(parse_db_time),
        created_at: time_column(row, 14)?,
    })
}

fn row_to_retry(row: &Row<'_>) -> SqlResult<RetryState> {
    Ok(RetryState {
        conversion_id: row.get(0)?,
        profile_id: row.get(1)?,
        next_attempt_at: time_column(row, 2)?,
        attempts_made: row.get(3)?,
        max_attempts: row.get(4)?,
        status: row.get(5)?,
    })
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> SqlResult<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unparseable timestamp: {}", raw).into(),
        )
    })
}

/// Format a timestamp the way every table stores it (sortable as text).
pub fn format_db_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
