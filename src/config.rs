//! Configuration for the postback relay.
//!
//! Loads configuration from environment variables with sensible defaults,
//! and imports postback profiles from a JSON file.

use crate::db::{DbError, PostbackProfile, ScopeType, Store, TrackerKind};
use crate::delivery::{DispatcherConfig, RetryPolicy};
use crate::monitor::MonitorConfig;
use crate::postback::TrackerCredentials;

use reqwest::Url;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const MIN_REQUEST_TIMEOUT_SECS: u64 = 5;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid profiles file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("profile {id}: {reason}")]
    InvalidProfile { id: i64, reason: String },
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "postback.db")
    pub db_path: String,
    /// JSON array of profiles imported at startup
    pub profiles_path: Option<String>,
    pub workers: usize,
    /// Clamped to 5..=10 seconds
    pub request_timeout: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub retry_max_attempts: u32,
    pub monitor_window: Duration,
    pub monitor_bucket: Duration,
    pub success_rate_threshold: f64,
    pub min_samples: u64,
    pub failure_spike: u64,
    pub log_retention_days: i64,
    pub credentials: TrackerCredentials,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "postback.db".to_string(),
            profiles_path: None,
            workers: 16,
            request_timeout: Duration::from_secs(MAX_REQUEST_TIMEOUT_SECS),
            retry_base: Duration::from_secs(30),
            retry_max: Duration::from_secs(1800),
            retry_max_attempts: 5,
            monitor_window: Duration::from_secs(3600),
            monitor_bucket: Duration::from_secs(300),
            success_rate_threshold: 0.9,
            min_samples: 10,
            failure_spike: 50,
            log_retention_days: 30,
            credentials: TrackerCredentials::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Unparseable values fall back to the default.
    pub fn load() -> Self {
        Self::load_from(|key| env::var(key).ok())
    }

    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(port) = lookup("POSTBACK_HTTP_PORT").and_then(|v| v.trim().parse().ok()) {
            cfg.http_port = port;
        }
        if let Some(db_path) = lookup("POSTBACK_DB_PATH") {
            cfg.db_path = db_path;
        }
        cfg.profiles_path = lookup("POSTBACK_PROFILES_PATH").filter(|p| !p.trim().is_empty());

        if let Some(workers) = parsed("POSTBACK_WORKERS").filter(|w| *w > 0) {
            cfg.workers = workers as usize;
        }
        if let Some(secs) = parsed("POSTBACK_REQUEST_TIMEOUT_SECS") {
            cfg.request_timeout =
                Duration::from_secs(secs.clamp(MIN_REQUEST_TIMEOUT_SECS, MAX_REQUEST_TIMEOUT_SECS));
        }
        if let Some(secs) = parsed("POSTBACK_RETRY_BASE_SECS").filter(|s| *s > 0) {
            cfg.retry_base = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed("POSTBACK_RETRY_MAX_SECS").filter(|s| *s > 0) {
            cfg.retry_max = Duration::from_secs(secs);
        }
        if let Some(n) = parsed("POSTBACK_RETRY_MAX_ATTEMPTS").filter(|n| *n > 0) {
            cfg.retry_max_attempts = n.min(u32::MAX as u64) as u32;
        }
        if let Some(secs) = parsed("POSTBACK_MONITOR_WINDOW_SECS").filter(|s| *s > 0) {
            cfg.monitor_window = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed("POSTBACK_MONITOR_BUCKET_SECS").filter(|s| *s > 0) {
            cfg.monitor_bucket = Duration::from_secs(secs);
        }
        if let Some(t) = lookup("POSTBACK_SUCCESS_RATE_THRESHOLD")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|t| (0.0..=1.0).contains(t))
        {
            cfg.success_rate_threshold = t;
        }
        if let Some(n) = parsed("POSTBACK_MIN_SAMPLES") {
            cfg.min_samples = n;
        }
        if let Some(n) = parsed("POSTBACK_FAILURE_SPIKE").filter(|n| *n > 0) {
            cfg.failure_spike = n;
        }
        if let Some(days) = parsed("POSTBACK_LOG_RETENTION_DAYS").filter(|d| *d > 0) {
            cfg.log_retention_days = days as i64;
        }

        let tracker_keys = [
            (TrackerKind::Keitaro, "POSTBACK_KEITARO_API_KEY"),
            (TrackerKind::Binom, "POSTBACK_BINOM_API_KEY"),
            (TrackerKind::Voluum, "POSTBACK_VOLUUM_API_KEY"),
            (TrackerKind::Redtrack, "POSTBACK_REDTRACK_API_KEY"),
            (TrackerKind::Custom, "POSTBACK_CUSTOM_API_KEY"),
        ];
        for (kind, key) in tracker_keys {
            if let Some(secret) = lookup(key) {
                cfg.credentials = cfg.credentials.with(kind, secret);
            }
        }

        cfg
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.workers,
            request_timeout: self.request_timeout,
            retry: RetryPolicy {
                base_delay: self.retry_base,
                max_delay: self.retry_max.max(self.retry_base),
                max_attempts: self.retry_max_attempts,
            },
            ..Default::default()
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            window: self.monitor_window,
            bucket: self.monitor_bucket.min(self.monitor_window),
            success_rate_threshold: self.success_rate_threshold,
            min_samples: self.min_samples,
            failure_spike: self.failure_spike,
        }
    }
}

/// Check a profile before it is stored.
pub fn validate_profile(profile: &PostbackProfile) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidProfile {
        id: profile.id,
        reason: reason.to_string(),
    };

    if profile.id <= 0 {
        return Err(invalid("id must be positive"));
    }
    match (profile.scope_type, profile.scope_id) {
        (ScopeType::Global, Some(_)) => return Err(invalid("global profiles take no scope_id")),
        (ScopeType::Global, None) => {}
        (_, None) => return Err(invalid("scoped profiles need a scope_id")),
        (_, Some(_)) => {}
    }
    if profile.max_attempts == Some(0) {
        return Err(invalid("max_attempts must be at least 1"));
    }

    // Macros may sit in the host; only the scheme has to be fixed.
    let scheme_ok = Url::parse(&profile.endpoint_url)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
        || profile.endpoint_url.starts_with("http://")
        || profile.endpoint_url.starts_with("https://");
    if !scheme_ok {
        return Err(invalid("endpoint_url must be an http(s) URL"));
    }

    Ok(())
}

/// Read a JSON array of profiles.
pub fn load_profiles<P: AsRef<Path>>(path: P) -> Result<Vec<PostbackProfile>, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Upsert every valid profile from `path` into the store.
///
/// Invalid profiles are logged and skipped. Returns the number imported.
pub fn import_profiles<P: AsRef<Path>>(store: &Store, path: P) -> Result<usize, ConfigError> {
    let profiles = load_profiles(path)?;
    let mut imported = 0;

    for profile in &profiles {
        if let Err(e) = validate_profile(profile) {
            tracing::warn!("Skipping profile: {}", e);
            continue;
        }
        store.upsert_profile(profile)?;
        imported += 1;
    }

    tracing::info!("Imported {} of {} profiles", imported, profiles.len());
    Ok(imported)
}
