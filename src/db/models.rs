//! Database model types.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A stored string that does not name any variant of the expected enum.
#[derive(Error, Debug, Clone)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a fieldless enum stored as TEXT and serialized as the same string.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: UnknownVariant| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum!(
    /// Who owns a postback profile.
    OwnerScope {
        Owner => "owner",
        Advertiser => "advertiser",
        Partner => "partner",
    }
);

text_enum!(
    /// Granularity at which a profile applies.
    ScopeType {
        Global => "global",
        Campaign => "campaign",
        Offer => "offer",
        Flow => "flow",
    }
);

text_enum!(
    HttpMethod {
        Get => "GET",
        Post => "POST",
    }
);

impl Default for HttpMethod {
    fn default() -> Self {
        Self::Get
    }
}

text_enum!(
    /// External tracker a profile delivers to.
    TrackerKind {
        Keitaro => "keitaro",
        Binom => "binom",
        Voluum => "voluum",
        Redtrack => "redtrack",
        Custom => "custom",
    }
);

impl Default for TrackerKind {
    fn default() -> Self {
        Self::Custom
    }
}

text_enum!(
    ConversionType {
        Reg => "reg",
        Purchase => "purchase",
    }
);

text_enum!(
    ConversionStatus {
        Initiated => "initiated",
        Pending => "pending",
        Approved => "approved",
        Declined => "declined",
        Refunded => "refunded",
        Chargeback => "chargeback",
    }
);

text_enum!(
    /// Coarse result of one attempt, as shown on dashboards.
    DeliveryOutcome {
        Success => "success",
        Failure => "failure",
        Skipped => "skipped",
    }
);

text_enum!(
    /// Final state an attempt reached in the delivery state machine.
    DeliveryState {
        Success => "success",
        FailedRetryable => "failed_retryable",
        FailedTerminal => "failed_terminal",
        Skipped => "skipped",
    }
);

impl DeliveryState {
    pub fn outcome(&self) -> DeliveryOutcome {
        match self {
            Self::Success => DeliveryOutcome::Success,
            Self::FailedRetryable | Self::FailedTerminal => DeliveryOutcome::Failure,
            Self::Skipped => DeliveryOutcome::Skipped,
        }
    }
}

text_enum!(
    SkipReason {
        HardBlock => "hard_block",
        SoftBlock => "soft_block",
        MissingCredential => "missing_credential",
        InvalidTemplate => "invalid_template",
    }
);

text_enum!(
    RetryStatus {
        Pending => "pending",
        Cancelled => "cancelled",
    }
);

/// Precomputed risk level attached to a conversion.
///
/// Anything other than `ok`, `soft` or `hard` decodes as `Unknown`, which the
/// gate treats like `hard`. So do `null` and a missing field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", rename_all = "lowercase")]
pub enum AntifraudLevel {
    Ok,
    Soft,
    Hard,
    Unknown,
}

impl AntifraudLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Soft => "soft",
            Self::Hard => "hard",
            Self::Unknown => "unknown",
        }
    }
}

impl From<&str> for AntifraudLevel {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "ok" => Self::Ok,
            "soft" => Self::Soft,
            "hard" => Self::Hard,
            _ => Self::Unknown,
        }
    }
}

impl From<Option<String>> for AntifraudLevel {
    fn from(s: Option<String>) -> Self {
        s.as_deref().map_or(Self::Unknown, Self::from)
    }
}

fn unknown_level() -> AntifraudLevel {
    AntifraudLevel::Unknown
}

impl ToSql for AntifraudLevel {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AntifraudLevel {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(Self::from(value.as_str()?))
    }
}

/// Per-type status overrides: conversion type -> internal status -> tracker status.
pub type StatusMap = BTreeMap<ConversionType, BTreeMap<ConversionStatus, String>>;

fn default_true() -> bool {
    true
}

/// A postback destination configured on a dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostbackProfile {
    pub id: i64,
    pub owner_scope: OwnerScope,
    pub owner_id: i64,
    pub scope_type: ScopeType,
    #[serde(default)]
    pub scope_id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub tracker: TrackerKind,
    pub endpoint_url: String,
    #[serde(default)]
    pub http_method: HttpMethod,
    /// Parameter name -> value template.
    #[serde(default)]
    pub params_template: BTreeMap<String, String>,
    #[serde(default)]
    pub auth_query_key: Option<String>,
    #[serde(default)]
    pub auth_header_name: Option<String>,
    #[serde(default)]
    pub status_map: StatusMap,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_backup: bool,
}

impl Default for PostbackProfile {
    fn default() -> Self {
        Self {
            id: 0,
            owner_scope: OwnerScope::Owner,
            owner_id: 0,
            scope_type: ScopeType::Global,
            scope_id: None,
            name: String::new(),
            tracker: TrackerKind::Custom,
            endpoint_url: String::new(),
            http_method: HttpMethod::Get,
            params_template: BTreeMap::new(),
            auth_query_key: None,
            auth_header_name: None,
            status_map: StatusMap::new(),
            max_attempts: None,
            is_active: true,
            is_backup: false,
        }
    }
}

/// A tracked conversion. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionEvent {
    pub id: i64,
    pub clickid: String,
    #[serde(default)]
    pub txid: String,
    #[serde(rename = "type")]
    pub conversion_type: ConversionType,
    pub status: ConversionStatus,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default = "unknown_level")]
    pub antifraud_level: AntifraudLevel,
    #[serde(default)]
    pub owner_id: Option<i64>,
    pub advertiser_id: i64,
    pub partner_id: i64,
    pub offer_id: i64,
    pub campaign_id: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Default for ConversionEvent {
    fn default() -> Self {
        Self {
            id: 0,
            clickid: String::new(),
            txid: String::new(),
            conversion_type: ConversionType::Reg,
            status: ConversionStatus::Pending,
            value: None,
            currency: None,
            antifraud_level: AntifraudLevel::Ok,
            owner_id: None,
            advertiser_id: 0,
            partner_id: 0,
            offer_id: 0,
            campaign_id: 0,
            created_at: Utc::now(),
        }
    }
}

/// One row of the append-only delivery log.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryAttempt {
    pub id: i64,
    pub profile_id: i64,
    pub conversion_id: i64,
    pub built_url: String,
    pub http_method: HttpMethod,
    pub attempt_number: u32,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub outcome: DeliveryOutcome,
    pub state: DeliveryState,
    pub skipped_reason: Option<SkipReason>,
    pub error_message: Option<String>,
    pub latency_ms: Option<i64>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Durable retry bookkeeping for one (conversion, profile) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryState {
    pub conversion_id: i64,
    pub profile_id: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub status: RetryStatus,
}

/// Filter for the delivery log listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeliveryFilter {
    #[serde(default)]
    pub profile_id: Option<i64>,
    #[serde(default)]
    pub conversion_id: Option<i64>,
    #[serde(default)]
    pub outcome: Option<DeliveryOutcome>,
    #[serde(default)]
    pub state: Option<DeliveryState>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// Outcome counters for one monitoring bucket or window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounters {
    pub successes: u64,
    pub failures: u64,
    /// Every skipped attempt, blocks and credential skips included.
    pub skips: u64,
    pub hard_blocks: u64,
    pub soft_blocks: u64,
    pub credential_skips: u64,
}

impl OutcomeCounters {
    pub fn add(&mut self, other: &OutcomeCounters) {
        self.successes += other.successes;
        self.failures += other.failures;
        self.skips += other.skips;
        self.hard_blocks += other.hard_blocks;
        self.soft_blocks += other.soft_blocks;
        self.credential_skips += other.credential_skips;
    }

    pub fn deliveries(&self) -> u64 {
        self.successes + self.failures
    }
}

/// A closed monitoring bucket persisted for history queries.
#[derive(Debug, Clone)]
pub struct MonitoringSnapshot {
    pub profile_id: i64,
    pub window_start: DateTime<Utc>,
    pub window_seconds: i64,
    pub counters: OutcomeCounters,
    pub latency_digest: Vec<u8>,
}
