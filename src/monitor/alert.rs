//! Alert events handed to the external notification service.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    PostbackFailed,
    PostbackSuccessRateLow,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub profile_id: i64,
    pub details: serde_json::Value,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, profile_id: i64, details: serde_json::Value) -> Self {
        Self {
            kind,
            profile_id,
            details,
            raised_at: Utc::now(),
        }
    }
}
