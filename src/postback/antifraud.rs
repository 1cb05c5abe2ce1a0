//! Anti-fraud gating of deliveries, evaluated independently per profile.

use crate::db::{AntifraudLevel, ConversionEvent, ConversionStatus, PostbackProfile, SkipReason};

/// Whether a conversion may be delivered to a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Block(SkipReason),
}

/// Apply the anti-fraud policy for one profile.
///
/// - `ok` delivers everywhere.
/// - `hard` (and any unrecognised level) blocks everywhere.
/// - `soft` blocks only `approved` conversions on backup profiles.
pub fn should_deliver(profile: &PostbackProfile, event: &ConversionEvent) -> GateDecision {
    match event.antifraud_level {
        AntifraudLevel::Ok => GateDecision::Allow,
        AntifraudLevel::Hard | AntifraudLevel::Unknown => GateDecision::Block(SkipReason::HardBlock),
        AntifraudLevel::Soft => {
            if profile.is_backup && event.status == ConversionStatus::Approved {
                GateDecision::Block(SkipReason::SoftBlock)
            } else {
                GateDecision::Allow
            }
        }
    }
}
