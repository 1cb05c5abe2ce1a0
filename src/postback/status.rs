//! Translation of internal conversion statuses into tracker vocabulary.

use crate::db::{ConversionStatus, ConversionType, StatusMap};

/// Tracker-neutral status a conversion is reported as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalStatus {
    Lead,
    Sale,
    Reject,
    Refund,
    Chargeback,
}

/// Words a tracker uses for each external status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusVocabulary {
    pub lead: &'static str,
    pub sale: &'static str,
    pub reject: &'static str,
    pub refund: &'static str,
    pub chargeback: &'static str,
}

impl StatusVocabulary {
    pub const fn standard() -> Self {
        Self {
            lead: "lead",
            sale: "sale",
            reject: "reject",
            refund: "refund",
            chargeback: "chargeback",
        }
    }

    pub fn word(&self, status: ExternalStatus) -> &'static str {
        match status {
            ExternalStatus::Lead => self.lead,
            ExternalStatus::Sale => self.sale,
            ExternalStatus::Reject => self.reject,
            ExternalStatus::Refund => self.refund,
            ExternalStatus::Chargeback => self.chargeback,
        }
    }
}

/// The default table shared by every adapter.
pub fn default_status(conversion_type: ConversionType, status: ConversionStatus) -> ExternalStatus {
    use ConversionStatus::*;

    match (conversion_type, status) {
        (ConversionType::Reg, Initiated | Pending | Approved) => ExternalStatus::Lead,
        (ConversionType::Reg, Declined | Refunded | Chargeback) => ExternalStatus::Reject,
        (ConversionType::Purchase, Initiated | Pending | Approved) => ExternalStatus::Sale,
        (ConversionType::Purchase, Declined) => ExternalStatus::Reject,
        (ConversionType::Purchase, Refunded) => ExternalStatus::Refund,
        (ConversionType::Purchase, Chargeback) => ExternalStatus::Chargeback,
    }
}

/// Map an internal (type, status) pair to the word sent to the tracker.
///
/// A profile entry for the conversion type replaces the default table for
/// that type. Pairs missing from the table in force map to `reject`.
pub fn map_status(
    profile_map: &StatusMap,
    vocabulary: &StatusVocabulary,
    conversion_type: ConversionType,
    status: ConversionStatus,
) -> String {
    match profile_map.get(&conversion_type) {
        Some(table) => table
            .get(&status)
            .cloned()
            .unwrap_or_else(|| vocabulary.reject.to_string()),
        None => vocabulary
            .word(default_status(conversion_type, status))
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const ALL_STATUSES: [ConversionStatus; 6] = [
        ConversionStatus::Initiated,
        ConversionStatus::Pending,
        ConversionStatus::Approved,
        ConversionStatus::Declined,
        ConversionStatus::Refunded,
        ConversionStatus::Chargeback,
    ];

    fn mapped(t: ConversionType, s: ConversionStatus) -> String {
        map_status(&StatusMap::new(), &StatusVocabulary::standard(), t, s)
    }

    #[test]
    fn test_reg_table() {
        let expected = ["lead", "lead", "lead", "reject", "reject", "reject"];
        for (status, want) in ALL_STATUSES.iter().zip(expected) {
            assert_eq!(mapped(ConversionType::Reg, *status), want, "reg/{}", status);
        }
    }

    #[test]
    fn test_purchase_table() {
        let expected = ["sale", "sale", "sale", "reject", "refund", "chargeback"];
        for (status, want) in ALL_STATUSES.iter().zip(expected) {
            assert_eq!(mapped(ConversionType::Purchase, *status), want, "purchase/{}", status);
        }
    }

    #[test]
    fn test_profile_table_replaces_default_and_fails_closed() {
        let mut profile_map = StatusMap::new();
        profile_map.insert(
            ConversionType::Purchase,
            BTreeMap::from([(ConversionStatus::Approved, "confirmed".to_string())]),
        );
        let vocab = StatusVocabulary {
            reject: "rejected",
            ..StatusVocabulary::standard()
        };

        let map = |s| map_status(&profile_map, &vocab, ConversionType::Purchase, s);
        assert_eq!(map(ConversionStatus::Approved), "confirmed");
        // Absent from the profile table: fail closed instead of counting revenue.
        assert_eq!(map(ConversionStatus::Pending), "rejected");
        assert_eq!(map(ConversionStatus::Refunded), "rejected");

        // Types without a profile entry keep the default table.
        assert_eq!(
            map_status(&profile_map, &vocab, ConversionType::Reg, ConversionStatus::Approved),
            "lead"
        );
    }
}
