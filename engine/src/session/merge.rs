//! Merge-on-write law for durable session records.
//!
//! - `extracted_data` is unioned per category.
//! - Every other field takes the incoming value.
//! - An incoming record older than the stored one is rejected unchanged.

use shared_types::SessionRecord;

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Record that should now be stored.
    Merged(SessionRecord),
    /// Incoming `updated_at` predates the stored record; nothing to write.
    Stale,
}

pub fn merge_records(existing: Option<&SessionRecord>, incoming: &SessionRecord) -> MergeOutcome {
    let Some(existing) = existing else {
        return MergeOutcome::Merged(incoming.clone());
    };
    if incoming.updated_at < existing.updated_at {
        return MergeOutcome::Stale;
    }

    let mut merged = incoming.clone();
    merged.extracted_data.merge(&existing.extracted_data);
    MergeOutcome::Merged(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use shared_types::{IntelCategory, Tactic};

    fn record(values: &[(IntelCategory, &str)], scam_score: f64) -> SessionRecord {
        let mut record = SessionRecord::new("S1", Utc::now());
        for (category, value) in values {
            record.extracted_data.insert(*category, *value);
        }
        record.scam_score = scam_score;
        record
    }

    #[test]
    fn test_union_lists_and_take_incoming_scalars() {
        let a = record(&[(IntelCategory::UpiIds, "a@ybl")], 40.0);
        let mut b = record(
            &[
                (IntelCategory::UpiIds, "b@paytm"),
                (IntelCategory::Urls, "http://x.test/pay"),
            ],
            75.0,
        );
        b.updated_at = a.updated_at + Duration::seconds(1);
        b.current_tactic = Some(Tactic::BaitForIntel);

        let MergeOutcome::Merged(merged) = merge_records(Some(&a), &b) else {
            panic!("expected merge");
        };
        let upis: Vec<_> = merged.extracted_data.values(IntelCategory::UpiIds).collect();
        assert_eq!(upis, vec!["a@ybl", "b@paytm"]);
        assert_eq!(merged.scam_score, 75.0);
        assert_eq!(merged.current_tactic, Some(Tactic::BaitForIntel));
    }

    #[test]
    fn test_stale_incoming_is_rejected() {
        let stored = record(&[], 10.0);
        let mut older = record(&[(IntelCategory::PhoneNumbers, "9876543210")], 90.0);
        older.updated_at = stored.updated_at - Duration::seconds(5);
        assert_eq!(merge_records(Some(&stored), &older), MergeOutcome::Stale);
    }

    #[test]
    fn test_merge_with_self_is_identity() {
        let a = record(&[(IntelCategory::IfscCodes, "sbin0001234")], 55.0);
        assert_eq!(merge_records(Some(&a), &a), MergeOutcome::Merged(a.clone()));
    }
}
