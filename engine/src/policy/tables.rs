//! Authoritative in-memory learning tables.
//!
//! One `DashMap` row per state key. Mutations go through the row's entry
//! lock, so at most one writer touches a given key's values at a time while
//! distinct keys update in parallel.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shared_types::{Tactic, POLICY_CATALOGUE};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanditCounts {
    pub successes: u64,
    pub failures: u64,
}

impl BanditCounts {
    pub fn alpha(&self) -> f64 {
        1.0 + self.successes as f64
    }

    pub fn beta(&self) -> f64 {
        1.0 + self.failures as f64
    }
}

/// Serializable copy of both tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningSnapshot {
    pub q_table: BTreeMap<String, BTreeMap<Tactic, f64>>,
    pub bandit_stats: BTreeMap<String, BTreeMap<Tactic, BanditCounts>>,
}

type QRow = BTreeMap<Tactic, f64>;
type BanditRow = BTreeMap<Tactic, BanditCounts>;

#[derive(Debug, Default)]
pub struct LearningTables {
    q: DashMap<String, QRow>,
    bandit: DashMap<String, BanditRow>,
}

fn zero_row() -> QRow {
    POLICY_CATALOGUE.iter().map(|t| (*t, 0.0)).collect()
}

impl LearningTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LearningSnapshot) -> Self {
        let tables = Self::new();
        for (key, row) in snapshot.q_table {
            let mut full = zero_row();
            full.extend(row.into_iter().filter(|(t, v)| t.is_learnable() && v.is_finite()));
            tables.q.insert(key, full);
        }
        for (key, row) in snapshot.bandit_stats {
            let row: BanditRow = row.into_iter().filter(|(t, _)| t.is_learnable()).collect();
            tables.bandit.insert(key, row);
        }
        tables
    }

    pub fn snapshot(&self) -> LearningSnapshot {
        LearningSnapshot {
            q_table: self
                .q
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            bandit_stats: self
                .bandit
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }

    /// Q-values for every catalogue action; unseen keys read as zero.
    pub fn q_row(&self, state_key: &str) -> QRow {
        self.q
            .get(state_key)
            .map(|row| row.value().clone())
            .unwrap_or_else(zero_row)
    }

    pub fn q_value(&self, state_key: &str, action: Tactic) -> f64 {
        self.q
            .get(state_key)
            .and_then(|row| row.get(&action).copied())
            .unwrap_or(0.0)
    }

    pub fn max_q(&self, state_key: &str) -> f64 {
        self.q_row(state_key)
            .values()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Apply `update` to one Q-value under the row's exclusive lock.
    pub fn update_q_with<F>(&self, state_key: &str, action: Tactic, update: F) -> f64
    where
        F: FnOnce(f64) -> f64,
    {
        let mut row = self
            .q
            .entry(state_key.to_string())
            .or_insert_with(zero_row);
        let slot = row.entry(action).or_insert(0.0);
        *slot = update(*slot);
        *slot
    }

    pub fn bandit_counts(&self, state_key: &str, action: Tactic) -> BanditCounts {
        self.bandit
            .get(state_key)
            .and_then(|row| row.get(&action).copied())
            .unwrap_or_default()
    }

    pub fn bandit_row(&self, state_key: &str) -> BanditRow {
        let stored = self
            .bandit
            .get(state_key)
            .map(|row| row.value().clone())
            .unwrap_or_default();
        POLICY_CATALOGUE
            .iter()
            .map(|t| (*t, stored.get(t).copied().unwrap_or_default()))
            .collect()
    }

    pub fn record_outcome(&self, state_key: &str, action: Tactic, success: bool) -> BanditCounts {
        let mut row = self.bandit.entry(state_key.to_string()).or_default();
        let counts = row.entry(action).or_default();
        if success {
            counts.successes += 1;
        } else {
            counts.failures += 1;
        }
        *counts
    }

    /// Overwrite one counter pair, used when replaying durable feedback.
    pub fn set_counts(&self, state_key: &str, action: Tactic, counts: BanditCounts) {
        self.bandit
            .entry(state_key.to_string())
            .or_default()
            .insert(action, counts);
    }

    pub fn state_keys(&self) -> usize {
        self.q.len().max(self.bandit.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unseen_key_reads_zero_for_every_action() {
        let tables = LearningTables::new();
        let row = tables.q_row("EARLY_LOW_GENERIC");
        assert_eq!(row.len(), POLICY_CATALOGUE.len());
        assert!(row.values().all(|v| *v == 0.0));
        assert_eq!(tables.max_q("EARLY_LOW_GENERIC"), 0.0);
    }

    #[test]
    fn test_snapshot_drops_override_tactics() {
        let mut snapshot = LearningSnapshot::default();
        snapshot.q_table.insert(
            "K".into(),
            [(Tactic::FastReflex, 3.0), (Tactic::BaitForIntel, 1.5)]
                .into_iter()
                .collect(),
        );
        let tables = LearningTables::from_snapshot(snapshot);
        let row = tables.q_row("K");
        assert!(!row.contains_key(&Tactic::FastReflex));
        assert_eq!(row[&Tactic::BaitForIntel], 1.5);
    }

    #[test]
    fn test_record_outcome_counts() {
        let tables = LearningTables::new();
        tables.record_outcome("K", Tactic::NormalChat, true);
        tables.record_outcome("K", Tactic::NormalChat, false);
        let counts = tables.record_outcome("K", Tactic::NormalChat, true);
        assert_eq!(counts, BanditCounts { successes: 2, failures: 1 });
        assert_eq!(tables.bandit_counts("K", Tactic::StallConfusion), BanditCounts::default());
    }
}
