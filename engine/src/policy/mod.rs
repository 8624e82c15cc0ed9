//! Hybrid tactic policy: tabular Q-learning plus a Thompson-sampling bandit.
//!
//! Tables are shared by every session whose situation maps to the same
//! [`StateKey`]. Q-values live in memory and are checkpointed periodically;
//! bandit feedback is written through to the repository before
//! [`TacticPolicy::record_feedback`] returns.

pub mod beta;
pub mod repository;
pub mod state_key;
pub mod tables;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared_types::{Tactic, POLICY_CATALOGUE};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

pub use repository::{
    FeedbackEntry, InMemoryLearningRepository, JsonLearningRepository, LearningRepository,
    SharedLearningRepository,
};
pub use state_key::{StateKey, ThreatLevel, TurnPhase};
pub use tables::{BanditCounts, LearningSnapshot, LearningTables};

use crate::error::EngineError;

pub const LEARNING_RATE: f64 = 0.1;
pub const DISCOUNT: f64 = 0.9;
pub const EXPLORATION_RATE: f64 = 0.1;
/// Weight of the sigmoid(Q) nudge added to each Thompson sample.
pub const Q_NUDGE_WEIGHT: f64 = 0.2;
/// Rewards strictly above this count as bandit successes.
pub const SUCCESS_THRESHOLD: f64 = 5.0;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Outcome of one selection call.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyChoice {
    pub tactic: Tactic,
    /// Winning combined score (hybrid) or Q-value (epsilon-greedy).
    pub score: f64,
    pub q_value: f64,
    pub explored: bool,
}

impl PolicyChoice {
    /// Rough [0, 1] confidence for the decision record.
    pub fn confidence(&self) -> f64 {
        if self.explored {
            0.3
        } else {
            (self.score / (1.0 + Q_NUDGE_WEIGHT)).clamp(0.0, 1.0)
        }
    }
}

pub struct TacticPolicy {
    tables: LearningTables,
    repository: SharedLearningRepository,
    rng: Mutex<StdRng>,
    // Feedback writers share the lock; a checkpoint takes it exclusively so
    // the snapshot it stores covers every write-through it truncates.
    checkpoint_gate: RwLock<()>,
}

pub type SharedTacticPolicy = Arc<TacticPolicy>;

impl TacticPolicy {
    /// Load tables from `repository`. An unreadable store starts empty.
    pub async fn load(repository: SharedLearningRepository) -> Self {
        let snapshot = match repository.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "Learning tables unreadable; starting empty");
                LearningSnapshot::default()
            }
        };
        tracing::info!(
            q_keys = snapshot.q_table.len(),
            bandit_keys = snapshot.bandit_stats.len(),
            "Learning tables loaded"
        );
        Self::with_parts(
            LearningTables::from_snapshot(snapshot),
            repository,
            StdRng::from_os_rng(),
        )
    }

    pub fn with_parts(
        tables: LearningTables,
        repository: SharedLearningRepository,
        rng: StdRng,
    ) -> Self {
        Self {
            tables,
            repository,
            rng: Mutex::new(rng),
            checkpoint_gate: RwLock::new(()),
        }
    }

    /// Empty tables over an in-memory repository with a fixed seed.
    pub fn seeded(seed: u64) -> Self {
        Self::with_parts(
            LearningTables::new(),
            Arc::new(InMemoryLearningRepository::new()),
            StdRng::seed_from_u64(seed),
        )
    }

    pub fn tables(&self) -> &LearningTables {
        &self.tables
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Thompson sample per catalogue action plus a bounded Q nudge; highest
    /// combined score wins.
    pub fn select_hybrid(&self, state_key: &StateKey) -> PolicyChoice {
        let q_row = self.tables.q_row(state_key.as_str());
        let bandit_row = self.tables.bandit_row(state_key.as_str());

        self.with_rng(|rng| {
            let mut best: Option<PolicyChoice> = None;
            for tactic in POLICY_CATALOGUE {
                let counts = bandit_row.get(&tactic).copied().unwrap_or_default();
                let q_value = q_row.get(&tactic).copied().unwrap_or(0.0);
                let sample = beta::sample_beta(rng, counts.alpha(), counts.beta());
                let score = sample + Q_NUDGE_WEIGHT * sigmoid(q_value);
                if best.as_ref().map(|b| score > b.score).unwrap_or(true) {
                    best = Some(PolicyChoice {
                        tactic,
                        score,
                        q_value,
                        explored: false,
                    });
                }
            }
            best.unwrap_or(PolicyChoice {
                tactic: Tactic::NormalChat,
                score: 0.0,
                q_value: 0.0,
                explored: false,
            })
        })
    }

    /// Random action with probability ε, otherwise arg-max Q (first in
    /// catalogue order on ties). Reads the same table as the hybrid path.
    pub fn select_epsilon_greedy(&self, state_key: &StateKey) -> PolicyChoice {
        let q_row = self.tables.q_row(state_key.as_str());
        self.with_rng(|rng| {
            if rng.random::<f64>() < EXPLORATION_RATE {
                let tactic = POLICY_CATALOGUE[rng.random_range(0..POLICY_CATALOGUE.len())];
                let q_value = q_row.get(&tactic).copied().unwrap_or(0.0);
                return PolicyChoice {
                    tactic,
                    score: q_value,
                    q_value,
                    explored: true,
                };
            }
            let mut best = (Tactic::NormalChat, f64::NEG_INFINITY);
            for tactic in POLICY_CATALOGUE {
                let q = q_row.get(&tactic).copied().unwrap_or(0.0);
                if q > best.1 {
                    best = (tactic, q);
                }
            }
            PolicyChoice {
                tactic: best.0,
                score: best.1,
                q_value: best.1,
                explored: false,
            }
        })
    }

    // ========================================================================
    // Learning
    // ========================================================================

    /// `Q(s,a) += α·(r + γ·max_a' Q(s',a') − Q(s,a))`. Returns the new value.
    /// Non-catalogue actions are ignored.
    pub fn update_q(
        &self,
        state: &StateKey,
        action: Tactic,
        reward: f64,
        next_state: &StateKey,
    ) -> Option<f64> {
        if !action.is_learnable() || !reward.is_finite() {
            return None;
        }
        // Read s' before locking s; when s == s' the same row would deadlock.
        let next_max = self.tables.max_q(next_state.as_str());
        let updated = self.tables.update_q_with(state.as_str(), action, |current| {
            current + LEARNING_RATE * (reward + DISCOUNT * next_max - current)
        });
        tracing::debug!(
            state_key = %state,
            tactic = %action,
            reward,
            q_value = updated,
            "Q-value updated"
        );
        Some(updated)
    }

    /// Count the outcome as a success when `reward > SUCCESS_THRESHOLD` and
    /// make the counters durable before returning.
    pub async fn record_feedback(
        &self,
        state: &StateKey,
        action: Tactic,
        reward: f64,
    ) -> Result<BanditCounts, EngineError> {
        if !action.is_learnable() {
            return Ok(self.tables.bandit_counts(state.as_str(), action));
        }
        let _gate = self.checkpoint_gate.read().await;
        let counts = self
            .tables
            .record_outcome(state.as_str(), action, reward > SUCCESS_THRESHOLD);
        self.repository
            .store_feedback(&FeedbackEntry {
                state_key: state.as_str().to_string(),
                action,
                counts,
            })
            .await?;
        Ok(counts)
    }

    // ========================================================================
    // Checkpointing
    // ========================================================================

    pub async fn checkpoint(&self) -> Result<(), EngineError> {
        let _gate = self.checkpoint_gate.write().await;
        let snapshot = self.tables.snapshot();
        self.repository.store_snapshot(&snapshot).await?;
        tracing::debug!(
            q_keys = snapshot.q_table.len(),
            bandit_keys = snapshot.bandit_stats.len(),
            "Learning tables checkpointed"
        );
        Ok(())
    }
}

/// Checkpoint `policy` every `interval` until the task is aborted.
pub async fn run_checkpoint_loop(policy: SharedTacticPolicy, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // skip the immediate first tick
    loop {
        ticker.tick().await;
        if let Err(e) = policy.checkpoint().await {
            tracing::error!(error = %e, "Learning checkpoint failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_q_update_matches_formula() {
        let policy = TacticPolicy::seeded(1);
        let s = StateKey::from("EARLY_LOW_GENERIC");
        let s_next = StateKey::from("MID_LOW_GENERIC");
        policy
            .tables()
            .update_q_with(s_next.as_str(), Tactic::StallConfusion, |_| 2.0);

        let q = policy.update_q(&s, Tactic::BaitForIntel, 1.0, &s_next).unwrap();
        // 0 + 0.1 * (1 + 0.9 * 2 - 0)
        assert!((q - 0.28).abs() < 1e-12);
    }

    #[test]
    fn test_override_tactics_are_not_learned() {
        let policy = TacticPolicy::seeded(1);
        let s = StateKey::from("K");
        assert_eq!(policy.update_q(&s, Tactic::FastReflex, 10.0, &s), None);
        assert!(!policy.tables().q_row("K").contains_key(&Tactic::FastReflex));
    }

    #[test]
    fn test_epsilon_greedy_prefers_highest_q() {
        let policy = TacticPolicy::seeded(3);
        let s = StateKey::from("K");
        policy
            .tables()
            .update_q_with("K", Tactic::DeployFakeProof, |_| 4.0);
        let greedy = (0..500)
            .map(|_| policy.select_epsilon_greedy(&s))
            .filter(|c| c.tactic == Tactic::DeployFakeProof)
            .count();
        // ε = 0.1 over six actions: expect ~91.7% greedy hits.
        assert!(greedy > 420, "greedy picks: {greedy}");
    }

    #[test]
    fn test_hybrid_only_selects_catalogue_actions() {
        let policy = TacticPolicy::seeded(5);
        let s = StateKey::from("K");
        for _ in 0..200 {
            assert!(policy.select_hybrid(&s).tactic.is_learnable());
        }
    }

    #[tokio::test]
    async fn test_feedback_threshold_and_write_through() {
        let repo = Arc::new(InMemoryLearningRepository::new());
        let policy = TacticPolicy::with_parts(
            LearningTables::new(),
            repo.clone(),
            StdRng::seed_from_u64(9),
        );
        let s = StateKey::from("K");

        policy.record_feedback(&s, Tactic::BaitForIntel, 10.5).await.unwrap();
        let counts = policy
            .record_feedback(&s, Tactic::BaitForIntel, 5.0)
            .await
            .unwrap();
        assert_eq!(counts, BanditCounts { successes: 1, failures: 1 });

        let entries = repo.feedback_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].counts, counts);

        policy.checkpoint().await.unwrap();
        assert!(repo.feedback_entries().is_empty());
        assert_eq!(
            repo.stored_snapshot().bandit_stats["K"][&Tactic::BaitForIntel],
            counts
        );
    }
}
