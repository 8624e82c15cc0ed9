//! Zero-sum payoff game between the engine and the counterpart.
//!
//! Rows are engine moves ([`GameMove`]), columns are counterpart responses
//! ([`Response`]). The matrix is perturbed per turn by aggression and
//! intel ratio, solved as an LP for the row player's optimal mixed strategy,
//! and one row is *sampled* from it. The result is advisory: it is logged
//! beside the policy's choice and never replaces it.

use rand::Rng;
use shared_types::{GameMove, PayoffSignal, Tactic};
use std::time::Duration;

use crate::error::EngineError;

pub const PAYOFF_BOUND: f64 = 12.0;
/// Confirmed intel count that saturates the intel ratio.
pub const INTEL_RATIO_CAP: f64 = 10.0;

pub const GAME_MOVES: [GameMove; 4] = [
    GameMove::Stall,
    GameMove::Bait,
    GameMove::Threaten,
    GameMove::Comply,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Push,
    Leave,
    Negotiate,
    Ghost,
}

pub type PayoffMatrix = [[f64; 4]; 4];

pub const BASE_MATRIX: PayoffMatrix = [
    // Push  Leave  Negotiate  Ghost
    [4.0, 8.0, 2.0, 10.0],    // Stall
    [6.0, 1.0, 5.0, -2.0],    // Bait
    [-3.0, -8.0, -1.0, 12.0], // Threaten
    [-1.0, 3.0, 1.5, 0.0],    // Comply
];

pub fn aggression(patience: f64) -> f64 {
    ((100.0 - patience) / 100.0).clamp(0.0, 1.0)
}

pub fn intel_ratio(confirmed_intel: usize) -> f64 {
    (confirmed_intel as f64 / INTEL_RATIO_CAP).min(1.0)
}

/// Base matrix with per-turn perturbations, clamped to ±[`PAYOFF_BOUND`].
pub fn payoff_matrix(aggression: f64, intel_ratio: f64) -> PayoffMatrix {
    let mut matrix = BASE_MATRIX;
    if aggression > 0.75 {
        // Baiting an angry counterpart backfires; stalling and firmness pay.
        for cell in matrix[1].iter_mut() {
            *cell -= 3.5;
        }
        for cell in matrix[0].iter_mut() {
            *cell += 2.0;
        }
        matrix[2][0] += 4.0;
    }
    if intel_ratio > 0.65 {
        // Most of the obtainable intel is already in hand.
        for cell in matrix[1].iter_mut() {
            *cell -= 2.5;
        }
    }
    for row in matrix.iter_mut() {
        for cell in row.iter_mut() {
            *cell = cell.clamp(-PAYOFF_BOUND, PAYOFF_BOUND);
        }
    }
    matrix
}

#[derive(Debug, Clone, PartialEq)]
pub struct MixedStrategy {
    pub probabilities: [f64; 4],
    pub value: f64,
}

const EPS: f64 = 1e-9;
const MAX_PIVOTS: usize = 64;

/// Row player's optimal mixed strategy: max v s.t. Aᵀx ≥ v·1, Σx = 1, x ≥ 0.
///
/// Shifts the matrix positive, then solves the column player's dual
/// `max Σw s.t. A'w ≤ 1, w ≥ 0` with a dense tableau simplex (Bland's rule).
/// The row strategy is read off the slack columns' reduced costs.
pub fn solve_zero_sum(matrix: &PayoffMatrix) -> Result<MixedStrategy, EngineError> {
    const M: usize = 4;
    const N: usize = 4;
    if matrix.iter().flatten().any(|v| !v.is_finite()) {
        return Err(EngineError::Solver("non-finite payoff".into()));
    }
    let min = matrix
        .iter()
        .flat_map(|row| row.iter().copied())
        .fold(f64::INFINITY, f64::min);
    let shift = 1.0 - min.min(0.0);

    // Rows 0..M: constraints; row M: objective. Columns: w (N), slack (M), rhs.
    let width = N + M + 1;
    let mut tableau = vec![vec![0.0; width]; M + 1];
    let mut basis: Vec<usize> = (N..N + M).collect();
    for i in 0..M {
        for j in 0..N {
            tableau[i][j] = matrix[i][j] + shift;
        }
        tableau[i][N + i] = 1.0;
        tableau[i][width - 1] = 1.0;
    }
    for j in 0..N {
        tableau[M][j] = -1.0;
    }

    let mut converged = false;
    for _ in 0..MAX_PIVOTS {
        let Some(entering) = (0..N + M).find(|&j| tableau[M][j] < -EPS) else {
            converged = true;
            break;
        };

        let mut leaving: Option<(usize, f64)> = None;
        for i in 0..M {
            let coeff = tableau[i][entering];
            if coeff > EPS {
                let ratio = tableau[i][width - 1] / coeff;
                let better = match leaving {
                    None => true,
                    Some((best_i, best_ratio)) => {
                        ratio < best_ratio - EPS
                            || ((ratio - best_ratio).abs() <= EPS && basis[i] < basis[best_i])
                    }
                };
                if better {
                    leaving = Some((i, ratio));
                }
            }
        }
        let Some((pivot_row, _)) = leaving else {
            return Err(EngineError::Solver("unbounded program".into()));
        };

        let pivot = tableau[pivot_row][entering];
        for cell in tableau[pivot_row].iter_mut() {
            *cell /= pivot;
        }
        for i in 0..=M {
            if i == pivot_row {
                continue;
            }
            let factor = tableau[i][entering];
            if factor.abs() > EPS {
                for j in 0..width {
                    tableau[i][j] -= factor * tableau[pivot_row][j];
                }
            }
        }
        basis[pivot_row] = entering;
    }
    if !converged {
        return Err(EngineError::Solver(format!(
            "no optimum after {MAX_PIVOTS} pivots"
        )));
    }

    let total = tableau[M][width - 1];
    if total <= EPS {
        return Err(EngineError::Solver("degenerate game value".into()));
    }
    let mut probabilities = [0.0; 4];
    for (i, p) in probabilities.iter_mut().enumerate() {
        *p = (tableau[M][N + i] / total).max(0.0);
    }
    let mass: f64 = probabilities.iter().sum();
    if mass <= EPS {
        return Err(EngineError::Solver("empty mixed strategy".into()));
    }
    for p in probabilities.iter_mut() {
        *p /= mass;
    }

    Ok(MixedStrategy {
        probabilities,
        value: 1.0 / total - shift,
    })
}

/// Row with the best worst case, and that worst case.
pub fn maximin(matrix: &PayoffMatrix) -> (GameMove, f64) {
    let mut best = (GameMove::Stall, f64::NEG_INFINITY);
    for (i, row) in matrix.iter().enumerate() {
        let worst = row.iter().copied().fold(f64::INFINITY, f64::min);
        if worst > best.1 {
            best = (GAME_MOVES[i], worst);
        }
    }
    best
}

pub fn sample_move<R: Rng + ?Sized>(probabilities: &[f64; 4], rng: &mut R) -> GameMove {
    let draw: f64 = rng.random::<f64>();
    let mut cumulative = 0.0;
    for (i, p) in probabilities.iter().enumerate() {
        cumulative += p;
        if draw < cumulative {
            return GAME_MOVES[i];
        }
    }
    // Rounding left a sliver above the last bucket.
    probabilities
        .iter()
        .enumerate()
        .rev()
        .find(|(_, p)| **p > 0.0)
        .map(|(i, _)| GAME_MOVES[i])
        .unwrap_or(GameMove::Stall)
}

/// Game row a catalogue tactic plays out as.
pub fn tactic_alignment(tactic: Tactic) -> Option<GameMove> {
    match tactic {
        Tactic::StallConfusion
        | Tactic::StallFakeData
        | Tactic::OtpStall
        | Tactic::DeployFakeProof
        | Tactic::DesperateRetention => Some(GameMove::Stall),
        Tactic::BaitForIntel => Some(GameMove::Bait),
        Tactic::NormalChat | Tactic::SubmissiveApology => Some(GameMove::Comply),
        Tactic::FastReflex | Tactic::SafeFallback => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NashMove {
    pub game_move: GameMove,
    pub value: f64,
    pub probabilities: [f64; 4],
    pub converged: bool,
}

impl NashMove {
    pub fn into_signal(self, policy_tactic: Tactic) -> PayoffSignal {
        PayoffSignal {
            game_move: self.game_move,
            value: self.value,
            mixed_strategy: self.probabilities.to_vec(),
            converged: self.converged,
            agrees_with_policy: tactic_alignment(policy_tactic) == Some(self.game_move),
        }
    }
}

/// Solve and sample synchronously, falling back to maximin on solver error.
pub fn nash_move_with<R: Rng + ?Sized>(matrix: &PayoffMatrix, rng: &mut R) -> NashMove {
    match solve_zero_sum(matrix) {
        Ok(strategy) => NashMove {
            game_move: sample_move(&strategy.probabilities, rng),
            value: strategy.value,
            probabilities: strategy.probabilities,
            converged: true,
        },
        Err(e) => {
            tracing::warn!(error = %e, "Payoff LP did not converge; using maximin row");
            maximin_move(matrix)
        }
    }
}

fn maximin_move(matrix: &PayoffMatrix) -> NashMove {
    let (game_move, value) = maximin(matrix);
    let mut probabilities = [0.0; 4];
    if let Some(i) = GAME_MOVES.iter().position(|m| *m == game_move) {
        probabilities[i] = 1.0;
    }
    NashMove {
        game_move,
        value,
        probabilities,
        converged: false,
    }
}

#[derive(Debug, Clone)]
pub struct PayoffModel {
    solver_timeout: Duration,
}

impl PayoffModel {
    pub fn new(solver_timeout: Duration) -> Self {
        Self { solver_timeout }
    }

    /// Off-thread solve bounded by the solver timeout. A timeout or panic in
    /// the solver yields the deterministic maximin row.
    pub async fn calculate_nash_move(
        &self,
        patience: f64,
        confirmed_intel: usize,
    ) -> Result<NashMove, (NashMove, EngineError)> {
        let matrix = payoff_matrix(aggression(patience), intel_ratio(confirmed_intel));
        let task = tokio::task::spawn_blocking(move || {
            let mut rng = rand::rng();
            nash_move_with(&matrix, &mut rng)
        });
        match tokio::time::timeout(self.solver_timeout, task).await {
            Ok(Ok(nash)) => Ok(nash),
            Ok(Err(join_err)) => Err((
                maximin_move(&matrix),
                EngineError::Solver(format!("solver task failed: {join_err}")),
            )),
            Err(_) => Err((
                maximin_move(&matrix),
                EngineError::CollaboratorTimeout {
                    collaborator: "payoff_solver",
                    after: self.solver_timeout,
                },
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn assert_optimal(matrix: &PayoffMatrix, strategy: &MixedStrategy) {
        let sum: f64 = strategy.probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        // Every column pays the row player at least v under x.
        for j in 0..4 {
            let payoff: f64 = (0..4).map(|i| strategy.probabilities[i] * matrix[i][j]).sum();
            assert!(payoff >= strategy.value - 1e-7, "column {j}: {payoff} < {}", strategy.value);
        }
    }

    #[test]
    fn test_base_game_solution_is_optimal() {
        let matrix = payoff_matrix(0.2, 0.0);
        assert_eq!(matrix, BASE_MATRIX);
        let strategy = solve_zero_sum(&matrix).unwrap();
        assert_optimal(&matrix, &strategy);
        // Stall alone guarantees 2, so the game value is at least that.
        assert!(strategy.value >= 2.0 - 1e-9);
    }

    #[test]
    fn test_known_matching_pennies_value() {
        let matrix: PayoffMatrix = [
            [1.0, -1.0, -1.0, -1.0],
            [-1.0, 1.0, -1.0, -1.0],
            [-1.0, -1.0, -1.0, -1.0],
            [-1.0, -1.0, -1.0, -1.0],
        ];
        let strategy = solve_zero_sum(&matrix).unwrap();
        assert_optimal(&matrix, &strategy);
        assert!((strategy.value + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_perturbations_apply_and_stay_bounded() {
        let matrix = payoff_matrix(0.9, 0.9);
        assert_eq!(matrix[0], [6.0, 10.0, 4.0, 12.0]);
        assert_eq!(matrix[1], [0.0, -5.0, -1.0, -8.0]);
        assert_eq!(matrix[2][0], 1.0);

        for a in 0..=20 {
            for r in 0..=20 {
                let m = payoff_matrix(a as f64 / 20.0, r as f64 / 20.0);
                assert!(m
                    .iter()
                    .flatten()
                    .all(|v| (-PAYOFF_BOUND..=PAYOFF_BOUND).contains(v)));
                let strategy = solve_zero_sum(&m).unwrap();
                assert!((-PAYOFF_BOUND..=PAYOFF_BOUND).contains(&strategy.value));
            }
        }
    }

    #[test]
    fn test_maximin_picks_best_worst_case() {
        assert_eq!(maximin(&BASE_MATRIX), (GameMove::Stall, 2.0));
    }

    #[test]
    fn test_non_finite_matrix_falls_back_to_maximin() {
        let mut matrix = BASE_MATRIX;
        matrix[3][3] = f64::NAN;
        let mut rng = StdRng::seed_from_u64(1);
        let nash = nash_move_with(&matrix, &mut rng);
        assert!(!nash.converged);
        assert_eq!(nash.game_move, GameMove::Stall);
    }

    #[test]
    fn test_sampling_follows_distribution() {
        let mut rng = StdRng::seed_from_u64(42);
        let probabilities = [0.7, 0.3, 0.0, 0.0];
        let stalls = (0..10_000)
            .filter(|_| sample_move(&probabilities, &mut rng) == GameMove::Stall)
            .count();
        assert!((6_700..7_300).contains(&stalls), "stalls: {stalls}");
    }

    #[tokio::test]
    async fn test_async_solve_returns_signal() {
        let model = PayoffModel::new(Duration::from_millis(500));
        let nash = model.calculate_nash_move(80.0, 1).await.unwrap();
        assert!(nash.converged);
        let signal = nash.into_signal(Tactic::BaitForIntel);
        assert_eq!(signal.mixed_strategy.len(), 4);
    }
}
