//! Reward shaping for the self-play loop. Pure functions; the orchestrator
//! writes the results into the episode record.

/// Injector reward. An invalid artifact is worth -1. A bug every attempt
/// solves, or none does, is worth -alpha. In between the reward decreases
/// linearly in the solve rate, crossing zero at s = 1/(1+alpha), so bugs that
/// are hard but solvable pay the most.
pub fn injector_reward(valid: bool, solve_rate: f64, alpha: f64) -> f64 {
    if !valid {
        return -1.0;
    }
    if solve_rate <= 0.0 || solve_rate >= 1.0 {
        return -alpha;
    }
    1.0 - (1.0 + alpha) * solve_rate
}

/// Solver reward per attempt: +1 on success, -1 otherwise.
pub fn solver_reward(success: bool) -> f64 {
    if success {
        1.0
    } else {
        -1.0
    }
}

pub fn solve_rate(successes: usize, attempts: usize) -> f64 {
    if attempts == 0 {
        return 0.0;
    }
    successes as f64 / attempts as f64
}

pub fn mean_solver_reward(outcomes: &[bool]) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    outcomes.iter().map(|&s| solver_reward(s)).sum::<f64>() / outcomes.len() as f64
}
