//! C3 — the rating updater. A pure, deterministic function: no I/O, no wall
//! clock, no randomness. Decomposed into one small method per algorithmic
//! step rather than a single monolithic function.

pub mod types;

use crate::params::RatingParameters;
use crate::store::types::{PairKey, PairSynergy, PlayerId, RatingState, Side};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::BTreeMap;
pub use types::{MatchInput, PairDelta, PlayerDelta, UpdateOutcome};

/// Standard normal CDF, Φ.
fn phi(z: f64) -> f64 {
    // A Normal(0, 1) construction only fails for a non-finite std-dev, which
    // never happens here.
    Normal::new(0.0, 1.0).expect("standard normal is always valid").cdf(z)
}

struct SideSummary {
    mean_mu: f64,
    sum_sigma_sq: f64,
    pair: Option<(PairKey, PairSynergy, bool)>
}

fn summarize_side(
    players: &[PlayerId],
    ratings: &BTreeMap<PlayerId, RatingState>,
    pairs: &BTreeMap<PairKey, PairSynergy>,
    params: &RatingParameters
) -> SideSummary {
    let n = players.len() as f64;
    let mut sum_mu = 0.0;
    let mut sum_sigma_sq = 0.0;
    for p in players {
        let state = ratings
            .get(p)
            .unwrap_or_else(|| panic!("missing rating snapshot for participant {p}"));
        sum_mu += state.mu;
        sum_sigma_sq += state.sigma * state.sigma;
    }
    let mean_mu = sum_mu / n;

    let pair = if players.len() == 2 {
        let key = PairKey::new(players[0].clone(), players[1].clone());
        let synergy = pairs.get(&key).copied().unwrap_or_default();
        let activated_pre = synergy.matches >= params.synergy_activation;
        Some((key, synergy, activated_pre))
    } else {
        None
    };

    let adjusted_mean = mean_mu
        + pair
            .as_ref()
            .map(|(_, s, activated)| if *activated { s.gamma } else { 0.0 })
            .unwrap_or(0.0);

    SideSummary {
        mean_mu: adjusted_mean,
        sum_sigma_sq,
        pair
    }
}

/// Applies the seven-step rating update to a single match. Panics if `ratings` is
/// missing a snapshot for any participant — that is a programmer
/// error the ingestion coordinator (C5) must prevent, never a recoverable
/// `Result`.
pub fn update_match(
    input: &MatchInput,
    ratings: &BTreeMap<PlayerId, RatingState>,
    pairs: &BTreeMap<PairKey, PairSynergy>,
    params: &RatingParameters
) -> UpdateOutcome {
    let side_a = summarize_side(&input.side_a, ratings, pairs, params);
    let side_b = summarize_side(&input.side_b, ratings, pairs, params);

    let total_participants = (input.side_a.len() + input.side_b.len()) as f64;
    let team_variance = side_a.sum_sigma_sq + side_b.sum_sigma_sq + total_participants * params.beta * params.beta;
    let sqrt_variance = team_variance.sqrt();

    // Probability that side A wins, independent of who actually won.
    let win_probability_a = phi((side_a.mean_mu - side_b.mean_mu) / sqrt_variance);

    let (winner_mean, loser_mean) = match input.winner {
        Side::A => (side_a.mean_mu, side_b.mean_mu),
        Side::B => (side_b.mean_mu, side_a.mean_mu)
    };
    // Pre-match win probability of the side that actually won.
    let p_winner = phi((winner_mean - loser_mean) / sqrt_variance);

    let magnitude = input.base_step * input.mov_weight * (1.0 - p_winner);
    let team_delta_for_a = match input.winner {
        Side::A => magnitude,
        Side::B => -magnitude
    };

    let mut per_player = BTreeMap::new();
    for (side, summary, is_winner) in [
        (Side::A, &side_a, input.winner == Side::A),
        (Side::B, &side_b, input.winner == Side::B)
    ] {
        let players = input.players_on(side);
        let side_win_prob = if side == Side::A {
            win_probability_a
        } else {
            1.0 - win_probability_a
        };
        let sign = if is_winner { 1.0 } else { -1.0 };
        let opponent_mu_before = if side == Side::A { side_b.mean_mu } else { side_a.mean_mu };

        for p in players {
            let state = ratings[p];
            let weight = if summary.sum_sigma_sq > 0.0 {
                (state.sigma * state.sigma) / summary.sum_sigma_sq
            } else {
                1.0 / players.len() as f64
            };
            let delta = sign * magnitude * weight;
            let mu_after = state.mu + delta;

            let sigma_sq = state.sigma * state.sigma;
            let sigma_after =
                (sigma_sq * (1.0 - sigma_sq / team_variance) + params.tau * params.tau)
                    .sqrt()
                    .max(params.sigma_min);

            per_player.insert(
                p.clone(),
                PlayerDelta {
                    mu_before: state.mu,
                    mu_after,
                    delta,
                    sigma_before: state.sigma,
                    sigma_after,
                    win_probability_pre: side_win_prob,
                    opponent_mu_before
                }
            );
        }
    }

    let mut pair_updates = BTreeMap::new();
    for (side, summary) in [(Side::A, &side_a), (Side::B, &side_b)] {
        if let Some((key, synergy, activated)) = &summary.pair {
            let is_winner = side == input.winner;
            let sign = if is_winner { 1.0 } else { -1.0 };
            let (gamma_after, delta) = if *activated {
                let delta = params.synergy_step * input.mov_weight * (1.0 - p_winner) * sign;
                (synergy.gamma + delta, delta)
            } else {
                (synergy.gamma, 0.0)
            };

            pair_updates.insert(
                key.clone(),
                PairDelta {
                    gamma_before: synergy.gamma,
                    gamma_after,
                    delta,
                    matches_before: synergy.matches,
                    matches_after: synergy.matches + 1,
                    activated: *activated
                }
            );
        }
    }

    UpdateOutcome {
        per_player,
        pair_updates,
        team_delta: team_delta_for_a,
        win_probability: win_probability_a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::PlayerId;
    use approx::assert_abs_diff_eq;

    fn pid(s: &str) -> PlayerId {
        PlayerId(s.to_string())
    }

    fn baseline_ratings(ids: &[&str], params: &RatingParameters) -> BTreeMap<PlayerId, RatingState> {
        ids.iter()
            .map(|id| (pid(id), RatingState::baseline(params)))
            .collect()
    }

    fn singles_input(winner: Side, mov_weight: f64) -> MatchInput {
        MatchInput {
            side_a: vec![pid("a")],
            side_b: vec![pid("b")],
            winner,
            mov_weight,
            base_step: 32.0
        }
    }

    #[test]
    fn winner_gains_loser_loses_symmetrically() {
        let params = RatingParameters::default();
        let ratings = baseline_ratings(&["a", "b"], &params);
        let pairs = BTreeMap::new();

        let input = singles_input(Side::A, 1.0);
        let outcome = update_match(&input, &ratings, &pairs, &params);

        let a = outcome.per_player[&pid("a")];
        let b = outcome.per_player[&pid("b")];

        assert!(a.mu_after > a.mu_before, "winner should gain rating");
        assert!(b.mu_after < b.mu_before, "loser should lose rating");
        assert_abs_diff_eq!(a.delta, -b.delta, epsilon = 1e-9);
    }

    #[test]
    fn update_match_is_deterministic_for_identical_inputs() {
        let params = RatingParameters::default();
        let ratings = baseline_ratings(&["a", "b"], &params);
        let pairs = BTreeMap::new();
        let input = singles_input(Side::A, 1.2);

        let first = update_match(&input, &ratings, &pairs, &params);
        let second = update_match(&input, &ratings, &pairs, &params);

        assert_eq!(first, second);
    }

    #[test]
    fn win_probability_symmetry_holds_under_side_swap() {
        let params = RatingParameters::default();
        let mut ratings = BTreeMap::new();
        ratings.insert(pid("a"), RatingState { mu: 1600.0, sigma: 80.0, matches_count: 10 });
        ratings.insert(pid("b"), RatingState { mu: 1400.0, sigma: 80.0, matches_count: 10 });
        let pairs = BTreeMap::new();

        let forward = update_match(&singles_input(Side::A, 1.0), &ratings, &pairs, &params);

        let swapped_input = MatchInput {
            side_a: vec![pid("b")],
            side_b: vec![pid("a")],
            winner: Side::B,
            mov_weight: 1.0,
            base_step: 32.0
        };
        let swapped = update_match(&swapped_input, &ratings, &pairs, &params);

        assert_abs_diff_eq!(swapped.win_probability, 1.0 - forward.win_probability, epsilon = 1e-9);
        assert_abs_diff_eq!(swapped.team_delta, -forward.team_delta, epsilon = 1e-9);
    }

    #[test]
    fn sigma_never_drops_below_configured_floor() {
        let params = RatingParameters::default();
        let ratings = baseline_ratings(&["a", "b"], &params);
        let pairs = BTreeMap::new();
        let input = singles_input(Side::A, 1.0);

        let outcome = update_match(&input, &ratings, &pairs, &params);
        for delta in outcome.per_player.values() {
            assert!(delta.sigma_after >= params.sigma_min);
            assert!(delta.sigma_after <= delta.sigma_before + params.tau);
        }
    }

    #[test]
    fn pair_synergy_does_not_move_before_activation_threshold() {
        let params = RatingParameters::default();
        let mut ratings = BTreeMap::new();
        for id in ["a1", "a2", "b1", "b2"] {
            ratings.insert(pid(id), RatingState::baseline(&params));
        }
        let mut pairs = BTreeMap::new();
        pairs.insert(
            PairKey::new(pid("a1"), pid("a2")),
            PairSynergy { gamma: 0.0, matches: params.synergy_activation - 1 }
        );

        let input = MatchInput {
            side_a: vec![pid("a1"), pid("a2")],
            side_b: vec![pid("b1"), pid("b2")],
            winner: Side::A,
            mov_weight: 1.0,
            base_step: 24.0
        };
        let outcome = update_match(&input, &ratings, &pairs, &params);

        let pair_update = &outcome.pair_updates[&PairKey::new(pid("a1"), pid("a2"))];
        assert!(!pair_update.activated);
        assert_abs_diff_eq!(pair_update.delta, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pair_update.gamma_after, pair_update.gamma_before, epsilon = 1e-12);
        assert_eq!(pair_update.matches_after, pair_update.matches_before + 1);
    }

    #[test]
    fn pair_activates_and_gains_for_winners() {
        let params = RatingParameters::default();
        let mut ratings = BTreeMap::new();
        for id in ["a1", "a2", "b1", "b2"] {
            ratings.insert(pid(id), RatingState::baseline(&params));
        }
        let mut pairs = BTreeMap::new();
        pairs.insert(
            PairKey::new(pid("a1"), pid("a2")),
            PairSynergy { gamma: 0.0, matches: params.synergy_activation }
        );

        let input = MatchInput {
            side_a: vec![pid("a1"), pid("a2")],
            side_b: vec![pid("b1"), pid("b2")],
            winner: Side::A,
            mov_weight: 1.0,
            base_step: 24.0
        };
        let outcome = update_match(&input, &ratings, &pairs, &params);

        let pair_update = &outcome.pair_updates[&PairKey::new(pid("a1"), pid("a2"))];
        assert!(pair_update.activated);
        assert!(pair_update.gamma_after > pair_update.gamma_before);
    }
}
