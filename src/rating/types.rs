use crate::store::types::{PairKey, PlayerId, Side};
use serde::{Deserialize, Serialize};

/// Normalized match handed to the updater by C2. Carries exactly the data
/// C3's algorithm needs and nothing about persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchInput {
    pub side_a: Vec<PlayerId>,
    pub side_b: Vec<PlayerId>,
    pub winner: Side,
    pub mov_weight: f64,
    /// Base step size (K) for this match's `(sport, discipline, format)`,
    /// resolved by C2 via `RatingParameters::base_step_for`.
    pub base_step: f64
}

impl MatchInput {
    pub fn players_on(&self, side: Side) -> &[PlayerId] {
        match side {
            Side::A => &self.side_a,
            Side::B => &self.side_b
        }
    }

    pub fn all_players(&self) -> impl Iterator<Item = &PlayerId> {
        self.side_a.iter().chain(self.side_b.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerDelta {
    pub mu_before: f64,
    pub mu_after: f64,
    pub delta: f64,
    pub sigma_before: f64,
    pub sigma_after: f64,
    pub win_probability_pre: f64,
    /// Mean pre-match μ of the opposing side, for insight-building form
    /// summaries (`avg_opponent_μ`).
    pub opponent_mu_before: f64
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairDelta {
    pub gamma_before: f64,
    pub gamma_after: f64,
    pub delta: f64,
    pub matches_before: u32,
    pub matches_after: u32,
    pub activated: bool
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub per_player: std::collections::BTreeMap<PlayerId, PlayerDelta>,
    pub pair_updates: std::collections::BTreeMap<PairKey, PairDelta>,
    /// Signed delta applied to side A's team mean (positive => A gained).
    pub team_delta: f64,
    /// Pre-match probability that side A wins.
    pub win_probability: f64
}
