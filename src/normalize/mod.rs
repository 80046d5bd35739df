//! C2 — format normalizer. A registry keyed by `(sport, discipline, format)`
//! of handlers that turn a raw submission into a [`MatchInput`](crate::rating::MatchInput),
//! each handler a small single-purpose validate-then-derive step.

mod badminton;
mod pickleball;

use crate::rating::MatchInput;
use crate::store::types::{PlayerId, Side};
use std::collections::HashMap;
use thiserror::Error;

/// Raw submission body as received from the HTTP edge (out of tree), before
/// any sport-specific validation.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct RawSubmission {
    pub sport: String,
    pub discipline: String,
    pub format: String,
    pub side_a: Vec<PlayerId>,
    pub side_b: Vec<PlayerId>,
    pub games: Vec<RawGameScore>
}

#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize)]
pub struct RawGameScore {
    pub game_no: i32,
    pub a: i32,
    pub b: i32
}

/// Outcome of normalizing a submission whose format handler declares it
/// ratable but found no winner (an "unrated match").
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedMatch {
    Rated(MatchInput),
    Unrated { reason: &'static str }
}

#[derive(Debug, Error, PartialEq)]
pub enum NormalizationError {
    #[error("validation failed: {detail}")]
    ValidationFailed { detail: String },

    #[error("unsupported format: {sport}/{discipline}/{format}")]
    UnsupportedFormat {
        sport: String,
        discipline: String,
        format: String
    }
}

/// Implemented once per `(sport, discipline, format)`. Adding a format is a
/// new impl plus one `FormatRegistry::register` call — no change to any
/// other component.
pub trait FormatHandler: Send + Sync {
    fn normalize(
        &self,
        submission: &RawSubmission,
        params: &crate::params::RatingParameters
    ) -> Result<NormalizedMatch, NormalizationError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RegistryKey {
    sport: String,
    discipline: String,
    format: String
}

pub struct FormatRegistry {
    handlers: HashMap<RegistryKey, Box<dyn FormatHandler>>
}

impl Default for FormatRegistry {
    fn default() -> Self {
        let mut registry = FormatRegistry { handlers: HashMap::new() };
        registry.register("BADMINTON", "SINGLES", "BO3_21RALLY", Box::new(badminton::Bo3Rally21::singles()));
        registry.register("BADMINTON", "DOUBLES", "BO3_21RALLY", Box::new(badminton::Bo3Rally21::doubles()));
        registry.register(
            "PICKLEBALL",
            "SINGLES",
            "BO3_11POINT",
            Box::new(pickleball::Bo3Point11::singles())
        );
        registry
    }
}

impl FormatRegistry {
    pub fn register(&mut self, sport: &str, discipline: &str, format: &str, handler: Box<dyn FormatHandler>) {
        self.handlers.insert(
            RegistryKey {
                sport: sport.to_string(),
                discipline: discipline.to_string(),
                format: format.to_string()
            },
            handler
        );
    }

    pub fn normalize(
        &self,
        submission: &RawSubmission,
        params: &crate::params::RatingParameters
    ) -> Result<NormalizedMatch, NormalizationError> {
        let key = RegistryKey {
            sport: submission.sport.clone(),
            discipline: submission.discipline.clone(),
            format: submission.format.clone()
        };
        match self.handlers.get(&key) {
            Some(handler) => handler.normalize(submission, params),
            None => Err(NormalizationError::UnsupportedFormat {
                sport: submission.sport.clone(),
                discipline: submission.discipline.clone(),
                format: submission.format.clone()
            })
        }
    }
}

/// Shared shape/ordering checks every format needs: unique ascending
/// `game_no`, non-empty sides, no player on both sides.
pub(crate) fn validate_shape(
    submission: &RawSubmission,
    side_size: usize
) -> Result<Vec<RawGameScore>, NormalizationError> {
    if submission.side_a.len() != side_size || submission.side_b.len() != side_size {
        return Err(NormalizationError::ValidationFailed {
            detail: format!(
                "expected {} player(s) per side, got {}/{}",
                side_size,
                submission.side_a.len(),
                submission.side_b.len()
            )
        });
    }

    let a_set: std::collections::HashSet<_> = submission.side_a.iter().collect();
    if submission.side_b.iter().any(|p| a_set.contains(p)) {
        return Err(NormalizationError::ValidationFailed {
            detail: "a player cannot appear on both sides".to_string()
        });
    }

    let mut games = submission.games.clone();
    games.sort_by_key(|g| g.game_no);
    for pair in games.windows(2) {
        if pair[0].game_no >= pair[1].game_no {
            return Err(NormalizationError::ValidationFailed {
                detail: "game_no must be strictly ascending and unique".to_string()
            });
        }
    }

    Ok(games)
}

pub(crate) fn mov_weight_from_margins(games: &[RawGameScore], params: &crate::params::RatingParameters) -> f64 {
    let total_margin: i32 = games.iter().map(|g| (g.a - g.b).abs()).sum();
    let total_points: i32 = games.iter().map(|g| g.a + g.b).sum();
    if total_points == 0 {
        return params.mov_min;
    }
    let ratio = total_margin as f64 / total_points as f64;
    let raw = params.mov_min + ratio * (params.mov_max - params.mov_min);
    params.clamp_mov(raw)
}

pub(crate) fn derive_winner(games: &[RawGameScore]) -> Result<Side, NormalizationError> {
    let (mut wins_a, mut wins_b) = (0, 0);
    for g in games {
        match g.a.cmp(&g.b) {
            std::cmp::Ordering::Greater => wins_a += 1,
            std::cmp::Ordering::Less => wins_b += 1,
            std::cmp::Ordering::Equal => {
                return Err(NormalizationError::ValidationFailed {
                    detail: format!("game {} cannot end tied", g.game_no)
                });
            }
        }
    }
    match wins_a.cmp(&wins_b) {
        std::cmp::Ordering::Greater => Ok(Side::A),
        std::cmp::Ordering::Less => Ok(Side::B),
        std::cmp::Ordering::Equal => Err(NormalizationError::ValidationFailed {
            detail: "match is tied, no winner can be derived".to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(side_a: Vec<&str>, side_b: Vec<&str>, games: Vec<(i32, i32, i32)>) -> RawSubmission {
        RawSubmission {
            sport: "BADMINTON".to_string(),
            discipline: if side_a.len() == 1 { "SINGLES".to_string() } else { "DOUBLES".to_string() },
            format: "BO3_21RALLY".to_string(),
            side_a: side_a.into_iter().map(PlayerId::from).collect(),
            side_b: side_b.into_iter().map(PlayerId::from).collect(),
            games: games
                .into_iter()
                .map(|(game_no, a, b)| RawGameScore { game_no, a, b })
                .collect()
        }
    }

    #[test]
    fn unsupported_format_is_rejected() {
        let registry = FormatRegistry::default();
        let params = crate::params::RatingParameters::default();
        let mut sub = submission(vec!["a"], vec!["b"], vec![(1, 21, 10), (2, 21, 12)]);
        sub.format = "ROUND_ROBIN".to_string();

        let err = registry.normalize(&sub, &params).unwrap_err();
        assert!(matches!(err, NormalizationError::UnsupportedFormat { .. }));
    }

    #[test]
    fn singles_happy_path_rates_a_win() {
        let registry = FormatRegistry::default();
        let params = crate::params::RatingParameters::default();
        let sub = submission(vec!["a"], vec!["b"], vec![(1, 21, 15), (2, 21, 18)]);

        let normalized = registry.normalize(&sub, &params).unwrap();
        match normalized {
            NormalizedMatch::Rated(input) => {
                assert_eq!(input.winner, Side::A);
                assert!(input.mov_weight >= params.mov_min && input.mov_weight <= params.mov_max);
            }
            NormalizedMatch::Unrated { .. } => panic!("expected a rated match")
        }
    }

    #[test]
    fn duplicate_game_no_is_rejected() {
        let registry = FormatRegistry::default();
        let params = crate::params::RatingParameters::default();
        let sub = submission(vec!["a"], vec!["b"], vec![(1, 21, 15), (1, 21, 18)]);

        let err = registry.normalize(&sub, &params).unwrap_err();
        assert!(matches!(err, NormalizationError::ValidationFailed { .. }));
    }

    #[test]
    fn player_on_both_sides_is_rejected() {
        let registry = FormatRegistry::default();
        let params = crate::params::RatingParameters::default();
        let sub = submission(vec!["a"], vec!["a"], vec![(1, 21, 15), (2, 21, 18)]);

        let err = registry.normalize(&sub, &params).unwrap_err();
        assert!(matches!(err, NormalizationError::ValidationFailed { .. }));
    }
}
