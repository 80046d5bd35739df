use super::{derive_winner, mov_weight_from_margins, validate_shape, NormalizationError, NormalizedMatch, RawSubmission};
use crate::params::RatingParameters;
use crate::rating::MatchInput;
use crate::store::types::Side;
use crate::normalize::FormatHandler;

/// `BADMINTON/{SINGLES,DOUBLES}/BO3_21RALLY`. Rally scoring to 21, win by 2
/// unless the game reaches 30-29 (hard cap).
pub struct Bo3Rally21 {
    side_size: usize
}

impl Bo3Rally21 {
    pub fn singles() -> Self {
        Bo3Rally21 { side_size: 1 }
    }

    pub fn doubles() -> Self {
        Bo3Rally21 { side_size: 2 }
    }
}

fn validate_game_score(game_no: i32, a: i32, b: i32) -> Result<(), NormalizationError> {
    let high = a.max(b);
    let low = a.min(b);

    if !(21..=30).contains(&high) {
        return Err(NormalizationError::ValidationFailed {
            detail: format!("game {game_no}: winning score {high} must be in 21..=30")
        });
    }
    if high < 30 && high - low < 2 {
        return Err(NormalizationError::ValidationFailed {
            detail: format!("game {game_no}: deuce requires a 2-point lead below 30")
        });
    }
    if high == 30 && low > 29 {
        return Err(NormalizationError::ValidationFailed {
            detail: format!("game {game_no}: score {a}-{b} exceeds the 30-point cap")
        });
    }
    Ok(())
}

impl FormatHandler for Bo3Rally21 {
    fn normalize(
        &self,
        submission: &RawSubmission,
        params: &RatingParameters
    ) -> Result<NormalizedMatch, NormalizationError> {
        if submission.games.is_empty() {
            return Ok(NormalizedMatch::Unrated { reason: "MISSING_SCORES" });
        }

        let games = validate_shape(submission, self.side_size)?;
        for g in &games {
            validate_game_score(g.game_no, g.a, g.b)?;
        }

        let winner = derive_winner(&games)?;
        let mov_weight = mov_weight_from_margins(&games, params);
        let base_step = params.base_step_for(&submission.sport, &submission.discipline, &submission.format);

        Ok(NormalizedMatch::Rated(MatchInput {
            side_a: submission.side_a.clone(),
            side_b: submission.side_b.clone(),
            winner,
            mov_weight,
            base_step
        }))
    }
}
