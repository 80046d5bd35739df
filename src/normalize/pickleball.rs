use super::{derive_winner, mov_weight_from_margins, validate_shape, NormalizationError, NormalizedMatch, RawSubmission};
use crate::normalize::FormatHandler;
use crate::params::RatingParameters;
use crate::rating::MatchInput;

/// `PICKLEBALL/SINGLES/BO3_11POINT`: rally-free, first to 11, win by 2,
/// hard cap at 15.
pub struct Bo3Point11 {
    side_size: usize
}

impl Bo3Point11 {
    pub fn singles() -> Self {
        Bo3Point11 { side_size: 1 }
    }
}

fn validate_game_score(game_no: i32, a: i32, b: i32) -> Result<(), NormalizationError> {
    let high = a.max(b);
    let low = a.min(b);

    if !(11..=15).contains(&high) {
        return Err(NormalizationError::ValidationFailed {
            detail: format!("game {game_no}: winning score {high} must be in 11..=15")
        });
    }
    if high < 15 && high - low < 2 {
        return Err(NormalizationError::ValidationFailed {
            detail: format!("game {game_no}: deuce requires a 2-point lead below 15")
        });
    }
    if high == 15 && low > 14 {
        return Err(NormalizationError::ValidationFailed {
            detail: format!("game {game_no}: score {a}-{b} exceeds the 15-point cap")
        });
    }
    Ok(())
}

impl FormatHandler for Bo3Point11 {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::PlayerId;

    fn submission(games: Vec<(i32, i32, i32)>) -> RawSubmission {
        RawSubmission {
            sport: "PICKLEBALL".to_string(),
            discipline: "SINGLES".to_string(),
            format: "BO3_11POINT".to_string(),
            side_a: vec![PlayerId::from("a")],
            side_b: vec![PlayerId::from("b")],
            games: games.into_iter().map(|(n, a, b)| super::super::RawGameScore { game_no: n, a, b }).collect()
        }
    }

    #[test]
    fn accepts_standard_win() {
        let handler = Bo3Point11::singles();
        let params = RatingParameters::default();
        let sub = submission(vec![(1, 11, 6), (2, 11, 9)]);
        assert!(handler.normalize(&sub, &params).is_ok());
    }

    #[test]
    fn rejects_cap_violation() {
        let handler = Bo3Point11::singles();
        let params = RatingParameters::default();
        let sub = submission(vec![(1, 16, 14)]);
        assert!(handler.normalize(&sub, &params).is_err());
    }
}
