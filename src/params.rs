//! C1 — immutable tunables. A handful of base values with everything else
//! derived from them, exposed as a plain struct instead of module-level
//! statics so call sites can pass a `&RatingParameters` explicitly (no
//! hidden global state).

use std::collections::HashMap;

/// Base μ/σ and every other knob the rating updater (C3) and pair synergy
/// gate need. Most fields are derived from `base_sigma` by a fixed
/// multiplier rather than configured independently.
#[derive(Debug, Clone, PartialEq)]
pub struct RatingParameters {
    /// Baseline μ assigned to a brand-new `PlayerRating`.
    pub base_mu: f64,
    /// Baseline σ assigned to a brand-new `PlayerRating`.
    pub base_sigma: f64,
    /// Skill-noise parameter used in team variance (Σ² = Σσ² + n·β²).
    pub beta: f64,
    /// Drift parameter added back into σ on every update.
    pub tau: f64,
    /// Hard floor for σ after any update.
    pub sigma_min: f64,
    /// Base step size (K) used when no `(sport, discipline, format)` entry
    /// is present in `base_step_overrides`.
    pub default_base_step: f64,
    /// Per-`(sport, discipline, format)` override for the base step size,
    /// since a badminton rally-scoring match and a pickleball match don't
    /// carry the same amount of signal per win.
    pub base_step_overrides: HashMap<(String, String, String), f64>,
    /// Synergy step size (K_γ).
    pub synergy_step: f64,
    /// Minimum prior matches a pair needs before γ starts moving.
    pub synergy_activation: u32,
    /// Lower bound of the margin-of-victory multiplier.
    pub mov_min: f64,
    /// Upper bound of the margin-of-victory multiplier.
    pub mov_max: f64
}

lazy_static! {
    /// Default base σ, from which β/τ/σ_min are all derived by a fixed ratio.
    static ref DERIVED_BASE_SIGMA: f64 = 500.0 / 5.0 * 9.0;
}

impl Default for RatingParameters {
    fn default() -> Self {
        let base_sigma = *DERIVED_BASE_SIGMA;
        let mut base_step_overrides = HashMap::new();
        base_step_overrides.insert(("BADMINTON".to_string(), "SINGLES".to_string(), "BO3_21RALLY".to_string()), 32.0);
        base_step_overrides.insert(("BADMINTON".to_string(), "DOUBLES".to_string(), "BO3_21RALLY".to_string()), 24.0);
        base_step_overrides.insert(("PICKLEBALL".to_string(), "SINGLES".to_string(), "BO3_11POINT".to_string()), 28.0);
        RatingParameters {
            base_mu: 1500.0,
            base_sigma,
            beta: base_sigma / 2.0,
            tau: base_sigma / 100.0,
            sigma_min: base_sigma / 10.0,
            default_base_step: 32.0,
            base_step_overrides,
            synergy_step: 8.0,
            synergy_activation: 3,
            mov_min: 0.5,
            mov_max: 1.5
        }
    }
}

impl RatingParameters {
    /// Clamp an arbitrary weight into `[mov_min, mov_max]`. Used by the
    /// normalizer (C2) after computing a raw margin ratio.
    pub fn clamp_mov(&self, raw: f64) -> f64 {
        raw.clamp(self.mov_min, self.mov_max)
    }

    /// Base step size (K) for a given `(sport, discipline, format)`, falling
    /// back to `default_base_step` when no override is configured.
    pub fn base_step_for(&self, sport: &str, discipline: &str, format: &str) -> f64 {
        self.base_step_overrides
            .get(&(sport.to_string(), discipline.to_string(), format.to_string()))
            .copied()
            .unwrap_or(self.default_base_step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let p = RatingParameters::default();
        assert!(p.sigma_min > 0.0);
        assert!(p.sigma_min < p.base_sigma);
        assert!(p.beta > 0.0);
        assert!(p.tau > 0.0);
        assert!(p.mov_min < p.mov_max);
    }

    #[test]
    fn clamp_mov_respects_bounds() {
        let p = RatingParameters::default();
        assert_eq!(p.clamp_mov(0.0), p.mov_min);
        assert_eq!(p.clamp_mov(10.0), p.mov_max);
        let mid = (p.mov_min + p.mov_max) / 2.0;
        assert_eq!(p.clamp_mov(mid), mid);
    }
}
