//! Entity types for the data model. Ids are newtyped strings
//! (caller/store minted for long-lived entities) or UUIDs (store-minted for
//! append-only rows).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(OrganizationId);
string_id!(PlayerId);
string_id!(LadderId);
string_id!(RegionId);
string_id!(ProviderId);
uuid_id!(MatchId);
uuid_id!(RatingEventId);
uuid_id!(PairSynergyHistoryId);
uuid_id!(JobId);

pub const GLOBAL_REGION: &str = "GLOBAL";
pub const UNSPECIFIED_TIER: &str = "UNSPECIFIED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sex {
    M,
    F,
    X
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    A,
    B
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => write!(f, "A"),
            Side::B => write!(f, "B")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Organization {
    pub organization_id: OrganizationId,
    pub slug: String
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub player_id: PlayerId,
    pub organization_id: OrganizationId,
    pub display_name: String,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub sex: Option<Sex>,
    pub birth_date: Option<chrono::NaiveDate>,
    pub birth_year: Option<i32>,
    pub country_code: Option<String>,
    pub region_id: Option<RegionId>,
    pub external_ref: Option<String>
}

impl Player {
    /// Derives `birth_year` from `birth_date` when present (see
    /// DESIGN.md). Returns an error string if the caller
    /// supplied a `birth_year` that disagrees with `birth_date`.
    pub fn new(
        player_id: PlayerId,
        organization_id: OrganizationId,
        display_name: String,
        birth_date: Option<chrono::NaiveDate>,
        birth_year: Option<i32>
    ) -> Result<Self, String> {
        use chrono::Datelike;
        let derived_year = birth_date.map(|d| d.year());
        let resolved_year = match (derived_year, birth_year) {
            (Some(derived), Some(given)) if derived != given => {
                return Err(format!(
                    "birth_year {} does not match birth_date year {}",
                    given, derived
                ));
            }
            (Some(derived), _) => Some(derived),
            (None, given) => given
        };

        Ok(Player {
            player_id,
            organization_id,
            display_name,
            given_name: None,
            family_name: None,
            sex: None,
            birth_date,
            birth_year: resolved_year,
            country_code: None,
            region_id: None,
            external_ref: None
        })
    }
}

/// `(organization_id, sport, discipline, format, tier, region_id)` identity
/// tuple. `LadderId` is the store-assigned id for the row; `LadderKey` is
/// what callers use to look a ladder up / create it lazily.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LadderKey {
    pub organization_id: OrganizationId,
    pub sport: String,
    pub discipline: String,
    pub format: String,
    pub tier: String,
    pub region_id: RegionId
}

impl LadderKey {
    pub fn new(
        organization_id: OrganizationId,
        sport: impl Into<String>,
        discipline: impl Into<String>,
        format: impl Into<String>
    ) -> Self {
        LadderKey {
            organization_id,
            sport: sport.into(),
            discipline: discipline.into(),
            format: format.into(),
            tier: UNSPECIFIED_TIER.to_string(),
            region_id: RegionId(GLOBAL_REGION.to_string())
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = tier.into();
        self
    }

    pub fn with_region(mut self, region_id: RegionId) -> Self {
        self.region_id = region_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeBand {
    pub min_age: Option<i32>,
    pub max_age: Option<i32>
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgePolicy {
    pub cutoff_date: chrono::NaiveDate,
    pub age_bands: std::collections::BTreeMap<String, AgeBand>
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ladder {
    pub ladder_id: LadderId,
    pub key: LadderKey,
    pub age_policy: Option<AgePolicy>
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingState {
    pub mu: f64,
    pub sigma: f64,
    pub matches_count: u32
}

impl RatingState {
    pub fn baseline(params: &crate::params::RatingParameters) -> Self {
        RatingState {
            mu: params.base_mu,
            sigma: params.base_sigma,
            matches_count: 0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRating {
    pub player_id: PlayerId,
    pub ladder_id: LadderId,
    pub mu: f64,
    pub sigma: f64,
    pub matches_count: u32
}

/// Sorted join of two player ids — the identity of a recurring doubles pair
/// on one ladder. Always constructed via [`PairKey::new`] so ordering is
/// canonical regardless of submission side order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey(pub PlayerId, pub PlayerId);

impl PairKey {
    pub fn new(a: PlayerId, b: PlayerId) -> Self {
        if a <= b {
            PairKey(a, b)
        } else {
            PairKey(b, a)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairSynergy {
    pub gamma: f64,
    pub matches: u32
}

impl Default for PairSynergy {
    fn default() -> Self {
        PairSynergy { gamma: 0.0, matches: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatingStatus {
    Rated,
    Unrated,
    Pending
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameScoreLine {
    pub game_no: i32,
    pub a: i32,
    pub b: i32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub match_id: MatchId,
    pub ladder_id: LadderId,
    pub provider_id: ProviderId,
    pub organization_id: OrganizationId,
    pub start_time: DateTime<Utc>,
    pub tier: String,
    pub sport: String,
    pub discipline: String,
    pub format: String,
    pub side_a: Vec<PlayerId>,
    pub side_b: Vec<PlayerId>,
    pub games: Vec<GameScoreLine>,
    pub raw_payload: serde_json::Value,
    pub rating_status: RatingStatus,
    pub rating_skip_reason: Option<String>,
    pub event_id: Option<String>,
    pub competition_id: Option<String>,
    pub external_ref: Option<String>,
    pub venue_id: Option<String>,
    pub region_id: Option<RegionId>
}

impl Match {
    pub fn players_on(&self, side: Side) -> &[PlayerId] {
        match side {
            Side::A => &self.side_a,
            Side::B => &self.side_b
        }
    }

    pub fn all_players(&self) -> Vec<PlayerId> {
        self.side_a.iter().chain(self.side_b.iter()).cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingEventRow {
    pub rating_event_id: RatingEventId,
    pub organization_id: OrganizationId,
    pub player_id: PlayerId,
    pub ladder_id: LadderId,
    pub match_id: MatchId,
    pub applied_at: DateTime<Utc>,
    pub mu_before: f64,
    pub mu_after: f64,
    pub delta: f64,
    pub sigma_before: f64,
    pub sigma_after: f64,
    pub win_probability_pre: f64,
    pub opponent_mu_before: f64,
    pub mov_weight: f64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSynergyHistoryRow {
    pub pair_synergy_history_id: PairSynergyHistoryId,
    pub ladder_id: LadderId,
    pub pair_key: PairKey,
    pub match_id: MatchId,
    pub applied_at: DateTime<Utc>,
    pub gamma_before: f64,
    pub gamma_after: f64,
    pub matches_before: u32,
    pub matches_after: u32,
    pub activated: bool
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayQueueEntry {
    pub ladder_id: LadderId,
    pub earliest_start_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    InProgress,
    Failed,
    Completed
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    ReplayLadder,
    RefreshInsight
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::ReplayLadder => write!(f, "replay_ladder"),
            JobKind::RefreshInsight => write!(f, "refresh_insight")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub kind: JobKind,
    pub scope_key: String,
    pub run_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    /// `locked_at + visibility_timeout`, stamped at claim time; the sweeper
    /// promotes `IN_PROGRESS` jobs with an expired lease back to `PENDING`.
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    pub last_error: Option<String>
}
