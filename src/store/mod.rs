//! C4 — ladder/player/pair state store. `RatingStore` is the capability
//! interface: one trait, two
//! implementations ([`MemoryStore`] for tests, [`PostgresStore`] for
//! production), both satisfying the same invariants.
//!
//! Plain `async fn` in the trait (no `async-trait`), so the trait is generic
//! but not `dyn`-safe; [`StoreHandle`] picks between the two concrete types
//! at runtime by matching, not by trait object.

pub mod memory;
pub mod postgres;
pub mod types;

use crate::error::DomainError;
use crate::rating::UpdateOutcome;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use types::{
    Ladder, LadderId, LadderKey, MatchId, Organization, OrganizationId, PairKey, PairSynergy, Player, PlayerId,
    PlayerRating, RatingEventRow, RatingState, ReplayQueueEntry
};

/// Cursor for [`RatingStore::list_leaderboard`] — base64url-encoded JSON.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LeaderboardCursor {
    pub mu: f64,
    pub player_id: PlayerId
}

impl LeaderboardCursor {
    pub fn encode(&self) -> Result<String, DomainError> {
        let json = serde_json::to_vec(self).map_err(|e| DomainError::Internal(e.to_string()))?;
        Ok(base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, json))
    }

    pub fn decode(cursor: &str) -> Result<Self, DomainError> {
        let bytes = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, cursor)
            .map_err(|e| DomainError::ValidationError { detail: format!("bad cursor: {e}") })?;
        serde_json::from_slice(&bytes).map_err(|e| DomainError::ValidationError { detail: format!("bad cursor: {e}") })
    }
}

/// Everything ingestion (C5), replay (C6) and leaderboard queries (§4.7)
/// need from persistent state. Missing `PlayerRating`/`PairSynergy` rows are
/// represented as `None`/absent-from-map — callers materialize the baseline
/// (`RatingState::baseline`) themselves: a player is lazily created with
/// (μ=baseμ, σ=baseσ, matches=0) on first contact.
pub trait RatingStore: Send + Sync {
    async fn get_organization(&self, organization_id: &OrganizationId) -> Result<Option<Organization>, DomainError>;

    async fn get_players(
        &self,
        organization_id: &OrganizationId,
        player_ids: &[PlayerId]
    ) -> Result<Vec<Player>, DomainError>;

    /// Same lookup as [`RatingStore::get_players`] but without the
    /// organization filter. Used to tell "player id doesn't exist anywhere"
    /// apart from "player id exists, but under a different organization" when
    /// reporting `DomainError::InvalidPlayers`.
    async fn get_players_any_organization(&self, player_ids: &[PlayerId]) -> Result<Vec<Player>, DomainError>;

    async fn get_or_create_ladder(&self, key: &LadderKey) -> Result<Ladder, DomainError>;

    async fn get_ratings(
        &self,
        ladder_id: &LadderId,
        player_ids: &[PlayerId]
    ) -> Result<BTreeMap<PlayerId, RatingState>, DomainError>;

    async fn get_pair_synergies(
        &self,
        ladder_id: &LadderId,
        pairs: &[PairKey]
    ) -> Result<BTreeMap<PairKey, PairSynergy>, DomainError>;

    /// Persists a newly ingested or replayed match together with the
    /// `UpdateOutcome` it produced: updates `PlayerRating`/`PairSynergy`
    /// rows, appends `RatingEvent`/`PairSynergyHistory` rows, all as one
    /// atomic unit.
    async fn record_rated_match(
        &self,
        ladder_id: &LadderId,
        organization_id: &OrganizationId,
        match_id: MatchId,
        applied_at: DateTime<Utc>,
        mov_weight: f64,
        outcome: &UpdateOutcome
    ) -> Result<Vec<RatingEventRow>, DomainError>;

    async fn get_replay_queue_entry(&self, ladder_id: &LadderId) -> Result<Option<ReplayQueueEntry>, DomainError>;

    async fn upsert_replay_queue_entry(
        &self,
        ladder_id: &LadderId,
        earliest_start_time: DateTime<Utc>
    ) -> Result<(), DomainError>;

    async fn delete_replay_queue_entry(&self, ladder_id: &LadderId) -> Result<(), DomainError>;

    /// Matches on `ladder_id` with `start_time >= from`, ordered by
    /// `(start_time, match_id)` ascending.
    async fn matches_from(&self, ladder_id: &LadderId, from: DateTime<Utc>) -> Result<Vec<types::Match>, DomainError>;

    async fn insert_match(&self, m: &types::Match) -> Result<(), DomainError>;

    /// The most recent `RatingEvent` for `(ladder_id, player_id)` with
    /// `applied_at < before`, or `None` if the player was never rated on
    /// this ladder before that point. Backed by an index on
    /// `(ladder_id, player_id, applied_at DESC)`.
    async fn latest_rating_event_before(
        &self,
        ladder_id: &LadderId,
        player_id: &PlayerId,
        before: DateTime<Utc>
    ) -> Result<Option<RatingEventRow>, DomainError>;

    /// `rating_snapshot`: latest event with `applied_at <=
    /// as_of`, or `None` to mean "use current `PlayerRating`".
    async fn latest_rating_event_as_of(
        &self,
        ladder_id: &LadderId,
        player_id: &PlayerId,
        as_of: DateTime<Utc>
    ) -> Result<Option<RatingEventRow>, DomainError>;

    async fn delete_rating_history_from(&self, ladder_id: &LadderId, from: DateTime<Utc>) -> Result<(), DomainError>;

    async fn set_player_rating(
        &self,
        ladder_id: &LadderId,
        player_id: &PlayerId,
        state: RatingState
    ) -> Result<(), DomainError>;

    async fn set_pair_synergy(
        &self,
        ladder_id: &LadderId,
        pair_key: &PairKey,
        synergy: PairSynergy
    ) -> Result<(), DomainError>;

    async fn list_leaderboard(
        &self,
        ladder_id: &LadderId,
        cursor: Option<LeaderboardCursor>,
        limit: usize
    ) -> Result<Vec<PlayerRating>, DomainError>;

    /// 1-based rank of `player_id` on `ladder_id`'s leaderboard (mu DESC,
    /// player_id ASC tiebreak, same ordering as `list_leaderboard`), or
    /// `None` if the player has no `PlayerRating` row on this ladder. Feeds
    /// the insight snapshot builder's per-discipline current rank.
    async fn get_player_rank(&self, ladder_id: &LadderId, player_id: &PlayerId) -> Result<Option<u32>, DomainError>;

    /// Where a hypothetical `PlayerRating` with this `mu` would rank on
    /// `ladder_id`'s leaderboard right now (1-based). Used to approximate a
    /// discipline's best-ever rank from a player's lifetime-high mu, since
    /// per-event ranks aren't persisted historically.
    async fn rank_for_mu(&self, ladder_id: &LadderId, mu: f64) -> Result<u32, DomainError>;

    /// Every `RatingEvent` for `(organization_id, player_id)` across all
    /// ladders, ordered by `applied_at` ascending. Feeds the insight
    /// snapshot builder (C8), which aggregates across disciplines.
    async fn player_history(
        &self,
        organization_id: &OrganizationId,
        player_id: &PlayerId
    ) -> Result<Vec<RatingEventRow>, DomainError>;

    /// Upserts a freshly built insight snapshot; the worker builds and
    /// upserts it after a `RefreshInsight` job runs.
    async fn upsert_insight_snapshot(
        &self,
        snapshot: &crate::insights::PlayerInsightsSnapshot
    ) -> Result<(), DomainError>;

    async fn get_insight_snapshot(
        &self,
        organization_id: &OrganizationId,
        player_id: &PlayerId
    ) -> Result<Option<crate::insights::PlayerInsightsSnapshot>, DomainError>;

    /// The most recent `PairSynergyHistory` row for `(ladder_id, pair_key)`
    /// with `applied_at < before`, or `None` if the pair has no history
    /// before that point. Used by replay (C6) to seed pair γ from the state
    /// just before the replay window instead of resetting it to default.
    async fn latest_pair_synergy_before(
        &self,
        ladder_id: &LadderId,
        pair_key: &PairKey,
        before: DateTime<Utc>
    ) -> Result<Option<PairSynergy>, DomainError>;

    /// Cached response for a previous `record_match` call made with this
    /// `idempotency_key`, if any. The record is transient: callers are
    /// expected to prune old keys out of band, this layer has no TTL logic.
    async fn get_cached_ingest_response(
        &self,
        organization_id: &OrganizationId,
        idempotency_key: &str
    ) -> Result<Option<crate::ingestion::IngestOutcome>, DomainError>;

    async fn put_cached_ingest_response(
        &self,
        organization_id: &OrganizationId,
        idempotency_key: &str,
        outcome: &crate::ingestion::IngestOutcome
    ) -> Result<(), DomainError>;
}

/// Runtime choice between [`MemoryStore`] and [`PostgresStore`], selected at
/// startup from configuration. `RatingStore`'s `async fn`s aren't `dyn`-safe, so
/// this delegates by matching instead of boxing a trait object.
pub enum StoreHandle {
    Memory(memory::MemoryStore),
    Postgres(postgres::PostgresStore)
}

macro_rules! delegate {
    ($self:ident, $method:ident($($arg:expr),*)) => {
        match $self {
            StoreHandle::Memory(s) => s.$method($($arg),*).await,
            StoreHandle::Postgres(s) => s.$method($($arg),*).await
        }
    };
}

impl RatingStore for StoreHandle {
    async fn get_organization(&self, organization_id: &OrganizationId) -> Result<Option<Organization>, DomainError> {
        delegate!(self, get_organization(organization_id))
    }

    async fn get_players(
        &self,
        organization_id: &OrganizationId,
        player_ids: &[PlayerId]
    ) -> Result<Vec<Player>, DomainError> {
        delegate!(self, get_players(organization_id, player_ids))
    }

    async fn get_players_any_organization(&self, player_ids: &[PlayerId]) -> Result<Vec<Player>, DomainError> {
        delegate!(self, get_players_any_organization(player_ids))
    }

    async fn get_or_create_ladder(&self, key: &LadderKey) -> Result<Ladder, DomainError> {
        delegate!(self, get_or_create_ladder(key))
    }

    async fn get_ratings(
        &self,
        ladder_id: &LadderId,
        player_ids: &[PlayerId]
    ) -> Result<BTreeMap<PlayerId, RatingState>, DomainError> {
        delegate!(self, get_ratings(ladder_id, player_ids))
    }

    async fn get_pair_synergies(
        &self,
        ladder_id: &LadderId,
        pairs: &[PairKey]
    ) -> Result<BTreeMap<PairKey, PairSynergy>, DomainError> {
        delegate!(self, get_pair_synergies(ladder_id, pairs))
    }

    async fn record_rated_match(
        &self,
        ladder_id: &LadderId,
        organization_id: &OrganizationId,
        match_id: MatchId,
        applied_at: DateTime<Utc>,
        mov_weight: f64,
        outcome: &UpdateOutcome
    ) -> Result<Vec<RatingEventRow>, DomainError> {
        delegate!(
            self,
            record_rated_match(ladder_id, organization_id, match_id, applied_at, mov_weight, outcome)
        )
    }

    async fn get_replay_queue_entry(&self, ladder_id: &LadderId) -> Result<Option<ReplayQueueEntry>, DomainError> {
        delegate!(self, get_replay_queue_entry(ladder_id))
    }

    async fn upsert_replay_queue_entry(
        &self,
        ladder_id: &LadderId,
        earliest_start_time: DateTime<Utc>
    ) -> Result<(), DomainError> {
        delegate!(self, upsert_replay_queue_entry(ladder_id, earliest_start_time))
    }

    async fn delete_replay_queue_entry(&self, ladder_id: &LadderId) -> Result<(), DomainError> {
        delegate!(self, delete_replay_queue_entry(ladder_id))
    }

    async fn matches_from(&self, ladder_id: &LadderId, from: DateTime<Utc>) -> Result<Vec<types::Match>, DomainError> {
        delegate!(self, matches_from(ladder_id, from))
    }

    async fn insert_match(&self, m: &types::Match) -> Result<(), DomainError> {
        delegate!(self, insert_match(m))
    }

    async fn latest_rating_event_before(
        &self,
        ladder_id: &LadderId,
        player_id: &PlayerId,
        before: DateTime<Utc>
    ) -> Result<Option<RatingEventRow>, DomainError> {
        delegate!(self, latest_rating_event_before(ladder_id, player_id, before))
    }

    async fn latest_rating_event_as_of(
        &self,
        ladder_id: &LadderId,
        player_id: &PlayerId,
        as_of: DateTime<Utc>
    ) -> Result<Option<RatingEventRow>, DomainError> {
        delegate!(self, latest_rating_event_as_of(ladder_id, player_id, as_of))
    }

    async fn delete_rating_history_from(&self, ladder_id: &LadderId, from: DateTime<Utc>) -> Result<(), DomainError> {
        delegate!(self, delete_rating_history_from(ladder_id, from))
    }

    async fn set_player_rating(
        &self,
        ladder_id: &LadderId,
        player_id: &PlayerId,
        state: RatingState
    ) -> Result<(), DomainError> {
        delegate!(self, set_player_rating(ladder_id, player_id, state))
    }

    async fn set_pair_synergy(
        &self,
        ladder_id: &LadderId,
        pair_key: &PairKey,
        synergy: PairSynergy
    ) -> Result<(), DomainError> {
        delegate!(self, set_pair_synergy(ladder_id, pair_key, synergy))
    }

    async fn list_leaderboard(
        &self,
        ladder_id: &LadderId,
        cursor: Option<LeaderboardCursor>,
        limit: usize
    ) -> Result<Vec<PlayerRating>, DomainError> {
        delegate!(self, list_leaderboard(ladder_id, cursor, limit))
    }

    async fn get_player_rank(&self, ladder_id: &LadderId, player_id: &PlayerId) -> Result<Option<u32>, DomainError> {
        delegate!(self, get_player_rank(ladder_id, player_id))
    }

    async fn rank_for_mu(&self, ladder_id: &LadderId, mu: f64) -> Result<u32, DomainError> {
        delegate!(self, rank_for_mu(ladder_id, mu))
    }

    async fn player_history(
        &self,
        organization_id: &OrganizationId,
        player_id: &PlayerId
    ) -> Result<Vec<RatingEventRow>, DomainError> {
        delegate!(self, player_history(organization_id, player_id))
    }

    async fn upsert_insight_snapshot(
        &self,
        snapshot: &crate::insights::PlayerInsightsSnapshot
    ) -> Result<(), DomainError> {
        delegate!(self, upsert_insight_snapshot(snapshot))
    }

    async fn get_insight_snapshot(
        &self,
        organization_id: &OrganizationId,
        player_id: &PlayerId
    ) -> Result<Option<crate::insights::PlayerInsightsSnapshot>, DomainError> {
        delegate!(self, get_insight_snapshot(organization_id, player_id))
    }

    async fn latest_pair_synergy_before(
        &self,
        ladder_id: &LadderId,
        pair_key: &PairKey,
        before: DateTime<Utc>
    ) -> Result<Option<PairSynergy>, DomainError> {
        delegate!(self, latest_pair_synergy_before(ladder_id, pair_key, before))
    }

    async fn get_cached_ingest_response(
        &self,
        organization_id: &OrganizationId,
        idempotency_key: &str
    ) -> Result<Option<crate::ingestion::IngestOutcome>, DomainError> {
        delegate!(self, get_cached_ingest_response(organization_id, idempotency_key))
    }

    async fn put_cached_ingest_response(
        &self,
        organization_id: &OrganizationId,
        idempotency_key: &str,
        outcome: &crate::ingestion::IngestOutcome
    ) -> Result<(), DomainError> {
        delegate!(self, put_cached_ingest_response(organization_id, idempotency_key, outcome))
    }
}
