//! In-memory `RatingStore`, used by unit/scenario tests. Bookkeeping style:
//! an `IndexMap` leaderboard kept sorted after every write via
//! insert-then-explicit-`sort()`, plus a separate ordered history map.

use super::types::{
    Ladder, LadderId, LadderKey, Match, MatchId, Organization, OrganizationId, PairKey, PairSynergy, Player,
    PlayerId, PlayerRating, RatingEventId, RatingEventRow, RatingState, ReplayQueueEntry
};
use super::LeaderboardCursor;
use crate::error::DomainError;
use crate::params::RatingParameters;
use crate::rating::UpdateOutcome;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
struct State {
    organizations: BTreeMap<OrganizationId, Organization>,
    players: BTreeMap<PlayerId, Player>,
    ladders: BTreeMap<LadderId, Ladder>,
    ladders_by_key: BTreeMap<String, LadderId>,
    // Leaderboard per ladder, kept in IndexMap insertion order and re-sorted
    // after every write, mirroring RatingTracker::sort().
    ratings: BTreeMap<LadderId, IndexMap<PlayerId, PlayerRating>>,
    pair_synergies: BTreeMap<LadderId, BTreeMap<PairKey, PairSynergy>>,
    pair_synergy_history: BTreeMap<LadderId, Vec<(PairKey, DateTime<Utc>, PairSynergy)>>,
    matches: BTreeMap<LadderId, Vec<Match>>,
    rating_events: BTreeMap<LadderId, Vec<RatingEventRow>>,
    replay_queue: BTreeMap<LadderId, ReplayQueueEntry>,
    insight_snapshots: BTreeMap<(OrganizationId, PlayerId), crate::insights::PlayerInsightsSnapshot>,
    idempotency_cache: BTreeMap<(OrganizationId, String), crate::ingestion::IngestOutcome>
}

pub struct MemoryStore {
    state: Mutex<State>,
    params: RatingParameters
}

impl MemoryStore {
    pub fn new(params: RatingParameters) -> Self {
        MemoryStore { state: Mutex::new(State::default()), params }
    }

    pub fn seed_organization(&self, org: Organization) {
        self.state.lock().unwrap().organizations.insert(org.organization_id.clone(), org);
    }

    pub fn seed_player(&self, player: Player) {
        self.state.lock().unwrap().players.insert(player.player_id.clone(), player);
    }

    fn ladder_key_str(key: &LadderKey) -> String {
        format!(
            "{}/{}/{}/{}/{}/{}",
            key.organization_id, key.sport, key.discipline, key.format, key.tier, key.region_id
        )
    }

    fn sort_leaderboard(board: &mut IndexMap<PlayerId, PlayerRating>) {
        board.sort_by(|_, a, _, b| b.mu.partial_cmp(&a.mu).unwrap().then_with(|| a.player_id.cmp(&b.player_id)));
    }
}

impl super::RatingStore for MemoryStore {
    async fn get_organization(&self, organization_id: &OrganizationId) -> Result<Option<Organization>, DomainError> {
        Ok(self.state.lock().unwrap().organizations.get(organization_id).cloned())
    }

    async fn get_players(
        &self,
        organization_id: &OrganizationId,
        player_ids: &[PlayerId]
    ) -> Result<Vec<Player>, DomainError> {
        let state = self.state.lock().unwrap();
        Ok(player_ids
            .iter()
            .filter_map(|id| state.players.get(id))
            .filter(|p| &p.organization_id == organization_id)
            .cloned()
            .collect())
    }

    async fn get_players_any_organization(&self, player_ids: &[PlayerId]) -> Result<Vec<Player>, DomainError> {
        let state = self.state.lock().unwrap();
        Ok(player_ids.iter().filter_map(|id| state.players.get(id)).cloned().collect())
    }

    async fn get_or_create_ladder(&self, key: &LadderKey) -> Result<Ladder, DomainError> {
        let mut state = self.state.lock().unwrap();
        let key_str = Self::ladder_key_str(key);
        if let Some(id) = state.ladders_by_key.get(&key_str) {
            return Ok(state.ladders[id].clone());
        }
        let ladder_id = LadderId(key_str.clone());
        let ladder = Ladder { ladder_id: ladder_id.clone(), key: key.clone(), age_policy: None };
        state.ladders.insert(ladder_id.clone(), ladder.clone());
        state.ladders_by_key.insert(key_str, ladder_id);
        Ok(ladder)
    }

    async fn get_ratings(
        &self,
        ladder_id: &LadderId,
        player_ids: &[PlayerId]
    ) -> Result<BTreeMap<PlayerId, RatingState>, DomainError> {
        let state = self.state.lock().unwrap();
        let board = state.ratings.get(ladder_id);
        Ok(player_ids
            .iter()
            .map(|id| {
                let rating = board.and_then(|b| b.get(id));
                let rating_state = match rating {
                    Some(r) => RatingState { mu: r.mu, sigma: r.sigma, matches_count: r.matches_count },
                    None => RatingState::baseline(&self.params)
                };
                (id.clone(), rating_state)
            })
            .collect())
    }

    async fn get_pair_synergies(
        &self,
        ladder_id: &LadderId,
        pairs: &[PairKey]
    ) -> Result<BTreeMap<PairKey, PairSynergy>, DomainError> {
        let state = self.state.lock().unwrap();
        let map = state.pair_synergies.get(ladder_id);
        Ok(pairs
            .iter()
            .map(|p| (p.clone(), map.and_then(|m| m.get(p)).copied().unwrap_or_default()))
            .collect())
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
        let mut state = self.state.lock().unwrap();
        let mut events = Vec::new();

        for (player_id, delta) in &outcome.per_player {
            let board = state.ratings.entry(ladder_id.clone()).or_default();
            let entry = board.entry(player_id.clone()).or_insert_with(|| PlayerRating {
                player_id: player_id.clone(),
                ladder_id: ladder_id.clone(),
                mu: delta.mu_before,
                sigma: delta.sigma_before,
                matches_count: 0
            });
            entry.mu = delta.mu_after;
            entry.sigma = delta.sigma_after;
            entry.matches_count += 1;

            events.push(RatingEventRow {
                rating_event_id: RatingEventId::new(),
                organization_id: organization_id.clone(),
                player_id: player_id.clone(),
                ladder_id: ladder_id.clone(),
                match_id,
                applied_at,
                mu_before: delta.mu_before,
                mu_after: delta.mu_after,
                delta: delta.delta,
                sigma_before: delta.sigma_before,
                sigma_after: delta.sigma_after,
                win_probability_pre: delta.win_probability_pre,
                opponent_mu_before: delta.opponent_mu_before,
                mov_weight
            });
        }

        if let Some(board) = state.ratings.get_mut(ladder_id) {
            Self::sort_leaderboard(board);
        }

        for (pair_key, pair_delta) in &outcome.pair_updates {
            let synergy = PairSynergy { gamma: pair_delta.gamma_after, matches: pair_delta.matches_after };
            let synergies = state.pair_synergies.entry(ladder_id.clone()).or_default();
            synergies.insert(pair_key.clone(), synergy);
            state.pair_synergy_history.entry(ladder_id.clone()).or_default().push((
                pair_key.clone(),
                applied_at,
                synergy
            ));
        }

        state.rating_events.entry(ladder_id.clone()).or_default().extend(events.clone());
        Ok(events)
    }

    async fn get_replay_queue_entry(&self, ladder_id: &LadderId) -> Result<Option<ReplayQueueEntry>, DomainError> {
        Ok(self.state.lock().unwrap().replay_queue.get(ladder_id).cloned())
    }

    async fn upsert_replay_queue_entry(
        &self,
        ladder_id: &LadderId,
        earliest_start_time: DateTime<Utc>
    ) -> Result<(), DomainError> {
        let mut state = self.state.lock().unwrap();
        let now = earliest_start_time;
        state
            .replay_queue
            .entry(ladder_id.clone())
            .and_modify(|e| {
                if earliest_start_time < e.earliest_start_time {
                    e.earliest_start_time = earliest_start_time;
                }
                e.updated_at = now;
            })
            .or_insert(ReplayQueueEntry {
                ladder_id: ladder_id.clone(),
                earliest_start_time,
                created_at: now,
                updated_at: now
            });
        Ok(())
    }

    async fn delete_replay_queue_entry(&self, ladder_id: &LadderId) -> Result<(), DomainError> {
        self.state.lock().unwrap().replay_queue.remove(ladder_id);
        Ok(())
    }

    async fn matches_from(&self, ladder_id: &LadderId, from: DateTime<Utc>) -> Result<Vec<Match>, DomainError> {
        let state = self.state.lock().unwrap();
        let mut matches: Vec<Match> = state
            .matches
            .get(ladder_id)
            .map(|v| v.iter().filter(|m| m.start_time >= from).cloned().collect())
            .unwrap_or_default();
        matches.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.match_id.cmp(&b.match_id)));
        Ok(matches)
    }

    async fn insert_match(&self, m: &Match) -> Result<(), DomainError> {
        self.state.lock().unwrap().matches.entry(m.ladder_id.clone()).or_default().push(m.clone());
        Ok(())
    }

    async fn latest_rating_event_before(
        &self,
        ladder_id: &LadderId,
        player_id: &PlayerId,
        before: DateTime<Utc>
    ) -> Result<Option<RatingEventRow>, DomainError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .rating_events
            .get(ladder_id)
            .into_iter()
            .flatten()
            .filter(|e| &e.player_id == player_id && e.applied_at < before)
            .max_by_key(|e| (e.applied_at, e.rating_event_id))
            .cloned())
    }

    async fn latest_rating_event_as_of(
        &self,
        ladder_id: &LadderId,
        player_id: &PlayerId,
        as_of: DateTime<Utc>
    ) -> Result<Option<RatingEventRow>, DomainError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .rating_events
            .get(ladder_id)
            .into_iter()
            .flatten()
            .filter(|e| &e.player_id == player_id && e.applied_at <= as_of)
            .max_by_key(|e| (e.applied_at, e.rating_event_id))
            .cloned())
    }

    async fn delete_rating_history_from(&self, ladder_id: &LadderId, from: DateTime<Utc>) -> Result<(), DomainError> {
        let mut state = self.state.lock().unwrap();
        if let Some(events) = state.rating_events.get_mut(ladder_id) {
            events.retain(|e| e.applied_at < from);
        }
        if let Some(history) = state.pair_synergy_history.get_mut(ladder_id) {
            history.retain(|(_, applied_at, _)| *applied_at < from);
        }
        Ok(())
    }

    async fn set_player_rating(
        &self,
        ladder_id: &LadderId,
        player_id: &PlayerId,
        rating_state: RatingState
    ) -> Result<(), DomainError> {
        let mut state = self.state.lock().unwrap();
        let board = state.ratings.entry(ladder_id.clone()).or_default();
        board.insert(
            player_id.clone(),
            PlayerRating {
                player_id: player_id.clone(),
                ladder_id: ladder_id.clone(),
                mu: rating_state.mu,
                sigma: rating_state.sigma,
                matches_count: rating_state.matches_count
            }
        );
        Self::sort_leaderboard(board);
        Ok(())
    }

    async fn set_pair_synergy(
        &self,
        ladder_id: &LadderId,
        pair_key: &PairKey,
        synergy: PairSynergy
    ) -> Result<(), DomainError> {
        self.state
            .lock()
            .unwrap()
            .pair_synergies
            .entry(ladder_id.clone())
            .or_default()
            .insert(pair_key.clone(), synergy);
        Ok(())
    }

    async fn list_leaderboard(
        &self,
        ladder_id: &LadderId,
        cursor: Option<LeaderboardCursor>,
        limit: usize
    ) -> Result<Vec<PlayerRating>, DomainError> {
        let state = self.state.lock().unwrap();
        let board = match state.ratings.get(ladder_id) {
            Some(b) => b,
            None => return Ok(Vec::new())
        };
        let mut rows: Vec<&PlayerRating> = board.values().collect();
        rows.sort_by(|a, b| b.mu.partial_cmp(&a.mu).unwrap().then_with(|| a.player_id.cmp(&b.player_id)));

        let start = match &cursor {
            Some(c) => rows
                .iter()
                .position(|r| r.mu < c.mu || (r.mu == c.mu && r.player_id > c.player_id))
                .unwrap_or(rows.len()),
            None => 0
        };

        Ok(rows.into_iter().skip(start).take(limit).cloned().collect())
    }

    async fn get_player_rank(&self, ladder_id: &LadderId, player_id: &PlayerId) -> Result<Option<u32>, DomainError> {
        let state = self.state.lock().unwrap();
        let board = match state.ratings.get(ladder_id) {
            Some(b) => b,
            None => return Ok(None)
        };
        if !board.contains_key(player_id) {
            return Ok(None);
        }
        let mut rows: Vec<&PlayerRating> = board.values().collect();
        rows.sort_by(|a, b| b.mu.partial_cmp(&a.mu).unwrap().then_with(|| a.player_id.cmp(&b.player_id)));
        Ok(rows.iter().position(|r| &r.player_id == player_id).map(|pos| pos as u32 + 1))
    }

    async fn rank_for_mu(&self, ladder_id: &LadderId, mu: f64) -> Result<u32, DomainError> {
        let state = self.state.lock().unwrap();
        let better = match state.ratings.get(ladder_id) {
            Some(board) => board.values().filter(|r| r.mu > mu).count(),
            None => 0
        };
        Ok(better as u32 + 1)
    }

    async fn player_history(
        &self,
        organization_id: &OrganizationId,
        player_id: &PlayerId
    ) -> Result<Vec<RatingEventRow>, DomainError> {
        let state = self.state.lock().unwrap();
        let mut events: Vec<RatingEventRow> = state
            .rating_events
            .values()
            .flatten()
            .filter(|e| &e.organization_id == organization_id && &e.player_id == player_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.applied_at.cmp(&b.applied_at).then_with(|| a.rating_event_id.cmp(&b.rating_event_id)));
        Ok(events)
    }

    async fn upsert_insight_snapshot(&self, snapshot: &crate::insights::PlayerInsightsSnapshot) -> Result<(), DomainError> {
        let key = (snapshot.organization_id.clone(), snapshot.player_id.clone());
        self.state.lock().unwrap().insight_snapshots.insert(key, snapshot.clone());
        Ok(())
    }

    async fn get_insight_snapshot(
        &self,
        organization_id: &OrganizationId,
        player_id: &PlayerId
    ) -> Result<Option<crate::insights::PlayerInsightsSnapshot>, DomainError> {
        let key = (organization_id.clone(), player_id.clone());
        Ok(self.state.lock().unwrap().insight_snapshots.get(&key).cloned())
    }

    async fn latest_pair_synergy_before(
        &self,
        ladder_id: &LadderId,
        pair_key: &PairKey,
        before: DateTime<Utc>
    ) -> Result<Option<PairSynergy>, DomainError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pair_synergy_history
            .get(ladder_id)
            .into_iter()
            .flatten()
            .filter(|(key, applied_at, _)| key == pair_key && *applied_at < before)
            .max_by_key(|(_, applied_at, _)| *applied_at)
            .map(|(_, _, synergy)| *synergy))
    }

    async fn get_cached_ingest_response(
        &self,
        organization_id: &OrganizationId,
        idempotency_key: &str
    ) -> Result<Option<crate::ingestion::IngestOutcome>, DomainError> {
        let key = (organization_id.clone(), idempotency_key.to_string());
        Ok(self.state.lock().unwrap().idempotency_cache.get(&key).cloned())
    }

    async fn put_cached_ingest_response(
        &self,
        organization_id: &OrganizationId,
        idempotency_key: &str,
        outcome: &crate::ingestion::IngestOutcome
    ) -> Result<(), DomainError> {
        let key = (organization_id.clone(), idempotency_key.to_string());
        self.state.lock().unwrap().idempotency_cache.insert(key, outcome.clone());
        Ok(())
    }
}
