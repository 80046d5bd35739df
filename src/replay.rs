//! C6 — replay engine. No teacher analogue exists (its pipeline runs once,
//! forward, over a fixed batch); the chronological-walk-and-reapply shape is
//! grounded on `model/otr_model.rs::process`'s "iterate matches in order,
//! mutate tracker state match by match", generalized to start from an
//! arbitrary `t0` instead of the start of history.

use crate::error::DomainError;
use crate::params::RatingParameters;
use crate::rating::{self, MatchInput};
use crate::store::types::{LadderId, PairKey, PlayerId, RatingState, Side};
use crate::store::RatingStore;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayReport {
    pub ladder_id: LadderId,
    pub replay_from: DateTime<Utc>,
    pub replay_to: Option<DateTime<Utc>>,
    pub matches_processed: usize,
    pub players_touched: usize,
    pub pair_updates: usize
}

/// `(ladder_id, from?, dry_run)`. `from` overrides the
/// stored `ReplayQueueEntry` (used by `PATCH /v1/matches/:id` when a
/// `start_time` edit perturbs history directly).
pub async fn process_replay<S: RatingStore>(
    store: &S,
    params: &RatingParameters,
    ladder_id: &LadderId,
    from: Option<DateTime<Utc>>,
    dry_run: bool
) -> Result<Option<ReplayReport>, DomainError> {
    let t0 = match from {
        Some(t) => t,
        None => match store.get_replay_queue_entry(ladder_id).await? {
            Some(entry) => entry.earliest_start_time,
            None => return Ok(None)
        }
    };

    let matches = store.matches_from(ladder_id, t0).await?;
    if matches.is_empty() {
        if !dry_run {
            store.delete_replay_queue_entry(ladder_id).await?;
        }
        return Ok(Some(ReplayReport {
            ladder_id: ladder_id.clone(),
            replay_from: t0,
            replay_to: None,
            matches_processed: 0,
            players_touched: 0,
            pair_updates: 0
        }));
    }

    let mut touched_players: BTreeSet<PlayerId> = BTreeSet::new();
    for m in &matches {
        touched_players.extend(m.all_players());
    }

    // `get_ratings` still reflects the pre-revert state, so its `matches_count`
    // covers all of a player's history through "now". Subtracting the matches
    // being replayed (all of which are >= t0) leaves the count as of just
    // before t0, mirroring how pair synergy is seeded below.
    let current_ratings =
        store.get_ratings(ladder_id, &touched_players.iter().cloned().collect::<Vec<_>>()).await?;
    let mut ratings: BTreeMap<PlayerId, RatingState> = BTreeMap::new();
    for player_id in &touched_players {
        let matches_from_t0 = matches.iter().filter(|m| m.all_players().contains(player_id)).count() as u32;
        let state = match store.latest_rating_event_before(ladder_id, player_id, t0).await? {
            Some(event) => {
                let matches_count = current_ratings
                    .get(player_id)
                    .map(|r| r.matches_count.saturating_sub(matches_from_t0))
                    .unwrap_or(0);
                RatingState { mu: event.mu_after, sigma: event.sigma_after, matches_count }
            }
            None => RatingState::baseline(params)
        };
        ratings.insert(player_id.clone(), state);
    }

    let mut touched_pairs: BTreeSet<PairKey> = BTreeSet::new();
    for m in &matches {
        for side in [Side::A, Side::B] {
            let players = m.players_on(side);
            if players.len() == 2 {
                touched_pairs.insert(PairKey::new(players[0].clone(), players[1].clone()));
            }
        }
    }

    // Seeded from the pair's state just before `t0`, mirroring how `ratings`
    // is seeded above, so a pair already past its activation threshold
    // doesn't get reset to un-activated by a replay that starts mid-history.
    let mut pairs: BTreeMap<PairKey, crate::store::types::PairSynergy> = BTreeMap::new();
    for pair_key in &touched_pairs {
        let synergy = store.latest_pair_synergy_before(ladder_id, pair_key, t0).await?.unwrap_or_default();
        pairs.insert(pair_key.clone(), synergy);
    }

    if !dry_run {
        store.delete_rating_history_from(ladder_id, t0).await?;
    }

    let mut pair_update_count = 0usize;
    let mut last_start_time = t0;

    for m in &matches {
        last_start_time = m.start_time;
        if m.games.is_empty() {
            continue;
        }

        let raw_games: Vec<crate::normalize::RawGameScore> =
            m.games.iter().map(|g| crate::normalize::RawGameScore { game_no: g.game_no, a: g.a, b: g.b }).collect();
        let winner = match crate::normalize::derive_winner(&raw_games) {
            Ok(w) => w,
            Err(_) => continue
        };
        let mov_weight = crate::normalize::mov_weight_from_margins(&raw_games, params);
        let base_step = params.base_step_for(&m.sport, &m.discipline, &m.format);

        let input = MatchInput { side_a: m.side_a.clone(), side_b: m.side_b.clone(), winner, mov_weight, base_step };
        let outcome = rating::update_match(&input, &ratings, &pairs, params);

        for (player_id, delta) in &outcome.per_player {
            ratings.insert(
                player_id.clone(),
                RatingState { mu: delta.mu_after, sigma: delta.sigma_after, matches_count: ratings[player_id].matches_count + 1 }
            );
        }
        for (pair_key, pair_delta) in &outcome.pair_updates {
            pairs.insert(
                pair_key.clone(),
                crate::store::types::PairSynergy { gamma: pair_delta.gamma_after, matches: pair_delta.matches_after }
            );
            pair_update_count += 1;
        }

        if !dry_run {
            store
                .record_rated_match(ladder_id, &m.organization_id, m.match_id, m.start_time, mov_weight, &outcome)
                .await?;
        }
    }

    if !dry_run {
        for (player_id, state) in &ratings {
            store.set_player_rating(ladder_id, player_id, *state).await?;
        }
        for (pair_key, synergy) in &pairs {
            store.set_pair_synergy(ladder_id, pair_key, *synergy).await?;
        }
        store.delete_replay_queue_entry(ladder_id).await?;
    }

    Ok(Some(ReplayReport {
        ladder_id: ladder_id.clone(),
        replay_from: t0,
        replay_to: Some(last_start_time),
        matches_processed: matches.len(),
        players_touched: touched_players.len(),
        pair_updates: pair_update_count
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::{record_match, AllowAll, Submission};
    use crate::jobs::memory::MemoryJobStore;
    use crate::normalize::{FormatRegistry, RawGameScore, RawSubmission};
    use crate::store::memory::MemoryStore;
    use crate::store::types::{LadderKey, Organization, OrganizationId, Player, PlayerId, ProviderId};

    fn setup() -> (MemoryStore, MemoryJobStore, OrganizationId, ProviderId, RatingParameters, FormatRegistry) {
        let store = MemoryStore::new(RatingParameters::default());
        let org_id = OrganizationId::from("org-1");
        store.seed_organization(Organization { organization_id: org_id.clone(), slug: "org-1".to_string() });
        for id in ["a", "b"] {
            store.seed_player(Player::new(PlayerId::from(id), org_id.clone(), id.to_string(), None, None).unwrap());
        }
        (store, MemoryJobStore::new(), org_id, ProviderId::from("demo"), RatingParameters::default(), FormatRegistry::default())
    }

    fn submission(start_time: DateTime<Utc>, a: i32, b: i32) -> Submission {
        Submission {
            raw: RawSubmission {
                sport: "BADMINTON".to_string(),
                discipline: "SINGLES".to_string(),
                format: "BO3_21RALLY".to_string(),
                side_a: vec![PlayerId::from("a")],
                side_b: vec![PlayerId::from("b")],
                games: vec![RawGameScore { game_no: 1, a, b }, RawGameScore { game_no: 2, a, b }]
            },
            start_time,
            tier: "UNSPECIFIED".to_string(),
            region_id: "GLOBAL".to_string(),
            event_id: None,
            competition_id: None,
            external_ref: None,
            venue_id: None,
            idempotency_key: None
        }
    }

    fn t(days: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-09-20T08:00:00Z").unwrap().with_timezone(&Utc) + chrono::Duration::days(days)
    }

    #[tokio::test]
    async fn replay_detection_dry_run_does_not_clear_queue() {
        let (store, jobs, org_id, provider_id, params, registry) = setup();
        record_match(&store, &jobs, &AllowAll, &registry, &params, submission(t(2), 21, 15), provider_id.clone(), org_id.clone()).await.unwrap();
        record_match(&store, &jobs, &AllowAll, &registry, &params, submission(t(3), 21, 15), provider_id.clone(), org_id.clone()).await.unwrap();
        record_match(&store, &jobs, &AllowAll, &registry, &params, submission(t(1), 21, 15), provider_id, org_id.clone()).await.unwrap();

        let ladder = store.get_or_create_ladder(&LadderKey::new(org_id, "BADMINTON", "SINGLES", "BO3_21RALLY")).await.unwrap();
        let report = process_replay(&store, &params, &ladder.ladder_id, None, true).await.unwrap().unwrap();

        assert_eq!(report.matches_processed, 3);
        assert_eq!(report.replay_from, t(1));
        assert!(store.get_replay_queue_entry(&ladder.ladder_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn partial_replay_preserves_matches_count_from_before_the_window() {
        let (store, jobs, org_id, provider_id, params, registry) = setup();
        record_match(&store, &jobs, &AllowAll, &registry, &params, submission(t(1), 21, 15), provider_id.clone(), org_id.clone()).await.unwrap();
        record_match(&store, &jobs, &AllowAll, &registry, &params, submission(t(3), 21, 15), provider_id.clone(), org_id.clone()).await.unwrap();
        // Arrives after t(3) was already ingested but dated before it: perturbs the ladder from t(2)
        // onward, leaving the t(1) match untouched.
        record_match(&store, &jobs, &AllowAll, &registry, &params, submission(t(2), 21, 15), provider_id, org_id.clone()).await.unwrap();

        let ladder = store.get_or_create_ladder(&LadderKey::new(org_id, "BADMINTON", "SINGLES", "BO3_21RALLY")).await.unwrap();
        let report = process_replay(&store, &params, &ladder.ladder_id, None, false).await.unwrap().unwrap();
        assert_eq!(report.matches_processed, 2, "only the t(2) and t(3) matches fall on/after the replay window");

        let ratings = store.get_ratings(&ladder.ladder_id, &[PlayerId::from("a"), PlayerId::from("b")]).await.unwrap();
        assert_eq!(ratings[&PlayerId::from("a")].matches_count, 3, "the t(1) match must still count toward lifetime matches_count");
        assert_eq!(ratings[&PlayerId::from("b")].matches_count, 3);
    }

    #[tokio::test]
    async fn replay_correctness_matches_chronological_ingest() {
        let (store, jobs, org_id, provider_id, params, registry) = setup();
        record_match(&store, &jobs, &AllowAll, &registry, &params, submission(t(2), 21, 15), provider_id.clone(), org_id.clone()).await.unwrap();
        record_match(&store, &jobs, &AllowAll, &registry, &params, submission(t(3), 21, 10), provider_id.clone(), org_id.clone()).await.unwrap();
        record_match(&store, &jobs, &AllowAll, &registry, &params, submission(t(1), 21, 18), provider_id.clone(), org_id.clone()).await.unwrap();

        let ladder_key = LadderKey::new(org_id.clone(), "BADMINTON", "SINGLES", "BO3_21RALLY");
        let ladder = store.get_or_create_ladder(&ladder_key).await.unwrap();
        process_replay(&store, &params, &ladder.ladder_id, None, false).await.unwrap();

        let replayed_a = store.get_ratings(&ladder.ladder_id, &[PlayerId::from("a")]).await.unwrap();

        // Build a second, fresh ladder by ingesting the same three matches
        // directly in chronological order.
        let store2 = MemoryStore::new(RatingParameters::default());
        store2.seed_organization(Organization { organization_id: org_id.clone(), slug: "org-1".to_string() });
        for id in ["a", "b"] {
            store2.seed_player(Player::new(PlayerId::from(id), org_id.clone(), id.to_string(), None, None).unwrap());
        }
        let jobs2 = MemoryJobStore::new();
        record_match(&store2, &jobs2, &AllowAll, &registry, &params, submission(t(1), 21, 18), ProviderId::from("demo"), org_id.clone()).await.unwrap();
        record_match(&store2, &jobs2, &AllowAll, &registry, &params, submission(t(2), 21, 15), ProviderId::from("demo"), org_id.clone()).await.unwrap();
        record_match(&store2, &jobs2, &AllowAll, &registry, &params, submission(t(3), 21, 10), ProviderId::from("demo"), org_id.clone()).await.unwrap();
        let ladder2 = store2.get_or_create_ladder(&ladder_key).await.unwrap();
        let chronological_a = store2.get_ratings(&ladder2.ladder_id, &[PlayerId::from("a")]).await.unwrap();

        let replayed = replayed_a[&PlayerId::from("a")];
        let chronological = chronological_a[&PlayerId::from("a")];
        assert!((replayed.mu - chronological.mu).abs() < 1e-6);
        assert!((replayed.sigma - chronological.sigma).abs() < 1e-6);

        let dry_run_after = process_replay(&store, &params, &ladder.ladder_id, None, true).await.unwrap();
        assert!(dry_run_after.is_none());
    }
}
