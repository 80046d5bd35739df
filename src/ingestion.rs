//! C5 — ingestion coordinator. `record_match` orchestrates C2 (normalize) →
//! C3 (rate) → C4 (persist) as one logical unit: fetch current state,
//! compute the update, save it, all inside one logical transaction.

use crate::error::DomainError;
use crate::jobs::JobStore;
use crate::normalize::{FormatRegistry, NormalizedMatch, RawSubmission};
use crate::params::RatingParameters;
use crate::rating::{self, MatchInput};
use crate::store::types::{
    GameScoreLine, JobKind, LadderKey, Match, MatchId, OrganizationId, PairKey, PlayerId, ProviderId, RatingEventRow,
    RatingStatus, Side
};
use crate::store::RatingStore;
use chrono::{DateTime, Utc};

/// Gate checked before any state is touched. The core
/// ships a permissive no-op; the HTTP edge supplies a real JWT/grants
/// implementation — this crate never inspects tokens itself.
pub trait AuthorizationGate: Send + Sync {
    fn authorize(&self, organization_id: &OrganizationId, sport: &str, region_id: &str) -> Result<(), DomainError>;
}

pub struct AllowAll;

impl AuthorizationGate for AllowAll {
    fn authorize(&self, _organization_id: &OrganizationId, _sport: &str, _region_id: &str) -> Result<(), DomainError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IngestOutcome {
    pub match_id: MatchId,
    pub rating_events: Vec<RatingEventRow>
}

/// `start_time` and routing metadata the HTTP edge has already parsed off
/// the raw submission body but that C2/C3 don't need.
pub struct Submission {
    pub raw: RawSubmission,
    pub start_time: DateTime<Utc>,
    pub tier: String,
    pub region_id: String,
    pub event_id: Option<String>,
    pub competition_id: Option<String>,
    pub external_ref: Option<String>,
    pub venue_id: Option<String>,
    /// Optional `Idempotency-Key` header value. A repeat `record_match` call
    /// with the same key (within an organization) returns the cached
    /// `IngestOutcome` instead of re-running normalize/rate/persist.
    pub idempotency_key: Option<String>
}

pub async fn record_match<S: RatingStore, J: JobStore>(
    store: &S,
    job_store: &J,
    auth: &dyn AuthorizationGate,
    registry: &FormatRegistry,
    params: &RatingParameters,
    submission: Submission,
    provider_id: ProviderId,
    organization_id: OrganizationId
) -> Result<IngestOutcome, DomainError> {
    if let Some(key) = &submission.idempotency_key {
        if let Some(cached) = store.get_cached_ingest_response(&organization_id, key).await? {
            return Ok(cached);
        }
    }

    let organization = store
        .get_organization(&organization_id)
        .await?
        .ok_or_else(|| DomainError::InvalidOrganization { organization_id: organization_id.to_string() })?;

    let normalized = registry.normalize(&submission.raw, params).map_err(|e| match e {
        crate::normalize::NormalizationError::ValidationFailed { detail } => DomainError::ValidationError { detail },
        crate::normalize::NormalizationError::UnsupportedFormat { sport, discipline, format } => {
            DomainError::UnsupportedFormat { sport, discipline, format }
        }
    })?;

    auth.authorize(&organization.organization_id, &submission.raw.sport, &submission.region_id)?;

    let all_players: Vec<PlayerId> =
        submission.raw.side_a.iter().chain(submission.raw.side_b.iter()).cloned().collect();
    let found = store.get_players(&organization_id, &all_players).await?;
    let found_ids: std::collections::HashSet<_> = found.iter().map(|p| &p.player_id).collect();
    let unresolved: Vec<&PlayerId> = all_players.iter().filter(|p| !found_ids.contains(p)).collect();
    if !unresolved.is_empty() {
        let unresolved_ids: Vec<PlayerId> = unresolved.iter().map(|p| (*p).clone()).collect();
        let found_elsewhere = store.get_players_any_organization(&unresolved_ids).await?;
        let found_elsewhere_ids: std::collections::HashSet<_> = found_elsewhere.iter().map(|p| &p.player_id).collect();
        let mut missing = Vec::new();
        let mut wrong_organization = Vec::new();
        for id in &unresolved {
            if found_elsewhere_ids.contains(*id) {
                wrong_organization.push(id.to_string());
            } else {
                missing.push(id.to_string());
            }
        }
        return Err(DomainError::InvalidPlayers { missing, wrong_organization });
    }

    let ladder_key = LadderKey::new(organization_id.clone(), &submission.raw.sport, &submission.raw.discipline, &submission.raw.format)
        .with_tier(submission.tier.clone())
        .with_region(crate::store::types::RegionId(submission.region_id.clone()));
    let ladder = store.get_or_create_ladder(&ladder_key).await?;

    let match_id = MatchId::new();
    let games: Vec<GameScoreLine> = submission.raw.games.iter().map(|g| GameScoreLine { game_no: g.game_no, a: g.a, b: g.b }).collect();

    let (rating_status, rating_skip_reason, rating_events) = match &normalized {
        NormalizedMatch::Unrated { reason } => (RatingStatus::Unrated, Some(reason.to_string()), Vec::new()),
        NormalizedMatch::Rated(input) => {
            let events = apply_rating_update(store, &ladder.ladder_id, &organization_id, match_id, submission.start_time, input, params).await?;
            (RatingStatus::Rated, None, events)
        }
    };

    let record = Match {
        match_id,
        ladder_id: ladder.ladder_id.clone(),
        provider_id,
        organization_id: organization_id.clone(),
        start_time: submission.start_time,
        tier: submission.tier,
        sport: submission.raw.sport,
        discipline: submission.raw.discipline,
        format: submission.raw.format,
        side_a: submission.raw.side_a,
        side_b: submission.raw.side_b,
        games,
        raw_payload: serde_json::Value::Null,
        rating_status,
        rating_skip_reason,
        event_id: submission.event_id,
        competition_id: submission.competition_id,
        external_ref: submission.external_ref,
        venue_id: submission.venue_id,
        region_id: Some(crate::store::types::RegionId(ladder.key.region_id.0.clone()))
    };
    store.insert_match(&record).await?;

    detect_out_of_order(store, job_store, &ladder.ladder_id, submission.start_time).await?;

    if !rating_events.is_empty() {
        enqueue_insight_refresh(job_store, &organization_id, rating_events.iter().map(|e| &e.player_id)).await?;
    }

    tracing::info!(match_id = %match_id, ladder_id = %ladder.ladder_id, rated = matches!(rating_status, RatingStatus::Rated), "match ingested");

    let outcome = IngestOutcome { match_id, rating_events };
    if let Some(key) = &submission.idempotency_key {
        store.put_cached_ingest_response(&organization_id, key, &outcome).await?;
    }

    Ok(outcome)
}

async fn apply_rating_update<S: RatingStore>(
    store: &S,
    ladder_id: &crate::store::types::LadderId,
    organization_id: &OrganizationId,
    match_id: MatchId,
    applied_at: DateTime<Utc>,
    input: &MatchInput,
    params: &RatingParameters
) -> Result<Vec<RatingEventRow>, DomainError> {
    let player_ids: Vec<PlayerId> = input.all_players().cloned().collect();
    let ratings = store.get_ratings(ladder_id, &player_ids).await?;

    let pair_keys = same_side_pairs(input);
    let pairs = store.get_pair_synergies(ladder_id, &pair_keys).await?;

    let outcome = rating::update_match(input, &ratings, &pairs, params);
    store
        .record_rated_match(ladder_id, organization_id, match_id, applied_at, input.mov_weight, &outcome)
        .await
}

fn same_side_pairs(input: &MatchInput) -> Vec<PairKey> {
    let mut pairs = Vec::new();
    for side in [Side::A, Side::B] {
        let players = input.players_on(side);
        if players.len() == 2 {
            pairs.push(PairKey::new(players[0].clone(), players[1].clone()));
        }
    }
    pairs
}

/// Enqueues a deduped `RefreshInsight` job per participant. Scope key is
/// `organization_id/player_id` so the dedupe slot doesn't collide across
/// tenants; the worker rebuilds the snapshot from full history regardless of
/// which match triggered the refresh, so one outstanding job per player is
/// always enough.
async fn enqueue_insight_refresh<'a, J: JobStore>(
    job_store: &J,
    organization_id: &OrganizationId,
    player_ids: impl Iterator<Item = &'a PlayerId>
) -> Result<(), DomainError> {
    let now = Utc::now();
    for player_id in player_ids {
        let scope_key = format!("{organization_id}/{player_id}");
        let payload = serde_json::json!({ "organization_id": organization_id.to_string(), "player_id": player_id.to_string() });
        job_store.enqueue(JobKind::RefreshInsight, &scope_key, now, payload, true).await?;
    }
    Ok(())
}

/// If this match's `start_time` is earlier than the
/// latest already on the ladder, mark the ladder for replay and enqueue a
/// deduped `ReplayLadder` job so the worker actually picks it up — the
/// `rating_replay_queue` row alone is inert until something drains it.
async fn detect_out_of_order<S: RatingStore, J: JobStore>(
    store: &S,
    job_store: &J,
    ladder_id: &crate::store::types::LadderId,
    start_time: DateTime<Utc>
) -> Result<(), DomainError> {
    let existing = store.matches_from(ladder_id, DateTime::<Utc>::MIN_UTC).await?;
    let max_existing = existing.iter().map(|m| m.start_time).filter(|t| *t != start_time).max();

    if let Some(max_existing) = max_existing {
        if start_time < max_existing {
            store.upsert_replay_queue_entry(ladder_id, start_time).await?;
            let payload = serde_json::json!({ "ladder_id": ladder_id.0.clone() });
            job_store.enqueue(JobKind::ReplayLadder, &ladder_id.0, Utc::now(), payload, true).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::memory::MemoryJobStore;
    use crate::normalize::{RawGameScore, RawSubmission};
    use crate::store::memory::MemoryStore;
    use crate::store::types::{Organization, Player};

    fn setup() -> (MemoryStore, MemoryJobStore, OrganizationId, ProviderId) {
        let store = MemoryStore::new(RatingParameters::default());
        let org_id = OrganizationId::from("org-1");
        store.seed_organization(Organization { organization_id: org_id.clone(), slug: "org-1".to_string() });
        for id in ["a", "b"] {
            store.seed_player(
                Player::new(PlayerId::from(id), org_id.clone(), id.to_string(), None, None).unwrap()
            );
        }
        (store, MemoryJobStore::new(), org_id, ProviderId::from("demo"))
    }

    fn submission(start_time: DateTime<Utc>) -> Submission {
        Submission {
            raw: RawSubmission {
                sport: "BADMINTON".to_string(),
                discipline: "SINGLES".to_string(),
                format: "BO3_21RALLY".to_string(),
                side_a: vec![PlayerId::from("a")],
                side_b: vec![PlayerId::from("b")],
                games: vec![RawGameScore { game_no: 1, a: 21, b: 15 }, RawGameScore { game_no: 2, a: 21, b: 18 }]
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

    #[tokio::test]
    async fn singles_match_updates_both_players_ratings() {
        let (store, jobs, org_id, provider_id) = setup();
        let params = RatingParameters::default();
        let registry = FormatRegistry::default();
        let now = DateTime::parse_from_rfc3339("2025-09-21T08:00:00Z").unwrap().with_timezone(&Utc);

        let outcome = record_match(&store, &jobs, &AllowAll, &registry, &params, submission(now), provider_id, org_id)
            .await
            .unwrap();

        assert_eq!(outcome.rating_events.len(), 2);
        let a = outcome.rating_events.iter().find(|e| e.player_id.0 == "a").unwrap();
        let b = outcome.rating_events.iter().find(|e| e.player_id.0 == "b").unwrap();
        assert!(a.mu_after > a.mu_before);
        assert!(b.mu_after < b.mu_before);
        assert_eq!(a.delta, -b.delta);
    }

    #[tokio::test]
    async fn invalid_players_are_rejected() {
        let store = MemoryStore::new(RatingParameters::default());
        let jobs = MemoryJobStore::new();
        let org_id = OrganizationId::from("org-1");
        store.seed_organization(Organization { organization_id: org_id.clone(), slug: "org-1".to_string() });
        let params = RatingParameters::default();
        let registry = FormatRegistry::default();
        let now = Utc::now();

        let err = record_match(&store, &jobs, &AllowAll, &registry, &params, submission(now), ProviderId::from("demo"), org_id)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidPlayers { .. }));
    }

    #[tokio::test]
    async fn invalid_players_distinguishes_missing_from_wrong_organization() {
        let store = MemoryStore::new(RatingParameters::default());
        let jobs = MemoryJobStore::new();
        let org_id = OrganizationId::from("org-1");
        let other_org_id = OrganizationId::from("org-2");
        store.seed_organization(Organization { organization_id: org_id.clone(), slug: "org-1".to_string() });
        store.seed_organization(Organization { organization_id: other_org_id.clone(), slug: "org-2".to_string() });
        // "a" belongs to a different organization than the one the match is submitted under; "b" doesn't exist at all.
        store.seed_player(Player::new(PlayerId::from("a"), other_org_id, "a".to_string(), None, None).unwrap());
        let params = RatingParameters::default();
        let registry = FormatRegistry::default();
        let now = Utc::now();

        let err = record_match(&store, &jobs, &AllowAll, &registry, &params, submission(now), ProviderId::from("demo"), org_id)
            .await
            .unwrap_err();
        match err {
            DomainError::InvalidPlayers { missing, wrong_organization } => {
                assert_eq!(missing, vec!["b".to_string()]);
                assert_eq!(wrong_organization, vec!["a".to_string()]);
            }
            other => panic!("expected InvalidPlayers, got {other:?}")
        }
    }

    #[tokio::test]
    async fn out_of_order_arrival_enqueues_replay() {
        let (store, jobs, org_id, provider_id) = setup();
        let params = RatingParameters::default();
        let registry = FormatRegistry::default();

        let t2 = DateTime::parse_from_rfc3339("2025-09-22T08:00:00Z").unwrap().with_timezone(&Utc);
        let t1 = DateTime::parse_from_rfc3339("2025-09-20T08:00:00Z").unwrap().with_timezone(&Utc);

        record_match(&store, &jobs, &AllowAll, &registry, &params, submission(t2), provider_id.clone(), org_id.clone())
            .await
            .unwrap();
        record_match(&store, &jobs, &AllowAll, &registry, &params, submission(t1), provider_id, org_id.clone())
            .await
            .unwrap();

        let ladder_key = LadderKey::new(org_id, "BADMINTON", "SINGLES", "BO3_21RALLY");
        let ladder = store.get_or_create_ladder(&ladder_key).await.unwrap();
        let entry = store.get_replay_queue_entry(&ladder.ladder_id).await.unwrap().unwrap();
        assert_eq!(entry.earliest_start_time, t1);

        // The queue entry alone doesn't get drained by anything; a ReplayLadder
        // job must actually be claimable for the worker to pick it up.
        let claimed = jobs
            .claim(JobKind::ReplayLadder, "worker-1", t1 + chrono::Duration::seconds(1), chrono::Duration::seconds(30), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload["ladder_id"].as_str().unwrap(), ladder.ladder_id.0);
    }

    #[tokio::test]
    async fn rating_events_cover_participants_and_match_current_rating() {
        let (store, jobs, org_id, provider_id) = setup();
        let params = RatingParameters::default();
        let registry = FormatRegistry::default();
        let now = DateTime::parse_from_rfc3339("2025-09-21T08:00:00Z").unwrap().with_timezone(&Utc);

        let outcome = record_match(&store, &jobs, &AllowAll, &registry, &params, submission(now), provider_id, org_id.clone())
            .await
            .unwrap();

        // One rating event per participant, covering exactly the match's players.
        let event_players: std::collections::HashSet<_> = outcome.rating_events.iter().map(|e| e.player_id.clone()).collect();
        assert_eq!(event_players, [PlayerId::from("a"), PlayerId::from("b")].into_iter().collect());

        // Each event's mu_after/sigma_after matches the now-current PlayerRating.
        let ladder_key = LadderKey::new(org_id, "BADMINTON", "SINGLES", "BO3_21RALLY");
        let ladder = store.get_or_create_ladder(&ladder_key).await.unwrap();
        let ratings = store
            .get_ratings(&ladder.ladder_id, &[PlayerId::from("a"), PlayerId::from("b")])
            .await
            .unwrap();
        for event in &outcome.rating_events {
            let current = ratings.get(&event.player_id).unwrap();
            assert_eq!(current.mu, event.mu_after);
            assert_eq!(current.sigma, event.sigma_after);
        }
    }

    #[tokio::test]
    async fn as_of_snapshot_returns_rating_at_that_point_in_time() {
        let (store, jobs, org_id, provider_id) = setup();
        let params = RatingParameters::default();
        let registry = FormatRegistry::default();
        let t1 = DateTime::parse_from_rfc3339("2025-09-20T08:00:00Z").unwrap().with_timezone(&Utc);
        let t2 = DateTime::parse_from_rfc3339("2025-09-22T08:00:00Z").unwrap().with_timezone(&Utc);
        let between = DateTime::parse_from_rfc3339("2025-09-21T08:00:00Z").unwrap().with_timezone(&Utc);

        let first = record_match(&store, &jobs, &AllowAll, &registry, &params, submission(t1), provider_id.clone(), org_id.clone())
            .await
            .unwrap();
        record_match(&store, &jobs, &AllowAll, &registry, &params, submission(t2), provider_id, org_id.clone())
            .await
            .unwrap();

        let ladder_key = LadderKey::new(org_id, "BADMINTON", "SINGLES", "BO3_21RALLY");
        let ladder = store.get_or_create_ladder(&ladder_key).await.unwrap();

        let as_of = store.latest_rating_event_as_of(&ladder.ladder_id, &PlayerId::from("a"), between).await.unwrap();
        let first_event = first.rating_events.iter().find(|e| e.player_id.0 == "a").unwrap();
        assert_eq!(as_of.unwrap().mu_after, first_event.mu_after);

        let before_anything = store
            .latest_rating_event_as_of(&ladder.ladder_id, &PlayerId::from("a"), t1 - chrono::Duration::days(1))
            .await
            .unwrap();
        assert!(before_anything.is_none());
    }

    #[tokio::test]
    async fn unrated_match_emits_no_events() {
        let (store, jobs, org_id, provider_id) = setup();
        let params = RatingParameters::default();
        let registry = FormatRegistry::default();
        let mut sub = submission(Utc::now());
        sub.raw.discipline = "DOUBLES".to_string();
        sub.raw.side_a = vec![PlayerId::from("a")];
        sub.raw.side_b = vec![PlayerId::from("b")];
        sub.raw.games = Vec::new();

        let outcome = record_match(&store, &jobs, &AllowAll, &registry, &params, sub, provider_id, org_id)
            .await
            .unwrap();
        assert!(outcome.rating_events.is_empty());
    }

    #[tokio::test]
    async fn repeat_idempotency_key_returns_cached_outcome_without_rerating() {
        let (store, jobs, org_id, provider_id) = setup();
        let params = RatingParameters::default();
        let registry = FormatRegistry::default();
        let now = DateTime::parse_from_rfc3339("2025-09-21T08:00:00Z").unwrap().with_timezone(&Utc);

        let mut first_sub = submission(now);
        first_sub.idempotency_key = Some("client-key-1".to_string());
        let first = record_match(&store, &jobs, &AllowAll, &registry, &params, first_sub, provider_id.clone(), org_id.clone())
            .await
            .unwrap();

        let mut repeat_sub = submission(now);
        repeat_sub.idempotency_key = Some("client-key-1".to_string());
        let repeat = record_match(&store, &jobs, &AllowAll, &registry, &params, repeat_sub, provider_id, org_id.clone())
            .await
            .unwrap();

        assert_eq!(first, repeat);

        let ladder_key = LadderKey::new(org_id, "BADMINTON", "SINGLES", "BO3_21RALLY");
        let ladder = store.get_or_create_ladder(&ladder_key).await.unwrap();
        let history = store.player_history(&ladder.key.organization_id, &PlayerId::from("a")).await.unwrap();
        assert_eq!(history.len(), 1, "the second call must not re-run the rating update");
    }

    #[tokio::test]
    async fn rated_match_enqueues_deduped_insight_refresh_per_participant() {
        let (store, jobs, org_id, provider_id) = setup();
        let params = RatingParameters::default();
        let registry = FormatRegistry::default();
        let now = DateTime::parse_from_rfc3339("2025-09-21T08:00:00Z").unwrap().with_timezone(&Utc);

        record_match(&store, &jobs, &AllowAll, &registry, &params, submission(now), provider_id.clone(), org_id.clone())
            .await
            .unwrap();

        let claimed = jobs
            .claim(JobKind::RefreshInsight, "worker-1", now + chrono::Duration::seconds(1), chrono::Duration::seconds(30), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2, "one refresh job per participant");

        // A second rated match for the same players must not grow the queue
        // past one outstanding job per player (dedupe=true).
        record_match(&store, &jobs, &AllowAll, &registry, &params, submission(now + chrono::Duration::hours(1)), provider_id, org_id)
            .await
            .unwrap();
        let claimed_again = jobs
            .claim(JobKind::RefreshInsight, "worker-1", now + chrono::Duration::hours(2), chrono::Duration::seconds(30), 10)
            .await
            .unwrap();
        assert_eq!(claimed_again.len(), 0, "first batch already claimed both players' jobs; none re-enqueued while outstanding");
    }
}
