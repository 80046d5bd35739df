use chrono::{DateTime, Utc};
use openrating_core::ingestion::{record_match, AllowAll, Submission};
use openrating_core::insights;
use openrating_core::jobs::postgres::PostgresJobStore;
use openrating_core::jobs::{JobOutcome, JobStore};
use openrating_core::normalize::{FormatRegistry, RawGameScore, RawSubmission};
use openrating_core::store::postgres::PostgresStore;
use openrating_core::store::types::{JobKind, LadderKey, OrganizationId, PlayerId, ProviderId};
use openrating_core::store::RatingStore;
use openrating_core::RatingParameters;
use serial_test::serial;

use super::test_helpers::TestDatabase;
use crate::common::init_test_env;

async fn seeded_store(db: &TestDatabase) -> PostgresStore {
    let store = PostgresStore::connect(&db.connection_string).await.expect("failed to connect");
    let client = store.client();
    client
        .execute(
            "INSERT INTO organizations (organization_id, slug) VALUES ('org-1', 'org-1')",
            &[]
        )
        .await
        .unwrap();
    for id in ["a", "b"] {
        client
            .execute(
                "INSERT INTO players (player_id, organization_id, display_name) VALUES ($1, 'org-1', $1)",
                &[&id]
            )
            .await
            .unwrap();
    }
    store
}

fn submission(start_time: DateTime<Utc>, a: &str, b: &str) -> Submission {
    Submission {
        raw: RawSubmission {
            sport: "BADMINTON".to_string(),
            discipline: "SINGLES".to_string(),
            format: "BO3_21RALLY".to_string(),
            side_a: vec![PlayerId::from(a)],
            side_b: vec![PlayerId::from(b)],
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
#[serial]
async fn ingestion_persists_ratings_and_history() {
    init_test_env();
    let db = TestDatabase::new().await.expect("failed to start test database");
    let store = seeded_store(&db).await;
    let jobs = PostgresJobStore::new(store.client());
    let params = RatingParameters::default();
    let registry = FormatRegistry::default();
    let now = DateTime::parse_from_rfc3339("2025-09-21T08:00:00Z").unwrap().with_timezone(&Utc);

    let outcome = record_match(&store, &jobs, &AllowAll, &registry, &params, submission(now, "a", "b"), ProviderId::from("demo"), OrganizationId::from("org-1"))
        .await
        .expect("match should ingest");

    assert_eq!(outcome.rating_events.len(), 2);

    let ladder_key = LadderKey::new(OrganizationId::from("org-1"), "BADMINTON", "SINGLES", "BO3_21RALLY");
    let ladder = store.get_or_create_ladder(&ladder_key).await.unwrap();
    let board = store.list_leaderboard(&ladder.ladder_id, None, 10).await.unwrap();
    assert_eq!(board.len(), 2);
    assert_eq!(board[0].player_id.0, "a");
    assert!(board[0].mu > board[1].mu);

    let history = store.player_history(&OrganizationId::from("org-1"), &PlayerId::from("a")).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
#[serial]
async fn leaderboard_cursor_pages_through_results() {
    init_test_env();
    let db = TestDatabase::new().await.expect("failed to start test database");
    let store = seeded_store(&db).await;
    let client = store.client();
    client
        .execute("INSERT INTO players (player_id, organization_id, display_name) VALUES ('c', 'org-1', 'c')", &[])
        .await
        .unwrap();

    let jobs = PostgresJobStore::new(store.client());
    let params = RatingParameters::default();
    let registry = FormatRegistry::default();
    let t0 = DateTime::parse_from_rfc3339("2025-09-21T08:00:00Z").unwrap().with_timezone(&Utc);

    record_match(&store, &jobs, &AllowAll, &registry, &params, submission(t0, "a", "b"), ProviderId::from("demo"), OrganizationId::from("org-1"))
        .await
        .unwrap();
    record_match(&store, &jobs, &AllowAll, &registry, &params, submission(t0 + chrono::Duration::hours(1), "a", "c"), ProviderId::from("demo"), OrganizationId::from("org-1"))
        .await
        .unwrap();

    let ladder_key = LadderKey::new(OrganizationId::from("org-1"), "BADMINTON", "SINGLES", "BO3_21RALLY");
    let ladder = store.get_or_create_ladder(&ladder_key).await.unwrap();

    let first_page = store.list_leaderboard(&ladder.ladder_id, None, 1).await.unwrap();
    assert_eq!(first_page.len(), 1);
    let cursor = openrating_core::store::LeaderboardCursor { mu: first_page[0].mu, player_id: first_page[0].player_id.clone() };
    let second_page = store.list_leaderboard(&ladder.ladder_id, Some(cursor), 10).await.unwrap();
    assert!(!second_page.iter().any(|r| r.player_id == first_page[0].player_id));
}

#[tokio::test]
#[serial]
async fn job_queue_claim_complete_and_sweep_round_trip() {
    init_test_env();
    let db = TestDatabase::new().await.expect("failed to start test database");
    let store = PostgresStore::connect(&db.connection_string).await.unwrap();
    let jobs = PostgresJobStore::new(store.client());

    let now = Utc::now();
    let enqueued = jobs
        .enqueue(JobKind::RefreshInsight, "org-1/a", now, serde_json::json!({"organization_id": "org-1", "player_id": "a"}), true)
        .await
        .unwrap();
    assert!(enqueued.enqueued);

    let dedupe = jobs
        .enqueue(JobKind::RefreshInsight, "org-1/a", now + chrono::Duration::seconds(5), serde_json::json!({}), true)
        .await
        .unwrap();
    assert!(!dedupe.enqueued);
    assert_eq!(dedupe.job_id, enqueued.job_id);

    let claimed = jobs.claim(JobKind::RefreshInsight, "worker-1", now, chrono::Duration::seconds(1), 10).await.unwrap();
    assert_eq!(claimed.len(), 1);

    // lease expires almost immediately; sweeper should recover it
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let swept = jobs.sweep_expired_leases(Utc::now()).await.unwrap();
    assert_eq!(swept, 1);

    let reclaimed = jobs.claim(JobKind::RefreshInsight, "worker-2", Utc::now(), chrono::Duration::seconds(60), 10).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    jobs.complete(reclaimed[0].job_id, "worker-2", JobOutcome::Success).await.unwrap();

    let none_left = jobs.claim(JobKind::RefreshInsight, "worker-3", Utc::now(), chrono::Duration::seconds(60), 10).await.unwrap();
    assert!(none_left.is_empty());
}

#[tokio::test]
#[serial]
async fn insight_snapshot_round_trips_through_postgres() {
    init_test_env();
    let db = TestDatabase::new().await.expect("failed to start test database");
    let store = seeded_store(&db).await;
    let jobs = PostgresJobStore::new(store.client());
    let params = RatingParameters::default();
    let registry = FormatRegistry::default();
    let now = DateTime::parse_from_rfc3339("2025-09-21T08:00:00Z").unwrap().with_timezone(&Utc);

    record_match(&store, &jobs, &AllowAll, &registry, &params, submission(now, "a", "b"), ProviderId::from("demo"), OrganizationId::from("org-1"))
        .await
        .unwrap();

    let snapshot = insights::build_snapshot_for_player(&store, OrganizationId::from("org-1"), PlayerId::from("a"), now + chrono::Duration::hours(1))
        .await
        .unwrap();
    store.upsert_insight_snapshot(&snapshot).await.unwrap();

    let fetched = store.get_insight_snapshot(&OrganizationId::from("org-1"), &PlayerId::from("a")).await.unwrap();
    assert_eq!(fetched.unwrap().cache_keys.digest, snapshot.cache_keys.digest);
}
