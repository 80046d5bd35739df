//! `openrating-worker` — long-lived poll loop over C7, dispatching
//! `ReplayLadder` jobs to the replay engine and `RefreshInsight` jobs to the
//! insight snapshot builder, plus a periodic lease sweep. A single
//! `#[tokio::main]` entrypoint, standing rather than one-shot.

use chrono::{DateTime, Utc};
use openrating_core::config::Settings;
use openrating_core::jobs::postgres::PostgresJobStore;
use openrating_core::jobs::{JobOutcome, JobStore, JobStoreHandle};
use openrating_core::store::postgres::PostgresStore;
use openrating_core::store::types::{JobKind, OrganizationId, PlayerId};
use openrating_core::store::{RatingStore, StoreHandle};
use openrating_core::{insights, replay, RatingParameters};
use std::time::Duration as StdDuration;

#[tokio::main]
async fn main() {
    let settings = Settings::load();
    settings.install_tracing();

    let worker_id = format!("{}-{}", hostname(), std::process::id());
    let params = RatingParameters::default();

    let rating_store = PostgresStore::connect_with_retry(
        &settings.database_url,
        10,
        StdDuration::from_millis(500),
        StdDuration::from_secs(30)
    )
    .await
    .expect("failed to connect rating store to postgres");
    let job_store = JobStoreHandle::Postgres(PostgresJobStore::new(rating_store.client()));
    let store = StoreHandle::Postgres(rating_store);

    tracing::info!(worker_id = %worker_id, "worker started");

    let mut last_sweep = Utc::now();
    loop {
        let now = Utc::now();
        if (now - last_sweep).num_seconds() >= settings.sweep_interval_secs as i64 {
            match job_store.sweep_expired_leases(now).await {
                Ok(n) if n > 0 => tracing::info!(recovered = n, "swept expired leases"),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "lease sweep failed")
            }
            last_sweep = now;
        }

        let claimed_replay = claim_and_run(&job_store, &store, &params, &worker_id, JobKind::ReplayLadder, &settings).await;
        let claimed_insight = claim_and_run(&job_store, &store, &params, &worker_id, JobKind::RefreshInsight, &settings).await;

        if !claimed_replay && !claimed_insight {
            tokio::time::sleep(settings.poll_interval()).await;
        }
    }
}

/// Claims and runs one batch of `kind` jobs. Returns whether anything was claimed.
async fn claim_and_run(
    job_store: &JobStoreHandle,
    store: &StoreHandle,
    params: &RatingParameters,
    worker_id: &str,
    kind: JobKind,
    settings: &Settings
) -> bool {
    let now = Utc::now();
    let jobs = match job_store
        .claim(kind.clone(), worker_id, now, settings.visibility_timeout(), settings.claim_batch_size)
        .await
    {
        Ok(jobs) => jobs,
        Err(e) => {
            tracing::error!(error = %e, kind = %kind, "claim failed");
            return false;
        }
    };

    if jobs.is_empty() {
        return false;
    }

    for job in jobs {
        let outcome = match job.kind {
            JobKind::ReplayLadder => run_replay_job(store, params, &job.payload).await,
            JobKind::RefreshInsight => run_insight_job(store, &job.payload).await
        };

        let job_outcome = match outcome {
            Ok(()) => JobOutcome::Success,
            Err(e) if e.is_transient() => {
                tracing::warn!(job_id = %job.job_id, error = %e, "job failed, rescheduling");
                JobOutcome::Failure { error: e.to_string(), reschedule_at: Some(now + chrono::Duration::seconds(30)) }
            }
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "job failed terminally");
                JobOutcome::Failure { error: e.to_string(), reschedule_at: None }
            }
        };

        if let Err(e) = job_store.complete(job.job_id, worker_id, job_outcome).await {
            tracing::error!(job_id = %job.job_id, error = %e, "failed to mark job complete");
        }
    }

    true
}

async fn run_replay_job(
    store: &StoreHandle,
    params: &RatingParameters,
    payload: &serde_json::Value
) -> Result<(), openrating_core::DomainError> {
    let ladder_id = payload
        .get("ladder_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| openrating_core::DomainError::ValidationError { detail: "replay job missing ladder_id".to_string() })?;
    let from: Option<DateTime<Utc>> =
        payload.get("from").and_then(|v| v.as_str()).and_then(|s| s.parse().ok());

    let ladder_id = openrating_core::store::types::LadderId(ladder_id.to_string());
    replay::process_replay(store, params, &ladder_id, from, false).await?;
    Ok(())
}

async fn run_insight_job(store: &StoreHandle, payload: &serde_json::Value) -> Result<(), openrating_core::DomainError> {
    let organization_id = payload
        .get("organization_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| openrating_core::DomainError::ValidationError { detail: "insight job missing organization_id".to_string() })?;
    let player_id = payload
        .get("player_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| openrating_core::DomainError::ValidationError { detail: "insight job missing player_id".to_string() })?;

    let organization_id = OrganizationId::from(organization_id);
    let player_id = PlayerId::from(player_id);
    let snapshot = insights::build_snapshot_for_player(store, organization_id, player_id, Utc::now()).await?;
    store.upsert_insight_snapshot(&snapshot).await?;
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string())
}
