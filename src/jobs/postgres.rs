//! Production `JobStore`: raw `tokio_postgres`, a single `UPDATE ...
//! RETURNING` with `SKIP LOCKED` for claim, no ORM, manual row decoding.

use super::{EnqueueResult, JobOutcome, JobStore};
use crate::error::DomainError;
use crate::store::types::{Job, JobId, JobKind, JobStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_postgres::Client;

pub struct PostgresJobStore {
    client: Arc<Client>
}

impl PostgresJobStore {
    pub fn new(client: Arc<Client>) -> Self {
        PostgresJobStore { client }
    }
}

impl JobStore for PostgresJobStore {
    async fn enqueue(
        &self,
        kind: JobKind,
        scope_key: &str,
        run_at: DateTime<Utc>,
        payload: serde_json::Value,
        dedupe: bool
    ) -> Result<EnqueueResult, DomainError> {
        let kind_str = job_kind_str(&kind);
        let job_id = JobId::new();

        if dedupe {
            // `job_queue_dedupe_idx` is a partial unique index on (kind, scope_key)
            // for outstanding jobs, so this insert-or-skip is atomic: two concurrent
            // enqueues for the same scope can't both land an outstanding job, unlike
            // a plain SELECT-then-INSERT which only checks-then-acts.
            let inserted = self
                .client
                .query_opt(
                    "INSERT INTO job_queue (job_id, kind, scope_key, run_at, status, attempts, payload) \
                     VALUES ($1, $2, $3, $4, 'PENDING', 0, $5) \
                     ON CONFLICT (kind, scope_key) WHERE status IN ('PENDING', 'IN_PROGRESS') DO NOTHING \
                     RETURNING job_id",
                    &[&job_id.0, &kind_str, &scope_key, &run_at, &payload]
                )
                .await?;

            if let Some(row) = inserted {
                let job_id: uuid::Uuid = row.get("job_id");
                return Ok(EnqueueResult { job_id: JobId(job_id), enqueued: true });
            }

            let existing = self
                .client
                .query_one(
                    "SELECT job_id, run_at FROM job_queue \
                     WHERE kind = $1 AND scope_key = $2 AND status IN ('PENDING', 'IN_PROGRESS')",
                    &[&kind_str, &scope_key]
                )
                .await?;
            let existing_job_id: uuid::Uuid = existing.get("job_id");
            let existing_run_at: DateTime<Utc> = existing.get("run_at");
            if run_at < existing_run_at {
                self.client
                    .execute("UPDATE job_queue SET run_at = $1 WHERE job_id = $2", &[&run_at, &existing_job_id])
                    .await?;
            }
            return Ok(EnqueueResult { job_id: JobId(existing_job_id), enqueued: false });
        }

        self.client
            .execute(
                "INSERT INTO job_queue (job_id, kind, scope_key, run_at, status, attempts, payload) \
                 VALUES ($1, $2, $3, $4, 'PENDING', 0, $5)",
                &[&job_id.0, &kind_str, &scope_key, &run_at, &payload]
            )
            .await?;
        Ok(EnqueueResult { job_id, enqueued: true })
    }

    async fn claim(
        &self,
        kind: JobKind,
        worker_id: &str,
        now: DateTime<Utc>,
        visibility_timeout: chrono::Duration,
        batch_size: usize
    ) -> Result<Vec<Job>, DomainError> {
        let kind_str = job_kind_str(&kind);
        let lease_expires_at = now + visibility_timeout;

        let rows = self
            .client
            .query(
                "UPDATE job_queue SET status = 'IN_PROGRESS', locked_by = $1, locked_at = $2, lease_expires_at = $3 \
                 WHERE job_id IN ( \
                     SELECT job_id FROM job_queue \
                     WHERE kind = $4 AND status = 'PENDING' AND run_at <= $2 \
                     ORDER BY run_at, job_id \
                     LIMIT $5 \
                     FOR UPDATE SKIP LOCKED \
                 ) \
                 RETURNING job_id, kind, scope_key, run_at, status, attempts, locked_by, locked_at, \
                           lease_expires_at, payload, last_error",
                &[&worker_id, &now, &lease_expires_at, &kind_str, &(batch_size as i64)]
            )
            .await?;

        Ok(rows.iter().map(row_to_job).collect())
    }

    async fn complete(&self, job_id: JobId, worker_id: &str, outcome: JobOutcome) -> Result<(), DomainError> {
        let row = self
            .client
            .query_opt("SELECT locked_by FROM job_queue WHERE job_id = $1", &[&job_id.0])
            .await?
            .ok_or_else(|| DomainError::NotFound { what: "job", id: job_id.to_string() })?;
        let locked_by: Option<String> = row.get("locked_by");
        if locked_by.as_deref() != Some(worker_id) {
            return Err(DomainError::Conflict { detail: format!("job {job_id} is not leased to {worker_id}") });
        }

        match outcome {
            JobOutcome::Success => {
                self.client
                    .execute("UPDATE job_queue SET status = 'COMPLETED' WHERE job_id = $1", &[&job_id.0])
                    .await?;
            }
            JobOutcome::Failure { error, reschedule_at: Some(reschedule_at) } => {
                self.client
                    .execute(
                        "UPDATE job_queue SET status = 'PENDING', run_at = $1, attempts = attempts + 1, \
                         last_error = $2, locked_by = NULL, locked_at = NULL, lease_expires_at = NULL \
                         WHERE job_id = $3",
                        &[&reschedule_at, &error, &job_id.0]
                    )
                    .await?;
            }
            JobOutcome::Failure { error, reschedule_at: None } => {
                self.client
                    .execute(
                        "UPDATE job_queue SET status = 'FAILED', attempts = attempts + 1, last_error = $1 \
                         WHERE job_id = $2",
                        &[&error, &job_id.0]
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn sweep_expired_leases(&self, now: DateTime<Utc>) -> Result<usize, DomainError> {
        let affected = self
            .client
            .execute(
                "UPDATE job_queue SET status = 'PENDING', locked_by = NULL, locked_at = NULL, lease_expires_at = NULL \
                 WHERE status = 'IN_PROGRESS' AND lease_expires_at < $1",
                &[&now]
            )
            .await?;
        Ok(affected as usize)
    }
}

fn row_to_job(row: &tokio_postgres::Row) -> Job {
    let status_str: String = row.get("status");
    let kind_str: String = row.get("kind");
    Job {
        job_id: JobId(row.get("job_id")),
        kind: parse_job_kind(&kind_str),
        scope_key: row.get("scope_key"),
        run_at: row.get("run_at"),
        status: parse_job_status(&status_str),
        attempts: row.get::<_, i32>("attempts") as u32,
        locked_by: row.get("locked_by"),
        locked_at: row.get("locked_at"),
        lease_expires_at: row.get("lease_expires_at"),
        payload: row.get("payload"),
        last_error: row.get("last_error")
    }
}

fn job_kind_str(kind: &JobKind) -> &'static str {
    match kind {
        JobKind::ReplayLadder => "replay_ladder",
        JobKind::RefreshInsight => "refresh_insight"
    }
}

fn parse_job_kind(s: &str) -> JobKind {
    match s {
        "refresh_insight" => JobKind::RefreshInsight,
        _ => JobKind::ReplayLadder
    }
}

fn parse_job_status(s: &str) -> JobStatus {
    match s {
        "IN_PROGRESS" => JobStatus::InProgress,
        "FAILED" => JobStatus::Failed,
        "COMPLETED" => JobStatus::Completed,
        _ => JobStatus::Pending
    }
}
