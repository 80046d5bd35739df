//! In-memory `JobStore`, mirroring `store::memory::MemoryStore`'s
//! `Mutex`-guarded bookkeeping style.

use super::{is_outstanding, EnqueueResult, JobOutcome, JobStore};
use crate::error::DomainError;
use crate::store::types::{Job, JobId, JobKind, JobStatus};
use chrono::{DateTime, Utc};
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<Job>>
}

impl MemoryJobStore {
    pub fn new() -> Self {
        MemoryJobStore { jobs: Mutex::new(Vec::new()) }
    }
}

impl JobStore for MemoryJobStore {
    async fn enqueue(
        &self,
        kind: JobKind,
        scope_key: &str,
        run_at: DateTime<Utc>,
        payload: serde_json::Value,
        dedupe: bool
    ) -> Result<EnqueueResult, DomainError> {
        let mut jobs = self.jobs.lock().unwrap();

        if dedupe {
            if let Some(existing) = jobs.iter_mut().find(|j| j.kind == kind && j.scope_key == scope_key && is_outstanding(j.status)) {
                if run_at < existing.run_at {
                    existing.run_at = run_at;
                }
                return Ok(EnqueueResult { job_id: existing.job_id, enqueued: false });
            }
        }

        let job_id = JobId::new();
        jobs.push(Job {
            job_id,
            kind,
            scope_key: scope_key.to_string(),
            run_at,
            status: JobStatus::Pending,
            attempts: 0,
            locked_by: None,
            locked_at: None,
            lease_expires_at: None,
            payload,
            last_error: None
        });
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
        let mut jobs = self.jobs.lock().unwrap();

        let mut candidate_indices: Vec<usize> = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.kind == kind && j.status == JobStatus::Pending && j.run_at <= now)
            .map(|(i, _)| i)
            .collect();
        candidate_indices.sort_by_key(|&i| (jobs[i].run_at, jobs[i].job_id));
        candidate_indices.truncate(batch_size);

        let mut claimed = Vec::with_capacity(candidate_indices.len());
        for i in candidate_indices {
            let job = &mut jobs[i];
            job.status = JobStatus::InProgress;
            job.locked_by = Some(worker_id.to_string());
            job.locked_at = Some(now);
            job.lease_expires_at = Some(now + visibility_timeout);
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn complete(&self, job_id: JobId, worker_id: &str, outcome: JobOutcome) -> Result<(), DomainError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.job_id == job_id)
            .ok_or_else(|| DomainError::NotFound { what: "job", id: job_id.to_string() })?;

        if job.locked_by.as_deref() != Some(worker_id) {
            return Err(DomainError::Conflict { detail: format!("job {job_id} is not leased to {worker_id}") });
        }

        match outcome {
            JobOutcome::Success => job.status = JobStatus::Completed,
            JobOutcome::Failure { error, reschedule_at: Some(reschedule_at) } => {
                job.status = JobStatus::Pending;
                job.run_at = reschedule_at;
                job.attempts += 1;
                job.last_error = Some(error);
                job.locked_by = None;
                job.locked_at = None;
                job.lease_expires_at = None;
            }
            JobOutcome::Failure { error, reschedule_at: None } => {
                job.status = JobStatus::Failed;
                job.attempts += 1;
                job.last_error = Some(error);
            }
        }
        Ok(())
    }

    async fn sweep_expired_leases(&self, now: DateTime<Utc>) -> Result<usize, DomainError> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut recovered = 0;
        for job in jobs.iter_mut() {
            if job.status == JobStatus::InProgress && job.lease_expires_at.map(|t| t < now).unwrap_or(false) {
                job.status = JobStatus::Pending;
                job.locked_by = None;
                job.locked_at = None;
                job.lease_expires_at = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
