//! C7 — background job queue. Same shape as [`crate::store::RatingStore`]:
//! one `async fn` trait, a memory impl for tests and a raw-SQL Postgres impl,
//! picked at runtime via an enum instead of a trait object.
//! enqueue/claim/complete/sweep semantics with dedupe keys and a visibility
//! timeout on each lease.

pub mod memory;
pub mod postgres;

use crate::error::DomainError;
use crate::store::types::{Job, JobId, JobKind, JobStatus};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnqueueResult {
    pub job_id: JobId,
    pub enqueued: bool
}

/// Outcome passed to [`JobStore::complete`]. `Failure { reschedule_at: Some(_) }`
/// returns the job to `PENDING` at the given time; `None` marks it `FAILED`
/// (see `complete`).
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success,
    Failure { error: String, reschedule_at: Option<DateTime<Utc>> }
}

pub trait JobStore: Send + Sync {
    async fn enqueue(
        &self,
        kind: JobKind,
        scope_key: &str,
        run_at: DateTime<Utc>,
        payload: serde_json::Value,
        dedupe: bool
    ) -> Result<EnqueueResult, DomainError>;

    /// Up to `batch_size` `PENDING` jobs of `kind` with `run_at <= now`,
    /// ordered `(run_at, job_id)` ascending, atomically moved to
    /// `IN_PROGRESS` and leased to `worker_id` until `now + visibility_timeout`.
    async fn claim(
        &self,
        kind: JobKind,
        worker_id: &str,
        now: DateTime<Utc>,
        visibility_timeout: chrono::Duration,
        batch_size: usize
    ) -> Result<Vec<Job>, DomainError>;

    async fn complete(&self, job_id: JobId, worker_id: &str, outcome: JobOutcome) -> Result<(), DomainError>;

    /// Promotes `IN_PROGRESS` jobs whose lease has expired back to
    /// `PENDING`; returns the count recovered.
    async fn sweep_expired_leases(&self, now: DateTime<Utc>) -> Result<usize, DomainError>;
}

pub enum JobStoreHandle {
    Memory(memory::MemoryJobStore),
    Postgres(postgres::PostgresJobStore)
}

macro_rules! delegate {
    ($self:ident, $method:ident($($arg:expr),*)) => {
        match $self {
            JobStoreHandle::Memory(s) => s.$method($($arg),*).await,
            JobStoreHandle::Postgres(s) => s.$method($($arg),*).await
        }
    };
}

impl JobStore for JobStoreHandle {
    async fn enqueue(
        &self,
        kind: JobKind,
        scope_key: &str,
        run_at: DateTime<Utc>,
        payload: serde_json::Value,
        dedupe: bool
    ) -> Result<EnqueueResult, DomainError> {
        delegate!(self, enqueue(kind, scope_key, run_at, payload, dedupe))
    }

    async fn claim(
        &self,
        kind: JobKind,
        worker_id: &str,
        now: DateTime<Utc>,
        visibility_timeout: chrono::Duration,
        batch_size: usize
    ) -> Result<Vec<Job>, DomainError> {
        delegate!(self, claim(kind, worker_id, now, visibility_timeout, batch_size))
    }

    async fn complete(&self, job_id: JobId, worker_id: &str, outcome: JobOutcome) -> Result<(), DomainError> {
        delegate!(self, complete(job_id, worker_id, outcome))
    }

    async fn sweep_expired_leases(&self, now: DateTime<Utc>) -> Result<usize, DomainError> {
        delegate!(self, sweep_expired_leases(now))
    }
}

/// True if `status` means the job still occupies the `(kind, scope_key)`
/// dedupe slot.
pub(crate) fn is_outstanding(status: JobStatus) -> bool {
    matches!(status, JobStatus::Pending | JobStatus::InProgress)
}
