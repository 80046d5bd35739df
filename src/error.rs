use thiserror::Error;

/// Domain error taxonomy surfaced by the core. The HTTP edge
/// (out of tree) maps each variant to a status code; background workers use
/// [`DomainError::is_transient`] to decide between reschedule-with-backoff
/// and marking a job `FAILED`.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {detail}")]
    ValidationError { detail: String },

    #[error("unsupported format: {sport}/{discipline}/{format}")]
    UnsupportedFormat {
        sport: String,
        discipline: String,
        format: String
    },

    #[error("invalid players: missing={missing:?} wrong_organization={wrong_organization:?}")]
    InvalidPlayers {
        missing: Vec<String>,
        wrong_organization: Vec<String>
    },

    #[error("invalid organization: {organization_id}")]
    InvalidOrganization { organization_id: String },

    #[error("conflict: {detail}")]
    Conflict { detail: String },

    #[error("not found: {what} {id}")]
    NotFound { what: &'static str, id: String },

    #[error("insufficient scope: requires {required}")]
    InsufficientScope { required: String },

    #[error("insufficient grants for organization {organization_id}")]
    InsufficientGrants { organization_id: String },

    #[error("missing token")]
    MissingToken,

    #[error("invalid token: {reason}")]
    InvalidToken { reason: String },

    #[error("internal error: {0}")]
    Internal(String)
}

impl DomainError {
    /// Transient errors are safe to retry with backoff; terminal ones (bad
    /// auth, bad input) should mark the owning job FAILED instead.
    pub fn is_transient(&self) -> bool {
        matches!(self, DomainError::Internal(_))
    }
}

impl From<tokio_postgres::Error> for DomainError {
    fn from(err: tokio_postgres::Error) -> Self {
        DomainError::Internal(err.to_string())
    }
}
