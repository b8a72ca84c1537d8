//! Job store error types.

use thiserror::Error;
use uuid::Uuid;

use streamload_core::{CoreError, JobId, JobState};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The caller's lease is stale: the job was cancelled, expired or already finished.
    #[error("job {id} is not active (state: {state})")]
    NotActive { id: JobId, state: JobState },

    /// The job is `active` again under a newer lease; this holder lost it to expiry.
    #[error("lease on job {id} (attempt {attempt}) was superseded by a redelivery")]
    LeaseLost { id: JobId, attempt: u32 },

    #[error("job {id} cannot be cancelled (state: {state})")]
    NotCancellable { id: JobId, state: JobState },

    #[error("invalid job payload: {0}")]
    InvalidPayload(#[from] CoreError),

    #[error("corrupt job record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl QueueError {
    /// Map to an HTTP status code for API responses.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidPayload(_) => 400,
            Self::NotFound(_) => 404,
            Self::NotActive { .. } | Self::LeaseLost { .. } | Self::NotCancellable { .. } => 409,
            Self::Corrupt { .. } | Self::Database(_) | Self::Migrate(_) => 500,
        }
    }
}
