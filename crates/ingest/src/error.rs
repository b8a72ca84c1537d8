//! Ingestion error types.

use std::time::Duration;

use thiserror::Error;

use streamload_core::CoreError;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid job: {0}")]
    Validation(#[from] CoreError),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// 1-based column position.
    #[error("header column {index} has an empty name")]
    EmptyColumn { index: usize },

    #[error("duplicate column name '{0}' in header")]
    DuplicateColumn(String),

    #[error("{url} answered with HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("fetching {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("no data received from source within {0:?}")]
    ReadTimeout(Duration),

    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("job was cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn fetch(url: &str, source: reqwest::Error) -> Self {
        Self::Fetch {
            url: url.to_string(),
            source,
        }
    }

    /// Whether another attempt could succeed without the job changing.
    ///
    /// Network trouble, timeouts, 5xx/408/429 answers and lost database
    /// connections are transient. Everything about the file itself is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Fetch { source, .. } => !source.is_builder() && !source.is_redirect(),
            Self::ReadTimeout(_) => true,
            Self::Store(e) => is_transient_sqlx(e),
            Self::Validation(_)
            | Self::MalformedHeader(_)
            | Self::EmptyColumn { .. }
            | Self::DuplicateColumn(_)
            | Self::Cancelled => false,
        }
    }
}

fn is_transient_sqlx(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| {
            // 08 connection exception, 40 transaction rollback,
            // 53 insufficient resources, 57P operator intervention
            code.starts_with("08")
                || code.starts_with("40")
                || code.starts_with("53")
                || code.starts_with("57P")
        }),
        _ => false,
    }
}
