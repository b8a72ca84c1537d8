//! Job store trait and lease policy.

use std::time::Duration;

use async_trait::async_trait;

use streamload_core::config::JobsConfig;
use streamload_core::{Job, JobId, JobPayload, JobState};

use crate::error::QueueError;

/// Lease and retry policy shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStoreOptions {
    /// An `active` job whose lease is older than this becomes eligible again.
    pub lease_timeout: Duration,
    /// Maximum number of redeliveries before a job stays `failed`.
    pub retry_limit: u32,
}

impl Default for JobStoreOptions {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(300),
            retry_limit: 3,
        }
    }
}

impl JobStoreOptions {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            lease_timeout: config.lease_timeout(),
            retry_limit: config.retry_limit,
        }
    }
}

/// Durable record of jobs plus FIFO, lease-based delivery per queue name.
///
/// Delivery is at-least-once: a lease that is neither completed nor failed
/// within [`JobStoreOptions::lease_timeout`] is handed out again.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `created` job.
    async fn enqueue(&self, queue_name: &str, payload: JobPayload) -> Result<JobId, QueueError>;

    /// Hand the oldest `created` job of `queue_name` to exactly one caller and mark it `active`.
    ///
    /// Expired leases are reclaimed first. Returns `None` when nothing is eligible.
    async fn lease(&self, queue_name: &str) -> Result<Option<Job>, QueueError>;

    /// `active → completed`.
    ///
    /// `attempt` is [`Job::attempt`] of the leased job. A stale holder gets
    /// [`QueueError::NotActive`] (cancelled, expired to `created`, finished) or
    /// [`QueueError::LeaseLost`] (redelivered and leased again).
    async fn complete(&self, id: JobId, attempt: u32) -> Result<(), QueueError>;

    /// `active → failed`, recording `reason`. Same lease check as [`JobStore::complete`].
    async fn fail(&self, id: JobId, attempt: u32, reason: &str) -> Result<(), QueueError>;

    /// Redeliver an `active` job after a transient failure.
    ///
    /// Goes back to `created` with `retry_count + 1` while under the retry
    /// limit, otherwise to `failed`. Returns the resulting state.
    async fn retry(&self, id: JobId, attempt: u32, reason: &str) -> Result<JobState, QueueError>;

    /// Extend a held lease by resetting its start time.
    ///
    /// Long loads call this periodically so they are not reclaimed while
    /// still making progress. Errors like [`JobStore::complete`] when the
    /// lease is no longer held.
    async fn renew(&self, id: JobId, attempt: u32) -> Result<(), QueueError>;

    /// `created | active → cancelled`. Terminal jobs yield [`QueueError::NotCancellable`].
    async fn cancel(&self, id: JobId) -> Result<(), QueueError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    async fn state(&self, id: JobId) -> Result<Option<JobState>, QueueError> {
        Ok(self.get(id).await?.map(|job| job.state))
    }

    /// Return expired `active` jobs of `queue_name` to `created` (or `failed`
    /// once the retry limit is exhausted). Returns how many jobs were reclaimed.
    async fn expire_leases(&self, queue_name: &str) -> Result<u64, QueueError>;
}

/// Message recorded on jobs reclaimed by [`JobStore::expire_leases`].
pub const LEASE_EXPIRED: &str = "lease expired";
