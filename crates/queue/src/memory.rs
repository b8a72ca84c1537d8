//! In-memory job store for tests and local development.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use streamload_core::{Job, JobId, JobPayload, JobState};

use crate::error::QueueError;
use crate::store::{JobStore, JobStoreOptions, LEASE_EXPIRED};

struct Entry {
    /// Arrival order; ties on `created_at` are common in tight loops.
    seq: u64,
    job: Job,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
}

impl Inner {
    fn job_mut(&mut self, id: JobId) -> Result<&mut Job, QueueError> {
        self.jobs
            .get_mut(&id)
            .map(|e| &mut e.job)
            .ok_or(QueueError::NotFound(id))
    }

    /// The job, if `attempt` still holds its lease.
    fn leased_mut(&mut self, id: JobId, attempt: u32) -> Result<&mut Job, QueueError> {
        let job = self.job_mut(id)?;
        if job.state != JobState::Active {
            return Err(QueueError::NotActive { id, state: job.state });
        }
        if job.attempt() != attempt {
            return Err(QueueError::LeaseLost { id, attempt });
        }
        Ok(job)
    }

    fn expire(&mut self, queue_name: &str, options: &JobStoreOptions) -> u64 {
        let now = Utc::now();
        let mut reclaimed = 0;
        for entry in self.jobs.values_mut() {
            let job = &mut entry.job;
            if job.state != JobState::Active || job.queue_name != queue_name {
                continue;
            }
            let expired = job
                .started_at
                .and_then(|started| now.signed_duration_since(started).to_std().ok())
                .is_some_and(|elapsed| elapsed >= options.lease_timeout);
            if !expired {
                continue;
            }
            redeliver_or_fail(job, options.retry_limit, LEASE_EXPIRED);
            warn!(job_id = %job.id, state = %job.state, retry_count = job.retry_count, "lease expired");
            reclaimed += 1;
        }
        reclaimed
    }
}

/// Shared by `retry` and lease expiry.
fn redeliver_or_fail(job: &mut Job, retry_limit: u32, reason: &str) {
    if job.retry_count >= retry_limit {
        job.state = JobState::Failed;
        job.completed_at = Some(Utc::now());
    } else {
        job.state = JobState::Created;
        job.retry_count += 1;
        job.started_at = None;
    }
    job.last_error = Some(reason.to_string());
}

/// Job store backed by a `HashMap` behind a tokio mutex.
pub struct InMemoryJobStore {
    options: JobStoreOptions,
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new(options: JobStoreOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(JobStoreOptions::default())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, queue_name: &str, payload: JobPayload) -> Result<JobId, QueueError> {
        payload.validate()?;
        let job = Job::new(queue_name, payload);
        let id = job.id;
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(id, Entry { seq, job });
        debug!(job_id = %id, queue = %queue_name, "job enqueued");
        Ok(id)
    }

    async fn lease(&self, queue_name: &str) -> Result<Option<Job>, QueueError> {
        let mut inner = self.inner.lock().await;
        inner.expire(queue_name, &self.options);

        let next = inner
            .jobs
            .values()
            .filter(|e| e.job.queue_name == queue_name && e.job.state == JobState::Created)
            .min_by_key(|e| e.seq)
            .map(|e| e.job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let job = inner.job_mut(id)?;
        job.state = JobState::Active;
        job.started_at = Some(Utc::now());
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: JobId, attempt: u32) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let job = inner.leased_mut(id, attempt)?;
        job.state = JobState::Completed;
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn fail(&self, id: JobId, attempt: u32, reason: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let job = inner.leased_mut(id, attempt)?;
        job.state = JobState::Failed;
        job.completed_at = Some(Utc::now());
        job.last_error = Some(reason.to_string());
        Ok(())
    }

    async fn retry(&self, id: JobId, attempt: u32, reason: &str) -> Result<JobState, QueueError> {
        let mut inner = self.inner.lock().await;
        let job = inner.leased_mut(id, attempt)?;
        redeliver_or_fail(job, self.options.retry_limit, reason);
        Ok(job.state)
    }

    async fn renew(&self, id: JobId, attempt: u32) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let job = inner.leased_mut(id, attempt)?;
        job.started_at = Some(Utc::now());
        Ok(())
    }

    async fn cancel(&self, id: JobId) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let job = inner.job_mut(id)?;
        if !job.state.is_cancellable() {
            return Err(QueueError::NotCancellable { id, state: job.state });
        }
        job.state = JobState::Cancelled;
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(&id).map(|e| e.job.clone()))
    }

    async fn expire_leases(&self, queue_name: &str) -> Result<u64, QueueError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.expire(queue_name, &self.options))
    }
}
