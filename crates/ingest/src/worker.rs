//! Worker loop: lease a job, run the pipeline, record the outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use streamload_core::config::JobsConfig;
use streamload_core::{Job, JobId, JobState, DOWNLOAD_QUEUE};
use streamload_queue::{JobStore, QueueError};

use crate::error::IngestError;
use crate::pipeline::{CancelProbe, Pipeline};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub queue: String,
    /// Delay after an empty poll. Doubles on each further empty poll or store error.
    pub poll_interval: Duration,
    pub max_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            queue: DOWNLOAD_QUEUE.to_string(),
            poll_interval: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl WorkerOptions {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            queue: config.queue.clone(),
            poll_interval: config.poll_interval(),
            max_backoff: config.max_backoff(),
        }
    }
}

/// What happened to a leased job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { rows: u64 },
    /// Transient failure, back in the queue.
    Retrying,
    Failed,
    /// Cancellation was noticed while the file was streaming.
    Cancelled,
    /// The lease was lost before the result could be recorded.
    Discarded,
}

/// Cancellation check for one leased job.
///
/// Each check renews the lease, so a load that keeps making progress is not
/// reclaimed. The load stops once the lease is gone: the job was cancelled,
/// or its lease expired and the job went back to the queue.
struct JobCancelProbe {
    store: Arc<dyn JobStore>,
    id: JobId,
    attempt: u32,
}

#[async_trait]
impl CancelProbe for JobCancelProbe {
    async fn is_cancelled(&self) -> bool {
        match self.store.renew(self.id, self.attempt).await {
            Ok(()) => false,
            Err(e @ (QueueError::NotActive { .. } | QueueError::LeaseLost { .. } | QueueError::NotFound(_))) => {
                debug!(job_id = %self.id, reason = %e, "lease no longer held, stopping load");
                true
            }
            Err(e) => {
                // keep going: the final transition will surface a real store outage
                warn!(job_id = %self.id, error = %e, "lease renewal failed");
                false
            }
        }
    }
}

pub struct Worker {
    store: Arc<dyn JobStore>,
    pipeline: Arc<Pipeline>,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(store: Arc<dyn JobStore>, pipeline: Arc<Pipeline>, options: WorkerOptions) -> Self {
        Self {
            store,
            pipeline,
            options,
        }
    }

    /// Lease and process at most one job.
    ///
    /// Returns `None` when the queue had nothing to hand out.
    pub async fn run_once(&self) -> Result<Option<(JobId, JobOutcome)>, QueueError> {
        let Some(job) = self.store.lease(&self.options.queue).await? else {
            return Ok(None);
        };
        let id = job.id;
        let outcome = self.process(job).await?;
        Ok(Some((id, outcome)))
    }

    /// Run the pipeline for a leased job and record the result in the store.
    pub async fn process(&self, job: Job) -> Result<JobOutcome, QueueError> {
        let id = job.id;
        let attempt = job.attempt();
        info!(
            job_id = %id,
            table = %job.payload.table_name,
            url = %job.payload.source_url,
            retry_count = job.retry_count,
            "processing job"
        );

        let cancel: Arc<dyn CancelProbe> = Arc::new(JobCancelProbe {
            store: self.store.clone(),
            id,
            attempt,
        });

        match self.pipeline.run(&job.payload, cancel).await {
            Ok(report) => match self.store.complete(id, attempt).await {
                Ok(()) => {
                    info!(job_id = %id, table = %report.table, rows = report.rows, "job completed");
                    Ok(JobOutcome::Completed { rows: report.rows })
                }
                Err(QueueError::NotActive {
                    state: JobState::Cancelled,
                    ..
                }) => {
                    // cancelled after the COPY committed
                    warn!(job_id = %id, table = %report.table, "job cancelled during load, dropping table");
                    if let Err(e) = self.pipeline.sink().drop_table(&report.table).await {
                        error!(job_id = %id, table = %report.table, error = %e, "failed to drop table of cancelled job");
                    }
                    Ok(JobOutcome::Discarded)
                }
                Err(e @ (QueueError::NotActive { .. } | QueueError::LeaseLost { .. })) => {
                    warn!(job_id = %id, reason = %e, "lease lost before completion");
                    Ok(JobOutcome::Discarded)
                }
                Err(e) => Err(e),
            },
            Err(IngestError::Cancelled) => match self.store.state(id).await? {
                Some(JobState::Cancelled) => {
                    info!(job_id = %id, "job cancelled, load abandoned");
                    Ok(JobOutcome::Cancelled)
                }
                state => {
                    warn!(job_id = %id, state = ?state, "lease reclaimed during load, load abandoned");
                    Ok(JobOutcome::Discarded)
                }
            },
            Err(e) if e.is_transient() => {
                let reason = e.to_string();
                warn!(job_id = %id, error = %reason, "transient ingestion failure");
                match self.store.retry(id, attempt, &reason).await {
                    Ok(JobState::Failed) => {
                        error!(job_id = %id, "retry limit reached, job failed");
                        Ok(JobOutcome::Failed)
                    }
                    Ok(_) => Ok(JobOutcome::Retrying),
                    Err(e @ (QueueError::NotActive { .. } | QueueError::LeaseLost { .. })) => {
                        debug!(job_id = %id, reason = %e, "lease lost before retry");
                        Ok(JobOutcome::Discarded)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => {
                let reason = e.to_string();
                error!(job_id = %id, error = %reason, "ingestion failed");
                match self.store.fail(id, attempt, &reason).await {
                    Ok(()) => Ok(JobOutcome::Failed),
                    Err(e @ (QueueError::NotActive { .. } | QueueError::LeaseLost { .. })) => {
                        debug!(job_id = %id, reason = %e, "lease lost before failure");
                        Ok(JobOutcome::Discarded)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Poll until `shutdown` turns true (or its sender is dropped).
    ///
    /// A job in progress is always finished before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.options.queue, "worker started");
        let mut idle = self.options.poll_interval;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_once().await {
                Ok(Some((id, outcome))) => {
                    debug!(job_id = %id, outcome = ?outcome, "job processed");
                    idle = self.options.poll_interval;
                    continue;
                }
                Ok(None) => idle,
                Err(e) => {
                    error!(queue = %self.options.queue, error = %e, "job store error");
                    idle
                }
            };
            idle = (idle * 2).min(self.options.max_backoff);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(queue = %self.options.queue, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use streamload_core::JobPayload;
    use streamload_queue::{InMemoryJobStore, JobStoreOptions};

    use crate::error::IngestError;
    use crate::pipeline::PipelineOptions;
    use crate::schema::TableSchema;
    use crate::sink::TableSink;
    use crate::source::{ByteStream, Probe, Source};
    use crate::testing::{MemorySink, StaticSource};

    const URL: &str = "http://files.local/people.csv";

    fn payload() -> JobPayload {
        JobPayload::new(URL, ',', "people_1").unwrap()
    }

    fn options() -> WorkerOptions {
        WorkerOptions {
            queue: DOWNLOAD_QUEUE.to_string(),
            poll_interval: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    fn worker(
        store: Arc<InMemoryJobStore>,
        source: Arc<dyn Source>,
        sink: Arc<dyn TableSink>,
        interval: Duration,
    ) -> Worker {
        let pipeline = Pipeline::new(
            source,
            sink,
            PipelineOptions {
                probe_bytes: 1000,
                cancel_check_interval: interval,
            },
        );
        Worker::new(store, Arc::new(pipeline), options())
    }

    fn static_worker(store: Arc<InMemoryJobStore>, source: StaticSource, sink: Arc<MemorySink>) -> Worker {
        worker(store, Arc::new(source), sink, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let store = Arc::new(InMemoryJobStore::default());
        let w = static_worker(store, StaticSource::default(), Arc::new(MemorySink::default()));
        assert_eq!(w.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_success_completes_job() {
        let store = Arc::new(InMemoryJobStore::default());
        let sink = Arc::new(MemorySink::default());
        let source = StaticSource::default().with_file(URL, "name,age\nada,36\n");
        let id = store.enqueue(DOWNLOAD_QUEUE, payload()).await.unwrap();

        let w = static_worker(store.clone(), source, sink.clone());
        assert_eq!(
            w.run_once().await.unwrap(),
            Some((id, JobOutcome::Completed { rows: 1 }))
        );
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.completed_at.is_some());
        assert_eq!(sink.table("people_1").unwrap().rows, vec![vec!["ada", "36"]]);
    }

    #[tokio::test]
    async fn test_bad_header_fails_job() {
        let store = Arc::new(InMemoryJobStore::default());
        let sink = Arc::new(MemorySink::default());
        let source = StaticSource::default().with_file(URL, "a,a,b\n1,2,3\n");
        let id = store.enqueue(DOWNLOAD_QUEUE, payload()).await.unwrap();

        let w = static_worker(store.clone(), source, sink.clone());
        assert_eq!(w.run_once().await.unwrap(), Some((id, JobOutcome::Failed)));
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.last_error.unwrap().contains("duplicate column"));
        assert!(sink.table("people_1").is_none());
    }

    #[tokio::test]
    async fn test_not_found_is_permanent() {
        let store = Arc::new(InMemoryJobStore::default());
        let id = store.enqueue(DOWNLOAD_QUEUE, payload()).await.unwrap();
        let w = static_worker(store.clone(), StaticSource::default(), Arc::new(MemorySink::default()));

        assert_eq!(w.run_once().await.unwrap(), Some((id, JobOutcome::Failed)));
        assert_eq!(store.get(id).await.unwrap().unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_until_limit() {
        let store = Arc::new(InMemoryJobStore::new(JobStoreOptions {
            retry_limit: 1,
            ..JobStoreOptions::default()
        }));
        let source = StaticSource::default().with_status(URL, 503);
        let id = store.enqueue(DOWNLOAD_QUEUE, payload()).await.unwrap();
        let w = static_worker(store.clone(), source, Arc::new(MemorySink::default()));

        assert_eq!(w.run_once().await.unwrap(), Some((id, JobOutcome::Retrying)));
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Created);
        assert_eq!(job.retry_count, 1);

        assert_eq!(w.run_once().await.unwrap(), Some((id, JobOutcome::Failed)));
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.last_error.unwrap().contains("503"));
    }

    /// Cancels the job as soon as the body is opened.
    struct CancellingSource {
        inner: StaticSource,
        store: Arc<InMemoryJobStore>,
        id: JobId,
    }

    #[async_trait]
    impl Source for CancellingSource {
        async fn probe(&self, url: &str, limit: usize) -> Result<Probe, IngestError> {
            self.inner.probe(url, limit).await
        }

        async fn open(&self, url: &str) -> Result<ByteStream, IngestError> {
            self.store.cancel(self.id).await.unwrap();
            self.inner.open(url).await
        }
    }

    #[tokio::test]
    async fn test_cancel_while_streaming() {
        let store = Arc::new(InMemoryJobStore::default());
        let sink = Arc::new(MemorySink::default());
        let id = store.enqueue(DOWNLOAD_QUEUE, payload()).await.unwrap();
        let source = CancellingSource {
            inner: StaticSource::default().with_chunks(URL, &["a\n", "1\n"]),
            store: store.clone(),
            id,
        };

        let w = worker(store.clone(), Arc::new(source), sink.clone(), Duration::ZERO);
        assert_eq!(w.run_once().await.unwrap(), Some((id, JobOutcome::Cancelled)));
        assert_eq!(store.state(id).await.unwrap(), Some(JobState::Cancelled));
        assert!(sink.table("people_1").is_none());
    }

    /// Lets the job's lease expire and hands it to another worker as soon as
    /// the body is opened.
    struct StealingSource {
        inner: StaticSource,
        store: Arc<InMemoryJobStore>,
    }

    #[async_trait]
    impl Source for StealingSource {
        async fn probe(&self, url: &str, limit: usize) -> Result<Probe, IngestError> {
            self.inner.probe(url, limit).await
        }

        async fn open(&self, url: &str) -> Result<ByteStream, IngestError> {
            let job = self.store.lease(DOWNLOAD_QUEUE).await.unwrap();
            assert!(job.is_some(), "expired job was not redelivered");
            self.inner.open(url).await
        }
    }

    #[tokio::test]
    async fn test_reclaimed_lease_stops_load() {
        let store = Arc::new(InMemoryJobStore::new(JobStoreOptions {
            lease_timeout: Duration::ZERO,
            retry_limit: 3,
        }));
        let sink = Arc::new(MemorySink::default());
        let id = store.enqueue(DOWNLOAD_QUEUE, payload()).await.unwrap();
        let source = StealingSource {
            inner: StaticSource::default().with_chunks(URL, &["a\n", "1\n"]),
            store: store.clone(),
        };

        let w = worker(store.clone(), Arc::new(source), sink.clone(), Duration::ZERO);
        assert_eq!(w.run_once().await.unwrap(), Some((id, JobOutcome::Discarded)));

        // the second holder still owns the job; the first load left nothing behind
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.retry_count, 1);
        assert_eq!(sink.load_calls(), 1);
        assert!(sink.table("people_1").is_none());
        store.complete(id, job.attempt()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_worker_cannot_complete_redelivered_job() {
        let store = Arc::new(InMemoryJobStore::new(JobStoreOptions {
            lease_timeout: Duration::ZERO,
            retry_limit: 3,
        }));
        let sink = Arc::new(MemorySink::default());
        let id = store.enqueue(DOWNLOAD_QUEUE, payload()).await.unwrap();
        let stale = store.lease(DOWNLOAD_QUEUE).await.unwrap().unwrap();
        // the lease expires and a second worker takes the job
        let current = store.lease(DOWNLOAD_QUEUE).await.unwrap().unwrap();

        let source = StaticSource::default().with_file(URL, "a\n1\n");
        let w = worker(store.clone(), Arc::new(source), sink, Duration::from_secs(60));
        assert_eq!(w.process(stale).await.unwrap(), JobOutcome::Discarded);
        assert_eq!(store.state(id).await.unwrap(), Some(JobState::Active));
        store.complete(id, current.attempt()).await.unwrap();
    }

    /// Cancels the job right after a successful load.
    struct CancelAfterLoad {
        inner: Arc<MemorySink>,
        store: Arc<InMemoryJobStore>,
        id: JobId,
    }

    #[async_trait]
    impl TableSink for CancelAfterLoad {
        async fn load(&self, schema: &TableSchema, separator: u8, body: ByteStream) -> Result<u64, IngestError> {
            let rows = self.inner.load(schema, separator, body).await?;
            self.store.cancel(self.id).await.unwrap();
            Ok(rows)
        }

        async fn drop_table(&self, table: &str) -> Result<(), IngestError> {
            self.inner.drop_table(table).await
        }
    }

    #[tokio::test]
    async fn test_cancel_after_commit_drops_table() {
        let store = Arc::new(InMemoryJobStore::default());
        let memory = Arc::new(MemorySink::default());
        let id = store.enqueue(DOWNLOAD_QUEUE, payload()).await.unwrap();
        let sink = CancelAfterLoad {
            inner: memory.clone(),
            store: store.clone(),
            id,
        };
        let source = StaticSource::default().with_file(URL, "a\n1\n");

        let w = worker(store.clone(), Arc::new(source), Arc::new(sink), Duration::from_secs(60));
        assert_eq!(w.run_once().await.unwrap(), Some((id, JobOutcome::Discarded)));
        assert_eq!(store.state(id).await.unwrap(), Some(JobState::Cancelled));
        assert_eq!(memory.load_calls(), 1);
        assert!(memory.table("people_1").is_none());
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops_on_shutdown() {
        let store = Arc::new(InMemoryJobStore::default());
        let sink = Arc::new(MemorySink::default());
        let source = StaticSource::default().with_file(URL, "a\n1\n");
        let first = store.enqueue(DOWNLOAD_QUEUE, payload()).await.unwrap();
        let second = store.enqueue(DOWNLOAD_QUEUE, payload()).await.unwrap();

        let w = Arc::new(static_worker(store.clone(), source, sink.clone()));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let w = w.clone();
            async move { w.run(rx).await }
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let done = store.state(first).await.unwrap() == Some(JobState::Completed)
                && store.state(second).await.unwrap() == Some(JobState::Completed);
            if done {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "jobs were not processed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
        assert_eq!(sink.table("people_1").unwrap().rows.len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_when_sender_dropped() {
        let store = Arc::new(InMemoryJobStore::default());
        let w = static_worker(store, StaticSource::default(), Arc::new(MemorySink::default()));
        let (tx, rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), w.run(rx))
            .await
            .expect("worker did not stop");
    }
}
