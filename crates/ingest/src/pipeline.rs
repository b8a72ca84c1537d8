//! The ingestion pipeline: probe → header → table → COPY.
//!
//! The file is fetched twice. A bounded probe reads just enough bytes to find
//! the header line. Then the full body is streamed into the sink without ever
//! being buffered whole. While it streams, the job is checked for
//! cancellation at a fixed interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info};

use streamload_core::config::IngestConfig;
use streamload_core::JobPayload;

use crate::error::IngestError;
use crate::header::parse_header;
use crate::schema::TableSchema;
use crate::sink::TableSink;
use crate::source::{ByteStream, Source};

/// Asked periodically whether a running load should stop.
#[async_trait]
pub trait CancelProbe: Send + Sync {
    async fn is_cancelled(&self) -> bool;
}

/// For loads that cannot be cancelled.
pub struct NeverCancelled;

#[async_trait]
impl CancelProbe for NeverCancelled {
    async fn is_cancelled(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub probe_bytes: usize,
    pub cancel_check_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            probe_bytes: 1000,
            cancel_check_interval: Duration::from_secs(2),
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            probe_bytes: config.probe_bytes,
            cancel_check_interval: config.cancel_check_interval(),
        }
    }
}

/// Result of one successful load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: u64,
    pub bytes: u64,
}

pub struct Pipeline {
    source: Arc<dyn Source>,
    sink: Arc<dyn TableSink>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(source: Arc<dyn Source>, sink: Arc<dyn TableSink>, options: PipelineOptions) -> Self {
        Self {
            source,
            sink,
            options,
        }
    }

    pub fn sink(&self) -> &Arc<dyn TableSink> {
        &self.sink
    }

    /// Probe the file and derive the target table from its header.
    pub async fn discover_schema(&self, payload: &JobPayload) -> Result<TableSchema, IngestError> {
        let probe = self
            .source
            .probe(&payload.source_url, self.options.probe_bytes)
            .await?;
        let columns = parse_header(&probe.bytes, probe.complete, payload.separator_byte())?;
        debug!(
            url = %payload.source_url,
            probed = probe.bytes.len(),
            columns = ?columns,
            "header parsed"
        );
        TableSchema::new(payload.table_name.clone(), columns)
    }

    /// Load the file described by `payload` into its table.
    ///
    /// Nothing is written unless the header is valid, and a load that fails
    /// or is cancelled part way leaves no table behind.
    pub async fn run(
        &self,
        payload: &JobPayload,
        cancel: Arc<dyn CancelProbe>,
    ) -> Result<IngestReport, IngestError> {
        payload.validate()?;
        let started = Instant::now();
        let schema = self.discover_schema(payload).await?;

        if cancel.is_cancelled().await {
            return Err(IngestError::Cancelled);
        }

        let body = self.source.open(&payload.source_url).await?;
        let counter = Arc::new(AtomicU64::new(0));
        let body = guard(
            body,
            cancel,
            self.options.cancel_check_interval,
            counter.clone(),
        );
        let rows = self
            .sink
            .load(&schema, payload.separator_byte(), body)
            .await?;

        let bytes = counter.load(Ordering::Relaxed);
        info!(
            table = %schema.table,
            rows = rows,
            bytes = bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "file loaded"
        );
        Ok(IngestReport {
            table: schema.table,
            columns: schema.columns,
            rows,
            bytes,
        })
    }
}

struct Guard {
    body: ByteStream,
    cancel: Arc<dyn CancelProbe>,
    interval: Duration,
    last_check: Instant,
    bytes: Arc<AtomicU64>,
}

/// Wrap `body` so it ends with [`IngestError::Cancelled`] once `cancel` says so.
///
/// The probe is consulted before pulling a chunk, at most once per `interval`.
fn guard(
    body: ByteStream,
    cancel: Arc<dyn CancelProbe>,
    interval: Duration,
    bytes: Arc<AtomicU64>,
) -> ByteStream {
    let state = Guard {
        body,
        cancel,
        interval,
        last_check: Instant::now(),
        bytes,
    };
    stream::unfold(Some(state), |state| async move {
        let mut g = state?;
        if g.last_check.elapsed() >= g.interval {
            g.last_check = Instant::now();
            if g.cancel.is_cancelled().await {
                return Some((Err(IngestError::Cancelled), None));
            }
        }
        match g.body.next().await {
            Some(Ok(chunk)) => {
                g.bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                Some((Ok(chunk), Some(g)))
            }
            Some(Err(e)) => Some((Err(e), None)),
            None => None,
        }
    })
    .boxed()
}
