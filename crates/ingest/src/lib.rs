//! Remote CSV ingestion: header discovery, table creation and streaming COPY,
//! plus the worker loop that drives jobs from the queue through the pipeline.

pub mod error;
pub mod header;
pub mod pipeline;
pub mod schema;
pub mod sink;
pub mod source;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use error::IngestError;
pub use pipeline::{CancelProbe, IngestReport, NeverCancelled, Pipeline, PipelineOptions};
pub use schema::TableSchema;
pub use sink::{PgTableSink, TableSink};
pub use source::{ByteStream, HttpSource, Probe, Source};
pub use worker::{JobOutcome, Worker, WorkerOptions};
