//! In-memory source and sink for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use csv::ReaderBuilder;
use futures::stream::{self, StreamExt};

use crate::error::IngestError;
use crate::schema::TableSchema;
use crate::sink::TableSink;
use crate::source::{read_probe, ByteStream, Probe, Source};

#[derive(Clone)]
enum Served {
    Chunks(Vec<Bytes>),
    Status(u16),
}

/// Serves fixed bodies by URL. Unknown URLs answer 404.
#[derive(Default)]
pub struct StaticSource {
    files: HashMap<String, Served>,
}

impl StaticSource {
    pub fn with_file(self, url: &str, body: &str) -> Self {
        self.with_chunks(url, &[body])
    }

    pub fn with_chunks(mut self, url: &str, chunks: &[&str]) -> Self {
        let chunks = chunks.iter().map(|c| Bytes::from(c.to_string())).collect();
        self.files.insert(url.to_string(), Served::Chunks(chunks));
        self
    }

    pub fn with_status(mut self, url: &str, status: u16) -> Self {
        self.files.insert(url.to_string(), Served::Status(status));
        self
    }

    fn chunks(&self, url: &str) -> Result<Vec<Bytes>, IngestError> {
        match self.files.get(url) {
            Some(Served::Chunks(chunks)) => Ok(chunks.clone()),
            Some(Served::Status(status)) => Err(IngestError::HttpStatus {
                url: url.to_string(),
                status: *status,
            }),
            None => Err(IngestError::HttpStatus {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

#[async_trait]
impl Source for StaticSource {
    async fn probe(&self, url: &str, limit: usize) -> Result<Probe, IngestError> {
        let chunks = self.chunks(url)?;
        read_probe(stream::iter(chunks.into_iter().map(Ok)), limit).await
    }

    async fn open(&self, url: &str) -> Result<ByteStream, IngestError> {
        let chunks = self.chunks(url)?;
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Parses loaded bodies into rows. A load commits only once the body ended cleanly.
#[derive(Default)]
pub struct MemorySink {
    tables: Mutex<HashMap<String, MemoryTable>>,
    loads: AtomicUsize,
}

impl MemorySink {
    pub fn table(&self, name: &str) -> Option<MemoryTable> {
        self.tables.lock().unwrap().get(name).cloned()
    }

    pub fn load_calls(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TableSink for MemorySink {
    async fn load(&self, schema: &TableSchema, separator: u8, body: ByteStream) -> Result<u64, IngestError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let mut body = body;
        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk?);
        }

        // same reading of the body as COPY ... (FORMAT csv, HEADER true)
        let mut reader = ReaderBuilder::new()
            .delimiter(separator)
            .has_headers(true)
            .from_reader(data.as_slice());
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| IngestError::MalformedHeader(format!("invalid row: {}", e)))?;
            rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
        }

        let count = rows.len() as u64;
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry(schema.table.clone())
            .or_insert_with(|| MemoryTable {
                columns: schema.columns.clone(),
                rows: Vec::new(),
            })
            .rows
            .extend(rows);
        Ok(count)
    }

    async fn drop_table(&self, table: &str) -> Result<(), IngestError> {
        self.tables.lock().unwrap().remove(table);
        Ok(())
    }
}
