//! Remote CSV sources.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tracing::debug;

use streamload_core::config::IngestConfig;

use crate::error::IngestError;

/// A file body as a stream of chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, IngestError>>;

/// The first bytes of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub bytes: Bytes,
    /// The source ended within the probe: `bytes` is the whole file.
    pub complete: bool,
}

/// Where CSV files are read from.
#[async_trait]
pub trait Source: Send + Sync {
    /// Read at most `limit` bytes, stopping early at the first line break.
    async fn probe(&self, url: &str, limit: usize) -> Result<Probe, IngestError>;

    /// Stream the full file from its first byte.
    async fn open(&self, url: &str) -> Result<ByteStream, IngestError>;
}

/// Fill a probe from `stream`, reading no further than needed.
pub(crate) async fn read_probe<S>(mut stream: S, limit: usize) -> Result<Probe, IngestError>
where
    S: Stream<Item = Result<Bytes, IngestError>> + Unpin,
{
    let mut buf = BytesMut::with_capacity(limit);
    let mut complete = false;
    loop {
        match stream.next().await {
            Some(chunk) => {
                buf.extend_from_slice(&chunk?);
                if buf.len() >= limit || buf.contains(&b'\n') {
                    break;
                }
            }
            None => {
                complete = true;
                break;
            }
        }
    }
    buf.truncate(limit);
    Ok(Probe {
        bytes: buf.freeze(),
        complete,
    })
}

// ── HTTP ─────────────────────────────────────────────────────────────

/// Plain `GET` over HTTP(S) with a per-chunk read timeout.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    read_timeout: Duration,
}

impl HttpSource {
    pub fn new(client: reqwest::Client, read_timeout: Duration) -> Self {
        Self {
            client,
            read_timeout,
        }
    }

    pub fn from_config(config: &IngestConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(concat!("streamload/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::new(client, config.read_timeout()))
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, IngestError> {
        let response = tokio::time::timeout(self.read_timeout, self.client.get(url).send())
            .await
            .map_err(|_| IngestError::ReadTimeout(self.read_timeout))?
            .map_err(|e| IngestError::fetch(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        debug!(url = %url, content_length = ?response.content_length(), "source responded");
        Ok(response)
    }
}

#[async_trait]
impl Source for HttpSource {
    async fn probe(&self, url: &str, limit: usize) -> Result<Probe, IngestError> {
        // dropping the stream afterwards closes the connection
        let stream = self.open(url).await?;
        read_probe(stream, limit).await
    }

    async fn open(&self, url: &str) -> Result<ByteStream, IngestError> {
        let response = self.get(url).await?;
        let body = Box::pin(response.bytes_stream());
        let read_timeout = self.read_timeout;

        let stream = stream::unfold(Some((body, url.to_string())), move |state| async move {
            let (mut body, url) = state?;
            match tokio::time::timeout(read_timeout, body.next()).await {
                Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some((body, url)))),
                Ok(Some(Err(e))) => Some((Err(IngestError::fetch(&url, e)), None)),
                Ok(None) => None,
                Err(_) => Some((Err(IngestError::ReadTimeout(read_timeout)), None)),
            }
        });
        Ok(stream.boxed())
    }
}
