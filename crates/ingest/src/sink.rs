//! Table sinks: where parsed files end up.

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::schema::{drop_table_sql, TableSchema};
use crate::source::ByteStream;

#[async_trait]
pub trait TableSink: Send + Sync {
    /// Create the table if missing and load `body` (header line included) into it.
    ///
    /// Either every row of the file is stored or none is: an error from
    /// `body` abandons the load and leaves no new table behind.
    /// Returns the number of rows loaded.
    async fn load(&self, schema: &TableSchema, separator: u8, body: ByteStream) -> Result<u64, IngestError>;

    async fn drop_table(&self, table: &str) -> Result<(), IngestError>;
}

/// Loads into PostgreSQL with `COPY … FROM STDIN`.
///
/// Table creation and the copy run in one transaction.
#[derive(Clone)]
pub struct PgTableSink {
    pool: PgPool,
}

impl PgTableSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TableSink for PgTableSink {
    async fn load(&self, schema: &TableSchema, separator: u8, body: ByteStream) -> Result<u64, IngestError> {
        let mut body = body;
        let mut tx = self.pool.begin().await?;

        sqlx::query(&schema.create_table_sql())
            .persistent(false)
            .execute(&mut *tx)
            .await?;
        debug!(table = %schema.table, columns = schema.columns.len(), "table ready");

        let mut copy = tx.copy_in_raw(&schema.copy_sql(separator)).await?;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    copy.send(bytes).await?;
                }
                Err(e) => {
                    if let Err(abort_err) = copy.abort(e.to_string()).await {
                        warn!(table = %schema.table, error = %abort_err, "failed to abort COPY");
                    }
                    // dropping tx rolls back the CREATE TABLE as well
                    return Err(e);
                }
            }
        }
        let rows = copy.finish().await?;
        tx.commit().await?;

        info!(table = %schema.table, rows = rows, "COPY committed");
        Ok(rows)
    }

    async fn drop_table(&self, table: &str) -> Result<(), IngestError> {
        sqlx::query(&drop_table_sql(table))
            .persistent(false)
            .execute(&self.pool)
            .await?;
        info!(table = %table, "table dropped");
        Ok(())
    }
}
