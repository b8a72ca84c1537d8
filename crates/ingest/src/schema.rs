//! Target table shape and the SQL generated from it.

use streamload_core::ident::{quote_ident, quote_literal, validate_identifier};

use crate::error::IngestError;

/// A destination table whose columns are all `text`, in header order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<String>,
}

impl TableSchema {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Result<Self, IngestError> {
        let table = table.into();
        validate_identifier(&table)?;
        if columns.is_empty() {
            return Err(IngestError::MalformedHeader("header has no columns".into()));
        }
        Ok(Self { table, columns })
    }

    fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `CREATE TABLE IF NOT EXISTS` with one `text` column per header field.
    pub fn create_table_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| format!("{} text", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&self.table),
            columns
        )
    }

    /// `COPY … FROM STDIN` for the whole file, header line included.
    pub fn copy_sql(&self, separator: u8) -> String {
        let delimiter = (separator as char).to_string();
        format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT csv, HEADER true, DELIMITER {})",
            quote_ident(&self.table),
            self.column_list(),
            quote_literal(&delimiter)
        )
    }
}

pub fn drop_table_sql(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_ident(table))
}
