//! Header discovery from the leading bytes of a CSV file.

use std::collections::HashSet;

use csv::{ReaderBuilder, StringRecord, Trim};
use streamload_core::ident::validate_identifier;

use crate::error::IngestError;

const BOM: &str = "\u{feff}";

/// Extract and validate the column names from a header probe.
///
/// `complete` means the probe holds the entire file, in which case a file
/// without any line break is taken to be a lone header line.
pub fn parse_header(probe: &[u8], complete: bool, separator: u8) -> Result<Vec<String>, IngestError> {
    let line = header_line(probe, complete)?;
    let line = std::str::from_utf8(line)
        .map_err(|_| IngestError::MalformedHeader("header line is not valid UTF-8".into()))?;
    let line = line.strip_prefix(BOM).unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.trim().is_empty() {
        return Err(IngestError::MalformedHeader("header line is empty".into()));
    }

    let columns = split_header(line, separator)?;
    validate_columns(&columns)?;
    Ok(columns)
}

fn header_line(probe: &[u8], complete: bool) -> Result<&[u8], IngestError> {
    match probe.iter().position(|&b| b == b'\n') {
        Some(end) => Ok(&probe[..end]),
        None if complete => Ok(probe),
        None => Err(IngestError::MalformedHeader(format!(
            "no line break within the first {} bytes",
            probe.len()
        ))),
    }
}

/// Split the header line into fields: quotes group a field, `""` inside
/// quotes is a literal quote, surrounding whitespace is trimmed.
fn split_header(line: &str, separator: u8) -> Result<Vec<String>, IngestError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(separator)
        .has_headers(false)
        .trim(Trim::All)
        .from_reader(line.as_bytes());
    let mut record = StringRecord::new();
    let found = reader
        .read_record(&mut record)
        .map_err(|e| IngestError::MalformedHeader(e.to_string()))?;
    if !found {
        return Err(IngestError::MalformedHeader("header line is empty".into()));
    }
    Ok(record.iter().map(str::to_string).collect())
}

fn validate_columns(columns: &[String]) -> Result<(), IngestError> {
    let mut seen = HashSet::with_capacity(columns.len());
    for (i, name) in columns.iter().enumerate() {
        if name.is_empty() {
            return Err(IngestError::EmptyColumn { index: i + 1 });
        }
        validate_identifier(name)?;
        // identifiers are always quoted, so "A" and "a" are distinct columns
        if !seen.insert(name.as_str()) {
            return Err(IngestError::DuplicateColumn(name.clone()));
        }
    }
    Ok(())
}
