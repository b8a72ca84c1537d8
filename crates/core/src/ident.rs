//! SQL identifier rules.
//!
//! Header fields and table names come from outside the process and end up in
//! DDL statements. They are never interpolated raw: [`quote_ident`] wraps them
//! in double quotes, and [`validate_identifier`] rejects what PostgreSQL
//! cannot represent.

use crate::error::CoreError;

/// PostgreSQL truncates identifiers longer than NAMEDATALEN - 1 bytes.
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// Fallback stem when a URL has no usable file name.
const DEFAULT_TABLE_STEM: &str = "import";

pub fn validate_identifier(name: &str) -> Result<(), CoreError> {
    let invalid = |reason: &str| CoreError::InvalidIdentifier {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > MAX_IDENTIFIER_BYTES {
        return Err(invalid(&format!(
            "longer than {} bytes",
            MAX_IDENTIFIER_BYTES
        )));
    }
    if name.contains('\0') {
        return Err(invalid("contains a NUL character"));
    }
    Ok(())
}

/// Tables the service itself owns in a shared database.
const RESERVED_TABLES: &[&str] = &["streamload_jobs", "_sqlx_migrations"];

/// PostgreSQL system catalog prefix.
const RESERVED_PREFIX: &str = "pg_";

/// Rules for a table that a job creates or appends to.
///
/// Stricter than [`validate_identifier`]: lowercase ASCII letters, digits and
/// `_`, not starting with a digit, and never one of the service's own tables
/// or a `pg_` catalog name.
pub fn validate_table_name(name: &str) -> Result<(), CoreError> {
    validate_identifier(name)?;
    let invalid = |reason: &str| CoreError::InvalidIdentifier {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(invalid("only lowercase letters, digits and '_' are allowed"));
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(invalid("must not start with a digit"));
    }
    if name.starts_with(RESERVED_PREFIX) || RESERVED_TABLES.contains(&name) {
        return Err(invalid("reserved table name"));
    }
    Ok(())
}

/// Quote an identifier for use in SQL: `my "col"` → `"my ""col"""`.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for use in SQL: `it's` → `'it''s'`.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Derive a table name from the file name in `source_url` and a timestamp.
///
/// `https://host/path/Sales Report.csv` at 1700000000000 → `sales_report_1700000000000`.
pub fn derive_table_name(source_url: &str, timestamp_millis: i64) -> String {
    let file_stem = url::Url::parse(source_url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(String::from))
        })
        .map(|segment| {
            let decoded = urlencoding::decode(&segment)
                .map(|c| c.into_owned())
                .unwrap_or(segment);
            decoded.split('.').next().unwrap_or_default().to_string()
        })
        .unwrap_or_default();

    let mut stem: String = file_stem
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() { c } else { '_' }
        })
        .collect();

    if stem.trim_matches('_').is_empty() {
        stem = DEFAULT_TABLE_STEM.to_string();
    }
    // checked with the `_` separator in place, so a bare `pg` stem counts too
    let reserved = format!("{}_", stem).starts_with(RESERVED_PREFIX);
    if reserved || stem.starts_with(|c: char| c.is_ascii_digit()) {
        stem.insert_str(0, "t_");
    }

    let suffix = format!("_{}", timestamp_millis);
    stem.truncate(MAX_IDENTIFIER_BYTES.saturating_sub(suffix.len()));
    stem.push_str(&suffix);
    stem
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("orders").is_ok());
        assert!(validate_identifier("Mixed Case; DROP TABLE x").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
        assert!(validate_identifier(&"a".repeat(63)).is_ok());
        assert!(validate_identifier("a\0b").is_err());
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("name"), "\"name\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(
            quote_ident("x\" text); DROP TABLE jobs; --"),
            "\"x\"\" text); DROP TABLE jobs; --\""
        );
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal(","), "','");
        assert_eq!(quote_literal("'"), "''''");
    }

    #[test]
    fn test_derive_table_name_from_file_stem() {
        assert_eq!(
            derive_table_name("https://example.com/data/orders.csv", 1_700_000_000_000),
            "orders_1700000000000"
        );
        assert_eq!(
            derive_table_name("https://example.com/Sales%20Report.v2.csv", 42),
            "sales_report_42"
        );
    }

    #[test]
    fn test_derive_table_name_fallbacks() {
        assert_eq!(derive_table_name("https://example.com/", 7), "import_7");
        assert_eq!(derive_table_name("not a url", 7), "import_7");
        assert_eq!(derive_table_name("https://example.com/2024.csv", 7), "t_2024_7");
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("orders_2024").is_ok());
        assert!(validate_table_name("_staging").is_ok());
        assert!(validate_table_name("Orders").is_err());
        assert!(validate_table_name("my imports").is_err());
        assert!(validate_table_name("1st").is_err());
        assert!(validate_table_name("streamload_jobs").is_err());
        assert!(validate_table_name("_sqlx_migrations").is_err());
        assert!(validate_table_name("pg_authid").is_err());
        assert!(validate_table_name("").is_err());
    }

    #[test]
    fn test_derived_names_are_valid_table_names() {
        for url in [
            "https://example.com/pg_dump.csv",
            "https://example.com/PG.csv",
            "https://example.com/%E2%9C%93%20Caf%C3%A9.csv",
            "https://example.com/99-bottles.csv",
            "https://example.com/streamload_jobs",
            "https://example.com/bad%zzescape.csv",
        ] {
            let name = derive_table_name(url, 1_700_000_000_000);
            assert!(validate_table_name(&name).is_ok(), "{} -> {}", url, name);
        }
        assert_eq!(derive_table_name("https://example.com/pg_dump.csv", 1), "t_pg_dump_1");
    }

    #[test]
    fn test_derive_table_name_fits_identifier_limit() {
        let url = format!("https://example.com/{}.csv", "x".repeat(200));
        let name = derive_table_name(&url, 1_700_000_000_000);
        assert!(name.len() <= MAX_IDENTIFIER_BYTES);
        assert!(name.ends_with("_1700000000000"));
        assert!(validate_identifier(&name).is_ok());
    }
}
