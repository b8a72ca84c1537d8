use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::job::DOWNLOAD_QUEUE;

/// Load `.env` if present; a missing file is not an error.
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Look up `{PROFILE}_{KEY}`, then `{KEY}`. Empty values count as unset.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    let lookup = |k: &str| env::var(k).ok().filter(|v| !v.is_empty());
    (!profile.is_empty())
        .then(|| lookup(&format!("{}_{}", profile, key)))
        .flatten()
        .or_else(|| lookup(key))
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

/// Parsed numeric setting; an unparsable value falls back to `default` with a warning.
fn profiled_env_parse<T: FromStr + Display>(profile: &str, key: &str, default: T) -> T {
    match profiled_env_opt(profile, key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key = %key, value = %raw, default = %default, "ignoring unparsable setting");
            default
        }),
        None => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    /// Database the CSV files are loaded into.
    pub postgres: PostgresConfig,
    pub jobs: JobsConfig,
    pub ingest: IngestConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `STREAMLOAD_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env::var("STREAMLOAD_PROFILE").unwrap_or_default().to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            server: ServerConfig::from_env_profiled(p),
            postgres: PostgresConfig::from_env_profiled(p, ""),
            jobs: JobsConfig::from_env_profiled(p),
            ingest: IngestConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:    {}:{}", self.server.host, self.server.port);
        tracing::info!("  postgres:  host={}, db={}", self.postgres.host, self.postgres.database);
        tracing::info!(
            "  jobs:      host={}, db={}, queue={}, lease_timeout={}s, retry_limit={}",
            self.jobs.database.host,
            self.jobs.database.database,
            self.jobs.queue,
            self.jobs.lease_timeout_secs,
            self.jobs.retry_limit
        );
        tracing::info!(
            "  ingest:    probe_bytes={}, read_timeout={}s",
            self.ingest.probe_bytes,
            self.ingest.read_timeout_secs
        );
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "HOST", "0.0.0.0"),
            port: profiled_env_parse(p, "PORT", 3000),
        }
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    /// `prefix` namespaces the keys, e.g. `JOBS_` reads `JOBS_PG_HOST`.
    fn from_env_profiled(p: &str, prefix: &str) -> Self {
        let key = |k: &str| format!("{}{}", prefix, k);
        Self {
            host: profiled_env_or(p, &key("PG_HOST"), "localhost"),
            port: profiled_env_parse(p, &key("PG_PORT"), 5432),
            database: profiled_env_or(p, &key("PG_DATABASE"), "postgres"),
            username: profiled_env_opt(p, &key("PG_USERNAME")),
            password: profiled_env_opt(p, &key("PG_PASSWORD")),
            ssl_mode: profiled_env_or(p, &key("PG_SSL_MODE"), "prefer"),
            max_connections: profiled_env_parse(p, &key("PG_MAX_CONNECTIONS"), 10),
        }
    }

    /// Connection options built field by field, so credentials containing
    /// `@`, `:` or `/` need no escaping.
    pub fn connect_options(&self) -> PgConnectOptions {
        let ssl_mode = self.ssl_mode.parse::<PgSslMode>().unwrap_or_else(|_| {
            tracing::warn!(ssl_mode = %self.ssl_mode, "unknown PG_SSL_MODE, using 'prefer'");
            PgSslMode::Prefer
        });
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(self.username.as_deref().unwrap_or("postgres"))
            .ssl_mode(ssl_mode);
        match self.password.as_deref() {
            Some(password) => options.password(password),
            None => options,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

// ── Job store / queue ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Database holding the `jobs` table (keys prefixed with `JOBS_`).
    pub database: PostgresConfig,
    pub queue: String,
    pub lease_timeout_secs: u64,
    pub retry_limit: u32,
    pub poll_interval_ms: u64,
    pub max_backoff_secs: u64,
}

impl JobsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            database: PostgresConfig::from_env_profiled(p, "JOBS_"),
            queue: profiled_env_or(p, "JOBS_QUEUE", DOWNLOAD_QUEUE),
            lease_timeout_secs: profiled_env_parse(p, "JOBS_LEASE_TIMEOUT_SECS", 300),
            retry_limit: profiled_env_parse(p, "JOBS_RETRY_LIMIT", 3),
            poll_interval_ms: profiled_env_parse(p, "JOBS_POLL_INTERVAL_MS", 1000),
            max_backoff_secs: profiled_env_parse(p, "JOBS_MAX_BACKOFF_SECS", 30),
        }
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

// ── Ingestion ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Upper bound on the bytes read to discover the header line.
    pub probe_bytes: usize,
    pub connect_timeout_secs: u64,
    /// Max wait for a single chunk from the source.
    pub read_timeout_secs: u64,
    /// How often a running load checks whether its job was cancelled.
    pub cancel_check_ms: u64,
}

impl IngestConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            probe_bytes: profiled_env_parse::<usize>(p, "INGEST_PROBE_BYTES", 1000),
            connect_timeout_secs: profiled_env_parse(p, "INGEST_CONNECT_TIMEOUT_SECS", 10),
            read_timeout_secs: profiled_env_parse(p, "INGEST_READ_TIMEOUT_SECS", 30),
            cancel_check_ms: profiled_env_parse(p, "INGEST_CANCEL_CHECK_MS", 2000),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn cancel_check_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_check_ms)
    }
}
