//! Job data model shared by the store, the worker and the submission façade.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::ident;

/// Queue name used for remote file downloads.
pub const DOWNLOAD_QUEUE: &str = "download_file";

/// Separator used when the submission does not provide one.
pub const DEFAULT_SEPARATOR: char = ',';

// ── JobId ─────────────────────────────────────────────────────

/// Unique, immutable job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

// ── JobState ──────────────────────────────────────────────────

/// Lifecycle state of a job.
///
/// `created → active → {completed, failed}`, and `created | active → cancelled`.
/// An `active` job may go back to `created` when it is redelivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Created,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobState::Created | JobState::Active)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Created, Active)
                | (Created, Cancelled)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Cancelled)
                | (Active, Created)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobState::Created),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(CoreError::UnknownState(other.to_string())),
        }
    }
}

// ── Payload ───────────────────────────────────────────────────

/// What a download job has to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub source_url: String,
    pub separator: char,
    pub table_name: String,
}

impl JobPayload {
    /// Build a validated payload.
    pub fn new(
        source_url: impl Into<String>,
        separator: char,
        table_name: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let payload = Self {
            source_url: source_url.into(),
            separator,
            table_name: table_name.into(),
        };
        payload.validate()?;
        Ok(payload)
    }

    /// Check every field; used again by the worker since payloads are read back from storage.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_source_url(&self.source_url)?;
        validate_separator(self.separator)?;
        ident::validate_table_name(&self.table_name)?;
        Ok(())
    }

    /// The separator as the single byte PostgreSQL expects for `DELIMITER`.
    pub fn separator_byte(&self) -> u8 {
        // validate() guarantees ASCII
        self.separator as u8
    }
}

/// Parse a user-supplied separator string. Empty input means the default.
pub fn parse_separator(raw: Option<&str>) -> Result<char, CoreError> {
    let raw = match raw {
        None | Some("") => return Ok(DEFAULT_SEPARATOR),
        Some(s) => s,
    };
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => {
            validate_separator(c)?;
            Ok(c)
        }
        _ => Err(CoreError::InvalidSeparator(raw.to_string())),
    }
}

pub fn validate_separator(c: char) -> Result<(), CoreError> {
    if !c.is_ascii() || matches!(c, '"' | '\\' | '\r' | '\n' | '\0') {
        return Err(CoreError::InvalidSeparator(c.to_string()));
    }
    Ok(())
}

pub fn validate_source_url(raw: &str) -> Result<(), CoreError> {
    let invalid = |reason: &str| CoreError::InvalidSourceUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };
    let parsed = url::Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(&format!("unsupported scheme '{}'", other))),
    }
}

// ── Job ───────────────────────────────────────────────────────

/// A durable job record as held by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub payload: JobPayload,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Cause recorded with the most recent failure, retry or lease expiry.
    pub last_error: Option<String>,
}

impl Job {
    /// A fresh `created` job.
    pub fn new(queue_name: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            id: JobId::new(),
            queue_name: queue_name.into(),
            payload,
            state: JobState::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Lease generation: every redelivery bumps `retry_count`, so a lease
    /// taken before an expiry no longer matches the stored row.
    pub fn attempt(&self) -> u32 {
        self.retry_count
    }
}
