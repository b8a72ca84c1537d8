use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid identifier '{name}': {reason}")]
    InvalidIdentifier { name: String, reason: String },

    #[error("invalid separator {0:?}: must be a single ASCII character other than quote, backslash or newline")]
    InvalidSeparator(String),

    #[error("invalid source url '{url}': {reason}")]
    InvalidSourceUrl { url: String, reason: String },

    #[error("unknown job state: {0}")]
    UnknownState(String),
}
