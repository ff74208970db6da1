use thiserror::Error;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization error: {}", err))
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

impl From<regex::Error> for LedgerError {
    fn from(err: regex::Error) -> Self {
        Self::ConfigError(format!("Invalid PII pattern: {}", err))
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Sensitive data rejected in field '{field}' (pattern: {pattern})")]
    SensitiveDataRejected { field: String, pattern: String },

    #[error("Log store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Append attempted on sealed segment {segment_id}")]
    SealedLedgerWriteAttempt { segment_id: u64 },

    #[error("Segment corrupted at sequence {sequence}: {reason}")]
    Corrupted { sequence: u64, reason: String },

    #[error("Malformed segment: {0}")]
    MalformedSegment(String),

    #[error("Invalid sequence range {from}..={to}")]
    InvalidRange { from: u64, to: u64 },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LedgerError {
    pub fn invalid_record(msg: impl Into<String>) -> Self {
        Self::InvalidRecord(msg.into())
    }

    pub fn store_unavailable(context: &str, err: std::io::Error) -> Self {
        Self::StoreUnavailable(format!("{}: {}", context, err))
    }

    /// Whether the caller may retry the same append unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}
