use thiserror::Error;

/// Error kinds surfaced by the hibernator components.
///
/// Config errors are fatal at startup. Transport/Decode/Rpc errors are
/// surfaced to the caller, which decides whether to retry. Busy and
/// ConsensusViolation are transient and expected during normal operation.
#[derive(Debug, Error)]
pub enum HibernatorError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transport failure calling {url}: {reason}")]
    Transport { url: String, reason: String },

    #[error("response decode failed: {0}")]
    Decode(String),

    #[error("rpc error: code = {code}, message = {message}, data = {data}")]
    Rpc {
        code: i64,
        message: String,
        data: serde_json::Value,
    },

    #[error("node is busy: {0}")]
    Busy(String),

    #[error("{0}")]
    ConsensusViolation(String),

    #[error("some participants are down: {0}")]
    ParticipantUnavailable(String),

    #[error("process {name} failed to {operation}")]
    ProcessLifecycle { name: String, operation: String },
}

impl HibernatorError {
    pub fn config(msg: impl Into<String>) -> Self {
        HibernatorError::Config(msg.into())
    }

    pub fn transport(url: impl Into<String>, reason: impl ToString) -> Self {
        HibernatorError::Transport {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// True for the transient kinds a caller may simply retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HibernatorError::Busy(_) | HibernatorError::ConsensusViolation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HibernatorError>;
