use thiserror::Error;

/// Failures that callers of the pipeline need to tell apart.
///
/// Everything that happens inside a running cycle is absorbed by the loop;
/// only `AgentLoop::start` and the incident store mutations hand these back.
#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("invalid source descriptor: {0:?}")]
    InvalidDescriptor(String),

    #[error("source {descriptor} unavailable: {reason}")]
    SourceUnavailable { descriptor: String, reason: String },

    #[error("incident id {0:?} cannot name a file")]
    InvalidIncidentId(String),

    #[error("incident persistence failed: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("incident serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("oracle timed out")]
    OracleTimeout,

    #[error("oracle unavailable: {0}")]
    OracleUnavailable(String),
}

impl SentinelError {
    pub fn unavailable(descriptor: impl Into<String>, reason: impl ToString) -> Self {
        SentinelError::SourceUnavailable {
            descriptor: descriptor.into(),
            reason: reason.to_string(),
        }
    }
}
