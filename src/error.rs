// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelqError {
    #[error("Bad input: {0}")]
    BadInput(String),

    /// Reported on the wire without an `errorType`.
    #[error("Property '{0}' missing")]
    MissingProperty(&'static str),

    #[error("Lease for queue {0} is held by another consumer")]
    LeaseHeld(String),

    #[error("Queue {0} is locked")]
    QueueLocked(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Script {script} failed: {message}")]
    ScriptFailure { script: &'static str, message: String },

    #[error("Processor failed: {0}")]
    ProcessorFailure(String),

    #[error("Processor timed out after {0:?}")]
    ProcessorTimeout(std::time::Duration),

    #[error("memory usage limit reached")]
    MemoryLimitReached,

    #[error("Store disconnected permanently after {0} reconnect attempts")]
    PersistentDisconnect(u32),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelqError {
    /// Stable identifier reported as `errorType` in replies.
    pub fn error_kind(&self) -> &'static str {
        match self {
            RelqError::BadInput(_)
            | RelqError::MissingProperty(_)
            | RelqError::Serialization(_) => "bad input",
            RelqError::LeaseHeld(_) => "lease held",
            RelqError::QueueLocked(_) => "queue locked",
            RelqError::StoreUnavailable(_) | RelqError::Redis(_) => "store unavailable",
            RelqError::ScriptFailure { .. } => "script failure",
            RelqError::ProcessorFailure(_) => "processor failure",
            RelqError::ProcessorTimeout(_) => "processor timeout",
            RelqError::MemoryLimitReached => "memory limit reached",
            RelqError::PersistentDisconnect(_) => "persistent disconnect",
            RelqError::Config(_) => "configuration",
        }
    }

    /// True for faults that the scheduler absorbs and retries on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelqError::LeaseHeld(_)
                | RelqError::QueueLocked(_)
                | RelqError::StoreUnavailable(_)
                | RelqError::ProcessorFailure(_)
                | RelqError::ProcessorTimeout(_)
        )
    }
}

impl From<anyhow::Error> for RelqError {
    fn from(err: anyhow::Error) -> Self {
        RelqError::ProcessorFailure(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, RelqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_limit_message_matches_reply_text() {
        assert_eq!(
            RelqError::MemoryLimitReached.to_string(),
            "memory usage limit reached"
        );
    }

    #[test]
    fn transient_faults_are_classified() {
        assert!(RelqError::LeaseHeld("q".into()).is_transient());
        assert!(RelqError::StoreUnavailable("down".into()).is_transient());
        assert!(!RelqError::BadInput("x".into()).is_transient());
        assert!(!RelqError::PersistentDisconnect(3).is_transient());
    }

    #[test]
    fn processor_errors_convert_from_anyhow() {
        let err: RelqError = anyhow::anyhow!("boom").into();
        assert_eq!(err.error_kind(), "processor failure");
    }
}
