use thiserror::Error;

/// Closed error taxonomy for the mission engine. Each variant is a
/// *kind*, not a wrapped library error — callers branch on the variant
/// to decide retry/defer/fail, so this intentionally does not collapse
/// into a single opaque `anyhow::Error`.
#[derive(Error, Debug)]
pub enum MissionEngineError {
    #[error("objective rejected: {0}")]
    InputRejected(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("retryable: {0}")]
    Retryable(String),

    #[error("non-retryable: {0}")]
    NonRetryable(String),

    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("invariant violated: {0}")]
    Critical(String),

    #[error("mission not found: {0}")]
    MissionNotFound(String),

    #[error("mission is in a terminal state: {0}")]
    MissionTerminal(String),

    #[error("duplicate mission from same owner within dedup window: {0}")]
    DuplicateMission(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MissionEngineError>;

/// Tauri-style manual serialize so this error can cross the HTTP
/// boundary as a plain string without leaking a raw backtrace.
impl serde::Serialize for MissionEngineError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
