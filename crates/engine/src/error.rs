use socialmap_core::CoreError;
use socialmap_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("activity not found: {0}")]
    ActivityNotFound(String),

    #[error("tag not found: {0}")]
    TagNotFound(String),

    #[error("participant not found: {0}")]
    ParticipantNotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("tag limit reached: at most {max} tags per participant")]
    TagLimitReached { max: u32 },

    #[error("phase {phase} is not valid for {activity_type} activities")]
    InvalidPhase {
        phase: &'static str,
        activity_type: &'static str,
    },

    #[error("remote store unreachable")]
    RemoteUnavailable,

    #[error("invalid configuration: {0}")]
    Config(String),
}
