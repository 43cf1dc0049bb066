use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("clock drift too large: remote is {delta_ms}ms ahead (max {max_ms}ms)")]
    ClockDriftTooLarge { delta_ms: i64, max_ms: i64 },

    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
