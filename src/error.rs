use thiserror::Error;

/// Engine error taxonomy.
///
/// Construction-time failures are returned synchronously; runtime failures on
/// the mixing path are converted into [`crate::events::EngineEvent`]s so the
/// mix cycle is never aborted by a single source or effect.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("decoder failure: {0}")]
    Decoder(String),

    #[error("seek out of range: requested {requested}s, duration {duration}s")]
    SeekOutOfRange { requested: f64, duration: f64 },

    #[error("seek failed: {0}")]
    SeekFailed(String),

    #[error("sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("worker thread failed to stop within {timeout_ms}ms: {name}")]
    TeardownTimeout { name: String, timeout_ms: u64 },

    #[error("recorder failure: {0}")]
    Recorder(String),

    #[error("source limit reached: {limit} sources already attached")]
    SourceLimit { limit: usize },
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_failure() {
        let err = EngineError::SeekOutOfRange {
            requested: 12.5,
            duration: 10.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("12.5"));
        assert!(msg.contains("10"));

        let err = EngineError::SourceLimit { limit: 16 };
        assert!(err.to_string().contains("16"));
    }
}
