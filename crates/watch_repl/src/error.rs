use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplError {
    #[error("timed out waiting for {expected:?}")]
    Timeout { expected: String, buffered: String },

    #[error("transport closed while waiting for {expected:?}")]
    Closed { expected: String },

    #[error("lost sync with the interpreter: {0}")]
    Desync(String),

    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("failed to start transport: {0}")]
    Spawn(String),

    #[error("cannot read {path}: {reason}")]
    Source { path: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unexpected reply from interpreter: {0}")]
    Protocol(String),
}

impl ReplError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ReplError::Timeout { .. } => 3,
            ReplError::Closed { .. } => 4,
            ReplError::Desync(_) => 5,
            _ => 1,
        }
    }
}
