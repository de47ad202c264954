use std::fmt;

/// Errors that can occur during PTY operations
#[derive(Debug)]
pub enum PtyError {
    /// Failed to create the PTY or spawn the attach child
    SpawnFailed(String),
    /// Failed to write to the PTY
    WriteFailed(String),
    /// Failed to resize the PTY
    ResizeFailed(String),
    /// Failed to kill the PTY process
    KillFailed(String),
    /// Channel communication error (actor is gone)
    ChannelError(String),
}

impl fmt::Display for PtyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PtyError::SpawnFailed(msg) => write!(f, "Failed to spawn PTY: {}", msg),
            PtyError::WriteFailed(msg) => write!(f, "Failed to write to PTY: {}", msg),
            PtyError::ResizeFailed(msg) => write!(f, "Failed to resize PTY: {}", msg),
            PtyError::KillFailed(msg) => write!(f, "Failed to kill PTY: {}", msg),
            PtyError::ChannelError(msg) => write!(f, "Channel error: {}", msg),
        }
    }
}

impl std::error::Error for PtyError {}

impl From<anyhow::Error> for PtyError {
    fn from(err: anyhow::Error) -> Self {
        PtyError::SpawnFailed(err.to_string())
    }
}
