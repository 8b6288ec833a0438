//! Error types for the dialogue harness.

/// Top-level error type for harness nodes and wiring.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Node lifecycle or routing error.
    #[error("node error: {0}")]
    Node(String),

    /// Malformed value on an input port.
    #[error("input error: {0}")]
    Input(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// JSON encode/decode error on the node wire format.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, HarnessError>;
