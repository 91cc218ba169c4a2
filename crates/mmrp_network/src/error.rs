//! Mesh error types.

/// Errors that can occur in the mmrp_network crate.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// An envelope could not be constructed from the given inputs.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// A frame sequence received off the wire could not be parsed.
    #[error("Malformed frames: {0}")]
    Malformed(String),

    /// The relay socket could not bind its listen address.
    #[error("Cannot bind {addr}: {source} (hint: {hint})")]
    Bind {
        addr: String,
        hint: String,
        #[source]
        source: std::io::Error,
    },

    /// No connection to the destination identity exists (yet).
    #[error("Destination unreachable: {0}")]
    Unreachable(String),

    /// A transport-level failure (socket write, link setup).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The node or socket is configured in a way that cannot work.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The node has neither a relay nor a client socket to send through.
    #[error("Node has no socket to send through")]
    NoTransport,

    /// The node or socket has been closed.
    #[error("Node is closed")]
    Closed,

    /// Discovery asked to disconnect a relay at an address we do not know it by.
    #[error("Relay {cluster_id} is registered at {stored:?}, refusing to disconnect {requested}")]
    UriMismatch {
        cluster_id: String,
        stored: Option<String>,
        requested: String,
    },

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Whether a send that failed with this error may succeed on a later
    /// attempt (the mesh converging after a topology change).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Transport(_))
    }
}
