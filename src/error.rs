/// Error types for chat-mesh coordination.
///
/// Every fallible operation in the coordination core returns
/// `Result<T, MeshError>`. Peer I/O failures are kept distinguishable from
/// protocol and configuration failures so callers can turn them into the
/// "peer unreachable" reaction (election or view eviction) instead of
/// aborting.
use thiserror::Error;

/// The main error type for coordination operations.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Could not open or use a connection to a peer.
    #[error("Connection to {addr} failed: {reason}")]
    Connection {
        /// Address that was being contacted
        addr: String,
        /// Underlying cause
        reason: String,
    },

    /// A bounded wait on a peer expired.
    #[error("Timed out waiting for {operation} from {addr}")]
    Timeout {
        /// Address that did not answer
        addr: String,
        /// Which protocol step was waiting
        operation: &'static str,
    },

    /// The peer closed the connection before a full record arrived.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Serialization error when converting a record to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record exceeded the maximum line size.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Observed size
        size: usize,
        /// Allowed size
        max: usize,
    },

    /// Unexpected or malformed message for the current protocol step.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A server id that is not part of the static configuration.
    #[error("Unknown server '{0}'")]
    UnknownServer(String),

    /// A server id without a numeric priority suffix.
    #[error("Invalid server id '{0}': expected a numeric suffix")]
    InvalidServerId(String),

    /// No leader could be reached even after re-election.
    #[error("Leader unavailable after {attempts} attempt(s)")]
    LeaderUnavailable {
        /// Number of leader contact attempts made
        attempts: usize,
    },

    /// Invalid or unreadable static configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The node was started twice.
    #[error("Node already running")]
    AlreadyRunning,

    /// Local I/O failure (binding a listener, reading configuration).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Whether this error means the remote peer is unreachable or
    /// unresponsive.
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            MeshError::Connection { .. } | MeshError::Timeout { .. } | MeshError::ConnectionClosed
        )
    }
}

/// Result type alias for coordination operations.
pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_failure_classification() {
        let timeout = MeshError::Timeout {
            addr: "127.0.0.1:5555".to_string(),
            operation: "answer",
        };
        assert!(timeout.is_peer_failure());
        assert!(MeshError::ConnectionClosed.is_peer_failure());
        assert!(!MeshError::Protocol("bad".to_string()).is_peer_failure());
        assert!(!MeshError::LeaderUnavailable { attempts: 2 }.is_peer_failure());
    }

    #[test]
    fn test_error_display() {
        let err = MeshError::InvalidServerId("alpha".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid server id 'alpha': expected a numeric suffix"
        );
    }
}
