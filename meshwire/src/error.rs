//! Error types for the meshwire networking stack.

use thiserror::Error;

/// Errors that can occur across the connection pool, message network, and
/// peer overlay layers.
#[derive(Error, Debug)]
pub enum NetError {
    /// The connection's send queue is full or the connection is dead.
    #[error("connection not ready")]
    ConnNotReady,

    /// An inbound frame declared a payload larger than `max_msg_size`.
    /// Fatal to the connection that sent it.
    #[error("oversized message: {size} bytes (max {max} bytes)")]
    ConnOversizedMsg {
        /// Declared payload length.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The peer id is not registered with the peer network.
    #[error("peer does not exist")]
    PeerNotExist,

    /// `add_peer` was called for an id that is already registered.
    #[error("peer already exists")]
    PeerAlreadyExists,

    /// The peer is registered but has no dial address yet.
    #[error("peer not ready")]
    PeerNotReady,

    /// No client connection is known for the given address.
    #[error("client does not exist")]
    ClientNotExist,

    /// The system randomness source failed while drawing a handshake nonce.
    #[error("randomness source failure")]
    RandSource,

    /// Fatal transport-level I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or conflicting configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// `listen` was called while a listener is already bound.
    #[error("listener already started")]
    ListenerAlreadyStarted,

    /// The dispatcher has shut down; the operation cannot be submitted.
    #[error("network channel closed")]
    ChannelClosed,
}

/// Convenience result type for meshwire operations.
pub type Result<T> = std::result::Result<T, NetError>;
