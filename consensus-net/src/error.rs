//! Error types for the consensus networking layer.

use {kestrel_types::PeerId, thiserror::Error};

/// Errors that can occur in the consensus networking layer.
#[derive(Error, Debug)]
pub enum ConsensusNetError {
    /// Failed to encode or decode a message.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Message exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The peer is not known to the manager.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// The peer is already connected.
    #[error("peer already connected: {0}")]
    PeerAlreadyConnected(PeerId),

    /// The peer sent an invalid or corrupt message.
    #[error("invalid message from peer: {0}")]
    InvalidMessage(String),

    /// The consensus state machine is no longer running.
    #[error("consensus stopped")]
    ConsensusStopped,
}

/// Convenience result type for consensus networking operations.
pub type Result<T> = std::result::Result<T, ConsensusNetError>;
