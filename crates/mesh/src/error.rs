//! Error types for canopy mesh operations.
//!
//! Only terminal outcomes leave the engine as errors. Transient transport
//! failures and malformed frames are absorbed by the component that owns
//! them and show up in the logs instead.

use crate::connection::ConnId;
use crate::queue::Priority;
use canopy_core::{ConfigError, NodeId};
use thiserror::Error;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// A live connection to this address already exists
    #[error("Duplicate link to {address}")]
    DuplicateLink {
        /// Address already linked
        address: String,
    },

    /// Connection not known to the connection manager
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnId),

    /// Connection exists but cannot carry traffic
    #[error("Connection {0} is not established")]
    LinkDown(ConnId),

    /// Configured connection limit reached
    #[error("Connection limit of {limit} reached")]
    ConnectionLimit {
        /// Configured maximum
        limit: usize,
    },

    /// Route not found
    #[error("No route found to destination: {destination}")]
    NoRoute {
        /// Unreachable node
        destination: NodeId,
    },

    /// Offline queue rejected a message
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Transport collaborator failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Radio collaborator failure
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    /// Frame encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Capacity failures returned synchronously to the enqueue caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Every queued entry outranks (or ties with) the new message
    #[error("queue full ({capacity} entries), nothing evictable for {priority:?} message")]
    CapacityExhausted {
        /// Queue capacity in entries
        capacity: usize,
        /// Priority of the rejected message
        priority: Priority,
    },
}

/// Failures reported by a [`crate::transport::Transport`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Remote refused the connection
    #[error("connection refused")]
    Refused,

    /// Link was reset by the remote
    #[error("connection reset")]
    Reset,

    /// Handle does not refer to an open link
    #[error("link not connected")]
    NotConnected,

    /// Any other platform failure, with its native code
    #[error("transport failure (code {0})")]
    Other(i32),
}

/// Failures reported by a [`crate::transport::Radio`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    /// Association with the access point failed
    #[error("association with {ssid} failed")]
    AssociationFailed {
        /// Access point that refused us
        ssid: String,
    },

    /// This radio cannot act as a station
    #[error("radio does not support station mode")]
    Unsupported,
}

/// Wire encoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Frame could not be serialized
    #[error("encode failed: {0}")]
    Encode(String),

    /// Bytes do not form a known frame
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
