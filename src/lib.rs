//! Peerstate - state reconciliation core for a peer-to-peer messenger
//!
//! This library decides what the locally visible state of chats, messages,
//! contacts and community group keys should be when events arrive out of
//! order, duplicated or delayed over an unreliable broadcast transport.
//! Every device of a user (and every peer in a community) converges on the
//! same state using only the logical clocks carried on each event.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod activity;
pub mod clock;
pub mod contacts;
pub mod crypto;
pub mod keys;
pub mod messaging;
pub mod mutation;
pub mod protocol;
pub mod response;
pub mod storage;
pub mod transport;

pub use clock::MergeOutcome;
pub use response::Response;

/// Result type alias for Peerstate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Peerstate operations
///
/// A clock that is not newer than the stored state is never an error: merge
/// functions report it as [`MergeOutcome::Stale`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed chat ID, public key or payload; rejected and never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// The author is not allowed to perform this mutation
    #[error("Authority error: {0}")]
    Authority(String),

    /// Key distribution attempted by a peer that does not control the community
    #[error("Not the control node of community {community_id}")]
    NotControlNode {
        /// Community the distribution was attempted for
        community_id: String,
    },

    /// Referenced entity does not exist locally
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Cryptographic operation error
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Storage operation error
    #[error("Storage error: {0}")]
    Storage(String),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    /// CBOR serialization error
    #[error("CBOR serialization error: {0}")]
    CborSerialization(String),

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl Error {
    /// Whether this is an authority rejection (wrong author, not control node)
    pub fn is_authority(&self) -> bool {
        matches!(self, Error::Authority(_) | Error::NotControlNode { .. })
    }

    /// Whether this error should be surfaced to the user
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::Authority(_)
                | Error::NotControlNode { .. }
                | Error::Transport(_)
        )
    }
}

/// Initialize the Peerstate library with logging
pub fn init() {
    tracing_subscriber::fmt::init();
}

#[cfg(test)]
mod tests;
