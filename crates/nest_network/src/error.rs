//! Network error types.

use crate::identity::NestId;

/// Errors that can occur while exchanging messages between nests.
///
/// The enum is `Clone` because a failure produced by a remote handler travels
/// back over the simulated link exactly like a successful response does.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NestError {
    /// The destination is not a direct neighbor of the sending nest.
    #[error("{to} is not a neighbor of {from}")]
    NotNeighbor { from: NestId, to: NestId },

    /// The nest was not found in the registry.
    #[error("No such nest: {0}")]
    NoSuchNode(NestId),

    /// No handler is registered for the message kind.
    #[error("No handler registered for message kind: {0}")]
    NoHandler(String),

    /// Every attempt timed out.
    #[error("Request timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    /// Gateway discovery could not reach the target in the learned topology.
    #[error("No route found to {0}")]
    NoRouteFound(NestId),

    /// No reachable nest holds the key.
    #[error("Key not found in any storage: {0}")]
    NotFoundInStorage(String),

    /// An application-level failure raised by a handler.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// A handler received a payload of the wrong shape.
    #[error("Unexpected payload for {kind}: expected {expected}")]
    UnexpectedPayload { kind: String, expected: &'static str },

    /// The destination nest is no longer accepting messages.
    #[error("Nest {0} has shut down")]
    ShutDown(NestId),

    /// A nest with this id was already created.
    #[error("Duplicate nest: {0}")]
    DuplicateNest(NestId),

    /// The network config failed validation.
    #[error("Invalid network config: {0}")]
    InvalidConfig(String),

    /// The topology could not be built.
    #[error("Topology error: {0}")]
    Topology(String),
}

impl NestError {
    /// Build a handler failure from anything printable.
    pub fn handler(reason: impl std::fmt::Display) -> Self {
        Self::Handler(reason.to_string())
    }

    /// Structural errors point at a topology or registration mistake and are
    /// never worth retrying.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::NotNeighbor { .. } | Self::NoSuchNode(_) | Self::NoHandler(_)
        )
    }
}
