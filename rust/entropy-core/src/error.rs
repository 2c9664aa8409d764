//! Error types for the work execution core.

use thiserror::Error;

/// Failures surfaced by the core's fallible operations.
///
/// Hot paths (contract creation, selection) report failure through invalid
/// handles instead; these errors cover structural misuse that callers should
/// handle explicitly.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The group was already attached to this service.
    #[error("group `{0}` is already registered with the service")]
    GroupAlreadyRegistered(String),

    /// The group was never attached to this service.
    #[error("group `{0}` is not registered with the service")]
    GroupNotRegistered(String),

    /// `start` was called on a service that is already running.
    #[error("service is already started")]
    ServiceAlreadyStarted,

    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(String),

    /// A node handle's stamp no longer matches a live node.
    #[error("node handle does not refer to a live node")]
    InvalidNodeHandle,

    /// The requested edge would make the graph cyclic.
    #[error("adding this dependency would create a cycle")]
    DependencyCycle,

    /// Dependencies must be declared before a node becomes eligible to run.
    #[error("node has already been scheduled; dependencies must be added first")]
    NodeAlreadyScheduled,

    /// Only terminal nodes may be removed from a graph.
    #[error("node is not in a terminal state")]
    NodeNotTerminal,

    /// Timers cannot be scheduled until a work service is attached.
    #[error("timer service has no work service attached")]
    TimerServiceNotStarted,
}
