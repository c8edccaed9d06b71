//! Error types for the MemNexus core.
//!
//! All components surface one error enum. Infrastructure faults
//! (`StoreUnavailable`, `Protocol`, `PeerClosed`, `RequestTimeout`,
//! `SendFailed`) are retryable and recovered locally where possible; logical
//! errors (`InvalidInput`, `CycleDetected`) are rejected at the API boundary.

use std::time::Duration;

use crate::session::AgentRole;

/// Error type covering all MemNexus core operations.
#[derive(Debug, thiserror::Error)]
pub enum NexusError {
    /// Malformed caller input: missing session, unknown role, bad task graph.
    ///
    /// Rejected at the API boundary and never logged as a fault.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The task graph contains a dependency cycle.
    ///
    /// Carries the offending path from the cycle entry back to itself so the
    /// caller can report it as structured data.
    #[error("dependency cycle detected: {path:?}")]
    CycleDetected {
        /// Task ids forming the cycle, first id repeated at the end.
        path: Vec<String>,
    },

    /// The vector store backend rejected or could not service a call.
    ///
    /// Retryable; callers back off exponentially up to three attempts.
    #[error("memory store unavailable: {0}")]
    StoreUnavailable(String),

    /// A memory record failed validation (empty session, wrong vector size).
    #[error("invalid memory record: {0}")]
    InvalidRecord(String),

    /// A peer sent a payload the protocol adapter could not act on.
    ///
    /// The connection stays open after this error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The agent closed its stdio stream while requests were pending.
    #[error("peer closed the connection")]
    PeerClosed,

    /// A JSON-RPC request did not receive a response in time.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Writing to the agent's stdin failed.
    #[error("failed to send input to agent: {0}")]
    SendFailed(String),

    /// An outbound protocol operation was attempted before the handshake.
    #[error("connection not initialized")]
    NotInitialized,

    /// No idle agent of the requested role exists in the session.
    #[error("no idle agent available for role {0}")]
    AgentUnavailable(AgentRole),

    /// A task errored past its retry budget.
    #[error("task {id} failed: {reason}")]
    TaskFailed {
        /// Id of the failed task.
        id: String,
        /// Recorded failure reason.
        reason: String,
    },

    /// A human gate expired before anyone resolved it.
    #[error("intervention {0} expired before resolution")]
    InterventionExpired(String),

    /// Lookup of an unknown session id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Spawning the agent subprocess failed.
    #[error("failed to spawn agent: {0}")]
    SpawnFailed(String),

    /// JSON encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying I/O failure on a subprocess stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Redis broker failure (bridge publishing only; never fatal).
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Metric registration or encoding failure.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl NexusError {
    /// Whether the error is an infrastructure fault worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NexusError::StoreUnavailable(_)
                | NexusError::RequestTimeout(_)
                | NexusError::SendFailed(_)
                | NexusError::Redis(_)
        )
    }
}

/// Result alias used across the MemNexus core.
pub type NexusResult<T> = Result<T, NexusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(NexusError::StoreUnavailable("down".into()).is_retryable());
        assert!(NexusError::RequestTimeout(Duration::from_secs(30)).is_retryable());
        assert!(!NexusError::InvalidInput("bad".into()).is_retryable());
        assert!(!NexusError::PeerClosed.is_retryable());
    }

    #[test]
    fn cycle_error_carries_path() {
        let err = NexusError::CycleDetected {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        let text = err.to_string();
        assert!(text.contains("a"));
        assert!(text.contains("cycle"));
    }
}
