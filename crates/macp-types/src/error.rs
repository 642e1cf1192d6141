//! Shared error types for the MACP system.

use crate::address::AgentAddress;
use thiserror::Error;

/// Failure raised by a single per-agent task.
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result of a single per-agent task.
pub type TaskResult = Result<(), TaskError>;

/// Top-level error type for the MACP system.
#[derive(Error, Debug)]
pub enum MacpError {
    /// Opening or closing an agent link failed.
    #[error("Connection to agent {address} failed: {reason}")]
    ConnectionFailed {
        /// The agent whose link failed.
        address: AgentAddress,
        /// Why it failed.
        reason: String,
    },

    /// No agent is registered under this address.
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentAddress),

    /// An agent is already registered under this address.
    #[error("Agent already exists: {0}")]
    AgentAlreadyExists(AgentAddress),

    /// One or more per-agent tasks of a fail-aggregating parallel call failed.
    #[error("{failed} of {total} parallel agent tasks failed")]
    AggregateTaskFailure {
        /// Number of failed tasks.
        failed: usize,
        /// Number of spawned tasks.
        total: usize,
        /// The first recorded failure.
        #[source]
        source: TaskError,
    },

    /// A frame could not be decoded.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The operation is only valid on local ports (`>= 0x10`).
    #[error("Port {0:#04x} is not a local port")]
    NotALocalPort(u8),

    /// Local ports never cross the radio, so there is nothing to peek.
    #[error("Port {0:#04x} is a local port and cannot be peeked")]
    PeekOnLocalPort(u8),

    /// A value does not form a valid agent address.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The underlying transport rejected the operation.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The component is shutting down.
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with MacpError.
pub type MacpResult<T> = Result<T, MacpError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_aggregate_failure_exposes_first_cause() {
        let first: TaskError = "motor controller timeout".into();
        let err = MacpError::AggregateTaskFailure {
            failed: 2,
            total: 5,
            source: first,
        };
        assert_eq!(err.to_string(), "2 of 5 parallel agent tasks failed");
        let cause = err.source().unwrap();
        assert_eq!(cause.to_string(), "motor controller timeout");
    }

    #[test]
    fn test_peek_on_local_port_display() {
        assert_eq!(
            MacpError::PeekOnLocalPort(0x10).to_string(),
            "Port 0x10 is a local port and cannot be peeked"
        );
    }

    #[test]
    fn test_not_a_local_port_display() {
        assert_eq!(
            MacpError::NotALocalPort(0x03).to_string(),
            "Port 0x03 is not a local port"
        );
    }
}
