//! Top-level error types for the runtime core
//!
//! This module provides a flattened, user-facing error type. Every error
//! that can cross a component boundary is one of these categories, so
//! callers can branch on kind without chasing an internal hierarchy.

use thiserror::Error;

/// Top-level error type for runtime operations
///
/// Categorized by how callers typically need to handle them:
///
/// - [`Error::Parse`] - a malformed control frame; recovered locally
/// - [`Error::Protocol`] - a well-formed but semantically invalid frame
/// - [`Error::ProcessStart`] - the agent subprocess could not be spawned
/// - [`Error::ProcessExit`] - the agent subprocess exited unexpectedly
/// - [`Error::ResponseParse`] - a response frame was missing required fields
/// - [`Error::ConversationLoad`] - persisted history could not be rebuilt
/// - [`Error::PermissionDenied`] - the user denied a tool execution
/// - [`Error::AgentTerminated`] - a message was routed to a dropped agent
/// - [`Error::Persistence`] - an atomic write failed; no partial state is visible
/// - [`Error::Config`] - invalid configuration (unknown agent type, missing
///   working directory, empty message)
#[derive(Debug, Error)]
pub enum Error {
    /// A control frame could not be parsed as JSON
    #[error("parse error: {0}")]
    Parse(String),

    /// A frame was well-formed but semantically invalid
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The agent subprocess could not be spawned
    #[error("failed to start agent process: {0}")]
    ProcessStart(String),

    /// The agent subprocess exited while a turn was outstanding
    #[error("agent process exited unexpectedly (exit code {exit_code:?})")]
    ProcessExit {
        /// Exit code reported by the OS, if any
        exit_code: Option<i32>,
    },

    /// A response frame was missing or carried invalid fields
    #[error("invalid response frame: {0}")]
    ResponseParse(String),

    /// A persisted conversation transcript could not be reconstructed
    #[error("failed to load prior conversation: {0}")]
    ConversationLoad(String),

    /// The user denied a permission request
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The target agent has been terminated
    #[error("agent {0} has been terminated")]
    AgentTerminated(String),

    /// An atomic file write failed
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Returns true if this is a frame parse error
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse(_))
    }

    /// Returns true if this is a protocol-level error
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Returns true if the subprocess failed to start
    pub fn is_process_start(&self) -> bool {
        matches!(self, Self::ProcessStart(_))
    }

    /// Returns true if the subprocess exited unexpectedly
    pub fn is_process_exit(&self) -> bool {
        matches!(self, Self::ProcessExit { .. })
    }

    /// Returns true if this is a permission denial
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }

    /// Returns true if the target agent was already terminated
    pub fn is_agent_terminated(&self) -> bool {
        matches!(self, Self::AgentTerminated(_))
    }

    /// Returns true if an atomic write failed
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }

    /// Returns true if this error is recovered locally rather than
    /// propagated to the caller that triggered the operation
    ///
    /// Parse, protocol and persistence errors are reported via the error
    /// channels of the affected client or manager; start/exit errors
    /// propagate to the caller.
    pub fn is_recovered_locally(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::Protocol(_) | Self::Persistence(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;
