//! Error taxonomy (spec §7)
//!
//! One small `thiserror` enum per subsystem, composed upward into
//! [`HostError`], mirroring the teacher's `DbError` / `TransitionError`
//! split: callers that only touch one subsystem can match on its narrow
//! error type, while `SessionHost` and `Session` surface the umbrella type.

use crate::ids::{SessionId, ToolUseId};
use thiserror::Error;

/// Errors from the pure conversation reducer (spec §4.6, §8 boundary cases).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReducerError {
    #[error("block:delta for unknown block {block_id} in conversation {conversation_id}")]
    UnknownBlock {
        block_id: String,
        conversation_id: String,
    },
    #[error("block:delta for non-pending block {block_id}")]
    NotPending { block_id: String },
    #[error("subagent:completed for unknown subagent {subagent_id}")]
    UnknownSubagent { subagent_id: String },
}

/// Errors from an [`crate::converter::EventConverter`] (spec §7 `ConverterError`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConverterError {
    #[error("malformed raw message: {0}")]
    Malformed(String),
    #[error("unknown vendor message type: {0}")]
    UnknownType(String),
}

/// Errors from a [`crate::runner::Runner`] (spec §7 `RunnerFailed`).
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn runner process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("runner process exited with status {0}")]
    NonZeroExit(i32),
    #[error("runner process terminated by signal")]
    Signaled,
    #[error("runner produced unparseable output: {0}")]
    Protocol(String),
    #[error("runner I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// Errors from the [`crate::ee`] supervisor (spec §7 `EEUnavailable`).
#[derive(Debug, Error)]
pub enum EeError {
    #[error("execution environment unavailable after {attempts} restart attempt(s): {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: Box<RunnerError>,
    },
    #[error("execution environment health check failed: {0}")]
    HealthCheck(String),
}

/// Errors from a [`crate::persistence::PersistenceAdapter`] (spec §7 `PersistenceError`).
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("persistence backend error: {0}")]
    Backend(String),
}

/// Top-level error type surfaced by [`crate::session::Session`] and
/// [`crate::host::SessionHost`] (spec §7 taxonomy).
#[derive(Debug, Error)]
pub enum HostError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("session {session_id} is busy")]
    Busy { session_id: SessionId },

    #[error("session {session_id} is read-only after persistent transcript write failures")]
    ReadOnly { session_id: SessionId },

    #[error("host capacity exceeded (max {max} loaded sessions)")]
    CapacityExceeded { max: usize },

    #[error("execution environment unavailable")]
    EeUnavailable(#[source] EeError),

    #[error("runner failed")]
    RunnerFailed(#[source] RunnerError),

    #[error("converter error (recovered, event dropped): {0}")]
    ConverterError(#[source] ConverterError),

    #[error("persistence error")]
    PersistenceError(#[source] PersistenceError),

    #[error("canceled: {reason}")]
    Canceled { reason: String },

    #[error("protocol error: {0}")]
    ProtocolError(String),
}

pub type HostResult<T> = Result<T, HostError>;
pub type ReducerResult<T> = Result<T, ReducerError>;
pub type ConverterResult<T> = Result<T, ConverterError>;
pub type RunnerResult<T> = Result<T, RunnerError>;
pub type EeResult<T> = Result<T, EeError>;
pub type PersistenceResult<T> = Result<T, PersistenceError>;

impl From<EeError> for HostError {
    fn from(e: EeError) -> Self {
        HostError::EeUnavailable(e)
    }
}

impl From<RunnerError> for HostError {
    fn from(e: RunnerError) -> Self {
        HostError::RunnerFailed(e)
    }
}

impl From<ConverterError> for HostError {
    fn from(e: ConverterError) -> Self {
        HostError::ConverterError(e)
    }
}

impl From<PersistenceError> for HostError {
    fn from(e: PersistenceError) -> Self {
        HostError::PersistenceError(e)
    }
}

/// A `tool_use_id` that a `tool_result` or `subagent:completed` event
/// referenced but that has no matching open entry; used by §8's boundary
/// tests ("synthesize `subagent:completed{status=failed}`").
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("no open subagent for tool_use_id {0}")]
pub struct DanglingToolUseId(pub ToolUseId);
