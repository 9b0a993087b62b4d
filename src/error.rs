//! Error types for the call orchestration engine.
//!
//! Two conditions are deliberately *not* errors: a synthesized chunk arriving
//! after its turn was interrupted (dropped by the sequencer), and outbound
//! transport backpressure (suspends pacing). Both are handled in-band.

/// Top-level error type for a voice call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// A backend could not be reached or dropped the connection.
    /// Retriable within the call; the current turn is aborted.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A backend answered with something we could not interpret.
    /// Non-retriable for the turn; the turn is aborted gracefully.
    #[error("backend protocol error: {0}")]
    BackendProtocol(String),

    /// Outbound media transport failure (not backpressure).
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Inter-task channel closed unexpectedly.
    #[error("channel error: {0}")]
    Channel(String),

    /// Call function execution error.
    #[error("function error: {0}")]
    Function(String),

    /// The call ended. Expected terminal condition, tears down all
    /// channels for the call; never retried.
    #[error("call terminated")]
    CallTerminated,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CallError {
    /// Whether the turn that hit this error may be retried on the caller's
    /// next utterance (as opposed to tearing the call down).
    pub fn is_turn_local(&self) -> bool {
        !matches!(self, Self::CallTerminated)
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CallError>;
