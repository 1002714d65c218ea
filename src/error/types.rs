//! Core error types for stream composition.

use std::fmt;

use thiserror::Error;

/// The side of a stage a chain position requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Readable,
    Writable,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Readable => f.write_str("readable"),
            Self::Writable => f.write_str("writable"),
        }
    }
}

/// Coarse classification used for logging and caller-side handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Raised synchronously while building a composition; nothing is wired.
    Construction,
    /// Misuse of the composed unit; the pipeline keeps running.
    Misuse,
    /// Teardown requested through cancellation rather than a fault.
    Abort,
    /// Failure raised by (or synthesized for) a stage at runtime.
    Stage,
    Internal,
}

/// Errors produced by composition, linking and the composed duplex.
///
/// The type is `Clone` because a single terminal error is fanned out to every
/// stage and to every observer of the composed unit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
    /// `compose` was called without any stage.
    #[error("missing stages: compose requires at least one stage")]
    MissingStages,

    /// A chain element is not a stream, generator, async function or iterable.
    #[error("invalid stage type at streams[{index}]: {found}")]
    InvalidStageType { index: usize, found: String },

    /// Adjacent stages cannot be connected.
    #[error("stage direction mismatch: streams[{index}] must be {expected}")]
    StageDirectionMismatch { index: usize, expected: Direction },

    /// Composition needs a Tokio runtime to drive its stages.
    #[error("compose must be called from within a Tokio runtime")]
    NoRuntime,

    /// `write` was called after `end`.
    #[error("write after end")]
    WriteAfterEnd,

    /// The composed unit (or a stage) has no writable side.
    #[error("stream is not writable")]
    NotWritable,

    /// The composed unit (or a stage) has no readable side.
    #[error("stream is not readable")]
    NotReadable,

    /// Teardown triggered by explicit cancellation.
    #[error("the operation was aborted: {0}")]
    Aborted(String),

    /// A stage closed before finishing its work.
    #[error("premature close")]
    PrematureClose,

    /// The stage or composed unit was already destroyed.
    #[error("stream destroyed")]
    Destroyed,

    /// Error raised by a stage's own read, write or finalize path.
    #[error("stage error: {message}")]
    Stage { message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ComposeError {
    /// Create a stage-internal error.
    pub fn stage(message: impl Into<String>) -> Self {
        Self::Stage {
            message: message.into(),
        }
    }

    /// The default reason used when a composed unit is destroyed without one.
    pub fn abort() -> Self {
        Self::Aborted("destroyed before completion".to_string())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingStages
            | Self::InvalidStageType { .. }
            | Self::StageDirectionMismatch { .. }
            | Self::NoRuntime => ErrorCategory::Construction,
            Self::WriteAfterEnd | Self::NotWritable | Self::NotReadable => ErrorCategory::Misuse,
            Self::Aborted(_) => ErrorCategory::Abort,
            Self::PrematureClose | Self::Destroyed | Self::Stage { .. } => ErrorCategory::Stage,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_construction(&self) -> bool {
        self.category() == ErrorCategory::Construction
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    /// Misuse errors leave the composed unit intact.
    pub fn is_recoverable(&self) -> bool {
        self.category() == ErrorCategory::Misuse
    }
}

/// Result type for composition operations
pub type Result<T> = std::result::Result<T, ComposeError>;
