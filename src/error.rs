//! Error types for the voxturn pipeline.

use serde::{Deserialize, Serialize};

/// Top-level error type for the turn engine.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// A chunk arrived out of sequence within an utterance.
    #[error("sequence violation: expected chunk {expected}, got {got}")]
    SequenceViolation {
        /// Sequence number the utterance needed next.
        expected: u64,
        /// Sequence number that actually arrived.
        got: u64,
    },

    /// The ingestion buffer is full and the producer asked not to wait.
    #[error("audio buffer full ({capacity})")]
    BufferOverflow {
        /// Human-readable description of the exhausted limit.
        capacity: String,
    },

    /// The ingestion buffer was closed.
    #[error("audio buffer closed")]
    BufferClosed,

    /// Speech-to-text collaborator failure.
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Workflow collaborator failure.
    #[error("workflow error: {0}")]
    Workflow(String),

    /// Text-to-speech collaborator failure.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// The consumer fell behind and the replay buffer ran out.
    #[error("event multiplexer overflow: consumer fell {capacity} events behind")]
    MultiplexerOverflow {
        /// Replay buffer capacity that was exhausted.
        capacity: usize,
    },

    /// A cancelled turn did not stop within the grace period.
    #[error("turn {turn} ignored cancellation for {grace_ms}ms; forcing cancel")]
    InterruptionTimeout {
        /// Turn that was force-cancelled.
        turn: u64,
        /// Grace period that elapsed.
        grace_ms: u64,
    },

    /// The event stream of a run was already handed out.
    #[error("event stream already taken")]
    StreamAlreadyTaken,

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Pipeline wiring error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Taxonomy kind of this error, if it is one that can appear on the
    /// event stream.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::SequenceViolation { .. } => Some(ErrorKind::SequenceViolation),
            Self::BufferOverflow { .. } => Some(ErrorKind::BufferOverflow),
            Self::BufferClosed => Some(ErrorKind::BufferClosed),
            Self::Transcription(_) => Some(ErrorKind::TranscriptionError),
            Self::Workflow(_) => Some(ErrorKind::WorkflowError),
            Self::Synthesis(_) => Some(ErrorKind::SynthesisError),
            Self::MultiplexerOverflow { .. } => Some(ErrorKind::MultiplexerOverflow),
            Self::InterruptionTimeout { .. } => Some(ErrorKind::InterruptionTimeout),
            Self::StreamAlreadyTaken | Self::Config(_) | Self::Pipeline(_) | Self::Io(_) => None,
        }
    }
}

/// Error categories carried by `ErrorEvent`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SequenceViolation,
    BufferOverflow,
    BufferClosed,
    TranscriptionError,
    WorkflowError,
    SynthesisError,
    MultiplexerOverflow,
    InterruptionTimeout,
}

impl ErrorKind {
    /// Whether an error of this kind ends the turn it is attached to.
    ///
    /// `InterruptionTimeout` is a warning: the forced `interrupted` event that
    /// follows it is the turn's terminal event.
    pub fn is_turn_terminal(self) -> bool {
        matches!(
            self,
            Self::TranscriptionError | Self::WorkflowError | Self::SynthesisError
        )
    }

    /// Whether an error of this kind ends the whole event stream.
    pub fn is_stream_fatal(self) -> bool {
        matches!(self, Self::MultiplexerOverflow)
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
