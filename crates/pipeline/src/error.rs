//! Pipeline errors

use thiserror::Error;

/// Errors produced by the audio/VAD/recognizer pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed audio input: bad container, unsupported channel count,
    /// decode or resample failure. Reported to the caller as a 400.
    #[error("audio error: {0}")]
    Audio(String),

    /// Caller violated an API contract (wrong window size, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Model invocation failure inside the inference runtime.
    #[error("model error: {0}")]
    Model(String),

    /// The per-call inference stream could not be set up. The recognizer
    /// pool treats this as an empty result rather than a fatal error.
    #[error("failed to initialize inference stream: {0}")]
    StreamInit(String),

    /// Filesystem failure while loading model assets.
    #[error("io error: {0}")]
    Io(String),
}
