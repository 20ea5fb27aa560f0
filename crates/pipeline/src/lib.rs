//! Streaming speech-to-text pipeline
//!
//! The pieces that sit between the transport and the neural recognizer:
//! audio decoding and resampling, voice-activity segmentation, the shared
//! recognizer pool, and the per-connection session state machine that ties
//! them together.

pub mod audio;
pub mod error;
pub mod metrics;
pub mod recognizer;
pub mod session;
pub mod vad;

pub use audio::{compute_rms, decode_wav, AudioData, StreamResampler};
pub use error::PipelineError;
pub use recognizer::{RecognizerEngine, RecognizerPool};
pub use session::{MessageKind, OutMessage, Session};
pub use vad::{SpeechSegment, VadInference, VoiceActivityDetector};
