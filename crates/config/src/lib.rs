//! Server configuration
//!
//! Settings are loaded from the environment with the `ASR` prefix and `__`
//! separator (e.g. `ASR__SERVER__PORT=8081`). Every field has a default so a
//! bare environment starts a working server pointed at `models/`.

use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors — fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {field}: {message}")]
    InvalidValue { field: &'static str, message: String },

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// HTTP / WebSocket server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Model files and inference configuration
    #[serde(default)]
    pub model: ModelConfig,

    /// Audio pipeline configuration
    #[serde(default)]
    pub audio: AudioConfig,

    /// Voice activity detector configuration
    #[serde(default)]
    pub vad: VadSettings,

    /// Logging configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport worker threads
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Upload size limit for POST /recognize (bytes)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Per-frame size limit on the WebSocket channel (bytes)
    #[serde(default = "default_max_ws_message_bytes")]
    pub max_ws_message_bytes: usize,

    /// Concurrent one-shot request limit; 0 = auto (threads * 2)
    #[serde(default)]
    pub max_concurrent_requests: usize,

    /// Idle timeout for streaming connections (seconds)
    #[serde(default = "default_ws_idle_timeout")]
    pub ws_idle_timeout_secs: u64,
}

/// Model files and inference configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Directory holding encoder/decoder/joiner/tokens files
    #[serde(default = "default_model_dir")]
    pub model_dir: String,

    /// Path to the VAD ONNX model
    #[serde(default = "default_vad_model")]
    pub vad_model: String,

    /// Inference provider name (informational; sessions run on CPU)
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Total inference threads, split across the recognizer pool
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,

    /// Filterbank feature dimension expected by the encoder
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,

    /// Recognizer pool size; 0 = auto (= transport threads)
    #[serde(default)]
    pub recognizer_pool_size: usize,
}

/// Audio pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Model sample rate (Hz)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Segments shorter than this are counted as silence (seconds)
    #[serde(default = "default_min_audio_sec")]
    pub min_audio_sec: f32,

    /// Streaming sessions auto-finalize past this duration (seconds)
    #[serde(default = "default_max_audio_sec")]
    pub max_audio_sec: f32,
}

/// Voice activity detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSettings {
    /// Speech probability threshold, in (0, 1)
    #[serde(default = "default_vad_threshold")]
    pub threshold: f32,

    /// Trailing silence that closes a segment (seconds)
    #[serde(default = "default_vad_min_silence")]
    pub min_silence_sec: f32,

    /// Segments shorter than this are discarded (seconds)
    #[serde(default = "default_vad_min_speech")]
    pub min_speech_sec: f32,

    /// Speech runs are force-split past this duration (seconds)
    #[serde(default = "default_vad_max_speech")]
    pub max_speech_sec: f32,

    /// Inference window (samples)
    #[serde(default = "default_vad_window_size")]
    pub window_size: usize,

    /// Causal context prepended to each window (samples)
    #[serde(default = "default_vad_context_size")]
    pub context_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default log level when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON-formatted logs
    #[serde(default)]
    pub log_json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8081
}
fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024
}
fn default_max_ws_message_bytes() -> usize {
    4 * 1024 * 1024
}
fn default_ws_idle_timeout() -> u64 {
    300
}
fn default_model_dir() -> String {
    "models/transducer".to_string()
}
fn default_vad_model() -> String {
    "models/silero_vad.onnx".to_string()
}
fn default_provider() -> String {
    "cpu".to_string()
}
fn default_num_threads() -> usize {
    4
}
fn default_feature_dim() -> usize {
    64
}
fn default_sample_rate() -> u32 {
    16000
}
fn default_min_audio_sec() -> f32 {
    0.5
}
fn default_max_audio_sec() -> f32 {
    30.0
}
fn default_vad_threshold() -> f32 {
    0.5
}
fn default_vad_min_silence() -> f32 {
    0.5
}
fn default_vad_min_speech() -> f32 {
    0.25
}
fn default_vad_max_speech() -> f32 {
    20.0
}
fn default_vad_window_size() -> usize {
    512
}
fn default_vad_context_size() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            threads: default_threads(),
            max_upload_bytes: default_max_upload_bytes(),
            max_ws_message_bytes: default_max_ws_message_bytes(),
            max_concurrent_requests: 0,
            ws_idle_timeout_secs: default_ws_idle_timeout(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            vad_model: default_vad_model(),
            provider: default_provider(),
            num_threads: default_num_threads(),
            feature_dim: default_feature_dim(),
            recognizer_pool_size: 0,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            min_audio_sec: default_min_audio_sec(),
            max_audio_sec: default_max_audio_sec(),
        }
    }
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold: default_vad_threshold(),
            min_silence_sec: default_vad_min_silence(),
            min_speech_sec: default_vad_min_speech(),
            max_speech_sec: default_vad_max_speech(),
            window_size: default_vad_window_size(),
            context_size: default_vad_context_size(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl Settings {
    /// Load settings from the environment (`ASR__SERVER__PORT=8081`, ...).
    pub fn from_env() -> Result<Self, ConfigError> {
        let loaded = Config::builder()
            .add_source(Environment::with_prefix("ASR").separator("__"))
            .build()?;
        let settings: Settings = loaded.try_deserialize()?;
        Ok(settings)
    }

    /// Validate settings, clamping recoverable values into their documented
    /// bands and rejecting fields that have no sensible default.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.port",
                message: "port must be non-zero".to_string(),
            });
        }
        if self.server.max_upload_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.max_upload_bytes",
                message: "upload limit must be positive".to_string(),
            });
        }
        if self.server.max_ws_message_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.max_ws_message_bytes",
                message: "frame limit must be positive".to_string(),
            });
        }
        if self.audio.sample_rate == 0 {
            return Err(ConfigError::InvalidValue {
                field: "audio.sample_rate",
                message: "sample rate must be positive".to_string(),
            });
        }
        if self.vad.window_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "vad.window_size",
                message: "window size must be positive".to_string(),
            });
        }
        if self.model.feature_dim == 0 {
            return Err(ConfigError::InvalidValue {
                field: "model.feature_dim",
                message: "feature dimension must be positive".to_string(),
            });
        }

        if !(8000..=48000).contains(&self.audio.sample_rate) {
            tracing::warn!(
                sample_rate = self.audio.sample_rate,
                "clamping sample_rate to [8000, 48000]"
            );
            self.audio.sample_rate = self.audio.sample_rate.clamp(8000, 48000);
        }

        if !(64..=4096).contains(&self.vad.window_size) {
            tracing::warn!(
                window_size = self.vad.window_size,
                "clamping vad window_size to [64, 4096]"
            );
            self.vad.window_size = self.vad.window_size.clamp(64, 4096);
        }

        if self.vad.context_size >= self.vad.window_size {
            return Err(ConfigError::InvalidValue {
                field: "vad.context_size",
                message: format!(
                    "context_size must be in [0, window_size), got {} with window {}",
                    self.vad.context_size, self.vad.window_size
                ),
            });
        }

        if !(1..=128).contains(&self.model.num_threads) {
            tracing::warn!(
                num_threads = self.model.num_threads,
                "clamping num_threads to [1, 128]"
            );
            self.model.num_threads = self.model.num_threads.clamp(1, 128);
        }

        if !(1..=256).contains(&self.server.threads) {
            tracing::warn!(threads = self.server.threads, "clamping threads to [1, 256]");
            self.server.threads = self.server.threads.clamp(1, 256);
        }

        if self.vad.threshold <= 0.0 || self.vad.threshold >= 1.0 {
            tracing::warn!(
                threshold = self.vad.threshold,
                "clamping vad threshold to (0.0, 1.0)"
            );
            self.vad.threshold = self.vad.threshold.clamp(0.01, 0.99);
        }

        if self.audio.min_audio_sec < 0.0 {
            tracing::warn!(
                min_audio_sec = self.audio.min_audio_sec,
                "clamping min_audio_sec to 0"
            );
            self.audio.min_audio_sec = 0.0;
        }

        if self.audio.max_audio_sec <= self.audio.min_audio_sec {
            tracing::warn!(
                max_audio_sec = self.audio.max_audio_sec,
                min_audio_sec = self.audio.min_audio_sec,
                "max_audio_sec must exceed min_audio_sec, extending"
            );
            self.audio.max_audio_sec = self.audio.min_audio_sec + 30.0;
        }

        if self.vad.min_silence_sec <= 0.0 {
            tracing::warn!(
                min_silence_sec = self.vad.min_silence_sec,
                "clamping vad min_silence_sec to 0.01"
            );
            self.vad.min_silence_sec = 0.01;
        }

        if self.vad.min_speech_sec <= 0.0 {
            tracing::warn!(
                min_speech_sec = self.vad.min_speech_sec,
                "clamping vad min_speech_sec to 0.01"
            );
            self.vad.min_speech_sec = 0.01;
        }

        if self.vad.max_speech_sec <= self.vad.min_speech_sec {
            tracing::warn!(
                max_speech_sec = self.vad.max_speech_sec,
                min_speech_sec = self.vad.min_speech_sec,
                "max_speech_sec must exceed min_speech_sec, extending"
            );
            self.vad.max_speech_sec = self.vad.min_speech_sec + 10.0;
        }

        // Pool size: 0 = auto (= transport threads)
        if self.model.recognizer_pool_size == 0 {
            self.model.recognizer_pool_size = self.server.threads;
        }
        if !(1..=256).contains(&self.model.recognizer_pool_size) {
            tracing::warn!(
                pool_size = self.model.recognizer_pool_size,
                "clamping recognizer_pool_size to [1, 256]"
            );
            self.model.recognizer_pool_size = self.model.recognizer_pool_size.clamp(1, 256);
        }

        // Concurrent requests: 0 = auto (= threads * 2)
        if self.server.max_concurrent_requests == 0 {
            self.server.max_concurrent_requests = self.server.threads * 2;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.audio.sample_rate, 16000);
        assert_eq!(settings.vad.window_size, 512);
        assert!(settings.model.recognizer_pool_size >= 1);
        assert!(settings.server.max_concurrent_requests >= 2);
    }

    #[test]
    fn zero_port_rejected() {
        let mut settings = Settings::default();
        settings.server.port = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn context_must_fit_window() {
        let mut settings = Settings::default();
        settings.vad.context_size = 512;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn out_of_band_values_clamped() {
        let mut settings = Settings::default();
        settings.audio.sample_rate = 4000;
        settings.vad.threshold = 1.5;
        settings.vad.window_size = 16;
        settings.vad.min_silence_sec = -1.0;
        settings.validate().unwrap();
        assert_eq!(settings.audio.sample_rate, 8000);
        assert!((settings.vad.threshold - 0.99).abs() < f32::EPSILON);
        assert_eq!(settings.vad.window_size, 64);
        assert!(settings.vad.min_silence_sec > 0.0);
    }

    #[test]
    fn inverted_durations_fixed() {
        let mut settings = Settings::default();
        settings.audio.max_audio_sec = 0.1;
        settings.vad.max_speech_sec = 0.01;
        settings.validate().unwrap();
        assert!(settings.audio.max_audio_sec > settings.audio.min_audio_sec);
        assert!(settings.vad.max_speech_sec > settings.vad.min_speech_sec);
    }

    #[test]
    fn pool_autosizing_follows_threads() {
        let mut settings = Settings::default();
        settings.server.threads = 8;
        settings.model.recognizer_pool_size = 0;
        settings.server.max_concurrent_requests = 0;
        settings.validate().unwrap();
        assert_eq!(settings.model.recognizer_pool_size, 8);
        assert_eq!(settings.server.max_concurrent_requests, 16);
    }
}
