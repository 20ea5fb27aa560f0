//! Shared application state

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::Semaphore;

use asr_config::Settings;
use asr_pipeline::vad::silero::SileroVad;
use asr_pipeline::{PipelineError, RecognizerPool, Session, VoiceActivityDetector};

/// State shared by all handlers.
///
/// The VAD ONNX session is stateless between calls, so one loaded instance
/// is cloned (an `Arc` bump) into every connection; the recurrent hidden
/// state lives inside each connection's detector.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub recognizer: Arc<RecognizerPool>,
    pub vad_backend: SileroVad,
    /// Admission control for one-shot uploads; `try_acquire` only, no queue.
    pub request_slots: Arc<Semaphore>,
    pub metrics_handle: PrometheusHandle,
}

impl AppState {
    pub fn new(
        settings: Arc<Settings>,
        recognizer: Arc<RecognizerPool>,
        vad_backend: SileroVad,
        metrics_handle: PrometheusHandle,
    ) -> Self {
        let request_slots = Arc::new(Semaphore::new(settings.server.max_concurrent_requests));
        Self {
            settings,
            recognizer,
            vad_backend,
            request_slots,
            metrics_handle,
        }
    }

    /// Build a fresh streaming session for one connection.
    pub fn new_session(&self) -> Result<Session, PipelineError> {
        let vad = VoiceActivityDetector::new(
            &self.settings.vad,
            self.settings.audio.sample_rate,
            Box::new(self.vad_backend.clone()),
        )?;
        Ok(Session::new(self.recognizer.clone(), vad, &self.settings))
    }
}
