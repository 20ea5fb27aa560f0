//! Silero VAD ONNX backend
//!
//! Wraps the Silero VAD model published at
//! <https://github.com/snakers4/silero-vad> (v5 interface).
//!
//! Model I/O:
//!
//! | Name     | Shape        | DType | Direction |
//! |----------|--------------|-------|-----------|
//! | `input`  | `[1, C + W]` | f32   | in        |
//! | `state`  | `[2, 1, 128]`| f32   | in        |
//! | `sr`     | `[1]`        | i64   | in        |
//! | `output` | `[1, 1]`     | f32   | out       |
//! | `stateN` | `[2, 1, 128]`| f32   | out       |
//!
//! The session is stateless between calls (the recurrent state is threaded
//! through explicitly), so one loaded session can be shared by every
//! connection; each detector keeps its own 256-float hidden state.

use std::path::Path;
use std::sync::Arc;

use ndarray::{Array1, Array2, Array3};
use ort::{GraphOptimizationLevel, Session};

use super::{VadInference, VAD_STATE_LEN};
use crate::error::PipelineError;

/// Neural VAD backend over a shared ONNX session.
#[derive(Clone)]
pub struct SileroVad {
    session: Arc<Session>,
}

impl SileroVad {
    /// Load the model from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let session = Session::builder()
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .with_intra_threads(1)
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .commit_from_file(path)
            .map_err(|e| PipelineError::Model(format!("failed to load {}: {e}", path.display())))?;

        tracing::info!(path = %path.display(), "VAD model loaded");
        Ok(Self {
            session: Arc::new(session),
        })
    }
}

impl VadInference for SileroVad {
    fn infer(
        &mut self,
        input: &[f32],
        state: &mut [f32; VAD_STATE_LEN],
        sample_rate: u32,
    ) -> Result<f32, PipelineError> {
        let input_arr = Array2::from_shape_vec((1, input.len()), input.to_vec())
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        let state_arr = Array3::from_shape_vec((2, 1, 128), state.to_vec())
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        let sr_arr = Array1::from_elem(1, i64::from(sample_rate));

        let outputs = self
            .session
            .run(
                ort::inputs![
                    "input" => input_arr.view(),
                    "state" => state_arr.view(),
                    "sr" => sr_arr.view(),
                ]
                .map_err(|e| PipelineError::Model(e.to_string()))?,
            )
            .map_err(|e| PipelineError::Model(format!("VAD inference failed: {e}")))?;

        let prob = outputs
            .get("output")
            .ok_or_else(|| PipelineError::Model("VAD model missing 'output'".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .iter()
            .next()
            .copied()
            .unwrap_or(0.0);

        let new_state = outputs
            .get("stateN")
            .ok_or_else(|| PipelineError::Model("VAD model missing 'stateN'".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        for (dst, src) in state.iter_mut().zip(new_state.iter()) {
            *dst = *src;
        }

        Ok(prob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asr_config::VadSettings;

    const MODEL_PATH: &str = "models/silero_vad.onnx";

    #[test]
    fn silence_stays_out_of_speech() {
        if !Path::new(MODEL_PATH).exists() {
            eprintln!("skipping: VAD model not found");
            return;
        }

        let backend = SileroVad::load(MODEL_PATH).unwrap();
        let mut vad = crate::vad::VoiceActivityDetector::new(
            &VadSettings::default(),
            16000,
            Box::new(backend),
        )
        .unwrap();

        let window = vec![0.0f32; 512];
        for _ in 0..62 {
            vad.accept_waveform(&window).unwrap();
        }
        assert!(vad.empty());
        assert!(!vad.is_speech());
    }
}
