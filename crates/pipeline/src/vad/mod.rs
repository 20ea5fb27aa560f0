//! Voice activity detection
//!
//! A windowed neural classifier drives an outer state machine that decides
//! where utterances begin and end. The neural part is behind the
//! [`VadInference`] trait so the segmentation logic stays testable without
//! model files; [`silero::SileroVad`] is the production implementation.

pub mod silero;

use std::collections::VecDeque;

use asr_config::VadSettings;

use crate::error::PipelineError;

/// Hidden-state length of the VAD recurrent cell: `[2, 1, 128]` floats.
pub const VAD_STATE_LEN: usize = 256;

/// Per-window neural inference behind the detector.
///
/// `input` is `[context | window]`; `state` is the recurrent hidden state,
/// updated in place from the model output. Returns the speech probability
/// for the window.
pub trait VadInference: Send {
    fn infer(
        &mut self,
        input: &[f32],
        state: &mut [f32; VAD_STATE_LEN],
        sample_rate: u32,
    ) -> Result<f32, PipelineError>;
}

/// A finalized run of speech samples, trailing silence included.
pub struct SpeechSegment {
    pub samples: Vec<f32>,
}

impl SpeechSegment {
    pub fn duration_sec(&self, sample_rate: u32) -> f32 {
        self.samples.len() as f32 / sample_rate as f32
    }
}

/// Streaming voice activity detector.
///
/// Accepts audio one fixed-size window at a time and produces finalized
/// [`SpeechSegment`]s on an internal FIFO. Single-threaded; one instance per
/// connection.
pub struct VoiceActivityDetector {
    backend: Box<dyn VadInference>,

    threshold: f32,
    min_silence_sec: f32,
    min_speech_sec: f32,
    max_speech_sec: f32,
    sample_rate: u32,
    window_size: usize,
    context_size: usize,

    /// Assembled `[context | window]` inference input, reused across calls.
    input_buf: Vec<f32>,
    /// Tail of the most recent real window.
    context: Vec<f32>,
    state: [f32; VAD_STATE_LEN],

    in_speech: bool,
    silence_run_samples: u64,
    speech_run_samples: u64,
    speech_buf: Vec<f32>,
    segments: VecDeque<SpeechSegment>,
}

impl VoiceActivityDetector {
    pub fn new(
        settings: &VadSettings,
        sample_rate: u32,
        backend: Box<dyn VadInference>,
    ) -> Result<Self, PipelineError> {
        if settings.window_size == 0 {
            return Err(PipelineError::InvalidInput("VAD window_size must be positive".to_string()));
        }
        if settings.context_size >= settings.window_size {
            return Err(PipelineError::InvalidInput(
                "VAD context_size must be in [0, window_size)".to_string(),
            ));
        }
        if sample_rate == 0 {
            return Err(PipelineError::InvalidInput("VAD sample_rate must be positive".to_string()));
        }
        if settings.threshold <= 0.0 || settings.threshold >= 1.0 {
            return Err(PipelineError::InvalidInput("VAD threshold must be in (0, 1)".to_string()));
        }

        let speech_capacity = (settings.max_speech_sec * sample_rate as f32) as usize;
        Ok(Self {
            backend,
            threshold: settings.threshold,
            min_silence_sec: settings.min_silence_sec,
            min_speech_sec: settings.min_speech_sec,
            max_speech_sec: settings.max_speech_sec,
            sample_rate,
            window_size: settings.window_size,
            context_size: settings.context_size,
            input_buf: Vec::with_capacity(settings.context_size + settings.window_size),
            context: vec![0.0; settings.context_size],
            state: [0.0; VAD_STATE_LEN],
            in_speech: false,
            silence_run_samples: 0,
            speech_run_samples: 0,
            speech_buf: Vec::with_capacity(speech_capacity),
            segments: VecDeque::new(),
        })
    }

    /// Run one window through the model and update context + hidden state.
    fn infer(&mut self, samples: &[f32]) -> Result<f32, PipelineError> {
        self.input_buf.clear();
        self.input_buf.extend_from_slice(&self.context);
        self.input_buf.extend_from_slice(samples);

        let prob = self
            .backend
            .infer(&self.input_buf, &mut self.state, self.sample_rate)?;

        // Context is the tail of the real window, not of the padded input.
        let tail = samples.len() - self.context_size;
        self.context.copy_from_slice(&samples[tail..]);

        Ok(prob)
    }

    /// Classify one window and advance the segmentation state machine.
    ///
    /// `samples` must be exactly `window_size` long.
    pub fn accept_waveform(&mut self, samples: &[f32]) -> Result<(), PipelineError> {
        if samples.len() != self.window_size {
            return Err(PipelineError::InvalidInput(format!(
                "accept_waveform: expected {} samples, got {}",
                self.window_size,
                samples.len()
            )));
        }

        let prob = self.infer(samples)?;
        let window = self.window_size as u64;
        let min_silence_samples = (self.min_silence_sec * self.sample_rate as f32) as u64;
        let max_speech_samples = (self.max_speech_sec * self.sample_rate as f32) as u64;

        if prob >= self.threshold {
            if !self.in_speech {
                self.in_speech = true;
                self.speech_run_samples = 0;
                self.speech_buf.clear();
            }
            self.silence_run_samples = 0;
            self.speech_buf.extend_from_slice(samples);
            self.speech_run_samples += window;

            if self.speech_run_samples >= max_speech_samples {
                tracing::debug!(samples = self.speech_run_samples, "force-splitting speech run");
                self.finalize_segment();
            }
        } else if self.in_speech {
            // Trailing silence is kept so the recognizer sees breath room.
            self.silence_run_samples += window;
            self.speech_buf.extend_from_slice(samples);
            self.speech_run_samples += window;

            if self.silence_run_samples >= min_silence_samples {
                self.finalize_segment();
            }
        }
        // Silence outside speech is discarded.

        Ok(())
    }

    /// Close the current speech run and queue it, discarding runs shorter
    /// than `min_speech_sec`.
    fn finalize_segment(&mut self) {
        if self.speech_buf.is_empty() {
            self.reset_run();
            return;
        }

        let duration = self.speech_buf.len() as f32 / self.sample_rate as f32;
        if duration < self.min_speech_sec {
            tracing::debug!(duration, min = self.min_speech_sec, "discarding short segment");
            self.reset_run();
            self.speech_buf.clear();
            return;
        }

        let speech_capacity = (self.max_speech_sec * self.sample_rate as f32) as usize;
        let samples = std::mem::replace(&mut self.speech_buf, Vec::with_capacity(speech_capacity));
        self.segments.push_back(SpeechSegment { samples });
        self.reset_run();
    }

    fn reset_run(&mut self) {
        self.in_speech = false;
        self.silence_run_samples = 0;
        self.speech_run_samples = 0;
    }

    /// Finalize an in-progress speech run regardless of the silence
    /// criterion (minimum speech duration still applies).
    pub fn flush(&mut self) {
        if self.in_speech && !self.speech_buf.is_empty() {
            self.finalize_segment();
        }
    }

    /// Clear all state, the segment FIFO, context, and hidden state.
    pub fn reset(&mut self) {
        self.reset_run();
        self.speech_buf.clear();
        self.segments.clear();
        self.context.fill(0.0);
        self.state.fill(0.0);
    }

    pub fn empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn front(&self) -> Option<&SpeechSegment> {
        self.segments.front()
    }

    pub fn pop(&mut self) -> Option<SpeechSegment> {
        self.segments.pop_front()
    }

    pub fn is_speech(&self) -> bool {
        self.in_speech
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend that replays a fixed probability sequence, one per window.
    struct Scripted {
        probs: std::collections::VecDeque<f32>,
    }

    impl Scripted {
        fn new(probs: &[f32]) -> Box<Self> {
            Box::new(Self {
                probs: probs.iter().copied().collect(),
            })
        }
    }

    impl VadInference for Scripted {
        fn infer(
            &mut self,
            _input: &[f32],
            _state: &mut [f32; VAD_STATE_LEN],
            _sample_rate: u32,
        ) -> Result<f32, PipelineError> {
            Ok(self.probs.pop_front().unwrap_or(0.0))
        }
    }

    fn settings() -> VadSettings {
        VadSettings::default()
    }

    fn detector(probs: &[f32]) -> VoiceActivityDetector {
        VoiceActivityDetector::new(&settings(), 16000, Scripted::new(probs)).unwrap()
    }

    fn feed_windows(vad: &mut VoiceActivityDetector, count: usize, value: f32) {
        let window = vec![value; 512];
        for _ in 0..count {
            vad.accept_waveform(&window).unwrap();
        }
    }

    #[test]
    fn silence_produces_no_segments() {
        let mut vad = detector(&[]);
        feed_windows(&mut vad, 62, 0.0);
        assert!(vad.empty());
        assert!(!vad.is_speech());
    }

    #[test]
    fn speech_then_silence_finalizes_segment() {
        // 16 speech windows, then silence; min_silence 0.5s = 8000 samples
        // is reached after 16 silence windows (16 * 512 = 8192).
        let mut probs = vec![0.9; 16];
        probs.extend(vec![0.0; 16]);
        let mut vad = detector(&probs);

        feed_windows(&mut vad, 32, 0.1);
        assert!(!vad.empty());
        let segment = vad.pop().unwrap();
        assert_eq!(segment.samples.len(), 32 * 512);
        assert!(vad.empty());
        assert!(!vad.is_speech());
    }

    #[test]
    fn short_speech_is_discarded() {
        // The accumulator includes trailing silence, so 4 speech + 16
        // silence windows come to 0.64 s; a 1 s floor discards the run.
        let mut cfg = settings();
        cfg.min_speech_sec = 1.0;
        let mut probs = vec![0.9; 4];
        probs.extend(vec![0.0; 16]);
        let mut vad = VoiceActivityDetector::new(&cfg, 16000, Scripted::new(&probs)).unwrap();

        feed_windows(&mut vad, 20, 0.1);
        assert!(vad.empty());
        assert!(!vad.is_speech());
    }

    #[test]
    fn force_split_at_max_speech() {
        let mut cfg = settings();
        cfg.max_speech_sec = 0.5; // 8000 samples -> 16 windows
        let vad_backend = Scripted::new(&[0.9; 40]);
        let mut vad = VoiceActivityDetector::new(&cfg, 16000, vad_backend).unwrap();

        feed_windows(&mut vad, 16, 0.1);
        assert!(!vad.empty(), "speech run must split at max_speech_sec");
        let segment = vad.pop().unwrap();
        assert_eq!(segment.samples.len(), 16 * 512);
        assert!(!vad.is_speech());

        // The run keeps going: the next speech windows start a fresh segment.
        feed_windows(&mut vad, 16, 0.1);
        assert_eq!(vad.pop().unwrap().samples.len(), 16 * 512);
    }

    #[test]
    fn flush_finalizes_pending_speech() {
        let mut vad = detector(&[0.9; 16]);
        feed_windows(&mut vad, 16, 0.1);
        assert!(vad.is_speech());
        assert!(vad.empty());

        vad.flush();
        assert!(!vad.empty());
        assert_eq!(vad.front().unwrap().samples.len(), 16 * 512);
    }

    #[test]
    fn flush_still_honors_min_speech() {
        let mut vad = detector(&[0.9; 2]);
        feed_windows(&mut vad, 2, 0.1);
        assert!(vad.is_speech());

        vad.flush();
        assert!(vad.empty());
        assert!(!vad.is_speech());
    }

    #[test]
    fn reset_clears_everything() {
        let mut vad = detector(&[0.9; 20]);
        feed_windows(&mut vad, 20, 0.1);
        vad.flush();
        assert!(!vad.empty());

        vad.reset();
        assert!(vad.empty());
        assert!(!vad.is_speech());
    }

    #[test]
    fn wrong_window_size_is_rejected() {
        let mut vad = detector(&[]);
        let err = vad.accept_waveform(&[0.0; 100]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[test]
    fn inference_input_is_context_then_window() {
        struct Capture(std::sync::Arc<parking_lot::Mutex<Vec<Vec<f32>>>>);
        impl VadInference for Capture {
            fn infer(
                &mut self,
                input: &[f32],
                _state: &mut [f32; VAD_STATE_LEN],
                _sample_rate: u32,
            ) -> Result<f32, PipelineError> {
                self.0.lock().push(input.to_vec());
                Ok(0.0)
            }
        }

        let captured = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut vad =
            VoiceActivityDetector::new(&settings(), 16000, Box::new(Capture(captured.clone())))
                .unwrap();

        let first: Vec<f32> = (0..512).map(|i| i as f32).collect();
        let second = vec![-1.0f32; 512];
        vad.accept_waveform(&first).unwrap();
        vad.accept_waveform(&second).unwrap();

        let inputs = captured.lock();
        assert_eq!(inputs[0].len(), 64 + 512);
        // Initial context is zeros.
        assert!(inputs[0][..64].iter().all(|&v| v == 0.0));
        assert_eq!(&inputs[0][64..], &first[..]);
        // Second input starts with the tail of the first window.
        assert_eq!(&inputs[1][..64], &first[512 - 64..]);
        assert_eq!(&inputs[1][64..], &second[..]);
    }
}
