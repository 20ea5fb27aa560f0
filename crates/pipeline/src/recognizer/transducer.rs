//! ONNX transducer recognition engine
//!
//! Loads a transducer model split across three graphs plus a token table:
//!
//! - `encoder.int8.onnx` — acoustic encoder over log-mel features,
//!   `audio_signal` `[1, D, T]` f32 + `length` `[1]` i64 in, encoded frames
//!   `[1, E, T']` f32 out
//! - `decoder.onnx` — prediction network, `targets` `[1, 1]` i64 +
//!   `target_length` `[1]` i64 in, `[1, P, 1]` f32 out
//! - `joiner.onnx` — `encoder_out` `[1, E]` + `decoder_out` `[1, P]` in,
//!   token logits `[1, V]` out
//! - `tokens.txt` — one `piece id` pair per line, sentencepiece-style
//!
//! Decoding is greedy search: for each encoder frame, emit tokens until the
//! joiner predicts blank.

use std::path::Path;

use ndarray::{Array1, Array2, Array3};
use ort::{GraphOptimizationLevel, Session};

use asr_config::ModelConfig;

use super::RecognizerEngine;
use crate::error::PipelineError;

/// Guard against degenerate joiner outputs looping on one frame.
const MAX_TOKENS_PER_FRAME: usize = 5;

pub struct TransducerEngine {
    encoder: Session,
    decoder: Session,
    joiner: Session,
    tokens: Vec<String>,
    blank_id: i64,
    features: FbankExtractor,
    model_rate: u32,
}

impl TransducerEngine {
    /// Load one engine instance with `num_threads` intra-op threads.
    pub fn load(
        model: &ModelConfig,
        num_threads: usize,
        model_rate: u32,
    ) -> Result<Self, PipelineError> {
        let dir = Path::new(&model.model_dir);

        let encoder = load_session(&dir.join("encoder.int8.onnx"), num_threads)?;
        let decoder = load_session(&dir.join("decoder.onnx"), num_threads)?;
        let joiner = load_session(&dir.join("joiner.onnx"), num_threads)?;
        let (tokens, blank_id) = load_tokens(&dir.join("tokens.txt"))?;

        Ok(Self {
            encoder,
            decoder,
            joiner,
            tokens,
            blank_id,
            features: FbankExtractor::new(model_rate as usize, model.feature_dim),
            model_rate,
        })
    }

    fn run_decoder(&self, token: i64) -> Result<Vec<f32>, PipelineError> {
        let targets = Array2::from_shape_vec((1, 1), vec![token])
            .map_err(|e| PipelineError::StreamInit(e.to_string()))?;
        let target_length = Array1::from_elem(1, 1i64);

        let outputs = self
            .decoder
            .run(
                ort::inputs![
                    "targets" => targets.view(),
                    "target_length" => target_length.view(),
                ]
                .map_err(|e| PipelineError::StreamInit(e.to_string()))?,
            )
            .map_err(|e| PipelineError::Model(format!("decoder failed: {e}")))?;

        let out = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        Ok(out.iter().copied().collect())
    }

    fn run_joiner(&self, enc_frame: &[f32], dec_out: &[f32]) -> Result<Vec<f32>, PipelineError> {
        let enc = Array2::from_shape_vec((1, enc_frame.len()), enc_frame.to_vec())
            .map_err(|e| PipelineError::StreamInit(e.to_string()))?;
        let dec = Array2::from_shape_vec((1, dec_out.len()), dec_out.to_vec())
            .map_err(|e| PipelineError::StreamInit(e.to_string()))?;

        let outputs = self
            .joiner
            .run(
                ort::inputs![
                    "encoder_out" => enc.view(),
                    "decoder_out" => dec.view(),
                ]
                .map_err(|e| PipelineError::StreamInit(e.to_string()))?,
            )
            .map_err(|e| PipelineError::Model(format!("joiner failed: {e}")))?;

        let logits = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        Ok(logits.iter().copied().collect())
    }
}

impl RecognizerEngine for TransducerEngine {
    fn transcribe(&self, audio: &[f32], sample_rate: u32) -> Result<String, PipelineError> {
        debug_assert_eq!(sample_rate, self.model_rate);

        let (features, num_frames) = self.features.extract(audio);
        if num_frames == 0 {
            return Ok(String::new());
        }

        // [1, D, T] feature tensor
        let dim = self.features.n_mels;
        let mut signal = Array3::zeros((1, dim, num_frames));
        for t in 0..num_frames {
            for d in 0..dim {
                signal[[0, d, t]] = features[t * dim + d];
            }
        }
        let length = Array1::from_elem(1, num_frames as i64);

        let outputs = self
            .encoder
            .run(
                ort::inputs![
                    "audio_signal" => signal.view(),
                    "length" => length.view(),
                ]
                .map_err(|e| PipelineError::StreamInit(e.to_string()))?,
            )
            .map_err(|e| PipelineError::Model(format!("encoder failed: {e}")))?;

        let encoded = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        let shape = encoded.shape();
        if shape.len() != 3 {
            return Err(PipelineError::Model(format!(
                "unexpected encoder output rank {}",
                shape.len()
            )));
        }
        let (enc_dim, t_out) = (shape[1], shape[2]);

        // Greedy search over encoder frames.
        let mut pieces: Vec<i64> = Vec::new();
        let mut last_token = self.blank_id;
        let mut dec_out = self.run_decoder(last_token)?;
        let mut enc_frame = vec![0.0f32; enc_dim];

        for t in 0..t_out {
            for d in 0..enc_dim {
                enc_frame[d] = encoded[[0, d, t]];
            }

            for _ in 0..MAX_TOKENS_PER_FRAME {
                let logits = self.run_joiner(&enc_frame, &dec_out)?;
                let best = argmax(&logits);
                if best == self.blank_id {
                    break;
                }
                pieces.push(best);
                last_token = best;
                dec_out = self.run_decoder(last_token)?;
            }
        }

        Ok(self.decode_pieces(&pieces))
    }
}

impl TransducerEngine {
    fn decode_pieces(&self, pieces: &[i64]) -> String {
        let mut text = String::new();
        for &id in pieces {
            if let Some(piece) = self.tokens.get(id as usize) {
                // Sentencepiece marks word starts with '▁'.
                for c in piece.chars() {
                    if c == '\u{2581}' {
                        text.push(' ');
                    } else {
                        text.push(c);
                    }
                }
            }
        }
        text
    }
}

fn load_session(path: &Path, num_threads: usize) -> Result<Session, PipelineError> {
    Session::builder()
        .map_err(|e| PipelineError::Model(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| PipelineError::Model(e.to_string()))?
        .with_intra_threads(num_threads)
        .map_err(|e| PipelineError::Model(e.to_string()))?
        .commit_from_file(path)
        .map_err(|e| PipelineError::Model(format!("failed to load {}: {e}", path.display())))
}

fn load_tokens(path: &Path) -> Result<(Vec<String>, i64), PipelineError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::Io(format!("failed to read {}: {e}", path.display())))?;

    let mut tokens = Vec::new();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (piece, id) = match (parts.next(), parts.next()) {
            (Some(piece), Some(id)) => (piece, id),
            // A lone id means the piece is a literal space.
            (Some(id), None) => (" ", id),
            _ => continue,
        };
        let id: usize = id
            .parse()
            .map_err(|_| PipelineError::Model(format!("bad token line: {line:?}")))?;
        if tokens.len() <= id {
            tokens.resize(id + 1, String::new());
        }
        tokens[id] = piece.to_string();
    }

    if tokens.is_empty() {
        return Err(PipelineError::Model("empty token table".to_string()));
    }

    // Blank is <blk> when present, otherwise the last id.
    let blank_id = tokens
        .iter()
        .position(|t| t == "<blk>")
        .unwrap_or(tokens.len() - 1) as i64;

    Ok((tokens, blank_id))
}

fn argmax(values: &[f32]) -> i64 {
    let mut best = 0usize;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best as i64
}

/// Log-mel filterbank feature extraction: 25 ms Hann windows, 10 ms hop.
struct FbankExtractor {
    n_fft: usize,
    win_length: usize,
    hop_length: usize,
    n_mels: usize,
    mel_filters: Vec<Vec<f32>>,
    hann_window: Vec<f32>,
}

impl FbankExtractor {
    fn new(sample_rate: usize, n_mels: usize) -> Self {
        let n_fft = 512;
        let win_length = sample_rate * 25 / 1000;
        let hop_length = sample_rate / 100;

        let hann_window: Vec<f32> = (0..win_length)
            .map(|i| {
                let x = std::f32::consts::PI * i as f32 / (win_length - 1) as f32;
                0.5 * (1.0 - (2.0 * x).cos())
            })
            .collect();

        let mel_filters = mel_filterbank(sample_rate, n_fft, n_mels);

        Self {
            n_fft,
            win_length,
            hop_length,
            n_mels,
            mel_filters,
            hann_window,
        }
    }

    /// Extract features as a `[T, n_mels]` row-major buffer.
    fn extract(&self, audio: &[f32]) -> (Vec<f32>, usize) {
        if audio.len() < self.win_length {
            return (Vec::new(), 0);
        }
        let num_frames = (audio.len() - self.win_length) / self.hop_length + 1;

        let mut planner = realfft::RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(self.n_fft);
        let n_bins = self.n_fft / 2 + 1;
        let mut spectrum = vec![realfft::num_complex::Complex::new(0.0f32, 0.0); n_bins];
        let mut windowed = vec![0.0f32; self.n_fft];
        let mut magnitudes = vec![0.0f32; n_bins];

        let mut features = Vec::with_capacity(num_frames * self.n_mels);
        for frame in 0..num_frames {
            let start = frame * self.hop_length;

            windowed.fill(0.0);
            for (i, &sample) in audio[start..start + self.win_length].iter().enumerate() {
                windowed[i] = sample * self.hann_window[i];
            }

            if fft.process(&mut windowed, &mut spectrum).is_ok() {
                for (m, c) in magnitudes.iter_mut().zip(&spectrum) {
                    *m = c.norm();
                }
            } else {
                magnitudes.fill(0.0);
            }

            for filter in &self.mel_filters {
                let mut energy = 0.0f32;
                for (&mag, &w) in magnitudes.iter().zip(filter) {
                    energy += mag * w;
                }
                features.push((energy + 1e-10).ln());
            }
        }

        (features, num_frames)
    }
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0f32.powf(mel / 2595.0) - 1.0)
}

fn mel_filterbank(sample_rate: usize, n_fft: usize, n_mels: usize) -> Vec<Vec<f32>> {
    let mel_max = hz_to_mel(sample_rate as f32 / 2.0);

    let hz_points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f32 / (n_mels + 1) as f32))
        .collect();
    let bin_points: Vec<usize> = hz_points
        .iter()
        .map(|&hz| ((n_fft + 1) as f32 * hz / sample_rate as f32).floor() as usize)
        .collect();

    let n_bins = n_fft / 2 + 1;
    let mut filters = vec![vec![0.0f32; n_bins]; n_mels];
    for i in 0..n_mels {
        let (start, center, end) = (bin_points[i], bin_points[i + 1], bin_points[i + 2]);
        for j in start..center.min(n_bins) {
            if center > start {
                filters[i][j] = (j - start) as f32 / (center - start) as f32;
            }
        }
        for j in center..end.min(n_bins) {
            if end > center {
                filters[i][j] = (end - j) as f32 / (end - center) as f32;
            }
        }
    }
    filters
}
