//! Audio decoding, resampling, and level measurement
//!
//! The WAV path serves the one-shot upload endpoint; [`StreamResampler`]
//! serves the streaming channel, where the filter state must survive across
//! frames and be flushed when the client finalizes.

use std::io::Cursor;

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::error::PipelineError;

/// Decoded, mono, model-rate audio.
#[derive(Debug)]
pub struct AudioData {
    pub samples: Vec<f32>,
    pub duration_sec: f32,
}

/// Upper bound on decoded WAV length: one hour at 48 kHz.
const MAX_WAV_FRAMES: u64 = 48_000 * 3600;

/// Decode a WAV payload to f32 mono samples at `target_rate`.
///
/// Rejects non-mono audio, empty payloads, and files longer than one hour.
/// Integer PCM (16/24/32-bit) and float formats are normalized to [-1, 1];
/// the sample rate is converted when it differs from `target_rate`.
pub fn decode_wav(data: &[u8], target_rate: u32) -> Result<AudioData, PipelineError> {
    if data.is_empty() {
        return Err(PipelineError::Audio("empty audio data".to_string()));
    }

    let mut reader = hound::WavReader::new(Cursor::new(data))
        .map_err(|e| PipelineError::Audio(format!("failed to decode WAV file: {e}")))?;
    let spec = reader.spec();

    if spec.channels != 1 {
        return Err(PipelineError::Audio(format!(
            "only mono audio is supported, got {} channels",
            spec.channels
        )));
    }

    let total_frames = u64::from(reader.duration());
    if total_frames == 0 {
        return Err(PipelineError::Audio("WAV file contains no audio frames".to_string()));
    }
    if total_frames > MAX_WAV_FRAMES {
        return Err(PipelineError::Audio(format!(
            "WAV file too long: {total_frames} frames exceeds 1-hour limit"
        )));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| PipelineError::Audio(format!("failed to read PCM frames: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| PipelineError::Audio(format!("failed to read PCM frames: {e}")))?
        }
    };

    if samples.is_empty() {
        return Err(PipelineError::Audio("failed to read PCM frames from WAV".to_string()));
    }

    let samples = if spec.sample_rate != target_rate {
        let mut resampler = StreamResampler::new(spec.sample_rate, target_rate)?;
        let mut converted = resampler.process(&samples)?.to_vec();
        converted.extend_from_slice(resampler.flush()?);
        converted
    } else {
        samples
    };

    let duration_sec = samples.len() as f32 / target_rate as f32;
    Ok(AudioData { samples, duration_sec })
}

/// Root-mean-square level of a chunk; 0.0 for empty input.
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Input frames fed to the interpolation kernel per pass.
const RESAMPLE_CHUNK: usize = 1024;

/// Stateful mono sample-rate converter for the streaming channel.
///
/// Input is accumulated into fixed-size kernel chunks; the filter state
/// persists across [`process`](Self::process) calls and is drained and reset
/// by [`flush`](Self::flush), so one instance serves consecutive utterances
/// on the same connection. The output buffer grows to a high-water mark and
/// is reused, keeping the steady state allocation-free.
pub struct StreamResampler {
    resampler: FastFixedIn<f32>,
    input_buf: Vec<f32>,
    /// Kernel output scratch: `[1][output_frames_max]`.
    scratch: Vec<Vec<f32>>,
    out: Vec<f32>,
}

impl StreamResampler {
    /// Create a converter from `input_rate` to `output_rate` Hz.
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self, PipelineError> {
        if input_rate == 0 || output_rate == 0 {
            return Err(PipelineError::Audio("resampler rates must be positive".to_string()));
        }
        let ratio = f64::from(output_rate) / f64::from(input_rate);

        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, RESAMPLE_CHUNK, 1)
            .map_err(|e| PipelineError::Audio(format!("failed to create resampler: {e}")))?;

        let max_out = resampler.output_frames_max();
        Ok(Self {
            resampler,
            input_buf: Vec::with_capacity(RESAMPLE_CHUNK),
            scratch: vec![vec![0.0; max_out]; 1],
            out: Vec::new(),
        })
    }

    /// Convert `input`, returning the produced samples.
    ///
    /// The returned slice borrows an internal buffer and is valid until the
    /// next call on this resampler. Fewer than `len(input) * ratio` samples
    /// may be produced while the kernel holds back a partial chunk; the
    /// remainder is delivered by later calls or by [`flush`](Self::flush).
    pub fn process(&mut self, input: &[f32]) -> Result<&[f32], PipelineError> {
        self.out.clear();
        self.input_buf.extend_from_slice(input);

        while self.input_buf.len() >= RESAMPLE_CHUNK {
            let (consumed, produced) = self
                .resampler
                .process_into_buffer(&[&self.input_buf[..RESAMPLE_CHUNK]], &mut self.scratch, None)
                .map_err(|e| PipelineError::Audio(format!("resampling failed: {e}")))?;
            if consumed != RESAMPLE_CHUNK {
                tracing::warn!(consumed, supplied = RESAMPLE_CHUNK, "resampler consumed fewer frames than supplied");
            }
            self.out.extend_from_slice(&self.scratch[0][..produced]);
            self.input_buf.drain(..RESAMPLE_CHUNK);
        }

        Ok(&self.out)
    }

    /// Drain the pending partial chunk and the filter tail, then reset the
    /// kernel so this instance can be reused for a new stream.
    pub fn flush(&mut self) -> Result<&[f32], PipelineError> {
        self.out.clear();

        if !self.input_buf.is_empty() {
            let (_, produced) = self
                .resampler
                .process_partial_into_buffer(Some(&[&self.input_buf[..]]), &mut self.scratch, None)
                .map_err(|e| PipelineError::Audio(format!("resampler flush failed: {e}")))?;
            self.out.extend_from_slice(&self.scratch[0][..produced]);
            self.input_buf.clear();
        }

        let (_, produced) = self
            .resampler
            .process_partial_into_buffer(None::<&[&[f32]]>, &mut self.scratch, None)
            .map_err(|e| PipelineError::Audio(format!("resampler flush failed: {e}")))?;
        self.out.extend_from_slice(&self.scratch[0][..produced]);

        self.resampler.reset();
        Ok(&self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin() * 0.5)
            .collect()
    }

    fn wav_bytes(samples: &[f32], rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn rms_of_empty_is_zero() {
        assert_eq!(compute_rms(&[]), 0.0);
    }

    #[test]
    fn rms_matches_definition() {
        let samples = sine(440.0, 16000, 16000);
        let expected =
            (samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum::<f64>() / samples.len() as f64).sqrt();
        let rms = compute_rms(&samples);
        assert!((f64::from(rms) - expected).abs() / expected < 1e-6);
    }

    #[test]
    fn decode_wav_same_rate_roundtrip() {
        let samples = sine(440.0, 16000, 8000);
        let bytes = wav_bytes(&samples, 16000);
        let decoded = decode_wav(&bytes, 16000).unwrap();
        assert_eq!(decoded.samples.len(), samples.len());
        for (a, b) in decoded.samples.iter().zip(&samples) {
            assert!((a - b).abs() < 1e-5);
        }
        assert!((decoded.duration_sec - 0.5).abs() < 1e-6);
    }

    #[test]
    fn decode_wav_rejects_stereo() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..100 {
                writer.write_sample(0i16).unwrap();
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        let err = decode_wav(&cursor.into_inner(), 16000).unwrap_err();
        assert!(matches!(err, PipelineError::Audio(_)));
    }

    #[test]
    fn decode_wav_rejects_empty() {
        assert!(decode_wav(&[], 16000).is_err());
        // Valid header, zero frames
        let bytes = wav_bytes(&[], 16000);
        assert!(decode_wav(&bytes, 16000).is_err());
    }

    #[test]
    fn decode_wav_resamples_to_target() {
        let samples = sine(440.0, 48000, 48000);
        let bytes = wav_bytes(&samples, 48000);
        let decoded = decode_wav(&bytes, 16000).unwrap();
        assert!(
            (15980..=16020).contains(&decoded.samples.len()),
            "got {} samples",
            decoded.samples.len()
        );
    }

    #[test]
    fn resampler_48k_to_16k_length() {
        let input = sine(440.0, 48000, 48000);
        let mut resampler = StreamResampler::new(48000, 16000).unwrap();
        let mut total = resampler.process(&input).unwrap().len();
        total += resampler.flush().unwrap().len();
        assert!((15980..=16020).contains(&total), "got {total} samples");
    }

    #[test]
    fn resampler_reusable_after_flush() {
        let input = sine(200.0, 44100, 44100);
        let mut resampler = StreamResampler::new(44100, 16000).unwrap();

        for _ in 0..2 {
            let mut total = resampler.process(&input).unwrap().len();
            total += resampler.flush().unwrap().len();
            assert!(
                (total as i64 - 16000).unsigned_abs() <= 50,
                "got {total} samples for one second of input"
            );
        }
    }

    #[test]
    fn resampler_rejects_zero_rate() {
        assert!(StreamResampler::new(0, 16000).is_err());
        assert!(StreamResampler::new(16000, 0).is_err());
    }
}
