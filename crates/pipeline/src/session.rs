//! Per-connection streaming session
//!
//! Owns the windowing buffer, drives the VAD, pulls finalized segments
//! through the recognizer pool, and renders outgoing JSON messages.
//!
//! A session is bound to one connection and driven from that connection's
//! serialized event stream, so it needs no internal locking. Message JSON is
//! rendered into reused `String` buffers; callers must consume the returned
//! slice before the next call on the same session.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use asr_config::Settings;

use crate::audio::compute_rms;
use crate::error::PipelineError;
use crate::metrics;
use crate::recognizer::RecognizerPool;
use crate::vad::VoiceActivityDetector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Interim,
    Final,
    Done,
}

/// One outgoing message with its pre-rendered JSON payload.
pub struct OutMessage {
    pub kind: MessageKind,
    pub json: String,
}

pub struct Session {
    recognizer: Arc<RecognizerPool>,
    vad: VoiceActivityDetector,

    sample_rate: u32,
    window_size: usize,
    min_audio_sec: f32,
    max_audio_sec: f32,

    /// Samples waiting for a full VAD window; always shorter than one window.
    pending: Vec<f32>,

    /// Reused message buffer; `out_len` is the populated prefix.
    messages: Vec<OutMessage>,
    out_len: usize,

    start: Instant,
    has_first_result: bool,
    segments: u32,
    silence_segments: u32,
    decode_sec: f64,
    preprocess_sec: f64,
    audio_samples: u64,
    chunks: u64,
    bytes: u64,
    total_samples_received: u64,
    session_active: bool,
    max_duration_exceeded: bool,
}

impl Session {
    pub fn new(
        recognizer: Arc<RecognizerPool>,
        vad: VoiceActivityDetector,
        settings: &Settings,
    ) -> Self {
        let window_size = vad.window_size();
        Self {
            recognizer,
            vad,
            sample_rate: settings.audio.sample_rate,
            window_size,
            min_audio_sec: settings.audio.min_audio_sec,
            max_audio_sec: settings.audio.max_audio_sec,
            pending: Vec::with_capacity(window_size),
            messages: Vec::with_capacity(4),
            out_len: 0,
            start: Instant::now(),
            has_first_result: false,
            segments: 0,
            silence_segments: 0,
            decode_sec: 0.0,
            preprocess_sec: 0.0,
            audio_samples: 0,
            chunks: 0,
            bytes: 0,
            total_samples_received: 0,
            session_active: false,
            max_duration_exceeded: false,
        }
    }

    // --- Message buffer ---

    fn next_message(&mut self) -> &mut OutMessage {
        if self.out_len == self.messages.len() {
            self.messages.push(OutMessage {
                kind: MessageKind::Done,
                json: String::with_capacity(128),
            });
        }
        self.out_len += 1;
        &mut self.messages[self.out_len - 1]
    }

    fn current_messages(&self) -> &[OutMessage] {
        &self.messages[..self.out_len]
    }

    fn write_interim(&mut self, duration: f32, rms: f32, is_speech: bool) {
        let msg = self.next_message();
        msg.kind = MessageKind::Interim;
        msg.json.clear();
        let _ = write!(
            msg.json,
            "{{\"type\":\"interim\",\"duration\":{duration:.1},\"rms\":{rms:.4},\"is_speech\":{is_speech}}}"
        );
    }

    fn write_final(&mut self, text: &str, duration: f32) {
        let msg = self.next_message();
        msg.kind = MessageKind::Final;
        msg.json.clear();
        msg.json.push_str("{\"type\":\"final\",\"text\":\"");
        json_escape_into(&mut msg.json, text);
        let _ = write!(msg.json, "\",\"duration\":{duration:.3}}}");
    }

    fn write_done(&mut self) {
        let msg = self.next_message();
        msg.kind = MessageKind::Done;
        msg.json.clear();
        msg.json.push_str("{\"type\":\"done\"}");
    }

    // --- Lifecycle ---

    fn reset_counters(&mut self) {
        self.start = Instant::now();
        self.has_first_result = false;
        self.segments = 0;
        self.silence_segments = 0;
        self.decode_sec = 0.0;
        self.preprocess_sec = 0.0;
        self.audio_samples = 0;
        self.chunks = 0;
        self.bytes = 0;
        self.total_samples_received = 0;
        self.max_duration_exceeded = false;
    }

    fn process_vad_segments(&mut self) -> Result<(), PipelineError> {
        while let Some(segment) = self.vad.pop() {
            let audio_sec = segment.duration_sec(self.sample_rate);

            if audio_sec < self.min_audio_sec {
                tracing::debug!(audio_sec, "skipping short segment");
                self.silence_segments += 1;
                metrics::record_silence();
                continue;
            }

            let decode_start = Instant::now();
            let text = self.recognizer.recognize(&segment.samples, self.sample_rate)?;
            let seg_decode_sec = decode_start.elapsed().as_secs_f64();
            self.decode_sec += seg_decode_sec;
            self.audio_samples += segment.samples.len() as u64;

            metrics::observe_segment(f64::from(audio_sec), seg_decode_sec);

            if text.is_empty() {
                self.silence_segments += 1;
                metrics::record_silence();
            } else {
                if !self.has_first_result {
                    self.has_first_result = true;
                    metrics::observe_ttfr(self.start.elapsed().as_secs_f64(), "websocket");
                }
                self.segments += 1;
                metrics::record_result(&text);
                self.write_final(&text, audio_sec);
            }
        }
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<(), PipelineError> {
        if !self.pending.is_empty() {
            self.pending.resize(self.window_size, 0.0);
            self.vad.accept_waveform(&self.pending)?;
            self.pending.clear();
        }
        self.vad.flush();
        Ok(())
    }

    fn finalize_session(&mut self) {
        let total_sec = self.start.elapsed().as_secs_f64();
        let audio_sec = self.audio_samples as f64 / f64::from(self.sample_rate);

        metrics::observe_request(
            total_sec,
            audio_sec,
            self.decode_sec,
            self.chunks,
            self.bytes,
            self.preprocess_sec,
            "websocket",
            "success",
        );

        let total_segments = self.segments + self.silence_segments;
        if total_segments > 0 {
            metrics::set_speech_ratio(f64::from(self.segments) / f64::from(total_segments));
        }

        self.write_done();

        if self.session_active {
            metrics::session_ended(total_sec);
            self.session_active = false;
        }

        // Reset for the next utterance on the same connection.
        self.vad.reset();
        self.pending.clear();
        self.reset_counters();
    }

    // --- Public API ---

    /// Feed a chunk of model-rate samples.
    ///
    /// Returns the messages produced by this call, valid until the next call
    /// on this session. After a duration-cap auto-finalize, further audio is
    /// dropped until `on_recognize` or `on_reset` is observed.
    pub fn on_audio(&mut self, samples: &[f32]) -> Result<&[OutMessage], PipelineError> {
        self.out_len = 0;

        if self.max_duration_exceeded {
            return Ok(self.current_messages());
        }

        let preprocess_start = Instant::now();

        // Lazy session start: only count once audio actually arrives.
        if !self.session_active {
            self.session_active = true;
            metrics::session_started();
        }

        self.chunks += 1;
        self.total_samples_received += samples.len() as u64;
        self.bytes += samples.len() as u64 * std::mem::size_of::<f32>() as u64;

        let rms = compute_rms(samples);
        metrics::record_audio_level(f64::from(rms));

        // Accumulate and feed the VAD in window-sized chunks.
        let mut offset = 0;
        while offset < samples.len() {
            let room = self.window_size - self.pending.len();
            let take = room.min(samples.len() - offset);
            self.pending.extend_from_slice(&samples[offset..offset + take]);
            offset += take;

            if self.pending.len() == self.window_size {
                self.vad.accept_waveform(&self.pending)?;
                self.pending.clear();
            }
        }

        self.preprocess_sec += preprocess_start.elapsed().as_secs_f64();

        self.process_vad_segments()?;

        // No finalized segment this call: report progress instead.
        if self.out_len == 0 {
            let duration = self.total_samples_received as f32 / self.sample_rate as f32;
            let is_speech = self.vad.is_speech();
            self.write_interim(duration, rms, is_speech);
        }

        let received_sec = self.total_samples_received as f32 / self.sample_rate as f32;
        if received_sec > self.max_audio_sec {
            tracing::warn!(
                received_sec,
                max_audio_sec = self.max_audio_sec,
                "max audio duration exceeded, forcing recognize"
            );
            self.flush_pending()?;
            self.process_vad_segments()?;
            self.finalize_session();
            self.max_duration_exceeded = true;
        }

        Ok(self.current_messages())
    }

    /// Finalize the current utterance: pad and flush pending audio, drain
    /// remaining segments, emit `done`, and reset for the next utterance.
    pub fn on_recognize(&mut self) -> Result<&[OutMessage], PipelineError> {
        self.out_len = 0;

        // Auto-finalize already emitted done and recorded metrics; just
        // clear the flag so the connection can stream again.
        if self.max_duration_exceeded {
            self.max_duration_exceeded = false;
            return Ok(self.current_messages());
        }

        self.flush_pending()?;
        self.process_vad_segments()?;
        self.finalize_session();
        Ok(self.current_messages())
    }

    /// Discard the current utterance without emitting `done`.
    pub fn on_reset(&mut self) {
        self.max_duration_exceeded = false;
        if self.session_active {
            metrics::session_ended(0.0);
            self.session_active = false;
        }
        self.vad.reset();
        self.pending.clear();
        self.reset_counters();
    }

    /// Connection closed: record session end with wall-clock duration.
    pub fn on_close(&mut self) {
        if self.session_active {
            metrics::session_ended(self.start.elapsed().as_secs_f64());
            self.session_active = false;
        }
    }
}

/// Append `s` to `out` with RFC 8259 §7 escaping: the mandatory two-character
/// escapes plus `\u00XX` for remaining control characters below 0x20.
fn json_escape_into(out: &mut String, s: &str) {
    out.reserve(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::RecognizerEngine;
    use crate::vad::{VadInference, VAD_STATE_LEN};
    use asr_config::Settings;

    struct FixedEngine(&'static str);
    impl RecognizerEngine for FixedEngine {
        fn transcribe(&self, _audio: &[f32], _sample_rate: u32) -> Result<String, PipelineError> {
            Ok(self.0.to_string())
        }
    }

    struct Scripted {
        probs: std::collections::VecDeque<f32>,
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

    fn session_with(probs: &[f32], text: &'static str, settings: &Settings) -> Session {
        let pool = Arc::new(RecognizerPool::new(vec![Box::new(FixedEngine(text))]));
        let backend = Box::new(Scripted {
            probs: probs.iter().copied().collect(),
        });
        let vad =
            VoiceActivityDetector::new(&settings.vad, settings.audio.sample_rate, backend).unwrap();
        Session::new(pool, vad, settings)
    }

    #[test]
    fn silent_chunk_yields_one_interim() {
        let settings = Settings::default();
        let mut session = session_with(&[], "unused", &settings);

        let messages = session.on_audio(&vec![0.0; 1024]).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Interim);
        assert_eq!(
            messages[0].json,
            "{\"type\":\"interim\",\"duration\":0.1,\"rms\":0.0000,\"is_speech\":false}"
        );
    }

    #[test]
    fn recognize_after_silence_ends_with_done_only() {
        let settings = Settings::default();
        let mut session = session_with(&[], "unused", &settings);

        session.on_audio(&vec![0.0; 32000]).unwrap();
        let messages = session.on_recognize().unwrap();
        assert!(!messages.is_empty());
        assert_eq!(messages.last().unwrap().kind, MessageKind::Done);
        assert_eq!(messages.last().unwrap().json, "{\"type\":\"done\"}");
        assert!(messages.iter().all(|m| m.kind != MessageKind::Final));
        assert_eq!(
            messages.iter().filter(|m| m.kind == MessageKind::Done).count(),
            1
        );
    }

    #[test]
    fn speech_produces_final_before_done() {
        // 32 speech windows then 16 silence windows: one finalized segment of
        // 48 * 512 samples = 1.536 s, above both duration floors.
        let mut probs = vec![0.9; 32];
        probs.extend(vec![0.0; 16]);
        let settings = Settings::default();
        let mut session = session_with(&probs, "hello world", &settings);

        let messages = session.on_audio(&vec![0.1; 48 * 512]).unwrap();
        let finals: Vec<_> = messages.iter().filter(|m| m.kind == MessageKind::Final).collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(
            finals[0].json,
            "{\"type\":\"final\",\"text\":\"hello world\",\"duration\":1.536}"
        );
        assert!(messages.iter().all(|m| m.kind != MessageKind::Done));

        let messages = session.on_recognize().unwrap();
        assert_eq!(messages.last().unwrap().kind, MessageKind::Done);
    }

    #[test]
    fn pending_stays_below_window_size() {
        let settings = Settings::default();
        let mut session = session_with(&[], "unused", &settings);

        for len in [700usize, 700, 700, 511, 513, 1] {
            session.on_audio(&vec![0.0; len]).unwrap();
            assert!(session.pending.len() < session.window_size);
        }
    }

    #[test]
    fn duration_cap_finalizes_and_drops_further_audio() {
        let mut settings = Settings::default();
        settings.audio.max_audio_sec = 0.5;
        let mut session = session_with(&[], "unused", &settings);

        // One second of audio crosses the 0.5 s cap: done must be emitted.
        let messages = session.on_audio(&vec![0.0; 16000]).unwrap();
        assert_eq!(messages.last().unwrap().kind, MessageKind::Done);

        // Audio after the cap is silently dropped.
        let messages = session.on_audio(&vec![0.0; 1024]).unwrap();
        assert!(messages.is_empty());

        // on_recognize clears the latch and returns nothing new.
        let messages = session.on_recognize().unwrap();
        assert!(messages.is_empty());

        // The session is usable again.
        let messages = session.on_audio(&vec![0.0; 1600]).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Interim);
        assert!(messages[0].json.contains("\"duration\":0.1"));
    }

    #[test]
    fn reset_is_idempotent_and_restarts_counters() {
        let settings = Settings::default();
        let mut session = session_with(&[], "unused", &settings);

        session.on_audio(&vec![0.0; 4096]).unwrap();
        session.on_reset();
        session.on_reset();

        let messages = session.on_audio(&vec![0.0; 1600]).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].json.contains("\"duration\":0.1"));
    }

    #[test]
    fn message_buffer_is_reused_across_calls() {
        let settings = Settings::default();
        let mut session = session_with(&[], "unused", &settings);

        session.on_audio(&vec![0.0; 1024]).unwrap();
        let second = session.on_audio(&vec![0.0; 1024]).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(
            second[0].json,
            "{\"type\":\"interim\",\"duration\":0.1,\"rms\":0.0000,\"is_speech\":false}"
        );
    }

    #[test]
    fn final_text_is_json_escaped() {
        let mut probs = vec![0.9; 32];
        probs.extend(vec![0.0; 16]);
        let settings = Settings::default();
        let mut session = session_with(&probs, "he said \"hi\"\n\\done\u{1}", &settings);

        let messages = session.on_audio(&vec![0.1; 48 * 512]).unwrap();
        let final_msg = messages.iter().find(|m| m.kind == MessageKind::Final).unwrap();
        assert!(final_msg
            .json
            .contains("\"text\":\"he said \\\"hi\\\"\\n\\\\done\\u0001\""));
    }

    #[test]
    fn json_escape_handles_controls() {
        let mut out = String::new();
        json_escape_into(&mut out, "a\tb\u{8}\u{c}\r\u{1f}э");
        assert_eq!(out, "a\\tb\\b\\f\\r\\u001fэ");
    }
}
