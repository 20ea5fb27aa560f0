//! Metric recording helpers
//!
//! Thin wrappers over the `metrics` facade with a fixed vocabulary. Label
//! values are `&'static str` so hot paths never build label maps; histogram
//! buckets are configured where the Prometheus recorder is installed.

use ::metrics::{counter, gauge, histogram};

/// Record a new streaming connection.
pub fn connection_opened() {
    counter!("asr_connections_total").increment(1);
    gauge!("asr_active_connections").increment(1.0);
}

/// Record a closed streaming connection.
pub fn connection_closed(reason: &'static str, duration_sec: f64) {
    gauge!("asr_active_connections").decrement(1.0);
    counter!("asr_disconnections_total", "reason" => reason).increment(1);
    histogram!("asr_connection_duration_seconds").record(duration_sec);
}

/// Record the start of a recognition session (first audio of an utterance
/// run, or an accepted upload).
pub fn session_started() {
    counter!("asr_sessions_total").increment(1);
    gauge!("asr_active_sessions").increment(1.0);
}

/// Record the end of a recognition session.
pub fn session_ended(duration_sec: f64) {
    gauge!("asr_active_sessions").decrement(1.0);
    histogram!("asr_session_duration_seconds").record(duration_sec);
}

/// Time to first result, by transport mode.
pub fn observe_ttfr(sec: f64, mode: &'static str) {
    histogram!("asr_ttfr_seconds", "mode" => mode).record(sec);
}

/// Per-segment decode observation. Cumulative audio time is exposed through
/// the `_sum` of the segment-duration histogram.
pub fn observe_segment(audio_sec: f64, decode_sec: f64) {
    histogram!("asr_decode_duration_seconds").record(decode_sec);
    histogram!("asr_segment_duration_seconds").record(audio_sec);
    counter!("asr_segments_total").increment(1);
    if audio_sec > 0.0 {
        histogram!("asr_segment_rtf").record(decode_sec / audio_sec);
    }
}

/// Request-level observation for one finalized utterance or upload.
#[allow(clippy::too_many_arguments)]
pub fn observe_request(
    total_sec: f64,
    audio_sec: f64,
    decode_sec: f64,
    chunks: u64,
    bytes: u64,
    preprocess_sec: f64,
    mode: &'static str,
    status: &'static str,
) {
    counter!("asr_requests_total", "mode" => mode, "status" => status).increment(1);
    histogram!("asr_request_duration_seconds", "mode" => mode, "status" => status).record(total_sec);
    histogram!("asr_audio_duration_seconds").record(audio_sec);
    histogram!("asr_preprocess_duration_seconds").record(preprocess_sec);

    if audio_sec > 0.0 {
        histogram!("asr_rtf", "mode" => mode).record(total_sec / audio_sec);
        histogram!("asr_rtf_decode", "mode" => mode).record(decode_sec / audio_sec);
    }

    counter!("asr_chunks_total").increment(chunks);
    counter!("asr_bytes_total").increment(bytes);
}

/// Count an error by type.
pub fn observe_error(error_type: &'static str) {
    counter!("asr_errors_total", "error_type" => error_type).increment(1);
}

/// Word/character accounting for a final text.
pub fn record_result(text: &str) {
    if text.is_empty() {
        counter!("asr_empty_results_total").increment(1);
        return;
    }
    let words = text.split_whitespace().count() as u64;
    counter!("asr_words_total").increment(words);
    counter!("asr_characters_total").increment(text.chars().count() as u64);
    histogram!("asr_words_per_request").record(words as f64);
}

/// Input level observation; very quiet chunks are counted separately.
pub fn record_audio_level(rms: f64) {
    histogram!("asr_audio_rms_level").record(rms);
    if rms < 0.005 {
        counter!("asr_low_volume_warnings_total").increment(1);
    }
}

/// Count a segment that produced no text.
pub fn record_silence() {
    counter!("asr_silence_segments_total").increment(1);
}

/// Recognized-vs-silence segment ratio of the last finalized request.
pub fn set_speech_ratio(ratio: f64) {
    gauge!("asr_speech_ratio").set(ratio);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_do_not_panic_without_a_recorder() {
        connection_opened();
        connection_closed("normal", 1.0);
        session_started();
        session_ended(0.5);
        observe_ttfr(0.2, "websocket");
        observe_segment(1.0, 0.1);
        observe_request(2.0, 1.5, 0.2, 3, 4096, 0.01, "http", "success");
        observe_error("invalid_audio");
        record_result("hello world");
        record_result("");
        record_audio_level(0.001);
        record_silence();
        set_speech_ratio(0.5);
    }
}
