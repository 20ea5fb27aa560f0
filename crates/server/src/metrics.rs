//! Prometheus recorder setup
//!
//! Installs the global recorder once at startup with explicit bucket
//! boundaries for every declared histogram. The pipeline records through the
//! `metrics` facade; `/metrics` renders from the handle kept in `AppState`.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const TTFR_BUCKETS: &[f64] = &[0.1, 0.2, 0.3, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 10.0];
const DECODE_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0];
const SEGMENT_BUCKETS: &[f64] = &[0.5, 1.0, 2.0, 5.0, 10.0, 15.0, 20.0, 30.0];
const RTF_BUCKETS: &[f64] = &[0.05, 0.1, 0.15, 0.2, 0.3, 0.4, 0.5, 0.75, 1.0, 1.5, 2.0];
const REQUEST_BUCKETS: &[f64] = &[0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 45.0, 60.0, 90.0, 120.0];
const AUDIO_BUCKETS: &[f64] = &[0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0];
const CONNECTION_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0];
const SESSION_BUCKETS: &[f64] = &[0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0];
const WORDS_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0];
const RMS_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5];

/// Install the Prometheus recorder. Must be called once, before any metric
/// is recorded.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full("asr_ttfr_seconds".into()), TTFR_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full("asr_decode_duration_seconds".into()), DECODE_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full("asr_preprocess_duration_seconds".into()), DECODE_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full("asr_segment_duration_seconds".into()), SEGMENT_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full("asr_segment_rtf".into()), RTF_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full("asr_rtf".into()), RTF_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full("asr_rtf_decode".into()), RTF_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full("asr_request_duration_seconds".into()), REQUEST_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full("asr_audio_duration_seconds".into()), AUDIO_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full("asr_connection_duration_seconds".into()), CONNECTION_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full("asr_session_duration_seconds".into()), SESSION_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full("asr_words_per_request".into()), WORDS_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full("asr_audio_rms_level".into()), RMS_BUCKETS)?
        .install_recorder()?;

    tracing::info!("Prometheus metrics initialized");
    Ok(handle)
}
