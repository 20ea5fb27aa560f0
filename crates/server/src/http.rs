//! HTTP endpoints
//!
//! `/health`, `/metrics`, the one-shot `POST /recognize` upload channel, and
//! the `/ws` streaming upgrade.

use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use asr_pipeline::{decode_wav, metrics, PipelineError};

use crate::state::AppState;
use crate::ws::ws_handler;
use crate::ServerError;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    // Leave the framework limit above the documented cap so oversized
    // uploads reach the explicit 413 path below.
    let body_limit = state.settings.server.max_upload_bytes + 1024 * 1024;

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/recognize", post(recognize))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Liveness check; reports the configured provider and thread count.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "provider": state.settings.model.provider,
        "threads": state.settings.model.num_threads,
    }))
}

/// Prometheus text exposition.
async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics_handle.render(),
    )
}

/// Record failure metrics and render the error. `started` is the request
/// start time once the session counter has been taken.
fn fail(err: ServerError, started: Option<Instant>) -> Response {
    metrics::observe_error(err.error_type());
    let total_sec = started.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0);
    metrics::observe_request(total_sec, 0.0, 0.0, 0, 0, 0.0, "http", "failed");
    if started.is_some() {
        metrics::session_ended(0.0);
    }
    err.into_response()
}

/// One-shot recognition: multipart upload of a mono WAV file.
async fn recognize(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    // Concurrent request limiting; no queueing, excess callers fail fast.
    let _permit = match state.request_slots.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => return fail(ServerError::Capacity, None),
    };

    metrics::session_started();
    let started = Instant::now();

    let data = match multipart.next_field().await {
        Ok(Some(field)) => match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                return fail(
                    ServerError::BadRequest(format!("Failed to read upload: {e}")),
                    Some(started),
                )
            }
        },
        Ok(None) => return fail(ServerError::BadRequest("No file uploaded".into()), Some(started)),
        Err(e) => {
            return fail(
                ServerError::BadRequest(format!("Malformed multipart body: {e}")),
                Some(started),
            )
        }
    };

    if data.len() > state.settings.server.max_upload_bytes {
        return fail(ServerError::TooLarge, Some(started));
    }
    if data.is_empty() {
        return fail(ServerError::BadRequest("Empty file".into()), Some(started));
    }

    let bytes_received = data.len() as u64;
    let sample_rate = state.settings.audio.sample_rate;
    let pool = state.recognizer.clone();

    // Decode and recognize on the blocking pool; inference can take hundreds
    // of milliseconds and the pool acquire may block.
    let outcome = tokio::task::spawn_blocking(move || -> Result<Transcription, PipelineError> {
        let preprocess_start = Instant::now();
        let audio = decode_wav(&data, sample_rate)?;
        let preprocess_sec = preprocess_start.elapsed().as_secs_f64();

        let decode_start = Instant::now();
        let text = pool.recognize(&audio.samples, sample_rate)?;
        let decode_sec = decode_start.elapsed().as_secs_f64();

        Ok(Transcription {
            text,
            duration_sec: audio.duration_sec,
            decode_sec,
            preprocess_sec,
        })
    })
    .await;

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            return fail(
                ServerError::Internal(format!("recognition task failed: {e}")),
                Some(started),
            )
        }
    };

    match result {
        Ok(transcription) => {
            let total_sec = started.elapsed().as_secs_f64();
            metrics::observe_ttfr(transcription.decode_sec, "http");
            metrics::observe_segment(f64::from(transcription.duration_sec), transcription.decode_sec);
            metrics::observe_request(
                total_sec,
                f64::from(transcription.duration_sec),
                transcription.decode_sec,
                1,
                bytes_received,
                transcription.preprocess_sec,
                "http",
                "success",
            );
            metrics::record_result(&transcription.text);
            metrics::session_ended(total_sec);

            Json(serde_json::json!({
                "text": transcription.text,
                "duration": transcription.duration_sec,
            }))
            .into_response()
        }
        Err(PipelineError::Audio(message)) => fail(ServerError::InvalidAudio(message), Some(started)),
        Err(e) => fail(ServerError::Internal(e.to_string()), Some(started)),
    }
}

struct Transcription {
    text: String,
    duration_sec: f32,
    decode_sec: f64,
    preprocess_sec: f64,
}
