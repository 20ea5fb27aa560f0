//! WebSocket streaming transport
//!
//! Each connection gets its own `Session` running on a blocking worker task.
//! The socket loop decodes frames into commands and forwards them over an
//! mpsc channel; rendered JSON comes back over a second channel and a sender
//! task writes it out. Both channels are single-consumer, so message order
//! is preserved end to end and the session itself never needs a lock.
//!
//! Protocol: binary frames carry little-endian f32 mono samples; text frames
//! carry either a `{"sample_rate":N}` announcement or one of the commands
//! `RECOGNIZE` / `RESET`. Unknown text and malformed binary are logged and
//! ignored; oversized frames close the connection with a policy violation.

use std::borrow::Cow;
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use asr_pipeline::{metrics, OutMessage, PipelineError, Session, StreamResampler};

use crate::state::AppState;

/// Stimuli forwarded to the session worker.
enum WsCommand {
    Audio(Vec<f32>),
    SampleRate(u32),
    Recognize,
    Reset,
}

/// Frames travelling back to the socket.
enum Outgoing {
    Text(String),
    Close { code: u16, reason: &'static str },
}

/// Upgrade handler for `GET /ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    // Keep the protocol-level cap above the configured limit so frames just
    // over it reach the explicit policy-violation close below.
    let max_bytes = state.settings.server.max_ws_message_bytes;
    ws.max_message_size(max_bytes + 4096)
        .max_frame_size(max_bytes + 4096)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    metrics::connection_opened();
    let connected_at = Instant::now();
    let mut close_reason: &'static str = "normal";

    let session = match state.new_session() {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "failed to create session");
            metrics::observe_error("session_init");
            metrics::connection_closed("internal_error", 0.0);
            return;
        }
    };

    let (cmd_tx, cmd_rx) = mpsc::channel::<WsCommand>(64);
    let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(64);
    let control_tx = out_tx.clone();

    let model_rate = state.settings.audio.sample_rate;
    let worker = tokio::task::spawn_blocking(move || session_worker(session, model_rate, cmd_rx, out_tx));

    let (mut sender, mut receiver) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(outgoing) = out_rx.recv().await {
            let result = match outgoing {
                Outgoing::Text(json) => sender.send(Message::Text(json)).await,
                Outgoing::Close { code, reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: Cow::Borrowed(reason),
                        })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    let max_bytes = state.settings.server.max_ws_message_bytes;
    let idle_timeout = Duration::from_secs(state.settings.server.ws_idle_timeout_secs);

    loop {
        let frame = match tokio::time::timeout(idle_timeout, receiver.next()).await {
            Ok(frame) => frame,
            Err(_) => {
                tracing::info!("closing idle connection");
                close_reason = "idle_timeout";
                let _ = control_tx
                    .send(Outgoing::Close { code: close_code::NORMAL, reason: "Idle timeout" })
                    .await;
                break;
            }
        };

        match frame {
            Some(Ok(Message::Binary(data))) => {
                if data.len() > max_bytes {
                    tracing::warn!(bytes = data.len(), limit = max_bytes, "frame too large");
                    close_reason = "message_too_large";
                    let _ = control_tx
                        .send(Outgoing::Close { code: close_code::POLICY, reason: "Message too large" })
                        .await;
                    break;
                }
                let Some(samples) = decode_f32_frame(&data) else {
                    tracing::warn!(bytes = data.len(), "invalid binary frame size");
                    continue;
                };
                if cmd_tx.send(WsCommand::Audio(samples)).await.is_err() {
                    close_reason = "internal_error";
                    break;
                }
            }
            Some(Ok(Message::Text(text))) => {
                let command = match parse_text_frame(&text) {
                    Some(command) => command,
                    None => {
                        tracing::warn!(message = %text, "ignoring unknown text message");
                        continue;
                    }
                };
                if cmd_tx.send(command).await.is_err() {
                    close_reason = "internal_error";
                    break;
                }
            }
            // Ping/pong is handled by the protocol layer.
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "websocket receive error");
                close_reason = "protocol_error";
                break;
            }
        }
    }

    // Dropping the command channel stops the worker; it runs on_close and
    // releases its side of the outgoing channel, ending the sender task.
    drop(cmd_tx);
    drop(control_tx);
    let _ = worker.await;
    let _ = send_task.await;

    let duration = connected_at.elapsed().as_secs_f64();
    tracing::info!(duration, reason = close_reason, "connection closed");
    metrics::connection_closed(close_reason, duration);
}

/// Session worker: owns the session plus the optional resampler, and runs on
/// the blocking pool because recognition blocks for pool slots and inference.
fn session_worker(
    mut session: Session,
    model_rate: u32,
    mut commands: mpsc::Receiver<WsCommand>,
    out: mpsc::Sender<Outgoing>,
) {
    let mut resampler: Option<StreamResampler> = None;
    let mut rate_announced = false;

    while let Some(command) = commands.blocking_recv() {
        let result: Result<bool, PipelineError> = (|| match command {
            WsCommand::Audio(samples) => {
                let messages = match resampler.as_mut() {
                    Some(resampler) => session.on_audio(resampler.process(&samples)?)?,
                    None => session.on_audio(&samples)?,
                };
                Ok(forward(&out, messages))
            }
            WsCommand::SampleRate(rate) => {
                // Only the first announcement takes effect.
                if rate_announced {
                    return Ok(true);
                }
                rate_announced = true;
                if rate != model_rate {
                    resampler = Some(StreamResampler::new(rate, model_rate)?);
                    tracing::info!(from = rate, to = model_rate, "resampling enabled");
                } else {
                    tracing::debug!(rate, "client sample rate matches model rate");
                }
                Ok(true)
            }
            WsCommand::Recognize => {
                // Flush the resampler filter tail before finalizing.
                if let Some(resampler) = resampler.as_mut() {
                    let tail = resampler.flush()?;
                    if !tail.is_empty() {
                        let messages = session.on_audio(tail)?;
                        if !forward(&out, messages) {
                            return Ok(false);
                        }
                    }
                }
                let messages = session.on_recognize()?;
                Ok(forward(&out, messages))
            }
            WsCommand::Reset => {
                session.on_reset();
                // Reset the filter state for the next utterance too.
                if let Some(resampler) = resampler.as_mut() {
                    resampler.flush()?;
                }
                Ok(true)
            }
        })();

        match result {
            Ok(true) => {}
            // Peer is gone; nothing left to deliver.
            Ok(false) => break,
            Err(e) => {
                tracing::error!(error = %e, "error in session worker");
                metrics::observe_error("ws_handler_error");
                let _ = out.blocking_send(Outgoing::Close {
                    code: close_code::ERROR,
                    reason: "Internal error",
                });
                break;
            }
        }
    }

    session.on_close();
}

fn forward(out: &mpsc::Sender<Outgoing>, messages: &[OutMessage]) -> bool {
    for message in messages {
        if out.blocking_send(Outgoing::Text(message.json.clone())).is_err() {
            return false;
        }
    }
    true
}

/// Decode a binary frame of little-endian f32 samples. Returns `None` for
/// empty frames or lengths that are not a multiple of 4.
fn decode_f32_frame(data: &[u8]) -> Option<Vec<f32>> {
    if data.is_empty() || data.len() % 4 != 0 {
        return None;
    }
    Some(
        data.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

/// Parse a text frame into a command. A leading `{` is treated as a
/// sample-rate announcement; out-of-range rates are rejected here.
fn parse_text_frame(text: &str) -> Option<WsCommand> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        let rate = value.get("sample_rate")?.as_i64()?;
        if !(8000..=192_000).contains(&rate) {
            tracing::warn!(rate, "ignoring out-of-range sample_rate");
            return None;
        }
        return Some(WsCommand::SampleRate(rate as u32));
    }
    match trimmed {
        "RECOGNIZE" => Some(WsCommand::Recognize),
        "RESET" => Some(WsCommand::Reset),
        _ => None,
    }
}
