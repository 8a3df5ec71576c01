//! The connection worker: the single task that owns one WebSocket
//! connection's state from just after the opening handshake until the
//! socket closes.
//!
//! Modeled on the writer-task-plus-`tokio::select!` heartbeat/idle-timeout
//! loop this lineage uses for its signaling sockets, adapted to drive the
//! hand-rolled RFC 6455 frame codec directly over the raw upgraded byte
//! stream rather than a pre-built `WebSocket` abstraction — spec.md calls
//! the connection runtime out as one of the four hard-engineering
//! subsystems, so the codec is ours end to end rather than borrowed from
//! `axum::extract::ws`.
//!
//! No other task ever mutates this connection's `ConnectionRecord`; all
//! state transitions happen here, and a worker crash is confined to this
//! one socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::interval;

use crate::app::AppState;
use crate::core::{id_string, now_s};
use crate::dispatch::{self, DispatchContext, InboundEnvelope};
use crate::error::HubError;
use crate::security::{message_gate, FilterOutcome};
use crate::ws::connection::{ConnectionState, Delivery};
use crate::ws::frame::{self, FrameError, Opcode};

const READ_CHUNK: usize = 8192;

/// Why the worker stopped reading frames, carried to the final close frame.
/// The third field says whether the worker itself should invalidate the
/// bound session (`Some(reason)`) or leave it for the periodic sweeper to
/// classify (`None`) — an idle-timeout close mustn't race the sweep with an
/// immediate `Logout` invalidation, or scenario's "marked invalid with
/// reason timeout" is never observable.
type CloseOutcome = (u16, &'static str, Option<crate::session::InvalidationReason>);

/// Drive one connection end to end. `socket` is already past the opening
/// handshake (the 101 response has been sent by the caller); this owns
/// everything from here.
pub async fn run_connection<S>(mut socket: S, state: Arc<AppState>, ip: String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connection_id = id_string();
    let mut metadata = HashMap::new();
    metadata.insert("ip".to_string(), ip.clone());

    let (handle, mut mailbox) = state.connections.register(connection_id.clone(), metadata);
    state
        .connections
        .set_state(&connection_id, ConnectionState::OpenUnauthenticated);
    crate::telemetry::CONNECTIONS_OPENED.inc();
    crate::telemetry::CONNECTIONS_CURRENT.inc();
    tracing::info!(connection_id = %connection_id, ip = %ip, "connection_opened");

    let mut read_buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut heartbeat = interval(Duration::from_millis(state.config.heartbeat_interval_ms));
    heartbeat.tick().await; // swallow the immediate first tick
    let mut shutdown = state.shutdown.subscribe();

    let outcome: CloseOutcome = 'conn: loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                break 'conn (frame::CLOSE_GOING_AWAY, "server shutting down", Some(crate::session::InvalidationReason::Logout));
            }

            delivery = mailbox.recv() => {
                match delivery {
                    Some(Delivery::Envelope(env)) => {
                        if write_envelope(&mut socket, &env).await.is_err() {
                            break 'conn (frame::CLOSE_GOING_AWAY, "write failed", Some(crate::session::InvalidationReason::Logout));
                        }
                    }
                    Some(Delivery::Close(code, _reason)) => {
                        break 'conn (code, "closed by server", Some(crate::session::InvalidationReason::Logout));
                    }
                    None => break 'conn (frame::CLOSE_GOING_AWAY, "mailbox closed", Some(crate::session::InvalidationReason::Logout)),
                }
            }

            _ = heartbeat.tick() => {
                if now_s().saturating_sub(handle.last_activity_s()) > state.config.idle_timeout_s {
                    tracing::info!(connection_id = %connection_id, "idle_timeout");
                    // Don't invalidate here: the periodic sweeper classifies
                    // this session as `Timeout` on its next pass, which is
                    // what makes the reason observable as such rather than
                    // being preempted by an immediate `Logout`.
                    break 'conn (frame::CLOSE_GOING_AWAY, "idle timeout", None);
                }
                if socket.write_all(&frame::encode_frame(Opcode::Ping, b"")).await.is_err() {
                    break 'conn (frame::CLOSE_GOING_AWAY, "ping write failed", Some(crate::session::InvalidationReason::Logout));
                }
            }

            read_result = socket.read(&mut chunk) => {
                match read_result {
                    Ok(0) => break 'conn (frame::CLOSE_NORMAL, "eof", Some(crate::session::InvalidationReason::Logout)),
                    Ok(n) => {
                        read_buf.extend_from_slice(&chunk[..n]);
                        handle.touch();
                        match drain_frames(&mut read_buf, &mut socket, &state, &connection_id, &ip).await {
                            Ok(true) => {}
                            Ok(false) => break 'conn (frame::CLOSE_NORMAL, "peer closed", Some(crate::session::InvalidationReason::Logout)),
                            Err(close) => break 'conn close,
                        }
                    }
                    Err(_) => break 'conn (frame::CLOSE_PROTOCOL_ERROR, "read error", Some(crate::session::InvalidationReason::Logout)),
                }
            }
        }
    };

    let (code, reason, invalidation_reason) = outcome;
    let _ = socket.write_all(&frame::encode_close(code, reason)).await;
    let _ = socket.shutdown().await;

    state.broker.remove_subscriber_everywhere(&connection_id);
    if let Some(invalidation_reason) = invalidation_reason {
        if let Some(session_id) = state.connections.session_id(&connection_id) {
            let _ = state.sessions.invalidate(&session_id, invalidation_reason);
        }
    }
    state.connections.deregister(&connection_id);
    crate::telemetry::CONNECTIONS_CURRENT.dec();
    tracing::info!(connection_id = %connection_id, code, reason, "connection_closed");
}

/// Decode and handle every complete frame currently buffered. Returns
/// `Ok(true)` to keep reading, `Ok(false)` when the peer sent `close`, or
/// `Err` with the close code/reason the caller should send back.
async fn drain_frames<S>(
    buf: &mut Vec<u8>,
    socket: &mut S,
    state: &Arc<AppState>,
    connection_id: &str,
    ip: &str,
) -> Result<bool, CloseOutcome>
where
    S: AsyncWrite + Unpin,
{
    loop {
        match frame::decode_frame(buf, state.config.max_frame_bytes) {
            Ok(None) => return Ok(true),
            Err(FrameError::Oversize) => {
                return Err((frame::CLOSE_TOO_BIG, "frame too large", Some(crate::session::InvalidationReason::Logout)))
            }
            Err(FrameError::Malformed) => {
                return Err((frame::CLOSE_PROTOCOL_ERROR, "malformed frame", Some(crate::session::InvalidationReason::Logout)))
            }
            Ok(Some((frm, consumed))) => {
                buf.drain(0..consumed);
                match frm.opcode {
                    Opcode::Ping => {
                        if socket
                            .write_all(&frame::encode_frame(Opcode::Pong, &frm.payload))
                            .await
                            .is_err()
                        {
                            return Err((frame::CLOSE_GOING_AWAY, "pong write failed", Some(crate::session::InvalidationReason::Logout)));
                        }
                    }
                    Opcode::Pong => {}
                    Opcode::Close => {
                        let _ = socket.write_all(&frame::encode_frame(Opcode::Close, &frm.payload)).await;
                        return Ok(false);
                    }
                    Opcode::Text => {
                        handle_text_frame(&frm.payload, socket, state, connection_id, ip).await?;
                    }
                    Opcode::Binary | Opcode::Continuation => {
                        // Out of scope: the wire protocol carries JSON text frames only.
                    }
                }
            }
        }
    }
}

async fn handle_text_frame<S>(
    payload: &[u8],
    socket: &mut S,
    state: &Arc<AppState>,
    connection_id: &str,
    ip: &str,
) -> Result<(), CloseOutcome>
where
    S: AsyncWrite + Unpin,
{
    let mut value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(_) => {
            let env = HubError::InvalidJson.to_envelope(None);
            reply(socket, &env).await?;
            return Ok(());
        }
    };

    let r#ref = value
        .get("ref")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if let Some(payload_value) = value.get_mut("payload") {
        if let FilterOutcome::Deny(err) = message_gate(payload_value, &state.config.path_traversal_base) {
            crate::telemetry::FILTER_REJECTIONS.inc();
            tracing::info!(connection_id = %connection_id, code = err.code(), "message_gate_rejected");
            reply(socket, &err.to_envelope(r#ref)).await?;
            return Ok(());
        }
    }

    let envelope: InboundEnvelope = match serde_json::from_value(value) {
        Ok(e) => e,
        Err(_) => {
            reply(socket, &HubError::InvalidPayload.to_envelope(r#ref)).await?;
            return Ok(());
        }
    };

    let is_authenticated = state.connections.is_authenticated(connection_id);
    let user_id = state.connections.user_id(connection_id);
    let ctx = DispatchContext {
        connection_id,
        is_authenticated,
        user_id: user_id.as_deref(),
        ip,
        tokens: &state.tokens,
        sessions: &state.sessions,
        rate_limits: &state.rate_limits,
        users: &state.users,
        broker: &state.broker,
        connections: &state.connections,
    };

    let timer = crate::telemetry::DISPATCH_LATENCY.start_timer();
    let outcome = dispatch::dispatch(envelope, &ctx);
    timer.observe_duration();
    crate::telemetry::MESSAGES_DISPATCHED.inc();

    if let Some((user_id, session_id)) = outcome.bind_session {
        state.connections.bind_session(connection_id, &user_id, &session_id);
    }
    if let Some(session_id) = state.connections.session_id(connection_id) {
        let _ = state.sessions.touch(&session_id);
    }

    if write_envelope(socket, &outcome.reply).await.is_err() {
        return Err((frame::CLOSE_GOING_AWAY, "write failed", Some(crate::session::InvalidationReason::Logout)));
    }
    Ok(())
}

async fn reply<S>(socket: &mut S, env: &crate::error::ErrorEnvelope) -> Result<(), CloseOutcome>
where
    S: AsyncWrite + Unpin,
{
    let value = serde_json::to_value(env).expect("error envelope always serializes");
    write_envelope(socket, &value)
        .await
        .map_err(|_| (frame::CLOSE_GOING_AWAY, "write failed", Some(crate::session::InvalidationReason::Logout)))
}

async fn write_envelope<S>(socket: &mut S, value: &serde_json::Value) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes = serde_json::to_vec(value).expect("outbound envelope always serializes");
    socket.write_all(&frame::encode_text(&bytes)).await
}
