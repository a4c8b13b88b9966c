//! HTTP/WebSocket transport.
//!
//! All RPC methods share one listener: `POST /mediator/{method}` with JSON
//! or binary bodies, and `GET /mediator/ws` for the per-session event
//! socket. The WebSocket's first text frame carries the session id binding
//! the socket to its session; afterwards the pump sends one event frame at
//! a time and waits for the literal `"OK"` acknowledgement.

use crate::error::MediatorError;
use crate::network::handler;
use crate::network::protocol::{Codec, ErrorBody, CONTENT_TYPE_BINARY};
use crate::supervisor::{SupervisorCommand, SupervisorHandle};
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Maximum size of the session-handshake frame; larger frames close the
/// socket with `MessageTooBig`. Event frames are not limited.
const HANDSHAKE_LIMIT: usize = 1024;
const CLOSE_TOO_BIG: u16 = 1009;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: SupervisorHandle,
    /// Ack deadline for the socket pump, mirroring the abandonment window.
    pub ack_timeout: Duration,
}

pub fn router(supervisor: SupervisorHandle, ack_timeout: Duration) -> Router {
    Router::new()
        .route("/mediator/{method}", post(handle_rpc))
        .route("/mediator/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(AppState {
            supervisor,
            ack_timeout,
        })
}

/// Binds the listener and serves until the shutdown token fires.
pub async fn serve(
    supervisor: SupervisorHandle,
    host: String,
    port: u16,
    ack_timeout: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "client listener up");
    axum::serve(listener, router(supervisor, ack_timeout))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn handle_rpc(
    State(state): State<AppState>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let codec_in = Codec::from_content_type(
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
    );
    let codec_out = match headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) {
        Some(accept) if accept.starts_with(CONTENT_TYPE_BINARY) => Codec::Binary,
        _ => codec_in,
    };

    match handler::dispatch(&state.supervisor, &method, codec_in, codec_out, &body).await {
        Ok(encoded) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, codec_out.content_type())],
            encoded,
        )
            .into_response(),
        Err(e) => error_response(&method, e),
    }
}

fn error_response(method: &str, e: MediatorError) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    // Internal detail stays in the log; the client gets an opaque message.
    let message = match &e {
        MediatorError::Internal(detail) => {
            warn!(method, detail = %detail, "internal error");
            "internal error".to_string()
        }
        other => other.to_string(),
    };
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::to_vec(&ErrorBody { error: message }).unwrap_or_default(),
    )
        .into_response()
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| ws_pump(socket, state))
}

/// Per-socket pump: bind to a session, then ship one frame per ack.
async fn ws_pump(mut socket: WebSocket, state: AppState) {
    let session = match socket.recv().await {
        Some(Ok(Message::Text(text))) => {
            if text.len() > HANDSHAKE_LIMIT {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_TOO_BIG,
                        reason: "MessageTooBig".into(),
                    })))
                    .await;
                return;
            }
            text.to_string()
        }
        _ => return,
    };

    let bound = state
        .supervisor
        .command(|reply| SupervisorCommand::WsBind {
            session: session.clone(),
            reply,
        })
        .await;
    if let Err(e) = bound {
        debug!(session = %session, error = %e, "websocket bind rejected");
        return;
    }
    info!(session = %session, "websocket attached");

    loop {
        let (tx, rx) = oneshot::channel();
        state
            .supervisor
            .post(SupervisorCommand::WsNext {
                session: session.clone(),
                reply: tx,
            })
            .await;
        // The sender is dropped when the session is purged.
        let Ok(frame) = rx.await else { break };

        let text = match serde_json::to_string(&frame) {
            Ok(t) => t,
            Err(e) => {
                warn!(session = %session, error = %e, "event frame encode failed");
                continue;
            }
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }
        if !await_ack(&mut socket, state.ack_timeout).await {
            break;
        }
        state
            .supervisor
            .post(SupervisorCommand::WsAck {
                session: session.clone(),
            })
            .await;
    }
    debug!(session = %session, "websocket pump ended");
}

/// Waits for the literal `"OK"` text acknowledgement. Control frames are
/// ignored; a close, error or deadline ends the socket.
async fn await_ack(socket: &mut WebSocket, deadline: Duration) -> bool {
    let wait = tokio::time::timeout(deadline, async {
        loop {
            match socket.recv().await {
                Some(Ok(Message::Text(text))) if text.as_str() == "OK" => return true,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return false,
                Some(Ok(_)) => continue,
            }
        }
    });
    wait.await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_shape() {
        let resp = error_response("ReadVariables", MediatorError::request("unknown variable"));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn internal_errors_are_opaque() {
        let resp = error_response("X", MediatorError::internal("secret detail"));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
