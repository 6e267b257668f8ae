//! Daemon control-plane WebSocket endpoint.
//!
//! One long-lived socket per daemon. Authentication happens before the
//! upgrade: a bad token is a plain 401 and the handshake never completes.

use super::types::ErrorResponse;
use super::{authenticate_token, AppState};
use crate::protocol::{self, DaemonMessage};

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(super) struct WsParams {
    #[serde(default)]
    token: String,
}

pub(super) async fn daemon_ws(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let Some(user_id) = authenticate_token(&params.token) else {
        tracing::warn!("Rejected daemon connection with invalid token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new("FORBIDDEN", "missing or invalid token")),
        )
            .into_response();
    };

    ws.on_upgrade(move |socket| run_daemon_socket(socket, state, user_id))
}

async fn run_daemon_socket(socket: WebSocket, state: AppState, user_id: String) {
    let (conn, mut commands) = state.registry.register(&user_id);
    let (mut sink, mut stream) = socket.split();

    // Single writer per connection: commands drain from the registry queue in
    // order.
    let writer_cancel = conn.cancelled().clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        let frame = protocol::encode(&command);
                        if sink.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                () = writer_cancel.cancelled() => break,
            }
        }
    });

    loop {
        tokio::select! {
            () = conn.cancelled().cancelled() => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match protocol::decode::<DaemonMessage>(&text) {
                        Ok(msg) => state.registry.handle_message(&user_id, msg),
                        Err(e) => {
                            // Unknown or future frames are logged and dropped,
                            // never acted on.
                            tracing::warn!(user_id = %user_id, error = %e, "Dropping undecodable daemon frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary/ping/pong handled by the transport
                Some(Err(e)) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Daemon socket error");
                    break;
                }
            }
        }
    }

    state.registry.unregister(&conn);
    writer.abort();
}
