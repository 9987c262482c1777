//! Event-channel websocket handling.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::ORIGIN;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use relay_core::current_unix_timestamp_ms;
use relay_events::{
    client_frame_error_code, connection_info_frame, error_frame, parse_ws_client_frame,
    pong_frame, subscribed_frame, unsubscribed_frame, WsClientFrame,
};

use crate::{ApiError, AppState};

pub(crate) async fn handle_ws_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    websocket: WebSocketUpgrade,
) -> Response {
    if let Some(allowed) = state.allowed_ws_origin.as_deref() {
        let origin = headers.get(ORIGIN).and_then(|value| value.to_str().ok());
        if origin != Some(allowed) {
            return ApiError::forbidden("event channel origin not allowed").into_response();
        }
    }
    websocket
        .on_upgrade(move |socket| run_ws_connection(state, socket))
        .into_response()
}

async fn run_ws_connection(state: Arc<AppState>, mut socket: WebSocket) {
    let (subscriber_id, mut outgoing_rx) = state.hub.register();
    tracing::debug!(subscriber_id = subscriber_id, "event channel client connected");

    let info = connection_info_frame(
        subscriber_id,
        state.hub.connected_count(),
        current_unix_timestamp_ms(),
    );
    if socket
        .send(WsMessage::Text(info.to_string().into()))
        .await
        .is_err()
    {
        state.hub.disconnect(subscriber_id);
        return;
    }

    loop {
        tokio::select! {
            outgoing = outgoing_rx.recv() => {
                let Some(frame) = outgoing else {
                    break;
                };
                if socket.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        let reply = match parse_ws_client_frame(text.as_str()) {
                            Ok(WsClientFrame::Subscribe { room }) => {
                                state.hub.subscribe(subscriber_id, &room);
                                subscribed_frame(&room)
                            }
                            Ok(WsClientFrame::Unsubscribe { room }) => {
                                state.hub.unsubscribe(subscriber_id, &room);
                                unsubscribed_frame(&room)
                            }
                            Ok(WsClientFrame::Ping) => pong_frame(current_unix_timestamp_ms()),
                            Err(error) => {
                                error_frame(client_frame_error_code(&error), &error.to_string())
                            }
                        };
                        if socket
                            .send(WsMessage::Text(reply.to_string().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.disconnect(subscriber_id);
    tracing::debug!(subscriber_id = subscriber_id, "event channel client disconnected");
}
