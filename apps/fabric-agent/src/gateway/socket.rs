use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use percent_encoding::percent_decode_str;
use tracing::{debug, info, warn};

use super::frame::{self, ClientFrame, OPCODE_PING, OPCODE_PONG};
use crate::state::AppState;

/// Index of the element identity in `/v2/message/socket/id/{element_id}`.
const ELEMENT_ID_SEGMENT: usize = 4;

/// Extracts the element identity from a socket request path.
pub fn element_id_from_path(path: &str) -> Option<String> {
    let path = path.split('?').next().unwrap_or_default();
    let raw = path
        .trim_start_matches('/')
        .split('/')
        .nth(ELEMENT_ID_SEGMENT)?
        .trim();
    let decoded = percent_decode_str(raw).decode_utf8().ok()?;
    let element_id = decoded.trim();
    if element_id.is_empty() {
        return None;
    }
    Some(element_id.to_string())
}

pub async fn socket_handler(
    State(state): State<AppState>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    match element_id_from_path(uri.path()) {
        Some(element_id) => ws
            .on_upgrade(move |socket| handle_connection(socket, state, element_id))
            .into_response(),
        None => {
            warn!(path = %uri.path(), "missing element id in real-time socket path");
            (StatusCode::BAD_REQUEST, "missing element id").into_response()
        }
    }
}

async fn handle_connection(socket: WebSocket, state: AppState, element_id: String) {
    let registration = state.gateway().register(&element_id);
    let connection_id = registration.connection_id;
    let outbound = registration.sender;
    let mut rx = registration.receiver;

    state.bus().enable_realtime_receiving(&element_id);
    info!(element_id = %element_id, connection_id, "real-time connection established");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let writer_element = element_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, WsMessage::Close(_));
            if ws_tx.send(message).await.is_err() || closing {
                break;
            }
        }
        debug!(element_id = %writer_element, connection_id, "writer task finished");
    });

    while let Some(next) = ws_rx.next().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(err) => {
                warn!(element_id = %element_id, connection_id, error = %err, "error receiving frame");
                break;
            }
        };
        match frame {
            WsMessage::Binary(data) => {
                handle_binary(&state, &element_id, connection_id, &outbound, &data).await;
            }
            WsMessage::Ping(data) => {
                if data[..] == [OPCODE_PING] {
                    let _ = outbound.send(WsMessage::Pong(vec![OPCODE_PONG])).await;
                } else {
                    debug!(element_id = %element_id, "ping without opcode");
                }
            }
            WsMessage::Close(frame) => {
                info!(
                    element_id = %element_id,
                    connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed real-time socket"
                );
                break;
            }
            WsMessage::Text(_) | WsMessage::Pong(_) => continue,
        }
    }

    if state.gateway().unregister(&element_id, connection_id) {
        state.bus().disable_realtime_receiving(&element_id);
    }
    writer.abort();
    info!(element_id = %element_id, connection_id, "real-time connection closed");
}

async fn handle_binary(
    state: &AppState,
    element_id: &str,
    connection_id: u64,
    outbound: &tokio::sync::mpsc::Sender<WsMessage>,
    data: &[u8],
) {
    match frame::decode_client_frame(data) {
        Ok(ClientFrame::Ping) => {
            let _ = outbound.send(WsMessage::Binary(frame::pong().to_vec())).await;
        }
        Ok(ClientFrame::Message(mut message)) => {
            message.publisher = element_id.to_string();
            let published = match state.bus().publish(message) {
                Ok(published) => published,
                Err(err) => {
                    warn!(element_id = %element_id, error = %err, "unable to publish real-time message");
                    return;
                }
            };
            match frame::encode_receipt(&published.id, published.timestamp) {
                Ok(receipt) => {
                    let _ = outbound.send(WsMessage::Binary(receipt.to_vec())).await;
                }
                Err(err) => warn!(element_id = %element_id, error = %err, "unable to encode receipt"),
            }
        }
        Ok(ClientFrame::Ack(message_id)) => {
            if !state
                .gateway()
                .acknowledge(element_id, connection_id, message_id.as_deref())
            {
                debug!(element_id = %element_id, ?message_id, "ack without matching push");
            }
        }
        Err(err) => {
            warn!(element_id = %element_id, error = %err, "dropping malformed frame");
        }
    }
}
