//! The `/ws` session loop.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::websocket::{ClientMessage, ServerMessage};
use crate::AppState;

use super::syncs;

/// Serve one socket until the client goes away.
///
/// Replies and broadcast progress share the subscriber's queue, so frames
/// reach the client in the order they were queued.
pub async fn handle_websocket_connection(socket: WebSocket, state: AppState) {
    let (sink, mut stream) = socket.split();
    let (id, outgoing) = state.hub.subscribe();
    let writer = tokio::spawn(drain(outgoing, sink));

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                state
                    .hub
                    .reply(&id, ServerMessage::error("binary frames are not accepted", None));
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(subscriber = %id, "socket read failed: {}", e);
                break;
            }
        };
        let reply = process_message(text.as_str(), &state);
        state.hub.reply(&id, reply);
    }

    state.hub.unsubscribe(&id);
    writer.abort();
    tracing::debug!(subscriber = %id, remaining = state.hub.subscriber_count(), "socket closed");
}

async fn drain(mut outgoing: UnboundedReceiver<ServerMessage>, mut sink: SplitSink<WebSocket, Message>) {
    while let Some(message) = outgoing.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("cannot encode frame: {}", e);
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}

/// Answer one client frame.
pub(crate) fn process_message(text: &str, state: &AppState) -> ServerMessage {
    let request: ClientMessage = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => return ServerMessage::error(format!("malformed frame: {}", e), None),
    };
    let request_id = request.request_id().map(String::from);

    let result = match request {
        ClientMessage::Ping => return ServerMessage::Pong,
        ClientMessage::RunSync { sync_id, .. } => syncs::start_sync(state, sync_id),
        ClientMessage::StopSync { sync_id, .. } => syncs::stop_sync(state, sync_id),
        ClientMessage::GetSync { sync_id, .. } => syncs::get_sync(state, sync_id),
    };

    match result {
        Ok(sync) => ServerMessage::SyncState {
            state: sync,
            request_id,
        },
        Err(e) => ServerMessage::error(e.to_string(), request_id),
    }
}
