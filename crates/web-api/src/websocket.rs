use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;

use crate::state::AppState;

/// `GET /api/ws`: streams engine events as `{type, data}` frames.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| websocket_connection(socket, state))
}

async fn websocket_connection(mut socket: WebSocket, state: AppState) {
    let mut events = state.bus.subscribe();
    tracing::info!("websocket client connected");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    // Disconnected by backpressure; close the socket.
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                let Ok(frame) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    tracing::info!("websocket client disconnected");
}
