// WebSocket event stream (spec §6). One connection, one bus subscription at
// a time — a `subscribe` message swaps the filter by re-subscribing.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use super::AppState;

pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run(socket, state))
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { request_id: u64 },
}

async fn run(mut socket: WebSocket, state: AppState) {
    if socket.send(Message::Text(json!({"type": "connected"}).to_string())).await.is_err() {
        return;
    }

    let mut events = state.orchestrator.bus.subscribe(None).await;
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ClientMessage::Subscribe { request_id }) = serde_json::from_str(&text) {
                            events = state.orchestrator.bus.subscribe(Some(request_id)).await;
                            let ack = json!({"type": "subscribed", "request_id": request_id});
                            if socket.send(Message::Text(ack.to_string())).await.is_err() {
                                break;
                            }
                        }
                        // Malformed client messages are silently ignored.
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                let frame = json!({
                    "type": "pipeline_event",
                    "request_id": event.request_id,
                    "stage": event.stage,
                    "status": event.status,
                    "timestamp": event.timestamp_ms,
                    "message": event.message,
                    "data": event.payload,
                });
                if socket.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
        }
    }
}
