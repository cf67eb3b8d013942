use axum::{
    Json,
    extract::{
        State,
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use metrics::{counter, gauge};
use serde_json::{Value, json};

use crate::types::{AppState, Command, Outcome};

pub async fn command_endpoint(
    State(state): State<AppState>,
    Json(command): Json<Command>,
) -> Json<Outcome> {
    Json(state.dispatcher.dispatch(command).await.into())
}

pub async fn status_endpoint(State(state): State<AppState>) -> Json<Value> {
    let dispatcher = state.dispatcher.state();
    match state.dispatcher.status_report(false) {
        Ok(report) => Json(json!({ "dispatcher": dispatcher, "status": report })),
        Err(e) => Json(json!({ "dispatcher": dispatcher, "error": e.to_string() })),
    }
}

pub async fn command_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|ws| handle_socket(ws, state))
}

/// One command per text message, answered before the next is read.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    gauge!("websocket_connections_active").increment(1.0);

    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        counter!("websocket_messages_received_total").increment(1);

        let outcome = match serde_json::from_str::<Command>(text.as_str()) {
            Ok(command) => serde_json::to_string(&Outcome::from(
                state.dispatcher.dispatch(command).await,
            )),
            Err(e) => {
                tracing::error!("undecodable command: {}", e);
                serde_json::to_string(&Outcome::Error {
                    kind: "invalid_command".to_string(),
                    message: e.to_string(),
                })
            }
        };

        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("failed to encode outcome: {}", e);
                break;
            }
        };

        if socket.send(Message::Text(Utf8Bytes::from(reply))).await.is_err() {
            break;
        }
        counter!("websocket_messages_sent_total").increment(1);
    }

    gauge!("websocket_connections_active").decrement(1.0);
}
