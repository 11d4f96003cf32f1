use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::AppState;

#[derive(Debug, Deserialize)]
struct WsCommand {
    action: String,
    topic: String,
}

pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session(socket, state))
}

/// One push session: register with the hub, relay hub messages out, accept
/// subscribe/unsubscribe commands in. The hub side closes by dropping the
/// sender, the client side by a close frame or an error.
async fn session(socket: WebSocket, state: AppState) {
    let (session_id, mut rx) = state.hub.register();
    let (mut sink, mut stream): (SplitSink<WebSocket, Message>, SplitStream<WebSocket>) =
        socket.split();

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // Hub closed the session (sweep or shutdown).
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    state.hub.touch(&session_id);
                    let reply = handle_command(&state, &session_id, text.as_str());
                    if sink.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    state.hub.touch(&session_id);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Binary(_))) => {
                    let reply = json!({ "event": "error", "error": "text frames only" });
                    if sink.send(Message::Text(reply.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!("push session {session_id} socket error: {e}");
                    break;
                }
            },
        }
    }

    state.hub.close_session(&session_id);
}

fn handle_command(state: &AppState, session_id: &uuid::Uuid, raw: &str) -> String {
    let command: WsCommand = match serde_json::from_str(raw) {
        Ok(c) => c,
        Err(e) => {
            return json!({ "event": "error", "error": format!("bad frame: {e}") }).to_string();
        }
    };

    let result = match command.action.as_str() {
        "subscribe" => state
            .hub
            .subscribe(session_id, &command.topic)
            .map(|_| "subscribed"),
        "unsubscribe" => state
            .hub
            .unsubscribe(session_id, &command.topic)
            .map(|_| "unsubscribed"),
        other => {
            return json!({ "event": "error", "error": format!("unknown action {other:?}") })
                .to_string();
        }
    };

    match result {
        Ok(event) => json!({ "event": event, "topic": command.topic }).to_string(),
        Err(e) => json!({ "event": "error", "error": e.to_string() }).to_string(),
    }
}
