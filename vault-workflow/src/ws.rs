//! WebSocket endpoint streaming change-feed events.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::AuthState;
use crate::feed::{Broadcaster, Subscription};
use crate::routes::DashboardState;

/// Close code sent when the connect-time token is missing or invalid.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

const PONG: &str = r#"{"type":"pong"}"#;

#[derive(Debug, Default, Deserialize)]
pub struct FeedParams {
    pub token: Option<String>,
}

pub async fn feed_handler(
    ws: WebSocketUpgrade,
    State(state): State<DashboardState>,
    Query(params): Query<FeedParams>,
) -> Response {
    let authorized = is_authorized(state.auth.as_ref(), params.token.as_deref());
    let broadcaster = Arc::clone(&state.broadcaster);
    ws.on_upgrade(move |socket| async move {
        if authorized {
            serve(socket, broadcaster).await;
        } else {
            refuse(socket).await;
        }
    })
}

fn is_authorized(auth: Option<&AuthState>, token: Option<&str>) -> bool {
    match auth {
        None => true,
        Some(auth) => token.is_some_and(|t| auth.validate_token(t).is_ok()),
    }
}

/// `ping` as plain text or as `{"type":"ping"}`.
fn is_ping(text: &str) -> bool {
    let text = text.trim();
    if text.eq_ignore_ascii_case("ping") {
        return true;
    }
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "ping"))
        .unwrap_or(false)
}

async fn refuse(mut socket: WebSocket) {
    tracing::debug!("Refusing feed subscriber with invalid token");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_UNAUTHORIZED,
            reason: "unauthorized".into(),
        })))
        .await;
}

async fn serve(socket: WebSocket, broadcaster: Arc<Broadcaster>) {
    let Subscription { id, mut receiver } = broadcaster.subscribe();
    let (mut sender, mut incoming) = socket.split();
    tracing::info!(subscriber = id, "Feed subscriber connected");

    loop {
        tokio::select! {
            event = receiver.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "Cannot encode feed event");
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            message = incoming.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if is_ping(&text) && sender.send(Message::Text(PONG.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    broadcaster.unsubscribe(id);
    tracing::info!(subscriber = id, "Feed subscriber disconnected");
}
