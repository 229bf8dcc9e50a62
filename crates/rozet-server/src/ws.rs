use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::{debug, info};

use rozet_core::events::Envelope;
use rozet_core::ids::{AgentId, SessionId};
use rozet_core::ApiError;

use crate::hub::SubscriptionFilter;
use crate::server::AppState;

/// How long the client has to send its subscribe frame.
const SUBSCRIBE_DEADLINE: Duration = Duration::from_secs(10);

/// First frame on `/ws/control`.
#[derive(Deserialize)]
struct SubscribeFrame {
    #[serde(rename = "type")]
    frame_type: String,
    session_id: SessionId,
    #[serde(default)]
    agent_ids: Option<Vec<AgentId>>,
    #[serde(default)]
    event_types: Option<Vec<String>>,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let filter = match read_subscribe(&mut socket, &state).await {
        Ok(filter) => filter,
        Err(err) => {
            let envelope = Envelope::error(err.code(), &err.to_string());
            if let Ok(json) = serde_json::to_string(&envelope) {
                let _ = socket.send(Message::Text(json.into())).await;
            }
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 4000 + err.http_status(),
                    reason: err.code().into(),
                })))
                .await;
            return;
        }
    };

    let session_id = filter.session_id.clone();
    let (subscriber_id, mut rx) = state.hub.subscribe(filter);
    info!(subscriber = subscriber_id, session_id = %session_id, "control subscriber connected");

    loop {
        tokio::select! {
            envelope = rx.recv() => {
                let Some(envelope) = envelope else {
                    // Evicted by the hub (overflow) or hub gone.
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: 1011,
                            reason: "subscription dropped".into(),
                        })))
                        .await;
                    break;
                };
                let Ok(json) = serde_json::to_string(&envelope) else { continue };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // pings handled by the transport, rest ignored
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.hub.unsubscribe(subscriber_id);
    debug!(subscriber = subscriber_id, "control subscriber disconnected");
}

async fn read_subscribe(
    socket: &mut WebSocket,
    state: &AppState,
) -> Result<SubscriptionFilter, ApiError> {
    let first = tokio::time::timeout(SUBSCRIBE_DEADLINE, socket.recv())
        .await
        .map_err(|_| ApiError::Validation("subscribe frame not received in time".into()))?;

    let text = match first {
        Some(Ok(Message::Text(text))) => text,
        _ => return Err(ApiError::Validation("expected a text subscribe frame".into())),
    };

    let frame: SubscribeFrame = serde_json::from_str(&text)
        .map_err(|e| ApiError::Validation(format!("malformed subscribe frame: {e}")))?;
    if frame.frame_type != "subscribe" {
        return Err(ApiError::Validation(format!(
            "first frame must be subscribe, got {}",
            frame.frame_type
        )));
    }

    // The session must exist; archived sessions may still be watched.
    state.sessions.get(&frame.session_id)?;

    Ok(SubscriptionFilter {
        session_id: frame.session_id,
        agent_ids: frame.agent_ids,
        event_types: frame.event_types,
    })
}
