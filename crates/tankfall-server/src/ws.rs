use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tankfall_core::net::messages::{ClientMessage, JoinMsg, JoinResponseMsg, ServerMessage};
use tankfall_core::net::protocol::{
    MAX_MESSAGE_SIZE, PROTOCOL_VERSION, decode_client_message, decode_message_type,
    encode_server_message,
};
use tankfall_core::participant::ParticipantId;

use crate::coordinator::CoordinatorCommand;
use crate::error::AdmissionError;
use crate::state::{AppState, ConnectionGuard};
use crate::supervisor::Admission;

const MAX_NAME_LEN: usize = 32;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let _guard = ConnectionGuard::new(Arc::clone(&state.ws_connection_count));
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // The first message must be a Join.
    let first_msg = match ws_receiver.next().await {
        Some(Ok(Message::Binary(data))) => data,
        _ => return,
    };
    let Ok(ClientMessage::Join(join)) = decode_client_message(&first_msg) else {
        tracing::debug!("First message was not a Join, closing");
        return;
    };

    // Lives as long as this connection; the participant's side channel
    // hangs off it.
    let connection = state.shutdown.child_token();
    let (tx, rx) = mpsc::channel::<Bytes>(state.config.limits.player_message_buffer);

    let admission = match attempt_join(&join, &state, tx, connection.clone()).await {
        Ok(a) => a,
        Err(e) => {
            tracing::info!(name = %join.display_name, error = %e, "Join rejected");
            send_join_response(&mut ws_sender, None, Some(e.to_string())).await;
            return;
        },
    };
    let participant_id = admission.participant_id;

    if !send_join_response(&mut ws_sender, Some(participant_id), None).await {
        disconnect(&state, participant_id, &connection).await;
        return;
    }

    spawn_writer(ws_sender, rx);

    read_loop(&mut ws_receiver, &state, participant_id, &connection).await;

    disconnect(&state, participant_id, &connection).await;
    tracing::info!(participant_id, "Participant connection closed");
}

async fn attempt_join(
    join: &JoinMsg,
    state: &AppState,
    tx: mpsc::Sender<Bytes>,
    connection: CancellationToken,
) -> Result<Admission, AdmissionError> {
    if join.protocol_version != PROTOCOL_VERSION {
        return Err(AdmissionError::ProtocolMismatch {
            client: join.protocol_version,
            server: PROTOCOL_VERSION,
        });
    }

    let name = join.display_name.trim().to_string();
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.chars().any(|c| c.is_control()) {
        return Err(AdmissionError::InvalidName);
    }

    let mut supervisor = state.supervisor.lock().await;
    supervisor.admit(name, tx, connection).await
}

/// Tear down everything hanging off a closed connection.
async fn disconnect(state: &AppState, participant_id: ParticipantId, connection: &CancellationToken) {
    connection.cancel();
    state.supervisor.lock().await.release(participant_id);
    if state
        .coordinator
        .commands
        .send(CoordinatorCommand::Disconnected { participant_id })
        .await
        .is_err()
    {
        tracing::debug!(participant_id, "Coordinator already stopped");
    }
}

async fn send_join_response(
    ws_sender: &mut SplitSink<WebSocket, Message>,
    participant_id: Option<ParticipantId>,
    error: Option<String>,
) -> bool {
    let msg = ServerMessage::JoinResponse(JoinResponseMsg {
        success: participant_id.is_some(),
        participant_id,
        error,
    });
    let data = match encode_server_message(&msg) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode JoinResponse");
            return false;
        },
    };
    match ws_sender.send(Message::Binary(data.into())).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to send JoinResponse");
            false
        },
    }
}

fn spawn_writer(mut ws_sender: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Bytes>) {
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if ws_sender.send(Message::Binary(data)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });
}

/// Per-connection rate limiter (token bucket).
struct RateLimiter {
    tokens: f64,
    last_refill: tokio::time::Instant,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

impl RateLimiter {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: tokio::time::Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    fn allow(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

async fn read_loop(
    ws_receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
    participant_id: ParticipantId,
    connection: &CancellationToken,
) {
    let rate = state.config.limits.input_rate_limit_per_sec;
    let mut rate_limiter = RateLimiter::new(rate, rate);

    loop {
        let msg = tokio::select! {
            _ = connection.cancelled() => break,
            msg = ws_receiver.next() => msg,
        };
        let data = match msg {
            Some(Ok(Message::Binary(d))) => d,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        };

        if data.is_empty() || data.len() > MAX_MESSAGE_SIZE {
            continue;
        }

        let msg_type = match decode_message_type(&data) {
            Ok(t) => t,
            Err(_) => continue,
        };
        if msg_type.is_server_only() {
            tracing::warn!(participant_id, ?msg_type, "Rejected server-only message from client");
            continue;
        }

        if !rate_limiter.allow() {
            tracing::warn!(participant_id, "Rate limited");
            continue;
        }

        let cmd = match decode_client_message(&data) {
            Ok(ClientMessage::Move(m)) => CoordinatorCommand::Move {
                participant_id,
                value: m.value,
            },
            Ok(ClientMessage::Turn(m)) => CoordinatorCommand::Turn {
                participant_id,
                value: m.value,
            },
            Ok(ClientMessage::Fire(m)) => CoordinatorCommand::Fire {
                participant_id,
                charge: m.charge,
            },
            Ok(ClientMessage::Leave(_)) => break,
            Ok(ClientMessage::Join(_)) => {
                tracing::debug!(participant_id, "Ignoring repeated Join");
                continue;
            },
            Err(e) => {
                tracing::debug!(participant_id, error = %e, "Undecodable client message");
                continue;
            },
        };

        if state.coordinator.commands.send(cmd).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_refills() {
        let mut limiter = RateLimiter::new(2.0, 10.0);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
        tokio::time::advance(std::time::Duration::from_millis(100)).await;
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }
}
