pub mod config;
pub mod coordinator;
pub mod error;
pub mod external_addr;
pub mod health;
pub mod side_channel;
pub mod state;
pub mod supervisor;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tankfall_core::net::protocol::encode_server_message;

use config::ServerConfig;
use coordinator::{CoordinatorCommand, MatchEvent, MatchOutcome};
use state::{AppState, ClientLinks};

/// How long side channels get to close once a match is over.
const SIDE_CHANNEL_GRACE: Duration = Duration::from_secs(5);

/// Build the Axum router and application state for one match.
///
/// Spawns the match coordinator; the returned handle resolves to the match
/// outcome once the coordinator stops.
pub fn build_app(
    config: ServerConfig,
    advertised_host: Arc<str>,
    shutdown: CancellationToken,
) -> (Router<()>, AppState, JoinHandle<Option<MatchOutcome>>) {
    let (state, coordinator_task) = AppState::new(config, advertised_host, shutdown);

    let app = Router::new()
        .route("/ws", axum::routing::get(ws::ws_handler))
        .route("/health", axum::routing::get(health::health_check))
        .with_state(state.clone());

    (app, state, coordinator_task)
}

/// Background task that fans coordinator events out to every connected client.
///
/// Resolves with the outcome once `MatchEnded` has gone by, after everything
/// emitted before it was queued to the clients.
pub fn spawn_broadcast_forwarder(state: AppState) -> JoinHandle<Option<MatchOutcome>> {
    // Subscribe before spawning so nothing emitted from here on is missed.
    let mut rx = state.coordinator.subscribe();

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = state.shutdown.cancelled() => return None,
                ev = rx.recv() => ev,
            };
            match event {
                Ok(MatchEvent::MatchEnded(outcome)) => return Some(outcome),
                Ok(event) => {
                    let Some(msg) = event.to_server_message() else {
                        continue;
                    };
                    match encode_server_message(&msg) {
                        Ok(data) => fan_out(&state.clients, Bytes::from(data)),
                        Err(e) => tracing::error!(error = %e, ?msg, "Failed to encode broadcast"),
                    }
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    // Every client missed these events; none may see the gap.
                    tracing::warn!("Broadcast forwarder lagged by {n} events, dropping all clients");
                    sever_all(&state.clients);
                },
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    tracing::info!("Match event channel closed, stopping forwarder");
                    return None;
                },
            }
        }
    })
}

/// Queue `data` for every client. A client whose queue is full or closed is
/// dropped rather than left with a hole in its stream.
fn fan_out(clients: &ClientLinks, data: Bytes) {
    let mut clients = clients
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let mut dropped = Vec::new();
    for (&participant_id, link) in clients.iter() {
        match link.sender.try_send(data.clone()) {
            Ok(()) => {},
            Err(TrySendError::Full(_)) => {
                tracing::warn!(participant_id, "Client queue full, dropping connection");
                dropped.push(participant_id);
            },
            Err(TrySendError::Closed(_)) => dropped.push(participant_id),
        }
    }
    for participant_id in dropped {
        if let Some(link) = clients.remove(&participant_id) {
            link.sever();
        }
    }
}

fn sever_all(clients: &ClientLinks) {
    let mut clients = clients
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    for (_, link) in clients.drain() {
        link.sever();
    }
}

/// Host one match on `listener` until it ends or `shutdown` fires.
///
/// Returns the outcome, or `None` if the match was interrupted before a
/// result.
pub async fn run_match(
    listener: TcpListener,
    config: ServerConfig,
    advertised_host: Arc<str>,
    shutdown: CancellationToken,
) -> std::io::Result<Option<MatchOutcome>> {
    let match_token = shutdown.child_token();
    let (app, state, coordinator_task) = build_app(config, advertised_host, match_token.clone());
    let forwarder = spawn_broadcast_forwarder(state.clone());

    let end_token = match_token.clone();
    tokio::spawn(async move {
        if let Ok(Some(outcome)) = forwarder.await {
            tracing::info!(
                match_id = %outcome.match_id,
                winner = ?outcome.winner,
                forfeited = outcome.forfeited,
                "Match ended"
            );
        }
        end_token.cancel();
    });

    let serve_token = match_token.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_token.cancelled().await })
        .await;

    // Covers a server error as well as a normal end.
    match_token.cancel();
    if state
        .coordinator
        .commands
        .send(CoordinatorCommand::Stop)
        .await
        .is_err()
    {
        tracing::debug!("Coordinator already stopped");
    }
    state
        .supervisor
        .lock()
        .await
        .join_side_channels(SIDE_CHANNEL_GRACE)
        .await;

    let outcome = match coordinator_task.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "Coordinator task failed");
            None
        },
    };
    served?;
    Ok(outcome)
}
