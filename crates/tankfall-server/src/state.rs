use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tankfall_core::participant::ParticipantId;

use crate::config::ServerConfig;
use crate::coordinator::{CoordinatorHandle, MatchOutcome, SessionCoordinator, spawn_coordinator};
use crate::supervisor::ConnectionSupervisor;

/// Outbound queue for one client's WebSocket writer.
pub type ClientSender = mpsc::Sender<Bytes>;

/// An admitted client as the broadcast forwarder sees it.
pub struct ClientLink {
    pub sender: ClientSender,
    /// Cancelling this closes the client's connection and its side channel.
    pub connection: CancellationToken,
}

impl ClientLink {
    /// Stop serving this client. Its reader notices the cancelled token and
    /// reports the disconnect.
    pub fn sever(self) {
        self.connection.cancel();
    }
}

/// Clients the broadcast forwarder fans out to, keyed by participant.
pub type ClientLinks = Arc<Mutex<HashMap<ParticipantId, ClientLink>>>;

pub type SharedSupervisor = Arc<tokio::sync::Mutex<ConnectionSupervisor>>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub coordinator: CoordinatorHandle,
    pub supervisor: SharedSupervisor,
    pub clients: ClientLinks,
    /// Host part of every `ConnectionInfo`, resolved once at startup.
    pub advertised_host: Arc<str>,
    /// Cancelled when this match is over; every connection token is a child.
    pub shutdown: CancellationToken,
    pub ws_connection_count: Arc<AtomicUsize>,
}

impl AppState {
    /// Build state for a fresh match and spawn its coordinator.
    pub fn new(
        config: ServerConfig,
        advertised_host: Arc<str>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<Option<MatchOutcome>>) {
        let config = Arc::new(config);
        let coordinator = SessionCoordinator::new(
            config.match_rules.session_config(),
            config.limits.broadcast_capacity,
        );
        tracing::info!(match_id = %coordinator.match_id(), "New match");
        let (handle, task) = spawn_coordinator(
            coordinator,
            config.match_rules.tick_interval(),
            config.limits.command_buffer,
        );

        let clients: ClientLinks = Arc::new(Mutex::new(HashMap::new()));
        let supervisor = ConnectionSupervisor::new(
            Arc::clone(&config),
            Arc::clone(&advertised_host),
            handle.clone(),
            Arc::clone(&clients),
        );

        let state = Self {
            config,
            coordinator: handle,
            supervisor: Arc::new(tokio::sync::Mutex::new(supervisor)),
            clients,
            advertised_host,
            shutdown,
            ws_connection_count: Arc::new(AtomicUsize::new(0)),
        };
        (state, task)
    }
}

/// RAII guard that decrements a connection counter on drop.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
