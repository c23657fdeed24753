use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tankfall_core::entity::{Combatant, Tank};
use tankfall_core::net::messages::{ConnectionInfoMsg, ServerMessage};
use tankfall_core::net::protocol::encode_server_message;
use tankfall_core::participant::{Participant, ParticipantId, PlayerColor};

use crate::config::ServerConfig;
use crate::coordinator::{CoordinatorCommand, CoordinatorHandle};
use crate::error::AdmissionError;
use crate::external_addr::format_side_channel_address;
use crate::side_channel::{ListenerState, SideChannelListener};
use crate::state::{ClientLink, ClientLinks, ClientSender};

/// Port the side channel of participant `id` listens on.
pub fn side_channel_port(base_port: u16, id: ParticipantId) -> Option<u16> {
    u16::try_from(id)
        .ok()
        .and_then(|id| base_port.checked_add(id))
}

/// A successfully admitted connection.
#[derive(Debug)]
pub struct Admission {
    pub participant_id: ParticipantId,
    pub side_channel_addr: SocketAddr,
    /// `host:port` sent to the client in `ConnectionInfo`.
    pub advertised_addr: String,
    pub side_channel_state: watch::Receiver<ListenerState>,
}

/// Admits connections into the match: allocates ids, binds side channels and
/// registers participants with the coordinator.
///
/// Callers hold it behind a mutex so id allocation and registration happen
/// one connection at a time.
pub struct ConnectionSupervisor {
    config: Arc<ServerConfig>,
    advertised_host: Arc<str>,
    coordinator: CoordinatorHandle,
    clients: ClientLinks,
    admitted: usize,
    side_channels: HashMap<ParticipantId, JoinHandle<()>>,
}

impl ConnectionSupervisor {
    pub fn new(
        config: Arc<ServerConfig>,
        advertised_host: Arc<str>,
        coordinator: CoordinatorHandle,
        clients: ClientLinks,
    ) -> Self {
        Self {
            config,
            advertised_host,
            coordinator,
            clients,
            admitted: 0,
            side_channels: HashMap::new(),
        }
    }

    pub fn admitted(&self) -> usize {
        self.admitted
    }

    /// Admit a new participant.
    ///
    /// `sender` is the client's outbound queue; `ConnectionInfo` is queued on
    /// it before any broadcast. The side channel lives until `parent_alive`
    /// is cancelled.
    pub async fn admit(
        &mut self,
        display_name: String,
        sender: ClientSender,
        parent_alive: CancellationToken,
    ) -> Result<Admission, AdmissionError> {
        let phase = self.coordinator.phase();
        let max = self.config.match_rules.max_participants;
        if !phase.accepts_admissions() || self.admitted >= max {
            return Err(AdmissionError::RegistrationOverflow {
                phase,
                admitted: self.admitted,
            });
        }

        let participant_id = self.admitted as ParticipantId + 1;
        let sc = &self.config.side_channel;
        let port = side_channel_port(sc.base_port, participant_id).ok_or_else(|| {
            AdmissionError::SideChannelUnavailable {
                port: sc.base_port,
                reason: format!("no port left for participant {participant_id}"),
            }
        })?;

        let listener = SideChannelListener::bind(
            participant_id,
            &sc.bind_host,
            port,
            sc.clone(),
            parent_alive.clone(),
        )
        .await
        .map_err(|e| AdmissionError::SideChannelUnavailable {
            port,
            reason: e.to_string(),
        })?;

        let advertised_addr = format_side_channel_address(&self.advertised_host, port);
        let info = ServerMessage::ConnectionInfo(ConnectionInfoMsg {
            address: advertised_addr.clone(),
        });
        match encode_server_message(&info) {
            Ok(data) => {
                if let Err(e) = sender.try_send(Bytes::from(data)) {
                    tracing::warn!(participant_id, error = %e, "Failed to queue ConnectionInfo");
                }
            },
            Err(e) => tracing::error!(participant_id, error = %e, "Failed to encode ConnectionInfo"),
        }

        // Subscribe the client to broadcasts before the spawn notification.
        self.lock_clients().insert(
            participant_id,
            ClientLink {
                sender,
                connection: parent_alive,
            },
        );

        let participant = Participant::new(
            participant_id,
            display_name,
            PlayerColor::for_participant(participant_id),
            port,
        );
        let entity = Tank::new(self.config.match_rules.spawn_point_for(participant_id));
        if let Err(e) = self.register(participant, Box::new(entity)).await {
            self.lock_clients().remove(&participant_id);
            return Err(e);
        }
        self.admitted += 1;

        let side_channel_addr = listener.local_addr();
        let side_channel_state = listener.state();
        self.side_channels.insert(participant_id, listener.spawn());

        tracing::info!(
            participant_id,
            side_channel = %advertised_addr,
            "Participant admitted"
        );
        Ok(Admission {
            participant_id,
            side_channel_addr,
            advertised_addr,
            side_channel_state,
        })
    }

    async fn register(
        &self,
        participant: Participant,
        entity: Box<dyn Combatant>,
    ) -> Result<(), AdmissionError> {
        let (respond_to, reply) = oneshot::channel();
        self.coordinator
            .commands
            .send(CoordinatorCommand::Register {
                participant,
                entity,
                respond_to,
            })
            .await
            .map_err(|_| AdmissionError::CoordinatorUnavailable)?;
        reply
            .await
            .map_err(|_| AdmissionError::CoordinatorUnavailable)?
    }

    /// Stop fanning broadcasts out to a closed connection.
    pub fn release(&mut self, participant_id: ParticipantId) {
        self.lock_clients().remove(&participant_id);
    }

    /// Wait for every side channel to wind down after the match token fired.
    pub async fn join_side_channels(&mut self, grace: Duration) {
        for (participant_id, task) in self.side_channels.drain() {
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    tracing::warn!(participant_id, error = %e, "Side channel task failed");
                },
                Err(_) => {
                    tracing::warn!(participant_id, "Side channel did not stop in time");
                },
            }
        }
    }

    fn lock_clients(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ParticipantId, ClientLink>> {
        self.clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
