use std::fmt::Write as _;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use tankfall_core::entity::Combatant;
use tankfall_core::net::messages::{
    EntitySpawnedMsg, GameOverMsg, ParticipantUpdateMsg, RoundEndingMsg, RoundPlayingMsg,
    RoundStartingMsg, ServerMessage, ShellFiredMsg, StandingEntry,
};
use tankfall_core::participant::{Participant, ParticipantId, PlayerColor};
use tankfall_core::session::{MatchPhase, Session, SessionConfig};

use crate::error::AdmissionError;

/// Commands sent to the coordinator task by connection handlers and
/// collaborators.
pub enum CoordinatorCommand {
    Register {
        participant: Participant,
        entity: Box<dyn Combatant>,
        respond_to: oneshot::Sender<Result<(), AdmissionError>>,
    },
    Disconnected {
        participant_id: ParticipantId,
    },
    Move {
        participant_id: ParticipantId,
        value: f32,
    },
    Turn {
        participant_id: ParticipantId,
        value: f32,
    },
    Fire {
        participant_id: ParticipantId,
        charge: f32,
    },
    ApplyDamage {
        target: ParticipantId,
        amount: f32,
    },
    Stop,
}

/// Everything the coordinator announces, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchEvent {
    EntitySpawned {
        participant_id: ParticipantId,
        color: PlayerColor,
        camera_targets: Vec<ParticipantId>,
    },
    RoundStarting {
        round: u32,
    },
    RoundPlaying,
    RoundEnding {
        round_winner: Option<ParticipantId>,
        message: String,
    },
    ShellFired {
        participant_id: ParticipantId,
        launch_force: f32,
    },
    /// A replicated field (wins, rank, active) changed.
    ParticipantChanged(Participant),
    GameOver {
        winner: Option<ParticipantId>,
        standings: Vec<StandingEntry>,
        message: String,
    },
    /// The run is over; the host may tear down and start a new match.
    MatchEnded(MatchOutcome),
}

impl MatchEvent {
    /// Wire form for clients. `MatchEnded` is host-internal.
    pub fn to_server_message(&self) -> Option<ServerMessage> {
        let msg = match self {
            Self::EntitySpawned {
                participant_id,
                color,
                camera_targets,
            } => ServerMessage::EntitySpawned(EntitySpawnedMsg {
                participant_id: *participant_id,
                color: *color,
                camera_targets: camera_targets.clone(),
            }),
            Self::RoundStarting { round } => {
                ServerMessage::RoundStarting(RoundStartingMsg { round: *round })
            },
            Self::RoundPlaying => ServerMessage::RoundPlaying(RoundPlayingMsg {}),
            Self::RoundEnding {
                round_winner,
                message,
            } => ServerMessage::RoundEnding(RoundEndingMsg {
                round_winner: *round_winner,
                message: message.clone(),
            }),
            Self::ShellFired {
                participant_id,
                launch_force,
            } => ServerMessage::ShellFired(ShellFiredMsg {
                participant_id: *participant_id,
                launch_force: *launch_force,
            }),
            Self::ParticipantChanged(p) => {
                ServerMessage::ParticipantUpdate(ParticipantUpdateMsg {
                    participant_id: p.id,
                    wins: p.wins,
                    rank: p.rank,
                    active: p.active,
                })
            },
            Self::GameOver {
                winner,
                standings,
                message,
            } => ServerMessage::GameOver(GameOverMsg {
                winner: *winner,
                standings: standings.clone(),
                message: message.clone(),
            }),
            Self::MatchEnded(_) => return None,
        };
        Some(msg)
    }
}

/// Result of one match run.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub match_id: Uuid,
    pub winner: Option<ParticipantId>,
    pub rounds_played: u32,
    pub standings: Vec<StandingEntry>,
    /// Every participant disconnected before a winner emerged.
    pub forfeited: bool,
}

/// Snapshot published after every tick and roster change.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchStatus {
    pub match_id: Uuid,
    pub phase: MatchPhase,
    pub round: u32,
    pub participants: usize,
    pub connected: usize,
}

struct RosterEntry {
    participant: Participant,
    entity: Box<dyn Combatant>,
}

/// Owns the match session and the roster. Only the coordinator task touches
/// either; everyone else talks to it through [`CoordinatorCommand`]s.
pub struct SessionCoordinator {
    match_id: Uuid,
    session: Session,
    roster: Vec<RosterEntry>,
    events: broadcast::Sender<MatchEvent>,
    status: watch::Sender<MatchStatus>,
    outcome: Option<MatchOutcome>,
}

impl SessionCoordinator {
    pub fn new(config: SessionConfig, event_capacity: usize) -> Self {
        let match_id = Uuid::new_v4();
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let (status, _) = watch::channel(MatchStatus {
            match_id,
            phase: MatchPhase::Inactive,
            round: 0,
            participants: 0,
            connected: 0,
        });
        Self {
            match_id,
            session: Session::new(config),
            roster: Vec::new(),
            events,
            status,
            outcome: None,
        }
    }

    pub fn match_id(&self) -> Uuid {
        self.match_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn phase(&self) -> MatchPhase {
        self.session.phase
    }

    /// Roster in admission order.
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.roster.iter().map(|e| &e.participant)
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants().find(|p| p.id == id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MatchEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<MatchStatus> {
        self.status.subscribe()
    }

    pub fn outcome(&self) -> Option<&MatchOutcome> {
        self.outcome.as_ref()
    }

    /// Open the lobby.
    pub fn start(&mut self) {
        if self.session.phase != MatchPhase::Inactive {
            tracing::warn!(phase = %self.session.phase, "Match already started");
            return;
        }
        self.session.round_number = 0;
        self.enter(MatchPhase::StartUp);
        self.publish_status();
    }

    /// Add a participant and its entity to the roster.
    pub fn register(
        &mut self,
        participant: Participant,
        entity: Box<dyn Combatant>,
    ) -> Result<(), AdmissionError> {
        let phase = self.session.phase;
        if !phase.accepts_admissions() || self.roster.len() >= self.session.config.max_participants
        {
            return Err(AdmissionError::RegistrationOverflow {
                phase,
                admitted: self.roster.len(),
            });
        }
        debug_assert!(
            self.participant(participant.id).is_none(),
            "participant ids are unique"
        );

        let participant_id = participant.id;
        let color = participant.color;
        tracing::info!(
            participant_id,
            name = %participant.display_name,
            port = participant.side_channel_port,
            "Participant registered"
        );
        self.roster.push(RosterEntry {
            participant,
            entity,
        });

        let camera_targets = self.participants().map(|p| p.id).collect();
        self.emit(MatchEvent::EntitySpawned {
            participant_id,
            color,
            camera_targets,
        });
        self.publish_status();
        Ok(())
    }

    /// The participant's connection closed. It stays in the roster, inactive.
    pub fn disconnect(&mut self, participant_id: ParticipantId) {
        let Some(entry) = self.entry_mut(participant_id) else {
            return;
        };
        if !entry.participant.connected {
            return;
        }
        entry.participant.connected = false;
        entry.participant.active = false;
        entry.entity.disable_control();
        let changed = entry.participant.clone();
        tracing::info!(participant_id, "Participant disconnected");
        self.emit(MatchEvent::ParticipantChanged(changed));
        self.publish_status();
    }

    pub fn move_input(&mut self, participant_id: ParticipantId, value: f32) {
        if let Some(entry) = self.entry_mut(participant_id)
            && entry.participant.connected
        {
            entry.entity.move_input(value);
        }
    }

    pub fn turn_input(&mut self, participant_id: ParticipantId, value: f32) {
        if let Some(entry) = self.entry_mut(participant_id)
            && entry.participant.connected
        {
            entry.entity.turn_input(value);
        }
    }

    pub fn fire(&mut self, participant_id: ParticipantId, charge: f32) {
        let shot = match self.entry_mut(participant_id) {
            Some(entry) if entry.participant.connected => entry.entity.fire(charge),
            _ => None,
        };
        if let Some(shot) = shot {
            self.emit(MatchEvent::ShellFired {
                participant_id,
                launch_force: shot.launch_force,
            });
        }
    }

    /// Damage reported by the physics collaborator. Only counts while playing.
    pub fn apply_damage(&mut self, target: ParticipantId, amount: f32) {
        if self.session.phase != MatchPhase::Playing {
            tracing::debug!(target, phase = %self.session.phase, "Ignoring damage outside play");
            return;
        }
        let Some(entry) = self.entry_mut(target) else {
            return;
        };
        entry.entity.apply_damage(amount);
        if entry.participant.active && !entry.entity.is_alive() {
            entry.participant.active = false;
            let changed = entry.participant.clone();
            tracing::info!(participant_id = target, "Tank destroyed");
            self.emit(MatchEvent::ParticipantChanged(changed));
        }
    }

    /// Apply one command. Returns false when the coordinator should stop.
    pub fn handle_command(&mut self, cmd: CoordinatorCommand) -> bool {
        match cmd {
            CoordinatorCommand::Register {
                participant,
                entity,
                respond_to,
            } => {
                let result = self.register(participant, entity);
                if respond_to.send(result).is_err() {
                    tracing::debug!("Registration requester went away");
                }
            },
            CoordinatorCommand::Disconnected { participant_id } => {
                self.disconnect(participant_id);
            },
            CoordinatorCommand::Move {
                participant_id,
                value,
            } => self.move_input(participant_id, value),
            CoordinatorCommand::Turn {
                participant_id,
                value,
            } => self.turn_input(participant_id, value),
            CoordinatorCommand::Fire {
                participant_id,
                charge,
            } => self.fire(participant_id, charge),
            CoordinatorCommand::ApplyDamage { target, amount } => {
                self.apply_damage(target, amount);
            },
            CoordinatorCommand::Stop => return false,
        }
        true
    }

    /// Advance the state machine by one tick of `dt` simulated time.
    pub fn tick(&mut self, dt: Duration) {
        if self.everyone_bailed() {
            self.forfeit();
            self.publish_status();
            return;
        }

        match self.session.phase {
            MatchPhase::Inactive | MatchPhase::PostGame | MatchPhase::EveryoneBailed => {},
            MatchPhase::StartUp => {
                if self.roster.len() >= self.session.config.min_participants {
                    self.enter(MatchPhase::Preplay);
                }
            },
            MatchPhase::Preplay => self.begin_round(),
            MatchPhase::TimedTransition => {
                if self.session.advance_transition(dt) {
                    tracing::info!(phase = %self.session.phase, "Timed transition elapsed");
                }
            },
            MatchPhase::Preround => self.release_control(),
            MatchPhase::Playing => {
                if self.active_count() <= 1 {
                    self.enter(MatchPhase::RoundEnd);
                }
            },
            MatchPhase::RoundEnd => self.finish_round(),
            MatchPhase::EndGame => self.finish_game(),
        }
        self.publish_status();
    }

    /// Drive the coordinator on a fixed tick until stopped.
    pub async fn run(
        mut self,
        tick_interval: Duration,
        mut commands: mpsc::Receiver<CoordinatorCommand>,
    ) -> Option<MatchOutcome> {
        self.start();

        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick);
                    last_tick = now;
                    self.tick(dt);
                }
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    if !self.handle_command(cmd) {
                        break;
                    }
                }
            }
        }

        tracing::info!(match_id = %self.match_id, phase = %self.session.phase, "Coordinator stopped");
        self.outcome
    }

    fn begin_round(&mut self) {
        let mut changed = Vec::new();
        for entry in &mut self.roster {
            let pose = entry.entity.spawn_pose();
            entry.entity.reset(pose);
            entry.entity.disable_control();
            let active = entry.participant.connected;
            if entry.participant.active != active {
                entry.participant.active = active;
                changed.push(entry.participant.clone());
            }
        }
        for p in changed {
            self.emit(MatchEvent::ParticipantChanged(p));
        }

        self.session.round_number += 1;
        self.session.round_winner = None;
        tracing::info!(round = self.session.round_number, "Round starting");
        self.emit(MatchEvent::RoundStarting {
            round: self.session.round_number,
        });
        let delay = self.session.config.start_delay;
        self.session.set_timed_transition(MatchPhase::Preround, delay);
    }

    fn release_control(&mut self) {
        for entry in &mut self.roster {
            if entry.participant.connected {
                entry.entity.enable_control();
            }
        }
        self.emit(MatchEvent::RoundPlaying);
        self.enter(MatchPhase::Playing);
    }

    fn finish_round(&mut self) {
        for entry in &mut self.roster {
            entry.entity.disable_control();
        }

        let winner_idx = self.roster.iter().position(|e| e.participant.active);
        let round_winner = winner_idx.map(|i| self.roster[i].participant.id);
        self.session.round_winner = round_winner;
        if let Some(i) = winner_idx {
            self.roster[i].participant.add_win();
            let changed = self.roster[i].participant.clone();
            self.emit(MatchEvent::ParticipantChanged(changed));
        }

        let target = self.session.config.num_rounds_to_win;
        let game_winner = self
            .participants()
            .find(|p| p.wins == target)
            .map(|p| p.id);
        self.session.game_winner = game_winner;

        tracing::info!(
            round = self.session.round_number,
            round_winner = ?self.session.round_winner,
            game_winner = ?self.session.game_winner,
            "Round ended"
        );
        let message = self.round_summary();
        self.emit(MatchEvent::RoundEnding {
            round_winner: self.session.round_winner,
            message,
        });

        let next = if self.session.game_winner.is_some() {
            MatchPhase::EndGame
        } else {
            MatchPhase::Preplay
        };
        let delay = self.session.config.end_delay;
        self.session.set_timed_transition(next, delay);
    }

    fn finish_game(&mut self) {
        let standings = self.assign_ranks();
        let winner = self.session.game_winner;
        let message = match winner.and_then(|id| self.participant(id)) {
            Some(p) => format!("{} WINS THE GAME!", p.display_label()),
            None => "DRAW!".to_string(),
        };
        tracing::info!(match_id = %self.match_id, ?winner, "Game over");
        self.emit(MatchEvent::GameOver {
            winner,
            standings: standings.clone(),
            message,
        });
        self.conclude(winner, standings, false);
        self.enter(MatchPhase::PostGame);
    }

    fn forfeit(&mut self) {
        tracing::warn!(
            match_id = %self.match_id,
            phase = %self.session.phase,
            "Every participant disconnected, abandoning match"
        );
        let standings = self.assign_ranks();
        self.enter(MatchPhase::EveryoneBailed);
        self.conclude(None, standings, true);
    }

    fn conclude(
        &mut self,
        winner: Option<ParticipantId>,
        standings: Vec<StandingEntry>,
        forfeited: bool,
    ) {
        let outcome = MatchOutcome {
            match_id: self.match_id,
            winner,
            rounds_played: self.session.round_number,
            standings,
            forfeited,
        };
        self.outcome = Some(outcome.clone());
        self.emit(MatchEvent::MatchEnded(outcome));
    }

    /// Rank by wins, ties broken by admission order.
    fn assign_ranks(&mut self) -> Vec<StandingEntry> {
        let mut order: Vec<usize> = (0..self.roster.len()).collect();
        order.sort_by(|&a, &b| {
            self.roster[b]
                .participant
                .wins
                .cmp(&self.roster[a].participant.wins)
        });

        let mut standings = Vec::with_capacity(order.len());
        for (pos, idx) in order.into_iter().enumerate() {
            let p = &mut self.roster[idx].participant;
            p.rank = pos as i32 + 1;
            standings.push(StandingEntry {
                participant_id: p.id,
                wins: p.wins,
                rank: p.rank,
            });
            let changed = p.clone();
            self.emit(MatchEvent::ParticipantChanged(changed));
        }
        standings
    }

    fn round_summary(&self) -> String {
        if let Some(p) = self.session.game_winner.and_then(|id| self.participant(id)) {
            return format!("{} WINS THE GAME!", p.display_label());
        }
        let mut message = match self.session.round_winner.and_then(|id| self.participant(id)) {
            Some(p) => format!("{} WINS THE ROUND!", p.display_label()),
            None => "DRAW!".to_string(),
        };
        message.push_str("\n\n\n\n");
        for p in self.participants() {
            let _ = writeln!(message, "{}: {} WINS", p.display_label(), p.wins);
        }
        message
    }

    fn everyone_bailed(&self) -> bool {
        matches!(
            self.session.phase,
            MatchPhase::TimedTransition
                | MatchPhase::Preplay
                | MatchPhase::Preround
                | MatchPhase::RoundEnd
        ) && self.session.game_winner.is_none()
            && !self.roster.is_empty()
            && self.connected_count() == 0
    }

    fn enter(&mut self, next: MatchPhase) {
        debug_assert!(
            self.session.phase != MatchPhase::Playing || next == MatchPhase::RoundEnd,
            "Playing may only advance to RoundEnd, not {next}"
        );
        tracing::info!(from = %self.session.phase, to = %next, "Phase change");
        self.session.phase = next;
    }

    fn entry_mut(&mut self, id: ParticipantId) -> Option<&mut RosterEntry> {
        self.roster.iter_mut().find(|e| e.participant.id == id)
    }

    fn active_count(&self) -> usize {
        self.participants().filter(|p| p.active).count()
    }

    fn connected_count(&self) -> usize {
        self.participants().filter(|p| p.connected).count()
    }

    fn emit(&self, event: MatchEvent) {
        // No subscribers is fine; nobody may be connected yet.
        let _ = self.events.send(event);
    }

    fn publish_status(&self) {
        let next = MatchStatus {
            match_id: self.match_id,
            phase: self.session.phase,
            round: self.session.round_number,
            participants: self.roster.len(),
            connected: self.connected_count(),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Handles to a running coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    pub commands: mpsc::Sender<CoordinatorCommand>,
    pub events: broadcast::Sender<MatchEvent>,
    pub status: watch::Receiver<MatchStatus>,
}

impl CoordinatorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<MatchEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> MatchPhase {
        self.status.borrow().phase
    }
}

/// Spawn the coordinator tick loop as a tokio task.
pub fn spawn_coordinator(
    coordinator: SessionCoordinator,
    tick_interval: Duration,
    command_buffer: usize,
) -> (CoordinatorHandle, JoinHandle<Option<MatchOutcome>>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(command_buffer.max(1));
    let handle = CoordinatorHandle {
        commands: cmd_tx,
        events: coordinator.events.clone(),
        status: coordinator.status(),
    };
    let task = tokio::spawn(coordinator.run(tick_interval, cmd_rx));
    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tankfall_core::participant::UNRANKED;
    use tankfall_core::test_helpers::{make_participants, make_tank, quick_config};

    const TICK: Duration = Duration::from_millis(33);

    fn lobby_with(n: usize, config: SessionConfig) -> SessionCoordinator {
        let mut c = SessionCoordinator::new(config, 256);
        c.start();
        for p in make_participants(n, 11000) {
            let id = p.id;
            c.register(p, Box::new(make_tank(id))).unwrap();
        }
        c
    }

    /// Tick from `StartUp` or `Preplay` until control is released.
    fn drive_to_playing(c: &mut SessionCoordinator) {
        if c.phase() == MatchPhase::StartUp {
            c.tick(TICK);
        }
        assert_eq!(c.phase(), MatchPhase::Preplay);
        c.tick(TICK);
        let delay = c.session().config.start_delay;
        c.tick(delay);
        assert_eq!(c.phase(), MatchPhase::Preround);
        c.tick(TICK);
        assert_eq!(c.phase(), MatchPhase::Playing);
    }

    fn drain(rx: &mut broadcast::Receiver<MatchEvent>) -> Vec<MatchEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn start_opens_lobby() {
        let mut c = SessionCoordinator::new(SessionConfig::default(), 16);
        assert_eq!(c.phase(), MatchPhase::Inactive);
        c.start();
        assert_eq!(c.phase(), MatchPhase::StartUp);
        assert_eq!(c.session().round_number, 0);
        assert_eq!(c.participants().count(), 0);
    }

    #[test]
    fn one_participant_waits_in_lobby() {
        let mut c = lobby_with(1, quick_config(5));
        for _ in 0..10 {
            c.tick(TICK);
        }
        assert_eq!(c.phase(), MatchPhase::StartUp);
    }

    #[test]
    fn two_admitted_leave_lobby_next_tick() {
        let mut c = lobby_with(2, quick_config(5));
        assert_eq!(c.phase(), MatchPhase::StartUp);
        c.tick(TICK);
        assert_eq!(c.phase(), MatchPhase::Preplay);
    }

    #[test]
    fn lobby_leaver_still_counts_but_sits_out() {
        let mut c = lobby_with(2, quick_config(5));
        c.disconnect(2);
        drive_to_playing(&mut c);
        assert!(c.participant(1).unwrap().active);
        assert!(!c.participant(2).unwrap().active);

        // The lone connected tank takes the round without a fight.
        c.tick(TICK);
        assert_eq!(c.phase(), MatchPhase::RoundEnd);
        c.tick(TICK);
        assert_eq!(c.session().round_winner, Some(1));
        assert_eq!(c.participant(1).unwrap().wins, 1);
        assert_eq!(c.participant(2).unwrap().wins, 0);
    }

    #[test]
    fn preplay_announces_round_and_waits_start_delay() {
        let config = SessionConfig {
            start_delay: Duration::from_secs(3),
            ..SessionConfig::default()
        };
        let mut c = lobby_with(2, config);
        let mut rx = c.subscribe();
        c.tick(TICK);
        c.tick(TICK);
        assert_eq!(c.phase(), MatchPhase::TimedTransition);
        assert_eq!(c.session().round_number, 1);
        assert!(drain(&mut rx).contains(&MatchEvent::RoundStarting { round: 1 }));

        c.tick(Duration::from_secs(1));
        c.tick(Duration::from_secs(1));
        assert_eq!(c.phase(), MatchPhase::TimedTransition);
        c.tick(Duration::from_millis(999));
        assert_eq!(c.phase(), MatchPhase::TimedTransition);
        c.tick(Duration::from_millis(1));
        assert_eq!(c.phase(), MatchPhase::Preround);
    }

    #[test]
    fn round_starting_precedes_round_playing() {
        let mut c = lobby_with(2, quick_config(5));
        let mut rx = c.subscribe();
        drive_to_playing(&mut c);
        let phase_events: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, MatchEvent::RoundStarting { .. } | MatchEvent::RoundPlaying))
            .collect();
        assert_eq!(
            phase_events,
            vec![MatchEvent::RoundStarting { round: 1 }, MatchEvent::RoundPlaying]
        );
    }

    #[test]
    fn last_tank_standing_wins_round() {
        let mut c = lobby_with(2, quick_config(5));
        drive_to_playing(&mut c);

        c.apply_damage(1, 1000.0);
        assert!(!c.participant(1).unwrap().active);
        c.tick(TICK);
        assert_eq!(c.phase(), MatchPhase::RoundEnd);

        let mut rx = c.subscribe();
        c.tick(TICK);
        assert_eq!(c.session().round_winner, Some(2));
        assert_eq!(c.participant(2).unwrap().wins, 1);
        assert_eq!(c.participant(1).unwrap().wins, 0);
        assert_eq!(c.phase(), MatchPhase::TimedTransition);
        assert_eq!(c.session().pending_phase, MatchPhase::Preplay);

        let ending = drain(&mut rx)
            .into_iter()
            .find_map(|e| match e {
                MatchEvent::RoundEnding {
                    round_winner,
                    message,
                } => Some((round_winner, message)),
                _ => None,
            })
            .unwrap();
        assert_eq!(ending.0, Some(2));
        assert!(ending.1.starts_with("<color=#5398FF>PLAYER 2</color> WINS THE ROUND!"));
        assert!(ending.1.contains("PLAYER 1</color>: 0 WINS\n"));
        assert!(ending.1.contains("PLAYER 2</color>: 1 WINS\n"));
    }

    #[test]
    fn zero_active_is_a_draw() {
        let mut c = lobby_with(2, quick_config(5));
        drive_to_playing(&mut c);
        c.apply_damage(1, 1000.0);
        c.apply_damage(2, 1000.0);
        c.tick(TICK);
        c.tick(TICK);
        assert_eq!(c.session().round_winner, None);
        assert!(c.participants().all(|p| p.wins == 0));
    }

    #[test]
    fn tie_break_prefers_earliest_admitted() {
        let mut c = lobby_with(3, quick_config(5));
        drive_to_playing(&mut c);
        c.apply_damage(1, 1000.0);
        assert_eq!(c.phase(), MatchPhase::Playing);
        // Two left alive; force the round to end with both still active.
        c.session.phase = MatchPhase::RoundEnd;
        c.tick(TICK);
        assert_eq!(c.session().round_winner, Some(2));
    }

    #[test]
    fn damage_outside_play_is_ignored() {
        let mut c = lobby_with(2, quick_config(5));
        c.tick(TICK);
        c.apply_damage(1, 1000.0);
        assert!(c.participant(1).unwrap().active);
    }

    #[test]
    fn fifth_win_schedules_end_game() {
        let mut c = lobby_with(2, quick_config(5));
        for round in 1..=5 {
            drive_to_playing(&mut c);
            c.apply_damage(2, 1000.0);
            c.tick(TICK);
            c.tick(TICK);
            assert_eq!(c.participant(1).unwrap().wins, round);
            let expected = if round == 5 {
                MatchPhase::EndGame
            } else {
                MatchPhase::Preplay
            };
            assert_eq!(c.session().pending_phase, expected);
            c.tick(c.session().config.end_delay);
            assert_eq!(c.phase(), expected);
        }
        assert_eq!(c.session().game_winner, Some(1));
    }

    #[test]
    fn end_game_ranks_and_ends_match_once() {
        let mut c = lobby_with(3, quick_config(1));
        let mut rx = c.subscribe();
        drive_to_playing(&mut c);
        c.apply_damage(1, 1000.0);
        c.apply_damage(3, 1000.0);
        c.tick(TICK);
        c.tick(TICK);
        c.tick(c.session().config.end_delay);
        assert_eq!(c.phase(), MatchPhase::EndGame);
        c.tick(TICK);
        assert_eq!(c.phase(), MatchPhase::PostGame);
        for _ in 0..5 {
            c.tick(TICK);
        }
        assert_eq!(c.phase(), MatchPhase::PostGame);

        assert_eq!(c.participant(2).unwrap().rank, 1);
        assert_eq!(c.participant(1).unwrap().rank, 2);
        assert_eq!(c.participant(3).unwrap().rank, 3);

        let events = drain(&mut rx);
        let game_over: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, MatchEvent::GameOver { .. }))
            .collect();
        assert_eq!(game_over.len(), 1);
        if let MatchEvent::GameOver {
            winner, message, ..
        } = game_over[0]
        {
            assert_eq!(*winner, Some(2));
            assert_eq!(message, "<color=#5398FF>PLAYER 2</color> WINS THE GAME!");
        }
        let ended: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                MatchEvent::MatchEnded(o) => Some(o),
                _ => None,
            })
            .collect();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].winner, Some(2));
        assert!(!ended[0].forfeited);
        assert_eq!(ended[0].rounds_played, 1);
        assert_eq!(c.outcome(), Some(ended[0]));
    }

    #[test]
    fn registration_rejected_after_lobby() {
        let mut c = lobby_with(2, quick_config(5));
        c.tick(TICK);
        let late = make_participants(3, 11000).pop().unwrap();
        let err = c.register(late, Box::new(make_tank(3))).unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::RegistrationOverflow {
                phase: MatchPhase::Preplay,
                admitted: 2
            }
        ));
    }

    #[test]
    fn registration_rejected_at_capacity() {
        let mut c = lobby_with(4, quick_config(5));
        let fifth = Participant::new(5, "Eve".into(), PlayerColor::for_participant(5), 11005);
        assert!(c.register(fifth, Box::new(make_tank(5))).is_err());
        assert_eq!(c.participants().count(), 4);
    }

    #[test]
    fn registration_spawns_entity_with_camera_targets() {
        let mut c = SessionCoordinator::new(quick_config(5), 16);
        c.start();
        let mut rx = c.subscribe();
        for p in make_participants(2, 11000) {
            let id = p.id;
            c.register(p, Box::new(make_tank(id))).unwrap();
        }
        let events = drain(&mut rx);
        assert_eq!(
            events[1],
            MatchEvent::EntitySpawned {
                participant_id: 2,
                color: PlayerColor::for_participant(2),
                camera_targets: vec![1, 2],
            }
        );
    }

    #[test]
    fn disconnect_during_play_ends_round() {
        let mut c = lobby_with(2, quick_config(5));
        drive_to_playing(&mut c);
        c.disconnect(2);
        let p = c.participant(2).unwrap();
        assert!(!p.connected && !p.active);
        c.tick(TICK);
        assert_eq!(c.phase(), MatchPhase::RoundEnd);
        c.tick(TICK);
        assert_eq!(c.session().round_winner, Some(1));
    }

    #[test]
    fn disconnected_participant_stays_inactive_next_round() {
        let mut c = lobby_with(3, quick_config(5));
        drive_to_playing(&mut c);
        c.disconnect(3);
        c.apply_damage(2, 1000.0);
        c.tick(TICK);
        c.tick(TICK);
        c.tick(c.session().config.end_delay);
        assert_eq!(c.phase(), MatchPhase::Preplay);
        c.tick(TICK);
        assert!(c.participant(2).unwrap().active);
        assert!(!c.participant(3).unwrap().active);
        assert_eq!(c.participants().count(), 3);
    }

    #[test]
    fn everyone_bailed_outside_play() {
        let mut c = lobby_with(2, quick_config(5));
        let mut rx = c.subscribe();
        c.tick(TICK);
        c.tick(TICK);
        assert_eq!(c.phase(), MatchPhase::TimedTransition);
        c.disconnect(1);
        c.disconnect(2);
        c.tick(TICK);
        assert_eq!(c.phase(), MatchPhase::EveryoneBailed);
        let outcome = c.outcome().unwrap();
        assert!(outcome.forfeited);
        assert_eq!(outcome.winner, None);
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, MatchEvent::MatchEnded(o) if o.forfeited))
        );
    }

    #[test]
    fn everyone_leaving_during_play_goes_through_round_end() {
        let mut c = lobby_with(2, quick_config(5));
        drive_to_playing(&mut c);
        c.disconnect(1);
        c.disconnect(2);
        c.tick(TICK);
        assert_eq!(c.phase(), MatchPhase::RoundEnd);
        c.tick(TICK);
        assert_eq!(c.phase(), MatchPhase::EveryoneBailed);
    }

    #[test]
    fn inputs_reach_entity_only_with_control() {
        let mut c = lobby_with(2, quick_config(5));
        let mut rx = c.subscribe();
        c.fire(1, 1.0);
        assert!(drain(&mut rx).is_empty());

        drive_to_playing(&mut c);
        drain(&mut rx);
        c.fire(1, 1.0);
        assert_eq!(
            drain(&mut rx),
            vec![MatchEvent::ShellFired {
                participant_id: 1,
                launch_force: 30.0
            }]
        );
    }

    #[test]
    fn ranks_unset_until_game_end() {
        let mut c = lobby_with(2, quick_config(5));
        drive_to_playing(&mut c);
        c.apply_damage(2, 1000.0);
        c.tick(TICK);
        c.tick(TICK);
        assert!(c.participants().all(|p| p.rank == UNRANKED));
    }

    #[test]
    fn status_tracks_phase_and_roster() {
        let mut c = lobby_with(2, quick_config(5));
        let status = c.status();
        assert_eq!(status.borrow().phase, MatchPhase::StartUp);
        assert_eq!(status.borrow().participants, 2);
        c.tick(TICK);
        assert_eq!(status.borrow().phase, MatchPhase::Preplay);
        c.disconnect(1);
        assert_eq!(status.borrow().connected, 1);
    }

    #[test]
    fn match_event_wire_form() {
        assert!(
            MatchEvent::MatchEnded(MatchOutcome {
                match_id: Uuid::nil(),
                winner: None,
                rounds_played: 0,
                standings: vec![],
                forfeited: true,
            })
            .to_server_message()
            .is_none()
        );
        let msg = MatchEvent::RoundStarting { round: 4 }
            .to_server_message()
            .unwrap();
        assert_eq!(msg.display_text().as_deref(), Some("Round 4"));
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_coordinator_runs_a_match() {
        let c = SessionCoordinator::new(quick_config(1), 256);
        let (handle, task) = spawn_coordinator(c, Duration::from_millis(50), 32);
        let mut rx = handle.subscribe();

        for p in make_participants(2, 11000) {
            let id = p.id;
            let (tx, reply) = oneshot::channel();
            handle
                .commands
                .send(CoordinatorCommand::Register {
                    participant: p,
                    entity: Box::new(make_tank(id)),
                    respond_to: tx,
                })
                .await
                .unwrap();
            reply.await.unwrap().unwrap();
        }

        // Wait for control to be released, then knock out player 1.
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for RoundPlaying")
                .unwrap();
            if ev == MatchEvent::RoundPlaying {
                break;
            }
        }
        handle
            .commands
            .send(CoordinatorCommand::ApplyDamage {
                target: 1,
                amount: 1000.0,
            })
            .await
            .unwrap();

        let outcome = loop {
            let ev = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for MatchEnded")
                .unwrap();
            if let MatchEvent::MatchEnded(o) = ev {
                break o;
            }
        };
        assert_eq!(outcome.winner, Some(2));
        assert_eq!(handle.phase(), MatchPhase::PostGame);

        handle.commands.send(CoordinatorCommand::Stop).await.unwrap();
        let returned = task.await.unwrap();
        assert_eq!(returned, Some(outcome));
    }

    #[derive(Debug, Clone)]
    enum Action {
        Tick(u64),
        Kill(u64),
        Disconnect(u64),
    }

    fn action() -> impl Strategy<Value = Action> {
        prop_oneof![
            6 => (0u64..1500).prop_map(Action::Tick),
            2 => (1u64..=4).prop_map(Action::Kill),
            1 => (1u64..=4).prop_map(Action::Disconnect),
        ]
    }

    proptest! {
        #[test]
        fn state_machine_invariants(
            n in 2usize..=4,
            rounds_to_win in 1u32..=3,
            actions in proptest::collection::vec(action(), 1..200),
        ) {
            let mut c = lobby_with(n, quick_config(rounds_to_win));
            let mut active_at_round_end: Vec<ParticipantId> = Vec::new();

            for a in actions {
                let before_phase = c.phase();
                let before_wins: Vec<u32> = c.participants().map(|p| p.wins).collect();
                match a {
                    Action::Tick(ms) => c.tick(Duration::from_millis(ms)),
                    Action::Kill(id) => c.apply_damage(id, 1000.0),
                    Action::Disconnect(id) => c.disconnect(id),
                }

                if before_phase == MatchPhase::Playing {
                    prop_assert!(matches!(c.phase(), MatchPhase::Playing | MatchPhase::RoundEnd));
                }
                if before_phase != MatchPhase::RoundEnd && c.phase() == MatchPhase::RoundEnd {
                    active_at_round_end = c.participants().filter(|p| p.active).map(|p| p.id).collect();
                }
                if before_phase == MatchPhase::RoundEnd && c.phase() != MatchPhase::RoundEnd {
                    if let Some(w) = c.session().round_winner {
                        prop_assert!(active_at_round_end.contains(&w));
                    }
                }

                let after_wins: Vec<u32> = c.participants().map(|p| p.wins).collect();
                for (b, a) in before_wins.iter().zip(&after_wins) {
                    prop_assert!(a >= b);
                    prop_assert!(*a <= rounds_to_win);
                }
                let someone_won = c.participants().any(|p| p.wins == rounds_to_win);
                prop_assert_eq!(c.session().game_winner.is_some(), someone_won);
            }
        }
    }
}
