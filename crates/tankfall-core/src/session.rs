use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::participant::ParticipantId;

/// Phase of the match state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchPhase {
    /// Created but not started.
    Inactive,
    /// Waiting for a pending phase once a delay has elapsed.
    TimedTransition,
    /// Lobby: waiting for enough participants.
    StartUp,
    /// Resetting tanks and announcing the next round.
    Preplay,
    /// Handing control back to the players.
    Preround,
    Playing,
    RoundEnd,
    EndGame,
    /// Result has been published; nothing left to do in this run.
    PostGame,
    /// Every participant disconnected before a winner emerged.
    EveryoneBailed,
}

impl MatchPhase {
    /// Phases that still accept new participants.
    pub fn accepts_admissions(self) -> bool {
        matches!(self, Self::Inactive | Self::StartUp)
    }

    /// Whether this run is over.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::EndGame | Self::PostGame | Self::EveryoneBailed)
    }
}

impl std::fmt::Display for MatchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Match rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub num_rounds_to_win: u32,
    pub start_delay: Duration,
    pub end_delay: Duration,
    /// Registered participants required to leave `StartUp`.
    pub min_participants: usize,
    pub max_participants: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            num_rounds_to_win: 5,
            start_delay: Duration::from_secs(3),
            end_delay: Duration::from_secs(3),
            min_participants: 2,
            max_participants: 4,
        }
    }
}

/// The single authoritative match instance.
#[derive(Debug, Clone)]
pub struct Session {
    pub phase: MatchPhase,
    pub round_number: u32,
    /// Remaining delay; only meaningful in `TimedTransition`.
    pub transition_deadline: Duration,
    pub pending_phase: MatchPhase,
    pub round_winner: Option<ParticipantId>,
    pub game_winner: Option<ParticipantId>,
    pub config: SessionConfig,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            phase: MatchPhase::Inactive,
            round_number: 0,
            transition_deadline: Duration::ZERO,
            pending_phase: MatchPhase::Inactive,
            round_winner: None,
            game_winner: None,
            config,
        }
    }

    /// Enter `TimedTransition`, landing on `next` once `delay` has elapsed.
    pub fn set_timed_transition(&mut self, next: MatchPhase, delay: Duration) {
        tracing::info!(from = %self.phase, to = %next, ?delay, "Scheduling phase transition");
        self.pending_phase = next;
        self.transition_deadline = delay;
        self.phase = MatchPhase::TimedTransition;
    }

    /// Burn `elapsed` off the transition deadline. Returns true when the
    /// pending phase was entered.
    pub fn advance_transition(&mut self, elapsed: Duration) -> bool {
        debug_assert_eq!(self.phase, MatchPhase::TimedTransition);
        self.transition_deadline = self.transition_deadline.saturating_sub(elapsed);
        if self.transition_deadline.is_zero() {
            self.phase = self.pending_phase;
            true
        } else {
            false
        }
    }
}
