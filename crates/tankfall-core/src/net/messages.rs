use serde::{Deserialize, Serialize};

use crate::participant::{ParticipantId, PlayerColor};

/// Network message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    // Client -> Server
    Join = 0x01,
    Leave = 0x02,
    Move = 0x03,
    Turn = 0x04,
    Fire = 0x05,

    // Server -> Client (unicast)
    JoinResponse = 0x10,
    ConnectionInfo = 0x11,

    // Server -> Client (broadcast)
    EntitySpawned = 0x20,
    RoundStarting = 0x21,
    RoundPlaying = 0x22,
    RoundEnding = 0x23,
    ShellFired = 0x24,
    ParticipantUpdate = 0x25,
    GameOver = 0x26,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Join),
            0x02 => Some(Self::Leave),
            0x03 => Some(Self::Move),
            0x04 => Some(Self::Turn),
            0x05 => Some(Self::Fire),
            0x10 => Some(Self::JoinResponse),
            0x11 => Some(Self::ConnectionInfo),
            0x20 => Some(Self::EntitySpawned),
            0x21 => Some(Self::RoundStarting),
            0x22 => Some(Self::RoundPlaying),
            0x23 => Some(Self::RoundEnding),
            0x24 => Some(Self::ShellFired),
            0x25 => Some(Self::ParticipantUpdate),
            0x26 => Some(Self::GameOver),
            _ => None,
        }
    }

    /// Types only the server may send.
    pub fn is_server_only(self) -> bool {
        (self as u8) >= 0x10
    }
}

// ============================================================================
// Client -> Server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinMsg {
    pub display_name: String,
    pub protocol_version: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveMsg {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveMsg {
    pub value: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnMsg {
    pub value: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireMsg {
    pub charge: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Join(JoinMsg),
    Leave(LeaveMsg),
    Move(MoveMsg),
    Turn(TurnMsg),
    Fire(FireMsg),
}

// ============================================================================
// Server -> Client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponseMsg {
    pub success: bool,
    pub participant_id: Option<ParticipantId>,
    pub error: Option<String>,
}

/// Where to reach the participant's side channel, as `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfoMsg {
    pub address: String,
}

/// A tank entered the arena; `camera_targets` lists every tank so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpawnedMsg {
    pub participant_id: ParticipantId,
    pub color: PlayerColor,
    pub camera_targets: Vec<ParticipantId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStartingMsg {
    pub round: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundPlayingMsg {}

/// `message` is the round summary (winner line plus the scoreboard), or the
/// game winner line when this round decided the match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundEndingMsg {
    pub round_winner: Option<ParticipantId>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellFiredMsg {
    pub participant_id: ParticipantId,
    pub launch_force: f32,
}

/// Replicated fields of one participant after a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantUpdateMsg {
    pub participant_id: ParticipantId,
    pub wins: u32,
    pub rank: i32,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandingEntry {
    pub participant_id: ParticipantId,
    pub wins: u32,
    pub rank: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameOverMsg {
    pub winner: Option<ParticipantId>,
    pub standings: Vec<StandingEntry>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    JoinResponse(JoinResponseMsg),
    ConnectionInfo(ConnectionInfoMsg),
    EntitySpawned(EntitySpawnedMsg),
    RoundStarting(RoundStartingMsg),
    RoundPlaying(RoundPlayingMsg),
    RoundEnding(RoundEndingMsg),
    ShellFired(ShellFiredMsg),
    ParticipantUpdate(ParticipantUpdateMsg),
    GameOver(GameOverMsg),
}

impl ServerMessage {
    /// Status line for the UI collaborator, if this message changes it.
    pub fn display_text(&self) -> Option<String> {
        match self {
            Self::RoundStarting(m) => Some(format!("Round {}", m.round)),
            Self::RoundPlaying(_) => Some(String::new()),
            Self::RoundEnding(m) => Some(m.message.clone()),
            Self::GameOver(m) => Some(m.message.clone()),
            _ => None,
        }
    }
}
