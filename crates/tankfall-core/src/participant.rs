use serde::{Deserialize, Serialize};

/// Unique identifier for a participant, assigned sequentially from 1.
pub type ParticipantId = u64;

/// Rank value used until the match has finished.
pub const UNRANKED: i32 = -1;

/// Replicated per-player record.
///
/// `wins` only ever grows (at round end) and `rank` is assigned once at game
/// end. The coordinator is the only writer; everything else sees clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub color: PlayerColor,
    pub wins: u32,
    pub rank: i32,
    /// Whether the controlled entity is currently alive.
    pub active: bool,
    /// Whether the owning connection is still open.
    pub connected: bool,
    pub side_channel_port: u16,
}

impl Participant {
    pub fn new(
        id: ParticipantId,
        display_name: String,
        color: PlayerColor,
        side_channel_port: u16,
    ) -> Self {
        Self {
            id,
            display_name,
            color,
            wins: 0,
            rank: UNRANKED,
            active: true,
            connected: true,
            side_channel_port,
        }
    }

    /// Label shown by UI collaborators, e.g. `<color=#FF5757>PLAYER 1</color>`.
    pub fn display_label(&self) -> String {
        format!("<color=#{}>PLAYER {}</color>", self.color.to_hex(), self.id)
    }

    pub fn add_win(&mut self) {
        self.wins += 1;
    }

    pub fn is_ranked(&self) -> bool {
        self.rank != UNRANKED
    }
}

/// Tank tint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Default for PlayerColor {
    fn default() -> Self {
        Self::PALETTE[0]
    }
}

impl PlayerColor {
    /// Colors handed out in admission order.
    pub const PALETTE: &[PlayerColor] = &[
        PlayerColor {
            r: 255,
            g: 87,
            b: 87,
        }, // Red
        PlayerColor {
            r: 83,
            g: 152,
            b: 255,
        }, // Blue
        PlayerColor {
            r: 46,
            g: 213,
            b: 115,
        }, // Green
        PlayerColor {
            r: 255,
            g: 195,
            b: 18,
        }, // Yellow
        PlayerColor {
            r: 130,
            g: 88,
            b: 255,
        }, // Purple
        PlayerColor {
            r: 255,
            g: 148,
            b: 77,
        }, // Orange
        PlayerColor {
            r: 78,
            g: 205,
            b: 196,
        }, // Teal
        PlayerColor {
            r: 255,
            g: 107,
            b: 175,
        }, // Pink
    ];

    /// Palette entry for the given participant id (1-based, wraps around).
    pub fn for_participant(id: ParticipantId) -> Self {
        let idx = (id.saturating_sub(1) as usize) % Self::PALETTE.len();
        Self::PALETTE[idx]
    }

    pub fn to_hex(self) -> String {
        format!("{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}
