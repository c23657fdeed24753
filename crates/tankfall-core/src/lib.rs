pub mod entity;
pub mod frame;
pub mod net;
pub mod participant;
pub mod session;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use std::time::Duration;

    use crate::entity::{SpawnPose, Tank};
    use crate::participant::{Participant, ParticipantId, PlayerColor};
    use crate::session::SessionConfig;

    /// Create `n` participants with sequential ids starting at 1.
    pub fn make_participants(n: usize, base_port: u16) -> Vec<Participant> {
        (0..n)
            .map(|i| {
                let id = i as ParticipantId + 1;
                Participant::new(
                    id,
                    format!("Player{id}"),
                    PlayerColor::for_participant(id),
                    base_port + id as u16,
                )
            })
            .collect()
    }

    /// A tank parked at a distinct spot per id.
    pub fn make_tank(id: ParticipantId) -> Tank {
        Tank::new(SpawnPose {
            x: id as f32 * 10.0,
            z: 0.0,
            heading: 0.0,
        })
    }

    /// Rules with short delays, so tests need few simulated seconds.
    pub fn quick_config(num_rounds_to_win: u32) -> SessionConfig {
        SessionConfig {
            num_rounds_to_win,
            start_delay: Duration::from_secs(1),
            end_delay: Duration::from_secs(1),
            ..SessionConfig::default()
        }
    }
}
