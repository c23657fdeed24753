use serde::{Deserialize, Serialize};

/// Position and heading a tank returns to at the start of each round.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpawnPose {
    pub x: f32,
    pub z: f32,
    /// Heading in degrees.
    pub heading: f32,
}

/// Player-driven capabilities, gated by the coordinator.
pub trait Controllable {
    fn enable_control(&mut self);
    fn disable_control(&mut self);
    fn has_control(&self) -> bool;
    /// Forward/backward throttle in [-1, 1].
    fn move_input(&mut self, value: f32);
    /// Turn rate in [-1, 1].
    fn turn_input(&mut self, value: f32);
    /// Release a shell charged to `charge` in [0, 1].
    fn fire(&mut self, charge: f32) -> Option<Shot>;
}

pub trait Damageable {
    fn apply_damage(&mut self, amount: f32);
    fn is_alive(&self) -> bool;
    fn health(&self) -> f32;
}

pub trait Resettable {
    fn reset(&mut self, pose: SpawnPose);
}

/// Everything the coordinator needs from a controlled entity.
pub trait Combatant: Controllable + Damageable + Resettable + Send {
    fn spawn_pose(&self) -> SpawnPose;
}

/// A fired shell, handed to the physics collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Shot {
    pub launch_force: f32,
}

pub const STARTING_HEALTH: f32 = 100.0;
pub const MIN_LAUNCH_FORCE: f32 = 15.0;
pub const MAX_LAUNCH_FORCE: f32 = 30.0;

/// Damage dealt by a shell exploding `distance` away, falling off linearly to
/// zero at `radius`.
pub fn explosion_damage(distance: f32, radius: f32, max_damage: f32) -> f32 {
    if radius <= 0.0 {
        return 0.0;
    }
    let falloff = (distance.max(0.0) / radius).min(1.0);
    max_damage * (1.0 - falloff)
}

/// Server-side tank: health, control gating and last input.
#[derive(Debug, Clone)]
pub struct Tank {
    spawn: SpawnPose,
    pose: SpawnPose,
    health: f32,
    dead: bool,
    control_enabled: bool,
    throttle: f32,
    turn: f32,
}

impl Tank {
    pub fn new(spawn: SpawnPose) -> Self {
        Self {
            spawn,
            pose: spawn,
            health: STARTING_HEALTH,
            dead: false,
            control_enabled: false,
            throttle: 0.0,
            turn: 0.0,
        }
    }

    pub fn pose(&self) -> SpawnPose {
        self.pose
    }

    pub fn throttle(&self) -> f32 {
        self.throttle
    }

    pub fn turn(&self) -> f32 {
        self.turn
    }
}

impl Controllable for Tank {
    fn enable_control(&mut self) {
        self.control_enabled = true;
        self.throttle = 0.0;
        self.turn = 0.0;
    }

    fn disable_control(&mut self) {
        self.control_enabled = false;
        self.throttle = 0.0;
        self.turn = 0.0;
    }

    fn has_control(&self) -> bool {
        self.control_enabled
    }

    fn move_input(&mut self, value: f32) {
        if self.control_enabled && !self.dead && value.is_finite() {
            self.throttle = value.clamp(-1.0, 1.0);
        }
    }

    fn turn_input(&mut self, value: f32) {
        if self.control_enabled && !self.dead && value.is_finite() {
            self.turn = value.clamp(-1.0, 1.0);
        }
    }

    fn fire(&mut self, charge: f32) -> Option<Shot> {
        if !self.control_enabled || self.dead || !charge.is_finite() {
            return None;
        }
        let charge = charge.clamp(0.0, 1.0);
        Some(Shot {
            launch_force: MIN_LAUNCH_FORCE + (MAX_LAUNCH_FORCE - MIN_LAUNCH_FORCE) * charge,
        })
    }
}

impl Damageable for Tank {
    fn apply_damage(&mut self, amount: f32) {
        if self.dead || !amount.is_finite() || amount <= 0.0 {
            return;
        }
        self.health = (self.health - amount).max(0.0);
        if self.health == 0.0 {
            self.dead = true;
            self.control_enabled = false;
        }
    }

    fn is_alive(&self) -> bool {
        !self.dead
    }

    fn health(&self) -> f32 {
        self.health
    }
}

impl Resettable for Tank {
    fn reset(&mut self, pose: SpawnPose) {
        self.pose = pose;
        self.health = STARTING_HEALTH;
        self.dead = false;
        self.throttle = 0.0;
        self.turn = 0.0;
    }
}

impl Combatant for Tank {
    fn spawn_pose(&self) -> SpawnPose {
        self.spawn
    }
}
