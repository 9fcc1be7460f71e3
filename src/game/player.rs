//! Player State
//!
//! Position on the 0..=100 grid plus the player's garbage challenge.

use uuid::Uuid;

use super::garbage::GarbageState;
use crate::network::protocol::PlayerInfo;

/// Lowest coordinate on either axis.
pub const WORLD_MIN: i32 = 0;

/// Highest coordinate on either axis.
pub const WORLD_MAX: i32 = 100;

/// What happens when a move leaves the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MovementPolicy {
    /// Stop at the edge.
    #[default]
    Clamp,
    /// Reappear on the opposite edge.
    Wrap,
}

impl MovementPolicy {
    /// Apply the policy to a coordinate that may be off the grid.
    pub fn apply(self, value: i32) -> i32 {
        match self {
            MovementPolicy::Clamp => value.clamp(WORLD_MIN, WORLD_MAX),
            MovementPolicy::Wrap if value > WORLD_MAX => WORLD_MIN,
            MovementPolicy::Wrap if value < WORLD_MIN => WORLD_MAX,
            MovementPolicy::Wrap => value,
        }
    }
}

impl std::str::FromStr for MovementPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clamp" => Ok(MovementPolicy::Clamp),
            "wrap" => Ok(MovementPolicy::Wrap),
            other => Err(format!("unknown movement policy: {}", other)),
        }
    }
}

/// A player in the world.
#[derive(Debug, Clone)]
pub struct Player {
    /// Identity, shared with the session.
    pub id: Uuid,
    /// Display name, fixed at connect.
    pub name: String,
    /// Horizontal position.
    pub x: i32,
    /// Vertical position.
    pub y: i32,
    /// Challenge progress.
    pub garbage: GarbageState,
}

impl Player {
    /// New player at the origin.
    pub fn new(id: Uuid, name: String) -> Self {
        Self {
            id,
            name,
            x: WORLD_MIN,
            y: WORLD_MIN,
            garbage: GarbageState::default(),
        }
    }

    /// Public view.
    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            id: self.id,
            name: self.name.clone(),
            x: self.x,
            y: self.y,
        }
    }

    /// Step one cell in the direction of each delta's sign.
    /// Returns true if the position changed.
    pub fn step(&mut self, dx: i8, dy: i8, policy: MovementPolicy) -> bool {
        let x = policy.apply(self.x + dx.signum() as i32);
        let y = policy.apply(self.y + dy.signum() as i32);
        let changed = x != self.x || y != self.y;
        self.x = x;
        self.y = y;
        changed
    }
}
