//! Game Logic Module
//!
//! The shared world behind the session layer.
//!
//! ## Module Structure
//!
//! - `player`: Player position and movement policy
//! - `garbage`: Hash challenge issue and verification
//! - `world`: Membership, broadcast, chat and movement

pub mod garbage;
pub mod player;
pub mod world;

// Re-export key types
pub use garbage::{GarbageConfig, GarbageError, GarbageState, Verdict};
pub use player::{MovementPolicy, Player, WORLD_MAX, WORLD_MIN};
pub use world::{GameWorld, NameResolver, WorldConfig};
