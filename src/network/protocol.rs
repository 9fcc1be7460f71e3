//! Protocol Messages
//!
//! Payload types carried inside packets. Each struct maps to exactly one
//! [`OpCode`] and is encoded with bincode, so every message is a flat
//! struct rather than a tagged enum.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::packet::OpCode;

/// Binds a payload type to the opcode it travels under.
pub trait Message: Serialize {
    /// Opcode used when sending this message.
    const OPCODE: OpCode;
}

macro_rules! message {
    ($ty:ty => $op:ident) => {
        impl Message for $ty {
            const OPCODE: OpCode = OpCode::$op;
        }
    };
}

// =============================================================================
// SHARED
// =============================================================================

/// Ping from the server and pong from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender's clock, Unix milliseconds.
    pub timestamp: i64,
}

impl Heartbeat {
    /// Heartbeat stamped with the current time.
    pub fn now() -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Public view of a player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    /// Player identity.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Horizontal position.
    pub x: i32,
    /// Vertical position.
    pub y: i32,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// A player joined or left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerConnected {
    /// The player concerned.
    pub player: PlayerInfo,
    /// True on connect, false on disconnect.
    pub connected: bool,
}

/// A player's position changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerMoved {
    /// The player with its new position.
    pub who: PlayerInfo,
}

/// Chat line relayed to everyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBroadcast {
    /// Sender's name.
    pub name: String,
    /// Text as received.
    pub text: String,
}

/// Garbage challenge sent to one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GarbageChallenge {
    /// Digests expected per response.
    pub amount: u32,
    /// Responses per second the client should send.
    pub rate: u8,
    /// 20-byte seed.
    pub base: Vec<u8>,
}

/// Acknowledgement of a correct response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GarbageAck {
    /// Digests still owed in this challenge.
    pub remaining: u32,
}

/// Everyone currently in the world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRoster {
    /// Connected players.
    pub players: Vec<PlayerInfo>,
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Chat line from a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientChat {
    /// Text to relay.
    pub text: String,
}

/// Movement request. Only the sign of each axis matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMove {
    /// Horizontal delta.
    pub dx: i8,
    /// Vertical delta.
    pub dy: i8,
}

/// Answer to a garbage challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GarbageResponse {
    /// One digest per index, in order.
    pub hashes: Vec<Vec<u8>>,
}

message!(Heartbeat => Heartbeat);
message!(PlayerConnected => PlayerConnected);
message!(PlayerMoved => PlayerMoved);
message!(ChatBroadcast => Chat);
message!(GarbageChallenge => GarbageChallenge);
message!(GarbageAck => GarbageAck);
message!(PlayerRoster => PlayerRoster);
message!(ClientChat => ClientChat);
message!(ClientMove => ClientMove);
message!(GarbageResponse => GarbageResponse);
