//! # SimpleWT Server
//!
//! Real-time session transport with a small shared world on top.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SIMPLEWT SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Primitives                                │
//! │  ├── rng.rs      - Xorshift128+ for challenge parameters     │
//! │  └── hash.rs     - SHA1 challenge digests                    │
//! │                                                              │
//! │  game/           - World rules                               │
//! │  ├── player.rs   - Position and movement policy              │
//! │  ├── garbage.rs  - Hash challenge state                      │
//! │  └── world.rs    - Membership, broadcast, chat, movement     │
//! │                                                              │
//! │  network/        - Transport                                 │
//! │  ├── codec.rs    - Payload codec                             │
//! │  ├── packet.rs   - 6-byte header framing                     │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── transport.rs- Byte stream over WebSocket                │
//! │  ├── session.rs  - Session state machine and registry        │
//! │  ├── auth.rs     - Login codes                               │
//! │  ├── server.rs   - Login and stream endpoints                │
//! │  └── client.rs   - Headless client                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//!
//! Every packet is `opcode: u16 LE | length: u32 LE | payload`. Payloads are
//! bincode-encoded structs, one per opcode.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use game::{GameWorld, MovementPolicy, WorldConfig};
pub use network::{
    Client, ClientConfig, GameServer, OpCode, Packet, ServerConfig, Session, SessionManager,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
