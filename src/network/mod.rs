//! Network Layer
//!
//! Framing, sessions and the endpoints that feed them. Game rules live in
//! `game/`; this layer only moves packets.

pub mod auth;
pub mod client;
pub mod codec;
pub mod packet;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use auth::{AuthConfig, AuthError, LoginStore};
pub use client::{Client, ClientConfig, ClientError};
pub use codec::{BincodeCodec, Codec, CodecError};
pub use packet::{FrameConfig, FrameError, OpCode, Packet, PacketWriter, HEADER_LEN};
pub use protocol::Message;
pub use server::{GameServer, GameServerError, ServerConfig};
pub use session::{
    DisconnectNotifier, HeartbeatConfig, Session, SessionConfig, SessionError, SessionManager,
    SessionState,
};
pub use transport::{Transport, WsTransport};
