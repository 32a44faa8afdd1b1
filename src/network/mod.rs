//! Network Layer
//!
//! Framed binary protocol over persistent TCP sessions. Handlers run inline in
//! each session's receive task and reach shared state through `lobby/`.

pub mod handlers;
pub mod packet;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use handlers::LobbyHandler;
pub use packet::{Opcode, PacketReader, PacketWriter, ParseError};
pub use protocol::{CastTarget, ClientFilter, ClientPacket};
pub use server::{LobbyServer, LobbyServerError};
pub use session::{OutboundQueue, PacketHandler, Session, SessionId};
pub use transport::{PacketSink, PacketSource};
