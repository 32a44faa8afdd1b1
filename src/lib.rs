//! # Lobby Server
//!
//! Connection/session core of a real-time multiplayer game server: persistent
//! TCP sessions speaking a framed binary protocol, and the shared lobby state
//! (stages, semaphores) those sessions coordinate through.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       LOBBY SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  network/          - Sessions and wire protocol              │
//! │  ├── packet.rs     - Opcodes, reader/writer, ack framing     │
//! │  ├── protocol.rs   - ClientPacket parsing, server messages   │
//! │  ├── transport.rs  - PacketSink/PacketSource, TCP codec      │
//! │  ├── session.rs    - Outbound queue, send/recv loops         │
//! │  ├── handlers.rs   - Opcode handlers over lobby state        │
//! │  └── server.rs     - Accept loop, live session table         │
//! │                                                              │
//! │  lobby/            - Shared multiplayer state                │
//! │  ├── stage.rs      - One lobby: clients, slots, objects      │
//! │  ├── object.rs     - Positioned objects                      │
//! │  ├── semaphore.rs  - Named capacity gates                    │
//! │  └── registry.rs   - StageMap, semaphore registry, sweeps    │
//! │                                                              │
//! │  config.rs         - ServerConfig (defaults, env, JSON)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! Each stage and semaphore has one reader/writer lock; each object has its
//! own. Registries are sharded maps. Locks are taken in the order
//! registry shard, then stage or semaphore, then session queue, and no lock
//! is held across an `.await`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod lobby;
pub mod network;

// Re-export commonly used types
pub use config::{ConfigError, ServerConfig};
pub use lobby::{Semaphore, SemaphoreRegistry, Stage, StageMap};
pub use network::{LobbyHandler, LobbyServer, LobbyServerError, Session, SessionId};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capacity of stages created without an explicit size.
pub const DEFAULT_STAGE_MAX_PLAYERS: u16 = 127;

/// Semaphores whose name starts with this prefix are raid semaphores.
pub const RAID_SEMAPHORE_PREFIX: &str = "raid_";

/// Capacity forced onto raid semaphores regardless of the requested size.
pub const RAID_SEMAPHORE_CAPACITY: u16 = 127;
