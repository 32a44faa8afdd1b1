//! Protocol Messages
//!
//! Typed client packets and the server-originated notifications.
//! Parsing is a `match` over the opcode so the supported set is explicit.

use crate::lobby::object::Position;
use crate::network::packet::{Opcode, PacketReader, PacketWriter, ParseError};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Which clients an enumeration should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFilter {
    /// Every present client.
    All,
    /// Present clients whose reservation is not ready.
    NotReady,
    /// Present clients whose reservation is ready.
    Ready,
}

impl ClientFilter {
    /// Decode the wire value; unknown values fall back to `All`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ClientFilter::NotReady,
            2 => ClientFilter::Ready,
            _ => ClientFilter::All,
        }
    }
}

/// Where a cast binary should be relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastTarget {
    /// Everyone else in the sender's stage.
    Stage,
    /// Everyone else holding the sender's semaphore.
    Semaphore,
}

fn parse_position(reader: &mut PacketReader<'_>) -> Result<Position, ParseError> {
    Ok(Position {
        x: reader.read_f32()?,
        y: reader.read_f32()?,
        z: reader.read_f32()?,
    })
}

/// Packets sent from client to server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    /// End of the logical packet stream in this group.
    End,

    /// Keepalive.
    Nop,

    /// Keepalive and latency check.
    Ping { ack_handle: u32 },

    /// Bind a character to the session.
    Login {
        ack_handle: u32,
        char_id: u32,
        name: String,
    },

    /// Graceful logout.
    Logout { log_key: u8 },

    /// Create a stage; fails if it exists.
    CreateStage {
        ack_handle: u32,
        max_players: u8,
        stage_id: String,
    },

    /// Transfer into a stage, creating it if missing.
    EnterStage { ack_handle: u32, stage_id: String },

    /// Transfer into an existing stage.
    MoveStage { ack_handle: u32, stage_id: String },

    /// Return to the previous stage.
    BackStage { ack_handle: u32 },

    /// Reserve a slot.
    ReserveStage {
        ack_handle: u32,
        ready: bool,
        stage_id: String,
        password: String,
    },

    /// Drop the current reservation.
    UnreserveStage,

    /// Set the password of the current stage (host only).
    SetStagePass { password: String },

    /// Lock or unlock the current stage (host only).
    LockStage { ack_handle: u32, locked: bool },

    /// Store an echo blob.
    SetStageBinary {
        binary_type0: u8,
        binary_type1: u8,
        stage_id: String,
        data: Vec<u8>,
    },

    /// Fetch an echo blob.
    GetStageBinary {
        ack_handle: u32,
        binary_type0: u8,
        binary_type1: u8,
        stage_id: String,
    },

    /// List stages whose ID starts with `prefix`.
    EnumerateStage { ack_handle: u32, prefix: String },

    /// List characters present in a stage.
    EnumerateClient {
        ack_handle: u32,
        filter: ClientFilter,
        stage_id: String,
    },

    /// Spawn an object in the current stage.
    CreateObject { ack_handle: u32, position: Position },

    /// Move an owned object.
    PositionObject { object_id: u32, position: Position },

    /// Acquire a semaphore, creating it if missing.
    CreateAcquireSemaphore {
        ack_handle: u32,
        max_players: u8,
        name: String,
    },

    /// Acquire an existing semaphore.
    AcquireSemaphore { ack_handle: u32, name: String },

    /// Release a semaphore.
    ReleaseSemaphore { name: String },

    /// Check whether a semaphore exists.
    CheckSemaphore { ack_handle: u32, name: String },

    /// Relay an opaque blob.
    CastBinary {
        target: CastTarget,
        message_type: u8,
        data: Vec<u8>,
    },
}

impl ClientPacket {
    /// Parse the body that follows `opcode`.
    ///
    /// On success the reader is positioned right after this packet, which is
    /// where the next packet in the group starts.
    pub fn parse(opcode: Opcode, r: &mut PacketReader<'_>) -> Result<Self, ParseError> {
        let packet = match opcode {
            Opcode::SYS_END => ClientPacket::End,
            Opcode::SYS_NOP => ClientPacket::Nop,
            Opcode::SYS_PING => ClientPacket::Ping {
                ack_handle: r.read_u32()?,
            },
            Opcode::SYS_LOGIN => ClientPacket::Login {
                ack_handle: r.read_u32()?,
                char_id: r.read_u32()?,
                name: r.read_string()?,
            },
            Opcode::SYS_LOGOUT => ClientPacket::Logout {
                log_key: r.read_u8()?,
            },
            Opcode::SYS_CREATE_STAGE => ClientPacket::CreateStage {
                ack_handle: r.read_u32()?,
                max_players: r.read_u8()?,
                stage_id: r.read_string()?,
            },
            Opcode::SYS_ENTER_STAGE => ClientPacket::EnterStage {
                ack_handle: r.read_u32()?,
                stage_id: r.read_string()?,
            },
            Opcode::SYS_MOVE_STAGE => ClientPacket::MoveStage {
                ack_handle: r.read_u32()?,
                stage_id: r.read_string()?,
            },
            Opcode::SYS_BACK_STAGE => ClientPacket::BackStage {
                ack_handle: r.read_u32()?,
            },
            Opcode::SYS_RESERVE_STAGE => ClientPacket::ReserveStage {
                ack_handle: r.read_u32()?,
                ready: r.read_u8()? != 0,
                stage_id: r.read_string()?,
                password: r.read_string()?,
            },
            Opcode::SYS_UNRESERVE_STAGE => ClientPacket::UnreserveStage,
            Opcode::SYS_SET_STAGE_PASS => ClientPacket::SetStagePass {
                password: r.read_string()?,
            },
            Opcode::SYS_LOCK_STAGE => ClientPacket::LockStage {
                ack_handle: r.read_u32()?,
                locked: r.read_u8()? != 0,
            },
            Opcode::SYS_SET_STAGE_BINARY => ClientPacket::SetStageBinary {
                binary_type0: r.read_u8()?,
                binary_type1: r.read_u8()?,
                stage_id: r.read_string()?,
                data: r.read_blob()?,
            },
            Opcode::SYS_GET_STAGE_BINARY => ClientPacket::GetStageBinary {
                ack_handle: r.read_u32()?,
                binary_type0: r.read_u8()?,
                binary_type1: r.read_u8()?,
                stage_id: r.read_string()?,
            },
            Opcode::SYS_ENUMERATE_STAGE => ClientPacket::EnumerateStage {
                ack_handle: r.read_u32()?,
                prefix: r.read_string()?,
            },
            Opcode::SYS_ENUMERATE_CLIENT => ClientPacket::EnumerateClient {
                ack_handle: r.read_u32()?,
                filter: ClientFilter::from_u8(r.read_u8()?),
                stage_id: r.read_string()?,
            },
            Opcode::SYS_CREATE_OBJECT => ClientPacket::CreateObject {
                ack_handle: r.read_u32()?,
                position: parse_position(r)?,
            },
            Opcode::SYS_POSITION_OBJECT => ClientPacket::PositionObject {
                object_id: r.read_u32()?,
                position: parse_position(r)?,
            },
            Opcode::SYS_CREATE_ACQUIRE_SEMAPHORE => ClientPacket::CreateAcquireSemaphore {
                ack_handle: r.read_u32()?,
                max_players: r.read_u8()?,
                name: r.read_string()?,
            },
            Opcode::SYS_ACQUIRE_SEMAPHORE => ClientPacket::AcquireSemaphore {
                ack_handle: r.read_u32()?,
                name: r.read_string()?,
            },
            Opcode::SYS_RELEASE_SEMAPHORE => ClientPacket::ReleaseSemaphore {
                name: r.read_string()?,
            },
            Opcode::SYS_CHECK_SEMAPHORE => ClientPacket::CheckSemaphore {
                ack_handle: r.read_u32()?,
                name: r.read_string()?,
            },
            Opcode::SYS_CAST_BINARY => ClientPacket::CastBinary {
                target: if r.read_u8()? == 1 {
                    CastTarget::Semaphore
                } else {
                    CastTarget::Stage
                },
                message_type: r.read_u8()?,
                data: r.read_blob()?,
            },
            other => return Err(ParseError::UnknownOpcode(other)),
        };
        Ok(packet)
    }

    /// Ack handle the client expects a response for, if this packet carries one.
    pub fn ack_handle(&self) -> Option<u32> {
        match self {
            ClientPacket::Ping { ack_handle }
            | ClientPacket::Login { ack_handle, .. }
            | ClientPacket::CreateStage { ack_handle, .. }
            | ClientPacket::EnterStage { ack_handle, .. }
            | ClientPacket::MoveStage { ack_handle, .. }
            | ClientPacket::BackStage { ack_handle }
            | ClientPacket::ReserveStage { ack_handle, .. }
            | ClientPacket::LockStage { ack_handle, .. }
            | ClientPacket::GetStageBinary { ack_handle, .. }
            | ClientPacket::EnumerateStage { ack_handle, .. }
            | ClientPacket::EnumerateClient { ack_handle, .. }
            | ClientPacket::CreateObject { ack_handle, .. }
            | ClientPacket::CreateAcquireSemaphore { ack_handle, .. }
            | ClientPacket::AcquireSemaphore { ack_handle, .. }
            | ClientPacket::CheckSemaphore { ack_handle, .. } => Some(*ack_handle),
            _ => None,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClientPacket::End => "SYS_END",
            ClientPacket::Nop => "SYS_NOP",
            ClientPacket::Ping { .. } => "SYS_PING",
            ClientPacket::Login { .. } => "SYS_LOGIN",
            ClientPacket::Logout { .. } => "SYS_LOGOUT",
            ClientPacket::CreateStage { .. } => "SYS_CREATE_STAGE",
            ClientPacket::EnterStage { .. } => "SYS_ENTER_STAGE",
            ClientPacket::MoveStage { .. } => "SYS_MOVE_STAGE",
            ClientPacket::BackStage { .. } => "SYS_BACK_STAGE",
            ClientPacket::ReserveStage { .. } => "SYS_RESERVE_STAGE",
            ClientPacket::UnreserveStage => "SYS_UNRESERVE_STAGE",
            ClientPacket::SetStagePass { .. } => "SYS_SET_STAGE_PASS",
            ClientPacket::LockStage { .. } => "SYS_LOCK_STAGE",
            ClientPacket::SetStageBinary { .. } => "SYS_SET_STAGE_BINARY",
            ClientPacket::GetStageBinary { .. } => "SYS_GET_STAGE_BINARY",
            ClientPacket::EnumerateStage { .. } => "SYS_ENUMERATE_STAGE",
            ClientPacket::EnumerateClient { .. } => "SYS_ENUMERATE_CLIENT",
            ClientPacket::CreateObject { .. } => "SYS_CREATE_OBJECT",
            ClientPacket::PositionObject { .. } => "SYS_POSITION_OBJECT",
            ClientPacket::CreateAcquireSemaphore { .. } => "SYS_CREATE_ACQUIRE_SEMAPHORE",
            ClientPacket::AcquireSemaphore { .. } => "SYS_ACQUIRE_SEMAPHORE",
            ClientPacket::ReleaseSemaphore { .. } => "SYS_RELEASE_SEMAPHORE",
            ClientPacket::CheckSemaphore { .. } => "SYS_CHECK_SEMAPHORE",
            ClientPacket::CastBinary { .. } => "SYS_CAST_BINARY",
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// A character entered the recipient's stage.
pub fn insert_user(char_id: u32, name: &str) -> Vec<u8> {
    PacketWriter::new(Opcode::SYS_INSERT_USER)
        .u32(char_id)
        .string(name)
        .finish()
}

/// A character left the recipient's stage.
pub fn delete_user(char_id: u32) -> Vec<u8> {
    PacketWriter::new(Opcode::SYS_DELETE_USER).u32(char_id).finish()
}

/// An object exists in the recipient's stage.
pub fn duplicate_object(object_id: u32, owner_char_id: u32, position: Position) -> Vec<u8> {
    PacketWriter::new(Opcode::SYS_DUPLICATE_OBJECT)
        .u32(object_id)
        .u32(owner_char_id)
        .f32(position.x)
        .f32(position.y)
        .f32(position.z)
        .finish()
}

/// An object moved.
pub fn position_object(object_id: u32, position: Position) -> Vec<u8> {
    PacketWriter::new(Opcode::SYS_POSITION_OBJECT)
        .u32(object_id)
        .f32(position.x)
        .f32(position.y)
        .f32(position.z)
        .finish()
}

/// A relayed blob, tagged with the sender.
pub fn casted_binary(sender_char_id: u32, message_type: u8, data: &[u8]) -> Vec<u8> {
    PacketWriter::new(Opcode::SYS_CASTED_BINARY)
        .u32(sender_char_id)
        .u8(message_type)
        .blob(data)
        .finish()
}
