//! Wire Primitives
//!
//! Opcodes, frame terminator, acknowledgement framing and the bounded
//! big-endian reader/writer used by every packet body.
//!
//! ```text
//! outgoing frame: [opcode u16][payload ...][0x00 0x10]
//! ack payload:    [MSG_SYS_ACK][handle u32][is_buffer u8][error u8][len u16 | 0xFFFF len u32][data]
//! ```

use bytes::{Buf, BufMut, BytesMut};

/// Every outgoing frame ends with these two bytes.
///
/// The value is the `SYS_END` opcode, so a client parser that hits it treats
/// it as the end of the logical packet stream.
pub const TERMINATOR: [u8; 2] = Opcode::SYS_END.to_be_bytes();

/// Length marker that announces a 4-byte extended length in an ack.
pub const EXTENDED_LENGTH_MARKER: u16 = 0xFFFF;

/// Acknowledgement error code for success.
pub const ACK_SUCCESS: u8 = 0;

/// Acknowledgement error code for failure.
pub const ACK_FAILURE: u8 = 1;

/// 16-bit protocol opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opcode(pub u16);

impl Opcode {
    /// Acknowledgement (server -> client).
    pub const SYS_ACK: Opcode = Opcode(0x0001);
    /// End of a logical packet stream.
    pub const SYS_END: Opcode = Opcode(0x0010);
    /// No-op keepalive.
    pub const SYS_NOP: Opcode = Opcode(0x0011);
    /// Keepalive and latency check.
    pub const SYS_PING: Opcode = Opcode(0x0012);
    /// Character login.
    pub const SYS_LOGIN: Opcode = Opcode(0x0013);
    /// Graceful logout.
    pub const SYS_LOGOUT: Opcode = Opcode(0x0014);

    /// Explicit stage creation.
    pub const SYS_CREATE_STAGE: Opcode = Opcode(0x0020);
    /// Transfer into a stage, creating it when unknown.
    pub const SYS_ENTER_STAGE: Opcode = Opcode(0x0021);
    /// Transfer into an existing stage.
    pub const SYS_MOVE_STAGE: Opcode = Opcode(0x0022);
    /// Return to the previous stage.
    pub const SYS_BACK_STAGE: Opcode = Opcode(0x0023);
    /// Reserve a slot in a stage.
    pub const SYS_RESERVE_STAGE: Opcode = Opcode(0x0024);
    /// Drop the current reservation.
    pub const SYS_UNRESERVE_STAGE: Opcode = Opcode(0x0025);
    /// Host sets the stage password.
    pub const SYS_SET_STAGE_PASS: Opcode = Opcode(0x0026);
    /// Host toggles the stage lock.
    pub const SYS_LOCK_STAGE: Opcode = Opcode(0x0027);
    /// Store an echo blob on a stage.
    pub const SYS_SET_STAGE_BINARY: Opcode = Opcode(0x0028);
    /// Fetch an echo blob from a stage.
    pub const SYS_GET_STAGE_BINARY: Opcode = Opcode(0x0029);
    /// List stages by ID prefix.
    pub const SYS_ENUMERATE_STAGE: Opcode = Opcode(0x002A);
    /// List characters present in a stage.
    pub const SYS_ENUMERATE_CLIENT: Opcode = Opcode(0x002B);

    /// Spawn an object in the current stage.
    pub const SYS_CREATE_OBJECT: Opcode = Opcode(0x0030);
    /// Move an object (both directions).
    pub const SYS_POSITION_OBJECT: Opcode = Opcode(0x0031);

    /// Acquire a semaphore, creating it when unknown.
    pub const SYS_CREATE_ACQUIRE_SEMAPHORE: Opcode = Opcode(0x0040);
    /// Acquire an existing semaphore.
    pub const SYS_ACQUIRE_SEMAPHORE: Opcode = Opcode(0x0041);
    /// Release a held semaphore.
    pub const SYS_RELEASE_SEMAPHORE: Opcode = Opcode(0x0042);
    /// Query whether a semaphore exists.
    pub const SYS_CHECK_SEMAPHORE: Opcode = Opcode(0x0043);

    /// Relay an opaque blob to peers.
    pub const SYS_CAST_BINARY: Opcode = Opcode(0x0050);

    /// A character entered the stage (server -> client).
    pub const SYS_INSERT_USER: Opcode = Opcode(0x0060);
    /// A character left the stage (server -> client).
    pub const SYS_DELETE_USER: Opcode = Opcode(0x0061);
    /// An object exists in the stage (server -> client).
    pub const SYS_DUPLICATE_OBJECT: Opcode = Opcode(0x0062);
    /// A relayed blob (server -> client).
    pub const SYS_CASTED_BINARY: Opcode = Opcode(0x0063);

    /// Big-endian wire bytes.
    pub const fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Packet parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// No parser is registered for the opcode.
    #[error("unknown opcode {0}")]
    UnknownOpcode(Opcode),

    /// The body ended before the parser finished.
    #[error("packet truncated: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the group.
        available: usize,
    },
}

/// Bounded big-endian reader over one packet group.
///
/// Every read checks the remaining length first, so a malformed body turns
/// into a [`ParseError::Truncated`] instead of a panic.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    start_len: usize,
}

impl<'a> PacketReader<'a> {
    /// Wrap a byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            start_len: data.len(),
        }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.start_len - self.data.len()
    }

    fn ensure(&self, needed: usize) -> Result<(), ParseError> {
        if self.data.remaining() < needed {
            return Err(ParseError::Truncated {
                needed,
                available: self.data.remaining(),
            });
        }
        Ok(())
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8, ParseError> {
        self.ensure(1)?;
        Ok(self.data.get_u8())
    }

    /// Read a big-endian u16.
    pub fn read_u16(&mut self) -> Result<u16, ParseError> {
        self.ensure(2)?;
        Ok(self.data.get_u16())
    }

    /// Read a big-endian u32.
    pub fn read_u32(&mut self) -> Result<u32, ParseError> {
        self.ensure(4)?;
        Ok(self.data.get_u32())
    }

    /// Look at the next big-endian u32 without consuming it.
    pub fn peek_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.data.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Read a big-endian f32.
    pub fn read_f32(&mut self) -> Result<f32, ParseError> {
        self.ensure(4)?;
        Ok(self.data.get_f32())
    }

    /// Read `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, ParseError> {
        self.ensure(len)?;
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head.to_vec())
    }

    /// Read a u8-length-prefixed string (lossy UTF-8).
    pub fn read_string(&mut self) -> Result<String, ParseError> {
        let len = self.read_u8()? as usize;
        let raw = self.read_bytes(len)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Read a u16-length-prefixed blob.
    pub fn read_blob(&mut self) -> Result<Vec<u8>, ParseError> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }
}

/// Big-endian writer for outgoing messages.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    /// Start a message with its opcode.
    pub fn new(opcode: Opcode) -> Self {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u16(opcode.0);
        Self { buf }
    }

    /// Start an opcode-less payload, such as an ack body.
    pub fn payload() -> Self {
        Self::default()
    }

    /// Append a byte.
    pub fn u8(mut self, value: u8) -> Self {
        self.buf.put_u8(value);
        self
    }

    /// Append a big-endian u16.
    pub fn u16(mut self, value: u16) -> Self {
        self.buf.put_u16(value);
        self
    }

    /// Append a big-endian u32.
    pub fn u32(mut self, value: u32) -> Self {
        self.buf.put_u32(value);
        self
    }

    /// Append a big-endian f32.
    pub fn f32(mut self, value: f32) -> Self {
        self.buf.put_f32(value);
        self
    }

    /// Append raw bytes.
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.buf.put_slice(data);
        self
    }

    /// Append a u8-length-prefixed string, truncated to 255 bytes.
    pub fn string(mut self, value: &str) -> Self {
        let raw = value.as_bytes();
        let len = raw.len().min(u8::MAX as usize);
        self.buf.put_u8(len as u8);
        self.buf.put_slice(&raw[..len]);
        self
    }

    /// Append a u16-length-prefixed blob, truncated to 65535 bytes.
    pub fn blob(mut self, data: &[u8]) -> Self {
        let len = data.len().min(u16::MAX as usize);
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&data[..len]);
        self
    }

    /// Finish the message.
    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Build an acknowledgement message.
pub fn build_ack(ack_handle: u32, is_buffer: bool, error_code: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(16 + data.len());
    buf.put_u16(Opcode::SYS_ACK.0);
    buf.put_u32(ack_handle);
    buf.put_u8(is_buffer as u8);
    buf.put_u8(error_code);
    if data.len() >= EXTENDED_LENGTH_MARKER as usize {
        buf.put_u16(EXTENDED_LENGTH_MARKER);
        buf.put_u32(data.len() as u32);
    } else {
        buf.put_u16(data.len() as u16);
    }
    buf.put_slice(data);
    buf.to_vec()
}

/// Append the terminator to one message.
pub fn frame(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + TERMINATOR.len());
    out.extend_from_slice(message);
    out.extend_from_slice(&TERMINATOR);
    out
}
