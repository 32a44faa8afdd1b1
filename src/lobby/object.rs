//! Stage objects.
//!
//! Each object carries its own lock so the owner's position updates never
//! contend with stage-level membership changes or broadcasts.

use parking_lot::RwLock;

use crate::network::session::SessionId;

/// Object position in stage space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    /// X coordinate.
    pub x: f32,
    /// Y coordinate.
    pub y: f32,
    /// Z coordinate.
    pub z: f32,
}

impl Position {
    /// Construct a position.
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// A positioned entity owned by one session inside one stage.
#[derive(Debug)]
pub struct StageObject {
    id: u32,
    owner: SessionId,
    owner_char_id: u32,
    position: RwLock<Position>,
}

impl StageObject {
    /// Create an object at `position`.
    pub fn new(id: u32, owner: SessionId, owner_char_id: u32, position: Position) -> Self {
        Self {
            id,
            owner,
            owner_char_id,
            position: RwLock::new(position),
        }
    }

    /// Object ID, unique within its stage.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Owning session.
    pub fn owner(&self) -> SessionId {
        self.owner
    }

    /// Character ID of the owner at creation time.
    pub fn owner_char_id(&self) -> u32 {
        self.owner_char_id
    }

    /// Current position.
    pub fn position(&self) -> Position {
        *self.position.read()
    }

    /// Move the object.
    pub fn set_position(&self, position: Position) {
        *self.position.write() = position;
    }
}
