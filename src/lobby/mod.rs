//! Lobby State
//!
//! Stages, their objects, semaphores, and the registries that own them.

pub mod object;
pub mod registry;
pub mod semaphore;
pub mod stage;

pub use object::{Position, StageObject};
pub use registry::{Membership, Registry, SemaphoreRegistry, StageMap};
pub use semaphore::{Semaphore, SemaphoreError};
pub use stage::{Stage, StageError};
