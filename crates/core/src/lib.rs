//! # llamachat Core
//!
//! Domain types, traits, and error definitions for the llamachat
//! conversation pipeline. Every other crate depends inward on this one.
//!
//! - [`message`] / [`session`]: the conversation model
//! - [`memory`]: session-scoped facts with keyword relevance
//! - [`storage`]: the optional durable key/value collaborator
//! - [`event`]: broadcast events for UIs following a turn

pub mod error;
pub mod event;
pub mod memory;
pub mod message;
pub mod session;
pub mod storage;

// Re-export key types at crate root for ergonomics
pub use error::{EngineError, Error, Result, SessionError, StorageError};
pub use event::{ChatEvent, EventBus};
pub use memory::MemoryRecord;
pub use message::{Message, MessageMetadata, ModelParams, PerformanceMetrics, Sender};
pub use session::{Session, SessionId, SessionSnapshot};
pub use storage::{Storage, StorageEntry};
