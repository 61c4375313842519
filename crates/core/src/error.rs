//! Error types for the llamachat domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all llamachat operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Engine errors ---
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Storage errors ---
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures raised by the engine bridge and the native backend behind it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Operation invoked in the wrong lifecycle state. Never retried.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A native allocation step returned a null handle during `load`.
    #[error("{step}() failed")]
    Allocation { step: &'static str },

    /// The engine failed while producing tokens.
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Low-level decode / KV-cache failure. Recoverable by clearing the cache.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Any other native backend failure (model parsing, tokenizer, ...).
    #[error("Backend error: {0}")]
    Backend(String),

    /// The dedicated engine worker is no longer running.
    #[error("Engine worker is not running")]
    WorkerGone,
}

impl EngineError {
    /// Whether a native cache clear is expected to recover from this failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn model_already_loaded() -> Self {
        Self::InvalidState("Model already loaded".into())
    }

    pub fn no_model_loaded() -> Self {
        Self::InvalidState("No model loaded".into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("No active session")]
    NoActiveSession,

    #[error("Message not found: {0}")]
    MessageNotFound(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Failed to (de)serialize entry '{key}': {reason}")]
    Serialization { key: String, reason: String },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_error_names_step() {
        let err = Error::Engine(EngineError::Allocation { step: "new_context" });
        assert!(err.to_string().contains("new_context() failed"));
    }

    #[test]
    fn only_transport_failures_are_recoverable() {
        assert!(EngineError::Transport("llama_decode returned 1".into()).is_recoverable());
        assert!(!EngineError::Generation("boom".into()).is_recoverable());
        assert!(!EngineError::no_model_loaded().is_recoverable());
    }

    #[test]
    fn storage_serialization_failures_surface_through_storage_variant() {
        let err: Error = StorageError::Serialization {
            key: "session_abc".into(),
            reason: "bad json".into(),
        }
        .into();
        assert!(matches!(err, Error::Storage(StorageError::Serialization { .. })));
        assert!(err.to_string().starts_with("Storage error:"));
    }

    #[test]
    fn session_error_displays_id() {
        let err = Error::Session(SessionError::NotFound("abc".into()));
        assert!(err.to_string().contains("abc"));
    }
}
