//! The native engine collaborator.
//!
//! A [`NativeBackend`] is the raw, non-reentrant inference engine. Its
//! methods mirror the C entry points it wraps: allocation calls return a
//! [`RawHandle`] that is null on failure, and every call must come from
//! the one engine worker thread. Only [`crate::EngineBridge`] ever calls it.

use llamachat_core::EngineError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// An opaque native resource handle. Zero means the allocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawHandle(pub u64);

impl RawHandle {
    pub const NULL: RawHandle = RawHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// The four native resources that make up a loaded engine instance.
///
/// Valid only while the bridge is in the Loaded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineHandle {
    pub model: RawHandle,
    pub context: RawHandle,
    pub batch: RawHandle,
    pub sampler: RawHandle,
}

/// Parameters picked for a model load from the host's resources.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadParams {
    pub threads: usize,
    pub context_size: u32,
    pub batch_size: u32,
    pub gpu_layers: u32,
    pub rope_scaling: f32,
}

/// Inputs of the fixed native benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchParams {
    /// Prompt-processing tokens (pp)
    pub prompt_tokens: u32,
    /// Text-generation tokens (tg)
    pub gen_tokens: u32,
    /// Parallel sequences (pl)
    pub parallel: u32,
    /// Repetitions (nr)
    pub repetitions: u32,
}

impl BenchParams {
    pub fn new(prompt_tokens: u32, gen_tokens: u32, parallel: u32, repetitions: u32) -> Self {
        Self {
            prompt_tokens,
            gen_tokens,
            parallel,
            repetitions,
        }
    }
}

/// The raw engine, as seen from its dedicated worker thread.
pub trait NativeBackend: Send + 'static {
    /// One-time library / logging / backend initialization.
    fn backend_init(&mut self) -> Result<(), EngineError>;

    /// Human-readable description of the compute backend.
    fn system_info(&self) -> String;

    /// Optimized load path honoring the selected parameters.
    fn load_model_with_config(
        &mut self,
        path: &Path,
        params: &LoadParams,
    ) -> Result<RawHandle, EngineError>;

    /// Basic load path with library defaults.
    fn load_model(&mut self, path: &Path) -> RawHandle;

    fn new_context(&mut self, model: RawHandle, params: &LoadParams) -> RawHandle;

    fn new_batch(&mut self, n_tokens: u32, embd: u32, n_seq_max: u32) -> RawHandle;

    fn new_sampler(&mut self) -> RawHandle;

    fn free_model(&mut self, model: RawHandle);

    fn free_context(&mut self, context: RawHandle);

    fn free_batch(&mut self, batch: RawHandle);

    fn free_sampler(&mut self, sampler: RawHandle);

    /// Evaluate the prompt. Returns the position the completion loop starts at.
    fn completion_init(
        &mut self,
        handle: &EngineHandle,
        text: &str,
        format_chat: bool,
        n_len: u32,
    ) -> Result<u32, EngineError>;

    /// Produce the next fragment and advance `n_cur`.
    ///
    /// `Ok(None)` signals end of output.
    fn completion_loop(
        &mut self,
        handle: &EngineHandle,
        n_len: u32,
        n_cur: &mut u32,
    ) -> Result<Option<String>, EngineError>;

    /// Drop everything held in the key-value cache.
    fn kv_cache_clear(&mut self, context: RawHandle);

    /// Run the fixed benchmark and return a textual report.
    fn bench(&mut self, handle: &EngineHandle, params: &BenchParams) -> Result<String, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle() {
        assert!(RawHandle::NULL.is_null());
        assert!(RawHandle::default().is_null());
        assert!(!RawHandle(7).is_null());
    }
}
