//! Engine bridge for llamachat.
//!
//! Owns the non-reentrant native inference engine and exposes
//! load / unload / generate / bench / clear-cache as the only entry points.
//! Every native call runs on one dedicated worker thread.

pub mod bridge;
#[cfg(feature = "local")]
pub mod candle;
pub mod native;
pub mod params;
pub mod stream;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use bridge::{BridgeConfig, EngineBridge, EngineStatus};
#[cfg(feature = "local")]
pub use candle::CandleBackend;
pub use native::{BenchParams, EngineHandle, LoadParams, NativeBackend, RawHandle};
pub use params::HostResources;
pub use stream::TokenStream;
