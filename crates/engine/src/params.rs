//! Load-parameter selection from host resources.

use crate::native::LoadParams;
use llamachat_config::EngineConfig;
use sysinfo::System;

/// What the host offers at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResources {
    pub cpus: usize,
    pub available_memory_mb: u64,
}

impl HostResources {
    /// Probe the running host.
    pub fn probe() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            cpus,
            available_memory_mb: sys.available_memory() / (1024 * 1024),
        }
    }
}

/// Pick threads, context size and batch size for the given host.
///
/// Threads leave one core free. Context and batch shrink with available memory.
pub fn select_load_params(host: HostResources, engine: &EngineConfig) -> LoadParams {
    let threads = host.cpus.saturating_sub(1).max(1);
    let (context_size, batch_size) = match host.available_memory_mb {
        m if m > 3000 => (4096, 1024),
        m if m > 1500 => (2048, 512),
        _ => (1024, 256),
    };
    LoadParams {
        threads,
        context_size,
        batch_size,
        gpu_layers: engine.gpu_layers,
        rope_scaling: engine.rope_scaling,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(cpus: usize, mb: u64) -> HostResources {
        HostResources {
            cpus,
            available_memory_mb: mb,
        }
    }

    #[test]
    fn memory_tiers() {
        let cfg = EngineConfig::default();
        let big = select_load_params(host(8, 6000), &cfg);
        assert_eq!((big.context_size, big.batch_size), (4096, 1024));

        let mid = select_load_params(host(8, 2000), &cfg);
        assert_eq!((mid.context_size, mid.batch_size), (2048, 512));

        let small = select_load_params(host(8, 1500), &cfg);
        assert_eq!((small.context_size, small.batch_size), (1024, 256));
    }

    #[test]
    fn threads_leave_one_core_free() {
        let cfg = EngineConfig::default();
        assert_eq!(select_load_params(host(8, 0), &cfg).threads, 7);
        assert_eq!(select_load_params(host(1, 0), &cfg).threads, 1);
        assert_eq!(select_load_params(host(0, 0), &cfg).threads, 1);
    }

    #[test]
    fn engine_config_carries_through() {
        let cfg = EngineConfig {
            gpu_layers: 12,
            rope_scaling: 0.5,
            ..EngineConfig::default()
        };
        let p = select_load_params(host(4, 4000), &cfg);
        assert_eq!(p.gpu_layers, 12);
        assert_eq!(p.rope_scaling, 0.5);
    }
}
