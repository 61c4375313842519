pub mod bench;
pub mod chat;
pub mod config_cmd;
pub mod sessions;

use llamachat_chat::{ChatOrchestrator, ChatSettings, ContextAssembler};
use llamachat_config::AppConfig;
use llamachat_engine::EngineBridge;
use llamachat_memory::{MemoryStore, ResponseCache, SessionStore, open_storage};
use std::sync::Arc;
use tracing::info;

/// Load config, apply a `--model` override, and wire the orchestrator.
pub async fn build(model: Option<String>) -> Result<ChatOrchestrator, Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if model.is_some() {
        config.engine.model_path = model;
    }

    let bridge = Arc::new(spawn_bridge(&config)?);

    let storage = open_storage(&config.storage).await?;
    let sessions = Arc::new(SessionStore::restore(storage.clone()).await?);
    let memories = Arc::new(MemoryStore::with_storage(storage));
    if let Some(active) = sessions.active_id() {
        memories.load_session(&active).await?;
    }
    info!(
        backend = ?config.storage.backend,
        sessions = sessions.snapshot().sessions.len(),
        "Conversation state ready"
    );
    let cache = Arc::new(ResponseCache::new(config.cache.clone()));
    let assembler = ContextAssembler::new(config.context.clone(), config.engine.template);

    let orchestrator = ChatOrchestrator::new(bridge, sessions, memories, cache, assembler)
        .with_settings(ChatSettings::from(&config));

    if let Some(path) = &config.engine.model_path {
        orchestrator.load(path).await?;
    }
    Ok(orchestrator)
}

#[cfg(feature = "local")]
fn spawn_bridge(config: &AppConfig) -> Result<EngineBridge, Box<dyn std::error::Error>> {
    use llamachat_engine::BridgeConfig;
    use llamachat_engine::candle::{CandleBackend, SamplerSettings};

    let backend = CandleBackend::new(SamplerSettings::default());
    Ok(EngineBridge::spawn(
        backend,
        BridgeConfig::from(config.engine.clone()),
    )?)
}

#[cfg(not(feature = "local"))]
fn spawn_bridge(_config: &AppConfig) -> Result<EngineBridge, Box<dyn std::error::Error>> {
    Err("llamachat was built without a native engine; rebuild with `--features local`".into())
}
