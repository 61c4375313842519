//! `llamachat sessions`: List stored conversations.

use llamachat_config::AppConfig;
use llamachat_core::session::SessionSnapshot;
use llamachat_memory::{SessionStore, open_storage};

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let storage = open_storage(&config.storage).await?;
    let store = SessionStore::restore(storage).await?;

    println!("  Storage:   {:?}", config.storage.backend);
    print(&store.snapshot());
    Ok(())
}

pub fn print(snapshot: &SessionSnapshot) {
    if snapshot.sessions.is_empty() {
        println!("  No sessions.");
        return;
    }
    for session in &snapshot.sessions {
        let marker = if snapshot.active.as_ref() == Some(&session.id) {
            "*"
        } else {
            " "
        };
        println!(
            "  {marker} {}  {:<24} {:>4} messages  updated {}",
            session.id,
            session.name,
            session.messages.len(),
            session.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
}
