//! The conversation orchestrator.
//!
//! One user turn:
//!
//! 1. append the user message to the active session
//! 2. answer from the response cache when possible
//! 3. otherwise assemble a prompt, stream a completion into a placeholder,
//!    finalize the reply, cache it and remember it
//!
//! Turns are serialized by a turn lock. `cancel` and `clear` interrupt the
//! turn holding it; a cancelled turn is retracted so the session returns to
//! its pre-turn message count.

use crate::assembler::ContextAssembler;
use crate::token::estimate_tokens;
use chrono::Utc;
use futures::StreamExt;
use llamachat_config::AppConfig;
use llamachat_core::error::{EngineError, Error, Result, SessionError};
use llamachat_core::event::{ChatEvent, EventBus};
use llamachat_core::message::{Message, MessageMetadata, ModelParams, PerformanceMetrics, Sender};
use llamachat_core::session::{SessionId, SessionSnapshot};
use llamachat_engine::{BenchParams, EngineBridge, EngineStatus};
use llamachat_memory::{MemoryStore, ResponseCache, SessionStore};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-turn behavior of the orchestrator.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    /// Forwarded to the engine with every prompt
    pub format_chat: bool,

    pub use_memory: bool,

    pub memory_limit: usize,

    /// Recorded on every generated reply
    pub model_params: ModelParams,

    /// Warm-up benchmarks slower than this abort the bench run
    pub bench_warmup_limit: Duration,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            format_chat: false,
            use_memory: true,
            memory_limit: 5,
            model_params: ModelParams::default(),
            bench_warmup_limit: Duration::from_secs(5),
        }
    }
}

impl From<&AppConfig> for ChatSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            format_chat: config.engine.format_chat,
            use_memory: config.context.use_memory,
            memory_limit: config.context.memory_limit,
            model_params: ModelParams {
                max_tokens: config.engine.max_generation_tokens,
                ..ModelParams::default()
            },
            ..Self::default()
        }
    }
}

/// How a call to [`ChatOrchestrator::send`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Answered from the response cache without touching the engine
    Cached(Message),
    /// Streamed from the engine
    Generated(Message),
    /// Cancelled mid-stream and retracted
    Cancelled,
    /// Blank input; nothing happened
    Skipped,
}

impl TurnOutcome {
    /// The assistant reply, if the turn produced one.
    pub fn reply(&self) -> Option<&Message> {
        match self {
            Self::Cached(m) | Self::Generated(m) => Some(m),
            Self::Cancelled | Self::Skipped => None,
        }
    }
}

enum StreamEnd {
    Finished,
    Failed(EngineError),
    Cancelled,
}

/// Reports from [`ChatOrchestrator::bench`].
#[derive(Debug, Clone, PartialEq)]
pub struct BenchOutcome {
    pub warmup_secs: f64,
    pub warmup_report: String,
    /// `None` when the warm-up was too slow
    pub report: Option<String>,
}

pub struct ChatOrchestrator {
    bridge: Arc<EngineBridge>,
    sessions: Arc<SessionStore>,
    memories: Arc<MemoryStore>,
    cache: Arc<ResponseCache>,
    events: Arc<EventBus>,
    assembler: ContextAssembler,
    settings: ChatSettings,
    turn_lock: AsyncMutex<()>,
    cancel: Mutex<CancellationToken>,
    draft: watch::Sender<String>,
}

impl ChatOrchestrator {
    pub fn new(
        bridge: Arc<EngineBridge>,
        sessions: Arc<SessionStore>,
        memories: Arc<MemoryStore>,
        cache: Arc<ResponseCache>,
        assembler: ContextAssembler,
    ) -> Self {
        let (draft, _) = watch::channel(String::new());
        Self {
            bridge,
            sessions,
            memories,
            cache,
            events: Arc::new(EventBus::default()),
            assembler,
            settings: ChatSettings::default(),
            turn_lock: AsyncMutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
            draft,
        }
    }

    pub fn with_settings(mut self, settings: ChatSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn memories(&self) -> &Arc<MemoryStore> {
        &self.memories
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn bridge(&self) -> &Arc<EngineBridge> {
        &self.bridge
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn engine_status(&self) -> EngineStatus {
        self.bridge.status()
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.sessions.snapshot()
    }

    /// Messages of the active session.
    pub fn messages(&self) -> Vec<Message> {
        self.sessions.snapshot().active_messages().to_vec()
    }

    // --- Draft field ---

    pub fn update_draft(&self, text: impl Into<String>) {
        self.draft.send_replace(text.into());
    }

    pub fn draft(&self) -> String {
        self.draft.borrow().clone()
    }

    pub fn subscribe_draft(&self) -> watch::Receiver<String> {
        self.draft.subscribe()
    }

    /// Take the draft, clear the field, and send it.
    pub async fn send_draft(&self) -> Result<TurnOutcome> {
        let text = self.draft.send_replace(String::new());
        self.send(&text).await
    }

    // --- Sessions ---

    pub async fn new_session(&self, name: Option<&str>) -> SessionId {
        self.cancel();
        let _turn = self.turn_lock.lock().await;
        self.sessions.create_session(name).await
    }

    /// Make `id` active and pull its remembered facts into memory.
    pub async fn switch_session(&self, id: &SessionId) -> Result<()> {
        self.cancel();
        let _turn = self.turn_lock.lock().await;
        self.sessions.set_active(id)?;
        if let Err(e) = self.memories.load_session(id).await {
            warn!(session_id = %id, error = %e, "Failed to load session memories");
        }
        Ok(())
    }

    async fn ensure_session(&self) -> SessionId {
        match self.sessions.active_id() {
            Some(id) => id,
            None => self.sessions.create_session(None).await,
        }
    }

    // --- Turns ---

    /// Run one user turn.
    pub async fn send(&self, text: &str) -> Result<TurnOutcome> {
        let query = text.trim();
        if query.is_empty() {
            return Ok(TurnOutcome::Skipped);
        }

        let _turn = self.turn_lock.lock().await;
        let token = self.fresh_token();
        let session_id = self.ensure_session().await;

        let user = Message::user(query, estimate_tokens(query));
        let user_id = user.id.clone();
        self.sessions.append_message_to(&session_id, user).await?;

        if self.cache.is_enabled() {
            if let Some(cached) = self.cache.find_similar_query(query).await {
                debug!(session_id = %session_id, "Response cache hit");
                let reply = Message::ai(cached.as_str(), estimate_tokens(&cached));
                self.sessions
                    .append_message_to(&session_id, reply.clone())
                    .await?;
                self.events.publish(ChatEvent::CacheHit {
                    session_id: session_id.to_string(),
                    query: query.to_string(),
                    timestamp: Utc::now(),
                });
                return Ok(TurnOutcome::Cached(reply));
            }
        }

        self.generate(&session_id, query, &user_id, &token).await
    }

    async fn generate(
        &self,
        session_id: &SessionId,
        query: &str,
        user_id: &str,
        token: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let related = if self.settings.use_memory {
            self.memories
                .get_related_memories(query, session_id, self.settings.memory_limit)
                .await
        } else {
            Vec::new()
        };

        let history = self
            .sessions
            .snapshot()
            .get(session_id)
            .map(|s| s.messages.clone())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let prompt = self.assembler.assemble(&history, &related);
        debug!(
            session_id = %session_id,
            messages = prompt.message_ids.len(),
            memories = prompt.memories_included,
            estimated_tokens = prompt.estimated_tokens,
            "Prompt assembled"
        );

        let placeholder =
            Message::ai("", 0).with_model_params(self.settings.model_params.clone());
        self.sessions
            .append_message_to(session_id, placeholder.clone())
            .await?;

        // Role-tagged templates are already in chat form
        let format_chat =
            self.settings.format_chat && !self.assembler.template().is_role_tagged();
        let mut stream = self.bridge.generate(prompt.text.as_str(), format_chat);
        let started = Instant::now();
        let mut first_fragment = None;
        let mut fragments = 0usize;
        let mut reply = String::new();

        let end = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break StreamEnd::Cancelled,
                next = stream.next() => match next {
                    Some(Ok(fragment)) => {
                        first_fragment.get_or_insert_with(|| started.elapsed());
                        fragments += 1;
                        reply.push_str(&fragment);
                        let partial = placeholder.successor(reply.as_str(), placeholder.metadata.clone());
                        if let Err(e) = self.sessions.update_in_place(session_id, partial) {
                            warn!(error = %e, "Streaming placeholder vanished");
                        }
                        self.events.publish(ChatEvent::Fragment {
                            session_id: session_id.to_string(),
                            message_id: placeholder.id.clone(),
                            text: fragment,
                        });
                    }
                    Some(Err(e)) => break StreamEnd::Failed(e),
                    None => break StreamEnd::Finished,
                }
            }
        };
        drop(stream);

        match end {
            StreamEnd::Finished => {}
            StreamEnd::Failed(e) => return Err(self.fail_turn(session_id, &placeholder, e).await),
            StreamEnd::Cancelled => {
                self.retract(session_id, &placeholder.id, user_id).await;
                return Ok(TurnOutcome::Cancelled);
            }
        }

        let total = started.elapsed();
        let text = self.assembler.template().trim_reply(&reply).to_string();
        let performance = PerformanceMetrics {
            prompt_token_count: prompt.estimated_tokens,
            response_token_count: fragments,
            time_to_first_token_ms: first_fragment.map_or(0, |d| d.as_millis() as u64),
            average_time_per_token_ms: if fragments > 0 {
                total.as_secs_f32() * 1000.0 / fragments as f32
            } else {
                0.0
            },
            total_generation_time_ms: total.as_millis() as u64,
        };
        let final_reply = placeholder.successor(
            text.as_str(),
            MessageMetadata {
                tokens: estimate_tokens(&text),
                context_references: prompt.message_ids,
                model_params: Some(self.settings.model_params.clone()),
                performance: Some(performance),
            },
        );
        self.sessions
            .replace_message(session_id, final_reply.clone())
            .await?;

        if !text.is_empty() {
            self.cache.put(query, &text).await;
            let key = format!("fact_{}", final_reply.id);
            if let Err(e) = self.memories.set_memory(&key, &text, session_id, 1.0).await {
                warn!(error = %e, "Failed to remember reply");
            }
        }

        info!(
            session_id = %session_id,
            fragments,
            elapsed_ms = total.as_millis() as u64,
            "Turn completed"
        );
        self.events.publish(ChatEvent::TurnCompleted {
            session_id: session_id.to_string(),
            message_id: final_reply.id.clone(),
            fragments,
            timestamp: Utc::now(),
        });
        Ok(TurnOutcome::Generated(final_reply))
    }

    /// Leave the failure visible in place of the reply and try to recover.
    async fn fail_turn(&self, session_id: &SessionId, placeholder: &Message, e: EngineError) -> Error {
        warn!(session_id = %session_id, error = %e, "Generation failed");
        let visible = placeholder.successor(format!("Error: {e}"), placeholder.metadata.clone());
        if let Err(se) = self.sessions.replace_message(session_id, visible).await {
            warn!(error = %se, "Failed to record generation error");
        }
        if e.is_recoverable() {
            warn!("Clearing the native cache to recover");
            if let Err(ce) = self.bridge.clear_cache().await {
                warn!(error = %ce, "Cache clear recovery failed");
            }
        }
        self.events.publish(ChatEvent::ErrorOccurred {
            context: "generate".into(),
            error_message: e.to_string(),
            timestamp: Utc::now(),
        });
        Error::Engine(e)
    }

    async fn retract(&self, session_id: &SessionId, placeholder_id: &str, user_id: &str) {
        for id in [placeholder_id, user_id] {
            if let Err(e) = self.sessions.remove_message_from(session_id, id).await {
                debug!(error = %e, "Nothing to retract");
            }
        }
        info!(session_id = %session_id, "Turn cancelled");
        self.events.publish(ChatEvent::TurnCancelled {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn fresh_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        match self.cancel.lock() {
            Ok(mut slot) => *slot = token.clone(),
            Err(poisoned) => *poisoned.into_inner() = token.clone(),
        }
        token
    }

    /// Abandon the in-flight generation, if any.
    pub fn cancel(&self) {
        match self.cancel.lock() {
            Ok(slot) => slot.cancel(),
            Err(poisoned) => poisoned.into_inner().cancel(),
        }
    }

    /// Cancel the in-flight turn, reset the native cache, and empty the
    /// active session's messages and memories.
    pub async fn clear(&self) -> Result<()> {
        self.cancel();
        let _turn = self.turn_lock.lock().await;

        match self.bridge.clear_cache().await {
            Ok(()) | Err(EngineError::InvalidState(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let Some(session_id) = self.sessions.active_id() else {
            return Ok(());
        };
        self.sessions.clear_messages(&session_id).await?;
        let forgotten = self.memories.clear_session_memories(&session_id).await?;
        info!(session_id = %session_id, forgotten, "Conversation cleared");
        Ok(())
    }

    // --- Engine lifecycle ---

    /// Load a model and leave a notice in the conversation.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let _turn = self.turn_lock.lock().await;
        let outcome = self.bridge.load(path).await;
        let notice = match &outcome {
            Ok(()) => format!("Loaded {}", path.display()),
            Err(e) => e.to_string(),
        };
        self.notice(&notice).await;
        match outcome {
            Ok(()) => {
                self.events.publish(ChatEvent::EngineStateChanged {
                    loaded: true,
                    model_path: Some(path.display().to_string()),
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            Err(e) => {
                self.publish_error("load", &e);
                Err(e.into())
            }
        }
    }

    pub async fn unload(&self) -> Result<()> {
        self.cancel();
        let _turn = self.turn_lock.lock().await;
        let was_loaded = self.bridge.is_loaded();
        self.bridge.unload().await?;
        if was_loaded {
            self.notice("Model unloaded").await;
            self.events.publish(ChatEvent::EngineStateChanged {
                loaded: false,
                model_path: None,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    /// Run a warm-up benchmark, then the standard one if the warm-up was quick.
    pub async fn bench(&self, pp: u32, tg: u32, pl: u32, nr: u32) -> Result<BenchOutcome> {
        let _turn = self.turn_lock.lock().await;

        let started = Instant::now();
        let warmup = self.bridge.bench(BenchParams::new(pp, tg, pl, nr)).await;
        let warmup_secs = started.elapsed().as_secs_f64();
        let warmup_report = match warmup {
            Ok(report) => report,
            Err(e) => {
                self.notice(&e.to_string()).await;
                self.publish_error("bench", &e);
                return Err(e.into());
            }
        };
        self.notice(&warmup_report).await;
        self.notice(&format!("Warm up time: {warmup_secs:.2} sec, please wait..."))
            .await;

        if warmup_secs > self.settings.bench_warmup_limit.as_secs_f64() {
            self.notice("Warm up time too long, aborting benchmark").await;
            return Ok(BenchOutcome {
                warmup_secs,
                warmup_report,
                report: None,
            });
        }

        let report = match self.bridge.bench(BenchParams::new(512, 128, 1, 3)).await {
            Ok(report) => report,
            Err(e) => {
                self.notice(&e.to_string()).await;
                self.publish_error("bench", &e);
                return Err(e.into());
            }
        };
        self.notice(&report).await;
        Ok(BenchOutcome {
            warmup_secs,
            warmup_report,
            report: Some(report),
        })
    }

    /// Append a SYSTEM message to the active session.
    async fn notice(&self, text: &str) {
        let session_id = self.ensure_session().await;
        let message = Message::new(Sender::System, text, estimate_tokens(text));
        if let Err(e) = self.sessions.append_message_to(&session_id, message).await {
            warn!(error = %e, "Failed to append notice");
        }
    }

    fn publish_error(&self, context: &str, e: &EngineError) {
        self.events.publish(ChatEvent::ErrorOccurred {
            context: context.into(),
            error_message: e.to_string(),
            timestamp: Utc::now(),
        });
    }
}

impl Drop for ChatOrchestrator {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llamachat_config::{CacheConfig, ContextConfig, TemplateKind};
    use llamachat_engine::BridgeConfig;
    use llamachat_engine::testing::{ScriptedBackend, ScriptedLog, SharedLog};

    fn orchestrator(backend: ScriptedBackend) -> (Arc<ChatOrchestrator>, SharedLog) {
        let log = backend.log();
        let bridge = EngineBridge::spawn(backend, BridgeConfig::default()).unwrap();
        let assembler = ContextAssembler::new(ContextConfig::default(), TemplateKind::Plain);
        let orch = ChatOrchestrator::new(
            Arc::new(bridge),
            Arc::new(SessionStore::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(ResponseCache::new(CacheConfig::default())),
            assembler,
        );
        (Arc::new(orch), log)
    }

    async fn loaded(backend: ScriptedBackend) -> (Arc<ChatOrchestrator>, SharedLog) {
        let (orch, log) = orchestrator(backend);
        orch.load("/models/test.gguf").await.unwrap();
        (orch, log)
    }

    fn texts(orch: &ChatOrchestrator) -> Vec<(Sender, String)> {
        orch.messages()
            .into_iter()
            .map(|m| (m.sender, m.text))
            .collect()
    }

    fn chat_texts(orch: &ChatOrchestrator) -> Vec<(Sender, String)> {
        texts(orch)
            .into_iter()
            .filter(|(s, _)| *s != Sender::System)
            .collect()
    }

    #[tokio::test]
    async fn generated_turn_appends_reply_and_updates_stores() {
        let (orch, log) = loaded(ScriptedBackend::new(["Par", "is", "."])).await;

        let outcome = orch.send("Capital of France?").await.unwrap();
        let reply = outcome.reply().unwrap().clone();
        assert!(matches!(outcome, TurnOutcome::Generated(_)));
        assert_eq!(reply.text, "Paris.");

        assert_eq!(
            chat_texts(&orch),
            vec![
                (Sender::User, "Capital of France?".to_string()),
                (Sender::Ai, "Paris.".to_string()),
            ]
        );

        let perf = reply.metadata.performance.clone().unwrap();
        assert_eq!(perf.response_token_count, 3);
        assert!(!reply.metadata.context_references.is_empty());
        assert!(reply.metadata.model_params.is_some());

        assert_eq!(
            orch.cache().find_similar_query("capital of france?").await.as_deref(),
            Some("Paris.")
        );
        let sid = orch.sessions().active_id().unwrap();
        assert_eq!(orch.memories().count(&sid).await, 1);

        let prompts = ScriptedLog::prompts(&log);
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("User: Capital of France?"));
        assert!(prompts[0].ends_with("Assistant:"));
    }

    #[tokio::test]
    async fn cache_hit_skips_the_engine() {
        let (orch, log) = orchestrator(ScriptedBackend::new(["never"]));
        orch.cache().put("hello", "hi there").await;

        let outcome = orch.send("Hello ").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Cached(_)));
        assert_eq!(outcome.reply().unwrap().text, "hi there");
        assert_eq!(
            chat_texts(&orch),
            vec![
                (Sender::User, "Hello".to_string()),
                (Sender::Ai, "hi there".to_string()),
            ]
        );
        assert!(ScriptedLog::prompts(&log).is_empty());
    }

    #[tokio::test]
    async fn fuzzy_cache_hit() {
        let (orch, log) = orchestrator(ScriptedBackend::new(["never"]));
        orch.cache().put("what's 2 plus 2", "4").await;

        let outcome = orch.send("what is 2+2").await.unwrap();
        assert_eq!(outcome.reply().unwrap().text, "4");
        assert!(ScriptedLog::prompts(&log).is_empty());
    }

    #[tokio::test]
    async fn second_identical_question_is_cached() {
        let (orch, log) = loaded(ScriptedBackend::new(["four"])).await;
        orch.send("What is two plus two").await.unwrap();
        let outcome = orch.send("what is two plus two").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Cached(_)));
        assert_eq!(ScriptedLog::prompts(&log).len(), 1);
    }

    #[tokio::test]
    async fn blank_input_is_skipped() {
        let (orch, _log) = orchestrator(ScriptedBackend::new(["x"]));
        assert_eq!(orch.send("   ").await.unwrap(), TurnOutcome::Skipped);
        assert!(orch.snapshot().sessions.is_empty());
    }

    #[tokio::test]
    async fn reply_is_trimmed_at_next_user_turn() {
        let (orch, _log) = loaded(ScriptedBackend::new(["Paris.", "\nUser:", " and Spain?"])).await;
        let outcome = orch.send("Capital?").await.unwrap();
        assert_eq!(outcome.reply().unwrap().text, "Paris.");
    }

    #[tokio::test]
    async fn empty_reply_is_not_cached_or_remembered() {
        let (orch, _log) = loaded(ScriptedBackend::new(["User: hi"])).await;
        orch.send("Say nothing").await.unwrap();
        assert!(orch.cache().is_empty().await);
        let sid = orch.sessions().active_id().unwrap();
        assert_eq!(orch.memories().count(&sid).await, 0);
    }

    #[tokio::test]
    async fn generate_without_model_leaves_error_message() {
        let (orch, _log) = orchestrator(ScriptedBackend::new(["x"]));
        let mut events = orch.events().subscribe();

        let err = orch.send("hello?").await.unwrap_err();
        assert!(err.to_string().contains("No model loaded"));

        let msgs = texts(&orch);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].0, Sender::Ai);
        assert!(msgs[1].1.contains("No model loaded"));

        let event = events.recv().await.unwrap();
        assert!(matches!(event.as_ref(), ChatEvent::ErrorOccurred { .. }));
    }

    #[tokio::test]
    async fn transport_failure_clears_native_cache() {
        let backend = ScriptedBackend::new(["a", "b", "c"])
            .error_after(1, EngineError::Transport("decode returned 1".into()));
        let (orch, log) = loaded(backend).await;

        let err = orch.send("hi there").await.unwrap_err();
        assert!(matches!(err, Error::Engine(EngineError::Transport(_))));
        assert_eq!(ScriptedLog::kv_clears(&log), 1);

        let last = orch.messages().pop().unwrap();
        assert!(last.text.starts_with("Error:"));
    }

    #[tokio::test]
    async fn other_failures_do_not_clear_cache() {
        let backend = ScriptedBackend::new(["a", "b"])
            .error_after(1, EngineError::Generation("boom".into()));
        let (orch, log) = loaded(backend).await;
        assert!(orch.send("hi there").await.is_err());
        assert_eq!(ScriptedLog::kv_clears(&log), 0);
    }

    #[tokio::test]
    async fn fragments_are_published_in_order() {
        let (orch, _log) = loaded(ScriptedBackend::new(["a", "b", "c"])).await;
        let mut events = orch.events().subscribe();
        orch.send("go").await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event.as_ref() {
                ChatEvent::Fragment { text, .. } => seen.push(text.clone()),
                ChatEvent::TurnCompleted { fragments, .. } => assert_eq!(*fragments, 3),
                _ => {}
            }
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn cancel_retracts_the_turn() {
        let backend = ScriptedBackend::new(vec!["tok"; 200]).with_delay(Duration::from_millis(5));
        let (orch, _log) = loaded(backend).await;
        let before = orch.messages().len();

        let mut events = orch.events().subscribe();
        let turn = tokio::spawn({
            let orch = orch.clone();
            async move { orch.send("tell me a long story").await }
        });
        loop {
            if let ChatEvent::Fragment { .. } = events.recv().await.unwrap().as_ref() {
                break;
            }
        }
        orch.cancel();

        assert_eq!(turn.await.unwrap().unwrap(), TurnOutcome::Cancelled);
        assert_eq!(orch.messages().len(), before);
    }

    #[tokio::test]
    async fn clear_during_stream_empties_session() {
        let backend = ScriptedBackend::new(vec!["tok"; 200]).with_delay(Duration::from_millis(5));
        let (orch, log) = loaded(backend).await;
        orch.memories()
            .set_memory("k", "remembered", &orch.sessions().active_id().unwrap(), 1.0)
            .await
            .unwrap();

        let mut events = orch.events().subscribe();
        let turn = tokio::spawn({
            let orch = orch.clone();
            async move { orch.send("tell me a long story").await }
        });
        loop {
            if let ChatEvent::Fragment { .. } = events.recv().await.unwrap().as_ref() {
                break;
            }
        }
        orch.clear().await.unwrap();

        assert_eq!(turn.await.unwrap().unwrap(), TurnOutcome::Cancelled);
        assert!(orch.messages().is_empty());
        let sid = orch.sessions().active_id().unwrap();
        assert_eq!(orch.memories().count(&sid).await, 0);
        assert_eq!(ScriptedLog::kv_clears(&log), 1);

        // The engine still serves the next turn.
        let outcome = orch.send("short one").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Generated(_)));
    }

    #[tokio::test]
    async fn clear_without_model_still_clears_messages() {
        let (orch, _log) = orchestrator(ScriptedBackend::new(["x"]));
        orch.cache().put("hello", "hi").await;
        orch.send("hello").await.unwrap();
        orch.clear().await.unwrap();
        assert!(orch.messages().is_empty());
    }

    #[tokio::test]
    async fn load_and_unload_leave_notices() {
        let (orch, _log) = orchestrator(ScriptedBackend::new(["x"]));
        let mut status = orch.bridge().subscribe_status();

        orch.load("/models/a.gguf").await.unwrap();
        assert!(status.borrow_and_update().loaded);
        let err = orch.load("/models/b.gguf").await.unwrap_err();
        assert!(err.to_string().contains("Model already loaded"));
        orch.unload().await.unwrap();
        orch.unload().await.unwrap();

        let notices: Vec<String> = texts(&orch)
            .into_iter()
            .filter(|(s, _)| *s == Sender::System)
            .map(|(_, t)| t)
            .collect();
        assert_eq!(notices.len(), 3);
        assert_eq!(notices[0], "Loaded /models/a.gguf");
        assert!(notices[1].contains("Model already loaded"));
        assert_eq!(notices[2], "Model unloaded");
    }

    #[tokio::test]
    async fn notices_are_not_sent_to_the_model() {
        let (orch, log) = loaded(ScriptedBackend::new(["ok"])).await;
        orch.send("hi").await.unwrap();
        let prompt = ScriptedLog::prompts(&log).pop().unwrap();
        assert!(!prompt.contains("Loaded /models/test.gguf"));
    }

    #[tokio::test]
    async fn bench_runs_warmup_then_standard() {
        let (orch, log) = loaded(ScriptedBackend::new(["x"])).await;
        let outcome = orch.bench(8, 4, 1, 1).await.unwrap();
        assert!(outcome.warmup_report.contains("pp 8"));
        assert!(outcome.report.unwrap().contains("pp 512"));
        assert_eq!(
            ScriptedLog::calls(&log).iter().filter(|c| *c == "bench").count(),
            2
        );
    }

    #[tokio::test]
    async fn slow_warmup_aborts_bench() {
        let backend = ScriptedBackend::new(["x"]).with_delay(Duration::from_millis(30));
        let (orch, log) = orchestrator(backend);
        let orch = Arc::into_inner(orch).unwrap().with_settings(ChatSettings {
            bench_warmup_limit: Duration::from_millis(1),
            ..ChatSettings::default()
        });
        orch.load("/models/test.gguf").await.unwrap();

        let outcome = orch.bench(8, 4, 1, 1).await.unwrap();
        assert!(outcome.report.is_none());
        assert_eq!(
            ScriptedLog::calls(&log).iter().filter(|c| *c == "bench").count(),
            1
        );
        let last = orch.messages().pop().unwrap();
        assert!(last.text.contains("aborting"));
    }

    #[tokio::test]
    async fn bench_without_model_fails_with_notice() {
        let (orch, _log) = orchestrator(ScriptedBackend::new(["x"]));
        let err = orch.bench(8, 4, 1, 1).await.unwrap_err();
        assert!(err.to_string().contains("No model loaded"));
        assert!(orch.messages().pop().unwrap().text.contains("No model loaded"));
    }

    #[tokio::test]
    async fn send_draft_takes_and_clears_the_field() {
        let (orch, _log) = orchestrator(ScriptedBackend::new(["x"]));
        orch.cache().put("hello", "hi there").await;
        let mut draft = orch.subscribe_draft();

        orch.update_draft("hello");
        assert_eq!(orch.draft(), "hello");
        orch.send_draft().await.unwrap();

        assert_eq!(orch.draft(), "");
        assert!(draft.has_changed().unwrap());
        assert_eq!(orch.messages().len(), 2);
    }

    #[tokio::test]
    async fn memories_from_earlier_turns_reach_the_prompt() {
        let (orch, log) = loaded(ScriptedBackend::new(["noted"])).await;
        let sid = orch.sessions().active_id().unwrap();
        orch.memories()
            .set_memory("city", "The user lives in Lyon", &sid, 1.0)
            .await
            .unwrap();

        orch.send("Which city do I live in?").await.unwrap();
        let prompt = ScriptedLog::prompts(&log).pop().unwrap();
        assert!(prompt.contains("Relevant context:\n- The user lives in Lyon"));
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let (orch, _log) = loaded(ScriptedBackend::new(["ok"])).await;
        let first = orch.sessions().active_id().unwrap();
        orch.send("first question").await.unwrap();

        let second = orch.new_session(Some("Second")).await;
        assert_ne!(first, second);
        assert!(orch.messages().is_empty());

        orch.switch_session(&first).await.unwrap();
        assert_eq!(chat_texts(&orch).len(), 2);
        assert!(orch.switch_session(&SessionId::from("nope")).await.is_err());
    }

    #[tokio::test]
    async fn engine_chat_wrapping_applies_only_to_plain_prompts() {
        for (template, expected) in [
            (TemplateKind::Plain, true),
            (TemplateKind::ChatML, false),
            (TemplateKind::Llama3, false),
        ] {
            let backend = ScriptedBackend::new(["ok"]);
            let log = backend.log();
            let bridge = EngineBridge::spawn(backend, BridgeConfig::default()).unwrap();
            let orch = ChatOrchestrator::new(
                Arc::new(bridge),
                Arc::new(SessionStore::new()),
                Arc::new(MemoryStore::new()),
                Arc::new(ResponseCache::new(CacheConfig::default())),
                ContextAssembler::new(ContextConfig::default(), template),
            )
            .with_settings(ChatSettings {
                format_chat: true,
                ..ChatSettings::default()
            });
            orch.load("/models/test.gguf").await.unwrap();

            orch.send("hello").await.unwrap();
            assert_eq!(ScriptedLog::format_flags(&log), vec![expected], "{template:?}");
        }
    }
}
