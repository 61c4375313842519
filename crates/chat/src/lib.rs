//! Conversation layer for llamachat.
//!
//! Turns a session's history into a bounded prompt ([`ContextAssembler`])
//! and drives each user turn through cache, engine and stores
//! ([`ChatOrchestrator`]).

pub mod assembler;
pub mod orchestrator;
pub mod summary;
pub mod template;
pub mod token;

pub use assembler::{AssembledPrompt, ContextAssembler};
pub use orchestrator::{BenchOutcome, ChatOrchestrator, ChatSettings, TurnOutcome};
pub use summary::{NoSummarizer, Summarizer};
pub use template::PromptTemplate;
pub use token::estimate_tokens;
