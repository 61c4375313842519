//! Context assembler: turns session history into a bounded prompt.
//!
//! # Sliding window
//!
//! 1. The system prompt is always included; its cost comes off the budget.
//! 2. The most recent user message is always included, even if that takes
//!    the running budget below zero.
//! 3. Related memories are packed next as a "Relevant context" segment.
//! 4. The rest of the history is scanned newest to oldest. A message is
//!    included only if its cost fits what is left; the first message that
//!    does not fit ends the scan.
//! 5. Included messages are emitted in chronological order.
//!
//! SYSTEM-sender messages are notices for the reader and are never packed.
//! The prompt ends with an assistant cue only when the newest message is
//! the user's.
//!
//! Assembly is deterministic: identical inputs give identical prompts.

use crate::summary::{NoSummarizer, Summarizer};
use crate::template::PromptTemplate;
use crate::token::{estimate_tokens, message_cost};
use llamachat_config::{ContextConfig, ContextStrategy, TemplateKind};
use llamachat_core::message::{Message, Sender};
use std::collections::BTreeSet;
use std::sync::Arc;

const MEMORY_HEADER: &str = "Relevant context:\n";
const SUMMARY_HEADER: &str = "Summary of the earlier conversation:\n";

/// A rendered prompt plus what went into it.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    pub text: String,

    /// Ids of the history messages included, oldest first
    pub message_ids: Vec<String>,

    /// Estimated cost of everything packed
    pub estimated_tokens: usize,

    pub memories_included: usize,

    pub summarized: bool,
}

pub struct ContextAssembler {
    config: ContextConfig,
    template: PromptTemplate,
    summarizer: Arc<dyn Summarizer>,
}

impl ContextAssembler {
    pub fn new(config: ContextConfig, template: TemplateKind) -> Self {
        Self {
            config,
            template: PromptTemplate::new(template),
            summarizer: Arc::new(NoSummarizer),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Build the prompt for `messages` (a session's history, oldest first).
    pub fn assemble(&self, messages: &[Message], memories: &[String]) -> AssembledPrompt {
        match self.config.strategy {
            ContextStrategy::SlidingWindow => self.sliding_window(messages, memories),
            ContextStrategy::Summary => self.summary(messages, memories),
        }
    }

    fn sliding_window(&self, messages: &[Message], memories: &[String]) -> AssembledPrompt {
        let system_cost = estimate_tokens(&self.config.system_prompt);
        let mut budget = self.config.max_tokens as isize - system_cost as isize;
        let mut used = system_cost;

        let reserved = messages.iter().rposition(|m| m.sender == Sender::User);
        let mut included = BTreeSet::new();
        if let Some(i) = reserved {
            let cost = message_cost(&messages[i]);
            budget -= cost as isize;
            used += cost;
            included.insert(i);
        }

        let (memory_section, memory_count, memory_cost) = pack_memories(memories, budget);
        budget -= memory_cost as isize;
        used += memory_cost;

        for (i, message) in messages.iter().enumerate().rev() {
            if Some(i) == reserved || message.sender == Sender::System {
                continue;
            }
            let cost = message_cost(message);
            if cost as isize > budget {
                break;
            }
            budget -= cost as isize;
            used += cost;
            included.insert(i);
        }

        let mut prompt = self.render(messages, &included, memory_section.as_deref(), None);
        prompt.estimated_tokens = used;
        prompt.memories_included = memory_count;
        prompt
    }

    fn summary(&self, messages: &[Message], memories: &[String]) -> AssembledPrompt {
        let history: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.sender != Sender::System)
            .map(|(i, _)| i)
            .collect();
        let window_start = history.len().saturating_sub(self.config.n_context);
        let mut included: BTreeSet<usize> = history[window_start..].iter().copied().collect();
        if let Some(i) = messages.iter().rposition(|m| m.sender == Sender::User) {
            included.insert(i);
        }

        let synopsis = if history.len() > self.config.summary_interval && window_start > 0 {
            let older: Vec<Message> = history[..window_start]
                .iter()
                .map(|&i| messages[i].clone())
                .collect();
            self.summarizer.summarize(&older)
        } else {
            None
        };

        let memory_section = (!memories.is_empty()).then(|| render_memories(memories));
        let mut prompt = self.render(
            messages,
            &included,
            memory_section.as_deref(),
            synopsis.as_deref(),
        );
        prompt.estimated_tokens = estimate_tokens(&self.config.system_prompt)
            + memory_section.as_deref().map_or(0, estimate_tokens)
            + synopsis.as_deref().map_or(0, estimate_tokens)
            + included.iter().map(|&i| message_cost(&messages[i])).sum::<usize>();
        prompt.memories_included = memories.len();
        prompt.summarized = synopsis.is_some();
        prompt
    }

    fn render(
        &self,
        messages: &[Message],
        included: &BTreeSet<usize>,
        memory_section: Option<&str>,
        synopsis: Option<&str>,
    ) -> AssembledPrompt {
        let t = &self.template;
        let mut text = String::from(t.preamble());
        text.push_str(&t.segment(Sender::System, &self.config.system_prompt));
        if let Some(section) = memory_section {
            text.push_str(&t.segment(Sender::System, section));
        }
        if let Some(synopsis) = synopsis {
            text.push_str(&t.segment(Sender::System, &format!("{SUMMARY_HEADER}{synopsis}")));
        }

        let mut message_ids = Vec::with_capacity(included.len());
        for &i in included {
            let m = &messages[i];
            text.push_str(&t.segment(m.sender, &m.text));
            message_ids.push(m.id.clone());
        }

        let users_turn = messages
            .iter()
            .rev()
            .find(|m| m.sender != Sender::System)
            .is_some_and(|m| m.sender == Sender::User);
        if users_turn {
            text.push_str(t.assistant_cue());
        }

        AssembledPrompt {
            text,
            message_ids,
            estimated_tokens: 0,
            memories_included: 0,
            summarized: false,
        }
    }
}

fn render_memories(memories: &[String]) -> String {
    let mut section = String::from(MEMORY_HEADER);
    for m in memories {
        section.push_str(&format!("- {m}\n"));
    }
    section
}

/// Pack memory lines into what is left of the budget, best first.
/// Returns the section, how many lines made it, and its cost.
fn pack_memories(memories: &[String], budget: isize) -> (Option<String>, usize, usize) {
    let header_cost = estimate_tokens(MEMORY_HEADER);
    if memories.is_empty() || header_cost as isize >= budget {
        return (None, 0, 0);
    }
    let mut section = String::from(MEMORY_HEADER);
    let mut cost = header_cost;
    let mut count = 0;
    for m in memories {
        let line = format!("- {m}\n");
        let line_cost = estimate_tokens(&line);
        if (cost + line_cost) as isize <= budget {
            section.push_str(&line);
            cost += line_cost;
            count += 1;
        }
    }
    if count == 0 {
        return (None, 0, 0);
    }
    (Some(section), count, cost)
}
