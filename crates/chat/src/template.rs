//! Role templates used to render prompts.

use llamachat_config::TemplateKind;
use llamachat_core::message::Sender;

/// Renders role-tagged segments for one template family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptTemplate {
    kind: TemplateKind,
}

impl PromptTemplate {
    pub fn new(kind: TemplateKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> TemplateKind {
        self.kind
    }

    /// Whether rendered prompts already carry model role markers.
    pub fn is_role_tagged(&self) -> bool {
        !matches!(self.kind, TemplateKind::Plain)
    }

    /// Text placed before the first segment.
    pub fn preamble(&self) -> &'static str {
        match self.kind {
            TemplateKind::Llama3 => "<|begin_of_text|>",
            TemplateKind::ChatML | TemplateKind::Plain => "",
        }
    }

    /// One role-tagged segment.
    pub fn segment(&self, sender: Sender, text: &str) -> String {
        match self.kind {
            TemplateKind::Llama3 => format!(
                "<|start_header_id|>{}<|end_header_id|>\n\n{text}<|eot_id|>",
                role_name(sender)
            ),
            TemplateKind::ChatML => {
                format!("<|im_start|>{}\n{text}<|im_end|>\n", role_name(sender))
            }
            TemplateKind::Plain => format!("{}: {text}\n", plain_label(sender)),
        }
    }

    /// Cue that hands the turn to the assistant.
    pub fn assistant_cue(&self) -> &'static str {
        match self.kind {
            TemplateKind::Llama3 => "<|start_header_id|>assistant<|end_header_id|>\n\n",
            TemplateKind::ChatML => "<|im_start|>assistant\n",
            TemplateKind::Plain => "Assistant:",
        }
    }

    /// Markers that start a new turn when they show up inside a reply.
    fn turn_markers(&self) -> &'static [&'static str] {
        match self.kind {
            TemplateKind::Llama3 => &["<|eot_id|>", "<|start_header_id|>", "\nUser:"],
            TemplateKind::ChatML => &["<|im_end|>", "<|im_start|>", "\nUser:"],
            TemplateKind::Plain => &["\nUser:", "\nSystem:"],
        }
    }

    /// Cut a generated reply at the first sign of a new turn and trim it.
    pub fn trim_reply<'a>(&self, reply: &'a str) -> &'a str {
        let reply = reply.strip_prefix("User:").map_or(reply, |_| "");
        let cut = self
            .turn_markers()
            .iter()
            .filter_map(|m| reply.find(m))
            .min()
            .unwrap_or(reply.len());
        reply[..cut].trim()
    }
}

fn role_name(sender: Sender) -> &'static str {
    match sender {
        Sender::User => "user",
        Sender::Ai => "assistant",
        Sender::System => "system",
    }
}

fn plain_label(sender: Sender) -> &'static str {
    match sender {
        Sender::User => "User",
        Sender::Ai => "Assistant",
        Sender::System => "System",
    }
}
