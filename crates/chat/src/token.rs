//! Token estimation.
//!
//! Character heuristic: one token is about four bytes of text, rounded up.
//! Prompt packing only needs a consistent approximation, not the model's
//! real tokenizer.

use llamachat_core::message::Message;

/// Estimate the token count for a string.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4)
}

/// Cost of a message when packed into a prompt.
pub fn message_cost(message: &Message) -> usize {
    estimate_tokens(&message.text)
}
