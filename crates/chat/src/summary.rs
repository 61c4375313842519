//! Summarization hook for the `summary` context strategy.
//!
//! No summarization algorithm ships with llamachat. Without a
//! [`Summarizer`] that returns a synopsis, the summary strategy renders
//! the recent message window verbatim with no token budget.

use llamachat_core::message::Message;

pub trait Summarizer: Send + Sync {
    /// Condense `older` (everything before the recent window) into a synopsis.
    fn summarize(&self, older: &[Message]) -> Option<String>;
}

/// The default: never summarizes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSummarizer;

impl Summarizer for NoSummarizer {
    fn summarize(&self, _older: &[Message]) -> Option<String> {
        None
    }
}

impl<F> Summarizer for F
where
    F: Fn(&[Message]) -> Option<String> + Send + Sync,
{
    fn summarize(&self, older: &[Message]) -> Option<String> {
        self(older)
    }
}
