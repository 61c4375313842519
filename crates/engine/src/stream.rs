//! The fragment stream handed out by [`crate::EngineBridge::generate`].

use futures::Stream;
use llamachat_core::EngineError;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

type Start = Box<dyn FnOnce() -> Result<(), EngineError> + Send>;

/// A lazy, finite, non-restartable sequence of generated text fragments.
///
/// The generation job is submitted on the first poll. Each poll that finds
/// no fragment waiting sends one pull to the worker, which then runs one
/// completion step. Dropping the stream abandons the generation: the worker
/// sees the pull channel close and returns to waiting for jobs.
pub struct TokenStream {
    start: Option<Start>,
    pulls: Option<mpsc::Sender<()>>,
    pulled: bool,
    inner: ReceiverStream<Result<String, EngineError>>,
}

impl TokenStream {
    pub(crate) fn new(
        start: impl FnOnce() -> Result<(), EngineError> + Send + 'static,
        pulls: mpsc::Sender<()>,
        fragments: mpsc::Receiver<Result<String, EngineError>>,
    ) -> Self {
        Self {
            start: Some(Box::new(start)),
            pulls: Some(pulls),
            pulled: false,
            inner: ReceiverStream::new(fragments),
        }
    }
}

impl Stream for TokenStream {
    type Item = Result<String, EngineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if let Some(start) = this.start.take() {
            if let Err(e) = start() {
                this.pulls = None;
                return Poll::Ready(Some(Err(e)));
            }
        }
        if !this.pulled {
            if let Some(pulls) = &this.pulls {
                // At most one pull is outstanding, so the slot is free
                let _ = pulls.try_send(());
            }
            this.pulled = true;
        }
        let item = Pin::new(&mut this.inner).poll_next(cx);
        if item.is_ready() {
            this.pulled = false;
        }
        item
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream").finish_non_exhaustive()
    }
}
