//! Callback dispatch targets.
//!
//! Completion callbacks (today: the completion barrier's) are never invoked
//! from a worker thread. They fire from the driving thread's `tick`, either
//! inline or routed through a `CallbackHandler` onto a caller-chosen
//! execution context.

use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};

/// A completion callback.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Delivers completion callbacks on a caller-chosen execution context.
pub trait CallbackHandler: Send + Sync {
    fn post(&self, callback: Callback);
}

/// Runs callbacks inline on whichever thread posts them — with the compiler
/// service, that is the driving thread during `tick`.
pub struct InlineHandler;

impl CallbackHandler for InlineHandler {
    fn post(&self, callback: Callback) {
        callback();
    }
}

/// Queues callbacks on a channel for another thread to drain.
pub struct ChannelHandler {
    sender: Sender<Callback>,
}

impl ChannelHandler {
    /// Create the handler plus the receiver its callbacks arrive on.
    pub fn new() -> (Arc<Self>, Receiver<Callback>) {
        let (sender, receiver) = unbounded();
        (Arc::new(Self { sender }), receiver)
    }
}

impl CallbackHandler for ChannelHandler {
    fn post(&self, callback: Callback) {
        // receiver dropped means nobody wants the callback anymore
        let _ = self.sender.send(callback);
    }
}
