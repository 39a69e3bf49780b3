//! Deferred closures and the completion rendezvous used for blocking delivery.
//!
//! A blocking-queued activation posts its message together with a
//! [`CompletionHandle`] and parks on the matching [`CompletionWaiter`] until
//! the receiver's thread has run the slot. The handle signals completion when
//! it is dropped, so a message that is discarded instead of delivered (the
//! receiver died, the target thread shut down) still releases the emitter.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// A type-erased closure to be run on another thread's event loop.
pub struct QueuedInvocation {
    invoke: Box<dyn FnOnce() + Send>,
    completion: Option<CompletionHandle>,
}

impl QueuedInvocation {
    /// Create a new queued invocation.
    pub fn new<F>(invoke: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            invoke: Box::new(invoke),
            completion: None,
        }
    }

    /// Create a queued invocation that releases `completion` once it has run.
    pub fn with_completion<F>(invoke: F, completion: CompletionHandle) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            invoke: Box::new(invoke),
            completion: Some(completion),
        }
    }

    /// Execute the invocation.
    pub fn execute(self) {
        let Self { invoke, completion } = self;
        invoke();
        drop(completion);
    }
}

impl std::fmt::Debug for QueuedInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedInvocation")
            .field("blocking", &self.completion.is_some())
            .finish_non_exhaustive()
    }
}

struct CompletionState {
    done: Mutex<bool>,
    condvar: Condvar,
}

/// Releases a [`CompletionWaiter`] when signaled or dropped.
pub struct CompletionHandle {
    inner: Arc<CompletionState>,
}

impl CompletionHandle {
    /// Signal that the work is complete.
    pub fn signal_done(self) {
        drop(self);
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        let mut done = self.inner.done.lock();
        *done = true;
        self.inner.condvar.notify_all();
    }
}

/// Blocks until the paired [`CompletionHandle`] is released.
pub struct CompletionWaiter {
    inner: Arc<CompletionState>,
}

impl CompletionWaiter {
    /// Wait for completion.
    ///
    /// Waiting on the thread that is supposed to release the handle never
    /// returns.
    pub fn wait(self) {
        let mut done = self.inner.done.lock();
        while !*done {
            self.inner.condvar.wait(&mut done);
        }
    }
}

/// Create a completion handle/waiter pair.
pub fn completion_pair() -> (CompletionHandle, CompletionWaiter) {
    let state = Arc::new(CompletionState {
        done: Mutex::new(false),
        condvar: Condvar::new(),
    });

    (
        CompletionHandle {
            inner: state.clone(),
        },
        CompletionWaiter { inner: state },
    )
}
