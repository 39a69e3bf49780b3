//! Dedicated threads running an event loop.
//!
//! An [`EventThread`] spawns a thread that immediately enters
//! [`ThreadData::exec`]. Objects moved to it receive their queued and
//! blocking-queued deliveries there, and arbitrary closures can be run on it
//! with [`invoke`](EventThread::invoke) and
//! [`invoke_blocking`](EventThread::invoke_blocking).
//!
//! # Example
//!
//! ```
//! use horizon_signals::event_thread::EventThread;
//!
//! let thread = EventThread::new().unwrap();
//! let name = thread.invoke_blocking(|| std::thread::current().name().map(str::to_owned));
//! assert_eq!(name, Some(Some("horizon-event-thread".to_owned())));
//! thread.stop_and_join();
//! ```

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::bounded;
use parking_lot::Mutex;

use crate::error::ThreadError;
use crate::invocation::{QueuedInvocation, completion_pair};
use crate::logging::targets;
use crate::thread_data::ThreadData;

/// Thread name used when none is configured.
pub const DEFAULT_THREAD_NAME: &str = "horizon-event-thread";

/// Configuration for creating an [`EventThread`].
#[derive(Debug, Clone, Default)]
pub struct EventThreadConfig {
    /// Name for the thread. `None` uses [`DEFAULT_THREAD_NAME`].
    pub name: Option<String>,
    /// Stack size for the thread in bytes. `None` uses the default.
    pub stack_size: Option<usize>,
}

impl EventThreadConfig {
    /// Create a new configuration with the given thread name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Builder for creating event threads with custom configuration.
#[derive(Debug, Default)]
pub struct EventThreadBuilder {
    config: EventThreadConfig,
}

impl EventThreadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Set the stack size for the thread.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    /// Spawn the thread and wait until its event loop is running.
    pub fn build(self) -> Result<EventThread, ThreadError> {
        EventThread::with_config(self.config)
    }
}

/// A thread running an event loop until asked to quit.
///
/// Dropping the handle stops the loop and joins the thread. Events still
/// queued when the loop stops are discarded.
pub struct EventThread {
    thread_data: Arc<ThreadData>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventThread {
    /// Spawn an event thread with default configuration.
    pub fn new() -> Result<Self, ThreadError> {
        Self::with_config(EventThreadConfig::default())
    }

    /// Spawn an event thread with custom configuration.
    pub fn with_config(config: EventThreadConfig) -> Result<Self, ThreadError> {
        let name = config.name.unwrap_or_else(|| DEFAULT_THREAD_NAME.to_owned());
        let mut builder = thread::Builder::new().name(name);
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let (ready_tx, ready_rx) = bounded(1);
        let handle = builder
            .spawn(move || {
                let data = ThreadData::current();
                if ready_tx.send(data.clone()).is_err() {
                    return;
                }
                drop(ready_tx);
                data.exec();
            })
            .map_err(ThreadError::Spawn)?;

        let thread_data = ready_rx.recv().map_err(|_| {
            ThreadError::Spawn(io::Error::other("event thread exited during startup"))
        })?;
        tracing::debug!(target: targets::THREAD, thread = %thread_data, "event thread started");

        Ok(Self {
            thread_data,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// The token of the spawned thread, for
    /// [`ObjectBase::move_to_thread`](crate::ObjectBase::move_to_thread).
    pub fn thread_data(&self) -> &Arc<ThreadData> {
        &self.thread_data
    }

    /// Whether the event loop is still accepting events.
    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some() && !self.thread_data.is_finished()
    }

    /// Run `f` on the event thread. Returns `false` if the thread has exited.
    pub fn invoke<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.thread_data.post_invocation(QueuedInvocation::new(f))
    }

    /// Run `f` on the event thread and wait for its result.
    ///
    /// Called from the event thread itself, `f` runs inline. Returns `None`
    /// if the thread exits before running `f`.
    pub fn invoke_blocking<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.thread_data.is_current() {
            return Some(f());
        }
        let (handle, waiter) = completion_pair();
        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        let invocation =
            QueuedInvocation::with_completion(move || *slot.lock() = Some(f()), handle);
        if !self.thread_data.post_invocation(invocation) {
            return None;
        }
        // Also released if the thread exits and drops the invocation unrun.
        waiter.wait();
        result.lock().take()
    }

    /// Ask the event loop to return once the events already queued have run.
    pub fn quit(&self) {
        self.thread_data.quit();
    }

    /// Wait for the thread to finish.
    ///
    /// Returns `true` if the thread was joined, `false` if already joined,
    /// called from the event thread itself, or the thread panicked.
    pub fn join(&self) -> bool {
        if self.thread_data.is_current() {
            tracing::warn!(
                target: targets::THREAD,
                thread = %self.thread_data,
                "an event thread cannot join itself"
            );
            return false;
        }
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => handle.join().is_ok(),
            None => false,
        }
    }

    /// Quit the event loop and wait for the thread to finish.
    pub fn stop_and_join(&self) -> bool {
        self.quit();
        self.join()
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.quit();
        if !self.thread_data.is_current() {
            self.join();
        }
    }
}

impl std::fmt::Debug for EventThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventThread")
            .field("thread", &self.thread_data.to_string())
            .field("running", &self.is_running())
            .finish()
    }
}
