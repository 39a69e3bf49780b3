//! Thread affinity tokens and per-thread event queues.
//!
//! Every thread that touches the object system gets a [`ThreadData`], created
//! lazily the first time [`ThreadData::current`] is called on it. Objects
//! record the `ThreadData` of the thread they live in; connection records keep
//! a reference to their receiver's `ThreadData` so an emitter can decide
//! between a direct call and a queued one without touching the receiver.
//!
//! A `ThreadData` also owns that thread's queue of posted events. The queue
//! is strictly FIFO, which is what gives queued connections their ordering
//! guarantee. Events are only run when the owning thread calls
//! [`process_events`](ThreadData::process_events) or [`exec`](ThreadData::exec).
//!
//! When a thread exits, its queue is closed: pending events are dropped
//! (releasing any emitter blocked on them) and later posts are refused.
//!
//! An object can also live in no thread at all ([`ThreadData::detached`]).
//! Events posted to it wait until it is pulled into a real thread.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::event::PostedEvent;
use crate::invocation::QueuedInvocation;
use crate::logging::targets;

static NEXT_THREAD_SERIAL: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct PostEventList {
    events: VecDeque<PostedEvent>,
    quit: bool,
    finished: bool,
}

/// Identity and event queue of one thread.
pub struct ThreadData {
    serial: u64,
    thread_id: Option<ThreadId>,
    name: Option<String>,
    queue: Mutex<PostEventList>,
    wakeup: Condvar,
}

struct CurrentThreadData(Arc<ThreadData>);

impl Drop for CurrentThreadData {
    fn drop(&mut self) {
        self.0.finish();
    }
}

thread_local! {
    static CURRENT: CurrentThreadData = CurrentThreadData(Arc::new(ThreadData::new(
        Some(thread::current().id()),
        thread::current().name().map(str::to_owned),
    )));
}

impl ThreadData {
    fn new(thread_id: Option<ThreadId>, name: Option<String>) -> Self {
        Self {
            serial: NEXT_THREAD_SERIAL.fetch_add(1, Ordering::Relaxed),
            thread_id,
            name,
            queue: Mutex::new(PostEventList::default()),
            wakeup: Condvar::new(),
        }
    }

    /// The calling thread's token.
    ///
    /// During thread-local teardown the thread no longer has a token, and a
    /// fresh detached one is returned instead.
    pub fn current() -> Arc<Self> {
        CURRENT
            .try_with(|current| current.0.clone())
            .unwrap_or_else(|_| Self::detached())
    }

    /// A token that belongs to no thread.
    pub fn detached() -> Arc<Self> {
        Arc::new(Self::new(None, None))
    }

    /// The owning thread, or `None` for a detached token.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread_id
    }

    /// The owning thread's name, if it had one when the token was created.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether the calling thread owns this token.
    #[inline]
    pub fn is_current(&self) -> bool {
        self.thread_id == Some(thread::current().id())
    }

    /// Whether this token belongs to no thread.
    pub fn is_detached(&self) -> bool {
        self.thread_id.is_none()
    }

    /// Whether the owning thread has exited.
    pub fn is_finished(&self) -> bool {
        self.queue.lock().finished
    }

    /// Number of events waiting to be processed.
    pub fn pending_events(&self) -> usize {
        self.queue.lock().events.len()
    }

    /// Appends an event to the queue.
    ///
    /// If the thread has exited the event is handed back, so a caller holding
    /// a pool lock can drop it after unlocking.
    pub(crate) fn post(&self, event: PostedEvent) -> Result<(), PostedEvent> {
        let mut list = self.queue.lock();
        if list.finished {
            drop(list);
            tracing::debug!(
                target: targets::THREAD,
                thread = %self,
                "refusing event posted to a finished thread"
            );
            return Err(event);
        }
        list.events.push_back(event);
        self.wakeup.notify_one();
        Ok(())
    }

    /// Queues a closure to run on this thread. Returns `false`, dropping the
    /// closure, if the thread has exited.
    pub fn post_invocation(&self, invocation: QueuedInvocation) -> bool {
        self.post(PostedEvent::invocation(invocation)).is_ok()
    }

    /// Runs the events that were queued when the call started.
    ///
    /// Returns the number of events processed. Calling this from a thread
    /// other than the owner does nothing.
    pub fn process_events(&self) -> usize {
        if !self.is_current() {
            tracing::warn!(
                target: targets::THREAD,
                thread = %self,
                "process_events called from a thread that does not own the queue"
            );
            return 0;
        }

        let budget = self.queue.lock().events.len();
        let mut processed = 0;
        while processed < budget {
            let Some(event) = self.queue.lock().events.pop_front() else {
                break;
            };
            event.deliver();
            processed += 1;
        }
        processed
    }

    /// Processes events until [`quit`](Self::quit) is called.
    pub fn exec(&self) {
        if !self.is_current() {
            tracing::warn!(
                target: targets::THREAD,
                thread = %self,
                "exec called from a foreign thread"
            );
            return;
        }
        tracing::debug!(target: targets::THREAD, thread = %self, "event loop started");
        loop {
            self.process_events();
            let mut list = self.queue.lock();
            if list.quit {
                list.quit = false;
                break;
            }
            if list.events.is_empty() {
                self.wakeup.wait(&mut list);
            }
        }
        tracing::debug!(target: targets::THREAD, thread = %self, "event loop stopped");
    }

    /// Asks a running [`exec`](Self::exec) loop to return.
    pub fn quit(&self) {
        let mut list = self.queue.lock();
        list.quit = true;
        self.wakeup.notify_all();
    }

    /// Removes every event addressed to the object at `addr`.
    pub(crate) fn take_events_for(&self, addr: usize) -> Vec<PostedEvent> {
        let mut list = self.queue.lock();
        let (taken, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut list.events)
            .into_iter()
            .partition(|event| event.is_for(addr));
        list.events = kept;
        taken.into()
    }

    /// Appends previously removed events, keeping their order. Events the
    /// thread refuses are returned.
    pub(crate) fn append_events(&self, events: Vec<PostedEvent>) -> Vec<PostedEvent> {
        events
            .into_iter()
            .filter_map(|event| self.post(event).err())
            .collect()
    }

    fn finish(&self) {
        let discarded = {
            let mut list = self.queue.lock();
            list.finished = true;
            std::mem::take(&mut list.events)
        };
        if !discarded.is_empty() {
            tracing::debug!(
                target: targets::THREAD,
                thread = %self,
                count = discarded.len(),
                "discarding events of an exiting thread"
            );
        }
        drop(discarded);
    }
}

impl fmt::Display for ThreadData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, self.thread_id) {
            (Some(name), _) => write!(f, "{name}#{}", self.serial),
            (None, Some(id)) => write!(f, "{id:?}#{}", self.serial),
            (None, None) => write!(f, "<no thread>#{}", self.serial),
        }
    }
}

impl fmt::Debug for ThreadData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadData")
            .field("serial", &self.serial)
            .field("thread_id", &self.thread_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_current_is_stable_per_thread() {
        let a = ThreadData::current();
        let b = ThreadData::current();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_current());
        assert!(!a.is_detached());

        let other = thread::spawn(ThreadData::current).join().unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        assert!(!other.is_current());
    }

    #[test]
    fn test_detached_token() {
        let token = ThreadData::detached();
        assert!(token.is_detached());
        assert!(!token.is_current());
        assert!(token.to_string().starts_with("<no thread>"));
    }

    #[test]
    fn test_named_thread() {
        let name = thread::Builder::new()
            .name("td-test".into())
            .spawn(|| ThreadData::current().name().map(str::to_owned))
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(name.as_deref(), Some("td-test"));
    }

    #[test]
    fn test_process_events_fifo() {
        let data = ThreadData::current();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            data.post_invocation(QueuedInvocation::new(move || order.lock().push(i)));
        }
        assert_eq!(data.pending_events(), 5);
        assert_eq!(data.process_events(), 5);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_events_posted_during_processing_wait_for_next_pass() {
        let data = ThreadData::current();
        let count = Arc::new(AtomicUsize::new(0));
        let (inner_data, inner_count) = (data.clone(), count.clone());
        data.post_invocation(QueuedInvocation::new(move || {
            inner_count.fetch_add(1, Ordering::SeqCst);
            let again = inner_count.clone();
            inner_data.post_invocation(QueuedInvocation::new(move || {
                again.fetch_add(1, Ordering::SeqCst);
            }));
        }));
        assert_eq!(data.process_events(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(data.process_events(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_process_events_from_foreign_thread_is_refused() {
        let data = thread::spawn(ThreadData::current).join().unwrap();
        assert_eq!(data.process_events(), 0);
    }

    #[test]
    fn test_exited_thread_refuses_posts() {
        let data = thread::spawn(ThreadData::current).join().unwrap();
        assert!(data.is_finished());
        assert!(!data.post_invocation(QueuedInvocation::new(|| {})));
        assert_eq!(data.pending_events(), 0);
    }

    #[test]
    fn test_exec_and_quit() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = thread::spawn(move || {
            let data = ThreadData::current();
            tx.send(data.clone()).unwrap();
            data.exec();
        });
        let data = rx.recv().unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let quitter = data.clone();
        data.post_invocation(QueuedInvocation::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            quitter.quit();
        }));
        handle.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
