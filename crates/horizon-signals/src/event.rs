//! Messages posted to a thread's event queue.

use std::fmt;
use std::sync::Weak;

use crate::connection::SlotTarget;
use crate::connection_data::SenderScope;
use crate::invocation::{CompletionHandle, QueuedInvocation};
use crate::logging::targets;
use crate::meta::Arg;
use crate::object::Object;

/// Arguments carried by a queued call.
pub(crate) enum EventArgs {
    /// Deep copies made for an asynchronous delivery.
    Owned(Vec<Box<Arg>>),
    /// The emitter's own arguments, for a blocking delivery.
    Borrowed(BorrowedArgs),
}

/// Pointers to arguments that live on a blocked emitter's stack.
pub(crate) struct BorrowedArgs(Vec<*const Arg>);

// SAFETY: the pointees are `Send + Sync`, and the emitter that owns them stays
// blocked until the event carrying these pointers has been delivered or
// dropped (it waits on the event's `CompletionHandle`).
unsafe impl Send for BorrowedArgs {}

impl BorrowedArgs {
    pub(crate) fn new(args: &[&Arg]) -> Self {
        Self(args.iter().map(|&arg| arg as *const Arg).collect())
    }
}

impl EventArgs {
    fn with_refs<R>(&self, f: impl FnOnce(&[&Arg]) -> R) -> R {
        match self {
            Self::Owned(values) => {
                let refs: Vec<&Arg> = values.iter().map(|value| &**value).collect();
                f(&refs)
            }
            Self::Borrowed(pointers) => {
                // SAFETY: see `BorrowedArgs`; this runs before the completion
                // handle owned by the same event is released.
                let refs: Vec<&Arg> = pointers.0.iter().map(|&ptr| unsafe { &*ptr }).collect();
                f(&refs)
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Owned(values) => values.len(),
            Self::Borrowed(pointers) => pointers.0.len(),
        }
    }
}

/// A slot invocation queued for the receiver's thread.
pub struct MetaCallEvent {
    pub(crate) sender: Weak<dyn Object>,
    pub(crate) sender_addr: usize,
    pub(crate) signal_index: i32,
    pub(crate) target: SlotTarget,
    pub(crate) args: EventArgs,
    pub(crate) completion: Option<CompletionHandle>,
}

impl MetaCallEvent {
    /// The signal that produced this call.
    pub fn signal_index(&self) -> i32 {
        self.signal_index
    }

    /// Whether an emitter is blocked waiting for this call.
    pub fn is_blocking(&self) -> bool {
        self.completion.is_some()
    }

    pub(crate) fn place_meta_call(&self, receiver: &dyn Object) {
        self.args.with_refs(|args| self.target.invoke(receiver, args));
    }
}

impl fmt::Debug for MetaCallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaCallEvent")
            .field("signal_index", &self.signal_index)
            .field("args", &self.args.len())
            .field("blocking", &self.is_blocking())
            .finish_non_exhaustive()
    }
}

/// Anything a thread's event loop can run.
#[derive(Debug)]
pub enum Event {
    /// A queued slot invocation.
    MetaCall(MetaCallEvent),
    /// An arbitrary closure.
    Invoke(QueuedInvocation),
}

/// The object an event is addressed to.
pub(crate) struct PostedReceiver {
    pub(crate) object: Weak<dyn Object>,
    pub(crate) addr: usize,
}

/// An event sitting in a thread's queue.
pub(crate) struct PostedEvent {
    pub(crate) receiver: Option<PostedReceiver>,
    pub(crate) event: Event,
}

impl PostedEvent {
    pub(crate) fn meta_call(object: Weak<dyn Object>, addr: usize, call: MetaCallEvent) -> Self {
        Self {
            receiver: Some(PostedReceiver { object, addr }),
            event: Event::MetaCall(call),
        }
    }

    pub(crate) fn invocation(invocation: QueuedInvocation) -> Self {
        Self {
            receiver: None,
            event: Event::Invoke(invocation),
        }
    }

    pub(crate) fn is_for(&self, addr: usize) -> bool {
        self.receiver.as_ref().is_some_and(|r| r.addr == addr)
    }

    /// Runs the event on the current thread.
    pub(crate) fn deliver(self) {
        let Self { receiver, event } = self;
        match event {
            Event::Invoke(invocation) => invocation.execute(),
            Event::MetaCall(mut call) => {
                let Some(object) = receiver.and_then(|r| r.object.upgrade()) else {
                    tracing::trace!(
                        target: targets::THREAD,
                        signal_index = call.signal_index,
                        "dropping queued call for a destroyed receiver"
                    );
                    return;
                };
                let base = object.object_base();
                if base.is_being_destroyed() {
                    return;
                }
                {
                    let _scope = SenderScope::enter(
                        base,
                        call.sender.clone(),
                        call.sender_addr,
                        call.signal_index,
                    );
                    call.place_meta_call(&*object);
                }
                if let Some(completion) = call.completion.take() {
                    completion.signal_done();
                }
            }
        }
    }
}
