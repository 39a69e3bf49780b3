//! Signal activation: delivering one emission to every connected slot.
//!
//! An activation walks the sender's list for the emitted signal, then the
//! list of all-signal listeners. The sender's lock is only held while reading
//! list links; it is always released before a slot runs, so slots may connect,
//! disconnect, emit or destroy objects (the sender included) freely.
//!
//! Ordering guarantees:
//!
//! - Slots run in the order they were connected.
//! - Connections made while the activation is running (typically by one of
//!   its own slots) are not part of it. The sender's newest connection id is
//!   read up front and the walk stops at the first newer record.
//! - A connection severed during the activation is skipped if the walk has
//!   not reached it yet.
//! - If the sender is destroyed by one of its slots, the remaining
//!   connections are not invoked.
//!
//! Each connection is delivered according to its [`ConnectionType`] and
//! whether the receiver lives in the emitting thread:
//!
//! | type             | same thread                             | other thread          |
//! |------------------|-----------------------------------------|-----------------------|
//! | `Auto`           | direct call                             | queued                |
//! | `Direct`         | direct call                             | direct call           |
//! | `Queued`         | queued                                  | queued                |
//! | `BlockingQueued` | queued, emitter waits (deadlock, warned) | queued, emitter waits |

use std::sync::Arc;

use crate::connection::{ANY_SIGNAL, ConnectionRecord, ConnectionType};
use crate::connection_data::{ActivationPin, SenderScope};
use crate::error::DispatchError;
use crate::event::{BorrowedArgs, EventArgs, MetaCallEvent, PostedEvent};
use crate::invocation::completion_pair;
use crate::logging::{span_names, targets};
use crate::meta::{Arg, TypeDescriptor, TypeRegistry};
use crate::mutex_pool::SignalSlotLock;
use crate::object::ObjectBase;
use crate::spy;
use crate::thread_data::ThreadData;

/// How one connection receives one emission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Call the slot now, on the emitting thread.
    Immediate,
    /// Post the call to the receiver's thread.
    Enqueue,
    /// Post the call and wait for it to run.
    EnqueueAndWait,
}

pub(crate) fn resolve_delivery(kind: ConnectionType, same_thread: bool) -> Delivery {
    match kind {
        ConnectionType::Direct => Delivery::Immediate,
        ConnectionType::Auto if same_thread => Delivery::Immediate,
        ConnectionType::Auto | ConnectionType::Queued => Delivery::Enqueue,
        ConnectionType::BlockingQueued => Delivery::EnqueueAndWait,
    }
}

/// Emits the signal at `signal_index` of `sender` with `args`.
///
/// `args` must hold one value per declared parameter of the signal, of the
/// declared types. Direct connections receive `args` as they are; queued ones
/// receive copies made through the [`TypeRegistry`]. Nothing happens while the
/// sender's signals are blocked.
pub fn activate(sender: &ObjectBase, signal_index: i32, args: &[&Arg]) {
    if sender.signals_blocked() {
        return;
    }
    if signal_index < 0 || sender.meta().signal(signal_index).is_none() {
        tracing::warn!(
            target: targets::ACTIVATE,
            class = sender.class_name(),
            signal_index,
            "activate: no such signal"
        );
        return;
    }

    let spy = spy::current();
    if let Some(spy) = &spy {
        spy.signal_begin(sender, signal_index, args);
    }
    {
        let _span = tracing::trace_span!(
            target: targets::ACTIVATE,
            span_names::ACTIVATE,
            class = sender.class_name(),
            signal_index
        )
        .entered();
        activate_connections(sender, signal_index, args, spy.as_deref());
    }
    if let Some(spy) = &spy {
        spy.signal_end(sender, signal_index);
    }
}

struct Snapshot {
    pin: ActivationPin,
    highest: u64,
    in_sender_thread: bool,
}

fn snapshot(sender: &ObjectBase) -> Option<Snapshot> {
    let lock = SignalSlotLock::lock(sender.addr());
    let data = sender.connection_data(&lock)?;
    let highest = data.highest_connection_id();
    if highest == 0 {
        return None;
    }
    Some(Snapshot {
        pin: data.pin(&lock),
        highest,
        in_sender_thread: sender.thread_data(&lock).is_current(),
    })
}

fn activate_connections(
    sender: &ObjectBase,
    signal_index: i32,
    args: &[&Arg],
    spy: Option<&spy::SignalSpyCallbacks>,
) {
    let Some(snapshot) = snapshot(sender) else {
        return;
    };
    let data = snapshot.pin.data().clone();

    'lists: for list_index in [signal_index, ANY_SIGNAL] {
        let mut cursor = {
            let lock = SignalSlotLock::lock(sender.addr());
            data.with_state(&lock, |state| state.first(list_index))
        };
        while let Some(record) = cursor {
            if record.id > snapshot.highest {
                break;
            }
            if record.is_connected() {
                let receiver_thread = if snapshot.in_sender_thread {
                    record.receiver_thread()
                } else {
                    let _receiver_lock = SignalSlotLock::lock(record.receiver_addr);
                    record.receiver_thread()
                };
                deliver(sender, &record, signal_index, args, receiver_thread, spy);
            }
            if data.is_owner_destroyed() {
                tracing::trace!(
                    target: targets::ACTIVATE,
                    signal_index,
                    "sender destroyed during activation"
                );
                break 'lists;
            }
            cursor = {
                let lock = SignalSlotLock::lock(sender.addr());
                record.next_in_list(&lock)
            };
        }
    }

    drop(snapshot);
    if !data.is_owner_destroyed() {
        let lock = SignalSlotLock::lock(sender.addr());
        let orphans = data.clean_orphaned(&lock);
        drop(lock);
        let released = orphans.len();
        if released > 0 {
            tracing::trace!(
                target: targets::ACTIVATE,
                signal_index,
                released,
                "orphaned connections released"
            );
        }
        drop(orphans);
    }
}

fn deliver(
    sender: &ObjectBase,
    record: &Arc<ConnectionRecord>,
    signal_index: i32,
    args: &[&Arg],
    receiver_thread: Arc<ThreadData>,
    spy: Option<&spy::SignalSpyCallbacks>,
) {
    let same_thread = receiver_thread.is_current();
    match resolve_delivery(record.kind, same_thread) {
        Delivery::Immediate => call_direct(sender, record, signal_index, args, same_thread, spy),
        Delivery::Enqueue => queued_activate(sender, record, signal_index, args),
        Delivery::EnqueueAndWait => {
            if same_thread {
                let error = blocking_deadlock(sender, record);
                tracing::warn!(
                    target: targets::ACTIVATE,
                    %error,
                    "blocking-queued delivery posted to the emitting thread"
                );
            }
            blocking_activate(sender, record, signal_index, args);
        }
    }
}

/// The diagnostic for a blocking-queued delivery posted to the emitting
/// thread. The emitter still waits; only another thread can release it.
fn blocking_deadlock(sender: &ObjectBase, record: &ConnectionRecord) -> DispatchError {
    let receiver = record
        .receiver_ref
        .upgrade()
        .map_or("<destroyed>", |r| r.object_base().class_name());
    DispatchError::BlockingQueuedDeadlock {
        sender: sender.class_name(),
        receiver,
    }
}

fn call_direct(
    sender: &ObjectBase,
    record: &ConnectionRecord,
    signal_index: i32,
    args: &[&Arg],
    same_thread: bool,
    spy: Option<&spy::SignalSpyCallbacks>,
) {
    let Some(receiver) = record.receiver_ref.upgrade() else {
        return;
    };
    let _scope = if same_thread {
        SenderScope::enter(
            receiver.object_base(),
            sender.weak_object(),
            sender.addr(),
            signal_index,
        )
    } else {
        None
    };

    let method = record.target.method_index();
    if let (Some(spy), Some(method)) = (spy, method) {
        spy.slot_begin(&*receiver, method, args);
    }
    record.target.invoke(&*receiver, args);
    if let (Some(spy), Some(method)) = (spy, method) {
        spy.slot_end(&*receiver, method);
    }
}

/// Parameter types of the emitted signal, cached on the record.
///
/// All-signal records see many signals and resolve on every activation.
fn argument_types(
    sender: &ObjectBase,
    record: &ConnectionRecord,
    signal_index: i32,
) -> Option<Arc<[TypeDescriptor]>> {
    if let Some(types) = record.cached_argument_types() {
        return Some(types.clone());
    }
    let signal = sender.meta().signal(signal_index)?;
    match TypeRegistry::resolve_all(signal.param_types) {
        Ok(types) => {
            let types: Arc<[TypeDescriptor]> = types.into();
            if record.signal_index == ANY_SIGNAL {
                Some(types)
            } else {
                Some(record.cache_argument_types(types))
            }
        }
        Err(type_name) => {
            let error = DispatchError::UnregisteredArgumentType {
                type_name,
                signal: signal.signature(),
            };
            tracing::warn!(target: targets::ACTIVATE, %error, "queued delivery dropped");
            None
        }
    }
}

fn copy_arguments(
    sender: &ObjectBase,
    types: &[TypeDescriptor],
    signal_index: i32,
    args: &[&Arg],
) -> Option<Vec<Box<Arg>>> {
    let signature = || {
        sender
            .meta()
            .signal(signal_index)
            .map(|s| s.signature())
            .unwrap_or_default()
    };
    if args.len() < types.len() {
        let error = DispatchError::ArgumentCountMismatch {
            signal: signature(),
            expected: types.len(),
            actual: args.len(),
        };
        tracing::warn!(target: targets::ACTIVATE, %error, "queued delivery dropped");
        return None;
    }
    let mut copies = Vec::with_capacity(types.len());
    for (position, (descriptor, arg)) in types.iter().zip(args).enumerate() {
        match descriptor.copy(*arg) {
            Some(copy) => copies.push(copy),
            None => {
                let error = DispatchError::ArgumentTypeMismatch {
                    signal: signature(),
                    position,
                    type_name: descriptor.name(),
                };
                tracing::warn!(target: targets::ACTIVATE, %error, "queued delivery dropped");
                return None;
            }
        }
    }
    Some(copies)
}

/// Posts `call` to the receiver's current thread. Returns `false` if the
/// connection was severed or the thread no longer runs.
fn post_to_receiver(record: &ConnectionRecord, call: MetaCallEvent) -> bool {
    let event = PostedEvent::meta_call(record.receiver_ref.clone(), record.receiver_addr, call);
    let rejected = {
        // Posting under the receiver's lock keeps the event from slipping past
        // a concurrent move to another thread.
        let lock = SignalSlotLock::lock(record.receiver_addr);
        if record.is_connected() {
            let thread = record.receiver_thread();
            let result = thread.post(event).err();
            drop(lock);
            drop(thread);
            result
        } else {
            Some(event)
        }
    };
    rejected.is_none()
}

fn queued_activate(
    sender: &ObjectBase,
    record: &ConnectionRecord,
    signal_index: i32,
    args: &[&Arg],
) {
    let Some(types) = argument_types(sender, record, signal_index) else {
        return;
    };
    let Some(copies) = copy_arguments(sender, &types, signal_index, args) else {
        return;
    };
    let call = MetaCallEvent {
        sender: sender.weak_object(),
        sender_addr: sender.addr(),
        signal_index,
        target: record.target.clone(),
        args: EventArgs::Owned(copies),
        completion: None,
    };
    if !post_to_receiver(record, call) {
        tracing::trace!(target: targets::ACTIVATE, signal_index, "queued call not posted");
    }
}

fn blocking_activate(
    sender: &ObjectBase,
    record: &ConnectionRecord,
    signal_index: i32,
    args: &[&Arg],
) {
    let (handle, waiter) = completion_pair();
    let call = MetaCallEvent {
        sender: sender.weak_object(),
        sender_addr: sender.addr(),
        signal_index,
        target: record.target.clone(),
        args: EventArgs::Borrowed(BorrowedArgs::new(args)),
        completion: Some(handle),
    };
    // The event borrows `args`: wait even if posting failed, which returns
    // at once because the rejected event has been dropped by then.
    post_to_receiver(record, call);
    waiter.wait();
}
