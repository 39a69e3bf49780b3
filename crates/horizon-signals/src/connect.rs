//! Establishing and severing connections.
//!
//! Every entry point reduces to one of two primitives. Connecting locks sender
//! and receiver together, appends a new record to the tail of the sender's
//! list for the signal and pushes it onto the receiver's senders list.
//! Disconnecting walks the sender's lists under the sender's lock, briefly
//! taking each matching receiver's lock to unlink the record from both ends.
//!
//! The sender's [`connect_notify`](crate::Object::connect_notify) and
//! [`disconnect_notify`](crate::Object::disconnect_notify) hooks run after
//! all locks have been released.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use horizon_signals::{
//!     BasicObject, ClosureSlot, ConnectionType, Object, activate, connect_functor,
//! };
//! use horizon_signals::meta::DESTROYED_SIGNAL;
//!
//! let sender = BasicObject::new();
//! let receiver = BasicObject::new();
//! let calls = Arc::new(AtomicUsize::new(0));
//! let counter = calls.clone();
//!
//! let connection = connect_functor(
//!     &*sender,
//!     "destroyed()",
//!     &*receiver,
//!     ClosureSlot::new(move |_, _| {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!     }),
//!     ConnectionType::Auto,
//! )
//! .unwrap();
//!
//! activate(sender.object_base(), DESTROYED_SIGNAL, &[]);
//! assert_eq!(calls.load(Ordering::SeqCst), 1);
//!
//! assert!(connection.disconnect());
//! activate(sender.object_base(), DESTROYED_SIGNAL, &[]);
//! assert_eq!(calls.load(Ordering::SeqCst), 1);
//! ```

use std::sync::Arc;

use crate::connection::{
    ANY_SIGNAL, Connection, ConnectionPolicy, ConnectionRecord, NewRecord, SlotObject, SlotTarget,
};
use crate::error::ConnectError;
use crate::logging::{span_names, targets};
use crate::meta::{MetaObject, TypeDescriptor, TypeRegistry, check_connect_args};
use crate::mutex_pool::SignalSlotLock;
use crate::object::Object;

fn reject<T>(error: ConnectError) -> Result<T, ConnectError> {
    match &error {
        ConnectError::AlreadyConnected => {
            tracing::debug!(target: targets::CONNECT, %error, "connect rejected");
        }
        _ => tracing::warn!(target: targets::CONNECT, %error, "connect rejected"),
    }
    Err(error)
}

fn find_signal(meta: &'static MetaObject, signature: &str) -> Result<i32, ConnectError> {
    meta.index_of_signal(signature)
        .ok_or_else(|| ConnectError::no_such_signal(meta.type_name, signature))
}

/// Resolves `signature` to a slot of `meta`, or failing that to a signal.
fn find_slot(
    meta: &'static MetaObject,
    signature: &str,
) -> Result<(SlotTarget, &'static [&'static str], String), ConnectError> {
    if let Some(index) = meta.index_of_method(signature) {
        if let Some(method) = meta.method(index) {
            let target = SlotTarget::Method {
                index,
                invoke: method.invoke,
            };
            return Ok((target, method.param_types, method.signature()));
        }
    }
    if let Some(index) = meta.index_of_signal(signature) {
        if let Some(signal) = meta.signal(index) {
            return Ok((SlotTarget::Signal { index }, signal.param_types, signal.signature()));
        }
    }
    Err(ConnectError::no_such_slot(meta.type_name, signature))
}

// ============================================================================
// Connect
// ============================================================================

/// Connects `signal` of `sender` to `slot` of `receiver`.
///
/// Both are signatures (`"valueChanged(i32)"`) or bare names
/// (`"valueChanged"`). `slot` may also name a signal of the receiver, which is
/// then re-emitted with the same arguments. The slot may take fewer
/// parameters than the signal provides, but those it takes must match.
pub fn connect(
    sender: &dyn Object,
    signal: &str,
    receiver: &dyn Object,
    slot: &str,
    policy: impl Into<ConnectionPolicy>,
) -> Result<Connection, ConnectError> {
    let sender_meta = sender.meta_object();
    let receiver_meta = receiver.meta_object();
    let signal_index = match find_signal(sender_meta, signal) {
        Ok(index) => index,
        Err(error) => return reject(error),
    };
    let (target, slot_params, slot_signature) = match find_slot(receiver_meta, slot) {
        Ok(found) => found,
        Err(error) => return reject(error),
    };
    let signal_meta = sender_meta.signal(signal_index);
    let signal_params = signal_meta.map_or(&[][..], |s| s.param_types);
    if !check_connect_args(signal_params, slot_params) {
        return reject(ConnectError::IncompatibleArguments {
            signal: signal_meta.map(|s| s.signature()).unwrap_or_default(),
            slot: slot_signature,
        });
    }
    connect_record(sender, signal_index, receiver, target, policy.into(), None)
}

/// Connects by index: signal `signal_index` of `sender` to slot
/// `method_index` of `receiver`.
///
/// `types` optionally names the signal's parameter types up front, so queued
/// deliveries need not resolve them on first use.
pub fn connect_method(
    sender: &dyn Object,
    signal_index: i32,
    receiver: &dyn Object,
    method_index: usize,
    policy: impl Into<ConnectionPolicy>,
    types: Option<&[&'static str]>,
) -> Result<Connection, ConnectError> {
    let sender_meta = sender.meta_object();
    let receiver_meta = receiver.meta_object();
    let Some(signal) = sender_meta.signal(signal_index) else {
        return reject(ConnectError::SignalIndexOutOfRange {
            class: sender_meta.type_name,
            index: signal_index,
        });
    };
    let Some(method) = receiver_meta.method(method_index) else {
        return reject(ConnectError::MethodIndexOutOfRange {
            class: receiver_meta.type_name,
            index: method_index,
        });
    };
    if !check_connect_args(signal.param_types, method.param_types) {
        return reject(ConnectError::IncompatibleArguments {
            signal: signal.signature(),
            slot: method.signature(),
        });
    }
    let argument_types: Option<Arc<[TypeDescriptor]>> = types
        .and_then(|names| TypeRegistry::resolve_all(names).ok())
        .map(Arc::from);
    let target = SlotTarget::Method {
        index: method_index,
        invoke: method.invoke,
    };
    connect_record(sender, signal_index, receiver, target, policy.into(), argument_types)
}

/// Connects `signal` of `sender` to a slot object.
///
/// `context` plays the receiver's part: the slot runs in its thread, receives
/// it as the receiver argument, and the connection is severed when it is
/// destroyed.
pub fn connect_functor(
    sender: &dyn Object,
    signal: &str,
    context: &dyn Object,
    slot: impl SlotObject,
    policy: impl Into<ConnectionPolicy>,
) -> Result<Connection, ConnectError> {
    let signal_index = match find_signal(sender.meta_object(), signal) {
        Ok(index) => index,
        Err(error) => return reject(error),
    };
    connect_functor_at(sender, signal_index, context, Arc::new(slot), policy.into())
}

/// Connects every signal of `sender` to a slot object.
pub fn connect_all_signals(
    sender: &dyn Object,
    context: &dyn Object,
    slot: impl SlotObject,
    policy: impl Into<ConnectionPolicy>,
) -> Result<Connection, ConnectError> {
    connect_functor_at(sender, ANY_SIGNAL, context, Arc::new(slot), policy.into())
}

pub(crate) fn connect_functor_at(
    sender: &dyn Object,
    signal_index: i32,
    context: &dyn Object,
    slot: Arc<dyn SlotObject>,
    policy: ConnectionPolicy,
) -> Result<Connection, ConnectError> {
    if signal_index != ANY_SIGNAL && sender.meta_object().signal(signal_index).is_none() {
        return reject(ConnectError::SignalIndexOutOfRange {
            class: sender.meta_object().type_name,
            index: signal_index,
        });
    }
    connect_record(sender, signal_index, context, SlotTarget::Functor(slot), policy, None)
}

fn connect_record(
    sender: &dyn Object,
    signal_index: i32,
    receiver: &dyn Object,
    target: SlotTarget,
    policy: ConnectionPolicy,
    argument_types: Option<Arc<[TypeDescriptor]>>,
) -> Result<Connection, ConnectError> {
    let _span =
        tracing::trace_span!(target: targets::CONNECT, span_names::CONNECT, signal_index).entered();
    let sender_base = sender.object_base();
    let receiver_base = receiver.object_base();
    let (sender_addr, receiver_addr) = (sender_base.addr(), receiver_base.addr());

    let outcome = {
        let lock = SignalSlotLock::lock_pair(sender_addr, receiver_addr);
        if sender_base.is_being_destroyed() {
            Err(ConnectError::InvalidSender {
                class: sender_base.class_name(),
            })
        } else if receiver_base.is_being_destroyed() {
            Err(ConnectError::InvalidReceiver {
                class: receiver_base.class_name(),
            })
        } else {
            let sender_data = sender_base.ensure_connection_data(&lock);
            let duplicate = policy.unique
                && sender_data
                    .connections_of(&lock, signal_index)
                    .iter()
                    .any(|r| r.receiver_addr == receiver_addr && r.target.same_as(&target));
            if duplicate {
                Err(ConnectError::AlreadyConnected)
            } else {
                let receiver_data = receiver_base.ensure_connection_data(&lock);
                let record = ConnectionRecord::new(NewRecord {
                    id: sender_data.next_connection_id(&lock),
                    sender: sender_base.weak_object(),
                    sender_addr,
                    sender_data: Arc::downgrade(&sender_data),
                    signal_index,
                    receiver_ref: receiver_base.weak_object(),
                    receiver_addr,
                    receiver_data: Arc::downgrade(&receiver_data),
                    receiver_thread: receiver_base.thread_data(&lock),
                    target,
                    policy,
                    argument_types,
                });
                sender_data.append(&lock, &record);
                receiver_data.push_sender(&lock, &record);
                Ok(record)
            }
        }
    };

    let record = match outcome {
        Ok(record) => record,
        Err(error) => return reject(error),
    };
    tracing::trace!(
        target: targets::CONNECT,
        sender = sender_base.class_name(),
        receiver = receiver_base.class_name(),
        signal_index,
        id = record.id,
        kind = ?record.kind,
        "connected"
    );
    sender.connect_notify(sender.meta_object().signal(signal_index));
    Ok(Connection::new(record))
}

// ============================================================================
// Disconnect
// ============================================================================

enum SlotFilter<'a> {
    Any,
    Target(SlotTarget),
    Object(&'a dyn SlotObject),
}

struct Filter<'a> {
    receiver: Option<usize>,
    slot: SlotFilter<'a>,
}

impl Filter<'_> {
    fn matches(&self, record: &ConnectionRecord) -> bool {
        if !record.is_connected() {
            return false;
        }
        if self.receiver.is_some_and(|addr| addr != record.receiver_addr) {
            return false;
        }
        match (&self.slot, &record.target) {
            (SlotFilter::Any, _) => true,
            (SlotFilter::Target(wanted), target) => target.same_as(wanted),
            (SlotFilter::Object(wanted), SlotTarget::Functor(slot)) => slot.compare(*wanted),
            (SlotFilter::Object(_), _) => false,
        }
    }
}

/// Removes connections of `sender` matching `filter`. `signal_index` `None`
/// walks every list, the all-signals list included.
fn disconnect_matching(
    sender: &dyn Object,
    signal_index: Option<i32>,
    filter: &Filter<'_>,
    one: bool,
) -> bool {
    let _span =
        tracing::trace_span!(target: targets::CONNECT, span_names::DISCONNECT, ?signal_index)
            .entered();
    let base = sender.object_base();
    let mut lock = SignalSlotLock::lock(base.addr());
    let Some(data) = base.connection_data(&lock) else {
        return false;
    };
    let pin = data.pin(&lock);
    let lists: Vec<i32> = match signal_index {
        Some(index) => vec![index],
        None => (ANY_SIGNAL..data.with_state(&lock, |state| state.signal_vector_count())).collect(),
    };

    let mut removed = 0usize;
    'lists: for index in lists {
        let mut cursor = data.with_state(&lock, |state| state.first(index));
        while let Some(record) = cursor {
            if filter.matches(&record) {
                // May briefly release the sender's lock; the pin keeps removed
                // records reachable meanwhile.
                lock.relock(record.receiver_addr);
                if record.is_connected() {
                    data.remove_connection(&lock, &record);
                    removed += 1;
                }
                lock.release_secondary();
                if one && removed > 0 {
                    break 'lists;
                }
            }
            cursor = record.next_in_list(&lock);
        }
    }

    drop(pin);
    let orphans = data.clean_orphaned(&lock);
    drop(lock);
    drop(orphans);

    if removed == 0 {
        return false;
    }
    tracing::trace!(
        target: targets::CONNECT,
        sender = base.class_name(),
        ?signal_index,
        removed,
        "disconnected"
    );
    sender.disconnect_notify(signal_index.and_then(|index| sender.meta_object().signal(index)));
    true
}

/// Disconnects connections of `sender`.
///
/// `None` acts as a wildcard: no `signal` matches every signal, no `receiver`
/// every receiver, no `slot` every slot of the matched receiver. A `slot`
/// without a `receiver` is rejected. Returns whether anything was
/// disconnected.
pub fn disconnect(
    sender: &dyn Object,
    signal: Option<&str>,
    receiver: Option<&dyn Object>,
    slot: Option<&str>,
) -> bool {
    let Some((signal_index, filter)) = string_filter(sender, signal, receiver, slot) else {
        return false;
    };
    disconnect_matching(sender, signal_index, &filter, false)
}

/// Like [`disconnect`], but removes at most one connection: the oldest match.
pub fn disconnect_one(
    sender: &dyn Object,
    signal: &str,
    receiver: &dyn Object,
    slot: &str,
) -> bool {
    let Some((signal_index, filter)) =
        string_filter(sender, Some(signal), Some(receiver), Some(slot))
    else {
        return false;
    };
    disconnect_matching(sender, signal_index, &filter, true)
}

fn string_filter<'a>(
    sender: &dyn Object,
    signal: Option<&str>,
    receiver: Option<&dyn Object>,
    slot: Option<&str>,
) -> Option<(Option<i32>, Filter<'a>)> {
    let signal_index = match signal {
        Some(signature) => match find_signal(sender.meta_object(), signature) {
            Ok(index) => Some(index),
            Err(error) => {
                tracing::warn!(target: targets::CONNECT, %error, "disconnect rejected");
                return None;
            }
        },
        None => None,
    };
    let slot = match (slot, receiver) {
        (None, _) => SlotFilter::Any,
        (Some(_), None) => {
            tracing::warn!(
                target: targets::CONNECT,
                class = sender.meta_object().type_name,
                "disconnect: a slot was given without a receiver"
            );
            return None;
        }
        (Some(signature), Some(receiver)) => match find_slot(receiver.meta_object(), signature) {
            Ok((target, _, _)) => SlotFilter::Target(target),
            Err(error) => {
                tracing::warn!(target: targets::CONNECT, %error, "disconnect rejected");
                return None;
            }
        },
    };
    let filter = Filter {
        receiver: receiver.map(|r| r.object_base().addr()),
        slot,
    };
    Some((signal_index, filter))
}

/// Disconnects by index. `signal_index` [`ANY_SIGNAL`] matches every signal
/// and `method_index` `None` every slot.
pub fn disconnect_method(
    sender: &dyn Object,
    signal_index: i32,
    receiver: Option<&dyn Object>,
    method_index: Option<usize>,
) -> bool {
    let slot = match (method_index, receiver) {
        (None, _) => SlotFilter::Any,
        (Some(index), Some(receiver)) => match receiver.meta_object().method(index) {
            Some(method) => SlotFilter::Target(SlotTarget::Method {
                index,
                invoke: method.invoke,
            }),
            None => {
                let error = ConnectError::MethodIndexOutOfRange {
                    class: receiver.meta_object().type_name,
                    index,
                };
                tracing::warn!(target: targets::CONNECT, %error, "disconnect rejected");
                return false;
            }
        },
        (Some(_), None) => {
            tracing::warn!(
                target: targets::CONNECT,
                "disconnect: a slot was given without a receiver"
            );
            return false;
        }
    };
    let filter = Filter {
        receiver: receiver.map(|r| r.object_base().addr()),
        slot,
    };
    let signal_index = (signal_index != ANY_SIGNAL).then_some(signal_index);
    disconnect_matching(sender, signal_index, &filter, false)
}

/// Disconnects connections to slot objects comparing equal to `slot`.
///
/// Only slot objects implementing [`SlotObject::compare`] (such as
/// [`FunctionSlot`](crate::FunctionSlot)) can be matched this way.
pub fn disconnect_functor(
    sender: &dyn Object,
    signal: Option<&str>,
    receiver: Option<&dyn Object>,
    slot: &dyn SlotObject,
) -> bool {
    let signal_index = match signal {
        Some(signature) => match find_signal(sender.meta_object(), signature) {
            Ok(index) => Some(index),
            Err(error) => {
                tracing::warn!(target: targets::CONNECT, %error, "disconnect rejected");
                return false;
            }
        },
        None => None,
    };
    let filter = Filter {
        receiver: receiver.map(|r| r.object_base().addr()),
        slot: SlotFilter::Object(slot),
    };
    disconnect_matching(sender, signal_index, &filter, false)
}

/// Severs the connection behind `connection`. Returns `false` if it was not
/// connected.
pub fn disconnect_connection(connection: &Connection) -> bool {
    let Some(record) = connection.record() else {
        return false;
    };
    if !record.is_connected() {
        return false;
    }
    let Some(sender_data) = record.sender_data.upgrade() else {
        return false;
    };

    let orphans = {
        let mut lock = SignalSlotLock::lock_pair(record.sender_addr, record.receiver_addr);
        if !record.is_connected() {
            None
        } else {
            sender_data.remove_connection(&lock, record);
            lock.release_secondary();
            let orphans = sender_data.clean_orphaned(&lock);
            drop(lock);
            Some(orphans)
        }
    };
    drop(sender_data);
    let Some(orphans) = orphans else {
        return false;
    };
    drop(orphans);

    tracing::trace!(target: targets::CONNECT, id = record.id, "disconnected by handle");
    if let Some(sender) = record.sender.upgrade() {
        sender.disconnect_notify(sender.meta_object().signal(record.signal_index));
    }
    true
}
