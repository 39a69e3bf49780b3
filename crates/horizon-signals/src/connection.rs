//! Connection records and the handles that refer to them.
//!
//! A [`ConnectionRecord`] is one directed edge *sender signal → receiver
//! slot*. The record is the node of two intrusive lists at once:
//!
//! - the sender's per-signal list (`list_links`, guarded by the sender's lock),
//!   in connection order, which is the order slots are invoked;
//! - the receiver's *senders* list (`sender_links`, guarded by the receiver's
//!   lock), used to tear down inbound links when the receiver goes away.
//!
//! Records are reference counted. Lists hold strong forward links and weak
//! back links, and an activation walking the list holds the record it is
//! currently visiting, so an unlinked record stays readable until the walk has
//! moved past it.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::connection_data::ConnectionData;
use crate::meta::{Arg, InvokeFn, TypeDescriptor};
use crate::mutex_pool::{Guarded, SignalSlotLock};
use crate::object::Object;
use crate::thread_data::ThreadData;

/// Signal index of the bucket that receives every signal of a sender.
pub const ANY_SIGNAL: i32 = -1;

/// Specifies how a connected slot is invoked when the signal is emitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Invoke the slot immediately in the emitting thread.
    ///
    /// The slot runs even if the receiver lives in another thread, so it must
    /// be safe to call from anywhere.
    Direct,

    /// Post the invocation to the receiver's thread.
    ///
    /// Arguments are copied through the [`TypeRegistry`](crate::meta::TypeRegistry)
    /// and the slot runs when that thread processes its events. The emitter
    /// does not wait.
    Queued,

    /// Direct if the receiver lives in the emitting thread, queued otherwise.
    ///
    /// The decision is made at every emission, so moving the receiver to
    /// another thread changes how later emissions are delivered.
    #[default]
    Auto,

    /// Like `Queued`, but the emitter blocks until the slot has returned.
    ///
    /// Must not be used when the receiver lives in the emitting thread: the
    /// emitter would wait for an event loop that it is itself blocking. Such
    /// deliveries are reported with a warning and then posted anyway, leaving
    /// the emitter blocked until another thread destroys the receiver or
    /// ends its thread.
    BlockingQueued,
}

impl ConnectionType {
    /// This policy with the uniqueness flag set.
    pub fn unique(self) -> ConnectionPolicy {
        ConnectionPolicy::from(self).unique()
    }
}

/// A [`ConnectionType`] plus connection flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConnectionPolicy {
    /// Delivery policy.
    pub kind: ConnectionType,
    /// Refuse to connect if an identical connection already exists.
    pub unique: bool,
}

impl ConnectionPolicy {
    /// Sets the uniqueness flag.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

impl From<ConnectionType> for ConnectionPolicy {
    fn from(kind: ConnectionType) -> Self {
        Self {
            kind,
            unique: false,
        }
    }
}

// ============================================================================
// Slot objects
// ============================================================================

/// A callable connection target that is not a declared slot.
///
/// `compare` is only used to find existing connections (unique connects and
/// [`disconnect_functor`](crate::connect::disconnect_functor)); targets that
/// cannot be compared keep the default and are only removable by handle or
/// by receiver.
pub trait SlotObject: Any + Send + Sync {
    /// Invokes the target.
    fn call(&self, receiver: &dyn Object, args: &[&Arg]);

    /// Whether `other` denotes the same target.
    fn compare(&self, _other: &dyn SlotObject) -> bool {
        false
    }
}

/// A plain function slot. Two `FunctionSlot`s compare equal when they wrap
/// the same function.
#[derive(Clone, Copy)]
pub struct FunctionSlot(pub fn(&dyn Object, &[&Arg]));

impl SlotObject for FunctionSlot {
    fn call(&self, receiver: &dyn Object, args: &[&Arg]) {
        (self.0)(receiver, args)
    }

    fn compare(&self, other: &dyn SlotObject) -> bool {
        (other as &dyn Any)
            .downcast_ref::<FunctionSlot>()
            .is_some_and(|o| self.0 as usize == o.0 as usize)
    }
}

/// A closure slot. Closures never compare equal to anything.
pub struct ClosureSlot<F>(F);

impl<F> ClosureSlot<F>
where
    F: Fn(&dyn Object, &[&Arg]) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> SlotObject for ClosureSlot<F>
where
    F: Fn(&dyn Object, &[&Arg]) + Send + Sync + 'static,
{
    fn call(&self, receiver: &dyn Object, args: &[&Arg]) {
        (self.0)(receiver, args)
    }
}

/// What a connection invokes.
#[derive(Clone)]
pub(crate) enum SlotTarget {
    /// A slot declared in the receiver's meta-object.
    Method { index: usize, invoke: InvokeFn },
    /// Another signal of the receiver, re-emitted with the same arguments.
    Signal { index: i32 },
    /// A slot object.
    Functor(Arc<dyn SlotObject>),
}

impl SlotTarget {
    pub(crate) fn invoke(&self, receiver: &dyn Object, args: &[&Arg]) {
        match self {
            Self::Method { invoke, .. } => invoke(receiver, args),
            Self::Signal { index } => {
                crate::activate::activate(receiver.object_base(), *index, args)
            }
            Self::Functor(slot) => slot.call(receiver, args),
        }
    }

    pub(crate) fn same_as(&self, other: &SlotTarget) -> bool {
        match (self, other) {
            (Self::Method { index: a, .. }, Self::Method { index: b, .. }) => a == b,
            (Self::Signal { index: a }, Self::Signal { index: b }) => a == b,
            (Self::Functor(a), Self::Functor(b)) => {
                Arc::ptr_eq(a, b) || a.compare(b.as_ref())
            }
            _ => false,
        }
    }

    /// The declared slot index, if this targets one.
    pub(crate) fn method_index(&self) -> Option<usize> {
        match self {
            Self::Method { index, .. } => Some(*index),
            _ => None,
        }
    }
}

// ============================================================================
// Connection record
// ============================================================================

/// Intrusive links of one list.
#[derive(Default)]
pub(crate) struct Links {
    pub(crate) next: Option<Arc<ConnectionRecord>>,
    pub(crate) prev: Option<Weak<ConnectionRecord>>,
}

pub(crate) struct ConnectionRecord {
    /// Position in the sender's connection order; larger is newer.
    pub(crate) id: u64,
    pub(crate) sender: Weak<dyn Object>,
    pub(crate) sender_addr: usize,
    pub(crate) sender_data: Weak<ConnectionData>,
    pub(crate) signal_index: i32,
    /// Receiver identity; 0 once the connection is severed, never reset.
    receiver: AtomicUsize,
    pub(crate) receiver_ref: Weak<dyn Object>,
    pub(crate) receiver_addr: usize,
    pub(crate) receiver_data: Weak<ConnectionData>,
    /// Swapped under the receiver's lock when the receiver changes thread.
    receiver_thread: Mutex<Arc<ThreadData>>,
    pub(crate) target: SlotTarget,
    pub(crate) kind: ConnectionType,
    pub(crate) unique: bool,
    argument_types: OnceLock<Arc<[TypeDescriptor]>>,
    list_links: Guarded<Links>,
    sender_links: Guarded<Links>,
}

pub(crate) struct NewRecord {
    pub(crate) id: u64,
    pub(crate) sender: Weak<dyn Object>,
    pub(crate) sender_addr: usize,
    pub(crate) sender_data: Weak<ConnectionData>,
    pub(crate) signal_index: i32,
    pub(crate) receiver_ref: Weak<dyn Object>,
    pub(crate) receiver_addr: usize,
    pub(crate) receiver_data: Weak<ConnectionData>,
    pub(crate) receiver_thread: Arc<ThreadData>,
    pub(crate) target: SlotTarget,
    pub(crate) policy: ConnectionPolicy,
    pub(crate) argument_types: Option<Arc<[TypeDescriptor]>>,
}

impl ConnectionRecord {
    pub(crate) fn new(init: NewRecord) -> Arc<Self> {
        let argument_types = OnceLock::new();
        if let Some(types) = init.argument_types {
            let _ = argument_types.set(types);
        }
        Arc::new(Self {
            id: init.id,
            sender: init.sender,
            sender_addr: init.sender_addr,
            sender_data: init.sender_data,
            signal_index: init.signal_index,
            receiver: AtomicUsize::new(init.receiver_addr),
            receiver_ref: init.receiver_ref,
            receiver_addr: init.receiver_addr,
            receiver_data: init.receiver_data,
            receiver_thread: Mutex::new(init.receiver_thread),
            target: init.target,
            kind: init.policy.kind,
            unique: init.policy.unique,
            argument_types,
            list_links: Guarded::new(Links::default()),
            sender_links: Guarded::new(Links::default()),
        })
    }

    /// The receiver's address, or 0 if the connection has been severed.
    #[inline]
    pub(crate) fn receiver(&self) -> usize {
        self.receiver.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_connected(&self) -> bool {
        self.receiver() != 0
    }

    /// Severs the connection. Caller holds both the sender's and receiver's locks.
    pub(crate) fn clear_receiver(&self, lock: &SignalSlotLock) {
        debug_assert!(lock.covers(self.sender_addr) && lock.covers(self.receiver_addr));
        self.receiver.store(0, Ordering::Release);
    }

    pub(crate) fn receiver_thread(&self) -> Arc<ThreadData> {
        self.receiver_thread.lock().clone()
    }

    /// Replaces the receiver's thread, returning the previous one so the
    /// caller can drop it outside any pool lock.
    pub(crate) fn swap_receiver_thread(
        &self,
        lock: &SignalSlotLock,
        thread: Arc<ThreadData>,
    ) -> Arc<ThreadData> {
        debug_assert!(lock.covers(self.receiver_addr));
        std::mem::replace(&mut *self.receiver_thread.lock(), thread)
    }

    pub(crate) fn with_list_links<R>(
        &self,
        lock: &SignalSlotLock,
        f: impl FnOnce(&mut Links) -> R,
    ) -> R {
        self.list_links.with(lock, self.sender_addr, f)
    }

    pub(crate) fn with_sender_links<R>(
        &self,
        lock: &SignalSlotLock,
        f: impl FnOnce(&mut Links) -> R,
    ) -> R {
        self.sender_links.with(lock, self.receiver_addr, f)
    }

    /// The next record in the sender's per-signal list.
    pub(crate) fn next_in_list(&self, lock: &SignalSlotLock) -> Option<Arc<Self>> {
        self.with_list_links(lock, |links| links.next.clone())
    }

    /// The next record in the receiver's senders list.
    pub(crate) fn next_sender(&self, lock: &SignalSlotLock) -> Option<Arc<Self>> {
        self.with_sender_links(lock, |links| links.next.clone())
    }

    pub(crate) fn cached_argument_types(&self) -> Option<&Arc<[TypeDescriptor]>> {
        self.argument_types.get()
    }

    pub(crate) fn cache_argument_types(
        &self,
        types: Arc<[TypeDescriptor]>,
    ) -> Arc<[TypeDescriptor]> {
        self.argument_types.get_or_init(|| types).clone()
    }
}

impl Drop for ConnectionRecord {
    // Long lists would otherwise be freed recursively through `next`.
    fn drop(&mut self) {
        let mut pending: Vec<Arc<ConnectionRecord>> = Vec::new();
        pending.extend(self.list_links.get_mut().next.take());
        pending.extend(self.sender_links.get_mut().next.take());
        while let Some(record) = pending.pop() {
            if let Ok(mut record) = Arc::try_unwrap(record) {
                pending.extend(record.list_links.get_mut().next.take());
                pending.extend(record.sender_links.get_mut().next.take());
            }
        }
    }
}

// ============================================================================
// Public handles
// ============================================================================

/// Handle to an established connection.
///
/// Holding a handle keeps the record alive but does not keep the connection
/// established; use [`is_connected`](Self::is_connected) to find out whether
/// it still is. The default handle refers to no connection.
#[derive(Clone, Default)]
pub struct Connection {
    record: Option<Arc<ConnectionRecord>>,
}

impl Connection {
    pub(crate) fn new(record: Arc<ConnectionRecord>) -> Self {
        Self {
            record: Some(record),
        }
    }

    pub(crate) fn record(&self) -> Option<&Arc<ConnectionRecord>> {
        self.record.as_ref()
    }

    /// Whether the connection is still established.
    pub fn is_connected(&self) -> bool {
        self.record.as_ref().is_some_and(|r| r.is_connected())
    }

    /// Severs the connection. Returns `false` if it was already severed.
    pub fn disconnect(&self) -> bool {
        crate::connect::disconnect_connection(self)
    }

    /// The connected signal index ([`ANY_SIGNAL`] for all-signal listeners).
    pub fn signal_index(&self) -> Option<i32> {
        self.record.as_ref().map(|r| r.signal_index)
    }

    /// The delivery policy.
    pub fn connection_type(&self) -> Option<ConnectionType> {
        self.record.as_ref().map(|r| r.kind)
    }

    /// Converts this handle into a guard that disconnects on drop.
    pub fn into_guard(self) -> ConnectionGuard {
        ConnectionGuard { connection: self }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        match (&self.record, &other.record) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.record {
            Some(record) => f
                .debug_struct("Connection")
                .field("id", &record.id)
                .field("signal_index", &record.signal_index)
                .field("kind", &record.kind)
                .field("unique", &record.unique)
                .field("connected", &record.is_connected())
                .finish(),
            None => f.write_str("Connection(<invalid>)"),
        }
    }
}

/// RAII guard that severs its connection when dropped.
///
/// # Example
///
/// ```
/// use horizon_signals::{BasicObject, ClosureSlot, ConnectionType, Object, connect_functor};
/// use horizon_signals::meta::DESTROYED_SIGNAL;
///
/// let sender = BasicObject::new();
/// let receiver = BasicObject::new();
/// {
///     let _guard = connect_functor(
///         &*sender,
///         "destroyed()",
///         &*receiver,
///         ClosureSlot::new(|_, _| {}),
///         ConnectionType::Direct,
///     )
///     .expect("connect")
///     .into_guard();
///     assert!(sender.object_base().is_signal_connected(DESTROYED_SIGNAL));
/// }
/// assert!(!sender.object_base().is_signal_connected(DESTROYED_SIGNAL));
/// ```
#[must_use = "dropping the guard disconnects immediately"]
pub struct ConnectionGuard {
    connection: Connection,
}

impl ConnectionGuard {
    /// The guarded connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Releases the connection from the guard without disconnecting it.
    pub fn detach(mut self) -> Connection {
        std::mem::take(&mut self.connection)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.connection.record.is_some() {
            self.connection.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first(_: &dyn Object, _: &[&Arg]) {}
    fn second(_: &dyn Object, _: &[&Arg]) {}

    #[test]
    fn test_default_connection_type_is_auto() {
        assert_eq!(ConnectionType::default(), ConnectionType::Auto);
        assert_eq!(ConnectionPolicy::default().kind, ConnectionType::Auto);
    }

    #[test]
    fn test_unique_policy() {
        let policy = ConnectionType::Queued.unique();
        assert_eq!(policy.kind, ConnectionType::Queued);
        assert!(policy.unique);
        assert!(!ConnectionPolicy::from(ConnectionType::Direct).unique);
    }

    #[test]
    fn test_function_slots_compare_by_address() {
        let a = FunctionSlot(first);
        assert!(a.compare(&FunctionSlot(first)));
        assert!(!a.compare(&FunctionSlot(second)));
        assert!(!a.compare(&ClosureSlot::new(|_, _| {})));
    }

    #[test]
    fn test_closure_slots_never_compare() {
        let a = ClosureSlot::new(|_, _| {});
        assert!(!a.compare(&a));
    }

    #[test]
    fn test_slot_target_identity() {
        let m1 = SlotTarget::Method { index: 3, invoke: first };
        let m2 = SlotTarget::Method { index: 3, invoke: second };
        let m3 = SlotTarget::Method { index: 4, invoke: first };
        assert!(m1.same_as(&m2));
        assert!(!m1.same_as(&m3));
        assert!(!m1.same_as(&SlotTarget::Signal { index: 3 }));

        let shared: Arc<dyn SlotObject> = Arc::new(ClosureSlot::new(|_, _| {}));
        let f1 = SlotTarget::Functor(shared.clone());
        let f2 = SlotTarget::Functor(shared);
        assert!(f1.same_as(&f2));
        assert!(matches!(f1, SlotTarget::Functor(_)));
        assert_eq!(m3.method_index(), Some(4));
    }

    #[test]
    fn test_invalid_connection_handle() {
        let conn = Connection::default();
        assert!(!conn.is_connected());
        assert!(!conn.disconnect());
        assert_eq!(conn.signal_index(), None);
        assert_eq!(conn, Connection::default());
        assert_eq!(format!("{conn:?}"), "Connection(<invalid>)");
    }
}
