//! Object model for Horizon signals.
//!
//! An object is any type implementing [`Object`]. It embeds an [`ObjectBase`],
//! which carries everything the signal/slot machinery needs:
//!
//! - the object's [`MetaObject`], naming its signals and slots;
//! - its lazily created connection bookkeeping;
//! - the [`ThreadData`] of the thread it lives in;
//! - the "signals blocked" and "being destroyed" flags;
//! - a human-readable name for diagnostics.
//!
//! Objects are always shared through `Arc` and constructed with
//! [`Arc::new_cyclic`], so the base can hand out weak references to its owner.
//! Dropping the last `Arc` runs the destruction sequence: the `destroyed`
//! signal is emitted and every inbound and outbound connection is severed.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use horizon_signals::{Object, ObjectBase};
//! use horizon_signals::meta::{MetaObject, OBJECT_META, SignalMeta};
//!
//! static BUTTON_META: MetaObject = MetaObject {
//!     type_name: "Button",
//!     parent: Some(&OBJECT_META),
//!     signals: &[SignalMeta::new("clicked", &[])],
//!     methods: &[],
//! };
//!
//! struct Button {
//!     base: ObjectBase,
//! }
//!
//! impl Button {
//!     fn new() -> Arc<Self> {
//!         Arc::new_cyclic(|this| Self {
//!             base: ObjectBase::new(this, &BUTTON_META),
//!         })
//!     }
//! }
//!
//! impl Object for Button {
//!     fn object_base(&self) -> &ObjectBase {
//!         &self.base
//!     }
//! }
//!
//! let button = Button::new();
//! assert_eq!(button.meta_object().index_of_signal("clicked()"), Some(2));
//! ```

use std::any::Any;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::activate::activate;
use crate::connection_data::ConnectionData;
use crate::error::ThreadError;
use crate::logging::targets;
use crate::meta::{MetaObject, OBJECT_META, OBJECT_NAME_CHANGED_SIGNAL, SignalMeta};
use crate::mutex_pool::{Guarded, SignalSlotLock};
use crate::thread_data::ThreadData;

/// Base trait for everything that can send or receive signals.
///
/// # Related Types
///
/// - [`ObjectBase`] - State every implementor embeds
/// - [`MetaObject`] - Signals and slots of the implementing type
/// - [`object_cast`] - Downcast a `&dyn Object`
pub trait Object: Any + Send + Sync {
    /// The embedded object state.
    fn object_base(&self) -> &ObjectBase;

    /// The static meta-object for this type.
    fn meta_object(&self) -> &'static MetaObject {
        self.object_base().meta()
    }

    /// Called after a connection to one of this object's signals has been
    /// made. `signal` is `None` for connections to all signals.
    ///
    /// Runs with no signal/slot lock held, so it may connect, disconnect or
    /// emit freely.
    fn connect_notify(&self, _signal: Option<&'static SignalMeta>) {}

    /// Called after connections to one of this object's signals have been
    /// removed. `signal` is `None` when a wildcard disconnect removed
    /// connections of several signals.
    fn disconnect_notify(&self, _signal: Option<&'static SignalMeta>) {}
}

/// State shared by every [`Object`].
pub struct ObjectBase {
    this: Weak<dyn Object>,
    meta: &'static MetaObject,
    name: Mutex<String>,
    connections: Guarded<Option<Arc<ConnectionData>>>,
    thread_data: Guarded<Arc<ThreadData>>,
    blocked: AtomicBool,
    being_destroyed: AtomicBool,
}

impl ObjectBase {
    /// Creates the base for the object being built by [`Arc::new_cyclic`].
    ///
    /// The object lives in the calling thread.
    pub fn new<T: Object>(this: &Weak<T>, meta: &'static MetaObject) -> Self {
        let this: Weak<dyn Object> = this.clone();
        Self {
            this,
            meta,
            name: Mutex::new(String::new()),
            connections: Guarded::new(None),
            thread_data: Guarded::new(ThreadData::current()),
            blocked: AtomicBool::new(false),
            being_destroyed: AtomicBool::new(false),
        }
    }

    /// Identity of this object within the signal/slot system.
    #[inline]
    pub(crate) fn addr(&self) -> usize {
        ptr::from_ref(self) as usize
    }

    /// The meta-object this base was created with.
    pub fn meta(&self) -> &'static MetaObject {
        self.meta
    }

    /// The most derived class name.
    pub fn class_name(&self) -> &'static str {
        self.meta.type_name
    }

    /// A strong reference to the owning object, unless it is being dropped.
    pub fn object(&self) -> Option<Arc<dyn Object>> {
        self.this.upgrade()
    }

    pub(crate) fn weak_object(&self) -> Weak<dyn Object> {
        self.this.clone()
    }

    // =========================================================================
    // Naming
    // =========================================================================

    /// The object's name; empty unless set.
    pub fn object_name(&self) -> String {
        self.name.lock().clone()
    }

    /// Sets the object's name, emitting `objectNameChanged(String)` if it
    /// differs from the current one.
    pub fn set_object_name(&self, name: impl Into<String>) {
        let name = name.into();
        {
            let mut current = self.name.lock();
            if *current == name {
                return;
            }
            current.clone_from(&name);
        }
        activate(self, OBJECT_NAME_CHANGED_SIGNAL, &[&name]);
    }

    // =========================================================================
    // Signal blocking
    // =========================================================================

    /// Blocks or unblocks all signal emission from this object, returning the
    /// previous state.
    ///
    /// While blocked, emitting a signal has no effect at all, including on
    /// queued connections.
    pub fn block_signals(&self, block: bool) -> bool {
        self.blocked.swap(block, Ordering::AcqRel)
    }

    /// Whether signal emission is blocked.
    #[inline]
    pub fn signals_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Whether the destruction sequence has started.
    #[inline]
    pub fn is_being_destroyed(&self) -> bool {
        self.being_destroyed.load(Ordering::Acquire)
    }

    /// Marks the object as being destroyed. Returns `false` if it already was.
    pub(crate) fn begin_destruction(&self) -> bool {
        !self.being_destroyed.swap(true, Ordering::AcqRel)
    }

    /// Runs the destruction sequence now instead of when the object is dropped.
    ///
    /// Emits `destroyed`, then severs every connection from and to this
    /// object. The object stays allocated until its last `Arc` goes away but
    /// can no longer take part in connections. Calling this more than once has
    /// no further effect.
    pub fn destroy(&self) {
        crate::lifecycle::on_object_destroyed(self);
    }

    // =========================================================================
    // Threads
    // =========================================================================

    /// The thread this object lives in.
    pub fn thread(&self) -> Arc<ThreadData> {
        let lock = SignalSlotLock::lock(self.addr());
        self.thread_data(&lock)
    }

    /// Changes the thread this object lives in. `None` detaches it from any
    /// thread.
    ///
    /// Only the thread the object currently lives in may move it, except that
    /// a detached object may be pulled into the calling thread. Events already
    /// posted to the object follow it to the new thread.
    pub fn move_to_thread(&self, target: Option<&Arc<ThreadData>>) -> Result<(), ThreadError> {
        crate::lifecycle::move_to_thread(self, target)
    }

    pub(crate) fn thread_data(&self, lock: &SignalSlotLock) -> Arc<ThreadData> {
        self.thread_data.with(lock, self.addr(), |data| data.clone())
    }

    /// Installs a new thread, returning the old one for the caller to drop
    /// after unlocking.
    pub(crate) fn replace_thread_data(
        &self,
        lock: &SignalSlotLock,
        data: Arc<ThreadData>,
    ) -> Arc<ThreadData> {
        self.thread_data
            .with(lock, self.addr(), |current| std::mem::replace(current, data))
    }

    // =========================================================================
    // Connection bookkeeping
    // =========================================================================

    pub(crate) fn connection_data(&self, lock: &SignalSlotLock) -> Option<Arc<ConnectionData>> {
        self.connections.with(lock, self.addr(), |data| data.clone())
    }

    pub(crate) fn ensure_connection_data(&self, lock: &SignalSlotLock) -> Arc<ConnectionData> {
        let addr = self.addr();
        self.connections.with(lock, addr, |data| {
            data.get_or_insert_with(|| ConnectionData::new(addr)).clone()
        })
    }

    pub(crate) fn take_connection_data(
        &self,
        lock: &SignalSlotLock,
    ) -> Option<Arc<ConnectionData>> {
        self.connections.with(lock, self.addr(), Option::take)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Whether anything listens to the signal at `signal_index`, counting
    /// connections to all signals.
    pub fn is_signal_connected(&self, signal_index: i32) -> bool {
        let lock = SignalSlotLock::lock(self.addr());
        self.connection_data(&lock)
            .is_some_and(|data| data.is_signal_connected(&lock, signal_index))
    }

    /// Number of live connections to the signal named by `signature`.
    ///
    /// Returns 0, with a warning, if the signal does not exist.
    pub fn receivers(&self, signature: &str) -> usize {
        match self.meta.index_of_signal(signature) {
            Some(index) => self.receivers_at(index),
            None => {
                tracing::warn!(
                    target: targets::CONNECT,
                    class = self.class_name(),
                    signature,
                    "receivers: no such signal"
                );
                0
            }
        }
    }

    /// Number of live connections to the signal at `signal_index`.
    pub fn receivers_at(&self, signal_index: i32) -> usize {
        let lock = SignalSlotLock::lock(self.addr());
        self.connection_data(&lock)
            .map_or(0, |data| data.connections_of(&lock, signal_index).len())
    }

    /// The object whose signal is being delivered to this object right now.
    ///
    /// Only set while a slot of this object runs in this object's thread
    /// (direct calls made from this thread, and queued calls). Returns `None`
    /// otherwise, or if the sender has since disconnected from this object.
    pub fn sender(&self) -> Option<Arc<dyn Object>> {
        self.current_sender().map(|(sender, _)| sender)?.upgrade()
    }

    /// The index of the signal being delivered to this object right now.
    pub fn sender_signal_index(&self) -> Option<i32> {
        self.current_sender().map(|(_, index)| index)
    }

    fn current_sender(&self) -> Option<(Weak<dyn Object>, i32)> {
        let lock = SignalSlotLock::lock(self.addr());
        let data = self.connection_data(&lock)?;
        let (sender, sender_addr, index) = data.with_state(&lock, |state| {
            state
                .current_sender
                .as_ref()
                .map(|c| (c.sender.clone(), c.sender_addr, c.signal_index))
        })?;
        let still_connected = data
            .senders(&lock)
            .iter()
            .any(|record| record.sender_addr == sender_addr);
        still_connected.then_some((sender, index))
    }

    /// Every object with a live connection into this one, newest first.
    ///
    /// An object appears once per connection.
    pub fn sender_list(&self) -> Vec<Arc<dyn Object>> {
        let weak: Vec<Weak<dyn Object>> = {
            let lock = SignalSlotLock::lock(self.addr());
            self.connection_data(&lock)
                .map(|data| data.senders(&lock).iter().map(|r| r.sender.clone()).collect())
                .unwrap_or_default()
        };
        weak.iter().filter_map(Weak::upgrade).collect()
    }

    /// The receivers connected to the signal at `signal_index`, in
    /// connection order.
    pub fn receiver_list(&self, signal_index: i32) -> Vec<Arc<dyn Object>> {
        let weak: Vec<Weak<dyn Object>> = {
            let lock = SignalSlotLock::lock(self.addr());
            self.connection_data(&lock)
                .map(|data| {
                    data.connections_of(&lock, signal_index)
                        .iter()
                        .map(|r| r.receiver_ref.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        weak.iter().filter_map(Weak::upgrade).collect()
    }

    /// Renders this object's connections and logs them at debug level.
    pub fn dump_object_info(&self) -> String {
        let info = crate::logging::render_object_info(self);
        tracing::debug!(target: targets::LIFECYCLE, "\n{info}");
        info
    }
}

impl Drop for ObjectBase {
    fn drop(&mut self) {
        crate::lifecycle::on_object_destroyed(self);
    }
}

impl fmt::Debug for ObjectBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBase")
            .field("class", &self.class_name())
            .field("name", &*self.name.lock())
            .field("blocked", &self.signals_blocked())
            .field("being_destroyed", &self.is_being_destroyed())
            .finish_non_exhaustive()
    }
}

/// A plain object with only the `destroyed` signal.
///
/// Useful as a connection context for functor slots and in tests.
pub struct BasicObject {
    base: ObjectBase,
}

impl BasicObject {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            base: ObjectBase::new(this, &OBJECT_META),
        })
    }
}

impl Object for BasicObject {
    fn object_base(&self) -> &ObjectBase {
        &self.base
    }
}

/// Blocks an object's signals for the lifetime of the guard.
///
/// The previous blocking state is restored on drop.
#[must_use = "signals are unblocked as soon as the blocker is dropped"]
pub struct SignalBlocker<'a> {
    object: &'a ObjectBase,
    was_blocked: bool,
    inhibited: bool,
}

impl<'a> SignalBlocker<'a> {
    pub fn new(object: &'a dyn Object) -> Self {
        let object = object.object_base();
        Self {
            was_blocked: object.block_signals(true),
            object,
            inhibited: false,
        }
    }

    /// Restores the previous state early. The guard then does nothing on drop
    /// unless [`reblock`](Self::reblock) is called.
    pub fn unblock(&mut self) {
        self.object.block_signals(self.was_blocked);
        self.inhibited = true;
    }

    /// Blocks signals again after [`unblock`](Self::unblock).
    pub fn reblock(&mut self) {
        self.object.block_signals(true);
        self.inhibited = false;
    }
}

impl Drop for SignalBlocker<'_> {
    fn drop(&mut self) {
        if !self.inhibited {
            self.object.block_signals(self.was_blocked);
        }
    }
}

/// Safe downcast function for [`Object`] trait objects.
///
/// Returns `Some(&T)` if the object is of type `T`, otherwise `None`.
pub fn object_cast<T: Object>(obj: &dyn Object) -> Option<&T> {
    (obj as &dyn Any).downcast_ref::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ClosureSlot, ConnectionType};

    struct Counter {
        base: ObjectBase,
        value: i32,
    }

    impl Object for Counter {
        fn object_base(&self) -> &ObjectBase {
            &self.base
        }
    }

    fn counter(value: i32) -> Arc<Counter> {
        Arc::new_cyclic(|this| Counter {
            base: ObjectBase::new(this, &OBJECT_META),
            value,
        })
    }

    #[test]
    fn test_object_name() {
        let obj = BasicObject::new();
        assert_eq!(obj.object_base().object_name(), "");
        obj.object_base().set_object_name("first");
        assert_eq!(obj.object_base().object_name(), "first");
    }

    #[test]
    fn test_object_name_changed_emitted_on_change_only() {
        let obj = BasicObject::new();
        let observer = BasicObject::new();
        let names = Arc::new(Mutex::new(Vec::new()));
        let seen = names.clone();
        crate::connect::connect_functor(
            &*obj,
            "objectNameChanged(String)",
            &*observer,
            ClosureSlot::new(move |_, args| {
                if let Some(name) = args.first().and_then(|a| a.downcast_ref::<String>()) {
                    seen.lock().push(name.clone());
                }
            }),
            ConnectionType::Direct,
        )
        .unwrap();

        obj.object_base().set_object_name("first");
        obj.object_base().set_object_name("first");
        obj.object_base().set_object_name("second");
        assert_eq!(*names.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_meta_object_defaults_to_base() {
        let obj = BasicObject::new();
        assert!(ptr::eq(obj.meta_object(), &OBJECT_META));
        assert_eq!(obj.object_base().class_name(), "Object");
    }

    #[test]
    fn test_object_upgrades_to_itself() {
        let obj = BasicObject::new();
        let again = obj.object_base().object().unwrap();
        assert_eq!(again.object_base().addr(), obj.object_base().addr());
    }

    #[test]
    fn test_object_cast() {
        let obj = counter(7);
        let dynamic: &dyn Object = &*obj;
        assert_eq!(object_cast::<Counter>(dynamic).map(|c| c.value), Some(7));
        assert!(object_cast::<BasicObject>(dynamic).is_none());
    }

    #[test]
    fn test_lives_in_creating_thread() {
        let obj = BasicObject::new();
        assert!(Arc::ptr_eq(&obj.object_base().thread(), &ThreadData::current()));
    }

    // ------------------------------------------------------------------
    // Blocking
    // ------------------------------------------------------------------

    #[test]
    fn test_block_signals_returns_previous() {
        let obj = BasicObject::new();
        let base = obj.object_base();
        assert!(!base.block_signals(true));
        assert!(base.signals_blocked());
        assert!(base.block_signals(false));
        assert!(!base.signals_blocked());
    }

    #[test]
    fn test_signal_blocker_restores_state() {
        let obj = BasicObject::new();
        {
            let _blocker = SignalBlocker::new(&*obj);
            assert!(obj.object_base().signals_blocked());
        }
        assert!(!obj.object_base().signals_blocked());

        obj.object_base().block_signals(true);
        {
            let _blocker = SignalBlocker::new(&*obj);
        }
        assert!(obj.object_base().signals_blocked());
    }

    #[test]
    fn test_signal_blocker_unblock_reblock() {
        let obj = BasicObject::new();
        let mut blocker = SignalBlocker::new(&*obj);
        blocker.unblock();
        assert!(!obj.object_base().signals_blocked());
        blocker.reblock();
        assert!(obj.object_base().signals_blocked());
        drop(blocker);
        assert!(!obj.object_base().signals_blocked());
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    #[test]
    fn test_destroy_is_idempotent() {
        let obj = BasicObject::new();
        let fired = Arc::new(Mutex::new(0));
        let fired_clone = fired.clone();
        let watcher = BasicObject::new();
        crate::connect::connect_functor(
            &*obj,
            "destroyed()",
            &*watcher,
            ClosureSlot::new(move |_, _| *fired_clone.lock() += 1),
            ConnectionType::Direct,
        )
        .unwrap();

        obj.object_base().destroy();
        assert!(obj.object_base().is_being_destroyed());
        obj.object_base().destroy();
        drop(obj);
        assert_eq!(*fired.lock(), 1);
        assert!(watcher.object_base().sender_list().is_empty());
    }
}
