//! Thread-aware signal/slot connections for Horizon object graphs.
//!
//! This crate provides the connection and dispatch core of the Horizon object
//! model:
//!
//! - **Objects**: types embedding an [`ObjectBase`] and describing their
//!   signals and slots through a static [`MetaObject`]
//! - **Connections**: links from a signal of one object to a slot, a signal
//!   or a closure of another, established by name, by index or by closure
//! - **Activation**: emitting a signal runs its connections in connection
//!   order, directly or through the receiver thread's event queue
//! - **Lifecycle**: destroying either end severs a connection safely, even
//!   while it is being activated on another thread
//! - **Threads**: objects live in a thread; [`EventThread`] runs an event loop
//!   for objects moved to it
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//! use horizon_signals::meta::{Arg, MetaObject, MethodMeta, SignalMeta, OBJECT_META};
//! use horizon_signals::{activate, connect, object_cast, ConnectionType, Object, ObjectBase};
//!
//! static SPINBOX_META: MetaObject = MetaObject {
//!     type_name: "SpinBox",
//!     parent: Some(&OBJECT_META),
//!     signals: &[SignalMeta::new("valueChanged", &["i32"])],
//!     methods: &[MethodMeta::new("setValue", &["i32"], SpinBox::set_value_slot)],
//! };
//!
//! struct SpinBox {
//!     base: ObjectBase,
//!     value: Mutex<i32>,
//! }
//!
//! impl SpinBox {
//!     fn new() -> Arc<Self> {
//!         Arc::new_cyclic(|this| Self {
//!             base: ObjectBase::new(this, &SPINBOX_META),
//!             value: Mutex::new(0),
//!         })
//!     }
//!
//!     fn set_value(&self, value: i32) {
//!         let changed = std::mem::replace(&mut *self.value.lock(), value) != value;
//!         if changed {
//!             activate(&self.base, 2, &[&value]);
//!         }
//!     }
//!
//!     fn set_value_slot(receiver: &dyn Object, args: &[&Arg]) {
//!         let target = object_cast::<SpinBox>(receiver);
//!         let value = args.first().and_then(|a| a.downcast_ref::<i32>());
//!         if let (Some(target), Some(value)) = (target, value) {
//!             target.set_value(*value);
//!         }
//!     }
//! }
//!
//! impl Object for SpinBox {
//!     fn object_base(&self) -> &ObjectBase {
//!         &self.base
//!     }
//! }
//!
//! let a = SpinBox::new();
//! let b = SpinBox::new();
//! connect(&*a, "valueChanged(i32)", &*b, "setValue(i32)", ConnectionType::Auto).unwrap();
//! connect(&*b, "valueChanged(i32)", &*a, "setValue(i32)", ConnectionType::Auto).unwrap();
//!
//! a.set_value(7);
//! assert_eq!(*b.value.lock(), 7);
//! ```
//!
//! # Threads
//!
//! Every object lives in the thread that created it until moved with
//! [`ObjectBase::move_to_thread`]. A connection of type
//! [`ConnectionType::Auto`] calls its slot directly when the signal is emitted
//! in the receiver's thread and posts it to the receiver's event queue
//! otherwise. Queued arguments are copied through the
//! [`TypeRegistry`](meta::TypeRegistry), so their types must be registered.

mod activate;
mod connect;
mod connection;
mod connection_data;
mod error;
mod event;
pub mod event_thread;
pub mod invocation;
mod lifecycle;
pub mod logging;
pub mod meta;
mod mutex_pool;
mod object;
pub mod signal;
pub mod spy;
mod thread_data;

pub use activate::activate;
pub use connect::{
    connect, connect_all_signals, connect_functor, connect_method, disconnect,
    disconnect_connection, disconnect_functor, disconnect_method, disconnect_one,
};
pub use connection::{
    ANY_SIGNAL, ClosureSlot, Connection, ConnectionGuard, ConnectionPolicy, ConnectionType,
    FunctionSlot, SlotObject,
};
pub use error::{ConnectError, DispatchError, Result, SignalsError, ThreadError};
pub use event::{Event, MetaCallEvent};
pub use event_thread::{EventThread, EventThreadBuilder, EventThreadConfig};
pub use logging::dump_object_info;
pub use meta::{MetaObject, MethodMeta, SignalMeta, TypeRegistry, register_type};
pub use mutex_pool::MUTEX_POOL_SIZE;
pub use object::{BasicObject, Object, ObjectBase, SignalBlocker, object_cast};
pub use signal::{Signal, SignalArgs};
pub use spy::{SignalSpyCallbacks, register_signal_spy_callbacks};
pub use thread_data::ThreadData;

static_assertions::assert_impl_all!(Connection: Send, Sync);
static_assertions::assert_impl_all!(ConnectionGuard: Send, Sync);
static_assertions::assert_impl_all!(ThreadData: Send, Sync);
static_assertions::assert_impl_all!(ObjectBase: Send, Sync);
static_assertions::assert_impl_all!(EventThread: Send, Sync);
static_assertions::assert_impl_all!(Signal<(i32, String)>: Send, Sync, Copy);
