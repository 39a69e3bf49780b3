//! Typed signal handles.
//!
//! The core API addresses signals by index and passes arguments type-erased.
//! A [`Signal<Args>`] wraps a signal index together with its argument tuple
//! type so emitting and connecting closures is checked at compile time.
//!
//! # Key Types
//!
//! - [`Signal<Args>`] - A typed handle to one declared signal
//! - [`SignalArgs`] - Argument tuples a signal can carry (up to four values)
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//! use horizon_signals::meta::{MetaObject, SignalMeta, OBJECT_META};
//! use horizon_signals::{ConnectionType, Object, ObjectBase, Signal};
//!
//! static THERMOMETER_META: MetaObject = MetaObject {
//!     type_name: "Thermometer",
//!     parent: Some(&OBJECT_META),
//!     signals: &[SignalMeta::new("temperatureChanged", &["f64"])],
//!     methods: &[],
//! };
//!
//! struct Thermometer {
//!     base: ObjectBase,
//!     readings: Mutex<Vec<f64>>,
//! }
//!
//! impl Thermometer {
//!     const TEMPERATURE_CHANGED: Signal<(f64,)> = Signal::new(2);
//!
//!     fn new() -> Arc<Self> {
//!         Arc::new_cyclic(|this| Self {
//!             base: ObjectBase::new(this, &THERMOMETER_META),
//!             readings: Mutex::new(Vec::new()),
//!         })
//!     }
//! }
//!
//! impl Object for Thermometer {
//!     fn object_base(&self) -> &ObjectBase {
//!         &self.base
//!     }
//! }
//!
//! let sensor = Thermometer::new();
//! let display = Thermometer::new();
//! Thermometer::TEMPERATURE_CHANGED
//!     .connect(
//!         &*sensor,
//!         &*display,
//!         |display, (value,)| display.readings.lock().push(value),
//!         ConnectionType::Auto,
//!     )
//!     .unwrap();
//!
//! Thermometer::TEMPERATURE_CHANGED.emit(&*sensor, (21.5,));
//! assert_eq!(*display.readings.lock(), vec![21.5]);
//! ```

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::activate::activate;
use crate::connect::connect_functor_at;
use crate::connection::{ClosureSlot, Connection, ConnectionPolicy};
use crate::error::ConnectError;
use crate::logging::targets;
use crate::meta::Arg;
use crate::object::{Object, object_cast};

/// Argument tuples a [`Signal`] can carry.
pub trait SignalArgs: Sized + Send + Sync + 'static {
    /// Number of values in the tuple.
    const ARITY: usize;

    /// Calls `f` with the values as type-erased arguments.
    fn with_args<R>(&self, f: impl FnOnce(&[&Arg]) -> R) -> R;

    /// Rebuilds the tuple from type-erased arguments, or `None` if they do
    /// not have the expected types.
    fn from_args(args: &[&Arg]) -> Option<Self>;
}

macro_rules! impl_signal_args {
    ($arity:expr; $($name:ident : $idx:tt),*) => {
        impl<$($name: Any + Clone + Send + Sync),*> SignalArgs for ($($name,)*) {
            const ARITY: usize = $arity;

            fn with_args<R>(&self, f: impl FnOnce(&[&Arg]) -> R) -> R {
                f(&[$(&self.$idx as &Arg),*])
            }

            #[allow(unused_variables)]
            fn from_args(args: &[&Arg]) -> Option<Self> {
                Some(($(args.get($idx)?.downcast_ref::<$name>()?.clone(),)*))
            }
        }
    };
}

impl_signal_args!(0;);
impl_signal_args!(1; A: 0);
impl_signal_args!(2; A: 0, B: 1);
impl_signal_args!(3; A: 0, B: 1, C: 2);
impl_signal_args!(4; A: 0, B: 1, C: 2, D: 3);

/// A typed handle to the signal at a fixed index.
///
/// Handles carry no state; they are usually declared as associated constants
/// of the emitting type.
pub struct Signal<Args> {
    index: i32,
    _args: PhantomData<fn(Args)>,
}

impl<Args: SignalArgs> Signal<Args> {
    /// A handle to the signal at `index` in the emitter's meta-object.
    pub const fn new(index: i32) -> Self {
        Self {
            index,
            _args: PhantomData,
        }
    }

    /// The signal index.
    pub const fn index(&self) -> i32 {
        self.index
    }

    /// Emits the signal from `sender`.
    #[tracing::instrument(
        skip_all,
        target = "horizon_signals::activate",
        level = "trace",
        fields(signal_index = self.index)
    )]
    pub fn emit(&self, sender: &dyn Object, args: Args) {
        args.with_args(|args| activate(sender.object_base(), self.index, args));
    }

    /// Connects the signal of `sender` to a closure run against `receiver`.
    ///
    /// The closure receives the receiver itself and the argument tuple. The
    /// connection follows `receiver`'s thread like any other and is severed
    /// when either object is destroyed.
    pub fn connect<R, F>(
        &self,
        sender: &dyn Object,
        receiver: &R,
        slot: F,
        policy: impl Into<ConnectionPolicy>,
    ) -> Result<Connection, ConnectError>
    where
        R: Object,
        F: Fn(&R, Args) + Send + Sync + 'static,
    {
        let meta = sender.meta_object();
        if let Some(signal) = meta.signal(self.index) {
            if signal.param_types.len() != Args::ARITY {
                let error = ConnectError::IncompatibleArguments {
                    signal: signal.signature(),
                    slot: format!("closure taking {} argument(s)", Args::ARITY),
                };
                tracing::warn!(target: targets::CONNECT, %error, "connect rejected");
                return Err(error);
            }
        }

        let index = self.index;
        let slot = ClosureSlot::new(move |receiver: &dyn Object, args: &[&Arg]| {
            let Some(receiver) = object_cast::<R>(receiver) else {
                return;
            };
            match Args::from_args(args) {
                Some(args) => slot(receiver, args),
                None => tracing::warn!(
                    target: targets::ACTIVATE,
                    signal_index = index,
                    "typed slot skipped: arguments do not match its parameter types"
                ),
            }
        });
        connect_functor_at(sender, self.index, receiver, Arc::new(slot), policy.into())
    }
}

impl<Args> Clone for Signal<Args> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Args> Copy for Signal<Args> {}

impl<Args> fmt::Debug for Signal<Args> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("index", &self.index)
            .field("args", &std::any::type_name::<Args>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionType;
    use crate::meta::{MetaObject, OBJECT_META, SignalMeta};
    use crate::object::ObjectBase;
    use crate::thread_data::ThreadData;
    use parking_lot::Mutex;

    static SLIDER_META: MetaObject = MetaObject {
        type_name: "Slider",
        parent: Some(&OBJECT_META),
        signals: &[
            SignalMeta::new("valueChanged", &["i32"]),
            SignalMeta::new("rangeChanged", &["i32", "i32"]),
            SignalMeta::new("labelChanged", &["String", "bool"]),
        ],
        methods: &[],
    };

    struct Slider {
        base: ObjectBase,
        log: Mutex<Vec<String>>,
    }

    impl Slider {
        const VALUE_CHANGED: Signal<(i32,)> = Signal::new(2);
        const RANGE_CHANGED: Signal<(i32, i32)> = Signal::new(3);
        const LABEL_CHANGED: Signal<(String, bool)> = Signal::new(4);
        const DESTROYED: Signal<()> = Signal::new(0);

        fn new() -> Arc<Self> {
            Arc::new_cyclic(|this| Self {
                base: ObjectBase::new(this, &SLIDER_META),
                log: Mutex::new(Vec::new()),
            })
        }
    }

    impl Object for Slider {
        fn object_base(&self) -> &ObjectBase {
            &self.base
        }
    }

    #[test]
    fn test_typed_emit_and_connect() {
        let slider = Slider::new();
        let view = Slider::new();
        Slider::VALUE_CHANGED
            .connect(
                &*slider,
                &*view,
                |view, (v,)| view.log.lock().push(format!("value {v}")),
                ConnectionType::Direct,
            )
            .unwrap();
        Slider::RANGE_CHANGED
            .connect(
                &*slider,
                &*view,
                |view, (lo, hi)| view.log.lock().push(format!("range {lo}..{hi}")),
                ConnectionType::Direct,
            )
            .unwrap();

        Slider::VALUE_CHANGED.emit(&*slider, (4,));
        Slider::RANGE_CHANGED.emit(&*slider, (0, 10));
        assert_eq!(*view.log.lock(), vec!["value 4", "range 0..10"]);
    }

    #[test]
    fn test_arity_mismatch_rejected() {
        let slider = Slider::new();
        let wrong: Signal<(i32, i32)> = Signal::new(2);
        let result = wrong.connect(&*slider, &*slider, |_, _| {}, ConnectionType::Direct);
        assert!(matches!(result, Err(ConnectError::IncompatibleArguments { .. })));
    }

    #[test]
    fn test_typed_queued_delivery_copies_arguments() {
        let slider = Slider::new();
        let view = Slider::new();
        Slider::LABEL_CHANGED
            .connect(
                &*slider,
                &*view,
                |view, (text, bold)| view.log.lock().push(format!("{text}:{bold}")),
                ConnectionType::Queued,
            )
            .unwrap();

        Slider::LABEL_CHANGED.emit(&*slider, ("Volume".to_owned(), true));
        assert!(view.log.lock().is_empty());
        ThreadData::current().process_events();
        assert_eq!(*view.log.lock(), vec!["Volume:true"]);
    }

    #[test]
    fn test_unit_signal() {
        let slider = Slider::new();
        let view = Slider::new();
        Slider::DESTROYED
            .connect(
                &*slider,
                &*view,
                |view, ()| view.log.lock().push("gone".into()),
                ConnectionType::Direct,
            )
            .unwrap();
        drop(slider);
        assert_eq!(*view.log.lock(), vec!["gone"]);
    }

    #[test]
    fn test_signal_args_round_trip_types() {
        let args = (7u8, "x".to_owned());
        let rebuilt = args.with_args(<(u8, String)>::from_args);
        assert_eq!(rebuilt, Some(args));
        assert_eq!(<(u8, String)>::from_args(&[&7u8]), None);
        assert_eq!(<(u8, String)>::from_args(&[&7u8, &7u8]), None);
    }
}
