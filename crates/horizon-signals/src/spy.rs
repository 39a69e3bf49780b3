//! Process-wide hooks observing every signal activation.
//!
//! Test harnesses and debugging tools install a [`SignalSpyCallbacks`] to be
//! told when a signal starts and finishes activating, and when a declared slot
//! is entered and left. Slot hooks are not called for functor connections.
//! The hooks run on the emitting thread with no signal/slot lock held.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::meta::Arg;
use crate::object::{Object, ObjectBase};

pub type SignalBeginCallback = Box<dyn Fn(&ObjectBase, i32, &[&Arg]) + Send + Sync>;
pub type SignalEndCallback = Box<dyn Fn(&ObjectBase, i32) + Send + Sync>;
pub type SlotBeginCallback = Box<dyn Fn(&dyn Object, usize, &[&Arg]) + Send + Sync>;
pub type SlotEndCallback = Box<dyn Fn(&dyn Object, usize) + Send + Sync>;

/// A set of activation hooks. Unset hooks cost nothing.
#[derive(Default)]
pub struct SignalSpyCallbacks {
    /// Called before a signal's connections are walked.
    pub signal_begin: Option<SignalBeginCallback>,
    /// Called after a signal's connections have been walked.
    pub signal_end: Option<SignalEndCallback>,
    /// Called before a declared slot is invoked directly.
    pub slot_begin: Option<SlotBeginCallback>,
    /// Called after a declared slot invoked directly has returned.
    pub slot_end: Option<SlotEndCallback>,
}

impl SignalSpyCallbacks {
    pub(crate) fn signal_begin(&self, sender: &ObjectBase, signal_index: i32, args: &[&Arg]) {
        if let Some(hook) = &self.signal_begin {
            hook(sender, signal_index, args);
        }
    }

    pub(crate) fn signal_end(&self, sender: &ObjectBase, signal_index: i32) {
        if let Some(hook) = &self.signal_end {
            hook(sender, signal_index);
        }
    }

    pub(crate) fn slot_begin(&self, receiver: &dyn Object, method_index: usize, args: &[&Arg]) {
        if let Some(hook) = &self.slot_begin {
            hook(receiver, method_index, args);
        }
    }

    pub(crate) fn slot_end(&self, receiver: &dyn Object, method_index: usize) {
        if let Some(hook) = &self.slot_end {
            hook(receiver, method_index);
        }
    }
}

static SPY: RwLock<Option<Arc<SignalSpyCallbacks>>> = parking_lot::const_rwlock(None);

/// Installs `callbacks` process-wide, replacing any previous set. `None`
/// removes them.
///
/// Activations already running keep the set they started with.
pub fn register_signal_spy_callbacks(callbacks: Option<SignalSpyCallbacks>) {
    let previous = std::mem::replace(&mut *SPY.write(), callbacks.map(Arc::new));
    drop(previous);
}

pub(crate) fn current() -> Option<Arc<SignalSpyCallbacks>> {
    SPY.read().clone()
}
