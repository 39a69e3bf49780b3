//! Error types for Horizon Signals.
//!
//! Connection errors are returned to the caller *and* logged; nothing in this
//! crate panics on ordinary misuse. Dispatch errors are never returned: an
//! emitter must not fail because one of its receivers cannot be reached, so
//! they only surface as `warn` diagnostics.

use std::io;

/// Result type alias for operations in this crate.
pub type Result<T> = std::result::Result<T, SignalsError>;

/// The main error type for Horizon Signals operations.
#[derive(Debug, thiserror::Error)]
pub enum SignalsError {
    /// A connect request was rejected.
    #[error("connect failed: {0}")]
    Connect(#[from] ConnectError),
    /// A thread-affinity operation was rejected.
    #[error("thread error: {0}")]
    Thread(#[from] ThreadError),
}

/// Why a connection could not be established.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The sender is being destroyed.
    #[error("sender {class} is being destroyed")]
    InvalidSender { class: &'static str },

    /// The receiver is being destroyed.
    #[error("receiver {class} is being destroyed")]
    InvalidReceiver { class: &'static str },

    /// The signal signature does not name a signal of the sender.
    #[error("no such signal {class}::{signature}")]
    NoSuchSignal {
        class: &'static str,
        signature: String,
    },

    /// The slot signature names neither a slot nor a signal of the receiver.
    #[error("no such slot {class}::{signature}")]
    NoSuchSlot {
        class: &'static str,
        signature: String,
    },

    /// A raw signal index is outside the sender's signal table.
    #[error("signal index {index} out of range for {class}")]
    SignalIndexOutOfRange { class: &'static str, index: i32 },

    /// A raw method index is outside the receiver's slot table.
    #[error("method index {index} out of range for {class}")]
    MethodIndexOutOfRange { class: &'static str, index: usize },

    /// The slot needs parameters the signal does not provide.
    #[error("incompatible sender/receiver arguments {signal} --> {slot}")]
    IncompatibleArguments { signal: String, slot: String },

    /// A unique connection was requested and an identical one exists.
    #[error("connection already exists")]
    AlreadyConnected,
}

impl ConnectError {
    /// Create a missing-signal error.
    pub fn no_such_signal(class: &'static str, signature: impl Into<String>) -> Self {
        Self::NoSuchSignal {
            class,
            signature: signature.into(),
        }
    }

    /// Create a missing-slot error.
    pub fn no_such_slot(class: &'static str, signature: impl Into<String>) -> Self {
        Self::NoSuchSlot {
            class,
            signature: signature.into(),
        }
    }
}

/// Problems detected while delivering a signal.
///
/// These are logged and the affected delivery is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// A queued delivery needs a parameter type that was never registered.
    #[error(
        "cannot queue arguments of type '{type_name}' for signal {signal} \
         (make sure '{type_name}' is registered with register_type)"
    )]
    UnregisteredArgumentType {
        type_name: &'static str,
        signal: String,
    },

    /// Fewer arguments were emitted than the signal declares.
    #[error("signal {signal} expects {expected} arguments, {actual} were emitted")]
    ArgumentCountMismatch {
        signal: String,
        expected: usize,
        actual: usize,
    },

    /// An emitted argument does not have the declared parameter type.
    #[error("argument {position} of signal {signal} is not a '{type_name}'")]
    ArgumentTypeMismatch {
        signal: String,
        position: usize,
        type_name: &'static str,
    },

    /// A blocking-queued connection was activated from the receiver's own thread.
    #[error(
        "dead lock detected while activating a blocking-queued connection: \
         sender is {sender}, receiver is {receiver}"
    )]
    BlockingQueuedDeadlock {
        sender: &'static str,
        receiver: &'static str,
    },
}

/// Why a thread-affinity operation failed.
#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    /// `move_to_thread` was called from a thread that does not own the object.
    #[error("cannot move {class} to another thread from a thread that does not own it")]
    NotOwnerThread { class: &'static str },

    /// The object is being destroyed.
    #[error("{class} is being destroyed")]
    ObjectDestroyed { class: &'static str },

    /// The operating system refused to start an event thread.
    #[error("failed to spawn event thread: {0}")]
    Spawn(#[source] io::Error),
}
