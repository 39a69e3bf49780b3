//! Logging and debugging facilities for Horizon signals.
//!
//! This module provides:
//! - Target and span names for filtering the crate's `tracing` output
//! - A textual dump of an object's connections
//!
//! # Tracing Integration
//!
//! Horizon signals uses the `tracing` crate for instrumentation. Rejected
//! connections, undeliverable queued arguments and thread misuse are reported
//! at `warn` level; connection bookkeeping is traced at `trace` level. To see
//! logs, install a tracing subscriber in your application:
//!
//! ```ignore
//! fn main() {
//!     tracing_subscriber::fmt()
//!         .with_env_filter("horizon_signals::connect=debug,horizon_signals::activate=warn")
//!         .init();
//! }
//! ```

use std::fmt::Write as FmtWrite;
use std::sync::Arc;

use crate::connection::{ANY_SIGNAL, ConnectionRecord, SlotTarget};
use crate::meta::MetaObject;
use crate::mutex_pool::SignalSlotLock;
use crate::object::{Object, ObjectBase};

/// Span names used throughout Horizon signals for tracing.
pub mod span_names {
    /// Signal activation span.
    pub const ACTIVATE: &str = "horizon_signals::activate";
    /// Connection creation span.
    pub const CONNECT: &str = "horizon_signals::connect";
    /// Disconnection span.
    pub const DISCONNECT: &str = "horizon_signals::disconnect";
    /// Object destruction span.
    pub const DESTROY: &str = "horizon_signals::destroy";
}

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Connect and disconnect.
    pub const CONNECT: &str = "horizon_signals::connect";
    /// Signal emission and delivery.
    pub const ACTIVATE: &str = "horizon_signals::activate";
    /// Object destruction.
    pub const LIFECYCLE: &str = "horizon_signals::lifecycle";
    /// Thread affinity and event queues.
    pub const THREAD: &str = "horizon_signals::thread";
    /// Meta-objects and the type registry.
    pub const META: &str = "horizon_signals::meta";
}

/// Renders the connections of `object`.
///
/// ```text
/// OBJECT Emitter::source
///   SIGNALS OUT
///         signal: valueChanged(i32)
///           --> Recorder::sink record(i32)
///           --> <functor or function pointer>
///   SIGNALS IN
///         <None>
/// ```
pub fn dump_object_info(object: &dyn Object) -> String {
    render_object_info(object.object_base())
}

pub(crate) fn render_object_info(base: &ObjectBase) -> String {
    let (outbound, inbound) = snapshot(base);

    let mut out = String::new();
    let _ = writeln!(out, "OBJECT {}", describe(base));

    let _ = writeln!(out, "  SIGNALS OUT");
    if outbound.is_empty() {
        let _ = writeln!(out, "        <None>");
    }
    for (signal_index, records) in &outbound {
        let _ = writeln!(out, "        signal: {}", signal_name(base.meta(), *signal_index));
        for record in records {
            match record.receiver_ref.upgrade() {
                Some(receiver) if record.is_connected() => {
                    let _ = writeln!(
                        out,
                        "          --> {} {}",
                        describe(receiver.object_base()),
                        slot_name(receiver.meta_object(), &record.target)
                    );
                }
                _ => {
                    let _ = writeln!(out, "          <Disconnected receiver>");
                }
            }
        }
    }

    let _ = writeln!(out, "  SIGNALS IN");
    if inbound.is_empty() {
        let _ = writeln!(out, "        <None>");
    }
    for record in &inbound {
        let sender = record
            .sender
            .upgrade()
            .map_or_else(|| "<destroyed sender>".to_owned(), |s| describe(s.object_base()));
        let _ = writeln!(out, "          <-- {sender} {}", slot_name(base.meta(), &record.target));
    }
    out
}

type Outbound = Vec<(i32, Vec<Arc<ConnectionRecord>>)>;

fn snapshot(base: &ObjectBase) -> (Outbound, Vec<Arc<ConnectionRecord>>) {
    let lock = SignalSlotLock::lock(base.addr());
    let Some(data) = base.connection_data(&lock) else {
        return Default::default();
    };
    let count = data.with_state(&lock, |state| state.signal_vector_count());
    let outbound = (ANY_SIGNAL..count)
        .map(|index| (index, data.connections_of(&lock, index)))
        .filter(|(_, records)| !records.is_empty())
        .collect();
    let inbound = data.senders(&lock);
    (outbound, inbound)
}

fn describe(base: &ObjectBase) -> String {
    let name = base.object_name();
    let name = if name.is_empty() { "unnamed" } else { name.as_str() };
    format!("{}::{name}", base.class_name())
}

fn signal_name(meta: &'static MetaObject, index: i32) -> String {
    if index == ANY_SIGNAL {
        return "<all signals>".to_owned();
    }
    meta.signal(index)
        .map_or_else(|| format!("<signal {index}>"), |s| s.signature())
}

fn slot_name(meta: &'static MetaObject, target: &SlotTarget) -> String {
    match target {
        SlotTarget::Method { index, .. } => meta
            .method(*index)
            .map_or_else(|| format!("<slot {index}>"), |m| m.signature()),
        SlotTarget::Signal { index } => signal_name(meta, *index),
        SlotTarget::Functor(_) => "<functor or function pointer>".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::connect_functor;
    use crate::connection::{ClosureSlot, ConnectionType};
    use crate::object::BasicObject;

    #[test]
    fn test_dump_unconnected() {
        let obj = BasicObject::new();
        let output = dump_object_info(&*obj);
        assert!(output.starts_with("OBJECT Object::unnamed"));
        assert_eq!(output.matches("<None>").count(), 2);
    }

    #[test]
    fn test_dump_functor_connection() {
        let sender = BasicObject::new();
        let receiver = BasicObject::new();
        sender.object_base().set_object_name("source");
        connect_functor(
            &*sender,
            "destroyed",
            &*receiver,
            ClosureSlot::new(|_, _| {}),
            ConnectionType::Direct,
        )
        .unwrap();

        let out = dump_object_info(&*sender);
        assert!(out.contains("OBJECT Object::source"));
        assert!(out.contains("signal: destroyed()"));
        assert!(out.contains("<functor or function pointer>"));

        let inbound = dump_object_info(&*receiver);
        assert!(inbound.contains("<-- Object::source <functor or function pointer>"));
    }
}
