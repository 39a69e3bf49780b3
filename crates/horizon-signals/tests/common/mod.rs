//! Shared test objects for the integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::Arc;

use horizon_signals::meta::{Arg, MetaObject, MethodMeta, OBJECT_META, SignalMeta};
use horizon_signals::{Object, ObjectBase, Signal, activate, object_cast};
use parking_lot::Mutex;

pub static EMITTER_META: MetaObject = MetaObject {
    type_name: "Emitter",
    parent: Some(&OBJECT_META),
    signals: &[
        SignalMeta::new("valueChanged", &["i32"]),
        SignalMeta::new("textChanged", &["String"]),
        SignalMeta::new("pinged", &[]),
        SignalMeta::new("opaque", &["Opaque"]),
    ],
    methods: &[],
};

/// An object whose only job is to emit.
pub struct Emitter {
    base: ObjectBase,
}

impl Emitter {
    pub const VALUE_CHANGED: i32 = 2;
    pub const TEXT_CHANGED: i32 = 3;
    pub const PINGED: i32 = 4;
    pub const OPAQUE: i32 = 5;

    pub const VALUE: Signal<(i32,)> = Signal::new(Self::VALUE_CHANGED);
    pub const TEXT: Signal<(String,)> = Signal::new(Self::TEXT_CHANGED);

    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            base: ObjectBase::new(this, &EMITTER_META),
        })
    }

    pub fn named(name: &str) -> Arc<Self> {
        let emitter = Self::new();
        emitter.base.set_object_name(name);
        emitter
    }

    pub fn emit_value(&self, value: i32) {
        activate(&self.base, Self::VALUE_CHANGED, &[&value]);
    }

    pub fn emit_text(&self, text: &str) {
        let text = text.to_owned();
        activate(&self.base, Self::TEXT_CHANGED, &[&text]);
    }

    pub fn ping(&self) {
        activate(&self.base, Self::PINGED, &[]);
    }
}

impl Object for Emitter {
    fn object_base(&self) -> &ObjectBase {
        &self.base
    }
}

/// A type that is never registered for queued delivery.
#[derive(Clone, Debug, PartialEq)]
pub struct Opaque(pub u32);

pub static RECORDER_META: MetaObject = MetaObject {
    type_name: "Recorder",
    parent: Some(&OBJECT_META),
    signals: &[SignalMeta::new("forwarded", &["i32"])],
    methods: &[
        MethodMeta::new("record", &["i32"], Recorder::record_slot),
        MethodMeta::new("note", &["String"], Recorder::note_slot),
        MethodMeta::new("ping", &[], Recorder::ping_slot),
        MethodMeta::new("inspect", &[], Recorder::inspect_slot),
        MethodMeta::new("takeOpaque", &["Opaque"], Recorder::ping_slot),
    ],
};

/// Records every call it receives, tagged with its name.
pub struct Recorder {
    base: ObjectBase,
    tag: String,
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub const RECORD: usize = 0;
    pub const NOTE: usize = 1;
    pub const PING: usize = 2;
    pub const INSPECT: usize = 3;

    pub fn new(tag: &str) -> Arc<Self> {
        Self::with_log(tag, Arc::new(Mutex::new(Vec::new())))
    }

    /// A recorder appending to a log shared with other recorders.
    pub fn with_log(tag: &str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            base: ObjectBase::new(this, &RECORDER_META),
            tag: tag.to_owned(),
            log,
        })
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn push(&self, entry: String) {
        self.log.lock().push(entry);
    }

    fn record_slot(receiver: &dyn Object, args: &[&Arg]) {
        let Some(this) = object_cast::<Recorder>(receiver) else {
            return;
        };
        if let Some(value) = args.first().and_then(|a| a.downcast_ref::<i32>()) {
            this.push(format!("{}:{value}", this.tag));
        }
    }

    fn note_slot(receiver: &dyn Object, args: &[&Arg]) {
        let Some(this) = object_cast::<Recorder>(receiver) else {
            return;
        };
        if let Some(text) = args.first().and_then(|a| a.downcast_ref::<String>()) {
            this.push(format!("{}:{text}", this.tag));
        }
    }

    fn ping_slot(receiver: &dyn Object, _: &[&Arg]) {
        if let Some(this) = object_cast::<Recorder>(receiver) {
            this.push(format!("{}:ping", this.tag));
        }
    }

    /// Logs who is currently emitting into this object.
    fn inspect_slot(receiver: &dyn Object, _: &[&Arg]) {
        let Some(this) = object_cast::<Recorder>(receiver) else {
            return;
        };
        let sender = this
            .base
            .sender()
            .map_or_else(|| "none".to_owned(), |s| s.object_base().object_name());
        let index = this.base.sender_signal_index().unwrap_or(-1);
        this.push(format!("{}:sender={sender}/{index}", this.tag));
    }
}

impl Object for Recorder {
    fn object_base(&self) -> &ObjectBase {
        &self.base
    }
}

/// A shared log for ordering assertions.
pub fn shared_log() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

/// Formatted `tracing` output captured on the calling thread.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Runs `f` with warnings and errors written into these logs.
    pub fn capture<R>(&self, f: impl FnOnce() -> R) -> R {
        let logs = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        tracing::subscriber::with_default(subscriber, f)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
