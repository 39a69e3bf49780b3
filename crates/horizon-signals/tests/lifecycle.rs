//! Destruction, thread migration and activation hooks.

mod common;

use std::sync::Arc;

use common::{Emitter, Recorder, shared_log};
use horizon_signals::meta::DESTROYED_SIGNAL;
use horizon_signals::{
    ClosureSlot, ConnectError, ConnectionType, EventThread, Object, SignalSpyCallbacks, ThreadData,
    ThreadError, connect, connect_functor, register_signal_spy_callbacks,
};
use parking_lot::Mutex;

#[test]
fn test_destroyed_reaches_observers_before_disconnect() {
    let emitter = Emitter::named("doomed");
    let recorder = Recorder::new("watch");
    connect(&*emitter, "destroyed()", &*recorder, "inspect", ConnectionType::Direct).unwrap();
    connect(&*emitter, "valueChanged", &*recorder, "record", ConnectionType::Direct).unwrap();

    drop(emitter);
    // The sender is mid-drop when `destroyed` is delivered, so it can no
    // longer be upgraded; the signal index is still reported.
    assert_eq!(recorder.log(), vec![format!("watch:sender=none/{DESTROYED_SIGNAL}")]);
    assert!(recorder.object_base().sender_list().is_empty());
}

#[test]
fn test_explicit_destroy_keeps_storage() {
    let emitter = Emitter::named("doomed");
    let recorder = Recorder::new("watch");
    connect(&*emitter, "destroyed", &*recorder, "inspect", ConnectionType::Direct).unwrap();

    emitter.object_base().destroy();
    assert_eq!(recorder.log(), vec![format!("watch:sender=doomed/{DESTROYED_SIGNAL}")]);
    assert!(emitter.object_base().is_being_destroyed());
    assert_eq!(emitter.object_base().object_name(), "doomed");

    let refused = connect(&*emitter, "valueChanged", &*recorder, "record", ConnectionType::Direct);
    assert!(matches!(refused, Err(ConnectError::InvalidSender { class: "Emitter" })));
}

#[test]
fn test_connection_handle_outlives_objects() {
    let emitter = Emitter::new();
    let recorder = Recorder::new("r");
    let conn =
        connect(&*emitter, "valueChanged", &*recorder, "record", ConnectionType::Direct).unwrap();
    drop(recorder);
    assert!(!conn.is_connected());
    drop(emitter);
    assert!(!conn.disconnect());
}

#[test]
fn test_guard_disconnects_on_drop() {
    let emitter = Emitter::new();
    let recorder = Recorder::new("r");
    {
        let _guard =
            connect(&*emitter, "valueChanged", &*recorder, "record", ConnectionType::Direct)
                .unwrap()
                .into_guard();
        emitter.emit_value(1);
    }
    emitter.emit_value(2);
    assert_eq!(recorder.log(), vec!["r:1"]);
}

// ----------------------------------------------------------------------------
// Threads
// ----------------------------------------------------------------------------

#[test]
fn test_move_to_foreign_thread_then_back_is_refused() {
    let worker = EventThread::new().unwrap();
    let recorder = Recorder::new("r");
    recorder.object_base().move_to_thread(Some(worker.thread_data())).unwrap();

    let here = ThreadData::current();
    let refused = recorder.object_base().move_to_thread(Some(&here));
    assert!(matches!(refused, Err(ThreadError::NotOwnerThread { class: "Recorder" })));

    // The owning thread may hand it back.
    let target = recorder.clone();
    let moved_back = worker
        .invoke_blocking(move || target.object_base().move_to_thread(Some(&here)).is_ok())
        .unwrap();
    assert!(moved_back);
    assert!(recorder.object_base().thread().is_current());
}

#[test]
fn test_pending_events_follow_moved_object() {
    let worker = EventThread::new().unwrap();
    let emitter = Emitter::new();
    let recorder = Recorder::new("r");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    connect_functor(
        &*emitter,
        "valueChanged",
        &*recorder,
        ClosureSlot::new(move |_, _| sink.lock().push(std::thread::current().id())),
        ConnectionType::Queued,
    )
    .unwrap();

    emitter.emit_value(1);
    assert_eq!(ThreadData::current().pending_events(), 1);
    recorder.object_base().move_to_thread(Some(worker.thread_data())).unwrap();
    assert_eq!(ThreadData::current().pending_events(), 0);

    worker.invoke_blocking(|| ()).unwrap();
    assert_eq!(*seen.lock(), vec![worker.thread_data().thread_id().unwrap()]);
}

// ----------------------------------------------------------------------------
// Spy hooks
// ----------------------------------------------------------------------------

#[test]
fn test_spy_reports_method_slots() {
    let emitter = Emitter::new();
    let log = shared_log();
    let recorder = Recorder::with_log("r", log.clone());
    connect(&*emitter, "valueChanged", &*recorder, "record", ConnectionType::Direct).unwrap();

    let watched = Arc::downgrade(&recorder);
    let spy_log = log.clone();
    register_signal_spy_callbacks(Some(SignalSpyCallbacks {
        slot_begin: Some(Box::new(move |receiver, method, _| {
            let ours = watched
                .upgrade()
                .is_some_and(|r| std::ptr::addr_eq(Arc::as_ptr(&r), receiver as *const dyn Object));
            if ours {
                spy_log.lock().push(format!("begin {method}"));
            }
        })),
        ..Default::default()
    }));
    emitter.emit_value(6);
    register_signal_spy_callbacks(None);

    assert_eq!(*log.lock(), vec![format!("begin {}", Recorder::RECORD), "r:6".to_owned()]);
}
