//! Object destruction and thread migration.
//!
//! Destruction runs once per object, either from [`ObjectBase::destroy`] or
//! when the object is dropped:
//!
//! 1. the object is flagged as being destroyed, so new connections to and
//!    from it are refused;
//! 2. `destroyed()` is emitted (even if the object's signals are blocked);
//! 3. every outbound connection is severed, then every inbound one;
//! 4. the connection-id counter is reset to 0, telling an activation of this
//!    object still running further up the stack to stop walking;
//! 5. events still queued for the object are discarded.
//!
//! The object's connection data is released last. If an activation elsewhere
//! still pins it, it lives on until that activation finishes.

use std::sync::Arc;

use crate::activate::activate;
use crate::connection::{ANY_SIGNAL, ConnectionRecord};
use crate::connection_data::ConnectionData;
use crate::error::ThreadError;
use crate::logging::{span_names, targets};
use crate::meta::DESTROYED_SIGNAL;
use crate::mutex_pool::SignalSlotLock;
use crate::object::ObjectBase;
use crate::thread_data::ThreadData;

/// Runs the destruction sequence of `base`. Later calls do nothing.
pub(crate) fn on_object_destroyed(base: &ObjectBase) {
    if !base.begin_destruction() {
        return;
    }
    let _span = tracing::trace_span!(
        target: targets::LIFECYCLE,
        span_names::DESTROY,
        class = base.class_name()
    )
    .entered();

    base.block_signals(false);
    activate(base, DESTROYED_SIGNAL, &[]);

    sever_connections(base);

    let thread = base.thread();
    let discarded = thread.take_events_for(base.addr());
    if !discarded.is_empty() {
        tracing::debug!(
            target: targets::LIFECYCLE,
            class = base.class_name(),
            count = discarded.len(),
            "discarding events posted to a destroyed object"
        );
    }
    drop(discarded);
}

fn sever_connections(base: &ObjectBase) {
    let mut lock = SignalSlotLock::lock(base.addr());
    let Some(data) = base.connection_data(&lock) else {
        return;
    };
    // Records and the stale sender marker are dropped only once unlocked.
    let stale_sender = data.with_state(&lock, |state| state.current_sender.take());
    let mut retired: Vec<Arc<ConnectionRecord>> = Vec::new();

    let outbound = sever_outbound(&mut lock, &data, &mut retired);
    let inbound = sever_inbound(&mut lock, &data, &mut retired);

    data.mark_owner_destroyed();
    let orphans = data.clean_orphaned(&lock);
    let taken = base.take_connection_data(&lock);
    drop(lock);

    tracing::trace!(
        target: targets::LIFECYCLE,
        class = base.class_name(),
        outbound,
        inbound,
        "connections severed"
    );
    drop(orphans);
    drop(retired);
    drop(stale_sender);
    drop(taken);
    drop(data);
}

/// Severs the connections `data`'s owner is the sender of.
fn sever_outbound(
    lock: &mut SignalSlotLock,
    data: &Arc<ConnectionData>,
    retired: &mut Vec<Arc<ConnectionRecord>>,
) -> usize {
    let mut severed = 0;
    let count = data.with_state(lock, |state| state.signal_vector_count());
    for index in ANY_SIGNAL..count {
        while let Some(record) = data.with_state(lock, |state| state.first(index)) {
            lock.relock(record.receiver_addr);
            // The relock may have let another thread remove the record.
            let still_first = data
                .with_state(lock, |state| state.first(index))
                .is_some_and(|first| Arc::ptr_eq(&first, &record));
            if still_first && record.is_connected() {
                data.remove_connection(lock, &record);
                severed += 1;
            }
            lock.release_secondary();
            retired.push(record);
        }
    }
    severed
}

/// Severs the connections `data`'s owner is the receiver of.
fn sever_inbound(
    lock: &mut SignalSlotLock,
    data: &Arc<ConnectionData>,
    retired: &mut Vec<Arc<ConnectionRecord>>,
) -> usize {
    let mut severed = 0;
    while let Some(record) = data.with_state(lock, |state| state.senders.clone()) {
        lock.unlock();
        let sender_data = record.sender_data.upgrade();
        lock.relock_primary();

        let still_head = data
            .with_state(lock, |state| state.senders.clone())
            .is_some_and(|head| Arc::ptr_eq(&head, &record));
        if !still_head {
            lock.unlock();
            drop(sender_data);
            drop(record);
            lock.relock_primary();
            continue;
        }

        let mut orphans = None;
        let mut removed = false;
        match &sender_data {
            Some(sender_data) => {
                lock.relock(record.sender_addr);
                if record.is_connected() {
                    sender_data.remove_connection(lock, &record);
                    removed = true;
                }
                orphans = Some(sender_data.clean_orphaned(lock));
                lock.release_secondary();
            }
            // The sender is gone without having unlinked the record.
            None => data.unlink_sender(lock, &record),
        }

        lock.unlock();
        drop(orphans);
        drop(sender_data);
        if removed {
            severed += 1;
            if let Some(sender) = record.sender.upgrade() {
                sender.disconnect_notify(sender.meta_object().signal(record.signal_index));
            }
        }
        retired.push(record);
        lock.relock_primary();
    }
    severed
}

/// Moves `base` to `target`, or detaches it when `target` is `None`.
pub(crate) fn move_to_thread(
    base: &ObjectBase,
    target: Option<&Arc<ThreadData>>,
) -> Result<(), ThreadError> {
    let class = base.class_name();
    if base.is_being_destroyed() {
        return Err(ThreadError::ObjectDestroyed { class });
    }
    let current = base.thread();
    let target = target.cloned().unwrap_or_else(ThreadData::detached);
    if Arc::ptr_eq(&current, &target) {
        return Ok(());
    }
    let allowed = current.is_current() || (current.is_detached() && target.is_current());
    if !allowed {
        let error = ThreadError::NotOwnerThread { class };
        tracing::warn!(
            target: targets::THREAD,
            %error,
            current = %current,
            target = %target,
            "move_to_thread refused"
        );
        return Err(error);
    }

    let old = on_thread_changed(base, &target);
    tracing::debug!(target: targets::THREAD, class, from = %old, to = %target, "object moved");
    Ok(())
}

/// Re-homes `base` and everything that caches its thread: the records of its
/// inbound connections and its pending posted events. Returns the previous
/// thread.
pub(crate) fn on_thread_changed(
    base: &ObjectBase,
    new_thread: &Arc<ThreadData>,
) -> Arc<ThreadData> {
    let mut released = Vec::new();
    let lock = SignalSlotLock::lock(base.addr());

    let stale_sender = match base.connection_data(&lock) {
        Some(data) => {
            let stale = data.with_state(&lock, |state| state.current_sender.take());
            let senders = data.senders(&lock);
            for record in &senders {
                released.push(record.swap_receiver_thread(&lock, new_thread.clone()));
            }
            drop(senders);
            stale
        }
        None => None,
    };

    let old = base.replace_thread_data(&lock, new_thread.clone());
    // Moved while locked, so queued deliveries posted meanwhile stay behind
    // the ones already pending.
    let pending = old.take_events_for(base.addr());
    let refused = new_thread.append_events(pending);
    drop(lock);

    if !refused.is_empty() {
        tracing::debug!(
            target: targets::THREAD,
            count = refused.len(),
            "events refused by the target thread"
        );
    }
    drop(refused);
    drop(stale_sender);
    drop(released);
    old
}
