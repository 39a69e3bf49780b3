//! Per-object connection bookkeeping.
//!
//! Each object lazily owns one [`ConnectionData`]. It holds:
//!
//! - the *signal vector*: one [`ConnectionList`] per signal index, plus one
//!   for [`ANY_SIGNAL`](crate::connection::ANY_SIGNAL) stored in slot 0;
//! - the *senders* list: records whose receiver is this object;
//! - the current sender marker published while a direct call is running;
//! - the orphan list: records unlinked from the signal vector that an
//!   activation may still be standing on.
//!
//! All of it is guarded by the owner's pool mutex. Unlinked records are not
//! dropped on the spot: an activation that released the lock to call a slot
//! will follow the record's `next` link afterwards, and dropping the last
//! reference to a record can run arbitrary `Drop` code of its slot object,
//! which must never happen under a pool lock. Orphans are therefore drained
//! only while no activation is pinned on the data, and the drained records are
//! handed back as an [`OrphanBatch`] for the caller to drop after unlocking.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::connection::ConnectionRecord;
use crate::mutex_pool::{Guarded, SignalSlotLock};
use crate::object::{Object, ObjectBase};

/// Head and tail of one signal's connection list.
#[derive(Default)]
pub(crate) struct ConnectionList {
    pub(crate) first: Option<Arc<ConnectionRecord>>,
    pub(crate) last: Option<Arc<ConnectionRecord>>,
}

/// Who is emitting into an object right now.
pub(crate) struct CurrentSender {
    token: u64,
    pub(crate) sender: Weak<dyn Object>,
    pub(crate) sender_addr: usize,
    pub(crate) signal_index: i32,
}

#[derive(Default)]
pub(crate) struct ConnectionState {
    signal_vector: Vec<ConnectionList>,
    pub(crate) senders: Option<Arc<ConnectionRecord>>,
    pub(crate) current_sender: Option<CurrentSender>,
    orphaned: Vec<Arc<ConnectionRecord>>,
}

impl ConnectionState {
    /// Number of real signals the vector has room for.
    pub(crate) fn signal_vector_count(&self) -> i32 {
        self.signal_vector.len().saturating_sub(1) as i32
    }

    pub(crate) fn list(&self, signal_index: i32) -> Option<&ConnectionList> {
        let slot = usize::try_from(signal_index + 1).ok()?;
        self.signal_vector.get(slot)
    }

    fn list_mut(&mut self, signal_index: i32) -> Option<&mut ConnectionList> {
        let slot = usize::try_from(signal_index + 1).ok()?;
        self.signal_vector.get_mut(slot)
    }

    fn ensure_list(&mut self, signal_index: i32) -> &mut ConnectionList {
        let slot = (signal_index + 1) as usize;
        if self.signal_vector.len() <= slot {
            self.signal_vector.resize_with(slot + 1, ConnectionList::default);
        }
        &mut self.signal_vector[slot]
    }

    pub(crate) fn first(&self, signal_index: i32) -> Option<Arc<ConnectionRecord>> {
        self.list(signal_index).and_then(|list| list.first.clone())
    }
}

/// Connection bookkeeping of one object.
pub(crate) struct ConnectionData {
    owner: usize,
    state: Guarded<ConnectionState>,
    /// Last id handed out; reset to 0 when the owner is destroyed.
    current_connection_id: AtomicU64,
    /// Activations currently walking this object's signal vector.
    activations: AtomicUsize,
}

impl ConnectionData {
    pub(crate) fn new(owner: usize) -> Arc<Self> {
        Arc::new(Self {
            owner,
            state: Guarded::new(ConnectionState::default()),
            current_connection_id: AtomicU64::new(0),
            activations: AtomicUsize::new(0),
        })
    }

    #[cfg(test)]
    pub(crate) fn owner(&self) -> usize {
        self.owner
    }

    pub(crate) fn with_state<R>(
        &self,
        lock: &SignalSlotLock,
        f: impl FnOnce(&mut ConnectionState) -> R,
    ) -> R {
        self.state.with(lock, self.owner, f)
    }

    /// Hands out the next connection id.
    pub(crate) fn next_connection_id(&self, lock: &SignalSlotLock) -> u64 {
        debug_assert!(lock.covers(self.owner));
        self.current_connection_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The newest id handed out so far, or 0 once the owner is destroyed.
    pub(crate) fn highest_connection_id(&self) -> u64 {
        self.current_connection_id.load(Ordering::Acquire)
    }

    /// Whether the owner has been destroyed.
    pub(crate) fn is_owner_destroyed(&self) -> bool {
        self.highest_connection_id() == 0
    }

    pub(crate) fn mark_owner_destroyed(&self) {
        self.current_connection_id.store(0, Ordering::Release);
    }

    /// Appends `record` to the tail of its signal's list.
    pub(crate) fn append(&self, lock: &SignalSlotLock, record: &Arc<ConnectionRecord>) {
        let previous_last = self.with_state(lock, |state| {
            let list = state.ensure_list(record.signal_index);
            let previous = list.last.replace(record.clone());
            if list.first.is_none() {
                list.first = Some(record.clone());
            }
            previous
        });
        if let Some(previous) = previous_last {
            record.with_list_links(lock, |links| links.prev = Some(Arc::downgrade(&previous)));
            previous.with_list_links(lock, |links| links.next = Some(record.clone()));
        }
    }

    /// Pushes `record` onto the head of this object's senders list.
    pub(crate) fn push_sender(&self, lock: &SignalSlotLock, record: &Arc<ConnectionRecord>) {
        let old_head = self.with_state(lock, |state| state.senders.replace(record.clone()));
        if let Some(head) = &old_head {
            head.with_sender_links(lock, |links| links.prev = Some(Arc::downgrade(record)));
        }
        record.with_sender_links(lock, |links| links.next = old_head);
    }

    /// Removes `record` from this object's senders list.
    pub(crate) fn unlink_sender(&self, lock: &SignalSlotLock, record: &Arc<ConnectionRecord>) {
        let (next, prev) =
            record.with_sender_links(lock, |links| (links.next.take(), links.prev.take()));
        let prev = prev.and_then(|weak| weak.upgrade());
        match &prev {
            Some(prev) => prev.with_sender_links(lock, |links| links.next = next.clone()),
            None => self.with_state(lock, |state| {
                if state.senders.as_ref().is_some_and(|head| Arc::ptr_eq(head, record)) {
                    state.senders = next.clone();
                }
            }),
        }
        if let Some(next) = &next {
            next.with_sender_links(lock, |links| links.prev = prev.as_ref().map(Arc::downgrade));
        }
    }

    /// Removes `record` from its signal's list and parks it on the orphan list.
    ///
    /// The record's `next` link is left intact so an activation standing on it
    /// can continue its walk.
    fn unlink_from_list(&self, lock: &SignalSlotLock, record: &Arc<ConnectionRecord>) {
        let (next, prev) =
            record.with_list_links(lock, |links| (links.next.clone(), links.prev.take()));
        let prev = prev.and_then(|weak| weak.upgrade());
        if let Some(prev) = &prev {
            prev.with_list_links(lock, |links| links.next = next.clone());
        }
        if let Some(next) = &next {
            next.with_list_links(lock, |links| links.prev = prev.as_ref().map(Arc::downgrade));
        }
        self.with_state(lock, |state| {
            if let Some(list) = state.list_mut(record.signal_index) {
                if list.first.as_ref().is_some_and(|first| Arc::ptr_eq(first, record)) {
                    list.first = next.clone();
                }
                if list.last.as_ref().is_some_and(|last| Arc::ptr_eq(last, record)) {
                    list.last = prev.clone();
                }
            }
            state.orphaned.push(record.clone());
        });
    }

    /// Severs `record`, whose sender is this object.
    ///
    /// `lock` must cover both this object and the record's receiver.
    pub(crate) fn remove_connection(&self, lock: &SignalSlotLock, record: &Arc<ConnectionRecord>) {
        debug_assert_eq!(record.sender_addr, self.owner);
        record.clear_receiver(lock);
        if let Some(receiver_data) = record.receiver_data.upgrade() {
            receiver_data.unlink_sender(lock, record);
        }
        self.unlink_from_list(lock, record);
    }

    /// Registers an activation walking this object's lists.
    pub(crate) fn pin(self: &Arc<Self>, lock: &SignalSlotLock) -> ActivationPin {
        debug_assert!(lock.covers(self.owner));
        self.activations.fetch_add(1, Ordering::AcqRel);
        ActivationPin { data: self.clone() }
    }

    /// Takes the orphan list if no activation is walking the lists.
    ///
    /// The returned batch must be dropped after the lock is released.
    #[must_use = "orphans must be dropped outside the lock"]
    pub(crate) fn clean_orphaned(&self, lock: &SignalSlotLock) -> OrphanBatch {
        if self.activations.load(Ordering::Acquire) > 0 {
            return OrphanBatch::default();
        }
        self.with_state(lock, |state| {
            let mut records = std::mem::take(&mut state.orphaned);
            let released: Vec<_> = records
                .iter()
                .filter_map(|record| record.with_list_links(lock, |links| links.next.take()))
                .collect();
            records.extend(released);
            OrphanBatch(records)
        })
    }

    /// Whether any live connection listens to `signal_index`, including
    /// all-signal listeners.
    pub(crate) fn is_signal_connected(&self, lock: &SignalSlotLock, signal_index: i32) -> bool {
        let heads = self.with_state(lock, |state| {
            [state.first(crate::connection::ANY_SIGNAL), state.first(signal_index)]
        });
        heads.into_iter().any(|head| {
            let mut cursor = head;
            while let Some(record) = cursor {
                if record.is_connected() {
                    return true;
                }
                cursor = record.next_in_list(lock);
            }
            false
        })
    }

    /// Live connections of `signal_index`, in connection order.
    pub(crate) fn connections_of(
        &self,
        lock: &SignalSlotLock,
        signal_index: i32,
    ) -> Vec<Arc<ConnectionRecord>> {
        let mut found = Vec::new();
        let mut cursor = self.with_state(lock, |state| state.first(signal_index));
        while let Some(record) = cursor {
            if record.is_connected() {
                found.push(record.clone());
            }
            cursor = record.next_in_list(lock);
        }
        found
    }

    /// Live records of the senders list, newest first.
    pub(crate) fn senders(&self, lock: &SignalSlotLock) -> Vec<Arc<ConnectionRecord>> {
        let mut found = Vec::new();
        let mut cursor = self.with_state(lock, |state| state.senders.clone());
        while let Some(record) = cursor {
            if record.is_connected() {
                found.push(record.clone());
            }
            cursor = record.next_sender(lock);
        }
        found
    }
}

/// Keeps orphan reclamation away while an activation walks the lists.
pub(crate) struct ActivationPin {
    data: Arc<ConnectionData>,
}

impl ActivationPin {
    pub(crate) fn data(&self) -> &Arc<ConnectionData> {
        &self.data
    }
}

impl Drop for ActivationPin {
    fn drop(&mut self) {
        self.data.activations.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Records released from an orphan list, to be dropped outside any lock.
#[derive(Default)]
pub(crate) struct OrphanBatch(Vec<Arc<ConnectionRecord>>);

impl OrphanBatch {
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

static NEXT_SENDER_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Publishes the current sender on a receiver for the duration of a call.
///
/// Scopes nest: leaving a scope restores the marker that was current when it
/// was entered, unless the marker has been cleared in the meantime (the
/// receiver was destroyed or moved to another thread).
pub(crate) struct SenderScope {
    data: Arc<ConnectionData>,
    token: u64,
    previous: Option<CurrentSender>,
}

impl SenderScope {
    pub(crate) fn enter(
        receiver: &ObjectBase,
        sender: Weak<dyn Object>,
        sender_addr: usize,
        signal_index: i32,
    ) -> Option<Self> {
        let lock = SignalSlotLock::lock(receiver.addr());
        let data = receiver.connection_data(&lock)?;
        let token = NEXT_SENDER_TOKEN.fetch_add(1, Ordering::Relaxed);
        let current = CurrentSender {
            token,
            sender,
            sender_addr,
            signal_index,
        };
        let previous = data.with_state(&lock, |state| state.current_sender.replace(current));
        Some(Self {
            data,
            token,
            previous,
        })
    }
}

impl Drop for SenderScope {
    fn drop(&mut self) {
        let lock = SignalSlotLock::lock(self.data.owner);
        let previous = self.previous.take();
        let token = self.token;
        let leftover = self.data.with_state(&lock, |state| {
            if state.current_sender.as_ref().is_some_and(|c| c.token == token) {
                std::mem::replace(&mut state.current_sender, previous)
            } else {
                previous
            }
        });
        drop(lock);
        drop(leftover);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionPolicy, ConnectionType, NewRecord, SlotTarget};
    use crate::meta::Arg;
    use crate::object::BasicObject;
    use crate::thread_data::ThreadData;

    fn noop(_: &dyn Object, _: &[&Arg]) {}

    struct Fixture {
        sender: Arc<BasicObject>,
        receiver: Arc<BasicObject>,
        sender_data: Arc<ConnectionData>,
        receiver_data: Arc<ConnectionData>,
    }

    impl Fixture {
        fn new() -> Self {
            let sender = BasicObject::new();
            let receiver = BasicObject::new();
            let sender_data = ConnectionData::new(sender.object_base().addr());
            let receiver_data = ConnectionData::new(receiver.object_base().addr());
            Self {
                sender,
                receiver,
                sender_data,
                receiver_data,
            }
        }

        fn lock(&self) -> SignalSlotLock {
            SignalSlotLock::lock_pair(self.sender_data.owner(), self.receiver_data.owner())
        }

        fn record(
            &self,
            lock: &SignalSlotLock,
            signal_index: i32,
            method: usize,
        ) -> Arc<ConnectionRecord> {
            let sender: Arc<dyn Object> = self.sender.clone();
            let receiver: Arc<dyn Object> = self.receiver.clone();
            let record = ConnectionRecord::new(NewRecord {
                id: self.sender_data.next_connection_id(lock),
                sender: Arc::downgrade(&sender),
                sender_addr: self.sender_data.owner(),
                sender_data: Arc::downgrade(&self.sender_data),
                signal_index,
                receiver_ref: Arc::downgrade(&receiver),
                receiver_addr: self.receiver_data.owner(),
                receiver_data: Arc::downgrade(&self.receiver_data),
                receiver_thread: ThreadData::current(),
                target: SlotTarget::Method { index: method, invoke: noop },
                policy: ConnectionPolicy::from(ConnectionType::Direct),
                argument_types: None,
            });
            self.sender_data.append(lock, &record);
            self.receiver_data.push_sender(lock, &record);
            record
        }
    }

    fn ids(records: &[Arc<ConnectionRecord>]) -> Vec<u64> {
        records.iter().map(|r| r.id).collect()
    }

    #[test]
    fn test_append_preserves_connection_order() {
        let fx = Fixture::new();
        let lock = fx.lock();
        let a = fx.record(&lock, 1, 0);
        let b = fx.record(&lock, 1, 1);
        let c = fx.record(&lock, 1, 2);
        assert_eq!(ids(&fx.sender_data.connections_of(&lock, 1)), vec![a.id, b.id, c.id]);
        assert!(a.id < b.id && b.id < c.id);
        // Senders list is newest first.
        assert_eq!(ids(&fx.receiver_data.senders(&lock)), vec![c.id, b.id, a.id]);
        assert_eq!(fx.sender_data.with_state(&lock, |s| s.signal_vector_count()), 2);
    }

    #[test]
    fn test_remove_middle_keeps_next_link_and_orphans() {
        let fx = Fixture::new();
        let lock = fx.lock();
        let a = fx.record(&lock, 1, 0);
        let b = fx.record(&lock, 1, 1);
        let c = fx.record(&lock, 1, 2);

        fx.sender_data.remove_connection(&lock, &b);
        assert!(!b.is_connected());
        assert_eq!(ids(&fx.sender_data.connections_of(&lock, 1)), vec![a.id, c.id]);
        assert_eq!(ids(&fx.receiver_data.senders(&lock)), vec![c.id, a.id]);
        // An activation standing on `b` can still reach `c`.
        assert!(b.next_in_list(&lock).is_some_and(|n| Arc::ptr_eq(&n, &c)));

        let batch = fx.sender_data.clean_orphaned(&lock);
        assert_eq!(batch.len(), 2);
        assert!(b.next_in_list(&lock).is_none());
    }

    #[test]
    fn test_remove_head_and_tail() {
        let fx = Fixture::new();
        let lock = fx.lock();
        let a = fx.record(&lock, 2, 0);
        let b = fx.record(&lock, 2, 1);
        fx.sender_data.remove_connection(&lock, &a);
        fx.sender_data.remove_connection(&lock, &b);
        assert!(fx.sender_data.connections_of(&lock, 2).is_empty());
        assert!(fx.receiver_data.senders(&lock).is_empty());
        fx.sender_data.with_state(&lock, |s| {
            let list = s.list(2).unwrap();
            assert!(list.first.is_none() && list.last.is_none());
        });

        let c = fx.record(&lock, 2, 2);
        assert_eq!(ids(&fx.sender_data.connections_of(&lock, 2)), vec![c.id]);
    }

    #[test]
    fn test_pinned_data_defers_orphan_cleanup() {
        let fx = Fixture::new();
        let lock = fx.lock();
        let a = fx.record(&lock, 1, 0);
        let pin = fx.sender_data.pin(&lock);
        fx.sender_data.remove_connection(&lock, &a);
        assert_eq!(fx.sender_data.clean_orphaned(&lock).len(), 0);
        drop(pin);
        assert_eq!(fx.sender_data.clean_orphaned(&lock).len(), 1);
    }

    #[test]
    fn test_is_signal_connected_checks_any_bucket() {
        let fx = Fixture::new();
        let lock = fx.lock();
        assert!(!fx.sender_data.is_signal_connected(&lock, 3));
        let any = fx.record(&lock, crate::connection::ANY_SIGNAL, 0);
        assert!(fx.sender_data.is_signal_connected(&lock, 3));
        fx.sender_data.remove_connection(&lock, &any);
        assert!(!fx.sender_data.is_signal_connected(&lock, 3));
    }

    #[test]
    fn test_destroyed_sentinel() {
        let fx = Fixture::new();
        let lock = fx.lock();
        fx.record(&lock, 1, 0);
        assert_eq!(fx.sender_data.highest_connection_id(), 1);
        assert!(!fx.sender_data.is_owner_destroyed());
        fx.sender_data.mark_owner_destroyed();
        assert!(fx.sender_data.is_owner_destroyed());
    }
}
