//! Per-object locking for connection bookkeeping.
//!
//! Objects do not carry their own mutex. Instead every object maps onto one
//! entry of a fixed, process-wide pool by hashing its address. Two unrelated
//! objects may share a mutex; that only costs concurrency, never correctness.
//!
//! Operations that touch two objects (connecting A to B, removing a link from
//! both ends) acquire both pool mutexes in the order of the *mutexes'* own
//! addresses, so two threads working on A→B and B→A concurrently cannot
//! deadlock.
//!
//! All state protected by the pool lives in [`Guarded`] cells. A cell can only
//! be opened through a [`SignalSlotLock`] that currently holds the pool mutex
//! of the cell's owner, which turns a forgotten lock into a panic instead of a
//! data race.

use std::cell::UnsafeCell;
use std::ptr;

use parking_lot::{Mutex, MutexGuard};

/// Number of mutexes in the signal/slot pool.
pub const MUTEX_POOL_SIZE: usize = 131;

static SIGNAL_SLOT_MUTEXES: [Mutex<()>; MUTEX_POOL_SIZE] =
    [const { parking_lot::const_mutex(()) }; MUTEX_POOL_SIZE];

type PoolGuard = MutexGuard<'static, ()>;

/// Returns the pool mutex responsible for the object at `addr`.
#[inline]
pub(crate) fn mutex_for(addr: usize) -> &'static Mutex<()> {
    &SIGNAL_SLOT_MUTEXES[addr % MUTEX_POOL_SIZE]
}

#[inline]
fn mutex_addr(mutex: &Mutex<()>) -> usize {
    ptr::from_ref(mutex) as usize
}

/// Locks two pool mutexes in a globally consistent order.
///
/// Returns the guard for `first`, and a guard for `second` when it is a
/// different mutex. The second element is `None` exactly when only one lock
/// was taken.
pub(crate) fn lock_both(
    first: &'static Mutex<()>,
    second: &'static Mutex<()>,
) -> (PoolGuard, Option<PoolGuard>) {
    if ptr::eq(first, second) {
        return (first.lock(), None);
    }
    if mutex_addr(first) < mutex_addr(second) {
        let a = first.lock();
        let b = second.lock();
        (a, Some(b))
    } else {
        let b = second.lock();
        let a = first.lock();
        (a, Some(b))
    }
}

/// The pool locks held on behalf of one signal/slot operation.
///
/// A lock always has a *primary* object (the one the operation is about) and
/// may temporarily hold a *secondary* object's mutex as well, acquired in
/// address order through [`relock`](Self::relock).
pub(crate) struct SignalSlotLock {
    primary: &'static Mutex<()>,
    primary_guard: Option<PoolGuard>,
    secondary: Option<(&'static Mutex<()>, PoolGuard)>,
}

impl SignalSlotLock {
    /// Locks the pool mutex of the object at `addr`.
    pub(crate) fn lock(addr: usize) -> Self {
        let primary = mutex_for(addr);
        Self {
            primary,
            primary_guard: Some(primary.lock()),
            secondary: None,
        }
    }

    /// Locks the mutexes of two objects, `primary_addr` becoming the primary.
    pub(crate) fn lock_pair(primary_addr: usize, secondary_addr: usize) -> Self {
        let primary = mutex_for(primary_addr);
        let other = mutex_for(secondary_addr);
        let (guard, second) = lock_both(primary, other);
        Self {
            primary,
            primary_guard: Some(guard),
            secondary: second.map(|g| (other, g)),
        }
    }

    /// Additionally locks the mutex of the object at `addr`.
    ///
    /// If the new mutex orders before the held one, the held mutex is briefly
    /// released and re-acquired, so state read under the primary lock before
    /// this call may be stale afterwards. Returns `false` (and does nothing)
    /// when `addr` maps onto a mutex this lock already holds.
    pub(crate) fn relock(&mut self, addr: usize) -> bool {
        let other = mutex_for(addr);
        if ptr::eq(other, self.primary) {
            return false;
        }
        if let Some((held, _)) = &self.secondary {
            if ptr::eq(*held, other) {
                return false;
            }
        }
        debug_assert!(self.secondary.is_none(), "relock with a secondary already held");
        debug_assert!(self.primary_guard.is_some(), "relock without the primary held");

        let guard = if mutex_addr(self.primary) < mutex_addr(other) {
            other.lock()
        } else {
            self.primary_guard = None;
            let guard = other.lock();
            self.primary_guard = Some(self.primary.lock());
            guard
        };
        self.secondary = Some((other, guard));
        true
    }

    /// Releases the secondary mutex, if any.
    pub(crate) fn release_secondary(&mut self) {
        self.secondary = None;
    }

    /// Releases everything. The lock may be re-acquired with
    /// [`relock_primary`](Self::relock_primary).
    pub(crate) fn unlock(&mut self) {
        self.secondary = None;
        self.primary_guard = None;
    }

    /// Re-acquires the primary mutex after [`unlock`](Self::unlock).
    pub(crate) fn relock_primary(&mut self) {
        if self.primary_guard.is_none() {
            self.primary_guard = Some(self.primary.lock());
        }
    }

    /// Whether this lock currently holds the pool mutex of the object at `addr`.
    pub(crate) fn covers(&self, addr: usize) -> bool {
        let wanted = mutex_for(addr);
        if self.primary_guard.is_some() && ptr::eq(wanted, self.primary) {
            return true;
        }
        matches!(&self.secondary, Some((held, _)) if ptr::eq(*held, wanted))
    }
}

/// State that may only be touched while the owner's pool mutex is held.
///
/// The owner address is supplied on every access rather than stored, because
/// the owning object's address is only fixed once it has been placed in its
/// final allocation.
pub(crate) struct Guarded<T> {
    value: UnsafeCell<T>,
    #[cfg(debug_assertions)]
    borrowed: std::sync::atomic::AtomicBool,
}

// SAFETY: every shared access to `value` goes through `with`, which requires
// the owner's pool mutex to be held by the calling thread.
unsafe impl<T: Send> Sync for Guarded<T> {}

impl<T> Guarded<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
            #[cfg(debug_assertions)]
            borrowed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Runs `f` with mutable access to the value.
    ///
    /// # Panics
    ///
    /// Panics if `lock` does not hold the pool mutex of `owner`. In debug
    /// builds, also panics on nested access to the same cell.
    pub(crate) fn with<R>(
        &self,
        lock: &SignalSlotLock,
        owner: usize,
        f: impl FnOnce(&mut T) -> R,
    ) -> R {
        assert!(
            lock.covers(owner),
            "connection state accessed without holding its object's lock"
        );
        #[cfg(debug_assertions)]
        {
            use std::sync::atomic::Ordering;
            assert!(
                !self.borrowed.swap(true, Ordering::Acquire),
                "re-entrant access to guarded connection state"
            );
        }
        // SAFETY: the owner's pool mutex is held (checked above) and all
        // accesses are serialized through it, so this is the only live reference.
        let result = f(unsafe { &mut *self.value.get() });
        #[cfg(debug_assertions)]
        self.borrowed
            .store(false, std::sync::atomic::Ordering::Release);
        result
    }

    /// Exclusive access without locking, for owners that are being dropped.
    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}
