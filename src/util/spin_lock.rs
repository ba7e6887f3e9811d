//! Bare metal spinlocks using atomic memory operations.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// Protects a `T` using a spinlock to ensure that it can't be accessed
/// concurrently or reentrantly.
///
/// `SpinLock` is a lot like `Mutex` from the standard library, but in a
/// greatly simplified form for bare metal use. In particular, it cannot
/// block politely; all locking is best-effort and may fail. (If you really
/// need the lock: spin.)
///
/// This is the mechanism for sharing resources between the background loop
/// and interrupt handlers. ISR-side code must use `try_lock` and treat
/// contention as "skip this event": spinning at interrupt priority against
/// the thread that was just preempted would never terminate.
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    contents: UnsafeCell<T>,
}

unsafe impl<T: Send + ?Sized> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(contents: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            contents: UnsafeCell::new(contents),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub enum SpinLockError {
    Contended,
}

impl<T: ?Sized + Send> SpinLock<T> {
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, SpinLockError> {
        if self.locked.swap(true, Ordering::Acquire) {
            // Old value of `true` implies the cell was already locked.
            Err(SpinLockError::Contended)
        } else {
            // We observed the false->true transition, so we hold the lock
            // and can mint the one mutable reference. Dropping the guard
            // unlocks; until then every `try_lock` fails.
            Ok(SpinLockGuard {
                locked: LockBorrow(&self.locked),
                // Safety: we've locked, so we can generate an exclusive
                // reference.
                contents: unsafe { &mut *self.contents.get() },
            })
        }
    }

    /// Spins until the lock is available. Background-loop use only; see the
    /// type docs.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if let Ok(guard) = self.try_lock() {
                return guard;
            }
        }
    }
}

#[must_use = "if dropped, the spinlock will immediately unlock"]
#[derive(Debug)]
pub struct SpinLockGuard<'a, T: ?Sized> {
    locked: LockBorrow<'a>,
    contents: &'a mut T,
}

/// A reference to the `SpinLock` lock flag that releases it when dropped.
/// Distinct from `SpinLockGuard` so that the latter can be consumed and
/// reconstructed by `map` -- something `Drop` types don't allow.
#[derive(Debug)]
struct LockBorrow<'a>(&'a AtomicBool);

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// Replaces a guard of `T` with a guard of some portion of `T`. This is
    /// essentially a projection operation. The original guard is lost.
    pub fn map<U>(
        orig: SpinLockGuard<'a, T>,
        f: impl FnOnce(&mut T) -> &mut U,
    ) -> SpinLockGuard<'a, U> {
        let SpinLockGuard { locked, contents } = orig;
        SpinLockGuard {
            locked,
            contents: f(contents),
        }
    }
}

impl<'a, T: ?Sized> core::ops::Deref for SpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.contents
    }
}

impl<'a, T: ?Sized> core::ops::DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.contents
    }
}

impl<'a> Drop for LockBorrow<'a> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Pattern for borrowing hardware loaned to an ISR through a
/// `SpinLock<Option<T>>` static.
///
/// Returns `None` if the hardware hasn't been provisioned yet (IRQ enabled
/// too early) or the lock is held (two tiers colliding). Callers in ISRs
/// treat `None` as "drop this event": the state machines involved recover on
/// the next tick rather than wedging the device.
pub fn acquire_hw<T: Send>(
    lock: &SpinLock<Option<T>>,
) -> Option<SpinLockGuard<'_, T>> {
    let guard = lock.try_lock().ok()?;
    if guard.is_none() {
        return None;
    }
    Some(SpinLockGuard::map(guard, |o| match o.as_mut() {
        Some(hw) => hw,
        // Checked non-None above; the guard has been held since.
        None => unreachable!(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_while_held() {
        let lock = SpinLock::new(5u32);
        let guard = lock.try_lock().unwrap();
        assert!(lock.try_lock().is_err());
        drop(guard);
        assert_eq!(*lock.lock(), 5);
    }

    #[test]
    fn acquire_hw_empty_and_full() {
        let empty: SpinLock<Option<u32>> = SpinLock::new(None);
        assert!(acquire_hw(&empty).is_none());

        let full = SpinLock::new(Some(7u32));
        {
            let hw = acquire_hw(&full).unwrap();
            assert_eq!(*hw, 7);
            // Contended while the guard lives.
            assert!(acquire_hw(&full).is_none());
        }
        assert!(acquire_hw(&full).is_some());
    }
}
