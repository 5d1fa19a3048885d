use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// How a bounded wait ended. A timeout is a re-poll opportunity, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Changed,
    TimedOut,
}

impl WaitOutcome {
    pub fn changed(self) -> bool {
        matches!(self, WaitOutcome::Changed)
    }
}

#[derive(Debug)]
pub(crate) struct Versioned<S> {
    version: u64,
    data: S,
}

/// State behind one mutex, with a condition variable signalled after every
/// mutation.
///
/// Every mutation bumps a version counter, so waiters can tell a real change
/// from a spurious wakeup.
#[derive(Debug)]
pub struct SyncCell<S> {
    state: Mutex<Versioned<S>>,
    changed: Condvar,
}

impl<S> SyncCell<S> {
    pub fn new(data: S) -> Self {
        Self {
            state: Mutex::new(Versioned { version: 0, data }),
            changed: Condvar::new(),
        }
    }

    /// Point-in-time read under a brief lock
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let guard = self.state.lock();
        f(&guard.data)
    }

    /// Mutate under a brief lock and wake every waiter
    pub fn mutate<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut guard = self.state.lock();
        guard.version = guard.version.wrapping_add(1);
        let out = f(&mut guard.data);
        drop(guard);
        self.changed.notify_all();
        out
    }

    /// Wake waiters without changing anything; used to interrupt waits on abort
    pub fn poke(&self) {
        let mut guard = self.state.lock();
        guard.version = guard.version.wrapping_add(1);
        drop(guard);
        self.changed.notify_all();
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Hold the lock across several operations
    pub fn acquire(&self) -> CellGuard<'_, S> {
        CellGuard {
            cell: self,
            guard: self.state.lock(),
        }
    }

    /// Block until the next mutation or until `timeout` elapses.
    ///
    /// The caller holds no lock here; use [`CellGuard::wait_for_change`] when
    /// holding one.
    pub fn wait_for_change(&self, timeout: Duration) -> WaitOutcome {
        let mut guard = self.state.lock();
        let seen = guard.version;
        Self::wait_past(&self.changed, &mut guard, seen, timeout)
    }

    /// Block until the version moves past `seen` or `timeout` elapses
    pub fn wait_for_change_since(&self, seen: u64, timeout: Duration) -> WaitOutcome {
        let mut guard = self.state.lock();
        Self::wait_past(&self.changed, &mut guard, seen, timeout)
    }

    fn wait_past(
        changed: &Condvar,
        guard: &mut MutexGuard<'_, Versioned<S>>,
        seen: u64,
        timeout: Duration,
    ) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        while guard.version == seen {
            if changed.wait_until(guard, deadline).timed_out() {
                return if guard.version == seen {
                    WaitOutcome::TimedOut
                } else {
                    WaitOutcome::Changed
                };
            }
        }
        WaitOutcome::Changed
    }
}

/// Exclusive access to a [`SyncCell`]. Dropping it releases the lock.
pub struct CellGuard<'a, S> {
    cell: &'a SyncCell<S>,
    guard: MutexGuard<'a, Versioned<S>>,
}

impl<'a, S> CellGuard<'a, S> {
    pub fn data(&self) -> &S {
        &self.guard.data
    }

    /// Mutate while holding the lock; waiters are notified immediately and
    /// run once this guard is released or parked.
    pub fn mutate<R>(&mut self, f: impl FnOnce(&mut S) -> R) -> R {
        self.guard.version = self.guard.version.wrapping_add(1);
        let out = f(&mut self.guard.data);
        self.cell.changed.notify_all();
        out
    }

    pub fn version(&self) -> u64 {
        self.guard.version
    }

    /// Release the lock, wait for a change, and re-acquire before returning.
    ///
    /// The lock is never held while sleeping.
    pub fn wait_for_change(&mut self, timeout: Duration) -> WaitOutcome {
        let seen = self.guard.version;
        SyncCell::wait_past(&self.cell.changed, &mut self.guard, seen, timeout)
    }

    /// Like [`wait_for_change`](Self::wait_for_change) but against an earlier
    /// observed version, so a change that happened between two acquisitions
    /// is not missed.
    pub fn wait_for_change_since(&mut self, seen: u64, timeout: Duration) -> WaitOutcome {
        SyncCell::wait_past(&self.cell.changed, &mut self.guard, seen, timeout)
    }

    /// Explicit release
    pub fn release(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_times_out_without_change() {
        let cell = SyncCell::new(0u32);
        let outcome = cell.wait_for_change(Duration::from_millis(20));
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn test_mutation_wakes_waiter() {
        let cell = Arc::new(SyncCell::new(0u32));
        let writer = Arc::clone(&cell);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            writer.mutate(|v| *v += 1);
        });
        let outcome = cell.wait_for_change(Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(outcome, WaitOutcome::Changed);
        assert_eq!(cell.read(|v| *v), 1);
    }

    #[test]
    fn test_guard_releases_lock_while_waiting() {
        let cell = Arc::new(SyncCell::new(Vec::<u32>::new()));
        let mut guard = cell.acquire();

        let writer = Arc::clone(&cell);
        let handle = thread::spawn(move || {
            // would deadlock if the waiting guard kept the mutex
            writer.mutate(|v| v.push(7));
        });

        let outcome = guard.wait_for_change(Duration::from_secs(5));
        assert_eq!(outcome, WaitOutcome::Changed);
        // re-acquired: we can read the writer's change under our guard
        assert_eq!(guard.data(), &vec![7]);
        guard.release();
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_since_sees_earlier_change() {
        let cell = SyncCell::new(0u32);
        let seen = cell.version();
        cell.mutate(|v| *v = 5);
        let outcome = cell.wait_for_change_since(seen, Duration::from_millis(1));
        assert_eq!(outcome, WaitOutcome::Changed);
    }

    #[test]
    fn test_guard_mutate_bumps_version() {
        let cell = SyncCell::new(0u32);
        let mut guard = cell.acquire();
        let before = guard.version();
        guard.mutate(|v| *v = 3);
        assert_eq!(guard.version(), before + 1);
        assert_eq!(*guard.data(), 3);
    }
}
