use parking_lot::{Condvar, Mutex};

/// Admission gate for a cache's input callback: a semaphore that
/// suspends producer admission, independent of the cache's own state
/// mutex.
///
/// Unlike a plain mutex, both ends are idempotent. `release()` may be
/// called by a thread other than the one that called `acquire()` — the
/// transport layer acquires the gate during a flush and a later `play()`
/// releases it, possibly from a different call site, while `pause()`
/// leaves it held. `acquire()` is likewise safe to call while already
/// held by a previous `acquire()`: it returns immediately instead of
/// waiting for a release that may never come, so back-to-back calls like
/// `flush()` followed by `abort()` on a paused stream don't deadlock.
/// Only a producer's `try_acquire()` represents a transient hold that a
/// blocking `acquire()` actually waits out.
pub(crate) struct InputGate {
    state: Mutex<GateState>,
    released: Condvar,
}

#[derive(Clone, Copy)]
struct GateState {
    locked: bool,
    held_by_acquire: bool,
}

impl InputGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                locked: false,
                held_by_acquire: false,
            }),
            released: Condvar::new(),
        }
    }

    /// Hold the gate. Returns immediately if already held by a previous
    /// `acquire()` call; blocks only while a producer's `try_acquire()`
    /// currently holds it.
    pub fn acquire(&self) {
        let mut state = self.state.lock();
        if state.locked && state.held_by_acquire {
            return;
        }
        while state.locked {
            self.released.wait(&mut state);
        }
        state.locked = true;
        state.held_by_acquire = true;
    }

    /// Attempt to take the gate without blocking.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.locked {
            false
        } else {
            state.locked = true;
            state.held_by_acquire = false;
            true
        }
    }

    /// Free the gate. Safe to call even when not currently held.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.locked = false;
        state.held_by_acquire = false;
        self.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_acquire_fails_while_held() {
        let gate = InputGate::new();
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
        gate.release();
        assert!(gate.try_acquire());
    }

    #[test]
    fn release_without_acquire_is_a_no_op() {
        let gate = InputGate::new();
        gate.release();
        assert!(gate.try_acquire());
    }

    #[test]
    fn acquire_blocks_out_a_transient_try_acquire_hold() {
        let gate = Arc::new(InputGate::new());
        assert!(gate.try_acquire());

        let waiter = Arc::clone(&gate);
        let handle = thread::spawn(move || {
            waiter.acquire();
        });

        thread::sleep(std::time::Duration::from_millis(20));
        gate.release();
        handle.join().unwrap();
    }

    #[test]
    fn repeated_acquire_does_not_deadlock() {
        let gate = InputGate::new();
        gate.acquire();
        gate.acquire();
        gate.acquire();
        assert!(!gate.try_acquire(), "gate should still be held");
    }
}
