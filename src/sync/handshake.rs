// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
//! A boolean condition shared by one real-time reader and any number of
//! non-real-time writers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Returned when a wait gave up before the condition left the expected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timed out waiting for the condition to leave {expected}")]
pub struct HandshakeTimeout {
    /// The value the caller was waiting to see change.
    pub expected: bool,
}

/// A mutex-protected boolean with one wait queue per target value.
///
/// The real-time side may only call [`BooleanHandshake::get_unsafe`] or
/// [`BooleanHandshake::try_lock`]. Everything that can block belongs to
/// non-real-time threads.
pub struct BooleanHandshake {
    state: Mutex<bool>,
    /// Mirror of `state` for lock-free peeking.
    peek: AtomicBool,
    /// Threads waiting for the condition to become true.
    became_true: Condvar,
    /// Threads waiting for the condition to become false.
    became_false: Condvar,
}

impl BooleanHandshake {
    /// Creates a new handshake holding the given value.
    pub fn new(initial: bool) -> BooleanHandshake {
        BooleanHandshake {
            state: Mutex::new(initial),
            peek: AtomicBool::new(initial),
            became_true: Condvar::new(),
            became_false: Condvar::new(),
        }
    }

    /// Blocks while the condition equals `expected`. A `None` timeout waits forever.
    pub fn wait_if(&self, expected: bool, timeout: Option<Duration>) -> Result<(), HandshakeTimeout> {
        let mut state = self.state.lock();
        self.wait_locked(&mut state, expected, timeout)
    }

    /// Like [`BooleanHandshake::wait_if`], but returns with the lock still held so the
    /// caller can act on the observed value before anybody else changes it.
    pub fn wait_and_lock_if(
        &self,
        expected: bool,
        timeout: Option<Duration>,
    ) -> Result<HandshakeGuard<'_>, HandshakeTimeout> {
        let mut state = self.state.lock();
        self.wait_locked(&mut state, expected, timeout)?;
        Ok(HandshakeGuard {
            handshake: self,
            state,
        })
    }

    /// Sets the condition, waking every thread waiting for the new value.
    pub fn set(&self, value: bool) {
        let mut state = self.state.lock();
        self.store(&mut state, value);
    }

    /// Reads the condition without locking. The value may already be stale.
    pub fn get_unsafe(&self) -> bool {
        self.peek.load(Ordering::Acquire)
    }

    /// Takes the lock if nobody else holds it. Never blocks.
    pub fn try_lock(&self) -> Option<HandshakeGuard<'_>> {
        self.state.try_lock().map(|state| HandshakeGuard {
            handshake: self,
            state,
        })
    }

    /// Takes the lock, blocking until it is available. Non-real-time only.
    pub fn lock(&self) -> HandshakeGuard<'_> {
        HandshakeGuard {
            handshake: self,
            state: self.state.lock(),
        }
    }

    fn store(&self, state: &mut bool, value: bool) {
        if *state == value {
            return;
        }
        *state = value;
        self.peek.store(value, Ordering::Release);
        if value {
            self.became_true.notify_all();
        } else {
            self.became_false.notify_all();
        }
    }

    fn wait_locked(
        &self,
        state: &mut MutexGuard<'_, bool>,
        expected: bool,
        timeout: Option<Duration>,
    ) -> Result<(), HandshakeTimeout> {
        let queue = if expected {
            &self.became_false
        } else {
            &self.became_true
        };

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        while **state == expected {
            match deadline {
                Some(deadline) => {
                    if queue.wait_until(state, deadline).timed_out() && **state == expected {
                        return Err(HandshakeTimeout { expected });
                    }
                }
                None => queue.wait(state),
            }
        }
        Ok(())
    }
}

impl Default for BooleanHandshake {
    fn default() -> Self {
        BooleanHandshake::new(false)
    }
}

impl std::fmt::Debug for BooleanHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BooleanHandshake")
            .field("value", &self.get_unsafe())
            .finish()
    }
}

/// Exclusive access to a [`BooleanHandshake`]. Dropping it unlocks.
pub struct HandshakeGuard<'a> {
    handshake: &'a BooleanHandshake,
    state: MutexGuard<'a, bool>,
}

impl HandshakeGuard<'_> {
    /// Returns the current value.
    pub fn get(&self) -> bool {
        *self.state
    }

    /// Sets the value while the lock is held, waking waiters of the new value.
    pub fn set(&mut self, value: bool) {
        self.handshake.store(&mut self.state, value);
    }

    /// Waits on the held lock while the condition equals `expected`.
    pub fn wait_if(&mut self, expected: bool, timeout: Option<Duration>) -> Result<(), HandshakeTimeout> {
        self.handshake.wait_locked(&mut self.state, expected, timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_wait_if_returns_when_condition_differs() {
        let handshake = BooleanHandshake::new(false);
        assert!(handshake.wait_if(true, Some(Duration::from_millis(1))).is_ok());
    }

    #[test]
    fn test_wait_if_times_out() {
        let handshake = BooleanHandshake::new(true);
        let start = Instant::now();
        assert_eq!(
            handshake.wait_if(true, Some(Duration::from_millis(20))),
            Err(HandshakeTimeout { expected: true })
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_set_wakes_waiter() {
        let handshake = Arc::new(BooleanHandshake::new(false));
        let join = {
            let handshake = handshake.clone();
            thread::spawn(move || handshake.wait_if(false, Some(Duration::from_secs(10))))
        };

        thread::sleep(Duration::from_millis(10));
        handshake.set(true);
        assert_eq!(join.join().ok(), Some(Ok(())));
        assert!(handshake.get_unsafe());
    }

    #[test]
    fn test_try_lock_does_not_block() {
        let handshake = BooleanHandshake::new(false);
        let guard = handshake.lock();
        assert!(handshake.try_lock().is_none());
        drop(guard);
        assert!(handshake.try_lock().is_some());
    }

    #[test]
    fn test_wait_and_lock_if_holds_lock() {
        let handshake = BooleanHandshake::new(true);
        let mut guard = handshake
            .wait_and_lock_if(false, None)
            .expect("condition is already true");
        assert!(guard.get());
        assert!(handshake.try_lock().is_none());
        guard.set(false);
        drop(guard);
        assert!(!handshake.get_unsafe());
    }

    #[test]
    fn test_acknowledge_through_try_lock() {
        // A control thread raises the flag and waits for a polling reader to clear it.
        let handshake = Arc::new(BooleanHandshake::new(false));
        let reader = {
            let handshake = handshake.clone();
            thread::spawn(move || loop {
                if handshake.get_unsafe() {
                    if let Some(mut guard) = handshake.try_lock() {
                        guard.set(false);
                        return;
                    }
                }
                thread::sleep(Duration::from_millis(1));
            })
        };

        handshake.set(true);
        assert!(handshake
            .wait_if(true, Some(Duration::from_secs(10)))
            .is_ok());
        assert!(reader.join().is_ok());
        assert!(!handshake.get_unsafe());
    }
}
