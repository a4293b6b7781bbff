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
//! A boolean gate with serialized writers and a double-buffered reader.
//!
//! [`SerializedGate::push`] returns once the new value sits in both copies and no
//! render cycle still holds a snapshot of the old value. It does not wait for the
//! render thread to actually observe the new value; the next [`GateReader::pop`]
//! is guaranteed to.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::double_buffer::{ConfigReader, ConfigWriter, DoubleBufferedConfig, ReadGuard};
use super::handshake::{BooleanHandshake, HandshakeTimeout};

/// Returned when the push lock could not be taken in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timed out after {0:?} waiting for the gate")]
pub struct GateTimeout(pub Duration);

struct GateShared {
    /// Serializes pushers. The guarded writer is the only way to change the value.
    push_lock: Mutex<ConfigWriter<bool>>,
    condition: BooleanHandshake,
}

/// The non-real-time side of the gate. Cheap to clone.
#[derive(Clone)]
pub struct SerializedGate {
    shared: Arc<GateShared>,
}

/// The real-time side of the gate.
pub struct GateReader {
    reader: ConfigReader<bool>,
}

impl SerializedGate {
    /// Creates a gate holding `initial`, returning the pusher and the reader.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(initial: bool) -> (SerializedGate, GateReader) {
        let (writer, reader) = DoubleBufferedConfig::new(initial);
        let gate = SerializedGate {
            shared: Arc::new(GateShared {
                push_lock: Mutex::new(writer),
                condition: BooleanHandshake::new(initial),
            }),
        };
        (gate, GateReader { reader })
    }

    /// Takes the push lock, writes `value` and keeps the lock until the returned
    /// [`GatePush`] is unlocked or dropped. A `None` timeout waits forever for the lock.
    pub fn push(&self, value: bool, timeout: Option<Duration>) -> Result<GatePush<'_>, GateTimeout> {
        let writer = match timeout {
            Some(timeout) => self
                .shared
                .push_lock
                .try_lock_for(timeout)
                .ok_or(GateTimeout(timeout))?,
            None => self.shared.push_lock.lock(),
        };

        let mut push = GatePush {
            writer,
            condition: &self.shared.condition,
            previous: false,
        };
        push.previous = push.write(value);
        Ok(push)
    }

    /// Pushes `value` and releases the push lock right away, returning the previous value.
    pub fn push_and_unlock(&self, value: bool, timeout: Option<Duration>) -> Result<bool, GateTimeout> {
        Ok(self.push(value, timeout)?.previous())
    }

    /// Blocks while the gate's value equals `expected`.
    pub fn wait_if(&self, expected: bool, timeout: Option<Duration>) -> Result<(), HandshakeTimeout> {
        self.shared.condition.wait_if(expected, timeout)
    }

    /// Reads the most recently pushed value without locking.
    pub fn get_unsafe(&self) -> bool {
        self.shared.condition.get_unsafe()
    }
}

impl std::fmt::Debug for SerializedGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializedGate")
            .field("value", &self.get_unsafe())
            .finish()
    }
}

/// A completed push that still holds the push lock.
pub struct GatePush<'a> {
    writer: MutexGuard<'a, ConfigWriter<bool>>,
    condition: &'a BooleanHandshake,
    previous: bool,
}

impl GatePush<'_> {
    /// The value the gate held before this push.
    pub fn previous(&self) -> bool {
        self.previous
    }

    /// Releases the push lock so the next pusher may proceed.
    pub fn unlock(self) {}

    /// Pushes again under the lock already held, then releases it. Returns the value
    /// this push replaced.
    pub fn push_and_unlock(mut self, value: bool) -> bool {
        self.write(value)
    }

    fn write(&mut self, value: bool) -> bool {
        let previous = *self.writer.get_config_for_update();
        self.writer.update(|current| *current = value);
        self.condition.set(value);
        previous
    }
}

impl GateReader {
    /// Pins the current value for the rest of the render cycle.
    pub fn pop(&mut self) -> GateSnapshot<'_> {
        GateSnapshot {
            guard: self.reader.lock(),
        }
    }
}

/// The value seen by the render thread for one cycle.
pub struct GateSnapshot<'a> {
    guard: ReadGuard<'a, bool>,
}

impl GateSnapshot<'_> {
    /// Ends the render thread's use of this snapshot.
    pub fn rtt_done(self) {}
}

impl Deref for GateSnapshot<'_> {
    type Target = bool;

    fn deref(&self) -> &bool {
        &self.guard
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_push_returns_previous_value() {
        let (gate, mut reader) = SerializedGate::new(false);
        assert_eq!(gate.push_and_unlock(true, None), Ok(false));
        assert_eq!(gate.push_and_unlock(true, None), Ok(true));
        assert!(*reader.pop());
        assert!(gate.get_unsafe());
    }

    #[test]
    fn test_push_times_out_while_locked() {
        let (gate, _reader) = SerializedGate::new(false);
        let held = gate.push(true, None).expect("first push");

        let other = gate.clone();
        let join = thread::spawn(move || {
            other
                .push_and_unlock(false, Some(Duration::from_millis(20)))
                .err()
        });
        assert_eq!(
            join.join().ok().flatten(),
            Some(GateTimeout(Duration::from_millis(20)))
        );

        assert!(!held.previous());
        held.unlock();
        assert_eq!(gate.push_and_unlock(false, None), Ok(true));
    }

    #[test]
    fn test_push_and_unlock_under_held_lock() {
        let (gate, mut reader) = SerializedGate::new(false);
        let held = gate.push(true, None).expect("push");
        assert!(*reader.pop());

        assert!(held.push_and_unlock(false));
        assert!(!*reader.pop());
        assert!(!gate.get_unsafe());
    }

    #[test]
    fn test_pop_ignores_push_lock() {
        let (gate, mut reader) = SerializedGate::new(false);
        let held = gate.push(true, None).expect("push");

        // Holding the push lock on this very thread must not affect the reader.
        let snapshot = reader.pop();
        assert!(*snapshot);
        snapshot.rtt_done();
        held.unlock();
    }

    #[test]
    fn test_wait_if_sees_pushed_value() {
        let (gate, _reader) = SerializedGate::new(true);
        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait_if(true, Some(Duration::from_secs(10))))
        };
        thread::sleep(Duration::from_millis(10));
        assert_eq!(gate.push_and_unlock(false, None), Ok(true));
        assert_eq!(waiter.join().ok(), Some(Ok(())));
    }

    #[test]
    fn test_concurrent_pushes_are_serialized() {
        let (gate, _reader) = SerializedGate::new(false);
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let pushers: Vec<_> = (0..2)
            .map(|_| {
                let gate = gate.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let push = gate.push(true, None).expect("push without timeout");
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        push.unlock();
                    }
                })
            })
            .collect();

        for pusher in pushers {
            assert!(pusher.join().is_ok());
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(gate.get_unsafe());
    }

    #[test]
    fn test_pop_stays_bounded_under_push_storm() {
        let (gate, mut reader) = SerializedGate::new(false);
        let stop = Arc::new(AtomicBool::new(false));

        let pushers: Vec<_> = (0..4)
            .map(|i| {
                let gate = gate.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    let mut value = i % 2 == 0;
                    while !stop.load(Ordering::Relaxed) {
                        let _ = gate.push_and_unlock(value, Some(Duration::from_millis(5)));
                        value = !value;
                    }
                })
            })
            .collect();

        let start = Instant::now();
        let mut slowest = Duration::ZERO;
        while start.elapsed() < Duration::from_millis(200) {
            let before = Instant::now();
            let snapshot = reader.pop();
            let _ = *snapshot;
            snapshot.rtt_done();
            slowest = slowest.max(before.elapsed());
        }
        stop.store(true, Ordering::Relaxed);
        for pusher in pushers {
            assert!(pusher.join().is_ok());
        }

        assert!(
            slowest < Duration::from_millis(50),
            "pop/rtt_done took {:?}",
            slowest
        );
    }
}
