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
//! Double-buffered configuration with lock-free readers.
//!
//! A single [`ConfigWriter`] edits the inactive copy and then switches which copy is
//! active. Each [`ConfigReader`] pins the active copy with two atomic stores and
//! one load. The writer only ever waits for pins that started before its switch,
//! and the copy it returns is never pinned by anyone.

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

/// How long the writer sleeps between checks on a reader that is still pinned.
const SWITCH_POLL_INTERVAL: Duration = Duration::from_micros(200);

/// The shared state behind a writer and its readers.
pub struct DoubleBufferedConfig<T> {
    copies: [UnsafeCell<T>; 2],
    /// Index of the copy readers resolve to.
    active: AtomicUsize,
    /// Registered readers. Only touched from non-real-time threads.
    readers: Mutex<Vec<Arc<ReaderSlot>>>,
}

// SAFETY: access to `copies` is partitioned between the single writer (the copy at
// `update_index`) and readers (the copy at `active`); `switch_config` only hands a copy
// back to the writer after every reader pinned on it has released its pin.
unsafe impl<T: Send> Send for DoubleBufferedConfig<T> {}
unsafe impl<T: Send + Sync> Sync for DoubleBufferedConfig<T> {}

impl<T: Clone> DoubleBufferedConfig<T> {
    /// Creates both copies from `initial` and returns the writer with a first reader.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(initial: T) -> (ConfigWriter<T>, ConfigReader<T>) {
        let shared = Arc::new(DoubleBufferedConfig {
            copies: [UnsafeCell::new(initial.clone()), UnsafeCell::new(initial)],
            active: AtomicUsize::new(0),
            readers: Mutex::new(Vec::new()),
        });
        let writer = ConfigWriter {
            shared,
            update_index: 1,
        };
        let reader = writer.reader();
        (writer, reader)
    }
}

/// Pin state of one reader: zero when unpinned, otherwise an odd pin counter.
#[derive(Default)]
struct ReaderSlot {
    lock: AtomicU32,
}

/// The single writer of a [`DoubleBufferedConfig`].
pub struct ConfigWriter<T> {
    shared: Arc<DoubleBufferedConfig<T>>,
    update_index: usize,
}

impl<T> ConfigWriter<T> {
    /// Registers a new reader of this configuration.
    pub fn reader(&self) -> ConfigReader<T> {
        let slot = Arc::new(ReaderSlot::default());
        self.shared.readers.lock().push(slot.clone());
        ConfigReader {
            shared: self.shared.clone(),
            slot,
            lock_count: 1,
        }
    }

    /// Returns the inactive copy for editing.
    pub fn get_config_for_update(&mut self) -> &mut T {
        // SAFETY: readers never resolve to `update_index` between switches.
        unsafe { &mut *self.shared.copies[self.update_index].get() }
    }

    /// Makes the edited copy active and returns the previously active copy once no
    /// reader is pinned on it any more. Callers usually repeat their edit on it so
    /// both copies agree.
    pub fn switch_config(&mut self) -> &mut T {
        self.shared.active.store(self.update_index, Ordering::Release);
        fence(Ordering::SeqCst);

        {
            let readers = self.shared.readers.lock();
            for reader in readers.iter() {
                let pinned = reader.lock.load(Ordering::Acquire);
                if pinned == 0 {
                    continue;
                }
                // The reader may still hold the old copy. Any later pin sees the new index.
                while reader.lock.load(Ordering::Acquire) == pinned {
                    thread::sleep(SWITCH_POLL_INTERVAL);
                }
            }
        }

        self.update_index ^= 1;
        self.get_config_for_update()
    }

    /// Applies `edit` to both copies, switching in between.
    pub fn update(&mut self, mut edit: impl FnMut(&mut T)) {
        edit(self.get_config_for_update());
        edit(self.switch_config());
    }
}

/// A lock-free reader of a [`DoubleBufferedConfig`].
///
/// Readers are created and dropped on non-real-time threads; [`ConfigReader::lock`]
/// itself is real-time safe.
pub struct ConfigReader<T> {
    shared: Arc<DoubleBufferedConfig<T>>,
    slot: Arc<ReaderSlot>,
    lock_count: u32,
}

impl<T> ConfigReader<T> {
    /// Pins the active copy until the returned guard is dropped.
    pub fn lock(&mut self) -> ReadGuard<'_, T> {
        // Stays odd, so a pinned slot is never zero.
        self.lock_count = self.lock_count.wrapping_add(2);
        self.slot.lock.store(self.lock_count, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let index = self.shared.active.load(Ordering::Acquire);
        ReadGuard {
            // SAFETY: the pin published above keeps the writer off this copy.
            value: unsafe { &*self.shared.copies[index].get() },
            slot: &self.slot,
        }
    }
}

impl<T> Drop for ConfigReader<T> {
    fn drop(&mut self) {
        self.shared
            .readers
            .lock()
            .retain(|slot| !Arc::ptr_eq(slot, &self.slot));
    }
}

/// A pinned snapshot of the active copy. Dropping it unpins.
pub struct ReadGuard<'a, T> {
    value: &'a T,
    slot: &'a ReaderSlot,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.slot.lock.store(0, Ordering::Release);
    }
}
