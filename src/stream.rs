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
//! Disk streaming for samples longer than the RAM cache.
//!
//! The render thread owns a [`StreamManager`]: it orders streams, reads frames from
//! them and deletes them. A lower-priority [`DiskThread`] fills one ring buffer per
//! stream slot. Rings hold interleaved stereo frames; mono samples are duplicated.
//!
//! Frame numbers are "unrolled": past a sample loop's end they keep counting up
//! while the data wraps back to the loop start.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, span, Level};

use crate::config::EngineConfig;
use crate::instrument::Sample;
use crate::playsync::CancelHandle;

/// Frames the disk thread writes into one ring per pass.
const FILL_CHUNK_FRAMES: usize = 4096;

/// How long the disk thread idles when no ring needed data.
const IDLE_INTERVAL: Duration = Duration::from_millis(2);

const SLOT_FREE: u8 = 0;
const SLOT_ACTIVE: u8 = 1;
const SLOT_DELETING: u8 = 2;

/// Identifies an ordered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamId(usize);

impl StreamId {
    pub fn slot(&self) -> usize {
        self.0
    }
}

/// Maps an unrolled frame number onto the sample's frames, `None` past the end.
pub fn unrolled_frame(sample: &Sample, frame: usize) -> Option<usize> {
    match sample.sample_loop() {
        Some(sample_loop) if sample_loop.length > 0 && frame >= sample_loop.end() => Some(
            sample_loop.start + (frame - sample_loop.start) % sample_loop.length,
        ),
        _ => (frame < sample.frames()).then_some(frame),
    }
}

enum StreamCommand {
    Order {
        slot: usize,
        sample: Arc<Sample>,
        start_frame: usize,
    },
    Delete {
        slot: usize,
    },
}

#[derive(Default)]
struct SlotShared {
    state: AtomicU8,
    /// Set once the last frame of a non-looping sample is in the ring.
    eof: AtomicBool,
}

/// Creates the render-side manager and the disk thread for `config.max_streams()` slots.
pub fn disk_streams(config: &EngineConfig) -> (StreamManager, DiskThread) {
    let slot_count = config.max_streams();
    let ring_floats = config.stream_buffer_frames().max(1) * 2;
    let slots: Arc<[SlotShared]> = (0..slot_count).map(|_| SlotShared::default()).collect();

    // Each slot has at most one order and one delete in flight.
    let (command_producer, command_consumer) = rtrb::RingBuffer::new((slot_count * 2).max(1));

    let mut consumers = Vec::with_capacity(slot_count);
    let mut producers = Vec::with_capacity(slot_count);
    for _ in 0..slot_count {
        let (producer, consumer) = rtrb::RingBuffer::new(ring_floats);
        producers.push(producer);
        consumers.push(consumer);
    }

    (
        StreamManager {
            commands: command_producer,
            consumers,
            slots: slots.clone(),
        },
        DiskThread {
            commands: command_consumer,
            producers,
            jobs: (0..slot_count).map(|_| None).collect(),
            slots,
        },
    )
}

/// The render thread's side of disk streaming. Never blocks or allocates.
pub struct StreamManager {
    commands: rtrb::Producer<StreamCommand>,
    consumers: Vec<rtrb::Consumer<f32>>,
    slots: Arc<[SlotShared]>,
}

impl StreamManager {
    /// Orders a stream of `sample` starting at unrolled frame `start_frame`.
    /// Returns `None` when every slot is busy.
    pub fn order(&mut self, sample: &Arc<Sample>, start_frame: usize) -> Option<StreamId> {
        let slot = self
            .slots
            .iter()
            .position(|slot| slot.state.load(Ordering::Acquire) == SLOT_FREE)?;

        // Whatever the previous user left behind is stale.
        let consumer = &mut self.consumers[slot];
        while consumer.pop().is_ok() {}

        let shared = &self.slots[slot];
        shared.eof.store(false, Ordering::Release);
        shared.state.store(SLOT_ACTIVE, Ordering::Release);
        let command = StreamCommand::Order {
            slot,
            sample: sample.clone(),
            start_frame,
        };
        if self.commands.push(command).is_err() {
            shared.state.store(SLOT_FREE, Ordering::Release);
            return None;
        }
        Some(StreamId(slot))
    }

    /// Reads up to `out.len() / 2` frames of interleaved stereo data, returning the
    /// number of frames read.
    pub fn read(&mut self, stream: StreamId, out: &mut [f32]) -> usize {
        let mut frames = 0;
        for frame in out.chunks_exact_mut(2) {
            match self.read_frame(stream) {
                Some((left, right)) => {
                    frame[0] = left;
                    frame[1] = right;
                    frames += 1;
                }
                None => break,
            }
        }
        frames
    }

    /// Reads one frame if the disk thread has delivered it.
    pub fn read_frame(&mut self, stream: StreamId) -> Option<(f32, f32)> {
        let consumer = self.consumers.get_mut(stream.0)?;
        if consumer.slots() < 2 {
            return None;
        }
        let left = consumer.pop().ok()?;
        let right = consumer.pop().ok()?;
        Some((left, right))
    }

    /// Frames ready to be read.
    pub fn available(&self, stream: StreamId) -> usize {
        self.consumers
            .get(stream.0)
            .map_or(0, |consumer| consumer.slots() / 2)
    }

    /// Whether the stream has delivered its final frame and it has been read.
    pub fn is_eof(&self, stream: StreamId) -> bool {
        self.slots[stream.0].eof.load(Ordering::Acquire) && self.available(stream) == 0
    }

    /// Hands the slot back. It becomes reusable once the disk thread acknowledges.
    pub fn delete(&mut self, stream: StreamId) {
        let shared = &self.slots[stream.0];
        if shared.state.load(Ordering::Acquire) != SLOT_ACTIVE {
            return;
        }
        shared.state.store(SLOT_DELETING, Ordering::Release);
        // Capacity covers one order and one delete per slot, so this cannot fail.
        let _ = self.commands.push(StreamCommand::Delete { slot: stream.0 });
    }

    /// Number of slots currently ordered or awaiting deletion.
    pub fn busy_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state.load(Ordering::Acquire) != SLOT_FREE)
            .count()
    }
}

struct Job {
    sample: Arc<Sample>,
    next_frame: usize,
}

/// Fills stream rings on its own thread.
pub struct DiskThread {
    commands: rtrb::Consumer<StreamCommand>,
    producers: Vec<rtrb::Producer<f32>>,
    jobs: Vec<Option<Job>>,
    slots: Arc<[SlotShared]>,
}

impl DiskThread {
    /// Runs the disk thread until cancelled.
    pub fn spawn(mut self, cancel: CancelHandle) -> JoinHandle<()> {
        thread::spawn(move || {
            let span = span!(Level::INFO, "disk streams");
            let _enter = span.enter();
            info!(slots = self.producers.len(), "Disk thread started");

            while !cancel.is_cancelled() {
                if self.fill() == 0 && cancel.wait_timeout(IDLE_INTERVAL) {
                    break;
                }
            }

            info!("Disk thread stopped");
        })
    }

    /// Handles pending orders and deletions, then tops up every active ring.
    /// Returns the number of frames written.
    pub fn fill(&mut self) -> usize {
        self.handle_commands();

        let mut written = 0;
        for (slot, job) in self.jobs.iter_mut().enumerate() {
            let Some(job) = job else {
                continue;
            };
            let producer = &mut self.producers[slot];
            let mut frames = 0;
            while frames < FILL_CHUNK_FRAMES && producer.slots() >= 2 {
                let Some(frame) = unrolled_frame(&job.sample, job.next_frame) else {
                    break;
                };
                let (left, right) = job.sample.frame(frame);
                if producer.push(left).is_err() || producer.push(right).is_err() {
                    break;
                }
                job.next_frame += 1;
                frames += 1;
            }
            if unrolled_frame(&job.sample, job.next_frame).is_none() {
                self.slots[slot].eof.store(true, Ordering::Release);
            }
            written += frames;
        }
        written
    }

    fn handle_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            match command {
                StreamCommand::Order {
                    slot,
                    sample,
                    start_frame,
                } => {
                    debug!(slot, sample = sample.name(), start_frame, "Stream ordered");
                    self.jobs[slot] = Some(Job {
                        sample,
                        next_frame: start_frame,
                    });
                }
                StreamCommand::Delete { slot } => {
                    self.jobs[slot] = None;
                    self.slots[slot].state.store(SLOT_FREE, Ordering::Release);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::SampleLoop;
    use crate::testutil::eventually;

    fn ramp(frames: usize) -> Arc<Sample> {
        let data = (0..frames).map(|frame| frame as f32).collect();
        Arc::new(Sample::from_interleaved("ramp", 1, 44100, data))
    }

    fn small_config() -> EngineConfig {
        EngineConfig::default()
            .with_max_streams(2)
            .with_stream_buffer_frames(64)
    }

    #[test]
    fn test_unrolled_frames() {
        let plain = ramp(10);
        assert_eq!(unrolled_frame(&plain, 9), Some(9));
        assert_eq!(unrolled_frame(&plain, 10), None);

        let looped = Sample::from_interleaved("loop", 1, 44100, vec![0.0; 10])
            .with_loop(SampleLoop {
                start: 4,
                length: 4,
            })
            .unwrap();
        assert_eq!(unrolled_frame(&looped, 7), Some(7));
        assert_eq!(unrolled_frame(&looped, 8), Some(4));
        assert_eq!(unrolled_frame(&looped, 13), Some(5));
    }

    #[test]
    fn test_order_fill_and_read() {
        let (mut manager, mut disk) = disk_streams(&small_config());
        let sample = ramp(100);

        let stream = manager.order(&sample, 90).unwrap();
        assert_eq!(manager.read_frame(stream), None);

        assert_eq!(disk.fill(), 10);
        assert_eq!(manager.available(stream), 10);
        assert_eq!(manager.read_frame(stream), Some((90.0, 90.0)));

        let mut out = [0.0f32; 40];
        assert_eq!(manager.read(stream, &mut out), 9);
        assert_eq!(out[16], 99.0);
        assert!(manager.is_eof(stream));
    }

    #[test]
    fn test_slots_reused_after_acknowledged_delete() {
        let (mut manager, mut disk) = disk_streams(&small_config());
        let sample = ramp(1000);

        let first = manager.order(&sample, 0).unwrap();
        let second = manager.order(&sample, 0).unwrap();
        assert_ne!(first, second);
        assert!(manager.order(&sample, 0).is_none());

        disk.fill();
        manager.delete(first);
        assert_eq!(manager.busy_slots(), 2);
        assert!(manager.order(&sample, 0).is_none());

        disk.fill();
        assert_eq!(manager.busy_slots(), 1);
        let third = manager.order(&sample, 500).unwrap();
        assert_eq!(third.slot(), first.slot());

        // Leftovers of the deleted stream were discarded.
        disk.fill();
        assert_eq!(manager.read_frame(third), Some((500.0, 500.0)));
    }

    #[test]
    fn test_spawned_disk_thread_fills() {
        let (mut manager, disk) = disk_streams(&small_config());
        let sample = ramp(1000);
        let stream = manager.order(&sample, 0).unwrap();

        let cancel = CancelHandle::new();
        let join = disk.spawn(cancel.clone());

        let manager = parking_lot::Mutex::new(manager);
        eventually(
            || manager.lock().available(stream) == 64,
            "Disk thread never filled the ring",
        );

        cancel.cancel();
        assert!(join.join().is_ok());
    }
}
