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
//! Out-of-band reporting from the render thread.
//!
//! The render thread never logs. It pushes [`Diagnostic`] values into a lock-free
//! ring which a non-real-time thread drains into `tracing`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, span, warn, Level};

use crate::instrument::{DimensionKind, RegionId};
use crate::playsync::CancelHandle;

/// Something the render thread wants a human or a listener to know about.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Diagnostic {
    VoicePoolExhausted { channel: u8, key: u8 },
    NotePoolExhausted { channel: u8, key: u8 },
    StreamPoolExhausted { channel: u8, key: u8 },
    /// A region used a dimension the trigger does not know how to feed.
    UnknownDimension { kind: DimensionKind },
    /// A disk stream had fewer frames ready than the voice needed.
    StreamStarved { slot: usize, missing: usize },
    KeyGroupEventsDropped { channel: u8 },
    ProgramChange { channel: u8, program: u8 },
    SysexIgnored { len: usize },
    MasterVolume { volume: f32 },
    InstrumentChanged { channel: u8, generation: u64 },
    RegionSuspended { region: RegionId },
}

impl Diagnostic {
    /// Logs the diagnostic at a level matching its severity.
    pub fn log(&self) {
        match self {
            Diagnostic::VoicePoolExhausted { channel, key } => {
                warn!(channel, key, "Voice pool exhausted, note dropped")
            }
            Diagnostic::NotePoolExhausted { channel, key } => {
                warn!(channel, key, "Note pool exhausted, note dropped")
            }
            Diagnostic::StreamPoolExhausted { channel, key } => {
                warn!(channel, key, "No free disk stream, voice plays from memory only")
            }
            Diagnostic::UnknownDimension { kind } => {
                error!(kind = ?kind, "Unsupported dimension type, using zone 0")
            }
            Diagnostic::StreamStarved { slot, missing } => {
                debug!(slot, missing, "Disk stream starved, substituted silence")
            }
            Diagnostic::KeyGroupEventsDropped { channel } => {
                warn!(channel, "Too many key group events in one cycle")
            }
            Diagnostic::ProgramChange { channel, program } => {
                info!(channel, program, "Program change")
            }
            Diagnostic::SysexIgnored { len } => debug!(len, "Ignored SysEx message"),
            Diagnostic::MasterVolume { volume } => debug!(volume, "Master volume changed"),
            Diagnostic::InstrumentChanged {
                channel,
                generation,
            } => info!(channel, generation, "Instrument changed"),
            Diagnostic::RegionSuspended { region } => {
                debug!(region = %region, "Region suspended")
            }
        }
    }
}

/// Creates the render-side sink and the logging side of a diagnostic channel.
pub fn diagnostics_channel(capacity: usize) -> (DiagnosticSink, DiagnosticLog) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        DiagnosticSink {
            producer,
            dropped: dropped.clone(),
        },
        DiagnosticLog { consumer, dropped },
    )
}

/// The real-time side. Reporting never blocks or allocates.
pub struct DiagnosticSink {
    producer: rtrb::Producer<Diagnostic>,
    dropped: Arc<AtomicU64>,
}

impl DiagnosticSink {
    /// Queues a diagnostic, counting it as dropped if the ring is full.
    pub fn report(&mut self, diagnostic: Diagnostic) {
        if self.producer.push(diagnostic).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// The non-real-time side.
pub struct DiagnosticLog {
    consumer: rtrb::Consumer<Diagnostic>,
    dropped: Arc<AtomicU64>,
}

impl DiagnosticLog {
    /// Returns the next pending diagnostic.
    pub fn pop(&mut self) -> Option<Diagnostic> {
        self.consumer.pop().ok()
    }

    /// Hands every pending diagnostic to `handle`, returning how many there were.
    pub fn drain(&mut self, mut handle: impl FnMut(Diagnostic)) -> usize {
        let mut count = 0;
        while let Ok(diagnostic) = self.consumer.pop() {
            handle(diagnostic);
            count += 1;
        }
        count
    }

    /// Logs every pending diagnostic, along with any that were dropped since the last call.
    pub fn log_pending(&mut self) -> usize {
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            warn!(dropped, "Diagnostics were dropped, ring buffer full");
        }
        self.drain(|diagnostic| diagnostic.log())
    }

    /// Logs pending diagnostics every `interval` until cancelled.
    pub fn spawn(mut self, cancel: CancelHandle, interval: Duration) -> JoinHandle<()> {
        thread::spawn(move || {
            let span = span!(Level::INFO, "diagnostics");
            let _enter = span.enter();
            loop {
                self.log_pending();
                if cancel.wait_timeout(interval) {
                    self.log_pending();
                    return;
                }
            }
        })
    }
}
