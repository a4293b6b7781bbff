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
//! Events flowing from driver threads into the render thread.

use std::sync::Arc;

use parking_lot::Mutex;

/// Longest SysEx message carried by an event, including the framing bytes.
pub const MAX_SYSEX_LEN: usize = 32;

/// A SysEx message stored inline so events stay `Copy`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SysexData {
    bytes: [u8; MAX_SYSEX_LEN],
    len: u8,
}

impl SysexData {
    fn new(data: &[u8]) -> Option<SysexData> {
        if data.len() > MAX_SYSEX_LEN {
            return None;
        }
        let mut bytes = [0u8; MAX_SYSEX_LEN];
        bytes[..data.len()].copy_from_slice(data);
        Some(SysexData {
            bytes,
            len: data.len() as u8,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl std::fmt::Debug for SysexData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SysexData({:02x?})", self.as_slice())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NoteOn { key: u8, velocity: u8 },
    NoteOff { key: u8, velocity: u8 },
    ControlChange { controller: u8, value: u8 },
    ChannelPressure { value: u8 },
    PolyphonicKeyPressure { key: u8, value: u8 },
    /// Bend in -8192..=8191.
    PitchBend { value: i16 },
    ProgramChange { program: u8 },
    Sysex(SysexData),
}

/// An event addressed to a MIDI channel, `frame_offset` frames into the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub channel: u8,
    pub frame_offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("event queue is full")]
    QueueFull,
    #[error("SysEx message of {0} bytes exceeds {MAX_SYSEX_LEN} bytes")]
    SysexTooLong(usize),
    #[error("invalid MIDI channel {0}")]
    InvalidChannel(u8),
    #[error("invalid controller number {0}")]
    InvalidController(u8),
}

/// Creates the queue between dispatching threads and the render thread.
pub(crate) fn event_queue(capacity: usize) -> (EventSender, EventReceiver) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity.max(1));
    (
        EventSender {
            producer: Arc::new(Mutex::new(producer)),
        },
        EventReceiver { consumer },
    )
}

/// The dispatching side of the event queue. Any number of threads may share it;
/// pushes are serialized by a short lock that the render thread never touches.
#[derive(Clone)]
pub struct EventSender {
    producer: Arc<Mutex<rtrb::Producer<Event>>>,
}

impl EventSender {
    /// Queues an already built event.
    pub fn dispatch(&self, event: Event) -> Result<(), DispatchError> {
        if event.channel > 15 {
            return Err(DispatchError::InvalidChannel(event.channel));
        }
        // Slots above 127 hold aftertouch and pitch bend.
        if let EventKind::ControlChange { controller, .. } = event.kind {
            if controller > 127 {
                return Err(DispatchError::InvalidController(controller));
            }
        }
        self.producer
            .lock()
            .push(event)
            .map_err(|_| DispatchError::QueueFull)
    }

    pub fn dispatch_note_on(
        &self,
        key: u8,
        velocity: u8,
        channel: u8,
        frame_offset: u32,
    ) -> Result<(), DispatchError> {
        self.send(EventKind::NoteOn { key, velocity }, channel, frame_offset)
    }

    pub fn dispatch_note_off(
        &self,
        key: u8,
        velocity: u8,
        channel: u8,
        frame_offset: u32,
    ) -> Result<(), DispatchError> {
        self.send(EventKind::NoteOff { key, velocity }, channel, frame_offset)
    }

    pub fn dispatch_control_change(
        &self,
        controller: u8,
        value: u8,
        channel: u8,
        frame_offset: u32,
    ) -> Result<(), DispatchError> {
        self.send(
            EventKind::ControlChange { controller, value },
            channel,
            frame_offset,
        )
    }

    pub fn dispatch_channel_pressure(
        &self,
        value: u8,
        channel: u8,
        frame_offset: u32,
    ) -> Result<(), DispatchError> {
        self.send(EventKind::ChannelPressure { value }, channel, frame_offset)
    }

    pub fn dispatch_polyphonic_key_pressure(
        &self,
        key: u8,
        value: u8,
        channel: u8,
        frame_offset: u32,
    ) -> Result<(), DispatchError> {
        self.send(
            EventKind::PolyphonicKeyPressure { key, value },
            channel,
            frame_offset,
        )
    }

    pub fn dispatch_pitch_bend(
        &self,
        value: i16,
        channel: u8,
        frame_offset: u32,
    ) -> Result<(), DispatchError> {
        let value = value.clamp(-8192, 8191);
        self.send(EventKind::PitchBend { value }, channel, frame_offset)
    }

    pub fn dispatch_program_change(
        &self,
        program: u8,
        channel: u8,
        frame_offset: u32,
    ) -> Result<(), DispatchError> {
        self.send(EventKind::ProgramChange { program }, channel, frame_offset)
    }

    /// Queues a complete SysEx message, `F0` through `F7`.
    pub fn dispatch_sysex(
        &self,
        data: &[u8],
        channel: u8,
        frame_offset: u32,
    ) -> Result<(), DispatchError> {
        let data = SysexData::new(data).ok_or(DispatchError::SysexTooLong(data.len()))?;
        self.send(EventKind::Sysex(data), channel, frame_offset)
    }

    fn send(&self, kind: EventKind, channel: u8, frame_offset: u32) -> Result<(), DispatchError> {
        self.dispatch(Event {
            kind,
            channel,
            frame_offset,
        })
    }
}

impl std::fmt::Debug for EventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSender").finish()
    }
}

/// The render thread's side of the event queue.
pub(crate) struct EventReceiver {
    consumer: rtrb::Consumer<Event>,
}

impl EventReceiver {
    pub(crate) fn pop(&mut self) -> Option<Event> {
        self.consumer.pop().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_in_order() {
        let (sender, mut receiver) = event_queue(8);
        sender.dispatch_note_on(60, 100, 0, 10).unwrap();
        sender.dispatch_control_change(64, 127, 1, 0).unwrap();

        assert_eq!(
            receiver.pop(),
            Some(Event {
                kind: EventKind::NoteOn {
                    key: 60,
                    velocity: 100
                },
                channel: 0,
                frame_offset: 10,
            })
        );
        assert_eq!(receiver.pop().map(|event| event.channel), Some(1));
        assert_eq!(receiver.pop(), None);
    }

    #[test]
    fn test_queue_full() {
        let (sender, _receiver) = event_queue(1);
        sender.dispatch_program_change(3, 0, 0).unwrap();
        assert_eq!(
            sender.dispatch_program_change(4, 0, 0),
            Err(DispatchError::QueueFull)
        );
    }

    #[test]
    fn test_rejects_bad_input() {
        let (sender, _receiver) = event_queue(4);
        assert_eq!(
            sender.dispatch_note_on(60, 100, 16, 0),
            Err(DispatchError::InvalidChannel(16))
        );
        assert_eq!(
            sender.dispatch_control_change(128, 99, 0, 0),
            Err(DispatchError::InvalidController(128))
        );
        assert_eq!(
            sender.dispatch_sysex(&[0xf0; 40], 0, 0),
            Err(DispatchError::SysexTooLong(40))
        );
    }

    #[test]
    fn test_sysex_stored_inline() {
        let (sender, mut receiver) = event_queue(4);
        let message = [0xf0, 0x7f, 0x7f, 0x04, 0x01, 0x00, 0x40, 0xf7];
        sender.dispatch_sysex(&message, 0, 0).unwrap();
        match receiver.pop().map(|event| event.kind) {
            Some(EventKind::Sysex(data)) => assert_eq!(data.as_slice(), &message),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
