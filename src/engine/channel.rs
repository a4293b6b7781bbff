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
//! Per-channel state and event processing.

use crate::config::EngineConfig;
use crate::diagnostics::Diagnostic;
use crate::instrument::{Instrument, RegionId};

use super::controllers::{ControllerTable, AFTERTOUCH_INDEX, SUSTAIN_PEDAL};
use super::event::{Event, EventKind};
use super::note::ScriptNote;
use super::pool::Handle;
use super::trigger::TriggerRequest;
use super::voice::{VoiceCommand, VoiceType};
use super::EngineCore;

const VOLUME: u8 = 7;
const PAN: u8 = 10;
const ALL_SOUND_OFF: u8 = 120;
const ALL_NOTES_OFF: u8 = 123;

/// Asks voices of older notes in `group` to fade out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeyGroupEvent {
    pub(crate) group: u32,
    pub(crate) offset: usize,
    /// Serial of the note that caused the conflict.
    pub(crate) serial: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct KeyState {
    pub(crate) pressed: bool,
    /// Velocity of the last note-on, handed to release triggers.
    pub(crate) velocity: u8,
    /// Engine frame of the last note-on.
    pub(crate) on_frame: u64,
    /// The key's region can launch release voices on note-off.
    pub(crate) release_trigger: bool,
}

/// Everything the render thread tracks for one MIDI channel.
pub(crate) struct ChannelState {
    pub(crate) index: u8,
    /// Generation of the instrument the voices belong to, 0 for none.
    pub(crate) generation: u64,
    pub(crate) controllers: ControllerTable,
    pub(crate) volume: f32,
    pub(crate) pan: u8,
    pub(crate) keys: [KeyState; 128],
    /// Notes owned by this channel. May hold stale handles until the next sweep.
    pub(crate) notes: Vec<Handle>,
    pub(crate) key_group_events: Vec<KeyGroupEvent>,
    max_key_group_events: usize,
    /// This cycle's events, in arrival order.
    pub(crate) events: Vec<Event>,
    /// Round robin counters, indexed by the low key of the region.
    pub(crate) region_round_robin: [u32; 128],
    pub(crate) round_robin_keyboard: u32,
    /// Keyboard dimension position of the last note-on, 0..1.
    pub(crate) keyboard_position: f32,
}

impl ChannelState {
    pub(crate) fn new(index: u8, config: &EngineConfig) -> ChannelState {
        ChannelState {
            index,
            generation: 0,
            controllers: ControllerTable::new(),
            volume: 1.0,
            pan: 64,
            keys: [KeyState::default(); 128],
            notes: Vec::with_capacity(config.max_notes()),
            key_group_events: Vec::with_capacity(config.max_key_group_events()),
            max_key_group_events: config.max_key_group_events(),
            events: Vec::with_capacity(config.event_queue_capacity()),
            region_round_robin: [0; 128],
            round_robin_keyboard: 0,
            keyboard_position: 0.0,
        }
    }

    /// Records a key group conflict. Returns false if this cycle's list is full.
    pub(crate) fn push_key_group_event(&mut self, event: KeyGroupEvent) -> bool {
        if self.key_group_events.len() >= self.max_key_group_events {
            return false;
        }
        self.key_group_events.push(event);
        true
    }
}

/// Decodes a universal real-time master volume message into a gain.
pub(crate) fn master_volume(sysex: &[u8]) -> Option<f32> {
    match *sysex {
        [0xf0, 0x7f, _, 0x04, 0x01, lsb, msb, 0xf7] if lsb < 0x80 && msb < 0x80 => {
            let value = ((msb as u32) << 7) | lsb as u32;
            Some(value as f32 / 16383.0)
        }
        _ => None,
    }
}

impl EngineCore {
    /// Runs every event queued for `channel` this cycle.
    pub(crate) fn process_events(
        &mut self,
        channel: &mut ChannelState,
        instrument: Option<&Instrument>,
        suspended: &[RegionId],
    ) {
        for index in 0..channel.events.len() {
            let event = channel.events[index];
            self.process_event(channel, instrument, suspended, event);
        }
        channel.events.clear();
    }

    fn process_event(
        &mut self,
        channel: &mut ChannelState,
        instrument: Option<&Instrument>,
        suspended: &[RegionId],
        event: Event,
    ) {
        match event.kind {
            EventKind::NoteOn { key, velocity: 0 } | EventKind::NoteOff { key, .. } => {
                let key = key & 0x7f;
                channel.keys[key as usize].pressed = false;
                if !channel.controllers.sustain_pedal() {
                    self.release_key(channel, instrument, suspended, key, event);
                }
            }
            EventKind::NoteOn { key, velocity } => {
                self.note_on(channel, instrument, suspended, key & 0x7f, velocity, event)
            }
            EventKind::ControlChange { controller, value } => {
                self.control_change(channel, instrument, suspended, controller, value, event)
            }
            EventKind::ChannelPressure { value } => {
                channel.controllers.set(AFTERTOUCH_INDEX, value)
            }
            EventKind::PolyphonicKeyPressure { key, value } => {
                channel.controllers.set_poly_pressure(key, value)
            }
            EventKind::PitchBend { value } => channel.controllers.set_pitch_bend(value),
            EventKind::ProgramChange { program } => {
                self.diagnostics.report(Diagnostic::ProgramChange {
                    channel: channel.index,
                    program,
                })
            }
            EventKind::Sysex(data) => match master_volume(data.as_slice()) {
                Some(volume) => {
                    self.master_volume = volume;
                    self.diagnostics
                        .report(Diagnostic::MasterVolume { volume });
                }
                None => self.diagnostics.report(Diagnostic::SysexIgnored {
                    len: data.as_slice().len(),
                }),
            },
        }
    }

    fn note_on(
        &mut self,
        channel: &mut ChannelState,
        instrument: Option<&Instrument>,
        suspended: &[RegionId],
        key: u8,
        velocity: u8,
        event: Event,
    ) {
        let offset = event.frame_offset as usize;
        let state = &mut channel.keys[key as usize];
        state.pressed = true;
        state.velocity = velocity;
        state.on_frame = self.frame_clock + offset as u64;

        let Some(instrument) = instrument else {
            return;
        };
        if let Some(position) = instrument.keyboard_position(key) {
            channel.keyboard_position = position;
        }

        // Re-pressing a key brings its releasing voices back.
        if !channel.controllers.sustain_pedal() {
            for handle in channel.notes.iter() {
                let Some(note) = self.notes.get_mut(*handle) else {
                    continue;
                };
                if note.host_key != key || note.release_note {
                    continue;
                }
                note.released = false;
                for voice in note.voices.iter() {
                    if let Some(voice) = self.voices.get_mut(*voice) {
                        voice.schedule(offset, VoiceCommand::CancelRelease);
                    }
                }
            }
        }

        self.next_serial += 1;
        let serial = self.next_serial;
        let Some((handle, note)) = self.notes.alloc() else {
            self.diagnostics.report(Diagnostic::NotePoolExhausted {
                channel: channel.index,
                key,
            });
            return;
        };
        note.reset(event, key, velocity, serial);
        if let Some(script) = self.script.as_mut() {
            let region = instrument.region_for_key(key).map(|(_, region)| region);
            script.note_on(&mut ScriptNote::new(note, region));
        }
        let note_key = note.key;
        channel.notes.push(handle);

        let region = instrument.region_for_key(note_key).map(|(_, region)| region);
        let layers = region.map_or(0, |region| region.layers());
        let mut release_trigger = false;
        for layer in 0..layers {
            let request = TriggerRequest {
                note: handle,
                layer,
                offset,
                release_trigger: false,
                voice_stealing: true,
                key_group_conflicts: true,
                note_length: 0.0,
            };
            if let Some(voice) = self.trigger_voice(channel, instrument, suspended, &request) {
                release_trigger |= self
                    .voices
                    .get(voice)
                    .is_some_and(|voice| voice.voice_type == VoiceType::ReleaseTriggerRequired);
            }
        }

        // Only a key that actually sounded gets release voices at note-off.
        channel.keys[key as usize].release_trigger = release_trigger;
        if let Some(region) = region {
            let counter = &mut channel.region_round_robin[region.low_key() as usize];
            *counter = counter.wrapping_add(1);
            channel.round_robin_keyboard = channel.round_robin_keyboard.wrapping_add(1);
        }

        if self.notes.get(handle).is_some_and(|note| note.voices.is_empty()) {
            self.notes.free(handle);
            channel.notes.pop();
        }
    }

    /// Releases the voices of `key` and fires its release trigger, if any.
    fn release_key(
        &mut self,
        channel: &mut ChannelState,
        instrument: Option<&Instrument>,
        suspended: &[RegionId],
        key: u8,
        event: Event,
    ) {
        let offset = event.frame_offset as usize;
        for handle in channel.notes.iter() {
            let Some(note) = self.notes.get_mut(*handle) else {
                continue;
            };
            if note.host_key != key || note.release_note || note.released {
                continue;
            }
            note.released = true;
            for voice in note.voices.iter() {
                if let Some(voice) = self.voices.get_mut(*voice) {
                    voice.schedule(offset, VoiceCommand::Release);
                }
            }
        }

        let state = channel.keys[key as usize];
        if !state.release_trigger {
            return;
        }
        channel.keys[key as usize].release_trigger = false;
        let Some(instrument) = instrument else {
            return;
        };
        let layers = instrument
            .region_for_key(key)
            .map_or(0, |(_, region)| region.layers());
        if layers == 0 {
            return;
        }

        self.next_serial += 1;
        let serial = self.next_serial;
        let Some((handle, note)) = self.notes.alloc() else {
            self.diagnostics.report(Diagnostic::NotePoolExhausted {
                channel: channel.index,
                key,
            });
            return;
        };
        // Release voices sound with the velocity of the note-on.
        note.reset(event, key, state.velocity, serial);
        note.release_note = true;
        note.released = true;
        channel.notes.push(handle);

        let held_frames = (self.frame_clock + offset as u64).saturating_sub(state.on_frame);
        let note_length = held_frames as f32 / self.sample_rate as f32;
        for layer in 0..layers {
            let request = TriggerRequest {
                note: handle,
                layer,
                offset,
                release_trigger: true,
                voice_stealing: false,
                key_group_conflicts: false,
                note_length,
            };
            self.trigger_voice(channel, instrument, suspended, &request);
        }

        if self.notes.get(handle).is_some_and(|note| note.voices.is_empty()) {
            self.notes.free(handle);
            channel.notes.pop();
        }
    }

    fn control_change(
        &mut self,
        channel: &mut ChannelState,
        instrument: Option<&Instrument>,
        suspended: &[RegionId],
        controller: u8,
        value: u8,
        event: Event,
    ) {
        let pedal_was_down = channel.controllers.sustain_pedal();
        channel.controllers.set(controller as usize, value);

        match controller {
            VOLUME => channel.volume = value.min(127) as f32 / 127.0,
            PAN => channel.pan = value.min(127),
            SUSTAIN_PEDAL if pedal_was_down && !channel.controllers.sustain_pedal() => {
                for key in 0..128u8 {
                    if !channel.keys[key as usize].pressed && self.key_sounding(channel, key) {
                        self.release_key(channel, instrument, suspended, key, event);
                    }
                }
            }
            ALL_SOUND_OFF => {
                self.kill_channel_voices(channel, |_| true);
            }
            ALL_NOTES_OFF => {
                for key in 0..128u8 {
                    channel.keys[key as usize].pressed = false;
                    if self.key_sounding(channel, key) {
                        self.release_key(channel, instrument, suspended, key, event);
                    }
                }
            }
            _ => {}
        }
    }

    /// Whether `key` has unreleased notes or a pending release trigger.
    fn key_sounding(&self, channel: &ChannelState, key: u8) -> bool {
        channel.keys[key as usize].release_trigger
            || channel.notes.iter().any(|handle| {
                self.notes.get(*handle).is_some_and(|note| {
                    note.host_key == key && !note.release_note && !note.released
                })
            })
    }
}
