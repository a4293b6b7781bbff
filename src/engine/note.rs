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
//! Notes and the script hook that may shape them.

use crate::instrument::{apply_dimension_override, DimensionKind, Region};

use super::event::Event;
use super::pool::Handle;

/// Most voices a single note can own.
pub const MAX_VOICES_PER_NOTE: usize = 32;

/// Per-note factors a script may set. Everything but `pan` is multiplicative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteOverrides {
    pub volume: f32,
    pub pitch: f32,
    /// Added to the pan position, -1 (left) to 1 (right).
    pub pan: f32,
    pub cutoff: f32,
    pub resonance: f32,
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
    pub cutoff_attack: f32,
    pub cutoff_decay: f32,
    pub cutoff_sustain: f32,
    pub cutoff_release: f32,
    pub amp_lfo_depth: f32,
    pub amp_lfo_frequency: f32,
    pub cutoff_lfo_depth: f32,
    pub cutoff_lfo_frequency: f32,
    pub pitch_lfo_depth: f32,
    pub pitch_lfo_frequency: f32,
}

impl Default for NoteOverrides {
    fn default() -> Self {
        NoteOverrides {
            volume: 1.0,
            pitch: 1.0,
            pan: 0.0,
            cutoff: 1.0,
            resonance: 1.0,
            attack: 1.0,
            decay: 1.0,
            sustain: 1.0,
            release: 1.0,
            cutoff_attack: 1.0,
            cutoff_decay: 1.0,
            cutoff_sustain: 1.0,
            cutoff_release: 1.0,
            amp_lfo_depth: 1.0,
            amp_lfo_frequency: 1.0,
            cutoff_lfo_depth: 1.0,
            cutoff_lfo_frequency: 1.0,
            pitch_lfo_depth: 1.0,
            pitch_lfo_frequency: 1.0,
        }
    }
}

/// Depth and frequency factors of the three voice LFOs, indexed amplitude, cutoff, pitch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LfoFactors {
    pub depth: [f32; 3],
    pub frequency: [f32; 3],
}

impl NoteOverrides {
    pub fn lfo_factors(&self) -> LfoFactors {
        LfoFactors {
            depth: [
                self.amp_lfo_depth,
                self.cutoff_lfo_depth,
                self.pitch_lfo_depth,
            ],
            frequency: [
                self.amp_lfo_frequency,
                self.cutoff_lfo_frequency,
                self.pitch_lfo_frequency,
            ],
        }
    }

    pub fn set_lfo_factors(&mut self, factors: LfoFactors) {
        [
            self.amp_lfo_depth,
            self.cutoff_lfo_depth,
            self.pitch_lfo_depth,
        ] = factors.depth;
        [
            self.amp_lfo_frequency,
            self.cutoff_lfo_frequency,
            self.pitch_lfo_frequency,
        ] = factors.frequency;
    }
}

/// One triggered key and the voices it owns, in layer order.
pub(crate) struct Note {
    pub(crate) channel: u8,
    /// The key as received.
    pub(crate) host_key: u8,
    /// The key voices are resolved for. Scripts may move it.
    pub(crate) key: u8,
    /// The event that created the note.
    pub(crate) cause: Event,
    pub(crate) velocity: u8,
    pub(crate) voices: Vec<Handle>,
    pub(crate) override_mask: u8,
    pub(crate) override_bits: u8,
    pub(crate) overrides: NoteOverrides,
    pub(crate) released: bool,
    /// Holds release-triggered voices, which never get released again.
    pub(crate) release_note: bool,
    /// Creation order across the engine.
    pub(crate) serial: u64,
}

impl Note {
    pub(crate) fn new() -> Note {
        Note {
            channel: 0,
            host_key: 0,
            key: 0,
            cause: Event {
                kind: super::event::EventKind::NoteOn {
                    key: 0,
                    velocity: 0,
                },
                channel: 0,
                frame_offset: 0,
            },
            velocity: 0,
            voices: Vec::with_capacity(MAX_VOICES_PER_NOTE),
            override_mask: 0,
            override_bits: 0,
            overrides: NoteOverrides::default(),
            released: false,
            release_note: false,
            serial: 0,
        }
    }

    /// Reinitializes a pooled note. Keeps the voice list's allocation.
    pub(crate) fn reset(&mut self, cause: Event, key: u8, velocity: u8, serial: u64) {
        self.channel = cause.channel;
        self.host_key = key;
        self.key = key;
        self.cause = cause;
        self.velocity = velocity;
        self.voices.clear();
        self.override_mask = 0;
        self.override_bits = 0;
        self.overrides = NoteOverrides::default();
        self.released = false;
        self.release_note = false;
        self.serial = serial;
    }

    /// The dimension region index after applying this note's override, if any.
    pub(crate) fn resolve_index(&self, index: u8) -> u8 {
        if self.override_mask == 0 {
            index
        } else {
            apply_dimension_override(index, self.override_mask, self.override_bits)
        }
    }
}

/// Runs on the render thread for every note-on, before the note's voices exist.
/// Implementations must not block or allocate.
pub trait NoteScript: Send {
    fn note_on(&mut self, note: &mut ScriptNote<'_>);
}

/// A script's view of a new note.
pub struct ScriptNote<'a> {
    note: &'a mut Note,
    region: Option<&'a Region>,
}

impl<'a> ScriptNote<'a> {
    pub(crate) fn new(note: &'a mut Note, region: Option<&'a Region>) -> ScriptNote<'a> {
        ScriptNote { note, region }
    }

    pub fn channel(&self) -> u8 {
        self.note.channel
    }

    pub fn key(&self) -> u8 {
        self.note.key
    }

    pub fn velocity(&self) -> u8 {
        self.note.velocity
    }

    /// Plays the note as if `key` had been pressed. The original key still owns it.
    pub fn set_key(&mut self, key: u8) {
        self.note.key = key.min(127);
    }

    pub fn overrides(&self) -> &NoteOverrides {
        &self.note.overrides
    }

    pub fn overrides_mut(&mut self) -> &mut NoteOverrides {
        &mut self.note.overrides
    }

    /// Forces the index bits under `mask` to `bits`.
    pub fn set_dimension_override(&mut self, mask: u8, bits: u8) {
        self.note.override_mask = mask;
        self.note.override_bits = bits & mask;
    }

    /// Forces `kind` onto `zone` in the region the note's key hits. Returns false if
    /// that region has no such dimension.
    pub fn set_dimension_zone(&mut self, kind: DimensionKind, zone: u32) -> bool {
        let Some((mask, bits)) = self.region.and_then(|region| region.zone_override(kind, zone))
        else {
            return false;
        };
        self.note.override_mask |= mask;
        self.note.override_bits = (self.note.override_bits & !mask) | bits;
        true
    }
}
