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

/// Controller table slot holding channel aftertouch.
pub const AFTERTOUCH_INDEX: usize = 128;
/// Controller table slot holding the upper seven bits of the pitch bend, centre 64.
pub const PITCH_BEND_INDEX: usize = 129;
pub const CONTROLLER_COUNT: usize = 130;

pub const SUSTAIN_PEDAL: u8 = 64;

/// Latest controller values of one channel.
#[derive(Debug, Clone)]
pub struct ControllerTable {
    values: [u8; CONTROLLER_COUNT],
    pitch_bend: i16,
    poly_pressure: [u8; 128],
}

impl ControllerTable {
    pub fn new() -> ControllerTable {
        let mut values = [0u8; CONTROLLER_COUNT];
        values[PITCH_BEND_INDEX] = 64;
        ControllerTable {
            values,
            pitch_bend: 0,
            poly_pressure: [0u8; 128],
        }
    }

    /// Value of a controller slot, 0 for slots out of range.
    pub fn get(&self, index: usize) -> u8 {
        self.values.get(index).copied().unwrap_or(0)
    }

    pub fn set(&mut self, index: usize, value: u8) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value.min(127);
        }
    }

    pub fn pitch_bend(&self) -> i16 {
        self.pitch_bend
    }

    pub fn set_pitch_bend(&mut self, value: i16) {
        self.pitch_bend = value.clamp(-8192, 8191);
        self.values[PITCH_BEND_INDEX] = ((self.pitch_bend as i32 + 8192) >> 7) as u8;
    }

    /// Pitch bend in cents, assuming a bend range of two semitones.
    pub fn pitch_bend_cents(&self) -> f32 {
        self.pitch_bend as f32 / 8192.0 * 200.0
    }

    pub fn poly_pressure(&self, key: u8) -> u8 {
        self.poly_pressure[(key & 0x7f) as usize]
    }

    pub fn set_poly_pressure(&mut self, key: u8, value: u8) {
        self.poly_pressure[(key & 0x7f) as usize] = value.min(127);
    }

    pub fn sustain_pedal(&self) -> bool {
        self.get(SUSTAIN_PEDAL as usize) >= 64
    }
}

impl Default for ControllerTable {
    fn default() -> Self {
        ControllerTable::new()
    }
}
