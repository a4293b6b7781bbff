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
//! Pan law and the voice filter.

use std::f32::consts::{FRAC_PI_2, PI};

const PAN_ENTRIES: usize = 129;

const MIN_CUTOFF_HZ: f32 = 100.0;
const MAX_CUTOFF_HZ: f32 = 10_000.0;

/// Equal-power pan gains for positions 0 (left) to 128 (right).
pub struct PanTable {
    left: [f32; PAN_ENTRIES],
    right: [f32; PAN_ENTRIES],
}

impl PanTable {
    pub fn new() -> PanTable {
        let mut left = [0.0; PAN_ENTRIES];
        let mut right = [0.0; PAN_ENTRIES];
        for position in 0..PAN_ENTRIES {
            let angle = position as f32 / (PAN_ENTRIES - 1) as f32 * FRAC_PI_2;
            left[position] = angle.cos();
            right[position] = angle.sin();
        }
        PanTable { left, right }
    }

    /// Gains for a position, clamped to the table.
    pub fn gains(&self, position: i32) -> (f32, f32) {
        let position = position.clamp(0, PAN_ENTRIES as i32 - 1) as usize;
        (self.left[position], self.right[position])
    }
}

impl Default for PanTable {
    fn default() -> Self {
        PanTable::new()
    }
}

/// Combines the channel pan (0..=127) with a dimension region's pan offset.
/// -64 and 63 widen the channel pan around the centre instead of offsetting it.
pub fn pan_position(channel_pan: u8, region_pan: i8) -> i32 {
    let channel_pan = channel_pan.min(127) as i32;
    let position = match region_pan {
        -64 => channel_pan * 2 - 127,
        63 => channel_pan * 2,
        pan => channel_pan + pan as i32,
    };
    position.clamp(0, 127)
}

/// Maps a normalized cutoff in 0..=1 to Hz.
pub fn cutoff_hz(normalized: f32) -> f32 {
    MIN_CUTOFF_HZ * (MAX_CUTOFF_HZ / MIN_CUTOFF_HZ).powf(normalized.clamp(0.0, 1.0))
}

/// Two-pole state variable low-pass, trapezoidal integration, one per stereo side.
#[derive(Debug, Clone, Default)]
pub struct LowPassFilter {
    a1: f32,
    a2: f32,
    a3: f32,
    state: [[f32; 2]; 2],
}

impl LowPassFilter {
    /// Recomputes coefficients. `resonance` is in 0..=1.
    pub fn set(&mut self, cutoff_hz: f32, resonance: f32, sample_rate: f32) {
        let cutoff = cutoff_hz.clamp(1.0, sample_rate * 0.49);
        let g = (PI * cutoff / sample_rate).tan();
        let k = 2.0 - 1.95 * resonance.clamp(0.0, 1.0);
        self.a1 = 1.0 / (1.0 + g * (g + k));
        self.a2 = g * self.a1;
        self.a3 = g * self.a2;
    }

    pub fn reset(&mut self) {
        self.state = [[0.0; 2]; 2];
    }

    #[inline]
    pub fn process(&mut self, side: usize, input: f32) -> f32 {
        let [ic1, ic2] = &mut self.state[side & 1];
        let v3 = input - *ic2;
        let v1 = self.a1 * *ic1 + self.a2 * v3;
        let v2 = *ic2 + self.a2 * *ic1 + self.a3 * v3;
        *ic1 = 2.0 * v1 - *ic1;
        *ic2 = 2.0 * v2 - *ic2;
        v2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_power() {
        let table = PanTable::new();
        let (left, right) = table.gains(64);
        assert!((left * left + right * right - 1.0).abs() < 1e-5);
        assert_eq!(table.gains(0), (1.0, 0.0));
        assert!(table.gains(500).0.abs() < 1e-6);
    }

    #[test]
    fn test_pan_special_cases() {
        assert_eq!(pan_position(64, 0), 64);
        assert_eq!(pan_position(64, -20), 44);
        assert_eq!(pan_position(80, -64), 33);
        assert_eq!(pan_position(80, 63), 127);
        assert_eq!(pan_position(10, -64), 0);
    }

    #[test]
    fn test_cutoff_range() {
        assert_eq!(cutoff_hz(0.0), 100.0);
        assert!((cutoff_hz(1.0) - 10_000.0).abs() < 0.5);
        assert!((cutoff_hz(0.5) - 1000.0).abs() < 0.5);
    }

    #[test]
    fn test_low_pass_attenuates_highs() {
        let rate = 44100.0;
        let mut filter = LowPassFilter::default();
        filter.set(200.0, 0.0, rate);

        // DC passes.
        let mut out = 0.0;
        for _ in 0..20_000 {
            out = filter.process(0, 1.0);
        }
        assert!((out - 1.0).abs() < 0.01);

        // Nyquist-rate alternation is crushed.
        filter.reset();
        let mut peak: f32 = 0.0;
        for i in 0..20_000 {
            let input = if i % 2 == 0 { 1.0 } else { -1.0 };
            let out = filter.process(1, input);
            if i > 10_000 {
                peak = peak.max(out.abs());
            }
        }
        assert!(peak < 0.01);
    }
}
