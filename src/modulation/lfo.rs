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
//! Triangle LFO computed with wrapping integer phase arithmetic.

/// Whether the LFO swings around zero or above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LfoRange {
    /// Output in `0..=max`.
    Unsigned,
    /// Output in `-max..=max`.
    Signed,
}

/// Where in its cycle the wave starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LfoStart {
    Max,
    Mid,
    Min,
}

#[derive(Debug, Clone)]
pub struct TriangleLfo {
    range: LfoRange,
    max: f32,
    update_rate: f32,

    frequency: f32,
    internal_depth: f32,
    ext_control_coeff: f32,
    ext_control_value: f32,
    script_depth_factor: f32,
    script_frequency_factor: f32,

    level: i32,
    step: i32,
    normalizer: f32,
    offset: f32,
}

impl TriangleLfo {
    /// Creates an LFO whose full depth (1200) maps to `max`.
    pub fn new(range: LfoRange, max: f32, update_rate: f32) -> TriangleLfo {
        TriangleLfo {
            range,
            max,
            update_rate: update_rate.max(1.0),
            frequency: 0.0,
            internal_depth: 0.0,
            ext_control_coeff: 0.0,
            ext_control_value: 0.0,
            script_depth_factor: 1.0,
            script_frequency_factor: 1.0,
            level: 0,
            step: 0,
            normalizer: 0.0,
            offset: 0.0,
        }
    }

    /// Restarts the wave. Depths are in the 0..=1200 range. Script factors reset to 1.
    pub fn trigger(
        &mut self,
        frequency: f32,
        start: LfoStart,
        internal_depth: u16,
        ext_control_depth: u16,
        flip_phase: bool,
    ) {
        self.frequency = frequency;
        self.internal_depth = internal_depth as f32 / 1200.0 * self.max;
        self.ext_control_coeff = ext_control_depth as f32 / 1200.0 / 127.0 * self.max;
        self.script_depth_factor = 1.0;
        self.script_frequency_factor = 1.0;
        if self.range == LfoRange::Unsigned {
            self.internal_depth *= 2.0;
            self.ext_control_coeff *= 2.0;
        }

        self.step = self.step_for_frequency();
        let limit = u32::MAX;
        self.level = match start {
            LfoStart::Max => {
                if flip_phase {
                    0
                } else {
                    (limit >> 1) as i32
                }
            }
            LfoStart::Mid => {
                if flip_phase {
                    self.step = self.step.wrapping_neg();
                }
                (limit >> 2) as i32
            }
            LfoStart::Min => {
                if flip_phase {
                    (limit >> 1) as i32
                } else {
                    0
                }
            }
        };
        self.update_by_controller(self.ext_control_value as u8);
    }

    /// Applies a new external controller value (0..=127).
    pub fn update_by_controller(&mut self, value: u8) {
        self.ext_control_value = value.min(127) as f32;
        let max = (self.internal_depth + self.ext_control_value * self.ext_control_coeff)
            * self.script_depth_factor;
        match self.range {
            LfoRange::Unsigned => {
                self.normalizer = max / u32::MAX as f32;
                self.offset = 0.0;
            }
            LfoRange::Signed => {
                self.normalizer = max / u32::MAX as f32 * 4.0;
                self.offset = -max;
            }
        }
    }

    pub fn set_script_depth_factor(&mut self, factor: f32) {
        self.script_depth_factor = factor;
        self.update_by_controller(self.ext_control_value as u8);
    }

    pub fn set_script_frequency_factor(&mut self, factor: f32) {
        let negative = self.step < 0;
        self.script_frequency_factor = factor;
        self.step = self.step_for_frequency();
        if negative {
            self.step = self.step.wrapping_neg();
        }
    }

    /// Advances one update step and returns the new value.
    #[inline]
    pub fn render(&mut self) -> f32 {
        self.level = self.level.wrapping_add(self.step);
        self.normalizer * self.level.unsigned_abs() as f32 + self.offset
    }

    fn step_for_frequency(&self) -> i32 {
        let ratio = self.frequency * self.script_frequency_factor / self.update_rate;
        (u32::MAX as f32 * ratio) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f32 = 1000.0;

    fn collect(lfo: &mut TriangleLfo, steps: usize) -> Vec<f32> {
        (0..steps).map(|_| lfo.render()).collect()
    }

    #[test]
    fn test_unsigned_range() {
        let mut lfo = TriangleLfo::new(LfoRange::Unsigned, 1.0, RATE);
        lfo.trigger(10.0, LfoStart::Min, 600, 0, false);
        let values = collect(&mut lfo, 200);

        let max = values.iter().cloned().fold(f32::MIN, f32::max);
        let min = values.iter().cloned().fold(f32::MAX, f32::min);
        // Half of the full depth.
        assert!((max - 0.5).abs() < 0.02, "max was {}", max);
        assert!(min >= 0.0 && min < 0.02, "min was {}", min);
        assert!(values[0] < 0.05);
    }

    #[test]
    fn test_signed_range_starts_mid() {
        let mut lfo = TriangleLfo::new(LfoRange::Signed, 1200.0, RATE);
        lfo.trigger(5.0, LfoStart::Mid, 1200, 0, false);
        let values = collect(&mut lfo, 400);

        assert!(values[0].abs() < 30.0, "first was {}", values[0]);
        let max = values.iter().cloned().fold(f32::MIN, f32::max);
        let min = values.iter().cloned().fold(f32::MAX, f32::min);
        assert!((max - 1200.0).abs() < 30.0);
        assert!((min + 1200.0).abs() < 30.0);
    }

    #[test]
    fn test_flip_phase_reverses_direction() {
        let mut up = TriangleLfo::new(LfoRange::Signed, 1200.0, RATE);
        let mut down = TriangleLfo::new(LfoRange::Signed, 1200.0, RATE);
        up.trigger(5.0, LfoStart::Mid, 1200, 0, false);
        down.trigger(5.0, LfoStart::Mid, 1200, 0, true);
        assert!(up.render() > 0.0);
        assert!(down.render() < 0.0);
    }

    #[test]
    fn test_controller_depth() {
        let mut lfo = TriangleLfo::new(LfoRange::Unsigned, 1.0, RATE);
        lfo.trigger(10.0, LfoStart::Max, 0, 1200, false);
        lfo.update_by_controller(0);
        assert!(collect(&mut lfo, 100).iter().all(|value| *value == 0.0));

        lfo.update_by_controller(127);
        let max = collect(&mut lfo, 200)
            .iter()
            .cloned()
            .fold(f32::MIN, f32::max);
        assert!(max > 0.95, "max was {}", max);
    }

    #[test]
    fn test_script_factors() {
        let mut lfo = TriangleLfo::new(LfoRange::Unsigned, 1.0, RATE);
        lfo.trigger(10.0, LfoStart::Min, 600, 0, false);
        lfo.set_script_depth_factor(0.5);
        let max = collect(&mut lfo, 200)
            .iter()
            .cloned()
            .fold(f32::MIN, f32::max);
        assert!((max - 0.25).abs() < 0.02);

        // Doubling the frequency halves the time to the first peak.
        let mut slow = TriangleLfo::new(LfoRange::Unsigned, 1.0, RATE);
        let mut fast = TriangleLfo::new(LfoRange::Unsigned, 1.0, RATE);
        slow.trigger(10.0, LfoStart::Min, 1200, 0, false);
        fast.trigger(10.0, LfoStart::Min, 1200, 0, false);
        fast.set_script_frequency_factor(2.0);
        let peak = |values: Vec<f32>| {
            values
                .iter()
                .enumerate()
                .fold((0, f32::MIN), |best, (i, v)| if *v > best.1 { (i, *v) } else { best })
                .0
        };
        let slow_peak = peak(collect(&mut slow, 100));
        let fast_peak = peak(collect(&mut fast, 100));
        assert!((slow_peak as i32 - 2 * fast_peak as i32).abs() <= 2);
    }
}
