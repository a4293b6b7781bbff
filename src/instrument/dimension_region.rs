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
//! Leaf playback configuration: the sample plus its envelope, LFO and filter settings.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::Sample;

/// A fully resolved playback configuration. Immutable once the instrument is built.
#[derive(Debug, Clone, Default)]
pub struct DimensionRegion {
    sample: Option<Arc<Sample>>,
    params: DimensionParams,
}

impl DimensionRegion {
    pub fn new(sample: Option<Arc<Sample>>, params: DimensionParams) -> DimensionRegion {
        DimensionRegion { sample, params }
    }

    /// The sample played by this dimension region.
    pub fn sample(&self) -> Option<&Arc<Sample>> {
        self.sample.as_ref()
    }

    pub fn params(&self) -> &DimensionParams {
        &self.params
    }

    /// Velocity attenuation as a gain factor in 0..=1.
    pub fn velocity_attenuation(&self, velocity: u8) -> f32 {
        self.params
            .velocity_curve
            .attenuation(velocity, self.params.velocity_depth)
    }

    /// Release-time scaling derived from velocity. Values below 1 shorten decay and
    /// release; soft notes release faster as the depth grows.
    pub fn velocity_release(&self, velocity: u8) -> f32 {
        let depth = self.params.release_velocity_depth as f32;
        if depth == 0.0 {
            return 1.0;
        }
        let softness = 1.0 - velocity.min(127) as f32 / 127.0;
        1.0 / (1.0 + depth * softness)
    }

    /// Gain applied to release-triggered voices after a note was held for `seconds`.
    pub fn release_trigger_attenuation(&self, seconds: f32) -> f32 {
        if self.params.release_trigger_decay == 0 {
            return 1.0;
        }
        let decay = 0.01053 * (256u32 >> self.params.release_trigger_decay.min(8)) as f32;
        (1.0 - decay * seconds).max(0.0)
    }
}

/// The numeric parameters of a dimension region, as authored.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DimensionParams {
    /// The key at which the sample plays at its recorded pitch.
    pub unity_note: u8,
    /// Fine tuning in cents.
    pub fine_tune: i16,
    /// Pan offset from -64 (left) to 63 (right).
    pub pan: i8,
    /// Overall gain factor.
    pub gain: f32,
    pub velocity_curve: VelocityCurve,
    /// Curve steepness, 0..=4.
    pub velocity_depth: u8,
    /// Velocity influence on decay and release times, 0 disables it.
    pub release_velocity_depth: u8,
    /// Attenuation of release-triggered voices by note length, 0 disables it.
    pub release_trigger_decay: u8,
    /// Amplitude envelope.
    pub eg1: EnvelopeParams,
    /// Filter cutoff envelope.
    pub eg2: EnvelopeParams,
    /// Amplitude LFO.
    pub lfo1: LfoParams,
    /// Cutoff LFO.
    pub lfo2: LfoParams,
    /// Pitch LFO.
    pub lfo3: LfoParams,
    pub filter: FilterParams,
}

impl Default for DimensionParams {
    fn default() -> Self {
        DimensionParams {
            unity_note: 60,
            fine_tune: 0,
            pan: 0,
            gain: 1.0,
            velocity_curve: VelocityCurve::NonLinear,
            velocity_depth: 2,
            release_velocity_depth: 0,
            release_trigger_decay: 0,
            eg1: EnvelopeParams::default(),
            eg2: EnvelopeParams::default(),
            lfo1: LfoParams::default(),
            lfo2: LfoParams::default(),
            lfo3: LfoParams::default(),
            filter: FilterParams::default(),
        }
    }
}

/// Shape of the velocity to gain mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VelocityCurve {
    Linear,
    NonLinear,
    Special,
}

impl VelocityCurve {
    /// Gain for `velocity` at the given curve depth.
    pub fn attenuation(self, velocity: u8, depth: u8) -> f32 {
        let v = velocity.min(127) as f32 / 127.0;
        let depth = depth.min(4) as f32;
        match self {
            VelocityCurve::Linear => 1.0 - (depth / 4.0) * (1.0 - v),
            VelocityCurve::NonLinear => v.powf(1.0 + depth * 0.5),
            // Soft notes stay near full level, loud notes compress towards 1.
            VelocityCurve::Special => 1.0 - (1.0 - v).powf(1.0 + depth),
        }
    }
}

/// The controller that scales an envelope's stage times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EgController {
    #[default]
    None,
    ChannelAftertouch,
    Velocity,
    ControlChange(u8),
}

/// Which stages a release may interrupt. A stage that may not be interrupted
/// postpones the release until it ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EgCancel {
    pub attack: bool,
    pub attack_hold: bool,
    pub decay1: bool,
    pub decay2: bool,
    pub release: bool,
}

impl Default for EgCancel {
    fn default() -> Self {
        EgCancel {
            attack: true,
            attack_hold: true,
            decay1: true,
            decay2: true,
            release: true,
        }
    }
}

/// Envelope generator parameters. Times are in seconds, levels in permille.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvelopeParams {
    pub pre_attack: u16,
    pub attack: f32,
    pub hold: bool,
    pub decay1: f32,
    pub decay2: f32,
    pub infinite_sustain: bool,
    pub sustain: u16,
    pub release: f32,
    pub controller: EgController,
    pub controller_invert: bool,
    pub attack_influence: u8,
    pub decay_influence: u8,
    pub release_influence: u8,
    pub cancel: EgCancel,
}

impl Default for EnvelopeParams {
    fn default() -> Self {
        EnvelopeParams {
            pre_attack: 0,
            attack: 0.0,
            hold: false,
            decay1: 0.0,
            decay2: 0.0,
            infinite_sustain: true,
            sustain: 1000,
            release: 0.3,
            controller: EgController::None,
            controller_invert: false,
            attack_influence: 0,
            decay_influence: 0,
            release_influence: 0,
            cancel: EgCancel::default(),
        }
    }
}

/// Where an LFO's depth comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LfoSource {
    #[default]
    Internal,
    ModWheel,
    Breath,
    Foot,
    ChannelAftertouch,
    InternalModWheel,
    InternalBreath,
    InternalFoot,
    InternalAftertouch,
}

impl LfoSource {
    /// Controller table index of the external controller, if any.
    pub fn external_controller(self) -> Option<usize> {
        use LfoSource::*;
        match self {
            Internal => None,
            ModWheel | InternalModWheel => Some(1),
            Breath | InternalBreath => Some(2),
            Foot | InternalFoot => Some(4),
            ChannelAftertouch | InternalAftertouch => Some(crate::engine::AFTERTOUCH_INDEX),
        }
    }

    /// Whether the internal depth contributes.
    pub fn uses_internal(self) -> bool {
        use LfoSource::*;
        matches!(
            self,
            Internal | InternalModWheel | InternalBreath | InternalFoot | InternalAftertouch
        )
    }
}

/// LFO parameters. Depths are in the 0..=1200 range.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LfoParams {
    pub frequency: f32,
    pub internal_depth: u16,
    pub control_depth: u16,
    pub flip_phase: bool,
    pub source: LfoSource,
}

impl LfoParams {
    /// Whether the LFO has any depth to contribute.
    pub fn enabled(&self) -> bool {
        (self.source.uses_internal() && self.internal_depth > 0)
            || (self.source.external_controller().is_some() && self.control_depth > 0)
    }
}

impl Default for LfoParams {
    fn default() -> Self {
        LfoParams {
            frequency: 1.0,
            internal_depth: 0,
            control_depth: 0,
            flip_phase: false,
            source: LfoSource::Internal,
        }
    }
}

/// Low-pass filter parameters on the 0..=127 scale.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FilterParams {
    pub enabled: bool,
    pub cutoff: u8,
    pub resonance: u8,
    /// Controller table index driving the cutoff instead of `cutoff`.
    pub cutoff_controller: Option<u8>,
    pub cutoff_controller_invert: bool,
    /// Lowest controller value accepted when a cutoff controller is set.
    pub minimum_cutoff: u8,
    /// How much soft velocities close the filter, 0..=1.
    pub velocity_sensitivity: f32,
    pub keyboard_tracking: bool,
    pub keyboard_tracking_breakpoint: u8,
}

impl Default for FilterParams {
    fn default() -> Self {
        FilterParams {
            enabled: false,
            cutoff: 127,
            resonance: 0,
            cutoff_controller: None,
            cutoff_controller_invert: false,
            minimum_cutoff: 0,
            velocity_sensitivity: 0.0,
            keyboard_tracking: false,
            keyboard_tracking_breakpoint: 60,
        }
    }
}
