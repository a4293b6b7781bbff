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
//! Turns one layer of a note into a running voice.
//!
//! Resolution walks the region's dimensions once, feeding each from the note, the
//! channel's controllers or one of the round robin counters, and indexes the flat
//! dimension region table with the result. Every failure means "no voice"; the
//! render thread never retries.

use rand::Rng;

use crate::diagnostics::Diagnostic;
use crate::instrument::{
    DimensionKind, EgController, EnvelopeParams, Instrument, RegionId, MAX_DIMENSIONS,
};
use crate::modulation::EgTimes;

use super::channel::{ChannelState, KeyGroupEvent};
use super::controllers::{ControllerTable, AFTERTOUCH_INDEX};
use super::note::{NoteOverrides, MAX_VOICES_PER_NOTE};
use super::pool::Handle;
use super::voice::{VoiceSetup, VoiceType};
use super::EngineCore;

const MIN_ATTACK_TIME: f32 = 0.0316;
const MIN_RELEASE_TIME: f32 = 0.014;

/// What to trigger and how.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TriggerRequest {
    pub(crate) note: Handle,
    pub(crate) layer: u32,
    /// Frame offset within the current cycle.
    pub(crate) offset: usize,
    pub(crate) release_trigger: bool,
    pub(crate) voice_stealing: bool,
    pub(crate) key_group_conflicts: bool,
    /// How long the key was held, in seconds. Only used for release triggers.
    pub(crate) note_length: f32,
}

/// Stage time factors from an envelope's controller.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Influence {
    attack: f32,
    decay: f32,
    release: f32,
}

fn controller_value(params: &EnvelopeParams, controllers: &ControllerTable, velocity: u8) -> f32 {
    let value = match params.controller {
        EgController::None => 0,
        EgController::ChannelAftertouch => controllers.get(AFTERTOUCH_INDEX),
        EgController::Velocity => velocity.min(127),
        EgController::ControlChange(controller) => controllers.get(controller as usize),
    };
    if params.controller_invert {
        (127 - value) as f32
    } else {
        value as f32
    }
}

fn scale(factor: f32, influence: u8, value: f32) -> f32 {
    if influence == 0 {
        1.0
    } else {
        1.0 + factor * (1u32 << influence.min(8)) as f32 * value
    }
}

fn amplitude_influence(params: &EnvelopeParams, value: f32) -> Influence {
    let attack = if params.attack < 1e-8 && (params.attack_influence == 0 || value <= 10.0) {
        // An authored zero attack stays zero.
        0.0
    } else if params.attack_influence == 0 {
        1.0
    } else {
        let shift = if params.attack_influence == 1 {
            1
        } else {
            1u32 << params.attack_influence.min(8)
        };
        1.0 + 0.031 * shift as f32 * value
    };
    Influence {
        attack,
        decay: scale(0.00775, params.decay_influence, value),
        release: scale(0.00775, params.release_influence, value),
    }
}

fn filter_influence(params: &EnvelopeParams, value: f32) -> Influence {
    Influence {
        attack: scale(0.00775, params.attack_influence, value),
        decay: scale(0.00775, params.decay_influence, value),
        release: scale(0.00775, params.release_influence, value),
    }
}

/// Per-stage script factors for one envelope.
#[derive(Debug, Clone, Copy)]
struct StageOverrides {
    attack: f32,
    decay: f32,
    sustain: f32,
    release: f32,
}

impl StageOverrides {
    fn amplitude(overrides: &NoteOverrides) -> StageOverrides {
        StageOverrides {
            attack: overrides.attack,
            decay: overrides.decay,
            sustain: overrides.sustain,
            release: overrides.release,
        }
    }

    fn filter(overrides: &NoteOverrides) -> StageOverrides {
        StageOverrides {
            attack: overrides.cutoff_attack,
            decay: overrides.cutoff_decay,
            sustain: overrides.cutoff_sustain,
            release: overrides.cutoff_release,
        }
    }
}

fn eg_times(
    params: &EnvelopeParams,
    influence: Influence,
    velocity_release: f32,
    hold: bool,
    stages: StageOverrides,
) -> EgTimes {
    let attack = if influence.attack == 0.0 {
        0.0
    } else {
        params.attack.max(MIN_ATTACK_TIME) * influence.attack * stages.attack
    };
    let sustain = (params.sustain as f32 * stages.sustain).clamp(0.0, 1000.0) as u16;
    EgTimes {
        pre_attack: params.pre_attack,
        attack,
        hold,
        decay1: params.decay1 * influence.decay * velocity_release * stages.decay,
        decay2: params.decay2 * influence.decay * velocity_release * stages.decay,
        infinite_sustain: params.infinite_sustain,
        sustain,
        release: (params.release * velocity_release).max(MIN_RELEASE_TIME)
            * influence.release
            * stages.release,
    }
}

impl EngineCore {
    /// Launches the voice for one layer of a note. Returns the new voice, or `None`
    /// when nothing should or could sound.
    pub(crate) fn trigger_voice(
        &mut self,
        channel: &mut ChannelState,
        instrument: &Instrument,
        suspended: &[RegionId],
        request: &TriggerRequest,
    ) -> Option<Handle> {
        let note = self.notes.get(request.note)?;
        if note.voices.len() >= MAX_VOICES_PER_NOTE {
            return None;
        }
        let (key, velocity, serial) = (note.key, note.velocity, note.serial);
        let overrides = note.overrides;

        let (region_index, region) = instrument.region_for_key(key)?;
        if suspended.contains(&region.id()) || region.layers() == 0 {
            return None;
        }

        if request.key_group_conflicts && request.layer == 0 && region.key_group() != 0 {
            let event = KeyGroupEvent {
                group: region.key_group(),
                offset: request.offset,
                serial,
            };
            if !channel.push_key_group_event(event) {
                self.diagnostics.report(Diagnostic::KeyGroupEventsDropped {
                    channel: channel.index,
                });
            }
        }

        let mut values = [0u32; MAX_DIMENSIONS];
        let mut voice_type = VoiceType::Normal;
        for (value, dimension) in values.iter_mut().zip(region.dimensions()) {
            let zones = dimension.zones() as u32;
            *value = match dimension.kind() {
                DimensionKind::Layer => request.layer,
                DimensionKind::Velocity => velocity as u32,
                DimensionKind::ChannelAftertouch => {
                    channel.controllers.get(AFTERTOUCH_INDEX) as u32
                }
                DimensionKind::ReleaseTrigger => {
                    if request.release_trigger {
                        voice_type = VoiceType::ReleaseTrigger;
                    } else if request.layer == 0 {
                        voice_type = VoiceType::ReleaseTriggerRequired;
                    }
                    request.release_trigger as u32
                }
                DimensionKind::Keyboard => (channel.keyboard_position * zones as f32) as u32,
                DimensionKind::RoundRobin => {
                    channel.region_round_robin[region.low_key() as usize] % zones
                }
                DimensionKind::RoundRobinKeyboard => channel.round_robin_keyboard % zones,
                DimensionKind::Random => self.rng.gen_range(0..zones),
                DimensionKind::SampleChannel | DimensionKind::SmartMidi => 0,
                kind => match kind.controller() {
                    Some(controller) => channel.controllers.get(controller as usize) as u32,
                    None => {
                        self.diagnostics
                            .report(Diagnostic::UnknownDimension { kind });
                        0
                    }
                },
            };
        }

        let index = note.resolve_index(region.dimension_region_index(&values));
        let dimension_region = region.dimension_region(index)?;
        let sample = dimension_region.sample()?;
        if sample.frames() == 0 {
            return None;
        }
        if request.release_trigger && voice_type != VoiceType::ReleaseTrigger {
            // The instrument changed between note-on and note-off.
            return None;
        }

        let handle = match self.voices.alloc() {
            Some((handle, _)) => handle,
            None => {
                let stolen = request.voice_stealing && self.steal_voice(request.note);
                match self.voices.alloc() {
                    Some((handle, _)) if stolen => handle,
                    _ => {
                        self.diagnostics.report(Diagnostic::VoicePoolExhausted {
                            channel: channel.index,
                            key,
                        });
                        return None;
                    }
                }
            }
        };

        let params = dimension_region.params();
        let velocity_release = dimension_region.velocity_release(velocity);
        let eg1_value = controller_value(&params.eg1, &channel.controllers, velocity);
        let eg2_value = controller_value(&params.eg2, &channel.controllers, velocity);
        let sample_loop = sample.sample_loop();
        let hold = params.eg1.hold && sample_loop.is_some();

        let mut volume = dimension_region.velocity_attenuation(velocity) * params.gain;
        if request.release_trigger {
            volume *= dimension_region.release_trigger_attenuation(request.note_length);
        }
        let semitones = key as f64 - params.unity_note as f64;
        let cents = semitones * 100.0 + params.fine_tune as f64;
        let pitch_base =
            2f64.powf(cents / 1200.0) * sample.sample_rate() as f64 / self.sample_rate as f64;

        let (head_frames, stream, truncated) = if sample.frames() > self.ram_cache_frames {
            match self.streams.order(sample, self.ram_cache_frames) {
                Some(stream) => (self.ram_cache_frames, Some(stream), false),
                None => {
                    self.diagnostics.report(Diagnostic::StreamPoolExhausted {
                        channel: channel.index,
                        key,
                    });
                    (self.ram_cache_frames, None, true)
                }
            }
        } else {
            (sample.frames(), None, false)
        };

        let setup = VoiceSetup {
            note: request.note,
            channel: channel.index,
            key,
            velocity,
            layer: request.layer,
            region: region_index,
            dimension_region: index,
            voice_type,
            key_group: region.key_group(),
            params,
            volume,
            pitch_base,
            eg1: eg_times(
                &params.eg1,
                amplitude_influence(&params.eg1, eg1_value),
                velocity_release,
                hold,
                StageOverrides::amplitude(&overrides),
            ),
            eg2: eg_times(
                &params.eg2,
                filter_influence(&params.eg2, eg2_value),
                velocity_release,
                false,
                StageOverrides::filter(&overrides),
            ),
            delay: request.offset,
            head_frames,
            stream,
            truncated,
            hold_until: sample_loop.filter(|_| hold).map(|sample_loop| sample_loop.start),
            controllers: &channel.controllers,
            lfo_factors: overrides.lfo_factors(),
        };
        let voice = self.voices.get_mut(handle)?;
        voice.launch(&setup);

        match self.notes.get_mut(request.note) {
            Some(note) => {
                note.voices.push(handle);
                Some(handle)
            }
            None => {
                self.release_voice(handle);
                None
            }
        }
    }

    /// Frees the oldest voice not belonging to `keep`, preferring voices that are
    /// already releasing. Returns false if there was nothing to steal.
    fn steal_voice(&mut self, keep: Handle) -> bool {
        let notes = &self.notes;
        let victim = self
            .voices
            .iter()
            .filter(|(_, voice)| voice.note != keep)
            .min_by_key(|(_, voice)| {
                let serial = notes.get(voice.note).map_or(0, |note| note.serial);
                (!voice.is_releasing(), serial)
            })
            .map(|(handle, voice)| (handle, voice.note));

        let Some((victim, note)) = victim else {
            return false;
        };
        if let Some(note) = self.notes.get_mut(note) {
            note.voices.retain(|voice| *voice != victim);
        }
        self.release_voice(victim);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(attack: f32) -> EnvelopeParams {
        EnvelopeParams {
            attack,
            decay1: 1.0,
            release: 0.5,
            ..Default::default()
        }
    }

    fn stages() -> StageOverrides {
        StageOverrides::amplitude(&NoteOverrides::default())
    }

    #[test]
    fn test_zero_attack_stays_zero() {
        let mut params = envelope(0.0);
        let influence = amplitude_influence(&params, 100.0);
        assert_eq!(influence.attack, 0.0);
        assert_eq!(eg_times(&params, influence, 1.0, false, stages()).attack, 0.0);

        // With influence, only a quiet controller keeps it at zero.
        params.attack_influence = 2;
        assert_eq!(amplitude_influence(&params, 5.0).attack, 0.0);
        let influence = amplitude_influence(&params, 100.0);
        assert!((influence.attack - (1.0 + 0.031 * 4.0 * 100.0)).abs() < 1e-3);
        let times = eg_times(&params, influence, 1.0, false, stages());
        assert!((times.attack - MIN_ATTACK_TIME * influence.attack).abs() < 1e-4);
    }

    #[test]
    fn test_influence_factors() {
        let mut params = envelope(0.2);
        params.attack_influence = 1;
        params.decay_influence = 3;
        let influence = amplitude_influence(&params, 127.0);
        assert!((influence.attack - (1.0 + 0.031 * 127.0)).abs() < 1e-3);
        assert!((influence.decay - (1.0 + 0.00775 * 8.0 * 127.0)).abs() < 1e-3);
        assert_eq!(influence.release, 1.0);

        let influence = filter_influence(&params, 127.0);
        assert!((influence.attack - (1.0 + 0.00775 * 2.0 * 127.0)).abs() < 1e-3);
    }

    #[test]
    fn test_velocity_release_and_overrides() {
        let params = envelope(0.2);
        let influence = amplitude_influence(&params, 0.0);
        let mut overrides = NoteOverrides::default();
        overrides.release = 2.0;
        overrides.sustain = 0.5;
        let times = eg_times(
            &params,
            influence,
            0.5,
            false,
            StageOverrides::amplitude(&overrides),
        );
        assert!((times.decay1 - 0.5).abs() < 1e-6);
        assert!((times.release - 0.5).abs() < 1e-6);
        assert_eq!(times.sustain, 500);
        assert!((times.attack - 0.2).abs() < 1e-6);

        // The release floor applies before influence and overrides.
        let short = EnvelopeParams {
            release: 0.001,
            ..Default::default()
        };
        let times = eg_times(&short, influence, 1.0, false, stages());
        assert!((times.release - MIN_RELEASE_TIME).abs() < 1e-6);
    }

    #[test]
    fn test_inverted_controller() {
        let mut controllers = ControllerTable::new();
        controllers.set(AFTERTOUCH_INDEX, 27);
        let params = EnvelopeParams {
            controller: EgController::ChannelAftertouch,
            controller_invert: true,
            ..Default::default()
        };
        assert_eq!(controller_value(&params, &controllers, 64), 100.0);

        let params = EnvelopeParams {
            controller: EgController::Velocity,
            ..Default::default()
        };
        assert_eq!(controller_value(&params, &controllers, 64), 64.0);
    }
}
