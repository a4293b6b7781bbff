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
//! Multi-stage envelope generator.
//!
//! Decay1 and release both consist of a linear part down to a quarter of full
//! volume followed by an exponential part. Levels are relative to the voice volume
//! the envelope was triggered with, so the switch happens at the same absolute
//! amplitude regardless of velocity.

use crate::instrument::EgCancel;

/// Level below which the envelope counts as silent.
const EG_BOTTOM: f32 = 0.001;

/// Shortest release, and the duration of a forced fade-out, in seconds.
const MIN_RELEASE_TIME: f32 = 0.0025;

/// Attack is measured shorter than authored; this is the observed ratio.
const ATTACK_TIME_SCALE: f32 = 0.655;
const MIN_ATTACK_TIME: f32 = 0.0316;
const MIN_DECAY2_TIME: f32 = 0.05;

/// Stages of the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgStage {
    Attack,
    AttackHold,
    Decay1Part1,
    Decay1Part2,
    Decay2,
    Sustain,
    ReleasePart1,
    ReleasePart2,
    FadeOut,
    End,
}

/// Events that move the envelope between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgEvent {
    StageEnd,
    Release,
    CancelRelease,
    HoldEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    End,
    Linear,
    Exponential,
}

/// Stage times for one trigger, already scaled by controller and velocity influence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EgTimes {
    /// Starting level in permille.
    pub pre_attack: u16,
    pub attack: f32,
    pub hold: bool,
    pub decay1: f32,
    pub decay2: f32,
    pub infinite_sustain: bool,
    /// Sustain level in permille.
    pub sustain: u16,
    pub release: f32,
}

/// An ADSR-style envelope running at the modulation update rate.
#[derive(Debug, Clone)]
pub struct EnvelopeGenerator {
    update_rate: f32,
    fade_out_coeff: f32,

    stage: EgStage,
    segment: Segment,
    level: f32,
    coeff: f32,
    offset: f32,
    steps_left: i32,

    cancel: EgCancel,
    postponed_release: bool,
    hold_attack: bool,
    infinite_sustain: bool,
    sustain_level: f32,
    decay1_time: f32,
    decay2_time: f32,
    decay1_slope: f32,
    decay1_level2: f32,

    inv_volume: f32,
    exp_offset: f32,
    release_slope: f32,
    release_coeff: f32,
    release_coeff2: f32,
    release_coeff3: f32,
    release_level2: f32,
}

impl EnvelopeGenerator {
    /// Creates an idle envelope updated `update_rate` times per second.
    pub fn new(update_rate: f32) -> EnvelopeGenerator {
        let update_rate = update_rate.max(1.0);
        EnvelopeGenerator {
            update_rate,
            fade_out_coeff: -1.0 / (MIN_RELEASE_TIME * update_rate),
            stage: EgStage::End,
            segment: Segment::End,
            level: 0.0,
            coeff: 0.0,
            offset: 0.0,
            steps_left: 0,
            cancel: EgCancel::default(),
            postponed_release: false,
            hold_attack: false,
            infinite_sustain: true,
            sustain_level: 1.0,
            decay1_time: 0.0,
            decay2_time: 0.0,
            decay1_slope: 0.0,
            decay1_level2: 0.25,
            inv_volume: 1.0,
            exp_offset: 0.0,
            release_slope: 0.0,
            release_coeff: 0.0,
            release_coeff2: 0.0,
            release_coeff3: 0.0,
            release_level2: 0.25,
        }
    }

    /// Sets which stages a release may interrupt.
    pub fn set_state_options(&mut self, cancel: EgCancel) {
        self.cancel = cancel;
    }

    /// Starts the envelope from its attack stage.
    pub fn trigger(&mut self, times: &EgTimes, volume: f32) {
        self.sustain_level = times.sustain.min(1000) as f32 / 1000.0;
        self.infinite_sustain = times.infinite_sustain;
        self.hold_attack = times.hold;
        self.decay1_time = times.decay1.max(0.0);
        self.decay2_time = times.decay2.max(0.0);

        self.inv_volume = 1.0 / volume.max(EG_BOTTOM);
        self.exp_offset = (0.25 - 1.0 / 3.55) * self.inv_volume;

        let release = times.release.max(MIN_RELEASE_TIME);
        let release_steps = (release * self.update_rate).floor().max(1.0);
        self.release_slope = -1.365 / release_steps;
        self.release_coeff = self.release_slope * self.inv_volume;
        self.release_slope *= 3.55;
        self.release_coeff2 = self.release_slope.exp();
        self.release_coeff3 = self.exp_offset * (1.0 - self.release_coeff2);
        self.release_level2 = 0.25 * self.inv_volume;

        self.postponed_release = false;
        self.enter_attack(times.pre_attack, times.attack);
    }

    /// Feeds an event into the stage machine.
    pub fn update(&mut self, event: EgEvent) {
        match self.stage {
            EgStage::End => return,
            EgStage::FadeOut => {
                if event == EgEvent::StageEnd {
                    self.enter_end();
                }
                return;
            }
            _ => {}
        }
        if event == EgEvent::HoldEnd {
            self.hold_attack = false;
        }

        match (self.stage, event) {
            (EgStage::Attack, EgEvent::Release) => self.release_or_postpone(self.cancel.attack),
            (EgStage::Attack, EgEvent::StageEnd) => {
                if self.postponed_release {
                    self.enter_next_stage_for_release();
                } else if self.hold_attack {
                    self.enter_attack_hold();
                } else {
                    self.enter_decay1_part1();
                }
            }

            (EgStage::AttackHold, EgEvent::StageEnd) => self.steps_left = i32::MAX,
            (EgStage::AttackHold, EgEvent::HoldEnd) => {
                if self.postponed_release {
                    self.enter_next_stage_for_release();
                } else {
                    self.enter_decay1_part1();
                }
            }
            (EgStage::AttackHold, EgEvent::Release) => {
                self.release_or_postpone(self.cancel.attack_hold)
            }

            (EgStage::Decay1Part1, EgEvent::StageEnd) => self.enter_decay1_part2(),
            (EgStage::Decay1Part1 | EgStage::Decay1Part2, EgEvent::Release) => {
                self.release_or_postpone(self.cancel.decay1)
            }
            (EgStage::Decay1Part2, EgEvent::StageEnd) => {
                if self.level < EG_BOTTOM {
                    self.enter_end();
                } else if self.postponed_release {
                    self.enter_next_stage_for_release();
                } else {
                    self.enter_after_decay1();
                }
            }

            (EgStage::Decay2, EgEvent::StageEnd) => self.enter_fade_out(None),
            (EgStage::Decay2, EgEvent::Release) => {
                if self.cancel.decay2 {
                    self.enter_release_part1();
                } else {
                    self.postponed_release = true;
                }
            }
            (EgStage::Decay2, EgEvent::HoldEnd) => {
                if self.postponed_release && self.cancel.decay1 {
                    self.enter_release_part1();
                } else {
                    self.enter_decay1_part1();
                }
            }

            (EgStage::Sustain, EgEvent::StageEnd) => self.steps_left = i32::MAX,
            (EgStage::Sustain, EgEvent::Release) => self.enter_release_part1(),
            (EgStage::Sustain, EgEvent::HoldEnd) => self.enter_decay1_part1(),

            (EgStage::ReleasePart1, EgEvent::StageEnd) => self.enter_release_part2(),
            (EgStage::ReleasePart2, EgEvent::StageEnd) => self.enter_fade_out(None),
            (EgStage::ReleasePart1 | EgStage::ReleasePart2, EgEvent::CancelRelease) => {
                if self.cancel.release {
                    self.enter_after_decay1();
                }
            }

            _ => {}
        }
    }

    /// Advances one update step and returns the new level.
    pub fn process(&mut self) -> f32 {
        if self.segment == Segment::End {
            return 0.0;
        }
        if self.steps_left <= 0 {
            self.update(EgEvent::StageEnd);
        }
        match self.segment {
            Segment::Linear => self.level += self.coeff,
            Segment::Exponential => self.level = self.level * self.coeff + self.offset,
            Segment::End => {}
        }
        self.steps_left = (self.steps_left - 1).max(0);
        self.level()
    }

    /// Ramps down to silence quickly, within `max_steps` updates if given.
    pub fn enter_fade_out(&mut self, max_steps: Option<i32>) {
        self.stage = EgStage::FadeOut;
        self.segment = Segment::Linear;
        self.steps_left = (self.level / -self.fade_out_coeff) as i32;
        self.coeff = self.fade_out_coeff;
        if let Some(max_steps) = max_steps {
            if self.steps_left > max_steps && max_steps > 0 {
                self.steps_left = max_steps;
                self.coeff = -self.level / max_steps as f32;
            }
        }
        if self.steps_left <= 0 {
            self.enter_end();
        }
    }

    /// The current level, never negative.
    pub fn level(&self) -> f32 {
        self.level.max(0.0)
    }

    pub fn stage(&self) -> EgStage {
        self.stage
    }

    /// Whether the envelope still produces output.
    pub fn is_active(&self) -> bool {
        self.segment != Segment::End
    }

    fn release_or_postpone(&mut self, cancel: bool) {
        if cancel {
            self.enter_next_stage_for_release();
        } else {
            self.postponed_release = true;
        }
    }

    /// Follows the release through any stage that may not be skipped.
    fn enter_next_stage_for_release(&mut self) {
        // Stages entered on the way still owe the release.
        self.postponed_release = true;
        let stage = self.stage;
        if stage == EgStage::Attack && self.hold_attack && !self.cancel.attack_hold {
            self.enter_attack_hold();
            return;
        }
        if matches!(stage, EgStage::Attack | EgStage::AttackHold) && !self.cancel.decay1 {
            self.enter_decay1_part1();
            return;
        }
        if matches!(
            stage,
            EgStage::Attack | EgStage::AttackHold | EgStage::Decay1Part1 | EgStage::Decay1Part2
        ) && !self.infinite_sustain
            && !self.cancel.decay2
        {
            self.enter_decay2();
            return;
        }
        self.enter_release_part1();
    }

    fn enter_after_decay1(&mut self) {
        if self.infinite_sustain {
            self.enter_sustain();
        } else {
            self.enter_decay2();
        }
    }

    fn enter_attack(&mut self, pre_attack: u16, attack: f32) {
        self.stage = EgStage::Attack;
        self.segment = Segment::Linear;

        if attack >= 1e-8 {
            let steps = (ATTACK_TIME_SCALE * attack.max(MIN_ATTACK_TIME) * self.update_rate) as i32;
            self.steps_left = steps.max(1);
            self.level = pre_attack.min(1000) as f32 / 1000.0;
            // The peak of a non-zero attack lands a bit below full level.
            self.coeff = 0.896 * (1.0 - self.level) / self.steps_left as f32;
        } else {
            self.level = 1.029;
            if self.hold_attack {
                self.enter_attack_hold();
            } else {
                self.enter_decay1_part1();
            }
        }
    }

    fn enter_attack_hold(&mut self) {
        self.stage = EgStage::AttackHold;
        self.segment = Segment::Linear;
        self.coeff = 0.0;
        self.steps_left = i32::MAX;
    }

    fn enter_decay1_part1(&mut self) {
        let steps = (self.decay1_time * self.update_rate) as i32;
        if steps > 0 && self.level > self.sustain_level {
            self.stage = EgStage::Decay1Part1;
            self.segment = Segment::Linear;
            self.decay1_slope = (1.347 * self.sustain_level - 1.361) / steps as f32;
            self.coeff = self.decay1_slope * self.inv_volume;
            self.decay1_level2 = 0.25 * self.inv_volume;
            self.steps_left =
                ((self.decay1_level2.max(self.sustain_level) - self.level) / self.coeff) as i32;
            if self.steps_left <= 0 {
                self.enter_decay1_part2();
            }
        } else if self.postponed_release {
            // Pretend decay1 already completed.
            self.stage = EgStage::Decay1Part2;
            self.enter_next_stage_for_release();
        } else {
            self.enter_after_decay1();
        }
    }

    fn enter_decay1_part2(&mut self) {
        if self.sustain_level < self.decay1_level2 {
            self.stage = EgStage::Decay1Part2;
            self.segment = Segment::Exponential;
            self.decay1_slope *= 3.55;
            self.coeff = self.decay1_slope.exp();
            self.offset = self.exp_offset * (1.0 - self.coeff);
            self.steps_left = (((self.sustain_level - self.exp_offset)
                / (self.level - self.exp_offset))
                .ln()
                / self.decay1_slope) as i32;
            if self.steps_left > 0 {
                return;
            }
        }
        if self.postponed_release {
            self.stage = EgStage::Decay1Part2;
            self.enter_next_stage_for_release();
        } else {
            self.enter_after_decay1();
        }
    }

    fn enter_decay2(&mut self) {
        self.stage = EgStage::Decay2;
        self.segment = Segment::Linear;
        self.decay2_time = self.decay2_time.max(MIN_DECAY2_TIME);
        let steps = ((self.decay2_time * self.update_rate) as i32).max(1);
        self.coeff = (-1.03 / steps as f32) * self.inv_volume;
        self.steps_left = ((EG_BOTTOM - self.level) / self.coeff) as i32;
        if self.steps_left <= 0 {
            self.enter_end();
        }
    }

    fn enter_sustain(&mut self) {
        self.stage = EgStage::Sustain;
        self.segment = Segment::Linear;
        self.coeff = 0.0;
        self.steps_left = i32::MAX;
        self.postponed_release = false;
    }

    fn enter_release_part1(&mut self) {
        self.stage = EgStage::ReleasePart1;
        self.segment = Segment::Linear;
        self.steps_left = ((self.release_level2 - self.level) / self.release_coeff) as i32;
        self.coeff = self.release_coeff;
        self.postponed_release = false;
        if self.steps_left <= 0 {
            self.enter_release_part2();
        }
    }

    fn enter_release_part2(&mut self) {
        self.stage = EgStage::ReleasePart2;
        self.segment = Segment::Exponential;
        self.steps_left = (((EG_BOTTOM - self.exp_offset) / (self.level - self.exp_offset)).ln()
            / self.release_slope) as i32;
        self.coeff = self.release_coeff2;
        self.offset = self.release_coeff3;
        if self.steps_left <= 0 {
            self.enter_fade_out(None);
        }
    }

    fn enter_end(&mut self) {
        self.stage = EgStage::End;
        self.segment = Segment::End;
        self.level = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modulation::update_rate;

    fn times() -> EgTimes {
        EgTimes {
            pre_attack: 0,
            attack: 0.0,
            hold: false,
            decay1: 0.0,
            decay2: 0.0,
            infinite_sustain: true,
            sustain: 1000,
            release: 0.3,
        }
    }

    fn run_until(eg: &mut EnvelopeGenerator, max_steps: usize, stop: impl Fn(&EnvelopeGenerator) -> bool) -> usize {
        for step in 0..max_steps {
            if stop(eg) {
                return step;
            }
            eg.process();
        }
        max_steps
    }

    #[test]
    fn test_attack_ramps_to_sustain() {
        let mut eg = EnvelopeGenerator::new(update_rate(44100));
        eg.trigger(
            &EgTimes {
                attack: 0.1,
                ..times()
            },
            1.0,
        );
        assert_eq!(eg.stage(), EgStage::Attack);

        let mut previous = eg.level();
        for _ in 0..90 {
            let level = eg.process();
            assert!(level > previous);
            previous = level;
        }
        assert!((eg.level() - 0.896).abs() < 1e-3);

        eg.process();
        assert_eq!(eg.stage(), EgStage::Sustain);
        assert!((eg.level() - 0.896).abs() < 1e-3);
    }

    #[test]
    fn test_release_reaches_end() {
        let mut eg = EnvelopeGenerator::new(update_rate(44100));
        eg.trigger(&times(), 1.0);
        assert_eq!(eg.stage(), EgStage::Sustain);
        assert!((eg.level() - 1.029).abs() < 1e-6);

        eg.update(EgEvent::Release);
        assert_eq!(eg.stage(), EgStage::ReleasePart1);

        let mut previous = eg.level();
        let steps = run_until(&mut eg, 2000, |eg| !eg.is_active());
        assert!(steps < 2000, "envelope never ended");
        assert_eq!(eg.level(), 0.0);
        assert_eq!(eg.stage(), EgStage::End);

        // A second run checks the curve only ever falls.
        eg.trigger(&times(), 1.0);
        eg.update(EgEvent::Release);
        while eg.is_active() {
            let level = eg.process();
            assert!(level <= previous + 1e-6);
            previous = level;
        }
    }

    #[test]
    fn test_decay1_settles_on_sustain_level() {
        let mut eg = EnvelopeGenerator::new(update_rate(44100));
        eg.trigger(
            &EgTimes {
                decay1: 0.5,
                sustain: 500,
                ..times()
            },
            1.0,
        );
        assert_eq!(eg.stage(), EgStage::Decay1Part1);

        let steps = run_until(&mut eg, 1000, |eg| eg.stage() == EgStage::Sustain);
        assert!(steps < 1000);
        assert!((eg.level() - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_finite_sustain_decays_to_end() {
        let mut eg = EnvelopeGenerator::new(update_rate(44100));
        eg.trigger(
            &EgTimes {
                infinite_sustain: false,
                decay2: 0.1,
                sustain: 500,
                ..times()
            },
            1.0,
        );
        assert_eq!(eg.stage(), EgStage::Decay2);
        let steps = run_until(&mut eg, 300, |eg| !eg.is_active());
        assert!(steps < 300);
    }

    #[test]
    fn test_release_postponed_by_attack() {
        let mut eg = EnvelopeGenerator::new(update_rate(44100));
        eg.set_state_options(EgCancel {
            attack: false,
            ..Default::default()
        });
        eg.trigger(
            &EgTimes {
                attack: 0.1,
                ..times()
            },
            1.0,
        );
        for _ in 0..10 {
            eg.process();
        }
        eg.update(EgEvent::Release);
        assert_eq!(eg.stage(), EgStage::Attack);

        let steps = run_until(&mut eg, 200, |eg| eg.stage() != EgStage::Attack);
        assert!(steps < 200);
        assert_eq!(eg.stage(), EgStage::ReleasePart1);
    }

    #[test]
    fn test_cancel_release_returns_to_sustain() {
        let mut eg = EnvelopeGenerator::new(update_rate(44100));
        eg.trigger(&times(), 1.0);
        eg.update(EgEvent::Release);
        eg.process();
        eg.update(EgEvent::CancelRelease);
        assert_eq!(eg.stage(), EgStage::Sustain);

        eg.set_state_options(EgCancel {
            release: false,
            ..Default::default()
        });
        eg.update(EgEvent::Release);
        eg.update(EgEvent::CancelRelease);
        assert_eq!(eg.stage(), EgStage::ReleasePart1);
    }

    #[test]
    fn test_hold_waits_for_hold_end() {
        let mut eg = EnvelopeGenerator::new(update_rate(44100));
        eg.trigger(
            &EgTimes {
                hold: true,
                ..times()
            },
            1.0,
        );
        assert_eq!(eg.stage(), EgStage::AttackHold);
        for _ in 0..100 {
            eg.process();
        }
        assert_eq!(eg.stage(), EgStage::AttackHold);
        eg.update(EgEvent::HoldEnd);
        assert_eq!(eg.stage(), EgStage::Sustain);
    }

    #[test]
    fn test_fade_out_respects_max_steps() {
        let mut eg = EnvelopeGenerator::new(update_rate(44100));
        eg.trigger(&times(), 1.0);
        eg.enter_fade_out(Some(2));
        assert_eq!(eg.stage(), EgStage::FadeOut);
        eg.process();
        eg.process();
        eg.process();
        assert!(!eg.is_active());
        assert_eq!(eg.level(), 0.0);
    }
}
