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
//! Rendering of a single voice.
//!
//! Modulators advance once per sub-fragment. Amplitude is interpolated linearly
//! across each sub-fragment so envelope steps do not click.

use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::instrument::{DimensionParams, FilterParams, Sample};
use crate::modulation::{
    EgEvent, EgStage, EgTimes, EnvelopeGenerator, LfoRange, LfoStart, TriangleLfo,
    SUBFRAGMENT_SIZE,
};
use crate::stream::{unrolled_frame, StreamId, StreamManager};

use super::controllers::ControllerTable;
use super::dsp::{cutoff_hz, pan_position, LowPassFilter, PanTable};
use super::note::{LfoFactors, NoteOverrides};
use super::pool::Handle;

/// Highest playback rate, four octaves above the sample's own pitch.
pub const MAX_PITCH: f64 = 16.0;

/// Pending commands a voice can hold for one cycle.
const MAX_VOICE_COMMANDS: usize = 8;

const AMP_LFO: usize = 0;
const CUTOFF_LFO: usize = 1;
const PITCH_LFO: usize = 2;

/// How a voice relates to release triggering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceType {
    Normal,
    /// Launched by a note-off.
    ReleaseTrigger,
    /// A note-on voice whose region can launch release voices later.
    ReleaseTriggerRequired,
}

/// A state change scheduled at a frame offset within the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VoiceCommand {
    Release,
    CancelRelease,
    /// Quick fade to silence, used for key group conflicts.
    FadeOut,
    /// Immediate silence.
    Kill,
}

/// A snapshot of a running voice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceInfo {
    pub channel: u8,
    pub key: u8,
    pub velocity: u8,
    pub layer: u32,
    pub voice_type: VoiceType,
    pub region: u16,
    pub dimension_region: u8,
    pub stage: EgStage,
    pub streaming: bool,
}

/// What a voice reads from its channel while rendering.
pub(crate) struct VoiceContext<'a> {
    pub(crate) controllers: &'a ControllerTable,
    pub(crate) channel_volume: f32,
    pub(crate) channel_pan: u8,
    pub(crate) pan_table: &'a PanTable,
    pub(crate) sample_rate: f32,
    pub(crate) overrides: NoteOverrides,
}

/// Everything the trigger resolved for a new voice.
pub(crate) struct VoiceSetup<'a> {
    pub(crate) note: Handle,
    pub(crate) channel: u8,
    pub(crate) key: u8,
    pub(crate) velocity: u8,
    pub(crate) layer: u32,
    pub(crate) region: u16,
    pub(crate) dimension_region: u8,
    pub(crate) voice_type: VoiceType,
    pub(crate) key_group: u32,
    pub(crate) params: &'a DimensionParams,
    pub(crate) volume: f32,
    pub(crate) pitch_base: f64,
    pub(crate) eg1: EgTimes,
    pub(crate) eg2: EgTimes,
    pub(crate) delay: usize,
    /// Unrolled frames served from memory.
    pub(crate) head_frames: usize,
    pub(crate) stream: Option<StreamId>,
    /// The sample needed a stream but none was free; playback stops at the head.
    pub(crate) truncated: bool,
    /// Frame at which a held attack ends, if the attack is held.
    pub(crate) hold_until: Option<usize>,
    pub(crate) controllers: &'a ControllerTable,
    pub(crate) lfo_factors: LfoFactors,
}

/// Reads sample frames from memory or, past the RAM head, from a disk stream.
struct SampleCursor {
    head: usize,
    stream: Option<StreamId>,
    limit: Option<usize>,
    next_stream_frame: usize,
    /// The two most recent stream frames with their unrolled numbers.
    recent: [(usize, (f32, f32)); 2],
    starved: usize,
}

impl SampleCursor {
    fn new() -> SampleCursor {
        SampleCursor {
            head: 0,
            stream: None,
            limit: None,
            next_stream_frame: 0,
            recent: [(usize::MAX, (0.0, 0.0)); 2],
            starved: 0,
        }
    }

    fn reset(&mut self, head: usize, stream: Option<StreamId>, truncated: bool) {
        self.head = head;
        self.stream = stream;
        self.limit = truncated.then_some(head);
        self.next_stream_frame = head;
        self.recent = [(usize::MAX, (0.0, 0.0)); 2];
        self.starved = 0;
    }

    /// Returns the frame at unrolled position `frame`, or `None` past the end.
    fn fetch(
        &mut self,
        frame: usize,
        sample: &Sample,
        streams: &mut StreamManager,
    ) -> Option<(f32, f32)> {
        if self.limit.is_some_and(|limit| frame >= limit) {
            return None;
        }
        let sample_frame = unrolled_frame(sample, frame)?;
        let stream = match self.stream {
            Some(stream) if frame >= self.head => stream,
            _ => return Some(sample.frame(sample_frame)),
        };

        if frame < self.next_stream_frame {
            return Some(
                self.recent
                    .iter()
                    .find(|(recent, _)| *recent == frame)
                    .map_or(self.recent[1].1, |(_, value)| *value),
            );
        }
        while self.next_stream_frame <= frame {
            match streams.read_frame(stream) {
                Some(value) => {
                    self.recent = [self.recent[1], (self.next_stream_frame, value)];
                    self.next_stream_frame += 1;
                }
                None if streams.is_eof(stream) => return None,
                None => {
                    self.starved += 1;
                    return Some((0.0, 0.0));
                }
            }
        }
        Some(self.recent[1].1)
    }
}

/// One rendering instance for one layer of a note.
pub(crate) struct Voice {
    pub(crate) note: Handle,
    pub(crate) channel: u8,
    pub(crate) key: u8,
    pub(crate) velocity: u8,
    pub(crate) layer: u32,
    pub(crate) region: u16,
    pub(crate) dimension_region: u8,
    pub(crate) voice_type: VoiceType,
    pub(crate) key_group: u32,

    eg1: EnvelopeGenerator,
    eg2: EnvelopeGenerator,
    lfos: [TriangleLfo; 3],
    lfo_enabled: [bool; 3],
    lfo_controllers: [Option<usize>; 3],

    /// Frames into the current cycle before the voice starts.
    delay: usize,
    commands: [(usize, VoiceCommand); MAX_VOICE_COMMANDS],
    command_count: usize,

    volume: f32,
    pitch_base: f64,
    pitch: f64,
    position: f64,
    amplitude: f32,
    amplitude_step: f32,
    subfragment_left: usize,
    pan: (f32, f32),
    region_pan: i8,
    hold_until: Option<usize>,

    filter: LowPassFilter,
    filter_params: FilterParams,

    cursor: SampleCursor,
    /// The envelope has ended; the voice finishes with the current sub-fragment.
    ending: bool,
    finished: bool,
}

impl Voice {
    /// Creates an idle voice for the pool.
    pub(crate) fn new(update_rate: f32) -> Voice {
        Voice {
            note: Handle::default(),
            channel: 0,
            key: 0,
            velocity: 0,
            layer: 0,
            region: 0,
            dimension_region: 0,
            voice_type: VoiceType::Normal,
            key_group: 0,
            eg1: EnvelopeGenerator::new(update_rate),
            eg2: EnvelopeGenerator::new(update_rate),
            lfos: [
                TriangleLfo::new(LfoRange::Unsigned, 1.0, update_rate),
                TriangleLfo::new(LfoRange::Unsigned, 1.0, update_rate),
                TriangleLfo::new(LfoRange::Signed, 1200.0, update_rate),
            ],
            lfo_enabled: [false; 3],
            lfo_controllers: [None; 3],
            delay: 0,
            commands: [(0, VoiceCommand::Kill); MAX_VOICE_COMMANDS],
            command_count: 0,
            volume: 0.0,
            pitch_base: 1.0,
            pitch: 1.0,
            position: 0.0,
            amplitude: 0.0,
            amplitude_step: 0.0,
            subfragment_left: 0,
            pan: (0.0, 0.0),
            region_pan: 0,
            hold_until: None,
            filter: LowPassFilter::default(),
            filter_params: FilterParams::default(),
            cursor: SampleCursor::new(),
            ending: false,
            finished: true,
        }
    }

    /// Starts the voice from its resolved setup.
    pub(crate) fn launch(&mut self, setup: &VoiceSetup<'_>) {
        self.note = setup.note;
        self.channel = setup.channel;
        self.key = setup.key;
        self.velocity = setup.velocity;
        self.layer = setup.layer;
        self.region = setup.region;
        self.dimension_region = setup.dimension_region;
        self.voice_type = setup.voice_type;
        self.key_group = setup.key_group;

        let params = setup.params;
        self.eg1.set_state_options(params.eg1.cancel);
        self.eg1.trigger(&setup.eg1, setup.volume);
        self.eg2.set_state_options(params.eg2.cancel);
        self.eg2.trigger(&setup.eg2, 1.0);
        self.trigger_lfos(params, setup.controllers, setup.lfo_factors);

        self.delay = setup.delay;
        self.command_count = 0;
        self.volume = setup.volume;
        self.pitch_base = setup.pitch_base;
        self.pitch = setup.pitch_base.min(MAX_PITCH);
        self.position = 0.0;
        self.amplitude = 0.0;
        self.amplitude_step = 0.0;
        self.subfragment_left = 0;
        self.region_pan = params.pan;
        self.hold_until = setup.hold_until;
        self.filter.reset();
        self.filter_params = params.filter;
        self.cursor
            .reset(setup.head_frames, setup.stream, setup.truncated);
        self.ending = false;
        self.finished = false;
    }

    fn trigger_lfos(
        &mut self,
        params: &DimensionParams,
        controllers: &ControllerTable,
        factors: LfoFactors,
    ) {
        let settings = [params.lfo1, params.lfo2, params.lfo3];
        let starts = [LfoStart::Min, LfoStart::Max, LfoStart::Mid];
        for (index, lfo) in self.lfos.iter_mut().enumerate() {
            let lfo_params = settings[index];
            let controller = lfo_params.source.external_controller();
            self.lfo_enabled[index] = lfo_params.enabled();
            self.lfo_controllers[index] = controller;
            if !self.lfo_enabled[index] {
                continue;
            }

            let internal_depth = if lfo_params.source.uses_internal() {
                lfo_params.internal_depth
            } else {
                0
            };
            let control_depth = if controller.is_some() {
                lfo_params.control_depth
            } else {
                0
            };
            lfo.trigger(
                lfo_params.frequency,
                starts[index],
                internal_depth,
                control_depth,
                lfo_params.flip_phase,
            );
            if let Some(controller) = controller {
                lfo.update_by_controller(controllers.get(controller));
            }
            lfo.set_script_depth_factor(factors.depth[index]);
            lfo.set_script_frequency_factor(factors.frequency[index]);
        }
    }

    /// Applies new script LFO factors to a running voice.
    pub(crate) fn set_lfo_factors(&mut self, factors: LfoFactors) {
        for (index, lfo) in self.lfos.iter_mut().enumerate() {
            if self.lfo_enabled[index] {
                lfo.set_script_depth_factor(factors.depth[index]);
                lfo.set_script_frequency_factor(factors.frequency[index]);
            }
        }
    }

    /// Schedules `command` at `offset` frames into the current cycle. When the queue is
    /// full the command takes effect right away.
    pub(crate) fn schedule(&mut self, offset: usize, command: VoiceCommand) {
        if self.command_count < MAX_VOICE_COMMANDS {
            self.commands[self.command_count] = (offset, command);
            self.command_count += 1;
        } else {
            self.execute(command);
        }
    }

    /// Silences the voice immediately.
    pub(crate) fn kill(&mut self) {
        self.finished = true;
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn stream(&self) -> Option<StreamId> {
        self.cursor.stream
    }

    pub(crate) fn stage(&self) -> EgStage {
        self.eg1.stage()
    }

    /// Whether the amplitude envelope is past its sustain.
    pub(crate) fn is_releasing(&self) -> bool {
        matches!(
            self.eg1.stage(),
            EgStage::ReleasePart1 | EgStage::ReleasePart2 | EgStage::FadeOut | EgStage::End
        )
    }

    pub(crate) fn info(&self) -> VoiceInfo {
        VoiceInfo {
            channel: self.channel,
            key: self.key,
            velocity: self.velocity,
            layer: self.layer,
            voice_type: self.voice_type,
            region: self.region,
            dimension_region: self.dimension_region,
            stage: self.eg1.stage(),
            streaming: self.cursor.stream.is_some(),
        }
    }

    /// Adds this cycle's output to `left` and `right`. Returns false once the voice
    /// has finished.
    pub(crate) fn render(
        &mut self,
        sample: &Sample,
        context: &VoiceContext<'_>,
        streams: &mut StreamManager,
        diagnostics: &mut DiagnosticSink,
        left: &mut [f32],
        right: &mut [f32],
    ) -> bool {
        let frames = left.len().min(right.len());
        let mut frame = self.delay.min(frames);
        self.delay = 0;
        self.cursor.starved = 0;

        while frame < frames && !self.finished {
            self.apply_commands(frame);
            if self.finished {
                break;
            }
            if self.subfragment_left == 0 {
                self.update_modulation(context);
                self.subfragment_left = SUBFRAGMENT_SIZE;
            }

            let end = (frame + self.subfragment_left)
                .min(self.next_command(frames))
                .min(frames);
            for index in frame..end {
                if !self.render_frame(sample, streams, &mut left[index], &mut right[index]) {
                    self.finished = true;
                    break;
                }
            }
            self.subfragment_left -= end - frame;
            frame = end;
            if self.ending && self.subfragment_left == 0 {
                self.finished = true;
            }
        }
        self.apply_commands(usize::MAX);

        if self.cursor.starved > 0 {
            if let Some(stream) = self.cursor.stream {
                diagnostics.report(Diagnostic::StreamStarved {
                    slot: stream.slot(),
                    missing: self.cursor.starved,
                });
            }
        }
        !self.finished
    }

    #[inline]
    fn render_frame(
        &mut self,
        sample: &Sample,
        streams: &mut StreamManager,
        left: &mut f32,
        right: &mut f32,
    ) -> bool {
        let frame = self.position as usize;
        let fraction = (self.position - frame as f64) as f32;
        let Some((l0, r0)) = self.cursor.fetch(frame, sample, streams) else {
            return false;
        };
        let (l1, r1) = self
            .cursor
            .fetch(frame + 1, sample, streams)
            .unwrap_or((0.0, 0.0));

        let mut l = l0 + (l1 - l0) * fraction;
        let mut r = r0 + (r1 - r0) * fraction;
        if self.filter_params.enabled {
            l = self.filter.process(0, l);
            r = self.filter.process(1, r);
        }

        *left += l * self.amplitude * self.pan.0;
        *right += r * self.amplitude * self.pan.1;
        self.amplitude += self.amplitude_step;
        self.position += self.pitch;
        true
    }

    fn update_modulation(&mut self, context: &VoiceContext<'_>) {
        if let Some(hold_until) = self.hold_until {
            if self.position as usize >= hold_until {
                self.eg1.update(EgEvent::HoldEnd);
                self.eg2.update(EgEvent::HoldEnd);
                self.hold_until = None;
            }
        }

        for (index, lfo) in self.lfos.iter_mut().enumerate() {
            if let Some(controller) = self.lfo_controllers[index] {
                if self.lfo_enabled[index] {
                    lfo.update_by_controller(context.controllers.get(controller));
                }
            }
        }
        let lfo = |voice: &mut Voice, index: usize| {
            if voice.lfo_enabled[index] {
                voice.lfos[index].render()
            } else {
                0.0
            }
        };
        let amp_lfo = lfo(self, AMP_LFO);
        let cutoff_lfo = lfo(self, CUTOFF_LFO);
        let pitch_lfo = lfo(self, PITCH_LFO);

        let eg1 = self.eg1.process();
        let eg2 = self.eg2.process();
        if !self.eg1.is_active() {
            self.ending = true;
        }

        let overrides = &context.overrides;
        let target = if self.ending {
            0.0
        } else {
            self.volume * context.channel_volume * eg1 * (1.0 - amp_lfo) * overrides.volume
        };
        self.amplitude_step = (target - self.amplitude) / SUBFRAGMENT_SIZE as f32;

        let cents = context.controllers.pitch_bend_cents() + pitch_lfo;
        self.pitch = (self.pitch_base
            * 2f64.powf(cents as f64 / 1200.0)
            * overrides.pitch as f64)
            .clamp(0.0, MAX_PITCH);

        let position = pan_position(context.channel_pan, self.region_pan)
            + (overrides.pan.clamp(-1.0, 1.0) * 64.0) as i32;
        self.pan = context.pan_table.gains(position);

        if self.filter_params.enabled {
            self.update_filter(context, eg2, cutoff_lfo);
        }
    }

    fn update_filter(&mut self, context: &VoiceContext<'_>, eg2: f32, lfo: f32) {
        let params = &self.filter_params;
        let raw = match params.cutoff_controller {
            Some(controller) => {
                let value = context.controllers.get(controller as usize);
                let value = if params.cutoff_controller_invert {
                    127 - value
                } else {
                    value
                };
                value.max(params.minimum_cutoff)
            }
            None => params.cutoff,
        };
        let softness = 1.0 - self.velocity as f32 / 127.0;
        let velocity_scale = 1.0 - params.velocity_sensitivity.clamp(0.0, 1.0) * softness;
        let normalized = raw.min(127) as f32 / 127.0 * velocity_scale * eg2 * (1.0 - lfo);

        let mut cutoff = cutoff_hz(normalized) * context.overrides.cutoff;
        if params.keyboard_tracking {
            let semitones = self.key as f32 - params.keyboard_tracking_breakpoint as f32;
            cutoff *= 2f32.powf(semitones / 12.0);
        }
        let resonance = params.resonance.min(127) as f32 / 127.0 * context.overrides.resonance;
        self.filter.set(cutoff, resonance, context.sample_rate);
    }

    fn next_command(&self, frames: usize) -> usize {
        self.commands[..self.command_count]
            .iter()
            .map(|(offset, _)| *offset)
            .min()
            .unwrap_or(frames)
    }

    /// Executes every command due at or before `frame`, in scheduling order.
    fn apply_commands(&mut self, frame: usize) {
        let mut kept = 0;
        for index in 0..self.command_count {
            let (offset, command) = self.commands[index];
            if offset <= frame {
                self.execute(command);
            } else {
                self.commands[kept] = (offset, command);
                kept += 1;
            }
        }
        self.command_count = kept;
    }

    fn execute(&mut self, command: VoiceCommand) {
        match command {
            VoiceCommand::Release => {
                self.eg1.update(EgEvent::Release);
                self.eg2.update(EgEvent::Release);
            }
            VoiceCommand::CancelRelease => {
                self.eg1.update(EgEvent::CancelRelease);
                self.eg2.update(EgEvent::CancelRelease);
            }
            VoiceCommand::FadeOut => self.eg1.enter_fade_out(None),
            VoiceCommand::Kill => self.finished = true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::EngineConfig;
    use crate::diagnostics::diagnostics_channel;
    use crate::modulation::update_rate;
    use crate::stream::disk_streams;

    const RATE: u32 = 44100;

    fn times(release: f32) -> EgTimes {
        EgTimes {
            pre_attack: 1000,
            attack: 0.0,
            hold: false,
            decay1: 0.0,
            decay2: 0.0,
            infinite_sustain: true,
            sustain: 1000,
            release,
        }
    }

    struct Rig {
        params: DimensionParams,
        controllers: ControllerTable,
        pan_table: PanTable,
        streams: StreamManager,
        sink: DiagnosticSink,
    }

    impl Rig {
        fn new() -> Rig {
            let (streams, _disk) = disk_streams(&EngineConfig::default().with_max_streams(1));
            let (sink, _log) = diagnostics_channel(16);
            Rig {
                params: DimensionParams::default(),
                controllers: ControllerTable::new(),
                pan_table: PanTable::new(),
                streams,
                sink,
            }
        }

        fn voice(&self, delay: usize, head_frames: usize) -> Voice {
            let mut voice = Voice::new(update_rate(RATE));
            voice.launch(&VoiceSetup {
                note: Handle::default(),
                channel: 0,
                key: 60,
                velocity: 127,
                layer: 0,
                region: 0,
                dimension_region: 0,
                voice_type: VoiceType::Normal,
                key_group: 0,
                params: &self.params,
                volume: 1.0,
                pitch_base: 1.0,
                eg1: times(0.01),
                eg2: times(0.01),
                delay,
                head_frames,
                stream: None,
                truncated: false,
                hold_until: None,
                controllers: &self.controllers,
                lfo_factors: NoteOverrides::default().lfo_factors(),
            });
            voice
        }

        fn render(
            &mut self,
            voice: &mut Voice,
            sample: &Sample,
            frames: usize,
        ) -> (Vec<f32>, Vec<f32>, bool) {
            let mut left = vec![0.0; frames];
            let mut right = vec![0.0; frames];
            let context = VoiceContext {
                controllers: &self.controllers,
                channel_volume: 1.0,
                channel_pan: 64,
                pan_table: &self.pan_table,
                sample_rate: RATE as f32,
                overrides: NoteOverrides::default(),
            };
            let active = voice.render(
                sample,
                &context,
                &mut self.streams,
                &mut self.sink,
                &mut left,
                &mut right,
            );
            (left, right, active)
        }
    }

    fn constant(frames: usize) -> Arc<Sample> {
        Arc::new(Sample::from_interleaved("dc", 1, RATE, vec![1.0; frames]))
    }

    #[test]
    fn test_delay_is_sample_accurate() {
        let mut rig = Rig::new();
        let sample = constant(10_000);
        let mut voice = rig.voice(100, 10_000);

        let (left, right, active) = rig.render(&mut voice, &sample, 256);
        assert!(active);
        assert!(left[..100].iter().all(|value| *value == 0.0));
        assert!(left[101] > 0.0);
        // Equal-power centre, with a zero attack peaking slightly above unity.
        assert!((left[255] - right[255]).abs() < 1e-6);
        assert!(left[255] > 0.7 && left[255] < 0.75);
    }

    #[test]
    fn test_voice_ends_with_sample() {
        let mut rig = Rig::new();
        let sample = constant(100);
        let mut voice = rig.voice(0, 100);

        let (left, _, active) = rig.render(&mut voice, &sample, 256);
        assert!(!active);
        assert!(voice.is_finished());
        assert!(left[150..].iter().all(|value| *value == 0.0));
    }

    #[test]
    fn test_release_command_at_offset() {
        let mut rig = Rig::new();
        let sample = constant(100_000);
        let mut voice = rig.voice(0, 100_000);
        rig.render(&mut voice, &sample, 256);

        assert_eq!(voice.stage(), EgStage::Sustain);
        voice.schedule(32, VoiceCommand::Release);
        rig.render(&mut voice, &sample, 64);
        assert_eq!(voice.stage(), EgStage::ReleasePart1);

        let mut active = true;
        for _ in 0..100 {
            active = rig.render(&mut voice, &sample, 256).2;
            if !active {
                break;
            }
        }
        assert!(!active);
    }

    #[test]
    fn test_kill_is_immediate() {
        let mut rig = Rig::new();
        let sample = constant(100_000);
        let mut voice = rig.voice(0, 100_000);
        rig.render(&mut voice, &sample, 256);

        voice.schedule(10, VoiceCommand::Kill);
        let (left, _, active) = rig.render(&mut voice, &sample, 256);
        assert!(!active);
        assert!(left[9] > 0.0);
        assert!(left[10..].iter().all(|value| *value == 0.0));
    }

    #[test]
    fn test_truncated_voice_stops_at_head() {
        let mut rig = Rig::new();
        let sample = constant(100_000);
        let mut voice = rig.voice(0, 100);
        voice.cursor.reset(100, None, true);

        let (left, _, active) = rig.render(&mut voice, &sample, 256);
        assert!(!active);
        assert!(left[120..].iter().all(|value| *value == 0.0));
    }
}
