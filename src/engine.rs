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
//! The sampler engine.
//!
//! [`Engine`] lives on the render thread and owns every voice, note and channel.
//! [`EngineHandle`] stays with the control side: it dispatches events, swaps
//! instruments and suspends regions, always through the primitives in
//! [`crate::sync`], so the render thread never waits on a lock.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::instrument::{Instrument, RegionId};
use crate::modulation::update_rate;
use crate::stream::{disk_streams, DiskThread, StreamManager};
use crate::sync::{
    BooleanHandshake, ConfigReader, ConfigWriter, DoubleBufferedConfig, GateReader, GateTimeout,
    HandshakeTimeout, SerializedGate,
};

mod channel;
mod controllers;
mod dsp;
mod event;
mod note;
mod pool;
mod trigger;
mod voice;

pub use controllers::{
    ControllerTable, AFTERTOUCH_INDEX, CONTROLLER_COUNT, PITCH_BEND_INDEX, SUSTAIN_PEDAL,
};
pub use event::{DispatchError, Event, EventKind, EventSender, SysexData, MAX_SYSEX_LEN};
pub use note::{LfoFactors, NoteOverrides, NoteScript, ScriptNote, MAX_VOICES_PER_NOTE};
pub use voice::{VoiceInfo, VoiceType, MAX_PITCH};

use channel::ChannelState;
use event::{event_queue, EventReceiver};
use note::Note;
use pool::{Handle, Pool};
use voice::{Voice, VoiceCommand, VoiceContext};

use self::dsp::PanTable;

/// Errors from suspending regions or disabling the engine.
#[derive(Debug, thiserror::Error)]
pub enum SuspendError {
    #[error("render thread did not acknowledge the suspension: {0}")]
    Timeout(#[from] HandshakeTimeout),

    #[error(transparent)]
    Gate(#[from] GateTimeout),
}

/// One MIDI channel on the render side.
struct EngineChannel {
    instrument: ConfigReader<Option<Arc<Instrument>>>,
    state: ChannelState,
}

/// The render-thread state that voice triggering and event processing work on.
pub(crate) struct EngineCore {
    voices: Pool<Voice>,
    notes: Pool<Note>,
    rng: StdRng,
    diagnostics: DiagnosticSink,
    streams: StreamManager,
    pan_table: PanTable,
    sample_rate: u32,
    /// Frames of each sample served from memory before a disk stream takes over.
    ram_cache_frames: usize,
    script: Option<Box<dyn NoteScript>>,
    /// Frames rendered since the engine started.
    frame_clock: u64,
    next_serial: u64,
    /// Set by SysEx, 0..1.
    master_volume: f32,
    global_volume: f32,
}

/// The render side of the engine. Move it to the audio thread and call
/// [`Engine::render_audio`] once per cycle.
pub struct Engine {
    disabled: GateReader,
    suspended: ConfigReader<Vec<RegionId>>,
    change_ongoing: Arc<BooleanHandshake>,
    events: EventReceiver,
    event_budget: usize,
    channels: Vec<EngineChannel>,
    core: EngineCore,
    /// Voices were killed for the current disabled period.
    silenced: bool,
}

impl Engine {
    /// Builds the engine and its control handle. All pools are allocated here.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(config: &EngineConfig, diagnostics: DiagnosticSink) -> (Engine, EngineHandle) {
        let sample_rate = config.sample_rate();
        let update_rate = update_rate(sample_rate);
        let (streams, disk) = disk_streams(config);
        let (sender, receiver) = event_queue(config.event_queue_capacity());
        let (gate, disabled) = SerializedGate::new(false);
        let (suspended_writer, suspended) = DoubleBufferedConfig::new(Vec::new());
        let change_ongoing = Arc::new(BooleanHandshake::new(false));
        let suspend_timeout = config.suspend_timeout().unwrap_or(Duration::from_secs(2));

        let mut channels = Vec::with_capacity(config.channels());
        let mut channel_handles = Vec::with_capacity(config.channels());
        for index in 0..config.channels().min(16) {
            let (writer, reader) = DoubleBufferedConfig::new(None);
            channels.push(EngineChannel {
                instrument: reader,
                state: ChannelState::new(index as u8, config),
            });
            channel_handles.push(ChannelHandle {
                index: index as u8,
                writer: Arc::new(Mutex::new(writer)),
            });
        }

        let rng = match config.random_seed() {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        info!(
            sample_rate,
            channels = channels.len(),
            max_voices = config.max_voices(),
            max_notes = config.max_notes(),
            max_streams = config.max_streams(),
            "Engine created"
        );

        let engine = Engine {
            disabled,
            suspended,
            change_ongoing: change_ongoing.clone(),
            events: receiver,
            event_budget: config.event_queue_capacity(),
            channels,
            core: EngineCore {
                voices: Pool::new(config.max_voices(), || Voice::new(update_rate)),
                notes: Pool::new(config.max_notes(), Note::new),
                rng,
                diagnostics,
                streams,
                pan_table: PanTable::new(),
                sample_rate,
                ram_cache_frames: config.ram_cache_frames(),
                script: None,
                frame_clock: 0,
                next_serial: 0,
                master_volume: 1.0,
                global_volume: config.global_volume(),
            },
            silenced: false,
        };
        let handle = EngineHandle {
            events: sender,
            channels: channel_handles,
            suspension: SuspensionControl {
                suspended: Arc::new(Mutex::new(suspended_writer)),
                change_ongoing,
                disabled: gate,
                timeout: suspend_timeout,
            },
            disk: Mutex::new(Some(disk)),
        };
        (engine, handle)
    }

    /// Installs the script run for every note-on. Call before rendering starts.
    pub fn set_note_script(&mut self, script: Box<dyn NoteScript>) {
        self.core.script = Some(script);
    }

    /// Renders one cycle into `left` and `right`, overwriting them.
    pub fn render_audio(&mut self, left: &mut [f32], right: &mut [f32]) {
        let frames = left.len().min(right.len());
        let (left, right) = (&mut left[..frames], &mut right[..frames]);
        left.fill(0.0);
        right.fill(0.0);

        let Engine {
            disabled,
            suspended,
            change_ongoing,
            events,
            event_budget,
            channels,
            core,
            silenced,
        } = self;

        let gate = disabled.pop();
        if *gate {
            if !*silenced {
                for channel in channels.iter_mut() {
                    core.kill_channel_voices(&channel.state, |_| true);
                    core.sweep_channel(&mut channel.state);
                }
                *silenced = true;
            }
            while events.pop().is_some() {}
            gate.rtt_done();
            return;
        }
        *silenced = false;

        let suspended = suspended.lock();
        let suspension_pending = change_ongoing.get_unsafe();

        let last_frame = frames.saturating_sub(1) as u32;
        for _ in 0..*event_budget {
            let Some(mut event) = events.pop() else {
                break;
            };
            event.frame_offset = event.frame_offset.min(last_frame);
            if let Some(channel) = channels.get_mut(event.channel as usize) {
                channel.state.events.push(event);
            }
        }

        for channel in channels.iter_mut() {
            let EngineChannel { instrument, state } = channel;
            let pinned = instrument.lock();
            let instrument = pinned.as_deref();

            let generation = instrument.map_or(0, |instrument| instrument.generation());
            if generation != state.generation {
                core.kill_channel_voices(state, |_| true);
                core.sweep_channel(state);
                state.generation = generation;
                if generation != 0 {
                    core.diagnostics.report(Diagnostic::InstrumentChanged {
                        channel: state.index,
                        generation,
                    });
                }
            }
            if suspension_pending {
                if let Some(instrument) = instrument {
                    core.kill_channel_voices(state, |voice| {
                        instrument
                            .region(voice.region)
                            .is_some_and(|region| suspended.contains(&region.id()))
                    });
                }
            }

            core.process_events(state, instrument, &suspended);
            core.apply_key_groups(state);
            core.render_channel(state, instrument, left, right);
            state.key_group_events.clear();
        }

        if suspension_pending {
            if let Some(mut guard) = change_ongoing.try_lock() {
                if guard.get() {
                    guard.set(false);
                    for region in suspended.iter() {
                        core.diagnostics
                            .report(Diagnostic::RegionSuspended { region: *region });
                    }
                }
            }
        }

        let gain = core.master_volume * core.global_volume;
        for sample in left.iter_mut().chain(right.iter_mut()) {
            *sample *= gain;
        }
        core.frame_clock += frames as u64;
        gate.rtt_done();
    }

    /// Sets the LFO factors of the sounding notes on `key` and of all their voices.
    /// Returns how many voices were updated.
    pub fn set_note_lfo_factors(&mut self, channel: u8, key: u8, factors: LfoFactors) -> usize {
        let Some(channel) = self.channels.get(channel as usize) else {
            return 0;
        };
        let core = &mut self.core;
        let mut updated = 0;
        for handle in channel.state.notes.iter() {
            let Some(note) = core.notes.get_mut(*handle) else {
                continue;
            };
            if note.host_key != key || note.release_note {
                continue;
            }
            note.overrides.set_lfo_factors(factors);
            for voice in note.voices.iter() {
                if let Some(voice) = core.voices.get_mut(*voice) {
                    voice.set_lfo_factors(factors);
                    updated += 1;
                }
            }
        }
        updated
    }

    /// Snapshots of every running voice.
    pub fn voices(&self) -> impl Iterator<Item = VoiceInfo> + '_ {
        self.core.voices.iter().map(|(_, voice)| voice.info())
    }

    pub fn active_voices(&self) -> usize {
        self.core.voices.len()
    }

    pub fn active_notes(&self) -> usize {
        self.core.notes.len()
    }

    /// Disk streams currently in use.
    pub fn active_streams(&self) -> usize {
        self.core.streams.busy_slots()
    }

    pub fn master_volume(&self) -> f32 {
        self.core.master_volume
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("channels", &self.channels.len())
            .field("voices", &self.core.voices.len())
            .field("notes", &self.core.notes.len())
            .field("sample_rate", &self.core.sample_rate)
            .finish()
    }
}

impl EngineCore {
    /// Marks matching voices of `channel` as finished. They are freed by the next
    /// sweep or render pass.
    fn kill_channel_voices(&mut self, channel: &ChannelState, predicate: impl Fn(&Voice) -> bool) {
        for handle in channel.notes.iter() {
            let Some(note) = self.notes.get(*handle) else {
                continue;
            };
            for voice in note.voices.iter() {
                if let Some(voice) = self.voices.get_mut(*voice) {
                    if predicate(voice) {
                        voice.kill();
                    }
                }
            }
        }
    }

    /// Frees finished voices and the notes left without voices.
    fn sweep_channel(&mut self, channel: &mut ChannelState) {
        let EngineCore {
            voices,
            notes,
            streams,
            ..
        } = self;
        channel.notes.retain(|handle| {
            let Some(note) = notes.get_mut(*handle) else {
                return false;
            };
            note.voices.retain(|voice_handle| match voices.get(*voice_handle) {
                Some(voice) if !voice.is_finished() => true,
                Some(voice) => {
                    if let Some(stream) = voice.stream() {
                        streams.delete(stream);
                    }
                    voices.free(*voice_handle);
                    false
                }
                None => false,
            });
            if note.voices.is_empty() {
                notes.free(*handle);
                false
            } else {
                true
            }
        });
    }

    /// Returns a voice to the pool along with its disk stream.
    fn release_voice(&mut self, handle: Handle) {
        if let Some(stream) = self.voices.get(handle).and_then(|voice| voice.stream()) {
            self.streams.delete(stream);
        }
        self.voices.free(handle);
    }

    /// Fades out voices of older notes sharing a key group with this cycle's note-ons.
    fn apply_key_groups(&mut self, channel: &ChannelState) {
        for event in channel.key_group_events.iter() {
            for handle in channel.notes.iter() {
                let Some(note) = self.notes.get(*handle) else {
                    continue;
                };
                if note.serial >= event.serial {
                    continue;
                }
                for voice in note.voices.iter() {
                    if let Some(voice) = self.voices.get_mut(*voice) {
                        if voice.key_group == event.group {
                            voice.schedule(event.offset, VoiceCommand::FadeOut);
                        }
                    }
                }
            }
        }
    }

    /// Renders every voice of `channel` into the output, freeing the ones that end.
    fn render_channel(
        &mut self,
        channel: &mut ChannelState,
        instrument: Option<&Instrument>,
        left: &mut [f32],
        right: &mut [f32],
    ) {
        let EngineCore {
            voices,
            notes,
            diagnostics,
            streams,
            pan_table,
            sample_rate,
            ..
        } = self;
        let ChannelState {
            notes: handles,
            controllers,
            volume,
            pan,
            ..
        } = channel;

        handles.retain(|handle| {
            let Some(note) = notes.get_mut(*handle) else {
                return false;
            };
            let context = VoiceContext {
                controllers: &*controllers,
                channel_volume: *volume,
                channel_pan: *pan,
                pan_table: &*pan_table,
                sample_rate: *sample_rate as f32,
                overrides: note.overrides,
            };
            note.voices.retain(|voice_handle| {
                let Some(voice) = voices.get_mut(*voice_handle) else {
                    return false;
                };
                let sample = instrument
                    .and_then(|instrument| instrument.region(voice.region))
                    .and_then(|region| region.dimension_region(voice.dimension_region))
                    .and_then(|dimension_region| dimension_region.sample());
                let active = match sample {
                    Some(sample) => voice.render(
                        sample,
                        &context,
                        streams,
                        diagnostics,
                        &mut *left,
                        &mut *right,
                    ),
                    None => false,
                };
                if !active {
                    if let Some(stream) = voice.stream() {
                        streams.delete(stream);
                    }
                    voices.free(*voice_handle);
                }
                active
            });
            if note.voices.is_empty() {
                notes.free(*handle);
                false
            } else {
                true
            }
        });
    }
}

/// The control side of the engine.
pub struct EngineHandle {
    events: EventSender,
    channels: Vec<ChannelHandle>,
    suspension: SuspensionControl,
    disk: Mutex<Option<DiskThread>>,
}

impl EngineHandle {
    /// A sender for queueing events. Clone it for every producer thread.
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    pub fn channel(&self, index: usize) -> Option<&ChannelHandle> {
        self.channels.get(index)
    }

    pub fn channels(&self) -> &[ChannelHandle] {
        &self.channels
    }

    pub fn suspension(&self) -> &SuspensionControl {
        &self.suspension
    }

    /// Takes the disk thread so it can be spawned. Returns `None` after the first call.
    pub fn take_disk_thread(&self) -> Option<DiskThread> {
        self.disk.lock().take()
    }
}

/// Loads instruments into one channel.
#[derive(Clone)]
pub struct ChannelHandle {
    index: u8,
    writer: Arc<Mutex<ConfigWriter<Option<Arc<Instrument>>>>>,
}

impl ChannelHandle {
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Publishes `instrument` to the render thread. Returns once the previous
    /// instrument is no longer pinned, so it can be dropped on this thread.
    pub fn load_instrument(&self, instrument: Arc<Instrument>) {
        info!(
            channel = self.index,
            instrument = instrument.name(),
            generation = instrument.generation(),
            "Loading instrument"
        );
        self.writer
            .lock()
            .update(|slot| *slot = Some(instrument.clone()));
    }

    /// Removes the channel's instrument. Its voices stop on the next cycle.
    pub fn unload_instrument(&self) {
        info!(channel = self.index, "Unloading instrument");
        self.writer.lock().update(|slot| *slot = None);
    }

    /// The instrument most recently published.
    pub fn instrument(&self) -> Option<Arc<Instrument>> {
        self.writer.lock().get_config_for_update().clone()
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("index", &self.index)
            .field(
                "instrument",
                &self.instrument().map(|instrument| instrument.name().to_string()),
            )
            .finish()
    }
}

/// Cooperative suspension of regions and of the whole engine.
pub struct SuspensionControl {
    /// Held across a whole suspension so concurrent callers take turns.
    suspended: Arc<Mutex<ConfigWriter<Vec<RegionId>>>>,
    change_ongoing: Arc<BooleanHandshake>,
    disabled: SerializedGate,
    timeout: Duration,
}

impl SuspensionControl {
    /// Stops new voices on `region` and blocks until the render thread has killed
    /// the ones still playing. `None` uses the configured timeout.
    ///
    /// On timeout the region stays suspended; the render thread finishes the
    /// handshake on its next cycle.
    pub fn suspend_region(
        &self,
        region: RegionId,
        timeout: Option<Duration>,
    ) -> Result<(), SuspendError> {
        let timeout = timeout.unwrap_or(self.timeout);
        let mut writer = self.suspended.lock();
        writer.update(|suspended| {
            if !suspended.contains(&region) {
                suspended.push(region);
            }
        });
        self.change_ongoing.set(true);
        match self.change_ongoing.wait_if(true, Some(timeout)) {
            Ok(()) => {
                debug!(region = %region, "Region suspended");
                Ok(())
            }
            Err(e) => {
                warn!(region = %region, err = %e, "Render thread did not acknowledge suspension");
                Err(e.into())
            }
        }
    }

    /// Lets `region` trigger voices again. Returns false if it was not suspended.
    pub fn resume_region(&self, region: RegionId) -> bool {
        let mut writer = self.suspended.lock();
        let was_suspended = writer.get_config_for_update().contains(&region);
        if was_suspended {
            writer.update(|suspended| suspended.retain(|suspended| *suspended != region));
            debug!(region = %region, "Region resumed");
        }
        was_suspended
    }

    pub fn is_suspended(&self, region: RegionId) -> bool {
        self.suspended
            .lock()
            .get_config_for_update()
            .contains(&region)
    }

    /// Silences the engine. Returns once the render thread has finished any cycle
    /// that started before the switch, with the previous disabled state.
    pub fn disable(&self) -> Result<bool, SuspendError> {
        let previous = self.disabled.push_and_unlock(true, Some(self.timeout))?;
        info!("Engine disabled");
        Ok(previous)
    }

    /// Resumes rendering. Returns the previous disabled state.
    pub fn enable(&self) -> Result<bool, SuspendError> {
        let previous = self.disabled.push_and_unlock(false, Some(self.timeout))?;
        info!("Engine enabled");
        Ok(previous)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.get_unsafe()
    }
}

impl std::fmt::Debug for SuspensionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspensionControl")
            .field("disabled", &self.is_disabled())
            .field("change_ongoing", &self.change_ongoing.get_unsafe())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use super::*;
    use crate::diagnostics::{diagnostics_channel, DiagnosticLog};
    use crate::instrument::{Dimension, DimensionKind};
    use crate::modulation::EgStage;
    use crate::testutil;

    const FRAMES: usize = 256;

    fn engine(config: EngineConfig) -> (Engine, EngineHandle, DiagnosticLog) {
        let (sink, log) = diagnostics_channel(256);
        let (engine, handle) = Engine::new(&config.with_random_seed(7), sink);
        (engine, handle, log)
    }

    fn render(engine: &mut Engine, frames: usize) -> (Vec<f32>, Vec<f32>) {
        let mut left = vec![0.0; frames];
        let mut right = vec![0.0; frames];
        engine.render_audio(&mut left, &mut right);
        (left, right)
    }

    fn sorted_voices(engine: &Engine) -> Vec<VoiceInfo> {
        let mut voices: Vec<VoiceInfo> = engine.voices().collect();
        voices.sort_by_key(|voice| (voice.key, voice.layer, voice.voice_type as u8));
        voices
    }

    fn diagnostics(log: &mut DiagnosticLog) -> Vec<Diagnostic> {
        let mut all = Vec::new();
        log.drain(|diagnostic| all.push(diagnostic));
        all
    }

    /// Runs the engine on its own thread until `stop` is set, then hands it back.
    fn spawn_render_loop(mut engine: Engine, stop: Arc<AtomicBool>) -> thread::JoinHandle<Engine> {
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                render(&mut engine, 64);
                thread::sleep(Duration::from_millis(1));
            }
            engine
        })
    }

    #[test]
    fn test_release_trigger_uses_note_on_velocity() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, _log) = engine(EngineConfig::default());
        handle
            .channel(0)
            .ok_or("no channel")?
            .load_instrument(testutil::release_trigger_instrument()?);
        let events = handle.events();

        events.dispatch_note_on(60, 100, 0, 0)?;
        render(&mut engine, FRAMES);
        let voices = sorted_voices(&engine);
        assert_eq!(voices.len(), 2);
        assert_eq!(voices[0].layer, 0);
        assert_eq!(voices[1].layer, 1);
        assert_eq!(voices[0].voice_type, VoiceType::ReleaseTriggerRequired);
        assert_eq!(voices[1].voice_type, VoiceType::Normal);
        // Velocity 100 falls into zone 6 of eight.
        assert!(voices.iter().all(|voice| voice.dimension_region == 6));

        events.dispatch_note_off(60, 10, 0, 0)?;
        render(&mut engine, FRAMES);
        let released: Vec<VoiceInfo> = sorted_voices(&engine)
            .into_iter()
            .filter(|voice| voice.voice_type == VoiceType::ReleaseTrigger)
            .collect();
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].layer, 0);
        assert_eq!(released[1].layer, 1);
        for voice in released {
            assert_eq!(voice.velocity, 100);
            assert_eq!(voice.dimension_region, 6 | 8);
        }
        Ok(())
    }

    #[test]
    fn test_key_group_fades_older_note() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, _log) = engine(EngineConfig::default());
        handle
            .channel(0)
            .ok_or("no channel")?
            .load_instrument(testutil::key_group_instrument()?);
        let events = handle.events();

        events.dispatch_note_on(60, 100, 0, 0)?;
        render(&mut engine, FRAMES);
        assert_eq!(engine.active_voices(), 1);

        events.dispatch_note_on(61, 100, 0, 10)?;
        render(&mut engine, 40);
        let voices = sorted_voices(&engine);
        assert_eq!(voices.len(), 2);
        assert_eq!(voices[0].key, 60);
        assert_eq!(voices[0].stage, EgStage::FadeOut);
        assert_ne!(voices[1].stage, EgStage::FadeOut);

        render(&mut engine, 512);
        let voices = sorted_voices(&engine);
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].key, 61);
        Ok(())
    }

    #[test]
    fn test_note_on_offset_is_sample_accurate() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, _log) = engine(EngineConfig::default());
        handle
            .channel(0)
            .ok_or("no channel")?
            .load_instrument(testutil::key_group_instrument()?);
        handle.events().dispatch_note_on(60, 127, 0, 100)?;

        let (left, right) = render(&mut engine, FRAMES);
        assert!(left[..=100].iter().all(|sample| *sample == 0.0));
        assert!(left[101] > 0.0);
        assert!(right[200] > 0.0);
        Ok(())
    }

    struct ForceLoudest;

    impl NoteScript for ForceLoudest {
        fn note_on(&mut self, note: &mut ScriptNote<'_>) {
            note.set_dimension_zone(DimensionKind::Velocity, 7);
        }
    }

    #[test]
    fn test_script_override_forces_zone() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, _log) = engine(EngineConfig::default());
        handle
            .channel(0)
            .ok_or("no channel")?
            .load_instrument(testutil::release_trigger_instrument()?);
        engine.set_note_script(Box::new(ForceLoudest));

        handle.events().dispatch_note_on(60, 10, 0, 0)?;
        render(&mut engine, FRAMES);
        let voices = sorted_voices(&engine);
        assert_eq!(voices.len(), 2);
        // Velocity bits forced to 7, release bit untouched.
        assert!(voices.iter().all(|voice| voice.dimension_region == 7));
        assert!(voices.iter().all(|voice| voice.velocity == 10));
        Ok(())
    }

    #[test]
    fn test_round_robin_advances_per_note_on() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, _log) = engine(EngineConfig::default());
        handle
            .channel(0)
            .ok_or("no channel")?
            .load_instrument(testutil::round_robin_instrument()?);
        let events = handle.events();
        for key in 60..66 {
            events.dispatch_note_on(key, 100, 0, 0)?;
        }
        render(&mut engine, FRAMES);

        let zones: Vec<u8> = sorted_voices(&engine)
            .iter()
            .map(|voice| voice.dimension_region)
            .collect();
        assert_eq!(zones, vec![0, 1, 2, 3, 0, 1]);
        Ok(())
    }

    #[test]
    fn test_keyboard_round_robin_skips_unmapped_keys() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, _log) = engine(EngineConfig::default());
        let instrument = testutil::dimension_instrument(
            60,
            127,
            vec![Dimension::new(DimensionKind::RoundRobinKeyboard, 2)?],
            None,
        )?;
        handle.channel(0).ok_or("no channel")?.load_instrument(instrument);
        let events = handle.events();
        for key in [60, 10, 61] {
            events.dispatch_note_on(key, 100, 0, 0)?;
        }
        render(&mut engine, FRAMES);

        let zones: Vec<(u8, u8)> = sorted_voices(&engine)
            .iter()
            .map(|voice| (voice.key, voice.dimension_region))
            .collect();
        assert_eq!(zones, vec![(60, 0), (61, 1)]);
        Ok(())
    }

    #[test]
    fn test_silent_note_on_fires_no_release_trigger() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, _log) = engine(EngineConfig::default());
        handle
            .channel(0)
            .ok_or("no channel")?
            .load_instrument(testutil::release_zone_only_instrument()?);
        let events = handle.events();

        events.dispatch_note_on(60, 100, 0, 0)?;
        render(&mut engine, FRAMES);
        assert_eq!(engine.active_voices(), 0);

        events.dispatch_note_off(60, 100, 0, 0)?;
        render(&mut engine, FRAMES);
        assert_eq!(engine.active_voices(), 0);
        Ok(())
    }

    #[test]
    fn test_inert_dimensions_resolve_to_zero() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, mut log) = engine(EngineConfig::default());
        let instrument = testutil::dimension_instrument(
            0,
            127,
            vec![
                Dimension::new(DimensionKind::None, 1)?,
                Dimension::new(DimensionKind::Velocity, 1)?,
                Dimension::new(DimensionKind::Unknown, 1)?,
            ],
            None,
        )?;
        handle.channel(0).ok_or("no channel")?.load_instrument(instrument);
        handle.events().dispatch_note_on(60, 100, 0, 0)?;
        render(&mut engine, FRAMES);

        let voices = sorted_voices(&engine);
        assert_eq!(voices.len(), 1);
        // Only the velocity bit is set.
        assert_eq!(voices[0].dimension_region, 0b010);

        let unknown: Vec<Diagnostic> = diagnostics(&mut log)
            .into_iter()
            .filter(|diagnostic| matches!(diagnostic, Diagnostic::UnknownDimension { .. }))
            .collect();
        assert_eq!(
            unknown,
            vec![
                Diagnostic::UnknownDimension {
                    kind: DimensionKind::None
                },
                Diagnostic::UnknownDimension {
                    kind: DimensionKind::Unknown
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_controller_axes_select_zones() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, _log) = engine(EngineConfig::default());
        let instrument = testutil::dimension_instrument(
            0,
            127,
            vec![
                Dimension::new(DimensionKind::ChannelAftertouch, 2)?,
                Dimension::new(DimensionKind::ModWheel, 2)?,
            ],
            None,
        )?;
        handle.channel(0).ok_or("no channel")?.load_instrument(instrument);
        let events = handle.events();
        events.dispatch_channel_pressure(100, 0, 0)?;
        events.dispatch_control_change(1, 70, 0, 0)?;
        events.dispatch_note_on(60, 100, 0, 0)?;
        render(&mut engine, FRAMES);

        let voices = sorted_voices(&engine);
        assert_eq!(voices.len(), 1);
        // Aftertouch 100 is zone 3, mod wheel 70 is zone 2.
        assert_eq!(voices[0].dimension_region, 3 | (2 << 2));
        Ok(())
    }

    #[test]
    fn test_layer_and_keyboard_axes() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, _log) = engine(EngineConfig::default());
        let instrument = testutil::dimension_instrument(
            0,
            127,
            vec![
                Dimension::new(DimensionKind::Layer, 1)?,
                Dimension::new(DimensionKind::Keyboard, 2)?,
            ],
            Some((60, 63)),
        )?;
        handle.channel(0).ok_or("no channel")?.load_instrument(instrument);
        handle.events().dispatch_note_on(62, 100, 0, 0)?;
        render(&mut engine, FRAMES);

        let voices: Vec<(u32, u8)> = sorted_voices(&engine)
            .iter()
            .map(|voice| (voice.layer, voice.dimension_region))
            .collect();
        // Key 62 sits halfway through the 60-63 keyboard range.
        assert_eq!(voices, vec![(0, 2 << 1), (1, 1 | (2 << 1))]);
        Ok(())
    }

    #[test]
    fn test_random_axis_follows_seed() -> Result<(), Box<dyn Error>> {
        let play = || -> Result<Vec<u8>, Box<dyn Error>> {
            let (mut engine, handle, _log) = engine(EngineConfig::default());
            let instrument = testutil::dimension_instrument(
                0,
                127,
                vec![Dimension::new(DimensionKind::Random, 3)?],
                None,
            )?;
            handle.channel(0).ok_or("no channel")?.load_instrument(instrument);
            for key in 60..68 {
                handle.events().dispatch_note_on(key, 100, 0, 0)?;
            }
            render(&mut engine, FRAMES);
            Ok(sorted_voices(&engine)
                .iter()
                .map(|voice| voice.dimension_region)
                .collect())
        };

        let first = play()?;
        assert_eq!(first.len(), 8);
        assert!(first.iter().all(|zone| *zone < 8));
        assert_eq!(first, play()?);
        Ok(())
    }

    #[test]
    fn test_sustain_pedal_defers_release() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, _log) = engine(EngineConfig::default());
        handle
            .channel(0)
            .ok_or("no channel")?
            .load_instrument(testutil::key_group_instrument()?);
        let events = handle.events();

        events.dispatch_control_change(64, 127, 0, 0)?;
        events.dispatch_note_on(60, 100, 0, 0)?;
        events.dispatch_note_off(60, 0, 0, 10)?;
        render(&mut engine, FRAMES);
        let voices = sorted_voices(&engine);
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].stage, EgStage::Sustain);

        events.dispatch_control_change(64, 0, 0, 0)?;
        render(&mut engine, FRAMES);
        let voices = sorted_voices(&engine);
        assert_eq!(voices.len(), 1);
        assert!(matches!(
            voices[0].stage,
            EgStage::ReleasePart1 | EgStage::ReleasePart2 | EgStage::FadeOut
        ));
        Ok(())
    }

    #[test]
    fn test_voice_pool_exhaustion_is_reported() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, mut log) = engine(EngineConfig::default().with_max_voices(1));
        handle
            .channel(0)
            .ok_or("no channel")?
            .load_instrument(testutil::release_trigger_instrument()?);

        handle.events().dispatch_note_on(60, 100, 0, 0)?;
        render(&mut engine, FRAMES);
        assert_eq!(engine.active_voices(), 1);
        assert!(diagnostics(&mut log)
            .contains(&Diagnostic::VoicePoolExhausted { channel: 0, key: 60 }));
        Ok(())
    }

    #[test]
    fn test_voice_stealing_takes_oldest_note() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, _log) = engine(EngineConfig::default().with_max_voices(1));
        handle
            .channel(0)
            .ok_or("no channel")?
            .load_instrument(testutil::key_group_instrument()?);
        let events = handle.events();

        events.dispatch_note_on(64, 100, 0, 0)?;
        render(&mut engine, FRAMES);
        events.dispatch_note_on(65, 100, 0, 0)?;
        render(&mut engine, FRAMES);

        let voices = sorted_voices(&engine);
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].key, 65);
        assert_eq!(engine.active_notes(), 1);
        Ok(())
    }

    #[test]
    fn test_instrument_swap_kills_old_voices() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, mut log) = engine(EngineConfig::default());
        let channel = handle.channel(0).ok_or("no channel")?;
        channel.load_instrument(testutil::key_group_instrument()?);
        handle.events().dispatch_note_on(60, 100, 0, 0)?;
        render(&mut engine, FRAMES);
        assert_eq!(engine.active_voices(), 1);
        diagnostics(&mut log);

        let replacement = testutil::round_robin_instrument()?;
        let generation = replacement.generation();
        channel.load_instrument(replacement);
        render(&mut engine, FRAMES);
        assert_eq!(engine.active_voices(), 0);
        assert_eq!(engine.active_notes(), 0);
        assert!(diagnostics(&mut log).contains(&Diagnostic::InstrumentChanged {
            channel: 0,
            generation
        }));
        Ok(())
    }

    #[test]
    fn test_controllers_and_master_volume() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, mut log) = engine(EngineConfig::default());
        let events = handle.events();
        events.dispatch_sysex(&[0xf0, 0x7f, 0x7f, 0x04, 0x01, 0x00, 0x40, 0xf7], 0, 0)?;
        events.dispatch_sysex(&[0xf0, 0x43, 0x10, 0xf7], 0, 0)?;
        events.dispatch_program_change(5, 2, 0)?;
        render(&mut engine, FRAMES);

        assert!((engine.master_volume() - 0.5).abs() < 0.001);
        let reported = diagnostics(&mut log);
        assert!(reported.contains(&Diagnostic::SysexIgnored { len: 4 }));
        assert!(reported.contains(&Diagnostic::ProgramChange {
            channel: 2,
            program: 5
        }));
        Ok(())
    }

    #[test]
    fn test_all_sound_off() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, _log) = engine(EngineConfig::default());
        handle
            .channel(0)
            .ok_or("no channel")?
            .load_instrument(testutil::round_robin_instrument()?);
        let events = handle.events();
        events.dispatch_note_on(60, 100, 0, 0)?;
        events.dispatch_note_on(61, 100, 0, 0)?;
        render(&mut engine, FRAMES);
        assert_eq!(engine.active_voices(), 2);

        events.dispatch_control_change(120, 0, 0, 0)?;
        render(&mut engine, FRAMES);
        assert_eq!(engine.active_voices(), 0);
        Ok(())
    }

    #[test]
    fn test_long_sample_orders_stream() -> Result<(), Box<dyn Error>> {
        let config = EngineConfig::default().with_ram_cache_frames(1000);
        let (mut engine, handle, _log) = engine(config);
        handle
            .channel(0)
            .ok_or("no channel")?
            .load_instrument(testutil::key_group_instrument()?);
        handle.events().dispatch_note_on(60, 100, 0, 0)?;
        render(&mut engine, FRAMES);

        let voices = sorted_voices(&engine);
        assert!(voices[0].streaming);
        assert_eq!(engine.active_streams(), 1);
        Ok(())
    }

    #[test]
    fn test_suspend_times_out_without_render_thread() -> Result<(), Box<dyn Error>> {
        let (_engine, handle, _log) = engine(EngineConfig::default());
        let instrument = testutil::key_group_instrument()?;
        let region = instrument.regions()[0].id();

        let result = handle
            .suspension()
            .suspend_region(region, Some(Duration::from_millis(20)));
        assert!(matches!(result, Err(SuspendError::Timeout(_))));
        assert!(handle.suspension().is_suspended(region));
        Ok(())
    }

    #[test]
    fn test_suspend_region_kills_and_blocks_voices() -> Result<(), Box<dyn Error>> {
        let (engine, handle, _log) = engine(EngineConfig::default());
        let instrument = testutil::key_group_instrument()?;
        let region = instrument.regions()[0].id();
        handle.channel(0).ok_or("no channel")?.load_instrument(instrument);
        let events = handle.events();
        events.dispatch_note_on(60, 100, 0, 0)?;

        let stop = Arc::new(AtomicBool::new(false));
        let render_loop = spawn_render_loop(engine, stop.clone());
        handle.suspension().suspend_region(region, None)?;
        events.dispatch_note_on(60, 100, 0, 0)?;
        events.dispatch_note_on(62, 100, 0, 0)?;
        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Relaxed);
        let mut engine = render_loop.join().map_err(|_| "render thread panicked")?;

        let voices = sorted_voices(&engine);
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].key, 62);

        assert!(handle.suspension().resume_region(region));
        assert!(!handle.suspension().resume_region(region));
        events.dispatch_note_on(60, 100, 0, 0)?;
        render(&mut engine, FRAMES);
        assert_eq!(engine.active_voices(), 2);
        Ok(())
    }

    #[test]
    fn test_disable_silences_engine() -> Result<(), Box<dyn Error>> {
        let (engine, handle, _log) = engine(EngineConfig::default());
        handle
            .channel(0)
            .ok_or("no channel")?
            .load_instrument(testutil::key_group_instrument()?);
        let events = handle.events();
        events.dispatch_note_on(60, 100, 0, 0)?;

        let stop = Arc::new(AtomicBool::new(false));
        let render_loop = spawn_render_loop(engine, stop.clone());
        thread::sleep(Duration::from_millis(5));
        assert!(!handle.suspension().disable()?);
        assert!(handle.suspension().is_disabled());
        events.dispatch_note_on(62, 100, 0, 0)?;
        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Relaxed);
        let mut engine = render_loop.join().map_err(|_| "render thread panicked")?;

        assert_eq!(engine.active_voices(), 0);
        let (left, _) = render(&mut engine, FRAMES);
        assert!(left.iter().all(|sample| *sample == 0.0));

        assert!(handle.suspension().enable()?);
        events.dispatch_note_on(60, 100, 0, 0)?;
        render(&mut engine, FRAMES);
        assert_eq!(engine.active_voices(), 1);
        Ok(())
    }

    #[test]
    fn test_lfo_factors_reach_voices() -> Result<(), Box<dyn Error>> {
        let (mut engine, handle, _log) = engine(EngineConfig::default());
        handle
            .channel(0)
            .ok_or("no channel")?
            .load_instrument(testutil::release_trigger_instrument()?);
        handle.events().dispatch_note_on(60, 100, 0, 0)?;
        render(&mut engine, FRAMES);

        let factors = LfoFactors {
            depth: [0.5, 1.0, 1.0],
            frequency: [2.0, 1.0, 1.0],
        };
        assert_eq!(engine.set_note_lfo_factors(0, 60, factors), 2);
        assert_eq!(engine.set_note_lfo_factors(0, 61, factors), 0);
        assert_eq!(engine.set_note_lfo_factors(9, 60, factors), 0);
        Ok(())
    }
}
