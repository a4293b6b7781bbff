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
//! Renders the engine into a WAV file as fast as it can.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{info, span, warn, Level};

use crate::engine::{Engine, Event, EventKind, EventSender};

use super::params::{
    fragment_size_parameter, required_int, sample_rate_parameter, ParameterDescriptor,
    ParameterKind, ParameterValue, Parameters,
};
use super::registry::DriverFactory;
use super::{AudioOutputDevice, DriverError};

pub(crate) const FACTORY: DriverFactory = DriverFactory {
    name: "offline",
    description: "Renders into a 32-bit float stereo WAV file",
    parameters,
    create,
};

fn default_length(resolved: &Parameters) -> Option<ParameterValue> {
    // Two seconds.
    resolved
        .int("sample_rate")
        .map(|rate| ParameterValue::Int(rate * 2))
}

fn length_range(_: &Parameters) -> Option<(ParameterValue, ParameterValue)> {
    Some((ParameterValue::Int(1), ParameterValue::Int(i64::MAX)))
}

fn parameters() -> Vec<ParameterDescriptor> {
    vec![
        ParameterDescriptor::new("path", "WAV file to write", ParameterKind::String).mandatory(),
        sample_rate_parameter(),
        fragment_size_parameter(),
        ParameterDescriptor::new("length", "Frames to render", ParameterKind::Int)
            .depends_on(&["sample_rate"])
            .with_default(default_length)
            .with_range(length_range),
    ]
}

fn create(parameters: &Parameters) -> Result<Box<dyn AudioOutputDevice>, DriverError> {
    Ok(Box::new(OfflineDevice::from_parameters(parameters)?))
}

/// An event to dispatch at an absolute frame of an offline render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptEvent {
    pub frame: u64,
    pub event: Event,
}

impl ScriptEvent {
    pub fn new(frame: u64, channel: u8, kind: EventKind) -> ScriptEvent {
        ScriptEvent {
            frame,
            event: Event {
                kind,
                channel,
                frame_offset: 0,
            },
        }
    }

    /// A note-on at `start` and its note-off `length` frames later.
    pub fn note(channel: u8, key: u8, velocity: u8, start: u64, length: u64) -> [ScriptEvent; 2] {
        [
            ScriptEvent::new(start, channel, EventKind::NoteOn { key, velocity }),
            ScriptEvent::new(
                start + length,
                channel,
                EventKind::NoteOff { key, velocity: 64 },
            ),
        ]
    }
}

struct Script {
    sender: EventSender,
    events: Vec<ScriptEvent>,
}

/// Writes `length` frames of engine output to a WAV file.
pub struct OfflineDevice {
    path: PathBuf,
    sample_rate: u32,
    fragment_size: usize,
    length: u64,
    script: Option<Script>,
    stop: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
    thread: Option<JoinHandle<Result<u64, DriverError>>>,
}

impl OfflineDevice {
    pub fn new(path: &Path, sample_rate: u32, fragment_size: usize, length: u64) -> OfflineDevice {
        OfflineDevice {
            path: path.to_path_buf(),
            sample_rate,
            fragment_size: fragment_size.max(1),
            length,
            script: None,
            stop: Arc::new(AtomicBool::new(false)),
            cycles: Arc::new(AtomicU64::new(0)),
            thread: None,
        }
    }

    pub fn from_parameters(parameters: &Parameters) -> Result<OfflineDevice, DriverError> {
        let path = parameters
            .string("path")
            .ok_or(DriverError::MissingParameter { parameter: "path" })?;
        Ok(OfflineDevice::new(
            Path::new(path),
            required_int(parameters, "sample_rate")? as u32,
            required_int(parameters, "fragment_size")? as usize,
            required_int(parameters, "length")? as u64,
        ))
    }

    /// Events dispatched through `sender` when the render reaches their frame.
    pub fn set_script(&mut self, sender: EventSender, mut events: Vec<ScriptEvent>) {
        events.sort_by_key(|event| event.frame);
        self.script = Some(Script { sender, events });
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for the render to finish. Returns the frames written.
    pub fn wait(&mut self) -> Result<u64, DriverError> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| DriverError::RenderThreadPanicked)?,
            None => Ok(0),
        }
    }
}

impl AudioOutputDevice for OfflineDevice {
    fn driver(&self) -> &'static str {
        FACTORY.name
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    fn start(&mut self, engine: Engine) -> Result<(), DriverError> {
        if self.is_running() {
            return Err(DriverError::AlreadyRunning);
        }
        let spec = WavSpec {
            channels: 2,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let writer = WavWriter::create(&self.path, spec)?;

        info!(
            path = %self.path.display(),
            sample_rate = self.sample_rate,
            length = self.length,
            "Starting offline render"
        );
        self.stop.store(false, Ordering::Relaxed);
        self.cycles.store(0, Ordering::Relaxed);
        let render = OfflineRender {
            engine,
            writer,
            fragment_size: self.fragment_size,
            length: self.length,
            script: self.script.take(),
            stop: self.stop.clone(),
            cycles: self.cycles.clone(),
        };
        self.thread = Some(thread::spawn(move || render.run()));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.stop.store(true, Ordering::Relaxed);
        self.wait().map(|_| ())
    }

    fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for OfflineDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineDevice")
            .field("path", &self.path)
            .field("sample_rate", &self.sample_rate)
            .field("fragment_size", &self.fragment_size)
            .field("length", &self.length)
            .finish()
    }
}

struct OfflineRender {
    engine: Engine,
    writer: WavWriter<std::io::BufWriter<std::fs::File>>,
    fragment_size: usize,
    length: u64,
    script: Option<Script>,
    stop: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
}

impl OfflineRender {
    fn run(mut self) -> Result<u64, DriverError> {
        let span = span!(Level::INFO, "offline render");
        let _enter = span.enter();

        let mut left = vec![0.0f32; self.fragment_size];
        let mut right = vec![0.0f32; self.fragment_size];
        let mut next_event = 0;
        let mut clock = 0u64;

        while clock < self.length && !self.stop.load(Ordering::Relaxed) {
            let frames = (self.length - clock).min(self.fragment_size as u64) as usize;
            if let Some(script) = &self.script {
                while let Some(scripted) = script.events.get(next_event) {
                    if scripted.frame >= clock + frames as u64 {
                        break;
                    }
                    let mut event = scripted.event;
                    event.frame_offset = scripted.frame.saturating_sub(clock) as u32;
                    if let Err(e) = script.sender.dispatch(event) {
                        warn!(err = %e, frame = scripted.frame, "Dropped scripted event");
                    }
                    next_event += 1;
                }
            }

            self.engine
                .render_audio(&mut left[..frames], &mut right[..frames]);
            for (l, r) in left[..frames].iter().zip(&right[..frames]) {
                self.writer.write_sample(*l)?;
                self.writer.write_sample(*r)?;
            }
            clock += frames as u64;
            self.cycles.fetch_add(1, Ordering::Relaxed);
        }

        self.writer.finalize()?;
        info!(frames = clock, "Finished offline render");
        Ok(clock)
    }
}
