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
//! Audio output and MIDI input drivers.
//!
//! Output devices own the render thread: once started they call
//! [`Engine::render_audio`] once per fragment until stopped. They are created by
//! name through a [`DriverRegistry`] from self-describing parameters.

use std::io;

use crate::engine::Engine;

mod cpal;
mod dummy;
mod midi;
mod offline;
mod params;
mod registry;
mod thread_priority;

pub use self::cpal::{list_output_devices, CpalDevice};
pub use dummy::DummyDevice;
pub use midi::{dispatch_live_event, list_midi_inputs, MidiInputDevice};
pub use offline::{OfflineDevice, ScriptEvent};
pub use params::{
    resolve_parameters, ParameterDescriptor, ParameterKind, ParameterValue, Parameters,
};
pub use registry::{DeviceLease, DriverFactory, DriverRegistry};
pub use self::thread_priority::{configure_thread_priority, render_thread_priority, rt_enabled};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("unknown driver {0}")]
    UnknownDriver(String),

    #[error("driver {0} is already registered")]
    DuplicateDriver(&'static str),

    #[error("driver {driver} has no parameter {parameter}")]
    UnknownParameter { driver: String, parameter: String },

    #[error("parameter {parameter} is required")]
    MissingParameter { parameter: &'static str },

    #[error("invalid value for parameter {parameter}: {reason}")]
    InvalidParameter { parameter: String, reason: String },

    #[error("device is already running")]
    AlreadyRunning,

    #[error("device error: {0}")]
    Device(String),

    #[error("MIDI error: {0}")]
    Midi(String),

    #[error("render thread panicked")]
    RenderThreadPanicked,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wav(#[from] hound::Error),
}

/// An audio output that drives an [`Engine`].
pub trait AudioOutputDevice: Send {
    /// The registry name of the driver that created this device.
    fn driver(&self) -> &'static str;

    fn sample_rate(&self) -> u32;

    /// Frames rendered per engine cycle. Never more than the engine's block size.
    fn fragment_size(&self) -> usize;

    /// Moves `engine` to the device's render thread and starts rendering.
    fn start(&mut self, engine: Engine) -> Result<(), DriverError>;

    /// Stops rendering. The engine is dropped on the render thread.
    fn stop(&mut self) -> Result<(), DriverError>;

    fn is_running(&self) -> bool;

    /// Cycles rendered since the device was started.
    fn cycles(&self) -> u64;
}
