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
//! System audio output through cpal. The engine renders inside the device
//! callback, in fragments of at most `fragment_size` frames.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{error, info, span, Level};

use crate::engine::Engine;
use crate::playsync::CancelHandle;

use super::params::{
    fragment_size_parameter, required_int, sample_rate_parameter, ParameterDescriptor,
    ParameterKind, ParameterValue, Parameters,
};
use super::registry::DriverFactory;
use super::thread_priority::{configure_thread_priority, render_thread_priority, rt_enabled};
use super::{AudioOutputDevice, DriverError};

pub(crate) const FACTORY: DriverFactory = DriverFactory {
    name: "cpal",
    description: "System audio output",
    parameters,
    create,
};

/// How long `start` waits for the output thread to open the stream.
const START_TIMEOUT: Duration = Duration::from_secs(5);

fn default_device(_: &Parameters) -> Option<ParameterValue> {
    let _shh_stdout = shh::stdout().ok();
    let _shh_stderr = shh::stderr().ok();
    cpal::default_host()
        .default_output_device()
        .and_then(|device| device.name().ok())
        .map(ParameterValue::String)
}

fn device_names(_: &Parameters) -> Vec<ParameterValue> {
    list_output_devices()
        .map(|devices| {
            devices
                .into_iter()
                .map(|device| ParameterValue::String(device.name))
                .collect()
        })
        .unwrap_or_default()
}

fn default_priority(_: &Parameters) -> Option<ParameterValue> {
    Some(ParameterValue::Int(70))
}

fn priority_range(_: &Parameters) -> Option<(ParameterValue, ParameterValue)> {
    Some((ParameterValue::Int(0), ParameterValue::Int(99)))
}

fn parameters() -> Vec<ParameterDescriptor> {
    vec![
        ParameterDescriptor::new("device", "Output device name", ParameterKind::String)
            .with_default(default_device)
            .with_possibilities(device_names),
        sample_rate_parameter().depends_on(&["device"]),
        fragment_size_parameter(),
        ParameterDescriptor::new("priority", "Render thread priority", ParameterKind::Int)
            .with_default(default_priority)
            .with_range(priority_range),
    ]
}

fn create(parameters: &Parameters) -> Result<Box<dyn AudioOutputDevice>, DriverError> {
    let name = parameters
        .string("device")
        .ok_or(DriverError::MissingParameter { parameter: "device" })?;
    Ok(Box::new(CpalDevice::get(
        name,
        required_int(parameters, "sample_rate")? as u32,
        required_int(parameters, "fragment_size")? as usize,
        required_int(parameters, "priority")? as u8,
    )?))
}

/// An output device as listed by cpal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDeviceInfo {
    pub name: String,
    pub host: String,
    pub max_channels: u16,
}

impl fmt::Display for OutputDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Channels={}) ({})",
            self.name, self.max_channels, self.host
        )
    }
}

/// Lists output devices of every available host.
pub fn list_output_devices() -> Result<Vec<OutputDeviceInfo>, DriverError> {
    Ok(output_devices()?
        .into_iter()
        .map(|(info, _)| info)
        .collect())
}

fn output_devices() -> Result<Vec<(OutputDeviceInfo, cpal::Device)>, DriverError> {
    // Suppress noisy output here.
    let _shh_stdout = shh::stdout()?;
    let _shh_stderr = shh::stderr()?;

    let mut devices = Vec::new();
    for host_id in cpal::available_hosts() {
        let host = match cpal::host_from_id(host_id) {
            Ok(host) => host,
            Err(e) => {
                error!(err = %e, host = host_id.name(), "Unable to open host");
                continue;
            }
        };
        let host_devices = match host.output_devices() {
            Ok(host_devices) => host_devices,
            Err(e) => {
                error!(err = %e, host = host_id.name(), "Unable to list devices for host");
                continue;
            }
        };

        for device in host_devices {
            let Ok(configs) = device.supported_output_configs() else {
                continue;
            };
            let max_channels = configs.map(|config| config.channels()).max().unwrap_or(0);
            if max_channels == 0 {
                continue;
            }
            let Ok(name) = device.name() else {
                continue;
            };
            devices.push((
                OutputDeviceInfo {
                    name,
                    host: host_id.name().to_string(),
                    max_channels,
                },
                device,
            ));
        }
    }

    devices.sort_by(|(a, _), (b, _)| a.name.cmp(&b.name));
    Ok(devices)
}

/// Writes one fragment of engine output into an interleaved device buffer.
/// Mono devices get the average of both sides; channels past the second are
/// silent.
fn interleave<T: cpal::FromSample<f32>>(left: &[f32], right: &[f32], out: &mut [T], channels: usize) {
    for ((frame, l), r) in out.chunks_mut(channels).zip(left).zip(right) {
        match frame {
            [mono] => *mono = T::from_sample_((l + r) * 0.5),
            [first, second, rest @ ..] => {
                *first = T::from_sample_(*l);
                *second = T::from_sample_(*r);
                for sample in rest {
                    *sample = T::from_sample_(0.0);
                }
            }
            [] => {}
        }
    }
}

struct Callback {
    engine: Engine,
    left: Vec<f32>,
    right: Vec<f32>,
    channels: usize,
    cycles: Arc<AtomicU64>,
    priority: Option<thread_priority::ThreadPriorityValue>,
    rt: bool,
    priority_set: bool,
}

impl Callback {
    fn render<T: cpal::FromSample<f32>>(&mut self, data: &mut [T]) {
        configure_thread_priority(self.priority, self.rt, &mut self.priority_set);
        let fragment = self.left.len();
        for chunk in data.chunks_mut(fragment * self.channels) {
            let frames = chunk.len() / self.channels;
            let (left, right) = (&mut self.left[..frames], &mut self.right[..frames]);
            self.engine.render_audio(left, right);
            interleave(left, right, chunk, self.channels);
            self.cycles.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut callback: Callback,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| callback.render(data),
        |err| error!(err = %err, "cpal output stream error"),
        None,
    )
}

/// A cpal output device.
pub struct CpalDevice {
    name: String,
    device: cpal::Device,
    sample_rate: u32,
    fragment_size: usize,
    channels: u16,
    sample_format: cpal::SampleFormat,
    priority: u8,
    cycles: Arc<AtomicU64>,
    cancel: CancelHandle,
    thread: Option<JoinHandle<()>>,
}

impl CpalDevice {
    /// Opens the output device named `name`.
    pub fn get(
        name: &str,
        sample_rate: u32,
        fragment_size: usize,
        priority: u8,
    ) -> Result<CpalDevice, DriverError> {
        let (_, device) = output_devices()?
            .into_iter()
            .find(|(info, _)| info.name.trim() == name)
            .ok_or_else(|| DriverError::Device(format!("no device found with name {}", name)))?;
        let default_config = device
            .default_output_config()
            .map_err(|e| DriverError::Device(e.to_string()))?;

        Ok(CpalDevice {
            name: name.to_string(),
            device,
            sample_rate,
            fragment_size: fragment_size.max(1),
            channels: default_config.channels(),
            sample_format: default_config.sample_format(),
            priority,
            cycles: Arc::new(AtomicU64::new(0)),
            cancel: CancelHandle::new(),
            thread: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl AudioOutputDevice for CpalDevice {
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
        let span = span!(Level::INFO, "start output (cpal)");
        let _enter = span.enter();

        if self.is_running() {
            return Err(DriverError::AlreadyRunning);
        }
        info!(
            device = self.name,
            sample_rate = self.sample_rate,
            channels = self.channels,
            fragment_size = self.fragment_size,
            "Starting cpal output"
        );

        let config = cpal::StreamConfig {
            channels: self.channels,
            sample_rate: self.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };
        let callback = Callback {
            engine,
            left: vec![0.0; self.fragment_size],
            right: vec![0.0; self.fragment_size],
            channels: self.channels.max(1) as usize,
            cycles: self.cycles.clone(),
            priority: render_thread_priority(self.priority),
            rt: rt_enabled(),
            priority_set: false,
        };
        let device = self.device.clone();
        let sample_format = self.sample_format;
        self.cancel = CancelHandle::new();
        let cancel = self.cancel.clone();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);

        // The stream is not Send, so it lives on its own thread until cancelled.
        let thread = thread::spawn(move || {
            let stream = match sample_format {
                cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, callback),
                cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, callback),
                cpal::SampleFormat::I32 => build_stream::<i32>(&device, &config, callback),
                other => {
                    let _ = ready_tx.send(Err(format!("unsupported sample format {}", other)));
                    return;
                }
            };
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            while !cancel.wait_timeout(Duration::from_millis(100)) {}
            drop(stream);
        });

        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => {
                info!(device = self.name, "cpal output stream started");
                self.thread = Some(thread);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(DriverError::Device(e))
            }
            Err(_) => {
                self.cancel.cancel();
                Err(DriverError::Device(
                    "timed out waiting for the output stream".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| DriverError::RenderThreadPanicked)?;
            info!(device = self.name, "Stopped cpal output");
        }
        Ok(())
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

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl fmt::Display for CpalDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Channels={})", self.name, self.channels)
    }
}
