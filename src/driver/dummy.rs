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
//! A device that renders in real time and discards the output. Useful for
//! benchmarking and for running the engine without audio hardware.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::engine::Engine;

use super::params::{
    fragment_size_parameter, required_int, sample_rate_parameter, ParameterDescriptor,
    ParameterKind, ParameterValue, Parameters,
};
use super::registry::DriverFactory;
use super::thread_priority::{configure_thread_priority, render_thread_priority, rt_enabled};
use super::{AudioOutputDevice, DriverError};

pub(crate) const FACTORY: DriverFactory = DriverFactory {
    name: "dummy",
    description: "Renders in real time without an audio device",
    parameters,
    create,
};

fn default_priority(_: &Parameters) -> Option<ParameterValue> {
    Some(ParameterValue::Int(70))
}

fn priority_range(_: &Parameters) -> Option<(ParameterValue, ParameterValue)> {
    Some((ParameterValue::Int(0), ParameterValue::Int(99)))
}

fn parameters() -> Vec<ParameterDescriptor> {
    vec![
        sample_rate_parameter(),
        fragment_size_parameter(),
        ParameterDescriptor::new("priority", "Render thread priority", ParameterKind::Int)
            .with_default(default_priority)
            .with_range(priority_range),
    ]
}

fn create(parameters: &Parameters) -> Result<Box<dyn AudioOutputDevice>, DriverError> {
    Ok(Box::new(DummyDevice::new(
        required_int(parameters, "sample_rate")? as u32,
        required_int(parameters, "fragment_size")? as usize,
        required_int(parameters, "priority")? as u8,
    )))
}

pub struct DummyDevice {
    sample_rate: u32,
    fragment_size: usize,
    priority: u8,
    stop: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl DummyDevice {
    pub fn new(sample_rate: u32, fragment_size: usize, priority: u8) -> DummyDevice {
        DummyDevice {
            sample_rate,
            fragment_size: fragment_size.max(1),
            priority,
            stop: Arc::new(AtomicBool::new(false)),
            cycles: Arc::new(AtomicU64::new(0)),
            thread: None,
        }
    }

    /// Wall-clock time of one fragment.
    fn period(&self) -> Duration {
        Duration::from_secs_f64(self.fragment_size as f64 / self.sample_rate.max(1) as f64)
    }
}

impl AudioOutputDevice for DummyDevice {
    fn driver(&self) -> &'static str {
        FACTORY.name
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    fn start(&mut self, mut engine: Engine) -> Result<(), DriverError> {
        if self.is_running() {
            return Err(DriverError::AlreadyRunning);
        }
        info!(
            sample_rate = self.sample_rate,
            fragment_size = self.fragment_size,
            "Starting dummy device"
        );

        let period = self.period();
        let fragment_size = self.fragment_size;
        let priority = render_thread_priority(self.priority);
        let rt = rt_enabled();
        let stop = self.stop.clone();
        let cycles = self.cycles.clone();
        stop.store(false, Ordering::Relaxed);
        cycles.store(0, Ordering::Relaxed);

        self.thread = Some(thread::spawn(move || {
            let mut priority_set = false;
            configure_thread_priority(priority, rt, &mut priority_set);

            let mut left = vec![0.0f32; fragment_size];
            let mut right = vec![0.0f32; fragment_size];
            let mut deadline = Instant::now();
            while !stop.load(Ordering::Relaxed) {
                engine.render_audio(&mut left, &mut right);
                cycles.fetch_add(1, Ordering::Relaxed);

                deadline += period;
                let now = Instant::now();
                if deadline > now {
                    spin_sleep::sleep(deadline - now);
                } else {
                    // Overran; don't try to catch up.
                    deadline = now;
                }
            }
            debug!("Dummy render thread stopped");
        }));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| DriverError::RenderThreadPanicked)?;
            info!("Stopped dummy device");
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

impl Drop for DummyDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for DummyDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyDevice")
            .field("sample_rate", &self.sample_rate)
            .field("fragment_size", &self.fragment_size)
            .field("running", &self.is_running())
            .finish()
    }
}
