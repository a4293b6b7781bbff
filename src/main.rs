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
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{crate_version, Parser, Subcommand};
use tracing::{info, span, Level};
use tracing_subscriber::EnvFilter;

use rtsampler::config::EngineConfig;
use rtsampler::diagnostics::diagnostics_channel;
use rtsampler::driver::{
    self, AudioOutputDevice, DriverRegistry, MidiInputDevice, OfflineDevice, ParameterValue, Parameters,
    ScriptEvent,
};
use rtsampler::engine::{Engine, EngineHandle};
use rtsampler::instrument::{load_instrument, Instrument};
use rtsampler::playsync::CancelHandle;

/// How often pending diagnostics are logged.
const DIAGNOSTIC_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A real-time sample player."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available audio output devices.
    Devices {},
    /// Lists the available MIDI input devices.
    MidiDevices {},
    /// Lists the output drivers and their parameters.
    Drivers {},
    /// Prints the regions and dimensions of an instrument.
    Inspect {
        /// The path to the instrument YAML file.
        instrument: PathBuf,
    },
    /// Renders notes into a WAV file.
    Render {
        /// The path to the instrument YAML file.
        instrument: PathBuf,
        /// The WAV file to write.
        output: PathBuf,
        /// Notes to play, in the form <KEY>:<VELOCITY>:<START>:<LENGTH>,... with
        /// start and length in seconds. For example, 60:100:0:1,64:90:0.5:1.
        #[arg(short, long)]
        notes: String,
        /// Length of the render in seconds. Defaults to one second past the last note.
        #[arg(short, long)]
        length: Option<f64>,
        /// The path to the engine config.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Plays an instrument live from a MIDI input.
    Play {
        /// The path to the instrument YAML file.
        instrument: PathBuf,
        /// The output driver.
        #[arg(short, long, default_value = "cpal")]
        driver: String,
        /// Driver parameters in the form <NAME>=<VALUE>. May be repeated.
        #[arg(short, long)]
        param: Vec<String>,
        /// The MIDI input device to listen to.
        #[arg(short, long)]
        midi_device: Option<String>,
        /// The path to the engine config.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices {} => {
            let devices = driver::list_output_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::MidiDevices {} => {
            let devices = driver::list_midi_inputs()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::Drivers {} => {
            let registry = DriverRegistry::with_builtin_drivers();
            for name in registry.drivers() {
                println!("{}: {}", name, registry.description(name)?);
                for parameter in registry.parameters(name)? {
                    let default = match (parameter.default)(&Parameters::new()) {
                        Some(value) => format!(" (default: {})", value),
                        None if parameter.mandatory => " (required)".to_string(),
                        None => String::new(),
                    };
                    println!(
                        "  - {} <{}>{}: {}",
                        parameter.name, parameter.kind, default, parameter.description
                    );
                }
            }
        }
        Commands::Inspect { instrument } => {
            let instrument = load_instrument(&instrument)?;
            print_instrument(&instrument);
        }
        Commands::Render {
            instrument,
            output,
            notes,
            length,
            config,
        } => render(&instrument, &output, &notes, length, config.as_deref())?,
        Commands::Play {
            instrument,
            driver,
            param,
            midi_device,
            config,
        } => play(
            &instrument,
            &driver,
            &param,
            midi_device.as_deref(),
            config.as_deref(),
        )?,
    }

    Ok(())
}

fn print_instrument(instrument: &Instrument) {
    println!(
        "{} (regions: {}, generation: {})",
        instrument.name(),
        instrument.regions().len(),
        instrument.generation()
    );
    for region in instrument.regions() {
        println!(
            "- {}: keys {}-{}, key group {}, layers {}",
            region.id(),
            region.low_key(),
            region.high_key(),
            region.key_group(),
            region.layers()
        );
        for dimension in region.dimensions() {
            println!(
                "    {:?}: {} bits, {} zones",
                dimension.kind(),
                dimension.bits(),
                dimension.zones()
            );
        }
        for (index, dimension_region) in region.dimension_regions() {
            let sample = dimension_region
                .sample()
                .map(|sample| format!("{} ({} frames)", sample.name(), sample.frames()))
                .unwrap_or_else(|| "no sample".to_string());
            println!("    [{}] {}", index, sample);
        }
    }
}

/// Parses <KEY>:<VELOCITY>:<START>:<LENGTH>,... into scripted note events.
fn parse_notes(notes: &str, sample_rate: u32) -> Result<Vec<ScriptEvent>, Box<dyn Error>> {
    let mut events = Vec::new();
    for note in notes.split(',').filter(|note| !note.trim().is_empty()) {
        let fields: Vec<&str> = note.trim().split(':').collect();
        if fields.len() != 4 {
            return Err(format!("malformed note '{}'", note).into());
        }
        let key: u8 = fields[0].parse()?;
        let velocity: u8 = fields[1].parse()?;
        if key > 127 || velocity > 127 {
            return Err(format!("note '{}' is out of MIDI range", note).into());
        }
        let start = (fields[2].parse::<f64>()?.max(0.0) * sample_rate as f64) as u64;
        let length = (fields[3].parse::<f64>()?.max(0.0) * sample_rate as f64) as u64;
        events.extend(ScriptEvent::note(0, key, velocity, start, length));
    }
    Ok(events)
}

/// Starts the threads every engine needs besides the render thread.
fn spawn_helpers(
    handle: &EngineHandle,
    log: rtsampler::diagnostics::DiagnosticLog,
    cancel: &CancelHandle,
) -> Vec<thread::JoinHandle<()>> {
    let mut threads = vec![log.spawn(cancel.clone(), DIAGNOSTIC_INTERVAL)];
    if let Some(disk) = handle.take_disk_thread() {
        threads.push(disk.spawn(cancel.clone()));
    }
    threads
}

fn render(
    instrument: &Path,
    output: &Path,
    notes: &str,
    length: Option<f64>,
    config: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    let span = span!(Level::INFO, "render");
    let _enter = span.enter();

    let config = EngineConfig::load(config)?;
    let sample_rate = config.sample_rate();
    let script = parse_notes(notes, sample_rate)?;
    let length = match length {
        Some(seconds) => (seconds.max(0.0) * sample_rate as f64) as u64,
        None => script.iter().map(|event| event.frame).max().unwrap_or(0) + sample_rate as u64,
    };

    let (sink, log) = diagnostics_channel(config.diagnostic_queue_capacity());
    let (engine, handle) = Engine::new(&config, sink);
    let instrument = load_instrument(instrument)?;
    handle
        .channel(0)
        .ok_or("engine has no channels")?
        .load_instrument(Arc::clone(&instrument));

    let cancel = CancelHandle::new();
    let helpers = spawn_helpers(&handle, log, &cancel);

    let mut device = OfflineDevice::new(
        output,
        sample_rate,
        config.max_block_frames().min(256),
        length,
    );
    device.set_script(handle.events(), script);
    device.start(engine)?;
    let frames = device.wait()?;

    cancel.cancel();
    for helper in helpers {
        let _ = helper.join();
    }
    info!(
        output = %output.display(),
        frames,
        instrument = instrument.name(),
        "Rendered"
    );
    Ok(())
}

fn play(
    instrument: &Path,
    driver_name: &str,
    params: &[String],
    midi_device: Option<&str>,
    config: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    let config = EngineConfig::load(config)?;
    let registry = DriverRegistry::with_builtin_drivers();
    let descriptors = registry.parameters(driver_name)?;

    let mut parameters = Parameters::new();
    for param in params {
        let (name, raw) = param
            .split_once('=')
            .ok_or_else(|| format!("malformed driver parameter '{}'", param))?;
        let descriptor = descriptors
            .iter()
            .find(|descriptor| descriptor.name == name)
            .ok_or_else(|| format!("driver {} has no parameter {}", driver_name, name))?;
        let value = ParameterValue::parse(descriptor.kind, raw)
            .ok_or_else(|| format!("invalid value '{}' for {}", raw, name))?;
        parameters.set(name, value);
    }
    for (name, value) in [
        ("sample_rate", config.sample_rate() as i64),
        ("priority", config.rt_priority() as i64),
    ] {
        if parameters.get(name).is_none() && descriptors.iter().any(|d| d.name == name) {
            parameters.set(name, ParameterValue::Int(value));
        }
    }

    let mut device = registry.create(driver_name, &parameters)?;
    let max_block_frames = config.max_block_frames().max(device.fragment_size());
    let config = config
        .with_sample_rate(device.sample_rate())
        .with_max_block_frames(max_block_frames);

    let (sink, log) = diagnostics_channel(config.diagnostic_queue_capacity());
    let (engine, handle) = Engine::new(&config, sink);
    handle
        .channel(0)
        .ok_or("engine has no channels")?
        .load_instrument(load_instrument(instrument)?);

    let cancel = CancelHandle::new();
    let helpers = spawn_helpers(&handle, log, &cancel);

    let midi = match midi_device {
        Some(name) => {
            let midi = MidiInputDevice::get(name)?;
            midi.watch_events(handle.events())?;
            Some(midi)
        }
        None => None,
    };

    device.start(engine)?;
    info!(driver = driver_name, "Playing; interrupt to stop");
    while device.is_running() {
        thread::sleep(Duration::from_millis(100));
    }

    if let Some(midi) = midi {
        midi.stop_watch_events();
    }
    device.stop()?;
    cancel.cancel();
    for helper in helpers {
        let _ = helper.join();
    }
    Ok(())
}
