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
//! Live MIDI input through midir, parsed with midly and dispatched to the engine.

use std::fmt;

use midir::{MidiInput, MidiInputConnection};
use midly::live::LiveEvent;
use midly::MidiMessage;
use parking_lot::Mutex;
use tracing::{debug, info, span, warn, Level};

use crate::engine::{DispatchError, EventSender};

use super::DriverError;

/// Dispatches one raw MIDI message, stamped at the start of the next cycle.
/// Returns false for messages the engine has no use for, such as clock or
/// active sensing.
pub fn dispatch_live_event(sender: &EventSender, raw: &[u8]) -> Result<bool, DispatchError> {
    if raw.first() == Some(&0xf0) {
        sender.dispatch_sysex(raw, 0, 0)?;
        return Ok(true);
    }
    let Ok(LiveEvent::Midi { channel, message }) = LiveEvent::parse(raw) else {
        return Ok(false);
    };
    let channel = channel.as_int();
    match message {
        MidiMessage::NoteOn { key, vel } => {
            sender.dispatch_note_on(key.as_int(), vel.as_int(), channel, 0)?
        }
        MidiMessage::NoteOff { key, vel } => {
            sender.dispatch_note_off(key.as_int(), vel.as_int(), channel, 0)?
        }
        MidiMessage::Aftertouch { key, vel } => {
            sender.dispatch_polyphonic_key_pressure(key.as_int(), vel.as_int(), channel, 0)?
        }
        MidiMessage::Controller { controller, value } => {
            sender.dispatch_control_change(controller.as_int(), value.as_int(), channel, 0)?
        }
        MidiMessage::ProgramChange { program } => {
            sender.dispatch_program_change(program.as_int(), channel, 0)?
        }
        MidiMessage::ChannelAftertouch { vel } => {
            sender.dispatch_channel_pressure(vel.as_int(), channel, 0)?
        }
        MidiMessage::PitchBend { bend } => sender.dispatch_pitch_bend(bend.as_int(), channel, 0)?,
    }
    Ok(true)
}

/// Names of the MIDI input ports, sorted.
pub fn list_midi_inputs() -> Result<Vec<String>, DriverError> {
    let input =
        MidiInput::new("rtsampler port lister").map_err(|e| DriverError::Midi(e.to_string()))?;
    let mut names = input
        .ports()
        .iter()
        .filter_map(|port| input.port_name(port).ok())
        .collect::<Vec<String>>();
    names.sort();
    Ok(names)
}

/// A MIDI input port feeding an engine.
pub struct MidiInputDevice {
    name: String,
    connection: Mutex<Option<MidiInputConnection<()>>>,
}

impl MidiInputDevice {
    /// Finds the input port whose name contains `name`. The match must be unique.
    pub fn get(name: &str) -> Result<MidiInputDevice, DriverError> {
        let matches = list_midi_inputs()?
            .into_iter()
            .filter(|port| port.contains(name))
            .collect::<Vec<String>>();

        match matches.as_slice() {
            [] => Err(DriverError::Midi(format!(
                "no device found with name {}",
                name
            ))),
            [port] => Ok(MidiInputDevice {
                name: port.clone(),
                connection: Mutex::new(None),
            }),
            _ => Err(DriverError::Midi(format!(
                "found too many devices that match ({}), use a less ambiguous device name",
                matches.join(", ")
            ))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts forwarding the port's messages to `sender`.
    pub fn watch_events(&self, sender: EventSender) -> Result<(), DriverError> {
        let span = span!(Level::INFO, "watch events (midir)");
        let _enter = span.enter();

        let mut connection = self.connection.lock();
        if connection.is_some() {
            return Err(DriverError::Midi("already watching events".to_string()));
        }

        let input =
            MidiInput::new("rtsampler input").map_err(|e| DriverError::Midi(e.to_string()))?;
        let port = input
            .ports()
            .into_iter()
            .find(|port| input.port_name(port).is_ok_and(|name| name == self.name))
            .ok_or_else(|| DriverError::Midi(format!("port {} disappeared", self.name)))?;

        info!(device = self.name, "Watching MIDI events");
        *connection = Some(
            input
                .connect(
                    &port,
                    "rtsampler input watcher",
                    move |_, raw, _| match dispatch_live_event(&sender, raw) {
                        Ok(true) => debug!(event = ?raw, "Dispatched MIDI event"),
                        Ok(false) => {}
                        Err(e) => warn!(err = %e, "Dropped MIDI event"),
                    },
                    (),
                )
                .map_err(|e| DriverError::Midi(e.to_string()))?,
        );
        Ok(())
    }

    /// Stops forwarding messages.
    pub fn stop_watch_events(&self) {
        if let Some(connection) = self.connection.lock().take() {
            connection.close();
            info!(device = self.name, "Stopped watching MIDI events");
        }
    }
}

impl fmt::Display for MidiInputDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Input)", self.name)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;
    use crate::config::EngineConfig;
    use crate::diagnostics::diagnostics_channel;
    use crate::engine::Engine;
    use crate::testutil;

    #[test]
    fn test_live_events_reach_engine() -> Result<(), Box<dyn Error>> {
        let (sink, _log) = diagnostics_channel(64);
        let (mut engine, handle) = Engine::new(&EngineConfig::default(), sink);
        handle
            .channel(1)
            .ok_or("no channel")?
            .load_instrument(testutil::key_group_instrument()?);
        let sender = handle.events();

        // Note on, channel 2 on the wire.
        assert!(dispatch_live_event(&sender, &[0x91, 60, 100])?);
        // Timing clock is not for us.
        assert!(!dispatch_live_event(&sender, &[0xf8])?);
        assert!(!dispatch_live_event(&sender, &[])?);

        let mut left = vec![0.0; 128];
        let mut right = vec![0.0; 128];
        engine.render_audio(&mut left, &mut right);
        let voices: Vec<_> = engine.voices().collect();
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].channel, 1);
        assert_eq!(voices[0].key, 60);
        assert_eq!(voices[0].velocity, 100);
        Ok(())
    }

    #[test]
    fn test_sysex_is_forwarded_whole() -> Result<(), Box<dyn Error>> {
        let (sink, _log) = diagnostics_channel(64);
        let (mut engine, handle) = Engine::new(&EngineConfig::default(), sink);
        let sysex = [0xf0, 0x7f, 0x7f, 0x04, 0x01, 0x00, 0x00, 0xf7];
        assert!(dispatch_live_event(&handle.events(), &sysex)?);

        let mut left = vec![0.0; 16];
        let mut right = vec![0.0; 16];
        engine.render_audio(&mut left, &mut right);
        assert_eq!(engine.master_volume(), 0.0);
        Ok(())
    }
}
