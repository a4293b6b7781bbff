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
//! Synchronization between the render thread and control threads.
//!
//! Every primitive here has exactly one real-time consumer. That consumer only ever
//! performs lock-free loads/stores or a `try_lock`. Blocking waits are reserved for
//! the non-real-time side.

mod double_buffer;
mod gate;
mod handshake;

pub use double_buffer::{ConfigReader, ConfigWriter, DoubleBufferedConfig, ReadGuard};
pub use gate::{GatePush, GateReader, GateSnapshot, GateTimeout, SerializedGate};
pub use handshake::{BooleanHandshake, HandshakeGuard, HandshakeTimeout};
