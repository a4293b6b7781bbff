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
//! A real-time, multi-dimensional sample playback engine.
//!
//! Instruments map keys to regions, and regions pick one of up to 256 dimension
//! regions from the note's velocity, controllers, layer, round robin position and
//! more. The [`engine`] renders voices for those picks on a real-time thread that
//! never blocks; everything it shares with the rest of the program goes through
//! the lock-free primitives in [`sync`].

pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod engine;
pub mod instrument;
pub mod modulation;
pub mod playsync;
pub mod stream;
pub mod sync;

#[cfg(test)]
mod testutil;
