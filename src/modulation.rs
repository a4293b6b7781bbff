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
//! Per-voice modulators. Both run once per sub-fragment rather than per frame.

mod eg;
mod lfo;

pub use eg::{EgEvent, EgStage, EgTimes, EnvelopeGenerator};
pub use lfo::{LfoRange, LfoStart, TriangleLfo};

/// Frames per modulation update.
pub const SUBFRAGMENT_SIZE: usize = 32;

/// Modulator update rate for a given sample rate.
pub fn update_rate(sample_rate: u32) -> f32 {
    sample_rate as f32 / SUBFRAGMENT_SIZE as f32
}
