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
//! Self-describing driver parameters.
//!
//! A driver publishes one [`ParameterDescriptor`] per parameter. Defaults, ranges
//! and possible values are computed by plain function pointers that see the
//! parameters resolved so far, so a parameter can depend on the ones declared
//! before it (a sample rate that depends on the chosen device, for instance).

use std::collections::BTreeMap;
use std::fmt;

use super::DriverError;

/// A parameter value as given on the command line or resolved from a default.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ParameterValue {
    /// Parses `raw` as a value of `kind`.
    pub fn parse(kind: ParameterKind, raw: &str) -> Option<ParameterValue> {
        match kind {
            ParameterKind::Bool => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(ParameterValue::Bool(true)),
                "0" | "false" | "no" | "off" => Some(ParameterValue::Bool(false)),
                _ => None,
            },
            ParameterKind::Int => raw.parse().ok().map(ParameterValue::Int),
            ParameterKind::Float => raw.parse().ok().map(ParameterValue::Float),
            ParameterKind::String => Some(ParameterValue::String(raw.to_string())),
        }
    }

    pub fn kind(&self) -> ParameterKind {
        match self {
            ParameterValue::Bool(_) => ParameterKind::Bool,
            ParameterValue::Int(_) => ParameterKind::Int,
            ParameterValue::Float(_) => ParameterKind::Float,
            ParameterValue::String(_) => ParameterKind::String,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Int(value) => Some(*value as f64),
            ParameterValue::Float(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(value) => write!(f, "{}", value),
            ParameterValue::Int(value) => write!(f, "{}", value),
            ParameterValue::Float(value) => write!(f, "{}", value),
            ParameterValue::String(value) => write!(f, "{}", value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Bool,
    Int,
    Float,
    String,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParameterKind::Bool => "bool",
            ParameterKind::Int => "int",
            ParameterKind::Float => "float",
            ParameterKind::String => "string",
        };
        f.write_str(name)
    }
}

/// Named parameter values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    values: BTreeMap<String, ParameterValue>,
}

impl Parameters {
    pub fn new() -> Parameters {
        Parameters::default()
    }

    pub fn with(mut self, name: &str, value: ParameterValue) -> Parameters {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: ParameterValue) {
        self.values.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(ParameterValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(ParameterValue::as_f64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(ParameterValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(ParameterValue::String(value)) => Some(value),
            _ => None,
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }
}

fn no_default(_: &Parameters) -> Option<ParameterValue> {
    None
}

fn no_range(_: &Parameters) -> Option<(ParameterValue, ParameterValue)> {
    None
}

fn no_possibilities(_: &Parameters) -> Vec<ParameterValue> {
    Vec::new()
}

/// Describes one driver parameter.
#[derive(Clone)]
pub struct ParameterDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ParameterKind,
    /// Must be given by the caller; there is no default.
    pub mandatory: bool,
    /// Can only be set when the device is created.
    pub fixed: bool,
    /// Parameters that must be resolved before this one.
    pub depends_on: &'static [&'static str],
    /// The value used when the caller gives none.
    pub default: fn(&Parameters) -> Option<ParameterValue>,
    /// Inclusive bounds for numeric parameters.
    pub range: fn(&Parameters) -> Option<(ParameterValue, ParameterValue)>,
    /// The only values accepted. Empty accepts anything of the right kind.
    pub possibilities: fn(&Parameters) -> Vec<ParameterValue>,
}

impl ParameterDescriptor {
    /// A parameter with no default, range or possibilities.
    pub fn new(
        name: &'static str,
        description: &'static str,
        kind: ParameterKind,
    ) -> ParameterDescriptor {
        ParameterDescriptor {
            name,
            description,
            kind,
            mandatory: false,
            fixed: true,
            depends_on: &[],
            default: no_default,
            range: no_range,
            possibilities: no_possibilities,
        }
    }

    pub fn mandatory(mut self) -> ParameterDescriptor {
        self.mandatory = true;
        self
    }

    pub fn depends_on(mut self, names: &'static [&'static str]) -> ParameterDescriptor {
        self.depends_on = names;
        self
    }

    pub fn with_default(
        mut self,
        default: fn(&Parameters) -> Option<ParameterValue>,
    ) -> ParameterDescriptor {
        self.default = default;
        self
    }

    pub fn with_range(
        mut self,
        range: fn(&Parameters) -> Option<(ParameterValue, ParameterValue)>,
    ) -> ParameterDescriptor {
        self.range = range;
        self
    }

    pub fn with_possibilities(
        mut self,
        possibilities: fn(&Parameters) -> Vec<ParameterValue>,
    ) -> ParameterDescriptor {
        self.possibilities = possibilities;
        self
    }

    /// Checks `value` against the kind, range and possibilities, given the
    /// parameters resolved so far.
    pub fn check(&self, value: &ParameterValue, resolved: &Parameters) -> Result<(), DriverError> {
        let invalid = |reason: String| DriverError::InvalidParameter {
            parameter: self.name.to_string(),
            reason,
        };

        let kind_matches = value.kind() == self.kind
            || (self.kind == ParameterKind::Float && value.kind() == ParameterKind::Int);
        if !kind_matches {
            return Err(invalid(format!("expected {}, got {}", self.kind, value.kind())));
        }
        if let Some((low, high)) = (self.range)(resolved) {
            if let (Some(v), Some(lo), Some(hi)) = (value.as_f64(), low.as_f64(), high.as_f64()) {
                if v < lo || v > hi {
                    return Err(invalid(format!("{} is outside {}..={}", value, low, high)));
                }
            }
        }
        let possibilities = (self.possibilities)(resolved);
        if !possibilities.is_empty() && !possibilities.contains(value) {
            return Err(invalid(format!("{} is not one of the possible values", value)));
        }
        Ok(())
    }
}

impl fmt::Debug for ParameterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("mandatory", &self.mandatory)
            .field("fixed", &self.fixed)
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

/// Resolves `given` against `descriptors`: rejects unknown names, fills in
/// defaults and validates every value. Descriptors are resolved after the ones
/// they depend on.
pub fn resolve_parameters(
    driver: &str,
    descriptors: &[ParameterDescriptor],
    given: &Parameters,
) -> Result<Parameters, DriverError> {
    for name in given.names() {
        if !descriptors.iter().any(|descriptor| descriptor.name == name) {
            return Err(DriverError::UnknownParameter {
                driver: driver.to_string(),
                parameter: name.to_string(),
            });
        }
    }

    let mut resolved = Parameters::new();
    let mut pending: Vec<&ParameterDescriptor> = descriptors.iter().collect();
    while !pending.is_empty() {
        let ready = pending.iter().position(|descriptor| {
            descriptor
                .depends_on
                .iter()
                .all(|dependency| !pending.iter().any(|other| other.name == *dependency))
        });
        let Some(ready) = ready else {
            return Err(DriverError::InvalidParameter {
                parameter: pending[0].name.to_string(),
                reason: "circular parameter dependency".to_string(),
            });
        };
        let descriptor = pending.remove(ready);

        let value = match given.get(descriptor.name) {
            Some(value) => Some(value.clone()),
            None if descriptor.mandatory => {
                return Err(DriverError::MissingParameter {
                    parameter: descriptor.name,
                })
            }
            None => (descriptor.default)(&resolved),
        };
        if let Some(value) = value {
            descriptor.check(&value, &resolved)?;
            resolved.set(descriptor.name, value);
        }
    }
    Ok(resolved)
}

fn default_sample_rate(_: &Parameters) -> Option<ParameterValue> {
    Some(ParameterValue::Int(44100))
}

fn sample_rate_range(_: &Parameters) -> Option<(ParameterValue, ParameterValue)> {
    Some((ParameterValue::Int(8000), ParameterValue::Int(192_000)))
}

fn default_fragment_size(_: &Parameters) -> Option<ParameterValue> {
    Some(ParameterValue::Int(256))
}

fn fragment_size_range(_: &Parameters) -> Option<(ParameterValue, ParameterValue)> {
    Some((ParameterValue::Int(16), ParameterValue::Int(8192)))
}

/// The `sample_rate` parameter shared by the output drivers.
pub(crate) fn sample_rate_parameter() -> ParameterDescriptor {
    ParameterDescriptor::new("sample_rate", "Output sample rate in Hz", ParameterKind::Int)
        .with_default(default_sample_rate)
        .with_range(sample_rate_range)
}

/// The `fragment_size` parameter shared by the output drivers.
pub(crate) fn fragment_size_parameter() -> ParameterDescriptor {
    ParameterDescriptor::new(
        "fragment_size",
        "Frames rendered per engine cycle",
        ParameterKind::Int,
    )
    .with_default(default_fragment_size)
    .with_range(fragment_size_range)
}

/// Reads an integer parameter the resolver has already validated.
pub(crate) fn required_int(parameters: &Parameters, name: &'static str) -> Result<i64, DriverError> {
    parameters
        .int(name)
        .ok_or(DriverError::MissingParameter { parameter: name })
}
