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
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::params::{resolve_parameters, ParameterDescriptor, Parameters};
use super::{AudioOutputDevice, DriverError};

/// How to describe and build one driver's devices.
#[derive(Clone, Copy)]
pub struct DriverFactory {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: fn() -> Vec<ParameterDescriptor>,
    pub create: fn(&Parameters) -> Result<Box<dyn AudioOutputDevice>, DriverError>,
}

impl fmt::Debug for DriverFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverFactory")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

struct RegisteredDriver {
    factory: DriverFactory,
    live: Arc<AtomicUsize>,
}

/// The set of known output drivers. Clones share the same registry and the same
/// live-device counts.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: Arc<Mutex<BTreeMap<&'static str, RegisteredDriver>>>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> DriverRegistry {
        DriverRegistry::default()
    }

    /// A registry holding the built-in drivers.
    pub fn with_builtin_drivers() -> DriverRegistry {
        let registry = DriverRegistry::new();
        for factory in [
            super::offline::FACTORY,
            super::dummy::FACTORY,
            super::cpal::FACTORY,
        ] {
            // The names are distinct, so this cannot fail.
            if let Err(e) = registry.register(factory) {
                warn!(err = %e, "Unable to register built-in driver");
            }
        }
        registry
    }

    pub fn register(&self, factory: DriverFactory) -> Result<(), DriverError> {
        let mut drivers = self.drivers.lock();
        if drivers.contains_key(factory.name) {
            return Err(DriverError::DuplicateDriver(factory.name));
        }
        drivers.insert(
            factory.name,
            RegisteredDriver {
                factory,
                live: Arc::new(AtomicUsize::new(0)),
            },
        );
        Ok(())
    }

    /// Registered driver names, sorted.
    pub fn drivers(&self) -> Vec<&'static str> {
        self.drivers.lock().keys().copied().collect()
    }

    pub fn description(&self, driver: &str) -> Result<&'static str, DriverError> {
        Ok(self.factory(driver)?.description)
    }

    pub fn parameters(&self, driver: &str) -> Result<Vec<ParameterDescriptor>, DriverError> {
        Ok((self.factory(driver)?.parameters)())
    }

    /// Resolves `parameters` and creates a device. The device counts as live until
    /// the returned lease is dropped.
    pub fn create(&self, driver: &str, parameters: &Parameters) -> Result<DeviceLease, DriverError> {
        let (factory, live) = {
            let drivers = self.drivers.lock();
            let registered = drivers
                .get(driver)
                .ok_or_else(|| DriverError::UnknownDriver(driver.to_string()))?;
            (registered.factory, registered.live.clone())
        };

        let resolved = resolve_parameters(factory.name, &(factory.parameters)(), parameters)?;
        let device = (factory.create)(&resolved)?;
        let count = live.fetch_add(1, Ordering::AcqRel) + 1;
        info!(driver = factory.name, live = count, "Created device");
        Ok(DeviceLease {
            driver: factory.name,
            device,
            live,
        })
    }

    /// Devices of `driver` that have not been dropped yet.
    pub fn live_devices(&self, driver: &str) -> usize {
        self.drivers
            .lock()
            .get(driver)
            .map_or(0, |registered| registered.live.load(Ordering::Acquire))
    }

    fn factory(&self, driver: &str) -> Result<DriverFactory, DriverError> {
        self.drivers
            .lock()
            .get(driver)
            .map(|registered| registered.factory)
            .ok_or_else(|| DriverError::UnknownDriver(driver.to_string()))
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.drivers())
            .finish()
    }
}

/// A device created through a [`DriverRegistry`]. Dropping it stops the device and
/// releases its live count.
pub struct DeviceLease {
    driver: &'static str,
    device: Box<dyn AudioOutputDevice>,
    live: Arc<AtomicUsize>,
}

impl Deref for DeviceLease {
    type Target = dyn AudioOutputDevice;

    fn deref(&self) -> &Self::Target {
        self.device.as_ref()
    }
}

impl DerefMut for DeviceLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.device.as_mut()
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if self.device.is_running() {
            if let Err(e) = self.device.stop() {
                warn!(driver = self.driver, err = %e, "Unable to stop device");
            }
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLease")
            .field("driver", &self.driver)
            .field("running", &self.device.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;
    use crate::driver::ParameterValue;

    #[test]
    fn test_builtin_drivers() {
        let registry = DriverRegistry::with_builtin_drivers();
        assert_eq!(registry.drivers(), vec!["cpal", "dummy", "offline"]);
        assert!(matches!(
            registry.register(crate::driver::dummy::FACTORY),
            Err(DriverError::DuplicateDriver("dummy"))
        ));
        assert!(matches!(
            registry.create("jack", &Parameters::new()),
            Err(DriverError::UnknownDriver(_))
        ));
    }

    #[test]
    fn test_live_devices_are_counted() -> Result<(), Box<dyn Error>> {
        let registry = DriverRegistry::with_builtin_drivers();
        let parameters = Parameters::new().with("fragment_size", ParameterValue::Int(64));

        let first = registry.create("dummy", &parameters)?;
        let second = registry.clone().create("dummy", &parameters)?;
        assert_eq!(registry.live_devices("dummy"), 2);
        assert_eq!(first.fragment_size(), 64);
        assert_eq!(first.driver(), "dummy");

        drop(first);
        assert_eq!(registry.live_devices("dummy"), 1);
        drop(second);
        assert_eq!(registry.live_devices("dummy"), 0);
        assert_eq!(registry.live_devices("offline"), 0);
        Ok(())
    }

    #[test]
    fn test_invalid_parameters_create_nothing() {
        let registry = DriverRegistry::with_builtin_drivers();
        let parameters = Parameters::new().with("fragment_size", ParameterValue::Int(0));
        assert!(registry.create("dummy", &parameters).is_err());
        assert_eq!(registry.live_devices("dummy"), 0);
    }
}
