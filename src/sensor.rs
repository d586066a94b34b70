// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Sensor discovery and format negotiation.

use crate::{
    config::SccbConfig,
    error::{CaptureError, Result},
    hal::{ControlBus, SensorDevice, SensorDriver, SensorFormat, SensorInterface},
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Ordered list of sensor drivers to probe. The first one that detects a
/// device wins.
#[derive(Clone, Default)]
pub struct SensorRegistry {
    drivers: Vec<Arc<dyn SensorDriver>>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: impl SensorDriver + 'static) {
        self.drivers.push(Arc::new(driver));
    }

    /// Builder form of [`SensorRegistry::register`].
    pub fn with(mut self, driver: impl SensorDriver + 'static) -> Self {
        self.register(driver);
        self
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SensorDriver>> {
        self.drivers.iter()
    }
}

/// Probes every registered driver over `bus` and returns the first sensor
/// that answers.
///
/// A session is opened at each driver's address; sessions of drivers that
/// do not detect a device are closed before the next candidate is tried.
///
/// # Errors
///
/// - [`CaptureError::InvalidArgument`] if the detected sensor is attached
///   through a different interface than `expected`. This is fatal, no
///   further candidates are tried.
/// - [`CaptureError::NotFound`] if no driver detects a device.
/// - Any error from opening a bus session.
pub fn discover(
    bus: &mut dyn ControlBus,
    registry: &SensorRegistry,
    sccb: &SccbConfig,
    expected: SensorInterface,
) -> Result<Box<dyn SensorDevice>> {
    for driver in registry.iter() {
        let session = bus.open_device(sccb, driver.address()).map_err(|e| {
            error!(
                "failed to open bus session at {:#04x}: {}",
                driver.address(),
                e
            );
            e
        })?;

        match driver.detect(session) {
            Ok(sensor) => {
                if driver.interface() != expected {
                    error!(
                        "detected {} on {:?} but expected {:?}",
                        driver.name(),
                        driver.interface(),
                        expected
                    );
                    if let Err(e) = sensor.close() {
                        warn!("failed to close sensor session: {}", e);
                    }
                    return Err(CaptureError::InvalidArgument(format!(
                        "sensor {} uses {:?} interface, expected {:?}",
                        driver.name(),
                        driver.interface(),
                        expected
                    )));
                }
                info!(
                    "detected sensor {} at {:#04x}",
                    driver.name(),
                    driver.address()
                );
                return Ok(sensor);
            }
            Err(session) => {
                debug!(
                    "no {} sensor at {:#04x}",
                    driver.name(),
                    driver.address()
                );
                if let Err(e) = session.close() {
                    warn!("failed to close bus session: {}", e);
                }
            }
        }
    }

    error!("no compatible camera sensor found");
    Err(CaptureError::NotFound(
        "no compatible camera sensor found".to_string(),
    ))
}

/// Selects the advertised format named exactly `name` and programs it.
///
/// # Errors
///
/// [`CaptureError::NotSupported`] if the sensor does not advertise `name`,
/// otherwise any error from querying or setting the format.
pub fn negotiate_format(sensor: &mut dyn SensorDevice, name: &str) -> Result<SensorFormat> {
    let formats = sensor.query_formats()?;
    let Some(format) = formats.into_iter().find(|format| format.name == name) else {
        return Err(CaptureError::NotSupported(format!(
            "sensor {} has no format {}",
            sensor.name(),
            name
        )));
    };
    sensor.set_format(&format)?;
    info!(
        "negotiated format {} ({}x{} @ {}fps)",
        format.name, format.width, format.height, format.fps
    );
    Ok(format)
}
