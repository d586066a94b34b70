// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Hardware collaborator interfaces.
//!
//! The pipeline does not talk to registers or bus transactions directly.
//! Board support code implements these traits for the control bus, the
//! sensor driver registry, the CSI capture controller and the image
//! processor; [`crate::virtual_platform`] provides a software implementation
//! of all of them.
//!
//! # Interrupt context
//!
//! [`CaptureEvents`] methods are invoked by the capture controller from its
//! completion path (an ISR on the target). Implementations must not block,
//! allocate or panic.

use crate::{
    config::{BusConfig, CsiConfig, IspConfig, MemoryKind, SccbConfig},
    error::Result,
    memory::FrameMemory,
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Raw address of a frame buffer as seen by the capture hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DmaAddr(pub usize);

impl fmt::Display for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Target region for one hardware transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaTarget {
    pub addr: DmaAddr,
    pub len: usize,
}

/// A finished hardware transaction as reported by the capture controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// `None` when the hardware ran the cycle without a target buffer.
    pub buffer: Option<DmaAddr>,
    pub buflen: usize,
    pub received_size: usize,
}

/// Physical interface a sensor is attached through.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SensorInterface {
    MipiCsi,
    Dvp,
    Spi,
}

/// One entry of a sensor's advertised format catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SensorFormat {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// The two hooks a capture controller calls from its completion path.
pub trait CaptureEvents: Send + Sync {
    /// The hardware is about to begin a transaction and needs a target.
    /// `None` tells it to run this cycle without one.
    fn on_request_buffer(&self) -> Option<DmaTarget>;

    /// The hardware finished writing a transaction.
    fn on_transaction_finished(&self, trans: &Transaction);
}

/// One addressed device session on the control bus.
pub trait BusDevice: Send {
    fn address(&self) -> u16;

    /// Writes `write` then reads `read.len()` bytes in one transaction.
    fn transact(&mut self, write: &[u8], read: &mut [u8]) -> Result<()>;

    fn close(self: Box<Self>) -> Result<()>;
}

/// A control bus master (I2C for SCCB sensors).
pub trait ControlBus: Send {
    fn open_device(&mut self, config: &SccbConfig, address: u16) -> Result<Box<dyn BusDevice>>;

    /// Releases the bus master. Calling it again is a no-op.
    fn delete(&mut self) -> Result<()>;
}

/// Control bus handle that can be shared with other peripherals on the
/// same wires (the audio codec on the reference board).
pub type SharedBus = Arc<Mutex<Box<dyn ControlBus>>>;

/// A detected and opened image sensor. Owns its bus session.
pub trait SensorDevice: Send {
    fn name(&self) -> &str;

    fn query_formats(&mut self) -> Result<Vec<SensorFormat>>;

    fn set_format(&mut self, format: &SensorFormat) -> Result<()>;

    fn set_stream(&mut self, enable: bool) -> Result<()>;

    fn set_mirror(&mut self, horizontal: bool, vertical: bool) -> Result<()>;

    /// Closes the bus session held by the sensor.
    fn close(self: Box<Self>) -> Result<()>;
}

/// A registered sensor driver: where to look and how to recognise it.
pub trait SensorDriver: Send + Sync {
    fn name(&self) -> &str;

    fn address(&self) -> u16;

    fn interface(&self) -> SensorInterface;

    /// Probes the device behind `session`. On success the returned sensor
    /// owns the session, otherwise it is handed back to the caller.
    fn detect(
        &self,
        session: Box<dyn BusDevice>,
    ) -> std::result::Result<Box<dyn SensorDevice>, Box<dyn BusDevice>>;
}

/// The CSI capture controller.
pub trait CaptureController: Send {
    fn register_events(&mut self, events: Arc<dyn CaptureEvents>) -> Result<()>;

    fn enable(&mut self) -> Result<()>;

    fn disable(&mut self) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Queues an explicit receive into `target`.
    fn receive(&mut self, target: DmaTarget, timeout: Duration) -> Result<()>;

    fn delete(self: Box<Self>) -> Result<()>;
}

/// The image signal processor.
pub trait ImageProcessor: Send {
    fn enable(&mut self) -> Result<()>;

    fn disable(&mut self) -> Result<()>;

    fn delete(self: Box<Self>) -> Result<()>;
}

/// Factories for every hardware block the pipeline brings up.
pub trait Platform: Send {
    fn new_control_bus(&mut self, config: &BusConfig) -> Result<Box<dyn ControlBus>>;

    fn new_capture_controller(&mut self, config: &CsiConfig)
        -> Result<Box<dyn CaptureController>>;

    fn new_image_processor(&mut self, config: &IspConfig) -> Result<Box<dyn ImageProcessor>>;

    fn allocate_frame(&mut self, len: usize, kind: MemoryKind) -> Result<FrameMemory> {
        FrameMemory::allocate(len, kind)
    }

    /// Flushes the CPU view of `memory` before the hardware first writes it.
    fn sync_for_device(&mut self, memory: &FrameMemory) -> Result<()> {
        memory.sync_for_device()
    }
}
