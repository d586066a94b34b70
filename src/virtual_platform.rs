// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Software implementation of the capture hardware.
//!
//! [`VirtualPlatform`] implements every collaborator trait in
//! [`crate::hal`] without touching real devices. It keeps a ledger of every
//! handle it hands out so leaks and teardown ordering can be checked, can be
//! told to fail at any bring-up stage, and simulates the capture hardware
//! either on demand through [`VirtualHardware`] or from a timer thread at a
//! fixed frame interval.
//!
//! The simulated hardware follows the controller contract: a cycle uses the
//! oldest explicitly queued receive if there is one, otherwise asks the
//! registered [`CaptureEvents`] for a buffer, and then reports the
//! transaction as finished with a full frame's worth of bytes.

use crate::{
    config::{BusConfig, CsiConfig, FramePreset, IspConfig, MemoryKind, SccbConfig},
    error::{CaptureError, Result},
    hal::{
        BusDevice, CaptureController, CaptureEvents, ControlBus, DmaAddr, DmaTarget,
        ImageProcessor, Platform, SensorDevice, SensorDriver, SensorFormat, SensorInterface,
        SharedBus, Transaction,
    },
    memory::FrameMemory,
};
use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, info, warn};

/// Points where the virtual platform can be told to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    FrameAlloc,
    CacheSync,
    BusCreate,
    DeviceOpen,
    QueryFormats,
    SetFormat,
    SetMirror,
    SensorStream,
    ControllerCreate,
    RegisterEvents,
    ControllerEnable,
    ControllerStart,
    ControllerReceive,
    ControllerStop,
    ProcessorCreate,
    ProcessorEnable,
}

/// Everything the virtual hardware was asked to do, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HwEvent {
    FrameAllocated { len: usize },
    FrameSynced { addr: DmaAddr },
    BusCreated,
    BusDeleted,
    DeviceOpened(u16),
    DeviceClosed(u16),
    FormatSet(String),
    MirrorSet { horizontal: bool, vertical: bool },
    SensorStream(bool),
    ControllerCreated,
    EventsRegistered,
    ControllerEnabled,
    ControllerDisabled,
    ControllerStarted,
    ControllerStopped,
    ReceiveQueued(DmaAddr),
    ControllerDeleted,
    ProcessorCreated,
    ProcessorEnabled,
    ProcessorDisabled,
    ProcessorDeleted,
}

/// Handles currently alive on the virtual platform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LiveHandles {
    pub buses: usize,
    pub devices: usize,
    pub controllers: usize,
    pub processors: usize,
}

#[derive(Default)]
struct Hardware {
    events: Option<Arc<dyn CaptureEvents>>,
    pending: VecDeque<DmaTarget>,
    running: bool,
    frame_len: usize,
}

#[derive(Default)]
struct State {
    faults: HashSet<FaultPoint>,
    log: Vec<HwEvent>,
    live: LiveHandles,
    hw: Hardware,
}

impl State {
    fn check(&self, point: FaultPoint) -> Result<()> {
        if self.faults.contains(&point) {
            return Err(CaptureError::IoError(format!("injected fault at {point:?}")));
        }
        Ok(())
    }
}

type Shared = Arc<Mutex<State>>;

fn lock(shared: &Shared) -> MutexGuard<'_, State> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs one hardware cycle. The state lock is not held while the capture
/// events are invoked.
fn run_cycle(shared: &Shared, received: Option<usize>) -> bool {
    let (events, queued, frame_len) = {
        let mut state = lock(shared);
        if !state.hw.running {
            return false;
        }
        let Some(events) = state.hw.events.clone() else {
            return false;
        };
        let queued = state.hw.pending.pop_front();
        (events, queued, state.hw.frame_len)
    };

    let Some(target) = queued.or_else(|| events.on_request_buffer()) else {
        return false;
    };
    events.on_transaction_finished(&Transaction {
        buffer: Some(target.addr),
        buflen: target.len,
        received_size: received.unwrap_or(frame_len).min(target.len),
    });
    true
}

/// A complete software platform.
#[derive(Clone, Default)]
pub struct VirtualPlatform {
    shared: Shared,
    frame_interval: Option<Duration>,
}

impl VirtualPlatform {
    /// A platform whose hardware only runs cycles when asked through
    /// [`VirtualPlatform::hardware`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A platform whose started controllers complete a frame every
    /// `interval` from a background thread.
    pub fn with_frame_interval(interval: Duration) -> Self {
        Self {
            shared: Shared::default(),
            frame_interval: Some(interval),
        }
    }

    pub fn ledger(&self) -> Ledger {
        Ledger {
            shared: self.shared.clone(),
        }
    }

    pub fn hardware(&self) -> VirtualHardware {
        VirtualHardware {
            shared: self.shared.clone(),
        }
    }

    /// Makes every later call at `point` fail.
    pub fn fail_at(&self, point: FaultPoint) {
        lock(&self.shared).faults.insert(point);
    }

    pub fn clear_fault(&self, point: FaultPoint) {
        lock(&self.shared).faults.remove(&point);
    }

    /// A sensor driver entry answering at `address`, on MIPI CSI, that
    /// advertises every [`FramePreset`] format.
    pub fn sensor(&self, name: &str, address: u16) -> VirtualSensorDriver {
        VirtualSensorDriver {
            shared: self.shared.clone(),
            name: name.to_string(),
            address,
            interface: SensorInterface::MipiCsi,
            present: true,
            formats: FramePreset::ALL
                .iter()
                .map(|preset| preset.sensor_format())
                .collect(),
        }
    }

    /// A control bus owned by someone other than the pipeline, as when the
    /// audio codec shares the camera's I2C wires.
    pub fn external_bus(&self) -> SharedBus {
        let mut state = lock(&self.shared);
        state.log.push(HwEvent::BusCreated);
        state.live.buses += 1;
        Arc::new(Mutex::new(Box::new(VirtualBus {
            shared: self.shared.clone(),
            deleted: false,
        })))
    }
}

impl Platform for VirtualPlatform {
    fn new_control_bus(&mut self, config: &BusConfig) -> Result<Box<dyn ControlBus>> {
        let mut state = lock(&self.shared);
        state.check(FaultPoint::BusCreate)?;
        state.log.push(HwEvent::BusCreated);
        state.live.buses += 1;
        debug!(
            "virtual I2C bus {} scl:{} sda:{}",
            config.port, config.scl_pin, config.sda_pin
        );
        Ok(Box::new(VirtualBus {
            shared: self.shared.clone(),
            deleted: false,
        }))
    }

    fn new_capture_controller(
        &mut self,
        config: &CsiConfig,
    ) -> Result<Box<dyn CaptureController>> {
        let mut state = lock(&self.shared);
        state.check(FaultPoint::ControllerCreate)?;
        state.log.push(HwEvent::ControllerCreated);
        state.live.controllers += 1;
        debug!(
            "virtual CSI controller {}x{} {} lanes @ {}Mbps",
            config.h_res, config.v_res, config.data_lanes, config.lane_bit_rate_mbps
        );
        Ok(Box::new(VirtualController {
            shared: self.shared.clone(),
            frame_len: config.frame_len(),
            frame_interval: self.frame_interval,
            worker: None,
        }))
    }

    fn new_image_processor(&mut self, config: &IspConfig) -> Result<Box<dyn ImageProcessor>> {
        let mut state = lock(&self.shared);
        state.check(FaultPoint::ProcessorCreate)?;
        state.log.push(HwEvent::ProcessorCreated);
        state.live.processors += 1;
        debug!(
            "virtual ISP {:?} -> {:?} @ {}Hz",
            config.input_color, config.output_color, config.clock_hz
        );
        Ok(Box::new(VirtualProcessor {
            shared: self.shared.clone(),
        }))
    }

    fn allocate_frame(&mut self, len: usize, kind: MemoryKind) -> Result<FrameMemory> {
        if lock(&self.shared).check(FaultPoint::FrameAlloc).is_err() {
            return Err(CaptureError::NoMemory(
                "injected frame allocation failure".to_string(),
            ));
        }
        let memory = FrameMemory::allocate(len, kind)?;
        lock(&self.shared)
            .log
            .push(HwEvent::FrameAllocated { len });
        Ok(memory)
    }

    fn sync_for_device(&mut self, memory: &FrameMemory) -> Result<()> {
        lock(&self.shared).check(FaultPoint::CacheSync)?;
        memory.sync_for_device()?;
        lock(&self.shared).log.push(HwEvent::FrameSynced {
            addr: memory.addr(),
        });
        Ok(())
    }
}

/// Read access to the virtual platform's bookkeeping.
#[derive(Clone)]
pub struct Ledger {
    shared: Shared,
}

impl Ledger {
    pub fn events(&self) -> Vec<HwEvent> {
        lock(&self.shared).log.clone()
    }

    pub fn clear_events(&self) {
        lock(&self.shared).log.clear();
    }

    pub fn live(&self) -> LiveHandles {
        lock(&self.shared).live
    }

    /// Index of the first occurrence of `event`.
    pub fn position(&self, event: &HwEvent) -> Option<usize> {
        lock(&self.shared).log.iter().position(|e| e == event)
    }

    pub fn contains(&self, event: &HwEvent) -> bool {
        self.position(event).is_some()
    }

    pub fn count(&self, event: &HwEvent) -> usize {
        lock(&self.shared).log.iter().filter(|e| *e == event).count()
    }
}

/// Drives the simulated capture hardware by hand.
#[derive(Clone)]
pub struct VirtualHardware {
    shared: Shared,
}

impl VirtualHardware {
    /// Runs one cycle that fills the whole target. Returns `false` when the
    /// controller is not running or no buffer was available.
    pub fn complete_frame(&self) -> bool {
        run_cycle(&self.shared, None)
    }

    /// Runs one cycle reporting `received` bytes.
    pub fn complete_frame_with(&self, received: usize) -> bool {
        run_cycle(&self.shared, Some(received))
    }

    /// Asks the registered events for a buffer without finishing it.
    pub fn request_buffer(&self) -> Option<DmaTarget> {
        let events = lock(&self.shared).hw.events.clone()?;
        events.on_request_buffer()
    }

    /// Reports a finished transaction at an arbitrary address.
    pub fn report_completion(&self, addr: Option<DmaAddr>, received: usize) -> bool {
        let Some(events) = lock(&self.shared).hw.events.clone() else {
            return false;
        };
        events.on_transaction_finished(&Transaction {
            buffer: addr,
            buflen: received,
            received_size: received,
        });
        true
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared).hw.running
    }

    /// Explicit receives queued and not yet finished.
    pub fn pending(&self) -> usize {
        lock(&self.shared).hw.pending.len()
    }
}

struct VirtualBus {
    shared: Shared,
    deleted: bool,
}

impl ControlBus for VirtualBus {
    fn open_device(&mut self, config: &SccbConfig, address: u16) -> Result<Box<dyn BusDevice>> {
        if self.deleted {
            return Err(CaptureError::InvalidState("bus deleted".to_string()));
        }
        let mut state = lock(&self.shared);
        state.check(FaultPoint::DeviceOpen)?;
        state.log.push(HwEvent::DeviceOpened(address));
        state.live.devices += 1;
        debug!("SCCB session {:#04x} @ {}Hz", address, config.clock_hz);
        Ok(Box::new(VirtualDevice {
            shared: self.shared.clone(),
            address,
        }))
    }

    fn delete(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.deleted, true) {
            return Ok(());
        }
        let mut state = lock(&self.shared);
        state.log.push(HwEvent::BusDeleted);
        state.live.buses = state.live.buses.saturating_sub(1);
        Ok(())
    }
}

struct VirtualDevice {
    shared: Shared,
    address: u16,
}

impl BusDevice for VirtualDevice {
    fn address(&self) -> u16 {
        self.address
    }

    fn transact(&mut self, _write: &[u8], read: &mut [u8]) -> Result<()> {
        read.fill(0);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let mut state = lock(&self.shared);
        state.log.push(HwEvent::DeviceClosed(self.address));
        state.live.devices = state.live.devices.saturating_sub(1);
        Ok(())
    }
}

/// Registry entry for a simulated sensor.
pub struct VirtualSensorDriver {
    shared: Shared,
    name: String,
    address: u16,
    interface: SensorInterface,
    present: bool,
    formats: Vec<SensorFormat>,
}

impl VirtualSensorDriver {
    pub fn interface(mut self, interface: SensorInterface) -> Self {
        self.interface = interface;
        self
    }

    /// Nothing answers at this entry's address.
    pub fn absent(mut self) -> Self {
        self.present = false;
        self
    }

    pub fn formats(mut self, formats: Vec<SensorFormat>) -> Self {
        self.formats = formats;
        self
    }
}

impl SensorDriver for VirtualSensorDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> u16 {
        self.address
    }

    fn interface(&self) -> SensorInterface {
        self.interface
    }

    fn detect(
        &self,
        session: Box<dyn BusDevice>,
    ) -> std::result::Result<Box<dyn SensorDevice>, Box<dyn BusDevice>> {
        if !self.present {
            return Err(session);
        }
        Ok(Box::new(VirtualSensor {
            shared: self.shared.clone(),
            name: self.name.clone(),
            session,
            formats: self.formats.clone(),
        }))
    }
}

struct VirtualSensor {
    shared: Shared,
    name: String,
    session: Box<dyn BusDevice>,
    formats: Vec<SensorFormat>,
}

impl SensorDevice for VirtualSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_formats(&mut self) -> Result<Vec<SensorFormat>> {
        lock(&self.shared).check(FaultPoint::QueryFormats)?;
        Ok(self.formats.clone())
    }

    fn set_format(&mut self, format: &SensorFormat) -> Result<()> {
        let mut state = lock(&self.shared);
        state.check(FaultPoint::SetFormat)?;
        state.log.push(HwEvent::FormatSet(format.name.clone()));
        Ok(())
    }

    fn set_stream(&mut self, enable: bool) -> Result<()> {
        let mut state = lock(&self.shared);
        state.check(FaultPoint::SensorStream)?;
        state.log.push(HwEvent::SensorStream(enable));
        Ok(())
    }

    fn set_mirror(&mut self, horizontal: bool, vertical: bool) -> Result<()> {
        let mut state = lock(&self.shared);
        state.check(FaultPoint::SetMirror)?;
        state.log.push(HwEvent::MirrorSet {
            horizontal,
            vertical,
        });
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.session.close()
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct VirtualController {
    shared: Shared,
    frame_len: usize,
    frame_interval: Option<Duration>,
    worker: Option<Worker>,
}

impl VirtualController {
    fn spawn_worker(&mut self, interval: Duration) {
        let stop = Arc::new(AtomicBool::new(false));
        let shared = self.shared.clone();
        let flag = stop.clone();
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                thread::sleep(interval);
                if flag.load(Ordering::Acquire) {
                    break;
                }
                run_cycle(&shared, None);
            }
        });
        info!("virtual capture running every {:?}", interval);
        self.worker = Some(Worker { stop, handle });
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            if worker.handle.join().is_err() {
                warn!("virtual capture thread panicked");
            }
        }
    }
}

impl CaptureController for VirtualController {
    fn register_events(&mut self, events: Arc<dyn CaptureEvents>) -> Result<()> {
        let mut state = lock(&self.shared);
        state.check(FaultPoint::RegisterEvents)?;
        state.hw.events = Some(events);
        state.log.push(HwEvent::EventsRegistered);
        Ok(())
    }

    fn enable(&mut self) -> Result<()> {
        let mut state = lock(&self.shared);
        state.check(FaultPoint::ControllerEnable)?;
        state.log.push(HwEvent::ControllerEnabled);
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        lock(&self.shared).log.push(HwEvent::ControllerDisabled);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        {
            let mut state = lock(&self.shared);
            state.check(FaultPoint::ControllerStart)?;
            state.hw.running = true;
            state.hw.frame_len = self.frame_len;
            state.log.push(HwEvent::ControllerStarted);
        }
        if let Some(interval) = self.frame_interval {
            self.spawn_worker(interval);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        lock(&self.shared).check(FaultPoint::ControllerStop)?;
        self.join_worker();
        let mut state = lock(&self.shared);
        state.hw.running = false;
        state.hw.pending.clear();
        state.log.push(HwEvent::ControllerStopped);
        Ok(())
    }

    fn receive(&mut self, target: DmaTarget, _timeout: Duration) -> Result<()> {
        let mut state = lock(&self.shared);
        state.check(FaultPoint::ControllerReceive)?;
        if !state.hw.running {
            return Err(CaptureError::InvalidState(
                "controller not started".to_string(),
            ));
        }
        state.hw.pending.push_back(target);
        state.log.push(HwEvent::ReceiveQueued(target.addr));
        Ok(())
    }

    fn delete(mut self: Box<Self>) -> Result<()> {
        self.join_worker();
        let mut state = lock(&self.shared);
        state.hw = Hardware::default();
        state.log.push(HwEvent::ControllerDeleted);
        state.live.controllers = state.live.controllers.saturating_sub(1);
        Ok(())
    }
}

impl Drop for VirtualController {
    fn drop(&mut self) {
        self.join_worker();
    }
}

struct VirtualProcessor {
    shared: Shared,
}

impl ImageProcessor for VirtualProcessor {
    fn enable(&mut self) -> Result<()> {
        let mut state = lock(&self.shared);
        state.check(FaultPoint::ProcessorEnable)?;
        state.log.push(HwEvent::ProcessorEnabled);
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        lock(&self.shared).log.push(HwEvent::ProcessorDisabled);
        Ok(())
    }

    fn delete(self: Box<Self>) -> Result<()> {
        let mut state = lock(&self.shared);
        state.log.push(HwEvent::ProcessorDeleted);
        state.live.processors = state.live.processors.saturating_sub(1);
        Ok(())
    }
}
