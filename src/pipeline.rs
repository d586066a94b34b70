// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Capture pipeline bring-up, streaming and teardown.
//!
//! [`Pipeline`] owns every hardware handle of one camera: the completion
//! channel, the frame buffer pool, the control bus, the sensor, the capture
//! controller and the image processor. Bring-up acquires them in that order
//! and any failure releases everything acquired so far in reverse order, so
//! a failed [`Pipeline::init`] leaves nothing behind.
//!
//! ```text
//! Uninit --init--> Initializing --ok--> Ready --start--> Streaming
//!    ^                  |                 |                 |
//!    |               failure              |               stop
//!    |                  v                 v                 v
//!    +-------------- (rollback) <----- deinit <--------- Stopped --start--> Streaming
//! ```
//!
//! # Example
//!
//! ```no_run
//! use edgefirst_capture::{
//!     config::CaptureConfig,
//!     pipeline::Pipeline,
//!     sensor::SensorRegistry,
//!     virtual_platform::VirtualPlatform,
//! };
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CaptureConfig::default();
//! let platform = VirtualPlatform::new();
//! let registry = SensorRegistry::new().with(platform.sensor("SC2336", 0x30));
//!
//! let mut pipeline = Pipeline::new(config, platform, registry);
//! pipeline.init(None)?;
//! pipeline.start()?;
//! let frame = pipeline.recv_frame(Duration::from_millis(100))?;
//! println!("{}", frame);
//! pipeline.release(frame);
//! pipeline.stop()?;
//! pipeline.deinit();
//! # Ok(())
//! # }
//! ```

use crate::{
    adapter::{CaptureAdapter, PipelineStats},
    buffer::{BufferPool, Frame},
    channel::{CompletionChannel, FrameReceiver},
    config::{CaptureConfig, MirrorSetting},
    error::{CaptureError, Result},
    hal::{
        CaptureController, ControlBus, ImageProcessor, Platform, SensorDevice, SensorFormat,
        SharedBus,
    },
    sensor::{discover, negotiate_format, SensorRegistry},
};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`Pipeline`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Uninit,
    Initializing,
    Ready,
    Streaming,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn lock_bus(bus: &SharedBus) -> MutexGuard<'_, Box<dyn ControlBus>> {
    bus.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Logs a failed bring-up stage and passes the error through.
fn stage_failed(stage: &'static str) -> impl FnOnce(CaptureError) -> CaptureError {
    move |err| {
        error!("Failed to {}: {}", stage, err);
        err
    }
}

struct BusSlot {
    bus: SharedBus,
    /// Created by the pipeline, as opposed to supplied by the caller.
    owned: bool,
}

/// Every handle acquired during bring-up. Each slot is emptied as soon as
/// it is released so teardown can run any number of times.
#[derive(Default)]
struct Resources {
    channel: Option<CompletionChannel>,
    pool: Option<Arc<BufferPool>>,
    bus: Option<BusSlot>,
    sensor: Option<Box<dyn SensorDevice>>,
    sensor_streaming: bool,
    format: Option<SensorFormat>,
    controller: Option<Box<dyn CaptureController>>,
    controller_enabled: bool,
    controller_started: bool,
    adapter: Option<Arc<CaptureAdapter>>,
    processor: Option<Box<dyn ImageProcessor>>,
    processor_enabled: bool,
}

impl Resources {
    /// Releases everything in reverse acquisition order. Failures are
    /// logged and the remaining handles are still released.
    fn release(&mut self) {
        if let Some(mut processor) = self.processor.take() {
            if std::mem::take(&mut self.processor_enabled) {
                if let Err(e) = processor.disable() {
                    warn!("failed to disable image processor: {}", e);
                }
            }
            if let Err(e) = processor.delete() {
                warn!("failed to delete image processor: {}", e);
            }
        }

        if let Some(mut controller) = self.controller.take() {
            if std::mem::take(&mut self.controller_started) {
                if let Err(e) = controller.stop() {
                    warn!("failed to stop capture controller: {}", e);
                }
            }
            if std::mem::take(&mut self.controller_enabled) {
                if let Err(e) = controller.disable() {
                    warn!("failed to disable capture controller: {}", e);
                }
            }
            if let Err(e) = controller.delete() {
                warn!("failed to delete capture controller: {}", e);
            }
        }
        self.adapter = None;

        if let Some(mut sensor) = self.sensor.take() {
            if std::mem::take(&mut self.sensor_streaming) {
                if let Err(e) = sensor.set_stream(false) {
                    warn!("failed to stop sensor stream: {}", e);
                }
            }
            if let Err(e) = sensor.close() {
                warn!("failed to close sensor: {}", e);
            }
        }
        self.format = None;

        if let Some(slot) = self.bus.take() {
            if slot.owned {
                if let Err(e) = lock_bus(&slot.bus).delete() {
                    warn!("failed to delete control bus: {}", e);
                }
            } else {
                debug!("leaving shared control bus to its owner");
            }
        }

        if let Some(pool) = self.pool.take() {
            debug!("releasing {} frame buffers", pool.len());
        }
        self.channel = None;
    }

    fn is_empty(&self) -> bool {
        self.channel.is_none()
            && self.pool.is_none()
            && self.bus.is_none()
            && self.sensor.is_none()
            && self.controller.is_none()
            && self.processor.is_none()
    }
}

/// One camera capture pipeline.
pub struct Pipeline<P: Platform> {
    config: CaptureConfig,
    platform: P,
    registry: SensorRegistry,
    state: PipelineState,
    res: Resources,
}

impl<P: Platform> Pipeline<P> {
    pub fn new(config: CaptureConfig, platform: P, registry: SensorRegistry) -> Self {
        Self {
            config,
            platform,
            registry,
            state: PipelineState::Uninit,
            res: Resources::default(),
        }
    }

    /// Brings up the whole pipeline.
    ///
    /// `bus` reuses a control bus shared with other peripherals; it is
    /// never deleted by the pipeline. With `None` a bus is created from the
    /// configuration and deleted on teardown.
    ///
    /// # Errors
    ///
    /// - [`CaptureError::InvalidState`] if already initialized. Nothing is
    ///   changed in that case.
    /// - [`CaptureError::NoMemory`] if frame buffers cannot be allocated.
    /// - [`CaptureError::NotFound`], [`CaptureError::InvalidArgument`] from
    ///   sensor discovery.
    /// - [`CaptureError::NotSupported`] if the sensor lacks the configured
    ///   format.
    /// - [`CaptureError::IoError`] from any hardware call.
    ///
    /// On any error every resource acquired so far is released and the
    /// pipeline is back in [`PipelineState::Uninit`].
    pub fn init(&mut self, bus: Option<SharedBus>) -> Result<()> {
        if self.state != PipelineState::Uninit {
            error!("Camera pipeline already initialized");
            return Err(CaptureError::InvalidState(format!(
                "cannot init from {}",
                self.state
            )));
        }

        self.state = PipelineState::Initializing;
        match self.bring_up(bus) {
            Ok(()) => {
                self.state = PipelineState::Ready;
                info!(
                    "camera pipeline ready: {} buffers of {} bytes",
                    self.config.buffer_count,
                    self.config.frame_len()
                );
                Ok(())
            }
            Err(e) => {
                self.res.release();
                self.state = PipelineState::Uninit;
                Err(e)
            }
        }
    }

    fn bring_up(&mut self, bus: Option<SharedBus>) -> Result<()> {
        let config = &self.config;
        let platform = &mut self.platform;
        let res = &mut self.res;

        let channel =
            CompletionChannel::new(config.buffer_count).map_err(stage_failed("create image queue"))?;
        let sender = channel.sender();
        res.channel = Some(channel);

        let frame_len = config.frame_len();
        let mut memories = Vec::with_capacity(config.buffer_count);
        for _ in 0..config.buffer_count {
            let memory = platform
                .allocate_frame(frame_len, config.memory)
                .map_err(stage_failed("allocate frame buffer"))?;
            platform
                .sync_for_device(&memory)
                .map_err(stage_failed("sync cache for frame buffer"))?;
            memories.push(memory);
        }
        let pool = Arc::new(BufferPool::new(memories)?);
        res.pool = Some(pool.clone());

        let bus = match bus {
            Some(bus) => BusSlot { bus, owned: false },
            None => {
                let bus = platform
                    .new_control_bus(&config.bus)
                    .map_err(stage_failed("create control bus"))?;
                BusSlot {
                    bus: Arc::new(Mutex::new(bus)),
                    owned: true,
                }
            }
        };
        let shared = bus.bus.clone();
        res.bus = Some(bus);

        let sensor = discover(
            lock_bus(&shared).as_mut(),
            &self.registry,
            &config.sccb,
            config.sensor_interface,
        )?;
        let sensor = res.sensor.insert(sensor);

        let format = negotiate_format(sensor.as_mut(), config.format_name())
            .map_err(stage_failed("set camera sensor format"))?;
        res.format = Some(format);

        if config.mirror != MirrorSetting::None {
            let (horizontal, vertical) = config.mirror.flags();
            sensor
                .set_mirror(horizontal, vertical)
                .map_err(stage_failed("set camera sensor mirror"))?;
        }

        sensor
            .set_stream(true)
            .map_err(stage_failed("start camera sensor stream"))?;
        res.sensor_streaming = true;

        let controller = platform
            .new_capture_controller(&config.csi_config())
            .map_err(stage_failed("create CSI controller"))?;
        let controller = res.controller.insert(controller);

        let adapter = Arc::new(CaptureAdapter::new(pool, sender));
        res.adapter = Some(adapter.clone());
        controller
            .register_events(adapter)
            .map_err(stage_failed("register capture controller callbacks"))?;

        controller
            .enable()
            .map_err(stage_failed("enable capture controller"))?;
        res.controller_enabled = true;

        if let Some(isp) = config.isp_config() {
            let processor = platform
                .new_image_processor(&isp)
                .map_err(stage_failed("create image processor"))?;
            let processor = res.processor.insert(processor);
            processor
                .enable()
                .map_err(stage_failed("enable image processor"))?;
            res.processor_enabled = true;
        }

        Ok(())
    }

    /// Starts the capture controller and primes it with the first buffer.
    ///
    /// # Errors
    ///
    /// - [`CaptureError::InvalidState`] unless the pipeline is `Ready` or
    ///   `Stopped`.
    /// - [`CaptureError::NoMemory`] if consumers hold every buffer.
    /// - Any controller error; the pipeline state is left unchanged.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Ready | PipelineState::Stopped => {}
            PipelineState::Streaming => {
                return Err(CaptureError::InvalidState(
                    "pipeline is already streaming".to_string(),
                ))
            }
            _ => {
                return Err(CaptureError::InvalidState(
                    "pipeline is not initialized".to_string(),
                ))
            }
        }

        let timeout = Duration::from_millis(self.config.prime_timeout_ms);
        let Resources {
            pool,
            controller,
            controller_started,
            ..
        } = &mut self.res;
        let (Some(pool), Some(controller)) = (pool.as_ref(), controller.as_mut()) else {
            return Err(CaptureError::InvalidState(
                "pipeline has no capture controller".to_string(),
            ));
        };

        // Left running by a priming failure whose stop also failed.
        if *controller_started {
            controller.stop()?;
            *controller_started = false;
        }

        let buf = pool.acquire_free().ok_or_else(|| {
            CaptureError::NoMemory("no free frame buffer to prime the controller".to_string())
        })?;
        let Some(target) = pool.target(buf) else {
            pool.release(buf);
            return Err(CaptureError::InvalidState("buffer left the pool".to_string()));
        };

        if let Err(e) = controller.start() {
            error!("Failed to start camera controller: {}", e);
            pool.release(buf);
            return Err(e);
        }
        *controller_started = true;

        if let Err(e) = controller.receive(target, timeout) {
            error!("Failed to receive camera data: {}", e);
            match controller.stop() {
                Ok(()) => *controller_started = false,
                Err(e) => warn!("failed to stop camera controller after priming: {}", e),
            }
            pool.release(buf);
            return Err(e);
        }

        self.state = PipelineState::Streaming;
        info!("camera streaming started");
        Ok(())
    }

    /// Waits up to `timeout` for the oldest completed frame. A timeout only
    /// fails this call, the pipeline keeps streaming.
    pub fn recv_frame(&self, timeout: Duration) -> Result<Frame> {
        self.frames()?.recv(timeout)
    }

    /// Returns a frame's buffer to the pool. Equivalent to dropping it.
    pub fn release(&self, frame: Frame) {
        drop(frame);
    }

    /// A consumer handle that can be moved to another thread.
    pub fn frames(&self) -> Result<FrameReceiver> {
        match (&self.res.channel, &self.res.pool) {
            (Some(channel), Some(pool)) => Ok(channel.frame_receiver(pool.clone())),
            _ => Err(CaptureError::InvalidState(
                "pipeline is not initialized".to_string(),
            )),
        }
    }

    /// Halts capture and returns every queued frame to the pool.
    ///
    /// A hardware stop failure is returned, but only after draining.
    pub fn stop(&mut self) -> Result<()> {
        if matches!(
            self.state,
            PipelineState::Uninit | PipelineState::Initializing
        ) {
            return Err(CaptureError::InvalidState(
                "pipeline is not initialized".to_string(),
            ));
        }

        let Resources {
            channel,
            pool,
            controller,
            controller_started,
            ..
        } = &mut self.res;

        let mut result = Ok(());
        let mut halted = false;
        if self.state == PipelineState::Streaming {
            if let Some(controller) = controller.as_mut() {
                match controller.stop() {
                    Ok(()) => {
                        *controller_started = false;
                        halted = true;
                    }
                    Err(e) => {
                        error!("Failed to stop camera controller: {}", e);
                        result = Err(e);
                    }
                }
            }
        }

        if let (Some(channel), Some(pool)) = (channel.as_ref(), pool.as_ref()) {
            let drained = channel
                .drain_nonblocking()
                .filter(|buf| pool.release(*buf))
                .count();
            let reclaimed = if halted { pool.reclaim_in_flight() } else { 0 };
            debug!(
                "stop drained {} queued and reclaimed {} in-flight buffers",
                drained, reclaimed
            );
        }

        self.state = PipelineState::Stopped;
        info!("camera streaming stopped");
        result
    }

    /// Captures a single frame outside of streaming.
    ///
    /// Valid from `Ready` or `Stopped`. Starts the controller, submits one
    /// buffer, waits up to `timeout` for it, then stops the controller again
    /// and returns every other buffer to the pool. The pipeline state is
    /// unchanged.
    pub fn take_picture(&mut self, timeout: Duration) -> Result<Frame> {
        match self.state {
            PipelineState::Ready | PipelineState::Stopped => {}
            PipelineState::Streaming => {
                return Err(CaptureError::InvalidState(
                    "stop streaming before taking a picture".to_string(),
                ))
            }
            _ => {
                return Err(CaptureError::InvalidState(
                    "pipeline is not initialized".to_string(),
                ))
            }
        }

        let receiver = self.frames()?;
        let Resources {
            channel,
            controller,
            controller_started,
            ..
        } = &mut self.res;
        let (Some(channel), Some(controller)) = (channel.as_ref(), controller.as_mut()) else {
            return Err(CaptureError::InvalidState(
                "pipeline has no capture controller".to_string(),
            ));
        };
        let pool = receiver.pool().clone();

        let buf = pool
            .acquire_free()
            .ok_or_else(|| CaptureError::NoMemory("no free frame buffer".to_string()))?;
        let Some(target) = pool.target(buf) else {
            pool.release(buf);
            return Err(CaptureError::InvalidState("buffer left the pool".to_string()));
        };

        if let Err(e) = controller.start() {
            error!("Failed to start camera controller: {}", e);
            pool.release(buf);
            return Err(e);
        }
        *controller_started = true;

        let captured = controller
            .receive(target, timeout)
            .and_then(|()| receiver.recv(timeout));

        match controller.stop() {
            Ok(()) => {
                *controller_started = false;
                for buf in channel.drain_nonblocking() {
                    pool.release(buf);
                }
                pool.reclaim_in_flight();
            }
            Err(e) => warn!("failed to stop camera controller after capture: {}", e),
        }

        captured
    }

    /// Releases every handle. Safe from any state, any number of times.
    pub fn deinit(&mut self) {
        if self.res.is_empty() && self.state == PipelineState::Uninit {
            return;
        }
        self.res.release();
        self.state = PipelineState::Uninit;
        info!("camera pipeline deinitialized");
    }

    /// Changes the sensor mirroring while initialized.
    pub fn set_mirror(&mut self, mirror: MirrorSetting) -> Result<()> {
        let sensor = self
            .res
            .sensor
            .as_mut()
            .ok_or_else(|| CaptureError::InvalidState("no sensor attached".to_string()))?;
        let (horizontal, vertical) = mirror.flags();
        sensor.set_mirror(horizontal, vertical)?;
        self.config.mirror = mirror;
        Ok(())
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Number of allocated frame buffers, zero when torn down.
    pub fn buffer_count(&self) -> usize {
        self.res.pool.as_ref().map_or(0, |pool| pool.len())
    }

    pub fn pool(&self) -> Option<&Arc<BufferPool>> {
        self.res.pool.as_ref()
    }

    pub fn sensor_name(&self) -> Option<&str> {
        self.res.sensor.as_ref().map(|sensor| sensor.name())
    }

    pub fn sensor_format(&self) -> Option<&SensorFormat> {
        self.res.format.as_ref()
    }

    /// Completion path counters since the last `init`.
    pub fn stats(&self) -> PipelineStats {
        self.res
            .adapter
            .as_ref()
            .map(|adapter| adapter.stats())
            .unwrap_or_default()
    }
}

impl<P: Platform> Drop for Pipeline<P> {
    fn drop(&mut self) {
        self.deinit();
    }
}
