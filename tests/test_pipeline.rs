// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_capture::{
    config::{CaptureConfig, FramePreset, MirrorSetting},
    hal::{DmaAddr, SensorInterface},
    pipeline::{Pipeline, PipelineState},
    sensor::SensorRegistry,
    virtual_platform::{
        FaultPoint, HwEvent, Ledger, LiveHandles, VirtualHardware, VirtualPlatform,
    },
    BufferState, CaptureError,
};
use serial_test::serial;
use std::{
    error::Error,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

const SENSOR: &str = "SC2336";
const ADDRESS: u16 = 0x30;
const FRAME_LEN: usize = 800 * 640 * 2;
const SHORT: Duration = Duration::from_millis(20);

struct Rig {
    pipeline: Pipeline<VirtualPlatform>,
    platform: VirtualPlatform,
    ledger: Ledger,
    hw: VirtualHardware,
}

fn rig_with(config: CaptureConfig, platform: VirtualPlatform) -> Rig {
    let registry = SensorRegistry::new().with(platform.sensor(SENSOR, ADDRESS));
    let ledger = platform.ledger();
    let hw = platform.hardware();
    Rig {
        pipeline: Pipeline::new(config, platform.clone(), registry),
        platform,
        ledger,
        hw,
    }
}

fn rig(buffers: usize) -> Rig {
    let config = CaptureConfig {
        buffer_count: buffers,
        ..CaptureConfig::default()
    };
    rig_with(config, VirtualPlatform::new())
}

/// Asserts the pipeline holds nothing and the platform has no live handles.
fn assert_torn_down(rig: &Rig) {
    assert_eq!(rig.pipeline.state(), PipelineState::Uninit);
    assert_eq!(rig.pipeline.buffer_count(), 0);
    assert!(rig.pipeline.pool().is_none());
    assert!(rig.pipeline.sensor_name().is_none());
    assert_eq!(rig.ledger.live(), LiveHandles::default());
}

#[test]
fn test_init() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(3);
    rig.pipeline.init(None)?;

    assert_eq!(rig.pipeline.state(), PipelineState::Ready);
    assert_eq!(rig.pipeline.buffer_count(), 3);
    assert_eq!(rig.pipeline.sensor_name(), Some(SENSOR));
    assert_eq!(
        rig.pipeline.sensor_format(),
        Some(&FramePreset::Res800x640.sensor_format())
    );
    assert_eq!(
        rig.ledger.live(),
        LiveHandles {
            buses: 1,
            devices: 1,
            controllers: 1,
            processors: 1,
        }
    );

    let pool = rig.pipeline.pool().ok_or("no pool")?;
    let registered = rig
        .ledger
        .position(&HwEvent::EventsRegistered)
        .ok_or("events not registered")?;
    for buf in pool.buffers() {
        assert_eq!(pool.state(buf), Some(BufferState::Free));
        assert_eq!(pool.capacity(buf), FRAME_LEN);
        let addr = pool.target(buf).ok_or("no target")?.addr;
        let synced = rig
            .ledger
            .position(&HwEvent::FrameSynced { addr })
            .ok_or("frame not synced")?;
        assert!(synced < registered);
    }
    assert_eq!(
        rig.ledger.count(&HwEvent::FrameAllocated { len: FRAME_LEN }),
        3
    );
    assert!(rig.ledger.contains(&HwEvent::FormatSet(
        "MIPI_2lane_24Minput_RAW8_800x640_50fps".to_string()
    )));
    assert!(rig.ledger.contains(&HwEvent::SensorStream(true)));
    assert!(rig.ledger.contains(&HwEvent::ControllerEnabled));
    assert!(rig.ledger.contains(&HwEvent::ProcessorEnabled));
    assert!(!rig.hw.is_running());

    rig.pipeline.deinit();
    assert_torn_down(&rig);

    Ok(())
}

#[test]
fn test_init_twice() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(1);
    rig.pipeline.init(None)?;
    let live = rig.ledger.live();
    let events = rig.ledger.events().len();

    let result = rig.pipeline.init(None);
    assert!(matches!(result, Err(CaptureError::InvalidState(_))));
    assert_eq!(rig.pipeline.state(), PipelineState::Ready);
    assert_eq!(rig.ledger.live(), live);
    assert_eq!(rig.ledger.events().len(), events);

    Ok(())
}

#[test]
fn test_init_zero_buffers() {
    let mut rig = rig(0);
    let result = rig.pipeline.init(None);
    assert!(matches!(result, Err(CaptureError::InvalidArgument(_))));
    assert_torn_down(&rig);
}

#[test]
fn test_init_rollback_at_every_stage() -> Result<(), Box<dyn Error>> {
    let stages = [
        FaultPoint::FrameAlloc,
        FaultPoint::CacheSync,
        FaultPoint::BusCreate,
        FaultPoint::DeviceOpen,
        FaultPoint::QueryFormats,
        FaultPoint::SetFormat,
        FaultPoint::SetMirror,
        FaultPoint::SensorStream,
        FaultPoint::ControllerCreate,
        FaultPoint::RegisterEvents,
        FaultPoint::ControllerEnable,
        FaultPoint::ProcessorCreate,
        FaultPoint::ProcessorEnable,
    ];

    for stage in stages {
        let config = CaptureConfig {
            buffer_count: 2,
            mirror: MirrorSetting::Both,
            ..CaptureConfig::default()
        };
        let mut rig = rig_with(config, VirtualPlatform::new());
        rig.platform.fail_at(stage);

        let result = rig.pipeline.init(None);
        println!("{:?}: {:?}", stage, result);
        match stage {
            FaultPoint::FrameAlloc => {
                assert!(matches!(result, Err(CaptureError::NoMemory(_))))
            }
            _ => assert!(matches!(result, Err(CaptureError::IoError(_)))),
        }
        assert_torn_down(&rig);

        // The failed attempt leaves nothing behind that blocks a retry.
        rig.platform.clear_fault(stage);
        rig.pipeline.init(None)?;
        assert_eq!(rig.pipeline.state(), PipelineState::Ready);
        rig.pipeline.deinit();
        assert_torn_down(&rig);
    }

    Ok(())
}

#[test]
fn test_init_rollback_order() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(1);
    rig.platform.fail_at(FaultPoint::ProcessorEnable);
    assert!(rig.pipeline.init(None).is_err());

    let order = [
        HwEvent::ProcessorDeleted,
        HwEvent::ControllerDisabled,
        HwEvent::ControllerDeleted,
        HwEvent::SensorStream(false),
        HwEvent::DeviceClosed(ADDRESS),
        HwEvent::BusDeleted,
    ];
    let positions = order
        .iter()
        .map(|event| rig.ledger.position(event).ok_or(format!("missing {event:?}")))
        .collect::<Result<Vec<_>, _>>()?;
    assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));

    // The processor never came up, so it is not disabled.
    assert!(!rig.ledger.contains(&HwEvent::ProcessorDisabled));
    assert_torn_down(&rig);

    Ok(())
}

#[test]
fn test_init_sensor_missing() {
    let platform = VirtualPlatform::new();
    let registry = SensorRegistry::new().with(platform.sensor(SENSOR, ADDRESS).absent());
    let ledger = platform.ledger();
    let mut pipeline = Pipeline::new(CaptureConfig::default(), platform, registry);

    let result = pipeline.init(None);
    assert!(matches!(result, Err(CaptureError::NotFound(_))));
    assert_eq!(pipeline.state(), PipelineState::Uninit);
    assert_eq!(pipeline.buffer_count(), 0);
    assert_eq!(ledger.live(), LiveHandles::default());
}

#[test]
fn test_init_sensor_wrong_interface() {
    let platform = VirtualPlatform::new();
    let registry = SensorRegistry::new().with(
        platform
            .sensor(SENSOR, ADDRESS)
            .interface(SensorInterface::Dvp),
    );
    let ledger = platform.ledger();
    let mut pipeline = Pipeline::new(CaptureConfig::default(), platform, registry);

    let result = pipeline.init(None);
    assert!(matches!(result, Err(CaptureError::InvalidArgument(_))));
    assert_eq!(pipeline.state(), PipelineState::Uninit);
    assert_eq!(ledger.live(), LiveHandles::default());
}

#[test]
fn test_init_format_not_supported() {
    let platform = VirtualPlatform::new();
    let registry = SensorRegistry::new().with(
        platform
            .sensor(SENSOR, ADDRESS)
            .formats(vec![FramePreset::Res1024x600.sensor_format()]),
    );
    let ledger = platform.ledger();
    let mut pipeline = Pipeline::new(CaptureConfig::default(), platform, registry);

    let result = pipeline.init(None);
    assert!(matches!(result, Err(CaptureError::NotSupported(_))));
    assert_eq!(pipeline.state(), PipelineState::Uninit);
    assert_eq!(ledger.live(), LiveHandles::default());
}

#[test]
fn test_external_bus_kept() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(1);
    let bus = rig.platform.external_bus();

    rig.pipeline.init(Some(bus.clone()))?;
    assert_eq!(rig.ledger.count(&HwEvent::BusCreated), 1);
    rig.pipeline.deinit();
    assert!(!rig.ledger.contains(&HwEvent::BusDeleted));
    assert_eq!(rig.ledger.live().buses, 1);
    assert_eq!(rig.ledger.live().devices, 0);

    // Rollback also leaves a shared bus alone.
    rig.platform.fail_at(FaultPoint::ControllerCreate);
    assert!(rig.pipeline.init(Some(bus.clone())).is_err());
    assert!(!rig.ledger.contains(&HwEvent::BusDeleted));
    assert_eq!(rig.ledger.live().buses, 1);

    // The owner can still use it.
    rig.platform.clear_fault(FaultPoint::ControllerCreate);
    rig.pipeline.init(Some(bus))?;
    assert_eq!(rig.pipeline.state(), PipelineState::Ready);

    Ok(())
}

#[test]
fn test_frame_round_trip() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(1);
    rig.pipeline.init(None)?;
    assert_eq!(rig.pipeline.config().frame_len(), 1_024_000);

    rig.pipeline.start()?;
    assert_eq!(rig.pipeline.state(), PipelineState::Streaming);
    assert!(rig.hw.is_running());
    assert_eq!(rig.hw.pending(), 1);

    assert!(rig.hw.complete_frame());
    let frame = rig.pipeline.recv_frame(SHORT)?;
    println!("{}", frame);
    assert_eq!(frame.index(), 0);
    assert_eq!(frame.received_len(), 1_024_000);
    assert_eq!(frame.data().len(), 1_024_000);
    assert_eq!(frame.state(), BufferState::Held);
    let addr = frame.addr();

    // The only buffer is held, so the hardware runs the next cycle
    // without a target.
    assert!(!rig.hw.complete_frame());
    assert_eq!(rig.pipeline.stats().starved_requests, 1);
    assert_eq!(rig.pipeline.recv_frame(SHORT).err(), Some(CaptureError::Timeout));

    rig.pipeline.release(frame);
    let pool = rig.pipeline.pool().ok_or("no pool")?;
    assert_eq!(pool.free_count(), 1);

    assert!(rig.hw.complete_frame());
    let frame = rig.pipeline.recv_frame(SHORT)?;
    assert_eq!(frame.index(), 0);
    assert_eq!(frame.addr(), addr);
    drop(frame);

    assert_eq!(rig.pipeline.stats().completed, 2);
    rig.pipeline.stop()?;
    rig.pipeline.deinit();
    assert_torn_down(&rig);

    Ok(())
}

#[test]
fn test_release_by_buffer_keeps_frame_held() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(1);
    rig.pipeline.init(None)?;
    rig.pipeline.start()?;
    let pool = rig.pipeline.pool().ok_or("no pool")?.clone();

    assert!(rig.hw.complete_frame());
    let first = rig.pipeline.recv_frame(SHORT)?;

    // Releasing the slot behind a live frame's back is refused, so the
    // hardware cannot refill it while the frame is readable.
    assert!(!pool.release(first.buffer()));
    assert_eq!(first.state(), BufferState::Held);
    assert!(!rig.hw.complete_frame());
    assert!(rig.hw.request_buffer().is_none());

    rig.pipeline.release(first);
    assert!(rig.hw.complete_frame());
    let second = rig.pipeline.recv_frame(SHORT)?;
    assert_eq!(second.index(), 0);
    assert!(!pool.release(second.buffer()));
    assert_eq!(second.state(), BufferState::Held);

    drop(second);
    assert_eq!(pool.state(pool.buffers().next().ok_or("buffer")?), Some(BufferState::Free));

    rig.pipeline.stop()?;
    rig.pipeline.deinit();
    assert_torn_down(&rig);

    Ok(())
}

#[test]
fn test_completion_order() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(3);
    rig.pipeline.init(None)?;
    rig.pipeline.start()?;

    for _ in 0..3 {
        assert!(rig.hw.complete_frame());
    }
    assert!(!rig.hw.complete_frame());

    let frames = (0..3)
        .map(|_| rig.pipeline.recv_frame(SHORT))
        .collect::<Result<Vec<_>, _>>()?;
    let indices: Vec<_> = frames.iter().map(|frame| frame.index()).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    drop(frames);

    let pool = rig.pipeline.pool().ok_or("no pool")?;
    assert_eq!(pool.free_count(), 3);

    Ok(())
}

#[test]
fn test_short_transfer() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(1);
    rig.pipeline.init(None)?;
    rig.pipeline.start()?;

    assert!(rig.hw.complete_frame_with(4000));
    let frame = rig.pipeline.recv_frame(SHORT)?;
    assert_eq!(frame.received_len(), 4000);
    assert_eq!(frame.capacity(), FRAME_LEN);

    Ok(())
}

#[test]
fn test_recv_timeout_keeps_streaming() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(2);
    rig.pipeline.init(None)?;
    rig.pipeline.start()?;

    let result = rig.pipeline.recv_frame(SHORT);
    assert!(result.as_ref().is_err_and(|e| e.is_timeout()));
    assert_eq!(rig.pipeline.state(), PipelineState::Streaming);

    assert!(rig.hw.complete_frame());
    let frame = rig.pipeline.recv_frame(SHORT)?;
    assert_eq!(frame.index(), 0);

    Ok(())
}

#[test]
fn test_unresolved_completions() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(2);
    rig.pipeline.init(None)?;
    rig.pipeline.start()?;

    assert!(rig.hw.report_completion(None, 0));
    assert!(rig.hw.report_completion(Some(DmaAddr(0x10)), FRAME_LEN));
    assert_eq!(rig.pipeline.stats().unresolved_completions, 2);
    assert_eq!(rig.pipeline.recv_frame(SHORT).err(), Some(CaptureError::Timeout));

    // A duplicate report for a buffer already completed is ignored.
    assert!(rig.hw.complete_frame());
    let pool = rig.pipeline.pool().ok_or("no pool")?.clone();
    let first = pool.buffers().next().ok_or("no buffer")?;
    let addr = pool.target(first).ok_or("no target")?.addr;
    assert!(rig.hw.report_completion(Some(addr), FRAME_LEN));
    assert_eq!(rig.pipeline.stats().unresolved_completions, 3);
    assert_eq!(rig.pipeline.stats().completed, 1);

    let frame = rig.pipeline.recv_frame(SHORT)?;
    assert_eq!(frame.index(), first.index());
    assert_eq!(rig.pipeline.recv_frame(SHORT).err(), Some(CaptureError::Timeout));

    Ok(())
}

#[test]
fn test_start_invalid_states() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(1);
    assert!(matches!(
        rig.pipeline.start(),
        Err(CaptureError::InvalidState(_))
    ));

    rig.pipeline.init(None)?;
    rig.pipeline.start()?;
    assert!(matches!(
        rig.pipeline.start(),
        Err(CaptureError::InvalidState(_))
    ));
    assert_eq!(rig.pipeline.state(), PipelineState::Streaming);

    Ok(())
}

#[test]
fn test_start_failures_leave_ready() -> Result<(), Box<dyn Error>> {
    for stage in [FaultPoint::ControllerStart, FaultPoint::ControllerReceive] {
        let mut rig = rig(2);
        rig.pipeline.init(None)?;
        rig.platform.fail_at(stage);

        assert!(matches!(
            rig.pipeline.start(),
            Err(CaptureError::IoError(_))
        ));
        assert_eq!(rig.pipeline.state(), PipelineState::Ready);
        assert!(!rig.hw.is_running());
        let pool = rig.pipeline.pool().ok_or("no pool")?;
        assert_eq!(pool.free_count(), 2);

        rig.platform.clear_fault(stage);
        rig.pipeline.start()?;
        assert_eq!(rig.pipeline.state(), PipelineState::Streaming);
    }

    Ok(())
}

#[test]
fn test_start_after_failed_priming_stop() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(2);
    rig.pipeline.init(None)?;
    rig.platform.fail_at(FaultPoint::ControllerReceive);
    rig.platform.fail_at(FaultPoint::ControllerStop);

    assert!(rig.pipeline.start().is_err());
    assert_eq!(rig.pipeline.state(), PipelineState::Ready);
    assert!(rig.hw.is_running());

    // The controller left running is stopped before it is started again.
    rig.platform.clear_fault(FaultPoint::ControllerReceive);
    rig.platform.clear_fault(FaultPoint::ControllerStop);
    rig.ledger.clear_events();
    rig.pipeline.start()?;
    assert_eq!(rig.pipeline.state(), PipelineState::Streaming);
    let stopped = rig
        .ledger
        .position(&HwEvent::ControllerStopped)
        .ok_or("controller not stopped")?;
    let started = rig
        .ledger
        .position(&HwEvent::ControllerStarted)
        .ok_or("controller not started")?;
    assert!(stopped < started);
    assert_eq!(rig.ledger.count(&HwEvent::ControllerStarted), 1);

    rig.pipeline.stop()?;
    let pool = rig.pipeline.pool().ok_or("no pool")?;
    assert_eq!(pool.free_count(), 2);

    Ok(())
}

#[test]
fn test_start_without_free_buffer() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(1);
    rig.pipeline.init(None)?;
    rig.pipeline.start()?;
    assert!(rig.hw.complete_frame());
    let frame = rig.pipeline.recv_frame(SHORT)?;
    rig.pipeline.stop()?;

    assert!(matches!(
        rig.pipeline.start(),
        Err(CaptureError::NoMemory(_))
    ));
    assert_eq!(rig.pipeline.state(), PipelineState::Stopped);
    assert!(!rig.hw.is_running());

    drop(frame);
    rig.pipeline.start()?;
    assert_eq!(rig.pipeline.state(), PipelineState::Streaming);

    Ok(())
}

#[test]
fn test_stop_drains_queue() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(3);
    rig.pipeline.init(None)?;
    rig.pipeline.start()?;

    assert!(rig.hw.complete_frame());
    assert!(rig.hw.complete_frame());
    let pool = rig.pipeline.pool().ok_or("no pool")?.clone();
    assert_eq!(pool.count(BufferState::Ready), 2);

    rig.pipeline.stop()?;
    assert_eq!(rig.pipeline.state(), PipelineState::Stopped);
    assert!(!rig.hw.is_running());
    assert_eq!(pool.free_count(), 3);
    assert_eq!(rig.pipeline.recv_frame(SHORT).err(), Some(CaptureError::Timeout));

    // Restarting streams from a clean pool.
    rig.pipeline.start()?;
    assert!(rig.hw.complete_frame());
    let frame = rig.pipeline.recv_frame(SHORT)?;
    assert_eq!(frame.index(), 0);

    Ok(())
}

#[test]
fn test_stop_reclaims_primed_buffer() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(2);
    rig.pipeline.init(None)?;
    rig.pipeline.start()?;
    let pool = rig.pipeline.pool().ok_or("no pool")?.clone();
    assert_eq!(pool.count(BufferState::InFlight), 1);

    rig.pipeline.stop()?;
    assert_eq!(pool.free_count(), 2);
    assert_eq!(rig.hw.pending(), 0);

    Ok(())
}

#[test]
fn test_stop_keeps_held_frames() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(2);
    rig.pipeline.init(None)?;
    rig.pipeline.start()?;
    assert!(rig.hw.complete_frame());
    let frame = rig.pipeline.recv_frame(SHORT)?;

    rig.pipeline.stop()?;
    assert_eq!(frame.state(), BufferState::Held);
    assert_eq!(frame.data().len(), FRAME_LEN);

    let pool = rig.pipeline.pool().ok_or("no pool")?.clone();
    drop(frame);
    assert_eq!(pool.free_count(), 2);

    Ok(())
}

#[test]
fn test_stop_failure_still_drains() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(2);
    rig.pipeline.init(None)?;
    rig.pipeline.start()?;
    assert!(rig.hw.complete_frame());
    assert!(rig.hw.request_buffer().is_some());

    rig.platform.fail_at(FaultPoint::ControllerStop);
    assert!(matches!(rig.pipeline.stop(), Err(CaptureError::IoError(_))));
    assert_eq!(rig.pipeline.state(), PipelineState::Stopped);

    // The queued frame went back to the pool; the in-flight one stays with
    // the hardware that failed to halt.
    let pool = rig.pipeline.pool().ok_or("no pool")?.clone();
    assert_eq!(pool.count(BufferState::Ready), 0);
    assert_eq!(pool.count(BufferState::InFlight), 1);

    rig.platform.clear_fault(FaultPoint::ControllerStop);
    rig.pipeline.deinit();
    assert_torn_down(&rig);

    Ok(())
}

#[test]
fn test_stop_states() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(1);
    assert!(matches!(
        rig.pipeline.stop(),
        Err(CaptureError::InvalidState(_))
    ));

    rig.pipeline.init(None)?;
    rig.pipeline.stop()?;
    assert_eq!(rig.pipeline.state(), PipelineState::Stopped);
    assert!(!rig.ledger.contains(&HwEvent::ControllerStopped));

    rig.pipeline.start()?;
    rig.pipeline.stop()?;
    rig.pipeline.stop()?;
    assert_eq!(rig.ledger.count(&HwEvent::ControllerStopped), 1);

    Ok(())
}

#[test]
fn test_deinit_from_every_state() -> Result<(), Box<dyn Error>> {
    // Uninit: nothing to do.
    let mut rig = rig(2);
    rig.pipeline.deinit();
    assert!(rig.ledger.events().is_empty());
    assert_torn_down(&rig);

    // Ready
    rig.pipeline.init(None)?;
    rig.pipeline.deinit();
    assert_torn_down(&rig);

    // Streaming
    rig.pipeline.init(None)?;
    rig.pipeline.start()?;
    assert!(rig.hw.complete_frame());
    rig.pipeline.deinit();
    assert_torn_down(&rig);
    assert!(!rig.hw.is_running());

    // Stopped
    rig.pipeline.init(None)?;
    rig.pipeline.start()?;
    rig.pipeline.stop()?;
    rig.pipeline.deinit();
    assert_torn_down(&rig);

    // Repeated
    rig.pipeline.deinit();
    assert_torn_down(&rig);

    Ok(())
}

#[test]
fn test_deinit_order_while_streaming() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(1);
    rig.pipeline.init(None)?;
    rig.pipeline.start()?;
    rig.ledger.clear_events();

    rig.pipeline.deinit();
    assert_eq!(
        rig.ledger.events(),
        vec![
            HwEvent::ProcessorDisabled,
            HwEvent::ProcessorDeleted,
            HwEvent::ControllerStopped,
            HwEvent::ControllerDisabled,
            HwEvent::ControllerDeleted,
            HwEvent::SensorStream(false),
            HwEvent::DeviceClosed(ADDRESS),
            HwEvent::BusDeleted,
        ]
    );

    Ok(())
}

#[test]
fn test_frame_outlives_deinit() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(1);
    rig.pipeline.init(None)?;
    let frames = rig.pipeline.frames()?;
    rig.pipeline.start()?;
    assert!(rig.hw.complete_frame_with(64));
    let frame = frames.recv(SHORT)?;

    rig.pipeline.deinit();
    assert_torn_down(&rig);
    assert_eq!(frame.data().len(), 64);
    drop(frame);

    // With every producer gone the consumer handle reports the teardown.
    assert!(matches!(
        frames.recv(SHORT),
        Err(CaptureError::InvalidState(_))
    ));
    assert!(matches!(
        rig.pipeline.frames(),
        Err(CaptureError::InvalidState(_))
    ));

    Ok(())
}

#[test]
fn test_drop_releases_everything() -> Result<(), Box<dyn Error>> {
    let platform = VirtualPlatform::new();
    let ledger = platform.ledger();
    {
        let registry = SensorRegistry::new().with(platform.sensor(SENSOR, ADDRESS));
        let mut pipeline = Pipeline::new(CaptureConfig::default(), platform.clone(), registry);
        pipeline.init(None)?;
        pipeline.start()?;
    }
    assert_eq!(ledger.live(), LiveHandles::default());
    assert!(ledger.contains(&HwEvent::BusDeleted));

    Ok(())
}

#[test]
fn test_mirror() -> Result<(), Box<dyn Error>> {
    let config = CaptureConfig {
        mirror: MirrorSetting::Both,
        ..CaptureConfig::default()
    };
    let mut rig = rig_with(config, VirtualPlatform::new());
    assert!(matches!(
        rig.pipeline.set_mirror(MirrorSetting::Horizontal),
        Err(CaptureError::InvalidState(_))
    ));

    rig.pipeline.init(None)?;
    let mirrored = rig
        .ledger
        .position(&HwEvent::MirrorSet {
            horizontal: true,
            vertical: true,
        })
        .ok_or("mirror not applied")?;
    let format = rig
        .ledger
        .position(&HwEvent::FormatSet(
            FramePreset::Res800x640.format_name().to_string(),
        ))
        .ok_or("format not set")?;
    let stream = rig
        .ledger
        .position(&HwEvent::SensorStream(true))
        .ok_or("stream not started")?;
    assert!(format < mirrored && mirrored < stream);

    rig.pipeline.set_mirror(MirrorSetting::Horizontal)?;
    assert!(rig.ledger.contains(&HwEvent::MirrorSet {
        horizontal: true,
        vertical: false,
    }));
    assert_eq!(rig.pipeline.config().mirror, MirrorSetting::Horizontal);

    Ok(())
}

#[test]
fn test_no_mirror_by_default() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(1);
    rig.pipeline.init(None)?;
    assert!(rig
        .ledger
        .events()
        .iter()
        .all(|event| !matches!(event, HwEvent::MirrorSet { .. })));

    Ok(())
}

#[test]
fn test_without_image_processor() -> Result<(), Box<dyn Error>> {
    let config = CaptureConfig {
        isp: None,
        ..CaptureConfig::default()
    };
    let mut rig = rig_with(config, VirtualPlatform::new());
    rig.platform.fail_at(FaultPoint::ProcessorCreate);

    rig.pipeline.init(None)?;
    assert!(!rig.ledger.contains(&HwEvent::ProcessorCreated));
    assert_eq!(rig.ledger.live().processors, 0);

    rig.pipeline.start()?;
    assert!(rig.hw.complete_frame());
    let frame = rig.pipeline.recv_frame(SHORT)?;
    assert_eq!(frame.received_len(), FRAME_LEN);

    Ok(())
}

#[test]
fn test_take_picture_states() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(1);
    assert!(matches!(
        rig.pipeline.take_picture(SHORT),
        Err(CaptureError::InvalidState(_))
    ));

    rig.pipeline.init(None)?;
    rig.pipeline.start()?;
    assert!(matches!(
        rig.pipeline.take_picture(SHORT),
        Err(CaptureError::InvalidState(_))
    ));

    Ok(())
}

#[test]
fn test_take_picture_timeout() -> Result<(), Box<dyn Error>> {
    let mut rig = rig(2);
    rig.pipeline.init(None)?;

    // Nobody drives the manual hardware, so the capture times out.
    assert_eq!(
        rig.pipeline.take_picture(SHORT).err(),
        Some(CaptureError::Timeout)
    );
    assert_eq!(rig.pipeline.state(), PipelineState::Ready);
    assert!(!rig.hw.is_running());
    let pool = rig.pipeline.pool().ok_or("no pool")?;
    assert_eq!(pool.free_count(), 2);

    Ok(())
}

#[test]
#[serial]
fn test_take_picture() -> Result<(), Box<dyn Error>> {
    let platform = VirtualPlatform::with_frame_interval(Duration::from_millis(2));
    let mut rig = rig_with(CaptureConfig::default(), platform);
    rig.pipeline.init(None)?;

    let frame = rig.pipeline.take_picture(Duration::from_secs(1))?;
    assert_eq!(frame.received_len(), FRAME_LEN);
    assert_eq!(frame.state(), BufferState::Held);
    assert_eq!(rig.pipeline.state(), PipelineState::Ready);
    assert!(!rig.hw.is_running());
    drop(frame);

    // Still usable for streaming afterwards.
    rig.pipeline.start()?;
    let frame = rig.pipeline.recv_frame(Duration::from_secs(1))?;
    assert_eq!(frame.index(), 0);

    Ok(())
}

#[test]
#[serial]
fn test_timer_streaming() -> Result<(), Box<dyn Error>> {
    let platform = VirtualPlatform::with_frame_interval(Duration::from_millis(2));
    let config = CaptureConfig {
        buffer_count: 3,
        ..CaptureConfig::default()
    };
    let mut rig = rig_with(config, platform);
    rig.pipeline.init(None)?;
    rig.pipeline.start()?;

    for _ in 0..20 {
        let frame = rig.pipeline.recv_frame(Duration::from_secs(1))?;
        assert_eq!(frame.received_len(), FRAME_LEN);
    }

    rig.pipeline.stop()?;
    assert!(!rig.hw.is_running());
    let pool = rig.pipeline.pool().ok_or("no pool")?;
    assert_eq!(pool.free_count(), 3);
    assert!(rig.pipeline.stats().completed >= 20);

    rig.pipeline.deinit();
    assert_torn_down(&rig);

    Ok(())
}

#[test]
#[serial]
fn test_consumer_thread() -> Result<(), Box<dyn Error>> {
    let platform = VirtualPlatform::with_frame_interval(Duration::from_millis(2));
    let config = CaptureConfig {
        buffer_count: 2,
        ..CaptureConfig::default()
    };
    let mut rig = rig_with(config, platform);
    rig.pipeline.init(None)?;
    let frames = rig.pipeline.frames()?;
    rig.pipeline.start()?;

    let consumer = thread::spawn(move || -> Result<usize, CaptureError> {
        let mut total = 0;
        for _ in 0..10 {
            let frame = frames.recv(Duration::from_secs(1))?;
            total += frame.received_len();
        }
        Ok(total)
    });

    let total = consumer.join().map_err(|_| "consumer panicked")??;
    assert_eq!(total, 10 * FRAME_LEN);

    rig.pipeline.stop()?;
    rig.pipeline.deinit();
    assert_torn_down(&rig);

    Ok(())
}

#[test]
fn test_completions_race_consumers_and_stop() -> Result<(), Box<dyn Error>> {
    const BUFFERS: usize = 3;
    const CONSUMERS: usize = 2;
    const RESTARTS: usize = 50;

    let mut rig = rig(BUFFERS);
    rig.pipeline.init(None)?;
    let pool = rig.pipeline.pool().ok_or("no pool")?.clone();
    let held: Arc<Vec<AtomicBool>> =
        Arc::new((0..BUFFERS).map(|_| AtomicBool::new(false)).collect());
    let violations = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));
    // Taken by the hardware for a whole request/finish cycle and around
    // stop, so a stopped controller has no transfer in progress.
    let gate = Arc::new(Mutex::new(()));

    let hardware = {
        let hw = rig.hw.clone();
        let pool = pool.clone();
        let held = held.clone();
        let violations = violations.clone();
        let done = done.clone();
        let gate = gate.clone();
        thread::spawn(move || {
            let mut cycles = 0;
            while !done.load(Ordering::Acquire) {
                let finished = {
                    let Ok(_cycle) = gate.lock() else {
                        break;
                    };
                    match hw.is_running().then(|| hw.request_buffer()).flatten() {
                        Some(target) => {
                            match pool.resolve(target.addr) {
                                Some(buf) if !held[buf.index()].load(Ordering::Acquire) => {}
                                _ => {
                                    violations.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            hw.report_completion(Some(target.addr), target.len)
                        }
                        None => false,
                    }
                };
                if finished {
                    cycles += 1;
                }
                thread::yield_now();
            }
            cycles
        })
    };

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| -> Result<_, CaptureError> {
            let frames = rig.pipeline.frames()?;
            let pool = pool.clone();
            let held = held.clone();
            let violations = violations.clone();
            let done = done.clone();
            Ok(thread::spawn(move || -> Result<usize, CaptureError> {
                let mut received = 0;
                while !done.load(Ordering::Acquire) {
                    let frame = match frames.recv(Duration::from_millis(5)) {
                        Ok(frame) => frame,
                        Err(CaptureError::Timeout) => continue,
                        Err(e) => return Err(e),
                    };
                    let index = frame.index();
                    if held[index].swap(true, Ordering::AcqRel) {
                        violations.fetch_add(1, Ordering::Relaxed);
                    }
                    if pool.release(frame.buffer()) || frame.state() != BufferState::Held {
                        violations.fetch_add(1, Ordering::Relaxed);
                    }
                    held[index].store(false, Ordering::Release);
                    drop(frame);
                    received += 1;
                }
                Ok(received)
            }))
        })
        .collect::<Result<_, _>>()?;

    for _ in 0..RESTARTS {
        rig.pipeline.start()?;
        thread::sleep(Duration::from_millis(2));
        let _halted = gate.lock().map_err(|_| "gate poisoned")?;
        rig.pipeline.stop()?;
    }

    done.store(true, Ordering::Release);
    let cycles = hardware.join().map_err(|_| "hardware panicked")?;
    let mut received = 0;
    for consumer in consumers {
        received += consumer.join().map_err(|_| "consumer panicked")??;
    }

    println!("{} hardware cycles, {} frames received", cycles, received);
    assert_eq!(violations.load(Ordering::Relaxed), 0);
    assert!(cycles > 0);
    assert!(received > 0);
    assert_eq!(pool.free_count(), BUFFERS);

    rig.pipeline.deinit();
    assert_torn_down(&rig);

    Ok(())
}
