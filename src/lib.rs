// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst Camera Frame Acquisition
//!
//! This library brings up a camera capture pipeline, streams frames from the
//! capture hardware through a fixed pool of DMA-capable buffers and hands
//! completed frames to consumers without ever blocking the hardware's
//! completion path.
//!
//! ## Features
//!
//! - **Buffer Pool**: A fixed set of frame buffers allocated once at
//!   bring-up, each with a lock-free ownership state shared between the
//!   completion path and consumer threads.
//! - **Completion Channel**: A bounded FIFO carrying completed buffers from
//!   the capture controller to consumers, with timeouts on the consumer side.
//! - **All-or-nothing Bring-up**: Sensor discovery, format negotiation,
//!   capture controller and image processor setup, rolled back in reverse
//!   order on any failure.
//! - **Virtual Platform**: A software implementation of every hardware
//!   collaborator for host testing, with fault injection and a handle ledger.
//!
//! ## Example
//!
//! ```no_run
//! use edgefirst_capture::{
//!     config::CaptureConfig, pipeline::Pipeline, sensor::SensorRegistry,
//!     virtual_platform::VirtualPlatform,
//! };
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let platform = VirtualPlatform::with_frame_interval(Duration::from_millis(20));
//! let registry = SensorRegistry::new().with(platform.sensor("SC2336", 0x30));
//!
//! let mut pipeline = Pipeline::new(CaptureConfig::default(), platform, registry);
//! pipeline.init(None)?;
//! pipeline.start()?;
//!
//! let frames = pipeline.frames()?;
//! let frame = frames.recv(Duration::from_secs(1))?;
//! println!("{} bytes", frame.received_len());
//! drop(frame);
//!
//! pipeline.stop()?;
//! pipeline.deinit();
//! # Ok(())
//! # }
//! ```
//!
//! ## Safety
//!
//! Frame memory is shared with the capture hardware through raw addresses.
//! The `unsafe` code is confined to [`memory`] and to [`buffer::Frame`]
//! borrowing the bytes of a buffer it exclusively holds.

pub mod adapter;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod hal;
pub mod memory;
pub mod pipeline;
pub mod sensor;
pub mod virtual_platform;

pub use adapter::PipelineStats;
pub use buffer::{BufferPool, BufferRef, BufferState, Claim, Frame};
pub use channel::FrameReceiver;
pub use config::CaptureConfig;
pub use error::{CaptureError, Result};
pub use pipeline::{Pipeline, PipelineState};
