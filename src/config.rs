// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Capture pipeline configuration.
//!
//! [`CaptureConfig`] gathers the board-level values consumed by the
//! pipeline bring-up: bus wiring, CSI lane parameters, the sensor format to
//! negotiate and the optional image processor setup. Every field has a
//! default matching the reference board so a partial JSON document is
//! enough to override a single value.

use crate::hal::{SensorFormat, SensorInterface};
use serde::{Deserialize, Serialize};

/// Camera image mirroring options.
///
/// Applied to the sensor after format negotiation and adjustable at runtime
/// through [`crate::pipeline::Pipeline::set_mirror`].
#[derive(clap::ValueEnum, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum MirrorSetting {
    /// No mirroring
    #[default]
    None,
    /// Flip horizontally (left-right)
    Horizontal,
    /// Flip vertically (top-bottom)
    Vertical,
    /// Flip both horizontally and vertically (180-degree rotation)
    Both,
}

impl MirrorSetting {
    /// Returns the `(horizontal, vertical)` flags for the sensor.
    pub fn flags(self) -> (bool, bool) {
        match self {
            MirrorSetting::None => (false, false),
            MirrorSetting::Horizontal => (true, false),
            MirrorSetting::Vertical => (false, true),
            MirrorSetting::Both => (true, true),
        }
    }
}

/// Pixel color formats understood by the capture controller and the image
/// processor.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ColorFormat {
    Raw8,
    Raw10,
    Rgb565,
    Rgb888,
    Yuv422,
}

impl ColorFormat {
    /// Bytes needed to store one pixel in memory.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            ColorFormat::Raw8 => 1,
            ColorFormat::Raw10 => 2,
            ColorFormat::Rgb565 => 2,
            ColorFormat::Rgb888 => 3,
            ColorFormat::Yuv422 => 2,
        }
    }
}

/// Where frame buffers are allocated from.
#[derive(clap::ValueEnum, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Cache-line aligned process heap memory.
    #[default]
    Heap,
    /// Contiguous memory from the CMA DMA heap, mapped into the process.
    Cma,
}

/// Sensor modes supported by the board camera.
#[derive(clap::ValueEnum, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Copy, Default)]
pub enum FramePreset {
    #[default]
    #[serde(rename = "800x640")]
    #[value(name = "800x640")]
    Res800x640,
    #[serde(rename = "800x1280")]
    #[value(name = "800x1280")]
    Res800x1280,
    #[serde(rename = "1024x600")]
    #[value(name = "1024x600")]
    Res1024x600,
}

impl FramePreset {
    /// The sensor format name negotiated for this preset.
    pub const fn format_name(self) -> &'static str {
        match self {
            FramePreset::Res800x640 => "MIPI_2lane_24Minput_RAW8_800x640_50fps",
            FramePreset::Res800x1280 => "MIPI_2lane_24Minput_RAW8_800x1280_50fps",
            FramePreset::Res1024x600 => "MIPI_2lane_24Minput_RAW8_1024x600_30fps",
        }
    }

    pub const fn width(self) -> u32 {
        match self {
            FramePreset::Res800x640 => 800,
            FramePreset::Res800x1280 => 800,
            FramePreset::Res1024x600 => 1024,
        }
    }

    pub const fn height(self) -> u32 {
        match self {
            FramePreset::Res800x640 => 640,
            FramePreset::Res800x1280 => 1280,
            FramePreset::Res1024x600 => 600,
        }
    }

    pub const fn fps(self) -> u32 {
        match self {
            FramePreset::Res1024x600 => 30,
            _ => 50,
        }
    }

    pub const ALL: [FramePreset; 3] = [
        FramePreset::Res800x640,
        FramePreset::Res800x1280,
        FramePreset::Res1024x600,
    ];

    /// The catalog entry a sensor advertises for this preset.
    pub fn sensor_format(self) -> SensorFormat {
        SensorFormat {
            name: self.format_name().to_string(),
            width: self.width(),
            height: self.height(),
            fps: self.fps(),
        }
    }
}

/// Control bus (I2C master) wiring.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BusConfig {
    pub port: u8,
    pub scl_pin: u8,
    pub sda_pin: u8,
    pub internal_pullup: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port: 0,
            scl_pin: 8,
            sda_pin: 7,
            internal_pullup: true,
        }
    }
}

/// Per-device SCCB session parameters used while probing sensors.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SccbConfig {
    pub clock_hz: u32,
    /// Address width in bits (7 or 10).
    pub address_bits: u8,
}

impl Default for SccbConfig {
    fn default() -> Self {
        Self {
            clock_hz: 100_000,
            address_bits: 7,
        }
    }
}

/// CSI lane and color settings. The resolution comes from the preset, see
/// [`CaptureConfig::csi_config`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct CsiSettings {
    pub controller_id: u8,
    pub lane_bit_rate_mbps: u32,
    pub data_lanes: u8,
    pub byte_swap: bool,
    pub input_color: ColorFormat,
    pub output_color: ColorFormat,
    pub queue_items: u8,
}

impl Default for CsiSettings {
    fn default() -> Self {
        Self {
            controller_id: 0,
            lane_bit_rate_mbps: 200,
            data_lanes: 2,
            byte_swap: true,
            input_color: ColorFormat::Raw8,
            output_color: ColorFormat::Rgb565,
            queue_items: 1,
        }
    }
}

/// Image processor input path.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Copy)]
#[serde(rename_all = "lowercase")]
pub enum IspSource {
    Csi,
    Dvp,
}

/// Image processor settings. The resolution comes from the preset, see
/// [`CaptureConfig::isp_config`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct IspSettings {
    pub clock_hz: u32,
    pub source: IspSource,
    pub input_color: ColorFormat,
    pub output_color: ColorFormat,
    pub line_start_packet: bool,
    pub line_end_packet: bool,
}

impl Default for IspSettings {
    fn default() -> Self {
        Self {
            clock_hz: 80_000_000,
            source: IspSource::Csi,
            input_color: ColorFormat::Raw8,
            output_color: ColorFormat::Rgb565,
            line_start_packet: false,
            line_end_packet: false,
        }
    }
}

/// Fully resolved capture controller configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsiConfig {
    pub controller_id: u8,
    pub h_res: u32,
    pub v_res: u32,
    pub lane_bit_rate_mbps: u32,
    pub data_lanes: u8,
    pub byte_swap: bool,
    pub input_color: ColorFormat,
    pub output_color: ColorFormat,
    pub queue_items: u8,
}

impl CsiConfig {
    /// Size in bytes of one complete output frame.
    pub fn frame_len(&self) -> usize {
        self.h_res as usize * self.v_res as usize * self.output_color.bytes_per_pixel()
    }
}

/// Fully resolved image processor configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IspConfig {
    pub clock_hz: u32,
    pub source: IspSource,
    pub input_color: ColorFormat,
    pub output_color: ColorFormat,
    pub line_start_packet: bool,
    pub line_end_packet: bool,
    pub h_res: u32,
    pub v_res: u32,
}

/// Complete configuration for one capture pipeline.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Number of frame buffers in the pool.
    pub buffer_count: usize,
    pub memory: MemoryKind,
    pub preset: FramePreset,
    pub bus: BusConfig,
    pub sccb: SccbConfig,
    pub csi: CsiSettings,
    /// `None` skips the image processor stage entirely.
    pub isp: Option<IspSettings>,
    pub sensor_interface: SensorInterface,
    pub mirror: MirrorSetting,
    /// Timeout handed to the controller for the priming receive in `start`.
    pub prime_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_count: 1,
            memory: MemoryKind::Heap,
            preset: FramePreset::Res800x640,
            bus: BusConfig::default(),
            sccb: SccbConfig::default(),
            csi: CsiSettings::default(),
            isp: Some(IspSettings::default()),
            sensor_interface: SensorInterface::MipiCsi,
            mirror: MirrorSetting::None,
            prime_timeout_ms: 1000,
        }
    }
}

impl CaptureConfig {
    /// Parses a JSON document, filling any missing field with its default.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn format_name(&self) -> &'static str {
        self.preset.format_name()
    }

    pub fn csi_config(&self) -> CsiConfig {
        CsiConfig {
            controller_id: self.csi.controller_id,
            h_res: self.preset.width(),
            v_res: self.preset.height(),
            lane_bit_rate_mbps: self.csi.lane_bit_rate_mbps,
            data_lanes: self.csi.data_lanes,
            byte_swap: self.csi.byte_swap,
            input_color: self.csi.input_color,
            output_color: self.csi.output_color,
            queue_items: self.csi.queue_items,
        }
    }

    pub fn isp_config(&self) -> Option<IspConfig> {
        self.isp.as_ref().map(|isp| IspConfig {
            clock_hz: isp.clock_hz,
            source: isp.source,
            input_color: isp.input_color,
            output_color: isp.output_color,
            line_start_packet: isp.line_start_packet,
            line_end_packet: isp.line_end_packet,
            h_res: self.preset.width(),
            v_res: self.preset.height(),
        })
    }

    /// Capacity of every frame buffer in the pool.
    pub fn frame_len(&self) -> usize {
        self.csi_config().frame_len()
    }
}
