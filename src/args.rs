// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_capture::config::{CaptureConfig, FramePreset, MemoryKind, MirrorSetting};
use std::{error::Error, fs, path::PathBuf};

/// Command-line arguments for the EdgeFirst capture node.
///
/// Options left unset fall back to the JSON configuration file, if one is
/// given, and then to the reference board defaults. Arguments can be
/// specified via command line or environment variables.
///
/// # Example
///
/// ```bash
/// # Via command line
/// edgefirst-capture --preset 800x1280 --buffers 3 --frames 100
///
/// # Via environment variables
/// export BUFFERS=3
/// export MIRROR=both
/// edgefirst-capture
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to a JSON capture configuration file
    #[arg(short, long, env = "CAPTURE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of frame buffers in the pool
    #[arg(short, long, env = "BUFFERS")]
    pub buffers: Option<usize>,

    /// Sensor mode to negotiate
    #[arg(short, long, env = "PRESET", value_enum)]
    pub preset: Option<FramePreset>,

    /// Frame buffer memory source
    #[arg(long, env = "MEMORY", value_enum)]
    pub memory: Option<MemoryKind>,

    /// Camera image mirroring setting
    #[arg(long, env = "MIRROR", value_enum)]
    pub mirror: Option<MirrorSetting>,

    /// Skip the image processor stage
    #[arg(long, env = "NO_ISP")]
    pub no_isp: bool,

    /// Name of the simulated sensor
    #[arg(long, env = "SENSOR", default_value = "SC2336")]
    pub sensor: String,

    /// Control bus address of the simulated sensor
    #[arg(long, env = "SENSOR_ADDRESS", default_value = "48")]
    pub sensor_address: u16,

    /// Stop after this many frames (runs until Ctrl-C when unset)
    #[arg(short, long, env = "FRAMES")]
    pub frames: Option<u64>,

    /// Simulated frame rate, defaults to the preset's rate
    #[arg(long, env = "FPS")]
    pub fps: Option<u32>,

    /// Per-frame receive timeout in milliseconds
    #[arg(short, long, env = "TIMEOUT", default_value = "1000")]
    pub timeout: u64,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Forward logs to the systemd journal
    #[arg(long, env = "JOURNALD")]
    pub journald: bool,

    /// Enable Tokio async runtime console for debugging
    #[arg(long, env = "TOKIO_CONSOLE")]
    pub tokio_console: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl Args {
    /// Loads the configuration file, if any, then applies the explicit
    /// command-line overrides.
    pub fn capture_config(&self) -> Result<CaptureConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => {
                let json = fs::read_to_string(path)
                    .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
                CaptureConfig::from_json(&json)
                    .map_err(|e| format!("failed to parse {}: {}", path.display(), e))?
            }
            None => CaptureConfig::default(),
        };

        if let Some(buffers) = self.buffers {
            config.buffer_count = buffers;
        }
        if let Some(preset) = self.preset {
            config.preset = preset;
        }
        if let Some(memory) = self.memory {
            config.memory = memory;
        }
        if let Some(mirror) = self.mirror {
            config.mirror = mirror;
        }
        if self.no_isp {
            config.isp = None;
        }

        Ok(config)
    }
}
