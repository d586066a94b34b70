// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Error types for the frame acquisition pipeline.

use thiserror::Error;

/// Result type alias using [`CaptureError`].
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Errors reported by the capture pipeline and its hardware collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The operation is not valid for the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A parameter was rejected, or a sensor was found on the wrong
    /// physical interface.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Frame memory or queue allocation failed.
    #[error("out of memory: {0}")]
    NoMemory(String),

    /// No compatible sensor answered on the control bus.
    #[error("not found: {0}")]
    NotFound(String),

    /// The sensor does not advertise the requested format.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// No completed frame arrived before the caller's deadline.
    #[error("timed out waiting for a frame")]
    Timeout,

    /// A bus, controller, processor or cache operation failed.
    #[error("I/O error: {0}")]
    IoError(String),
}

impl CaptureError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CaptureError::Timeout)
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::IoError(err.to_string())
    }
}
