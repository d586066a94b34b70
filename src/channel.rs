// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Completion channel between the capture completion path and consumers.
//!
//! A bounded FIFO of [`BufferRef`]s whose depth equals the pool size. The
//! producer side never blocks and never allocates; the consumer side blocks
//! with a caller-supplied timeout.

use crate::{
    buffer::{BufferPool, BufferRef, Frame},
    error::{CaptureError, Result},
};
use kanal::{ReceiveErrorTimeout, Receiver, Sender};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::debug;

/// Bounded queue of completed buffers.
pub struct CompletionChannel {
    tx: Sender<BufferRef>,
    rx: Receiver<BufferRef>,
    depth: usize,
}

impl CompletionChannel {
    pub fn new(depth: usize) -> Result<Self> {
        if depth == 0 {
            return Err(CaptureError::InvalidArgument(
                "completion channel depth must be non-zero".to_string(),
            ));
        }
        let (tx, rx) = kanal::bounded(depth);
        Ok(Self { tx, rx, depth })
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Producer handle for the completion path.
    pub fn sender(&self) -> CompletionSender {
        CompletionSender {
            tx: self.tx.clone(),
        }
    }

    pub fn try_push_from_interrupt(&self, buf: BufferRef) -> bool {
        matches!(self.tx.try_send(buf), Ok(true))
    }

    /// Waits up to `timeout` for the oldest completed buffer.
    pub fn receive(&self, timeout: Duration) -> Result<BufferRef> {
        recv_timeout(&self.rx, timeout)
    }

    /// Takes every pending completion without waiting.
    pub fn drain_nonblocking(&self) -> impl Iterator<Item = BufferRef> + '_ {
        std::iter::from_fn(move || self.rx.try_recv().ok().flatten())
    }

    /// Consumer handle that resolves queued buffers into [`Frame`]s.
    pub fn frame_receiver(&self, pool: Arc<BufferPool>) -> FrameReceiver {
        FrameReceiver {
            rx: self.rx.clone(),
            pool,
        }
    }
}

fn recv_timeout(rx: &Receiver<BufferRef>, timeout: Duration) -> Result<BufferRef> {
    match rx.recv_timeout(timeout) {
        Ok(buf) => Ok(buf),
        Err(ReceiveErrorTimeout::Timeout) => Err(CaptureError::Timeout),
        Err(_) => Err(CaptureError::InvalidState(
            "completion channel closed".to_string(),
        )),
    }
}

/// Producer side of the completion channel. Safe to use from the capture
/// completion path.
#[derive(Clone)]
pub struct CompletionSender {
    tx: Sender<BufferRef>,
}

impl CompletionSender {
    /// Queues `buf` without blocking. Returns `false` when the channel is
    /// full or closed; the caller keeps ownership of the buffer.
    pub fn try_push(&self, buf: BufferRef) -> bool {
        matches!(self.tx.try_send(buf), Ok(true))
    }
}

/// Consumer side of the completion channel.
///
/// Cloneable and `Send`, so a consumer thread can own one while the
/// pipeline stays with its controlling thread. Receives fail with
/// [`CaptureError::InvalidState`] once the pipeline has been torn down.
#[derive(Clone)]
pub struct FrameReceiver {
    rx: Receiver<BufferRef>,
    pool: Arc<BufferPool>,
}

impl FrameReceiver {
    /// Waits up to `timeout` for the oldest completed frame and claims it.
    pub fn recv(&self, timeout: Duration) -> Result<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let buf = recv_timeout(&self.rx, remaining)?;
            if let Some(frame) = self.claim(buf)? {
                return Ok(frame);
            }
        }
    }

    /// Returns a frame immediately if one is queued.
    pub fn try_recv(&self) -> Result<Option<Frame>> {
        loop {
            let buf = match self.rx.try_recv() {
                Ok(Some(buf)) => buf,
                Ok(None) => return Ok(None),
                Err(_) => {
                    return Err(CaptureError::InvalidState(
                        "completion channel closed".to_string(),
                    ))
                }
            };
            if let Some(frame) = self.claim(buf)? {
                return Ok(Some(frame));
            }
        }
    }

    fn claim(&self, buf: BufferRef) -> Result<Option<Frame>> {
        let Some(claim) = self.pool.claim(buf) else {
            debug!("skipping buffer {} released before claim", buf.index());
            return Ok(None);
        };
        let frame = Frame::new(self.pool.clone(), claim);
        if let Some(memory) = self.pool.memory(buf) {
            memory.sync_for_cpu()?;
        }
        Ok(Some(frame))
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}
