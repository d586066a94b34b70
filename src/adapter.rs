// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Capture controller adapter.
//!
//! Implements [`CaptureEvents`] on top of the buffer pool and the
//! completion channel. Both hooks run on the controller's completion path:
//! they only touch atomics and the non-blocking channel producer, and report
//! anomalies through counters instead of logging or failing.

use crate::{
    buffer::BufferPool,
    channel::CompletionSender,
    hal::{CaptureEvents, DmaTarget, Transaction},
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Counters describing what the completion path has seen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames queued for consumers.
    pub completed: u64,
    /// Buffer requests that found the pool exhausted.
    pub starved_requests: u64,
    /// Completions with no target or an address outside the pool.
    pub unresolved_completions: u64,
    /// Completions dropped because the channel was full or closed.
    pub channel_overflows: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    starved: AtomicU64,
    unresolved: AtomicU64,
    overflows: AtomicU64,
}

/// Bridges controller events to the pool and the completion channel.
pub struct CaptureAdapter {
    pool: Arc<BufferPool>,
    completions: CompletionSender,
    counters: Counters,
}

impl CaptureAdapter {
    pub fn new(pool: Arc<BufferPool>, completions: CompletionSender) -> Self {
        Self {
            pool,
            completions,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            starved_requests: self.counters.starved.load(Ordering::Relaxed),
            unresolved_completions: self.counters.unresolved.load(Ordering::Relaxed),
            channel_overflows: self.counters.overflows.load(Ordering::Relaxed),
        }
    }
}

impl CaptureEvents for CaptureAdapter {
    fn on_request_buffer(&self) -> Option<DmaTarget> {
        let Some(buf) = self.pool.acquire_free() else {
            self.counters.starved.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        self.pool.target(buf)
    }

    fn on_transaction_finished(&self, trans: &Transaction) {
        let Some(buf) = trans.buffer.and_then(|addr| self.pool.resolve(addr)) else {
            self.counters.unresolved.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if !self.pool.complete(buf, trans.received_size) {
            // Known address but not in flight: a stale or duplicate report.
            self.counters.unresolved.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.completions.try_push(buf) {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.pool.release(buf);
            self.counters.overflows.fetch_add(1, Ordering::Relaxed);
        }
    }
}
