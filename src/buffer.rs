// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Frame buffer pool.
//!
//! The pool owns a fixed set of [`FrameMemory`] regions allocated once at
//! bring-up. Every slot carries an atomic ownership state so the capture
//! completion path and consumer threads can move buffers between owners
//! without a lock:
//!
//! ```text
//!   Free --acquire_free--> InFlight --complete--> Ready --claim--> Held
//!    ^                        |                     |               |
//!    +--------------------- release ----------------+---------------+
//! ```
//!
//! Every transition is an atomic read-modify-write, so a slot has exactly
//! one owner at a time and a buffer can never be handed to the hardware
//! twice. A `Held` slot can only be freed through the [`Claim`] taken when
//! it was claimed; each claim bumps the slot generation so an outdated
//! claim never frees a later owner's buffer.

use crate::{
    error::{CaptureError, Result},
    hal::{DmaAddr, DmaTarget},
    memory::FrameMemory,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

const STATE_MASK: u64 = 0xff;
const GENERATION_STEP: u64 = 1 << 8;

/// Ownership state of one pool slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferState {
    /// In the pool, available to the hardware.
    Free = 0,
    /// Address handed to the hardware, awaiting completion.
    InFlight = 1,
    /// Completion recorded and queued, not yet claimed.
    Ready = 2,
    /// Claimed by a consumer.
    Held = 3,
}

impl BufferState {
    fn from_word(word: u64) -> Self {
        match word & STATE_MASK {
            0 => BufferState::Free,
            1 => BufferState::InFlight,
            2 => BufferState::Ready,
            _ => BufferState::Held,
        }
    }

    /// Replaces the state bits of `word`, keeping its generation.
    fn into_word(self, word: u64) -> u64 {
        (word & !STATE_MASK) | self as u64
    }
}

/// Reference to a pool slot. Cheap to copy and allocation-free to queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferRef(usize);

impl BufferRef {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Exclusive hold on one `Held` slot, returned by [`BufferPool::claim`].
///
/// Not `Clone`: the holder of the claim is the only party that can return
/// the buffer with [`BufferPool::release_claim`].
#[derive(Debug, PartialEq, Eq)]
pub struct Claim {
    buf: BufferRef,
    word: u64,
}

impl Claim {
    pub fn buffer(&self) -> BufferRef {
        self.buf
    }
}

struct Slot {
    memory: FrameMemory,
    // Generation in the upper bits, BufferState in the low byte.
    word: AtomicU64,
    received: AtomicUsize,
}

impl Slot {
    fn state(&self) -> BufferState {
        BufferState::from_word(self.word.load(Ordering::Acquire))
    }

    /// Moves the slot from `from` to `to`. Returns the previous word, or the
    /// current one as the error when the slot was not in `from`.
    fn transition(
        &self,
        from: BufferState,
        to: BufferState,
    ) -> std::result::Result<u64, u64> {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (BufferState::from_word(word) == from).then(|| to.into_word(word))
            })
    }
}

/// Fixed set of hardware-addressable frame buffers.
pub struct BufferPool {
    slots: Vec<Slot>,
}

impl BufferPool {
    /// Builds a pool from already allocated and cache-synchronised regions.
    /// Every buffer starts out `Free`.
    pub fn new(memories: Vec<FrameMemory>) -> Result<Self> {
        if memories.is_empty() {
            return Err(CaptureError::InvalidArgument(
                "buffer pool needs at least one buffer".to_string(),
            ));
        }
        let slots = memories
            .into_iter()
            .map(|memory| Slot {
                memory,
                word: AtomicU64::new(BufferState::Free as u64),
                received: AtomicUsize::new(0),
            })
            .collect();
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reserves the first free buffer for the hardware. `None` when the pool
    /// is exhausted, which is a normal outcome under a slow consumer.
    pub fn acquire_free(&self) -> Option<BufferRef> {
        self.slots
            .iter()
            .position(|slot| {
                slot.transition(BufferState::Free, BufferState::InFlight)
                    .is_ok()
            })
            .map(BufferRef)
    }

    /// Maps a hardware-reported address back to its slot.
    pub fn resolve(&self, addr: DmaAddr) -> Option<BufferRef> {
        self.slots
            .iter()
            .position(|slot| slot.memory.addr() == addr)
            .map(BufferRef)
    }

    /// Records a finished transaction and moves the buffer from `InFlight`
    /// to `Ready`. Returns `false` if the buffer was not in flight.
    pub fn complete(&self, buf: BufferRef, received: usize) -> bool {
        let Some(slot) = self.slots.get(buf.0) else {
            return false;
        };
        if slot.state() != BufferState::InFlight {
            return false;
        }
        slot.received
            .store(received.min(slot.memory.len()), Ordering::Relaxed);
        slot.transition(BufferState::InFlight, BufferState::Ready)
            .is_ok()
    }

    /// Hands a `Ready` buffer to a consumer. Returns `None` if it was
    /// released or reclaimed in the meantime.
    pub fn claim(&self, buf: BufferRef) -> Option<Claim> {
        let slot = self.slots.get(buf.0)?;
        let held = |word: u64| {
            BufferState::Held
                .into_word(word)
                .wrapping_add(GENERATION_STEP)
        };
        let prev = slot
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (BufferState::from_word(word) == BufferState::Ready).then(|| held(word))
            })
            .ok()?;
        Some(Claim {
            buf,
            word: held(prev),
        })
    }

    /// Returns a claimed buffer to `Free`. Reports `false` if the claim was
    /// already released, in which case the slot is left untouched.
    pub fn release_claim(&self, claim: &Claim) -> bool {
        let Some(slot) = self.slots.get(claim.buf.0) else {
            return false;
        };
        let free = BufferState::Free.into_word(claim.word);
        match slot.word.compare_exchange(
            claim.word,
            free,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => true,
            Err(_) => {
                debug!("stale claim on buffer {} ignored", claim.buf.0);
                false
            }
        }
    }

    /// Returns an `InFlight` or `Ready` buffer to `Free`.
    ///
    /// Releasing an already free buffer is a no-op and reports `false`. A
    /// `Held` buffer is left alone as well; only its [`Claim`] frees it.
    pub fn release(&self, buf: BufferRef) -> bool {
        let Some(slot) = self.slots.get(buf.0) else {
            warn!("release of unknown buffer {}", buf.0);
            return false;
        };
        let released = slot.word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
            match BufferState::from_word(word) {
                BufferState::InFlight | BufferState::Ready => {
                    Some(BufferState::Free.into_word(word))
                }
                BufferState::Free | BufferState::Held => None,
            }
        });
        match released {
            Ok(_) => true,
            Err(word) if BufferState::from_word(word) == BufferState::Held => {
                warn!("buffer {} is held by a frame, not released", buf.0);
                false
            }
            Err(_) => {
                debug!("buffer {} already free", buf.0);
                false
            }
        }
    }

    /// Frees every buffer still marked `InFlight`. Only valid once the
    /// hardware has been stopped and no longer writes to them.
    pub fn reclaim_in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                slot.transition(BufferState::InFlight, BufferState::Free)
                    .is_ok()
            })
            .count()
    }

    pub fn state(&self, buf: BufferRef) -> Option<BufferState> {
        self.slots.get(buf.0).map(Slot::state)
    }

    /// Bytes the hardware reported for the last completed transaction.
    pub fn received_len(&self, buf: BufferRef) -> usize {
        self.slots
            .get(buf.0)
            .map_or(0, |slot| slot.received.load(Ordering::Acquire))
    }

    pub fn capacity(&self, buf: BufferRef) -> usize {
        self.slots.get(buf.0).map_or(0, |slot| slot.memory.len())
    }

    /// The region to program into the hardware for `buf`.
    pub fn target(&self, buf: BufferRef) -> Option<DmaTarget> {
        self.slots.get(buf.0).map(|slot| DmaTarget {
            addr: slot.memory.addr(),
            len: slot.memory.len(),
        })
    }

    pub fn memory(&self, buf: BufferRef) -> Option<&FrameMemory> {
        self.slots.get(buf.0).map(|slot| &slot.memory)
    }

    pub fn free_count(&self) -> usize {
        self.count(BufferState::Free)
    }

    pub fn count(&self, state: BufferState) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state() == state)
            .count()
    }

    /// Iterates over every slot reference in index order.
    pub fn buffers(&self) -> impl Iterator<Item = BufferRef> {
        (0..self.slots.len()).map(BufferRef)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("len", &self.len())
            .field("free", &self.free_count())
            .finish()
    }
}

/// A completed frame held by a consumer.
///
/// Dropping the frame, or passing it to
/// [`crate::pipeline::Pipeline::release`], returns the buffer to the pool.
/// The pool memory stays alive for as long as any frame references it.
pub struct Frame {
    pool: Arc<BufferPool>,
    claim: Claim,
    len: usize,
}

impl Frame {
    pub(crate) fn new(pool: Arc<BufferPool>, claim: Claim) -> Self {
        let len = pool.received_len(claim.buf);
        Self { pool, claim, len }
    }

    pub fn buffer(&self) -> BufferRef {
        self.claim.buf
    }

    pub fn index(&self) -> usize {
        self.claim.buf.index()
    }

    /// Bytes the hardware reported for this frame.
    pub fn received_len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity(self.buffer())
    }

    pub fn addr(&self) -> Option<DmaAddr> {
        self.pool.memory(self.buffer()).map(FrameMemory::addr)
    }

    pub fn state(&self) -> BufferState {
        self.pool.state(self.buffer()).unwrap_or(BufferState::Free)
    }

    /// The received bytes.
    pub fn data(&self) -> &[u8] {
        match self.pool.memory(self.buffer()) {
            // SAFETY: the slot is `Held` under this frame's claim. Only
            // `release_claim` with that claim frees it, which happens in drop.
            Some(memory) => unsafe { memory.slice(self.len) },
            None => &[],
        }
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.pool.release_claim(&self.claim);
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.buffer().index())
            .field("received_len", &self.len)
            .finish()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "frame[{}] {}/{} bytes",
            self.buffer().index(),
            self.len,
            self.capacity()
        )
    }
}
