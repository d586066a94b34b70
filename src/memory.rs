// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! DMA-capable frame storage.
//!
//! A [`FrameMemory`] is a fixed-capacity region the capture hardware writes
//! into. It is either cache-line aligned heap memory or a buffer from the
//! CMA DMA heap mapped into the process. The CPU view must be flushed with
//! [`FrameMemory::sync_for_device`] before the hardware first writes to it.

use crate::{
    config::MemoryKind,
    error::{CaptureError, Result},
    hal::DmaAddr,
};
use dma_buf::{DmaBuf, MappedDmaBuf};
use dma_heap::{Heap, HeapKind};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    fmt,
    ptr::NonNull,
    sync::{
        atomic::{fence, Ordering},
        Mutex,
    },
};
use tracing::debug;

/// Alignment of heap frame buffers, one L2 cache line.
pub const CACHE_LINE: usize = 128;

/// Frame storage handed to the capture hardware.
pub enum FrameMemory {
    Heap(HeapRegion),
    Cma(CmaRegion),
}

// SAFETY: the regions are plain memory owned by this value. Concurrent
// access to the contents is arbitrated by the buffer pool's ownership
// states, never through shared mutable references.
unsafe impl Send for FrameMemory {}
unsafe impl Sync for FrameMemory {}

impl FrameMemory {
    /// Allocates `len` bytes of frame memory of the requested kind.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::InvalidArgument`] for a zero length and
    /// [`CaptureError::NoMemory`] when the allocator cannot satisfy the
    /// request.
    pub fn allocate(len: usize, kind: MemoryKind) -> Result<Self> {
        if len == 0 {
            return Err(CaptureError::InvalidArgument(
                "frame buffer length must be non-zero".to_string(),
            ));
        }
        match kind {
            MemoryKind::Heap => HeapRegion::new(len).map(FrameMemory::Heap),
            MemoryKind::Cma => CmaRegion::new(len).map(FrameMemory::Cma),
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        match self {
            FrameMemory::Heap(region) => region.ptr.as_ptr(),
            FrameMemory::Cma(region) => region.ptr.as_ptr(),
        }
    }

    /// Address the hardware reports back on completion.
    pub fn addr(&self) -> DmaAddr {
        DmaAddr(self.as_ptr() as usize)
    }

    pub fn len(&self) -> usize {
        match self {
            FrameMemory::Heap(region) => region.len,
            FrameMemory::Cma(region) => region.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> MemoryKind {
        match self {
            FrameMemory::Heap(_) => MemoryKind::Heap,
            FrameMemory::Cma(_) => MemoryKind::Cma,
        }
    }

    /// Writes back the CPU caches so the device sees the current contents.
    pub fn sync_for_device(&self) -> Result<()> {
        match self {
            FrameMemory::Heap(_) => {
                fence(Ordering::SeqCst);
                Ok(())
            }
            FrameMemory::Cma(region) => region.sync_for_device(),
        }
    }

    /// Invalidates the CPU view after the device wrote a frame.
    pub fn sync_for_cpu(&self) -> Result<()> {
        match self {
            FrameMemory::Heap(_) => {
                fence(Ordering::SeqCst);
                Ok(())
            }
            FrameMemory::Cma(region) => region.sync_for_cpu(),
        }
    }

    /// Borrows the first `len` bytes of the region.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive ownership of the buffer so that no
    /// device or other thread writes to it while the slice is alive.
    pub(crate) unsafe fn slice(&self, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.as_ptr(), len.min(self.len()))
    }
}

impl fmt::Debug for FrameMemory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FrameMemory")
            .field("kind", &self.kind())
            .field("addr", &self.addr())
            .field("len", &self.len())
            .finish()
    }
}

/// Cache-line aligned, zero-initialised heap memory.
pub struct HeapRegion {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl HeapRegion {
    fn new(len: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len, CACHE_LINE)
            .map_err(|e| CaptureError::NoMemory(format!("invalid frame layout: {e}")))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            CaptureError::NoMemory(format!("failed to allocate {len} byte frame buffer"))
        })?;
        Ok(Self { ptr, len, layout })
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// CMA DMA heap buffer mapped read/write into the process.
///
/// Cache maintenance goes through the dma-buf mapping, which brackets each
/// access with the begin and end sync calls.
pub struct CmaRegion {
    mapped: Mutex<MappedDmaBuf>,
    ptr: NonNull<u8>,
    len: usize,
}

impl CmaRegion {
    fn new(len: usize) -> Result<Self> {
        let heap = Heap::new(HeapKind::Cma)
            .map_err(|e| CaptureError::NoMemory(format!("failed to open CMA heap: {e}")))?;
        let fd = heap.allocate(len).map_err(|e| {
            CaptureError::NoMemory(format!("failed to allocate {len} bytes of CMA memory: {e}"))
        })?;
        debug!("CMA frame buffer alloc'd fd:{:?} len:{}", fd, len);
        let mapped = DmaBuf::from(fd)
            .memory_map()
            .map_err(|e| CaptureError::NoMemory(format!("failed to map CMA buffer: {e}")))?;
        let addr = mapped
            .read(|data: &[u8], _: Option<()>| Ok(data.as_ptr() as usize), None)
            .map_err(|e| CaptureError::IoError(format!("CMA buffer sync failed: {e}")))?;
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| CaptureError::NoMemory("CMA buffer mapped at null".to_string()))?;
        Ok(Self {
            mapped: Mutex::new(mapped),
            ptr,
            len,
        })
    }

    fn mapped(&self) -> Result<std::sync::MutexGuard<'_, MappedDmaBuf>> {
        self.mapped
            .lock()
            .map_err(|_| CaptureError::IoError("CMA mapping lock poisoned".to_string()))
    }

    fn sync_for_device(&self) -> Result<()> {
        self.mapped()?
            .write(|_: &mut [u8], _: Option<()>| Ok(()), None)
            .map_err(|e| CaptureError::IoError(format!("CMA buffer sync failed: {e}")))
    }

    fn sync_for_cpu(&self) -> Result<()> {
        self.mapped()?
            .read(|_: &[u8], _: Option<()>| Ok(()), None)
            .map_err(|e| CaptureError::IoError(format!("CMA buffer sync failed: {e}")))
    }
}
