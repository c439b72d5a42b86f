//! Buffer map table: per-plane memory mappings and kernel ownership tags.

use std::os::fd::OwnedFd;

use memmap2::MmapRaw;

use crate::capture::ioctl::{V4l2Plane, VIDEO_MAX_FRAME};

/// Fixed plane layout for NV12M: full-resolution luma, half-height chroma.
pub const NUM_PLANES: usize = 2;

/// Which side of the kernel queue currently owns a buffer's memory.
///
/// Queued buffers may be overwritten by the driver at any time; only a
/// dequeued buffer is safe for the process to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    Kernel,
    User,
}

/// One mapped plane of one kernel buffer.
pub struct PlaneMapping {
    /// Mapped length in bytes, as reported by QUERYBUF.
    pub length: u32,
    /// Line stride in bytes, from the negotiated format.
    pub stride: u32,
    /// Live mapping; `None` until mapped and again after release.
    pub map: Option<MmapRaw>,
    /// Exported DMA descriptor; `None` unless export was requested.
    pub dma_fd: Option<OwnedFd>,
    /// Kernel plane descriptor, re-sent on every queue operation.
    pub descriptor: V4l2Plane,
}

impl PlaneMapping {
    pub fn unmapped() -> Self {
        Self {
            length: 0,
            stride: 0,
            map: None,
            dma_fd: None,
            descriptor: V4l2Plane::zeroed(),
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    /// Close the DMA export, unmap the plane, and return both fields to
    /// their unset sentinels. Safe to call on a plane that was never mapped
    /// and safe to call repeatedly: `Option::take` leaves nothing behind to
    /// close or unmap twice.
    pub fn reset(&mut self) {
        drop(self.dma_fd.take());
        drop(self.map.take());
        self.length = 0;
    }
}

/// One kernel buffer: its planes plus the queue-ownership tag.
pub struct BufferMap {
    pub planes: [PlaneMapping; NUM_PLANES],
    pub owner: BufferOwner,
}

impl BufferMap {
    fn unmapped() -> Self {
        Self {
            planes: [PlaneMapping::unmapped(), PlaneMapping::unmapped()],
            owner: BufferOwner::User,
        }
    }
}

/// Arena of buffer records indexed by kernel-assigned buffer index.
///
/// Sized once from the granted (not requested) buffer count and immutable in
/// shape from then on; only the mappings and ownership tags change.
#[derive(Default)]
pub struct BufferTable {
    buffers: Vec<BufferMap>,
}

impl BufferTable {
    pub fn with_granted(count: usize) -> Self {
        assert!(count <= VIDEO_MAX_FRAME, "granted count exceeds VIDEO_MAX_FRAME");
        Self {
            buffers: (0..count).map(|_| BufferMap::unmapped()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn get(&self, index: usize) -> &BufferMap {
        &self.buffers[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut BufferMap {
        &mut self.buffers[index]
    }

    /// Best-effort release of every mapping and export in the table.
    /// Idempotent; records stay in place with sentinel fields.
    pub fn reset_all(&mut self) {
        for buffer in &mut self.buffers {
            for plane in &mut buffer.planes {
                plane.reset();
            }
            buffer.owner = BufferOwner::User;
        }
    }
}
