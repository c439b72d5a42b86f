//! V4L2 buffer lifecycle: negotiate, map, queue, stream, release.
//!
//! The kernel owns every queued buffer; the table in [`BufferTable`] tracks
//! which side holds each one. Buffers pinned by the driver survive the
//! device handle being closed, so [`CaptureSession::release_all`] must run
//! on every shutdown path.

use std::os::fd::{FromRawFd, OwnedFd};
use std::slice;

use memmap2::MmapOptions;
use tracing::{debug, info, instrument, warn};

use crate::capture::buffer::{BufferOwner, BufferTable, PlaneMapping, NUM_PLANES};
use crate::capture::device::CaptureDevice;
use crate::capture::ioctl::{
    self, V4l2Buffer, V4l2ExportBuffer, V4l2Format, V4l2Plane, V4l2RequestBuffers,
    V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE, V4L2_MEMORY_MMAP, V4L2_PIX_FMT_NV12M, VIDEO_MAX_FRAME,
};
use crate::display::{FrameHandoff, PlaneView};
use crate::error::CaptureError;
use crate::pipeline::FrameSource;

/// Capture session state: device handle, negotiated buffer table, and the
/// fixed capture-API selectors (multi-planar capture, memory-mapped I/O).
pub struct CaptureSession {
    device: CaptureDevice,
    table: BufferTable,
    granted: usize,
    dma_export: bool,
    width: u32,
    height: u32,
    strides: [u32; NUM_PLANES],
    streaming: bool,
}

impl CaptureSession {
    pub fn new(device: CaptureDevice, width: u32, height: u32) -> Self {
        Self {
            device,
            table: BufferTable::default(),
            granted: 0,
            dma_export: false,
            width,
            height,
            strides: [0; NUM_PLANES],
            streaming: false,
        }
    }

    pub fn granted(&self) -> usize {
        self.granted
    }

    /// Negotiate the NV12M format, then ask the kernel for `requested`
    /// buffers. The kernel may grant fewer; the granted count is recorded
    /// and used for every later operation.
    pub fn negotiate_and_allocate(
        &mut self,
        requested: u32,
        dma_export: bool,
    ) -> Result<usize, CaptureError> {
        self.set_format()?;

        let mut req = V4l2RequestBuffers::new(
            requested,
            V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
            V4L2_MEMORY_MMAP,
        );
        unsafe { ioctl::vidioc_reqbufs(self.device.fd(), &mut req) }.map_err(|source| {
            CaptureError::DeviceRejected {
                request: "buffer allocation",
                source,
            }
        })?;

        let granted = req.count.min(VIDEO_MAX_FRAME as u32) as usize;
        if granted == 0 {
            return Err(CaptureError::DeviceRejected {
                request: "buffer allocation",
                source: nix::errno::Errno::ENOMEM,
            });
        }
        if granted != requested as usize {
            info!("Requested {requested} buffers, kernel granted {granted}");
        }

        self.granted = granted;
        self.dma_export = dma_export;
        self.table = BufferTable::with_granted(granted);
        Ok(granted)
    }

    fn set_format(&mut self) -> Result<(), CaptureError> {
        let mut fmt = V4l2Format::zeroed(V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE);
        {
            let pix_mp = unsafe { &mut fmt.fmt.pix_mp };
            pix_mp.width = self.width;
            pix_mp.height = self.height;
            pix_mp.pixelformat = V4L2_PIX_FMT_NV12M;
            pix_mp.num_planes = NUM_PLANES as u8;
        }

        unsafe { ioctl::vidioc_s_fmt(self.device.fd(), &mut fmt) }.map_err(|source| {
            CaptureError::DeviceRejected {
                request: "NV12M format",
                source,
            }
        })?;

        // The driver answers with the geometry it actually configured.
        let pix_mp = unsafe { &fmt.fmt.pix_mp };
        self.width = pix_mp.width;
        self.height = pix_mp.height;
        for p in 0..NUM_PLANES {
            self.strides[p] = pix_mp.plane_fmt[p].bytesperline;
        }
        info!(
            "Format {}x{}, strides {:?}",
            self.width, self.height, self.strides
        );
        Ok(())
    }

    /// Map every plane of every granted buffer into the process, exporting a
    /// DMA descriptor per plane when the session was configured for it.
    /// Partially-mapped state after a failure is the caller's to release.
    #[instrument(skip(self))]
    pub fn map_all(&mut self) -> Result<(), CaptureError> {
        for index in 0..self.granted {
            let mut planes = [V4l2Plane::zeroed(); NUM_PLANES];
            let mut buf = V4l2Buffer::for_planes(
                index as u32,
                V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
                V4L2_MEMORY_MMAP,
                &mut planes,
            );
            unsafe { ioctl::vidioc_querybuf(self.device.fd(), &mut buf) }.map_err(|source| {
                CaptureError::DeviceRejected {
                    request: "buffer geometry query",
                    source,
                }
            })?;

            for (plane_index, plane) in planes.iter().enumerate() {
                let length = plane.length;
                let offset = unsafe { plane.m.mem_offset };
                debug!("buffer {index} plane {plane_index}: length={length} offset={offset}");

                let map = MmapOptions::new()
                    .offset(offset as u64)
                    .len(length as usize)
                    .map_raw(self.device.fd())
                    .map_err(|source| CaptureError::MapFailed {
                        buffer: index,
                        plane: plane_index,
                        source,
                    })?;

                let dma_fd = if self.dma_export {
                    Some(self.export_plane(index, plane_index)?)
                } else {
                    None
                };

                self.table.get_mut(index).planes[plane_index] = PlaneMapping {
                    length,
                    stride: self.strides[plane_index],
                    map: Some(map),
                    dma_fd,
                    descriptor: *plane,
                };
            }
        }
        Ok(())
    }

    fn export_plane(&self, index: usize, plane: usize) -> Result<OwnedFd, CaptureError> {
        let mut exp: V4l2ExportBuffer = unsafe { std::mem::zeroed() };
        exp.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        exp.index = index as u32;
        exp.plane = plane as u32;
        exp.flags = (libc::O_CLOEXEC | libc::O_RDWR) as u32;

        unsafe { ioctl::vidioc_expbuf(self.device.fd(), &mut exp) }.map_err(|source| {
            CaptureError::MapFailed {
                buffer: index,
                plane,
                source: source.into(),
            }
        })?;
        Ok(unsafe { OwnedFd::from_raw_fd(exp.fd) })
    }

    /// Submit every granted buffer to the kernel capture queue. A rejected
    /// submission aborts the rest; there is nothing to stream without a full
    /// queue.
    pub fn queue_all(&mut self) -> Result<(), CaptureError> {
        for index in 0..self.granted {
            self.queue_buffer(index)
                .map_err(|source| CaptureError::QueueFailed {
                    buffer: index,
                    source,
                })?;
        }
        Ok(())
    }

    fn queue_buffer(&mut self, index: usize) -> Result<(), nix::errno::Errno> {
        let record = self.table.get(index);
        let mut planes = [
            record.planes[0].descriptor,
            record.planes[1].descriptor,
        ];
        let mut buf = V4l2Buffer::for_planes(
            index as u32,
            V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
            V4L2_MEMORY_MMAP,
            &mut planes,
        );
        unsafe { ioctl::vidioc_qbuf(self.device.fd(), &mut buf) }?;
        self.table.get_mut(index).owner = BufferOwner::Kernel;
        Ok(())
    }

    /// Start kernel streaming.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        let type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE as libc::c_int;
        unsafe { ioctl::vidioc_streamon(self.device.fd(), &type_) }.map_err(|source| {
            CaptureError::DeviceRejected {
                request: "stream on",
                source,
            }
        })?;
        self.streaming = true;
        info!("Capture stream started with {} buffers", self.granted);
        Ok(())
    }

    /// Stop kernel streaming. Idempotent: a device that never started, or
    /// was already stopped, is left alone.
    pub fn stop(&mut self) -> Result<(), CaptureError> {
        if !self.streaming {
            debug!("stop requested on a device that is not streaming");
            return Ok(());
        }
        self.streaming = false;
        let type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE as libc::c_int;
        unsafe { ioctl::vidioc_streamoff(self.device.fd(), &type_) }
            .map(drop)
            .map_err(|source| CaptureError::IoFailed {
                op: "VIDIOC_STREAMOFF",
                source,
            })
    }

    /// Unmap every mapped plane, close every exported DMA descriptor, then
    /// shrink the kernel allocation to zero so the driver drops any buffer
    /// it still pins. The driver does not release capture buffers when the
    /// device handle is closed; skipping this leaks kernel memory past
    /// process exit. Safe to call repeatedly.
    pub fn release_all(&mut self) -> Result<(), CaptureError> {
        self.table.reset_all();

        let mut req =
            V4l2RequestBuffers::new(0, V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE, V4L2_MEMORY_MMAP);
        unsafe { ioctl::vidioc_reqbufs(self.device.fd(), &mut req) }
            .map(drop)
            .map_err(|source| CaptureError::IoFailed {
                op: "VIDIOC_REQBUFS(0)",
                source,
            })
    }

    /// Allocate, map, queue, and start streaming. Any failure releases the
    /// partially-acquired kernel state before the error is returned, so a
    /// failed setup never leaves buffers pinned.
    #[instrument(skip(self))]
    pub fn setup(&mut self, requested: u32, dma_export: bool) -> Result<(), CaptureError> {
        match self.try_setup(requested, dma_export) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("capture setup failed, releasing partial state: {e}");
                if let Err(cleanup) = self.shutdown() {
                    warn!("cleanup after failed setup: {cleanup}");
                }
                Err(e)
            }
        }
    }

    fn try_setup(&mut self, requested: u32, dma_export: bool) -> Result<(), CaptureError> {
        self.negotiate_and_allocate(requested, dma_export)?;
        self.map_all()?;
        self.queue_all()?;
        self.start()
    }

    /// Stop streaming and release kernel buffers. The release runs even if
    /// stopping fails; the buffers matter more than the stream state.
    pub fn shutdown(&mut self) -> Result<(), CaptureError> {
        if let Err(e) = self.stop() {
            warn!("stream off during shutdown: {e}");
        }
        self.release_all()
    }
}

impl FrameSource for CaptureSession {
    fn buffer_count(&self) -> usize {
        self.granted
    }

    /// Block until the driver hands over a filled buffer.
    fn dequeue(&mut self) -> Result<usize, CaptureError> {
        let mut planes = [V4l2Plane::zeroed(); NUM_PLANES];
        let mut buf = V4l2Buffer::for_planes(
            0,
            V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
            V4L2_MEMORY_MMAP,
            &mut planes,
        );
        unsafe { ioctl::vidioc_dqbuf(self.device.fd(), &mut buf) }.map_err(|source| {
            CaptureError::IoFailed {
                op: "VIDIOC_DQBUF",
                source,
            }
        })?;

        let index = buf.index as usize;
        debug_assert!(index < self.granted, "kernel returned buffer {index}");
        let record = self.table.get_mut(index);
        debug_assert_eq!(
            record.owner,
            BufferOwner::Kernel,
            "dequeued buffer {index} was not kernel-owned"
        );
        record.owner = BufferOwner::User;
        Ok(index)
    }

    fn requeue(&mut self, index: usize) -> Result<(), CaptureError> {
        debug_assert_eq!(
            self.table.get(index).owner,
            BufferOwner::User,
            "requeue of kernel-owned buffer {index}"
        );
        self.queue_buffer(index)
            .map_err(|source| CaptureError::IoFailed {
                op: "VIDIOC_QBUF",
                source,
            })
    }

    fn frame(&self, index: usize) -> FrameHandoff<'_> {
        let record = self.table.get(index);
        let planes = [0usize, 1].map(|p| {
            let plane = &record.planes[p];
            let map = plane.map.as_ref().expect("frame planes not mapped");
            PlaneView {
                // Aliases the kernel mapping; the borrow on `self` keeps it
                // from outliving a requeue, which needs `&mut self`.
                data: unsafe { slice::from_raw_parts(map.as_ptr(), plane.length as usize) },
                stride: plane.stride,
            }
        });
        FrameHandoff {
            planes,
            width: self.width,
            height: self.height,
        }
    }
}
