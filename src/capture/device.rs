//! Device acquisition: the streaming node and the sensor control sub-device.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use v4l::capability::Flags as CapFlags;
use v4l::Device;

use crate::capture::ioctl::{self, V4l2Control};
use crate::error::CaptureError;

/// V4L2 capture node validated for multi-planar streaming.
pub struct CaptureDevice {
    device: Device,
    path: PathBuf,
}

impl CaptureDevice {
    /// Open the node and verify it advertises both multi-planar capture and
    /// streaming I/O; the whole pipeline depends on both.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        let device = Device::with_path(&path).map_err(|source| CaptureError::OpenFailed {
            path: path.clone(),
            source,
        })?;

        let caps = device.query_caps().map_err(|source| CaptureError::OpenFailed {
            path: path.clone(),
            source,
        })?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE_MPLANE) {
            return Err(CaptureError::CapabilityMissing {
                path,
                missing: "multi-planar video capture",
            });
        }
        if !caps.capabilities.contains(CapFlags::STREAMING) {
            return Err(CaptureError::CapabilityMissing {
                path,
                missing: "streaming i/o",
            });
        }

        Ok(Self { device, path })
    }

    pub fn fd(&self) -> RawFd {
        self.device.handle().fd()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Blocking control-write channel shared by both control sub-machines.
pub trait ControlSink {
    fn write_control(&mut self, id: u32, value: i32) -> Result<(), CaptureError>;
}

/// Sensor sub-device exposing focus and test-pattern controls.
///
/// Sub-devices do not answer QUERYCAP the way capture nodes do, so the open
/// performs no capability check.
pub struct SubDevice {
    file: File,
    path: PathBuf,
}

impl SubDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| CaptureError::OpenFailed {
                path: path.clone(),
                source,
            })?;
        debug!("Opened sub-device {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ControlSink for SubDevice {
    fn write_control(&mut self, id: u32, value: i32) -> Result<(), CaptureError> {
        let mut ctrl = V4l2Control { id, value };
        unsafe { ioctl::vidioc_s_ctrl(self.file.as_raw_fd(), &mut ctrl) }
            .map(drop)
            .map_err(|source| CaptureError::ControlRejected { id, source })
    }
}
