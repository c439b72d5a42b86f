//! Error taxonomy for the capture and display pipeline.

use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

/// Failures raised by device acquisition, the buffer lifecycle, and the
/// capture loop. Setup-time variants are unrecoverable for the run; the
/// owning scope tears down whatever was acquired and exits non-zero.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("unable to open {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} does not advertise {missing}")]
    CapabilityMissing {
        path: PathBuf,
        missing: &'static str,
    },

    #[error("device rejected {request}: {source}")]
    DeviceRejected {
        request: &'static str,
        #[source]
        source: Errno,
    },

    #[error("unable to map plane {plane} of buffer {buffer}: {source}")]
    MapFailed {
        buffer: usize,
        plane: usize,
        #[source]
        source: io::Error,
    },

    #[error("unable to queue buffer {buffer}: {source}")]
    QueueFailed {
        buffer: usize,
        #[source]
        source: Errno,
    },

    #[error("{op} failed: {source}")]
    IoFailed {
        op: &'static str,
        #[source]
        source: Errno,
    },

    /// A focus or test-pattern write the sub-device refused. Logged by the
    /// control state machine, never fatal to the capture pipeline.
    #[error("control 0x{id:08x} rejected: {source}")]
    ControlRejected {
        id: u32,
        #[source]
        source: Errno,
    },

    #[error("render failed: {0}")]
    RenderFailed(#[from] DisplayError),
}

/// Display-side failure. SDL reports errors as strings.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct DisplayError(pub String);

impl From<String> for DisplayError {
    fn from(message: String) -> Self {
        Self(message)
    }
}
