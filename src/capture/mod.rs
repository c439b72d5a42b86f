pub mod buffer;
pub mod controls;
pub mod device;
pub mod ioctl;
pub mod session;

pub use controls::CameraControls;
pub use device::{CaptureDevice, SubDevice};
pub use session::CaptureSession;
