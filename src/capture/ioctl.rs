//! Kernel ABI for the V4L2 multi-planar streaming protocol.
//!
//! The `v4l` crate handles device open and capability queries, but does not
//! expose the multi-planar buffer lifecycle (QUERYBUF/QBUF/DQBUF with plane
//! arrays, EXPBUF, sub-device controls), so those ioctls are declared here
//! directly against the kernel structures.

use libc::{c_ulong, timeval};

/// Upper bound on kernel buffer allocations, from videodev2.h.
pub const VIDEO_MAX_FRAME: usize = 32;
pub const VIDEO_MAX_PLANES: usize = 8;

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
pub const V4L2_MEMORY_MMAP: u32 = 1;

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// NV12 with separately allocated luma and chroma planes.
pub const V4L2_PIX_FMT_NV12M: u32 = fourcc(b"NM12");

// Sub-device control ids, from v4l2-controls.h.
pub const V4L2_CID_FOCUS_AUTO: u32 = 0x009a_090c;
pub const V4L2_CID_3A_LOCK: u32 = 0x009a_091b;
pub const V4L2_CID_AUTO_FOCUS_START: u32 = 0x009a_091c;
pub const V4L2_CID_TEST_PATTERN: u32 = 0x009f_0903;
pub const V4L2_LOCK_FOCUS: i32 = 1 << 2;

#[repr(C)]
#[derive(Clone, Copy)]
pub union PlaneM {
    pub mem_offset: u32,
    pub userptr: c_ulong,
    pub fd: i32,
}

/// struct v4l2_plane
#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Plane {
    pub bytesused: u32,
    pub length: u32,
    pub m: PlaneM,
    pub data_offset: u32,
    pub reserved: [u32; 11],
}

impl V4l2Plane {
    pub fn zeroed() -> Self {
        // POD kernel struct; all-zero is its documented initial state.
        unsafe { std::mem::zeroed() }
    }
}

/// struct v4l2_timecode
#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union BufferM {
    pub offset: u32,
    pub userptr: c_ulong,
    pub planes: *mut V4l2Plane,
    pub fd: i32,
}

/// struct v4l2_buffer
///
/// For the multi-planar API, `m.planes` points at a caller-owned array of
/// `length` plane descriptors which the kernel fills on QUERYBUF/DQBUF.
#[repr(C)]
pub struct V4l2Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: timeval,
    pub timecode: V4l2Timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: BufferM,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

impl V4l2Buffer {
    /// Descriptor for buffer `index`, pointing at `planes` for the kernel to
    /// read and fill. `planes` must outlive the ioctl call.
    pub fn for_planes(index: u32, type_: u32, memory: u32, planes: &mut [V4l2Plane]) -> Self {
        let mut buf: Self = unsafe { std::mem::zeroed() };
        buf.index = index;
        buf.type_ = type_;
        buf.memory = memory;
        buf.length = planes.len() as u32;
        buf.m.planes = planes.as_mut_ptr();
        buf
    }
}

/// struct v4l2_requestbuffers
#[repr(C)]
pub struct V4l2RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

impl V4l2RequestBuffers {
    pub fn new(count: u32, type_: u32, memory: u32) -> Self {
        let mut req: Self = unsafe { std::mem::zeroed() };
        req.count = count;
        req.type_ = type_;
        req.memory = memory;
        req
    }
}

/// struct v4l2_exportbuffer
#[repr(C)]
pub struct V4l2ExportBuffer {
    pub type_: u32,
    pub index: u32,
    pub plane: u32,
    pub flags: u32,
    pub fd: i32,
    pub reserved: [u32; 11],
}

/// struct v4l2_plane_pix_format
#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2PlanePixFormat {
    pub sizeimage: u32,
    pub bytesperline: u32,
    pub reserved: [u16; 6],
}

/// struct v4l2_pix_format_mplane
#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2PixFormatMplane {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub colorspace: u32,
    pub plane_fmt: [V4l2PlanePixFormat; VIDEO_MAX_PLANES],
    pub num_planes: u8,
    pub flags: u8,
    pub ycbcr_enc: u8,
    pub quantization: u8,
    pub xfer_func: u8,
    pub reserved: [u8; 7],
}

#[repr(C)]
pub union FormatFmt {
    pub pix_mp: V4l2PixFormatMplane,
    pub raw_data: [u8; 200],
    // v4l2_format's union carries pointer-bearing members we do not declare;
    // this keeps the 8-byte alignment the C layout has.
    pub _align: [u64; 25],
}

/// struct v4l2_format
#[repr(C)]
pub struct V4l2Format {
    pub type_: u32,
    pub fmt: FormatFmt,
}

impl V4l2Format {
    pub fn zeroed(type_: u32) -> Self {
        let mut fmt: Self = unsafe { std::mem::zeroed() };
        fmt.type_ = type_;
        fmt
    }
}

/// struct v4l2_control
#[repr(C)]
pub struct V4l2Control {
    pub id: u32,
    pub value: i32,
}

nix::ioctl_readwrite!(vidioc_s_fmt, b'V', 5, V4l2Format);
nix::ioctl_readwrite!(vidioc_reqbufs, b'V', 8, V4l2RequestBuffers);
nix::ioctl_readwrite!(vidioc_querybuf, b'V', 9, V4l2Buffer);
nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, V4l2Buffer);
nix::ioctl_readwrite!(vidioc_expbuf, b'V', 16, V4l2ExportBuffer);
nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, V4l2Buffer);
nix::ioctl_write_ptr!(vidioc_streamon, b'V', 18, libc::c_int);
nix::ioctl_write_ptr!(vidioc_streamoff, b'V', 19, libc::c_int);
nix::ioctl_readwrite!(vidioc_s_ctrl, b'V', 28, V4l2Control);
