//! Display contract between the capture loop and a renderer.

pub mod display;

pub use display::Sdl2Display;

use crate::error::DisplayError;

/// One mapped video plane handed to the renderer.
pub struct PlaneView<'a> {
    pub data: &'a [u8],
    /// Line stride in bytes.
    pub stride: u32,
}

/// Borrowed view of one dequeued frame: luma plane then chroma plane.
///
/// The planes alias a kernel buffer mapping and are only valid until that
/// buffer is requeued; the borrow on the capture session enforces this.
pub struct FrameHandoff<'a> {
    pub planes: [PlaneView<'a>; 2],
    pub width: u32,
    pub height: u32,
}

/// Renderer verdict for a presented frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    Continue,
    /// The user asked the display to close; stop capturing cleanly.
    Quit,
}

/// A display surface fed by the capture loop.
///
/// Modeled as a trait so the loop can run against a recording fake in tests
/// and so alternative render backends remain possible.
pub trait Renderer {
    /// One-time GPU object setup, given a representative frame shape.
    fn setup(&mut self, hint: &FrameHandoff<'_>) -> Result<(), DisplayError>;

    /// Drain pending window and keyboard events; called once per frame
    /// before `render`. Returns the pressed keys. A quit request (`q` or
    /// window close) is remembered and reported by the next `render` call.
    fn poll_keys(&mut self) -> Vec<char>;

    /// Upload both planes and present the frame. Returns only after the GPU
    /// copy and the vsync'd swap complete, so the caller may requeue the
    /// buffer immediately.
    fn render(&mut self, frame: &FrameHandoff<'_>) -> Result<RenderStatus, DisplayError>;
}
