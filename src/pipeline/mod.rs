//! The steady-state capture loop: dequeue, render, requeue.
//!
//! Exactly one buffer is outside the kernel queue at a time, which bounds
//! preview latency but means a slow render stalls new captures. Acceptable
//! for a live preview; a deeper in-flight window is not attempted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use metrics::histogram;
use tracing::{info, instrument};

use crate::capture::controls::CameraControls;
use crate::capture::device::ControlSink;
use crate::display::{FrameHandoff, RenderStatus, Renderer};
use crate::error::CaptureError;

/// Source of filled frames: the capture session in production, a scripted
/// fake in tests.
pub trait FrameSource {
    fn buffer_count(&self) -> usize;

    /// Block until the kernel hands over a filled buffer; returns its index.
    fn dequeue(&mut self) -> Result<usize, CaptureError>;

    /// Return a buffer to the kernel queue for refill. After this the
    /// buffer's planes may be overwritten at any time.
    fn requeue(&mut self, index: usize) -> Result<(), CaptureError>;

    /// Borrow the mapped planes of a buffer. The handoff holds a shared
    /// borrow, so `requeue` cannot be called while it is alive.
    fn frame(&self, index: usize) -> FrameHandoff<'_>;
}

/// Why the loop stopped cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The renderer reported a quit request.
    QuitRequested,
    /// The termination signal was observed between iterations.
    Interrupted,
    /// The configured frame limit was reached.
    LimitReached,
}

/// Run the capture-display loop until quit, signal, frame limit, or error.
///
/// The renderer is primed with the first buffer's planes before streaming so
/// it can finish one-time setup against a representative frame shape. Each
/// iteration then dequeues one buffer, dispatches pending key presses to the
/// camera controls, renders synchronously, and requeues the same buffer.
///
/// On an error return no teardown has happened; the owning scope still must
/// release the kernel buffers.
#[instrument(skip_all)]
pub fn run<S, R, C>(
    source: &mut S,
    renderer: &mut R,
    controls: &mut CameraControls<C>,
    stop: &AtomicBool,
    frame_limit: u64,
) -> Result<LoopExit, CaptureError>
where
    S: FrameSource,
    R: Renderer,
    C: ControlSink,
{
    renderer.setup(&source.frame(0))?;
    info!("Entering capture loop over {} buffers", source.buffer_count());

    let mut rendered: u64 = 0;
    loop {
        // Cooperative cancellation: checked once per iteration, never
        // pre-emptively. The handler only sets the flag; buffers are
        // released by the caller after we unwind.
        if stop.load(Ordering::Relaxed) {
            info!("termination signal observed, leaving capture loop");
            return Ok(LoopExit::Interrupted);
        }

        let wait = Instant::now();
        let index = source.dequeue()?;
        histogram!("dequeue_wait_us").record(wait.elapsed().as_micros() as f64);

        for key in renderer.poll_keys() {
            controls.handle_key(key);
        }

        let status = {
            let frame = source.frame(index);
            renderer.render(&frame)?
        };
        if status == RenderStatus::Quit {
            info!("Exiting display loop normally");
            return Ok(LoopExit::QuitRequested);
        }

        // The planes are duplicated on the GPU; the kernel may refill them.
        source.requeue(index)?;

        rendered += 1;
        if frame_limit > 0 && rendered >= frame_limit {
            info!("Captured {rendered} frames, stopping");
            return Ok(LoopExit::LimitReached);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::PlaneView;
    use crate::error::DisplayError;
    use nix::errno::Errno;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Step {
        Dequeue(usize),
        Requeue(usize),
    }

    /// Scripted stand-in for the capture session. Buffers cycle in order;
    /// ownership is tracked so a use-after-requeue fails the test.
    struct FakeSource {
        count: usize,
        next: usize,
        user_owned: Vec<bool>,
        fail_dequeue_at: Option<usize>,
        dequeues: usize,
        log: Vec<Step>,
        planes: Vec<Vec<u8>>,
    }

    impl FakeSource {
        fn new(count: usize) -> Self {
            Self {
                count,
                next: 0,
                user_owned: vec![false; count],
                fail_dequeue_at: None,
                dequeues: 0,
                log: Vec::new(),
                planes: vec![vec![0u8; 64]; count],
            }
        }
    }

    impl FrameSource for FakeSource {
        fn buffer_count(&self) -> usize {
            self.count
        }

        fn dequeue(&mut self) -> Result<usize, CaptureError> {
            if self.fail_dequeue_at == Some(self.dequeues) {
                return Err(CaptureError::IoFailed {
                    op: "VIDIOC_DQBUF",
                    source: Errno::EIO,
                });
            }
            let index = self.next;
            self.next = (self.next + 1) % self.count;
            self.dequeues += 1;
            assert!(!self.user_owned[index], "buffer {index} dequeued twice");
            self.user_owned[index] = true;
            self.log.push(Step::Dequeue(index));
            Ok(index)
        }

        fn requeue(&mut self, index: usize) -> Result<(), CaptureError> {
            assert!(self.user_owned[index], "requeue of kernel-owned buffer");
            self.user_owned[index] = false;
            self.log.push(Step::Requeue(index));
            Ok(())
        }

        fn frame(&self, index: usize) -> FrameHandoff<'_> {
            let data = &self.planes[index];
            FrameHandoff {
                planes: [
                    PlaneView { data, stride: 8 },
                    PlaneView { data, stride: 8 },
                ],
                width: 8,
                height: 8,
            }
        }
    }

    struct FakeRenderer {
        setup_calls: usize,
        renders: usize,
        quit_after: Option<usize>,
        abort_after: Option<usize>,
        keys_once: Vec<char>,
        stop_flag: Option<&'static AtomicBool>,
    }

    impl FakeRenderer {
        fn new() -> Self {
            Self {
                setup_calls: 0,
                renders: 0,
                quit_after: None,
                abort_after: None,
                keys_once: Vec::new(),
                stop_flag: None,
            }
        }
    }

    impl Renderer for FakeRenderer {
        fn setup(&mut self, hint: &FrameHandoff<'_>) -> Result<(), DisplayError> {
            assert!(!hint.planes[0].data.is_empty());
            self.setup_calls += 1;
            Ok(())
        }

        fn poll_keys(&mut self) -> Vec<char> {
            std::mem::take(&mut self.keys_once)
        }

        fn render(&mut self, frame: &FrameHandoff<'_>) -> Result<RenderStatus, DisplayError> {
            assert_eq!(frame.planes.len(), 2);
            if self.abort_after == Some(self.renders) {
                return Err(DisplayError("gpu lost".to_string()));
            }
            if self.quit_after == Some(self.renders) {
                return Ok(RenderStatus::Quit);
            }
            self.renders += 1;
            if let Some(flag) = self.stop_flag {
                flag.store(true, Ordering::Relaxed);
            }
            Ok(RenderStatus::Continue)
        }
    }

    /// Recording sink for the camera controls used in the key-dispatch test.
    struct NullSink {
        writes: Vec<(u32, i32)>,
    }

    impl ControlSink for NullSink {
        fn write_control(&mut self, id: u32, value: i32) -> Result<(), CaptureError> {
            self.writes.push((id, value));
            Ok(())
        }
    }

    fn null_controls() -> CameraControls<NullSink> {
        CameraControls::new(NullSink { writes: Vec::new() })
    }

    #[test]
    fn frame_limit_bounds_the_loop_and_indices_cycle_granted_buffers() {
        let mut source = FakeSource::new(3);
        let mut renderer = FakeRenderer::new();
        let mut controls = null_controls();
        let stop = AtomicBool::new(false);

        let exit = run(&mut source, &mut renderer, &mut controls, &stop, 6).unwrap();
        assert_eq!(exit, LoopExit::LimitReached);
        assert_eq!(renderer.setup_calls, 1);
        assert_eq!(renderer.renders, 6);

        let dequeued: Vec<usize> = source
            .log
            .iter()
            .filter_map(|s| match s {
                Step::Dequeue(i) => Some(*i),
                _ => None,
            })
            .collect();
        assert_eq!(dequeued, vec![0, 1, 2, 0, 1, 2]);
        assert!(dequeued.iter().all(|&i| i < 3));
    }

    #[test]
    fn one_buffer_in_flight_and_requeues_follow_their_dequeue() {
        let mut source = FakeSource::new(2);
        let mut renderer = FakeRenderer::new();
        let mut controls = null_controls();
        let stop = AtomicBool::new(false);

        run(&mut source, &mut renderer, &mut controls, &stop, 4).unwrap();

        // The log alternates dequeue(i), requeue(i) with nothing reordered;
        // the ownership asserts in the fake already failed otherwise.
        let mut outstanding = None;
        for step in &source.log {
            match *step {
                Step::Dequeue(i) => {
                    assert_eq!(outstanding, None, "two buffers in flight");
                    outstanding = Some(i);
                }
                Step::Requeue(i) => {
                    assert_eq!(outstanding, Some(i), "requeue out of order");
                    outstanding = None;
                }
            }
        }
        assert_eq!(outstanding, None);
    }

    #[test]
    fn quit_from_renderer_stops_cleanly_without_requeue_or_further_dequeue() {
        let mut source = FakeSource::new(3);
        let mut renderer = FakeRenderer::new();
        renderer.quit_after = Some(2);
        let mut controls = null_controls();
        let stop = AtomicBool::new(false);

        let exit = run(&mut source, &mut renderer, &mut controls, &stop, 0).unwrap();
        assert_eq!(exit, LoopExit::QuitRequested);
        assert_eq!(source.dequeues, 3);
        // The buffer whose render reported quit is never requeued.
        assert_eq!(
            source.log.iter().filter(|s| matches!(s, Step::Requeue(_))).count(),
            2
        );
    }

    #[test]
    fn dequeue_error_terminates_without_a_requeue_attempt() {
        let mut source = FakeSource::new(2);
        source.fail_dequeue_at = Some(1);
        let mut renderer = FakeRenderer::new();
        let mut controls = null_controls();
        let stop = AtomicBool::new(false);

        let err = run(&mut source, &mut renderer, &mut controls, &stop, 0).unwrap_err();
        assert!(matches!(err, CaptureError::IoFailed { .. }));
        assert_eq!(
            source.log.iter().filter(|s| matches!(s, Step::Requeue(_))).count(),
            1,
            "only the successfully rendered frame is requeued"
        );
    }

    #[test]
    fn render_abort_propagates_as_an_error() {
        let mut source = FakeSource::new(2);
        let mut renderer = FakeRenderer::new();
        renderer.abort_after = Some(0);
        let mut controls = null_controls();
        let stop = AtomicBool::new(false);

        let err = run(&mut source, &mut renderer, &mut controls, &stop, 0).unwrap_err();
        assert!(matches!(err, CaptureError::RenderFailed(_)));
    }

    #[test]
    fn stop_flag_is_observed_between_iterations() {
        static STOP: AtomicBool = AtomicBool::new(false);
        STOP.store(false, Ordering::Relaxed);

        let mut source = FakeSource::new(2);
        let mut renderer = FakeRenderer::new();
        renderer.stop_flag = Some(&STOP);
        let mut controls = null_controls();

        let exit = run(&mut source, &mut renderer, &mut controls, &STOP, 0).unwrap();
        assert_eq!(exit, LoopExit::Interrupted);
        // The flag was raised during the first render, so exactly one frame
        // completed its full dequeue-render-requeue cycle.
        assert_eq!(source.dequeues, 1);
        assert_eq!(renderer.renders, 1);
    }

    #[test]
    fn pressed_keys_reach_the_camera_controls() {
        let mut source = FakeSource::new(2);
        let mut renderer = FakeRenderer::new();
        renderer.keys_once = vec!['t'];
        let mut controls = null_controls();
        let stop = AtomicBool::new(false);

        run(&mut source, &mut renderer, &mut controls, &stop, 1).unwrap();
        assert_eq!(controls.test_pattern(), 1);
    }
}
