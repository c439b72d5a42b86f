//! Focus and test-pattern state machines driven by keyboard input.
//!
//! Both sub-machines share the sensor sub-device as their control channel.
//! A rejected control write degrades functionality but never stops capture,
//! so rejections are logged and the recorded state rolls back to what the
//! hardware last accepted.

use tracing::{debug, info, warn};

use crate::capture::device::ControlSink;
use crate::capture::ioctl::{
    V4L2_CID_3A_LOCK, V4L2_CID_AUTO_FOCUS_START, V4L2_CID_FOCUS_AUTO, V4L2_CID_TEST_PATTERN,
    V4L2_LOCK_FOCUS,
};

/// Focus control states of the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FocusState {
    /// Focus at the home position, no focus control running.
    #[default]
    Idle,
    /// Continuous auto focus is running.
    Auto,
    /// A single-shot focus ran and that position is held.
    SingleShot,
    /// Focus locked where it was when pause was commanded.
    Paused,
}

/// Sensor mode in live view; test patterns occupy 1 through 3.
const TEST_PATTERN_LIVE: i32 = 0;
const TEST_PATTERN_COUNT: i32 = 3;

/// Camera runtime state plus the control channel it is issued over.
pub struct CameraControls<S> {
    sink: S,
    focus: FocusState,
    test_pattern: i32,
}

impl<S: ControlSink> CameraControls<S> {
    /// Streaming start leaves the sensor in continuous auto focus and live
    /// view; the recorded state starts from there.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            focus: FocusState::Auto,
            test_pattern: TEST_PATTERN_LIVE,
        }
    }

    pub fn focus(&self) -> FocusState {
        self.focus
    }

    pub fn test_pattern(&self) -> i32 {
        self.test_pattern
    }

    /// Dispatch one recognized key press. `q` is owned by the display and
    /// never reaches this point.
    pub fn handle_key(&mut self, key: char) {
        match key {
            'h' => print_key_help(),
            'a' => self.request_focus(FocusState::Auto),
            'f' => self.request_focus(FocusState::SingleShot),
            'p' => self.request_focus(FocusState::Paused),
            't' => self.cycle_test_pattern(),
            'l' => self.live_view(),
            _ => {}
        }
    }

    /// Walk the focus transition table. Pairs outside the table are true
    /// no-ops: no state change and no control write.
    pub fn request_focus(&mut self, requested: FocusState) {
        use FocusState::*;

        let transition = match (self.focus, requested) {
            (Idle, Auto) => Some((Auto, V4L2_CID_FOCUS_AUTO, 1, "Focus auto")),
            (Idle, SingleShot) => Some((SingleShot, V4L2_CID_AUTO_FOCUS_START, 1, "Focus single")),
            (Auto, Auto) => Some((Idle, V4L2_CID_FOCUS_AUTO, 0, "Focus disable")),
            (Auto, Paused) => Some((Paused, V4L2_CID_3A_LOCK, V4L2_LOCK_FOCUS, "Focus pause")),
            (Auto, SingleShot) => Some((SingleShot, V4L2_CID_AUTO_FOCUS_START, 1, "Focus single")),
            (SingleShot, SingleShot) => {
                Some((SingleShot, V4L2_CID_AUTO_FOCUS_START, 1, "Focus single"))
            }
            (SingleShot, Paused) => Some((Paused, V4L2_CID_3A_LOCK, V4L2_LOCK_FOCUS, "Focus pause")),
            (SingleShot, Auto) => Some((Auto, V4L2_CID_FOCUS_AUTO, 1, "Focus auto")),
            (Paused, Auto) => Some((Auto, V4L2_CID_FOCUS_AUTO, 1, "Focus auto")),
            (Paused, SingleShot) => Some((SingleShot, V4L2_CID_AUTO_FOCUS_START, 1, "Focus single")),
            _ => None,
        };

        let Some((next, id, value, label)) = transition else {
            debug!("No focus transition from {:?} on {:?}", self.focus, requested);
            return;
        };

        match self.sink.write_control(id, value) {
            Ok(()) => {
                self.focus = next;
                info!("{label}");
            }
            Err(e) => warn!("{label} rejected, keeping {:?}: {e}", self.focus),
        }
    }

    /// Advance to the next test pattern, wrapping 3 back to 1. Live view is
    /// never re-entered while cycling.
    pub fn cycle_test_pattern(&mut self) {
        let mut next = (self.test_pattern + 1) % (TEST_PATTERN_COUNT + 1);
        if next == TEST_PATTERN_LIVE {
            next = 1;
        }
        self.set_test_pattern(next, "Test pattern");
    }

    /// Return the sensor to live view.
    pub fn live_view(&mut self) {
        self.set_test_pattern(TEST_PATTERN_LIVE, "Live view");
    }

    fn set_test_pattern(&mut self, value: i32, label: &str) {
        match self.sink.write_control(V4L2_CID_TEST_PATTERN, value) {
            Ok(()) => {
                self.test_pattern = value;
                if value == TEST_PATTERN_LIVE {
                    info!("{label}");
                } else {
                    info!("{label} {value}");
                }
            }
            Err(e) => warn!(
                "{label} rejected, keeping pattern {}: {e}",
                self.test_pattern
            ),
        }
    }
}

/// Keyboard shortcut summary, printed on startup and on `h`.
pub fn print_key_help() {
    info!("Keyboard Shortcuts");
    info!("q - quit application.");
    info!("a - Toggle between continuous auto focus and no focus control.");
    info!("f - Run a single auto focus and hold.");
    info!("p - Hold focus at the point when the button is pressed.");
    info!("t - Cycle through three sensor test patterns.");
    info!("l - Select sensor live view.");
    info!("h - Print this menu.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaptureError;
    use nix::errno::Errno;

    /// Records every control write; optionally refuses them all.
    struct RecordingSink {
        writes: Vec<(u32, i32)>,
        reject: bool,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                writes: Vec::new(),
                reject: false,
            }
        }
    }

    impl ControlSink for RecordingSink {
        fn write_control(&mut self, id: u32, value: i32) -> Result<(), CaptureError> {
            if self.reject {
                return Err(CaptureError::ControlRejected {
                    id,
                    source: Errno::EINVAL,
                });
            }
            self.writes.push((id, value));
            Ok(())
        }
    }

    fn controls_at(state: FocusState) -> CameraControls<RecordingSink> {
        let mut c = CameraControls::new(RecordingSink::new());
        c.focus = state;
        c
    }

    #[test]
    fn focus_table_is_exact() {
        use FocusState::*;
        let table: &[(FocusState, FocusState, FocusState, u32, i32)] = &[
            (Idle, Auto, Auto, V4L2_CID_FOCUS_AUTO, 1),
            (Idle, SingleShot, SingleShot, V4L2_CID_AUTO_FOCUS_START, 1),
            (Auto, Auto, Idle, V4L2_CID_FOCUS_AUTO, 0),
            (Auto, Paused, Paused, V4L2_CID_3A_LOCK, V4L2_LOCK_FOCUS),
            (Auto, SingleShot, SingleShot, V4L2_CID_AUTO_FOCUS_START, 1),
            (SingleShot, SingleShot, SingleShot, V4L2_CID_AUTO_FOCUS_START, 1),
            (SingleShot, Paused, Paused, V4L2_CID_3A_LOCK, V4L2_LOCK_FOCUS),
            (SingleShot, Auto, Auto, V4L2_CID_FOCUS_AUTO, 1),
            (Paused, Auto, Auto, V4L2_CID_FOCUS_AUTO, 1),
            (Paused, SingleShot, SingleShot, V4L2_CID_AUTO_FOCUS_START, 1),
        ];

        for &(start, requested, expected, id, value) in table {
            let mut c = controls_at(start);
            c.request_focus(requested);
            assert_eq!(c.focus(), expected, "{start:?} -> {requested:?}");
            assert_eq!(
                c.sink.writes,
                vec![(id, value)],
                "{start:?} -> {requested:?}"
            );
        }
    }

    #[test]
    fn undefined_pairs_skip_the_kernel_entirely() {
        use FocusState::*;
        for (start, requested) in [
            (Idle, Idle),
            (Idle, Paused),
            (Auto, Idle),
            (SingleShot, Idle),
            (Paused, Idle),
            (Paused, Paused),
        ] {
            let mut c = controls_at(start);
            c.request_focus(requested);
            assert_eq!(c.focus(), start, "{start:?} -> {requested:?}");
            assert!(c.sink.writes.is_empty(), "{start:?} -> {requested:?}");
        }
    }

    #[test]
    fn single_shot_retrigger_reissues_the_control() {
        let mut c = controls_at(FocusState::Idle);
        c.request_focus(FocusState::SingleShot);
        assert_eq!(c.focus(), FocusState::SingleShot);

        c.request_focus(FocusState::SingleShot);
        assert_eq!(c.focus(), FocusState::SingleShot);
        assert_eq!(
            c.sink.writes,
            vec![
                (V4L2_CID_AUTO_FOCUS_START, 1),
                (V4L2_CID_AUTO_FOCUS_START, 1)
            ]
        );
    }

    #[test]
    fn rejected_focus_write_rolls_the_state_back() {
        let mut c = controls_at(FocusState::Idle);
        c.sink.reject = true;
        c.request_focus(FocusState::Auto);
        assert_eq!(c.focus(), FocusState::Idle);
    }

    #[test]
    fn test_pattern_cycles_one_two_three_and_wraps() {
        let mut c = controls_at(FocusState::Idle);
        let mut seen = Vec::new();
        for _ in 0..7 {
            c.cycle_test_pattern();
            seen.push(c.test_pattern());
        }
        assert_eq!(seen, vec![1, 2, 3, 1, 2, 3, 1]);
        assert!(seen.iter().all(|&p| p != TEST_PATTERN_LIVE));
    }

    #[test]
    fn live_view_resets_and_cycling_restarts_from_one() {
        let mut c = controls_at(FocusState::Idle);
        c.cycle_test_pattern();
        c.cycle_test_pattern();
        c.live_view();
        assert_eq!(c.test_pattern(), TEST_PATTERN_LIVE);

        c.cycle_test_pattern();
        assert_eq!(c.test_pattern(), 1);
        assert_eq!(c.sink.writes.last(), Some(&(V4L2_CID_TEST_PATTERN, 1)));
    }

    #[test]
    fn rejected_pattern_write_keeps_the_previous_pattern() {
        let mut c = controls_at(FocusState::Idle);
        c.cycle_test_pattern();
        c.sink.reject = true;
        c.cycle_test_pattern();
        assert_eq!(c.test_pattern(), 1);
    }

    #[test]
    fn keys_map_to_the_documented_actions() {
        let mut c = controls_at(FocusState::Idle);
        c.handle_key('f');
        assert_eq!(c.focus(), FocusState::SingleShot);

        c.handle_key('t');
        assert_eq!(c.test_pattern(), 1);

        c.handle_key('l');
        assert_eq!(c.test_pattern(), TEST_PATTERN_LIVE);

        let before = c.sink.writes.len();
        c.handle_key('x');
        assert_eq!(c.sink.writes.len(), before);
    }
}
