//! Device discovery and process-wide signal plumbing.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::info;
use v4l::capability::Flags;
use v4l::Device;

/// Auto-detect the first multi-planar capture device.
pub fn auto_detect_device() -> Option<String> {
    info!("Auto-detecting capture devices...");

    for i in 0..64 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        if let Ok(dev) = Device::with_path(&path) {
            if let Ok(caps) = dev.query_caps() {
                if caps.capabilities.contains(Flags::VIDEO_CAPTURE_MPLANE)
                    && caps.capabilities.contains(Flags::STREAMING)
                {
                    info!("Found multi-planar device: {} - {}", path, caps.card);
                    return Some(path);
                }
            }
        }
    }
    None
}

/// Exit flag shared with the signal handler. The kernel driver does not free
/// outstanding capture buffers when the device closes, so the handler only
/// raises this flag and the capture loop unwinds to the scope that releases
/// them.
static SIGNAL_QUIT: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_exit(_signal: libc::c_int) {
    // Nothing else is async-signal-safe to do here.
    SIGNAL_QUIT.store(true, Ordering::Relaxed);
}

/// Install the SIGINT hook and return the flag the capture loop polls once
/// per iteration.
pub fn install_signal_hook() -> nix::Result<&'static AtomicBool> {
    SIGNAL_QUIT.store(false, Ordering::Relaxed);
    let action = SigAction::new(
        SigHandler::Handler(signal_exit),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGINT, &action) }?;
    Ok(&SIGNAL_QUIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_resets_the_flag_and_handler_raises_it() {
        let flag = install_signal_hook().unwrap();
        assert!(!flag.load(Ordering::Relaxed));

        signal_exit(libc::SIGINT);
        assert!(flag.load(Ordering::Relaxed));

        let flag = install_signal_hook().unwrap();
        assert!(!flag.load(Ordering::Relaxed));
    }
}
