//! Stop request shared between the signal thread and the polling loop.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static STOP_SOON: AtomicBool = AtomicBool::new(false);
static STOP_SIGNAL: AtomicI32 = AtomicI32::new(0);

pub fn stop_soon() -> bool {
    STOP_SOON.load(Ordering::Acquire)
}

/// Request the driver loop to wind down, remembering which signal asked for it.
pub fn stop_req(signal: i32) {
    STOP_SIGNAL.store(signal, Ordering::Relaxed);
    STOP_SOON.store(true, Ordering::Release)
}

pub fn stop_signal() -> Option<i32> {
    match STOP_SIGNAL.load(Ordering::Relaxed) {
        0 => None,
        sig => Some(sig),
    }
}
