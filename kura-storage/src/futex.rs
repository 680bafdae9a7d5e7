//! Futex wait/wake on 32-bit serial words.
//!
//! The words live in file-backed shared mappings, so the non-private futex
//! ops are required: waiters and the writer are different processes. On
//! non-Linux hosts a short-sleep polling loop provides the same contract.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[cfg(target_os = "linux")]
mod sys {
    use super::*;

    fn futex(word: &AtomicU32, op: libc::c_int, val: u32, timeout: *const libc::timespec) -> i64 {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                op,
                val,
                timeout,
                0usize,
                0u32,
            ) as i64
        }
    }

    /// Block until `word` is woken or no longer holds `expected`.
    /// Returns `false` only on timeout.
    pub(super) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
        let ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);
        let rc = futex(word, libc::FUTEX_WAIT, expected, ts_ptr);
        if rc == -1 {
            if let Some(libc::ETIMEDOUT) = std::io::Error::last_os_error().raw_os_error() {
                return false;
            }
        }
        // 0 (woken), EAGAIN (value already changed), or EINTR: caller rechecks.
        true
    }

    pub(super) fn wake_all(word: &AtomicU32) {
        futex(word, libc::FUTEX_WAKE, i32::MAX as u32, std::ptr::null());
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use super::*;
    use std::time::Instant;

    const POLL_INTERVAL: Duration = Duration::from_millis(1);

    pub(super) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if word.load(Ordering::Acquire) != expected {
                return true;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub(super) fn wake_all(_word: &AtomicU32) {}
}

/// Wake every waiter parked on `word`.
pub fn wake_all(word: &AtomicU32) {
    sys::wake_all(word);
}

/// Wait until `word` differs from `old`, or until `timeout` elapses.
///
/// Returns the new value, or `None` on timeout. Spurious wakeups and signal
/// interruptions re-enter the wait; the relative timeout is re-armed on each
/// iteration, matching the daemon-side contract that a wait bounds the idle
/// interval rather than total elapsed time.
pub fn wait_for_change(word: &AtomicU32, old: u32, timeout: Option<Duration>) -> Option<u32> {
    loop {
        if !sys::wait(word, old, timeout) {
            return None;
        }
        let new = word.load(Ordering::Acquire);
        if new != old {
            return Some(new);
        }
    }
}
