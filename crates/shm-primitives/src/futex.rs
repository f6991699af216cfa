//! Futex words for cross-process wakeup.
//!
//! A futex word is a plain `AtomicU32` that lives in shared memory. Signalers
//! bump it after publishing state; waiters sleep only while it still holds the
//! value they loaded before checking their predicate, so a wakeup between the
//! check and the sleep is never lost.
//!
//! On Linux this uses `FUTEX_WAIT`/`FUTEX_WAKE` without the private flag, so
//! waiters and wakers may sit in different processes. Other unix targets fall
//! back to a short bounded sleep.

use core::sync::atomic::{AtomicU32, Ordering};
use std::io;
use std::time::{Duration, Instant};

/// Poll interval used where no futex syscall is available.
#[cfg(not(target_os = "linux"))]
const FALLBACK_POLL: Duration = Duration::from_millis(1);

/// Sleep while `*futex == expected`, for at most `timeout`.
///
/// Returns when woken, when the value already differs, on timeout, or on a
/// signal. Callers always re-check their predicate.
#[cfg(target_os = "linux")]
pub fn futex_wait(futex: &AtomicU32, expected: u32, timeout: Option<Duration>) -> io::Result<()> {
    let ts = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(core::ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: futex points to a live AtomicU32; the kernel only reads it.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            futex.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            core::ptr::null::<u32>(),
            0u32,
        )
    };

    if ret < 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::ETIMEDOUT) | Some(libc::EINTR) => {}
            _ => return Err(err),
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(futex: &AtomicU32, expected: u32, timeout: Option<Duration>) -> io::Result<()> {
    if futex.load(Ordering::Acquire) == expected {
        let nap = timeout.map_or(FALLBACK_POLL, |t| t.min(FALLBACK_POLL));
        std::thread::sleep(nap);
    }
    Ok(())
}

/// Wake every waiter sleeping on `futex`.
#[cfg(target_os = "linux")]
fn futex_wake_all(futex: &AtomicU32) {
    // SAFETY: futex points to a live AtomicU32.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            futex.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            core::ptr::null::<libc::timespec>(),
            core::ptr::null::<u32>(),
            0u32,
        )
    };
    if ret < 0 {
        tracing::warn!(error = %io::Error::last_os_error(), "futex wake failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wake_all(_futex: &AtomicU32) {}

/// Bump the word and wake all waiters.
#[inline]
pub fn futex_signal(futex: &AtomicU32) {
    futex.fetch_add(1, Ordering::Release);
    futex_wake_all(futex);
}

/// A waitable predicate: a futex word plus the condition checked around it.
#[derive(Clone, Copy)]
pub struct Waiter<'a> {
    word: &'a AtomicU32,
}

impl<'a> Waiter<'a> {
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    /// Wake everyone waiting on this word. Call after publishing state.
    #[inline]
    pub fn notify(&self) {
        futex_signal(self.word);
    }

    /// Block until `ready()` holds or `deadline` passes.
    ///
    /// Returns the final value of `ready()`.
    pub fn wait_until(&self, deadline: Instant, mut ready: impl FnMut() -> bool) -> bool {
        loop {
            let seq = self.word.load(Ordering::Acquire);
            if ready() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if let Err(error) = futex_wait(self.word, seq, Some(deadline - now)) {
                tracing::warn!(%error, "futex wait failed, backing off");
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// [`Waiter::wait_until`] with a relative timeout.
    pub fn wait_for(&self, timeout: Duration, ready: impl FnMut() -> bool) -> bool {
        self.wait_until(Instant::now() + timeout, ready)
    }
}
