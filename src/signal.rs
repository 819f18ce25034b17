//! The thaw-signal transport used by the Engine Invoker (C3).
//!
//! `nix` does not safely wrap `sigwaitinfo`/`sigqueue`, so this module goes
//! straight to `libc`, the same way the teacher reaches past `nix`'s ioctl
//! coverage and drives raw `ioctl()` through its own `ioctl_*!` macros when
//! the safe wrapper doesn't exist.

use std::mem::MaybeUninit;
use std::time::Duration;

use log::{debug, trace};
use nix::errno::Errno;
use nix::sys::signal::{SigSet, SigmaskHow, Signal, sigprocmask};

use crate::error::CrError;

/// The dedicated real-time signal used for the thaw handshake (spec §4.3,
/// §6: `SIGRTMIN + 2`).
pub fn restore_signal() -> Signal {
    let raw = libc::SIGRTMIN() + 2;
    Signal::try_from(raw).expect("SIGRTMIN + 2 must be a valid real-time signal")
}

/// What arrived on `restore_signal()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThawNotice {
    /// `si_int > 0`: the restore-blob identifier.
    BlobReady(i32),
    /// `si_int == 0`: thaw completed, no blob to read.
    NoBlob,
    /// `si_int < 0`: the engine reported failure.
    EngineFailed(i32),
}

/// Blocks `restore_signal()` in this thread's mask, returning the previous
/// mask so it can be restored later. Must happen before `fork()`+`execv` so
/// the signal cannot be lost to a default handler (spec §4.6 "Shared-resource
/// policy").
pub fn block_restore_signal() -> Result<SigSet, CrError> {
    let mut to_block = SigSet::empty();
    to_block.add(restore_signal());
    let mut previous = SigSet::empty();
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&to_block), Some(&mut previous))
        .map_err(|e| CrError::Io("sigprocmask(SIG_BLOCK)".into(), e.into()))?;
    debug!("blocked {:?} ahead of engine invocation", restore_signal());
    Ok(previous)
}

/// Restores a previously-saved signal mask.
pub fn restore_mask(previous: &SigSet) -> Result<(), CrError> {
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(previous), None)
        .map_err(|e| CrError::Io("sigprocmask(SIG_SETMASK)".into(), e.into()))
}

/// Blocks until `restore_signal()` arrives, retrying across `EINTR` (spec
/// §4.6 "Cancellation and timeout": "`sigwaitinfo` ... handles EINTR by
/// retry"). Requires the signal to already be blocked in this thread's mask.
pub fn wait_for_thaw() -> Result<ThawNotice, CrError> {
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, restore_signal() as libc::c_int);
    }

    loop {
        let mut info: MaybeUninit<libc::siginfo_t> = MaybeUninit::uninit();
        let rc = unsafe { libc::sigwaitinfo(&set, info.as_mut_ptr()) };
        if rc == -1 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                trace!("sigwaitinfo interrupted, retrying");
                continue;
            }
            return Err(CrError::Io("sigwaitinfo".into(), errno.into()));
        }

        let info = unsafe { info.assume_init() };
        if info.si_code != libc::SI_QUEUE {
            // Some other source raised the same signal number; spec requires
            // SI_QUEUE, so keep waiting for the genuine thaw notification.
            trace!("ignoring non-SI_QUEUE delivery of restore signal");
            continue;
        }

        let si_int = unsafe { info.si_value().sival_int };
        return Ok(match si_int.cmp(&0) {
            std::cmp::Ordering::Greater => ThawNotice::BlobReady(si_int),
            std::cmp::Ordering::Equal => ThawNotice::NoBlob,
            std::cmp::Ordering::Less => ThawNotice::EngineFailed(si_int),
        });
    }
}

/// Polls for `restore_signal()` with a bounded wait, used to interleave
/// watching for thaw with watching the engine child via `waitpid` in the
/// same thread (spec §4.3 describes both the exit-status and thaw arms of
/// `AwaitingEngine` without specifying how a single thread multiplexes
/// them; see DESIGN.md). Returns `Ok(None)` on timeout.
pub fn poll_for_thaw(timeout: Duration) -> Result<Option<ThawNotice>, CrError> {
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, restore_signal() as libc::c_int);
    }
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };

    loop {
        let mut info: MaybeUninit<libc::siginfo_t> = MaybeUninit::uninit();
        let rc = unsafe { libc::sigtimedwait(&set, info.as_mut_ptr(), &ts) };
        if rc == -1 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                continue;
            }
            if errno == Errno::EAGAIN {
                return Ok(None);
            }
            return Err(CrError::Io("sigtimedwait".into(), errno.into()));
        }

        let info = unsafe { info.assume_init() };
        if info.si_code != libc::SI_QUEUE {
            continue;
        }
        let si_int = unsafe { info.si_value().sival_int };
        return Ok(Some(match si_int.cmp(&0) {
            std::cmp::Ordering::Greater => ThawNotice::BlobReady(si_int),
            std::cmp::Ordering::Equal => ThawNotice::NoBlob,
            std::cmp::Ordering::Less => ThawNotice::EngineFailed(si_int),
        }));
    }
}

/// Queues `restore_signal()` with `value` in `si_int` to `pid` (used by test
/// harnesses standing in for the external engine).
pub fn send_thaw(pid: libc::pid_t, value: i32) -> Result<(), CrError> {
    let sigval = libc::sigval { sival_int: value };
    let rc = unsafe { libc::sigqueue(pid, restore_signal() as libc::c_int, sigval) };
    if rc == -1 {
        return Err(CrError::Io("sigqueue".into(), Errno::last().into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    // S6-adjacent: exercises the full block -> sigqueue -> sigwaitinfo loop
    // within a single process, standing in for the engine's delivery.
    #[test]
    #[serial]
    fn thaw_notice_carries_sival_int() {
        let previous = block_restore_signal().unwrap();
        let pid = nix::unistd::getpid();

        send_thaw(pid.as_raw(), 7).unwrap();
        assert_eq!(wait_for_thaw().unwrap(), ThawNotice::BlobReady(7));

        send_thaw(pid.as_raw(), 0).unwrap();
        assert_eq!(wait_for_thaw().unwrap(), ThawNotice::NoBlob);

        send_thaw(pid.as_raw(), -1).unwrap();
        assert_eq!(wait_for_thaw().unwrap(), ThawNotice::EngineFailed(-1));

        restore_mask(&previous).unwrap();
    }

    #[test]
    #[serial]
    fn poll_for_thaw_times_out_then_observes_delivery() {
        let previous = block_restore_signal().unwrap();
        let pid = nix::unistd::getpid();

        assert_eq!(poll_for_thaw(Duration::from_millis(20)).unwrap(), None);

        send_thaw(pid.as_raw(), 3).unwrap();
        assert_eq!(
            poll_for_thaw(Duration::from_millis(500)).unwrap(),
            Some(ThawNotice::BlobReady(3))
        );

        restore_mask(&previous).unwrap();
    }
}
