//! FD Inventory (C1): enumerate and classify every open file descriptor.

use std::ffi::OsStr;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;

use bitflags::bitflags;
use log::{debug, warn};
use nix::dir::Dir;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::stat::{Mode, fstat};

use crate::error::CrError;

bitflags! {
    /// Per-descriptor marks. Only `CANT_RESTORE` is defined today; the
    /// bitset leaves room for future marks without changing `FdInfo`'s layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdMark: u32 {
        /// readlink target contains " (deleted)", link count is zero, or the
        /// basename matches the NFS silly-rename pattern.
        const CANT_RESTORE = 0b0000_0001;
    }
}

/// Classification result for a single descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdState {
    /// Could not be stat'd; excluded from classification.
    Invalid,
    /// errno while probing; excluded from classification.
    Closed,
    /// The canonical instance of its open-file-description.
    Root,
    /// Shares an open-file-description with the `usize`-th entry (a `Root`).
    DupOf(usize),
}

/// Per-descriptor inventory record (spec §3, `FDInfo`).
#[derive(Debug, Clone)]
pub struct FdInfo {
    pub fd: RawFd,
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub state: FdState,
    pub mark: FdMark,
    pub flags: i32,
}

impl FdInfo {
    pub fn is_cant_restore(&self) -> bool {
        self.mark.contains(FdMark::CANT_RESTORE)
    }
}

/// A descriptor's identity as observed at VM-init time (spec §4.5 point 2:
/// a "preexisting" descriptor is one claim-exempt only if it is "the same
/// identity now" — a number reused after close+reopen does not count).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreexistingFd {
    pub fd: RawFd,
    pub dev: u64,
    pub ino: u64,
}

/// Snapshots identity for every currently-open descriptor. Callers hold the
/// VM-init-time result and pass it into [`crate::checkpoint`] on every later
/// attempt as `preexisting`.
pub fn capture_preexisting() -> Result<Vec<PreexistingFd>, CrError> {
    Ok(initialize()?
        .into_iter()
        .filter(|info| !matches!(info.state, FdState::Closed))
        .map(|info| PreexistingFd {
            fd: info.fd,
            dev: info.dev,
            ino: info.ino,
        })
        .collect())
}

/// Enumerate every open descriptor (excluding the directory handle used to
/// perform the enumeration) and classify it.
///
/// Stable within one invocation; no ordering across invocations is promised
/// (spec §4.1).
pub fn initialize() -> Result<Vec<FdInfo>, CrError> {
    let listing = Dir::open(
        "/proc/self/fd",
        OFlag::O_RDONLY | OFlag::O_DIRECTORY,
        Mode::empty(),
    )
    .map_err(|e| CrError::Io("open /proc/self/fd".into(), e.into()))?;
    let exclude_fd = listing.as_raw_fd();

    let mut fds: Vec<RawFd> = Vec::new();
    for entry in listing {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("failed to read /proc/self/fd entry: {e}");
                continue;
            }
        };
        let name = entry.file_name().to_bytes();
        if name == b"." || name == b".." {
            continue;
        }
        if let Ok(fd) = std::str::from_utf8(name).unwrap_or("").parse::<RawFd>() {
            if fd != exclude_fd {
                fds.push(fd);
            }
        }
    }
    fds.sort_unstable();

    let mut infos: Vec<FdInfo> = fds.into_iter().map(probe_one).collect();
    classify(&mut infos);
    debug!("fd inventory: {} descriptor(s)", infos.len());
    Ok(infos)
}

fn probe_one(fd: RawFd) -> FdInfo {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let stat = match fstat(borrowed) {
        Ok(s) => s,
        Err(e) => {
            warn!("fstat(fd={fd}) failed: {e}");
            return FdInfo {
                fd,
                dev: 0,
                ino: 0,
                mode: 0,
                nlink: 0,
                state: FdState::Closed,
                mark: FdMark::empty(),
                flags: 0,
            };
        }
    };
    let flags = fcntl(borrowed, FcntlArg::F_GETFL).unwrap_or(0);

    let target = match std::fs::read_link(format!("/proc/self/fd/{fd}")) {
        Ok(target) => target,
        Err(e) => {
            warn!("readlink(/proc/self/fd/{fd}) failed: {e}");
            return FdInfo {
                fd,
                dev: 0,
                ino: 0,
                mode: 0,
                nlink: 0,
                state: FdState::Closed,
                mark: FdMark::empty(),
                flags: 0,
            };
        }
    };

    let mut mark = FdMark::empty();
    if stat.st_nlink == 0 {
        mark |= FdMark::CANT_RESTORE;
    }
    let bytes = target.as_os_str().as_bytes();
    if contains(bytes, b" (deleted)") || is_nfs_silly_rename(&target) {
        mark |= FdMark::CANT_RESTORE;
    }

    FdInfo {
        fd,
        dev: stat.st_dev as u64,
        ino: stat.st_ino,
        mode: stat.st_mode,
        nlink: stat.st_nlink as u64,
        state: FdState::Invalid,
        mark,
        flags,
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

/// `.nfs` followed by hex digits (the kernel's 16-hex-digit file handle plus
/// an 8-hex-digit generation counter); see spec §4.1.
fn is_nfs_silly_rename(path: &std::path::Path) -> bool {
    let Some(name) = path.file_name().and_then(OsStr::to_str) else {
        return false;
    };
    let Some(rest) = name.strip_prefix(".nfs") else {
        return false;
    };
    rest.len() >= 16 && rest.chars().all(|c| c.is_ascii_hexdigit())
}

/// Pairwise classification: for each not-yet-classified entry in index
/// order, mark it `Root` and probe every later entry sharing device+inode
/// and identical open-flags by toggling `O_NONBLOCK` and observing whether
/// the change is visible on the other descriptor.
fn classify(infos: &mut [FdInfo]) {
    for i in 0..infos.len() {
        if !matches!(infos[i].state, FdState::Invalid) {
            continue;
        }
        infos[i].state = FdState::Root;
        let (dev_i, ino_i, flags_i, fd_i) = (infos[i].dev, infos[i].ino, infos[i].flags, infos[i].fd);

        for j in (i + 1)..infos.len() {
            if !matches!(infos[j].state, FdState::Invalid) {
                continue;
            }
            if infos[j].dev != dev_i || infos[j].ino != ino_i || infos[j].flags != flags_i {
                continue;
            }
            if probe_shares_open_file_description(fd_i, infos[j].fd) {
                infos[j].state = FdState::DupOf(i);
            }
        }
    }

    for info in infos.iter_mut() {
        if matches!(info.state, FdState::Invalid) {
            info.state = FdState::Root;
        }
    }
}

/// Flips `O_NONBLOCK` on `a` and checks whether `b`'s flags changed too; if
/// so they share an open-file-description. Restores `a`'s original flags
/// regardless of outcome.
fn probe_shares_open_file_description(a: RawFd, b: RawFd) -> bool {
    let fd_a = unsafe { BorrowedFd::borrow_raw(a) };
    let fd_b = unsafe { BorrowedFd::borrow_raw(b) };

    let Ok(original) = fcntl(fd_a, FcntlArg::F_GETFL) else {
        return false;
    };
    let original_flags = OFlag::from_bits_truncate(original);
    let toggled = original_flags ^ OFlag::O_NONBLOCK;

    if fcntl(fd_a, FcntlArg::F_SETFL(toggled)).is_err() {
        return false;
    }

    let shares = match fcntl(fd_b, FcntlArg::F_GETFL) {
        Ok(b_flags) => OFlag::from_bits_truncate(b_flags).contains(OFlag::O_NONBLOCK) != original_flags.contains(OFlag::O_NONBLOCK),
        Err(_) => false,
    };

    let _ = fcntl(fd_a, FcntlArg::F_SETFL(original_flags));
    shares
}
