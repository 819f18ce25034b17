//! FD Claim & Validation (C5).

use std::os::unix::io::RawFd;

use log::{debug, warn};
use nix::sys::stat::SFlag;
use smallvec::SmallVec;

use crate::error::{CrError, FailureKind, FailureRecord};
use crate::fd_inventory::{FdInfo, PreexistingFd};

/// Default handling for a still-open descriptor a `FILE_DESCRIPTORS`-tier
/// resource did not explicitly reason about (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Claim with a deferred-exception supplier: presence is a checkpoint failure.
    Error,
    /// Close the descriptor, then claim silently.
    Close,
    /// Claim silently; the descriptor is left open across the checkpoint.
    Ignore,
    /// Re-open the descriptor after restore (claim silently; reopening itself
    /// is the claiming resource's responsibility, not this registry's).
    Reopen,
}

/// A deferred exception supplier: invoked only if the claim's presence must
/// become a checkpoint failure (the `Error` policy).
pub type DeferredFailure = Box<dyn Fn() -> Option<CrError> + Send + Sync>;

struct Claim {
    fd: RawFd,
    owner: String,
    deferred: Option<DeferredFailure>,
}

/// Per-attempt registry of file descriptors resources have claimed
/// ownership of. Fresh for every checkpoint attempt (spec §3, §4.5).
#[derive(Default)]
pub struct ClaimedFds {
    claims: Vec<Claim>,
}

impl ClaimedFds {
    pub fn new() -> Self {
        Self { claims: Vec::new() }
    }

    /// Claim `fd` on behalf of `owner`. Each fd may be claimed at most once
    /// per attempt; a second claim of the same fd is a programming error in
    /// the caller and is rejected.
    pub fn claim(
        &mut self,
        fd: RawFd,
        owner: impl Into<String>,
        deferred: Option<DeferredFailure>,
    ) -> Result<(), CrError> {
        if self.claims.iter().any(|c| c.fd == fd) {
            return Err(CrError::Setup(format!("fd={fd} claimed more than once")));
        }
        self.claims.push(Claim {
            fd,
            owner: owner.into(),
            deferred,
        });
        Ok(())
    }

    /// Convenience for the `close` policy: close the descriptor first, then
    /// claim it silently so validation does not see it at all.
    pub fn claim_and_close(&mut self, fd: RawFd, owner: impl Into<String>) -> Result<(), CrError> {
        let _ = nix::unistd::close(fd);
        self.claim(fd, owner, None)
    }

    fn find(&self, fd: RawFd) -> Option<&Claim> {
        self.claims.iter().find(|c| c.fd == fd)
    }
}

/// Validates the FD inventory against the claim registry after all
/// `beforeCheckpoint` callbacks have completed (spec §4.5).
///
/// `preexisting` is the identity of every descriptor observed open at
/// VM-init time (inherited from the parent process); matching is by
/// `(fd, dev, ino)`, not fd number alone, so a number reused after
/// close+reopen is not mistaken for the original descriptor (spec §4.5
/// point 2: "same identity now"). `diagnostic_fd` is the diagnostic command
/// socket, if any, which is always acceptable.
pub fn validate(
    inventory: &[FdInfo],
    claims: &ClaimedFds,
    preexisting: &[PreexistingFd],
    diagnostic_fd: Option<RawFd>,
) -> Vec<FailureRecord> {
    let mut failures = Vec::new();
    let mut claim_failures: SmallVec<[(RawFd, CrError); 4]> = SmallVec::new();

    for info in inventory {
        if matches!(info.state, crate::fd_inventory::FdState::Closed) {
            continue;
        }

        if let Some(claim) = claims.find(info.fd) {
            debug!("fd={} OK: claimed by {}", info.fd, claim.owner);
            if let Some(supplier) = &claim.deferred {
                if let Some(err) = supplier() {
                    claim_failures.push((info.fd, err));
                }
            }
            continue;
        }

        if preexisting
            .iter()
            .any(|p| p.fd == info.fd && p.dev == info.dev && p.ino == info.ino)
        {
            debug!("fd={} OK: present at VM-init", info.fd);
            continue;
        }

        if diagnostic_fd == Some(info.fd) {
            debug!("fd={} OK: diagnostic command socket", info.fd);
            continue;
        }

        let kind = classify_failure_kind(info.mode);
        let target =
            std::fs::read_link(format!("/proc/self/fd/{}", info.fd)).unwrap_or_default();
        let message = format!(
            "fd={} type={:?} target={}",
            info.fd,
            kind,
            target.display()
        );
        warn!("unclaimed descriptor: {message}");
        failures.push(FailureRecord {
            kind,
            message,
            fd: info.fd,
        });
    }

    for (fd, err) in claim_failures {
        failures.push(FailureRecord {
            kind: FailureKind::Generic,
            message: err.to_string(),
            fd,
        });
    }

    failures
}

fn classify_failure_kind(mode: u32) -> FailureKind {
    let sflag = SFlag::from_bits_truncate(mode & SFlag::S_IFMT.bits());
    match sflag {
        SFlag::S_IFSOCK => FailureKind::Socket,
        SFlag::S_IFIFO => FailureKind::Pipe,
        SFlag::S_IFREG | SFlag::S_IFLNK | SFlag::S_IFDIR | SFlag::S_IFCHR | SFlag::S_IFBLK => {
            FailureKind::File
        }
        _ => FailureKind::Generic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd_inventory::{FdMark, FdState};

    fn info(fd: RawFd, mode: u32, state: FdState) -> FdInfo {
        FdInfo {
            fd,
            dev: 1,
            ino: 1,
            mode,
            nlink: 1,
            state,
            mark: FdMark::empty(),
            flags: 0,
        }
    }

    #[test]
    fn claimed_fd_is_ok() {
        let inventory = vec![info(5, 0o100_644, FdState::Root)];
        let mut claims = ClaimedFds::new();
        claims.claim(5, "res", None).unwrap();
        let failures = validate(&inventory, &claims, &[], None);
        assert!(failures.is_empty());
    }

    #[test]
    fn claimed_fd_with_deferred_failure_surfaces_it() {
        let inventory = vec![info(5, 0o100_644, FdState::Root)];
        let mut claims = ClaimedFds::new();
        claims
            .claim(
                5,
                "res",
                Some(Box::new(|| Some(CrError::Setup("denied".into())))),
            )
            .unwrap();
        let failures = validate(&inventory, &claims, &[], None);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.contains("denied"));
    }

    #[test]
    fn preexisting_fd_is_ok() {
        let inventory = vec![info(3, 0o100_644, FdState::Root)];
        let claims = ClaimedFds::new();
        let preexisting = [PreexistingFd { fd: 3, dev: 1, ino: 1 }];
        let failures = validate(&inventory, &claims, &preexisting, None);
        assert!(failures.is_empty());
    }

    // spec §4.5 point 2: a reused fd number pointing at a different file is
    // not the same descriptor and must not be waved through.
    #[test]
    fn reused_fd_number_with_different_identity_still_fails() {
        let inventory = vec![info(3, 0o100_644, FdState::Root)];
        let claims = ClaimedFds::new();
        let preexisting = [PreexistingFd { fd: 3, dev: 1, ino: 99 }];
        let failures = validate(&inventory, &claims, &preexisting, None);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.contains("fd=3"));
    }

    // S3: unclaimed socket.
    #[test]
    fn unclaimed_socket_fails_with_socket_kind() {
        let sflag_sock = SFlag::S_IFSOCK.bits();
        let inventory = vec![info(7, sflag_sock, FdState::Root)];
        let claims = ClaimedFds::new();
        let failures = validate(&inventory, &claims, &[], None);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Socket);
        assert!(failures[0].message.contains("fd=7"));
    }

    #[test]
    fn diagnostic_socket_is_ok() {
        let inventory = vec![info(9, SFlag::S_IFSOCK.bits(), FdState::Root)];
        let claims = ClaimedFds::new();
        let failures = validate(&inventory, &claims, &[], Some(9));
        assert!(failures.is_empty());
    }

    #[test]
    fn closed_entries_are_skipped() {
        let inventory = vec![info(9, 0, FdState::Closed)];
        let claims = ClaimedFds::new();
        let failures = validate(&inventory, &claims, &[], None);
        assert!(failures.is_empty());
    }

    #[test]
    fn double_claim_of_same_fd_is_rejected() {
        let mut claims = ClaimedFds::new();
        claims.claim(5, "res1", None).unwrap();
        assert!(claims.claim(5, "res2", None).is_err());
    }
}
