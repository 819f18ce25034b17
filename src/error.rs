//! Error taxonomy for the checkpoint/restore coordinator.
//!
//! Mirrors the vocabulary in spec §7 as a single enum rather than an
//! exception hierarchy: each checkpoint or restore attempt accumulates
//! zero or more causes and surfaces them as `CrError::Checkpoint` /
//! `CrError::Restore`.

use std::{error, fmt, os::unix::io::RawFd};

/// Failure-code vocabulary surfaced to callers for unclaimed file descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No more specific classification applies.
    Generic,
    /// The descriptor refers to a regular file, symlink, directory, or device.
    File,
    /// The descriptor refers to a socket.
    Socket,
    /// The descriptor refers to a pipe or FIFO.
    Pipe,
}

impl FailureKind {
    /// The wire-level code from spec §6 ("Failure-code vocabulary").
    pub fn code(self) -> i32 {
        match self {
            FailureKind::Generic => 0,
            FailureKind::File => 1,
            FailureKind::Socket => 2,
            FailureKind::Pipe => 3,
        }
    }
}

/// A single accumulated FD-validation failure.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub message: String,
    pub fd: RawFd,
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd={} {}", self.fd, self.message)
    }
}

/// Unified error type for the coordinator.
#[derive(Debug)]
pub enum CrError {
    /// `CHECKPOINT_CONFIG_MISSING`: the feature is not configured (no image directory).
    ConfigMissing,
    /// `CHECKPOINT_SETUP`: cannot create/validate the image directory, resolve the
    /// engine binary, or gather flags.
    Setup(String),
    /// `CHECKPOINT_CALLBACK_FAILURE`: one or more resources failed `beforeCheckpoint`.
    Checkpoint(Vec<CrError>),
    /// `CHECKPOINT_FD_UNCLAIMED`: open descriptors that were neither claimed nor
    /// pre-existing at VM-init.
    FdUnclaimed(Vec<FailureRecord>),
    /// `CHECKPOINT_ENGINE`: the engine child exited non-zero or terminated abnormally.
    Engine(String),
    /// `RESTORE_CALLBACK_FAILURE`: one or more resources failed `afterRestore`.
    Restore(Vec<CrError>),
    /// `RESTORE_PARAM_PARSE`: the restore blob was unreadable or malformed.
    RestoreParamParse(String),
    /// A checkpoint was requested from inside a running callback.
    RecursiveCheckpoint,
    /// The calling thread was interrupted (signal delivery) during a callback
    /// or a blocking registration wait.
    Interrupted,
    /// Wraps an underlying OS error (`errno`, `io::Error`) with context.
    Io(String, std::io::Error),
}

impl fmt::Display for CrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrError::ConfigMissing => write!(f, "checkpoint/restore is not configured"),
            CrError::Setup(msg) => write!(f, "checkpoint setup failed: {msg}"),
            CrError::Checkpoint(causes) => {
                write!(f, "beforeCheckpoint failed ({} cause(s))", causes.len())?;
                for cause in causes {
                    write!(f, "; {cause}")?;
                }
                Ok(())
            }
            CrError::FdUnclaimed(records) => {
                write!(f, "{} unclaimed file descriptor(s)", records.len())?;
                for record in records {
                    write!(f, "; {record}")?;
                }
                Ok(())
            }
            CrError::Engine(msg) => write!(f, "checkpoint/restore engine failed: {msg}"),
            CrError::Restore(causes) => {
                write!(f, "afterRestore failed ({} cause(s))", causes.len())?;
                for cause in causes {
                    write!(f, "; {cause}")?;
                }
                Ok(())
            }
            CrError::RestoreParamParse(msg) => write!(f, "restore blob parse failed: {msg}"),
            CrError::RecursiveCheckpoint => {
                write!(f, "recursive checkpoint is not allowed")
            }
            CrError::Interrupted => write!(f, "operation interrupted"),
            CrError::Io(ctx, err) => write!(f, "{ctx}: {err}"),
        }
    }
}

impl error::Error for CrError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            CrError::Io(_, err) => Some(err),
            _ => None,
        }
    }
}

/// Result-code vocabulary returned from the top-level driver (spec §4.6 step 9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// The attempt succeeded.
    Ok,
    /// The attempt failed; see the accompanying `CrError`.
    Error,
    /// The feature is not configured; callbacks were never invoked.
    None,
}

impl Default for ResultCode {
    fn default() -> Self {
        ResultCode::None
    }
}
