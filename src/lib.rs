//! Checkpoint/restore coordinator for a managed-language runtime.
//!
//! This crate owns the VM-side half of a checkpoint/restore cycle: it
//! inventories and validates open file descriptors, runs a prioritized
//! before-checkpoint/after-restore callback bus for runtime and
//! application resources, hands control to an external image-capture
//! engine over signals and shared memory, and on restore re-injects
//! flags, environment, properties, and optionally new program arguments.
//!
//! The embedding VM owns a single process-wide [`CheckpointContext`],
//! registers [`Resource`]s on its [`ResourceBus`], and calls
//! [`driver::checkpoint`] to run one attempt.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod args_grammar;
mod bus;
mod claims;
mod config;
mod context;
mod driver;
mod engine;
mod error;
mod exception;
mod fd_inventory;
mod hooks;
mod resource;
mod restore_blob;
mod shm;
mod signal;
mod tier;

pub use crate::bus::{InterruptFlag, ResourceBus};
pub use crate::claims::{ClaimedFds, ClosePolicy, DeferredFailure};
pub use crate::config::Config;
pub use crate::context::CheckpointContext;
pub use crate::driver::{CheckpointResult, checkpoint, initiate_restore};
pub use crate::engine::{ENGINE_PATH_OVERRIDE_VAR, NEW_ARGS_ID_VAR};
pub use crate::error::{CrError, FailureKind, FailureRecord, ResultCode};
pub use crate::exception::Phase;
pub use crate::fd_inventory::{FdInfo, FdMark, FdState, PreexistingFd, capture_preexisting};
pub use crate::hooks::{NoopHooks, VmHooks};
pub use crate::resource::{RegistrationToken, Resource};
pub use crate::restore_blob::{FlagToken, RestoreBlob, RestoreBlobHeader};
pub use crate::tier::PriorityTier;
