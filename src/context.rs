//! `CheckpointContext` (C3/C6 data model): the process-wide singleton
//! gluing the resource bus, configuration, and VM hooks together, the way
//! `fuser::session::ActiveSession` owns the session-wide mutable state.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::bus::ResourceBus;
use crate::config::Config;
use crate::error::CrError;
use crate::hooks::VmHooks;

static CONTEXT: OnceLock<CheckpointContext> = OnceLock::new();

/// Process-wide checkpoint/restore state. One instance per process,
/// installed once at VM-init time.
pub struct CheckpointContext {
    /// The prioritized before-checkpoint/after-restore callback bus.
    pub bus: ResourceBus,
    /// Environment-derived configuration for this process.
    pub config: Config,
    hooks: Box<dyn VmHooks>,
    recursing: AtomicBool,
    driving: Mutex<()>,
}

impl CheckpointContext {
    /// Builds a standalone instance, not registered as the process
    /// singleton. Production code installs one context via [`Self::install`];
    /// tests and other embedders that want an isolated instance use this
    /// directly.
    pub fn new(config: Config, hooks: Box<dyn VmHooks>) -> Self {
        CheckpointContext {
            bus: ResourceBus::new(),
            config,
            hooks,
            recursing: AtomicBool::new(false),
            driving: Mutex::new(()),
        }
    }

    /// Installs the singleton, or returns the one already installed
    /// (subsequent calls' `config`/`hooks` are ignored, matching a
    /// one-time runtime-initialization phase).
    pub fn install(config: Config, hooks: Box<dyn VmHooks>) -> &'static CheckpointContext {
        CONTEXT.get_or_init(|| Self::new(config, hooks))
    }

    pub fn get() -> Option<&'static CheckpointContext> {
        CONTEXT.get()
    }

    pub fn hooks(&self) -> &dyn VmHooks {
        self.hooks.as_ref()
    }

    /// A checkpoint requested from inside a running callback fails fast
    /// (spec §4.6 "Recursion guard", universal property 3).
    pub(crate) fn acquire_recursion_guard(&self) -> Result<RecursionGuard<'_>, CrError> {
        if self.recursing.swap(true, Ordering::SeqCst) {
            return Err(CrError::Checkpoint(vec![CrError::RecursiveCheckpoint]));
        }
        Ok(RecursionGuard(self))
    }

    /// Serializes concurrent attempts: at most one checkpoint/restore in
    /// flight per process.
    pub(crate) fn driving_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.driving.lock()
    }
}

/// RAII release of the recursion guard, held for the duration of one
/// `checkpoint()` call.
pub(crate) struct RecursionGuard<'a>(&'a CheckpointContext);

impl Drop for RecursionGuard<'_> {
    fn drop(&mut self) {
        self.0.recursing.store(false, Ordering::SeqCst);
    }
}
