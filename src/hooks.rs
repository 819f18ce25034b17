//! `VmHooks` (C6 ambient): the points where the checkpoint driver must call
//! back into the embedding VM for GC, JIT, and diagnostic-listener
//! coordination. The driver owns *when*; the VM owns *what*.

use crate::restore_blob::FlagToken;

/// Implemented by the embedding VM. All methods default to a no-op so a
/// host that only cares about a subset of the lifecycle can implement
/// just that subset, the same default-method shape as `fuser`'s
/// `trait Filesystem`.
pub trait VmHooks: Send + Sync {
    /// Step 1: stop the diagnostic command listener so it cannot open new
    /// descriptors while the FD inventory is being taken.
    fn abort_diagnostic_listener(&self) {}

    /// Step 2: force a full heap-compacting collection to minimize image size.
    fn request_gc(&self) {}

    /// Applies one restore-blob flag token (spec §4.2 "Semantics of applying
    /// the blob"), tagged with `origin` (`restore_blob::FLAG_ORIGIN_TAG`) so
    /// the runtime can later tell which settings came from restore.
    fn apply_restore_flag(&self, origin: &str, flag: &FlagToken) {
        let _ = (origin, flag);
    }

    /// Step 4: a heap dump taken only when `heap_dump_on_failure` is set and
    /// FD validation produced at least one failure. `reason` is a short,
    /// human-readable summary.
    fn heap_dump(&self, reason: &str) {
        let _ = reason;
    }

    /// Step 6 / 9: detach (and later reattach) the perf/shared-counter
    /// subsystem's aliasing file descriptor around engine invocation.
    fn detach_perf_shared_file(&self) {}
    fn reattach_perf_shared_file(&self) {}

    /// Suspends and resumes JIT recompilation around the checkpoint window;
    /// named in spec §1's non-goals ("a single optional recompilation-delay
    /// timer") as infrastructure the driver still must call into.
    fn pause_jit_recompilation(&self) {}
    fn resume_jit_recompilation(&self) {}
}

/// A hooks implementation that does nothing, for embedders with no GC/JIT
/// concept (tests, or a VM that checkpoints without a managed heap).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl VmHooks for NoopHooks {}
