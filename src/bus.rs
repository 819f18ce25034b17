//! The resource bus (C4): prioritized, ordered broadcast of
//! `beforeCheckpoint` / `afterRestore` callbacks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::error::CrError;
use crate::exception::{ExceptionHolder, Phase};
use crate::resource::{RegistrationToken, Resource};
use crate::tier::PriorityTier;

/// An interrupt flag a caller can pre-set to simulate "this thread was
/// already interrupted" (spec §4.4: "An already-interrupted caller does not
/// wait — it fails the registration").
#[derive(Debug, Default, Clone)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Typical registration order within a tier; the vast majority of processes
/// register a handful of resources per tier, not thousands.
type TierResources = SmallVec<[Arc<dyn Resource>; 8]>;

struct TierContext {
    resources: Mutex<TierResources>,
    blocking: bool,
}

impl TierContext {
    fn new(tier: PriorityTier) -> Self {
        Self {
            resources: Mutex::new(SmallVec::new()),
            blocking: tier.blocks_registration_during_checkpoint(),
        }
    }
}

/// The process-wide registry of resources, organized into the fixed
/// priority tiers of spec §3.
pub struct ResourceBus {
    tiers: [TierContext; 12],
    checkpointing: Mutex<bool>,
    checkpointing_cv: Condvar,
    driver_thread: Mutex<Option<ThreadId>>,
}

impl Default for ResourceBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceBus {
    pub fn new() -> Self {
        Self {
            tiers: PriorityTier::ALL.map(TierContext::new),
            checkpointing: Mutex::new(false),
            checkpointing_cv: Condvar::new(),
            driver_thread: Mutex::new(None),
        }
    }

    /// Register a resource into `tier`, in registration order.
    ///
    /// For tiers whose policy blocks registration during checkpoint (spec
    /// §4.4), a concurrent call from a thread other than the checkpoint
    /// driver suspends until `afterRestore` completes. An already-set
    /// `interrupt` fails immediately rather than waiting, and the resource is
    /// never invoked for the in-progress attempt either way.
    pub fn register(
        &self,
        tier: PriorityTier,
        resource: Arc<dyn Resource>,
        interrupt: &InterruptFlag,
    ) -> Result<RegistrationToken, CrError> {
        let ctx = &self.tiers[tier.ordinal()];

        if ctx.blocking {
            let is_driver = self.driver_thread.lock().as_ref() == Some(&std::thread::current().id());
            if !is_driver {
                let mut guard = self.checkpointing.lock();
                while *guard {
                    if interrupt.is_set() {
                        return Err(CrError::Interrupted);
                    }
                    self.checkpointing_cv.wait(&mut guard);
                }
            }
        }

        let mut resources = ctx.resources.lock();
        let index = resources.len();
        resources.push(resource);
        trace!("registered resource into tier {tier:?} at index {index}");
        Ok(RegistrationToken { tier, index })
    }

    /// Marks the start of an attempt: blocks further registrations into
    /// blocking tiers and records the driving thread so it is exempt.
    pub(crate) fn begin_checkpoint(&self) {
        *self.driver_thread.lock() = Some(std::thread::current().id());
        *self.checkpointing.lock() = true;
    }

    /// Marks the end of an attempt: releases any registrations that queued
    /// up during it. They are not retroactively invoked for this attempt.
    pub(crate) fn end_checkpoint(&self) {
        *self.checkpointing.lock() = false;
        *self.driver_thread.lock() = None;
        self.checkpointing_cv.notify_all();
    }

    /// Runs `beforeCheckpoint` across every tier, bottom to top, registration
    /// order within a tier. Does not abort on a per-resource failure; all
    /// resources run and failures accumulate (spec §7 propagation policy).
    pub fn dispatch_before_checkpoint(&self) -> Result<(), CrError> {
        let mut holder = ExceptionHolder::new();
        for tier in PriorityTier::ALL {
            let resources: TierResources = self.tiers[tier.ordinal()].resources.lock().clone();
            for resource in &resources {
                debug!("beforeCheckpoint: {} (tier {:?})", resource.name(), tier);
                if let Err(err) = resource.before_checkpoint() {
                    warn!("beforeCheckpoint failed for {}: {err}", resource.name());
                    holder.add(CrError::Setup(format!("{}: {err}", resource.name())));
                }
            }
        }
        holder.into_result(Phase::Checkpoint)
    }

    /// Runs `afterRestore` in reverse tier order, reverse registration order
    /// within a tier. Does not abort on a per-resource failure.
    pub fn dispatch_after_restore(&self) -> Result<(), CrError> {
        let mut holder = ExceptionHolder::new();
        for tier in PriorityTier::ALL.iter().rev() {
            let resources: TierResources = self.tiers[tier.ordinal()].resources.lock().clone();
            for resource in resources.iter().rev() {
                debug!("afterRestore: {} (tier {:?})", resource.name(), tier);
                if let Err(err) = resource.after_restore() {
                    warn!("afterRestore failed for {}: {err}", resource.name());
                    holder.add(CrError::Setup(format!("{}: {err}", resource.name())));
                }
            }
        }
        holder.into_result(Phase::Restore)
    }

    #[cfg(test)]
    pub(crate) fn registered_count(&self, tier: PriorityTier) -> usize {
        self.tiers[tier.ordinal()].resources.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct LoggingResource {
        name: &'static str,
        log: Arc<StdMutex<Vec<&'static str>>>,
        before_suffix: &'static str,
        after_suffix: &'static str,
    }

    impl Resource for LoggingResource {
        fn before_checkpoint(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.log.lock().unwrap().push(self.before_suffix);
            Ok(())
        }

        fn after_restore(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.log.lock().unwrap().push(self.after_suffix);
            Ok(())
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    // S1: plain round trip.
    #[test]
    fn plain_round_trip() {
        let bus = ResourceBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.register(
            PriorityTier::Normal,
            Arc::new(LoggingResource {
                name: "R1",
                log: log.clone(),
                before_suffix: "B1",
                after_suffix: "A1",
            }),
            &InterruptFlag::new(),
        )
        .unwrap();

        bus.dispatch_before_checkpoint().unwrap();
        bus.dispatch_after_restore().unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["B1", "A1"]);
    }

    // S2: tier ordering.
    #[test]
    fn tier_ordering() {
        let bus = ResourceBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.register(
            PriorityTier::FileDescriptors,
            Arc::new(LoggingResource {
                name: "R_fd",
                log: log.clone(),
                before_suffix: "FD_before",
                after_suffix: "FD_after",
            }),
            &InterruptFlag::new(),
        )
        .unwrap();
        bus.register(
            PriorityTier::Normal,
            Arc::new(LoggingResource {
                name: "R_norm",
                log: log.clone(),
                before_suffix: "NORM_before",
                after_suffix: "NORM_after",
            }),
            &InterruptFlag::new(),
        )
        .unwrap();

        bus.dispatch_before_checkpoint().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["FD_before", "NORM_before"]);

        log.lock().unwrap().clear();
        bus.dispatch_after_restore().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["NORM_after", "FD_after"]);
    }

    // Universal property 1, generalized beyond the two tiers used in S2.
    #[test]
    fn ordering_holds_for_every_adjacent_tier_pair() {
        let bus = ResourceBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        for (i, tier) in PriorityTier::ALL.iter().enumerate() {
            bus.register(
                *tier,
                Arc::new(LoggingResource {
                    name: "R",
                    log: log.clone(),
                    before_suffix: Box::leak(format!("before{i}").into_boxed_str()),
                    after_suffix: Box::leak(format!("after{i}").into_boxed_str()),
                }),
                &InterruptFlag::new(),
            )
            .unwrap();
        }
        bus.dispatch_before_checkpoint().unwrap();
        let before_log = log.lock().unwrap().clone();
        for pair in before_log.windows(2) {
            let a: usize = pair[0][6..].parse().unwrap();
            let b: usize = pair[1][6..].parse().unwrap();
            assert!(a < b, "beforeCheckpoint must run in tier order");
        }

        log.lock().unwrap().clear();
        bus.dispatch_after_restore().unwrap();
        let after_log = log.lock().unwrap().clone();
        for pair in after_log.windows(2) {
            let a: usize = pair[0][5..].parse().unwrap();
            let b: usize = pair[1][5..].parse().unwrap();
            assert!(a > b, "afterRestore must run in reverse tier order");
        }
    }

    #[test]
    fn zero_resources_completes_without_invoking_anything() {
        let bus = ResourceBus::new();
        bus.dispatch_before_checkpoint().unwrap();
        bus.dispatch_after_restore().unwrap();
    }

    // S4: blocking registration during checkpoint.
    #[test]
    fn blocking_tier_registration_suspends_until_restore_completes() {
        let bus = Arc::new(ResourceBus::new());
        bus.begin_checkpoint();

        let bus2 = bus.clone();
        let registered = Arc::new(AtomicBool::new(false));
        let registered2 = registered.clone();
        let handle = std::thread::spawn(move || {
            bus2.register(
                PriorityTier::FileDescriptors,
                Arc::new(LoggingResource {
                    name: "R2",
                    log: Arc::new(StdMutex::new(Vec::new())),
                    before_suffix: "x",
                    after_suffix: "y",
                }),
                &InterruptFlag::new(),
            )
            .unwrap();
            registered2.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(
            !registered.load(Ordering::SeqCst),
            "registration must not proceed while checkpoint is in progress"
        );
        assert_eq!(bus.registered_count(PriorityTier::FileDescriptors), 0);

        bus.end_checkpoint();
        handle.join().unwrap();
        assert!(registered.load(Ordering::SeqCst));
        assert_eq!(bus.registered_count(PriorityTier::FileDescriptors), 1);
    }

    #[test]
    fn already_interrupted_registration_fails_without_waiting() {
        let bus = ResourceBus::new();
        bus.begin_checkpoint();
        let interrupt = InterruptFlag::new();
        interrupt.set();
        let result = bus.register(
            PriorityTier::FileDescriptors,
            Arc::new(LoggingResource {
                name: "R",
                log: Arc::new(StdMutex::new(Vec::new())),
                before_suffix: "x",
                after_suffix: "y",
            }),
            &interrupt,
        );
        assert!(matches!(result, Err(CrError::Interrupted)));
        bus.end_checkpoint();
    }
}
