//! Resources: user-registered `{beforeCheckpoint, afterRestore}` capability pairs.

use crate::tier::PriorityTier;

/// A resource the bus dispatches `beforeCheckpoint`/`afterRestore` to.
///
/// Default methods are no-ops, the same shape as `Filesystem`'s default
/// `ENOSYS`-returning methods in the teacher library: a resource only
/// overrides the phase it cares about.
pub trait Resource: Send + Sync {
    /// Called during the pre-checkpoint phase, in tier order (bottom to top),
    /// registration order within a tier.
    fn before_checkpoint(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    /// Called during the post-restore phase, in reverse tier order (top to
    /// bottom), reverse registration order within a tier.
    fn after_restore(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    /// A stable identity used for logging.
    fn name(&self) -> &str {
        "<unnamed resource>"
    }
}

/// An opaque token returned by [`crate::bus::ResourceBus::register`].
///
/// Resources hold no pointer back to the bus beyond this token (spec §9,
/// "avoid hidden references").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationToken {
    pub(crate) tier: PriorityTier,
    pub(crate) index: usize,
}

impl RegistrationToken {
    pub fn tier(&self) -> PriorityTier {
        self.tier
    }
}
