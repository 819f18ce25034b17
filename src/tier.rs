//! Priority tiers: the fixed, externally-observable ordering from spec §3/§6.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// A fixed ordered enum whose declaration order defines both callback order
/// and the dependency relationship between tiers.
///
/// `beforeCheckpoint` dispatch walks tiers in this order; `afterRestore`
/// dispatch walks them in reverse. Reordering these variants is a breaking
/// change (spec §6, "Priority-tier externally-observable ordering").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PriorityTier {
    FileDescriptors = 0,
    PreFileDescriptors = 1,
    PostFileDescriptors = 2,
    Recording = 3,
    Cleaners = 4,
    ReferenceHandler = 5,
    SeederHolder = 6,
    SecureRandom = 7,
    NativePrng = 8,
    EventLoopSelector = 9,
    Sockets = 10,
    Normal = 11,
}

impl PriorityTier {
    /// Every tier, in declared (pre-checkpoint) order.
    pub const ALL: [PriorityTier; 12] = [
        PriorityTier::FileDescriptors,
        PriorityTier::PreFileDescriptors,
        PriorityTier::PostFileDescriptors,
        PriorityTier::Recording,
        PriorityTier::Cleaners,
        PriorityTier::ReferenceHandler,
        PriorityTier::SeederHolder,
        PriorityTier::SecureRandom,
        PriorityTier::NativePrng,
        PriorityTier::EventLoopSelector,
        PriorityTier::Sockets,
        PriorityTier::Normal,
    ];

    /// Whether registrations into this tier use the blocking variant (spec §4.4):
    /// a concurrent `register` call waits out an in-progress checkpoint rather
    /// than being admitted into it. `FileDescriptors` owns the fd inventory
    /// itself and must not observe new registrants mid-attempt.
    pub fn blocks_registration_during_checkpoint(self) -> bool {
        matches!(
            self,
            PriorityTier::FileDescriptors
                | PriorityTier::PreFileDescriptors
                | PriorityTier::PostFileDescriptors
        )
    }

    pub(crate) fn ordinal(self) -> usize {
        u8::from(self) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_matches_declaration_order() {
        for (i, tier) in PriorityTier::ALL.iter().enumerate() {
            assert_eq!(tier.ordinal(), i);
        }
    }

    #[test]
    fn total_order_is_transitive() {
        assert!(PriorityTier::FileDescriptors < PriorityTier::Normal);
        assert!(PriorityTier::Cleaners < PriorityTier::Sockets);
    }

    #[test]
    fn round_trips_through_primitive() {
        for tier in PriorityTier::ALL {
            let raw: u8 = tier.into();
            assert_eq!(PriorityTier::try_from(raw).unwrap(), tier);
        }
    }
}
