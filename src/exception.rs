//! Lazy exception accumulation for a single checkpoint/restore phase.
//!
//! The source VM builds one top-level exception per phase and attaches
//! individual callback failures as suppressed causes; same-class failures
//! get their suppressed chains merged instead of nested (spec §4.4, §9).
//! Here there is no exception-class hierarchy, so "same class" degrades to
//! "same enum discriminant" and merging is just `Vec::extend`.

use crate::error::CrError;

/// Which phase an [`ExceptionHolder`] is accumulating for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Checkpoint,
    Restore,
}

/// Accumulates zero or more callback failures and, on demand, builds the
/// phase-specific top-level error.
#[derive(Debug, Default)]
pub struct ExceptionHolder {
    causes: Vec<CrError>,
}

impl ExceptionHolder {
    pub fn new() -> Self {
        Self { causes: Vec::new() }
    }

    /// Record a callback failure. If `cause` is itself a `Checkpoint`/`Restore`
    /// accumulation (the same "class" as the holder's eventual top-level
    /// error), its suppressed chain is merged in rather than nested.
    pub fn add(&mut self, cause: CrError) {
        match cause {
            CrError::Checkpoint(inner) | CrError::Restore(inner) => self.causes.extend(inner),
            other => self.causes.push(other),
        }
    }

    /// Record that the calling thread observed an interrupt; re-sets nothing
    /// itself (the caller re-sets the thread-level interrupt flag) but
    /// attaches a suppressed cause documenting it happened.
    pub fn add_interrupt(&mut self) {
        self.causes.push(CrError::Interrupted);
    }

    pub fn is_empty(&self) -> bool {
        self.causes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.causes.len()
    }

    /// Consume the holder, returning `Ok(())` if nothing failed, or the
    /// phase-specific top-level error with every accumulated cause attached.
    pub fn into_result(self, phase: Phase) -> Result<(), CrError> {
        if self.causes.is_empty() {
            Ok(())
        } else {
            match phase {
                Phase::Checkpoint => Err(CrError::Checkpoint(self.causes)),
                Phase::Restore => Err(CrError::Restore(self.causes)),
            }
        }
    }
}
