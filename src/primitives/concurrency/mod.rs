#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owned/unowned flag that admits at most one holder at a time.
///
/// Acquisition never blocks: a second caller gets `None` immediately and
/// decides which error to surface.
#[derive(Clone, Default)]
pub struct SingleWriter {
    held: Arc<AtomicBool>,
}

/// Proof of holding a [`SingleWriter`]; releases it on drop.
pub struct WriterGuard {
    held: Arc<AtomicBool>,
}

impl SingleWriter {
    /// Creates an unowned flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the flag if nobody holds it.
    pub fn try_acquire(&self) -> Option<WriterGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| WriterGuard {
                held: Arc::clone(&self.held),
            })
    }

    /// Returns whether the flag is currently owned.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let slot = SingleWriter::new();
        let first = slot.try_acquire().expect("first acquire");
        assert!(slot.is_held());
        assert!(slot.try_acquire().is_none());
        drop(first);
        assert!(!slot.is_held());
        assert!(slot.try_acquire().is_some());
    }

    #[test]
    fn clones_share_the_flag() {
        let slot = SingleWriter::new();
        let other = slot.clone();
        let _guard = slot.try_acquire().expect("acquire");
        assert!(other.try_acquire().is_none());
    }
}
