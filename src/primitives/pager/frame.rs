use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::types::PageId;

pub struct Frame {
    pub id: Option<PageId>,
    pub buf: Arc<RwLock<Box<[u8]>>>,
    pub reference: bool,
    pub dirty: Arc<AtomicBool>,
    pub pins: Arc<AtomicU32>,
}

impl Frame {
    pub fn new(page_size: usize) -> Self {
        Self {
            id: None,
            buf: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            reference: false,
            dirty: Arc::new(AtomicBool::new(false)),
            pins: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Keeps a frame resident; the clock skips frames with live pins.
pub struct PinGuard {
    pins: Arc<AtomicU32>,
}

impl PinGuard {
    pub fn acquire(pins: &Arc<AtomicU32>) -> Self {
        pins.fetch_add(1, Ordering::AcqRel);
        Self {
            pins: Arc::clone(pins),
        }
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }
}
