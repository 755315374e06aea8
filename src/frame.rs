//! Single-slot frame cache.
//!
//! The capture supervisor is the only writer; request handlers are readers.
//! A published snapshot is immutable. Publishing swaps an `Arc` under a mutex
//! that is held only for the exchange, so readers never wait on capture and
//! capture never waits on image processing.
//!
//! - `FrameSnapshot`: one published frame plus its sequence number.
//! - `FrameCache`: the shared slot. Cheap to clone, all clones see the same slot.

use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

/// An immutable, published frame.
#[derive(Debug)]
pub struct FrameSnapshot {
    pub image: RgbImage,
    /// Strictly increasing per publish, starting at 1.
    pub sequence: u64,
    pub published_at: SystemTime,
}

#[derive(Clone, Debug)]
pub struct FrameCache {
    inner: Arc<CacheInner>,
}

#[derive(Debug)]
struct CacheInner {
    slot: Mutex<Option<Arc<FrameSnapshot>>>,
    live: AtomicBool,
}

impl FrameCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                slot: Mutex::new(None),
                live: AtomicBool::new(true),
            }),
        }
    }

    /// Replace the slot with `image` and return the assigned sequence number.
    pub fn publish(&self, image: RgbImage) -> u64 {
        let mut slot = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let sequence = slot.as_ref().map_or(1, |prev| prev.sequence + 1);
        *slot = Some(Arc::new(FrameSnapshot {
            image,
            sequence,
            published_at: SystemTime::now(),
        }));
        sequence
    }

    /// Most recently published frame, or `None` if nothing was ever published.
    ///
    /// Never waits for a fresher frame.
    pub fn read_latest(&self) -> Option<Arc<FrameSnapshot>> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sequence of the latest frame, 0 when empty.
    pub fn sequence(&self) -> u64 {
        self.read_latest().map_or(0, |snapshot| snapshot.sequence)
    }

    /// Called by the supervisor when it stops updating the slot.
    pub fn mark_stopped(&self) {
        self.inner.live.store(false, Ordering::SeqCst);
    }

    /// False once the supervisor has terminated. The last frame stays readable.
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}
