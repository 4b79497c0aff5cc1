//! Open handle tracking
//!
//! Every readable handed out by the provider holds a `TrackedHandle`. The
//! tracker always counts open handles; debug builds also remember which
//! object each handle belongs to, so that leaks can be reported by file number
//! when the provider is closed.

use sstio_common::DiskFileNum;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[cfg(debug_assertions)]
use parking_lot::Mutex;
#[cfg(debug_assertions)]
use std::collections::HashMap;

/// Registry of open readables
#[derive(Debug, Default)]
pub struct HandleTracker {
    open: AtomicUsize,
    next_id: AtomicU64,
    #[cfg(debug_assertions)]
    handles: Mutex<HashMap<u64, DiskFileNum>>,
}

impl HandleTracker {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new handle for `file_num`
    #[must_use]
    pub fn track(self: &Arc<Self>, file_num: DiskFileNum) -> TrackedHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.open.fetch_add(1, Ordering::Relaxed);
        #[cfg(debug_assertions)]
        self.handles.lock().insert(id, file_num);
        #[cfg(not(debug_assertions))]
        let _ = file_num;
        TrackedHandle {
            tracker: Arc::clone(self),
            id,
        }
    }

    /// Number of open handles
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::Relaxed)
    }

    /// Objects with open handles (one entry per handle, sorted); empty in
    /// release builds
    #[must_use]
    pub fn open_handles(&self) -> Vec<DiskFileNum> {
        #[cfg(debug_assertions)]
        {
            let mut nums: Vec<DiskFileNum> = self.handles.lock().values().copied().collect();
            nums.sort();
            nums
        }
        #[cfg(not(debug_assertions))]
        {
            Vec::new()
        }
    }

    fn release(&self, id: u64) {
        self.open.fetch_sub(1, Ordering::Relaxed);
        #[cfg(debug_assertions)]
        self.handles.lock().remove(&id);
        #[cfg(not(debug_assertions))]
        let _ = id;
    }
}

/// Registration of one open handle; released on drop
#[derive(Debug)]
pub struct TrackedHandle {
    tracker: Arc<HandleTracker>,
    id: u64,
}

impl Drop for TrackedHandle {
    fn drop(&mut self) {
        self.tracker.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_and_release() {
        let tracker = HandleTracker::new();
        let a = tracker.track(DiskFileNum::new(3));
        let b = tracker.track(DiskFileNum::new(1));
        let c = tracker.track(DiskFileNum::new(3));
        assert_eq!(tracker.open_count(), 3);
        #[cfg(debug_assertions)]
        assert_eq!(
            tracker.open_handles(),
            vec![DiskFileNum::new(1), DiskFileNum::new(3), DiskFileNum::new(3)]
        );

        drop(a);
        drop(b);
        assert_eq!(tracker.open_count(), 1);
        drop(c);
        assert_eq!(tracker.open_count(), 0);
        assert!(tracker.open_handles().is_empty());
    }
}
