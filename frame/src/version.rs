/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The monotone global version counter and bookkeeping for which versions
//! are still observed by a live transaction. Grounded in the teacher's
//! `impls/core/versions.rs` `VersionTracker`/active-version refcounting.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use allocative::Allocative;
use dupe::Dupe;
use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Clone, Copy, Dupe, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Allocative)]
pub struct VersionNumber(pub(crate) u64);

impl VersionNumber {
    pub const ZERO: VersionNumber = VersionNumber(0);

    pub fn next(self) -> Self {
        VersionNumber(self.0 + 1)
    }
}

impl std::fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// RAII handle: a version stays "active" (ineligible for GC by the node
/// store) for as long as one of these is alive.
pub struct ActiveVersionGuard {
    version: VersionNumber,
    tracker: Arc<VersionTrackerInner>,
}

impl ActiveVersionGuard {
    pub fn version(&self) -> VersionNumber {
        self.version
    }
}

impl Drop for ActiveVersionGuard {
    fn drop(&mut self) {
        self.tracker.release(self.version);
    }
}

struct VersionTrackerInner {
    current: AtomicU64,
    active_counts: Mutex<std::collections::BTreeMap<u64, u32>>,
    active_versions_sender: watch::Sender<usize>,
}

impl VersionTrackerInner {
    fn release(&self, version: VersionNumber) {
        let mut counts = self.active_counts.lock();
        let count = counts.entry(version.0).or_insert(0);
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(&version.0);
        }
        let _ = self.active_versions_sender.send(counts.len());
    }
}

/// Issues new global versions and tracks which ones are still referenced by
/// a live transaction, so the node store knows which historical values it
/// must still be able to answer `CHECK_DEPS` queries about.
pub struct VersionTracker {
    inner: Arc<VersionTrackerInner>,
    active_versions_observer: watch::Receiver<usize>,
}

impl Default for VersionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionTracker {
    pub fn new() -> Self {
        let (active_versions_sender, active_versions_observer) = watch::channel(0);
        Self {
            inner: Arc::new(VersionTrackerInner {
                current: AtomicU64::new(0),
                active_counts: Mutex::new(std::collections::BTreeMap::new()),
                active_versions_sender,
            }),
            active_versions_observer,
        }
    }

    pub fn current(&self) -> VersionNumber {
        VersionNumber(self.inner.current.load(Ordering::SeqCst))
    }

    /// Advances to a new version and returns a guard keeping it active until
    /// the caller's transaction finishes.
    pub fn next(&self) -> ActiveVersionGuard {
        let version = VersionNumber(self.inner.current.fetch_add(1, Ordering::SeqCst) + 1);
        self.pin(version)
    }

    /// Pins the current version as active without advancing it (read-only
    /// transactions that don't invalidate anything still need their version
    /// kept alive while they run).
    pub fn pin(&self, version: VersionNumber) -> ActiveVersionGuard {
        let mut counts = self.inner.active_counts.lock();
        *counts.entry(version.0).or_insert(0) += 1;
        let _ = self.inner.active_versions_sender.send(counts.len());
        ActiveVersionGuard {
            version,
            tracker: self.inner.dupe(),
        }
    }

    pub fn active_version_count(&self) -> usize {
        self.active_versions_observer.borrow().dupe()
    }

    pub fn wait_for_idle(&self) -> impl std::future::Future<Output = ()> + 'static {
        let mut obs = self.active_versions_observer.clone();
        async move {
            while *obs.borrow() != 0 {
                if obs.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_monotone() {
        let tracker = VersionTracker::new();
        assert_eq!(tracker.current(), VersionNumber::ZERO);
        let g1 = tracker.next();
        assert_eq!(g1.version(), VersionNumber(1));
        let g2 = tracker.next();
        assert_eq!(g2.version(), VersionNumber(2));
        assert_eq!(tracker.current(), VersionNumber(2));
    }

    #[test]
    fn active_count_tracks_live_guards() {
        let tracker = VersionTracker::new();
        let g1 = tracker.next();
        assert_eq!(tracker.active_version_count(), 1);
        let g2 = tracker.next();
        assert_eq!(tracker.active_version_count(), 2);
        drop(g1);
        assert_eq!(tracker.active_version_count(), 1);
        drop(g2);
        assert_eq!(tracker.active_version_count(), 0);
    }
}
