/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The two function families the dirtiness layer reasons about: a single
//! path's filesystem state, and a directory's listing of child names.
//! Ordinary `frame::Key` impls — a collaborator could equally compute them
//! by hand; the dirtiness layer just happens to be the thing that usually
//! keeps them up to date via `Frame::changed_to`.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use std::fmt;

use allocative::Allocative;
use async_trait::async_trait;
use frame::Environment;
use frame::Key;
use frame::Outcome;

/// What `symlink_metadata` says about a path, collapsed to the granularity
/// the dirtiness layer's ancestor inference cares about (§4.5: "the new
/// entry's type").
#[derive(Allocative, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Missing,
}

impl FileType {
    fn of(meta: &fs::Metadata) -> Self {
        if meta.is_dir() {
            FileType::Directory
        } else if meta.file_type().is_symlink() {
            FileType::Symlink
        } else {
            FileType::File
        }
    }
}

/// The committed value of a [`FileStateKey`]: the path's type plus (for
/// plain files) a content fingerprint cheap enough to recompute on every
/// stat. Two `FileState`s compare equal exactly when a function that only
/// reads this path's type/contents would observe the same thing — which is
/// what lets value-equality pruning absorb a touch-but-don't-modify event.
#[derive(Allocative, Clone, Debug, PartialEq, Eq)]
pub enum FileState {
    Missing,
    Directory,
    Symlink { target_len: u64 },
    File { len: u64, modified: Option<std::time::SystemTime> },
}

impl FileState {
    /// Stats `path`, collapsing any I/O error (most commonly `NotFound`,
    /// but also e.g. permission errors during a race) to `Missing` — the
    /// dirtiness layer's job is to mark things dirty, not to diagnose why a
    /// stat failed; a dependent that actually needs the file will surface
    /// its own error when it tries to read it.
    pub fn stat(path: &Path) -> Self {
        match fs::symlink_metadata(path) {
            Ok(meta) => match FileType::of(&meta) {
                FileType::Directory => FileState::Directory,
                FileType::Symlink => FileState::Symlink {
                    target_len: fs::read_link(path)
                        .map(|t| t.as_os_str().len() as u64)
                        .unwrap_or(0),
                },
                FileType::File | FileType::Missing => FileState::File {
                    len: meta.len(),
                    modified: meta.modified().ok(),
                },
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => FileState::Missing,
            Err(_) => FileState::Missing,
        }
    }

    pub fn file_type(&self) -> FileType {
        match self {
            FileState::Missing => FileType::Missing,
            FileState::Directory => FileType::Directory,
            FileState::Symlink { .. } => FileType::Symlink,
            FileState::File { .. } => FileType::File,
        }
    }
}

/// Identifies a single filesystem path's state as a memoized node. Interned
/// once per path; the dirtiness layer either recomputes it (normal `Key`
/// dispatch) or injects a freshly-stat'd value directly via
/// `Frame::changed_to` when it already did the stat itself.
#[derive(Allocative, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FileStateKey {
    pub path: Arc<Path>,
}

impl FileStateKey {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::from(path.into()),
        }
    }
}

impl fmt::Display for FileStateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileStateKey({})", self.path.display())
    }
}

#[async_trait]
impl Key for FileStateKey {
    type Value = FileState;

    async fn compute(&self, _env: &Environment) -> Outcome<Self::Value> {
        Outcome::value(FileState::stat(&self.path))
    }
}

/// A directory's set of child names, sorted for deterministic equality. The
/// dirtiness layer invalidates this (never injects it directly) whenever an
/// entry's type changes, per §4.5's "invalidate the parent's directory
/// listing" step — the next reader recomputes it by a fresh `read_dir`.
#[derive(Allocative, Clone, Debug, PartialEq, Eq)]
pub struct DirListing(pub Vec<Arc<str>>);

#[derive(Allocative, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DirListingKey {
    pub path: Arc<Path>,
}

impl DirListingKey {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::from(path.into()),
        }
    }
}

impl fmt::Display for DirListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirListingKey({})", self.path.display())
    }
}

#[async_trait]
impl Key for DirListingKey {
    type Value = DirListing;

    async fn compute(&self, _env: &Environment) -> Outcome<Self::Value> {
        let mut names = match fs::read_dir(&*self.path) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| Arc::from(e.file_name().to_string_lossy().into_owned()))
                .collect::<Vec<Arc<str>>>(),
            Err(_) => Vec::new(),
        };
        names.sort();
        Outcome::value(DirListing(names))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_stats_as_missing() {
        let state = FileState::stat(Path::new("/no/such/path/frame-dirtiness-test"));
        assert_eq!(state, FileState::Missing);
        assert_eq!(state.file_type(), FileType::Missing);
    }

    #[test]
    fn directory_stats_as_directory() {
        let state = FileState::stat(Path::new("."));
        assert_eq!(state, FileState::Directory);
    }
}
