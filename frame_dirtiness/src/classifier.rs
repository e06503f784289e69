/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Where a changed path sits relative to the workspace decides which
//! dirtiness mode applies (§4.5): a cacheable path gets its freshly-stat'd
//! state injected via `Frame::changed_to`; a non-cacheable one is only
//! marked `DIRTY`, forcing whatever reads it to recompute from scratch.

use std::path::Path;
use std::path::PathBuf;

/// Where a path sits, mirroring the teacher's cell/buck-out distinction in
/// `buck2_core`'s cell and output-path resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileClass {
    /// Inside a cell, part of the input graph.
    Internal,
    /// Outside every cell but still part of the build (e.g. a toolchain
    /// root referenced by absolute path).
    External,
    /// A VCS/package root mounted read-only alongside the workspace.
    ExternalRepo,
    /// Underneath a build output directory; changes here are almost always
    /// the engine's own writes, not real input changes.
    Output,
    /// Vendored/third-party content bundled with the workspace.
    Bundled,
}

impl FileClass {
    /// Only these three are safe to cache an injected `FileState` for: an
    /// `ExternalRepo`/`Output` path's content can't be trusted to stay
    /// stable between the stat and the read that follows it, so those are
    /// always re-stat'd from a plain invalidation instead of an injection.
    pub fn is_cacheable(self) -> bool {
        matches!(self, FileClass::Internal | FileClass::External | FileClass::Bundled)
    }
}

/// Maps a path to its [`FileClass`]. A collaborator supplies one reflecting
/// their own cell/output layout; `PrefixClassifier` below is a simple,
/// workable default.
pub trait FileClassifier: Send + Sync {
    fn classify(&self, path: &Path) -> FileClass;
}

/// Classifies by longest matching prefix among a fixed set of roots,
/// falling back to `External` for anything outside all of them — the
/// simplest classifier that can answer the question, grounded in how
/// `buck2_core::cells::CellResolver` resolves a path to its owning cell by
/// longest-prefix match.
pub struct PrefixClassifier {
    output_prefixes: Vec<PathBuf>,
    bundled_prefixes: Vec<PathBuf>,
    external_repo_prefixes: Vec<PathBuf>,
    internal_roots: Vec<PathBuf>,
}

impl PrefixClassifier {
    pub fn new(internal_roots: Vec<PathBuf>) -> Self {
        Self {
            output_prefixes: Vec::new(),
            bundled_prefixes: Vec::new(),
            external_repo_prefixes: Vec::new(),
            internal_roots,
        }
    }

    pub fn with_output_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.output_prefixes.push(prefix.into());
        self
    }

    pub fn with_bundled_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.bundled_prefixes.push(prefix.into());
        self
    }

    pub fn with_external_repo_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.external_repo_prefixes.push(prefix.into());
        self
    }
}

impl FileClassifier for PrefixClassifier {
    fn classify(&self, path: &Path) -> FileClass {
        if self.output_prefixes.iter().any(|p| path.starts_with(p)) {
            return FileClass::Output;
        }
        if self.bundled_prefixes.iter().any(|p| path.starts_with(p)) {
            return FileClass::Bundled;
        }
        if self.external_repo_prefixes.iter().any(|p| path.starts_with(p)) {
            return FileClass::ExternalRepo;
        }
        if self.internal_roots.iter().any(|p| path.starts_with(p)) {
            return FileClass::Internal;
        }
        FileClass::External
    }
}
