/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Sandboxed vs. unsandboxed workers differ only in how the subprocess is
//! isolated before it starts accepting requests (§4.7); everything past
//! spawn — the framed protocol, acquire/execute/release, cancellation — is
//! identical either way.

use std::path::PathBuf;

use tokio::process::Command;

/// The isolation a worker process is spawned under. Part of a [`crate::key::WorkerKey`]:
/// two otherwise-identical workers with different sandboxing never share a
/// pool slot, since their observable behavior (what paths they can see,
/// whether they share the network namespace) differs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxedSpec {
    /// `None` means unsandboxed: the worker runs with the caller's full
    /// filesystem view.
    pub isolation_root: Option<PathBuf>,
    /// Additional paths bind-mounted (or otherwise made visible) read-write
    /// inside `isolation_root`. Ignored when `isolation_root` is `None`.
    pub writable_paths: Vec<PathBuf>,
    /// Strip the spawning process's environment before applying `WorkerSpec::env`,
    /// rather than inheriting it and overlaying on top.
    pub scrub_env: bool,
}

impl SandboxedSpec {
    pub fn unsandboxed() -> Self {
        Self {
            isolation_root: None,
            writable_paths: Vec::new(),
            scrub_env: false,
        }
    }

    pub fn is_sandboxed(&self) -> bool {
        self.isolation_root.is_some()
    }

    /// Applies this spec's isolation to a not-yet-spawned command. Real
    /// sandboxing (namespaces, bind mounts, seccomp) is platform-specific and
    /// left to the caller's `Command` construction upstream of pooling; this
    /// only carries the declarative bits the pool needs for keying, plus the
    /// one part every platform shares: environment scrubbing.
    pub fn apply(&self, command: &mut Command) {
        if self.scrub_env {
            command.env_clear();
        }
    }
}
