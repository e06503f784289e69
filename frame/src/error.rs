/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! C6 (error half): the taxonomy of kinds an evaluation can surface. The
//! engine never formats a user-facing message; it only carries enough
//! structure (kind + root-cause keys) for a collaborator to do so.

use std::sync::Arc;

use allocative::Allocative;
use dupe::Dupe;
use thiserror::Error;

use crate::key::KeyId;

/// The public error type. `Arc`-wrapped so the same cycle or contract error
/// can be attached cheaply to every node it touches, and so it is
/// `Send + Sync + 'static` across the worker-pool's process boundary.
#[derive(Clone, Dupe, Debug, Error, Allocative)]
#[error(transparent)]
pub struct FrameError(pub(crate) Arc<FrameErrorKind>);

impl FrameError {
    pub fn kind(&self) -> &FrameErrorKind {
        &self.0
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self(Arc::new(FrameErrorKind::Contract(message.into())))
    }

    pub fn function(family: &'static str, source: anyhow::Error) -> Self {
        Self(Arc::new(FrameErrorKind::Function { family, source }))
    }

    pub fn cycle(trigger: KeyId, cyclic_keys: Vec<KeyId>) -> Self {
        Self(Arc::new(FrameErrorKind::Cycle {
            trigger,
            cyclic_keys,
        }))
    }

    pub fn aborted() -> Self {
        Self(Arc::new(FrameErrorKind::Aborted))
    }

    pub fn interrupted() -> Self {
        Self(Arc::new(FrameErrorKind::Interrupted))
    }

    pub fn timeout(key: KeyId) -> Self {
        Self(Arc::new(FrameErrorKind::Timeout(key)))
    }

    pub fn catastrophic(message: impl Into<String>) -> Self {
        Self(Arc::new(FrameErrorKind::Catastrophic(message.into())))
    }

    pub fn is_catastrophic(&self) -> bool {
        matches!(&*self.0, FrameErrorKind::Catastrophic(_))
    }

    /// Whether the family's declared [`ErrorPolicy`](crate::key::ErrorPolicy)
    /// is irrelevant for this kind: contract/cycle/aborted/interrupted/
    /// catastrophic errors are never cached as if they were ordinary function
    /// results.
    pub fn is_function_error(&self) -> bool {
        matches!(&*self.0, FrameErrorKind::Function { .. })
    }
}

#[derive(Debug, Error, Allocative)]
pub enum FrameErrorKind {
    /// A caller broke a precondition: violated dep discipline (produced a
    /// `Value` after observing `Missing`), or attempted to mutate a `DONE`
    /// node outside a new version.
    #[error("contract violated: {0}")]
    Contract(String),

    /// A domain-specific error a family declared in advance.
    #[error("function `{family}` failed: {source}")]
    Function {
        family: &'static str,
        #[allocative(skip)]
        #[source]
        source: anyhow::Error,
    },

    /// Reported when the cycle detector finds a closed walk through
    /// unfinished dep edges.
    #[error("cycle detected, triggered by {trigger}: {}", cyclic_keys.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(" -> "))]
    Cycle {
        trigger: KeyId,
        cyclic_keys: Vec<KeyId>,
    },

    /// Work stopped because another error caused `--nokeep_going` shutdown.
    /// Not a real diagnosis of this node.
    #[error("evaluation aborted due to an earlier error")]
    Aborted,

    /// Cooperative cancellation reached this node before it completed.
    #[error("evaluation interrupted")]
    Interrupted,

    #[error("key {0} timed out")]
    Timeout(KeyId),

    /// An internal invariant was violated. The evaluator shuts down all
    /// pools and re-raises.
    #[error("catastrophic internal error: {0}")]
    Catastrophic(String),
}

pub type FrameResult<T> = Result<T, FrameError>;
