/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The tag-indexed table of function records a family installs at
//! `register_family` time: the type-erased `compute`, `equality`, and
//! `cycle_handler` closures the evaluator invokes through a plain index
//! lookup (§9: "dynamic dispatch on function family" replaced by a table of
//! closures + metadata, never a vtable per key type).

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::cycles::CycleInfo;
use crate::environment::Environment;
use crate::environment::Outcome;
use crate::error::FrameError;
use crate::key::DynValue;
use crate::key::FamilyId;
use crate::key::KeyPayload;

pub(crate) type ComputeFn =
    Arc<dyn Fn(Arc<dyn KeyPayload>, Environment) -> BoxFuture<'static, Outcome<DynValue>> + Send + Sync>;
pub(crate) type EqualityFn = Arc<dyn Fn(&DynValue, &DynValue) -> bool + Send + Sync>;
pub(crate) type CycleFn =
    Arc<dyn Fn(Arc<dyn KeyPayload>, CycleInfo) -> Result<DynValue, FrameError> + Send + Sync>;

pub(crate) struct FunctionEntry {
    pub(crate) compute: ComputeFn,
    pub(crate) equality: EqualityFn,
    pub(crate) cycle_handler: CycleFn,
}

/// Indexed by `FamilyId.index`; parallel to `KeyRegistry`'s family metadata
/// table, kept separate so interning (cheap, hot path) doesn't need to know
/// about closures at all.
#[derive(Default)]
pub struct FunctionTable {
    entries: RwLock<Vec<Option<FunctionEntry>>>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn install(&self, family: FamilyId, entry: FunctionEntry) {
        let mut entries = self.entries.write();
        let index = family.index as usize;
        if entries.len() <= index {
            entries.resize_with(index + 1, || None);
        }
        entries[index] = Some(entry);
    }

    pub(crate) fn compute(&self, family: FamilyId) -> ComputeFn {
        self.entries.read()[family.index as usize]
            .as_ref()
            .expect("family registered without a compute function")
            .compute
            .clone()
    }

    pub(crate) fn equality(&self, family: FamilyId) -> EqualityFn {
        self.entries.read()[family.index as usize]
            .as_ref()
            .expect("family registered without a compute function")
            .equality
            .clone()
    }

    pub(crate) fn cycle_handler(&self, family: FamilyId) -> CycleFn {
        self.entries.read()[family.index as usize]
            .as_ref()
            .expect("family registered without a compute function")
            .cycle_handler
            .clone()
    }
}
