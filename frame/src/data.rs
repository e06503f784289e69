/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Immutable, globally precomputed configuration, set once at engine
//! construction and read by every function via `Environment::semantics()`.
//! Grounded in the teacher's `DiceDataBuilder`/`DiceData`; a plain
//! `HashMap<TypeId, Box<dyn Any>>` is enough here, so `frame` does not take
//! on the `anymap` crate for a single-purpose bag (see `DESIGN.md`).

use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

/// A type-keyed bag of immutable configuration, built once and shared for
/// the engine's whole lifetime.
#[derive(Default)]
pub struct EngineData {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for EngineData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineData")
            .field("entries", &self.values.len())
            .finish()
    }
}

impl EngineData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    fn set<T: Send + Sync + 'static>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Box::new(value));
    }
}

/// Builder for [`EngineData`]; the only way to populate it, since once the
/// engine is built the bag is immutable for its whole lifetime.
#[derive(Default)]
pub struct EngineDataBuilder(EngineData);

impl EngineDataBuilder {
    pub fn new() -> Self {
        Self(EngineData::new())
    }

    pub fn set<T: Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        self.0.set(value);
        self
    }

    pub fn build(self) -> EngineData {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_typed_values() {
        let mut builder = EngineDataBuilder::new();
        builder.set(7usize);
        builder.set("hello".to_owned());
        let data = builder.build();

        assert_eq!(data.get::<usize>(), Some(&7));
        assert_eq!(data.get::<String>().map(String::as_str), Some("hello"));
        assert_eq!(data.get::<f64>(), None);
    }
}
