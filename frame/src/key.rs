/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! C1: the key & value registry.
//!
//! Dispatch here is a tag-indexed table lookup, not per-type trait-object
//! dispatch: a [`FamilyId`] names the function that knows how to compute any
//! key belonging to it, and `family_of(key)` is an O(1) index into an arena,
//! never a vtable call. This is a deliberate departure from a one-`impl`-
//! per-key-type model — see `DESIGN.md`.

use std::any::Any;
use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use allocative::Allocative;
use dashmap::DashMap;
use dupe::Dupe;
use fnv::FnvHasher;
use parking_lot::RwLock;

/// Anything that can serve as a key's payload: hashable, comparable,
/// printable, and cheap to move around behind an `Arc`.
pub trait KeyPayload: Allocative + Debug + fmt::Display + Send + Sync + 'static {
    fn dyn_eq(&self, other: &dyn KeyPayload) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
    fn as_any(&self) -> &dyn Any;
}

impl<T> KeyPayload for T
where
    T: Allocative + Debug + fmt::Display + Eq + Hash + Send + Sync + 'static,
{
    fn dyn_eq(&self, other: &dyn KeyPayload) -> bool {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        self.hash(&mut state)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl PartialEq for dyn KeyPayload {
    fn eq(&self, other: &Self) -> bool {
        self.dyn_eq(other)
    }
}

impl Eq for dyn KeyPayload {}

impl Hash for dyn KeyPayload {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dyn_hash(state)
    }
}

/// Anything a function may produce as a node's committed result.
pub trait Value: Allocative + Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
}

impl<T> Value for T
where
    T: Allocative + Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A value, downcast back to its concrete type by a family's equality
/// function. Stored type-erased because dispatch is by runtime tag, not by
/// Rust generic instantiation.
pub type DynValue = Arc<dyn Value>;

/// Dense, interned handle standing in for a typed key inside the node store.
/// Two keys with equal (family, payload) always intern to the same `KeyId`.
#[derive(Clone, Copy, Dupe, Eq, PartialEq, Hash, Debug, Ord, PartialOrd, Allocative)]
pub struct KeyId {
    pub(crate) index: u32,
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.index)
    }
}

#[derive(Clone, Copy, Dupe, Eq, PartialEq, Hash, Debug, Allocative)]
pub struct FamilyId {
    pub(crate) index: u32,
}

/// Which of the three labeled pools a family's work is scheduled onto.
#[derive(Clone, Copy, Dupe, Eq, PartialEq, Hash, Debug)]
pub enum FunctionClass {
    Regular,
    CpuHeavy,
    Execution,
}

/// Whether a function error survives to the next build unchanged.
#[derive(Clone, Copy, Dupe, Eq, PartialEq, Hash, Debug)]
pub enum ErrorPolicy {
    /// Errors are cached like values; only invalidation clears them.
    Persistent,
    /// Errors are dropped at the end of a build and always recomputed.
    Transient,
}

pub(crate) struct KeyEntry {
    pub(crate) family: FamilyId,
    pub(crate) payload: Arc<dyn KeyPayload>,
}

struct Interned {
    entries: RwLock<Vec<Arc<KeyEntry>>>,
    by_payload: DashMap<u64, Vec<KeyId>>,
}

pub(crate) struct FamilyRecord {
    pub(crate) name: &'static str,
    pub(crate) class: FunctionClass,
    pub(crate) error_policy: ErrorPolicy,
    /// §5 "per-function timeouts are expressed by the family": `None` means
    /// no deadline, the common case.
    pub(crate) timeout: Option<Duration>,
}

/// C1: names function families, interns keys, and provides O(1) lookup from
/// a key back to its owning family.
pub struct KeyRegistry {
    interned: Interned,
    families: RwLock<Vec<Arc<FamilyRecord>>>,
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self {
            interned: Interned {
                entries: RwLock::new(Vec::new()),
                by_payload: DashMap::new(),
            },
            families: RwLock::new(Vec::new()),
        }
    }

    /// Installs a function family and returns the tag future keys attach to.
    pub fn register_family(
        &self,
        name: &'static str,
        class: FunctionClass,
        error_policy: ErrorPolicy,
        timeout: Option<Duration>,
    ) -> FamilyId {
        let mut families = self.families.write();
        let index = families.len() as u32;
        families.push(Arc::new(FamilyRecord {
            name,
            class,
            error_policy,
            timeout,
        }));
        FamilyId { index }
    }

    pub fn family_record(&self, family: FamilyId) -> Arc<FamilyRecord> {
        self.families.read()[family.index as usize].dupe()
    }

    fn hash_payload(family: FamilyId, payload: &dyn KeyPayload) -> u64 {
        let mut hasher = FnvHasher::default();
        family.index.hash(&mut hasher);
        payload.dyn_hash(&mut hasher);
        hasher.finish()
    }

    /// Interns `(family, payload)`. Equal payloads under the same family
    /// always return the same `KeyId`.
    pub fn key_of<K: KeyPayload>(&self, family: FamilyId, payload: K) -> KeyId {
        let hash = Self::hash_payload(family, &payload);
        if let Some(existing) = self.interned.by_payload.get(&hash) {
            for candidate in existing.iter() {
                let entries = self.interned.entries.read();
                let entry = &entries[candidate.index as usize];
                if entry.family == family && entry.payload.dyn_eq(&payload) {
                    return *candidate;
                }
            }
        }

        let mut entries = self.interned.entries.write();
        // Re-check under the write lock: another thread may have interned
        // the same payload while we were building our candidate list.
        if let Some(existing) = self.interned.by_payload.get(&hash) {
            for candidate in existing.iter() {
                let entry = &entries[candidate.index as usize];
                if entry.family == family && entry.payload.dyn_eq(&payload) {
                    return *candidate;
                }
            }
        }

        let index = entries.len() as u32;
        let id = KeyId { index };
        entries.push(Arc::new(KeyEntry {
            family,
            payload: Arc::new(payload),
        }));
        drop(entries);
        self.interned.by_payload.entry(hash).or_default().push(id);
        id
    }

    pub(crate) fn entry(&self, key: KeyId) -> Arc<KeyEntry> {
        self.interned.entries.read()[key.index as usize].dupe()
    }

    pub fn family_of(&self, key: KeyId) -> FamilyId {
        self.entry(key).family
    }

    pub fn payload_of<K: KeyPayload>(&self, key: KeyId) -> Option<Arc<K>> {
        let entry = self.entry(key);
        if entry.payload.as_any().is::<K>() {
            // SAFETY: the `is::<K>()` check above confirms the concrete type;
            // this mirrors the teacher's `DiceKeyDynExt::downcast`, avoiding
            // an extra clone of the payload.
            Some(unsafe { Arc::from_raw(Arc::into_raw(entry.payload.dupe()).cast()) })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use derive_more::Display;

    use super::*;

    #[derive(Allocative, Debug, Display, Eq, PartialEq, Hash)]
    #[display(fmt = "K({})", _0)]
    struct TestKey(u32);

    #[test]
    fn equal_payloads_intern_to_the_same_id() {
        let registry = KeyRegistry::new();
        let family = registry.register_family("test", FunctionClass::Regular, ErrorPolicy::Persistent, None);

        let a = registry.key_of(family, TestKey(1));
        let b = registry.key_of(family, TestKey(1));
        let c = registry.key_of(family, TestKey(2));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(registry.family_of(a), family);
    }

    #[test]
    fn payload_round_trips_through_downcast() {
        let registry = KeyRegistry::new();
        let family = registry.register_family("test", FunctionClass::Regular, ErrorPolicy::Persistent, None);
        let id = registry.key_of(family, TestKey(42));

        let payload = registry.payload_of::<TestKey>(id).unwrap();
        assert_eq!(*payload, TestKey(42));
    }
}
