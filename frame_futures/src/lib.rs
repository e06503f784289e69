/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The concurrency substrate underneath the `frame` evaluation engine.
//!
//! This crate has no notion of keys, values, or nodes: it only knows how to
//! run a future such that it can be cooperatively cancelled, and how to route
//! work onto one of a small, fixed set of labeled thread pools. `frame` is
//! the only intended consumer, but nothing here depends on it.

#[macro_use]
extern crate tracing;

pub mod cancellable_future;
pub mod pools;
pub mod spawner;

pub use cancellable_future::CancellationContext;
pub use cancellable_future::CancellationGuard;
pub use pools::PoolError;
pub use pools::PoolLabel;
pub use pools::WorkerPools;
pub use pools::WorkerPoolsConfig;
pub use spawner::Spawner;
pub use spawner::TokioSpawner;
