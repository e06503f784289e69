/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Abstraction over "how a task gets run", so `frame` can be driven by the
//! real `tokio` runtime in production and by a synchronous or
//! instrumentation-wrapping spawner in tests.

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

/// Context-parameterized so an evaluator can pass itself (or a scoped slice
/// of itself) through to whatever bookkeeping a custom spawner wants to do,
/// without `frame_futures` knowing anything about `frame`'s types.
pub trait Spawner<Ctx>: Send + Sync + 'static {
    fn spawn(
        &self,
        ctx: &Ctx,
        future: BoxFuture<'static, Box<dyn Any + Send>>,
    ) -> JoinHandle<Box<dyn Any + Send>>;
}

/// The default spawner: hands the future straight to the ambient `tokio`
/// runtime.
pub struct TokioSpawner;

impl<Ctx> Spawner<Ctx> for TokioSpawner {
    fn spawn(
        &self,
        _ctx: &Ctx,
        future: BoxFuture<'static, Box<dyn Any + Send>>,
    ) -> JoinHandle<Box<dyn Any + Send>> {
        tokio::task::spawn(future)
    }
}

/// Convenience so callers can hold a `Arc<dyn Spawner<Ctx>>` without
/// re-deriving object safety bounds at every call site.
pub type DynSpawner<Ctx> = Arc<dyn Spawner<Ctx>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tokio_spawner_runs_the_future() {
        let spawner = TokioSpawner;
        let handle = spawner.spawn(
            &(),
            Box::pin(async { Box::new(7i32) as Box<dyn Any + Send> }),
        );
        let result = handle.await.unwrap();
        assert_eq!(*result.downcast::<i32>().unwrap(), 7);
    }
}
