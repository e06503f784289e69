/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Cooperative cancellation.
//!
//! A [`CancellationContext`] is a cheap, `Dupe`-able handle shared by every
//! task that was spawned as part of the same evaluation. Cancelling it does
//! not forcibly tear down in-flight work: it only flips a flag that
//! [`CancellableFuture`] and the evaluator's suspension points consult. A
//! [`CancellationGuard`], once acquired, guarantees the holder will not
//! observe cancellation until it drops the guard, so a node can always finish
//! committing its result to the node store even if cancellation was
//! requested mid-write.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;

use dupe::Dupe;
use futures::future::BoxFuture;
use futures::task::AtomicWaker;
use futures::FutureExt;

struct Inner {
    cancelled: AtomicBool,
    in_critical_section: AtomicUsize,
    /// Wakes whoever is polling a [`CancellableFuture`] over this context as
    /// soon as `cancel` is called, so a future blocked on I/O with no other
    /// wakeup source (e.g. a worker-pool `execute` waiting on a pipe) still
    /// observes cancellation promptly instead of only at its next
    /// coincidental poll.
    waker: AtomicWaker,
}

/// A handle shared between an evaluation's caller and every task spawned on
/// its behalf.
#[derive(Clone, Dupe)]
pub struct CancellationContext {
    inner: Arc<Inner>,
}

impl Default for CancellationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                in_critical_section: AtomicUsize::new(0),
                waker: AtomicWaker::new(),
            }),
        }
    }

    /// Never observes cancellation. Useful for the root context of a
    /// computation that is not attached to any cancellable handle (tests,
    /// one-off synchronous projections).
    pub fn never_cancelled() -> Self {
        Self::new()
    }

    /// Requests cancellation. Does not block; in-flight critical sections run
    /// to completion. Wakes any [`CancellableFuture`] currently polling
    /// against this context.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.waker.wake();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Registers `waker` to be woken on the next `cancel`. Only
    /// [`CancellableFuture`] needs this; exposed so other cancellation-aware
    /// futures in this crate can share the same wakeup path instead of
    /// polling `is_cancelled` on a timer.
    pub fn register_waker(&self, waker: &Waker) {
        self.inner.waker.register(waker);
    }

    /// Attempts to enter a section of code that must finish once started.
    /// Returns `None` if cancellation was already observed before the
    /// section could be entered; once entered, the held [`CancellationGuard`]
    /// is guaranteed to outlive any later call to [`cancel`](Self::cancel).
    pub fn try_enter_critical_section(&self) -> Option<CancellationGuard> {
        if self.is_cancelled() {
            return None;
        }
        self.inner.in_critical_section.fetch_add(1, Ordering::SeqCst);
        Some(CancellationGuard {
            inner: self.inner.dupe(),
        })
    }

    pub fn has_in_flight_critical_sections(&self) -> bool {
        self.inner.in_critical_section.load(Ordering::SeqCst) > 0
    }
}

/// Held while running code that must not be abandoned partway through.
pub struct CancellationGuard {
    inner: Arc<Inner>,
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        self.inner.in_critical_section.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs `future` to completion, but resolves to `None` as soon as `ctx` is
/// cancelled and the future is not inside a critical section.
///
/// Re-polls only ever check cancellation between yields of the wrapped
/// future, matching the evaluator's rule that a task may only be preempted at
/// suspension points (`get`/`get_many`), never mid-instruction.
pub struct CancellableFuture<T> {
    inner: BoxFuture<'static, T>,
    ctx: CancellationContext,
}

impl<T> CancellableFuture<T> {
    pub fn new<F>(future: F, ctx: CancellationContext) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            inner: future.boxed(),
            ctx,
        }
    }
}

impl<T> Future for CancellableFuture<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.ctx.register_waker(cx.waker());
        if self.ctx.is_cancelled() && !self.ctx.has_in_flight_critical_sections() {
            return Poll::Ready(None);
        }
        match self.inner.poll_unpin(cx) {
            Poll::Ready(v) => Poll::Ready(Some(v)),
            Poll::Pending => {
                if self.ctx.is_cancelled() && !self.ctx.has_in_flight_critical_sections() {
                    Poll::Ready(None)
                } else {
                    Poll::Pending
                }
            }
        }
    }
}
