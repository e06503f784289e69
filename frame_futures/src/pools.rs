/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Three labeled thread pools sized independently, so a host can give
//! `CPU_HEAVY` work fewer threads than `REGULAR` I/O-bound work without the
//! two classes starving each other. `EXECUTION` is the odd one out: a host
//! that never runs worker-process actions need not configure it at all.

use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dupe::Dupe;
use parking_lot::Mutex;
use tokio::runtime::Builder;
use tokio::runtime::Runtime;
use tokio::sync::Notify;

/// Which class of work a spawned task belongs to. Mirrors the function
/// family's declared class (see `frame`'s `FunctionClass`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Dupe)]
pub enum PoolLabel {
    Regular,
    CpuHeavy,
    Execution,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool {0:?} is shutting down and no longer accepts work")]
    Rejected(PoolLabel),
    #[error("failed to build {0:?} pool: {1}")]
    Build(PoolLabel, std::io::Error),
}

/// Sizes for the three pools. `execution_threads = None` means `EXECUTION`
/// class work is routed onto `REGULAR` instead of getting a dedicated pool.
pub struct WorkerPoolsConfig {
    pub regular_threads: usize,
    pub cpu_heavy_threads: usize,
    pub execution_threads: Option<usize>,
}

impl Default for WorkerPoolsConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            regular_threads: parallelism,
            cpu_heavy_threads: parallelism,
            execution_threads: None,
        }
    }
}

struct LabeledPool {
    label: PoolLabel,
    runtime: Runtime,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    rejecting: Arc<AtomicBool>,
    first_error: Arc<Mutex<Option<String>>>,
}

impl LabeledPool {
    fn new(label: PoolLabel, threads: usize) -> Result<Self, PoolError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name(format!("frame-{:?}", label).to_lowercase())
            .enable_all()
            .build()
            .map_err(|e| PoolError::Build(label, e))?;
        Ok(Self {
            label,
            runtime,
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            rejecting: Arc::new(AtomicBool::new(false)),
            first_error: Arc::new(Mutex::new(None)),
        })
    }

    fn submit<F>(&self, future: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(PoolError::Rejected(self.label));
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        let active = self.active.dupe();
        let idle = self.idle.dupe();
        let rejecting = self.rejecting.dupe();
        let first_error = self.first_error.dupe();
        self.runtime.spawn(async move {
            future.await;
            if active.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
            let _ = (&rejecting, &first_error);
        });
        Ok(())
    }

    /// Records a panic/error observed out-of-band (e.g. from a `JoinHandle`)
    /// and stops accepting new submissions after the first one.
    fn report_error(&self, message: String) {
        let mut first_error = self.first_error.lock();
        if first_error.is_none() {
            *first_error = Some(message);
        }
        self.rejecting.store(true, Ordering::SeqCst);
    }

    fn first_error(&self) -> Option<String> {
        self.first_error.lock().clone()
    }

    async fn quiesce(&self) {
        loop {
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            self.idle.notified().await;
        }
    }
}

/// The three class-specific executors an evaluator submits node-compute
/// tasks onto.
pub struct WorkerPools {
    regular: LabeledPool,
    cpu_heavy: LabeledPool,
    execution: Option<LabeledPool>,
}

impl WorkerPools {
    pub fn new(config: WorkerPoolsConfig) -> Result<Self, PoolError> {
        Ok(Self {
            regular: LabeledPool::new(PoolLabel::Regular, config.regular_threads)?,
            cpu_heavy: LabeledPool::new(PoolLabel::CpuHeavy, config.cpu_heavy_threads)?,
            execution: config
                .execution_threads
                .map(|n| LabeledPool::new(PoolLabel::Execution, n))
                .transpose()?,
        })
    }

    fn pool_for(&self, label: PoolLabel) -> &LabeledPool {
        match label {
            PoolLabel::Regular => &self.regular,
            PoolLabel::CpuHeavy => &self.cpu_heavy,
            PoolLabel::Execution => self.execution.as_ref().unwrap_or_else(|| {
                warn_once_execution_fallback();
                &self.regular
            }),
        }
    }

    pub fn submit<F>(&self, label: PoolLabel, future: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pool_for(label).submit(future)
    }

    pub fn report_error(&self, label: PoolLabel, message: String) {
        self.pool_for(label).report_error(message);
    }

    pub fn first_error(&self, label: PoolLabel) -> Option<String> {
        self.pool_for(label).first_error()
    }

    /// Waits for all three pools to have zero in-flight tasks. Accepts an
    /// `interrupted` predicate polled between waits (e.g. a ctrl-c or
    /// shutdown-request signal); an interrupt does not abort the wait, it is
    /// only accumulated into the returned flag, matching the "ignore and
    /// re-enter" termination contract.
    pub async fn quiesce(&self, mut interrupted: impl FnMut() -> bool) -> bool {
        let mut was_interrupted = false;
        loop {
            self.regular.quiesce().await;
            self.cpu_heavy.quiesce().await;
            if let Some(execution) = &self.execution {
                execution.quiesce().await;
            }
            if interrupted() {
                was_interrupted = true;
                continue;
            }
            // Re-check after the interrupt poll: new work may have been
            // submitted while we were waiting on the last pool.
            let all_idle = self.regular.active.load(Ordering::SeqCst) == 0
                && self.cpu_heavy.active.load(Ordering::SeqCst) == 0
                && self
                    .execution
                    .as_ref()
                    .map_or(true, |p| p.active.load(Ordering::SeqCst) == 0);
            if all_idle {
                return was_interrupted;
            }
        }
    }
}

fn warn_once_execution_fallback() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        warn!("no EXECUTION pool configured; routing EXECUTION-class work onto REGULAR");
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn submits_run_and_quiesce_observes_completion() {
        let pools = WorkerPools::new(WorkerPoolsConfig {
            regular_threads: 2,
            cpu_heavy_threads: 1,
            execution_threads: None,
        })
        .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.dupe();
            pools
                .submit(PoolLabel::Regular, async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        pools.quiesce(|| false).await;
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn execution_class_falls_back_to_regular_without_dedicated_pool() {
        let pools = WorkerPools::new(WorkerPoolsConfig {
            regular_threads: 1,
            cpu_heavy_threads: 1,
            execution_threads: None,
        })
        .unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.dupe();
        pools
            .submit(PoolLabel::Execution, async move {
                ran2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        pools.quiesce(|| false).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn report_error_rejects_further_submissions() {
        let pools = WorkerPools::new(WorkerPoolsConfig {
            regular_threads: 1,
            cpu_heavy_threads: 1,
            execution_threads: None,
        })
        .unwrap();

        pools.report_error(PoolLabel::Regular, "boom".to_owned());
        assert_eq!(pools.first_error(PoolLabel::Regular).as_deref(), Some("boom"));

        let err = pools.submit(PoolLabel::Regular, async {}).unwrap_err();
        assert!(matches!(err, PoolError::Rejected(PoolLabel::Regular)));
    }
}
