/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! A single long-lived worker subprocess (§4.7): spawned once, reused across
//! many `execute` calls until `release(ok = false)` or a cancellation it
//! can't absorb retires it.

use std::process::Stdio;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dupe::Dupe;
use frame_futures::cancellable_future::CancellableFuture;
use frame_futures::CancellationContext;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::error::WorkerPoolError;
use crate::key::WireEncoding;
use crate::key::WorkerKey;
use crate::key::WorkerSpec;
use crate::protocol::recv_message;
use crate::protocol::send_message;
use crate::protocol::FramedReader;
use crate::protocol::FramedWriter;
use crate::protocol::RequestId;
use crate::protocol::WireMessage;

/// How long `execute` waits for `WasCancelled` once it has sent `Cancel`
/// before giving up and treating the worker as dead.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;
type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// The result of a completed `execute`: either the worker answered, or it
/// cleanly honored a cancellation and remains reusable.
#[derive(Debug, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Response(Vec<u8>),
    Cancelled,
}

/// A live worker process. `execute` may be called concurrently by several
/// callers for a `Multiplex`-keyed worker; the pool only ever loans a
/// `Singleplex`-keyed worker to one caller at a time, so concurrent calls on
/// those are a caller bug rather than something this type needs to prevent.
pub struct Worker {
    key: WorkerKey,
    /// `None` only for the in-process test fixtures built over an in-memory
    /// duplex pipe (`Worker::spawn` always populates this).
    child: Option<Mutex<Child>>,
    writer: AsyncMutex<FramedWriter<BoxedWriter>>,
    waiters: Arc<DashMap<RequestId, oneshot::Sender<WireMessage>>>,
    reader_task: JoinHandle<()>,
    next_id: AtomicU64,
    supports_cancellation: bool,
}

impl Worker {
    pub async fn spawn(spec: &WorkerSpec) -> Result<Self, WorkerPoolError> {
        let key = spec.key();
        let mut command = Command::new(&spec.program);
        command.args(&spec.argv);
        spec.sandbox.apply(&mut command);
        for (name, value) in &spec.env {
            command.env(name, value);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command
            .spawn()
            .map_err(|e| WorkerPoolError::Spawn(key.clone(), e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or(WorkerPoolError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(WorkerPoolError::MissingPipe("stdout"))?;

        Ok(Self::from_transport(
            key,
            Some(Mutex::new(child)),
            Box::new(stdin),
            Box::new(stdout),
            spec.encoding,
            spec.supports_cancellation,
        ))
    }

    fn from_transport(
        key: WorkerKey,
        child: Option<Mutex<Child>>,
        writer: BoxedWriter,
        reader: BoxedReader,
        encoding: WireEncoding,
        supports_cancellation: bool,
    ) -> Self {
        let writer = FramedWriter::new(writer, encoding);
        let mut reader = FramedReader::new(reader, encoding);

        let waiters: Arc<DashMap<RequestId, oneshot::Sender<WireMessage>>> =
            Arc::new(DashMap::new());
        let waiters2 = waiters.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match recv_message(&mut reader).await {
                    Ok(Some(message)) => {
                        let id = message.id();
                        if let Some((_, sender)) = waiters2.remove(&id) {
                            // The receiver may already be gone (e.g. a
                            // cancelled `execute` that re-registered a fresh
                            // waiter under the same id right after); either
                            // way there's nothing more to do with this frame.
                            let _ = sender.send(message);
                        } else {
                            tracing::warn!("worker sent a frame for unknown request {}", id);
                        }
                    }
                    Ok(None) => {
                        tracing::info!("worker stdout closed");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("worker transport error: {}", e);
                        return;
                    }
                }
            }
        });

        Self {
            key,
            child,
            writer: AsyncMutex::new(writer),
            waiters,
            reader_task,
            next_id: AtomicU64::new(0),
            supports_cancellation,
        }
    }

    pub fn key(&self) -> &WorkerKey {
        &self.key
    }

    /// Sends `payload` and awaits the matching response, honoring
    /// cooperative cancellation via `cancellation`. If `cancellation` fires
    /// first: a worker that declared `supports_cancellation` is sent a
    /// `Cancel` frame and this waits (bounded by [`CANCEL_GRACE`]) for
    /// `WasCancelled`, after which the worker is still good to reuse; a
    /// worker that didn't is killed immediately and the call returns
    /// `Err(DestroyedOnCancellation)` — the pool must not put it back in the
    /// idle set.
    pub async fn execute(
        &self,
        payload: Vec<u8>,
        cancellation: &CancellationContext,
    ) -> Result<ExecuteOutcome, WorkerPoolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);

        self.send(&WireMessage::Request { id, payload }).await?;

        match CancellableFuture::new(rx, cancellation.dupe()).await {
            Some(Ok(WireMessage::Response { payload, .. })) => Ok(ExecuteOutcome::Response(payload)),
            Some(Ok(_)) => Err(WorkerPoolError::UnexpectedResponse(id)),
            Some(Err(_)) => Err(WorkerPoolError::WorkerExited(id)),
            None => self.cancel(id).await,
        }
    }

    async fn cancel(&self, id: RequestId) -> Result<ExecuteOutcome, WorkerPoolError> {
        if !self.supports_cancellation {
            self.kill();
            return Err(WorkerPoolError::DestroyedOnCancellation(id));
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        self.send(&WireMessage::Cancel { id }).await?;

        match tokio::time::timeout(CANCEL_GRACE, rx).await {
            Ok(Ok(WireMessage::WasCancelled { .. })) => Ok(ExecuteOutcome::Cancelled),
            // The worker finished the original request right as we asked it
            // to cancel; honor the answer it actually produced.
            Ok(Ok(WireMessage::Response { payload, .. })) => Ok(ExecuteOutcome::Response(payload)),
            Ok(Ok(_)) => Err(WorkerPoolError::UnexpectedResponse(id)),
            Ok(Err(_)) => Err(WorkerPoolError::WorkerExited(id)),
            Err(_) => {
                self.kill();
                Err(WorkerPoolError::CancelTimedOut(id))
            }
        }
    }

    async fn send(&self, message: &WireMessage) -> Result<(), WorkerPoolError> {
        let mut writer = self.writer.lock().await;
        send_message(&mut *writer, message).await
    }

    fn kill(&self) {
        // `start_kill` only requests termination; we don't wait for it here
        // since `kill()` is always followed by dropping this `Worker` (the
        // pool never puts one back in the idle set past a failed `execute`).
        if let Some(child) = &self.child {
            let _ = child.lock().start_kill();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.reader_task.abort();
        if let Some(child) = &mut self.child {
            let _ = child.get_mut().start_kill();
        }
    }
}
