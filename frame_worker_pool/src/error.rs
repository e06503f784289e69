/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use thiserror::Error;

use crate::key::WorkerKey;

#[derive(Debug, Error)]
pub enum WorkerPoolError {
    #[error("failed to spawn worker for {0:?}: {1}")]
    Spawn(WorkerKey, std::io::Error),

    #[error("transport io error: {0}")]
    Io(#[source] std::io::Error),

    #[error("failed to encode a wire message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode a wire message: {0}")]
    Decode(#[source] bincode::Error),

    #[error("failed to encode a wire message as newline-delimited JSON: {0}")]
    EncodeJson(#[source] serde_json::Error),

    #[error("failed to decode a newline-delimited JSON wire message: {0}")]
    DecodeJson(#[source] serde_json::Error),

    #[error("worker exited before responding to request {0}")]
    WorkerExited(u64),

    #[error("worker sent a response for a request that wasn't outstanding: {0}")]
    UnexpectedResponse(u64),

    #[error("timed out waiting for a worker to become available for {0:?}")]
    AcquireTimedOut(WorkerKey),

    #[error("worker did not acknowledge cancellation of request {0} in time")]
    CancelTimedOut(u64),

    #[error("worker process did not expose a piped {0}")]
    MissingPipe(&'static str),

    #[error("request {0} was interrupted on a worker that does not support cancellation; the worker was destroyed")]
    DestroyedOnCancellation(u64),
}
