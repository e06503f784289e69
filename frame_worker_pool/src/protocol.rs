/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The framed request/response protocol a worker speaks over its stdin and
//! stdout (§4.7). Every message carries an explicit request id so `cancel`
//! and `was_cancelled` can be correlated with the `execute` they interrupt.
//!
//! Two wire encodings are supported, selected per worker by
//! [`crate::key::WireEncoding`]: canonical-encoded records (`bincode` over
//! `tokio_util::codec::LengthDelimitedCodec`) and newline-delimited JSON
//! (`serde_json` over `tokio_util::codec::LinesCodec`). Both carry the same
//! [`WireMessage`] schema; a worker picks one for its whole lifetime.

use bytes::Bytes;
use bytes::BytesMut;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedRead;
use tokio_util::codec::FramedWrite;
use tokio_util::codec::LengthDelimitedCodec;
use tokio_util::codec::LinesCodec;

use crate::error::WorkerPoolError;
use crate::key::WireEncoding;

pub type RequestId = u64;

/// A single frame exchanged with a worker. `Request`/`Response` carry an
/// opaque payload the pool never interprets; `Cancel`/`WasCancelled` are the
/// two control messages the cooperative-cancellation protocol adds on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    Request { id: RequestId, payload: Vec<u8> },
    Response { id: RequestId, payload: Vec<u8> },
    /// Sent to a worker that declared `supports_cancellation` when the
    /// caller of `execute` is interrupted before the matching `Response`
    /// arrives.
    Cancel { id: RequestId },
    /// The worker's acknowledgement that it stopped working on `id` without
    /// producing a `Response`; the worker remains otherwise healthy and is
    /// returned to the idle pool once this arrives.
    WasCancelled { id: RequestId },
}

impl WireMessage {
    pub fn id(&self) -> RequestId {
        match self {
            WireMessage::Request { id, .. } => *id,
            WireMessage::Response { id, .. } => *id,
            WireMessage::Cancel { id } => *id,
            WireMessage::WasCancelled { id } => *id,
        }
    }
}

/// A framed writer over either wire encoding. Picked once at worker spawn
/// time from [`WireEncoding`] and held for the worker's whole lifetime.
pub enum FramedWriter<W> {
    Canonical(FramedWrite<W, LengthDelimitedCodec>),
    NewlineJson(FramedWrite<W, LinesCodec>),
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(writer: W, encoding: WireEncoding) -> Self {
        match encoding {
            WireEncoding::Canonical => {
                FramedWriter::Canonical(FramedWrite::new(writer, LengthDelimitedCodec::new()))
            }
            WireEncoding::NewlineJson => {
                FramedWriter::NewlineJson(FramedWrite::new(writer, LinesCodec::new()))
            }
        }
    }
}

/// A framed reader over either wire encoding, mirroring [`FramedWriter`].
pub enum FramedReader<R> {
    Canonical(FramedRead<R, LengthDelimitedCodec>),
    NewlineJson(FramedRead<R, LinesCodec>),
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(reader: R, encoding: WireEncoding) -> Self {
        match encoding {
            WireEncoding::Canonical => {
                FramedReader::Canonical(FramedRead::new(reader, LengthDelimitedCodec::new()))
            }
            WireEncoding::NewlineJson => {
                FramedReader::NewlineJson(FramedRead::new(reader, LinesCodec::new()))
            }
        }
    }
}

pub async fn send_message<W>(
    writer: &mut FramedWriter<W>,
    message: &WireMessage,
) -> Result<(), WorkerPoolError>
where
    W: AsyncWrite + Unpin,
{
    match writer {
        FramedWriter::Canonical(framed) => {
            let bytes = bincode::serialize(message).map_err(WorkerPoolError::Encode)?;
            framed.send(Bytes::from(bytes)).await.map_err(WorkerPoolError::Io)
        }
        FramedWriter::NewlineJson(framed) => {
            let line = serde_json::to_string(message).map_err(WorkerPoolError::EncodeJson)?;
            framed
                .send(line)
                .await
                .map_err(|e| WorkerPoolError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
        }
    }
}

/// Reads the next frame, or `Ok(None)` on a clean EOF (the worker exited).
pub async fn recv_message<R>(
    reader: &mut FramedReader<R>,
) -> Result<Option<WireMessage>, WorkerPoolError>
where
    R: AsyncRead + Unpin,
{
    match reader {
        FramedReader::Canonical(framed) => match framed.next().await {
            Some(Ok(bytes)) => Ok(Some(decode_bincode(&bytes)?)),
            Some(Err(e)) => Err(WorkerPoolError::Io(e)),
            None => Ok(None),
        },
        FramedReader::NewlineJson(framed) => match framed.next().await {
            Some(Ok(line)) => Ok(Some(decode_json(&line)?)),
            Some(Err(e)) => Err(WorkerPoolError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e,
            ))),
            None => Ok(None),
        },
    }
}

fn decode_bincode(bytes: &BytesMut) -> Result<WireMessage, WorkerPoolError> {
    bincode::deserialize(bytes).map_err(WorkerPoolError::Decode)
}

fn decode_json(line: &str) -> Result<WireMessage, WorkerPoolError> {
    serde_json::from_str(line).map_err(WorkerPoolError::DecodeJson)
}
