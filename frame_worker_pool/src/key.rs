/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The identity a worker process pools under (§4.7): two actions that want
//! the same program, same arguments, same environment, same isolation, and
//! the same wire protocol can share a warm worker; anything else gets its
//! own.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::sandbox::SandboxedSpec;

/// Whether a worker answers one in-flight request at a time or may be asked
/// to interleave several concurrently. Dynamic execution (racing two
/// strategies for the same action) must never land on a `Multiplex` key even
/// when multiplexing is otherwise preferred for that family, since a
/// cancelled race loser sharing a worker with the winner could corrupt the
/// winner's in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVariant {
    Singleplex,
    Multiplex,
}

/// The wire encoding a worker's frames are serialized with. Orthogonal to
/// [`ProtocolVariant`]: this picks how a frame's payload is turned into
/// bytes, not how many requests may be outstanding at once. Two workers that
/// otherwise match never share a pool slot across encodings, since a worker
/// process speaks exactly one encoding for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireEncoding {
    /// Canonical-encoded request/response records (`bincode` over
    /// length-delimited frames).
    Canonical,
    /// Newline-delimited JSON with the same schema.
    NewlineJson,
}

/// The identity from §4.7: `(family tag, argv, env, sandbox flags, protocol
/// variant)`, with the wire encoding folded in alongside `protocol` since
/// it's equally part of what makes two workers interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    pub family_tag: Arc<str>,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub sandbox: SandboxedSpec,
    pub protocol: ProtocolVariant,
    pub encoding: WireEncoding,
}

impl WorkerKey {
    pub fn is_multiplex(&self) -> bool {
        self.protocol == ProtocolVariant::Multiplex
    }
}

/// Everything needed to actually spawn a worker for a [`WorkerKey`], plus
/// the bits that don't participate in pooling identity (the program path and
/// whether the program supports cooperative cancellation).
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub family_tag: Arc<str>,
    pub program: PathBuf,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub sandbox: SandboxedSpec,
    pub protocol: ProtocolVariant,
    pub encoding: WireEncoding,
    /// Declared by the worker program's author, not negotiated at runtime:
    /// if `false`, interrupting an in-flight request always destroys the
    /// worker rather than sending a `cancel` frame.
    pub supports_cancellation: bool,
}

impl WorkerSpec {
    pub fn key(&self) -> WorkerKey {
        WorkerKey {
            family_tag: self.family_tag.clone(),
            argv: self.argv.clone(),
            env: self.env.clone(),
            sandbox: self.sandbox.clone(),
            protocol: self.protocol,
            encoding: self.encoding,
        }
    }

    /// A copy of this spec forced onto a `Singleplex` key. Dynamic execution
    /// (racing two strategies for the same action) must call this before
    /// acquiring a worker, even for a family that otherwise prefers
    /// multiplexing: a race loser's cancellation must never be able to
    /// disturb a request in flight on a worker shared with the race winner.
    pub fn non_multiplex(&self) -> Self {
        Self {
            protocol: ProtocolVariant::Singleplex,
            ..self.clone()
        }
    }
}
