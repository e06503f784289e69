/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! C6 (event half): a per-invocation scoped sink, buffered and only flushed
//! to the global sink if the invocation's result ends up mattering. Replaces
//! the teacher's ambient, per-thread event emission with an explicit handle
//! passed into `compute` (§9 design note: "scoped event capture").

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::key::KeyId;

/// An event produced by a function invocation. Kept deliberately opaque and
/// generic: the engine never interprets event contents, only decides whether
/// they are kept.
pub trait Event: Debug + Send + Sync + 'static {}
impl<T: Debug + Send + Sync + 'static> Event for T {}

/// Where flushed events ultimately land. Implemented by the collaborator
/// (the real repository wires this to its build-wide event bus).
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, key: KeyId, event: Arc<dyn Event>);
}

/// A sink that drops everything. The default when no collaborator sink is
/// configured.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _key: KeyId, _event: Arc<dyn Event>) {}
}

/// The per-invocation handle returned by `Environment::listener()`. Events
/// pushed here are buffered in-memory and only reach the global sink when
/// [`ScopedEventSink::flush`] is called by the evaluator at the moment it
/// decides this invocation's result is kept (completed successfully, or
/// `keep_going` surfaced its error). Invocations discarded by a restart are
/// simply dropped, carrying their buffered events with them.
pub struct ScopedEventSink {
    key: KeyId,
    buffer: Mutex<Vec<Arc<dyn Event>>>,
}

impl ScopedEventSink {
    pub(crate) fn new(key: KeyId) -> Self {
        Self {
            key,
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, event: impl Event) {
        self.buffer.lock().push(Arc::new(event));
    }

    /// Replays every buffered event to `sink`, in emission order, and clears
    /// the buffer. Idempotent: calling it twice without an intervening
    /// `push` is a no-op on the second call.
    pub(crate) fn flush(&self, sink: &dyn EventSink) {
        let events = std::mem::take(&mut *self.buffer.lock());
        for event in events {
            sink.emit(self.key, event);
        }
    }

    pub(crate) fn discard(&self) {
        self.buffer.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex as PMutex;

    use super::*;

    #[derive(Debug)]
    struct Recorded(u32);

    struct VecSink(PMutex<Vec<(KeyId, String)>>);

    impl EventSink for VecSink {
        fn emit(&self, key: KeyId, event: Arc<dyn Event>) {
            self.0.lock().push((key, format!("{:?}", event)));
        }
    }

    #[test]
    fn flush_replays_in_order_then_clears() {
        let key = KeyId { index: 0 };
        let sink_handle = ScopedEventSink::new(key);
        sink_handle.push(Recorded(1));
        sink_handle.push(Recorded(2));

        let global = VecSink(PMutex::new(Vec::new()));
        sink_handle.flush(&global);
        assert_eq!(
            global.0.lock().as_slice(),
            &[
                (key, "Recorded(1)".to_owned()),
                (key, "Recorded(2)".to_owned())
            ]
        );

        // second flush with nothing pushed in between is a no-op
        sink_handle.flush(&global);
        assert_eq!(global.0.lock().len(), 2);
    }

    #[test]
    fn discard_drops_buffered_events() {
        let key = KeyId { index: 0 };
        let sink_handle = ScopedEventSink::new(key);
        sink_handle.push(Recorded(1));
        sink_handle.discard();

        let global = VecSink(PMutex::new(Vec::new()));
        sink_handle.flush(&global);
        assert!(global.0.lock().is_empty());
    }
}
