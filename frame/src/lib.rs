/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! A generic, incremental, demand-driven evaluation engine.
//!
//! A collaborator defines a unit of memoized computation by implementing
//! [`Key`] once per kind of computation (a "function family"), then
//! interns concrete instances of it into [`KeyId`]s via [`Frame::key_of`].
//! Evaluating a set of root keys runs exactly the functions whose inputs
//! changed since the last version, reusing everything else.
//!
//! ```no_run
//! use allocative::Allocative;
//! use async_trait::async_trait;
//! use derive_more::Display;
//! use frame::{EvaluationOptions, Frame, Key, Outcome};
//!
//! #[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
//! #[display(fmt = "Answer")]
//! struct Answer;
//!
//! #[derive(Allocative, Debug, PartialEq)]
//! struct AnswerValue(u32);
//!
//! #[async_trait]
//! impl Key for Answer {
//!     type Value = AnswerValue;
//!
//!     async fn compute(&self, _env: &frame::Environment) -> Outcome<Self::Value> {
//!         Outcome::value(AnswerValue(42))
//!     }
//! }
//!
//! # async fn run() {
//! let frame = Frame::builder().build();
//! let key = frame.key_of(Answer);
//! let result = frame.evaluate(&[key], EvaluationOptions::default()).await;
//! # let _ = result;
//! # }
//! ```

pub mod cycles;
pub mod data;
pub mod deps;
pub mod environment;
pub mod error;
pub mod engine;
pub mod evaluator;
pub mod events;
mod function;
pub mod key;
pub mod node;
pub mod version;

pub use engine::Frame;
pub use engine::FrameBuilder;
pub use engine::Key;
pub use environment::Environment;
pub use environment::GetOutcome;
pub use environment::Outcome;
pub use error::FrameError;
pub use error::FrameErrorKind;
pub use error::FrameResult;
pub use evaluator::EvalOutcome;
pub use evaluator::EvaluationOptions;
pub use evaluator::EvaluationResult;
pub use evaluator::RootResult;
pub use events::Event;
pub use events::EventSink;
pub use events::NullEventSink;
pub use key::DynValue;
pub use key::ErrorPolicy;
pub use key::FamilyId;
pub use key::FunctionClass;
pub use key::KeyId;
pub use key::KeyPayload;
pub use key::Value;
pub use node::NodeOutcome;
pub use node::NodeState;
pub use node::NodeStore;
pub use version::VersionNumber;
