/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! A toy "build": one `FileContents` node per source file, a `LineCount`
//! node derived from it, and a `TotalLines` root summing every file. Wires
//! up `frame_dirtiness::DirtinessLayer` over a [`ManualDiffSource`] to show
//! the whole C5 loop a real caller drives before each build: report what
//! changed, run the layer once, then re-evaluate and watch only the
//! affected nodes recompute.

use std::path::PathBuf;
use std::sync::Arc;

use allocative::Allocative;
use async_trait::async_trait;
use derive_more::Display;
use frame::Environment;
use frame::EvalOutcome;
use frame::EvaluationOptions;
use frame::Frame;
use frame::GetOutcome;
use frame::Key;
use frame::KeyId;
use frame::Outcome;
use frame_dirtiness::ChangeKind;
use frame_dirtiness::DiffSource;
use frame_dirtiness::DirtinessLayer;
use frame_dirtiness::FileClassifier;
use frame_dirtiness::FileStateKey;
use frame_dirtiness::ManualDiffSource;
use frame_dirtiness::PrefixClassifier;
use frame_futures::WorkerPools;
use frame_futures::WorkerPoolsConfig;

/// Depends on a [`FileStateKey`] (identified by `KeyId`, assembled by the
/// caller before the graph is built) so that a `DirtinessLayer`-driven
/// `changed_to` on that node dirties this one in turn — the same
/// "parameterize the key by its dependencies' `KeyId`s, not by raw paths"
/// pattern the engine's own `Product`/`Total` tests use.
#[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
#[display(fmt = "LineCount({})", _0)]
struct LineCount(PathBuf, KeyId);

#[derive(Allocative, Debug, PartialEq)]
struct LineCountValue(usize);

#[async_trait]
impl Key for LineCount {
    type Value = LineCountValue;

    async fn compute(&self, env: &Environment) -> Outcome<Self::Value> {
        match env.get(self.1) {
            GetOutcome::Ready(_) => {}
            GetOutcome::Missing => return Outcome::Pending,
            GetOutcome::Failed(e) => return Outcome::error(e),
        }
        let contents = std::fs::read_to_string(&self.0).unwrap_or_default();
        Outcome::value(LineCountValue(contents.lines().count()))
    }
}

#[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
#[display(fmt = "TotalLines({:?})", _0)]
struct TotalLines(Vec<KeyId>);

#[derive(Allocative, Debug, PartialEq)]
struct TotalLinesValue(usize);

#[async_trait]
impl Key for TotalLines {
    type Value = TotalLinesValue;

    async fn compute(&self, env: &Environment) -> Outcome<Self::Value> {
        let outcomes = env.get_many(&self.0);

        let mut total = 0usize;
        for outcome in &outcomes {
            match outcome {
                GetOutcome::Ready(v) => total += v.as_any().downcast_ref::<LineCountValue>().unwrap().0,
                GetOutcome::Missing => return Outcome::Pending,
                GetOutcome::Failed(e) => return Outcome::error(e.clone()),
            }
        }
        Outcome::value(TotalLinesValue(total))
    }
}

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempfile::tempdir().expect("create scratch workspace");
    let file_a = dir.path().join("a.txt");
    let file_b = dir.path().join("b.txt");
    std::fs::write(&file_a, "one\ntwo\nthree\n").unwrap();
    std::fs::write(&file_b, "one\ntwo\n").unwrap();

    let frame = Frame::builder().build();

    let state_a = frame.key_of(FileStateKey::new(file_a.clone()));
    let state_b = frame.key_of(FileStateKey::new(file_b.clone()));
    let line_count_a = frame.key_of(LineCount(file_a.clone(), state_a));
    let line_count_b = frame.key_of(LineCount(file_b.clone(), state_b));
    let root = frame.key_of(TotalLines(vec![line_count_a, line_count_b]));

    let source = Arc::new(ManualDiffSource::new(true));
    let classifier: Arc<dyn FileClassifier> = Arc::new(PrefixClassifier::new(vec![dir.path().to_path_buf()]));
    let pools = Arc::new(
        WorkerPools::new(WorkerPoolsConfig {
            regular_threads: 2,
            cpu_heavy_threads: 1,
            execution_threads: None,
        })
        .expect("spawn worker pools"),
    );
    let dirtiness = DirtinessLayer::new(frame.clone(), source.clone() as Arc<dyn DiffSource>, classifier, pools);

    dirtiness.run_once().await;
    let result = frame.evaluate(&[root], EvaluationOptions::default()).await;
    print_total("initial", &result.roots[0].outcome);

    // Simulate an editor appending a line to `a.txt`.
    std::fs::write(&file_a, "one\ntwo\nthree\nfour\n").unwrap();
    source.report(file_a.clone(), ChangeKind::Contents);

    dirtiness.run_once().await;
    let result = frame.evaluate(&[root], EvaluationOptions::default()).await;
    print_total("after appending a line to a.txt", &result.roots[0].outcome);

    println!("total node count: {}", frame.node_count());
}

fn print_total(label: &str, outcome: &EvalOutcome) {
    match outcome {
        EvalOutcome::Value(v) => {
            println!("{label}: {} lines", v.as_any().downcast_ref::<TotalLinesValue>().unwrap().0)
        }
        EvalOutcome::Error(e) => println!("{label}: error: {e}"),
    }
}
