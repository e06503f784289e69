/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! A small arithmetic dependency graph, to show the shape of a `frame`
//! collaborator: two leaf families (`Literal`) feeding a derived family
//! (`Product`) feeding a root (`Total`). Re-running after `changed_to`
//! shows only the nodes downstream of the changed leaf get recomputed.

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

#[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
#[display(fmt = "Literal({})", _0)]
struct Literal(u64);

#[derive(Allocative, Debug, PartialEq)]
struct LiteralValue(u64);

#[async_trait]
impl Key for Literal {
    type Value = LiteralValue;

    async fn compute(&self, _env: &Environment) -> Outcome<Self::Value> {
        Outcome::value(LiteralValue(self.0))
    }
}

#[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
#[display(fmt = "Product({}, {})", _0, _1)]
struct Product(KeyId, KeyId);

#[derive(Allocative, Debug, PartialEq)]
struct ProductValue(u64);

#[async_trait]
impl Key for Product {
    type Value = ProductValue;

    async fn compute(&self, env: &Environment) -> Outcome<Self::Value> {
        let outcomes = env.get_many(&[self.0, self.1]);
        let (GetOutcome::Ready(a), GetOutcome::Ready(b)) = (&outcomes[0], &outcomes[1]) else {
            return Outcome::Pending;
        };
        let a = a.as_any().downcast_ref::<LiteralValue>().unwrap().0;
        let b = b.as_any().downcast_ref::<LiteralValue>().unwrap().0;
        Outcome::value(ProductValue(a * b))
    }
}

#[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
#[display(fmt = "Total({:?})", _0)]
struct Total(Vec<KeyId>);

#[derive(Allocative, Debug, PartialEq)]
struct TotalValue(u64);

#[async_trait]
impl Key for Total {
    type Value = TotalValue;

    async fn compute(&self, env: &Environment) -> Outcome<Self::Value> {
        let outcomes = env.get_many(&self.0);
        let mut sum = 0u64;
        for outcome in &outcomes {
            match outcome {
                GetOutcome::Ready(v) => sum += v.as_any().downcast_ref::<ProductValue>().unwrap().0,
                GetOutcome::Missing => return Outcome::Pending,
                GetOutcome::Failed(e) => return Outcome::error(e.clone()),
            }
        }
        Outcome::value(TotalValue(sum))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber_init();

    let frame = Frame::builder().build();

    let a = frame.key_of(Literal(3));
    let b = frame.key_of(Literal(4));
    let c = frame.key_of(Literal(5));
    let d = frame.key_of(Literal(6));

    let p1 = frame.key_of(Product(a, b));
    let p2 = frame.key_of(Product(c, d));
    let total = frame.key_of(Total(vec![p1, p2]));

    let result = frame.evaluate(&[total], EvaluationOptions::default()).await;
    print_total("initial", &result.roots[0].outcome);

    // Inject a new value for `a` directly, as the dirtiness layer would
    // after re-statting a changed file: `Product(a, b)` and `Total` are
    // dirtied, but `Product(c, d)` never recomputes.
    frame.changed_to(Literal(3), LiteralValue(10));

    let result = frame.evaluate(&[total], EvaluationOptions::default()).await;
    print_total("after changing `a` from 3 to 10", &result.roots[0].outcome);

    println!("total node count: {}", frame.node_count());
}

fn print_total(label: &str, outcome: &EvalOutcome) {
    match outcome {
        EvalOutcome::Value(v) => {
            println!("{label}: {}", v.as_any().downcast_ref::<TotalValue>().unwrap().0)
        }
        EvalOutcome::Error(e) => println!("{label}: error: {e}"),
    }
}

fn tracing_subscriber_init() {
    let _ = tracing_subscriber::fmt::try_init();
}
