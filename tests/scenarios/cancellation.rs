//! Test: Cancellation - stopping a run mid-flight

use crate::helpers::*;
use cirun::core::{load, FailureKind, InstanceState, PipelineStatus, SkipReason, StepStatus};
use cirun::execution::EngineConfig;
use std::time::{Duration, Instant};

const LONG_RUN: &str = r#"
name: long
concurrency: 2
jobs:
  - name: unittest
    matrix:
      py: ["3.6", "3.7", "3.8", "3.9"]
    steps:
      - name: test
        run: pytest --py ${{ matrix.py }}
      - name: cleanup
        run: ./cleanup.sh
        always: true
  - name: deploy
    needs: [unittest]
    steps:
      - run: ./deploy.sh
"#;

/// Running instances are interrupted, waiting ones skipped, cleanup still runs
#[tokio::test]
async fn test_cancel_mid_run() {
    let harness = Harness::new(MockRunner::new().delay_on("pytest", Duration::from_secs(30)));
    let engine = harness.engine(EngineConfig::new());
    let definition = load(LONG_RUN).unwrap();

    let token = engine.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    let started = Instant::now();
    let outcome = engine.run_pipeline(&definition, &push()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    assert!(outcome.cancelled);
    assert_eq!(outcome.status, PipelineStatus::Failed);

    for py in ["3.6", "3.7"] {
        let running = instance(&outcome, "unittest", &[("py", py)]);
        assert_eq!(
            running.status,
            InstanceState::Failed {
                kind: FailureKind::Cancelled
            }
        );
        assert_step(running, "test", StepStatus::Cancelled);
        assert_step(running, "cleanup", StepStatus::Succeeded);
    }
    for py in ["3.8", "3.9"] {
        assert_skipped(
            instance(&outcome, "unittest", &[("py", py)]),
            SkipReason::Cancelled,
        );
    }
    assert_skipped(instance(&outcome, "deploy", &[]), SkipReason::Cancelled);

    assert_eq!(harness.runner.count("./cleanup.sh"), 2);
    assert_eq!(harness.runner.count("./deploy.sh"), 0);
    assert_eq!(harness.runner.in_flight(), 0);
}

/// A run cancelled before it starts executes nothing
#[tokio::test]
async fn test_cancel_before_start() {
    let harness = Harness::new(MockRunner::new());
    let engine = harness.engine(EngineConfig::new());
    engine.cancellation_token().cancel();

    let definition = load(LONG_RUN).unwrap();
    let outcome = engine.run_pipeline(&definition, &push()).await.unwrap();

    assert!(outcome.cancelled);
    assert_eq!(outcome.status, PipelineStatus::Failed);
    assert!(harness.runner.commands().is_empty());
    for result in &outcome.results {
        assert_skipped(result, SkipReason::Cancelled);
    }
}

/// Cancelling one run leaves the engine usable for the next
#[tokio::test]
async fn test_cancelled_run_does_not_poison_engine() {
    let harness = Harness::new(MockRunner::new().delay_on("pytest", Duration::from_secs(30)));
    let engine = harness.engine(EngineConfig::new());
    let definition = load(LONG_RUN).unwrap();

    let run_token = engine.cancellation_token().child_token();
    let trigger = run_token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });
    let first = engine
        .run_pipeline_with_token(&definition, &push(), run_token)
        .await
        .unwrap();
    assert!(first.cancelled);

    let quick = load(
        r#"
name: quick
jobs:
  - name: lint
    steps:
      - run: flake8
"#,
    )
    .unwrap();
    let second = engine.run_pipeline(&quick, &push()).await.unwrap();
    assert!(!second.cancelled);
    assert_eq!(second.status, PipelineStatus::Succeeded);
    assert_eq!(harness.runner.count("flake8"), 1);
}
