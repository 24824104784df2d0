//! Test: Matrix Fan-out - expansion, ordering and the worker pool bound

use crate::helpers::*;
use cirun::execution::EngineConfig;
use std::time::Duration;

const FANOUT: &str = r#"
name: fanout
jobs:
  - name: unittest
    matrix:
      os: [linux, macos, windows]
      py: ["3.7", "3.8"]
    steps:
      - name: test
        run: pytest --py ${{ matrix.py }} --os ${{ matrix.os }}
"#;

/// Six instances on a pool of two never run more than two at once
#[tokio::test]
async fn test_fanout_respects_concurrency() {
    let harness = Harness::new(MockRunner::new().with_delay(Duration::from_millis(50)));
    let outcome = harness
        .run_with(FANOUT, EngineConfig::new().with_concurrency(2), push())
        .await;

    assert!(outcome.is_success());
    assert_eq!(outcome.results.len(), 6);
    assert_eq!(harness.runner.peak_concurrency(), 2);
    assert_eq!(harness.runner.in_flight(), 0);

    for result in &outcome.results {
        assert_succeeded(result);
    }
}

/// Results come back in binding order whatever order they finished in
#[tokio::test]
async fn test_results_follow_binding_order() {
    let runner = MockRunner::new()
        .delay_on("--py 3.7 --os linux", Duration::from_millis(80))
        .delay_on("--os macos", Duration::from_millis(40));
    let harness = Harness::new(runner);
    let outcome = harness.run(FANOUT).await;

    let labels: Vec<&str> = outcome.results.iter().map(|r| r.label.as_str()).collect();
    assert_eq!(
        labels,
        vec![
            "unittest (os=linux, py=3.7)",
            "unittest (os=linux, py=3.8)",
            "unittest (os=macos, py=3.7)",
            "unittest (os=macos, py=3.8)",
            "unittest (os=windows, py=3.7)",
            "unittest (os=windows, py=3.8)",
        ]
    );
    let summary = outcome.summary("unittest").unwrap();
    assert_eq!((summary.total, summary.succeeded), (6, 6));
}

/// A pool of one serializes every instance
#[tokio::test]
async fn test_concurrency_one_serializes() {
    let harness = Harness::new(MockRunner::new().with_delay(Duration::from_millis(10)));
    let outcome = harness
        .run_with(FANOUT, EngineConfig::new().with_concurrency(1), push())
        .await;

    assert!(outcome.is_success());
    assert_eq!(harness.runner.peak_concurrency(), 1);
}

/// The document's concurrency applies when the caller sets none
#[tokio::test]
async fn test_document_concurrency() {
    let yaml = FANOUT.replace("name: fanout", "name: fanout\nconcurrency: 3");
    let harness = Harness::new(MockRunner::new().with_delay(Duration::from_millis(50)));
    harness.run(&yaml).await;

    assert_eq!(harness.runner.peak_concurrency(), 3);
}

/// Placeholders and MATRIX_* variables carry each instance's bindings
#[tokio::test]
async fn test_bindings_reach_commands_and_env() {
    let harness = Harness::new(MockRunner::new());
    harness.run(FANOUT).await;

    let calls = harness.runner.calls();
    assert_eq!(calls.len(), 6);

    let call = calls
        .iter()
        .find(|c| c.command == "pytest --py 3.8 --os windows")
        .expect("rendered command");
    assert_eq!(call.env.get("MATRIX_PY").map(String::as_str), Some("3.8"));
    assert_eq!(call.env.get("MATRIX_OS").map(String::as_str), Some("windows"));
    assert_eq!(call.env.get("CI").map(String::as_str), Some("true"));
    assert_eq!(call.env.get("CI_JOB").map(String::as_str), Some("unittest"));
}

/// Excluded combinations never become instances
#[tokio::test]
async fn test_exclusions() {
    let yaml = r#"
name: excluded
jobs:
  - name: unittest
    matrix:
      os: [linux, macos]
      py: ["3.6", "3.7", "3.8"]
      exclude:
        - py: "3.6"
        - os: macos
          py: "3.7"
    steps:
      - run: pytest
"#;
    let harness = Harness::new(MockRunner::new());
    let outcome = harness.run(yaml).await;

    let labels: Vec<&str> = outcome.results.iter().map(|r| r.label.as_str()).collect();
    assert_eq!(
        labels,
        vec![
            "unittest (os=linux, py=3.7)",
            "unittest (os=linux, py=3.8)",
            "unittest (os=macos, py=3.8)",
        ]
    );
    assert_eq!(harness.runner.count("pytest"), 3);
}

/// Each instance gets its own workspace
#[tokio::test]
async fn test_workspaces_are_isolated() {
    let harness = Harness::new(MockRunner::new());
    harness.run(FANOUT).await;

    let mut workdirs: Vec<_> = harness.runner.calls().into_iter().map(|c| c.workdir).collect();
    workdirs.sort();
    workdirs.dedup();
    assert_eq!(workdirs.len(), 6);
    for dir in workdirs {
        assert!(!dir.exists(), "{} should be removed", dir.display());
    }
}
