//! Test: Dependencies - ordering and failure propagation across jobs

use crate::helpers::*;
use cirun::core::{PipelineStatus, SkipReason};

const CHAIN: &str = r#"
name: chain
jobs:
  - name: unittest
    matrix:
      py: ["3.7", "3.8", "3.9"]
    steps:
      - name: test
        run: pytest --py ${{ matrix.py }}
  - name: package
    needs: [unittest]
    steps:
      - name: build
        run: ./build.sh
  - name: publish
    needs: [package]
    steps:
      - name: upload
        run: ./upload.sh
  - name: docs
    steps:
      - name: sphinx
        run: make docs
"#;

/// A dependent starts only after every instance of its dependency
#[tokio::test]
async fn test_dependent_waits_for_all_instances() {
    let harness = Harness::new(MockRunner::new());
    let outcome = harness.run(CHAIN).await;

    assert!(outcome.is_success());
    let commands = harness.runner.commands();
    let build = commands.iter().position(|c| c == "./build.sh").unwrap();
    let upload = commands.iter().position(|c| c == "./upload.sh").unwrap();
    let last_test = commands.iter().rposition(|c| c.starts_with("pytest")).unwrap();
    assert!(last_test < build);
    assert!(build < upload);
}

/// One failed required instance skips the whole downstream chain
#[tokio::test]
async fn test_failure_skips_dependents_transitively() {
    let harness = Harness::new(MockRunner::new().fail_on("--py 3.8", 1));
    let outcome = harness.run(CHAIN).await;

    assert_eq!(outcome.status, PipelineStatus::Failed);
    assert_eq!(outcome.exit_code(), 1);

    assert_succeeded(instance(&outcome, "unittest", &[("py", "3.7")]));
    assert_failed(instance(&outcome, "unittest", &[("py", "3.8")]));
    assert_succeeded(instance(&outcome, "unittest", &[("py", "3.9")]));
    assert_skipped(
        instance(&outcome, "package", &[]),
        SkipReason::DependencyFailed("unittest".to_string()),
    );
    assert_skipped(
        instance(&outcome, "publish", &[]),
        SkipReason::DependencyFailed("package".to_string()),
    );

    // Unrelated jobs still run
    assert_succeeded(instance(&outcome, "docs", &[]));
    assert_eq!(harness.runner.count("./build.sh"), 0);
    assert_eq!(harness.runner.count("./upload.sh"), 0);
}

/// Failed instances of a continue_on_error job block nothing by default
#[tokio::test]
async fn test_optional_failure_does_not_block() {
    let yaml = r#"
name: optional
jobs:
  - name: lint
    continue_on_error: true
    steps:
      - run: flake8
  - name: test
    needs: [lint]
    steps:
      - run: pytest
"#;
    let harness = Harness::new(MockRunner::new().fail_on("flake8", 1));
    let outcome = harness.run(yaml).await;

    assert_failed(instance(&outcome, "lint", &[]));
    assert_succeeded(instance(&outcome, "test", &[]));
    assert!(outcome.is_success());
    assert!(!outcome.summary("lint").unwrap().required);
}

/// The strict policy is blocked by optional failures too
#[tokio::test]
async fn test_strict_policy_blocks_on_optional_failure() {
    let yaml = r#"
name: strict
jobs:
  - name: lint
    continue_on_error: true
    steps:
      - run: flake8
  - name: test
    needs:
      - job: lint
        policy: strict
    steps:
      - run: pytest
"#;
    let harness = Harness::new(MockRunner::new().fail_on("flake8", 1));
    let outcome = harness.run(yaml).await;

    assert_skipped(
        instance(&outcome, "test", &[]),
        SkipReason::DependencyFailed("lint".to_string()),
    );
    // Only optional work failed and the skip came from it
    assert!(outcome.is_success());
}

/// The always policy runs the dependent whatever happened upstream
#[tokio::test]
async fn test_always_policy_runs_after_failure() {
    let yaml = r#"
name: report
jobs:
  - name: unittest
    matrix:
      py: ["3.7", "3.8"]
    steps:
      - run: pytest
  - name: notify
    needs:
      - job: unittest
        policy: always
    steps:
      - run: ./notify.sh
"#;
    let harness = Harness::new(MockRunner::new().fail_on("pytest", 2));
    let outcome = harness.run(yaml).await;

    assert_succeeded(instance(&outcome, "notify", &[]));
    assert_eq!(harness.runner.count("./notify.sh"), 1);
    assert_eq!(outcome.status, PipelineStatus::Failed);
}

/// A job skipped by its condition does not block its dependents
#[tokio::test]
async fn test_condition_skip_does_not_block() {
    let yaml = r#"
name: conditional
jobs:
  - name: unittest
    matrix:
      py: ["3.6", "3.7"]
    if: matrix.py != '3.6'
    steps:
      - run: pytest
  - name: package
    needs: [unittest]
    steps:
      - run: ./build.sh
"#;
    let harness = Harness::new(MockRunner::new());
    let outcome = harness.run(yaml).await;

    assert_skipped(
        instance(&outcome, "unittest", &[("py", "3.6")]),
        SkipReason::Condition,
    );
    assert_succeeded(instance(&outcome, "unittest", &[("py", "3.7")]));
    assert_succeeded(instance(&outcome, "package", &[]));
    assert!(outcome.is_success());
}
