//! Test: Fail-fast - a failing instance stops its unstarted siblings

use crate::helpers::*;
use cirun::core::{PipelineStatus, SkipReason};
use cirun::execution::EngineConfig;

const MATRIX: &str = r#"
name: fail-fast
jobs:
  - name: unittest
    fail_fast: FAIL_FAST
    matrix:
      py: ["3.6", "3.7", "3.8", "3.9"]
    steps:
      - run: pytest --py ${{ matrix.py }}
"#;

#[tokio::test]
async fn test_fail_fast_skips_unstarted_siblings() {
    let yaml = MATRIX.replace("FAIL_FAST", "true");
    let harness = Harness::new(MockRunner::new().fail_on("--py 3.6", 1));
    let outcome = harness
        .run_with(&yaml, EngineConfig::new().with_concurrency(1), push())
        .await;

    assert_eq!(outcome.status, PipelineStatus::Failed);
    assert_failed(instance(&outcome, "unittest", &[("py", "3.6")]));
    for py in ["3.7", "3.8", "3.9"] {
        assert_skipped(
            instance(&outcome, "unittest", &[("py", py)]),
            SkipReason::FailFast,
        );
    }
    assert_eq!(harness.runner.count("pytest"), 1);
}

#[tokio::test]
async fn test_without_fail_fast_siblings_run() {
    let yaml = MATRIX.replace("FAIL_FAST", "false");
    let harness = Harness::new(MockRunner::new().fail_on("--py 3.6", 1));
    let outcome = harness
        .run_with(&yaml, EngineConfig::new().with_concurrency(1), push())
        .await;

    assert_eq!(outcome.status, PipelineStatus::Failed);
    for py in ["3.7", "3.8", "3.9"] {
        assert_succeeded(instance(&outcome, "unittest", &[("py", py)]));
    }
    assert_eq!(harness.runner.count("pytest"), 4);
}
