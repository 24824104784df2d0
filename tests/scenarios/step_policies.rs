//! Test: Step Policies - always, continue_on_error, conditions and timeouts

use crate::helpers::*;
use cirun::core::{FailureKind, InstanceState, StepStatus};
use std::time::Duration;

/// After a failure only always steps run
#[tokio::test]
async fn test_always_step_runs_after_failure() {
    let yaml = r#"
name: cleanup
jobs:
  - name: build
    steps:
      - name: login
        run: docker login
      - name: compile
        run: make
      - name: test
        run: make test
      - name: logout
        run: docker logout
        always: true
"#;
    let harness = Harness::new(MockRunner::new().fail_on("make", 2));
    let outcome = harness.run(yaml).await;

    let build = instance(&outcome, "build", &[]);
    assert_eq!(
        build.status,
        InstanceState::Failed {
            kind: FailureKind::StepExecution
        }
    );
    assert_step(build, "login", StepStatus::Succeeded);
    assert_step(build, "compile", StepStatus::Failed);
    assert_step(build, "test", StepStatus::Skipped);
    assert_step(build, "logout", StepStatus::Succeeded);

    assert_eq!(build.first_failed_step().unwrap().name, "compile");
    assert_eq!(build.step("compile").unwrap().exit_code, Some(2));
    assert_eq!(
        harness.runner.commands(),
        vec!["docker login", "make", "docker logout"]
    );
}

/// Steps run strictly in declared order
#[tokio::test]
async fn test_steps_run_in_order() {
    let yaml = r#"
name: ordered
jobs:
  - name: job
    steps:
      - run: one
      - run: two
      - run: three
"#;
    let harness = Harness::new(MockRunner::new().delay_on("one", Duration::from_millis(30)));
    harness.run(yaml).await;

    assert_eq!(harness.runner.commands(), vec!["one", "two", "three"]);
}

/// A continue_on_error step records its failure and the instance goes on
#[tokio::test]
async fn test_continue_on_error_step() {
    let yaml = r#"
name: lenient
jobs:
  - name: job
    steps:
      - name: flaky
        run: ./flaky.sh
        continue_on_error: true
      - name: main
        run: ./main.sh
"#;
    let harness = Harness::new(MockRunner::new().fail_on("flaky", 1));
    let outcome = harness.run(yaml).await;

    let job = instance(&outcome, "job", &[]);
    assert_succeeded(job);
    assert_step(job, "flaky", StepStatus::Failed);
    assert_step(job, "main", StepStatus::Succeeded);
}

/// Step conditions are evaluated per instance
#[tokio::test]
async fn test_step_condition_per_instance() {
    let yaml = r#"
name: conditional-steps
jobs:
  - name: modules
    matrix:
      system: [lmod, lmod77, tmod4]
    steps:
      - name: unittests
        run: ./test.sh ${{ matrix.system }}
        if: matrix.system != 'lmod77' && matrix.system != 'tmod4'
      - name: lint
        run: ./lint.sh
"#;
    let harness = Harness::new(MockRunner::new());
    let outcome = harness.run(yaml).await;

    assert!(outcome.is_success());
    assert_step(
        instance(&outcome, "modules", &[("system", "lmod")]),
        "unittests",
        StepStatus::Succeeded,
    );
    for system in ["lmod77", "tmod4"] {
        let result = instance(&outcome, "modules", &[("system", system)]);
        assert_succeeded(result);
        assert_step(result, "unittests", StepStatus::Skipped);
        assert_step(result, "lint", StepStatus::Succeeded);
    }
    assert_eq!(harness.runner.commands().iter().filter(|c| c.starts_with("./test.sh")).count(), 1);
}

/// A step exceeding its timeout fails the instance with a timeout
#[tokio::test]
async fn test_step_timeout() {
    let yaml = r#"
name: slow
jobs:
  - name: job
    steps:
      - name: hang
        run: ./hang.sh
        timeout_secs: 1
      - name: never
        run: ./never.sh
"#;
    let harness = Harness::new(MockRunner::new().delay_on("hang", Duration::from_secs(30)));
    let outcome = harness.run(yaml).await;

    let job = instance(&outcome, "job", &[]);
    assert_eq!(
        job.status,
        InstanceState::Failed {
            kind: FailureKind::Timeout
        }
    );
    assert_step(job, "hang", StepStatus::TimedOut);
    assert_step(job, "never", StepStatus::Skipped);
    assert!(outcome.duration() < chrono::Duration::seconds(10));
}

/// Step env overrides job env, which overrides pipeline env
#[tokio::test]
async fn test_env_layering() {
    let yaml = r#"
name: env
env:
  LEVEL: pipeline
  PIPELINE_ONLY: "1"
jobs:
  - name: job
    env:
      LEVEL: job
    steps:
      - name: plain
        run: env
      - name: override
        run: env --step
        env:
          LEVEL: step
"#;
    let harness = Harness::new(MockRunner::new());
    harness.run(yaml).await;

    let calls = harness.runner.calls();
    assert_eq!(calls[0].env.get("LEVEL").map(String::as_str), Some("job"));
    assert_eq!(calls[0].env.get("PIPELINE_ONLY").map(String::as_str), Some("1"));
    assert_eq!(calls[1].env.get("LEVEL").map(String::as_str), Some("step"));
}
