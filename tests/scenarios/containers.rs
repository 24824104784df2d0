//! Test: Containers - image builds, container runs and container jobs

use crate::helpers::*;
use cirun::core::{FailureKind, InstanceState, StepStatus};
use cirun::execution::{EngineConfig, ExecutionEvent};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const HANGING_CONTAINER: &str = r#"
name: hanging
jobs:
  - name: integration
    steps:
      - name: serve
        uses: run-container
        with:
          image: server:latest
        timeout_secs: 1
"#;

/// Records removals and finished instances in one ordered log
fn timeline_harness() -> (Harness, Arc<Mutex<Vec<String>>>) {
    let timeline = Arc::new(Mutex::new(Vec::new()));
    let containers = MockContainers::new()
        .with_run_delay(Duration::from_secs(30))
        .with_timeline(Arc::clone(&timeline));
    (Harness::with_containers(MockRunner::new(), containers), timeline)
}

fn record_finished(engine: &mut cirun::ExecutionEngine, timeline: &Arc<Mutex<Vec<String>>>) {
    let timeline = Arc::clone(timeline);
    engine.add_event_handler(move |event| {
        if let ExecutionEvent::InstanceFinished { label, .. } = event {
            timeline.lock().unwrap().push(format!("finished {}", label));
        }
    });
}

const IMAGES: &str = r#"
name: images
jobs:
  - name: modules
    matrix:
      system: [lmod, tmod4]
    steps:
      - name: build
        uses: build-container
        with:
          file: ci-scripts/${{ matrix.system }}.dockerfile
          build_args:
            REFRAME_REPO: reframe
      - name: run
        uses: run-container
        with:
          args: ./test_reframe.py --system ${{ matrix.system }}
"#;

/// run-container without an image uses the instance's own build
#[tokio::test]
async fn test_run_uses_image_built_by_instance() {
    let harness = Harness::new(MockRunner::new());
    let outcome = harness.run(IMAGES).await;
    assert!(outcome.is_success());

    let builds = harness.containers.builds();
    assert_eq!(builds.len(), 2);
    let runs = harness.containers.runs();
    assert_eq!(runs.len(), 2);

    for system in ["lmod", "tmod4"] {
        let build = builds
            .iter()
            .find(|b| b.file.ends_with(Path::new(&format!("ci-scripts/{}.dockerfile", system))))
            .expect("build for system");
        assert_eq!(build.build_args.get("REFRAME_REPO").map(String::as_str), Some("reframe"));

        let run = runs
            .iter()
            .find(|r| r.args.last().map(String::as_str) == Some(system))
            .expect("run for system");
        assert_eq!(run.image, build.tag);
        assert_eq!(run.args, vec!["./test_reframe.py", "--system", system]);
        assert!(run.workspace.is_some());
        assert!(run.name.starts_with("cirun-"));
        assert_eq!(run.env.get("CI_WORKSPACE").map(String::as_str), Some("/workspace"));
        assert!(!run.env.contains_key("PATH"));
        assert_eq!(run.env.get("MATRIX_SYSTEM").map(String::as_str), Some(system));
    }

    assert_ne!(runs[0].name, runs[1].name);
    assert_ne!(builds[0].tag, builds[1].tag);
    assert!(harness.runner.commands().is_empty());
}

/// Jobs on a container target run their commands inside the image
#[tokio::test]
async fn test_container_job_runs_commands_in_image() {
    let yaml = r#"
name: in-container
jobs:
  - name: unittest
    container: python:3.8
    steps:
      - name: python
        uses: set-up-tool
        with:
          tool: python
          version: "3.8"
      - name: test
        run: ./test_reframe.py
"#;
    let harness = Harness::new(MockRunner::new());
    let outcome = harness.run(yaml).await;
    assert!(outcome.is_success());

    let runs = harness.containers.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].image, "python:3.8");
    assert_eq!(runs[0].args, vec!["sh", "-c", "./test_reframe.py"]);
    assert_eq!(runs[0].env.get("PYTHON_VERSION").map(String::as_str), Some("3.8"));
    assert!(harness.runner.commands().is_empty());
}

/// A failing container fails its step
#[tokio::test]
async fn test_failing_container_fails_step() {
    let yaml = r#"
name: broken
jobs:
  - name: smoke
    steps:
      - name: run
        uses: run-container
        with:
          image: broken:latest
"#;
    let harness = Harness::with_containers(
        MockRunner::new(),
        MockContainers::new().fail_image("broken:latest"),
    );
    let outcome = harness.run(yaml).await;

    let smoke = instance(&outcome, "smoke", &[]);
    assert_failed(smoke);
    assert_step(smoke, "run", StepStatus::Failed);
    assert!(!outcome.is_success());
}

/// A timed-out container is removed before its instance is reported
#[tokio::test]
async fn test_timed_out_container_removed_before_instance_finishes() {
    let (harness, timeline) = timeline_harness();
    let mut engine = harness.engine(EngineConfig::new());
    record_finished(&mut engine, &timeline);

    let definition = cirun::core::load(HANGING_CONTAINER).unwrap();
    let outcome = engine.run_pipeline(&definition, &push()).await.unwrap();

    let integration = instance(&outcome, "integration", &[]);
    assert_eq!(
        integration.status,
        InstanceState::Failed {
            kind: FailureKind::Timeout
        }
    );
    assert_step(integration, "serve", StepStatus::TimedOut);

    let removed = harness.containers.removed();
    assert_eq!(removed.len(), 1);
    let log = timeline.lock().unwrap().clone();
    assert_eq!(
        log,
        vec![format!("removed {}", removed[0]), "finished integration".to_string()]
    );
}

/// A cancelled container is removed before its instance is reported
#[tokio::test]
async fn test_cancelled_container_removed_before_instance_finishes() {
    let (harness, timeline) = timeline_harness();
    let mut engine = harness.engine(EngineConfig::new());
    record_finished(&mut engine, &timeline);

    let token = engine.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    let yaml = HANGING_CONTAINER.replace("timeout_secs: 1", "timeout_secs: 60");
    let definition = cirun::core::load(&yaml).unwrap();
    let outcome = engine.run_pipeline(&definition, &push()).await.unwrap();

    assert!(outcome.cancelled);
    let integration = instance(&outcome, "integration", &[]);
    assert_eq!(
        integration.status,
        InstanceState::Failed {
            kind: FailureKind::Cancelled
        }
    );
    assert_step(integration, "serve", StepStatus::Cancelled);

    let removed = harness.containers.removed();
    assert_eq!(removed.len(), 1);
    let log = timeline.lock().unwrap().clone();
    assert_eq!(
        log,
        vec![format!("removed {}", removed[0]), "finished integration".to_string()]
    );
}
