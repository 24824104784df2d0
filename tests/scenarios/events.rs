//! Test: Events - what handlers observe during a run

use crate::helpers::*;
use cirun::execution::ExecutionEvent;

const PIPELINE: &str = r#"
name: observed
jobs:
  - name: unittest
    matrix:
      py: ["3.7", "3.8"]
    steps:
      - run: pytest
      - run: coverage report
  - name: package
    needs: [unittest]
    steps:
      - run: ./build.sh
"#;

#[tokio::test]
async fn test_event_sequence() {
    let harness = Harness::new(MockRunner::new());
    let outcome = harness.run(PIPELINE).await;
    let events = harness.events();

    match events.first() {
        Some(ExecutionEvent::PipelineStarted {
            pipeline_name,
            total_instances,
            execution_id,
        }) => {
            assert_eq!(pipeline_name, "observed");
            assert_eq!(*total_instances, 3);
            assert_eq!(*execution_id, outcome.execution_id);
        }
        other => panic!("expected PipelineStarted first, got {:?}", other),
    }
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::PipelineFinished { cancelled: false, .. })
    ));

    let finished: Vec<&String> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::InstanceFinished { label, .. } => Some(label),
            _ => None,
        })
        .collect();
    assert_eq!(finished.len(), 3);

    let step_finished = events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::StepFinished { .. }))
        .count();
    assert_eq!(step_finished, 5);

    // package is admitted last, after both unittest instances
    assert_eq!(harness.started_order().last().map(String::as_str), Some("package"));
}

/// Skipped instances are reported without ever starting
#[tokio::test]
async fn test_skipped_instances_emit_finished_only() {
    let harness = Harness::new(MockRunner::new().fail_on("pytest", 1));
    harness.run(PIPELINE).await;

    assert!(!harness.started_order().contains(&"package".to_string()));
    let package_finished = harness.events().iter().any(|e| {
        matches!(e, ExecutionEvent::InstanceFinished { label, .. } if label == "package")
    });
    assert!(package_finished);
}
