//! Scenario-based tests for cirun, run against mock collaborators

mod helpers;

mod cancellation;
mod containers;
mod dependencies;
mod events;
mod fail_fast;
mod matrix_fanout;
mod step_policies;
