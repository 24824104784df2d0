//! Coordinator state: instance lifecycle, dependency gating and the ready queue
//!
//! Owned by a single task (the engine loop); every state transition goes
//! through the methods here.

use crate::core::{
    DependencyGraph, DependencyPolicy, InstanceState, JobInstance, SkipReason,
};
use chrono::Utc;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info};

struct Slot {
    template: usize,
    enabled: bool,
    state: InstanceState,
}

struct TemplateInfo {
    slots: Range<usize>,
    required: bool,
    fail_fast: bool,
    /// Instances not yet terminal
    remaining: usize,
}

/// Arena of instance states keyed by slot index.
///
/// Slots are laid out in (template index, binding index) order, matching
/// the instance list the scheduler was built from.
pub struct Scheduler {
    graph: DependencyGraph,
    slots: Vec<Slot>,
    templates: Vec<TemplateInfo>,
    ready: VecDeque<usize>,
}

impl Scheduler {
    /// `instances` must be ordered by instance id, as produced by expansion
    pub fn new(graph: DependencyGraph, instances: &[Arc<JobInstance>]) -> Self {
        let mut templates: Vec<TemplateInfo> = (0..graph.len())
            .map(|_| TemplateInfo {
                slots: 0..0,
                required: true,
                fail_fast: false,
                remaining: 0,
            })
            .collect();

        let mut slots = Vec::with_capacity(instances.len());
        for (slot, instance) in instances.iter().enumerate() {
            let t = instance.id.template;
            let info = &mut templates[t];
            if info.remaining == 0 {
                info.slots = slot..slot;
                info.required = instance.is_required();
                info.fail_fast = instance.template.fail_fast;
            }
            info.slots.end = slot + 1;
            info.remaining += 1;

            slots.push(Slot {
                template: t,
                enabled: instance.enabled,
                state: InstanceState::Pending,
            });
        }

        Self {
            graph,
            slots,
            templates,
            ready: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self, slot: usize) -> &InstanceState {
        &self.slots[slot].state
    }

    /// Every instance is terminal
    pub fn is_finished(&self) -> bool {
        self.templates.iter().all(|t| t.remaining == 0)
    }

    pub fn running(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, InstanceState::Running { .. }))
            .count()
    }

    /// Advance pending/blocked instances whose dependencies are all terminal.
    ///
    /// Instances are queued as runnable, or skipped when a dependency policy
    /// is violated or the job condition is false. Returns the slots that
    /// became skipped, in slot order.
    pub fn promote(&mut self) -> Vec<usize> {
        let mut skipped = Vec::new();

        let order = self.graph.topological_order().to_vec();
        for template in order {
            let range = self.templates[template].slots.clone();
            let waiting = range
                .clone()
                .any(|s| matches!(self.slots[s].state, InstanceState::Pending | InstanceState::Blocked));
            if !waiting {
                continue;
            }

            if !self.dependencies_terminal(template) {
                for slot in range {
                    if matches!(self.slots[slot].state, InstanceState::Pending) {
                        self.slots[slot].state = InstanceState::Blocked;
                    }
                }
                continue;
            }

            let blocked_by = self.violated_dependency(template);
            for slot in range {
                if !matches!(
                    self.slots[slot].state,
                    InstanceState::Pending | InstanceState::Blocked
                ) {
                    continue;
                }

                let reason = match (&blocked_by, self.slots[slot].enabled) {
                    (Some(dep), _) => Some(SkipReason::DependencyFailed(dep.clone())),
                    (None, false) => Some(SkipReason::Condition),
                    (None, true) => None,
                };

                match reason {
                    Some(reason) => {
                        debug!("Skipping slot {}: {}", slot, reason);
                        self.finish(slot, InstanceState::Skipped { reason });
                        skipped.push(slot);
                    }
                    None => {
                        self.slots[slot].state = InstanceState::Runnable;
                        self.ready.push_back(slot);
                    }
                }
            }
        }

        skipped.sort_unstable();
        skipped
    }

    /// Next runnable instance, first-ready-first-served
    pub fn next_runnable(&mut self) -> Option<usize> {
        self.ready.pop_front()
    }

    pub fn mark_running(&mut self, slot: usize) {
        self.slots[slot].state = InstanceState::Running {
            started_at: Utc::now(),
        };
    }

    /// Record a terminal state for a running instance.
    ///
    /// Applies fail-fast and returns the sibling slots it skipped.
    pub fn complete(&mut self, slot: usize, state: InstanceState) -> Vec<usize> {
        let failed = matches!(state, InstanceState::Failed { .. });
        self.finish(slot, state);

        let template = self.slots[slot].template;
        let info = &self.templates[template];
        if !(failed && info.fail_fast && info.required) {
            return Vec::new();
        }

        info!(
            "Fail-fast: skipping remaining instances of '{}'",
            self.graph.name(template)
        );
        let siblings: Vec<usize> = info
            .slots
            .clone()
            .filter(|&s| self.is_waiting(s))
            .collect();
        for &sibling in &siblings {
            self.finish(
                sibling,
                InstanceState::Skipped {
                    reason: SkipReason::FailFast,
                },
            );
        }
        self.ready.retain(|s| !siblings.contains(s));
        siblings
    }

    /// Skip every instance that has not started yet
    pub fn skip_waiting(&mut self, reason: SkipReason) -> Vec<usize> {
        let waiting: Vec<usize> = (0..self.slots.len()).filter(|&s| self.is_waiting(s)).collect();
        for &slot in &waiting {
            self.finish(
                slot,
                InstanceState::Skipped {
                    reason: reason.clone(),
                },
            );
        }
        self.ready.clear();
        waiting
    }

    /// Cancellation: pending, blocked and runnable instances become skipped
    pub fn cancel_pending(&mut self) -> Vec<usize> {
        self.skip_waiting(SkipReason::Cancelled)
    }

    fn is_waiting(&self, slot: usize) -> bool {
        matches!(
            self.slots[slot].state,
            InstanceState::Pending | InstanceState::Blocked | InstanceState::Runnable
        )
    }

    fn finish(&mut self, slot: usize, state: InstanceState) {
        debug_assert!(!self.slots[slot].state.is_terminal());
        let template = self.slots[slot].template;
        self.slots[slot].state = state;
        self.templates[template].remaining -= 1;
    }

    fn dependencies_terminal(&self, template: usize) -> bool {
        self.graph
            .dependencies(template)
            .iter()
            .all(|&(dep, _)| self.templates[dep].remaining == 0)
    }

    /// Name of the first dependency whose outcome violates its edge policy
    fn violated_dependency(&self, template: usize) -> Option<String> {
        self.graph
            .dependencies(template)
            .iter()
            .find(|&&(dep, policy)| self.blocks(dep, policy))
            .map(|&(dep, _)| self.graph.name(dep).to_string())
    }

    fn blocks(&self, dep: usize, policy: DependencyPolicy) -> bool {
        let info = &self.templates[dep];
        let states = info.slots.clone().map(|s| &self.slots[s].state);
        match policy {
            DependencyPolicy::Always => false,
            DependencyPolicy::Success | DependencyPolicy::Strict => {
                let count_failures = info.required || policy == DependencyPolicy::Strict;
                states.into_iter().any(|state| match state {
                    InstanceState::Failed { .. } => count_failures,
                    InstanceState::Skipped { reason } => reason.is_failure_induced(),
                    _ => false,
                })
            }
        }
    }
}
