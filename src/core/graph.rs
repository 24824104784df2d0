//! Dependency graph between job templates

use crate::core::{
    definition::{DependencyPolicy, JobTemplate},
    error::DefinitionError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// DAG over job templates, addressed by declaration index
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    /// For each template: the templates it needs, with the edge policy
    dependencies: Vec<Vec<(usize, DependencyPolicy)>>,
    /// For each template: the templates that need it
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    /// Build the graph, rejecting unknown dependencies and cycles
    pub fn build(jobs: &[Arc<JobTemplate>]) -> Result<Self, DefinitionError> {
        let indices: HashMap<&str, usize> = jobs
            .iter()
            .enumerate()
            .map(|(i, job)| (job.name.as_str(), i))
            .collect();

        let mut dependencies = vec![Vec::new(); jobs.len()];
        let mut dependents = vec![Vec::new(); jobs.len()];

        for (i, job) in jobs.iter().enumerate() {
            for dep in &job.needs {
                let target = *indices.get(dep.job.as_str()).ok_or_else(|| {
                    DefinitionError::UnknownDependency {
                        job: job.name.clone(),
                        dependency: dep.job.clone(),
                    }
                })?;
                if dependencies[i].iter().any(|(t, _)| *t == target) {
                    continue;
                }
                dependencies[i].push((target, dep.policy));
                dependents[target].push(i);
            }
        }

        let mut graph = Self {
            names: jobs.iter().map(|j| j.name.clone()).collect(),
            dependencies,
            dependents,
            order: Vec::new(),
        };

        if let Some(path) = graph.find_cycle() {
            return Err(DefinitionError::Cycle { path });
        }
        graph.order = graph.topological_sort();

        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, node: usize) -> &str {
        &self.names[node]
    }

    /// Templates `node` needs, with the edge policy
    pub fn dependencies(&self, node: usize) -> &[(usize, DependencyPolicy)] {
        &self.dependencies[node]
    }

    /// Templates that need `node`
    pub fn dependents(&self, node: usize) -> &[usize] {
        &self.dependents[node]
    }

    /// Dependencies before dependents; ties keep declaration order
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.len()];
        let mut stack = Vec::new();

        for node in 0..self.len() {
            if marks[node] == Mark::Unvisited {
                if let Some(cycle) = self.dfs_cycle(node, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: usize,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        marks[node] = Mark::InProgress;
        stack.push(node);

        for &(dep, _) in &self.dependencies[node] {
            match marks[dep] {
                Mark::InProgress => {
                    // Report the loop from where it starts: a -> b -> a
                    let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(|&n| self.names[n].clone()).collect();
                    path.push(self.names[dep].clone());
                    return Some(path);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.dfs_cycle(dep, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    /// Kahn's algorithm
    fn topological_sort(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..self.len()).filter(|&n| in_degree[n] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &dependent in &self.dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        order
    }
}
