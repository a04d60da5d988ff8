/// Task graph construction and ordering
///
/// Nodes are concrete `(package, task)` pairs. Edges come from each task's
/// `dependsOn` entries resolved against the workspace package graph.
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write as _;
use thiserror::Error;

use crate::pipeline::{
    PipelineConfig, PipelineError, TaskDefinition, TaskDependency, TaskId, TaskName, ROOT_PKG_NAME,
};
use crate::workspace::Workspace;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Could not find task \"{0}\" in the pipeline")]
    UnknownTask(String),

    #[error("Package \"{0}\" not found in the workspace")]
    UnknownPackage(String),

    #[error("Cyclic task dependency detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: TaskId,
    /// Script to run; `None` when the package has no script of that name
    pub command: Option<String>,
    pub definition: TaskDefinition,
    pub dependencies: BTreeSet<TaskId>,
}

impl TaskNode {
    pub fn is_noop(&self) -> bool {
        self.command.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    pub nodes: BTreeMap<TaskId, TaskNode>,
}

impl TaskGraph {
    /// Build the graph for `tasks` over the selected `packages`
    ///
    /// Dependencies are expanded transitively and may pull in nodes from
    /// packages outside the selection. With `only`, just the requested tasks
    /// are added and edges between them are kept for ordering.
    pub fn build(
        workspace: &Workspace,
        pipeline: &PipelineConfig,
        packages: &BTreeSet<String>,
        tasks: &[String],
        only: bool,
    ) -> Result<Self, GraphError> {
        let mut seeds = Vec::new();

        for task in tasks {
            let name = TaskName::parse(task)?;
            match name.package {
                Some(package) => {
                    if workspace.package(&package).is_none() {
                        return Err(GraphError::UnknownPackage(package));
                    }
                    let id = TaskId::new(package, name.task);
                    if definition_for(pipeline, &id).is_none() {
                        return Err(GraphError::UnknownTask(id.to_string()));
                    }
                    seeds.push(id);
                }
                None => {
                    if !pipeline.has_task(&name.task) {
                        return Err(GraphError::UnknownTask(name.task));
                    }
                    for package in packages {
                        let id = TaskId::new(package.clone(), name.task.clone());
                        if definition_for(pipeline, &id).is_some() {
                            seeds.push(id);
                        }
                    }
                }
            }
        }

        let mut nodes: BTreeMap<TaskId, TaskNode> = BTreeMap::new();
        let mut queue: VecDeque<TaskId> = seeds.into_iter().collect();

        while let Some(id) = queue.pop_front() {
            if nodes.contains_key(&id) {
                continue;
            }

            let definition = definition_for(pipeline, &id)
                .cloned()
                .ok_or_else(|| GraphError::UnknownTask(id.to_string()))?;
            let dependencies = resolve_dependencies(workspace, pipeline, &id, &definition)?;

            if !only {
                queue.extend(dependencies.iter().cloned());
            }

            let command = workspace
                .package(&id.package)
                .and_then(|p| p.scripts.get(&id.task))
                .cloned();

            nodes.insert(
                id.clone(),
                TaskNode {
                    id,
                    command,
                    definition,
                    dependencies,
                },
            );
        }

        if only {
            let present: BTreeSet<TaskId> = nodes.keys().cloned().collect();
            for node in nodes.values_mut() {
                node.dependencies.retain(|d| present.contains(d));
            }
        }

        tracing::debug!(nodes = nodes.len(), "Built task graph");

        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    /// Direct dependents of a task
    pub fn dependents(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.nodes
            .values()
            .filter(|n| n.dependencies.contains(id))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Every task that depends on `id`, directly or not
    pub fn transitive_dependents(&self, id: &TaskId) -> BTreeSet<TaskId> {
        let mut result = BTreeSet::new();
        let mut queue = VecDeque::from([id.clone()]);

        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(&current) {
                if result.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }

        result
    }

    /// Deterministic topological order (Kahn, ties broken by task id)
    pub fn topological_order(&self) -> Result<Vec<TaskId>, GraphError> {
        let mut in_degree: BTreeMap<&TaskId, usize> = self
            .nodes
            .values()
            .map(|n| (&n.id, n.dependencies.len()))
            .collect();

        let mut reverse: BTreeMap<&TaskId, Vec<&TaskId>> = BTreeMap::new();
        for node in self.nodes.values() {
            for dependency in &node.dependencies {
                reverse.entry(dependency).or_default().push(&node.id);
            }
        }

        let mut ready: BTreeSet<&TaskId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_first() {
            order.push(id.clone());

            for dependent in reverse.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            let done: BTreeSet<&TaskId> = order.iter().collect();
            return Err(GraphError::Cycle(self.find_cycle(&done)));
        }

        Ok(order)
    }

    /// Find one cycle among the nodes not yet ordered
    fn find_cycle(&self, done: &BTreeSet<&TaskId>) -> Vec<String> {
        let mut visited: BTreeSet<&TaskId> = BTreeSet::new();

        for start in self.nodes.keys().filter(|id| !done.contains(id)) {
            let mut path: Vec<&TaskId> = Vec::new();
            if let Some(cycle) = self.walk_cycle(start, done, &mut visited, &mut path) {
                return cycle;
            }
        }

        Vec::new()
    }

    fn walk_cycle<'a>(
        &'a self,
        id: &'a TaskId,
        done: &BTreeSet<&TaskId>,
        visited: &mut BTreeSet<&'a TaskId>,
        path: &mut Vec<&'a TaskId>,
    ) -> Option<Vec<String>> {
        if let Some(position) = path.iter().position(|p| *p == id) {
            let mut cycle: Vec<String> = path[position..].iter().map(|p| p.to_string()).collect();
            cycle.push(id.to_string());
            return Some(cycle);
        }
        if !visited.insert(id) {
            return None;
        }

        path.push(id);
        if let Some(node) = self.nodes.get(id) {
            for dependency in &node.dependencies {
                if done.contains(dependency) {
                    continue;
                }
                if let Some(cycle) = self.walk_cycle(dependency, done, visited, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();

        None
    }

    /// Graphviz rendering
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph {\n\tcompound = \"true\"\n\tnewrank = \"true\"\n");
        for node in self.nodes.values() {
            if node.dependencies.is_empty() {
                let _ = writeln!(out, "\t\"{}\"", node.id);
            }
            for dependency in &node.dependencies {
                let _ = writeln!(out, "\t\"{}\" -> \"{}\"", node.id, dependency);
            }
        }
        out.push_str("}\n");
        out
    }
}

/// Definition for a concrete task; root tasks need an explicit `//#task` entry
fn definition_for<'a>(pipeline: &'a PipelineConfig, id: &TaskId) -> Option<&'a TaskDefinition> {
    if id.package == ROOT_PKG_NAME {
        return pipeline.pipeline.get(&id.to_string());
    }
    pipeline.task_definition(&id.package, &id.task)
}

fn resolve_dependencies(
    workspace: &Workspace,
    pipeline: &PipelineConfig,
    id: &TaskId,
    definition: &TaskDefinition,
) -> Result<BTreeSet<TaskId>, GraphError> {
    let mut result = BTreeSet::new();

    for dependency in definition.dependencies()? {
        match dependency {
            TaskDependency::Upstream(task) => {
                let package = workspace
                    .package(&id.package)
                    .ok_or_else(|| GraphError::UnknownPackage(id.package.clone()))?;
                for upstream in &package.dependencies {
                    let target = TaskId::new(upstream.clone(), task.clone());
                    if definition_for(pipeline, &target).is_some() {
                        result.insert(target);
                    }
                }
            }
            TaskDependency::SamePackage(task) => {
                let target = TaskId::new(id.package.clone(), task);
                if definition_for(pipeline, &target).is_some() {
                    result.insert(target);
                }
            }
            TaskDependency::Package(target) => {
                if workspace.package(&target.package).is_none() {
                    return Err(GraphError::UnknownPackage(target.package));
                }
                if definition_for(pipeline, &target).is_none() {
                    return Err(GraphError::UnknownTask(target.to_string()));
                }
                result.insert(target);
            }
        }
    }

    Ok(result)
}
