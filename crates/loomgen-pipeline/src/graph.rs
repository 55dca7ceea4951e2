//! Directed acyclic graph of steps: wiring, validation, topological order.

use std::collections::{HashMap, HashSet, VecDeque};

use loomgen_types::{LoomError, Result};

use crate::step::{effective_outputs, Step};

/// The DAG of steps plus their wiring. Owns every step; edges are declared
/// by step name. Cycles are rejected at `connect` time, everything else at
/// `validate` time, before any step runs.
pub struct PipelineGraph {
    nodes: Vec<Box<dyn Step>>,
    index: HashMap<String, usize>,
    edges: Vec<(String, String)>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
        }
    }

    /// Add a step to the graph. Step names must be unique.
    pub fn add_step(&mut self, step: Box<dyn Step>) -> Result<()> {
        let name = step.name().to_string();
        if self.index.contains_key(&name) {
            return Err(LoomError::GraphValidation(format!(
                "Step with name '{name}' already exists"
            )));
        }
        self.index.insert(name, self.nodes.len());
        self.nodes.push(step);
        Ok(())
    }

    /// Add an edge between two steps. Rejects unknown endpoints, duplicate
    /// edges, self-edges, and edges that would create a cycle.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<()> {
        if !self.index.contains_key(from) {
            return Err(LoomError::GraphValidation(format!(
                "Step with name '{from}' does not exist"
            )));
        }
        if !self.index.contains_key(to) {
            return Err(LoomError::GraphValidation(format!(
                "Step with name '{to}' does not exist"
            )));
        }
        if from == to {
            return Err(LoomError::GraphValidation(format!(
                "Cannot connect step '{from}' to itself"
            )));
        }
        if self.edges.iter().any(|(f, t)| f == from && t == to) {
            return Err(LoomError::GraphValidation(format!(
                "There is already an edge from '{from}' to '{to}'"
            )));
        }
        if self.is_reachable(to, from) {
            return Err(LoomError::GraphValidation(format!(
                "Cannot add edge from '{from}' to '{to}' as it would create a cycle"
            )));
        }
        self.edges.push((from.to_string(), to.to_string()));
        Ok(())
    }

    pub fn step(&self, name: &str) -> Option<&dyn Step> {
        self.index.get(name).map(|&i| self.nodes[i].as_ref())
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut Box<dyn Step>> {
        let i = *self.index.get(name)?;
        Some(&mut self.nodes[i])
    }

    pub fn step_names(&self) -> Vec<String> {
        self.nodes.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn predecessors(&self, name: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(_, t)| t == name)
            .map(|(f, _)| f.clone())
            .collect()
    }

    pub fn successors(&self, name: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(f, _)| f == name)
            .map(|(_, t)| t.clone())
            .collect()
    }

    /// Steps with no predecessors, in insertion order.
    pub fn roots(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|s| s.name().to_string())
            .filter(|n| self.predecessors(n).is_empty())
            .collect()
    }

    /// Steps with no successors, in insertion order.
    pub fn leaves(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|s| s.name().to_string())
            .filter(|n| self.successors(n).is_empty())
            .collect()
    }

    fn is_reachable(&self, from: &str, to: &str) -> bool {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(from.to_string());
        visited.insert(from.to_string());
        while let Some(current) = queue.pop_front() {
            if current == to {
                return true;
            }
            for next in self.successors(&current) {
                if visited.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        false
    }

    fn ancestors(&self, name: &str) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut out = Vec::new();
        queue.push_back(name.to_string());
        visited.insert(name.to_string());
        while let Some(current) = queue.pop_front() {
            for prev in self.predecessors(&current) {
                if visited.insert(prev.clone()) {
                    out.push(prev.clone());
                    queue.push_back(prev);
                }
            }
        }
        out
    }

    /// Topological execution order (Kahn's algorithm, insertion order among
    /// ties so runs are deterministic).
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|s| (s.name(), 0usize))
            .collect();
        for (_, to) in &self.edges {
            *in_degree.entry(to.as_str()).or_insert(0) += 1;
        }

        let mut ready: VecDeque<String> = self
            .nodes
            .iter()
            .map(|s| s.name().to_string())
            .filter(|n| in_degree[n.as_str()] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(current) = ready.pop_front() {
            for next in self.successors(&current) {
                if let Some(degree) = in_degree.get_mut(next.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(next);
                    }
                }
            }
            order.push(current);
        }

        if order.len() != self.nodes.len() {
            return Err(LoomError::GraphValidation(
                "Pipeline contains a cycle".into(),
            ));
        }
        Ok(order)
    }

    /// Validate the whole graph before execution: every root must be a
    /// generator step, and every required input field of every step must be
    /// produced by some ancestor.
    pub fn validate(&self) -> Result<()> {
        self.topological_order()?;

        for step in &self.nodes {
            let name = step.name();
            let predecessors = self.predecessors(name);

            if predecessors.is_empty() {
                if !step.is_generator() {
                    return Err(LoomError::GraphValidation(format!(
                        "Step '{name}' should be a generator step as it doesn't have any previous steps"
                    )));
                }
                continue;
            }

            // Fields visible to this step: every ancestor's published outputs,
            // renamed through this step's input mappings.
            let mut available: Vec<String> = Vec::new();
            for ancestor in self.ancestors(name) {
                let Some(ancestor_step) = self.step(&ancestor) else {
                    continue;
                };
                for field in effective_outputs(ancestor_step) {
                    let seen = step
                        .input_mappings()
                        .get(&field)
                        .cloned()
                        .unwrap_or(field);
                    if !available.contains(&seen) {
                        available.push(seen);
                    }
                }
            }

            let missing: Vec<String> = step
                .inputs()
                .into_iter()
                .filter(|input| !available.contains(input))
                .collect();
            if !missing.is_empty() {
                return Err(LoomError::GraphValidation(format!(
                    "Step '{name}' requires inputs {missing:?} which are not available when the \
                     step gets to be executed in the pipeline. Please make sure previous steps \
                     to '{name}' are generating the required inputs. Available inputs are: {available:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn edges(&self) -> &[(String, String)] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for PipelineGraph {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
