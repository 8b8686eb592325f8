//! Workflow graph validation
//!
//! A workflow is validated once, up front. A validated [`Dag`] is acyclic,
//! every dependency names a step of the same workflow and every `state`
//! condition names a direct dependency.

use std::collections::HashMap;

use super::spec::WorkflowSpec;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("workflow has no steps")]
    Empty,

    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("step '{step}' references unknown experiment '{experiment_ref}'")]
    UnknownExperiment { step: String, experiment_ref: String },

    #[error("step '{step}' has a state condition on '{referenced}', which is not a direct dependency")]
    ConditionNotDependency { step: String, referenced: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Unvisited,
    InProgress,
    Done,
}

/// Index form of a validated workflow; step `i` is `spec.steps[i]`
#[derive(Debug, Clone)]
pub struct Dag {
    names: Vec<String>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl Dag {
    /// Check the structure of `spec` and build its graph
    pub fn build(spec: &WorkflowSpec) -> Result<Self, ValidationError> {
        if spec.steps.is_empty() {
            return Err(ValidationError::Empty);
        }

        let mut index = HashMap::with_capacity(spec.steps.len());
        for (i, step) in spec.steps.iter().enumerate() {
            if index.insert(step.name.as_str(), i).is_some() {
                return Err(ValidationError::DuplicateStep(step.name.clone()));
            }
        }

        let mut dependencies = vec![Vec::new(); spec.steps.len()];
        let mut dependents = vec![Vec::new(); spec.steps.len()];
        for (i, step) in spec.steps.iter().enumerate() {
            for dependency in &step.depends_on {
                let &d = index.get(dependency.as_str()).ok_or_else(|| {
                    ValidationError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                if !dependencies[i].contains(&d) {
                    dependencies[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        let names: Vec<String> = spec.steps.iter().map(|s| s.name.clone()).collect();
        let order = topological_order(&names, &dependencies)?;

        for step in &spec.steps {
            if let Some(referenced) = step.condition.as_ref().and_then(|c| c.referenced_step()) {
                if !step.depends_on.iter().any(|d| d == referenced) {
                    return Err(ValidationError::ConditionNotDependency {
                        step: step.name.clone(),
                        referenced: referenced.to_string(),
                    });
                }
            }
        }

        Ok(Self {
            names,
            dependencies,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, step: usize) -> &str {
        &self.names[step]
    }

    pub fn dependencies(&self, step: usize) -> &[usize] {
        &self.dependencies[step]
    }

    pub fn dependents(&self, step: usize) -> &[usize] {
        &self.dependents[step]
    }

    /// Steps ordered so every step comes after its dependencies
    pub fn order(&self) -> &[usize] {
        &self.order
    }
}

/// Three-color depth-first search; an edge into an in-progress node is a cycle
fn topological_order(
    names: &[String],
    dependencies: &[Vec<usize>],
) -> Result<Vec<usize>, ValidationError> {
    fn visit(
        node: usize,
        dependencies: &[Vec<usize>],
        colors: &mut [Color],
        path: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<(), Vec<usize>> {
        colors[node] = Color::InProgress;
        path.push(node);

        for &next in &dependencies[node] {
            match colors[next] {
                Color::Done => {}
                Color::Unvisited => visit(next, dependencies, colors, path, order)?,
                Color::InProgress => {
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Err(cycle);
                }
            }
        }

        path.pop();
        colors[node] = Color::Done;
        order.push(node);
        Ok(())
    }

    let mut colors = vec![Color::Unvisited; names.len()];
    let mut order = Vec::with_capacity(names.len());
    let mut path = Vec::new();

    for node in 0..names.len() {
        if colors[node] == Color::Unvisited {
            visit(node, dependencies, &mut colors, &mut path, &mut order).map_err(|cycle| {
                ValidationError::Cycle(cycle.into_iter().map(|n| names[n].clone()).collect())
            })?;
        }
    }
    Ok(order)
}
