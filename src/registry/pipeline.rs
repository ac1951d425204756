//! # Pipeline Definition
//!
//! Declarative description of an execution's phases: which task templates each
//! phase instantiates, the dependency edges among them and the gate (if any)
//! that suspends the execution after the phase completes.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use super::{AgentRoleId, RegistryError, RoleRegistry};

/// Ordered phases of one workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub phases: Vec<PhaseDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub name: String,
    /// Relative share of overall progress
    pub weight: f64,
    pub tasks: Vec<TaskTemplate>,
    #[serde(default)]
    pub gate: Option<GateDefinition>,
}

/// A task instantiated for the role when that role is selected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub key: String,
    pub role: AgentRoleId,
    /// Keys of same-phase templates that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDefinition {
    pub name: String,
    /// Coverage score at or above which the gate payload reports `meets_threshold`
    pub min_coverage: f64,
}

impl TaskTemplate {
    pub fn new(key: impl Into<String>, role: impl Into<AgentRoleId>) -> Self {
        Self {
            key: key.into(),
            role: role.into(),
            depends_on: Vec::new(),
            optional: false,
        }
    }

    pub fn depends_on<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

impl PhaseDefinition {
    pub fn new(name: impl Into<String>, weight: f64, tasks: Vec<TaskTemplate>) -> Self {
        Self {
            name: name.into(),
            weight,
            tasks,
            gate: None,
        }
    }

    pub fn with_gate(mut self, name: impl Into<String>, min_coverage: f64) -> Self {
        self.gate = Some(GateDefinition {
            name: name.into(),
            min_coverage,
        });
        self
    }

    pub fn template(&self, key: &str) -> Option<&TaskTemplate> {
        self.tasks.iter().find(|template| template.key == key)
    }
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>, phases: Vec<PhaseDefinition>) -> Self {
        Self {
            name: name.into(),
            phases,
        }
    }

    /// Requirements, design and implementation, with review gates after the
    /// first two phases
    pub fn standard_delivery() -> Self {
        Self::new(
            "standard_delivery",
            vec![
                PhaseDefinition::new(
                    "requirements",
                    0.2,
                    vec![TaskTemplate::new("requirements_analysis", "requirements_analyst")],
                )
                .with_gate("requirements_review", 1.0),
                PhaseDefinition::new(
                    "design",
                    0.3,
                    vec![
                        TaskTemplate::new("architecture_design", "solution_architect"),
                        TaskTemplate::new("ux_design", "ux_designer").optional(),
                    ],
                )
                .with_gate("design_review", 1.0),
                PhaseDefinition::new(
                    "implementation",
                    0.5,
                    vec![
                        TaskTemplate::new("backend_implementation", "backend_developer"),
                        TaskTemplate::new("frontend_implementation", "frontend_developer")
                            .optional(),
                        TaskTemplate::new("test_suite", "qa_engineer")
                            .depends_on(["backend_implementation", "frontend_implementation"])
                            .optional(),
                        TaskTemplate::new("documentation", "technical_writer")
                            .depends_on(["backend_implementation"])
                            .optional(),
                    ],
                ),
            ],
        )
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    pub fn phase(&self, index: usize) -> Option<&PhaseDefinition> {
        self.phases.get(index)
    }

    pub fn total_weight(&self) -> f64 {
        self.phases.iter().map(|phase| phase.weight).sum()
    }

    /// Index of the phase that owns the named gate
    pub fn phase_for_gate(&self, gate_name: &str) -> Option<usize> {
        self.phases.iter().position(|phase| {
            phase
                .gate
                .as_ref()
                .is_some_and(|gate| gate.name == gate_name)
        })
    }

    /// Validate structure and role references against the registry
    pub fn validate(&self, registry: &RoleRegistry) -> Result<(), RegistryError> {
        let invalid = |reason: String| Err(RegistryError::InvalidPipeline(reason));

        if self.phases.is_empty() {
            return invalid(format!("pipeline '{}' has no phases", self.name));
        }

        let mut phase_names = HashSet::new();
        let mut gate_names = HashSet::new();
        let mut key_phase: HashMap<&str, usize> = HashMap::new();

        for (index, phase) in self.phases.iter().enumerate() {
            if phase.name.is_empty() || !phase_names.insert(phase.name.as_str()) {
                return invalid(format!("phase {} has an empty or duplicate name", index + 1));
            }
            if !phase.weight.is_finite() || phase.weight <= 0.0 {
                return invalid(format!("phase '{}' must have a positive weight", phase.name));
            }
            if phase.tasks.is_empty() {
                return invalid(format!("phase '{}' has no tasks", phase.name));
            }
            if let Some(gate) = &phase.gate {
                if gate.name.trim().is_empty() || !gate_names.insert(gate.name.as_str()) {
                    return invalid(format!(
                        "phase '{}' has an empty or duplicate gate name",
                        phase.name
                    ));
                }
                if !(0.0..=1.0).contains(&gate.min_coverage) {
                    return invalid(format!(
                        "gate '{}' min_coverage must be between 0.0 and 1.0",
                        gate.name
                    ));
                }
            }
            for template in &phase.tasks {
                if key_phase.insert(template.key.as_str(), index).is_some() {
                    return invalid(format!("duplicate task key '{}'", template.key));
                }
                if !registry.contains(&template.role) {
                    return invalid(format!(
                        "task '{}' references unknown role '{}'",
                        template.key, template.role
                    ));
                }
            }
        }

        for (index, phase) in self.phases.iter().enumerate() {
            for template in &phase.tasks {
                for dependency in &template.depends_on {
                    match key_phase.get(dependency.as_str()) {
                        None => {
                            return invalid(format!(
                                "task '{}' depends on unknown task '{dependency}'",
                                template.key
                            ))
                        }
                        Some(owner) if *owner != index => {
                            return invalid(format!(
                                "task '{}' depends on '{dependency}' from another phase",
                                template.key
                            ))
                        }
                        Some(_) => {}
                    }
                }
            }
            Self::check_acyclic(phase)?;
        }

        Ok(())
    }

    fn check_acyclic(phase: &PhaseDefinition) -> Result<(), RegistryError> {
        let mut unmet: HashMap<&str, usize> = phase
            .tasks
            .iter()
            .map(|template| {
                let distinct: HashSet<&String> = template.depends_on.iter().collect();
                (template.key.as_str(), distinct.len())
            })
            .collect();
        let mut queue: VecDeque<&str> = unmet
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(key, _)| *key)
            .collect();
        let mut visited = 0;

        while let Some(key) = queue.pop_front() {
            visited += 1;
            for dependent in phase
                .tasks
                .iter()
                .filter(|template| template.depends_on.iter().any(|dep| dep == key))
            {
                if let Some(count) = unmet.get_mut(dependent.key.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(dependent.key.as_str());
                    }
                }
            }
        }

        if visited != phase.tasks.len() {
            return Err(RegistryError::InvalidPipeline(format!(
                "phase '{}' has a dependency cycle",
                phase.name
            )));
        }
        Ok(())
    }
}
