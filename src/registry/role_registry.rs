//! # Agent Role Registry
//!
//! Single typed registry of agent roles keyed by a stable [`AgentRoleId`].
//! Task instantiation, dispatch timeouts, retry ceilings and spend estimates
//! all read the same [`RoleDefinition`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::RegistryError;
use crate::models::Cost;

/// Stable identifier of an agent role
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentRoleId(String);

impl AgentRoleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentRoleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AgentRoleId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for AgentRoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Timeout class applied by the invocation gateway
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationClass {
    #[default]
    Standard,
    LongRunning,
    Build,
}

/// Whether a role's tasks report the extended deploy/test/commit chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Simple,
    Build,
}

/// Everything the orchestrator needs to know about one agent role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub id: AgentRoleId,
    pub display_name: String,
    pub invocation_class: InvocationClass,
    pub execution_mode: ExecutionMode,
    /// Spend reserved against the ledgers before each invocation
    pub estimated_cost: Cost,
    /// Mandatory roles must be part of every execution's selection
    pub mandatory: bool,
    /// Overrides the configured retry ceiling for this role
    pub max_attempts: Option<u32>,
}

impl RoleDefinition {
    pub fn new(id: impl Into<AgentRoleId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            invocation_class: InvocationClass::Standard,
            execution_mode: ExecutionMode::Simple,
            estimated_cost: Cost::ZERO,
            mandatory: false,
            max_attempts: None,
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn with_estimated_cost(mut self, cost: Cost) -> Self {
        self.estimated_cost = cost;
        self
    }

    pub fn with_invocation_class(mut self, class: InvocationClass) -> Self {
        self.invocation_class = class;
        self
    }

    /// Build-mode roles always use the build timeout class
    pub fn build(mut self) -> Self {
        self.execution_mode = ExecutionMode::Build;
        self.invocation_class = InvocationClass::Build;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn is_build(&self) -> bool {
        self.execution_mode == ExecutionMode::Build
    }
}

/// Registry of agent roles
#[derive(Debug, Clone, Default)]
pub struct RoleRegistry {
    roles: BTreeMap<AgentRoleId, RoleDefinition>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The roster backing [`super::PipelineDefinition::standard_delivery`]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        let roles = [
            RoleDefinition::new("requirements_analyst", "Requirements Analyst")
                .mandatory()
                .with_estimated_cost(Cost::from_dollars(0.50)),
            RoleDefinition::new("solution_architect", "Solution Architect")
                .mandatory()
                .with_invocation_class(InvocationClass::LongRunning)
                .with_estimated_cost(Cost::from_dollars(1.00)),
            RoleDefinition::new("ux_designer", "UX Designer")
                .with_estimated_cost(Cost::from_dollars(0.75)),
            RoleDefinition::new("backend_developer", "Backend Developer")
                .mandatory()
                .build()
                .with_estimated_cost(Cost::from_dollars(2.50)),
            RoleDefinition::new("frontend_developer", "Frontend Developer")
                .build()
                .with_estimated_cost(Cost::from_dollars(2.00)),
            RoleDefinition::new("qa_engineer", "QA Engineer")
                .with_invocation_class(InvocationClass::LongRunning)
                .with_estimated_cost(Cost::from_dollars(1.00)),
            RoleDefinition::new("technical_writer", "Technical Writer")
                .with_estimated_cost(Cost::from_dollars(0.40)),
        ];
        for role in roles {
            registry.roles.insert(role.id.clone(), role);
        }
        registry
    }

    /// Register a role, rejecting duplicate identifiers
    pub fn register(&mut self, role: RoleDefinition) -> Result<(), RegistryError> {
        if self.roles.contains_key(&role.id) {
            return Err(RegistryError::DuplicateRole(role.id.to_string()));
        }
        self.roles.insert(role.id.clone(), role);
        Ok(())
    }

    pub fn get(&self, id: &AgentRoleId) -> Option<&RoleDefinition> {
        self.roles.get(id)
    }

    pub fn contains(&self, id: &AgentRoleId) -> bool {
        self.roles.contains_key(id)
    }

    pub fn roles(&self) -> impl Iterator<Item = &RoleDefinition> {
        self.roles.values()
    }

    pub fn mandatory_roles(&self) -> impl Iterator<Item = &AgentRoleId> {
        self.roles
            .values()
            .filter(|role| role.mandatory)
            .map(|role| &role.id)
    }

    /// Check a client's role selection, returning it deduplicated in registry order
    pub fn validate_selection(
        &self,
        selected: &[AgentRoleId],
    ) -> Result<Vec<AgentRoleId>, RegistryError> {
        let selected: BTreeSet<&AgentRoleId> = selected.iter().collect();

        let unknown: Vec<String> = selected
            .iter()
            .filter(|id| !self.contains(id))
            .map(|id| id.to_string())
            .collect();
        let missing: Vec<String> = self
            .mandatory_roles()
            .filter(|id| !selected.contains(id))
            .map(|id| id.to_string())
            .collect();

        if !unknown.is_empty() || !missing.is_empty() {
            return Err(RegistryError::InvalidSelection { unknown, missing });
        }

        Ok(selected.into_iter().cloned().collect())
    }
}
