// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definition types.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

// ============================================================================
// Root Types
// ============================================================================

/// One version of a workflow definition.
///
/// `id` names the definition family; `definition_version_id` names this exact
/// version. A version is immutable once `is_published` has been set; edits
/// produce a new version under the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Definition family identifier, shared by all versions
    pub id: String,

    /// Identifier of this particular version
    pub definition_version_id: String,

    /// Version number within the family, starting at 1
    #[serde(default = "default_version")]
    pub version: i32,

    /// Technical name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Declared workflow variables and their initial values
    #[serde(default)]
    pub variables: Variables,

    /// Workflow context propagation policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_options: Option<WorkflowContextOptions>,

    /// At most one non-terminal instance of this definition may exist
    #[serde(default)]
    pub is_singleton: bool,

    /// When instance state is written to the store
    #[serde(default)]
    pub persistence_behavior: WorkflowPersistenceBehavior,

    /// Remove instances once they reach a terminal state
    #[serde(default)]
    pub delete_completed_instances: bool,

    /// Disabled definitions cannot be started
    #[serde(default = "default_true")]
    pub is_enabled: bool,

    /// The version instances start from by default
    #[serde(default)]
    pub is_published: bool,

    /// The most recent version of the family
    #[serde(default)]
    pub is_latest: bool,

    /// Graph nodes, in designer order
    #[serde(default)]
    pub activities: Vec<ActivityDefinition>,

    /// Outcome-labeled edges between activities
    #[serde(default)]
    pub connections: Vec<ConnectionDefinition>,

    /// When this version was created
    #[serde(default = "Utc::now")]
    #[schemars(with = "String")]
    pub created_at: DateTime<Utc>,

    /// Store-managed optimistic concurrency token (not part of the JSON shape)
    #[serde(skip)]
    #[schemars(skip)]
    pub revision: u64,
}

fn default_version() -> i32 {
    1
}

fn default_true() -> bool {
    true
}

impl WorkflowDefinition {
    /// Create an empty, enabled, unpublished first version.
    pub fn new(id: impl Into<String>, definition_version_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            definition_version_id: definition_version_id.into(),
            version: 1,
            name: None,
            display_name: None,
            description: None,
            variables: Variables::default(),
            context_options: None,
            is_singleton: false,
            persistence_behavior: WorkflowPersistenceBehavior::default(),
            delete_completed_instances: false,
            is_enabled: true,
            is_published: false,
            is_latest: true,
            activities: Vec::new(),
            connections: Vec::new(),
            created_at: Utc::now(),
            revision: 0,
        }
    }

    /// Look up an activity by id.
    pub fn activity(&self, activity_id: &str) -> Option<&ActivityDefinition> {
        self.activities.iter().find(|a| a.activity_id == activity_id)
    }

    /// Connections leaving `activity_id`, in declaration order.
    pub fn outbound_connections<'a>(
        &'a self,
        activity_id: &'a str,
    ) -> impl Iterator<Item = &'a ConnectionDefinition> + 'a {
        self.connections
            .iter()
            .filter(move |c| c.source_activity_id == activity_id)
    }

    /// Connections entering `activity_id`, in declaration order.
    pub fn inbound_connections<'a>(
        &'a self,
        activity_id: &'a str,
    ) -> impl Iterator<Item = &'a ConnectionDefinition> + 'a {
        self.connections
            .iter()
            .filter(move |c| c.target_activity_id == activity_id)
    }

    /// Activities without inbound connections, in definition order.
    pub fn start_activities(&self) -> Vec<&ActivityDefinition> {
        let targets: BTreeSet<&str> = self
            .connections
            .iter()
            .map(|c| c.target_activity_id.as_str())
            .collect();
        self.activities
            .iter()
            .filter(|a| !targets.contains(a.activity_id.as_str()))
            .collect()
    }

    /// Display name, falling back to the technical name, then to the id.
    pub fn title(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or(self.name.as_deref().filter(|s| !s.trim().is_empty()))
            .unwrap_or(&self.id)
    }
}

// ============================================================================
// Graph Types
// ============================================================================

/// A node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActivityDefinition {
    /// Unique activity identifier within the definition
    pub activity_id: String,

    /// Activity type name, resolved against the activity registry
    #[serde(rename = "type")]
    pub activity_type: String,

    /// Technical name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Checkpoint the instance after this activity regardless of the
    /// definition's persistence behavior
    #[serde(default)]
    pub persist_workflow: bool,

    /// Type-specific configuration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl ActivityDefinition {
    /// Create an activity with no configuration.
    pub fn new(activity_id: impl Into<String>, activity_type: impl Into<String>) -> Self {
        Self {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            name: None,
            display_name: None,
            description: None,
            persist_workflow: false,
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Raw property value.
    pub fn property(&self, name: &str) -> Option<&serde_json::Value> {
        self.properties.get(name)
    }

    /// Property value as a string.
    pub fn str_property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(|v| v.as_str())
    }

    /// Property value as a list of strings; non-string entries are skipped.
    pub fn str_list_property(&self, name: &str) -> Vec<String> {
        self.properties
            .get(name)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// An outcome-labeled edge: when `source_activity_id` produces `outcome`,
/// `target_activity_id` is scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDefinition {
    /// Activity the edge leaves
    pub source_activity_id: String,
    /// Activity the edge enters
    pub target_activity_id: String,
    /// Outcome name of the source activity that fires this edge
    pub outcome: String,
}

impl ConnectionDefinition {
    /// Create a connection.
    pub fn new(
        source_activity_id: impl Into<String>,
        target_activity_id: impl Into<String>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            source_activity_id: source_activity_id.into(),
            target_activity_id: target_activity_id.into(),
            outcome: outcome.into(),
        }
    }
}

// ============================================================================
// Variables and Policies
// ============================================================================

/// Named variable values. Ordered so serialization is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Variables(pub BTreeMap<String, serde_json::Value>);

impl Variables {
    /// Empty variable set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a variable.
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }

    /// Write a variable, returning the previous value.
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> Option<serde_json::Value> {
        self.0.insert(name.into(), value)
    }

    /// Whether a variable is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no variables are declared.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, serde_json::Value)> for Variables {
    fn from_iter<T: IntoIterator<Item = (String, serde_json::Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// How the workflow context is refreshed while an instance runs.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ContextFidelity {
    /// Load once per execution burst
    #[default]
    Burst,
    /// Reload before every activity
    Activity,
}

/// Workflow context propagation policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowContextOptions {
    /// Type name of the context object handed to activities
    pub context_type: String,
    /// Refresh policy
    #[serde(default)]
    pub context_fidelity: ContextFidelity,
}

/// When an instance's state is written to the store.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum WorkflowPersistenceBehavior {
    /// After every executed activity, on suspension, and on completion
    Always,
    /// On suspension and on completion
    #[default]
    WhenSuspended,
    /// Only what resumption requires; terminal state is not retained
    Never,
}
