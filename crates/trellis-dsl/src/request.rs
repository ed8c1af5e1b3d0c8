// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::definition::{
    ActivityDefinition, ConnectionDefinition, Variables, WorkflowContextOptions,
    WorkflowDefinition, WorkflowPersistenceBehavior,
};

/// Save request sent by a designer.
///
/// Without `workflow_definition_id` a new definition family is created.
/// With it, the latest version is either edited in place (when it is still a
/// draft) or superseded by a new version (when it is published).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SaveWorkflowDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_definition_id: Option<String>,

    #[serde(default)]
    pub activities: Vec<ActivityDefinition>,

    #[serde(default)]
    pub connections: Vec<ConnectionDefinition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Publish the saved version in the same operation
    #[serde(default)]
    pub publish: bool,

    #[serde(default)]
    pub variables: Variables,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_options: Option<WorkflowContextOptions>,

    #[serde(default)]
    pub is_singleton: bool,

    #[serde(default)]
    pub persistence_behavior: WorkflowPersistenceBehavior,

    #[serde(default)]
    pub delete_completed_instances: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for SaveWorkflowDefinition {
    fn default() -> Self {
        Self {
            workflow_definition_id: None,
            activities: Vec::new(),
            connections: Vec::new(),
            name: None,
            display_name: None,
            description: None,
            enabled: default_enabled(),
            publish: false,
            variables: Variables::default(),
            context_options: None,
            is_singleton: false,
            persistence_behavior: WorkflowPersistenceBehavior::default(),
            delete_completed_instances: false,
        }
    }
}

impl SaveWorkflowDefinition {
    /// Copy the editable fields onto `definition`, leaving identity, version
    /// flags and timestamps alone.
    pub fn apply_to(&self, definition: &mut WorkflowDefinition) {
        definition.activities = self.activities.clone();
        definition.connections = self.connections.clone();
        definition.name = self.name.clone();
        definition.display_name = self.display_name.clone();
        definition.description = self.description.clone();
        definition.is_enabled = self.enabled;
        definition.variables = self.variables.clone();
        definition.context_options = self.context_options.clone();
        definition.is_singleton = self.is_singleton;
        definition.persistence_behavior = self.persistence_behavior;
        definition.delete_completed_instances = self.delete_completed_instances;
    }
}
