// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executable form of a definition version.
//!
//! Loading resolves every activity type against the registry once and indexes
//! connections by `(source, outcome)`. The result is immutable and shared across
//! scheduler runs through an `Arc`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use trellis_dsl::{ActivityDefinition, WorkflowDefinition};

use crate::activity::{ActivityRegistry, ActivityType, JoinMode};
use crate::error::{CoreError, Result};
use crate::validation::ValidationError;

/// One activity with its resolved behavior.
pub struct GraphNode {
    /// Activity definition, including properties
    pub definition: ActivityDefinition,
    /// Resolved behavior
    pub activity_type: Arc<dyn ActivityType>,
    /// Scheduling of inbound connections
    pub join_mode: JoinMode,
    /// Distinct activities with a connection into this one
    pub inbound_sources: BTreeSet<String>,
}

/// A definition version ready to execute.
pub struct ExecutableGraph {
    definition_version_id: String,
    nodes: HashMap<String, GraphNode>,
    outbound: HashMap<String, HashMap<String, Vec<String>>>,
    start_activities: Vec<String>,
}

impl std::fmt::Debug for ExecutableGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableGraph")
            .field("definition_version_id", &self.definition_version_id)
            .field("nodes", &self.nodes.len())
            .field("start_activities", &self.start_activities)
            .finish()
    }
}

impl ExecutableGraph {
    /// Resolve a definition against the registry.
    ///
    /// Fails with a validation error if an activity's type is not registered.
    pub fn load(definition: &WorkflowDefinition, registry: &ActivityRegistry) -> Result<Self> {
        let mut nodes = HashMap::with_capacity(definition.activities.len());
        let mut errors = Vec::new();

        for activity in &definition.activities {
            let Some(activity_type) = registry.get(&activity.activity_type) else {
                errors.push(ValidationError::UnknownActivityType {
                    activity_id: activity.activity_id.clone(),
                    activity_type: activity.activity_type.clone(),
                    available_types: registry.type_names().iter().map(|s| s.to_string()).collect(),
                });
                continue;
            };
            let inbound_sources = definition
                .inbound_connections(&activity.activity_id)
                .map(|c| c.source_activity_id.clone())
                .collect();
            nodes.insert(
                activity.activity_id.clone(),
                GraphNode {
                    join_mode: activity_type.join_mode(activity),
                    definition: activity.clone(),
                    activity_type,
                    inbound_sources,
                },
            );
        }
        if !errors.is_empty() {
            return Err(CoreError::Validation { errors });
        }

        let mut outbound: HashMap<String, HashMap<String, Vec<String>>> = HashMap::new();
        for connection in &definition.connections {
            outbound
                .entry(connection.source_activity_id.clone())
                .or_default()
                .entry(connection.outcome.clone())
                .or_default()
                .push(connection.target_activity_id.clone());
        }

        Ok(Self {
            definition_version_id: definition.definition_version_id.clone(),
            nodes,
            outbound,
            start_activities: definition
                .start_activities()
                .into_iter()
                .map(|a| a.activity_id.clone())
                .collect(),
        })
    }

    /// Version this graph was loaded from.
    pub fn definition_version_id(&self) -> &str {
        &self.definition_version_id
    }

    /// Node by activity id.
    pub fn node(&self, activity_id: &str) -> Option<&GraphNode> {
        self.nodes.get(activity_id)
    }

    /// Whether the activity exists.
    pub fn contains(&self, activity_id: &str) -> bool {
        self.nodes.contains_key(activity_id)
    }

    /// Targets of connections labeled `outcome` leaving `source`, in declaration order.
    pub fn targets(&self, source: &str, outcome: &str) -> &[String] {
        self.outbound
            .get(source)
            .and_then(|by_outcome| by_outcome.get(outcome))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Activities without inbound connections, in definition order.
    pub fn start_activities(&self) -> &[String] {
        &self.start_activities
    }
}
