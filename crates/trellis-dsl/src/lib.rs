// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definition model.
//!
//! This crate defines the serializable shape of a workflow definition and is shared by
//! the engine, the store adapters and any designer or API sitting in front of them:
//! - [`WorkflowDefinition`]: one immutable-once-published version of a workflow graph
//! - [`ActivityDefinition`] / [`ConnectionDefinition`]: graph nodes and outcome-labeled edges
//! - [`VersionOptions`]: symbolic version selectors (`latest`, `published`, ...)
//! - [`SaveWorkflowDefinition`]: the save request a designer sends
//!
//! All JSON is camelCase. JSON Schema is available through [`schemars`].

mod definition;
mod request;
mod version;

pub use definition::{
    ActivityDefinition, ConnectionDefinition, ContextFidelity, Variables,
    WorkflowContextOptions, WorkflowDefinition, WorkflowPersistenceBehavior,
};
pub use request::SaveWorkflowDefinition;
pub use version::{ParseVersionError, VersionOptions};

/// DSL version - bump when making breaking changes to the definition shape
pub const DSL_VERSION: &str = "1.0.0";

// ============================================================================
// Parsing Functions
// ============================================================================

/// Parse a workflow definition from a JSON value
pub fn parse_definition(json: &serde_json::Value) -> Result<WorkflowDefinition, String> {
    serde_json::from_value(json.clone())
        .map_err(|e| format!("Failed to parse workflow definition: {}", e))
}

/// Parse a save request from a JSON value
pub fn parse_save_request(json: &serde_json::Value) -> Result<SaveWorkflowDefinition, String> {
    serde_json::from_value(json.clone()).map_err(|e| format!("Failed to parse save request: {}", e))
}

/// JSON Schema for [`WorkflowDefinition`]
pub fn definition_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(WorkflowDefinition)
}
