// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for trellis-core integration tests.
//!
//! Provides TestContext for building a runtime over in-memory or SQLite stores,
//! plus small builders for definitions.

#![allow(dead_code)]

use std::path::PathBuf;

use serde_json::{Value, json};
use tempfile::TempDir;

use trellis_core::persistence::SqliteStore;
use trellis_core::{
    ActivityDefinition, ActivityRegistry, ConnectionDefinition, SaveWorkflowDefinition,
    WorkflowRuntime,
};

/// Runtime plus whatever keeps its storage alive.
pub struct TestContext {
    pub runtime: WorkflowRuntime,
    pub store: Option<SqliteStore>,
    dir: Option<TempDir>,
}

impl TestContext {
    /// Runtime over fresh in-memory stores.
    pub fn in_memory() -> Self {
        Self {
            runtime: WorkflowRuntime::builder()
                .in_memory()
                .build()
                .expect("in-memory runtime"),
            store: None,
            dir: None,
        }
    }

    /// Wrap a runtime built by the test itself.
    pub fn with_runtime(runtime: WorkflowRuntime) -> Self {
        Self {
            runtime,
            store: None,
            dir: None,
        }
    }

    /// Runtime over a SQLite file in a fresh temporary directory.
    pub async fn sqlite() -> Self {
        Self::sqlite_with(ActivityRegistry::with_builtins()).await
    }

    /// Like [`TestContext::sqlite`], resolving activities against `registry`.
    pub async fn sqlite_with(registry: ActivityRegistry) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("trellis.db");
        let store = SqliteStore::from_path(&path).await.expect("sqlite store");
        Self {
            runtime: sqlite_runtime(&store, registry),
            store: Some(store),
            dir: Some(dir),
        }
    }

    /// Path of the SQLite file, if this context has one.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.path().join("trellis.db"))
    }

    /// Close the pool and open a second runtime over the same file, as a
    /// restarted process would.
    pub async fn restart(self) -> Self {
        self.restart_with(ActivityRegistry::with_builtins()).await
    }

    /// Like [`TestContext::restart`], resolving activities against `registry`.
    pub async fn restart_with(mut self, registry: ActivityRegistry) -> Self {
        let path = self.database_path().expect("restart needs a sqlite context");
        if let Some(store) = self.store.take() {
            store.close().await;
        }
        let store = SqliteStore::from_path(&path).await.expect("reopen sqlite store");
        Self {
            runtime: sqlite_runtime(&store, registry),
            store: Some(store),
            dir: self.dir.take(),
        }
    }
}

fn sqlite_runtime(store: &SqliteStore, registry: ActivityRegistry) -> WorkflowRuntime {
    WorkflowRuntime::builder()
        .sqlite(store.clone())
        .registry(registry)
        .build()
        .expect("sqlite runtime")
}

// ============================================================================
// Definition builders
// ============================================================================

pub fn activity(id: &str, activity_type: &str) -> ActivityDefinition {
    ActivityDefinition::new(id, activity_type)
}

pub fn set_variable(id: &str, variable: &str, value: Value) -> ActivityDefinition {
    activity(id, "SetVariable")
        .with_property("variable", json!(variable))
        .with_property("value", value)
}

pub fn signal(id: &str, name: &str) -> ActivityDefinition {
    activity(id, "SignalReceived")
        .with_property("signal", json!(name))
        .with_property("output", json!(id))
}

pub fn connect(source: &str, target: &str, outcome: &str) -> ConnectionDefinition {
    ConnectionDefinition::new(source, target, outcome)
}

pub fn request(
    definition_id: &str,
    activities: Vec<ActivityDefinition>,
    connections: Vec<ConnectionDefinition>,
) -> SaveWorkflowDefinition {
    SaveWorkflowDefinition {
        workflow_definition_id: Some(definition_id.to_string()),
        activities,
        connections,
        ..Default::default()
    }
}

/// `start -> wait(approved) -> done`, publishing on save.
pub fn approval_flow(definition_id: &str) -> SaveWorkflowDefinition {
    let mut req = request(
        definition_id,
        vec![
            set_variable("start", "stage", json!("submitted")),
            signal("wait", "approved"),
            set_variable("done", "stage", json!("approved")),
        ],
        vec![connect("start", "wait", "Done"), connect("wait", "done", "Done")],
    );
    req.publish = true;
    req
}

pub fn approved() -> Value {
    json!({ "signal": "approved" })
}
