// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Start and resume requests, and what they return.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use trellis_dsl::{Variables, VersionOptions};

use crate::cancellation::CancellationTokens;
use crate::instance::{Bookmark, WorkflowFault, WorkflowInstance, WorkflowStatus};

/// Parameters for [`WorkflowRuntime::start_workflow`](crate::WorkflowRuntime::start_workflow).
#[derive(Debug, Clone)]
pub struct StartWorkflowParams {
    /// Definition family to start
    pub definition_id: String,
    /// Which version to run
    pub version: VersionOptions,
    /// Correlation stored on the instance and its bookmarks
    pub correlation_id: Option<String>,
    /// Start input, readable by activities
    pub input: BTreeMap<String, Value>,
    /// Caller metadata stored on the instance
    pub properties: BTreeMap<String, Value>,
    /// Start at this activity with the input as its trigger payload
    pub trigger_activity_id: Option<String>,
    /// Caller-chosen id; makes the start idempotent
    pub instance_id: Option<String>,
    /// User and system cancellation
    pub cancellation: CancellationTokens,
}

impl StartWorkflowParams {
    /// Start the default version of `definition_id` with no input.
    pub fn new(definition_id: impl Into<String>) -> Self {
        Self {
            definition_id: definition_id.into(),
            version: VersionOptions::default(),
            correlation_id: None,
            input: BTreeMap::new(),
            properties: BTreeMap::new(),
            trigger_activity_id: None,
            instance_id: None,
            cancellation: CancellationTokens::new(),
        }
    }

    /// Select a version.
    pub fn version(mut self, version: VersionOptions) -> Self {
        self.version = version;
        self
    }

    /// Set the correlation id.
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Add one input entry.
    pub fn input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input.insert(key.into(), value);
        self
    }

    /// Add one property.
    pub fn property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Start from a specific activity.
    pub fn trigger_activity(mut self, activity_id: impl Into<String>) -> Self {
        self.trigger_activity_id = Some(activity_id.into());
        self
    }

    /// Use a caller-chosen instance id.
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Use these cancellation tokens.
    pub fn cancellation(mut self, cancellation: CancellationTokens) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// Parameters for [`WorkflowRuntime::resume`](crate::WorkflowRuntime::resume).
///
/// A bookmark matches when its activity id and payload are equal to the request's
/// and, when given, its correlation id and instance id are too.
#[derive(Debug, Clone)]
pub struct ResumeWorkflowParams {
    /// Activity the bookmark was created at
    pub activity_id: String,
    /// Bookmark payload to match
    pub payload: Value,
    /// Restrict to bookmarks with this correlation id
    pub correlation_id: Option<String>,
    /// Restrict to one instance
    pub instance_id: Option<String>,
    /// Trigger input delivered to the resumed activity
    pub input: BTreeMap<String, Value>,
    /// User and system cancellation
    pub cancellation: CancellationTokens,
}

impl ResumeWorkflowParams {
    /// Resume the bookmark at `activity_id` whose payload equals `payload`.
    pub fn new(activity_id: impl Into<String>, payload: Value) -> Self {
        Self {
            activity_id: activity_id.into(),
            payload,
            correlation_id: None,
            instance_id: None,
            input: BTreeMap::new(),
            cancellation: CancellationTokens::new(),
        }
    }

    /// Restrict by correlation id.
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Restrict to one instance.
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Add one trigger input entry.
    pub fn input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input.insert(key.into(), value);
        self
    }

    /// Use these cancellation tokens.
    pub fn cancellation(mut self, cancellation: CancellationTokens) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// Where an instance ended up after a start or resume.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionResult {
    /// Instance that ran
    pub instance_id: String,
    /// Its definition family
    pub definition_id: String,
    /// Version it ran
    pub version: i32,
    /// Status after the run
    pub status: WorkflowStatus,
    /// Outstanding bookmarks
    pub bookmarks: Vec<Bookmark>,
    /// Fault detail, when faulted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<WorkflowFault>,
    /// Variables after the run
    pub variables: Variables,
}

impl From<&WorkflowInstance> for WorkflowExecutionResult {
    fn from(instance: &WorkflowInstance) -> Self {
        Self {
            instance_id: instance.id.clone(),
            definition_id: instance.definition_id.clone(),
            version: instance.version,
            status: instance.status(),
            bookmarks: instance.bookmarks().to_vec(),
            fault: instance.fault().cloned(),
            variables: instance.variables.clone(),
        }
    }
}

/// What [`WorkflowRuntime::cancel_instance`](crate::WorkflowRuntime::cancel_instance) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The instance was idle or suspended and is now cancelled
    Cancelled,
    /// The instance is running; it stops at its next step boundary
    Requested,
}
