// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance state, bookmarks and the execution journal.
//!
//! A [`WorkflowInstance`] is the single source of truth for one execution: its
//! status, variables, pending frontier and outstanding bookmarks are saved together.
//! The bookmark collection in the store is a lookup index over the bookmarks the
//! instance holds; an index entry whose instance no longer holds it is stale and is
//! ignored by resumption.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};
use trellis_dsl::{Variables, WorkflowDefinition};

use crate::error::{CoreError, Result};
use crate::specification::{Entity, Field, FieldKind, Scalar, fields};

// ============================================================================
// Status
// ============================================================================

/// Execution status of an instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WorkflowStatus {
    /// Created, not yet started
    Idle,
    /// A scheduler run owns the instance
    Running,
    /// Parked on one or more bookmarks
    Suspended,
    /// Frontier drained without a fault
    Finished,
    /// An activity failed
    Faulted,
    /// Cancelled on request
    Cancelled,
}

impl WorkflowStatus {
    /// Statuses that still occupy a singleton slot.
    pub const NON_TERMINAL: [WorkflowStatus; 3] = [Self::Idle, Self::Running, Self::Suspended];

    /// Finished, Faulted or Cancelled.
    pub fn is_terminal(self) -> bool {
        !Self::NON_TERMINAL.contains(&self)
    }

    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Idle, Cancelled)
                | (Running, Suspended)
                | (Running, Finished)
                | (Running, Faulted)
                | (Running, Cancelled)
                | (Suspended, Running)
                | (Suspended, Faulted)
                | (Suspended, Cancelled)
        )
    }
}

// ============================================================================
// Instance
// ============================================================================

/// An activity waiting in the frontier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledActivity {
    /// Activity to execute
    pub activity_id: String,
    /// Trigger payload delivered to the activity, if it was resumed or started by one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Value>,
}

impl ScheduledActivity {
    /// Schedule without a trigger payload.
    pub fn new(activity_id: impl Into<String>) -> Self {
        Self {
            activity_id: activity_id.into(),
            trigger: None,
        }
    }

    /// Schedule with a trigger payload.
    pub fn triggered(activity_id: impl Into<String>, trigger: Value) -> Self {
        Self {
            activity_id: activity_id.into(),
            trigger: Some(trigger),
        }
    }
}

/// Why an instance faulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowFault {
    /// The activity that failed
    pub activity_id: String,
    /// Its type
    pub activity_type: String,
    /// Error detail
    pub message: String,
    /// Activities still scheduled when the fault happened, in frontier order
    pub pending_frontier: Vec<String>,
    /// When the fault was recorded
    pub faulted_at: DateTime<Utc>,
}

/// What happened when an activity ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepEvent {
    /// Produced outcomes
    Completed,
    /// Parked on bookmarks
    Suspended,
    /// Failed
    Faulted,
}

/// One executed activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    /// Position in the journal, starting at 1
    pub sequence: u64,
    /// Executed activity
    pub activity_id: String,
    /// Its type
    pub activity_type: String,
    /// What the step did
    pub event: StepEvent,
    /// Outcomes produced (empty unless completed)
    pub outcomes: Vec<String>,
    /// When the step finished
    pub timestamp: DateTime<Utc>,
}

/// Join bookkeeping for one target activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinState {
    /// Inbound sources that have fired this round
    pub arrived: BTreeSet<String>,
    /// The target was already scheduled this round
    pub fired: bool,
}

/// One execution of a workflow definition version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    /// Instance identifier
    pub id: String,
    /// Definition family
    pub definition_id: String,
    /// Exact definition version this instance runs
    pub definition_version_id: String,
    /// Version number of that definition
    pub version: i32,
    /// Used to find related instances and to match bookmarks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    status: WorkflowStatus,
    /// Current variable values
    pub variables: Variables,
    /// Start input
    #[serde(default)]
    pub input: BTreeMap<String, Value>,
    /// Caller-supplied metadata
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    frontier: VecDeque<ScheduledActivity>,
    #[serde(default)]
    bookmarks: Vec<Bookmark>,
    #[serde(default)]
    joins: BTreeMap<String, JoinState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fault: Option<WorkflowFault>,
    #[serde(default)]
    execution_log: Vec<ExecutionLogEntry>,
    /// When the instance was created
    pub created_at: DateTime<Utc>,
    /// Last status change or checkpoint
    pub updated_at: DateTime<Utc>,
    /// When a terminal status was reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    revision: u64,
}

impl WorkflowInstance {
    /// A new idle instance seeded with the definition's variables.
    pub fn new(
        id: impl Into<String>,
        definition: &WorkflowDefinition,
        correlation_id: Option<String>,
        input: BTreeMap<String, Value>,
        properties: BTreeMap<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            definition_id: definition.id.clone(),
            definition_version_id: definition.definition_version_id.clone(),
            version: definition.version,
            correlation_id,
            status: WorkflowStatus::Idle,
            variables: definition.variables.clone(),
            input,
            properties,
            frontier: VecDeque::new(),
            bookmarks: Vec::new(),
            joins: BTreeMap::new(),
            fault: None,
            execution_log: Vec::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
            revision: 0,
        }
    }

    /// Current status.
    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    /// Move through the state machine. The only way status changes.
    pub fn transition(&mut self, next: WorkflowStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                instance_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Scheduled-but-not-executed activities, in execution order.
    pub fn frontier(&self) -> impl Iterator<Item = &ScheduledActivity> {
        self.frontier.iter()
    }

    /// Bookmarks the instance is parked on.
    pub fn bookmarks(&self) -> &[Bookmark] {
        &self.bookmarks
    }

    /// Fault detail, when faulted.
    pub fn fault(&self) -> Option<&WorkflowFault> {
        self.fault.as_ref()
    }

    /// Executed activities, oldest first.
    pub fn execution_log(&self) -> &[ExecutionLogEntry] {
        &self.execution_log
    }

    pub(crate) fn schedule(&mut self, activity: ScheduledActivity) {
        self.frontier.push_back(activity);
    }

    pub(crate) fn next_scheduled(&mut self) -> Option<ScheduledActivity> {
        self.frontier.pop_front()
    }

    pub(crate) fn push_front(&mut self, activity: ScheduledActivity) {
        self.frontier.push_front(activity);
    }

    pub(crate) fn drain_frontier(&mut self) -> Vec<String> {
        self.frontier.drain(..).map(|a| a.activity_id).collect()
    }

    pub(crate) fn join_state(&mut self, activity_id: &str) -> &mut JoinState {
        self.joins.entry(activity_id.to_string()).or_default()
    }

    pub(crate) fn reset_join(&mut self, activity_id: &str) {
        self.joins.remove(activity_id);
    }

    pub(crate) fn add_bookmark(&mut self, bookmark: Bookmark) {
        self.bookmarks.push(bookmark);
    }

    pub(crate) fn take_bookmark(&mut self, bookmark_id: &str) -> Option<Bookmark> {
        let pos = self.bookmarks.iter().position(|b| b.id == bookmark_id)?;
        Some(self.bookmarks.remove(pos))
    }

    pub(crate) fn clear_bookmarks(&mut self) -> Vec<Bookmark> {
        std::mem::take(&mut self.bookmarks)
    }

    pub(crate) fn set_fault(&mut self, fault: WorkflowFault) {
        self.fault = Some(fault);
    }

    pub(crate) fn record_step(
        &mut self,
        activity_id: &str,
        activity_type: &str,
        event: StepEvent,
        outcomes: Vec<String>,
    ) {
        let sequence = self.execution_log.len() as u64 + 1;
        self.execution_log.push(ExecutionLogEntry {
            sequence,
            activity_id: activity_id.to_string(),
            activity_type: activity_type.to_string(),
            event,
            outcomes,
            timestamp: Utc::now(),
        });
    }
}

impl Entity for WorkflowInstance {
    const COLLECTION: &'static str = "workflow_instances";
    const FIELDS: &'static [Field] = &[
        Field::new(fields::ID, FieldKind::Str),
        Field::new(fields::DEFINITION_ID, FieldKind::Str),
        Field::new("definition_version_id", FieldKind::Str),
        Field::new(fields::VERSION, FieldKind::Int),
        Field::new(fields::CORRELATION_ID, FieldKind::Str),
        Field::new(fields::STATUS, FieldKind::Str),
        Field::new(fields::CREATED_AT, FieldKind::Int),
        Field::new("updated_at", FieldKind::Int),
    ];

    fn id(&self) -> &str {
        &self.id
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    fn property(&self, field: &str) -> Option<Scalar> {
        match field {
            fields::ID => Some(self.id.as_str().into()),
            fields::DEFINITION_ID => Some(self.definition_id.as_str().into()),
            "definition_version_id" => Some(self.definition_version_id.as_str().into()),
            fields::VERSION => Some(self.version.into()),
            fields::CORRELATION_ID => Some(self.correlation_id.clone().into()),
            fields::STATUS => Some(self.status.to_string().into()),
            fields::CREATED_AT => Some(self.created_at.timestamp_millis().into()),
            "updated_at" => Some(self.updated_at.timestamp_millis().into()),
            _ => None,
        }
    }
}

// ============================================================================
// Bookmarks
// ============================================================================

/// A point where an instance waits for an external trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    /// Bookmark identifier
    pub id: String,
    /// Owning instance
    pub instance_id: String,
    /// Definition family of the owning instance
    pub definition_id: String,
    /// Activity that created the bookmark and resumes when it is claimed
    pub activity_id: String,
    /// Type of that activity, used for trigger dispatch
    pub activity_type: String,
    /// Trigger-specific matching payload
    pub payload: Value,
    /// Hash of the canonical payload JSON
    pub payload_hash: String,
    /// Correlation the trigger must carry, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// When the bookmark was created
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    revision: u64,
}

impl Bookmark {
    /// Create a bookmark for `instance` at `activity_id`.
    pub fn new(
        instance: &WorkflowInstance,
        activity_id: &str,
        activity_type: &str,
        payload: Value,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance.id.clone(),
            definition_id: instance.definition_id.clone(),
            activity_id: activity_id.to_string(),
            activity_type: activity_type.to_string(),
            payload_hash: payload_hash(&payload),
            payload,
            correlation_id,
            created_at: Utc::now(),
            revision: 0,
        }
    }

    /// A fresh index entry for this bookmark (revision reset for insertion).
    pub(crate) fn reindexed(&self) -> Self {
        Self {
            revision: 0,
            ..self.clone()
        }
    }
}

/// SHA-256 of the payload's canonical JSON, hex encoded.
///
/// `serde_json` maps keep keys sorted, so equal payloads hash equally regardless
/// of the order their keys were written in.
pub fn payload_hash(payload: &Value) -> String {
    let canonical = payload.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl Entity for Bookmark {
    const COLLECTION: &'static str = "bookmarks";
    const FIELDS: &'static [Field] = &[
        Field::new(fields::ID, FieldKind::Str),
        Field::new("instance_id", FieldKind::Str),
        Field::new(fields::DEFINITION_ID, FieldKind::Str),
        Field::new("activity_id", FieldKind::Str),
        Field::new("activity_type", FieldKind::Str),
        Field::new("payload_hash", FieldKind::Str),
        Field::new(fields::CORRELATION_ID, FieldKind::Str),
        Field::new(fields::CREATED_AT, FieldKind::Int),
    ];

    fn id(&self) -> &str {
        &self.id
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    fn property(&self, field: &str) -> Option<Scalar> {
        match field {
            fields::ID => Some(self.id.as_str().into()),
            "instance_id" => Some(self.instance_id.as_str().into()),
            fields::DEFINITION_ID => Some(self.definition_id.as_str().into()),
            "activity_id" => Some(self.activity_id.as_str().into()),
            "activity_type" => Some(self.activity_type.as_str().into()),
            "payload_hash" => Some(self.payload_hash.as_str().into()),
            fields::CORRELATION_ID => Some(self.correlation_id.clone().into()),
            fields::CREATED_AT => Some(self.created_at.timestamp_millis().into()),
            _ => None,
        }
    }
}
