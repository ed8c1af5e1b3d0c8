// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity execution contract and the type registry.
//!
//! An activity's `type` string names an [`ActivityType`] registered in an
//! [`ActivityRegistry`]. Types are resolved once when a definition's graph is
//! loaded, not per step.

mod builtin;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use trellis_dsl::{ActivityDefinition, Variables};

pub use builtin::{Fault, Finish, Fork, If, Join, SetVariable, SignalReceived, Switch};

/// The outcome most activities produce on success.
pub const DONE: &str = "Done";

/// How an activity with several inbound connections is scheduled.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum JoinMode {
    /// Scheduled once per inbound signal
    #[default]
    Each,
    /// Scheduled once every distinct inbound source has fired, then reset
    WaitAll,
    /// Scheduled on the first inbound signal of a round; the rest are absorbed
    /// until every inbound source has fired, then reset
    WaitAny,
}

/// What an activity asks the scheduler to park on.
#[derive(Debug, Clone, PartialEq)]
pub struct BookmarkSpec {
    /// Trigger-specific matching payload
    pub payload: Value,
    /// Correlation a trigger must carry to match
    pub correlation_id: Option<String>,
}

/// What executing an activity produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityResult {
    /// Follow the connections labeled with these outcomes (possibly none)
    Outcomes(Vec<String>),
    /// Park this branch on the given bookmarks
    Suspend(Vec<BookmarkSpec>),
    /// Fail the instance with this detail
    Fault(String),
}

impl ActivityResult {
    /// The single outcome [`DONE`].
    pub fn done() -> Self {
        Self::Outcomes(vec![DONE.to_string()])
    }

    /// A single named outcome.
    pub fn outcome(name: impl Into<String>) -> Self {
        Self::Outcomes(vec![name.into()])
    }

    /// Park on one bookmark.
    pub fn suspend(payload: Value, correlation_id: Option<String>) -> Self {
        Self::Suspend(vec![BookmarkSpec {
            payload,
            correlation_id,
        }])
    }
}

/// Everything an activity may read or change while it runs.
pub struct ActivityContext<'a> {
    /// Running instance
    pub instance_id: &'a str,
    /// Instance correlation, if any
    pub correlation_id: Option<&'a str>,
    /// The activity's definition, including its properties
    pub activity: &'a ActivityDefinition,
    /// Instance variables
    pub variables: &'a mut Variables,
    /// Start input of the instance
    pub input: &'a BTreeMap<String, Value>,
    /// Trigger payload, when the activity was resumed or started by a trigger
    pub trigger: Option<&'a Value>,
}

/// Executable behavior behind an activity `type`.
#[async_trait]
pub trait ActivityType: Send + Sync {
    /// Name used in `ActivityDefinition::activity_type`.
    fn type_name(&self) -> &str;

    /// Outcomes this activity can produce, given its configuration.
    fn outcomes(&self, activity: &ActivityDefinition) -> Vec<String>;

    /// Scheduling of inbound connections.
    fn join_mode(&self, _activity: &ActivityDefinition) -> JoinMode {
        JoinMode::Each
    }

    /// Run the activity. An `Err` faults the instance.
    async fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<ActivityResult>;
}

/// Maps type names to executable behavior.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    types: HashMap<String, Arc<dyn ActivityType>>,
}

impl std::fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

impl ActivityRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in activity type.
    pub fn with_builtins() -> Self {
        Self::new()
            .with(SetVariable)
            .with(If)
            .with(Switch)
            .with(Fork)
            .with(Join)
            .with(SignalReceived)
            .with(Fault)
            .with(Finish)
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, activity: impl ActivityType + 'static) -> Self {
        self.register(Arc::new(activity));
        self
    }

    /// Add or replace a type.
    pub fn register(&mut self, activity: Arc<dyn ActivityType>) {
        self.types.insert(activity.type_name().to_string(), activity);
    }

    /// Look up a type.
    pub fn get(&self, type_name: &str) -> Option<Arc<dyn ActivityType>> {
        self.types.get(type_name).cloned()
    }

    /// Whether a type is registered.
    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
