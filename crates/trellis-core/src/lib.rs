// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trellis Core - Workflow Execution Engine
//!
//! This crate runs versioned workflow definitions as long-lived instances. An
//! instance executes activities until it reaches a point that needs an external
//! event, persists itself behind a bookmark, and continues when a matching
//! trigger resumes that bookmark, possibly in another process.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Host application / CLI                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         WorkflowRuntime                                  │
//! │   (versions, singleton, bookmark claims, retention, run limiting)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                              │
//!           │ ExecutableGraph                              │ Specification
//!           ▼                                              ▼
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │      Scheduler        │                    │   Store<E> (memory/SQLite)  │
//! │  frontier, joins,     │                    │  definitions, instances,    │
//! │  activity execution   │                    │  bookmark index             │
//! └───────────────────────┘                    └─────────────────────────────┘
//!           │
//!           ▼
//! ┌───────────────────────┐
//! │   ActivityRegistry    │
//! │  built-in + custom    │
//! └───────────────────────┘
//! ```
//!
//! # Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `save_definition` | Validate and save a designer request as a draft or new version |
//! | `publish` / `retract` | Move the published flag within a definition family |
//! | `start_workflow` | Create an instance of the selected version and run it |
//! | `resume` | Claim the oldest bookmark matching activity, payload and correlation |
//! | `dispatch_trigger` | Resume every bookmark of an activity type with a matching payload |
//! | `cancel_instance` | Cancel an idle, suspended or running instance |
//! | `recover_instances` | Re-run instances whose run was interrupted |
//!
//! # Instance Status State Machine
//!
//! ```text
//!                     ┌──────┐
//!                     │ IDLE │
//!                     └──┬───┘
//!                        │ start
//!                        ▼
//!                   ┌─────────┐   bookmark   ┌───────────┐
//!        ┌──────────│ RUNNING │─────────────►│ SUSPENDED │
//!        │          └────┬────┘◄─────────────└─────┬─────┘
//!        │               │         resume          │
//!   fault│       complete│                   cancel│
//!        ▼               ▼                         ▼
//!   ┌─────────┐    ┌──────────┐             ┌───────────┐
//!   │ FAULTED │    │ FINISHED │             │ CANCELLED │
//!   └─────────┘    └──────────┘             └───────────┘
//! ```
//!
//! `Idle` and `Running` instances can be cancelled as well. Terminal statuses
//! never change again. A run that fails to store its result faults the
//! instance; one cut off entirely leaves it `Running` until
//! `recover_instance` runs it again or `cancel_instance` ends it.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TRELLIS_DATABASE_URL` | No | in-memory | SQLite connection string |
//! | `TRELLIS_MAX_CONCURRENT_RUNS` | No | `32` | Maximum concurrent scheduler runs |
//! | `TRELLIS_MAX_STEPS_PER_RUN` | No | `10000` | Step budget per scheduler run |
//!
//! # Modules
//!
//! - [`activity`]: Activity behavior trait, registry and built-in activities
//! - [`runtime`]: The runtime and its builder
//! - [`scheduler`]: Per-instance execution loop
//! - [`persistence`]: Specification-driven stores
//! - [`validation`]: Definition graph validation

#![deny(missing_docs)]

/// Activity behavior, registry and built-in activity types.
pub mod activity;

/// User and system cancellation tokens.
pub mod cancellation;

/// Runtime configuration loaded from environment variables.
pub mod config;

/// Definition storage mapping and version resolution.
pub mod definitions;

/// Error types with stable error codes.
pub mod error;

/// Executable graphs resolved against the activity registry.
pub mod graph;

/// Workflow instances, their status machine and bookmarks.
pub mod instance;

/// Embedded database migrations.
pub mod migrations;

/// Start and resume parameters and execution results.
pub mod params;

/// Store trait with in-memory and SQLite implementations.
pub mod persistence;

/// The runtime: versioning, singleton, bookmark claims and retention.
pub mod runtime;

/// Scheduler loop for one instance over one graph.
pub mod scheduler;

/// Composable queries over stored entities.
pub mod specification;

/// Structural validation of definitions and definition families.
pub mod validation;

pub use activity::{ActivityContext, ActivityRegistry, ActivityResult, ActivityType, JoinMode};
pub use cancellation::CancellationTokens;
pub use config::Config;
pub use error::{CoreError, ErrorKind, Result};
pub use instance::{Bookmark, WorkflowInstance, WorkflowStatus};
pub use params::{
    CancelOutcome, ResumeWorkflowParams, StartWorkflowParams, WorkflowExecutionResult,
};
pub use runtime::{WorkflowRuntime, WorkflowRuntimeBuilder};
pub use specification::{OrderBy, Page, Specification};

pub use trellis_dsl::{
    ActivityDefinition, ConnectionDefinition, SaveWorkflowDefinition, VersionOptions,
    WorkflowDefinition, WorkflowPersistenceBehavior,
};
