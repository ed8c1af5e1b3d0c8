// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for instance cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use serde_json::json;
use tokio::sync::Notify;
use trellis_core::{
    ActivityContext, ActivityDefinition, ActivityRegistry, ActivityResult, ActivityType,
    CancelOutcome, CancellationTokens, CoreError, ResumeWorkflowParams, Specification,
    StartWorkflowParams, WorkflowRuntime, WorkflowStatus,
};

/// Blocks until released, so a run can be observed mid-flight.
struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl ActivityType for Gate {
    fn type_name(&self) -> &str {
        "Gate"
    }

    fn outcomes(&self, _activity: &ActivityDefinition) -> Vec<String> {
        vec!["Done".to_string()]
    }

    async fn execute(&self, _ctx: &mut ActivityContext<'_>) -> anyhow::Result<ActivityResult> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(ActivityResult::done())
    }
}

fn gated_runtime() -> (Arc<WorkflowRuntime>, Arc<Notify>, Arc<Notify>) {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let registry = ActivityRegistry::with_builtins().with(Gate {
        entered: entered.clone(),
        release: release.clone(),
    });
    let runtime = WorkflowRuntime::builder()
        .in_memory()
        .registry(registry)
        .build()
        .unwrap();
    (Arc::new(runtime), entered, release)
}

fn gated_flow() -> trellis_core::SaveWorkflowDefinition {
    let mut req = request(
        "gated",
        vec![
            activity("gate", "Gate"),
            set_variable("after", "reached", json!(true)),
        ],
        vec![connect("gate", "after", "Done")],
    );
    req.publish = true;
    req
}

#[tokio::test]
async fn test_cancel_suspended_instance() {
    let ctx = TestContext::in_memory();
    ctx.runtime.save_definition(approval_flow("approval")).await.unwrap();
    let started = ctx
        .runtime
        .start_workflow(StartWorkflowParams::new("approval"))
        .await
        .unwrap();

    let outcome = ctx.runtime.cancel_instance(&started.instance_id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let instance = ctx
        .runtime
        .get_instance(&started.instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status(), WorkflowStatus::Cancelled);
    assert!(instance.bookmarks().is_empty());
    assert!(instance.finished_at.is_some());
    assert!(
        ctx.runtime
            .find_bookmarks(&Specification::all(), None, None)
            .await
            .unwrap()
            .is_empty()
    );

    let err = ctx
        .runtime
        .resume(ResumeWorkflowParams::new("wait", approved()))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::BookmarkNotFound { .. }));

    let err = ctx.runtime.cancel_instance(&started.instance_id).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_cancel_unknown_instance() {
    let ctx = TestContext::in_memory();
    let err = ctx.runtime.cancel_instance("missing").await.unwrap_err();
    assert!(matches!(err, CoreError::InstanceNotFound { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_running_instance_stops_at_step_boundary() {
    let (runtime, entered, release) = gated_runtime();
    runtime.save_definition(gated_flow()).await.unwrap();

    let run = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            runtime
                .start_workflow(StartWorkflowParams::new("gated").instance_id("g-1"))
                .await
        })
    };
    entered.notified().await;
    assert_eq!(runtime.running_instances(), vec!["g-1".to_string()]);

    let err = runtime.delete_instance("g-1").await.unwrap_err();
    assert!(matches!(err, CoreError::InstanceBusy { .. }));

    let outcome = runtime.cancel_instance("g-1").await.unwrap();
    assert_eq!(outcome, CancelOutcome::Requested);
    release.notify_one();

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run finishes")
        .unwrap()
        .unwrap();
    assert_eq!(result.status, WorkflowStatus::Cancelled);
    assert_eq!(result.variables.get("reached"), None);
    assert!(runtime.running_instances().is_empty());

    let stored = runtime.get_instance("g-1").await.unwrap().unwrap();
    assert_eq!(stored.status(), WorkflowStatus::Cancelled);
    assert_eq!(stored.frontier().count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_user_token_cancels_run() {
    let (runtime, entered, release) = gated_runtime();
    runtime.save_definition(gated_flow()).await.unwrap();

    let tokens = CancellationTokens::new();
    let run = {
        let runtime = runtime.clone();
        let tokens = tokens.clone();
        tokio::spawn(async move {
            runtime
                .start_workflow(StartWorkflowParams::new("gated").cancellation(tokens))
                .await
        })
    };
    entered.notified().await;
    tokens.user.cancel();
    release.notify_one();

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, WorkflowStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_system_cancel_of_one_run_leaves_caller_token_alone() {
    let (runtime, entered, release) = gated_runtime();
    runtime.save_definition(gated_flow()).await.unwrap();

    let tokens = CancellationTokens::new();
    let run = {
        let runtime = runtime.clone();
        let tokens = tokens.clone();
        tokio::spawn(async move {
            runtime
                .start_workflow(
                    StartWorkflowParams::new("gated")
                        .instance_id("g-2")
                        .cancellation(tokens),
                )
                .await
        })
    };
    entered.notified().await;
    runtime.cancel_instance("g-2").await.unwrap();
    release.notify_one();

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, WorkflowStatus::Cancelled);
    assert!(!tokens.is_cancelled());
}
