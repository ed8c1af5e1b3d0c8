// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for definition versioning and validation.

mod common;

use common::*;
use serde_json::json;
use trellis_core::specification::fields;
use trellis_core::validation::ValidationError;
use trellis_core::{
    CoreError, OrderBy, ResumeWorkflowParams, Specification, StartWorkflowParams,
    VersionOptions, WorkflowStatus,
};

async fn family_flags(ctx: &TestContext, definition_id: &str) -> Vec<(i32, bool, bool)> {
    ctx.runtime
        .find_definitions(
            &Specification::by_definition(definition_id),
            Some(&OrderBy::asc(fields::VERSION)),
            None,
        )
        .await
        .unwrap()
        .iter()
        .map(|d| (d.version, d.is_latest, d.is_published))
        .collect()
}

#[tokio::test]
async fn test_start_prefers_published_over_newer_draft() {
    let ctx = TestContext::in_memory();

    let mut v1 = request("orders", vec![set_variable("a", "v", json!(1))], vec![]);
    v1.publish = true;
    ctx.runtime.save_definition(v1).await.unwrap();

    let v2 = request("orders", vec![set_variable("a", "v", json!(2))], vec![]);
    let saved = ctx.runtime.save_definition(v2).await.unwrap();
    assert_eq!(saved.version, 2);
    assert_eq!(family_flags(&ctx, "orders").await, vec![(1, false, true), (2, true, false)]);

    // Published wins while a newer draft exists
    let result = ctx
        .runtime
        .start_workflow(StartWorkflowParams::new("orders"))
        .await
        .unwrap();
    assert_eq!(result.version, 1);
    assert_eq!(result.variables.get("v"), Some(&json!(1)));

    // Explicit selectors
    let latest = ctx
        .runtime
        .start_workflow(StartWorkflowParams::new("orders").version(VersionOptions::Latest))
        .await
        .unwrap();
    assert_eq!(latest.version, 2);

    ctx.runtime.publish("orders").await.unwrap();
    assert_eq!(family_flags(&ctx, "orders").await, vec![(1, false, false), (2, true, true)]);

    let result = ctx
        .runtime
        .start_workflow(StartWorkflowParams::new("orders"))
        .await
        .unwrap();
    assert_eq!(result.version, 2);
    assert_eq!(result.status, WorkflowStatus::Finished);
}

#[tokio::test]
async fn test_retract_falls_back_to_latest() {
    let ctx = TestContext::in_memory();
    let mut v1 = request("orders", vec![set_variable("a", "v", json!(1))], vec![]);
    v1.publish = true;
    ctx.runtime.save_definition(v1).await.unwrap();
    ctx.runtime
        .save_definition(request("orders", vec![set_variable("a", "v", json!(2))], vec![]))
        .await
        .unwrap();

    ctx.runtime.retract("orders").await.unwrap();
    let definition = ctx
        .runtime
        .get_definition("orders", VersionOptions::LatestOrPublished)
        .await
        .unwrap();
    assert_eq!(definition.version, 2);

    let err = ctx
        .runtime
        .get_definition("orders", VersionOptions::Published)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DefinitionNotFound { .. }));
}

#[tokio::test]
async fn test_invalid_graph_leaves_previous_version_untouched() {
    let ctx = TestContext::in_memory();
    let good = ctx
        .runtime
        .save_definition(request(
            "orders",
            vec![set_variable("a", "v", json!(1)), activity("b", "Finish")],
            vec![connect("a", "b", "Done")],
        ))
        .await
        .unwrap();

    let err = ctx
        .runtime
        .save_definition(request(
            "orders",
            vec![set_variable("a", "v", json!(1)), activity("b", "Finsh")],
            vec![connect("a", "ghost", "Done"), connect("a", "b", "Nope")],
        ))
        .await
        .unwrap_err();

    let CoreError::Validation { errors } = err else {
        panic!("expected a validation error, got {:?}", err);
    };
    assert!(errors.iter().any(|e| matches!(
        e,
        ValidationError::UnknownActivityType { activity_type, .. } if activity_type == "Finsh"
    )));
    assert!(errors.iter().any(|e| matches!(
        e,
        ValidationError::MissingConnectionEndpoint { missing_activity_id, .. } if missing_activity_id == "ghost"
    )));
    assert!(errors.iter().any(|e| matches!(
        e,
        ValidationError::UndeclaredOutcome { outcome, .. } if outcome == "Nope"
    )));

    let stored = ctx
        .runtime
        .get_definition("orders", VersionOptions::Latest)
        .await
        .unwrap();
    assert_eq!(stored.activities, good.activities);
    assert_eq!(stored.connections, good.connections);
}

#[tokio::test]
async fn test_empty_workflow_is_rejected() {
    let ctx = TestContext::in_memory();
    let err = ctx
        .runtime
        .save_definition(request("empty", vec![], vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
    assert!(err.to_string().contains("E004"));
    assert!(family_flags(&ctx, "empty").await.is_empty());
}

#[tokio::test]
async fn test_published_version_is_never_edited() {
    let ctx = TestContext::in_memory();
    let mut v1 = request("orders", vec![set_variable("a", "v", json!(1))], vec![]);
    v1.publish = true;
    ctx.runtime.save_definition(v1).await.unwrap();

    let mut edit = request("orders", vec![set_variable("a", "v", json!(9))], vec![]);
    edit.publish = true;
    let v2 = ctx.runtime.save_definition(edit).await.unwrap();
    assert_eq!(v2.version, 2);

    let v1 = ctx
        .runtime
        .get_definition("orders", VersionOptions::SpecificVersion(1))
        .await
        .unwrap();
    assert_eq!(v1.activities[0].property("value"), Some(&json!(1)));
    assert_eq!(family_flags(&ctx, "orders").await, vec![(1, false, false), (2, true, true)]);
}

#[tokio::test]
async fn test_draft_in_use_is_saved_as_new_version() {
    let ctx = TestContext::in_memory();
    let mut draft = approval_flow("approval");
    draft.publish = false;
    ctx.runtime.save_definition(draft.clone()).await.unwrap();

    let parked = ctx
        .runtime
        .start_workflow(StartWorkflowParams::new("approval").version(VersionOptions::Latest))
        .await
        .unwrap();
    assert_eq!(parked.status, WorkflowStatus::Suspended);
    assert_eq!(parked.version, 1);

    // Same designer request, different behavior after the wait
    draft.activities[2] = set_variable("done", "stage", json!("rewritten"));
    let saved = ctx.runtime.save_definition(draft.clone()).await.unwrap();
    assert_eq!(saved.version, 2);
    assert_eq!(family_flags(&ctx, "approval").await, vec![(1, false, false), (2, true, false)]);

    let resumed = ctx
        .runtime
        .resume(ResumeWorkflowParams::new("wait", approved()))
        .await
        .unwrap();
    assert_eq!(resumed.instance_id, parked.instance_id);
    assert_eq!(resumed.status, WorkflowStatus::Finished);
    assert_eq!(resumed.variables.get("stage"), Some(&json!("approved")));

    // With nothing running on it, the new draft is edited in place again
    draft.activities[2] = set_variable("done", "stage", json!("final"));
    let saved = ctx.runtime.save_definition(draft).await.unwrap();
    assert_eq!(saved.version, 2);
    let v1 = ctx
        .runtime
        .get_definition("approval", VersionOptions::SpecificVersion(1))
        .await
        .unwrap();
    assert_eq!(v1.activities[2].property("value"), Some(&json!("approved")));
}

#[tokio::test]
async fn test_disabled_definition_cannot_start() {
    let ctx = TestContext::in_memory();
    let mut req = request("orders", vec![activity("a", "Finish")], vec![]);
    req.enabled = false;
    ctx.runtime.save_definition(req).await.unwrap();

    let err = ctx
        .runtime
        .start_workflow(StartWorkflowParams::new("orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DefinitionDisabled { .. }));
}

#[tokio::test]
async fn test_delete_definition_removes_family() {
    let ctx = TestContext::in_memory();
    let mut v1 = request("orders", vec![activity("a", "Finish")], vec![]);
    v1.publish = true;
    ctx.runtime.save_definition(v1).await.unwrap();
    ctx.runtime
        .save_definition(request("orders", vec![activity("b", "Finish")], vec![]))
        .await
        .unwrap();

    assert_eq!(ctx.runtime.delete_definition("orders").await.unwrap(), 2);
    let err = ctx.runtime.delete_definition("orders").await.unwrap_err();
    assert!(err.is_not_found());

    let err = ctx
        .runtime
        .start_workflow(StartWorkflowParams::new("orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DefinitionNotFound { .. }));
}

#[tokio::test]
async fn test_concurrent_saves_keep_one_latest() {
    let ctx = std::sync::Arc::new(TestContext::in_memory());
    let mut v1 = request("orders", vec![activity("a", "Finish")], vec![]);
    v1.publish = true;
    ctx.runtime.save_definition(v1).await.unwrap();

    let saves = (0..8).map(|i| {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut req = request("orders", vec![set_variable("a", "v", json!(i))], vec![]);
            req.publish = i % 2 == 0;
            ctx.runtime.save_definition(req).await
        })
    });
    for handle in futures::future::join_all(saves).await {
        handle.unwrap().unwrap();
    }

    let flags = family_flags(&ctx, "orders").await;
    assert_eq!(flags.iter().filter(|(_, latest, _)| *latest).count(), 1);
    assert!(flags.iter().filter(|(_, _, published)| *published).count() <= 1);
}

#[tokio::test]
async fn test_versions_survive_restart() {
    let ctx = TestContext::sqlite().await;
    let mut v1 = request("orders", vec![set_variable("a", "v", json!(1))], vec![]);
    v1.publish = true;
    ctx.runtime.save_definition(v1).await.unwrap();
    ctx.runtime
        .save_definition(request("orders", vec![set_variable("a", "v", json!(2))], vec![]))
        .await
        .unwrap();

    let ctx = ctx.restart().await;
    assert_eq!(family_flags(&ctx, "orders").await, vec![(1, false, true), (2, true, false)]);

    let result = ctx
        .runtime
        .start_workflow(StartWorkflowParams::new("orders"))
        .await
        .unwrap();
    assert_eq!(result.variables.get("v"), Some(&json!(1)));
}
