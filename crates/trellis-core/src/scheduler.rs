// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work-list walk that drives one instance forward.
//!
//! The scheduler pops activities from the instance frontier in FIFO order,
//! executes them, and appends the targets of every connection matching the
//! produced outcomes. It stops when the frontier is empty, an activity suspends,
//! an activity faults, the step budget runs out, or cancellation is observed
//! between steps.
//!
//! All of its state lives on the instance, so running it again from a saved
//! snapshot replays the same steps.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use trellis_dsl::ActivityDefinition;

use crate::activity::{ActivityContext, ActivityResult, JoinMode};
use crate::cancellation::CancellationTokens;
use crate::error::{CoreError, Result};
use crate::graph::ExecutableGraph;
use crate::instance::{
    Bookmark, ScheduledActivity, StepEvent, WorkflowFault, WorkflowInstance, WorkflowStatus,
};

/// Called after every completed step, before the next one starts.
#[async_trait]
pub trait StepObserver: Send {
    /// Inspect or checkpoint the instance.
    async fn after_step(
        &mut self,
        instance: &mut WorkflowInstance,
        activity: &ActivityDefinition,
    ) -> Result<()>;
}

/// Observer that does nothing.
#[derive(Debug, Default)]
pub struct NoopObserver;

#[async_trait]
impl StepObserver for NoopObserver {
    async fn after_step(
        &mut self,
        _instance: &mut WorkflowInstance,
        _activity: &ActivityDefinition,
    ) -> Result<()> {
        Ok(())
    }
}

/// What one run did besides mutating the instance.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Activities executed
    pub steps: u64,
    /// Bookmarks created by this run
    pub created_bookmarks: Vec<Bookmark>,
    /// Bookmarks the instance dropped because it reached a terminal status
    pub dropped_bookmarks: Vec<Bookmark>,
}

/// Drives instances over one executable graph.
pub struct Scheduler<'g> {
    graph: &'g ExecutableGraph,
    max_steps: u64,
}

impl<'g> Scheduler<'g> {
    /// Scheduler with a per-run step budget.
    pub fn new(graph: &'g ExecutableGraph, max_steps: u64) -> Self {
        Self { graph, max_steps }
    }

    /// Run a `Running` instance until it suspends or reaches a terminal status.
    ///
    /// Activity failures are recorded on the instance, not returned. An `Err`
    /// means the instance could not be driven at all (wrong status, or the
    /// observer failed to checkpoint).
    pub async fn run(
        &self,
        instance: &mut WorkflowInstance,
        cancellation: &CancellationTokens,
        observer: &mut dyn StepObserver,
    ) -> Result<RunSummary> {
        if instance.status() != WorkflowStatus::Running {
            return Err(CoreError::InvalidTransition {
                instance_id: instance.id.clone(),
                from: instance.status().to_string(),
                to: WorkflowStatus::Running.to_string(),
            });
        }

        let mut summary = RunSummary::default();
        loop {
            if let Some(source) = cancellation.source() {
                info!(instance_id = %instance.id, ?source, "Cancellation observed");
                instance.drain_frontier();
                summary.created_bookmarks.clear();
                summary.dropped_bookmarks = instance.clear_bookmarks();
                instance.transition(WorkflowStatus::Cancelled)?;
                return Ok(summary);
            }

            let Some(scheduled) = instance.next_scheduled() else {
                break;
            };

            let Some(node) = self.graph.node(&scheduled.activity_id) else {
                let message = format!(
                    "activity '{}' is not part of definition version '{}'",
                    scheduled.activity_id,
                    self.graph.definition_version_id()
                );
                summary.dropped_bookmarks =
                    fault(instance, &scheduled.activity_id, "", message, false)?;
                return Ok(summary);
            };
            let activity = &node.definition;
            let activity_type = activity.activity_type.as_str();

            if summary.steps >= self.max_steps {
                instance.push_front(scheduled);
                let message = format!("step budget of {} activities exhausted", self.max_steps);
                summary.dropped_bookmarks =
                    fault(instance, &activity.activity_id, activity_type, message, false)?;
                return Ok(summary);
            }
            summary.steps += 1;

            let result = {
                let mut ctx = ActivityContext {
                    instance_id: &instance.id,
                    correlation_id: instance.correlation_id.as_deref(),
                    activity,
                    variables: &mut instance.variables,
                    input: &instance.input,
                    trigger: scheduled.trigger.as_ref(),
                };
                node.activity_type.execute(&mut ctx).await
            };

            match result {
                Ok(ActivityResult::Outcomes(outcomes)) => {
                    debug!(
                        instance_id = %instance.id,
                        activity_id = %activity.activity_id,
                        activity_type,
                        ?outcomes,
                        "Activity completed"
                    );
                    instance.record_step(
                        &activity.activity_id,
                        activity_type,
                        StepEvent::Completed,
                        outcomes.clone(),
                    );
                    for outcome in &outcomes {
                        for target in self.graph.targets(&activity.activity_id, outcome) {
                            self.arrive(instance, target, &activity.activity_id);
                        }
                    }
                    observer.after_step(instance, activity).await?;
                }
                Ok(ActivityResult::Suspend(specs)) if !specs.is_empty() => {
                    for spec in specs {
                        let bookmark = Bookmark::new(
                            instance,
                            &activity.activity_id,
                            activity_type,
                            spec.payload,
                            spec.correlation_id,
                        );
                        instance.add_bookmark(bookmark.clone());
                        summary.created_bookmarks.push(bookmark);
                    }
                    instance.record_step(
                        &activity.activity_id,
                        activity_type,
                        StepEvent::Suspended,
                        Vec::new(),
                    );
                    debug!(
                        instance_id = %instance.id,
                        activity_id = %activity.activity_id,
                        "Activity suspended"
                    );
                    break;
                }
                Ok(ActivityResult::Suspend(_)) => {
                    let message = "activity suspended without a bookmark".to_string();
                    summary.created_bookmarks.clear();
                    summary.dropped_bookmarks =
                        fault(instance, &activity.activity_id, activity_type, message, true)?;
                    return Ok(summary);
                }
                Ok(ActivityResult::Fault(message)) => {
                    summary.created_bookmarks.clear();
                    summary.dropped_bookmarks =
                        fault(instance, &activity.activity_id, activity_type, message, true)?;
                    return Ok(summary);
                }
                Err(e) => {
                    summary.created_bookmarks.clear();
                    summary.dropped_bookmarks = fault(
                        instance,
                        &activity.activity_id,
                        activity_type,
                        format!("{:#}", e),
                        true,
                    )?;
                    return Ok(summary);
                }
            }
        }

        // Outstanding bookmarks keep the instance parked even with an empty frontier.
        if instance.bookmarks().is_empty() {
            instance.transition(WorkflowStatus::Finished)?;
            info!(instance_id = %instance.id, steps = summary.steps, "Instance finished");
        } else {
            instance.transition(WorkflowStatus::Suspended)?;
            info!(
                instance_id = %instance.id,
                bookmarks = instance.bookmarks().len(),
                "Instance suspended"
            );
        }
        Ok(summary)
    }

    /// Deliver one inbound signal from `source` to `target`.
    fn arrive(&self, instance: &mut WorkflowInstance, target: &str, source: &str) {
        let Some(node) = self.graph.node(target) else {
            // Unknown targets fault when popped.
            instance.schedule(ScheduledActivity::new(target));
            return;
        };

        let schedule = match node.join_mode {
            JoinMode::Each => true,
            JoinMode::WaitAll => {
                let state = instance.join_state(target);
                state.arrived.insert(source.to_string());
                let complete = node.inbound_sources.is_subset(&state.arrived);
                if complete {
                    instance.reset_join(target);
                }
                complete
            }
            JoinMode::WaitAny => {
                let state = instance.join_state(target);
                state.arrived.insert(source.to_string());
                let first = !state.fired;
                state.fired = true;
                if node.inbound_sources.is_subset(&state.arrived) {
                    instance.reset_join(target);
                }
                first
            }
        };

        if schedule {
            instance.schedule(ScheduledActivity::new(target));
        } else {
            debug!(
                instance_id = %instance.id,
                activity_id = target,
                source,
                "Join waiting"
            );
        }
    }
}

/// Record a fault and move the instance to `Faulted`. Returns the bookmarks it dropped.
pub(crate) fn fault(
    instance: &mut WorkflowInstance,
    activity_id: &str,
    activity_type: &str,
    message: String,
    executed: bool,
) -> Result<Vec<Bookmark>> {
    warn!(
        instance_id = %instance.id,
        activity_id,
        activity_type,
        error = %message,
        "Activity faulted"
    );
    if executed {
        instance.record_step(activity_id, activity_type, StepEvent::Faulted, Vec::new());
    }
    let pending_frontier = instance.drain_frontier();
    instance.set_fault(WorkflowFault {
        activity_id: activity_id.to_string(),
        activity_type: activity_type.to_string(),
        message,
        pending_frontier,
        faulted_at: Utc::now(),
    });
    let dropped = instance.clear_bookmarks();
    instance.transition(WorkflowStatus::Faulted)?;
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use trellis_dsl::{ConnectionDefinition, WorkflowDefinition};

    use super::*;
    use crate::activity::ActivityRegistry;

    fn graph(
        activities: Vec<ActivityDefinition>,
        connections: Vec<ConnectionDefinition>,
    ) -> (WorkflowDefinition, ExecutableGraph) {
        let mut d = WorkflowDefinition::new("flow", "flow:v1");
        d.activities = activities;
        d.connections = connections;
        let g = ExecutableGraph::load(&d, &ActivityRegistry::with_builtins()).unwrap();
        (d, g)
    }

    fn running(definition: &WorkflowDefinition, graph: &ExecutableGraph) -> WorkflowInstance {
        let mut instance =
            WorkflowInstance::new("i-1", definition, None, BTreeMap::new(), BTreeMap::new());
        for id in graph.start_activities() {
            instance.schedule(ScheduledActivity::new(id.clone()));
        }
        instance.transition(WorkflowStatus::Running).unwrap();
        instance
    }

    fn set(id: &str, variable: &str, value: serde_json::Value) -> ActivityDefinition {
        ActivityDefinition::new(id, "SetVariable")
            .with_property("variable", json!(variable))
            .with_property("value", value)
    }

    fn executed(instance: &WorkflowInstance) -> Vec<&str> {
        instance
            .execution_log()
            .iter()
            .map(|e| e.activity_id.as_str())
            .collect()
    }

    async fn run(graph: &ExecutableGraph, instance: &mut WorkflowInstance) -> RunSummary {
        Scheduler::new(graph, 100)
            .run(instance, &CancellationTokens::new(), &mut NoopObserver)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fan_out_schedules_targets_in_connection_order() {
        let (d, g) = graph(
            vec![
                set("a", "x", json!(1)),
                set("b", "y", json!(2)),
                set("c", "z", json!(3)),
            ],
            vec![
                ConnectionDefinition::new("a", "c", "Done"),
                ConnectionDefinition::new("a", "b", "Done"),
            ],
        );
        let mut instance = running(&d, &g);
        let summary = run(&g, &mut instance).await;

        assert_eq!(summary.steps, 3);
        assert_eq!(executed(&instance), vec!["a", "c", "b"]);
        assert_eq!(instance.status(), WorkflowStatus::Finished);
    }

    #[tokio::test]
    async fn test_wait_all_join_runs_once_after_both_sources() {
        let (d, g) = graph(
            vec![
                ActivityDefinition::new("fork", "Fork").with_property("branches", json!(["L", "R"])),
                set("left", "l", json!(true)),
                set("right", "r", json!(true)),
                ActivityDefinition::new("join", "Join"),
            ],
            vec![
                ConnectionDefinition::new("fork", "left", "L"),
                ConnectionDefinition::new("fork", "right", "R"),
                ConnectionDefinition::new("left", "join", "Done"),
                ConnectionDefinition::new("right", "join", "Done"),
            ],
        );
        let mut instance = running(&d, &g);
        run(&g, &mut instance).await;
        assert_eq!(executed(&instance), vec!["fork", "left", "right", "join"]);
    }

    #[tokio::test]
    async fn test_wait_all_join_never_runs_with_one_source() {
        let (d, g) = graph(
            vec![
                ActivityDefinition::new("check", "If").with_property("variable", json!("flag")),
                set("yes", "v", json!(1)),
                set("no", "v", json!(2)),
                ActivityDefinition::new("join", "Join"),
            ],
            vec![
                ConnectionDefinition::new("check", "yes", "True"),
                ConnectionDefinition::new("check", "no", "False"),
                ConnectionDefinition::new("yes", "join", "Done"),
                ConnectionDefinition::new("no", "join", "Done"),
            ],
        );
        let mut instance = running(&d, &g);
        run(&g, &mut instance).await;
        assert_eq!(executed(&instance), vec!["check", "no"]);
        assert_eq!(instance.status(), WorkflowStatus::Finished);
    }

    #[tokio::test]
    async fn test_wait_any_join_runs_on_first_arrival_only() {
        let build = |mode: &str| {
            graph(
                vec![
                    ActivityDefinition::new("fork", "Fork")
                        .with_property("branches", json!(["L", "R"])),
                    set("left", "l", json!(true)),
                    set("right", "r", json!(true)),
                    set("slow", "s", json!(true)),
                    ActivityDefinition::new("join", "Join").with_property("mode", json!(mode)),
                ],
                vec![
                    ConnectionDefinition::new("fork", "left", "L"),
                    ConnectionDefinition::new("fork", "right", "R"),
                    ConnectionDefinition::new("left", "join", "Done"),
                    ConnectionDefinition::new("right", "slow", "Done"),
                    ConnectionDefinition::new("slow", "join", "Done"),
                ],
            )
        };

        let (d, g) = build("waitAny");
        let mut instance = running(&d, &g);
        run(&g, &mut instance).await;
        assert_eq!(
            executed(&instance),
            vec!["fork", "left", "right", "join", "slow"]
        );

        let (d, g) = build("waitAll");
        let mut instance = running(&d, &g);
        run(&g, &mut instance).await;
        assert_eq!(
            executed(&instance),
            vec!["fork", "left", "right", "slow", "join"]
        );
    }

    #[tokio::test]
    async fn test_fault_keeps_pending_frontier() {
        let (d, g) = graph(
            vec![
                ActivityDefinition::new("fork", "Fork").with_property("branches", json!(["A", "B"])),
                ActivityDefinition::new("boom", "Fault").with_property("message", json!("bad")),
                set("later", "x", json!(1)),
            ],
            vec![
                ConnectionDefinition::new("fork", "boom", "A"),
                ConnectionDefinition::new("fork", "later", "B"),
            ],
        );
        let mut instance = running(&d, &g);
        run(&g, &mut instance).await;

        assert_eq!(instance.status(), WorkflowStatus::Faulted);
        let fault = instance.fault().unwrap();
        assert_eq!(fault.activity_id, "boom");
        assert_eq!(fault.message, "bad");
        assert_eq!(fault.pending_frontier, vec!["later"]);
        assert_eq!(instance.frontier().count(), 0);
        assert!(!instance.variables.contains("x"));
    }

    #[tokio::test]
    async fn test_activity_error_becomes_fault() {
        let (d, g) = graph(vec![ActivityDefinition::new("a", "SetVariable")], vec![]);
        let mut instance = running(&d, &g);
        run(&g, &mut instance).await;
        assert_eq!(instance.status(), WorkflowStatus::Faulted);
        assert!(instance.fault().unwrap().message.contains("'variable'"));
    }

    #[tokio::test]
    async fn test_suspend_keeps_remaining_frontier() {
        let (d, g) = graph(
            vec![
                ActivityDefinition::new("fork", "Fork").with_property("branches", json!(["A", "B"])),
                ActivityDefinition::new("wait", "SignalReceived").with_property("signal", json!("go")),
                set("other", "x", json!(1)),
            ],
            vec![
                ConnectionDefinition::new("fork", "wait", "A"),
                ConnectionDefinition::new("fork", "other", "B"),
            ],
        );
        let mut instance = running(&d, &g);
        let summary = run(&g, &mut instance).await;

        assert_eq!(instance.status(), WorkflowStatus::Suspended);
        assert_eq!(summary.created_bookmarks.len(), 1);
        assert_eq!(instance.bookmarks()[0].payload, json!({"signal": "go"}));
        let pending: Vec<_> = instance.frontier().map(|a| a.activity_id.as_str()).collect();
        assert_eq!(pending, vec!["other"]);
    }

    #[tokio::test]
    async fn test_cancellation_observed_before_first_step() {
        let (d, g) = graph(vec![set("a", "x", json!(1))], vec![]);
        let mut instance = running(&d, &g);
        let tokens = CancellationTokens::new();
        tokens.user.cancel();

        let summary = Scheduler::new(&g, 100)
            .run(&mut instance, &tokens, &mut NoopObserver)
            .await
            .unwrap();
        assert_eq!(summary.steps, 0);
        assert_eq!(instance.status(), WorkflowStatus::Cancelled);
        assert!(instance.execution_log().is_empty());
    }

    #[tokio::test]
    async fn test_step_budget_faults_cycles() {
        let (d, g) = graph(
            vec![
                set("start", "n", json!(0)),
                ActivityDefinition::new("loop", "Finish"),
            ],
            vec![
                ConnectionDefinition::new("start", "loop", "Done"),
                ConnectionDefinition::new("loop", "loop", "Done"),
            ],
        );
        let mut instance = running(&d, &g);
        let summary = Scheduler::new(&g, 5)
            .run(&mut instance, &CancellationTokens::new(), &mut NoopObserver)
            .await
            .unwrap();

        assert_eq!(summary.steps, 5);
        assert_eq!(instance.status(), WorkflowStatus::Faulted);
        let fault = instance.fault().unwrap();
        assert!(fault.message.contains("step budget"));
        assert_eq!(fault.pending_frontier, vec!["loop"]);
    }

    #[tokio::test]
    async fn test_observer_sees_every_completed_step() {
        struct Counting(Vec<String>);

        #[async_trait]
        impl StepObserver for Counting {
            async fn after_step(
                &mut self,
                _instance: &mut WorkflowInstance,
                activity: &ActivityDefinition,
            ) -> Result<()> {
                self.0.push(activity.activity_id.clone());
                Ok(())
            }
        }

        let (d, g) = graph(
            vec![set("a", "x", json!(1)), set("b", "y", json!(2))],
            vec![ConnectionDefinition::new("a", "b", "Done")],
        );
        let mut instance = running(&d, &g);
        let mut observer = Counting(Vec::new());
        Scheduler::new(&g, 100)
            .run(&mut instance, &CancellationTokens::new(), &mut observer)
            .await
            .unwrap();
        assert_eq!(observer.0, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_requires_running_instance() {
        let (d, g) = graph(vec![set("a", "x", json!(1))], vec![]);
        let mut instance =
            WorkflowInstance::new("i-1", &d, None, BTreeMap::new(), BTreeMap::new());
        let err = Scheduler::new(&g, 100)
            .run(&mut instance, &CancellationTokens::new(), &mut NoopObserver)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TRANSITION");
    }
}
