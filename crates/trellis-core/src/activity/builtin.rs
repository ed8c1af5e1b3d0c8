// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in activity types.
//!
//! | Type | Properties | Outcomes |
//! |------|------------|----------|
//! | `SetVariable` | `variable`, `value` or `fromInput` | `Done` |
//! | `If` | `variable`, optional `equals` | `True`, `False` |
//! | `Switch` | `variable`, `cases: [{name, equals}]` | case names, `Default` |
//! | `Fork` | `branches: [name]` | every branch |
//! | `Join` | `mode: waitAll \| waitAny` | `Done` |
//! | `SignalReceived` | `signal`, optional `output` | `Done` |
//! | `Fault` | `message` | none |
//! | `Finish` | none | `Done` |

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Value, json};
use trellis_dsl::ActivityDefinition;

use super::{ActivityContext, ActivityResult, ActivityType, DONE, JoinMode};

fn required<'a>(activity: &'a ActivityDefinition, name: &str) -> anyhow::Result<&'a str> {
    activity.str_property(name).with_context(|| {
        format!(
            "{} activity '{}' requires a string '{}' property",
            activity.activity_type, activity.activity_id, name
        )
    })
}

/// JSON truthiness: null, false, zero and empty values are false.
fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}

/// Assigns a variable from a literal `value` or from the start input key `fromInput`.
pub struct SetVariable;

#[async_trait]
impl ActivityType for SetVariable {
    fn type_name(&self) -> &str {
        "SetVariable"
    }

    fn outcomes(&self, _activity: &ActivityDefinition) -> Vec<String> {
        vec![DONE.to_string()]
    }

    async fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<ActivityResult> {
        let variable = required(ctx.activity, "variable")?;
        let value = match ctx.activity.str_property("fromInput") {
            Some(key) => ctx.input.get(key).cloned().unwrap_or(Value::Null),
            None => ctx.activity.property("value").cloned().unwrap_or(Value::Null),
        };
        ctx.variables.set(variable, value);
        Ok(ActivityResult::done())
    }
}

/// Branches on a variable: equality with `equals` when given, truthiness otherwise.
pub struct If;

#[async_trait]
impl ActivityType for If {
    fn type_name(&self) -> &str {
        "If"
    }

    fn outcomes(&self, _activity: &ActivityDefinition) -> Vec<String> {
        vec!["True".to_string(), "False".to_string()]
    }

    async fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<ActivityResult> {
        let variable = required(ctx.activity, "variable")?;
        let current = ctx.variables.get(variable);
        let holds = match ctx.activity.property("equals") {
            Some(expected) => current == Some(expected),
            None => truthy(current),
        };
        Ok(ActivityResult::outcome(if holds { "True" } else { "False" }))
    }
}

/// Produces the first case whose `equals` matches the variable, or `Default`.
pub struct Switch;

impl Switch {
    fn cases(activity: &ActivityDefinition) -> Vec<(String, Value)> {
        activity
            .property("cases")
            .and_then(Value::as_array)
            .map(|cases| {
                cases
                    .iter()
                    .filter_map(|case| {
                        let name = case.get("name")?.as_str()?.to_string();
                        let equals = case.get("equals").cloned().unwrap_or(Value::Null);
                        Some((name, equals))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ActivityType for Switch {
    fn type_name(&self) -> &str {
        "Switch"
    }

    fn outcomes(&self, activity: &ActivityDefinition) -> Vec<String> {
        let mut outcomes: Vec<String> = Self::cases(activity).into_iter().map(|(n, _)| n).collect();
        outcomes.push("Default".to_string());
        outcomes
    }

    async fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<ActivityResult> {
        let variable = required(ctx.activity, "variable")?;
        let current = ctx.variables.get(variable).unwrap_or(&Value::Null);
        let matched = Self::cases(ctx.activity)
            .into_iter()
            .find(|(_, equals)| equals == current)
            .map(|(name, _)| name);
        Ok(ActivityResult::outcome(
            matched.unwrap_or_else(|| "Default".to_string()),
        ))
    }
}

/// Produces every declared branch at once.
pub struct Fork;

#[async_trait]
impl ActivityType for Fork {
    fn type_name(&self) -> &str {
        "Fork"
    }

    fn outcomes(&self, activity: &ActivityDefinition) -> Vec<String> {
        activity.str_list_property("branches")
    }

    async fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<ActivityResult> {
        Ok(ActivityResult::Outcomes(
            ctx.activity.str_list_property("branches"),
        ))
    }
}

/// Merges branches. The scheduler gates it according to `mode`.
pub struct Join;

#[async_trait]
impl ActivityType for Join {
    fn type_name(&self) -> &str {
        "Join"
    }

    fn outcomes(&self, _activity: &ActivityDefinition) -> Vec<String> {
        vec![DONE.to_string()]
    }

    fn join_mode(&self, activity: &ActivityDefinition) -> JoinMode {
        match activity.str_property("mode") {
            Some(mode) if mode.eq_ignore_ascii_case("waitAny") => JoinMode::WaitAny,
            _ => JoinMode::WaitAll,
        }
    }

    async fn execute(&self, _ctx: &mut ActivityContext<'_>) -> anyhow::Result<ActivityResult> {
        Ok(ActivityResult::done())
    }
}

/// Waits for a named signal.
///
/// The first execution parks on a `{"signal": name}` bookmark carrying the
/// instance's correlation id. When resumed, the trigger input is copied into the
/// `output` variable if one is configured.
pub struct SignalReceived;

#[async_trait]
impl ActivityType for SignalReceived {
    fn type_name(&self) -> &str {
        "SignalReceived"
    }

    fn outcomes(&self, _activity: &ActivityDefinition) -> Vec<String> {
        vec![DONE.to_string()]
    }

    async fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<ActivityResult> {
        let signal = required(ctx.activity, "signal")?;
        match ctx.trigger {
            Some(trigger) => {
                if let Some(output) = ctx.activity.str_property("output") {
                    ctx.variables.set(output, trigger.clone());
                }
                Ok(ActivityResult::done())
            }
            None => Ok(ActivityResult::suspend(
                json!({ "signal": signal }),
                ctx.correlation_id.map(str::to_string),
            )),
        }
    }
}

/// Always faults.
pub struct Fault;

#[async_trait]
impl ActivityType for Fault {
    fn type_name(&self) -> &str {
        "Fault"
    }

    fn outcomes(&self, _activity: &ActivityDefinition) -> Vec<String> {
        Vec::new()
    }

    async fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<ActivityResult> {
        let message = ctx
            .activity
            .str_property("message")
            .unwrap_or("Fault activity reached");
        Ok(ActivityResult::Fault(message.to_string()))
    }
}

/// Marks a path end. Produces `Done` with no further semantics.
pub struct Finish;

#[async_trait]
impl ActivityType for Finish {
    fn type_name(&self) -> &str {
        "Finish"
    }

    fn outcomes(&self, _activity: &ActivityDefinition) -> Vec<String> {
        vec![DONE.to_string()]
    }

    async fn execute(&self, _ctx: &mut ActivityContext<'_>) -> anyhow::Result<ActivityResult> {
        Ok(ActivityResult::done())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use trellis_dsl::Variables;

    use super::*;

    async fn run(
        activity_type: &dyn ActivityType,
        activity: &ActivityDefinition,
        variables: &mut Variables,
        input: &BTreeMap<String, Value>,
        trigger: Option<&Value>,
    ) -> anyhow::Result<ActivityResult> {
        let mut ctx = ActivityContext {
            instance_id: "i-1",
            correlation_id: Some("order-7"),
            activity,
            variables,
            input,
            trigger,
        };
        activity_type.execute(&mut ctx).await
    }

    #[tokio::test]
    async fn test_set_variable_from_literal_and_input() {
        let mut vars = Variables::new();
        let mut input = BTreeMap::new();
        input.insert("amount".to_string(), json!(42));

        let literal = ActivityDefinition::new("a", "SetVariable")
            .with_property("variable", json!("status"))
            .with_property("value", json!("new"));
        run(&SetVariable, &literal, &mut vars, &input, None).await.unwrap();

        let from_input = ActivityDefinition::new("b", "SetVariable")
            .with_property("variable", json!("total"))
            .with_property("fromInput", json!("amount"));
        let result = run(&SetVariable, &from_input, &mut vars, &input, None)
            .await
            .unwrap();

        assert_eq!(result, ActivityResult::done());
        assert_eq!(vars.get("status"), Some(&json!("new")));
        assert_eq!(vars.get("total"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_set_variable_without_name_is_an_error() {
        let mut vars = Variables::new();
        let activity = ActivityDefinition::new("a", "SetVariable");
        let err = run(&SetVariable, &activity, &mut vars, &BTreeMap::new(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'variable'"));
    }

    #[tokio::test]
    async fn test_if_equality_and_truthiness() {
        let mut vars = Variables::new();
        vars.set("count", json!(0));
        vars.set("kind", json!("gold"));
        let input = BTreeMap::new();

        let truthy = ActivityDefinition::new("a", "If").with_property("variable", json!("count"));
        assert_eq!(
            run(&If, &truthy, &mut vars, &input, None).await.unwrap(),
            ActivityResult::outcome("False")
        );

        let equals = ActivityDefinition::new("b", "If")
            .with_property("variable", json!("kind"))
            .with_property("equals", json!("gold"));
        assert_eq!(
            run(&If, &equals, &mut vars, &input, None).await.unwrap(),
            ActivityResult::outcome("True")
        );
    }

    #[tokio::test]
    async fn test_switch_matches_first_case_or_default() {
        let activity = ActivityDefinition::new("s", "Switch")
            .with_property("variable", json!("tier"))
            .with_property(
                "cases",
                json!([{"name": "Gold", "equals": "gold"}, {"name": "Silver", "equals": "silver"}]),
            );
        assert_eq!(Switch.outcomes(&activity), vec!["Gold", "Silver", "Default"]);

        let mut vars = Variables::new();
        vars.set("tier", json!("silver"));
        let input = BTreeMap::new();
        assert_eq!(
            run(&Switch, &activity, &mut vars, &input, None).await.unwrap(),
            ActivityResult::outcome("Silver")
        );

        vars.set("tier", json!("bronze"));
        assert_eq!(
            run(&Switch, &activity, &mut vars, &input, None).await.unwrap(),
            ActivityResult::outcome("Default")
        );
    }

    #[tokio::test]
    async fn test_fork_produces_every_branch() {
        let activity =
            ActivityDefinition::new("f", "Fork").with_property("branches", json!(["Left", "Right"]));
        let result = run(&Fork, &activity, &mut Variables::new(), &BTreeMap::new(), None)
            .await
            .unwrap();
        assert_eq!(
            result,
            ActivityResult::Outcomes(vec!["Left".into(), "Right".into()])
        );
    }

    #[test]
    fn test_join_mode_property() {
        let all = ActivityDefinition::new("j", "Join");
        let any = ActivityDefinition::new("j", "Join").with_property("mode", json!("waitAny"));
        assert_eq!(Join.join_mode(&all), JoinMode::WaitAll);
        assert_eq!(Join.join_mode(&any), JoinMode::WaitAny);
        assert_eq!(Finish.join_mode(&all), JoinMode::Each);
    }

    #[tokio::test]
    async fn test_signal_suspends_then_completes_with_output() {
        let activity = ActivityDefinition::new("wait", "SignalReceived")
            .with_property("signal", json!("approved"))
            .with_property("output", json!("approval"));
        let mut vars = Variables::new();
        let input = BTreeMap::new();

        let first = run(&SignalReceived, &activity, &mut vars, &input, None)
            .await
            .unwrap();
        assert_eq!(
            first,
            ActivityResult::suspend(json!({"signal": "approved"}), Some("order-7".into()))
        );

        let trigger = json!({"by": "alice"});
        let second = run(&SignalReceived, &activity, &mut vars, &input, Some(&trigger))
            .await
            .unwrap();
        assert_eq!(second, ActivityResult::done());
        assert_eq!(vars.get("approval"), Some(&trigger));
    }

    #[tokio::test]
    async fn test_fault_uses_message() {
        let activity =
            ActivityDefinition::new("x", "Fault").with_property("message", json!("out of stock"));
        let result = run(&Fault, &activity, &mut Variables::new(), &BTreeMap::new(), None)
            .await
            .unwrap();
        assert_eq!(result, ActivityResult::Fault("out of stock".into()));
        assert!(Fault.outcomes(&activity).is_empty());
    }
}
