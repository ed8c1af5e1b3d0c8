// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structural validation of workflow definitions.
//!
//! Runs before anything is written. A definition with errors is never persisted;
//! warnings are logged and the save proceeds.

use std::collections::{BTreeSet, HashMap, HashSet};

use trellis_dsl::WorkflowDefinition;

use crate::activity::ActivityRegistry;

// ============================================================================
// Validation Result Types
// ============================================================================

/// Errors and warnings found in a definition.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Problems that reject the save.
    pub errors: Vec<ValidationError>,
    /// Suspicious but executable shapes.
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    /// No errors (warnings allowed).
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Any errors.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Any warnings.
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Merge another result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

// ============================================================================
// Validation Errors
// ============================================================================

/// Structural errors.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum ValidationError {
    /// Two activities share an id.
    DuplicateActivityId { activity_id: String },
    /// No registered type has this name.
    UnknownActivityType {
        activity_id: String,
        activity_type: String,
        available_types: Vec<String>,
    },
    /// A connection names an activity the definition does not contain.
    MissingConnectionEndpoint {
        source_activity_id: String,
        target_activity_id: String,
        missing_activity_id: String,
    },
    /// The definition has no activities.
    EmptyWorkflow,
    /// A connection's outcome is not one the source type can produce.
    UndeclaredOutcome {
        source_activity_id: String,
        activity_type: String,
        outcome: String,
        declared_outcomes: Vec<String>,
    },
    /// More than one version of the family would be published.
    MultiplePublished {
        definition_id: String,
        versions: Vec<i32>,
    },
    /// Not exactly one version of the family would be latest.
    LatestNotUnique {
        definition_id: String,
        versions: Vec<i32>,
    },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::DuplicateActivityId { activity_id } => {
                write!(f, "[E001] Activity id '{}' is used more than once", activity_id)
            }
            ValidationError::UnknownActivityType {
                activity_id,
                activity_type,
                available_types,
            } => {
                let suggestion = find_similar_name(activity_type, available_types)
                    .map(|s| format!(". Did you mean '{}'?", s))
                    .unwrap_or_default();
                write!(
                    f,
                    "[E002] Activity '{}' has unknown type '{}'{}",
                    activity_id, activity_type, suggestion
                )
            }
            ValidationError::MissingConnectionEndpoint {
                source_activity_id,
                target_activity_id,
                missing_activity_id,
            } => {
                write!(
                    f,
                    "[E003] Connection '{}' -> '{}' references missing activity '{}'",
                    source_activity_id, target_activity_id, missing_activity_id
                )
            }
            ValidationError::EmptyWorkflow => {
                write!(f, "[E004] Workflow has no steps defined")
            }
            ValidationError::UndeclaredOutcome {
                source_activity_id,
                activity_type,
                outcome,
                declared_outcomes,
            } => {
                let suggestion = find_similar_name(outcome, declared_outcomes)
                    .map(|s| format!(". Did you mean '{}'?", s))
                    .unwrap_or_default();
                write!(
                    f,
                    "[E005] Activity '{}' ({}) cannot produce outcome '{}'; declared outcomes: {}{}",
                    source_activity_id,
                    activity_type,
                    outcome,
                    if declared_outcomes.is_empty() {
                        "(none)".to_string()
                    } else {
                        declared_outcomes.join(", ")
                    },
                    suggestion
                )
            }
            ValidationError::MultiplePublished {
                definition_id,
                versions,
            } => {
                write!(
                    f,
                    "[E006] Definition '{}' would have more than one published version: {:?}",
                    definition_id, versions
                )
            }
            ValidationError::LatestNotUnique {
                definition_id,
                versions,
            } => {
                write!(
                    f,
                    "[E007] Definition '{}' must have exactly one latest version, found {:?}",
                    definition_id, versions
                )
            }
        }
    }
}

impl std::error::Error for ValidationError {}

// ============================================================================
// Validation Warnings
// ============================================================================

/// Shapes that execute but are probably mistakes.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum ValidationWarning {
    /// Not reachable from any start activity.
    UnreachableActivity { activity_id: String },
    /// Every activity has an inbound connection, so only a trigger start can run it.
    NoStartActivity,
    /// The same connection is declared twice and will schedule its target twice.
    DuplicateConnection {
        source_activity_id: String,
        target_activity_id: String,
        outcome: String,
    },
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationWarning::UnreachableActivity { activity_id } => {
                write!(
                    f,
                    "[W001] Activity '{}' is unreachable from the start activities",
                    activity_id
                )
            }
            ValidationWarning::NoStartActivity => {
                write!(
                    f,
                    "[W002] Every activity has an inbound connection; the workflow can only start from a trigger"
                )
            }
            ValidationWarning::DuplicateConnection {
                source_activity_id,
                target_activity_id,
                outcome,
            } => {
                write!(
                    f,
                    "[W003] Connection '{}' -[{}]-> '{}' is declared more than once",
                    source_activity_id, outcome, target_activity_id
                )
            }
        }
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Validate one definition against the registered activity types.
pub fn validate_definition(
    definition: &WorkflowDefinition,
    registry: &ActivityRegistry,
) -> ValidationResult {
    let mut result = ValidationResult::default();

    // Phase 1: activities
    validate_activities(definition, registry, &mut result);
    if result.errors.contains(&ValidationError::EmptyWorkflow) {
        return result;
    }

    // Phase 2: connection endpoints and outcomes
    validate_connections(definition, registry, &mut result);

    // Phase 3: reachability warnings
    validate_reachability(definition, &mut result);

    result
}

/// Check the flag invariants over a family as it would look after a write:
/// at most one published version and exactly one latest.
pub fn validate_family(definition_id: &str, family: &[WorkflowDefinition]) -> ValidationResult {
    let mut result = ValidationResult::default();

    let published: Vec<i32> = family
        .iter()
        .filter(|d| d.is_published)
        .map(|d| d.version)
        .collect();
    if published.len() > 1 {
        result.errors.push(ValidationError::MultiplePublished {
            definition_id: definition_id.to_string(),
            versions: published,
        });
    }

    let latest: Vec<i32> = family
        .iter()
        .filter(|d| d.is_latest)
        .map(|d| d.version)
        .collect();
    if !family.is_empty() && latest.len() != 1 {
        result.errors.push(ValidationError::LatestNotUnique {
            definition_id: definition_id.to_string(),
            versions: latest,
        });
    }

    result
}

// ============================================================================
// Phase 1: Activities
// ============================================================================

fn validate_activities(
    definition: &WorkflowDefinition,
    registry: &ActivityRegistry,
    result: &mut ValidationResult,
) {
    if definition.activities.is_empty() {
        result.errors.push(ValidationError::EmptyWorkflow);
        return;
    }

    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for activity in &definition.activities {
        if !seen.insert(activity.activity_id.as_str())
            && reported.insert(activity.activity_id.as_str())
        {
            result.errors.push(ValidationError::DuplicateActivityId {
                activity_id: activity.activity_id.clone(),
            });
        }

        if !registry.contains(&activity.activity_type) {
            result.errors.push(ValidationError::UnknownActivityType {
                activity_id: activity.activity_id.clone(),
                activity_type: activity.activity_type.clone(),
                available_types: registry.type_names().iter().map(|s| s.to_string()).collect(),
            });
        }
    }
}

// ============================================================================
// Phase 2: Connections
// ============================================================================

fn validate_connections(
    definition: &WorkflowDefinition,
    registry: &ActivityRegistry,
    result: &mut ValidationResult,
) {
    let mut outcome_cache: HashMap<&str, Option<Vec<String>>> = HashMap::new();
    let mut seen = HashSet::new();

    for connection in &definition.connections {
        let source = definition.activity(&connection.source_activity_id);
        let target = definition.activity(&connection.target_activity_id);

        for (id, found) in [
            (&connection.source_activity_id, source.is_some()),
            (&connection.target_activity_id, target.is_some()),
        ] {
            if !found {
                result.errors.push(ValidationError::MissingConnectionEndpoint {
                    source_activity_id: connection.source_activity_id.clone(),
                    target_activity_id: connection.target_activity_id.clone(),
                    missing_activity_id: id.clone(),
                });
            }
        }

        let key = (
            connection.source_activity_id.as_str(),
            connection.outcome.as_str(),
            connection.target_activity_id.as_str(),
        );
        if !seen.insert(key) {
            result.warnings.push(ValidationWarning::DuplicateConnection {
                source_activity_id: connection.source_activity_id.clone(),
                target_activity_id: connection.target_activity_id.clone(),
                outcome: connection.outcome.clone(),
            });
        }

        // Unknown types are already reported in phase 1.
        let Some(source) = source else { continue };
        let declared = outcome_cache
            .entry(source.activity_id.as_str())
            .or_insert_with(|| {
                registry
                    .get(&source.activity_type)
                    .map(|t| t.outcomes(source))
            });
        if let Some(declared) = declared
            && !declared.contains(&connection.outcome)
        {
            result.errors.push(ValidationError::UndeclaredOutcome {
                source_activity_id: source.activity_id.clone(),
                activity_type: source.activity_type.clone(),
                outcome: connection.outcome.clone(),
                declared_outcomes: declared.clone(),
            });
        }
    }
}

// ============================================================================
// Phase 3: Reachability
// ============================================================================

fn validate_reachability(definition: &WorkflowDefinition, result: &mut ValidationResult) {
    let starts: Vec<&str> = definition
        .start_activities()
        .iter()
        .map(|a| a.activity_id.as_str())
        .collect();
    if starts.is_empty() {
        result.warnings.push(ValidationWarning::NoStartActivity);
        return;
    }

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for connection in &definition.connections {
        adjacency
            .entry(connection.source_activity_id.as_str())
            .or_default()
            .push(connection.target_activity_id.as_str());
    }

    let mut reachable = BTreeSet::new();
    let mut queue = starts;
    while let Some(id) = queue.pop() {
        if !reachable.insert(id) {
            continue;
        }
        if let Some(next) = adjacency.get(id) {
            queue.extend(next.iter().filter(|n| !reachable.contains(*n)));
        }
    }

    for activity in &definition.activities {
        if !reachable.contains(activity.activity_id.as_str()) {
            result.warnings.push(ValidationWarning::UnreachableActivity {
                activity_id: activity.activity_id.clone(),
            });
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Closest candidate by edit distance, if it is close enough to be a typo.
fn find_similar_name(target: &str, candidates: &[String]) -> Option<String> {
    let target_lower = target.to_lowercase();

    candidates
        .iter()
        .filter_map(|candidate| {
            let distance = levenshtein_distance(&target_lower, &candidate.to_lowercase());
            (distance <= target.len() / 2 + 2).then(|| (candidate.clone(), distance))
        })
        .min_by_key(|(_, d)| *d)
        .map(|(name, _)| name)
}

fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use trellis_dsl::{ActivityDefinition, ConnectionDefinition};

    use super::*;

    fn definition(
        activities: Vec<ActivityDefinition>,
        connections: Vec<ConnectionDefinition>,
    ) -> WorkflowDefinition {
        let mut d = WorkflowDefinition::new("flow", "flow:v1");
        d.activities = activities;
        d.connections = connections;
        d
    }

    fn registry() -> ActivityRegistry {
        ActivityRegistry::with_builtins()
    }

    #[test]
    fn test_empty_workflow() {
        let result = validate_definition(&definition(vec![], vec![]), &registry());
        assert_eq!(result.errors, vec![ValidationError::EmptyWorkflow]);
    }

    #[test]
    fn test_valid_linear_workflow() {
        let d = definition(
            vec![
                ActivityDefinition::new("a", "Finish"),
                ActivityDefinition::new("b", "Finish"),
            ],
            vec![ConnectionDefinition::new("a", "b", "Done")],
        );
        let result = validate_definition(&d, &registry());
        assert!(result.is_ok());
        assert!(!result.has_warnings());
    }

    #[test]
    fn test_duplicate_activity_reported_once() {
        let d = definition(
            vec![
                ActivityDefinition::new("a", "Finish"),
                ActivityDefinition::new("a", "Finish"),
                ActivityDefinition::new("a", "Finish"),
            ],
            vec![],
        );
        let result = validate_definition(&d, &registry());
        assert_eq!(
            result.errors,
            vec![ValidationError::DuplicateActivityId {
                activity_id: "a".into()
            }]
        );
    }

    #[test]
    fn test_unknown_type_suggests_registered_name() {
        let d = definition(vec![ActivityDefinition::new("a", "Finsh")], vec![]);
        let result = validate_definition(&d, &registry());
        assert!(result.has_errors());
        let message = result.errors[0].to_string();
        assert!(message.starts_with("[E002]"));
        assert!(message.contains("Did you mean 'Finish'?"));
    }

    #[test]
    fn test_missing_endpoint() {
        let d = definition(
            vec![ActivityDefinition::new("a", "Finish")],
            vec![ConnectionDefinition::new("a", "ghost", "Done")],
        );
        let result = validate_definition(&d, &registry());
        assert!(result.errors.iter().any(|e| matches!(
            e,
            ValidationError::MissingConnectionEndpoint { missing_activity_id, .. } if missing_activity_id == "ghost"
        )));
    }

    #[test]
    fn test_undeclared_outcome_rejected() {
        let d = definition(
            vec![
                ActivityDefinition::new("check", "If").with_property("variable", json!("x")),
                ActivityDefinition::new("end", "Finish"),
            ],
            vec![ConnectionDefinition::new("check", "end", "Done")],
        );
        let result = validate_definition(&d, &registry());
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(
            &result.errors[0],
            ValidationError::UndeclaredOutcome { outcome, declared_outcomes, .. }
                if outcome == "Done" && declared_outcomes == &vec!["True".to_string(), "False".to_string()]
        ));
    }

    #[test]
    fn test_switch_outcomes_come_from_configuration() {
        let switch = ActivityDefinition::new("s", "Switch")
            .with_property("variable", json!("tier"))
            .with_property("cases", json!([{"name": "Gold", "equals": "gold"}]));
        let d = definition(
            vec![switch, ActivityDefinition::new("end", "Finish")],
            vec![
                ConnectionDefinition::new("s", "end", "Gold"),
                ConnectionDefinition::new("s", "end", "Default"),
            ],
        );
        assert!(validate_definition(&d, &registry()).is_ok());
    }

    #[test]
    fn test_reachability_warnings() {
        let d = definition(
            vec![
                ActivityDefinition::new("a", "Finish"),
                ActivityDefinition::new("b", "Finish"),
                ActivityDefinition::new("c", "Finish"),
            ],
            vec![
                ConnectionDefinition::new("b", "c", "Done"),
                ConnectionDefinition::new("c", "b", "Done"),
            ],
        );
        let result = validate_definition(&d, &registry());
        assert!(result.is_ok());
        assert_eq!(
            result.warnings,
            vec![
                ValidationWarning::UnreachableActivity {
                    activity_id: "b".into()
                },
                ValidationWarning::UnreachableActivity {
                    activity_id: "c".into()
                },
            ]
        );

        let cycle = definition(
            vec![
                ActivityDefinition::new("a", "Finish"),
                ActivityDefinition::new("b", "Finish"),
            ],
            vec![
                ConnectionDefinition::new("a", "b", "Done"),
                ConnectionDefinition::new("b", "a", "Done"),
                ConnectionDefinition::new("b", "a", "Done"),
            ],
        );
        let result = validate_definition(&cycle, &registry());
        assert!(result.warnings.contains(&ValidationWarning::NoStartActivity));
        assert!(result.warnings.iter().any(|w| matches!(w, ValidationWarning::DuplicateConnection { .. })));
    }

    #[test]
    fn test_family_flags() {
        let mut v1 = WorkflowDefinition::new("flow", "flow:v1");
        v1.is_published = true;
        v1.is_latest = false;
        let mut v2 = WorkflowDefinition::new("flow", "flow:v2");
        v2.version = 2;
        assert!(validate_family("flow", &[v1.clone(), v2.clone()]).is_ok());

        v2.is_published = true;
        let result = validate_family("flow", &[v1.clone(), v2.clone()]);
        assert!(matches!(
            &result.errors[..],
            [ValidationError::MultiplePublished { versions, .. }] if versions == &vec![1, 2]
        ));

        v1.is_latest = true;
        v1.is_published = false;
        let result = validate_family("flow", &[v1, v2]);
        assert!(result.errors[0].to_string().starts_with("[E007]"));
    }

    #[test]
    fn test_levenshtein_distance() {
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("", "abc"), 3);
        assert_eq!(levenshtein_distance("same", "same"), 0);
    }
}
