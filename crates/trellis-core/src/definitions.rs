// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store mapping and version resolution for workflow definitions.

use trellis_dsl::{VersionOptions, WorkflowDefinition};

use crate::specification::{Entity, Field, FieldKind, Scalar, fields};

impl Entity for WorkflowDefinition {
    const COLLECTION: &'static str = "workflow_definitions";
    const FIELDS: &'static [Field] = &[
        Field::new(fields::ID, FieldKind::Str),
        Field::new(fields::DEFINITION_ID, FieldKind::Str),
        Field::new(fields::VERSION, FieldKind::Int),
        Field::new("name", FieldKind::Str),
        Field::new(fields::IS_LATEST, FieldKind::Bool),
        Field::new(fields::IS_PUBLISHED, FieldKind::Bool),
        Field::new("is_enabled", FieldKind::Bool),
        Field::new("is_singleton", FieldKind::Bool),
        Field::new(fields::CREATED_AT, FieldKind::Int),
    ];

    /// Definitions are keyed by version id; the family id is `definition_id`.
    fn id(&self) -> &str {
        &self.definition_version_id
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    fn property(&self, field: &str) -> Option<Scalar> {
        match field {
            fields::ID => Some(self.definition_version_id.as_str().into()),
            fields::DEFINITION_ID => Some(self.id.as_str().into()),
            fields::VERSION => Some(self.version.into()),
            "name" => Some(self.name.clone().into()),
            fields::IS_LATEST => Some(self.is_latest.into()),
            fields::IS_PUBLISHED => Some(self.is_published.into()),
            "is_enabled" => Some(self.is_enabled.into()),
            "is_singleton" => Some(self.is_singleton.into()),
            fields::CREATED_AT => Some(self.created_at.timestamp_millis().into()),
            _ => None,
        }
    }
}

/// Pick the single version `selector` names out of a family.
///
/// `LatestOrPublished` prefers the published version and falls back to the
/// latest. `All` resolves to the highest version number.
pub fn resolve_version(
    family: &[WorkflowDefinition],
    selector: VersionOptions,
) -> Option<&WorkflowDefinition> {
    match selector {
        VersionOptions::Latest => family.iter().find(|d| d.is_latest),
        VersionOptions::Published => family.iter().find(|d| d.is_published),
        VersionOptions::LatestOrPublished => family
            .iter()
            .find(|d| d.is_published)
            .or_else(|| family.iter().find(|d| d.is_latest)),
        VersionOptions::SpecificVersion(v) => family.iter().find(|d| d.version == v),
        VersionOptions::All => family.iter().max_by_key(|d| d.version),
    }
}

/// Version id for version `version` of family `definition_id`.
pub fn version_id(definition_id: &str, version: i32) -> String {
    format!("{}:v{}", definition_id, version)
}
