// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for trellis-core.
//!
//! Every failure a caller can observe is a [`CoreError`]. Activity faults are not
//! errors: they are recorded on the instance (see [`crate::instance::WorkflowFault`]).

use std::fmt;

use crate::validation::ValidationError;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Coarse error category, used by callers that only need to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request or definition is malformed; fix it and retry.
    Validation,
    /// The request collides with current state (singleton, busy, duplicate publish).
    Conflict,
    /// A referenced definition, instance or bookmark does not exist.
    NotFound,
    /// The store failed.
    Storage,
    /// The runtime was assembled incorrectly.
    Configuration,
}

/// Core errors that can occur while saving definitions or running instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// The definition graph failed structural validation.
    Validation {
        /// Every error found, in discovery order.
        errors: Vec<ValidationError>,
    },

    /// A non-terminal instance of a singleton definition already exists.
    SingletonViolation {
        /// The definition family.
        definition_id: String,
        /// The instance that holds the slot.
        existing_instance_id: String,
    },

    /// Another scheduler run currently owns the instance.
    InstanceBusy {
        /// The instance ID.
        instance_id: String,
    },

    /// The latest version is already the published one.
    DuplicatePublish {
        /// The definition family.
        definition_id: String,
        /// The version that is already published.
        version: i32,
    },

    /// A compare-and-swap save lost against a concurrent writer.
    RevisionConflict {
        /// The collection the entity lives in.
        collection: &'static str,
        /// The entity ID.
        id: String,
        /// The revision the writer expected to replace.
        expected: u64,
    },

    /// An insert collided with an existing entity.
    DuplicateEntity {
        /// The collection the entity lives in.
        collection: &'static str,
        /// The entity ID.
        id: String,
    },

    /// The definition exists but is disabled.
    DefinitionDisabled {
        /// The definition family.
        definition_id: String,
    },

    /// No definition version matched the request.
    DefinitionNotFound {
        /// The definition family.
        definition_id: String,
        /// The selector that was resolved.
        selector: String,
    },

    /// Instance was not found in the store.
    InstanceNotFound {
        /// The instance ID that was not found.
        instance_id: String,
    },

    /// No pending bookmark matched the resume request.
    BookmarkNotFound {
        /// Human-readable description of what was searched for.
        criteria: String,
    },

    /// The bookmark existed but another request claimed it first.
    AlreadyResumed {
        /// The bookmark ID.
        bookmark_id: String,
    },

    /// The requested activity is not part of the definition.
    ActivityNotFound {
        /// The definition version.
        definition_version_id: String,
        /// The missing activity.
        activity_id: String,
    },

    /// The instance status does not allow the requested change.
    InvalidTransition {
        /// The instance ID.
        instance_id: String,
        /// The current status.
        from: String,
        /// The requested status.
        to: String,
    },

    /// The runtime was built without something it needs.
    Configuration {
        /// What is wrong.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::SingletonViolation { .. } => "SINGLETON_VIOLATION",
            Self::InstanceBusy { .. } => "INSTANCE_BUSY",
            Self::DuplicatePublish { .. } => "DUPLICATE_PUBLISH",
            Self::RevisionConflict { .. } => "REVISION_CONFLICT",
            Self::DuplicateEntity { .. } => "DUPLICATE_ENTITY",
            Self::DefinitionDisabled { .. } => "DEFINITION_DISABLED",
            Self::DefinitionNotFound { .. } => "DEFINITION_NOT_FOUND",
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::BookmarkNotFound { .. } => "BOOKMARK_NOT_FOUND",
            Self::AlreadyResumed { .. } => "ALREADY_RESUMED",
            Self::ActivityNotFound { .. } => "ACTIVITY_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Map this error onto the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::ActivityNotFound { .. } => ErrorKind::Validation,
            Self::SingletonViolation { .. }
            | Self::InstanceBusy { .. }
            | Self::DuplicatePublish { .. }
            | Self::RevisionConflict { .. }
            | Self::DuplicateEntity { .. }
            | Self::DefinitionDisabled { .. }
            | Self::AlreadyResumed { .. }
            | Self::InvalidTransition { .. } => ErrorKind::Conflict,
            Self::DefinitionNotFound { .. }
            | Self::InstanceNotFound { .. }
            | Self::BookmarkNotFound { .. } => ErrorKind::NotFound,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::DatabaseError { .. } => ErrorKind::Storage,
        }
    }

    /// Shorthand for `kind() == ErrorKind::Conflict`.
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Shorthand for `kind() == ErrorKind::NotFound`.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { errors } => {
                write!(f, "Workflow definition is invalid")?;
                for (i, error) in errors.iter().enumerate() {
                    let sep = if i == 0 { ": " } else { "; " };
                    write!(f, "{}{}", sep, error)?;
                }
                Ok(())
            }
            Self::SingletonViolation {
                definition_id,
                existing_instance_id,
            } => {
                write!(
                    f,
                    "Definition '{}' is a singleton and instance '{}' is still active",
                    definition_id, existing_instance_id
                )
            }
            Self::InstanceBusy { instance_id } => {
                write!(f, "Instance '{}' is already running", instance_id)
            }
            Self::DuplicatePublish {
                definition_id,
                version,
            } => {
                write!(
                    f,
                    "Version {} of definition '{}' is already published",
                    version, definition_id
                )
            }
            Self::RevisionConflict {
                collection,
                id,
                expected,
            } => {
                write!(
                    f,
                    "Concurrent modification of '{}' in {}: expected revision {}",
                    id, collection, expected
                )
            }
            Self::DuplicateEntity { collection, id } => {
                write!(f, "'{}' already exists in {}", id, collection)
            }
            Self::DefinitionDisabled { definition_id } => {
                write!(f, "Definition '{}' is disabled", definition_id)
            }
            Self::DefinitionNotFound {
                definition_id,
                selector,
            } => {
                write!(
                    f,
                    "Definition '{}' has no version matching '{}'",
                    definition_id, selector
                )
            }
            Self::InstanceNotFound { instance_id } => {
                write!(f, "Instance '{}' not found", instance_id)
            }
            Self::BookmarkNotFound { criteria } => {
                write!(f, "No bookmark matches {}", criteria)
            }
            Self::AlreadyResumed { bookmark_id } => {
                write!(f, "Bookmark '{}' was already resumed", bookmark_id)
            }
            Self::ActivityNotFound {
                definition_version_id,
                activity_id,
            } => {
                write!(
                    f,
                    "Activity '{}' not found in definition version '{}'",
                    activity_id, definition_version_id
                )
            }
            Self::InvalidTransition {
                instance_id,
                from,
                to,
            } => {
                write!(
                    f,
                    "Instance '{}' cannot move from '{}' to '{}'",
                    instance_id, from, to
                )
            }
            Self::Configuration { message } => {
                write!(f, "Configuration error: {}", message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}
