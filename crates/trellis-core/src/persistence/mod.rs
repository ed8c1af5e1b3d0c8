// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for trellis-core.
//!
//! The engine talks to storage only through [`Store`], parameterized by the entity
//! type. Two backends are provided:
//! - [`MemoryStore`]: evaluates specifications in process
//! - [`SqliteStore`]: translates specifications into SQL
//!
//! Both must return identical results for the same specification, ordering and page
//! over the same stored state.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::specification::{Entity, OrderBy, Page, Specification};

/// Specification-driven store for one entity type.
#[async_trait]
pub trait Store<E: Entity>: Send + Sync {
    /// Entities matching `spec`, ordered by `order_by` then insertion order,
    /// windowed by `page`.
    async fn find_many(
        &self,
        spec: &Specification,
        order_by: Option<&OrderBy>,
        page: Option<Page>,
    ) -> Result<Vec<E>, CoreError>;

    /// Number of entities matching `spec`.
    async fn count(&self, spec: &Specification) -> Result<u64, CoreError>;

    /// Insert or update.
    ///
    /// With revision 0 the entity is inserted and [`CoreError::DuplicateEntity`] is
    /// returned if its id exists. Otherwise the stored revision must equal the
    /// entity's, or [`CoreError::RevisionConflict`] is returned. On success the
    /// entity's revision is bumped.
    async fn save(&self, entity: &mut E) -> Result<(), CoreError>;

    /// Remove every entity matching `spec`, returning how many were removed.
    async fn delete(&self, spec: &Specification) -> Result<u64, CoreError>;

    /// First entity matching `spec`, in insertion order.
    async fn find(&self, spec: &Specification) -> Result<Option<E>, CoreError> {
        Ok(self
            .find_many(spec, None, Some(Page::first(1)))
            .await?
            .into_iter()
            .next())
    }

    /// Entity with the given id.
    async fn get(&self, id: &str) -> Result<Option<E>, CoreError> {
        self.find(&Specification::ById(id.to_string())).await
    }
}
