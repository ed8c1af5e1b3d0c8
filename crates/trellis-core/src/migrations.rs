// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded SQLite schema for the three trellis stores.
//!
//! Each store collection gets its own table: `workflow_definitions` (one row
//! per version), `workflow_instances` and the `bookmarks` index. Every table
//! keeps the entity as JSON in `data`, its compare-and-swap `revision`, an
//! autoincrement `seq` for stable ordering, and one column per queryable field.
//!
//! [`crate::persistence::SqliteStore::from_path`] migrates on open. Callers that
//! bring their own pool run [`run_sqlite`] before handing it to
//! [`crate::persistence::SqliteStore::new`]:
//!
//! ```ignore
//! let pool = SqlitePool::connect("sqlite:trellis.db?mode=rwc").await?;
//! trellis_core::migrations::run_sqlite(&pool).await?;
//! let store = SqliteStore::new(pool);
//! ```

use sqlx::migrate::MigrateError;

/// Migrator for the definition, instance and bookmark tables.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Bring the schema up to date. Applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
