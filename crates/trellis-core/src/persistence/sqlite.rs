// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Each entity collection is a table with one column per declared field, plus
//! `seq` (insertion order), `revision` and the full entity as JSON in `data`.
//! Built-in specification shapes are translated directly; [`Specification::Raw`]
//! goes through the generic expression translator. Both emit predicates that are
//! never NULL, so `NOT` behaves exactly like the in-memory evaluator.

use std::path::Path;

use async_trait::async_trait;
use sqlx::query::{Query, QueryScalar};
use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool};
use trellis_dsl::VersionOptions;

use crate::error::CoreError;
use crate::specification::{
    Entity, Expression, OrderBy, Page, Scalar, SortDirection, Specification, fields, lookup,
};

use super::Store;

/// SQLite-backed store for every entity collection.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Create a new SQLite store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite store from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects to the database with sensible defaults
    /// - Runs all migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/trellis.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        // Create parent directories if needed
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        crate::migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ============================================================================
// Translation
// ============================================================================

/// Native translation of the built-in specification shapes.
fn translate_spec<E: Entity>(spec: &Specification, args: &mut Vec<Scalar>) -> String {
    match spec {
        Specification::ById(id) => eq_clause::<E>(fields::ID, &Scalar::from(id.as_str()), args),
        Specification::ByVersion(selector) => version_clause::<E>(*selector, args),
        Specification::ByDefinitionId {
            definition_id,
            version,
        } => {
            let family =
                eq_clause::<E>(fields::DEFINITION_ID, &Scalar::from(definition_id.as_str()), args);
            match version {
                Some(selector) => {
                    format!("({} AND {})", family, version_clause::<E>(*selector, args))
                }
                None => family,
            }
        }
        Specification::ByCorrelationId(id) => {
            eq_clause::<E>(fields::CORRELATION_ID, &Scalar::from(id.as_str()), args)
        }
        Specification::And(items) => join(
            items.iter().map(|s| translate_spec::<E>(s, args)).collect(),
            " AND ",
            "1",
        ),
        Specification::Or(items) => join(
            items.iter().map(|s| translate_spec::<E>(s, args)).collect(),
            " OR ",
            "0",
        ),
        Specification::Not(inner) => format!("(NOT {})", translate_spec::<E>(inner, args)),
        Specification::Raw(expr) => translate_expr::<E>(expr, args),
    }
}

fn version_clause<E: Entity>(selector: VersionOptions, args: &mut Vec<Scalar>) -> String {
    match selector {
        VersionOptions::Latest => eq_clause::<E>(fields::IS_LATEST, &Scalar::Bool(true), args),
        VersionOptions::Published => {
            eq_clause::<E>(fields::IS_PUBLISHED, &Scalar::Bool(true), args)
        }
        VersionOptions::LatestOrPublished => format!(
            "({} OR {})",
            eq_clause::<E>(fields::IS_LATEST, &Scalar::Bool(true), args),
            eq_clause::<E>(fields::IS_PUBLISHED, &Scalar::Bool(true), args)
        ),
        VersionOptions::SpecificVersion(v) => {
            eq_clause::<E>(fields::VERSION, &Scalar::from(v), args)
        }
        VersionOptions::All => "1".to_string(),
    }
}

/// Generic translation of the property-expression tree.
fn translate_expr<E: Entity>(expr: &Expression, args: &mut Vec<Scalar>) -> String {
    match expr {
        Expression::Always => "1".to_string(),
        Expression::Never => "0".to_string(),
        Expression::Eq { field, value } => eq_clause::<E>(field, value, args),
        Expression::In { field, values } => {
            let Some(declared) = E::field(field) else {
                return "0".to_string();
            };
            let candidates: Vec<&Scalar> = values
                .iter()
                .filter(|v| v.kind() == Some(declared.kind))
                .collect();
            if candidates.is_empty() {
                return "0".to_string();
            }
            let placeholders = vec!["?"; candidates.len()].join(", ");
            args.extend(candidates.into_iter().cloned());
            format!(
                "({col} IS NOT NULL AND {col} IN ({placeholders}))",
                col = declared.name
            )
        }
        Expression::Compare { field, op, value } => match E::field(field) {
            Some(declared) if value.kind() == Some(declared.kind) => {
                args.push(value.clone());
                format!(
                    "({col} IS NOT NULL AND {col} {op} ?)",
                    col = declared.name,
                    op = op.sql()
                )
            }
            _ => "0".to_string(),
        },
        Expression::And(items) => join(
            items.iter().map(|e| translate_expr::<E>(e, args)).collect(),
            " AND ",
            "1",
        ),
        Expression::Or(items) => join(
            items.iter().map(|e| translate_expr::<E>(e, args)).collect(),
            " OR ",
            "0",
        ),
        Expression::Not(inner) => format!("(NOT {})", translate_expr::<E>(inner, args)),
    }
}

fn eq_clause<E: Entity>(field: &str, value: &Scalar, args: &mut Vec<Scalar>) -> String {
    let Some(declared) = E::field(field) else {
        // Undeclared fields are always missing.
        return if *value == Scalar::Null { "1" } else { "0" }.to_string();
    };
    match value {
        Scalar::Null => format!("({} IS NULL)", declared.name),
        v if v.kind() == Some(declared.kind) => {
            args.push(v.clone());
            format!("({} IS ?)", declared.name)
        }
        _ => "0".to_string(),
    }
}

fn join(parts: Vec<String>, separator: &str, empty: &str) -> String {
    if parts.is_empty() {
        empty.to_string()
    } else {
        format!("({})", parts.join(separator))
    }
}

fn order_clause<E: Entity>(order_by: Option<&OrderBy>) -> String {
    match order_by.and_then(|o| E::field(&o.field).map(|f| (f, o.direction))) {
        Some((field, SortDirection::Ascending)) => format!("{} ASC, seq ASC", field.name),
        Some((field, SortDirection::Descending)) => format!("{} DESC, seq ASC", field.name),
        None => "seq ASC".to_string(),
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    args: Vec<Scalar>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for arg in args {
        query = match arg {
            Scalar::Null => query.bind(Option::<String>::None),
            Scalar::Bool(v) => query.bind(v),
            Scalar::Int(v) => query.bind(v),
            Scalar::Str(v) => query.bind(v),
        };
    }
    query
}

fn bind_all_scalar<'q>(
    mut query: QueryScalar<'q, Sqlite, i64, SqliteArguments<'q>>,
    args: Vec<Scalar>,
) -> QueryScalar<'q, Sqlite, i64, SqliteArguments<'q>> {
    for arg in args {
        query = match arg {
            Scalar::Null => query.bind(Option::<String>::None),
            Scalar::Bool(v) => query.bind(v),
            Scalar::Int(v) => query.bind(v),
            Scalar::Str(v) => query.bind(v),
        };
    }
    query
}

/// Column values in `FIELDS` order, with mismatched or null values as `Null`.
fn field_values<E: Entity>(entity: &E) -> Vec<Scalar> {
    E::FIELDS
        .iter()
        .map(|f| lookup(entity, f.name).unwrap_or(Scalar::Null))
        .collect()
}

fn map_insert_error<E: Entity>(entity: &E, err: sqlx::Error) -> CoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => CoreError::DuplicateEntity {
            collection: E::COLLECTION,
            id: entity.id().to_string(),
        },
        _ => err.into(),
    }
}

// ============================================================================
// Store
// ============================================================================

#[async_trait]
impl<E: Entity> Store<E> for SqliteStore {
    async fn find_many(
        &self,
        spec: &Specification,
        order_by: Option<&OrderBy>,
        page: Option<Page>,
    ) -> Result<Vec<E>, CoreError> {
        let mut args = Vec::new();
        let predicate = translate_spec::<E>(spec, &mut args);
        let mut sql = format!(
            "SELECT revision, data FROM {} WHERE {} ORDER BY {}",
            E::COLLECTION,
            predicate,
            order_clause::<E>(order_by)
        );
        if let Some(page) = page {
            sql.push_str(" LIMIT ? OFFSET ?");
            args.push(Scalar::Int(i64::try_from(page.limit).unwrap_or(i64::MAX)));
            args.push(Scalar::Int(i64::try_from(page.offset).unwrap_or(i64::MAX)));
        }

        let rows = bind_all(sqlx::query(&sql), args)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> Result<E, CoreError> {
                let revision: i64 = row.try_get("revision")?;
                let data: String = row.try_get("data")?;
                let mut entity: E = serde_json::from_str(&data)?;
                entity.set_revision(revision as u64);
                Ok(entity)
            })
            .collect()
    }

    async fn count(&self, spec: &Specification) -> Result<u64, CoreError> {
        let mut args = Vec::new();
        let predicate = translate_spec::<E>(spec, &mut args);
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", E::COLLECTION, predicate);

        let count = bind_all_scalar(sqlx::query_scalar::<_, i64>(&sql), args)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn save(&self, entity: &mut E) -> Result<(), CoreError> {
        let data = serde_json::to_string(&*entity)?;
        let columns: Vec<&str> = E::FIELDS.iter().map(|f| f.name).collect();
        let mut args = field_values(&*entity);

        if entity.revision() == 0 {
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}, revision, data) VALUES ({}, 1, ?)",
                E::COLLECTION,
                columns.join(", "),
                placeholders
            );
            args.push(Scalar::Str(data));

            bind_all(sqlx::query(&sql), args)
                .execute(&self.pool)
                .await
                .map_err(|e| map_insert_error(&*entity, e))?;

            entity.set_revision(1);
            return Ok(());
        }

        let expected = entity.revision();
        let assignments: Vec<String> = columns.iter().map(|c| format!("{} = ?", c)).collect();
        let sql = format!(
            "UPDATE {} SET {}, revision = ?, data = ? WHERE id = ? AND revision = ?",
            E::COLLECTION,
            assignments.join(", ")
        );
        args.push(Scalar::Int((expected + 1) as i64));
        args.push(Scalar::Str(data));
        args.push(Scalar::Str(entity.id().to_string()));
        args.push(Scalar::Int(expected as i64));

        let result = bind_all(sqlx::query(&sql), args)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::RevisionConflict {
                collection: E::COLLECTION,
                id: entity.id().to_string(),
                expected,
            });
        }

        entity.set_revision(expected + 1);
        Ok(())
    }

    async fn delete(&self, spec: &Specification) -> Result<u64, CoreError> {
        let mut args = Vec::new();
        let predicate = translate_spec::<E>(spec, &mut args);
        let sql = format!("DELETE FROM {} WHERE {}", E::COLLECTION, predicate);

        let result = bind_all(sqlx::query(&sql), args)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
