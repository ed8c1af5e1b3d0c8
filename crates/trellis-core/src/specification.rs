// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage-agnostic query predicates.
//!
//! A [`Specification`] is a closed set of filter shapes that store adapters
//! translate into their native query form. Every shape lowers onto the generic
//! property-expression tree ([`Expression`]), which adapters use as the fallback
//! translation for shapes they do not handle natively, and which
//! [`crate::persistence::MemoryStore`] evaluates directly.
//!
//! # Null semantics
//!
//! Shared by every adapter:
//! - a comparison against a missing or null property is false, except `Eq` with
//!   [`Scalar::Null`], which is true
//! - a value whose type differs from the field's declared [`FieldKind`] never matches
//! - `Not` negates the resulting boolean (two-valued logic)
//! - a field the entity does not declare behaves like a missing property

use std::cmp::Ordering;
use std::ops;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use trellis_dsl::VersionOptions;

use crate::instance::WorkflowStatus;

// ============================================================================
// Entities
// ============================================================================

/// Well-known field names shared by the built-in specifications.
pub mod fields {
    /// Entity key
    pub const ID: &str = "id";
    /// Definition family
    pub const DEFINITION_ID: &str = "definition_id";
    /// Definition version number
    pub const VERSION: &str = "version";
    /// Latest-version flag
    pub const IS_LATEST: &str = "is_latest";
    /// Published-version flag
    pub const IS_PUBLISHED: &str = "is_published";
    /// Correlation identifier
    pub const CORRELATION_ID: &str = "correlation_id";
    /// Instance status
    pub const STATUS: &str = "status";
    /// Creation timestamp in milliseconds
    pub const CREATED_AT: &str = "created_at";
}

/// Declared type of a queryable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// `true`/`false`, stored as 0/1
    Bool,
    /// 64-bit signed integer
    Int,
    /// UTF-8 text
    Str,
}

/// A queryable field declared by an [`Entity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Field (and column) name
    pub name: &'static str,
    /// Value type
    pub kind: FieldKind,
}

impl Field {
    /// Declare a field.
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }
}

/// Something a [`crate::persistence::Store`] can hold.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Collection (table) name.
    const COLLECTION: &'static str;

    /// Queryable fields. Must include [`fields::ID`] as a string field.
    const FIELDS: &'static [Field];

    /// Unique key within the collection.
    fn id(&self) -> &str;

    /// Optimistic concurrency token; 0 means never saved.
    fn revision(&self) -> u64;

    /// Set by stores after a successful save or load.
    fn set_revision(&mut self, revision: u64);

    /// Current value of a declared field.
    fn property(&self, field: &str) -> Option<Scalar>;

    /// Look up a declared field by name.
    fn field(name: &str) -> Option<&'static Field> {
        Self::FIELDS.iter().find(|f| f.name == name)
    }
}

/// Value of a declared field, as seen by the specification layer.
///
/// Null and missing are equivalent. A value whose type does not match the field's
/// declaration is treated as missing too.
pub fn lookup<E: Entity>(entity: &E, field: &str) -> Option<Scalar> {
    let declared = E::field(field)?;
    match entity.property(field) {
        Some(value) if value.kind() == Some(declared.kind) => Some(value),
        _ => None,
    }
}

// ============================================================================
// Values
// ============================================================================

/// A primitive field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Scalar {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Text
    Str(String),
}

impl Scalar {
    /// The field kind this value fits, `None` for [`Scalar::Null`].
    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(FieldKind::Bool),
            Self::Int(_) => Some(FieldKind::Int),
            Self::Str(_) => Some(FieldKind::Str),
        }
    }

    /// Ordering between two values of the same kind.
    pub fn partial_cmp_same_kind(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Str(a), Self::Str(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            _ => None,
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Range comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompareOp {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CompareOp {
    /// Whether `ordering` (property compared to operand) satisfies the operator.
    pub fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }

    /// SQL spelling.
    pub fn sql(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

// ============================================================================
// Expressions
// ============================================================================

/// Generic property-expression tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Expression {
    /// Matches everything
    Always,
    /// Matches nothing
    Never,
    /// Field equals value (`Null` tests for absence)
    Eq {
        /// Field name
        field: String,
        /// Operand
        value: Scalar,
    },
    /// Field equals one of the values; null entries are ignored
    In {
        /// Field name
        field: String,
        /// Candidates
        values: Vec<Scalar>,
    },
    /// Ordered comparison; never matches a null operand or property
    Compare {
        /// Field name
        field: String,
        /// Operator
        op: CompareOp,
        /// Operand
        value: Scalar,
    },
    /// Every sub-expression matches (empty matches everything)
    And(Vec<Expression>),
    /// Any sub-expression matches (empty matches nothing)
    Or(Vec<Expression>),
    /// Negation
    Not(Box<Expression>),
}

impl Expression {
    /// `field = value`
    pub fn equals(field: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `field IN (values)`
    pub fn one_of<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Scalar>,
    {
        Self::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `field <op> value`
    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Scalar>) -> Self {
        Self::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Evaluate against an entity.
    pub fn evaluate<E: Entity>(&self, entity: &E) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Eq { field, value } => {
                let current = lookup(entity, field);
                match value {
                    Scalar::Null => current.is_none(),
                    v => current.as_ref() == Some(v),
                }
            }
            Self::In { field, values } => match lookup(entity, field) {
                Some(current) => values.iter().any(|v| *v == current),
                None => false,
            },
            Self::Compare { field, op, value } => match lookup(entity, field) {
                Some(current) => current
                    .partial_cmp_same_kind(value)
                    .is_some_and(|ordering| op.holds(ordering)),
                None => false,
            },
            Self::And(items) => items.iter().all(|e| e.evaluate(entity)),
            Self::Or(items) => items.iter().any(|e| e.evaluate(entity)),
            Self::Not(inner) => !inner.evaluate(entity),
        }
    }
}

// ============================================================================
// Specifications
// ============================================================================

/// A composable, serializable predicate over stored entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Specification {
    /// Entity key equals the id
    ById(String),
    /// Definition version flags or number match the selector
    ByVersion(VersionOptions),
    /// Belongs to a definition family, optionally narrowed by version
    ByDefinitionId {
        /// Definition family
        definition_id: String,
        /// Optional version selector
        version: Option<VersionOptions>,
    },
    /// Correlation identifier equals the id
    ByCorrelationId(String),
    /// Every sub-specification matches
    And(Vec<Specification>),
    /// Any sub-specification matches
    Or(Vec<Specification>),
    /// Negation
    Not(Box<Specification>),
    /// A raw property expression
    Raw(Expression),
}

impl Specification {
    /// Matches every entity.
    pub fn all() -> Self {
        Self::Raw(Expression::Always)
    }

    /// Entities of a definition family, any version.
    pub fn by_definition(definition_id: impl Into<String>) -> Self {
        Self::ByDefinitionId {
            definition_id: definition_id.into(),
            version: None,
        }
    }

    /// Instances that have not reached a terminal status.
    pub fn non_terminal() -> Self {
        Self::Raw(Expression::one_of(
            fields::STATUS,
            WorkflowStatus::NON_TERMINAL
                .iter()
                .map(|s| s.to_string()),
        ))
    }

    /// Instances in the given status.
    pub fn with_status(status: WorkflowStatus) -> Self {
        Self::Raw(Expression::equals(fields::STATUS, status.to_string()))
    }

    /// `field = value` over any declared field.
    pub fn field_eq(field: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self::Raw(Expression::equals(field, value))
    }

    /// Conjunction, flattening nested `And`s.
    pub fn and(self, other: Specification) -> Self {
        match self {
            Self::And(mut items) => {
                items.push(other);
                Self::And(items)
            }
            spec => Self::And(vec![spec, other]),
        }
    }

    /// Disjunction, flattening nested `Or`s.
    pub fn or(self, other: Specification) -> Self {
        match self {
            Self::Or(mut items) => {
                items.push(other);
                Self::Or(items)
            }
            spec => Self::Or(vec![spec, other]),
        }
    }

    /// Lower onto the generic property-expression tree.
    pub fn to_expression(&self) -> Expression {
        match self {
            Self::ById(id) => Expression::equals(fields::ID, id.as_str()),
            Self::ByVersion(selector) => version_expression(*selector),
            Self::ByDefinitionId {
                definition_id,
                version,
            } => {
                let family = Expression::equals(fields::DEFINITION_ID, definition_id.as_str());
                match version {
                    Some(selector) => Expression::And(vec![family, version_expression(*selector)]),
                    None => family,
                }
            }
            Self::ByCorrelationId(id) => Expression::equals(fields::CORRELATION_ID, id.as_str()),
            Self::And(items) => Expression::And(items.iter().map(Self::to_expression).collect()),
            Self::Or(items) => Expression::Or(items.iter().map(Self::to_expression).collect()),
            Self::Not(inner) => Expression::Not(Box::new(inner.to_expression())),
            Self::Raw(expr) => expr.clone(),
        }
    }

    /// In-memory evaluation.
    pub fn matches<E: Entity>(&self, entity: &E) -> bool {
        self.to_expression().evaluate(entity)
    }
}

impl ops::Not for Specification {
    type Output = Specification;

    fn not(self) -> Self::Output {
        match self {
            Self::Not(inner) => *inner,
            spec => Self::Not(Box::new(spec)),
        }
    }
}

/// Lowering of a version selector onto definition flags.
pub fn version_expression(selector: VersionOptions) -> Expression {
    match selector {
        VersionOptions::Latest => Expression::equals(fields::IS_LATEST, true),
        VersionOptions::Published => Expression::equals(fields::IS_PUBLISHED, true),
        VersionOptions::LatestOrPublished => Expression::Or(vec![
            Expression::equals(fields::IS_LATEST, true),
            Expression::equals(fields::IS_PUBLISHED, true),
        ]),
        VersionOptions::SpecificVersion(v) => Expression::equals(fields::VERSION, v),
        VersionOptions::All => Expression::Always,
    }
}

// ============================================================================
// Ordering and Paging
// ============================================================================

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortDirection {
    /// Smallest first; nulls first
    #[default]
    Ascending,
    /// Largest first; nulls last
    Descending,
}

/// Sort order over one declared field. Ties fall back to insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Field name; undeclared fields sort by insertion order only
    pub field: String,
    /// Direction
    pub direction: SortDirection,
}

impl OrderBy {
    /// Ascending order on `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    /// Descending order on `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Descending,
        }
    }

    /// Compare two field values the way every store orders them.
    pub fn compare_values(&self, a: Option<&Scalar>, b: Option<&Scalar>) -> Ordering {
        let ascending = match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.partial_cmp_same_kind(b).unwrap_or(Ordering::Equal),
        };
        match self.direction {
            SortDirection::Ascending => ascending,
            SortDirection::Descending => ascending.reverse(),
        }
    }
}

/// Offset/limit window over an ordered result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Entities to skip
    pub offset: u64,
    /// Maximum entities to return
    pub limit: u64,
}

impl Page {
    /// A window.
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    /// The first `limit` entities.
    pub fn first(limit: u64) -> Self {
        Self { offset: 0, limit }
    }
}
