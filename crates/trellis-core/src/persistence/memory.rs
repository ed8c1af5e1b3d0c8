// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process store that evaluates specifications directly.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::CoreError;
use crate::specification::{Entity, OrderBy, Page, Specification, lookup};

use super::Store;

struct Record<E> {
    seq: u64,
    entity: E,
}

struct Inner<E> {
    next_seq: u64,
    records: Vec<Record<E>>,
}

/// In-memory store. Every operation is atomic under a single lock.
pub struct MemoryStore<E> {
    inner: Mutex<Inner<E>>,
}

impl<E> Default for MemoryStore<E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_seq: 1,
                records: Vec::new(),
            }),
        }
    }
}

impl<E> std::fmt::Debug for MemoryStore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("len", &self.inner.lock().records.len())
            .finish()
    }
}

impl<E: Entity> MemoryStore<E> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<E: Entity> Store<E> for MemoryStore<E> {
    async fn find_many(
        &self,
        spec: &Specification,
        order_by: Option<&OrderBy>,
        page: Option<Page>,
    ) -> Result<Vec<E>, CoreError> {
        let expr = spec.to_expression();
        let inner = self.inner.lock();

        // Records are kept in insertion order, so a stable sort breaks ties by seq.
        let mut matched: Vec<&Record<E>> = inner
            .records
            .iter()
            .filter(|r| expr.evaluate(&r.entity))
            .collect();
        if let Some(order) = order_by {
            matched.sort_by(|a, b| {
                let left = lookup(&a.entity, &order.field);
                let right = lookup(&b.entity, &order.field);
                order
                    .compare_values(left.as_ref(), right.as_ref())
                    .then(a.seq.cmp(&b.seq))
            });
        }

        let (offset, limit) = match page {
            Some(p) => (p.offset as usize, p.limit as usize),
            None => (0, usize::MAX),
        };
        Ok(matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|r| r.entity.clone())
            .collect())
    }

    async fn count(&self, spec: &Specification) -> Result<u64, CoreError> {
        let expr = spec.to_expression();
        let inner = self.inner.lock();
        Ok(inner
            .records
            .iter()
            .filter(|r| expr.evaluate(&r.entity))
            .count() as u64)
    }

    async fn save(&self, entity: &mut E) -> Result<(), CoreError> {
        let mut inner = self.inner.lock();
        let existing = inner.records.iter().position(|r| r.entity.id() == entity.id());

        if entity.revision() == 0 {
            if existing.is_some() {
                return Err(CoreError::DuplicateEntity {
                    collection: E::COLLECTION,
                    id: entity.id().to_string(),
                });
            }
            entity.set_revision(1);
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.records.push(Record {
                seq,
                entity: entity.clone(),
            });
            return Ok(());
        }

        match existing {
            Some(pos) if inner.records[pos].entity.revision() == entity.revision() => {
                entity.set_revision(entity.revision() + 1);
                inner.records[pos].entity = entity.clone();
                Ok(())
            }
            _ => Err(CoreError::RevisionConflict {
                collection: E::COLLECTION,
                id: entity.id().to_string(),
                expected: entity.revision(),
            }),
        }
    }

    async fn delete(&self, spec: &Specification) -> Result<u64, CoreError> {
        let expr = spec.to_expression();
        let mut inner = self.inner.lock();
        let before = inner.records.len();
        inner.records.retain(|r| !expr.evaluate(&r.entity));
        Ok((before - inner.records.len()) as u64)
    }
}
