//! The single create-or-update path shared by every entity type.

use std::collections::HashMap;

use revledger_core::{Entity, Keyed};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::store::{ensure_company, EntityRepository, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl UpsertOutcome {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged
    }
}

impl std::ops::AddAssign for UpsertOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.created += rhs.created;
        self.updated += rhs.updated;
        self.unchanged += rhs.unchanged;
    }
}

/// Upserts `records` into the company's `E` table by natural key.
///
/// Input is deduplicated by key (last occurrence wins). Existing rows are
/// pre-fetched in one query; new rows go out in one bulk insert; `update`
/// returns `Some` only when a persisted row actually changes, and those
/// rows are written one at a time after the insert.
pub async fn upsert_batch<E, R, S, C, U>(
    store: &S,
    company_id: Uuid,
    records: Vec<R>,
    mut create: C,
    mut update: U,
) -> Result<UpsertOutcome, StoreError>
where
    E: Entity,
    R: Keyed,
    S: EntityRepository<E> + ?Sized,
    C: FnMut(&R) -> E,
    U: FnMut(&E, &R) -> Option<E>,
{
    let mut order: Vec<String> = Vec::with_capacity(records.len());
    let mut by_key: HashMap<String, R> = HashMap::with_capacity(records.len());
    for record in records {
        let key = record.natural_key();
        if by_key.insert(key.clone(), record).is_none() {
            order.push(key);
        }
    }

    if order.is_empty() {
        return Ok(UpsertOutcome::default());
    }

    let existing: HashMap<String, E> = EntityRepository::<E>::find_by_keys(store, company_id, &order)
        .await?
        .into_iter()
        .map(|row| (row.natural_key(), row))
        .collect();

    let mut outcome = UpsertOutcome::default();
    let mut to_create = Vec::new();
    let mut to_update = Vec::new();

    for key in &order {
        let Some(record) = by_key.get(key) else {
            continue;
        };
        match existing.get(key) {
            Some(row) => match update(row, record) {
                Some(changed) => to_update.push(changed),
                None => outcome.unchanged += 1,
            },
            None => {
                let row = create(record);
                ensure_company(&row, company_id)?;
                to_create.push(row);
            }
        }
    }

    if !to_create.is_empty() {
        outcome.created = EntityRepository::<E>::insert_many(store, to_create).await?;
    }
    for row in &to_update {
        ensure_company(row, company_id)?;
        EntityRepository::<E>::update(store, row).await?;
        outcome.updated += 1;
    }

    debug!(
        kind = E::KIND,
        %company_id,
        created = outcome.created,
        updated = outcome.updated,
        unchanged = outcome.unchanged,
        "upsert batch applied"
    );
    Ok(outcome)
}
