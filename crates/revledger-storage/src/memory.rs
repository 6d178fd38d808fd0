//! In-process canonical store. Same contract as the Postgres store; used for
//! dry runs and tests.

use std::collections::HashSet;

use async_trait::async_trait;
use revledger_core::{
    Company, CrmAppointment, CrmContact, CrmOpportunity, CrmPipeline, CrmPipelineStage,
    ElectiveSale, Entity, FanbasisSale, Membership, Payment, SheetRow, User,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::{ensure_company, EntityRepository, SheetRowRepository, StoreError};

#[derive(Debug, Default)]
struct Tables {
    companies: Vec<Company>,
    users: Vec<User>,
    payments: Vec<Payment>,
    memberships: Vec<Membership>,
    sheet_rows: Vec<SheetRow>,
    elective_sales: Vec<ElectiveSale>,
    fanbasis_sales: Vec<FanbasisSale>,
    crm_contacts: Vec<CrmContact>,
    crm_opportunities: Vec<CrmOpportunity>,
    crm_appointments: Vec<CrmAppointment>,
    crm_pipelines: Vec<CrmPipeline>,
    crm_pipeline_stages: Vec<CrmPipelineStage>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn find_in<E: Entity>(rows: &[E], company_id: Uuid, keys: &[String]) -> Vec<E> {
    let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();
    rows.iter()
        .filter(|r| r.company_id() == company_id && wanted.contains(r.natural_key().as_str()))
        .cloned()
        .collect()
}

fn insert_into<E: Entity>(rows: &mut Vec<E>, new_rows: Vec<E>) -> Result<usize, StoreError> {
    let mut taken: HashSet<(Uuid, String)> = rows
        .iter()
        .map(|r| (r.company_id(), r.natural_key()))
        .collect();
    for row in &new_rows {
        if !taken.insert((row.company_id(), row.natural_key())) {
            return Err(StoreError::Conflict {
                kind: E::KIND,
                company_id: row.company_id(),
                key: row.natural_key(),
            });
        }
    }
    let count = new_rows.len();
    rows.extend(new_rows);
    Ok(count)
}

fn update_in<E: Entity>(rows: &mut [E], row: &E) -> Result<(), StoreError> {
    let slot = rows
        .iter_mut()
        .find(|r| r.id() == row.id())
        .ok_or(StoreError::NotFound {
            kind: E::KIND,
            id: row.id(),
        })?;
    ensure_company(row, slot.company_id())?;
    *slot = row.clone();
    Ok(())
}

fn list_in<E: Entity>(rows: &[E], companies: Option<&[Uuid]>) -> Vec<E> {
    rows.iter()
        .filter(|r| companies.map_or(true, |c| c.contains(&r.company_id())))
        .cloned()
        .collect()
}

macro_rules! memory_repository {
    ($ty:ty, $table:ident) => {
        #[async_trait]
        impl EntityRepository<$ty> for MemoryStore {
            async fn find_by_keys(
                &self,
                company_id: Uuid,
                keys: &[String],
            ) -> Result<Vec<$ty>, StoreError> {
                Ok(find_in(&self.tables.read().await.$table, company_id, keys))
            }

            async fn insert_many(&self, rows: Vec<$ty>) -> Result<usize, StoreError> {
                insert_into(&mut self.tables.write().await.$table, rows)
            }

            async fn update(&self, row: &$ty) -> Result<(), StoreError> {
                update_in(&mut self.tables.write().await.$table, row)
            }

            async fn list(&self, companies: Option<&[Uuid]>) -> Result<Vec<$ty>, StoreError> {
                Ok(list_in(&self.tables.read().await.$table, companies))
            }
        }
    };
}

memory_repository!(Company, companies);
memory_repository!(User, users);
memory_repository!(Payment, payments);
memory_repository!(Membership, memberships);
memory_repository!(SheetRow, sheet_rows);
memory_repository!(ElectiveSale, elective_sales);
memory_repository!(FanbasisSale, fanbasis_sales);
memory_repository!(CrmContact, crm_contacts);
memory_repository!(CrmOpportunity, crm_opportunities);
memory_repository!(CrmAppointment, crm_appointments);
memory_repository!(CrmPipeline, crm_pipelines);
memory_repository!(CrmPipelineStage, crm_pipeline_stages);

#[async_trait]
impl SheetRowRepository for MemoryStore {
    async fn replace_for_company(
        &self,
        company_id: Uuid,
        rows: Vec<SheetRow>,
    ) -> Result<usize, StoreError> {
        for row in &rows {
            ensure_company(row, company_id)?;
        }
        let mut tables = self.tables.write().await;
        let mut kept: Vec<SheetRow> = tables
            .sheet_rows
            .iter()
            .filter(|r| r.company_id != company_id)
            .cloned()
            .collect();
        let inserted = insert_into(&mut kept, rows)?;
        tables.sheet_rows = kept;
        Ok(inserted)
    }
}
