//! Repository contract for the canonical store.

use async_trait::async_trait;
use revledger_core::{
    Company, CrmAppointment, CrmContact, CrmOpportunity, CrmPipeline, CrmPipelineStage,
    ElectiveSale, Entity, FanbasisSale, Membership, Payment, SheetRow, User,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{kind} with key {key} already exists for company {company_id}")]
    Conflict {
        kind: &'static str,
        company_id: Uuid,
        key: String,
    },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },
    #[error("{kind} belongs to company {actual}, expected {expected}")]
    TenantMismatch {
        kind: &'static str,
        expected: Uuid,
        actual: Uuid,
    },
}

/// Keyed access to one entity table. Every query is scoped to a company.
#[async_trait]
pub trait EntityRepository<E: Entity>: Send + Sync {
    /// Rows of `company_id` whose natural key is in `keys`, in one round trip.
    async fn find_by_keys(&self, company_id: Uuid, keys: &[String]) -> Result<Vec<E>, StoreError>;

    /// Bulk insert. Fails on a duplicate `(company_id, natural_key)`.
    async fn insert_many(&self, rows: Vec<E>) -> Result<usize, StoreError>;

    async fn update(&self, row: &E) -> Result<(), StoreError>;

    /// All rows, or only the listed companies' rows.
    async fn list(&self, companies: Option<&[Uuid]>) -> Result<Vec<E>, StoreError>;
}

#[async_trait]
pub trait SheetRowRepository: EntityRepository<SheetRow> {
    /// Atomically deletes the company's rows and inserts `rows` in their place.
    async fn replace_for_company(
        &self,
        company_id: Uuid,
        rows: Vec<SheetRow>,
    ) -> Result<usize, StoreError>;
}

/// Everything the sync and aggregation engines read or write.
pub trait CanonicalStore:
    EntityRepository<Company>
    + EntityRepository<User>
    + EntityRepository<Payment>
    + EntityRepository<Membership>
    + SheetRowRepository
    + EntityRepository<ElectiveSale>
    + EntityRepository<FanbasisSale>
    + EntityRepository<CrmContact>
    + EntityRepository<CrmOpportunity>
    + EntityRepository<CrmAppointment>
    + EntityRepository<CrmPipeline>
    + EntityRepository<CrmPipelineStage>
    + Send
    + Sync
{
}

impl<T> CanonicalStore for T where
    T: EntityRepository<Company>
        + EntityRepository<User>
        + EntityRepository<Payment>
        + EntityRepository<Membership>
        + SheetRowRepository
        + EntityRepository<ElectiveSale>
        + EntityRepository<FanbasisSale>
        + EntityRepository<CrmContact>
        + EntityRepository<CrmOpportunity>
        + EntityRepository<CrmAppointment>
        + EntityRepository<CrmPipeline>
        + EntityRepository<CrmPipelineStage>
        + Send
        + Sync
{
}

pub(crate) fn ensure_company<E: Entity>(row: &E, company_id: Uuid) -> Result<(), StoreError> {
    if row.company_id() != company_id {
        return Err(StoreError::TenantMismatch {
            kind: E::KIND,
            expected: company_id,
            actual: row.company_id(),
        });
    }
    Ok(())
}
