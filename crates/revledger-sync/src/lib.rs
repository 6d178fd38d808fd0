//! Sync engine: configuration, identity resolution, canonical writes, CRM
//! cross-reference and the per-company pipeline that ties them together.

use revledger_adapters::AdapterError;
use revledger_storage::StoreError;
use thiserror::Error;
use uuid::Uuid;

pub mod config;
pub mod crm;
pub mod identity;
pub mod pipeline;
pub mod scheduler;
pub mod writer;

#[cfg(test)]
mod fakes;

pub use config::{CompanyConfig, CompanyRegistry, SyncConfig};
pub use crm::{sync_crm, CrmSyncOptions, CrmSyncStats};
pub use identity::{resolve_identities, IdentityInputs, IdentitySource, ResolvedIdentity, UserIndex};
pub use pipeline::{
    CompanyJob, CompanySources, CompanySyncReport, SourceKind, SourceOutcome, SourceStats,
    SyncPipeline, SyncRunSummary, UploadKind, UploadReport,
};
pub use scheduler::maybe_build_scheduler;
pub use writer::{upsert_companies, CanonicalStoreWriter, Owned};

pub const CRATE_NAME: &str = "revledger-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("company {0} is not configured")]
    UnknownCompany(Uuid),
}
