//! Per-company sync runs with every source isolated from the others.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::future::OptionFuture;
use revledger_adapters::{
    map_elective_rows, map_fanbasis_rows, AdapterError, CrmClient, CrmCredentials, CrmSource,
    DecodedRow, PaymentsClient, PaymentsCredentials, PaymentsSource, SheetSource, SheetsClient,
};
use revledger_core::Company;
use revledger_storage::{CanonicalStore, HttpFetcher, StoreError, UpsertOutcome};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{CompanyRegistry, SyncConfig};
use crate::crm::{sync_crm, CrmSyncOptions, CrmSyncStats};
use crate::identity::{resolve_identities, IdentityInputs};
use crate::writer::{upsert_companies, CanonicalStoreWriter};
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Payments,
    Memberships,
    Sheet,
    Crm,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Payments,
        SourceKind::Memberships,
        SourceKind::Sheet,
        SourceKind::Crm,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Payments => "payments",
            SourceKind::Memberships => "memberships",
            SourceKind::Sheet => "sheet",
            SourceKind::Crm => "crm",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown source {s:?} (expected payments, memberships, sheet or crm)"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadKind {
    Elective,
    Fanbasis,
}

impl FromStr for UploadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "elective" => Ok(UploadKind::Elective),
            "fanbasis" => Ok(UploadKind::Fanbasis),
            other => Err(format!("unknown upload kind {other:?} (expected elective or fanbasis)")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub fetched: usize,
    pub written: UpsertOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crm: Option<CrmSyncStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Succeeded(SourceStats),
    Failed { error: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CompanySyncReport {
    pub company_id: Uuid,
    pub company_name: String,
    pub users: UpsertOutcome,
    pub unresolvable_records: usize,
    pub sources: BTreeMap<SourceKind, SourceOutcome>,
    /// Set when the run stopped before every source was attempted.
    pub error: Option<String>,
}

impl CompanySyncReport {
    fn new(company: &Company) -> Self {
        Self {
            company_id: company.id,
            company_name: company.name.clone(),
            users: UpsertOutcome::default(),
            unresolvable_records: 0,
            sources: BTreeMap::new(),
            error: None,
        }
    }

    fn failed(&mut self, kind: SourceKind, err: impl fmt::Display) {
        error!(source = %kind, error = %err, "source skipped this run");
        self.sources.insert(
            kind,
            SourceOutcome::Failed {
                error: err.to_string(),
            },
        );
    }

    fn written(&mut self, kind: SourceKind, fetched: usize, result: Result<UpsertOutcome, StoreError>) {
        match result {
            Ok(written) => {
                info!(source = %kind, fetched, created = written.created, updated = written.updated, "source synced");
                self.sources.insert(
                    kind,
                    SourceOutcome::Succeeded(SourceStats {
                        fetched,
                        written,
                        crm: None,
                    }),
                );
            }
            Err(err) => self.failed(kind, err),
        }
    }

    /// Fetched records, or `None` after recording why there are none.
    fn settle<T>(
        &mut self,
        kind: SourceKind,
        wanted: bool,
        fetched: Option<Result<Vec<T>, AdapterError>>,
    ) -> Option<Vec<T>> {
        match fetched {
            Some(Ok(records)) => Some(records),
            Some(Err(err)) => {
                self.failed(kind, err);
                None
            }
            None => {
                if wanted {
                    self.sources.insert(
                        kind,
                        SourceOutcome::Skipped {
                            reason: "not configured".into(),
                        },
                    );
                }
                None
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.error.is_none()
            && !self
                .sources
                .values()
                .any(|o| matches!(o, SourceOutcome::Failed { .. }))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub companies: Vec<CompanySyncReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub kind: UploadKind,
    pub mapped: usize,
    pub skipped_missing_email: usize,
    pub skipped_bad_date: usize,
    pub users: UpsertOutcome,
    pub outcome: UpsertOutcome,
}

#[derive(Clone, Default)]
pub struct CompanySources {
    pub payments: Option<Arc<dyn PaymentsSource>>,
    pub crm: Option<Arc<dyn CrmSource>>,
    pub sheet: Option<Arc<dyn SheetSource>>,
}

#[derive(Clone)]
pub struct CompanyJob {
    pub company: Company,
    pub sources: CompanySources,
}

pub struct SyncPipeline<S> {
    store: Arc<S>,
    jobs: Vec<CompanyJob>,
    crm_options: CrmSyncOptions,
}

impl<S> SyncPipeline<S>
where
    S: CanonicalStore + 'static,
{
    pub fn new(store: Arc<S>, jobs: Vec<CompanyJob>, crm_options: CrmSyncOptions) -> Self {
        Self {
            store,
            jobs,
            crm_options,
        }
    }

    /// Builds one HTTP client shared by every adapter and one job per enabled company.
    pub fn from_config(
        store: Arc<S>,
        config: &SyncConfig,
        registry: &CompanyRegistry,
    ) -> Result<Self, SyncError> {
        let http = Arc::new(
            HttpFetcher::new(config.http_client_config())
                .map_err(|err| SyncError::Config(format!("building http client: {err:#}")))?,
        );
        let now = Utc::now();

        let mut jobs = Vec::new();
        for company in registry.enabled() {
            let payments = match &company.payments {
                Some(p) => Some(Arc::new(PaymentsClient::new(
                    http.clone(),
                    PaymentsCredentials {
                        api_key: p.api_key.clone(),
                        base_url: p.base_url.clone(),
                    },
                )?) as Arc<dyn PaymentsSource>),
                None => None,
            };
            let crm = match &company.crm {
                Some(c) => Some(Arc::new(CrmClient::new(
                    http.clone(),
                    CrmCredentials {
                        api_key: c.api_key.clone(),
                        location_id: c.location_id.clone(),
                        base_url: c.base_url.clone(),
                    },
                )?) as Arc<dyn CrmSource>),
                None => None,
            };
            let sheet = match &company.sheet {
                Some(s) => Some(Arc::new(SheetsClient::new(
                    http.clone(),
                    s.api_key.clone(),
                    s.range.clone(),
                    s.base_url.as_deref(),
                )?) as Arc<dyn SheetSource>),
                None => None,
            };
            jobs.push(CompanyJob {
                company: company.to_company(now),
                sources: CompanySources { payments, crm, sheet },
            });
        }

        let crm_options = CrmSyncOptions {
            batch_size: config.crm_batch_size,
            batch_pause: config.crm_batch_pause(),
        };
        Ok(Self::new(store, jobs, crm_options))
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn companies(&self) -> impl Iterator<Item = &Company> {
        self.jobs.iter().map(|job| &job.company)
    }

    pub async fn register_companies(&self) -> Result<UpsertOutcome, SyncError> {
        let companies: Vec<Company> = self.companies().cloned().collect();
        Ok(upsert_companies(self.store.as_ref(), &companies).await?)
    }

    fn job(&self, company_id: Uuid) -> Result<&CompanyJob, SyncError> {
        self.jobs
            .iter()
            .find(|job| job.company.id == company_id)
            .ok_or(SyncError::UnknownCompany(company_id))
    }

    /// Syncs every company in turn. A failing company never stops the others.
    pub async fn sync_all(&self) -> anyhow::Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.register_companies()
            .await
            .context("registering companies")?;

        let mut companies = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            companies.push(self.run_job(job, None).await);
        }

        let finished_at = Utc::now();
        let failed = companies.iter().filter(|c| !c.is_clean()).count();
        info!(%run_id, companies = companies.len(), failed, "sync run finished");
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            companies,
        })
    }

    pub async fn sync_company(&self, company_id: Uuid) -> anyhow::Result<CompanySyncReport> {
        let job = self.job(company_id)?;
        upsert_companies(self.store.as_ref(), std::slice::from_ref(&job.company))
            .await
            .context("registering company")?;
        Ok(self.run_job(job, None).await)
    }

    /// Syncs one source of one company. Users seen in that source are still
    /// upserted first.
    pub async fn sync_company_source(
        &self,
        company_id: Uuid,
        kind: SourceKind,
    ) -> anyhow::Result<CompanySyncReport> {
        let job = self.job(company_id)?;
        upsert_companies(self.store.as_ref(), std::slice::from_ref(&job.company))
            .await
            .context("registering company")?;
        Ok(self.run_job(job, Some(kind)).await)
    }

    async fn run_job(&self, job: &CompanyJob, only: Option<SourceKind>) -> CompanySyncReport {
        let span = info_span!("company_sync", company_id = %job.company.id, company = %job.company.name);
        async move {
            let mut report = CompanySyncReport::new(&job.company);
            if let Err(err) = self.sync_sources(job, only, &mut report).await {
                error!(error = %format!("{err:#}"), "company sync aborted");
                report.error = Some(format!("{err:#}"));
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn sync_sources(
        &self,
        job: &CompanyJob,
        only: Option<SourceKind>,
        report: &mut CompanySyncReport,
    ) -> anyhow::Result<()> {
        let wants = |kind: SourceKind| only.map_or(true, |o| o == kind);
        let company = &job.company;
        let payments = job
            .sources
            .payments
            .as_ref()
            .zip(company.payments_company_ref.as_deref());
        let sheet = job.sources.sheet.as_ref().zip(company.sheet_url.as_deref());

        let (payments_res, memberships_res, sheet_res) = tokio::join!(
            OptionFuture::from(
                payments
                    .filter(|_| wants(SourceKind::Payments))
                    .map(|(source, company_ref)| source.fetch_payments(company_ref))
            ),
            OptionFuture::from(
                payments
                    .filter(|_| wants(SourceKind::Memberships))
                    .map(|(source, company_ref)| source.fetch_memberships(company_ref))
            ),
            OptionFuture::from(
                sheet
                    .filter(|_| wants(SourceKind::Sheet))
                    .map(|(source, url)| source.fetch_sheet_rows(url))
            ),
        );
        let payments = report.settle(SourceKind::Payments, wants(SourceKind::Payments), payments_res);
        let memberships = report.settle(SourceKind::Memberships, wants(SourceKind::Memberships), memberships_res);
        let sheet_rows = report.settle(SourceKind::Sheet, wants(SourceKind::Sheet), sheet_res);

        let (identities, unresolvable) = resolve_identities(&IdentityInputs {
            payments: payments.as_deref().unwrap_or_default(),
            memberships: memberships.as_deref().unwrap_or_default(),
            sheet_rows: sheet_rows.as_deref().unwrap_or_default(),
            ..Default::default()
        });
        let writer = CanonicalStoreWriter::new(self.store.as_ref(), company.id);
        let (users, user_outcome) = writer
            .upsert_users(identities)
            .await
            .context("upserting users")?;
        report.users = user_outcome;
        report.unresolvable_records = unresolvable;

        if let Some(records) = payments {
            let fetched = records.len();
            let result = writer.upsert_payments(records, &users).await;
            report.written(SourceKind::Payments, fetched, result);
        }
        if let Some(records) = memberships {
            let fetched = records.len();
            let result = writer.upsert_memberships(records, &users).await;
            report.written(SourceKind::Memberships, fetched, result);
        }
        if let Some(records) = sheet_rows {
            let fetched = records.len();
            let result = writer
                .replace_sheet_rows(records, &users)
                .await
                .map(|created| UpsertOutcome {
                    created,
                    ..Default::default()
                });
            report.written(SourceKind::Sheet, fetched, result);
        }

        if wants(SourceKind::Crm) {
            match &job.sources.crm {
                Some(source) => match self.sync_crm_source(company.id, source.as_ref()).await {
                    Ok(stats) => {
                        report.sources.insert(SourceKind::Crm, SourceOutcome::Succeeded(stats));
                    }
                    Err(err) => report.failed(SourceKind::Crm, format!("{err:#}")),
                },
                None => {
                    report.sources.insert(
                        SourceKind::Crm,
                        SourceOutcome::Skipped {
                            reason: "not configured".into(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Reference data first, then the per-user cross-reference.
    async fn sync_crm_source(
        &self,
        company_id: Uuid,
        source: &dyn CrmSource,
    ) -> anyhow::Result<SourceStats> {
        let writer = CanonicalStoreWriter::new(self.store.as_ref(), company_id);
        let pipelines = source.list_pipelines().await.context("listing crm pipelines")?;
        let mut written = writer
            .upsert_crm_pipelines(pipelines)
            .await
            .context("writing crm pipelines")?;

        let (stats, crm_written) = sync_crm(self.store.as_ref(), company_id, source, self.crm_options)
            .await
            .context("writing crm cross-reference")?;
        written += crm_written;
        if stats.users_considered > 0 && stats.failed == stats.users_considered {
            warn!(failed = stats.failed, "every crm user lookup failed");
        }
        Ok(SourceStats {
            fetched: stats.matched,
            written,
            crm: Some(stats),
        })
    }

    /// Maps decoded upload rows, resolves their customers and upserts the sales.
    pub async fn ingest_upload(
        &self,
        company_id: Uuid,
        kind: UploadKind,
        rows: &[DecodedRow],
    ) -> Result<UploadReport, SyncError> {
        let job = self.job(company_id)?;
        upsert_companies(self.store.as_ref(), std::slice::from_ref(&job.company)).await?;
        let writer = CanonicalStoreWriter::new(self.store.as_ref(), company_id);

        let report = match kind {
            UploadKind::Elective => {
                let mapping = map_elective_rows(rows);
                let (identities, _) = resolve_identities(&IdentityInputs {
                    elective: &mapping.records,
                    ..Default::default()
                });
                let (index, users) = writer.upsert_users(identities).await?;
                let mapped = mapping.records.len();
                let outcome = writer.upsert_elective_sales(mapping.records, &index).await?;
                UploadReport {
                    kind,
                    mapped,
                    skipped_missing_email: mapping.skipped_missing_email,
                    skipped_bad_date: mapping.skipped_bad_date,
                    users,
                    outcome,
                }
            }
            UploadKind::Fanbasis => {
                let mapping = map_fanbasis_rows(rows);
                let (identities, _) = resolve_identities(&IdentityInputs {
                    fanbasis: &mapping.records,
                    ..Default::default()
                });
                let (index, users) = writer.upsert_users(identities).await?;
                let mapped = mapping.records.len();
                let outcome = writer.upsert_fanbasis_sales(mapping.records, &index).await?;
                UploadReport {
                    kind,
                    mapped,
                    skipped_missing_email: mapping.skipped_missing_email,
                    skipped_bad_date: mapping.skipped_bad_date,
                    users,
                    outcome,
                }
            }
        };
        info!(
            %company_id,
            kind = ?kind,
            mapped = report.mapped,
            created = report.outcome.created,
            skipped = report.skipped_missing_email + report.skipped_bad_date,
            "upload ingested"
        );
        Ok(report)
    }
}
