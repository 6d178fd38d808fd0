//! Read-only revenue analytics over the canonical store.
//!
//! Every figure is recomputed from persisted child records on each call; the
//! store is never written.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;
use revledger_core::{
    normalize_email, CrmContact, CrmOpportunity, CrmPipeline, CrmPipelineStage, ElectiveSale,
    FanbasisSale, Membership, Payment, SheetRow, User,
};
use revledger_storage::{CanonicalStore, EntityRepository, StoreError};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "revledger-analytics";

pub const TOP_PERFORMERS: usize = 10;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Inclusive calendar-date window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, AnalyticsError> {
        if start > end {
            return Err(AnalyticsError::InvalidFilter(format!(
                "start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, AnalyticsError> {
        let date = |raw: &str| {
            NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|err| {
                AnalyticsError::InvalidFilter(format!("unparseable date {raw:?}: {err}"))
            })
        };
        Self::new(date(start)?, date(end)?)
    }

    pub fn all_time() -> Self {
        Self {
            start: NaiveDate::MIN,
            end: NaiveDate::MAX,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CompanyFilter {
    #[default]
    All,
    Only(Vec<Uuid>),
}

impl CompanyFilter {
    pub fn one(company_id: Uuid) -> Self {
        CompanyFilter::Only(vec![company_id])
    }

    fn as_slice(&self) -> Option<&[Uuid]> {
        match self {
            CompanyFilter::All => None,
            CompanyFilter::Only(ids) => Some(ids),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub payments: Decimal,
    pub elective: Decimal,
    pub fanbasis: Decimal,
    /// Cash collected per the sheet; not part of `total`.
    pub sheet: Decimal,
    pub total: Decimal,
}

impl TrendPoint {
    fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            payments: Decimal::ZERO,
            elective: Decimal::ZERO,
            fanbasis: Decimal::ZERO,
            sheet: Decimal::ZERO,
            total: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopPerformer {
    pub user_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub revenue: Decimal,
    pub payments: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStageStats {
    pub company_id: Uuid,
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub stage_id: String,
    pub stage_name: String,
    pub opportunities: usize,
    pub value: Decimal,
    #[serde(skip)]
    position: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DashboardMetrics {
    pub range: DateRange,
    pub total_revenue: Decimal,
    pub payments_revenue: Decimal,
    pub elective_revenue: Decimal,
    pub fanbasis_revenue: Decimal,
    pub refunded_total: Decimal,
    pub successful_payments: usize,
    pub elective_sales: usize,
    pub fanbasis_sales: usize,
    /// Distinct customers with a successful payment, an Elective or Fanbasis
    /// sale, or a sheet row in the window, keyed by user id or else email.
    pub customers: usize,
    pub aov: Decimal,
    /// `total_revenue / customers`. Sheet-only customers count in the
    /// denominator while their cash stays out of `total_revenue`.
    pub arpu: Decimal,
    pub sheet_cash_collected: Decimal,
    pub active_memberships: usize,
    pub crm_contacts: usize,
    pub opportunities: usize,
    pub conversion_rate: Decimal,
    pub trend: Vec<TrendPoint>,
    pub top_performers: Vec<TopPerformer>,
    pub pipeline: Vec<PipelineStageStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomerRevenue {
    pub company_id: Uuid,
    pub user_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub payments: Decimal,
    pub elective: Decimal,
    pub fanbasis: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpportunityView {
    pub company_id: Uuid,
    pub external_id: String,
    pub name: Option<String>,
    pub status: Option<String>,
    pub monetary_value: Decimal,
    pub pipeline_name: Option<String>,
    pub stage_name: Option<String>,
}

/// Human-readable pipeline/stage names. Unknown ids display as themselves.
#[derive(Debug, Clone, Default)]
pub struct StageDirectory {
    pipelines: HashMap<(Uuid, String), String>,
    stages: HashMap<(Uuid, String), String>,
}

impl StageDirectory {
    pub fn new(pipelines: &[CrmPipeline], stages: &[CrmPipelineStage]) -> Self {
        Self {
            pipelines: pipelines
                .iter()
                .map(|p| ((p.company_id, p.external_id.clone()), p.name.clone()))
                .collect(),
            stages: stages
                .iter()
                .map(|s| ((s.company_id, s.external_id.clone()), s.name.clone()))
                .collect(),
        }
    }

    pub fn pipeline_name(&self, company_id: Uuid, pipeline_id: &str) -> String {
        self.pipelines
            .get(&(company_id, pipeline_id.to_string()))
            .cloned()
            .unwrap_or_else(|| pipeline_id.to_string())
    }

    pub fn stage_name(&self, company_id: Uuid, stage_id: &str) -> String {
        self.stages
            .get(&(company_id, stage_id.to_string()))
            .cloned()
            .unwrap_or_else(|| stage_id.to_string())
    }

    pub fn describe(&self, opportunity: &CrmOpportunity) -> OpportunityView {
        let company_id = opportunity.company_id;
        OpportunityView {
            company_id,
            external_id: opportunity.external_id.clone(),
            name: opportunity.name.clone(),
            status: opportunity.status.clone(),
            monetary_value: opportunity.monetary_value,
            pipeline_name: opportunity
                .pipeline_id
                .as_deref()
                .map(|id| self.pipeline_name(company_id, id)),
            stage_name: opportunity
                .stage_id
                .as_deref()
                .map(|id| self.stage_name(company_id, id)),
        }
    }

    fn stats(&self, stages: &[CrmPipelineStage], opportunities: &[CrmOpportunity]) -> Vec<PipelineStageStats> {
        let mut stats: BTreeMap<(Uuid, String), PipelineStageStats> = stages
            .iter()
            .map(|s| {
                (
                    (s.company_id, s.external_id.clone()),
                    PipelineStageStats {
                        company_id: s.company_id,
                        pipeline_id: s.pipeline_external_id.clone(),
                        pipeline_name: self.pipeline_name(s.company_id, &s.pipeline_external_id),
                        stage_id: s.external_id.clone(),
                        stage_name: s.name.clone(),
                        opportunities: 0,
                        value: Decimal::ZERO,
                        position: s.position,
                    },
                )
            })
            .collect();

        for opportunity in opportunities {
            let Some(stage_id) = opportunity.stage_id.as_deref() else {
                continue;
            };
            let company_id = opportunity.company_id;
            let entry = stats
                .entry((company_id, stage_id.to_string()))
                .or_insert_with(|| {
                    let pipeline_id = opportunity.pipeline_id.clone().unwrap_or_default();
                    PipelineStageStats {
                        company_id,
                        pipeline_name: self.pipeline_name(company_id, &pipeline_id),
                        pipeline_id,
                        stage_id: stage_id.to_string(),
                        stage_name: stage_id.to_string(),
                        opportunities: 0,
                        value: Decimal::ZERO,
                        position: i32::MAX,
                    }
                });
            entry.opportunities += 1;
            entry.value += opportunity.monetary_value;
        }

        let mut stats: Vec<_> = stats.into_values().collect();
        stats.sort_by(|a, b| {
            (a.company_id, &a.pipeline_name, a.position, &a.stage_name)
                .cmp(&(b.company_id, &b.pipeline_name, b.position, &b.stage_name))
        });
        stats
    }
}

/// Everything the engine reads, loaded once per call.
struct Ledger {
    users: Vec<User>,
    payments: Vec<Payment>,
    memberships: Vec<Membership>,
    sheet_rows: Vec<SheetRow>,
    elective: Vec<ElectiveSale>,
    fanbasis: Vec<FanbasisSale>,
    contacts: Vec<CrmContact>,
    opportunities: Vec<CrmOpportunity>,
    pipelines: Vec<CrmPipeline>,
    stages: Vec<CrmPipelineStage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CustomerKey {
    User(Uuid),
    Email(String),
}

fn customer_key(user_id: Option<Uuid>, email: Option<&str>) -> Option<CustomerKey> {
    user_id
        .map(CustomerKey::User)
        .or_else(|| email.and_then(normalize_email).map(CustomerKey::Email))
}

fn ratio(numerator: Decimal, denominator: usize, dp: u32) -> Decimal {
    if denominator == 0 {
        return Decimal::ZERO;
    }
    (numerator / Decimal::from(denominator as u64))
        .round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

pub struct AggregationEngine<S> {
    store: Arc<S>,
}

impl<S> AggregationEngine<S>
where
    S: CanonicalStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn load(&self, filter: &CompanyFilter) -> Result<Ledger, StoreError> {
        let companies = filter.as_slice();
        let store = self.store.as_ref();
        Ok(Ledger {
            users: EntityRepository::<User>::list(store, companies).await?,
            payments: EntityRepository::<Payment>::list(store, companies).await?,
            memberships: EntityRepository::<Membership>::list(store, companies).await?,
            sheet_rows: EntityRepository::<SheetRow>::list(store, companies).await?,
            elective: EntityRepository::<ElectiveSale>::list(store, companies).await?,
            fanbasis: EntityRepository::<FanbasisSale>::list(store, companies).await?,
            contacts: EntityRepository::<CrmContact>::list(store, companies).await?,
            opportunities: EntityRepository::<CrmOpportunity>::list(store, companies).await?,
            pipelines: EntityRepository::<CrmPipeline>::list(store, companies).await?,
            stages: EntityRepository::<CrmPipelineStage>::list(store, companies).await?,
        })
    }

    pub async fn compute_dashboard(
        &self,
        filter: &CompanyFilter,
        range: &DateRange,
    ) -> Result<DashboardMetrics, AnalyticsError> {
        let ledger = self.load(filter).await?;
        Ok(dashboard(&ledger, range))
    }

    /// Per-customer revenue split by source, for customers linked to a user.
    pub async fn customer_revenue(
        &self,
        filter: &CompanyFilter,
        range: &DateRange,
    ) -> Result<Vec<CustomerRevenue>, AnalyticsError> {
        let ledger = self.load(filter).await?;
        Ok(customer_revenue(&ledger, range))
    }

    /// Opportunities with pipeline and stage ids resolved to names.
    pub async fn opportunities(&self, filter: &CompanyFilter) -> Result<Vec<OpportunityView>, AnalyticsError> {
        let ledger = self.load(filter).await?;
        let directory = StageDirectory::new(&ledger.pipelines, &ledger.stages);
        Ok(ledger.opportunities.iter().map(|o| directory.describe(o)).collect())
    }
}

fn dashboard(ledger: &Ledger, range: &DateRange) -> DashboardMetrics {
    let mut trend: BTreeMap<NaiveDate, TrendPoint> = BTreeMap::new();
    let mut customers: HashSet<CustomerKey> = HashSet::new();
    let mut performers: HashMap<Uuid, (Decimal, usize)> = HashMap::new();

    let mut payments_revenue = Decimal::ZERO;
    let mut refunded_total = Decimal::ZERO;
    let mut successful_payments = 0;
    for p in ledger.payments.iter().filter(|p| range.contains(p.occurred_at.date())) {
        refunded_total += p.refunded_amount;
        if !p.is_successful_revenue() {
            continue;
        }
        let contribution = p.revenue_contribution();
        payments_revenue += contribution;
        successful_payments += 1;
        trend
            .entry(p.occurred_at.date())
            .or_insert_with_key(|d| TrendPoint::empty(*d))
            .payments += contribution;
        customers.extend(customer_key(p.user_id, p.customer_email.as_deref()));
        if let Some(user_id) = p.user_id {
            let slot = performers.entry(user_id).or_default();
            slot.0 += contribution;
            slot.1 += 1;
        }
    }

    let mut elective_revenue = Decimal::ZERO;
    let mut elective_sales = 0;
    for sale in ledger.elective.iter().filter(|s| range.contains(s.sale_date.date())) {
        elective_revenue += sale.net_amount;
        elective_sales += 1;
        trend
            .entry(sale.sale_date.date())
            .or_insert_with_key(|d| TrendPoint::empty(*d))
            .elective += sale.net_amount;
        customers.extend(customer_key(sale.user_id, Some(&sale.customer_email)));
    }

    let mut fanbasis_revenue = Decimal::ZERO;
    let mut fanbasis_sales = 0;
    for sale in ledger.fanbasis.iter().filter(|s| range.contains(s.sale_date.date())) {
        fanbasis_revenue += sale.net_amount;
        fanbasis_sales += 1;
        trend
            .entry(sale.sale_date.date())
            .or_insert_with_key(|d| TrendPoint::empty(*d))
            .fanbasis += sale.net_amount;
        customers.extend(customer_key(sale.user_id, Some(&sale.customer_email)));
    }

    let mut sheet_cash_collected = Decimal::ZERO;
    for row in &ledger.sheet_rows {
        let Some(date) = row.entry_date.filter(|d| range.contains(*d)) else {
            continue;
        };
        sheet_cash_collected += row.amount;
        trend
            .entry(date)
            .or_insert_with_key(|d| TrendPoint::empty(*d))
            .sheet += row.amount;
        customers.extend(customer_key(row.user_id, Some(&row.contact_email)));
    }

    let trend = trend
        .into_values()
        .map(|mut point| {
            point.total = point.payments + point.elective + point.fanbasis;
            point
        })
        .collect();

    let total_revenue = payments_revenue + elective_revenue + fanbasis_revenue;
    let sales = successful_payments + elective_sales + fanbasis_sales;

    let crm_contacts = ledger
        .contacts
        .iter()
        .filter(|c| c.created_at.is_some_and(|t| range.contains(t.date())))
        .count();
    let opportunities = ledger
        .opportunities
        .iter()
        .filter(|o| o.created_at.is_some_and(|t| range.contains(t.date())))
        .count();
    let active_memberships = ledger
        .memberships
        .iter()
        .filter(|m| m.is_active() && range.contains(m.created_at.date()))
        .count();

    let users: HashMap<Uuid, &User> = ledger.users.iter().map(|u| (u.id, u)).collect();
    let mut top_performers: Vec<TopPerformer> = performers
        .into_iter()
        .map(|(user_id, (revenue, payments))| {
            let user = users.get(&user_id);
            TopPerformer {
                user_id,
                email: user.map(|u| u.email.clone()).unwrap_or_default(),
                name: user.and_then(|u| u.name.clone()),
                revenue,
                payments,
            }
        })
        .collect();
    top_performers.sort_by(|a, b| b.revenue.cmp(&a.revenue).then_with(|| a.email.cmp(&b.email)));
    top_performers.truncate(TOP_PERFORMERS);

    let directory = StageDirectory::new(&ledger.pipelines, &ledger.stages);
    let pipeline = directory.stats(&ledger.stages, &ledger.opportunities);

    debug!(
        total = %total_revenue,
        sales,
        customers = customers.len(),
        "dashboard computed"
    );
    DashboardMetrics {
        range: *range,
        total_revenue,
        payments_revenue,
        elective_revenue,
        fanbasis_revenue,
        refunded_total,
        successful_payments,
        elective_sales,
        fanbasis_sales,
        customers: customers.len(),
        aov: ratio(total_revenue, sales, 2),
        arpu: ratio(total_revenue, customers.len(), 2),
        sheet_cash_collected,
        active_memberships,
        crm_contacts,
        opportunities,
        conversion_rate: ratio(Decimal::from(sales as u64), crm_contacts, 4),
        trend,
        top_performers,
        pipeline,
    }
}

fn customer_revenue(ledger: &Ledger, range: &DateRange) -> Vec<CustomerRevenue> {
    let mut by_user: HashMap<Uuid, (Decimal, Decimal, Decimal)> = HashMap::new();
    for p in &ledger.payments {
        if let Some(user_id) = p.user_id.filter(|_| range.contains(p.occurred_at.date())) {
            by_user.entry(user_id).or_default().0 += p.revenue_contribution();
        }
    }
    for s in &ledger.elective {
        if let Some(user_id) = s.user_id.filter(|_| range.contains(s.sale_date.date())) {
            by_user.entry(user_id).or_default().1 += s.net_amount;
        }
    }
    for s in &ledger.fanbasis {
        if let Some(user_id) = s.user_id.filter(|_| range.contains(s.sale_date.date())) {
            by_user.entry(user_id).or_default().2 += s.net_amount;
        }
    }

    let mut out: Vec<CustomerRevenue> = ledger
        .users
        .iter()
        .filter_map(|user| {
            let (payments, elective, fanbasis) = by_user.get(&user.id).copied()?;
            Some(CustomerRevenue {
                company_id: user.company_id,
                user_id: user.id,
                email: user.email.clone(),
                name: user.name.clone(),
                payments,
                elective,
                fanbasis,
                total: payments + elective + fanbasis,
            })
        })
        .collect();
    out.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.email.cmp(&b.email)));
    out
}
