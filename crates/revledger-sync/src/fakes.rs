//! In-process source doubles shared by the sync tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use revledger_adapters::{AdapterError, CrmSource, PaymentsSource, SheetSource};
use revledger_core::{
    CrmAppointmentRecord, CrmContactRecord, CrmOpportunityRecord, CrmPipelineRecord,
    CrmStageRecord, CustomerRef, MembershipRecord, PaymentRecord, SheetRecord,
};
use revledger_storage::{CanonicalStore, FetchError};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::identity::{IdentitySource, ResolvedIdentity};
use crate::writer::CanonicalStoreWriter;

pub fn outage(adapter: &'static str) -> AdapterError {
    AdapterError::Fetch {
        adapter,
        error: FetchError::HttpStatus {
            status: 503,
            url: format!("https://{adapter}.invalid/"),
            body: "service unavailable".into(),
        },
    }
}

pub fn at(day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, day)
        .unwrap()
        .and_hms_opt(10, 0, 0)
        .unwrap()
}

pub fn payment(id: &str, email: &str, amount: Decimal, day: u32) -> PaymentRecord {
    PaymentRecord {
        external_id: id.into(),
        status: "paid".into(),
        sub_status: None,
        amount,
        amount_before_fees: amount,
        refunded_amount: Decimal::ZERO,
        currency: Some("usd".into()),
        product: Some("Coaching".into()),
        occurred_at: at(day),
        customer: CustomerRef {
            email: Some(email.into()),
            ..Default::default()
        },
    }
}

pub fn membership(id: &str, email: &str, name: Option<&str>) -> MembershipRecord {
    MembershipRecord {
        external_id: id.into(),
        status: "active".into(),
        product: Some("Coaching".into()),
        cancel_at_period_end: false,
        renewal_period_end: None,
        created_at: at(1),
        customer: CustomerRef {
            email: Some(email.into()),
            name: name.map(Into::into),
            ..Default::default()
        },
    }
}

pub fn sheet_row(row_number: i32, email: &str, amount: Decimal) -> SheetRecord {
    SheetRecord {
        row_number,
        entry_date: NaiveDate::from_ymd_opt(2024, 1, 2),
        entry_type: "PIF".into(),
        amount,
        contact_email: email.into(),
        ..Default::default()
    }
}

pub async fn seed_users<S: CanonicalStore + ?Sized>(store: &S, company_id: Uuid, emails: &[&str]) {
    let identities = emails
        .iter()
        .map(|email| ResolvedIdentity {
            email: email.to_string(),
            attributes: Default::default(),
            first_seen_in: IdentitySource::Payments,
        })
        .collect();
    CanonicalStoreWriter::new(store, company_id)
        .upsert_users(identities)
        .await
        .unwrap();
}

#[derive(Debug, Default)]
pub struct FakePayments {
    pub payments: Vec<PaymentRecord>,
    pub memberships: Vec<MembershipRecord>,
}

#[async_trait]
impl PaymentsSource for FakePayments {
    async fn fetch_payments(&self, _company_ref: &str) -> Result<Vec<PaymentRecord>, AdapterError> {
        Ok(self.payments.clone())
    }

    async fn fetch_memberships(&self, _company_ref: &str) -> Result<Vec<MembershipRecord>, AdapterError> {
        Ok(self.memberships.clone())
    }
}

#[derive(Debug, Default)]
pub struct FakeSheet {
    rows: Mutex<Vec<SheetRecord>>,
}

impl FakeSheet {
    pub fn new(rows: Vec<SheetRecord>) -> Self {
        Self { rows: Mutex::new(rows) }
    }

    pub fn set_rows(&self, rows: Vec<SheetRecord>) {
        *self.rows.lock().unwrap() = rows;
    }
}

#[async_trait]
impl SheetSource for FakeSheet {
    async fn fetch_sheet_rows(&self, _sheet_url: &str) -> Result<Vec<SheetRecord>, AdapterError> {
        Ok(self.rows.lock().unwrap().clone())
    }
}

#[derive(Debug, Default, Clone)]
pub struct FakeCrm {
    contacts: HashMap<String, CrmContactRecord>,
    opportunities: HashMap<String, Vec<CrmOpportunityRecord>>,
    details: HashMap<String, CrmOpportunityRecord>,
    appointments: HashMap<String, Vec<CrmAppointmentRecord>>,
    failing_opportunities: HashSet<String>,
    unreachable: bool,
}

impl FakeCrm {
    /// Every call fails.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }

    pub fn with_contact(mut self, email: &str, contact_id: &str) -> Self {
        self.contacts.insert(
            email.to_string(),
            CrmContactRecord {
                external_id: contact_id.into(),
                email: Some(email.into()),
                first_name: Some("Test".into()),
                ..Default::default()
            },
        );
        self
    }

    /// A stage-less opportunity is returned without pipeline or stage ids.
    pub fn with_opportunity(mut self, contact_id: &str, id: &str, stage: Option<&str>) -> Self {
        self.opportunities
            .entry(contact_id.to_string())
            .or_default()
            .push(CrmOpportunityRecord {
                external_id: id.into(),
                contact_external_id: contact_id.into(),
                status: Some("open".into()),
                monetary_value: Decimal::new(50_000, 2),
                pipeline_id: stage.map(|_| "p1".into()),
                stage_id: stage.map(Into::into),
                ..Default::default()
            });
        self
    }

    pub fn with_detail(mut self, id: &str, stage: &str) -> Self {
        self.details.insert(
            id.to_string(),
            CrmOpportunityRecord {
                external_id: id.into(),
                pipeline_id: Some("p1".into()),
                stage_id: Some(stage.into()),
                ..Default::default()
            },
        );
        self
    }

    pub fn with_appointment(mut self, contact_id: &str, id: &str) -> Self {
        self.appointments
            .entry(contact_id.to_string())
            .or_default()
            .push(CrmAppointmentRecord {
                external_id: id.into(),
                title: Some("Discovery call".into()),
                status: Some("confirmed".into()),
                start_time: Some(at(3)),
                ..Default::default()
            });
        self
    }

    pub fn failing_opportunities_for(mut self, contact_id: &str) -> Self {
        self.failing_opportunities.insert(contact_id.to_string());
        self
    }

    fn check(&self) -> Result<(), AdapterError> {
        if self.unreachable {
            Err(outage("crm"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CrmSource for FakeCrm {
    async fn search_contact_by_email(&self, email: &str) -> Result<Option<CrmContactRecord>, AdapterError> {
        self.check()?;
        Ok(self.contacts.get(email).cloned())
    }

    async fn search_opportunities(&self, contact_external_id: &str) -> Result<Vec<CrmOpportunityRecord>, AdapterError> {
        self.check()?;
        if self.failing_opportunities.contains(contact_external_id) {
            return Err(outage("crm"));
        }
        Ok(self
            .opportunities
            .get(contact_external_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_opportunity(&self, opportunity_id: &str) -> Result<Option<CrmOpportunityRecord>, AdapterError> {
        self.check()?;
        Ok(self.details.get(opportunity_id).cloned())
    }

    async fn list_appointments(&self, contact_external_id: &str) -> Result<Vec<CrmAppointmentRecord>, AdapterError> {
        self.check()?;
        Ok(self
            .appointments
            .get(contact_external_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_pipelines(&self) -> Result<Vec<CrmPipelineRecord>, AdapterError> {
        self.check()?;
        Ok(vec![CrmPipelineRecord {
            external_id: "p1".into(),
            name: "Sales".into(),
            stages: vec![
                CrmStageRecord {
                    external_id: "s1".into(),
                    name: "Booked".into(),
                    position: 0,
                },
                CrmStageRecord {
                    external_id: "s_won".into(),
                    name: "Won".into(),
                    position: 1,
                },
            ],
        }])
    }
}
