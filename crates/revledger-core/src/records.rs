//! Normalized handoff records produced by source adapters and upload mappers.
//!
//! Records carry no internal ids and no owning user; the sync engine attaches both
//! once identities are resolved.

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{opportunity_natural_key, sale_natural_key, stage_natural_key, Keyed};

/// Mergeable user attributes, in the order identity resolution fills them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAttributes {
    pub name: Option<String>,
    pub username: Option<String>,
    pub external_payment_id: Option<String>,
}

/// Customer as reported by the payments provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRef {
    pub email: Option<String>,
    pub name: Option<String>,
    pub username: Option<String>,
    pub external_id: Option<String>,
}

impl CustomerRef {
    pub fn attributes(&self) -> UserAttributes {
        UserAttributes {
            name: self.name.clone(),
            username: self.username.clone(),
            external_payment_id: self.external_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub external_id: String,
    pub status: String,
    pub sub_status: Option<String>,
    pub amount: Decimal,
    pub amount_before_fees: Decimal,
    pub refunded_amount: Decimal,
    pub currency: Option<String>,
    pub product: Option<String>,
    pub occurred_at: NaiveDateTime,
    pub customer: CustomerRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub external_id: String,
    pub status: String,
    pub product: Option<String>,
    pub cancel_at_period_end: bool,
    pub renewal_period_end: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub customer: CustomerRef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetRecord {
    /// 1-based data row index (header row excluded).
    pub row_number: i32,
    pub entry_date: Option<NaiveDate>,
    pub entry_type: String,
    pub amount: Decimal,
    pub contact_name: String,
    pub contact_email: String,
    pub platform: String,
    pub closer: String,
    pub setter: String,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectiveRecord {
    pub sale_date: NaiveDateTime,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub net_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanbasisRecord {
    pub sale_date: NaiveDateTime,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub amount: Decimal,
    pub net_amount: Decimal,
    pub status: Option<String>,
    pub product: Option<String>,
    pub discount_code: Option<String>,
    pub discount_amount: Decimal,
    pub payment_method: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmContactRecord {
    pub external_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub tags: Vec<String>,
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmOpportunityRecord {
    pub external_id: String,
    pub contact_external_id: String,
    pub name: Option<String>,
    pub status: Option<String>,
    pub monetary_value: Decimal,
    pub pipeline_id: Option<String>,
    pub stage_id: Option<String>,
    pub assigned_to: Option<String>,
    pub created_at: Option<NaiveDateTime>,
}

impl CrmOpportunityRecord {
    pub fn needs_backfill(&self) -> bool {
        self.pipeline_id.is_none() || self.stage_id.is_none()
    }

    /// Take pipeline/stage ids from a detail fetch without dropping known values.
    pub fn merge_detail(&mut self, detail: &CrmOpportunityRecord) {
        if self.pipeline_id.is_none() {
            self.pipeline_id = detail.pipeline_id.clone();
        }
        if self.stage_id.is_none() {
            self.stage_id = detail.stage_id.clone();
        }
        if self.assigned_to.is_none() {
            self.assigned_to = detail.assigned_to.clone();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmAppointmentRecord {
    pub external_id: String,
    pub title: Option<String>,
    pub status: Option<String>,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub assigned_user_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmStageRecord {
    pub external_id: String,
    pub name: String,
    pub position: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmPipelineRecord {
    pub external_id: String,
    pub name: String,
    pub stages: Vec<CrmStageRecord>,
}

impl CrmPipelineRecord {
    pub fn flattened_stages(&self) -> Vec<FlatStageRecord> {
        self.stages
            .iter()
            .map(|stage| FlatStageRecord {
                pipeline_external_id: self.external_id.clone(),
                stage: stage.clone(),
            })
            .collect()
    }
}

/// A stage paired with its pipeline, keyed like `CrmPipelineStage`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatStageRecord {
    pub pipeline_external_id: String,
    pub stage: CrmStageRecord,
}

impl Keyed for PaymentRecord {
    fn natural_key(&self) -> String {
        self.external_id.clone()
    }
}

impl Keyed for MembershipRecord {
    fn natural_key(&self) -> String {
        self.external_id.clone()
    }
}

impl Keyed for SheetRecord {
    fn natural_key(&self) -> String {
        self.row_number.to_string()
    }
}

impl Keyed for ElectiveRecord {
    fn natural_key(&self) -> String {
        sale_natural_key(self.sale_date, &self.customer_email, self.net_amount)
    }
}

impl Keyed for FanbasisRecord {
    fn natural_key(&self) -> String {
        sale_natural_key(self.sale_date, &self.customer_email, self.amount)
    }
}

impl Keyed for CrmContactRecord {
    fn natural_key(&self) -> String {
        self.external_id.clone()
    }
}

impl Keyed for CrmOpportunityRecord {
    fn natural_key(&self) -> String {
        opportunity_natural_key(&self.external_id, &self.contact_external_id)
    }
}

impl Keyed for CrmAppointmentRecord {
    fn natural_key(&self) -> String {
        self.external_id.clone()
    }
}

impl Keyed for CrmPipelineRecord {
    fn natural_key(&self) -> String {
        self.external_id.clone()
    }
}

impl Keyed for FlatStageRecord {
    fn natural_key(&self) -> String {
        stage_natural_key(&self.pipeline_external_id, &self.stage.external_id)
    }
}
