//! Core domain model for the revenue ledger: tenant-scoped entities, natural keys,
//! and the one definition of "successful revenue" every total is built from.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub mod records;

pub use records::*;

pub const CRATE_NAME: &str = "revledger-core";

pub const STATUS_PAID: &str = "paid";
pub const SUBSTATUS_SUCCEEDED: &str = "succeeded";
pub const SUBSTATUS_RESOLUTION_WON: &str = "resolution_won";

/// Lower-cases and trims an email; `None` when nothing usable remains.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        None
    } else {
        Some(email)
    }
}

pub fn normalize_email_opt(raw: Option<&str>) -> Option<String> {
    raw.and_then(normalize_email)
}

/// Trimmed, non-empty text or `None`.
pub fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// A payment counts as revenue when it is paid, succeeded, or a won dispute.
pub fn is_successful_revenue(status: &str, sub_status: Option<&str>) -> bool {
    status.eq_ignore_ascii_case(STATUS_PAID)
        || sub_status.is_some_and(|s| {
            s.eq_ignore_ascii_case(SUBSTATUS_SUCCEEDED)
                || s.eq_ignore_ascii_case(SUBSTATUS_RESOLUTION_WON)
        })
}

/// Amounts are persisted with two decimal places; everything entering the
/// ledger is rounded to that scale so stored rows key the same as fresh ones.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Content-derived key for sales rows that carry no durable id.
pub fn sale_natural_key(sale_date: NaiveDateTime, email: &str, amount: Decimal) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sale_date.format("%Y-%m-%dT%H:%M:%S").to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(email.trim().to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(round_money(amount).normalize().to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub fn opportunity_natural_key(external_id: &str, contact_external_id: &str) -> String {
    format!("{external_id}:{contact_external_id}")
}

pub fn stage_natural_key(pipeline_external_id: &str, stage_external_id: &str) -> String {
    format!("{pipeline_external_id}:{stage_external_id}")
}

/// Anything that can be matched against persisted rows by a stable key.
pub trait Keyed {
    fn natural_key(&self) -> String;
}

/// Persisted, tenant-scoped row.
pub trait Entity: Keyed + Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn id(&self) -> Uuid;
    fn company_id(&self) -> Uuid;
}

/// Tenant. Loaded from configuration; the sync engine only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    pub payments_company_ref: Option<String>,
    pub crm_location_id: Option<String>,
    pub sheet_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub company_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub username: Option<String>,
    pub external_payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Fill empty attributes from `other`; never clears or replaces a value.
    /// Returns whether anything changed.
    pub fn fill_missing_from(&mut self, other: &UserAttributes) -> bool {
        let mut changed = false;
        for (slot, candidate) in [
            (&mut self.name, &other.name),
            (&mut self.username, &other.username),
            (&mut self.external_payment_id, &other.external_payment_id),
        ] {
            if slot.as_deref().map_or(true, |v| v.trim().is_empty()) {
                if let Some(value) = candidate.as_deref().filter(|v| !v.trim().is_empty()) {
                    *slot = Some(value.to_string());
                    changed = true;
                }
            }
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub company_id: Uuid,
    pub user_id: Option<Uuid>,
    pub external_id: String,
    pub amount: Decimal,
    pub amount_before_fees: Decimal,
    pub refunded_amount: Decimal,
    pub currency: Option<String>,
    pub status: String,
    pub sub_status: Option<String>,
    pub product: Option<String>,
    pub customer_email: Option<String>,
    pub occurred_at: NaiveDateTime,
}

impl Payment {
    pub fn is_successful_revenue(&self) -> bool {
        is_successful_revenue(&self.status, self.sub_status.as_deref())
    }

    /// Revenue this payment adds to any total: net of refunds when successful, else zero.
    pub fn revenue_contribution(&self) -> Decimal {
        if self.is_successful_revenue() {
            self.amount - self.refunded_amount
        } else {
            Decimal::ZERO
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub id: Uuid,
    pub company_id: Uuid,
    pub user_id: Option<Uuid>,
    pub external_id: String,
    pub status: String,
    pub product: Option<String>,
    pub customer_email: Option<String>,
    pub cancel_at_period_end: bool,
    pub renewal_period_end: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

impl Membership {
    pub fn is_active(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "active" | "trialing" | "completed"
        )
    }
}

/// One "cash collected" ledger line. Reporting only, never part of revenue totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetRow {
    pub id: Uuid,
    pub company_id: Uuid,
    pub user_id: Option<Uuid>,
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
pub struct ElectiveSale {
    pub id: Uuid,
    pub company_id: Uuid,
    pub user_id: Option<Uuid>,
    pub sale_date: NaiveDateTime,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub net_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanbasisSale {
    pub id: Uuid,
    pub company_id: Uuid,
    pub user_id: Option<Uuid>,
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmContact {
    pub id: Uuid,
    pub company_id: Uuid,
    pub user_id: Uuid,
    pub external_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub tags: Vec<String>,
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmOpportunity {
    pub id: Uuid,
    pub company_id: Uuid,
    pub contact_id: Uuid,
    pub contact_external_id: String,
    pub external_id: String,
    pub name: Option<String>,
    pub status: Option<String>,
    pub monetary_value: Decimal,
    pub pipeline_id: Option<String>,
    pub stage_id: Option<String>,
    pub assigned_to: Option<String>,
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmAppointment {
    pub id: Uuid,
    pub company_id: Uuid,
    pub contact_id: Uuid,
    pub external_id: String,
    pub title: Option<String>,
    pub status: Option<String>,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub assigned_user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmPipeline {
    pub id: Uuid,
    pub company_id: Uuid,
    pub external_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmPipelineStage {
    pub id: Uuid,
    pub company_id: Uuid,
    pub pipeline_id: Uuid,
    pub pipeline_external_id: String,
    pub external_id: String,
    pub name: String,
    pub position: i32,
}

macro_rules! entity {
    ($ty:ty, $kind:literal, |$s:ident| $key:expr) => {
        impl Keyed for $ty {
            fn natural_key(&self) -> String {
                let $s = self;
                $key
            }
        }

        impl Entity for $ty {
            const KIND: &'static str = $kind;

            fn id(&self) -> Uuid {
                self.id
            }

            fn company_id(&self) -> Uuid {
                self.company_id
            }
        }
    };
}

impl Keyed for Company {
    fn natural_key(&self) -> String {
        self.id.to_string()
    }
}

impl Entity for Company {
    const KIND: &'static str = "company";

    fn id(&self) -> Uuid {
        self.id
    }

    fn company_id(&self) -> Uuid {
        self.id
    }
}

entity!(User, "user", |s| s.email.clone());
entity!(Payment, "payment", |s| s.external_id.clone());
entity!(Membership, "membership", |s| s.external_id.clone());
entity!(SheetRow, "sheet_row", |s| s.row_number.to_string());
entity!(ElectiveSale, "elective_sale", |s| sale_natural_key(
    s.sale_date,
    &s.customer_email,
    s.net_amount
));
entity!(FanbasisSale, "fanbasis_sale", |s| sale_natural_key(
    s.sale_date,
    &s.customer_email,
    s.amount
));
entity!(CrmContact, "crm_contact", |s| s.external_id.clone());
entity!(CrmOpportunity, "crm_opportunity", |s| opportunity_natural_key(
    &s.external_id,
    &s.contact_external_id
));
entity!(CrmAppointment, "crm_appointment", |s| s.external_id.clone());
entity!(CrmPipeline, "crm_pipeline", |s| s.external_id.clone());
entity!(CrmPipelineStage, "crm_pipeline_stage", |s| stage_natural_key(
    &s.pipeline_external_id,
    &s.external_id
));

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn payment(status: &str, sub_status: Option<&str>, amount: Decimal, refunded: Decimal) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            user_id: None,
            external_id: "pay_1".into(),
            amount,
            amount_before_fees: amount,
            refunded_amount: refunded,
            currency: Some("usd".into()),
            status: status.into(),
            sub_status: sub_status.map(Into::into),
            product: None,
            customer_email: None,
            occurred_at: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        }
    }

    #[test]
    fn paid_payment_contributes_amount_net_of_refund() {
        let p = payment("paid", None, dec!(100), dec!(20));
        assert!(p.is_successful_revenue());
        assert_eq!(p.revenue_contribution(), dec!(80));
    }

    #[test]
    fn substatus_alone_can_make_revenue_successful() {
        assert!(payment("open", Some("succeeded"), dec!(10), dec!(0)).is_successful_revenue());
        assert!(payment("open", Some("resolution_won"), dec!(10), dec!(0)).is_successful_revenue());
        let failed = payment("open", Some("failed"), dec!(10), dec!(0));
        assert!(!failed.is_successful_revenue());
        assert_eq!(failed.revenue_contribution(), Decimal::ZERO);
    }

    #[test]
    fn email_normalization_trims_and_lowercases() {
        assert_eq!(normalize_email("  Alice@Example.COM "), Some("alice@example.com".into()));
        assert_eq!(normalize_email("   "), None);
        assert_eq!(normalize_email("not-an-email"), None);
    }

    #[test]
    fn sale_key_ignores_amount_scale_and_email_case() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(
            sale_natural_key(at, "A@b.com", dec!(100)),
            sale_natural_key(at, "a@b.com ", dec!(100.00))
        );
        assert_ne!(
            sale_natural_key(at, "a@b.com", dec!(100)),
            sale_natural_key(at, "a@b.com", dec!(101))
        );
    }

    #[test]
    fn sale_key_is_stable_across_two_decimal_storage() {
        let at = NaiveDate::from_ymd_opt(2024, 1, 5)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(round_money(dec!(99.995)), dec!(100.00));
        assert_eq!(round_money(dec!(-12.345)), dec!(-12.35));
        assert_eq!(
            sale_natural_key(at, "a@b.com", dec!(99.995)),
            sale_natural_key(at, "a@b.com", dec!(100.00))
        );
    }

    #[test]
    fn fill_missing_never_overwrites_with_empty() {
        let now = Utc::now();
        let mut user = User {
            id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            email: "a@b.com".into(),
            name: None,
            username: Some("ally".into()),
            external_payment_id: None,
            created_at: now,
            updated_at: now,
        };
        let changed = user.fill_missing_from(&UserAttributes {
            name: Some("Alice".into()),
            username: Some("other".into()),
            external_payment_id: None,
        });
        assert!(changed);
        assert_eq!(user.name.as_deref(), Some("Alice"));
        assert_eq!(user.username.as_deref(), Some("ally"));

        let changed = user.fill_missing_from(&UserAttributes {
            name: Some(String::new()),
            ..Default::default()
        });
        assert!(!changed);
        assert_eq!(user.name.as_deref(), Some("Alice"));
    }
}
