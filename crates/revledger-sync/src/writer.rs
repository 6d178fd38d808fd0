//! Idempotent writes into the canonical store, one company at a time.
//!
//! Every entity goes through `upsert_batch`; the builders here only decide what a
//! row looks like and whether an existing row changed.

use std::collections::HashMap;

use chrono::Utc;
use revledger_core::{
    normalize_email, normalize_email_opt, Company, CrmAppointment, CrmAppointmentRecord,
    CrmContact, CrmContactRecord, CrmOpportunity, CrmOpportunityRecord, CrmPipeline,
    CrmPipelineRecord, CrmPipelineStage, ElectiveRecord, ElectiveSale, Entity, FanbasisRecord,
    FanbasisSale, FlatStageRecord, Keyed, Membership, MembershipRecord, Payment, PaymentRecord,
    SheetRecord, SheetRow, User,
};
use revledger_storage::{
    upsert_batch, CanonicalStore, EntityRepository, SheetRowRepository, StoreError, UpsertOutcome,
};
use uuid::Uuid;

use crate::identity::{ResolvedIdentity, UserIndex};

/// A record paired with the internal id of the row that owns it.
#[derive(Debug, Clone)]
pub struct Owned<R> {
    pub owner: Uuid,
    pub record: R,
}

impl<R: Keyed> Keyed for Owned<R> {
    fn natural_key(&self) -> String {
        self.record.natural_key()
    }
}

fn changed<E: PartialEq>(existing: &E, next: E) -> Option<E> {
    (next != *existing).then_some(next)
}

/// Natural key -> internal id for rows just written.
async fn ids_by_key<E, S>(store: &S, company_id: Uuid, keys: Vec<String>) -> Result<HashMap<String, Uuid>, StoreError>
where
    E: Entity,
    S: EntityRepository<E> + ?Sized,
{
    Ok(EntityRepository::<E>::find_by_keys(store, company_id, &keys)
        .await?
        .into_iter()
        .map(|row| (row.natural_key(), row.id()))
        .collect())
}

/// Registers companies from configuration. Only name and source references are
/// ever updated.
pub async fn upsert_companies<S>(store: &S, companies: &[Company]) -> Result<UpsertOutcome, StoreError>
where
    S: CanonicalStore + ?Sized,
{
    let mut outcome = UpsertOutcome::default();
    for company in companies {
        outcome += upsert_batch(
            store,
            company.id,
            vec![company.clone()],
            Company::clone,
            |existing: &Company, next: &Company| {
                let candidate = Company {
                    created_at: existing.created_at,
                    updated_at: existing.updated_at,
                    ..next.clone()
                };
                changed(existing, candidate).map(|mut c| {
                    c.updated_at = Utc::now();
                    c
                })
            },
        )
        .await?;
    }
    Ok(outcome)
}

pub struct CanonicalStoreWriter<'a, S: ?Sized> {
    store: &'a S,
    company_id: Uuid,
}

impl<'a, S> CanonicalStoreWriter<'a, S>
where
    S: CanonicalStore + ?Sized,
{
    pub fn new(store: &'a S, company_id: Uuid) -> Self {
        Self { store, company_id }
    }

    pub fn company_id(&self) -> Uuid {
        self.company_id
    }

    /// Creates unseen users and fills empty attributes on known ones, then
    /// returns the email index every other write attaches owners through.
    pub async fn upsert_users(
        &self,
        identities: Vec<ResolvedIdentity>,
    ) -> Result<(UserIndex, UpsertOutcome), StoreError> {
        let company_id = self.company_id;
        let now = Utc::now();
        let emails: Vec<String> = identities.iter().map(|i| i.email.clone()).collect();

        let outcome = upsert_batch(
            self.store,
            company_id,
            identities,
            |identity: &ResolvedIdentity| User {
                id: Uuid::new_v4(),
                company_id,
                email: identity.email.clone(),
                name: identity.attributes.name.clone(),
                username: identity.attributes.username.clone(),
                external_payment_id: identity.attributes.external_payment_id.clone(),
                created_at: now,
                updated_at: now,
            },
            |existing: &User, identity: &ResolvedIdentity| {
                let mut next = existing.clone();
                next.fill_missing_from(&identity.attributes).then(|| {
                    next.updated_at = now;
                    next
                })
            },
        )
        .await?;

        let users: Vec<User> =
            EntityRepository::<User>::find_by_keys(self.store, company_id, &emails).await?;
        Ok((UserIndex::from_users(&users), outcome))
    }

    pub async fn upsert_payments(
        &self,
        records: Vec<PaymentRecord>,
        users: &UserIndex,
    ) -> Result<UpsertOutcome, StoreError> {
        let company_id = self.company_id;
        let build = |id: Uuid, user_id: Option<Uuid>, r: &PaymentRecord| Payment {
            id,
            company_id,
            user_id,
            external_id: r.external_id.clone(),
            amount: r.amount,
            amount_before_fees: r.amount_before_fees,
            refunded_amount: r.refunded_amount,
            currency: r.currency.clone(),
            status: r.status.clone(),
            sub_status: r.sub_status.clone(),
            product: r.product.clone(),
            customer_email: normalize_email_opt(r.customer.email.as_deref()),
            occurred_at: r.occurred_at,
        };
        upsert_batch(
            self.store,
            company_id,
            records,
            |r: &PaymentRecord| build(Uuid::new_v4(), users.user_id(r.customer.email.as_deref()), r),
            |existing: &Payment, r: &PaymentRecord| {
                let user_id = users
                    .user_id(r.customer.email.as_deref())
                    .or(existing.user_id);
                changed(existing, build(existing.id, user_id, r))
            },
        )
        .await
    }

    pub async fn upsert_memberships(
        &self,
        records: Vec<MembershipRecord>,
        users: &UserIndex,
    ) -> Result<UpsertOutcome, StoreError> {
        let company_id = self.company_id;
        let build = |id: Uuid, user_id: Option<Uuid>, r: &MembershipRecord| Membership {
            id,
            company_id,
            user_id,
            external_id: r.external_id.clone(),
            status: r.status.clone(),
            product: r.product.clone(),
            customer_email: normalize_email_opt(r.customer.email.as_deref()),
            cancel_at_period_end: r.cancel_at_period_end,
            renewal_period_end: r.renewal_period_end,
            created_at: r.created_at,
        };
        upsert_batch(
            self.store,
            company_id,
            records,
            |r: &MembershipRecord| build(Uuid::new_v4(), users.user_id(r.customer.email.as_deref()), r),
            |existing: &Membership, r: &MembershipRecord| {
                let user_id = users
                    .user_id(r.customer.email.as_deref())
                    .or(existing.user_id);
                changed(existing, build(existing.id, user_id, r))
            },
        )
        .await
    }

    /// Full replace: the company's sheet rows become exactly `records`.
    pub async fn replace_sheet_rows(
        &self,
        records: Vec<SheetRecord>,
        users: &UserIndex,
    ) -> Result<usize, StoreError> {
        let rows = records
            .into_iter()
            .map(|r| SheetRow {
                id: Uuid::new_v4(),
                company_id: self.company_id,
                user_id: users.user_id(Some(&r.contact_email)),
                row_number: r.row_number,
                entry_date: r.entry_date,
                entry_type: r.entry_type,
                amount: r.amount,
                contact_name: r.contact_name,
                contact_email: r.contact_email,
                platform: r.platform,
                closer: r.closer,
                setter: r.setter,
                notes: r.notes,
            })
            .collect();
        self.store.replace_for_company(self.company_id, rows).await
    }

    pub async fn upsert_elective_sales(
        &self,
        records: Vec<ElectiveRecord>,
        users: &UserIndex,
    ) -> Result<UpsertOutcome, StoreError> {
        let company_id = self.company_id;
        let build = |id: Uuid, user_id: Option<Uuid>, r: &ElectiveRecord| ElectiveSale {
            id,
            company_id,
            user_id,
            sale_date: r.sale_date,
            customer_email: normalize_email(&r.customer_email).unwrap_or_else(|| r.customer_email.clone()),
            customer_name: r.customer_name.clone(),
            net_amount: r.net_amount,
        };
        upsert_batch(
            self.store,
            company_id,
            records,
            |r: &ElectiveRecord| build(Uuid::new_v4(), users.user_id(Some(&r.customer_email)), r),
            |existing: &ElectiveSale, r: &ElectiveRecord| {
                let user_id = users.user_id(Some(&r.customer_email)).or(existing.user_id);
                let mut next = build(existing.id, user_id, r);
                next.customer_name = r.customer_name.clone().or_else(|| existing.customer_name.clone());
                changed(existing, next)
            },
        )
        .await
    }

    pub async fn upsert_fanbasis_sales(
        &self,
        records: Vec<FanbasisRecord>,
        users: &UserIndex,
    ) -> Result<UpsertOutcome, StoreError> {
        let company_id = self.company_id;
        let build = |id: Uuid, user_id: Option<Uuid>, r: &FanbasisRecord| FanbasisSale {
            id,
            company_id,
            user_id,
            sale_date: r.sale_date,
            customer_email: normalize_email(&r.customer_email).unwrap_or_else(|| r.customer_email.clone()),
            customer_name: r.customer_name.clone(),
            amount: r.amount,
            net_amount: r.net_amount,
            status: r.status.clone(),
            product: r.product.clone(),
            discount_code: r.discount_code.clone(),
            discount_amount: r.discount_amount,
            payment_method: r.payment_method.clone(),
        };
        upsert_batch(
            self.store,
            company_id,
            records,
            |r: &FanbasisRecord| build(Uuid::new_v4(), users.user_id(Some(&r.customer_email)), r),
            |existing: &FanbasisSale, r: &FanbasisRecord| {
                let user_id = users.user_id(Some(&r.customer_email)).or(existing.user_id);
                changed(existing, build(existing.id, user_id, r))
            },
        )
        .await
    }

    /// Upserts contacts owned by users; returns contact external id -> row id.
    pub async fn upsert_crm_contacts(
        &self,
        contacts: Vec<Owned<CrmContactRecord>>,
    ) -> Result<(HashMap<String, Uuid>, UpsertOutcome), StoreError> {
        let company_id = self.company_id;
        let keys: Vec<String> = contacts.iter().map(Keyed::natural_key).collect();
        let build = |id: Uuid, c: &Owned<CrmContactRecord>| CrmContact {
            id,
            company_id,
            user_id: c.owner,
            external_id: c.record.external_id.clone(),
            first_name: c.record.first_name.clone(),
            last_name: c.record.last_name.clone(),
            email: normalize_email_opt(c.record.email.as_deref()),
            phone: c.record.phone.clone(),
            tags: c.record.tags.clone(),
            created_at: c.record.created_at,
        };
        let outcome = upsert_batch(
            self.store,
            company_id,
            contacts,
            |c: &Owned<CrmContactRecord>| build(Uuid::new_v4(), c),
            |existing: &CrmContact, c: &Owned<CrmContactRecord>| changed(existing, build(existing.id, c)),
        )
        .await?;
        let ids = ids_by_key::<CrmContact, _>(self.store, company_id, keys).await?;
        Ok((ids, outcome))
    }

    pub async fn upsert_crm_opportunities(
        &self,
        opportunities: Vec<Owned<CrmOpportunityRecord>>,
    ) -> Result<UpsertOutcome, StoreError> {
        let company_id = self.company_id;
        let build = |id: Uuid, o: &Owned<CrmOpportunityRecord>| CrmOpportunity {
            id,
            company_id,
            contact_id: o.owner,
            contact_external_id: o.record.contact_external_id.clone(),
            external_id: o.record.external_id.clone(),
            name: o.record.name.clone(),
            status: o.record.status.clone(),
            monetary_value: o.record.monetary_value,
            pipeline_id: o.record.pipeline_id.clone(),
            stage_id: o.record.stage_id.clone(),
            assigned_to: o.record.assigned_to.clone(),
            created_at: o.record.created_at,
        };
        upsert_batch(
            self.store,
            company_id,
            opportunities,
            |o: &Owned<CrmOpportunityRecord>| build(Uuid::new_v4(), o),
            |existing: &CrmOpportunity, o: &Owned<CrmOpportunityRecord>| {
                changed(existing, build(existing.id, o))
            },
        )
        .await
    }

    pub async fn upsert_crm_appointments(
        &self,
        appointments: Vec<Owned<CrmAppointmentRecord>>,
    ) -> Result<UpsertOutcome, StoreError> {
        let company_id = self.company_id;
        let build = |id: Uuid, a: &Owned<CrmAppointmentRecord>| CrmAppointment {
            id,
            company_id,
            contact_id: a.owner,
            external_id: a.record.external_id.clone(),
            title: a.record.title.clone(),
            status: a.record.status.clone(),
            start_time: a.record.start_time,
            end_time: a.record.end_time,
            assigned_user_id: a.record.assigned_user_id.clone(),
        };
        upsert_batch(
            self.store,
            company_id,
            appointments,
            |a: &Owned<CrmAppointmentRecord>| build(Uuid::new_v4(), a),
            |existing: &CrmAppointment, a: &Owned<CrmAppointmentRecord>| {
                changed(existing, build(existing.id, a))
            },
        )
        .await
    }

    /// Pipelines first, then their stages keyed under the pipeline rows.
    pub async fn upsert_crm_pipelines(
        &self,
        pipelines: Vec<CrmPipelineRecord>,
    ) -> Result<UpsertOutcome, StoreError> {
        let company_id = self.company_id;
        let keys: Vec<String> = pipelines.iter().map(Keyed::natural_key).collect();
        let stages: Vec<FlatStageRecord> = pipelines
            .iter()
            .flat_map(CrmPipelineRecord::flattened_stages)
            .collect();

        let build = |id: Uuid, p: &CrmPipelineRecord| CrmPipeline {
            id,
            company_id,
            external_id: p.external_id.clone(),
            name: p.name.clone(),
        };
        let mut outcome = upsert_batch(
            self.store,
            company_id,
            pipelines,
            |p: &CrmPipelineRecord| build(Uuid::new_v4(), p),
            |existing: &CrmPipeline, p: &CrmPipelineRecord| changed(existing, build(existing.id, p)),
        )
        .await?;

        let pipeline_ids = ids_by_key::<CrmPipeline, _>(self.store, company_id, keys).await?;
        let owned: Vec<Owned<FlatStageRecord>> = stages
            .into_iter()
            .filter_map(|stage| {
                pipeline_ids
                    .get(&stage.pipeline_external_id)
                    .map(|&owner| Owned { owner, record: stage })
            })
            .collect();

        let build_stage = |id: Uuid, s: &Owned<FlatStageRecord>| CrmPipelineStage {
            id,
            company_id,
            pipeline_id: s.owner,
            pipeline_external_id: s.record.pipeline_external_id.clone(),
            external_id: s.record.stage.external_id.clone(),
            name: s.record.stage.name.clone(),
            position: s.record.stage.position,
        };
        outcome += upsert_batch(
            self.store,
            company_id,
            owned,
            |s: &Owned<FlatStageRecord>| build_stage(Uuid::new_v4(), s),
            |existing: &CrmPipelineStage, s: &Owned<FlatStageRecord>| {
                changed(existing, build_stage(existing.id, s))
            },
        )
        .await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{resolve_identities, IdentityInputs};
    use chrono::NaiveDate;
    use revledger_core::{CustomerRef, UserAttributes};
    use revledger_storage::MemoryStore;
    use rust_decimal_macros::dec;

    fn company(id: Uuid) -> Company {
        let now = Utc::now();
        Company {
            id,
            name: "Acme".into(),
            payments_company_ref: Some("biz_1".into()),
            crm_location_id: None,
            sheet_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn identity(email: &str, name: Option<&str>) -> ResolvedIdentity {
        ResolvedIdentity {
            email: email.into(),
            attributes: UserAttributes {
                name: name.map(Into::into),
                ..Default::default()
            },
            first_seen_in: crate::identity::IdentitySource::Payments,
        }
    }

    #[tokio::test]
    async fn later_empty_name_never_clears_a_stored_name() {
        let store = MemoryStore::new();
        let company_id = Uuid::new_v4();
        upsert_companies(&store, &[company(company_id)]).await.unwrap();
        let writer = CanonicalStoreWriter::new(&store, company_id);

        writer.upsert_users(vec![identity("ann@example.com", None)]).await.unwrap();
        let (_, second) = writer
            .upsert_users(vec![identity("ann@example.com", Some("Ann"))])
            .await
            .unwrap();
        let (index, third) = writer
            .upsert_users(vec![identity("ann@example.com", None)])
            .await
            .unwrap();

        assert_eq!(second.updated, 1);
        assert_eq!(third.unchanged, 1);
        let users: Vec<User> = EntityRepository::<User>::list(&store, None).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name.as_deref(), Some("Ann"));
        assert_eq!(index.user_id(Some("ann@example.com")), Some(users[0].id));
    }

    #[tokio::test]
    async fn payments_attach_owner_and_normalized_email() {
        let store = MemoryStore::new();
        let company_id = Uuid::new_v4();
        let writer = CanonicalStoreWriter::new(&store, company_id);
        let payments = vec![PaymentRecord {
            external_id: "pay_1".into(),
            status: "paid".into(),
            sub_status: None,
            amount: dec!(100),
            amount_before_fees: dec!(100),
            refunded_amount: dec!(20),
            currency: Some("usd".into()),
            product: None,
            occurred_at: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
            customer: CustomerRef {
                email: Some(" Ann@Example.com".into()),
                ..Default::default()
            },
        }];
        let (identities, _) = resolve_identities(&IdentityInputs {
            payments: &payments,
            ..Default::default()
        });
        let (index, _) = writer.upsert_users(identities).await.unwrap();

        let first = writer.upsert_payments(payments.clone(), &index).await.unwrap();
        let again = writer.upsert_payments(payments, &index).await.unwrap();

        assert_eq!(first.created, 1);
        assert_eq!(again.unchanged, 1);
        let stored: Vec<Payment> = EntityRepository::<Payment>::list(&store, None).await.unwrap();
        assert_eq!(stored[0].customer_email.as_deref(), Some("ann@example.com"));
        assert_eq!(stored[0].user_id, index.user_id(Some("ann@example.com")));
        assert_eq!(stored[0].revenue_contribution(), dec!(80));
    }

    #[tokio::test]
    async fn stages_are_written_under_their_pipeline() {
        let store = MemoryStore::new();
        let company_id = Uuid::new_v4();
        let writer = CanonicalStoreWriter::new(&store, company_id);
        let pipelines = vec![CrmPipelineRecord {
            external_id: "p1".into(),
            name: "Sales".into(),
            stages: vec![
                revledger_core::CrmStageRecord {
                    external_id: "s1".into(),
                    name: "Booked".into(),
                    position: 0,
                },
                revledger_core::CrmStageRecord {
                    external_id: "s2".into(),
                    name: "Won".into(),
                    position: 1,
                },
            ],
        }];

        let outcome = writer.upsert_crm_pipelines(pipelines.clone()).await.unwrap();
        let again = writer.upsert_crm_pipelines(pipelines).await.unwrap();

        assert_eq!(outcome.created, 3);
        assert_eq!(again.unchanged, 3);
        let pipeline: Vec<CrmPipeline> = EntityRepository::<CrmPipeline>::list(&store, None).await.unwrap();
        let stages: Vec<CrmPipelineStage> =
            EntityRepository::<CrmPipelineStage>::list(&store, None).await.unwrap();
        assert!(stages.iter().all(|s| s.pipeline_id == pipeline[0].id));
    }
}
