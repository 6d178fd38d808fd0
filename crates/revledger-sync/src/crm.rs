//! Per-user CRM cross-reference: contact by email, then opportunities (with
//! detail backfill) and appointments, in rate-limited batches.

use std::time::Duration;

use futures::future::join_all;
use revledger_adapters::{AdapterError, CrmSource};
use revledger_core::{CrmAppointmentRecord, CrmContactRecord, CrmOpportunityRecord, User};
use revledger_storage::{CanonicalStore, EntityRepository, StoreError, UpsertOutcome};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::writer::{CanonicalStoreWriter, Owned};

#[derive(Debug, Clone, Copy)]
pub struct CrmSyncOptions {
    pub batch_size: usize,
    pub batch_pause: Duration,
}

impl Default for CrmSyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_pause: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CrmSyncStats {
    pub users_considered: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub failed: usize,
    pub opportunities: usize,
    pub contacts_without_opportunities: usize,
    pub backfilled: usize,
    pub missing_stage: usize,
    pub appointments: usize,
}

struct MatchedContact {
    contact: CrmContactRecord,
    opportunities: Vec<CrmOpportunityRecord>,
    appointments: Vec<CrmAppointmentRecord>,
    backfilled: usize,
}

async fn opportunities_with_backfill(
    source: &dyn CrmSource,
    contact_external_id: &str,
) -> Result<(Vec<CrmOpportunityRecord>, usize), AdapterError> {
    let mut opportunities = source.search_opportunities(contact_external_id).await?;
    let mut backfilled = 0;
    for opportunity in opportunities.iter_mut().filter(|o| o.needs_backfill()) {
        if let Some(detail) = source.get_opportunity(&opportunity.external_id).await? {
            opportunity.merge_detail(&detail);
            backfilled += 1;
        }
    }
    Ok((opportunities, backfilled))
}

/// `Ok(None)` is the terminal "unmatched" state.
async fn cross_reference(
    source: &dyn CrmSource,
    email: &str,
) -> Result<Option<MatchedContact>, AdapterError> {
    let Some(contact) = source.search_contact_by_email(email).await? else {
        return Ok(None);
    };
    let (opportunities, appointments) = tokio::join!(
        opportunities_with_backfill(source, &contact.external_id),
        source.list_appointments(&contact.external_id),
    );
    let (opportunities, backfilled) = opportunities?;
    Ok(Some(MatchedContact {
        contact,
        opportunities,
        appointments: appointments?,
        backfilled,
    }))
}

/// Cross-references every user of `company_id` against the CRM.
///
/// A user whose lookup fails is counted and skipped; nothing already stored for
/// that user is touched. Store failures abort the run.
pub async fn sync_crm<S>(
    store: &S,
    company_id: Uuid,
    source: &dyn CrmSource,
    options: CrmSyncOptions,
) -> Result<(CrmSyncStats, UpsertOutcome), StoreError>
where
    S: CanonicalStore + ?Sized,
{
    let users: Vec<User> = EntityRepository::<User>::list(store, Some(&[company_id])).await?;
    let writer = CanonicalStoreWriter::new(store, company_id);
    let mut stats = CrmSyncStats {
        users_considered: users.len(),
        ..Default::default()
    };
    let mut written = UpsertOutcome::default();

    for (batch_no, batch) in users.chunks(options.batch_size.max(1)).enumerate() {
        if batch_no > 0 && !options.batch_pause.is_zero() {
            tokio::time::sleep(options.batch_pause).await;
        }

        let lookups = join_all(batch.iter().map(|user| cross_reference(source, &user.email))).await;
        let mut matched = Vec::new();
        for (user, lookup) in batch.iter().zip(lookups) {
            match lookup {
                Ok(Some(found)) => {
                    stats.matched += 1;
                    matched.push((user.id, found));
                }
                Ok(None) => {
                    stats.unmatched += 1;
                    debug!(user_email = %user.email, "no crm contact for user");
                }
                Err(err) => {
                    stats.failed += 1;
                    warn!(user_email = %user.email, error = %err, "crm lookup failed; keeping previous data");
                }
            }
        }
        written += write_matched(&writer, matched, &mut stats).await?;
    }

    info!(
        %company_id,
        users = stats.users_considered,
        matched = stats.matched,
        unmatched = stats.unmatched,
        failed = stats.failed,
        "crm cross-reference finished"
    );
    Ok((stats, written))
}

async fn write_matched<S>(
    writer: &CanonicalStoreWriter<'_, S>,
    matched: Vec<(Uuid, MatchedContact)>,
    stats: &mut CrmSyncStats,
) -> Result<UpsertOutcome, StoreError>
where
    S: CanonicalStore + ?Sized,
{
    if matched.is_empty() {
        return Ok(UpsertOutcome::default());
    }
    let contacts = matched
        .iter()
        .map(|(user_id, found)| Owned {
            owner: *user_id,
            record: found.contact.clone(),
        })
        .collect();
    let (contact_ids, mut written) = writer.upsert_crm_contacts(contacts).await?;

    let mut opportunities = Vec::new();
    let mut appointments = Vec::new();
    for (_, found) in matched {
        let Some(&contact_id) = contact_ids.get(&found.contact.external_id) else {
            continue;
        };
        if found.opportunities.is_empty() {
            stats.contacts_without_opportunities += 1;
        }
        stats.opportunities += found.opportunities.len();
        stats.appointments += found.appointments.len();
        stats.backfilled += found.backfilled;
        for opportunity in found.opportunities {
            if opportunity.stage_id.is_none() {
                stats.missing_stage += 1;
                debug!(opportunity = %opportunity.external_id, "opportunity has no stage after backfill");
            }
            opportunities.push(Owned {
                owner: contact_id,
                record: opportunity,
            });
        }
        appointments.extend(found.appointments.into_iter().map(|record| Owned {
            owner: contact_id,
            record,
        }));
    }

    written += writer.upsert_crm_opportunities(opportunities).await?;
    written += writer.upsert_crm_appointments(appointments).await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{seed_users, FakeCrm};
    use revledger_core::{CrmAppointment, CrmContact, CrmOpportunity};
    use revledger_storage::MemoryStore;

    fn options() -> CrmSyncOptions {
        CrmSyncOptions {
            batch_size: 2,
            batch_pause: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn matched_unmatched_and_backfilled_users_are_counted() {
        let store = MemoryStore::new();
        let company_id = Uuid::new_v4();
        seed_users(&store, company_id, &["ann@example.com", "bo@example.com", "cy@example.com"]).await;
        let crm = FakeCrm::default()
            .with_contact("ann@example.com", "c_ann")
            .with_opportunity("c_ann", "o1", None)
            .with_detail("o1", "s_won")
            .with_appointment("c_ann", "a1")
            .with_contact("bo@example.com", "c_bo");

        let (stats, _) = sync_crm(&store, company_id, &crm, options()).await.unwrap();

        assert_eq!(stats.users_considered, 3);
        assert_eq!(stats.matched, 2);
        assert_eq!(stats.unmatched, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.backfilled, 1);
        assert_eq!(stats.missing_stage, 0);
        assert_eq!(stats.contacts_without_opportunities, 1);

        let opportunities: Vec<CrmOpportunity> =
            EntityRepository::<CrmOpportunity>::list(&store, None).await.unwrap();
        assert_eq!(opportunities.len(), 1);
        assert_eq!(opportunities[0].stage_id.as_deref(), Some("s_won"));
        let contacts: Vec<CrmContact> = EntityRepository::<CrmContact>::list(&store, None).await.unwrap();
        assert_eq!(opportunities[0].contact_id, contacts.iter().find(|c| c.external_id == "c_ann").unwrap().id);
        let appointments: Vec<CrmAppointment> =
            EntityRepository::<CrmAppointment>::list(&store, None).await.unwrap();
        assert_eq!(appointments.len(), 1);
    }

    #[tokio::test]
    async fn opportunity_without_stage_is_kept_as_is() {
        let store = MemoryStore::new();
        let company_id = Uuid::new_v4();
        seed_users(&store, company_id, &["ann@example.com"]).await;
        let crm = FakeCrm::default()
            .with_contact("ann@example.com", "c_ann")
            .with_opportunity("c_ann", "o1", None);

        let (stats, _) = sync_crm(&store, company_id, &crm, options()).await.unwrap();

        assert_eq!(stats.backfilled, 0);
        assert_eq!(stats.missing_stage, 1);
        let opportunities: Vec<CrmOpportunity> =
            EntityRepository::<CrmOpportunity>::list(&store, None).await.unwrap();
        assert_eq!(opportunities.len(), 1);
        assert!(opportunities[0].stage_id.is_none());
    }

    #[tokio::test]
    async fn one_failing_user_keeps_previous_data_and_spares_the_batch() {
        let store = MemoryStore::new();
        let company_id = Uuid::new_v4();
        seed_users(&store, company_id, &["ann@example.com", "bo@example.com"]).await;
        let healthy = FakeCrm::default()
            .with_contact("ann@example.com", "c_ann")
            .with_opportunity("c_ann", "o1", Some("s1"))
            .with_contact("bo@example.com", "c_bo")
            .with_opportunity("c_bo", "o2", Some("s1"));
        sync_crm(&store, company_id, &healthy, options()).await.unwrap();

        let flaky = healthy
            .with_opportunity("c_bo", "o3", Some("s2"))
            .failing_opportunities_for("c_ann");
        let (stats, _) = sync_crm(&store, company_id, &flaky, options()).await.unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.matched, 1);
        let opportunities: Vec<CrmOpportunity> =
            EntityRepository::<CrmOpportunity>::list(&store, None).await.unwrap();
        let mut ids: Vec<_> = opportunities.iter().map(|o| o.external_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, ["o1", "o2", "o3"]);
    }
}
