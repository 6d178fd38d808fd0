//! Merges every source's customer data into one identity per normalized email.

use std::collections::{BTreeMap, HashMap};

use revledger_core::{
    non_empty, normalize_email, ElectiveRecord, FanbasisRecord, Keyed, MembershipRecord,
    PaymentRecord, SheetRecord, User, UserAttributes,
};
use serde::Serialize;
use uuid::Uuid;

/// Sources in the order their attributes are merged. Earlier sources win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    Payments,
    Memberships,
    Sheet,
    Elective,
    Fanbasis,
}

/// Everything one sync (or one upload) observed for a company.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityInputs<'a> {
    pub payments: &'a [PaymentRecord],
    pub memberships: &'a [MembershipRecord],
    pub sheet_rows: &'a [SheetRecord],
    pub elective: &'a [ElectiveRecord],
    pub fanbasis: &'a [FanbasisRecord],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedIdentity {
    pub email: String,
    pub attributes: UserAttributes,
    pub first_seen_in: IdentitySource,
}

impl Keyed for ResolvedIdentity {
    fn natural_key(&self) -> String {
        self.email.clone()
    }
}

#[derive(Debug, Default)]
pub struct IdentityResolver {
    identities: BTreeMap<String, ResolvedIdentity>,
    unresolvable: usize,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one sighting in. Only empty attributes are filled.
    pub fn observe(&mut self, source: IdentitySource, email: Option<&str>, seen: UserAttributes) {
        let Some(email) = email.and_then(normalize_email) else {
            self.unresolvable += 1;
            return;
        };
        let seen = UserAttributes {
            name: non_empty(seen.name.as_deref()),
            username: non_empty(seen.username.as_deref()),
            external_payment_id: non_empty(seen.external_payment_id.as_deref()),
        };
        let identity = self
            .identities
            .entry(email.clone())
            .or_insert_with(|| ResolvedIdentity {
                email,
                attributes: UserAttributes::default(),
                first_seen_in: source,
            });
        let merged = &mut identity.attributes;
        if merged.name.is_none() {
            merged.name = seen.name;
        }
        if merged.username.is_none() {
            merged.username = seen.username;
        }
        if merged.external_payment_id.is_none() {
            merged.external_payment_id = seen.external_payment_id;
        }
    }

    /// Records with no usable email; they are stored but never linked to a user.
    pub fn unresolvable(&self) -> usize {
        self.unresolvable
    }

    pub fn into_identities(self) -> Vec<ResolvedIdentity> {
        self.identities.into_values().collect()
    }
}

pub fn resolve_identities(inputs: &IdentityInputs<'_>) -> (Vec<ResolvedIdentity>, usize) {
    let mut resolver = IdentityResolver::new();
    for p in inputs.payments {
        resolver.observe(
            IdentitySource::Payments,
            p.customer.email.as_deref(),
            p.customer.attributes(),
        );
    }
    for m in inputs.memberships {
        resolver.observe(
            IdentitySource::Memberships,
            m.customer.email.as_deref(),
            m.customer.attributes(),
        );
    }
    for row in inputs.sheet_rows {
        resolver.observe(
            IdentitySource::Sheet,
            Some(&row.contact_email),
            UserAttributes {
                name: Some(row.contact_name.clone()),
                ..Default::default()
            },
        );
    }
    for sale in inputs.elective {
        resolver.observe(
            IdentitySource::Elective,
            Some(&sale.customer_email),
            UserAttributes {
                name: sale.customer_name.clone(),
                ..Default::default()
            },
        );
    }
    for sale in inputs.fanbasis {
        resolver.observe(
            IdentitySource::Fanbasis,
            Some(&sale.customer_email),
            UserAttributes {
                name: sale.customer_name.clone(),
                ..Default::default()
            },
        );
    }
    let unresolvable = resolver.unresolvable();
    (resolver.into_identities(), unresolvable)
}

/// Normalized email -> user id for one company.
#[derive(Debug, Clone, Default)]
pub struct UserIndex {
    by_email: HashMap<String, Uuid>,
}

impl UserIndex {
    pub fn from_users<'a>(users: impl IntoIterator<Item = &'a User>) -> Self {
        Self {
            by_email: users.into_iter().map(|u| (u.email.clone(), u.id)).collect(),
        }
    }

    pub fn user_id(&self, raw_email: Option<&str>) -> Option<Uuid> {
        raw_email
            .and_then(normalize_email)
            .and_then(|email| self.by_email.get(&email).copied())
    }
}
