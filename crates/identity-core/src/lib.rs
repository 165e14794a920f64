use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod memory;

pub use memory::{MemoryContactStore, StoreOperation};

/// Upper bound on `linked_id` hops followed while resolving a cluster root.
pub const MAX_LINK_DEPTH: usize = 64;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("contact not found: {0}")]
    NotFound(ContactId),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("store conflict: {0}")]
    StoreConflict(String),
}

impl IdentityError {
    /// True when the failure was caused by the caller rather than the store.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::NotFound(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ContactId(pub i64);

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

fn check_linkage(
    id: Option<ContactId>,
    link_precedence: LinkPrecedence,
    linked_id: Option<ContactId>,
) -> Result<(), IdentityError> {
    let subject = id.map_or_else(|| "new contact".to_string(), |id| format!("contact {id}"));
    match (link_precedence, linked_id) {
        (LinkPrecedence::Primary, None) => Ok(()),
        (LinkPrecedence::Primary, Some(target)) => Err(IdentityError::StoreConflict(format!(
            "{subject} is primary but links to {target}"
        ))),
        (LinkPrecedence::Secondary, None) => Err(IdentityError::StoreConflict(format!(
            "{subject} is secondary without a linked primary"
        ))),
        (LinkPrecedence::Secondary, Some(target)) if Some(target) == id => {
            Err(IdentityError::StoreConflict(format!("{subject} links to itself")))
        }
        (LinkPrecedence::Secondary, Some(_)) => Ok(()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContactRecord {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ContactRecord {
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// The id this record claims as its cluster root, without following chains.
    #[must_use]
    pub fn claimed_root(&self) -> ContactId {
        match (self.link_precedence, self.linked_id) {
            (LinkPrecedence::Secondary, Some(target)) => target,
            _ => self.id,
        }
    }

    /// Check that `linked_id` is present exactly when the record is secondary.
    ///
    /// # Errors
    /// Returns [`IdentityError::StoreConflict`] for inconsistent linkage.
    pub fn validate(&self) -> Result<(), IdentityError> {
        check_linkage(Some(self.id), self.link_precedence, self.linked_id)
    }
}

/// Insert payload for [`ContactStore::create`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link_precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
}

impl NewContact {
    #[must_use]
    pub fn primary(observation: &Observation) -> Self {
        Self {
            email: observation.email.clone(),
            phone_number: observation.phone_number.clone(),
            link_precedence: LinkPrecedence::Primary,
            linked_id: None,
        }
    }

    #[must_use]
    pub fn secondary(observation: &Observation, primary: ContactId) -> Self {
        Self {
            email: observation.email.clone(),
            phone_number: observation.phone_number.clone(),
            link_precedence: LinkPrecedence::Secondary,
            linked_id: Some(primary),
        }
    }

    /// # Errors
    /// Returns [`IdentityError::StoreConflict`] for inconsistent linkage.
    pub fn validate(&self) -> Result<(), IdentityError> {
        check_linkage(None, self.link_precedence, self.linked_id)
    }
}

/// One normalised (email, phone number) submission.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Observation {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Observation {
    /// Normalise and validate a submission. Values are trimmed and blank values
    /// count as absent.
    ///
    /// # Errors
    /// Returns [`IdentityError::InvalidInput`] when neither field survives normalisation.
    pub fn new(email: Option<String>, phone_number: Option<String>) -> Result<Self, IdentityError> {
        let email = normalize(email);
        let phone_number = normalize(phone_number);
        if email.is_none() && phone_number.is_none() {
            return Err(IdentityError::InvalidInput(
                "at least one of email or phoneNumber must be provided".to_string(),
            ));
        }
        Ok(Self { email, phone_number })
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}

fn normalize(value: Option<String>) -> Option<String> {
    value.map(|raw| raw.trim().to_string()).filter(|trimmed| !trimmed.is_empty())
}

/// Canonical view of one identity cluster.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContactSummary {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

impl ContactSummary {
    /// Build the summary from a settled cluster read in creation order.
    ///
    /// # Errors
    /// Returns [`IdentityError::StoreConflict`] when the primary is missing from `cluster`
    /// or is not marked primary.
    pub fn from_cluster(
        primary_id: ContactId,
        cluster: &[ContactRecord],
    ) -> Result<Self, IdentityError> {
        let primary = cluster.iter().find(|record| record.id == primary_id).ok_or_else(|| {
            IdentityError::StoreConflict(format!("primary {primary_id} missing from its cluster"))
        })?;
        if !primary.is_primary() {
            return Err(IdentityError::StoreConflict(format!(
                "cluster root {primary_id} is not marked primary"
            )));
        }

        Ok(Self {
            primary_contact_id: primary.id,
            emails: primary_first(
                primary.email.as_deref(),
                cluster.iter().map(|record| record.email.as_deref()),
            ),
            phone_numbers: primary_first(
                primary.phone_number.as_deref(),
                cluster.iter().map(|record| record.phone_number.as_deref()),
            ),
            secondary_contact_ids: cluster
                .iter()
                .filter(|record| !record.is_primary())
                .map(|record| record.id)
                .collect(),
        })
    }
}

fn primary_first<'a>(
    lead: Option<&'a str>,
    values: impl Iterator<Item = Option<&'a str>>,
) -> Vec<String> {
    let mut seen = BTreeSet::new();
    lead.into_iter()
        .chain(values.flatten())
        .filter(|value| seen.insert(*value))
        .map(str::to_string)
        .collect()
}

/// Outcome of one reconciliation: the summary plus the mutations it applied.
/// `relinked` lists each touched id once, in ascending order.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Reconciliation {
    pub summary: ContactSummary,
    pub created: Vec<ContactId>,
    pub relinked: Vec<ContactId>,
}

impl Reconciliation {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.relinked.is_empty()
    }
}

/// Record-level operations the reconciler needs from a contact store.
///
/// Every list returned is ordered by creation, which is ascending id.
pub trait ContactStore {
    /// Records whose email equals `email` or whose phone number equals `phone_number`.
    /// Absent arguments do not participate.
    ///
    /// # Errors
    /// Returns a store error when the lookup fails.
    fn find_matching(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<ContactRecord>, IdentityError>;

    /// # Errors
    /// Returns a store error when the insert fails or linkage is inconsistent.
    fn create(&mut self, contact: &NewContact) -> Result<ContactRecord, IdentityError>;

    /// # Errors
    /// Returns a store error when the contact is missing or the write fails.
    fn update_linkage(
        &mut self,
        id: ContactId,
        link_precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<(), IdentityError>;

    /// The record `root` plus every record whose `linked_id` is `root`.
    ///
    /// # Errors
    /// Returns a store error when the lookup fails.
    fn find_by_cluster_root(&mut self, root: ContactId)
        -> Result<Vec<ContactRecord>, IdentityError>;

    /// # Errors
    /// Returns a store error when the lookup fails.
    fn find_by_id(&mut self, id: ContactId) -> Result<Option<ContactRecord>, IdentityError>;
}

/// Atomic-commit boundary over a [`ContactStore`].
pub trait TransactionalStore {
    /// Run `work` inside one transaction. Writes commit together when `work`
    /// returns `Ok` and are discarded when it returns `Err`.
    ///
    /// # Errors
    /// Returns the error produced by `work`, or a store error when the
    /// transaction cannot be opened or committed.
    fn transaction<T, F>(&mut self, work: F) -> Result<T, IdentityError>
    where
        F: FnOnce(&mut dyn ContactStore) -> Result<T, IdentityError>;
}

/// Primacy order: the lower id is the more senior record.
#[must_use]
pub fn seniority(a: &ContactRecord, b: &ContactRecord) -> Ordering {
    a.id.cmp(&b.id).then_with(|| a.created_at.cmp(&b.created_at))
}

#[must_use]
pub fn most_senior(ids: impl IntoIterator<Item = ContactId>) -> Option<ContactId> {
    ids.into_iter().min()
}

/// Integrate one observation into the identity clusters held by `store`.
///
/// The whole sequence of reads, demotions and inserts runs inside a single
/// store transaction.
///
/// # Errors
/// Returns [`IdentityError::StoreUnavailable`] or [`IdentityError::StoreConflict`]
/// when any store call fails. Nothing is persisted in that case.
pub fn reconcile<S>(store: &mut S, observation: &Observation) -> Result<Reconciliation, IdentityError>
where
    S: TransactionalStore,
{
    store.transaction(|contacts| reconcile_in(contacts, observation))
}

/// Read-only canonical view of the cluster containing `contact_id`.
///
/// # Errors
/// Returns [`IdentityError::NotFound`] for unknown ids, or a store error.
pub fn cluster_summary<S>(store: &mut S, contact_id: ContactId) -> Result<ContactSummary, IdentityError>
where
    S: TransactionalStore,
{
    store.transaction(|contacts| {
        let record =
            contacts.find_by_id(contact_id)?.ok_or(IdentityError::NotFound(contact_id))?;
        let (root, _) = find_root(contacts, &record)?;
        let cluster = contacts.find_by_cluster_root(root)?;
        ContactSummary::from_cluster(root, &cluster)
    })
}

fn reconcile_in(
    store: &mut dyn ContactStore,
    observation: &Observation,
) -> Result<Reconciliation, IdentityError> {
    let matched = store.find_matching(observation.email(), observation.phone_number())?;
    tracing::debug!(matched = matched.len(), "seed match complete");

    if matched.is_empty() {
        let created = store.create(&NewContact::primary(observation))?;
        tracing::info!(contact_id = %created.id, "created primary contact");
        let summary = ContactSummary::from_cluster(created.id, std::slice::from_ref(&created))?;
        return Ok(Reconciliation { summary, created: vec![created.id], relinked: Vec::new() });
    }

    let mut relinked = BTreeSet::new();
    let mut roots = BTreeSet::new();
    for record in &matched {
        let (root, hops) = find_root(store, record)?;
        if hops > 1 {
            store.update_linkage(record.id, LinkPrecedence::Secondary, Some(root))?;
            relinked.insert(record.id);
        }
        roots.insert(root);
    }
    tracing::debug!(roots = roots.len(), "resolved cluster roots");

    let mut primary_id = most_senior(roots.iter().copied()).ok_or_else(|| {
        IdentityError::StoreConflict("seed match resolved to no cluster root".to_string())
    })?;
    for root in roots.into_iter().filter(|root| *root != primary_id) {
        absorb_cluster(store, root, primary_id, &mut relinked)?;
    }
    let mut cluster = store.find_by_cluster_root(primary_id)?;

    // Convergence guard: absorb_cluster flattens every member, so a store that
    // honours linkage validation yields a single primary on the first pass.
    loop {
        let primaries =
            cluster.iter().filter(|record| record.is_primary()).map(|record| record.id);
        let Some(canonical) = most_senior(primaries.clone()) else {
            return Err(IdentityError::StoreConflict(format!(
                "cluster {primary_id} has no primary after merge"
            )));
        };
        let others = primaries.filter(|id| *id != canonical).collect::<Vec<_>>();
        if others.is_empty() {
            primary_id = canonical;
            break;
        }
        for other in others {
            absorb_cluster(store, other, canonical, &mut relinked)?;
        }
        primary_id = canonical;
        cluster = store.find_by_cluster_root(primary_id)?;
    }

    let email_known = match observation.email() {
        Some(email) => cluster.iter().any(|record| record.email.as_deref() == Some(email)),
        None => true,
    };
    let phone_known = match observation.phone_number() {
        Some(phone) => cluster.iter().any(|record| record.phone_number.as_deref() == Some(phone)),
        None => true,
    };

    let mut created = Vec::new();
    if !(email_known && phone_known) {
        let record = store.create(&NewContact::secondary(observation, primary_id))?;
        tracing::info!(
            contact_id = %record.id,
            primary_id = %primary_id,
            new_email = !email_known,
            new_phone_number = !phone_known,
            "created secondary contact"
        );
        created.push(record.id);
        cluster = store.find_by_cluster_root(primary_id)?;
    }

    let summary = ContactSummary::from_cluster(primary_id, &cluster)?;
    Ok(Reconciliation { summary, created, relinked: relinked.into_iter().collect() })
}

/// Follow `linked_id` pointers from `record` to its primary. Returns the root and
/// the number of hops taken.
fn find_root(
    store: &mut dyn ContactStore,
    record: &ContactRecord,
) -> Result<(ContactId, usize), IdentityError> {
    if record.is_primary() {
        return Ok((record.id, 0));
    }

    let mut current_id = record.id;
    let mut next = record.linked_id;
    for hops in 1..=MAX_LINK_DEPTH {
        let Some(target) = next else {
            return Err(IdentityError::StoreConflict(format!(
                "contact {current_id} is secondary without a linked primary"
            )));
        };
        let linked = store.find_by_id(target)?.ok_or_else(|| {
            IdentityError::StoreConflict(format!(
                "contact {current_id} links to missing contact {target}"
            ))
        })?;
        if linked.is_primary() {
            return Ok((linked.id, hops));
        }
        current_id = linked.id;
        next = linked.linked_id;
    }

    Err(IdentityError::StoreConflict(format!(
        "link chain from contact {} exceeds {MAX_LINK_DEPTH} hops",
        record.id
    )))
}

/// Demote `root` and re-point every member of its cluster at `primary`.
fn absorb_cluster(
    store: &mut dyn ContactStore,
    root: ContactId,
    primary: ContactId,
    relinked: &mut BTreeSet<ContactId>,
) -> Result<(), IdentityError> {
    let members = store.find_by_cluster_root(root)?;
    for member in members.iter().filter(|member| member.id != primary) {
        store.update_linkage(member.id, LinkPrecedence::Secondary, Some(primary))?;
        relinked.insert(member.id);
    }
    tracing::info!(
        demoted = %root,
        primary_id = %primary,
        members = members.len(),
        "merged identity clusters"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;

    fn observe(email: Option<&str>, phone_number: Option<&str>) -> Observation {
        match Observation::new(email.map(str::to_string), phone_number.map(str::to_string)) {
            Ok(observation) => observation,
            Err(err) => panic!("observation should be valid: {err}"),
        }
    }

    fn submit(
        store: &mut MemoryContactStore,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Reconciliation {
        match reconcile(store, &observe(email, phone_number)) {
            Ok(outcome) => outcome,
            Err(err) => panic!("reconcile should succeed: {err}"),
        }
    }

    fn seed(
        store: &mut MemoryContactStore,
        email: Option<&str>,
        phone_number: Option<&str>,
        link_precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> ContactRecord {
        let contact = NewContact {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
            link_precedence,
            linked_id,
        };
        match store.create(&contact) {
            Ok(record) => record,
            Err(err) => panic!("seed contact should insert: {err}"),
        }
    }

    fn record(store: &MemoryContactStore, id: ContactId) -> ContactRecord {
        match store.contacts().iter().find(|record| record.id == id) {
            Some(record) => record.clone(),
            None => panic!("contact {id} should exist"),
        }
    }

    /// Every pair of records sharing a value must sit in one cluster with a single,
    /// minimum-id primary, and every secondary must point straight at it.
    fn assert_cluster_invariants(store: &MemoryContactStore) {
        let contacts = store.contacts();
        let by_id = contacts.iter().map(|record| (record.id, record)).collect::<BTreeMap<_, _>>();

        for record in contacts {
            if let Err(err) = record.validate() {
                panic!("invalid linkage: {err}");
            }
            if let Some(target) = record.linked_id {
                let Some(linked) = by_id.get(&target) else {
                    panic!("contact {} links to missing {target}", record.id);
                };
                assert!(linked.is_primary(), "contact {} links to secondary {target}", record.id);
                assert!(target < record.id, "primary {target} must be older than {}", record.id);
            }
        }

        for a in contacts {
            for b in contacts {
                let shares_email = a.email.is_some() && a.email == b.email;
                let shares_phone = a.phone_number.is_some() && a.phone_number == b.phone_number;
                if shares_email || shares_phone {
                    assert_eq!(
                        a.claimed_root(),
                        b.claimed_root(),
                        "contacts {} and {} share a value but sit in different clusters",
                        a.id,
                        b.id
                    );
                }
            }
        }
    }

    fn assert_summary_shape(store: &MemoryContactStore, summary: &ContactSummary) {
        let primary = record(store, summary.primary_contact_id);
        assert!(primary.is_primary());
        if let Some(email) = &primary.email {
            assert_eq!(summary.emails.first(), Some(email));
        }
        if let Some(phone_number) = &primary.phone_number {
            assert_eq!(summary.phone_numbers.first(), Some(phone_number));
        }
        let unique_emails = summary.emails.iter().collect::<BTreeSet<_>>();
        assert_eq!(unique_emails.len(), summary.emails.len());
        let unique_phones = summary.phone_numbers.iter().collect::<BTreeSet<_>>();
        assert_eq!(unique_phones.len(), summary.phone_numbers.len());
        let mut sorted = summary.secondary_contact_ids.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, summary.secondary_contact_ids);
    }

    // Test IDs: TREC-001
    #[test]
    fn unseen_observation_creates_single_primary() {
        let mut store = MemoryContactStore::new();
        let outcome = submit(&mut store, Some("lorraine@hillvalley.edu"), Some("123456"));

        assert_eq!(store.contacts().len(), 1);
        assert_eq!(outcome.created, vec![ContactId(1)]);
        assert_eq!(
            outcome.summary,
            ContactSummary {
                primary_contact_id: ContactId(1),
                emails: vec!["lorraine@hillvalley.edu".to_string()],
                phone_numbers: vec!["123456".to_string()],
                secondary_contact_ids: vec![],
            }
        );
        assert!(store.contacts()[0].is_primary());
    }

    // Test IDs: TREC-002
    #[test]
    fn observation_without_fields_is_rejected_before_store_access() {
        let err = Observation::new(Some("   ".to_string()), None);
        assert!(matches!(err, Err(IdentityError::InvalidInput(_))));
        assert!(matches!(Observation::new(None, None), Err(IdentityError::InvalidInput(_))));
        assert!(IdentityError::InvalidInput(String::new()).is_client_error());
        assert!(!IdentityError::StoreUnavailable(String::new()).is_client_error());
    }

    // Test IDs: TREC-003
    #[test]
    fn known_pair_creates_nothing_and_repeats_response() {
        let mut store = MemoryContactStore::new();
        let first = submit(&mut store, Some("doc@hillvalley.edu"), Some("555"));
        let second = submit(&mut store, Some("doc@hillvalley.edu"), Some("555"));
        let third = submit(&mut store, Some("doc@hillvalley.edu"), None);

        assert_eq!(store.contacts().len(), 1);
        assert!(second.is_noop());
        assert!(third.is_noop());
        assert_eq!(first.summary, second.summary);
        assert_eq!(first.summary, third.summary);
    }

    // Test IDs: TREC-004
    #[test]
    fn partial_overlap_adds_secondary_carrying_both_values() {
        let mut store = MemoryContactStore::new();
        submit(&mut store, Some("lorraine@hillvalley.edu"), Some("123456"));
        let outcome = submit(&mut store, Some("mcfly@hillvalley.edu"), Some("123456"));

        assert_eq!(outcome.created, vec![ContactId(2)]);
        let secondary = record(&store, ContactId(2));
        assert_eq!(secondary.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(secondary.linked_id, Some(ContactId(1)));
        assert_eq!(secondary.email.as_deref(), Some("mcfly@hillvalley.edu"));
        assert_eq!(secondary.phone_number.as_deref(), Some("123456"));

        assert_eq!(
            outcome.summary,
            ContactSummary {
                primary_contact_id: ContactId(1),
                emails: vec![
                    "lorraine@hillvalley.edu".to_string(),
                    "mcfly@hillvalley.edu".to_string()
                ],
                phone_numbers: vec!["123456".to_string()],
                secondary_contact_ids: vec![ContactId(2)],
            }
        );
    }

    // Test IDs: TREC-005
    #[test]
    fn bridging_observation_merges_under_older_primary() {
        let mut store = MemoryContactStore::new();
        submit(&mut store, Some("george@hillvalley.edu"), Some("919191"));
        submit(&mut store, Some("biffsucks@hillvalley.edu"), Some("717171"));

        let outcome = submit(&mut store, Some("george@hillvalley.edu"), Some("717171"));
        assert!(outcome.created.is_empty());
        assert_eq!(outcome.relinked, vec![ContactId(2)]);

        let demoted = record(&store, ContactId(2));
        assert_eq!(demoted.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(demoted.linked_id, Some(ContactId(1)));
        assert_eq!(
            outcome.summary,
            ContactSummary {
                primary_contact_id: ContactId(1),
                emails: vec![
                    "george@hillvalley.edu".to_string(),
                    "biffsucks@hillvalley.edu".to_string()
                ],
                phone_numbers: vec!["919191".to_string(), "717171".to_string()],
                secondary_contact_ids: vec![ContactId(2)],
            }
        );

        let by_phone = submit(&mut store, None, Some("717171"));
        let by_email = submit(&mut store, Some("george@hillvalley.edu"), None);
        assert_eq!(by_phone.summary, outcome.summary);
        assert_eq!(by_email.summary, outcome.summary);
        assert_eq!(store.contacts().len(), 2);
    }

    // Test IDs: TREC-006
    #[test]
    fn merge_flattens_members_of_demoted_cluster() {
        let mut store = MemoryContactStore::new();
        submit(&mut store, Some("a@example.com"), Some("100"));
        submit(&mut store, Some("b@example.com"), Some("200"));
        submit(&mut store, Some("c@example.com"), Some("200"));

        let outcome = submit(&mut store, Some("a@example.com"), Some("200"));
        assert_eq!(outcome.relinked, vec![ContactId(2), ContactId(3)]);
        assert_eq!(record(&store, ContactId(3)).linked_id, Some(ContactId(1)));
        assert_eq!(outcome.summary.secondary_contact_ids, vec![ContactId(2), ContactId(3)]);
        assert_cluster_invariants(&store);
    }

    // Test IDs: TREC-007
    #[test]
    fn three_multi_record_clusters_collapse_to_oldest_primary() {
        let mut store = MemoryContactStore::new();
        submit(&mut store, Some("x@example.com"), Some("1"));
        submit(&mut store, Some("y@example.com"), Some("2"));
        submit(&mut store, Some("z@example.com"), Some("3"));
        submit(&mut store, Some("x2@example.com"), Some("1"));
        submit(&mut store, Some("y2@example.com"), Some("2"));
        submit(&mut store, Some("z2@example.com"), Some("3"));

        submit(&mut store, Some("y2@example.com"), Some("3"));
        let outcome = submit(&mut store, Some("x2@example.com"), Some("3"));

        assert_eq!(outcome.summary.primary_contact_id, ContactId(1));
        assert_eq!(outcome.summary.secondary_contact_ids.len(), 5);
        assert_eq!(store.contacts().iter().filter(|record| record.is_primary()).count(), 1);
        assert_cluster_invariants(&store);
    }

    // Test IDs: TREC-008
    #[test]
    fn legacy_chain_is_flattened_when_touched() {
        let mut store = MemoryContactStore::new();
        let root = seed(&mut store, Some("root@example.com"), None, LinkPrecedence::Primary, None);
        let middle = seed(
            &mut store,
            Some("middle@example.com"),
            None,
            LinkPrecedence::Secondary,
            Some(root.id),
        );
        let leaf = seed(
            &mut store,
            Some("leaf@example.com"),
            Some("42"),
            LinkPrecedence::Secondary,
            Some(middle.id),
        );

        let outcome = submit(&mut store, None, Some("42"));
        assert_eq!(outcome.relinked, vec![leaf.id]);
        assert_eq!(record(&store, leaf.id).linked_id, Some(root.id));
        assert_eq!(outcome.summary.primary_contact_id, root.id);
        assert_eq!(outcome.summary.secondary_contact_ids, vec![middle.id, leaf.id]);
    }

    // Test IDs: TREC-016
    #[test]
    fn flattened_chain_member_is_reported_once_when_its_cluster_is_absorbed() {
        let mut store = MemoryContactStore::new();
        let oldest = seed(&mut store, Some("oldest@example.com"), None, LinkPrecedence::Primary, None);
        let younger = seed(&mut store, Some("younger@example.com"), None, LinkPrecedence::Primary, None);
        let middle = seed(
            &mut store,
            Some("middle@example.com"),
            None,
            LinkPrecedence::Secondary,
            Some(younger.id),
        );
        let leaf = seed(
            &mut store,
            None,
            Some("42"),
            LinkPrecedence::Secondary,
            Some(middle.id),
        );

        let outcome = submit(&mut store, Some("oldest@example.com"), Some("42"));
        assert!(outcome.created.is_empty());
        assert_eq!(outcome.relinked, vec![younger.id, middle.id, leaf.id]);
        assert_eq!(outcome.summary.primary_contact_id, oldest.id);
        assert_eq!(outcome.summary.secondary_contact_ids, vec![younger.id, middle.id, leaf.id]);
        assert_cluster_invariants(&store);
    }

    // Test IDs: TREC-009
    #[test]
    fn linkage_cycle_surfaces_store_conflict() {
        let mut store = MemoryContactStore::new();
        let a = seed(&mut store, Some("a@example.com"), None, LinkPrecedence::Primary, None);
        let b = seed(&mut store, Some("b@example.com"), None, LinkPrecedence::Secondary, Some(a.id));
        if let Err(err) = store.update_linkage(a.id, LinkPrecedence::Secondary, Some(b.id)) {
            panic!("fixture relink should succeed: {err}");
        }

        let err = reconcile(&mut store, &observe(Some("b@example.com"), None));
        assert!(matches!(err, Err(IdentityError::StoreConflict(_))));
    }

    // Test IDs: TREC-010
    #[test]
    fn failed_commit_rolls_back_merge() {
        let mut store = MemoryContactStore::new();
        submit(&mut store, Some("a@example.com"), None);
        submit(&mut store, None, Some("999"));
        let before = store.contacts().to_vec();

        store.fail_on(StoreOperation::Commit);
        let err = reconcile(&mut store, &observe(Some("a@example.com"), Some("999")));
        assert!(matches!(err, Err(IdentityError::StoreUnavailable(_))));
        assert_eq!(store.contacts(), before.as_slice());

        store.clear_failpoints();
        let outcome = submit(&mut store, Some("a@example.com"), Some("999"));
        assert_eq!(outcome.relinked, vec![ContactId(2)]);
    }

    // Test IDs: TREC-011
    #[test]
    fn failed_insert_leaves_store_untouched() {
        let mut store = MemoryContactStore::new();
        submit(&mut store, Some("a@example.com"), Some("1"));
        let before = store.contacts().to_vec();

        store.fail_on(StoreOperation::Create);
        let err = reconcile(&mut store, &observe(Some("a@example.com"), Some("2")));
        assert!(matches!(err, Err(IdentityError::StoreUnavailable(_))));
        assert_eq!(store.contacts(), before.as_slice());
    }

    // Test IDs: TREC-012
    #[test]
    fn cluster_summary_resolves_from_any_member() {
        let mut store = MemoryContactStore::new();
        submit(&mut store, Some("a@example.com"), Some("1"));
        let merged = submit(&mut store, Some("b@example.com"), Some("1"));

        for id in [ContactId(1), ContactId(2)] {
            match cluster_summary(&mut store, id) {
                Ok(summary) => assert_eq!(summary, merged.summary),
                Err(err) => panic!("cluster lookup should succeed: {err}"),
            }
        }
        assert_eq!(
            cluster_summary(&mut store, ContactId(77)),
            Err(IdentityError::NotFound(ContactId(77)))
        );
    }

    // Test IDs: TREC-013
    #[test]
    fn summary_serializes_with_wire_field_names() {
        let summary = ContactSummary {
            primary_contact_id: ContactId(1),
            emails: vec!["a@example.com".to_string()],
            phone_numbers: vec![],
            secondary_contact_ids: vec![ContactId(23)],
        };
        let value = match serde_json::to_value(&summary) {
            Ok(value) => value,
            Err(err) => panic!("summary should serialize: {err}"),
        };
        assert_eq!(
            value,
            serde_json::json!({
                "primaryContactId": 1,
                "emails": ["a@example.com"],
                "phoneNumbers": [],
                "secondaryContactIds": [23]
            })
        );
    }

    // Test IDs: TREC-014
    #[test]
    fn primary_without_email_keeps_secondary_email_order() {
        let mut store = MemoryContactStore::new();
        submit(&mut store, None, Some("1"));
        submit(&mut store, Some("b@example.com"), Some("1"));
        let outcome = submit(&mut store, Some("a@example.com"), Some("1"));

        assert_eq!(
            outcome.summary.emails,
            vec!["b@example.com".to_string(), "a@example.com".to_string()]
        );
        assert_eq!(outcome.summary.phone_numbers, vec!["1".to_string()]);
    }

    // Test IDs: TREC-015
    #[test]
    fn seniority_prefers_lower_id() {
        let now = OffsetDateTime::now_utc();
        let older = ContactRecord {
            id: ContactId(3),
            email: None,
            phone_number: Some("1".to_string()),
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
            created_at: now,
            updated_at: now,
        };
        let newer = ContactRecord { id: ContactId(9), ..older.clone() };

        assert_eq!(seniority(&older, &newer), Ordering::Less);
        assert_eq!(seniority(&newer, &older), Ordering::Greater);
        assert_eq!(most_senior([ContactId(9), ContactId(3), ContactId(5)]), Some(ContactId(3)));
        assert_eq!(most_senior(Vec::new()), None);
    }

    fn observation_strategy() -> impl Strategy<Value = (Option<u8>, Option<u8>)> {
        (proptest::option::of(0_u8..5), proptest::option::of(0_u8..5))
            .prop_filter("at least one field", |(email, phone)| email.is_some() || phone.is_some())
    }

    proptest! {
        #[test]
        fn reconciliation_preserves_cluster_invariants(
            submissions in proptest::collection::vec(observation_strategy(), 1..40)
        ) {
            let mut store = MemoryContactStore::new();
            for (email, phone) in submissions {
                let email = email.map(|value| format!("user{value}@example.com"));
                let phone = phone.map(|value| format!("555-010{value}"));
                let outcome = submit(&mut store, email.as_deref(), phone.as_deref());

                assert_cluster_invariants(&store);
                assert_summary_shape(&store, &outcome.summary);
                prop_assert!(outcome.created.len() <= 1);

                let primary = record(&store, outcome.summary.primary_contact_id);
                let members = store
                    .contacts()
                    .iter()
                    .filter(|record| record.claimed_root() == primary.id)
                    .map(|record| record.id)
                    .collect::<Vec<_>>();
                prop_assert_eq!(most_senior(members.iter().copied()), Some(primary.id));

                let repeat = submit(&mut store, email.as_deref(), phone.as_deref());
                prop_assert!(repeat.is_noop());
                prop_assert_eq!(repeat.summary, outcome.summary);
            }
        }

        #[test]
        fn surviving_primary_is_independent_of_bridge_order(
            first_bridge in 0_usize..3,
            second_bridge in 0_usize..3,
        ) {
            let mut store = MemoryContactStore::new();
            submit(&mut store, Some("p0@example.com"), Some("0"));
            submit(&mut store, Some("p1@example.com"), Some("1"));
            submit(&mut store, Some("p2@example.com"), Some("2"));

            let bridges = [
                (Some("p0@example.com"), Some("1")),
                (Some("p1@example.com"), Some("2")),
                (Some("p2@example.com"), Some("0")),
            ];
            submit(&mut store, bridges[first_bridge].0, bridges[first_bridge].1);
            let outcome = submit(&mut store, bridges[second_bridge].0, bridges[(second_bridge + 1) % 3].1);

            assert_cluster_invariants(&store);
            let primaries = store.contacts().iter().filter(|record| record.is_primary()).count();
            prop_assert!(primaries <= 2);
            if primaries == 1 {
                prop_assert_eq!(outcome.summary.primary_contact_id, ContactId(1));
            }
        }
    }
}
