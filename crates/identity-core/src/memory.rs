use std::collections::BTreeSet;

use time::OffsetDateTime;

use crate::{
    ContactId, ContactRecord, ContactStore, IdentityError, LinkPrecedence, NewContact,
    TransactionalStore,
};

/// Store calls that can be made to fail through [`MemoryContactStore::fail_on`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum StoreOperation {
    FindMatching,
    Create,
    UpdateLinkage,
    FindByClusterRoot,
    FindById,
    Commit,
}

/// Process-local contact store. Transactions snapshot the table and restore it
/// when the unit of work fails.
#[derive(Debug, Clone, Default)]
pub struct MemoryContactStore {
    contacts: Vec<ContactRecord>,
    last_id: i64,
    failpoints: BTreeSet<StoreOperation>,
}

impl MemoryContactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All contacts in id order.
    #[must_use]
    pub fn contacts(&self) -> &[ContactRecord] {
        &self.contacts
    }

    /// Make every subsequent `operation` fail with [`IdentityError::StoreUnavailable`].
    pub fn fail_on(&mut self, operation: StoreOperation) {
        self.failpoints.insert(operation);
    }

    pub fn clear_failpoints(&mut self) {
        self.failpoints.clear();
    }

    fn check_failpoint(&self, operation: StoreOperation) -> Result<(), IdentityError> {
        if self.failpoints.contains(&operation) {
            return Err(IdentityError::StoreUnavailable(format!(
                "injected failure on {operation:?}"
            )));
        }
        Ok(())
    }

    fn position(&self, id: ContactId) -> Option<usize> {
        self.contacts.binary_search_by_key(&id, |record| record.id).ok()
    }
}

impl ContactStore for MemoryContactStore {
    fn find_matching(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<ContactRecord>, IdentityError> {
        self.check_failpoint(StoreOperation::FindMatching)?;
        Ok(self
            .contacts
            .iter()
            .filter(|record| {
                let email_match = email.is_some() && record.email.as_deref() == email;
                let phone_match =
                    phone_number.is_some() && record.phone_number.as_deref() == phone_number;
                email_match || phone_match
            })
            .cloned()
            .collect())
    }

    fn create(&mut self, contact: &NewContact) -> Result<ContactRecord, IdentityError> {
        self.check_failpoint(StoreOperation::Create)?;
        contact.validate()?;
        if let Some(target) = contact.linked_id {
            if self.position(target).is_none() {
                return Err(IdentityError::StoreConflict(format!(
                    "linked contact {target} does not exist"
                )));
            }
        }

        let now = OffsetDateTime::now_utc();
        self.last_id += 1;
        let record = ContactRecord {
            id: ContactId(self.last_id),
            email: contact.email.clone(),
            phone_number: contact.phone_number.clone(),
            linked_id: contact.linked_id,
            link_precedence: contact.link_precedence,
            created_at: now,
            updated_at: now,
        };
        self.contacts.push(record.clone());
        Ok(record)
    }

    fn update_linkage(
        &mut self,
        id: ContactId,
        link_precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<(), IdentityError> {
        self.check_failpoint(StoreOperation::UpdateLinkage)?;
        if let Some(target) = linked_id {
            if self.position(target).is_none() {
                return Err(IdentityError::StoreConflict(format!(
                    "linked contact {target} does not exist"
                )));
            }
        }
        let index = self.position(id).ok_or_else(|| {
            IdentityError::StoreConflict(format!("cannot relink missing contact {id}"))
        })?;

        let mut updated = self.contacts[index].clone();
        updated.link_precedence = link_precedence;
        updated.linked_id = linked_id;
        updated.updated_at = OffsetDateTime::now_utc();
        updated.validate()?;
        self.contacts[index] = updated;
        Ok(())
    }

    fn find_by_cluster_root(
        &mut self,
        root: ContactId,
    ) -> Result<Vec<ContactRecord>, IdentityError> {
        self.check_failpoint(StoreOperation::FindByClusterRoot)?;
        Ok(self
            .contacts
            .iter()
            .filter(|record| record.id == root || record.linked_id == Some(root))
            .cloned()
            .collect())
    }

    fn find_by_id(&mut self, id: ContactId) -> Result<Option<ContactRecord>, IdentityError> {
        self.check_failpoint(StoreOperation::FindById)?;
        Ok(self.position(id).map(|index| self.contacts[index].clone()))
    }
}

impl TransactionalStore for MemoryContactStore {
    fn transaction<T, F>(&mut self, work: F) -> Result<T, IdentityError>
    where
        F: FnOnce(&mut dyn ContactStore) -> Result<T, IdentityError>,
    {
        let snapshot = self.contacts.clone();
        let last_id = self.last_id;

        let result =
            work(self).and_then(|value| self.check_failpoint(StoreOperation::Commit).map(|()| value));
        if result.is_err() {
            self.contacts = snapshot;
            self.last_id = last_id;
        }
        result
    }
}
