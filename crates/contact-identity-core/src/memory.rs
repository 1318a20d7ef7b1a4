use std::collections::BTreeMap;

use crate::{
    now_utc, ContactId, ContactPatch, ContactRecord, ContactStore, IdentifyRequest,
    IdentityError, IdentityResolver, IdentityView, LinkPrecedence, NewContact,
};

/// Process-local [`ContactStore`] keyed by id.
///
/// Ids start at 1 and increase by one per created record, so iteration order
/// is creation order.
#[derive(Debug, Clone)]
pub struct InMemoryContactStore {
    records: BTreeMap<ContactId, ContactRecord>,
    next_id: i64,
}

impl Default for InMemoryContactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryContactStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 1,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn records(&self) -> Vec<ContactRecord> {
        self.records.values().cloned().collect()
    }

    /// Resolves `request` and restores the previous state if anything fails.
    ///
    /// # Errors
    /// Propagates every [`IdentityError`] raised by the resolver.
    pub fn identify(&mut self, request: &IdentifyRequest) -> Result<IdentityView, IdentityError> {
        identify_with_checkpoint(self, request)
    }
}

/// Resolves against a cloneable store, restoring the clone taken beforehand
/// when the resolve fails.
pub(crate) fn identify_with_checkpoint<S: ContactStore + Clone>(
    store: &mut S,
    request: &IdentifyRequest,
) -> Result<IdentityView, IdentityError> {
    let checkpoint = store.clone();
    let result = IdentityResolver::new(store).resolve(request);
    if result.is_err() {
        *store = checkpoint;
    }
    result
}

impl ContactStore for InMemoryContactStore {
    fn find_match(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Option<ContactRecord>, IdentityError> {
        let found = self.records.values().find(|record| {
            let email_hit = email.is_some() && record.email.as_deref() == email;
            let phone_hit = phone_number.is_some() && record.phone_number.as_deref() == phone_number;
            email_hit || phone_hit
        });
        Ok(found.cloned())
    }

    fn get(&self, id: ContactId) -> Result<Option<ContactRecord>, IdentityError> {
        Ok(self.records.get(&id).cloned())
    }

    fn create(&mut self, contact: &NewContact) -> Result<ContactRecord, IdentityError> {
        let id = ContactId(self.next_id);
        self.next_id += 1;

        let now = now_utc();
        let record = ContactRecord {
            id,
            email: contact.email.clone(),
            phone_number: contact.phone_number.clone(),
            linked_id: contact.linked_id,
            link_precedence: contact.link_precedence,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.records.insert(id, record.clone());
        Ok(record)
    }

    fn update(
        &mut self,
        id: ContactId,
        patch: &ContactPatch,
    ) -> Result<ContactRecord, IdentityError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(IdentityError::NotFound(id))?;
        patch.apply_to(record);
        record.updated_at = now_utc();
        Ok(record.clone())
    }

    fn list_secondaries_of(
        &self,
        primary_id: ContactId,
    ) -> Result<Vec<ContactRecord>, IdentityError> {
        Ok(self
            .records
            .values()
            .filter(|record| {
                record.link_precedence == LinkPrecedence::Secondary
                    && record.linked_id == Some(primary_id)
            })
            .cloned()
            .collect())
    }
}
