use crate::{
    ContactId, ContactPatch, ContactRecord, ContactStore, IdentifyRequest, IdentityError,
    IdentityView, NewContact, Observation,
};

/// What a single resolve changed in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No record shared a value; a standalone primary was created.
    CreatedPrimary { primary: ContactId },
    /// The matched record carried exactly the observed pair; a secondary copy
    /// was attached to the group primary.
    DuplicateSecondary {
        primary: ContactId,
        created: ContactId,
    },
    /// A primary shared one value but not the other. The observation became
    /// the new primary and the old group moved underneath it.
    Promoted {
        primary: ContactId,
        demoted: ContactId,
        relinked: Vec<ContactId>,
    },
    /// A secondary shared one value but not the other; nothing was written.
    AlreadyCovered {
        primary: ContactId,
        matched: ContactId,
    },
}

impl Resolution {
    #[must_use]
    pub fn primary(&self) -> ContactId {
        match self {
            Self::CreatedPrimary { primary }
            | Self::DuplicateSecondary { primary, .. }
            | Self::Promoted { primary, .. }
            | Self::AlreadyCovered { primary, .. } => *primary,
        }
    }
}

/// Matching and linking decisions over a [`ContactStore`].
///
/// The resolver keeps no state of its own. Atomicity is the store's concern:
/// callers run it against a transaction-scoped store and commit only on `Ok`.
pub struct IdentityResolver<'s, S: ContactStore + ?Sized> {
    store: &'s mut S,
}

impl<'s, S: ContactStore + ?Sized> IdentityResolver<'s, S> {
    pub fn new(store: &'s mut S) -> Self {
        Self { store }
    }

    /// Validates the request, applies the required mutations and returns the
    /// resulting identity group.
    ///
    /// # Errors
    /// - [`IdentityError::Validation`] when neither field is present. No store
    ///   call is made in that case.
    /// - [`IdentityError::Storage`] for backend failures.
    /// - [`IdentityError::Consistency`] when stored links are broken or a
    ///   record disappears mid-resolve.
    pub fn resolve(&mut self, request: &IdentifyRequest) -> Result<IdentityView, IdentityError> {
        let observation = request.validate()?;
        let resolution = self.apply(&observation)?;
        build_view(&*self.store, resolution.primary())
    }

    /// # Errors
    /// See [`IdentityResolver::resolve`].
    pub fn apply(&mut self, observation: &Observation) -> Result<Resolution, IdentityError> {
        let matched = self.store.find_match(
            observation.email.as_deref(),
            observation.phone_number.as_deref(),
        )?;

        let Some(matched) = matched else {
            let created = self.store.create(&NewContact::primary(observation))?;
            tracing::debug!(primary = %created.id, "no match; created primary contact");
            return Ok(Resolution::CreatedPrimary {
                primary: created.id,
            });
        };

        let group_primary = self.group_primary_of(&matched)?;

        if observation.matches_exactly(&matched) {
            let created = self
                .store
                .create(&NewContact::secondary(observation, group_primary))?;
            tracing::debug!(
                primary = %group_primary,
                matched = %matched.id,
                created = %created.id,
                "exact match; attached duplicate secondary"
            );
            return Ok(Resolution::DuplicateSecondary {
                primary: group_primary,
                created: created.id,
            });
        }

        if matched.is_primary() {
            return self.promote(observation, &matched);
        }

        tracing::debug!(
            primary = %group_primary,
            matched = %matched.id,
            "partial match on secondary; group unchanged"
        );
        Ok(Resolution::AlreadyCovered {
            primary: group_primary,
            matched: matched.id,
        })
    }

    fn promote(
        &mut self,
        observation: &Observation,
        former: &ContactRecord,
    ) -> Result<Resolution, IdentityError> {
        let secondaries = self.store.list_secondaries_of(former.id)?;
        let promoted = self.store.create(&NewContact::primary(observation))?;

        // Secondaries move first so no row ever points at a demoted record.
        let mut relinked = Vec::with_capacity(secondaries.len());
        for secondary in &secondaries {
            self.store
                .update(secondary.id, &ContactPatch::relink(promoted.id))
                .map_err(vanished)?;
            relinked.push(secondary.id);
        }
        self.store
            .update(former.id, &ContactPatch::demote_under(promoted.id))
            .map_err(vanished)?;

        tracing::debug!(
            primary = %promoted.id,
            demoted = %former.id,
            relinked = relinked.len(),
            "partial match on primary; promoted new contact"
        );
        Ok(Resolution::Promoted {
            primary: promoted.id,
            demoted: former.id,
            relinked,
        })
    }

    fn group_primary_of(&self, record: &ContactRecord) -> Result<ContactId, IdentityError> {
        if record.is_primary() {
            return Ok(record.id);
        }

        let primary_id = record.group_primary_id()?;
        match self.store.get(primary_id)? {
            Some(primary) if primary.is_primary() => Ok(primary.id),
            Some(_) => Err(IdentityError::Consistency(format!(
                "contact {} links to {primary_id}, which is not a primary",
                record.id
            ))),
            None => Err(IdentityError::Consistency(format!(
                "contact {} links to missing contact {primary_id}",
                record.id
            ))),
        }
    }
}

fn vanished(err: IdentityError) -> IdentityError {
    match err {
        IdentityError::NotFound(id) => {
            IdentityError::Consistency(format!("contact {id} disappeared during resolution"))
        }
        other => other,
    }
}

/// Assembles the view for the group headed by `primary_id`.
///
/// Emails and phone numbers start with the primary's values, followed by each
/// secondary's in creation order; absent and repeated values are skipped.
///
/// # Errors
/// Returns [`IdentityError::Consistency`] if `primary_id` is missing or is not
/// a primary, and propagates store failures.
pub fn build_view<S: ContactStore + ?Sized>(
    store: &S,
    primary_id: ContactId,
) -> Result<IdentityView, IdentityError> {
    let primary = store.get(primary_id)?.ok_or_else(|| {
        IdentityError::Consistency(format!("group primary {primary_id} does not exist"))
    })?;
    if !primary.is_primary() {
        return Err(IdentityError::Consistency(format!(
            "contact {primary_id} is not a primary"
        )));
    }

    let secondaries = store.list_secondaries_of(primary_id)?;

    let mut emails = Vec::new();
    let mut phone_numbers = Vec::new();
    for record in std::iter::once(&primary).chain(&secondaries) {
        push_distinct(&mut emails, record.email.as_deref());
        push_distinct(&mut phone_numbers, record.phone_number.as_deref());
    }

    Ok(IdentityView {
        primary_contact_id: primary.id,
        emails,
        phone_numbers,
        secondary_contact_ids: secondaries.iter().map(|record| record.id).collect(),
    })
}

fn push_distinct(values: &mut Vec<String>, candidate: Option<&str>) {
    if let Some(candidate) = candidate {
        if !values.iter().any(|existing| existing == candidate) {
            values.push(candidate.to_string());
        }
    }
}
