//! Identity matching and linking for contact records.
//!
//! A contact record carries an optional email and an optional phone number.
//! Records that share either value are folded into one identity group: a single
//! primary record plus any number of secondaries pointing at it through
//! `linked_id`. [`IdentityResolver`] decides, for each incoming observation,
//! which record to create and how existing precedence changes. Persistence sits
//! behind the [`ContactStore`] trait.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

mod integrity;
mod memory;
mod resolver;

pub use integrity::{check_integrity, IntegrityIssue, IntegrityReport, IssueSeverity};
pub use memory::InMemoryContactStore;
pub use resolver::{build_view, IdentityResolver, Resolution};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("contact not found: {0}")]
    NotFound(ContactId),
    #[error("consistency violation: {0}")]
    Consistency(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl IdentityError {
    /// Stable machine-readable code for transport layers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "contact_not_found",
            Self::Consistency(_) => "consistency_violation",
            Self::Storage(_) => "storage_unavailable",
        }
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

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
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

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
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
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl ContactRecord {
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Id of the primary this record belongs to.
    ///
    /// # Errors
    /// Returns [`IdentityError::Consistency`] for a secondary without `linked_id`.
    pub fn group_primary_id(&self) -> Result<ContactId, IdentityError> {
        match (self.link_precedence, self.linked_id) {
            (LinkPrecedence::Primary, _) => Ok(self.id),
            (LinkPrecedence::Secondary, Some(linked)) => Ok(linked),
            (LinkPrecedence::Secondary, None) => Err(IdentityError::Consistency(format!(
                "secondary contact {} has no linked_id",
                self.id
            ))),
        }
    }
}

/// Field values for a record the store has not assigned an id to yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
}

impl NewContact {
    #[must_use]
    pub fn primary(observation: &Observation) -> Self {
        Self {
            email: observation.email.clone(),
            phone_number: observation.phone_number.clone(),
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
        }
    }

    #[must_use]
    pub fn secondary(observation: &Observation, primary_id: ContactId) -> Self {
        Self {
            email: observation.email.clone(),
            phone_number: observation.phone_number.clone(),
            linked_id: Some(primary_id),
            link_precedence: LinkPrecedence::Secondary,
        }
    }
}

/// Partial mutation. `None` leaves a field untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactPatch {
    pub email: Option<Option<String>>,
    pub phone_number: Option<Option<String>>,
    pub linked_id: Option<Option<ContactId>>,
    pub link_precedence: Option<LinkPrecedence>,
}

impl ContactPatch {
    #[must_use]
    pub fn demote_under(primary_id: ContactId) -> Self {
        Self {
            linked_id: Some(Some(primary_id)),
            link_precedence: Some(LinkPrecedence::Secondary),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn relink(primary_id: ContactId) -> Self {
        Self {
            linked_id: Some(Some(primary_id)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.phone_number.is_none()
            && self.linked_id.is_none()
            && self.link_precedence.is_none()
    }

    pub fn apply_to(&self, record: &mut ContactRecord) {
        if let Some(email) = &self.email {
            record.email.clone_from(email);
        }
        if let Some(phone_number) = &self.phone_number {
            record.phone_number.clone_from(phone_number);
        }
        if let Some(linked_id) = self.linked_id {
            record.linked_id = linked_id;
        }
        if let Some(link_precedence) = self.link_precedence {
            record.link_precedence = link_precedence;
        }
    }
}

/// Inbound `identify` payload as it arrives on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

impl IdentifyRequest {
    #[must_use]
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
        }
    }

    /// Drops blank fields and rejects requests with nothing left to match on.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] when neither email nor phone is present.
    pub fn validate(&self) -> Result<Observation, IdentityError> {
        let observation = Observation {
            email: non_blank(self.email.as_deref()),
            phone_number: non_blank(self.phone_number.as_deref()),
        };

        if observation.email.is_none() && observation.phone_number.is_none() {
            return Err(IdentityError::Validation(
                "email or phoneNumber must be provided".to_string(),
            ));
        }

        Ok(observation)
    }
}

/// A validated (email, phone) pair with blank values removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub email: Option<String>,
    pub phone_number: Option<String>,
}

impl Observation {
    #[must_use]
    pub fn matches_exactly(&self, record: &ContactRecord) -> bool {
        self.email == record.email && self.phone_number == record.phone_number
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .filter(|raw| !raw.trim().is_empty())
        .map(str::to_string)
}

/// Response for one identity group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityView {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

/// Persistence seam consumed by [`IdentityResolver`].
///
/// Implementations backed by a database are expected to be scoped to one
/// transaction for the duration of a resolve.
pub trait ContactStore {
    /// Lowest-id record whose email equals `email` or whose phone equals
    /// `phone_number`. Absent inputs never match.
    #[allow(clippy::missing_errors_doc)]
    fn find_match(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Option<ContactRecord>, IdentityError>;

    #[allow(clippy::missing_errors_doc)]
    fn get(&self, id: ContactId) -> Result<Option<ContactRecord>, IdentityError>;

    #[allow(clippy::missing_errors_doc)]
    fn create(&mut self, contact: &NewContact) -> Result<ContactRecord, IdentityError>;

    /// # Errors
    /// Returns [`IdentityError::NotFound`] when `id` does not exist.
    fn update(&mut self, id: ContactId, patch: &ContactPatch)
        -> Result<ContactRecord, IdentityError>;

    /// Secondaries linked to `primary_id`, in ascending id order.
    #[allow(clippy::missing_errors_doc)]
    fn list_secondaries_of(&self, primary_id: ContactId)
        -> Result<Vec<ContactRecord>, IdentityError>;
}

/// Parses an RFC 3339 timestamp that must carry offset `Z`.
///
/// # Errors
/// Returns [`IdentityError::Validation`] for malformed or non-UTC input.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, IdentityError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| IdentityError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(IdentityError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// # Errors
/// Returns [`IdentityError::Validation`] if the value cannot be formatted.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, IdentityError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            IdentityError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
