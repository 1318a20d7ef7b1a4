use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ContactId, ContactRecord, LinkPrecedence};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityIssue {
    pub code: String,
    pub severity: IssueSeverity,
    pub contact_id: ContactId,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub contract_version: String,
    pub healthy: bool,
    pub total_records: usize,
    pub primary_records: usize,
    pub secondary_records: usize,
    pub issues: Vec<IntegrityIssue>,
}

/// Checks the linking invariants over a full snapshot of stored records.
#[must_use]
pub fn check_integrity(records: &[ContactRecord]) -> IntegrityReport {
    let by_id: BTreeMap<ContactId, &ContactRecord> =
        records.iter().map(|record| (record.id, record)).collect();
    let mut issues = Vec::new();

    for record in records {
        if record.deleted_at.is_some() {
            issues.push(issue(
                "soft_deleted_record",
                IssueSeverity::Warning,
                record.id,
                format!("contact {} carries deleted_at, which is never written", record.id),
            ));
        }

        match (record.link_precedence, record.linked_id) {
            (LinkPrecedence::Primary, None) => {}
            (LinkPrecedence::Primary, Some(linked)) => issues.push(issue(
                "primary_with_link",
                IssueSeverity::Error,
                record.id,
                format!("primary contact {} links to {linked}", record.id),
            )),
            (LinkPrecedence::Secondary, None) => issues.push(issue(
                "secondary_without_link",
                IssueSeverity::Error,
                record.id,
                format!("secondary contact {} has no linked_id", record.id),
            )),
            (LinkPrecedence::Secondary, Some(linked)) if linked == record.id => {
                issues.push(issue(
                    "self_link",
                    IssueSeverity::Error,
                    record.id,
                    format!("contact {} links to itself", record.id),
                ));
            }
            (LinkPrecedence::Secondary, Some(linked)) => match by_id.get(&linked) {
                None => issues.push(issue(
                    "dangling_link",
                    IssueSeverity::Error,
                    record.id,
                    format!("contact {} links to missing contact {linked}", record.id),
                )),
                Some(target) if !target.is_primary() => issues.push(issue(
                    "link_to_secondary",
                    IssueSeverity::Error,
                    record.id,
                    format!(
                        "contact {} links to {linked}, which is itself a secondary",
                        record.id
                    ),
                )),
                Some(_) => {}
            },
        }
    }

    let primary_records = records.iter().filter(|record| record.is_primary()).count();
    let healthy = !issues
        .iter()
        .any(|item| item.severity == IssueSeverity::Error);

    IntegrityReport {
        contract_version: "integrity_check.v1".to_string(),
        healthy,
        total_records: records.len(),
        primary_records,
        secondary_records: records.len() - primary_records,
        issues,
    }
}

fn issue(
    code: &str,
    severity: IssueSeverity,
    contact_id: ContactId,
    message: String,
) -> IntegrityIssue {
    IntegrityIssue {
        code: code.to_string(),
        severity,
        contact_id,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_rfc3339_utc;

    fn fixture(id: i64, precedence: LinkPrecedence, linked_id: Option<i64>) -> ContactRecord {
        let at = match parse_rfc3339_utc("2026-02-07T12:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        };
        ContactRecord {
            id: ContactId(id),
            email: Some(format!("user{id}@x.com")),
            phone_number: None,
            linked_id: linked_id.map(ContactId),
            link_precedence: precedence,
            created_at: at,
            updated_at: at,
            deleted_at: None,
        }
    }

    fn codes(report: &IntegrityReport) -> Vec<&str> {
        report.issues.iter().map(|item| item.code.as_str()).collect()
    }

    #[test]
    fn well_formed_group_is_healthy() {
        let records = vec![
            fixture(1, LinkPrecedence::Primary, None),
            fixture(2, LinkPrecedence::Secondary, Some(1)),
            fixture(3, LinkPrecedence::Secondary, Some(1)),
        ];
        let report = check_integrity(&records);
        assert!(report.healthy);
        assert!(report.issues.is_empty());
        assert_eq!(report.primary_records, 1);
        assert_eq!(report.secondary_records, 2);
    }

    #[test]
    fn every_broken_link_shape_is_reported() {
        let records = vec![
            fixture(1, LinkPrecedence::Primary, Some(2)),
            fixture(2, LinkPrecedence::Secondary, None),
            fixture(3, LinkPrecedence::Secondary, Some(3)),
            fixture(4, LinkPrecedence::Secondary, Some(40)),
            fixture(5, LinkPrecedence::Secondary, Some(4)),
        ];
        let report = check_integrity(&records);
        assert!(!report.healthy);
        assert_eq!(
            codes(&report),
            vec![
                "primary_with_link",
                "secondary_without_link",
                "self_link",
                "dangling_link",
                "link_to_secondary",
            ]
        );
    }

    #[test]
    fn soft_deleted_record_is_only_a_warning() {
        let mut record = fixture(1, LinkPrecedence::Primary, None);
        record.deleted_at = Some(record.created_at);
        let report = check_integrity(&[record]);
        assert!(report.healthy);
        assert_eq!(codes(&report), vec!["soft_deleted_record"]);
    }
}
