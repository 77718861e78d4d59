use std::sync::Arc;
use std::time::Duration;

use super::common::*;
use crate::workflows::clearance::{
    ApplicationId, CertificateError, CertificateFacts, CertificateIntegrityService,
    CertificateSettings, ClearanceApplication, ClearanceRepository, ClearanceServiceError,
    InMemoryClearanceRepository, QrPayload, VerificationFailure, VerificationOutcome,
};

fn completed(harness: &Harness, registration_no: &str) -> ApplicationId {
    let id = harness.open(registration_no);
    harness.complete(&id);
    id
}

fn payload_for(harness: &Harness, id: &ApplicationId) -> QrPayload {
    harness
        .service
        .presentation_payload(id)
        .expect("payload for issued certificate")
}

/// Simulate a post-issuance edit made directly in storage.
fn mutate(harness: &Harness, id: &ApplicationId, edit: impl FnOnce(&mut ClearanceApplication)) {
    let mut application = harness.fetch(id);
    edit(&mut application);
    harness.repository.update(application).expect("direct write");
}

#[test]
fn hash_ignores_issue_time() {
    let first = build_harness();
    let second = build_harness();
    second.clock.advance(Duration::from_secs(90 * 24 * 60 * 60));

    let first_id = completed(&first, "ME23-100");
    let second_id = completed(&second, "ME23-100");

    let left = first
        .service
        .certificate(&first_id)
        .expect("lookup")
        .expect("issued");
    let right = second
        .service
        .certificate(&second_id)
        .expect("lookup")
        .expect("issued");

    assert_ne!(left.issued_at, right.issued_at);
    assert_eq!(left.hash, right.hash);
    assert_eq!(left.hash.len(), 64);
    assert!(left.hash.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn hash_changes_with_any_hashed_field() {
    let base = CertificateFacts {
        identity_id: "stu-1".to_string(),
        registration_no: "ME23-101".to_string(),
        full_name: "Kiran Rao".to_string(),
        course: "B.Tech".to_string(),
        branch: "Mechanical".to_string(),
        status: "completed".to_string(),
    };
    let reference = CertificateIntegrityService::<InMemoryClearanceRepository>::compute_hash(&base)
        .expect("hash");

    let mut renamed = base.clone();
    renamed.full_name = "Kiran  Rao".to_string();
    let changed = CertificateIntegrityService::<InMemoryClearanceRepository>::compute_hash(&renamed)
        .expect("hash");
    assert_ne!(reference, changed);
    assert_eq!(base.diff(&renamed), vec!["fullName".to_string()]);
}

#[test]
fn issue_is_idempotent() {
    let harness = build_harness();
    let id = completed(&harness, "ME23-102");

    let first = harness.service.issue_certificate(&id).expect("issue");
    let second = harness.service.issue_certificate(&id).expect("issue again");
    assert_eq!(first, second);
}

#[test]
fn issue_refuses_incomplete_applications() {
    let harness = build_harness();
    let id = harness.open("ME23-103");

    let err = harness
        .service
        .issue_certificate(&id)
        .expect_err("pending application has no certificate");
    assert!(matches!(
        err,
        ClearanceServiceError::Certificate(CertificateError::NotCompleted { .. })
    ));
    assert_eq!(err.status_code(), axum::http::StatusCode::CONFLICT);
}

#[test]
fn transaction_ids_and_block_numbers_follow_the_ledger_format() {
    let harness = build_harness();
    let first_id = completed(&harness, "ME23-104");
    let second_id = completed(&harness, "ME23-105");

    let first = harness
        .service
        .certificate(&first_id)
        .expect("lookup")
        .expect("issued");
    let second = harness
        .service
        .certificate(&second_id)
        .expect("lookup")
        .expect("issued");

    let parts: Vec<&str> = first.transaction_id.split('-').collect();
    assert_eq!(parts.len(), 4);
    assert_eq!(parts[0], "NODUES");
    assert_eq!(parts[1], "2025");
    assert_eq!(parts[2].len(), 10);
    assert_eq!(parts[3], first.hash[..8].to_ascii_uppercase());
    assert_eq!(first.transaction_id, first.transaction_id.to_ascii_uppercase());
    assert_ne!(first.transaction_id, second.transaction_id);

    assert_eq!(first.block_number, start_time().timestamp_millis() as u64);
    assert!(second.block_number > first.block_number);
}

#[test]
fn presentation_payload_has_the_stable_wire_shape() {
    let harness = build_harness();
    let id = completed(&harness, "me23-106");
    let record = harness
        .service
        .certificate(&id)
        .expect("lookup")
        .expect("issued");

    let payload = payload_for(&harness, &id);
    assert_eq!(
        payload.url,
        format!("http://localhost:3000/verify/{}", record.transaction_id)
    );
    assert_eq!(payload.registration_no, "ME23-106");
    assert_eq!(payload.short_hash, record.hash[..16]);
    assert_eq!(payload.issued_at_millis, record.issued_at.timestamp_millis());

    let json = serde_json::to_value(&payload).expect("serializes");
    let mut keys: Vec<&str> = json
        .as_object()
        .expect("object")
        .keys()
        .map(String::as_str)
        .collect();
    keys.sort_unstable();
    assert_eq!(
        keys,
        vec![
            "id",
            "issuedAtMillis",
            "name",
            "registrationNo",
            "shortHash",
            "transactionId",
            "url"
        ]
    );
}

#[test]
fn valid_payload_verifies_and_counts_successes() {
    let harness = build_harness();
    let id = completed(&harness, "ME23-107");
    let payload = payload_for(&harness, &id);

    let first = harness.service.verify(&payload).expect("verify");
    assert!(first.valid, "{first:?}");
    assert_eq!(first.reason, None);
    assert_eq!(first.verification_count, Some(1));
    let certificate = first.certificate.expect("certificate details");
    assert_eq!(certificate.full_name, "Asha Verma");

    let encoded = serde_json::to_string(&payload).expect("encode");
    let second = harness.service.verify_encoded(&encoded).expect("verify");
    assert!(second.valid);
    assert_eq!(second.verification_count, Some(2));

    let history = harness.service.verification_history(&id).expect("history");
    assert_eq!(history.len(), 2);
    assert!(history
        .iter()
        .all(|attempt| attempt.outcome == VerificationOutcome::Valid));
}

#[test]
fn mutating_a_hashed_field_is_reported_as_tampering() {
    let harness = build_harness();
    let id = completed(&harness, "ME23-108");
    let payload = payload_for(&harness, &id);

    mutate(&harness, &id, |application| {
        application.facts.full_name = "Someone Else".to_string();
    });

    let result = harness.service.verify(&payload).expect("verify");
    assert!(!result.valid);
    assert_eq!(result.reason, Some(VerificationFailure::Tampered));
    assert_eq!(result.tampered_fields, vec!["fullName".to_string()]);
    assert_eq!(result.verification_count, None);

    let history = harness.service.verification_history(&id).expect("history");
    assert_eq!(history[0].outcome, VerificationOutcome::Tampered);
}

#[test]
fn mutating_unhashed_fields_keeps_the_certificate_valid() {
    let harness = build_harness();
    let id = completed(&harness, "ME23-109");
    let payload = payload_for(&harness, &id);

    mutate(&harness, &id, |application| {
        application.updated_at += chrono::Duration::days(3);
        application.facts.contact_no = Some("9000000000".to_string());
        application.facts.personal_email = Some("new@example.com".to_string());
    });

    let result = harness.service.verify(&payload).expect("verify");
    assert!(result.valid, "{result:?}");
}

#[test]
fn reopening_a_completed_application_invalidates_its_certificate() {
    let harness = build_harness();
    let id = completed(&harness, "ME23-110");
    let payload = payload_for(&harness, &id);

    harness
        .service
        .reapply(&id, &reapply_to("library", "library record was wrong"))
        .expect("completed reapply allowed");

    let result = harness.service.verify(&payload).expect("verify");
    assert_eq!(result.reason, Some(VerificationFailure::Tampered));
    assert_eq!(result.tampered_fields, vec!["status".to_string()]);
}

#[test]
fn unknown_and_unsecured_applications_are_distinguished() {
    let harness = build_harness();
    let id = completed(&harness, "ME23-111");
    let mut payload = payload_for(&harness, &id);

    payload.id = "does-not-exist".to_string();
    let missing = harness.service.verify(&payload).expect("verify");
    assert_eq!(missing.reason, Some(VerificationFailure::NotFound));

    let pending = harness.open("ME23-112");
    payload.id = pending.0.clone();
    let unsecured = harness.service.verify(&payload).expect("verify");
    assert_eq!(
        unsecured.reason,
        Some(VerificationFailure::NotBlockchainSecured)
    );
    let history = harness
        .service
        .verification_history(&pending)
        .expect("history");
    assert_eq!(history[0].outcome, VerificationOutcome::NotBlockchainSecured);
}

#[test]
fn mismatched_transaction_is_rejected() {
    let harness = build_harness();
    let id = completed(&harness, "ME23-113");
    let mut payload = payload_for(&harness, &id);
    payload.transaction_id = "NODUES-2025-0000000000-DEADBEEF".to_string();

    let result = harness.service.verify(&payload).expect("verify");
    assert_eq!(result.reason, Some(VerificationFailure::TransactionMismatch));
    assert!(!result.valid);
}

#[test]
fn forged_payload_fields_are_flagged() {
    let harness = build_harness();
    let id = completed(&harness, "ME23-114");
    let original = payload_for(&harness, &id);

    let mut forged = original.clone();
    forged.registration_no = "ME23-999".to_string();
    let result = harness.service.verify(&forged).expect("verify");
    assert_eq!(result.reason, Some(VerificationFailure::Tampered));
    assert_eq!(result.tampered_fields, vec!["registrationNo".to_string()]);

    let mut forged = original;
    forged.short_hash = "0123456789abcdef".to_string();
    let result = harness.service.verify(&forged).expect("verify");
    assert_eq!(result.tampered_fields, vec!["shortHash".to_string()]);
}

#[test]
fn structurally_invalid_payloads_are_malformed() {
    let harness = build_harness();
    let id = completed(&harness, "ME23-115");
    let payload = payload_for(&harness, &id);

    let garbage = harness
        .service
        .verify_encoded("definitely not json")
        .expect("verify");
    assert_eq!(garbage.reason, Some(VerificationFailure::Malformed));

    let mut missing = payload.clone();
    missing.transaction_id.clear();
    let result = harness.service.verify(&missing).expect("verify");
    assert_eq!(result.reason, Some(VerificationFailure::Malformed));
    assert!(result.message.contains("transactionId"));

    let mut future = payload.clone();
    future.issued_at_millis = harness.clock.now_millis() + 10 * 60 * 1000;
    let result = harness.service.verify(&future).expect("verify");
    assert_eq!(result.reason, Some(VerificationFailure::Malformed));

    let mut within_skew = payload;
    within_skew.issued_at_millis = harness.clock.now_millis() + 60 * 1000;
    let result = harness.service.verify(&within_skew).expect("verify");
    assert!(result.valid, "{result:?}");

    assert!(harness
        .service
        .verification_history(&id)
        .expect("history")
        .iter()
        .all(|attempt| attempt.outcome == VerificationOutcome::Valid));
}

#[test]
fn concurrent_issue_creates_a_single_record() {
    let harness = build_harness();
    let id = completed(&harness, "ME23-116");
    let repository = Arc::new(InMemoryClearanceRepository::default());
    let application = harness.fetch(&id);
    repository.insert(application).expect("copy application");

    let service = Arc::new(CertificateIntegrityService::new(
        repository.clone(),
        harness.clock.clone(),
        CertificateSettings::default(),
    ));
    let records: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                let id = id.clone();
                scope.spawn(move || service.issue(&id).expect("issue"))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("thread joins"))
            .collect()
    });

    let stored = repository
        .certificate(&id)
        .expect("lookup")
        .expect("issued");
    assert!(records.iter().all(|record| record == &stored));
}
