use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use super::clock::Clock;
use super::domain::{
    normalize_registration_no, ApplicantFacts, ApplicationId, ApplicationState,
    CertificateFacts, CertificateRecord, VerificationAttempt, VerificationOutcome,
};
use super::repository::{ClearanceRepository, RepositoryError};

const VERIFICATION_HISTORY_LIMIT: usize = 50;

/// Presentation and verification dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSettings {
    /// Prefix of the `url` embedded in QR payloads.
    pub verify_base_url: String,
    /// How far in the future a payload's issue time may be before it is rejected.
    pub clock_skew: Duration,
    pub short_hash_len: usize,
    pub transaction_prefix: String,
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self {
            verify_base_url: "http://localhost:3000".to_string(),
            clock_skew: Duration::from_secs(300),
            short_hash_len: 16,
            transaction_prefix: "NODUES".to_string(),
        }
    }
}

/// Compact structure encoded into the certificate's QR code.
/// The JSON shape is a stable wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QrPayload {
    pub url: String,
    pub id: String,
    pub registration_no: String,
    pub name: String,
    pub transaction_id: String,
    pub short_hash: String,
    pub issued_at_millis: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationFailure {
    Malformed,
    NotFound,
    NotBlockchainSecured,
    TransactionMismatch,
    Tampered,
}

impl VerificationFailure {
    pub const fn label(self) -> &'static str {
        match self {
            VerificationFailure::Malformed => "malformed",
            VerificationFailure::NotFound => "not_found",
            VerificationFailure::NotBlockchainSecured => "not_blockchain_secured",
            VerificationFailure::TransactionMismatch => "transaction_mismatch",
            VerificationFailure::Tampered => "tampered",
        }
    }
}

/// Facts echoed back to the verifier after a successful check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedCertificate {
    pub application_id: ApplicationId,
    pub registration_no: String,
    pub full_name: String,
    pub course: String,
    pub branch: String,
    pub transaction_id: String,
    pub block_number: u64,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<VerificationFailure>,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tampered_fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<VerifiedCertificate>,
}

impl VerificationResult {
    fn invalid(reason: VerificationFailure, message: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            message: message.into(),
            tampered_fields: Vec::new(),
            verification_count: None,
            certificate: None,
        }
    }

    fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.tampered_fields = fields;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("application {0} not found")]
    NotFound(ApplicationId),
    #[error("application is {state}, certificates are only issued for completed applications")]
    NotCompleted { state: ApplicationState },
    #[error("certificate has not been issued for application {0}")]
    NotIssued(ApplicationId),
    #[error("unable to encode certificate facts: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Binds a completed application's identity to a tamper-evident hash and re-verifies it later.
pub struct CertificateIntegrityService<R> {
    repository: Arc<R>,
    clock: Arc<dyn Clock>,
    settings: CertificateSettings,
    last_block: AtomicU64,
}

impl<R> CertificateIntegrityService<R>
where
    R: ClearanceRepository + 'static,
{
    pub fn new(repository: Arc<R>, clock: Arc<dyn Clock>, settings: CertificateSettings) -> Self {
        Self {
            repository,
            clock,
            settings,
            last_block: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &CertificateSettings {
        &self.settings
    }

    /// SHA-256 over the canonical JSON of the hashed facts. Timestamps never take part.
    pub fn compute_hash(facts: &CertificateFacts) -> Result<String, CertificateError> {
        let canonical = serde_json::to_vec(facts)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    /// Issue the certificate for a completed application, or return the one already issued.
    pub fn issue(
        &self,
        application_id: &ApplicationId,
    ) -> Result<CertificateRecord, CertificateError> {
        if let Some(existing) = self.repository.certificate(application_id)? {
            return Ok(existing);
        }

        let application = self
            .repository
            .fetch(application_id)?
            .ok_or_else(|| CertificateError::NotFound(application_id.clone()))?;
        if application.state != ApplicationState::Completed {
            return Err(CertificateError::NotCompleted {
                state: application.state,
            });
        }

        let hashed_facts = CertificateFacts::from_application(&application);
        let hash = Self::compute_hash(&hashed_facts)?;
        let issued_at = self.clock.now();
        let record = CertificateRecord {
            application_id: application_id.clone(),
            transaction_id: self.transaction_id(&hash, issued_at),
            block_number: self.next_block_number(issued_at),
            hash,
            issued_at,
            hashed_facts,
        };

        match self.repository.insert_certificate(record) {
            Ok(stored) => {
                info!(
                    application_id = %application_id,
                    transaction_id = %stored.transaction_id,
                    block_number = stored.block_number,
                    "certificate issued"
                );
                Ok(stored)
            }
            Err(RepositoryError::Conflict) => self
                .repository
                .certificate(application_id)?
                .ok_or_else(|| CertificateError::NotIssued(application_id.clone())),
            Err(err) => Err(err.into()),
        }
    }

    pub fn certificate(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Option<CertificateRecord>, CertificateError> {
        Ok(self.repository.certificate(application_id)?)
    }

    pub fn build_presentation_payload(
        &self,
        record: &CertificateRecord,
        facts: &ApplicantFacts,
    ) -> QrPayload {
        let short_len = self.settings.short_hash_len.min(record.hash.len());
        QrPayload {
            url: format!(
                "{}/verify/{}",
                self.settings.verify_base_url.trim_end_matches('/'),
                record.transaction_id
            ),
            id: record.application_id.0.clone(),
            registration_no: facts.registration_no.clone(),
            name: facts.full_name.clone(),
            transaction_id: record.transaction_id.clone(),
            short_hash: record.hash[..short_len].to_string(),
            issued_at_millis: record.issued_at.timestamp_millis(),
        }
    }

    /// Payload for an already issued certificate.
    pub fn presentation_payload(
        &self,
        application_id: &ApplicationId,
    ) -> Result<QrPayload, CertificateError> {
        let record = self
            .repository
            .certificate(application_id)?
            .ok_or_else(|| CertificateError::NotIssued(application_id.clone()))?;
        let application = self
            .repository
            .fetch(application_id)?
            .ok_or_else(|| CertificateError::NotFound(application_id.clone()))?;
        Ok(self.build_presentation_payload(&record, &application.facts))
    }

    pub fn parse_payload(raw: &str) -> Result<QrPayload, serde_json::Error> {
        serde_json::from_str(raw.trim())
    }

    /// Verify a QR string as scanned. Undecodable input is an invalid result, not an error.
    pub fn verify_encoded(&self, raw: &str) -> Result<VerificationResult, CertificateError> {
        match Self::parse_payload(raw) {
            Ok(payload) => self.verify(&payload),
            Err(err) => Ok(VerificationResult::invalid(
                VerificationFailure::Malformed,
                format!("payload is not a certificate QR code: {err}"),
            )),
        }
    }

    /// Re-verify a presented payload against the live record.
    ///
    /// Only repository failures are returned as errors; callers must treat those as invalid.
    pub fn verify(&self, payload: &QrPayload) -> Result<VerificationResult, CertificateError> {
        let now = self.clock.now();
        if let Some(problem) = self.structural_problem(payload, now) {
            return Ok(VerificationResult::invalid(VerificationFailure::Malformed, problem));
        }

        let application_id = ApplicationId(payload.id.trim().to_string());
        let Some(application) = self.repository.fetch(&application_id)? else {
            return Ok(VerificationResult::invalid(
                VerificationFailure::NotFound,
                "no certificate found with this id",
            ));
        };

        let Some(record) = self.repository.certificate(&application_id)? else {
            self.log_attempt(
                payload,
                &application_id,
                VerificationOutcome::NotBlockchainSecured,
                &[],
                now,
            );
            return Ok(VerificationResult::invalid(
                VerificationFailure::NotBlockchainSecured,
                "application has no issued certificate",
            ));
        };

        if payload.transaction_id.trim() != record.transaction_id {
            let fields = vec!["transactionId".to_string()];
            self.log_attempt(
                payload,
                &application_id,
                VerificationOutcome::TransactionMismatch,
                &fields,
                now,
            );
            return Ok(VerificationResult::invalid(
                VerificationFailure::TransactionMismatch,
                "transaction id does not match our records",
            )
            .with_fields(fields));
        }

        let current = CertificateFacts::from_application(&application);
        let recomputed = Self::compute_hash(&current)?;
        let mut tampered = Vec::new();
        if recomputed != record.hash {
            tampered = record.hashed_facts.diff(&current);
            if tampered.is_empty() {
                tampered.push("hash".to_string());
            }
        }
        if normalize_registration_no(&payload.registration_no) != application.facts.registration_no
            && !tampered.iter().any(|field| field == "registrationNo")
        {
            tampered.push("registrationNo".to_string());
        }
        let short_hash = payload.short_hash.trim().to_ascii_lowercase();
        if short_hash.is_empty() || !record.hash.starts_with(&short_hash) {
            tampered.push("shortHash".to_string());
        }

        if !tampered.is_empty() {
            warn!(
                application_id = %application_id,
                fields = ?tampered,
                "certificate verification detected tampering"
            );
            self.log_attempt(
                payload,
                &application_id,
                VerificationOutcome::Tampered,
                &tampered,
                now,
            );
            return Ok(VerificationResult::invalid(
                VerificationFailure::Tampered,
                "certificate data does not match the issued hash",
            )
            .with_fields(tampered));
        }

        let verification_count =
            self.log_attempt(payload, &application_id, VerificationOutcome::Valid, &[], now);
        info!(application_id = %application_id, "certificate verified");

        Ok(VerificationResult {
            valid: true,
            reason: None,
            message: "certificate is authentic and unmodified".to_string(),
            tampered_fields: Vec::new(),
            verification_count,
            certificate: Some(VerifiedCertificate {
                application_id,
                registration_no: application.facts.registration_no,
                full_name: application.facts.full_name,
                course: application.facts.course,
                branch: application.facts.branch,
                transaction_id: record.transaction_id,
                block_number: record.block_number,
                issued_at: record.issued_at,
            }),
        })
    }

    pub fn verification_history(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Vec<VerificationAttempt>, CertificateError> {
        Ok(self
            .repository
            .verifications(application_id, VERIFICATION_HISTORY_LIMIT)?)
    }

    fn structural_problem(&self, payload: &QrPayload, now: DateTime<Utc>) -> Option<String> {
        let missing: Vec<&str> = [
            ("id", payload.id.as_str()),
            ("registrationNo", payload.registration_no.as_str()),
            ("transactionId", payload.transaction_id.as_str()),
            ("shortHash", payload.short_hash.as_str()),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();
        if !missing.is_empty() {
            return Some(format!("missing required fields: {}", missing.join(", ")));
        }

        if payload.issued_at_millis <= 0 {
            return Some("issuedAtMillis must be a positive timestamp".to_string());
        }
        let skew = i64::try_from(self.settings.clock_skew.as_millis()).unwrap_or(i64::MAX);
        if payload.issued_at_millis > now.timestamp_millis().saturating_add(skew) {
            return Some("issuedAtMillis is in the future".to_string());
        }
        None
    }

    /// Audit only: a failed write never changes the verification outcome.
    fn log_attempt(
        &self,
        payload: &QrPayload,
        application_id: &ApplicationId,
        outcome: VerificationOutcome,
        tampered_fields: &[String],
        now: DateTime<Utc>,
    ) -> Option<u64> {
        let attempt = VerificationAttempt {
            application_id: application_id.clone(),
            transaction_id: payload.transaction_id.clone(),
            outcome,
            tampered_fields: tampered_fields.to_vec(),
            verified_at: now,
        };
        match self.repository.record_verification(attempt) {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(
                    application_id = %application_id,
                    error = %err,
                    "failed to record verification attempt"
                );
                None
            }
        }
    }

    fn transaction_id(&self, hash: &str, issued_at: DateTime<Utc>) -> String {
        let random = Uuid::new_v4().simple().to_string();
        format!(
            "{}-{}-{}-{}",
            self.settings.transaction_prefix,
            issued_at.year(),
            random[..10].to_ascii_uppercase(),
            hash[..8.min(hash.len())].to_ascii_uppercase()
        )
    }

    /// Millisecond-based and strictly increasing within the process.
    fn next_block_number(&self, issued_at: DateTime<Utc>) -> u64 {
        let candidate = u64::try_from(issued_at.timestamp_millis()).unwrap_or(0);
        let previous = self
            .last_block
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(candidate.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        candidate.max(previous + 1)
    }
}
