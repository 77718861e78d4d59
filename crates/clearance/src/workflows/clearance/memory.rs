use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::domain::{
    normalize_registration_no, ApplicationId, CertificateRecord, ClearanceApplication,
    ReapplicationHistoryEntry, VerificationAttempt, VerificationOutcome,
};
use super::repository::{
    ClearanceNotice, ClearanceRepository, NotificationPublisher, NotifyError, RepositoryError,
};

#[derive(Debug, Default)]
struct MemoryState {
    applications: HashMap<ApplicationId, ClearanceApplication>,
    registrations: HashMap<String, ApplicationId>,
    history: HashMap<ApplicationId, Vec<ReapplicationHistoryEntry>>,
    certificates: HashMap<ApplicationId, CertificateRecord>,
    verifications: HashMap<ApplicationId, Vec<VerificationAttempt>>,
}

impl MemoryState {
    fn swap(
        &mut self,
        mut application: ClearanceApplication,
    ) -> Result<ClearanceApplication, RepositoryError> {
        let stored = self
            .applications
            .get_mut(&application.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.version != application.version {
            return Err(RepositoryError::VersionConflict {
                expected: application.version,
                found: stored.version,
            });
        }
        application.version += 1;
        *stored = application.clone();
        Ok(application)
    }
}

/// Single-process store. One mutex covers every table, so each call is atomic.
#[derive(Debug, Default, Clone)]
pub struct InMemoryClearanceRepository {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryClearanceRepository {
    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Unavailable("store mutex poisoned".to_string()))
    }
}

impl ClearanceRepository for InMemoryClearanceRepository {
    fn insert(
        &self,
        application: ClearanceApplication,
    ) -> Result<ClearanceApplication, RepositoryError> {
        let mut state = self.lock()?;
        let registration = normalize_registration_no(&application.facts.registration_no);
        if state.applications.contains_key(&application.id)
            || state.registrations.contains_key(&registration)
        {
            return Err(RepositoryError::Conflict);
        }
        state
            .registrations
            .insert(registration, application.id.clone());
        state
            .applications
            .insert(application.id.clone(), application.clone());
        Ok(application)
    }

    fn fetch(&self, id: &ApplicationId) -> Result<Option<ClearanceApplication>, RepositoryError> {
        let state = self.lock()?;
        Ok(state.applications.get(id).cloned())
    }

    fn fetch_by_registration(
        &self,
        registration_no: &str,
    ) -> Result<Option<ClearanceApplication>, RepositoryError> {
        let state = self.lock()?;
        let key = normalize_registration_no(registration_no);
        Ok(state
            .registrations
            .get(&key)
            .and_then(|id| state.applications.get(id))
            .cloned())
    }

    fn update(
        &self,
        application: ClearanceApplication,
    ) -> Result<ClearanceApplication, RepositoryError> {
        let mut state = self.lock()?;
        state.swap(application)
    }

    fn update_with_history(
        &self,
        application: ClearanceApplication,
        entry: ReapplicationHistoryEntry,
    ) -> Result<ClearanceApplication, RepositoryError> {
        let mut state = self.lock()?;
        let stored = state.swap(application)?;
        state
            .history
            .entry(stored.id.clone())
            .or_default()
            .push(entry);
        Ok(stored)
    }

    fn history(
        &self,
        id: &ApplicationId,
    ) -> Result<Vec<ReapplicationHistoryEntry>, RepositoryError> {
        let state = self.lock()?;
        Ok(state.history.get(id).cloned().unwrap_or_default())
    }

    fn insert_certificate(
        &self,
        record: CertificateRecord,
    ) -> Result<CertificateRecord, RepositoryError> {
        let mut state = self.lock()?;
        if state.certificates.contains_key(&record.application_id) {
            return Err(RepositoryError::Conflict);
        }
        state
            .certificates
            .insert(record.application_id.clone(), record.clone());
        Ok(record)
    }

    fn certificate(
        &self,
        id: &ApplicationId,
    ) -> Result<Option<CertificateRecord>, RepositoryError> {
        let state = self.lock()?;
        Ok(state.certificates.get(id).cloned())
    }

    fn record_verification(&self, attempt: VerificationAttempt) -> Result<u64, RepositoryError> {
        let mut state = self.lock()?;
        let attempts = state
            .verifications
            .entry(attempt.application_id.clone())
            .or_default();
        attempts.push(attempt);
        Ok(attempts
            .iter()
            .filter(|attempt| attempt.outcome == VerificationOutcome::Valid)
            .count() as u64)
    }

    fn verifications(
        &self,
        id: &ApplicationId,
        limit: usize,
    ) -> Result<Vec<VerificationAttempt>, RepositoryError> {
        let state = self.lock()?;
        Ok(state
            .verifications
            .get(id)
            .map(|attempts| attempts.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

/// Publisher that keeps every notice, for demos and assertions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryNotificationPublisher {
    events: Arc<Mutex<Vec<ClearanceNotice>>>,
}

impl InMemoryNotificationPublisher {
    pub fn events(&self) -> Vec<ClearanceNotice> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl NotificationPublisher for InMemoryNotificationPublisher {
    fn publish(&self, notice: ClearanceNotice) -> Result<(), NotifyError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| NotifyError::Transport("publisher mutex poisoned".to_string()))?;
        events.push(notice);
        Ok(())
    }
}
