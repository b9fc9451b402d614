// In-memory portals for exercising the orchestrator without a browser

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;

use crate::errors::{PortalError, PortalKind};
use crate::intake::{IntakePortal, IntakeSession, PendingQueue};
use crate::registry::{PendingSecondFactor, RegistryPortal, RegistrySession, SecondFactorToken};
use crate::types::{
    ConfirmationOutcome, Credentials, NormalizedRecord, PendingRequest, RegistrationRecord,
    SubmissionResult,
};

/// Fails every call to an operation for a given key
pub const ALWAYS: u32 = u32::MAX;

#[derive(Debug, Default)]
pub struct FakeIntake {
    password: String,
    order: Vec<String>,
    requests: HashMap<String, PendingRequest>,
    confirmed: HashSet<String>,
    extract_failures: HashMap<String, u32>,
    confirm_failures: HashMap<String, u32>,
    queue_unavailable: bool,
    pub logins: u32,
    pub extract_calls: Vec<String>,
    pub confirm_calls: Vec<String>,
}

impl FakeIntake {
    pub fn new(password: &str) -> Self {
        Self {
            password: password.to_string(),
            ..Self::default()
        }
    }

    pub fn with_request(mut self, request: PendingRequest) -> Self {
        self.order.push(request.request_id.clone());
        self.requests.insert(request.request_id.clone(), request);
        self
    }

    pub fn fail_extract(&mut self, request_id: &str, times: u32) {
        self.extract_failures.insert(request_id.to_string(), times);
    }

    pub fn fail_confirm(&mut self, request_id: &str, times: u32) {
        self.confirm_failures.insert(request_id.to_string(), times);
    }

    pub fn make_queue_unavailable(&mut self) {
        self.queue_unavailable = true;
    }

    pub fn is_confirmed(&self, request_id: &str) -> bool {
        self.confirmed.contains(request_id)
    }

    pub fn confirmed_count(&self) -> usize {
        self.confirmed.len()
    }
}

fn take_failure(failures: &mut HashMap<String, u32>, key: &str) -> bool {
    match failures.get_mut(key) {
        Some(left) if *left == ALWAYS => true,
        Some(left) if *left > 0 => {
            *left -= 1;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl IntakePortal for FakeIntake {
    async fn login(&mut self, credentials: &Credentials) -> Result<IntakeSession, PortalError> {
        self.logins += 1;
        if credentials.password != self.password {
            return Err(PortalError::auth(PortalKind::Intake, "Usuario o clave incorrectos"));
        }
        Ok(IntakeSession {
            username: credentials.username.clone(),
            established_at: Utc::now(),
        })
    }

    async fn list_pending_requests(
        &mut self,
        _session: &IntakeSession,
    ) -> Result<PendingQueue, PortalError> {
        if self.queue_unavailable {
            return Err(PortalError::transient("list_pending_requests", "queue table never rendered"));
        }
        Ok(PendingQueue::new(
            self.order
                .iter()
                .filter(|id| !self.confirmed.contains(*id))
                .cloned(),
        ))
    }

    async fn extract_request(
        &mut self,
        _session: &IntakeSession,
        request_id: &str,
    ) -> Result<PendingRequest, PortalError> {
        self.extract_calls.push(request_id.to_string());
        if take_failure(&mut self.extract_failures, request_id) {
            return Err(PortalError::transient("extract_request", "detail form did not load"));
        }
        self.requests
            .get(request_id)
            .cloned()
            .ok_or_else(|| PortalError::transient("extract_request", "no such request"))
    }

    async fn confirm_request(
        &mut self,
        _session: &IntakeSession,
        request_id: &str,
    ) -> Result<ConfirmationOutcome, PortalError> {
        self.confirm_calls.push(request_id.to_string());
        if take_failure(&mut self.confirm_failures, request_id) {
            return Err(PortalError::transient("confirm_request", "row still pending"));
        }
        if self.confirmed.insert(request_id.to_string()) {
            Ok(ConfirmationOutcome::Confirmed)
        } else {
            Ok(ConfirmationOutcome::AlreadyConfirmed)
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeRegistry {
    password: String,
    valid_token: String,
    expired_tokens: HashSet<String>,
    registered: BTreeMap<String, String>,
    submit_failures: HashMap<String, u32>,
    lookup_lag: HashMap<String, u32>,
    next_reference: u32,
    pub logins: u32,
    pub tokens_seen: Vec<String>,
    pub submissions: Vec<NormalizedRecord>,
    pub submit_calls: u32,
}

impl FakeRegistry {
    pub fn new(password: &str, valid_token: &str) -> Self {
        Self {
            password: password.to_string(),
            valid_token: valid_token.to_string(),
            next_reference: 100,
            ..Self::default()
        }
    }

    pub fn expire_token(&mut self, token: &str) {
        self.expired_tokens.insert(token.to_string());
    }

    /// A registration that already exists before the run
    pub fn preregister(&mut self, imei: &str, reference: &str) {
        self.registered.insert(imei.to_string(), reference.to_string());
    }

    pub fn fail_submit(&mut self, request_id: &str, times: u32) {
        self.submit_failures.insert(request_id.to_string(), times);
    }

    /// The next `times` reads of a registered IMEI miss it, the way the
    /// registry's listing trails a fresh registration
    pub fn lag_lookups(&mut self, imei: &str, times: u32) {
        self.lookup_lag.insert(imei.to_string(), times);
    }

    pub fn clear_failures(&mut self) {
        self.submit_failures.clear();
        self.lookup_lag.clear();
    }

    fn listed(&mut self, imei: &str) -> Option<String> {
        let reference = self.registered.get(imei)?.clone();
        if take_failure(&mut self.lookup_lag, imei) {
            return None;
        }
        Some(reference)
    }

    pub fn reference_for(&self, imei: &str) -> Option<&str> {
        self.registered.get(imei).map(String::as_str)
    }
}

#[async_trait]
impl RegistryPortal for FakeRegistry {
    async fn login(&mut self, credentials: &Credentials) -> Result<PendingSecondFactor, PortalError> {
        self.logins += 1;
        if credentials.password != self.password {
            return Err(PortalError::auth(PortalKind::Registry, "Credenciales inválidas"));
        }
        Ok(PendingSecondFactor {
            username: credentials.username.clone(),
            issued_at: Utc::now(),
        })
    }

    async fn complete_second_factor(
        &mut self,
        pending: &PendingSecondFactor,
        token: &SecondFactorToken,
    ) -> Result<RegistrySession, PortalError> {
        self.tokens_seen.push(token.expose().to_string());
        if self.expired_tokens.contains(token.expose()) {
            return Err(PortalError::TokenExpired);
        }
        if token.expose() != self.valid_token {
            return Err(PortalError::InvalidToken);
        }
        Ok(RegistrySession {
            username: pending.username.clone(),
            authenticated_at: Utc::now(),
        })
    }

    async fn submit(
        &mut self,
        _session: &RegistrySession,
        record: &NormalizedRecord,
    ) -> Result<SubmissionResult, PortalError> {
        self.submit_calls += 1;
        let imeis: Vec<String> = record.imeis().map(str::to_string).collect();
        for imei in &imeis {
            if let Some(reference) = self.listed(imei) {
                return Err(PortalError::DuplicateSubmission {
                    imei: imei.clone(),
                    existing_reference: Some(reference),
                });
            }
        }
        if take_failure(&mut self.submit_failures, &record.request_id) {
            return Err(PortalError::transient("submit", "no response banner"));
        }

        self.next_reference += 1;
        let reference = format!("OABI-{}", self.next_reference);
        for imei in record.imeis() {
            self.registered.insert(imei.to_string(), reference.clone());
        }
        self.submissions.push(record.clone());
        Ok(SubmissionResult::accepted(
            &record.request_id,
            &record.device_imei,
            reference,
        ))
    }

    async fn lookup_registration(
        &mut self,
        _session: &RegistrySession,
        imei: &str,
    ) -> Result<Option<RegistrationRecord>, PortalError> {
        Ok(self.listed(imei).map(|reference| RegistrationRecord {
            imei: imei.to_string(),
            reference,
        }))
    }
}
