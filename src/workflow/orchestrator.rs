//! Drives each pending request from the intake queue through the registry
//! and back.
//!
//! A run takes one snapshot of the intake queue. Every request is first
//! extracted and normalized; only then is the registry logged in to, so a
//! run with nothing to register never asks for a second-factor token. The
//! intake portal is never confirmed unless the registry shows the device
//! registered, and that read is repeated before every confirmation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::errors::PortalError;
use crate::intake::{IntakePortal, IntakeSession};
use crate::normalize::Normalizer;
use crate::registry::{RegistryPortal, RegistrySession, TokenError, TokenProvider};
use crate::telemetry::generate_correlation_id;
use crate::types::{Credentials, NormalizedRecord, RegistrationRecord, SubmissionResult};

use super::journal::StateJournal;
use super::retry::{with_retry, RetryPolicy};
use super::state::{RequestState, Stage, Step, TransitionError, WorkflowState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Read and normalize only; the registry is never contacted
    ExtractOnly,
    #[default]
    Full,
}

/// Conditions that end a run early. Per-request failures never do.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("could not log in to the intake portal: {0}")]
    IntakeAuth(PortalError),

    #[error("could not log in to the registry portal: {0}")]
    RegistryAuth(PortalError),

    #[error("second factor not accepted after {attempts} token(s) over {logins} login(s)")]
    SecondFactorExhausted { attempts: u32, logins: u32 },

    #[error("no second-factor token available: {0}")]
    TokenUnavailable(TokenError),

    #[error("pending queue could not be read: {0}")]
    QueueUnavailable(PortalError),

    #[error("run cancelled")]
    Cancelled,
}

impl WorkflowError {
    pub fn exit_code(&self) -> u8 {
        match self {
            WorkflowError::Cancelled => 130,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub intake_credentials: Credentials,
    pub registry_credentials: Credentials,
    pub retry: RetryPolicy,
    pub mode: RunMode,
    /// Tokens requested per run, across all logins
    pub max_token_attempts: u32,
    pub max_logins: u32,
}

impl OrchestratorSettings {
    pub fn new(intake_credentials: Credentials, registry_credentials: Credentials) -> Self {
        Self {
            intake_credentials,
            registry_credentials,
            retry: RetryPolicy::default(),
            mode: RunMode::Full,
            max_token_attempts: 3,
            max_logins: 2,
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub mode: RunMode,
    pub state: WorkflowState,
    /// Request ids of this run's queue snapshot, in queue order
    pub processed: Vec<String>,
    pub aborted: Option<WorkflowError>,
}

impl RunReport {
    pub fn requests(&self) -> impl Iterator<Item = &RequestState> + '_ {
        self.processed.iter().filter_map(|id| self.state.get(id))
    }

    pub fn confirmed(&self) -> usize {
        self.requests().filter(|r| r.is_confirmed()).count()
    }

    pub fn rejected(&self) -> usize {
        self.requests().filter(|r| r.is_rejected()).count()
    }

    pub fn failed(&self) -> usize {
        self.requests().filter(|r| r.is_failed()).count()
    }

    pub fn normalized_records(&self) -> Vec<&NormalizedRecord> {
        self.requests().filter_map(|r| r.record.as_ref()).collect()
    }

    /// 0 all done or rejected, 1 some request failed, 2 aborted, 130 interrupted
    pub fn exit_code(&self) -> u8 {
        match &self.aborted {
            Some(err) => err.exit_code(),
            None if self.failed() > 0 => 1,
            None => 0,
        }
    }
}

pub struct WorkflowOrchestrator<A, B> {
    intake: A,
    registry: B,
    normalizer: Normalizer,
    tokens: Arc<dyn TokenProvider>,
    settings: OrchestratorSettings,
    journal: Option<StateJournal>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<A: IntakePortal, B: RegistryPortal> WorkflowOrchestrator<A, B> {
    pub fn new(
        intake: A,
        registry: B,
        normalizer: Normalizer,
        tokens: Arc<dyn TokenProvider>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            intake,
            registry,
            normalizer,
            tokens,
            settings,
            journal: None,
            shutdown: None,
        }
    }

    pub fn with_journal(mut self, journal: StateJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn intake(&self) -> &A {
        &self.intake
    }

    pub fn registry(&self) -> &B {
        &self.registry
    }

    pub fn into_parts(self) -> (A, B) {
        (self.intake, self.registry)
    }

    /// Processes one snapshot of the queue, starting from `state`
    pub async fn run(&mut self, state: WorkflowState) -> RunReport {
        let run_id = generate_correlation_id();
        let span = info_span!("relay_run", run_id = %run_id, mode = ?self.settings.mode);
        let mut report = RunReport {
            run_id,
            mode: self.settings.mode,
            state,
            processed: Vec::new(),
            aborted: None,
        };

        let outcome = self.drive(&mut report).instrument(span.clone()).await;
        self.checkpoint(&report.state).await;

        let _entered = span.enter();
        if let Err(err) = outcome {
            error!(error = %err, "Run aborted");
            report.aborted = Some(err);
        }
        info!(
            pending = report.processed.len(),
            confirmed = report.confirmed(),
            rejected = report.rejected(),
            failed = report.failed(),
            "Run finished"
        );
        report
    }

    async fn drive(&mut self, report: &mut RunReport) -> Result<(), WorkflowError> {
        self.ensure_running()?;
        let intake_session = self.login_intake().await?;

        let retry = self.settings.retry.clone();
        let queue = with_retry!(
            retry,
            "list_pending_requests",
            self.intake.list_pending_requests(&intake_session)
        )
        .result
        .map_err(WorkflowError::QueueUnavailable)?;

        if queue.is_empty() {
            info!("No pending requests");
            return Ok(());
        }
        info!(pending = queue.len(), "Read pending queue");
        report.processed = queue.collect();

        for id in report.processed.clone() {
            self.ensure_running()?;
            let span = info_span!("relay_request", request_id = %id);
            self.prepare(&intake_session, &mut report.state, &id)
                .instrument(span)
                .await?;
        }

        if self.settings.mode == RunMode::ExtractOnly {
            info!("Extract-only run, registry left untouched");
            return Ok(());
        }

        let ready: Vec<String> = report
            .processed
            .iter()
            .filter(|id| report.state.get(id).is_some_and(|r| r.needs_registry()))
            .cloned()
            .collect();
        if ready.is_empty() {
            info!("Nothing left to register");
            return Ok(());
        }

        self.ensure_running()?;
        let registry_session = self.login_registry().await?;

        for id in ready {
            self.ensure_running()?;
            let span = info_span!("relay_request", request_id = %id);
            self.register(&intake_session, &registry_session, &mut report.state, &id)
                .instrument(span)
                .await?;
        }
        Ok(())
    }

    /// Listed → Extracted → Normalized, or Rejected
    async fn prepare(
        &mut self,
        session: &IntakeSession,
        state: &mut WorkflowState,
        id: &str,
    ) -> Result<(), WorkflowError> {
        let mut current = state.current(id);
        current.clear_outcome();

        if current.stage == Stage::Listed {
            let retry = self.settings.retry.clone();
            let outcome = with_retry!(retry, "extract_request", self.intake.extract_request(session, id));
            match outcome.result {
                Ok(request) => {
                    let result = current.extracted(request);
                    guard(&mut current, Step::Extract, result, outcome.attempts);
                }
                Err(err) if err.is_auth() => {
                    self.record(state, current).await;
                    return Err(WorkflowError::IntakeAuth(err));
                }
                Err(err) => {
                    warn!(error = %err, attempts = outcome.attempts, "Extraction failed");
                    current.failed(Step::Extract, &err, outcome.attempts);
                }
            }
            let failed = current.is_failed();
            self.record(state, current.clone()).await;
            if failed {
                return Ok(());
            }
        }

        if current.stage == Stage::Extracted {
            let verdict = current.request.as_ref().map(|r| self.normalizer.normalize(r));
            match verdict {
                Some(Ok(record)) => {
                    info!(
                        brand = %record.canonical_brand,
                        model = %record.canonical_model,
                        country = %record.canonical_country,
                        "Request normalized"
                    );
                    let result = current.normalized(record);
                    guard(&mut current, Step::Normalize, result, 0);
                }
                Some(Err(rejection)) => {
                    warn!(code = rejection.code(), reason = %rejection, "Request rejected");
                    let result = current.rejected(rejection);
                    guard(&mut current, Step::Normalize, result, 0);
                }
                None => current.failed(Step::Normalize, "extracted request is missing from the state", 0),
            }
            self.record(state, current).await;
        } else {
            debug!(stage = %current.stage, "Resuming from earlier run");
            state.put(current);
        }
        Ok(())
    }

    /// Normalized → Submitted → Confirmed
    async fn register(
        &mut self,
        intake_session: &IntakeSession,
        registry_session: &RegistrySession,
        state: &mut WorkflowState,
        id: &str,
    ) -> Result<(), WorkflowError> {
        let retry = self.settings.retry.clone();
        let mut current = state.current(id);

        if current.stage == Stage::Normalized {
            let Some(record) = current.record.clone() else {
                current.failed(Step::Submit, "normalized record is missing from the state", 0);
                self.record(state, current).await;
                return Ok(());
            };

            // A form the registry acknowledged is never sent again
            let outcome = with_retry!(retry, "submit", self.registry.submit(registry_session, &record));
            let submitted = match outcome.result {
                Ok(submission) => Ok(submission),
                Err(PortalError::DuplicateSubmission { imei, existing_reference }) => {
                    info!(%imei, reference = ?existing_reference, "Device already registered");
                    Ok(match existing_reference {
                        Some(reference) => {
                            SubmissionResult::accepted(&record.request_id, &record.device_imei, reference)
                        }
                        None => SubmissionResult::unverified(&record.request_id, &record.device_imei),
                    })
                }
                Err(err) => Err(err),
            };
            match submitted {
                Ok(submission) => {
                    info!(reference = ?submission.portal_b_reference, "Registration submitted");
                    let result = current.submitted(submission);
                    guard(&mut current, Step::Submit, result, outcome.attempts);
                }
                Err(err) if err.is_auth() => {
                    self.record(state, current).await;
                    return Err(WorkflowError::RegistryAuth(err));
                }
                Err(err) => {
                    warn!(error = %err, attempts = outcome.attempts, "Submission failed");
                    current.failed(Step::Submit, &err, outcome.attempts);
                }
            }

            let failed = current.is_failed();
            self.record(state, current.clone()).await;
            if failed {
                return Ok(());
            }
            self.ensure_running()?;
        }

        if current.stage != Stage::Submitted {
            return Ok(());
        }

        let imeis = registered_imeis(&current);
        let outcome = with_retry!(retry, "verify_registration", self.find_registration(registry_session, &imeis));
        match outcome.result {
            Ok(found) => {
                debug!(reference = %found.reference, attempts = outcome.attempts, "Registration listed in registry");
                let result = current.verified(found.reference);
                guard(&mut current, Step::Verify, result, outcome.attempts);
                if current.is_failed() {
                    self.record(state, current).await;
                    return Ok(());
                }
            }
            Err(PortalError::NotListed { imei }) => {
                warn!(%imei, attempts = outcome.attempts, "Registration not found in registry, request will be submitted again");
                let result = current.unverified();
                guard(&mut current, Step::Verify, result, outcome.attempts);
                current.failed(Step::Verify, "registration not found in registry", outcome.attempts);
                self.record(state, current).await;
                return Ok(());
            }
            Err(err) if err.is_auth() => return Err(WorkflowError::RegistryAuth(err)),
            Err(err) => {
                warn!(error = %err, "Verification read failed");
                current.failed(Step::Verify, &err, outcome.attempts);
                self.record(state, current).await;
                return Ok(());
            }
        }

        self.ensure_running()?;
        let outcome = with_retry!(retry, "confirm_request", self.intake.confirm_request(intake_session, id));
        match outcome.result {
            Ok(confirmation) => {
                info!(?confirmation, "Request confirmed");
                let result = current.confirmed(confirmation);
                guard(&mut current, Step::Confirm, result, outcome.attempts);
            }
            Err(err) if err.is_auth() => {
                self.record(state, current).await;
                return Err(WorkflowError::IntakeAuth(err));
            }
            Err(err) => {
                warn!(error = %err, attempts = outcome.attempts, "Confirmation failed");
                current.failed(Step::Confirm, &err, outcome.attempts);
            }
        }
        self.record(state, current).await;
        Ok(())
    }

    /// First IMEI of the request the registry lists. `NotListed` when none is.
    async fn find_registration(
        &mut self,
        session: &RegistrySession,
        imeis: &[String],
    ) -> Result<RegistrationRecord, PortalError> {
        for imei in imeis {
            if let Some(found) = self.registry.lookup_registration(session, imei).await? {
                return Ok(found);
            }
        }
        Err(PortalError::NotListed {
            imei: imeis.first().cloned().unwrap_or_default(),
        })
    }

    async fn login_intake(&mut self) -> Result<IntakeSession, WorkflowError> {
        let retry = self.settings.retry.clone();
        let session = with_retry!(
            retry,
            "intake_login",
            self.intake.login(&self.settings.intake_credentials)
        )
        .result
        .map_err(WorkflowError::IntakeAuth)?;
        info!(user = %session.username, "Logged in to intake portal");
        Ok(session)
    }

    /// Password, then tokens until one is accepted. An expired challenge
    /// costs a fresh login.
    async fn login_registry(&mut self) -> Result<RegistrySession, WorkflowError> {
        let retry = self.settings.retry.clone();
        let max_logins = self.settings.max_logins.max(1);
        let max_tokens = self.settings.max_token_attempts.max(1);
        let mut tokens_used = 0;
        let mut logins = 0;

        while logins < max_logins && tokens_used < max_tokens {
            self.ensure_running()?;
            logins += 1;
            let pending = with_retry!(
                retry,
                "registry_login",
                self.registry.login(&self.settings.registry_credentials)
            )
            .result
            .map_err(WorkflowError::RegistryAuth)?;

            while tokens_used < max_tokens {
                tokens_used += 1;
                let token = self
                    .tokens
                    .token(tokens_used)
                    .await
                    .map_err(WorkflowError::TokenUnavailable)?;

                match self.registry.complete_second_factor(&pending, &token).await {
                    Ok(session) => {
                        info!(logins, tokens = tokens_used, "Registry session established");
                        return Ok(session);
                    }
                    Err(PortalError::InvalidToken) => {
                        warn!(attempt = tokens_used, "Second-factor token rejected");
                    }
                    Err(PortalError::TokenExpired) => {
                        warn!("Second-factor challenge expired, logging in again");
                        break;
                    }
                    Err(err) if err.is_retryable() => {
                        warn!(error = %err, "Second-factor step failed, logging in again");
                        break;
                    }
                    Err(err) => return Err(WorkflowError::RegistryAuth(err)),
                }
            }
        }

        Err(WorkflowError::SecondFactorExhausted {
            attempts: tokens_used,
            logins,
        })
    }

    fn ensure_running(&self) -> Result<(), WorkflowError> {
        match &self.shutdown {
            Some(rx) if *rx.borrow() => Err(WorkflowError::Cancelled),
            _ => Ok(()),
        }
    }

    async fn record(&self, state: &mut WorkflowState, current: RequestState) {
        state.put(current);
        self.checkpoint(state).await;
    }

    async fn checkpoint(&self, state: &WorkflowState) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.save(state).await {
                warn!(path = %journal.path().display(), error = %err, "Could not write journal checkpoint");
            }
        }
    }
}

/// A refused transition means the stored state disagrees with the portals
fn guard(current: &mut RequestState, step: Step, result: Result<(), TransitionError>, attempts: u32) {
    if let Err(err) = result {
        error!(error = %err, "Inconsistent request state");
        current.failed(step, err, attempts);
    }
}

fn registered_imeis(current: &RequestState) -> Vec<String> {
    match (&current.record, &current.submission) {
        (Some(record), _) => record.imeis().map(str::to_string).collect(),
        (None, Some(submission)) => vec![submission.device_imei.clone()],
        (None, None) => Vec::new(),
    }
}
