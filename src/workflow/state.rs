//! Per-request progress, threaded through the orchestrator as a plain value.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::normalize::Rejection;
use crate::types::{ConfirmationOutcome, NormalizedRecord, PendingRequest, SubmissionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Listed,
    Extracted,
    Normalized,
    Submitted,
    Confirmed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Listed => "listed",
            Stage::Extracted => "extracted",
            Stage::Normalized => "normalized",
            Stage::Submitted => "submitted",
            Stage::Confirmed => "confirmed",
        };
        f.pad(name)
    }
}

/// The portal operation a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    Extract,
    Normalize,
    Submit,
    Verify,
    Confirm,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Extract => "extract",
            Step::Normalize => "normalize",
            Step::Submit => "submit",
            Step::Verify => "verify",
            Step::Confirm => "confirm",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalOutcome {
    Rejected(Rejection),
    Failed {
        step: Step,
        error: String,
        attempts: u32,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("request {request_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        request_id: String,
        from: Stage,
        to: Stage,
    },

    #[error("request {request_id}: {reason}")]
    Inconsistent { request_id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestState {
    pub request_id: String,
    pub stage: Stage,
    pub request: Option<PendingRequest>,
    pub record: Option<NormalizedRecord>,
    pub submission: Option<SubmissionResult>,
    pub confirmation: Option<ConfirmationOutcome>,
    pub outcome: Option<TerminalOutcome>,
    pub updated_at: DateTime<Utc>,
}

impl RequestState {
    pub fn listed(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            stage: Stage::Listed,
            request: None,
            record: None,
            submission: None,
            confirmation: None,
            outcome: None,
            updated_at: Utc::now(),
        }
    }

    fn expect_stage(&self, expected: Stage, to: Stage) -> Result<(), TransitionError> {
        if self.stage == expected {
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition {
                request_id: self.request_id.clone(),
                from: self.stage,
                to,
            })
        }
    }

    fn expect_id(&self, other: &str) -> Result<(), TransitionError> {
        if self.request_id == other {
            Ok(())
        } else {
            Err(TransitionError::Inconsistent {
                request_id: self.request_id.clone(),
                reason: format!("received data for request {}", other),
            })
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Extraction happens once; the request is immutable afterwards
    pub fn extracted(&mut self, request: PendingRequest) -> Result<(), TransitionError> {
        self.expect_stage(Stage::Listed, Stage::Extracted)?;
        self.expect_id(&request.request_id)?;
        self.request = Some(request);
        self.stage = Stage::Extracted;
        self.outcome = None;
        self.touch();
        Ok(())
    }

    pub fn normalized(&mut self, record: NormalizedRecord) -> Result<(), TransitionError> {
        self.expect_stage(Stage::Extracted, Stage::Normalized)?;
        self.expect_id(&record.request_id)?;
        self.record = Some(record);
        self.stage = Stage::Normalized;
        self.outcome = None;
        self.touch();
        Ok(())
    }

    /// Normalization failed; the request stays extracted so a later run can retry it
    pub fn rejected(&mut self, rejection: Rejection) -> Result<(), TransitionError> {
        self.expect_stage(Stage::Extracted, Stage::Extracted)?;
        self.outcome = Some(TerminalOutcome::Rejected(rejection));
        self.touch();
        Ok(())
    }

    /// The registry acknowledged the form. The reference may still be
    /// unknown until a lookup shows the registration.
    pub fn submitted(&mut self, submission: SubmissionResult) -> Result<(), TransitionError> {
        self.expect_stage(Stage::Normalized, Stage::Submitted)?;
        self.expect_id(&submission.request_id)?;
        if submission.accepted != submission.portal_b_reference.is_some() {
            return Err(TransitionError::Inconsistent {
                request_id: self.request_id.clone(),
                reason: "accepted submission without a registry reference".to_string(),
            });
        }
        self.submission = Some(submission);
        self.stage = Stage::Submitted;
        self.outcome = None;
        self.touch();
        Ok(())
    }

    /// A lookup found the registration; records the reference it is listed under
    pub fn verified(&mut self, reference: impl Into<String>) -> Result<(), TransitionError> {
        self.expect_stage(Stage::Submitted, Stage::Submitted)?;
        let Some(submission) = self.submission.as_mut() else {
            return Err(TransitionError::Inconsistent {
                request_id: self.request_id.clone(),
                reason: "submitted without a submission".to_string(),
            });
        };
        submission.accepted = true;
        submission.portal_b_reference = Some(reference.into());
        self.touch();
        Ok(())
    }

    /// The registry no longer shows the device: the submission has to be redone
    pub fn unverified(&mut self) -> Result<(), TransitionError> {
        self.expect_stage(Stage::Submitted, Stage::Normalized)?;
        self.submission = None;
        self.stage = Stage::Normalized;
        self.touch();
        Ok(())
    }

    /// Only a registration the registry has shown may be confirmed
    pub fn confirmed(&mut self, confirmation: ConfirmationOutcome) -> Result<(), TransitionError> {
        self.expect_stage(Stage::Submitted, Stage::Confirmed)?;
        if !self.submission.as_ref().is_some_and(|s| s.accepted) {
            return Err(TransitionError::Inconsistent {
                request_id: self.request_id.clone(),
                reason: "registration was never seen in the registry".to_string(),
            });
        }
        self.confirmation = Some(confirmation);
        self.stage = Stage::Confirmed;
        self.outcome = None;
        self.touch();
        Ok(())
    }

    /// Retries ran out. The stage is left where it was.
    pub fn failed(&mut self, step: Step, error: impl fmt::Display, attempts: u32) {
        self.outcome = Some(TerminalOutcome::Failed {
            step,
            error: error.to_string(),
            attempts,
        });
        self.touch();
    }

    /// Forget the previous run's verdict so the request is attempted again
    pub fn clear_outcome(&mut self) {
        self.outcome = None;
    }

    pub fn is_confirmed(&self) -> bool {
        self.stage == Stage::Confirmed
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.outcome, Some(TerminalOutcome::Rejected(_)))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Some(TerminalOutcome::Failed { .. }))
    }

    /// Still has registry or confirmation work left
    pub fn needs_registry(&self) -> bool {
        self.outcome.is_none() && matches!(self.stage, Stage::Normalized | Stage::Submitted)
    }
}

/// Progress of every request seen so far, keyed by request id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    requests: BTreeMap<String, RequestState>,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, request_id: &str) -> Option<&RequestState> {
        self.requests.get(request_id)
    }

    /// The stored state, or a fresh `Listed` one
    pub fn current(&self, request_id: &str) -> RequestState {
        self.requests
            .get(request_id)
            .cloned()
            .unwrap_or_else(|| RequestState::listed(request_id))
    }

    pub fn put(&mut self, state: RequestState) {
        self.requests.insert(state.request_id.clone(), state);
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestState> {
        self.requests.values()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn count_at(&self, stage: Stage) -> usize {
        self.requests.values().filter(|r| r.stage == stage).count()
    }
}
