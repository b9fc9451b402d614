//! Error taxonomy shared by both portal clients.
//!
//! Every portal operation reports one of these variants. The orchestrator
//! decides what each one means for a request: `Transient` is retried,
//! `DuplicateSubmission` counts as already done, `Auth` aborts the run.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::browser::BrowserError;

/// Which of the two portals an error or session belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortalKind {
    /// System A: the administrative queue holding pending requests
    Intake,
    /// System B: the second-factor protected device registry
    Registry,
}

impl fmt::Display for PortalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortalKind::Intake => write!(f, "intake portal"),
            PortalKind::Registry => write!(f, "registry portal"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortalError {
    #[error("{portal} rejected the credentials: {message}")]
    Auth { portal: PortalKind, message: String },

    #[error("transient failure during {operation}: {message}")]
    Transient { operation: String, message: String },

    #[error("second-factor token was rejected")]
    InvalidToken,

    #[error("second-factor token expired; a fresh login is required")]
    TokenExpired,

    #[error("device {imei} is already registered")]
    DuplicateSubmission {
        imei: String,
        existing_reference: Option<String>,
    },

    #[error("device {imei} is not listed in the registry")]
    NotListed { imei: String },

    #[error("registry rejected the registration: {message}")]
    Validation { message: String },

    #[error("confirmation of request {request_id} was refused: {message}")]
    ConfirmRejected { request_id: String, message: String },
}

impl PortalError {
    pub fn transient(operation: &str, cause: impl fmt::Display) -> Self {
        PortalError::Transient {
            operation: operation.to_string(),
            message: cause.to_string(),
        }
    }

    pub fn auth(portal: PortalKind, message: impl Into<String>) -> Self {
        PortalError::Auth {
            portal,
            message: message.into(),
        }
    }

    /// Navigation and timeout failures are worth another attempt, and so is
    /// a lookup that may be running behind a fresh registration.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PortalError::Transient { .. } | PortalError::NotListed { .. }
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, PortalError::Auth { .. })
    }
}

impl From<BrowserError> for PortalError {
    fn from(err: BrowserError) -> Self {
        PortalError::Transient {
            operation: err.operation().to_string(),
            message: err.to_string(),
        }
    }
}
