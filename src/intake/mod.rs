//! System A: the administrative queue of pending registration requests.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PortalError;
use crate::types::{ConfirmationOutcome, Credentials, PendingRequest};

pub mod client;

pub use client::IntakeClient;

/// Proof of a logged-in intake session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeSession {
    pub username: String,
    pub established_at: DateTime<Utc>,
}

/// Request ids captured when the queue was scanned. Consumed by iteration;
/// a later scan is a new queue.
#[derive(Debug)]
pub struct PendingQueue {
    ids: VecDeque<String>,
    scanned_at: DateTime<Utc>,
}

impl PendingQueue {
    /// Duplicate ids keep their first position
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let ids = ids
            .into_iter()
            .map(Into::into)
            .filter(|id: &String| seen.insert(id.clone()))
            .collect();
        Self {
            ids,
            scanned_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn scanned_at(&self) -> DateTime<Utc> {
        self.scanned_at
    }
}

impl Iterator for PendingQueue {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        self.ids.pop_front()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.ids.len(), Some(self.ids.len()))
    }
}

#[async_trait]
pub trait IntakePortal: Send {
    async fn login(&mut self, credentials: &Credentials) -> Result<IntakeSession, PortalError>;

    async fn list_pending_requests(
        &mut self,
        session: &IntakeSession,
    ) -> Result<PendingQueue, PortalError>;

    async fn extract_request(
        &mut self,
        session: &IntakeSession,
        request_id: &str,
    ) -> Result<PendingRequest, PortalError>;

    /// Safe to call repeatedly: a request that is no longer pending reports `AlreadyConfirmed`
    async fn confirm_request(
        &mut self,
        session: &IntakeSession,
        request_id: &str,
    ) -> Result<ConfirmationOutcome, PortalError>;
}

/// CSS selectors and paths of the intake portal. Every key can be overridden from config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeSelectors {
    pub username_input: String,
    pub password_input: String,
    pub logged_in_url_fragment: String,
    pub login_error: String,
    pub queue_path: String,
    /// `{id}` is replaced by the request id
    pub detail_path: String,
    pub queue_table: String,
    pub queue_rows: String,
    pub row_id_cell: String,
    pub row_action_cell: String,
    pub pending_action_label: String,
    pub search_input: String,
    pub confirm_accept: String,
    pub confirm_error: String,
    pub detail_form: String,
    pub imei_1: String,
    pub imei_2: String,
    pub serial_number: String,
    pub document_kind: String,
    pub document_number: String,
    pub holder_name: String,
    pub brand: String,
    pub model: String,
    pub country: String,
    pub loading_overlay: String,
}

const DETAIL_FIELDS: &str = "#formulario > div:nth-of-type(1) > div > div > div:nth-of-type(3)";

fn detail_input(position: u8) -> String {
    format!("{} > div:nth-of-type({}) input", DETAIL_FIELDS, position)
}

fn detail_label(position: u8) -> String {
    format!("{} > div:nth-of-type({}) p b", DETAIL_FIELDS, position)
}

impl Default for IntakeSelectors {
    fn default() -> Self {
        Self {
            username_input: "#floatingInput".to_string(),
            password_input: "#floatingPassword".to_string(),
            logged_in_url_fragment: "index.php".to_string(),
            login_error: ".alert-danger".to_string(),
            queue_path:
                "index.php?do=submission/pending_adm_submissions_landing_page&rType=page&navbarp=1"
                    .to_string(),
            detail_path: "index.php?do=submission/confirm_automatic_process&id={id}&rType=page"
                .to_string(),
            queue_table: "#tabla-ordenable".to_string(),
            queue_rows: "#tabla-ordenable tbody tr".to_string(),
            row_id_cell: "th".to_string(),
            row_action_cell: "td:nth-of-type(9)".to_string(),
            pending_action_label: "Confirmar en OABI".to_string(),
            search_input: "#buscador".to_string(),
            confirm_accept: ".modal .modal-footer button:nth-of-type(2)".to_string(),
            confirm_error: ".alert-danger".to_string(),
            detail_form: "#formulario".to_string(),
            imei_1: detail_input(2),
            imei_2: detail_input(3),
            serial_number: detail_input(4),
            document_kind: "#form_document_type".to_string(),
            document_number: detail_input(6),
            holder_name: detail_input(7),
            brand: detail_label(8),
            model: detail_label(9),
            country: detail_label(10),
            loading_overlay: "#mb-loading".to_string(),
        }
    }
}
