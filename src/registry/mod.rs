//! System B: the second-factor protected device registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PortalError;
use crate::types::{Credentials, NormalizedRecord, RegistrationRecord, SubmissionResult};

pub mod client;
pub mod handshake;
pub mod token;

pub use client::RegistryClient;
pub use handshake::{HandshakePhase, SecondFactorHandshake};
pub use token::{PresetThenPrompt, PromptToken, SecondFactorToken, StaticToken, TokenError, TokenProvider};

/// First factor accepted, waiting for the token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSecondFactor {
    pub username: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySession {
    pub username: String,
    pub authenticated_at: DateTime<Utc>,
}

#[async_trait]
pub trait RegistryPortal: Send {
    async fn login(&mut self, credentials: &Credentials) -> Result<PendingSecondFactor, PortalError>;

    /// `InvalidToken` leaves `pending` usable for another token; `TokenExpired` needs a new login
    async fn complete_second_factor(
        &mut self,
        pending: &PendingSecondFactor,
        token: &SecondFactorToken,
    ) -> Result<RegistrySession, PortalError>;

    async fn submit(
        &mut self,
        session: &RegistrySession,
        record: &NormalizedRecord,
    ) -> Result<SubmissionResult, PortalError>;

    async fn lookup_registration(
        &mut self,
        session: &RegistrySession,
        imei: &str,
    ) -> Result<Option<RegistrationRecord>, PortalError>;
}

/// Fixed texts written into every registration form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormDefaults {
    pub technical_details: String,
    pub usage_description: String,
}

impl Default for FormDefaults {
    fn default() -> Self {
        Self {
            technical_details: "Compra Internacional".to_string(),
            usage_description: "Uso personal".to_string(),
        }
    }
}

/// CSS selectors of the registry portal. Every key can be overridden from config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySelectors {
    pub username_input: String,
    pub password_input: String,
    pub login_error: String,
    pub token_input: String,
    pub token_error: String,
    pub registration_menu: String,
    pub registration_entry: String,
    pub new_registration: String,
    pub lookup_input: String,
    pub lookup_rows: String,
    pub lookup_reference_cell: String,
    pub lookup_imei_cell: String,
    pub imei_count: String,
    pub imei_1: String,
    pub imei_2: String,
    pub serial_number: String,
    pub document_kind: String,
    pub passport_number: String,
    pub national_id_number: String,
    pub brand_input: String,
    pub model_input: String,
    pub model_error: String,
    pub technical_details: String,
    pub holder_name: String,
    pub country_input: String,
    pub usage_description: String,
    pub success_banner: String,
    pub error_banner: String,
    pub field_errors: String,
    pub loading_overlays: Vec<String>,
    /// Lowercase fragments of an error banner that mean "already registered"
    pub duplicate_phrases: Vec<String>,
}

impl Default for RegistrySelectors {
    fn default() -> Self {
        Self {
            username_input: "#username".to_string(),
            password_input: "#password".to_string(),
            login_error: ".alert-danger".to_string(),
            token_input: "#token".to_string(),
            token_error: ".alert-danger".to_string(),
            registration_menu: "body > div:nth-of-type(1) > div:nth-of-type(1) > ul > li:nth-of-type(5) > a"
                .to_string(),
            registration_entry:
                "body > div:nth-of-type(1) > div:nth-of-type(1) > ul > li:nth-of-type(5) > ul > li:nth-of-type(1) > a"
                    .to_string(),
            new_registration: "div:nth-of-type(2) > div:nth-of-type(2) > button".to_string(),
            lookup_input: "#in_imei".to_string(),
            lookup_rows: "table tbody tr".to_string(),
            lookup_reference_cell: "td:nth-of-type(1)".to_string(),
            lookup_imei_cell: "td:nth-of-type(2)".to_string(),
            imei_count: "#cant_imeis".to_string(),
            imei_1: "#cert_new_imei_1".to_string(),
            imei_2: "#cert_new_imei_2".to_string(),
            serial_number: "#num_serie".to_string(),
            document_kind: "#cert_new_document_type".to_string(),
            passport_number: "#cert_new_number_pasaporte".to_string(),
            national_id_number: "#cert_new_number_rut".to_string(),
            brand_input: "#cert_new_brand_dropdown".to_string(),
            model_input: "#cert_new_model_dropdown".to_string(),
            model_error: "#cert_new_model_dropdown-error".to_string(),
            technical_details: "#cert_new_detalles_tec".to_string(),
            holder_name: "#cert_new_name".to_string(),
            country_input: "#cert_new_country_dropdown".to_string(),
            usage_description: "#cert_new_description".to_string(),
            success_banner: ".alert-success".to_string(),
            error_banner: ".alert-danger".to_string(),
            field_errors: ".invalid-feedback, label.error".to_string(),
            loading_overlays: vec!["#mb-loading".to_string(), ".modal-backdrop".to_string()],
            duplicate_phrases: vec![
                "ya existe".to_string(),
                "ya se encuentra".to_string(),
                "ya registrado".to_string(),
                "duplicad".to_string(),
                "already".to_string(),
            ],
        }
    }
}
