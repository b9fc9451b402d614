// Browser-driven client for the registry portal

use async_trait::async_trait;
use chrono::Utc;
use statig::prelude::*;
use tracing::{debug, info, warn};

use super::handshake::{HandshakeEvent, SecondFactorHandshake};
use super::token::SecondFactorToken;
use super::{FormDefaults, PendingSecondFactor, RegistryPortal, RegistrySelectors, RegistrySession};
use crate::browser::{BrowserError, BrowserSession, Timeouts, WaitCondition};
use crate::errors::{PortalError, PortalKind};
use crate::types::{
    Credentials, DocumentKind, NormalizedRecord, RegistrationRecord, SubmissionResult,
};

/// What the portal showed after the registration form was sent
#[derive(Debug, Clone, PartialEq, Eq)]
enum FormResponse {
    Success,
    FieldErrors(String),
    ErrorBanner(String),
}

pub struct RegistryClient<S> {
    browser: S,
    login_url: String,
    selectors: RegistrySelectors,
    form: FormDefaults,
    timeouts: Timeouts,
    handshake: StateMachine<SecondFactorHandshake>,
}

impl<S: BrowserSession> RegistryClient<S> {
    pub fn new(
        browser: S,
        login_url: impl Into<String>,
        selectors: RegistrySelectors,
        form: FormDefaults,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            browser,
            login_url: login_url.into(),
            selectors,
            form,
            timeouts,
            handshake: SecondFactorHandshake::new().state_machine(),
        }
    }

    pub fn handshake(&self) -> &SecondFactorHandshake {
        self.handshake.inner()
    }

    pub fn browser(&self) -> &S {
        &self.browser
    }

    fn group<T: AsRef<str>>(selectors: &[T]) -> String {
        selectors
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn settle(&mut self) -> Result<(), BrowserError> {
        for overlay in self.selectors.loading_overlays.clone() {
            self.browser
                .wait_for(&WaitCondition::hidden(overlay), self.timeouts.element)
                .await?;
        }
        Ok(())
    }

    /// Text of the first member of a selector group that has any
    async fn first_text(&mut self, group: &str) -> Result<String, PortalError> {
        for selector in group.split(',').map(str::trim) {
            if let Some(text) = self.browser.read_text(selector).await? {
                if !text.trim().is_empty() {
                    return Ok(text.trim().to_string());
                }
            }
        }
        Ok(String::new())
    }

    async fn fill_and_enter(&mut self, selector: &str, value: &str) -> Result<(), PortalError> {
        self.browser.fill(selector, value).await?;
        self.browser.press_key(selector, "Enter").await?;
        Ok(())
    }

    fn ensure_authenticated(&self) -> Result<(), PortalError> {
        if self.handshake.inner().is_authenticated() {
            Ok(())
        } else {
            Err(PortalError::auth(
                PortalKind::Registry,
                "no authenticated registry session",
            ))
        }
    }

    /// Navigate through the menu to the administrative registration screen
    async fn open_registrations(&mut self) -> Result<(), PortalError> {
        self.settle().await?;
        let menu = self.selectors.registration_menu.clone();
        if !self.browser.is_visible(&menu).await? {
            let login_form = self.selectors.username_input.clone();
            if self.browser.is_visible(&login_form).await? {
                self.handshake.handle(&HandshakeEvent::SessionLost);
                return Err(PortalError::auth(
                    PortalKind::Registry,
                    "registry session expired",
                ));
            }
            self.browser
                .wait_for(&WaitCondition::visible(menu.clone()), self.timeouts.element)
                .await?;
        }
        self.browser.click(&menu).await?;
        self.settle().await?;

        let entry = self.selectors.registration_entry.clone();
        self.browser
            .wait_for(&WaitCondition::visible(entry.clone()), self.timeouts.element)
            .await?;
        self.browser.click(&entry).await?;
        self.settle().await?;

        let lookup = WaitCondition::visible(self.selectors.lookup_input.clone());
        self.browser.wait_for(&lookup, self.timeouts.navigation).await?;
        Ok(())
    }

    async fn lookup(&mut self, imei: &str) -> Result<Option<RegistrationRecord>, PortalError> {
        self.open_registrations().await?;
        let input = self.selectors.lookup_input.clone();
        self.fill_and_enter(&input, imei).await?;
        self.settle().await?;

        let rows = self
            .browser
            .read_rows(
                &self.selectors.lookup_rows,
                &[
                    self.selectors.lookup_reference_cell.as_str(),
                    self.selectors.lookup_imei_cell.as_str(),
                ],
            )
            .await?;

        let found = rows.into_iter().find_map(|cells| {
            let reference = cells.first().map(|c| c.trim()).unwrap_or_default();
            let listed_imei = cells.get(1).map(|c| c.trim()).unwrap_or_default();
            listed_imei.contains(imei).then(|| RegistrationRecord {
                imei: imei.to_string(),
                reference: if reference.is_empty() {
                    imei.to_string()
                } else {
                    reference.to_string()
                },
            })
        });

        debug!(imei, found = found.is_some(), "Registry lookup");
        Ok(found)
    }

    async fn fill_form(&mut self, record: &NormalizedRecord) -> Result<(), PortalError> {
        let s = self.selectors.clone();

        self.open_registrations().await?;
        self.browser
            .wait_for(
                &WaitCondition::visible(s.new_registration.clone()),
                self.timeouts.element,
            )
            .await?;
        self.browser.click(&s.new_registration).await?;
        self.browser
            .wait_for(
                &WaitCondition::visible(s.imei_count.clone()),
                self.timeouts.navigation,
            )
            .await?;

        self.browser
            .fill(&s.imei_count, &record.imei_count().to_string())
            .await?;
        self.browser.press_key(&s.imei_count, "Tab").await?;
        self.browser.fill(&s.imei_1, &record.device_imei).await?;
        if let Some(secondary) = &record.secondary_imei {
            self.browser.fill(&s.imei_2, secondary).await?;
        }
        self.browser
            .fill(&s.serial_number, &record.serial_number)
            .await?;

        let kind = record.holder.document_kind;
        if !self
            .browser
            .select_option(&s.document_kind, kind.option_hint())
            .await?
        {
            return Err(PortalError::Validation {
                message: format!("document type {} is not offered by the registry", kind),
            });
        }
        let number_input = match kind {
            DocumentKind::Passport => &s.passport_number,
            DocumentKind::NationalId => &s.national_id_number,
        };
        self.browser
            .fill(number_input, &record.holder.document_number)
            .await?;

        self.fill_and_enter(&s.brand_input, &record.canonical_brand)
            .await?;
        self.fill_and_enter(&s.model_input, &record.canonical_model)
            .await?;
        if self.browser.is_visible(&s.model_error).await? {
            let message = self.first_text(&s.model_error).await?;
            return Err(PortalError::Validation {
                message: format!(
                    "model '{}' not accepted: {}",
                    record.canonical_model, message
                ),
            });
        }

        let details = self.form.technical_details.clone();
        self.browser.fill(&s.technical_details, &details).await?;
        self.browser.fill(&s.holder_name, &record.holder.name).await?;
        self.fill_and_enter(&s.country_input, &record.canonical_country)
            .await?;

        let usage = self.form.usage_description.clone();
        self.fill_and_enter(&s.usage_description, &usage).await?;
        Ok(())
    }

    async fn await_response(&mut self) -> Result<FormResponse, PortalError> {
        let s = self.selectors.clone();
        let any_response = WaitCondition::visible(Self::group(&[
            &s.success_banner,
            &s.error_banner,
            &s.field_errors,
        ]));
        match self
            .browser
            .wait_for(&any_response, self.timeouts.navigation)
            .await
        {
            Ok(()) => {}
            Err(BrowserError::Timeout { waited, .. }) => {
                return Err(PortalError::transient(
                    "submit",
                    format!("no response from registry within {:?}", waited),
                ));
            }
            Err(e) => return Err(e.into()),
        }
        self.settle().await?;

        if self.browser.is_visible(&s.field_errors).await? {
            return Ok(FormResponse::FieldErrors(self.first_text(&s.field_errors).await?));
        }
        if self.browser.is_visible(&s.error_banner).await? {
            return Ok(FormResponse::ErrorBanner(self.first_text(&s.error_banner).await?));
        }
        Ok(FormResponse::Success)
    }

    fn is_duplicate_message(&self, message: &str) -> bool {
        let message = message.to_lowercase();
        self.selectors
            .duplicate_phrases
            .iter()
            .any(|phrase| message.contains(phrase.to_lowercase().as_str()))
    }

    fn classify_token_error(&mut self, message: &str) -> PortalError {
        let message = message.to_lowercase();
        if message.contains("expir") || message.contains("venc") {
            self.handshake.handle(&HandshakeEvent::TokenExpired);
            PortalError::TokenExpired
        } else {
            self.handshake.handle(&HandshakeEvent::TokenRejected);
            PortalError::InvalidToken
        }
    }
}

#[async_trait]
impl<S: BrowserSession> RegistryPortal for RegistryClient<S> {
    async fn login(
        &mut self,
        credentials: &Credentials,
    ) -> Result<PendingSecondFactor, PortalError> {
        info!(username = %credentials.username, "Logging in to registry portal");
        let s = self.selectors.clone();
        let login_url = self.login_url.clone();

        self.browser.navigate(&login_url).await?;
        self.browser
            .wait_for(
                &WaitCondition::visible(s.username_input.clone()),
                self.timeouts.navigation,
            )
            .await?;
        self.browser
            .fill(&s.username_input, &credentials.username)
            .await?;
        self.browser
            .fill(&s.password_input, &credentials.password)
            .await?;
        self.browser.press_key(&s.password_input, "Enter").await?;

        let challenge = WaitCondition::visible(Self::group(&[&s.token_input, &s.login_error]));
        self.browser
            .wait_for(&challenge, self.timeouts.navigation)
            .await?;

        if !self.browser.is_visible(&s.token_input).await? {
            let message = self.first_text(&s.login_error).await?;
            return Err(PortalError::auth(PortalKind::Registry, message));
        }

        self.handshake.handle(&HandshakeEvent::FirstFactorAccepted);
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
        let s = self.selectors.clone();
        if !self.handshake.inner().is_awaiting_token() {
            return Err(PortalError::TokenExpired);
        }
        if !self.browser.is_visible(&s.token_input).await? {
            self.handshake.handle(&HandshakeEvent::SessionLost);
            return Err(PortalError::TokenExpired);
        }

        let stale_banner = self.browser.is_visible(&s.token_error).await?;
        self.fill_and_enter(&s.token_input, token.expose()).await?;

        // The previous rejection stays on screen until the page reloads
        if stale_banner {
            match self
                .browser
                .wait_for(&WaitCondition::hidden(s.token_error.clone()), self.timeouts.element)
                .await
            {
                Ok(()) => {}
                Err(BrowserError::Timeout { .. }) => {
                    debug!("Token error banner still shown after entering a new token");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let outcome = WaitCondition::visible(Self::group(&[&s.registration_menu, &s.token_error]));
        match self
            .browser
            .wait_for(&outcome, self.timeouts.navigation)
            .await
        {
            Ok(()) => {}
            Err(err @ BrowserError::Timeout { .. }) => {
                if self.browser.is_visible(&s.username_input).await? {
                    self.handshake.handle(&HandshakeEvent::TokenExpired);
                    return Err(PortalError::TokenExpired);
                }
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        }

        if self.browser.is_visible(&s.registration_menu).await? {
            self.handshake.handle(&HandshakeEvent::TokenAccepted);
            self.settle().await?;
            info!(username = %pending.username, "Registry session established");
            return Ok(RegistrySession {
                username: pending.username.clone(),
                authenticated_at: Utc::now(),
            });
        }

        let message = self.first_text(&s.token_error).await?;
        Err(self.classify_token_error(&message))
    }

    async fn submit(
        &mut self,
        _session: &RegistrySession,
        record: &NormalizedRecord,
    ) -> Result<SubmissionResult, PortalError> {
        self.ensure_authenticated()?;

        let imeis: Vec<String> = record.imeis().map(str::to_string).collect();
        for imei in &imeis {
            if let Some(existing) = self.lookup(imei).await? {
                info!(
                    request_id = %record.request_id,
                    imei = %imei,
                    reference = %existing.reference,
                    "Device already registered"
                );
                return Err(PortalError::DuplicateSubmission {
                    imei: imei.clone(),
                    existing_reference: Some(existing.reference),
                });
            }
        }

        self.fill_form(record).await?;

        match self.await_response().await? {
            FormResponse::FieldErrors(message) => Err(PortalError::Validation { message }),
            FormResponse::ErrorBanner(message) if self.is_duplicate_message(&message) => {
                Err(PortalError::DuplicateSubmission {
                    imei: record.device_imei.clone(),
                    existing_reference: None,
                })
            }
            FormResponse::ErrorBanner(message) => Err(PortalError::Validation { message }),
            FormResponse::Success => {
                for imei in &imeis {
                    if let Some(found) = self.lookup(imei).await? {
                        info!(
                            request_id = %record.request_id,
                            reference = %found.reference,
                            "Registration accepted"
                        );
                        return Ok(SubmissionResult::accepted(
                            record.request_id.clone(),
                            record.device_imei.clone(),
                            found.reference,
                        ));
                    }
                }
                warn!(
                    request_id = %record.request_id,
                    "Registry acknowledged the form but the IMEI is not listed"
                );
                Ok(SubmissionResult::unverified(
                    record.request_id.clone(),
                    record.device_imei.clone(),
                ))
            }
        }
    }

    async fn lookup_registration(
        &mut self,
        _session: &RegistrySession,
        imei: &str,
    ) -> Result<Option<RegistrationRecord>, PortalError> {
        self.ensure_authenticated()?;
        self.lookup(imei).await
    }
}
