// Browser-driven client for the intake portal

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::{IntakePortal, IntakeSelectors, IntakeSession, PendingQueue};
use crate::browser::{BrowserError, BrowserSession, Timeouts, WaitCondition};
use crate::errors::{PortalError, PortalKind};
use crate::types::{ConfirmationOutcome, Credentials, DocumentKind, Holder, PendingRequest};

/// A queue row as it appears in the administrative table
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueRow {
    request_id: String,
    action_label: String,
}

pub struct IntakeClient<S> {
    browser: S,
    base_url: String,
    selectors: IntakeSelectors,
    timeouts: Timeouts,
    default_country: Option<String>,
}

impl<S: BrowserSession> IntakeClient<S> {
    pub fn new(
        browser: S,
        base_url: impl Into<String>,
        selectors: IntakeSelectors,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            browser,
            base_url: base_url.into(),
            selectors,
            timeouts,
            default_country: None,
        }
    }

    /// Country used when a request's detail page leaves it blank
    pub fn with_default_country(mut self, country: Option<String>) -> Self {
        self.default_country = country.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn browser(&self) -> &S {
        &self.browser
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn settle(&mut self) -> Result<(), BrowserError> {
        let overlay = WaitCondition::hidden(self.selectors.loading_overlay.clone());
        self.browser.wait_for(&overlay, self.timeouts.element).await
    }

    async fn open_queue(&mut self) -> Result<(), PortalError> {
        let url = self.url(&self.selectors.queue_path);
        self.browser.navigate(&url).await?;
        let table = WaitCondition::visible(self.selectors.queue_table.clone());
        self.browser
            .wait_for(&table, self.timeouts.navigation)
            .await?;
        self.settle().await?;
        Ok(())
    }

    async fn read_queue(&mut self) -> Result<Vec<QueueRow>, PortalError> {
        let rows = self
            .browser
            .read_rows(
                &self.selectors.queue_rows,
                &[
                    self.selectors.row_id_cell.as_str(),
                    self.selectors.row_action_cell.as_str(),
                ],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|mut cells| {
                let action_label = cells.pop().unwrap_or_default();
                let request_id = cells.pop().unwrap_or_default();
                QueueRow {
                    request_id: request_id.trim().to_string(),
                    action_label,
                }
            })
            .collect())
    }

    fn is_pending(&self, row: &QueueRow) -> bool {
        row.action_label
            .contains(self.selectors.pending_action_label.as_str())
    }

    async fn read_field(&mut self, selector: &str) -> Result<String, PortalError> {
        Ok(self
            .browser
            .read_value(selector)
            .await?
            .map(|v| v.trim().to_string())
            .unwrap_or_default())
    }

    async fn read_label(&mut self, selector: &str) -> Result<String, PortalError> {
        Ok(self
            .browser
            .read_text(selector)
            .await?
            .map(|v| v.trim().to_string())
            .unwrap_or_default())
    }

    fn action_link(&self, row_index: usize) -> String {
        format!(
            "{}:nth-of-type({}) {} div a",
            self.selectors.queue_rows,
            row_index + 1,
            self.selectors.row_action_cell
        )
    }
}

#[async_trait]
impl<S: BrowserSession> IntakePortal for IntakeClient<S> {
    async fn login(&mut self, credentials: &Credentials) -> Result<IntakeSession, PortalError> {
        info!(username = %credentials.username, "Logging in to intake portal");
        let base_url = self.base_url.clone();
        self.browser.navigate(&base_url).await?;

        let user_input = self.selectors.username_input.clone();
        let password_input = self.selectors.password_input.clone();
        self.browser
            .wait_for(&WaitCondition::visible(user_input.clone()), self.timeouts.navigation)
            .await?;
        self.browser.fill(&user_input, &credentials.username).await?;
        self.browser
            .fill(&password_input, &credentials.password)
            .await?;
        self.browser.press_key(&password_input, "Enter").await?;

        let landed = WaitCondition::url_contains(self.selectors.logged_in_url_fragment.clone());
        match self.browser.wait_for(&landed, self.timeouts.navigation).await {
            Ok(()) => {}
            Err(err @ BrowserError::Timeout { .. }) => {
                let login_error = self.selectors.login_error.clone();
                if self.browser.is_visible(&login_error).await? {
                    let message = self.read_label(&login_error).await?;
                    return Err(PortalError::auth(PortalKind::Intake, message));
                }
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        }

        info!("Intake portal session established");
        Ok(IntakeSession {
            username: credentials.username.clone(),
            established_at: Utc::now(),
        })
    }

    async fn list_pending_requests(
        &mut self,
        _session: &IntakeSession,
    ) -> Result<PendingQueue, PortalError> {
        self.open_queue().await?;
        let rows = self.read_queue().await?;
        let total = rows.len();

        let ids: Vec<String> = rows
            .into_iter()
            .filter(|row| self.is_pending(row))
            .filter(|row| {
                !row.request_id.is_empty() && row.request_id.chars().all(|c| c.is_ascii_digit())
            })
            .map(|row| row.request_id)
            .collect();

        info!(rows = total, pending = ids.len(), "Scanned intake queue");
        Ok(PendingQueue::new(ids))
    }

    async fn extract_request(
        &mut self,
        _session: &IntakeSession,
        request_id: &str,
    ) -> Result<PendingRequest, PortalError> {
        let url = self.url(&self.selectors.detail_path.replace("{id}", request_id));
        self.browser.navigate(&url).await?;
        let form = WaitCondition::visible(self.selectors.detail_form.clone());
        self.browser.wait_for(&form, self.timeouts.navigation).await?;
        self.settle().await?;

        let s = self.selectors.clone();
        let imei_1 = self.read_field(&s.imei_1).await?;
        let imei_2 = self.read_field(&s.imei_2).await?;
        let serial_number = self.read_field(&s.serial_number).await?;
        let document_number = self.read_field(&s.document_number).await?;
        let holder_name = self.read_field(&s.holder_name).await?;
        let document_label = self.read_field(&s.document_kind).await?;
        let brand = self.read_label(&s.brand).await?;
        let model = self.read_label(&s.model).await?;
        let mut country = self.read_label(&s.country).await?;

        if country.is_empty() {
            if let Some(default_country) = &self.default_country {
                warn!(request_id, country = %default_country, "Country missing, using default");
                country = default_country.clone();
            }
        }

        debug!(request_id, brand = %brand, model = %model, country = %country, "Extracted request");

        Ok(PendingRequest::new(request_id, brand, model, country, imei_1)
            .with_secondary_imei(imei_2)
            .with_serial_number(serial_number)
            .with_holder(Holder {
                name: holder_name,
                document_kind: DocumentKind::from_label(&document_label),
                document_number,
            }))
    }

    async fn confirm_request(
        &mut self,
        _session: &IntakeSession,
        request_id: &str,
    ) -> Result<ConfirmationOutcome, PortalError> {
        self.open_queue().await?;
        let rows = self.read_queue().await?;
        let still_pending = rows
            .iter()
            .any(|row| row.request_id == request_id && self.is_pending(row));
        if !still_pending {
            info!(request_id, "Request no longer pending in intake queue");
            return Ok(ConfirmationOutcome::AlreadyConfirmed);
        }

        let search = self.selectors.search_input.clone();
        if self.browser.is_visible(&search).await? {
            self.browser.fill(&search, request_id).await?;
            self.browser.press_key(&search, "Enter").await?;
            self.settle().await?;
        }

        let rows = self.read_queue().await?;
        let Some(index) = rows
            .iter()
            .position(|row| row.request_id == request_id && self.is_pending(row))
        else {
            return Err(PortalError::transient(
                "confirm",
                format!("request {} vanished from the filtered queue", request_id),
            ));
        };

        let link = self.action_link(index);
        self.browser.click(&link).await?;

        let accept = self.selectors.confirm_accept.clone();
        self.browser
            .wait_for(&WaitCondition::visible(accept.clone()), self.timeouts.element)
            .await?;
        self.browser.click(&accept).await?;
        self.settle().await?;

        let confirm_error = self.selectors.confirm_error.clone();
        if self.browser.is_visible(&confirm_error).await? {
            let message = self.read_label(&confirm_error).await?;
            return Err(PortalError::ConfirmRejected {
                request_id: request_id.to_string(),
                message,
            });
        }

        self.open_queue().await?;
        let rows = self.read_queue().await?;
        if rows
            .iter()
            .any(|row| row.request_id == request_id && self.is_pending(row))
        {
            return Err(PortalError::transient(
                "confirm",
                format!("request {} still pending after confirmation", request_id),
            ));
        }

        info!(request_id, "Request confirmed in intake portal");
        Ok(ConfirmationOutcome::Confirmed)
    }
}
