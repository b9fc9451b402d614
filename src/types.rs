// Core data carried between the intake portal, the normalizer and the registry portal

use std::fmt;

use serde::{Deserialize, Serialize};

/// Username/password pair for one portal. The password never shows up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identity document presented by the device holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DocumentKind {
    #[default]
    Passport,
    NationalId,
}

impl DocumentKind {
    /// Classify the label shown by the intake portal ("Pasaporte", "RUT (DNI)", ...).
    /// Anything unrecognized is treated as a passport, which is what the portal defaults to.
    pub fn from_label(label: &str) -> Self {
        let upper = label.to_uppercase();
        if upper.contains("PASAP") || upper.contains("PASSPORT") {
            DocumentKind::Passport
        } else if upper.contains("RUT") || upper.contains("DNI") || upper.contains("NATIONAL") {
            DocumentKind::NationalId
        } else {
            DocumentKind::Passport
        }
    }

    /// Fragment matched against the registry's document type options
    pub fn option_hint(&self) -> &'static str {
        match self {
            DocumentKind::Passport => "pasap",
            DocumentKind::NationalId => "rut",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Passport => write!(f, "passport"),
            DocumentKind::NationalId => write!(f, "national-id"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Holder {
    pub name: String,
    pub document_kind: DocumentKind,
    pub document_number: String,
}

/// A registration request as it was read from the intake portal, before any normalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request_id: String,
    pub raw_brand: String,
    pub raw_model: String,
    pub raw_country: String,
    pub device_imei: String,
    /// Second slot of dual-SIM devices
    #[serde(default)]
    pub secondary_imei: Option<String>,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub holder: Holder,
}

impl PendingRequest {
    pub fn new(
        request_id: impl Into<String>,
        raw_brand: impl Into<String>,
        raw_model: impl Into<String>,
        raw_country: impl Into<String>,
        device_imei: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            raw_brand: raw_brand.into(),
            raw_model: raw_model.into(),
            raw_country: raw_country.into(),
            device_imei: device_imei.into(),
            secondary_imei: None,
            serial_number: String::new(),
            holder: Holder::default(),
        }
    }

    pub fn with_secondary_imei(mut self, imei: impl Into<String>) -> Self {
        let imei = imei.into();
        self.secondary_imei = if imei.trim().is_empty() {
            None
        } else {
            Some(imei)
        };
        self
    }

    pub fn with_serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = serial.into();
        self
    }

    pub fn with_holder(mut self, holder: Holder) -> Self {
        self.holder = holder;
        self
    }
}

/// A request whose brand, model and country are expressed in the registry's vocabulary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub request_id: String,
    pub canonical_brand: String,
    pub canonical_model: String,
    pub canonical_country: String,
    pub device_imei: String,
    #[serde(default)]
    pub secondary_imei: Option<String>,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub holder: Holder,
}

impl NormalizedRecord {
    /// Number of IMEI slots declared on the registration form
    pub fn imei_count(&self) -> u8 {
        if self.secondary_imei.is_some() {
            2
        } else {
            1
        }
    }

    /// Every IMEI that may identify this device in the registry
    pub fn imeis(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.device_imei.as_str()).chain(self.secondary_imei.as_deref())
    }
}

/// Outcome of a registry submission. `portal_b_reference` is present iff `accepted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub request_id: String,
    pub device_imei: String,
    pub accepted: bool,
    pub portal_b_reference: Option<String>,
}

impl SubmissionResult {
    pub fn accepted(
        request_id: impl Into<String>,
        device_imei: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            device_imei: device_imei.into(),
            accepted: true,
            portal_b_reference: Some(reference.into()),
        }
    }

    /// The portal acknowledged the form but the registration could not be read back
    pub fn unverified(request_id: impl Into<String>, device_imei: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            device_imei: device_imei.into(),
            accepted: false,
            portal_b_reference: None,
        }
    }
}

/// A registration as listed by the registry's lookup-by-IMEI screen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub imei: String,
    pub reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationOutcome {
    Confirmed,
    AlreadyConfirmed,
}
