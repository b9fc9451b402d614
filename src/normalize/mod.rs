//! Mapping of raw intake fields into the registry's vocabulary.
//!
//! [`normalize`] is pure: the same request and table always give the same
//! answer, and a rejection never carries half-resolved fields.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reference::keys::{country_key, field_key};
use crate::reference::{Field, ReferenceTable, ResolveError};
use crate::types::{NormalizedRecord, PendingRequest};

pub mod imei;

pub use imei::is_valid_imei;

/// Minimum Jaro-Winkler similarity for a "did you mean" hint
pub const SUGGESTION_THRESHOLD: f64 = 0.85;

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    #[error("unknown brand '{raw}'{}", hint(.suggestion))]
    UnknownBrand {
        raw: String,
        suggestion: Option<String>,
    },

    #[error("unknown model '{raw}'{}", hint(.suggestion))]
    UnknownModel {
        raw: String,
        suggestion: Option<String>,
    },

    #[error("unknown country '{raw}'{}", hint(.suggestion))]
    UnknownCountry {
        raw: String,
        suggestion: Option<String>,
    },

    #[error("{brand} {model} is not registered for {country}")]
    NotFound {
        brand: String,
        model: String,
        country: String,
    },

    #[error("'{raw}' is not a valid IMEI")]
    InvalidImeiFormat { raw: String },
}

fn hint(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (did you mean '{}'?)", s))
        .unwrap_or_default()
}

impl Rejection {
    /// Stable short code for reports and exports
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::UnknownBrand { .. } => "unknown-brand",
            Rejection::UnknownModel { .. } => "unknown-model",
            Rejection::UnknownCountry { .. } => "unknown-country",
            Rejection::NotFound { .. } => "not-found",
            Rejection::InvalidImeiFormat { .. } => "invalid-imei",
        }
    }
}

pub fn normalize(
    request: &PendingRequest,
    table: &ReferenceTable,
) -> Result<NormalizedRecord, Rejection> {
    let device_imei = checked_imei(&request.device_imei)?;
    let secondary_imei = request
        .secondary_imei
        .as_deref()
        .map(checked_imei)
        .transpose()?;

    let triple = table
        .resolve(&request.raw_brand, &request.raw_model, &request.raw_country)
        .map_err(|e| rejection_for(e, table))?;

    Ok(NormalizedRecord {
        request_id: request.request_id.clone(),
        canonical_brand: triple.brand,
        canonical_model: triple.model,
        canonical_country: triple.country,
        device_imei,
        secondary_imei,
        serial_number: request.serial_number.trim().to_string(),
        holder: request.holder.clone(),
    })
}

fn checked_imei(raw: &str) -> Result<String, Rejection> {
    let imei = raw.trim();
    if is_valid_imei(imei) {
        Ok(imei.to_string())
    } else {
        Err(Rejection::InvalidImeiFormat {
            raw: raw.to_string(),
        })
    }
}

fn rejection_for(err: ResolveError, table: &ReferenceTable) -> Rejection {
    match err {
        ResolveError::UnknownBrand(raw) => Rejection::UnknownBrand {
            suggestion: suggest(table, Field::Brand, &raw),
            raw,
        },
        ResolveError::UnknownModel(raw) => Rejection::UnknownModel {
            suggestion: suggest(table, Field::Model, &raw),
            raw,
        },
        ResolveError::UnknownCountry(raw) => Rejection::UnknownCountry {
            suggestion: suggest(table, Field::Country, &raw),
            raw,
        },
        ResolveError::NotFound {
            brand,
            model,
            country,
        } => Rejection::NotFound {
            brand,
            model,
            country,
        },
    }
}

/// Closest canonical spelling of `raw`, if any is similar enough
pub fn suggest(table: &ReferenceTable, field: Field, raw: &str) -> Option<String> {
    let key = match field {
        Field::Country => country_key,
        Field::Brand | Field::Model => field_key,
    };
    let wanted = key(raw);
    if wanted.is_empty() {
        return None;
    }

    table
        .canonical(field)
        .into_iter()
        .map(|candidate| (strsim::jaro_winkler(&wanted, &key(candidate)), candidate))
        .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, candidate)| candidate.to_string())
}

/// Owns the shared reference table for the orchestrator
#[derive(Debug, Clone)]
pub struct Normalizer {
    table: Arc<ReferenceTable>,
}

impl Normalizer {
    pub fn new(table: Arc<ReferenceTable>) -> Self {
        Self { table }
    }

    pub fn normalize(&self, request: &PendingRequest) -> Result<NormalizedRecord, Rejection> {
        normalize(request, &self.table)
    }

    pub fn table(&self) -> &ReferenceTable {
        &self.table
    }
}
