//! Static brand/model/country reference dataset.
//!
//! Loaded once from CSV (`brand,model,country,brand_aliases,model_aliases,country_aliases`,
//! aliases separated by `|`), then shared read-only through an `Arc`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod keys;
pub mod table;

pub use table::{NormalizedTriple, ReferenceTable, ANY_COUNTRY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    Brand,
    Model,
    Country,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Brand => write!(f, "brand"),
            Field::Model => write!(f, "model"),
            Field::Country => write!(f, "country"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("cannot read reference dataset {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed reference dataset: {0}")]
    Csv(#[from] csv::Error),

    #[error("line {line}: {field} is empty")]
    MissingValue { line: usize, field: Field },

    #[error("{field} alias '{alias}' maps to both '{first}' and '{second}'")]
    AmbiguousAlias {
        field: Field,
        alias: String,
        first: String,
        second: String,
    },

    #[error("reference dataset has no rows")]
    Empty,
}

/// Why a raw triple could not be resolved
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unknown brand '{0}'")]
    UnknownBrand(String),

    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("unknown country '{0}'")]
    UnknownCountry(String),

    #[error("{brand} {model} is not registered for {country}")]
    NotFound {
        brand: String,
        model: String,
        country: String,
    },
}
