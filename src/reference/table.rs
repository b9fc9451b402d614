use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use super::keys::{country_key, field_key, strip_brand_prefix};
use super::{Field, ReferenceError, ResolveError};

/// Country cell meaning "valid in every country the table knows"
pub const ANY_COUNTRY: &str = "*";

#[derive(Debug, Deserialize)]
struct ReferenceRow {
    brand: String,
    model: String,
    country: String,
    #[serde(default)]
    brand_aliases: String,
    #[serde(default)]
    model_aliases: String,
    #[serde(default)]
    country_aliases: String,
}

/// Canonical (brand, model, country) in the registry's vocabulary
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedTriple {
    pub brand: String,
    pub model: String,
    pub country: String,
}

/// Read-only alias index over the reference dataset. Model aliases are
/// scoped to their brand; two brands may share a spelling.
#[derive(Debug, Default)]
pub struct ReferenceTable {
    brands: HashMap<String, String>,
    models: HashMap<String, HashMap<String, String>>,
    /// model key -> every (brand, model) carrying it
    model_owners: HashMap<String, BTreeSet<(String, String)>>,
    countries: HashMap<String, String>,
    combinations: HashSet<(String, String, String)>,
    any_country: HashSet<(String, String)>,
    rows: usize,
}

impl ReferenceTable {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ReferenceError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|source| ReferenceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let table = Self::from_reader(file)?;
        info!(
            path = %path.display(),
            rows = table.rows,
            brands = table.canonical(Field::Brand).len(),
            "Reference table loaded"
        );
        Ok(table)
    }

    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, ReferenceError> {
        let mut csv = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut table = Self::default();
        for (index, row) in csv.deserialize::<ReferenceRow>().enumerate() {
            // header is line 1
            table.add_row(index + 2, row?)?;
        }

        if table.rows == 0 {
            return Err(ReferenceError::Empty);
        }
        Ok(table)
    }

    fn add_row(&mut self, line: usize, row: ReferenceRow) -> Result<(), ReferenceError> {
        for (field, value) in [
            (Field::Brand, &row.brand),
            (Field::Model, &row.model),
            (Field::Country, &row.country),
        ] {
            if value.is_empty() {
                return Err(ReferenceError::MissingValue { line, field });
            }
        }

        index_aliases(&mut self.brands, Field::Brand, &row.brand, &row.brand_aliases, field_key)?;
        index_aliases(
            self.models.entry(row.brand.clone()).or_default(),
            Field::Model,
            &row.model,
            &row.model_aliases,
            field_key,
        )?;
        for spelling in spellings(&row.model, &row.model_aliases) {
            self.model_owners
                .entry(field_key(spelling))
                .or_default()
                .insert((row.brand.clone(), row.model.clone()));
        }

        if row.country == ANY_COUNTRY {
            self.any_country.insert((row.brand, row.model));
        } else {
            index_aliases(
                &mut self.countries,
                Field::Country,
                &row.country,
                &row.country_aliases,
                country_key,
            )?;
            self.combinations.insert((row.brand, row.model, row.country));
        }

        self.rows += 1;
        Ok(())
    }

    /// Map raw spellings to a jointly valid canonical triple. An empty or
    /// unknown brand is taken from the model when only one brand carries it.
    pub fn resolve(
        &self,
        raw_brand: &str,
        raw_model: &str,
        raw_country: &str,
    ) -> Result<NormalizedTriple, ResolveError> {
        let brand_key = field_key(raw_brand);
        let brand = match self.brands.get(&brand_key) {
            Some(brand) => brand,
            None => {
                let inferred = self
                    .sole_owner(&field_key(raw_model))
                    .map(|(brand, _)| brand)
                    .ok_or_else(|| ResolveError::UnknownBrand(raw_brand.to_string()))?;
                debug!(raw_brand, raw_model, brand = %inferred, "Brand inferred from model");
                inferred
            }
        };

        let model = self
            .resolve_model(raw_model, &brand_key, brand)
            .ok_or_else(|| ResolveError::UnknownModel(raw_model.to_string()))?;

        let country = self
            .countries
            .get(&country_key(raw_country))
            .ok_or_else(|| ResolveError::UnknownCountry(raw_country.to_string()))?;

        let known_combination = self.any_country.contains(&(brand.clone(), model.clone()))
            || self
                .combinations
                .contains(&(brand.clone(), model.clone(), country.clone()));

        if !known_combination {
            return Err(ResolveError::NotFound {
                brand: brand.clone(),
                model: model.clone(),
                country: country.clone(),
            });
        }

        Ok(NormalizedTriple {
            brand: brand.clone(),
            model: model.clone(),
            country: country.clone(),
        })
    }

    /// The brand's own aliases first, with and without a brand prefix. A
    /// model that only another brand carries still resolves, so the
    /// combination check can report it as not found.
    fn resolve_model(&self, raw_model: &str, raw_brand_key: &str, brand: &str) -> Option<&String> {
        let model_key = field_key(raw_model);
        if let Some(scoped) = self.models.get(brand) {
            if let Some(model) = scoped.get(&model_key) {
                return Some(model);
            }
            let stripped = [raw_brand_key.to_string(), field_key(brand)]
                .iter()
                .filter_map(|prefix| strip_brand_prefix(&model_key, prefix))
                .find_map(|rest| scoped.get(rest));
            if stripped.is_some() {
                return stripped;
            }
        }
        self.sole_owner(&model_key).map(|(_, model)| model)
    }

    fn sole_owner(&self, model_key: &str) -> Option<&(String, String)> {
        match self.model_owners.get(model_key) {
            Some(owners) if owners.len() == 1 => owners.iter().next(),
            _ => None,
        }
    }

    /// Canonical spellings known for a field, sorted
    pub fn canonical(&self, field: Field) -> BTreeSet<&str> {
        match field {
            Field::Brand => self.brands.values().map(String::as_str).collect(),
            Field::Model => self
                .models
                .values()
                .flat_map(HashMap::values)
                .map(String::as_str)
                .collect(),
            Field::Country => self.countries.values().map(String::as_str).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }
}

/// The canonical spelling followed by its `|`-separated aliases
fn spellings<'a>(canonical: &'a str, aliases: &'a str) -> impl Iterator<Item = &'a str> {
    std::iter::once(canonical).chain(
        aliases
            .split('|')
            .map(str::trim)
            .filter(|alias| !alias.is_empty()),
    )
}

fn index_aliases(
    index: &mut HashMap<String, String>,
    field: Field,
    canonical: &str,
    aliases: &str,
    key: fn(&str) -> String,
) -> Result<(), ReferenceError> {
    for spelling in spellings(canonical, aliases) {
        let alias_key = key(spelling);
        match index.get(&alias_key) {
            Some(existing) if existing != canonical => {
                return Err(ReferenceError::AmbiguousAlias {
                    field,
                    alias: spelling.to_string(),
                    first: existing.clone(),
                    second: canonical.to_string(),
                });
            }
            Some(_) => {}
            None => {
                index.insert(alias_key, canonical.to_string());
            }
        }
    }
    Ok(())
}
