// Normalized batch written out as CSV for the operator

use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::types::NormalizedRecord;

#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    request_id: &'a str,
    brand: &'a str,
    model: &'a str,
    country: &'a str,
    imei_count: u8,
    imei_1: &'a str,
    imei_2: &'a str,
    serial_number: &'a str,
    holder_name: &'a str,
    document_kind: String,
    document_number: &'a str,
}

impl<'a> From<&'a NormalizedRecord> for ExportRow<'a> {
    fn from(record: &'a NormalizedRecord) -> Self {
        Self {
            request_id: &record.request_id,
            brand: &record.canonical_brand,
            model: &record.canonical_model,
            country: &record.canonical_country,
            imei_count: record.imei_count(),
            imei_1: &record.device_imei,
            imei_2: record.secondary_imei.as_deref().unwrap_or_default(),
            serial_number: &record.serial_number,
            holder_name: &record.holder.name,
            document_kind: record.holder.document_kind.to_string(),
            document_number: &record.holder.document_number,
        }
    }
}

/// Returns the number of rows written
pub fn write_normalized_csv<'a, P, I>(path: P, records: I) -> Result<usize, csv::Error>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = &'a NormalizedRecord>,
{
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_path(path)?;
    let mut rows = 0;
    for record in records {
        writer.serialize(ExportRow::from(record))?;
        rows += 1;
    }
    writer.flush()?;

    info!(path = %path.display(), rows, "Exported normalized batch");
    Ok(rows)
}
