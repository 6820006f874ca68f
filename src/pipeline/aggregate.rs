//! Aggregation: filename-dated billing records and CSV serialization.
//!
//! ## The nullable total
//!
//! `total = delivery + generation`, but either input can be null when OCR
//! missed a line. Rather than letting a non-number propagate silently into
//! the output, the total is an explicit `Option`: present only when both
//! inputs are, rendered as an empty cell otherwise. Gas never participates
//! in the total — it is reported, not summed.

use crate::error::{DocumentError, HarvestError};
use crate::output::{BillingRecord, DocumentResult};
use crate::pipeline::cache::parse_statement_date;
use std::path::Path;
use tracing::{info, warn};

/// Fixed output column order.
pub const OUTPUT_HEADER: [&str; 5] = [
    "Date",
    "PG&E Electric Delivery",
    "San Jose Clean Energy",
    "Energy Charges",
    "Gas Charges",
];

/// Fold per-document results into billing records, in input order.
///
/// Documents that already failed upstream are passed over. A filename that
/// does not parse to a date marks that document's slot with
/// [`DocumentError::BadFileName`] — fatal for the record, isolated from
/// siblings. Records are *not* deduplicated across periods that map to the
/// same calendar month.
pub fn aggregate(results: &mut [DocumentResult]) -> Vec<BillingRecord> {
    let mut records = Vec::with_capacity(results.len());

    for result in results.iter_mut() {
        if result.error.is_some() {
            continue;
        }
        let Some(fields) = result.fields.as_ref() else {
            continue;
        };

        let Some(date) = parse_statement_date(&result.file_name) else {
            warn!(file = %result.file_name, "filename does not encode a date");
            result.error = Some(DocumentError::BadFileName {
                file: result.file_name.clone(),
            });
            continue;
        };

        let total = match (fields.delivery, fields.generation) {
            (Some(d), Some(g)) => Some(d + g),
            _ => None,
        };

        records.push(BillingRecord {
            period: date.into(),
            date,
            delivery: fields.delivery,
            generation: fields.generation,
            gas: fields.gas,
            total,
        });
    }

    info!(records = records.len(), "aggregation complete");
    records
}

fn render_amount(v: Option<f64>) -> String {
    match v {
        Some(v) => format!("{v:.2}"),
        None => String::new(),
    }
}

/// Serialize records to CSV text with the fixed header and column order.
pub fn to_csv_string(records: &[BillingRecord]) -> Result<String, HarvestError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(OUTPUT_HEADER)
        .map_err(|e| HarvestError::Internal(format!("csv header: {e}")))?;

    for record in records {
        writer
            .write_record([
                record.date.format("%Y-%m-%d").to_string(),
                render_amount(record.delivery),
                render_amount(record.generation),
                render_amount(record.total),
                render_amount(record.gas),
            ])
            .map_err(|e| HarvestError::Internal(format!("csv row: {e}")))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| HarvestError::Internal(format!("csv flush: {e}")))?;
    String::from_utf8(bytes).map_err(|e| HarvestError::Internal(format!("csv utf-8: {e}")))
}

/// Write the record set to `path` atomically (temp file + rename).
pub async fn write_csv(records: &[BillingRecord], path: &Path) -> Result<(), HarvestError> {
    let csv = to_csv_string(records)?;

    let io_err = |e: std::io::Error| HarvestError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
    }

    let tmp = path.with_extension("csv.tmp");
    tokio::fs::write(&tmp, &csv).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;

    info!(path = %path.display(), rows = records.len(), "wrote billing records");
    Ok(())
}
