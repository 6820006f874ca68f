//! Run results: per-document slots, the final records, and run statistics.

use crate::error::DocumentError;
use crate::pipeline::cache::StatementPeriod;
use crate::pipeline::extract::ExtractedFields;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The result slot for one statement document, keyed by its cache filename.
///
/// Mirrors the fatal/non-fatal split: a failed document carries its
/// [`DocumentError`] here instead of aborting the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentResult {
    pub file_name: String,
    /// Raster image path, when conversion got that far.
    pub image_path: Option<PathBuf>,
    /// Extracted fields, when OCR succeeded.
    pub fields: Option<ExtractedFields>,
    /// The isolated failure, if any stage of this document failed.
    pub error: Option<DocumentError>,
    pub duration_ms: u64,
}

impl DocumentResult {
    pub fn failed(file_name: String, error: DocumentError, duration_ms: u64) -> Self {
        Self {
            file_name,
            image_path: None,
            fields: None,
            error: Some(error),
            duration_ms,
        }
    }
}

/// One aggregated billing record: the statement's calendar date (parsed
/// from its filename, not its content), the three charge fields, and the
/// derived total.
///
/// `total` is defined only when both delivery and generation are present;
/// it renders as an empty CSV cell otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRecord {
    pub period: StatementPeriod,
    pub date: NaiveDate,
    pub delivery: Option<f64>,
    pub generation: Option<f64>,
    pub gas: Option<f64>,
    pub total: Option<f64>,
}

/// Aggregate counters for one harvest run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestStats {
    /// Periods in the requested look-back window.
    pub requested_periods: usize,
    /// Documents resolved straight from the local cache.
    pub cache_hits: usize,
    /// Documents freshly downloaded and confirmed.
    pub downloaded: usize,
    /// Clicked downloads that never landed (surfaced as warnings).
    pub unconfirmed_downloads: usize,
    /// Documents entering the convert+extract stage.
    pub documents_resolved: usize,
    /// Documents with extracted fields.
    pub documents_extracted: usize,
    /// Documents lost to isolated per-document failures.
    pub documents_failed: usize,
    /// Rows in the final record set.
    pub records: usize,
    pub resolve_duration_ms: u64,
    pub extract_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// Everything a harvest run produced.
#[derive(Debug, Serialize)]
pub struct HarvestOutput {
    /// Records in aggregation order (not sorted by date).
    pub records: Vec<BillingRecord>,
    /// Per-document result slots, in resolution order.
    pub documents: Vec<DocumentResult>,
    /// Partial-result notes (unconfirmed downloads, skipped rows).
    pub warnings: Vec<String>,
    pub stats: HarvestStats,
}
