//! Top-level harvest orchestration.
//!
//! ## Two concurrency regimes
//!
//! Resolution (session + download) is strictly sequential: one page, one
//! click at a time, every wait a blocking suspension point. Conversion and
//! extraction then fan out one task per resolved document with
//! `buffer_unordered` — no ordering guarantee between tasks, no shared
//! mutable state beyond each document's own result slot, and no
//! cross-task cancellation: one document's failure never cancels siblings.

use crate::capability::{OcrEngine, PdfRasterizer, WebSession};
use crate::config::HarvestConfig;
use crate::error::HarvestError;
use crate::output::{DocumentResult, HarvestOutput, HarvestStats};
use crate::pipeline::aggregate;
use crate::pipeline::cache::LocalDocument;
use crate::pipeline::download::DownloadCoordinator;
use crate::pipeline::extract::FieldExtractor;
use crate::pipeline::rasterize;
use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

/// Run the full pipeline: resolve the statement window, convert and
/// extract every document, and aggregate the records.
///
/// `session` may be `None` when the caller expects the window to be fully
/// cached; it is only consulted for cache gaps.
///
/// # Errors
/// Returns `Err(HarvestError)` only for run-fatal conditions (terminal
/// authentication failure, session required but absent). Per-document
/// problems degrade the output instead — check
/// `output.stats.documents_failed` and `output.warnings`.
pub async fn harvest(
    session: Option<&dyn WebSession>,
    rasterizer: &dyn PdfRasterizer,
    ocr: &dyn OcrEngine,
    config: &HarvestConfig,
) -> Result<HarvestOutput, HarvestError> {
    harvest_from(Utc::now().date_naive(), session, rasterizer, ocr, config).await
}

/// [`harvest`] with an explicit "today", from which the look-back window is
/// derived. Split out so the window is deterministic under test.
pub async fn harvest_from(
    today: NaiveDate,
    session: Option<&dyn WebSession>,
    rasterizer: &dyn PdfRasterizer,
    ocr: &dyn OcrEngine,
    config: &HarvestConfig,
) -> Result<HarvestOutput, HarvestError> {
    let total_start = Instant::now();
    info!(
        months = config.last_n_months,
        cache = %config.download_dir.display(),
        "starting harvest"
    );

    // ── Stage 1: resolve documents (sequential; session only on gaps) ────
    let resolve_start = Instant::now();
    let resolved = DownloadCoordinator::new(config)
        .resolve_documents(today, session)
        .await?;
    let resolve_duration_ms = resolve_start.elapsed().as_millis() as u64;
    info!(
        documents = resolved.documents.len(),
        cache_hits = resolved.cache_hits,
        downloaded = resolved.downloaded,
        session_used = resolved.session_used,
        "resolution complete"
    );

    // ── Stage 2: convert + extract fan-out ───────────────────────────────
    let extract_start = Instant::now();
    let extractor = FieldExtractor::new(&config.rules);
    let images_dir = config.images_dir();

    let mut results: Vec<DocumentResult> =
        stream::iter(resolved.documents.iter().map(|document| {
            let extractor = &extractor;
            let images_dir = &images_dir;
            async move {
                process_document(
                    document,
                    rasterizer,
                    ocr,
                    extractor,
                    images_dir,
                    config.raster_density,
                )
                .await
            }
        }))
        .buffer_unordered(config.concurrency)
        .collect()
        .await;
    let extract_duration_ms = extract_start.elapsed().as_millis() as u64;

    // Completion order is nondeterministic; restore resolution order so
    // output rows track the resolved document list.
    let order: HashMap<&str, usize> = resolved
        .documents
        .iter()
        .enumerate()
        .map(|(i, d)| (d.file_name.as_str(), i))
        .collect();
    results.sort_by_key(|r| order.get(r.file_name.as_str()).copied().unwrap_or(usize::MAX));

    // ── Stage 3: aggregate ────────────────────────────────────────────────
    let records = aggregate::aggregate(&mut results);

    let documents_failed = results.iter().filter(|r| r.error.is_some()).count();
    let documents_extracted = results
        .iter()
        .filter(|r| r.fields.is_some() && r.error.is_none())
        .count();

    let stats = HarvestStats {
        requested_periods: resolved.requested,
        cache_hits: resolved.cache_hits,
        downloaded: resolved.downloaded,
        unconfirmed_downloads: resolved.unconfirmed,
        documents_resolved: resolved.documents.len(),
        documents_extracted,
        documents_failed,
        records: records.len(),
        resolve_duration_ms,
        extract_duration_ms,
        total_duration_ms: total_start.elapsed().as_millis() as u64,
    };

    info!(
        records = stats.records,
        failed = stats.documents_failed,
        total_ms = stats.total_duration_ms,
        "harvest complete"
    );

    Ok(HarvestOutput {
        records,
        documents: results,
        warnings: resolved.warnings,
        stats,
    })
}

/// Run a harvest and write the record set to `output_path` as CSV.
pub async fn harvest_to_file(
    session: Option<&dyn WebSession>,
    rasterizer: &dyn PdfRasterizer,
    ocr: &dyn OcrEngine,
    config: &HarvestConfig,
    output_path: &Path,
) -> Result<HarvestOutput, HarvestError> {
    let output = harvest(session, rasterizer, ocr, config).await?;
    aggregate::write_csv(&output.records, output_path).await?;
    Ok(output)
}

/// One document through convert + extract. Always returns a result slot;
/// failures stay inside it.
async fn process_document(
    document: &LocalDocument,
    rasterizer: &dyn PdfRasterizer,
    ocr: &dyn OcrEngine,
    extractor: &FieldExtractor,
    images_dir: &Path,
    density: u32,
) -> DocumentResult {
    let start = Instant::now();

    let image = match rasterize::to_raster_image(document, rasterizer, images_dir, density).await
    {
        Ok(image) => image,
        Err(e) => {
            warn!(file = %document.file_name, "conversion failed: {e}");
            return DocumentResult::failed(
                document.file_name.clone(),
                e,
                start.elapsed().as_millis() as u64,
            );
        }
    };

    match extractor.extract(ocr, &image).await {
        Ok(fields) => DocumentResult {
            file_name: document.file_name.clone(),
            image_path: Some(image.image_path),
            fields: Some(fields),
            error: None,
            duration_ms: start.elapsed().as_millis() as u64,
        },
        Err(e) => {
            warn!(file = %document.file_name, "extraction failed: {e}");
            DocumentResult {
                file_name: document.file_name.clone(),
                image_path: Some(image.image_path),
                fields: None,
                error: Some(e),
                duration_ms: start.elapsed().as_millis() as u64,
            }
        }
    }
}
