//! First-page rasterization of cached statements.
//!
//! One image per document, filename-keyed: `<name>.pdf` renders to
//! `images/<name>.png`, and an image that already exists is never
//! recomputed. The cache key is the name, not the content — statements are
//! immutable once issued, so a stale render cannot happen in practice.
//!
//! Failures here are per-document: a statement that will not rasterize is
//! excluded from the output and its siblings proceed untouched.

use crate::capability::PdfRasterizer;
use crate::error::DocumentError;
use crate::pipeline::cache::{LocalDocument, StatementPeriod};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A statement's first page rendered to a cached image.
#[derive(Debug, Clone)]
pub struct RasterImage {
    /// The source document's cache filename.
    pub file_name: String,
    pub image_path: PathBuf,
    pub period: StatementPeriod,
}

/// Image path for a document, by convention: same stem, `.png`, under
/// `images_dir`.
pub fn image_path_for(document: &LocalDocument, images_dir: &Path) -> PathBuf {
    let stem = document
        .file_name
        .strip_suffix(".pdf")
        .unwrap_or(&document.file_name);
    images_dir.join(format!("{stem}.png"))
}

/// Rasterize page one of `document` into the images cache, idempotently.
pub async fn to_raster_image(
    document: &LocalDocument,
    rasterizer: &dyn PdfRasterizer,
    images_dir: &Path,
    density: u32,
) -> Result<RasterImage, DocumentError> {
    let image_path = image_path_for(document, images_dir);

    if image_path.exists() {
        debug!(image = %image_path.display(), "raster image cached; skipping");
        return Ok(RasterImage {
            file_name: document.file_name.clone(),
            image_path,
            period: document.period,
        });
    }

    if !document.path.exists() {
        return Err(DocumentError::MissingSource {
            file: document.file_name.clone(),
        });
    }

    tokio::fs::create_dir_all(images_dir)
        .await
        .map_err(|e| DocumentError::RasterFailed {
            file: document.file_name.clone(),
            detail: format!("cannot create images directory: {e}"),
        })?;

    rasterizer
        .rasterize_first_page(&document.path, &image_path, density)
        .await
        .map_err(|detail| DocumentError::RasterFailed {
            file: document.file_name.clone(),
            detail,
        })?;

    info!(image = %image_path.display(), "rasterized first page");
    Ok(RasterImage {
        file_name: document.file_name.clone(),
        image_path,
        period: document.period,
    })
}
