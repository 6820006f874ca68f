//! Capability traits for the pipeline's external collaborators.
//!
//! The hard part of this crate is the retrieval-and-extraction pipeline,
//! not browser automation or text recognition. Those are capabilities the
//! pipeline *drives*, expressed here as object-safe async traits:
//!
//! * [`WebSession`] — one authenticated browser page. Every method is a
//!   blocking suspension point; the pipeline never holds two sessions.
//! * [`OcrEngine`] — plain text out of an image.
//! * [`PdfRasterizer`] — one page of a PDF out to an image file.
//!
//! Process-backed implementations of the latter two ([`MagickRasterizer`],
//! [`TesseractOcr`]) ship with the crate since both tools are driven as
//! external commands anyway. A `WebSession` backend is deliberately not
//! bundled — tests script one, and real deployments wire in whichever
//! automation engine they run.

use crate::error::WebError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// One browser cookie, as persisted in the session snapshot.
///
/// Opaque to the pipeline: it round-trips whatever the backend hands out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    /// Unix expiry timestamp; `None` for session cookies.
    pub expires: Option<i64>,
}

/// Opaque key-value snapshot of the page's client-side storage.
pub type StorageSnapshot = BTreeMap<String, String>;

/// An opaque handle to a located element, valid until the next navigation.
pub type ElementHandle = String;

/// A single authenticated browser page.
///
/// The pipeline drives exactly one of these at a time, sequentially —
/// concurrent tabs against the same session are unsupported by design.
/// Implementations map these calls onto whatever automation backend they
/// wrap; selectors are CSS.
#[async_trait]
pub trait WebSession: Send + Sync {
    /// Navigate to a URL and wait for the page to settle.
    async fn goto(&self, url: &str) -> Result<(), WebError>;

    /// Reload the current page.
    async fn reload(&self) -> Result<(), WebError>;

    /// The current page URL.
    async fn current_url(&self) -> Result<String, WebError>;

    /// Wait until an element is visible, up to `timeout`.
    async fn wait_visible(&self, selector: &str, timeout: Duration) -> Result<(), WebError>;

    /// Whether an element is currently present (no waiting).
    async fn is_present(&self, selector: &str) -> Result<bool, WebError>;

    /// Click the first element matching `selector`.
    async fn click(&self, selector: &str) -> Result<(), WebError>;

    /// Type `text` into the element matching `selector`.
    async fn type_text(&self, selector: &str, text: &str) -> Result<(), WebError>;

    /// Wait for an in-flight navigation to settle, up to `timeout`.
    async fn wait_navigation(&self, timeout: Duration) -> Result<(), WebError>;

    /// All elements matching `selector`, as opaque handles.
    async fn find_all(&self, selector: &str) -> Result<Vec<ElementHandle>, WebError>;

    /// Read an attribute off a previously located element.
    async fn attr(&self, element: &ElementHandle, name: &str)
        -> Result<Option<String>, WebError>;

    /// Click a previously located element.
    async fn click_element(&self, element: &ElementHandle) -> Result<(), WebError>;

    /// All cookies currently held by the session.
    async fn cookies(&self) -> Result<Vec<Cookie>, WebError>;

    /// Install cookies into the session (snapshot restore).
    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<(), WebError>;

    /// The page's client-side storage as a key-value map.
    async fn local_storage(&self) -> Result<StorageSnapshot, WebError>;

    /// Install client-side storage (snapshot restore).
    async fn set_local_storage(&self, storage: &StorageSnapshot) -> Result<(), WebError>;
}

/// Text recognition over a rasterized statement page.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Recognize plain text from the image at `image_path`.
    ///
    /// An `Err` here is an engine failure and is fatal for the document;
    /// poor recognition quality is not — downstream pattern rules tolerate
    /// noise field by field.
    async fn recognize(&self, image_path: &Path) -> Result<String, String>;
}

/// First-page rasterization of a statement PDF.
#[async_trait]
pub trait PdfRasterizer: Send + Sync {
    /// Render page one of `pdf_path` to `image_path` at `density` dpi.
    async fn rasterize_first_page(
        &self,
        pdf_path: &Path,
        image_path: &Path,
        density: u32,
    ) -> Result<(), String>;
}

// ── Process-backed implementations ──────────────────────────────────────────

/// [`PdfRasterizer`] backed by the ImageMagick `magick` CLI.
#[derive(Debug, Clone, Default)]
pub struct MagickRasterizer;

#[async_trait]
impl PdfRasterizer for MagickRasterizer {
    async fn rasterize_first_page(
        &self,
        pdf_path: &Path,
        image_path: &Path,
        density: u32,
    ) -> Result<(), String> {
        // `[0]` selects the first page; -quality 100 keeps OCR input lossless.
        let mut input = pdf_path.as_os_str().to_os_string();
        input.push("[0]");

        debug!(pdf = %pdf_path.display(), image = %image_path.display(), "invoking magick");
        let out = tokio::process::Command::new("magick")
            .arg("-density")
            .arg(density.to_string())
            .arg(&input)
            .arg("-quality")
            .arg("100")
            .arg(image_path)
            .output()
            .await
            .map_err(|e| format!("failed to spawn magick: {e}"))?;

        if !out.status.success() {
            return Err(format!(
                "magick exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(())
    }
}

/// [`OcrEngine`] backed by the `tesseract` CLI.
#[derive(Debug, Clone, Default)]
pub struct TesseractOcr;

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn recognize(&self, image_path: &Path) -> Result<String, String> {
        debug!(image = %image_path.display(), "invoking tesseract");
        let out = tokio::process::Command::new("tesseract")
            .arg(image_path)
            .arg("stdout")
            .output()
            .await
            .map_err(|e| format!("failed to spawn tesseract: {e}"))?;

        if !out.status.success() {
            return Err(format!(
                "tesseract exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        String::from_utf8(out.stdout).map_err(|e| format!("tesseract output not UTF-8: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_round_trips_through_json() {
        let cookie = Cookie {
            name: "SESSION".into(),
            value: "abc123".into(),
            domain: ".portal.example".into(),
            path: "/".into(),
            secure: true,
            http_only: true,
            expires: Some(1_900_000_000),
        };
        let json = serde_json::to_string(&cookie).unwrap();
        let back: Cookie = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cookie);
    }

    #[test]
    fn cookie_defaults_tolerate_sparse_json() {
        let back: Cookie =
            serde_json::from_str(r#"{"name":"a","value":"b","domain":"d","path":"/","expires":null}"#)
                .unwrap();
        assert!(!back.secure);
        assert!(!back.http_only);
    }
}
