//! Error types for the billfetch library.
//!
//! Three distinct error types reflect three distinct failure boundaries:
//!
//! * [`HarvestError`] — **Fatal**: the run cannot proceed at all (terminal
//!   authentication failure, missing web session for an incomplete cache,
//!   output write failure). Returned as `Err(HarvestError)` from the
//!   top-level `harvest*` functions.
//!
//! * [`DocumentError`] — **Non-fatal**: a single statement failed (missing
//!   source file, rasterizer error, OCR engine error, unparseable filename)
//!   but all other statements are fine. Stored inside
//!   [`crate::output::DocumentResult`] so callers can inspect partial
//!   success rather than losing the whole run to one bad document.
//!
//! * [`WebError`] — the capability-boundary error for [`crate::capability::WebSession`]
//!   implementations. During authentication it is absorbed by the retry
//!   policy; during the row scan it causes the row or link to be skipped.
//!
//! A pattern rule that fails to match OCR text is deliberately *not* an
//! error anywhere in this taxonomy — it yields a `None` field.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the billfetch library.
///
/// Per-document failures use [`DocumentError`] and are stored in
/// [`crate::output::DocumentResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum HarvestError {
    // ── Session errors ────────────────────────────────────────────────────
    /// Every login attempt failed; the run cannot continue.
    #[error("Authentication failed after {attempts} attempts.\nLast error: {last_error}")]
    AuthenticationFailed { attempts: u32, last_error: String },

    /// The local cache is incomplete and no web session was supplied.
    #[error(
        "{missing} of {requested} statement periods are not in the local cache \
         and no web session was provided.\nDownload the missing statements into \
         the cache directory, or run with a web session backend."
    )]
    SessionRequired { missing: usize, requested: usize },

    /// Could not read or write a persisted session artifact.
    #[error("Failed to persist session snapshot '{path}': {source}")]
    SnapshotIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Cache errors ──────────────────────────────────────────────────────
    /// The documents directory could not be scanned.
    #[error("Failed to scan document cache '{dir}': {source}")]
    CacheScanFailed {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output CSV file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single statement document.
///
/// Stored alongside [`crate::output::DocumentResult`] when a document fails.
/// The overall harvest continues; the affected document is simply absent
/// from the output rows.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum DocumentError {
    /// The source PDF was not found where the cache said it should be.
    #[error("{file}: source document missing from cache")]
    MissingSource { file: String },

    /// The external rasterizer failed for this document.
    #[error("{file}: rasterization failed: {detail}")]
    RasterFailed { file: String, detail: String },

    /// The OCR engine itself failed (distinct from a pattern not matching,
    /// which yields a null field and is not an error).
    #[error("{file}: OCR failed: {detail}")]
    OcrFailed { file: String, detail: String },

    /// The filename does not carry a valid 8-digit statement date.
    #[error("{file}: filename does not encode a valid MMDDYYYY date")]
    BadFileName { file: String },
}

impl DocumentError {
    /// The cache filename of the document this error belongs to.
    pub fn file(&self) -> &str {
        match self {
            DocumentError::MissingSource { file }
            | DocumentError::RasterFailed { file, .. }
            | DocumentError::OcrFailed { file, .. }
            | DocumentError::BadFileName { file } => file,
        }
    }
}

/// Errors surfaced by [`crate::capability::WebSession`] implementations.
///
/// The pipeline never matches on the backend detail — it only distinguishes
/// "this step failed" (retry or skip) from success.
#[derive(Debug, Error)]
pub enum WebError {
    /// An awaited element did not appear within the deadline.
    #[error("timed out after {ms}ms waiting for '{selector}'")]
    WaitTimeout { selector: String, ms: u64 },

    /// An element lookup found nothing.
    #[error("element not found: '{selector}'")]
    NotFound { selector: String },

    /// Navigation to a URL failed or did not settle.
    #[error("navigation to '{url}' failed: {detail}")]
    Navigation { url: String, detail: String },

    /// Any other backend failure (connection lost, protocol error, …).
    #[error("web session backend error: {0}")]
    Backend(String),
}
