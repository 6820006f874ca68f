//! Pipeline stages for statement retrieval and extraction.
//!
//! Each submodule implements exactly one stage. Keeping stages separate
//! makes each independently testable and lets us swap implementations
//! (e.g. a different OCR backend) without touching other stages.
//!
//! ## Data Flow
//!
//! ```text
//! cache ──▶ download ──▶ rasterize ──▶ extract ──▶ aggregate
//! (probe)   (gap fill)   (magick)      (ocr+rules)  (csv)
//! ```
//!
//! 1. [`cache`]     — statement periods, the filename convention, and the
//!    local-cache probe that lets a fully cached window skip the session
//!    entirely
//! 2. [`download`]  — the single-session row scan that fills cache gaps;
//!    the only stage that drives the browser
//! 3. [`rasterize`] — idempotent first-page rendering via the external
//!    rasterizer capability
//! 4. [`extract`]   — OCR plus the label-anchored rule table, with
//!    per-field null tolerance
//! 5. [`aggregate`] — filename-dated billing records and CSV serialization

pub mod aggregate;
pub mod cache;
pub mod download;
pub mod extract;
pub mod rasterize;
