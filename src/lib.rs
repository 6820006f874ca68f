//! # billfetch
//!
//! Retrieve monthly utility statements from an authenticated web portal and
//! extract their charges into dated CSV billing records.
//!
//! ## Why this crate?
//!
//! Utility portals expose statements as click-to-download PDFs behind a
//! login, with no API. This crate owns the part that is actually hard: a
//! bounded-retry authentication state machine with a persisted session
//! snapshot, an idempotent cache-aware download coordinator, and a
//! per-document OCR extraction stage where one bad statement never takes
//! the run down. Browser automation and text recognition themselves are
//! capabilities the pipeline drives through traits — bring whichever
//! backend you run.
//!
//! ## Pipeline Overview
//!
//! ```text
//! periods (look-back window)
//!  │
//!  ├─ 1. Cache      probe <accountId>custbill<MMDDYYYY>.pdf patterns;
//!  │                fully cached window ⇒ no session at all
//!  ├─ 2. Session    bounded-retry login, snapshot restore/persist
//!  ├─ 3. Download   rank-ordered row scan, confirmed downloads only
//!  ├─ 4. Rasterize  page 1 → images/<name>.png (idempotent, parallel)
//!  ├─ 5. Extract    OCR + label-anchored rules, per-field null tolerance
//!  └─ 6. Aggregate  dated records, nullable totals, CSV
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use billfetch::{harvest_to_file, HarvestConfig, MagickRasterizer, TesseractOcr};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HarvestConfig::builder()
//!         .portal_url("https://portal.example/billing")
//!         .account_id("6491")
//!         .last_n_months(12)
//!         .download_dir("/home/me/Downloads")
//!         .build()?;
//!
//!     // No web session wired in: succeeds when the window is fully cached,
//!     // otherwise reports how many periods are missing.
//!     let output = harvest_to_file(
//!         None,
//!         &MagickRasterizer,
//!         &TesseractOcr,
//!         &config,
//!         "billings.csv".as_ref(),
//!     )
//!     .await?;
//!     eprintln!("{} records, {} failed documents",
//!         output.stats.records, output.stats.documents_failed);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `billfetch` binary (clap + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod capability;
pub mod config;
pub mod error;
pub mod harvest;
pub mod output;
pub mod pipeline;
pub mod session;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use capability::{Cookie, MagickRasterizer, OcrEngine, PdfRasterizer, TesseractOcr, WebSession};
pub use config::{
    default_rules, ChargeField, Credentials, ExtractionRule, HarvestConfig, HarvestConfigBuilder,
    PortalSelectors, MAX_LOOK_BACK_MONTHS,
};
pub use error::{DocumentError, HarvestError, WebError};
pub use harvest::{harvest, harvest_from, harvest_to_file};
pub use output::{BillingRecord, DocumentResult, HarvestOutput, HarvestStats};
pub use pipeline::cache::{LocalDocument, StatementPeriod};
pub use pipeline::extract::{ExtractedFields, FieldExtractor};
pub use session::{AttemptOutcome, Directive, LoginPolicy, SessionManager, SessionState};
