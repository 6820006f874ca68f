//! End-to-end pipeline tests against scripted capability backends.
//!
//! No browser, no ImageMagick, no tesseract: the web session is a scripted
//! portal that serves history rows and "downloads" files into the cache
//! directory, and the rasterizer/OCR pair produces a canned bill page.

use async_trait::async_trait;
use billfetch::capability::StorageSnapshot;
use billfetch::pipeline::cache::expected_file_name;
use billfetch::{
    harvest_from, Cookie, HarvestConfig, HarvestError, OcrEngine, PdfRasterizer, WebError,
    WebSession,
};
use chrono::{Months, NaiveDate};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const ACCOUNT: &str = "6491";

const BILL_TEXT: &str = "\
Your Account Summary\n\
Amount Due on Previous Statement $128.33\n\
Current PG&E Electric Delivery Charges $45.12\n\
San Jose Clean Energy Electric Generation Charges 30.88\n\
Current Gas Charges $12.00\n\
Total Amount Due $88.00\n";

// ── Scripted backends ────────────────────────────────────────────────────────

/// A scripted portal session. Row `i` (1-based, most recent first) carries
/// the statement date `rows[i-1]`; clicking its view link drops the expected
/// file into the cache directory.
struct ScriptedSession {
    download_dir: PathBuf,
    rows: Vec<NaiveDate>,
    /// When set, the history-expand control never appears and every login
    /// attempt times out.
    fail_login: bool,
    /// When set, clicks are accepted but no file ever lands.
    stall_downloads: bool,
    /// Rows (1-based ranks) whose presence check errors out.
    error_rows: Vec<usize>,
    calls: AtomicUsize,
    clicks: AtomicUsize,
    downloads: AtomicUsize,
}

impl ScriptedSession {
    fn new(download_dir: &Path, rows: Vec<NaiveDate>) -> Self {
        Self {
            download_dir: download_dir.to_path_buf(),
            rows,
            fail_login: false,
            stall_downloads: false,
            error_rows: Vec::new(),
            calls: AtomicUsize::new(0),
            clicks: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn clicks(&self) -> usize {
        self.clicks.load(Ordering::SeqCst)
    }

    fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    /// Extract the 1-based rank from a `...nth-of-type(N)...` selector.
    fn row_rank(selector: &str) -> Option<usize> {
        let start = selector.find("nth-of-type(")? + "nth-of-type(".len();
        let end = selector[start..].find(')')? + start;
        selector[start..end].parse().ok()
    }

    fn row_date(&self, element: &str) -> Option<NaiveDate> {
        let rank: usize = element.strip_prefix("row-")?.parse().ok()?;
        self.rows.get(rank - 1).copied()
    }
}

#[async_trait]
impl WebSession for ScriptedSession {
    async fn goto(&self, _url: &str) -> Result<(), WebError> {
        self.touch();
        Ok(())
    }

    async fn reload(&self) -> Result<(), WebError> {
        self.touch();
        Ok(())
    }

    async fn current_url(&self) -> Result<String, WebError> {
        self.touch();
        Ok("https://portal.example/my-account/billing".into())
    }

    async fn wait_visible(&self, selector: &str, timeout: Duration) -> Result<(), WebError> {
        self.touch();
        let timed_out = selector.contains("onetrust")
            || (self.fail_login && selector.contains("24month"));
        if timed_out {
            return Err(WebError::WaitTimeout {
                selector: selector.into(),
                ms: timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    async fn is_present(&self, selector: &str) -> Result<bool, WebError> {
        self.touch();
        match Self::row_rank(selector) {
            Some(rank) if self.error_rows.contains(&rank) => {
                Err(WebError::Backend(format!("stale element at row {rank}")))
            }
            Some(rank) => Ok(rank <= self.rows.len()),
            None => Ok(false),
        }
    }

    async fn click(&self, _selector: &str) -> Result<(), WebError> {
        self.touch();
        Ok(())
    }

    async fn type_text(&self, _selector: &str, _text: &str) -> Result<(), WebError> {
        self.touch();
        Ok(())
    }

    async fn wait_navigation(&self, _timeout: Duration) -> Result<(), WebError> {
        self.touch();
        Ok(())
    }

    async fn find_all(&self, selector: &str) -> Result<Vec<String>, WebError> {
        self.touch();
        match Self::row_rank(selector) {
            Some(rank) if rank <= self.rows.len() => Ok(vec![format!("row-{rank}")]),
            _ => Ok(Vec::new()),
        }
    }

    async fn attr(&self, element: &String, name: &str) -> Result<Option<String>, WebError> {
        self.touch();
        if name != "data-date" {
            return Ok(None);
        }
        Ok(self.row_date(element).map(|date| {
            let millis = date
                .and_hms_opt(12, 0, 0)
                .unwrap()
                .and_utc()
                .timestamp_millis();
            millis.to_string()
        }))
    }

    async fn click_element(&self, element: &String) -> Result<(), WebError> {
        self.touch();
        self.clicks.fetch_add(1, Ordering::SeqCst);
        if self.stall_downloads {
            return Ok(());
        }
        let date = self
            .row_date(element)
            .ok_or_else(|| WebError::Backend(format!("unknown element {element}")))?;
        let file_name = expected_file_name(ACCOUNT, date);
        std::fs::write(self.download_dir.join(&file_name), b"%PDF-1.4 scripted")
            .map_err(|e| WebError::Backend(e.to_string()))?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, WebError> {
        self.touch();
        Ok(Vec::new())
    }

    async fn set_cookies(&self, _cookies: &[Cookie]) -> Result<(), WebError> {
        self.touch();
        Ok(())
    }

    async fn local_storage(&self) -> Result<StorageSnapshot, WebError> {
        self.touch();
        Ok(StorageSnapshot::new())
    }

    async fn set_local_storage(&self, _storage: &StorageSnapshot) -> Result<(), WebError> {
        self.touch();
        Ok(())
    }
}

/// Rasterizer that writes a stub image file instead of invoking ImageMagick.
struct StubRasterizer {
    calls: AtomicUsize,
}

impl StubRasterizer {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PdfRasterizer for StubRasterizer {
    async fn rasterize_first_page(
        &self,
        pdf_path: &Path,
        image_path: &Path,
        _density: u32,
    ) -> Result<(), String> {
        if !pdf_path.exists() {
            return Err(format!("no such pdf: {}", pdf_path.display()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::fs::write(image_path, b"\x89PNG stub").map_err(|e| e.to_string())
    }
}

/// OCR engine returning the same canned bill page for every image.
struct CannedOcr;

#[async_trait]
impl OcrEngine for CannedOcr {
    async fn recognize(&self, image_path: &Path) -> Result<String, String> {
        if !image_path.exists() {
            return Err(format!("no such image: {}", image_path.display()));
        }
        Ok(BILL_TEXT.to_string())
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────────

fn test_config(dir: &Path, months: u32) -> HarvestConfig {
    HarvestConfig::builder()
        .portal_url("https://portal.example/my-account/billing")
        .account_id(ACCOUNT)
        .credentials("alice", "hunter2")
        .last_n_months(months)
        .download_dir(dir)
        .settle(Duration::ZERO)
        .retry_delay(Duration::ZERO)
        .retry_jitter(Duration::ZERO)
        .download_poll(Duration::from_millis(10))
        .download_deadline(Duration::from_millis(500))
        .build()
        .unwrap()
}

/// Statement dates for the `n` most recent months, newest first, anchored on
/// the 10th so every subtraction stays in-month.
fn statement_dates(n: u32) -> Vec<NaiveDate> {
    let newest = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
    (0..n)
        .map(|i| newest.checked_sub_months(Months::new(i)).unwrap())
        .collect()
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 15).unwrap()
}

fn seed_cache(dir: &Path, dates: &[NaiveDate]) {
    for date in dates {
        std::fs::write(dir.join(expected_file_name(ACCOUNT, *date)), b"%PDF-1.4 cached")
            .unwrap();
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fully_cached_window_performs_no_session_calls() {
    let dir = tempfile::tempdir().unwrap();
    let dates = statement_dates(3);
    seed_cache(dir.path(), &dates);

    let config = test_config(dir.path(), 3);
    let session = ScriptedSession::new(dir.path(), dates);

    let output = harvest_from(today(), Some(&session), &StubRasterizer::new(), &CannedOcr, &config)
        .await
        .unwrap();

    assert_eq!(session.calls(), 0, "warm cache must not touch the session");
    assert_eq!(output.stats.cache_hits, 3);
    assert_eq!(output.stats.downloaded, 0);
    assert_eq!(output.stats.records, 3);
    assert!(output.warnings.is_empty());
}

#[tokio::test]
async fn gap_fill_downloads_only_the_missing_statements() {
    let dir = tempfile::tempdir().unwrap();
    let dates = statement_dates(24);

    // 20 of 24 cached; ranks 3, 8, 14 and 22 are the gaps.
    let missing = [2usize, 7, 13, 21];
    let cached: Vec<NaiveDate> = dates
        .iter()
        .enumerate()
        .filter(|(i, _)| !missing.contains(i))
        .map(|(_, d)| *d)
        .collect();
    seed_cache(dir.path(), &cached);

    let config = test_config(dir.path(), 24);
    let session = ScriptedSession::new(dir.path(), dates);

    let output = harvest_from(today(), Some(&session), &StubRasterizer::new(), &CannedOcr, &config)
        .await
        .unwrap();

    assert_eq!(session.downloads(), 4, "only gaps get clicked");
    assert_eq!(output.stats.cache_hits, 20);
    assert_eq!(output.stats.downloaded, 4);
    assert_eq!(output.stats.documents_resolved, 24);
    assert_eq!(output.stats.records, 24);
    assert_eq!(output.stats.unconfirmed_downloads, 0);
}

#[tokio::test]
async fn absent_rows_are_skipped_without_failing_the_run() {
    let dir = tempfile::tempdir().unwrap();

    // Portal only exposes 2 rows for a 4-month request.
    let config = test_config(dir.path(), 4);
    let session = ScriptedSession::new(dir.path(), statement_dates(2));

    let output = harvest_from(today(), Some(&session), &StubRasterizer::new(), &CannedOcr, &config)
        .await
        .unwrap();

    assert_eq!(output.stats.requested_periods, 4);
    assert_eq!(output.stats.documents_resolved, 2);
    assert_eq!(output.stats.downloaded, 2);
    assert_eq!(output.stats.records, 2);
}

#[tokio::test]
async fn stalled_download_is_retried_once_then_surfaced_as_warning() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 1);
    config.download_deadline = Duration::from_millis(50);

    let mut session = ScriptedSession::new(dir.path(), statement_dates(1));
    session.stall_downloads = true;

    let output = harvest_from(today(), Some(&session), &StubRasterizer::new(), &CannedOcr, &config)
        .await
        .unwrap();

    assert_eq!(session.clicks(), 2, "one retry after the first miss");
    assert_eq!(output.stats.unconfirmed_downloads, 1);
    assert_eq!(output.stats.documents_resolved, 0);
    assert_eq!(output.stats.records, 0);
    assert_eq!(output.warnings.len(), 1);
    assert!(
        output.warnings[0].contains("never confirmed"),
        "got: {}",
        output.warnings[0]
    );
}

#[tokio::test]
async fn errored_row_is_skipped_with_a_warning_and_scan_continues() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 3);

    let mut session = ScriptedSession::new(dir.path(), statement_dates(3));
    session.error_rows = vec![2];

    let output = harvest_from(today(), Some(&session), &StubRasterizer::new(), &CannedOcr, &config)
        .await
        .unwrap();

    assert_eq!(output.stats.documents_resolved, 2);
    assert_eq!(output.stats.downloaded, 2);
    assert_eq!(output.stats.records, 2);
    assert_eq!(output.warnings.len(), 1);
    assert!(output.warnings[0].contains("row 2"), "got: {}", output.warnings[0]);
}

#[tokio::test]
async fn cold_cache_without_a_session_reports_the_gap() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 5);

    let err = harvest_from(today(), None, &StubRasterizer::new(), &CannedOcr, &config)
        .await
        .unwrap_err();

    match err {
        HarvestError::SessionRequired { missing, requested } => {
            assert_eq!(missing, 5);
            assert_eq!(requested, 5);
        }
        other => panic!("expected SessionRequired, got {other:?}"),
    }
}

#[tokio::test]
async fn bounded_login_retries_end_in_terminal_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 2);

    let mut session = ScriptedSession::new(dir.path(), statement_dates(2));
    session.fail_login = true;

    let err = harvest_from(today(), Some(&session), &StubRasterizer::new(), &CannedOcr, &config)
        .await
        .unwrap_err();

    match err {
        HarvestError::AuthenticationFailed { attempts, last_error } => {
            assert_eq!(attempts, 2);
            assert!(last_error.contains("24month"), "got: {last_error}");
        }
        other => panic!("expected AuthenticationFailed, got {other:?}"),
    }
    assert_eq!(session.downloads(), 0);
}

#[tokio::test]
async fn end_to_end_extraction_from_a_cached_statement() {
    let dir = tempfile::tempdir().unwrap();
    let date = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
    seed_cache(dir.path(), &[date]);

    let config = test_config(dir.path(), 1);
    let output_path = dir.path().join("billings.csv");

    // Fully cached single-period window: no session needed at all.
    let today = NaiveDate::from_ymd_opt(2025, 1, 20).unwrap();
    let rasterizer = StubRasterizer::new();

    let output = harvest_from(today, None, &rasterizer, &CannedOcr, &config)
        .await
        .unwrap();
    billfetch::pipeline::aggregate::write_csv(&output.records, &output_path)
        .await
        .unwrap();

    assert_eq!(output.records.len(), 1);
    let record = &output.records[0];
    assert_eq!(record.date, date);
    assert_eq!(record.delivery, Some(45.12));
    assert_eq!(record.generation, Some(30.88));
    assert_eq!(record.total, Some(76.00));
    assert_eq!(record.gas, Some(12.00));

    let csv = std::fs::read_to_string(&output_path).unwrap();
    let mut lines = csv.lines();
    assert_eq!(
        lines.next().unwrap(),
        "Date,PG&E Electric Delivery,San Jose Clean Energy,Energy Charges,Gas Charges"
    );
    assert_eq!(lines.next().unwrap(), "2025-01-06,45.12,30.88,76.00,12.00");
}

#[tokio::test]
async fn repeated_runs_reuse_raster_images() {
    let dir = tempfile::tempdir().unwrap();
    let dates = statement_dates(2);
    seed_cache(dir.path(), &dates);

    let config = test_config(dir.path(), 2);
    let rasterizer = StubRasterizer::new();

    harvest_from(today(), None, &rasterizer, &CannedOcr, &config)
        .await
        .unwrap();
    assert_eq!(rasterizer.calls.load(Ordering::SeqCst), 2);

    // Second run finds both images on disk and converts nothing.
    harvest_from(today(), None, &rasterizer, &CannedOcr, &config)
        .await
        .unwrap();
    assert_eq!(rasterizer.calls.load(Ordering::SeqCst), 2);
}
