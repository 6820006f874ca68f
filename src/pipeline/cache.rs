//! Statement periods, the filename convention, and the local document cache.
//!
//! ## The filename convention
//!
//! The portal downloads statements as `<accountId>custbill<MMDDYYYY>.pdf`
//! with a zero-padded 8-digit date. The exact statement *day* is not
//! knowable from a requested period alone (billing cycles drift by a few
//! days), so cache probes match by pattern — any day within the requested
//! month/year counts — while post-download confirmation uses the exact
//! filename derived from the row's embedded timestamp.
//!
//! Pattern matching is also tolerant of account-identifier length, so a
//! cache populated under a different account prefix convention still
//! resolves.

use crate::error::HarvestError;
use chrono::{Datelike, Months, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One monthly billing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct StatementPeriod {
    pub month: u32,
    pub year: i32,
}

impl StatementPeriod {
    pub fn new(month: u32, year: i32) -> Self {
        Self { month, year }
    }

    /// The last `n` monthly periods counting back from `today` (inclusive).
    pub fn look_back(today: NaiveDate, n: u32) -> Vec<StatementPeriod> {
        (0..n)
            .filter_map(|i| today.checked_sub_months(Months::new(i)))
            .map(|d| StatementPeriod {
                month: d.month(),
                year: d.year(),
            })
            .collect()
    }

    /// Filename pattern for this period: any account-identifier length,
    /// any day of month.
    pub fn file_pattern(&self) -> Regex {
        // The convention is digits-only on both sides of the literal date,
        // so this stays unambiguous.
        Regex::new(&format!(
            r"^\d+custbill{:02}\d{{2}}{}\.pdf$",
            self.month, self.year
        ))
        .expect("period pattern is always valid")
    }
}

impl From<NaiveDate> for StatementPeriod {
    fn from(d: NaiveDate) -> Self {
        Self {
            month: d.month(),
            year: d.year(),
        }
    }
}

/// A statement resolved to a file in the local cache.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDocument {
    pub file_name: String,
    pub path: PathBuf,
    pub period: StatementPeriod,
}

impl LocalDocument {
    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// Exact cache filename for a statement dated `date`.
pub fn expected_file_name(account_id: &str, date: NaiveDate) -> String {
    format!(
        "{}custbill{:02}{:02}{}.pdf",
        account_id,
        date.month(),
        date.day(),
        date.year()
    )
}

static RE_STATEMENT_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+custbill(\d{2})(\d{2})(\d{4})\.pdf$").unwrap());

/// Parse the calendar date embedded in a cache filename.
///
/// Strict: exactly eight digits between `custbill` and `.pdf`, and the
/// digits must form a real MMDDYYYY date. Returns `None` otherwise.
pub fn parse_statement_date(file_name: &str) -> Option<NaiveDate> {
    let caps = RE_STATEMENT_DATE.captures(file_name)?;
    let month: u32 = caps[1].parse().ok()?;
    let day: u32 = caps[2].parse().ok()?;
    let year: i32 = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Find the cached file for `period`, if any.
///
/// When more than one file matches the period's tolerance window the first
/// match in lexicographic order wins and the collision is logged — two real
/// statements in one calendar month cannot be told apart by the convention,
/// only flagged.
pub fn probe_period(
    dir: &Path,
    period: StatementPeriod,
) -> Result<Option<String>, HarvestError> {
    let pattern = period.file_pattern();
    let mut matches: Vec<String> = Vec::new();

    let entries = std::fs::read_dir(dir).map_err(|e| HarvestError::CacheScanFailed {
        dir: dir.to_path_buf(),
        source: e,
    })?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if pattern.is_match(&name) {
            matches.push(name);
        }
    }
    matches.sort_unstable();

    if matches.len() > 1 {
        warn!(
            month = period.month,
            year = period.year,
            candidates = ?matches,
            "multiple cached statements match one period; using the first"
        );
    }
    Ok(matches.into_iter().next())
}

/// Resolve every period against the cache, all-or-nothing.
///
/// Returns `Some(documents)` only when **every** period has a cached file —
/// the short-circuit that lets a fully cached window skip the session
/// entirely. Missing directory counts as an empty cache, not an error.
pub fn probe_all(
    dir: &Path,
    periods: &[StatementPeriod],
) -> Result<Option<Vec<LocalDocument>>, HarvestError> {
    if !dir.is_dir() {
        debug!(dir = %dir.display(), "cache directory absent");
        return Ok(None);
    }

    let mut documents = Vec::with_capacity(periods.len());
    for &period in periods {
        match probe_period(dir, period)? {
            Some(file_name) => {
                let path = dir.join(&file_name);
                documents.push(LocalDocument {
                    file_name,
                    path,
                    period,
                });
            }
            None => {
                debug!(
                    month = period.month,
                    year = period.year,
                    "cache miss for period"
                );
                return Ok(None);
            }
        }
    }
    Ok(Some(documents))
}

/// Count the periods that have no cached file.
pub fn count_missing(dir: &Path, periods: &[StatementPeriod]) -> Result<usize, HarvestError> {
    if !dir.is_dir() {
        return Ok(periods.len());
    }
    let mut missing = 0;
    for &period in periods {
        if probe_period(dir, period)?.is_none() {
            missing += 1;
        }
    }
    Ok(missing)
}

/// Readiness poll: wait for `file_name` to appear under `dir`.
///
/// The portal exposes no download-completion signal, so the file's
/// existence *is* the readiness predicate. Returns `true` as soon as the
/// file lands, `false` once `deadline` elapses.
pub async fn wait_for_file(
    dir: &Path,
    file_name: &str,
    poll: Duration,
    deadline: Duration,
) -> bool {
    let target = dir.join(file_name);
    let started = Instant::now();
    loop {
        if target.exists() {
            return true;
        }
        if started.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}
