//! Gap-fill download coordination against the portal's billing history.
//!
//! ## Two cache checks, on purpose
//!
//! The coordinator probes the cache twice. The first probe works off the
//! *requested periods* and short-circuits the whole session when the window
//! is fully cached — repeated runs against a warm cache perform zero
//! browser activity. The second check happens per row during the scan,
//! against the *exact* filename derived from the row's embedded timestamp:
//! row rank and requested period do not align 1:1, so a document can
//! already be on disk by the time its row comes up.
//!
//! ## Failure isolation
//!
//! Authentication failure is fatal. Everything below it is not: a row that
//! fails to enumerate is skipped, a link that fails to click is skipped,
//! and a download that never lands is retried once and then surfaced as a
//! warning — the scan always runs to the end of the requested window and
//! returns whatever it confirmed.

use crate::capability::{ElementHandle, WebSession};
use crate::config::HarvestConfig;
use crate::error::{HarvestError, WebError};
use crate::pipeline::cache::{
    self, expected_file_name, LocalDocument, StatementPeriod,
};
use crate::session::SessionManager;
use chrono::{DateTime, NaiveDate};
use tracing::{debug, info, warn};

/// Everything the coordinator learned while resolving the window.
#[derive(Debug, Default)]
pub struct ResolvedDocuments {
    /// Documents in resolution order: cache hits first when the
    /// short-circuit path is taken, otherwise row-scan order.
    pub documents: Vec<LocalDocument>,
    /// Number of periods requested.
    pub requested: usize,
    /// Documents that were already cached.
    pub cache_hits: usize,
    /// Documents freshly downloaded and confirmed on disk.
    pub downloaded: usize,
    /// Clicked downloads that never appeared, after one retry.
    pub unconfirmed: usize,
    /// Human-readable notes on partial results (unconfirmed downloads,
    /// skipped rows with errors).
    pub warnings: Vec<String>,
    /// Whether a browser session was opened at all.
    pub session_used: bool,
}

/// Resolves the requested statement window against the local cache, opening
/// a session only for the gaps.
pub struct DownloadCoordinator<'a> {
    config: &'a HarvestConfig,
}

impl<'a> DownloadCoordinator<'a> {
    pub fn new(config: &'a HarvestConfig) -> Self {
        Self { config }
    }

    /// Resolve the last `last_n_months` statements to local files.
    ///
    /// `session` may be `None`; it is only touched when the cache probe
    /// finds a gap, and its absence at that point is the fatal
    /// [`HarvestError::SessionRequired`].
    pub async fn resolve_documents(
        &self,
        today: NaiveDate,
        session: Option<&dyn WebSession>,
    ) -> Result<ResolvedDocuments, HarvestError> {
        let periods = StatementPeriod::look_back(today, self.config.last_n_months);
        let dir = &self.config.download_dir;

        if let Some(documents) = cache::probe_all(dir, &periods)? {
            info!(
                periods = periods.len(),
                "all statements cached; skipping session"
            );
            return Ok(ResolvedDocuments {
                cache_hits: documents.len(),
                requested: periods.len(),
                documents,
                ..Default::default()
            });
        }

        let session = match session {
            Some(s) => s,
            None => {
                let missing = cache::count_missing(dir, &periods)?;
                return Err(HarvestError::SessionRequired {
                    missing,
                    requested: periods.len(),
                });
            }
        };

        let mut manager = SessionManager::new(self.config);
        manager.ensure_authenticated(session).await?;

        self.scan_rows(session, periods.len()).await
    }

    /// Walk the history rows in rank order (row 1 = most recent) up to the
    /// requested limit, resolving each view link to a confirmed local file.
    async fn scan_rows(
        &self,
        session: &dyn WebSession,
        requested: usize,
    ) -> Result<ResolvedDocuments, HarvestError> {
        let sel = &self.config.selectors;
        let mut out = ResolvedDocuments {
            requested,
            session_used: true,
            ..Default::default()
        };

        for idx in 1..=requested {
            let row_sel = sel.bill_row(idx);
            match session.is_present(&row_sel).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(row = idx, "no history row at this rank; skipping");
                    continue;
                }
                Err(e) => {
                    warn!(row = idx, "row lookup failed, skipping: {e}");
                    out.warnings
                        .push(format!("history row {idx} could not be inspected: {e}"));
                    continue;
                }
            }

            let link_sel = format!("{row_sel} {}", sel.view_link);
            let links = match session.find_all(&link_sel).await {
                Ok(links) => links,
                Err(e) => {
                    warn!(row = idx, "link enumeration failed, skipping row: {e}");
                    out.warnings
                        .push(format!("history row {idx} link enumeration failed: {e}"));
                    continue;
                }
            };
            if links.is_empty() {
                debug!(row = idx, "row carries no view link; skipping");
                continue;
            }

            for link in &links {
                if let Err(e) = self.resolve_link(session, link, &mut out).await {
                    debug!(row = idx, "skipping link: {e}");
                }
            }
        }

        info!(
            resolved = out.documents.len(),
            cache_hits = out.cache_hits,
            downloaded = out.downloaded,
            unconfirmed = out.unconfirmed,
            "row scan complete"
        );
        Ok(out)
    }

    /// Resolve one view link: recover the statement date from its embedded
    /// timestamp, check the cache, and download-and-confirm if needed.
    async fn resolve_link(
        &self,
        session: &dyn WebSession,
        link: &ElementHandle,
        out: &mut ResolvedDocuments,
    ) -> Result<(), WebError> {
        let sel = &self.config.selectors;
        let dir = &self.config.download_dir;

        let raw = session
            .attr(link, &sel.bill_date_attr)
            .await?
            .ok_or_else(|| WebError::NotFound {
                selector: sel.bill_date_attr.clone(),
            })?;
        let millis: i64 = raw.trim().parse().map_err(|_| {
            WebError::Backend(format!("'{}' attribute is not a timestamp: {raw}", sel.bill_date_attr))
        })?;
        let date = DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| WebError::Backend(format!("timestamp out of range: {millis}")))?
            .date_naive();

        let file_name = expected_file_name(&self.config.account_id, date);

        // One LocalDocument per statement even when rows repeat a link.
        if out.documents.iter().any(|d| d.file_name == file_name) {
            debug!(file = %file_name, "statement already resolved this run");
            return Ok(());
        }

        if dir.join(&file_name).exists() {
            info!(file = %file_name, "already cached; skipping download");
            out.cache_hits += 1;
            push_document(out, dir, file_name, date);
            return Ok(());
        }

        // Click, then poll the cache for the expected file. The first miss
        // gets one more click — downloads do occasionally stall — before
        // the gap is surfaced as a warning rather than silently dropped.
        for attempt in 1..=2u32 {
            session.click_element(link).await?;
            if cache::wait_for_file(
                dir,
                &file_name,
                self.config.download_poll,
                self.config.download_deadline,
            )
            .await
            {
                info!(file = %file_name, "download confirmed");
                out.downloaded += 1;
                push_document(out, dir, file_name, date);
                return Ok(());
            }
            warn!(file = %file_name, attempt, "download not confirmed");
        }

        out.unconfirmed += 1;
        out.warnings.push(format!(
            "download of {file_name} was never confirmed on disk; statement omitted"
        ));
        Ok(())
    }
}

fn push_document(
    out: &mut ResolvedDocuments,
    dir: &std::path::Path,
    file_name: String,
    date: NaiveDate,
) {
    let path = dir.join(&file_name);
    out.documents.push(LocalDocument {
        path,
        period: date.into(),
        file_name,
    });
}
