//! Configuration types for a statement harvest.
//!
//! All behaviour is controlled through [`HarvestConfig`], built via its
//! [`HarvestConfigBuilder`]. Components receive the config at construction
//! and never read ambient process state (environment variables, the clock
//! behind their back) — the CLI shim is the only place that touches the
//! environment, and it does so once, up front.
//!
//! Portal selectors and extraction rules are plain data here rather than
//! constants buried in control flow, so a new portal layout or a new bill
//! format is a config change, not a code change.

use crate::error::HarvestError;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Portal login credentials.
///
/// `Debug` is implemented by hand so passwords never leak into logs.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Which monetary field an [`ExtractionRule`] feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChargeField {
    /// Electric delivery charge.
    Delivery,
    /// Electric generation charge.
    Generation,
    /// Gas charge.
    Gas,
}

/// One field-extraction rule: a label phrase anchoring an amount of the form
/// `digits "." two digits`, optionally preceded by a currency symbol.
///
/// Rules are evaluated independently; a rule that does not match yields a
/// null field, never an error.
#[derive(Debug, Clone)]
pub struct ExtractionRule {
    pub field: ChargeField,
    /// The literal label phrase preceding the amount on the bill.
    pub label: String,
}

impl ExtractionRule {
    pub fn new(field: ChargeField, label: impl Into<String>) -> Self {
        Self {
            field,
            label: label.into(),
        }
    }
}

/// Default rule table for the PG&E residential bill layout.
pub fn default_rules() -> Vec<ExtractionRule> {
    vec![
        ExtractionRule::new(
            ChargeField::Delivery,
            "Current PG&E Electric Delivery Charges",
        ),
        ExtractionRule::new(
            ChargeField::Generation,
            "San Jose Clean Energy Electric Generation Charges",
        ),
        ExtractionRule::new(ChargeField::Gas, "Current Gas Charges"),
    ]
}

/// CSS selectors for the portal surfaces the pipeline drives.
///
/// Defaults match the PG&E customer portal; every selector is overridable
/// so the pipeline itself stays portal-agnostic.
#[derive(Debug, Clone)]
pub struct PortalSelectors {
    /// Reject button of the transient consent dialog (best-effort dismiss).
    pub consent_reject: String,
    /// Marker present when a restored session is already signed in.
    pub signed_in_marker: String,
    pub username_field: String,
    pub password_field: String,
    pub login_submit: String,
    /// Control that unlocks the full look-back window.
    pub history_expand: String,
    /// Container whose presence defines authentication success.
    pub history_table: String,
    /// Template for the Nth billed-history row; `{idx}` is 1-based rank
    /// (row 1 = most recent).
    pub bill_row_template: String,
    /// Document-view link inside a row.
    pub view_link: String,
    /// Attribute on the view link carrying the statement's millisecond
    /// epoch timestamp.
    pub bill_date_attr: String,
}

impl Default for PortalSelectors {
    fn default() -> Self {
        Self {
            consent_reject: "#onetrust-reject-all-handler".into(),
            signed_in_marker: ".pge_coc-header-siginedin_gp".into(),
            username_field: "#usernameField".into(),
            password_field: "#passwordField".into(),
            login_submit: "#home_login_submit".into(),
            history_expand: "#href-view-24month-history".into(),
            history_table: "tbody.desktop-pdpore-table.account-list-tbody.scrollTable".into(),
            bill_row_template: "tr.billed_history_panel:nth-of-type({idx})".into(),
            view_link: r#"a[title="view bill pdf"]"#.into(),
            bill_date_attr: "data-date".into(),
        }
    }
}

impl PortalSelectors {
    /// Selector for the history row at 1-based rank `idx`.
    pub fn bill_row(&self, idx: usize) -> String {
        self.bill_row_template.replace("{idx}", &idx.to_string())
    }
}

/// The portal enumerates at most two years of statements.
pub const MAX_LOOK_BACK_MONTHS: u32 = 24;

/// Configuration for a statement harvest.
///
/// Built via [`HarvestConfig::builder()`] or [`HarvestConfig::default()`].
///
/// # Example
/// ```rust
/// use billfetch::HarvestConfig;
///
/// let config = HarvestConfig::builder()
///     .portal_url("https://portal.example/billing")
///     .account_id("6491")
///     .last_n_months(12)
///     .download_dir("/home/me/Downloads")
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Portal entry URL; also the billing-history URL after login.
    pub portal_url: String,

    /// Account identifier prefixed to every statement filename.
    pub account_id: String,

    /// Login credentials. Optional: a restored session snapshot can make
    /// credential submission a no-op.
    pub credentials: Option<Credentials>,

    /// Look-back window in months. Clamped to 1..=24 — the portal exposes
    /// at most 24 months of history.
    pub last_n_months: u32,

    /// Directory the browser downloads statements into (the document cache).
    pub download_dir: PathBuf,

    /// Maximum login attempts before the run is abandoned. Default: 2.
    pub max_login_attempts: u32,

    /// Base delay between login retries. Default: 8 s. A random jitter of
    /// up to [`Self::retry_jitter`] is added by the executor so repeated
    /// runs do not hammer the portal on a fixed cadence.
    pub retry_delay: Duration,

    /// Maximum jitter added to each retry delay. Default: 2 s.
    pub retry_jitter: Duration,

    /// Settling pause after navigations where the portal exposes no
    /// readiness signal. A known approximation, kept deliberately short.
    pub settle: Duration,

    /// Deadline for the consent dialog to appear; absence is not an error.
    pub consent_timeout: Duration,

    /// Deadline for the history-expand control after login.
    pub history_timeout: Duration,

    /// Deadline for a post-login navigation to settle. Default: 30 s.
    pub nav_timeout: Duration,

    /// Polling interval while waiting for a clicked download to land.
    pub download_poll: Duration,

    /// Deadline for a clicked download to appear in the cache directory.
    /// Default: 8 s. Replaces the fixed post-click sleep — the file's
    /// existence is the readiness predicate.
    pub download_deadline: Duration,

    /// Number of concurrent convert+extract tasks. Default: 4.
    ///
    /// Rasterization and OCR are external-process bound; the session and
    /// download stage stays strictly sequential regardless of this value.
    pub concurrency: usize,

    /// Rasterization density passed to the external converter. Default: 150.
    ///
    /// 150 dpi keeps the first page sharp enough for OCR of 8-point bill
    /// text without producing multi-megabyte images.
    pub raster_density: u32,

    /// Field extraction rule table. Default: [`default_rules`].
    pub rules: Vec<ExtractionRule>,

    /// Portal selectors. Default: PG&E layout.
    pub selectors: PortalSelectors,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            portal_url: String::new(),
            account_id: String::new(),
            credentials: None,
            last_n_months: MAX_LOOK_BACK_MONTHS,
            download_dir: PathBuf::new(),
            max_login_attempts: 2,
            retry_delay: Duration::from_secs(8),
            retry_jitter: Duration::from_secs(2),
            settle: Duration::from_secs(2),
            consent_timeout: Duration::from_secs(2),
            history_timeout: Duration::from_secs(6),
            nav_timeout: Duration::from_secs(30),
            download_poll: Duration::from_millis(500),
            download_deadline: Duration::from_secs(8),
            concurrency: 4,
            raster_density: 150,
            rules: default_rules(),
            selectors: PortalSelectors::default(),
        }
    }
}

impl HarvestConfig {
    /// Create a new builder for `HarvestConfig`.
    pub fn builder() -> HarvestConfigBuilder {
        HarvestConfigBuilder {
            config: Self::default(),
        }
    }

    /// Images directory, derived by convention next to the document cache.
    pub fn images_dir(&self) -> PathBuf {
        self.download_dir.join("images")
    }

    /// Session-snapshot directory, derived by convention.
    pub fn state_dir(&self) -> PathBuf {
        self.download_dir.join(".billfetch")
    }
}

/// Builder for [`HarvestConfig`].
#[derive(Debug)]
pub struct HarvestConfigBuilder {
    config: HarvestConfig,
}

impl HarvestConfigBuilder {
    pub fn portal_url(mut self, url: impl Into<String>) -> Self {
        self.config.portal_url = url.into();
        self
    }

    pub fn account_id(mut self, id: impl Into<String>) -> Self {
        self.config.account_id = id.into();
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn last_n_months(mut self, n: u32) -> Self {
        self.config.last_n_months = n.clamp(1, MAX_LOOK_BACK_MONTHS);
        self
    }

    pub fn download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.download_dir = dir.into();
        self
    }

    pub fn max_login_attempts(mut self, n: u32) -> Self {
        self.config.max_login_attempts = n.max(1);
        self
    }

    pub fn retry_delay(mut self, d: Duration) -> Self {
        self.config.retry_delay = d;
        self
    }

    pub fn retry_jitter(mut self, d: Duration) -> Self {
        self.config.retry_jitter = d;
        self
    }

    pub fn settle(mut self, d: Duration) -> Self {
        self.config.settle = d;
        self
    }

    pub fn nav_timeout(mut self, d: Duration) -> Self {
        self.config.nav_timeout = d;
        self
    }

    pub fn download_poll(mut self, d: Duration) -> Self {
        self.config.download_poll = d;
        self
    }

    pub fn download_deadline(mut self, d: Duration) -> Self {
        self.config.download_deadline = d;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn raster_density(mut self, dpi: u32) -> Self {
        self.config.raster_density = dpi.clamp(72, 400);
        self
    }

    pub fn rules(mut self, rules: Vec<ExtractionRule>) -> Self {
        self.config.rules = rules;
        self
    }

    pub fn selectors(mut self, selectors: PortalSelectors) -> Self {
        self.config.selectors = selectors;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<HarvestConfig, HarvestError> {
        let c = &self.config;
        if c.account_id.is_empty() {
            return Err(HarvestError::InvalidConfig(
                "account_id must not be empty".into(),
            ));
        }
        if !c.account_id.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(HarvestError::InvalidConfig(format!(
                "account_id must be numeric, got '{}'",
                c.account_id
            )));
        }
        if c.download_dir.as_os_str().is_empty() {
            return Err(HarvestError::InvalidConfig(
                "download_dir must be set".into(),
            ));
        }
        if c.rules.is_empty() {
            return Err(HarvestError::InvalidConfig(
                "at least one extraction rule is required".into(),
            ));
        }
        Ok(self.config)
    }
}
