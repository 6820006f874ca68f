//! CLI binary for billfetch.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `HarvestConfig`, persists credentials between runs, and prints results.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use billfetch::{
    harvest_to_file, HarvestConfig, HarvestError, MagickRasterizer, TesseractOcr,
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Where credentials and portal settings persist between runs.
///
/// Username and password are stored base64-encoded — an obfuscation
/// against shoulder-surfing, not encryption.
const STATE_FILE: &str = ".billfetch.env";

const AFTER_HELP: &str = r#"EXAMPLES:
  # First run: provide portal URL and credentials (persisted for later runs)
  billfetch --url https://portal.example/billing --username me --password secret

  # Subsequent runs reuse the persisted settings
  billfetch

  # Smaller window, custom cache and output locations
  billfetch --last-n-months 6 --download-dir ~/bills -o q1.csv

  # Machine-readable run report
  billfetch --json > report.json

EXTERNAL TOOLS:
  magick      ImageMagick CLI, renders statement page 1 to PNG
  tesseract   OCR engine, reads charges off the rendered page

CACHE LAYOUT (under --download-dir):
  <accountId>custbill<MMDDYYYY>.pdf   downloaded statements
  images/<name>.png                   rasterized first pages
  .billfetch/cookies.json             persisted session cookies
  .billfetch/storage.json             persisted client storage

A fully cached look-back window never opens a browser session. When
statements are missing and no automation backend is wired in, the run
reports the gap instead of guessing."#;

/// Harvest utility statements into dated CSV billing records.
#[derive(Parser, Debug)]
#[command(
    name = "billfetch",
    version,
    about = "Harvest utility statements from a web portal into CSV billing records",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Portal billing-history URL.
    #[arg(long, env = "BILLFETCH_URL")]
    url: Option<String>,

    /// Portal username (persisted base64-encoded in .billfetch.env).
    #[arg(long, requires = "password")]
    username: Option<String>,

    /// Portal password (persisted base64-encoded in .billfetch.env).
    #[arg(long, requires = "username")]
    password: Option<String>,

    /// Account identifier prefixed to statement filenames.
    #[arg(long, env = "BILLFETCH_ACCOUNT", default_value = "6491")]
    account: String,

    /// Look-back window in months (1-24). Default: 24, or the persisted
    /// value from an earlier run.
    #[arg(long, env = "BILLFETCH_MONTHS",
          value_parser = clap::value_parser!(u32).range(1..=24))]
    last_n_months: Option<u32>,

    /// Statement cache directory. Default: $HOME/Downloads.
    #[arg(long, env = "BILLFETCH_DOWNLOAD_DIR")]
    download_dir: Option<PathBuf>,

    /// Write billing records to this CSV file.
    #[arg(short, long, env = "BILLFETCH_OUTPUT", default_value = "billings.csv")]
    output: PathBuf,

    /// Concurrent convert+extract tasks.
    #[arg(short, long, env = "BILLFETCH_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Rasterization density in dpi (72-400).
    #[arg(long, env = "BILLFETCH_DENSITY", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    density: u32,

    /// Print the full run report as JSON instead of a summary.
    #[arg(long)]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Persisted CLI state, mirroring the original dotenv layout.
#[derive(Debug, Default)]
struct PersistedState {
    username: Option<String>,
    password: Option<String>,
    url: Option<String>,
    last_n_months: Option<u32>,
}

impl PersistedState {
    fn load() -> Self {
        let mut state = Self::default();
        let Ok(text) = std::fs::read_to_string(STATE_FILE) else {
            return state;
        };
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "USERNAME" => state.username = decode_b64(value),
                "PASSWORD" => state.password = decode_b64(value),
                "URL" => state.url = Some(value.to_string()),
                "LAST_N_MONTHS" => state.last_n_months = value.parse().ok(),
                _ => {}
            }
        }
        state
    }

    fn save(username: &str, password: &str, url: &str, last_n_months: u32) -> Result<()> {
        let contents = format!(
            "USERNAME=\"{}\"\nPASSWORD=\"{}\"\nURL=\"{}\"\nLAST_N_MONTHS={}\n",
            BASE64.encode(username),
            BASE64.encode(password),
            url,
            last_n_months,
        );
        std::fs::write(STATE_FILE, contents)
            .with_context(|| format!("failed to write {STATE_FILE}"))
    }
}

fn decode_b64(value: &str) -> Option<String> {
    let bytes = BASE64.decode(value).ok()?;
    String::from_utf8(bytes).ok()
}

fn default_download_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join("Downloads"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Merge flags with persisted state ─────────────────────────────────
    let persisted = PersistedState::load();
    let url = cli.url.clone().or(persisted.url.clone());
    let last_n_months = cli
        .last_n_months
        .or(persisted.last_n_months)
        .unwrap_or(billfetch::MAX_LOOK_BACK_MONTHS);

    let credentials = match (&cli.username, &cli.password) {
        (Some(u), Some(p)) => {
            // Fresh credentials persist for the next run, as long as we
            // also know which portal they belong to.
            if let Some(ref url) = url {
                PersistedState::save(u, p, url, last_n_months)?;
            }
            Some((u.clone(), p.clone()))
        }
        _ => persisted
            .username
            .as_ref()
            .zip(persisted.password.as_ref())
            .map(|(u, p)| (u.clone(), p.clone())),
    };

    let download_dir = cli
        .download_dir
        .clone()
        .or_else(default_download_dir)
        .context("could not determine a download directory; pass --download-dir")?;

    // ── Build config ─────────────────────────────────────────────────────
    let mut builder = HarvestConfig::builder()
        .portal_url(url.unwrap_or_default())
        .account_id(&cli.account)
        .last_n_months(last_n_months)
        .download_dir(&download_dir)
        .concurrency(cli.concurrency)
        .raster_density(cli.density);
    if let Some((username, password)) = credentials {
        builder = builder.credentials(username, password);
    }
    let config = builder.build()?;

    // ── Run ──────────────────────────────────────────────────────────────
    let spinner = if cli.quiet || cli.json {
        None
    } else {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(format!(
            "Harvesting last {} months into {}",
            config.last_n_months,
            cli.output.display()
        ));
        bar.enable_steady_tick(Duration::from_millis(80));
        Some(bar)
    };

    // No browser backend is bundled; the cache-first path covers warm runs
    // and a cold cache surfaces SessionRequired with the gap count.
    let result = harvest_to_file(None, &MagickRasterizer, &TesseractOcr, &config, &cli.output).await;

    if let Some(bar) = spinner {
        bar.finish_and_clear();
    }

    let output = match result {
        Ok(output) => output,
        Err(e @ HarvestError::SessionRequired { .. }) => {
            bail!(
                "{e}\n\nhint: statements land in {} as <account>custbill<MMDDYYYY>.pdf",
                download_dir.display()
            );
        }
        Err(e) => return Err(e).context("harvest failed"),
    };

    // ── Report ───────────────────────────────────────────────────────────
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("failed to serialize run report")?
        );
        return Ok(());
    }

    if !cli.quiet {
        eprintln!(
            "✔ {} records written to {} ({} cached, {} downloaded, {} failed)",
            output.stats.records,
            cli.output.display(),
            output.stats.cache_hits,
            output.stats.downloaded,
            output.stats.documents_failed,
        );
        for warning in &output.warnings {
            eprintln!("⚠ {warning}");
        }
        for doc in output.documents.iter().filter(|d| d.error.is_some()) {
            if let Some(ref e) = doc.error {
                eprintln!("✗ {e}");
            }
        }
    }

    Ok(())
}
