//! Authentication: the bounded-retry login state machine and the persisted
//! session snapshot.
//!
//! ## Why a pure policy object?
//!
//! The original retry loop interleaved retry accounting with page reloads
//! and sleeps, which made the policy untestable without a browser. Here the
//! decision ("retry after a delay", "give up") lives in [`LoginPolicy`],
//! a pure state-transition function over attempt outcomes, and
//! [`SessionManager::ensure_authenticated`] is the effectful executor that
//! performs whatever the policy directs. The policy is unit-tested in
//! isolation; the executor is exercised against scripted sessions.
//!
//! ## Snapshot layout
//!
//! Two independent JSON artifacts under the derived state directory:
//! `cookies.json` (the cookie list) and `storage.json` (the client-storage
//! map). Each is written atomically (temp file + rename) on its own, so a
//! crash mid-write can lose at most one of them — a degraded restore, never
//! a corrupt one. Both are loaded speculatively at the start of every run;
//! a restored session can make credential submission a no-op.

use crate::capability::{StorageSnapshot, WebSession};
use crate::config::HarvestConfig;
use crate::error::{HarvestError, WebError};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Authentication status of the run's single web session.
///
/// Transitions are forward-only, with one exception: an `Expired` session
/// may re-enter `Authenticating` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Expired,
}

impl SessionState {
    /// Whether `next` is a legal transition from `self`.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Unauthenticated, Authenticating)
                | (Authenticating, Authenticated)
                | (Authenticating, Unauthenticated)
                | (Authenticated, Expired)
                | (Expired, Authenticating)
        )
    }
}

/// The result of one login attempt, as reported by the executor.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Success,
    Failure(String),
}

/// What the executor must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Authentication succeeded; proceed with the run.
    Proceed,
    /// Reload the page and retry after this base delay (jitter is the
    /// executor's concern — randomness stays out of the pure policy).
    RetryAfter(Duration),
    /// The attempt bound is exhausted; fail the run.
    GiveUp { attempts: u32, last_error: String },
}

/// Pure bounded-retry policy: attempt outcomes in, directives out.
#[derive(Debug)]
pub struct LoginPolicy {
    max_attempts: u32,
    attempts_made: u32,
    base_delay: Duration,
    last_error: String,
}

impl LoginPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempts_made: 0,
            base_delay,
            last_error: String::new(),
        }
    }

    /// Record an attempt outcome and decide what happens next.
    pub fn assess(&mut self, outcome: &AttemptOutcome) -> Directive {
        self.attempts_made += 1;
        match outcome {
            AttemptOutcome::Success => Directive::Proceed,
            AttemptOutcome::Failure(detail) => {
                self.last_error = detail.clone();
                if self.attempts_made >= self.max_attempts {
                    Directive::GiveUp {
                        attempts: self.attempts_made,
                        last_error: self.last_error.clone(),
                    }
                } else {
                    Directive::RetryAfter(self.base_delay)
                }
            }
        }
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }
}

// ── Snapshot persistence ─────────────────────────────────────────────────────

const COOKIES_FILE: &str = "cookies.json";
const STORAGE_FILE: &str = "storage.json";

/// Persisted session artifacts: cookie list + client-storage map.
#[derive(Debug, Default)]
pub struct SessionSnapshot {
    pub cookies: Vec<crate::capability::Cookie>,
    pub storage: StorageSnapshot,
}

impl SessionSnapshot {
    /// Load whatever artifacts exist under `state_dir`. Each file is read
    /// independently; a missing or unreadable artifact degrades the restore
    /// rather than failing it.
    pub async fn load(state_dir: &Path) -> Self {
        let mut snapshot = Self::default();

        match tokio::fs::read(state_dir.join(COOKIES_FILE)).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(cookies) => snapshot.cookies = cookies,
                Err(e) => warn!("ignoring malformed cookie snapshot: {e}"),
            },
            Err(e) => debug!("no cookie snapshot: {e}"),
        }

        match tokio::fs::read(state_dir.join(STORAGE_FILE)).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(storage) => snapshot.storage = storage,
                Err(e) => warn!("ignoring malformed storage snapshot: {e}"),
            },
            Err(e) => debug!("no storage snapshot: {e}"),
        }

        snapshot
    }

    /// Persist both artifacts under `state_dir`, each atomically.
    pub async fn persist(&self, state_dir: &Path) -> Result<(), HarvestError> {
        tokio::fs::create_dir_all(state_dir)
            .await
            .map_err(|e| HarvestError::SnapshotIo {
                path: state_dir.to_path_buf(),
                source: e,
            })?;

        write_atomic(
            &state_dir.join(COOKIES_FILE),
            &serde_json::to_vec_pretty(&self.cookies)
                .map_err(|e| HarvestError::Internal(format!("cookie snapshot encode: {e}")))?,
        )
        .await?;

        write_atomic(
            &state_dir.join(STORAGE_FILE),
            &serde_json::to_vec_pretty(&self.storage)
                .map_err(|e| HarvestError::Internal(format!("storage snapshot encode: {e}")))?,
        )
        .await?;

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.storage.is_empty()
    }
}

/// Write `bytes` to `path` via a temp file and rename, so readers never see
/// a half-written artifact.
async fn write_atomic(path: &PathBuf, bytes: &[u8]) -> Result<(), HarvestError> {
    let tmp = path.with_extension("json.tmp");
    let io_err = |e: std::io::Error| HarvestError::SnapshotIo {
        path: path.clone(),
        source: e,
    };
    tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| HarvestError::SnapshotIo {
            path: path.clone(),
            source: e,
        })?;
    Ok(())
}

// ── The effectful executor ───────────────────────────────────────────────────

/// Owns authentication state for the run's single session.
pub struct SessionManager<'a> {
    config: &'a HarvestConfig,
    state: SessionState,
}

impl<'a> SessionManager<'a> {
    pub fn new(config: &'a HarvestConfig) -> Self {
        Self {
            config,
            state: SessionState::Unauthenticated,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to an authenticated state with the history table
    /// unlocked, retrying up to the configured bound.
    ///
    /// On entry the persisted snapshot is restored speculatively; on success
    /// the fresh snapshot is written back for the next run. Terminal failure
    /// is fatal for the whole run.
    pub async fn ensure_authenticated(
        &mut self,
        session: &dyn WebSession,
    ) -> Result<(), HarvestError> {
        self.restore_snapshot(session).await;

        let mut policy = LoginPolicy::new(
            self.config.max_login_attempts,
            self.config.retry_delay,
        );

        loop {
            self.advance(SessionState::Authenticating);
            let outcome = match self.attempt_login(session).await {
                Ok(()) => AttemptOutcome::Success,
                Err(e) => AttemptOutcome::Failure(e.to_string()),
            };

            match policy.assess(&outcome) {
                Directive::Proceed => {
                    self.advance(SessionState::Authenticated);
                    info!(
                        attempts = policy.attempts_made(),
                        "authenticated; history table present"
                    );
                    if let Err(e) = self.capture_snapshot(session).await {
                        // Losing the snapshot only costs the next run a login.
                        warn!("failed to persist session snapshot: {e}");
                    }
                    return Ok(());
                }
                Directive::RetryAfter(base) => {
                    self.advance(SessionState::Unauthenticated);
                    warn!(
                        attempt = policy.attempts_made(),
                        "login attempt failed; reloading and retrying"
                    );
                    if let Err(e) = session.reload().await {
                        debug!("reload before retry failed: {e}");
                    }
                    sleep(self.jittered(base)).await;
                }
                Directive::GiveUp {
                    attempts,
                    last_error,
                } => {
                    return Err(HarvestError::AuthenticationFailed {
                        attempts,
                        last_error,
                    });
                }
            }
        }
    }

    /// One whole login attempt. Any step failing abandons the attempt;
    /// the policy decides whether another follows.
    async fn attempt_login(&self, session: &dyn WebSession) -> Result<(), WebError> {
        let sel = &self.config.selectors;

        // Consent dialog blocks the login button when present; absence is
        // not an error.
        if session
            .wait_visible(&sel.consent_reject, self.config.consent_timeout)
            .await
            .is_ok()
        {
            debug!("dismissing consent dialog");
            session.click(&sel.consent_reject).await?;
        } else {
            debug!("no consent dialog");
        }

        info!(url = %self.config.portal_url, "navigating to portal");
        session.goto(&self.config.portal_url).await?;
        sleep(self.config.settle).await;

        let url = session.current_url().await?;
        if url.contains("login") {
            // A restored session can land on the login URL while still
            // being signed in; check before typing credentials.
            if session.is_present(&sel.signed_in_marker).await? {
                info!("already signed in");
            } else {
                let creds = self.config.credentials.as_ref().ok_or_else(|| {
                    WebError::Backend("login required but no credentials configured".into())
                })?;
                info!("submitting credentials");
                session.type_text(&sel.username_field, &creds.username).await?;
                session.type_text(&sel.password_field, &creds.password).await?;
                session
                    .wait_visible(&sel.login_submit, self.config.history_timeout)
                    .await?;
                session.click(&sel.login_submit).await?;
                session.wait_navigation(self.config.nav_timeout).await?;
            }
        }

        // Re-navigate to the billing page and unlock the full window.
        session.goto(&self.config.portal_url).await?;
        session
            .wait_visible(&sel.history_expand, self.config.history_timeout)
            .await?;
        session.click(&sel.history_expand).await?;
        session
            .wait_visible(&sel.history_table, self.config.history_timeout)
            .await?;
        Ok(())
    }

    /// Install the persisted snapshot into the session, best-effort.
    async fn restore_snapshot(&self, session: &dyn WebSession) {
        let snapshot = SessionSnapshot::load(&self.config.state_dir()).await;
        if snapshot.is_empty() {
            debug!("no session snapshot to restore");
            return;
        }
        info!(
            cookies = snapshot.cookies.len(),
            storage_keys = snapshot.storage.len(),
            "restoring session snapshot"
        );
        if let Err(e) = session.set_cookies(&snapshot.cookies).await {
            warn!("cookie restore failed: {e}");
        }
        if let Err(e) = session.set_local_storage(&snapshot.storage).await {
            warn!("storage restore failed: {e}");
        }
    }

    /// Read the live session state and persist it for the next run.
    async fn capture_snapshot(&self, session: &dyn WebSession) -> Result<(), HarvestError> {
        let cookies = session
            .cookies()
            .await
            .map_err(|e| HarvestError::Internal(format!("cookie capture: {e}")))?;
        let storage = session
            .local_storage()
            .await
            .map_err(|e| HarvestError::Internal(format!("storage capture: {e}")))?;
        let snapshot = SessionSnapshot { cookies, storage };
        snapshot.persist(&self.config.state_dir()).await
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition(next),
            "illegal session transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    fn jittered(&self, base: Duration) -> Duration {
        let jitter_ms = self.config.retry_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_proceeds_on_first_success() {
        let mut p = LoginPolicy::new(2, Duration::from_secs(8));
        assert_eq!(p.assess(&AttemptOutcome::Success), Directive::Proceed);
        assert_eq!(p.attempts_made(), 1);
    }

    #[test]
    fn policy_retries_then_gives_up_at_bound() {
        let mut p = LoginPolicy::new(2, Duration::from_secs(8));
        let d1 = p.assess(&AttemptOutcome::Failure("timeout".into()));
        assert_eq!(d1, Directive::RetryAfter(Duration::from_secs(8)));

        let d2 = p.assess(&AttemptOutcome::Failure("still down".into()));
        match d2 {
            Directive::GiveUp {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_error, "still down");
            }
            other => panic!("expected GiveUp, got {other:?}"),
        }
    }

    #[test]
    fn policy_success_after_failure_proceeds() {
        let mut p = LoginPolicy::new(3, Duration::from_secs(1));
        p.assess(&AttemptOutcome::Failure("blip".into()));
        assert_eq!(p.assess(&AttemptOutcome::Success), Directive::Proceed);
    }

    #[test]
    fn state_transitions_are_forward_only() {
        use SessionState::*;
        assert!(Unauthenticated.can_transition(Authenticating));
        assert!(Authenticating.can_transition(Authenticated));
        assert!(Authenticating.can_transition(Unauthenticated));
        assert!(Authenticated.can_transition(Expired));
        assert!(Expired.can_transition(Authenticating));

        assert!(!Authenticated.can_transition(Unauthenticated));
        assert!(!Authenticated.can_transition(Authenticating));
        assert!(!Unauthenticated.can_transition(Authenticated));
        assert!(!Expired.can_transition(Authenticated));
    }

    #[tokio::test]
    async fn snapshot_round_trip_and_partial_load() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");

        let mut storage = StorageSnapshot::new();
        storage.insert("token".into(), "xyz".into());
        let snapshot = SessionSnapshot {
            cookies: vec![crate::capability::Cookie {
                name: "SESSION".into(),
                value: "abc".into(),
                domain: ".portal.example".into(),
                path: "/".into(),
                secure: true,
                http_only: true,
                expires: None,
            }],
            storage,
        };
        snapshot.persist(&state_dir).await.unwrap();

        let loaded = SessionSnapshot::load(&state_dir).await;
        assert_eq!(loaded.cookies.len(), 1);
        assert_eq!(loaded.storage.get("token").map(String::as_str), Some("xyz"));

        // Corrupting one artifact must not poison the other.
        tokio::fs::write(state_dir.join("cookies.json"), b"{not json")
            .await
            .unwrap();
        let degraded = SessionSnapshot::load(&state_dir).await;
        assert!(degraded.cookies.is_empty());
        assert_eq!(degraded.storage.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_load_from_missing_dir_is_empty() {
        let loaded = SessionSnapshot::load(Path::new("/definitely/not/here")).await;
        assert!(loaded.is_empty());
    }
}
