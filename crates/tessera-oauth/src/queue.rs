//! Background proactive token refresh.
//!
//! [`ProactiveRefreshQueue`] periodically scans the account store and
//! refreshes tokens that will expire within the configured buffer, before a
//! foreground request ever sees an expired credential. Tokens that have
//! already expired are left to the request path.
//!
//! Scheduling is a self-rescheduling timer: every interval is jittered
//! independently so many instances do not converge on the same tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::accounts::{ManagedAccount, SharedAccountManager, is_expired_at, needs_refresh_at};
use crate::credentials::now_millis;
use crate::refresher::{SharedRefresher, sleep_or_cancel};
use crate::retry::jitter;

/// Refresh tokens expiring within this many seconds.
pub const DEFAULT_BUFFER_SECONDS: u64 = 1800;

/// Base interval between scans.
pub const DEFAULT_CHECK_INTERVAL_SECONDS: u64 = 300;

/// Floor for the scan interval; a zero interval would never yield.
pub const MIN_CHECK_INTERVAL_SECONDS: u64 = 1;

/// Accounts expiring this soon at startup trigger an immediate scan.
pub const URGENT_THRESHOLD_MS: i64 = 60_000;

/// Delay before the first scan when nothing is urgent.
pub const INITIAL_DELAY: Duration = Duration::from_secs(3);

/// Jitter applied to every scheduled delay (±10%).
pub const SCHEDULE_JITTER_RATIO: f64 = 0.1;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration & Stats
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for proactive refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProactiveRefreshConfig {
    pub enabled: bool,
    pub buffer_seconds: u64,
    pub check_interval_seconds: u64,
}

impl Default for ProactiveRefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_seconds: DEFAULT_BUFFER_SECONDS,
            check_interval_seconds: DEFAULT_CHECK_INTERVAL_SECONDS,
        }
    }
}

impl ProactiveRefreshConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_buffer_seconds(mut self, secs: u64) -> Self {
        self.buffer_seconds = secs;
        self
    }

    pub fn with_check_interval_seconds(mut self, secs: u64) -> Self {
        self.check_interval_seconds = secs;
        self
    }

    fn buffer_ms(&self) -> i64 {
        i64::try_from(self.buffer_seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
    }

    fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds.max(MIN_CHECK_INTERVAL_SECONDS))
    }
}

/// Read-only snapshot of queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshQueueStats {
    pub is_running: bool,
    pub is_refreshing: bool,
    /// Epoch millis of the last scan.
    pub last_check_time: Option<i64>,
    /// Epoch millis of the last successful refresh.
    pub last_refresh_time: Option<i64>,
    pub refresh_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Default)]
struct Counters {
    last_check_time: Option<i64>,
    last_refresh_time: Option<i64>,
    refresh_count: u64,
    error_count: u64,
}

/// Pending timer chain for one `start()`.
#[derive(Debug)]
struct Schedule {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Clears a flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ProactiveRefreshQueue
// ─────────────────────────────────────────────────────────────────────────────

struct QueueInner {
    config: ProactiveRefreshConfig,
    accounts: SharedAccountManager,
    refresher: SharedRefresher,
    is_running: AtomicBool,
    is_refreshing: AtomicBool,
    counters: Mutex<Counters>,
    schedule: Mutex<Option<Schedule>>,
}

/// Background scheduler that keeps account tokens fresh.
pub struct ProactiveRefreshQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for ProactiveRefreshQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProactiveRefreshQueue")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ProactiveRefreshQueue {
    pub fn new(
        config: ProactiveRefreshConfig,
        accounts: SharedAccountManager,
        refresher: SharedRefresher,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                accounts,
                refresher,
                is_running: AtomicBool::new(false),
                is_refreshing: AtomicBool::new(false),
                counters: Mutex::new(Counters::default()),
                schedule: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ProactiveRefreshConfig {
        &self.inner.config
    }

    /// Whether the account's token is within the refresh buffer.
    pub fn needs_refresh(&self, account: &ManagedAccount) -> bool {
        needs_refresh_at(account, now_millis(), self.inner.config.buffer_ms())
    }

    /// Whether the account's token has already expired.
    pub fn is_expired(&self, account: &ManagedAccount) -> bool {
        is_expired_at(account, now_millis())
    }

    /// Accounts to refresh now: inside the buffer but not yet expired.
    pub fn accounts_needing_refresh(&self) -> Vec<ManagedAccount> {
        self.inner.accounts_needing_refresh_at(now_millis())
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> RefreshQueueStats {
        self.inner.stats()
    }

    /// Start the background timer chain. Must be called inside a tokio runtime.
    ///
    /// No-op when already running or disabled by configuration.
    pub fn start(&self) {
        if !self.inner.config.enabled {
            tracing::debug!("Proactive token refresh disabled");
            return;
        }

        let mut schedule = self.inner.schedule.lock();
        if self.inner.is_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let urgent = self.inner.urgent_account_count(now_millis());
        let first_delay = if urgent > 0 {
            tracing::info!(urgent, "Accounts expiring imminently, refreshing now");
            Duration::ZERO
        } else {
            jitter(INITIAL_DELAY, SCHEDULE_JITTER_RATIO)
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&self.inner).run_schedule(first_delay, cancel.clone()));
        *schedule = Some(Schedule { cancel, task });

        tracing::info!(
            buffer_seconds = self.inner.config.buffer_seconds,
            check_interval_seconds = self.inner.config.check_interval_seconds,
            first_delay_ms = first_delay.as_millis() as u64,
            "Proactive token refresh started"
        );
    }

    /// Stop scheduling. Idempotent.
    ///
    /// A pass in flight finishes its current account and then stops.
    pub fn stop(&self) {
        let schedule = self.inner.schedule.lock().take();
        let was_running = self.inner.is_running.swap(false, Ordering::SeqCst);
        if let Some(schedule) = schedule {
            schedule.cancel.cancel();
        }
        if was_running {
            tracing::info!("Proactive token refresh stopped");
        }
    }

    /// Stop and wait for the background task to wind down.
    pub async fn shutdown(&self) {
        let schedule = self.inner.schedule.lock().take();
        self.stop();
        if let Some(schedule) = schedule {
            schedule.cancel.cancel();
            if let Err(e) = schedule.task.await {
                tracing::warn!(error = %e, "Refresh scheduler task ended abnormally");
            }
        }
    }

    /// Run one refresh pass now.
    ///
    /// Skipped when the queue is stopped or another pass is in flight.
    pub async fn run_refresh_pass(&self) {
        let cancel = self
            .inner
            .schedule
            .lock()
            .as_ref()
            .map(|s| s.cancel.clone())
            .unwrap_or_default();
        self.inner.run_pass(&cancel).await;
    }
}

impl Drop for ProactiveRefreshQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl QueueInner {
    fn stats(&self) -> RefreshQueueStats {
        let counters = self.counters.lock();
        RefreshQueueStats {
            is_running: self.is_running.load(Ordering::SeqCst),
            is_refreshing: self.is_refreshing.load(Ordering::SeqCst),
            last_check_time: counters.last_check_time,
            last_refresh_time: counters.last_refresh_time,
            refresh_count: counters.refresh_count,
            error_count: counters.error_count,
        }
    }

    fn accounts_needing_refresh_at(&self, now_ms: i64) -> Vec<ManagedAccount> {
        let buffer_ms = self.config.buffer_ms();
        self.accounts
            .accounts()
            .into_iter()
            .filter(|a| needs_refresh_at(a, now_ms, buffer_ms) && !is_expired_at(a, now_ms))
            .collect()
    }

    fn urgent_account_count(&self, now_ms: i64) -> usize {
        self.accounts
            .accounts()
            .iter()
            .filter(|a| is_expired_at(a, now_ms) || needs_refresh_at(a, now_ms, URGENT_THRESHOLD_MS))
            .count()
    }

    async fn run_schedule(self: Arc<Self>, first_delay: Duration, cancel: CancellationToken) {
        let mut delay = first_delay;
        loop {
            if !delay.is_zero() && !sleep_or_cancel(delay, &cancel).await {
                break;
            }
            if cancel.is_cancelled() || !self.is_running.load(Ordering::SeqCst) {
                break;
            }

            self.run_pass(&cancel).await;

            delay = jitter(self.config.check_interval(), SCHEDULE_JITTER_RATIO);
            tracing::debug!(delay_ms = delay.as_millis() as u64, "Next refresh check scheduled");
        }
        tracing::debug!("Refresh scheduler exited");
    }

    async fn run_pass(&self, cancel: &CancellationToken) {
        if !self.is_running.load(Ordering::SeqCst) {
            tracing::debug!("Refresh queue not running, skipping pass");
            return;
        }
        if self
            .is_refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Refresh pass already in flight, skipping");
            return;
        }
        let _refreshing = FlagGuard(&self.is_refreshing);

        let now = now_millis();
        self.counters.lock().last_check_time = Some(now);

        let candidates = self.accounts_needing_refresh_at(now);
        if candidates.is_empty() {
            tracing::debug!("No accounts need proactive refresh");
            return;
        }

        tracing::info!(count = candidates.len(), "Proactively refreshing tokens");

        for account in &candidates {
            if !self.is_running.load(Ordering::SeqCst) {
                tracing::info!("Refresh queue stopped, aborting pass");
                break;
            }
            self.refresh_account(account, cancel).await;
        }
    }

    async fn refresh_account(&self, account: &ManagedAccount, cancel: &CancellationToken) {
        let auth = self.accounts.to_auth_details(account);
        match self.refresher.refresh(&auth, cancel).await {
            Ok(Some(details)) => {
                self.accounts.update_from_auth(account, &details);
                {
                    let mut counters = self.counters.lock();
                    counters.refresh_count += 1;
                    counters.last_refresh_time = Some(now_millis());
                }
                tracing::info!(
                    account = %account.label(),
                    expires = details.expires,
                    "Token refreshed proactively"
                );
                if let Err(e) = self.accounts.save_to_disk().await {
                    tracing::warn!(
                        account = %account.label(),
                        error = %e,
                        "Failed to persist refreshed token, keeping in-memory credential"
                    );
                }
            }
            Ok(None) => {
                tracing::debug!(account = %account.label(), "Refresh produced no new credential");
            }
            Err(e) => {
                self.counters.lock().error_count += 1;
                tracing::warn!(
                    account = %account.label(),
                    error = %e,
                    "Proactive token refresh failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::InMemoryAccountManager;
    use crate::credentials::OAuthAuthDetails;
    use crate::error::{OAuthError, Result, TokenRefreshError};
    use crate::refresher::CredentialRefresher;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    const HOUR_MS: i64 = 3_600_000;

    /// Refresher that succeeds unless the refresh blob starts with `fail`.
    #[derive(Debug, Default)]
    struct ScriptedRefresher {
        calls: AtomicU32,
        delay: Duration,
    }

    impl ScriptedRefresher {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialRefresher for ScriptedRefresher {
        async fn refresh(
            &self,
            auth: &OAuthAuthDetails,
            _cancel: &CancellationToken,
        ) -> Result<Option<OAuthAuthDetails>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if auth.refresh.starts_with("fail") {
                return Err(OAuthError::TokenRefresh(TokenRefreshError::new(
                    503,
                    "Service Unavailable",
                )));
            }
            Ok(Some(OAuthAuthDetails::new(
                format!("fresh-{}", auth.refresh),
                now_millis() + HOUR_MS,
                auth.refresh.clone(),
            )))
        }
    }

    fn queue_with(
        accounts: Vec<ManagedAccount>,
        refresher: Arc<ScriptedRefresher>,
    ) -> (ProactiveRefreshQueue, Arc<InMemoryAccountManager>) {
        let manager = Arc::new(InMemoryAccountManager::with_accounts(accounts));
        let queue = ProactiveRefreshQueue::new(
            ProactiveRefreshConfig::default(),
            manager.clone(),
            refresher,
        );
        (queue, manager)
    }

    /// Inside the 30 minute buffer but not urgent.
    fn expiring(index: usize, refresh: &str) -> ManagedAccount {
        ManagedAccount::new(index, refresh).with_expires(now_millis() + 10 * 60_000)
    }

    /// Inside the urgent window.
    fn urgent(index: usize, refresh: &str) -> ManagedAccount {
        ManagedAccount::new(index, refresh).with_expires(now_millis() + 30_000)
    }

    #[test]
    fn test_config_defaults() {
        let config = ProactiveRefreshConfig::default();
        assert!(config.enabled);
        assert_eq!(config.buffer_seconds, 1800);
        assert_eq!(config.check_interval_seconds, 300);
    }

    #[test]
    fn test_unknown_expiry_is_never_due() {
        let (queue, _) = queue_with(vec![], Arc::new(ScriptedRefresher::default()));
        let account = ManagedAccount::new(0, "rt");
        assert!(!queue.needs_refresh(&account));
        assert!(!queue.is_expired(&account));
    }

    #[test]
    fn test_accounts_needing_refresh_excludes_expired() {
        let now = now_millis();
        let accounts = vec![
            ManagedAccount::new(0, "expired").with_expires(now - 1_000),
            ManagedAccount::new(1, "expiring").with_expires(now + 60_000),
            ManagedAccount::new(2, "fresh").with_expires(now + 2 * HOUR_MS),
            ManagedAccount::new(3, "unknown"),
        ];
        let (queue, _) = queue_with(accounts.clone(), Arc::new(ScriptedRefresher::default()));

        assert!(queue.needs_refresh(&accounts[0]));
        assert!(queue.is_expired(&accounts[0]));

        let due = queue.accounts_needing_refresh();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].index, 1);
    }

    #[tokio::test]
    async fn test_pass_requires_running() {
        let refresher = Arc::new(ScriptedRefresher::default());
        let (queue, _) = queue_with(vec![expiring(0, "rt")], refresher.clone());
        queue.run_refresh_pass().await;
        assert_eq!(refresher.calls(), 0);
        assert!(queue.stats().last_check_time.is_none());
    }

    #[tokio::test]
    async fn test_pass_refreshes_and_updates_accounts() {
        let refresher = Arc::new(ScriptedRefresher::default());
        let (queue, manager) = queue_with(
            vec![expiring(0, "rt-a"), expiring(1, "rt-b")],
            refresher.clone(),
        );

        queue.start();
        queue.run_refresh_pass().await;
        queue.stop();

        assert_eq!(refresher.calls(), 2);
        let stats = queue.stats();
        assert_eq!(stats.refresh_count, 2);
        assert_eq!(stats.error_count, 0);
        assert!(stats.last_refresh_time.is_some());
        assert_eq!(manager.save_count(), 2);
        assert_eq!(
            manager.account(1).unwrap().access.as_deref(),
            Some("fresh-rt-b")
        );
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_pass() {
        let refresher = Arc::new(ScriptedRefresher::default());
        let (queue, manager) = queue_with(
            vec![expiring(0, "fail-rt"), expiring(1, "rt-ok")],
            refresher.clone(),
        );

        queue.start();
        queue.run_refresh_pass().await;
        queue.stop();

        let stats = queue.stats();
        assert_eq!(refresher.calls(), 2);
        assert_eq!(stats.refresh_count, 1);
        assert_eq!(stats.error_count, 1);
        assert!(manager.account(0).unwrap().access.is_none());
        assert!(manager.account(1).unwrap().access.is_some());
    }

    #[tokio::test]
    async fn test_save_failure_is_not_fatal() {
        let refresher = Arc::new(ScriptedRefresher::default());
        let (queue, manager) = queue_with(
            vec![expiring(0, "rt-a"), expiring(1, "rt-b")],
            refresher.clone(),
        );
        manager.fail_saves(true);

        queue.start();
        queue.run_refresh_pass().await;
        queue.stop();

        let stats = queue.stats();
        assert_eq!(stats.refresh_count, 2);
        assert_eq!(stats.error_count, 0);
        assert_eq!(
            manager.account(0).unwrap().access.as_deref(),
            Some("fresh-rt-a")
        );
    }

    #[tokio::test]
    async fn test_concurrent_passes_are_skipped() {
        let refresher = Arc::new(ScriptedRefresher::with_delay(Duration::from_millis(100)));
        let (queue, _) = queue_with(vec![expiring(0, "rt")], refresher.clone());

        queue.start();
        tokio::join!(queue.run_refresh_pass(), queue.run_refresh_pass());
        queue.stop();

        assert_eq!(refresher.calls(), 1);
        assert!(!queue.stats().is_refreshing);
    }

    #[tokio::test]
    async fn test_start_with_expired_account_runs_immediately() {
        let expired = ManagedAccount::new(0, "rt").with_expires(now_millis() - 1_000);
        let (queue, _) = queue_with(vec![expired], Arc::new(ScriptedRefresher::default()));

        queue.start();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Well before the ~3s initial delay.
        assert!(queue.stats().last_check_time.is_some());
        queue.stop();
    }

    #[tokio::test]
    async fn test_start_without_urgent_accounts_waits() {
        let refresher = Arc::new(ScriptedRefresher::default());
        let (queue, _) = queue_with(vec![expiring(0, "rt")], refresher.clone());

        queue.start();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(queue.stats().last_check_time.is_none());
        assert_eq!(refresher.calls(), 0);
        queue.stop();
    }

    #[tokio::test]
    async fn test_stop_mid_pass_finishes_current_account_only() {
        let refresher = Arc::new(ScriptedRefresher::with_delay(Duration::from_millis(300)));
        let (queue, manager) = queue_with(
            vec![urgent(0, "rt-a"), urgent(1, "rt-b"), urgent(2, "rt-c")],
            refresher.clone(),
        );

        queue.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(queue.stats().is_refreshing);
        queue.stop();
        tokio::time::sleep(Duration::from_millis(700)).await;

        let stats = queue.stats();
        assert!(!stats.is_running);
        assert!(!stats.is_refreshing);
        assert_eq!(refresher.calls(), 1);
        assert_eq!(stats.refresh_count, 1);
        assert!(manager.account(0).unwrap().access.is_some());
        assert!(manager.account(1).unwrap().access.is_none());
    }

    #[tokio::test]
    async fn test_start_disabled_is_noop() {
        let manager = Arc::new(InMemoryAccountManager::with_accounts(vec![urgent(0, "rt")]));
        let queue = ProactiveRefreshQueue::new(
            ProactiveRefreshConfig::default().with_enabled(false),
            manager,
            Arc::new(ScriptedRefresher::default()),
        );
        queue.start();
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let refresher = Arc::new(ScriptedRefresher::default());
        let (queue, _) = queue_with(vec![urgent(0, "rt")], refresher.clone());

        queue.start();
        queue.start();
        assert!(queue.is_running());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(refresher.calls(), 1);

        queue.stop();
        queue.stop();
        assert!(!queue.is_running());
    }

    #[test]
    fn test_zero_check_interval_is_clamped() {
        let config = ProactiveRefreshConfig::default().with_check_interval_seconds(0);
        assert_eq!(
            config.check_interval(),
            Duration::from_secs(MIN_CHECK_INTERVAL_SECONDS)
        );
    }

    #[tokio::test]
    async fn test_zero_check_interval_yields_to_other_tasks() {
        let refresher = Arc::new(ScriptedRefresher::default());
        let manager = Arc::new(InMemoryAccountManager::with_accounts(vec![
            ManagedAccount::new(0, "expired").with_expires(now_millis() - 1_000),
        ]));
        let queue = ProactiveRefreshQueue::new(
            ProactiveRefreshConfig::default().with_check_interval_seconds(0),
            manager,
            refresher.clone(),
        );

        queue.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.stats().last_check_time.is_some());

        queue.shutdown().await;
        assert!(!queue.is_running());
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_scheduler() {
        let (queue, _) = queue_with(vec![expiring(0, "rt")], Arc::new(ScriptedRefresher::default()));
        queue.start();
        tokio::time::timeout(Duration::from_secs(1), queue.shutdown())
            .await
            .expect("scheduler should exit promptly");
        assert!(!queue.is_running());
    }
}
