use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{HostConfig, DEFAULT_FAILURE_THRESHOLD, DEFAULT_FAILURE_WINDOW};

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub threshold: u32,
    pub window: Duration,
    /// `None` keeps a ban until [`RateLimiter::reset`].
    pub ban_duration: Option<Duration>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_FAILURE_THRESHOLD,
            window: DEFAULT_FAILURE_WINDOW,
            ban_duration: None,
        }
    }
}

impl From<&HostConfig> for RateLimiterConfig {
    fn from(config: &HostConfig) -> Self {
        Self {
            threshold: config.failure_threshold.max(1),
            window: config.failure_window,
            ban_duration: config.ban_duration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Failure counted; the address is still admitted.
    Counted(u32),
    /// This failure (or an earlier one) banned the address.
    Banned,
}

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    failures: u32,
    window_start: Instant,
    banned_at: Option<Instant>,
}

/// Per-address authentication failure counter with a fixed window.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    records: DashMap<IpAddr, FailureRecord>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            inner: Arc::new(RateLimiterInner {
                records: DashMap::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> RateLimiterConfig {
        self.inner.config
    }

    pub fn is_banned(&self, addr: IpAddr) -> bool {
        let now = Instant::now();
        self.inner
            .records
            .get(&addr)
            .map(|record| self.ban_active(&record, now))
            .unwrap_or(false)
    }

    pub fn record_failure(&self, addr: IpAddr) -> FailureOutcome {
        let now = Instant::now();
        let config = self.inner.config;
        let mut record = self.inner.records.entry(addr).or_insert(FailureRecord {
            failures: 0,
            window_start: now,
            banned_at: None,
        });

        if self.ban_active(&record, now) {
            return FailureOutcome::Banned;
        }
        if record.banned_at.is_some()
            || now.saturating_duration_since(record.window_start) >= config.window
        {
            *record = FailureRecord {
                failures: 0,
                window_start: now,
                banned_at: None,
            };
        }

        record.failures += 1;
        if record.failures >= config.threshold {
            record.banned_at = Some(now);
            counter!("beach_pier_bans_total", 1);
            warn!(
                target: "pier::auth",
                peer = %addr,
                failures = record.failures,
                "address banned after repeated authentication failures"
            );
            FailureOutcome::Banned
        } else {
            FailureOutcome::Counted(record.failures)
        }
    }

    /// Clears failures and any ban for `addr`.
    pub fn reset(&self, addr: IpAddr) {
        self.inner.records.remove(&addr);
    }

    /// Drops records that no longer affect admission.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let window = self.inner.config.window;
        let before = self.inner.records.len();
        self.inner.records.retain(|_, record| {
            self.ban_active(record, now)
                || (record.banned_at.is_none()
                    && now.saturating_duration_since(record.window_start) < window)
        });
        before.saturating_sub(self.inner.records.len())
    }

    pub fn tracked(&self) -> usize {
        self.inner.records.len()
    }

    pub fn spawn_pruner(&self, period: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let pruned = limiter.prune();
                if pruned > 0 {
                    debug!(target: "pier::auth", pruned, "pruned failure records");
                }
            }
        })
    }

    fn ban_active(&self, record: &FailureRecord, now: Instant) -> bool {
        match (record.banned_at, self.inner.config.ban_duration) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(at), Some(duration)) => now.saturating_duration_since(at) < duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));
    const OTHER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 8));

    #[tokio::test(start_paused = true)]
    async fn third_failure_bans_and_reset_clears() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        assert_eq!(limiter.record_failure(PEER), FailureOutcome::Counted(1));
        assert_eq!(limiter.record_failure(PEER), FailureOutcome::Counted(2));
        assert!(!limiter.is_banned(PEER));
        assert_eq!(limiter.record_failure(PEER), FailureOutcome::Banned);
        assert!(limiter.is_banned(PEER));
        assert!(!limiter.is_banned(OTHER));

        limiter.reset(PEER);
        assert!(!limiter.is_banned(PEER));
        assert_eq!(limiter.record_failure(PEER), FailureOutcome::Counted(1));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_outside_the_window_do_not_accumulate() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        limiter.record_failure(PEER);
        limiter.record_failure(PEER);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.record_failure(PEER), FailureOutcome::Counted(1));
        assert!(!limiter.is_banned(PEER));
    }

    #[tokio::test(start_paused = true)]
    async fn default_bans_do_not_expire() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        for _ in 0..3 {
            limiter.record_failure(PEER);
        }
        tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;
        assert!(limiter.is_banned(PEER));
        assert_eq!(limiter.prune(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_bans_lift() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            ban_duration: Some(Duration::from_secs(300)),
            ..RateLimiterConfig::default()
        });
        for _ in 0..3 {
            limiter.record_failure(PEER);
        }
        assert!(limiter.is_banned(PEER));
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!limiter.is_banned(PEER));
        assert_eq!(limiter.record_failure(PEER), FailureOutcome::Counted(1));
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_stale_records() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        limiter.record_failure(PEER);
        limiter.record_failure(OTHER);
        assert_eq!(limiter.tracked(), 2);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.prune(), 2);
        assert_eq!(limiter.tracked(), 0);
    }
}
