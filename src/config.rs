// Cluster client configuration

use crate::error::{ClusterError, Result};
use crate::pool::Connection;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked once per new underlying connection, after the
/// connection finished its init sequence.
pub type OnConnect = Arc<dyn Fn(&Connection) -> Result<()> + Send + Sync>;

/// Configuration for a cluster client.
///
/// Timeout and backoff fields are `Option<Duration>`: `None` picks the
/// documented default during normalization, an explicit `Duration::ZERO`
/// disables the mechanism (the counterpart of `-1` in other clients).
#[derive(Clone)]
pub struct ClusterConfig {
    /// Seed list of host:port addresses of cluster nodes
    pub addrs: Vec<String>,

    /// Attempts per operation across redirects and retries combined.
    /// 0 picks the default of 8, -1 disables retrying entirely.
    pub max_redirects: i32,

    /// Enables routing read-only commands to replica nodes
    pub read_only: bool,
    /// Routes read-only commands to the lowest-latency node; implies read_only
    pub route_by_latency: bool,
    /// Routes read-only commands to a uniformly random slot node
    pub route_randomly: bool,

    /// Backoff envelope for retries. Defaults 8 ms and 512 ms.
    pub min_retry_backoff: Option<Duration>,
    pub max_retry_backoff: Option<Duration>,

    /// Dial timeout for new connections. Default 5 s.
    pub dial_timeout: Option<Duration>,
    /// Per-operation read timeout. Default 3 s.
    pub read_timeout: Option<Duration>,
    /// Per-operation write timeout. Defaults to the read timeout.
    pub write_timeout: Option<Duration>,

    /// Connection pool size per cluster node, not for the whole cluster.
    /// 0 picks the default of 10.
    pub pool_size: usize,
    /// Wait budget for a free connection. Defaults to read timeout + 1 s.
    pub pool_timeout: Option<Duration>,
    /// Age after which idle connections are reaped. Default 5 min.
    pub idle_timeout: Option<Duration>,
    /// Reaper tick frequency, driven by the engine. Default 1 min.
    pub idle_check_frequency: Option<Duration>,

    /// Invoked once per new underlying connection
    pub on_connect: Option<OnConnect>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            max_redirects: 0,
            read_only: false,
            route_by_latency: false,
            route_randomly: false,
            min_retry_backoff: None,
            max_retry_backoff: None,
            dial_timeout: None,
            read_timeout: None,
            write_timeout: None,
            pool_size: 0,
            pool_timeout: None,
            idle_timeout: None,
            idle_check_frequency: None,
            on_connect: None,
        }
    }
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("addrs", &self.addrs)
            .field("max_redirects", &self.max_redirects)
            .field("read_only", &self.read_only)
            .field("route_by_latency", &self.route_by_latency)
            .field("route_randomly", &self.route_randomly)
            .field("pool_size", &self.pool_size)
            .finish_non_exhaustive()
    }
}

impl ClusterConfig {
    pub fn new(addrs: Vec<String>) -> Self {
        Self {
            addrs,
            ..Default::default()
        }
    }

    /// Resolve defaults and option interactions. After this call every
    /// `Option<Duration>` field reads as `None` = disabled.
    pub(crate) fn normalize(&mut self) {
        match self.max_redirects {
            -1 => self.max_redirects = 0,
            0 => self.max_redirects = 8,
            _ => {}
        }

        if self.route_by_latency {
            self.read_only = true;
        }

        self.read_timeout = resolve(self.read_timeout, Duration::from_secs(3));
        self.write_timeout = match self.write_timeout {
            None => self.read_timeout,
            Some(d) if d.is_zero() => None,
            some => some,
        };
        self.dial_timeout = resolve(self.dial_timeout, Duration::from_secs(5));

        self.min_retry_backoff = resolve(self.min_retry_backoff, Duration::from_millis(8));
        self.max_retry_backoff = resolve(self.max_retry_backoff, Duration::from_millis(512));

        if self.pool_size == 0 {
            self.pool_size = 10;
        }
        let pool_default = self
            .read_timeout
            .unwrap_or_default()
            .saturating_add(Duration::from_secs(1));
        self.pool_timeout = resolve(self.pool_timeout, pool_default);
        self.idle_timeout = resolve(self.idle_timeout, Duration::from_secs(5 * 60));
        self.idle_check_frequency = resolve(self.idle_check_frequency, Duration::from_secs(60));
    }

    /// Exponential backoff with full jitter, bounded by the configured
    /// envelope. Attempt 0 never sleeps; the dispatcher only calls this
    /// for retries.
    pub(crate) fn retry_backoff(&self, attempt: u32) -> Duration {
        let (min, max) = match (self.min_retry_backoff, self.max_retry_backoff) {
            (Some(min), Some(max)) => (min, max),
            _ => return Duration::ZERO,
        };

        let backoff = min
            .as_nanos()
            .checked_shl(attempt)
            .map(|n| Duration::from_nanos(n.min(u64::MAX as u128) as u64))
            .unwrap_or(max);
        let backoff = if backoff > max || backoff < min {
            max
        } else {
            backoff
        };
        if backoff.is_zero() {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..backoff.as_nanos() as u64))
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.addrs.is_empty() {
            return Err(ClusterError::NoNodes);
        }
        Ok(())
    }
}

fn resolve(value: Option<Duration>, default: Duration) -> Option<Duration> {
    match value {
        None => Some(default),
        Some(d) if d.is_zero() => None,
        some => some,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve() {
        let mut config = ClusterConfig::new(vec!["127.0.0.1:7000".to_string()]);
        config.normalize();

        assert_eq!(config.max_redirects, 8);
        assert_eq!(config.read_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.write_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.dial_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.min_retry_backoff, Some(Duration::from_millis(8)));
        assert_eq!(config.max_retry_backoff, Some(Duration::from_millis(512)));
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.pool_timeout, Some(Duration::from_secs(4)));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.idle_check_frequency, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_disable_sentinels() {
        let mut config = ClusterConfig::new(vec!["x:1".to_string()]);
        config.max_redirects = -1;
        config.read_timeout = Some(Duration::ZERO);
        config.min_retry_backoff = Some(Duration::ZERO);
        config.max_retry_backoff = Some(Duration::ZERO);
        config.normalize();

        assert_eq!(config.max_redirects, 0);
        assert_eq!(config.read_timeout, None);
        // write timeout follows the (disabled) read timeout
        assert_eq!(config.write_timeout, None);
        assert_eq!(config.min_retry_backoff, None);
        assert_eq!(config.retry_backoff(3), Duration::ZERO);
    }

    #[test]
    fn test_route_by_latency_implies_read_only() {
        let mut config = ClusterConfig::new(vec!["x:1".to_string()]);
        config.route_by_latency = true;
        config.normalize();
        assert!(config.read_only);
    }

    #[test]
    fn test_explicit_write_timeout_kept() {
        let mut config = ClusterConfig::new(vec!["x:1".to_string()]);
        config.write_timeout = Some(Duration::from_secs(7));
        config.normalize();
        assert_eq!(config.write_timeout, Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_backoff_bounds() {
        let mut config = ClusterConfig::new(vec!["x:1".to_string()]);
        config.normalize();

        for attempt in 1..12 {
            let d = config.retry_backoff(attempt);
            assert!(d <= Duration::from_millis(512), "attempt {}: {:?}", attempt, d);
        }
    }

    #[test]
    fn test_check_requires_seeds() {
        let config = ClusterConfig::default();
        assert!(matches!(config.check(), Err(ClusterError::NoNodes)));
    }
}
