//! Per-IP rate limiting of the credential endpoints using governor.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::keyed::DashMapStateStore,
    Quota, RateLimiter,
};
use tonic::Status;
use tracing::{debug, warn};

use crate::config::SecurityConfig;

pub type KeyedRateLimiter =
    RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock, NoOpMiddleware>;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 20,
            burst_size: 10,
        }
    }
}

impl RateLimitConfig {
    pub fn from_config(security: &SecurityConfig) -> Self {
        Self {
            enabled: security.rate_limiting_enabled,
            requests_per_minute: security.rate_limit_requests_per_minute,
            burst_size: (security.rate_limit_requests_per_minute / 2).max(1),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    fn quota(&self) -> Quota {
        let per_minute = NonZeroU32::new(self.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(self.burst_size).unwrap_or(NonZeroU32::MIN);
        Quota::per_minute(per_minute).allow_burst(burst)
    }
}

/// Shared by the services and the maintenance task, which evicts idle keys.
#[derive(Clone)]
pub struct CredentialRateLimiter {
    limiter: Option<Arc<KeyedRateLimiter>>,
}

impl CredentialRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let limiter = config
            .enabled
            .then(|| Arc::new(RateLimiter::dashmap(config.quota())));
        Self { limiter }
    }

    pub fn disabled() -> Self {
        Self { limiter: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Returns the whole seconds to wait when `ip` is over its budget.
    pub fn check(&self, ip: IpAddr) -> Result<(), u64> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };

        limiter.check_key(&ip).map_err(|not_until| {
            not_until
                .wait_time_from(DefaultClock::default().now())
                .as_secs()
                .max(1)
        })
    }

    /// Maps an exhausted budget onto `RESOURCE_EXHAUSTED` for `method`.
    pub fn enforce(&self, ip: Option<IpAddr>, method: &'static str) -> Result<(), Status> {
        let Some(ip) = ip else {
            return Ok(());
        };

        self.check(ip).map_err(|retry_after_secs| {
            warn!(ip = %ip, method = method, retry_after_secs = retry_after_secs, "Rate limit exceeded");
            Status::resource_exhausted(format!(
                "Too many requests, retry in {} seconds",
                retry_after_secs
            ))
        })
    }

    /// Drops keys whose budget has fully replenished.
    pub fn evict_idle(&self) -> usize {
        let Some(limiter) = &self.limiter else {
            return 0;
        };

        let before = limiter.len();
        limiter.retain_recent();
        limiter.shrink_to_fit();
        let evicted = before.saturating_sub(limiter.len());

        debug!(evicted = evicted, remaining = limiter.len(), "Rate limiter keys evicted");
        evicted
    }

    pub fn tracked_keys(&self) -> usize {
        self.limiter.as_ref().map_or(0, |l| l.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(requests_per_minute: u32, burst_size: u32) -> CredentialRateLimiter {
        CredentialRateLimiter::new(&RateLimitConfig {
            enabled: true,
            requests_per_minute,
            burst_size,
        })
    }

    #[test]
    fn test_disabled_limiter_always_allows() {
        let limiter = CredentialRateLimiter::new(&RateLimitConfig::disabled());
        let ip: IpAddr = "1.2.3.4".parse().unwrap();

        assert!(!limiter.is_enabled());
        for _ in 0..100 {
            assert!(limiter.check(ip).is_ok());
        }
        assert_eq!(limiter.evict_idle(), 0);
    }

    #[test]
    fn test_budgets_are_per_ip() {
        let limiter = limiter(2, 2);
        let ip1: IpAddr = "1.2.3.4".parse().unwrap();
        let ip2: IpAddr = "5.6.7.8".parse().unwrap();

        assert!(limiter.check(ip1).is_ok());
        assert!(limiter.check(ip1).is_ok());
        let retry_after = limiter.check(ip1).unwrap_err();
        assert!(retry_after >= 1);

        assert!(limiter.check(ip2).is_ok());
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_enforce_maps_to_resource_exhausted() {
        let limiter = limiter(1, 1);
        let ip: Option<IpAddr> = Some("10.0.0.1".parse().unwrap());

        assert!(limiter.enforce(ip, "Login").is_ok());
        let status = limiter.enforce(ip, "Login").unwrap_err();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);

        // No peer address means nothing to key on.
        assert!(limiter.enforce(None, "Login").is_ok());
    }

    #[test]
    fn test_zero_quota_is_clamped() {
        let limiter = limiter(0, 0);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        assert!(limiter.check(ip).is_ok());
    }
}
