//! Sliding-window rate limiting, one window per provider.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::sources::ProviderId;

/// Window bounds for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    /// Window length in seconds.
    pub period: f64,
}

impl RateLimitConfig {
    pub fn new(max_requests: usize, period: Duration) -> Self {
        Self {
            max_requests,
            period: period.as_secs_f64(),
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.period.max(0.0))
    }

    /// Provider defaults.
    pub fn for_provider(provider: ProviderId) -> Self {
        match provider {
            ProviderId::Vk => Self::new(3, Duration::from_secs(1)),
            ProviderId::Instagram => Self::new(1, Duration::from_secs(2)),
            ProviderId::WhatsApp => Self::new(5, Duration::from_secs(1)),
            ProviderId::GetContact => Self::new(1, Duration::from_secs(5)),
            ProviderId::WhoCalls => Self::new(2, Duration::from_secs(1)),
        }
    }
}

/// Sliding-window limiter.
///
/// Waiters queue on a fair mutex that is held across the sleep, so callers
/// are admitted in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window: Mutex::new(VecDeque::with_capacity(config.max_requests)),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Suspend until the window has room, then record this request.
    pub async fn acquire(&self) {
        let period = self.config.period();
        let max = self.config.max_requests.max(1);
        let mut window = self.window.lock().await;

        loop {
            let now = Instant::now();
            while let Some(oldest) = window.front() {
                if now.duration_since(*oldest) >= period {
                    window.pop_front();
                } else {
                    break;
                }
            }

            if window.len() < max {
                window.push_back(now);
                return;
            }

            if let Some(oldest) = window.front().copied() {
                let wait = period.saturating_sub(now.duration_since(oldest));
                log::trace!("rate limiter waiting {:?}", wait);
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Requests currently inside the trailing window.
    pub async fn in_flight(&self) -> usize {
        let period = self.config.period();
        let window = self.window.lock().await;
        let now = Instant::now();
        window
            .iter()
            .filter(|ts| now.duration_since(**ts) < period)
            .count()
    }
}

/// Independent limiters keyed by provider.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: HashMap<ProviderId, Arc<RateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new(overrides: &HashMap<ProviderId, RateLimitConfig>) -> Self {
        let limiters = ProviderId::ALL
            .iter()
            .map(|provider| {
                let config = overrides
                    .get(provider)
                    .copied()
                    .unwrap_or_else(|| RateLimitConfig::for_provider(*provider));
                (*provider, Arc::new(RateLimiter::new(config)))
            })
            .collect();
        Self { limiters }
    }

    pub fn get(&self, provider: ProviderId) -> Option<Arc<RateLimiter>> {
        self.limiters.get(&provider).cloned()
    }

    pub async fn acquire(&self, provider: ProviderId) {
        if let Some(limiter) = self.limiters.get(&provider) {
            limiter.acquire().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn at_most_max_requests_per_window() {
        let limiter = RateLimiter::new(RateLimitConfig::new(3, Duration::from_secs(1)));
        let start = Instant::now();
        let mut stamps = Vec::new();
        for _ in 0..7 {
            limiter.acquire().await;
            stamps.push(start.elapsed());
        }

        for (i, stamp) in stamps.iter().enumerate() {
            let in_window = stamps[i..]
                .iter()
                .filter(|other| **other - *stamp < Duration::from_secs(1))
                .count();
            assert!(in_window <= 3, "window starting at {:?} admitted {}", stamp, in_window);
        }
        assert_eq!(stamps[3], Duration::from_secs(1));
        assert_eq!(stamps[6], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_admitted_in_arrival_order() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(2))));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..4 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                order.lock().await.push(id);
            }));
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn providers_do_not_share_windows() {
        let registry = RateLimiterRegistry::new(&HashMap::new());
        let start = Instant::now();
        registry.acquire(ProviderId::Instagram).await;
        registry.acquire(ProviderId::Vk).await;
        registry.acquire(ProviderId::WhoCalls).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        registry.acquire(ProviderId::Instagram).await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
