//! Metrics collection utilities.
//!
//! Aggregated global and per-provider statistics with latency percentiles.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::normalizer::LookupStatus;
use crate::sources::ProviderId;

/// Aggregated metrics across all providers.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_lookups: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub average_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_lookups: 0,
            errors: 0,
            cache_hits: 0,
            average_latency: None,
        }
    }
}

/// Provider-scoped metrics snapshot.
#[derive(Debug, Clone)]
pub struct ProviderStats {
    pub provider: ProviderId,
    pub total_lookups: u64,
    pub cache_hits: u64,
    pub retries: u64,
    pub statuses: BTreeMap<&'static str, u64>,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub consecutive_errors: u32,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub providers: Vec<ProviderStats>,
}

#[derive(Debug)]
struct ProviderAccumulator {
    total_lookups: u64,
    cache_hits: u64,
    retries: u64,
    statuses: BTreeMap<&'static str, u64>,
    latencies: VecDeque<Duration>,
    max_window: usize,
    consecutive_errors: u32,
}

impl ProviderAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            total_lookups: 0,
            cache_hits: 0,
            retries: 0,
            statuses: BTreeMap::new(),
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            consecutive_errors: 0,
        }
    }

    fn record(&mut self, status: LookupStatus, latency: Duration) {
        self.total_lookups += 1;
        *self.statuses.entry(status.as_str()).or_insert(0) += 1;
        if status == LookupStatus::Error {
            self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        } else {
            self.consecutive_errors = 0;
        }

        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
    }

    fn snapshot(&self, provider: ProviderId) -> ProviderStats {
        let (avg, p95) = self.latency_stats();
        ProviderStats {
            provider,
            total_lookups: self.total_lookups,
            cache_hits: self.cache_hits,
            retries: self.retries,
            statuses: self.statuses.clone(),
            average_latency: avg,
            p95_latency: p95,
            consecutive_errors: self.consecutive_errors,
        }
    }
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    providers: HashMap<ProviderId, ProviderAccumulator>,
}

impl MetricsState {
    fn accumulator_mut(&mut self, provider: ProviderId) -> &mut ProviderAccumulator {
        let window = self.max_window;
        self.providers
            .entry(provider)
            .or_insert_with(|| ProviderAccumulator::new(window))
    }
}

/// Thread-safe metrics collector shared with the event handlers.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(128)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                global: GlobalStats::default(),
                max_window: window.max(16),
                providers: HashMap::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_outcome(&self, provider: ProviderId, status: LookupStatus, latency: Duration) {
        let mut guard = self.state();
        guard.global.total_lookups += 1;
        if status == LookupStatus::Error {
            guard.global.errors += 1;
        }
        guard.global.average_latency = Some(match guard.global.average_latency {
            Some(avg) => Duration::from_secs_f64(avg.as_secs_f64() * 0.9 + latency.as_secs_f64() * 0.1),
            None => latency,
        });
        guard.accumulator_mut(provider).record(status, latency);
    }

    pub fn record_cache_hit(&self, provider: ProviderId) {
        let mut guard = self.state();
        guard.global.cache_hits += 1;
        guard.accumulator_mut(provider).cache_hits += 1;
    }

    pub fn record_retry(&self, provider: ProviderId) {
        self.state().accumulator_mut(provider).retries += 1;
    }

    pub fn provider(&self, provider: ProviderId) -> Option<ProviderStats> {
        let guard = self.state();
        guard
            .providers
            .get(&provider)
            .map(|acc| acc.snapshot(provider))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.state();
        let mut providers: Vec<_> = guard
            .providers
            .iter()
            .map(|(provider, acc)| acc.snapshot(*provider))
            .collect();
        providers.sort_by_key(|stats| stats.provider);
        MetricsSnapshot {
            global: guard.global.clone(),
            providers,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
