//! Event system for the lookup pipeline.
//!
//! Provides hooks for metrics, logging, and custom reactions around lookup
//! activity.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::metrics::MetricsCollector;
use crate::browser::SearchPhase;
use crate::normalizer::LookupStatus;
use crate::sources::ProviderId;

#[derive(Debug, Clone)]
pub struct CacheHitEvent {
    pub provider: ProviderId,
    pub query: String,
    pub timestamp: DateTime<Utc>,
}

/// Adapter call about to be made.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub provider: ProviderId,
    pub query: String,
    pub account: Option<String>,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OutcomeEvent {
    pub provider: ProviderId,
    pub query: String,
    pub status: LookupStatus,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub provider: ProviderId,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CooldownEvent {
    pub provider: ProviderId,
    pub account: String,
    pub cooldown: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BrowserEvent {
    pub provider: ProviderId,
    pub attempt: u32,
    pub phase: SearchPhase,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub provider: ProviderId,
    pub query: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum LookupEvent {
    CacheHit(CacheHitEvent),
    Dispatch(DispatchEvent),
    Outcome(OutcomeEvent),
    Retry(RetryEvent),
    AccountCooldown(CooldownEvent),
    Browser(BrowserEvent),
    Error(ErrorEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &LookupEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: LookupEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }

    pub fn browser_phase(&self, provider: ProviderId, attempt: u32, phase: SearchPhase) {
        self.dispatch(LookupEvent::Browser(BrowserEvent {
            provider,
            attempt,
            phase,
            timestamp: Utc::now(),
        }));
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &LookupEvent) {
        match event {
            LookupEvent::CacheHit(hit) => {
                log::debug!("cache hit {} {}", hit.provider, hit.query);
            }
            LookupEvent::Dispatch(dispatch) => {
                log::debug!(
                    "-> {} {} attempt {} (account {})",
                    dispatch.provider,
                    dispatch.query,
                    dispatch.attempt,
                    dispatch.account.as_deref().unwrap_or("-")
                );
            }
            LookupEvent::Outcome(outcome) => {
                log::info!(
                    "<- {} {} -> {} ({:.2}s)",
                    outcome.provider,
                    outcome.query,
                    outcome.status.as_str(),
                    outcome.latency.as_secs_f64()
                );
            }
            LookupEvent::Retry(retry) => {
                log::info!(
                    "retry {} attempt {} after {:.2}s: {}",
                    retry.provider,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            LookupEvent::AccountCooldown(cooldown) => {
                log::warn!(
                    "{} account {} cooling down for {}s",
                    cooldown.provider,
                    cooldown.account,
                    cooldown.cooldown.as_secs()
                );
            }
            LookupEvent::Browser(browser) => {
                log::debug!("{} browser attempt {} -> {:?}", browser.provider, browser.attempt, browser.phase);
            }
            LookupEvent::Error(error) => {
                log::warn!("{} {} failed: {}", error.provider, error.query, error.error);
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &LookupEvent) {
        match event {
            LookupEvent::Outcome(outcome) => {
                self.metrics
                    .record_outcome(outcome.provider, outcome.status, outcome.latency);
            }
            LookupEvent::CacheHit(hit) => {
                self.metrics.record_cache_hit(hit.provider);
            }
            LookupEvent::Retry(retry) => {
                self.metrics.record_retry(retry.provider);
            }
            _ => {}
        }
    }
}
