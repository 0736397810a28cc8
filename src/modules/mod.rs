//! Shared services module
//!
//! Connection pool, result cache, rate limiting, account rotation, events
//! and metrics. Every service is an explicit object owned by the
//! orchestrator and handed to the adapters that need it.

pub mod accounts;
pub mod cache;
pub mod events;
pub mod metrics;
pub mod pool;
pub mod rate_limit;

// Re-export commonly used types
pub use accounts::{Account, AccountHealthReport, AccountParseError, AccountPool, AccountStats};
pub use cache::{CacheConfig, ResultCache};
pub use events::{
    BrowserEvent, CacheHitEvent, CooldownEvent, DispatchEvent, ErrorEvent, EventDispatcher,
    EventHandler, LoggingHandler, LookupEvent, MetricsHandler, OutcomeEvent, RetryEvent,
};
pub use metrics::{GlobalStats, MetricsCollector, MetricsSnapshot, ProviderStats};
pub use pool::{HttpPool, HttpSession, PoolConfig, PoolError};
pub use rate_limit::{RateLimitConfig, RateLimiter, RateLimiterRegistry};
