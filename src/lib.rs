//! # lookup-orchestrator
//!
//! Identity lookups across heterogeneous providers behind one call.
//!
//! A phone number or a profile handle goes in, a canonical
//! [`LookupResult`] comes out. Providers answer through very different
//! channels (token REST APIs, cookie-bound private web APIs, pages that only
//! render in a real browser); the engine hides that behind shared services:
//!
//! - one pooled HTTP client with global and per-host connection caps
//! - a TTL result cache and per-provider sliding-window rate limiters
//! - rotating account pools with cooldown after auth failures
//! - a single browser session driving the search state machine, with
//!   CAPTCHA solving through an external service
//! - a normalizer that repairs mojibake, classifies status and spam, and
//!   merges photo sets
//!
//! Failures never escape a lookup: they come back as a record with
//! [`LookupStatus::Error`] and a short diagnostic.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lookup_orchestrator::{Orchestrator, ProviderId, VkSource, WhoCallsSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Orchestrator::builder()
//!         .with_source(Arc::new(VkSource::new(["vk-access-token"])))
//!         .with_source(Arc::new(WhoCallsSource::new()))
//!         .build()?;
//!
//!     let result = engine.lookup_raw(ProviderId::WhoCalls, "8 (916) 123-45-67").await;
//!     println!("{:?}: {:?}", result.status, result.display_name);
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

mod orchestrator;

pub mod browser;
pub mod config;
pub mod external_deps;
pub mod fanout;
pub mod modules;
pub mod normalizer;
pub mod sources;

pub use crate::orchestrator::{BuildError, LookupError, Orchestrator, OrchestratorBuilder};

pub use crate::config::{ConfigError, EngineConfig, RetryConfig, TtlConfig};

pub use crate::browser::{
    BrowserConfig,
    BrowserCookie,
    BrowserDriver,
    BrowserSession,
    DriverError,
    DriverLauncher,
    PageSnapshot,
    SearchMachine,
    SearchPhase,
    SearchReport,
};

#[cfg(feature = "chromium")]
pub use crate::browser::{ChromiumDriver, ChromiumLauncher};

pub use crate::external_deps::captcha::{
    CapSolverProvider,
    CaptchaConfig,
    CaptchaError,
    CaptchaKind,
    CaptchaProvider,
    CaptchaSolution,
    CaptchaTask,
    TwoCaptchaProvider,
};

pub use crate::fanout::{GroupOutcome, MergedPhotos, PhotoGroup, fan_out, merge_photo_groups};

pub use crate::modules::{
    Account,
    AccountHealthReport,
    AccountPool,
    CacheConfig,
    EventDispatcher,
    EventHandler,
    HttpPool,
    HttpSession,
    LoggingHandler,
    LookupEvent,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    PoolConfig,
    PoolError,
    ProviderStats,
    RateLimitConfig,
    RateLimiter,
    ResultCache,
};

pub use crate::normalizer::{
    LookupResult,
    LookupStatus,
    NormalizerRules,
    PhotoKind,
    PhotoRef,
    ProfileDetails,
    normalize,
};

pub use crate::sources::{
    FetchContext,
    GetContactSource,
    InstagramSource,
    LookupSource,
    NotFoundKind,
    ProviderId,
    Query,
    QueryError,
    QueryKind,
    RawPayload,
    SourceError,
    VkSource,
    WhatsAppSource,
    WhoCallsSource,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
