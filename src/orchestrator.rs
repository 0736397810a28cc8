//! High level lookup orchestration.
//!
//! Wires the shared services (HTTP pool, result cache, rate limiters,
//! browser session, event bus) to the registered provider adapters and
//! exposes one `lookup` per provider and query. Every failure inside a
//! lookup is folded into the returned record; nothing escapes as a panic or
//! an `Err`.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use url::Url;

use crate::browser::{BrowserSession, DriverLauncher};
use crate::config::EngineConfig;
use crate::external_deps::captcha::{CapSolverProvider, CaptchaProvider, TwoCaptchaProvider};
use crate::fanout::fan_out;
use crate::modules::accounts::{Account, AccountHealthReport, AccountPool};
use crate::modules::cache::ResultCache;
use crate::modules::events::{
	CacheHitEvent, CooldownEvent, DispatchEvent, ErrorEvent, EventDispatcher, EventHandler,
	LoggingHandler, LookupEvent, MetricsHandler, OutcomeEvent, RetryEvent,
};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::modules::pool::{HttpPool, PoolError};
use crate::modules::rate_limit::RateLimiterRegistry;
use crate::normalizer::extract::unescape_url;
use crate::normalizer::{self, LookupResult, LookupStatus, NormalizerRules};
use crate::sources::{
	FetchContext, GetContactSource, InstagramSource, LookupSource, NotFoundKind, ProviderId,
	Query, QueryError, SourceError, default_photo_headers,
};

/// Per-photo deadline in `download_photos`.
const PHOTO_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure of one lookup. Folded into a [`LookupResult`] with
/// [`LookupStatus::Error`] before it reaches the caller.
#[derive(Debug, Error)]
pub enum LookupError {
	#[error("invalid query: {0}")]
	Query(#[from] QueryError),
	#[error("no source registered for {0}")]
	NoSource(ProviderId),
	#[error("http pool unavailable: {0}")]
	Pool(#[from] PoolError),
	#[error("all {accounts} {provider} account(s) failed or are cooling down")]
	AccountsExhausted { provider: ProviderId, accounts: usize },
	#[error("{0}")]
	Source(#[from] SourceError),
}

#[derive(Debug, Error)]
pub enum BuildError {
	#[error("source {0} registered twice")]
	DuplicateSource(ProviderId),
	#[error("{0} needs a browser launcher")]
	MissingBrowser(ProviderId),
}

/// Solver service named by API key, built with the engine's captcha config.
enum SolverKey {
	CapSolver(String),
	TwoCaptcha(String),
}

/// Fluent builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
	config: EngineConfig,
	sources: Vec<Arc<dyn LookupSource>>,
	instagram: Option<InstagramSource>,
	getcontact: Option<Option<AccountPool>>,
	launcher: Option<Arc<dyn DriverLauncher>>,
	captcha_provider: Option<Arc<dyn CaptchaProvider>>,
	solver_key: Option<SolverKey>,
	handlers: Vec<Arc<dyn EventHandler>>,
	enable_metrics: bool,
}

impl OrchestratorBuilder {
	pub fn new() -> Self {
		Self {
			config: EngineConfig::default(),
			sources: Vec::new(),
			instagram: None,
			getcontact: None,
			launcher: None,
			captcha_provider: None,
			solver_key: None,
			handlers: Vec::new(),
			enable_metrics: true,
		}
	}

	pub fn with_config(mut self, config: EngineConfig) -> Self {
		self.config = config;
		self
	}

	/// Register a ready-made adapter.
	pub fn with_source(mut self, source: Arc<dyn LookupSource>) -> Self {
		self.sources.push(source);
		self
	}

	/// Instagram adapter; it gets the browser session when a launcher is set.
	pub fn with_instagram(mut self, source: InstagramSource) -> Self {
		self.instagram = Some(source);
		self
	}

	/// GetContact search through the browser session, optionally with
	/// logged-in accounts.
	pub fn with_getcontact(mut self, accounts: Option<AccountPool>) -> Self {
		self.getcontact = Some(accounts);
		self
	}

	pub fn with_browser_launcher(mut self, launcher: Arc<dyn DriverLauncher>) -> Self {
		self.launcher = Some(launcher);
		self
	}

	pub fn with_captcha_provider(mut self, provider: Arc<dyn CaptchaProvider>) -> Self {
		self.captcha_provider = Some(provider);
		self
	}

	pub fn with_capsolver_key(mut self, api_key: impl Into<String>) -> Self {
		self.solver_key = Some(SolverKey::CapSolver(api_key.into()));
		self
	}

	pub fn with_twocaptcha_key(mut self, api_key: impl Into<String>) -> Self {
		self.solver_key = Some(SolverKey::TwoCaptcha(api_key.into()));
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.enable_metrics = false;
		self
	}

	pub fn build(self) -> Result<Orchestrator, BuildError> {
		let rules = Arc::new(self.config.rules.clone());
		let captcha = self.config.captcha.clone();
		let solver: Option<Arc<dyn CaptchaProvider>> = match self.solver_key {
			Some(SolverKey::CapSolver(key)) => Some(Arc::new(CapSolverProvider::with_config(key, captcha))),
			Some(SolverKey::TwoCaptcha(key)) => Some(Arc::new(TwoCaptchaProvider::with_config(key, captcha))),
			None => self.captcha_provider,
		};
		let browser = self
			.launcher
			.map(|launcher| BrowserSession::new(launcher, self.config.browser.clone()));

		let mut sources = self.sources;
		if let Some(mut instagram) = self.instagram {
			if let Some(session) = &browser {
				instagram = instagram.with_browser(Arc::clone(session));
			}
			sources.push(Arc::new(instagram));
		}
		if let Some(accounts) = self.getcontact {
			let session = browser
				.as_ref()
				.ok_or(BuildError::MissingBrowser(ProviderId::GetContact))?;
			let mut source = GetContactSource::new(Arc::clone(session), Arc::clone(&rules));
			if let Some(solver) = solver {
				source = source.with_solver(solver);
			}
			if let Some(accounts) = accounts {
				source = source.with_accounts(accounts);
			}
			sources.push(Arc::new(source));
		}

		let mut registry: BTreeMap<ProviderId, Arc<dyn LookupSource>> = BTreeMap::new();
		for source in sources {
			let provider = source.provider();
			if registry.insert(provider, source).is_some() {
				return Err(BuildError::DuplicateSource(provider));
			}
		}

		let metrics = self.enable_metrics.then(MetricsCollector::new);
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		for handler in self.handlers {
			events.register_handler(handler);
		}

		let config = self.config;
		Ok(Orchestrator {
			http: HttpPool::new(config.pool.clone()),
			results: ResultCache::new(config.cache.clone()),
			calls: Arc::new(ResultCache::new(config.cache.clone())),
			limiters: RateLimiterRegistry::new(&config.rate_limits),
			sources: registry,
			rules,
			browser,
			metrics,
			events: Arc::new(events),
			config,
		})
	}
}

impl Default for OrchestratorBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Main lookup engine. Shared by reference between concurrent lookups.
pub struct Orchestrator {
	config: EngineConfig,
	rules: Arc<NormalizerRules>,
	sources: BTreeMap<ProviderId, Arc<dyn LookupSource>>,
	http: HttpPool,
	results: ResultCache<LookupResult>,
	calls: Arc<ResultCache<Value>>,
	limiters: RateLimiterRegistry,
	browser: Option<Arc<BrowserSession>>,
	metrics: Option<MetricsCollector>,
	events: Arc<EventDispatcher>,
}

impl std::fmt::Debug for Orchestrator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Orchestrator")
			.field("sources", &self.sources.keys().collect::<Vec<_>>())
			.field("browser", &self.browser.is_some())
			.finish()
	}
}

impl Orchestrator {
	pub fn builder() -> OrchestratorBuilder {
		OrchestratorBuilder::new()
	}

	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	pub fn providers(&self) -> Vec<ProviderId> {
		self.sources.keys().copied().collect()
	}

	/// The shared browser session, when a launcher was configured.
	pub fn browser(&self) -> Option<&Arc<BrowserSession>> {
		self.browser.as_ref()
	}

	pub fn metrics(&self) -> Option<MetricsSnapshot> {
		self.metrics.as_ref().map(MetricsCollector::snapshot)
	}

	/// Account pool health per provider that rotates credentials.
	pub fn account_health(&self) -> BTreeMap<ProviderId, AccountHealthReport> {
		self.sources
			.iter()
			.filter_map(|(provider, source)| {
				source.accounts().map(|pool| (*provider, pool.health_report()))
			})
			.collect()
	}

	/// Normalize `raw` the way `provider` expects and look it up.
	pub async fn lookup_raw(&self, provider: ProviderId, raw: &str) -> LookupResult {
		let Some(source) = self.sources.get(&provider) else {
			return self.fail(provider, raw.trim(), LookupError::NoSource(provider));
		};
		match source.normalize(raw) {
			Ok(query) => self.lookup(provider, &query).await,
			Err(err) => self.fail(provider, raw.trim(), err.into()),
		}
	}

	/// Look `query` up with one provider.
	pub async fn lookup(&self, provider: ProviderId, query: &Query) -> LookupResult {
		let id = query.normalized_id();
		let Some(source) = self.sources.get(&provider) else {
			return self.fail(provider, id, LookupError::NoSource(provider));
		};
		if query.kind() != provider.query_kind() {
			let err = QueryError::UnsupportedKind {
				provider,
				kind: query.kind(),
			};
			return self.fail(provider, id, err.into());
		}

		let key = ResultCache::<LookupResult>::key(provider.as_str(), &[id]);
		let ttl = self.config.ttl.for_provider(provider);
		if let Some(hit) = self.results.get(&key, ttl).await {
			self.events.dispatch(LookupEvent::CacheHit(CacheHitEvent {
				provider,
				query: id.to_string(),
				timestamp: Utc::now(),
			}));
			return hit;
		}

		let started = Instant::now();
		let result = match self.run(source.as_ref(), query).await {
			Ok(result) => result,
			Err(err) => self.fail(provider, id, err),
		};

		// Errors and the not-yet-ready placeholder stay uncached.
		if !matches!(result.status, LookupStatus::Error | LookupStatus::Unavailable) {
			self.results.insert(key, result.clone(), ttl).await;
		}
		self.events.dispatch(LookupEvent::Outcome(OutcomeEvent {
			provider,
			query: id.to_string(),
			status: result.status,
			latency: started.elapsed(),
			timestamp: Utc::now(),
		}));
		result
	}

	/// Run `query` against every registered provider accepting its kind.
	pub async fn lookup_all(&self, query: &Query) -> Vec<LookupResult> {
		let providers: Vec<ProviderId> = self
			.sources
			.keys()
			.copied()
			.filter(|provider| provider.query_kind() == query.kind())
			.collect();
		fan_out(
			providers,
			|provider| async move { Ok::<_, Infallible>(self.lookup(provider, query).await) },
			self.config.fan_out_limit(),
			self.config.lookup_timeout(),
		)
		.await
	}

	fn fail(&self, provider: ProviderId, id: &str, err: LookupError) -> LookupResult {
		log::warn!("{provider} lookup for {id} failed: {err}");
		self.events.dispatch(LookupEvent::Error(ErrorEvent {
			provider,
			query: id.to_string(),
			error: err.to_string(),
			timestamp: Utc::now(),
		}));
		LookupResult::error(provider, id, err.to_string())
	}

	fn cool_down(&self, provider: ProviderId, pool: &AccountPool, account: &Account) {
		pool.cool_down(account);
		self.events.dispatch(LookupEvent::AccountCooldown(CooldownEvent {
			provider,
			account: account.identifier.clone(),
			cooldown: pool.cooldown(),
			timestamp: Utc::now(),
		}));
	}

	/// Adapter attempts with account rotation and transient retries.
	async fn run(&self, source: &dyn LookupSource, query: &Query) -> Result<LookupResult, LookupError> {
		let provider = source.provider();
		let id = query.normalized_id();
		let http = self.http.acquire_session().await?;
		let accounts = source.accounts().filter(|pool| !pool.is_empty());
		let max_rotations = accounts.map_or(1, AccountPool::len);
		let max_retries = source
			.transient_retries()
			.unwrap_or(self.config.retry.transient_retries);

		let mut rotations = 0;
		let mut retries = 0;
		let mut attempt = 0;
		loop {
			let account = match accounts {
				Some(pool) => Some(pool.next_account().ok_or(LookupError::AccountsExhausted {
					provider,
					accounts: pool.len(),
				})?),
				None => None,
			};
			attempt += 1;

			self.limiters.acquire(provider).await;
			self.events.dispatch(LookupEvent::Dispatch(DispatchEvent {
				provider,
				query: id.to_string(),
				account: account.as_ref().map(|account| account.identifier.clone()),
				attempt,
				timestamp: Utc::now(),
			}));

			let ctx = FetchContext::new(
				http.clone(),
				account.clone(),
				Arc::clone(&self.calls),
				Arc::clone(&self.events),
			);
			let err = match source.fetch(query, &ctx).await {
				Ok(raw) => {
					if let (Some(pool), Some(account)) = (accounts, &account) {
						match ctx.take_rejection() {
							Some(reason) => {
								log::info!("{provider} account {} rejected: {reason}", account.identifier);
								self.cool_down(provider, pool, account);
							}
							None => pool.report_success(account),
						}
					}
					return Ok(normalizer::normalize(provider, id, raw, &self.rules));
				}
				Err(err) => err,
			};

			match err {
				SourceError::NotFound(NotFoundKind::Missing) => {
					return Ok(LookupResult::terminal(provider, id, LookupStatus::NotFound));
				}
				SourceError::NotFound(NotFoundKind::Private) => {
					return Ok(LookupResult::terminal(provider, id, LookupStatus::Hidden));
				}
				SourceError::AuthFailure(reason) => {
					let (Some(pool), Some(account)) = (accounts, account) else {
						return Err(SourceError::AuthFailure(reason).into());
					};
					self.cool_down(provider, pool, &account);
					rotations += 1;
					if rotations >= max_rotations {
						return Err(LookupError::AccountsExhausted {
							provider,
							accounts: pool.len(),
						});
					}
				}
				err if err.is_retryable() && retries < max_retries => {
					retries += 1;
					let mut delay = self.config.retry.backoff(retries);
					if matches!(err, SourceError::RateLimited)
						&& let Some(limiter) = self.limiters.get(provider)
					{
						delay = delay.max(limiter.config().period());
					}
					self.events.dispatch(LookupEvent::Retry(RetryEvent {
						provider,
						attempt: attempt + 1,
						reason: err.to_string(),
						scheduled_after: delay,
						timestamp: Utc::now(),
					}));
					sleep(delay).await;
				}
				err => return Err(err.into()),
			}
		}
	}

	/// Fetch one photo with the context of the provider owning its host.
	/// `None` on any failure.
	pub async fn download_photo(&self, url: &str) -> Option<Bytes> {
		let url = match Url::parse(unescape_url(url.trim()).as_str()) {
			Ok(url) => url,
			Err(err) => {
				log::debug!("not downloading '{url}': {err}");
				return None;
			}
		};
		let source = self.sources.values().find(|source| source.owns_url(&url));
		let headers = match source {
			Some(source) => {
				let account = source.accounts().and_then(AccountPool::any_account);
				source.photo_headers(&url, account.as_ref())
			}
			None => default_photo_headers(None, None),
		};

		let http = match self.http.acquire_session().await {
			Ok(http) => http,
			Err(err) => {
				log::warn!("http pool unavailable for download: {err}");
				return None;
			}
		};
		let body = http.download(&url, headers).await?;

		let min_bytes = source.map_or(0, |source| source.min_photo_bytes());
		if min_bytes > 0 && body.len() <= min_bytes {
			log::debug!("discarding {} byte body from {url}", body.len());
			return None;
		}
		Some(body)
	}

	/// Download in parallel; failed URLs are left out, order is kept.
	pub async fn download_photos(&self, urls: &[String], max_concurrency: usize) -> Vec<(String, Bytes)> {
		fan_out(
			urls.iter().cloned(),
			|url| async move {
				match self.download_photo(&url).await {
					Some(body) => Ok((url, body)),
					None => Err(format!("download of {url} failed")),
				}
			},
			max_concurrency,
			PHOTO_TIMEOUT,
		)
		.await
	}

	/// Close the HTTP pool, stop the browser and let adapters release
	/// their resources.
	pub async fn shutdown(&self) {
		for source in self.sources.values() {
			source.shutdown().await;
		}
		if let Some(browser) = &self.browser {
			browser.shutdown().await;
		}
		self.http.close().await;
		self.results.clear().await;
		self.calls.clear().await;
		log::info!("orchestrator shut down");
	}
}
