//! Process-wide HTTP connection pool.
//!
//! One long-lived `reqwest::Client` shared by every adapter. The client is
//! built lazily under a lock and rebuilt after [`HttpPool::close`]. Total and
//! per-host concurrency are bounded with semaphores since reqwest only caps
//! idle connections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use url::Url;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Connection pool bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_connections_per_host: usize,
    /// Idle sockets (and the addresses they resolved) are dropped after this.
    pub dns_cache_secs: u64,
    pub connect_timeout_secs: u64,
    pub total_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_connections_per_host: 10,
            dns_cache_secs: 300,
            connect_timeout_secs: 10,
            total_timeout_secs: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to build http client: {0}")]
    Build(#[from] reqwest::Error),
    #[error("invalid default header: {0}")]
    InvalidHeader(String),
}

/// Shared HTTP pool service.
#[derive(Debug)]
pub struct HttpPool {
    config: PoolConfig,
    session: Mutex<Option<HttpSession>>,
}

impl HttpPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Return the live session, creating it on first use or after a close.
    pub async fn acquire_session(&self) -> Result<HttpSession, PoolError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }

        let session = HttpSession::build(&self.config)?;
        log::debug!(
            "http pool created (max={}, per_host={})",
            self.config.max_connections,
            self.config.max_connections_per_host
        );
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Drop the shared client. Sessions already handed out keep working
    /// until their last clone is gone.
    pub async fn close(&self) {
        let mut guard = self.session.lock().await;
        if guard.take().is_some() {
            log::debug!("http pool closed");
        }
    }

    pub async fn is_open(&self) -> bool {
        self.session.lock().await.is_some()
    }
}

impl Default for HttpPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// Cheaply clonable handle onto the pooled client.
#[derive(Debug, Clone)]
pub struct HttpSession {
    client: Client,
    total: Arc<Semaphore>,
    per_host: Arc<StdMutex<HashMap<String, Arc<Semaphore>>>>,
    per_host_limit: usize,
}

impl HttpSession {
    fn build(config: &PoolConfig) -> Result<Self, PoolError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|_| PoolError::InvalidHeader("user-agent".into()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .pool_max_idle_per_host(config.max_connections_per_host)
            .pool_idle_timeout(Duration::from_secs(config.dns_cache_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.total_timeout_secs))
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            total: Arc::new(Semaphore::new(config.max_connections.max(1))),
            per_host: Arc::new(StdMutex::new(HashMap::new())),
            per_host_limit: config.max_connections_per_host.max(1),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.client.get(url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.client.post(url)
    }

    /// Send a request while holding a total and a per-host connection slot.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, reqwest::Error> {
        let built = request.build()?;
        let host = built.url().host_str().unwrap_or_default().to_string();
        let _permits = self.permits(&host).await;
        self.client.execute(built).await
    }

    async fn permits(&self, host: &str) -> Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
        let host_gate = {
            let mut map = self.per_host.lock().ok()?;
            map.entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
                .clone()
        };
        let total = self.total.clone().acquire_owned().await.ok()?;
        let host = host_gate.acquire_owned().await.ok()?;
        Some((total, host))
    }

    /// Download a binary body, `None` for anything but a 200.
    pub async fn download(&self, url: &Url, headers: HeaderMap) -> Option<bytes::Bytes> {
        let request = self.client.get(url.as_str()).headers(headers);
        match self.send(request).await {
            Ok(resp) if resp.status().as_u16() == 200 => resp.bytes().await.ok(),
            Ok(resp) => {
                log::debug!("download {} -> {}", url, resp.status());
                None
            }
            Err(err) => {
                log::warn!("download {} failed: {}", url, err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_is_reused_until_closed() {
        let pool = HttpPool::default();
        assert!(!pool.is_open().await);

        let first = pool.acquire_session().await.unwrap();
        let second = pool.acquire_session().await.unwrap();
        assert!(Arc::ptr_eq(&first.total, &second.total));

        pool.close().await;
        assert!(!pool.is_open().await);

        let third = pool.acquire_session().await.unwrap();
        assert!(!Arc::ptr_eq(&first.total, &third.total));
    }

    #[tokio::test]
    async fn per_host_gates_are_shared() {
        let pool = HttpPool::new(PoolConfig {
            max_connections_per_host: 2,
            ..Default::default()
        });
        let session = pool.acquire_session().await.unwrap();
        let held = session.permits("example.com").await.unwrap();
        let gate = session.per_host.lock().unwrap().get("example.com").cloned().unwrap();
        assert_eq!(gate.available_permits(), 1);
        drop(held);
        assert_eq!(gate.available_permits(), 2);
    }
}
