//! The process-wide browser session.
//!
//! Created lazily on the first lease, torn down on idle timeout or explicit
//! shutdown. A lease holds the session mutex, so at most one browser call
//! sequence is in flight at a time.

use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{BrowserConfig, BrowserDriver, DriverError, DriverLauncher, timed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Ready,
    Busy,
}

struct SessionInner {
    driver: Option<Box<dyn BrowserDriver>>,
    last_used_at: Option<Instant>,
}

/// Singleton browser service, shared behind an `Arc`.
pub struct BrowserSession {
    launcher: Arc<dyn DriverLauncher>,
    config: BrowserConfig,
    inner: Arc<Mutex<SessionInner>>,
    state: StdMutex<SessionState>,
}

impl std::fmt::Debug for BrowserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserSession")
            .field("state", &self.state())
            .field("home_url", &self.config.home_url)
            .finish()
    }
}

impl BrowserSession {
    pub fn new(launcher: Arc<dyn DriverLauncher>, config: BrowserConfig) -> Arc<Self> {
        Arc::new(Self {
            launcher,
            config,
            inner: Arc::new(Mutex::new(SessionInner {
                driver: None,
                last_used_at: None,
            })),
            state: StdMutex::new(SessionState::Stopped),
        })
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Exclusive access to a running driver, launching one if needed.
    pub async fn lease(self: &Arc<Self>) -> Result<BrowserLease, DriverError> {
        let mut guard = self.inner.clone().lock_owned().await;

        if guard.driver.is_some() && self.is_idle(&guard) {
            log::info!("browser idle for over {:?}, restarting", self.config.idle_timeout());
            self.stop_driver(&mut guard).await;
        }

        if guard.driver.is_none() {
            self.set_state(SessionState::Starting);
            match timed(self.config.call_timeout(), "launch", self.launcher.launch(&self.config)).await {
                Ok(driver) => {
                    log::info!("browser started (headless={})", self.config.headless);
                    guard.driver = Some(driver);
                }
                Err(err) => {
                    self.set_state(SessionState::Stopped);
                    return Err(err);
                }
            }
        }

        self.set_state(SessionState::Busy);
        Ok(BrowserLease {
            guard,
            session: Arc::clone(self),
        })
    }

    fn is_idle(&self, inner: &SessionInner) -> bool {
        inner
            .last_used_at
            .is_some_and(|at| at.elapsed() >= self.config.idle_timeout())
    }

    async fn stop_driver(&self, inner: &mut SessionInner) {
        if let Some(mut driver) = inner.driver.take() {
            if let Err(err) = timed(self.config.call_timeout(), "shutdown", driver.shutdown()).await {
                log::warn!("browser shutdown failed: {err}");
            }
        }
        inner.last_used_at = None;
        self.set_state(SessionState::Stopped);
    }

    /// Tear the browser down if it has been idle for the configured timeout.
    /// Returns whether it was stopped. A busy session is left alone.
    pub async fn reap_idle(&self) -> bool {
        let Ok(mut guard) = self.inner.try_lock() else {
            return false;
        };
        if guard.driver.is_some() && self.is_idle(&guard) {
            log::info!("reaping idle browser");
            self.stop_driver(&mut guard).await;
            return true;
        }
        false
    }

    /// Background task calling [`BrowserSession::reap_idle`] periodically.
    /// Ends once the session is dropped.
    pub fn spawn_idle_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = (self.config.idle_timeout() / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.reap_idle().await;
            }
        })
    }

    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        self.stop_driver(&mut guard).await;
        log::info!("browser session shut down");
    }
}

/// Exclusive handle onto the running driver. Dropping it marks the session
/// ready and stamps its last use.
pub struct BrowserLease {
    guard: OwnedMutexGuard<SessionInner>,
    session: Arc<BrowserSession>,
}

impl BrowserLease {
    pub fn driver(&mut self) -> Result<&mut (dyn BrowserDriver + 'static), DriverError> {
        self.guard
            .driver
            .as_deref_mut()
            .ok_or_else(|| DriverError::Unavailable("browser not running".into()))
    }

    pub fn call_timeout(&self) -> Duration {
        self.session.config.call_timeout()
    }

    /// Stop the browser; the next lease starts a fresh one.
    pub async fn discard(mut self) {
        self.session.stop_driver(&mut self.guard).await;
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        if self.guard.driver.is_some() {
            self.guard.last_used_at = Some(Instant::now());
            self.session.set_state(SessionState::Ready);
        } else {
            self.session.set_state(SessionState::Stopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserCookie, PageSnapshot};
    use crate::external_deps::captcha::CaptchaKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullDriver {
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrowserDriver for NullDriver {
        async fn navigate(&mut self, _url: &str) -> Result<(), DriverError> {
            Ok(())
        }
        async fn dismiss_overlays(&mut self, _selectors: &[String]) -> Result<bool, DriverError> {
            Ok(false)
        }
        async fn focus_input(&mut self, _selectors: &[String]) -> Result<(), DriverError> {
            Ok(())
        }
        async fn type_char(&mut self, _c: char) -> Result<(), DriverError> {
            Ok(())
        }
        async fn submit(&mut self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn snapshot(&mut self) -> Result<PageSnapshot, DriverError> {
            Ok(PageSnapshot::default())
        }
        async fn inject_captcha_solution(&mut self, _kind: CaptchaKind, _token: &str) -> Result<(), DriverError> {
            Ok(())
        }
        async fn set_cookies(&mut self, _cookies: &[BrowserCookie]) -> Result<(), DriverError> {
            Ok(())
        }
        async fn scroll(&mut self, _times: u32) -> Result<(), DriverError> {
            Ok(())
        }
        async fn shutdown(&mut self) -> Result<(), DriverError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingLauncher {
        launches: AtomicUsize,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DriverLauncher for CountingLauncher {
        async fn launch(&self, _config: &BrowserConfig) -> Result<Box<dyn BrowserDriver>, DriverError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullDriver {
                shutdowns: self.shutdowns.clone(),
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn session_is_launched_once_and_reused() {
        let launcher = Arc::new(CountingLauncher::default());
        let session = BrowserSession::new(launcher.clone(), BrowserConfig::default());
        assert_eq!(session.state(), SessionState::Stopped);

        {
            let mut lease = session.lease().await.unwrap();
            assert!(lease.driver().is_ok());
            assert_eq!(session.state(), SessionState::Busy);
        }
        assert_eq!(session.state(), SessionState::Ready);
        drop(session.lease().await.unwrap());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_reaped() {
        let launcher = Arc::new(CountingLauncher::default());
        let config = BrowserConfig {
            idle_timeout_secs: 300,
            ..Default::default()
        };
        let session = BrowserSession::new(launcher.clone(), config);
        drop(session.lease().await.unwrap());

        assert!(!session.reap_idle().await);
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(session.reap_idle().await);
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(launcher.shutdowns.load(Ordering::SeqCst), 1);

        drop(session.lease().await.unwrap());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn discarded_lease_forces_relaunch() {
        let launcher = Arc::new(CountingLauncher::default());
        let session = BrowserSession::new(launcher.clone(), BrowserConfig::default());
        session.lease().await.unwrap().discard().await;
        assert_eq!(session.state(), SessionState::Stopped);
        drop(session.lease().await.unwrap());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }
}
