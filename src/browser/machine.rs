//! Search protocol driven through the browser session.
//!
//! One attempt: lease the session, open the home page, dismiss banners, type
//! the query key by key, submit, deal with a captcha if the page shows one,
//! then classify the page. A transient placeholder loops back for another
//! attempt; everything else is terminal. Attempts are bounded by
//! `max_retries`.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use super::{BrowserCookie, BrowserDriver, BrowserSession, DriverError, PageSnapshot, detect_captcha, timed};
use crate::external_deps::captcha::{CaptchaProvider, CaptchaTask};
use crate::modules::events::EventDispatcher;
use crate::normalizer::{self, LookupStatus, NormalizerRules};
use crate::sources::core::timing::{AttemptFeedback, Pacing};
use crate::sources::{FetchResult, ProviderId, RawPayload, SourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchPhase {
    Idle,
    Starting,
    Ready,
    Searching,
    CaptchaPending,
    Parsing,
    Terminal,
    RetryLoop,
}

/// Outcome of a full search run.
#[derive(Debug)]
pub struct SearchReport {
    pub outcome: FetchResult<PageSnapshot>,
    pub attempts: u32,
    pub trace: Vec<SearchPhase>,
}

enum AttemptError {
    /// Browser misbehaved; the session is restarted before the next attempt.
    Driver(DriverError),
    /// Captcha could not be cleared this time.
    Captcha(String),
    /// Captcha shown and nobody to solve it.
    CaptchaRequired,
}

impl From<DriverError> for AttemptError {
    fn from(err: DriverError) -> Self {
        AttemptError::Driver(err)
    }
}

enum Verdict {
    Done(PageSnapshot),
    NotReady(PageSnapshot),
}

pub struct SearchMachine {
    session: Arc<BrowserSession>,
    rules: Arc<NormalizerRules>,
    provider: ProviderId,
    solver: Option<Arc<dyn CaptchaProvider>>,
    events: Option<Arc<EventDispatcher>>,
    cookies: Vec<BrowserCookie>,
    keystrokes: Pacing,
    between_attempts: Pacing,
    trace: Vec<SearchPhase>,
}

impl SearchMachine {
    pub fn new(session: Arc<BrowserSession>, rules: Arc<NormalizerRules>, provider: ProviderId) -> Self {
        let config = session.config();
        let keystroke = config.keystroke_delay();
        let keystrokes = Pacing::new(keystroke).with_bounds(keystroke / 2, keystroke * 2);
        let between_attempts = Pacing::new(config.attempt_delay()).with_variance(0.2);
        Self {
            session,
            rules,
            provider,
            solver: None,
            events: None,
            cookies: Vec::new(),
            keystrokes,
            between_attempts,
            trace: vec![SearchPhase::Idle],
        }
    }

    pub fn with_solver(mut self, solver: Option<Arc<dyn CaptchaProvider>>) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Cookies installed in the browser before each attempt.
    pub fn with_cookies(mut self, cookies: Vec<BrowserCookie>) -> Self {
        self.cookies = cookies;
        self
    }

    fn enter(&mut self, attempt: u32, phase: SearchPhase) {
        self.trace.push(phase);
        if let Some(events) = &self.events {
            events.browser_phase(self.provider, attempt, phase);
        }
    }

    /// Run the search for `query` until a terminal page or the retry bound.
    pub async fn run(mut self, query: String) -> SearchReport {
        let max_attempts = self.session.config().max_retries.max(1);
        let mut last_error: Option<String> = None;
        let mut last_pending: Option<PageSnapshot> = None;
        let mut attempts = 0;

        while attempts < max_attempts {
            attempts += 1;
            match self.attempt(attempts, &query).await {
                Ok(Verdict::Done(page)) => {
                    self.enter(attempts, SearchPhase::Terminal);
                    return self.report(Ok(page), attempts);
                }
                Ok(Verdict::NotReady(page)) => {
                    log::info!("{} search for {query}: result not ready (attempt {attempts})", self.provider);
                    self.between_attempts.register(AttemptFeedback::NotReady);
                    last_pending = Some(page);
                }
                Err(AttemptError::CaptchaRequired) => {
                    self.enter(attempts, SearchPhase::Terminal);
                    return self.report(Err(SourceError::CaptchaRequired), attempts);
                }
                Err(AttemptError::Captcha(reason)) => {
                    log::warn!("{} captcha not cleared (attempt {attempts}): {reason}", self.provider);
                    self.between_attempts.register(AttemptFeedback::Failure);
                    last_error = Some(reason);
                }
                Err(AttemptError::Driver(err)) => {
                    log::warn!("{} browser attempt {attempts} failed: {err}", self.provider);
                    self.between_attempts.register(AttemptFeedback::Failure);
                    last_error = Some(err.to_string());
                }
            }

            if attempts < max_attempts {
                self.enter(attempts, SearchPhase::RetryLoop);
                tokio::time::sleep(self.between_attempts.next_delay()).await;
            }
        }

        self.enter(attempts, SearchPhase::Terminal);
        let outcome = match last_pending {
            Some(page) => Ok(page),
            None => Err(SourceError::Unexpected(format!(
                "browser search gave up after {attempts} attempts: {}",
                last_error.unwrap_or_else(|| "no attempt completed".into())
            ))),
        };
        self.report(outcome, attempts)
    }

    fn report(self, outcome: FetchResult<PageSnapshot>, attempts: u32) -> SearchReport {
        SearchReport {
            outcome,
            attempts,
            trace: self.trace,
        }
    }

    async fn attempt(&mut self, attempt: u32, query: &str) -> Result<Verdict, AttemptError> {
        self.enter(attempt, SearchPhase::Starting);
        let mut lease = self.session.lease().await?;
        let limit = lease.call_timeout();

        let result = match lease.driver() {
            Ok(driver) => self.drive(driver, limit, attempt, query).await,
            Err(err) => Err(err.into()),
        };

        if matches!(result, Err(AttemptError::Driver(_))) {
            lease.discard().await;
        }
        result
    }

    async fn drive(
        &mut self,
        driver: &mut dyn BrowserDriver,
        limit: Duration,
        attempt: u32,
        query: &str,
    ) -> Result<Verdict, AttemptError> {
        let config = self.session.config().clone();

        if !self.cookies.is_empty() {
            timed(limit, "set_cookies", driver.set_cookies(&self.cookies)).await?;
        }
        timed(limit, "navigate", driver.navigate(&config.home_url)).await?;
        if timed(limit, "dismiss_overlays", driver.dismiss_overlays(&config.overlay_selectors)).await? {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        self.enter(attempt, SearchPhase::Ready);

        self.enter(attempt, SearchPhase::Searching);
        timed(limit, "focus_input", driver.focus_input(&config.input_selectors)).await?;
        for c in query.chars() {
            timed(limit, "type_char", driver.type_char(c)).await?;
            tokio::time::sleep(self.keystrokes.next_delay()).await;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        timed(limit, "submit", driver.submit()).await?;
        tokio::time::sleep(config.settle_delay()).await;

        let mut page = timed(limit, "snapshot", driver.snapshot()).await?;
        if let Some(captcha) = detect_captcha(&page.html) {
            self.enter(attempt, SearchPhase::CaptchaPending);
            let Some(solver) = self.solver.clone() else {
                return Err(AttemptError::CaptchaRequired);
            };
            let site_key = captcha
                .site_key
                .ok_or_else(|| AttemptError::Captcha("captcha site key not found".into()))?;
            let page_url = Url::parse(&page.url)
                .or_else(|_| Url::parse(&config.home_url))
                .map_err(|err| AttemptError::Captcha(format!("bad page url: {err}")))?;

            log::info!("{} solving {:?} via {}", self.provider, captcha.kind, solver.name());
            let solution = solver
                .solve(&CaptchaTask::new(captcha.kind, site_key, page_url))
                .await
                .map_err(|err| AttemptError::Captcha(err.to_string()))?;

            timed(limit, "inject_captcha", driver.inject_captcha_solution(captcha.kind, &solution.token)).await?;
            timed(limit, "submit", driver.submit()).await?;
            tokio::time::sleep(config.settle_delay()).await;

            page = timed(limit, "snapshot", driver.snapshot()).await?;
            if detect_captcha(&page.html).is_some() {
                return Err(AttemptError::Captcha("captcha still present after solving".into()));
            }
        }

        self.enter(attempt, SearchPhase::Parsing);
        let status = normalizer::normalize(
            self.provider,
            query,
            RawPayload::SearchPage(page.clone()),
            &self.rules,
        )
        .status;

        if status == LookupStatus::Unavailable {
            Ok(Verdict::NotReady(page))
        } else {
            self.between_attempts.register(AttemptFeedback::Success);
            Ok(Verdict::Done(page))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserConfig, DriverLauncher};
    use crate::external_deps::captcha::{CaptchaKind, CaptchaResult, CaptchaSolution};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Script {
        pages: VecDeque<Result<String, DriverError>>,
        navigations: usize,
        typed: String,
        injected: Vec<String>,
        launches: usize,
    }

    struct ScriptedDriver(Arc<Mutex<Script>>);

    #[async_trait]
    impl BrowserDriver for ScriptedDriver {
        async fn navigate(&mut self, _url: &str) -> Result<(), DriverError> {
            self.0.lock().unwrap().navigations += 1;
            Ok(())
        }
        async fn dismiss_overlays(&mut self, _selectors: &[String]) -> Result<bool, DriverError> {
            Ok(true)
        }
        async fn focus_input(&mut self, _selectors: &[String]) -> Result<(), DriverError> {
            self.0.lock().unwrap().typed.clear();
            Ok(())
        }
        async fn type_char(&mut self, c: char) -> Result<(), DriverError> {
            self.0.lock().unwrap().typed.push(c);
            Ok(())
        }
        async fn submit(&mut self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn snapshot(&mut self) -> Result<PageSnapshot, DriverError> {
            let next = self.0.lock().unwrap().pages.pop_front();
            let html = next.unwrap_or_else(|| Ok("<body>empty</body>".into()))?;
            Ok(PageSnapshot {
                url: "https://web.getcontact.com/search".into(),
                html,
                body_text: String::new(),
            })
        }
        async fn inject_captcha_solution(&mut self, _kind: CaptchaKind, token: &str) -> Result<(), DriverError> {
            self.0.lock().unwrap().injected.push(token.to_string());
            Ok(())
        }
        async fn set_cookies(&mut self, _cookies: &[BrowserCookie]) -> Result<(), DriverError> {
            Ok(())
        }
        async fn scroll(&mut self, _times: u32) -> Result<(), DriverError> {
            Ok(())
        }
        async fn shutdown(&mut self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    struct ScriptedLauncher(Arc<Mutex<Script>>);

    #[async_trait]
    impl DriverLauncher for ScriptedLauncher {
        async fn launch(&self, _config: &BrowserConfig) -> Result<Box<dyn BrowserDriver>, DriverError> {
            self.0.lock().unwrap().launches += 1;
            Ok(Box::new(ScriptedDriver(self.0.clone())))
        }
    }

    struct FixedSolver;

    #[async_trait]
    impl CaptchaProvider for FixedSolver {
        fn name(&self) -> &'static str {
            "fixed"
        }
        async fn solve(&self, task: &CaptchaTask) -> CaptchaResult {
            assert_eq!(task.site_key, "6LcTESTKEY");
            Ok(CaptchaSolution::new("solved-token"))
        }
    }

    const PENDING: &str = "<body><p>Результат ещё не доступен</p></body>";
    const FOUND: &str = r#"<body><script>var s = {"displayName":"Марина"};</script></body>"#;
    const CAPTCHA: &str = r#"<body><div class="g-recaptcha" data-sitekey="6LcTESTKEY"></div></body>"#;

    fn machine(pages: Vec<Result<String, DriverError>>) -> (SearchMachine, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(Script {
            pages: pages.into(),
            ..Default::default()
        }));
        let session = BrowserSession::new(Arc::new(ScriptedLauncher(script.clone())), BrowserConfig::default());
        let machine = SearchMachine::new(session, Arc::new(NormalizerRules::default()), ProviderId::GetContact);
        (machine, script)
    }

    #[tokio::test(start_paused = true)]
    async fn placeholder_then_name_takes_two_attempts() {
        let (machine, script) = machine(vec![Ok(PENDING.into()), Ok(FOUND.into())]);
        let report = machine.run("79161234567".into()).await;

        assert_eq!(report.attempts, 2);
        let page = report.outcome.unwrap();
        let result = normalizer::normalize(
            ProviderId::GetContact,
            "79161234567",
            RawPayload::SearchPage(page),
            &NormalizerRules::default(),
        );
        assert_eq!(result.status, LookupStatus::Found);
        assert_eq!(result.display_name.as_deref(), Some("Марина"));

        let script = script.lock().unwrap();
        assert_eq!(script.navigations, 2);
        assert_eq!(script.typed, "79161234567");
        assert_eq!(script.launches, 1);
        assert!(report.trace.contains(&SearchPhase::RetryLoop));
        assert_eq!(report.trace.last(), Some(&SearchPhase::Terminal));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let (machine, _) = machine(vec![Ok(PENDING.into()); 10]);
        let report = machine.run("79161234567".into()).await;
        assert_eq!(report.attempts, 3);
        let page = report.outcome.unwrap();
        assert!(page.html.contains("не доступен"));
    }

    #[tokio::test(start_paused = true)]
    async fn captcha_without_solver_is_terminal() {
        let (machine, script) = machine(vec![Ok(CAPTCHA.into()), Ok(FOUND.into())]);
        let report = machine.run("79161234567".into()).await;
        assert_eq!(report.attempts, 1);
        assert_eq!(report.outcome.unwrap_err(), SourceError::CaptchaRequired);
        assert!(report.trace.contains(&SearchPhase::CaptchaPending));
        assert_eq!(script.lock().unwrap().pages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn captcha_is_solved_and_injected() {
        let (machine, script) = machine(vec![Ok(CAPTCHA.into()), Ok(FOUND.into())]);
        let machine = machine.with_solver(Some(Arc::new(FixedSolver)));
        let report = machine.run("79161234567".into()).await;
        assert_eq!(report.attempts, 1);
        assert!(report.outcome.unwrap().html.contains("Марина"));
        assert_eq!(script.lock().unwrap().injected, vec!["solved-token".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn driver_failure_restarts_the_browser() {
        let (machine, script) = machine(vec![
            Err(DriverError::Protocol("target crashed".into())),
            Ok(FOUND.into()),
        ]);
        let report = machine.run("79161234567".into()).await;
        assert_eq!(report.attempts, 2);
        assert!(report.outcome.is_ok());
        assert_eq!(script.lock().unwrap().launches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failures_end_in_an_error() {
        let failures = (0..5)
            .map(|_| Err(DriverError::Navigation("net::ERR_CONNECTION_RESET".into())))
            .collect();
        let (machine, _) = machine(failures);
        let report = machine.run("79161234567".into()).await;
        assert_eq!(report.attempts, 3);
        assert!(matches!(report.outcome, Err(SourceError::Unexpected(_))));
    }
}
