//! GetContact web search, driven through the shared browser session.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use super::core::{FetchContext, FetchResult, LookupSource, ProviderId, Query, RawPayload, SourceError};
use crate::browser::{BrowserCookie, BrowserSession, SearchMachine};
use crate::external_deps::captcha::CaptchaProvider;
use crate::modules::accounts::{Account, AccountPool};
use crate::normalizer::NormalizerRules;

pub struct GetContactSource {
    session: Arc<BrowserSession>,
    rules: Arc<NormalizerRules>,
    solver: Option<Arc<dyn CaptchaProvider>>,
    accounts: Option<AccountPool>,
}

impl std::fmt::Debug for GetContactSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetContactSource")
            .field("session", &self.session)
            .field("solver", &self.solver.as_ref().map(|solver| solver.name()))
            .field("accounts", &self.accounts.as_ref().map(AccountPool::len))
            .finish()
    }
}

impl GetContactSource {
    pub fn new(session: Arc<BrowserSession>, rules: Arc<NormalizerRules>) -> Self {
        Self {
            session,
            rules,
            solver: None,
            accounts: None,
        }
    }

    pub fn with_solver(mut self, solver: Arc<dyn CaptchaProvider>) -> Self {
        self.solver = Some(solver);
        self
    }

    /// Logged-in web sessions whose cookies are installed before searching.
    pub fn with_accounts(mut self, accounts: AccountPool) -> Self {
        self.accounts = Some(accounts).filter(|pool| !pool.is_empty());
        self
    }

    fn cookie_domain(&self) -> String {
        Url::parse(&self.session.config().home_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .map(|host| match host.strip_prefix("web.").or_else(|| host.strip_prefix("www.")) {
                Some(root) => format!(".{root}"),
                None => host,
            })
            .unwrap_or_default()
    }

    fn cookies_for(&self, account: Option<&Account>) -> Vec<BrowserCookie> {
        let Some(account) = account else {
            return Vec::new();
        };
        let domain = self.cookie_domain();
        let mut cookies: Vec<BrowserCookie> = account
            .cookies
            .iter()
            .map(|(name, value)| BrowserCookie::new(name, value, domain.clone()))
            .collect();
        cookies.sort_by(|a, b| a.name.cmp(&b.name));
        cookies
    }
}

#[async_trait]
impl LookupSource for GetContactSource {
    fn provider(&self) -> ProviderId {
        ProviderId::GetContact
    }

    async fn fetch(&self, query: &Query, ctx: &FetchContext) -> FetchResult<RawPayload> {
        let machine = SearchMachine::new(Arc::clone(&self.session), Arc::clone(&self.rules), self.provider())
            .with_solver(self.solver.clone())
            .with_events(Arc::clone(&ctx.events))
            .with_cookies(self.cookies_for(ctx.account.as_ref()));

        // Run detached so a dropped lookup cannot cancel a search mid-lease.
        let report = tokio::spawn(machine.run(query.normalized_id().to_string()))
            .await
            .map_err(|err| SourceError::Unexpected(format!("browser task failed: {err}")))?;

        log::debug!(
            "getcontact search for {} finished after {} attempt(s): {:?}",
            query.normalized_id(),
            report.attempts,
            report.trace
        );
        report.outcome.map(RawPayload::SearchPage)
    }

    fn accounts(&self) -> Option<&AccountPool> {
        self.accounts.as_ref()
    }

    /// The search machine already retries inside one lookup.
    fn transient_retries(&self) -> Option<u32> {
        Some(0)
    }

    async fn shutdown(&self) {
        self.session.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::browser::{BrowserConfig, BrowserDriver, DriverError, DriverLauncher};

    struct NoLauncher;

    #[async_trait]
    impl DriverLauncher for NoLauncher {
        async fn launch(&self, _config: &BrowserConfig) -> Result<Box<dyn BrowserDriver>, DriverError> {
            Err(DriverError::Launch("not in tests".into()))
        }
    }

    fn source() -> GetContactSource {
        let session = BrowserSession::new(Arc::new(NoLauncher), BrowserConfig::default());
        GetContactSource::new(session, Arc::new(NormalizerRules::default()))
    }

    #[test]
    fn cookies_target_the_root_domain() {
        let source = source();
        assert_eq!(source.cookie_domain(), ".getcontact.com");

        let account = Account {
            identifier: "me".into(),
            secret: None,
            cookies: HashMap::from([("session".to_string(), "s".to_string()), ("lang".to_string(), "ru".to_string())]),
            user_agent: None,
        };
        let cookies = source.cookies_for(Some(&account));
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "lang");
        assert_eq!(cookies[1].domain, ".getcontact.com");
        assert!(source.cookies_for(None).is_empty());
    }

    #[test]
    fn retries_are_left_to_the_machine() {
        let source = source();
        assert_eq!(source.transient_retries(), Some(0));
        assert!(source.accounts().is_none());
        let source = source.with_accounts(AccountPool::new(std::time::Duration::from_secs(1)));
        assert!(source.accounts().is_none());
    }
}
