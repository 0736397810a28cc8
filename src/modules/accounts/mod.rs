//! Account rotation and cooldown tracking.
//!
//! Accounts are handed out round-robin. An account that fails authentication
//! is cooled down for a fixed window and skipped until the window expires.
//! Accounts are never removed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Instant;

/// Default cooldown after an auth failure.
pub const DEFAULT_ERROR_COOLDOWN: Duration = Duration::from_secs(300);

/// Credentials for one provider account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub identifier: String,
    pub secret: Option<String>,
    pub cookies: HashMap<String, String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccountParseError {
    #[error("account line is empty")]
    Empty,
    #[error("account line has no login")]
    MissingLogin,
    #[error("account {0} has no sessionid cookie")]
    MissingSession(String),
}

impl Account {
    /// Bearer-style account: a single token or key.
    pub fn token(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            identifier: mask(&token),
            secret: Some(token),
            cookies: HashMap::new(),
            user_agent: None,
        }
    }

    /// Parse `login:password|user-agent|name=value; name=value`.
    ///
    /// The cookie part must contain a `sessionid`.
    pub fn parse(line: &str) -> Result<Self, AccountParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(AccountParseError::Empty);
        }

        let mut parts = line.splitn(3, '|');
        let credentials = parts.next().unwrap_or_default();
        let user_agent = parts
            .next()
            .map(str::trim)
            .filter(|ua| !ua.is_empty())
            .map(str::to_string);
        let cookie_part = parts.next().unwrap_or_default();

        let (login, password) = match credentials.split_once(':') {
            Some((login, password)) => (login.trim(), Some(password.trim().to_string())),
            None => (credentials.trim(), None),
        };
        if login.is_empty() {
            return Err(AccountParseError::MissingLogin);
        }

        let cookies: HashMap<String, String> = cookie_part
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .filter(|(name, value)| !name.is_empty() && !value.is_empty())
            .collect();
        if !cookies.contains_key("sessionid") {
            return Err(AccountParseError::MissingSession(login.to_string()));
        }

        Ok(Self {
            identifier: login.to_string(),
            secret: password.filter(|p| !p.is_empty()),
            cookies,
            user_agent,
        })
    }

    /// Same login and secret. Identifiers of tokens are display masks and
    /// may repeat, so they alone do not identify an account.
    pub fn same_credentials(&self, other: &Account) -> bool {
        self.identifier == other.identifier && self.secret == other.secret
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// `Cookie` header value.
    pub fn cookie_header(&self) -> String {
        let mut pairs: Vec<_> = self.cookies.iter().collect();
        pairs.sort();
        pairs
            .into_iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// `head…tail#fingerprint`; the fingerprint keeps masks of distinct
/// tokens apart in reports.
fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return secret.to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    let digest = hex::encode(Sha256::digest(secret.as_bytes()));
    format!("{head}…{tail}#{}", &digest[..6])
}

#[derive(Debug, Clone, Default)]
pub struct AccountStats {
    pub successes: u64,
    pub failures: u64,
    pub last_used: Option<Instant>,
    pub last_error: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct AccountHealthReport {
    pub total_accounts: usize,
    pub available_accounts: usize,
    pub cooling_accounts: usize,
    pub details: HashMap<String, AccountStats>,
}

#[derive(Debug, Clone)]
struct AccountEntry {
    account: Account,
    stats: AccountStats,
}

impl AccountEntry {
    fn is_available(&self, now: Instant, cooldown: Duration) -> bool {
        match self.stats.last_error {
            Some(at) => now.duration_since(at) >= cooldown,
            None => true,
        }
    }
}

#[derive(Debug)]
struct PoolState {
    entries: Vec<AccountEntry>,
    current_index: usize,
}

/// Rotating pool owned by one adapter.
#[derive(Debug)]
pub struct AccountPool {
    cooldown: Duration,
    state: Mutex<PoolState>,
}

impl AccountPool {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            state: Mutex::new(PoolState {
                entries: Vec::new(),
                current_index: 0,
            }),
        }
    }

    pub fn with_accounts<I>(cooldown: Duration, accounts: I) -> Self
    where
        I: IntoIterator<Item = Account>,
    {
        let pool = Self::new(cooldown);
        for account in accounts {
            pool.add(account);
        }
        pool
    }

    pub fn add(&self, account: Account) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state
            .entries
            .iter()
            .any(|entry| entry.account.same_credentials(&account))
        {
            return;
        }
        state.entries.push(AccountEntry {
            account,
            stats: AccountStats::default(),
        });
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Next account not in cooldown, round-robin.
    pub fn next_account(&self) -> Option<Account> {
        let mut state = self.state.lock().ok()?;
        let now = Instant::now();
        let count = state.entries.len();
        for offset in 0..count {
            let idx = (state.current_index + offset) % count;
            if state.entries[idx].is_available(now, self.cooldown) {
                state.current_index = (idx + 1) % count;
                let entry = &mut state.entries[idx];
                entry.stats.last_used = Some(now);
                return Some(entry.account.clone());
            }
        }
        None
    }

    /// Exclude an account from selection for the cooldown window.
    pub fn cool_down(&self, account: &Account) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(entry) = state
            .entries
            .iter_mut()
            .find(|entry| entry.account.same_credentials(account))
        {
            entry.stats.failures += 1;
            entry.stats.last_error = Some(Instant::now());
            log::warn!("account {} cooled down for {:?}", account.identifier, self.cooldown);
        }
    }

    pub fn report_success(&self, account: &Account) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(entry) = state
            .entries
            .iter_mut()
            .find(|entry| entry.account.same_credentials(account))
        {
            entry.stats.successes += 1;
        }
    }

    /// Any account owning a cookie jar, regardless of cooldown. Used for
    /// downloads that only need a referer context.
    pub fn any_account(&self) -> Option<Account> {
        let state = self.state.lock().ok()?;
        state.entries.first().map(|entry| entry.account.clone())
    }

    pub fn health_report(&self) -> AccountHealthReport {
        let Ok(state) = self.state.lock() else {
            return AccountHealthReport {
                total_accounts: 0,
                available_accounts: 0,
                cooling_accounts: 0,
                details: HashMap::new(),
            };
        };
        let now = Instant::now();
        let mut details = HashMap::new();
        let mut available = 0;
        let mut cooling = 0;
        for entry in &state.entries {
            if entry.is_available(now, self.cooldown) {
                available += 1;
            } else {
                cooling += 1;
            }
            details.insert(entry.account.identifier.clone(), entry.stats.clone());
        }

        AccountHealthReport {
            total_accounts: state.entries.len(),
            available_accounts: available,
            cooling_accounts: cooling,
            details,
        }
    }
}

impl Default for AccountPool {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_COOLDOWN)
    }
}
