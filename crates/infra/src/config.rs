//! Ledger configuration loaded from the environment.
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `AGRITRACE_LOCK_TIMEOUT_MS` | `5000` | bounded wait for row locks |
//! | `AGRITRACE_AUDIT_URL` | unset | audit log base URL; unset disables forwarding |
//! | `AGRITRACE_AUDIT_TIMEOUT_MS` | `5000` | per-request audit timeout |
//! | `AGRITRACE_MAX_ANCESTOR_DEPTH` | `6` | parent hops followed by provenance walks |
//! | `DATABASE_URL` | unset | Postgres connection string; unset uses the in-memory store |

use std::time::Duration;

use tracing::{info, warn};

pub const LOCK_TIMEOUT_ENV: &str = "AGRITRACE_LOCK_TIMEOUT_MS";
pub const AUDIT_URL_ENV: &str = "AGRITRACE_AUDIT_URL";
pub const AUDIT_TIMEOUT_ENV: &str = "AGRITRACE_AUDIT_TIMEOUT_MS";
pub const MAX_ANCESTOR_DEPTH_ENV: &str = "AGRITRACE_MAX_ANCESTOR_DEPTH";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_AUDIT_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_MAX_ANCESTOR_DEPTH: usize = 6;

/// Ceiling on batches visited by one descendant walk.
pub const DEFAULT_MAX_DESCENDANTS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub lock_timeout: Duration,
    pub audit_url: Option<String>,
    pub audit_timeout: Duration,
    pub max_ancestor_depth: usize,
    pub max_descendants: usize,
    pub database_url: Option<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            audit_url: None,
            audit_timeout: DEFAULT_AUDIT_TIMEOUT,
            max_ancestor_depth: DEFAULT_MAX_ANCESTOR_DEPTH,
            max_descendants: DEFAULT_MAX_DESCENDANTS,
            database_url: None,
        }
    }
}

impl LedgerConfig {
    /// Read the process environment. Missing or malformed values fall back to
    /// defaults with a log line; loading never fails.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`LedgerConfig::from_env`] over an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let lock_timeout = millis(&lookup, LOCK_TIMEOUT_ENV, defaults.lock_timeout);
        let audit_timeout = millis(&lookup, AUDIT_TIMEOUT_ENV, defaults.audit_timeout);
        let max_ancestor_depth = number(&lookup, MAX_ANCESTOR_DEPTH_ENV, defaults.max_ancestor_depth);

        let audit_url = non_empty(&lookup, AUDIT_URL_ENV);
        if audit_url.is_none() {
            info!("{AUDIT_URL_ENV} not set; audit forwarding disabled");
        }
        let database_url = non_empty(&lookup, DATABASE_URL_ENV);
        if database_url.is_none() {
            info!("{DATABASE_URL_ENV} not set; using the in-memory ledger store");
        }

        Self {
            lock_timeout,
            audit_url,
            audit_timeout,
            max_ancestor_depth,
            max_descendants: defaults.max_descendants,
            database_url,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn with_audit_url(mut self, url: impl Into<String>) -> Self {
        self.audit_url = Some(url.into());
        self
    }

    pub fn with_audit_timeout(mut self, timeout: Duration) -> Self {
        self.audit_timeout = timeout;
        self
    }

    pub fn with_max_ancestor_depth(mut self, depth: usize) -> Self {
        self.max_ancestor_depth = depth;
        self
    }

    pub fn with_max_descendants(mut self, ceiling: usize) -> Self {
        self.max_descendants = ceiling;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn number(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    match non_empty(lookup, key) {
        None => default,
        Some(raw) => match raw.parse::<usize>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, default, "invalid number; using default");
                default
            }
        },
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    let default_ms = default.as_millis() as usize;
    match number(lookup, key, default_ms) {
        0 => {
            warn!(key, default_ms, "zero timeout; using default");
            default
        }
        ms => Duration::from_millis(ms as u64),
    }
}
