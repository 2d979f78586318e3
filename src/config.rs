//! Environment-driven configuration.
//!
//! Every variable is prefixed `IDENTITY_WATCH_`. Required variables have no
//! default; the service refuses to start without them.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::scan::ScanConfig;
use crate::store::DEFAULT_COMPACT_EVERY;
use crate::types::GroupId;

const PREFIX: &str = "IDENTITY_WATCH_";

/// Default HTTP listen address.
pub const DEFAULT_BIND: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080);

/// Default FileStore directory.
pub const DEFAULT_STATE_DIR: &str = "./state";

/// Default interval between periodic scans (seconds).
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 60;

/// Default pacing delay between scanned members (milliseconds).
pub const DEFAULT_MEMBER_INTERVAL_MS: u64 = 50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(String),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: SocketAddr,
    pub state_dir: PathBuf,
    pub bridge_url: String,
    pub bridge_token: Option<String>,
    /// Chat id of the single observer.
    pub observer_id: i64,
    pub admin_token: String,
    pub webhook_secret: String,
    pub scan: ScanConfig,
    /// Groups registered at startup.
    pub monitored_groups: Vec<GroupId>,
    pub deactivate_on_last_leave: bool,
    /// Journal records between snapshot compactions.
    pub compact_every: usize,
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a full variable
    /// name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars { lookup };

        let scan = ScanConfig {
            interval: Duration::from_secs(
                vars.parsed("SCAN_INTERVAL_SECS")?
                    .unwrap_or(DEFAULT_SCAN_INTERVAL_SECS),
            ),
            member_interval: Duration::from_millis(
                vars.parsed("MEMBER_INTERVAL_MS")?
                    .unwrap_or(DEFAULT_MEMBER_INTERVAL_MS),
            ),
        };
        if scan.interval.is_zero() {
            return Err(vars.invalid("SCAN_INTERVAL_SECS", "must be positive"));
        }

        let compact_every = vars.parsed("COMPACT_EVERY")?.unwrap_or(DEFAULT_COMPACT_EVERY);
        if compact_every == 0 {
            return Err(vars.invalid("COMPACT_EVERY", "must be positive"));
        }

        Ok(Config {
            bind: vars.parsed("BIND")?.unwrap_or(DEFAULT_BIND),
            state_dir: vars
                .optional("STATE_DIR")
                .map_or_else(|| PathBuf::from(DEFAULT_STATE_DIR), PathBuf::from),
            bridge_url: vars.required("BRIDGE_URL")?,
            bridge_token: vars.optional("BRIDGE_TOKEN"),
            observer_id: vars.required_parsed("OBSERVER_ID")?,
            admin_token: vars.required("ADMIN_TOKEN")?,
            webhook_secret: vars.required("WEBHOOK_SECRET")?,
            scan,
            monitored_groups: vars
                .optional("MONITORED_GROUPS")
                .map(|raw| parse_group_list(&raw))
                .transpose()
                .map_err(|e| vars.invalid("MONITORED_GROUPS", e))?
                .unwrap_or_default(),
            deactivate_on_last_leave: vars.parsed("DEACTIVATE_ON_LAST_LEAVE")?.unwrap_or(true),
            compact_every,
        })
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn name(key: &str) -> String {
        format!("{}{}", PREFIX, key)
    }

    /// A set, non-blank value.
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(&Self::name(key))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::Missing(Self::name(key)))
    }

    fn required_parsed<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.parsed(key)?
            .ok_or_else(|| ConfigError::Missing(Self::name(key)))
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional(key)
            .map(|raw| raw.parse::<T>().map_err(|e| self.invalid(key, e)))
            .transpose()
    }

    fn invalid(&self, key: &str, reason: impl std::fmt::Display) -> ConfigError {
        ConfigError::Invalid {
            name: Self::name(key),
            reason: reason.to_string(),
        }
    }
}

/// Parses a comma-separated list of group ids. Blank entries are skipped.
fn parse_group_list(raw: &str) -> Result<Vec<GroupId>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map(GroupId)
                .map_err(|e| format!("{:?}: {}", s, e))
        })
        .collect()
}
