// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of PlexSpaces.
//
// PlexSpaces is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// PlexSpaces is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with PlexSpaces. If not, see <https://www.gnu.org/licenses/>.

//! Lock manager configuration
//!
//! Settings can come from a property map (keys such as
//! `expire-check-seconds`) or from `LOCKS_*` environment variables. Both
//! routes funnel through [`LockingConfig::from_properties`], so parsing and
//! validation are the same.

use crate::{LockError, LockResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::env;
use std::time::Duration;

/// Property key for the database URL.
pub const PROP_DB_URL: &str = "db-url";
/// Property key for this node's host identity.
pub const PROP_HOST: &str = "host";
/// Property key for the self-check interval.
pub const PROP_EXPIRE_CHECK_SECONDS: &str = "expire-check-seconds";
/// Property key for the global cleanup interval.
pub const PROP_CLEANUP_SECONDS: &str = "cleanup-seconds";
/// Property key for the delay before re-running a failed scan.
pub const PROP_CHECK_RETRY_SECONDS: &str = "check-retry-seconds";
/// Property key for the delay between transient-error retries.
pub const PROP_RETRY_SECONDS: &str = "retry-seconds";
/// Property key for the retry bound.
pub const PROP_MAX_RETRIES: &str = "max-retries";
/// Property key for the comma-separated transient error codes.
pub const PROP_TRANSIENT_ERROR_CODES: &str = "transient-error-codes";
/// Property key for the worker pool size.
pub const PROP_MAX_THREADS: &str = "max-threads";

const ENV_PREFIX: &str = "LOCKS_";

/// Codes treated as transient when nothing is configured: SQLite busy /
/// locked, PostgreSQL serialization failure, deadlock and connection
/// exceptions, plus the synthetic driver connectivity codes.
const DEFAULT_TRANSIENT_CODES: &[&str] = &[
    "5", "6", "261", "262", "517", "40001", "40P01", "08000", "08001", "08003", "08006", "57P01",
    "io", "pool-timed-out",
];

/// Distributed lock manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockingConfig {
    /// Lease store URL (`sqlite::memory:`, `sqlite://locks.db`, `postgres://...`)
    pub db_url: String,

    /// This node's stable identity; defaults to the machine hostname
    pub host: String,

    /// Interval between self-checks for silently expired leases
    pub expire_check_secs: u64,

    /// Interval between global purges of expired rows
    pub cleanup_secs: u64,

    /// Delay before re-running a scan that failed against the store
    pub check_retry_secs: u64,

    /// Delay between retries of a store operation that hit a transient error
    pub retry_secs: u64,

    /// Retries allowed after the first attempt
    pub max_retries: u32,

    /// Store error codes treated as transient
    pub transient_error_codes: BTreeSet<String>,

    /// Maximum number of store operations running at once
    pub max_threads: usize,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            db_url: "sqlite::memory:".to_string(),
            host: default_host(),
            expire_check_secs: 3600,
            cleanup_secs: 300,
            check_retry_secs: 60,
            retry_secs: 60,
            max_retries: 2,
            transient_error_codes: DEFAULT_TRANSIENT_CODES.iter().map(|c| c.to_string()).collect(),
            max_threads: 5,
        }
    }
}

impl LockingConfig {
    /// Create config from a property map, falling back to defaults for
    /// missing keys.
    pub fn from_properties(props: &HashMap<String, String>) -> LockResult<Self> {
        let mut config = Self::default();

        if let Some(url) = props.get(PROP_DB_URL) {
            config.db_url = url.trim().to_string();
        }
        if let Some(host) = props.get(PROP_HOST) {
            config.host = host.trim().to_string();
        }
        if let Some(v) = props.get(PROP_EXPIRE_CHECK_SECONDS) {
            config.expire_check_secs = parse_number(PROP_EXPIRE_CHECK_SECONDS, v)?;
        }
        if let Some(v) = props.get(PROP_CLEANUP_SECONDS) {
            config.cleanup_secs = parse_number(PROP_CLEANUP_SECONDS, v)?;
        }
        if let Some(v) = props.get(PROP_CHECK_RETRY_SECONDS) {
            config.check_retry_secs = parse_number(PROP_CHECK_RETRY_SECONDS, v)?;
        }
        if let Some(v) = props.get(PROP_RETRY_SECONDS) {
            config.retry_secs = parse_number(PROP_RETRY_SECONDS, v)?;
        }
        if let Some(v) = props.get(PROP_MAX_RETRIES) {
            config.max_retries = parse_number(PROP_MAX_RETRIES, v)?;
        }
        if let Some(v) = props.get(PROP_TRANSIENT_ERROR_CODES) {
            config.transient_error_codes = parse_codes(v);
        }
        if let Some(v) = props.get(PROP_MAX_THREADS) {
            config.max_threads = parse_number(PROP_MAX_THREADS, v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Create config from `LOCKS_*` environment variables
    /// (`LOCKS_EXPIRE_CHECK_SECONDS`, `LOCKS_DB_URL`, ...).
    pub fn from_env() -> LockResult<Self> {
        let props = [
            PROP_DB_URL,
            PROP_HOST,
            PROP_EXPIRE_CHECK_SECONDS,
            PROP_CLEANUP_SECONDS,
            PROP_CHECK_RETRY_SECONDS,
            PROP_RETRY_SECONDS,
            PROP_MAX_RETRIES,
            PROP_TRANSIENT_ERROR_CODES,
            PROP_MAX_THREADS,
        ]
        .into_iter()
        .filter_map(|key| env::var(env_name(key)).ok().map(|v| (key.to_string(), v)))
        .collect();

        Self::from_properties(&props)
    }

    /// Validate configuration
    pub fn validate(&self) -> LockResult<()> {
        if self.db_url.is_empty() {
            return Err(LockError::ConfigError(format!("{PROP_DB_URL} is required")));
        }
        if self.host.is_empty() {
            return Err(LockError::ConfigError(format!("{PROP_HOST} must not be empty")));
        }
        if self.expire_check_secs == 0 {
            return Err(LockError::ConfigError(format!("{PROP_EXPIRE_CHECK_SECONDS} must be > 0")));
        }
        if self.cleanup_secs == 0 {
            return Err(LockError::ConfigError(format!("{PROP_CLEANUP_SECONDS} must be > 0")));
        }
        if self.check_retry_secs == 0 {
            return Err(LockError::ConfigError(format!("{PROP_CHECK_RETRY_SECONDS} must be > 0")));
        }
        if self.max_threads == 0 {
            return Err(LockError::ConfigError(format!("{PROP_MAX_THREADS} must be > 0")));
        }
        Ok(())
    }

    pub fn expire_check_interval(&self) -> Duration {
        Duration::from_secs(self.expire_check_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_secs)
    }

    pub fn check_retry_interval(&self) -> Duration {
        Duration::from_secs(self.check_retry_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }
}

fn default_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn env_name(key: &str) -> String {
    format!("{ENV_PREFIX}{}", key.replace('-', "_").to_uppercase())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> LockResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| LockError::ConfigError(format!("invalid value for {key}: {value:?}")))
}

fn parse_codes(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}
