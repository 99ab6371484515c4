//! Configuration for Kiln storage.
//!
//! Supports:
//! - Programmatic [`StorageOptions`] with validated defaults
//! - CLI arguments via clap, with environment variable overrides

use clap::Args;
use rusqlite::TransactionBehavior;
use std::time::Duration;

use crate::error::ConfigError;

/// Default schema name qualifying every table.
pub const DEFAULT_SCHEMA: &str = "Kiln";

/// How long a writer waits for the process-wide write lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Transaction isolation levels callers may request.
///
/// SQLite only has serializable transactions; the levels are mapped onto
/// the transaction behaviors that come closest to their intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// The `BEGIN` flavor used for this level.
    pub fn behavior(self) -> TransactionBehavior {
        match self {
            Self::ReadUncommitted => TransactionBehavior::Deferred,
            Self::ReadCommitted | Self::RepeatableRead => TransactionBehavior::Immediate,
            Self::Serializable => TransactionBehavior::Exclusive,
        }
    }

    /// Whether the connection should be switched to `read_uncommitted`.
    pub fn reads_uncommitted(self) -> bool {
        matches!(self, Self::ReadUncommitted)
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_', ' '], "").as_str() {
            "readuncommitted" => Ok(Self::ReadUncommitted),
            "readcommitted" => Ok(Self::ReadCommitted),
            "repeatableread" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            _ => Err(format!("unknown isolation level: {}", s)),
        }
    }
}

/// Policy deciding when a fetched but unacknowledged entry is reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvisibilityPolicy {
    /// Entries stay invisible for `job_queue_execution_timeout` after fetch.
    #[default]
    Fixed,
    /// Entries stay invisible while their fetcher keeps heartbeating, and for
    /// `sliding_invisibility_timeout` after the last heartbeat.
    Sliding,
}

impl std::str::FromStr for InvisibilityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "sliding" => Ok(Self::Sliding),
            _ => Err(format!("unknown invisibility policy: {}", s)),
        }
    }
}

/// Options controlling a [`crate::Storage`] instance.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Name qualifying every table, e.g. `"Kiln.Job"`.
    pub schema_name: String,
    /// How often an idle fetcher re-polls its queues.
    pub queue_poll_interval: Duration,
    /// Fixed invisibility window of a fetched entry.
    pub job_queue_execution_timeout: Duration,
    /// Sliding invisibility window, refreshed by the fetcher heartbeat.
    pub sliding_invisibility_timeout: Duration,
    /// Which of the two windows applies.
    pub invisibility_policy: InvisibilityPolicy,
    /// Pause between expiration sweeps.
    pub job_expiration_check_interval: Duration,
    /// Upper bound on rows returned by list queries of the monitoring API.
    pub dashboard_job_list_limit: usize,
    /// Isolation level used when a transaction does not ask for one.
    pub transaction_isolation_level: Option<IsolationLevel>,
    /// How long a statement waits on a busy database before failing.
    pub transaction_timeout: Duration,
    /// Install the schema when the storage is opened.
    pub prepare_schema_if_necessary: bool,
    /// Maximum pooled connections per storage.
    pub pool_size: u32,
    /// How long a writer waits for the process-wide write lock.
    pub lock_timeout: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            schema_name: DEFAULT_SCHEMA.into(),
            queue_poll_interval: Duration::from_secs(15),
            job_queue_execution_timeout: Duration::from_secs(60 * 60),
            sliding_invisibility_timeout: Duration::from_secs(5),
            invisibility_policy: InvisibilityPolicy::Fixed,
            job_expiration_check_interval: Duration::from_secs(30 * 60),
            dashboard_job_list_limit: 10_000,
            transaction_isolation_level: None,
            transaction_timeout: Duration::from_secs(60),
            prepare_schema_if_necessary: true,
            pool_size: 10,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl StorageOptions {
    pub fn with_schema_name(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = schema_name.into();
        self
    }

    pub fn with_queue_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_poll_interval = interval;
        self
    }

    pub fn with_job_queue_execution_timeout(mut self, timeout: Duration) -> Self {
        self.job_queue_execution_timeout = timeout;
        self
    }

    /// Switch to the sliding policy with the given window.
    pub fn with_sliding_invisibility_timeout(mut self, timeout: Duration) -> Self {
        self.sliding_invisibility_timeout = timeout;
        self.invisibility_policy = InvisibilityPolicy::Sliding;
        self
    }

    pub fn with_job_expiration_check_interval(mut self, interval: Duration) -> Self {
        self.job_expiration_check_interval = interval;
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.transaction_isolation_level = Some(level);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn without_schema_preparation(mut self) -> Self {
        self.prepare_schema_if_necessary = false;
        self
    }

    /// The invisibility window in effect for the configured policy.
    pub fn invisibility_timeout(&self) -> Duration {
        match self.invisibility_policy {
            InvisibilityPolicy::Fixed => self.job_queue_execution_timeout,
            InvisibilityPolicy::Sliding => self.sliding_invisibility_timeout,
        }
    }

    /// Isolation level for a transaction, falling back to read committed.
    pub fn isolation_level(&self, requested: Option<IsolationLevel>) -> IsolationLevel {
        requested
            .or(self.transaction_isolation_level)
            .unwrap_or_default()
    }

    /// Check every option, failing on the first invalid one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema_name.trim().is_empty() {
            return Err(ConfigError::BlankSchemaName);
        }
        if self.schema_name.contains(['"', '\'', '`', '[', ']']) {
            return Err(ConfigError::InvalidSchemaName(self.schema_name.clone()));
        }
        let positive = [
            ("queue_poll_interval", self.queue_poll_interval),
            ("sliding_invisibility_timeout", self.sliding_invisibility_timeout),
            ("job_queue_execution_timeout", self.job_queue_execution_timeout),
            ("job_expiration_check_interval", self.job_expiration_check_interval),
            ("lock_timeout", self.lock_timeout),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::NonPositive { name, value });
            }
        }
        if self.dashboard_job_list_limit == 0 {
            return Err(ConfigError::ZeroListLimit);
        }
        Ok(())
    }
}

/// Storage settings shared by every `kiln` subcommand.
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    #[arg(short, long, env = "KILN_DATABASE", default_value = "./kiln.db")]
    pub database: String,

    /// Schema name qualifying every table
    #[arg(long, env = "KILN_SCHEMA", default_value = DEFAULT_SCHEMA)]
    pub schema: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Queue poll interval in milliseconds
    #[arg(long, env = "KILN_POLL_INTERVAL_MS", default_value_t = 15_000)]
    pub poll_interval_ms: u64,

    /// Expiration sweep interval in seconds
    #[arg(long, env = "KILN_SWEEP_INTERVAL_SECS", default_value_t = 1_800)]
    pub sweep_interval_secs: u64,

    /// Reclaim policy for fetched entries (fixed, sliding)
    #[arg(long, env = "KILN_INVISIBILITY", default_value = "fixed")]
    pub invisibility: InvisibilityPolicy,

    /// Size of the connection pool
    #[arg(long, env = "KILN_POOL_SIZE", default_value_t = 10)]
    pub pool_size: u32,

    /// Skip schema installation on startup
    #[arg(long, env = "KILN_NO_PREPARE_SCHEMA")]
    pub no_prepare_schema: bool,
}

impl Config {
    /// Translate CLI settings into storage options.
    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            schema_name: self.schema.clone(),
            queue_poll_interval: Duration::from_millis(self.poll_interval_ms),
            job_expiration_check_interval: Duration::from_secs(self.sweep_interval_secs),
            invisibility_policy: self.invisibility,
            pool_size: self.pool_size,
            prepare_schema_if_necessary: !self.no_prepare_schema,
            ..StorageOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = StorageOptions::default();
        assert_eq!(options.schema_name, "Kiln");
        assert_eq!(options.queue_poll_interval, Duration::from_secs(15));
        assert_eq!(options.job_queue_execution_timeout, Duration::from_secs(3600));
        assert_eq!(options.sliding_invisibility_timeout, Duration::from_secs(5));
        assert_eq!(options.job_expiration_check_interval, Duration::from_secs(1800));
        assert_eq!(options.dashboard_job_list_limit, 10_000);
        assert_eq!(options.transaction_timeout, Duration::from_secs(60));
        assert!(options.prepare_schema_if_necessary);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let options = StorageOptions::default().with_queue_poll_interval(Duration::ZERO);
        assert_eq!(
            options.validate(),
            Err(ConfigError::NonPositive {
                name: "queue_poll_interval",
                value: Duration::ZERO,
            })
        );
    }

    #[test]
    fn test_blank_schema_rejected() {
        let options = StorageOptions::default().with_schema_name("   ");
        assert_eq!(options.validate(), Err(ConfigError::BlankSchemaName));

        let options = StorageOptions::default().with_schema_name("bad\"name");
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidSchemaName(_))
        ));
    }

    #[test]
    fn test_zero_sliding_timeout_rejected() {
        let options =
            StorageOptions::default().with_sliding_invisibility_timeout(Duration::ZERO);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_invisibility_timeout_follows_policy() {
        let options = StorageOptions::default();
        assert_eq!(options.invisibility_timeout(), Duration::from_secs(3600));

        let options =
            options.with_sliding_invisibility_timeout(Duration::from_secs(2));
        assert_eq!(options.invisibility_policy, InvisibilityPolicy::Sliding);
        assert_eq!(options.invisibility_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_isolation_level_fallback() {
        let options = StorageOptions::default();
        assert_eq!(options.isolation_level(None), IsolationLevel::ReadCommitted);

        let options = options.with_isolation_level(IsolationLevel::Serializable);
        assert_eq!(options.isolation_level(None), IsolationLevel::Serializable);
        assert_eq!(
            options.isolation_level(Some(IsolationLevel::ReadUncommitted)),
            IsolationLevel::ReadUncommitted
        );
    }

    #[test]
    fn test_parse_isolation_level() {
        assert_eq!(
            "read-committed".parse::<IsolationLevel>(),
            Ok(IsolationLevel::ReadCommitted)
        );
        assert_eq!(
            "Serializable".parse::<IsolationLevel>(),
            Ok(IsolationLevel::Serializable)
        );
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }
}
