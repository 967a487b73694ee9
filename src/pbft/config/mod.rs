//! Protocol configuration loading.
//!
//! Values resolve in three layers: built-in defaults, then an
//! optional TOML file, then environment variables. Any key may be
//! overridden by an uppercase, dotted-to-underscored variable with
//! the `CORE_PBFT_` prefix, e.g. `CORE_PBFT_GENERAL_MODE` overrides
//! `general.mode`.

use std::path::PathBuf;
use std::time::Duration;

use crate::pbft::error::*;

const ENV_PREFIX: &str = "CORE_PBFT";

/// A view over the merged configuration sources.
pub struct Config {
    inner: config::Config,
}

impl Config {
    /// Loads the configuration from the defaults and the environment.
    pub fn load() -> Result<Self> {
        Self::load_impl(None)
    }

    /// Same as `load()`, additionally merging the TOML file at `path`
    /// between the defaults and the environment.
    pub fn load_file(path: impl Into<PathBuf>) -> Result<Self> {
        Self::load_impl(Some(path.into()))
    }

    fn load_impl(path: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("general.mode", "batch")
            .wrapped(ErrorKind::Config)?
            .set_default("general.n", 4_i64)
            .wrapped(ErrorKind::Config)?
            .set_default("general.f", 1_i64)
            .wrapped(ErrorKind::Config)?
            .set_default("general.k", 10_i64)
            .wrapped(ErrorKind::Config)?
            .set_default("general.logmultiplier", 2_i64)
            .wrapped(ErrorKind::Config)?
            .set_default("general.viewchangeperiod", 0_i64)
            .wrapped(ErrorKind::Config)?
            .set_default("general.timeout.request", 2_000_i64)
            .wrapped(ErrorKind::Config)?
            .set_default("general.timeout.viewchange", 2_000_i64)
            .wrapped(ErrorKind::Config)?
            .set_default("general.timeout.nullrequest", 0_i64)
            .wrapped(ErrorKind::Config)?;

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("_")
                .try_parsing(true),
        );

        let inner = builder.build().wrapped(ErrorKind::Config)?;
        Ok(Self { inner })
    }

    /// Returns the string value of the given key.
    pub fn get_str(&self, key: &str) -> Result<String> {
        self.inner.get_string(key).wrapped(ErrorKind::Config)
    }

    /// Returns the integer value of the given key.
    pub fn get_u64(&self, key: &str) -> Result<u64> {
        let value = self.inner.get_int(key).wrapped(ErrorKind::Config)?;
        if value < 0 {
            return Err("Negative value").wrapped(ErrorKind::Config);
        }
        Ok(value as u64)
    }

    /// Returns the value of the given key, in milliseconds, as a
    /// `Duration`.
    pub fn get_duration(&self, key: &str) -> Result<Duration> {
        self.get_u64(key).map(Duration::from_millis)
    }
}

/// The static parameters a replica instance is bootstrapped with.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// The number of replicas in the system, `n >= 3*f + 1`.
    pub n: usize,
    /// The number of replicas allowed to fail.
    pub f: usize,
    /// The checkpoint period, in sequence numbers.
    pub k: u64,
    /// The log holds `k * log_multiplier` sequence numbers between
    /// its watermarks.
    pub log_multiplier: u64,
    /// Rotate the primary every this many stable checkpoints; zero
    /// disables periodic rotation.
    pub view_change_period: u64,
    /// How long a backup waits for a pending request to commit
    /// before suspecting the primary.
    pub request_timeout: Duration,
    /// How long a replica waits for a view change to complete before
    /// trying to escalate it.
    pub view_change_timeout: Duration,
    /// The interval at which an idle primary proposes null requests;
    /// backups give up on the primary after twice this interval with
    /// no traffic. Zero disables null requests.
    pub null_request_timeout: Duration,
}

impl ReplicaConfig {
    /// Reads the replica parameters from a `Config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            n: config.get_u64("general.n")? as usize,
            f: config.get_u64("general.f")? as usize,
            k: config.get_u64("general.k")?,
            log_multiplier: config.get_u64("general.logmultiplier")?,
            view_change_period: config.get_u64("general.viewchangeperiod")?,
            request_timeout: config.get_duration("general.timeout.request")?,
            view_change_timeout: config.get_duration("general.timeout.viewchange")?,
            null_request_timeout: config.get_duration("general.timeout.nullrequest")?,
        })
    }

    /// The size of the log window between watermarks.
    pub fn log_size(&self) -> u64 {
        self.k * self.log_multiplier
    }
}
