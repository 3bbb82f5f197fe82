//! Pool configuration.
//!
//! [`PoolConfig`] is the runtime form handed to pools and the manager.
//! [`ManagerSettings`] is the TOML representation an embedding client can
//! load from disk:
//!
//! ```toml
//! [pool]
//! capacity = 16
//! connect_timeout = "5s"
//! rw_timeout = "30s"
//! idle_ttl = "90s"        # "never", "-1" or -1 disables reaping
//! retry_interval = 1      # integers are seconds; "never" keeps dead endpoints dead
//! check_interval = "30s"
//!
//! [[endpoints]]
//! address = "10.0.0.5:6379"
//! capacity = 4
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

/// Configuration applied to an endpoint pool when it is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum idle + in-flight connections per endpoint (0 = unbounded).
    pub capacity: usize,
    /// Timeout for establishing a connection (default: 30s).
    pub connect_timeout: Duration,
    /// Read/write timeout on established connections (default: 30s).
    pub rw_timeout: Duration,
    /// Idle connections unused this long are reaped (default: never).
    pub idle_ttl: Option<Duration>,
    /// How long a dead endpoint refuses checkouts (default: 1s).
    /// `None` keeps it dead until explicitly marked alive.
    pub retry_interval: Option<Duration>,
    /// Minimum time between opportunistic idle sweeps (default: 30s).
    pub check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            connect_timeout: Duration::from_secs(30),
            rw_timeout: Duration::from_secs(30),
            idle_ttl: None,
            retry_interval: Some(Duration::from_secs(1)),
            check_interval: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn with_capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    pub fn with_connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..self
        }
    }

    pub fn with_rw_timeout(self, rw_timeout: Duration) -> Self {
        Self { rw_timeout, ..self }
    }

    pub fn with_idle_ttl(self, idle_ttl: Option<Duration>) -> Self {
        Self { idle_ttl, ..self }
    }

    pub fn with_retry_interval(self, retry_interval: Option<Duration>) -> Self {
        Self {
            retry_interval,
            ..self
        }
    }

    pub fn with_check_interval(self, check_interval: Duration) -> Self {
        Self {
            check_interval,
            ..self
        }
    }
}

/// A duration in the settings file: either text such as `"30s"` or an
/// integer number of seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationSetting {
    Seconds(i64),
    Text(String),
}

impl From<&str> for DurationSetting {
    fn from(s: &str) -> Self {
        DurationSetting::Text(s.to_string())
    }
}

impl From<i64> for DurationSetting {
    fn from(secs: i64) -> Self {
        DurationSetting::Seconds(secs)
    }
}

/// `[pool]` table of the settings file. Missing keys keep the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub capacity: Option<usize>,
    pub connect_timeout: Option<DurationSetting>,
    pub rw_timeout: Option<DurationSetting>,
    pub idle_ttl: Option<DurationSetting>,
    pub retry_interval: Option<DurationSetting>,
    pub check_interval: Option<DurationSetting>,
}

/// An endpoint to register eagerly, with an optional capacity override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSettings {
    pub address: String,
    pub capacity: Option<usize>,
}

/// Top-level settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerSettings {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub endpoints: Vec<EndpointSettings>,
}

impl ManagerSettings {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading pool settings from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let settings: ManagerSettings = toml::from_str(content)?;
        for endpoint in &settings.endpoints {
            if endpoint.address.trim().is_empty() {
                bail!("endpoint address must not be empty");
            }
        }
        Ok(settings)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Resolve the `[pool]` table into a runtime config.
    pub fn pool_config(&self) -> anyhow::Result<PoolConfig> {
        self.pool.to_config()
    }
}

impl PoolSettings {
    pub fn to_config(&self) -> anyhow::Result<PoolConfig> {
        let defaults = PoolConfig::default();
        Ok(PoolConfig {
            capacity: self.capacity.unwrap_or(defaults.capacity),
            connect_timeout: required_duration("connect_timeout", &self.connect_timeout)?
                .unwrap_or(defaults.connect_timeout),
            rw_timeout: required_duration("rw_timeout", &self.rw_timeout)?
                .unwrap_or(defaults.rw_timeout),
            idle_ttl: match &self.idle_ttl {
                Some(s) => optional_duration("idle_ttl", s)?,
                None => defaults.idle_ttl,
            },
            retry_interval: match &self.retry_interval {
                Some(s) => optional_duration("retry_interval", s)?,
                None => defaults.retry_interval,
            },
            check_interval: required_duration("check_interval", &self.check_interval)?
                .unwrap_or(defaults.check_interval),
        })
    }
}

fn required_duration(
    field: &str,
    value: &Option<DurationSetting>,
) -> anyhow::Result<Option<Duration>> {
    match value {
        None => Ok(None),
        Some(DurationSetting::Seconds(secs)) => match u64::try_from(*secs) {
            Ok(secs) => Ok(Some(Duration::from_secs(secs))),
            Err(_) => bail!("invalid duration for {field}: {secs}"),
        },
        Some(DurationSetting::Text(s)) => match parse_duration(s) {
            Some(d) => Ok(Some(d)),
            None => bail!("invalid duration for {field}: {s:?}"),
        },
    }
}

/// Like [`required_duration`], but `"never"` or a negative number mean `None`.
fn optional_duration(field: &str, value: &DurationSetting) -> anyhow::Result<Option<Duration>> {
    match value {
        DurationSetting::Seconds(secs) => Ok(u64::try_from(*secs).ok().map(Duration::from_secs)),
        DurationSetting::Text(s) => {
            let trimmed = s.trim();
            if trimmed.eq_ignore_ascii_case("never") || trimmed.starts_with('-') {
                return Ok(None);
            }
            match parse_duration(trimmed) {
                Some(d) => Ok(Some(d)),
                None => bail!("invalid duration for {field}: {s:?}"),
            }
        }
    }
}

/// Parse `"500ms"`, `"30s"`, `"2m"`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
