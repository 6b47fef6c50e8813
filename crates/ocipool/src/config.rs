//! Manager configuration
//!
//! Environment variables form the base layer; an optional config file
//! (format inferred from its extension) overrides them key by key.

use crate::error::{PoolError, Result};
use crate::models::DEFAULT_REFRESH_INTERVAL;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const ENV_COMPARTMENT_ID: &str = "OCI_COMPARTMENT_ID";
pub const ENV_REGION: &str = "OCI_REGION";
pub const ENV_USE_INSTANCE_PRINCIPAL: &str = "OCI_USE_INSTANCE_PRINCIPAL";
pub const ENV_USE_NON_POOL_MEMBER_ANNOTATION: &str = "OCI_USE_NON_POOL_MEMBER_ANNOTATION";
pub const ENV_REFRESH_INTERVAL: &str = "OCI_REFRESH_INTERVAL";

/// Configuration of the instance pool manager
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Compartment scoping list operations; empty falls back to the tenancy
    pub compartment_id: String,
    pub region: String,
    pub use_instance_principals: bool,
    /// Persist the non-member sentinel on nodes outside every managed pool
    pub use_non_member_annotation: bool,
    pub refresh_interval: Duration,
    /// Poll period while waiting for a pool to settle
    pub state_poll_interval: Duration,
    /// Deadline for a pool to return to RUNNING after a resize
    pub state_wait_timeout: Duration,
    /// Delay between failed startup refreshes
    pub startup_retry_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            compartment_id: String::new(),
            region: String::new(),
            use_instance_principals: false,
            use_non_member_annotation: false,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            state_poll_interval: Duration::from_secs(15),
            state_wait_timeout: Duration::from_secs(5 * 60),
            startup_retry_interval: Duration::from_secs(10),
        }
    }
}

/// Keys as they appear in config sources, durations still unparsed
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    compartment_id: String,
    region: String,
    use_instance_principals: bool,
    use_non_member_annotation: bool,
    refresh_interval: Option<String>,
    state_poll_interval: Option<String>,
    state_wait_timeout: Option<String>,
    startup_retry_interval: Option<String>,
}

impl ManagerConfig {
    /// Load from the process environment and an optional file
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// Load using `env` to look up environment variables
    pub fn load_with_env<F>(path: Option<&Path>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = config::Config::builder();

        for (var, key) in [
            (ENV_COMPARTMENT_ID, "compartment_id"),
            (ENV_REGION, "region"),
            (ENV_REFRESH_INTERVAL, "refresh_interval"),
        ] {
            if let Some(value) = env(var).filter(|v| !v.is_empty()) {
                builder = builder.set_default(key, value)?;
            }
        }
        for (var, key) in [
            (ENV_USE_INSTANCE_PRINCIPAL, "use_instance_principals"),
            (ENV_USE_NON_POOL_MEMBER_ANNOTATION, "use_non_member_annotation"),
        ] {
            if let Some(value) = env(var) {
                builder = builder.set_default(key, value == "true")?;
            }
        }

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let raw: RawConfig = builder.build()?.try_deserialize()?;
        let defaults = Self::default();
        let duration_or = |value: Option<String>, default: Duration| match value {
            Some(text) => parse_duration(&text),
            None => Ok(default),
        };

        let config = Self {
            compartment_id: raw.compartment_id,
            region: raw.region,
            use_instance_principals: raw.use_instance_principals,
            use_non_member_annotation: raw.use_non_member_annotation,
            refresh_interval: duration_or(raw.refresh_interval, defaults.refresh_interval)?,
            state_poll_interval: duration_or(raw.state_poll_interval, defaults.state_poll_interval)?,
            state_wait_timeout: duration_or(raw.state_wait_timeout, defaults.state_wait_timeout)?,
            startup_retry_interval: duration_or(
                raw.startup_retry_interval,
                defaults.startup_retry_interval,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.use_instance_principals && self.region.is_empty() {
            return Err(PoolError::Config(format!(
                "region is required when using instance principals (set {ENV_REGION})"
            )));
        }
        if self.state_poll_interval.is_zero() {
            return Err(PoolError::Config(
                "state_poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Configured compartment, or `tenancy_id` when none is set
    pub fn compartment_or<'a>(&'a self, tenancy_id: &'a str) -> &'a str {
        if self.compartment_id.is_empty() {
            tenancy_id
        } else {
            &self.compartment_id
        }
    }
}

/// Parse a duration string such as `"5m"`, `"90s"`, `"1h30m"` or `"1.5h"`
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || PoolError::Config(format!("invalid duration {input:?}"));
    let text = input.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() {
        return Err(invalid());
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut rest = text;
    let mut nanos = 0f64;
    while !rest.is_empty() {
        let number_end = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        if number_end == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_end].parse().map_err(|_| invalid())?;
        rest = &rest[number_end..];

        let unit_end = rest.find(is_number).unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        nanos += value * scale;
        rest = &rest[unit_end..];
    }

    Ok(Duration::from_nanos(nanos.round() as u64))
}
