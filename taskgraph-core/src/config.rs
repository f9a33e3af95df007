//! Node configuration
//!
//! Defaults suit a local cluster; every field can be overridden from the
//! environment by the binaries.

use std::str::FromStr;
use std::time::Duration;

use crate::dataplane::DATA_RESPONSE_BUFFER;
use crate::error::{Result, TaskGraphError};
use crate::{DEFAULT_DATA_CHUNK_BUFFER, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_LIVENESS_TTL_MS};

/// Configuration for one node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Job this node joins
    pub job_name: String,
    /// Address peers use to reach our data plane. Defaults to the
    /// listener's local address.
    pub advertise_addr: Option<String>,
    /// Liveness marker refresh period
    pub heartbeat_interval: Duration,
    /// Lifetime of the liveness marker
    pub liveness_ttl: Duration,
    /// Capacity of the data response queue
    pub data_response_buffer: usize,
    /// Capacity of each served response's chunk channel
    pub data_chunk_buffer: usize,
    /// Attempts per outgoing data request
    pub data_request_retries: u32,
    /// Timeout of a single outgoing data request
    pub data_request_timeout: Duration,
    /// How long standby waits for a free slot; `None` waits forever
    pub standby_timeout: Option<Duration>,
    /// Recompute neighbors and re-establish meta watches on epoch change
    pub rewatch_on_epoch: bool,
    /// How long shutdown waits for in-flight data responses
    pub shutdown_grace: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            job_name: "default-job".into(),
            advertise_addr: None,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            liveness_ttl: Duration::from_millis(DEFAULT_LIVENESS_TTL_MS),
            data_response_buffer: DATA_RESPONSE_BUFFER,
            data_chunk_buffer: DEFAULT_DATA_CHUNK_BUFFER,
            data_request_retries: 3,
            data_request_timeout: Duration::from_secs(30),
            standby_timeout: None,
            rewatch_on_epoch: false,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl NodeConfig {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `JOB_NAME`, `ADVERTISE_ADDR`,
    /// `HEARTBEAT_INTERVAL_MS`, `LIVENESS_TTL_MS`, `STANDBY_TIMEOUT_SECS`
    /// and `REWATCH_ON_EPOCH`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(job) = std::env::var("JOB_NAME") {
            config.job_name = job;
        }
        if let Ok(addr) = std::env::var("ADVERTISE_ADDR") {
            config.advertise_addr = Some(addr);
        }
        if let Some(ms) = env_parse::<u64>("HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("LIVENESS_TTL_MS")? {
            config.liveness_ttl = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("STANDBY_TIMEOUT_SECS")? {
            config.standby_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(flag) = env_parse::<bool>("REWATCH_ON_EPOCH")? {
            config.rewatch_on_epoch = flag;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_name.is_empty() || self.job_name.contains('/') {
            return Err(invalid(format!("job name {:?} must be a non-empty path segment", self.job_name)));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat interval must be positive".into()));
        }
        if self.heartbeat_interval >= self.liveness_ttl {
            return Err(invalid(format!(
                "heartbeat interval {:?} must be shorter than liveness TTL {:?}",
                self.heartbeat_interval, self.liveness_ttl
            )));
        }
        if self.data_response_buffer == 0 || self.data_chunk_buffer == 0 {
            return Err(invalid("data plane buffers must hold at least one entry".into()));
        }
        Ok(())
    }
}

fn invalid(reason: String) -> TaskGraphError {
    TaskGraphError::InvalidConfig { reason }
}

/// Parse `name` from the environment, if set
pub fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| invalid(format!("{}={:?}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.data_response_buffer, 100);
        assert!(config.standby_timeout.is_none());
    }

    #[test]
    fn test_heartbeat_must_beat_ttl() {
        let config = NodeConfig {
            heartbeat_interval: Duration::from_secs(5),
            liveness_ttl: Duration::from_secs(5),
            ..NodeConfig::new("job")
        };
        assert!(matches!(
            config.validate(),
            Err(TaskGraphError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_job_name_is_one_segment() {
        assert!(NodeConfig::new("a/b").validate().is_err());
        assert!(NodeConfig::new("").validate().is_err());
        assert!(NodeConfig::new("wordcount").validate().is_ok());
    }
}
