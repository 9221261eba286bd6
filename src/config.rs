use async_snmp::v3::{AuthProtocol, PrivProtocol};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::counter::RolloverPolicy;
use crate::error::ConfigError;
use crate::models::{Credentials, Device, InterfaceTarget};
use crate::vendor::VendorSelection;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_max_concurrent_device_polls")]
    pub max_concurrent_device_polls: usize,
    /// Bound on one query exchange (a timed-out exchange gets one soft retry).
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// OIDs per batched GET; larger interface sets are split.
    #[serde(default = "default_max_oids_per_request")]
    pub max_oids_per_request: usize,
    /// Largest believable single-wrap delta for 32-bit counters. 0 disables the check.
    #[serde(default = "default_wrap_ceiling_32")]
    pub wrap_plausibility_ceiling_bytes: u64,
    /// Same for 64-bit counters; disabled (0) by default.
    #[serde(default)]
    pub wrap_plausibility_ceiling_bytes_64: u64,
    #[serde(default = "default_max_wraps_before_reset")]
    pub max_wraps_before_reset: u32,
    /// How often to log poller counters at INFO level.
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
}

fn default_polling_interval_ms() -> u64 {
    60_000
}

fn default_max_concurrent_device_polls() -> usize {
    16
}

fn default_query_timeout_ms() -> u64 {
    5_000
}

fn default_max_oids_per_request() -> usize {
    24
}

fn default_wrap_ceiling_32() -> u64 {
    crate::counter::reconciler::DEFAULT_CEILING_32
}

fn default_max_wraps_before_reset() -> u32 {
    crate::counter::reconciler::DEFAULT_MAX_WRAPS
}

fn default_stats_log_interval_secs() -> u64 {
    300
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: default_polling_interval_ms(),
            max_concurrent_device_polls: default_max_concurrent_device_polls(),
            query_timeout_ms: default_query_timeout_ms(),
            max_oids_per_request: default_max_oids_per_request(),
            wrap_plausibility_ceiling_bytes: default_wrap_ceiling_32(),
            wrap_plausibility_ceiling_bytes_64: 0,
            max_wraps_before_reset: default_max_wraps_before_reset(),
            stats_log_interval_secs: default_stats_log_interval_secs(),
        }
    }
}

impl PollerConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn rollover_policy(&self) -> RolloverPolicy {
        let nonzero = |v: u64| (v > 0).then_some(v);
        RolloverPolicy {
            ceiling_32: nonzero(self.wrap_plausibility_ceiling_bytes),
            ceiling_64: nonzero(self.wrap_plausibility_ceiling_bytes_64),
            max_wraps: self.max_wraps_before_reset,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// JSON Lines destination; "-" is stdout.
    #[serde(default = "default_output_path")]
    pub path: String,
    /// Samples buffered between the poller and the writer (backpressure beyond this).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_flush_rate")]
    pub flush_rate: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

fn default_output_path() -> String {
    "-".into()
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_flush_rate() -> usize {
    64
}

fn default_flush_interval_secs() -> u64 {
    5
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            channel_capacity: default_channel_capacity(),
            flush_rate: default_flush_rate(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Agent port for device hosts given without one.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    crate::transport::snmp::DEFAULT_PORT
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// Device record as written in the config file; `validate` turns it into a `Device`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub host: String,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default = "default_vendor")]
    pub vendor: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

fn default_vendor() -> String {
    "auto".into()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
    pub index: u32,
    /// Read from the device when empty.
    #[serde(default)]
    pub name: String,
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<Device, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidDevice {
            device: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.trim().is_empty() {
            return Err(invalid("id must be non-empty"));
        }
        if self.host.trim().is_empty() {
            return Err(invalid("host must be non-empty"));
        }
        match &self.credentials {
            Credentials::V1 { community } | Credentials::V2c { community }
                if community.is_empty() =>
            {
                return Err(invalid("community must be non-empty"));
            }
            Credentials::V3 {
                user,
                auth_protocol,
                auth_password,
                priv_protocol,
                priv_password,
            } => {
                if user.is_empty() {
                    return Err(invalid("v3 user must be non-empty"));
                }
                if priv_password.is_some() && auth_password.is_none() {
                    return Err(invalid("v3 privacy requires authentication"));
                }
                if auth_protocol.is_some() != auth_password.is_some() {
                    return Err(invalid("v3 auth needs both auth_protocol and auth_password"));
                }
                if priv_protocol.is_some() != priv_password.is_some() {
                    return Err(invalid("v3 privacy needs both priv_protocol and priv_password"));
                }
                if let Some(name) = auth_protocol
                    && name.parse::<AuthProtocol>().is_err()
                {
                    return Err(invalid(&format!("unknown v3 auth protocol '{}'", name)));
                }
                if let Some(name) = priv_protocol
                    && name.parse::<PrivProtocol>().is_err()
                {
                    return Err(invalid(&format!("unknown v3 privacy protocol '{}'", name)));
                }
            }
            _ => {}
        }

        let vendor =
            VendorSelection::parse(&self.vendor).ok_or_else(|| ConfigError::UnknownVendor {
                device: self.id.clone(),
                vendor: self.vendor.clone(),
            })?;

        let invalid_interface = |reason: String| ConfigError::InvalidInterface {
            device: self.id.clone(),
            reason,
        };
        if self.enabled && self.interfaces.is_empty() {
            return Err(invalid_interface("no interfaces selected".into()));
        }
        let mut seen = HashSet::new();
        let mut interfaces = Vec::with_capacity(self.interfaces.len());
        for iface in &self.interfaces {
            if iface.index == 0 {
                return Err(invalid_interface("interface index must be >= 1".into()));
            }
            if !seen.insert(iface.index) {
                return Err(invalid_interface(format!(
                    "interface index {} selected twice",
                    iface.index
                )));
            }
            interfaces.push(InterfaceTarget {
                device_id: self.id.clone(),
                index: iface.index,
                name: iface.name.trim().to_string(),
            });
        }

        Ok(Device {
            id: self.id.clone(),
            host: self.host.trim().to_string(),
            credentials: self.credentials.clone(),
            vendor,
            enabled: self.enabled,
            interfaces,
        })
    }
}

/// Outcome of validating the configured devices: each bad record is rejected on its own.
#[derive(Debug, Default)]
pub struct DeviceSet {
    pub devices: Vec<Device>,
    pub rejected: Vec<ConfigError>,
}

pub fn validate_devices(configs: &[DeviceConfig]) -> DeviceSet {
    let mut set = DeviceSet::default();
    let mut ids = HashSet::new();
    for cfg in configs {
        if !ids.insert(cfg.id.clone()) {
            set.rejected.push(ConfigError::DuplicateDevice(cfg.id.clone()));
            continue;
        }
        match cfg.validate() {
            Ok(device) => set.devices.push(device),
            Err(e) => set.rejected.push(e),
        }
    }
    set
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("reading {}: {}", path, e))?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validated devices; invalid records are reported, not fatal.
    pub fn device_set(&self) -> DeviceSet {
        validate_devices(&self.devices)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.poller.polling_interval_ms > 0,
            "poller.polling_interval_ms must be > 0, got {}",
            self.poller.polling_interval_ms
        );
        anyhow::ensure!(
            self.poller.max_concurrent_device_polls > 0,
            "poller.max_concurrent_device_polls must be > 0, got {}",
            self.poller.max_concurrent_device_polls
        );
        anyhow::ensure!(
            self.poller.query_timeout_ms > 0,
            "poller.query_timeout_ms must be > 0, got {}",
            self.poller.query_timeout_ms
        );
        anyhow::ensure!(
            self.poller.max_oids_per_request > 0,
            "poller.max_oids_per_request must be > 0, got {}",
            self.poller.max_oids_per_request
        );
        anyhow::ensure!(
            self.poller.max_wraps_before_reset > 0,
            "poller.max_wraps_before_reset must be > 0, got {}",
            self.poller.max_wraps_before_reset
        );
        anyhow::ensure!(
            self.poller.stats_log_interval_secs > 0,
            "poller.stats_log_interval_secs must be > 0, got {}",
            self.poller.stats_log_interval_secs
        );
        anyhow::ensure!(!self.output.path.is_empty(), "output.path must be non-empty");
        anyhow::ensure!(
            self.output.channel_capacity > 0,
            "output.channel_capacity must be > 0, got {}",
            self.output.channel_capacity
        );
        anyhow::ensure!(
            self.output.flush_rate > 0,
            "output.flush_rate must be > 0, got {}",
            self.output.flush_rate
        );
        anyhow::ensure!(
            self.output.flush_interval_secs > 0,
            "output.flush_interval_secs must be > 0, got {}",
            self.output.flush_interval_secs
        );
        anyhow::ensure!(self.transport.port > 0, "transport.port must be > 0");
        Ok(())
    }
}
